//! Barrier requests
//!
//! A barrier is a metadata-only request sent to replicas purely to observe
//! how far they have progressed. The target headers tell the replica which
//! LSN / global committed LSN the caller is waiting for.

use crate::error::{Error, Result};
use crate::request::{OperationType, ResourceType, ServiceRequest};
use tessera_protocol::headers;

/// True when the barrier for `request` is a Head on its collection
pub fn is_collection_head_barrier(request: &ServiceRequest) -> bool {
    match request.resource_type {
        ResourceType::Document
        | ResourceType::Attachment
        | ResourceType::Conflict
        | ResourceType::StoredProcedure
        | ResourceType::Trigger
        | ResourceType::UserDefinedFunction => true,
        ResourceType::Collection => !matches!(
            request.operation_type,
            OperationType::ReadFeed | OperationType::Query | OperationType::SqlQuery
        ),
        ResourceType::Database
        | ResourceType::PartitionKeyRange
        | ResourceType::User
        | ResourceType::Permission
        | ResourceType::Offer => false,
    }
}

/// Build the barrier for `request`
///
/// Name-based requests target their collection path. Id-based requests
/// target the collection when the resource lives in one and the database
/// feed otherwise. Target headers are only set when positive.
pub fn create_barrier_request(
    request: &ServiceRequest,
    target_lsn: i64,
    target_global_committed_lsn: i64,
) -> Result<ServiceRequest> {
    let collection_head = is_collection_head_barrier(request);

    let (operation_type, resource_type, address) = if request.is_name_based {
        match request.collection_path() {
            Some(path) => (OperationType::Head, ResourceType::Collection, path),
            None => {
                let path = request.database_path().ok_or_else(|| {
                    Error::internal(format!(
                        "Cannot derive a barrier target from {}",
                        request.resource_address
                    ))
                })?;
                (OperationType::HeadFeed, ResourceType::Database, path)
            }
        }
    } else if collection_head {
        let rid = match request.resource_type {
            ResourceType::Collection => Some(request.resource_address.clone()),
            _ => request.collection_rid(),
        }
        .ok_or_else(|| {
            Error::internal(format!(
                "No collection resource id known for barrier on {}",
                request.resource_address
            ))
        })?;
        (OperationType::Head, ResourceType::Collection, rid)
    } else {
        (
            OperationType::HeadFeed,
            ResourceType::Database,
            request.resource_address.clone(),
        )
    };

    let mut barrier = ServiceRequest::new(operation_type, resource_type, address);
    barrier.is_name_based = request.is_name_based;
    barrier.activity_id = request.activity_id;
    barrier.context = request.context.clone();

    barrier.headers.set(
        headers::X_DATE,
        chrono::Utc::now()
            .format("%a, %d %b %Y %H:%M:%S GMT")
            .to_string(),
    );
    if target_lsn > 0 {
        barrier
            .headers
            .set(headers::TARGET_LSN, target_lsn.to_string());
    }
    if target_global_committed_lsn > 0 {
        barrier.headers.set(
            headers::TARGET_GLOBAL_COMMITTED_LSN,
            target_global_committed_lsn.to_string(),
        );
    }

    for name in [
        headers::PARTITION_KEY,
        headers::COLLECTION_RID,
        headers::PARTITION_KEY_RANGE_ID,
    ] {
        if let Some(value) = request.headers.get(name) {
            barrier.headers.set(name, value);
        }
    }

    Ok(barrier)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_barrier_heads_the_collection() {
        let request = ServiceRequest::new(
            OperationType::Read,
            ResourceType::Document,
            "dbs/db/colls/orders/docs/7",
        )
        .with_header(headers::PARTITION_KEY, "[\"k\"]");

        let barrier = create_barrier_request(&request, 100, 0).unwrap();
        assert_eq!(barrier.operation_type, OperationType::Head);
        assert_eq!(barrier.resource_type, ResourceType::Collection);
        assert_eq!(barrier.resource_address, "dbs/db/colls/orders");
        assert_eq!(barrier.headers.get(headers::TARGET_LSN), Some("100"));
        assert!(!barrier.headers.contains(headers::TARGET_GLOBAL_COMMITTED_LSN));
        assert_eq!(barrier.headers.get(headers::PARTITION_KEY), Some("[\"k\"]"));
        assert_eq!(barrier.activity_id, request.activity_id);
        assert!(barrier.headers.get(headers::X_DATE).unwrap().ends_with(" GMT"));
    }

    #[test]
    fn test_feed_on_collection_uses_database_feed() {
        let request = ServiceRequest::new(OperationType::ReadFeed, ResourceType::Collection, "db-rid");
        assert!(!is_collection_head_barrier(&request));

        let barrier = create_barrier_request(&request, 0, 55).unwrap();
        assert_eq!(barrier.operation_type, OperationType::HeadFeed);
        assert_eq!(barrier.resource_type, ResourceType::Database);
        assert!(!barrier.headers.contains(headers::TARGET_LSN));
        assert_eq!(
            barrier.headers.get(headers::TARGET_GLOBAL_COMMITTED_LSN),
            Some("55")
        );
    }

    #[test]
    fn test_rid_based_document_uses_resolved_collection() {
        let mut request = ServiceRequest::new(OperationType::Read, ResourceType::Document, "doc-rid");
        assert!(create_barrier_request(&request, 1, 1).is_err());

        request.context.resolved_collection_rid = Some("coll-rid".into());
        let barrier = create_barrier_request(&request, 1, 1).unwrap();
        assert_eq!(barrier.resource_address, "coll-rid");
        assert_eq!(barrier.operation_type, OperationType::Head);
    }

    #[test]
    fn test_partition_key_range_is_never_collection_head() {
        let request = ServiceRequest::new(
            OperationType::Read,
            ResourceType::PartitionKeyRange,
            "pkr-rid",
        );
        assert!(!is_collection_head_barrier(&request));
    }

    #[test]
    fn test_context_is_cloned_not_reset() {
        let mut request = ServiceRequest::new(
            OperationType::Read,
            ResourceType::Document,
            "dbs/db/colls/c/docs/1",
        );
        request.context.force_refresh_address_cache = true;
        let barrier = create_barrier_request(&request, 5, 0).unwrap();
        assert!(barrier.context.force_refresh_address_cache);
        barrier.context.mark_endpoint_failed("rntbd://x/");
        assert!(request.context.failed_endpoints().contains("rntbd://x/"));
    }
}
