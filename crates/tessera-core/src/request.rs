//! Request model

use crate::context::RequestContext;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use tessera_protocol::{ConsistencyLevel, Headers, headers};
use uuid::Uuid;

/// Operation performed on a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationType {
    /// Create
    Create,
    /// Replace
    Replace,
    /// Upsert
    Upsert,
    /// Patch
    Patch,
    /// Delete
    Delete,
    /// Point read
    Read,
    /// Feed read
    ReadFeed,
    /// Query
    Query,
    /// SQL query
    SqlQuery,
    /// Metadata-only read
    Head,
    /// Metadata-only feed read
    HeadFeed,
    /// Transactional batch
    Batch,
    /// Stored procedure execution
    ExecuteJavaScript,
}

impl OperationType {
    /// True for operations that never mutate replica state
    pub fn is_read_only(self) -> bool {
        matches!(
            self,
            Self::Read | Self::ReadFeed | Self::Query | Self::SqlQuery | Self::Head | Self::HeadFeed
        )
    }

    /// True for operations over a feed rather than one resource
    pub fn is_feed(self) -> bool {
        matches!(
            self,
            Self::ReadFeed | Self::Query | Self::SqlQuery | Self::HeadFeed
        )
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Kind of resource addressed by a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceType {
    /// Database
    Database,
    /// Collection (container)
    Collection,
    /// Document (item)
    Document,
    /// Attachment
    Attachment,
    /// Conflict record
    Conflict,
    /// Stored procedure
    StoredProcedure,
    /// Trigger
    Trigger,
    /// User defined function
    UserDefinedFunction,
    /// Partition key range
    PartitionKeyRange,
    /// User
    User,
    /// Permission
    Permission,
    /// Offer
    Offer,
}

impl ResourceType {
    /// True for resources stored inside a collection
    pub fn is_collection_child(self) -> bool {
        matches!(
            self,
            Self::Document
                | Self::Attachment
                | Self::Conflict
                | Self::StoredProcedure
                | Self::Trigger
                | Self::UserDefinedFunction
        )
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Wire protocol of a replica endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Binary direct protocol
    #[default]
    Rntbd,
    /// HTTPS direct protocol
    Https,
}

impl Protocol {
    /// URI scheme served by the protocol
    pub fn scheme(self) -> &'static str {
        match self {
            Self::Rntbd => "rntbd",
            Self::Https => "https",
        }
    }
}

/// How many replicas a read consults and which ones
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReadMode {
    /// Primary replica only
    Primary,
    /// Any single replica
    Any,
    /// Read quorum, quorum-selected results accepted
    BoundedStaleness,
    /// Read quorum confirmed by a barrier
    Strong,
}

/// One logical operation against one resource
#[derive(Debug, Clone)]
pub struct ServiceRequest {
    /// Correlates client and service traces
    pub activity_id: Uuid,
    /// Operation
    pub operation_type: OperationType,
    /// Resource kind
    pub resource_type: ResourceType,
    /// Name path (`dbs/{db}/colls/{coll}/docs/{doc}`) or resource id
    pub resource_address: String,
    /// True when `resource_address` is a name path
    pub is_name_based: bool,
    /// Request headers
    pub headers: Headers,
    /// Request payload
    pub body: Option<Bytes>,
    /// Pin the request to a replica index instead of the primary
    pub default_replica_index: Option<u32>,
    /// Per-operation scratch state
    pub context: RequestContext,
}

impl ServiceRequest {
    /// Create a request addressed by name path or resource id
    pub fn new(
        operation_type: OperationType,
        resource_type: ResourceType,
        resource_address: impl Into<String>,
    ) -> Self {
        let resource_address = resource_address.into();
        let is_name_based = resource_address.trim_start_matches('/').starts_with("dbs/");
        Self {
            activity_id: Uuid::new_v4(),
            operation_type,
            resource_type,
            resource_address,
            is_name_based,
            headers: Headers::new(),
            body: None,
            default_replica_index: None,
            context: RequestContext::default(),
        }
    }

    /// Builder-style header insert
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.set(name, value);
        self
    }

    /// Builder-style payload
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Pin the request to a replica index
    pub fn with_default_replica_index(mut self, index: u32) -> Self {
        self.default_replica_index = Some(index);
        self
    }

    /// Request a consistency level through the header
    pub fn with_consistency_level(self, level: ConsistencyLevel) -> Self {
        self.with_header(headers::CONSISTENCY_LEVEL, level.as_str())
    }

    /// True for operations that never mutate replica state
    pub fn is_read_only(&self) -> bool {
        self.operation_type.is_read_only()
    }

    /// `dbs/{db}` prefix of a name-based address
    pub fn database_path(&self) -> Option<String> {
        let segments = self.name_segments()?;
        (segments.len() >= 2 && segments[0] == "dbs").then(|| segments[..2].join("/"))
    }

    /// `dbs/{db}/colls/{coll}` prefix of a name-based address
    pub fn collection_path(&self) -> Option<String> {
        let segments = self.name_segments()?;
        (segments.len() >= 4 && segments[0] == "dbs" && segments[2] == "colls")
            .then(|| segments[..4].join("/"))
    }

    /// Collection resource id, from resolution or from the request header
    pub fn collection_rid(&self) -> Option<String> {
        self.context
            .resolved_collection_rid
            .clone()
            .or_else(|| self.headers.get(headers::COLLECTION_RID).map(str::to_string))
    }

    fn name_segments(&self) -> Option<Vec<&str>> {
        self.is_name_based.then(|| {
            self.resource_address
                .trim_matches('/')
                .split('/')
                .filter(|s| !s.is_empty())
                .collect()
        })
    }
}
