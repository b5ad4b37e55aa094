//! Session consistency end to end: read-your-writes and mismatch retries

mod common;

use common::{REPLICAS, create_document, harness, read_document};
use std::time::Duration;
use tessera_core::config::SessionRetryOptions;
use tessera_core::testing::ResponseBuilder;
use tessera_core::{DirectConfig, OperationType, StatusCode, SubStatusCode};
use tessera_protocol::headers;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_read_carries_token_of_earlier_write() -> anyhow::Result<()> {
    let h = harness(DirectConfig::default(), &REPLICAS);
    for endpoint in REPLICAS {
        h.transport.on(endpoint, |request| {
            if request.operation_type == OperationType::Create {
                ResponseBuilder::created().lsn(12).session("0:12").reply()
            } else {
                ResponseBuilder::ok().lsn(12).session("0:12").reply()
            }
        });
    }

    h.client
        .invoke(create_document(), CancellationToken::new())
        .await?;
    let write_call = &h.transport.calls()[0];
    assert_eq!(write_call.operation_type, OperationType::Create);
    assert!(write_call.session_token.is_none());

    h.transport.clear_calls();
    let response = h
        .client
        .invoke(read_document(), CancellationToken::new())
        .await?;
    assert_eq!(response.session_token(), Some("0:12"));
    let reads = h.transport.calls();
    assert_eq!(reads.len(), 1);
    assert_eq!(reads[0].session_token.as_deref(), Some("0:12"));
    Ok(())
}

#[tokio::test]
async fn test_lagging_replicas_are_skipped() {
    let h = harness(DirectConfig::default(), &REPLICAS);
    for (index, endpoint) in REPLICAS.into_iter().enumerate() {
        h.transport.on(endpoint, move |_| {
            if index == 3 {
                ResponseBuilder::ok().lsn(20).session("0:20").reply()
            } else {
                ResponseBuilder::ok().lsn(15).session("0:15").reply()
            }
        });
    }

    let request = read_document().with_header(headers::SESSION_TOKEN, "0:20");
    let response = h.client.invoke(request, CancellationToken::new()).await.unwrap();
    assert_eq!(response.session_token(), Some("0:20"));
    assert!(h.transport.calls_to(REPLICAS[3]) >= 1);
}

#[tokio::test]
async fn test_caught_up_not_found_is_returned_without_retry() {
    let h = harness(DirectConfig::default(), &REPLICAS);
    for endpoint in REPLICAS {
        h.transport
            .on(endpoint, |_| ResponseBuilder::not_found().lsn(9).session("0:9").reply());
    }

    let request = read_document().with_header(headers::SESSION_TOKEN, "0:9");
    let err = h
        .client
        .invoke(request, CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
    assert_eq!(err.sub_status(), SubStatusCode::UNKNOWN);
    assert_eq!(h.transport.calls().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_mismatch_retries_stop_at_budget() {
    let config = DirectConfig::default().with_session_retry(SessionRetryOptions {
        budget: Duration::from_millis(200),
        ..Default::default()
    });
    let h = harness(config, &REPLICAS);
    for endpoint in REPLICAS {
        h.transport
            .on(endpoint, |_| ResponseBuilder::not_found().lsn(4).session("0:4").reply());
    }

    let started = Instant::now();
    let request = read_document().with_header(headers::SESSION_TOKEN, "0:9");
    let err = h
        .client
        .invoke(request, CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
    assert_eq!(err.sub_status(), SubStatusCode::READ_SESSION_NOT_AVAILABLE);
    assert!(started.elapsed() >= Duration::from_millis(200));
    assert!(started.elapsed() < Duration::from_secs(1));
    // every attempt asks each replica once
    assert!(h.transport.calls().len() > REPLICAS.len());
}
