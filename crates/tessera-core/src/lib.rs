//! Tessera Core - replica coordination for direct mode
//!
//! This crate decides which replicas a request talks to, how many answers are
//! enough and how conflicting answers are reconciled:
//! - Address selection over a resolved replica set with per-endpoint health
//! - Concurrent replica fan-out with session and LSN validation
//! - Quorum reads for Strong and BoundedStaleness consistency
//! - Global-strong write barriers
//! - Gone and session-mismatch retry orchestration
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │          ReplicatedResourceClient           │
//! │   (consistency resolution, retry policies)  │
//! └──────────────┬───────────────┬──────────────┘
//!                │               │
//! ┌──────────────┴─────┐ ┌───────┴──────────────┐
//! │ ConsistencyReader  │ │  ConsistencyWriter   │
//! │   └ QuorumReader   │ │  (write barrier)     │
//! └──────────────┬─────┘ └───────┬──────────────┘
//!                │               │
//! ┌──────────────┴───────────────┴──────────────┐
//! │                StoreReader                  │
//! │     (fan-out, validation, StoreResult)      │
//! └──────────────┬──────────────────────────────┘
//!                │
//! ┌──────────────┴──────────────────────────────┐
//! │   AddressSelector  ·  TransportClient       │
//! │  (resolver, enumerators, replica health)    │
//! └─────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod address;
pub mod barrier;
pub mod client;
pub mod config;
pub mod consistency_reader;
pub mod consistency_writer;
pub mod context;
pub mod error;
pub mod quorum_reader;
pub mod request;
pub mod retry;
pub mod session;
pub mod store_reader;
pub mod store_result;
pub mod testing;
pub mod timeout;
pub mod transport;

pub use client::ReplicatedResourceClient;
pub use config::DirectConfig;
pub use context::RequestContext;
pub use error::{Error, Result};
pub use request::{OperationType, Protocol, ReadMode, ResourceType, ServiceRequest};
pub use store_result::StoreResult;
pub use transport::{StoreResponse, TransportClient, TransportError, TransportErrorCode};

pub use tessera_protocol::{ConsistencyLevel, Headers, SessionToken, StatusCode, SubStatusCode};
