//! Heketi REST API Client
//!
//! A Rust client for the heketi topology manager's admin API. It covers the
//! cluster, node and device operations the Anthill controller needs to keep
//! heketi's topology in step with the pods it deploys.
//!
//! # Example
//!
//! ```no_run
//! use topology_client::{ClusterCreateRequest, TopologyClient, TopologyClientTrait};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = TopologyClient::new(
//!     "http://mycluster-topology-manager.mycluster:8080".to_string(),
//!     "admin".to_string(),
//!     Some("My Secret".to_string()),
//! )?;
//!
//! let cluster = client
//!     .create_cluster(&ClusterCreateRequest { file: true, block: true })
//!     .await?;
//! println!("created cluster {}", cluster.id);
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! - **Request signing**: HS256 JWT per request, bound to method and path
//! - **Async operations**: 202 responses are followed through heketi's
//!   operation queue until the operation completes
//! - **Mocking**: `MockTopologyClient` behind the `test-util` feature

pub mod client;
pub mod common;
pub mod error;
pub mod models;
#[path = "trait.rs"]
pub mod topology_trait;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;

pub use client::TopologyClient;
pub use common::HttpClient;
pub use error::TopologyError;
pub use models::*;
pub use topology_trait::TopologyClientTrait;
#[cfg(any(test, feature = "test-util"))]
pub use mock::MockTopologyClient;
