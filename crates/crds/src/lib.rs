//! Anthill CRD Definitions
//!
//! Kubernetes Custom Resource Definitions for the Anthill storage controller.

pub mod gluster_cluster;
pub mod heketi_config;
mod schema;

pub use gluster_cluster::*;
pub use heketi_config::*;
