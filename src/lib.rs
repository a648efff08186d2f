#![allow(unused_doc_comments)]
/**
 * This style of comments threw out warnings.
 * This allow statement fixes that
 */

/**
 * lib.rs
 */

pub mod cable;
pub mod endpoint;
pub mod error;
pub mod nat_discovery;

pub use cable::{decide_mode, new_driver, Driver, OperationMode};
pub use endpoint::Endpoint;
pub use nat_discovery::{NatDiscovery, NatDiscoveryConfig, NatEndpointInfo};
