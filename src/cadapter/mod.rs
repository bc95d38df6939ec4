//! Object-store adapters (cAdapter).
//!
//! Submodules:
//! - `client`: the `ObjectStore` trait and normalized listing shapes
//! - `s3`: aws-sdk-s3 backed implementation
//! - `memory`: in-memory implementation with call counters (tests/demos)

pub mod client;
pub mod memory;
pub mod s3;
