pub mod client;
pub mod sse;
pub mod types;

pub use client::{BackendClient, ProgressStream, RebalanceBackend};
