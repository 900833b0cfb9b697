pub mod api;
pub mod backend;
pub mod bootstrap;
pub mod core;
pub mod rebalance;
pub mod store;
