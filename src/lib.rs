pub mod conf;
pub mod data;
pub mod docs;
pub mod entitlement;
pub mod generation;
pub mod server;
pub mod tracing;
pub mod types;
pub mod upstream;
