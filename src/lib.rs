pub mod config;
pub mod context;
pub mod errors;
pub mod events;
pub mod grpc;
pub mod handlers;
pub mod metrics;
pub mod models;
pub mod nats;
pub mod nats_consumer;
pub mod services;
pub mod store;
pub mod sweeper;

pub use config::Config;
pub use context::RequestContext;
pub use errors::{InventoryError, Result};
pub use services::InventoryService;
