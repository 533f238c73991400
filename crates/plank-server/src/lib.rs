pub mod broadcast;
pub mod client;
pub mod handlers;
pub mod rpc;
pub mod server;
pub mod wire;

pub use broadcast::SyncBroadcaster;
pub use client::{ClientId, ClientRegistry};
pub use server::{start, start_with_telemetry, ServerConfig, ServerHandle};
