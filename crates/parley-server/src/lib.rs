//! Parley delivery server: socket sessions with catch-up, live fan-out and
//! the REST surface, over the storage seams in `parley-core`.

pub mod api;
pub mod config;
pub mod dispatcher;
pub mod heartbeat;
pub mod registry;
pub mod server;
pub mod service;
pub mod shutdown;
pub mod websocket;

pub use config::ServerConfig;
pub use server::{ParleyServer, ServerHandle};
pub use service::{ChatService, Stores};
