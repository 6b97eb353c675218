pub mod client;
pub mod connection;
pub mod handler;
pub mod lifecycle;
pub mod registry;
pub mod router;
pub mod server;
pub mod session;
