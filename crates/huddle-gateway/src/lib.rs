pub mod auth;
pub mod blob;
pub mod connection;
pub mod dispatcher;
pub mod notify;
pub mod presence;
pub mod service;

pub use service::{ChatService, ServiceConfig};
