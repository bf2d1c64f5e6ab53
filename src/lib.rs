pub mod client;
pub mod config;
pub mod http;
pub mod models;

pub use client::{ApisdomClient, ValidationError};
pub use config::ClientConfig;
pub use http::{ApiError, ErrorKind, RequestSpec};
