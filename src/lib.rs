// CRM Client - Library root

pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod http_client;
pub mod pipeline;

pub use client::CrmClient;
pub use error::{ApiError, RefreshFailure};
pub use http_client::{ApiRequest, ApiResponse};
pub use pipeline::RequestPipeline;
