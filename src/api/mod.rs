//! Server boundary: transport and wire formats.

pub mod api_types;
pub mod client;

pub use client::{ApiRequest, ApiResponse, HttpTransport, Method, Transport};
