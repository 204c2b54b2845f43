//! HTTP client factory with consistent timeouts for outbound calls
//! (Shopify Admin API, Resend).

use std::time::Duration;

use reqwest::Client;

use crate::infra::error::InfraError;

/// TCP handshake + TLS.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Total request/response time.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub fn build_client() -> Result<Client, InfraError> {
    Client::builder()
        .connect_timeout(DEFAULT_CONNECT_TIMEOUT)
        .timeout(DEFAULT_REQUEST_TIMEOUT)
        .build()
        .map_err(InfraError::HttpClient)
}
