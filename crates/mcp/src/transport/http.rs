//! Streamable HTTP transport, driven by `rmcp`.
//!
//! Every JSON-RPC message is an independent POST answered with JSON or an event stream. `rmcp`
//! tracks the session id handed out on `initialize` and sends `DELETE` for it on close.

use std::time::Duration;

use reqwest::Client;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use rmcp::transport::StreamableHttpClientTransport;
use rmcp::transport::streamable_http_client::StreamableHttpClientTransportConfig;
use tracing::{debug, warn};
use url::Url;

use crate::config::ServerConfig;
use crate::transport::service::ServiceTransport;
use crate::types::ConnectError;

/// Builds the default HTTP headers from the server configuration.
pub(crate) fn build_headers(server: &ServerConfig) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (key, value) in &server.headers {
        match (HeaderName::try_from(key.as_str()), HeaderValue::try_from(value.as_str())) {
            (Ok(key), Ok(value)) => {
                headers.insert(key, value);
            }
            _ => warn!(server = %server.name, "skipping invalid header '{key}'"),
        }
    }
    headers
}

/// Parse the configured url of a remote server.
pub(crate) fn parse_url(server: &ServerConfig) -> Result<Url, ConnectError> {
    let raw = server
        .url
        .as_deref()
        .filter(|url| !url.trim().is_empty())
        .ok_or(ConnectError::MissingUrl {
            transport: server.transport,
        })?;
    Url::parse(raw).map_err(|source| ConnectError::InvalidUrl {
        url: raw.to_string(),
        source,
    })
}

/// Open a streamable HTTP session and complete the handshake within `timeout`.
pub(crate) async fn connect(config: &ServerConfig, timeout: Duration) -> Result<ServiceTransport, ConnectError> {
    let endpoint = parse_url(config)?;
    let client = Client::builder()
        .default_headers(build_headers(config))
        .build()
        .map_err(ConnectError::HttpClient)?;
    debug!(server = %config.name, "opening streamable HTTP session at {endpoint}");

    let transport =
        StreamableHttpClientTransport::with_client(client, StreamableHttpClientTransportConfig::with_uri(endpoint.as_str()));
    ServiceTransport::handshake(&config.name, transport, timeout).await
}
