// SPDX-License-Identifier: MIT OR Apache-2.0
//! HTTP broker discovery.
//!
//! `GET <base>/v0.1/<broker-endpoint>` returns
//! `{"backendName": "...", "endpoint": "host:port"}`. Only `http` and
//! `https` schemes are honored.

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

/// Broker metadata returned by the discovery service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredBroker {
    /// Backend kind (e.g. `rabbitmq-mqtt`, `rabbitmq-amqp`).
    pub backend_name: String,
    /// Broker hostname or IP.
    pub host: String,
    /// Broker TCP port.
    pub port: u16,
}

/// Discovery lookup failed.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// The discovery URL does not use `http`/`https`.
    #[error("URL scheme is {scheme}, only http or https schemes are accepted")]
    SchemeNotAllowed {
        /// The refused scheme.
        scheme: String,
    },

    /// The discovery URL did not parse at all.
    #[error("invalid discovery URL '{url}'")]
    BadUrl {
        /// The unparseable URL.
        url: String,
    },

    /// The HTTP request failed or returned a non-success status.
    #[error("discovery request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The response body was not the expected shape.
    #[error("discovery response malformed: {0}")]
    BadResponse(String),
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DiscoveryBody {
    backend_name: String,
    endpoint: String,
}

/// Resolve a broker through the discovery service.
///
/// # Errors
///
/// [`DiscoveryError`] when the scheme is refused, the request fails, or
/// the body does not carry a `host:port` endpoint.
pub async fn discover_broker(
    base_url: &str,
    broker_endpoint: &str,
) -> Result<DiscoveredBroker, DiscoveryError> {
    let url = format!("{base_url}/v0.1/{broker_endpoint}");
    let parsed = reqwest::Url::parse(&url).map_err(|_| DiscoveryError::BadUrl { url: url.clone() })?;
    let scheme = parsed.scheme();
    if scheme != "http" && scheme != "https" {
        return Err(DiscoveryError::SchemeNotAllowed {
            scheme: scheme.to_string(),
        });
    }

    let body: DiscoveryBody = reqwest::get(parsed)
        .await?
        .error_for_status()?
        .json()
        .await?;

    let (host, port) = body
        .endpoint
        .split_once(':')
        .ok_or_else(|| DiscoveryError::BadResponse(format!("endpoint '{}' has no port", body.endpoint)))?;
    let port: u16 = port
        .parse()
        .map_err(|_| DiscoveryError::BadResponse(format!("endpoint port '{port}' is not numeric")))?;

    debug!(backend = %body.backend_name, host, port, "broker discovered");
    Ok(DiscoveredBroker {
        backend_name: body.backend_name,
        host: host.to_string(),
        port,
    })
}
