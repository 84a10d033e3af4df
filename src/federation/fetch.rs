//! SSRF-protected outbound HTTP
//!
//! Every outbound federation call (delivery, discovery, polling) goes
//! through `SafeFetcher`, which rejects local/private destinations both
//! by hostname and by resolved IP before any request is made.
//!
//! The `SafeFetch` trait is the seam the delivery engine and poller
//! depend on, so tests can substitute counting or failing fetchers.

use futures::future::BoxFuture;
use std::net::IpAddr;
use std::time::Duration;

use crate::error::AppError;

fn is_disallowed_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_multicast()
                || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unique_local()
                || v6.is_unicast_link_local()
                || v6.is_multicast()
                || v6.is_unspecified()
        }
    }
}

fn is_disallowed_host(host: &str) -> bool {
    let normalized = host.trim_end_matches('.').to_ascii_lowercase();
    if normalized == "localhost" || normalized.ends_with(".localhost") {
        return true;
    }

    normalized
        .parse::<IpAddr>()
        .map(is_disallowed_ip)
        .unwrap_or(false)
}

async fn validate_resolved_host_ips(host: &str, port: u16) -> Result<(), AppError> {
    let normalized = host.trim_end_matches('.').to_ascii_lowercase();

    let mut resolved_any = false;
    let lookup = tokio::net::lookup_host((normalized.as_str(), port))
        .await
        .map_err(|e| AppError::Federation(format!("Failed to resolve host: {}", e)))?;

    for addr in lookup {
        resolved_any = true;
        if is_disallowed_ip(addr.ip()) {
            return Err(AppError::Forbidden);
        }
    }

    if !resolved_any {
        return Err(AppError::Federation("No DNS records for host".to_string()));
    }

    Ok(())
}

/// Validate an outbound URL before fetching.
///
/// Rejects non-HTTP(S) schemes and local/private hosts, then resolves
/// DNS and rejects destinations that look public but resolve
/// internally.
async fn validate_url(url: &str) -> Result<(), AppError> {
    let parsed =
        url::Url::parse(url).map_err(|e| AppError::Validation(format!("Invalid URL: {}", e)))?;

    match parsed.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(AppError::Validation(format!(
                "Unsupported URL scheme: {}",
                scheme
            )));
        }
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| AppError::Validation("Missing host in URL".to_string()))?
        .to_ascii_lowercase();

    if is_disallowed_host(&host) {
        return Err(AppError::Forbidden);
    }

    let port = parsed
        .port_or_known_default()
        .ok_or_else(|| AppError::Validation("Missing port in URL".to_string()))?;

    validate_resolved_host_ips(&host, port).await
}

/// Response from an outbound fetch
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl FetchResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Parse the body as JSON.
    pub fn json(&self) -> Result<serde_json::Value, AppError> {
        serde_json::from_slice(&self.body)
            .map_err(|e| AppError::Federation(format!("Invalid JSON response: {}", e)))
    }
}

/// Outbound HTTP contract the engine depends on.
///
/// Non-2xx statuses come back as `Ok(FetchResponse)`; only transport
/// failures (DNS, connect, timeout, SSRF rejection) are `Err`.
pub trait SafeFetch: Send + Sync {
    /// POST a body with the given headers.
    fn post<'a>(
        &'a self,
        url: &'a str,
        headers: &'a [(String, String)],
        body: Vec<u8>,
    ) -> BoxFuture<'a, Result<FetchResponse, AppError>>;

    /// GET a resource with an Accept header.
    fn get<'a>(
        &'a self,
        url: &'a str,
        accept: &'a str,
    ) -> BoxFuture<'a, Result<FetchResponse, AppError>>;
}

/// Production fetcher backed by reqwest.
#[derive(Clone)]
pub struct SafeFetcher {
    client: reqwest::Client,
}

impl SafeFetcher {
    /// Build the shared HTTP client.
    pub fn new(timeout: Duration) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .user_agent("Rallypoint/0.1.0")
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Internal(e.into()))?;
        Ok(Self { client })
    }
}

impl SafeFetch for SafeFetcher {
    fn post<'a>(
        &'a self,
        url: &'a str,
        headers: &'a [(String, String)],
        body: Vec<u8>,
    ) -> BoxFuture<'a, Result<FetchResponse, AppError>> {
        Box::pin(async move {
            validate_url(url).await?;

            let mut request = self.client.post(url);
            for (name, value) in headers {
                request = request.header(name, value);
            }

            let response = request.body(body).send().await?;
            let status = response.status().as_u16();
            let body = response.bytes().await?.to_vec();

            Ok(FetchResponse { status, body })
        })
    }

    fn get<'a>(
        &'a self,
        url: &'a str,
        accept: &'a str,
    ) -> BoxFuture<'a, Result<FetchResponse, AppError>> {
        Box::pin(async move {
            validate_url(url).await?;

            let response = self
                .client
                .get(url)
                .header("Accept", accept)
                .send()
                .await?;
            let status = response.status().as_u16();
            let body = response.bytes().await?.to_vec();

            Ok(FetchResponse { status, body })
        })
    }
}
