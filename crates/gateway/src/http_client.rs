use std::{sync::OnceLock, time::Duration};

use reqwest::Client;

pub(crate) fn default_http_client_builder() -> reqwest::ClientBuilder {
    let mut headers = http::HeaderMap::new();
    headers.insert(http::header::CONNECTION, http::HeaderValue::from_static("keep-alive"));

    Client::builder()
        // Per-attempt budget for connect and first byte; streaming bodies
        // are read without a deadline.
        .connect_timeout(Duration::from_secs(10))
        .read_timeout(Duration::from_secs(60))
        // Short idle timeout so DNS changes on upstream load balancers are
        // picked up between requests.
        .pool_idle_timeout(Some(Duration::from_secs(5)))
        .tcp_nodelay(true)
        .tcp_keepalive(Some(Duration::from_secs(60)))
        .default_headers(headers)
}

/// Common HTTP client, shared to reuse upstream connections.
pub(crate) fn http_client() -> reqwest::Client {
    static CLIENT: OnceLock<Client> = OnceLock::new();

    CLIENT
        .get_or_init(|| {
            default_http_client_builder()
                .build()
                .unwrap_or_else(|_| Client::new())
        })
        .clone()
}
