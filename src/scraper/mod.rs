pub mod matcher;
pub mod qbittorrent;
pub mod rss;
pub mod tracker;

use reqwest::Client;
use std::time::Duration;

/// Builds an HTTP client for one remote endpoint.
/// Idle connections per host are limited to keep memory low on small boxes;
/// every request carries `timeout` as its overall deadline.
pub fn build_http_client(timeout: Duration) -> reqwest::Result<Client> {
    Client::builder()
        .pool_max_idle_per_host(2) // Limit idle connections for memory savings
        .timeout(timeout)
        .user_agent(concat!("rss_dispatch/", env!("CARGO_PKG_VERSION")))
        .build()
}

/// Serves `router` on an ephemeral local port and returns its base URL
#[cfg(test)]
pub(crate) async fn serve_for_test(router: axum::Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{}", addr)
}
