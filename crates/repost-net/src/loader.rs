//! reqwest-backed [`Fetcher`].

use std::time::Duration;

use async_trait::async_trait;
use http::{header, HeaderValue};
use reqwest::Client;
use tracing::{debug, info, trace};

use crate::{CacheMode, Fetcher, NetError, Request, Response};

/// Resource loader configuration.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// User agent string.
    pub user_agent: String,
    /// Accept-Language header.
    pub accept_language: String,
    /// Network-stack timeout applied to every request.
    pub default_timeout: Duration,
    /// Maximum redirects.
    pub max_redirects: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("repost-offline/{}", env!("CARGO_PKG_VERSION")),
            accept_language: "en-US,en;q=0.9".to_string(),
            default_timeout: Duration::from_secs(30),
            max_redirects: 10,
        }
    }
}

/// Network access over HTTP(S).
pub struct ResourceLoader {
    client: Client,
    config: LoaderConfig,
}

impl ResourceLoader {
    /// Create a new resource loader.
    pub fn new(config: LoaderConfig) -> Result<Self, NetError> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.default_timeout)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .build()
            .map_err(|e| NetError::RequestFailed(e.to_string()))?;

        info!(timeout = ?config.default_timeout, "ResourceLoader initialized");

        Ok(Self { client, config })
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }
}

#[async_trait]
impl Fetcher for ResourceLoader {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        debug!(url = %request.url, method = %request.method, "Fetching resource");

        let mut req_builder = self
            .client
            .request(request.method.clone(), request.url.clone())
            .headers(request.headers.clone())
            .header(header::ACCEPT_LANGUAGE, &self.config.accept_language);

        match request.cache {
            CacheMode::Default => {}
            CacheMode::Reload => {
                req_builder = req_builder
                    .header(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"))
                    .header(header::PRAGMA, HeaderValue::from_static("no-cache"));
            }
            CacheMode::NoStore => {
                req_builder =
                    req_builder.header(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
            }
        }

        if let Some(ref body) = request.body {
            req_builder = req_builder.body(body.clone());
        }

        let response = req_builder.send().await?;

        let status = response.status();
        let headers = response.headers().clone();
        let url = response.url().clone();
        let body = response.bytes().await?;

        trace!(
            url = %url,
            status = %status,
            body_len = body.len(),
            "Response received"
        );

        Ok(Response {
            url,
            status,
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::StatusCode;
    use url::Url;
    use wiremock::matchers::{header as header_is, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn loader() -> ResourceLoader {
        ResourceLoader::new(LoaderConfig::default()).unwrap()
    }

    #[test]
    fn test_loader_config_default() {
        let config = LoaderConfig::default();
        assert!(config.user_agent.starts_with("repost-offline/"));
        assert_eq!(config.max_redirects, 10);
    }

    #[tokio::test]
    async fn test_fetch_returns_buffered_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/dashboard"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/html")
                    .set_body_string("<h1>Dashboard</h1>"),
            )
            .mount(&server)
            .await;

        let url = Url::parse(&format!("{}/dashboard", server.uri())).unwrap();
        let response = loader().fetch(&Request::navigate(url)).await.unwrap();

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.header("content-type"), Some("text/html"));
        assert_eq!(response.text().unwrap(), "<h1>Dashboard</h1>");
    }

    #[tokio::test]
    async fn test_error_status_is_a_resolved_response() {
        let server = MockServer::start().await;
        Mock::given(path("/api/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let url = Url::parse(&format!("{}/api/missing", server.uri())).unwrap();
        let response = loader().fetch(&Request::get(url)).await.unwrap();

        assert_eq!(response.status, StatusCode::NOT_FOUND);
        assert!(!response.ok());
    }

    #[tokio::test]
    async fn test_reload_bypasses_http_caches() {
        let server = MockServer::start().await;
        Mock::given(path("/offline.html"))
            .and(header_is("cache-control", "no-cache"))
            .respond_with(ResponseTemplate::new(200).set_body_string("offline"))
            .expect(1)
            .mount(&server)
            .await;

        let url = Url::parse(&format!("{}/offline.html", server.uri())).unwrap();
        let request = Request::get(url).cache_mode(CacheMode::Reload);
        let response = loader().fetch(&request).await.unwrap();

        assert_eq!(response.status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_post_body_is_forwarded() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/functions/v1/ingest"))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let url = Url::parse(&format!("{}/functions/v1/ingest", server.uri())).unwrap();
        let request = Request::post(url, r#"{"id":1}"#).content_type("application/json");
        let response = loader().fetch(&request).await.unwrap();

        assert_eq!(response.status, StatusCode::CREATED);
    }

    #[tokio::test]
    async fn test_unreachable_host_is_an_error() {
        // Port 9 (discard) on localhost is not expected to accept connections.
        let url = Url::parse("http://127.0.0.1:9/").unwrap();
        let result = loader().fetch(&Request::get(url)).await;
        assert!(matches!(result, Err(NetError::HttpError(_))));
    }
}
