use async_trait::async_trait;
use futures::StreamExt;
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use std::time::Duration;
use url::Url;

use super::{RemoteError, RemoteSource};
use crate::storage::{Category, Story};

const MAX_RESPONSE_SIZE: usize = 20 * 1024 * 1024; // 20MB

/// Tunables for [`RemoteClient`].
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Per-request timeout for collection queries
    pub request_timeout: Duration,
    /// Upper bound for the connectivity probe
    pub probe_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(20),
            probe_timeout: Duration::from_secs(5),
        }
    }
}

/// HTTP client for a PostgREST-style query surface (`/rest/v1/<table>`).
pub struct RemoteClient {
    http: reqwest::Client,
    base: Url,
    anon_key: Option<SecretString>,
    probe_timeout: Duration,
}

impl RemoteClient {
    /// Build a client for `base_url`.
    ///
    /// # Errors
    ///
    /// - [`RemoteError::InvalidBaseUrl`] if the URL does not parse
    /// - [`RemoteError::InsecureBaseUrl`] for plain HTTP to a non-loopback host
    /// - [`RemoteError::Network`] if the HTTP client cannot be built
    pub fn new(
        base_url: &str,
        anon_key: Option<SecretString>,
        options: ClientOptions,
    ) -> Result<Self, RemoteError> {
        let base = validate_base_url(base_url)?;
        let http = reqwest::Client::builder()
            .timeout(options.request_timeout)
            .user_agent(concat!("storyshelf/", env!("CARGO_PKG_VERSION")))
            .build()?;

        if anon_key.is_none() {
            tracing::warn!(base_url = %base, "No anon key configured, requests are unauthenticated");
        }

        Ok(Self {
            http,
            base,
            anon_key,
            probe_timeout: options.probe_timeout,
        })
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base.as_str().trim_end_matches('/'), table)
    }

    fn request(
        &self,
        table: &str,
        query: &[(&str, String)],
    ) -> Result<reqwest::RequestBuilder, RemoteError> {
        let mut url =
            Url::parse(&self.table_url(table)).map_err(|_| RemoteError::InvalidBaseUrl)?;
        url.query_pairs_mut()
            .extend_pairs(query.iter().map(|(k, v)| (*k, v.as_str())));

        let mut request = self.http.get(url).header("Accept", "application/json");
        if let Some(key) = &self.anon_key {
            request = request
                .header("apikey", key.expose_secret())
                .header("Authorization", format!("Bearer {}", key.expose_secret()));
        }
        Ok(request)
    }

    /// Run a read query and decode the JSON row array.
    async fn select<T: DeserializeOwned>(
        &self,
        table: &str,
        query: &[(&str, String)],
    ) -> Result<Vec<T>, RemoteError> {
        let response = self
            .request(table, query)?
            .send()
            .await
            .map_err(RemoteError::from_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            tracing::warn!(table, status = status.as_u16(), "Remote query rejected");
            return Err(RemoteError::HttpStatus(status.as_u16()));
        }

        let body = read_limited_bytes(response, MAX_RESPONSE_SIZE).await?;
        let rows: Vec<T> =
            serde_json::from_slice(&body).map_err(|e| RemoteError::Decode(e.to_string()))?;
        tracing::debug!(table, rows = rows.len(), "Remote query complete");
        Ok(rows)
    }
}

#[async_trait]
impl RemoteSource for RemoteClient {
    async fn fetch_categories(&self) -> Result<Vec<Category>, RemoteError> {
        self.select(
            "categories",
            &[("select", "*".into()), ("order", "name.asc".into())],
        )
        .await
    }

    async fn fetch_stories(&self) -> Result<Vec<Story>, RemoteError> {
        self.select(
            "stories",
            &[("select", "*".into()), ("order", "idx.asc".into())],
        )
        .await
    }

    async fn fetch_story_by_idx(&self, idx: i64) -> Result<Option<Story>, RemoteError> {
        let rows: Vec<Story> = self
            .select(
                "stories",
                &[
                    ("select", "*".into()),
                    ("idx", format!("eq.{idx}")),
                    ("limit", "1".into()),
                ],
            )
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn probe(&self) -> bool {
        let query: [(&str, String); 2] = [("select", "id".into()), ("limit", "1".into())];
        let request = match self.request("categories", &query) {
            Ok(request) => request.send(),
            Err(e) => {
                tracing::warn!(error = %e, "Cannot build probe request");
                return false;
            }
        };

        match tokio::time::timeout(self.probe_timeout, request).await {
            Ok(Ok(response)) if response.status().is_success() => {
                tracing::debug!("Remote reachable");
                true
            }
            Ok(Ok(response)) => {
                tracing::info!(status = response.status().as_u16(), "Remote probe rejected");
                false
            }
            Ok(Err(e)) => {
                tracing::info!(error = %e, "Remote probe failed");
                false
            }
            Err(_) => {
                tracing::info!(timeout_ms = self.probe_timeout.as_millis() as u64, "Remote probe timed out");
                false
            }
        }
    }
}

/// Require HTTPS so the anon key never travels in the clear.
/// Plain HTTP is accepted only for loopback hosts (local testing).
fn validate_base_url(raw: &str) -> Result<Url, RemoteError> {
    let url = Url::parse(raw.trim()).map_err(|_| RemoteError::InvalidBaseUrl)?;
    match url.scheme() {
        "https" => Ok(url),
        "http" => {
            let is_loopback = matches!(url.host_str(), Some("localhost" | "127.0.0.1" | "[::1]"));
            if is_loopback {
                tracing::warn!(base_url = %url, "Using non-HTTPS remote URL (localhost only)");
                Ok(url)
            } else {
                tracing::error!(base_url = %url, "Rejecting non-HTTPS remote URL");
                Err(RemoteError::InsecureBaseUrl)
            }
        }
        _ => Err(RemoteError::InvalidBaseUrl),
    }
}

async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, RemoteError> {
    // Fast path: check Content-Length header
    if let Some(len) = response.content_length() {
        if len as usize > limit {
            return Err(RemoteError::ResponseTooLarge(limit));
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(RemoteError::from_reqwest)?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(RemoteError::ResponseTooLarge(limit));
        }
        bytes.extend_from_slice(&chunk);
    }

    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> RemoteClient {
        RemoteClient::new(
            &server.uri(),
            Some(SecretString::from("anon-test-key")),
            ClientOptions {
                request_timeout: Duration::from_secs(5),
                probe_timeout: Duration::from_millis(500),
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_fetch_categories_sends_order_and_key() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/categories"))
            .and(query_param("order", "name.asc"))
            .and(header("apikey", "anon-test-key"))
            .and(header("Authorization", "Bearer anon-test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"[{"id":"a","name":"Animals","poster_url":null,"updated_at":"2024-01-01T00:00:00Z"},
                    {"id":"b","name":"Legends","poster_url":"https://cdn.example.com/b.png","updated_at":null}]"#,
            ))
            .expect(1)
            .mount(&server)
            .await;

        let categories = client_for(&server).fetch_categories().await.unwrap();
        assert_eq!(categories.len(), 2);
        assert_eq!(categories[0].name, "Animals");
        assert!(categories[1].updated_at.is_none());
    }

    #[tokio::test]
    async fn test_fetch_stories_orders_by_idx() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/stories"))
            .and(query_param("order", "idx.asc"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"[{"id":"s1","idx":1,"category_id":"a","title":"One","author":"A","content":"x"}]"#,
            ))
            .mount(&server)
            .await;

        let stories = client_for(&server).fetch_stories().await.unwrap();
        assert_eq!(stories.len(), 1);
        assert_eq!(stories[0].category_id.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_server_error_is_http_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let result = client_for(&server).fetch_categories().await;
        assert!(matches!(result, Err(RemoteError::HttpStatus(500))));
    }

    #[tokio::test]
    async fn test_garbage_body_is_decode_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>maintenance</html>"))
            .mount(&server)
            .await;

        let result = client_for(&server).fetch_stories().await;
        assert!(matches!(result, Err(RemoteError::Decode(_))));
    }

    #[tokio::test]
    async fn test_story_by_idx_missing_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/stories"))
            .and(query_param("idx", "eq.9999"))
            .respond_with(ResponseTemplate::new(200).set_body_string("[]"))
            .mount(&server)
            .await;

        let story = client_for(&server).fetch_story_by_idx(9999).await.unwrap();
        assert!(story.is_none());
    }

    #[tokio::test]
    async fn test_story_by_idx_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/stories"))
            .and(query_param("idx", "eq.0"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r##"[{"id":"about","idx":0,"title":"About","content":"# About us"}]"##,
            ))
            .mount(&server)
            .await;

        let story = client_for(&server).fetch_story_by_idx(0).await.unwrap();
        assert_eq!(story.map(|s| s.content).as_deref(), Some("# About us"));
    }

    #[tokio::test]
    async fn test_probe_true_when_reachable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/categories"))
            .and(query_param("limit", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_string("[]"))
            .mount(&server)
            .await;

        assert!(client_for(&server).probe().await);
    }

    #[tokio::test]
    async fn test_probe_false_on_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        assert!(!client_for(&server).probe().await);
    }

    #[tokio::test]
    async fn test_probe_false_on_slow_server() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("[]")
                    .set_delay(Duration::from_secs(3)),
            )
            .mount(&server)
            .await;

        assert!(!client_for(&server).probe().await);
    }

    #[tokio::test]
    async fn test_probe_false_when_unreachable() {
        let server = MockServer::start().await;
        let client = client_for(&server);
        drop(server);

        assert!(!client.probe().await);
    }

    #[test]
    fn test_insecure_base_url_rejected() {
        let result = RemoteClient::new("http://stories.example.com", None, ClientOptions::default());
        assert!(matches!(result, Err(RemoteError::InsecureBaseUrl)));
    }

    #[test]
    fn test_base_url_validation() {
        assert!(validate_base_url("https://project.example.co").is_ok());
        assert!(validate_base_url("http://localhost:54321").is_ok());
        assert!(validate_base_url("http://127.0.0.1:8080").is_ok());
        assert!(matches!(
            validate_base_url("not a url"),
            Err(RemoteError::InvalidBaseUrl)
        ));
        assert!(matches!(
            validate_base_url("ftp://example.com"),
            Err(RemoteError::InvalidBaseUrl)
        ));
    }

    #[test]
    fn test_table_url_handles_trailing_slash() {
        let client =
            RemoteClient::new("https://project.example.co/", None, ClientOptions::default())
                .unwrap();
        assert_eq!(
            client.table_url("stories"),
            "https://project.example.co/rest/v1/stories"
        );
    }
}
