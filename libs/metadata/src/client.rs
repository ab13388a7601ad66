//! HTTP client for the metadata service. Transport failures never escape:
//! every request retries forever with capped backoff, so callers only see
//! a body, a parse failure, or cancellation.
use std::time::Duration;

use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{Error, NetworkDescriptor};

/// Base URL of the instance metadata service
pub static BASE_URL: &str = "http://169.254.169.254/computeMetadata/v1/";

/// Required on every request
const FLAVOR_HEADER: (&str, &str) = ("Metadata-Flavor", "Google");

/// Timeout for plain (non-long-poll) GETs
const REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

/// How long the server may hang a long-poll request
const HANG_SEC: u64 = 60;

/// Backoff unit; attempt i sleeps `3 * min(i, 5)` seconds
const BACKOFF_STEP: Duration = Duration::from_secs(3);
const BACKOFF_CAP: u32 = 5;

/// Metadata service client
#[derive(Debug, Clone)]
pub struct Client {
    http: reqwest::Client,
    base: String,
}

impl Client {
    /// Client against [`BASE_URL`]
    pub fn new() -> Client {
        Client::with_base(BASE_URL)
    }

    /// Client against a caller-supplied base URL
    pub fn with_base(base: impl Into<String>) -> Client {
        let mut base = base.into();
        if !base.ends_with('/') {
            base.push('/');
        }
        Client {
            http: reqwest::Client::new(),
            base,
        }
    }

    /// GET a metadata key. Retries transport failures forever; the only
    /// early exit is cancellation. A non-2xx response is still a body and
    /// is returned as success.
    pub async fn get(
        &self,
        token: &CancellationToken,
        key: &str,
        recursive: bool,
    ) -> Result<Vec<u8>, Error> {
        let mut url = format!("{}{}", self.base, key);
        if recursive {
            url.push_str("/?recursive=true&alt=json");
        }
        self.fetch(token, &url, REQUEST_TIMEOUT).await
    }

    /// Long-poll the whole descriptor: returns on a metadata change or the
    /// server-side hang timeout, whichever comes first. Only a JSON parse
    /// failure surfaces as [`Error::Unavailable`].
    pub async fn watch(&self, token: &CancellationToken) -> Result<NetworkDescriptor, Error> {
        let url = format!(
            "{}?recursive=true&alt=json&wait_for_change=true&timeout_sec={HANG_SEC}",
            self.base
        );
        let body = self
            .fetch(token, &url, Duration::from_secs(HANG_SEC + 10))
            .await?;
        NetworkDescriptor::parse(&body)
    }

    async fn fetch(
        &self,
        token: &CancellationToken,
        url: &str,
        timeout: Duration,
    ) -> Result<Vec<u8>, Error> {
        let mut attempt: u32 = 0;
        loop {
            let req = self
                .http
                .get(url)
                .header(FLAVOR_HEADER.0, FLAVOR_HEADER.1)
                .timeout(timeout)
                .send();
            let res = tokio::select! {
                _ = token.cancelled() => return Err(Error::Cancelled),
                res = req => res,
            };
            match res {
                Ok(resp) => {
                    // deliberately no status-code check: a non-2xx body is
                    // still a body
                    match resp.bytes().await {
                        Ok(body) => return Ok(body.to_vec()),
                        Err(err) => warn!(%err, url, "failed reading metadata body"),
                    }
                }
                Err(err) => warn!(%err, url, "metadata request failed"),
            }
            attempt += 1;
            let backoff = BACKOFF_STEP * attempt.min(BACKOFF_CAP);
            debug!(attempt, ?backoff, "retrying metadata request");
            tokio::select! {
                _ = token.cancelled() => return Err(Error::Cancelled),
                _ = time::sleep(backoff) => {}
            }
        }
    }
}

impl Default for Client {
    fn default() -> Self {
        Client::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn sends_flavor_header_and_recursive_query() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/instance"))
            .and(header("Metadata-Flavor", "Google"))
            .and(query_param("recursive", "true"))
            .and(query_param("alt", "json"))
            .respond_with(ResponseTemplate::new(200).set_body_raw("{}", "application/json"))
            .expect(1)
            .mount(&server)
            .await;

        let client = Client::with_base(server.uri());
        let token = CancellationToken::new();
        let body = client.get(&token, "instance", true).await.unwrap();
        assert_eq!(body, b"{}");
    }

    #[tokio::test]
    async fn non_2xx_body_is_surfaced_as_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500).set_body_raw("oops", "text/plain"))
            .mount(&server)
            .await;

        let client = Client::with_base(server.uri());
        let token = CancellationToken::new();
        let body = client.get(&token, "instance", false).await.unwrap();
        assert_eq!(body, b"oops");
    }

    #[tokio::test]
    async fn watch_long_polls_and_parses() {
        let server = MockServer::start().await;
        let body = r#"{"instance": {"networkInterfaces": [{"mac": "00:11:22:33:44:55", "mtu": 1460}]}}"#;
        Mock::given(method("GET"))
            .and(query_param("wait_for_change", "true"))
            .and(query_param("timeout_sec", "60"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "application/json"))
            .mount(&server)
            .await;

        let client = Client::with_base(server.uri());
        let token = CancellationToken::new();
        let desc = client.watch(&token).await.unwrap();
        assert_eq!(desc.ethernet[0].mac, "00:11:22:33:44:55");
    }

    #[tokio::test]
    async fn watch_surfaces_parse_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_raw("garbage", "text/plain"))
            .mount(&server)
            .await;

        let client = Client::with_base(server.uri());
        let token = CancellationToken::new();
        assert!(matches!(
            client.watch(&token).await,
            Err(Error::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn cancellation_unblocks_retry_loop() {
        // nothing is listening here, so the client sits in its backoff loop
        let client = Client::with_base("http://127.0.0.1:9/".to_string());
        let token = CancellationToken::new();
        let cancel = token.clone();
        tokio::spawn(async move {
            time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });
        assert!(matches!(
            client.get(&token, "instance", false).await,
            Err(Error::Cancelled)
        ));
    }
}
