//! Local webhook receiver built on wiremock.

use std::time::Duration;

use wiremock::{
    matchers::{method, path},
    Mock, MockServer, Request, ResponseTemplate,
};

/// Path every receiver listens on.
pub const HOOK_PATH: &str = "/hook";

/// Scripted response for the receiver.
#[derive(Debug, Clone)]
pub enum MockResponse {
    /// Plain status with a short body.
    Status(u16),
    /// 429 with an optional `Retry-After` in seconds.
    RateLimited {
        /// Seconds sent in `Retry-After`
        retry_after: Option<u64>,
    },
    /// 200 sent after the delay, used to trigger client timeouts.
    Delayed(Duration),
}

impl MockResponse {
    fn template(&self) -> ResponseTemplate {
        match self {
            Self::Status(code) => ResponseTemplate::new(*code).set_body_string(format!("status {code}")),
            Self::RateLimited { retry_after } => {
                let template = ResponseTemplate::new(429).set_body_string("slow down");
                match retry_after {
                    Some(seconds) => template.insert_header("Retry-After", seconds.to_string().as_str()),
                    None => template,
                }
            },
            Self::Delayed(delay) => ResponseTemplate::new(200).set_delay(*delay),
        }
    }
}

/// HTTP endpoint standing in for a third-party webhook receiver.
pub struct MockReceiver {
    server: MockServer,
}

impl MockReceiver {
    /// Starts a receiver on a random local port.
    pub async fn start() -> Self {
        Self { server: MockServer::start().await }
    }

    /// Full URL of the hook path.
    pub fn url(&self) -> String {
        format!("{}{HOOK_PATH}", self.server.uri())
    }

    /// Answers every request with `response`.
    pub async fn always(&self, response: MockResponse) {
        Mock::given(method("POST"))
            .and(path(HOOK_PATH))
            .respond_with(response.template())
            .mount(&self.server)
            .await;
    }

    /// Answers the next `times` requests with `response`.
    ///
    /// Scripted responses are consumed in mount order; mount the fallback
    /// with [`Self::always`] afterwards.
    pub async fn times(&self, response: MockResponse, times: u64) {
        Mock::given(method("POST"))
            .and(path(HOOK_PATH))
            .respond_with(response.template())
            .up_to_n_times(times)
            .mount(&self.server)
            .await;
    }

    /// Requests received so far.
    pub async fn requests(&self) -> Vec<Request> {
        self.server.received_requests().await.unwrap_or_default()
    }

    /// Number of requests received so far.
    pub async fn request_count(&self) -> usize {
        self.requests().await.len()
    }

    /// Underlying server for custom expectations.
    pub fn server(&self) -> &MockServer {
        &self.server
    }
}
