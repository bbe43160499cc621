//! Client for Ollama's `/api/generate` endpoint.

use std::time::Duration;

use keen_retry::{ExponentialJitter, ResolvedResult, RetryResult};
use tokio::{sync::Mutex, time};

use super::{GenerateRequest, GenerateResponse, LlmClient, LlmError};
use crate::{
    prelude::*,
    retry::{IsKnownTransient, retry_result_ok, try_potentially_transient},
};

/// Default wall-clock budget for one LLM call.
pub const DEFAULT_LLM_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP client for a local Ollama server.
///
/// Requests are serialized. Overload statuses get at most two quick
/// re-attempts, but a call that runs past its budget is not retried.
pub struct OllamaClient {
    http: reqwest::Client,
    url: String,
    timeout: Duration,
    lock: Mutex<()>,
}

impl OllamaClient {
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .context("cannot build HTTP client")?;
        Ok(Self {
            http,
            url: url.to_owned(),
            timeout,
            lock: Mutex::new(()),
        })
    }

    /// One attempt, classified for [`keen_retry`].
    #[instrument(level = "debug", skip_all, fields(model = %request.model))]
    async fn generate_once(
        &self,
        request: &GenerateRequest,
    ) -> RetryResult<(), (), String, anyhow::Error> {
        let call = async {
            let response = self
                .http
                .post(&self.url)
                .json(request)
                .send()
                .await?
                .error_for_status()?;
            response.json::<GenerateResponse>().await
        };
        let reply = try_potentially_transient!(
            match time::timeout(self.timeout, call).await {
                Ok(result) => result.map_err(LlmError::Native),
                Err(_) => Err(LlmError::Timeout(self.timeout)),
            }
        );
        retry_result_ok(reply.response)
    }
}

#[async_trait]
impl LlmClient for OllamaClient {
    async fn generate(&self, request: &GenerateRequest) -> Result<String> {
        let _guard = self.lock.lock().await;
        let jitter = ExponentialJitter::FromBackoffRange {
            backoff_range_millis: 250..=4_000,
            re_attempts: 2,
            jitter_ratio: 0.2,
        };
        let result = self
            .generate_once(request)
            .await
            .retry_with_async(|_| async { self.generate_once(request).await })
            .with_exponential_jitter(|| jitter)
            .await
            .inspect_recovered(|_, _, retry_errors_list| {
                warn!(
                    "LLM call succeeded after retrying {} times (failed attempts: [{}])",
                    retry_errors_list.len(),
                    keen_retry::loggable_retry_errors(retry_errors_list)
                )
            })
            .inspect_given_up(|_, retry_errors_list, fatal_error| {
                warn!(
                    "LLM call failed after {} retries with error {fatal_error:?}",
                    retry_errors_list.len(),
                )
            });
        match result {
            ResolvedResult::Ok { output, .. } | ResolvedResult::Recovered { output, .. } => {
                Ok(output)
            }
            ResolvedResult::Fatal { error, .. } => Err(error),
            ResolvedResult::GivenUp { fatal_error, .. }
            | ResolvedResult::Unrecoverable { fatal_error, .. } => Err(fatal_error),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use tokio::net::TcpListener;

    use super::*;
    use crate::llm::GenerateOptions;

    fn request() -> GenerateRequest {
        GenerateRequest {
            model: "m".to_owned(),
            prompt: "p".to_owned(),
            images: vec![],
            stream: false,
            format: None,
            options: GenerateOptions::default(),
        }
    }

    #[tokio::test]
    async fn unreachable_server_is_an_error() {
        // Nothing listens on port 9 (discard) on test machines.
        let client =
            OllamaClient::new("http://127.0.0.1:9/api/generate", Duration::from_secs(1))
                .unwrap();
        assert!(client.generate(&request()).await.is_err());
    }

    #[tokio::test]
    async fn silent_server_is_not_retried() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/api/generate", listener.local_addr().unwrap());
        tokio::spawn(async move {
            let mut held = vec![];
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let budget = Duration::from_millis(300);
        let client = OllamaClient::new(&url, budget).unwrap();
        let started = Instant::now();
        let err = client.generate(&request()).await.unwrap_err();
        let elapsed = started.elapsed();
        assert!(elapsed < budget * 2, "took {elapsed:?} for a {budget:?} budget");
        assert!(format!("{err:#}").contains("timed out"));
    }
}
