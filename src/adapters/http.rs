use crate::config::{FallbackConfig, ServiceType};
use crate::domain::model::FallbackRequest;
use crate::domain::ports::VisionBackend;
use crate::utils::error::{BackendError, Result};
use crate::utils::validation::validate_required_field;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    images: [&'a str; 1],
    stream: bool,
    format: &'static str,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: Option<String>,
}

/// One pooled client per process; reqwest reuses connections across callers.
pub fn build_client(max_idle_per_host: usize) -> Result<Client> {
    let client = Client::builder()
        .connect_timeout(Duration::from_secs(5))
        .pool_max_idle_per_host(max_idle_per_host)
        .build()?;
    Ok(client)
}

/// Plain `/api/generate` backend (a local or sidecar Ollama server).
#[derive(Debug, Clone)]
pub struct OllamaBackend {
    client: Client,
    endpoint: String,
}

impl OllamaBackend {
    pub fn new(client: Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }

    fn generate_url(&self) -> String {
        format!("{}/api/generate", self.endpoint.trim_end_matches('/'))
    }

    async fn post(
        &self,
        request: &FallbackRequest,
        timeout: Duration,
        bearer: Option<&str>,
    ) -> std::result::Result<String, BackendError> {
        let body = GenerateRequest {
            model: &request.model,
            prompt: &request.prompt,
            images: [request.image_base64.as_str()],
            stream: false,
            format: "json",
        };

        let url = self.generate_url();
        tracing::debug!("Making vision request to: {}", url);

        let mut builder = self.client.post(&url).json(&body).timeout(timeout);
        if let Some(token) = bearer {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await?;
        let status = response.status();
        tracing::debug!("Vision response status: {}", status);

        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(BackendError::from_status(status, &text));
        }

        let text = response.text().await?;
        let envelope: GenerateResponse = serde_json::from_str(&text)
            .map_err(|e| BackendError::Malformed(format!("envelope is not JSON: {}", e)))?;

        match envelope.response {
            Some(answer) if !answer.trim().is_empty() => Ok(answer),
            _ => Err(BackendError::Malformed(
                "envelope has an empty 'response' field".to_string(),
            )),
        }
    }
}

#[async_trait]
impl VisionBackend for OllamaBackend {
    fn name(&self) -> &'static str {
        "ollama"
    }

    async fn generate(
        &self,
        request: &FallbackRequest,
        timeout: Duration,
    ) -> std::result::Result<String, BackendError> {
        self.post(request, timeout, None).await
    }
}

/// Same protocol behind an authenticated Cloud Run service.
#[derive(Debug, Clone)]
pub struct CloudRunBackend {
    inner: OllamaBackend,
    token: String,
}

impl CloudRunBackend {
    pub fn new(client: Client, endpoint: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            inner: OllamaBackend::new(client, endpoint),
            token: token.into(),
        }
    }
}

#[async_trait]
impl VisionBackend for CloudRunBackend {
    fn name(&self) -> &'static str {
        "cloudrun"
    }

    async fn generate(
        &self,
        request: &FallbackRequest,
        timeout: Duration,
    ) -> std::result::Result<String, BackendError> {
        self.inner.post(request, timeout, Some(&self.token)).await
    }
}

/// Pick the backend named by `service_type`.
pub fn build_backend(config: &FallbackConfig, client: Client) -> Result<Arc<dyn VisionBackend>> {
    let backend: Arc<dyn VisionBackend> = match config.service_type {
        ServiceType::Ollama => Arc::new(OllamaBackend::new(client, config.endpoint.clone())),
        ServiceType::Cloudrun => {
            let token = validate_required_field("fallback.auth_token", &config.auth_token)?;
            Arc::new(CloudRunBackend::new(
                client,
                config.endpoint.clone(),
                token.clone(),
            ))
        }
    };
    Ok(backend)
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    fn request() -> FallbackRequest {
        FallbackRequest {
            model: "test-model".to_string(),
            prompt: "describe".to_string(),
            image_base64: "aGVsbG8=".to_string(),
        }
    }

    #[tokio::test]
    async fn test_ollama_backend_reads_response_field() {
        let server = MockServer::start();
        let api_mock = server.mock(|when, then| {
            when.method(POST)
                .path("/api/generate")
                .body_contains("\"model\":\"test-model\"")
                .body_contains("\"images\":[\"aGVsbG8=\"]")
                .body_contains("\"stream\":false");
            then.status(200)
                .json_body(serde_json::json!({"model": "test-model", "response": "{}", "done": true}));
        });

        let backend = OllamaBackend::new(Client::new(), server.base_url());
        let answer = backend
            .generate(&request(), Duration::from_secs(5))
            .await
            .unwrap();

        api_mock.assert();
        assert_eq!(answer, "{}");
    }

    #[tokio::test]
    async fn test_cloudrun_backend_sends_bearer_token() {
        let server = MockServer::start();
        let api_mock = server.mock(|when, then| {
            when.method(POST)
                .path("/api/generate")
                .header("Authorization", "Bearer secret-token");
            then.status(200).json_body(serde_json::json!({"response": "ok"}));
        });

        let backend = CloudRunBackend::new(Client::new(), format!("{}/", server.base_url()), "secret-token");
        let answer = backend
            .generate(&request(), Duration::from_secs(5))
            .await
            .unwrap();

        api_mock.assert();
        assert_eq!(answer, "ok");
    }

    #[tokio::test]
    async fn test_error_statuses_are_classified() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/busy/api/generate");
            then.status(503).body("overloaded");
        });
        server.mock(|when, then| {
            when.method(POST).path("/missing/api/generate");
            then.status(404).body("model not found");
        });

        let busy = OllamaBackend::new(Client::new(), server.url("/busy"));
        let err = busy.generate(&request(), Duration::from_secs(5)).await.unwrap_err();
        assert!(err.is_transient());

        let missing = OllamaBackend::new(Client::new(), server.url("/missing"));
        let err = missing.generate(&request(), Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, BackendError::Rejected { status: 404, .. }));
    }

    #[tokio::test]
    async fn test_empty_or_invalid_envelope_is_malformed() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/empty/api/generate");
            then.status(200).json_body(serde_json::json!({"response": ""}));
        });
        server.mock(|when, then| {
            when.method(POST).path("/html/api/generate");
            then.status(200).body("<html>gateway</html>");
        });

        let empty = OllamaBackend::new(Client::new(), server.url("/empty"));
        let err = empty.generate(&request(), Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, BackendError::Malformed(_)));

        let html = OllamaBackend::new(Client::new(), server.url("/html"));
        let err = html.generate(&request(), Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, BackendError::Malformed(_)));
    }

    #[tokio::test]
    async fn test_connection_refused_is_transient() {
        // port 9 (discard) is essentially never listening on test hosts
        let backend = OllamaBackend::new(Client::new(), "http://127.0.0.1:9");
        let err = backend
            .generate(&request(), Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn test_build_backend_selects_by_service_type() {
        let mut config = FallbackConfig::default();
        let backend = build_backend(&config, Client::new()).unwrap();
        assert_eq!(backend.name(), "ollama");

        config.service_type = ServiceType::Cloudrun;
        assert!(build_backend(&config, Client::new()).is_err());

        config.auth_token = Some("token".to_string());
        let backend = build_backend(&config, Client::new()).unwrap();
        assert_eq!(backend.name(), "cloudrun");
    }
}
