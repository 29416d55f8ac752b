use crate::domain::model::FallbackRequest;
use crate::utils::error::BackendError;
use async_trait::async_trait;
use std::time::Duration;

/// An external vision-inference service able to answer a prompt about one image.
///
/// Implementations return the model's raw answer text; prompt construction,
/// retries and parsing belong to the fallback adapter.
#[async_trait]
pub trait VisionBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn generate(
        &self,
        request: &FallbackRequest,
        timeout: Duration,
    ) -> std::result::Result<String, BackendError>;
}
