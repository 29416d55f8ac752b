use crate::adapters::http::{build_backend, build_client};
use crate::config::FallbackConfig;
use crate::core::validator;
use crate::domain::model::{FaceCandidate, FallbackRequest};
use crate::domain::ports::VisionBackend;
use crate::utils::error::{BackendError, CubeError, Result};
use base64::Engine;
use regex::Regex;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

pub const FACE_INSTRUCTION: &str = r#"The image shows one face of a Rubik's cube: a 3x3 grid of colored tiles.
Report the color of every tile.

Allowed color codes (use exactly these letters):
  "R" red, "G" green, "B" blue, "O" orange, "Y" yellow, "W" white

Position keys, row by row from the top:
  "TL" top-left, "TC" top-center, "TR" top-right,
  "ML" middle-left, "C" center, "MR" middle-right,
  "BL" bottom-left, "BC" bottom-center, "BR" bottom-right

Answer with a single JSON object containing exactly these nine keys and nothing
else: no prose, no markdown. Example of the required shape:
{"TL":"W","TC":"W","TR":"O","ML":"G","C":"W","MR":"W","BL":"R","BC":"Y","BR":"B"}"#;

/// Longest slice of a bad reply kept on the error for diagnostics.
const REPLY_EXCERPT_CHARS: usize = 500;

/// Delegates a whole face to the vision model and turns its answer into a
/// schema-checked candidate.
///
/// Only transient transport failures are retried. A reply that arrives but
/// does not parse is final: asking again will not fix a contract problem.
pub struct FallbackAdapter {
    backend: Arc<dyn VisionBackend>,
    model: String,
    timeout: Duration,
    max_retries: u32,
    backoff: Duration,
}

impl FallbackAdapter {
    pub fn new(backend: Arc<dyn VisionBackend>, config: &FallbackConfig) -> Self {
        Self {
            backend,
            model: config.model.clone(),
            timeout: config.timeout(),
            max_retries: config.max_retries,
            backoff: config.backoff(),
        }
    }

    /// Builds the shared HTTP client and the configured backend.
    pub fn from_config(config: &FallbackConfig, max_concurrent: usize) -> Result<Self> {
        let client = build_client(max_concurrent)?;
        let backend = build_backend(config, client)?;
        Ok(Self::new(backend, config))
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn request_for(&self, image: &[u8]) -> FallbackRequest {
        FallbackRequest {
            model: self.model.clone(),
            prompt: FACE_INSTRUCTION.to_string(),
            image_base64: base64::engine::general_purpose::STANDARD.encode(image),
        }
    }

    /// Delay before retry number `attempt` (1-based): `backoff * 2^(attempt-1)`.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.backoff.saturating_mul(factor)
    }

    /// Classify `image` within `budget`, which caps every attempt and every
    /// backoff sleep so the whole call never outlives the caller's deadline.
    pub async fn classify(&self, image: &[u8], budget: Duration) -> Result<FaceCandidate> {
        let started = Instant::now();
        let request = self.request_for(image);
        let mut attempts = 0u32;
        let mut last_error = String::from("no attempt made");

        loop {
            let remaining = budget.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                return Err(CubeError::FallbackUnavailable {
                    attempts,
                    reason: format!("deadline exhausted, last error: {}", last_error),
                });
            }

            let per_attempt = self.timeout.min(remaining);
            attempts += 1;
            tracing::debug!(
                "Vision attempt {} via {} (timeout {:?})",
                attempts,
                self.backend.name(),
                per_attempt
            );

            let outcome =
                match tokio::time::timeout(per_attempt, self.backend.generate(&request, per_attempt))
                    .await
                {
                    Ok(outcome) => outcome,
                    Err(_) => Err(BackendError::Transient(format!(
                        "no reply within {:?}",
                        per_attempt
                    ))),
                };

            match outcome {
                Ok(reply) => return parse_reply(&reply),
                Err(BackendError::Malformed(reason)) => {
                    tracing::error!("Vision reply envelope malformed: {}", reason);
                    return Err(CubeError::FallbackParse {
                        reason,
                        reply: String::new(),
                    });
                }
                Err(e @ BackendError::Rejected { .. }) => {
                    tracing::error!("Vision backend rejected the request: {}", e);
                    return Err(CubeError::FallbackUnavailable {
                        attempts,
                        reason: e.to_string(),
                    });
                }
                Err(BackendError::Transient(reason)) => {
                    last_error = reason;
                    if attempts > self.max_retries {
                        return Err(CubeError::FallbackUnavailable {
                            attempts,
                            reason: last_error,
                        });
                    }

                    let delay = self
                        .backoff_for(attempts)
                        .min(budget.saturating_sub(started.elapsed()));
                    tracing::warn!(
                        "⚠️ Vision attempt {} failed ({}), retrying in {:?}",
                        attempts,
                        last_error,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

/// Turn the model's answer into a candidate that already satisfies the
/// `CubeFace` invariant. A ```` ```json ```` fence around the object is
/// tolerated; anything else that is not exactly the nine-key object fails.
pub fn parse_reply(reply: &str) -> Result<FaceCandidate> {
    let cleaned = fence_pattern()?.replace_all(reply.trim(), "");

    let candidate: FaceCandidate =
        serde_json::from_str(&cleaned).map_err(|e| CubeError::FallbackParse {
            reason: format!("reply is not an object of color codes: {}", e),
            reply: excerpt(reply),
        })?;

    if let Err(violation) = validator::validate(&candidate) {
        tracing::error!("Vision reply violates the face schema: {}", violation);
        return Err(CubeError::FallbackParse {
            reason: violation.to_string(),
            reply: excerpt(reply),
        });
    }

    Ok(candidate)
}

fn fence_pattern() -> Result<&'static Regex> {
    static FENCE: OnceLock<std::result::Result<Regex, regex::Error>> = OnceLock::new();
    FENCE
        .get_or_init(|| Regex::new(r"^```(?:json)?\s*|\s*```$"))
        .as_ref()
        .map_err(|e| CubeError::Internal {
            message: format!("fence pattern: {}", e),
        })
}

fn excerpt(reply: &str) -> String {
    reply.chars().take(REPLY_EXCERPT_CHARS).collect()
}
