use crate::domain::model::TilePosition;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Pipeline stage a failure is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Preprocess,
    Sample,
    Classify,
    Fallback,
    Validate,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Preprocess => "preprocess",
            Stage::Sample => "sample",
            Stage::Classify => "classify",
            Stage::Fallback => "fallback",
            Stage::Validate => "validate",
        };
        f.write_str(name)
    }
}

/// A broken `CubeFace` invariant.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Violation {
    #[error("missing position {0}")]
    MissingPosition(TilePosition),

    #[error("duplicate position {0}")]
    DuplicatePosition(TilePosition),

    #[error("unknown position key '{0}'")]
    UnknownPosition(String),

    #[error("unknown color '{value}' at position {position}")]
    UnknownColor { position: String, value: String },
}

#[derive(Error, Debug)]
pub enum CubeError {
    #[error("Image decode failed: {reason}")]
    ImageDecode { reason: String },

    #[error("Image payload of {bytes} bytes exceeds the {max_bytes} byte limit")]
    PayloadTooLarge { bytes: usize, max_bytes: usize },

    #[error("Image {width}x{height} is smaller than the {min}px minimum")]
    ImageTooSmall { width: u32, height: u32, min: u32 },

    #[error("Image {width}x{height} is larger than the {max}px maximum")]
    ImageTooLarge { width: u32, height: u32, max: u32 },

    #[error("Sampling failed at tile {tile}: {reason}")]
    Sampling { tile: TilePosition, reason: String },

    #[error("Cube face validation failed: {0}")]
    Validation(Violation),

    #[error("Vision fallback unavailable after {attempts} attempt(s): {reason}")]
    FallbackUnavailable { attempts: u32, reason: String },

    #[error("Vision fallback reply could not be parsed: {reason}")]
    FallbackParse { reason: String, reply: String },

    #[error("Request cancelled by caller during {stage}")]
    Cancelled { stage: Stage },

    #[error("Invalid configuration value for '{field}': {value} ({reason})")]
    InvalidConfigValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Missing required configuration: {field}")]
    MissingConfig { field: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Coarse grouping used by the boundary layer to pick a status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Input,
    Schema,
    Upstream,
    UpstreamContract,
    Cancelled,
    Configuration,
    Internal,
}

impl CubeError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            CubeError::ImageDecode { .. }
            | CubeError::PayloadTooLarge { .. }
            | CubeError::ImageTooSmall { .. }
            | CubeError::ImageTooLarge { .. }
            | CubeError::Sampling { .. } => ErrorCategory::Input,
            CubeError::Validation(_) => ErrorCategory::Schema,
            CubeError::FallbackUnavailable { .. } => ErrorCategory::Upstream,
            CubeError::FallbackParse { .. } => ErrorCategory::UpstreamContract,
            CubeError::Cancelled { .. } => ErrorCategory::Cancelled,
            CubeError::InvalidConfigValue { .. } | CubeError::MissingConfig { .. } => {
                ErrorCategory::Configuration
            }
            CubeError::Io(_) | CubeError::HttpClient(_) | CubeError::Internal { .. } => {
                ErrorCategory::Internal
            }
        }
    }

    /// HTTP status the boundary layer should answer with.
    pub fn http_status(&self) -> u16 {
        match self.category() {
            ErrorCategory::Input => 400,
            ErrorCategory::Schema => 422,
            ErrorCategory::Upstream => 503,
            ErrorCategory::Cancelled => 499,
            ErrorCategory::UpstreamContract
            | ErrorCategory::Configuration
            | ErrorCategory::Internal => 500,
        }
    }

    pub fn stage(&self) -> Option<Stage> {
        match self {
            CubeError::ImageDecode { .. }
            | CubeError::PayloadTooLarge { .. }
            | CubeError::ImageTooSmall { .. }
            | CubeError::ImageTooLarge { .. } => Some(Stage::Preprocess),
            CubeError::Sampling { .. } => Some(Stage::Sample),
            CubeError::Validation(_) => Some(Stage::Validate),
            CubeError::FallbackUnavailable { .. } | CubeError::FallbackParse { .. } => {
                Some(Stage::Fallback)
            }
            CubeError::Cancelled { stage } => Some(*stage),
            _ => None,
        }
    }

    pub fn user_friendly_message(&self) -> String {
        match self.category() {
            ErrorCategory::Input => format!("The image could not be used: {}", self),
            ErrorCategory::Schema => format!("The detected face is not a legal cube face: {}", self),
            ErrorCategory::Upstream => {
                "The vision model could not be reached, please try again later".to_string()
            }
            ErrorCategory::UpstreamContract => {
                "The vision model returned an answer that could not be understood".to_string()
            }
            ErrorCategory::Cancelled => "The request was cancelled".to_string(),
            ErrorCategory::Configuration => format!("Configuration problem: {}", self),
            ErrorCategory::Internal => format!("Unexpected error: {}", self),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, CubeError::Cancelled { .. })
    }
}

/// Failure of a single call to an inference backend.
///
/// Only `Transient` is retried by the fallback adapter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("transient transport failure: {0}")]
    Transient(String),

    #[error("request rejected with status {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("malformed reply envelope: {0}")]
    Malformed(String),
}

impl BackendError {
    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let message = body.chars().take(200).collect::<String>();
        if status.is_server_error()
            || status == reqwest::StatusCode::TOO_MANY_REQUESTS
            || status == reqwest::StatusCode::REQUEST_TIMEOUT
        {
            BackendError::Transient(format!("status {}: {}", status.as_u16(), message))
        } else {
            BackendError::Rejected {
                status: status.as_u16(),
                message,
            }
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, BackendError::Transient(_))
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            BackendError::Malformed(e.to_string())
        } else if e.is_builder() {
            BackendError::Rejected {
                status: 0,
                message: e.to_string(),
            }
        } else {
            // connect, timeout, and mid-body failures
            BackendError::Transient(e.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, CubeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_status_mapping() {
        let decode = CubeError::ImageDecode {
            reason: "bad".to_string(),
        };
        assert_eq!(decode.http_status(), 400);

        let sampling = CubeError::Sampling {
            tile: TilePosition::Center,
            reason: "empty".to_string(),
        };
        assert_eq!(sampling.http_status(), 400);
        assert_eq!(sampling.stage(), Some(Stage::Sample));

        let validation = CubeError::Validation(Violation::MissingPosition(TilePosition::TopLeft));
        assert_eq!(validation.http_status(), 422);

        let unavailable = CubeError::FallbackUnavailable {
            attempts: 3,
            reason: "timed out".to_string(),
        };
        assert_eq!(unavailable.http_status(), 503);

        let parse = CubeError::FallbackParse {
            reason: "not json".to_string(),
            reply: String::new(),
        };
        assert_eq!(parse.http_status(), 500);

        let cancelled = CubeError::Cancelled {
            stage: Stage::Fallback,
        };
        assert_eq!(cancelled.http_status(), 499);
        assert!(cancelled.is_cancelled());
    }

    #[test]
    fn test_backend_status_classification() {
        let e = BackendError::from_status(reqwest::StatusCode::SERVICE_UNAVAILABLE, "busy");
        assert!(e.is_transient());

        let e = BackendError::from_status(reqwest::StatusCode::TOO_MANY_REQUESTS, "");
        assert!(e.is_transient());

        let e = BackendError::from_status(reqwest::StatusCode::NOT_FOUND, "model not found");
        assert_eq!(
            e,
            BackendError::Rejected {
                status: 404,
                message: "model not found".to_string()
            }
        );
    }
}
