//! Error taxonomy shared by the pipeline components.
//!
//! Per-record failures (`Extraction`, `Validation`, `Update`) are tallied into
//! run summaries and never abort a run. `Store`, `Auth` and `Config` are
//! per-run and propagate to the caller immediately.

use thiserror::Error;

/// Classification of a failed remote call.
#[derive(Debug, Clone, Error)]
pub enum ApiError {
    /// Timeouts, connection resets, 5xx and 429 responses. Safe to retry.
    #[error("transient failure{}: {message}", status_suffix(.status))]
    Transient { status: Option<u16>, message: String },

    /// The remote rejected the request (4xx other than auth/404/429).
    #[error("request rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("credentials rejected with status {status}")]
    Unauthorized { status: u16 },

    #[error("resource not found")]
    NotFound,

    #[error("could not decode response: {0}")]
    Decode(String),
}

impl ApiError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ApiError::Transient { .. })
    }

    /// Map an HTTP status to the matching error class.
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        match status {
            401 | 403 => ApiError::Unauthorized { status },
            404 => ApiError::NotFound,
            408 | 429 | 500..=599 => ApiError::Transient {
                status: Some(status),
                message: body.into(),
            },
            _ => ApiError::Rejected {
                status,
                body: body.into(),
            },
        }
    }
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" (status {s})")).unwrap_or_default()
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return ApiError::from_status(status.as_u16(), err.to_string());
        }
        if err.is_decode() {
            return ApiError::Decode(err.to_string());
        }
        ApiError::Transient {
            status: None,
            message: err.to_string(),
        }
    }
}

/// Why an incoming record was refused at ingestion.
#[derive(Debug, Clone, Error)]
pub enum IngestError {
    #[error("record is not a JSON object")]
    NotAnObject,
    #[error("record is missing required field `{0}`")]
    MissingField(&'static str),
    #[error("record is malformed: {0}")]
    Malformed(String),
}

#[derive(Debug, Error)]
pub enum SyncError {
    /// Paging failed after retries; scoped to one chunk and resumable with the same filter.
    #[error("extraction of {scope} failed: {source}")]
    Extraction {
        scope: String,
        #[source]
        source: ApiError,
    },

    /// Classifier output fell outside the taxonomy after the corrective retry.
    #[error("classification of {conversation_id} failed validation: {detail}")]
    Validation {
        conversation_id: String,
        detail: String,
    },

    #[error("update of {conversation_id} failed: {source}")]
    Update {
        conversation_id: String,
        #[source]
        source: ApiError,
    },

    #[error("local store failure: {0:#}")]
    Store(anyhow::Error),

    #[error("authentication rejected by {service}")]
    Auth { service: &'static str },

    /// A collaborator the command needs was not configured.
    #[error("configuration error: {0}")]
    Config(String),
}

impl SyncError {
    /// Whether the error must abort the whole run.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::Store(_) | SyncError::Auth { .. } | SyncError::Config(_)
        )
    }
}

pub type SyncResult<T> = std::result::Result<T, SyncError>;
