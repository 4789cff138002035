//! Error types for the provider.
//!
//! Two shapes of error live here. [`ProviderError`] is returned across call
//! boundaries (routing failures, and the step that failed inside a lifecycle
//! operation). [`ErrorInfo`] is the sticky, pollable record an instance,
//! template or client keeps once something has gone wrong.

use std::fmt::Write as _;
use std::path::PathBuf;

use local_cloud_core::{CoreError, InstanceId, TemplateId};
use serde::Serialize;
use thiserror::Error;

/// A result type using `ProviderError`.
pub type Result<T> = std::result::Result<T, ProviderError>;

/// Errors that can occur in provider operations.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// A filesystem operation failed.
    #[error("{context}: {source}")]
    Io {
        /// What was being done.
        context: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The template archive could not be read or extracted.
    #[error("archive error: {0}")]
    Archive(String),

    /// The worker entry point could not be started.
    #[error("failed to launch {}: {source}", program.display())]
    Launch {
        /// The executable that was invoked.
        program: PathBuf,
        /// The underlying spawn error.
        #[source]
        source: std::io::Error,
    },

    /// The template cannot provision because its source failed validation.
    #[error("template {template_id} is unavailable: {reason}")]
    TemplateUnavailable {
        /// The template that refused the request.
        template_id: TemplateId,
        /// The template's sticky error message.
        reason: String,
    },

    /// The client has already been disposed.
    #[error("provider has been disposed")]
    Disposed,

    /// Lookup or identifier error.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// A blocking task panicked or was cancelled.
    #[error("background task failed: {0}")]
    Task(String),
}

impl ProviderError {
    /// Wrap an I/O error with a description of the failed operation.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Shortcut for a missing template.
    #[must_use]
    pub fn template_not_found(template_id: &TemplateId) -> Self {
        Self::Core(CoreError::TemplateNotFound(template_id.clone()))
    }

    /// Shortcut for a missing instance.
    #[must_use]
    pub fn instance_not_found(template_id: &TemplateId, instance_id: &InstanceId) -> Self {
        Self::Core(CoreError::InstanceNotFound {
            template_id: template_id.clone(),
            instance_id: instance_id.clone(),
        })
    }

    /// Returns the appropriate HTTP status code for this error.
    #[must_use]
    pub const fn http_status_code(&self) -> u16 {
        match self {
            Self::Core(CoreError::TemplateNotFound(_) | CoreError::InstanceNotFound { .. }) => 404,
            Self::Core(CoreError::InvalidId(_)) => 400,
            Self::TemplateUnavailable { .. } | Self::Disposed => 409,
            Self::Io { .. } | Self::Archive(_) | Self::Launch { .. } | Self::Task(_) => 500,
        }
    }

    /// Returns true if this error might be resolved by retrying.
    ///
    /// The provider itself never retries; this is a hint for hosts.
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        matches!(self, Self::Io { .. } | Self::Task(_))
    }
}

/// A sticky error record, polled by hosts.
///
/// `message` is the human-readable summary; `details` is the full cause chain
/// of the error that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorInfo {
    /// Human-readable summary.
    pub message: String,
    /// The rendered cause chain, or the message again if there is none.
    pub details: String,
}

impl ErrorInfo {
    /// Create an error record without an underlying cause.
    pub fn new(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            details: message.clone(),
            message,
        }
    }

    /// Capture an error together with its whole `source()` chain.
    #[must_use]
    pub fn from_error(err: &(dyn std::error::Error + 'static)) -> Self {
        let message = err.to_string();
        let mut details = message.clone();
        let mut source = err.source();
        while let Some(cause) = source {
            let _ = write!(details, "\ncaused by: {cause}");
            source = cause.source();
        }
        Self { message, details }
    }
}

impl From<&ProviderError> for ErrorInfo {
    fn from(err: &ProviderError) -> Self {
        Self::from_error(err)
    }
}

impl std::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}
