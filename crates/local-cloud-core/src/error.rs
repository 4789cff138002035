//! Common error types for the local cloud provider.
//!
//! This module provides shared error types that are used across multiple crates.

use crate::ids::{InstanceId, TemplateId};
use thiserror::Error;

/// A result type using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core errors that can occur throughout the local cloud provider.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A template with the specified ID was not found.
    #[error("template not found: {0}")]
    TemplateNotFound(TemplateId),

    /// An instance with the specified ID was not found in its template.
    #[error("instance {instance_id} not found in template {template_id}")]
    InstanceNotFound {
        /// Template that was searched.
        template_id: TemplateId,
        /// Instance that was requested.
        instance_id: InstanceId,
    },

    /// An invalid identifier was provided.
    #[error("invalid identifier: {0}")]
    InvalidId(#[from] crate::ids::IdError),
}
