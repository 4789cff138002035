//! Core types and constants for the local cloud provider.
//!
//! This crate provides the foundational pieces shared by the provider and its
//! hosts:
//!
//! - **Identifiers**: Strongly-typed IDs for templates and instances
//! - **Correlation parameters**: The configuration keys a worker carries so
//!   that its registration can be traced back to the instance that started it
//! - **Error types**: Common error definitions shared across crates
//!
//! # Example
//!
//! ```
//! use local_cloud_core::{IdGenerator, InstanceId, TemplateId};
//!
//! let templates = IdGenerator::new();
//! let template_id: TemplateId = templates.next_id();
//! assert_eq!(template_id.as_str(), "1");
//!
//! let instance_id = InstanceId::parse("42").unwrap();
//! assert_eq!(instance_id.to_string(), "42");
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod ids;
pub mod params;

pub use error::{CoreError, Result};
pub use ids::{IdError, IdGenerator, InstanceId, TemplateId};
