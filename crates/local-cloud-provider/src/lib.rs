//! Local process provider with a cloud-like lifecycle.
//!
//! This crate turns on-disk worker templates into running worker processes.
//! Each provisioned worker gets its own staging directory, a rewritten
//! configuration file and a launched entry point. Its status is driven by the
//! orchestrator's registration callbacks.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  Orchestrator (HTTP / host)                 │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     LocalCloudClient                        │
//! │  ┌─────────────┐ ┌─────────────┐ ┌─────────────────────┐    │
//! │  │ Declaration │ │ Registration│ │    Housekeeping     │    │
//! │  │  parsing    │ │  routing    │ │  (deferred cleanup) │    │
//! │  └─────────────┘ └─────────────┘ └─────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//!               ┌────────────────────────────┐
//!               │ Template (pool, reuse)     │
//!               └────────────────────────────┘
//!                              │
//!                              ▼
//!               ┌────────────────────────────┐
//!               │ Instance (state machine)   │
//!               └────────────────────────────┘
//!                      │               │
//!                      ▼               ▼
//!               ┌────────────┐  ┌──────────────┐
//!               │  Staging   │  │ WorkerRunner │
//!               │ (copy/zip) │  │ (agent.sh)   │
//!               └────────────┘  └──────────────┘
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use local_cloud_provider::{
//!     CloudClient, LocalCloudClient, ProviderConfig, ProvisionRequest, ScriptRunner,
//! };
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = LocalCloudClient::from_declarations(
//!     "build1@/opt/agents/build1\n@@build1:reuse",
//!     ProviderConfig::from_env(),
//!     Arc::new(ScriptRunner::new()),
//! );
//!
//! let template_id = client.templates()[0].id().clone();
//! let request = ProvisionRequest::new("img-build1-1", "http://localhost:8111");
//! let instance = client.start_new_instance(&template_id, request).await?;
//! println!("Started {}", instance.name());
//!
//! client.dispose().await;
//! # Ok(())
//! # }
//! ```
//!
//! See the [`lifecycle`] module for the instance state machine.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod client;
pub mod config;
pub mod declaration;
pub mod error;
pub mod housekeeping;
pub mod instance;
pub mod lifecycle;
pub mod properties;
pub mod runner;
pub mod staging;
pub mod template;
pub mod types;

pub use client::{CloudClient, LocalCloudClient};
pub use config::ProviderConfig;
pub use declaration::TemplateDeclaration;
pub use error::{ErrorInfo, ProviderError, Result};
pub use instance::{Instance, InstanceKind};
pub use runner::{ScriptRunner, WorkerCommand, WorkerRunner};
pub use template::Template;
pub use types::{
    InstanceStatus, InstanceSummary, ProvisionRequest, RemovePolicy, TemplateSummary,
    WorkerRegistration,
};

#[cfg(any(test, feature = "test-utils"))]
pub use runner::mock::MockRunner;
