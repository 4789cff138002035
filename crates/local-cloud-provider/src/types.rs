//! Request, status and summary types for provider operations.
//!
//! These types define the contract between the provider and its host.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use local_cloud_core::{InstanceId, TemplateId};
use serde::{Deserialize, Serialize};

use crate::error::ErrorInfo;

/// Lifecycle states for an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum InstanceStatus {
    /// Created, staging directory allocated, not yet started.
    ScheduledToStart = 1,
    /// Worker files staged and process launched; waiting for registration.
    Starting = 2,
    /// Worker registered with the orchestrator.
    Running = 3,
    /// Worker is being stopped and launched again.
    Restarting = 4,
    /// Worker is being stopped for good.
    Stopping = 5,
    /// Worker unregistered or was stopped.
    Stopped = 6,
    /// A lifecycle step failed. Sticky.
    Error = 7,
}

impl InstanceStatus {
    /// Convert the status to its numeric representation.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Try to convert a numeric value to an `InstanceStatus`.
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::ScheduledToStart),
            2 => Some(Self::Starting),
            3 => Some(Self::Running),
            4 => Some(Self::Restarting),
            5 => Some(Self::Stopping),
            6 => Some(Self::Stopped),
            7 => Some(Self::Error),
            _ => None,
        }
    }
}

/// What the orchestrator should do with a worker's identity once it stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RemovePolicy {
    /// Keep the worker known but revoke its authorization.
    #[default]
    Unauthorize,
    /// Remove the worker entirely.
    RemoveAgent,
}

/// A request to provision one worker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvisionRequest {
    /// Display name the worker registers under.
    pub agent_name: String,
    /// Orchestrator address the worker connects to.
    pub server_address: String,
    /// Token the worker authenticates with.
    #[serde(default)]
    pub auth_token: String,
    /// Extra configuration written into the worker's configuration file.
    #[serde(default)]
    pub custom_parameters: BTreeMap<String, String>,
    /// Removal policy. Overwritten by the instance kind when started and
    /// reported back in [`InstanceSummary::remove_policy`].
    #[serde(default)]
    pub remove_policy: RemovePolicy,
}

impl ProvisionRequest {
    /// Create a request with the given name and server address.
    #[must_use]
    pub fn new(agent_name: impl Into<String>, server_address: impl Into<String>) -> Self {
        Self {
            agent_name: agent_name.into(),
            server_address: server_address.into(),
            ..Self::default()
        }
    }

    /// Set the authorization token.
    #[must_use]
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = token.into();
        self
    }

    /// Add or replace a custom configuration parameter.
    pub fn add_parameter(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.custom_parameters.insert(key.into(), value.into());
    }
}

/// A worker (un)registration reported by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRegistration {
    /// The configuration parameters the worker reported.
    pub parameters: HashMap<String, String>,
    /// True on registration, false on unregistration.
    pub registered: bool,
}

/// Point-in-time view of an instance.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceSummary {
    /// Instance identifier.
    pub instance_id: InstanceId,
    /// Owning template identifier.
    pub template_id: TemplateId,
    /// Name the worker registers under.
    pub name: String,
    /// Network identity of the worker.
    pub network_identity: String,
    /// Current status.
    pub status: InstanceStatus,
    /// Whether a stopped instance may be started again.
    pub restartable: bool,
    /// What the orchestrator should do with the worker once it stops.
    pub remove_policy: RemovePolicy,
    /// Staging directory.
    pub staging_dir: PathBuf,
    /// Construction time.
    pub started_at: DateTime<Utc>,
    /// Sticky error, if any.
    pub error: Option<ErrorInfo>,
}

/// Point-in-time view of a template and its pool.
#[derive(Debug, Clone, Serialize)]
pub struct TemplateSummary {
    /// Template identifier.
    pub template_id: TemplateId,
    /// Template name.
    pub name: String,
    /// Directory or archive the template provisions from.
    pub source_path: PathBuf,
    /// Whether stopped instances are reused.
    pub reusable: bool,
    /// Reserved policy flag.
    pub eternal_starting: bool,
    /// Agent pool the workers should join.
    pub agent_pool_id: Option<i32>,
    /// Properties merged into every request.
    pub extra_properties: BTreeMap<String, String>,
    /// Sticky validation error, if any.
    pub error: Option<ErrorInfo>,
    /// Pooled instances.
    pub instances: Vec<InstanceSummary>,
}
