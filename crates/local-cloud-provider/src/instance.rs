//! A single provisioned worker.
//!
//! An [`Instance`] owns one staging directory and tracks the worker running
//! out of it through the status machine in [`lifecycle`](crate::lifecycle).
//! Lifecycle steps never return errors to the caller: a failure is recorded
//! as the instance's sticky [`ErrorInfo`] and the status moves to `Error`,
//! after which the instance is inert.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use local_cloud_core::{params, InstanceId, TemplateId};
use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::ProviderConfig;
use crate::error::{ErrorInfo, ProviderError, Result};
use crate::lifecycle;
use crate::runner::WorkerRunner;
use crate::staging;
use crate::template::Template;
use crate::types::{InstanceStatus, InstanceSummary, ProvisionRequest, RemovePolicy};

/// Allocation policy of an instance, fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceKind {
    /// Stays pooled once stopped and is handed out again.
    Reusable,
    /// Torn down and forgotten once stopped.
    OneShot,
}

impl InstanceKind {
    /// Kind used by templates with the given reuse flag.
    #[must_use]
    pub const fn for_template(reusable: bool) -> Self {
        if reusable {
            Self::Reusable
        } else {
            Self::OneShot
        }
    }

    /// Returns true if a stopped instance of this kind may be started again.
    #[must_use]
    pub const fn is_restartable(self) -> bool {
        matches!(self, Self::Reusable)
    }

    /// What the orchestrator should do with the worker once it stops.
    #[must_use]
    pub const fn remove_policy(self) -> RemovePolicy {
        match self {
            Self::Reusable => RemovePolicy::Unauthorize,
            Self::OneShot => RemovePolicy::RemoveAgent,
        }
    }
}

/// One worker's lifecycle state and staging directory.
pub struct Instance {
    id: InstanceId,
    template_id: TemplateId,
    template_name: String,
    source_path: PathBuf,
    kind: InstanceKind,
    template: Weak<Template>,
    runner: Arc<dyn WorkerRunner>,
    config: Arc<ProviderConfig>,
    staging_dir: PathBuf,
    started_at: DateTime<Utc>,
    status: watch::Sender<InstanceStatus>,
    error: RwLock<Option<ErrorInfo>>,
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("id", &self.id)
            .field("template_id", &self.template_id)
            .field("kind", &self.kind)
            .field("status", &self.status())
            .field("staging_dir", &self.staging_dir)
            .finish_non_exhaustive()
    }
}

impl Instance {
    /// Create an instance of `template` and allocate its staging directory.
    ///
    /// A staging directory that cannot be created leaves the instance in
    /// `Error`.
    pub(crate) fn new(id: InstanceId, template: &Arc<Template>, kind: InstanceKind) -> Self {
        let config = template.config();
        let staging_dir = config
            .staging_root
            .join(format!("worker-{}", uuid::Uuid::new_v4()));
        let (status, _) = watch::channel(InstanceStatus::ScheduledToStart);

        let instance = Self {
            id,
            template_id: template.id().clone(),
            template_name: template.name().to_string(),
            source_path: template.source_path().to_path_buf(),
            kind,
            template: Arc::downgrade(template),
            runner: template.runner(),
            config,
            staging_dir,
            started_at: Utc::now(),
            status,
            error: RwLock::new(None),
        };

        if let Err(e) = std::fs::create_dir_all(&instance.staging_dir) {
            instance.fail(&ProviderError::io(
                format!("create {}", instance.staging_dir.display()),
                e,
            ));
        }

        instance
    }

    /// Get the instance ID.
    #[must_use]
    pub const fn id(&self) -> &InstanceId {
        &self.id
    }

    /// Get the owning template's ID.
    #[must_use]
    pub const fn template_id(&self) -> &TemplateId {
        &self.template_id
    }

    /// Get the allocation policy.
    #[must_use]
    pub const fn kind(&self) -> InstanceKind {
        self.kind
    }

    /// Returns true if a stopped instance may be started again.
    #[must_use]
    pub const fn is_restartable(&self) -> bool {
        self.kind.is_restartable()
    }

    /// Get the current status.
    #[must_use]
    pub fn status(&self) -> InstanceStatus {
        *self.status.borrow()
    }

    /// Subscribe to status changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<InstanceStatus> {
        self.status.subscribe()
    }

    /// Get the sticky error, if any step has failed.
    #[must_use]
    pub fn error_info(&self) -> Option<ErrorInfo> {
        self.error.read().clone()
    }

    /// When the instance was created.
    #[must_use]
    pub const fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// The instance's staging directory.
    #[must_use]
    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    /// Name the worker registers under: `img-<template name>-<instance id>`.
    #[must_use]
    pub fn display_name(&self) -> String {
        agent_name(&self.template_name, &self.id)
    }

    /// Display name followed by the staging directory.
    #[must_use]
    pub fn name(&self) -> String {
        format!("{} ({})", self.display_name(), self.staging_dir.display())
    }

    /// Network identity: `cloud.local.<template id>.<instance id>`.
    #[must_use]
    pub fn network_identity(&self) -> String {
        format!("cloud.local.{}.{}", self.template_id, self.id)
    }

    /// Returns true if the reported worker parameters correlate to this instance.
    #[must_use]
    pub fn contains_worker(&self, parameters: &HashMap<String, String>) -> bool {
        params::correlation(parameters)
            .is_some_and(|(template_id, instance_id)| {
                template_id == self.template_id && instance_id == self.id
            })
    }

    /// Point-in-time view of the instance.
    #[must_use]
    pub fn summary(&self) -> InstanceSummary {
        InstanceSummary {
            instance_id: self.id.clone(),
            template_id: self.template_id.clone(),
            name: self.display_name(),
            network_identity: self.network_identity(),
            status: self.status(),
            restartable: self.is_restartable(),
            remove_policy: self.kind.remove_policy(),
            staging_dir: self.staging_dir.clone(),
            started_at: self.started_at,
            error: self.error_info(),
        }
    }

    /// Stage, configure and launch the worker.
    ///
    /// Moves to `Starting`; the worker reaching `Running` is reported through
    /// [`report_registered`](Self::report_registered). Does nothing on an
    /// errored instance or one that is already active.
    pub async fn start(&self, request: ProvisionRequest) {
        if !self.claim() {
            debug!(
                template_id = %self.template_id,
                instance_id = %self.id,
                status = ?self.status(),
                "Instance cannot be started"
            );
            return;
        }
        self.provision(request).await;
    }

    /// Move a fresh or stopped instance to `Starting`.
    ///
    /// Returns false if the instance cannot be started from its status.
    pub(crate) fn claim(&self) -> bool {
        self.set_status(InstanceStatus::Starting)
    }

    /// Run the start sequence on an instance that has been claimed.
    pub(crate) async fn provision(&self, mut request: ProvisionRequest) {
        if self.is_errored() {
            return;
        }
        request.remove_policy = self.kind.remove_policy();

        info!(
            template_id = %self.template_id,
            instance_id = %self.id,
            staging_dir = %self.staging_dir.display(),
            remove_policy = ?request.remove_policy,
            "Starting instance"
        );

        if let Err(e) = self.stage(request).await {
            self.fail(&e);
            return;
        }
        if let Err(e) = self.runner.start(&self.staging_dir).await {
            self.fail(&e);
        }
    }

    async fn stage(&self, request: ProvisionRequest) -> Result<()> {
        let source = self.source_path.clone();
        let staging_dir = self.staging_dir.clone();
        let template_id = self.template_id.clone();
        let instance_id = self.id.clone();

        tokio::task::spawn_blocking(move || {
            staging::materialize(&source, &staging_dir)?;
            staging::write_worker_config(&staging_dir, &request, &template_id, &instance_id)
                .map(|_| ())
        })
        .await
        .map_err(|e| ProviderError::Task(e.to_string()))?
    }

    /// Stop the worker and launch it again.
    ///
    /// Waits (bounded) for the worker to be `Running` first. Does nothing on
    /// an errored instance.
    pub async fn restart(&self) {
        if self.is_errored() {
            return;
        }
        self.wait_for_running().await;

        if !self.set_status(InstanceStatus::Restarting) {
            return;
        }
        info!(template_id = %self.template_id, instance_id = %self.id, "Restarting instance");

        if let Err(e) = self.runner.stop(&self.staging_dir).await {
            self.fail(&e);
            return;
        }
        tokio::time::sleep(self.config.restart_settle()).await;
        if let Err(e) = self.runner.start(&self.staging_dir).await {
            self.fail(&e);
        }
    }

    /// Stop the worker and release the staging directory.
    ///
    /// One-shot instances also leave their template's pool. An errored
    /// instance skips the stop but still releases its directory.
    pub async fn terminate(&self) {
        if matches!(
            self.status(),
            InstanceStatus::Starting | InstanceStatus::Restarting
        ) {
            self.wait_for_running().await;
        }
        if self.is_errored() {
            self.release().await;
            return;
        }

        info!(template_id = %self.template_id, instance_id = %self.id, "Terminating instance");
        let previous = self.begin_stopping();

        if lifecycle::is_active(previous) {
            self.stop_worker().await;
        } else {
            // Never launched, or already down
            self.force_stopped();
        }

        self.release().await;
    }

    /// Move to `Stopping`, returning the status the instance left.
    fn begin_stopping(&self) -> InstanceStatus {
        let mut previous = InstanceStatus::Stopping;
        self.status.send_if_modified(|current| {
            previous = *current;
            if *current != InstanceStatus::Stopping
                && lifecycle::is_valid_transition(*current, InstanceStatus::Stopping)
            {
                *current = InstanceStatus::Stopping;
                true
            } else {
                false
            }
        });
        debug!(
            template_id = %self.template_id,
            instance_id = %self.id,
            from = ?previous,
            "Instance stopping"
        );
        previous
    }

    /// Complete a stop nobody reported. Only applies while `Stopping`.
    fn force_stopped(&self) -> bool {
        self.status.send_if_modified(|current| {
            if *current == InstanceStatus::Stopping {
                *current = InstanceStatus::Stopped;
                true
            } else {
                false
            }
        })
    }

    async fn stop_worker(&self) {
        if let Err(e) = self.runner.stop(&self.staging_dir).await {
            self.fail(&e);
            return;
        }
        let left_stopping = wait_for_status(
            self.status.subscribe(),
            |s| s != InstanceStatus::Stopping,
            self.config.status_wait_timeout(),
        )
        .await;
        if left_stopping.is_none() && self.force_stopped() {
            warn!(
                template_id = %self.template_id,
                instance_id = %self.id,
                "Worker did not unregister in time, marking instance stopped"
            );
        }
    }

    /// Remove the staging directory and, once stopped, run the kind's cleanup.
    ///
    /// Runs under the template's provisioning lock. An instance that was
    /// handed out again in the meantime keeps its directory.
    pub(crate) async fn release(&self) {
        let template = self.template.upgrade();
        let _guard = match &template {
            Some(template) => Some(template.provisioning_guard().await),
            None => None,
        };

        match self.status() {
            InstanceStatus::Stopped => {
                self.release_staging_dir().await;
                self.cleanup_stopped(template.as_deref());
            }
            InstanceStatus::Error => self.release_staging_dir().await,
            status => debug!(
                template_id = %self.template_id,
                instance_id = %self.id,
                ?status,
                "Instance was claimed again, keeping staging directory"
            ),
        }
    }

    async fn release_staging_dir(&self) {
        let staging_dir = self.staging_dir.clone();
        let removed = tokio::task::spawn_blocking(move || staging::remove_staging_dir(&staging_dir))
            .await
            .map_err(|e| ProviderError::Task(e.to_string()))
            .and_then(|result| result);
        if let Err(e) = removed {
            self.fail(&e);
        }
    }

    fn cleanup_stopped(&self, template: Option<&Template>) {
        match self.kind {
            InstanceKind::Reusable => {}
            InstanceKind::OneShot => {
                if let Some(template) = template {
                    template.forget_instance(&self.id);
                }
                debug!(
                    template_id = %self.template_id,
                    instance_id = %self.id,
                    "Cleaned up one-shot instance"
                );
            }
        }
    }

    /// Apply a worker (un)registration.
    ///
    /// Returns the previous status if the status changed. Registrations are
    /// ignored before the first start and on errored instances, and
    /// unregistrations are ignored while restarting.
    pub fn report_registered(&self, registered: bool) -> Option<InstanceStatus> {
        let mut previous = None;
        self.status.send_if_modified(|current| {
            match lifecycle::registration_target(*current, registered) {
                Some(target) if target != *current => {
                    previous = Some(*current);
                    *current = target;
                    true
                }
                _ => false,
            }
        });

        match previous {
            Some(from) => info!(
                template_id = %self.template_id,
                instance_id = %self.id,
                ?from,
                to = ?self.status(),
                registered,
                "Worker registration applied"
            ),
            None => debug!(
                template_id = %self.template_id,
                instance_id = %self.id,
                status = ?self.status(),
                registered,
                "Worker registration ignored"
            ),
        }
        previous
    }

    fn is_errored(&self) -> bool {
        lifecycle::is_terminal(self.status())
    }

    /// Apply a status change if the state machine allows it.
    fn set_status(&self, to: InstanceStatus) -> bool {
        let mut from = None;
        let changed = self.status.send_if_modified(|current| {
            if *current != to && lifecycle::is_valid_transition(*current, to) {
                from = Some(*current);
                *current = to;
                true
            } else {
                false
            }
        });
        if let Some(from) = from {
            debug!(
                template_id = %self.template_id,
                instance_id = %self.id,
                ?from,
                ?to,
                "Instance status changed"
            );
        }
        changed
    }

    /// Record the first failure and move to `Error`.
    fn fail(&self, err: &ProviderError) {
        error!(
            template_id = %self.template_id,
            instance_id = %self.id,
            error = %err,
            "Instance step failed"
        );
        {
            let mut slot = self.error.write();
            if slot.is_none() {
                *slot = Some(ErrorInfo::from(err));
            }
        }
        self.set_status(InstanceStatus::Error);
    }

    async fn wait_for_running(&self) {
        if self.wait_for(InstanceStatus::Running).await.is_none() {
            warn!(
                template_id = %self.template_id,
                instance_id = %self.id,
                status = ?self.status(),
                "Instance did not reach running in time, proceeding"
            );
        }
    }

    /// Wait until the status is `target` or `Error`, bounded by the
    /// configured ceiling. Returns the observed status, or `None` on timeout.
    async fn wait_for(&self, target: InstanceStatus) -> Option<InstanceStatus> {
        wait_for_status(
            self.status.subscribe(),
            |s| s == target || s == InstanceStatus::Error,
            self.config.status_wait_timeout(),
        )
        .await
    }
}

async fn wait_for_status(
    mut rx: watch::Receiver<InstanceStatus>,
    reached: impl Fn(InstanceStatus) -> bool,
    timeout: Duration,
) -> Option<InstanceStatus> {
    let waited = tokio::time::timeout(timeout, rx.wait_for(|s| reached(*s))).await;
    match waited {
        Ok(Ok(status)) => Some(*status),
        _ => None,
    }
}

/// Worker name for an instance of the named template.
#[must_use]
pub fn agent_name(template_name: &str, instance_id: &InstanceId) -> String {
    format!("img-{template_name}-{instance_id}")
}
