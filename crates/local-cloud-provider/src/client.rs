//! The provisioning client.
//!
//! This module provides the `CloudClient` trait, the contract an orchestrator
//! drives, and `LocalCloudClient`, which implements it over templates loaded
//! from declaration text.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use local_cloud_core::{params, IdGenerator, InstanceId, TemplateId};
use parking_lot::RwLock;
use tracing::{debug, error, info};

use crate::config::ProviderConfig;
use crate::declaration;
use crate::error::{ErrorInfo, ProviderError, Result};
use crate::housekeeping::Housekeeper;
use crate::instance::{self, Instance, InstanceKind};
use crate::runner::WorkerRunner;
use crate::template::Template;
use crate::types::{InstanceStatus, ProvisionRequest};

/// Trait defining the operations an orchestrator performs on a provider.
#[async_trait]
pub trait CloudClient: Send + Sync {
    // =========================================================================
    // Templates
    // =========================================================================

    /// The configuration error, if any declaration was rejected.
    fn error_info(&self) -> Option<ErrorInfo>;

    /// All templates, in declaration order.
    fn templates(&self) -> Vec<Arc<Template>>;

    /// Returns true if the template may provision another instance.
    fn can_start_new_instance(&self, template: &Template) -> bool;

    // =========================================================================
    // Instance Lifecycle
    // =========================================================================

    /// Provision a worker from a template.
    ///
    /// # Errors
    ///
    /// Returns `TemplateNotFound` for an unknown template and
    /// `TemplateUnavailable` for a template whose source is invalid.
    async fn start_new_instance(
        &self,
        template_id: &TemplateId,
        request: ProvisionRequest,
    ) -> Result<Arc<Instance>>;

    /// Restart a worker.
    ///
    /// # Errors
    ///
    /// Returns a not-found error if the instance is unknown.
    async fn restart_instance(
        &self,
        template_id: &TemplateId,
        instance_id: &InstanceId,
    ) -> Result<()>;

    /// Terminate a worker.
    ///
    /// # Errors
    ///
    /// Returns a not-found error if the instance is unknown.
    async fn terminate_instance(
        &self,
        template_id: &TemplateId,
        instance_id: &InstanceId,
    ) -> Result<()>;

    // =========================================================================
    // Registration
    // =========================================================================

    /// Report that a worker registered or unregistered.
    ///
    /// Returns the instance's status after the report.
    ///
    /// # Errors
    ///
    /// Returns a not-found error if the instance is unknown.
    fn report_registered(
        &self,
        template_id: &TemplateId,
        instance_id: &InstanceId,
        registered: bool,
    ) -> Result<InstanceStatus>;

    /// Terminate everything and stop background work.
    async fn dispose(&self);
}

/// Provider over local worker processes.
pub struct LocalCloudClient {
    templates: RwLock<Vec<Arc<Template>>>,
    error: Option<ErrorInfo>,
    config: Arc<ProviderConfig>,
    housekeeper: Housekeeper,
    disposed: AtomicBool,
}

impl LocalCloudClient {
    /// Build a client from template declaration text.
    ///
    /// Rejected declarations do not fail construction; they are aggregated
    /// into the client's [`error_info`](CloudClient::error_info). Must be
    /// called from within a tokio runtime.
    #[must_use]
    pub fn from_declarations(
        text: &str,
        config: ProviderConfig,
        runner: Arc<dyn WorkerRunner>,
    ) -> Self {
        let config = Arc::new(config);
        let parsed = declaration::parse(text);

        let template_ids = IdGenerator::new();
        let templates: Vec<_> = parsed
            .templates
            .into_iter()
            .map(|declaration| {
                Arc::new(Template::new(
                    template_ids.next_id(),
                    declaration,
                    Arc::clone(&runner),
                    Arc::clone(&config),
                ))
            })
            .collect();

        let error = parsed.error.map(ErrorInfo::new);
        if let Some(error) = &error {
            error!(%error, "Template declarations rejected");
        }
        info!(
            templates = templates.len(),
            staging_root = %config.staging_root.display(),
            "Local cloud client created"
        );

        Self {
            templates: RwLock::new(templates),
            error,
            config,
            housekeeper: Housekeeper::start(),
            disposed: AtomicBool::new(false),
        }
    }

    /// Get the configuration.
    #[must_use]
    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    /// Returns true once [`dispose`](CloudClient::dispose) has run.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Find a template by ID.
    #[must_use]
    pub fn find_template(&self, template_id: &TemplateId) -> Option<Arc<Template>> {
        self.templates
            .read()
            .iter()
            .find(|t| t.id() == template_id)
            .cloned()
    }

    /// Find an instance by template and instance ID.
    ///
    /// # Errors
    ///
    /// Returns a not-found error if either is unknown.
    pub fn find_instance(
        &self,
        template_id: &TemplateId,
        instance_id: &InstanceId,
    ) -> Result<Arc<Instance>> {
        let template = self
            .find_template(template_id)
            .ok_or_else(|| ProviderError::template_not_found(template_id))?;
        template
            .find_instance_by_id(instance_id)
            .ok_or_else(|| ProviderError::instance_not_found(template_id, instance_id))
    }

    /// Find the instance a worker belongs to, by its reported parameters.
    #[must_use]
    pub fn find_instance_by_worker(
        &self,
        parameters: &HashMap<String, String>,
    ) -> Option<Arc<Instance>> {
        let (template_id, instance_id) = params::correlation(parameters)?;
        self.find_instance(&template_id, &instance_id).ok()
    }

    /// Returns true if the worker carries this provider's correlation parameters.
    #[must_use]
    pub fn owns_worker(&self, parameters: &HashMap<String, String>) -> bool {
        params::carries_correlation(parameters)
    }

    /// Name a worker should register under, from its reported parameters.
    #[must_use]
    pub fn generate_agent_name(&self, parameters: &HashMap<String, String>) -> Option<String> {
        let (template_id, instance_id) = params::correlation(parameters)?;
        let template = self.find_template(&template_id)?;
        Some(instance::agent_name(template.name(), &instance_id))
    }

    /// Apply a worker (un)registration identified by its reported parameters.
    ///
    /// Returns `None` if the worker does not belong to a known instance.
    pub fn on_worker_registration(
        &self,
        parameters: &HashMap<String, String>,
        registered: bool,
    ) -> Option<InstanceStatus> {
        let instance = self.find_instance_by_worker(parameters)?;
        Some(self.apply_registration(&instance, registered))
    }

    fn apply_registration(&self, instance: &Arc<Instance>, registered: bool) -> InstanceStatus {
        let previous = instance.report_registered(registered);
        let status = instance.status();

        // A one-shot worker that went away without being asked to
        let stopped_on_its_own = previous.is_some_and(|p| p != InstanceStatus::Stopping)
            && status == InstanceStatus::Stopped;
        if stopped_on_its_own && instance.kind() == InstanceKind::OneShot {
            self.schedule_cleanup(instance);
        }
        status
    }

    fn schedule_cleanup(&self, instance: &Arc<Instance>) {
        let label = format!("cleanup {}", instance.display_name());
        let target = Arc::clone(instance);
        let scheduled = self
            .housekeeper
            .schedule(label, self.config.cleanup_grace(), async move {
                if target.status() == InstanceStatus::Stopped {
                    target.release().await;
                }
            });
        debug!(
            template_id = %instance.template_id(),
            instance_id = %instance.id(),
            scheduled,
            "Deferred cleanup of stopped one-shot instance"
        );
    }

    fn ensure_active(&self) -> Result<()> {
        if self.is_disposed() {
            return Err(ProviderError::Disposed);
        }
        Ok(())
    }
}

#[async_trait]
impl CloudClient for LocalCloudClient {
    fn error_info(&self) -> Option<ErrorInfo> {
        self.error.clone()
    }

    fn templates(&self) -> Vec<Arc<Template>> {
        self.templates.read().clone()
    }

    fn can_start_new_instance(&self, _template: &Template) -> bool {
        true
    }

    async fn start_new_instance(
        &self,
        template_id: &TemplateId,
        request: ProvisionRequest,
    ) -> Result<Arc<Instance>> {
        self.ensure_active()?;
        let template = self
            .find_template(template_id)
            .ok_or_else(|| ProviderError::template_not_found(template_id))?;
        template.start_new_instance(request).await
    }

    async fn restart_instance(
        &self,
        template_id: &TemplateId,
        instance_id: &InstanceId,
    ) -> Result<()> {
        self.ensure_active()?;
        let instance = self.find_instance(template_id, instance_id)?;
        instance.restart().await;
        Ok(())
    }

    async fn terminate_instance(
        &self,
        template_id: &TemplateId,
        instance_id: &InstanceId,
    ) -> Result<()> {
        self.ensure_active()?;
        let instance = self.find_instance(template_id, instance_id)?;
        instance.terminate().await;
        Ok(())
    }

    fn report_registered(
        &self,
        template_id: &TemplateId,
        instance_id: &InstanceId,
        registered: bool,
    ) -> Result<InstanceStatus> {
        let instance = self.find_instance(template_id, instance_id)?;
        Ok(self.apply_registration(&instance, registered))
    }

    async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let templates = std::mem::take(&mut *self.templates.write());
        info!(templates = templates.len(), "Disposing local cloud client");
        for template in templates {
            template.dispose().await;
        }
        self.housekeeper.shutdown();
    }
}
