//! Instance templates and their pools.
//!
//! A [`Template`] is a validated source of worker files plus the policy that
//! decides whether stopped instances are reused. Provisioning on one template
//! is serialized by a per-template async mutex; different templates never
//! block each other.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use local_cloud_core::{IdGenerator, InstanceId, TemplateId};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::config::ProviderConfig;
use crate::declaration::TemplateDeclaration;
use crate::error::{ErrorInfo, ProviderError, Result};
use crate::instance::{Instance, InstanceKind};
use crate::lifecycle;
use crate::runner::WorkerRunner;
use crate::staging;
use crate::types::{ProvisionRequest, TemplateSummary};

/// A named source of worker files and its pool of instances.
pub struct Template {
    id: TemplateId,
    declaration: TemplateDeclaration,
    error: Option<ErrorInfo>,
    instances: RwLock<HashMap<InstanceId, Arc<Instance>>>,
    instance_ids: IdGenerator,
    provision_lock: tokio::sync::Mutex<()>,
    runner: Arc<dyn WorkerRunner>,
    config: Arc<ProviderConfig>,
}

impl std::fmt::Debug for Template {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Template")
            .field("id", &self.id)
            .field("name", &self.declaration.name)
            .field("source_path", &self.declaration.source_path)
            .field("reusable", &self.declaration.reusable)
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

impl Template {
    /// Create a template, validating its source path.
    ///
    /// An invalid source does not fail construction; it becomes the
    /// template's sticky error.
    #[must_use]
    pub fn new(
        id: TemplateId,
        declaration: TemplateDeclaration,
        runner: Arc<dyn WorkerRunner>,
        config: Arc<ProviderConfig>,
    ) -> Self {
        let error = staging::source_kind(&declaration.source_path)
            .is_none()
            .then(|| {
                ErrorInfo::new(format!(
                    "\"{}\" is not a directory or a zip archive or does not exist.",
                    declaration.source_path.display()
                ))
            });
        if let Some(error) = &error {
            warn!(template_id = %id, name = %declaration.name, %error, "Template source is invalid");
        }

        Self {
            id,
            declaration,
            error,
            instances: RwLock::new(HashMap::new()),
            instance_ids: IdGenerator::new(),
            provision_lock: tokio::sync::Mutex::new(()),
            runner,
            config,
        }
    }

    /// Get the template ID.
    #[must_use]
    pub const fn id(&self) -> &TemplateId {
        &self.id
    }

    /// Get the template name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.declaration.name
    }

    /// Directory or archive the worker files come from.
    #[must_use]
    pub fn source_path(&self) -> &Path {
        &self.declaration.source_path
    }

    /// Returns true if stopped instances are kept for reuse.
    #[must_use]
    pub const fn is_reusable(&self) -> bool {
        self.declaration.reusable
    }

    /// Returns true if the template was declared with `delay`.
    #[must_use]
    pub const fn is_eternal_starting(&self) -> bool {
        self.declaration.eternal_starting
    }

    /// Orchestrator pool new workers join, if declared.
    #[must_use]
    pub const fn agent_pool_id(&self) -> Option<i32> {
        self.declaration.agent_pool_id
    }

    /// Properties merged into every provisioned worker's configuration.
    #[must_use]
    pub const fn extra_properties(&self) -> &BTreeMap<String, String> {
        &self.declaration.extra_properties
    }

    /// The sticky validation error, if the source path is unusable.
    #[must_use]
    pub const fn error_info(&self) -> Option<&ErrorInfo> {
        self.error.as_ref()
    }

    /// Kind of instance this template allocates.
    #[must_use]
    pub const fn kind(&self) -> InstanceKind {
        InstanceKind::for_template(self.declaration.reusable)
    }

    pub(crate) fn runner(&self) -> Arc<dyn WorkerRunner> {
        Arc::clone(&self.runner)
    }

    pub(crate) fn config(&self) -> Arc<ProviderConfig> {
        Arc::clone(&self.config)
    }

    /// Hold off provisioning on this template until the guard drops.
    pub(crate) async fn provisioning_guard(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.provision_lock.lock().await
    }

    /// Snapshot of the pool.
    #[must_use]
    pub fn instances(&self) -> Vec<Arc<Instance>> {
        let mut instances: Vec<_> = self.instances.read().values().cloned().collect();
        instances.sort_by(|a, b| a.started_at().cmp(&b.started_at()));
        instances
    }

    /// Find a pooled instance.
    #[must_use]
    pub fn find_instance_by_id(&self, instance_id: &InstanceId) -> Option<Arc<Instance>> {
        self.instances.read().get(instance_id).cloned()
    }

    /// Remove an instance from the pool.
    pub fn forget_instance(&self, instance_id: &InstanceId) -> Option<Arc<Instance>> {
        let removed = self.instances.write().remove(instance_id);
        if removed.is_some() {
            debug!(template_id = %self.id, %instance_id, "Forgot instance");
        }
        removed
    }

    /// Provision a worker, reusing a stopped pooled instance when possible.
    ///
    /// The returned instance may already be in `Error`; hosts poll
    /// [`Instance::error_info`] for the cause.
    ///
    /// # Errors
    ///
    /// Returns `TemplateUnavailable` if the template's source is invalid.
    pub async fn start_new_instance(
        self: &Arc<Self>,
        mut request: ProvisionRequest,
    ) -> Result<Arc<Instance>> {
        if let Some(error) = &self.error {
            return Err(ProviderError::TemplateUnavailable {
                template_id: self.id.clone(),
                reason: error.message.clone(),
            });
        }

        for (key, value) in &self.declaration.extra_properties {
            request.add_parameter(key.clone(), value.clone());
        }

        let instance = {
            let _guard = self.provision_lock.lock().await;
            self.claim_instance()
        };

        info!(
            template_id = %self.id,
            instance_id = %instance.id(),
            "Provisioning instance"
        );
        instance.provision(request).await;
        Ok(instance)
    }

    /// Pick a reusable instance or allocate a new one, and mark it starting.
    fn claim_instance(self: &Arc<Self>) -> Arc<Instance> {
        let reused = self
            .instances
            .read()
            .values()
            .find(|i| {
                i.error_info().is_none()
                    && lifecycle::is_reusable(i.status())
                    && i.is_restartable()
                    && i.claim()
            })
            .cloned();
        if let Some(instance) = reused {
            debug!(template_id = %self.id, instance_id = %instance.id(), "Reusing stopped instance");
            return instance;
        }

        let instance_id: InstanceId = self.instance_ids.next_id();
        let instance = Arc::new(Instance::new(instance_id.clone(), self, self.kind()));
        instance.claim();
        self.instances.write().insert(instance_id, Arc::clone(&instance));
        instance
    }

    /// Point-in-time view of the template and its pool.
    #[must_use]
    pub fn summary(&self) -> TemplateSummary {
        TemplateSummary {
            template_id: self.id.clone(),
            name: self.declaration.name.clone(),
            source_path: self.declaration.source_path.clone(),
            reusable: self.declaration.reusable,
            eternal_starting: self.declaration.eternal_starting,
            agent_pool_id: self.declaration.agent_pool_id,
            extra_properties: self.declaration.extra_properties.clone(),
            error: self.error.clone(),
            instances: self.instances().iter().map(|i| i.summary()).collect(),
        }
    }

    /// Terminate every pooled instance and clear the pool.
    ///
    /// Safe to call more than once.
    pub async fn dispose(&self) {
        let drained: Vec<_> = self.instances.write().drain().map(|(_, i)| i).collect();
        if drained.is_empty() {
            return;
        }
        info!(template_id = %self.id, count = drained.len(), "Disposing template");
        for instance in drained {
            instance.terminate().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::mock::MockRunner;
    use crate::runner::WorkerCommand;
    use crate::types::InstanceStatus;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        runner: Arc<MockRunner>,
        config: Arc<ProviderConfig>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let source = dir.path().join("agent");
            std::fs::create_dir_all(source.join("bin")).unwrap();
            std::fs::write(source.join("bin").join("agent.sh"), "#!/bin/sh\n").unwrap();
            let config = ProviderConfig {
                staging_root: dir.path().join("staging"),
                status_wait_timeout_ms: 200,
                restart_settle_ms: 10,
                cleanup_grace_ms: 20,
            };
            Self {
                dir,
                runner: Arc::new(MockRunner::new()),
                config: Arc::new(config),
            }
        }

        fn template(&self, declaration: TemplateDeclaration) -> Arc<Template> {
            Arc::new(Template::new(
                TemplateId::from(1_u64),
                declaration,
                self.runner.clone(),
                self.config.clone(),
            ))
        }

        fn declaration(&self, reusable: bool) -> TemplateDeclaration {
            let mut declaration = TemplateDeclaration::new("build1", self.dir.path().join("agent"));
            declaration.reusable = reusable;
            declaration
        }
    }

    fn request() -> ProvisionRequest {
        ProvisionRequest::new("worker", "http://localhost:8111")
    }

    #[test]
    fn invalid_source_is_sticky_error() {
        let fx = Fixture::new();
        let template = fx.template(TemplateDeclaration::new("t", "/definitely/not/here"));
        let error = template.error_info().unwrap();
        assert_eq!(
            error.message,
            "\"/definitely/not/here\" is not a directory or a zip archive or does not exist."
        );
    }

    #[test]
    fn zip_source_is_valid() {
        let fx = Fixture::new();
        let archive = fx.dir.path().join("agent.zip");
        std::fs::write(&archive, b"PK").unwrap();
        let template = fx.template(TemplateDeclaration::new("t", &archive));
        assert!(template.error_info().is_none());

        let other = fx.dir.path().join("agent.tar");
        std::fs::write(&other, b"").unwrap();
        let template = fx.template(TemplateDeclaration::new("t", &other));
        assert!(template.error_info().is_some());
    }

    #[tokio::test]
    async fn errored_template_refuses_to_provision() {
        let fx = Fixture::new();
        let template = fx.template(TemplateDeclaration::new("t", "/definitely/not/here"));

        let result = template.start_new_instance(request()).await;
        assert!(matches!(result, Err(ProviderError::TemplateUnavailable { .. })));
        assert!(template.instances().is_empty());
        assert!(fx.runner.calls().is_empty());
    }

    #[tokio::test]
    async fn extra_properties_reach_worker_config() {
        let fx = Fixture::new();
        let mut declaration = fx.declaration(false);
        declaration
            .extra_properties
            .insert("env.POOL".to_string(), "fast".to_string());
        let template = fx.template(declaration);

        let instance = template.start_new_instance(request()).await.unwrap();
        let config =
            crate::properties::PropertiesFile::load(&staging::config_path(instance.staging_dir()))
                .unwrap();
        assert_eq!(config.get("env.POOL"), Some("fast"));
    }

    #[tokio::test]
    async fn reusable_template_reuses_stopped_instance() {
        let fx = Fixture::new();
        let template = fx.template(fx.declaration(true));

        let first = template.start_new_instance(request()).await.unwrap();
        first.report_registered(true);
        first.report_registered(false);
        assert_eq!(first.status(), InstanceStatus::Stopped);

        let second = template.start_new_instance(request()).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.status(), InstanceStatus::Starting);
        assert_eq!(template.instances().len(), 1);
        assert_eq!(fx.runner.count(WorkerCommand::Start), 2);
    }

    #[tokio::test]
    async fn reuse_during_terminate_keeps_new_worker_staged() {
        let fx = Fixture::new();
        let template = fx.template(fx.declaration(true));
        let instance = template.start_new_instance(request()).await.unwrap();
        instance.report_registered(true);

        let mut rx = instance.subscribe();
        let terminating = {
            let instance = instance.clone();
            tokio::spawn(async move { instance.terminate().await })
        };
        rx.wait_for(|s| *s == InstanceStatus::Stopping).await.unwrap();
        instance.report_registered(false);

        // Handed out again before terminate has released it
        let reused = template.start_new_instance(request()).await.unwrap();
        assert!(Arc::ptr_eq(&instance, &reused));
        terminating.await.unwrap();

        assert_eq!(instance.status(), InstanceStatus::Starting);
        assert!(instance.staging_dir().join("bin").join("agent.sh").is_file());
        assert!(instance.error_info().is_none());
        assert_eq!(template.instances().len(), 1);
        assert_eq!(fx.runner.count(WorkerCommand::Start), 2);
        assert_eq!(fx.runner.count(WorkerCommand::Stop), 1);

        // Still owned by the new worker
        assert_eq!(instance.report_registered(true), Some(InstanceStatus::Starting));
    }

    #[tokio::test]
    async fn running_instances_are_not_reused() {
        let fx = Fixture::new();
        let template = fx.template(fx.declaration(true));

        let first = template.start_new_instance(request()).await.unwrap();
        let second = template.start_new_instance(request()).await.unwrap();
        assert_ne!(first.id(), second.id());
        assert_eq!(template.instances().len(), 2);
    }

    #[tokio::test]
    async fn one_shot_instance_leaves_pool_on_terminate() {
        let fx = Fixture::new();
        let template = fx.template(fx.declaration(false));

        let first = template.start_new_instance(request()).await.unwrap();
        first.report_registered(true);
        first.terminate().await;

        assert_eq!(first.status(), InstanceStatus::Stopped);
        assert!(template.find_instance_by_id(first.id()).is_none());
        assert!(!first.staging_dir().exists());

        let second = template.start_new_instance(request()).await.unwrap();
        assert_ne!(first.id(), second.id());
    }

    #[tokio::test]
    async fn one_shot_stopped_instance_is_not_reused() {
        let fx = Fixture::new();
        let template = fx.template(fx.declaration(false));

        let first = template.start_new_instance(request()).await.unwrap();
        first.report_registered(true);
        first.report_registered(false);

        let second = template.start_new_instance(request()).await.unwrap();
        assert_ne!(first.id(), second.id());
    }

    #[tokio::test]
    async fn errored_instances_are_not_reused() {
        let fx = Fixture::new();
        let template = fx.template(fx.declaration(true));
        fx.runner.fail_start(true);

        let first = template.start_new_instance(request()).await.unwrap();
        assert_eq!(first.status(), InstanceStatus::Error);

        fx.runner.fail_start(false);
        let second = template.start_new_instance(request()).await.unwrap();
        assert_ne!(first.id(), second.id());
        assert_eq!(second.status(), InstanceStatus::Starting);
    }

    #[tokio::test]
    async fn concurrent_provisioning_claims_distinct_instances() {
        let fx = Fixture::new();
        let template = fx.template(fx.declaration(true));

        let seed = template.start_new_instance(request()).await.unwrap();
        seed.report_registered(true);
        seed.report_registered(false);

        let a = tokio::spawn({
            let template = template.clone();
            async move { template.start_new_instance(request()).await.unwrap() }
        });
        let b = tokio::spawn({
            let template = template.clone();
            async move { template.start_new_instance(request()).await.unwrap() }
        });
        let (a, b) = (a.await.unwrap(), b.await.unwrap());

        assert_ne!(a.id(), b.id());
        assert!(Arc::ptr_eq(&a, &seed) || Arc::ptr_eq(&b, &seed));
        assert_eq!(template.instances().len(), 2);
    }

    #[tokio::test]
    async fn dispose_is_idempotent() {
        let fx = Fixture::new();
        let template = fx.template(fx.declaration(true));
        let instance = template.start_new_instance(request()).await.unwrap();
        instance.report_registered(true);

        template.dispose().await;
        assert!(template.instances().is_empty());
        assert!(!instance.staging_dir().exists());

        template.dispose().await;
        assert!(template.instances().is_empty());
    }

    #[test]
    fn summary_reports_declaration() {
        let fx = Fixture::new();
        let mut declaration = fx.declaration(true);
        declaration.agent_pool_id = Some(4);
        let template = fx.template(declaration);

        let summary = template.summary();
        assert_eq!(summary.name, "build1");
        assert!(summary.reusable);
        assert_eq!(summary.agent_pool_id, Some(4));
        assert!(summary.error.is_none());
        assert!(summary.instances.is_empty());
    }
}
