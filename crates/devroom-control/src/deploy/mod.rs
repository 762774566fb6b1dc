//! Deployment orchestrator.
//!
//! Each deployment is owned by one background task that walks it through
//! the [`lifecycle`] state machine: materialize project files, install
//! dependencies, build, then hand the output to a [`DeployProvider`]. Every
//! stage change is validated, persisted and broadcast to the room's deploy
//! and collab topics.
//!
//! Live deployments are kept in an in-memory table guarded by a
//! `parking_lot` lock that is never held across an `.await`. Terminal entries
//! stay there for the retention horizon so status lookups keep answering, and
//! are evicted by the retention sweeper afterwards. The store keeps the
//! durable history.

pub mod lifecycle;
pub mod provider;
pub mod workspace;

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use devroom_core::{DeploymentId, ProjectId, RoomId, UserId};
use devroom_store::{DeployLogLine, Deployment, DeploymentConfig, DeploymentStatus, Store};
use parking_lot::RwLock;
use serde::Deserialize;
use tokio::task::JoinHandle;

use crate::access;
use crate::bridge::command::tokenize;
use crate::config::ControlConfig;
use crate::error::{ControlError, Result};
use crate::events::{ServerEvent, Topic};
use crate::presence::Presence;
use crate::sandbox::{CommandSandbox, CommandSpec};

pub use provider::{DeployContext, DeployProvider, ProviderRegistry, StaticProvider, WebhookProvider};

/// Longest command output tail kept in a deployment log line.
const LOG_TAIL_BYTES: usize = 4 * 1024;

/// `start-deployment` payload.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartDeployment {
    /// Room that receives progress events.
    pub room_id: RoomId,
    /// Project to deploy.
    pub project_id: ProjectId,
    /// Provider identifier.
    #[serde(default = "default_provider")]
    pub provider: String,
    /// Build settings.
    #[serde(default)]
    pub config: DeploymentConfig,
}

fn default_provider() -> String {
    "static".to_string()
}

struct ActiveDeployment {
    record: Deployment,
    cancel: Arc<AtomicBool>,
}

/// One state-machine step applied to a live deployment.
struct Step {
    status: Option<DeploymentStatus>,
    progress: Option<u8>,
    message: String,
    url: Option<String>,
    error: Option<String>,
    /// Takes the cancellation edge of the state machine.
    cancellation: bool,
}

impl Step {
    fn progress(progress: u8, message: impl Into<String>) -> Self {
        Self {
            status: None,
            progress: Some(progress),
            message: message.into(),
            url: None,
            error: None,
            cancellation: false,
        }
    }

    fn to(status: DeploymentStatus, progress: u8, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            ..Self::progress(progress, message)
        }
    }

    fn failed(error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            status: Some(DeploymentStatus::Failed),
            progress: None,
            message: format!("Deployment failed: {error}"),
            url: None,
            error: Some(error),
            cancellation: false,
        }
    }

    fn cancelled(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            cancellation: true,
            ..Self::failed("cancelled")
        }
    }
}

/// Why the pipeline stopped early.
enum Halt {
    /// The deployment was cancelled and is already marked failed.
    Cancelled,
    /// A stage failed.
    Failed(String),
}

impl From<ControlError> for Halt {
    fn from(e: ControlError) -> Self {
        Self::Failed(e.to_string())
    }
}

/// Runs deployments and answers status queries.
pub struct DeploymentOrchestrator<S: Store> {
    presence: Arc<Presence<S>>,
    sandbox: Arc<dyn CommandSandbox>,
    providers: ProviderRegistry,
    config: ControlConfig,
    active: RwLock<HashMap<DeploymentId, ActiveDeployment>>,
}

impl<S: Store + 'static> DeploymentOrchestrator<S> {
    /// Create the orchestrator.
    #[must_use]
    pub fn new(
        presence: Arc<Presence<S>>,
        sandbox: Arc<dyn CommandSandbox>,
        providers: ProviderRegistry,
        config: ControlConfig,
    ) -> Self {
        Self {
            presence,
            sandbox,
            providers,
            config,
            active: RwLock::new(HashMap::new()),
        }
    }

    fn store(&self) -> &S {
        self.presence.store()
    }

    /// Deployments currently held in memory.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active.read().len()
    }

    // ========================================================================
    // Operations
    // ========================================================================

    /// Accept a deployment and launch its background task.
    ///
    /// Returns the `pending` record; progress arrives as room events.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the project doesn't exist or isn't in the room,
    /// `Forbidden` without write access, or `Validation` for a malformed build
    /// command. No record is written in those cases.
    pub fn start(self: &Arc<Self>, user_id: &UserId, request: StartDeployment) -> Result<Deployment> {
        let (project, access) = access::project_access(self.store(), &request.project_id, user_id)?;
        if project.room_id != request.room_id {
            return Err(ControlError::NotFound(format!("project {}", project.project_id)));
        }
        access::require_write(access, &request.room_id)?;
        if let Some(command) = &request.config.build_command {
            tokenize(command)?;
        }

        let now = Utc::now();
        let record = Deployment {
            deployment_id: DeploymentId::generate(),
            project_id: project.project_id,
            room_id: request.room_id,
            user_id: *user_id,
            provider: request.provider,
            config: request.config,
            status: DeploymentStatus::Pending,
            progress: 0,
            logs: vec![DeployLogLine {
                at: now,
                status: DeploymentStatus::Pending,
                progress: 0,
                message: "Deployment queued".to_string(),
            }],
            url: None,
            error: None,
            started_at: now,
            finished_at: None,
        };
        self.store().put_deployment(&record)?;

        let cancel = Arc::new(AtomicBool::new(false));
        self.active.write().insert(
            record.deployment_id,
            ActiveDeployment {
                record: record.clone(),
                cancel: Arc::clone(&cancel),
            },
        );

        tracing::info!(
            deployment_id = %record.deployment_id,
            project_id = %record.project_id,
            provider = %record.provider,
            "Deployment started"
        );

        self.announce(
            record.room_id,
            ServerEvent::DeploymentStarted {
                room_id: record.room_id,
                deployment_id: record.deployment_id,
                project_id: record.project_id,
                provider: record.provider.clone(),
                user: self.presence.public_user(user_id),
                at: now,
            },
        );

        tokio::spawn(Arc::clone(self).run(record.deployment_id, cancel));
        Ok(record)
    }

    /// The in-memory state of a deployment.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` once the deployment has been evicted, and
    /// `Forbidden` if the caller has no access to its project.
    pub fn get_status(&self, user_id: &UserId, deployment_id: &DeploymentId) -> Result<Deployment> {
        let record = self.snapshot(deployment_id)?;
        access::project_access(self.store(), &record.project_id, user_id)?;
        Ok(record)
    }

    /// Cancel a deployment that hasn't reached the deploy stage.
    ///
    /// # Errors
    ///
    /// Returns `NotApplicable` if the deployment is deploying or finished,
    /// `NotFound` if it is unknown, or `Forbidden` without write access.
    pub fn cancel(&self, user_id: &UserId, deployment_id: &DeploymentId) -> Result<Deployment> {
        let record = match self.snapshot(deployment_id) {
            Ok(record) => record,
            Err(ControlError::NotFound(what)) => {
                // Evicted deployments are terminal.
                return match self.store().get_deployment(deployment_id)? {
                    Some(_) => Err(ControlError::NotApplicable(format!(
                        "deployment {deployment_id} already finished"
                    ))),
                    None => Err(ControlError::NotFound(what)),
                };
            }
            Err(e) => return Err(e),
        };
        let (_, access) = access::project_access(self.store(), &record.project_id, user_id)?;
        access::require_write(access, &record.room_id)?;

        let user = self.presence.public_user(user_id);
        let step = Step::cancelled(format!("Cancelled by {}", user.display_name));

        let cancelled = self.apply(deployment_id, step, |active| {
            if lifecycle::can_cancel(active.record.status) {
                active.cancel.store(true, Ordering::SeqCst);
                Ok(())
            } else {
                Err(ControlError::NotApplicable(format!(
                    "deployment {deployment_id} is {}",
                    lifecycle::label(active.record.status)
                )))
            }
        })?;

        tracing::info!(deployment_id = %deployment_id, user_id = %user_id, "Deployment cancelled");
        Ok(cancelled)
    }

    /// Durable deployment history of a project, newest first.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` or `Forbidden` if the caller can't see the project.
    pub fn history(
        &self,
        user_id: &UserId,
        project_id: &ProjectId,
        limit: Option<usize>,
    ) -> Result<Vec<Deployment>> {
        access::project_access(self.store(), project_id, user_id)?;
        let limit = limit.unwrap_or(self.config.history_limit).clamp(1, 100);
        Ok(self.store().list_deployments_by_project(project_id, limit)?)
    }

    /// Drop terminal deployments that finished before the retention horizon.
    ///
    /// Returns the number of evicted entries. Stored records are kept.
    pub fn evict_expired(&self, now: DateTime<Utc>) -> usize {
        let Ok(retention) = chrono::Duration::from_std(self.config.deployment_retention) else {
            return 0;
        };
        let cutoff = now - retention;

        let mut active = self.active.write();
        let before = active.len();
        active.retain(|_, entry| {
            !(entry.record.status.is_terminal()
                && entry.record.finished_at.is_some_and(|at| at < cutoff))
        });
        let evicted = before - active.len();
        if evicted > 0 {
            tracing::debug!(evicted, remaining = active.len(), "Evicted expired deployments");
        }
        evicted
    }

    /// Run [`evict_expired`](Self::evict_expired) periodically until the
    /// orchestrator is dropped.
    pub fn spawn_retention_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let period = self.config.retention_sweep_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(orchestrator) = weak.upgrade() else {
                    break;
                };
                orchestrator.evict_expired(Utc::now());
            }
        })
    }

    // ========================================================================
    // Background task
    // ========================================================================

    async fn run(self: Arc<Self>, deployment_id: DeploymentId, cancel: Arc<AtomicBool>) {
        let work_dir = self.config.deploy_work_root.join(deployment_id.to_string());

        match self.pipeline(&deployment_id, &cancel, &work_dir).await {
            Ok(url) => {
                let mut step = Step::to(DeploymentStatus::Success, 100, format!("Deployed to {url}"));
                step.url = Some(url);
                if self.advance(&deployment_id, step).is_ok() {
                    if let Err(e) = tokio::fs::remove_dir_all(&work_dir).await {
                        tracing::warn!(deployment_id = %deployment_id, error = %e, "Failed to remove work directory");
                    }
                }
            }
            Err(Halt::Cancelled) => {
                tracing::debug!(deployment_id = %deployment_id, "Deployment task stopped after cancellation");
            }
            Err(Halt::Failed(error)) => {
                tracing::warn!(deployment_id = %deployment_id, error = %error, "Deployment failed");
                if let Err(e) = self.advance(&deployment_id, Step::failed(error)) {
                    tracing::debug!(deployment_id = %deployment_id, error = %e, "Failure not recorded");
                }
            }
        }
    }

    async fn pipeline(
        &self,
        deployment_id: &DeploymentId,
        cancel: &AtomicBool,
        work_dir: &Path,
    ) -> std::result::Result<String, Halt> {
        let record = self.snapshot(deployment_id)?;
        let config = &record.config;

        // Materialize
        check_cancel(cancel)?;
        self.step(
            deployment_id,
            Step::to(DeploymentStatus::Building, 10, "Materializing project files"),
        )?;
        let files = self.store().list_files(&record.project_id).map_err(ControlError::from)?;
        let dir = work_dir.to_path_buf();
        let count = files.len();
        tokio::task::spawn_blocking(move || workspace::materialize(&dir, &files))
            .await
            .map_err(|e| Halt::Failed(format!("materialize task failed: {e}")))??;
        self.log(deployment_id, &format!("Materialized {count} files"));

        // Install
        check_cancel(cancel)?;
        if config.install {
            if let Some(argv) = workspace::detect_install(work_dir) {
                let command = argv.join(" ");
                self.step(deployment_id, Step::progress(25, format!("Installing dependencies: {command}")))?;
                self.run_command(deployment_id, argv, work_dir, &config.env).await?;
            }
        }

        // Build
        check_cancel(cancel)?;
        if let Some(command) = &config.build_command {
            self.step(deployment_id, Step::progress(40, format!("Building: {command}")))?;
            self.run_command(deployment_id, tokenize(command)?, work_dir, &config.env)
                .await?;
            self.step(deployment_id, Step::progress(60, "Build finished"))?;
        } else {
            self.step(deployment_id, Step::progress(60, "No build command"))?;
        }

        // Deploy
        check_cancel(cancel)?;
        let output_dir = workspace::output_dir(work_dir, config.output_dir.as_deref())?;
        self.step(
            deployment_id,
            Step::to(
                DeploymentStatus::Deploying,
                70,
                format!("Deploying with {}", record.provider),
            ),
        )?;
        let provider = self.providers.get(&record.provider)?;
        let url = provider
            .deploy(&DeployContext {
                deployment_id: *deployment_id,
                project_id: record.project_id,
                output_dir: &output_dir,
            })
            .await?;
        Ok(url)
    }

    async fn run_command(
        &self,
        deployment_id: &DeploymentId,
        argv: Vec<String>,
        cwd: &Path,
        env: &BTreeMap<String, String>,
    ) -> std::result::Result<(), Halt> {
        let mut spec = CommandSpec::from_argv(argv, PathBuf::from(cwd), self.config.deploy_step_timeout)?;
        spec.env = env.iter().map(|(k, v)| (k.clone(), v.clone())).collect();

        let output = self.sandbox.run(&spec).await?;
        let combined = output.combined();
        if !combined.trim().is_empty() {
            self.log(deployment_id, tail(&combined, LOG_TAIL_BYTES));
        }

        if output.timed_out {
            Err(Halt::Failed(format!("`{}` timed out", spec.display())))
        } else if output.success() {
            Ok(())
        } else {
            let code = output
                .exit_code
                .map_or_else(|| "a signal".to_string(), |c| format!("exit code {c}"));
            Err(Halt::Failed(format!("`{}` failed with {code}", spec.display())))
        }
    }

    // ========================================================================
    // State
    // ========================================================================

    fn snapshot(&self, deployment_id: &DeploymentId) -> Result<Deployment> {
        self.active
            .read()
            .get(deployment_id)
            .map(|entry| entry.record.clone())
            .ok_or_else(|| ControlError::NotFound(format!("deployment {deployment_id}")))
    }

    /// Apply a pipeline step; a rejected transition means the deployment was
    /// cancelled underneath the task.
    fn step(&self, deployment_id: &DeploymentId, step: Step) -> std::result::Result<(), Halt> {
        match self.advance(deployment_id, step) {
            Ok(_) => Ok(()),
            Err(ControlError::NotApplicable(_)) => Err(Halt::Cancelled),
            Err(e) => Err(e.into()),
        }
    }

    fn advance(&self, deployment_id: &DeploymentId, step: Step) -> Result<Deployment> {
        self.apply(deployment_id, step, |_| Ok(()))
    }

    /// Validate, apply and persist a step under the table lock, then emit
    /// the progress event after releasing it.
    fn apply(
        &self,
        deployment_id: &DeploymentId,
        step: Step,
        check: impl FnOnce(&ActiveDeployment) -> Result<()>,
    ) -> Result<Deployment> {
        let now = Utc::now();
        let snapshot = {
            let mut active = self.active.write();
            let entry = active
                .get_mut(deployment_id)
                .ok_or_else(|| ControlError::NotFound(format!("deployment {deployment_id}")))?;
            check(entry)?;

            let record = &mut entry.record;
            match step.status {
                Some(to) => {
                    record.status = if step.cancellation {
                        lifecycle::validate_cancel(deployment_id, record.status)?
                    } else {
                        lifecycle::validate_transition(deployment_id, record.status, to)?
                    };
                    if to.is_terminal() {
                        record.finished_at = Some(now);
                    }
                }
                None if record.status.is_terminal() => {
                    return Err(ControlError::NotApplicable(format!(
                        "deployment {deployment_id} is {}",
                        lifecycle::label(record.status)
                    )));
                }
                None => {}
            }
            if let Some(progress) = step.progress {
                record.progress = progress.max(record.progress);
            }
            if step.url.is_some() {
                record.url = step.url;
            }
            if step.error.is_some() {
                record.error = step.error;
            }
            record.logs.push(DeployLogLine {
                at: now,
                status: record.status,
                progress: record.progress,
                message: step.message.clone(),
            });

            if let Err(e) = self.store().put_deployment(record) {
                tracing::error!(deployment_id = %deployment_id, error = %e, "Failed to persist deployment");
            }
            record.clone()
        };

        tracing::debug!(
            deployment_id = %deployment_id,
            status = lifecycle::label(snapshot.status),
            progress = snapshot.progress,
            "Deployment progress"
        );

        self.announce(
            snapshot.room_id,
            ServerEvent::DeploymentProgress {
                room_id: snapshot.room_id,
                deployment_id: *deployment_id,
                status: snapshot.status,
                progress: snapshot.progress,
                message: step.message,
                url: snapshot.url.clone(),
                error: snapshot.error.clone(),
                at: now,
            },
        );
        Ok(snapshot)
    }

    /// Append a log line without changing status or progress.
    ///
    /// Finished or cancelled deployments are left untouched.
    fn log(&self, deployment_id: &DeploymentId, message: &str) {
        let mut active = self.active.write();
        let Some(entry) = active.get_mut(deployment_id) else {
            return;
        };
        if entry.record.status.is_terminal() || entry.cancel.load(Ordering::SeqCst) {
            tracing::debug!(deployment_id = %deployment_id, "Dropping log line for finished deployment");
            return;
        }
        let record = &mut entry.record;
        record.logs.push(DeployLogLine {
            at: Utc::now(),
            status: record.status,
            progress: record.progress,
            message: message.to_string(),
        });
        if let Err(e) = self.store().put_deployment(record) {
            tracing::warn!(deployment_id = %deployment_id, error = %e, "Failed to persist deployment log");
        }
    }

    fn announce(&self, room_id: RoomId, event: ServerEvent) {
        self.presence.registry().broadcast_all(
            &[Topic::deploy(room_id), Topic::collab(room_id)],
            event,
            None,
        );
    }
}

fn check_cancel(cancel: &AtomicBool) -> std::result::Result<(), Halt> {
    if cancel.load(Ordering::SeqCst) {
        Err(Halt::Cancelled)
    } else {
        Ok(())
    }
}

/// The last `max` bytes of `text`, on a character boundary.
fn tail(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}
