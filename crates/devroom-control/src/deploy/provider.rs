//! Deploy providers.
//!
//! A provider takes a finished build output directory and makes it reachable,
//! returning the public URL. Providers are looked up by identifier when the
//! deploy stage starts, so an unknown identifier fails that stage like any
//! other provider error.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use devroom_core::{DeploymentId, ProjectId};
use serde::{Deserialize, Serialize};

use super::workspace::{self, ManifestEntry};
use crate::config::ControlConfig;
use crate::error::{ControlError, Result};

/// What a provider deploys.
#[derive(Debug, Clone, Copy)]
pub struct DeployContext<'a> {
    /// Deployment being run.
    pub deployment_id: DeploymentId,
    /// Project being deployed.
    pub project_id: ProjectId,
    /// Build output directory.
    pub output_dir: &'a Path,
}

/// A deployment target.
#[async_trait]
pub trait DeployProvider: Send + Sync {
    /// Identifier clients select the provider by.
    fn name(&self) -> &str;

    /// Publish the output directory and return its URL.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::Execution` if publishing fails.
    async fn deploy(&self, ctx: &DeployContext<'_>) -> Result<String>;
}

// ============================================================================
// Static
// ============================================================================

/// Copies build output below a directory served at a public base URL.
#[derive(Debug, Clone)]
pub struct StaticProvider {
    publish_root: PathBuf,
    base_url: String,
}

impl StaticProvider {
    /// Create a provider publishing into `publish_root`.
    #[must_use]
    pub fn new(publish_root: impl Into<PathBuf>, base_url: impl Into<String>) -> Self {
        Self {
            publish_root: publish_root.into(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl DeployProvider for StaticProvider {
    fn name(&self) -> &str {
        "static"
    }

    async fn deploy(&self, ctx: &DeployContext<'_>) -> Result<String> {
        let src = ctx.output_dir.to_path_buf();
        let dst = self.publish_root.join(ctx.deployment_id.to_string());

        let copied = tokio::task::spawn_blocking(move || workspace::copy_dir(&src, &dst))
            .await
            .map_err(|e| ControlError::Internal(format!("publish task failed: {e}")))?
            .map_err(|e| ControlError::Execution(format!("failed to publish output: {e}")))?;

        tracing::debug!(deployment_id = %ctx.deployment_id, files = copied, "Published static site");

        Ok(format!(
            "{}/{}/",
            self.base_url.trim_end_matches('/'),
            ctx.deployment_id
        ))
    }
}

// ============================================================================
// Webhook
// ============================================================================

/// Request body posted to the webhook.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WebhookRequest<'a> {
    deployment_id: DeploymentId,
    project_id: ProjectId,
    files: &'a [ManifestEntry],
}

#[derive(Debug, Deserialize)]
struct WebhookResponse {
    url: String,
}

/// Error body returned by the webhook.
#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
}

/// Announces the output manifest to an external deploy service.
#[derive(Debug, Clone)]
pub struct WebhookProvider {
    client: reqwest::Client,
    url: String,
}

impl WebhookProvider {
    /// Create a provider posting to `url`.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::Internal` if the HTTP client cannot be built.
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| ControlError::Internal(format!("failed to create HTTP client: {e}")))?;
        Ok(Self::with_client(client, url))
    }

    /// Create a provider with a custom reqwest client.
    #[must_use]
    pub fn with_client(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl DeployProvider for WebhookProvider {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn deploy(&self, ctx: &DeployContext<'_>) -> Result<String> {
        let dir = ctx.output_dir.to_path_buf();
        let files = tokio::task::spawn_blocking(move || workspace::manifest(&dir))
            .await
            .map_err(|e| ControlError::Internal(format!("manifest task failed: {e}")))?
            .map_err(|e| ControlError::Execution(format!("failed to read output: {e}")))?;

        let request = WebhookRequest {
            deployment_id: ctx.deployment_id,
            project_id: ctx.project_id,
            files: &files,
        };

        let response = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| ControlError::Execution(format!("webhook request failed: {e}")))?;

        if response.status().is_success() {
            let body = response
                .json::<WebhookResponse>()
                .await
                .map_err(|e| ControlError::Execution(format!("invalid webhook response: {e}")))?;
            tracing::debug!(deployment_id = %ctx.deployment_id, url = %body.url, "Webhook accepted deployment");
            Ok(body.url)
        } else {
            let status = response.status();
            let error = response
                .json::<ErrorResponse>()
                .await
                .map(|e| e.error)
                .unwrap_or_else(|_| format!("webhook returned status {status}"));

            tracing::error!(
                deployment_id = %ctx.deployment_id,
                status = %status,
                error = %error,
                "Webhook rejected deployment"
            );

            Err(ControlError::Execution(format!("webhook error: {error}")))
        }
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Providers by identifier.
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn DeployProvider>>,
}

impl ProviderRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in providers: `static`, and `webhook` when a URL is configured.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::Internal` if the webhook client cannot be built.
    pub fn from_config(config: &ControlConfig) -> Result<Self> {
        let mut registry = Self::new();
        registry.register(Arc::new(StaticProvider::new(
            &config.publish_root,
            &config.public_base_url,
        )));
        if let Some(url) = &config.webhook_url {
            registry.register(Arc::new(WebhookProvider::new(url)?));
        }
        Ok(registry)
    }

    /// Add or replace a provider.
    pub fn register(&mut self, provider: Arc<dyn DeployProvider>) {
        self.providers.insert(provider.name().to_string(), provider);
    }

    /// Look up a provider.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::Execution` for unknown identifiers.
    pub fn get(&self, name: &str) -> Result<Arc<dyn DeployProvider>> {
        self.providers
            .get(name)
            .cloned()
            .ok_or_else(|| ControlError::Execution(format!("unknown deploy provider: {name}")))
    }

    /// Registered identifiers, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.providers.keys().cloned().collect();
        names.sort();
        names
    }
}
