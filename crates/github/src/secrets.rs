use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use hook_relay_core::config::Config;

/// Credentials for one bot's GitHub app.
#[derive(Debug, Clone)]
pub struct BotSecrets {
    pub app_id: u64,
    pub private_key: String,
    pub webhook_secret: String,
}

/// Source of bot credentials, keyed by bot name. Swappable so deployments can
/// load from a secret manager instead of the config file.
#[async_trait]
pub trait SecretLoader: Send + Sync {
    async fn load(&self, bot_name: &str) -> Result<BotSecrets>;
}

/// Loads secrets from the `github.app` section of the config file.
pub struct ConfigSecretLoader {
    config: Arc<Config>,
}

impl ConfigSecretLoader {
    pub fn new(config: Arc<Config>) -> Self { Self { config } }
}

#[async_trait]
impl SecretLoader for ConfigSecretLoader {
    async fn load(&self, bot_name: &str) -> Result<BotSecrets> {
        let app = self
            .config
            .github
            .app
            .as_ref()
            .with_context(|| format!("Missing `github.app` configuration for bot {bot_name}"))?;
        Ok(BotSecrets {
            app_id: app.id,
            private_key: app.private_key.clone(),
            webhook_secret: app.webhook_secret.clone(),
        })
    }
}
