use std::{env, fs::File, io::BufReader, path::Path};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub server: ServerConfig,
    pub bot: BotConfig,
    #[serde(default)]
    pub retries: RetryConfig,
    pub queue: QueueConfig,
    pub github: GitHubConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub port: u16,
}

/// Which deployment style hosts the worker that processes re-dispatched
/// events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetEnvironment {
    #[default]
    Functions,
    Run,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BotConfig {
    #[serde(default)]
    pub project_id: String,
    #[serde(default)]
    pub bot_name: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub target_environment: TargetEnvironment,
    /// Worker that enqueued tasks are delivered to. Defaults to the bot name.
    #[serde(default)]
    pub target_name: String,
    /// Delay added per fan-out batch to keep scheduled bursts off the queue.
    #[serde(default = "default_flow_control_delay")]
    pub flow_control_delay_in_seconds: u64,
    /// Accept unsigned payloads. Local/test use only.
    #[serde(default)]
    pub skip_verification: bool,
}

fn default_flow_control_delay() -> u64 { 30 }

/// Per trigger category ceilings for how many times the backing queue may
/// redeliver an event before failures are treated as final.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub max_cron_retries: u32,
    #[serde(default)]
    pub max_pubsub_retries: u32,
}

fn default_max_retries() -> u32 { 10 }

impl Default for RetryConfig {
    fn default() -> Self {
        Self { max_retries: default_max_retries(), max_cron_retries: 0, max_pubsub_retries: 0 }
    }
}

impl RetryConfig {
    /// Retry ceiling for an event, by name category.
    pub fn limit_for(&self, event_name: &str) -> u32 {
        if event_name.starts_with("schedule.") {
            self.max_cron_retries
        } else if event_name.starts_with("pubsub.") {
            self.max_pubsub_retries
        } else {
            self.max_retries
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueueConfig {
    /// Base URL of the push queue's REST API.
    pub base_url: String,
    #[serde(default)]
    pub auth_token: Option<String>,
    /// Base URL of the service-discovery API for `run` targets.
    #[serde(default)]
    pub resolver_url: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GitHubConfig {
    pub app: Option<GitHubAppConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GitHubAppConfig {
    pub id: u64,
    pub webhook_secret: String,
    pub private_key: String,
}

impl Config {
    pub fn load(path: &Path) -> Result<Config> {
        let file = BufReader::new(
            File::open(path).with_context(|| format!("Failed to open {}", path.display()))?,
        );
        let mut config: Config = serde_yaml::from_reader(file)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        config.resolve()?;
        Ok(config)
    }

    /// Fill deployment identity from the environment and reject incomplete
    /// configuration before anything starts serving.
    fn resolve(&mut self) -> Result<()> {
        let bot = &mut self.bot;
        fill_from_env(&mut bot.project_id, "PROJECT_ID");
        fill_from_env(&mut bot.bot_name, "BOT_NAME");
        fill_from_env(&mut bot.location, "BOT_LOCATION");
        if bot.project_id.is_empty() {
            bail!("Missing `bot.project_id`; set it in the config file or the PROJECT_ID env variable");
        }
        if bot.bot_name.is_empty() {
            bail!("Missing `bot.bot_name`; set it in the config file or the BOT_NAME env variable");
        }
        if bot.location.is_empty() {
            bail!("Missing `bot.location`; set it in the config file or the BOT_LOCATION env variable");
        }
        if bot.target_name.is_empty() {
            bot.target_name = bot.bot_name.clone();
        }
        if self.queue.base_url.is_empty() {
            bail!("Missing `queue.base_url`");
        }
        if bot.target_environment == TargetEnvironment::Run && self.queue.resolver_url.is_empty() {
            bail!("Missing `queue.resolver_url`; required when `bot.target_environment` is `run`");
        }
        Ok(())
    }
}

fn fill_from_env(value: &mut String, var: &str) {
    if value.is_empty()
        && let Ok(env_value) = env::var(var)
    {
        *value = env_value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> Config {
        let mut config: Config = serde_yaml::from_str(yaml).unwrap();
        config.resolve().unwrap();
        config
    }

    const BASE: &str = r#"
server:
  port: 8080
bot:
  project_id: test-project
  bot_name: merge_on_green
  location: us-central1
queue:
  base_url: https://tasks.example.com/v2
github:
  app:
    id: 12345
    webhook_secret: sekrit
    private_key: fake-pem
"#;

    #[test]
    fn defaults() {
        let config = parse(BASE);
        assert_eq!(config.bot.target_environment, TargetEnvironment::Functions);
        assert_eq!(config.bot.target_name, "merge_on_green");
        assert_eq!(config.bot.flow_control_delay_in_seconds, 30);
        assert!(!config.bot.skip_verification);
        assert_eq!(config.retries.max_retries, 10);
        assert_eq!(config.retries.max_cron_retries, 0);
        assert_eq!(config.retries.max_pubsub_retries, 0);
    }

    #[test]
    fn missing_project_id() {
        let mut config: Config =
            serde_yaml::from_str(&BASE.replace("project_id: test-project", "project_id: \"\""))
                .unwrap();
        let err = config.resolve().unwrap_err();
        assert!(err.to_string().contains("bot.project_id"), "{err}");
    }

    #[test]
    fn run_target_requires_resolver() {
        let yaml = BASE.replace(
            "location: us-central1",
            "location: us-central1\n  target_environment: run",
        );
        let mut config: Config = serde_yaml::from_str(&yaml).unwrap();
        let err = config.resolve().unwrap_err();
        assert!(err.to_string().contains("queue.resolver_url"), "{err}");
    }

    #[test]
    fn retry_limit_by_category() {
        let config = parse(BASE);
        assert_eq!(config.retries.limit_for("schedule.repository"), 0);
        assert_eq!(config.retries.limit_for("schedule.global"), 0);
        assert_eq!(config.retries.limit_for("pubsub.message"), 0);
        assert_eq!(config.retries.limit_for("issues"), 10);
        assert_eq!(config.retries.limit_for("pull_request"), 10);
    }
}
