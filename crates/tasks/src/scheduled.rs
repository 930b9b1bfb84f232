//! Decoded payload of a scheduler- or pubsub-originated trigger.

use anyhow::{Context, Result};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use hook_relay_github::{AppInstallation, InstalledRepository};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Scope of a scheduled job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CronType {
    #[default]
    Repository,
    Installation,
    Global,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Installation {
    pub id: u64,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
pub struct ScheduledRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installation: Option<Installation>,
    #[serde(default)]
    pub cron_type: CronType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron_org: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_organizations: Option<Vec<String>>,
    /// Fields passed through untouched into the fan-out payloads, including
    /// the synthetic `repository`/`organization` details added below.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// PubSub delivery wraps the payload in `{message: {data: <base64 JSON>}}`.
#[derive(Deserialize)]
struct Envelope {
    message: Option<EnvelopeMessage>,
}

#[derive(Deserialize)]
struct EnvelopeMessage {
    data: Option<String>,
}

/// Parse a scheduled request body, unwrapping a pubsub envelope if present.
pub fn parse_scheduled_request(raw_body: &[u8]) -> Result<ScheduledRequest> {
    if let Ok(Envelope { message: Some(EnvelopeMessage { data: Some(data) }) }) =
        serde_json::from_slice::<Envelope>(raw_body)
    {
        let decoded =
            BASE64.decode(data.as_bytes()).context("Invalid base64 in pubsub envelope")?;
        return serde_json::from_slice(&decoded).context("Invalid JSON in pubsub envelope");
    }
    serde_json::from_slice(raw_body).context("Invalid scheduled request body")
}

impl ScheduledRequest {
    /// Narrow the request to one app installation.
    pub fn with_installation(mut self, installation: &AppInstallation) -> Self {
        self.installation = Some(Installation { id: installation.id });
        if installation.target_type == "Organization"
            && let Some(login) = &installation.login
        {
            self.cron_org = Some(login.clone());
        }
        self
    }

    /// Narrow the request to one repository, adding webhook-shaped
    /// `repository`/`organization` details so handlers written against
    /// webhook payloads work unchanged.
    pub fn with_repository(mut self, full_name: &str) -> Self {
        let (org_name, repo_name) = full_name.split_once('/').unwrap_or((full_name, ""));
        self.extra.insert(
            "repository".to_owned(),
            json!({
                "name": repo_name,
                "full_name": full_name,
                "owner": { "login": org_name, "name": org_name },
            }),
        );
        self.extra.insert("organization".to_owned(), json!({ "login": org_name }));
        self
    }

    pub fn with_installed_repository(self, repository: &InstalledRepository) -> Self {
        self.with_repository(&repository.full_name)
    }
}
