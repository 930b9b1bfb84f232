pub mod secrets;
pub mod webhook;

use anyhow::{Context, Result};
use async_trait::async_trait;
use octocrab::{Octocrab, models::InstallationId};
use serde::Deserialize;

use crate::secrets::BotSecrets;

/// One installation of the GitHub app.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppInstallation {
    pub id: u64,
    /// Installation target type, e.g. `Organization` or `User`.
    pub target_type: String,
    pub suspended: bool,
    /// Organization/user name the app is installed on.
    pub login: Option<String>,
}

/// One repository accessible to an app installation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledRepository {
    pub id: u64,
    pub archived: bool,
    pub disabled: bool,
    /// `<owner>/<repo>`
    pub full_name: String,
}

/// Collaborator seam for scheduled fan-out: enumerate app installations and
/// the repositories each one can reach.
#[async_trait]
pub trait InstallationLister: Send + Sync {
    async fn installations(&self) -> Result<Vec<AppInstallation>>;
    async fn installed_repositories(&self, installation_id: u64)
    -> Result<Vec<InstalledRepository>>;
}

/// GitHub app client authenticated with the app's private key.
#[derive(Clone)]
pub struct GitHub {
    pub app_client: Octocrab,
}

impl GitHub {
    pub fn new(secrets: &BotSecrets) -> Result<Self> {
        let app_client = Octocrab::builder()
            .app(
                secrets.app_id.into(),
                jsonwebtoken::EncodingKey::from_rsa_pem(secrets.private_key.as_bytes())
                    .context("Invalid app private key")?,
            )
            .build()
            .context("Failed to create GitHub app client")?;
        Ok(Self { app_client })
    }
}

#[derive(serde::Serialize)]
struct PageParams {
    per_page: u8,
    page: u32,
}

#[derive(Debug, Deserialize)]
struct RawInstallation {
    id: u64,
    #[serde(default)]
    target_type: Option<String>,
    #[serde(default)]
    suspended_at: Option<String>,
    #[serde(default)]
    account: Option<RawAccount>,
}

#[derive(Debug, Deserialize)]
struct RawAccount {
    login: String,
}

#[derive(Debug, Deserialize)]
struct InstallationRepositories {
    total_count: u64,
    repositories: Vec<RawRepository>,
}

#[derive(Debug, Deserialize)]
struct RawRepository {
    id: u64,
    full_name: String,
    #[serde(default)]
    archived: Option<bool>,
    #[serde(default)]
    disabled: Option<bool>,
}

const PER_PAGE: u8 = 100;

#[async_trait]
impl InstallationLister for GitHub {
    async fn installations(&self) -> Result<Vec<AppInstallation>> {
        let mut result = Vec::new();
        let mut page = 1;
        loop {
            let batch: Vec<RawInstallation> = self
                .app_client
                .get("/app/installations", Some(&PageParams { per_page: PER_PAGE, page }))
                .await
                .context("Failed to list app installations")?;
            let len = batch.len();
            result.extend(batch.into_iter().map(|raw| AppInstallation {
                id: raw.id,
                target_type: raw.target_type.unwrap_or_default(),
                suspended: raw.suspended_at.is_some(),
                login: raw.account.map(|a| a.login),
            }));
            if len < PER_PAGE as usize {
                break;
            }
            page += 1;
        }
        Ok(result)
    }

    async fn installed_repositories(
        &self,
        installation_id: u64,
    ) -> Result<Vec<InstalledRepository>> {
        let client = self
            .app_client
            .installation(InstallationId(installation_id))
            .context("Failed to create installation client")?;
        let mut page = 1;
        let mut response: InstallationRepositories = client
            .get("/installation/repositories", Some(&PageParams { per_page: PER_PAGE, page }))
            .await
            .context("Failed to list installation repositories")?;
        let mut repositories = map_repositories(response.repositories);
        while repositories.len() < response.total_count as usize {
            page += 1;
            response = client
                .get("/installation/repositories", Some(&PageParams { per_page: PER_PAGE, page }))
                .await
                .context("Failed to list installation repositories")?;
            if response.repositories.is_empty() {
                break;
            }
            repositories.extend(map_repositories(response.repositories));
        }
        Ok(repositories)
    }
}

fn map_repositories(raw: Vec<RawRepository>) -> Vec<InstalledRepository> {
    raw.into_iter()
        .map(|r| InstalledRepository {
            id: r.id,
            archived: r.archived.unwrap_or(false),
            disabled: r.disabled.unwrap_or(false),
            full_name: r.full_name,
        })
        .collect()
}
