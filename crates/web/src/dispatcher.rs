use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    Json,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use hook_relay_core::{
    config::Config,
    request::{
        BotRequest, SCHEDULER_GLOBAL_EVENT, SCHEDULER_INSTALLATION_EVENT,
        SCHEDULER_REPOSITORY_EVENT, TriggerType,
    },
};
use hook_relay_github::{InstallationLister, webhook};
use hook_relay_tasks::{
    BackgroundRequest, TaskEnqueuer,
    scheduled::{CronType, ScheduledRequest, parse_scheduled_request},
};
use serde_json::json;
use tracing::Instrument;

use crate::{AppState, registry::{HandlerEvent, HandlerRegistry}};

/// Scheduled fan-out enqueues in batches of this size; each successive batch
/// is delayed by the configured flow-control interval.
const FANOUT_BATCH_SIZE: usize = 30;

/// Terminal response for one dispatched request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub status: StatusCode,
    pub message: String,
}

impl Reply {
    fn ok(message: impl Into<String>) -> Self {
        Self { status: StatusCode::OK, message: message.into() }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self { status: StatusCode::BAD_REQUEST, message: message.into() }
    }

    fn internal_error(err: &anyhow::Error) -> Self {
        Self { status: StatusCode::INTERNAL_SERVER_ERROR, message: err.to_string() }
    }
}

impl IntoResponse for Reply {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "message": self.message }))).into_response()
    }
}

/// Routes each inbound request through signature verification, trigger
/// classification, and exactly one handling branch.
pub struct Dispatcher {
    config: Arc<Config>,
    webhook_secret: String,
    enqueuer: Arc<dyn TaskEnqueuer>,
    installations: Arc<dyn InstallationLister>,
    registry: HandlerRegistry,
}

impl Dispatcher {
    pub fn new(
        config: Arc<Config>,
        webhook_secret: String,
        enqueuer: Arc<dyn TaskEnqueuer>,
        installations: Arc<dyn InstallationLister>,
        registry: HandlerRegistry,
    ) -> Self {
        Self { config, webhook_secret, enqueuer, installations, registry }
    }

    pub async fn dispatch(&self, request: BotRequest) -> Reply {
        let span = tracing::info_span!(
            "dispatch",
            trigger = %request.trigger_type,
            event = %request.event_name,
            delivery = %request.github_delivery_id,
            trace = request.trace_id.as_deref().unwrap_or(""),
        );
        self.dispatch_inner(request).instrument(span).await
    }

    async fn dispatch_inner(&self, request: BotRequest) -> Reply {
        if !self.verify_signature(&request) {
            tracing::warn!("Invalid signature");
            return Reply::bad_request("Invalid signature");
        }
        let result = match request.trigger_type {
            TriggerType::Task => self.handle_task(&request).await,
            TriggerType::Scheduler => self.handle_scheduled(&request).await,
            TriggerType::Pubsub => self.handle_pubsub(&request).await,
            TriggerType::Github => self.handle_webhook(&request).await,
            TriggerType::Unknown => self.handle_unknown(&request).await,
        };
        match result {
            Ok(reply) => reply,
            Err(err) => {
                // Only treat the failure as final (alerting-eligible) once the
                // queue has exhausted retries for this event's category.
                let limit = self.config.retries.limit_for(&request.event_name);
                if request.task_retry_count >= limit {
                    tracing::error!("Request failed on final attempt: {err:?}");
                } else {
                    tracing::warn!(
                        "Request failed on attempt {} of {}, queue will retry: {err:?}",
                        request.task_retry_count,
                        limit
                    );
                }
                Reply::internal_error(&err)
            }
        }
    }

    fn verify_signature(&self, request: &BotRequest) -> bool {
        if self.config.bot.skip_verification {
            tracing::info!("Skipping signature verification due to configuration");
            return true;
        }
        let Some(signature) = &request.signature else {
            tracing::info!("Missing signature header");
            return false;
        };
        if request.raw_body.is_empty() {
            tracing::info!("Missing request body");
            return false;
        }
        webhook::verify(&self.webhook_secret, &request.raw_body, signature)
    }

    /// GitHub-origin events are re-dispatched through the queue so webhook
    /// latency stays decoupled from handler execution time.
    async fn handle_webhook(&self, request: &BotRequest) -> Result<Reply> {
        let body = str::from_utf8(&request.raw_body)
            .context("Webhook payload is not valid UTF-8")?
            .to_owned();
        self.enqueue(request, &request.event_name, body, None).await?;
        Ok(Reply::ok("Enqueued task"))
    }

    /// Queue-replayed events run the registered per-bot handler in process.
    async fn handle_task(&self, request: &BotRequest) -> Result<Reply> {
        let limit = self.config.retries.limit_for(&request.event_name);
        if request.task_retry_count > limit {
            tracing::info!("Too many retries: {} > {}", request.task_retry_count, limit);
            // Report success so the queue stops retrying.
            return Ok(Reply::ok("Too many retries"));
        }
        let payload =
            serde_json::from_slice(&request.raw_body).context("Task payload is not valid JSON")?;
        self.registry
            .invoke(HandlerEvent {
                event_name: request.event_name.clone(),
                delivery_id: request.github_delivery_id.clone(),
                payload,
            })
            .await?;
        Ok(Reply::ok("Executed"))
    }

    async fn handle_scheduled(&self, request: &BotRequest) -> Result<Reply> {
        let scheduled = parse_scheduled_request(&request.raw_body)?;
        match scheduled.cron_type {
            CronType::Global => {
                tracing::debug!("Enqueuing global scheduled task");
                let body = serde_json::to_string(&scheduled)?;
                self.enqueue(request, SCHEDULER_GLOBAL_EVENT, body, None).await?;
                Ok(Reply::ok("Enqueued global cron task"))
            }
            CronType::Installation => self.handle_scheduled_installation(request, scheduled).await,
            CronType::Repository => self.handle_scheduled_repository(request, scheduled).await,
        }
    }

    async fn handle_scheduled_installation(
        &self,
        request: &BotRequest,
        scheduled: ScheduledRequest,
    ) -> Result<Reply> {
        if scheduled.installation.is_some() {
            let body = serde_json::to_string(&scheduled)?;
            self.enqueue(request, SCHEDULER_INSTALLATION_EVENT, body, None).await?;
            return Ok(Reply::ok("Enqueued single installation cron task"));
        }
        tracing::debug!("Enqueuing per-installation scheduled tasks");
        let mut count = 0usize;
        for installation in self.installations.installations().await? {
            if installation.suspended {
                continue;
            }
            let payload = scheduled.clone().with_installation(&installation);
            let body = serde_json::to_string(&payload)?;
            self.enqueue(request, SCHEDULER_INSTALLATION_EVENT, body, None).await?;
            count += 1;
        }
        Ok(Reply::ok(format!("Enqueued {count} installation cron tasks")))
    }

    async fn handle_scheduled_repository(
        &self,
        request: &BotRequest,
        scheduled: ScheduledRequest,
    ) -> Result<Reply> {
        if scheduled.repo.is_some() {
            let body = serde_json::to_string(&scheduled)?;
            self.enqueue(request, SCHEDULER_REPOSITORY_EVENT, body, None).await?;
            return Ok(Reply::ok("Enqueued repository cron task"));
        }
        tracing::debug!("Enqueuing per-repository scheduled tasks");
        let mut count = 0usize;
        if let Some(installation) = &scheduled.installation {
            count = self.fan_out_repositories(request, &scheduled, installation.id).await?;
        } else {
            for installation in self.installations.installations().await? {
                if installation.suspended {
                    continue;
                }
                if let Some(allowed) = &scheduled.allowed_organizations
                    && let Some(org) = &installation.login
                    && !allowed.iter().any(|a| a.eq_ignore_ascii_case(org))
                {
                    tracing::info!("{org} is not allowed for this scheduler job, skipping");
                    continue;
                }
                let scoped = scheduled.clone().with_installation(&installation);
                count += self.fan_out_repositories(request, &scoped, installation.id).await?;
            }
        }
        Ok(Reply::ok(format!("Enqueued {count} repository cron tasks")))
    }

    async fn fan_out_repositories(
        &self,
        request: &BotRequest,
        scheduled: &ScheduledRequest,
        installation_id: u64,
    ) -> Result<usize> {
        let repositories = self.installations.installed_repositories(installation_id).await?;
        let mut count = 0usize;
        let mut delay = 0u64;
        for repository in &repositories {
            if repository.archived || repository.disabled {
                continue;
            }
            if count > 0 && count % FANOUT_BATCH_SIZE == 0 {
                delay += self.config.bot.flow_control_delay_in_seconds;
            }
            let payload = scheduled.clone().with_installed_repository(repository);
            let body = serde_json::to_string(&payload)?;
            self.enqueue(request, SCHEDULER_REPOSITORY_EVENT, body, (delay > 0).then_some(delay))
                .await?;
            count += 1;
        }
        Ok(count)
    }

    async fn handle_pubsub(&self, _request: &BotRequest) -> Result<Reply> {
        // Transition exists for completeness; pubsub payloads are not handled.
        tracing::warn!("Pub/Sub triggers are not supported");
        Ok(Reply::bad_request("Pub/Sub triggers are not supported"))
    }

    async fn handle_unknown(&self, request: &BotRequest) -> Result<Reply> {
        tracing::warn!("Unknown trigger type: {}", request.trigger_type);
        Ok(Reply::bad_request(format!("Unknown trigger type: {}", request.trigger_type)))
    }

    async fn enqueue(
        &self,
        request: &BotRequest,
        event_name: &str,
        body: String,
        delay_in_seconds: Option<u64>,
    ) -> Result<()> {
        self.enqueuer
            .enqueue(BackgroundRequest {
                id: request.github_delivery_id.clone(),
                event_name: event_name.to_owned(),
                body,
                target_environment: self.config.bot.target_environment,
                target_name: self.config.bot.target_name.clone(),
                delay_in_seconds,
            })
            .await
    }
}

/// Single method-agnostic endpoint. All trigger types arrive here.
pub async fn handle(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let request = BotRequest::parse(&headers, body);
    state.dispatcher.dispatch(request).await.into_response()
}
