use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use hook_relay_core::config::{QueueConfig, TargetEnvironment};
use serde::Deserialize;
use serde_json::json;
use time::{OffsetDateTime, format_description::well_known::Rfc3339};
use tokio::sync::Mutex;

use crate::{BackgroundRequest, TaskEnqueuer};

/// Signs a payload so the replayed request passes webhook verification.
pub type PayloadSigner = Arc<dyn Fn(&[u8]) -> String + Send + Sync>;

/// Upper bound on how long a queued task stays deliverable.
const MAX_DISPATCH_DEADLINE: Duration = Duration::from_secs(60 * 30);

/// Fully-resolved task handed to the queue service.
#[derive(Debug, Clone)]
pub struct QueueTask {
    /// `projects/{project}/locations/{location}/queues/{queue}`
    pub queue_path: String,
    /// Worker URL the queue will POST to.
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    pub dispatch_deadline: Option<Duration>,
    pub schedule_time: OffsetDateTime,
}

/// The push queue service: accepts a task for later HTTP delivery.
#[async_trait]
pub trait QueueClient: Send + Sync {
    async fn create_task(&self, task: QueueTask) -> Result<()>;
}

/// Service discovery for `run` targets: logical service name to URL.
#[async_trait]
pub trait ServiceResolver: Send + Sync {
    async fn resolve(&self, service_name: &str) -> Result<Option<String>>;
}

/// Enqueues background work onto the external push queue.
pub struct QueueTaskEnqueuer {
    project_id: String,
    bot_name: String,
    location: String,
    queue: Arc<dyn QueueClient>,
    resolver: Arc<dyn ServiceResolver>,
    sign_payload: PayloadSigner,
    /// Resolved `run` URLs per target name. Never invalidated; instances are
    /// short-lived and staleness is accepted.
    resolved_urls: Mutex<HashMap<String, String>>,
}

impl QueueTaskEnqueuer {
    pub fn new(
        project_id: String,
        bot_name: String,
        location: String,
        queue: Arc<dyn QueueClient>,
        resolver: Arc<dyn ServiceResolver>,
        sign_payload: PayloadSigner,
    ) -> Self {
        Self {
            project_id,
            bot_name,
            location,
            queue,
            resolver,
            sign_payload,
            resolved_urls: Mutex::new(HashMap::new()),
        }
    }

    async fn task_target(&self, request: &BackgroundRequest) -> Result<String> {
        match request.target_environment {
            TargetEnvironment::Functions => Ok(format!(
                "https://{}-{}.cloudfunctions.net/{}",
                self.location, self.project_id, request.target_name
            )),
            TargetEnvironment::Run => {
                {
                    let cache = self.resolved_urls.lock().await;
                    if let Some(url) = cache.get(&request.target_name) {
                        return Ok(url.clone());
                    }
                }
                let service_name = sanitize_name(&request.target_name);
                // A missing service is a deployment misconfiguration. Failing
                // loudly beats silently dropping a webhook event.
                let url = self
                    .resolver
                    .resolve(&service_name)
                    .await?
                    .with_context(|| format!("Unable to find URL for service {service_name}"))?;
                self.resolved_urls.lock().await.insert(request.target_name.clone(), url.clone());
                Ok(url)
            }
        }
    }
}

#[async_trait]
impl TaskEnqueuer for QueueTaskEnqueuer {
    async fn enqueue(&self, request: BackgroundRequest) -> Result<()> {
        tracing::info!(
            environment = ?request.target_environment,
            service = %request.target_name,
            event = %request.event_name,
            "scheduling task"
        );
        let queue_name = sanitize_name(&self.bot_name);
        let queue_path = format!(
            "projects/{}/locations/{}/queues/{}",
            self.project_id, self.location, queue_name
        );
        let url = self.task_target(&request).await?;
        let delay = request.delay_in_seconds.unwrap_or(0);
        let signature = (self.sign_payload)(request.body.as_bytes());
        let headers = vec![
            ("X-GitHub-Event".to_owned(), request.event_name.clone()),
            ("X-GitHub-Delivery".to_owned(), request.id.clone()),
            ("X-Hub-Signature-256".to_owned(), signature),
            ("Content-Type".to_owned(), "application/json".to_owned()),
        ];
        let body = (!request.body.is_empty()).then(|| request.body.into_bytes());
        // Bound worst-case queue residency for tasks that carry a payload.
        let dispatch_deadline = body.is_some().then_some(MAX_DISPATCH_DEADLINE);
        let schedule_time = OffsetDateTime::now_utc() + time::Duration::seconds(delay as i64);
        tracing::info!("scheduling task in queue {queue_name}");
        self.queue
            .create_task(QueueTask {
                queue_path,
                url,
                headers,
                body,
                dispatch_deadline,
                schedule_time,
            })
            .await
    }
}

/// Queue and service names may contain only letters, numbers, and hyphens.
fn sanitize_name(name: &str) -> String { name.replace('_', "-") }

/// REST client for the push queue service.
pub struct HttpQueueClient {
    client: reqwest::Client,
    base_url: String,
    auth_token: Option<String>,
}

impl HttpQueueClient {
    pub fn new(config: &QueueConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_owned(),
            auth_token: config.auth_token.clone(),
        }
    }
}

#[async_trait]
impl QueueClient for HttpQueueClient {
    async fn create_task(&self, task: QueueTask) -> Result<()> {
        let url = format!("{}/{}/tasks", self.base_url, task.queue_path);
        let mut headers = serde_json::Map::new();
        for (name, value) in &task.headers {
            headers.insert(name.clone(), json!(value));
        }
        let mut body = json!({
            "scheduleTime": task.schedule_time.format(&Rfc3339)?,
            "httpRequest": {
                "httpMethod": "POST",
                "url": task.url,
                "headers": headers,
            },
        });
        if let Some(payload) = &task.body {
            body["httpRequest"]["body"] = json!(BASE64.encode(payload));
        }
        if let Some(deadline) = task.dispatch_deadline {
            body["dispatchDeadline"] = json!(format!("{}s", deadline.as_secs()));
        }
        let mut request = self.client.post(&url).json(&json!({ "task": body }));
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await.context("Failed to reach task queue")?;
        response.error_for_status().context("Task queue rejected task")?;
        Ok(())
    }
}

/// REST client for the container service-discovery API.
pub struct HttpServiceResolver {
    client: reqwest::Client,
    base_url: String,
    project_id: String,
    location: String,
    auth_token: Option<String>,
}

impl HttpServiceResolver {
    pub fn new(config: &QueueConfig, project_id: String, location: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: config.resolver_url.trim_end_matches('/').to_owned(),
            project_id,
            location,
            auth_token: config.auth_token.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ServiceInfo {
    #[serde(default)]
    uri: Option<String>,
}

#[async_trait]
impl ServiceResolver for HttpServiceResolver {
    async fn resolve(&self, service_name: &str) -> Result<Option<String>> {
        let url = format!(
            "{}/projects/{}/locations/{}/services/{}",
            self.base_url, self.project_id, self.location, service_name
        );
        let mut request = self.client.get(&url);
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await.context("Failed to reach service resolver")?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let info: ServiceInfo = response
            .error_for_status()
            .context("Service resolver request failed")?
            .json()
            .await
            .context("Invalid service resolver response")?;
        Ok(info.uri)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use hook_relay_github::webhook;

    use super::*;

    const SECRET: &str = "test-secret";

    #[derive(Default)]
    struct RecordingQueue {
        tasks: std::sync::Mutex<Vec<QueueTask>>,
    }

    #[async_trait]
    impl QueueClient for RecordingQueue {
        async fn create_task(&self, task: QueueTask) -> Result<()> {
            self.tasks.lock().unwrap().push(task);
            Ok(())
        }
    }

    struct StaticResolver {
        url: Option<String>,
        calls: AtomicUsize,
    }

    impl StaticResolver {
        fn new(url: Option<&str>) -> Self {
            Self { url: url.map(str::to_owned), calls: AtomicUsize::new(0) }
        }
    }

    #[async_trait]
    impl ServiceResolver for StaticResolver {
        async fn resolve(&self, _service_name: &str) -> Result<Option<String>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.url.clone())
        }
    }

    fn enqueuer(
        queue: Arc<RecordingQueue>,
        resolver: Arc<StaticResolver>,
    ) -> QueueTaskEnqueuer {
        QueueTaskEnqueuer::new(
            "test-project".to_owned(),
            "merge_on_green".to_owned(),
            "us-central1".to_owned(),
            queue,
            resolver,
            Arc::new(|body| webhook::sign(SECRET, body)),
        )
    }

    fn request(environment: TargetEnvironment) -> BackgroundRequest {
        BackgroundRequest {
            id: "abc123".to_owned(),
            event_name: "issues".to_owned(),
            body: r#"{"action":"opened"}"#.to_owned(),
            target_environment: environment,
            target_name: "merge_on_green".to_owned(),
            delay_in_seconds: None,
        }
    }

    fn header<'a>(task: &'a QueueTask, name: &str) -> &'a str {
        task.headers.iter().find(|(n, _)| n == name).map(|(_, v)| v.as_str()).unwrap()
    }

    #[tokio::test]
    async fn functions_target() {
        let queue = Arc::new(RecordingQueue::default());
        let resolver = Arc::new(StaticResolver::new(None));
        let enqueuer = enqueuer(queue.clone(), resolver.clone());

        enqueuer.enqueue(request(TargetEnvironment::Functions)).await.unwrap();

        let tasks = queue.tasks.lock().unwrap();
        assert_eq!(tasks.len(), 1);
        let task = &tasks[0];
        assert_eq!(task.url, "https://us-central1-test-project.cloudfunctions.net/merge_on_green");
        // Queue names may not contain underscores.
        assert_eq!(
            task.queue_path,
            "projects/test-project/locations/us-central1/queues/merge-on-green"
        );
        assert_eq!(header(task, "X-GitHub-Event"), "issues");
        assert_eq!(header(task, "X-GitHub-Delivery"), "abc123");
        assert_eq!(task.dispatch_deadline, Some(MAX_DISPATCH_DEADLINE));
        // Functions targets never hit the resolver.
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn replayed_payload_verifies() {
        let queue = Arc::new(RecordingQueue::default());
        let resolver = Arc::new(StaticResolver::new(None));
        let enqueuer = enqueuer(queue.clone(), resolver);

        enqueuer.enqueue(request(TargetEnvironment::Functions)).await.unwrap();

        let tasks = queue.tasks.lock().unwrap();
        let task = &tasks[0];
        let body = task.body.as_deref().unwrap();
        assert!(webhook::verify(SECRET, body, header(task, "X-Hub-Signature-256")));
    }

    #[tokio::test]
    async fn run_target_resolution_is_cached() {
        let queue = Arc::new(RecordingQueue::default());
        let resolver = Arc::new(StaticResolver::new(Some("https://bot.example.run")));
        let enqueuer = enqueuer(queue.clone(), resolver.clone());

        enqueuer.enqueue(request(TargetEnvironment::Run)).await.unwrap();
        enqueuer.enqueue(request(TargetEnvironment::Run)).await.unwrap();

        let tasks = queue.tasks.lock().unwrap();
        assert_eq!(tasks.len(), 2);
        assert!(tasks.iter().all(|t| t.url == "https://bot.example.run"));
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn run_target_unresolvable_is_an_error() {
        let queue = Arc::new(RecordingQueue::default());
        let resolver = Arc::new(StaticResolver::new(None));
        let enqueuer = enqueuer(queue.clone(), resolver);

        let err = enqueuer.enqueue(request(TargetEnvironment::Run)).await.unwrap_err();
        assert!(err.to_string().contains("Unable to find URL"), "{err}");
        assert!(queue.tasks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_body_has_no_deadline() {
        let queue = Arc::new(RecordingQueue::default());
        let resolver = Arc::new(StaticResolver::new(None));
        let enqueuer = enqueuer(queue.clone(), resolver);

        let mut request = request(TargetEnvironment::Functions);
        request.body = String::new();
        enqueuer.enqueue(request).await.unwrap();

        let tasks = queue.tasks.lock().unwrap();
        assert_eq!(tasks[0].body, None);
        assert_eq!(tasks[0].dispatch_deadline, None);
    }

    #[tokio::test]
    async fn delay_pushes_schedule_time_forward() {
        let queue = Arc::new(RecordingQueue::default());
        let resolver = Arc::new(StaticResolver::new(None));
        let enqueuer = enqueuer(queue.clone(), resolver);

        let mut request = request(TargetEnvironment::Functions);
        request.delay_in_seconds = Some(60);
        let before = OffsetDateTime::now_utc();
        enqueuer.enqueue(request).await.unwrap();

        let tasks = queue.tasks.lock().unwrap();
        assert!(tasks[0].schedule_time >= before + time::Duration::seconds(59));
    }

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("merge_on_green"), "merge-on-green");
        assert_eq!(sanitize_name("no-underscores"), "no-underscores");
    }
}
