use std::fmt;

use axum::http::HeaderMap;
use bytes::Bytes;

/// Synthetic event names used for scheduled fan-out tasks.
pub const SCHEDULER_REPOSITORY_EVENT: &str = "schedule.repository";
pub const SCHEDULER_INSTALLATION_EVENT: &str = "schedule.installation";
pub const SCHEDULER_GLOBAL_EVENT: &str = "schedule.global";
pub const PUBSUB_EVENT: &str = "pubsub.message";

pub const SCHEDULER_EVENT_NAMES: [&str; 3] =
    [SCHEDULER_REPOSITORY_EVENT, SCHEDULER_INSTALLATION_EVENT, SCHEDULER_GLOBAL_EVENT];

/// Why an HTTP request arrived at the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TriggerType {
    Github,
    Task,
    Scheduler,
    Pubsub,
    Unknown,
}

impl fmt::Display for TriggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Github => "GitHub Webhook",
            Self::Task => "Task",
            Self::Scheduler => "Scheduler",
            Self::Pubsub => "Pub/Sub",
            Self::Unknown => "Unknown",
        })
    }
}

/// Normalized view of an inbound HTTP request, built once at the boundary.
#[derive(Debug, Clone)]
pub struct BotRequest {
    pub trigger_type: TriggerType,
    pub event_name: String,
    pub github_delivery_id: String,
    pub signature: Option<String>,
    /// Queue delivery marker; present only when the backing queue replayed
    /// this request.
    pub task_name: Option<String>,
    pub task_retry_count: u32,
    pub trace_id: Option<String>,
    /// Exact bytes received. Signature verification must run on these, not on
    /// a re-serialization.
    pub raw_body: Bytes,
}

impl BotRequest {
    pub fn parse(headers: &HeaderMap, raw_body: Bytes) -> Self {
        let event_name = header_str(headers, "X-GitHub-Event").unwrap_or_default().to_owned();
        let github_delivery_id =
            header_str(headers, "X-GitHub-Delivery").unwrap_or_default().to_owned();
        let signature = header_str(headers, "X-Hub-Signature-256")
            .or_else(|| header_str(headers, "X-Hub-Signature"))
            .map(str::to_owned);
        let task_name = header_str(headers, "X-CloudTasks-TaskName").map(str::to_owned);
        let task_retry_count = header_str(headers, "X-CloudTasks-TaskRetryCount")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let trigger_type = classify(&event_name, task_name.as_deref());
        let trace_id = parse_trace_id(headers);
        BotRequest {
            trigger_type,
            event_name,
            github_delivery_id,
            signature,
            task_name,
            task_retry_count,
            trace_id,
            raw_body,
        }
    }
}

/// Determine the trigger category for a request. Total over all header
/// combinations; every request maps to exactly one category.
fn classify(event_name: &str, task_name: Option<&str>) -> TriggerType {
    if task_name.is_none() && SCHEDULER_EVENT_NAMES.contains(&event_name) {
        TriggerType::Scheduler
    } else if task_name.is_none() && event_name == PUBSUB_EVENT {
        TriggerType::Pubsub
    } else if task_name.is_none() && !event_name.is_empty() {
        TriggerType::Github
    } else if !event_name.is_empty() {
        TriggerType::Task
    } else {
        TriggerType::Unknown
    }
}

/// The trace context header looks like `<trace-id>/<span-id>;o=<flags>`.
/// Only the trace id is useful for correlating logs.
fn parse_trace_id(headers: &HeaderMap) -> Option<String> {
    let context = header_str(headers, "X-Cloud-Trace-Context")?;
    let trace_id = context.split('/').next()?;
    (!trace_id.is_empty()).then(|| trace_id.to_owned())
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn test_classify() {
        let cases: &[(&str, Option<&str>, TriggerType)] = &[
            ("issues", None, TriggerType::Github),
            ("pull_request", None, TriggerType::Github),
            ("issues", Some("task-123"), TriggerType::Task),
            ("schedule.repository", None, TriggerType::Scheduler),
            ("schedule.installation", None, TriggerType::Scheduler),
            ("schedule.global", None, TriggerType::Scheduler),
            ("schedule.repository", Some("task-123"), TriggerType::Task),
            ("pubsub.message", None, TriggerType::Pubsub),
            ("pubsub.message", Some("task-123"), TriggerType::Task),
            ("", None, TriggerType::Unknown),
            ("", Some("task-123"), TriggerType::Unknown),
        ];
        for &(event_name, task_name, expected) in cases {
            assert_eq!(
                classify(event_name, task_name),
                expected,
                "event={event_name:?} task={task_name:?}"
            );
            // Classification is a pure function; repeating it can't change the answer.
            assert_eq!(classify(event_name, task_name), expected);
        }
    }

    #[test]
    fn parse_github_webhook() {
        let mut headers = HeaderMap::new();
        headers.insert("X-GitHub-Event", HeaderValue::from_static("issues"));
        headers.insert("X-GitHub-Delivery", HeaderValue::from_static("abc123"));
        headers.insert("X-Hub-Signature-256", HeaderValue::from_static("sha256=feedface"));
        let request = BotRequest::parse(&headers, Bytes::from_static(b"{}"));
        assert_eq!(request.trigger_type, TriggerType::Github);
        assert_eq!(request.event_name, "issues");
        assert_eq!(request.github_delivery_id, "abc123");
        assert_eq!(request.signature.as_deref(), Some("sha256=feedface"));
        assert_eq!(request.task_name, None);
        assert_eq!(request.task_retry_count, 0);
    }

    #[test]
    fn parse_task_replay() {
        let mut headers = HeaderMap::new();
        headers.insert("X-GitHub-Event", HeaderValue::from_static("issues"));
        headers.insert("X-GitHub-Delivery", HeaderValue::from_static("abc123"));
        headers.insert("X-CloudTasks-TaskName", HeaderValue::from_static("task-456"));
        headers.insert("X-CloudTasks-TaskRetryCount", HeaderValue::from_static("3"));
        let request = BotRequest::parse(&headers, Bytes::new());
        assert_eq!(request.trigger_type, TriggerType::Task);
        assert_eq!(request.task_name.as_deref(), Some("task-456"));
        assert_eq!(request.task_retry_count, 3);
    }

    #[test]
    fn parse_legacy_signature_header() {
        let mut headers = HeaderMap::new();
        headers.insert("X-GitHub-Event", HeaderValue::from_static("issues"));
        headers.insert("X-Hub-Signature", HeaderValue::from_static("sha1=deadbeef"));
        let request = BotRequest::parse(&headers, Bytes::new());
        assert_eq!(request.signature.as_deref(), Some("sha1=deadbeef"));
    }

    #[test]
    fn parse_trace_context() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "X-Cloud-Trace-Context",
            HeaderValue::from_static("105445aa7843bc8bf206b12000100000/1;o=1"),
        );
        let request = BotRequest::parse(&headers, Bytes::new());
        assert_eq!(request.trace_id.as_deref(), Some("105445aa7843bc8bf206b12000100000"));

        let request = BotRequest::parse(&HeaderMap::new(), Bytes::new());
        assert_eq!(request.trace_id, None);
    }

    #[test]
    fn bad_retry_count_defaults_to_zero() {
        let mut headers = HeaderMap::new();
        headers.insert("X-GitHub-Event", HeaderValue::from_static("issues"));
        headers.insert("X-CloudTasks-TaskName", HeaderValue::from_static("task-456"));
        headers.insert("X-CloudTasks-TaskRetryCount", HeaderValue::from_static("not-a-number"));
        let request = BotRequest::parse(&headers, Bytes::new());
        assert_eq!(request.task_retry_count, 0);
    }
}
