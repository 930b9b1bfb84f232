use std::{collections::HashMap, future::Future, pin::Pin};

use anyhow::Result;
use serde_json::Value;

/// A replayed event delivered to a per-bot handler.
#[derive(Debug, Clone)]
pub struct HandlerEvent {
    pub event_name: String,
    pub delivery_id: String,
    pub payload: Value,
}

type BoxFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;
type Handler = Box<dyn Fn(HandlerEvent) -> BoxFuture + Send + Sync>;

/// Event name to handler map, populated once at startup.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Handler>,
}

impl HandlerRegistry {
    pub fn new() -> Self { Self::default() }

    /// Register a handler for an event name, replacing any existing one.
    pub fn on<F, Fut>(&mut self, event_name: &str, handler: F)
    where
        F: Fn(HandlerEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.handlers.insert(event_name.to_owned(), Box::new(move |event| Box::pin(handler(event))));
    }

    /// Invoke the handler registered for the event, if any. An unhandled
    /// event is a successful no-op; handler errors propagate to the caller.
    pub async fn invoke(&self, event: HandlerEvent) -> Result<()> {
        match self.handlers.get(&event.event_name) {
            Some(handler) => handler(event).await,
            None => {
                tracing::debug!("No handler registered for {}", event.event_name);
                Ok(())
            }
        }
    }

    pub fn is_empty(&self) -> bool { self.handlers.is_empty() }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use anyhow::bail;
    use serde_json::json;

    use super::*;

    fn event(name: &str) -> HandlerEvent {
        HandlerEvent {
            event_name: name.to_owned(),
            delivery_id: "abc123".to_owned(),
            payload: json!({"action": "opened"}),
        }
    }

    #[tokio::test]
    async fn invokes_registered_handler() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = HandlerRegistry::new();
        let counter = calls.clone();
        registry.on("issues", move |event| {
            let counter = counter.clone();
            async move {
                assert_eq!(event.payload["action"], "opened");
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        registry.invoke(event("issues")).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unhandled_event_is_a_no_op() {
        let registry = HandlerRegistry::new();
        registry.invoke(event("pull_request")).await.unwrap();
    }

    #[tokio::test]
    async fn handler_errors_propagate() {
        let mut registry = HandlerRegistry::new();
        registry.on("issues", |_event| async { bail!("handler failed") });
        let err = registry.invoke(event("issues")).await.unwrap_err();
        assert_eq!(err.to_string(), "handler failed");
    }
}
