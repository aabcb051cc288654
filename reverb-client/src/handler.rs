//! Event handler abstraction and per-event handler registry.
//!
//! Handlers are shared trait objects so the same handler can be bound in
//! several places and later unbound by identity.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, error};

use reverb_core::error::ReverbError;
use reverb_socket::protocol;

/// Application callback for a received event.
///
/// `channel` is the channel the event arrived on, if any. Returning an error
/// never affects the connection; it is logged and reported as a
/// `ClientEvent::Error`.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &str, data: &Value, channel: Option<&str>) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> EventHandler for F
where
    F: Fn(String, Value, Option<String>) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn handle(&self, event: &str, data: &Value, channel: Option<&str>) -> anyhow::Result<()> {
        (self)(event.to_string(), data.clone(), channel.map(str::to_string)).await
    }
}

/// A bound handler. Clones compare equal, so keep one to `unbind` later.
#[derive(Clone)]
pub struct Handler(Arc<dyn EventHandler>);

impl Handler {
    pub fn new(handler: impl EventHandler + 'static) -> Self {
        Self(Arc::new(handler))
    }

    /// Wrap an async closure `(event, data, channel) -> anyhow::Result<()>`.
    pub fn from_fn<F, Fut>(f: F) -> Self
    where
        F: Fn(String, Value, Option<String>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self(Arc::new(f))
    }

    pub fn from_arc(handler: Arc<dyn EventHandler>) -> Self {
        Self(handler)
    }

    pub async fn call(&self, event: &str, data: &Value, channel: Option<&str>) -> anyhow::Result<()> {
        self.0.handle(event, data, channel).await
    }
}

impl PartialEq for Handler {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(
            Arc::as_ptr(&self.0) as *const (),
            Arc::as_ptr(&other.0) as *const (),
        )
    }
}

impl Eq for Handler {}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handler({:p})", Arc::as_ptr(&self.0) as *const ())
    }
}

/// Event name to handlers, in binding order.
#[derive(Default)]
pub struct HandlerMap {
    handlers: RwLock<HashMap<String, Vec<Handler>>>,
}

impl HandlerMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&self, event: &str, handler: Handler) {
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        handlers.entry(event.to_string()).or_default().push(handler);
    }

    /// Remove one handler, or every handler for `event` when `handler` is `None`.
    pub fn unbind(&self, event: &str, handler: Option<&Handler>) {
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        match handler {
            None => {
                handlers.remove(event);
            }
            Some(target) => {
                if let Some(bound) = handlers.get_mut(event) {
                    bound.retain(|h| h != target);
                    if bound.is_empty() {
                        handlers.remove(event);
                    }
                }
            }
        }
    }

    /// Handlers for `event` followed by wildcard handlers, cloned out of the lock.
    pub fn handlers_for(&self, event: &str) -> Vec<Handler> {
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
        let exact = handlers.get(event).into_iter().flatten();
        let wildcard = handlers.get(protocol::WILDCARD).into_iter().flatten();
        exact.chain(wildcard).cloned().collect()
    }

    pub fn len(&self) -> usize {
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
        handlers.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run every matching handler in order. A failing handler is logged and
    /// collected; the rest still run.
    pub async fn dispatch(
        &self,
        event: &str,
        data: &Value,
        channel: Option<&str>,
    ) -> Vec<ReverbError> {
        let handlers = self.handlers_for(event);
        if handlers.is_empty() {
            return Vec::new();
        }
        debug!(event, ?channel, count = handlers.len(), "dispatching to handlers");

        let mut errors = Vec::new();
        for handler in handlers {
            if let Err(e) = handler.call(event, data, channel).await {
                let location = channel.unwrap_or("global");
                error!("handler error for '{event}' on '{location}': {e:#}");
                errors.push(ReverbError::Handler(format!("'{event}' on '{location}': {e:#}")));
            }
        }
        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    fn recording(log: &Arc<Mutex<Vec<String>>>, tag: &'static str) -> Handler {
        let log = log.clone();
        Handler::from_fn(move |event: String, _data: Value, _channel: Option<String>| {
            let log = log.clone();
            async move {
                log.lock().unwrap().push(format!("{tag}:{event}"));
                Ok(())
            }
        })
    }

    #[tokio::test]
    async fn test_exact_handlers_run_before_wildcard() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let map = HandlerMap::new();
        map.bind("*", recording(&log, "wild"));
        map.bind("update", recording(&log, "first"));
        map.bind("update", recording(&log, "second"));

        let errors = map.dispatch("update", &json!({}), Some("orders")).await;
        assert!(errors.is_empty());
        assert_eq!(
            *log.lock().unwrap(),
            vec!["first:update", "second:update", "wild:update"]
        );
    }

    #[tokio::test]
    async fn test_failing_handler_does_not_stop_others() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let map = HandlerMap::new();
        map.bind(
            "update",
            Handler::from_fn(|_: String, _: Value, _: Option<String>| async {
                anyhow::bail!("boom")
            }),
        );
        map.bind("update", recording(&log, "after"));

        let errors = map.dispatch("update", &json!({}), None).await;
        assert_eq!(errors.len(), 1);
        assert!(errors[0].to_string().contains("boom"));
        assert_eq!(*log.lock().unwrap(), vec!["after:update"]);
    }

    #[tokio::test]
    async fn test_unbind_by_identity_and_by_event() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let map = HandlerMap::new();
        let keep = recording(&log, "keep");
        let drop = recording(&log, "drop");
        map.bind("update", keep.clone());
        map.bind("update", drop.clone());
        map.bind("other", recording(&log, "other"));

        map.unbind("update", Some(&drop));
        map.dispatch("update", &json!({}), None).await;
        assert_eq!(*log.lock().unwrap(), vec!["keep:update"]);

        map.unbind("other", None);
        assert_eq!(map.len(), 1);
        assert!(map.handlers_for("other").is_empty());
    }

    #[test]
    fn test_handler_identity() {
        let a = Handler::from_fn(|_: String, _: Value, _: Option<String>| async { Ok(()) });
        let b = Handler::from_fn(|_: String, _: Value, _: Option<String>| async { Ok(()) });
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
    }
}
