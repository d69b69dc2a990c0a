use anyhow::Result;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::ipc::{BoxFuture, Topic};

/// Async callback awaited with the payload of every event on its topic
pub type TopicCallback =
    Arc<dyn Fn(serde_json::Value) -> BoxFuture<'static, Result<()>> + Send + Sync>;

pub fn topic_callback<F, Fut>(callback: F) -> TopicCallback
where
    F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |data| Box::pin(callback(data)))
}

#[derive(Default)]
struct Registry {
    /// subscription order, each topic once
    topics: Vec<Topic>,
    callbacks: HashMap<Topic, TopicCallback>,
    running: bool,
}

impl Registry {
    fn register(&mut self, topic: Topic, callback: Option<TopicCallback>) -> bool {
        if self.running {
            log::warn!("Ignoring registration of topic `{topic}` while the client is running");
            return false;
        }

        if !self.topics.contains(&topic) {
            self.topics.push(topic.clone());
        }
        if let Some(callback) = callback {
            self.callbacks.insert(topic, callback);
        }
        true
    }
}

/// Topics of interest and their callbacks
///
/// Registration is only accepted while the client is not running. The running
/// flag lives under the same lock as the topics, so a registration either
/// lands before a session snapshots the topics or is rejected.
#[derive(Clone, Default)]
pub struct SubscriptionRegistry {
    inner: Arc<RwLock<Registry>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to `topic` and await `callback` for each of its events
    ///
    /// Topics are kept once each, in first-registration order: subscribing to
    /// a topic again leaves its position unchanged and only replaces its
    /// callback, so the broker still receives it once. Returns `false`,
    /// leaving the registry untouched, when the client is running.
    pub fn subscribe(&self, topic: impl Into<Topic>, callback: TopicCallback) -> bool {
        self.write().register(topic.into(), Some(callback))
    }

    /// Subscribe to `topic` without a local callback; its events are dropped
    pub fn add_topic(&self, topic: impl Into<Topic>) -> bool {
        self.write().register(topic.into(), None)
    }

    pub fn topics(&self) -> Vec<Topic> {
        self.read().topics.clone()
    }

    pub fn has_callback(&self, topic: &Topic) -> bool {
        self.read().callbacks.contains_key(topic)
    }

    pub fn is_running(&self) -> bool {
        self.read().running
    }

    /// Await the callback registered for `topic` with `data`
    ///
    /// Returns whether a callback ran. Unknown topics are not an error.
    pub async fn dispatch(&self, topic: &Topic, data: serde_json::Value) -> Result<bool> {
        let callback = self.read().callbacks.get(topic).cloned();

        match callback {
            Some(callback) => {
                callback(data).await?;
                Ok(true)
            }
            None => {
                log::trace!("No callback registered for topic `{topic}`");
                Ok(false)
            }
        }
    }

    /// Mark the client running and return the topics to subscribe
    pub(crate) fn freeze(&self) -> Vec<Topic> {
        let mut registry = self.write();
        registry.running = true;
        registry.topics.clone()
    }

    pub(crate) fn thaw(&self) {
        self.write().running = false;
    }

    fn read(&self) -> RwLockReadGuard<'_, Registry> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Registry> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}
