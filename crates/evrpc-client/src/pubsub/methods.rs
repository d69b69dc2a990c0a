use anyhow::Result;
use serde_json::json;
use std::sync::{Mutex, PoisonError};
use tokio::sync::{mpsc, oneshot};

use super::registry::SubscriptionRegistry;
use crate::ipc::{BoxFuture, ErrorMessage, NotifyMessage, RpcMethods, Topic, methods};

type Delivery = (Topic, serde_json::Value, oneshot::Sender<Result<bool>>);

/// Methods the broker may call on a subscriber
///
/// `notify` events are queued in the order `call` receives them and handed to
/// their callbacks one at a time by a single dispatch task.
pub struct EventClientMethods {
    registry: SubscriptionRegistry,
    dispatcher: Mutex<Option<mpsc::UnboundedSender<Delivery>>>,
}

impl EventClientMethods {
    pub fn new(registry: SubscriptionRegistry) -> Self {
        Self {
            registry,
            dispatcher: Mutex::new(None),
        }
    }

    /// Queue `delivery` behind earlier events, starting the dispatch task on
    /// first use and again if its runtime went away
    fn enqueue(&self, delivery: Delivery) {
        let mut dispatcher = self.dispatcher.lock().unwrap_or_else(PoisonError::into_inner);

        let delivery = match dispatcher.as_ref() {
            Some(sender) => match sender.send(delivery) {
                Ok(()) => return,
                Err(mpsc::error::SendError(delivery)) => delivery,
            },
            None => delivery,
        };

        let (sender, receiver) = mpsc::unbounded_channel();
        tokio::spawn(Self::dispatch_in_order(self.registry.clone(), receiver));
        if sender.send(delivery).is_err() {
            log::warn!("Event dispatch task stopped before its first event");
        }
        *dispatcher = Some(sender);
    }

    async fn dispatch_in_order(
        registry: SubscriptionRegistry,
        mut receiver: mpsc::UnboundedReceiver<Delivery>,
    ) {
        while let Some((topic, data, reply)) = receiver.recv().await {
            let outcome = registry.dispatch(&topic, data).await;
            if reply.send(outcome).is_err() {
                log::trace!("Nobody awaits the outcome of the event on `{topic}`");
            }
        }
    }

    fn notify(
        &self,
        params: serde_json::Value,
    ) -> BoxFuture<'static, Result<serde_json::Value, ErrorMessage>> {
        let notify: NotifyMessage = match serde_json::from_value(params) {
            Ok(notify) => notify,
            Err(e) => {
                let error = ErrorMessage::new(ErrorMessage::INVALID_PARAMS, e.to_string());
                return Box::pin(std::future::ready(Err(error)));
            }
        };
        let topic = notify.subscription.topic;
        log::debug!("Event received on topic `{topic}`");

        let (reply, outcome) = oneshot::channel();
        self.enqueue((topic.clone(), notify.data, reply));

        Box::pin(async move {
            let dispatched = outcome
                .await
                .map_err(|_| {
                    ErrorMessage::new(
                        ErrorMessage::HANDLER_FAILED,
                        format!("event on `{topic}` dropped, dispatch task stopped"),
                    )
                })?
                .map_err(|e| {
                    ErrorMessage::new(
                        ErrorMessage::HANDLER_FAILED,
                        format!("callback for `{topic}` failed: {e:#}"),
                    )
                })?;
            Ok(json!({ "dispatched": dispatched }))
        })
    }
}

impl RpcMethods for EventClientMethods {
    fn call(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> BoxFuture<'static, Result<serde_json::Value, ErrorMessage>> {
        match method {
            methods::NOTIFY => self.notify(params),
            methods::PING => Box::pin(std::future::ready(Ok(json!("pong")))),
            other => {
                let error = ErrorMessage::new(
                    ErrorMessage::METHOD_NOT_FOUND,
                    format!("unknown method `{other}`"),
                );
                Box::pin(std::future::ready(Err(error)))
            }
        }
    }
}
