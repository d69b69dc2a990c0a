//! Scripted transport for lifecycle tests

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::json;
use tokio::sync::watch;

use crate::ipc::{
    Connection, Endpoint, ErrorMessage, RpcMethods, Transport, TransportError, TransportOptions,
    methods,
};

/// What the next connection attempt does
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Plan {
    /// `connect` fails
    RefuseConnect,
    /// connects, every remote call fails
    RejectSubscribe,
    /// connects, then the reader reports the server went away
    DropAfterHandshake,
    /// connects, then the reader reports a local close
    CloseLocally,
    /// connects and stays up until [`MockTransport::close_connections`]
    WaitForClose,
}

struct Inner {
    plans: Mutex<VecDeque<Plan>>,
    attempts: AtomicU32,
    calls: Mutex<Vec<(String, serde_json::Value)>>,
    exposed: Mutex<Vec<Arc<dyn RpcMethods>>>,
    generation: watch::Sender<u64>,
}

#[derive(Clone)]
pub(crate) struct MockTransport {
    inner: Arc<Inner>,
}

impl MockTransport {
    pub(crate) fn new(plans: impl IntoIterator<Item = Plan>) -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                plans: Mutex::new(plans.into_iter().collect()),
                attempts: AtomicU32::new(0),
                calls: Mutex::new(Vec::new()),
                exposed: Mutex::new(Vec::new()),
                generation,
            }),
        }
    }

    pub(crate) fn connect_attempts(&self) -> u32 {
        self.inner.attempts.load(Ordering::SeqCst)
    }

    /// Remote calls made by every connection so far, in order
    pub(crate) fn calls(&self) -> Vec<(String, serde_json::Value)> {
        self.inner.calls.lock().expect("lock poisoned").clone()
    }

    /// Methods handed to each successful `connect`, in order
    pub(crate) fn exposed_methods(&self) -> Vec<Arc<dyn RpcMethods>> {
        self.inner.exposed.lock().expect("lock poisoned").clone()
    }

    /// Drop every connection currently open
    pub(crate) fn close_connections(&self) {
        self.inner.generation.send_modify(|generation| *generation += 1);
    }
}

impl Transport for MockTransport {
    type Connection = MockConnection;

    async fn connect(
        &self,
        endpoint: &Endpoint,
        exposed: Arc<dyn RpcMethods>,
        _options: &TransportOptions,
    ) -> Result<MockConnection, TransportError> {
        self.inner.attempts.fetch_add(1, Ordering::SeqCst);
        let plan = self
            .inner
            .plans
            .lock()
            .expect("lock poisoned")
            .pop_front()
            .unwrap_or(Plan::RefuseConnect);

        if plan == Plan::RefuseConnect {
            return Err(TransportError::Connect {
                endpoint: endpoint.to_string(),
                reason: "connection refused".to_owned(),
            });
        }

        self.inner.exposed.lock().expect("lock poisoned").push(exposed);

        Ok(MockConnection {
            plan,
            inner: self.inner.clone(),
            opened_at: *self.inner.generation.borrow(),
        })
    }
}

pub(crate) struct MockConnection {
    plan: Plan,
    inner: Arc<Inner>,
    opened_at: u64,
}

impl Connection for MockConnection {
    async fn call(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, TransportError> {
        self.inner
            .calls
            .lock()
            .expect("lock poisoned")
            .push((method.to_owned(), params));

        if self.plan == Plan::RejectSubscribe {
            return Err(TransportError::Remote {
                method: method.to_owned(),
                error: ErrorMessage::new(ErrorMessage::INVALID_PARAMS, "rejected"),
            });
        }
        match method {
            methods::SUBSCRIBE => Ok(json!({"subscribed": 1})),
            _ => Ok(serde_json::Value::Null),
        }
    }

    async fn wait_on_reader(&self) -> Result<(), TransportError> {
        match self.plan {
            Plan::CloseLocally | Plan::RefuseConnect | Plan::RejectSubscribe => Ok(()),
            Plan::DropAfterHandshake => Err(TransportError::ConnectionClosed(
                "server went away".to_owned(),
            )),
            Plan::WaitForClose => {
                let mut generation = self.inner.generation.subscribe();
                let opened_at = self.opened_at;
                // the sender lives in `inner`, which this connection keeps alive
                generation.wait_for(|current| *current > opened_at).await.ok();
                Err(TransportError::ConnectionClosed("closed by test".to_owned()))
            }
        }
    }
}
