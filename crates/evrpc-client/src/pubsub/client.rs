use anyhow::{Result, anyhow};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::hooks::{ConnectHookError, HookRegistry, connect_hook};
use super::methods::EventClientMethods;
use super::registry::{SubscriptionRegistry, topic_callback};
use super::retry::{RetryConfig, with_retry};
use super::state::ConnectionState;
use crate::ipc::{
    Connection, Endpoint, RpcMethods, SocketTransport, SubscribeMessage, Topic, Transport,
    TransportError, TransportOptions, methods,
};

/// RPC pub/sub client
///
/// Register topics, callbacks and connect hooks first, then start the client.
/// Every successful (re)connection issues one `subscribe` call carrying all
/// registered topics and then runs every connect hook concurrently. Failures
/// at any stage are retried under the configured [`RetryConfig`], which also
/// governs the very first connection attempt.
///
/// Once the client is running, further `subscribe` / `add_topic` calls are
/// ignored and return `false`.
///
/// ```no_run
/// # async fn example() -> anyhow::Result<()> {
/// use evrpc_client::pubsub::EventRpcClient;
///
/// let client = EventRpcClient::new().with_topics(["steel"]);
/// client.subscribe("guns", |data| async move {
///     log::info!("guns: {data}");
///     Ok(())
/// });
/// client.on_connect(|| async { Ok(()) });
/// client.run(&"unix:///tmp/evrpc-broker.sock".parse()?, true).await
/// # }
/// ```
pub struct EventRpcClient<T: Transport = SocketTransport> {
    transport: T,
    registry: SubscriptionRegistry,
    hooks: HookRegistry,
    methods: Arc<dyn RpcMethods>,
    retry: RetryConfig,
    options: TransportOptions,
    state: Arc<watch::Sender<ConnectionState>>,
}

impl EventRpcClient {
    pub fn new() -> Self {
        Self::with_transport(SocketTransport)
    }
}

impl Default for EventRpcClient {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Transport> EventRpcClient<T> {
    pub fn with_transport(transport: T) -> Self {
        let registry = SubscriptionRegistry::new();
        let (state, _) = watch::channel(ConnectionState::Disconnected);

        Self {
            transport,
            methods: Arc::new(EventClientMethods::new(registry.clone())),
            registry,
            hooks: HookRegistry::new(),
            retry: RetryConfig::default(),
            options: TransportOptions::default(),
            state: Arc::new(state),
        }
    }

    /// Topics subscribed without a local callback
    pub fn with_topics<I>(self, topics: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<Topic>,
    {
        for topic in topics {
            self.registry.add_topic(topic);
        }
        self
    }

    pub fn with_retry(mut self, retry: impl Into<RetryConfig>) -> Self {
        self.retry = retry.into();
        self
    }

    pub fn with_options(mut self, options: TransportOptions) -> Self {
        self.options = options;
        self
    }

    /// Replace the methods exposed to the broker
    ///
    /// `factory` receives the client's registry so the custom table can still
    /// route `notify` to [`SubscriptionRegistry::dispatch`], for instance by
    /// wrapping an [`EventClientMethods`].
    pub fn with_methods<F>(mut self, factory: F) -> Self
    where
        F: FnOnce(SubscriptionRegistry) -> Arc<dyn RpcMethods>,
    {
        self.methods = factory(self.registry.clone());
        self
    }

    /// Subscribe to `topic`; `callback` is awaited with each event payload
    ///
    /// Ignored (returns `false`) while the client is running. A topic
    /// registered twice keeps its first position and is sent to the broker
    /// once, the later callback replaces the earlier one.
    ///
    /// Events are delivered one at a time in the order the broker sent them,
    /// across all topics, so a slow callback holds back the events behind it.
    pub fn subscribe<F, Fut>(&self, topic: impl Into<Topic>, callback: F) -> bool
    where
        F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.registry.subscribe(topic, topic_callback(callback))
    }

    /// Subscribe to `topic` without a callback
    pub fn add_topic(&self, topic: impl Into<Topic>) -> bool {
        self.registry.add_topic(topic)
    }

    /// Run `hook` after every successful connection, reconnects included
    pub fn on_connect<F, Fut>(&self, hook: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.hooks.add(connect_hook(hook));
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    pub fn is_running(&self) -> bool {
        self.registry.is_running()
    }

    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Connect, subscribe and serve events, reconnecting under the retry policy
    ///
    /// With `wait_on_reader` the call only returns when the retry policy gives
    /// up (or the connection is closed locally). Without it, the call returns
    /// after the first handshake and the connection keeps serving events in a
    /// background task until the server drops it, without reconnecting.
    pub async fn run(&self, endpoint: &Endpoint, wait_on_reader: bool) -> Result<()> {
        let outcome = with_retry(&self.retry, || self.run_once(endpoint, wait_on_reader)).await;

        if let Err(e) = &outcome {
            self.state
                .send_replace(ConnectionState::Failed(format!("{e:#}")));
        }
        outcome
    }

    /// Blocking entry point driving [`Self::run`] on a current-thread runtime
    ///
    /// Must not be called from within an async context.
    pub fn start(&self, endpoint: &Endpoint) -> Result<()> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        runtime.block_on(self.run(endpoint, true))
    }

    /// Spawn the reconnecting client and return once the first handshake completes
    ///
    /// If the retry policy gives up before any handshake succeeds, its fault is
    /// returned instead.
    pub async fn start_background(self: Arc<Self>, endpoint: Endpoint) -> Result<ClientHandle> {
        self.state.send_replace(ConnectionState::Disconnected);
        let mut state = self.watch_state();

        let client = Arc::clone(&self);
        let mut task = tokio::spawn(async move { client.run(&endpoint, true).await });

        let connected = tokio::select! {
            settled = state.wait_for(ConnectionState::is_settled) => {
                settled.is_ok_and(|current| current.is_connected())
            }
            joined = &mut task => return Err(Self::stopped_early(joined)),
        };

        if connected {
            Ok(ClientHandle { task, state })
        } else {
            Err(Self::stopped_early(task.await))
        }
    }

    fn stopped_early(joined: Result<Result<()>, tokio::task::JoinError>) -> anyhow::Error {
        match joined {
            Ok(Err(e)) => e,
            Ok(Ok(())) => anyhow!("client stopped before connecting"),
            Err(e) => anyhow!("client task failed: {e}"),
        }
    }

    async fn run_once(&self, endpoint: &Endpoint, wait_on_reader: bool) -> Result<()> {
        log::info!("Trying to connect to {endpoint}");
        self.state.send_replace(ConnectionState::Connecting);

        let connection = match self
            .transport
            .connect(endpoint, self.methods.clone(), &self.options)
            .await
        {
            Ok(connection) => connection,
            Err(e) => {
                self.state.send_replace(ConnectionState::Disconnected);
                let e = anyhow::Error::from(e);
                Self::report_fault(&e);
                return Err(e);
            }
        };

        let session = Session::begin(&self.registry, &self.state);

        let served = async {
            self.on_connection(&connection, session.topics()).await?;
            self.state.send_replace(ConnectionState::Connected);
            if wait_on_reader {
                connection.wait_on_reader().await?;
            }
            Ok::<_, anyhow::Error>(())
        }
        .await;

        match served {
            Ok(()) if !wait_on_reader => {
                tokio::spawn(async move {
                    if let Err(e) = connection.wait_on_reader().await {
                        log::info!("Detached RPC connection ended: {e}");
                    }
                    drop(session);
                });
                Ok(())
            }
            Ok(()) => {
                log::info!("RPC connection to {endpoint} closed");
                Ok(())
            }
            Err(e) => {
                Self::report_fault(&e);
                Err(e)
            }
        }
    }

    async fn on_connection(&self, connection: &T::Connection, topics: &[Topic]) -> Result<()> {
        log::info!("Connected, subscribing to {} topics", topics.len());

        if !topics.is_empty() {
            let request = SubscribeMessage {
                topics: topics.to_vec(),
            };
            connection
                .call(methods::SUBSCRIBE, serde_json::to_value(request)?)
                .await?;
        }

        if !self.hooks.is_empty() {
            self.hooks.run_all().await?;
        }
        Ok(())
    }

    fn report_fault(e: &anyhow::Error) {
        match e.downcast_ref::<TransportError>() {
            Some(TransportError::ConnectionClosed(reason)) => {
                log::info!("RPC connection lost: {reason}");
            }
            Some(err) => log::warn!("RPC connection failed: {err}"),
            None if e.is::<ConnectHookError>() => log::warn!("RPC handshake failed: {e}"),
            None => log::error!("RPC uncaught error: {e:#}"),
        }
    }
}

/// One connected session; clears the running flag however it ends
struct Session {
    registry: SubscriptionRegistry,
    state: Arc<watch::Sender<ConnectionState>>,
    topics: Vec<Topic>,
}

impl Session {
    fn begin(registry: &SubscriptionRegistry, state: &Arc<watch::Sender<ConnectionState>>) -> Self {
        let topics = registry.freeze();
        state.send_replace(ConnectionState::Handshaking);
        Self {
            registry: registry.clone(),
            state: state.clone(),
            topics,
        }
    }

    fn topics(&self) -> &[Topic] {
        &self.topics
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.registry.thaw();
        self.state.send_if_modified(|state| {
            if matches!(state, ConnectionState::Failed(_)) {
                return false;
            }
            *state = ConnectionState::Disconnected;
            true
        });
    }
}

/// Handle to a client started with [`EventRpcClient::start_background`]
pub struct ClientHandle {
    task: JoinHandle<Result<()>>,
    state: watch::Receiver<ConnectionState>,
}

impl ClientHandle {
    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop reconnecting and drop the current connection
    pub fn abort(&self) {
        self.task.abort();
    }

    /// Wait for the client to stop, returning the fault the retry policy gave up on
    pub async fn join(self) -> Result<()> {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(e) if e.is_cancelled() => Ok(()),
            Err(e) => Err(anyhow!("client task failed: {e}")),
        }
    }
}
