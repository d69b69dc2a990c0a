use anyhow::{Context as _, Result, anyhow};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::sync::{RwLock, broadcast, mpsc};
use tokio::task::{AbortHandle, JoinHandle};

use crate::ipc::endpoint::{RpcListener, RpcStream};
use crate::ipc::{
    Endpoint, ErrorMessage, FrameBuffer, HelloMessage, NotifyMessage, PublishMessage,
    PublishResult, RpcCodec, RpcEnvelope, RpcKind, SubscribeMessage, SubscribeResult, Topic,
    methods,
};

struct ClientEntry {
    topics: HashSet<Topic>,
    outbound: mpsc::UnboundedSender<RpcEnvelope>,
}

type Clients = Arc<RwLock<BTreeMap<u64, ClientEntry>>>;

#[derive(Clone)]
struct Shared {
    name: Arc<str>,
    clients: Clients,
    kick: broadcast::Sender<()>,
}

/// Topic broker
/// Accepts subscriber connections and fans `notify` calls out to them
pub struct Broker {
    shared: Shared,
    endpoint: Endpoint,
    listener: Option<RpcListener>,
    accept_loop: Option<AbortHandle>,
    next_id: Arc<AtomicU64>,
}

impl Broker {
    pub const DEFAULT_NAME: &'static str = "evrpc-broker";

    /// Bind `endpoint`; a stale unix socket file is replaced
    pub async fn bind(endpoint: &Endpoint) -> Result<Self> {
        let listener = endpoint
            .bind()
            .await
            .with_context(|| format!("Failed to bind {endpoint}"))?;
        let endpoint = listener
            .local_endpoint()
            .with_context(|| format!("Failed to resolve bound address of {endpoint}"))?;

        let (kick, _) = broadcast::channel(16);

        Ok(Self {
            shared: Shared {
                name: Arc::from(Self::DEFAULT_NAME),
                clients: Clients::default(),
                kick,
            },
            endpoint,
            listener: Some(listener),
            accept_loop: None,
            next_id: Arc::new(AtomicU64::new(1)),
        })
    }

    /// Name announced in the hello reply
    #[must_use]
    pub fn with_name(mut self, name: &str) -> Self {
        self.shared.name = Arc::from(name);
        self
    }

    /// Address clients should connect to
    pub fn local_endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// 启动接收循环
    pub fn start(&mut self) -> Result<JoinHandle<()>> {
        let listener = self
            .listener
            .take()
            .ok_or_else(|| anyhow!("Broker on {} already started", self.endpoint))?;

        let shared = self.shared.clone();
        let next_id = self.next_id.clone();

        log::info!("Broker listening on {}", self.endpoint);

        let handle = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok(stream) => {
                        let client_id = next_id.fetch_add(1, Ordering::Relaxed);
                        let shared = shared.clone();

                        tokio::spawn(async move {
                            if let Err(e) = Self::handle_client(client_id, stream, shared).await {
                                log::error!("Client {client_id} handler error: {e:#}");
                            }
                        });
                    }
                    Err(e) => {
                        log::error!("Failed to accept connection: {e}");
                        break;
                    }
                }
            }
        });

        self.accept_loop = Some(handle.abort_handle());
        Ok(handle)
    }

    /// Notify every client subscribed to `topic`, returns how many were reached
    pub async fn publish(&self, topic: &Topic, data: serde_json::Value) -> usize {
        Self::fan_out(&self.shared.clients, topic, data).await
    }

    /// Drop every client connection; the listener keeps accepting
    pub fn disconnect_all(&self) {
        match self.shared.kick.send(()) {
            Ok(n) => log::info!("Disconnecting {n} client(s)"),
            Err(_) => log::debug!("No clients to disconnect"),
        }
    }

    pub async fn client_count(&self) -> usize {
        self.shared.clients.read().await.len()
    }

    async fn fan_out(clients: &Clients, topic: &Topic, data: serde_json::Value) -> usize {
        let notify = match serde_json::to_value(NotifyMessage::new(topic.clone(), data)) {
            Ok(notify) => notify,
            Err(e) => {
                log::error!("Failed to encode event for `{topic}`: {e}");
                return 0;
            }
        };

        let clients = clients.read().await;
        let delivered = clients
            .values()
            .filter(|client| client.topics.contains(topic))
            .filter(|client| {
                client
                    .outbound
                    .send(RpcEnvelope::request(methods::NOTIFY, notify.clone()))
                    .is_ok()
            })
            .count();

        log::debug!("Event on `{topic}` delivered to {delivered} subscriber(s)");
        delivered
    }

    async fn handle_client(
        client_id: u64,
        mut stream: Box<dyn RpcStream>,
        shared: Shared,
    ) -> Result<()> {
        log::info!("Client {client_id} connected");

        let (outbound, mut outbound_receiver) = mpsc::unbounded_channel();
        let mut kick_receiver = shared.kick.subscribe();
        shared.clients.write().await.insert(
            client_id,
            ClientEntry {
                topics: HashSet::new(),
                outbound,
            },
        );

        let outcome = Self::serve(
            client_id,
            &mut stream,
            &shared,
            &mut outbound_receiver,
            &mut kick_receiver,
        )
        .await;

        shared.clients.write().await.remove(&client_id);
        if let Err(e) = stream.shutdown().await {
            log::trace!("Failed to shut down client {client_id} stream: {e}");
        }

        log::info!("Client {client_id} handler finished");
        outcome
    }

    async fn serve(
        client_id: u64,
        stream: &mut Box<dyn RpcStream>,
        shared: &Shared,
        outbound_receiver: &mut mpsc::UnboundedReceiver<RpcEnvelope>,
        kick_receiver: &mut broadcast::Receiver<()>,
    ) -> Result<()> {
        let mut buffer = FrameBuffer::new();
        let mut read_buf = vec![0u8; 4096];

        loop {
            tokio::select! {
                result = stream.read(&mut read_buf) => {
                    match result {
                        Ok(0) => {
                            log::info!("Client {client_id} disconnected");
                            return Ok(());
                        }
                        Ok(n) => {
                            buffer.push(&read_buf[0..n]);

                            while let Some(envelope) = buffer.try_decode()? {
                                Self::process_message(client_id, envelope, stream, shared).await?;
                            }
                        }
                        Err(e) => {
                            log::error!("Failed to read from client {client_id}: {e}");
                            return Ok(());
                        }
                    }
                }

                Some(envelope) = outbound_receiver.recv() => {
                    Self::send_message(stream, &envelope).await?;
                }

                _ = kick_receiver.recv() => {
                    log::info!("Dropping client {client_id}");
                    return Ok(());
                }
            }
        }
    }

    async fn process_message(
        client_id: u64,
        envelope: RpcEnvelope,
        stream: &mut Box<dyn RpcStream>,
        shared: &Shared,
    ) -> Result<()> {
        match envelope.kind {
            RpcKind::Hello => {
                let hello: HelloMessage = serde_json::from_value(envelope.msg)
                    .context("Malformed Hello from client")?;
                log::info!(
                    "Hello from client {client_id} ({})",
                    hello.client_info.as_deref().unwrap_or("anonymous")
                );

                let response = RpcEnvelope::new_with_uuid(
                    RpcKind::Hello,
                    serde_json::to_value(HelloMessage::server(&shared.name))?,
                    envelope.uuid,
                );
                Self::send_message(stream, &response).await
            }
            RpcKind::Request(method) => {
                log::debug!(
                    "Received `{method}` from client {client_id}, uuid: {}",
                    envelope.uuid
                );

                let outcome = Self::handle_request(client_id, &method, envelope.msg, shared).await;
                let response = match outcome {
                    Ok(value) => {
                        RpcEnvelope::new_with_uuid(RpcKind::Response, value, envelope.uuid)
                    }
                    Err(error) => {
                        log::warn!("`{method}` from client {client_id} failed: {}", error.message);
                        RpcEnvelope::new_with_uuid(
                            RpcKind::Err,
                            serde_json::to_value(error)?,
                            envelope.uuid,
                        )
                    }
                };
                Self::send_message(stream, &response).await
            }
            RpcKind::Response => {
                log::trace!("Client {client_id} acknowledged {}", envelope.uuid);
                Ok(())
            }
            RpcKind::Err => {
                log::warn!("Client {client_id} rejected {}: {}", envelope.uuid, envelope.msg);
                Ok(())
            }
        }
    }

    async fn handle_request(
        client_id: u64,
        method: &str,
        params: serde_json::Value,
        shared: &Shared,
    ) -> Result<serde_json::Value, ErrorMessage> {
        let invalid =
            |e: serde_json::Error| ErrorMessage::new(ErrorMessage::INVALID_PARAMS, e.to_string());
        let encode =
            |e: serde_json::Error| ErrorMessage::new(ErrorMessage::HANDLER_FAILED, e.to_string());

        match method {
            methods::SUBSCRIBE => {
                let subscribe: SubscribeMessage =
                    serde_json::from_value(params).map_err(invalid)?;
                let subscribed = subscribe.topics.len();

                if let Some(client) = shared.clients.write().await.get_mut(&client_id) {
                    client.topics.extend(subscribe.topics);
                }
                log::info!("Client {client_id} subscribed to {subscribed} topic(s)");

                serde_json::to_value(SubscribeResult { subscribed }).map_err(encode)
            }
            methods::PUBLISH => {
                let publish: PublishMessage = serde_json::from_value(params).map_err(invalid)?;
                let delivered = Self::fan_out(&shared.clients, &publish.topic, publish.data).await;

                serde_json::to_value(PublishResult { delivered }).map_err(encode)
            }
            methods::PING => Ok(serde_json::json!("pong")),
            other => Err(ErrorMessage::new(
                ErrorMessage::METHOD_NOT_FOUND,
                format!("unknown method `{other}`"),
            )),
        }
    }

    async fn send_message(stream: &mut Box<dyn RpcStream>, envelope: &RpcEnvelope) -> Result<()> {
        let encoded = RpcCodec::encode(envelope)?;
        stream.write_all(&encoded).await?;
        Ok(())
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        if let Some(accept_loop) = self.accept_loop.take() {
            accept_loop.abort();
        }
        if self.shared.kick.send(()).is_err() {
            log::trace!("Broker dropped without connected clients");
        }

        #[cfg(unix)]
        if let Endpoint::Unix(path) = &self.endpoint {
            if path.exists() {
                if let Err(e) = std::fs::remove_file(path) {
                    log::error!("Failed to cleanup socket file: {e}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::{BoxFuture, RpcChannel, RpcMethods, TransportError, TransportOptions};
    use serde_json::json;
    use std::time::Duration;

    struct Collector(mpsc::UnboundedSender<NotifyMessage>);

    impl RpcMethods for Collector {
        fn call(
            &self,
            method: &str,
            params: serde_json::Value,
        ) -> BoxFuture<'static, Result<serde_json::Value, ErrorMessage>> {
            let sender = self.0.clone();
            let method = method.to_owned();
            Box::pin(async move {
                assert_eq!(method, methods::NOTIFY);
                let notify: NotifyMessage =
                    serde_json::from_value(params).expect("well-formed notify");
                sender.send(notify).expect("test receiver alive");
                Ok(json!({"dispatched": true}))
            })
        }
    }

    async fn bound_broker() -> Broker {
        let endpoint: Endpoint = "tcp://127.0.0.1:0".parse().expect("valid endpoint");
        Broker::bind(&endpoint).await.expect("bind")
    }

    async fn started_broker() -> Broker {
        let mut broker = bound_broker().await;
        broker.start().expect("start");
        broker
    }

    async fn connect(broker: &Broker) -> (RpcChannel, mpsc::UnboundedReceiver<NotifyMessage>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let channel = RpcChannel::connect(
            broker.local_endpoint(),
            Arc::new(Collector(sender)),
            &TransportOptions::default(),
        )
        .await
        .expect("connect");
        (channel, receiver)
    }

    async fn wait_for_clients(broker: &Broker, expected: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while broker.client_count().await != expected {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("client count settles");
    }

    #[tokio::test]
    async fn test_hello_and_ping() {
        let mut broker = bound_broker().await.with_name("test-broker");
        broker.start().expect("start");
        let (channel, _events) = connect(&broker).await;

        assert_eq!(
            channel.server_hello().server_name.as_deref(),
            Some("test-broker")
        );
        assert_eq!(
            channel.call(methods::PING, serde_json::Value::Null).await,
            Ok(json!("pong"))
        );
    }

    #[tokio::test]
    async fn test_publish_reaches_subscribers_only() {
        let broker = started_broker().await;
        let (subscriber, mut events) = connect(&broker).await;
        let (bystander, mut bystander_events) = connect(&broker).await;

        let reply = subscriber
            .call(methods::SUBSCRIBE, json!({"topics": ["guns", "germs"]}))
            .await
            .expect("subscribe");
        assert_eq!(reply, json!({"subscribed": 2}));

        assert_eq!(broker.publish(&Topic::from("guns"), json!({"caliber": 9})).await, 1);
        let event = events.recv().await.expect("event delivered");
        assert_eq!(event.subscription.topic, Topic::from("guns"));
        assert_eq!(event.data, json!({"caliber": 9}));

        // a publish through the broker counts the same subscribers
        let reply = bystander
            .call(methods::PUBLISH, json!({"topic": "germs", "data": "flu"}))
            .await
            .expect("publish");
        assert_eq!(reply, json!({"delivered": 1}));
        let event = events.recv().await.expect("event delivered");
        assert_eq!(event.data, json!("flu"));

        assert_eq!(broker.publish(&Topic::from("steel"), json!(null)).await, 0);
        assert!(bystander_events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unknown_method_rejected() {
        let broker = started_broker().await;
        let (channel, _events) = connect(&broker).await;

        let err = channel
            .call("explode", serde_json::Value::Null)
            .await
            .expect_err("unknown method");
        assert!(matches!(
            err,
            TransportError::Remote { error, .. } if error.code == ErrorMessage::METHOD_NOT_FOUND
        ));
    }

    #[tokio::test]
    async fn test_disconnect_all() {
        let broker = started_broker().await;
        let (first, _first_events) = connect(&broker).await;
        let (second, _second_events) = connect(&broker).await;
        wait_for_clients(&broker, 2).await;

        broker.disconnect_all();

        assert!(first.wait_on_reader().await.is_err());
        assert!(second.wait_on_reader().await.is_err());
        wait_for_clients(&broker, 0).await;

        // still accepting afterwards
        let (_third, _third_events) = connect(&broker).await;
        wait_for_clients(&broker, 1).await;
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let mut broker = started_broker().await;
        assert!(broker.start().is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_socket_file_removed_on_drop() {
        let path =
            std::env::temp_dir().join(format!("evrpc-broker-{}.sock", uuid::Uuid::new_v4()));
        let endpoint = Endpoint::Unix(path.clone());

        let broker = Broker::bind(&endpoint).await.expect("bind");
        assert!(path.exists());
        drop(broker);
        assert!(!path.exists());
    }
}
