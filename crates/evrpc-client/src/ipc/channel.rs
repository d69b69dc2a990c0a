use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::sync::{Notify, RwLock, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use super::codec::{FrameBuffer, RpcCodec};
use super::endpoint::{Endpoint, RpcStream};
use super::envelope::{PROTOCOL_VERSION, RpcEnvelope, RpcKind};
use super::error::TransportError;
use super::protocol::{ErrorMessage, HelloMessage};
use super::transport::{RpcMethods, TransportOptions};

type PendingRequests =
    Arc<RwLock<HashMap<String, oneshot::Sender<Result<serde_json::Value, ErrorMessage>>>>>;

#[derive(Debug, Clone)]
enum ReaderState {
    Running,
    Finished(Result<(), TransportError>),
}

/// Client side of one RPC connection
///
/// Outbound requests are correlated with their responses by envelope uuid.
/// Inbound requests are served by the [`RpcMethods`] given at connect time.
/// Dropping the channel stops its reader and closes the stream.
pub struct RpcChannel {
    endpoint: Endpoint,
    server_hello: HelloMessage,
    request_timeout: Duration,
    message_sender: mpsc::UnboundedSender<RpcEnvelope>,
    pending_requests: PendingRequests,
    reader_state: watch::Receiver<ReaderState>,
    shutdown: Arc<Notify>,
    reader: JoinHandle<()>,
}

impl RpcChannel {
    pub async fn connect(
        endpoint: &Endpoint,
        methods: Arc<dyn RpcMethods>,
        options: &TransportOptions,
    ) -> Result<Self, TransportError> {
        let mut buffer = FrameBuffer::new();

        let opening = async {
            let mut stream = endpoint
                .connect()
                .await
                .map_err(|e| TransportError::Connect {
                    endpoint: endpoint.to_string(),
                    reason: e.to_string(),
                })?;
            let server_hello =
                Self::perform_handshake(&mut stream, &mut buffer, &options.client_name).await?;
            Ok::<_, TransportError>((stream, server_hello))
        };

        let (stream, server_hello) = tokio::time::timeout(options.connect_timeout, opening)
            .await
            .map_err(|_elapsed| TransportError::Timeout(format!("connect to {endpoint}")))??;

        log::debug!(
            "Connected to {endpoint} ({})",
            server_hello.server_name.as_deref().unwrap_or("unnamed server")
        );

        let (message_sender, message_receiver) = mpsc::unbounded_channel();
        let (state_sender, reader_state) = watch::channel(ReaderState::Running);
        let pending_requests = PendingRequests::default();
        let shutdown = Arc::new(Notify::new());

        let reader = tokio::spawn(Self::handle_connection(
            stream,
            buffer,
            methods,
            pending_requests.clone(),
            message_sender.clone(),
            message_receiver,
            shutdown.clone(),
            state_sender,
        ));

        Ok(Self {
            endpoint: endpoint.clone(),
            server_hello,
            request_timeout: options.request_timeout,
            message_sender,
            pending_requests,
            reader_state,
            shutdown,
            reader,
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn server_hello(&self) -> &HelloMessage {
        &self.server_hello
    }

    /// Invoke `method` on the server and wait for its result
    pub async fn call(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, TransportError> {
        let envelope = RpcEnvelope::request(method, params);
        let request_uuid = envelope.uuid.clone();
        log::trace!("Sending RPC request `{method}` id: {request_uuid}");

        let (response_sender, response_receiver) = oneshot::channel();
        self.pending_requests
            .write()
            .await
            .insert(request_uuid.clone(), response_sender);

        if self.message_sender.send(envelope).is_err() {
            self.pending_requests.write().await.remove(&request_uuid);
            return Err(TransportError::ConnectionClosed(format!(
                "connection to {} is no longer writable",
                self.endpoint
            )));
        }

        match tokio::time::timeout(self.request_timeout, response_receiver).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(error))) => Err(TransportError::Remote {
                method: method.to_owned(),
                error,
            }),
            Ok(Err(_)) => Err(TransportError::ConnectionClosed(format!(
                "connection lost while waiting for `{method}`"
            ))),
            Err(_) => {
                self.pending_requests.write().await.remove(&request_uuid);
                Err(TransportError::Timeout(method.to_owned()))
            }
        }
    }

    /// Wait until the reader stops
    ///
    /// A peer close or a read failure is returned as an error, a local [`Self::close`] as `Ok`.
    pub async fn wait_on_reader(&self) -> Result<(), TransportError> {
        let mut reader_state = self.reader_state.clone();
        let finished = reader_state
            .wait_for(|state| matches!(state, ReaderState::Finished(_)))
            .await
            .map_err(|_| TransportError::ConnectionClosed("reader task stopped".to_owned()))?;

        match &*finished {
            ReaderState::Finished(outcome) => outcome.clone(),
            ReaderState::Running => Ok(()),
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(*self.reader_state.borrow(), ReaderState::Finished(_))
    }

    /// Stop the reader and close the stream
    pub fn close(&self) {
        self.shutdown.notify_one();
    }

    async fn perform_handshake(
        stream: &mut Box<dyn RpcStream>,
        buffer: &mut FrameBuffer,
        client_name: &str,
    ) -> Result<HelloMessage, TransportError> {
        let hello = RpcEnvelope::new(
            RpcKind::Hello,
            serde_json::to_value(HelloMessage::client(client_name))
                .map_err(|e| TransportError::Protocol(e.to_string()))?,
        );
        Self::send_message(stream, &hello).await?;

        let mut read_buf = vec![0u8; 4096];
        loop {
            if let Some(envelope) = buffer.try_decode()? {
                if envelope.kind != RpcKind::Hello {
                    return Err(TransportError::Protocol(format!(
                        "expected Hello from server, got {}",
                        envelope.kind
                    )));
                }
                let server_hello: HelloMessage = serde_json::from_value(envelope.msg)
                    .map_err(|e| TransportError::Protocol(format!("malformed Hello: {e}")))?;
                if server_hello.version != PROTOCOL_VERSION {
                    return Err(TransportError::Protocol(format!(
                        "server speaks protocol version {}, expected {PROTOCOL_VERSION}",
                        server_hello.version
                    )));
                }
                return Ok(server_hello);
            }

            match stream.read(&mut read_buf).await {
                Ok(0) => {
                    return Err(TransportError::ConnectionClosed(
                        "server closed the connection during hello".to_owned(),
                    ));
                }
                Ok(n) => buffer.push(&read_buf[0..n]),
                Err(e) => return Err(TransportError::ConnectionClosed(e.to_string())),
            }
        }
    }

    #[expect(clippy::too_many_arguments)]
    async fn handle_connection(
        mut stream: Box<dyn RpcStream>,
        mut buffer: FrameBuffer,
        methods: Arc<dyn RpcMethods>,
        pending_requests: PendingRequests,
        response_sender: mpsc::UnboundedSender<RpcEnvelope>,
        mut message_receiver: mpsc::UnboundedReceiver<RpcEnvelope>,
        shutdown: Arc<Notify>,
        state_sender: watch::Sender<ReaderState>,
    ) {
        let outcome = Self::pump(
            &mut stream,
            &mut buffer,
            &methods,
            &pending_requests,
            &response_sender,
            &mut message_receiver,
            &shutdown,
        )
        .await;

        match &outcome {
            Ok(()) => log::debug!("RPC channel closed locally"),
            Err(e) => log::debug!("RPC channel reader stopped: {e}"),
        }

        if let Err(e) = stream.shutdown().await {
            log::trace!("Failed to shut down stream: {e}");
        }

        // waiting callers observe a closed response channel
        pending_requests.write().await.clear();
        state_sender.send_replace(ReaderState::Finished(outcome));
    }

    async fn pump(
        stream: &mut Box<dyn RpcStream>,
        buffer: &mut FrameBuffer,
        methods: &Arc<dyn RpcMethods>,
        pending_requests: &PendingRequests,
        response_sender: &mpsc::UnboundedSender<RpcEnvelope>,
        message_receiver: &mut mpsc::UnboundedReceiver<RpcEnvelope>,
        shutdown: &Notify,
    ) -> Result<(), TransportError> {
        let mut read_buf = vec![0u8; 4096];

        // frames that arrived together with the server hello
        while let Some(envelope) = buffer.try_decode()? {
            Self::process_server_message(envelope, methods, pending_requests, response_sender)
                .await;
        }

        loop {
            tokio::select! {
                result = stream.read(&mut read_buf) => {
                    match result {
                        Ok(0) => {
                            return Err(TransportError::ConnectionClosed(
                                "server closed the connection".to_owned(),
                            ));
                        }
                        Ok(n) => {
                            buffer.push(&read_buf[0..n]);

                            while let Some(envelope) = buffer.try_decode()? {
                                Self::process_server_message(
                                    envelope,
                                    methods,
                                    pending_requests,
                                    response_sender,
                                )
                                .await;
                            }
                        }
                        Err(e) => return Err(TransportError::ConnectionClosed(e.to_string())),
                    }
                }

                Some(envelope) = message_receiver.recv() => {
                    Self::send_message(stream, &envelope).await?;
                }

                () = shutdown.notified() => return Ok(()),
            }
        }
    }

    async fn process_server_message(
        envelope: RpcEnvelope,
        methods: &Arc<dyn RpcMethods>,
        pending_requests: &PendingRequests,
        response_sender: &mpsc::UnboundedSender<RpcEnvelope>,
    ) {
        match envelope.kind {
            RpcKind::Response => {
                Self::complete_request(pending_requests, &envelope.uuid, Ok(envelope.msg)).await;
            }
            RpcKind::Err => {
                let error = serde_json::from_value::<ErrorMessage>(envelope.msg.clone())
                    .unwrap_or_else(|_| {
                        ErrorMessage::new(ErrorMessage::HANDLER_FAILED, envelope.msg.to_string())
                    });
                Self::complete_request(pending_requests, &envelope.uuid, Err(error)).await;
            }
            RpcKind::Request(method) => {
                // `call` sees requests in arrival order, the reply is awaited off the reader
                let handler = methods.call(&method, envelope.msg);
                let response_sender = response_sender.clone();
                tokio::spawn(async move {
                    let response = match handler.await {
                        Ok(value) => RpcEnvelope::new_with_uuid(RpcKind::Response, value, envelope.uuid),
                        Err(error) => {
                            log::warn!("Inbound `{method}` failed: {}", error.message);
                            RpcEnvelope::new_with_uuid(
                                RpcKind::Err,
                                serde_json::to_value(error).unwrap_or_default(),
                                envelope.uuid,
                            )
                        }
                    };
                    if response_sender.send(response).is_err() {
                        log::debug!("Connection closed before `{method}` could be answered");
                    }
                });
            }
            RpcKind::Hello => {
                log::warn!("Unexpected Hello after the connection was established");
            }
        }
    }

    async fn complete_request(
        pending_requests: &PendingRequests,
        uuid: &str,
        result: Result<serde_json::Value, ErrorMessage>,
    ) {
        let sender = pending_requests.write().await.remove(uuid);
        match sender {
            Some(sender) => {
                if sender.send(result).is_err() {
                    log::debug!("Caller stopped waiting for response {uuid}");
                }
            }
            None => log::warn!("No pending request found for UUID: {uuid}"),
        }
    }

    async fn send_message(
        stream: &mut Box<dyn RpcStream>,
        envelope: &RpcEnvelope,
    ) -> Result<(), TransportError> {
        let encoded = RpcCodec::encode(envelope)?;
        stream
            .write_all(&encoded)
            .await
            .map_err(|e| TransportError::ConnectionClosed(e.to_string()))
    }
}

impl Drop for RpcChannel {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
