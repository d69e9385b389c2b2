//! Backend manager
//!
//! Accepts mixer worker connections, validates their `register`, pushes
//! the mixer configuration and then routes session lifecycle requests
//! (`acquire`, `join`, `leave`, `volume`, `forward`, `release`, `state`)
//! to the worker bound to each session. Responses are correlated through
//! the uuid callback registry; worker disconnects free the slot and
//! surface the orphaned session as [`BackendEvent::MixerLost`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use loopcast_event_core::{
    split_tcp, CallbackRegistry, CallbackResult, ErrorCode, EventMessage, EventWriter,
    DEFAULT_REQUEST_TIMEOUT,
};
use loopcast_media_core::{Forward, LoopJoin, MixerConfig};

use crate::error::{Error, Result};
use crate::messages;
use crate::registry::MixerRegistry;

/// Default number of worker slots.
pub const DEFAULT_CAPACITY: usize = 128;

/// Backend configuration.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// Manager socket the workers connect to
    pub listen: SocketAddr,
    /// Mixer configuration pushed to every registering worker
    pub mixer: MixerConfig,
    /// Deadline for request callbacks
    pub request_timeout: Duration,
    /// Number of worker slots
    pub capacity: usize,
}

impl BackendConfig {
    pub fn new(listen: SocketAddr) -> Self {
        Self {
            listen,
            mixer: MixerConfig::default(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            capacity: DEFAULT_CAPACITY,
        }
    }
}

/// Notifications surfaced to the backend owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendEvent {
    /// A worker registered and acknowledged its configuration
    MixerRegistered { slot: usize, uuid: Uuid },
    /// A worker vanished while a session was bound to it
    MixerLost { slot: usize, session: String },
}

enum BackendCommand {
    Rpc {
        session: String,
        kind: RpcKind,
        reply: oneshot::Sender<CallbackResult>,
    },
    Count {
        reply: oneshot::Sender<(usize, usize)>,
    },
    Stop,
}

enum RpcKind {
    Acquire(Forward),
    Forward(Forward),
    Release,
    Join(LoopJoin),
    Leave(String),
    Volume(String, u8),
    State,
    ShutdownWorker,
}

/// Handle to a running backend manager.
#[derive(Clone)]
pub struct Backend {
    cmd_tx: mpsc::Sender<BackendCommand>,
    local_addr: SocketAddr,
}

impl Backend {
    /// Bind the manager socket and start the backend task.
    pub async fn start(config: BackendConfig) -> Result<(Self, mpsc::Receiver<BackendEvent>)> {
        let listener = TcpListener::bind(config.listen).await?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "backend manager listening");

        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (event_tx, event_rx) = mpsc::channel(64);

        tokio::spawn(BackendTask::new(config, listener, event_tx).run(cmd_rx));

        Ok((Self { cmd_tx, local_addr }, event_rx))
    }

    /// Address of the manager socket.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Bind `session` to a free worker and set its forward target.
    pub async fn acquire(&self, session: &str, forward: Forward) -> Result<()> {
        self.rpc(session, RpcKind::Acquire(forward)).await.map(|_| ())
    }

    /// Replace the forward target of a bound session.
    pub async fn forward(&self, session: &str, forward: Forward) -> Result<()> {
        self.rpc(session, RpcKind::Forward(forward)).await.map(|_| ())
    }

    /// Unbind `session`; its worker becomes free again.
    pub async fn release(&self, session: &str) -> Result<()> {
        self.rpc(session, RpcKind::Release).await.map(|_| ())
    }

    /// Join a loop on the session's mixer.
    pub async fn join(&self, session: &str, data: LoopJoin) -> Result<()> {
        self.rpc(session, RpcKind::Join(data)).await.map(|_| ())
    }

    /// Leave a loop on the session's mixer.
    pub async fn leave(&self, session: &str, loop_name: &str) -> Result<()> {
        self.rpc(session, RpcKind::Leave(loop_name.to_string()))
            .await
            .map(|_| ())
    }

    /// Set a loop volume on the session's mixer.
    pub async fn set_volume(&self, session: &str, loop_name: &str, volume: u8) -> Result<()> {
        self.rpc(session, RpcKind::Volume(loop_name.to_string(), volume))
            .await
            .map(|_| ())
    }

    /// Fetch the mixer state snapshot of a session.
    pub async fn state(&self, session: &str) -> Result<Value> {
        self.rpc(session, RpcKind::State)
            .await
            .map(|result| result.response.unwrap_or(Value::Null))
    }

    /// Terminate the session's worker process.
    pub async fn shutdown_worker(&self, session: &str) -> Result<()> {
        self.rpc(session, RpcKind::ShutdownWorker).await.map(|_| ())
    }

    /// `(live, bound)` worker counts.
    pub async fn count(&self) -> Result<(usize, usize)> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(BackendCommand::Count { reply: tx })
            .await
            .map_err(|_| Error::TaskGone)?;
        rx.await.map_err(|_| Error::TaskGone)
    }

    /// Stop the backend task.
    pub async fn stop(&self) {
        let _ = self.cmd_tx.send(BackendCommand::Stop).await;
    }

    async fn rpc(&self, session: &str, kind: RpcKind) -> Result<CallbackResult> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(BackendCommand::Rpc {
                session: session.to_string(),
                kind,
                reply: tx,
            })
            .await
            .map_err(|_| Error::TaskGone)?;
        let result = rx.await.map_err(|_| Error::TaskGone)?;
        if result.is_ok() {
            Ok(result)
        } else {
            Err(Error::from_rpc(result.code, result.description))
        }
    }
}

struct Connection {
    writer: EventWriter<OwnedWriteHalf>,
    reader_task: JoinHandle<()>,
    addr: SocketAddr,
}

struct BackendTask {
    config: BackendConfig,
    listener: TcpListener,
    registry: MixerRegistry,
    callbacks: CallbackRegistry,
    connections: HashMap<usize, Connection>,
    inbound_tx: mpsc::Sender<(usize, Option<EventMessage>)>,
    inbound_rx: mpsc::Receiver<(usize, Option<EventMessage>)>,
    event_tx: mpsc::Sender<BackendEvent>,
}

impl BackendTask {
    fn new(
        config: BackendConfig,
        listener: TcpListener,
        event_tx: mpsc::Sender<BackendEvent>,
    ) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(256);
        Self {
            registry: MixerRegistry::new(config.capacity),
            callbacks: CallbackRegistry::new(config.request_timeout),
            connections: HashMap::new(),
            inbound_tx,
            inbound_rx,
            event_tx,
            config,
            listener,
        }
    }

    async fn run(mut self, mut cmd_rx: mpsc::Receiver<BackendCommand>) {
        let mut sweep = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => self.on_accept(stream, addr),
                        Err(e) => warn!(error = %e, "accept failed"),
                    }
                }
                Some((slot, maybe_msg)) = self.inbound_rx.recv() => {
                    match maybe_msg {
                        Some(msg) => self.on_message(slot, msg).await,
                        None => self.on_disconnect(slot).await,
                    }
                }
                maybe_cmd = cmd_rx.recv() => {
                    match maybe_cmd {
                        Some(BackendCommand::Stop) | None => break,
                        Some(cmd) => self.on_command(cmd).await,
                    }
                }
                _ = sweep.tick() => {
                    self.callbacks.expire(Instant::now());
                }
            }
        }
        debug!("backend task stopped");
    }

    fn on_accept(&mut self, stream: TcpStream, addr: SocketAddr) {
        let slot = match (0..self.config.capacity).find(|i| !self.connections.contains_key(i)) {
            Some(slot) => slot,
            None => {
                warn!(%addr, "no free worker slot, dropping connection");
                return;
            }
        };

        let (mut reader, writer) = split_tcp(stream);
        let inbound = self.inbound_tx.clone();
        let reader_task = tokio::spawn(async move {
            loop {
                match reader.recv().await {
                    Ok(Some(msg)) => {
                        if inbound.send((slot, Some(msg))).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) | Err(_) => {
                        let _ = inbound.send((slot, None)).await;
                        break;
                    }
                }
            }
        });

        debug!(slot, %addr, "worker connected");
        self.connections.insert(
            slot,
            Connection {
                writer,
                reader_task,
                addr,
            },
        );
    }

    async fn on_message(&mut self, slot: usize, msg: EventMessage) {
        if msg.is_response() {
            match msg.uuid {
                Some(uuid) => match self.callbacks.unregister(&uuid) {
                    Some(callback) => callback(CallbackResult::from_message(&msg)),
                    None => debug!(%uuid, event = %msg.event, "unmatched response"),
                },
                None => debug!(event = %msg.event, "response without uuid"),
            }
            return;
        }

        match msg.event.as_str() {
            messages::EVENT_REGISTER => self.on_register(slot, &msg).await,
            other => {
                warn!(slot, event = %other, "unexpected worker request");
                let response = EventMessage::error_response(&msg, ErrorCode::ParameterError);
                self.send_to(slot, &response).await;
            }
        }
    }

    async fn on_register(&mut self, slot: usize, msg: &EventMessage) {
        let (uuid, kind) = match messages::parse_register(msg) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(slot, error = %e, "malformed register, closing worker");
                self.close_connection(slot);
                return;
            }
        };

        if kind != messages::MIXER_TYPE_AUDIO {
            warn!(slot, %kind, "unsupported worker type, closing");
            self.close_connection(slot);
            return;
        }

        let addr = self.connections.get(&slot).map(|c| c.addr);
        if let Err(e) = self.registry.register_mixer(slot, uuid, addr) {
            warn!(slot, error = %e, "register failed, closing worker");
            self.close_connection(slot);
            return;
        }

        // exactly one configure follows the accepted register, before any
        // other event reaches this worker
        let configure = messages::configure(&self.config.mixer);
        if let Some(configure_uuid) = configure.uuid {
            let event_tx = self.event_tx.clone();
            self.callbacks.register(
                configure_uuid,
                Box::new(move |result| {
                    if result.is_ok() {
                        let _ = event_tx.try_send(BackendEvent::MixerRegistered { slot, uuid });
                    } else {
                        warn!(slot, code = result.code, "worker rejected configuration");
                    }
                }),
            );
        }

        info!(slot, %uuid, "mixer registered");
        self.send_to(slot, &configure).await;
    }

    async fn on_disconnect(&mut self, slot: usize) {
        self.close_connection(slot);
        if let Some(session) = self.registry.unregister_mixer(slot) {
            info!(slot, %session, "mixer lost with bound session");
            let _ = self
                .event_tx
                .send(BackendEvent::MixerLost { slot, session })
                .await;
        } else {
            debug!(slot, "worker disconnected");
        }
    }

    async fn on_command(&mut self, cmd: BackendCommand) {
        match cmd {
            BackendCommand::Rpc {
                session,
                kind,
                reply,
            } => self.on_rpc(session, kind, reply).await,
            BackendCommand::Count { reply } => {
                let _ = reply.send(self.registry.count());
            }
            BackendCommand::Stop => unreachable!("handled in run"),
        }
    }

    async fn on_rpc(
        &mut self,
        session: String,
        kind: RpcKind,
        reply: oneshot::Sender<CallbackResult>,
    ) {
        let fail = |reply: oneshot::Sender<CallbackResult>, code| {
            let _ = reply.send(CallbackResult::failure(code));
        };

        let (slot, request) = match kind {
            RpcKind::Acquire(forward) => match self.registry.acquire(&session) {
                Some(slot) => (slot, messages::acquire(&session, &forward)),
                None => return fail(reply, ErrorCode::NoResource),
            },
            RpcKind::Forward(forward) => match self.registry.get_by_session(&session) {
                Some(d) => (d.slot, messages::forward(&session, &forward)),
                None => return fail(reply, ErrorCode::SessionUnknown),
            },
            RpcKind::Release => match self.registry.get_by_session(&session) {
                Some(d) => {
                    self.registry.release(&session);
                    (d.slot, messages::release(&session))
                }
                None => return fail(reply, ErrorCode::SessionUnknown),
            },
            RpcKind::Join(data) => match self.registry.get_by_session(&session) {
                Some(d) => (d.slot, messages::join(&data)),
                None => return fail(reply, ErrorCode::SessionUnknown),
            },
            RpcKind::Leave(loop_name) => match self.registry.get_by_session(&session) {
                Some(d) => (d.slot, messages::leave(&loop_name)),
                None => return fail(reply, ErrorCode::SessionUnknown),
            },
            RpcKind::Volume(loop_name, volume) => match self.registry.get_by_session(&session) {
                Some(d) => (d.slot, messages::volume(&loop_name, volume)),
                None => return fail(reply, ErrorCode::SessionUnknown),
            },
            RpcKind::State => match self.registry.get_by_session(&session) {
                Some(d) => (d.slot, messages::state()),
                None => return fail(reply, ErrorCode::SessionUnknown),
            },
            RpcKind::ShutdownWorker => {
                // no response follows shutdown; resolve immediately
                match self.registry.get_by_session(&session) {
                    Some(d) => {
                        self.registry.release(&session);
                        let request = messages::shutdown();
                        self.send_to(d.slot, &request).await;
                        let _ = reply.send(CallbackResult::success(None));
                    }
                    None => fail(reply, ErrorCode::SessionUnknown),
                }
                return;
            }
        };

        let Some(uuid) = request.uuid else {
            return fail(reply, ErrorCode::ProcessingError);
        };
        self.callbacks.register(
            uuid,
            Box::new(move |result| {
                let _ = reply.send(result);
            }),
        );

        if self.connections.contains_key(&slot) {
            if !self.send_to(slot, &request).await {
                if let Some(callback) = self.callbacks.unregister(&uuid) {
                    callback(CallbackResult::failure(ErrorCode::ProcessingError));
                }
            }
        } else if let Some(callback) = self.callbacks.unregister(&uuid) {
            callback(CallbackResult::failure(ErrorCode::SessionUnknown));
        }
    }

    async fn send_to(&mut self, slot: usize, msg: &EventMessage) -> bool {
        match self.connections.get_mut(&slot) {
            Some(conn) => match conn.writer.send(msg).await {
                Ok(()) => true,
                Err(e) => {
                    warn!(slot, error = %e, "worker write failed");
                    false
                }
            },
            None => false,
        }
    }

    fn close_connection(&mut self, slot: usize) {
        if let Some(conn) = self.connections.remove(&slot) {
            conn.reader_task.abort();
        }
    }
}
