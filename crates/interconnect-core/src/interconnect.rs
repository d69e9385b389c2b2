//! Fabric interconnect
//!
//! One running interconnect owns the local multicast loops, one
//! multiplexed media socket and any number of sessions to remote
//! fabrics. The server side accepts signaling connections and answers
//! the register / connect_media / connect_loops dance; the client side
//! initiates it. Media datagrams are demultiplexed per RFC 7983: STUN is
//! answered in place, DTLS goes to the session handshake, RTP is bridged
//! between the external flow and the internal loops.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use loopcast_event_core::{split_tcp, ErrorCode, EventMessage, EventWriter};
use loopcast_rtp_core::{
    classify_datagram, dtls_channel, stun, DatagramSink, DtlsCertificate, DtlsConfig,
    DtlsEndpoint, DtlsRole, LoopPacket, MulticastEndpoint, PacketClass, RtpSsrc,
};

use crate::error::{Error, Result};
use crate::messages::{self, LoopEntry};
use crate::session::{InterconnectSession, SessionState};

fn default_codec() -> String {
    messages::DEFAULT_CODEC.to_string()
}

fn default_reconnect_interval_ms() -> u64 {
    100
}

fn default_keepalive_secs() -> u64 {
    300
}

/// One multicast loop of this fabric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopDefinition {
    pub name: String,
    pub host: String,
    pub port: u16,
}

/// Fabric configuration (JSON document of `interconnectd`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterconnectConfig {
    /// Fabric name announced over signaling
    pub name: String,
    /// Shared secret checked on `register`
    pub password: String,
    /// Client fabrics connect out; server fabrics listen
    #[serde(default)]
    pub client: bool,
    /// Signaling socket: listen address (server) or the remote fabric's
    /// signaling endpoint (client)
    pub signaling: String,
    /// Local media socket, host:port; the host is also what is
    /// advertised in `connect_media`
    pub media: String,
    /// The loops this fabric extends
    #[serde(default)]
    pub loops: Vec<LoopDefinition>,
    #[serde(default = "default_codec")]
    pub codec: String,
    /// DTLS handshake retransmission interval
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,
    /// STUN keepalive period towards each peer
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
    /// Bridge plain RTP instead of SRTP (evaluation variant)
    #[serde(default)]
    pub cleartext: bool,
}

/// Outbound half of the DTLS transport: records leave through the shared
/// media socket towards the peer's media endpoint.
struct MediaSink {
    socket: Arc<UdpSocket>,
    dest: SocketAddr,
}

#[async_trait]
impl DatagramSink for MediaSink {
    async fn send_datagram(&self, data: &[u8]) -> io::Result<usize> {
        self.socket.send_to(data, self.dest).await
    }
}

enum Io {
    Media(Vec<u8>, SocketAddr),
    SignalConn(u64, EventWriter<OwnedWriteHalf>, SocketAddr),
    Signal(u64, Option<EventMessage>),
    HandshakeDone(
        Uuid,
        std::result::Result<DtlsEndpoint, loopcast_rtp_core::Error>,
    ),
}

enum Command {
    LoopSsrc(String, oneshot::Sender<Option<RtpSsrc>>),
    Sessions(oneshot::Sender<Vec<(Uuid, SessionState)>>),
    Stop,
}

/// Handle to a running fabric interconnect.
pub struct Interconnect {
    cmd_tx: mpsc::Sender<Command>,
    fingerprint: String,
    media_addr: SocketAddr,
}

impl Interconnect {
    /// Boot the fabric: join every configured loop, bind the media
    /// socket, start signaling. Construction fails whole on any boot
    /// error; no partial fabric remains.
    pub async fn start(config: InterconnectConfig) -> Result<Self> {
        if config.name.is_empty() || config.password.is_empty() {
            return Err(Error::Parameter(
                "fabric name and password are required".to_string(),
            ));
        }

        let media_bind: SocketAddr = config
            .media
            .parse()
            .map_err(|_| Error::Parameter(format!("invalid media address {}", config.media)))?;
        let media_socket = Arc::new(UdpSocket::bind(media_bind).await?);
        let media_addr = media_socket.local_addr()?;

        let certificate = DtlsCertificate::generate(&config.name)?;
        let fingerprint = certificate.fingerprint().to_string();

        let (io_tx, io_rx) = mpsc::channel::<Io>(512);
        let (loop_tx, loop_rx) = mpsc::channel::<LoopPacket>(512);
        let (cmd_tx, cmd_rx) = mpsc::channel::<Command>(16);

        let mut loops = HashMap::new();
        for def in &config.loops {
            let group = def.host.parse().map_err(|_| {
                Error::Parameter(format!("invalid loop group address {}", def.host))
            })?;
            let endpoint =
                MulticastEndpoint::bind(def.name.clone(), group, def.port, loop_tx.clone())
                    .await?;
            loops.insert(def.name.clone(), endpoint);
        }

        // media socket reader
        let reader_socket = media_socket.clone();
        let media_io = io_tx.clone();
        let media_reader = tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];
            loop {
                match reader_socket.recv_from(&mut buf).await {
                    Ok((len, source)) => {
                        if media_io
                            .send(Io::Media(buf[..len].to_vec(), source))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "media socket closed");
                        break;
                    }
                }
            }
        });

        // signaling: listen or connect
        let signaling_task = if config.client {
            let remote = config.signaling.clone();
            let io = io_tx.clone();
            tokio::spawn(async move {
                match TcpStream::connect(&remote).await {
                    Ok(stream) => {
                        let peer = stream.peer_addr().unwrap_or(([0, 0, 0, 0], 0).into());
                        spawn_signal_conn(0, stream, peer, io).await;
                    }
                    Err(e) => warn!(remote = %remote, error = %e, "signaling connect failed"),
                }
            })
        } else {
            let listen: SocketAddr = config.signaling.parse().map_err(|_| {
                Error::Parameter(format!("invalid signaling address {}", config.signaling))
            })?;
            let listener = TcpListener::bind(listen).await?;
            info!(signaling = %listener.local_addr()?, "interconnect listening");
            let io = io_tx.clone();
            tokio::spawn(async move {
                let mut next_conn: u64 = 1;
                loop {
                    match listener.accept().await {
                        Ok((stream, addr)) => {
                            spawn_signal_conn(next_conn, stream, addr, io.clone()).await;
                            next_conn += 1;
                        }
                        Err(e) => {
                            warn!(error = %e, "signaling accept failed");
                            break;
                        }
                    }
                }
            })
        };

        let fabric = Fabric {
            certificate,
            media_socket,
            media_addr,
            loops,
            sessions: HashMap::new(),
            dtls_endpoints: HashMap::new(),
            handshake_tasks: HashMap::new(),
            by_media_addr: HashMap::new(),
            conns: HashMap::new(),
            client: config.client.then_some(ClientState {
                conn: 0,
                phase: ClientPhase::AwaitRegister,
                session: None,
            }),
            io_tx,
            media_reader,
            signaling_task,
            config,
        };
        tokio::spawn(fabric.run(io_rx, loop_rx, cmd_rx));

        Ok(Self {
            cmd_tx,
            fingerprint,
            media_addr,
        })
    }

    /// This fabric's DTLS certificate fingerprint.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Local media socket address.
    pub fn media_addr(&self) -> SocketAddr {
        self.media_addr
    }

    /// The SSRC this fabric emits on `loop_name`.
    pub async fn loop_ssrc(&self, loop_name: &str) -> Result<Option<RtpSsrc>> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::LoopSsrc(loop_name.to_string(), tx))
            .await
            .map_err(|_| Error::TaskGone)?;
        rx.await.map_err(|_| Error::TaskGone)
    }

    /// Current sessions with their media states.
    pub async fn sessions(&self) -> Result<Vec<(Uuid, SessionState)>> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Sessions(tx))
            .await
            .map_err(|_| Error::TaskGone)?;
        rx.await.map_err(|_| Error::TaskGone)
    }

    /// Stop the fabric.
    pub async fn stop(&self) {
        let _ = self.cmd_tx.send(Command::Stop).await;
    }
}

/// Split a signaling stream, announce the writer, pump the reader.
async fn spawn_signal_conn(
    conn_id: u64,
    stream: TcpStream,
    addr: SocketAddr,
    io: mpsc::Sender<Io>,
) {
    let (mut reader, writer) = split_tcp(stream);
    if io.send(Io::SignalConn(conn_id, writer, addr)).await.is_err() {
        return;
    }
    tokio::spawn(async move {
        loop {
            match reader.recv().await {
                Ok(Some(msg)) => {
                    if io.send(Io::Signal(conn_id, Some(msg))).await.is_err() {
                        break;
                    }
                }
                Ok(None) | Err(_) => {
                    let _ = io.send(Io::Signal(conn_id, None)).await;
                    break;
                }
            }
        }
    });
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientPhase {
    AwaitRegister,
    AwaitMedia,
    AwaitLoops,
    Running,
}

struct ClientState {
    conn: u64,
    phase: ClientPhase,
    session: Option<Uuid>,
}

struct SignalConn {
    writer: EventWriter<OwnedWriteHalf>,
    addr: SocketAddr,
    registered: bool,
    sessions: Vec<Uuid>,
}

struct Fabric {
    config: InterconnectConfig,
    certificate: DtlsCertificate,
    media_socket: Arc<UdpSocket>,
    media_addr: SocketAddr,
    loops: HashMap<String, MulticastEndpoint>,
    sessions: HashMap<Uuid, InterconnectSession>,
    /// Completed associations, kept alive for retransmits and alerts
    dtls_endpoints: HashMap<Uuid, DtlsEndpoint>,
    handshake_tasks: HashMap<Uuid, JoinHandle<()>>,
    by_media_addr: HashMap<SocketAddr, Uuid>,
    conns: HashMap<u64, SignalConn>,
    client: Option<ClientState>,
    io_tx: mpsc::Sender<Io>,
    media_reader: JoinHandle<()>,
    signaling_task: JoinHandle<()>,
}

impl Fabric {
    async fn run(
        mut self,
        mut io_rx: mpsc::Receiver<Io>,
        mut loop_rx: mpsc::Receiver<LoopPacket>,
        mut cmd_rx: mpsc::Receiver<Command>,
    ) {
        let mut keepalive =
            tokio::time::interval(Duration::from_secs(self.config.keepalive_secs.max(1)));
        keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                Some(io) = io_rx.recv() => self.on_io(io).await,
                Some(packet) = loop_rx.recv() => self.on_loop(packet).await,
                maybe_cmd = cmd_rx.recv() => {
                    match maybe_cmd {
                        Some(Command::LoopSsrc(name, reply)) => {
                            let _ = reply.send(self.loops.get(&name).map(|e| e.local_ssrc()));
                        }
                        Some(Command::Sessions(reply)) => {
                            let _ = reply.send(
                                self.sessions.iter().map(|(id, s)| (*id, s.state())).collect(),
                            );
                        }
                        Some(Command::Stop) | None => break,
                    }
                }
                _ = keepalive.tick() => self.on_keepalive().await,
            }
        }

        self.media_reader.abort();
        self.signaling_task.abort();
        for (_, task) in self.handshake_tasks.drain() {
            task.abort();
        }
        debug!("interconnect stopped");
    }

    async fn on_io(&mut self, io: Io) {
        match io {
            Io::Media(data, source) => self.on_media(data, source).await,
            Io::SignalConn(conn_id, writer, addr) => {
                debug!(conn_id, %addr, "signaling connection");
                self.conns.insert(
                    conn_id,
                    SignalConn {
                        writer,
                        addr,
                        registered: false,
                        sessions: Vec::new(),
                    },
                );
                let is_client_conn = self
                    .client
                    .as_ref()
                    .map(|c| c.conn == conn_id)
                    .unwrap_or(false);
                if is_client_conn {
                    let register = messages::register(&self.config.name, &self.config.password);
                    self.send_signal(conn_id, &register).await;
                }
            }
            Io::Signal(conn_id, Some(msg)) => {
                if self.client.is_some() {
                    self.on_client_message(msg).await;
                } else {
                    self.on_server_message(conn_id, msg).await;
                }
            }
            Io::Signal(conn_id, None) => self.on_signal_close(conn_id),
            Io::HandshakeDone(session_id, result) => {
                self.on_handshake_done(session_id, result).await;
            }
        }
    }

    /// RFC 7983 dispatch of one media datagram.
    async fn on_media(&mut self, data: Vec<u8>, source: SocketAddr) {
        match classify_datagram(&data) {
            PacketClass::Stun => {
                if stun::is_binding_request(&data) {
                    match stun::binding_success_response(&data, source) {
                        Ok(response) => {
                            let _ = self.media_socket.send_to(&response, source).await;
                        }
                        Err(e) => debug!(error = %e, "stun response failed"),
                    }
                }
                // binding success responses answer our keepalives
            }
            PacketClass::Dtls => {
                let Some(id) = self.by_media_addr.get(&source) else {
                    debug!(%source, "DTLS from unknown peer dropped");
                    return;
                };
                if let Some(records) = self.sessions.get(id).and_then(|s| s.dtls_records()) {
                    let _ = records.send(data).await;
                }
            }
            PacketClass::RtpRtcp => {
                let Some(id) = self.by_media_addr.get(&source).copied() else {
                    return;
                };
                let loops = &self.loops;
                let Some(session) = self.sessions.get_mut(&id) else {
                    return;
                };
                let bridged = session.external_to_internal(&data, |name| {
                    loops.get(name).map(|e| e.local_ssrc())
                });
                if let Some((loop_name, frame)) = bridged {
                    if let Some(endpoint) = self.loops.get(&loop_name) {
                        endpoint.send(&frame).await;
                    }
                }
            }
            PacketClass::Zrtp | PacketClass::Turn | PacketClass::Unknown => {}
        }
    }

    /// Fan a local loop frame out to every subscribed session.
    async fn on_loop(&mut self, packet: LoopPacket) {
        let Some(endpoint) = self.loops.get(&packet.loop_name) else {
            return;
        };
        let announced = endpoint.local_ssrc();

        let mut outbound = Vec::new();
        for session in self.sessions.values_mut() {
            let Some(dest) = session.remote_media() else {
                continue;
            };
            if let Some(wire) = session.loop_to_external(&packet.loop_name, &packet.data, announced)
            {
                outbound.push((dest, wire));
            }
        }
        for (dest, wire) in outbound {
            let _ = self.media_socket.send_to(&wire, dest).await;
        }
    }

    async fn on_server_message(&mut self, conn_id: u64, msg: EventMessage) {
        if msg.is_response() {
            debug!(conn_id, event = %msg.event, "unexpected response on server side");
            return;
        }

        let registered = self
            .conns
            .get(&conn_id)
            .map(|c| c.registered)
            .unwrap_or(false);

        match msg.event.as_str() {
            messages::EVENT_REGISTER => match messages::parse_register(&msg) {
                Ok((peer, password)) if password == self.config.password => {
                    if let Some(conn) = self.conns.get_mut(&conn_id) {
                        conn.registered = true;
                    }
                    info!(peer = %peer, "fabric registered");
                    let response = EventMessage::success_response(
                        &msg,
                        serde_json::json!({ "name": self.config.name }),
                    );
                    self.send_signal(conn_id, &response).await;
                }
                _ => {
                    warn!(conn_id, "register with bad credentials");
                    let response = EventMessage::error_response(&msg, ErrorCode::AuthFailure);
                    self.send_signal(conn_id, &response).await;
                    self.on_signal_close(conn_id);
                }
            },
            messages::EVENT_CONNECT_MEDIA if registered => {
                self.on_connect_media(conn_id, msg).await;
            }
            messages::EVENT_CONNECT_LOOPS if registered => {
                self.on_connect_loops(conn_id, msg).await;
            }
            _ => {
                let response = EventMessage::error_response(&msg, ErrorCode::ParameterError);
                self.send_signal(conn_id, &response).await;
            }
        }
    }

    async fn on_connect_media(&mut self, conn_id: u64, msg: EventMessage) {
        let media = match messages::parse_connect_media(&msg) {
            Ok(media) => media,
            Err(e) => {
                debug!(error = %e, "bad connect_media");
                let response = EventMessage::error_response(&msg, ErrorCode::ParameterError);
                self.send_signal(conn_id, &response).await;
                return;
            }
        };

        if media.codec != self.config.codec {
            warn!(theirs = %media.codec, ours = %self.config.codec, "codec mismatch");
            let response = EventMessage::error_response(&msg, ErrorCode::CodecMismatch);
            self.send_signal(conn_id, &response).await;
            return;
        }

        let remote_media: SocketAddr = match format!("{}:{}", media.host, media.port).parse() {
            Ok(addr) => addr,
            Err(_) => {
                let response = EventMessage::error_response(&msg, ErrorCode::ParameterError);
                self.send_signal(conn_id, &response).await;
                return;
            }
        };

        let session_id = Uuid::new_v4();
        let mut session =
            InterconnectSession::new(session_id, DtlsRole::Passive, self.config.cleartext);
        session.set_remote_media(remote_media);

        if self.config.cleartext {
            let _ = session.mark_ready_cleartext();
        } else {
            self.spawn_handshake(&mut session, DtlsRole::Passive, None, remote_media);
        }

        self.by_media_addr.insert(remote_media, session_id);
        self.sessions.insert(session_id, session);
        if let Some(conn) = self.conns.get_mut(&conn_id) {
            conn.sessions.push(session_id);
        }
        info!(session = %session_id, peer = %media.name, %remote_media, "interconnect session created");

        let (advert_host, advert_port) = self.advertised_media();
        let response = messages::connect_media_response(
            &msg,
            &self.config.name,
            &advert_host,
            advert_port,
            self.certificate.fingerprint(),
        );
        self.send_signal(conn_id, &response).await;
    }

    async fn on_connect_loops(&mut self, conn_id: u64, msg: EventMessage) {
        let session_id = self
            .conns
            .get(&conn_id)
            .and_then(|c| c.sessions.last().copied());
        let Some(session_id) = session_id else {
            let response = EventMessage::error_response(&msg, ErrorCode::SessionUnknown);
            self.send_signal(conn_id, &response).await;
            return;
        };

        let requested = match messages::parse_connect_loops(&msg) {
            Ok(loops) => loops,
            Err(e) => {
                debug!(error = %e, "bad connect_loops");
                let response = EventMessage::error_response(&msg, ErrorCode::ParameterError);
                self.send_signal(conn_id, &response).await;
                return;
            }
        };

        let mut answer = Vec::new();
        if let Some(session) = self.sessions.get_mut(&session_id) {
            for entry in requested {
                let Some(endpoint) = self.loops.get(&entry.name) else {
                    continue;
                };
                session.add_loop(&entry.name, entry.ssrc);
                answer.push(LoopEntry {
                    name: entry.name,
                    ssrc: endpoint.local_ssrc(),
                });
            }
        }

        let response = messages::connect_loops_response(&msg, &answer);
        self.send_signal(conn_id, &response).await;
    }

    async fn on_client_message(&mut self, msg: EventMessage) {
        let Some(client) = &self.client else { return };
        let conn_id = client.conn;
        let phase = client.phase;

        if !msg.is_response() {
            debug!(event = %msg.event, "unexpected request from server fabric");
            return;
        }

        if msg.result_code() != 0 {
            warn!(
                event = %msg.event,
                code = msg.result_code(),
                "signaling request rejected"
            );
            self.on_signal_close(conn_id);
            return;
        }

        match (phase, msg.event.as_str()) {
            (ClientPhase::AwaitRegister, messages::EVENT_REGISTER) => {
                let (advert_host, advert_port) = self.advertised_media();
                let request = messages::connect_media(
                    &self.config.name,
                    &self.config.codec,
                    &advert_host,
                    advert_port,
                );
                self.send_signal(conn_id, &request).await;
                if let Some(client) = &mut self.client {
                    client.phase = ClientPhase::AwaitMedia;
                }
            }
            (ClientPhase::AwaitMedia, messages::EVENT_CONNECT_MEDIA) => {
                let response = match messages::parse_connect_media_response(&msg) {
                    Ok(r) => r,
                    Err(e) => {
                        warn!(error = %e, "bad connect_media response");
                        self.on_signal_close(conn_id);
                        return;
                    }
                };
                let remote_media: SocketAddr =
                    match format!("{}:{}", response.host, response.port).parse() {
                        Ok(addr) => addr,
                        Err(_) => {
                            warn!("unparsable remote media endpoint");
                            self.on_signal_close(conn_id);
                            return;
                        }
                    };

                let session_id = Uuid::new_v4();
                let mut session =
                    InterconnectSession::new(session_id, DtlsRole::Active, self.config.cleartext);
                session.set_remote_media(remote_media);
                session.set_remote_fingerprint(response.fingerprint.clone());

                let cleartext = self.config.cleartext;
                if cleartext {
                    let _ = session.mark_ready_cleartext();
                } else {
                    self.spawn_handshake(
                        &mut session,
                        DtlsRole::Active,
                        Some(response.fingerprint),
                        remote_media,
                    );
                }

                self.by_media_addr.insert(remote_media, session_id);
                self.sessions.insert(session_id, session);
                if let Some(conn) = self.conns.get_mut(&conn_id) {
                    conn.sessions.push(session_id);
                }
                if let Some(client) = &mut self.client {
                    client.session = Some(session_id);
                    client.phase = ClientPhase::AwaitLoops;
                }
                info!(session = %session_id, %remote_media, "media endpoint negotiated");

                // without a handshake the loop exchange starts right away
                if cleartext {
                    self.send_connect_loops(conn_id).await;
                }
            }
            (ClientPhase::AwaitLoops, messages::EVENT_CONNECT_LOOPS) => {
                let entries = match messages::parse_connect_loops_response(&msg) {
                    Ok(entries) => entries,
                    Err(e) => {
                        warn!(error = %e, "bad connect_loops response");
                        return;
                    }
                };
                let session_id = self.client.as_ref().and_then(|c| c.session);
                if let Some(session) =
                    session_id.and_then(|id| self.sessions.get_mut(&id))
                {
                    for entry in entries {
                        session.add_loop(&entry.name, entry.ssrc);
                    }
                }
                if let Some(client) = &mut self.client {
                    client.phase = ClientPhase::Running;
                }
                info!("loop bridge established");
            }
            (phase, event) => {
                debug!(?phase, event, "response ignored in this phase");
            }
        }
    }

    async fn on_handshake_done(
        &mut self,
        session_id: Uuid,
        result: std::result::Result<DtlsEndpoint, loopcast_rtp_core::Error>,
    ) {
        self.handshake_tasks.remove(&session_id);
        let Some(session) = self.sessions.get_mut(&session_id) else {
            return;
        };

        match result {
            Ok(endpoint) => {
                match session.srtp_ready(endpoint.outcome()) {
                    Ok(()) => {
                        self.dtls_endpoints.insert(session_id, endpoint);
                        info!(session = %session_id, "handshake finished, media path up");
                        // the client announces its loops once keys exist
                        let client_conn = self.client.as_ref().and_then(|c| {
                            (c.session == Some(session_id)).then_some(c.conn)
                        });
                        if let Some(conn_id) = client_conn {
                            self.send_connect_loops(conn_id).await;
                        }
                    }
                    Err(e) => {
                        warn!(session = %session_id, error = %e, "SRTP setup failed");
                        session.close_media();
                    }
                }
            }
            Err(e) => {
                warn!(session = %session_id, error = %e, "handshake failed");
                session.close_media();
            }
        }
    }

    async fn on_keepalive(&mut self) {
        let probes: Vec<SocketAddr> = self
            .sessions
            .values()
            .filter(|s| s.state() == SessionState::Ready)
            .filter_map(|s| s.remote_media())
            .collect();
        for dest in probes {
            let _ = self
                .media_socket
                .send_to(&stun::binding_request(), dest)
                .await;
        }
    }

    fn on_signal_close(&mut self, conn_id: u64) {
        let Some(conn) = self.conns.remove(&conn_id) else {
            return;
        };
        debug!(conn_id, addr = %conn.addr, "signaling connection closed");
        for session_id in conn.sessions {
            if let Some(session) = self.sessions.remove(&session_id) {
                if let Some(addr) = session.remote_media() {
                    self.by_media_addr.remove(&addr);
                }
            }
            if let Some(task) = self.handshake_tasks.remove(&session_id) {
                task.abort();
            }
            self.dtls_endpoints.remove(&session_id);
            info!(session = %session_id, "session unregistered");
        }
    }

    fn spawn_handshake(
        &mut self,
        session: &mut InterconnectSession,
        role: DtlsRole,
        remote_fingerprint: Option<String>,
        remote_media: SocketAddr,
    ) {
        let sink = Arc::new(MediaSink {
            socket: self.media_socket.clone(),
            dest: remote_media,
        });
        let (records, transport) = dtls_channel(sink, 64);
        session.handshake_started(records);

        let config = DtlsConfig {
            role,
            certificate: self.certificate.clone(),
            remote_fingerprint,
            retry_interval: Duration::from_millis(self.config.reconnect_interval_ms.max(1)),
        };
        let io = self.io_tx.clone();
        let session_id = session.id();
        let task = tokio::spawn(async move {
            let result = DtlsEndpoint::handshake(transport, config).await;
            let _ = io.send(Io::HandshakeDone(session_id, result)).await;
        });
        self.handshake_tasks.insert(session_id, task);
    }

    async fn send_connect_loops(&mut self, conn_id: u64) {
        let entries: Vec<LoopEntry> = self
            .loops
            .iter()
            .map(|(name, endpoint)| LoopEntry {
                name: name.clone(),
                ssrc: endpoint.local_ssrc(),
            })
            .collect();
        let request = messages::connect_loops(&entries);
        self.send_signal(conn_id, &request).await;
    }

    /// Host and port announced as this fabric's media endpoint.
    fn advertised_media(&self) -> (String, u16) {
        let host = self
            .config
            .media
            .rsplit_once(':')
            .map(|(host, _)| host.to_string())
            .unwrap_or_else(|| self.media_addr.ip().to_string());
        (host, self.media_addr.port())
    }

    async fn send_signal(&mut self, conn_id: u64, msg: &EventMessage) {
        if let Some(conn) = self.conns.get_mut(&conn_id) {
            if let Err(e) = conn.writer.send(msg).await {
                warn!(conn_id, error = %e, "signaling write failed");
            }
        }
    }
}
