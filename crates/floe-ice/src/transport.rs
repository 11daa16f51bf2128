//! Local transport: one UDP socket, two paths.
//!
//! A transport owns its socket and a driver task. Path 0 is the socket
//! itself; path 1 appears once a TURN allocation is active and wraps
//! traffic in Send/Data indications or ChannelData frames. Every received
//! datagram runs through the STUN demultiplexer first: responses complete
//! pool transactions, unmatched requests and indications bubble up to the
//! agent (connectivity checks, keepalives), everything else is application
//! data.
//!
//! A discovery failure never tears the transport down; the corresponding
//! path is reported finished through [`TransportEvent::Error`] and gathering
//! moves on.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use floe_stun::{
    methods, ChannelData, Class, Message, OutgoingPacket, PoolConfig, RequestOptions,
    TransactionError, TransactionPool,
};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::addr::TransportAddress;
use crate::error::IceResult;
use crate::port_reserver::UdpPortReserver;
use crate::turn::TurnClient;

/// Stable transport identifier within one agent.
pub(crate) type TransportId = u64;

/// Direct socket path.
pub(crate) const PATH_DIRECT: u8 = 0;
/// TURN-relayed path.
pub(crate) const PATH_RELAYED: u8 = 1;

/// How often the reflexive liveness probe re-runs.
const BINDING_REFRESH_INTERVAL: Duration = Duration::from_secs(45);

/// Attempts before a TURN allocation mismatch gives up (initial + retries).
const MISMATCH_ATTEMPTS: u32 = 3;

/// Which discovery path failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TransportErrorKind {
    Bind,
    Stun,
    Turn,
}

/// Notifications from a transport to the agent driver.
#[derive(Debug)]
pub(crate) enum TransportEvent {
    Started {
        id: TransportId,
    },
    /// The socket was rebound on a new port (allocation mismatch retry)
    Rebound {
        id: TransportId,
        addr: TransportAddress,
    },
    /// Discovery state moved; `None` fields mean the address went away
    AddressesChanged {
        id: TransportId,
        reflexive: Option<TransportAddress>,
        reflexive_source: Option<IpAddr>,
        relayed: Option<TransportAddress>,
    },
    /// An unmatched STUN request or indication from a peer (raw bytes kept
    /// for authentication by the agent)
    StunPacket {
        id: TransportId,
        path: u8,
        from: TransportAddress,
        data: Vec<u8>,
    },
    /// Application data
    Datagram {
        id: TransportId,
        path: u8,
        from: TransportAddress,
        data: Vec<u8>,
    },
    Error {
        id: TransportId,
        kind: TransportErrorKind,
    },
    Stopped {
        id: TransportId,
    },
}

/// TURN service settings for one transport.
pub(crate) struct TurnSettings {
    pub server: SocketAddr,
    pub username: String,
    pub key: Vec<u8>,
}

/// Everything needed to spawn a transport.
pub(crate) struct TransportSettings {
    pub id: TransportId,
    pub local_ip: IpAddr,
    pub stun_bind: Option<SocketAddr>,
    pub turn: Option<TurnSettings>,
    pub pool: PoolConfig,
    pub software: Option<String>,
    /// Pre-bound socket borrowed from the reserver
    pub borrowed: Option<Arc<UdpSocket>>,
    pub reserver: Option<Arc<UdpPortReserver>>,
}

/// Cheap clonable handle the agent keeps per transport.
#[derive(Clone)]
pub(crate) struct TransportHandle {
    pub id: TransportId,
    pub local_addr: TransportAddress,
    pool: Arc<TransactionPool>,
    cmd: mpsc::UnboundedSender<Cmd>,
}

impl TransportHandle {
    pub fn pool(&self) -> Arc<TransactionPool> {
        self.pool.clone()
    }

    /// Kick off STUN Binding and/or TURN Allocate discovery.
    pub fn stun_start(&self) {
        let _ = self.cmd.send(Cmd::StunStart);
    }

    pub fn send_datagram(&self, path: u8, data: Vec<u8>, dest: SocketAddr) {
        let _ = self.cmd.send(Cmd::Send { path, data, dest });
    }

    /// Bind a TURN channel so traffic to `peer` uses the short header.
    pub fn add_channel_peer(&self, peer: TransportAddress) {
        let _ = self.cmd.send(Cmd::AddChannelPeer(peer));
    }

    pub fn stop(&self) {
        let _ = self.cmd.send(Cmd::Stop);
    }
}

enum Cmd {
    StunStart,
    Send {
        path: u8,
        data: Vec<u8>,
        dest: SocketAddr,
    },
    AddChannelPeer(TransportAddress),
    Stop,
}

type RequestResult = Result<(Message, SocketAddr), TransactionError>;

enum Internal {
    BindingResult { result: RequestResult, refresh: bool },
    BindingRefreshDue,
    AllocateResult(RequestResult),
    AllocationRefreshDue,
    RefreshResult(RequestResult),
    PermissionResult(IpAddr, RequestResult),
    ChannelBindResult(TransportAddress, u16, RequestResult),
}

/// Bind (or adopt) the socket and spawn the transport driver.
pub(crate) async fn spawn(
    settings: TransportSettings,
    events: mpsc::UnboundedSender<TransportEvent>,
) -> IceResult<TransportHandle> {
    let (socket, borrowed) = match settings.borrowed.clone() {
        Some(socket) => (socket, true),
        None => {
            let socket = UdpSocket::bind(SocketAddr::new(settings.local_ip, 0)).await?;
            (Arc::new(socket), false)
        }
    };
    let local_addr = TransportAddress::from(socket.local_addr()?);

    let (pool, pool_rx) = TransactionPool::new(settings.pool.clone());
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (internal_tx, internal_rx) = mpsc::unbounded_channel();

    let turn = settings
        .turn
        .as_ref()
        .map(|t| TurnClient::new(t.server, t.username.clone(), t.key.clone()));

    let driver = Driver {
        id: settings.id,
        local_ip: settings.local_ip,
        socket,
        borrowed,
        reserver: settings.reserver,
        pool: pool.clone(),
        pool_rx,
        cmd_rx,
        internal_tx,
        internal_rx,
        events,
        stun_bind: settings.stun_bind,
        turn,
        software: settings.software,
        reflexive: None,
        reflexive_source: None,
        retry_count: 0,
        stopping: false,
    };
    tokio::spawn(driver.run());

    Ok(TransportHandle {
        id: settings.id,
        local_addr,
        pool,
        cmd: cmd_tx,
    })
}

struct Driver {
    id: TransportId,
    local_ip: IpAddr,
    socket: Arc<UdpSocket>,
    borrowed: bool,
    reserver: Option<Arc<UdpPortReserver>>,
    pool: Arc<TransactionPool>,
    pool_rx: mpsc::UnboundedReceiver<OutgoingPacket>,
    cmd_rx: mpsc::UnboundedReceiver<Cmd>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    events: mpsc::UnboundedSender<TransportEvent>,
    stun_bind: Option<SocketAddr>,
    turn: Option<TurnClient>,
    software: Option<String>,
    reflexive: Option<TransportAddress>,
    reflexive_source: Option<IpAddr>,
    retry_count: u32,
    stopping: bool,
}

impl Driver {
    async fn run(mut self) {
        let _ = self.events.send(TransportEvent::Started { id: self.id });
        let mut buf = vec![0u8; 64 * 1024];

        loop {
            let socket = self.socket.clone();
            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(Cmd::Stop) | None => {
                            self.shutdown().await;
                            return;
                        }
                        Some(cmd) => self.handle_cmd(cmd).await,
                    }
                }
                Some(out) = self.pool_rx.recv() => {
                    self.send_packet(out.path, out.data, out.dest).await;
                }
                Some(internal) = self.internal_rx.recv() => {
                    self.handle_internal(internal).await;
                }
                received = socket.recv_from(&mut buf) => {
                    match received {
                        Ok((n, from)) => self.handle_incoming(&buf[..n], from),
                        Err(err) => warn!(id = self.id, %err, "socket receive error"),
                    }
                }
            }
        }
    }

    async fn handle_cmd(&mut self, cmd: Cmd) {
        match cmd {
            Cmd::StunStart => {
                self.start_binding(false);
                self.start_allocate();
            }
            Cmd::Send { path, data, dest } => self.send_packet(path, data, dest).await,
            Cmd::AddChannelPeer(peer) => {
                let request = match &mut self.turn {
                    Some(turn) if turn.active => turn.want_channel(peer).map(|channel| {
                        (
                            turn.channel_bind_request(peer, channel),
                            turn_options(turn),
                            turn.server,
                            channel,
                        )
                    }),
                    _ => None,
                };
                if let Some((msg, opts, server, channel)) = request {
                    self.spawn_request(msg, server, opts, move |result| {
                        Internal::ChannelBindResult(peer, channel, result)
                    });
                }
            }
            Cmd::Stop => unreachable!("handled by the caller"),
        }
    }

    async fn send_packet(&mut self, path: u8, data: Vec<u8>, dest: SocketAddr) {
        if path == PATH_RELAYED {
            let Some(turn) = &mut self.turn else {
                trace!(id = self.id, "relayed send without TURN, dropped");
                return;
            };
            if !turn.active {
                trace!(id = self.id, "relayed send before allocation, dropped");
                return;
            }
            let peer = TransportAddress::from(dest);
            if !turn.has_permission(peer) {
                turn.queue_for_permission(peer, data);
                let request = turn.want_permission(peer).then(|| {
                    (turn.permission_request(peer), turn_options(turn), turn.server)
                });
                if let Some((msg, opts, server)) = request {
                    let ip = peer.ip();
                    self.spawn_request(msg, server, opts, move |result| {
                        Internal::PermissionResult(ip, result)
                    });
                }
                return;
            }
            let wrapped = turn.wrap_send(&data, peer);
            let server = turn.server;
            if let Err(err) = self.socket.send_to(&wrapped, server).await {
                warn!(id = self.id, %err, "relayed send failed");
            }
        } else if let Err(err) = self.socket.send_to(&data, dest).await {
            warn!(id = self.id, %err, %dest, "send failed");
        }
    }

    fn handle_incoming(&self, data: &[u8], from: SocketAddr) {
        if let Some(turn) = &self.turn {
            if from == turn.server {
                if ChannelData::is_channel_data(data) {
                    match ChannelData::decode(data) {
                        Ok(cd) => {
                            if let Some(peer) = turn.peer_for_channel(cd.channel) {
                                self.deliver(PATH_RELAYED, peer, &cd.data);
                            } else {
                                trace!(id = self.id, channel = cd.channel, "data on unbound channel");
                            }
                        }
                        Err(err) => trace!(id = self.id, %err, "bad channel-data frame"),
                    }
                    return;
                }
                match self.pool.deliver(data, from) {
                    floe_stun::Disposition::Handled => {}
                    floe_stun::Disposition::Indication(msg) if msg.method() == methods::DATA => {
                        if let Some((peer, payload)) = TurnClient::unwrap_data_indication(&msg) {
                            self.deliver(PATH_RELAYED, peer, &payload);
                        }
                    }
                    _ => {
                        trace!(id = self.id, "unexpected non-transaction packet from relay");
                    }
                }
                return;
            }
        }
        self.deliver(PATH_DIRECT, TransportAddress::from(from), data);
    }

    /// STUN-demultiplex one datagram on a given path.
    fn deliver(&self, path: u8, from: TransportAddress, data: &[u8]) {
        match self.pool.deliver(data, from.socket_addr()) {
            floe_stun::Disposition::Handled => {}
            floe_stun::Disposition::Request(_) | floe_stun::Disposition::Indication(_) => {
                let _ = self.events.send(TransportEvent::StunPacket {
                    id: self.id,
                    path,
                    from,
                    data: data.to_vec(),
                });
            }
            floe_stun::Disposition::AppData => {
                let _ = self.events.send(TransportEvent::Datagram {
                    id: self.id,
                    path,
                    from,
                    data: data.to_vec(),
                });
            }
        }
    }

    fn start_binding(&self, refresh: bool) {
        let Some(server) = self.stun_bind else {
            return;
        };
        let mut msg = Message::new(Class::Request, methods::BINDING);
        if let Some(software) = &self.software {
            msg.add_software(software);
        }
        self.spawn_request(
            msg,
            server,
            RequestOptions {
                fingerprint: true,
                ..RequestOptions::default()
            },
            move |result| Internal::BindingResult { result, refresh },
        );
    }

    fn start_allocate(&self) {
        let Some(turn) = &self.turn else {
            return;
        };
        let mut msg = turn.allocate_request();
        if let Some(software) = &self.software {
            msg.add_software(software);
        }
        let opts = turn_options(turn);
        self.spawn_request(msg, turn.server, opts, Internal::AllocateResult);
    }

    async fn handle_internal(&mut self, internal: Internal) {
        match internal {
            Internal::BindingResult { result, refresh } => {
                self.on_binding_result(result, refresh);
            }
            Internal::BindingRefreshDue => {
                if !self.stopping {
                    self.start_binding(true);
                }
            }
            Internal::AllocateResult(result) => self.on_allocate_result(result).await,
            Internal::AllocationRefreshDue => self.on_allocation_refresh_due(),
            Internal::RefreshResult(result) => {
                match result {
                    Ok((msg, _)) => {
                        let after = self.turn.as_mut().map(|turn| {
                            if let Some(secs) = msg.lifetime() {
                                turn.lifetime = Duration::from_secs(secs.max(60) as u64);
                            }
                            turn.refresh_after()
                        });
                        if let Some(after) = after {
                            self.schedule_internal(after, Internal::AllocationRefreshDue);
                        }
                    }
                    Err(err) => {
                        // the relay died under us; candidates built on it
                        // will fail their checks on their own
                        warn!(id = self.id, %err, "TURN refresh failed");
                    }
                }
            }
            Internal::PermissionResult(ip, result) => {
                let Some(turn) = &mut self.turn else { return };
                match result {
                    Ok(_) => {
                        let released = turn.on_permission_installed(ip);
                        for (peer, data) in released {
                            let wrapped = turn.wrap_send(&data, peer);
                            let server = turn.server;
                            if let Err(err) = self.socket.send_to(&wrapped, server).await {
                                warn!(id = self.id, %err, "relayed send failed");
                                break;
                            }
                        }
                    }
                    Err(err) => {
                        warn!(id = self.id, %ip, %err, "TURN permission failed");
                        turn.on_permission_failed(ip);
                    }
                }
            }
            Internal::ChannelBindResult(peer, channel, result) => {
                let Some(turn) = &mut self.turn else { return };
                match result {
                    Ok(_) => turn.on_channel_bound(peer, channel),
                    Err(err) => {
                        warn!(id = self.id, %peer, %err, "TURN channel bind failed");
                        turn.on_channel_failed(peer);
                    }
                }
            }
        }
    }

    fn on_binding_result(&mut self, result: RequestResult, refresh: bool) {
        match result {
            Ok((msg, _)) => match msg.xor_mapped_address() {
                Some(mapped) => {
                    let mapped = TransportAddress::from(mapped);
                    let changed = self.reflexive != Some(mapped);
                    self.reflexive = Some(mapped);
                    self.reflexive_source = self.stun_bind.map(|s| s.ip());
                    if changed {
                        debug!(id = self.id, %mapped, "server reflexive address discovered");
                        self.emit_addresses_changed();
                    }
                    self.schedule_internal(BINDING_REFRESH_INTERVAL, Internal::BindingRefreshDue);
                }
                None => {
                    debug!(id = self.id, "binding response without mapped address");
                    if !refresh {
                        let _ = self.events.send(TransportEvent::Error {
                            id: self.id,
                            kind: TransportErrorKind::Stun,
                        });
                    }
                }
            },
            Err(err) => {
                if refresh {
                    // liveness probe failed: the reflexive address is gone
                    if self.reflexive.take().is_some() {
                        debug!(id = self.id, %err, "reflexive address lost");
                        self.reflexive_source = None;
                        self.emit_addresses_changed();
                    }
                } else {
                    debug!(id = self.id, %err, "STUN binding failed");
                    let _ = self.events.send(TransportEvent::Error {
                        id: self.id,
                        kind: TransportErrorKind::Stun,
                    });
                }
            }
        }
    }

    async fn on_allocate_result(&mut self, result: RequestResult) {
        match result {
            Ok((msg, _)) => {
                let Some(turn) = &mut self.turn else { return };
                let relayed = msg.xor_relayed_address();
                let reflexive = msg.xor_mapped_address();
                turn.on_allocated(relayed, reflexive, msg.lifetime());
                // the allocation doubles as a reflexive probe when no
                // dedicated binding server is configured
                if self.stun_bind.is_none() {
                    self.reflexive = turn.reflexive;
                    self.reflexive_source = Some(turn.server.ip());
                }
                let after = turn.refresh_after();
                self.emit_addresses_changed();
                self.schedule_internal(after, Internal::AllocationRefreshDue);
            }
            Err(TransactionError::Rejected { code: 437, .. })
                if !self.borrowed
                    && self.local_ip.is_ipv4()
                    && self.retry_count + 1 < MISMATCH_ATTEMPTS
                    && !self.stopping =>
            {
                self.retry_count += 1;
                debug!(id = self.id, attempt = self.retry_count, "allocation mismatch, rebinding");
                self.rebind().await;
            }
            Err(err) => {
                debug!(id = self.id, %err, "TURN allocation failed");
                let _ = self.events.send(TransportEvent::Error {
                    id: self.id,
                    kind: TransportErrorKind::Turn,
                });
            }
        }
    }

    fn on_allocation_refresh_due(&mut self) {
        if self.stopping {
            return;
        }
        let Some(turn) = &self.turn else { return };
        if !turn.active {
            return;
        }
        let msg = turn.refresh_request(turn.lifetime);
        let opts = turn_options(turn);
        self.spawn_request(msg, turn.server, opts, Internal::RefreshResult);

        // permissions expire on their own schedule; reinstall alongside the
        // allocation refresh
        for ip in turn.permissions() {
            let msg = turn.permission_request(TransportAddress::new(ip, 0));
            let opts = turn_options(turn);
            self.spawn_request(msg, turn.server, opts, move |result| {
                Internal::PermissionResult(ip, result)
            });
        }
    }

    /// Allocation-mismatch recovery: fresh socket on a new random port, new
    /// allocation, addresses reset.
    async fn rebind(&mut self) {
        let socket = match UdpSocket::bind(SocketAddr::new(self.local_ip, 0)).await {
            Ok(socket) => Arc::new(socket),
            Err(err) => {
                warn!(id = self.id, %err, "rebind failed");
                let _ = self.events.send(TransportEvent::Error {
                    id: self.id,
                    kind: TransportErrorKind::Bind,
                });
                return;
            }
        };
        let addr = match socket.local_addr() {
            Ok(addr) => TransportAddress::from(addr),
            Err(err) => {
                warn!(id = self.id, %err, "rebind failed");
                return;
            }
        };
        self.socket = socket;
        self.reflexive = None;
        self.reflexive_source = None;
        if let Some(turn) = self.turn.take() {
            self.turn = Some(TurnClient::new(turn.server, turn.username, turn.key));
        }
        let _ = self.events.send(TransportEvent::Rebound { id: self.id, addr });
        self.emit_addresses_changed();
        self.start_allocate();
        self.start_binding(false);
    }

    fn emit_addresses_changed(&self) {
        let _ = self.events.send(TransportEvent::AddressesChanged {
            id: self.id,
            reflexive: self.reflexive,
            reflexive_source: self.reflexive_source,
            relayed: self.turn.as_ref().and_then(|t| t.relayed),
        });
    }

    fn spawn_request(
        &self,
        msg: Message,
        dest: SocketAddr,
        opts: RequestOptions,
        wrap: impl FnOnce(RequestResult) -> Internal + Send + 'static,
    ) {
        let pool = self.pool.clone();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = pool.send_request(msg, dest, opts).await;
            let _ = tx.send(wrap(result));
        });
    }

    fn schedule_internal(&self, after: Duration, internal: Internal) {
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = tx.send(internal);
        });
    }

    async fn shutdown(&mut self) {
        self.stopping = true;
        self.pool.stop();

        // explicitly release the allocation; one shot, no retransmission
        if let Some(turn) = &self.turn {
            if turn.active {
                let mut msg = turn.refresh_request(Duration::ZERO);
                msg.add_username(&turn.username);
                let packet = msg.encode(Some(&turn.key), true);
                let _ = self.socket.send_to(&packet, turn.server).await;
            }
        }

        if self.borrowed {
            if let Some(reserver) = &self.reserver {
                reserver.give_back(self.socket.clone());
            }
        }
        debug!(id = self.id, "transport stopped");
        let _ = self.events.send(TransportEvent::Stopped { id: self.id });
    }
}

fn turn_options(turn: &TurnClient) -> RequestOptions {
    RequestOptions {
        username: Some(turn.username.clone()),
        key: Some(turn.key.clone()),
        fingerprint: true,
        path: PATH_DIRECT,
    }
}
