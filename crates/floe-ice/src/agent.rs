//! The ICE agent: gathering orchestration, the connectivity-check state
//! machine, nomination, and the datagram plane.
//!
//! [`IceAgent`] is a cheap handle; all mutable negotiation state lives in a
//! single driver task spawned by [`IceAgent::start`]. Transports feed the
//! driver through an event channel, API calls arrive as commands, and
//! connectivity-check completions come back over a third channel, so every
//! state transition happens on one task with no locks around ICE state.
//! Application-visible notifications leave through the [`IceEvent`] stream;
//! inbound datagrams sit in shared per-component queues so reads never have
//! to round-trip through the driver.
//!
//! ## Negotiation outline
//!
//! 1. `start` binds one transport per (component, local address) and
//!    gathers host, server-reflexive, and relayed candidates
//! 2. candidates and credentials are exchanged out of band
//! 3. `start_checks` runs paced Binding checks over the pair checklist,
//!    with triggered checks preempting priority order
//! 4. the controlling agent nominates; both sides converge on one selected
//!    pair per component and `IceFinished` fires
//! 5. keepalives and consent freshness guard the selected pairs until
//!    `stop`

use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use floe_stun::{
    methods, Class, Message, PoolConfig, RequestOptions, TransactionError,
};
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::addr::TransportAddress;
use crate::candidate::{
    candidate_priority, CandidateExchange, CandidateInfo, CandidateType, FoundationRegistry,
};
use crate::component::{is_redundant, Component, ComponentTransport, LocalCandidate};
use crate::config::{Features, IceConfig, IceMode};
use crate::credentials::{random_credential, Password, UFRAG_LEN};
use crate::error::{IceError, IceErrorKind, IceResult};
use crate::events::IceEvent;
use crate::pair::{pair_priority, CheckList, PairId, PairState};
use crate::transport::{
    self, TransportErrorKind, TransportEvent, TransportId, TransportSettings, TurnSettings,
    PATH_DIRECT, PATH_RELAYED,
};

/// Agent lifecycle as seen by the handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Idle,
    Running,
    Stopped,
}

/// Driver-internal phase, mirroring the negotiation stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Binding sockets, gathering candidates
    Starting,
    /// Local candidates ready; checks may run
    Started,
    /// All components have selected pairs
    Active,
    /// Tearing down
    Stopping,
}

enum Command {
    SetRemoteCredentials(String, Password),
    SetRemoteFeatures(Features),
    AddRemoteCandidates(Vec<CandidateExchange>),
    RemoteGatheringComplete,
    StartChecks,
    Write { component: usize, data: Vec<u8> },
    FlagLowOverhead { component: usize },
    Stop,
}

struct CheckOutcome {
    pair: PairId,
    seq: u32,
    result: Result<(Message, std::net::SocketAddr), TransactionError>,
    sent_use_candidate: bool,
    sent_priority: u32,
    /// Role at the moment the check left; a 487 only flips the role if it
    /// has not flipped since (RFC 8445 7.2.5.1)
    sent_controlling: bool,
}

struct Control {
    lifecycle: Lifecycle,
    cmd: Option<mpsc::UnboundedSender<Command>>,
    pending_credentials: Option<(String, Password)>,
    pending_features: Option<Features>,
    pending_candidates: Vec<CandidateExchange>,
    pending_gathering_complete: bool,
}

struct Shared {
    cfg: IceConfig,
    local_ufrag: String,
    local_password: Password,
    events: mpsc::UnboundedSender<IceEvent>,
    inbound: Mutex<Vec<VecDeque<Vec<u8>>>>,
    control: Mutex<Control>,
}

/// One end of an ICE negotiation.
pub struct IceAgent {
    shared: Arc<Shared>,
}

impl IceAgent {
    /// Validate the configuration and create an agent plus its event
    /// stream. Local credentials are generated here so they can be
    /// signalled before `start`.
    pub fn new(cfg: IceConfig) -> IceResult<(Self, mpsc::UnboundedReceiver<IceEvent>)> {
        cfg.validate()?;
        let (events, events_rx) = mpsc::unbounded_channel();
        let component_count = cfg.component_count;
        let shared = Arc::new(Shared {
            cfg,
            local_ufrag: random_credential(UFRAG_LEN),
            local_password: Password::generate(),
            events,
            inbound: Mutex::new(vec![VecDeque::new(); component_count]),
            control: Mutex::new(Control {
                lifecycle: Lifecycle::Idle,
                cmd: None,
                pending_credentials: None,
                pending_features: None,
                pending_candidates: Vec::new(),
                pending_gathering_complete: false,
            }),
        });
        Ok((Self { shared }, events_rx))
    }

    pub fn local_ufrag(&self) -> &str {
        &self.shared.local_ufrag
    }

    /// The local password, for the signalling layer.
    pub fn local_password(&self) -> &str {
        self.shared.local_password.reveal()
    }

    /// Spawn the driver: bind sockets and begin gathering.
    pub fn start(&self) -> IceResult<()> {
        let mut control = self.shared.control.lock();
        match control.lifecycle {
            Lifecycle::Running => return Err(IceError::AlreadyStarted),
            Lifecycle::Stopped => return Err(IceError::AlreadyStarted),
            Lifecycle::Idle => {}
        }
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        // replay anything signalled before start
        if let Some((ufrag, password)) = control.pending_credentials.take() {
            let _ = cmd_tx.send(Command::SetRemoteCredentials(ufrag, password));
        }
        if let Some(features) = control.pending_features.take() {
            let _ = cmd_tx.send(Command::SetRemoteFeatures(features));
        }
        if !control.pending_candidates.is_empty() {
            let _ = cmd_tx.send(Command::AddRemoteCandidates(std::mem::take(
                &mut control.pending_candidates,
            )));
        }
        if std::mem::take(&mut control.pending_gathering_complete) {
            let _ = cmd_tx.send(Command::RemoteGatheringComplete);
        }

        control.lifecycle = Lifecycle::Running;
        control.cmd = Some(cmd_tx);
        drop(control);

        let shared = self.shared.clone();
        tokio::spawn(Driver::run(shared, cmd_rx));
        Ok(())
    }

    /// Set the peer's ufrag and password received via signalling.
    pub fn set_remote_credentials(&self, ufrag: impl Into<String>, password: impl Into<String>) {
        let ufrag = ufrag.into();
        let password = Password::new(password.into());
        let mut control = self.shared.control.lock();
        match &control.cmd {
            Some(cmd) => {
                let _ = cmd.send(Command::SetRemoteCredentials(ufrag, password));
            }
            None => control.pending_credentials = Some((ufrag, password)),
        }
    }

    /// Set the peer's capability flags received via signalling.
    pub fn set_remote_features(&self, features: Features) {
        let mut control = self.shared.control.lock();
        match &control.cmd {
            Some(cmd) => {
                let _ = cmd.send(Command::SetRemoteFeatures(features));
            }
            None => control.pending_features = Some(features),
        }
    }

    /// Feed candidates received via signalling. May be called repeatedly
    /// (trickle).
    pub fn add_remote_candidates(&self, candidates: Vec<CandidateExchange>) {
        let mut control = self.shared.control.lock();
        match &control.cmd {
            Some(cmd) => {
                let _ = cmd.send(Command::AddRemoteCandidates(candidates));
            }
            None => control.pending_candidates.extend(candidates),
        }
    }

    /// The peer signalled end-of-candidates.
    pub fn set_remote_gathering_complete(&self) {
        let mut control = self.shared.control.lock();
        match &control.cmd {
            Some(cmd) => {
                let _ = cmd.send(Command::RemoteGatheringComplete);
            }
            None => control.pending_gathering_complete = true,
        }
    }

    /// Begin connectivity checks.
    pub fn start_checks(&self) -> IceResult<()> {
        self.send(Command::StartChecks)
    }

    /// Queue a datagram for the component (0-based index). Before a usable
    /// pair exists writes are buffered (bounded; overflow is dropped).
    pub fn write_datagram(&self, component_index: usize, data: &[u8]) -> IceResult<()> {
        if component_index >= self.shared.cfg.component_count {
            return Err(IceError::UnknownComponent(component_index));
        }
        self.send(Command::Write {
            component: component_index,
            data: data.to_vec(),
        })
    }

    /// Whether `read_datagram` would yield data.
    pub fn has_pending_datagrams(&self, component_index: usize) -> bool {
        self.shared
            .inbound
            .lock()
            .get(component_index)
            .map(|q| !q.is_empty())
            .unwrap_or(false)
    }

    /// Pop the oldest received datagram for the component.
    pub fn read_datagram(&self, component_index: usize) -> Option<Vec<u8>> {
        self.shared.inbound.lock().get_mut(component_index)?.pop_front()
    }

    /// Request TURN channel binding for the component's traffic so the
    /// relayed path uses the 4-byte header.
    pub fn flag_component_as_low_overhead(&self, component_index: usize) -> IceResult<()> {
        if component_index >= self.shared.cfg.component_count {
            return Err(IceError::UnknownComponent(component_index));
        }
        self.send(Command::FlagLowOverhead {
            component: component_index,
        })
    }

    /// Tear the agent down. Idempotent: repeated calls collapse into one
    /// `Stopped` event.
    pub fn stop(&self) {
        let control = self.shared.control.lock();
        if let Some(cmd) = &control.cmd {
            let _ = cmd.send(Command::Stop);
        }
    }

    /// After `stop` has completed, return the agent to its pre-start state
    /// so `start` may be called again.
    pub fn reset(&self) -> IceResult<()> {
        let mut control = self.shared.control.lock();
        if control.lifecycle == Lifecycle::Running {
            return Err(IceError::AlreadyStarted);
        }
        control.lifecycle = Lifecycle::Idle;
        control.cmd = None;
        control.pending_credentials = None;
        control.pending_features = None;
        control.pending_candidates.clear();
        control.pending_gathering_complete = false;
        drop(control);
        for queue in self.shared.inbound.lock().iter_mut() {
            queue.clear();
        }
        Ok(())
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.control.lock().lifecycle != Lifecycle::Running
    }

    fn send(&self, command: Command) -> IceResult<()> {
        let control = self.shared.control.lock();
        match &control.cmd {
            Some(cmd) if control.lifecycle == Lifecycle::Running => {
                let _ = cmd.send(command);
                Ok(())
            }
            _ => Err(IceError::NotStarted),
        }
    }
}

// ---------------------------------------------------------------------------
// driver
// ---------------------------------------------------------------------------

struct Driver {
    shared: Arc<Shared>,
    events: mpsc::UnboundedSender<IceEvent>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    tev_tx: mpsc::UnboundedSender<TransportEvent>,
    tev_rx: mpsc::UnboundedReceiver<TransportEvent>,
    check_tx: mpsc::UnboundedSender<CheckOutcome>,
    check_rx: mpsc::UnboundedReceiver<CheckOutcome>,

    registry: FoundationRegistry,
    controlling: bool,
    tie_breaker: u64,
    remote_ufrag: Option<String>,
    remote_password: Option<Password>,
    remote_features: Features,

    components: Vec<Component>,
    candidates: Vec<LocalCandidate>,
    remote_candidates: Vec<CandidateInfo>,
    check_list: CheckList,

    phase: Phase,
    local_host_finished: bool,
    local_gathering_complete: bool,
    remote_gathering_complete: bool,
    ready_to_send: bool,
    can_start_checks: bool,
    pac_deadline: Option<Instant>,
    early_writes: Vec<VecDeque<Vec<u8>>>,
    early_dropped: u64,
    next_transport_id: TransportId,
    done: bool,
}

impl Driver {
    async fn run(shared: Arc<Shared>, cmd_rx: mpsc::UnboundedReceiver<Command>) {
        let (tev_tx, tev_rx) = mpsc::unbounded_channel();
        let (check_tx, check_rx) = mpsc::unbounded_channel();
        let component_count = shared.cfg.component_count;
        let controlling = shared.cfg.mode == IceMode::Initiator;
        let mut driver = Driver {
            events: shared.events.clone(),
            shared,
            cmd_rx,
            tev_tx,
            tev_rx,
            check_tx,
            check_rx,
            registry: FoundationRegistry::new(),
            controlling,
            tie_breaker: rand::thread_rng().gen(),
            remote_ufrag: None,
            remote_password: None,
            remote_features: Features::empty(),
            components: Vec::new(),
            candidates: Vec::new(),
            remote_candidates: Vec::new(),
            check_list: CheckList::new(),
            phase: Phase::Starting,
            local_host_finished: false,
            local_gathering_complete: false,
            remote_gathering_complete: false,
            ready_to_send: false,
            can_start_checks: false,
            pac_deadline: None,
            early_writes: vec![VecDeque::new(); component_count],
            early_dropped: 0,
            next_transport_id: 0,
            done: false,
        };
        driver.start_components().await;
        if driver.done {
            return;
        }

        let mut pacing = tokio::time::interval(driver.shared.cfg.pacing);
        pacing.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = pacing.tick() => driver.on_tick(),
                Some(event) = driver.tev_rx.recv() => driver.on_transport_event(event),
                cmd = driver.cmd_rx.recv() => match cmd {
                    Some(cmd) => driver.on_command(cmd),
                    None => driver.begin_stop(),
                },
                Some(outcome) = driver.check_rx.recv() => driver.on_check_outcome(outcome),
            }
            if driver.done {
                return;
            }
        }
    }

    // ---- startup ----

    async fn start_components(&mut self) {
        let cfg = self.shared.cfg.clone();
        info!(
            mode = %cfg.mode,
            components = cfg.component_count,
            addresses = cfg.local_addresses.len(),
            "starting ICE agent"
        );

        for n in 0..cfg.component_count {
            let component_id = (n + 1) as u16;
            let mut component = Component::new(component_id);

            for (addr_index, local) in cfg.local_addresses.iter().enumerate() {
                // discovery services only apply to IPv4 transports
                let v4 = local.addr.is_ipv4();
                let stun_bind = if v4 { cfg.stun_bind_server } else { None };
                let turn = if v4 {
                    cfg.turn_udp_server.as_ref().map(|t| TurnSettings {
                        server: t.addr,
                        username: t.username.clone(),
                        key: t.password.key(),
                    })
                } else {
                    None
                };

                let borrowed_socket = cfg
                    .port_reserver
                    .as_ref()
                    .and_then(|r| r.borrow(local.addr));
                let borrowed = borrowed_socket.is_some();

                let id = self.next_transport_id;
                self.next_transport_id += 1;

                let settings = TransportSettings {
                    id,
                    local_ip: local.addr,
                    stun_bind,
                    turn,
                    pool: PoolConfig {
                        pacing: cfg.pacing,
                        ice_pacing: cfg.local_features.contains(Features::RTP_OPTIMIZATION),
                        ..PoolConfig::default()
                    },
                    software: cfg.software.clone(),
                    borrowed: borrowed_socket,
                    reserver: cfg.port_reserver.clone(),
                };
                let has_bind_service = settings.stun_bind.is_some();
                let has_relay_service = settings.turn.is_some();

                let handle = match transport::spawn(settings, self.tev_tx.clone()).await {
                    Ok(handle) => handle,
                    Err(err) => {
                        warn!(addr = %local.addr, %err, "failed to bind local transport");
                        continue;
                    }
                };
                debug!(
                    component = component_id,
                    transport = id,
                    addr = %handle.local_addr,
                    "transport bound"
                );

                let ext_addr = cfg
                    .external_addresses
                    .iter()
                    .find(|ea| {
                        ea.base.addr == local.addr
                            && ea
                                .port_base
                                .map(|p| p == handle.local_addr.port())
                                .unwrap_or(true)
                    })
                    .map(|ea| ea.addr);

                component.transports.push(ComponentTransport {
                    handle,
                    local: *local,
                    addr_index,
                    started: false,
                    stun_started: false,
                    stun_finished: false,
                    turn_finished: false,
                    ext_addr,
                    ext_finished: false,
                    borrowed,
                    stopping: false,
                    reflexive: None,
                    relayed: None,
                    has_bind_service,
                    has_relay_service,
                });
            }
            self.components.push(component);
        }

        if self.components.iter().all(|c| c.transports.is_empty()) {
            warn!("no local transport could be bound");
            let _ = self.events.send(IceEvent::Error(IceErrorKind::Generic));
            self.finish_stop();
        }
    }

    // ---- timers ----

    fn on_tick(&mut self) {
        if self.phase == Phase::Stopping {
            return;
        }
        let now = Instant::now();

        if let Some(deadline) = self.pac_deadline {
            if now >= deadline && self.phase != Phase::Active {
                info!("patiently-awaiting-connectivity timeout");
                let _ = self.events.send(IceEvent::Error(IceErrorKind::Generic));
                self.begin_stop();
                return;
            }
        }

        // nomination deadlines
        let due: Vec<u16> = self
            .components
            .iter()
            .filter(|c| {
                !c.stopped
                    && c.nomination_deadline
                        .map(|d| now >= d)
                        .unwrap_or(false)
            })
            .map(|c| c.id)
            .collect();
        for component_id in due {
            self.on_nomination_deadline(component_id);
            if self.done || self.phase == Phase::Stopping {
                return;
            }
        }

        if self.can_start_checks && self.phase == Phase::Started {
            if let Some(pair) = self.check_list.select_next() {
                self.launch_check(pair);
            }
            self.check_exhausted();
            self.try_select_on_checklist_done();
        }

        if self.phase == Phase::Active {
            self.keepalive_and_consent(now);
        }
    }

    fn on_nomination_deadline(&mut self, component_id: u16) {
        let aggressive = self.aggressive_effective();
        let comp = component_mut(&mut self.components, component_id);
        comp.nomination_deadline = None;
        if comp.selected.is_some() {
            return;
        }
        if aggressive {
            debug!(component = component_id, "nomination timeout, selecting best nominated pair");
            self.set_selected_pair(component_id);
        } else if !component_mut(&mut self.components, component_id).nominating {
            debug!(component = component_id, "nomination timeout, nominating highest valid pair");
            self.nominate_selected_pair(component_id);
        }
    }

    fn keepalive_and_consent(&mut self, now: Instant) {
        let interval = self.shared.cfg.keepalive_interval;
        let consent = self.shared.cfg.consent_timeout;

        let mut all_lost = !self.components.is_empty();
        for idx in 0..self.components.len() {
            let comp = &self.components[idx];
            let Some(selected) = comp.selected else {
                all_lost = false;
                continue;
            };
            let fresh = comp
                .last_inbound
                .map(|t| now.duration_since(t) <= consent)
                .unwrap_or(true);
            if fresh {
                all_lost = false;
            }

            let due = comp
                .last_keepalive
                .map(|t| now.duration_since(t) >= interval)
                .unwrap_or(true);
            if !due {
                continue;
            }
            let Some(pair) = self.check_list.pair(selected) else {
                continue;
            };
            let (remote, local_addr, component_id) =
                (pair.remote.addr, pair.local.addr, pair.local.component_id);
            if let Some(lc) = find_local_candidate(&self.candidates, local_addr, component_id) {
                let path = lc.path;
                let transport = lc.transport;
                if let Some(t) = self.components[idx].transport(transport) {
                    let msg = Message::new(Class::Indication, methods::BINDING);
                    t.handle
                        .pool()
                        .send_indication(msg, remote.socket_addr(), path, true);
                    trace!(component = component_id, "keepalive indication sent");
                }
            }
            self.components[idx].last_keepalive = Some(now);
        }

        if all_lost {
            info!("consent freshness expired on every component");
            let _ = self.events.send(IceEvent::Error(IceErrorKind::Disconnected));
            self.begin_stop();
        }
    }

    // ---- commands ----

    fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::SetRemoteCredentials(ufrag, password) => {
                self.remote_ufrag = Some(ufrag);
                self.remote_password = Some(password);
            }
            Command::SetRemoteFeatures(features) => {
                self.remote_features = features;
            }
            Command::AddRemoteCandidates(list) => self.add_remote_candidates(list),
            Command::RemoteGatheringComplete => {
                debug!("remote gathering complete");
                self.remote_gathering_complete = true;
                if self.local_gathering_complete && self.phase == Phase::Started {
                    let ids: Vec<u16> = self.components.iter().map(|c| c.id).collect();
                    for id in ids {
                        self.try_nominate(id);
                    }
                }
            }
            Command::StartChecks => {
                if !self.can_start_checks {
                    debug!("starting connectivity checks");
                    self.can_start_checks = true;
                    self.pac_deadline = Some(Instant::now() + self.shared.cfg.pac_timeout);
                }
            }
            Command::Write { component, data } => self.write_datagram(component, data),
            Command::FlagLowOverhead { component } => self.flag_low_overhead(component),
            Command::Stop => self.begin_stop(),
        }
    }

    fn add_remote_candidates(&mut self, list: Vec<CandidateExchange>) {
        let mut fresh: Vec<CandidateInfo> = Vec::new();
        for exchange in &list {
            let info = match CandidateInfo::try_from(exchange) {
                Ok(info) => info,
                Err(err) => {
                    warn!(%err, "ignoring malformed remote candidate");
                    continue;
                }
            };
            if info.component_id as usize > self.components.len() {
                warn!(component = info.component_id, "remote candidate for unknown component");
                continue;
            }
            // a previously learned peer-reflexive candidate is updated in
            // place when signalling catches up (RFC 8445 7.3.1.3); its
            // priority keeps the peer-reflexive preference
            if let Some(known) = self.remote_candidates.iter_mut().find(|r| {
                r.addr == info.addr
                    && r.component_id == info.component_id
                    && r.kind == CandidateType::PeerReflexive
            }) {
                debug!(addr = %info.addr, "remote prflx updated from signalling");
                known.kind = info.kind;
                known.foundation = info.foundation.clone();
                known.base = info.base;
                known.network = info.network;
                known.id = info.id.clone();
                continue;
            }
            fresh.push(info);
        }
        if fresh.is_empty() {
            return;
        }
        debug!(count = fresh.len(), total = self.remote_candidates.len() + fresh.len(), "adding remote candidates");
        self.remote_candidates.extend(fresh.iter().cloned());
        let locals = self.candidates.clone();
        self.do_pairing(&locals, &fresh);
    }

    fn write_datagram(&mut self, component_index: usize, data: Vec<u8>) {
        let Some(comp) = self.components.get(component_index) else {
            return;
        };
        let pair_id = comp.selected.or(comp.highest);
        let Some(pair_id) = pair_id else {
            // not ready: buffer, bounded
            let queue = &mut self.early_writes[component_index];
            if queue.len() >= self.shared.cfg.max_early_queue {
                self.early_dropped += 1;
                warn!(
                    component = component_index,
                    dropped = self.early_dropped,
                    "no usable pair yet, datagram dropped"
                );
                return;
            }
            queue.push_back(data);
            return;
        };
        let Some(pair) = self.check_list.pair(pair_id) else {
            return;
        };
        let (local_addr, remote, component_id) =
            (pair.local.addr, pair.remote.addr, pair.local.component_id);
        let Some(lc) = find_local_candidate(&self.candidates, local_addr, component_id) else {
            warn!(component = component_index, "selected pair has no local candidate");
            return;
        };
        let (path, transport) = (lc.path, lc.transport);
        if let Some(t) = self.components[component_index].transport(transport) {
            t.handle.send_datagram(path, data, remote.socket_addr());
        }
    }

    fn flag_low_overhead(&mut self, component_index: usize) {
        let Some(comp) = self.components.get_mut(component_index) else {
            return;
        };
        comp.low_overhead = true;
        let component_id = comp.id;
        // retroactively flag peers of pairs already on the valid list
        let valid: Vec<(TransportAddress, TransportAddress)> = self
            .check_list
            .valid_ids()
            .iter()
            .filter_map(|id| self.check_list.pair(*id))
            .filter(|p| p.local.component_id == component_id)
            .map(|p| (p.local.addr, p.remote.addr))
            .collect();
        for (local_addr, remote) in valid {
            self.flag_pair_low_overhead(component_id, local_addr, remote);
        }
    }

    fn flag_pair_low_overhead(
        &mut self,
        component_id: u16,
        local_addr: TransportAddress,
        remote: TransportAddress,
    ) {
        let Some(lc) = find_local_candidate(&self.candidates, local_addr, component_id) else {
            return;
        };
        let (transport, candidate_id) = (lc.transport, lc.info.id.clone());
        let comp = component_mut(&mut self.components, component_id);
        if comp.flag_channel_peer(&candidate_id, remote) {
            if let Some(t) = comp.transport(transport) {
                t.handle.add_channel_peer(remote);
            }
        }
    }

    // ---- transport events ----

    fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Started { id } => self.on_transport_started(id),
            TransportEvent::Rebound { id, addr } => self.on_transport_rebound(id, addr),
            TransportEvent::AddressesChanged {
                id,
                reflexive,
                reflexive_source,
                relayed,
            } => self.on_addresses_changed(id, reflexive, reflexive_source, relayed),
            TransportEvent::StunPacket {
                id,
                path,
                from,
                data,
            } => self.on_inbound_stun(id, path, from, data),
            TransportEvent::Datagram {
                id,
                path,
                from,
                data,
            } => self.on_inbound_datagram(id, path, from, data),
            TransportEvent::Error { id, kind } => self.on_transport_error(id, kind),
            TransportEvent::Stopped { id } => self.on_transport_stopped(id),
        }
    }

    fn on_transport_started(&mut self, id: TransportId) {
        let Some(comp_idx) = self.component_index_of(id) else {
            return;
        };
        if let Some(t) = self.components[comp_idx].transport_mut(id) {
            t.started = true;
        }

        if self.shared.cfg.use_local_candidates {
            let info = {
                let comp = &self.components[comp_idx];
                let t = comp.transport(id).expect("transport just seen");
                comp.host_candidate(t, &mut self.registry)
            };
            self.add_local_candidate(info, id, PATH_DIRECT);
            self.ensure_ext(comp_idx, id);
        }

        // kick discovery, or mark both paths finished when there is nothing
        // to discover
        if let Some(t) = self.components[comp_idx].transport_mut(id) {
            if !t.stun_started {
                t.stun_started = true;
                if t.has_bind_service || t.has_relay_service {
                    t.handle.stun_start();
                } else {
                    t.stun_finished = true;
                    t.turn_finished = true;
                }
            }
        }

        if !self.components[comp_idx].local_finished
            && self.components[comp_idx].all_transports_started()
        {
            self.components[comp_idx].local_finished = true;
        }
        if !self.local_host_finished && self.components.iter().all(|c| c.local_finished) {
            self.local_host_finished = true;
            if self.shared.cfg.local_features.contains(Features::TRICKLE) {
                self.dump_candidates_and_start();
            }
        }
        self.try_gathering_complete();
    }

    /// Static NAT mapping: pre-assigned server-reflexive candidate.
    fn ensure_ext(&mut self, comp_idx: usize, id: TransportId) {
        let info = {
            let comp = &self.components[comp_idx];
            let Some(t) = comp.transport(id) else { return };
            if t.ext_addr.is_none() || t.ext_finished {
                return;
            }
            match comp.ext_candidate(t, &mut self.registry) {
                Some(info) => info,
                None => return,
            }
        };
        if let Some(t) = self.components[comp_idx].transport_mut(id) {
            t.ext_finished = true;
        }
        if !is_redundant(&self.candidates, &info) {
            self.add_local_candidate(info, id, PATH_DIRECT);
        }
    }

    fn on_transport_rebound(&mut self, id: TransportId, addr: TransportAddress) {
        let Some(comp_idx) = self.component_index_of(id) else {
            return;
        };
        debug!(transport = id, %addr, "transport rebound, refreshing candidates");
        self.remove_candidates_for_transport(id);
        let comp = &mut self.components[comp_idx];
        if let Some(t) = comp.transport_mut(id) {
            t.handle.local_addr = addr;
            t.stun_finished = false;
            t.turn_finished = false;
            t.ext_finished = false;
        }
        if self.shared.cfg.use_local_candidates {
            let info = {
                let comp = &self.components[comp_idx];
                let Some(t) = comp.transport(id) else { return };
                comp.host_candidate(t, &mut self.registry)
            };
            self.add_local_candidate(info, id, PATH_DIRECT);
            self.ensure_ext(comp_idx, id);
        }
    }

    fn on_addresses_changed(
        &mut self,
        id: TransportId,
        reflexive: Option<TransportAddress>,
        reflexive_source: Option<IpAddr>,
        relayed: Option<TransportAddress>,
    ) {
        let Some(comp_idx) = self.component_index_of(id) else {
            return;
        };
        {
            let comp = &mut self.components[comp_idx];
            let Some(t) = comp.transport_mut(id) else { return };
            t.reflexive = reflexive;
            t.relayed = relayed;
        }

        if reflexive.is_some() {
            let already_done = self.components[comp_idx]
                .transport(id)
                .map(|t| t.stun_finished)
                .unwrap_or(true);
            if !already_done {
                // pass the mapping on to sibling transports on the same
                // interface that have no static mapping of their own
                let reflexive_ip = reflexive.map(|r| r.ip());
                let local_ip = self.components[comp_idx]
                    .transport(id)
                    .map(|t| t.local.addr);
                let siblings: Vec<TransportId> = self.components[comp_idx]
                    .transports
                    .iter()
                    .filter(|s| {
                        s.handle.id != id
                            && Some(s.local.addr) == local_ip
                            && s.ext_addr.is_none()
                    })
                    .map(|s| s.handle.id)
                    .collect();
                for sibling in siblings {
                    if let Some(s) = self.components[comp_idx].transport_mut(sibling) {
                        s.ext_addr = reflexive_ip;
                    }
                    if self.components[comp_idx]
                        .transport(sibling)
                        .map(|s| s.started)
                        .unwrap_or(false)
                    {
                        self.ensure_ext(comp_idx, sibling);
                    }
                }

                let info = {
                    let comp = &self.components[comp_idx];
                    let t = comp.transport(id).expect("transport just seen");
                    comp.srflx_candidate(t, reflexive_source, &mut self.registry)
                };
                if let Some(t) = self.components[comp_idx].transport_mut(id) {
                    t.stun_finished = true;
                }
                if let Some(info) = info {
                    if !is_redundant(&self.candidates, &info) {
                        self.add_local_candidate(info, id, PATH_DIRECT);
                    }
                }
            }
        } else {
            // reflexive address went away (liveness probe failed): retract
            // the candidate built on it
            let stale: Vec<String> = self
                .candidates
                .iter()
                .filter(|c| {
                    c.transport == id
                        && c.info.kind == CandidateType::ServerReflexive
                        && c.info.related.is_some()
                })
                .map(|c| c.info.id.clone())
                .collect();
            if !stale.is_empty() {
                self.remove_candidates_by_id(&stale);
            }
        }

        if relayed.is_some() {
            let already_done = self.components[comp_idx]
                .transport(id)
                .map(|t| t.turn_finished)
                .unwrap_or(true);
            if !already_done {
                let relay_server = self.shared.cfg.turn_udp_server.as_ref().map(|t| t.addr.ip());
                let info = {
                    let comp = &self.components[comp_idx];
                    let t = comp.transport(id).expect("transport just seen");
                    relay_server.and_then(|server| {
                        comp.relayed_candidate(t, server, &mut self.registry)
                    })
                };
                if let Some(t) = self.components[comp_idx].transport_mut(id) {
                    t.turn_finished = true;
                }
                if let Some(info) = info {
                    if !is_redundant(&self.candidates, &info) {
                        self.add_local_candidate(info, id, PATH_RELAYED);
                    }
                }
            }
        }

        self.try_gathering_complete();
    }

    fn on_transport_error(&mut self, id: TransportId, kind: TransportErrorKind) {
        let Some(comp_idx) = self.component_index_of(id) else {
            return;
        };
        match kind {
            TransportErrorKind::Bind => {
                debug!(transport = id, "transport bind failed, erasing");
                self.remove_candidates_for_transport(id);
                if let Some(t) = self.components[comp_idx].transport_mut(id) {
                    t.stopping = true;
                    t.handle.stop();
                }
            }
            TransportErrorKind::Stun => {
                // discovery failure is not fatal: the path is just finished
                if let Some(t) = self.components[comp_idx].transport_mut(id) {
                    t.stun_finished = true;
                }
            }
            TransportErrorKind::Turn => {
                if let Some(t) = self.components[comp_idx].transport_mut(id) {
                    t.turn_finished = true;
                }
            }
        }
        self.try_gathering_complete();
    }

    fn on_transport_stopped(&mut self, id: TransportId) {
        self.remove_candidates_for_transport(id);
        for comp in &mut self.components {
            comp.transports.retain(|t| t.handle.id != id);
        }
        if self.phase == Phase::Stopping
            && self.components.iter().all(|c| c.transports.is_empty())
        {
            self.finish_stop();
        } else if self.phase != Phase::Stopping {
            self.try_gathering_complete();
        }
    }

    // ---- candidate bookkeeping ----

    fn add_local_candidate(&mut self, info: CandidateInfo, transport: TransportId, path: u8) {
        debug!(candidate = %info, "local candidate added");
        let exchange = CandidateExchange::from(&info);
        self.candidates.push(LocalCandidate {
            info,
            transport,
            path,
        });

        if self.local_host_finished
            && self.shared.cfg.local_features.contains(Features::TRICKLE)
        {
            let _ = self.events.send(IceEvent::LocalCandidateAdded(exchange));
        }
        if self.phase == Phase::Started {
            let lc = self.candidates.last().cloned().expect("just pushed");
            let remotes = self.remote_candidates.clone();
            self.do_pairing(&[lc], &remotes);
        }
    }

    fn remove_candidates_for_transport(&mut self, id: TransportId) {
        let ids: Vec<String> = self
            .candidates
            .iter()
            .filter(|c| c.transport == id)
            .map(|c| c.info.id.clone())
            .collect();
        if !ids.is_empty() {
            self.remove_candidates_by_id(&ids);
        }
    }

    fn remove_candidates_by_id(&mut self, ids: &[String]) {
        let removed: Vec<LocalCandidate> = self
            .candidates
            .iter()
            .filter(|c| ids.contains(&c.info.id))
            .cloned()
            .collect();
        self.candidates.retain(|c| !ids.contains(&c.info.id));
        for lc in &removed {
            debug!(candidate = %lc.info, "local candidate removed");
            let comp = component_mut(&mut self.components, lc.info.component_id);
            comp.channel_peers.remove(&lc.info.id);
            let _ = self
                .events
                .send(IceEvent::LocalCandidateRemoved(CandidateExchange::from(&lc.info)));
        }
        self.check_list.remove_pairs_with_local(ids);
        // valid-list derived state may have pointed at removed pairs
        for comp in &mut self.components {
            if let Some(h) = comp.highest {
                if self.check_list.pair(h).is_none() {
                    comp.highest = self.check_list.highest_valid(comp.id);
                }
            }
        }
    }

    fn try_gathering_complete(&mut self) {
        if self.phase == Phase::Stopping {
            return;
        }
        for comp in &mut self.components {
            if !comp.gathering_complete && comp.gathering_complete_now() {
                comp.gathering_complete = true;
                debug!(component = comp.id, "component gathering complete");
            }
        }
        if self.local_gathering_complete
            || !self.components.iter().all(|c| c.gathering_complete)
        {
            return;
        }
        self.local_gathering_complete = true;
        info!("local gathering complete");
        if self.shared.cfg.local_features.contains(Features::TRICKLE) {
            let _ = self.events.send(IceEvent::LocalGatheringComplete);
        } else {
            self.dump_candidates_and_start();
        }
    }

    fn dump_candidates_and_start(&mut self) {
        if self.phase != Phase::Starting {
            return;
        }
        let list: Vec<CandidateExchange> = self
            .candidates
            .iter()
            .map(|c| CandidateExchange::from(&c.info))
            .collect();
        if !list.is_empty() {
            let _ = self.events.send(IceEvent::LocalCandidatesReady(list));
        }
        self.phase = Phase::Started;
        let _ = self.events.send(IceEvent::Started);

        if !self.remote_candidates.is_empty() {
            let locals = self.candidates.clone();
            let remotes = self.remote_candidates.clone();
            self.do_pairing(&locals, &remotes);
        }
    }

    // ---- pairing ----

    fn pair_priority_for(&self, local: &CandidateInfo, remote: &CandidateInfo) -> u64 {
        if self.controlling {
            pair_priority(local.priority, remote.priority)
        } else {
            pair_priority(remote.priority, local.priority)
        }
    }

    fn make_pair(
        &self,
        local: &CandidateInfo,
        remote: &CandidateInfo,
        allow_family_mismatch: bool,
    ) -> Option<(CandidateInfo, CandidateInfo, u64)> {
        if local.component_id != remote.component_id {
            return None;
        }
        if !allow_family_mismatch && !local.addr.same_family(&remote.addr) {
            return None;
        }
        // relaying to loopback never works and never makes sense
        if local.kind == CandidateType::Relayed && remote.addr.is_loopback() {
            return None;
        }
        let mut local = local.clone();
        // link-local pairs inherit the scope needed to route the reply
        if local.addr.is_ipv6_link_local() {
            local.base = local.addr;
        }
        Some((
            local.clone(),
            remote.clone(),
            self.pair_priority_for(&local, remote),
        ))
    }

    fn do_pairing(&mut self, locals: &[LocalCandidate], remotes: &[CandidateInfo]) {
        let mut pairs = Vec::new();
        for lc in locals {
            // local peer-reflexive candidates are never paired directly
            // (RFC 8445 7.2.5.3.1)
            if lc.info.kind == CandidateType::PeerReflexive {
                continue;
            }
            for rc in remotes {
                if let Some(pair) = self.make_pair(&lc.info, rc, false) {
                    pairs.push(pair);
                }
            }
        }
        if pairs.is_empty() {
            return;
        }
        self.check_list.add_pairs(pairs, self.components.len());
    }

    // ---- connectivity checks ----

    fn launch_check(&mut self, pair_id: PairId) {
        let (Some(remote_ufrag), Some(remote_password)) =
            (self.remote_ufrag.clone(), self.remote_password.clone())
        else {
            // no credentials yet: put the pair back
            if let Some(pair) = self.check_list.pair_mut(pair_id) {
                pair.state = PairState::Waiting;
            }
            return;
        };

        let (local_addr, remote, component_id, final_nomination, seq) = {
            let Some(pair) = self.check_list.pair_mut(pair_id) else {
                return;
            };
            pair.state = PairState::InProgress;
            pair.check_seq += 1;
            (
                pair.local.addr,
                pair.remote.addr,
                pair.local.component_id,
                pair.final_nomination,
                pair.check_seq,
            )
        };

        let Some(lc) = find_local_candidate(&self.candidates, local_addr, component_id) else {
            debug!(%local_addr, "check without local candidate, failing pair");
            self.handle_check_failure(pair_id);
            return;
        };
        let (path, transport_id) = (lc.path, lc.transport);

        let comp = component_ref(&self.components, component_id);
        let prflx_priority = comp.peer_reflexive_priority(transport_id, path);
        let Some(t) = comp.transport(transport_id) else {
            self.handle_check_failure(pair_id);
            return;
        };
        let pool = t.handle.pool();

        let use_candidate = self.controlling
            && (self
                .shared
                .cfg
                .local_features
                .contains(Features::AGGRESSIVE_NOMINATION)
                || final_nomination);

        let mut msg = Message::new(Class::Request, methods::BINDING);
        msg.add_priority(prflx_priority);
        if self.controlling {
            msg.add_ice_controlling(self.tie_breaker);
        } else {
            msg.add_ice_controlled(self.tie_breaker);
        }
        if use_candidate {
            msg.add_use_candidate();
        }

        if let Some(pair) = self.check_list.pair(pair_id) {
            trace!(
                pair = %pair,
                nominating = use_candidate && final_nomination,
                "sending connectivity check"
            );
        }

        let opts = RequestOptions {
            username: Some(format!("{}:{}", remote_ufrag, self.shared.local_ufrag)),
            key: Some(remote_password.key()),
            fingerprint: true,
            path,
        };
        let dest = remote.socket_addr();
        let tx = self.check_tx.clone();
        let sent_controlling = self.controlling;
        tokio::spawn(async move {
            let result = pool.send_request(msg, dest, opts).await;
            let _ = tx.send(CheckOutcome {
                pair: pair_id,
                seq,
                result,
                sent_use_candidate: use_candidate,
                sent_priority: prflx_priority,
                sent_controlling,
            });
        });
    }

    fn on_check_outcome(&mut self, outcome: CheckOutcome) {
        let Some(pair) = self.check_list.pair(outcome.pair) else {
            return;
        };
        // stale outcome from a superseded or cancelled attempt
        if pair.state != PairState::InProgress || pair.check_seq != outcome.seq {
            return;
        }
        match outcome.result {
            Ok((response, _)) => self.handle_check_success(
                outcome.pair,
                response,
                outcome.sent_use_candidate,
                outcome.sent_priority,
            ),
            Err(TransactionError::Conflict) => {
                self.handle_role_conflict(outcome.pair, outcome.sent_controlling)
            }
            Err(err) => {
                if let Some(pair) = self.check_list.pair(outcome.pair) {
                    debug!(pair = %pair, %err, "connectivity check failed");
                }
                self.handle_check_failure(outcome.pair);
            }
        }
    }

    fn handle_check_success(
        &mut self,
        pair_id: PairId,
        response: Message,
        sent_use_candidate: bool,
        sent_priority: u32,
    ) {
        let (local_info, remote_info, component_id, triggered_for_nomination, final_nomination) = {
            let pair = self.check_list.pair_mut(pair_id).expect("checked by caller");
            pair.state = PairState::Succeeded;
            (
                pair.local.clone(),
                pair.remote.clone(),
                pair.local.component_id,
                pair.triggered_for_nomination,
                pair.final_nomination,
            )
        };

        let Some(mapped) = response.xor_mapped_address() else {
            debug!("check response without mapped address");
            self.handle_check_failure(pair_id);
            return;
        };
        let mapped = TransportAddress::from(mapped);

        let mut valid_id = pair_id;
        if mapped != local_info.addr {
            // the response unmasked a different local address: rewrite the
            // pair onto the candidate owning it, discovering a local
            // peer-reflexive candidate if necessary (RFC 8445 7.2.5.3.1)
            let known = self
                .candidates
                .iter()
                .find(|c| {
                    c.info.component_id == component_id
                        && (c.info.base == mapped || c.info.addr == mapped)
                })
                .map(|c| c.info.clone());
            let local_for_pair = match known {
                Some(info) => info,
                None => {
                    let base_lc =
                        find_local_candidate(&self.candidates, local_info.addr, component_id)
                            .cloned();
                    let Some(base_lc) = base_lc else {
                        return;
                    };
                    let info = {
                        let comp = component_ref(&self.components, component_id);
                        comp.prflx_candidate(mapped, &local_info, sent_priority, &mut self.registry)
                    };
                    debug!(candidate = %info, "discovered local peer-reflexive candidate");
                    self.candidates.push(LocalCandidate {
                        info: info.clone(),
                        transport: base_lc.transport,
                        path: base_lc.path,
                    });
                    info
                }
            };

            let existing = self
                .check_list
                .pairs()
                .iter()
                .find(|p| {
                    p.local.component_id == component_id
                        && p.local.base == local_for_pair.base
                        && p.remote.addr == remote_info.addr
                })
                .map(|p| p.id);
            valid_id = match existing {
                Some(id) => {
                    trace!("mapped address belongs to a pair already on the checklist");
                    id
                }
                None => {
                    // NATs can rewrite across families; allow the mismatch
                    let Some(pair) = self.make_pair(&local_for_pair, &remote_info, true) else {
                        return;
                    };
                    let ids = self.check_list.add_pairs(vec![pair], self.components.len());
                    match ids.first() {
                        Some(id) => *id,
                        None => pair_id,
                    }
                }
            };
        }

        {
            let Some(pair) = self.check_list.pair_mut(valid_id) else {
                return;
            };
            pair.state = PairState::Succeeded;
            pair.triggered_for_nomination = triggered_for_nomination;
            pair.final_nomination = final_nomination;
            pair.nominated =
                triggered_for_nomination || (self.controlling && sent_use_candidate);
            debug!(pair = %pair, nominated = pair.nominated, "connectivity check succeeded");
        }
        self.on_new_valid_pair(valid_id);
    }

    fn on_new_valid_pair(&mut self, pair_id: PairId) {
        let (component_id, foundation, priority, nominated, local_addr, remote_addr) = {
            let Some(pair) = self.check_list.pair_mut(pair_id) else {
                return;
            };
            pair.valid = true;
            pair.state = PairState::Succeeded;
            (
                pair.local.component_id,
                pair.foundation.clone(),
                pair.priority,
                pair.nominated,
                pair.local.addr,
                pair.remote.addr,
            )
        };
        let comp_idx = (component_id - 1) as usize;
        self.components[comp_idx].has_valid = true;

        // siblings of a succeeded pair thaw (RFC 8445 7.2.5.3.3)
        self.check_list.unfreeze_foundation(&foundation);
        self.check_list.insert_valid(pair_id);

        {
            let comp = &mut self.components[comp_idx];
            if comp.selected.is_none() {
                let current = comp
                    .highest
                    .and_then(|h| self.check_list.pair(h))
                    .map(|p| p.priority)
                    .unwrap_or(0);
                if comp.highest.is_none() || priority > current {
                    comp.highest = Some(pair_id);
                }
            }
        }

        self.optimize_check_list(component_id);

        if self.components[comp_idx].low_overhead {
            self.flag_pair_low_overhead(component_id, local_addr, remote_addr);
        }

        if nominated {
            self.components[comp_idx].has_nominated = true;
            if self.aggressive_effective() {
                self.setup_nomination_timer(component_id);
            } else {
                self.set_selected_pair(component_id);
            }
        } else {
            self.setup_nomination_timer(component_id);
            self.try_nominate(component_id);
        }
        self.try_ready_to_send();
    }

    /// Frozen/waiting pairs that cannot beat the component's best valid
    /// pair are dead weight.
    fn optimize_check_list(&mut self, component_id: u16) {
        let Some(min_priority) = component_ref(&self.components, component_id)
            .highest
            .and_then(|h| self.check_list.pair(h))
            .map(|p| p.priority)
        else {
            return;
        };
        let to_fail: Vec<PairId> = self
            .check_list
            .pairs()
            .iter()
            .filter(|p| {
                p.local.component_id == component_id
                    && matches!(p.state, PairState::Frozen | PairState::Waiting)
                    && p.priority < min_priority
            })
            .map(|p| p.id)
            .collect();
        for id in to_fail {
            if let Some(pair) = self.check_list.pair_mut(id) {
                trace!(pair = %pair, "skipping check, a better pair is already valid");
                pair.state = PairState::Failed;
            }
        }
    }

    fn handle_role_conflict(&mut self, pair_id: PairId, sent_controlling: bool) {
        if self.controlling == sent_controlling {
            info!("role conflict reported by peer, switching role");
            self.flip_role();
        } else {
            // the role already flipped while this check was in flight; the
            // 487 is outdated, just retry with the current role
            debug!("stale role conflict, retrying check");
        }
        if let Some(pair) = self.check_list.pair_mut(pair_id) {
            pair.state = PairState::Waiting;
            pair.nominated = false;
        }
        self.check_list.prepend_triggered(pair_id);
    }

    fn flip_role(&mut self) {
        self.controlling = !self.controlling;
        info!(controlling = self.controlling, "ICE role changed");
        // every pair priority depends on the role; recompute and re-sort
        let updates: Vec<(PairId, u64)> = self
            .check_list
            .pairs()
            .iter()
            .map(|p| (p.id, self.pair_priority_for(&p.local, &p.remote)))
            .collect();
        for (id, priority) in updates {
            if let Some(pair) = self.check_list.pair_mut(id) {
                pair.priority = priority;
            }
        }
        self.check_list.resort();
        for comp in &mut self.components {
            if comp.selected.is_none() && comp.highest.is_some() {
                comp.highest = self.check_list.highest_valid(comp.id);
            }
        }
    }

    fn handle_check_failure(&mut self, pair_id: PairId) {
        if self.phase == Phase::Stopping {
            return;
        }
        if self.phase == Phase::Active {
            // late failures of non-selected pairs are uninteresting
            return;
        }
        let (component_id, was_valid, final_nomination, triggered_for_nomination) = {
            let Some(pair) = self.check_list.pair_mut(pair_id) else {
                return;
            };
            pair.state = PairState::Failed;
            let was_valid = pair.valid;
            pair.valid = false;
            (
                pair.local.component_id,
                was_valid,
                pair.final_nomination,
                pair.triggered_for_nomination,
            )
        };
        if was_valid {
            // RFC 8445 7.2.5.3.4: a failed re-check demotes the pair
            self.check_list.remove_valid(pair_id);
            let comp = component_mut(&mut self.components, component_id);
            if comp.highest == Some(pair_id) {
                comp.highest = self.check_list.highest_valid(component_id);
            }
        }

        let nominating = component_ref(&self.components, component_id).nominating;
        let remote_aggressive = self
            .remote_features
            .contains(Features::AGGRESSIVE_NOMINATION);
        if (nominating && final_nomination)
            || (!remote_aggressive && triggered_for_nomination)
        {
            info!(component = component_id, "nominated pair failed its check");
            let _ = self.events.send(IceEvent::Error(IceErrorKind::Disconnected));
            self.begin_stop();
            return;
        }
        self.check_exhausted();
    }

    fn check_exhausted(&mut self) {
        if !self.can_start_checks || self.phase != Phase::Started {
            return;
        }
        if self.check_list.exhausted() && self.components.iter().all(|c| !c.has_valid) {
            info!("every checklist pair failed before nomination");
            let _ = self.events.send(IceEvent::Error(IceErrorKind::Generic));
            self.begin_stop();
        }
    }

    // ---- inbound checks ----

    fn on_inbound_stun(
        &mut self,
        id: TransportId,
        path: u8,
        from: TransportAddress,
        data: Vec<u8>,
    ) {
        let Some(comp_idx) = self.component_index_of(id) else {
            return;
        };
        let key = self.shared.local_password.key();
        let (msg, validation) = match Message::decode(&data, Some(&key)) {
            Ok(parsed) => parsed,
            Err(err) => {
                // protocol violations are dropped without a response
                trace!(%from, %err, "dropping invalid STUN packet");
                return;
            }
        };

        if msg.class() == Class::Indication {
            if msg.method() == methods::BINDING {
                // consent/keepalive probe
                self.components[comp_idx].last_inbound = Some(Instant::now());
            }
            return;
        }
        if msg.class() != Class::Request || msg.method() != methods::BINDING {
            return;
        }
        // a connectivity check must authenticate
        if !validation.integrity {
            trace!(%from, "unauthenticated binding request dropped");
            return;
        }
        let Some(remote_ufrag) = self.remote_ufrag.clone() else {
            trace!(%from, "binding request before remote credentials, dropped");
            return;
        };
        let expected_username = format!("{}:{}", self.shared.local_ufrag, remote_ufrag);
        if msg.username() != Some(expected_username.as_str()) {
            debug!(%from, "binding request with wrong username, dropped");
            return;
        }

        // RFC 8445 7.3.1.1: role conflict resolution
        if self.controlling {
            if let Some(theirs) = msg.ice_controlling() {
                if self.tie_breaker >= theirs {
                    self.send_role_conflict(comp_idx, id, path, &msg, from, &key);
                    return;
                }
                self.flip_role();
            }
        } else if let Some(theirs) = msg.ice_controlled() {
            if self.tie_breaker >= theirs {
                self.flip_role();
            } else {
                self.send_role_conflict(comp_idx, id, path, &msg, from, &key);
                return;
            }
        }

        // answer immediately
        let mut response =
            Message::with_id(Class::SuccessResponse, methods::BINDING, msg.transaction_id());
        response.add_xor_mapped_address(from.unscoped());
        let packet = response.encode(Some(&key), true);
        if let Some(t) = self.components[comp_idx].transport(id) {
            t.handle.send_datagram(path, packet, from.socket_addr());
        }
        self.components[comp_idx].last_inbound = Some(Instant::now());

        // triggered checks only once local preparation is done
        if self.phase != Phase::Started {
            return;
        }
        let component_id = self.components[comp_idx].id;
        let local = self
            .candidates
            .iter()
            .find(|c| {
                c.transport == id
                    && c.path == path
                    && c.info.component_id == component_id
                    && matches!(
                        c.info.kind,
                        CandidateType::Host | CandidateType::Relayed
                    )
            })
            .cloned();
        let Some(local) = local else {
            return;
        };

        let nominated = !self.controlling && msg.use_candidate();
        let remote = self
            .remote_candidates
            .iter()
            .find(|r| r.component_id == component_id && r.addr == from)
            .cloned();
        let remote = match remote {
            Some(remote) => remote,
            None => {
                // RFC 8445 7.3.1.3: learn a remote peer-reflexive candidate
                let priority = msg.priority().unwrap_or_else(|| {
                    candidate_priority(
                        CandidateType::PeerReflexive.type_preference(false),
                        65535,
                        component_id,
                    )
                });
                let rc = CandidateInfo::remote_peer_reflexive(component_id, from, priority);
                debug!(addr = %from, "learned remote peer-reflexive candidate");
                self.remote_candidates.push(rc.clone());
                rc
            }
        };
        self.do_triggered_check(&local, &remote, nominated);
    }

    fn send_role_conflict(
        &mut self,
        comp_idx: usize,
        id: TransportId,
        path: u8,
        request: &Message,
        from: TransportAddress,
        key: &[u8],
    ) {
        debug!(%from, "role conflict: rejecting check with 487");
        let mut response = Message::with_id(
            Class::ErrorResponse,
            methods::BINDING,
            request.transaction_id(),
        );
        response.add_error_code(floe_stun::error_codes::ROLE_CONFLICT, "Role Conflict");
        let packet = response.encode(Some(key), true);
        if let Some(t) = self.components[comp_idx].transport(id) {
            t.handle.send_datagram(path, packet, from.socket_addr());
        }
    }

    fn do_triggered_check(
        &mut self,
        local: &LocalCandidate,
        remote: &CandidateInfo,
        nominated: bool,
    ) {
        let component_id = local.info.component_id;
        let min_priority = component_ref(&self.components, component_id)
            .highest
            .and_then(|h| self.check_list.pair(h))
            .map(|p| p.priority)
            .unwrap_or(0);

        let existing = self
            .check_list
            .pairs()
            .iter()
            .find(|p| {
                p.local.component_id == component_id
                    && p.local.addr == local.info.addr
                    && p.remote.addr == remote.addr
            })
            .map(|p| (p.id, p.state, p.priority, p.triggered, p.nominated));

        let pair_id = match existing {
            Some((id, state, priority, triggered, was_nominated)) => {
                if priority < min_priority {
                    trace!("skipping triggered check for out-prioritized pair");
                    return;
                }
                match state {
                    PairState::Succeeded => {
                        // nothing to re-check; the responder may still need
                        // to adopt the nomination (RFC 8445 7.3.1.5)
                        if !self.controlling && nominated && !was_nominated {
                            if let Some(pair) = self.check_list.pair_mut(id) {
                                pair.nominated = true;
                            }
                            self.on_new_valid_pair(id);
                        }
                        return;
                    }
                    PairState::InProgress if triggered => {
                        // an in-flight triggered check already covers this
                        return;
                    }
                    _ => {}
                }
                if let Some(pair) = self.check_list.pair_mut(id) {
                    pair.nominated = false;
                }
                id
            }
            None => {
                let Some(pair) = self.make_pair(&local.info, remote, false) else {
                    return;
                };
                if pair.2 < min_priority {
                    trace!("skipping triggered check for low-priority new pair");
                    return;
                }
                let base = pair.0.base;
                let ids = self.check_list.add_pairs(vec![pair], self.components.len());
                match ids.first() {
                    Some(id) => *id,
                    None => {
                        // pruned as redundant: an equivalent (base, remote)
                        // pair survived, check that one instead
                        let survivor = self.check_list.pairs().iter().find(|p| {
                            p.local.component_id == component_id
                                && p.local.base == base
                                && p.remote.addr == remote.addr
                        });
                        match survivor {
                            Some(p) if p.state != PairState::Succeeded => p.id,
                            _ => return,
                        }
                    }
                }
            }
        };

        if let Some(pair) = self.check_list.pair_mut(pair_id) {
            pair.state = PairState::Waiting;
            pair.triggered_for_nomination = nominated;
        }
        self.check_list.enqueue_triggered(pair_id);
    }

    // ---- nomination and selection ----

    fn aggressive_effective(&self) -> bool {
        if self.controlling {
            self.shared
                .cfg
                .local_features
                .contains(Features::AGGRESSIVE_NOMINATION)
        } else {
            self.remote_features
                .contains(Features::AGGRESSIVE_NOMINATION)
        }
    }

    fn setup_nomination_timer(&mut self, component_id: u16) {
        let aggressive = self.aggressive_effective();
        // a regular-nomination responder waits for USE-CANDIDATE however
        // long it takes
        if !aggressive && !self.controlling {
            return;
        }
        let timeout = self.shared.cfg.nomination_timeout;
        let comp = component_mut(&mut self.components, component_id);
        if comp.nomination_deadline.is_none() && comp.selected.is_none() {
            comp.nomination_deadline = Some(Instant::now() + timeout);
        }
    }

    /// Is now a good moment for the controlling agent to nominate?
    fn try_nominate(&mut self, component_id: u16) {
        if !self.controlling
            || self
                .shared
                .cfg
                .local_features
                .contains(Features::AGGRESSIVE_NOMINATION)
            || self.phase != Phase::Started
        {
            return;
        }
        let comp = component_ref(&self.components, component_id);
        if comp.selected.is_some() || comp.nominating {
            return;
        }
        let Some(highest) = comp.highest else {
            return;
        };
        let Some(pair) = self.check_list.pair(highest) else {
            return;
        };
        if pair.local.kind == CandidateType::Relayed {
            // a relayed pair is the last resort: wait until both sides are
            // done gathering and nothing direct is still worth checking
            if !(self.local_gathering_complete && self.remote_gathering_complete) {
                debug!("deferring relayed nomination until gathering completes");
                return;
            }
            let direct_pending = self.check_list.pairs().iter().any(|p| {
                p.local.component_id == component_id
                    && p.is_pending()
                    && p.local.kind != CandidateType::Relayed
            });
            if direct_pending {
                debug!("deferring relayed nomination, direct pairs still checking");
                return;
            }
        }
        // a higher-priority pair could still come through; leave it to the
        // nomination timer
        let better_pending = self.check_list.pairs().iter().any(|p| {
            p.local.component_id == component_id && p.is_pending() && p.priority > pair.priority
        });
        if better_pending {
            debug!("deferring nomination, better pairs still checking");
            return;
        }
        self.nominate_selected_pair(component_id);
    }

    fn nominate_selected_pair(&mut self, component_id: u16) {
        let comp = component_mut(&mut self.components, component_id);
        let Some(highest) = comp.highest else {
            return;
        };
        comp.nomination_deadline = None;
        comp.nominating = true;
        if let Some(pair) = self.check_list.pair_mut(highest) {
            pair.final_nomination = true;
            info!(component = component_id, pair = %pair, "nominating valid pair");
        }
        self.check_list.prepend_triggered(highest);
    }

    fn set_selected_pair(&mut self, component_id: u16) {
        let comp_idx = (component_id - 1) as usize;
        if self.components[comp_idx].selected.is_some() {
            return;
        }
        self.components[comp_idx].nomination_deadline = None;
        let Some(highest) = self.components[comp_idx].highest else {
            warn!(
                component = component_id,
                "nominated component lost its valid pairs"
            );
            let _ = self.events.send(IceEvent::Error(IceErrorKind::Generic));
            self.begin_stop();
            return;
        };
        self.components[comp_idx].selected = Some(highest);
        self.components[comp_idx].last_inbound = Some(Instant::now());
        if let Some(pair) = self.check_list.pair(highest) {
            info!(component = component_id, pair = %pair, "selected pair");
        }
        self.cleanup_but_selected(component_id);
        let _ = self.events.send(IceEvent::ComponentReady(comp_idx));
        self.try_ice_finished();
    }

    /// Once a component has its final pair, everything else it was doing is
    /// cancelled and unused transports are released.
    fn cleanup_but_selected(&mut self, component_id: u16) {
        let comp_idx = (component_id - 1) as usize;
        let selected = self.components[comp_idx].selected.expect("selected just set");

        let drop_valid: Vec<PairId> = self
            .check_list
            .valid_ids()
            .iter()
            .copied()
            .filter(|id| {
                *id != selected
                    && self
                        .check_list
                        .pair(*id)
                        .map(|p| p.local.component_id == component_id)
                        .unwrap_or(true)
            })
            .collect();
        for id in drop_valid {
            self.check_list.remove_valid(id);
        }
        self.check_list.drop_triggered_for_component(component_id);

        let cancel: Vec<PairId> = self
            .check_list
            .pairs()
            .iter()
            .filter(|p| {
                p.id != selected
                    && p.local.component_id == component_id
                    && p.state == PairState::InProgress
            })
            .map(|p| p.id)
            .collect();
        for id in cancel {
            if let Some(pair) = self.check_list.pair_mut(id) {
                pair.state = PairState::Failed;
            }
        }

        // release transports that do not carry the selected pair
        let keep = self
            .check_list
            .pair(selected)
            .map(|p| (p.local.addr, p.local.component_id))
            .and_then(|(addr, component)| {
                find_local_candidate(&self.candidates, addr, component).map(|lc| lc.transport)
            });
        let Some(keep) = keep else {
            return;
        };
        let stop: Vec<TransportId> = self.components[comp_idx]
            .transports
            .iter()
            .filter(|t| t.handle.id != keep && !t.stopping)
            .map(|t| t.handle.id)
            .collect();
        for id in stop {
            debug!(component = component_id, transport = id, "releasing unused transport");
            if let Some(t) = self.components[comp_idx].transport_mut(id) {
                t.stopping = true;
                t.handle.stop();
            }
        }
    }

    /// Select any component whose checklist ran dry while holding nominated
    /// pairs (aggressive nomination converges here without waiting for the
    /// timer).
    fn try_select_on_checklist_done(&mut self) {
        let ready: Vec<u16> = self
            .components
            .iter()
            .filter(|c| {
                c.has_nominated && c.selected.is_none() && self.check_list.component_done(c.id)
            })
            .map(|c| c.id)
            .collect();
        for component_id in ready {
            self.set_selected_pair(component_id);
            if self.phase == Phase::Stopping {
                return;
            }
        }
    }

    fn try_ice_finished(&mut self) {
        if self.phase != Phase::Started
            || !self.components.iter().all(|c| c.selected.is_some())
        {
            return;
        }
        self.try_ready_to_send();
        self.pac_deadline = None;
        self.phase = Phase::Active;
        info!("ICE negotiation finished");
        let _ = self.events.send(IceEvent::IceFinished);
    }

    fn try_ready_to_send(&mut self) {
        if self.ready_to_send {
            return;
        }
        let not_nominated_data = self
            .shared
            .cfg
            .local_features
            .contains(Features::NOT_NOMINATED_DATA)
            && self.remote_features.contains(Features::NOT_NOMINATED_DATA);
        let ready = self
            .components
            .iter()
            .all(|c| c.has_nominated || (not_nominated_data && c.has_valid));
        if !ready {
            return;
        }
        self.ready_to_send = true;
        info!("ready to send media");
        let _ = self.events.send(IceEvent::ReadyToSendMedia);

        // flush datagrams queued before readiness
        for idx in 0..self.early_writes.len() {
            while let Some(data) = self.early_writes[idx].pop_front() {
                self.write_datagram(idx, data);
            }
        }
    }

    // ---- data plane ----

    fn on_inbound_datagram(
        &mut self,
        id: TransportId,
        _path: u8,
        _from: TransportAddress,
        data: Vec<u8>,
    ) {
        let Some(comp_idx) = self.component_index_of(id) else {
            return;
        };
        let comp = &mut self.components[comp_idx];
        let not_nominated_data = self
            .shared
            .cfg
            .local_features
            .contains(Features::NOT_NOMINATED_DATA)
            && self.remote_features.contains(Features::NOT_NOMINATED_DATA);
        let deliver = comp.selected.is_some() || comp.has_valid || not_nominated_data;
        if !deliver {
            trace!(component = comp.id, "datagram before readiness dropped");
            return;
        }
        comp.last_inbound = Some(Instant::now());
        self.shared.inbound.lock()[comp_idx].push_back(data);
        let _ = self.events.send(IceEvent::ReadyRead(comp_idx));
    }

    // ---- shutdown ----

    fn begin_stop(&mut self) {
        if self.phase == Phase::Stopping {
            return;
        }
        debug!("stopping ICE agent");
        self.phase = Phase::Stopping;
        self.pac_deadline = None;
        self.can_start_checks = false;

        let mut any = false;
        for comp in &mut self.components {
            comp.nomination_deadline = None;
            comp.stopped = true;
            for t in &mut comp.transports {
                if !t.stopping {
                    t.stopping = true;
                    t.handle.stop();
                }
                any = true;
            }
        }
        if !any {
            self.finish_stop();
        }
    }

    fn finish_stop(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        self.shared.control.lock().lifecycle = Lifecycle::Stopped;
        info!("ICE agent stopped");
        let _ = self.events.send(IceEvent::Stopped);
    }

    // ---- lookups ----

    fn component_index_of(&self, transport: TransportId) -> Option<usize> {
        self.components
            .iter()
            .position(|c| c.transport(transport).is_some())
    }
}

fn component_ref(components: &[Component], component_id: u16) -> &Component {
    &components[(component_id - 1) as usize]
}

fn component_mut(components: &mut [Component], component_id: u16) -> &mut Component {
    &mut components[(component_id - 1) as usize]
}

fn find_local_candidate(
    candidates: &[LocalCandidate],
    addr: TransportAddress,
    component_id: u16,
) -> Option<&LocalCandidate> {
    candidates
        .iter()
        .find(|c| c.info.component_id == component_id && c.info.addr == addr)
}
