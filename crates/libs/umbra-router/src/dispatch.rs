//! The logic task's state and the demultiplexer for everything the link
//! layer delivers: transit traffic, owned-path traffic, DHT operations,
//! build commits and statuses, and direct service data.

use std::collections::HashMap;
use std::sync::Arc;

use ed25519_dalek::SigningKey;
use tokio::sync::mpsc;
use umbra_core::rc::xor_distance;
use umbra_core::wire::{
    status_code, CommitCapsule, CommitRecord, DhtMessage, DhtOp, LinkMessage, PathClose,
    ProtocolFrame, RelayStatus, TerminalMessage,
};
use umbra_core::{
    now_ms, Config, ConvoTag, Error, IntroSet, Introduction, PathId, RcStore, RouterContact,
    RouterId, ServiceAddress,
};
use umbra_crypto::{CryptoProvider, PqKeypair, SharedKey};
use umbra_flow::{Endpoint, FlowEffect, IntroSetStore, LookupProgress};
use umbra_link::{LinkEvent, LinkLayer};
use umbra_path::builder::StatusOutcome;
use umbra_path::relay::{self, CommitAction, PathTraffic, RelayKeys};
use umbra_path::{OwnedPath, PathBuilder, TransitTable};
use x25519_dalek::StaticSecret;

use crate::pending::PendingQueues;
use crate::workers::WorkerPool;

/// Everything that wakes the logic task.
pub(crate) enum LogicMsg {
    Link(LinkEvent),
    CommitOpened {
        upstream: RouterId,
        record: CommitRecord,
        key: SharedKey,
        remaining: Vec<CommitCapsule>,
        record_len: usize,
    },
    CommitFailed {
        upstream: RouterId,
    },
}

/// What the router surfaces to its embedding application.
#[derive(Debug)]
pub enum AppEvent {
    PathEstablished {
        outer: PathId,
    },
    PathDead {
        outer: PathId,
    },
    IntroSetResolved {
        service: ServiceAddress,
        result: Option<IntroSet>,
    },
    FlowEstablished {
        service: ServiceAddress,
        tag: ConvoTag,
    },
    FlowRejected {
        service: ServiceAddress,
        tag: ConvoTag,
    },
    FlowData {
        service: ServiceAddress,
        tag: ConvoTag,
        data: Vec<u8>,
    },
}

/// A DHT query we forwarded one step closer to its key on behalf of a path
/// owner; the answer must be injected back at our terminus.
pub(crate) struct DhtRelayEntry {
    pub ingress: PathId,
    pub deadline_ms: u64,
}

pub(crate) struct RouterState {
    pub crypto: CryptoProvider,
    pub config: Config,
    pub signing: SigningKey,
    pub enc_secret: StaticSecret,
    pub pq: Arc<PqKeypair>,
    pub our_rc: RouterContact,
    pub rc_store: RcStore,
    pub transit: TransitTable,
    pub paths: HashMap<PathId, OwnedPath>,
    pub builder: PathBuilder,
    pub endpoints: HashMap<ServiceAddress, Endpoint>,
    pub introset_store: IntroSetStore,
    pub pending_out: PendingQueues,
    pub dht_relay: HashMap<u64, DhtRelayEntry>,
    /// Flow frames waiting for a path whose terminus avoids their intro.
    pub parked_flow: Vec<(Introduction, ProtocolFrame, u64)>,
    pub workers: WorkerPool,
    pub logic_tx: mpsc::Sender<LogicMsg>,
    pub app_tx: mpsc::Sender<AppEvent>,
    /// How many usable paths the pool maintains.
    pub path_target: usize,
}

const DHT_RELAY_DEADLINE_MS: u64 = 5_000;
const PARKED_FLOW_DEADLINE_MS: u64 = 15_000;

impl RouterState {
    pub(crate) fn emit(&self, event: AppEvent) {
        if self.app_tx.try_send(event).is_err() {
            log::warn!("router: application event queue full");
        }
    }

    /// Send toward a router, parking the message and dialing when no
    /// session exists yet.
    pub(crate) async fn send_or_queue(&mut self, link: &LinkLayer, to: RouterId, msg: LinkMessage) {
        match link.send_to(&to, &msg).await {
            Ok(()) => {}
            Err(Error::NoSession(_)) => {
                if let Err(err) = self.pending_out.push(to, msg, now_ms()) {
                    log::warn!("router: dropping message for {to}: {err}");
                    return;
                }
                match self.rc_store.get(&to) {
                    Some(rc) => {
                        if let Err(err) = link.connect(&rc).await {
                            log::warn!("router: dial {to} failed: {err}");
                        }
                    }
                    None => log::debug!("router: no contact for {to}, message parked"),
                }
            }
            Err(err) => log::warn!("router: send to {to} failed: {err}"),
        }
    }

    pub(crate) async fn handle_logic_msg(&mut self, link: &LinkLayer, msg: LogicMsg) {
        match msg {
            LogicMsg::Link(event) => self.handle_link_event(link, event).await,
            LogicMsg::CommitOpened {
                upstream,
                record,
                key,
                remaining,
                record_len,
            } => {
                let keys = RelayKeys {
                    crypto: &self.crypto,
                    enc_secret: &self.enc_secret,
                    pq: &self.pq,
                    signing: &self.signing,
                };
                let action = relay::commit_action(
                    &keys,
                    &mut self.transit,
                    upstream,
                    record,
                    key,
                    remaining,
                    record_len,
                    now_ms(),
                );
                self.apply_commit_action(link, upstream, action).await;
            }
            LogicMsg::CommitFailed { upstream } => {
                let status = RelayStatus::signed(
                    &self.crypto,
                    &self.signing,
                    PathId::zero(),
                    status_code::MALFORMED,
                );
                self.send_or_queue(link, upstream, LinkMessage::RelayStatus(status))
                    .await;
            }
        }
    }

    async fn handle_link_event(&mut self, link: &LinkLayer, event: LinkEvent) {
        match event {
            LinkEvent::SessionEstablished { router, rc } => {
                if let Err(err) = self.rc_store.put(&self.crypto, rc) {
                    log::debug!("router: contact from LIM refused: {err}");
                }
                for msg in self.pending_out.drain(&router) {
                    if let Err(err) = link.send_to(&router, &msg).await {
                        log::debug!("router: pending flush to {router} failed: {err}");
                    }
                }
            }
            LinkEvent::SessionClosed { router, reason } => {
                let Some(router) = router else { return };
                log::info!("router: session with {router} closed ({reason:?})");
                let removed = self.transit.remove_peer(&router);
                if removed > 0 {
                    log::debug!("router: dropped {removed} transit entries via {router}");
                }
                let dead: Vec<PathId> = self
                    .paths
                    .iter()
                    .filter(|(_, p)| p.first_hop_router() == router)
                    .map(|(id, _)| *id)
                    .collect();
                for outer in dead {
                    if let Some(mut path) = self.paths.remove(&outer) {
                        path.mark_failed();
                        self.emit(AppEvent::PathDead { outer });
                    }
                }
            }
            LinkEvent::Message { router, data } => {
                self.handle_link_message(link, router, &data).await;
            }
        }
    }

    async fn handle_link_message(&mut self, link: &LinkLayer, from: RouterId, data: &[u8]) {
        let msg = match LinkMessage::decode(data) {
            Ok(msg) => msg,
            Err(err) => {
                log::debug!("router: undecodable message from {from}: {err}");
                return;
            }
        };
        match msg {
            LinkMessage::Lim(_) => {
                // the session layer consumes LIMs; a second one is noise
                log::debug!("router: stray LIM from {from}");
            }
            LinkMessage::RelayCommit(commit) => self.on_relay_commit(link, from, commit).await,
            LinkMessage::RelayStatus(status) => self.on_relay_status(link, from, status).await,
            LinkMessage::Dht(dht) => {
                let now = now_ms();
                if is_dht_request(&dht.op) {
                    if let Some(reply) = self.dht_execute(dht, now) {
                        self.send_or_queue(link, from, LinkMessage::Dht(reply)).await;
                    }
                } else {
                    self.dht_consume(link, dht, now).await;
                }
            }
            LinkMessage::Path(env) => {
                if self.paths.contains_key(&env.path_id) {
                    let outer = env.path_id;
                    let unwrapped = self
                        .paths
                        .get(&outer)
                        .expect("checked above")
                        .open_upstream(&self.crypto, env);
                    match unwrapped {
                        Ok(terminal) => self.handle_terminal_owner(link, outer, terminal).await,
                        Err(err) => log::debug!("router: bad upstream envelope: {err}"),
                    }
                    return;
                }
                match relay::handle_path_envelope(&self.crypto, &self.transit, from, &env) {
                    PathTraffic::ForwardDown { next, env } => {
                        self.send_or_queue(link, next, LinkMessage::Path(env)).await;
                    }
                    PathTraffic::ForwardUp { next, env } => {
                        self.send_or_queue(link, next, LinkMessage::Path(env)).await;
                    }
                    PathTraffic::Terminal { ingress, payload } => {
                        self.handle_terminal_relay(link, ingress, payload).await;
                    }
                    PathTraffic::Drop => {
                        log::debug!("router: dropping unroutable envelope from {from}");
                    }
                }
            }
            LinkMessage::Data(direct) => {
                let now = now_ms();
                if self.endpoints.contains_key(&direct.service) {
                    let effects = self
                        .endpoints
                        .get_mut(&direct.service)
                        .expect("checked above")
                        .handle_frame(direct.frame, now);
                    self.process_flow_effects(link, direct.service, effects).await;
                } else {
                    log::debug!("router: data for unknown service {}", direct.service);
                }
            }
            LinkMessage::Close(close) => {
                if let Some(hop) = self.transit.remove(&from, &close.path_id) {
                    if let Some(down) = hop.downstream {
                        let msg = LinkMessage::Close(PathClose {
                            path_id: hop.egress,
                        });
                        self.send_or_queue(link, down, msg).await;
                    }
                }
            }
        }
    }

    /// Opening a commit capsule costs a KEM decapsulation, so it runs on
    /// the crypto pool; the continuation re-enters through the logic
    /// channel. A saturated pool refuses the build.
    async fn on_relay_commit(
        &mut self,
        link: &LinkLayer,
        from: RouterId,
        commit: umbra_core::wire::RelayCommit,
    ) {
        let Some(first) = commit.capsules.first().cloned() else {
            log::debug!("router: empty commit from {from}");
            return;
        };
        let remaining = commit.capsules[1..].to_vec();
        let record_len = first.record.len();
        let crypto = self.crypto;
        let enc_secret = self.enc_secret.clone();
        let pq = self.pq.clone();
        let logic_tx = self.logic_tx.clone();

        let submitted = self.workers.submit(move || {
            let msg = match umbra_path::capsule::open(&crypto, &enc_secret, &pq, &first) {
                Ok((record, key)) => LogicMsg::CommitOpened {
                    upstream: from,
                    record,
                    key,
                    remaining,
                    record_len,
                },
                Err(_) => LogicMsg::CommitFailed { upstream: from },
            };
            let _ = logic_tx.try_send(msg);
        });
        if submitted.is_err() {
            log::warn!("router: crypto pool saturated, refusing build from {from}");
            let status = RelayStatus::signed(
                &self.crypto,
                &self.signing,
                PathId::zero(),
                status_code::CONGESTED,
            );
            self.send_or_queue(link, from, LinkMessage::RelayStatus(status))
                .await;
        }
    }

    async fn apply_commit_action(
        &mut self,
        link: &LinkLayer,
        upstream: RouterId,
        action: CommitAction,
    ) {
        match action {
            CommitAction::Forward { next, commit } => {
                self.send_or_queue(link, next, LinkMessage::RelayCommit(commit))
                    .await;
            }
            CommitAction::Reply(status) => {
                self.send_or_queue(link, upstream, LinkMessage::RelayStatus(status))
                    .await;
            }
        }
    }

    async fn on_relay_status(&mut self, link: &LinkLayer, from: RouterId, status: RelayStatus) {
        let now = now_ms();
        match self
            .builder
            .on_status(&status, self.config.path_lifetime_ms, now)
        {
            StatusOutcome::Established(mut path) => {
                let outer = path.outer_path_id();
                let probe = path.begin_probe(&self.crypto, now);
                let wrapped = path.wrap(&self.crypto, &probe);
                self.paths.insert(outer, path);
                self.emit(AppEvent::PathEstablished { outer });
                if let Ok((first, msg)) = wrapped {
                    self.send_or_queue(link, first, msg).await;
                }
            }
            StatusOutcome::Rejected { hop, code } => {
                log::info!("router: build {} refused by {hop} (code {code})", status.path_id);
            }
            StatusOutcome::Unmatched => {
                if let Some((next, forwarded)) =
                    relay::handle_relay_status(&mut self.transit, from, &status)
                {
                    self.send_or_queue(link, next, LinkMessage::RelayStatus(forwarded))
                        .await;
                }
            }
        }
    }

    // --- DHT ---

    /// Answer a DHT request against local stores; on a miss for a key we
    /// are not closest to, forward the query one step toward the key.
    fn dht_execute(&mut self, msg: DhtMessage, now: u64) -> Option<DhtMessage> {
        let op = match msg.op {
            DhtOp::FindRouter(router) => DhtOp::GotRouter(self.rc_store.get(&router)),
            DhtOp::PublishIntroSet(set) => {
                let service = set.service;
                let code = match self.introset_store.put(&self.crypto, set, now) {
                    Ok(_) => 0,
                    Err(err) => {
                        log::debug!("router: publish for {service} refused: {err}");
                        1
                    }
                };
                DhtOp::PublishAck { code }
            }
            DhtOp::FindIntroSet(service) => {
                DhtOp::GotIntroSet(self.introset_store.get(&service, now))
            }
            _ => return None,
        };
        Some(DhtMessage {
            txid: msg.txid,
            op,
        })
    }

    /// Route a DHT response to whoever asked: a forwarded path query first,
    /// then the local endpoints' lookup and publish state machines.
    async fn dht_consume(&mut self, link: &LinkLayer, msg: DhtMessage, now: u64) {
        if let Some(entry) = self.dht_relay.remove(&msg.txid) {
            if let Ok(payload) = TerminalMessage::Dht(msg).encode() {
                if let Some((up, env)) =
                    relay::inject_upstream(&self.crypto, &self.transit, &entry.ingress, &payload)
                {
                    self.send_or_queue(link, up, LinkMessage::Path(env)).await;
                }
            }
            return;
        }

        match msg.op {
            DhtOp::GotRouter(Some(rc)) => {
                if let Err(err) = self.rc_store.put(&self.crypto, rc) {
                    log::debug!("router: contact from DHT refused: {err}");
                }
            }
            DhtOp::GotIntroSet(result) => {
                let mut resolved = None;
                for endpoint in self.endpoints.values_mut() {
                    let config = endpoint.lookup_config();
                    match endpoint.lookups.on_response(
                        &self.crypto,
                        &config,
                        msg.txid,
                        result.clone(),
                        now,
                    ) {
                        LookupProgress::Done { service, result } => {
                            resolved = Some((service, result));
                            break;
                        }
                        LookupProgress::Pending => break,
                        LookupProgress::Unmatched => continue,
                    }
                }
                if let Some((service, result)) = resolved {
                    self.emit(AppEvent::IntroSetResolved { service, result });
                }
            }
            DhtOp::PublishAck { code } => {
                for endpoint in self.endpoints.values_mut() {
                    if endpoint.publisher.on_ack(msg.txid, code, now) {
                        log::debug!("router: introset publish acknowledged");
                        break;
                    }
                }
            }
            _ => {}
        }
    }

    /// The closest router we know for a key, when it is closer than us.
    fn closer_router(&self, key: &[u8; 32], now: u64) -> Option<RouterId> {
        let ours = xor_distance(self.our_rc.router_id.as_bytes(), key);
        self.rc_store
            .closest_to(key, 1, now)
            .first()
            .filter(|rc| {
                rc.router_id != self.our_rc.router_id
                    && xor_distance(rc.router_id.as_bytes(), key) < ours
            })
            .map(|rc| rc.router_id)
    }

    // --- terminus-side path handling ---

    async fn handle_terminal_relay(&mut self, link: &LinkLayer, ingress: PathId, payload: Vec<u8>) {
        let msg = match TerminalMessage::decode(&payload) {
            Ok(msg) => msg,
            Err(err) => {
                log::debug!("router: undecodable terminal payload: {err}");
                return;
            }
        };
        let now = now_ms();
        match msg {
            TerminalMessage::Dht(dht) => {
                if !is_dht_request(&dht.op) {
                    return;
                }
                // a miss on a key someone else is closer to becomes a
                // one-step forwarded query; the reply injects at `ingress`
                if let DhtOp::FindIntroSet(service) = &dht.op {
                    if self.introset_store.get(service, now).is_none() {
                        if let Some(closer) = self.closer_router(service.as_bytes(), now) {
                            self.dht_relay.insert(
                                dht.txid,
                                DhtRelayEntry {
                                    ingress,
                                    deadline_ms: now + DHT_RELAY_DEADLINE_MS,
                                },
                            );
                            self.send_or_queue(link, closer, LinkMessage::Dht(dht)).await;
                            return;
                        }
                    }
                }
                if let DhtOp::PublishIntroSet(set) = &dht.op {
                    if let Some(closer) = self.closer_router(set.service.as_bytes(), now) {
                        let replica = DhtMessage {
                            txid: self.crypto.rand_u64(),
                            op: dht.op.clone(),
                        };
                        self.send_or_queue(link, closer, LinkMessage::Dht(replica))
                            .await;
                    }
                }
                if let Some(reply) = self.dht_execute(dht, now) {
                    self.inject_at(link, ingress, TerminalMessage::Dht(reply))
                        .await;
                }
            }
            TerminalMessage::Probe { txid } => {
                self.inject_at(link, ingress, TerminalMessage::ProbeReply { txid })
                    .await;
            }
            TerminalMessage::Inject { path_id, frame } => {
                self.inject_at(link, path_id, TerminalMessage::Flow(frame))
                    .await;
            }
            TerminalMessage::Flow(_) | TerminalMessage::ProbeReply { .. } => {
                log::debug!("router: unexpected terminal message at relay");
            }
        }
    }

    async fn inject_at(&mut self, link: &LinkLayer, ingress: PathId, msg: TerminalMessage) {
        let Ok(payload) = msg.encode() else { return };
        match relay::inject_upstream(&self.crypto, &self.transit, &ingress, &payload) {
            Some((up, env)) => {
                self.send_or_queue(link, up, LinkMessage::Path(env)).await;
            }
            None => log::debug!("router: no terminus {ingress} to inject at"),
        }
    }

    async fn handle_terminal_owner(
        &mut self,
        link: &LinkLayer,
        outer: PathId,
        msg: TerminalMessage,
    ) {
        let now = now_ms();
        match msg {
            TerminalMessage::ProbeReply { txid } => {
                if let Some(path) = self.paths.get_mut(&outer) {
                    if let Some(latency) = path.on_probe_reply(txid, now) {
                        log::debug!("router: path {outer} latency {latency}ms");
                    }
                }
            }
            TerminalMessage::Dht(dht) => self.dht_consume(link, dht, now).await,
            TerminalMessage::Flow(frame) => self.deliver_flow_frame(link, frame, now).await,
            TerminalMessage::Probe { .. } | TerminalMessage::Inject { .. } => {
                log::debug!("router: unexpected terminal message at owner");
            }
        }
    }

    // --- flow plumbing ---

    async fn deliver_flow_frame(&mut self, link: &LinkLayer, frame: ProtocolFrame, now: u64) {
        let tag = frame.convo_tag;
        let owner = self
            .endpoints
            .iter()
            .find(|(_, ep)| ep.flow_state(&tag).is_some())
            .map(|(addr, _)| *addr);
        // handshakes carry a tag nobody owns yet; offer them to each
        // endpoint until one can open them
        let candidates: Vec<ServiceAddress> = match owner {
            Some(addr) => vec![addr],
            None => self.endpoints.keys().copied().collect(),
        };
        for addr in candidates {
            let effects = self
                .endpoints
                .get_mut(&addr)
                .expect("key from the same map")
                .handle_frame(frame.clone(), now);
            if !effects.is_empty() {
                self.process_flow_effects(link, addr, effects).await;
                return;
            }
        }
    }

    pub(crate) async fn process_flow_effects(
        &mut self,
        link: &LinkLayer,
        service: ServiceAddress,
        effects: Vec<FlowEffect>,
    ) {
        for effect in effects {
            match effect {
                FlowEffect::Deliver { tag, data } => {
                    self.emit(AppEvent::FlowData { service, tag, data });
                }
                FlowEffect::Established { tag } => {
                    self.emit(AppEvent::FlowEstablished { service, tag });
                }
                FlowEffect::Rejected { tag } => {
                    self.emit(AppEvent::FlowRejected { service, tag });
                }
                FlowEffect::SendFrame { via, frame } => {
                    self.route_via_intro(link, via, frame).await;
                }
            }
        }
    }

    /// Carry a frame to a remote's introduction point over one of our own
    /// paths whose terminus is not that router.
    pub(crate) async fn route_via_intro(
        &mut self,
        link: &LinkLayer,
        via: Introduction,
        frame: ProtocolFrame,
    ) {
        let now = now_ms();
        let terminal = TerminalMessage::Inject {
            path_id: via.path_id,
            frame,
        };
        let wrapped = self
            .paths
            .values()
            .find(|p| p.is_usable(now) && p.terminus_router() != via.router)
            .map(|path| path.wrap(&self.crypto, &terminal));
        match wrapped {
            Some(Ok((first, msg))) => self.send_or_queue(link, first, msg).await,
            Some(Err(err)) => log::warn!("router: failed to wrap flow frame: {err}"),
            None => {
                // park the frame and build a path that avoids this router;
                // the path job retries once one comes up
                log::info!(
                    "router: no usable path avoiding {}, building one",
                    via.router
                );
                let TerminalMessage::Inject { frame, .. } = terminal else {
                    return;
                };
                self.parked_flow
                    .push((via.clone(), frame, now + PARKED_FLOW_DEADLINE_MS));
                let build = self.builder.begin_build(
                    &self.rc_store,
                    &self.config,
                    Some(&via.router),
                    now,
                );
                if let Ok((_, first_hop, commit)) = build {
                    self.send_or_queue(link, first_hop, LinkMessage::RelayCommit(commit))
                        .await;
                }
            }
        }
    }

    /// Retry frames parked for want of a suitable path.
    pub(crate) async fn retry_parked_flow(&mut self, link: &LinkLayer) {
        if self.parked_flow.is_empty() {
            return;
        }
        let now = now_ms();
        let parked = std::mem::take(&mut self.parked_flow);
        for (via, frame, deadline) in parked {
            if now >= deadline || !via.is_valid(now) {
                log::warn!("router: dropping parked flow frame for {}", via.router);
                continue;
            }
            let wrapped = self
                .paths
                .values()
                .find(|p| p.is_usable(now) && p.terminus_router() != via.router)
                .map(|path| {
                    path.wrap(
                        &self.crypto,
                        &TerminalMessage::Inject {
                            path_id: via.path_id,
                            frame: frame.clone(),
                        },
                    )
                });
            match wrapped {
                Some(Ok((first, msg))) => self.send_or_queue(link, first, msg).await,
                _ => self.parked_flow.push((via, frame, deadline)),
            }
        }
    }
}

pub(crate) fn is_dht_request(op: &DhtOp) -> bool {
    matches!(
        op,
        DhtOp::FindRouter(_) | DhtOp::PublishIntroSet(_) | DhtOp::FindIntroSet(_)
    )
}
