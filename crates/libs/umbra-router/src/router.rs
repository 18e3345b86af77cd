//! The router: wires the link layer, the logic task, and the periodic jobs
//! together and exposes the overlay to the embedding application.

use std::collections::HashMap;
use std::sync::Arc;

use ed25519_dalek::SigningKey;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{self, Duration};
use tokio_util::sync::CancellationToken;
use umbra_core::rc::xor_distance;
use umbra_core::wire::{LinkMessage, PathClose, TerminalMessage};
use umbra_core::{
    now_ms, Config, ConvoTag, Error, IntroSet, Introduction, PathId, RcStore, RouterContact,
    ServiceAddress,
};
use umbra_crypto::{CryptoProvider, PqKeypair};
use umbra_flow::{Endpoint, EndpointConfig, IntroSetStore, ServiceIdentity};
use umbra_link::{LinkConfig, LinkLayer};
use umbra_path::{PathBuilder, TransitTable};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::dispatch::{AppEvent, LogicMsg, RouterState};
use crate::pending::PendingQueues;
use crate::workers::WorkerPool;

const LOGIC_QUEUE_DEPTH: usize = 1024;
const APP_QUEUE_DEPTH: usize = 1024;
const CRYPTO_WORKERS: usize = 2;
const CRYPTO_QUEUE_DEPTH: usize = 64;
const PATH_TICK: Duration = Duration::from_millis(500);
const SWEEP_TICK: Duration = Duration::from_secs(5);
const SERVICE_TICK: Duration = Duration::from_millis(500);
const PROBE_INTERVAL_MS: u64 = 30_000;
const PROBE_TIMEOUT_MS: u64 = 10_000;
const REBUILD_SLACK_MS: u64 = 60_000;
/// RC lifetime when self-signing at startup.
const RC_LIFETIME_MS: u64 = 24 * 60 * 60 * 1000;

/// Long-term key material of the local router.
pub struct RouterKeys {
    pub signing: SigningKey,
    pub enc_secret: StaticSecret,
    pub pq: PqKeypair,
}

impl RouterKeys {
    pub fn generate(crypto: &CryptoProvider) -> Self {
        Self {
            signing: crypto.signing_keygen(),
            enc_secret: crypto.encryption_keygen(),
            pq: crypto.pq_keygen(),
        }
    }
}

pub struct Router {
    link: Arc<LinkLayer>,
    state: Arc<Mutex<RouterState>>,
    our_rc: RouterContact,
    cancel: CancellationToken,
}

impl Router {
    /// Bind the socket, self-sign the contact, and start the logic task
    /// and timers. Returns the router and the application event stream.
    pub async fn spawn(
        config: Config,
        keys: RouterKeys,
    ) -> Result<(Self, mpsc::Receiver<AppEvent>), Error> {
        let crypto = CryptoProvider::new();
        let socket = UdpSocket::bind(config.bind_addr).await?;
        let local_addr = socket.local_addr()?;

        let our_rc = RouterContact::signed(
            &crypto,
            &keys.signing,
            PublicKey::from(&keys.enc_secret).to_bytes(),
            keys.pq.public().as_bytes().to_vec(),
            vec![local_addr],
            now_ms() + RC_LIFETIME_MS,
        )?;

        let (link, link_events) = LinkLayer::from_socket(
            crypto,
            our_rc.clone(),
            keys.enc_secret.clone(),
            socket,
            LinkConfig::from_config(&config),
        );
        let link = Arc::new(link);

        let (logic_tx, logic_rx) = mpsc::channel(LOGIC_QUEUE_DEPTH);
        let (app_tx, app_rx) = mpsc::channel(APP_QUEUE_DEPTH);

        let state = RouterState {
            crypto,
            builder: PathBuilder::new(crypto, our_rc.router_id),
            config,
            signing: keys.signing,
            enc_secret: keys.enc_secret,
            pq: Arc::new(keys.pq),
            our_rc: our_rc.clone(),
            rc_store: RcStore::new(),
            transit: TransitTable::new(),
            paths: HashMap::new(),
            endpoints: HashMap::new(),
            introset_store: IntroSetStore::new(),
            pending_out: PendingQueues::new(),
            dht_relay: HashMap::new(),
            parked_flow: Vec::new(),
            workers: WorkerPool::new(CRYPTO_WORKERS, CRYPTO_QUEUE_DEPTH),
            logic_tx: logic_tx.clone(),
            app_tx,
            path_target: 2,
        };

        let router = Self {
            link,
            state: Arc::new(Mutex::new(state)),
            our_rc,
            cancel: CancellationToken::new(),
        };
        router.spawn_link_forwarder(link_events, logic_tx);
        router.spawn_logic_task(logic_rx);
        router.spawn_path_job();
        router.spawn_sweep_job();
        router.spawn_service_job();
        Ok((router, app_rx))
    }

    pub fn our_rc(&self) -> &RouterContact {
        &self.our_rc
    }

    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.link.local_addr()
    }

    /// Seed the contact store.
    pub async fn add_contact(&self, rc: RouterContact) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        let crypto = state.crypto;
        state.rc_store.put(&crypto, rc)
    }

    /// Register a local hidden-service endpoint.
    pub async fn add_endpoint(
        &self,
        identity: ServiceIdentity,
        config: EndpointConfig,
    ) -> ServiceAddress {
        let mut state = self.state.lock().await;
        let address = identity.address();
        let endpoint = Endpoint::new(state.crypto, identity, config);
        state.endpoints.insert(address, endpoint);
        log::info!("router: serving endpoint {address}");
        address
    }

    /// Kick an introset lookup for `remote` from the given local endpoint.
    /// The result arrives as [`AppEvent::IntroSetResolved`].
    pub async fn resolve(
        &self,
        local: &ServiceAddress,
        remote: ServiceAddress,
    ) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        let now = now_ms();
        let path_ids: Vec<PathId> = state
            .paths
            .values()
            .filter(|p| p.is_usable(now))
            .map(|p| p.outer_path_id())
            .collect();
        let crypto = state.crypto;
        let endpoint = state
            .endpoints
            .get_mut(local)
            .ok_or(Error::Malformed("unknown local endpoint"))?;
        let lookup_config = endpoint.lookup_config();
        let requests = endpoint
            .lookups
            .begin(&crypto, &lookup_config, remote, &path_ids, now)?;

        for (path_id, dht) in requests {
            let wrapped = state
                .paths
                .get(&path_id)
                .map(|p| p.wrap(&crypto, &TerminalMessage::Dht(dht)));
            if let Some(Ok((first, msg))) = wrapped {
                state.send_or_queue(&self.link, first, msg).await;
            }
        }
        Ok(())
    }

    /// Open a flow from a local endpoint to a resolved remote introset.
    pub async fn open_flow(
        &self,
        local: &ServiceAddress,
        remote: &IntroSet,
        auth_token: Option<String>,
        first_data: Vec<u8>,
    ) -> Result<ConvoTag, Error> {
        let mut state = self.state.lock().await;
        let now = now_ms();
        let (tag, intro, frame) = state
            .endpoints
            .get_mut(local)
            .ok_or(Error::Malformed("unknown local endpoint"))?
            .open_flow(remote, auth_token, first_data, now)?;
        state.route_via_intro(&self.link, intro, frame).await;
        Ok(tag)
    }

    /// Send application data on an established flow.
    pub async fn send_flow(
        &self,
        local: &ServiceAddress,
        tag: &ConvoTag,
        data: &[u8],
    ) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        let now = now_ms();
        let (intro, frame) = state
            .endpoints
            .get_mut(local)
            .ok_or(Error::Malformed("unknown local endpoint"))?
            .send_data(tag, data, now)?;
        state.route_via_intro(&self.link, intro, frame).await;
        Ok(())
    }

    pub async fn usable_paths(&self) -> usize {
        let state = self.state.lock().await;
        let now = now_ms();
        state.paths.values().filter(|p| p.is_usable(now)).count()
    }

    pub async fn transit_entries(&self) -> usize {
        self.state.lock().await.transit.len()
    }

    pub async fn current_introset(&self, local: &ServiceAddress) -> Option<IntroSet> {
        let state = self.state.lock().await;
        state
            .endpoints
            .get(local)
            .and_then(|ep| ep.current_introset().cloned())
    }

    /// Best-effort teardown: a Close toward every owned path, then stop.
    pub async fn shutdown(&self) {
        {
            let state = self.state.lock().await;
            for path in state.paths.values() {
                let msg = LinkMessage::Close(PathClose {
                    path_id: path.outer_path_id(),
                });
                let _ = self.link.send_to(&path.first_hop_router(), &msg).await;
            }
        }
        self.cancel.cancel();
        self.link.shutdown();
    }

    // --- background tasks, one spawn per concern ---

    fn spawn_link_forwarder(
        &self,
        mut link_events: mpsc::Receiver<umbra_link::LinkEvent>,
        logic_tx: mpsc::Sender<LogicMsg>,
    ) {
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = link_events.recv() => {
                        match event {
                            Some(event) => {
                                if logic_tx.send(LogicMsg::Link(event)).await.is_err() {
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                }
            }
        });
    }

    fn spawn_logic_task(&self, mut logic_rx: mpsc::Receiver<LogicMsg>) {
        let state = self.state.clone();
        let link = self.link.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    msg = logic_rx.recv() => {
                        match msg {
                            Some(msg) => {
                                let mut state = state.lock().await;
                                state.handle_logic_msg(&link, msg).await;
                            }
                            None => break,
                        }
                    }
                }
            }
        });
    }

    /// Path lifecycle: build deadlines, expiries, probes, pool top-up.
    fn spawn_path_job(&self) {
        let state = self.state.clone();
        let link = self.link.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = time::sleep(PATH_TICK) => {
                        let mut state = state.lock().await;
                        path_tick(&mut state, &link).await;
                    }
                }
            }
        });
    }

    fn spawn_sweep_job(&self) {
        let state = self.state.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = time::sleep(SWEEP_TICK) => {
                        let mut state = state.lock().await;
                        let now = now_ms();
                        state.transit.sweep(now);
                        state.introset_store.sweep(now);
                        state.rc_store.remove_expired(now);
                        state.pending_out.expire(now);
                        state.dht_relay.retain(|_, entry| now < entry.deadline_ms);
                    }
                }
            }
        });
    }

    /// Service upkeep: introset refresh, publication, lookup deadlines.
    fn spawn_service_job(&self) {
        let state = self.state.clone();
        let link = self.link.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = time::sleep(SERVICE_TICK) => {
                        let mut state = state.lock().await;
                        service_tick(&mut state, &link).await;
                    }
                }
            }
        });
    }
}

impl Drop for Router {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.link.shutdown();
    }
}

async fn path_tick(state: &mut RouterState, link: &LinkLayer) {
    let now = now_ms();

    for failure in state.builder.tick(now) {
        log::warn!("router: build {} failed: {}", failure.outer, failure.error);
    }

    // keep the session count inside the operator's bounds
    let connected = link.established_routers().await;
    if connected.len() < state.config.min_connected_routers {
        let want = state.config.min_connected_routers - connected.len();
        let candidates = state.rc_store.random_sample(&state.crypto, want, now, |rc| {
            rc.router_id != state.our_rc.router_id && !connected.contains(&rc.router_id)
        });
        for rc in candidates {
            if connected.len() >= state.config.max_connected_routers {
                break;
            }
            if let Err(err) = link.connect(&rc).await {
                log::debug!("router: upkeep dial {} failed: {err}", rc.router_id);
            }
        }
    }

    // expiries and probe verdicts
    let mut dead = Vec::new();
    let mut probes = Vec::new();
    for (outer, path) in state.paths.iter_mut() {
        path.expire_tick(now);
        if !path.is_usable(now) {
            dead.push(*outer);
            continue;
        }
        if path.on_probe_timeout(PROBE_TIMEOUT_MS, now) {
            dead.push(*outer);
            continue;
        }
        if !path.has_probe_in_flight()
            && now.saturating_sub(path.last_probe_ms) >= PROBE_INTERVAL_MS
        {
            let probe = path.begin_probe(&state.crypto, now);
            if let Ok((first, msg)) = path.wrap(&state.crypto, &probe) {
                probes.push((first, msg));
            }
        }
    }
    for outer in dead {
        state.paths.remove(&outer);
        state.emit(AppEvent::PathDead { outer });
    }
    for (first, msg) in probes {
        state.send_or_queue(link, first, msg).await;
    }
    state.retry_parked_flow(link).await;

    // keep the pool at target, rebuilding ahead of expiry
    let usable = state
        .paths
        .values()
        .filter(|p| p.is_usable(now) && !p.needs_rebuild(now, REBUILD_SLACK_MS))
        .count();
    let building = state.builder.pending_count();
    if usable + building < state.path_target {
        let (store, config) = (&state.rc_store, &state.config);
        match state.builder.begin_build(store, config, None, now) {
            Ok((_outer, first_hop, commit)) => {
                state
                    .send_or_queue(link, first_hop, LinkMessage::RelayCommit(commit))
                    .await;
            }
            Err(Error::NotEnoughRouters) => {
                log::debug!("router: not enough contacts to build a path yet");
            }
            Err(Error::Congested) => {}
            Err(err) => log::warn!("router: build refused: {err}"),
        }
    }
}

async fn service_tick(state: &mut RouterState, link: &LinkLayer) {
    let now = now_ms();

    // intros follow the termini of the usable path pool
    let intros: Vec<Introduction> = state
        .paths
        .values()
        .filter(|p| p.is_usable(now))
        .map(|p| Introduction {
            router: p.terminus_router(),
            path_id: p.terminus_path_id(),
            expires_at: p.expires_at_ms,
        })
        .collect();

    let addresses: Vec<ServiceAddress> = state.endpoints.keys().copied().collect();
    for address in addresses {
        let mut publish = None;
        let mut failures = Vec::new();
        {
            let crypto = state.crypto;
            let endpoint = state.endpoints.get_mut(&address).expect("key from map");

            if !intros.is_empty() {
                let changed = match endpoint.current_introset() {
                    Some(set) => {
                        let mut current = set.intros.clone();
                        let mut fresh = intros.clone();
                        current.sort_by_key(|i| (i.router, i.path_id));
                        fresh.sort_by_key(|i| (i.router, i.path_id));
                        current != fresh
                    }
                    None => true,
                };
                if changed {
                    if let Err(err) = endpoint.rebuild_introset(intros.clone()) {
                        log::warn!("router: introset rebuild failed: {err}");
                    }
                }
            }

            endpoint.publisher.tick(now);
            if let Some(set) = endpoint.current_introset().cloned() {
                if endpoint.publisher.due(&set, now) {
                    publish = Some(endpoint.publisher.begin(&crypto, set, now));
                }
            }
            failures.extend(endpoint.lookups.tick(now));
        }

        if let Some(dht) = publish {
            // toward the DHT node closest to the service address, over the
            // path whose terminus is nearest that key
            let wrapped = state
                .paths
                .values()
                .filter(|p| p.is_usable(now))
                .min_by_key(|p| {
                    xor_distance(p.terminus_router().as_bytes(), address.as_bytes())
                })
                .map(|p| p.wrap(&state.crypto, &TerminalMessage::Dht(dht)));
            if let Some(Ok((first, msg))) = wrapped {
                state.send_or_queue(link, first, msg).await;
            }
        }
        for (service, error) in failures {
            log::info!("router: lookup for {service} failed: {error}");
            state.emit(AppEvent::IntroSetResolved {
                service,
                result: None,
            });
        }
    }
}
