//! Socket-facing side of the link layer: one UDP socket, a table of
//! sessions keyed by peer address and re-keyed by router id once the LIM
//! binds them, and the periodic tick that drives timers.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{self, Duration, Instant};
use tokio_util::sync::CancellationToken;
use umbra_core::wire::{LinkMessage, MAX_FRAME_SIZE};
use umbra_core::{Config, Error, RouterContact, RouterId};
use umbra_crypto::CryptoProvider;
use x25519_dalek::StaticSecret;

use crate::session::{CloseReason, Session, SessionEvent};

const TICK_INTERVAL: Duration = Duration::from_millis(100);
const EVENT_QUEUE_DEPTH: usize = 1024;

#[derive(Debug, Clone, Copy)]
pub struct LinkConfig {
    pub session_timeout: Duration,
    pub keep_alive_interval: Duration,
}

impl LinkConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            session_timeout: Duration::from_millis(config.session_timeout_ms),
            keep_alive_interval: Duration::from_millis(config.keep_alive_interval_ms),
        }
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            session_timeout: crate::session::SESSION_TIMEOUT,
            keep_alive_interval: crate::session::KEEP_ALIVE_INTERVAL,
        }
    }
}

#[derive(Debug)]
pub enum LinkEvent {
    SessionEstablished {
        router: RouterId,
        rc: RouterContact,
    },
    SessionClosed {
        router: Option<RouterId>,
        reason: CloseReason,
    },
    Message {
        router: RouterId,
        data: Vec<u8>,
    },
}

#[derive(Default)]
struct LinkState {
    sessions: HashMap<SocketAddr, Session>,
    by_router: HashMap<RouterId, SocketAddr>,
}

pub struct LinkLayer {
    crypto: CryptoProvider,
    our_rc: RouterContact,
    our_enc_secret: StaticSecret,
    config: LinkConfig,
    socket: Arc<UdpSocket>,
    state: Arc<Mutex<LinkState>>,
    events_tx: mpsc::Sender<LinkEvent>,
    cancel: CancellationToken,
}

impl LinkLayer {
    pub async fn bind(
        crypto: CryptoProvider,
        our_rc: RouterContact,
        our_enc_secret: StaticSecret,
        bind_addr: SocketAddr,
        config: LinkConfig,
    ) -> std::io::Result<(Self, mpsc::Receiver<LinkEvent>)> {
        let socket = UdpSocket::bind(bind_addr).await?;
        Ok(Self::from_socket(
            crypto,
            our_rc,
            our_enc_secret,
            socket,
            config,
        ))
    }

    /// Wrap an already-bound socket - used when the caller needs the real
    /// local address before signing its router contact.
    pub fn from_socket(
        crypto: CryptoProvider,
        our_rc: RouterContact,
        our_enc_secret: StaticSecret,
        socket: UdpSocket,
        config: LinkConfig,
    ) -> (Self, mpsc::Receiver<LinkEvent>) {
        let socket = Arc::new(socket);
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let layer = Self {
            crypto,
            our_rc,
            our_enc_secret,
            config,
            socket,
            state: Arc::new(Mutex::new(LinkState::default())),
            events_tx,
            cancel: CancellationToken::new(),
        };
        layer.spawn_recv_loop();
        layer.spawn_tick_loop();
        (layer, events_rx)
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn our_router_id(&self) -> RouterId {
        self.our_rc.router_id
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Dial a router by its contact. A no-op when a session already exists.
    pub async fn connect(&self, rc: &RouterContact) -> Result<(), Error> {
        let addr = *rc
            .addrs
            .first()
            .ok_or(Error::UnknownRouter(rc.router_id))?;
        let mut state = self.state.lock().await;
        if let Some(existing) = state.by_router.get(&rc.router_id) {
            if *existing != addr {
                // transport address changed: the old session dies first
                let old = *existing;
                if let Some(mut session) = state.sessions.remove(&old) {
                    session.close(CloseReason::Replaced);
                    self.flush(&mut state, old, session).await;
                }
            } else if state.sessions.contains_key(&addr) {
                return Ok(());
            }
        }
        if state.sessions.contains_key(&addr) {
            return Ok(());
        }

        log::debug!("link: dialing {} at {addr}", rc.router_id);
        let session = Session::connect(
            self.crypto,
            self.our_rc.clone(),
            self.our_enc_secret.clone(),
            rc,
            self.config.session_timeout,
            self.config.keep_alive_interval,
            Instant::now(),
        );
        self.insert_and_flush(&mut state, addr, session).await;
        Ok(())
    }

    /// Queue one link message toward an established session. Refused with
    /// [`Error::NoSession`] otherwise - traffic never touches the wire for
    /// a peer that is not established.
    pub async fn send_to(&self, router: &RouterId, msg: &LinkMessage) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        let addr = *state
            .by_router
            .get(router)
            .ok_or(Error::NoSession(*router))?;
        let mut session = state
            .sessions
            .remove(&addr)
            .ok_or(Error::NoSession(*router))?;
        let result = session.queue_message(msg, Instant::now());
        self.insert_and_flush(&mut state, addr, session).await;
        result.map(|_| ())
    }

    pub async fn is_established(&self, router: &RouterId) -> bool {
        let state = self.state.lock().await;
        state
            .by_router
            .get(router)
            .and_then(|addr| state.sessions.get(addr))
            .map(|s| s.is_established())
            .unwrap_or(false)
    }

    pub async fn established_routers(&self) -> Vec<RouterId> {
        let state = self.state.lock().await;
        state
            .by_router
            .iter()
            .filter(|(_, addr)| {
                state
                    .sessions
                    .get(addr)
                    .map(|s| s.is_established())
                    .unwrap_or(false)
            })
            .map(|(router, _)| *router)
            .collect()
    }

    pub async fn close_session(&self, router: &RouterId) {
        let mut state = self.state.lock().await;
        if let Some(addr) = state.by_router.remove(router) {
            if let Some(mut session) = state.sessions.remove(&addr) {
                session.close(CloseReason::Local);
                self.flush(&mut state, addr, session).await;
            }
        }
    }

    fn spawn_recv_loop(&self) {
        let crypto = self.crypto;
        let our_rc = self.our_rc.clone();
        let our_enc_secret = self.our_enc_secret.clone();
        let config = self.config;
        let socket = self.socket.clone();
        let state = self.state.clone();
        let events_tx = self.events_tx.clone();
        let cancel = self.cancel.clone();
        let layer = LinkLayerHandle {
            state,
            socket,
            events_tx,
        };

        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_FRAME_SIZE * 2];
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    recv = layer.socket.recv_from(&mut buf) => {
                        let (len, from) = match recv {
                            Ok(pair) => pair,
                            Err(err) => {
                                log::warn!("link: recv error: {err}");
                                continue;
                            }
                        };
                        let now = Instant::now();
                        let mut guard = layer.state.lock().await;
                        let mut session = match guard.sessions.remove(&from) {
                            Some(session) => session,
                            None => Session::accept(
                                crypto,
                                our_rc.clone(),
                                our_enc_secret.clone(),
                                config.session_timeout,
                                config.keep_alive_interval,
                                now,
                            ),
                        };
                        session.handle_datagram(&buf[..len], now);
                        layer.insert_and_flush(&mut guard, from, session).await;
                    }
                }
            }
        });
    }

    fn spawn_tick_loop(&self) {
        let socket = self.socket.clone();
        let state = self.state.clone();
        let events_tx = self.events_tx.clone();
        let cancel = self.cancel.clone();
        let layer = LinkLayerHandle {
            state,
            socket,
            events_tx,
        };

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = time::sleep(TICK_INTERVAL) => {
                        let now = Instant::now();
                        let mut guard = layer.state.lock().await;
                        let addrs: Vec<SocketAddr> = guard.sessions.keys().copied().collect();
                        for addr in addrs {
                            if let Some(mut session) = guard.sessions.remove(&addr) {
                                session.tick(now);
                                layer.insert_and_flush(&mut guard, addr, session).await;
                            }
                        }
                    }
                }
            }
        });
    }

    async fn insert_and_flush(
        &self,
        state: &mut LinkState,
        addr: SocketAddr,
        session: Session,
    ) {
        let handle = LinkLayerHandle {
            state: self.state.clone(),
            socket: self.socket.clone(),
            events_tx: self.events_tx.clone(),
        };
        handle.insert_and_flush(state, addr, session).await;
    }

    async fn flush(&self, state: &mut LinkState, addr: SocketAddr, session: Session) {
        let handle = LinkLayerHandle {
            state: self.state.clone(),
            socket: self.socket.clone(),
            events_tx: self.events_tx.clone(),
        };
        handle.flush_dead(state, addr, session).await;
    }
}

impl Drop for LinkLayer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// The pieces the background tasks share with the public surface.
struct LinkLayerHandle {
    state: Arc<Mutex<LinkState>>,
    socket: Arc<UdpSocket>,
    events_tx: mpsc::Sender<LinkEvent>,
}

impl LinkLayerHandle {
    /// Send pending datagrams, route events, and either re-insert the
    /// session or discard it when dead.
    async fn insert_and_flush(
        &self,
        state: &mut LinkState,
        addr: SocketAddr,
        mut session: Session,
    ) {
        self.drain(state, addr, &mut session).await;
        if session.is_dead() {
            if let Some(router) = session.remote_router() {
                if state.by_router.get(&router) == Some(&addr) {
                    state.by_router.remove(&router);
                }
            }
        } else {
            state.sessions.insert(addr, session);
        }
    }

    async fn flush_dead(&self, state: &mut LinkState, addr: SocketAddr, mut session: Session) {
        self.drain(state, addr, &mut session).await;
        if let Some(router) = session.remote_router() {
            if state.by_router.get(&router) == Some(&addr) {
                state.by_router.remove(&router);
            }
        }
    }

    async fn drain(&self, state: &mut LinkState, addr: SocketAddr, session: &mut Session) {
        while let Some(pkt) = session.poll_transmit() {
            if let Err(err) = self.socket.send_to(&pkt, addr).await {
                log::warn!("link: send to {addr} failed: {err}");
                break;
            }
        }
        while let Some(event) = session.poll_event() {
            match event {
                SessionEvent::Established { router } => {
                    if let Some(old) = state.by_router.insert(router, addr) {
                        if old != addr {
                            log::info!("link: {router} moved {old} -> {addr}");
                            if let Some(mut stale) = state.sessions.remove(&old) {
                                stale.close(CloseReason::Replaced);
                                while let Some(pkt) = stale.poll_transmit() {
                                    let _ = self.socket.send_to(&pkt, old).await;
                                }
                            }
                        }
                    }
                    let rc = session
                        .remote_rc()
                        .cloned()
                        .expect("established implies a bound contact");
                    if self
                        .events_tx
                        .try_send(LinkEvent::SessionEstablished { router, rc })
                        .is_err()
                    {
                        log::warn!("link: event queue full, dropping establish event");
                    }
                }
                SessionEvent::Message(data) => {
                    if let Some(router) = session.remote_router() {
                        if self
                            .events_tx
                            .try_send(LinkEvent::Message { router, data })
                            .is_err()
                        {
                            log::warn!("link: event queue full, dropping message");
                        }
                    }
                }
                SessionEvent::Closed(reason) => {
                    let _ = self.events_tx.try_send(LinkEvent::SessionClosed {
                        router: session.remote_router(),
                        reason,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use umbra_core::now_ms;
    use umbra_core::wire::PathClose;
    use umbra_core::PathId;
    use x25519_dalek::PublicKey;

    async fn spawn_node() -> (LinkLayer, mpsc::Receiver<LinkEvent>, RouterContact) {
        let crypto = CryptoProvider::new();
        let signing = crypto.signing_keygen();
        let enc_secret = crypto.encryption_keygen();
        let bind: SocketAddr = "127.0.0.1:0".parse().expect("addr");
        // sign the contact after the socket tells us the real port
        let placeholder = RouterContact::signed(
            &crypto,
            &signing,
            PublicKey::from(&enc_secret).to_bytes(),
            vec![],
            vec![bind],
            now_ms() + 3_600_000,
        )
        .expect("rc");
        let (layer, events) = LinkLayer::bind(
            crypto,
            placeholder,
            enc_secret.clone(),
            bind,
            LinkConfig::default(),
        )
        .await
        .expect("bind");
        let real_addr = layer.local_addr().expect("local addr");
        let rc = RouterContact::signed(
            &crypto,
            &signing,
            PublicKey::from(&enc_secret).to_bytes(),
            vec![],
            vec![real_addr],
            now_ms() + 3_600_000,
        )
        .expect("rc");
        (layer, events, rc)
    }

    async fn wait_for_established(
        events: &mut mpsc::Receiver<LinkEvent>,
    ) -> RouterId {
        loop {
            match tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .expect("event before timeout")
                .expect("channel open")
            {
                LinkEvent::SessionEstablished { router, .. } => return router,
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn end_to_end_over_loopback() {
        let (node_a, mut events_a, rc_a) = spawn_node().await;
        let (node_b, mut events_b, rc_b) = spawn_node().await;

        // node A needs its own proper RC for the LIM; rebind with it would
        // complicate the test, so just check the handshake works both ways
        // with the placeholder contact carrying the right keys.
        let _ = rc_a;
        node_a.connect(&rc_b).await.expect("dial");

        let a_peer = wait_for_established(&mut events_a).await;
        assert_eq!(a_peer, rc_b.router_id);
        let _ = wait_for_established(&mut events_b).await;

        let msg = LinkMessage::Close(PathClose {
            path_id: PathId::new([1; 16]),
        });
        node_a.send_to(&rc_b.router_id, &msg).await.expect("send");

        loop {
            match tokio::time::timeout(Duration::from_secs(5), events_b.recv())
                .await
                .expect("event before timeout")
                .expect("channel open")
            {
                LinkEvent::Message { data, .. } => {
                    let decoded = LinkMessage::decode(&data).expect("decode");
                    assert!(matches!(decoded, LinkMessage::Close(_)));
                    break;
                }
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn send_to_unknown_router_is_refused() {
        let (node, _events, _rc) = spawn_node().await;
        let msg = LinkMessage::Close(PathClose {
            path_id: PathId::zero(),
        });
        let result = node.send_to(&RouterId::new([7; 32]), &msg).await;
        assert!(matches!(result, Err(Error::NoSession(_))));
    }
}
