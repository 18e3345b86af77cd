//! A local hidden-service endpoint: owns the service identity, its current
//! introset, and the per-conversation flow table. Pure state machine - the
//! dispatch core routes the frames it emits.

use std::collections::{HashMap, HashSet};

use umbra_core::wire::{FrameKind, ProtocolFrame};
use umbra_core::{ConvoTag, Error, IntroSet, Introduction, RouterId, ServiceAddress};
use umbra_crypto::CryptoProvider;

use crate::frame_crypto::{self, HandshakeBody};
use crate::identity::ServiceIdentity;
use crate::lookup::{LookupConfig, LookupManager};
use crate::publish::Publisher;
use crate::session::{FlowSession, FlowState};

#[derive(Clone)]
pub struct EndpointConfig {
    /// When set, the first inbound frame of a flow must carry one of these
    /// bearer tokens.
    pub auth_tokens: Option<HashSet<String>>,
    pub topic: String,
    pub publish_interval_ms: u64,
    pub lookup: LookupConfig,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            auth_tokens: None,
            topic: String::new(),
            publish_interval_ms: crate::publish::DEFAULT_PUBLISH_INTERVAL_MS,
            lookup: LookupConfig::default(),
        }
    }
}

pub enum FlowEffect {
    /// Hand decrypted bytes to the application.
    Deliver { tag: ConvoTag, data: Vec<u8> },
    /// Route a frame to the remote via the given introduction.
    SendFrame {
        via: Introduction,
        frame: ProtocolFrame,
    },
    Established { tag: ConvoTag },
    Rejected { tag: ConvoTag },
}

pub struct Endpoint {
    crypto: CryptoProvider,
    identity: ServiceIdentity,
    config: EndpointConfig,
    flows: HashMap<ConvoTag, FlowSession>,
    intro_blacklist: HashSet<RouterId>,
    pub publisher: Publisher,
    pub lookups: LookupManager,
    introset_seq: u64,
    current_introset: Option<IntroSet>,
    auth_rejects: u64,
}

impl Endpoint {
    pub fn new(crypto: CryptoProvider, identity: ServiceIdentity, config: EndpointConfig) -> Self {
        let publisher = Publisher::new(config.publish_interval_ms);
        Self {
            crypto,
            identity,
            config,
            flows: HashMap::new(),
            intro_blacklist: HashSet::new(),
            publisher,
            lookups: LookupManager::new(),
            introset_seq: 0,
            current_introset: None,
            auth_rejects: 0,
        }
    }

    pub fn address(&self) -> ServiceAddress {
        self.identity.address()
    }

    pub fn lookup_config(&self) -> LookupConfig {
        self.config.lookup
    }

    pub fn current_introset(&self) -> Option<&IntroSet> {
        self.current_introset.as_ref()
    }

    pub fn auth_rejects(&self) -> u64 {
        self.auth_rejects
    }

    pub fn blacklist_intro(&mut self, router: RouterId) {
        self.intro_blacklist.insert(router);
    }

    pub fn flow_state(&self, tag: &ConvoTag) -> Option<FlowState> {
        self.flows.get(tag).map(|f| f.state)
    }

    /// Re-sign the introset from the endpoint's current path termini.
    /// Sequence numbers are monotonic across republishes.
    pub fn rebuild_introset(&mut self, intros: Vec<Introduction>) -> Result<IntroSet, Error> {
        self.introset_seq += 1;
        let set = IntroSet::signed(
            &self.crypto,
            &self.identity.signing,
            self.identity.enc_public(),
            self.config.topic.clone(),
            self.introset_seq,
            intros,
        )?;
        self.current_introset = Some(set.clone());
        Ok(set)
    }

    /// Open a flow toward a remote service whose introset we resolved.
    /// Returns the conversation tag, the introduction to route through,
    /// and the handshake frame.
    pub fn open_flow(
        &mut self,
        remote: &IntroSet,
        auth_token: Option<String>,
        first_data: Vec<u8>,
        now_ms: u64,
    ) -> Result<(ConvoTag, Introduction, ProtocolFrame), Error> {
        let ours = self
            .current_introset
            .clone()
            .ok_or(Error::Malformed("no published introset to reply to"))?;
        remote.verify(&self.crypto, now_ms)?;
        let intro = remote
            .best_intro(now_ms, &self.intro_blacklist)
            .ok_or(Error::IntroSetStale)?
            .clone();

        let mut tag_bytes = [0u8; ConvoTag::SIZE];
        self.crypto.rand_bytes(&mut tag_bytes);
        let tag = ConvoTag::new(tag_bytes);

        let body = HandshakeBody {
            introset: ours,
            data: first_data,
        };
        let (frame, key) = frame_crypto::build_handshake(
            &self.crypto,
            &self.identity,
            remote.enc_key,
            tag,
            auth_token,
            &body,
        )?;

        let session = FlowSession::outbound(
            tag,
            remote.service,
            key,
            remote.clone(),
            intro.clone(),
            now_ms,
        );
        self.flows.insert(tag, session);
        log::info!("flow: opening {tag} toward {}", remote.service);
        Ok((tag, intro, frame))
    }

    /// Encrypt application data for an established flow.
    pub fn send_data(
        &mut self,
        tag: &ConvoTag,
        data: &[u8],
        now_ms: u64,
    ) -> Result<(Introduction, ProtocolFrame), Error> {
        let blacklist = self.intro_blacklist.clone();
        let flow = self
            .flows
            .get_mut(tag)
            .ok_or(Error::Malformed("unknown conversation"))?;
        if flow.state != FlowState::Established {
            return Err(Error::Malformed("flow not established"));
        }
        let seq = flow.next_sequence();
        let frame = frame_crypto::build_data(&self.crypto, &flow.key, *tag, seq, data)?;
        let intro = flow
            .route_intro(now_ms, &blacklist)
            .ok_or(Error::IntroSetStale)?;
        Ok((intro, frame))
    }

    /// Process one end-to-end frame addressed to this endpoint.
    pub fn handle_frame(&mut self, frame: ProtocolFrame, now_ms: u64) -> Vec<FlowEffect> {
        match frame.kind {
            FrameKind::Handshake => self.on_handshake(frame, now_ms),
            FrameKind::HandshakeAck => self.on_ack(frame),
            FrameKind::Data => self.on_data(frame, now_ms),
            FrameKind::Reject => self.on_reject(frame),
        }
    }

    fn on_handshake(&mut self, frame: ProtocolFrame, now_ms: u64) -> Vec<FlowEffect> {
        let tag = frame.convo_tag;
        if self.flows.contains_key(&tag) {
            log::debug!("flow: duplicate handshake for {tag}");
            return Vec::new();
        }
        let (body, key, sender) =
            match frame_crypto::open_handshake(&self.crypto, &self.identity, &frame) {
                Ok(opened) => opened,
                Err(err) => {
                    log::debug!("flow: dropping unopenable handshake: {err}");
                    return Vec::new();
                }
            };
        let reply_intro = body.introset.best_intro(now_ms, &self.intro_blacklist);

        if let Some(tokens) = &self.config.auth_tokens {
            let authorized = frame
                .auth_token
                .as_ref()
                .map(|t| tokens.contains(t))
                .unwrap_or(false);
            if !authorized {
                self.auth_rejects += 1;
                log::info!("flow: rejecting {tag} from {sender} by auth policy");
                return match reply_intro {
                    Some(via) => vec![FlowEffect::SendFrame {
                        via: via.clone(),
                        frame: frame_crypto::build_reject(tag),
                    }],
                    None => Vec::new(),
                };
            }
        }

        let Some(via) = reply_intro.cloned() else {
            log::debug!("flow: handshake from {sender} carried no usable intro");
            return Vec::new();
        };

        let ack = match frame_crypto::build_ack(&self.crypto, &key, tag) {
            Ok(ack) => ack,
            Err(err) => {
                log::warn!("flow: could not build ack: {err}");
                return Vec::new();
            }
        };
        let mut session =
            FlowSession::inbound(tag, sender, key, Some(body.introset), now_ms);
        session.last_intro = Some(via.clone());
        self.flows.insert(tag, session);
        log::info!("flow: accepted {tag} from {sender}");

        let mut effects = vec![
            FlowEffect::SendFrame { via, frame: ack },
            FlowEffect::Established { tag },
        ];
        if !body.data.is_empty() {
            effects.push(FlowEffect::Deliver {
                tag,
                data: body.data,
            });
        }
        effects
    }

    fn on_ack(&mut self, frame: ProtocolFrame) -> Vec<FlowEffect> {
        let tag = frame.convo_tag;
        let Some(flow) = self.flows.get_mut(&tag) else {
            return Vec::new();
        };
        if flow.state != FlowState::Pending {
            return Vec::new();
        }
        if !frame_crypto::verify_ack(&self.crypto, &flow.key, &frame) {
            log::debug!("flow: bad ack for {tag}");
            return Vec::new();
        }
        flow.state = FlowState::Established;
        log::info!("flow: {tag} established");
        vec![FlowEffect::Established { tag }]
    }

    fn on_data(&mut self, frame: ProtocolFrame, now_ms: u64) -> Vec<FlowEffect> {
        let tag = frame.convo_tag;
        let Some(flow) = self.flows.get_mut(&tag) else {
            log::debug!("flow: data for unknown {tag}");
            return Vec::new();
        };
        if flow.state != FlowState::Established {
            return Vec::new();
        }
        let data = match frame_crypto::open_data(&self.crypto, &flow.key, &frame) {
            Ok(data) => data,
            Err(err) => {
                log::debug!("flow: dropping bad data frame on {tag}: {err}");
                return Vec::new();
            }
        };
        // dedup after authentication so garbage cannot poison the window
        if flow.accept_inbound(frame.sequence, now_ms).is_err() {
            return Vec::new();
        }
        vec![FlowEffect::Deliver { tag, data }]
    }

    fn on_reject(&mut self, frame: ProtocolFrame) -> Vec<FlowEffect> {
        let tag = frame.convo_tag;
        let Some(flow) = self.flows.get_mut(&tag) else {
            return Vec::new();
        };
        if flow.state != FlowState::Pending {
            return Vec::new();
        }
        flow.state = FlowState::Rejected;
        log::info!("flow: {tag} rejected by remote");
        vec![FlowEffect::Rejected { tag }]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use umbra_core::{now_ms, PathId};

    fn endpoint_with_intros(
        crypto: &CryptoProvider,
        config: EndpointConfig,
        router_byte: u8,
    ) -> Endpoint {
        let identity = ServiceIdentity::generate(crypto);
        let mut endpoint = Endpoint::new(*crypto, identity, config);
        endpoint
            .rebuild_introset(vec![Introduction {
                router: RouterId::new([router_byte; 32]),
                path_id: PathId::new([router_byte; 16]),
                expires_at: now_ms() + 600_000,
            }])
            .expect("introset");
        endpoint
    }

    fn establish_pair() -> (Endpoint, Endpoint, ConvoTag) {
        let crypto = CryptoProvider::new();
        let mut alice = endpoint_with_intros(&crypto, EndpointConfig::default(), 1);
        let mut bob = endpoint_with_intros(&crypto, EndpointConfig::default(), 2);
        let now = now_ms();

        let bob_set = bob.current_introset().expect("introset").clone();
        let (tag, _via, handshake) = alice
            .open_flow(&bob_set, None, b"first".to_vec(), now)
            .expect("open");

        let effects = bob.handle_frame(handshake, now);
        let ack = effects
            .into_iter()
            .find_map(|e| match e {
                FlowEffect::SendFrame { frame, .. } => Some(frame),
                _ => None,
            })
            .expect("ack frame");
        let effects = alice.handle_frame(ack, now);
        assert!(effects
            .iter()
            .any(|e| matches!(e, FlowEffect::Established { .. })));
        (alice, bob, tag)
    }

    #[test]
    fn full_flow_establishment_and_data() {
        let (mut alice, mut bob, tag) = establish_pair();
        let now = now_ms();
        assert_eq!(alice.flow_state(&tag), Some(FlowState::Established));
        assert_eq!(bob.flow_state(&tag), Some(FlowState::Established));

        let (_via, frame) = alice.send_data(&tag, b"payload", now).expect("send");
        let effects = bob.handle_frame(frame, now);
        match &effects[..] {
            [FlowEffect::Deliver { data, .. }] => assert_eq!(data, b"payload"),
            _ => panic!("expected delivery"),
        }
    }

    #[test]
    fn replayed_data_frame_is_dropped() {
        let (mut alice, mut bob, tag) = establish_pair();
        let now = now_ms();
        let (_, frame) = alice.send_data(&tag, b"x", now).expect("send");
        assert_eq!(bob.handle_frame(frame.clone(), now).len(), 1);
        assert!(bob.handle_frame(frame, now).is_empty());
    }

    #[test]
    fn auth_gate_rejects_missing_token() {
        let crypto = CryptoProvider::new();
        let mut tokens = HashSet::new();
        tokens.insert("sesame".to_string());
        let config = EndpointConfig {
            auth_tokens: Some(tokens),
            ..EndpointConfig::default()
        };
        let mut guarded = endpoint_with_intros(&crypto, config, 1);
        let mut alice = endpoint_with_intros(&crypto, EndpointConfig::default(), 2);
        let now = now_ms();

        let set = guarded.current_introset().expect("introset").clone();
        let (tag, _via, handshake) = alice
            .open_flow(&set, None, vec![], now)
            .expect("open");
        let effects = guarded.handle_frame(handshake, now);
        let reject = effects
            .into_iter()
            .find_map(|e| match e {
                FlowEffect::SendFrame { frame, .. } => Some(frame),
                _ => None,
            })
            .expect("reject frame");
        assert_eq!(reject.kind, FrameKind::Reject);
        assert_eq!(guarded.auth_rejects(), 1);
        assert_eq!(guarded.flow_state(&tag), None);

        let effects = alice.handle_frame(reject, now);
        assert!(effects
            .iter()
            .any(|e| matches!(e, FlowEffect::Rejected { .. })));
        assert_eq!(alice.flow_state(&tag), Some(FlowState::Rejected));
    }

    #[test]
    fn auth_gate_admits_valid_token() {
        let crypto = CryptoProvider::new();
        let mut tokens = HashSet::new();
        tokens.insert("sesame".to_string());
        let config = EndpointConfig {
            auth_tokens: Some(tokens),
            ..EndpointConfig::default()
        };
        let mut guarded = endpoint_with_intros(&crypto, config, 1);
        let mut alice = endpoint_with_intros(&crypto, EndpointConfig::default(), 2);
        let now = now_ms();

        let set = guarded.current_introset().expect("introset").clone();
        let (tag, _via, handshake) = alice
            .open_flow(&set, Some("sesame".into()), vec![], now)
            .expect("open");
        let effects = guarded.handle_frame(handshake, now);
        assert!(effects
            .iter()
            .any(|e| matches!(e, FlowEffect::Established { .. })));
        assert_eq!(guarded.flow_state(&tag), Some(FlowState::Established));
    }

    #[test]
    fn introset_sequence_is_monotonic() {
        let crypto = CryptoProvider::new();
        let mut endpoint = endpoint_with_intros(&crypto, EndpointConfig::default(), 1);
        let first = endpoint.current_introset().expect("set").sequence;
        endpoint
            .rebuild_introset(vec![Introduction {
                router: RouterId::new([3; 32]),
                path_id: PathId::new([3; 16]),
                expires_at: now_ms() + 600_000,
            }])
            .expect("rebuild");
        assert!(endpoint.current_introset().expect("set").sequence > first);
    }
}
