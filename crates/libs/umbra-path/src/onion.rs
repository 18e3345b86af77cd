//! Layered-encryption codec. Client-to-service wraps innermost first and
//! every hop peels one layer; the reverse direction has each hop adding a
//! layer that the client strips.

use umbra_core::wire::PathEnvelope;
use umbra_core::{Error, PathId};
use umbra_crypto::{CryptoProvider, SharedKey};

/// The client's view of one hop: the path id it assigned there and the
/// symmetric key agreed during the build.
#[derive(Clone)]
pub struct HopCrypt {
    pub path_id: PathId,
    pub key: SharedKey,
}

fn encode_env(env: &PathEnvelope) -> Result<Vec<u8>, Error> {
    rmp_serde::to_vec(env).map_err(Error::from)
}

fn decode_env(bytes: &[u8]) -> Result<PathEnvelope, Error> {
    rmp_serde::from_slice(bytes).map_err(Error::from)
}

/// Wrap `payload` for the downstream direction. The returned envelope is
/// what goes to the first hop; each hop's peel reveals the next envelope,
/// and the terminus' peel reveals `payload` itself.
pub fn wrap_downstream(
    crypto: &CryptoProvider,
    hops: &[HopCrypt],
    payload: &[u8],
) -> Result<PathEnvelope, Error> {
    if hops.is_empty() {
        return Err(Error::Malformed("path with no hops"));
    }
    let mut cur = payload.to_vec();
    for (i, hop) in hops.iter().enumerate().rev() {
        let nonce = crypto.rand_nonce();
        crypto.xchacha20(&mut cur, &hop.key, &nonce);
        let env = PathEnvelope {
            path_id: hop.path_id,
            nonce,
            body: cur,
        };
        if i == 0 {
            return Ok(env);
        }
        cur = encode_env(&env)?;
    }
    unreachable!("loop returns at the first hop");
}

/// Strip all layers from an upstream envelope arriving at the path owner.
pub fn unwrap_upstream(
    crypto: &CryptoProvider,
    hops: &[HopCrypt],
    envelope: PathEnvelope,
) -> Result<Vec<u8>, Error> {
    if hops.is_empty() {
        return Err(Error::Malformed("path with no hops"));
    }
    let mut env = envelope;
    for (i, hop) in hops.iter().enumerate() {
        if env.path_id != hop.path_id {
            return Err(Error::Malformed("path id mismatch in onion layer"));
        }
        let mut body = env.body;
        crypto.xchacha20(&mut body, &hop.key, &env.nonce);
        if i == hops.len() - 1 {
            return Ok(body);
        }
        env = decode_env(&body)?;
    }
    unreachable!("loop returns at the last hop");
}

/// One transit-hop peel in the downstream direction: the plaintext is
/// either the next hop's envelope or, at the terminus, the payload.
pub fn peel_layer(crypto: &CryptoProvider, key: &SharedKey, env: &PathEnvelope) -> Vec<u8> {
    let mut body = env.body.clone();
    crypto.xchacha20(&mut body, key, &env.nonce);
    body
}

/// Decode the peeled bytes as the next hop's envelope.
pub fn next_envelope(bytes: &[u8]) -> Result<PathEnvelope, Error> {
    decode_env(bytes)
}

/// One transit-hop wrap in the upstream direction: seal the inner bytes
/// under this hop's key and relabel with this hop's ingress path id.
pub fn add_layer(
    crypto: &CryptoProvider,
    key: &SharedKey,
    ingress: PathId,
    inner: &[u8],
) -> PathEnvelope {
    let nonce = crypto.rand_nonce();
    let mut body = inner.to_vec();
    crypto.xchacha20(&mut body, key, &nonce);
    PathEnvelope {
        path_id: ingress,
        nonce,
        body,
    }
}

/// Envelope encoding, exposed for the transit hop that must re-wrap a
/// received envelope as it pushes traffic upstream.
pub fn encode_envelope(env: &PathEnvelope) -> Result<Vec<u8>, Error> {
    encode_env(env)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hops(n: usize) -> Vec<HopCrypt> {
        (0..n)
            .map(|i| HopCrypt {
                path_id: PathId::new([i as u8 + 1; 16]),
                key: SharedKey::new([i as u8 + 101; 32]),
            })
            .collect()
    }

    #[test]
    fn downstream_peels_to_payload() {
        let crypto = CryptoProvider::new();
        let hops = hops(3);
        let payload = b"terminal payload".to_vec();
        let env = wrap_downstream(&crypto, &hops, &payload).expect("wrap");
        assert_eq!(env.path_id, hops[0].path_id);

        // hop 0 peels, revealing hop 1's envelope
        let plain = peel_layer(&crypto, &hops[0].key, &env);
        let env1 = next_envelope(&plain).expect("next envelope");
        assert_eq!(env1.path_id, hops[1].path_id);

        let plain = peel_layer(&crypto, &hops[1].key, &env1);
        let env2 = next_envelope(&plain).expect("next envelope");
        assert_eq!(env2.path_id, hops[2].path_id);

        // the terminus peel is the payload itself
        let terminal = peel_layer(&crypto, &hops[2].key, &env2);
        assert_eq!(terminal, payload);
    }

    #[test]
    fn upstream_round_trip_matches_transit_wrapping() {
        let crypto = CryptoProvider::new();
        let hops = hops(4);
        let payload = b"reply bytes".to_vec();

        // terminus originates, each hop toward the owner adds a layer
        let mut env = add_layer(&crypto, &hops[3].key, hops[3].path_id, &payload);
        for i in (0..3).rev() {
            let inner = encode_envelope(&env).expect("encode");
            env = add_layer(&crypto, &hops[i].key, hops[i].path_id, &inner);
        }

        let out = unwrap_upstream(&crypto, &hops, env).expect("unwrap");
        assert_eq!(out, payload);
    }

    /// decrypt(path, encrypt(path, P)) == P for payloads up to the MTU.
    #[test]
    fn layered_encryption_symmetry() {
        let crypto = CryptoProvider::new();
        for n in 1..=5 {
            let hops = hops(n);
            for len in [0usize, 1, 100, 1024, 4096] {
                let payload: Vec<u8> = (0..len).map(|i| (i % 255) as u8).collect();
                let env = wrap_downstream(&crypto, &hops, &payload).expect("wrap");

                // simulate every hop peeling in order
                let mut env = env;
                for (i, hop) in hops.iter().enumerate() {
                    let plain = peel_layer(&crypto, &hop.key, &env);
                    if i == hops.len() - 1 {
                        assert_eq!(plain, payload, "n={n} len={len}");
                    } else {
                        env = next_envelope(&plain).expect("envelope");
                    }
                }
            }
        }
    }

    #[test]
    fn upstream_rejects_wrong_path_id() {
        let crypto = CryptoProvider::new();
        let hops = hops(2);
        let env = add_layer(&crypto, &hops[0].key, PathId::new([0xee; 16]), b"x");
        assert!(unwrap_upstream(&crypto, &hops, env).is_err());
    }
}
