//! Persisted long-term keys: the router's signing, encryption, and KEM
//! secrets, and optionally a hidden-service identity.

use std::path::Path;

use anyhow::Context;
use ed25519_dalek::SigningKey;
use serde::{Deserialize, Serialize};
use umbra_crypto::{CryptoProvider, PqKeypair};
use umbra_flow::ServiceIdentity;
use umbra_router::RouterKeys;
use x25519_dalek::StaticSecret;

#[derive(Serialize, Deserialize)]
struct RouterKeyFile {
    #[serde(with = "serde_bytes")]
    signing: Vec<u8>,
    #[serde(with = "serde_bytes")]
    enc: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pq: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct ServiceKeyFile {
    #[serde(with = "serde_bytes")]
    signing: Vec<u8>,
    #[serde(with = "serde_bytes")]
    enc: Vec<u8>,
}

fn key32(bytes: &[u8], what: &str) -> anyhow::Result<[u8; 32]> {
    bytes
        .try_into()
        .map_err(|_| anyhow::anyhow!("{what} key has wrong length"))
}

pub fn load_or_create_router(
    crypto: &CryptoProvider,
    path: &Path,
) -> anyhow::Result<RouterKeys> {
    if path.exists() {
        let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        let file: RouterKeyFile = rmp_serde::from_slice(&bytes).context("decoding key file")?;
        return Ok(RouterKeys {
            signing: SigningKey::from_bytes(&key32(&file.signing, "signing")?),
            enc_secret: StaticSecret::from(key32(&file.enc, "encryption")?),
            pq: PqKeypair::from_secret_bytes(&file.pq)
                .map_err(|_| anyhow::anyhow!("KEM key is malformed"))?,
        });
    }

    let keys = RouterKeys::generate(crypto);
    let file = RouterKeyFile {
        signing: keys.signing.to_bytes().to_vec(),
        enc: keys.enc_secret.to_bytes().to_vec(),
        pq: keys.pq.secret_bytes().to_vec(),
    };
    std::fs::write(path, rmp_serde::to_vec(&file).context("encoding key file")?)
        .with_context(|| format!("writing {}", path.display()))?;
    log::info!("keys: generated router identity at {}", path.display());
    Ok(keys)
}

pub fn load_or_create_service(
    crypto: &CryptoProvider,
    path: &Path,
) -> anyhow::Result<ServiceIdentity> {
    if path.exists() {
        let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        let file: ServiceKeyFile = rmp_serde::from_slice(&bytes).context("decoding key file")?;
        return Ok(ServiceIdentity {
            signing: SigningKey::from_bytes(&key32(&file.signing, "signing")?),
            enc_secret: StaticSecret::from(key32(&file.enc, "encryption")?),
        });
    }

    let identity = ServiceIdentity::generate(crypto);
    let file = ServiceKeyFile {
        signing: identity.signing.to_bytes().to_vec(),
        enc: identity.enc_secret.to_bytes().to_vec(),
    };
    std::fs::write(path, rmp_serde::to_vec(&file).context("encoding key file")?)
        .with_context(|| format!("writing {}", path.display()))?;
    log::info!("keys: generated service identity at {}", path.display());
    Ok(identity)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn router_keys_round_trip() {
        let crypto = CryptoProvider::new();
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("router_keys.dat");

        let first = load_or_create_router(&crypto, &path).expect("create");
        let second = load_or_create_router(&crypto, &path).expect("load");
        assert_eq!(
            first.signing.verifying_key().to_bytes(),
            second.signing.verifying_key().to_bytes()
        );
        assert_eq!(first.enc_secret.to_bytes(), second.enc_secret.to_bytes());
        assert_eq!(
            first.pq.public().as_bytes().to_vec(),
            second.pq.public().as_bytes().to_vec()
        );
    }

    #[test]
    fn service_identity_round_trip() {
        let crypto = CryptoProvider::new();
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("service_keys.dat");

        let first = load_or_create_service(&crypto, &path).expect("create");
        let second = load_or_create_service(&crypto, &path).expect("load");
        assert_eq!(first.address(), second.address());
    }
}
