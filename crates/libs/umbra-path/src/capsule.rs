//! Sealed per-hop commit records. The capsule key is the classical DH share
//! combined with an ML-KEM encapsulation against the hop's long-term keys,
//! and doubles as the hop's path symmetric key - opening the capsule is the
//! key agreement.

use umbra_core::wire::{CommitCapsule, CommitRecord};
use umbra_core::{Error, RouterContact};
use umbra_crypto::{CryptoProvider, PqCiphertext, PqKeypair, PqPublicKey, SharedKey};
use x25519_dalek::{PublicKey, StaticSecret};

fn combine(crypto: &CryptoProvider, classical: &SharedKey, pq: &SharedKey) -> SharedKey {
    SharedKey::new(crypto.hmac(classical.as_ref(), pq.as_ref()))
}

/// Builder side: seal `record` so only `hop` can open it. Returns the
/// capsule and the path key shared with that hop.
pub fn seal(
    crypto: &CryptoProvider,
    hop: &RouterContact,
    record: &CommitRecord,
) -> Result<(CommitCapsule, SharedKey), Error> {
    let eph = crypto.encryption_keygen();
    let eph_pub = PublicKey::from(&eph);
    let nonce = crypto.rand_nonce();

    let classical = crypto.dh_client(&PublicKey::from(hop.enc_key), &eph, &nonce);
    let pq_pub = PqPublicKey::from_slice(&hop.pq_key)?;
    let (pq_ct, pq_shared) = crypto.pq_encaps(&pq_pub)?;
    let key = combine(crypto, &classical, &pq_shared);

    let mut sealed = rmp_serde::to_vec(record)?;
    crypto.xchacha20(&mut sealed, &key, &nonce);
    let tag = crypto.hmac(key.as_ref(), &sealed);

    Ok((
        CommitCapsule {
            eph_pub: eph_pub.to_bytes(),
            pq_ciphertext: pq_ct.as_bytes().to_vec(),
            nonce,
            record: sealed,
            tag,
        },
        key,
    ))
}

/// Hop side: open a capsule with our long-term keys. Failure means the
/// capsule was not addressed to us or was tampered with.
pub fn open(
    crypto: &CryptoProvider,
    enc_secret: &StaticSecret,
    pq: &PqKeypair,
    capsule: &CommitCapsule,
) -> Result<(CommitRecord, SharedKey), Error> {
    let classical = crypto.dh_server(
        &PublicKey::from(capsule.eph_pub),
        enc_secret,
        &capsule.nonce,
    );
    let pq_ct = PqCiphertext::from_slice(&capsule.pq_ciphertext)?;
    let pq_shared = crypto.pq_decaps(pq, &pq_ct)?;
    let key = combine(crypto, &classical, &pq_shared);

    if !crypto.hmac_verify(key.as_ref(), &capsule.record, &capsule.tag) {
        return Err(Error::AuthenticatorMismatch);
    }
    let mut plain = capsule.record.clone();
    crypto.xchacha20(&mut plain, &key, &capsule.nonce);
    let record: CommitRecord = rmp_serde::from_slice(&plain)?;
    Ok((record, key))
}

/// A decoy capsule, indistinguishable in shape from a real one, appended as
/// the commit travels so its length stays constant.
pub fn decoy(crypto: &CryptoProvider, record_len: usize) -> CommitCapsule {
    let mut eph_pub = [0u8; 32];
    crypto.rand_bytes(&mut eph_pub);
    let mut pq_ciphertext = vec![0u8; umbra_crypto::PQ_CIPHERTEXT_SIZE];
    crypto.rand_bytes(&mut pq_ciphertext);
    let mut record = vec![0u8; record_len];
    crypto.rand_bytes(&mut record);
    let mut tag = [0u8; 32];
    crypto.rand_bytes(&mut tag);
    CommitCapsule {
        eph_pub,
        pq_ciphertext,
        nonce: crypto.rand_nonce(),
        record,
        tag,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use umbra_core::{now_ms, PathId, RouterId};

    fn hop_identity(crypto: &CryptoProvider) -> (RouterContact, StaticSecret, PqKeypair) {
        let signing = crypto.signing_keygen();
        let enc_secret = crypto.encryption_keygen();
        let pq = crypto.pq_keygen();
        let rc = RouterContact::signed(
            crypto,
            &signing,
            PublicKey::from(&enc_secret).to_bytes(),
            pq.public().as_bytes().to_vec(),
            vec![],
            now_ms() + 3_600_000,
        )
        .expect("rc");
        (rc, enc_secret, pq)
    }

    fn record() -> CommitRecord {
        CommitRecord {
            path_id: PathId::new([1; 16]),
            next_router: RouterId::new([2; 32]),
            next_path_id: PathId::new([3; 16]),
            lifetime_ms: 600_000,
            chain_index: 0,
        }
    }

    #[test]
    fn seal_open_agree_on_key_and_record() {
        let crypto = CryptoProvider::new();
        let (rc, enc_secret, pq) = hop_identity(&crypto);

        let (capsule, builder_key) = seal(&crypto, &rc, &record()).expect("seal");
        let (opened, hop_key) = open(&crypto, &enc_secret, &pq, &capsule).expect("open");

        assert_eq!(builder_key.as_bytes(), hop_key.as_bytes());
        assert_eq!(opened.path_id, PathId::new([1; 16]));
        assert_eq!(opened.next_router, RouterId::new([2; 32]));
    }

    #[test]
    fn wrong_hop_cannot_open() {
        let crypto = CryptoProvider::new();
        let (rc, _, _) = hop_identity(&crypto);
        let (_, other_enc, other_pq) = hop_identity(&crypto);

        let (capsule, _) = seal(&crypto, &rc, &record()).expect("seal");
        assert!(open(&crypto, &other_enc, &other_pq, &capsule).is_err());
    }

    #[test]
    fn tampered_capsule_is_rejected() {
        let crypto = CryptoProvider::new();
        let (rc, enc_secret, pq) = hop_identity(&crypto);
        let (mut capsule, _) = seal(&crypto, &rc, &record()).expect("seal");
        capsule.record[0] ^= 1;
        assert!(matches!(
            open(&crypto, &enc_secret, &pq, &capsule),
            Err(Error::AuthenticatorMismatch)
        ));
    }

    #[test]
    fn decoy_does_not_open() {
        let crypto = CryptoProvider::new();
        let (_, enc_secret, pq) = hop_identity(&crypto);
        let fake = decoy(&crypto, 64);
        assert!(open(&crypto, &enc_secret, &pq, &fake).is_err());
    }
}
