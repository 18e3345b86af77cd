use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::XChaCha20;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hmac::{Hmac, Mac};
use rand_core::{OsRng, RngCore};
use sha2::{Digest, Sha256, Sha512};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

pub const PUBLIC_KEY_SIZE: usize = 32;
pub const SHARED_KEY_SIZE: usize = 32;
/// XChaCha20 IV length. Wire nonces are [`TUNNEL_NONCE_SIZE`] bytes; the
/// cipher consumes the leading 24.
pub const NONCE_SIZE: usize = 24;
pub const TUNNEL_NONCE_SIZE: usize = 32;
pub const HASH_SIZE: usize = 64;
pub const SHORT_HASH_SIZE: usize = 32;
pub const HMAC_SIZE: usize = 32;
pub const SIGNATURE_SIZE: usize = 64;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("malformed key material")]
    Malformed,
    #[error("KEM operation failed")]
    Kem,
}

/// 32-byte symmetric key. Wiped on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SharedKey([u8; SHARED_KEY_SIZE]);

impl SharedKey {
    pub fn new(bytes: [u8; SHARED_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SHARED_KEY_SIZE] {
        &self.0
    }
}

impl AsRef<[u8]> for SharedKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for SharedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SharedKey(..)")
    }
}

/// The capability bundle handed around as part of the core context.
///
/// Stateless; methods that need randomness draw from `OsRng` directly.
#[derive(Clone, Copy, Default)]
pub struct CryptoProvider;

impl CryptoProvider {
    pub fn new() -> Self {
        Self
    }

    /// Client-role DH: `ours` is the client's secret, `theirs` the server's
    /// public key. Both roles derive the same key for the same nonce because
    /// the transcript is ordered client-key-first on both sides.
    pub fn dh_client(
        &self,
        theirs: &PublicKey,
        ours: &StaticSecret,
        nonce: &[u8; TUNNEL_NONCE_SIZE],
    ) -> SharedKey {
        let ours_pub = PublicKey::from(ours);
        dh(ours, theirs, &ours_pub, theirs, nonce)
    }

    /// Server-role DH: `ours` is the server's secret, `theirs` the client's
    /// public key.
    pub fn dh_server(
        &self,
        theirs: &PublicKey,
        ours: &StaticSecret,
        nonce: &[u8; TUNNEL_NONCE_SIZE],
    ) -> SharedKey {
        let ours_pub = PublicKey::from(ours);
        dh(ours, theirs, theirs, &ours_pub, nonce)
    }

    /// In-place XChaCha20. Encryption and decryption are the same operation.
    pub fn xchacha20(&self, buf: &mut [u8], key: &SharedKey, nonce: &[u8; TUNNEL_NONCE_SIZE]) {
        let iv: &[u8; NONCE_SIZE] = nonce[..NONCE_SIZE]
            .try_into()
            .expect("nonce carries at least an IV");
        let mut cipher = XChaCha20::new(key.as_bytes().into(), iv.into());
        cipher.apply_keystream(buf);
    }

    pub fn hash(&self, buf: &[u8]) -> [u8; HASH_SIZE] {
        let digest = Sha512::new().chain_update(buf).finalize();
        digest.into()
    }

    pub fn short_hash(&self, buf: &[u8]) -> [u8; SHORT_HASH_SIZE] {
        let digest = Sha256::new().chain_update(buf).finalize();
        digest.into()
    }

    pub fn hmac(&self, key: &[u8], buf: &[u8]) -> [u8; HMAC_SIZE] {
        let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
        mac.update(buf);
        mac.finalize().into_bytes().into()
    }

    /// Constant-time authenticator comparison.
    pub fn hmac_verify(&self, key: &[u8], buf: &[u8], tag: &[u8]) -> bool {
        let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
        mac.update(buf);
        mac.verify_slice(tag).is_ok()
    }

    pub fn sign(&self, secret: &SigningKey, buf: &[u8]) -> [u8; SIGNATURE_SIZE] {
        secret.sign(buf).to_bytes()
    }

    pub fn verify(&self, public: &[u8; PUBLIC_KEY_SIZE], buf: &[u8], sig: &[u8]) -> bool {
        let signature = match Signature::from_slice(sig) {
            Ok(sig) => sig,
            Err(_) => return false,
        };
        let key = match VerifyingKey::from_bytes(public) {
            Ok(key) => key,
            Err(_) => return false,
        };
        key.verify(buf, &signature).is_ok()
    }

    pub fn rand_bytes(&self, out: &mut [u8]) {
        OsRng.fill_bytes(out);
    }

    pub fn rand_u64(&self) -> u64 {
        OsRng.next_u64()
    }

    pub fn rand_nonce(&self) -> [u8; TUNNEL_NONCE_SIZE] {
        let mut nonce = [0u8; TUNNEL_NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);
        nonce
    }

    pub fn encryption_keygen(&self) -> StaticSecret {
        StaticSecret::random_from_rng(OsRng)
    }

    pub fn signing_keygen(&self) -> SigningKey {
        SigningKey::generate(&mut OsRng)
    }
}

fn dh(
    secret: &StaticSecret,
    theirs: &PublicKey,
    client_pub: &PublicKey,
    server_pub: &PublicKey,
    nonce: &[u8; TUNNEL_NONCE_SIZE],
) -> SharedKey {
    let point = secret.diffie_hellman(theirs);
    let mut mac =
        HmacSha256::new_from_slice(point.as_bytes()).expect("hmac accepts any key length");
    mac.update(client_pub.as_bytes());
    mac.update(server_pub.as_bytes());
    mac.update(nonce);
    SharedKey(mac.finalize().into_bytes().into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dh_roles_agree() {
        let crypto = CryptoProvider::new();
        let client_secret = crypto.encryption_keygen();
        let server_secret = crypto.encryption_keygen();
        let client_pub = PublicKey::from(&client_secret);
        let server_pub = PublicKey::from(&server_secret);
        let nonce = crypto.rand_nonce();

        let k_client = crypto.dh_client(&server_pub, &client_secret, &nonce);
        let k_server = crypto.dh_server(&client_pub, &server_secret, &nonce);
        assert_eq!(k_client.as_bytes(), k_server.as_bytes());
    }

    #[test]
    fn dh_is_nonce_bound() {
        let crypto = CryptoProvider::new();
        let client_secret = crypto.encryption_keygen();
        let server_secret = crypto.encryption_keygen();
        let server_pub = PublicKey::from(&server_secret);

        let k1 = crypto.dh_client(&server_pub, &client_secret, &[1u8; TUNNEL_NONCE_SIZE]);
        let k2 = crypto.dh_client(&server_pub, &client_secret, &[2u8; TUNNEL_NONCE_SIZE]);
        assert_ne!(k1.as_bytes(), k2.as_bytes());
    }

    #[test]
    fn xchacha20_round_trip() {
        let crypto = CryptoProvider::new();
        let key = SharedKey::new([7u8; SHARED_KEY_SIZE]);
        let nonce = crypto.rand_nonce();
        let plain = b"the quick brown fox".to_vec();

        let mut buf = plain.clone();
        crypto.xchacha20(&mut buf, &key, &nonce);
        assert_ne!(buf, plain);
        crypto.xchacha20(&mut buf, &key, &nonce);
        assert_eq!(buf, plain);
    }

    #[test]
    fn sign_verify_round_trip() {
        let crypto = CryptoProvider::new();
        let secret = crypto.signing_keygen();
        let public = secret.verifying_key().to_bytes();

        let sig = crypto.sign(&secret, b"payload");
        assert!(crypto.verify(&public, b"payload", &sig));
        assert!(!crypto.verify(&public, b"tampered", &sig));
    }

    #[test]
    fn hmac_verify_rejects_truncated_tag() {
        let crypto = CryptoProvider::new();
        let tag = crypto.hmac(b"key", b"data");
        assert!(crypto.hmac_verify(b"key", b"data", &tag));
        assert!(!crypto.hmac_verify(b"key", b"data", &tag[..16]));
        assert!(!crypto.hmac_verify(b"other", b"data", &tag));
    }

    #[test]
    fn hash_sizes() {
        let crypto = CryptoProvider::new();
        assert_eq!(crypto.hash(b"x").len(), HASH_SIZE);
        assert_eq!(crypto.short_hash(b"x").len(), SHORT_HASH_SIZE);
        assert_eq!(crypto.hmac(b"k", b"x").len(), HMAC_SIZE);
    }
}
