//! Cryptographic primitives for the umbra overlay.
//!
//! Everything the rest of the workspace needs is reachable through
//! [`CryptoProvider`]: role-bound Diffie-Hellman, the XChaCha20 wire cipher,
//! hashing, Ed25519 signatures, randomness, and the post-quantum KEM used
//! during path builds. Randomness comes from the operating-system generator
//! (`OsRng`); there is no other process-wide state.

pub mod pq;
pub mod provider;

pub use pq::{PqCiphertext, PqKeypair, PqPublicKey, PQ_CIPHERTEXT_SIZE, PQ_PUBLIC_KEY_SIZE};
pub use provider::{
    CryptoError, CryptoProvider, SharedKey, HASH_SIZE, HMAC_SIZE, NONCE_SIZE, PUBLIC_KEY_SIZE,
    SHARED_KEY_SIZE, SHORT_HASH_SIZE, SIGNATURE_SIZE, TUNNEL_NONCE_SIZE,
};
