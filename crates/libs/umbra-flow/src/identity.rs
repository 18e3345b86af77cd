//! Keys of a local hidden-service endpoint.

use ed25519_dalek::SigningKey;
use umbra_core::ServiceAddress;
use umbra_crypto::CryptoProvider;
use x25519_dalek::{PublicKey, StaticSecret};

#[derive(Clone)]
pub struct ServiceIdentity {
    pub signing: SigningKey,
    pub enc_secret: StaticSecret,
}

impl ServiceIdentity {
    pub fn generate(crypto: &CryptoProvider) -> Self {
        Self {
            signing: crypto.signing_keygen(),
            enc_secret: crypto.encryption_keygen(),
        }
    }

    pub fn address(&self) -> ServiceAddress {
        ServiceAddress::new(self.signing.verifying_key().to_bytes())
    }

    pub fn enc_public(&self) -> [u8; 32] {
        PublicKey::from(&self.enc_secret).to_bytes()
    }
}
