//! Post-quantum KEM (ML-KEM-768) used during path builds so that the
//! per-hop keys stay confidential against a classical break at record time.

use ml_kem::kem::{Decapsulate, Encapsulate};
use ml_kem::{Ciphertext, Encoded, EncodedSizeUser, KemCore, MlKem768};
use rand_core::OsRng;

use crate::provider::{CryptoError, CryptoProvider, SharedKey, SHARED_KEY_SIZE};

pub const PQ_PUBLIC_KEY_SIZE: usize = 1184;
pub const PQ_SECRET_KEY_SIZE: usize = 2400;
pub const PQ_CIPHERTEXT_SIZE: usize = 1088;

type DecapKey = <MlKem768 as KemCore>::DecapsulationKey;
type EncapKey = <MlKem768 as KemCore>::EncapsulationKey;

/// Encapsulation key in its wire encoding.
#[derive(Clone)]
pub struct PqPublicKey(pub [u8; PQ_PUBLIC_KEY_SIZE]);

impl PqPublicKey {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; PQ_PUBLIC_KEY_SIZE] =
            bytes.try_into().map_err(|_| CryptoError::Malformed)?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; PQ_PUBLIC_KEY_SIZE] {
        &self.0
    }
}

#[derive(Clone)]
pub struct PqCiphertext(pub [u8; PQ_CIPHERTEXT_SIZE]);

impl PqCiphertext {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; PQ_CIPHERTEXT_SIZE] =
            bytes.try_into().map_err(|_| CryptoError::Malformed)?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; PQ_CIPHERTEXT_SIZE] {
        &self.0
    }
}

pub struct PqKeypair {
    decap: DecapKey,
    public: PqPublicKey,
}

impl PqKeypair {
    pub fn public(&self) -> &PqPublicKey {
        &self.public
    }

    /// Wire encoding of the decapsulation key, for the persisted key file.
    pub fn secret_bytes(&self) -> [u8; PQ_SECRET_KEY_SIZE] {
        let encoded = self.decap.as_bytes();
        let mut out = [0u8; PQ_SECRET_KEY_SIZE];
        out.copy_from_slice(&encoded);
        out
    }

    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let encoded = Encoded::<DecapKey>::try_from(bytes).map_err(|_| CryptoError::Malformed)?;
        let decap = DecapKey::from_bytes(&encoded);
        let encap: EncapKey = decap.encapsulation_key().clone();
        let mut public = [0u8; PQ_PUBLIC_KEY_SIZE];
        public.copy_from_slice(&encap.as_bytes());
        Ok(Self {
            decap,
            public: PqPublicKey(public),
        })
    }
}

impl CryptoProvider {
    pub fn pq_keygen(&self) -> PqKeypair {
        let (decap, encap) = MlKem768::generate(&mut OsRng);
        let mut public = [0u8; PQ_PUBLIC_KEY_SIZE];
        public.copy_from_slice(&encap.as_bytes());
        PqKeypair {
            decap,
            public: PqPublicKey(public),
        }
    }

    pub fn pq_encaps(
        &self,
        public: &PqPublicKey,
    ) -> Result<(PqCiphertext, SharedKey), CryptoError> {
        let encoded = Encoded::<EncapKey>::try_from(&public.0[..])
            .map_err(|_| CryptoError::Malformed)?;
        let encap = EncapKey::from_bytes(&encoded);
        let (ct, shared) = encap
            .encapsulate(&mut OsRng)
            .map_err(|_| CryptoError::Kem)?;
        let mut ct_bytes = [0u8; PQ_CIPHERTEXT_SIZE];
        ct_bytes.copy_from_slice(&ct);
        let mut key = [0u8; SHARED_KEY_SIZE];
        key.copy_from_slice(&shared);
        Ok((PqCiphertext(ct_bytes), SharedKey::new(key)))
    }

    pub fn pq_decaps(
        &self,
        keypair: &PqKeypair,
        ciphertext: &PqCiphertext,
    ) -> Result<SharedKey, CryptoError> {
        let ct = Ciphertext::<MlKem768>::try_from(&ciphertext.0[..])
            .map_err(|_| CryptoError::Malformed)?;
        let shared = keypair.decap.decapsulate(&ct).map_err(|_| CryptoError::Kem)?;
        let mut key = [0u8; SHARED_KEY_SIZE];
        key.copy_from_slice(&shared);
        Ok(SharedKey::new(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encaps_decaps_agree() {
        let crypto = CryptoProvider::new();
        let keypair = crypto.pq_keygen();
        let (ct, k_sender) = crypto.pq_encaps(keypair.public()).expect("encaps");
        let k_receiver = crypto.pq_decaps(&keypair, &ct).expect("decaps");
        assert_eq!(k_sender.as_bytes(), k_receiver.as_bytes());
    }

    #[test]
    fn secret_round_trips_through_encoding() {
        let crypto = CryptoProvider::new();
        let keypair = crypto.pq_keygen();
        let restored = PqKeypair::from_secret_bytes(&keypair.secret_bytes()).expect("restore");
        assert_eq!(restored.public().as_bytes(), keypair.public().as_bytes());

        let (ct, k_sender) = crypto.pq_encaps(restored.public()).expect("encaps");
        let k_receiver = crypto.pq_decaps(&restored, &ct).expect("decaps");
        assert_eq!(k_sender.as_bytes(), k_receiver.as_bytes());
    }

    #[test]
    fn wrong_public_key_length_rejected() {
        assert!(PqPublicKey::from_slice(&[0u8; 16]).is_err());
        assert!(PqCiphertext::from_slice(&[0u8; 16]).is_err());
    }
}
