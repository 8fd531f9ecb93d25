//! The `CryptoProvider` capability and its default implementation.
//!
//! The engine never calls a cryptographic library directly: signing,
//! verification, sealing, symmetric encryption, hashing and randomness all go
//! through [`CryptoProvider`], injected as `Arc<dyn CryptoProvider>`.
//! [`DefaultCrypto`] wraps Ed25519, X25519, ChaCha20-Poly1305 and Blake3.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::{CoreError, Result};
use crate::ids::{tagged_string, AgentId, SessionId};

tagged_string!(secret
    /// Ed25519 signing seed.
    SignerSecret, "signerSecret_z");
tagged_string!(
    /// Ed25519 public key.
    SignerId, "signer_z");
tagged_string!(
    /// Ed25519 signature.
    Signature, "signature_z");
tagged_string!(secret
    /// X25519 static secret.
    SealerSecret, "sealerSecret_z");
tagged_string!(
    /// X25519 public key.
    SealerId, "sealer_z");
tagged_string!(
    /// Ciphertext addressed from one sealer to another.
    Sealed, "sealed_U");
tagged_string!(secret
    /// Symmetric read key of a group.
    KeySecret, "keySecret_z");
tagged_string!(
    /// Public identifier of a read key.
    KeyId, "key_z");
tagged_string!(
    /// Ciphertext under a read key.
    Encrypted, "encrypted_U");
tagged_string!(
    /// Blake3 digest.
    Hash, "hash_z");

const SEAL_CONTEXT: &str = "covalue 2024 seal v1";
const NONCE_CONTEXT: &str = "covalue 2024 nonce v1";

/// Capability interface for every cryptographic operation the engine uses.
pub trait CryptoProvider: Send + Sync {
    /// Generate a fresh signing secret.
    fn new_signer_secret(&self) -> SignerSecret;

    /// Derive the public signing key.
    fn signer_id(&self, secret: &SignerSecret) -> Result<SignerId>;

    /// Sign a message.
    fn sign(&self, secret: &SignerSecret, message: &[u8]) -> Result<Signature>;

    /// Verify a signature. Malformed keys or signatures verify as `false`.
    fn verify(&self, signer: &SignerId, message: &[u8], signature: &Signature) -> bool;

    /// Generate a fresh sealing secret.
    fn new_sealer_secret(&self) -> SealerSecret;

    /// Derive the public sealing key.
    fn sealer_id(&self, secret: &SealerSecret) -> Result<SealerId>;

    /// Encrypt `message` so that only `to` can read it, authenticated as `from`.
    fn seal(
        &self,
        message: &[u8],
        from: &SealerSecret,
        to: &SealerId,
        nonce_material: &[u8],
    ) -> Result<Sealed>;

    /// Reverse of [`CryptoProvider::seal`].
    fn unseal(
        &self,
        sealed: &Sealed,
        to: &SealerSecret,
        from: &SealerId,
        nonce_material: &[u8],
    ) -> Result<Vec<u8>>;

    /// Generate a fresh symmetric key.
    fn new_key_secret(&self) -> (KeyId, KeySecret);

    /// The public identifier of a symmetric key.
    fn key_id(&self, secret: &KeySecret) -> Result<KeyId>;

    /// Encrypt under a symmetric key.
    fn encrypt(&self, plaintext: &[u8], key: &KeySecret, nonce_material: &[u8])
        -> Result<Encrypted>;

    /// Decrypt under a symmetric key.
    fn decrypt(&self, ciphertext: &Encrypted, key: &KeySecret, nonce_material: &[u8])
        -> Result<Vec<u8>>;

    /// Hash arbitrary bytes.
    fn hash(&self, data: &[u8]) -> Hash;

    /// Hash arbitrary bytes, returning the raw digest.
    fn hash_bytes(&self, data: &[u8]) -> [u8; 32];

    /// A fresh incremental hasher for a session's transaction chain.
    fn session_hasher(&self) -> SessionHasher {
        SessionHasher::new()
    }

    /// Fill a buffer of `len` random bytes.
    fn random_bytes(&self, len: usize) -> Vec<u8>;

    /// A fresh normal session ID for `owner`.
    fn new_random_session_id(&self, owner: &str) -> SessionId {
        SessionId::new_session(owner, &hex::encode(self.random_bytes(8)))
    }

    /// A fresh delete session ID for `owner`.
    fn new_delete_session_id(&self, owner: &str) -> SessionId {
        SessionId::new_delete_session(owner, &hex::encode(self.random_bytes(8)))
    }
}

/// Incremental Blake3 hasher over a session's transactions.
///
/// After every transaction the digest covers all transactions seen so far,
/// which is what a signature at that index signs.
#[derive(Clone, Debug, Default)]
pub struct SessionHasher {
    inner: blake3::Hasher,
}

impl SessionHasher {
    pub fn new() -> Self {
        Self {
            inner: blake3::Hasher::new(),
        }
    }

    /// Feed the canonical bytes of the next transaction.
    pub fn update(&mut self, bytes: &[u8]) {
        self.inner.update(bytes);
    }

    /// Digest of everything fed so far.
    pub fn digest(&self) -> Hash {
        Hash::from_payload(self.inner.finalize().to_hex().as_str())
    }
}

/// Secrets of one agent: a signing key and a sealing key.
#[derive(Clone, Debug)]
pub struct AgentSecret {
    pub signer: SignerSecret,
    pub sealer: SealerSecret,
}

impl AgentSecret {
    /// Generate a new agent.
    pub fn generate(crypto: &dyn CryptoProvider) -> Self {
        Self {
            signer: crypto.new_signer_secret(),
            sealer: crypto.new_sealer_secret(),
        }
    }

    /// The public agent ID.
    pub fn id(&self, crypto: &dyn CryptoProvider) -> Result<AgentId> {
        let sealer = crypto.sealer_id(&self.sealer)?;
        let signer = crypto.signer_id(&self.signer)?;
        Ok(AgentId::from_parts(&sealer, &signer))
    }
}

/// Default provider: Ed25519 signatures, X25519 sealing, ChaCha20-Poly1305
/// encryption and Blake3 hashing, all hex encoded behind their prefixes.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultCrypto;

impl DefaultCrypto {
    pub fn new() -> Self {
        Self
    }
}

fn decode_fixed<const N: usize>(payload: &str) -> Result<[u8; N]> {
    let bytes = hex::decode(payload).map_err(|e| CoreError::Crypto(e.to_string()))?;
    bytes
        .try_into()
        .map_err(|_| CoreError::Crypto(format!("expected {} bytes", N)))
}

fn random_array() -> [u8; 32] {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

fn nonce_for(nonce_material: &[u8]) -> [u8; 12] {
    let mut hasher = blake3::Hasher::new_derive_key(NONCE_CONTEXT);
    hasher.update(nonce_material);
    let digest = hasher.finalize();
    let mut nonce = [0u8; 12];
    nonce.copy_from_slice(&digest.as_bytes()[..12]);
    nonce
}

fn aead_encrypt(key: &[u8; 32], nonce_material: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher =
        ChaCha20Poly1305::new_from_slice(key).map_err(|e| CoreError::Crypto(e.to_string()))?;
    let nonce = nonce_for(nonce_material);
    cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|e| CoreError::Crypto(e.to_string()))
}

fn aead_decrypt(key: &[u8; 32], nonce_material: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
    let cipher =
        ChaCha20Poly1305::new_from_slice(key).map_err(|e| CoreError::Crypto(e.to_string()))?;
    let nonce = nonce_for(nonce_material);
    cipher
        .decrypt(Nonce::from_slice(&nonce), ciphertext)
        .map_err(|_| CoreError::DecryptionFailed)
}

fn key_id_of(secret: &[u8; 32]) -> KeyId {
    let digest = blake3::hash(secret).to_hex();
    KeyId::from_payload(&digest.as_str()[..16])
}

fn shared_key(secret: &SealerSecret, public: &SealerId) -> Result<[u8; 32]> {
    let secret = StaticSecret::from(decode_fixed::<32>(secret.payload())?);
    let public = PublicKey::from(decode_fixed::<32>(public.payload())?);
    let shared = secret.diffie_hellman(&public);
    Ok(blake3::derive_key(SEAL_CONTEXT, shared.as_bytes()))
}

impl CryptoProvider for DefaultCrypto {
    fn new_signer_secret(&self) -> SignerSecret {
        SignerSecret::from_payload(&hex::encode(random_array()))
    }

    fn signer_id(&self, secret: &SignerSecret) -> Result<SignerId> {
        let signing_key = SigningKey::from_bytes(&decode_fixed::<32>(secret.payload())?);
        Ok(SignerId::from_payload(&hex::encode(
            signing_key.verifying_key().to_bytes(),
        )))
    }

    fn sign(&self, secret: &SignerSecret, message: &[u8]) -> Result<Signature> {
        let signing_key = SigningKey::from_bytes(&decode_fixed::<32>(secret.payload())?);
        let sig = signing_key.sign(message);
        Ok(Signature::from_payload(&hex::encode(sig.to_bytes())))
    }

    fn verify(&self, signer: &SignerId, message: &[u8], signature: &Signature) -> bool {
        let Ok(key_bytes) = decode_fixed::<32>(signer.payload()) else {
            return false;
        };
        let Ok(sig_bytes) = decode_fixed::<64>(signature.payload()) else {
            return false;
        };
        let Ok(verifying_key) = VerifyingKey::from_bytes(&key_bytes) else {
            return false;
        };
        let sig = ed25519_dalek::Signature::from_bytes(&sig_bytes);
        verifying_key.verify(message, &sig).is_ok()
    }

    fn new_sealer_secret(&self) -> SealerSecret {
        SealerSecret::from_payload(&hex::encode(random_array()))
    }

    fn sealer_id(&self, secret: &SealerSecret) -> Result<SealerId> {
        let secret = StaticSecret::from(decode_fixed::<32>(secret.payload())?);
        Ok(SealerId::from_payload(&hex::encode(
            PublicKey::from(&secret).as_bytes(),
        )))
    }

    fn seal(
        &self,
        message: &[u8],
        from: &SealerSecret,
        to: &SealerId,
        nonce_material: &[u8],
    ) -> Result<Sealed> {
        let key = shared_key(from, to)?;
        let ciphertext = aead_encrypt(&key, nonce_material, message)?;
        Ok(Sealed::from_payload(&hex::encode(ciphertext)))
    }

    fn unseal(
        &self,
        sealed: &Sealed,
        to: &SealerSecret,
        from: &SealerId,
        nonce_material: &[u8],
    ) -> Result<Vec<u8>> {
        let key = shared_key(to, from)?;
        let ciphertext = hex::decode(sealed.payload()).map_err(|e| CoreError::Crypto(e.to_string()))?;
        aead_decrypt(&key, nonce_material, &ciphertext)
    }

    fn new_key_secret(&self) -> (KeyId, KeySecret) {
        let bytes = random_array();
        (key_id_of(&bytes), KeySecret::from_payload(&hex::encode(bytes)))
    }

    fn key_id(&self, secret: &KeySecret) -> Result<KeyId> {
        Ok(key_id_of(&decode_fixed::<32>(secret.payload())?))
    }

    fn encrypt(
        &self,
        plaintext: &[u8],
        key: &KeySecret,
        nonce_material: &[u8],
    ) -> Result<Encrypted> {
        let key = decode_fixed::<32>(key.payload())?;
        let ciphertext = aead_encrypt(&key, nonce_material, plaintext)?;
        Ok(Encrypted::from_payload(&hex::encode(ciphertext)))
    }

    fn decrypt(
        &self,
        ciphertext: &Encrypted,
        key: &KeySecret,
        nonce_material: &[u8],
    ) -> Result<Vec<u8>> {
        let key = decode_fixed::<32>(key.payload())?;
        let ciphertext =
            hex::decode(ciphertext.payload()).map_err(|e| CoreError::Crypto(e.to_string()))?;
        aead_decrypt(&key, nonce_material, &ciphertext)
    }

    fn hash(&self, data: &[u8]) -> Hash {
        Hash::from_payload(blake3::hash(data).to_hex().as_str())
    }

    fn hash_bytes(&self, data: &[u8]) -> [u8; 32] {
        *blake3::hash(data).as_bytes()
    }

    fn random_bytes(&self, len: usize) -> Vec<u8> {
        let mut bytes = vec![0u8; len];
        rand::thread_rng().fill_bytes(&mut bytes);
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify() {
        let crypto = DefaultCrypto;
        let secret = crypto.new_signer_secret();
        let signer = crypto.signer_id(&secret).unwrap();
        let signature = crypto.sign(&secret, b"hello world").unwrap();

        assert!(crypto.verify(&signer, b"hello world", &signature));
        assert!(!crypto.verify(&signer, b"hello worlD", &signature));
    }

    #[test]
    fn test_verify_with_other_signer_fails() {
        let crypto = DefaultCrypto;
        let a = crypto.new_signer_secret();
        let b = crypto.signer_id(&crypto.new_signer_secret()).unwrap();
        let signature = crypto.sign(&a, b"msg").unwrap();
        assert!(!crypto.verify(&b, b"msg", &signature));
    }

    #[test]
    fn test_seal_unseal() {
        let crypto = DefaultCrypto;
        let alice = crypto.new_sealer_secret();
        let bob = crypto.new_sealer_secret();
        let alice_id = crypto.sealer_id(&alice).unwrap();
        let bob_id = crypto.sealer_id(&bob).unwrap();

        let sealed = crypto.seal(b"read key", &alice, &bob_id, b"co_zx").unwrap();
        let opened = crypto.unseal(&sealed, &bob, &alice_id, b"co_zx").unwrap();
        assert_eq!(opened, b"read key");

        // Different nonce material must not decrypt
        assert!(crypto.unseal(&sealed, &bob, &alice_id, b"co_zy").is_err());
    }

    #[test]
    fn test_encrypt_decrypt() {
        let crypto = DefaultCrypto;
        let (_, key) = crypto.new_key_secret();
        let (_, other) = crypto.new_key_secret();

        let encrypted = crypto.encrypt(b"[1,2,3]", &key, b"nonce").unwrap();
        assert_eq!(crypto.decrypt(&encrypted, &key, b"nonce").unwrap(), b"[1,2,3]");
        assert!(matches!(
            crypto.decrypt(&encrypted, &other, b"nonce"),
            Err(CoreError::DecryptionFailed)
        ));
    }

    #[test]
    fn test_key_id_is_stable() {
        let crypto = DefaultCrypto;
        let (id, secret) = crypto.new_key_secret();
        assert_eq!(crypto.key_id(&secret).unwrap(), id);
    }

    #[test]
    fn test_session_hasher_is_incremental() {
        let crypto = DefaultCrypto;
        let mut hasher = crypto.session_hasher();
        hasher.update(b"tx0");
        let first = hasher.digest();
        hasher.update(b"tx1");
        let second = hasher.digest();
        assert_ne!(first, second);

        let mut again = SessionHasher::new();
        again.update(b"tx0tx1");
        assert_eq!(again.digest(), second);
    }

    #[test]
    fn test_agent_id_contains_both_keys() {
        let crypto = DefaultCrypto;
        let agent = AgentSecret::generate(&crypto);
        let id = agent.id(&crypto).unwrap();
        assert_eq!(id.signer_id(), crypto.signer_id(&agent.signer).unwrap());
        assert_eq!(id.sealer_id(), crypto.sealer_id(&agent.sealer).unwrap());
    }

    #[test]
    fn test_secret_debug_is_redacted() {
        let crypto = DefaultCrypto;
        let secret = crypto.new_signer_secret();
        assert_eq!(format!("{:?}", secret), "SignerSecret(<redacted>)");
    }

    #[test]
    fn test_session_ids_from_provider() {
        let crypto = DefaultCrypto;
        let session = crypto.new_random_session_id("sealer_za/signer_zb");
        assert!(!session.is_delete_session());
        let delete = crypto.new_delete_session_id("sealer_za/signer_zb");
        assert!(delete.is_delete_session());
        assert!(delete.as_str().ends_with('$'));
    }
}
