//! BLS12-381 aggregate signatures in the min-pk scheme: 48-byte compressed
//! public keys on G1, 96-byte signatures on G2. Used exclusively by the warp
//! subsystem.

use blst::min_pk;
use blst::BLST_ERROR;

use crate::error::WarpError;

pub const PUBLIC_KEY_LEN: usize = 48;
pub const SIGNATURE_LEN: usize = 96;
pub const CIPHERSUITE: &[u8] = b"BLS_SIG_BLS12381G2_XMD:SHA-256_SSWU_RO_NUL_";

#[derive(Clone)]
pub struct PublicKey(min_pk::PublicKey);

impl PublicKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WarpError> {
        if bytes.len() != PUBLIC_KEY_LEN {
            return Err(WarpError::InvalidWarpMsg(format!(
                "public key must be {} bytes, got {}",
                PUBLIC_KEY_LEN,
                bytes.len()
            )))
        }
        min_pk::PublicKey::key_validate(bytes)
            .map(Self)
            .map_err(|_| {
                WarpError::InvalidWarpMsg("invalid BLS public key".into())
            })
    }

    pub fn to_bytes(&self) -> [u8; PUBLIC_KEY_LEN] {
        self.0.compress()
    }
}

impl PartialEq for PublicKey {
    fn eq(&self, other: &Self) -> bool {
        self.to_bytes() == other.to_bytes()
    }
}

impl Eq for PublicKey {}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey(0x{})", hex::encode(self.to_bytes()))
    }
}

#[derive(Clone)]
pub struct Signature(min_pk::Signature);

impl Signature {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WarpError> {
        if bytes.len() != SIGNATURE_LEN {
            return Err(WarpError::InvalidWarpMsg(format!(
                "signature must be {} bytes, got {}",
                SIGNATURE_LEN,
                bytes.len()
            )))
        }
        min_pk::Signature::sig_validate(bytes, false)
            .map(Self)
            .map_err(|_| WarpError::InvalidSignature)
    }

    pub fn to_bytes(&self) -> [u8; SIGNATURE_LEN] {
        self.0.compress()
    }

    /// Verify against a (possibly aggregate) public key.
    pub fn verify(&self, public_key: &PublicKey, msg: &[u8]) -> bool {
        self.0
            .verify(true, msg, CIPHERSUITE, &[], &public_key.0, false)
            == BLST_ERROR::BLST_SUCCESS
    }
}

impl std::fmt::Debug for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Signature(0x{})", hex::encode(self.to_bytes()))
    }
}

/// Local signing key. Production nodes receive theirs from the host; tests
/// generate throwaway keys.
#[derive(Clone)]
pub struct SecretKey(min_pk::SecretKey);

impl SecretKey {
    pub fn key_gen(ikm: &[u8]) -> Result<Self, WarpError> {
        min_pk::SecretKey::key_gen(ikm, &[]).map(Self).map_err(|_| {
            WarpError::ValidatorSet("BLS key generation failed".into())
        })
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.0.sk_to_pk())
    }

    pub fn sign(&self, msg: &[u8]) -> Signature {
        Signature(self.0.sign(msg, CIPHERSUITE, &[]))
    }
}

/// Aggregate public keys for aggregate-signature verification. Fails on an
/// empty set.
pub fn aggregate_public_keys(
    keys: &[&PublicKey],
) -> Result<PublicKey, WarpError> {
    if keys.is_empty() {
        return Err(WarpError::InvalidWarpMsg(
            "cannot aggregate an empty key set".into(),
        ))
    }
    let raw: Vec<&min_pk::PublicKey> = keys.iter().map(|k| &k.0).collect();
    min_pk::AggregatePublicKey::aggregate(&raw, false)
        .map(|agg| PublicKey(agg.to_public_key()))
        .map_err(|_| WarpError::InvalidSignature)
}

/// Aggregate signatures from multiple signers over the same message.
pub fn aggregate_signatures(
    sigs: &[&Signature],
) -> Result<Signature, WarpError> {
    if sigs.is_empty() {
        return Err(WarpError::InvalidSignature)
    }
    let raw: Vec<&min_pk::Signature> = sigs.iter().map(|s| &s.0).collect();
    min_pk::AggregateSignature::aggregate(&raw, false)
        .map(|agg| Signature(agg.to_signature()))
        .map_err(|_| WarpError::InvalidSignature)
}
