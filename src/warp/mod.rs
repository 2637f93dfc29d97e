//! Cross-chain warp messaging: wire codec, validator-set verification and
//! the signing backend. The warp precompile
//! ([precompile::warp](crate::precompile::warp)) drives verification during
//! block processing; the backend serves signature requests from peers.

pub mod backend;
pub mod message;
pub mod validators;

use serde::{Deserialize, Serialize};

use crate::bls::{aggregate_public_keys, Signature};
use crate::common::Gas;
use crate::error::WarpError;
use message::Message;
use validators::CanonicalValidatorSet;

pub const DEFAULT_QUORUM_NUMERATOR: u64 = 67;
pub const QUORUM_NUMERATOR_MINIMUM: u64 = 33;
pub const QUORUM_DENOMINATOR: u64 = 100;

pub const GAS_PER_SIGNATURE_VERIFICATION: Gas = 200_000;
pub const GAS_PER_WARP_SIGNER: Gas = 500;
pub const GAS_PER_WARP_MESSAGE_BYTE: Gas = 100;

/// Parameters of the warp precompile activation. `quorum_numerator: 0`
/// selects the default.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WarpConfig {
    #[serde(default)]
    pub quorum_numerator: u64,
    #[serde(default)]
    pub require_primary_network_signers: bool,
}

impl WarpConfig {
    pub fn verify(&self) -> Result<(), String> {
        if self.quorum_numerator == 0 {
            return Ok(())
        }
        if self.quorum_numerator < QUORUM_NUMERATOR_MINIMUM {
            return Err(format!(
                "quorum numerator {} below minimum {}",
                self.quorum_numerator, QUORUM_NUMERATOR_MINIMUM
            ))
        }
        if self.quorum_numerator > QUORUM_DENOMINATOR {
            return Err(format!(
                "quorum numerator {} above denominator {}",
                self.quorum_numerator, QUORUM_DENOMINATOR
            ))
        }
        Ok(())
    }

    pub fn effective_quorum(&self) -> u64 {
        if self.quorum_numerator == 0 {
            DEFAULT_QUORUM_NUMERATOR
        } else {
            self.quorum_numerator
        }
    }
}

/// Gas charged for verifying one signed message inside a predicate: a flat
/// signature-verification cost plus per-byte and per-signer components.
pub fn predicate_gas(
    msg_len: usize, num_signers: usize,
) -> Result<Gas, WarpError> {
    let bytes_cost = GAS_PER_WARP_MESSAGE_BYTE
        .checked_mul(msg_len as u64)
        .ok_or(WarpError::GasOverflow)?;
    let signers_cost = GAS_PER_WARP_SIGNER
        .checked_mul(num_signers as u64)
        .ok_or(WarpError::GasOverflow)?;
    GAS_PER_SIGNATURE_VERIFICATION
        .checked_add(bytes_cost)
        .and_then(|g| g.checked_add(signers_cost))
        .ok_or(WarpError::GasOverflow)
}

/// Verify a signed message against the canonical validator set: the signer
/// bitset selects validators by canonical index, their combined weight must
/// reach `quorum_numerator / QUORUM_DENOMINATOR` of the total, and the
/// aggregate signature must verify over the unsigned bytes under the
/// aggregate of the selected keys.
pub fn verify_message(
    msg: &Message, quorum_numerator: u64, vset: &CanonicalValidatorSet,
) -> Result<(), WarpError> {
    let mut signer_keys = Vec::with_capacity(msg.num_signers());
    let mut signed_weight: u64 = 0;
    for idx in msg.signers.iter_ones() {
        let v = vset.validators.get(idx).ok_or_else(|| {
            WarpError::InvalidWarpMsg(format!(
                "signer index {} out of range ({} validators)",
                idx,
                vset.validators.len()
            ))
        })?;
        signer_keys.push(&v.public_key);
        signed_weight =
            signed_weight.checked_add(v.weight).ok_or_else(|| {
                WarpError::ValidatorSet("validator weight overflow".into())
            })?;
    }
    let lhs = signed_weight as u128 * QUORUM_DENOMINATOR as u128;
    let rhs = vset.total_weight as u128 * quorum_numerator as u128;
    if lhs < rhs {
        return Err(WarpError::InsufficientWeight {
            signed: signed_weight,
            total: vset.total_weight,
            numerator: quorum_numerator,
            denominator: QUORUM_DENOMINATOR,
        })
    }
    let aggregate = aggregate_public_keys(&signer_keys)?;
    let signature = Signature::from_bytes(&msg.signature)?;
    if !signature.verify(&aggregate, &msg.unsigned.bytes()) {
        return Err(WarpError::InvalidSignature)
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use bitvec::prelude::{BitVec, Lsb0};

    use super::*;
    use crate::bls::{aggregate_signatures, SecretKey};
    use crate::common::{Bytes, Hash};
    use message::UnsignedMessage;
    use validators::{canonical_validator_set, Validator, NODE_ID_LEN};

    fn signed_by(
        keys: &[SecretKey], signer_indices: &[usize],
        vset: &CanonicalValidatorSet, unsigned: &UnsignedMessage,
    ) -> Message {
        // map secret keys onto canonical positions
        let mut signers: BitVec<u8, Lsb0> =
            BitVec::repeat(false, vset.validators.len());
        let mut sigs = Vec::new();
        for &i in signer_indices {
            let pk = keys[i].public_key();
            let pos = vset
                .validators
                .iter()
                .position(|v| v.public_key == pk)
                .unwrap();
            signers.set(pos, true);
            sigs.push(keys[i].sign(&unsigned.bytes()));
        }
        let agg =
            aggregate_signatures(&sigs.iter().collect::<Vec<_>>()).unwrap();
        Message::new(unsigned.clone(), signers, agg.to_bytes())
    }

    fn setup(n: usize) -> (Vec<SecretKey>, CanonicalValidatorSet) {
        let keys: Vec<SecretKey> = (0..n)
            .map(|i| SecretKey::key_gen(&[i as u8 + 1; 32]).unwrap())
            .collect();
        let validators: Vec<Validator> = keys
            .iter()
            .enumerate()
            .map(|(i, k)| Validator {
                public_key: Some(k.public_key()),
                weight: 20,
                node_id: [i as u8; NODE_ID_LEN],
            })
            .collect();
        let vset = canonical_validator_set(&validators).unwrap();
        (keys, vset)
    }

    #[test]
    fn quorum_boundary() {
        let (keys, vset) = setup(100);
        let unsigned = UnsignedMessage::new(
            1,
            Hash::hash(b"src"),
            Bytes::from(vec![1, 2, 3]),
        );
        // 67 of 100 equal-weight validators meets the default quorum
        let enough: Vec<usize> = (0..67).collect();
        let msg = signed_by(&keys, &enough, &vset, &unsigned);
        verify_message(&msg, DEFAULT_QUORUM_NUMERATOR, &vset).unwrap();
        // 66 does not
        let short: Vec<usize> = (0..66).collect();
        let msg = signed_by(&keys, &short, &vset, &unsigned);
        assert!(matches!(
            verify_message(&msg, DEFAULT_QUORUM_NUMERATOR, &vset),
            Err(WarpError::InsufficientWeight {
                signed: 1320,
                total: 2000,
                ..
            })
        ));
    }

    #[test]
    fn forged_signature_is_rejected() {
        let (keys, vset) = setup(4);
        let unsigned =
            UnsignedMessage::new(1, Hash::hash(b"src"), Bytes::empty());
        let mut msg = signed_by(&keys, &[0, 1, 2], &vset, &unsigned);
        // claim a fourth signer without their signature share
        let pos = vset
            .validators
            .iter()
            .position(|v| v.public_key == keys[3].public_key())
            .unwrap();
        msg.signers.set(pos, true);
        assert!(matches!(
            verify_message(&msg, DEFAULT_QUORUM_NUMERATOR, &vset),
            Err(WarpError::InvalidSignature)
        ));
    }

    #[test]
    fn out_of_range_signer_bit() {
        let (keys, vset) = setup(2);
        let unsigned =
            UnsignedMessage::new(1, Hash::hash(b"src"), Bytes::empty());
        let mut msg = signed_by(&keys, &[0, 1], &vset, &unsigned);
        let mut signers: BitVec<u8, Lsb0> = BitVec::repeat(false, 8);
        signers.set(5, true);
        msg.signers = signers;
        assert!(matches!(
            verify_message(&msg, DEFAULT_QUORUM_NUMERATOR, &vset),
            Err(WarpError::InvalidWarpMsg(_))
        ));
    }

    #[test]
    fn config_quorum_bounds() {
        assert!(WarpConfig::default().verify().is_ok());
        assert_eq!(
            WarpConfig::default().effective_quorum(),
            DEFAULT_QUORUM_NUMERATOR
        );
        let low = WarpConfig {
            quorum_numerator: 32,
            ..Default::default()
        };
        assert!(low.verify().is_err());
        let high = WarpConfig {
            quorum_numerator: 101,
            ..Default::default()
        };
        assert!(high.verify().is_err());
        let ok = WarpConfig {
            quorum_numerator: 80,
            ..Default::default()
        };
        assert!(ok.verify().is_ok());
        assert_eq!(ok.effective_quorum(), 80);
    }

    #[test]
    fn predicate_gas_components() {
        assert_eq!(
            predicate_gas(10, 3).unwrap(),
            GAS_PER_SIGNATURE_VERIFICATION
                + 10 * GAS_PER_WARP_MESSAGE_BYTE
                + 3 * GAS_PER_WARP_SIGNER
        );
        assert!(matches!(
            predicate_gas(usize::MAX, 1),
            Err(WarpError::GasOverflow)
        ));
    }
}
