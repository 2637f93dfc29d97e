//! Validator sets for warp signature verification. The host supplies raw
//! validator data through [`ValidatorState`]; verification operates on the
//! canonical ordering so that signer bitsets mean the same thing on every
//! node.

use std::collections::BTreeMap;

use crate::bls::{PublicKey, PUBLIC_KEY_LEN};
use crate::common::Hash;
use crate::error::WarpError;

pub const NODE_ID_LEN: usize = 20;

pub type NodeId = [u8; NODE_ID_LEN];

/// A validator as reported by the host. Validators that never registered a
/// BLS key have `public_key: None`; they cannot sign but their weight still
/// counts toward the total.
#[derive(Clone, Debug)]
pub struct Validator {
    pub public_key: Option<PublicKey>,
    pub weight: u64,
    pub node_id: NodeId,
}

/// One entry of the canonical set: validators sharing a BLS key are merged.
#[derive(Clone, Debug)]
pub struct CanonicalValidator {
    pub public_key: PublicKey,
    pub weight: u64,
    pub node_ids: Vec<NodeId>,
}

/// Validators with registered keys, sorted ascending by compressed public
/// key bytes. `total_weight` covers keyless validators too.
#[derive(Clone, Debug, Default)]
pub struct CanonicalValidatorSet {
    pub validators: Vec<CanonicalValidator>,
    pub total_weight: u64,
}

/// Host-side view of the validator registry at a given P-chain height.
pub trait ValidatorState: Send + Sync {
    /// The subnet a chain belongs to. The primary network is the all-zero
    /// subnet id.
    fn subnet_id(&self, chain_id: &Hash) -> Result<Hash, WarpError>;

    fn validator_set(
        &self, p_chain_height: u64, subnet_id: &Hash,
    ) -> Result<Vec<Validator>, WarpError>;
}

pub fn primary_network_id() -> &'static Hash {
    Hash::zero()
}

/// Which subnet's validators must have signed a message from
/// `source_chain_id`. Messages from subnet chains are verified against the
/// source subnet. Messages from primary-network chains are verified against
/// the local subnet, unless the chain was configured to require primary
/// network signers.
pub fn signing_subnet(
    state: &dyn ValidatorState, source_chain_id: &Hash, local_subnet: &Hash,
    require_primary_network_signers: bool,
) -> Result<Hash, WarpError> {
    let source_subnet = state.subnet_id(source_chain_id)?;
    if &source_subnet != primary_network_id() {
        return Ok(source_subnet)
    }
    if require_primary_network_signers {
        Ok(primary_network_id().clone())
    } else {
        Ok(local_subnet.clone())
    }
}

/// Sort by compressed key bytes and merge duplicate keys, summing weights.
/// Fails on weight overflow or a zero total.
pub fn canonical_validator_set(
    validators: &[Validator],
) -> Result<CanonicalValidatorSet, WarpError> {
    let mut total_weight: u64 = 0;
    let mut by_key: BTreeMap<[u8; PUBLIC_KEY_LEN], CanonicalValidator> =
        BTreeMap::new();
    for v in validators {
        total_weight = total_weight.checked_add(v.weight).ok_or_else(|| {
            WarpError::ValidatorSet("validator weight overflow".into())
        })?;
        let pk = match &v.public_key {
            Some(pk) => pk,
            None => continue,
        };
        by_key
            .entry(pk.to_bytes())
            .and_modify(|entry| {
                entry.weight += v.weight;
                entry.node_ids.push(v.node_id);
            })
            .or_insert_with(|| CanonicalValidator {
                public_key: pk.clone(),
                weight: v.weight,
                node_ids: vec![v.node_id],
            });
    }
    if total_weight == 0 {
        return Err(WarpError::ValidatorSet(
            "validator set has zero total weight".into(),
        ))
    }
    Ok(CanonicalValidatorSet {
        validators: by_key.into_values().collect(),
        total_weight,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bls::SecretKey;

    fn validator(seed: u8, weight: u64) -> Validator {
        Validator {
            public_key: Some(
                SecretKey::key_gen(&[seed; 32]).unwrap().public_key(),
            ),
            weight,
            node_id: [seed; NODE_ID_LEN],
        }
    }

    #[test]
    fn canonical_set_sorts_and_dedupes() {
        let mut a = validator(1, 10);
        let b = validator(2, 20);
        let mut a_again = validator(1, 5);
        a.node_id = [0xaa; NODE_ID_LEN];
        a_again.node_id = [0xbb; NODE_ID_LEN];
        let keyless = Validator {
            public_key: None,
            weight: 7,
            node_id: [0xcc; NODE_ID_LEN],
        };
        let set =
            canonical_validator_set(&[b, a, a_again, keyless]).unwrap();
        assert_eq!(set.total_weight, 42);
        assert_eq!(set.validators.len(), 2);
        // ascending by compressed key bytes
        assert!(
            set.validators[0].public_key.to_bytes()
                < set.validators[1].public_key.to_bytes()
        );
        let merged = set
            .validators
            .iter()
            .find(|v| v.node_ids.len() == 2)
            .unwrap();
        assert_eq!(merged.weight, 15);
    }

    #[test]
    fn zero_weight_set_is_refused() {
        assert!(matches!(
            canonical_validator_set(&[]),
            Err(WarpError::ValidatorSet(_))
        ));
    }

    struct FixedState {
        subnet_of: Hash,
    }

    impl ValidatorState for FixedState {
        fn subnet_id(&self, _chain_id: &Hash) -> Result<Hash, WarpError> {
            Ok(self.subnet_of.clone())
        }

        fn validator_set(
            &self, _p_chain_height: u64, _subnet_id: &Hash,
        ) -> Result<Vec<Validator>, WarpError> {
            Ok(vec![])
        }
    }

    #[test]
    fn signing_subnet_resolution() {
        let local = Hash::hash(b"local subnet");
        let other = Hash::hash(b"other subnet");
        let chain = Hash::hash(b"some chain");

        // subnet chain: always the source subnet
        let state = FixedState {
            subnet_of: other.clone(),
        };
        assert_eq!(
            signing_subnet(&state, &chain, &local, false).unwrap(),
            other
        );
        assert_eq!(
            signing_subnet(&state, &chain, &local, true).unwrap(),
            other
        );

        // primary-network chain: local subnet unless primary signers are
        // required
        let state = FixedState {
            subnet_of: primary_network_id().clone(),
        };
        assert_eq!(
            signing_subnet(&state, &chain, &local, false).unwrap(),
            local
        );
        assert_eq!(
            &signing_subnet(&state, &chain, &local, true).unwrap(),
            primary_network_id()
        );
    }
}
