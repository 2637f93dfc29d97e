//! Warp precompile: the EVM-facing surface of the warp subsystem. Inbound
//! messages arrive as transaction predicates and are verified once per block
//! by [verify_predicate]; inside the EVM, contracts read the verdicts and
//! emit outbound messages.

use once_cell::sync::Lazy;
use serde::Deserialize;

use crate::common::{Addr, Bytes, Gas, Hash, Log};
use crate::error::{VmError, WarpError};
use crate::params::{precompile_addr, precompile_key, Rules};
use crate::state::MutableState;
use crate::warp::message::{AddressedCall, Message, UnsignedMessage};
use crate::warp::validators::{
    canonical_validator_set, signing_subnet, ValidatorState,
};
use crate::warp::{verify_message, WarpConfig};

use super::{
    addr_word, deduct_gas, revert, selector, word_u64, write_protection,
    PrecompileEnv, PrecompileModule, PrecompileResult,
};

pub const GET_BLOCKCHAIN_ID_GAS: Gas = 2;
pub const GET_VERIFIED_WARP_MESSAGE_GAS: Gas = 2;
pub const SEND_WARP_MESSAGE_GAS: Gas = 20_000;
pub const SEND_WARP_MESSAGE_GAS_PER_BYTE: Gas = 8;

static GET_BLOCKCHAIN_ID: Lazy<[u8; 4]> =
    Lazy::new(|| selector("getBlockchainID()"));
static SEND_WARP_MESSAGE: Lazy<[u8; 4]> =
    Lazy::new(|| selector("sendWarpMessage(bytes)"));
static GET_VERIFIED_WARP_MESSAGE: Lazy<[u8; 4]> =
    Lazy::new(|| selector("getVerifiedWarpMessage(uint32)"));
static SEND_EVENT: Lazy<Hash> = Lazy::new(|| {
    Hash::hash(b"SendWarpMessage(address,bytes32,bytes)")
});

pub struct WarpPrecompile;

pub fn address() -> Addr {
    precompile_addr(precompile_key::WARP)
        .map(|(addr, _)| addr)
        .unwrap_or_else(|| Addr::zero().clone())
}

/// The warp activation params under `rules`, or an error when the precompile
/// is not active.
pub fn config_from_rules(rules: &Rules) -> Result<WarpConfig, WarpError> {
    let active = rules.precompiles.get(&address()).ok_or_else(|| {
        WarpError::InvalidWarpMsg("warp precompile is not active".into())
    })?;
    WarpConfig::deserialize(&active.params).map_err(|e| {
        WarpError::InvalidWarpMsg(format!("warp config: {}", e))
    })
}

/// Everything block-level predicate verification needs from the host.
pub struct PredicateContext<'a> {
    pub network_id: u32,
    pub local_subnet_id: Hash,
    pub p_chain_height: u64,
    pub validator_state: &'a dyn ValidatorState,
}

/// Verify one warp predicate, already unpacked from the access list: parse
/// the signed message, check the network id, resolve the signing subnet, and
/// verify the aggregate signature against the canonical validator set at the
/// inherited P-chain height.
pub fn verify_predicate(
    rules: &Rules, ctx: &PredicateContext, predicate: &[u8],
) -> Result<(), WarpError> {
    let config = config_from_rules(rules)?;
    let msg = Message::parse(predicate)?;
    if msg.unsigned.network_id != ctx.network_id {
        return Err(WarpError::InvalidWarpMsg(format!(
            "message network id {} does not match local {}",
            msg.unsigned.network_id, ctx.network_id
        )))
    }
    let subnet_id = signing_subnet(
        ctx.validator_state,
        &msg.unsigned.source_chain_id,
        &ctx.local_subnet_id,
        config.require_primary_network_signers,
    )?;
    let validators = ctx
        .validator_state
        .validator_set(ctx.p_chain_height, &subnet_id)?;
    let vset = canonical_validator_set(&validators)?;
    verify_message(&msg, config.effective_quorum(), &vset)
}

/// Outbound messages recorded by [WarpPrecompile::run] in a block's logs.
/// The accept path feeds these to the signing backend.
pub fn extract_outbound(logs: &[Log]) -> Vec<UnsignedMessage> {
    let host = address();
    logs.iter()
        .filter(|log| {
            log.address == host
                && log.topics.first() == Some(&*SEND_EVENT)
        })
        .filter_map(|log| UnsignedMessage::parse(&log.data).ok())
        .collect()
}

impl PrecompileModule for WarpPrecompile {
    fn key(&self) -> &'static str {
        precompile_key::WARP
    }

    fn configure(
        &self, params: &serde_json::Value, _state: &mut MutableState,
        _block_number: u64,
    ) -> Result<(), VmError> {
        // no storage to seed; the config only needs to be well-formed
        let config: WarpConfig = serde_json::from_value(params.clone())
            .map_err(|e| {
                VmError::InvalidConfig(format!("warp params: {}", e))
            })?;
        config.verify().map_err(VmError::InvalidConfig)
    }

    fn run(
        &self, env: &mut PrecompileEnv, input: &[u8], gas: Gas,
    ) -> PrecompileResult {
        if input.len() < 4 {
            return revert(gas)
        }
        let (sel, args) = input.split_at(4);

        if sel == &*GET_BLOCKCHAIN_ID {
            let gas_left = match deduct_gas(gas, GET_BLOCKCHAIN_ID_GAS) {
                Ok(g) => g,
                Err(res) => return res,
            };
            let ret = env.blockchain_id.as_bytes().to_vec();
            return (Bytes::from(ret), gas_left, None)
        }

        if sel == &*GET_VERIFIED_WARP_MESSAGE {
            let gas_left =
                match deduct_gas(gas, GET_VERIFIED_WARP_MESSAGE_GAS) {
                    Ok(g) => g,
                    Err(res) => return res,
                };
            let index = match word_u64(args) {
                Some(index) => index as usize,
                None => return revert(gas_left),
            };
            let ctx = match &env.predicates {
                Some(ctx) => ctx,
                None => return revert(gas_left),
            };
            let predicate = match ctx.predicates.get(index) {
                Some(predicate) => predicate,
                None => return revert(gas_left),
            };
            let verified =
                ctx.verified.get(index).map(|b| *b).unwrap_or(false);
            if !verified {
                return (Bytes::from(vec![0u8]), gas_left, None)
            }
            let unsigned = match Message::parse(predicate) {
                Ok(msg) => msg.unsigned,
                // a verified bit always corresponds to a parseable message
                Err(_) => return revert(gas_left),
            };
            let mut ret = vec![1u8];
            ret.extend_from_slice(&unsigned.bytes());
            return (Bytes::from(ret), gas_left, None)
        }

        if sel != &*SEND_WARP_MESSAGE {
            return revert(gas)
        }
        let payload = args;
        let required = SEND_WARP_MESSAGE_GAS.saturating_add(
            SEND_WARP_MESSAGE_GAS_PER_BYTE
                .saturating_mul(payload.len() as u64),
        );
        let gas_left = match deduct_gas(gas, required) {
            Ok(g) => g,
            Err(res) => return res,
        };
        if env.read_only {
            return write_protection()
        }
        let caller = env.caller.clone();
        let addressed = AddressedCall {
            source_address: caller.clone(),
            payload: Bytes::from(payload),
        };
        let unsigned = UnsignedMessage::new(
            env.rules.network_id,
            env.blockchain_id.clone(),
            Bytes::from(addressed.bytes()),
        );
        let id = unsigned.id();
        env.state.add_log(Log {
            address: address(),
            topics: vec![
                SEND_EVENT.clone(),
                Hash::from_slice(&addr_word(&caller)),
                id.clone(),
            ],
            data: Bytes::from(unsigned.bytes()),
        });
        (Bytes::from(id.as_bytes().to_vec()), gas_left, None)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bitvec::prelude::{BitVec, Lsb0};

    use super::*;
    use crate::kv::MemKv;
    use crate::params::{ChainConfig, PrecompileUpgrade, Threshold};
    use crate::precompile::TxPredicates;
    use crate::state::StateStore;

    fn warp_rules() -> Rules {
        let config = ChainConfig {
            chain_id: 43214,
            network_id: 1,
            fork_schedule: Default::default(),
            fee_config: Default::default(),
            precompile_upgrades: vec![PrecompileUpgrade {
                key: precompile_key::WARP.into(),
                activation: Threshold::Timestamp(0),
                disable: false,
                params: serde_json::json!({}),
            }],
            alloc: Default::default(),
            genesis_timestamp: 0,
        };
        config.rules_at(1, 10)
    }

    #[test]
    fn warp_address_is_a_predicater() {
        let rules = warp_rules();
        assert!(rules.is_active_precompile(&address()));
        assert!(rules.has_predicate(&address()));
        assert_eq!(
            config_from_rules(&rules).unwrap().effective_quorum(),
            crate::warp::DEFAULT_QUORUM_NUMERATOR
        );
    }

    #[test]
    fn send_records_a_log_and_extraction_finds_it() {
        let rules = warp_rules();
        let store = StateStore::new(Arc::new(MemKv::new()));
        let mut state =
            store.mutable_state_at(Hash::empty_root_hash()).unwrap();
        let caller = Addr::from([9u8; 20]);
        let mut env = PrecompileEnv {
            rules: &rules,
            blockchain_id: Hash::hash(b"local chain"),
            block_number: 1,
            caller: caller.clone(),
            read_only: false,
            state: &mut state,
            predicates: None,
        };
        let mut input = SEND_WARP_MESSAGE.to_vec();
        input.extend_from_slice(b"hello other chain");
        let (ret, _, err) = WarpPrecompile.run(&mut env, &input, 1_000_000);
        assert!(err.is_none());
        assert_eq!(ret.len(), 32);

        let logs = state.take_logs();
        let outbound = extract_outbound(&logs);
        assert_eq!(outbound.len(), 1);
        assert_eq!(outbound[0].network_id, 1);
        let call = AddressedCall::parse(&outbound[0].payload).unwrap();
        assert_eq!(call.source_address, caller);
        assert_eq!(&*call.payload, b"hello other chain".as_slice());
        assert_eq!(outbound[0].id().as_bytes(), &*ret);
    }

    #[test]
    fn send_is_write_protected() {
        let rules = warp_rules();
        let store = StateStore::new(Arc::new(MemKv::new()));
        let mut state =
            store.mutable_state_at(Hash::empty_root_hash()).unwrap();
        let mut env = PrecompileEnv {
            rules: &rules,
            blockchain_id: Hash::hash(b"local chain"),
            block_number: 1,
            caller: Addr::from([9u8; 20]),
            read_only: true,
            state: &mut state,
            predicates: None,
        };
        let input = SEND_WARP_MESSAGE.to_vec();
        let (_, gas_left, err) =
            WarpPrecompile.run(&mut env, &input, 1_000_000);
        assert_eq!(gas_left, 0);
        assert_eq!(err, Some(crate::error::ExecError::WriteProtection));
    }

    #[test]
    fn verified_message_readback() {
        let rules = warp_rules();
        let store = StateStore::new(Arc::new(MemKv::new()));
        let mut state =
            store.mutable_state_at(Hash::empty_root_hash()).unwrap();
        let unsigned =
            UnsignedMessage::new(1, Hash::hash(b"src"), Bytes::from(vec![7]));
        let msg = Message::new(
            unsigned.clone(),
            BitVec::<u8, Lsb0>::repeat(true, 1),
            [0u8; 96],
        );
        let predicates = vec![Bytes::from(msg.bytes())];
        let mut verified: BitVec<u8, Lsb0> = BitVec::repeat(false, 2);
        verified.set(0, true);
        let mut env = PrecompileEnv {
            rules: &rules,
            blockchain_id: Hash::hash(b"local chain"),
            block_number: 1,
            caller: Addr::from([9u8; 20]),
            read_only: false,
            state: &mut state,
            predicates: Some(TxPredicates {
                predicates,
                verified,
            }),
        };
        let mut input = GET_VERIFIED_WARP_MESSAGE.to_vec();
        input.extend_from_slice(&super::super::u64_word(0));
        let (ret, _, err) = WarpPrecompile.run(&mut env, &input, 1_000);
        assert!(err.is_none());
        assert_eq!(ret[0], 1);
        assert_eq!(
            UnsignedMessage::parse(&ret[1..]).unwrap(),
            unsigned
        );
        // an unverified index reads back as invalid
        let mut input = GET_VERIFIED_WARP_MESSAGE.to_vec();
        input.extend_from_slice(&super::super::u64_word(1));
        let (ret, gas_left, err) =
            WarpPrecompile.run(&mut env, &input, 1_000);
        // index 1 has no predicate at all, so it reverts
        assert!(ret.is_empty());
        assert!(gas_left > 0);
        assert_eq!(err, Some(crate::error::ExecError::Reverted));
    }
}
