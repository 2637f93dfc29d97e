//! Fee-manager precompile. Allow-listed callers can replace the chain's fee
//! parameters at runtime; the processor and builder read the stored config
//! in preference to the genesis one from the first block after a change.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::common::{Addr, Bytes, Gas, Hash, Log};
use crate::error::{StateError, VmError};
use crate::params::{precompile_addr, precompile_key, FeeConfig, Rules};
use crate::state::MutableState;

use super::allowlist::{self, AllowListConfig};
use super::{
    addr_word, deduct_gas, revert, selector, u64_word, word_u64,
    write_protection, PrecompileEnv, PrecompileModule, PrecompileResult,
};

pub const WRITE_GAS_PER_SLOT: Gas = 20_000;
pub const READ_GAS_PER_SLOT: Gas = 5_000;

const NUM_FEE_FIELDS: usize = 8;
// eight fields plus the last-changed-at marker
pub const SET_FEE_CONFIG_GAS: Gas =
    WRITE_GAS_PER_SLOT * (NUM_FEE_FIELDS as Gas + 1);
pub const GET_FEE_CONFIG_GAS: Gas =
    READ_GAS_PER_SLOT * NUM_FEE_FIELDS as Gas;
pub const GET_LAST_CHANGED_AT_GAS: Gas = READ_GAS_PER_SLOT;

static SET_FEE_CONFIG: Lazy<[u8; 4]> = Lazy::new(|| {
    selector(
        "setFeeConfig(uint256,uint256,uint256,uint256,uint256,uint256,\
         uint256,uint256)",
    )
});
static GET_FEE_CONFIG: Lazy<[u8; 4]> =
    Lazy::new(|| selector("getFeeConfig()"));
static GET_LAST_CHANGED_AT: Lazy<[u8; 4]> =
    Lazy::new(|| selector("getFeeConfigLastChangedAt()"));
static CHANGED_EVENT: Lazy<Hash> =
    Lazy::new(|| Hash::hash(b"FeeConfigChanged(address)"));

pub struct FeeManager;

pub fn address() -> Addr {
    precompile_addr(precompile_key::FEE_MANAGER)
        .map(|(addr, _)| addr)
        .unwrap_or_else(|| Addr::zero().clone())
}

// field slots 0..8, marker slot 8
fn field_slot(index: usize) -> Hash {
    Hash::from_slice(&u64_word(index as u64))
}

fn last_changed_slot() -> Hash {
    field_slot(NUM_FEE_FIELDS)
}

fn fields(config: &FeeConfig) -> [u64; NUM_FEE_FIELDS] {
    [
        config.gas_limit,
        config.target_block_rate,
        config.min_base_fee,
        config.target_gas,
        config.base_fee_change_denominator,
        config.min_block_gas_cost,
        config.max_block_gas_cost,
        config.block_gas_cost_step,
    ]
}

fn from_fields(raw: [u64; NUM_FEE_FIELDS]) -> FeeConfig {
    FeeConfig {
        gas_limit: raw[0],
        target_block_rate: raw[1],
        min_base_fee: raw[2],
        target_gas: raw[3],
        base_fee_change_denominator: raw[4],
        min_block_gas_cost: raw[5],
        max_block_gas_cost: raw[6],
        block_gas_cost_step: raw[7],
    }
}

fn store_fee_config(
    state: &mut MutableState, config: &FeeConfig, block_number: u64,
) -> Result<(), StateError> {
    let host = address();
    for (i, value) in fields(config).iter().enumerate() {
        state.set_storage(
            &host,
            field_slot(i),
            Hash::from_slice(&u64_word(*value)),
        )?;
    }
    // block 0 is a valid change point, so the marker stores number + 1
    state.set_storage(
        &host,
        last_changed_slot(),
        Hash::from_slice(&u64_word(block_number + 1)),
    )
}

fn load_fee_config(
    state: &MutableState,
) -> Result<Option<FeeConfig>, StateError> {
    let host = address();
    let marker = state.storage(&host, &last_changed_slot())?;
    if &marker == Hash::zero() {
        return Ok(None)
    }
    let mut raw = [0u64; NUM_FEE_FIELDS];
    for (i, out) in raw.iter_mut().enumerate() {
        let word = state.storage(&host, &field_slot(i))?;
        *out = word_u64(word.as_bytes()).unwrap_or(0);
    }
    Ok(Some(from_fields(raw)))
}

pub fn last_changed_at(
    state: &MutableState,
) -> Result<Option<u64>, StateError> {
    let marker = state.storage(&address(), &last_changed_slot())?;
    Ok(word_u64(marker.as_bytes())
        .filter(|m| *m != 0)
        .map(|m| m - 1))
}

/// The fee config in force: the stored one when the fee manager is active
/// and has been configured, the static chain config otherwise.
pub fn effective_fee_config(
    rules: &Rules, state: &MutableState,
) -> Result<FeeConfig, StateError> {
    if rules.is_active_precompile(&address()) {
        if let Some(config) = load_fee_config(state)? {
            return Ok(config)
        }
    }
    Ok(rules.fee_config.clone())
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FeeManagerConfig {
    #[serde(flatten)]
    allow_list: AllowListConfig,
    #[serde(default)]
    initial_fee_config: Option<FeeConfig>,
}

impl PrecompileModule for FeeManager {
    fn key(&self) -> &'static str {
        precompile_key::FEE_MANAGER
    }

    fn configure(
        &self, params: &serde_json::Value, state: &mut MutableState,
        block_number: u64,
    ) -> Result<(), VmError> {
        let config: FeeManagerConfig =
            serde_json::from_value(params.clone()).map_err(|e| {
                VmError::InvalidConfig(format!("feeManager params: {}", e))
            })?;
        allowlist::configure_allow_list(
            &config.allow_list,
            &address(),
            state,
        )?;
        if let Some(initial) = &config.initial_fee_config {
            initial.verify()?;
            store_fee_config(state, initial, block_number)
                .map_err(|e| VmError::Corrupted(e.to_string()))?;
        }
        Ok(())
    }

    fn run(
        &self, env: &mut PrecompileEnv, input: &[u8], gas: Gas,
    ) -> PrecompileResult {
        let host = address();
        if let Some(result) = allowlist::run_allow_list(env, &host, input, gas)
        {
            return result
        }
        if input.len() < 4 {
            return revert(gas)
        }
        let (sel, args) = input.split_at(4);

        if sel == &*GET_FEE_CONFIG {
            let gas_left = match deduct_gas(gas, GET_FEE_CONFIG_GAS) {
                Ok(g) => g,
                Err(res) => return res,
            };
            let config = match load_fee_config(env.state) {
                Ok(Some(config)) => config,
                Ok(None) => env.rules.fee_config.clone(),
                Err(_) => return revert(gas_left),
            };
            let mut ret = Vec::with_capacity(NUM_FEE_FIELDS * 32);
            for value in fields(&config) {
                ret.extend_from_slice(&u64_word(value));
            }
            return (Bytes::from(ret), gas_left, None)
        }

        if sel == &*GET_LAST_CHANGED_AT {
            let gas_left = match deduct_gas(gas, GET_LAST_CHANGED_AT_GAS) {
                Ok(g) => g,
                Err(res) => return res,
            };
            let at = match last_changed_at(env.state) {
                Ok(at) => at.unwrap_or(0),
                Err(_) => return revert(gas_left),
            };
            return (Bytes::from(u64_word(at).to_vec()), gas_left, None)
        }

        if sel != &*SET_FEE_CONFIG || args.len() != NUM_FEE_FIELDS * 32 {
            return revert(gas)
        }
        let gas_left = match deduct_gas(gas, SET_FEE_CONFIG_GAS) {
            Ok(g) => g,
            Err(res) => return res,
        };
        if env.read_only {
            return write_protection()
        }
        let caller = env.caller.clone();
        let allowed = allowlist::get_role(env.state, &host, &caller)
            .map(|role| role.is_enabled())
            .unwrap_or(false);
        if !allowed {
            return revert(gas_left)
        }
        let mut raw = [0u64; NUM_FEE_FIELDS];
        for (i, out) in raw.iter_mut().enumerate() {
            *out = match word_u64(&args[i * 32..(i + 1) * 32]) {
                Some(value) => value,
                None => return revert(gas_left),
            };
        }
        let config = from_fields(raw);
        if config.verify().is_err() {
            return revert(gas_left)
        }
        if store_fee_config(env.state, &config, env.block_number).is_err() {
            return revert(gas_left)
        }
        env.state.add_log(Log {
            address: host,
            topics: vec![
                CHANGED_EVENT.clone(),
                Hash::from_slice(&addr_word(&caller)),
            ],
            data: Bytes::empty(),
        });
        (Bytes::empty(), gas_left, None)
    }
}
