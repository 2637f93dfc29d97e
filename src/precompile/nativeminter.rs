//! Native-coin minter. Allow-listed callers may credit freshly minted native
//! tokens to any account. Activation params may seed initial balances next
//! to the usual allow-list grants.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use primitive_types::U256;
use serde::{Deserialize, Serialize};

use crate::common::{Addr, Bytes, Gas, Hash, Log, Wei};
use crate::error::VmError;
use crate::params::{precompile_addr, precompile_key};
use crate::state::MutableState;

use super::allowlist::{self, AllowListConfig};
use super::{
    addr_word, deduct_gas, revert, selector, word_addr, write_protection,
    PrecompileEnv, PrecompileModule, PrecompileResult,
};

pub const MINT_GAS: Gas = 30_000;

static MINT: Lazy<[u8; 4]> =
    Lazy::new(|| selector("mintNativeCoin(address,uint256)"));
static MINTED_EVENT: Lazy<Hash> = Lazy::new(|| {
    Hash::hash(b"NativeCoinMinted(address,address,uint256)")
});

pub struct NativeMinter;

pub fn address() -> Addr {
    precompile_addr(precompile_key::NATIVE_MINTER)
        .map(|(addr, _)| addr)
        .unwrap_or_else(|| Addr::zero().clone())
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NativeMinterConfig {
    #[serde(flatten)]
    allow_list: AllowListConfig,
    #[serde(default)]
    initial_mint: BTreeMap<Addr, Wei>,
}

impl PrecompileModule for NativeMinter {
    fn key(&self) -> &'static str {
        precompile_key::NATIVE_MINTER
    }

    fn configure(
        &self, params: &serde_json::Value, state: &mut MutableState,
        _block_number: u64,
    ) -> Result<(), VmError> {
        let config: NativeMinterConfig =
            serde_json::from_value(params.clone()).map_err(|e| {
                VmError::InvalidConfig(format!("nativeMinter params: {}", e))
            })?;
        allowlist::configure_allow_list(
            &config.allow_list,
            &address(),
            state,
        )?;
        for (addr, amount) in &config.initial_mint {
            let balance = state
                .balance(addr)
                .map_err(|e| VmError::Corrupted(e.to_string()))?;
            let credited = balance.checked_add(amount).ok_or_else(|| {
                VmError::InvalidConfig("initialMint overflows balance".into())
            })?;
            state
                .set_balance(addr, credited)
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
        if input.len() != 4 + 64 || &input[..4] != &*MINT {
            return revert(gas)
        }
        let gas_left = match deduct_gas(gas, MINT_GAS) {
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
        let recipient = match word_addr(&input[4..36]) {
            Some(addr) => addr,
            None => return revert(gas_left),
        };
        let amount: Wei = U256::from_big_endian(&input[36..68]).into();
        let minted = match env.state.balance(&recipient) {
            Ok(balance) => match balance.checked_add(&amount) {
                Some(minted) => minted,
                None => return revert(gas_left),
            },
            Err(_) => return revert(gas_left),
        };
        if env.state.set_balance(&recipient, minted).is_err() {
            return revert(gas_left)
        }
        let mut amount_word = [0u8; 32];
        amount.to_big_endian(&mut amount_word);
        env.state.add_log(Log {
            address: host,
            topics: vec![
                MINTED_EVENT.clone(),
                Hash::from_slice(&addr_word(&caller)),
                Hash::from_slice(&addr_word(&recipient)),
            ],
            data: Bytes::from(amount_word.to_vec()),
        });
        (Bytes::empty(), gas_left, None)
    }
}
