//! Transaction allow list. When active, only senders with a role above None
//! may have transactions included; the check runs at admission and in the
//! processor, not inside the EVM.

use crate::common::{Addr, Gas};
use crate::error::{StateError, VmError};
use crate::params::{precompile_addr, precompile_key, Rules};
use crate::state::MutableState;

use super::allowlist::{self, AllowListConfig};
use super::{PrecompileEnv, PrecompileModule, PrecompileResult};

pub struct TxAllowList;

pub fn address() -> Addr {
    // key registered at a protocol-constant address
    precompile_addr(precompile_key::TX_ALLOW_LIST)
        .map(|(addr, _)| addr)
        .unwrap_or_else(|| Addr::zero().clone())
}

/// Whether `sender` may submit transactions under `rules`. Trivially true
/// while the precompile is inactive.
pub fn is_sender_allowed(
    rules: &Rules, state: &MutableState, sender: &Addr,
) -> Result<bool, StateError> {
    let addr = address();
    if !rules.is_active_precompile(&addr) {
        return Ok(true)
    }
    Ok(allowlist::get_role(state, &addr, sender)?.is_enabled())
}

impl PrecompileModule for TxAllowList {
    fn key(&self) -> &'static str {
        precompile_key::TX_ALLOW_LIST
    }

    fn configure(
        &self, params: &serde_json::Value, state: &mut MutableState,
        _block_number: u64,
    ) -> Result<(), VmError> {
        let config: AllowListConfig = serde_json::from_value(params.clone())
            .map_err(|e| {
                VmError::InvalidConfig(format!("txAllowList params: {}", e))
            })?;
        allowlist::configure_allow_list(&config, &address(), state)
    }

    fn run(
        &self, env: &mut PrecompileEnv, input: &[u8], gas: Gas,
    ) -> PrecompileResult {
        match allowlist::run_allow_list(env, &address(), input, gas) {
            Some(result) => result,
            None => super::revert(gas),
        }
    }
}
