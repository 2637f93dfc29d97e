//! Contract-deployer allow list. When active, only addresses with a role
//! above None may deploy contracts; the interpreter consults
//! [is_deployer_allowed] on every CREATE and create-transaction.

use crate::common::{Addr, Gas};
use crate::error::{StateError, VmError};
use crate::params::{precompile_addr, precompile_key, Rules};
use crate::state::MutableState;

use super::allowlist::{self, AllowListConfig};
use super::{PrecompileEnv, PrecompileModule, PrecompileResult};

pub struct DeployerAllowList;

pub fn address() -> Addr {
    precompile_addr(precompile_key::DEPLOYER_ALLOW_LIST)
        .map(|(addr, _)| addr)
        .unwrap_or_else(|| Addr::zero().clone())
}

pub fn is_deployer_allowed(
    rules: &Rules, state: &MutableState, deployer: &Addr,
) -> Result<bool, StateError> {
    let addr = address();
    if !rules.is_active_precompile(&addr) {
        return Ok(true)
    }
    Ok(allowlist::get_role(state, &addr, deployer)?.is_enabled())
}

impl PrecompileModule for DeployerAllowList {
    fn key(&self) -> &'static str {
        precompile_key::DEPLOYER_ALLOW_LIST
    }

    fn configure(
        &self, params: &serde_json::Value, state: &mut MutableState,
        _block_number: u64,
    ) -> Result<(), VmError> {
        let config: AllowListConfig = serde_json::from_value(params.clone())
            .map_err(|e| {
                VmError::InvalidConfig(format!(
                    "deployerAllowList params: {}",
                    e
                ))
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
