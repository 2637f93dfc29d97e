//! Stateful precompiles. Modules register in a process-wide table keyed by
//! their config key; activation is driven entirely by explicit `configure`
//! calls at fork transitions, never by registration itself. Dispatch happens
//! through [run] from the interpreter's precompile hook.

pub mod allowlist;
pub mod deployerallowlist;
pub mod feemanager;
pub mod nativeminter;
pub mod txallowlist;
pub mod warp;

use std::collections::BTreeMap;
use std::sync::Arc;

use bitvec::prelude::{BitVec, Lsb0};
use once_cell::sync::Lazy;

use crate::common::{Addr, Bytes, Gas, Hash};
use crate::error::{ExecError, VmError};
use crate::params::{ChainConfig, Rules};
use crate::state::MutableState;

/// Result of a precompile call: return data, remaining gas, optional error.
pub type PrecompileResult = (Bytes, Gas, Option<ExecError>);

/// Per-call environment handed to a module's `run`.
pub struct PrecompileEnv<'a> {
    pub rules: &'a Rules,
    /// Host-assigned 32-byte id of the local chain.
    pub blockchain_id: Hash,
    pub block_number: u64,
    pub caller: Addr,
    pub read_only: bool,
    pub state: &'a mut MutableState,
    /// Predicate context of the executing transaction, present only while a
    /// transaction is being executed inside a block.
    pub predicates: Option<TxPredicates>,
}

/// The predicate payloads a transaction attached to the callee's address,
/// already unpacked from the access list, and the block-level verification
/// verdict for each.
#[derive(Clone, Default)]
pub struct TxPredicates {
    pub predicates: Vec<Bytes>,
    pub verified: BitVec<u8, Lsb0>,
}

pub trait PrecompileModule: Send + Sync {
    fn key(&self) -> &'static str;

    /// Seed module storage at an activation transition. Must be idempotent:
    /// the processor calls it exactly once per transition, but a re-org can
    /// replay the same transition on a fresh snapshot.
    fn configure(
        &self, params: &serde_json::Value, state: &mut MutableState,
        block_number: u64,
    ) -> Result<(), VmError>;

    fn run(
        &self, env: &mut PrecompileEnv, input: &[u8], gas: Gas,
    ) -> PrecompileResult;
}

static MODULES: Lazy<BTreeMap<&'static str, Arc<dyn PrecompileModule>>> =
    Lazy::new(|| {
        let modules: Vec<Arc<dyn PrecompileModule>> = vec![
            Arc::new(deployerallowlist::DeployerAllowList),
            Arc::new(nativeminter::NativeMinter),
            Arc::new(txallowlist::TxAllowList),
            Arc::new(feemanager::FeeManager),
            Arc::new(warp::WarpPrecompile),
        ];
        modules.into_iter().map(|m| (m.key(), m)).collect()
    });

pub fn module(key: &str) -> Option<Arc<dyn PrecompileModule>> {
    MODULES.get(key).cloned()
}

/// The precompiles enabled under `rules`, by address.
pub fn active_at(
    rules: &Rules,
) -> Vec<(Addr, Arc<dyn PrecompileModule>)> {
    rules
        .precompiles
        .iter()
        .filter_map(|(addr, active)| {
            module(&active.key).map(|m| (addr.clone(), m))
        })
        .collect()
}

/// Run `configure` for every upgrade step whose activation falls strictly
/// between the parent's position and this block's. Called once per block
/// before transaction execution.
pub fn configure_transitions(
    config: &ChainConfig, parent: Option<(u64, u64)>, number: u64,
    timestamp: u64, state: &mut MutableState,
) -> Result<(), VmError> {
    for upgrade in &config.precompile_upgrades {
        if !upgrade.activation.active_at(number, timestamp) {
            continue
        }
        if let Some((pn, pt)) = parent {
            if upgrade.activation.active_at(pn, pt) {
                continue
            }
        }
        if upgrade.disable {
            continue
        }
        let m = module(&upgrade.key).ok_or_else(|| {
            VmError::InvalidConfig(format!(
                "unknown precompile key {}",
                upgrade.key
            ))
        })?;
        log::info!(
            "activating precompile {} at block {}",
            upgrade.key,
            number
        );
        m.configure(&upgrade.params, state, number)?;
    }
    Ok(())
}

/// Dispatch a call to the precompile at `addr`. The caller (the interpreter
/// hook) has already established that `addr` is in the reserved range; a
/// reserved address with no active module reverts.
pub fn run(
    env: &mut PrecompileEnv, addr: &Addr, input: &[u8], gas: Gas,
) -> PrecompileResult {
    let active = match env.rules.precompiles.get(addr) {
        Some(active) => active,
        None => return (Bytes::empty(), gas, Some(ExecError::Reverted)),
    };
    match module(&active.key) {
        Some(m) => m.run(env, input, gas),
        None => (Bytes::empty(), gas, Some(ExecError::Reverted)),
    }
}

/// First four bytes of `keccak256(signature)`, the standard call selector.
pub fn selector(signature: &str) -> [u8; 4] {
    let digest = Hash::hash(signature.as_bytes());
    let mut out = [0u8; 4];
    out.copy_from_slice(&digest.as_bytes()[..4]);
    out
}

/// Charge `required` out of `gas`; an out-of-gas result consumes everything.
pub fn deduct_gas(gas: Gas, required: Gas) -> Result<Gas, PrecompileResult> {
    if gas < required {
        return Err((Bytes::empty(), 0, Some(ExecError::OutOfGas)))
    }
    Ok(gas - required)
}

pub fn revert(gas_left: Gas) -> PrecompileResult {
    (Bytes::empty(), gas_left, Some(ExecError::Reverted))
}

pub fn write_protection() -> PrecompileResult {
    (Bytes::empty(), 0, Some(ExecError::WriteProtection))
}

// 32-byte call-data word helpers.

pub fn addr_word(addr: &Addr) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[12..].copy_from_slice(addr.as_bytes());
    word
}

pub fn word_addr(word: &[u8]) -> Option<Addr> {
    if word.len() != 32 || word[..12].iter().any(|b| *b != 0) {
        return None
    }
    Some(Addr::from_slice(&word[12..]))
}

pub fn u64_word(value: u64) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[24..].copy_from_slice(&value.to_be_bytes());
    word
}

pub fn word_u64(word: &[u8]) -> Option<u64> {
    if word.len() != 32 || word[..24].iter().any(|b| *b != 0) {
        return None
    }
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&word[24..]);
    Some(u64::from_be_bytes(raw))
}
