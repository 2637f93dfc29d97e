//! Chain parameters: the fork schedule, the dynamic fee configuration, and
//! the genesis/upgrade config surface. Everything here is a pure function of
//! the parsed config; two nodes with identical config bytes derive
//! byte-identical [Rules] for every `(number, timestamp)` pair.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::common::{Addr, Bytes, Gas, Hash, Wei};
use crate::error::VmError;

pub const TX_GAS: Gas = 21000;
pub const TX_CREATE_GAS: Gas = 32000;
pub const TX_DATA_ZERO_GAS: Gas = 4;
pub const TX_DATA_NONZERO_GAS: Gas = 16;
pub const ACCESS_LIST_ADDR_GAS: Gas = 2400;
pub const ACCESS_LIST_KEY_GAS: Gas = 1900;

/// Network upgrades in activation order. `Launch` is the genesis rule set
/// and is always active.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Fork {
    Launch,
    Durango,
    Etna,
    Cancun,
}

/// Activation threshold for a fork or a precompile upgrade. Block-number
/// activation and timestamp activation are mutually exclusive per entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Threshold {
    Number(u64),
    Timestamp(u64),
}

impl Threshold {
    pub fn active_at(&self, number: u64, timestamp: u64) -> bool {
        match self {
            Threshold::Number(n) => number >= *n,
            Threshold::Timestamp(t) => timestamp >= *t,
        }
    }
}

/// Declarative fork activation table. Entries are keyed by fork; a fork that
/// never appears never activates. Validated once at genesis parse.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ForkSchedule {
    entries: BTreeMap<Fork, Threshold>,
}

impl ForkSchedule {
    pub fn new(entries: impl IntoIterator<Item = (Fork, Threshold)>) -> Self {
        Self {
            entries: entries.into_iter().collect(),
        }
    }

    /// Number-activated forks must precede timestamp-activated ones, and
    /// thresholds must be non-decreasing within each kind, so that a later
    /// fork can never activate before an earlier one.
    pub fn validate(&self) -> Result<(), VmError> {
        let mut last_number: Option<u64> = None;
        let mut last_timestamp: Option<u64> = None;
        for (fork, threshold) in &self.entries {
            match threshold {
                Threshold::Number(n) => {
                    if last_timestamp.is_some() {
                        return Err(VmError::InvalidConfig(format!(
                            "fork {:?}: number activation after a timestamp activation",
                            fork
                        )))
                    }
                    if last_number.map_or(false, |prev| *n < prev) {
                        return Err(VmError::InvalidConfig(format!(
                            "fork {:?}: activation number decreases",
                            fork
                        )))
                    }
                    last_number = Some(*n);
                }
                Threshold::Timestamp(t) => {
                    if last_timestamp.map_or(false, |prev| *t < prev) {
                        return Err(VmError::InvalidConfig(format!(
                            "fork {:?}: activation timestamp decreases",
                            fork
                        )))
                    }
                    last_timestamp = Some(*t);
                }
            }
        }
        Ok(())
    }

    /// Latest fork active at `(number, timestamp)`. Activation is monotonic:
    /// the scan stops at the first inactive entry.
    pub fn fork_at(&self, number: u64, timestamp: u64) -> Fork {
        let mut active = Fork::Launch;
        for (fork, threshold) in &self.entries {
            if !threshold.active_at(number, timestamp) {
                break
            }
            active = *fork;
        }
        active
    }
}

/// Per-chain dynamic fee parameters, governed in genesis and mutable at
/// runtime through the fee-manager precompile.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct FeeConfig {
    pub gas_limit: Gas,
    pub target_block_rate: u64,
    pub min_base_fee: u64,
    pub target_gas: Gas,
    pub base_fee_change_denominator: u64,
    pub min_block_gas_cost: u64,
    pub max_block_gas_cost: u64,
    pub block_gas_cost_step: u64,
}

impl Default for FeeConfig {
    fn default() -> Self {
        Self {
            gas_limit: 100_000_000,
            target_block_rate: 2,
            min_base_fee: 25_000_000_000,
            target_gas: 50_000_000,
            base_fee_change_denominator: 36,
            min_block_gas_cost: 0,
            max_block_gas_cost: 1_000_000,
            block_gas_cost_step: 50_000,
        }
    }
}

impl FeeConfig {
    pub fn verify(&self) -> Result<(), VmError> {
        if self.gas_limit == 0 {
            return Err(VmError::InvalidConfig("gasLimit cannot be 0".into()))
        }
        if self.target_block_rate == 0 {
            return Err(VmError::InvalidConfig(
                "targetBlockRate cannot be 0".into(),
            ))
        }
        if self.target_gas == 0 {
            return Err(VmError::InvalidConfig("targetGas cannot be 0".into()))
        }
        if self.base_fee_change_denominator == 0 {
            return Err(VmError::InvalidConfig(
                "baseFeeChangeDenominator cannot be 0".into(),
            ))
        }
        if self.min_block_gas_cost > self.max_block_gas_cost {
            return Err(VmError::InvalidConfig(format!(
                "minBlockGasCost {} exceeds maxBlockGasCost {}",
                self.min_block_gas_cost, self.max_block_gas_cost
            )))
        }
        Ok(())
    }
}

/// Base fee for the block after `parent`. Moves toward the target by
/// `parent_fee * |gas_used - target| / target / denominator`, floored at the
/// configured minimum. The genesis block itself uses `min_base_fee`.
pub fn next_base_fee(
    config: &FeeConfig, parent_base_fee: &Wei, parent_gas_used: Gas,
) -> Wei {
    use primitive_types::U256;
    let parent_fee: U256 = *parent_base_fee.as_ref();
    let target = U256::from(config.target_gas);
    let denominator = U256::from(config.base_fee_change_denominator);
    let min = U256::from(config.min_base_fee);
    let fee = if parent_gas_used > config.target_gas {
        let delta = U256::from(parent_gas_used - config.target_gas);
        parent_fee + parent_fee * delta / target / denominator
    } else {
        let delta = U256::from(config.target_gas - parent_gas_used);
        parent_fee - parent_fee * delta / target / denominator
    };
    if fee < min {
        min.into()
    } else {
        fee.into()
    }
}

/// Required block gas cost: `parent_cost ± step * |target_rate -
/// time_elapsed|`, clamped to `[min, max]`. Producing faster than the target
/// rate raises the surcharge, slower lowers it. Arithmetic saturates toward
/// the clamp on overflow. Genesis uses `min_block_gas_cost`.
pub fn block_gas_cost(
    config: &FeeConfig, parent_cost: u64, time_elapsed: u64,
) -> u64 {
    let deviation = config.target_block_rate.abs_diff(time_elapsed);
    let change = config.block_gas_cost_step.checked_mul(deviation);
    let cost = if time_elapsed > config.target_block_rate {
        change
            .and_then(|c| parent_cost.checked_sub(c))
            .unwrap_or(config.min_block_gas_cost)
    } else {
        change
            .and_then(|c| parent_cost.checked_add(c))
            .unwrap_or(config.max_block_gas_cost)
    };
    cost.clamp(config.min_block_gas_cost, config.max_block_gas_cost)
}

/// EIP-4844 blob gas accounting.
pub const GAS_PER_BLOB: u64 = 1 << 17;
pub const MAX_BLOBS_PER_BLOCK: u64 = 6;
pub const MAX_BLOB_GAS_PER_BLOCK: u64 = MAX_BLOBS_PER_BLOCK * GAS_PER_BLOB;
pub const TARGET_BLOB_GAS_PER_BLOCK: u64 = 3 * GAS_PER_BLOB;
pub const MIN_BLOB_GAS_PRICE: u64 = 1;
pub const BLOB_GAS_PRICE_UPDATE_FRACTION: u64 = 3_338_477;

/// Headers stamped further than this past local wall time are refused, and
/// the builder never stamps past it.
pub const MAX_FUTURE_BLOCK_TIME: u64 = 10;

/// Excess blob gas carried into the block after `parent`: whatever the
/// parent consumed above the per-block target accumulates.
pub fn next_excess_blob_gas(
    parent_excess: u64, parent_blob_gas_used: u64,
) -> u64 {
    (parent_excess + parent_blob_gas_used)
        .saturating_sub(TARGET_BLOB_GAS_PER_BLOCK)
}

/// Blob gas price at a given excess, the EIP-4844 `fake_exponential`:
/// `MIN_BLOB_GAS_PRICE * e^(excess / UPDATE_FRACTION)` via its Taylor
/// expansion in integer arithmetic.
pub fn blob_gas_price(excess_blob_gas: u64) -> Wei {
    use primitive_types::U256;
    let numerator = U256::from(excess_blob_gas);
    let denominator = U256::from(BLOB_GAS_PRICE_UPDATE_FRACTION);
    let mut i = U256::one();
    let mut accum = U256::from(MIN_BLOB_GAS_PRICE) * denominator;
    let mut output = U256::zero();
    while !accum.is_zero() {
        output += accum;
        accum = accum * numerator / (denominator * i);
        i += U256::one();
    }
    Wei::from(output / denominator)
}

/// Reserved address range and registry keys of the stateful precompiles.
/// Addresses are protocol constants shared by every chain.
pub mod precompile_key {
    pub const DEPLOYER_ALLOW_LIST: &str = "contractDeployerAllowListConfig";
    pub const NATIVE_MINTER: &str = "contractNativeMinterConfig";
    pub const TX_ALLOW_LIST: &str = "txAllowListConfig";
    pub const FEE_MANAGER: &str = "feeManagerConfig";
    pub const WARP: &str = "warpConfig";
}

fn reserved_addr(index: u8) -> Addr {
    let mut bytes = [0u8; 20];
    bytes[0] = 0x02;
    bytes[19] = index;
    Addr::from(bytes)
}

/// Whether `addr` falls in the reserved stateful-precompile range
/// `0x0200000000000000000000000000000000000000..=0x02000000000000000000000000000000000000ff`.
pub fn is_reserved_precompile_addr(addr: &Addr) -> bool {
    let bytes = addr.as_bytes();
    bytes[0] == 0x02 && bytes[1..19].iter().all(|b| *b == 0)
}

/// Address and predicate flag for a registry key; `None` for unknown keys.
pub fn precompile_addr(key: &str) -> Option<(Addr, bool)> {
    match key {
        precompile_key::DEPLOYER_ALLOW_LIST => Some((reserved_addr(0), false)),
        precompile_key::NATIVE_MINTER => Some((reserved_addr(1), false)),
        precompile_key::TX_ALLOW_LIST => Some((reserved_addr(2), false)),
        precompile_key::FEE_MANAGER => Some((reserved_addr(3), false)),
        precompile_key::WARP => Some((reserved_addr(5), true)),
        _ => None,
    }
}

/// One precompile activation (or deactivation) step. Steps for the same key
/// must be ordered by activation and alternate enable/disable.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrecompileUpgrade {
    pub key: String,
    pub activation: Threshold,
    #[serde(default)]
    pub disable: bool,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// Genesis allocation for a single account.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenesisAccount {
    pub balance: Wei,
    #[serde(default)]
    pub nonce: u64,
    #[serde(default)]
    pub code: Option<Bytes>,
    #[serde(default)]
    pub storage: BTreeMap<Hash, Hash>,
}

/// Additional precompile upgrades supplied next to the genesis at
/// `initialize`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeConfig {
    #[serde(default)]
    pub precompile_upgrades: Vec<PrecompileUpgrade>,
}

/// Parsed genesis configuration. `validate` must pass before the config is
/// used; `rules_at` is then total.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainConfig {
    pub chain_id: u64,
    pub network_id: u32,
    #[serde(default)]
    pub fork_schedule: ForkSchedule,
    #[serde(default)]
    pub fee_config: FeeConfig,
    #[serde(default)]
    pub precompile_upgrades: Vec<PrecompileUpgrade>,
    #[serde(default)]
    pub alloc: BTreeMap<Addr, GenesisAccount>,
    #[serde(default)]
    pub genesis_timestamp: u64,
}

impl ChainConfig {
    pub fn from_json(genesis: &[u8]) -> Result<Self, VmError> {
        let config: ChainConfig = serde_json::from_slice(genesis)
            .map_err(|e| VmError::InvalidEncoding(format!("genesis: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Splice the upgrade-file steps after the genesis steps and re-validate.
    pub fn apply_upgrades(&mut self, upgrades: UpgradeConfig) -> Result<(), VmError> {
        self.precompile_upgrades
            .extend(upgrades.precompile_upgrades);
        self.validate()
    }

    pub fn validate(&self) -> Result<(), VmError> {
        if self.chain_id == 0 {
            return Err(VmError::InvalidConfig("chainId cannot be 0".into()))
        }
        self.fork_schedule.validate()?;
        self.fee_config.verify()?;
        let mut last_per_key: BTreeMap<&str, (&Threshold, bool)> = BTreeMap::new();
        for upgrade in &self.precompile_upgrades {
            let key = upgrade.key.as_str();
            if precompile_addr(key).is_none() {
                return Err(VmError::InvalidConfig(format!(
                    "unknown precompile key {}",
                    key
                )))
            }
            if let Some((prev, prev_disable)) = last_per_key.get(key) {
                let ordered = match (prev, &upgrade.activation) {
                    (Threshold::Number(a), Threshold::Number(b)) => a <= b,
                    (Threshold::Timestamp(a), Threshold::Timestamp(b)) => a <= b,
                    (Threshold::Number(_), Threshold::Timestamp(_)) => true,
                    (Threshold::Timestamp(_), Threshold::Number(_)) => false,
                };
                if !ordered {
                    return Err(VmError::InvalidConfig(format!(
                        "precompile upgrades for {} out of order",
                        key
                    )))
                }
                if *prev_disable == upgrade.disable {
                    return Err(VmError::InvalidConfig(format!(
                        "precompile upgrades for {} must alternate enable/disable",
                        key
                    )))
                }
            } else if upgrade.disable {
                return Err(VmError::InvalidConfig(format!(
                    "first precompile upgrade for {} cannot be a disable",
                    key
                )))
            }
            last_per_key.insert(key, (&upgrade.activation, upgrade.disable));
        }
        Ok(())
    }

    /// Immutable rule set in force at `(number, timestamp)`.
    pub fn rules_at(&self, number: u64, timestamp: u64) -> Rules {
        let fork = self.fork_schedule.fork_at(number, timestamp);
        let mut precompiles: BTreeMap<Addr, ActivePrecompile> = BTreeMap::new();
        let mut predicaters: BTreeSet<Addr> = BTreeSet::new();
        for upgrade in &self.precompile_upgrades {
            if !upgrade.activation.active_at(number, timestamp) {
                continue
            }
            // validated: every key resolves
            let (addr, predicater) = match precompile_addr(&upgrade.key) {
                Some(v) => v,
                None => continue,
            };
            if upgrade.disable {
                precompiles.remove(&addr);
                predicaters.remove(&addr);
            } else {
                precompiles.insert(
                    addr.clone(),
                    ActivePrecompile {
                        key: upgrade.key.clone(),
                        activation: upgrade.activation,
                        params: upgrade.params.clone(),
                    },
                );
                if predicater {
                    predicaters.insert(addr);
                }
            }
        }
        Rules {
            chain_id: self.chain_id,
            network_id: self.network_id,
            fork,
            fee_config: self.fee_config.clone(),
            precompiles,
            predicaters,
            blob_txs: fork >= Fork::Cancun,
            beacon_root: fork >= Fork::Cancun,
        }
    }
}

/// Latest activation of a precompile, carried inside [Rules].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActivePrecompile {
    pub key: String,
    pub activation: Threshold,
    pub params: serde_json::Value,
}

/// The rule set in force for one block. Derived once per block and treated
/// as immutable from then on.
#[derive(Clone, Debug)]
pub struct Rules {
    pub chain_id: u64,
    pub network_id: u32,
    pub fork: Fork,
    pub fee_config: FeeConfig,
    pub precompiles: BTreeMap<Addr, ActivePrecompile>,
    pub predicaters: BTreeSet<Addr>,
    pub blob_txs: bool,
    pub beacon_root: bool,
}

impl Rules {
    pub fn is_active_precompile(&self, addr: &Addr) -> bool {
        self.precompiles.contains_key(addr)
    }

    pub fn has_predicate(&self, addr: &Addr) -> bool {
        self.predicaters.contains(addr)
    }

    pub fn is_active(&self, fork: Fork) -> bool {
        self.fork >= fork
    }
}
