//! The chain VM state machine the host consensus engine drives: initialize,
//! parse/verify/accept/reject blocks, build on the preferred tip, and answer
//! health checks. Acceptance and commits are serialized on a single writer
//! lock; verification only writes its own candidate state.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::block::{Block, CancunFields, Header};
use crate::builder::{BlockBuilder, Clock, SystemClock};
use crate::chain::{BlockStore, BlockTree};
use crate::common::{Addr, Hash, Wei, U256};
use crate::error::{AdmissionError, VmError};
use crate::evm::Interpreter;
use crate::kv::KvStore;
use crate::mempool::Mempool;
use crate::params::{
    next_base_fee, ChainConfig, UpgradeConfig, MAX_FUTURE_BLOCK_TIME,
};
use crate::precompile::{self, feemanager, warp as warp_pc};
use crate::processor::BlockExecutor;
use crate::state::StateStore;
use crate::tx::Tx;
use crate::warp::backend::WarpBackend;
use crate::warp::validators::ValidatorState;

/// Plugin protocol version reported to the host at handshake.
pub const PROTOCOL_VERSION: u32 = 31;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VmState {
    Initializing,
    Bootstrapping,
    StateSyncing,
    NormalOp,
    ShuttingDown,
}

fn valid_transition(from: VmState, to: VmState) -> bool {
    use VmState::*;
    matches!(
        (from, to),
        (Initializing, Bootstrapping)
            | (Initializing, StateSyncing)
            | (StateSyncing, Bootstrapping)
            | (StateSyncing, NormalOp)
            | (Bootstrapping, NormalOp)
            | (_, ShuttingDown)
    )
}

/// Host-supplied identities and collaborators, fixed for the lifetime of the
/// chain.
pub struct ChainContext {
    pub network_id: u32,
    pub subnet_id: Hash,
    pub blockchain_id: Hash,
    pub validator_state: Arc<dyn ValidatorState>,
    pub warp_signer: Option<crate::bls::SecretKey>,
}

/// Node-local settings from the config bytes; everything defaults.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VmConfig {
    pub mempool_capacity: usize,
    pub state_sync_enabled: bool,
    /// Blocks behind the network tip before state sync kicks in.
    pub state_sync_min_blocks: u64,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            mempool_capacity: 4096,
            state_sync_enabled: false,
            state_sync_min_blocks: 300_000,
        }
    }
}

struct Inner {
    config: ChainConfig,
    vm_config: VmConfig,
    ctx: ChainContext,
    store: StateStore,
    blocks: BlockStore,
    warp_backend: Arc<WarpBackend>,
    pool: Mempool,
    tree: Mutex<BlockTree>,
    preference: Mutex<Hash>,
    last_accepted: Mutex<Header>,
}

pub struct ChainVm {
    kv: Arc<dyn KvStore>,
    interpreter: Arc<dyn Interpreter>,
    clock: Arc<dyn Clock>,
    state: RwLock<VmState>,
    inner: RwLock<Option<Arc<Inner>>>,
    // serializes acceptance and the commits it implies
    writer: Mutex<()>,
}

impl ChainVm {
    pub fn new(
        kv: Arc<dyn KvStore>, interpreter: Arc<dyn Interpreter>,
    ) -> Self {
        Self::with_clock(kv, interpreter, Arc::new(SystemClock))
    }

    pub fn with_clock(
        kv: Arc<dyn KvStore>, interpreter: Arc<dyn Interpreter>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            kv,
            interpreter,
            clock,
            state: RwLock::new(VmState::Initializing),
            inner: RwLock::new(None),
            writer: Mutex::new(()),
        }
    }

    pub fn state(&self) -> VmState {
        *self.state.read()
    }

    fn inner(&self) -> Result<Arc<Inner>, VmError> {
        self.inner
            .read()
            .clone()
            .ok_or_else(|| VmError::Internal("not initialized".into()))
    }

    /// Parse genesis/upgrade/config bytes, materialize (or reload) the
    /// genesis block, and wire up the chain collaborators.
    pub fn initialize(
        &self, genesis_bytes: &[u8], upgrade_bytes: Option<&[u8]>,
        config_bytes: Option<&[u8]>, ctx: ChainContext,
    ) -> Result<(), VmError> {
        let mut config = ChainConfig::from_json(genesis_bytes)?;
        if let Some(raw) = upgrade_bytes {
            if !raw.is_empty() {
                let upgrades: UpgradeConfig = serde_json::from_slice(raw)
                    .map_err(|e| {
                        VmError::InvalidEncoding(format!("upgrades: {}", e))
                    })?;
                config.apply_upgrades(upgrades)?;
            }
        }
        if config.network_id != ctx.network_id {
            return Err(VmError::InvalidConfig(format!(
                "genesis network id {} does not match host {}",
                config.network_id, ctx.network_id
            )))
        }
        let vm_config = match config_bytes {
            Some(raw) if !raw.is_empty() => serde_json::from_slice(raw)
                .map_err(|e| {
                    VmError::InvalidEncoding(format!("config: {}", e))
                })?,
            _ => VmConfig::default(),
        };

        let store = StateStore::new(self.kv.clone());
        let blocks =
            BlockStore::new(self.kv.clone(), U256::from(config.chain_id));
        let last_accepted = match blocks.last_accepted() {
            Some(hash) => blocks.header(&hash).ok_or_else(|| {
                VmError::Corrupted(format!("missing accepted header {}", hash))
            })?,
            None => {
                let genesis = self.commit_genesis(&config, &store)?;
                blocks.put_accepted(&genesis, &[]);
                log::info!(
                    "created genesis block {} at timestamp {}",
                    genesis.hash(),
                    genesis.header().timestamp
                );
                genesis.header().clone()
            }
        };
        let last_hash = last_accepted.hash();
        let warp_backend = Arc::new(WarpBackend::new(
            self.kv.clone(),
            ctx.warp_signer.clone(),
        ));

        let inner = Inner {
            pool: Mempool::new(vm_config.mempool_capacity),
            config,
            vm_config,
            ctx,
            store,
            blocks,
            warp_backend,
            tree: Mutex::new(BlockTree::new(last_hash.clone())),
            preference: Mutex::new(last_hash),
            last_accepted: Mutex::new(last_accepted),
        };
        *self.inner.write() = Some(Arc::new(inner));
        Ok(())
    }

    fn commit_genesis(
        &self, config: &ChainConfig, store: &StateStore,
    ) -> Result<Block, VmError> {
        let root = store
            .commit_genesis(&config.alloc)
            .map_err(|e| VmError::Corrupted(e.to_string()))?;
        let mut state = store
            .mutable_state_at(&root)
            .map_err(|e| VmError::Corrupted(e.to_string()))?;
        precompile::configure_transitions(
            config,
            None,
            0,
            config.genesis_timestamp,
            &mut state,
        )?;
        let state_root = store
            .commit(&mut state)
            .map_err(|e| VmError::Corrupted(e.to_string()))?;
        let rules = config.rules_at(0, config.genesis_timestamp);
        let header = Header {
            state_root,
            number: 0,
            timestamp: config.genesis_timestamp,
            gas_limit: config.fee_config.gas_limit,
            base_fee: Wei::from(config.fee_config.min_base_fee),
            block_gas_cost: config.fee_config.min_block_gas_cost,
            cancun: rules.beacon_root.then(CancunFields::default),
            ..Default::default()
        };
        Ok(Block::new(header, vec![]))
    }

    pub fn set_state(&self, to: VmState) -> Result<(), VmError> {
        let mut state = self.state.write();
        if !valid_transition(*state, to) {
            return Err(VmError::Internal(format!(
                "invalid state transition {:?} -> {:?}",
                *state, to
            )))
        }
        log::info!("vm state {:?} -> {:?}", *state, to);
        *state = to;
        Ok(())
    }

    pub fn shutdown(&self) -> Result<(), VmError> {
        *self.state.write() = VmState::ShuttingDown;
        Ok(())
    }

    pub fn parse_block(&self, bytes: &[u8]) -> Result<Block, VmError> {
        let inner = self.inner()?;
        Block::decode(bytes, &U256::from(inner.config.chain_id))
    }

    fn parent_header(
        &self, inner: &Inner, parent: &Hash,
    ) -> Result<Header, VmError> {
        {
            let last = inner.last_accepted.lock();
            if &last.hash() == parent {
                return Ok(last.clone())
            }
        }
        let tree = inner.tree.lock();
        tree.get(parent)
            .map(|b| b.header().clone())
            .ok_or_else(|| VmError::UnknownParent(parent.clone()))
    }

    /// Verify a parsed block against its parent and record it in the
    /// verified tree. `p_chain_height` anchors warp predicate verification.
    pub fn verify_block(
        &self, block: Block, p_chain_height: u64,
    ) -> Result<Hash, VmError> {
        let inner = self.inner()?;
        let hash = block.hash().clone();
        if inner.tree.lock().contains(&hash) {
            return Ok(hash)
        }
        let timestamp = block.header().timestamp;
        if timestamp > self.clock.unix_now() + MAX_FUTURE_BLOCK_TIME {
            return Err(VmError::InvalidBlock(format!(
                "block timestamp {} too far in the future",
                timestamp
            )))
        }
        let parent = self.parent_header(&inner, block.parent_hash())?;
        let rules = inner.config.rules_at(block.number(), timestamp);
        let verifier = warp_pc::PredicateContext {
            network_id: inner.ctx.network_id,
            local_subnet_id: inner.ctx.subnet_id.clone(),
            p_chain_height,
            validator_state: &*inner.ctx.validator_state,
        };
        let executor = BlockExecutor {
            config: &inner.config,
            store: &inner.store,
            interpreter: &*self.interpreter,
            blockchain_id: inner.ctx.blockchain_id.clone(),
        };
        let executed = executor.process(&block, &parent, &rules, &verifier)?;
        inner
            .tree
            .lock()
            .insert(Arc::new(block), executed.receipts)?;
        Ok(hash)
    }

    /// Build a block on the preferred tip from pool contents. Only legal in
    /// normal operation.
    pub fn build_block(
        &self, p_chain_height: u64,
    ) -> Result<Arc<Block>, VmError> {
        if self.state() != VmState::NormalOp {
            return Err(VmError::Internal(
                "cannot build before normal operation".into(),
            ))
        }
        let inner = self.inner()?;
        let preferred = inner.preference.lock().clone();
        let parent = self.parent_header(&inner, &preferred)?;
        let verifier = warp_pc::PredicateContext {
            network_id: inner.ctx.network_id,
            local_subnet_id: inner.ctx.subnet_id.clone(),
            p_chain_height,
            validator_state: &*inner.ctx.validator_state,
        };
        let builder = BlockBuilder {
            config: &inner.config,
            store: &inner.store,
            interpreter: &*self.interpreter,
            blockchain_id: inner.ctx.blockchain_id.clone(),
            coinbase: Addr::zero().clone(),
            clock: &*self.clock,
        };
        let block = builder.build(&parent, &inner.pool, &verifier)?;
        let executor = BlockExecutor {
            config: &inner.config,
            store: &inner.store,
            interpreter: &*self.interpreter,
            blockchain_id: inner.ctx.blockchain_id.clone(),
        };
        let rules = inner
            .config
            .rules_at(block.number(), block.header().timestamp);
        let executed = executor.process(&block, &parent, &rules, &verifier)?;
        let block = Arc::new(block);
        inner
            .tree
            .lock()
            .insert(block.clone(), executed.receipts)?;
        Ok(block)
    }

    pub fn set_preference(&self, hash: Hash) -> Result<(), VmError> {
        let inner = self.inner()?;
        *inner.preference.lock() = hash;
        Ok(())
    }

    /// Accept a verified child of the last accepted block: persist it,
    /// advance the root, prune competitors, and hand emitted warp messages
    /// to the signing backend off the writer path.
    pub fn accept_block(&self, hash: &Hash) -> Result<(), VmError> {
        let inner = self.inner()?;
        let _writer = self.writer.lock();

        let (block, receipts, rejected) = {
            let mut tree = inner.tree.lock();
            let block = tree
                .get(hash)
                .cloned()
                .ok_or_else(|| VmError::UnknownBlock(hash.clone()))?;
            let receipts = tree
                .receipts(hash)
                .map(|r| r.to_vec())
                .unwrap_or_default();
            let rejected = tree.accept(hash)?;
            (block, receipts, rejected)
        };
        for pruned in &rejected {
            log::debug!("pruned competing block {}", pruned.hash());
        }
        inner.blocks.put_accepted(&block, &receipts);
        *inner.last_accepted.lock() = block.header().clone();
        {
            let mut preference = inner.preference.lock();
            let tree = inner.tree.lock();
            if *preference != *hash && !tree.contains(&preference) {
                *preference = hash.clone();
            }
        }
        if let Ok(view) = inner.store.state_at(&block.header().state_root) {
            inner.pool.evict_stale(&view);
        }

        let logs: Vec<_> = receipts
            .iter()
            .flat_map(|r| r.logs.iter().cloned())
            .collect();
        let outbound = warp_pc::extract_outbound(&logs);
        if !outbound.is_empty() {
            // runs after the durable commit, off the writer path
            let backend = inner.warp_backend.clone();
            std::thread::spawn(move || {
                for msg in &outbound {
                    backend.add_message(msg);
                }
            });
        }
        log::info!("accepted block {} ({})", block.number(), hash);
        Ok(())
    }

    pub fn reject_block(&self, hash: &Hash) -> Result<(), VmError> {
        let inner = self.inner()?;
        let rejected = inner.tree.lock().reject(hash);
        for block in &rejected {
            log::debug!("rejected block {} ({})", block.number(), block.hash());
        }
        Ok(())
    }

    pub fn last_accepted(&self) -> Result<Hash, VmError> {
        let inner = self.inner()?;
        let last = inner.last_accepted.lock();
        Ok(last.hash())
    }

    pub fn last_accepted_header(&self) -> Result<Header, VmError> {
        let inner = self.inner()?;
        let header = inner.last_accepted.lock().clone();
        Ok(header)
    }

    /// Admit a raw transaction into the pool against the preferred state.
    pub fn submit_tx(&self, bytes: &[u8]) -> Result<(), AdmissionError> {
        let inner = self.inner().map_err(|_| AdmissionError::InvalidEncoding)?;
        let tx = Tx::decode(bytes, &U256::from(inner.config.chain_id))
            .ok_or(AdmissionError::InvalidEncoding)?;
        let preferred = inner.preference.lock().clone();
        let parent = self
            .parent_header(&inner, &preferred)
            .map_err(|_| AdmissionError::InvalidEncoding)?;
        let view = inner
            .store
            .state_at(&parent.state_root)
            .map_err(|_| AdmissionError::InvalidEncoding)?;
        let rules = inner.config.rules_at(
            parent.number + 1,
            self.clock.unix_now().max(parent.timestamp + 1),
        );
        let state = inner
            .store
            .mutable_state_at(&parent.state_root)
            .map_err(|_| AdmissionError::InvalidEncoding)?;
        let fee_config = feemanager::effective_fee_config(&rules, &state)
            .map_err(|_| AdmissionError::InvalidEncoding)?;
        let base_fee =
            next_base_fee(&fee_config, &parent.base_fee, parent.gas_used);
        inner.pool.add(Arc::new(tx), &rules, &view, &base_fee)
    }

    pub fn mempool_len(&self) -> usize {
        self.inner()
            .map(|inner| inner.pool.len())
            .unwrap_or(0)
    }

    pub fn warp_backend(&self) -> Result<Arc<WarpBackend>, VmError> {
        Ok(self.inner()?.warp_backend.clone())
    }

    pub fn state_sync_enabled(&self) -> bool {
        self.inner()
            .map(|inner| inner.vm_config.state_sync_enabled)
            .unwrap_or(false)
    }

    pub fn health_check(&self) -> Result<serde_json::Value, VmError> {
        let inner = self.inner()?;
        let last = inner.last_accepted.lock();
        Ok(serde_json::json!({
            "state": format!("{:?}", self.state()),
            "lastAcceptedNumber": last.number,
            "lastAcceptedHash": format!("{}", last.hash()),
            "mempoolSize": inner.pool.len(),
        }))
    }
}
