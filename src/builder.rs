//! Block production: pull candidates from the pool in priority order, apply
//! them against a snapshot of the parent state, and finalize a header whose
//! fields [BlockExecutor](crate::processor::BlockExecutor) will accept.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::block::{
    empty_uncle_hash, logs_bloom, receipts_root, Block, CancunFields, Header,
    PredicateResults, Receipt,
};
use crate::common::{Addr, Bytes, Gas, Hash, U256};
use crate::error::VmError;
use crate::evm::{BlockContext, Interpreter};
use crate::mempool::Mempool;
use crate::params::{
    blob_gas_price, block_gas_cost, next_base_fee, next_excess_blob_gas,
    ChainConfig, GAS_PER_BLOB, MAX_BLOB_GAS_PER_BLOCK,
    MAX_FUTURE_BLOCK_TIME,
};
use crate::precompile::{self, feemanager};
use crate::processor::{
    apply_tx, store_beacon_root, PredicateVerifier,
};
use crate::state::StateStore;
use crate::tx::{effective_tip, Tx};

/// Smallest gas any transaction can consume; below this remaining headroom
/// the block is full.
const MIN_TX_GAS: Gas = 21_000;

/// Producer clock seam so builds are reproducible under test.
pub trait Clock: Send + Sync {
    fn unix_now(&self) -> u64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn unix_now(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}

pub struct BlockBuilder<'a> {
    pub config: &'a ChainConfig,
    pub store: &'a StateStore,
    pub interpreter: &'a dyn Interpreter,
    pub blockchain_id: Hash,
    pub coinbase: Addr,
    pub clock: &'a dyn Clock,
}

impl BlockBuilder<'_> {
    /// Build one block on `parent`. Transactions that fail admission or
    /// carry an unverifiable predicate are skipped, and so is the rest of
    /// that sender's queue to preserve nonce order. Reverted executions are
    /// still included with failed receipts.
    pub fn build(
        &self, parent: &Header, pool: &Mempool,
        predicate_verifier: &dyn PredicateVerifier,
    ) -> Result<Block, VmError> {
        let now = self.clock.unix_now();
        // clamp to the future-skew bound verifiers enforce; parent order
        // still wins when the local clock lags the parent
        let timestamp = now
            .max(parent.timestamp + 1)
            .min(now + MAX_FUTURE_BLOCK_TIME)
            .max(parent.timestamp + 1);
        let number = parent.number + 1;
        let rules = self.config.rules_at(number, timestamp);

        let mut state = self
            .store
            .mutable_state_at(&parent.state_root)
            .map_err(|e| VmError::Internal(e.to_string()))?;
        let fee_config = feemanager::effective_fee_config(&rules, &state)
            .map_err(|e| VmError::Corrupted(e.to_string()))?;
        let base_fee =
            next_base_fee(&fee_config, &parent.base_fee, parent.gas_used);
        let gas_limit = fee_config.gas_limit;
        let cost = block_gas_cost(
            &fee_config,
            parent.block_gas_cost,
            timestamp - parent.timestamp,
        );

        precompile::configure_transitions(
            self.config,
            Some((parent.number, parent.timestamp)),
            number,
            timestamp,
            &mut state,
        )?;
        let parent_cancun = parent.cancun.as_ref();
        let excess_blob_gas = next_excess_blob_gas(
            parent_cancun.map(|c| c.excess_blob_gas).unwrap_or(0),
            parent_cancun.map(|c| c.blob_gas_used).unwrap_or(0),
        );
        let mut cancun = if rules.beacon_root {
            let fields = CancunFields {
                excess_blob_gas,
                ..Default::default()
            };
            store_beacon_root(&mut state, timestamp, &fields.beacon_root)
                .map_err(|e| VmError::Corrupted(e.to_string()))?;
            Some(fields)
        } else {
            None
        };

        let block_ctx = BlockContext {
            number,
            timestamp,
            coinbase: self.coinbase.clone(),
            base_fee: base_fee.clone(),
            blob_gas_price: blob_gas_price(excess_blob_gas),
            gas_limit,
            blockchain_id: self.blockchain_id.clone(),
        };

        let mut included: Vec<Arc<Tx>> = Vec::new();
        let mut receipts: Vec<Receipt> = Vec::new();
        let mut results = PredicateResults::default();
        let mut cumulative: Gas = 0;
        let mut blob_gas: u64 = 0;
        let mut fees = U256::zero();
        // once one of a sender's transactions is skipped, every later nonce
        // of that sender would be a gap
        let mut skipped: BTreeSet<Addr> = BTreeSet::new();

        for tx in pool.pending(&base_fee) {
            if gas_limit - cumulative < MIN_TX_GAS {
                break
            }
            if skipped.contains(tx.from()) {
                continue
            }
            if tx.gas() > gas_limit - cumulative {
                skipped.insert(tx.from().clone());
                continue
            }
            let tx_blob_gas =
                (tx.blob_hashes().len() as u64) * GAS_PER_BLOB;
            if blob_gas + tx_blob_gas > MAX_BLOB_GAS_PER_BLOCK {
                skipped.insert(tx.from().clone());
                continue
            }
            let predicates = tx.predicates(&rules);
            if predicates.iter().any(|(_, predicate)| {
                predicate_verifier.verify(&rules, predicate).is_err()
            }) {
                skipped.insert(tx.from().clone());
                continue
            }
            let index = included.len() as u64;
            let mut tx_results = PredicateResults::default();
            for j in 0..predicates.len() {
                tx_results.set(index, j, true);
            }
            match apply_tx(
                &rules,
                &block_ctx,
                &mut state,
                self.interpreter,
                &tx,
                index,
                cumulative,
                &tx_results,
            ) {
                Ok(receipt) => {
                    let tip = effective_tip(&**tx, &base_fee)
                        .map(|t| *t.as_ref())
                        .unwrap_or_default();
                    fees +=
                        tip * U256::from(receipt.cumulative_gas - cumulative);
                    blob_gas += receipt.blob_gas_used.unwrap_or(0);
                    cumulative = receipt.cumulative_gas;
                    for j in 0..predicates.len() {
                        results.set(index, j, true);
                    }
                    receipts.push(receipt);
                    included.push(tx);
                }
                Err(e) => {
                    log::debug!("build: skipping {:?}: {}", tx, e);
                    skipped.insert(tx.from().clone());
                }
            }
        }

        if included.is_empty() {
            return Err(VmError::NoPendingWork)
        }
        // verifiers refuse blocks whose collected tips cannot pay the
        // required block gas cost, so do not propose one
        if fees < U256::from(cost) * *base_fee.as_ref() {
            return Err(VmError::NoPendingWork)
        }
        if let Some(fields) = &mut cancun {
            fields.blob_gas_used = blob_gas;
        }

        let state_root = self
            .store
            .commit(&mut state)
            .map_err(|e| VmError::Corrupted(e.to_string()))?;
        let extra = if results.is_empty() {
            Bytes::empty()
        } else {
            results.encode()
        };
        let header = Header {
            parent_hash: parent.hash(),
            uncle_hash: empty_uncle_hash().clone(),
            coinbase: self.coinbase.clone(),
            state_root,
            tx_root: Block::tx_root(&included),
            receipts_root: receipts_root(&receipts),
            logs_bloom: logs_bloom(&receipts),
            difficulty: U256::one(),
            number,
            gas_limit,
            gas_used: cumulative,
            timestamp,
            extra,
            mix_digest: Hash::zero().clone(),
            nonce: [0u8; 8],
            base_fee,
            block_gas_cost: cost,
            cancun,
        };
        Ok(Block::new(header, included))
    }
}
