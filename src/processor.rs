//! Deterministic block execution: fork-entry hooks, per-transaction EVM
//! runs, receipt and root production, fee-market accounting, predicate
//! verification. Everything here is a pure function of `(parent, block,
//! rules)` plus the parent state.

use bitvec::prelude::{BitVec, Lsb0};
use primitive_types::U256;

use crate::block::{
    logs_bloom, receipts_root, Block, Header, PredicateResults, Receipt,
};
use crate::common::{Addr, Bloom, Gas, Hash, Log, Wei};
use crate::error::{AdmissionError, StateError, VmError, WarpError};
use crate::evm::{BlockContext, Evm, Interpreter, TxContext};
use crate::params::{
    blob_gas_price, block_gas_cost, next_base_fee, next_excess_blob_gas,
    ChainConfig, FeeConfig, Rules, GAS_PER_BLOB, MAX_BLOB_GAS_PER_BLOCK,
};
use crate::precompile::{self, feemanager, txallowlist, warp as warp_pc};
use crate::state::{MutableState, StateStore};
use crate::tx::{
    effective_gas_price, effective_tip, intrinsic_gas, Tx, TxType,
};
use crate::warp::message::Message;
use crate::warp::predicate_gas;

/// EIP-4788 beacon-root buffer contract.
pub fn beacon_roots_addr() -> Addr {
    let mut raw = [0u8; 20];
    raw[..2].copy_from_slice(&[0x00, 0x0f]);
    raw[2..].copy_from_slice(&[
        0x3d, 0xf6, 0xd7, 0x32, 0x80, 0x7e, 0xf1, 0x31, 0x9f, 0xb7, 0xb8,
        0xbb, 0x85, 0x22, 0xd0, 0xbe, 0xac, 0x02,
    ]);
    Addr::from(raw)
}

const BEACON_ROOT_BUFFER_LEN: u64 = 8191;

/// Verifies one unpacked predicate payload. Production blocks use
/// [warp_pc::PredicateContext]; tests substitute stubs.
pub trait PredicateVerifier: Send + Sync {
    fn verify(&self, rules: &Rules, predicate: &[u8])
        -> Result<(), WarpError>;
}

impl PredicateVerifier for warp_pc::PredicateContext<'_> {
    fn verify(
        &self, rules: &Rules, predicate: &[u8],
    ) -> Result<(), WarpError> {
        warp_pc::verify_predicate(rules, self, predicate)
    }
}

/// Everything a successful execution produces, before commit.
pub struct ExecutedBlock {
    pub receipts: Vec<Receipt>,
    pub logs: Vec<Log>,
    pub gas_used: Gas,
    pub state_root: Hash,
}

pub struct BlockExecutor<'a> {
    pub config: &'a ChainConfig,
    pub store: &'a StateStore,
    pub interpreter: &'a dyn Interpreter,
    pub blockchain_id: Hash,
}

impl BlockExecutor<'_> {
    /// Execute `block` on top of `parent`, enforcing every header field.
    /// The resulting state is committed; callers that reject the block
    /// simply never reference the new root.
    pub fn process(
        &self, block: &Block, parent: &Header, rules: &Rules,
        predicate_verifier: &dyn PredicateVerifier,
    ) -> Result<ExecutedBlock, VmError> {
        let header = block.header();
        if header.number != parent.number + 1 {
            return Err(VmError::InvalidBlock(format!(
                "number {} does not follow parent {}",
                header.number, parent.number
            )))
        }
        if header.parent_hash != parent.hash() {
            return Err(VmError::InvalidBlock("parent hash mismatch".into()))
        }
        if header.timestamp < parent.timestamp {
            return Err(VmError::InvalidBlock(
                "timestamp behind parent".into(),
            ))
        }

        let mut state = self
            .store
            .mutable_state_at(&parent.state_root)
            .map_err(|e| VmError::Internal(e.to_string()))?;

        // fee parameters as of the parent state, fee-manager aware
        let fee_config = feemanager::effective_fee_config(rules, &state)
            .map_err(|e| VmError::Corrupted(e.to_string()))?;
        self.verify_fee_fields(header, parent, &fee_config)?;

        precompile::configure_transitions(
            self.config,
            Some((parent.number, parent.timestamp)),
            header.number,
            header.timestamp,
            &mut state,
        )?;
        self.apply_beacon_root(header, rules, &mut state)?;

        let results =
            self.verify_predicates(block, rules, predicate_verifier)?;
        let declared = header.predicate_results()?;
        if results != declared {
            return Err(VmError::InvalidBlock(
                "predicate results mismatch".into(),
            ))
        }

        let parent_cancun = parent.cancun.as_ref();
        let excess_blob_gas = next_excess_blob_gas(
            parent_cancun.map(|c| c.excess_blob_gas).unwrap_or(0),
            parent_cancun.map(|c| c.blob_gas_used).unwrap_or(0),
        );
        if let Some(cancun) = &header.cancun {
            if cancun.excess_blob_gas != excess_blob_gas {
                return Err(VmError::InvalidBlock(format!(
                    "excess blob gas {} does not match expected {}",
                    cancun.excess_blob_gas, excess_blob_gas
                )))
            }
        }

        let block_ctx = BlockContext {
            number: header.number,
            timestamp: header.timestamp,
            coinbase: header.coinbase.clone(),
            base_fee: header.base_fee.clone(),
            blob_gas_price: blob_gas_price(excess_blob_gas),
            gas_limit: header.gas_limit,
            blockchain_id: self.blockchain_id.clone(),
        };
        let mut receipts = Vec::with_capacity(block.txs().len());
        let mut cumulative_gas: Gas = 0;
        let mut blob_gas_used: u64 = 0;
        let mut block_fees = U256::zero();
        for (i, tx) in block.txs().iter().enumerate() {
            let applied = apply_tx(
                rules,
                &block_ctx,
                &mut state,
                self.interpreter,
                tx,
                i as u64,
                cumulative_gas,
                &results,
            )
            .map_err(|e| {
                VmError::InvalidBlock(format!("tx {}: {}", i, e))
            })?;
            let tx_gas_used = applied.cumulative_gas - cumulative_gas;
            let tip = effective_tip(&***tx, &header.base_fee)
                .map(|t| *t.as_ref())
                .unwrap_or_default();
            block_fees += tip * U256::from(tx_gas_used);
            blob_gas_used += applied.blob_gas_used.unwrap_or(0);
            cumulative_gas = applied.cumulative_gas;
            if cumulative_gas > header.gas_limit {
                return Err(VmError::InvalidBlock(
                    "block gas limit exceeded".into(),
                ))
            }
            receipts.push(applied);
        }

        let declared_blob_gas =
            header.cancun.as_ref().map(|c| c.blob_gas_used).unwrap_or(0);
        if blob_gas_used != declared_blob_gas {
            return Err(VmError::InvalidBlock(format!(
                "blob gas used {} does not match header {}",
                blob_gas_used, declared_blob_gas
            )))
        }
        if blob_gas_used > MAX_BLOB_GAS_PER_BLOCK {
            return Err(VmError::InvalidBlock(
                "blob gas above the block limit".into(),
            ))
        }
        // the priority fees collected by the block must pay for the
        // required block gas cost
        let required_fees =
            U256::from(header.block_gas_cost) * *header.base_fee.as_ref();
        if block_fees < required_fees {
            return Err(VmError::InvalidBlock(format!(
                "block fees {} below the {} the block gas cost requires",
                block_fees, required_fees
            )))
        }

        if cumulative_gas != header.gas_used {
            return Err(VmError::InvalidBlock(format!(
                "gas used {} does not match header {}",
                cumulative_gas, header.gas_used
            )))
        }
        if receipts_root(&receipts) != header.receipts_root {
            return Err(VmError::InvalidBlock(
                "receipts root mismatch".into(),
            ))
        }
        if logs_bloom(&receipts) != header.logs_bloom {
            return Err(VmError::InvalidBlock("logs bloom mismatch".into()))
        }
        let state_root = self
            .store
            .commit(&mut state)
            .map_err(|e| VmError::Corrupted(e.to_string()))?;
        if state_root != header.state_root {
            return Err(VmError::InvalidBlock(format!(
                "state root {} does not match header {}",
                state_root, header.state_root
            )))
        }
        let logs =
            receipts.iter().flat_map(|r| r.logs.iter().cloned()).collect();
        Ok(ExecutedBlock {
            receipts,
            logs,
            gas_used: cumulative_gas,
            state_root,
        })
    }

    fn verify_fee_fields(
        &self, header: &Header, parent: &Header, fee_config: &FeeConfig,
    ) -> Result<(), VmError> {
        if header.gas_limit != fee_config.gas_limit {
            return Err(VmError::InvalidBlock(format!(
                "gas limit {} does not match fee config {}",
                header.gas_limit, fee_config.gas_limit
            )))
        }
        let expected_base_fee =
            next_base_fee(fee_config, &parent.base_fee, parent.gas_used);
        if header.base_fee != expected_base_fee {
            return Err(VmError::InvalidBlock(format!(
                "base fee {:?} does not match expected {:?}",
                header.base_fee, expected_base_fee
            )))
        }
        let expected_cost = block_gas_cost(
            fee_config,
            parent.block_gas_cost,
            header.timestamp - parent.timestamp,
        );
        if header.block_gas_cost != expected_cost {
            return Err(VmError::InvalidBlock(format!(
                "block gas cost {} does not match expected {}",
                header.block_gas_cost, expected_cost
            )))
        }
        Ok(())
    }

    /// EIP-4788: store `(timestamp, beacon root)` into the ring buffer of
    /// the system contract before any transaction runs.
    fn apply_beacon_root(
        &self, header: &Header, rules: &Rules, state: &mut MutableState,
    ) -> Result<(), VmError> {
        if !rules.beacon_root {
            if header.cancun.is_some() {
                return Err(VmError::InvalidBlock(
                    "unexpected post-Cancun header fields".into(),
                ))
            }
            return Ok(())
        }
        let cancun = header.cancun.as_ref().ok_or_else(|| {
            VmError::InvalidBlock("missing post-Cancun header fields".into())
        })?;
        store_beacon_root(state, header.timestamp, &cancun.beacon_root)
            .map_err(|e| VmError::Corrupted(e.to_string()))
    }

    /// Verify every predicate of every transaction. Any failure invalidates
    /// the whole block; the returned bitmap therefore has every bit set and
    /// must equal the one the producer declared in the header.
    fn verify_predicates(
        &self, block: &Block, rules: &Rules,
        verifier: &dyn PredicateVerifier,
    ) -> Result<PredicateResults, VmError> {
        let mut results = PredicateResults::default();
        for (i, tx) in block.txs().iter().enumerate() {
            for (j, (addr, predicate)) in
                tx.predicates(rules).iter().enumerate()
            {
                verifier.verify(rules, predicate).map_err(|e| {
                    VmError::InvalidBlock(format!(
                        "tx {} predicate {} for {}: {}",
                        i, j, addr, e
                    ))
                })?;
                results.set(i as u64, j, true);
            }
        }
        Ok(results)
    }
}

/// EIP-4788 ring-buffer write, shared by verification and block building.
pub fn store_beacon_root(
    state: &mut MutableState, timestamp: u64, beacon_root: &Hash,
) -> Result<(), StateError> {
    let addr = beacon_roots_addr();
    let index = timestamp % BEACON_ROOT_BUFFER_LEN;
    state.set_storage(
        &addr,
        Hash::from(U256::from(index)),
        Hash::from(U256::from(timestamp)),
    )?;
    state.set_storage(
        &addr,
        Hash::from(U256::from(index + BEACON_ROOT_BUFFER_LEN)),
        beacon_root.clone(),
    )
}

/// Intrinsic gas including the block-level warp verification cost of the
/// transaction's predicates.
pub fn tx_intrinsic_gas(rules: &Rules, tx: &Tx) -> Option<Gas> {
    let mut gas = intrinsic_gas(&**tx)?;
    for (_, predicate) in tx.predicates(rules) {
        let signers = Message::parse(&predicate)
            .map(|m| m.num_signers())
            .unwrap_or(0);
        gas = gas
            .checked_add(predicate_gas(predicate.len(), signers).ok()?)?;
    }
    Some(gas)
}

/// Execute one transaction against `state`, producing its receipt. Admission
/// failures (bad nonce, unpayable fees, allow-list denial) are returned
/// without touching state; EVM-level failures become failed receipts.
#[allow(clippy::too_many_arguments)]
pub fn apply_tx(
    rules: &Rules, block_ctx: &BlockContext, state: &mut MutableState,
    interpreter: &dyn Interpreter, tx: &Tx, tx_index: u64,
    cumulative_gas: Gas, results: &PredicateResults,
) -> Result<Receipt, AdmissionError> {
    let sender = tx.from().clone();
    if !txallowlist::is_sender_allowed(rules, state, &sender)
        .map_err(|_| AdmissionError::InvalidEncoding)?
    {
        return Err(AdmissionError::SenderNotAllowed)
    }
    let is_blob = tx.type_() == TxType::Blob;
    if is_blob && !rules.blob_txs {
        return Err(AdmissionError::TxTypeNotSupported)
    }
    if is_blob && tx.blob_hashes().is_empty() {
        return Err(AdmissionError::InvalidEncoding)
    }
    let intrinsic =
        tx_intrinsic_gas(rules, tx).ok_or(AdmissionError::IntrinsicGas)?;
    if intrinsic > tx.gas() {
        return Err(AdmissionError::IntrinsicGas)
    }
    let price = effective_gas_price(&**tx, &block_ctx.base_fee)
        .ok_or(AdmissionError::Underpriced)?;
    let state_nonce = state
        .nonce(&sender)
        .map_err(|_| AdmissionError::InvalidEncoding)?;
    if tx.nonce() < state_nonce {
        return Err(AdmissionError::NonceTooLow {
            tx: tx.nonce(),
            state: state_nonce,
        })
    }
    if tx.nonce() > state_nonce {
        return Err(AdmissionError::NonceTooHigh {
            tx: tx.nonce(),
            state: state_nonce,
        })
    }

    // the blob fee is prepaid at the block's blob gas price and burned
    // whole, never refunded
    let blob_gas = (tx.blob_hashes().len() as u64) * GAS_PER_BLOB;
    let blob_price: U256 = *block_ctx.blob_gas_price.as_ref();
    if is_blob && *tx.max_fee_per_blob_gas().as_ref() < blob_price {
        return Err(AdmissionError::Underpriced)
    }
    let blob_cost = U256::from(blob_gas) * blob_price;

    let price_u: U256 = *price.as_ref();
    let gas_cost = price_u * U256::from(tx.gas()) + blob_cost;
    let total_cost = gas_cost + *tx.value().as_ref();
    let balance = state
        .balance(&sender)
        .map_err(|_| AdmissionError::InvalidEncoding)?;
    if *balance.as_ref() < total_cost {
        return Err(AdmissionError::InsufficientFunds)
    }

    // buy gas
    let prepaid = Wei::from(gas_cost);
    let debited = balance
        .checked_sub(&prepaid)
        .ok_or(AdmissionError::InsufficientFunds)?;
    state
        .set_balance(&sender, debited)
        .map_err(|_| AdmissionError::InvalidEncoding)?;

    let predicates = tx.predicates(rules);
    let mut verified: BitVec<u8, Lsb0> =
        BitVec::repeat(false, predicates.len());
    for j in 0..predicates.len() {
        verified.set(j, results.verified(tx_index, j));
    }
    let tx_ctx = TxContext {
        origin: sender.clone(),
        gas_price: price.clone(),
        predicates,
        verified,
    };

    let exec_gas = tx.gas() - intrinsic;
    let mut evm =
        Evm::new(rules, block_ctx, &tx_ctx, state, interpreter);
    let (output, is_create) = match tx.to() {
        Some(to) => (
            evm.call(&sender, to, tx.value(), tx.data(), exec_gas, false),
            false,
        ),
        None => {
            let (_, output) =
                evm.create(&sender, tx.value(), tx.data(), exec_gas, None);
            (output, true)
        }
    };

    // the sender's nonce advances exactly once, success or not
    if !is_create || output.err.is_some() {
        state
            .set_nonce(&sender, state_nonce + 1)
            .map_err(|_| AdmissionError::InvalidEncoding)?;
    }

    let gas_used = intrinsic + (exec_gas - output.gas_left);
    let refund = Wei::from(price_u * U256::from(output.gas_left));
    let balance = state
        .balance(&sender)
        .map_err(|_| AdmissionError::InvalidEncoding)?;
    if let Some(repaid) = balance.checked_add(&refund) {
        state
            .set_balance(&sender, repaid)
            .map_err(|_| AdmissionError::InvalidEncoding)?;
    }

    // the base-fee share burns; only the tip reaches the coinbase
    let tip = effective_tip(&**tx, &block_ctx.base_fee)
        .unwrap_or_else(|| Wei::zero().clone());
    let reward = Wei::from(*tip.as_ref() * U256::from(gas_used));
    if !reward.is_zero() {
        let coinbase_balance = state
            .balance(&block_ctx.coinbase)
            .map_err(|_| AdmissionError::InvalidEncoding)?;
        if let Some(paid) = coinbase_balance.checked_add(&reward) {
            state
                .set_balance(&block_ctx.coinbase, paid)
                .map_err(|_| AdmissionError::InvalidEncoding)?;
        }
    }

    let logs = state.take_logs();
    let mut bloom = Bloom::zero();
    for log in &logs {
        bloom.accrue_log(&log.address, &log.topics);
    }
    Ok(Receipt {
        status: if output.err.is_none() { 1 } else { 0 },
        cumulative_gas: cumulative_gas + gas_used,
        bloom,
        logs,
        tx_type: tx.type_(),
        blob_gas_used: is_blob.then_some(blob_gas),
        blob_gas_price: is_blob.then(|| block_ctx.blob_gas_price.clone()),
    })
}
