//! Transaction pool: per-sender nonce queues behind a single admission lock.
//! Selection order is effective tip descending with `(sender, nonce, hash)`
//! ascending as the tie-break.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use primitive_types::U256;

use crate::common::{Addr, Wei};
use crate::error::AdmissionError;
use crate::params::Rules;
use crate::processor::tx_intrinsic_gas;
use crate::state::StateView;
use crate::tx::{effective_tip, Tx, TxType};

/// Replacement transactions must raise the fee cap by at least this many
/// percent.
const REPLACE_BUMP_PERCENT: u64 = 10;

pub struct Mempool {
    capacity: usize,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    by_sender: HashMap<Addr, BTreeMap<u64, Arc<Tx>>>,
    count: usize,
}

impl Inner {
    fn insert(&mut self, tx: Arc<Tx>) {
        let queue = self.by_sender.entry(tx.from().clone()).or_default();
        if queue.insert(tx.nonce(), tx).is_none() {
            self.count += 1;
        }
    }

    fn remove(&mut self, sender: &Addr, nonce: u64) -> Option<Arc<Tx>> {
        let queue = self.by_sender.get_mut(sender)?;
        let removed = queue.remove(&nonce);
        if removed.is_some() {
            self.count -= 1;
        }
        if queue.is_empty() {
            self.by_sender.remove(sender);
        }
        removed
    }

    /// The pool-wide lowest-priority entry: for every sender only the
    /// highest nonce is evictable without breaking the queue.
    fn evictable(&self, base_fee: &Wei) -> Option<(Addr, u64)> {
        self.by_sender
            .iter()
            .filter_map(|(sender, queue)| {
                queue
                    .iter()
                    .next_back()
                    .map(|(nonce, tx)| (sender.clone(), *nonce, tip_of(tx, base_fee)))
            })
            .min_by(|a, b| a.2.cmp(&b.2).then_with(|| a.0.cmp(&b.0)))
            .map(|(sender, nonce, _)| (sender, nonce))
    }
}

fn tip_of(tx: &Tx, base_fee: &Wei) -> U256 {
    effective_tip(&**tx, base_fee)
        .map(|tip| *tip.as_ref())
        .unwrap_or_else(U256::zero)
}

impl Mempool {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Admit one transaction. `state` is a committed view at the preferred
    /// head; `base_fee` prices eviction decisions.
    pub fn add(
        &self, tx: Arc<Tx>, rules: &Rules, state: &StateView,
        base_fee: &Wei,
    ) -> Result<(), AdmissionError> {
        if tx.type_() == TxType::Blob && !rules.blob_txs {
            return Err(AdmissionError::TxTypeNotSupported)
        }
        let intrinsic = tx_intrinsic_gas(rules, &tx)
            .ok_or(AdmissionError::IntrinsicGas)?;
        if intrinsic > tx.gas() {
            return Err(AdmissionError::IntrinsicGas)
        }
        let fee_cap: U256 = *tx.gas_fee_cap().as_ref();
        if fee_cap < U256::from(rules.fee_config.min_base_fee) {
            return Err(AdmissionError::Underpriced)
        }
        let sender = tx.from().clone();
        let state_nonce = state
            .nonce(&sender)
            .map_err(|_| AdmissionError::InvalidEncoding)?;
        if tx.nonce() < state_nonce {
            return Err(AdmissionError::NonceTooLow {
                tx: tx.nonce(),
                state: state_nonce,
            })
        }
        let balance = state
            .balance(&sender)
            .map_err(|_| AdmissionError::InvalidEncoding)?;
        let cost = fee_cap * U256::from(tx.gas()) + *tx.value().as_ref();
        if *balance.as_ref() < cost {
            return Err(AdmissionError::InsufficientFunds)
        }

        let mut inner = self.inner.lock();
        if let Some(existing) = inner
            .by_sender
            .get(&sender)
            .and_then(|queue| queue.get(&tx.nonce()))
        {
            let old_cap: U256 = *existing.gas_fee_cap().as_ref();
            let required =
                old_cap + old_cap * U256::from(REPLACE_BUMP_PERCENT) / 100;
            if fee_cap < required {
                return Err(AdmissionError::ReplaceUnderpriced)
            }
            inner.insert(tx);
            return Ok(())
        }
        if inner.count >= self.capacity {
            let new_tip = tip_of(&tx, base_fee);
            match inner.evictable(base_fee) {
                Some((victim, nonce))
                    if inner
                        .by_sender
                        .get(&victim)
                        .and_then(|q| q.get(&nonce))
                        .map(|t| tip_of(t, base_fee) < new_tip)
                        .unwrap_or(false) =>
                {
                    inner.remove(&victim, nonce);
                }
                _ => return Err(AdmissionError::MempoolFull),
            }
        }
        inner.insert(tx);
        Ok(())
    }

    /// Drop entries invalidated by a new head: anything at a nonce below the
    /// sender's committed nonce.
    pub fn evict_stale(&self, state: &StateView) {
        let mut inner = self.inner.lock();
        let mut stale: Vec<(Addr, u64)> = Vec::new();
        for (sender, queue) in &inner.by_sender {
            if let Ok(nonce) = state.nonce(sender) {
                stale.extend(
                    queue
                        .range(..nonce)
                        .map(|(n, _)| (sender.clone(), *n)),
                );
            }
        }
        for (sender, nonce) in stale {
            inner.remove(&sender, nonce);
        }
    }

    pub fn remove(&self, sender: &Addr, nonce: u64) {
        self.inner.lock().remove(sender, nonce);
    }

    /// All pool transactions in selection order: effective tip descending,
    /// then `(sender, nonce, hash)` ascending. Per-sender nonce order is
    /// always respected, so a later nonce never precedes an earlier one.
    pub fn pending(&self, base_fee: &Wei) -> Vec<Arc<Tx>> {
        let inner = self.inner.lock();
        let mut queues: BTreeMap<Addr, Vec<Arc<Tx>>> = inner
            .by_sender
            .iter()
            .map(|(sender, queue)| {
                (sender.clone(), queue.values().cloned().collect())
            })
            .collect();
        drop(inner);

        let mut out = Vec::new();
        loop {
            let mut best: Option<(U256, Addr)> = None;
            for (sender, queue) in &queues {
                let head = match queue.first() {
                    Some(head) => head,
                    None => continue,
                };
                let tip = tip_of(head, base_fee);
                let better = match &best {
                    None => true,
                    Some((best_tip, best_sender)) => {
                        tip > *best_tip
                            || (tip == *best_tip && sender < best_sender)
                    }
                };
                if better {
                    best = Some((tip, sender.clone()));
                }
            }
            let sender = match best {
                Some((_, sender)) => sender,
                None => break,
            };
            let queue = queues.get_mut(&sender).unwrap_or_else(|| {
                unreachable!("selected sender has a queue")
            });
            out.push(queue.remove(0));
            if queue.is_empty() {
                queues.remove(&sender);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{Bytes, Hash};
    use crate::kv::MemKv;
    use crate::params::ChainConfig;
    use crate::state::StateStore;
    use crate::tx::{TxBlob, TxDynamicFee};

    const CHAIN_ID: u64 = 99;

    fn rules() -> Rules {
        ChainConfig {
            chain_id: CHAIN_ID,
            network_id: 1,
            fork_schedule: Default::default(),
            fee_config: Default::default(),
            precompile_upgrades: vec![],
            alloc: Default::default(),
            genesis_timestamp: 0,
        }
        .rules_at(1, 2)
    }

    fn key(seed: u8) -> libsecp256k1::SecretKey {
        let mut raw = [seed; 32];
        raw[0] = 1;
        libsecp256k1::SecretKey::parse(&raw).unwrap()
    }

    fn key_addr(key: &libsecp256k1::SecretKey) -> Addr {
        let pubkey =
            libsecp256k1::PublicKey::from_secret_key(key).serialize();
        Addr::from_slice(&Hash::hash(&pubkey[1..]).as_bytes()[12..])
    }

    fn dyn_tx(
        key: &libsecp256k1::SecretKey, nonce: u64, tip_gwei: u64,
    ) -> Arc<Tx> {
        Arc::new(
            Tx::sign(
                TxDynamicFee::new(
                    U256::from(CHAIN_ID),
                    nonce,
                    Wei::from(tip_gwei * 1_000_000_000),
                    Wei::from(100_000_000_000u64),
                    21_000,
                    Some(Addr::from([9u8; 20])),
                    Wei::from(1u64),
                    Bytes::empty(),
                    vec![],
                ),
                key,
            )
            .unwrap(),
        )
    }

    fn funded_view(senders: &[Addr]) -> (StateStore, Hash) {
        let store = StateStore::new(Arc::new(MemKv::new()));
        let mut state =
            store.mutable_state_at(Hash::empty_root_hash()).unwrap();
        for sender in senders {
            state
                .set_balance(sender, Wei::from(U256::exp10(22)))
                .unwrap();
        }
        let root = store.commit(&mut state).unwrap();
        (store, root)
    }

    #[test]
    fn priority_order_with_nonce_constraint() {
        let rules = rules();
        let ka = key(2);
        let kb = key(3);
        let a = key_addr(&ka);
        let b = key_addr(&kb);
        let (store, root) = funded_view(&[a.clone(), b.clone()]);
        let view = store.state_at(&root).unwrap();
        let base_fee = Wei::from(25_000_000_000u64);

        let pool = Mempool::new(16);
        // sender A: high-tip tx stuck behind a low-tip nonce 0
        pool.add(dyn_tx(&ka, 0, 1), &rules, &view, &base_fee).unwrap();
        pool.add(dyn_tx(&ka, 1, 50), &rules, &view, &base_fee).unwrap();
        pool.add(dyn_tx(&kb, 0, 10), &rules, &view, &base_fee).unwrap();

        let order = pool.pending(&base_fee);
        assert_eq!(order.len(), 3);
        assert_eq!(order[0].from(), &b);
        // A's nonce 0 must come before its better-paying nonce 1
        assert_eq!(order[1].from(), &a);
        assert_eq!(order[1].nonce(), 0);
        assert_eq!(order[2].nonce(), 1);
    }

    #[test]
    fn replacement_requires_a_bump() {
        let rules = rules();
        let k = key(2);
        let sender = key_addr(&k);
        let (store, root) = funded_view(&[sender]);
        let view = store.state_at(&root).unwrap();
        let base_fee = Wei::from(25_000_000_000u64);

        let pool = Mempool::new(16);
        pool.add(dyn_tx(&k, 0, 10), &rules, &view, &base_fee).unwrap();
        // same fee cap: refused
        let err = pool
            .add(dyn_tx(&k, 0, 12), &rules, &view, &base_fee)
            .unwrap_err();
        assert_eq!(err, AdmissionError::ReplaceUnderpriced);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn stale_nonces_are_evicted() {
        let rules = rules();
        let k = key(2);
        let sender = key_addr(&k);
        let (store, root) = funded_view(&[sender.clone()]);
        let view = store.state_at(&root).unwrap();
        let base_fee = Wei::from(25_000_000_000u64);

        let pool = Mempool::new(16);
        pool.add(dyn_tx(&k, 0, 1), &rules, &view, &base_fee).unwrap();
        pool.add(dyn_tx(&k, 1, 1), &rules, &view, &base_fee).unwrap();

        // a new head where the sender's nonce advanced past 0
        let mut state = store.mutable_state_at(&root).unwrap();
        state.set_nonce(&sender, 1).unwrap();
        let new_root = store.commit(&mut state).unwrap();
        pool.evict_stale(&store.state_at(&new_root).unwrap());
        let remaining = pool.pending(&base_fee);
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].nonce(), 1);
    }

    #[test]
    fn underpriced_and_poor_senders_are_refused() {
        let rules = rules();
        let k = key(2);
        let poor = key(4);
        let (store, root) = funded_view(&[key_addr(&k)]);
        let view = store.state_at(&root).unwrap();
        let base_fee = Wei::from(25_000_000_000u64);
        let pool = Mempool::new(16);

        // fee cap below the chain minimum
        let cheap = Arc::new(
            Tx::sign(
                TxDynamicFee::new(
                    U256::from(CHAIN_ID),
                    0,
                    Wei::from(1u64),
                    Wei::from(2u64),
                    21_000,
                    Some(Addr::from([9u8; 20])),
                    Wei::zero().clone(),
                    Bytes::empty(),
                    vec![],
                ),
                &k,
            )
            .unwrap(),
        );
        assert_eq!(
            pool.add(cheap, &rules, &view, &base_fee).unwrap_err(),
            AdmissionError::Underpriced
        );
        // unfunded sender
        assert_eq!(
            pool.add(dyn_tx(&poor, 0, 10), &rules, &view, &base_fee)
                .unwrap_err(),
            AdmissionError::InsufficientFunds
        );
    }

    #[test]
    fn blob_txs_wait_for_their_fork() {
        let rules = rules();
        assert!(!rules.blob_txs);
        let k = key(2);
        let (store, root) = funded_view(&[key_addr(&k)]);
        let view = store.state_at(&root).unwrap();
        let base_fee = Wei::from(25_000_000_000u64);
        let pool = Mempool::new(16);
        let blob = Arc::new(
            Tx::sign(
                TxBlob::new(
                    U256::from(CHAIN_ID),
                    0,
                    Wei::from(1u64),
                    Wei::from(100_000_000_000u64),
                    21_000,
                    Addr::from([9u8; 20]),
                    Wei::from(0u64),
                    Bytes::empty(),
                    vec![],
                    Wei::from(1u64),
                    vec![Hash::hash(b"blob")],
                ),
                &k,
            )
            .unwrap(),
        );
        assert_eq!(
            pool.add(blob, &rules, &view, &base_fee).unwrap_err(),
            AdmissionError::TxTypeNotSupported
        );
        assert!(pool.is_empty());
    }

    #[test]
    fn full_pool_evicts_only_for_better_tips() {
        let rules = rules();
        let k1 = key(2);
        let k2 = key(3);
        let k3 = key(4);
        let (store, root) =
            funded_view(&[key_addr(&k1), key_addr(&k2), key_addr(&k3)]);
        let view = store.state_at(&root).unwrap();
        let base_fee = Wei::from(25_000_000_000u64);

        let pool = Mempool::new(2);
        pool.add(dyn_tx(&k1, 0, 5), &rules, &view, &base_fee).unwrap();
        pool.add(dyn_tx(&k2, 0, 10), &rules, &view, &base_fee).unwrap();
        // worse than both: refused
        assert_eq!(
            pool.add(dyn_tx(&k3, 0, 1), &rules, &view, &base_fee)
                .unwrap_err(),
            AdmissionError::MempoolFull
        );
        // better than the worst: evicts it
        pool.add(dyn_tx(&k3, 0, 7), &rules, &view, &base_fee).unwrap();
        assert_eq!(pool.len(), 2);
        let order = pool.pending(&base_fee);
        assert_eq!(order[0].from(), &key_addr(&k2));
        assert_eq!(order[1].from(), &key_addr(&k3));
    }
}
