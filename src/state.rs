//! Versioned world state over the Merkle-Patricia trie. Reads and writes go
//! through overlay deltas: a snapshot pushes a fresh overlay, a rollback
//! drops overlays, and a commit squashes the stack and folds it into the
//! trie. Absent accounts read as canonical empty values; an unknown root is
//! [StateError::NotFound] and a missing trie node is
//! [StateError::Corrupted].

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use replace_with::replace_with_or_abort;
use rlp_derive::{RlpDecodable, RlpEncodable};

use crate::common::{Addr, Bytes, Hash, Log, Wei, U256};
use crate::error::StateError;
use crate::kv::{namespace, KvStore, PrefixDb, WriteBatch};
use crate::params::GenesisAccount;
use crate::trie::Trie;

const CODE_PREFIX: &[u8] = b"code:";

pub(crate) fn code_key(code_hash: &Hash) -> Vec<u8> {
    let mut key = CODE_PREFIX.to_vec();
    key.extend_from_slice(code_hash.as_bytes());
    key
}

fn slot_value_encode(value: &Hash) -> Vec<u8> {
    let v = U256::from_big_endian(value.as_bytes());
    rlp::encode(&crate::common::U256RLP(v)).to_vec()
}

fn slot_value_decode(raw: &[u8], root: &Hash) -> Result<Hash, StateError> {
    let v: crate::common::U256RLP =
        rlp::decode(raw).map_err(|_| StateError::Corrupted(root.clone()))?;
    let mut bytes = [0u8; 32];
    v.0.to_big_endian(&mut bytes);
    Ok(Hash::from_slice(&bytes))
}

/// World-state account record, RLP-encoded at `keccak(address)` in the
/// account trie.
#[derive(Clone, Debug, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct Account {
    pub nonce: u64,
    pub balance: Wei,
    pub storage_root: Hash,
    pub code_hash: Hash,
}

impl Account {
    pub fn empty() -> Self {
        Self {
            nonce: 0,
            balance: Wei::zero().clone(),
            storage_root: Hash::empty_root_hash().clone(),
            code_hash: Hash::empty_bytes_hash().clone(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.nonce == 0
            && self.balance.is_zero()
            && &self.code_hash == Hash::empty_bytes_hash()
            && &self.storage_root == Hash::empty_root_hash()
    }

    pub fn has_code(&self) -> bool {
        &self.code_hash != Hash::empty_bytes_hash()
    }
}

fn read_account(
    db: &PrefixDb, root: &Hash, addr: &Addr,
) -> Result<Option<Account>, StateError> {
    let trie = Trie::new(db, Some(root));
    match trie.get(Hash::hash(addr.as_bytes()).as_bytes())? {
        Some(raw) => rlp::decode(&raw)
            .map(Some)
            .map_err(|_| StateError::Corrupted(root.clone())),
        None => Ok(None),
    }
}

fn read_storage(
    db: &PrefixDb, storage_root: &Hash, slot: &Hash,
) -> Result<Hash, StateError> {
    let trie = Trie::new(db, Some(storage_root));
    match trie.get(Hash::hash(slot.as_bytes()).as_bytes())? {
        Some(raw) => slot_value_decode(&raw, storage_root),
        None => Ok(Hash::zero().clone()),
    }
}

/// Read-only view of the state at a committed root.
pub struct StateView {
    db: PrefixDb,
    root: Hash,
}

impl StateView {
    pub fn root(&self) -> &Hash {
        &self.root
    }

    pub fn account(&self, addr: &Addr) -> Result<Account, StateError> {
        Ok(read_account(&self.db, &self.root, addr)?
            .unwrap_or_else(Account::empty))
    }

    pub fn nonce(&self, addr: &Addr) -> Result<u64, StateError> {
        Ok(self.account(addr)?.nonce)
    }

    pub fn balance(&self, addr: &Addr) -> Result<Wei, StateError> {
        Ok(self.account(addr)?.balance)
    }

    pub fn storage(&self, addr: &Addr, slot: &Hash) -> Result<Hash, StateError> {
        match read_account(&self.db, &self.root, addr)? {
            Some(acct) => read_storage(&self.db, &acct.storage_root, slot),
            None => Ok(Hash::zero().clone()),
        }
    }

    pub fn code(&self, addr: &Addr) -> Result<Bytes, StateError> {
        let acct = self.account(addr)?;
        if !acct.has_code() {
            return Ok(Bytes::empty())
        }
        self.db
            .get(&code_key(&acct.code_hash))
            .map(Bytes::from)
            .ok_or(StateError::Corrupted(acct.code_hash))
    }
}

/// Observer of balance and nonce transitions, used by indexing hooks.
pub trait StateTracer: Send {
    fn on_balance_change(&mut self, _addr: &Addr, _prev: &Wei, _next: &Wei) {}
    fn on_nonce_change(&mut self, _addr: &Addr, _prev: u64, _next: u64) {}
}

#[derive(Default, Clone)]
struct Delta {
    accounts: HashMap<Addr, Option<Account>>,
    storage: HashMap<Addr, HashMap<Hash, Hash>>,
    code: HashMap<Hash, Bytes>,
    logs: Vec<Log>,
}

impl Delta {
    fn absorb(&mut self, newer: Delta) {
        self.accounts.extend(newer.accounts);
        for (addr, slots) in newer.storage {
            self.storage.entry(addr).or_default().extend(slots);
        }
        self.code.extend(newer.code);
        self.logs.extend(newer.logs);
    }
}

/// Writable state anchored at a committed base root. All mutations land in
/// the top overlay; the base is never touched until
/// [StateStore::commit].
pub struct MutableState {
    db: PrefixDb,
    base_root: Hash,
    layers: Vec<Delta>,
    tracer: Option<Box<dyn StateTracer>>,
}

impl MutableState {
    fn new(db: PrefixDb, base_root: Hash) -> Self {
        Self {
            db,
            base_root,
            layers: vec![Delta::default()],
            tracer: None,
        }
    }

    pub fn base_root(&self) -> &Hash {
        &self.base_root
    }

    pub fn set_tracer(&mut self, tracer: Box<dyn StateTracer>) {
        self.tracer = Some(tracer);
    }

    fn overlay_account(&self, addr: &Addr) -> Option<Option<Account>> {
        for layer in self.layers.iter().rev() {
            if let Some(entry) = layer.accounts.get(addr) {
                return Some(entry.clone())
            }
        }
        None
    }

    fn account(&self, addr: &Addr) -> Result<Option<Account>, StateError> {
        match self.overlay_account(addr) {
            Some(entry) => Ok(entry),
            None => read_account(&self.db, &self.base_root, addr),
        }
    }

    fn account_or_empty(&self, addr: &Addr) -> Result<Account, StateError> {
        Ok(self.account(addr)?.unwrap_or_else(Account::empty))
    }

    fn top(&mut self) -> &mut Delta {
        // layers is never empty
        self.layers.last_mut().unwrap()
    }

    pub fn exists(&self, addr: &Addr) -> Result<bool, StateError> {
        Ok(self.account(addr)?.is_some())
    }

    pub fn nonce(&self, addr: &Addr) -> Result<u64, StateError> {
        Ok(self.account_or_empty(addr)?.nonce)
    }

    pub fn set_nonce(&mut self, addr: &Addr, nonce: u64) -> Result<(), StateError> {
        let mut acct = self.account_or_empty(addr)?;
        if let Some(tracer) = self.tracer.as_mut() {
            tracer.on_nonce_change(addr, acct.nonce, nonce);
        }
        acct.nonce = nonce;
        self.top().accounts.insert(addr.clone(), Some(acct));
        Ok(())
    }

    pub fn balance(&self, addr: &Addr) -> Result<Wei, StateError> {
        Ok(self.account_or_empty(addr)?.balance)
    }

    pub fn set_balance(&mut self, addr: &Addr, balance: Wei) -> Result<(), StateError> {
        let mut acct = self.account_or_empty(addr)?;
        if let Some(tracer) = self.tracer.as_mut() {
            tracer.on_balance_change(addr, &acct.balance, &balance);
        }
        acct.balance = balance;
        self.top().accounts.insert(addr.clone(), Some(acct));
        Ok(())
    }

    pub fn code_hash(&self, addr: &Addr) -> Result<Hash, StateError> {
        Ok(self.account_or_empty(addr)?.code_hash)
    }

    pub fn code(&self, addr: &Addr) -> Result<Bytes, StateError> {
        let acct = self.account_or_empty(addr)?;
        if !acct.has_code() {
            return Ok(Bytes::empty())
        }
        for layer in self.layers.iter().rev() {
            if let Some(code) = layer.code.get(&acct.code_hash) {
                return Ok(code.clone())
            }
        }
        self.db
            .get(&code_key(&acct.code_hash))
            .map(Bytes::from)
            .ok_or(StateError::Corrupted(acct.code_hash))
    }

    pub fn set_code(&mut self, addr: &Addr, code: Bytes) -> Result<(), StateError> {
        let mut acct = self.account_or_empty(addr)?;
        let code_hash = Hash::hash(&code);
        acct.code_hash = code_hash.clone();
        let top = self.top();
        top.code.insert(code_hash, code);
        top.accounts.insert(addr.clone(), Some(acct));
        Ok(())
    }

    pub fn storage(&self, addr: &Addr, slot: &Hash) -> Result<Hash, StateError> {
        for layer in self.layers.iter().rev() {
            if let Some(value) =
                layer.storage.get(addr).and_then(|slots| slots.get(slot))
            {
                return Ok(value.clone())
            }
            // a delete or overwrite of the whole account hides base storage
            if let Some(entry) = layer.accounts.get(addr) {
                if entry.is_none() {
                    return Ok(Hash::zero().clone())
                }
            }
        }
        match read_account(&self.db, &self.base_root, addr)? {
            Some(acct) => read_storage(&self.db, &acct.storage_root, slot),
            None => Ok(Hash::zero().clone()),
        }
    }

    pub fn set_storage(
        &mut self, addr: &Addr, slot: Hash, value: Hash,
    ) -> Result<(), StateError> {
        if self.account(addr)?.is_none() {
            self.top().accounts.insert(addr.clone(), Some(Account::empty()));
        }
        self.top()
            .storage
            .entry(addr.clone())
            .or_default()
            .insert(slot, value);
        Ok(())
    }

    /// Remove an account from the trie. Only empty accounts may be deleted;
    /// a non-empty account is left untouched.
    pub fn delete_if_empty(&mut self, addr: &Addr) -> Result<bool, StateError> {
        let deletable = match self.account(addr)? {
            Some(acct) => acct.is_empty(),
            None => false,
        };
        if deletable {
            self.top().accounts.insert(addr.clone(), None);
        }
        Ok(deletable)
    }

    pub fn add_log(&mut self, log: Log) {
        self.top().logs.push(log);
    }

    pub fn log_count(&self) -> usize {
        self.layers.iter().map(|l| l.logs.len()).sum()
    }

    /// Squash everything and drain the accumulated logs. Used once per
    /// transaction when building the receipt.
    pub fn take_logs(&mut self) -> Vec<Log> {
        self.consolidate();
        std::mem::take(&mut self.layers[0].logs)
    }

    /// Open a new overlay. The returned index is the rollback target.
    pub fn snapshot(&mut self) -> usize {
        self.layers.push(Delta::default());
        self.layers.len() - 1
    }

    /// Drop every overlay at or above `snapshot`, discarding its writes and
    /// logs.
    pub fn rollback_to(&mut self, snapshot: usize) {
        debug_assert!(snapshot >= 1);
        self.layers.truncate(snapshot.max(1));
    }

    /// Squash all overlays into one. Keeps reads from walking a long layer
    /// stack between transactions.
    pub fn consolidate(&mut self) {
        if self.layers.len() <= 1 {
            return
        }
        replace_with_or_abort(&mut self.layers, |layers| {
            let mut iter = layers.into_iter();
            let mut bottom = iter.next().unwrap();
            for layer in iter {
                bottom.absorb(layer);
            }
            vec![bottom]
        });
    }
}

/// Retention policy for [StateStore::prune].
pub enum PrunePolicy {
    /// Keep every node reachable from the listed roots.
    HashScheme { keep: Vec<Hash> },
    /// Keep only the latest root.
    PathScheme { latest: Hash },
}

/// Owner of the state trie namespace. Hands out views and writable states
/// and folds committed deltas into the trie.
pub struct StateStore {
    db: PrefixDb,
}

impl StateStore {
    pub fn new(backend: Arc<dyn KvStore>) -> Self {
        Self {
            db: PrefixDb::new(backend, namespace::STATE),
        }
    }

    fn check_root(&self, root: &Hash) -> Result<(), StateError> {
        if root == Hash::empty_root_hash() {
            return Ok(())
        }
        if self.db.get(root.as_bytes()).is_none() {
            return Err(StateError::NotFound(root.clone()))
        }
        Ok(())
    }

    pub fn state_at(&self, root: &Hash) -> Result<StateView, StateError> {
        self.check_root(root)?;
        Ok(StateView {
            db: self.db.clone(),
            root: root.clone(),
        })
    }

    pub fn mutable_state_at(
        &self, root: &Hash,
    ) -> Result<MutableState, StateError> {
        self.check_root(root)?;
        Ok(MutableState::new(self.db.clone(), root.clone()))
    }

    /// Fold the accumulated delta into the trie and persist it atomically.
    /// Identical deltas commit to identical roots and node sets, so a replay
    /// of the same commit is a no-op. The state is re-anchored at the new
    /// root afterwards.
    pub fn commit(&self, state: &mut MutableState) -> Result<Hash, StateError> {
        state.consolidate();
        let delta = &state.layers[0];
        let mut batch = WriteBatch::new();
        let mut acct_trie = Trie::new(&self.db, Some(&state.base_root));

        let mut touched: HashSet<Addr> =
            delta.accounts.keys().cloned().collect();
        touched.extend(delta.storage.keys().cloned());

        for addr in touched {
            let account = match delta.accounts.get(&addr) {
                Some(entry) => entry.clone(),
                None => read_account(&self.db, &state.base_root, &addr)?,
            };
            let key = Hash::hash(addr.as_bytes());
            let mut account = match account {
                Some(acct) => acct,
                None => {
                    acct_trie.remove(key.as_bytes())?;
                    continue
                }
            };
            if let Some(slots) = delta.storage.get(&addr) {
                let base_storage_root =
                    match read_account(&self.db, &state.base_root, &addr)? {
                        Some(base) => base.storage_root,
                        None => Hash::empty_root_hash().clone(),
                    };
                let mut storage_trie =
                    Trie::new(&self.db, Some(&base_storage_root));
                for (slot, value) in slots {
                    let slot_key = Hash::hash(slot.as_bytes());
                    if value == Hash::zero() {
                        storage_trie.remove(slot_key.as_bytes())?;
                    } else {
                        storage_trie.insert(
                            slot_key.as_bytes(),
                            &slot_value_encode(value),
                        )?;
                    }
                }
                account.storage_root = storage_trie.commit(&mut batch);
            }
            acct_trie.insert(key.as_bytes(), &rlp::encode(&account))?;
        }

        for (code_hash, code) in &delta.code {
            batch.put(&code_key(code_hash), code);
        }

        let root = acct_trie.commit(&mut batch);
        self.db.write(batch);
        state.base_root = root.clone();
        state.layers = vec![Delta::default()];
        Ok(root)
    }

    /// Apply the genesis allocations on top of the empty root.
    pub fn commit_genesis(
        &self, alloc: &BTreeMap<Addr, GenesisAccount>,
    ) -> Result<Hash, StateError> {
        let mut state = self.mutable_state_at(Hash::empty_root_hash())?;
        for (addr, genesis) in alloc {
            state.set_balance(addr, genesis.balance.clone())?;
            if genesis.nonce != 0 {
                state.set_nonce(addr, genesis.nonce)?;
            }
            if let Some(code) = &genesis.code {
                state.set_code(addr, code.clone())?;
            }
            for (slot, value) in &genesis.storage {
                state.set_storage(addr, slot.clone(), value.clone())?;
            }
        }
        self.commit(&mut state)
    }

    /// Drop every trie node and code blob not reachable from the retained
    /// roots. Returns the number of deleted entries.
    pub fn prune(&self, policy: &PrunePolicy) -> Result<usize, StateError> {
        let roots: Vec<&Hash> = match policy {
            PrunePolicy::HashScheme { keep } => keep.iter().collect(),
            PrunePolicy::PathScheme { latest } => vec![latest],
        };
        let mut live: HashSet<Vec<u8>> = HashSet::new();
        for root in roots {
            if root == Hash::empty_root_hash() {
                continue
            }
            let acct_trie = Trie::new(&self.db, Some(root));
            for node in acct_trie.node_hashes()? {
                live.insert(node.as_bytes().to_vec());
            }
            for (_, raw) in acct_trie.iter()? {
                let acct: Account = rlp::decode(&raw)
                    .map_err(|_| StateError::Corrupted(root.clone()))?;
                if &acct.storage_root != Hash::empty_root_hash() {
                    let storage_trie =
                        Trie::new(&self.db, Some(&acct.storage_root));
                    for node in storage_trie.node_hashes()? {
                        live.insert(node.as_bytes().to_vec());
                    }
                }
                if acct.has_code() {
                    live.insert(code_key(&acct.code_hash));
                }
            }
        }
        let mut deleted = 0;
        for (key, _) in self.db.scan_prefix(&[]) {
            let prunable = key.len() == 32 || key.starts_with(CODE_PREFIX);
            if prunable && !live.contains(&key) {
                self.db.delete(&key);
                deleted += 1;
            }
        }
        Ok(deleted)
    }
}

/// Slot that carries the sparse multicoin balance of `coin_id` for an
/// account. Absent slots read as zero.
pub fn multicoin_slot(coin_id: &Hash) -> Hash {
    let mut buf = Vec::with_capacity(34);
    buf.extend_from_slice(b"mc");
    buf.extend_from_slice(coin_id.as_bytes());
    Hash::hash(&buf)
}

impl MutableState {
    pub fn multicoin_balance(
        &self, addr: &Addr, coin_id: &Hash,
    ) -> Result<Wei, StateError> {
        let raw = self.storage(addr, &multicoin_slot(coin_id))?;
        Ok(Wei::from(U256::from_big_endian(raw.as_bytes())))
    }

    pub fn set_multicoin_balance(
        &mut self, addr: &Addr, coin_id: &Hash, balance: &Wei,
    ) -> Result<(), StateError> {
        let mut bytes = [0u8; 32];
        balance.to_big_endian(&mut bytes);
        self.set_storage(addr, multicoin_slot(coin_id), Hash::from_slice(&bytes))
    }
}
