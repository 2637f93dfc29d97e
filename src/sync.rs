//! State-sync client: reconstructs the world state at a pivot root from peer
//! range responses instead of replaying history. A fixed worker pool drives
//! the async network seam; every verified range is staged and the cursor
//! persisted, so an interrupted sync resumes where it stopped. The rebuilt
//! trie root is the final authority: it must equal the pivot root exactly.

use std::collections::HashSet;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::common::Hash;
use crate::error::SyncError;
use crate::kv::{namespace, KvStore, PrefixDb, WriteBatch};
use crate::state::{self, Account};
use crate::trie::{verify_range_proof, Trie};

const PIVOT_KEY: &[u8] = b"sync/pivot";
const CURSOR_KEY: &[u8] = b"sync/cursor";
const ACCOUNT_STAGE_PREFIX: &[u8] = b"sync/a/";
const STORAGE_STAGE_PREFIX: &[u8] = b"sync/s/";

/// Trie keys are keccak images.
const LEAF_KEY_LEN: usize = 32;

/// Whether the gap to the network tip is large enough that state sync beats
/// replaying blocks.
pub fn should_state_sync(
    local_height: u64, network_height: u64, min_blocks: u64,
) -> bool {
    network_height.saturating_sub(local_height) >= min_blocks
}

/// One leaf range of a trie, with boundary inclusion proofs.
pub struct RangeResponse {
    pub keys: Vec<Vec<u8>>,
    pub values: Vec<Vec<u8>>,
    pub proof: Vec<Vec<u8>>,
    /// The trie has more leaves past the last returned key.
    pub more: bool,
}

/// Peer-facing request surface. Implementations own peer selection and are
/// expected to rotate peers across retries of the same request.
#[async_trait]
pub trait NetworkClient: Send + Sync {
    /// Up to `limit` key-ordered leaves of the trie at `root`, starting at
    /// `start`.
    async fn leaf_range(
        &self, root: &Hash, start: &[u8], limit: usize,
    ) -> Result<RangeResponse, SyncError>;

    /// Contract code by hash.
    async fn code(&self, code_hash: &Hash) -> Result<Vec<u8>, SyncError>;
}

#[derive(Clone, Debug)]
pub struct SyncConfig {
    pub workers: usize,
    pub leaves_per_request: usize,
    pub max_retries: usize,
    /// Base delay doubled per retry of the same request.
    pub backoff: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            leaves_per_request: 1024,
            max_retries: 5,
            backoff: Duration::from_millis(100),
        }
    }
}

enum Task {
    Accounts {
        root: Hash,
        start: Vec<u8>,
        attempt: usize,
    },
    Storage {
        account: Vec<u8>,
        root: Hash,
        start: Vec<u8>,
        attempt: usize,
    },
    Code {
        hash: Hash,
        attempt: usize,
    },
}

enum Outcome {
    Accounts {
        start: Vec<u8>,
        attempt: usize,
        result: Result<RangeResponse, SyncError>,
    },
    Storage {
        account: Vec<u8>,
        root: Hash,
        start: Vec<u8>,
        attempt: usize,
        result: Result<RangeResponse, SyncError>,
    },
    Code {
        hash: Hash,
        attempt: usize,
        result: Result<Vec<u8>, SyncError>,
    },
}

/// Lexicographic successor of a fixed-width key; `None` past the key space.
fn next_key(key: &[u8]) -> Option<Vec<u8>> {
    let mut next = key.to_vec();
    for byte in next.iter_mut().rev() {
        if *byte < 0xff {
            *byte += 1;
            return Some(next)
        }
        *byte = 0;
    }
    None
}

fn staged_key(prefix: &[u8], suffix: &[u8]) -> Vec<u8> {
    let mut key = prefix.to_vec();
    key.extend_from_slice(suffix);
    key
}

pub struct StateSyncClient {
    kv: Arc<dyn KvStore>,
    meta: PrefixDb,
    network: Arc<dyn NetworkClient>,
    config: SyncConfig,
}

impl StateSyncClient {
    pub fn new(
        kv: Arc<dyn KvStore>, network: Arc<dyn NetworkClient>,
        config: SyncConfig,
    ) -> Self {
        Self {
            meta: PrefixDb::new(kv.clone(), namespace::META),
            kv,
            network,
            config,
        }
    }

    /// Run a sync to `pivot_root`, blocking until completion or failure.
    /// `escalate` is consulted when a request exhausts its retries; a new
    /// pivot continues from the persisted cursor, `None` gives up. On
    /// success the reconstructed state is live under the state namespace and
    /// the staging area is cleared.
    pub fn sync(
        &self, pivot_root: &Hash,
        escalate: &mut dyn FnMut() -> Option<Hash>,
    ) -> Result<Hash, SyncError> {
        let mut pivot = pivot_root.clone();
        let stored_pivot = self.meta.get(PIVOT_KEY).map(|raw| Hash::from_slice(&raw));
        let cursor = match stored_pivot {
            Some(stored) if stored == pivot => self
                .meta
                .get(CURSOR_KEY)
                .unwrap_or_else(|| vec![0u8; LEAF_KEY_LEN]),
            _ => {
                self.clear_staging();
                vec![0u8; LEAF_KEY_LEN]
            }
        };
        self.meta.put(PIVOT_KEY, pivot.as_bytes());
        log::info!(
            "state sync to {} starting at cursor {}",
            pivot,
            hex::encode(&cursor)
        );

        let (task_tx, task_rx) = mpsc::channel::<Task>();
        let (out_tx, out_rx) = mpsc::channel::<Outcome>();
        let task_rx = Arc::new(Mutex::new(task_rx));
        let mut handles = Vec::with_capacity(self.config.workers);
        for _ in 0..self.config.workers {
            let task_rx = task_rx.clone();
            let out_tx = out_tx.clone();
            let network = self.network.clone();
            let limit = self.config.leaves_per_request;
            let backoff = self.config.backoff;
            handles.push(thread::spawn(move || {
                worker_loop(task_rx, out_tx, network, limit, backoff)
            }));
        }
        drop(out_tx);

        let result = self.drive(
            &mut pivot,
            cursor,
            &task_tx,
            &out_rx,
            escalate,
        );
        drop(task_tx);
        for handle in handles {
            let _ = handle.join();
        }
        result?;

        let root = self.promote(&pivot)?;
        self.clear_staging();
        log::info!("state sync to {} complete", root);
        Ok(root)
    }

    /// Dispatch tasks and fold outcomes until the whole pivot state is
    /// staged.
    fn drive(
        &self, pivot: &mut Hash, cursor: Vec<u8>,
        task_tx: &mpsc::Sender<Task>, out_rx: &mpsc::Receiver<Outcome>,
        escalate: &mut dyn FnMut() -> Option<Hash>,
    ) -> Result<(), SyncError> {
        let mut outstanding = 0usize;
        let mut requested_code: HashSet<Hash> = HashSet::new();
        let send = |task: Task, outstanding: &mut usize| {
            // worker threads only exit once the sender is dropped
            if task_tx.send(task).is_ok() {
                *outstanding += 1;
            }
        };
        // storage and code spawned for accounts staged before an
        // interruption may never have landed; restart those fetches, the
        // staging writes are idempotent
        if cursor.iter().any(|b| *b != 0) {
            for (key, value) in self.meta.scan_prefix(ACCOUNT_STAGE_PREFIX) {
                let account: Account = match rlp::decode(&value) {
                    Ok(account) => account,
                    Err(_) => return Err(SyncError::InvalidProof),
                };
                if account.has_code()
                    && requested_code.insert(account.code_hash.clone())
                {
                    send(
                        Task::Code {
                            hash: account.code_hash,
                            attempt: 0,
                        },
                        &mut outstanding,
                    );
                }
                if &account.storage_root != Hash::empty_root_hash() {
                    send(
                        Task::Storage {
                            account: key[ACCOUNT_STAGE_PREFIX.len()..]
                                .to_vec(),
                            root: account.storage_root,
                            start: vec![0u8; LEAF_KEY_LEN],
                            attempt: 0,
                        },
                        &mut outstanding,
                    );
                }
            }
        }
        send(
            Task::Accounts {
                root: pivot.clone(),
                start: cursor,
                attempt: 0,
            },
            &mut outstanding,
        );

        while outstanding > 0 {
            let outcome =
                out_rx.recv().map_err(|_| SyncError::Interrupted)?;
            outstanding -= 1;
            match outcome {
                Outcome::Accounts {
                    start,
                    attempt,
                    result,
                } => {
                    let response = match self.check_range(
                        pivot.clone(),
                        result,
                        attempt,
                        escalate,
                        pivot,
                    )? {
                        Ok(response) => response,
                        Err(retry_attempt) => {
                            send(
                                Task::Accounts {
                                    root: pivot.clone(),
                                    start,
                                    attempt: retry_attempt,
                                },
                                &mut outstanding,
                            );
                            continue
                        }
                    };
                    let mut batch = WriteBatch::new();
                    for (key, value) in
                        response.keys.iter().zip(&response.values)
                    {
                        batch.put(
                            &staged_key(ACCOUNT_STAGE_PREFIX, key),
                            value,
                        );
                        let account: Account = match rlp::decode(value) {
                            Ok(account) => account,
                            Err(_) => return Err(SyncError::InvalidProof),
                        };
                        if account.has_code()
                            && requested_code.insert(account.code_hash.clone())
                        {
                            send(
                                Task::Code {
                                    hash: account.code_hash,
                                    attempt: 0,
                                },
                                &mut outstanding,
                            );
                        }
                        if &account.storage_root != Hash::empty_root_hash() {
                            send(
                                Task::Storage {
                                    account: key.clone(),
                                    root: account.storage_root,
                                    start: vec![0u8; LEAF_KEY_LEN],
                                    attempt: 0,
                                },
                                &mut outstanding,
                            );
                        }
                    }
                    self.meta.write(batch);
                    if response.more {
                        if let Some(last) = response.keys.last() {
                            if let Some(next) = next_key(last) {
                                self.meta.put(CURSOR_KEY, &next);
                                send(
                                    Task::Accounts {
                                        root: pivot.clone(),
                                        start: next,
                                        attempt: 0,
                                    },
                                    &mut outstanding,
                                );
                            }
                        }
                    }
                }
                Outcome::Storage {
                    account,
                    root,
                    start,
                    attempt,
                    result,
                } => {
                    let response = match self.check_range(
                        root.clone(),
                        result,
                        attempt,
                        escalate,
                        pivot,
                    )? {
                        Ok(response) => response,
                        Err(retry_attempt) => {
                            send(
                                Task::Storage {
                                    account,
                                    root,
                                    start,
                                    attempt: retry_attempt,
                                },
                                &mut outstanding,
                            );
                            continue
                        }
                    };
                    let mut batch = WriteBatch::new();
                    for (key, value) in
                        response.keys.iter().zip(&response.values)
                    {
                        let mut suffix = account.clone();
                        suffix.extend_from_slice(key);
                        batch.put(
                            &staged_key(STORAGE_STAGE_PREFIX, &suffix),
                            value,
                        );
                    }
                    self.meta.write(batch);
                    if response.more {
                        if let Some(next) =
                            response.keys.last().and_then(|k| next_key(k))
                        {
                            send(
                                Task::Storage {
                                    account,
                                    root,
                                    start: next,
                                    attempt: 0,
                                },
                                &mut outstanding,
                            );
                        }
                    }
                }
                Outcome::Code {
                    hash,
                    attempt,
                    result,
                } => {
                    match result {
                        Ok(code) if Hash::hash(&code) == hash => {
                            // content-addressed, safe to land directly
                            PrefixDb::new(self.kv.clone(), namespace::STATE)
                                .put(&state::code_key(&hash), &code);
                        }
                        _ => {
                            let retry = self.next_attempt(
                                attempt, escalate, pivot,
                            )?;
                            send(
                                Task::Code {
                                    hash,
                                    attempt: retry,
                                },
                                &mut outstanding,
                            );
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Fold one range result: verified response, or the attempt number for a
    /// retry, or a hard failure once escalation gives up.
    #[allow(clippy::type_complexity)]
    fn check_range(
        &self, root: Hash, result: Result<RangeResponse, SyncError>,
        attempt: usize, escalate: &mut dyn FnMut() -> Option<Hash>,
        pivot: &mut Hash,
    ) -> Result<Result<RangeResponse, usize>, SyncError> {
        let verified = result.and_then(|response| {
            verify_range_proof(
                &root,
                &response.keys,
                &response.values,
                &response.proof,
            )
            .map_err(|_| SyncError::InvalidProof)?;
            Ok(response)
        });
        match verified {
            Ok(response) => Ok(Ok(response)),
            Err(e) => {
                log::debug!("range under {} failed: {}", root, e);
                Ok(Err(self.next_attempt(attempt, escalate, pivot)?))
            }
        }
    }

    fn next_attempt(
        &self, attempt: usize, escalate: &mut dyn FnMut() -> Option<Hash>,
        pivot: &mut Hash,
    ) -> Result<usize, SyncError> {
        if attempt + 1 < self.config.max_retries {
            return Ok(attempt + 1)
        }
        match escalate() {
            Some(new_pivot) => {
                log::warn!(
                    "sync stalled, escalating to new pivot {}",
                    new_pivot
                );
                *pivot = new_pivot;
                self.meta.put(PIVOT_KEY, pivot.as_bytes());
                Ok(0)
            }
            None => Err(SyncError::Stalled(attempt + 1)),
        }
    }

    /// Rebuild the account and storage tries from the staged leaves into the
    /// state namespace. The recomputed roots are checked against the pivot
    /// and the per-account declarations.
    fn promote(&self, pivot: &Hash) -> Result<Hash, SyncError> {
        let state_db = PrefixDb::new(self.kv.clone(), namespace::STATE);
        let storage_leaves: Vec<(Vec<u8>, Vec<u8>)> = self
            .meta
            .scan_prefix(STORAGE_STAGE_PREFIX)
            .into_iter()
            .map(|(k, v)| (k[STORAGE_STAGE_PREFIX.len()..].to_vec(), v))
            .collect();
        let accounts: Vec<(Vec<u8>, Vec<u8>)> = self
            .meta
            .scan_prefix(ACCOUNT_STAGE_PREFIX)
            .into_iter()
            .map(|(k, v)| (k[ACCOUNT_STAGE_PREFIX.len()..].to_vec(), v))
            .collect();

        let mut batch = WriteBatch::new();
        // storage tries first, grouped by the owning account key
        let mut pos = 0;
        while pos < storage_leaves.len() {
            let account_key = storage_leaves[pos].0[..LEAF_KEY_LEN].to_vec();
            let mut trie = Trie::new(&state_db, None);
            let mut end = pos;
            while end < storage_leaves.len()
                && storage_leaves[end].0[..LEAF_KEY_LEN] == account_key[..]
            {
                let (key, value) = &storage_leaves[end];
                trie.insert(&key[LEAF_KEY_LEN..], value)
                    .map_err(|_| SyncError::InvalidProof)?;
                end += 1;
            }
            let root = trie.commit(&mut batch);
            let declared = accounts
                .iter()
                .find(|(k, _)| k == &account_key)
                .and_then(|(_, v)| rlp::decode::<Account>(v).ok())
                .map(|a| a.storage_root);
            if declared.as_ref() != Some(&root) {
                return Err(SyncError::RootMismatch {
                    got: root,
                    want: declared
                        .unwrap_or_else(|| Hash::empty_root_hash().clone()),
                })
            }
            pos = end;
        }

        let mut trie = Trie::new(&state_db, None);
        for (key, value) in &accounts {
            trie.insert(key, value).map_err(|_| SyncError::InvalidProof)?;
        }
        let root = trie.commit(&mut batch);
        if &root != pivot {
            return Err(SyncError::RootMismatch {
                got: root,
                want: pivot.clone(),
            })
        }
        state_db.write(batch);
        Ok(root)
    }

    fn clear_staging(&self) {
        let mut batch = WriteBatch::new();
        for (key, _) in self.meta.scan_prefix(ACCOUNT_STAGE_PREFIX) {
            batch.delete(&key);
        }
        for (key, _) in self.meta.scan_prefix(STORAGE_STAGE_PREFIX) {
            batch.delete(&key);
        }
        batch.delete(CURSOR_KEY);
        batch.delete(PIVOT_KEY);
        self.meta.write(batch);
    }
}

fn worker_loop(
    task_rx: Arc<Mutex<mpsc::Receiver<Task>>>, out_tx: mpsc::Sender<Outcome>,
    network: Arc<dyn NetworkClient>, limit: usize, backoff: Duration,
) {
    loop {
        let task = {
            let rx = task_rx.lock();
            match rx.recv() {
                Ok(task) => task,
                Err(_) => return,
            }
        };
        let attempt = match &task {
            Task::Accounts { attempt, .. }
            | Task::Storage { attempt, .. }
            | Task::Code { attempt, .. } => *attempt,
        };
        if attempt > 0 {
            thread::sleep(backoff * (1 << attempt.min(8)) as u32);
        }
        let outcome = match task {
            Task::Accounts {
                root,
                start,
                attempt,
            } => {
                let result = futures::executor::block_on(
                    network.leaf_range(&root, &start, limit),
                );
                Outcome::Accounts {
                    start,
                    attempt,
                    result,
                }
            }
            Task::Storage {
                account,
                root,
                start,
                attempt,
            } => {
                let result = futures::executor::block_on(
                    network.leaf_range(&root, &start, limit),
                );
                Outcome::Storage {
                    account,
                    root,
                    start,
                    attempt,
                    result,
                }
            }
            Task::Code { hash, attempt } => {
                let result =
                    futures::executor::block_on(network.code(&hash));
                Outcome::Code {
                    hash,
                    attempt,
                    result,
                }
            }
        };
        if out_tx.send(outcome).is_err() {
            return
        }
    }
}
