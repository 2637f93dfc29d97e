//! The verified-block tree rooted at the last accepted block, and the
//! durable store for accepted chain data. Acceptance advances the root and
//! prunes every competing branch.

use std::collections::HashMap;
use std::sync::Arc;

use crate::block::{Block, Header, Receipt};
use crate::common::{Hash, U256};
use crate::error::VmError;
use crate::kv::{namespace, KvStore, PrefixDb, WriteBatch};

const HEADER_PREFIX: &[u8] = b"h/";
const BODY_PREFIX: &[u8] = b"b/";
const RECEIPTS_PREFIX: &[u8] = b"r/";
const CANONICAL_PREFIX: &[u8] = b"n/";
const LAST_ACCEPTED_KEY: &[u8] = b"lastAccepted";

fn keyed(prefix: &[u8], suffix: &[u8]) -> Vec<u8> {
    let mut key = prefix.to_vec();
    key.extend_from_slice(suffix);
    key
}

/// Durable storage for accepted blocks: headers, bodies, receipts, and the
/// canonical number index in the chain namespace; the last-accepted pointer
/// in metadata.
pub struct BlockStore {
    chain: PrefixDb,
    meta: PrefixDb,
    chain_id: U256,
}

impl BlockStore {
    pub fn new(kv: Arc<dyn KvStore>, chain_id: U256) -> Self {
        Self {
            chain: PrefixDb::new(kv.clone(), namespace::CHAIN),
            meta: PrefixDb::new(kv, namespace::META),
            chain_id,
        }
    }

    /// Persist one accepted block with its receipts and advance the
    /// last-accepted pointer. The chain data lands in one atomic batch; the
    /// pointer flips only after the data is durable.
    pub fn put_accepted(&self, block: &Block, receipts: &[Receipt]) {
        let hash = block.hash();
        let mut batch = WriteBatch::new();
        batch.put(
            &keyed(HEADER_PREFIX, hash.as_bytes()),
            &rlp::encode(block.header()),
        );
        batch.put(&keyed(BODY_PREFIX, hash.as_bytes()), &block.encode());
        batch.put(
            &keyed(RECEIPTS_PREFIX, hash.as_bytes()),
            &encode_receipts(receipts),
        );
        batch.put(
            &keyed(CANONICAL_PREFIX, &block.number().to_be_bytes()),
            hash.as_bytes(),
        );
        self.chain.write(batch);
        self.meta.put(LAST_ACCEPTED_KEY, hash.as_bytes());
    }

    pub fn header(&self, hash: &Hash) -> Option<Header> {
        let raw = self.chain.get(&keyed(HEADER_PREFIX, hash.as_bytes()))?;
        rlp::decode(&raw).ok()
    }

    pub fn block(&self, hash: &Hash) -> Option<Block> {
        let raw = self.chain.get(&keyed(BODY_PREFIX, hash.as_bytes()))?;
        Block::decode(&raw, &self.chain_id).ok()
    }

    pub fn receipts(&self, hash: &Hash) -> Option<Vec<Receipt>> {
        let raw =
            self.chain.get(&keyed(RECEIPTS_PREFIX, hash.as_bytes()))?;
        decode_receipts(&raw).ok()
    }

    pub fn canonical_hash(&self, number: u64) -> Option<Hash> {
        self.chain
            .get(&keyed(CANONICAL_PREFIX, &number.to_be_bytes()))
            .map(|raw| Hash::from_slice(&raw))
    }

    pub fn last_accepted(&self) -> Option<Hash> {
        self.meta
            .get(LAST_ACCEPTED_KEY)
            .map(|raw| Hash::from_slice(&raw))
    }
}

fn encode_receipts(receipts: &[Receipt]) -> Vec<u8> {
    let mut s = rlp::RlpStream::new_list(receipts.len());
    for receipt in receipts {
        s.append(&receipt.encoded().as_slice());
    }
    s.out().to_vec()
}

fn decode_receipts(bytes: &[u8]) -> Result<Vec<Receipt>, VmError> {
    let rlp = rlp::Rlp::new(bytes);
    let mut out = Vec::new();
    for item in rlp.iter() {
        let raw = item.data().map_err(|e| {
            VmError::InvalidEncoding(format!("receipt list: {}", e))
        })?;
        out.push(Receipt::decode(raw)?);
    }
    Ok(out)
}

struct Entry {
    block: Arc<Block>,
    receipts: Vec<Receipt>,
    children: Vec<Hash>,
}

/// In-memory tree of verified-but-undecided blocks. The root is the last
/// accepted block; every entry descends from it. Accepting a child makes it
/// the new root and returns the pruned competitors.
pub struct BlockTree {
    root: Hash,
    root_children: Vec<Hash>,
    entries: HashMap<Hash, Entry>,
}

impl BlockTree {
    pub fn new(root: Hash) -> Self {
        Self {
            root,
            root_children: Vec::new(),
            entries: HashMap::new(),
        }
    }

    pub fn root(&self) -> &Hash {
        &self.root
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.entries.contains_key(hash)
    }

    pub fn get(&self, hash: &Hash) -> Option<&Arc<Block>> {
        self.entries.get(hash).map(|e| &e.block)
    }

    pub fn receipts(&self, hash: &Hash) -> Option<&[Receipt]> {
        self.entries.get(hash).map(|e| e.receipts.as_slice())
    }

    /// Insert a verified block whose parent is the root or another entry.
    pub fn insert(
        &mut self, block: Arc<Block>, receipts: Vec<Receipt>,
    ) -> Result<(), VmError> {
        let hash = block.hash().clone();
        if self.entries.contains_key(&hash) {
            return Ok(())
        }
        let parent = block.parent_hash().clone();
        if parent == self.root {
            self.root_children.push(hash.clone());
        } else if let Some(entry) = self.entries.get_mut(&parent) {
            entry.children.push(hash.clone());
        } else {
            return Err(VmError::UnknownParent(parent))
        }
        self.entries.insert(
            hash,
            Entry {
                block,
                receipts,
                children: Vec::new(),
            },
        );
        Ok(())
    }

    /// Accept a direct child of the root. Returns every pruned competitor,
    /// depth-first, so the caller can mark them rejected.
    pub fn accept(&mut self, hash: &Hash) -> Result<Vec<Arc<Block>>, VmError> {
        if !self.root_children.contains(hash) {
            return Err(VmError::UnknownBlock(hash.clone()))
        }
        let mut rejected = Vec::new();
        let siblings: Vec<Hash> = self
            .root_children
            .iter()
            .filter(|h| *h != hash)
            .cloned()
            .collect();
        for sibling in siblings {
            self.remove_subtree(&sibling, &mut rejected);
        }
        let accepted = self
            .entries
            .remove(hash)
            .ok_or_else(|| VmError::UnknownBlock(hash.clone()))?;
        self.root = hash.clone();
        self.root_children = accepted.children;
        Ok(rejected)
    }

    /// Drop a block and all of its descendants.
    pub fn reject(&mut self, hash: &Hash) -> Vec<Arc<Block>> {
        let mut rejected = Vec::new();
        self.remove_subtree(hash, &mut rejected);
        self.root_children.retain(|h| h != hash);
        rejected
    }

    fn remove_subtree(&mut self, hash: &Hash, out: &mut Vec<Arc<Block>>) {
        let entry = match self.entries.remove(hash) {
            Some(entry) => entry,
            None => return,
        };
        out.push(entry.block);
        for child in entry.children {
            self.remove_subtree(&child, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::Header;
    use crate::common::{Addr, Bloom};
    use crate::kv::MemKv;
    use crate::tx::TxType;

    fn block_at(parent: &Hash, number: u64, salt: u8) -> Arc<Block> {
        let header = Header {
            parent_hash: parent.clone(),
            number,
            extra: crate::common::Bytes::from(vec![salt]),
            ..Default::default()
        };
        Arc::new(Block::new(header, vec![]))
    }

    #[test]
    fn acceptance_prunes_competing_branches() {
        let genesis = Hash::hash(b"genesis");
        let mut tree = BlockTree::new(genesis.clone());
        let a = block_at(&genesis, 1, 1);
        let b = block_at(&genesis, 1, 2);
        let b_child = block_at(b.hash(), 2, 3);
        tree.insert(a.clone(), vec![]).unwrap();
        tree.insert(b.clone(), vec![]).unwrap();
        tree.insert(b_child.clone(), vec![]).unwrap();

        let rejected = tree.accept(a.hash()).unwrap();
        assert_eq!(tree.root(), a.hash());
        let rejected: Vec<&Hash> =
            rejected.iter().map(|b| b.hash()).collect();
        assert!(rejected.contains(&b.hash()));
        assert!(rejected.contains(&b_child.hash()));
        assert!(!tree.contains(b.hash()));

        // grandchildren of the old root cannot be accepted directly
        let c = block_at(a.hash(), 2, 4);
        let d = block_at(c.hash(), 3, 5);
        tree.insert(c.clone(), vec![]).unwrap();
        tree.insert(d.clone(), vec![]).unwrap();
        assert!(tree.accept(d.hash()).is_err());
    }

    #[test]
    fn orphan_insert_is_refused() {
        let mut tree = BlockTree::new(Hash::hash(b"genesis"));
        let orphan = block_at(&Hash::hash(b"elsewhere"), 5, 1);
        match tree.insert(orphan, vec![]) {
            Err(VmError::UnknownParent(_)) => {}
            other => panic!("expected UnknownParent, got {:?}", other),
        }
    }

    #[test]
    fn store_roundtrips_accepted_chain_data() {
        let store =
            BlockStore::new(Arc::new(MemKv::new()), U256::from(99u64));
        let block = block_at(&Hash::hash(b"genesis"), 1, 1);
        let receipts = vec![Receipt {
            status: 1,
            cumulative_gas: 21_000,
            bloom: Bloom::zero(),
            logs: vec![crate::common::Log {
                address: Addr::from([5u8; 20]),
                topics: vec![Hash::hash(b"topic")],
                data: crate::common::Bytes::empty(),
            }],
            tx_type: TxType::DynamicFee,
            blob_gas_used: None,
            blob_gas_price: None,
        }];
        store.put_accepted(&block, &receipts);

        assert_eq!(store.last_accepted().as_ref(), Some(block.hash()));
        assert_eq!(store.canonical_hash(1).as_ref(), Some(block.hash()));
        assert_eq!(store.header(block.hash()).unwrap(), *block.header());
        assert_eq!(
            store.block(block.hash()).unwrap().hash(),
            block.hash()
        );
        assert_eq!(store.receipts(block.hash()).unwrap(), receipts);
        assert_eq!(store.canonical_hash(2), None);
    }
}
