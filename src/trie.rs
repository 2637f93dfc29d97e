//! Merkle-Patricia trie over a [KvStore] namespace. Node encoding follows
//! the canonical Ethereum layout: leaf/extension paths are hex-prefix
//! encoded, node references shorter than 32 bytes are inlined, otherwise the
//! node is persisted under its keccak256 hash. Committed roots are
//! content-addressed; a missing referenced node surfaces as
//! [StateError::Corrupted] and must abort.

use crate::common::Hash;
use crate::error::StateError;
use crate::kv::{KvStore, WriteBatch};

type Nibbles = Vec<u8>;

fn to_nibbles(key: &[u8]) -> Nibbles {
    let mut out = Vec::with_capacity(key.len() * 2);
    for b in key {
        out.push(b >> 4);
        out.push(b & 0xf);
    }
    out
}

fn from_nibbles(nibbles: &[u8]) -> Vec<u8> {
    debug_assert!(nibbles.len() % 2 == 0);
    nibbles.chunks(2).map(|c| (c[0] << 4) | c[1]).collect()
}

/// Hex-prefix encoding: flag bit 0x2 marks a leaf, low bit marks odd length.
fn hp_encode(path: &[u8], leaf: bool) -> Vec<u8> {
    let mut flag: u8 = if leaf { 2 } else { 0 };
    let odd = path.len() % 2 == 1;
    if odd {
        flag |= 1;
    }
    let mut out = Vec::with_capacity(path.len() / 2 + 1);
    if odd {
        out.push((flag << 4) | path[0]);
        for c in path[1..].chunks(2) {
            out.push((c[0] << 4) | c[1]);
        }
    } else {
        out.push(flag << 4);
        for c in path.chunks(2) {
            out.push((c[0] << 4) | c[1]);
        }
    }
    out
}

fn hp_decode(encoded: &[u8]) -> Result<(Nibbles, bool), StateError> {
    if encoded.is_empty() {
        return Err(StateError::Corrupted(Hash::zero().clone()))
    }
    let flag = encoded[0] >> 4;
    let leaf = flag & 2 != 0;
    let mut path = Vec::new();
    if flag & 1 != 0 {
        path.push(encoded[0] & 0xf);
    }
    for b in &encoded[1..] {
        path.push(b >> 4);
        path.push(b & 0xf);
    }
    Ok((path, leaf))
}

#[derive(Clone)]
enum NodeRef {
    Empty,
    /// Persisted node, referenced by keccak256 of its encoding.
    Hash(Hash),
    /// Encoding shorter than 32 bytes, embedded in the parent.
    Inline(Vec<u8>),
    /// In-memory node not yet committed.
    Owned(Box<Node>),
}

#[derive(Clone)]
enum Node {
    Leaf(Nibbles, Vec<u8>),
    Ext(Nibbles, NodeRef),
    Branch(Box<[NodeRef; 16]>, Option<Vec<u8>>),
}

fn empty_children() -> Box<[NodeRef; 16]> {
    Box::new([
        NodeRef::Empty,
        NodeRef::Empty,
        NodeRef::Empty,
        NodeRef::Empty,
        NodeRef::Empty,
        NodeRef::Empty,
        NodeRef::Empty,
        NodeRef::Empty,
        NodeRef::Empty,
        NodeRef::Empty,
        NodeRef::Empty,
        NodeRef::Empty,
        NodeRef::Empty,
        NodeRef::Empty,
        NodeRef::Empty,
        NodeRef::Empty,
    ])
}

fn common_prefix(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

fn decode_ref(rlp: &rlp::Rlp) -> Result<NodeRef, StateError> {
    if rlp.is_list() {
        return Ok(NodeRef::Inline(rlp.as_raw().to_vec()))
    }
    let data = rlp
        .data()
        .map_err(|_| StateError::Corrupted(Hash::zero().clone()))?;
    match data.len() {
        0 => Ok(NodeRef::Empty),
        32 => Ok(NodeRef::Hash(Hash::from_slice(data))),
        _ => Err(StateError::Corrupted(Hash::zero().clone())),
    }
}

fn decode_node(bytes: &[u8]) -> Result<Node, StateError> {
    let rlp = rlp::Rlp::new(bytes);
    let corrupted = || StateError::Corrupted(Hash::hash(bytes));
    match rlp.item_count().map_err(|_| corrupted())? {
        2 => {
            let (path, leaf) =
                hp_decode(rlp.at(0).map_err(|_| corrupted())?.data().map_err(|_| corrupted())?)?;
            if leaf {
                let val = rlp
                    .at(1)
                    .and_then(|r| r.data().map(|d| d.to_vec()))
                    .map_err(|_| corrupted())?;
                Ok(Node::Leaf(path, val))
            } else {
                let child = decode_ref(&rlp.at(1).map_err(|_| corrupted())?)?;
                Ok(Node::Ext(path, child))
            }
        }
        17 => {
            let mut children = empty_children();
            for (i, child) in children.iter_mut().enumerate() {
                *child = decode_ref(&rlp.at(i).map_err(|_| corrupted())?)?;
            }
            let vdata = rlp
                .at(16)
                .and_then(|r| r.data().map(|d| d.to_vec()))
                .map_err(|_| corrupted())?;
            let value = if vdata.is_empty() { None } else { Some(vdata) };
            Ok(Node::Branch(children, value))
        }
        _ => Err(corrupted()),
    }
}

pub struct Trie<'a> {
    db: &'a dyn KvStore,
    root: NodeRef,
}

impl<'a> Trie<'a> {
    pub fn new(db: &'a dyn KvStore, root: Option<&Hash>) -> Self {
        let root = match root {
            Some(r) if r != Hash::empty_root_hash() && r != Hash::zero() => {
                NodeRef::Hash(r.clone())
            }
            _ => NodeRef::Empty,
        };
        Self { db, root }
    }

    fn resolve(&self, r: &NodeRef) -> Result<Option<Node>, StateError> {
        match r {
            NodeRef::Empty => Ok(None),
            NodeRef::Hash(h) => {
                let bytes = self
                    .db
                    .get(h.as_bytes())
                    .ok_or_else(|| StateError::Corrupted(h.clone()))?;
                Ok(Some(decode_node(&bytes)?))
            }
            NodeRef::Inline(raw) => Ok(Some(decode_node(raw)?)),
            NodeRef::Owned(n) => Ok(Some((**n).clone())),
        }
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StateError> {
        let path = to_nibbles(key);
        self.get_at(&self.root, &path)
    }

    fn get_at(
        &self, r: &NodeRef, path: &[u8],
    ) -> Result<Option<Vec<u8>>, StateError> {
        let node = match self.resolve(r)? {
            Some(n) => n,
            None => return Ok(None),
        };
        match node {
            Node::Leaf(lp, lv) => {
                Ok(if lp == path { Some(lv) } else { None })
            }
            Node::Ext(ep, child) => {
                if path.len() >= ep.len() && path[..ep.len()] == ep[..] {
                    self.get_at(&child, &path[ep.len()..])
                } else {
                    Ok(None)
                }
            }
            Node::Branch(children, value) => {
                if path.is_empty() {
                    Ok(value)
                } else {
                    self.get_at(&children[path[0] as usize], &path[1..])
                }
            }
        }
    }

    pub fn insert(&mut self, key: &[u8], value: &[u8]) -> Result<(), StateError> {
        let path = to_nibbles(key);
        let root = std::mem::replace(&mut self.root, NodeRef::Empty);
        let node = match self.resolve(&root)? {
            Some(n) => self.insert_at(n, &path, value.to_vec())?,
            None => Node::Leaf(path, value.to_vec()),
        };
        self.root = NodeRef::Owned(Box::new(node));
        Ok(())
    }

    fn insert_at(
        &self, node: Node, path: &[u8], value: Vec<u8>,
    ) -> Result<Node, StateError> {
        match node {
            Node::Leaf(lp, lv) => {
                let common = common_prefix(&lp, path);
                if common == lp.len() && common == path.len() {
                    return Ok(Node::Leaf(lp, value))
                }
                let mut children = empty_children();
                let mut bval = None;
                if lp.len() == common {
                    bval = Some(lv);
                } else {
                    children[lp[common] as usize] = NodeRef::Owned(Box::new(
                        Node::Leaf(lp[common + 1..].to_vec(), lv),
                    ));
                }
                if path.len() == common {
                    bval = Some(value);
                } else {
                    children[path[common] as usize] = NodeRef::Owned(
                        Box::new(Node::Leaf(path[common + 1..].to_vec(), value)),
                    );
                }
                let branch = Node::Branch(children, bval);
                Ok(if common > 0 {
                    Node::Ext(
                        path[..common].to_vec(),
                        NodeRef::Owned(Box::new(branch)),
                    )
                } else {
                    branch
                })
            }
            Node::Ext(ep, child) => {
                let common = common_prefix(&ep, path);
                if common == ep.len() {
                    let inner = self
                        .resolve(&child)?
                        .ok_or_else(|| StateError::Corrupted(Hash::zero().clone()))?;
                    let inner =
                        self.insert_at(inner, &path[common..], value)?;
                    return Ok(Node::Ext(ep, NodeRef::Owned(Box::new(inner))))
                }
                let mut children = empty_children();
                let mut bval = None;
                // hang the truncated extension under the split branch
                children[ep[common] as usize] = if ep.len() == common + 1 {
                    child
                } else {
                    NodeRef::Owned(Box::new(Node::Ext(
                        ep[common + 1..].to_vec(),
                        child,
                    )))
                };
                if path.len() == common {
                    bval = Some(value);
                } else {
                    children[path[common] as usize] = NodeRef::Owned(
                        Box::new(Node::Leaf(path[common + 1..].to_vec(), value)),
                    );
                }
                let branch = Node::Branch(children, bval);
                Ok(if common > 0 {
                    Node::Ext(
                        path[..common].to_vec(),
                        NodeRef::Owned(Box::new(branch)),
                    )
                } else {
                    branch
                })
            }
            Node::Branch(mut children, bval) => {
                if path.is_empty() {
                    return Ok(Node::Branch(children, Some(value)))
                }
                let idx = path[0] as usize;
                let child = std::mem::replace(&mut children[idx], NodeRef::Empty);
                let new_child = match self.resolve(&child)? {
                    Some(n) => self.insert_at(n, &path[1..], value)?,
                    None => Node::Leaf(path[1..].to_vec(), value),
                };
                children[idx] = NodeRef::Owned(Box::new(new_child));
                Ok(Node::Branch(children, bval))
            }
        }
    }

    pub fn remove(&mut self, key: &[u8]) -> Result<(), StateError> {
        let path = to_nibbles(key);
        let root = std::mem::replace(&mut self.root, NodeRef::Empty);
        self.root = match self.resolve(&root)? {
            Some(n) => match self.remove_at(n, &path)? {
                Some(n) => NodeRef::Owned(Box::new(n)),
                None => NodeRef::Empty,
            },
            None => NodeRef::Empty,
        };
        Ok(())
    }

    fn remove_at(
        &self, node: Node, path: &[u8],
    ) -> Result<Option<Node>, StateError> {
        match node {
            Node::Leaf(lp, lv) => {
                Ok(if lp == path { None } else { Some(Node::Leaf(lp, lv)) })
            }
            Node::Ext(ep, child) => {
                if path.len() < ep.len() || path[..ep.len()] != ep[..] {
                    return Ok(Some(Node::Ext(ep, child)))
                }
                let inner = self
                    .resolve(&child)?
                    .ok_or_else(|| StateError::Corrupted(Hash::zero().clone()))?;
                match self.remove_at(inner, &path[ep.len()..])? {
                    None => Ok(None),
                    Some(Node::Leaf(lp, lv)) => {
                        let mut p = ep;
                        p.extend_from_slice(&lp);
                        Ok(Some(Node::Leaf(p, lv)))
                    }
                    Some(Node::Ext(p2, c2)) => {
                        let mut p = ep;
                        p.extend_from_slice(&p2);
                        Ok(Some(Node::Ext(p, c2)))
                    }
                    Some(branch) => {
                        Ok(Some(Node::Ext(ep, NodeRef::Owned(Box::new(branch)))))
                    }
                }
            }
            Node::Branch(mut children, mut bval) => {
                if path.is_empty() {
                    bval = None;
                } else {
                    let idx = path[0] as usize;
                    let child =
                        std::mem::replace(&mut children[idx], NodeRef::Empty);
                    if let Some(n) = self.resolve(&child)? {
                        if let Some(n) = self.remove_at(n, &path[1..])? {
                            children[idx] = NodeRef::Owned(Box::new(n));
                        }
                    }
                }
                self.normalize_branch(children, bval)
            }
        }
    }

    /// Collapse a branch left with a single occupant after a removal.
    fn normalize_branch(
        &self, children: Box<[NodeRef; 16]>, bval: Option<Vec<u8>>,
    ) -> Result<Option<Node>, StateError> {
        let occupied: Vec<usize> = children
            .iter()
            .enumerate()
            .filter(|(_, c)| !matches!(c, NodeRef::Empty))
            .map(|(i, _)| i)
            .collect();
        match (occupied.len(), &bval) {
            (0, None) => Ok(None),
            (0, Some(_)) => Ok(Some(Node::Leaf(Vec::new(), bval.unwrap()))),
            (1, None) => {
                let idx = occupied[0];
                let child = self
                    .resolve(&children[idx])?
                    .ok_or_else(|| StateError::Corrupted(Hash::zero().clone()))?;
                Ok(Some(match child {
                    Node::Leaf(lp, lv) => {
                        let mut p = vec![idx as u8];
                        p.extend_from_slice(&lp);
                        Node::Leaf(p, lv)
                    }
                    Node::Ext(p2, c2) => {
                        let mut p = vec![idx as u8];
                        p.extend_from_slice(&p2);
                        Node::Ext(p, c2)
                    }
                    branch => Node::Ext(
                        vec![idx as u8],
                        NodeRef::Owned(Box::new(branch)),
                    ),
                }))
            }
            _ => Ok(Some(Node::Branch(children, bval))),
        }
    }

    fn encode_node(node: &Node, batch: &mut WriteBatch) -> Vec<u8> {
        let mut s = rlp::RlpStream::new();
        match node {
            Node::Leaf(path, value) => {
                s.begin_list(2);
                s.append(&hp_encode(path, true));
                s.append(&value.as_slice());
            }
            Node::Ext(path, child) => {
                s.begin_list(2);
                s.append(&hp_encode(path, false));
                Self::encode_ref(child, &mut s, batch);
            }
            Node::Branch(children, value) => {
                s.begin_list(17);
                for child in children.iter() {
                    Self::encode_ref(child, &mut s, batch);
                }
                match value {
                    Some(v) => s.append(&v.as_slice()),
                    None => s.append_empty_data(),
                };
            }
        }
        s.out().to_vec()
    }

    fn encode_ref(
        r: &NodeRef, s: &mut rlp::RlpStream, batch: &mut WriteBatch,
    ) {
        match r {
            NodeRef::Empty => {
                s.append_empty_data();
            }
            NodeRef::Hash(h) => {
                s.append(&h.as_bytes());
            }
            NodeRef::Inline(raw) => {
                s.append_raw(raw, 1);
            }
            NodeRef::Owned(n) => {
                let encoded = Self::encode_node(n, batch);
                if encoded.len() < 32 {
                    s.append_raw(&encoded, 1);
                } else {
                    let h = Hash::hash(&encoded);
                    batch.put(h.as_bytes(), &encoded);
                    s.append(&h.as_bytes());
                }
            }
        }
    }

    /// Encode all in-memory nodes into `batch` and return the new root. The
    /// root node is always persisted by hash. Idempotent: re-committing the
    /// same content yields the same root and the same node set.
    pub fn commit(&mut self, batch: &mut WriteBatch) -> Hash {
        match std::mem::replace(&mut self.root, NodeRef::Empty) {
            NodeRef::Empty => Hash::empty_root_hash().clone(),
            NodeRef::Hash(h) => {
                self.root = NodeRef::Hash(h.clone());
                h
            }
            NodeRef::Inline(raw) => {
                let h = Hash::hash(&raw);
                batch.put(h.as_bytes(), &raw);
                self.root = NodeRef::Hash(h.clone());
                h
            }
            NodeRef::Owned(node) => {
                let encoded = Self::encode_node(&node, batch);
                let h = Hash::hash(&encoded);
                batch.put(h.as_bytes(), &encoded);
                self.root = NodeRef::Hash(h.clone());
                h
            }
        }
    }

    /// All `(key, value)` pairs under the current root, key-ordered. Only
    /// valid for tries whose keys have an even nibble count (all of ours).
    pub fn iter(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StateError> {
        let mut out = Vec::new();
        self.iter_at(&self.root, Vec::new(), &mut out)?;
        Ok(out)
    }

    fn iter_at(
        &self, r: &NodeRef, prefix: Nibbles,
        out: &mut Vec<(Vec<u8>, Vec<u8>)>,
    ) -> Result<(), StateError> {
        let node = match self.resolve(r)? {
            Some(n) => n,
            None => return Ok(()),
        };
        match node {
            Node::Leaf(lp, lv) => {
                let mut p = prefix;
                p.extend_from_slice(&lp);
                out.push((from_nibbles(&p), lv));
            }
            Node::Ext(ep, child) => {
                let mut p = prefix;
                p.extend_from_slice(&ep);
                self.iter_at(&child, p, out)?;
            }
            Node::Branch(children, value) => {
                if let Some(v) = value {
                    out.push((from_nibbles(&prefix), v));
                }
                for (i, child) in children.iter().enumerate() {
                    let mut p = prefix.clone();
                    p.push(i as u8);
                    self.iter_at(child, p, out)?;
                }
            }
        }
        Ok(())
    }

    /// Hashes of every persisted node reachable from the current root, for
    /// mark-and-sweep pruning. Inline nodes live inside their parent and
    /// carry no hash of their own.
    pub fn node_hashes(&self) -> Result<Vec<Hash>, StateError> {
        let mut out = Vec::new();
        self.node_hashes_at(&self.root, &mut out)?;
        Ok(out)
    }

    fn node_hashes_at(
        &self, r: &NodeRef, out: &mut Vec<Hash>,
    ) -> Result<(), StateError> {
        if let NodeRef::Hash(h) = r {
            out.push(h.clone());
        }
        let node = match self.resolve(r)? {
            Some(n) => n,
            None => return Ok(()),
        };
        match node {
            Node::Leaf(..) => {}
            Node::Ext(_, child) => self.node_hashes_at(&child, out)?,
            Node::Branch(children, _) => {
                for child in children.iter() {
                    self.node_hashes_at(child, out)?;
                }
            }
        }
        Ok(())
    }

    /// Merkle proof for `key`: the encoded nodes on the path from the root.
    /// Only committed tries can be proven.
    pub fn prove(&self, key: &[u8]) -> Result<Vec<Vec<u8>>, StateError> {
        let mut proof = Vec::new();
        let mut path = to_nibbles(key);
        let mut cur = self.root.clone();
        loop {
            let raw = match &cur {
                NodeRef::Empty => break,
                NodeRef::Hash(h) => self
                    .db
                    .get(h.as_bytes())
                    .ok_or_else(|| StateError::Corrupted(h.clone()))?,
                NodeRef::Inline(_) | NodeRef::Owned(_) => break,
            };
            proof.push(raw.clone());
            match decode_node(&raw)? {
                Node::Leaf(..) => break,
                Node::Ext(ep, child) => {
                    if path.len() < ep.len() || path[..ep.len()] != ep[..] {
                        break
                    }
                    path = path[ep.len()..].to_vec();
                    cur = child;
                }
                Node::Branch(children, _) => {
                    if path.is_empty() {
                        break
                    }
                    let idx = path[0] as usize;
                    path = path[1..].to_vec();
                    cur = children[idx].clone();
                }
            }
        }
        Ok(proof)
    }
}

/// Root of an index-keyed trie built in memory (transaction and receipt
/// roots). Keys are the RLP encodings of the item indices.
pub fn ordered_root(items: &[Vec<u8>]) -> Hash {
    let db = crate::kv::MemKv::new();
    let mut trie = Trie::new(&db, None);
    for (i, item) in items.iter().enumerate() {
        let key = rlp::encode(&i).to_vec();
        trie.insert(&key, item).expect("in-memory trie insert");
    }
    let mut batch = WriteBatch::new();
    trie.commit(&mut batch)
}

/// Verify a single-key Merkle proof against `root`. Returns the proven value
/// (None when the proof shows absence), or Err when the proof is malformed.
pub fn verify_proof(
    root: &Hash, key: &[u8], proof: &[Vec<u8>],
) -> Result<Option<Vec<u8>>, StateError> {
    use std::collections::HashMap;
    let mut nodes: HashMap<Hash, &Vec<u8>> = HashMap::new();
    for raw in proof {
        nodes.insert(Hash::hash(raw), raw);
    }
    let mut path = to_nibbles(key);
    let mut want = root.clone();
    loop {
        let raw = match nodes.get(&want) {
            Some(r) => *r,
            None => return Err(StateError::Corrupted(want)),
        };
        let mut node = decode_node(raw)?;
        loop {
            match node {
                Node::Leaf(lp, lv) => {
                    return Ok(if lp == path { Some(lv) } else { None })
                }
                Node::Ext(ep, child) => {
                    if path.len() < ep.len() || path[..ep.len()] != ep[..] {
                        return Ok(None)
                    }
                    path = path[ep.len()..].to_vec();
                    match child {
                        NodeRef::Empty => return Ok(None),
                        NodeRef::Hash(h) => {
                            want = h;
                            break
                        }
                        NodeRef::Inline(raw) => {
                            node = decode_node(&raw)?;
                        }
                        NodeRef::Owned(_) => unreachable!(),
                    }
                }
                Node::Branch(children, value) => {
                    if path.is_empty() {
                        return Ok(value)
                    }
                    let idx = path[0] as usize;
                    path = path[1..].to_vec();
                    match children[idx].clone() {
                        NodeRef::Empty => return Ok(None),
                        NodeRef::Hash(h) => {
                            want = h;
                            break
                        }
                        NodeRef::Inline(raw) => {
                            node = decode_node(&raw)?;
                        }
                        NodeRef::Owned(_) => unreachable!(),
                    }
                }
            }
        }
    }
}

/// Validate a contiguous key range against `root`. The boundary keys must
/// carry valid inclusion proofs and the items must be sorted; the caller
/// re-derives the full root once every range has been staged, which is the
/// final authority on the reconstructed state.
pub fn verify_range_proof(
    root: &Hash, keys: &[Vec<u8>], values: &[Vec<u8>], proof: &[Vec<u8>],
) -> Result<(), StateError> {
    if keys.len() != values.len() || keys.is_empty() {
        return Err(StateError::Corrupted(root.clone()))
    }
    for w in keys.windows(2) {
        if w[0] >= w[1] {
            return Err(StateError::Corrupted(root.clone()))
        }
    }
    for (key, value) in [
        (&keys[0], &values[0]),
        (&keys[keys.len() - 1], &values[values.len() - 1]),
    ] {
        match verify_proof(root, key, proof)? {
            Some(v) if &v == value => {}
            _ => return Err(StateError::Corrupted(root.clone())),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemKv;

    #[test]
    fn empty_trie_root() {
        let db = MemKv::new();
        let mut trie = Trie::new(&db, None);
        let mut batch = WriteBatch::new();
        assert_eq!(&trie.commit(&mut batch), Hash::empty_root_hash());
    }

    #[test]
    fn insert_get_roundtrip_across_commits() {
        let db = MemKv::new();
        let mut trie = Trie::new(&db, None);
        let pairs: Vec<(Vec<u8>, Vec<u8>)> = (0u32..64)
            .map(|i| {
                (
                    Hash::hash(&i.to_be_bytes()).as_bytes().to_vec(),
                    format!("value-{}", i).into_bytes(),
                )
            })
            .collect();
        for (k, v) in &pairs {
            trie.insert(k, v).unwrap();
        }
        let mut batch = WriteBatch::new();
        let root = trie.commit(&mut batch);
        db.write(batch);

        let reopened = Trie::new(&db, Some(&root));
        for (k, v) in &pairs {
            assert_eq!(reopened.get(k).unwrap().as_deref(), Some(v.as_slice()));
        }
        assert_eq!(reopened.get(Hash::hash(b"absent").as_bytes()).unwrap(), None);
    }

    #[test]
    fn root_is_insertion_order_independent() {
        let db1 = MemKv::new();
        let db2 = MemKv::new();
        let mut t1 = Trie::new(&db1, None);
        let mut t2 = Trie::new(&db2, None);
        let pairs: Vec<(Vec<u8>, Vec<u8>)> = (0u32..32)
            .map(|i| {
                (
                    Hash::hash(&i.to_le_bytes()).as_bytes().to_vec(),
                    vec![i as u8; 3],
                )
            })
            .collect();
        for (k, v) in &pairs {
            t1.insert(k, v).unwrap();
        }
        for (k, v) in pairs.iter().rev() {
            t2.insert(k, v).unwrap();
        }
        let mut b1 = WriteBatch::new();
        let mut b2 = WriteBatch::new();
        assert_eq!(t1.commit(&mut b1), t2.commit(&mut b2));
    }

    #[test]
    fn remove_restores_previous_root() {
        let db = MemKv::new();
        let mut trie = Trie::new(&db, None);
        trie.insert(b"key-one-aaaaaaaa", b"1").unwrap();
        trie.insert(b"key-two-bbbbbbbb", b"2").unwrap();
        let mut batch = WriteBatch::new();
        let before = trie.commit(&mut batch);
        db.write(batch);

        let mut trie = Trie::new(&db, Some(&before));
        trie.insert(b"key-three-cccccc", b"3").unwrap();
        trie.remove(b"key-three-cccccc").unwrap();
        let mut batch = WriteBatch::new();
        assert_eq!(trie.commit(&mut batch), before);
    }

    #[test]
    fn proof_verifies_inclusion_and_absence() {
        let db = MemKv::new();
        let mut trie = Trie::new(&db, None);
        let keys: Vec<Vec<u8>> = (0u32..16)
            .map(|i| Hash::hash(&i.to_be_bytes()).as_bytes().to_vec())
            .collect();
        for (i, k) in keys.iter().enumerate() {
            trie.insert(k, &[i as u8 + 1]).unwrap();
        }
        let mut batch = WriteBatch::new();
        let root = trie.commit(&mut batch);
        db.write(batch);

        let trie = Trie::new(&db, Some(&root));
        let proof = trie.prove(&keys[3]).unwrap();
        assert_eq!(
            verify_proof(&root, &keys[3], &proof).unwrap(),
            Some(vec![4u8])
        );
        // a tampered value must not verify
        let mut bad = proof.clone();
        bad[0][0] ^= 0x01;
        assert!(verify_proof(&root, &keys[3], &bad).is_err());
    }

    #[test]
    fn ordered_root_matches_known_empty() {
        assert_eq!(&ordered_root(&[]), Hash::empty_root_hash());
        assert_ne!(&ordered_root(&[vec![1, 2, 3]]), Hash::empty_root_hash());
    }

    #[test]
    fn iter_returns_sorted_pairs() {
        let db = MemKv::new();
        let mut trie = Trie::new(&db, None);
        let mut keys: Vec<Vec<u8>> = (0u32..20)
            .map(|i| Hash::hash(&i.to_be_bytes()).as_bytes().to_vec())
            .collect();
        for k in &keys {
            trie.insert(k, b"v").unwrap();
        }
        let mut batch = WriteBatch::new();
        let root = trie.commit(&mut batch);
        db.write(batch);
        keys.sort();
        let listed: Vec<Vec<u8>> = Trie::new(&db, Some(&root))
            .iter()
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(listed, keys);
    }
}
