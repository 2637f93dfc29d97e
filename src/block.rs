//! Blocks, headers, receipts, and the predicate-results bitmap carried in
//! the header extra region. Identity of a block is the keccak256 of its
//! canonical header encoding.

use std::collections::BTreeMap;
use std::sync::Arc;

use bitvec::prelude::{BitVec, Lsb0};

use crate::common::{Addr, Bloom, Bytes, Gas, Hash, Log, Wei, U256, U256RLP};
use crate::error::VmError;
use crate::trie::ordered_root;
use crate::tx::{Tx, TxType};

/// keccak256 of the RLP of an empty uncle list. Uncles never exist here but
/// the field stays for header compatibility.
pub fn empty_uncle_hash() -> &'static Hash {
    static V: once_cell::sync::OnceCell<Hash> =
        once_cell::sync::OnceCell::new();
    V.get_or_init(|| Hash::hash(&rlp::EMPTY_LIST_RLP))
}

/// Post-Cancun header extension, appended at fixed positions when the fork
/// is active and absent otherwise.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CancunFields {
    pub withdrawals_root: Hash,
    pub blob_gas_used: u64,
    pub excess_blob_gas: u64,
    pub beacon_root: Hash,
}

impl Default for CancunFields {
    fn default() -> Self {
        Self {
            withdrawals_root: Hash::empty_root_hash().clone(),
            blob_gas_used: 0,
            excess_blob_gas: 0,
            beacon_root: Hash::zero().clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Header {
    pub parent_hash: Hash,
    pub uncle_hash: Hash,
    pub coinbase: Addr,
    pub state_root: Hash,
    pub tx_root: Hash,
    pub receipts_root: Hash,
    pub logs_bloom: Bloom,
    pub difficulty: U256,
    pub number: u64,
    pub gas_limit: Gas,
    pub gas_used: Gas,
    pub timestamp: u64,
    /// Carries the encoded predicate-results bitmap (empty when the block
    /// has no predicate transactions).
    pub extra: Bytes,
    pub mix_digest: Hash,
    pub nonce: [u8; 8],
    pub base_fee: Wei,
    pub block_gas_cost: u64,
    pub cancun: Option<CancunFields>,
}

impl Default for Header {
    fn default() -> Self {
        Self {
            parent_hash: Hash::zero().clone(),
            uncle_hash: empty_uncle_hash().clone(),
            coinbase: Addr::zero().clone(),
            state_root: Hash::empty_root_hash().clone(),
            tx_root: Hash::empty_root_hash().clone(),
            receipts_root: Hash::empty_root_hash().clone(),
            logs_bloom: Bloom::zero(),
            difficulty: U256::one(),
            number: 0,
            gas_limit: 0,
            gas_used: 0,
            timestamp: 0,
            extra: Bytes::empty(),
            mix_digest: Hash::zero().clone(),
            nonce: [0u8; 8],
            base_fee: Wei::zero().clone(),
            block_gas_cost: 0,
            cancun: None,
        }
    }
}

impl Header {
    pub fn hash(&self) -> Hash {
        Hash::hash(&rlp::encode(self))
    }

    /// Decode the predicate bitmap from the extra region. An empty region is
    /// an empty bitmap.
    pub fn predicate_results(&self) -> Result<PredicateResults, VmError> {
        if self.extra.is_empty() {
            return Ok(PredicateResults::default())
        }
        PredicateResults::decode(&self.extra)
    }
}

impl rlp::Encodable for Header {
    fn rlp_append(&self, s: &mut rlp::RlpStream) {
        s.begin_list(if self.cancun.is_some() { 21 } else { 17 });
        s.append(&self.parent_hash)
            .append(&self.uncle_hash)
            .append(&self.coinbase)
            .append(&self.state_root)
            .append(&self.tx_root)
            .append(&self.receipts_root)
            .append(&self.logs_bloom)
            .append(&U256RLP(self.difficulty))
            .append(&self.number)
            .append(&self.gas_limit)
            .append(&self.gas_used)
            .append(&self.timestamp)
            .append(&self.extra)
            .append(&self.mix_digest)
            .append(&self.nonce.as_slice())
            .append(&self.base_fee)
            .append(&self.block_gas_cost);
        if let Some(cancun) = &self.cancun {
            s.append(&cancun.withdrawals_root)
                .append(&cancun.blob_gas_used)
                .append(&cancun.excess_blob_gas)
                .append(&cancun.beacon_root);
        }
    }
}

impl rlp::Decodable for Header {
    fn decode(rlp: &rlp::Rlp) -> Result<Self, rlp::DecoderError> {
        let items = rlp.item_count()?;
        if items != 17 && items != 21 {
            return Err(rlp::DecoderError::RlpIncorrectListLen)
        }
        let nonce_raw: Vec<u8> = rlp.val_at(14)?;
        if nonce_raw.len() != 8 {
            return Err(rlp::DecoderError::RlpInvalidLength)
        }
        let mut nonce = [0u8; 8];
        nonce.copy_from_slice(&nonce_raw);
        let cancun = if items == 21 {
            Some(CancunFields {
                withdrawals_root: rlp.val_at(17)?,
                blob_gas_used: rlp.val_at(18)?,
                excess_blob_gas: rlp.val_at(19)?,
                beacon_root: rlp.val_at(20)?,
            })
        } else {
            None
        };
        Ok(Self {
            parent_hash: rlp.val_at(0)?,
            uncle_hash: rlp.val_at(1)?,
            coinbase: rlp.val_at(2)?,
            state_root: rlp.val_at(3)?,
            tx_root: rlp.val_at(4)?,
            receipts_root: rlp.val_at(5)?,
            logs_bloom: rlp.val_at(6)?,
            difficulty: rlp.val_at::<U256RLP>(7)?.0,
            number: rlp.val_at(8)?,
            gas_limit: rlp.val_at(9)?,
            gas_used: rlp.val_at(10)?,
            timestamp: rlp.val_at(11)?,
            extra: rlp.val_at(12)?,
            mix_digest: rlp.val_at(13)?,
            nonce,
            base_fee: rlp.val_at(15)?,
            block_gas_cost: rlp.val_at(16)?,
            cancun,
        })
    }
}

/// An immutable block: header plus transaction body, with the header hash
/// cached at construction.
pub struct Block {
    header: Header,
    txs: Vec<Arc<Tx>>,
    hash: Hash,
}

impl Block {
    pub fn new(header: Header, txs: Vec<Arc<Tx>>) -> Self {
        let hash = header.hash();
        Self { header, txs, hash }
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn txs(&self) -> &[Arc<Tx>] {
        &self.txs
    }

    pub fn hash(&self) -> &Hash {
        &self.hash
    }

    pub fn number(&self) -> u64 {
        self.header.number
    }

    pub fn parent_hash(&self) -> &Hash {
        &self.header.parent_hash
    }

    /// Root of the index-keyed transaction trie over the raw encodings.
    pub fn tx_root(txs: &[Arc<Tx>]) -> Hash {
        ordered_root(&txs.iter().map(|tx| tx.encode()).collect::<Vec<_>>())
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut s = rlp::RlpStream::new_list(3);
        s.append(&self.header);
        s.begin_list(self.txs.len());
        for tx in &self.txs {
            let raw = tx.encode();
            if tx.type_() == TxType::Legacy {
                s.append_raw(&raw, 1);
            } else {
                // typed transactions are opaque byte strings in the body
                s.append(&raw.as_slice());
            }
        }
        // uncles never exist but stay in the canonical encoding
        s.begin_list(0);
        s.out().to_vec()
    }

    pub fn decode(bytes: &[u8], chain_id: &U256) -> Result<Self, VmError> {
        let rlp = rlp::Rlp::new(bytes);
        let header: Header = rlp
            .val_at(0)
            .map_err(|e| VmError::InvalidEncoding(format!("header: {}", e)))?;
        let body = rlp
            .at(1)
            .map_err(|e| VmError::InvalidEncoding(format!("body: {}", e)))?;
        let mut txs = Vec::new();
        for item in body.iter() {
            let raw = if item.is_list() {
                item.as_raw()
            } else {
                item.data().map_err(|e| {
                    VmError::InvalidEncoding(format!("tx item: {}", e))
                })?
            };
            let tx = Tx::decode(raw, chain_id).ok_or_else(|| {
                VmError::InvalidEncoding("undecodable transaction".into())
            })?;
            txs.push(Arc::new(tx));
        }
        if let Ok(uncles) = rlp.at(2) {
            if uncles.item_count().unwrap_or(1) != 0 {
                return Err(VmError::InvalidEncoding(
                    "unexpected uncle list".into(),
                ))
            }
        }
        if Self::tx_root(&txs) != header.tx_root {
            return Err(VmError::InvalidEncoding(
                "transaction root mismatch".into(),
            ))
        }
        Ok(Self::new(header, txs))
    }
}

/// Execution result of one transaction. `encoded` is the typed envelope used
/// for the receipts root.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Receipt {
    pub status: u64,
    pub cumulative_gas: Gas,
    pub bloom: Bloom,
    pub logs: Vec<Log>,
    pub tx_type: TxType,
    pub blob_gas_used: Option<u64>,
    pub blob_gas_price: Option<Wei>,
}

impl Receipt {
    pub fn encoded(&self) -> Vec<u8> {
        let blob = self.blob_gas_used.is_some();
        let mut s = rlp::RlpStream::new_list(if blob { 6 } else { 4 });
        s.append(&self.status)
            .append(&self.cumulative_gas)
            .append(&self.bloom)
            .append_list(&self.logs);
        if blob {
            s.append(&self.blob_gas_used.unwrap_or(0)).append(
                self.blob_gas_price.as_ref().unwrap_or_else(|| Wei::zero()),
            );
        }
        let payload = s.out().to_vec();
        match self.tx_type {
            TxType::Legacy => payload,
            t => {
                let mut out = vec![t as u8];
                out.extend_from_slice(&payload);
                out
            }
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, VmError> {
        if bytes.is_empty() {
            return Err(VmError::InvalidEncoding("empty receipt".into()))
        }
        let (tx_type, payload) = match bytes[0] {
            1 => (TxType::AccessList, &bytes[1..]),
            2 => (TxType::DynamicFee, &bytes[1..]),
            3 => (TxType::Blob, &bytes[1..]),
            _ => (TxType::Legacy, bytes),
        };
        let rlp = rlp::Rlp::new(payload);
        let items = rlp
            .item_count()
            .map_err(|e| VmError::InvalidEncoding(format!("receipt: {}", e)))?;
        if items != 4 && items != 6 {
            return Err(VmError::InvalidEncoding(
                "bad receipt item count".into(),
            ))
        }
        let err = |e: rlp::DecoderError| {
            VmError::InvalidEncoding(format!("receipt: {}", e))
        };
        Ok(Self {
            status: rlp.val_at(0).map_err(err)?,
            cumulative_gas: rlp.val_at(1).map_err(err)?,
            bloom: rlp.val_at(2).map_err(err)?,
            logs: rlp.list_at(3).map_err(err)?,
            tx_type,
            blob_gas_used: if items == 6 {
                Some(rlp.val_at(4).map_err(err)?)
            } else {
                None
            },
            blob_gas_price: if items == 6 {
                Some(rlp.val_at(5).map_err(err)?)
            } else {
                None
            },
        })
    }
}

pub fn receipts_root(receipts: &[Receipt]) -> Hash {
    ordered_root(&receipts.iter().map(|r| r.encoded()).collect::<Vec<_>>())
}

/// Union of all log blooms of the block.
pub fn logs_bloom(receipts: &[Receipt]) -> Bloom {
    let mut bloom = Bloom::zero();
    for receipt in receipts {
        bloom.merge(&receipt.bloom);
    }
    bloom
}

/// Per-transaction predicate verification results. Bit `i` of a
/// transaction's bitset is set when its `i`-th predicate (in access-list
/// order) verified. A transaction with no predicates has no entry.
#[derive(Clone, Debug, Default)]
pub struct PredicateResults {
    entries: BTreeMap<u64, BitVec<u8, Lsb0>>,
}

// The bitsets compare by their canonical encoding: a decoded map carries
// byte-padded bitvecs while a freshly computed one stops at the last bit
// that was set, and both pad identically on the wire.
impl PartialEq for PredicateResults {
    fn eq(&self, other: &Self) -> bool {
        self.encode() == other.encode()
    }
}

impl Eq for PredicateResults {}

impl PredicateResults {
    pub fn set(&mut self, tx_index: u64, predicate_index: usize, verified: bool) {
        let bits = self.entries.entry(tx_index).or_default();
        if bits.len() <= predicate_index {
            bits.resize(predicate_index + 1, false);
        }
        bits.set(predicate_index, verified);
    }

    pub fn verified(&self, tx_index: u64, predicate_index: usize) -> bool {
        self.entries
            .get(&tx_index)
            .and_then(|bits| bits.get(predicate_index).map(|b| *b))
            .unwrap_or(false)
    }

    /// True when bits `0..count` of the transaction are all set. A zero
    /// count is vacuously verified.
    pub fn all_verified(&self, tx_index: u64, count: usize) -> bool {
        (0..count).all(|i| self.verified(tx_index, i))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn encode(&self) -> Bytes {
        let mut s = rlp::RlpStream::new_list(self.entries.len());
        for (tx_index, bits) in &self.entries {
            s.begin_list(2);
            s.append(tx_index);
            s.append(&bits.as_raw_slice());
        }
        Bytes::from(s.out().to_vec())
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, VmError> {
        let rlp = rlp::Rlp::new(bytes);
        let err = |e: rlp::DecoderError| {
            VmError::InvalidEncoding(format!("predicate results: {}", e))
        };
        let mut entries = BTreeMap::new();
        for item in rlp.iter() {
            let tx_index: u64 = item.val_at(0).map_err(err)?;
            let raw: Vec<u8> = item.val_at(1).map_err(err)?;
            entries.insert(tx_index, BitVec::from_vec(raw));
        }
        Ok(Self { entries })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn header() -> Header {
        Header {
            parent_hash: Hash::hash(b"parent"),
            coinbase: Addr::from_str(
                "0x0100000000000000000000000000000000000000",
            )
            .unwrap(),
            number: 7,
            gas_limit: 8_000_000,
            gas_used: 21_000,
            timestamp: 1_700_000_000,
            base_fee: Wei::from(25_000_000_000u64),
            block_gas_cost: 100_000,
            ..Default::default()
        }
    }

    #[test]
    fn header_roundtrip_without_cancun_fields() {
        let h = header();
        let raw = rlp::encode(&h);
        let decoded: Header = rlp::decode(&raw).unwrap();
        assert_eq!(decoded, h);
        assert_eq!(decoded.hash(), h.hash());
    }

    #[test]
    fn header_roundtrip_with_cancun_fields() {
        let mut h = header();
        h.cancun = Some(CancunFields {
            blob_gas_used: 131_072,
            beacon_root: Hash::hash(b"beacon"),
            ..Default::default()
        });
        let raw = rlp::encode(&h);
        let decoded: Header = rlp::decode(&raw).unwrap();
        assert_eq!(decoded, h);
        // the extension changes the identity
        assert_ne!(h.hash(), header().hash());
    }

    #[test]
    fn predicate_results_roundtrip_and_query() {
        let mut results = PredicateResults::default();
        results.set(0, 0, true);
        results.set(2, 0, true);
        results.set(2, 1, false);
        results.set(2, 2, true);
        let decoded =
            PredicateResults::decode(&results.encode()).unwrap();
        // the decoded map pads bitsets to whole bytes yet still compares
        // equal to the map it was computed from
        assert_eq!(decoded, results);
        assert_eq!(decoded.encode(), results.encode());
        assert!(decoded.verified(0, 0));
        assert!(decoded.verified(2, 0));
        assert!(!decoded.verified(2, 1));
        assert!(decoded.verified(2, 2));
        // absent entries read unverified
        assert!(!decoded.verified(1, 0));
        assert!(decoded.all_verified(0, 1));
        assert!(!decoded.all_verified(2, 3));
        assert!(decoded.all_verified(1, 0));
    }

    #[test]
    fn receipt_envelope_roundtrip() {
        let mut bloom = Bloom::zero();
        let log = Log {
            address: Addr::from([5u8; 20]),
            topics: vec![Hash::hash(b"topic")],
            data: Bytes::from(vec![1, 2, 3]),
        };
        bloom.accrue_log(&log.address, &log.topics);
        let receipt = Receipt {
            status: 1,
            cumulative_gas: 21_000,
            bloom,
            logs: vec![log],
            tx_type: TxType::DynamicFee,
            blob_gas_used: None,
            blob_gas_price: None,
        };
        let raw = receipt.encoded();
        assert_eq!(raw[0], 2);
        assert_eq!(Receipt::decode(&raw).unwrap(), receipt);
    }

    #[test]
    fn bloom_is_union_of_log_blooms() {
        let mk = |seed: u8| {
            let log = Log {
                address: Addr::from([seed; 20]),
                topics: vec![Hash::hash(&[seed])],
                data: Bytes::empty(),
            };
            let mut bloom = Bloom::zero();
            bloom.accrue_log(&log.address, &log.topics);
            Receipt {
                status: 1,
                cumulative_gas: 21_000,
                bloom,
                logs: vec![log],
                tx_type: TxType::Legacy,
                blob_gas_used: None,
                blob_gas_price: None,
            }
        };
        let receipts = vec![mk(1), mk(2), mk(3)];
        let combined = logs_bloom(&receipts);
        for receipt in &receipts {
            assert!(combined.contains(&receipt.bloom));
        }
    }

    #[test]
    fn block_roundtrip_checks_tx_root() {
        use crate::tx::{TxDynamicFee, TxLegacy};
        let chain_id = U256::from(99u64);
        let key = {
            let mut raw = [7u8; 32];
            raw[0] = 1;
            libsecp256k1::SecretKey::parse(&raw).unwrap()
        };
        let txs: Vec<Arc<Tx>> = vec![
            Arc::new(
                Tx::sign(
                    TxLegacy::new(
                        chain_id,
                        0,
                        Wei::from(30u64),
                        21000,
                        Some(Addr::from([1u8; 20])),
                        Wei::from(5u64),
                        Bytes::empty(),
                    ),
                    &key,
                )
                .unwrap(),
            ),
            Arc::new(
                Tx::sign(
                    TxDynamicFee::new(
                        chain_id,
                        1,
                        Wei::from(1u64),
                        Wei::from(40u64),
                        21000,
                        Some(Addr::from([2u8; 20])),
                        Wei::from(6u64),
                        Bytes::empty(),
                        vec![],
                    ),
                    &key,
                )
                .unwrap(),
            ),
        ];
        let mut h = header();
        h.tx_root = Block::tx_root(&txs);
        let block = Block::new(h, txs);
        let raw = block.encode();
        let decoded = Block::decode(&raw, &chain_id).unwrap();
        assert_eq!(decoded.hash(), block.hash());
        assert_eq!(decoded.txs().len(), 2);
        assert_eq!(decoded.txs()[1].nonce(), 1);

        // tampered body is refused
        let mut h2 = block.header().clone();
        h2.tx_root = Hash::hash(b"bogus");
        let bad = Block::new(h2, block.txs().to_vec());
        assert!(Block::decode(&bad.encode(), &chain_id).is_err());
    }
}
