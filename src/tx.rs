use std::io::Write;

use once_cell::sync::OnceCell;
use rlp_derive::{RlpDecodable, RlpEncodable};
use sha3::Digest;

use crate::common::{
    u256_1, Addr, Bytes, Gas, Hash, NullableAddr, Wei, U256, U256RLP,
};
use crate::params::{
    Rules, ACCESS_LIST_ADDR_GAS, ACCESS_LIST_KEY_GAS, TX_CREATE_GAS,
    TX_DATA_NONZERO_GAS, TX_DATA_ZERO_GAS, TX_GAS,
};

#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum TxType {
    Legacy = 0x0,
    AccessList,
    DynamicFee,
    Blob,
}

/// A decoded transaction with its cached hash and recovered sender.
pub struct Tx {
    inner: Box<dyn TxLike>,
    tx_hash: Hash,
    from: Addr,
}

// `Tx` is read-only
unsafe impl Sync for Tx {}

impl std::ops::Deref for Tx {
    type Target = dyn TxLike + 'static;
    fn deref(&self) -> &(dyn TxLike + 'static) {
        &*self.inner
    }
}

impl std::fmt::Debug for Tx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Tx({:?})", self.tx_hash)
    }
}

impl Tx {
    fn new<T: TxLike + 'static>(
        tx: T, tx_hash: Hash, chain_id: &U256,
    ) -> Option<Self> {
        let from = tx.recover_sender(chain_id)?;
        Some(Self {
            inner: Box::new(tx),
            tx_hash,
            from,
        })
    }

    pub fn from(&self) -> &Addr {
        &self.from
    }

    pub fn hash(&self) -> &Hash {
        &self.tx_hash
    }

    const ACCESS_LIST: u8 = 1;
    const DYNAMIC_FEE: u8 = 2;
    const BLOB: u8 = 3;

    /// Decode one transaction from its canonical encoding: a bare RLP list
    /// for legacy, a type-prefixed byte string for typed transactions. The
    /// sender is recovered eagerly; a bad signature or foreign chain id
    /// yields `None`.
    pub fn decode(bytes: &[u8], chain_id: &U256) -> Option<Tx> {
        let rlp = rlp::Rlp::new(bytes);
        let tx_hash = Hash::hash(bytes);
        if rlp.is_list() {
            rlp.as_val()
                .ok()
                .and_then(|tx: TxLegacy| Tx::new(tx, tx_hash, chain_id))
        } else if rlp.is_data() {
            let bytes = rlp.as_raw();
            if bytes.is_empty() {
                return None
            }
            let rlp = rlp::Rlp::new(&bytes[1..]);
            match bytes[0] {
                Self::ACCESS_LIST => {
                    rlp.as_val().ok().and_then(|tx: TxAccessList| {
                        Tx::new(tx, tx_hash, chain_id)
                    })
                }
                Self::DYNAMIC_FEE => {
                    rlp.as_val().ok().and_then(|tx: TxDynamicFee| {
                        Tx::new(tx, tx_hash, chain_id)
                    })
                }
                Self::BLOB => rlp
                    .as_val()
                    .ok()
                    .and_then(|tx: TxBlob| Tx::new(tx, tx_hash, chain_id)),
                _ => None,
            }
        } else {
            None
        }
    }

    /// Sign an unsigned transaction and wrap it. Only used by local tooling
    /// and tests; the plugin itself never signs user transactions.
    pub fn sign<T: TxLike + Signable + 'static>(
        mut tx: T, secret: &libsecp256k1::SecretKey,
    ) -> Option<Tx> {
        let chain_id = tx.chain_id();
        let sig_hash = tx.sig_hash(chain_id);
        let msg =
            libsecp256k1::Message::parse_slice(sig_hash.as_bytes()).ok()?;
        let (sig, recid) = libsecp256k1::sign(&msg, secret);
        let mut s = U256::from_big_endian(&sig.s.b32());
        let mut recid = recid.serialize() as u64;
        if &s > secp256k1_half_n() {
            s = secp256k1_n() - s;
            recid ^= 1;
        }
        let r = U256::from_big_endian(&sig.r.b32());
        let v = match tx.type_() {
            TxType::Legacy => chain_id * 2 + U256::from(35 + recid),
            _ => U256::from(recid),
        };
        tx.set_signature(v, r, s);
        let raw = tx.encode();
        Tx::decode(&raw, &chain_id)
    }

    /// The predicate byte strings this transaction supplies, in access-list
    /// order, for addresses the rule set marks as predicaters. A tuple whose
    /// storage keys do not unpack yields an empty predicate, which the
    /// verifier then fails.
    pub fn predicates(&self, rules: &Rules) -> Vec<(Addr, Bytes)> {
        let mut out = Vec::new();
        if let Some(list) = self.access_list() {
            for tuple in list {
                if rules.has_predicate(&tuple.address) {
                    let predicate = unpack_predicate(&tuple.storage_keys)
                        .unwrap_or_default();
                    out.push((tuple.address.clone(), Bytes::from(predicate)));
                }
            }
        }
        out
    }
}

/// Mutation hooks used only when constructing signed transactions locally.
pub trait Signable {
    fn set_signature(&mut self, v: U256, r: U256, s: U256);
}

pub trait TxLike: Send + std::fmt::Debug {
    fn encode(&self) -> Vec<u8>;
    fn type_(&self) -> TxType;
    fn chain_id(&self) -> U256;
    fn access_list(&self) -> Option<&[AccessTuple]>;
    fn data(&self) -> &Bytes;
    fn gas(&self) -> Gas;
    fn gas_fee_cap(&self) -> &Wei;
    fn gas_tip_cap(&self) -> &Wei;
    fn gas_price(&self) -> &Wei;
    fn value(&self) -> &Wei;
    fn nonce(&self) -> u64;
    fn to(&self) -> Option<&Addr>;
    fn blob_hashes(&self) -> &[Hash] {
        &[]
    }
    fn max_fee_per_blob_gas(&self) -> &Wei {
        Wei::zero()
    }
    fn v(&self) -> &U256;
    fn r(&self) -> &U256;
    fn s(&self) -> &U256;
    fn sig_hash(&self, chain_id: U256) -> Hash;
    fn protected(&self) -> bool {
        true
    }

    fn recover_sender(&self, chain_id: &U256) -> Option<Addr> {
        if &self.chain_id() != chain_id {
            return None
        }
        let t = self.type_();
        let mut v = self.v().clone();
        let r = self.r().clone();
        let s = self.s().clone();
        match t {
            TxType::DynamicFee | TxType::AccessList | TxType::Blob => {
                v += 27u64.into();
                recover_plain(&self.sig_hash(chain_id.clone()), r, s, v, true)
            }
            TxType::Legacy => {
                if !self.protected() {
                    return recover_plain(
                        &self.sig_hash(U256::zero()),
                        r,
                        s,
                        v,
                        true,
                    )
                }
                let mut cm = *chain_id;
                cm <<= 1;
                cm += 8u64.into();
                if v < cm {
                    return None
                }
                v -= cm;
                recover_plain(&self.sig_hash(chain_id.clone()), r, s, v, true)
            }
        }
    }
}

/// One access-list entry: the touched address and its warm storage slots.
/// Predicate bytes for predicater addresses travel inside `storage_keys`.
#[derive(RlpDecodable, RlpEncodable, Debug, Clone, PartialEq, Eq)]
pub struct AccessTuple {
    pub address: Addr,
    pub storage_keys: Vec<Hash>,
}

pub const PREDICATE_DELIMITER: u8 = 0xff;

/// Pack a predicate byte string into storage keys: append the delimiter,
/// zero-pad to a 32-byte multiple, chunk.
pub fn pack_predicate(predicate: &[u8]) -> Vec<Hash> {
    let mut buf = predicate.to_vec();
    buf.push(PREDICATE_DELIMITER);
    while buf.len() % 32 != 0 {
        buf.push(0);
    }
    buf.chunks(32).map(Hash::from_slice).collect()
}

/// Inverse of [pack_predicate]. `None` when the trailing padding or the
/// delimiter is malformed.
pub fn unpack_predicate(keys: &[Hash]) -> Option<Vec<u8>> {
    let mut buf = Vec::with_capacity(keys.len() * 32);
    for key in keys {
        buf.extend_from_slice(key.as_bytes());
    }
    while let Some(0) = buf.last() {
        buf.pop();
    }
    match buf.pop() {
        Some(PREDICATE_DELIMITER) => Some(buf),
        _ => None,
    }
}

/// Gas charged before any execution: base cost, create surcharge, calldata
/// and access-list costs. `None` on overflow.
pub fn intrinsic_gas(tx: &dyn TxLike) -> Option<Gas> {
    let mut gas = TX_GAS;
    if tx.to().is_none() {
        gas = gas.checked_add(TX_CREATE_GAS)?;
    }
    for byte in tx.data().iter() {
        let cost = if *byte == 0 {
            TX_DATA_ZERO_GAS
        } else {
            TX_DATA_NONZERO_GAS
        };
        gas = gas.checked_add(cost)?;
    }
    if let Some(list) = tx.access_list() {
        for tuple in list {
            gas = gas.checked_add(ACCESS_LIST_ADDR_GAS)?;
            let keys = (tuple.storage_keys.len() as u64)
                .checked_mul(ACCESS_LIST_KEY_GAS)?;
            gas = gas.checked_add(keys)?;
        }
    }
    Some(gas)
}

/// Price actually paid per gas unit under `base_fee`, or `None` when the fee
/// cap cannot cover the base fee.
pub fn effective_gas_price(tx: &dyn TxLike, base_fee: &Wei) -> Option<Wei> {
    let tip = effective_tip(tx, base_fee)?;
    let base: U256 = *base_fee.as_ref();
    Some(Wei::from(base + U256::from(tip)))
}

/// Priority fee per gas unit above `base_fee`: `min(tip_cap, fee_cap -
/// base_fee)`.
pub fn effective_tip(tx: &dyn TxLike, base_fee: &Wei) -> Option<Wei> {
    let fee_cap: U256 = *tx.gas_fee_cap().as_ref();
    let tip_cap: U256 = *tx.gas_tip_cap().as_ref();
    let base: U256 = *base_fee.as_ref();
    if fee_cap < base {
        return None
    }
    Some(Wei::from(tip_cap.min(fee_cap - base)))
}

#[derive(RlpDecodable, RlpEncodable, Debug)]
pub struct TxLegacy {
    nonce: u64,
    gas_price: Wei,
    gas: Gas,
    to: NullableAddr,
    value: Wei,
    data: Bytes,
    v: U256RLP,
    r: U256RLP,
    s: U256RLP,
}

impl TxLegacy {
    pub fn new(
        chain_id: U256, nonce: u64, gas_price: Wei, gas: Gas,
        to: Option<Addr>, value: Wei, data: Bytes,
    ) -> Self {
        // pre-signature v carries the EIP-155 chain id
        Self {
            nonce,
            gas_price,
            gas,
            to: NullableAddr(to),
            value,
            data,
            v: U256RLP(chain_id * 2 + U256::from(35u64)),
            r: U256RLP(U256::zero()),
            s: U256RLP(U256::zero()),
        }
    }

    fn derive_chain_id(&self) -> U256 {
        let v = &self.v.0;
        if v.bits() <= 64 {
            let v = v.low_u64();
            if v == 27 || v == 28 {
                return U256::zero()
            }
            // hostile v below the EIP-155 floor must not underflow
            return match v.checked_sub(35) {
                Some(shifted) => (shifted / 2).into(),
                None => U256::zero(),
            }
        }
        (v - 35) / 2
    }
}

impl Signable for TxLegacy {
    fn set_signature(&mut self, v: U256, r: U256, s: U256) {
        self.v = U256RLP(v);
        self.r = U256RLP(r);
        self.s = U256RLP(s);
    }
}

impl TxLike for TxLegacy {
    fn encode(&self) -> Vec<u8> {
        rlp::encode(self).as_mut().to_vec()
    }

    fn type_(&self) -> TxType {
        TxType::Legacy
    }
    fn chain_id(&self) -> U256 {
        self.derive_chain_id()
    }
    fn access_list(&self) -> Option<&[AccessTuple]> {
        None
    }
    fn data(&self) -> &Bytes {
        &self.data
    }
    fn gas(&self) -> Gas {
        self.gas
    }
    fn gas_fee_cap(&self) -> &Wei {
        &self.gas_price
    }
    fn gas_tip_cap(&self) -> &Wei {
        &self.gas_price
    }
    fn gas_price(&self) -> &Wei {
        &self.gas_price
    }
    fn value(&self) -> &Wei {
        &self.value
    }
    fn nonce(&self) -> u64 {
        self.nonce
    }
    fn to(&self) -> Option<&Addr> {
        self.to.0.as_ref()
    }
    fn v(&self) -> &U256 {
        &self.v.0
    }
    fn r(&self) -> &U256 {
        &self.r.0
    }
    fn s(&self) -> &U256 {
        &self.s.0
    }
    fn sig_hash(&self, chain_id: U256) -> Hash {
        if chain_id.is_zero() {
            // Homestead signer
            let mut stream = rlp::RlpStream::new_list(6);
            stream
                .append(&self.nonce)
                .append(&self.gas_price)
                .append(&self.gas);
            match &self.to.0 {
                Some(addr) => stream.append(addr),
                None => stream.append_empty_data(),
            }
            .append(&self.value)
            .append(&self.data);
            return Hash::hash(&stream.out())
        }
        let mut stream = rlp::RlpStream::new_list(9);
        stream
            .append(&self.nonce)
            .append(&self.gas_price)
            .append(&self.gas);
        match &self.to.0 {
            Some(addr) => stream.append(addr),
            None => stream.append_empty_data(),
        }
        .append(&self.value)
        .append(&self.data)
        .append(&U256RLP(chain_id))
        .append(&0u64)
        .append(&0u64);
        Hash::hash(&stream.out())
    }
    fn protected(&self) -> bool {
        let v = self.v();
        if v.bits() <= 8 {
            let v = v.low_u64();
            return v != 27 && v != 28 && v != 1 && v != 0
        }
        true
    }
}

#[derive(RlpDecodable, RlpEncodable, Debug)]
pub struct TxDynamicFee {
    chain_id: U256RLP,
    nonce: u64,
    gas_tip_cap: Wei,
    gas_fee_cap: Wei,
    gas: Gas,
    to: NullableAddr,
    value: Wei,
    data: Bytes,
    access_list: Vec<AccessTuple>,
    v: U256RLP,
    r: U256RLP,
    s: U256RLP,
}

impl TxDynamicFee {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        chain_id: U256, nonce: u64, gas_tip_cap: Wei, gas_fee_cap: Wei,
        gas: Gas, to: Option<Addr>, value: Wei, data: Bytes,
        access_list: Vec<AccessTuple>,
    ) -> Self {
        Self {
            chain_id: U256RLP(chain_id),
            nonce,
            gas_tip_cap,
            gas_fee_cap,
            gas,
            to: NullableAddr(to),
            value,
            data,
            access_list,
            v: U256RLP(U256::zero()),
            r: U256RLP(U256::zero()),
            s: U256RLP(U256::zero()),
        }
    }
}

impl Signable for TxDynamicFee {
    fn set_signature(&mut self, v: U256, r: U256, s: U256) {
        self.v = U256RLP(v);
        self.r = U256RLP(r);
        self.s = U256RLP(s);
    }
}

impl TxLike for TxDynamicFee {
    fn encode(&self) -> Vec<u8> {
        let mut rlp0 = rlp::RlpStream::new();
        rlp0.append(self);
        let mut buff = vec![Tx::DYNAMIC_FEE];
        buff.write_all(rlp0.out().as_ref()).ok();
        buff
    }

    fn type_(&self) -> TxType {
        TxType::DynamicFee
    }
    fn chain_id(&self) -> U256 {
        self.chain_id.0
    }
    fn access_list(&self) -> Option<&[AccessTuple]> {
        Some(&self.access_list)
    }
    fn data(&self) -> &Bytes {
        &self.data
    }
    fn gas(&self) -> Gas {
        self.gas
    }
    fn gas_fee_cap(&self) -> &Wei {
        &self.gas_fee_cap
    }
    fn gas_tip_cap(&self) -> &Wei {
        &self.gas_tip_cap
    }
    fn gas_price(&self) -> &Wei {
        &self.gas_fee_cap
    }
    fn value(&self) -> &Wei {
        &self.value
    }
    fn nonce(&self) -> u64 {
        self.nonce
    }
    fn to(&self) -> Option<&Addr> {
        self.to.0.as_ref()
    }
    fn v(&self) -> &U256 {
        &self.v.0
    }
    fn r(&self) -> &U256 {
        &self.r.0
    }
    fn s(&self) -> &U256 {
        &self.s.0
    }
    fn sig_hash(&self, chain_id: U256) -> Hash {
        let mut stream = rlp::RlpStream::new_list(9);
        stream
            .append(&U256RLP(chain_id))
            .append(&self.nonce)
            .append(&self.gas_tip_cap)
            .append(&self.gas_fee_cap)
            .append(&self.gas);
        match &self.to.0 {
            Some(addr) => stream.append(addr),
            None => stream.append_empty_data(),
        }
        .append(&self.value)
        .append(&self.data)
        .append(&AccessListEncoder(&self.access_list));
        let mut hasher = sha3::Keccak256::new();
        hasher.update([self.type_() as u8]);
        hasher.update(stream.out());
        Hash::from_slice(hasher.finalize().as_slice())
    }
}

#[derive(RlpDecodable, RlpEncodable, Debug)]
pub struct TxAccessList {
    chain_id: U256RLP,
    nonce: u64,
    gas_price: Wei,
    gas: Gas,
    to: NullableAddr,
    value: Wei,
    data: Bytes,
    access_list: Vec<AccessTuple>,
    v: U256RLP,
    r: U256RLP,
    s: U256RLP,
}

impl TxAccessList {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        chain_id: U256, nonce: u64, gas_price: Wei, gas: Gas,
        to: Option<Addr>, value: Wei, data: Bytes,
        access_list: Vec<AccessTuple>,
    ) -> Self {
        Self {
            chain_id: U256RLP(chain_id),
            nonce,
            gas_price,
            gas,
            to: NullableAddr(to),
            value,
            data,
            access_list,
            v: U256RLP(U256::zero()),
            r: U256RLP(U256::zero()),
            s: U256RLP(U256::zero()),
        }
    }
}

impl Signable for TxAccessList {
    fn set_signature(&mut self, v: U256, r: U256, s: U256) {
        self.v = U256RLP(v);
        self.r = U256RLP(r);
        self.s = U256RLP(s);
    }
}

impl TxLike for TxAccessList {
    fn encode(&self) -> Vec<u8> {
        let mut rlp0 = rlp::RlpStream::new();
        rlp0.append(self);
        let mut buff = vec![Tx::ACCESS_LIST];
        buff.write_all(rlp0.out().as_ref()).ok();
        buff
    }

    fn type_(&self) -> TxType {
        TxType::AccessList
    }
    fn chain_id(&self) -> U256 {
        self.chain_id.0
    }
    fn access_list(&self) -> Option<&[AccessTuple]> {
        Some(&self.access_list)
    }
    fn data(&self) -> &Bytes {
        &self.data
    }
    fn gas(&self) -> Gas {
        self.gas
    }
    fn gas_fee_cap(&self) -> &Wei {
        &self.gas_price
    }
    fn gas_tip_cap(&self) -> &Wei {
        &self.gas_price
    }
    fn gas_price(&self) -> &Wei {
        &self.gas_price
    }
    fn value(&self) -> &Wei {
        &self.value
    }
    fn nonce(&self) -> u64 {
        self.nonce
    }
    fn to(&self) -> Option<&Addr> {
        self.to.0.as_ref()
    }
    fn v(&self) -> &U256 {
        &self.v.0
    }
    fn r(&self) -> &U256 {
        &self.r.0
    }
    fn s(&self) -> &U256 {
        &self.s.0
    }
    fn sig_hash(&self, chain_id: U256) -> Hash {
        let mut stream = rlp::RlpStream::new_list(8);
        stream
            .append(&U256RLP(chain_id))
            .append(&self.nonce)
            .append(&self.gas_price)
            .append(&self.gas);
        match &self.to.0 {
            Some(addr) => stream.append(addr),
            None => stream.append_empty_data(),
        }
        .append(&self.value)
        .append(&self.data)
        .append(&AccessListEncoder(&self.access_list));
        let mut hasher = sha3::Keccak256::new();
        hasher.update([self.type_() as u8]);
        hasher.update(stream.out());
        Hash::from_slice(hasher.finalize().as_slice())
    }
}

/// EIP-4844 blob-carrying transaction. The recipient is mandatory and the
/// blob payload itself never enters the execution payload, only the
/// versioned hashes do.
#[derive(RlpDecodable, RlpEncodable, Debug)]
pub struct TxBlob {
    chain_id: U256RLP,
    nonce: u64,
    gas_tip_cap: Wei,
    gas_fee_cap: Wei,
    gas: Gas,
    to: Addr,
    value: Wei,
    data: Bytes,
    access_list: Vec<AccessTuple>,
    max_fee_per_blob_gas: Wei,
    blob_hashes: Vec<Hash>,
    v: U256RLP,
    r: U256RLP,
    s: U256RLP,
}

impl TxBlob {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        chain_id: U256, nonce: u64, gas_tip_cap: Wei, gas_fee_cap: Wei,
        gas: Gas, to: Addr, value: Wei, data: Bytes,
        access_list: Vec<AccessTuple>, max_fee_per_blob_gas: Wei,
        blob_hashes: Vec<Hash>,
    ) -> Self {
        Self {
            chain_id: U256RLP(chain_id),
            nonce,
            gas_tip_cap,
            gas_fee_cap,
            gas,
            to,
            value,
            data,
            access_list,
            max_fee_per_blob_gas,
            blob_hashes,
            v: U256RLP(U256::zero()),
            r: U256RLP(U256::zero()),
            s: U256RLP(U256::zero()),
        }
    }

}

impl Signable for TxBlob {
    fn set_signature(&mut self, v: U256, r: U256, s: U256) {
        self.v = U256RLP(v);
        self.r = U256RLP(r);
        self.s = U256RLP(s);
    }
}

impl TxLike for TxBlob {
    fn encode(&self) -> Vec<u8> {
        let mut rlp0 = rlp::RlpStream::new();
        rlp0.append(self);
        let mut buff = vec![Tx::BLOB];
        buff.write_all(rlp0.out().as_ref()).ok();
        buff
    }

    fn type_(&self) -> TxType {
        TxType::Blob
    }
    fn chain_id(&self) -> U256 {
        self.chain_id.0
    }
    fn access_list(&self) -> Option<&[AccessTuple]> {
        Some(&self.access_list)
    }
    fn data(&self) -> &Bytes {
        &self.data
    }
    fn gas(&self) -> Gas {
        self.gas
    }
    fn gas_fee_cap(&self) -> &Wei {
        &self.gas_fee_cap
    }
    fn gas_tip_cap(&self) -> &Wei {
        &self.gas_tip_cap
    }
    fn gas_price(&self) -> &Wei {
        &self.gas_fee_cap
    }
    fn value(&self) -> &Wei {
        &self.value
    }
    fn nonce(&self) -> u64 {
        self.nonce
    }
    fn to(&self) -> Option<&Addr> {
        Some(&self.to)
    }
    fn blob_hashes(&self) -> &[Hash] {
        &self.blob_hashes
    }
    fn max_fee_per_blob_gas(&self) -> &Wei {
        &self.max_fee_per_blob_gas
    }
    fn v(&self) -> &U256 {
        &self.v.0
    }
    fn r(&self) -> &U256 {
        &self.r.0
    }
    fn s(&self) -> &U256 {
        &self.s.0
    }
    fn sig_hash(&self, chain_id: U256) -> Hash {
        let mut stream = rlp::RlpStream::new_list(11);
        stream
            .append(&U256RLP(chain_id))
            .append(&self.nonce)
            .append(&self.gas_tip_cap)
            .append(&self.gas_fee_cap)
            .append(&self.gas)
            .append(&self.to)
            .append(&self.value)
            .append(&self.data)
            .append(&AccessListEncoder(&self.access_list))
            .append(&self.max_fee_per_blob_gas)
            .append_list(&self.blob_hashes);
        let mut hasher = sha3::Keccak256::new();
        hasher.update([self.type_() as u8]);
        hasher.update(stream.out());
        Hash::from_slice(hasher.finalize().as_slice())
    }
}

struct AccessListEncoder<'a>(&'a [AccessTuple]);

impl<'a> rlp::Encodable for AccessListEncoder<'a> {
    fn rlp_append(&self, s: &mut rlp::RlpStream) {
        let mut s = s.begin_list(self.0.len());
        for a in self.0.iter() {
            s = s.append(a);
        }
    }
}

#[inline]
fn secp256k1_n() -> &'static U256 {
    use std::str::FromStr;
    static V: OnceCell<U256> = OnceCell::new();
    V.get_or_init(|| U256::from_str("0xfffffffffffffffffffffffffffffffebaaedce6af48a03bbfd25e8cd0364141").unwrap())
}

#[inline]
fn secp256k1_half_n() -> &'static U256 {
    static V: OnceCell<U256> = OnceCell::new();
    V.get_or_init(|| secp256k1_n() / 2)
}

fn recover_plain(
    tx_hash: &Hash, r: U256, s: U256, vb: U256, homestead: bool,
) -> Option<Addr> {
    use crate::common::Bytes32;
    if vb.bits() > 8 {
        return None
    }
    let v = vb.low_u64().checked_sub(27)?;
    // `ValidateSignatureValues` in geth
    if &r < u256_1() || &s < u256_1() {
        return None
    }
    if homestead && &s > secp256k1_half_n() {
        return None
    }
    if &r >= secp256k1_n() || &s >= secp256k1_n() || (v != 0 && v != 1) {
        return None
    }
    //
    let r: Bytes32 = (&r).into();
    let s: Bytes32 = (&s).into();
    let mut r1 = libsecp256k1::curve::Scalar([0; 8]);
    let mut s1 = libsecp256k1::curve::Scalar([0; 8]);
    drop(r1.set_b32(&r));
    drop(s1.set_b32(&s));
    let sig = libsecp256k1::Signature { r: r1, s: s1 };
    let msg = libsecp256k1::Message::parse_slice(tx_hash.as_bytes()).ok()?;
    let recover_id = libsecp256k1::RecoveryId::parse(v as u8).ok()?;
    let pubkey = libsecp256k1::recover(&msg, &sig, &recover_id)
        .ok()?
        .serialize();
    if pubkey[0] != 4 {
        return None
    }
    Some(Addr::from_slice(
        &sha3::Keccak256::digest(&pubkey[1..]).as_slice()[12..],
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    pub fn test_key(seed: u8) -> libsecp256k1::SecretKey {
        let mut raw = [seed; 32];
        raw[0] = 1;
        libsecp256k1::SecretKey::parse(&raw).unwrap()
    }

    pub fn key_addr(key: &libsecp256k1::SecretKey) -> Addr {
        let pubkey = libsecp256k1::PublicKey::from_secret_key(key).serialize();
        Addr::from_slice(
            &sha3::Keccak256::digest(&pubkey[1..]).as_slice()[12..],
        )
    }

    #[test]
    fn sign_and_recover_every_type() {
        let chain_id = U256::from(43214u64);
        let key = test_key(7);
        let expected = key_addr(&key);
        let to = Addr::from([9u8; 20]);

        let legacy = TxLegacy::new(
            chain_id,
            0,
            Wei::from(25_000_000_000u64),
            21000,
            Some(to.clone()),
            Wei::from(1u64),
            Bytes::empty(),
        );
        let tx = Tx::sign(legacy, &key).unwrap();
        assert_eq!(tx.from(), &expected);
        assert_eq!(tx.type_(), TxType::Legacy);

        let dynamic = TxDynamicFee::new(
            chain_id,
            1,
            Wei::from(1u64),
            Wei::from(30_000_000_000u64),
            21000,
            Some(to.clone()),
            Wei::from(2u64),
            Bytes::empty(),
            vec![],
        );
        let tx = Tx::sign(dynamic, &key).unwrap();
        assert_eq!(tx.from(), &expected);
        assert_eq!(tx.type_(), TxType::DynamicFee);

        let access = TxAccessList::new(
            chain_id,
            2,
            Wei::from(25_000_000_000u64),
            30000,
            Some(to.clone()),
            Wei::from(0u64),
            Bytes::empty(),
            vec![AccessTuple {
                address: to.clone(),
                storage_keys: vec![Hash::zero().clone()],
            }],
        );
        let tx = Tx::sign(access, &key).unwrap();
        assert_eq!(tx.from(), &expected);

        let blob = TxBlob::new(
            chain_id,
            3,
            Wei::from(1u64),
            Wei::from(30_000_000_000u64),
            21000,
            to,
            Wei::from(0u64),
            Bytes::empty(),
            vec![],
            Wei::from(1u64),
            vec![Hash::hash(b"blob")],
        );
        let tx = Tx::sign(blob, &key).unwrap();
        assert_eq!(tx.from(), &expected);
        assert_eq!(tx.blob_hashes().len(), 1);
    }

    #[test]
    fn decode_roundtrips_the_wire_encoding() {
        let chain_id = U256::from(1u64);
        let key = test_key(3);
        let tx = Tx::sign(
            TxDynamicFee::new(
                chain_id,
                5,
                Wei::from(2u64),
                Wei::from(100u64),
                50000,
                None,
                Wei::from(0u64),
                Bytes::from(vec![0x00, 0x01, 0x02]),
                vec![],
            ),
            &key,
        )
        .unwrap();
        let raw = tx.encode();
        let decoded = Tx::decode(&raw, &chain_id).unwrap();
        assert_eq!(decoded.hash(), tx.hash());
        assert_eq!(decoded.from(), tx.from());
        assert_eq!(decoded.nonce(), 5);
        // foreign chain id is refused
        assert!(Tx::decode(&raw, &U256::from(2u64)).is_none());
    }

    #[test]
    fn hostile_legacy_v_values_are_refused() {
        // v values below every valid range used to underflow during chain
        // id derivation and recovery; they must decode to None instead
        for v in [0u64, 1, 5, 26, 30, 34] {
            let mut tx = TxLegacy::new(
                U256::from(1u64),
                0,
                Wei::from(1u64),
                21_000,
                Some(Addr::from([1u8; 20])),
                Wei::from(0u64),
                Bytes::empty(),
            );
            tx.set_signature(U256::from(v), U256::one(), U256::one());
            let raw = tx.encode();
            assert!(Tx::decode(&raw, &U256::from(1u64)).is_none());
            assert!(Tx::decode(&raw, &U256::zero()).is_none());
        }
    }

    #[test]
    fn predicate_pack_unpack_roundtrip() {
        for len in [0usize, 1, 31, 32, 33, 100] {
            let predicate: Vec<u8> = (0..len).map(|i| (i % 251) as u8 + 1).collect();
            let keys = pack_predicate(&predicate);
            assert_eq!(keys.len(), (len + 1 + 31) / 32);
            assert_eq!(unpack_predicate(&keys).unwrap(), predicate);
        }
        // missing delimiter
        assert_eq!(unpack_predicate(&[Hash::zero().clone()]), None);
        assert_eq!(unpack_predicate(&[]), None);
    }

    #[test]
    fn intrinsic_gas_counts_data_and_access_list() {
        let chain_id = U256::from(1u64);
        let key = test_key(4);
        let plain = Tx::sign(
            TxLegacy::new(
                chain_id,
                0,
                Wei::from(1u64),
                21000,
                Some(Addr::from([1u8; 20])),
                Wei::from(0u64),
                Bytes::empty(),
            ),
            &key,
        )
        .unwrap();
        assert_eq!(intrinsic_gas(&*plain), Some(21000));

        let with_data = Tx::sign(
            TxAccessList::new(
                chain_id,
                0,
                Wei::from(1u64),
                100_000,
                Some(Addr::from([1u8; 20])),
                Wei::from(0u64),
                Bytes::from(vec![0, 0, 1, 2]),
                vec![AccessTuple {
                    address: Addr::from([2u8; 20]),
                    storage_keys: vec![Hash::zero().clone(); 2],
                }],
            ),
            &key,
        )
        .unwrap();
        // 21000 + 2*4 + 2*16 + 2400 + 2*1900
        assert_eq!(intrinsic_gas(&*with_data), Some(21000 + 40 + 2400 + 3800));

        let create = Tx::sign(
            TxLegacy::new(
                chain_id,
                0,
                Wei::from(1u64),
                100_000,
                None,
                Wei::from(0u64),
                Bytes::empty(),
            ),
            &key,
        )
        .unwrap();
        assert_eq!(intrinsic_gas(&*create), Some(21000 + 32000));
    }

    #[test]
    fn effective_price_respects_caps() {
        let chain_id = U256::from(1u64);
        let key = test_key(5);
        let tx = Tx::sign(
            TxDynamicFee::new(
                chain_id,
                0,
                Wei::from(3u64),
                Wei::from(100u64),
                21000,
                Some(Addr::from([1u8; 20])),
                Wei::from(0u64),
                Bytes::empty(),
                vec![],
            ),
            &key,
        )
        .unwrap();
        // tip-cap bound
        assert_eq!(
            effective_gas_price(&*tx, &Wei::from(90u64)),
            Some(Wei::from(93u64))
        );
        // fee-cap bound
        assert_eq!(
            effective_gas_price(&*tx, &Wei::from(99u64)),
            Some(Wei::from(100u64))
        );
        // base fee above the cap
        assert_eq!(effective_gas_price(&*tx, &Wei::from(101u64)), None);
    }
}
