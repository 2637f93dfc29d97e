//! Warp wire codec. An unsigned message is
//! `networkID (u32 BE) ‖ sourceChainID (32 bytes) ‖ payloadLen (u32 BE) ‖
//! payload`; a signed message appends
//! `signersBitsetLen (u32 BE) ‖ signersBitset ‖ aggregateSignature (96
//! bytes)`.

use bitvec::prelude::{BitVec, Lsb0};

use crate::bls::SIGNATURE_LEN;
use crate::common::{Addr, Bytes, Hash};
use crate::error::WarpError;

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize, what: &str) -> Result<&'a [u8], WarpError> {
        if self.buf.len() - self.pos < n {
            return Err(WarpError::InvalidWarpMsg(format!(
                "truncated {}: need {} bytes, have {}",
                what,
                n,
                self.buf.len() - self.pos
            )))
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u32(&mut self, what: &str) -> Result<u32, WarpError> {
        let raw = self.take(4, what)?;
        Ok(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    fn done(&self) -> bool {
        self.pos == self.buf.len()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnsignedMessage {
    pub network_id: u32,
    pub source_chain_id: Hash,
    pub payload: Bytes,
}

impl UnsignedMessage {
    pub fn new(network_id: u32, source_chain_id: Hash, payload: Bytes) -> Self {
        Self {
            network_id,
            source_chain_id,
            payload,
        }
    }

    pub fn bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + 32 + 4 + self.payload.len());
        out.extend_from_slice(&self.network_id.to_be_bytes());
        out.extend_from_slice(self.source_chain_id.as_bytes());
        out.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Message identity: keccak256 of the wire encoding.
    pub fn id(&self) -> Hash {
        Hash::hash(&self.bytes())
    }

    fn read(reader: &mut Reader) -> Result<Self, WarpError> {
        let network_id = reader.u32("network id")?;
        let source_chain_id =
            Hash::from_slice(reader.take(32, "source chain id")?);
        let payload_len = reader.u32("payload length")? as usize;
        let payload = Bytes::from(reader.take(payload_len, "payload")?);
        Ok(Self {
            network_id,
            source_chain_id,
            payload,
        })
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, WarpError> {
        let mut reader = Reader::new(bytes);
        let msg = Self::read(&mut reader)?;
        if !reader.done() {
            return Err(WarpError::InvalidWarpMsg(
                "trailing bytes after unsigned message".into(),
            ))
        }
        Ok(msg)
    }
}

/// A signed warp message: the unsigned body, the canonical-index signer
/// bitset, and the 96-byte aggregate signature.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub unsigned: UnsignedMessage,
    pub signers: BitVec<u8, Lsb0>,
    pub signature: [u8; SIGNATURE_LEN],
}

impl Message {
    pub fn new(
        unsigned: UnsignedMessage, signers: BitVec<u8, Lsb0>,
        signature: [u8; SIGNATURE_LEN],
    ) -> Self {
        Self {
            unsigned,
            signers,
            signature,
        }
    }

    pub fn num_signers(&self) -> usize {
        self.signers.count_ones()
    }

    pub fn bytes(&self) -> Vec<u8> {
        let bitset = self.signers.as_raw_slice();
        let mut out = self.unsigned.bytes();
        out.extend_from_slice(&(bitset.len() as u32).to_be_bytes());
        out.extend_from_slice(bitset);
        out.extend_from_slice(&self.signature);
        out
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, WarpError> {
        let mut reader = Reader::new(bytes);
        let unsigned = UnsignedMessage::read(&mut reader)?;
        let bitset_len = reader.u32("signer bitset length")? as usize;
        let bitset = reader.take(bitset_len, "signer bitset")?.to_vec();
        let sig_raw = reader.take(SIGNATURE_LEN, "aggregate signature")?;
        if !reader.done() {
            return Err(WarpError::InvalidWarpMsg(
                "trailing bytes after signature".into(),
            ))
        }
        let mut signature = [0u8; SIGNATURE_LEN];
        signature.copy_from_slice(sig_raw);
        Ok(Self {
            unsigned,
            signers: BitVec::from_vec(bitset),
            signature,
        })
    }
}

/// Payload addressed to a contract: `addrLen (u32 BE) ‖ addr ‖ data`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AddressedCall {
    pub source_address: Addr,
    pub payload: Bytes,
}

impl AddressedCall {
    pub fn bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + 20 + self.payload.len());
        out.extend_from_slice(&20u32.to_be_bytes());
        out.extend_from_slice(self.source_address.as_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, WarpError> {
        let mut reader = Reader::new(bytes);
        let addr_len = reader.u32("address length")? as usize;
        if addr_len != 20 {
            return Err(WarpError::InvalidWarpMsg(format!(
                "addressed call address must be 20 bytes, got {}",
                addr_len
            )))
        }
        let source_address = Addr::from_slice(reader.take(20, "address")?);
        let payload =
            Bytes::from(&reader.buf[reader.pos..]);
        Ok(Self {
            source_address,
            payload,
        })
    }
}

/// Payload carrying a bare 32-byte block hash.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockHashPayload {
    pub hash: Hash,
}

impl BlockHashPayload {
    pub fn bytes(&self) -> Vec<u8> {
        self.hash.as_bytes().to_vec()
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, WarpError> {
        if bytes.len() != 32 {
            return Err(WarpError::InvalidWarpMsg(format!(
                "block hash payload must be 32 bytes, got {}",
                bytes.len()
            )))
        }
        Ok(Self {
            hash: Hash::from_slice(bytes),
        })
    }
}
