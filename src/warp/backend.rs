//! Signing backend for outbound warp messages. Message intents are recorded
//! after the emitting block is durably accepted, then signed on demand when
//! relayers ask this node for its share of an aggregate signature.

use std::sync::Arc;

use crate::bls::{SecretKey, Signature};
use crate::common::Hash;
use crate::error::WarpError;
use crate::kv::{namespace, KvStore, PrefixDb};

use super::message::UnsignedMessage;

const INTENT_PREFIX: &[u8] = b"warp/";

pub struct WarpBackend {
    db: PrefixDb,
    signer: Option<SecretKey>,
}

impl WarpBackend {
    pub fn new(backend: Arc<dyn KvStore>, signer: Option<SecretKey>) -> Self {
        Self {
            db: PrefixDb::new(backend, namespace::META),
            signer,
        }
    }

    fn intent_key(id: &Hash) -> Vec<u8> {
        let mut key = INTENT_PREFIX.to_vec();
        key.extend_from_slice(id.as_bytes());
        key
    }

    /// Record a message emitted by an accepted block. Called off the writer
    /// path, after the block commit is durable.
    pub fn add_message(&self, unsigned: &UnsignedMessage) {
        let id = unsigned.id();
        self.db.put(&Self::intent_key(&id), &unsigned.bytes());
        log::debug!("recorded warp message intent {}", id);
    }

    pub fn get_message(&self, id: &Hash) -> Option<UnsignedMessage> {
        let raw = self.db.get(&Self::intent_key(id))?;
        UnsignedMessage::parse(&raw).ok()
    }

    /// This node's BLS signature share for a previously recorded message.
    pub fn get_message_signature(
        &self, id: &Hash,
    ) -> Result<Signature, WarpError> {
        let msg = self
            .get_message(id)
            .ok_or_else(|| WarpError::UnknownMessage(id.clone()))?;
        let signer = self.signer.as_ref().ok_or(WarpError::NoSigner)?;
        Ok(signer.sign(&msg.bytes()))
    }
}
