//! Accessors backing the host's RPC handlers. The transport lives in the
//! host; everything here reads committed chain data and returns serde-ready
//! snapshots. Block-addressed queries take `None` for the latest accepted
//! block.

use std::sync::Arc;

use serde::Serialize;

use crate::block::Header;
use crate::chain::BlockStore;
use crate::common::{Addr, Hash, U256};
use crate::error::{StateError, VmError, WarpError};
use crate::kv::KvStore;
use crate::params::{ChainConfig, FeeConfig};
use crate::precompile::allowlist::{self, Role};
use crate::precompile::feemanager;
use crate::state::{MutableState, StateStore};
use crate::warp::backend::WarpBackend;

/// A locally produced warp message and its BLS signature, hex-encoded.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WarpSignatureResponse {
    pub message: String,
    pub signature: String,
}

/// The fee config in force at a block, with the height of its last
/// on-chain change when the fee manager has been used.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeeConfigSnapshot {
    pub fee_config: FeeConfig,
    pub last_changed_at: Option<u64>,
}

/// An address's standing on one allow list at a block.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleStatus {
    pub role: &'static str,
    pub is_enabled: bool,
}

fn role_name(role: Role) -> &'static str {
    match role {
        Role::None => "none",
        Role::Enabled => "enabled",
        Role::Manager => "manager",
        Role::Admin => "admin",
    }
}

fn state_err(e: StateError) -> VmError {
    VmError::Corrupted(e.to_string())
}

/// Read-only query surface over the accepted chain.
pub struct Api {
    config: ChainConfig,
    store: StateStore,
    blocks: BlockStore,
    warp: Arc<WarpBackend>,
}

impl Api {
    pub fn new(
        kv: Arc<dyn KvStore>, config: ChainConfig, warp: Arc<WarpBackend>,
    ) -> Self {
        let store = StateStore::new(kv.clone());
        let blocks = BlockStore::new(kv, U256::from(config.chain_id));
        Self {
            config,
            store,
            blocks,
            warp,
        }
    }

    fn header(&self, block: Option<&Hash>) -> Result<Header, VmError> {
        let hash = match block {
            Some(hash) => hash.clone(),
            None => self
                .blocks
                .last_accepted()
                .ok_or_else(|| VmError::Internal("no accepted block".into()))?,
        };
        self.blocks
            .header(&hash)
            .ok_or(VmError::UnknownBlock(hash))
    }

    fn state_of(&self, header: &Header) -> Result<MutableState, VmError> {
        self.store
            .mutable_state_at(&header.state_root)
            .map_err(state_err)
    }

    /// Signature over a warp message this node produced. The message must
    /// have been recorded by block acceptance.
    pub fn warp_signature(
        &self, id: &Hash,
    ) -> Result<WarpSignatureResponse, WarpError> {
        let message = self
            .warp
            .get_message(id)
            .ok_or_else(|| WarpError::UnknownMessage(id.clone()))?;
        let signature = self.warp.get_message_signature(id)?;
        Ok(WarpSignatureResponse {
            message: format!("0x{}", hex::encode(message.bytes())),
            signature: format!("0x{}", hex::encode(signature.to_bytes())),
        })
    }

    /// Fee config in force at `block`: the fee-manager stored one when
    /// active and configured, the static chain config otherwise.
    pub fn fee_config(
        &self, block: Option<&Hash>,
    ) -> Result<FeeConfigSnapshot, VmError> {
        let header = self.header(block)?;
        let rules = self.config.rules_at(header.number, header.timestamp);
        let state = self.state_of(&header)?;
        let fee_config =
            feemanager::effective_fee_config(&rules, &state).map_err(state_err)?;
        let last_changed_at =
            if rules.is_active_precompile(&feemanager::address()) {
                feemanager::last_changed_at(&state).map_err(state_err)?
            } else {
                None
            };
        Ok(FeeConfigSnapshot {
            fee_config,
            last_changed_at,
        })
    }

    /// `addr`'s role on the allow list hosted at `precompile`, read from the
    /// state at `block`. The precompile must be active there.
    pub fn allow_list_role(
        &self, block: Option<&Hash>, precompile: &Addr, addr: &Addr,
    ) -> Result<RoleStatus, VmError> {
        let header = self.header(block)?;
        let rules = self.config.rules_at(header.number, header.timestamp);
        if !rules.is_active_precompile(precompile) {
            return Err(VmError::InvalidConfig(format!(
                "no active allow list at {}",
                precompile
            )))
        }
        let state = self.state_of(&header)?;
        let role =
            allowlist::get_role(&state, precompile, addr).map_err(state_err)?;
        Ok(RoleStatus {
            role: role_name(role),
            is_enabled: role.is_enabled(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::Block;
    use crate::bls::SecretKey;
    use crate::common::Bytes;
    use crate::kv::MemKv;
    use crate::params::{
        precompile_key, PrecompileUpgrade, Threshold,
    };
    use crate::precompile::module;
    use crate::warp::message::UnsignedMessage;
    use std::collections::BTreeMap;

    fn chain_config(upgrades: Vec<PrecompileUpgrade>) -> ChainConfig {
        ChainConfig {
            chain_id: 1337,
            network_id: 1,
            fork_schedule: Default::default(),
            fee_config: FeeConfig::default(),
            precompile_upgrades: upgrades,
            alloc: BTreeMap::new(),
            genesis_timestamp: 0,
        }
    }

    fn accept_block_with_state(
        kv: &Arc<dyn KvStore>, config: &ChainConfig, seed: &dyn Fn(&mut MutableState),
    ) -> Hash {
        let store = StateStore::new(kv.clone());
        let root = store.commit_genesis(&BTreeMap::new()).unwrap();
        let mut state = store.mutable_state_at(&root).unwrap();
        seed(&mut state);
        let root = store.commit(&mut state).unwrap();
        let header = Header {
            number: 1,
            timestamp: 100,
            state_root: root,
            ..Default::default()
        };
        let block = Block::new(header, vec![]);
        let hash = block.hash().clone();
        BlockStore::new(kv.clone(), U256::from(config.chain_id))
            .put_accepted(&block, &[]);
        hash
    }

    #[test]
    fn fee_config_tracks_the_fee_manager() {
        let kv: Arc<dyn KvStore> = Arc::new(MemKv::new());
        let custom = FeeConfig {
            min_base_fee: 1_000_000_000,
            ..Default::default()
        };
        let params = serde_json::json!({
            "initialFeeConfig": &custom,
        });
        let config = chain_config(vec![PrecompileUpgrade {
            key: precompile_key::FEE_MANAGER.into(),
            activation: Threshold::Timestamp(0),
            disable: false,
            params: params.clone(),
        }]);
        let hash = accept_block_with_state(&kv, &config, &|state| {
            module(precompile_key::FEE_MANAGER)
                .unwrap()
                .configure(&params, state, 1)
                .unwrap();
        });

        let warp = Arc::new(WarpBackend::new(kv.clone(), None));
        let api = Api::new(kv, config, warp);
        let snapshot = api.fee_config(Some(&hash)).unwrap();
        assert_eq!(snapshot.fee_config, custom);
        assert_eq!(snapshot.last_changed_at, Some(1));

        // the latest block is the same one
        let latest = api.fee_config(None).unwrap();
        assert_eq!(latest.fee_config, custom);
    }

    #[test]
    fn fee_config_without_the_manager_is_static() {
        let kv: Arc<dyn KvStore> = Arc::new(MemKv::new());
        let config = chain_config(vec![]);
        let hash = accept_block_with_state(&kv, &config, &|_| {});
        let warp = Arc::new(WarpBackend::new(kv.clone(), None));
        let api = Api::new(kv, config, warp);
        let snapshot = api.fee_config(Some(&hash)).unwrap();
        assert_eq!(snapshot.fee_config, FeeConfig::default());
        assert_eq!(snapshot.last_changed_at, None);
    }

    #[test]
    fn allow_list_roles_are_readable() {
        let kv: Arc<dyn KvStore> = Arc::new(MemKv::new());
        let admin = Addr::from([0xaa; 20]);
        let nobody = Addr::from([0xbb; 20]);
        let host = crate::precompile::txallowlist::address();
        let config = chain_config(vec![PrecompileUpgrade {
            key: precompile_key::TX_ALLOW_LIST.into(),
            activation: Threshold::Timestamp(0),
            disable: false,
            params: serde_json::json!({}),
        }]);
        let hash = accept_block_with_state(&kv, &config, &|state| {
            allowlist::set_role(state, &host, &admin, Role::Admin).unwrap();
        });
        let warp = Arc::new(WarpBackend::new(kv.clone(), None));
        let api = Api::new(kv, config, warp);

        let status =
            api.allow_list_role(Some(&hash), &host, &admin).unwrap();
        assert_eq!(status.role, "admin");
        assert!(status.is_enabled);
        let status =
            api.allow_list_role(Some(&hash), &host, &nobody).unwrap();
        assert_eq!(status.role, "none");
        assert!(!status.is_enabled);

        // an inactive host address is refused
        let other = crate::precompile::nativeminter::address();
        assert!(api.allow_list_role(Some(&hash), &other, &admin).is_err());
    }

    #[test]
    fn warp_signatures_cover_recorded_messages() {
        let kv: Arc<dyn KvStore> = Arc::new(MemKv::new());
        let secret = SecretKey::key_gen(&[7u8; 32]).unwrap();
        let public = secret.public_key();
        let warp = Arc::new(WarpBackend::new(kv.clone(), Some(secret)));
        let msg = UnsignedMessage::new(
            1,
            Hash::hash(b"chain"),
            Bytes::from(vec![1, 2, 3]),
        );
        warp.add_message(&msg);

        let api = Api::new(kv, chain_config(vec![]), warp);
        let response = api.warp_signature(&msg.id()).unwrap();
        assert_eq!(
            response.message,
            format!("0x{}", hex::encode(msg.bytes()))
        );
        let raw = hex::decode(&response.signature[2..]).unwrap();
        let signature = crate::bls::Signature::from_bytes(&raw).unwrap();
        assert!(signature.verify(&public, &msg.bytes()));

        let unknown = Hash::hash(b"unknown");
        assert!(matches!(
            api.warp_signature(&unknown),
            Err(WarpError::UnknownMessage(_))
        ));
    }
}
