//! Warp predicates through the full block flow: quorum weight at the exact
//! boundary, builder exclusion of unverifiable messages, and rejection of a
//! peer block that claims one verified.

use std::sync::Arc;

use bitvec::prelude::{BitVec, Lsb0};
use serde_json::json;

use sevm::bls::{aggregate_signatures, SecretKey};
use sevm::builder::{BlockBuilder, Clock};
use sevm::common::{Addr, Bytes, Hash, Wei, U256};
use sevm::error::{VmError, WarpError};
use sevm::evm::NullInterpreter;
use sevm::kv::MemKv;
use sevm::mempool::Mempool;
use sevm::params::{precompile_key, ChainConfig, Rules};
use sevm::precompile::warp as warp_pc;
use sevm::processor::PredicateVerifier;
use sevm::state::StateStore;
use sevm::tx::{pack_predicate, AccessTuple, Tx, TxDynamicFee};
use sevm::vm::{ChainContext, ChainVm, VmState};
use sevm::warp::message::{Message, UnsignedMessage};
use sevm::warp::validators::{Validator, ValidatorState};

const CHAIN_ID: u64 = 777;
const GWEI: u64 = 1_000_000_000;
const VALIDATORS: usize = 100;
const WEIGHT: u64 = 20;

struct Registry {
    validators: Vec<Validator>,
}

impl ValidatorState for Registry {
    fn subnet_id(&self, _chain: &Hash) -> Result<Hash, WarpError> {
        Ok(Hash::hash(b"source subnet"))
    }
    fn validator_set(
        &self, _p_chain_height: u64, _subnet: &Hash,
    ) -> Result<Vec<Validator>, WarpError> {
        Ok(self.validators.clone())
    }
}

struct FixedClock(u64);

impl Clock for FixedClock {
    fn unix_now(&self) -> u64 {
        self.0
    }
}

struct PassAll;

impl PredicateVerifier for PassAll {
    fn verify(&self, _: &Rules, _: &[u8]) -> Result<(), WarpError> {
        Ok(())
    }
}

fn signer_keys() -> Vec<SecretKey> {
    (1..=VALIDATORS as u8)
        .map(|i| SecretKey::key_gen(&[i; 32]).unwrap())
        .collect()
}

/// Key indices in canonical (compressed-key ascending) order, the order the
/// signer bitset refers to.
fn canonical_order(keys: &[SecretKey]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..keys.len()).collect();
    order.sort_by_key(|&i| keys[i].public_key().to_bytes());
    order
}

fn registry(keys: &[SecretKey]) -> Arc<Registry> {
    Arc::new(Registry {
        validators: keys
            .iter()
            .enumerate()
            .map(|(i, k)| Validator {
                public_key: Some(k.public_key()),
                weight: WEIGHT,
                node_id: [i as u8; 20],
            })
            .collect(),
    })
}

/// A warp message signed by the first `signer_count` validators in
/// canonical order.
fn signed_message(
    keys: &[SecretKey], canonical: &[usize], signer_count: usize,
    payload: &[u8],
) -> Message {
    let unsigned = UnsignedMessage::new(
        1,
        Hash::hash(b"source chain"),
        Bytes::from(payload.to_vec()),
    );
    let mut signers: BitVec<u8, Lsb0> = BitVec::repeat(false, keys.len());
    let mut sigs = Vec::with_capacity(signer_count);
    for (bit, &key_idx) in canonical.iter().enumerate().take(signer_count) {
        signers.set(bit, true);
        sigs.push(keys[key_idx].sign(&unsigned.bytes()));
    }
    let refs: Vec<_> = sigs.iter().collect();
    let aggregate = aggregate_signatures(&refs).unwrap();
    Message::new(unsigned, signers, aggregate.to_bytes())
}

fn warp_tx(k: &libsecp256k1::SecretKey, nonce: u64, msg: &Message) -> Tx {
    Tx::sign(
        TxDynamicFee::new(
            U256::from(CHAIN_ID),
            nonce,
            Wei::zero().clone(),
            Wei::from(25 * GWEI),
            500_000,
            Some(Addr::from([0xee; 20])),
            Wei::zero().clone(),
            Bytes::empty(),
            vec![AccessTuple {
                address: warp_pc::address(),
                storage_keys: pack_predicate(&msg.bytes()),
            }],
        ),
        k,
    )
    .unwrap()
}

fn genesis_json(funded: &Addr) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "chainId": CHAIN_ID,
        "networkId": 1,
        "alloc": {
            format!("0x{}", hex::encode(funded.as_bytes())):
                { "balance": "0xd3c21bcecceda1000000" }
        },
        "precompileUpgrades": [{
            "key": precompile_key::WARP,
            "activation": { "timestamp": 0u64 },
            "params": {},
        }],
    }))
    .unwrap()
}

#[test]
fn quorum_weight_boundary_through_the_block_flow() {
    let keys = signer_keys();
    let canonical = canonical_order(&keys);
    let k = libsecp256k1::SecretKey::parse(&[0x31; 32]).unwrap();
    let pubkey = libsecp256k1::PublicKey::from_secret_key(&k).serialize();
    let sender = Addr::from_slice(&Hash::hash(&pubkey[1..]).as_bytes()[12..]);

    let kv = Arc::new(MemKv::new());
    let genesis = genesis_json(&sender);
    let vm = ChainVm::with_clock(
        kv.clone(),
        Arc::new(NullInterpreter),
        Arc::new(FixedClock(1_000)),
    );
    vm.initialize(
        &genesis,
        None,
        None,
        ChainContext {
            network_id: 1,
            subnet_id: Hash::hash(b"local subnet"),
            blockchain_id: Hash::hash(b"chain"),
            validator_state: registry(&keys),
            warp_signer: None,
        },
    )
    .unwrap();
    vm.set_state(VmState::Bootstrapping).unwrap();
    vm.set_state(VmState::NormalOp).unwrap();

    // 67 of 100 at weight 20 meets the 67/100 quorum exactly
    let msg67 = signed_message(&keys, &canonical, 67, b"pay");
    vm.submit_tx(&warp_tx(&k, 0, &msg67).encode()).unwrap();
    let block = vm.build_block(7).unwrap();
    assert_eq!(block.txs().len(), 1);
    vm.set_preference(block.hash().clone()).unwrap();
    vm.accept_block(block.hash()).unwrap();

    // one signer short: the builder refuses to include it
    let msg66 = signed_message(&keys, &canonical, 66, b"pay again");
    vm.submit_tx(&warp_tx(&k, 1, &msg66).encode()).unwrap();
    assert!(matches!(vm.build_block(7), Err(VmError::NoPendingWork)));

    // a peer block that declares the weak predicate verified is fatal
    let config = ChainConfig::from_json(&genesis).unwrap();
    let store = StateStore::new(kv.clone());
    let parent = vm.last_accepted_header().unwrap();
    let rules = config.rules_at(parent.number + 1, parent.timestamp + 1);
    let view = store.state_at(&parent.state_root).unwrap();
    let pool = Mempool::new(4);
    pool.add(
        Arc::new(warp_tx(&k, 1, &msg66)),
        &rules,
        &view,
        &parent.base_fee,
    )
    .unwrap();
    let builder = BlockBuilder {
        config: &config,
        store: &store,
        interpreter: &NullInterpreter,
        blockchain_id: Hash::hash(b"chain"),
        coinbase: Addr::zero().clone(),
        clock: &FixedClock(1_002),
    };
    let forged = builder.build(&parent, &pool, &PassAll).unwrap();
    assert_eq!(forged.txs().len(), 1);
    match vm.verify_block(forged, 7) {
        Err(VmError::InvalidBlock(reason)) => {
            assert!(reason.contains("predicate"), "got: {}", reason)
        }
        other => panic!("expected an invalid block, got {:?}", other),
    }
}
