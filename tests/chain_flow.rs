//! End-to-end flows through the plugin surface: genesis bring-up, value
//! transfer settlement, and precompile activation at a fork boundary.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::json;

use sevm::api::Api;
use sevm::builder::Clock;
use sevm::chain::BlockStore;
use sevm::common::{Addr, Bytes, Hash, Wei, U256};
use sevm::error::{VmError, WarpError};
use sevm::evm::NullInterpreter;
use sevm::kv::MemKv;
use sevm::params::{precompile_key, ChainConfig};
use sevm::precompile::{feemanager, selector};
use sevm::state::StateStore;
use sevm::tx::{Tx, TxLegacy};
use sevm::vm::{ChainContext, ChainVm, VmState};
use sevm::warp::backend::WarpBackend;
use sevm::warp::validators::{Validator, ValidatorState};

const CHAIN_ID: u64 = 777;
const GWEI: u64 = 1_000_000_000;

struct NoValidators;

impl ValidatorState for NoValidators {
    fn subnet_id(&self, _: &Hash) -> Result<Hash, WarpError> {
        Ok(Hash::hash(b"subnet"))
    }
    fn validator_set(
        &self, _: u64, _: &Hash,
    ) -> Result<Vec<Validator>, WarpError> {
        Ok(vec![])
    }
}

/// A clock the test advances by hand.
struct StepClock(AtomicU64);

impl Clock for StepClock {
    fn unix_now(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

fn ctx() -> ChainContext {
    ChainContext {
        network_id: 1,
        subnet_id: Hash::hash(b"subnet"),
        blockchain_id: Hash::hash(b"chain"),
        validator_state: Arc::new(NoValidators),
        warp_signer: None,
    }
}

fn key(seed: u8) -> libsecp256k1::SecretKey {
    libsecp256k1::SecretKey::parse(&[seed; 32]).unwrap()
}

fn key_addr(key: &libsecp256k1::SecretKey) -> Addr {
    let pubkey = libsecp256k1::PublicKey::from_secret_key(key).serialize();
    Addr::from_slice(&Hash::hash(&pubkey[1..]).as_bytes()[12..])
}

fn hex_addr(addr: &Addr) -> String {
    format!("0x{}", hex::encode(addr.as_bytes()))
}

// 10^24 wei
const FUND_HEX: &str = "0xd3c21bcecceda1000000";

fn genesis_json(funded: &Addr, upgrades: serde_json::Value) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "chainId": CHAIN_ID,
        "networkId": 1,
        "alloc": { hex_addr(funded): { "balance": FUND_HEX } },
        "precompileUpgrades": upgrades,
    }))
    .unwrap()
}

fn fund() -> U256 {
    U256::exp10(24)
}

#[test]
fn genesis_only_chain_is_consistent() {
    let kv = Arc::new(MemKv::new());
    let k = key(0x21);
    let sender = key_addr(&k);
    let vm = ChainVm::with_clock(
        kv.clone(),
        Arc::new(NullInterpreter),
        Arc::new(StepClock(AtomicU64::new(1_000))),
    );
    vm.initialize(&genesis_json(&sender, json!([])), None, None, ctx())
        .unwrap();
    vm.set_state(VmState::Bootstrapping).unwrap();
    vm.set_state(VmState::NormalOp).unwrap();

    let genesis = vm.last_accepted_header().unwrap();
    assert_eq!(genesis.number, 0);
    assert_eq!(genesis.gas_used, 0);
    assert_eq!(genesis.base_fee, Wei::from(25 * GWEI));

    let store = StateStore::new(kv);
    let view = store.state_at(&genesis.state_root).unwrap();
    assert_eq!(*view.balance(&sender).unwrap().as_ref(), fund());
    assert_eq!(view.nonce(&sender).unwrap(), 0);

    assert!(matches!(vm.build_block(0), Err(VmError::NoPendingWork)));
}

#[test]
fn single_transfer_settles_exact_balances() {
    let kv = Arc::new(MemKv::new());
    let k = key(0x22);
    let sender = key_addr(&k);
    let vm = ChainVm::with_clock(
        kv.clone(),
        Arc::new(NullInterpreter),
        Arc::new(StepClock(AtomicU64::new(1_000))),
    );
    vm.initialize(&genesis_json(&sender, json!([])), None, None, ctx())
        .unwrap();
    vm.set_state(VmState::Bootstrapping).unwrap();
    vm.set_state(VmState::NormalOp).unwrap();

    let recipient = Addr::from([0xab; 20]);
    let value = Wei::from(U256::exp10(18));
    let tx = Tx::sign(
        TxLegacy::new(
            U256::from(CHAIN_ID),
            0,
            Wei::from(25 * GWEI),
            21_000,
            Some(recipient.clone()),
            value.clone(),
            Bytes::empty(),
        ),
        &k,
    )
    .unwrap();
    vm.submit_tx(&tx.encode()).unwrap();

    let block = vm.build_block(0).unwrap();
    vm.set_preference(block.hash().clone()).unwrap();
    vm.accept_block(block.hash()).unwrap();

    let header = vm.last_accepted_header().unwrap();
    assert_eq!(header.gas_used, 21_000);

    // price equals the base fee, so the whole fee burns
    let fee = U256::from(21_000u64) * U256::from(25 * GWEI);
    let store = StateStore::new(kv.clone());
    let view = store.state_at(&header.state_root).unwrap();
    assert_eq!(view.balance(&recipient).unwrap(), value);
    assert_eq!(
        *view.balance(&sender).unwrap().as_ref(),
        fund() - fee - U256::exp10(18)
    );
    assert_eq!(view.nonce(&sender).unwrap(), 1);
    assert_eq!(*view.balance(Addr::zero()).unwrap().as_ref(), U256::zero());

    let blocks = BlockStore::new(kv, U256::from(CHAIN_ID));
    let receipts = blocks.receipts(block.hash()).unwrap();
    assert_eq!(receipts.len(), 1);
    assert_eq!(receipts[0].status, 1);
    assert_eq!(receipts[0].cumulative_gas, 21_000);
}

#[test]
fn far_future_blocks_are_refused() {
    let kv = Arc::new(MemKv::new());
    let k = key(0x24);
    let sender = key_addr(&k);
    let genesis = genesis_json(&sender, json!([]));
    let vm = ChainVm::with_clock(
        kv.clone(),
        Arc::new(NullInterpreter),
        Arc::new(StepClock(AtomicU64::new(2_000))),
    );
    vm.initialize(&genesis, None, None, ctx()).unwrap();
    vm.set_state(VmState::Bootstrapping).unwrap();
    vm.set_state(VmState::NormalOp).unwrap();

    let tx = Tx::sign(
        TxLegacy::new(
            U256::from(CHAIN_ID),
            0,
            Wei::from(25 * GWEI),
            21_000,
            Some(Addr::from([0xab; 20])),
            Wei::from(1u64),
            Bytes::empty(),
        ),
        &k,
    )
    .unwrap();
    vm.submit_tx(&tx.encode()).unwrap();
    let block = vm.build_block(0).unwrap();
    assert_eq!(block.header().timestamp, 2_000);

    // a peer whose clock lags too far must not verify the block yet
    let lagging = Arc::new(StepClock(AtomicU64::new(500)));
    let vm2 = ChainVm::with_clock(
        kv.clone(),
        Arc::new(NullInterpreter),
        lagging.clone(),
    );
    vm2.initialize(&genesis, None, None, ctx()).unwrap();
    vm2.set_state(VmState::Bootstrapping).unwrap();
    let parsed = vm2.parse_block(&block.encode()).unwrap();
    match vm2.verify_block(parsed, 0) {
        Err(VmError::InvalidBlock(reason)) => {
            assert!(reason.contains("future"), "got: {}", reason)
        }
        other => panic!("expected rejection, got {:?}", other),
    }

    // within the allowed skew the same block verifies
    lagging.0.store(1_990, Ordering::SeqCst);
    let parsed = vm2.parse_block(&block.encode()).unwrap();
    vm2.verify_block(parsed, 0).unwrap();
}

#[test]
fn fee_manager_activates_at_the_timestamp_boundary() {
    let kv = Arc::new(MemKv::new());
    let k = key(0x23);
    let sender = key_addr(&k);
    let upgrades = json!([{
        "key": precompile_key::FEE_MANAGER,
        "activation": { "timestamp": 1_000u64 },
        "params": { "adminAddresses": [hex_addr(&sender)] },
    }]);
    let genesis = genesis_json(&sender, upgrades);

    let clock = Arc::new(StepClock(AtomicU64::new(500)));
    let vm = ChainVm::with_clock(
        kv.clone(),
        Arc::new(NullInterpreter),
        clock.clone(),
    );
    vm.initialize(&genesis, None, None, ctx()).unwrap();
    vm.set_state(VmState::Bootstrapping).unwrap();
    vm.set_state(VmState::NormalOp).unwrap();

    let call = |nonce: u64| {
        Tx::sign(
            TxLegacy::new(
                U256::from(CHAIN_ID),
                nonce,
                Wei::from(25 * GWEI),
                100_000,
                Some(feemanager::address()),
                Wei::zero().clone(),
                Bytes::from(selector("getFeeConfig()").to_vec()),
            ),
            &k,
        )
        .unwrap()
    };
    let blocks = BlockStore::new(kv.clone(), U256::from(CHAIN_ID));

    // before activation the reserved address hosts nothing and reverts
    vm.submit_tx(&call(0).encode()).unwrap();
    let before = vm.build_block(0).unwrap();
    assert_eq!(before.header().timestamp, 500);
    vm.set_preference(before.hash().clone()).unwrap();
    vm.accept_block(before.hash()).unwrap();
    let receipts = blocks.receipts(before.hash()).unwrap();
    assert_eq!(receipts[0].status, 0);

    // past the boundary the same call succeeds
    clock.0.store(1_500, Ordering::SeqCst);
    vm.submit_tx(&call(1).encode()).unwrap();
    let after = vm.build_block(0).unwrap();
    assert_eq!(after.header().timestamp, 1_500);
    vm.set_preference(after.hash().clone()).unwrap();
    vm.accept_block(after.hash()).unwrap();
    let receipts = blocks.receipts(after.hash()).unwrap();
    assert_eq!(receipts[0].status, 1);

    // the activation seeded the allow list
    let config = ChainConfig::from_json(&genesis).unwrap();
    let warp = Arc::new(WarpBackend::new(kv.clone(), None));
    let api = Api::new(kv, config, warp);
    let status = api
        .allow_list_role(None, &feemanager::address(), &sender)
        .unwrap();
    assert_eq!(status.role, "admin");
    let snapshot = api.fee_config(None).unwrap();
    assert_eq!(snapshot.fee_config.min_base_fee, 25 * GWEI);
    assert_eq!(snapshot.last_changed_at, None);
}
