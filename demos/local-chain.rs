use std::io::Write;
use std::sync::Arc;

use serde_json::json;

use sevm::chain::BlockStore;
use sevm::common::{Addr, Bytes, Hash, Wei, U256};
use sevm::error::WarpError;
use sevm::evm::NullInterpreter;
use sevm::kv::MemKv;
use sevm::tx::{Tx, TxLegacy};
use sevm::vm::{ChainContext, ChainVm, VmState};
use sevm::warp::validators::{Validator, ValidatorState};

const CHAIN_ID: u64 = 43_999;
const GWEI: u64 = 1_000_000_000;

struct NoValidators;

impl ValidatorState for NoValidators {
    fn subnet_id(&self, _: &Hash) -> Result<Hash, WarpError> {
        Ok(Hash::hash(b"demo subnet"))
    }
    fn validator_set(
        &self, _: u64, _: &Hash,
    ) -> Result<Vec<Validator>, WarpError> {
        Ok(vec![])
    }
}

fn main() {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info"),
    )
    .format(|buf, r| writeln!(buf, "{}: {}", r.level(), r.args()))
    .init();

    let k = libsecp256k1::SecretKey::parse(&[0x42; 32]).unwrap();
    let pubkey = libsecp256k1::PublicKey::from_secret_key(&k).serialize();
    let alice = Addr::from_slice(&Hash::hash(&pubkey[1..]).as_bytes()[12..]);

    let genesis = serde_json::to_vec(&json!({
        "chainId": CHAIN_ID,
        "networkId": 1,
        "alloc": {
            format!("0x{}", hex::encode(alice.as_bytes())):
                { "balance": "0xd3c21bcecceda1000000" }
        },
        "precompileUpgrades": [],
    }))
    .unwrap();

    let kv = Arc::new(MemKv::new());
    let vm = ChainVm::new(kv.clone(), Arc::new(NullInterpreter));
    vm.initialize(
        &genesis,
        None,
        None,
        ChainContext {
            network_id: 1,
            subnet_id: Hash::hash(b"demo subnet"),
            blockchain_id: Hash::hash(b"demo chain"),
            validator_state: Arc::new(NoValidators),
            warp_signer: None,
        },
    )
    .unwrap();
    vm.set_state(VmState::Bootstrapping).unwrap();
    vm.set_state(VmState::NormalOp).unwrap();
    println!("chain up, alice={}", alice);

    let bob = Addr::from([0xb0; 20]);
    let tx = Tx::sign(
        TxLegacy::new(
            U256::from(CHAIN_ID),
            0,
            Wei::from(25 * GWEI),
            21_000,
            Some(bob.clone()),
            Wei::from(U256::exp10(18)),
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
    println!(
        "accepted block #{} hash={} gas_used={}",
        header.number,
        header.hash(),
        header.gas_used
    );
    let receipts = BlockStore::new(kv, U256::from(CHAIN_ID))
        .receipts(block.hash())
        .unwrap();
    println!(
        "transfer to {}: status={} gas={}",
        bob, receipts[0].status, receipts[0].cumulative_gas
    );
}
