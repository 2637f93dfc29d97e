//! EVM call dispatch. Owns value transfer, call depth, journaling and the
//! stateful-precompile hook; bytecode execution itself is behind the
//! [Interpreter] seam so the opcode engine can evolve independently of block
//! processing.

use bitvec::prelude::{BitVec, Lsb0};

use crate::common::{
    create_addr, create_addr2, Addr, Bytes, Gas, Hash, Wei,
};
use crate::error::ExecError;
use crate::params::{is_reserved_precompile_addr, Rules};
use crate::precompile::{self, PrecompileEnv, TxPredicates};
use crate::state::MutableState;

pub const MAX_CALL_DEPTH: usize = 1024;

/// Immutable facts about the enclosing block.
#[derive(Clone, Debug)]
pub struct BlockContext {
    pub number: u64,
    pub timestamp: u64,
    pub coinbase: Addr,
    pub base_fee: Wei,
    pub blob_gas_price: Wei,
    pub gas_limit: Gas,
    /// Host-assigned 32-byte id of this chain.
    pub blockchain_id: Hash,
}

/// Immutable facts about the executing transaction.
#[derive(Clone, Debug, Default)]
pub struct TxContext {
    pub origin: Addr,
    pub gas_price: Wei,
    /// Unpacked predicates in access-list order, with the block-level
    /// verification verdict for each.
    pub predicates: Vec<(Addr, Bytes)>,
    pub verified: BitVec<u8, Lsb0>,
}

impl TxContext {
    /// The predicate slice addressed to one precompile, verdicts aligned.
    fn predicates_for(&self, addr: &Addr) -> TxPredicates {
        let mut out = TxPredicates::default();
        for (i, (target, predicate)) in self.predicates.iter().enumerate() {
            if target == addr {
                out.predicates.push(predicate.clone());
                out.verified.push(
                    self.verified.get(i).map(|b| *b).unwrap_or(false),
                );
            }
        }
        out
    }
}

#[derive(Debug)]
pub struct CallOutput {
    pub ret: Bytes,
    pub gas_left: Gas,
    pub err: Option<ExecError>,
}

impl CallOutput {
    fn ok(ret: Bytes, gas_left: Gas) -> Self {
        Self {
            ret,
            gas_left,
            err: None,
        }
    }

    fn fail(gas_left: Gas, err: ExecError) -> Self {
        Self {
            ret: Bytes::empty(),
            gas_left,
            err: Some(err),
        }
    }
}

/// One code-execution frame handed to the interpreter.
pub struct Frame {
    pub caller: Addr,
    pub address: Addr,
    pub code: Bytes,
    pub input: Bytes,
    pub value: Wei,
    pub gas: Gas,
    pub read_only: bool,
}

/// The opcode engine. Sub-calls re-enter through [Evm::call] and
/// [Evm::create] so that journaling and the precompile hook apply uniformly
/// at every depth.
pub trait Interpreter: Send + Sync {
    fn execute(&self, evm: &mut Evm, frame: &Frame) -> CallOutput;
}

/// Placeholder engine for chains that only move value and talk to stateful
/// precompiles: any attempt to run actual bytecode reverts.
pub struct NullInterpreter;

impl Interpreter for NullInterpreter {
    fn execute(&self, _evm: &mut Evm, frame: &Frame) -> CallOutput {
        CallOutput::fail(frame.gas, ExecError::Reverted)
    }
}

pub struct Evm<'a> {
    pub rules: &'a Rules,
    pub block: &'a BlockContext,
    pub tx: &'a TxContext,
    pub state: &'a mut MutableState,
    pub interpreter: &'a dyn Interpreter,
    depth: usize,
}

impl<'a> Evm<'a> {
    pub fn new(
        rules: &'a Rules, block: &'a BlockContext, tx: &'a TxContext,
        state: &'a mut MutableState, interpreter: &'a dyn Interpreter,
    ) -> Self {
        Self {
            rules,
            block,
            tx,
            state,
            interpreter,
            depth: 0,
        }
    }

    fn transfer(
        &mut self, from: &Addr, to: &Addr, value: &Wei,
    ) -> Result<(), ExecError> {
        if value.is_zero() {
            return Ok(())
        }
        let from_balance = self
            .state
            .balance(from)
            .map_err(|_| ExecError::Reverted)?;
        let remaining = from_balance
            .checked_sub(value)
            .ok_or(ExecError::InsufficientBalance)?;
        if from == to {
            return Ok(())
        }
        let to_balance =
            self.state.balance(to).map_err(|_| ExecError::Reverted)?;
        let credited = to_balance
            .checked_add(value)
            .ok_or(ExecError::InsufficientBalance)?;
        self.state
            .set_balance(from, remaining)
            .map_err(|_| ExecError::Reverted)?;
        self.state
            .set_balance(to, credited)
            .map_err(|_| ExecError::Reverted)?;
        Ok(())
    }

    /// CALL-family entry point. `read_only` implements STATICCALL semantics
    /// and is propagated to every nested frame and precompile.
    pub fn call(
        &mut self, caller: &Addr, to: &Addr, value: &Wei, input: &[u8],
        gas: Gas, read_only: bool,
    ) -> CallOutput {
        if self.depth >= MAX_CALL_DEPTH {
            return CallOutput::fail(gas, ExecError::Depth)
        }
        if read_only && !value.is_zero() {
            return CallOutput::fail(0, ExecError::WriteProtection)
        }
        let snapshot = self.state.snapshot();
        self.depth += 1;
        let output = self.call_inner(caller, to, value, input, gas, read_only);
        self.depth -= 1;
        if output.err.is_some() {
            self.state.rollback_to(snapshot);
        }
        output
    }

    fn call_inner(
        &mut self, caller: &Addr, to: &Addr, value: &Wei, input: &[u8],
        gas: Gas, read_only: bool,
    ) -> CallOutput {
        if let Err(err) = self.transfer(caller, to, value) {
            return CallOutput::fail(gas, err)
        }
        if is_reserved_precompile_addr(to) {
            let mut env = PrecompileEnv {
                rules: self.rules,
                blockchain_id: self.block.blockchain_id.clone(),
                block_number: self.block.number,
                caller: caller.clone(),
                read_only,
                state: &mut *self.state,
                predicates: Some(self.tx.predicates_for(to)),
            };
            let (ret, gas_left, err) =
                precompile::run(&mut env, to, input, gas);
            return CallOutput {
                ret,
                gas_left,
                err,
            }
        }
        let code = match self.state.code(to) {
            Ok(code) => code,
            Err(_) => return CallOutput::fail(gas, ExecError::Reverted),
        };
        if code.is_empty() {
            return CallOutput::ok(Bytes::empty(), gas)
        }
        let frame = Frame {
            caller: caller.clone(),
            address: to.clone(),
            code,
            input: Bytes::from(input),
            value: value.clone(),
            gas,
            read_only,
        };
        let interpreter = self.interpreter;
        interpreter.execute(self, &frame)
    }

    /// CREATE / CREATE2. Returns the deployed address on success.
    pub fn create(
        &mut self, caller: &Addr, value: &Wei, init_code: &[u8], gas: Gas,
        salt: Option<Hash>,
    ) -> (Option<Addr>, CallOutput) {
        if self.depth >= MAX_CALL_DEPTH {
            return (None, CallOutput::fail(gas, ExecError::Depth))
        }
        let allowed = crate::precompile::deployerallowlist::is_deployer_allowed(
            self.rules, self.state, caller,
        )
        .unwrap_or(false);
        if !allowed {
            return (None, CallOutput::fail(gas, ExecError::Reverted))
        }
        let snapshot = self.state.snapshot();
        self.depth += 1;
        let result = self.create_inner(caller, value, init_code, gas, salt);
        self.depth -= 1;
        match result {
            Ok((addr, output)) => (Some(addr), output),
            Err((gas_left, err)) => {
                self.state.rollback_to(snapshot);
                (None, CallOutput::fail(gas_left, err))
            }
        }
    }

    fn create_inner(
        &mut self, caller: &Addr, value: &Wei, init_code: &[u8], gas: Gas,
        salt: Option<Hash>,
    ) -> Result<(Addr, CallOutput), (Gas, ExecError)> {
        let nonce = self
            .state
            .nonce(caller)
            .map_err(|_| (gas, ExecError::Reverted))?;
        let address = match &salt {
            Some(salt) => create_addr2(caller, salt.as_bytes(), init_code),
            None => create_addr(caller, nonce),
        };
        let next = nonce
            .checked_add(1)
            .ok_or((gas, ExecError::NonceIntOverflow))?;
        self.state
            .set_nonce(caller, next)
            .map_err(|_| (gas, ExecError::Reverted))?;

        let existing_nonce = self
            .state
            .nonce(&address)
            .map_err(|_| (gas, ExecError::Reverted))?;
        let existing_code = self
            .state
            .code_hash(&address)
            .map_err(|_| (gas, ExecError::Reverted))?;
        if existing_nonce != 0 || &existing_code != Hash::empty_bytes_hash() {
            return Err((gas, ExecError::ContractAddrCollision))
        }

        self.transfer(caller, &address, value)
            .map_err(|err| (gas, err))?;
        self.state
            .set_nonce(&address, 1)
            .map_err(|_| (gas, ExecError::Reverted))?;

        let frame = Frame {
            caller: caller.clone(),
            address: address.clone(),
            code: Bytes::from(init_code),
            input: Bytes::empty(),
            value: value.clone(),
            gas,
            read_only: false,
        };
        let interpreter = self.interpreter;
        let output = interpreter.execute(self, &frame);
        if let Some(err) = output.err {
            return Err((output.gas_left, err))
        }
        // the init frame's return data is the deployed code
        if output.ret.first() == Some(&0xef) {
            return Err((output.gas_left, ExecError::InvalidCode))
        }
        self.state
            .set_code(&address, output.ret.clone())
            .map_err(|_| (gas, ExecError::Reverted))?;
        Ok((address, output))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::kv::MemKv;
    use crate::params::ChainConfig;
    use crate::state::StateStore;

    fn plain_rules() -> Rules {
        ChainConfig {
            chain_id: 1,
            network_id: 1,
            fork_schedule: Default::default(),
            fee_config: Default::default(),
            precompile_upgrades: vec![],
            alloc: Default::default(),
            genesis_timestamp: 0,
        }
        .rules_at(0, 0)
    }

    fn block_ctx() -> BlockContext {
        BlockContext {
            number: 1,
            timestamp: 2,
            coinbase: Addr::zero().clone(),
            base_fee: Wei::from(1u64),
            blob_gas_price: Wei::from(1u64),
            gas_limit: 8_000_000,
            blockchain_id: Hash::hash(b"chain"),
        }
    }

    #[test]
    fn value_transfer_between_plain_accounts() {
        let rules = plain_rules();
        let block = block_ctx();
        let tx = TxContext::default();
        let store = StateStore::new(Arc::new(MemKv::new()));
        let mut state =
            store.mutable_state_at(Hash::empty_root_hash()).unwrap();
        let alice = Addr::from([1u8; 20]);
        let bob = Addr::from([2u8; 20]);
        state.set_balance(&alice, Wei::from(100u64)).unwrap();

        let mut evm =
            Evm::new(&rules, &block, &tx, &mut state, &NullInterpreter);
        let out = evm.call(&alice, &bob, &Wei::from(40u64), &[], 21000, false);
        assert!(out.err.is_none());
        assert_eq!(out.gas_left, 21000);
        assert_eq!(state.balance(&alice).unwrap(), Wei::from(60u64));
        assert_eq!(state.balance(&bob).unwrap(), Wei::from(40u64));
    }

    #[test]
    fn insufficient_balance_rolls_back() {
        let rules = plain_rules();
        let block = block_ctx();
        let tx = TxContext::default();
        let store = StateStore::new(Arc::new(MemKv::new()));
        let mut state =
            store.mutable_state_at(Hash::empty_root_hash()).unwrap();
        let alice = Addr::from([1u8; 20]);
        let bob = Addr::from([2u8; 20]);
        state.set_balance(&alice, Wei::from(10u64)).unwrap();

        let mut evm =
            Evm::new(&rules, &block, &tx, &mut state, &NullInterpreter);
        let out = evm.call(&alice, &bob, &Wei::from(40u64), &[], 21000, false);
        assert_eq!(out.err, Some(ExecError::InsufficientBalance));
        assert_eq!(state.balance(&alice).unwrap(), Wei::from(10u64));
        assert_eq!(&state.balance(&bob).unwrap(), Wei::zero());
    }

    #[test]
    fn static_call_refuses_value() {
        let rules = plain_rules();
        let block = block_ctx();
        let tx = TxContext::default();
        let store = StateStore::new(Arc::new(MemKv::new()));
        let mut state =
            store.mutable_state_at(Hash::empty_root_hash()).unwrap();
        let alice = Addr::from([1u8; 20]);
        state.set_balance(&alice, Wei::from(100u64)).unwrap();
        let mut evm =
            Evm::new(&rules, &block, &tx, &mut state, &NullInterpreter);
        let out = evm.call(
            &alice,
            &Addr::from([2u8; 20]),
            &Wei::from(1u64),
            &[],
            21000,
            true,
        );
        assert_eq!(out.err, Some(ExecError::WriteProtection));
        assert_eq!(out.gas_left, 0);
    }

    #[test]
    fn call_to_inactive_reserved_address_reverts() {
        let rules = plain_rules();
        let block = block_ctx();
        let tx = TxContext::default();
        let store = StateStore::new(Arc::new(MemKv::new()));
        let mut state =
            store.mutable_state_at(Hash::empty_root_hash()).unwrap();
        let alice = Addr::from([1u8; 20]);
        let mut evm =
            Evm::new(&rules, &block, &tx, &mut state, &NullInterpreter);
        let warp = crate::precompile::warp::address();
        let out = evm.call(&alice, &warp, Wei::zero(), &[0u8; 4], 50_000, false);
        assert_eq!(out.err, Some(ExecError::Reverted));
        assert_eq!(out.gas_left, 50_000);
    }

    #[test]
    fn create_deploys_returned_code() {
        struct EchoCode;
        impl Interpreter for EchoCode {
            fn execute(&self, _evm: &mut Evm, frame: &Frame) -> CallOutput {
                CallOutput::ok(frame.code.clone(), frame.gas)
            }
        }
        let rules = plain_rules();
        let block = block_ctx();
        let tx = TxContext::default();
        let store = StateStore::new(Arc::new(MemKv::new()));
        let mut state =
            store.mutable_state_at(Hash::empty_root_hash()).unwrap();
        let alice = Addr::from([1u8; 20]);
        state.set_balance(&alice, Wei::from(100u64)).unwrap();
        let mut evm = Evm::new(&rules, &block, &tx, &mut state, &EchoCode);
        let (addr, out) =
            evm.create(&alice, &Wei::from(5u64), &[0x60, 0x00], 100_000, None);
        assert!(out.err.is_none());
        let addr = addr.unwrap();
        assert_eq!(addr, create_addr(&alice, 0));
        assert_eq!(state.nonce(&alice).unwrap(), 1);
        assert_eq!(state.nonce(&addr).unwrap(), 1);
        assert_eq!(&*state.code(&addr).unwrap(), &[0x60, 0x00]);
        assert_eq!(state.balance(&addr).unwrap(), Wei::from(5u64));
    }

    #[test]
    fn create_rejects_ef_prefixed_code() {
        struct BadCode;
        impl Interpreter for BadCode {
            fn execute(&self, _evm: &mut Evm, frame: &Frame) -> CallOutput {
                CallOutput::ok(Bytes::from(vec![0xef, 0x01]), frame.gas)
            }
        }
        let rules = plain_rules();
        let block = block_ctx();
        let tx = TxContext::default();
        let store = StateStore::new(Arc::new(MemKv::new()));
        let mut state =
            store.mutable_state_at(Hash::empty_root_hash()).unwrap();
        let alice = Addr::from([1u8; 20]);
        let mut evm = Evm::new(&rules, &block, &tx, &mut state, &BadCode);
        let (addr, out) =
            evm.create(&alice, Wei::zero(), &[0x00], 100_000, None);
        assert!(addr.is_none());
        assert_eq!(out.err, Some(ExecError::InvalidCode));
        // the nonce bump was rolled back with everything else
        assert_eq!(state.nonce(&alice).unwrap(), 0);
    }
}
