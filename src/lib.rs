//! # sEVM: an EVM execution plugin for subnet chains
//!
//! sEVM is the execution half of a subnet blockchain node: the host consensus
//! engine decides *which* block is next, this crate decides *what* each block
//! means. It parses and verifies blocks, executes their transactions against
//! an authenticated state trie, builds new blocks from a mempool, and speaks
//! the cross-chain warp messaging protocol.
//!
//! # Overview
//! The crate is organized bottom-up; each layer only depends on the ones
//! below it and is usable on its own:
//!
//! - [common]: the basic chain types ([Addr](common::Addr),
//!   [Hash](common::Hash), [Wei](common::Wei), [Bytes](common::Bytes)) with
//!   their codecs.
//! - [kv]: the key-value storage seam ([KvStore](kv::KvStore)) with
//!   namespacing, batches and an in-memory backend for tests.
//! - [trie]: the hexary Merkle-Patricia trie, including range proofs used by
//!   state sync.
//! - [state]: versioned world state over the trie; a
//!   [MutableState](state::MutableState) buffers a block's writes and
//!   [StateStore::commit](state::StateStore::commit) folds them in
//!   atomically.
//! - [params]: the fork schedule, dynamic fee parameters and the
//!   genesis/upgrade config surface; pure functions from config bytes to
//!   [Rules](params::Rules).
//! - [tx] / [block]: transaction envelopes (legacy, access-list, dynamic-fee,
//!   blob) and the block/receipt wire formats.
//! - [evm]: the interpreter seam and transaction-level execution
//!   (gas accounting, value transfer, precompile dispatch).
//! - [precompile]: the stateful precompile registry (allow lists, native
//!   minter, fee manager, warp) activated through config upgrades.
//! - [bls] / [warp]: BLS aggregate signatures and the warp message layer:
//!   wire codec, validator-set verification, signing backend.
//! - [processor]: the block executor; replays a block against its parent
//!   state and insists on byte-identical roots.
//! - [mempool] / [builder]: transaction admission and the block builder that
//!   turns pending transactions into a sealed block.
//! - [chain] / [vm]: the accepted-block store, the verified-block tree, and
//!   the [ChainVm](vm::ChainVm) plugin surface the host drives.
//! - [sync]: the state-sync client that downloads a recent state by range
//!   proofs instead of replaying history.
//! - [api]: read-only accessors backing the host's RPC handlers.
//!
//! The host embeds [ChainVm](vm::ChainVm): `initialize` it with genesis
//! bytes and a [ChainContext](vm::ChainContext), then drive it with
//! `build_block` / `verify_block` / `accept_block`. Everything else is
//! plumbing those calls fan out to.

pub mod api;
pub mod block;
pub mod bls;
pub mod builder;
pub mod chain;
pub mod common;
pub mod error;
pub mod evm;
pub mod kv;
pub mod mempool;
pub mod params;
pub mod precompile;
pub mod processor;
pub mod state;
pub mod sync;
pub mod trie;
pub mod tx;
pub mod vm;
pub mod warp;
