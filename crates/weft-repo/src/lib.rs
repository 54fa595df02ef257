//! Content-addressed core for the weft data platform
//!
//! This crate provides the verifiable half of the platform:
//!
//! - **MST (Merkle Search Tree)**: a persistent, AVL-balanced,
//!   content-addressed ordered map whose every mutation produces a new
//!   immutable root and whose nodes carry a BLAKE3 digest binding the subtree
//! - **CollectionIndex**: a named catalog of tree roots materialized as a
//!   single map block whose CID is the platform's global root
//! - **Storage**: pluggable block storage abstraction with an in-memory
//!   implementation (the datastore crate supplies a durable one)
//!
//! # Design Philosophy
//!
//! - Blocks are immutable; mutations mint new nodes and return new roots
//! - Child references are CIDs, never owning pointers; nodes live
//!   transiently in a per-operation cache
//! - A failed operation persists nothing and never advances a root
//! - Verifying a root digest transitively verifies the tree

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod error;
/// Collection catalog over tree roots
pub mod index;
/// Merkle Search Tree implementation
pub mod mst;
/// Block storage abstraction
pub mod storage;

pub use error::{Result, StoreError, StoreErrorKind};
pub use index::CollectionIndex;
pub use mst::{Entry, Mst, Node};
pub use storage::{BlockStore, MemoryBlockStore, compute_cid};
