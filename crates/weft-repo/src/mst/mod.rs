//! Merkle Search Tree implementation

pub mod node;
pub mod tree;

pub use node::Node;
pub use tree::{Entry, Mst};
