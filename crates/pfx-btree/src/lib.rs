#![forbid(unsafe_code)]
//! B-tree primitives collaborator for PlusFix.
//!
//! Provides node buffers, the tree control block, the node-allocation map,
//! and the search/insert/delete/replace/iterate operations the repair
//! engine drives. Errors are the closed set the contract names: not-found,
//! duplicate, tree-full, and I/O.
//!
//! The rebuild scanner deliberately does NOT live here: it bypasses these
//! primitives and walks leaf nodes in physical order so that it keeps
//! working when index nodes or sibling links are damaged.

pub mod node;
pub mod tree;

pub use node::{join_record, split_record, Node, NodeKind, NODE_DESCRIPTOR_SIZE};
pub use tree::{BTreeHeader, KeyCmp, Tree, HEADER_RECORD_SIZE, USER_DATA_SIZE};
