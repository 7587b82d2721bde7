//! B-tree scanner: a finite, non-restartable sequence of leaf records in
//! physical node order.
//!
//! The scanner reads nodes 1..total in ascending node-number order and
//! ignores sibling links entirely, so it keeps producing records when
//! index nodes or leaf links are damaged, which is the situation the
//! rebuilder is called for. Header, map, and index nodes are passed over
//! silently; a node whose descriptor or record offsets fail validation is
//! skipped and counted. An I/O error is fatal to the scan.

use pfx_block::BlockDevice;
use pfx_btree::{split_record, Node, NodeKind};
use pfx_error::Result;
use pfx_ondisk::ForkMap;
use pfx_types::NodeNumber;
use tracing::debug;

/// One salvaged leaf record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedRecord {
    /// Node the record came from.
    pub node: NodeNumber,
    /// Full key bytes, length prefix included.
    pub key: Vec<u8>,
    /// Record data bytes.
    pub data: Vec<u8>,
}

pub struct Scanner<'d> {
    dev: &'d dyn BlockDevice,
    map: ForkMap,
    node_size: usize,
    total_nodes: u32,
    next_node: u32,
    current: Option<(Node, usize)>,
    finished: bool,
    /// Leaf-shaped nodes that failed validation and were passed over.
    pub skipped_nodes: u32,
}

impl<'d> Scanner<'d> {
    #[must_use]
    pub fn new(dev: &'d dyn BlockDevice, map: ForkMap, node_size: u16, total_nodes: u32) -> Self {
        Self {
            dev,
            map,
            node_size: usize::from(node_size),
            total_nodes,
            next_node: 1,
            current: None,
            finished: false,
            skipped_nodes: 0,
        }
    }

    fn load_node(&self, n: u32) -> Result<Node> {
        let offset = self
            .map
            .physical_offset(u64::from(n) * self.node_size as u64)?;
        let data = self.dev.read(offset, self.node_size)?;
        Ok(Node::from_bytes(NodeNumber(n), data))
    }

    /// Whether a node is a leaf whose record structure is fully intact.
    fn usable_leaf(node: &Node) -> bool {
        match node.kind() {
            Ok(NodeKind::Leaf) => {}
            _ => return false,
        }
        if node.validate().is_err() {
            return false;
        }
        for i in 0..usize::from(node.num_records()) {
            let Ok(record) = node.record(i) else {
                return false;
            };
            if split_record(record).is_err() {
                return false;
            }
        }
        true
    }

    /// Produce the next record, or `None` once every leaf is consumed.
    /// The terminal `None` is sticky; the sequence cannot restart.
    pub fn next_record(&mut self) -> Result<Option<ScannedRecord>> {
        loop {
            if self.finished {
                return Ok(None);
            }
            if let Some((node, idx)) = self.current.as_mut() {
                if *idx < usize::from(node.num_records()) {
                    let record = node.record(*idx)?;
                    let (key, data) = split_record(record)?;
                    let out = ScannedRecord {
                        node: node.num,
                        key: key.to_vec(),
                        data: data.to_vec(),
                    };
                    *idx += 1;
                    return Ok(Some(out));
                }
                self.current = None;
            }

            if self.next_node >= self.total_nodes {
                self.finished = true;
                debug!(
                    skipped = self.skipped_nodes,
                    "scan exhausted all physical nodes"
                );
                return Ok(None);
            }

            let n = self.next_node;
            self.next_node += 1;
            let node = self.load_node(n)?;
            match node.kind() {
                Ok(NodeKind::Header | NodeKind::Map | NodeKind::Index) => continue,
                Ok(NodeKind::Leaf) if Self::usable_leaf(&node) => {
                    self.current = Some((node, 0));
                }
                _ => {
                    // Damaged or unrecognizable: this is the corruption the
                    // rebuild is working around.
                    self.skipped_nodes += 1;
                }
            }
        }
    }
}
