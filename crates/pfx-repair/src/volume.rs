//! The open-volume handle the repair phases share: device, parsed header,
//! and accessors for the three trees and the allocator.

use pfx_alloc::Allocator;
use pfx_block::BlockDevice;
use pfx_btree::{KeyCmp, Tree};
use pfx_error::{PfxError, Result};
use pfx_ondisk::{
    attribute_key_cmp, catalog_key_cmp_binary, catalog_key_cmp_folded, extent_key_cmp, ForkData,
    ForkMap, VolumeHeader,
};
use pfx_types::{VOLUME_HEADER_OFFSET, VOLUME_HEADER_SIZE};
use serde::{Deserialize, Serialize};

/// Which B-tree a rebuild or lookup targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TreeKind {
    Catalog,
    Extents,
    Attributes,
}

impl std::fmt::Display for TreeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Catalog => "catalog",
            Self::Extents => "extents",
            Self::Attributes => "attributes",
        };
        f.write_str(name)
    }
}

pub struct Volume<'d> {
    pub dev: &'d dyn BlockDevice,
    pub header: VolumeHeader,
}

impl<'d> Volume<'d> {
    /// Read and validate the primary volume header.
    pub fn open(dev: &'d dyn BlockDevice) -> Result<Self> {
        let region = dev.read(VOLUME_HEADER_OFFSET, VOLUME_HEADER_SIZE)?;
        let header = VolumeHeader::parse(&region)?;
        header.validate_geometry()?;
        Ok(Self { dev, header })
    }

    #[must_use]
    pub fn block_size(&self) -> u32 {
        self.header.block_size
    }

    /// Key comparator for the catalog, per the volume's case sensitivity.
    #[must_use]
    pub fn catalog_cmp(&self) -> KeyCmp {
        if self.header.is_case_sensitive() {
            catalog_key_cmp_binary
        } else {
            catalog_key_cmp_folded
        }
    }

    #[must_use]
    pub fn fork_of(&self, kind: TreeKind) -> &ForkData {
        match kind {
            TreeKind::Catalog => &self.header.catalog_fork,
            TreeKind::Extents => &self.header.extents_fork,
            TreeKind::Attributes => &self.header.attributes_fork,
        }
    }

    pub fn set_fork(&mut self, kind: TreeKind, fork: ForkData) {
        match kind {
            TreeKind::Catalog => self.header.catalog_fork = fork,
            TreeKind::Extents => self.header.extents_fork = fork,
            TreeKind::Attributes => self.header.attributes_fork = fork,
        }
    }

    #[must_use]
    pub fn tree_cmp(&self, kind: TreeKind) -> KeyCmp {
        match kind {
            TreeKind::Catalog => self.catalog_cmp(),
            TreeKind::Extents => extent_key_cmp,
            TreeKind::Attributes => attribute_key_cmp,
        }
    }

    /// Open one of the volume's trees. Fails for a tree whose fork is
    /// unmapped (a volume without an attributes tree).
    pub fn open_tree(&self, kind: TreeKind) -> Result<Tree<'d>> {
        let fork = self.fork_of(kind);
        if fork.is_empty() {
            return Err(PfxError::NotFound);
        }
        let map = ForkMap::new(fork, self.header.block_size);
        Tree::open(self.dev, map, self.tree_cmp(kind))
    }

    pub fn catalog(&self) -> Result<Tree<'d>> {
        self.open_tree(TreeKind::Catalog)
    }

    #[must_use]
    pub fn has_attributes_tree(&self) -> bool {
        !self.header.attributes_fork.is_empty()
    }

    /// Allocation-bitmap accessor.
    #[must_use]
    pub fn allocator(&self) -> Allocator<'d> {
        Allocator::new(
            self.dev,
            &self.header.allocation_fork,
            self.header.block_size,
            self.header.total_blocks,
        )
    }

    /// Write the header to its primary slot and the redundant alternate
    /// copy near the end of the device.
    pub fn flush_header(&self) -> Result<()> {
        let bytes = self.header.to_bytes();
        self.dev.write(VOLUME_HEADER_OFFSET, &bytes)?;
        let alternate = VolumeHeader::alternate_offset(self.dev.len());
        if alternate > VOLUME_HEADER_OFFSET {
            self.dev.write(alternate, &bytes)?;
        }
        Ok(())
    }
}
