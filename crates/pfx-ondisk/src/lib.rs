#![forbid(unsafe_code)]
//! On-disk record codec for PlusFix.
//!
//! Decodes and encodes every record the repair engine touches (catalog
//! file/folder/thread records, extent keys and overflow records, attribute
//! records, and the volume header) and validates each record's size and
//! shape against its declared type tag. All multi-byte fields are
//! big-endian.
//!
//! ## Modules
//!
//! - **name**: length-prefixed UTF-16 names and their fold ordering.
//! - **extents**: extent descriptors, fork data, overflow extent keys,
//!   logical-to-physical fork mapping.
//! - **catalog**: catalog keys and file/folder/thread records.
//! - **attributes**: extended-attribute keys and records.
//! - **volume**: primary/alternate volume header.

pub mod attributes;
pub mod catalog;
pub mod extents;
pub mod name;
pub mod volume;

pub use attributes::{attribute_key_cmp, AttributeKey, AttributeRecord};
pub use catalog::{
    catalog_key_cmp_binary, catalog_key_cmp_folded, BsdInfo, CatalogKey, CatalogRecord,
    FileRecord, FolderRecord, ThreadRecord, FLAG_HAS_LINK_CHAIN, FLAG_THREAD_EXISTS,
};
pub use extents::{
    extent_key_cmp, ExtentDescriptor, ExtentKey, ExtentRecord, ForkData, ForkKind, ForkMap,
};
pub use name::CatName;
pub use volume::{VolumeHeader, SIGNATURE_CASE_SENSITIVE, SIGNATURE_PLUS};
