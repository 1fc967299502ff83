//! # SSTable - Sorted String Table
//!
//! Immutable, block-based on-disk tables.
//!
//! A frozen memtable is flushed to a level-0 table; compaction merges tables
//! into deeper levels. Tables are *write-once, read-many*: once renamed into
//! place a file is never modified, only deleted after a compaction subsumes
//! it.
//!
//! ## File layout
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │ DATA BLOCKS  sorted versions (key ASC, seq DESC), each block   │
//! │              compressed (None | LZ4) + compression tag + crc32  │
//! ├───────────────────────────────────────────────────────────────┤
//! │ BLOOM BLOCK  serialized BloomFilter over user keys              │
//! ├───────────────────────────────────────────────────────────────┤
//! │ META BLOCK   min_key, max_key                                   │
//! ├───────────────────────────────────────────────────────────────┤
//! │ INDEX BLOCK  per data block: last (key, seq) + block handle     │
//! ├───────────────────────────────────────────────────────────────┤
//! │ FOOTER       max_seq, entry_count, handles, compression,        │
//! │              crc32, magic "SSTB"                                │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every block and the footer carry a CRC32. A mismatch in a committed table
//! is reported as [`CorruptionError`].
//!
//! ## Modules
//!
//! | Module   | Responsibility                                         |
//! |----------|--------------------------------------------------------|
//! | `format` | block/index/footer encoding, checksums, compression    |
//! | `writer` | [`TableBuilder`] and [`SSTableWriter`] (tmp + rename)  |
//! | `reader` | [`SSTableReader`] point lookups, [`TableIterator`]     |
//! | `merge`  | [`MergeIterator`] k-way merge, [`VisibleIter`]         |
//! | `cache`  | [`BlockCache`], [`BloomFilterCache`]                   |

mod cache;
mod format;
mod merge;
mod reader;
mod writer;

pub use cache::{BlockCache, BloomFilterCache, CacheStats};
pub use format::{is_corruption, Block, CorruptionError, KeyRange, FOOTER_BYTES, SSTABLE_MAGIC};
pub use merge::{EntrySource, MergeIterator, VisibleIter};
pub use reader::{SSTableReader, TableIterator};
pub use writer::{sync_parent, SSTableWriter, TableBuilder, TableInfo, TableOptions};

#[cfg(test)]
mod tests;
