//! Card-table remembered set for old-to-young references.
//!
//! - `table`: double-buffered dirty bytes, one per 512-byte card
//! - `object_starts`: first/last object start per card
//! - `scan`: dirty-card scanning of old regions
//! - `chunk_iter`: shrinking-chunk work distribution for parallel scans

pub mod chunk_iter;
pub mod object_starts;
pub mod scan;
pub mod table;

pub use chunk_iter::{RegionChunk, RegionChunkIterator};
pub use object_starts::ObjectStartTable;
pub use scan::{CardSnapshot, RememberedSet};
pub use table::{CardTable, CARDS_PER_CLUSTER, CARD_SIZE, CARD_SIZE_WORDS};
