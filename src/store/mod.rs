//! Configuration Store
//!
//! Relation tables, transactions, durable journaling and peer replication
//! for the array's object configuration.

pub mod arena;
pub mod entry;
pub mod journal;
pub mod limits;
pub mod replication;
pub mod tables;
pub mod transaction;

pub use arena::{EntryHandle, SlotArena};
pub use entry::*;
pub use journal::{FileJournal, MemoryJournal};
pub use limits::TableSizes;
pub use replication::{PeerAck, PeerApplier, PeerReplicator};
pub use tables::{ConfigTableStore, StoreStatus, TableUsage};
pub use transaction::{CommitRecord, JournalOp, StagedOp, TransactionId, TransactionManager};
