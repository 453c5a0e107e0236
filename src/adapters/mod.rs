//! Collaborator Adapters
//!
//! Implementations of the domain ports used when no array hardware is
//! attached.

pub mod memory;

pub use memory::{DriveSpec, InMemoryArray, PVD_DEFAULT_OFFSET};
