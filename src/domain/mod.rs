//! Domain layer - Shared identity types and collaborator ports
//!
//! This module defines the traits (ports) through which the table store and
//! provisioning pipeline reach the rest of the array, following hexagonal
//! architecture principles.

pub mod ports;

pub use ports::*;
