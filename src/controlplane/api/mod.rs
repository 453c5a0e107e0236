//! API Module
//!
//! REST access to the raid-group jobs and the configuration store.

pub mod server;
pub mod rest;

pub use server::*;
pub use rest::*;
