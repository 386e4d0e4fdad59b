// loam-common: wire protocol, shared types and text utilities for Loam.

pub mod diff;
pub mod mention;
pub mod protocol;
pub mod types;
