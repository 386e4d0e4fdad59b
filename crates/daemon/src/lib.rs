// loam-daemon library entry point: local replication engine.

pub mod acl;
pub mod cleanup;
pub mod config;
pub mod engine;
pub mod entity;
pub mod error;
pub mod events;
pub mod model;
pub mod outbox;
pub mod remote;
pub mod retry;
pub mod runtime;
pub mod scheduler;
pub mod store;
pub mod sync;
