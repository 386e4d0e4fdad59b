// Text diffing for splice-based CRDT text fields.

pub mod patch;
