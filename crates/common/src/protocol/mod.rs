// Wire protocol between the local engine and the central service.
//
// Outbound: batches of typed mutations, answered per mutation id.
// Inbound: cursor-paged pulls per (root, change kind).

pub mod mutations;
pub mod sync;
