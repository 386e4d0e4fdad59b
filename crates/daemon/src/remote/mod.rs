// Central-service seams used by the outbox and the synchronizer.
//
// Both traits return `Send` futures so the loops can run on a
// multi-threaded runtime. Transport failures are `Err`; per-mutation
// rejections travel inside the `Ok` results.

pub mod http;

use std::future::Future;

use loam_common::protocol::mutations::{Mutation, MutationResult};
use loam_common::protocol::sync::{PullRequest, PullResponse};

pub use http::HttpRemote;

/// Ships outbound mutation batches.
pub trait MutationRemote: Send + Sync + 'static {
    fn submit(&self, batch: Vec<Mutation>) -> impl Future<Output = anyhow::Result<Vec<MutationResult>>> + Send;
}

/// Serves inbound changes by revision cursor.
pub trait PullSource: Send + Sync + 'static {
    fn pull(&self, request: PullRequest) -> impl Future<Output = anyhow::Result<PullResponse>> + Send;
}

impl<T: MutationRemote> MutationRemote for std::sync::Arc<T> {
    fn submit(&self, batch: Vec<Mutation>) -> impl Future<Output = anyhow::Result<Vec<MutationResult>>> + Send {
        (**self).submit(batch)
    }
}

impl<T: PullSource> PullSource for std::sync::Arc<T> {
    fn pull(&self, request: PullRequest) -> impl Future<Output = anyhow::Result<PullResponse>> + Send {
        (**self).pull(request)
    }
}
