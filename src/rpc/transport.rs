//! Outbound peer RPC abstraction
//!
//! The consensus core only needs "send message, get reply". Peers are
//! addressed by endpoint string; implementations decide what it means.

use crate::common::raft::{
    FedReplicateRequest, FedReplicateResponse, ReplicateRequest, ReplicateResponse, VoteRequest,
    VoteResponse,
};
use crate::common::Result;

#[tonic::async_trait]
pub trait Transport: Send + Sync {
    async fn request_vote(&self, endpoint: &str, req: VoteRequest) -> Result<VoteResponse>;

    async fn replicate_log(&self, endpoint: &str, req: ReplicateRequest)
        -> Result<ReplicateResponse>;

    async fn replicate_fed_log(
        &self,
        endpoint: &str,
        req: FedReplicateRequest,
    ) -> Result<FedReplicateResponse>;
}
