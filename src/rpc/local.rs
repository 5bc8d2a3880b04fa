//! In-process network for running whole zones inside one process
//!
//! Servers register under their endpoint string. Every call goes through
//! [`dispatch`] exactly like a gRPC call would, so access rules and cache
//! mode behave the same. Endpoints can be isolated to simulate partitions
//! and crashed servers.

use crate::common::raft::{
    FedReplicateRequest, FedReplicateResponse, ReplicateRequest, ReplicateResponse, VoteRequest,
    VoteResponse,
};
use crate::common::{Error, Principal, Result};
use crate::rpc::dispatch::{dispatch, Request, Response};
use crate::rpc::transport::Transport;
use crate::zone::ServerContext;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

#[derive(Default)]
pub struct LocalNetwork {
    servers: RwLock<HashMap<String, Weak<ServerContext>>>,
    isolated: RwLock<HashSet<String>>,
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Transport for the server listening at `endpoint`
    pub fn transport(self: &Arc<Self>, endpoint: impl Into<String>) -> Arc<dyn Transport> {
        Arc::new(LocalTransport {
            network: self.clone(),
            local: endpoint.into(),
        })
    }

    pub fn register(&self, ctx: &Arc<ServerContext>) {
        self.servers
            .write()
            .insert(ctx.config.endpoint.clone(), Arc::downgrade(ctx));
    }

    pub fn unregister(&self, endpoint: &str) {
        self.servers.write().remove(endpoint);
    }

    /// Drop all traffic to and from `endpoint`
    pub fn isolate(&self, endpoint: &str) {
        self.isolated.write().insert(endpoint.to_string());
    }

    pub fn heal(&self, endpoint: &str) {
        self.isolated.write().remove(endpoint);
    }

    pub fn heal_all(&self) {
        self.isolated.write().clear();
    }

    /// Call `request` on the server at `endpoint` as `principal`
    pub async fn call(
        &self,
        from: &str,
        endpoint: &str,
        principal: Principal,
        request: Request,
    ) -> Result<Response> {
        {
            let isolated = self.isolated.read();
            if isolated.contains(from) || isolated.contains(endpoint) {
                return Err(Error::ConnectionFailed(format!(
                    "{} unreachable from {}",
                    endpoint, from
                )));
            }
        }

        let target = self
            .servers
            .read()
            .get(endpoint)
            .and_then(Weak::upgrade)
            .ok_or_else(|| Error::ConnectionFailed(format!("no server at {}", endpoint)))?;

        dispatch(&target, principal, request).await
    }
}

struct LocalTransport {
    network: Arc<LocalNetwork>,
    local: String,
}

impl LocalTransport {
    async fn call(&self, endpoint: &str, request: Request) -> Result<Response> {
        self.network
            .call(&self.local, endpoint, Principal::Peer, request)
            .await
    }
}

#[tonic::async_trait]
impl Transport for LocalTransport {
    async fn request_vote(&self, endpoint: &str, req: VoteRequest) -> Result<VoteResponse> {
        self.call(endpoint, Request::Vote(req)).await?.into_vote()
    }

    async fn replicate_log(
        &self,
        endpoint: &str,
        req: ReplicateRequest,
    ) -> Result<ReplicateResponse> {
        self.call(endpoint, Request::ReplicateLog(req))
            .await?
            .into_replicate_log()
    }

    async fn replicate_fed_log(
        &self,
        endpoint: &str,
        req: FedReplicateRequest,
    ) -> Result<FedReplicateResponse> {
        self.call(endpoint, Request::ReplicateFedLog(req))
            .await?
            .into_replicate_fed_log()
    }
}
