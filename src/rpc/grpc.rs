//! Zone server gRPC service (internal)
//!
//! Serves election, replication and federation shipping to zone peers, plus
//! a read-only status call. The peer key is checked by an interceptor which
//! stamps the caller's [`Principal`] on the request; the method table in
//! [`dispatch`](crate::rpc::dispatch) decides what that principal may do.

use crate::common::raft::{self, Rejection};
use crate::common::{AuditEventType, AuthResult, Principal};
use crate::proto::zone_internal_server::{ZoneInternal, ZoneInternalServer};
use crate::proto::*;
use crate::rpc::client::PEER_KEY_HEADER;
use crate::rpc::dispatch::{self, Request as Call};
use crate::zone::ServerContext;
use std::sync::Arc;
use tonic::service::interceptor::InterceptedService;
use tonic::service::Interceptor;
use tonic::{Request, Response, Status};
use tracing::warn;

pub struct ZoneGrpcService {
    ctx: Arc<ServerContext>,
}

/// Checks the peer key and records who is calling
#[derive(Clone)]
pub struct PeerAuth {
    ctx: Arc<ServerContext>,
}

impl Interceptor for PeerAuth {
    fn call(&mut self, req: Request<()>) -> Result<Request<()>, Status> {
        authenticate(&self.ctx, req)
    }
}

impl ZoneGrpcService {
    pub fn new(ctx: Arc<ServerContext>) -> Self {
        Self { ctx }
    }

    /// Converts this service into a gRPC server that authenticates peers
    pub fn into_server(self) -> InterceptedService<ZoneInternalServer<Self>, PeerAuth> {
        let auth = PeerAuth {
            ctx: self.ctx.clone(),
        };
        ZoneInternalServer::with_interceptor(self, auth)
    }

    async fn call(&self, principal: Principal, call: Call) -> Result<dispatch::Response, Status> {
        dispatch::dispatch(&self.ctx, principal, call)
            .await
            .map_err(|e| e.to_grpc_status())
    }
}

fn authenticate(ctx: &ServerContext, mut req: Request<()>) -> Result<Request<()>, Status> {
    let key = req
        .metadata()
        .get(PEER_KEY_HEADER)
        .and_then(|v| v.to_str().ok());
    let principal = match ctx.auth.authenticate_peer(key) {
        AuthResult::Ok(principal) => principal,
        AuthResult::Missing => Principal::Anonymous,
        AuthResult::Invalid(reason) => {
            warn!("rejected peer RPC: {}", reason);
            ctx.audit.log_event(
                AuditEventType::AccessDenied,
                "peer",
                None,
                reason.clone(),
                None,
            );
            return Err(Status::unauthenticated(reason));
        }
    };
    req.extensions_mut().insert(principal);
    Ok(req)
}

fn principal_of<T>(req: &Request<T>) -> Principal {
    req.extensions()
        .get::<Principal>()
        .copied()
        .unwrap_or(Principal::Anonymous)
}

#[tonic::async_trait]
impl ZoneInternal for ZoneGrpcService {
    async fn vote(&self, req: Request<VoteRequest>) -> Result<Response<VoteResponse>, Status> {
        let principal = principal_of(&req);
        let vote_req: raft::VoteRequest = (&req.into_inner()).into();
        let resp = self
            .call(principal, Call::Vote(vote_req))
            .await?
            .into_vote()
            .map_err(|e| e.to_grpc_status())?;
        Ok(Response::new((&resp).into()))
    }

    async fn replicate_log(
        &self,
        req: Request<ReplicateRequest>,
    ) -> Result<Response<ReplicateResponse>, Status> {
        let principal = principal_of(&req);
        let replicate_req: raft::ReplicateRequest = (&req.into_inner()).into();
        let resp = self
            .call(principal, Call::ReplicateLog(replicate_req))
            .await?
            .into_replicate_log()
            .map_err(|e| e.to_grpc_status())?;
        Ok(Response::new((&resp).into()))
    }

    async fn replicate_fed_log(
        &self,
        req: Request<FedReplicateRequest>,
    ) -> Result<Response<FedReplicateResponse>, Status> {
        let principal = principal_of(&req);
        let fed_req: raft::FedReplicateRequest = (&req.into_inner()).into();
        let resp = self
            .call(principal, Call::ReplicateFedLog(fed_req))
            .await?
            .into_replicate_fed_log()
            .map_err(|e| e.to_grpc_status())?;
        Ok(Response::new((&resp).into()))
    }

    async fn raft_status(
        &self,
        req: Request<StatusRequest>,
    ) -> Result<Response<StatusResponse>, Status> {
        let principal = principal_of(&req);
        let status = self
            .call(principal, Call::RaftStatus)
            .await?
            .into_status()
            .map_err(|e| e.to_grpc_status())?;
        Ok(Response::new((&status).into()))
    }
}

// Conversions between the wire messages and the internal types

impl From<&raft::VoteRequest> for VoteRequest {
    fn from(r: &raft::VoteRequest) -> Self {
        Self {
            candidate_term: r.candidate_term,
            candidate_id: r.candidate_id,
            candidate_log_index: r.candidate_log_index,
            candidate_log_term: r.candidate_log_term,
        }
    }
}

impl From<&VoteRequest> for raft::VoteRequest {
    fn from(r: &VoteRequest) -> Self {
        Self {
            candidate_term: r.candidate_term,
            candidate_id: r.candidate_id,
            candidate_log_index: r.candidate_log_index,
            candidate_log_term: r.candidate_log_term,
        }
    }
}

impl From<&raft::VoteResponse> for VoteResponse {
    fn from(r: &raft::VoteResponse) -> Self {
        Self {
            granted: r.granted,
            term: r.term,
        }
    }
}

impl From<&VoteResponse> for raft::VoteResponse {
    fn from(r: &VoteResponse) -> Self {
        Self {
            granted: r.granted,
            term: r.term,
        }
    }
}

impl From<&raft::ReplicateRequest> for ReplicateRequest {
    fn from(r: &raft::ReplicateRequest) -> Self {
        Self {
            leader_id: r.leader_id,
            leader_commit: r.leader_commit,
            leader_term: r.leader_term,
            index: r.index,
            term: r.term,
            prev_index: r.prev_index,
            prev_term: r.prev_term,
            fed_index: r.fed_index,
            sql: r.sql.clone(),
        }
    }
}

impl From<&ReplicateRequest> for raft::ReplicateRequest {
    fn from(r: &ReplicateRequest) -> Self {
        Self {
            leader_id: r.leader_id,
            leader_commit: r.leader_commit,
            leader_term: r.leader_term,
            index: r.index,
            term: r.term,
            prev_index: r.prev_index,
            prev_term: r.prev_term,
            fed_index: r.fed_index,
            sql: r.sql.clone(),
        }
    }
}

impl From<Rejection> for RejectReason {
    fn from(r: Rejection) -> Self {
        match r {
            Rejection::StaleTerm => RejectReason::StaleTerm,
            Rejection::MissingPrev => RejectReason::MissingPrev,
            Rejection::PrevTermConflict => RejectReason::PrevTermConflict,
            Rejection::Malformed => RejectReason::Malformed,
            Rejection::CommittedConflict => RejectReason::CommittedConflict,
        }
    }
}

fn rejection_of(reason: RejectReason) -> Option<Rejection> {
    match reason {
        RejectReason::None => None,
        RejectReason::StaleTerm => Some(Rejection::StaleTerm),
        RejectReason::MissingPrev => Some(Rejection::MissingPrev),
        RejectReason::PrevTermConflict => Some(Rejection::PrevTermConflict),
        RejectReason::Malformed => Some(Rejection::Malformed),
        RejectReason::CommittedConflict => Some(Rejection::CommittedConflict),
    }
}

impl From<&raft::ReplicateResponse> for ReplicateResponse {
    fn from(r: &raft::ReplicateResponse) -> Self {
        let reason = r.rejection.map(RejectReason::from).unwrap_or(RejectReason::None);
        Self {
            success: r.success,
            term: r.term,
            reason: reason as i32,
        }
    }
}

impl From<&ReplicateResponse> for raft::ReplicateResponse {
    fn from(r: &ReplicateResponse) -> Self {
        let rejection = match (r.success, rejection_of(r.reason())) {
            (true, _) => None,
            // an old or foreign peer that sends no reason is treated as a
            // log mismatch so the leader keeps probing
            (false, None) => Some(Rejection::MissingPrev),
            (false, reason) => reason,
        };
        Self {
            success: r.success,
            term: r.term,
            rejection,
        }
    }
}

impl From<&raft::FedReplicateRequest> for FedReplicateRequest {
    fn from(r: &raft::FedReplicateRequest) -> Self {
        Self {
            index: r.index,
            prev: r.prev,
            sql: r.sql.clone(),
        }
    }
}

impl From<&FedReplicateRequest> for raft::FedReplicateRequest {
    fn from(r: &FedReplicateRequest) -> Self {
        Self {
            index: r.index,
            prev: r.prev,
            sql: r.sql.clone(),
        }
    }
}

impl From<&raft::FedReplicateResponse> for FedReplicateResponse {
    fn from(r: &raft::FedReplicateResponse) -> Self {
        Self {
            success: r.success,
            resume_index: r.resume_index,
        }
    }
}

impl From<&FedReplicateResponse> for raft::FedReplicateResponse {
    fn from(r: &FedReplicateResponse) -> Self {
        Self {
            success: r.success,
            resume_index: r.resume_index,
        }
    }
}

impl From<&raft::RaftStatus> for StatusResponse {
    fn from(s: &raft::RaftStatus) -> Self {
        Self {
            server_id: s.server_id,
            zone_id: s.zone_id,
            term: s.term,
            role: s.role.to_string(),
            leader_id: s.leader_id.unwrap_or(-1),
            commit_index: s.commit_index,
            voted_for: s.voted_for.unwrap_or(-1),
            last_log_index: s.last_log_index,
            last_log_term: s.last_log_term,
            applied_index: s.applied_index,
            fed_cursor: s.fed_cursor,
            halted: s.halted,
        }
    }
}
