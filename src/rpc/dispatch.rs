//! Method table shared by every RPC surface
//!
//! gRPC, HTTP and the in-process network all turn incoming calls into a
//! [`Request`] and go through [`dispatch`], which enforces cache mode and
//! caller access before running the handler.

use crate::common::raft::{
    FedReplicateRequest, FedReplicateResponse, RaftStatus, ReplicateRequest, ReplicateResponse,
    VoteRequest, VoteResponse,
};
use crate::common::{AuditEventType, Error, Principal, Result, ServerId, ZoneId};
use crate::federation::FedApplyOutcome;
use crate::zone::{membership, ServerContext};
use futures_util::future::BoxFuture;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Vote(VoteRequest),
    ReplicateLog(ReplicateRequest),
    ReplicateFedLog(FedReplicateRequest),
    RaftStatus,
    AddServer {
        zone_id: ZoneId,
        name: String,
        endpoint: String,
    },
    DeleteServer {
        zone_id: ZoneId,
        server_id: ServerId,
    },
    ResetServer {
        zone_id: ZoneId,
        server_id: ServerId,
    },
    Execute {
        sql: String,
        federated: bool,
    },
}

impl Request {
    pub fn method(&self) -> &'static str {
        match self {
            Request::Vote(_) => "Vote",
            Request::ReplicateLog(_) => "ReplicateLog",
            Request::ReplicateFedLog(_) => "ReplicateFedLog",
            Request::RaftStatus => "RaftStatus",
            Request::AddServer { .. } => "AddServer",
            Request::DeleteServer { .. } => "DeleteServer",
            Request::ResetServer { .. } => "ResetServer",
            Request::Execute { .. } => "Execute",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Vote(VoteResponse),
    ReplicateLog(ReplicateResponse),
    ReplicateFedLog(FedReplicateResponse),
    RaftStatus(RaftStatus),
    ServerId(ServerId),
    Index(u64),
}

fn unexpected(expected: &str, got: &Response) -> Error {
    Error::Internal(format!("expected {} response, got {:?}", expected, got))
}

impl Response {
    pub fn into_vote(self) -> Result<VoteResponse> {
        match self {
            Response::Vote(r) => Ok(r),
            other => Err(unexpected("Vote", &other)),
        }
    }

    pub fn into_replicate_log(self) -> Result<ReplicateResponse> {
        match self {
            Response::ReplicateLog(r) => Ok(r),
            other => Err(unexpected("ReplicateLog", &other)),
        }
    }

    pub fn into_replicate_fed_log(self) -> Result<FedReplicateResponse> {
        match self {
            Response::ReplicateFedLog(r) => Ok(r),
            other => Err(unexpected("ReplicateFedLog", &other)),
        }
    }

    pub fn into_status(self) -> Result<RaftStatus> {
        match self {
            Response::RaftStatus(s) => Ok(s),
            other => Err(unexpected("RaftStatus", &other)),
        }
    }

    pub fn into_server_id(self) -> Result<ServerId> {
        match self {
            Response::ServerId(id) => Ok(id),
            other => Err(unexpected("ServerId", &other)),
        }
    }

    pub fn into_index(self) -> Result<u64> {
        match self {
            Response::Index(i) => Ok(i),
            other => Err(unexpected("Index", &other)),
        }
    }
}

/// Who may call a method
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Zone peers and federation zones
    Peer,
    /// Administrators
    Admin,
    /// Any caller
    Any,
}

impl Access {
    pub fn permits(&self, principal: Principal) -> bool {
        match self {
            Access::Peer => principal == Principal::Peer,
            Access::Admin => principal == Principal::Admin,
            Access::Any => true,
        }
    }
}

type Handler = for<'a> fn(&'a ServerContext, Request, Principal) -> BoxFuture<'a, Result<Response>>;

pub struct Method {
    pub name: &'static str,
    pub access: Access,
    handler: Handler,
}

pub static METHODS: &[Method] = &[
    Method {
        name: "Vote",
        access: Access::Peer,
        handler: handle_vote,
    },
    Method {
        name: "ReplicateLog",
        access: Access::Peer,
        handler: handle_replicate_log,
    },
    Method {
        name: "ReplicateFedLog",
        access: Access::Peer,
        handler: handle_replicate_fed_log,
    },
    Method {
        name: "RaftStatus",
        access: Access::Any,
        handler: handle_raft_status,
    },
    Method {
        name: "AddServer",
        access: Access::Admin,
        handler: handle_add_server,
    },
    Method {
        name: "DeleteServer",
        access: Access::Admin,
        handler: handle_delete_server,
    },
    Method {
        name: "ResetServer",
        access: Access::Admin,
        handler: handle_reset_server,
    },
    Method {
        name: "Execute",
        access: Access::Admin,
        handler: handle_execute,
    },
];

pub fn lookup(name: &str) -> Option<&'static Method> {
    METHODS.iter().find(|m| m.name == name)
}

fn actor(principal: Principal) -> &'static str {
    match principal {
        Principal::Peer => "peer",
        Principal::Admin => "admin",
        Principal::Anonymous => "anonymous",
    }
}

/// Run `request` on behalf of `principal`
pub async fn dispatch(
    ctx: &ServerContext,
    principal: Principal,
    request: Request,
) -> Result<Response> {
    let name = request.method();
    let method = lookup(name).ok_or_else(|| Error::Malformed(format!("unknown method {}", name)))?;

    if ctx.config.cache {
        debug!("{} refused: cache mode", name);
        return Err(Error::CacheMode);
    }

    if !method.access.permits(principal) {
        warn!("{} refused for {} caller", name, actor(principal));
        ctx.audit.log_event(
            AuditEventType::AccessDenied,
            actor(principal),
            Some(name.to_string()),
            "insufficient privileges",
            None,
        );
        return Err(Error::Unauthorized(format!(
            "{} is not available to {} callers",
            name,
            actor(principal)
        )));
    }

    let result = (method.handler)(ctx, request, principal).await;
    if let Err(e) = &result {
        if e.is_fatal() {
            ctx.halt(e);
        }
    }
    result
}

fn mismatch(method: &str) -> Error {
    Error::Internal(format!("{} handler received another request", method))
}

fn handle_vote(ctx: &ServerContext, request: Request, _: Principal) -> BoxFuture<'_, Result<Response>> {
    Box::pin(async move {
        let Request::Vote(req) = request else {
            return Err(mismatch("Vote"));
        };
        Ok(Response::Vote(ctx.raft()?.handle_vote(&req)?))
    })
}

fn handle_replicate_log(
    ctx: &ServerContext,
    request: Request,
    _: Principal,
) -> BoxFuture<'_, Result<Response>> {
    Box::pin(async move {
        let Request::ReplicateLog(req) = request else {
            return Err(mismatch("ReplicateLog"));
        };
        Ok(Response::ReplicateLog(ctx.raft()?.handle_replicate(&req)?))
    })
}

fn handle_replicate_fed_log(
    ctx: &ServerContext,
    request: Request,
    _: Principal,
) -> BoxFuture<'_, Result<Response>> {
    Box::pin(async move {
        let Request::ReplicateFedLog(req) = request else {
            return Err(mismatch("ReplicateFedLog"));
        };
        let outcome = match ctx.fed() {
            Ok(fed) => fed.apply_log_record(&req).await,
            Err(e) => Err(e),
        };
        if let Err(e) = &outcome {
            if e.is_fatal() {
                ctx.halt(e);
            }
            debug!("federation record {} not applied: {}", req.index, e);
        }
        Ok(Response::ReplicateFedLog(FedApplyOutcome::to_response(&outcome)))
    })
}

fn handle_raft_status(
    ctx: &ServerContext,
    _: Request,
    _: Principal,
) -> BoxFuture<'_, Result<Response>> {
    Box::pin(async move { Ok(Response::RaftStatus(ctx.status()?)) })
}

fn handle_add_server(
    ctx: &ServerContext,
    request: Request,
    principal: Principal,
) -> BoxFuture<'_, Result<Response>> {
    Box::pin(async move {
        let Request::AddServer {
            zone_id,
            name,
            endpoint,
        } = request
        else {
            return Err(mismatch("AddServer"));
        };
        let id = membership::add_server(ctx, zone_id, &name, &endpoint, actor(principal)).await?;
        Ok(Response::ServerId(id))
    })
}

fn handle_delete_server(
    ctx: &ServerContext,
    request: Request,
    principal: Principal,
) -> BoxFuture<'_, Result<Response>> {
    Box::pin(async move {
        let Request::DeleteServer { zone_id, server_id } = request else {
            return Err(mismatch("DeleteServer"));
        };
        let id = membership::delete_server(ctx, zone_id, server_id, actor(principal)).await?;
        Ok(Response::ServerId(id))
    })
}

fn handle_reset_server(
    ctx: &ServerContext,
    request: Request,
    principal: Principal,
) -> BoxFuture<'_, Result<Response>> {
    Box::pin(async move {
        let Request::ResetServer { zone_id, server_id } = request else {
            return Err(mismatch("ResetServer"));
        };
        let id = membership::reset_server(ctx, zone_id, server_id, actor(principal)).await?;
        Ok(Response::ServerId(id))
    })
}

fn handle_execute(
    ctx: &ServerContext,
    request: Request,
    _: Principal,
) -> BoxFuture<'_, Result<Response>> {
    Box::pin(async move {
        let Request::Execute { sql, federated } = request else {
            return Err(mismatch("Execute"));
        };
        let index = if federated {
            ctx.execute_federated(&sql).await?
        } else {
            ctx.execute(&sql).await?
        };
        Ok(Response::Index(index))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_request_has_a_method() {
        let requests = [
            Request::Vote(VoteRequest {
                candidate_term: 1,
                candidate_id: 0,
                candidate_log_index: 0,
                candidate_log_term: 0,
            }),
            Request::ReplicateLog(ReplicateRequest::heartbeat(0, 1, 0)),
            Request::ReplicateFedLog(FedReplicateRequest {
                index: 1,
                prev: 0,
                sql: "X".into(),
            }),
            Request::RaftStatus,
            Request::AddServer {
                zone_id: 0,
                name: String::new(),
                endpoint: "e".into(),
            },
            Request::DeleteServer {
                zone_id: 0,
                server_id: 1,
            },
            Request::ResetServer {
                zone_id: 0,
                server_id: 1,
            },
            Request::Execute {
                sql: "X".into(),
                federated: false,
            },
        ];
        for request in &requests {
            assert!(lookup(request.method()).is_some(), "{}", request.method());
        }
        assert_eq!(METHODS.len(), requests.len());
    }

    #[test]
    fn test_access_rules() {
        let vote = lookup("Vote").unwrap();
        assert!(vote.access.permits(Principal::Peer));
        assert!(!vote.access.permits(Principal::Admin));

        let add = lookup("AddServer").unwrap();
        assert!(add.access.permits(Principal::Admin));
        assert!(!add.access.permits(Principal::Peer));
        assert!(!add.access.permits(Principal::Anonymous));

        assert!(lookup("RaftStatus").unwrap().access.permits(Principal::Anonymous));
    }

    #[test]
    fn test_cache_server_rejects_every_method() {
        use crate::common::Config;
        use crate::rpc::local::LocalNetwork;

        let dir = tempfile::TempDir::new().unwrap();
        let config = Config {
            data_dir: dir.path().to_path_buf(),
            endpoint: "local://cache".into(),
            cache: true,
            ..Config::default()
        };
        let network = LocalNetwork::new();
        let ctx = ServerContext::open(config, network.transport("local://cache")).unwrap();

        let status = tokio_test::block_on(dispatch(&ctx, Principal::Admin, Request::RaftStatus));
        assert!(matches!(status, Err(Error::CacheMode)), "{:?}", status);
        let replicate = tokio_test::block_on(dispatch(
            &ctx,
            Principal::Peer,
            Request::ReplicateLog(ReplicateRequest::heartbeat(0, 1, 0)),
        ));
        tokio_test::assert_err!(replicate);
    }
}
