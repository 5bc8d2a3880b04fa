//! gRPC transport used by a running zone server to reach its peers
//!
//! Channels are created lazily per endpoint and reused; tonic reconnects
//! them on its own after a failure. Call deadlines are enforced by the
//! callers, only the connect timeout is set here.

use crate::common::raft::{
    FedReplicateRequest, FedReplicateResponse, ReplicateRequest, ReplicateResponse, VoteRequest,
    VoteResponse,
};
use crate::common::{Error, Result};
use crate::proto::zone_internal_client::ZoneInternalClient;
use crate::rpc::transport::Transport;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tonic::metadata::{Ascii, MetadataValue};
use tonic::transport::{Channel, Endpoint};

/// Metadata key carrying the shared zone peer key
pub const PEER_KEY_HEADER: &str = "x-zone-peer-key";

pub struct GrpcTransport {
    channels: Mutex<HashMap<String, Channel>>,
    connect_timeout: Duration,
    peer_key: Option<MetadataValue<Ascii>>,
}

impl GrpcTransport {
    pub fn new(connect_timeout: Duration, peer_key: Option<&str>) -> Result<Self> {
        let peer_key = peer_key
            .map(|key| {
                key.parse::<MetadataValue<Ascii>>()
                    .map_err(|_| Error::InvalidConfig("peer key must be ASCII".into()))
            })
            .transpose()?;
        Ok(Self {
            channels: Mutex::new(HashMap::new()),
            connect_timeout,
            peer_key,
        })
    }

    fn client(&self, endpoint: &str) -> Result<ZoneInternalClient<Channel>> {
        let mut channels = self.channels.lock();
        let channel = match channels.get(endpoint) {
            Some(channel) => channel.clone(),
            None => {
                let channel = Endpoint::from_shared(endpoint.to_string())
                    .map_err(|e| Error::ConnectionFailed(format!("{}: {}", endpoint, e)))?
                    .connect_timeout(self.connect_timeout)
                    .connect_lazy();
                channels.insert(endpoint.to_string(), channel.clone());
                channel
            }
        };
        Ok(ZoneInternalClient::new(channel))
    }

    fn request<T>(&self, message: T) -> tonic::Request<T> {
        let mut request = tonic::Request::new(message);
        if let Some(key) = &self.peer_key {
            request.metadata_mut().insert(PEER_KEY_HEADER, key.clone());
        }
        request
    }
}

#[tonic::async_trait]
impl Transport for GrpcTransport {
    async fn request_vote(&self, endpoint: &str, req: VoteRequest) -> Result<VoteResponse> {
        let mut client = self.client(endpoint)?;
        let proto_req: crate::proto::VoteRequest = (&req).into();
        let resp = client.vote(self.request(proto_req)).await?.into_inner();
        Ok((&resp).into())
    }

    async fn replicate_log(
        &self,
        endpoint: &str,
        req: ReplicateRequest,
    ) -> Result<ReplicateResponse> {
        let mut client = self.client(endpoint)?;
        let proto_req: crate::proto::ReplicateRequest = (&req).into();
        let resp = client.replicate_log(self.request(proto_req)).await?.into_inner();
        Ok((&resp).into())
    }

    async fn replicate_fed_log(
        &self,
        endpoint: &str,
        req: FedReplicateRequest,
    ) -> Result<FedReplicateResponse> {
        let mut client = self.client(endpoint)?;
        let proto_req: crate::proto::FedReplicateRequest = (&req).into();
        let resp = client
            .replicate_fed_log(self.request(proto_req))
            .await?
            .into_inner();
        Ok((&resp).into())
    }
}
