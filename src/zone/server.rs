//! Zone server daemon

use crate::common::{Config, Error, Result};
use crate::rpc::{create_router, GrpcTransport, ZoneGrpcService};
use crate::zone::ServerContext;
use futures_util::stream::{FuturesUnordered, StreamExt};
use std::future::IntoFuture;
use std::sync::Arc;

pub struct ZoneServerNode {
    config: Config,
}

impl ZoneServerNode {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub async fn serve(self) -> Result<()> {
        let config = self.config;
        tracing::info!(
            "Starting zone server {} (zone {})",
            config.server_id,
            config.zone_id
        );
        tracing::info!("  Endpoint: {}", config.endpoint);
        tracing::info!("  HTTP API: {}", config.http_addr);
        tracing::info!("  gRPC API: {}", config.grpc_addr);
        tracing::info!("  Data dir: {}", config.data_dir.display());
        tracing::info!("  Federation: {:?}", config.federation.mode);

        let transport = Arc::new(GrpcTransport::new(
            config.raft.rpc_timeout(),
            config.auth.peer_key.as_deref(),
        )?);
        let ctx = ServerContext::open(config, transport)?;

        if !ctx.auth.admin_auth_enabled() {
            tracing::warn!("No admin token configured: admin API is open to any caller");
        }

        let mut background: FuturesUnordered<_> = ctx.start().into_iter().collect();

        let grpc_server = tonic::transport::Server::builder()
            .add_service(ZoneGrpcService::new(ctx.clone()).into_server())
            .serve(ctx.config.grpc_addr);

        let http_listener = tokio::net::TcpListener::bind(ctx.config.http_addr).await?;
        let http_server = axum::serve(http_listener, create_router(ctx.clone())).into_future();

        match ctx.status() {
            Ok(status) => tracing::info!("✓ Zone server ready ({}, term {})", status.role, status.term),
            Err(_) => tracing::info!("✓ Zone server ready (cache mode)"),
        }

        let result = tokio::select! {
            res = http_server => res.map_err(Error::from),
            res = grpc_server => res.map_err(Error::from),
            Some(res) = background.next(), if !background.is_empty() => match res {
                Ok(res) => res,
                Err(e) => Err(Error::Internal(format!("background task panicked: {}", e))),
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutdown requested");
                Ok(())
            }
        };

        ctx.shutdown();
        if let Err(e) = &result {
            tracing::error!("Zone server stopped: {}", e);
        }
        result
    }
}
