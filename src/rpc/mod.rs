//! RPC surfaces of a zone server: peer gRPC, the admin HTTP API and an
//! in-process network, all funnelled through one dispatch table

pub mod client;
pub mod dispatch;
pub mod grpc;
pub mod http;
pub mod local;
pub mod transport;

pub use client::GrpcTransport;
pub use dispatch::{dispatch, Access, Request, Response};
pub use grpc::ZoneGrpcService;
pub use http::create_router;
pub use local::LocalNetwork;
pub use transport::Transport;
