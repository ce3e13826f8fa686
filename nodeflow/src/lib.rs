pub mod agent;
pub mod config;
pub mod endpoint;
pub mod getters;
pub mod http;
pub mod identity;
pub mod ipcache;
pub mod metrics;
pub mod monitor;
pub mod packet;
pub mod parser;
pub mod ring;
pub mod server;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("empty event payload")]
    EmptyPayload,

    #[error("unknown event type: {0}")]
    UnknownEventType(u8),

    #[error("unknown trace version: {0}")]
    UnknownTraceVersion(u8),

    #[error("truncated {0} header")]
    TruncatedHeader(&'static str),

    #[error("unknown ether type: {0:#06x}")]
    UnknownEtherType(u16),

    #[error("identity {0} not found")]
    IdentityNotFound(u64),

    #[error("invalid flow filter: {0}")]
    InvalidFilter(String),

    #[error("unknown metric handler: {0}")]
    UnknownMetric(String),

    #[error("invalid listen url: {0}")]
    InvalidListenUrl(String),

    #[error("cache bootstrap did not complete in time")]
    BootstrapTimeout,

    #[error("monitor stream is unavailable")]
    MonitorUnavailable,

    #[error("unable to send event due to channel error")]
    Channel,

    #[error("task failed: {0}")]
    Task(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("rpc error: {0}")]
    Rpc(#[from] tonic::Status),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("addr parse error: {0}")]
    AddrParse(#[from] std::net::AddrParseError),

    #[error("cidr parse error: {0}")]
    CidrParse(#[from] ipnet::AddrParseError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
