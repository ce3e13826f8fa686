//! Client side of the datapath agent surface: the live monitor stream
//! plus the one-shot dumps used to seed the enrichment caches. The
//! agent listens on a unix socket exposed through a host-path mount.

use std::path::PathBuf;
use std::time::Duration;

use hyper_util::rt::TokioIo;
use nodeflow_api::agent::v1::agent_client::AgentClient as GrpcClient;
use nodeflow_api::agent::v1::{
    AgentEndpoint, DumpIpCacheRequest, Identity, IpCacheEntry, ListEndpointsRequest,
    ListIdentitiesRequest, MonitorEvent, MonitorEventsRequest,
};
use tokio::net::UnixStream;
use tokio::sync::mpsc::Sender;
use tokio_util::sync::CancellationToken;
use tonic::Request;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;
use tracing::{info, warn};

use crate::{Error, Result};

/// Reconnect backoff bounds for the monitor stream.
pub const MONITOR_RETRY_BASE: Duration = Duration::from_millis(250);
pub const MONITOR_RETRY_MAX: Duration = Duration::from_secs(8);
/// Consecutive failed stream attempts before ingest is declared lost.
pub const MONITOR_RETRY_LIMIT: u32 = 16;

/// The agent operations the observer consumes, as a seam so tests can
/// stand in for the agent.
#[tonic::async_trait]
pub trait AgentClient: Send + Sync {
    async fn list_endpoints(&self) -> Result<Vec<AgentEndpoint>>;
    async fn list_identities(&self) -> Result<Vec<Identity>>;
    async fn dump_ip_cache(&self) -> Result<Vec<IpCacheEntry>>;
    async fn monitor_events(&self) -> Result<tonic::Streaming<MonitorEvent>>;
}

pub struct UnixAgentClient {
    channel: Channel,
}

impl UnixAgentClient {
    pub async fn connect(path: PathBuf) -> Result<Self> {
        // The URI is required but never resolved; the connector always
        // dials the socket path.
        let channel = Endpoint::from_static("http://[::]:50051")
            .connect_with_connector(service_fn(move |_: Uri| {
                let path = path.clone();
                async move {
                    Ok::<_, std::io::Error>(TokioIo::new(UnixStream::connect(path).await?))
                }
            }))
            .await?;
        Ok(Self { channel })
    }

    fn client(&self) -> GrpcClient<Channel> {
        GrpcClient::new(self.channel.clone())
    }
}

#[tonic::async_trait]
impl AgentClient for UnixAgentClient {
    async fn list_endpoints(&self) -> Result<Vec<AgentEndpoint>> {
        let reply = self
            .client()
            .list_endpoints(Request::new(ListEndpointsRequest {}))
            .await?;
        Ok(reply.into_inner().endpoints)
    }

    async fn list_identities(&self) -> Result<Vec<Identity>> {
        let reply = self
            .client()
            .list_identities(Request::new(ListIdentitiesRequest {}))
            .await?;
        Ok(reply.into_inner().identities)
    }

    async fn dump_ip_cache(&self) -> Result<Vec<IpCacheEntry>> {
        let reply = self
            .client()
            .dump_ip_cache(Request::new(DumpIpCacheRequest {}))
            .await?;
        Ok(reply.into_inner().entries)
    }

    async fn monitor_events(&self) -> Result<tonic::Streaming<MonitorEvent>> {
        let reply = self
            .client()
            .monitor_events(Request::new(MonitorEventsRequest {}))
            .await?;
        Ok(reply.into_inner())
    }
}

/// Pumps the agent's monitor stream into `events`, reconnecting with
/// bounded exponential backoff on transient failures. Returns an error
/// once the stream cannot be re-established, which the caller treats
/// as unrecoverable ingest loss.
pub async fn run_monitor(
    client: std::sync::Arc<dyn AgentClient>,
    events: Sender<MonitorEvent>,
    cancel: CancellationToken,
) -> Result<()> {
    let mut delay = MONITOR_RETRY_BASE;
    let mut failures: u32 = 0;
    loop {
        match client.monitor_events().await {
            Ok(mut stream) => {
                info!("monitor stream established");
                delay = MONITOR_RETRY_BASE;
                failures = 0;
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        message = stream.message() => match message {
                            Ok(Some(event)) => {
                                if events.send(event).await.is_err() {
                                    return Err(Error::Channel);
                                }
                            }
                            Ok(None) => {
                                warn!("monitor stream closed by agent");
                                break;
                            }
                            Err(e) => {
                                warn!(%e, "monitor stream failed");
                                break;
                            }
                        },
                    }
                }
            }
            Err(e) => {
                failures += 1;
                if failures >= MONITOR_RETRY_LIMIT {
                    warn!(%e, failures, "giving up on the monitor stream");
                    return Err(Error::MonitorUnavailable);
                }
                warn!(%e, "failed to open monitor stream");
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = tokio::time::sleep(delay) => {}
        }
        delay = (delay * 2).min(MONITOR_RETRY_MAX);
    }
}
