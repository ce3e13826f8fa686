pub mod filter;
mod observer;

use std::fs;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use nodeflow_api::agent::v1::{AgentNotify, MonitorEvent, monitor_event};
use nodeflow_api::observer::v1::observer_server::ObserverServer;
use nodeflow_api::observer::v1::{EventKind, Flow, Payload};
use tokio::net::UnixListener;
use tokio::sync::mpsc::{Receiver, Sender};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio_stream::wrappers::UnixListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::service::{Routes, RoutesBuilder};
use tonic::transport::Server;
use tracing::{debug, info, warn};

pub use observer::ObserverService;

use crate::agent::{AgentClient, UnixAgentClient, run_monitor};
use crate::config::ServeArgs;
use crate::endpoint::{Endpoint, Endpoints};
use crate::getters::{NoopDnsGetter, PodGetter, PodResolver};
use crate::http::shutdown;
use crate::identity::{Identity, IdentityCache};
use crate::ipcache::IpCache;
use crate::metrics::Metrics;
use crate::parser::Parser;
use crate::ring::Ring;
use crate::{Error, Result, ipcache, monitor};

/// Hard limit on the one-shot cache bootstrap from the agent.
pub const BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(30);
/// Raw monitor events buffered between the socket reader and decode.
pub const MONITOR_EVENT_CAPACITY: usize = 4096;
/// IP cache notifications buffered while the bootstrap dump is in
/// flight; applied by the sync loop afterwards.
pub const IPCACHE_EVENT_CAPACITY: usize = 1024;

/// Daemon lifecycle. Draining means no new events are decoded and open
/// streams are being run down.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Initializing,
    BootstrappingCaches,
    Running,
    Draining,
    Stopped,
}

enum ListenAddr {
    Tcp(SocketAddr),
    Unix(PathBuf),
}

/// Runs the observer daemon until `cancel` fires or a task dies. A
/// bootstrap failure or the loss of the monitor stream is returned as
/// an error so the process exits non-zero.
pub async fn start(args: ServeArgs, metrics: Arc<Metrics>, cancel: CancellationToken) -> Result<()> {
    let (state, _state_rx) = watch::channel(State::Initializing);

    let ring = Arc::new(Ring::new(args.max_flows));
    let endpoints = Arc::new(Endpoints::new());
    let ip_cache = Arc::new(IpCache::new());
    let identities = Arc::new(IdentityCache::new());

    if let Some(cri) = &args.cri_endpoint {
        warn!(endpoint = %cri, "CRI pod resolution is not wired up; relying on the agent ip cache");
    }

    let agent: Arc<dyn AgentClient> =
        Arc::new(UnixAgentClient::connect(args.agent_socket_path.clone()).await?);

    // Open the monitor stream before fetching the dumps so nothing is
    // missed in between; events buffer in the channel meanwhile.
    let (event_tx, event_rx) = tokio::sync::mpsc::channel(MONITOR_EVENT_CAPACITY);
    let (notify_tx, notify_rx) = tokio::sync::mpsc::channel(IPCACHE_EVENT_CAPACITY);
    let mut monitor_handle = tokio::spawn(run_monitor(agent.clone(), event_tx, cancel.child_token()));

    set_state(&state, State::BootstrappingCaches);
    bootstrap(agent.as_ref(), &endpoints, &ip_cache, &identities).await?;

    let pod_resolver = PodResolver::new(vec![
        ip_cache.clone() as Arc<dyn PodGetter>,
        endpoints.clone() as Arc<dyn PodGetter>,
    ]);
    let parser = Parser::new(
        Some(endpoints.clone()),
        Some(identities.clone()),
        Some(Arc::new(NoopDnsGetter)),
        Some(Arc::new(pod_resolver)),
        Some(ip_cache.clone()),
    );

    let mut sync_handle = tokio::spawn(ipcache::sync(ip_cache.clone(), notify_rx));
    let mut ingest_handle = tokio::spawn(ingest(
        event_rx,
        parser,
        ring.clone(),
        notify_tx,
        metrics.clone(),
        args.node_name(),
    ));

    let (health_reporter, health_service) = tonic_health::server::health_reporter();
    let observer = ObserverService::new(ring.clone(), cancel.child_token());
    let mut routes = RoutesBuilder::default();
    routes
        .add_service(health_service)
        .add_service(ObserverServer::new(observer));
    let mut server_handle = tokio::spawn(serve_all(
        args.listen_client_urls.clone(),
        routes.routes(),
        cancel.child_token(),
    ));

    set_state(&state, State::Running);
    health_reporter
        .set_serving::<ObserverServer<ObserverService>>()
        .await;
    info!("observer is running");

    enum Finished {
        Shutdown,
        Monitor(Result<()>),
        Ingest(Result<(), tokio::task::JoinError>),
        Sync(Result<(), tokio::task::JoinError>),
        Server(Result<()>),
    }

    let finished = tokio::select! {
        _ = cancel.cancelled() => Finished::Shutdown,
        r = &mut monitor_handle => Finished::Monitor(flatten(r)),
        r = &mut ingest_handle => Finished::Ingest(r),
        r = &mut sync_handle => Finished::Sync(r),
        r = &mut server_handle => Finished::Server(flatten(r)),
    };

    set_state(&state, State::Draining);
    health_reporter
        .set_not_serving::<ObserverServer<ObserverService>>()
        .await;
    cancel.cancel();

    let outcome = match finished {
        Finished::Shutdown => {
            join("monitor", monitor_handle).await;
            join("ingest", ingest_handle).await;
            join("ip cache sync", sync_handle).await;
            join("server", server_handle).await;
            Ok(())
        }
        Finished::Monitor(result) => {
            join("ingest", ingest_handle).await;
            join("ip cache sync", sync_handle).await;
            join("server", server_handle).await;
            result
        }
        Finished::Ingest(result) => {
            join("monitor", monitor_handle).await;
            join("ip cache sync", sync_handle).await;
            join("server", server_handle).await;
            result.map_err(|e| Error::Task(e.to_string()))
        }
        Finished::Sync(result) => {
            join("monitor", monitor_handle).await;
            join("ingest", ingest_handle).await;
            join("server", server_handle).await;
            result.map_err(|e| Error::Task(e.to_string()))
        }
        Finished::Server(result) => {
            join("monitor", monitor_handle).await;
            join("ingest", ingest_handle).await;
            join("ip cache sync", sync_handle).await;
            result
        }
    };

    set_state(&state, State::Stopped);
    outcome
}

fn set_state(state: &watch::Sender<State>, next: State) {
    info!(state = ?next, "observer state changed");
    state.send_replace(next);
}

fn flatten<T>(result: Result<Result<T>, tokio::task::JoinError>) -> Result<T> {
    match result {
        Ok(inner) => inner,
        Err(e) => Err(Error::Task(e.to_string())),
    }
}

async fn join<T>(task: &str, handle: JoinHandle<T>) {
    if let Err(e) = handle.await {
        warn!(%e, "{task} did not shut down cleanly");
    }
}

/// Seeds the endpoint table, ip cache and identity cache from the
/// agent. A failure here is fatal; the decoder would produce unusable
/// flows without the caches.
async fn bootstrap(
    agent: &dyn AgentClient,
    endpoints: &Endpoints,
    ip_cache: &IpCache,
    identities: &IdentityCache,
) -> Result<()> {
    tokio::time::timeout(BOOTSTRAP_TIMEOUT, async {
        let agent_endpoints = agent.list_endpoints().await?;
        let parsed: Vec<Endpoint> = agent_endpoints
            .into_iter()
            .filter_map(|ep| match Endpoint::try_from(ep) {
                Ok(ep) => Some(ep),
                Err(e) => {
                    warn!(%e, "skipping endpoint with unparseable address");
                    None
                }
            })
            .collect();
        info!(endpoints = parsed.len(), "seeded endpoint table");
        endpoints.sync(parsed);

        let entries = agent.dump_ip_cache().await?;
        info!(entries = entries.len(), "seeded ip cache");
        ip_cache.seed(entries);

        let listed = agent.list_identities().await?;
        info!(identities = listed.len(), "seeded identity cache");
        identities.replace(listed.into_iter().map(Identity::from));
        Ok(())
    })
    .await
    .map_err(|_| Error::BootstrapTimeout)?
}

/// Pulls monitor events off the channel, routes agent notifications to
/// the ip cache sync loop and decodes everything else into the ring.
/// A single bad event is counted and dropped, never fatal.
async fn ingest(
    mut events: Receiver<MonitorEvent>,
    parser: Parser,
    ring: Arc<Ring>,
    notifications: Sender<AgentNotify>,
    metrics: Arc<Metrics>,
    node_name: String,
) {
    while let Some(event) = events.recv().await {
        match event.event {
            Some(monitor_event::Event::Notify(notify)) => {
                metrics.inc_event(monitor::MESSAGE_TYPE_AGENT);
                if notifications.send(notify).await.is_err() {
                    warn!("ip cache sync loop is gone; dropping notification");
                }
            }
            Some(monitor_event::Event::Payload(data)) => {
                if let Some(first) = data.first() {
                    metrics.inc_event(*first);
                }
                let payload = Payload {
                    kind: EventKind::EventSample as i32,
                    time: event.time,
                    host_name: match event.node_name.is_empty() {
                        true => node_name.clone(),
                        false => event.node_name,
                    },
                    data,
                };
                let mut flow = Flow::default();
                match parser.decode(&payload, &mut flow) {
                    Ok(()) => {
                        metrics.observe_flow(&flow);
                        ring.write(Arc::new(flow));
                    }
                    Err(e) => {
                        metrics.inc_decode_error();
                        debug!(%e, "failed to decode monitor event");
                    }
                }
            }
            None => {}
        }
    }
}

/// Serves the observer routes on every configured listener.
async fn serve_all(urls: Vec<String>, routes: Routes, cancel: CancellationToken) -> Result<()> {
    let mut set = JoinSet::new();
    for url in &urls {
        let addr = parse_listen_url(url)?;
        set.spawn(serve_listener(addr, routes.clone(), cancel.child_token()));
    }
    while let Some(result) = set.join_next().await {
        flatten(result)?;
    }
    Ok(())
}

fn parse_listen_url(url: &str) -> Result<ListenAddr> {
    if let Some(path) = url.strip_prefix("unix://") {
        return Ok(ListenAddr::Unix(PathBuf::from(path)));
    }
    let raw = url.strip_prefix("tcp://").unwrap_or(url);
    raw.parse()
        .map(ListenAddr::Tcp)
        .map_err(|_| Error::InvalidListenUrl(url.to_string()))
}

async fn serve_listener(addr: ListenAddr, routes: Routes, cancel: CancellationToken) -> Result<()> {
    match addr {
        ListenAddr::Tcp(addr) => {
            info!("observer listening on {}", addr);
            Server::builder()
                .add_routes(routes)
                .serve_with_shutdown(addr, shutdown(cancel))
                .await?;
        }
        ListenAddr::Unix(path) => {
            if let Err(e) = fs::remove_file(&path)
                && e.kind() != ErrorKind::NotFound
            {
                return Err(e.into());
            }
            let Some(parent) = path.parent() else {
                return Err(std::io::Error::new(
                    ErrorKind::NotFound,
                    format!("parent of path {} could not resolve", path.display()),
                )
                .into());
            };
            fs::create_dir_all(parent)?;
            let listener = UnixListener::bind(&path)?;
            info!("observer listening on {}", path.display());

            let stream = UnixListenerStream::new(listener);
            Server::builder()
                .add_routes(routes)
                .serve_with_incoming_shutdown(stream, shutdown(cancel))
                .await?;
        }
    }
    Ok(())
}
