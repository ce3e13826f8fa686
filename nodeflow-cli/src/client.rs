use std::path::PathBuf;

use hyper_util::rt::TokioIo;
use tokio::net::UnixStream;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;

pub const OBSERVER_SOCKET: &str = "unix:///var/run/nodeflow/observer.sock";

/// Connects to the observer, over its unix socket for `unix://`
/// targets and plain TCP otherwise.
pub async fn connect(target: &str) -> anyhow::Result<Channel> {
    if let Some(path) = target.strip_prefix("unix://") {
        let path = PathBuf::from(path);
        // the URI is never resolved; the connector dials the socket
        let channel = Endpoint::from_static("http://[::]:50051")
            .connect_with_connector(service_fn(move |_: Uri| {
                let path = path.clone();
                async move {
                    Ok::<_, std::io::Error>(TokioIo::new(UnixStream::connect(path).await?))
                }
            }))
            .await?;
        return Ok(channel);
    }

    let endpoint = Endpoint::from_shared(format!("http://{target}"))?;
    Ok(endpoint.connect().await?)
}
