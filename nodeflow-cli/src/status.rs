use nodeflow_api::observer::v1::ServerStatusRequest;
use nodeflow_api::observer::v1::observer_client::ObserverClient;
use tabled::{Table, settings::Style};
use tonic::Request;
use tonic_health::pb::HealthCheckRequest;
use tonic_health::pb::health_check_response::ServingStatus;
use tonic_health::pb::health_client::HealthClient;

use crate::client;

/// Fully qualified service name the observer registers with the health
/// service.
const OBSERVER_SERVICE: &str = "observer.v1.Observer";

pub(crate) async fn run(server: &str) -> anyhow::Result<()> {
    let channel = client::connect(server).await?;

    let mut health = HealthClient::new(channel.clone());
    let response = health
        .check(Request::new(HealthCheckRequest {
            service: OBSERVER_SERVICE.into(),
        }))
        .await;
    let (healthy, status) = match &response {
        Ok(r) if r.get_ref().status() == ServingStatus::Serving => (true, "Ok".to_string()),
        Ok(r) => (false, format!("Unavailable: {:?}", r.get_ref().status())),
        Err(e) => (false, format!("Error: {e}")),
    };
    println!("Healthcheck (via {server}): {status}");
    if !healthy {
        std::process::exit(1);
    }

    let mut observer = ObserverClient::new(channel);
    let status = observer
        .server_status(Request::new(ServerStatusRequest {}))
        .await?
        .into_inner();

    let table = Table::new([status]).with(Style::empty()).to_string();
    println!("{table}");
    Ok(())
}
