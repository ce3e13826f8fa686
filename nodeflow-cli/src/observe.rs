use nodeflow_api::observer::v1::observer_client::ObserverClient;
use nodeflow_api::observer::v1::{
    Flow, FlowFilter, GetFlowsRequest, Verdict, get_flows_response, layer4,
};
use tonic::Request;

use crate::cli::ObserveArgs;
use crate::client;

pub(crate) async fn run(server: &str, args: ObserveArgs) -> anyhow::Result<()> {
    let request = build_request(&args)?;
    let channel = client::connect(server).await?;
    let mut client = ObserverClient::new(channel);

    let mut stream = client.get_flows(Request::new(request)).await?.into_inner();
    while let Some(response) = stream.message().await? {
        match response.response_types {
            Some(get_flows_response::ResponseTypes::Flow(flow)) => {
                println!("{}", format_flow(&flow));
            }
            Some(get_flows_response::ResponseTypes::LostEvents(lost)) => {
                eprintln!("[{} events lost]", lost.num_events_lost);
            }
            None => {}
        }
    }
    Ok(())
}

/// Every side-specific flag matches either side of the flow, so each
/// flag set expands into a source filter and a destination filter.
fn build_request(args: &ObserveArgs) -> anyhow::Result<GetFlowsRequest> {
    let verdicts = args
        .verdict
        .iter()
        .map(|v| parse_verdict(v))
        .collect::<anyhow::Result<Vec<i32>>>()?;

    let mut whitelist = Vec::new();
    let sided = !args.pod.is_empty()
        || !args.namespace.is_empty()
        || !args.label.is_empty()
        || !args.port.is_empty();
    if sided {
        whitelist.push(FlowFilter {
            source_pod: args.pod.clone(),
            source_namespace: args.namespace.clone(),
            source_label: args.label.clone(),
            source_port: args.port.clone(),
            verdict: verdicts.clone(),
            protocol: args.protocol.clone(),
            ..Default::default()
        });
        whitelist.push(FlowFilter {
            destination_pod: args.pod.clone(),
            destination_namespace: args.namespace.clone(),
            destination_label: args.label.clone(),
            destination_port: args.port.clone(),
            verdict: verdicts.clone(),
            protocol: args.protocol.clone(),
            ..Default::default()
        });
    } else if !verdicts.is_empty() || !args.protocol.is_empty() {
        whitelist.push(FlowFilter {
            verdict: verdicts,
            protocol: args.protocol.clone(),
            ..Default::default()
        });
    }

    Ok(GetFlowsRequest {
        number: args.number,
        follow: args.follow,
        whitelist,
        ..Default::default()
    })
}

fn parse_verdict(value: &str) -> anyhow::Result<i32> {
    let verdict = match value.to_lowercase().as_str() {
        "forwarded" => Verdict::Forwarded,
        "dropped" => Verdict::Dropped,
        "error" => Verdict::Error,
        other => anyhow::bail!("unknown verdict: {other}"),
    };
    Ok(verdict as i32)
}

fn format_flow(flow: &Flow) -> String {
    let time = flow
        .time
        .as_ref()
        .map(|t| format!("{}.{:09}", t.seconds, t.nanos))
        .unwrap_or_else(|| "-".into());

    let (source_port, destination_port, protocol) =
        match flow.l4.as_ref().and_then(|l4| l4.protocol.as_ref()) {
            Some(layer4::Protocol::Tcp(tcp)) => (
                Some(tcp.source_port),
                Some(tcp.destination_port),
                "TCP",
            ),
            Some(layer4::Protocol::Udp(udp)) => (
                Some(udp.source_port),
                Some(udp.destination_port),
                "UDP",
            ),
            Some(layer4::Protocol::Icmpv4(_)) => (None, None, "ICMPv4"),
            Some(layer4::Protocol::Icmpv6(_)) => (None, None, "ICMPv6"),
            None => (None, None, "-"),
        };

    let verdict = match flow.verdict() {
        Verdict::Forwarded => "FORWARDED",
        Verdict::Dropped => "DROPPED",
        Verdict::Error => "ERROR",
        Verdict::Unknown => "UNKNOWN",
    };

    format!(
        "{time} {src} -> {dst} {protocol} {verdict}",
        src = endpoint_str(flow, true, source_port),
        dst = endpoint_str(flow, false, destination_port),
    )
}

fn endpoint_str(flow: &Flow, source: bool, port: Option<u32>) -> String {
    let (endpoint, address) = match source {
        true => (
            flow.source.as_ref(),
            flow.ip.as_ref().map(|ip| ip.source.as_str()),
        ),
        false => (
            flow.destination.as_ref(),
            flow.ip.as_ref().map(|ip| ip.destination.as_str()),
        ),
    };

    let address = address.unwrap_or("-");
    let address = match port {
        Some(port) => format!("{address}:{port}"),
        None => address.to_string(),
    };
    match endpoint {
        Some(ep) if !ep.pod_name.is_empty() => {
            format!("{}/{} ({})", ep.namespace, ep.pod_name, address)
        }
        _ => address,
    }
}
