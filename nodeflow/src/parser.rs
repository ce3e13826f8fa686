//! Turns raw monitor events into enriched flows. The parser itself is
//! stateless; everything it knows about the node comes from the getter
//! seams it was built with.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use nodeflow_api::observer::v1::{
    Endpoint as FlowEndpoint, EventType, Flow, Icmpv4, Icmpv6, Ip, IpVersion, Layer4, Payload, Tcp,
    TcpFlags, Udp, Verdict, layer4,
};
use tracing::debug;

use crate::getters::{DnsGetter, EndpointGetter, IdentityGetter, IpIdentityGetter, PodGetter};
use crate::identity::SecurityIdentity;
use crate::{Error, Result, monitor, packet};

pub struct Parser {
    endpoints: Option<Arc<dyn EndpointGetter>>,
    identities: Option<Arc<dyn IdentityGetter>>,
    dns: Option<Arc<dyn DnsGetter>>,
    pods: Option<Arc<dyn PodGetter>>,
    ip_identities: Option<Arc<dyn IpIdentityGetter>>,
}

/// The fields shared by all decodable monitor headers.
struct Header {
    event_type: i32,
    sub_type: i32,
    src_label: u32,
    dst_label: u32,
    verdict: Verdict,
    drop_reason: u32,
    reply: bool,
    orig_ip: Option<[u8; 16]>,
}

impl Parser {
    pub fn new(
        endpoints: Option<Arc<dyn EndpointGetter>>,
        identities: Option<Arc<dyn IdentityGetter>>,
        dns: Option<Arc<dyn DnsGetter>>,
        pods: Option<Arc<dyn PodGetter>>,
        ip_identities: Option<Arc<dyn IpIdentityGetter>>,
    ) -> Self {
        Self {
            endpoints,
            identities,
            dns,
            pods,
            ip_identities,
        }
    }

    /// Decodes one monitor event into `flow`. Every field of `flow` is
    /// assigned on success, so a buffer reused across events never
    /// leaks state from an earlier decode.
    pub fn decode(&self, payload: &Payload, flow: &mut Flow) -> Result<()> {
        let (header, frame) = decode_header(&payload.data)?;

        let decoded = match frame {
            Some(frame) => packet::decode_frame(frame)?,
            None => packet::Decoded::default(),
        };

        let src_identity = SecurityIdentity::from(header.src_label);
        let dst_identity = SecurityIdentity::from(header.dst_label);
        let src_ip = decoded.l3.map(|l3| l3.src);
        let dst_ip = decoded.l3.map(|l3| l3.dst);

        let source = self.resolve_endpoint(src_ip, src_identity);
        let destination = self.resolve_endpoint(dst_ip, dst_identity);

        flow.time = payload.time.clone();
        flow.node_name = payload.host_name.clone();
        flow.set_verdict(header.verdict);
        flow.drop_reason = header.drop_reason;
        flow.event_type = Some(EventType {
            r#type: header.event_type,
            sub_type: header.sub_type,
        });
        flow.reply = header.reply;
        flow.ip = decoded.l3.map(|l3| assemble_ip(l3, header.orig_ip));
        flow.l4 = decoded.l4.map(assemble_l4);
        flow.l7 = None;
        flow.source_names = self.resolve_names(destination.id, src_ip);
        flow.destination_names = self.resolve_names(source.id, dst_ip);
        flow.source = Some(source);
        flow.destination = Some(destination);
        flow.payload = Some(payload.clone());
        Ok(())
    }

    fn resolve_endpoint(&self, ip: Option<IpAddr>, identity: SecurityIdentity) -> FlowEndpoint {
        let mut ep = FlowEndpoint {
            identity: identity.id,
            ..Default::default()
        };
        let Some(ip) = ip else {
            return ep;
        };

        if let Some(endpoints) = &self.endpoints
            && let Some(local) = endpoints.get_endpoint(ip)
        {
            ep.id = local.id;
            ep.namespace = local.pod_namespace;
            ep.pod_name = local.pod_name;
            ep.labels = local.labels;
        }

        // Events forwarded before the datapath assigned an identity
        // carry label zero; fall back to the agent IP cache.
        if ep.identity == 0
            && let Some(ip_identities) = &self.ip_identities
            && let Some(covering) = ip_identities.get_identity_of(ip)
        {
            ep.identity = covering;
        }

        if ep.labels.is_empty()
            && let Some(identities) = &self.identities
        {
            match identities.get_identity(ep.identity) {
                Ok(resolved) => {
                    let mut labels = match identity.is_local {
                        true => filter_cidr_labels(resolved.labels),
                        false => resolved.labels,
                    };
                    labels.sort();
                    ep.labels = labels;
                }
                Err(e) => debug!(identity = ep.identity, %e, "failed to resolve identity"),
            }
        }

        if ep.pod_name.is_empty()
            && let Some(pods) = &self.pods
            && let Some((namespace, pod_name)) = pods.get_pod_name_of(ip)
        {
            ep.namespace = namespace;
            ep.pod_name = pod_name;
        }

        ep
    }

    fn resolve_names(&self, endpoint_id: u64, ip: Option<IpAddr>) -> Vec<String> {
        // DNS names come from the lookup history of the local endpoint
        // on the other side; without one there is nothing to ask for.
        if endpoint_id == 0 {
            return Vec::new();
        }
        match (&self.dns, ip) {
            (Some(dns), Some(ip)) => dns.get_names_of(endpoint_id, ip),
            _ => Vec::new(),
        }
    }
}

fn decode_header(data: &[u8]) -> Result<(Header, Option<&[u8]>)> {
    let message_type = *data.first().ok_or(Error::EmptyPayload)?;
    match message_type {
        monitor::MESSAGE_TYPE_TRACE => {
            let (v0, rest) = monitor::read_header::<monitor::TraceNotifyV0>(data, "trace")?;
            let (orig_ip, frame) = match v0.version {
                monitor::TRACE_NOTIFY_VERSION_0 => (None, rest),
                monitor::TRACE_NOTIFY_VERSION_1 => {
                    let (v1, rest) = monitor::read_header::<monitor::TraceNotifyV1>(data, "trace")?;
                    (Some(v1.orig_ip), rest)
                }
                version => return Err(Error::UnknownTraceVersion(version)),
            };
            Ok((
                Header {
                    event_type: monitor::MESSAGE_TYPE_TRACE as i32,
                    sub_type: v0.obs_point as i32,
                    src_label: v0.src_label,
                    dst_label: v0.dst_label,
                    verdict: Verdict::Forwarded,
                    drop_reason: 0,
                    reply: v0.reason == monitor::TRACE_REASON_CT_REPLY,
                    orig_ip,
                },
                Some(frame),
            ))
        }
        monitor::MESSAGE_TYPE_DROP => {
            let (dn, rest) = monitor::read_header::<monitor::DropNotify>(data, "drop")?;
            Ok((
                Header {
                    event_type: monitor::MESSAGE_TYPE_DROP as i32,
                    sub_type: dn.sub_type as i32,
                    src_label: dn.src_label,
                    dst_label: dn.dst_label,
                    verdict: Verdict::Dropped,
                    drop_reason: dn.sub_type as u32,
                    reply: false,
                    orig_ip: None,
                },
                Some(rest),
            ))
        }
        monitor::MESSAGE_TYPE_POLICY_VERDICT => {
            let (pn, rest) =
                monitor::read_header::<monitor::PolicyVerdictNotify>(data, "policy verdict")?;
            let (verdict, drop_reason) = match pn.verdict {
                v if v < 0 => (Verdict::Dropped, (-v) as u32),
                _ => (Verdict::Forwarded, 0),
            };
            // The header carries one identity, the remote one; the
            // direction flag says which side it belongs to.
            let ingress = pn.flags & monitor::POLICY_VERDICT_FLAG_DIRECTION_MASK == 1;
            let (src_label, dst_label) = match ingress {
                true => (pn.remote_label, 0),
                false => (0, pn.remote_label),
            };
            Ok((
                Header {
                    event_type: monitor::MESSAGE_TYPE_POLICY_VERDICT as i32,
                    sub_type: pn.sub_type as i32,
                    src_label,
                    dst_label,
                    verdict,
                    drop_reason,
                    reply: false,
                    orig_ip: None,
                },
                Some(rest),
            ))
        }
        monitor::MESSAGE_TYPE_CAPTURE => {
            let (dc, rest) = monitor::read_header::<monitor::DebugCapture>(data, "capture")?;
            Ok((
                Header {
                    event_type: monitor::MESSAGE_TYPE_CAPTURE as i32,
                    sub_type: dc.sub_type as i32,
                    src_label: 0,
                    dst_label: 0,
                    verdict: Verdict::Unknown,
                    drop_reason: 0,
                    reply: false,
                    orig_ip: None,
                },
                Some(rest),
            ))
        }
        monitor::MESSAGE_TYPE_DEBUG => {
            let (de, _) = monitor::read_header::<monitor::DebugEvent>(data, "debug")?;
            Ok((
                Header {
                    event_type: monitor::MESSAGE_TYPE_DEBUG as i32,
                    sub_type: de.sub_type as i32,
                    src_label: 0,
                    dst_label: 0,
                    verdict: Verdict::Unknown,
                    drop_reason: 0,
                    reply: false,
                    orig_ip: None,
                },
                None,
            ))
        }
        other => Err(Error::UnknownEventType(other)),
    }
}

fn assemble_ip(l3: packet::L3, orig_ip: Option<[u8; 16]>) -> Ip {
    let mut source = l3.src;
    // Trace v1 may carry the source address from before datapath
    // translation; prefer it when set. IPv4 occupies the first four
    // bytes.
    if let Some(orig) = orig_ip {
        match l3.src {
            IpAddr::V4(_) => {
                let v4 = Ipv4Addr::new(orig[0], orig[1], orig[2], orig[3]);
                if !v4.is_unspecified() {
                    source = v4.into();
                }
            }
            IpAddr::V6(_) => {
                let v6 = Ipv6Addr::from(orig);
                if !v6.is_unspecified() {
                    source = v6.into();
                }
            }
        }
    }
    let version = match source {
        IpAddr::V4(_) => IpVersion::Ipv4,
        IpAddr::V6(_) => IpVersion::Ipv6,
    };
    let mut ip = Ip {
        source: source.to_string(),
        destination: l3.dst.to_string(),
        ..Default::default()
    };
    ip.set_ip_version(version);
    ip
}

fn assemble_l4(l4: packet::L4) -> Layer4 {
    let protocol = match l4 {
        packet::L4::Tcp {
            source_port,
            destination_port,
            flags,
        } => layer4::Protocol::Tcp(Tcp {
            source_port: source_port as u32,
            destination_port: destination_port as u32,
            flags: Some(TcpFlags {
                fin: flags.fin,
                syn: flags.syn,
                rst: flags.rst,
                psh: flags.psh,
                ack: flags.ack,
                urg: flags.urg,
                ece: flags.ece,
                cwr: flags.cwr,
                ns: flags.ns,
            }),
        }),
        packet::L4::Udp {
            source_port,
            destination_port,
        } => layer4::Protocol::Udp(Udp {
            source_port: source_port as u32,
            destination_port: destination_port as u32,
        }),
        packet::L4::IcmpV4 { icmp_type, code } => layer4::Protocol::Icmpv4(Icmpv4 {
            r#type: icmp_type as u32,
            code: code as u32,
        }),
        packet::L4::IcmpV6 { icmp_type, code } => layer4::Protocol::Icmpv6(Icmpv6 {
            r#type: icmp_type as u32,
            code: code as u32,
        }),
    };
    Layer4 {
        protocol: Some(protocol),
    }
}

/// The datapath attaches every covering CIDR label to an identity; only
/// the most specific one says anything. Keeps non-CIDR labels in their
/// original order.
pub fn filter_cidr_labels(labels: Vec<String>) -> Vec<String> {
    let mut best: Option<(u8, &str)> = None;
    for label in &labels {
        if let Some(prefix) = label.strip_prefix("cidr:")
            && let Some((_, len)) = prefix.rsplit_once('/')
            && let Ok(len) = len.parse::<u8>()
            && best.is_none_or(|(max, _)| len > max)
        {
            best = Some((len, label.as_str()));
        }
    }
    let keep = best.map(|(_, label)| label.to_string());
    labels
        .iter()
        .filter(|label| !label.starts_with("cidr:") || keep.as_deref() == Some(label.as_str()))
        .cloned()
        .collect()
}
