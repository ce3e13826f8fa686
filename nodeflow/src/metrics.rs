use nodeflow_api::observer::v1::{Flow, Verdict, layer4};
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;

use crate::{Error, Result, monitor};

/// Flow metric handlers that can be enabled with `--metric`.
pub const KNOWN_HANDLERS: &[&str] = &["flow", "drop", "tcp", "icmp"];

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct EventLabels {
    pub kind: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct FlowLabels {
    pub event_type: String,
    pub verdict: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct DropLabels {
    pub reason: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct TcpLabels {
    pub flag: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct IcmpLabels {
    pub family: String,
    pub icmp_type: String,
}

#[derive(Debug)]
pub struct Metrics {
    pub registry: Registry,
    events_processed: Family<EventLabels, Counter>,
    decode_errors: Counter,
    flows: Option<Family<FlowLabels, Counter>>,
    drops: Option<Family<DropLabels, Counter>>,
    tcp_flags: Option<Family<TcpLabels, Counter>>,
    icmp: Option<Family<IcmpLabels, Counter>>,
}

impl Metrics {
    /// Builds the registry with the always-on decoder counters plus the
    /// flow handlers named in `enabled`. Unknown handler names are a
    /// configuration error.
    pub fn new(enabled: &[String]) -> Result<Self> {
        if let Some(unknown) = enabled
            .iter()
            .find(|name| !KNOWN_HANDLERS.contains(&name.as_str()))
        {
            return Err(Error::UnknownMetric(unknown.clone()));
        }
        let on = |name: &str| enabled.iter().any(|e| e == name);

        let mut registry = Registry::with_prefix("nodeflow");

        let events_processed = Family::<EventLabels, Counter>::default();
        registry.register(
            "events_processed",
            "Monitor events received from the agent",
            events_processed.clone(),
        );

        let decode_errors = Counter::default();
        registry.register(
            "decode_errors",
            "Monitor events that failed to decode",
            decode_errors.clone(),
        );

        let flows = on("flow").then(|| {
            let family = Family::<FlowLabels, Counter>::default();
            registry.register("flows_processed", "Flows decoded from the datapath", family.clone());
            family
        });
        let drops = on("drop").then(|| {
            let family = Family::<DropLabels, Counter>::default();
            registry.register("drops", "Dropped flows by reason", family.clone());
            family
        });
        let tcp_flags = on("tcp").then(|| {
            let family = Family::<TcpLabels, Counter>::default();
            registry.register("tcp_flags", "TCP flags seen on flows", family.clone());
            family
        });
        let icmp = on("icmp").then(|| {
            let family = Family::<IcmpLabels, Counter>::default();
            registry.register("icmp", "ICMP flows by family and type", family.clone());
            family
        });

        Ok(Self {
            registry,
            events_processed,
            decode_errors,
            flows,
            drops,
            tcp_flags,
            icmp,
        })
    }

    pub fn inc_event(&self, message_type: u8) {
        self.events_processed
            .get_or_create(&EventLabels {
                kind: monitor::kind_str(message_type).to_string(),
            })
            .inc();
    }

    pub fn inc_decode_error(&self) {
        self.decode_errors.inc();
    }

    /// Feeds one decoded flow through the enabled handlers.
    pub fn observe_flow(&self, flow: &Flow) {
        if let Some(flows) = &self.flows {
            let event_type = flow
                .event_type
                .as_ref()
                .map(|t| monitor::kind_str(t.r#type as u8))
                .unwrap_or("unknown");
            let verdict = match flow.verdict() {
                Verdict::Forwarded => "forwarded",
                Verdict::Dropped => "dropped",
                Verdict::Error => "error",
                Verdict::Unknown => "unknown",
            };
            flows
                .get_or_create(&FlowLabels {
                    event_type: event_type.to_string(),
                    verdict: verdict.to_string(),
                })
                .inc();
        }

        if let Some(drops) = &self.drops
            && flow.verdict() == Verdict::Dropped
        {
            drops
                .get_or_create(&DropLabels {
                    reason: flow.drop_reason.to_string(),
                })
                .inc();
        }

        let protocol = flow.l4.as_ref().and_then(|l4| l4.protocol.as_ref());

        if let Some(tcp_flags) = &self.tcp_flags
            && let Some(layer4::Protocol::Tcp(tcp)) = protocol
            && let Some(flags) = &tcp.flags
        {
            let set = [
                ("fin", flags.fin),
                ("syn", flags.syn),
                ("rst", flags.rst),
                ("psh", flags.psh),
                ("ack", flags.ack),
                ("urg", flags.urg),
                ("ece", flags.ece),
                ("cwr", flags.cwr),
                ("ns", flags.ns),
            ];
            for (flag, on) in set {
                if on {
                    tcp_flags
                        .get_or_create(&TcpLabels {
                            flag: flag.to_string(),
                        })
                        .inc();
                }
            }
        }

        if let Some(icmp) = &self.icmp {
            let observed = match protocol {
                Some(layer4::Protocol::Icmpv4(v4)) => Some(("v4", v4.r#type)),
                Some(layer4::Protocol::Icmpv6(v6)) => Some(("v6", v6.r#type)),
                _ => None,
            };
            if let Some((family, icmp_type)) = observed {
                icmp.get_or_create(&IcmpLabels {
                    family: family.to_string(),
                    icmp_type: icmp_type.to_string(),
                })
                .inc();
            }
        }
    }
}
