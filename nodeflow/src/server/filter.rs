//! Flow filter evaluation for GetFlows: any whitelist filter may match
//! (disjunction), every non-empty condition inside one filter must
//! match (conjunction), and any value inside one repeated condition may
//! match. Blacklist hits always win.

use nodeflow_api::observer::v1::{Flow, FlowFilter, layer4, layer7};

use crate::{Error, Result};

#[derive(Debug)]
pub struct CompiledFilters {
    whitelist: Vec<CompiledFilter>,
    blacklist: Vec<CompiledFilter>,
}

#[derive(Debug)]
struct CompiledFilter {
    filter: FlowFilter,
    source_ports: Vec<u32>,
    destination_ports: Vec<u32>,
}

impl CompiledFilters {
    /// Validates and compiles the request filters. Ports are decimal
    /// strings on the wire; junk fails the whole call instead of
    /// silently matching nothing.
    pub fn compile(whitelist: &[FlowFilter], blacklist: &[FlowFilter]) -> Result<Self> {
        Ok(Self {
            whitelist: whitelist
                .iter()
                .map(CompiledFilter::compile)
                .collect::<Result<_>>()?,
            blacklist: blacklist
                .iter()
                .map(CompiledFilter::compile)
                .collect::<Result<_>>()?,
        })
    }

    pub fn matches(&self, flow: &Flow) -> bool {
        (self.whitelist.is_empty() || self.whitelist.iter().any(|f| f.matches(flow)))
            && !self.blacklist.iter().any(|f| f.matches(flow))
    }
}

impl CompiledFilter {
    fn compile(filter: &FlowFilter) -> Result<Self> {
        Ok(Self {
            source_ports: parse_ports(&filter.source_port)?,
            destination_ports: parse_ports(&filter.destination_port)?,
            filter: filter.clone(),
        })
    }

    fn matches(&self, flow: &Flow) -> bool {
        let f = &self.filter;
        let source = flow.source.clone().unwrap_or_default();
        let destination = flow.destination.clone().unwrap_or_default();

        if !match_any(&f.source_pod, &source.pod_name) {
            return false;
        }
        if !match_any(&f.source_namespace, &source.namespace) {
            return false;
        }
        if !match_any_label(&f.source_label, &source.labels) {
            return false;
        }
        if !match_any(&f.destination_pod, &destination.pod_name) {
            return false;
        }
        if !match_any(&f.destination_namespace, &destination.namespace) {
            return false;
        }
        if !match_any_label(&f.destination_label, &destination.labels) {
            return false;
        }
        if !f.verdict.is_empty() && !f.verdict.contains(&flow.verdict) {
            return false;
        }
        if !f.protocol.is_empty() {
            let protocol = l4_protocol(flow);
            if !f.protocol.iter().any(|p| p == protocol) {
                return false;
            }
        }
        let (source_port, destination_port) = l4_ports(flow);
        if !self.source_ports.is_empty() && !matches_port(&self.source_ports, source_port) {
            return false;
        }
        if !self.destination_ports.is_empty()
            && !matches_port(&self.destination_ports, destination_port)
        {
            return false;
        }
        if let Some(reply) = f.reply
            && flow.reply != reply
        {
            return false;
        }

        let http = match flow.l7.as_ref().and_then(|l7| l7.record.as_ref()) {
            Some(layer7::Record::Http(http)) => Some(http),
            None => None,
        };
        if !f.http_method.is_empty()
            && !http.is_some_and(|h| f.http_method.iter().any(|m| *m == h.method))
        {
            return false;
        }
        if !f.http_url.is_empty()
            && !http.is_some_and(|h| f.http_url.iter().any(|u| h.url.starts_with(u)))
        {
            return false;
        }
        if !f.http_status_code.is_empty()
            && !http.is_some_and(|h| f.http_status_code.contains(&h.code))
        {
            return false;
        }
        true
    }
}

fn parse_ports(ports: &[String]) -> Result<Vec<u32>> {
    ports
        .iter()
        .map(|port| {
            port.parse::<u16>()
                .map(u32::from)
                .map_err(|_| Error::InvalidFilter(format!("invalid port: {port:?}")))
        })
        .collect()
}

fn match_any(values: &[String], actual: &str) -> bool {
    values.is_empty() || values.iter().any(|v| v == actual)
}

fn match_any_label(values: &[String], labels: &[String]) -> bool {
    values.is_empty() || values.iter().any(|v| labels.iter().any(|l| l == v))
}

fn matches_port(wanted: &[u32], actual: Option<u32>) -> bool {
    actual.is_some_and(|port| wanted.contains(&port))
}

fn l4_protocol(flow: &Flow) -> &'static str {
    match flow.l4.as_ref().and_then(|l4| l4.protocol.as_ref()) {
        Some(layer4::Protocol::Tcp(_)) => "tcp",
        Some(layer4::Protocol::Udp(_)) => "udp",
        Some(layer4::Protocol::Icmpv4(_)) => "icmpv4",
        Some(layer4::Protocol::Icmpv6(_)) => "icmpv6",
        None => "",
    }
}

fn l4_ports(flow: &Flow) -> (Option<u32>, Option<u32>) {
    match flow.l4.as_ref().and_then(|l4| l4.protocol.as_ref()) {
        Some(layer4::Protocol::Tcp(tcp)) => (Some(tcp.source_port), Some(tcp.destination_port)),
        Some(layer4::Protocol::Udp(udp)) => (Some(udp.source_port), Some(udp.destination_port)),
        _ => (None, None),
    }
}

#[cfg(test)]
mod test {
    use nodeflow_api::observer::v1::{Endpoint, Http, Layer4, Layer7, Tcp, Verdict};

    use super::*;

    fn flow(namespace: &str, pod: &str, verdict: Verdict, dport: u32) -> Flow {
        let mut flow = Flow {
            source: Some(Endpoint {
                namespace: namespace.into(),
                pod_name: pod.into(),
                labels: vec!["app=web".into()],
                ..Default::default()
            }),
            destination: Some(Endpoint {
                namespace: "default".into(),
                pod_name: "server".into(),
                ..Default::default()
            }),
            l4: Some(Layer4 {
                protocol: Some(layer4::Protocol::Tcp(Tcp {
                    source_port: 40000,
                    destination_port: dport,
                    flags: None,
                })),
            }),
            ..Default::default()
        };
        flow.set_verdict(verdict);
        flow
    }

    #[test]
    fn test_empty_whitelist_matches_everything() -> crate::Result<()> {
        let filters = CompiledFilters::compile(&[], &[])?;
        assert!(filters.matches(&flow("default", "xwing", Verdict::Forwarded, 80)));
        Ok(())
    }

    #[test]
    fn test_conjunction_within_a_filter() -> crate::Result<()> {
        let filter = FlowFilter {
            source_namespace: vec!["default".into()],
            verdict: vec![Verdict::Dropped as i32],
            ..Default::default()
        };
        let filters = CompiledFilters::compile(&[filter], &[])?;

        assert!(filters.matches(&flow("default", "xwing", Verdict::Dropped, 80)));
        // namespace matches but verdict does not
        assert!(!filters.matches(&flow("default", "xwing", Verdict::Forwarded, 80)));
        // verdict matches but namespace does not
        assert!(!filters.matches(&flow("other", "xwing", Verdict::Dropped, 80)));
        Ok(())
    }

    #[test]
    fn test_disjunction_across_filters() -> crate::Result<()> {
        let by_pod = FlowFilter {
            source_pod: vec!["xwing".into()],
            ..Default::default()
        };
        let by_port = FlowFilter {
            destination_port: vec!["443".into()],
            ..Default::default()
        };
        let filters = CompiledFilters::compile(&[by_pod, by_port], &[])?;

        assert!(filters.matches(&flow("default", "xwing", Verdict::Forwarded, 80)));
        assert!(filters.matches(&flow("default", "tie", Verdict::Forwarded, 443)));
        assert!(!filters.matches(&flow("default", "tie", Verdict::Forwarded, 80)));
        Ok(())
    }

    #[test]
    fn test_blacklist_overrides_whitelist() -> crate::Result<()> {
        let all_default = FlowFilter {
            source_namespace: vec!["default".into()],
            ..Default::default()
        };
        let deny_xwing = FlowFilter {
            source_pod: vec!["xwing".into()],
            ..Default::default()
        };
        let filters = CompiledFilters::compile(&[all_default], &[deny_xwing])?;

        assert!(filters.matches(&flow("default", "tie", Verdict::Forwarded, 80)));
        assert!(!filters.matches(&flow("default", "xwing", Verdict::Forwarded, 80)));
        Ok(())
    }

    #[test]
    fn test_label_and_protocol_match() -> crate::Result<()> {
        let filter = FlowFilter {
            source_label: vec!["app=web".into()],
            protocol: vec!["tcp".into()],
            ..Default::default()
        };
        let filters = CompiledFilters::compile(&[filter], &[])?;
        assert!(filters.matches(&flow("default", "xwing", Verdict::Forwarded, 80)));

        let filter = FlowFilter {
            protocol: vec!["udp".into()],
            ..Default::default()
        };
        let filters = CompiledFilters::compile(&[filter], &[])?;
        assert!(!filters.matches(&flow("default", "xwing", Verdict::Forwarded, 80)));
        Ok(())
    }

    #[test]
    fn test_reply_filter() -> crate::Result<()> {
        let filter = FlowFilter {
            reply: Some(true),
            ..Default::default()
        };
        let filters = CompiledFilters::compile(&[filter], &[])?;

        let mut replied = flow("default", "xwing", Verdict::Forwarded, 80);
        replied.reply = true;
        assert!(filters.matches(&replied));
        assert!(!filters.matches(&flow("default", "xwing", Verdict::Forwarded, 80)));
        Ok(())
    }

    #[test]
    fn test_http_filter() -> crate::Result<()> {
        let filter = FlowFilter {
            http_method: vec!["GET".into()],
            http_status_code: vec![200],
            ..Default::default()
        };
        let filters = CompiledFilters::compile(&[filter], &[])?;

        let mut with_http = flow("default", "xwing", Verdict::Forwarded, 80);
        with_http.l7 = Some(Layer7 {
            record: Some(layer7::Record::Http(Http {
                code: 200,
                method: "GET".into(),
                url: "/v1/health".into(),
                protocol: "HTTP/1.1".into(),
            })),
        });
        assert!(filters.matches(&with_http));
        // no l7 record at all
        assert!(!filters.matches(&flow("default", "xwing", Verdict::Forwarded, 80)));
        Ok(())
    }

    #[test]
    fn test_invalid_port_is_rejected() {
        let filter = FlowFilter {
            destination_port: vec!["not-a-port".into()],
            ..Default::default()
        };
        let err = CompiledFilters::compile(&[filter], &[]).unwrap_err();
        assert!(matches!(err, Error::InvalidFilter(_)));
    }
}
