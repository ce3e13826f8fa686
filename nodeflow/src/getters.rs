//! Trait seams between the decoder and its enrichment collaborators.
//! Everything here is consulted on the decode hot path, so lookups are
//! synchronous against locally cached state.

use std::net::IpAddr;
use std::sync::Arc;

use crate::Result;
use crate::endpoint::{Endpoint, Endpoints};
use crate::identity::Identity;

pub trait EndpointGetter: Send + Sync {
    /// Returns the local endpoint carrying `ip`.
    fn get_endpoint(&self, ip: IpAddr) -> Option<Endpoint>;
}

pub trait IdentityGetter: Send + Sync {
    /// Resolves a numeric security identity to its labels.
    fn get_identity(&self, id: u64) -> Result<Identity>;
}

pub trait DnsGetter: Send + Sync {
    /// Returns the DNS names under which the endpoint `endpoint_id`
    /// knows `ip`. Empty when nothing was resolved.
    fn get_names_of(&self, endpoint_id: u64, ip: IpAddr) -> Vec<String>;
}

pub trait PodGetter: Send + Sync {
    /// Returns (namespace, pod name) for `ip`.
    fn get_pod_name_of(&self, ip: IpAddr) -> Option<(String, String)>;
}

pub trait IpIdentityGetter: Send + Sync {
    /// Returns the security identity covering `ip`, most specific
    /// prefix first.
    fn get_identity_of(&self, ip: IpAddr) -> Option<u64>;
}

impl EndpointGetter for Endpoints {
    fn get_endpoint(&self, ip: IpAddr) -> Option<Endpoint> {
        self.get_by_ip(ip)
    }
}

impl PodGetter for Endpoints {
    fn get_pod_name_of(&self, ip: IpAddr) -> Option<(String, String)> {
        let ep = self.get_by_ip(ip)?;
        if ep.pod_name.is_empty() {
            return None;
        }
        Some((ep.pod_namespace, ep.pod_name))
    }
}

/// The DNS cache lives in the agent; a deployment without access to it
/// runs with name resolution disabled.
pub struct NoopDnsGetter;

impl DnsGetter for NoopDnsGetter {
    fn get_names_of(&self, _endpoint_id: u64, _ip: IpAddr) -> Vec<String> {
        Vec::new()
    }
}

/// Answers pod lookups from an ordered list of sources, first hit wins.
/// The daemon wires the agent IP cache ahead of the endpoint table.
pub struct PodResolver {
    sources: Vec<Arc<dyn PodGetter>>,
}

impl PodResolver {
    pub fn new(sources: Vec<Arc<dyn PodGetter>>) -> Self {
        Self { sources }
    }
}

impl PodGetter for PodResolver {
    fn get_pod_name_of(&self, ip: IpAddr) -> Option<(String, String)> {
        self.sources
            .iter()
            .find_map(|source| source.get_pod_name_of(ip))
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;

    /// Closure-backed fakes for the collaborator traits.
    pub(crate) struct FakeEndpointGetter<F>(pub F);

    impl<F> EndpointGetter for FakeEndpointGetter<F>
    where
        F: Fn(IpAddr) -> Option<Endpoint> + Send + Sync,
    {
        fn get_endpoint(&self, ip: IpAddr) -> Option<Endpoint> {
            (self.0)(ip)
        }
    }

    pub(crate) struct FakeIdentityGetter<F>(pub F);

    impl<F> IdentityGetter for FakeIdentityGetter<F>
    where
        F: Fn(u64) -> Result<Identity> + Send + Sync,
    {
        fn get_identity(&self, id: u64) -> Result<Identity> {
            (self.0)(id)
        }
    }

    pub(crate) struct FakeDnsGetter<F>(pub F);

    impl<F> DnsGetter for FakeDnsGetter<F>
    where
        F: Fn(u64, IpAddr) -> Vec<String> + Send + Sync,
    {
        fn get_names_of(&self, endpoint_id: u64, ip: IpAddr) -> Vec<String> {
            (self.0)(endpoint_id, ip)
        }
    }

    pub(crate) struct FakePodGetter<F>(pub F);

    impl<F> PodGetter for FakePodGetter<F>
    where
        F: Fn(IpAddr) -> Option<(String, String)> + Send + Sync,
    {
        fn get_pod_name_of(&self, ip: IpAddr) -> Option<(String, String)> {
            (self.0)(ip)
        }
    }

    fn fixed_pod(ns: &str, pod: &str) -> Arc<dyn PodGetter> {
        let ns = ns.to_string();
        let pod = pod.to_string();
        Arc::new(FakePodGetter(move |_| Some((ns.clone(), pod.clone()))))
    }

    fn no_pod() -> Arc<dyn PodGetter> {
        Arc::new(FakePodGetter(|_| None))
    }

    #[test]
    fn test_pod_resolver_prefers_first_source() {
        let ip: IpAddr = "1.1.1.15".parse().unwrap();

        // available in the first source only
        let resolver = PodResolver::new(vec![fixed_pod("default", "xwing"), no_pod()]);
        assert_eq!(
            resolver.get_pod_name_of(ip),
            Some(("default".into(), "xwing".into()))
        );

        // available in the second source only
        let resolver = PodResolver::new(vec![no_pod(), fixed_pod("default", "deathstar")]);
        assert_eq!(
            resolver.get_pod_name_of(ip),
            Some(("default".into(), "deathstar".into()))
        );

        // available in both: first wins
        let resolver = PodResolver::new(vec![
            fixed_pod("default", "xwing"),
            fixed_pod("default", "deathstar"),
        ]);
        assert_eq!(
            resolver.get_pod_name_of(ip),
            Some(("default".into(), "xwing".into()))
        );

        // available in none
        let resolver = PodResolver::new(vec![no_pod(), no_pod()]);
        assert_eq!(resolver.get_pod_name_of(ip), None);
    }

    #[test]
    fn test_endpoints_as_pod_getter() {
        let eps = Endpoints::new();
        let ip: IpAddr = "1.1.1.15".parse().unwrap();
        eps.update(Endpoint {
            id: 16,
            ipv4: Some(ip),
            pod_name: "deathstar".into(),
            pod_namespace: "default".into(),
            ..Default::default()
        });

        assert_eq!(
            eps.get_pod_name_of(ip),
            Some(("default".into(), "deathstar".into()))
        );
        assert_eq!(eps.get_pod_name_of("9.9.9.9".parse().unwrap()), None);
    }
}
