use std::net::IpAddr;
use std::sync::RwLock;
use std::time::SystemTime;

use nodeflow_api::agent::v1::AgentEndpoint;

use crate::Result;

/// A local workload as known to the datapath agent.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Endpoint {
    pub id: u64,
    pub ipv4: Option<IpAddr>,
    pub ipv6: Option<IpAddr>,
    pub container_ids: Vec<String>,
    pub pod_name: String,
    pub pod_namespace: String,
    pub labels: Vec<String>,
    pub created: Option<SystemTime>,
    pub deleted: Option<SystemTime>,
}

impl Endpoint {
    /// Two endpoints are the same workload when their ids match and
    /// their pod coordinates agree: either neither side carries any, or
    /// namespace and pod name are equal.
    pub fn equals_by_id(&self, other: &Endpoint) -> bool {
        if self.id != other.id {
            return false;
        }
        let self_unset = self.pod_name.is_empty() && self.pod_namespace.is_empty();
        let other_unset = other.pod_name.is_empty() && other.pod_namespace.is_empty();
        (self_unset && other_unset)
            || (self.pod_name == other.pod_name && self.pod_namespace == other.pod_namespace)
    }

    /// Overwrites every non-time field that is set on `other`. The
    /// created and deleted stamps belong to the table, never the
    /// caller.
    fn set_from(&mut self, other: &Endpoint) {
        if !other.container_ids.is_empty() {
            self.container_ids = other.container_ids.clone();
        }
        if other.id != 0 {
            self.id = other.id;
        }
        if other.ipv4.is_some() {
            self.ipv4 = other.ipv4;
        }
        if other.ipv6.is_some() {
            self.ipv6 = other.ipv6;
        }
        if !other.pod_name.is_empty() {
            self.pod_name = other.pod_name.clone();
        }
        if !other.pod_namespace.is_empty() {
            self.pod_namespace = other.pod_namespace.clone();
        }
        if !other.labels.is_empty() {
            self.labels = other.labels.clone();
        }
    }

    pub fn has_ip(&self, ip: IpAddr) -> bool {
        self.ipv4 == Some(ip) || self.ipv6 == Some(ip)
    }
}

impl TryFrom<AgentEndpoint> for Endpoint {
    type Error = crate::Error;

    fn try_from(ep: AgentEndpoint) -> Result<Self> {
        let ipv4 = match ep.ipv4.is_empty() {
            true => None,
            false => Some(ep.ipv4.parse()?),
        };
        let ipv6 = match ep.ipv6.is_empty() {
            true => None,
            false => Some(ep.ipv6.parse()?),
        };
        Ok(Endpoint {
            id: ep.id,
            ipv4,
            ipv6,
            container_ids: ep.container_ids,
            pod_name: ep.pod_name,
            pod_namespace: ep.namespace,
            labels: ep.labels,
            created: None,
            deleted: None,
        })
    }
}

/// The table of endpoints seen on this node. Deleted endpoints stay as
/// tombstones until an external policy removes them; lookups skip
/// tombstones. Insertion order is preserved.
#[derive(Default)]
pub struct Endpoints {
    eps: RwLock<Vec<Endpoint>>,
}

impl Endpoints {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reconciles the authoritative endpoint list from the agent: live
    /// entries missing from `new_eps` are tombstoned, then everything
    /// in `new_eps` is upserted. An empty list is ignored so a
    /// transient empty agent response cannot wipe the table.
    pub fn sync(&self, new_eps: Vec<Endpoint>) {
        if new_eps.is_empty() {
            return;
        }
        let mut eps = self.eps.write().unwrap();
        let now = SystemTime::now();
        for ep in eps.iter_mut() {
            if ep.deleted.is_some() {
                continue;
            }
            if !new_eps.iter().any(|new_ep| ep.equals_by_id(new_ep)) {
                ep.deleted = Some(now);
            }
        }
        for new_ep in new_eps {
            update_locked(&mut eps, new_ep);
        }
    }

    /// Updates the live entry matching `ep`, or appends `ep` as a new
    /// live entry.
    pub fn update(&self, ep: Endpoint) {
        let mut eps = self.eps.write().unwrap();
        update_locked(&mut eps, ep);
    }

    /// Tombstones the live entry matching `del`. An unknown endpoint is
    /// appended as an already-deleted entry so a late create event
    /// cannot resurrect it.
    pub fn mark_deleted(&self, mut del: Endpoint) {
        let mut eps = self.eps.write().unwrap();
        let deleted = del.deleted.unwrap_or_else(SystemTime::now);
        for ep in eps.iter_mut() {
            if ep.deleted.is_some() {
                continue;
            }
            if ep.equals_by_id(&del) {
                ep.deleted = Some(deleted);
                return;
            }
        }
        del.deleted = Some(deleted);
        eps.push(del);
    }

    /// Returns all live entries matching the id (when non-zero), the
    /// namespace and pod name (when a pod is given), or the namespace
    /// alone (when no pod is given). Insertion order is preserved.
    pub fn find(&self, id: u64, namespace: &str, pod_name: &str) -> Vec<Endpoint> {
        let eps = self.eps.read().unwrap();
        eps.iter()
            .filter(|ep| ep.deleted.is_none())
            .filter(|ep| {
                (id != 0 && ep.id == id)
                    || (!pod_name.is_empty()
                        && ep.pod_name == pod_name
                        && ep.pod_namespace == namespace)
                    || (pod_name.is_empty() && ep.pod_namespace == namespace)
            })
            .cloned()
            .collect()
    }

    /// Returns the first live entry carrying `ip`.
    pub fn get_by_ip(&self, ip: IpAddr) -> Option<Endpoint> {
        let eps = self.eps.read().unwrap();
        eps.iter()
            .find(|ep| ep.deleted.is_none() && ep.has_ip(ip))
            .cloned()
    }
}

fn update_locked(eps: &mut Vec<Endpoint>, mut update: Endpoint) {
    for ep in eps.iter_mut() {
        if ep.deleted.is_some() {
            continue;
        }
        if ep.equals_by_id(&update) {
            ep.set_from(&update);
            return;
        }
    }
    update.created = Some(SystemTime::now());
    update.deleted = None;
    eps.push(update);
}
