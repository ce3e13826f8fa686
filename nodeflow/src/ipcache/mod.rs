//! Node-local mirror of the agent's IP cache: prefix → identity plus
//! optional pod metadata. Seeded once from a full dump at bootstrap,
//! then kept current by the notification sync loop.

pub mod notification;

use std::net::IpAddr;
use std::sync::{Arc, RwLock};

use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use nodeflow_api::agent::v1::{AgentNotify, AgentNotifyType, IpCacheEntry};
use prefix_trie::PrefixMap;
use tokio::sync::mpsc::Receiver;
use tracing::{debug, warn};

pub use notification::IpCacheNotification;

use crate::getters::{IpIdentityGetter, PodGetter};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Entry {
    pub identity: u64,
    pub host_ip: Option<IpAddr>,
    pub encrypt_key: u8,
    pub namespace: Option<String>,
    pub pod_name: Option<String>,
}

struct Shared {
    v4: PrefixMap<Ipv4Net, Entry>,
    v6: PrefixMap<Ipv6Net, Entry>,
}

pub struct IpCache {
    shared: RwLock<Shared>,
}

impl Default for IpCache {
    fn default() -> Self {
        Self {
            shared: RwLock::new(Shared {
                v4: PrefixMap::new(),
                v6: PrefixMap::new(),
            }),
        }
    }
}

impl IpCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `entry` for `cidr`. When `old_identity` names an identity
    /// that no longer matches what is stored, the notification is stale
    /// and dropped. Returns whether the entry was applied.
    pub fn upsert(&self, cidr: IpNet, entry: Entry, old_identity: Option<u64>) -> bool {
        let mut shared = self.shared.write().unwrap();
        let stored = match cidr {
            IpNet::V4(net) => shared.v4.get(&net).map(|e| e.identity),
            IpNet::V6(net) => shared.v6.get(&net).map(|e| e.identity),
        };
        if let (Some(old), Some(current)) = (old_identity, stored)
            && old != current
        {
            return false;
        }
        match cidr {
            IpNet::V4(net) => {
                shared.v4.insert(net, entry);
            }
            IpNet::V6(net) => {
                shared.v6.insert(net, entry);
            }
        }
        true
    }

    /// Removes the entry for `cidr` unconditionally.
    pub fn delete(&self, cidr: IpNet) -> bool {
        let mut shared = self.shared.write().unwrap();
        match cidr {
            IpNet::V4(net) => shared.v4.remove(&net).is_some(),
            IpNet::V6(net) => shared.v6.remove(&net).is_some(),
        }
    }

    /// Seeds the cache from the agent's full dump. Entries with an
    /// unparseable prefix are skipped; the agent owns its own garbage.
    pub fn seed(&self, entries: Vec<IpCacheEntry>) {
        for entry in entries {
            let cidr: IpNet = match entry.cidr.parse() {
                Ok(cidr) => cidr,
                Err(e) => {
                    warn!(cidr = %entry.cidr, %e, "skipping ip cache entry with bad cidr");
                    continue;
                }
            };
            let metadata = entry.metadata.unwrap_or_default();
            self.upsert(
                cidr,
                Entry {
                    identity: entry.identity,
                    host_ip: None,
                    encrypt_key: 0,
                    namespace: (!metadata.namespace.is_empty()).then(|| metadata.namespace.clone()),
                    pod_name: (!metadata.pod_name.is_empty()).then(|| metadata.pod_name.clone()),
                },
                None,
            );
        }
    }

    fn lookup<R>(&self, ip: IpAddr, f: impl FnOnce(&Entry) -> R) -> Option<R> {
        let shared = self.shared.read().unwrap();
        match ip {
            IpAddr::V4(v4) => shared.v4.get_lpm(&Ipv4Net::from(v4)).map(|(_, e)| f(e)),
            IpAddr::V6(v6) => shared.v6.get_lpm(&Ipv6Net::from(v6)).map(|(_, e)| f(e)),
        }
    }

    pub fn len(&self) -> usize {
        let shared = self.shared.read().unwrap();
        shared.v4.iter().count() + shared.v6.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl IpIdentityGetter for IpCache {
    fn get_identity_of(&self, ip: IpAddr) -> Option<u64> {
        self.lookup(ip, |entry| entry.identity)
    }
}

impl PodGetter for IpCache {
    fn get_pod_name_of(&self, ip: IpAddr) -> Option<(String, String)> {
        self.lookup(ip, |entry| {
            match (entry.namespace.as_ref(), entry.pod_name.as_ref()) {
                (Some(ns), Some(pod)) => Some((ns.clone(), pod.clone())),
                _ => None,
            }
        })
        .flatten()
    }
}

/// Applies agent IP cache notifications until the channel closes.
/// Notifications that arrive while the bootstrap dump is in flight sit
/// in the channel buffer and are applied here afterwards.
pub async fn sync(cache: Arc<IpCache>, mut events: Receiver<AgentNotify>) {
    while let Some(notify) = events.recv().await {
        let decoded = IpCacheNotification::decode(&notify.text);
        match (notify.r#type(), decoded) {
            (AgentNotifyType::AgentNotifyIpcacheUpserted, Ok(n)) => match n.cidr() {
                Ok(cidr) => {
                    if !cache.upsert(cidr, n.entry(), n.old_id) {
                        debug!(cidr = %n.cidr, "dropped stale ip cache upsert");
                    }
                }
                Err(e) => warn!(cidr = %n.cidr, %e, "ignoring upsert with bad cidr"),
            },
            (AgentNotifyType::AgentNotifyIpcacheDeleted, Ok(n)) => match n.cidr() {
                Ok(cidr) => {
                    cache.delete(cidr);
                }
                Err(e) => warn!(cidr = %n.cidr, %e, "ignoring delete with bad cidr"),
            },
            (other, Err(e)) => {
                warn!(kind = ?other, %e, "failed to decode agent notification")
            }
            (other, Ok(_)) => debug!(kind = ?other, "ignoring agent notification"),
        }
    }
}
