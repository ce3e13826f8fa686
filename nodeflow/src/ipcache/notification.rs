//! The agent's JSON encoding of IP cache notifications. One canonical
//! codec lives here; field names must round-trip with the agent, do
//! not rename them.

use std::net::IpAddr;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::Result;
use crate::ipcache::Entry;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct IpCacheNotification {
    pub cidr: String,

    /// The current identity of the prefix.
    pub id: u64,

    /// On upserts, the identity the agent believes it is replacing.
    #[serde(rename = "old-id", default, skip_serializing_if = "Option::is_none")]
    pub old_id: Option<u64>,

    #[serde(rename = "host-ip", default, skip_serializing_if = "Option::is_none")]
    pub host_ip: Option<IpAddr>,

    #[serde(
        rename = "old-host-ip",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub old_host_ip: Option<IpAddr>,

    #[serde(rename = "encrypt-key", default, skip_serializing_if = "is_zero")]
    pub encrypt_key: u8,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,

    #[serde(rename = "pod-name", default, skip_serializing_if = "String::is_empty")]
    pub pod_name: String,
}

fn is_zero(key: &u8) -> bool {
    *key == 0
}

impl IpCacheNotification {
    pub fn decode(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn cidr(&self) -> Result<IpNet> {
        Ok(self.cidr.parse()?)
    }

    pub fn entry(&self) -> Entry {
        Entry {
            identity: self.id,
            host_ip: self.host_ip,
            encrypt_key: self.encrypt_key,
            namespace: (!self.namespace.is_empty()).then(|| self.namespace.clone()),
            pod_name: (!self.pod_name.is_empty()).then(|| self.pod_name.clone()),
        }
    }
}
