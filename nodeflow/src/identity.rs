use std::sync::RwLock;

use ahash::HashMap;

use crate::getters::IdentityGetter;
use crate::{Error, Result};

/// Topmost bit of the 32-bit datapath identity. Set on identities the
/// agent allocated node-locally, typically for CIDRs.
pub const LOCAL_IDENTITY_FLAG: u32 = 1 << 31;

/// A security identity and the labels it stands for.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Identity {
    pub id: u64,
    pub labels: Vec<String>,
}

impl From<nodeflow_api::agent::v1::Identity> for Identity {
    fn from(identity: nodeflow_api::agent::v1::Identity) -> Self {
        Self {
            id: identity.id,
            labels: identity.labels,
        }
    }
}

/// The identity field of a monitor header with the local flag made
/// explicit. `id` keeps the raw wire value, flag included, since that
/// is what identity lookups and flows carry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SecurityIdentity {
    pub id: u64,
    pub is_local: bool,
}

impl From<u32> for SecurityIdentity {
    fn from(raw: u32) -> Self {
        Self {
            id: raw as u64,
            is_local: raw & LOCAL_IDENTITY_FLAG != 0,
        }
    }
}

/// Identity labels seeded from the agent at bootstrap and read on the
/// decode hot path.
#[derive(Default)]
pub struct IdentityCache {
    identities: RwLock<HashMap<u64, Vec<String>>>,
}

impl IdentityCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the whole cache with the agent's authoritative list.
    pub fn replace(&self, identities: impl IntoIterator<Item = Identity>) {
        let mut map = self.identities.write().unwrap();
        map.clear();
        for identity in identities {
            map.insert(identity.id, identity.labels);
        }
    }

    pub fn insert(&self, identity: Identity) {
        self.identities
            .write()
            .unwrap()
            .insert(identity.id, identity.labels);
    }

    pub fn len(&self) -> usize {
        self.identities.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl IdentityGetter for IdentityCache {
    fn get_identity(&self, id: u64) -> Result<Identity> {
        let identities = self.identities.read().unwrap();
        match identities.get(&id) {
            Some(labels) => Ok(Identity {
                id,
                labels: labels.clone(),
            }),
            None => Err(Error::IdentityNotFound(id)),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_local_flag() {
        let plain = SecurityIdentity::from(123u32);
        assert!(!plain.is_local);
        assert_eq!(plain.id, 123);

        let local = SecurityIdentity::from(123u32 | LOCAL_IDENTITY_FLAG);
        assert!(local.is_local);
        // the raw value is preserved, flag included
        assert_eq!(local.id, (123u32 | LOCAL_IDENTITY_FLAG) as u64);
    }

    #[test]
    fn test_cache_replace_and_get() -> crate::Result<()> {
        let cache = IdentityCache::new();
        cache.replace(vec![
            Identity {
                id: 100,
                labels: vec!["app=frontend".into()],
            },
            Identity {
                id: 200,
                labels: vec!["app=backend".into()],
            },
        ]);

        assert_eq!(cache.get_identity(100)?.labels, vec!["app=frontend"]);
        assert!(matches!(
            cache.get_identity(300),
            Err(Error::IdentityNotFound(300))
        ));

        cache.replace(vec![Identity {
            id: 300,
            labels: vec![],
        }]);
        assert!(cache.get_identity(100).is_err());
        assert!(cache.get_identity(300).is_ok());
        Ok(())
    }
}
