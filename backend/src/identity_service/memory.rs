// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! In-memory identity store for tests and single-process deployments.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use couriercommon::{
    identifiers::{PlatformAddress, UserId},
    messages::UserRole,
};

use super::{
    AuditEntry, ExternalIdentity, IdentityStore, IdentityStoreError, UserProfile,
    suggest_from_identities,
};

#[derive(Debug, Default)]
struct Inner {
    users: HashMap<UserId, UserProfile>,
    identities: HashMap<PlatformAddress, ExternalIdentity>,
    audit: Vec<AuditEntry>,
}

#[derive(Debug, Default, Clone)]
pub struct MemoryIdentityStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of audit entries recorded so far.
    pub fn audit_len(&self) -> usize {
        self.inner.lock().unwrap().audit.len()
    }
}

#[async_trait]
impl IdentityStore for MemoryIdentityStore {
    async fn create_user(
        &self,
        display_name: &str,
        role: UserRole,
    ) -> Result<UserProfile, IdentityStoreError> {
        let profile = UserProfile::new(display_name, role);
        self.inner
            .lock()
            .unwrap()
            .users
            .insert(profile.user_id, profile.clone());
        Ok(profile)
    }

    async fn get_user(&self, user_id: &UserId) -> Result<Option<UserProfile>, IdentityStoreError> {
        Ok(self.inner.lock().unwrap().users.get(user_id).cloned())
    }

    async fn list_users(&self) -> Result<Vec<UserProfile>, IdentityStoreError> {
        let mut users: Vec<_> = self.inner.lock().unwrap().users.values().cloned().collect();
        users.sort_by_key(|u| u.created_at);
        Ok(users)
    }

    async fn link_identity(
        &self,
        user_id: &UserId,
        address: &PlatformAddress,
    ) -> Result<ExternalIdentity, IdentityStoreError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.users.contains_key(user_id) {
            return Err(IdentityStoreError::UserNotFound);
        }
        if inner.identities.contains_key(address) {
            return Err(IdentityStoreError::Duplicate);
        }
        let identity = ExternalIdentity::new(*user_id, address.clone());
        inner.identities.insert(address.clone(), identity.clone());
        Ok(identity)
    }

    async fn unlink_identity(
        &self,
        user_id: &UserId,
        address: &PlatformAddress,
    ) -> Result<(), IdentityStoreError> {
        let mut inner = self.inner.lock().unwrap();
        if inner
            .identities
            .get(address)
            .is_some_and(|identity| identity.user_id == *user_id)
        {
            inner.identities.remove(address);
        }
        Ok(())
    }

    async fn resolve(
        &self,
        address: &PlatformAddress,
    ) -> Result<Option<UserId>, IdentityStoreError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .identities
            .get(address)
            .map(|identity| identity.user_id))
    }

    async fn get_identities(
        &self,
        user_id: &UserId,
    ) -> Result<Vec<ExternalIdentity>, IdentityStoreError> {
        let mut identities: Vec<_> = self
            .inner
            .lock()
            .unwrap()
            .identities
            .values()
            .filter(|identity| identity.user_id == *user_id)
            .cloned()
            .collect();
        identities.sort_by_key(|identity| identity.linked_at);
        Ok(identities)
    }

    async fn suggest_matches(
        &self,
        user_id: &UserId,
    ) -> Result<Vec<UserId>, IdentityStoreError> {
        let inner = self.inner.lock().unwrap();
        let own: Vec<_> = inner
            .identities
            .values()
            .filter(|identity| identity.user_id == *user_id)
            .cloned()
            .collect();
        let all: Vec<_> = inner.identities.values().cloned().collect();
        Ok(suggest_from_identities(user_id, &own, &all))
    }

    async fn audit(&self, entry: AuditEntry) -> Result<(), IdentityStoreError> {
        self.inner.lock().unwrap().audit.push(entry);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use couriercommon::identifiers::Platform;

    use super::*;

    fn address() -> PlatformAddress {
        PlatformAddress::new(Platform::WhatsApp, "+5562999999999")
    }

    #[tokio::test]
    async fn link_is_visible_to_resolve() -> anyhow::Result<()> {
        let store = MemoryIdentityStore::new();
        let user = store.create_user("Carla", UserRole::Customer).await?;
        store.link_identity(&user.user_id, &address()).await?;
        let resolved = store.resolve(&address()).await?;
        assert_eq!(resolved, Some(user.user_id));
        Ok(())
    }

    #[tokio::test]
    async fn duplicate_link_fails() -> anyhow::Result<()> {
        let store = MemoryIdentityStore::new();
        let a = store.create_user("A", UserRole::Customer).await?;
        let b = store.create_user("B", UserRole::Customer).await?;
        store.link_identity(&a.user_id, &address()).await?;
        let result = store.link_identity(&b.user_id, &address()).await;
        assert!(matches!(result, Err(IdentityStoreError::Duplicate)));
        Ok(())
    }

    #[tokio::test]
    async fn unlink_then_relink_moves_the_identity() -> anyhow::Result<()> {
        let store = MemoryIdentityStore::new();
        let a = store.create_user("A", UserRole::Customer).await?;
        let b = store.create_user("B", UserRole::Customer).await?;
        store.link_identity(&a.user_id, &address()).await?;
        store.unlink_identity(&a.user_id, &address()).await?;
        // Unlinking an absent binding is not an error.
        store.unlink_identity(&a.user_id, &address()).await?;
        store.link_identity(&b.user_id, &address()).await?;
        assert_eq!(store.resolve(&address()).await?, Some(b.user_id));
        Ok(())
    }

    #[tokio::test]
    async fn link_to_unknown_user_fails() {
        let store = MemoryIdentityStore::new();
        let result = store.link_identity(&UserId::random(), &address()).await;
        assert!(matches!(result, Err(IdentityStoreError::UserNotFound)));
    }
}
