// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Identity store: internal users, their platform handles, and the audit
//! trail of identity changes.
//!
//! `resolve` is the pipeline's hot path; `link`/`unlink`/`audit` are
//! infrequent. A successful link is visible to subsequent resolves, and
//! uniqueness of `(platform, platform_user_id)` is enforced by the store
//! itself, never by the caller.

use std::collections::HashSet;

use async_trait::async_trait;
use couriercommon::{
    identifiers::{PlatformAddress, UserId},
    messages::UserRole,
};
use sqlx::PgPool;
use thiserror::Error;

use crate::{
    backend_service::BackendService,
    errors::{ServiceCreationError, StorageError},
};

mod audit;
mod external_identity;
pub mod memory;
mod user_record;

pub use audit::AuditEntry;
pub use external_identity::ExternalIdentity;
pub use user_record::UserProfile;

#[derive(Debug, Error)]
pub enum IdentityStoreError {
    /// The (platform, platform_user_id) pair is already linked to a user.
    #[error("Identity is already linked")]
    Duplicate,
    /// The referenced user does not exist.
    #[error("User not found")]
    UserNotFound,
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl From<sqlx::Error> for IdentityStoreError {
    fn from(e: sqlx::Error) -> Self {
        Self::Storage(e.into())
    }
}

#[async_trait]
pub trait IdentityStore: Send + Sync + std::fmt::Debug + 'static {
    async fn create_user(
        &self,
        display_name: &str,
        role: UserRole,
    ) -> Result<UserProfile, IdentityStoreError>;

    async fn get_user(&self, user_id: &UserId) -> Result<Option<UserProfile>, IdentityStoreError>;

    async fn list_users(&self) -> Result<Vec<UserProfile>, IdentityStoreError>;

    /// Links a platform handle to a user. Fails with
    /// [`IdentityStoreError::Duplicate`] if the handle is already linked,
    /// never silently overwrites.
    async fn link_identity(
        &self,
        user_id: &UserId,
        address: &PlatformAddress,
    ) -> Result<ExternalIdentity, IdentityStoreError>;

    /// Unlinks a platform handle. Idempotent; an absent binding is not an
    /// error.
    async fn unlink_identity(
        &self,
        user_id: &UserId,
        address: &PlatformAddress,
    ) -> Result<(), IdentityStoreError>;

    /// Leaf lookup from a platform handle to the owning user.
    async fn resolve(
        &self,
        address: &PlatformAddress,
    ) -> Result<Option<UserId>, IdentityStoreError>;

    async fn get_identities(
        &self,
        user_id: &UserId,
    ) -> Result<Vec<ExternalIdentity>, IdentityStoreError>;

    /// Advisory candidates for identity merging, by token overlap on the
    /// user's handles.
    async fn suggest_matches(&self, user_id: &UserId)
    -> Result<Vec<UserId>, IdentityStoreError>;

    /// Durable, append-only audit record.
    async fn audit(&self, entry: AuditEntry) -> Result<(), IdentityStoreError>;
}

/// Postgres-backed identity store.
#[derive(Debug, Clone)]
pub struct IdentityService {
    db_pool: PgPool,
}

#[async_trait]
impl BackendService for IdentityService {
    async fn initialize(db_pool: PgPool) -> Result<Self, ServiceCreationError> {
        Ok(Self { db_pool })
    }
}

#[async_trait]
impl IdentityStore for IdentityService {
    async fn create_user(
        &self,
        display_name: &str,
        role: UserRole,
    ) -> Result<UserProfile, IdentityStoreError> {
        let profile = UserProfile::new(display_name, role);
        profile.store(&self.db_pool).await?;
        Ok(profile)
    }

    async fn get_user(&self, user_id: &UserId) -> Result<Option<UserProfile>, IdentityStoreError> {
        Ok(UserProfile::load(&self.db_pool, user_id).await?)
    }

    async fn list_users(&self) -> Result<Vec<UserProfile>, IdentityStoreError> {
        Ok(UserProfile::load_all(&self.db_pool).await?)
    }

    async fn link_identity(
        &self,
        user_id: &UserId,
        address: &PlatformAddress,
    ) -> Result<ExternalIdentity, IdentityStoreError> {
        if UserProfile::load(&self.db_pool, user_id).await?.is_none() {
            return Err(IdentityStoreError::UserNotFound);
        }
        ExternalIdentity::link(&self.db_pool, user_id, address).await
    }

    async fn unlink_identity(
        &self,
        user_id: &UserId,
        address: &PlatformAddress,
    ) -> Result<(), IdentityStoreError> {
        ExternalIdentity::unlink(&self.db_pool, user_id, address).await?;
        Ok(())
    }

    async fn resolve(
        &self,
        address: &PlatformAddress,
    ) -> Result<Option<UserId>, IdentityStoreError> {
        Ok(ExternalIdentity::resolve(&self.db_pool, address).await?)
    }

    async fn get_identities(
        &self,
        user_id: &UserId,
    ) -> Result<Vec<ExternalIdentity>, IdentityStoreError> {
        Ok(ExternalIdentity::load_for_user(&self.db_pool, user_id).await?)
    }

    async fn suggest_matches(
        &self,
        user_id: &UserId,
    ) -> Result<Vec<UserId>, IdentityStoreError> {
        let own = ExternalIdentity::load_for_user(&self.db_pool, user_id).await?;
        let all = ExternalIdentity::load_all(&self.db_pool).await?;
        Ok(suggest_from_identities(user_id, &own, &all))
    }

    async fn audit(&self, entry: AuditEntry) -> Result<(), IdentityStoreError> {
        entry.store(&self.db_pool).await?;
        Ok(())
    }
}

/// Tokenizes a platform handle for match suggestions. Handles are compared
/// case-insensitively on alphanumeric runs; digit runs are additionally
/// reduced to their trailing eight digits, so phone numbers match across
/// country-code formatting.
fn handle_tokens(platform_user_id: &str) -> HashSet<String> {
    let mut tokens = HashSet::new();
    let lowered = platform_user_id.to_lowercase();
    for run in lowered.split(|c: char| !c.is_alphanumeric()) {
        if run.len() >= 4 {
            tokens.insert(run.to_owned());
        }
    }
    let digits: String = lowered.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() >= 8 {
        tokens.insert(digits[digits.len() - 8..].to_owned());
    }
    tokens
}

fn suggest_from_identities(
    user_id: &UserId,
    own: &[ExternalIdentity],
    all: &[ExternalIdentity],
) -> Vec<UserId> {
    let own_tokens: HashSet<String> = own
        .iter()
        .flat_map(|identity| handle_tokens(&identity.address.platform_user_id))
        .collect();
    let mut candidates: Vec<UserId> = all
        .iter()
        .filter(|identity| identity.user_id != *user_id)
        .filter(|identity| {
            handle_tokens(&identity.address.platform_user_id)
                .intersection(&own_tokens)
                .next()
                .is_some()
        })
        .map(|identity| identity.user_id)
        .collect();
    candidates.sort();
    candidates.dedup();
    candidates
}

#[cfg(test)]
mod tests {
    use couriercommon::identifiers::Platform;

    use super::*;

    #[test]
    fn phone_numbers_match_across_formatting() {
        let a = handle_tokens("+55 62 99999-9999");
        let b = handle_tokens("5562999999999");
        assert!(a.intersection(&b).next().is_some());
    }

    #[test]
    fn unrelated_handles_do_not_match() {
        let a = handle_tokens("alice.example");
        let b = handle_tokens("bob.other");
        assert!(a.intersection(&b).next().is_none());
    }

    #[test]
    fn suggestions_exclude_the_user_itself() {
        let user = UserId::random();
        let other = UserId::random();
        let own = vec![ExternalIdentity::new(
            user,
            PlatformAddress::new(Platform::WhatsApp, "+5562999999999"),
        )];
        let all = vec![
            own[0].clone(),
            ExternalIdentity::new(
                other,
                PlatformAddress::new(Platform::Telegram, "5562999999999"),
            ),
        ];
        let suggested = suggest_from_identities(&user, &own, &all);
        assert_eq!(suggested, vec![other]);
    }
}
