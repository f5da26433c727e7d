// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use chrono::{DateTime, Utc};
use couriercommon::identifiers::{PlatformAddress, UserId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A link from a user to a platform handle. A handle belongs to exactly one
/// user at a time; re-linking to a different user requires an unlink first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalIdentity {
    pub identity_id: Uuid,
    pub user_id: UserId,
    pub address: PlatformAddress,
    pub verified: bool,
    pub linked_at: DateTime<Utc>,
}

impl ExternalIdentity {
    pub fn new(user_id: UserId, address: PlatformAddress) -> Self {
        Self {
            identity_id: Uuid::new_v4(),
            user_id,
            address,
            verified: false,
            linked_at: Utc::now(),
        }
    }
}

pub(super) mod persistence {
    use sqlx::{PgExecutor, Row};

    use crate::{
        errors::{StorageError, is_unique_violation},
        identity_service::IdentityStoreError,
    };

    use super::*;

    impl ExternalIdentity {
        /// Inserts the binding. The unique constraint on
        /// (platform, platform_user_id) is the authority on duplicates.
        pub(in crate::identity_service) async fn link(
            connection: impl PgExecutor<'_>,
            user_id: &UserId,
            address: &PlatformAddress,
        ) -> Result<ExternalIdentity, IdentityStoreError> {
            let identity = ExternalIdentity::new(*user_id, address.clone());
            let result = sqlx::query(
                "INSERT INTO external_identities
                    (identity_id, user_id, platform, platform_user_id, verified, linked_at)
                    VALUES ($1, $2, $3, $4, $5, $6)",
            )
            .bind(identity.identity_id)
            .bind(identity.user_id)
            .bind(identity.address.platform)
            .bind(&identity.address.platform_user_id)
            .bind(identity.verified)
            .bind(identity.linked_at)
            .execute(connection)
            .await;
            match result {
                Ok(_) => Ok(identity),
                Err(e) if is_unique_violation(&e) => Err(IdentityStoreError::Duplicate),
                Err(e) => Err(StorageError::from(e).into()),
            }
        }

        /// Deletes the binding; deleting an absent binding is a no-op.
        pub(in crate::identity_service) async fn unlink(
            connection: impl PgExecutor<'_>,
            user_id: &UserId,
            address: &PlatformAddress,
        ) -> Result<(), StorageError> {
            sqlx::query(
                "DELETE FROM external_identities
                WHERE user_id = $1 AND platform = $2 AND platform_user_id = $3",
            )
            .bind(user_id)
            .bind(address.platform)
            .bind(&address.platform_user_id)
            .execute(connection)
            .await?;
            Ok(())
        }

        pub(in crate::identity_service) async fn resolve(
            connection: impl PgExecutor<'_>,
            address: &PlatformAddress,
        ) -> Result<Option<UserId>, StorageError> {
            let row = sqlx::query(
                "SELECT user_id FROM external_identities
                WHERE platform = $1 AND platform_user_id = $2",
            )
            .bind(address.platform)
            .bind(&address.platform_user_id)
            .fetch_optional(connection)
            .await?;
            Ok(row.map(|row| row.try_get("user_id")).transpose()?)
        }

        pub(in crate::identity_service) async fn load_for_user(
            connection: impl PgExecutor<'_>,
            user_id: &UserId,
        ) -> Result<Vec<ExternalIdentity>, StorageError> {
            let rows = sqlx::query(
                "SELECT identity_id, user_id, platform, platform_user_id, verified, linked_at
                FROM external_identities WHERE user_id = $1 ORDER BY linked_at",
            )
            .bind(user_id)
            .fetch_all(connection)
            .await?;
            rows.into_iter().map(Self::from_row).collect()
        }

        pub(in crate::identity_service) async fn load_all(
            connection: impl PgExecutor<'_>,
        ) -> Result<Vec<ExternalIdentity>, StorageError> {
            let rows = sqlx::query(
                "SELECT identity_id, user_id, platform, platform_user_id, verified, linked_at
                FROM external_identities",
            )
            .fetch_all(connection)
            .await?;
            rows.into_iter().map(Self::from_row).collect()
        }

        fn from_row(row: sqlx::postgres::PgRow) -> Result<ExternalIdentity, StorageError> {
            Ok(ExternalIdentity {
                identity_id: row.try_get("identity_id")?,
                user_id: row.try_get("user_id")?,
                address: PlatformAddress {
                    platform: row.try_get("platform")?,
                    platform_user_id: row.try_get("platform_user_id")?,
                },
                verified: row.try_get("verified")?,
                linked_at: row.try_get("linked_at")?,
            })
        }
    }
}
