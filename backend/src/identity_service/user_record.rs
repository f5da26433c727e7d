// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use chrono::{DateTime, Utc};
use couriercommon::{identifiers::UserId, messages::UserRole};
use serde::{Deserialize, Serialize};

/// An internal user. Created once; never destroyed while referenced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: UserId,
    pub display_name: String,
    pub role: UserRole,
    pub created_at: DateTime<Utc>,
}

impl UserProfile {
    pub fn new(display_name: &str, role: UserRole) -> Self {
        Self {
            user_id: UserId::random(),
            display_name: display_name.to_owned(),
            role,
            created_at: Utc::now(),
        }
    }
}

pub(super) mod persistence {
    use sqlx::{PgExecutor, Row};

    use crate::errors::StorageError;

    use super::*;

    impl UserProfile {
        pub(in crate::identity_service) async fn store(
            &self,
            connection: impl PgExecutor<'_>,
        ) -> Result<(), StorageError> {
            sqlx::query(
                "INSERT INTO users
                    (user_id, display_name, user_role, created_at)
                    VALUES ($1, $2, $3, $4)",
            )
            .bind(self.user_id)
            .bind(&self.display_name)
            .bind(self.role.as_str())
            .bind(self.created_at)
            .execute(connection)
            .await?;
            Ok(())
        }

        pub(in crate::identity_service) async fn load(
            connection: impl PgExecutor<'_>,
            user_id: &UserId,
        ) -> Result<Option<UserProfile>, StorageError> {
            let row = sqlx::query(
                "SELECT user_id, display_name, user_role, created_at
                FROM users WHERE user_id = $1",
            )
            .bind(user_id)
            .fetch_optional(connection)
            .await?;
            row.map(Self::from_row).transpose()
        }

        pub(in crate::identity_service) async fn load_all(
            connection: impl PgExecutor<'_>,
        ) -> Result<Vec<UserProfile>, StorageError> {
            let rows = sqlx::query(
                "SELECT user_id, display_name, user_role, created_at
                FROM users ORDER BY created_at",
            )
            .fetch_all(connection)
            .await?;
            rows.into_iter().map(Self::from_row).collect()
        }

        fn from_row(row: sqlx::postgres::PgRow) -> Result<UserProfile, StorageError> {
            let role: String = row.try_get("user_role")?;
            let role = role
                .parse::<UserRole>()
                .map_err(|e| sqlx::Error::Decode(e.into()))?;
            Ok(UserProfile {
                user_id: row.try_get("user_id")?,
                display_name: row.try_get("display_name")?,
                role,
                created_at: row.try_get("created_at")?,
            })
        }
    }
}
