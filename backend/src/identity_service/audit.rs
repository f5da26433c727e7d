// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One audit record of an identity change. Appended, never updated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub actor: String,
    pub action: String,
    pub target: String,
    pub before: Option<String>,
    pub after: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(
        actor: impl Into<String>,
        action: impl Into<String>,
        target: impl Into<String>,
        before: Option<String>,
        after: Option<String>,
    ) -> Self {
        Self {
            actor: actor.into(),
            action: action.into(),
            target: target.into(),
            before,
            after,
            recorded_at: Utc::now(),
        }
    }
}

pub(super) mod persistence {
    use sqlx::PgExecutor;

    use crate::errors::StorageError;

    use super::*;

    impl AuditEntry {
        pub(in crate::identity_service) async fn store(
            &self,
            connection: impl PgExecutor<'_>,
        ) -> Result<(), StorageError> {
            sqlx::query(
                "INSERT INTO audit_log
                    (actor, action, target, before_state, after_state, recorded_at)
                    VALUES ($1, $2, $3, $4, $5, $6)",
            )
            .bind(&self.actor)
            .bind(&self.action)
            .bind(&self.target)
            .bind(&self.before)
            .bind(&self.after)
            .bind(self.recorded_at)
            .execute(connection)
            .await?;
            Ok(())
        }
    }
}
