// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use courierbackend::identity_service::{AuditEntry, UserProfile};
use couriercommon::{
    identifiers::{Platform, PlatformAddress, UserId},
    messages::UserRole,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{ApiError, AppState};

/// Actor recorded in the audit log for API-originated identity changes.
const API_ACTOR: &str = "api";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct CreateUserBody {
    display_name: String,
    role: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct UserView {
    user_id: String,
    display_name: String,
    role: UserRole,
    created_at: chrono::DateTime<chrono::Utc>,
}

impl From<UserProfile> for UserView {
    fn from(profile: UserProfile) -> Self {
        Self {
            user_id: profile.user_id.to_string(),
            display_name: profile.display_name,
            role: profile.role,
            created_at: profile.created_at,
        }
    }
}

pub(super) async fn create_user(
    State(state): State<AppState>,
    Json(body): Json<CreateUserBody>,
) -> Result<(StatusCode, Json<UserView>), ApiError> {
    let role: UserRole = body
        .role
        .parse()
        .map_err(|e: String| ApiError::bad_request(e))?;
    let profile = state.identity.create_user(&body.display_name, role).await?;
    Ok((StatusCode::OK, Json(profile.into())))
}

pub(super) async fn get_user(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<UserView>, ApiError> {
    let profile = state
        .identity
        .get_user(&UserId::from(id))
        .await?
        .ok_or_else(|| ApiError::not_found("user not found"))?;
    Ok(Json(profile.into()))
}

pub(super) async fn list_users(
    State(state): State<AppState>,
) -> Result<Json<Vec<UserView>>, ApiError> {
    let users = state.identity.list_users().await?;
    Ok(Json(users.into_iter().map(Into::into).collect()))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct LinkIdentityBody {
    platform: String,
    platform_user_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct IdentityView {
    platform: String,
    platform_user_id: String,
    verified: bool,
    linked_at: chrono::DateTime<chrono::Utc>,
}

pub(super) async fn link_identity(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<LinkIdentityBody>,
) -> Result<(StatusCode, Json<IdentityView>), ApiError> {
    let platform: Platform = body
        .platform
        .parse()
        .map_err(|_| ApiError::bad_request(format!("unknown platform: {}", body.platform)))?;
    let user_id = UserId::from(id);
    let address = PlatformAddress::new(platform, body.platform_user_id);
    let identity = state.identity.link_identity(&user_id, &address).await?;
    state
        .identity
        .audit(AuditEntry::new(
            API_ACTOR,
            "link_identity",
            address.to_string(),
            None,
            Some(user_id.to_string()),
        ))
        .await?;
    Ok((
        StatusCode::OK,
        Json(IdentityView {
            platform: identity.address.platform.to_string(),
            platform_user_id: identity.address.platform_user_id,
            verified: identity.verified,
            linked_at: identity.linked_at,
        }),
    ))
}

pub(super) async fn unlink_identity(
    State(state): State<AppState>,
    Path((id, platform, platform_user_id)): Path<(Uuid, String, String)>,
) -> Result<StatusCode, ApiError> {
    let platform: Platform = platform
        .parse()
        .map_err(|_| ApiError::bad_request(format!("unknown platform: {platform}")))?;
    let user_id = UserId::from(id);
    let address = PlatformAddress::new(platform, platform_user_id);
    state.identity.unlink_identity(&user_id, &address).await?;
    state
        .identity
        .audit(AuditEntry::new(
            API_ACTOR,
            "unlink_identity",
            address.to_string(),
            Some(user_id.to_string()),
            None,
        ))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub(super) async fn suggest_matches(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<String>>, ApiError> {
    let candidates = state.identity.suggest_matches(&UserId::from(id)).await?;
    Ok(Json(candidates.iter().map(ToString::to_string).collect()))
}

#[derive(Debug, Deserialize)]
pub(super) struct ResolveParams {
    platform: String,
    id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct ResolveView {
    user_id: String,
    display_name: String,
}

pub(super) async fn resolve(
    State(state): State<AppState>,
    Query(params): Query<ResolveParams>,
) -> Result<Json<ResolveView>, ApiError> {
    let platform: Platform = params
        .platform
        .parse()
        .map_err(|_| ApiError::bad_request(format!("unknown platform: {}", params.platform)))?;
    let address = PlatformAddress::new(platform, params.id);
    let user_id = state
        .identity
        .resolve(&address)
        .await?
        .ok_or_else(|| ApiError::not_found("identity not linked"))?;
    let profile = state
        .identity
        .get_user(&user_id)
        .await?
        .ok_or_else(|| ApiError::not_found("user not found"))?;
    Ok(Json(ResolveView {
        user_id: user_id.to_string(),
        display_name: profile.display_name,
    }))
}
