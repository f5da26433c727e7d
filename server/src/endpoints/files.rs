// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use couriercommon::{identifiers::AttachmentId, messages::ScanVerdict};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{ApiError, AppState};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct InitiateUploadBody {
    filename: String,
    file_size: u64,
    mime_type: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct InitiateUploadResponse {
    file_id: String,
    upload_url: String,
    upload_headers: Vec<HeaderView>,
    expires_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Serialize)]
pub(super) struct HeaderView {
    key: String,
    value: String,
}

pub(super) async fn initiate(
    State(state): State<AppState>,
    Json(body): Json<InitiateUploadBody>,
) -> Result<(StatusCode, Json<InitiateUploadResponse>), ApiError> {
    let grant = state
        .files
        .initiate_upload(&body.filename, body.file_size, &body.mime_type)
        .await?;
    Ok((
        StatusCode::OK,
        Json(InitiateUploadResponse {
            file_id: grant.file_id.to_string(),
            upload_url: grant.upload_url,
            upload_headers: grant
                .upload_headers
                .into_iter()
                .map(|(key, value)| HeaderView { key, value })
                .collect(),
            expires_at: grant.expires_at,
        }),
    ))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct FileView {
    file_id: String,
    filename: String,
    file_size: u64,
    mime_type: String,
    scan_verdict: ScanVerdict,
    created_at: chrono::DateTime<chrono::Utc>,
    expires_at: chrono::DateTime<chrono::Utc>,
}

pub(super) async fn get_file(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<FileView>, ApiError> {
    let record = state
        .files
        .get(&AttachmentId::from(id))
        .await?
        .ok_or_else(|| ApiError::not_found("file not found"))?;
    Ok(Json(FileView {
        file_id: record.file_id.to_string(),
        filename: record.filename,
        file_size: record.size,
        mime_type: record.mime_type,
        scan_verdict: record.verdict,
        created_at: record.created_at,
        expires_at: record.expires_at,
    }))
}
