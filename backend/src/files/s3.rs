// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use aws_config::BehaviorVersion;
use aws_sdk_s3::{
    config::{Credentials, Region},
    presigning::PresigningConfig,
    primitives::ByteStream,
};
use chrono::{DateTime, Duration, Utc};

use crate::settings::StorageSettings;

use super::FileServiceError;

const ATTACHMENT_BUCKET: &str = "attachments";

/// Presigning wrapper around the object-store client. Clients upload and
/// download directly against the presigned URLs; blobs never pass through
/// the gateway except on the inbound webhook path.
#[derive(Debug, Clone)]
pub struct S3Storage {
    client: aws_sdk_s3::Client,
    upload_expiration: Duration,
    download_expiration: Duration,
}

impl S3Storage {
    pub async fn new(settings: &StorageSettings) -> Result<Self, FileServiceError> {
        let credentials = Credentials::new(
            settings.access_key_id.clone(),
            settings.secret_access_key.clone(),
            None,
            None,
            "settings",
        );
        let config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(settings.region.clone()))
            .endpoint_url(&settings.endpoint)
            .credentials_provider(credentials)
            .load()
            .await;
        let mut builder = aws_sdk_s3::config::Builder::from(&config);
        builder.set_force_path_style(Some(settings.force_path_style));
        let client = aws_sdk_s3::Client::from_conf(builder.build());
        Ok(Self {
            client,
            upload_expiration: settings.upload_expiration,
            download_expiration: settings.download_expiration,
        })
    }

    fn presigning_config(
        expiration: Duration,
    ) -> Result<(PresigningConfig, DateTime<Utc>), FileServiceError> {
        let expires_at = Utc::now() + expiration;
        let std_expiration = expiration
            .to_std()
            .map_err(|e| FileServiceError::ObjectStorage(e.to_string()))?;
        let config = PresigningConfig::expires_in(std_expiration)
            .map_err(|e| FileServiceError::ObjectStorage(e.to_string()))?;
        Ok((config, expires_at))
    }

    /// Presigned PUT for a client-side upload.
    pub(super) async fn presign_put(
        &self,
        object_key: &str,
    ) -> Result<(String, Vec<(String, String)>, DateTime<Utc>), FileServiceError> {
        let (config, expires_at) = Self::presigning_config(self.upload_expiration)?;
        let request = self
            .client
            .put_object()
            .bucket(ATTACHMENT_BUCKET)
            .key(object_key)
            .presigned(config)
            .await
            .map_err(|e| FileServiceError::ObjectStorage(e.to_string()))?;
        let headers = request
            .headers()
            .map(|(k, v)| (k.to_owned(), v.to_owned()))
            .collect();
        Ok((request.uri().to_owned(), headers, expires_at))
    }

    /// Presigned GET for a download.
    pub(super) async fn presign_get(&self, object_key: &str) -> Result<String, FileServiceError> {
        let (config, _) = Self::presigning_config(self.download_expiration)?;
        let request = self
            .client
            .get_object()
            .bucket(ATTACHMENT_BUCKET)
            .key(object_key)
            .presigned(config)
            .await
            .map_err(|e| FileServiceError::ObjectStorage(e.to_string()))?;
        Ok(request.uri().to_owned())
    }

    /// Direct upload, used for blobs fetched from platform webhooks.
    pub(super) async fn put_object(
        &self,
        object_key: &str,
        bytes: Vec<u8>,
    ) -> Result<(), FileServiceError> {
        self.client
            .put_object()
            .bucket(ATTACHMENT_BUCKET)
            .key(object_key)
            .body(ByteStream::from(bytes))
            .send()
            .await
            .map_err(|e| FileServiceError::ObjectStorage(e.to_string()))?;
        Ok(())
    }
}
