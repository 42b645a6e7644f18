//! Bulk download manifest.
//!
//! The API hands out time-limited download URLs for the full bulk export and
//! for the delta files published since. Both lists share one descriptor shape.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::dvsa::client::ApiClient;
use crate::dvsa::BULK_DOWNLOAD_PATH;
use crate::error::AppError;

// ─────────────────────────────────────────────────────────────────────────────
// Public Types
// ─────────────────────────────────────────────────────────────────────────────

/// Which manifest list a descriptor came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BulkFileKind {
    #[default]
    Bulk,
    Delta,
}

/// One downloadable unit of bulk data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkFileDescriptor {
    pub filename: String,
    pub download_url: String,
    #[serde(default)]
    pub file_size: Option<u64>,
    #[serde(default)]
    pub file_created_on: Option<String>,
    /// Filled in from the list the descriptor was found in.
    #[serde(skip_deserializing, default)]
    pub kind: BulkFileKind,
}

/// The bulk download manifest as returned by the API.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BulkManifest {
    #[serde(default)]
    pub bulk: Vec<BulkFileDescriptor>,
    #[serde(default)]
    pub delta: Vec<BulkFileDescriptor>,
}

impl BulkManifest {
    /// All descriptors: bulk files first, then delta files, each in API order.
    pub fn descriptors(&self) -> impl Iterator<Item = &BulkFileDescriptor> {
        self.bulk.iter().chain(self.delta.iter())
    }

    pub fn len(&self) -> usize {
        self.bulk.len() + self.delta.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn tag_kinds(mut self) -> Self {
        for d in &mut self.bulk {
            d.kind = BulkFileKind::Bulk;
        }
        for d in &mut self.delta {
            d.kind = BulkFileKind::Delta;
        }
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Manifest Lister
// ─────────────────────────────────────────────────────────────────────────────

/// Fetches the bulk download manifest.
///
/// # Errors
///
/// - `AppError::Authentication` - no token could be obtained
/// - `AppError::Api` - non-success status or unexpected manifest shape
pub async fn list_bulk_files(client: &ApiClient) -> Result<BulkManifest, AppError> {
    let manifest: BulkManifest = client.get_json(BULK_DOWNLOAD_PATH).await?;
    let manifest = manifest.tag_kinds();

    info!(
        "[BULK] Manifest lists {} bulk and {} delta files",
        manifest.bulk.len(),
        manifest.delta.len()
    );

    Ok(manifest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HttpSettings;
    use crate::dvsa::client::tests::{mount_token, test_credentials};
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn manifest_json() -> serde_json::Value {
        serde_json::json!({
            "bulk": [
                {
                    "filename": "bulk-light-vehicle_01-06-2024.zip",
                    "downloadUrl": "https://s3.example/bulk.zip?X-Amz-Signature=abc",
                    "fileSize": 1024,
                    "fileCreatedOn": "2024-06-01"
                }
            ],
            "delta": [
                {
                    "filename": "delta-light-vehicle_02-06-2024.zip",
                    "downloadUrl": "https://s3.example/delta1.zip",
                    "fileSize": 64,
                    "fileCreatedOn": "2024-06-02"
                },
                {
                    "filename": "delta-light-vehicle_03-06-2024.zip",
                    "downloadUrl": "https://s3.example/delta2.zip"
                }
            ]
        })
    }

    #[test]
    fn descriptors_chain_bulk_then_delta() {
        let manifest: BulkManifest = serde_json::from_value(manifest_json()).unwrap();
        let manifest = manifest.tag_kinds();

        let names: Vec<_> = manifest.descriptors().map(|d| d.filename.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "bulk-light-vehicle_01-06-2024.zip",
                "delta-light-vehicle_02-06-2024.zip",
                "delta-light-vehicle_03-06-2024.zip",
            ]
        );
        assert_eq!(manifest.len(), 3);
        assert_eq!(manifest.bulk[0].kind, BulkFileKind::Bulk);
        assert_eq!(manifest.delta[1].kind, BulkFileKind::Delta);
        assert_eq!(manifest.delta[1].file_size, None);
    }

    #[test]
    fn missing_lists_default_to_empty() {
        let manifest: BulkManifest = serde_json::from_value(serde_json::json!({})).unwrap();
        assert!(manifest.is_empty());
    }

    #[test]
    fn descriptor_without_url_is_rejected() {
        let result = serde_json::from_value::<BulkManifest>(serde_json::json!({
            "bulk": [{ "filename": "x.zip" }]
        }));
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn list_bulk_files_fetches_manifest() {
        let server = MockServer::start().await;
        mount_token(&server, "tok").await;

        Mock::given(method("GET"))
            .and(path(BULK_DOWNLOAD_PATH))
            .and(header("Authorization", "Bearer tok"))
            .respond_with(ResponseTemplate::new(200).set_body_json(manifest_json()))
            .expect(1)
            .mount(&server)
            .await;

        let client =
            ApiClient::new(&test_credentials(&server.uri()), &HttpSettings::default()).unwrap();
        let manifest = list_bulk_files(&client).await.unwrap();

        assert_eq!(manifest.len(), 3);
        assert_eq!(manifest.bulk[0].file_size, Some(1024));
        assert_eq!(manifest.delta[0].kind, BulkFileKind::Delta);
    }

    #[tokio::test]
    async fn list_bulk_files_maps_server_error() {
        let server = MockServer::start().await;
        mount_token(&server, "tok").await;

        Mock::given(method("GET"))
            .and(path(BULK_DOWNLOAD_PATH))
            .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
            .mount(&server)
            .await;

        let client =
            ApiClient::new(&test_credentials(&server.uri()), &HttpSettings::default()).unwrap();
        let err = list_bulk_files(&client).await.unwrap_err();

        match err {
            AppError::Api { status, body } => {
                assert_eq!(status, 503);
                assert_eq!(body, "maintenance");
            }
            other => panic!("Expected Api, got {:?}", other),
        }
    }
}
