use futures_util::future::try_join_all;
use log::{debug, info};
use reqwest::header::CONTENT_TYPE;
use serde::Deserialize;
use url::Url;

use crate::client::services::http::{ApiClient, ApiError, ApiResult};

/// One image to store, e.g. a post photo or a profile picture.
#[derive(Debug, Clone)]
pub struct UploadFile {
    pub name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

impl UploadFile {
    pub fn new(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        let name = name.into();
        let content_type = guess_content_type(&name).to_string();
        Self {
            name,
            content_type,
            bytes,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredObject {
    name: String,
    #[serde(default)]
    download_tokens: Option<String>,
}

/// Object storage for images. Objects live under `<folder>/<file name>` and
/// are served through a tokenised public download URL.
#[derive(Debug, Clone)]
pub struct UploadService {
    api: ApiClient,
    bucket: String,
}

impl UploadService {
    /// `api` must point at the storage host, e.g. `https://firebasestorage.googleapis.com`.
    pub fn new(api: ApiClient, bucket: impl Into<String>) -> Self {
        Self {
            api,
            bucket: bucket.into(),
        }
    }

    /// Uploads every file concurrently and returns their public URLs in input order.
    pub async fn upload_files(&self, files: &[UploadFile], folder: &str) -> ApiResult<Vec<String>> {
        try_join_all(files.iter().map(|file| self.upload(file, folder))).await
    }

    pub async fn upload(&self, file: &UploadFile, folder: &str) -> ApiResult<String> {
        let object_name = format!("{}/{}", folder.trim_matches('/'), file.name);
        let builder = self
            .api
            .request(reqwest::Method::POST, &["v0", "b", &self.bucket, "o"])?
            .query(&[("name", object_name.as_str())])
            .header(CONTENT_TYPE, file.content_type.as_str())
            .body(file.bytes.clone());
        debug!("[UPLOAD] {} ({} bytes)", object_name, file.bytes.len());
        let stored: StoredObject = self.api.send_raw(builder, "Upload failed").await?;
        let url = self.download_url(&stored)?;
        info!("[UPLOAD] Stored {}", stored.name);
        Ok(url.to_string())
    }

    fn download_url(&self, stored: &StoredObject) -> ApiResult<Url> {
        let token = stored.download_tokens.as_deref().ok_or_else(|| ApiError::Api {
            status: 500,
            message: "Upload response carried no download token".to_string(),
        })?;
        // several tokens may be comma separated; any of them works
        let token = token.split(',').next().unwrap_or(token);
        let mut url = self.api.endpoint(&["v0", "b", &self.bucket, "o", &stored.name])?;
        url.query_pairs_mut()
            .append_pair("alt", "media")
            .append_pair("token", token);
        Ok(url)
    }
}

fn guess_content_type(name: &str) -> &'static str {
    let ext = name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        _ => "application/octet-stream",
    }
}
