// SPDX-License-Identifier: MIT OR Apache-2.0
//! Thin client for the object store's JSON API.
//!
//! Access control note: deployments grant two IAM rules — prefix-scoped
//! object permissions (get/create on `resource.name` under the prefix) and a
//! separate bucket-wide list permission. [`MirrorClient::list`] relies on
//! the latter; do not collapse the two when tightening policy, or listing
//! breaks while object reads keep working.

use crate::MirrorError;
use serde::Deserialize;
use tracing::debug;

/// One object as reported by the store's list call.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RemoteObject {
    /// Full object name (prefix included).
    pub name: String,
    /// Generation token; changes on every overwrite.
    pub generation: String,
}

/// Result of a conditional upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    /// The store accepted the object; the new generation is returned.
    Stored(String),
    /// The generation precondition failed (someone else wrote first).
    PreconditionFailed,
    /// The caller lacks permission for this object.
    PermissionDenied,
}

#[derive(Debug, Deserialize)]
struct ListPage {
    #[serde(default)]
    items: Vec<RemoteObject>,
    #[serde(default, rename = "nextPageToken")]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StoredObject {
    generation: String,
}

/// Client for one bucket of the object store.
#[derive(Debug, Clone)]
pub struct MirrorClient {
    http: reqwest::Client,
    base_url: String,
    bucket: String,
    token: Option<String>,
    billing_project: Option<String>,
}

impl MirrorClient {
    /// Create a client for `bucket` against `base_url`.
    ///
    /// `token` is a short-lived bearer; when `None` requests go out
    /// unauthenticated and the deployment's ambient credentials (proxy,
    /// emulator, public bucket) must cover access.
    pub fn new(
        base_url: impl Into<String>,
        bucket: impl Into<String>,
        token: Option<String>,
        billing_project: Option<String>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            bucket: bucket.into(),
            token,
            billing_project,
        }
    }

    /// The bucket this client serves.
    #[must_use]
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// List every object under `prefix`, following pagination sequentially.
    pub async fn list(&self, prefix: &str) -> Result<Vec<RemoteObject>, MirrorError> {
        let url = format!("{}/storage/v1/b/{}/o", self.base_url, self.bucket);
        let mut objects = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut req = self.http.get(&url).query(&[
                ("prefix", prefix),
                ("fields", "items(name,generation),nextPageToken"),
            ]);
            if let Some(token) = &page_token {
                req = req.query(&[("pageToken", token.as_str())]);
            }
            let resp = self.send(req, "list").await?;
            let page: ListPage = resp.json().await?;
            objects.extend(page.items);
            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        debug!(target: "tbx.mirror", prefix, count = objects.len(), "listed objects");
        Ok(objects)
    }

    /// Download an object's bytes.
    pub async fn download(&self, name: &str) -> Result<Vec<u8>, MirrorError> {
        let url = format!(
            "{}/storage/v1/b/{}/o/{}",
            self.base_url,
            self.bucket,
            encode_object_name(name)
        );
        let req = self.http.get(&url).query(&[("alt", "media")]);
        let resp = self.send(req, &format!("download {name}")).await?;
        Ok(resp.bytes().await?.to_vec())
    }

    /// Upload `bytes` as `name`, conditional on the object's generation.
    ///
    /// `if_generation_match` is the recorded generation when overwriting a
    /// known object, or `"0"` for only-if-absent creation.
    pub async fn upload(
        &self,
        name: &str,
        bytes: Vec<u8>,
        if_generation_match: &str,
    ) -> Result<UploadOutcome, MirrorError> {
        let url = format!("{}/upload/storage/v1/b/{}/o", self.base_url, self.bucket);
        let req = self
            .http
            .post(&url)
            .query(&[
                ("uploadType", "media"),
                ("name", name),
                ("ifGenerationMatch", if_generation_match),
            ])
            .body(bytes);

        let resp = self.authorized(req).send().await?;
        match resp.status().as_u16() {
            200 | 201 => {
                let stored: StoredObject = resp.json().await?;
                Ok(UploadOutcome::Stored(stored.generation))
            }
            412 => Ok(UploadOutcome::PreconditionFailed),
            403 => Ok(UploadOutcome::PermissionDenied),
            status => Err(MirrorError::Http {
                status,
                context: format!("upload {name}"),
            }),
        }
    }

    async fn send(
        &self,
        req: reqwest::RequestBuilder,
        context: &str,
    ) -> Result<reqwest::Response, MirrorError> {
        let resp = self.authorized(req).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(MirrorError::Http {
                status: status.as_u16(),
                context: context.to_string(),
            });
        }
        Ok(resp)
    }

    fn authorized(&self, mut req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        if let Some(project) = &self.billing_project {
            req = req.query(&[("userProject", project.as_str())]);
        }
        req
    }
}

/// Percent-encode an object name for use as a single path segment.
///
/// Everything outside RFC 3986 unreserved is encoded, slashes included —
/// the JSON API wants `a/b.txt` as `a%2Fb.txt`.
fn encode_object_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for byte in name.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char);
            }
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_names_are_fully_encoded() {
        assert_eq!(encode_object_name("a/b c.txt"), "a%2Fb%20c.txt");
        assert_eq!(encode_object_name("plain-name_1.txt"), "plain-name_1.txt");
    }
}
