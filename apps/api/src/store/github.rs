//! GitHub Git Data API backend.
//!
//! Refs are advanced with `force = false`, which only rejects non-fast-forward
//! moves. That is weaker than a compare-and-swap on the expected commit, so
//! this backend reports no CAS support and the client re-reads the ref first.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use super::{CommitInfo, ObjectId, ObjectStore, RefUpdate, RepoInfo, StoreError, TreeChange};

const API_VERSION: &str = "2022-11-28";
const ACCEPT: &str = "application/vnd.github+json";
const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));
const REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Deserialize)]
struct RepoResponse {
    name: String,
    default_branch: Option<String>,
    private: bool,
}

#[derive(Debug, Deserialize)]
struct RefResponse {
    object: ShaRef,
}

#[derive(Debug, Deserialize)]
struct ShaRef {
    sha: String,
}

#[derive(Debug, Deserialize)]
struct CommitResponse {
    sha: String,
    tree: ShaRef,
    #[serde(default)]
    parents: Vec<ShaRef>,
}

#[derive(Debug, Deserialize)]
struct TreeResponse {
    tree: Vec<TreeEntry>,
    #[serde(default)]
    truncated: bool,
}

#[derive(Debug, Deserialize)]
struct TreeEntry {
    path: String,
    #[serde(rename = "type")]
    kind: String,
    sha: String,
}

#[derive(Debug, Deserialize)]
struct BlobResponse {
    content: String,
    encoding: String,
}

#[derive(Debug, Serialize)]
struct NewTreeEntry<'a> {
    path: &'a str,
    mode: &'static str,
    #[serde(rename = "type")]
    kind: &'static str,
    /// `None` serializes as `null`, which removes the path.
    sha: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct GithubErrorBody {
    message: String,
}

/// One memory repository owned by `owner`.
#[derive(Clone)]
pub struct GithubStore {
    client: Client,
    api_url: String,
    token: String,
    owner: String,
    repo: String,
}

impl GithubStore {
    pub fn new(api_url: &str, token: String, owner: String, repo: String) -> Result<Self, StoreError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| StoreError::Unexpected(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            token,
            owner,
            repo,
        })
    }

    fn repo_url(&self, suffix: &str) -> String {
        format!("{}/repos/{}/{}{}", self.api_url, self.owner, self.repo, suffix)
    }

    fn authed(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .bearer_auth(&self.token)
            .header("Accept", ACCEPT)
            .header("X-GitHub-Api-Version", API_VERSION)
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response, StoreError> {
        self.authed(builder).send().await.map_err(transport_error)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, StoreError> {
        let response = self.send(self.client.get(url)).await?;
        decode(expect_success(response).await?).await
    }

    async fn post_json<T: DeserializeOwned>(
        &self,
        url: &str,
        body: &serde_json::Value,
    ) -> Result<T, StoreError> {
        let response = self.send(self.client.post(url).json(body)).await?;
        decode(expect_success(response).await?).await
    }
}

fn transport_error(e: reqwest::Error) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, StoreError> {
    response
        .json::<T>()
        .await
        .map_err(|e| StoreError::Unexpected(format!("invalid response body: {e}")))
}

async fn error_message(response: Response) -> String {
    let body = response.text().await.unwrap_or_default();
    serde_json::from_str::<GithubErrorBody>(&body)
        .map(|e| e.message)
        .unwrap_or(body)
}

/// Maps non-success statuses onto the store error taxonomy.
async fn expect_success(response: Response) -> Result<Response, StoreError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = error_message(response).await;
    warn!(status = status.as_u16(), %message, "GitHub request failed");
    Err(match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => StoreError::Unauthorized(message),
        StatusCode::NOT_FOUND => StoreError::NotFound(message),
        StatusCode::TOO_MANY_REQUESTS => StoreError::Unavailable(message),
        s if s.is_server_error() => StoreError::Unavailable(message),
        _ => StoreError::Rejected(format!("{}: {}", status.as_u16(), message)),
    })
}

#[async_trait]
impl ObjectStore for GithubStore {
    async fn get_repository(&self) -> Result<Option<RepoInfo>, StoreError> {
        let response = self.send(self.client.get(self.repo_url(""))).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let repo: RepoResponse = decode(expect_success(response).await?).await?;
        Ok(Some(RepoInfo {
            name: repo.name,
            default_branch: repo.default_branch.unwrap_or_else(|| "main".to_string()),
            private: repo.private,
        }))
    }

    async fn create_repository(&self) -> Result<RepoInfo, StoreError> {
        let body = json!({
            "name": self.repo,
            "private": true,
            "auto_init": true,
            "description": "Career corpus memory",
        });
        let repo: RepoResponse = self
            .post_json(&format!("{}/user/repos", self.api_url), &body)
            .await?;
        debug!(repo = %repo.name, "Created memory repository");
        Ok(RepoInfo {
            name: repo.name,
            default_branch: repo.default_branch.unwrap_or_else(|| "main".to_string()),
            private: repo.private,
        })
    }

    async fn get_ref(&self, branch: &str) -> Result<Option<ObjectId>, StoreError> {
        let url = self.repo_url(&format!("/git/ref/heads/{branch}"));
        let response = self.send(self.client.get(url)).await?;
        // 409 is returned for a repository without any commits
        if matches!(response.status(), StatusCode::NOT_FOUND | StatusCode::CONFLICT) {
            return Ok(None);
        }
        let reference: RefResponse = decode(expect_success(response).await?).await?;
        Ok(Some(ObjectId::new(reference.object.sha)))
    }

    async fn get_commit(&self, commit: &ObjectId) -> Result<CommitInfo, StoreError> {
        let body: CommitResponse = self
            .get_json(&self.repo_url(&format!("/git/commits/{commit}")))
            .await?;
        Ok(CommitInfo {
            id: ObjectId::new(body.sha),
            tree: ObjectId::new(body.tree.sha),
            parent: body.parents.into_iter().next().map(|p| ObjectId::new(p.sha)),
        })
    }

    async fn get_tree(&self, tree: &ObjectId) -> Result<BTreeMap<String, ObjectId>, StoreError> {
        let body: TreeResponse = self
            .get_json(&self.repo_url(&format!("/git/trees/{tree}?recursive=1")))
            .await?;
        if body.truncated {
            return Err(StoreError::Unexpected(format!(
                "tree {tree} listing was truncated"
            )));
        }
        Ok(body
            .tree
            .into_iter()
            .filter(|e| e.kind == "blob")
            .map(|e| (e.path, ObjectId::new(e.sha)))
            .collect())
    }

    async fn get_blob(&self, blob: &ObjectId) -> Result<Bytes, StoreError> {
        let body: BlobResponse = self
            .get_json(&self.repo_url(&format!("/git/blobs/{blob}")))
            .await?;
        match body.encoding.as_str() {
            "base64" => {
                let compact: String = body.content.split_whitespace().collect();
                STANDARD
                    .decode(compact)
                    .map(Bytes::from)
                    .map_err(|e| StoreError::Unexpected(format!("blob {blob}: {e}")))
            }
            "utf-8" => Ok(Bytes::from(body.content)),
            other => Err(StoreError::Unexpected(format!(
                "blob {blob}: unsupported encoding '{other}'"
            ))),
        }
    }

    async fn create_blob(&self, content: Bytes) -> Result<ObjectId, StoreError> {
        let body = json!({
            "content": STANDARD.encode(&content),
            "encoding": "base64",
        });
        let created: ShaRef = self.post_json(&self.repo_url("/git/blobs"), &body).await?;
        Ok(ObjectId::new(created.sha))
    }

    async fn create_tree(
        &self,
        base_tree: &ObjectId,
        changes: &[TreeChange],
    ) -> Result<ObjectId, StoreError> {
        let entries: Vec<NewTreeEntry<'_>> = changes
            .iter()
            .map(|change| NewTreeEntry {
                path: change.path(),
                mode: "100644",
                kind: "blob",
                sha: match change {
                    TreeChange::Upsert { blob, .. } => Some(blob.as_str()),
                    TreeChange::Delete { .. } => None,
                },
            })
            .collect();
        let body = json!({ "base_tree": base_tree, "tree": entries });
        let created: ShaRef = self.post_json(&self.repo_url("/git/trees"), &body).await?;
        Ok(ObjectId::new(created.sha))
    }

    async fn create_commit(
        &self,
        message: &str,
        tree: &ObjectId,
        parent: &ObjectId,
    ) -> Result<ObjectId, StoreError> {
        let body = json!({ "message": message, "tree": tree, "parents": [parent] });
        let created: ShaRef = self.post_json(&self.repo_url("/git/commits"), &body).await?;
        Ok(ObjectId::new(created.sha))
    }

    async fn update_ref(
        &self,
        branch: &str,
        expected: &ObjectId,
        new: &ObjectId,
    ) -> Result<RefUpdate, StoreError> {
        let url = self.repo_url(&format!("/git/refs/heads/{branch}"));
        let body = json!({ "sha": new, "force": false });
        let response = self.send(self.client.patch(url).json(&body)).await?;
        if matches!(
            response.status(),
            StatusCode::CONFLICT | StatusCode::UNPROCESSABLE_ENTITY
        ) {
            let message = error_message(response).await;
            warn!(branch, expected = %expected, %message, "Ref update rejected");
            return Ok(RefUpdate::Conflict { actual: None });
        }
        expect_success(response).await?;
        Ok(RefUpdate::Advanced)
    }

    fn supports_compare_and_swap(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repo_url_trims_trailing_slash() {
        let store = GithubStore::new(
            "https://api.github.com/",
            "t".into(),
            "someone".into(),
            "career-corpus-memory".into(),
        )
        .unwrap();
        assert_eq!(
            store.repo_url("/git/blobs"),
            "https://api.github.com/repos/someone/career-corpus-memory/git/blobs"
        );
    }

    #[test]
    fn test_delete_entries_serialize_null_sha() {
        let entry = NewTreeEntry {
            path: "CareerCorpus/corpus_project_p1.json",
            mode: "100644",
            kind: "blob",
            sha: None,
        };
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["sha"], serde_json::Value::Null);
        assert_eq!(value["type"], "blob");
    }

    #[test]
    fn test_store_reports_no_native_cas() {
        let store = GithubStore::new("http://localhost", "t".into(), "o".into(), "r".into()).unwrap();
        assert!(!store.supports_compare_and_swap());
    }
}
