use std::time::Duration;

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use reqwest::{RequestBuilder, Url};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::identity::UserId;
use crate::store::{BackendKind, Persistence, Synced};
use crate::task::{Task, TaskId};

const USER_AGENT: &str = concat!("studytrack/", env!("CARGO_PKG_VERSION"));

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateBody<'a> {
    title: &'a str,
    done: bool,
    user_id: &'a UserId,
}

#[derive(Serialize)]
struct RenameBody<'a> {
    title: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ReorderBody<'a> {
    ordered_ids: Vec<&'a TaskId>,
}

/// Talks to the per-user `/api/tasks` collection of a tracker backend.
#[derive(Debug)]
pub struct RemoteBackend {
    client: reqwest::Client,
    base: Url,
    user: UserId,
    background: TaskTracker,
}

impl RemoteBackend {
    pub fn new(api_base: &str, user: UserId, timeout: Duration) -> anyhow::Result<Self> {
        let trimmed = api_base.trim();
        if trimmed.is_empty() {
            anyhow::bail!("API base URL is empty; set api.base or STUDYTRACK_API_BASE");
        }
        let base =
            Url::parse(trimmed).with_context(|| format!("invalid API base URL: {trimmed}"))?;
        if base.cannot_be_a_base() {
            anyhow::bail!("API base URL cannot carry a path: {trimmed}");
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .context("failed building HTTP client for task sync")?;

        info!(base = %base, user_id = %user, "remote backend ready");
        Ok(Self {
            client,
            base,
            user,
            background: TaskTracker::new(),
        })
    }

    fn endpoint(&self, tail: &[&str]) -> anyhow::Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|()| anyhow!("API base URL cannot carry a path: {}", self.base))?
            .pop_if_empty()
            .extend(["api", "tasks"])
            .extend(tail);
        Ok(url)
    }

    fn collection(&self) -> anyhow::Result<Url> {
        let mut url = self.endpoint(&[])?;
        url.query_pairs_mut()
            .append_pair("userId", self.user.as_str());
        Ok(url)
    }

    fn record(&self, id: &TaskId) -> anyhow::Result<Url> {
        let segment = id.to_string();
        self.endpoint(&[segment.as_str()])
    }

    fn with_json<T: Serialize>(
        &self,
        request: RequestBuilder,
        body: &T,
    ) -> anyhow::Result<RequestBuilder> {
        let payload = serde_json::to_string(body).context("failed encoding request body")?;
        Ok(request
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(payload))
    }
}

#[async_trait]
impl Persistence for RemoteBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Remote
    }

    #[tracing::instrument(skip(self))]
    async fn fetch(&self) -> anyhow::Result<Vec<Task>> {
        let url = self.collection()?;
        let body = execute(self.client.get(url), "list").await?;
        let tasks: Vec<Task> = decode(&body, "list")?;
        debug!(count = tasks.len(), "fetched tasks");
        Ok(tasks)
    }

    #[tracing::instrument(skip(self, _current))]
    async fn create(&self, _current: &[Task], title: &str) -> anyhow::Result<Synced> {
        let url = self.collection()?;
        let body = CreateBody {
            title,
            done: false,
            user_id: &self.user,
        };
        let request = self.with_json(self.client.post(url), &body)?;
        let created = execute(request, "create").await?;
        debug!(bytes = created.len(), "create acknowledged; list needs a refresh");
        Ok(Synced::Refetch)
    }

    #[tracing::instrument(skip(self, _current, id), fields(id = %id))]
    async fn toggle(&self, _current: &[Task], id: &TaskId) -> anyhow::Result<Synced> {
        let url = self.record(id)?;
        let body = execute(self.client.patch(url), "toggle").await?;
        Ok(Synced::Record(decode(&body, "toggle")?))
    }

    #[tracing::instrument(skip(self, _current, id), fields(id = %id))]
    async fn rename(&self, _current: &[Task], id: &TaskId, title: &str) -> anyhow::Result<Synced> {
        let url = self.record(id)?;
        let request = self.with_json(self.client.put(url), &RenameBody { title })?;
        let body = execute(request, "edit").await?;
        Ok(Synced::Record(decode(&body, "edit")?))
    }

    #[tracing::instrument(skip(self, _current, id), fields(id = %id))]
    async fn delete(&self, _current: &[Task], id: &TaskId) -> anyhow::Result<Synced> {
        let url = self.record(id)?;
        execute(self.client.delete(url), "delete").await?;
        Ok(Synced::Removed(id.clone()))
    }

    /// Fire-and-forget: the PUT runs detached and its outcome is only logged.
    #[tracing::instrument(skip(self, ordered), fields(count = ordered.len()))]
    async fn reorder(&self, ordered: &[Task]) -> anyhow::Result<()> {
        let url = self.endpoint(&["reorder"])?;
        let body = ReorderBody {
            ordered_ids: ordered.iter().map(|t| &t.id).collect(),
        };
        let request = self.with_json(self.client.put(url), &body)?;
        let count = ordered.len();

        self.background.spawn(async move {
            match execute(request, "reorder").await {
                Ok(_) => debug!(count, "persisted task order"),
                Err(err) => warn!(
                    error = %format!("{err:#}"),
                    "failed to persist task order; ignoring"
                ),
            }
        });
        Ok(())
    }

    async fn flush(&self) {
        self.background.close();
        self.background.wait().await;
        self.background.reopen();
    }
}

async fn execute(request: RequestBuilder, label: &str) -> anyhow::Result<String> {
    let response = request
        .send()
        .await
        .with_context(|| format!("{label} request failed"))?;

    let status = response.status();
    let url = response.url().clone();
    let body = response
        .text()
        .await
        .with_context(|| format!("failed reading {label} response from {url}"))?;

    if !status.is_success() {
        let snippet: String = body.chars().take(200).collect();
        return Err(anyhow!("{label} {url} returned HTTP {status}: {snippet}"));
    }
    Ok(body)
}

fn decode<T: DeserializeOwned>(body: &str, label: &str) -> anyhow::Result<T> {
    serde_json::from_str(body).with_context(|| format!("failed decoding {label} response"))
}
