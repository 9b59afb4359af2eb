use anyhow::Context;
use async_trait::async_trait;
use tracing::{debug, warn};

use crate::datastore::DataStore;
use crate::store::{BackendKind, Persistence, Synced};
use crate::task::{Task, TaskId};

pub const TASKS_KEY: &str = "study-tracker-items-v1";

/// Keeps the whole list as one JSON array in a local storage slot.
#[derive(Debug)]
pub struct LocalBackend {
    store: DataStore,
}

impl LocalBackend {
    pub fn new(store: DataStore) -> Self {
        Self { store }
    }

    fn save(&self, tasks: &[Task]) -> anyhow::Result<()> {
        let json = serde_json::to_string(tasks)?;
        self.store
            .set_item(TASKS_KEY, &json)
            .context("failed to save tasks to local storage")?;
        debug!(count = tasks.len(), "saved tasks locally");
        Ok(())
    }

    fn commit(&self, next: Vec<Task>) -> anyhow::Result<Synced> {
        self.save(&next)?;
        Ok(Synced::Collection(next))
    }
}

#[async_trait]
impl Persistence for LocalBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    #[tracing::instrument(skip(self))]
    async fn fetch(&self) -> anyhow::Result<Vec<Task>> {
        let Some(raw) = self.store.get_item(TASKS_KEY)? else {
            debug!("no saved tasks; starting empty");
            return Ok(Vec::new());
        };
        match serde_json::from_str::<Vec<Task>>(&raw) {
            Ok(tasks) => Ok(tasks),
            Err(error) => {
                warn!(%error, "failed parsing saved tasks; starting empty");
                Ok(Vec::new())
            }
        }
    }

    async fn create(&self, current: &[Task], title: &str) -> anyhow::Result<Synced> {
        let mut next = Vec::with_capacity(current.len() + 1);
        next.push(Task::new_local(title.to_string()));
        next.extend_from_slice(current);
        self.commit(next)
    }

    async fn toggle(&self, current: &[Task], id: &TaskId) -> anyhow::Result<Synced> {
        let Some(next) = updated(current, id, |task| task.done = !task.done) else {
            return Ok(Synced::Unchanged);
        };
        self.commit(next)
    }

    async fn rename(&self, current: &[Task], id: &TaskId, title: &str) -> anyhow::Result<Synced> {
        let Some(next) = updated(current, id, |task| task.title = title.to_string()) else {
            return Ok(Synced::Unchanged);
        };
        self.commit(next)
    }

    async fn delete(&self, current: &[Task], id: &TaskId) -> anyhow::Result<Synced> {
        let next: Vec<Task> = current.iter().filter(|t| &t.id != id).cloned().collect();
        self.commit(next)
    }

    async fn reorder(&self, ordered: &[Task]) -> anyhow::Result<()> {
        self.save(ordered)
    }
}

fn updated(current: &[Task], id: &TaskId, edit: impl FnOnce(&mut Task)) -> Option<Vec<Task>> {
    let idx = current.iter().position(|t| &t.id == id)?;
    let mut next = current.to_vec();
    edit(&mut next[idx]);
    Some(next)
}
