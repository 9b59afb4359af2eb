use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use crate::filter::View;
use crate::task::{Task, TaskId, normalize_title};

/// How the store should fold a backend's answer into memory.
#[derive(Debug, Clone, PartialEq)]
pub enum Synced {
    /// Replace the whole collection.
    Collection(Vec<Task>),
    /// Replace the record with the same id, if present.
    Record(Task),
    /// Drop the record with this id.
    Removed(TaskId),
    /// The write landed; re-read the collection to pick it up.
    Refetch,
    Unchanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Local,
    Remote,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => f.write_str("local"),
            Self::Remote => f.write_str("remote"),
        }
    }
}

/// A persistence target for the task list.
///
/// Mutations receive the current in-memory collection and report back what
/// changed. Titles arrive already trimmed and non-empty.
#[async_trait]
pub trait Persistence: Send + Sync {
    fn kind(&self) -> BackendKind;

    async fn fetch(&self) -> anyhow::Result<Vec<Task>>;

    async fn create(&self, current: &[Task], title: &str) -> anyhow::Result<Synced>;

    async fn toggle(&self, current: &[Task], id: &TaskId) -> anyhow::Result<Synced>;

    async fn rename(&self, current: &[Task], id: &TaskId, title: &str) -> anyhow::Result<Synced>;

    async fn delete(&self, current: &[Task], id: &TaskId) -> anyhow::Result<Synced>;

    /// Persists `ordered` as the new display order.
    async fn reorder(&self, ordered: &[Task]) -> anyhow::Result<()>;

    /// Waits for detached background work started by this backend.
    async fn flush(&self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    Loading,
    Ready,
    /// Initial load and its single retry both failed.
    Unavailable,
}

#[derive(Debug, Clone, Copy)]
pub struct LoadPolicy {
    pub retry_delay: Duration,
}

impl Default for LoadPolicy {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
}

impl Direction {
    pub fn offset(self) -> isize {
        match self {
            Self::Up => -1,
            Self::Down => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct EditBuffer {
    id: TaskId,
    text: String,
}

pub struct TaskStore {
    backend: Box<dyn Persistence>,
    policy: LoadPolicy,
    state: LoadState,
    tasks: Vec<Task>,
    compose: String,
    editing: Option<EditBuffer>,
}

impl fmt::Debug for TaskStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskStore")
            .field("backend", &self.backend.kind())
            .field("state", &self.state)
            .field("tasks", &self.tasks.len())
            .finish()
    }
}

impl TaskStore {
    pub fn new(backend: Box<dyn Persistence>, policy: LoadPolicy) -> Self {
        Self {
            backend,
            policy,
            state: LoadState::Loading,
            tasks: Vec::new(),
            compose: String::new(),
            editing: None,
        }
    }

    pub fn state(&self) -> LoadState {
        self.state
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn get(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.iter().find(|t| &t.id == id)
    }

    pub fn visible(&self, view: View) -> Vec<&Task> {
        view.apply(&self.tasks)
    }

    /// Initial load: one attempt, then one retry after the policy delay.
    #[instrument(skip(self), fields(backend = %self.backend.kind()))]
    pub async fn boot(&mut self) -> LoadState {
        self.state = LoadState::Loading;

        let first = match self.reload().await {
            Ok(()) => return self.state,
            Err(err) => err,
        };
        warn!(
            error = %format!("{first:#}"),
            delay_ms = u64::try_from(self.policy.retry_delay.as_millis()).unwrap_or(u64::MAX),
            "backend likely sleeping, retrying once"
        );
        tokio::time::sleep(self.policy.retry_delay).await;

        if let Err(err) = self.reload().await {
            warn!(error = %format!("{err:#}"), "still waking up; giving up on initial load");
            self.state = LoadState::Unavailable;
        }
        self.state
    }

    /// Replaces the collection with a fresh read from the backend.
    #[instrument(skip(self))]
    pub async fn reload(&mut self) -> anyhow::Result<()> {
        let fetched = self.backend.fetch().await?;
        self.replace_all(fetched);
        Ok(())
    }

    /// Adds a task unless `title` is blank; returns whether it was accepted.
    ///
    /// Once the backend has accepted the task this returns `Ok(true)` even if
    /// the follow-up refresh fails; the store is then marked unavailable.
    #[instrument(skip(self))]
    pub async fn add(&mut self, title: &str) -> anyhow::Result<bool> {
        let Some(title) = normalize_title(title) else {
            debug!("rejected blank title");
            return Ok(false);
        };
        let synced = self.backend.create(&self.tasks, &title).await?;
        self.settle(synced).await;
        info!(count = self.tasks.len(), "task added");
        Ok(true)
    }

    #[instrument(skip(self, id), fields(id = %id))]
    pub async fn toggle(&mut self, id: &TaskId) -> anyhow::Result<()> {
        let synced = self.backend.toggle(&self.tasks, id).await?;
        self.settle(synced).await;
        Ok(())
    }

    /// Retitles a task unless `title` is blank; returns whether it was accepted.
    #[instrument(skip(self, id), fields(id = %id))]
    pub async fn edit(&mut self, id: &TaskId, title: &str) -> anyhow::Result<bool> {
        let Some(title) = normalize_title(title) else {
            debug!("rejected blank title");
            return Ok(false);
        };
        let synced = self.backend.rename(&self.tasks, id, &title).await?;
        self.settle(synced).await;
        Ok(true)
    }

    #[instrument(skip(self, id), fields(id = %id))]
    pub async fn remove(&mut self, id: &TaskId) -> anyhow::Result<()> {
        let synced = self.backend.delete(&self.tasks, id).await?;
        self.settle(synced).await;
        if self.editing.as_ref().is_some_and(|e| &e.id == id) {
            self.editing = None;
        }
        Ok(())
    }

    /// Swaps a task with its neighbour; returns false when nothing moved.
    #[instrument(skip(self, id), fields(id = %id))]
    pub async fn move_task(&mut self, id: &TaskId, direction: Direction) -> anyhow::Result<bool> {
        let Some(reordered) = swapped(&self.tasks, id, direction) else {
            debug!("move out of bounds or unknown id; ignoring");
            return Ok(false);
        };
        self.tasks = reordered;
        self.backend.reorder(&self.tasks).await?;
        Ok(true)
    }

    pub fn compose_text(&self) -> &str {
        &self.compose
    }

    pub fn set_compose_text(&mut self, text: impl Into<String>) {
        self.compose = text.into();
    }

    /// Adds the composed text as a task, clearing it once accepted.
    pub async fn submit(&mut self) -> anyhow::Result<bool> {
        let text = self.compose.clone();
        let added = self.add(&text).await?;
        if added {
            self.compose.clear();
        }
        Ok(added)
    }

    /// Enters edit mode for `id`, seeding the buffer with its current title.
    pub fn begin_edit(&mut self, id: &TaskId) -> bool {
        let Some(task) = self.get(id) else {
            return false;
        };
        self.editing = Some(EditBuffer {
            id: task.id.clone(),
            text: task.title.clone(),
        });
        true
    }

    pub fn editing_id(&self) -> Option<&TaskId> {
        self.editing.as_ref().map(|e| &e.id)
    }

    pub fn edit_text_mut(&mut self) -> Option<&mut String> {
        self.editing.as_mut().map(|e| &mut e.text)
    }

    pub fn cancel_edit(&mut self) {
        self.editing = None;
    }

    /// Saves the edit buffer and leaves edit mode, even when the text was blank.
    pub async fn commit_edit(&mut self) -> anyhow::Result<bool> {
        let Some(buffer) = self.editing.take() else {
            return Ok(false);
        };
        self.edit(&buffer.id, &buffer.text).await
    }

    pub async fn flush(&self) {
        self.backend.flush().await;
    }

    async fn settle(&mut self, synced: Synced) {
        let refetch = match synced {
            Synced::Collection(tasks) => {
                self.replace_all(tasks);
                false
            }
            Synced::Record(updated) => {
                match self.tasks.iter_mut().find(|t| t.id == updated.id) {
                    Some(slot) => {
                        *slot = updated;
                        false
                    }
                    None => {
                        warn!(id = %updated.id, "updated record matches no loaded task; refreshing");
                        true
                    }
                }
            }
            Synced::Removed(id) => {
                self.tasks.retain(|t| t.id != id);
                false
            }
            Synced::Refetch => true,
            Synced::Unchanged => false,
        };

        if refetch && let Err(err) = self.reload().await {
            warn!(error = %format!("{err:#}"), "refresh after write failed; list may be stale");
            self.state = LoadState::Unavailable;
        }
    }

    fn replace_all(&mut self, tasks: Vec<Task>) {
        self.tasks = dedupe_ids(tasks);
        self.state = LoadState::Ready;
        debug!(count = self.tasks.len(), "collection replaced");
    }
}

/// Exchanges the task `id` with its neighbour in `direction`.
pub fn swapped(tasks: &[Task], id: &TaskId, direction: Direction) -> Option<Vec<Task>> {
    let idx = tasks.iter().position(|t| &t.id == id)?;
    let target = idx.checked_add_signed(direction.offset())?;
    if target >= tasks.len() {
        return None;
    }
    let mut copy = tasks.to_vec();
    copy.swap(idx, target);
    Some(copy)
}

fn dedupe_ids(tasks: Vec<Task>) -> Vec<Task> {
    let mut seen = HashSet::with_capacity(tasks.len());
    let before = tasks.len();
    let kept: Vec<Task> = tasks
        .into_iter()
        .filter(|t| seen.insert(t.id.clone()))
        .collect();
    if kept.len() != before {
        warn!(
            before,
            after = kept.len(),
            "dropped tasks with duplicate ids"
        );
    }
    kept
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use super::{
        BackendKind, Direction, LoadPolicy, LoadState, Persistence, Synced, TaskStore, swapped,
    };
    use crate::task::{Task, TaskId};

    /// In-memory backend whose fetch fails a configurable number of times.
    #[derive(Default)]
    struct Scripted {
        failures_left: AtomicUsize,
        fetches: AtomicUsize,
        saved: Mutex<Vec<Task>>,
    }

    impl Scripted {
        fn failing(times: usize) -> Self {
            Self {
                failures_left: AtomicUsize::new(times),
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl Persistence for Scripted {
        fn kind(&self) -> BackendKind {
            BackendKind::Local
        }

        async fn fetch(&self) -> anyhow::Result<Vec<Task>> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                anyhow::bail!("connection refused");
            }
            Ok(self.saved.lock().expect("lock").clone())
        }

        async fn create(&self, current: &[Task], title: &str) -> anyhow::Result<Synced> {
            let mut next = vec![Task::new_local(title.to_string())];
            next.extend_from_slice(current);
            Ok(Synced::Collection(next))
        }

        async fn toggle(&self, current: &[Task], id: &TaskId) -> anyhow::Result<Synced> {
            Ok(match current.iter().find(|t| &t.id == id) {
                Some(task) => {
                    let mut flipped = task.clone();
                    flipped.done = !flipped.done;
                    Synced::Record(flipped)
                }
                None => Synced::Unchanged,
            })
        }

        async fn rename(&self, current: &[Task], id: &TaskId, title: &str) -> anyhow::Result<Synced> {
            Ok(match current.iter().find(|t| &t.id == id) {
                Some(task) => {
                    let mut renamed = task.clone();
                    renamed.title = title.to_string();
                    Synced::Record(renamed)
                }
                None => Synced::Unchanged,
            })
        }

        async fn delete(&self, _current: &[Task], id: &TaskId) -> anyhow::Result<Synced> {
            Ok(Synced::Removed(id.clone()))
        }

        async fn reorder(&self, ordered: &[Task]) -> anyhow::Result<()> {
            *self.saved.lock().expect("lock") = ordered.to_vec();
            Ok(())
        }
    }

    fn fast() -> LoadPolicy {
        LoadPolicy {
            retry_delay: Duration::from_millis(5),
        }
    }

    fn titles(store: &TaskStore) -> Vec<String> {
        store.tasks().iter().map(|t| t.title.clone()).collect()
    }

    #[tokio::test]
    async fn boot_retries_once_then_succeeds() {
        let mut store = TaskStore::new(Box::new(Scripted::failing(1)), fast());
        assert_eq!(store.boot().await, LoadState::Ready);
    }

    #[tokio::test]
    async fn boot_gives_up_after_second_failure() {
        let backend = std::sync::Arc::new(Scripted::failing(5));
        let mut store = TaskStore::new(Box::new(Shared(backend.clone())), fast());

        assert_eq!(store.boot().await, LoadState::Unavailable);
        assert_eq!(backend.fetches.load(Ordering::SeqCst), 2);
        assert!(store.tasks().is_empty());
    }

    struct Shared(std::sync::Arc<Scripted>);

    #[async_trait]
    impl Persistence for Shared {
        fn kind(&self) -> BackendKind {
            self.0.kind()
        }
        async fn fetch(&self) -> anyhow::Result<Vec<Task>> {
            self.0.fetch().await
        }
        async fn create(&self, current: &[Task], title: &str) -> anyhow::Result<Synced> {
            self.0.create(current, title).await
        }
        async fn toggle(&self, current: &[Task], id: &TaskId) -> anyhow::Result<Synced> {
            self.0.toggle(current, id).await
        }
        async fn rename(&self, current: &[Task], id: &TaskId, title: &str) -> anyhow::Result<Synced> {
            self.0.rename(current, id, title).await
        }
        async fn delete(&self, current: &[Task], id: &TaskId) -> anyhow::Result<Synced> {
            self.0.delete(current, id).await
        }
        async fn reorder(&self, ordered: &[Task]) -> anyhow::Result<()> {
            self.0.reorder(ordered).await
        }
    }

    #[tokio::test]
    async fn study_session_walkthrough() {
        let mut store = TaskStore::new(Box::new(Scripted::default()), fast());
        store.boot().await;

        assert!(store.add("Read ch.1").await.expect("add"));
        assert_eq!(store.tasks().len(), 1);
        let id = store.tasks()[0].id.clone();
        assert!(!store.tasks()[0].done);
        assert_eq!(store.tasks()[0].title, "Read ch.1");

        store.toggle(&id).await.expect("toggle");
        assert!(store.tasks()[0].done);

        assert!(!store.move_task(&id, Direction::Up).await.expect("move"));

        store.remove(&id).await.expect("remove");
        assert!(store.tasks().is_empty());
    }

    #[tokio::test]
    async fn blank_titles_change_nothing() {
        let mut store = TaskStore::new(Box::new(Scripted::default()), fast());
        store.boot().await;
        store.add("Essay outline").await.expect("add");
        let id = store.tasks()[0].id.clone();

        assert!(!store.add("   ").await.expect("blank add"));
        assert_eq!(store.tasks().len(), 1);

        assert!(!store.edit(&id, "\t").await.expect("blank edit"));
        assert_eq!(store.tasks()[0].title, "Essay outline");

        assert!(store.edit(&id, "  Essay draft ").await.expect("edit"));
        assert_eq!(store.tasks()[0].title, "Essay draft");
    }

    #[tokio::test]
    async fn toggle_flips_only_the_target() {
        let mut store = TaskStore::new(Box::new(Scripted::default()), fast());
        store.boot().await;
        for title in ["c", "b", "a"] {
            store.add(title).await.expect("add");
        }
        let before = store.tasks().to_vec();
        let target = before[1].id.clone();

        store.toggle(&target).await.expect("toggle");
        let after = store.tasks();

        assert_eq!(after.len(), before.len());
        for (old, new) in before.iter().zip(after) {
            assert_eq!(old.id, new.id);
            assert_eq!(old.title, new.title);
            assert_eq!(old.done != new.done, old.id == target);
        }
    }

    #[tokio::test]
    async fn moves_swap_neighbours_within_bounds() {
        let mut store = TaskStore::new(Box::new(Scripted::default()), fast());
        store.boot().await;
        for title in ["c", "b", "a"] {
            store.add(title).await.expect("add");
        }
        assert_eq!(titles(&store), vec!["a", "b", "c"]);
        let first = store.tasks()[0].id.clone();
        let last = store.tasks()[2].id.clone();

        assert!(!store.move_task(&first, Direction::Up).await.expect("up"));
        assert!(!store.move_task(&last, Direction::Down).await.expect("down"));
        assert_eq!(titles(&store), vec!["a", "b", "c"]);

        assert!(store.move_task(&first, Direction::Down).await.expect("down"));
        assert_eq!(titles(&store), vec!["b", "a", "c"]);

        assert!(store.move_task(&last, Direction::Up).await.expect("up"));
        assert_eq!(titles(&store), vec!["b", "c", "a"]);
    }

    #[test]
    fn swap_ignores_unknown_ids() {
        let tasks = vec![Task::new_local("x".to_string())];
        assert!(swapped(&tasks, &TaskId::random(), Direction::Down).is_none());
    }

    #[tokio::test]
    async fn duplicate_ids_from_backend_are_dropped() {
        let backend = Scripted::default();
        let dup = Task::new_local("dup".to_string());
        *backend.saved.lock().expect("lock") = vec![dup.clone(), dup];
        let mut store = TaskStore::new(Box::new(backend), fast());

        store.boot().await;
        assert_eq!(store.tasks().len(), 1);
    }

    #[tokio::test]
    async fn submit_clears_composer_only_on_success() {
        let mut store = TaskStore::new(Box::new(Scripted::default()), fast());
        store.boot().await;

        store.set_compose_text("   ");
        assert!(!store.submit().await.expect("blank"));
        assert_eq!(store.compose_text(), "   ");

        store.set_compose_text("Do math HW");
        assert!(store.submit().await.expect("submit"));
        assert_eq!(store.compose_text(), "");
        assert_eq!(titles(&store), vec!["Do math HW"]);
    }

    #[tokio::test]
    async fn edit_buffer_round_trip() {
        let mut store = TaskStore::new(Box::new(Scripted::default()), fast());
        store.boot().await;
        store.add("Notes").await.expect("add");
        let id = store.tasks()[0].id.clone();

        assert!(store.begin_edit(&id));
        assert_eq!(store.edit_text_mut().map(|t| t.clone()), Some("Notes".to_string()));
        if let Some(text) = store.edit_text_mut() {
            *text = "Notes v2".to_string();
        }
        assert!(store.commit_edit().await.expect("commit"));
        assert_eq!(store.editing_id(), None);
        assert_eq!(store.tasks()[0].title, "Notes v2");

        assert!(store.begin_edit(&id));
        store.cancel_edit();
        assert!(!store.commit_edit().await.expect("nothing to commit"));
        assert!(!store.begin_edit(&TaskId::random()));
    }
}
