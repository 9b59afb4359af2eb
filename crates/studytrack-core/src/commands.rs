use std::io::Write;

use anyhow::{Context, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::cli::Command;
use crate::filter::View;
use crate::identity::UserId;
use crate::render::{Renderer, WAKING_UP_NOTICE};
use crate::store::{BackendKind, Direction, LoadState, TaskStore};
use crate::task::{Task, TaskId};

/// Runs one CLI command against a booted store, writing results to `out`.
#[instrument(skip(store, renderer, user, out))]
pub async fn dispatch<W: Write>(
    store: &mut TaskStore,
    renderer: &Renderer,
    user: Option<&UserId>,
    command: Command,
    out: &mut W,
) -> anyhow::Result<()> {
    debug!(state = ?store.state(), "dispatching command");

    match command {
        Command::List { view } => cmd_list(store, renderer, view, out),
        Command::Export { view } => cmd_export(store, view, out),
        Command::Whoami => cmd_whoami(store, user, out),
        Command::Add { title } => cmd_add(store, &title.join(" "), out).await,
        Command::Toggle { task } => cmd_toggle(store, &task, out).await,
        Command::Edit { task, title } => cmd_edit(store, &task, &title.join(" "), out).await,
        Command::Delete { task } => cmd_delete(store, &task, out).await,
        Command::Up { task } => cmd_move(store, &task, Direction::Up, out).await,
        Command::Down { task } => cmd_move(store, &task, Direction::Down, out).await,
    }
}

/// Resolves a user-supplied task reference.
///
/// Exact ids win, then 1-based positions in the full list. Anything else is
/// passed through as a raw id so the backend can decide.
pub fn resolve_task_ref(tasks: &[Task], reference: &str) -> anyhow::Result<TaskId> {
    let reference = reference.trim();
    if reference.is_empty() {
        return Err(anyhow!("task reference cannot be empty"));
    }

    if let Some(task) = tasks.iter().find(|t| t.id.matches_ref(reference)) {
        return Ok(task.id.clone());
    }

    if let Ok(position) = reference.parse::<usize>()
        && let Some(task) = position.checked_sub(1).and_then(|idx| tasks.get(idx))
    {
        debug!(position, id = %task.id, "resolved task by position");
        return Ok(task.id.clone());
    }

    Ok(TaskId::parse_ref(reference))
}

fn cmd_list<W: Write>(
    store: &TaskStore,
    renderer: &Renderer,
    view: View,
    out: &mut W,
) -> anyhow::Result<()> {
    info!(%view, "command list");
    if store.state() == LoadState::Unavailable {
        return renderer.write_notice(out, WAKING_UP_NOTICE);
    }
    renderer.write_tasks(out, store.tasks(), &store.visible(view))
}

fn cmd_export<W: Write>(store: &TaskStore, view: View, out: &mut W) -> anyhow::Result<()> {
    info!(%view, "command export");
    if store.state() == LoadState::Unavailable {
        return Err(anyhow!("tasks are unavailable; the backend did not answer"));
    }
    let json = serde_json::to_string_pretty(&store.visible(view))
        .context("failed encoding tasks")?;
    writeln!(out, "{json}")?;
    Ok(())
}

fn cmd_whoami<W: Write>(
    store: &TaskStore,
    user: Option<&UserId>,
    out: &mut W,
) -> anyhow::Result<()> {
    match user {
        Some(user) => writeln!(out, "{user}")?,
        None => writeln!(out, "no user id ({} backend)", store.backend_kind())?,
    }
    Ok(())
}

async fn cmd_add<W: Write>(store: &mut TaskStore, title: &str, out: &mut W) -> anyhow::Result<()> {
    info!("command add");
    store.set_compose_text(title);
    if !store.submit().await? {
        writeln!(out, "Nothing added: title is blank.")?;
    } else if store.state() == LoadState::Unavailable {
        writeln!(out, "Added task; the list could not be refreshed yet.")?;
    } else {
        writeln!(out, "Added task ({} total).", store.tasks().len())?;
    }
    Ok(())
}

async fn cmd_toggle<W: Write>(
    store: &mut TaskStore,
    reference: &str,
    out: &mut W,
) -> anyhow::Result<()> {
    info!("command toggle");
    let id = target(store, reference)?;
    store.toggle(&id).await?;
    match store.get(&id) {
        Some(task) if task.done => writeln!(out, "Done: {}", task.title)?,
        Some(task) => writeln!(out, "Not done: {}", task.title)?,
        None => writeln!(out, "No task {id}.")?,
    }
    Ok(())
}

async fn cmd_edit<W: Write>(
    store: &mut TaskStore,
    reference: &str,
    title: &str,
    out: &mut W,
) -> anyhow::Result<()> {
    info!("command edit");
    let id = target(store, reference)?;
    if !store.begin_edit(&id) && store.backend_kind() == BackendKind::Local {
        writeln!(out, "No task {id}.")?;
        return Ok(());
    }
    let accepted = if store.editing_id().is_some() {
        if let Some(buffer) = store.edit_text_mut() {
            *buffer = title.to_string();
        }
        store.commit_edit().await?
    } else {
        store.edit(&id, title).await?
    };

    if accepted {
        writeln!(out, "Renamed task {id}.")?;
    } else {
        writeln!(out, "Title unchanged: new title is blank.")?;
    }
    Ok(())
}

async fn cmd_delete<W: Write>(
    store: &mut TaskStore,
    reference: &str,
    out: &mut W,
) -> anyhow::Result<()> {
    info!("command delete");
    let id = target(store, reference)?;
    let before = store.tasks().len();
    store.remove(&id).await?;
    if store.tasks().len() < before || store.backend_kind() == BackendKind::Remote {
        writeln!(out, "Deleted task {id}.")?;
    } else {
        writeln!(out, "No task {id}.")?;
    }
    Ok(())
}

async fn cmd_move<W: Write>(
    store: &mut TaskStore,
    reference: &str,
    direction: Direction,
    out: &mut W,
) -> anyhow::Result<()> {
    info!(?direction, "command move");
    let id = target(store, reference)?;
    if store.move_task(&id, direction).await? {
        let position = store
            .tasks()
            .iter()
            .position(|t| t.id == id)
            .map_or(0, |idx| idx + 1);
        writeln!(out, "Moved task {id} to position {position}.")?;
    } else {
        writeln!(out, "Task {id} stays put.")?;
    }
    Ok(())
}

fn target(store: &TaskStore, reference: &str) -> anyhow::Result<TaskId> {
    let id = resolve_task_ref(store.tasks(), reference)?;
    if store.get(&id).is_none() {
        warn!(%id, backend = %store.backend_kind(), "no loaded task matches reference");
    }
    Ok(id)
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::time::Duration;

    use serde_json::json;
    use tempfile::tempdir;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::{dispatch, resolve_task_ref};
    use crate::cli::Command;
    use crate::config::Config;
    use crate::datastore::DataStore;
    use crate::filter::View;
    use crate::identity::UserId;
    use crate::local::LocalBackend;
    use crate::remote::RemoteBackend;
    use crate::render::{Renderer, WAKING_UP_NOTICE};
    use crate::store::{LoadPolicy, LoadState, TaskStore};
    use crate::task::{Task, TaskId};

    fn listed(ids: &[TaskId]) -> Vec<Task> {
        ids.iter()
            .map(|id| {
                let mut task = Task::new_local(format!("task {id}"));
                task.id = id.clone();
                task
            })
            .collect()
    }

    fn plain() -> Renderer {
        let mut cfg = Config::defaults();
        cfg.apply_overrides([("color".to_string(), "off".to_string())]);
        Renderer::new(&cfg).expect("renderer")
    }

    fn fast() -> LoadPolicy {
        LoadPolicy {
            retry_delay: Duration::from_millis(5),
        }
    }

    fn local_store(dir: &Path) -> TaskStore {
        let slots = DataStore::open(dir).expect("open datastore");
        TaskStore::new(Box::new(LocalBackend::new(slots)), fast())
    }

    fn remote_store(server: &MockServer) -> TaskStore {
        let backend = RemoteBackend::new(&server.uri(), UserId::new("u-1"), Duration::from_secs(5))
            .expect("remote backend");
        TaskStore::new(Box::new(backend), fast())
    }

    async fn run(store: &mut TaskStore, command: Command) -> anyhow::Result<String> {
        let mut out = Vec::new();
        dispatch(store, &plain(), None, command, &mut out).await?;
        Ok(String::from_utf8(out).expect("utf8"))
    }

    #[test]
    fn exact_ids_beat_positions() {
        let tasks = listed(&[TaskId::number(2), TaskId::number(9)]);
        assert_eq!(resolve_task_ref(&tasks, "2").expect("id"), TaskId::number(2));
        assert_eq!(resolve_task_ref(&tasks, "1").expect("position"), TaskId::number(2));
        assert_eq!(resolve_task_ref(&tasks, "9").expect("id"), TaskId::number(9));
    }

    #[test]
    fn unknown_refs_pass_through() {
        let tasks = listed(&[TaskId::Text("a".to_string())]);
        assert_eq!(resolve_task_ref(&tasks, "77").expect("raw"), TaskId::number(77));
        assert_eq!(resolve_task_ref(&tasks, "-4").expect("raw"), TaskId::number(-4));
        assert_eq!(
            resolve_task_ref(&tasks, "zz").expect("raw"),
            TaskId::Text("zz".to_string())
        );
        assert!(resolve_task_ref(&tasks, "  ").is_err());
    }

    #[tokio::test]
    async fn local_commands_drive_the_list() {
        let temp = tempdir().expect("tempdir");
        let mut store = local_store(temp.path());
        store.boot().await;

        let added = run(&mut store, Command::Add { title: vec!["Read".into(), "ch.1".into()] })
            .await
            .expect("add");
        assert_eq!(added, "Added task (1 total).\n");

        let toggled = run(&mut store, Command::Toggle { task: "1".to_string() })
            .await
            .expect("toggle");
        assert_eq!(toggled, "Done: Read ch.1\n");

        let active = run(&mut store, Command::List { view: View::Active })
            .await
            .expect("list");
        assert_eq!(active, "No tasks.\n");

        let done = run(&mut store, Command::List { view: View::Done })
            .await
            .expect("list");
        assert!(done.contains("Read ch.1"));

        let missing = run(
            &mut store,
            Command::Edit { task: "ghost".to_string(), title: vec!["x".into()] },
        )
        .await
        .expect("edit");
        assert_eq!(missing, "No task ghost.\n");
    }

    #[tokio::test]
    async fn unavailable_store_shows_waking_notice_and_refuses_export() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/tasks"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let mut store = remote_store(&server);
        assert_eq!(store.boot().await, LoadState::Unavailable);

        let listing = run(&mut store, Command::default()).await.expect("list");
        assert_eq!(listing.trim_end(), WAKING_UP_NOTICE);

        let err = run(&mut store, Command::Export { view: View::All })
            .await
            .expect_err("export while unavailable");
        assert!(format!("{err:#}").contains("unavailable"));
    }

    #[tokio::test]
    async fn remote_edit_reaches_ids_missing_from_the_list() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/tasks"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/api/tasks/42"))
            .and(body_json(json!({"title": "Lab report"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                json!({"id": 42, "title": "Lab report", "done": false}),
            ))
            .expect(1)
            .mount(&server)
            .await;

        let mut store = remote_store(&server);
        store.boot().await;

        let edited = run(
            &mut store,
            Command::Edit {
                task: "42".to_string(),
                title: vec!["Lab".into(), "report".into()],
            },
        )
        .await
        .expect("edit");
        assert_eq!(edited, "Renamed task 42.\n");
    }
}
