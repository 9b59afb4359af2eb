pub mod cli;
pub mod commands;
pub mod config;
pub mod datastore;
pub mod filter;
pub mod identity;
pub mod local;
pub mod remote;
pub mod render;
pub mod store;
pub mod task;

use std::ffi::OsString;
use std::io;

use anyhow::Context;
use clap::Parser;
use tracing::{
  debug,
  info
};

use crate::config::BackendChoice;
use crate::store::{
  LoadPolicy,
  Persistence,
  TaskStore
};

#[tracing::instrument(skip_all)]
pub fn run(
  raw_args: Vec<OsString>
) -> anyhow::Result<()> {
  let pre =
    cli::preprocess_args(&raw_args)?;
  let cli = cli::GlobalCli::parse_from(
    pre.cleaned_args
  );

  cli::init_tracing(
    cli.verbose,
    cli.quiet
  )?;

  info!(
    verbose = cli.verbose,
    quiet = cli.quiet,
    "starting study tracker"
  );
  debug!(?pre.rc_overrides, "preprocessed rc overrides");

  let mut cfg = config::Config::load(
    cli.studyrc.as_deref()
  )?;
  cfg.apply_overrides(
    pre.rc_overrides.into_iter().chain(
      cli
        .rc_overrides
        .into_iter()
        .map(|kv| (kv.key, kv.value))
    )
  );
  if let Some(backend) = cli.backend {
    cfg.apply_overrides([(
      "backend".to_string(),
      backend
    )]);
  }

  let data_dir =
    config::resolve_data_dir(
      &cfg,
      cli.data.as_deref()
    )
    .context(
      "failed to resolve data \
       directory"
    )?;

  let slots =
    datastore::DataStore::open(
      &data_dir
    )
    .with_context(|| {
      format!(
        "failed to open datastore at \
         {}",
        data_dir.display()
      )
    })?;

  let command =
    cli.command.unwrap_or_default();
  let choice = cfg.backend()?;
  let user = if choice
    == BackendChoice::Remote
    || command == cli::Command::Whoami
  {
    Some(
      identity::UserId::load_or_create(
        &slots
      )?
    )
  } else {
    None
  };

  let backend: Box<dyn Persistence> =
    match choice {
      | BackendChoice::Local => Box::new(
        local::LocalBackend::new(slots)
      ),
      | BackendChoice::Remote => {
        let api_base = cfg
          .get("api.base")
          .unwrap_or_default();
        let user = user.clone().context(
          "remote backend needs a user \
           id"
        )?;
        Box::new(
          remote::RemoteBackend::new(
            &api_base,
            user,
            cfg.http_timeout()?
          )?
        )
      }
    };

  let policy = LoadPolicy {
    retry_delay: cfg.retry_delay()?
  };
  let renderer =
    render::Renderer::new(&cfg)?;
  let mut store =
    TaskStore::new(backend, policy);

  let runtime =
    tokio::runtime::Builder::new_current_thread()
      .enable_all()
      .build()
      .context(
        "failed to build async runtime"
      )?;

  runtime.block_on(async {
    if command != cli::Command::Whoami {
      let state = store.boot().await;
      debug!(?state, "store booted");
    }
    let mut out = io::stdout().lock();
    let outcome = commands::dispatch(
      &mut store,
      &renderer,
      user.as_ref(),
      command,
      &mut out
    )
    .await;
    store.flush().await;
    outcome
  })?;

  info!("done");
  Ok(())
}
