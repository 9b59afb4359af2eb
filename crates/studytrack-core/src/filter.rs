use std::fmt;
use std::str::FromStr;

use anyhow::anyhow;
use clap::ValueEnum;
use tracing::trace;

use crate::task::Task;

/// Read-only projections of the task list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum View {
  #[default]
  All,
  Active,
  Done
}

impl View {
  pub fn matches(
    self,
    task: &Task
  ) -> bool {
    match self {
      | View::All => true,
      | View::Active => !task.done,
      | View::Done => task.done
    }
  }

  pub fn apply(
    self,
    tasks: &[Task]
  ) -> Vec<&Task> {
    let out: Vec<&Task> = tasks
      .iter()
      .filter(|task| self.matches(task))
      .collect();
    trace!(
      view = %self,
      total = tasks.len(),
      shown = out.len(),
      "applied view"
    );
    out
  }
}

impl FromStr for View {
  type Err = anyhow::Error;

  fn from_str(
    s: &str
  ) -> Result<Self, Self::Err> {
    match s
      .trim()
      .to_ascii_lowercase()
      .as_str()
    {
      | "all" => Ok(View::All),
      | "active" => Ok(View::Active),
      | "done" => Ok(View::Done),
      | other => Err(anyhow!(
        "unknown view: {other} \
         (expected all, active or \
         done)"
      ))
    }
  }
}

impl fmt::Display for View {
  fn fmt(
    &self,
    f: &mut fmt::Formatter<'_>
  ) -> fmt::Result {
    let name = match self {
      | View::All => "all",
      | View::Active => "active",
      | View::Done => "done"
    };
    f.write_str(name)
  }
}
