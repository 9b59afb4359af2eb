use std::collections::HashMap;
use std::fs;
use std::path::{
  Path,
  PathBuf
};
use std::time::Duration;

use anyhow::{
  Context,
  anyhow
};
use tracing::{
  debug,
  info,
  trace,
  warn
};

pub const API_BASE_ENV: &str =
  "STUDYTRACK_API_BASE";

#[derive(Debug, Clone)]
pub struct Config {
  map: HashMap<String, String>,
  pub loaded_files: Vec<PathBuf>
}

/// Which persistence target the tracker talks to.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq,
)]
pub enum BackendChoice {
  Local,
  Remote
}

impl std::str::FromStr
  for BackendChoice
{
  type Err = anyhow::Error;

  fn from_str(
    s: &str
  ) -> Result<Self, Self::Err> {
    match s
      .trim()
      .to_ascii_lowercase()
      .as_str()
    {
      | "local" => Ok(Self::Local),
      | "remote" => Ok(Self::Remote),
      | other => Err(anyhow!(
        "invalid backend: {other} \
         (expected local or remote)"
      ))
    }
  }
}

impl Config {
  /// Built-in defaults only; no files or environment.
  pub fn defaults() -> Self {
    let mut map = HashMap::new();
    for (key, value) in [
      ("data.location", "~/.studytrack"),
      ("backend", "local"),
      ("load.retry_ms", "3000"),
      ("http.timeout_secs", "30"),
      ("color", "on")
    ] {
      map.insert(
        key.to_string(),
        value.to_string()
      );
    }
    Config {
      map,
      loaded_files: vec![]
    }
  }

  #[tracing::instrument(skip(
    rc_override
  ))]
  pub fn load(
    rc_override: Option<&Path>
  ) -> anyhow::Result<Self> {
    let mut cfg = Self::defaults();

    match resolve_rc_path(rc_override)?
    {
      | Some(path) => {
        info!(studyrc = %path.display(), "loading studyrc");
        cfg.load_file(&path)?;
      }
      | None => {
        debug!(
          "no studyrc found; using \
           defaults"
        );
      }
    }

    if let Ok(base) =
      std::env::var(API_BASE_ENV)
      && !base.trim().is_empty()
    {
      debug!(env = API_BASE_ENV, "api base taken from environment");
      cfg.map.insert(
        "api.base".to_string(),
        base.trim().to_string()
      );
    }

    Ok(cfg)
  }

  #[tracing::instrument(skip(
    self, overrides
  ))]
  pub fn apply_overrides<I>(
    &mut self,
    overrides: I
  ) where
    I: IntoIterator<
      Item = (String, String)
    >
  {
    for (k, v) in overrides {
      let key = k
        .strip_prefix("rc.")
        .unwrap_or(&k)
        .to_string();
      debug!(key = %key, value = %v, "applying override");
      self.map.insert(key, v);
    }
  }

  pub fn get(
    &self,
    key: &str
  ) -> Option<String> {
    self.map.get(key).cloned()
  }

  pub fn get_u64(
    &self,
    key: &str
  ) -> anyhow::Result<Option<u64>> {
    self
      .map
      .get(key)
      .map(|v| {
        v.trim().parse::<u64>().map_err(
          |e| {
            anyhow!(
              "invalid number for \
               {key}: {v} ({e})"
            )
          }
        )
      })
      .transpose()
  }

  pub fn backend(
    &self
  ) -> anyhow::Result<BackendChoice> {
    self
      .get("backend")
      .unwrap_or_else(|| {
        "local".to_string()
      })
      .parse()
  }

  pub fn retry_delay(
    &self
  ) -> anyhow::Result<Duration> {
    Ok(Duration::from_millis(
      self
        .get_u64("load.retry_ms")?
        .unwrap_or(3000)
    ))
  }

  pub fn http_timeout(
    &self
  ) -> anyhow::Result<Duration> {
    Ok(Duration::from_secs(
      self
        .get_u64("http.timeout_secs")?
        .unwrap_or(30)
    ))
  }

  #[tracing::instrument(skip(self))]
  fn load_file(
    &mut self,
    path: &Path
  ) -> anyhow::Result<()> {
    let path = expand_tilde(path);
    let text =
      fs::read_to_string(&path)
        .with_context(|| {
          format!(
            "failed to read {}",
            path.display()
          )
        })?;

    self
      .loaded_files
      .push(path.clone());

    let base_dir = path
      .parent()
      .map(|p| p.to_path_buf())
      .unwrap_or_else(|| {
        PathBuf::from(".")
      });

    for (line_num, raw_line) in
      text.lines().enumerate()
    {
      let line = raw_line
        .split_once('#')
        .map_or(raw_line, |(before, _)| {
          before
        })
        .trim();
      if line.is_empty() {
        continue;
      }

      if let Some(include_rest) =
        line.strip_prefix("include ")
      {
        let include_path =
          resolve_include_path(
            &base_dir,
            include_rest.trim()
          )?;
        if self
          .loaded_files
          .contains(&include_path)
        {
          warn!(include = %include_path.display(), "include cycle; skipping");
          continue;
        }
        if include_path.exists() {
          self
            .load_file(&include_path)?;
        } else {
          warn!(include = %include_path.display(), "include file does not exist; skipping");
        }
        continue;
      }

      let (k, v) = line
        .split_once('=')
        .ok_or_else(|| {
          anyhow!(
            "invalid config line \
             {}:{}: {}",
            path.display(),
            line_num + 1,
            raw_line
          )
        })?;

      let key = k.trim().to_string();
      let value = v.trim().to_string();
      trace!(key = %key, value = %value, "loaded config key");
      self.map.insert(key, value);
    }

    Ok(())
  }
}

#[tracing::instrument(skip(
  cfg,
  override_dir
))]
pub fn resolve_data_dir(
  cfg: &Config,
  override_dir: Option<&Path>
) -> anyhow::Result<PathBuf> {
  let dir = if let Some(path) =
    override_dir
  {
    path.to_path_buf()
  } else if let Some(cfg_value) =
    cfg.get("data.location")
  {
    expand_tilde(Path::new(&cfg_value))
  } else {
    default_data_dir()?
  };

  if !dir.exists() {
    info!(dir = %dir.display(), "creating data directory");
    fs::create_dir_all(&dir)
      .with_context(|| {
        format!(
          "failed to create {}",
          dir.display()
        )
      })?;
  }

  Ok(dir)
}

fn resolve_rc_path(
  override_path: Option<&Path>
) -> anyhow::Result<Option<PathBuf>> {
  if let Some(path) = override_path {
    return Ok(Some(path.to_path_buf()));
  }

  if let Ok(rc_env) =
    std::env::var("STUDYRC")
  {
    if rc_env == "/dev/null" {
      return Ok(None);
    }
    return Ok(Some(PathBuf::from(
      rc_env
    )));
  }

  let Some(home) = dirs::home_dir()
  else {
    warn!(
      "cannot determine home \
       directory; skipping studyrc"
    );
    return Ok(None);
  };
  let candidate = home.join(".studyrc");
  if candidate.exists() {
    return Ok(Some(candidate));
  }

  Ok(None)
}

fn default_data_dir()
-> anyhow::Result<PathBuf> {
  let home = dirs::home_dir()
    .ok_or_else(|| {
      anyhow!(
        "cannot determine home \
         directory"
      )
    })?;
  Ok(home.join(".studytrack"))
}

fn resolve_include_path(
  base_dir: &Path,
  include: &str
) -> anyhow::Result<PathBuf> {
  if include.trim().is_empty() {
    return Err(anyhow!(
      "include path cannot be empty"
    ));
  }

  let expanded =
    expand_tilde(Path::new(include));
  if expanded.is_absolute() {
    Ok(expanded)
  } else {
    Ok(base_dir.join(expanded))
  }
}

fn expand_tilde(
  path: &Path
) -> PathBuf {
  let text = path.to_string_lossy();
  if let Some(rest) =
    text.strip_prefix("~/")
    && let Some(home) = dirs::home_dir()
  {
    return home.join(rest);
  }
  path.to_path_buf()
}
