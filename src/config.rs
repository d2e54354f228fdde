use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Origin the app is served from; same-origin checks compare against it
  #[serde(default = "default_origin")]
  pub origin: String,
  /// Version tag embedded in every cache generation name.
  /// Defaults to the crate version plus today's date.
  pub version: Option<String>,
  /// Where the profile and cache databases live (defaults to $XDG_DATA_HOME/nope)
  pub data_dir: Option<PathBuf>,
  #[serde(default)]
  pub reset: ResetConfig,
  #[serde(default)]
  pub worker: WorkerConfig,
  #[serde(default)]
  pub session: SessionConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResetConfig {
  /// Reset on every page load, not just auth entry points
  pub force: bool,
  /// Minimum gap between two automatic resets
  pub cooldown_ms: u64,
  /// How long to wait for a worker to answer CLEAR_CACHE
  pub reply_timeout_ms: u64,
  /// Delay before the freshness redirect fires
  pub redirect_delay_ms: u64,
  /// A page becoming visible again re-checks after this long
  pub revisit_interval_secs: u64,
}

impl Default for ResetConfig {
  fn default() -> Self {
    Self {
      force: false,
      cooldown_ms: 1000,
      reply_timeout_ms: 2000,
      redirect_delay_ms: 300,
      revisit_interval_secs: 300,
    }
  }
}

impl ResetConfig {
  pub fn cooldown(&self) -> chrono::Duration {
    chrono::Duration::milliseconds(self.cooldown_ms as i64)
  }

  pub fn reply_timeout(&self) -> Duration {
    Duration::from_millis(self.reply_timeout_ms)
  }

  pub fn redirect_delay(&self) -> Duration {
    Duration::from_millis(self.redirect_delay_ms)
  }

  pub fn revisit_interval(&self) -> chrono::Duration {
    chrono::Duration::seconds(self.revisit_interval_secs as i64)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
  /// With caching off the worker runs against an empty, write-nothing store
  pub cache_enabled: bool,
  /// App-shell assets pre-cached on install. Never list auth pages here.
  pub shell_assets: Vec<String>,
  /// Path tokens that always bypass the cache (case-insensitive)
  #[serde(deserialize_with = "deserialize_lowercase_vec")]
  pub blocked_paths: Vec<String>,
  /// File extensions served cache-first
  #[serde(deserialize_with = "deserialize_lowercase_vec")]
  pub static_extensions: Vec<String>,
  /// Static assets that skip cache hits and always hit the network first
  pub always_revalidate: Vec<String>,
  /// Upper bound on a single network request
  pub network_timeout_secs: u64,
}

impl WorkerConfig {
  pub fn network_timeout(&self) -> Duration {
    Duration::from_secs(self.network_timeout_secs)
  }
}

impl Default for WorkerConfig {
  fn default() -> Self {
    Self {
      cache_enabled: true,
      shell_assets: ["/", "/index.html", "/manifest.json", "/icon-192.png"]
        .map(String::from)
        .to_vec(),
      blocked_paths: [
        "login", "register", "logout", "auth", "signin", "signup", "dunia", "jalan",
      ]
      .map(String::from)
      .to_vec(),
      static_extensions: [
        "css", "js", "png", "jpg", "jpeg", "gif", "svg", "ico", "woff", "woff2", "ttf", "eot",
        "json",
      ]
      .map(String::from)
      .to_vec(),
      always_revalidate: vec!["manifest.json".to_string()],
      network_timeout_secs: 30,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
  /// Session pointers older than this are discarded
  pub max_age_hours: i64,
  /// Minimum days between two artefak uploads
  pub upload_cooldown_days: i64,
}

impl Default for SessionConfig {
  fn default() -> Self {
    Self {
      max_age_hours: 24,
      upload_cooldown_days: 30,
    }
  }
}

impl SessionConfig {
  pub fn max_age(&self) -> chrono::Duration {
    chrono::Duration::hours(self.max_age_hours)
  }
}

impl Default for Config {
  fn default() -> Self {
    Self {
      origin: default_origin(),
      version: None,
      data_dir: None,
      reset: ResetConfig::default(),
      worker: WorkerConfig::default(),
      session: SessionConfig::default(),
    }
  }
}

fn default_origin() -> String {
  "http://localhost:8080/".to_string()
}

fn deserialize_lowercase_vec<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
  D: serde::Deserializer<'de>,
{
  let v: Vec<String> = Vec::deserialize(deserializer)?;
  Ok(v.into_iter().map(|s| s.to_lowercase()).collect())
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./nope.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/nope/config.yaml
  ///
  /// Falls back to defaults when no file is found.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("nope.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("nope").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config: Config = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    Ok(config)
  }

  /// Parsed app origin.
  pub fn origin_url(&self) -> Result<Url> {
    Url::parse(&self.origin).map_err(|e| eyre!("Invalid origin '{}': {}", self.origin, e))
  }

  /// The version tag for cache generations.
  ///
  /// Must change on every deployable update; the default combines the crate
  /// version with the current date.
  pub fn version_tag(&self) -> String {
    self.version.clone().unwrap_or_else(|| {
      format!(
        "v{}-{}",
        env!("CARGO_PKG_VERSION"),
        chrono::Utc::now().format("%Y-%m-%d")
      )
    })
  }

  /// Directory holding the profile and cache databases.
  ///
  /// Checks NOPE_DATA_DIR first, then the config file, then the platform data dir.
  pub fn data_dir(&self) -> Result<PathBuf> {
    if let Ok(dir) = std::env::var("NOPE_DATA_DIR") {
      return Ok(PathBuf::from(dir));
    }
    if let Some(dir) = &self.data_dir {
      return Ok(dir.clone());
    }
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("nope"))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Write;

  #[test]
  fn test_defaults_when_no_file() {
    let config = Config::default();
    assert_eq!(config.reset.cooldown_ms, 1000);
    assert_eq!(config.session.max_age_hours, 24);
    assert!(config.worker.blocked_paths.contains(&"login".to_string()));
    assert!(!config.worker.shell_assets.iter().any(|a| a.contains("login")));
    assert_eq!(config.worker.network_timeout(), Duration::from_secs(30));
  }

  #[test]
  fn test_load_partial_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
      file,
      "origin: https://nope.example/\nversion: v7\nreset:\n  force: true\nworker:\n  blocked_paths: [LOGIN, Admin]\n"
    )
    .unwrap();

    let config = Config::load(Some(file.path())).unwrap();
    assert_eq!(config.origin_url().unwrap().host_str(), Some("nope.example"));
    assert_eq!(config.version_tag(), "v7");
    assert!(config.reset.force);
    assert_eq!(config.reset.reply_timeout_ms, 2000);
    assert_eq!(config.worker.blocked_paths, vec!["login", "admin"]);
    assert_eq!(config.worker.static_extensions.len(), 13);
  }

  #[test]
  fn test_missing_explicit_path_is_error() {
    let result = Config::load(Some(Path::new("/definitely/not/here.yaml")));
    assert!(result.is_err());
  }
}
