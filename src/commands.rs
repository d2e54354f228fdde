//! CLI commands, each run against the profile in the data directory.

use chrono::Utc;
use clap::ValueEnum;
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use std::path::Path;
use std::sync::Arc;
use tracing::info;
use url::Url;

use crate::cache::{CacheStorage, NoopStorage, SqliteStorage};
use crate::config::Config;
use crate::db::{Cookie, Database, StorageArea};
use crate::http::{Request, Response};
use crate::net::{HttpNetwork, Network};
use crate::page::{PageContext, SimulatedPage};
use crate::reset::{CheckOutcome, ResetOrchestrator, ResetOutcome};
use crate::session::model::Category;
use crate::session::{SessionContext, SessionStore};
use crate::surface::{standard_surfaces, PersistenceSurface};
use crate::worker::fetch::FetchDecision;
use crate::worker::message::{ControlMessage, WorkerReply};
use crate::worker::{ServiceWorker, WorkerRegistry};

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum WorkerAction {
  Install,
  Activate,
  ClearCache,
  Version,
  SkipWaiting,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum CategoryArg {
  PopCulture,
  PersonalPain,
  SocialSickness,
}

impl From<CategoryArg> for Category {
  fn from(arg: CategoryArg) -> Self {
    match arg {
      CategoryArg::PopCulture => Category::PopCulture,
      CategoryArg::PersonalPain => Category::PersonalPain,
      CategoryArg::SocialSickness => Category::SocialSickness,
    }
  }
}

/// Everything one invocation works against.
pub struct Profile {
  config: Config,
  origin: Url,
  db: Arc<Database>,
  caches: Arc<dyn CacheStorage>,
  network: Arc<dyn Network>,
}

impl Profile {
  pub fn open(config: Config, data_dir: &Path) -> Result<Self> {
    let origin = config.origin_url()?;
    let db = Arc::new(Database::open_at(&data_dir.join("profile.db"))?);

    let caches: Arc<dyn CacheStorage> = if config.worker.cache_enabled {
      Arc::new(SqliteStorage::open_at(&data_dir.join("caches.db"))?)
    } else {
      info!("caching disabled, worker caches are discarded");
      Arc::new(NoopStorage)
    };

    let network = Arc::new(HttpNetwork::new(
      origin.clone(),
      config.worker.network_timeout(),
    )?);

    Ok(Self {
      config,
      origin,
      db,
      caches,
      network,
    })
  }

  fn service_worker(&self) -> ServiceWorker {
    ServiceWorker::new(
      &self.config,
      self.origin.clone(),
      self.caches.clone(),
      self.network.clone(),
    )
  }

  /// A page at `target`, relative to the origin unless absolute.
  fn page(&self, target: &str) -> Result<Arc<SimulatedPage>> {
    let url = self
      .origin
      .join(target)
      .map_err(|e| eyre!("Invalid URL '{}': {}", target, e))?;
    Ok(Arc::new(SimulatedPage::new(url)))
  }

  /// What a page load does first: register the worker for the whole origin.
  async fn registry(&self) -> Arc<WorkerRegistry> {
    let registry = Arc::new(WorkerRegistry::new());
    registry.register("/", self.service_worker()).await;
    registry
  }

  fn orchestrator(
    &self,
    page: Arc<SimulatedPage>,
    registry: Arc<WorkerRegistry>,
  ) -> ResetOrchestrator {
    let surfaces = standard_surfaces(self.db.clone(), page.clone(), self.cache_surface());
    ResetOrchestrator::new(
      self.config.reset.clone(),
      self.db.clone(),
      surfaces,
      registry,
      page,
    )
  }

  /// Cache storage as pages see it; absent when caching is off.
  fn cache_surface(&self) -> Option<Arc<dyn CacheStorage>> {
    self.config.worker.cache_enabled.then(|| self.caches.clone())
  }

  fn sessions(&self) -> SessionStore {
    SessionStore::new(self.db.clone(), self.config.session.clone())
  }
}

/// Write the kind of state a page leaves behind in every surface a page can
/// reach. Cache generations are left to the worker.
fn seed(profile: &Profile, host: &str) -> Result<()> {
  profile.db.kv_set(StorageArea::Local, "nope_theme", "dark")?;
  profile.db.kv_set(StorageArea::Session, "nope_draft", "belum selesai")?;
  profile.db.set_cookie(&Cookie::new("nope_theme", "dark", host))?;
  profile.db.set_cookie(&Cookie::new("nope_sid", "s3ss10n", host).http_only())?;
  profile.db.set_cookie(&Cookie::new("nope_admin", "1", host).with_path("/admin"))?;
  profile.db.create_structured_database("nope-offline")?;
  info!(host = %host, "profile seeded");
  Ok(())
}

pub async fn profile(profile: &Profile, with_seed: bool) -> Result<()> {
  let page = profile.page("/")?;
  if with_seed {
    seed(profile, page.location().host_str().unwrap_or("localhost"))?;
  }

  for surface in standard_surfaces(profile.db.clone(), page, profile.cache_surface()) {
    match surface.item_count().await {
      Ok(count) => println!("{:<20} {}", surface.kind().to_string(), count),
      Err(e) => println!("{:<20} unavailable ({})", surface.kind().to_string(), e),
    }
  }

  if let Some(last) = profile.db.last_reset_record()? {
    let state = if last.is_partial() { "partial" } else { "complete" };
    println!("last reset: {} at {} ({})", last.reset_id, last.started_at, state);
  }
  Ok(())
}

fn print_outcome(outcome: &ResetOutcome) {
  println!("reset {}", outcome.reset_id);
  for count in &outcome.counts.surfaces {
    let status = match (count.result.attempted, count.result.succeeded) {
      (false, _) => "unavailable",
      (true, true) => "cleared",
      (true, false) => "FAILED",
    };
    println!(
      "  {:<20} {:<12} {} -> {} ({} removed)",
      count.surface.to_string(),
      status,
      count.result.items_before,
      count.result.items_after,
      count.result.removed()
    );
  }
  println!(
    "  workers unregistered: {}, caches cleared: {}, reply failures: {}",
    outcome.counts.workers_unregistered,
    outcome.counts.worker_caches_cleared,
    outcome.counts.worker_reply_failures
  );
}

pub async fn reset(profile: &Profile) -> Result<()> {
  let page = profile.page("/")?;
  let registry = profile.registry().await;
  let outcome = profile
    .orchestrator(page, registry)
    .perform_full_reset()
    .await?;
  print_outcome(&outcome);
  Ok(())
}

pub async fn check(profile: &Profile, target: &str, visible: bool) -> Result<()> {
  let page = profile.page(target)?;
  let registry = profile.registry().await;
  let orchestrator = profile.orchestrator(page.clone(), registry);

  let outcome = if visible {
    orchestrator.on_visible().await?
  } else {
    orchestrator.check_and_reset().await?
  };

  match outcome {
    CheckOutcome::NotRequired => println!("no reset needed for {}", page.location()),
    CheckOutcome::Suppressed {
      trigger,
      last_reset_id,
    } => println!("reset ({:?}) suppressed, last reset {}", trigger, last_reset_id),
    CheckOutcome::Reset {
      trigger,
      outcome,
      redirect,
    } => {
      println!("reset triggered by {:?}", trigger);
      print_outcome(&outcome);
      if let Some(redirect) = redirect {
        redirect.handle.await?;
        println!("redirected to {}", redirect.url);
      }
    }
  }
  Ok(())
}

fn describe(response: &Response) -> String {
  format!(
    "{} {} ({}, {} bytes)",
    response.status,
    response.status_text,
    response.header("content-type").unwrap_or("no content type"),
    response.body.len()
  )
}

pub async fn fetch(
  profile: &Profile,
  target: &str,
  method: &str,
  accept: Option<String>,
) -> Result<()> {
  let url = profile
    .origin
    .join(target)
    .map_err(|e| eyre!("Invalid URL '{}': {}", target, e))?;
  let method = Method::from_bytes(method.to_uppercase().as_bytes())
    .map_err(|e| eyre!("Invalid method '{}': {}", method, e))?;

  let mut request = Request::get(url).with_method(method);
  if let Some(accept) = accept {
    request = request.with_accept(accept);
  }

  let registry = profile.registry().await;
  let worker = registry
    .ready()
    .ok_or_else(|| eyre!("Worker failed to activate"))?;

  match worker.fetch(request.clone()).await? {
    FetchDecision::Bypass(class) => {
      println!("bypassed ({:?}), straight to network", class);
      let response = profile.network.fetch(&request).await?;
      println!("{} from network", describe(&response));
    }
    FetchDecision::Respond { response, source } => {
      println!("{} from {:?}", describe(&response), source);
    }
  }
  Ok(())
}

pub async fn worker(profile: &Profile, action: WorkerAction) -> Result<()> {
  let handle = profile.service_worker().spawn();
  let timeout = profile.config.reset.reply_timeout();

  match action {
    WorkerAction::Install => {
      handle.install().await?;
    }
    WorkerAction::Activate => {
      let mut notices = handle.subscribe();
      handle.install().await?;
      handle.activate().await?;
      while let Ok(notice) = notices.try_recv() {
        println!("broadcast: {}", serde_json::to_string(&notice)?);
      }
    }
    WorkerAction::ClearCache => match handle.request(ControlMessage::ClearCache, timeout).await? {
      WorkerReply::Cleared { success } => println!("caches cleared: {}", success),
      other => println!("unexpected reply: {:?}", other),
    },
    WorkerAction::Version => match handle.request(ControlMessage::GetVersion, timeout).await? {
      WorkerReply::Version { version } => println!("{}", version),
      other => println!("unexpected reply: {:?}", other),
    },
    WorkerAction::SkipWaiting => {
      handle.install().await?;
      handle.post_message(ControlMessage::SkipWaiting)?;
      handle.request(ControlMessage::GetVersion, timeout).await?;
    }
  }

  println!("worker state: {:?}", handle.state());
  handle.terminate();
  Ok(())
}

/// Send one control message in its wire form: JSON, or a bare message name.
pub async fn message(profile: &Profile, payload: &str) -> Result<()> {
  let value = serde_json::from_str(payload)
    .unwrap_or_else(|_| serde_json::Value::String(payload.to_string()));
  let handle = profile.service_worker().spawn();

  match handle
    .post_value(&value, profile.config.reset.reply_timeout())
    .await?
  {
    Some(reply) => println!("{}", serde_json::to_string(&reply)?),
    None => println!("no reply"),
  }

  handle.terminate();
  Ok(())
}

fn require_session(store: &SessionStore) -> Result<SessionContext> {
  store
    .current_session(Utc::now())?
    .ok_or_else(|| eyre!("Not logged in; run `nope login <username>` first"))
}

pub fn login(profile: &Profile, username: &str) -> Result<()> {
  let store = profile.sessions();
  let returning = store.is_returning(username)?;
  let session = store.establish(username, Utc::now())?;

  if returning {
    println!("welcome back, @{}", session.username);
  } else {
    println!("welcome, @{}", session.username);
  }
  println!("streak: {} day(s)", session.record.stats.streak);
  Ok(())
}

pub fn logout(profile: &Profile) -> Result<()> {
  if profile.sessions().logout()? {
    println!("logged out; your data stays on this device");
  } else {
    println!("no active session");
  }
  Ok(())
}

pub fn session(profile: &Profile) -> Result<()> {
  let store = profile.sessions();
  let Some(mut session) = store.current_session(Utc::now())? else {
    println!("no active session");
    return Ok(());
  };

  store.record_activity(&mut session, Utc::now())?;
  let data = store.load_data(&session.username)?;
  let stats = &session.record.stats;

  println!("@{}", session.username);
  println!("  streak:   {} day(s)", stats.streak);
  println!("  rants:    {} ({} stored)", stats.total_rants, data.rants.len());
  println!("  artefaks: {} ({} stored)", stats.total_artefaks, data.artefaks.len());
  Ok(())
}

pub fn rant(profile: &Profile, text: &str, category: CategoryArg) -> Result<()> {
  let store = profile.sessions();
  let mut session = require_session(&store)?;
  let rant = store.append_rant(&mut session, text, &Category::from(category), Utc::now())?;
  println!("saved rant {} ({:?}, {} words)", rant.id, rant.category, rant.word_count);
  Ok(())
}

pub fn artefak(profile: &Profile, title: &str) -> Result<()> {
  let store = profile.sessions();
  let mut session = require_session(&store)?;
  let artefak = store.append_artefak(&mut session, title, Utc::now())?;
  println!("saved artefak {} ({})", artefak.id, artefak.title);
  Ok(())
}
