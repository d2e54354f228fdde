//! The background worker: owns the versioned cache generations and answers
//! fetches and control messages on its own event loop.
//!
//! Pages never touch a `ServiceWorker` directly. They hold a [`WorkerHandle`]
//! and talk to it through channels. Lifecycle and control messages run in
//! order on the worker's task; fetches run on tasks of their own so a slow
//! origin never holds up a control message.

pub mod fetch;
pub mod message;
mod registry;

pub use registry::WorkerRegistry;

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{generation_name, is_current_generation, CacheStorage, GenerationKind};
use crate::config::Config;
use crate::http::Request;
use crate::net::Network;
use fetch::{FetchDecision, FetchEngine, FetchError, FetchPolicy};
use message::{ClientMessage, ControlMessage, MessageError, WorkerReply};

/// Lifecycle states, driven by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
  Installing,
  /// Installed and waiting for the previous worker to let go
  Installed,
  Activating,
  Activated,
  Redundant,
}

pub struct ServiceWorker {
  version: String,
  origin: Url,
  shell_assets: Vec<String>,
  storage: Arc<dyn CacheStorage>,
  network: Arc<dyn Network>,
  engine: Arc<FetchEngine>,
  state: watch::Sender<WorkerState>,
  clients: broadcast::Sender<ClientMessage>,
  skip_waiting: bool,
  clients_claimed: bool,
}

impl ServiceWorker {
  pub fn new(
    config: &Config,
    origin: Url,
    storage: Arc<dyn CacheStorage>,
    network: Arc<dyn Network>,
  ) -> Self {
    let version = config.version_tag();
    let engine = Arc::new(FetchEngine::new(
      FetchPolicy::from_config(&config.worker),
      storage.clone(),
      network.clone(),
      &version,
    ));
    let (state, _) = watch::channel(WorkerState::Installing);
    let (clients, _) = broadcast::channel(16);

    Self {
      version,
      origin,
      shell_assets: config.worker.shell_assets.clone(),
      storage,
      network,
      engine,
      state,
      clients,
      skip_waiting: false,
      clients_claimed: false,
    }
  }

  pub fn version(&self) -> &str {
    &self.version
  }

  pub fn state(&self) -> WorkerState {
    *self.state.borrow()
  }

  fn set_state(&self, state: WorkerState) {
    debug!(version = %self.version, ?state, "worker state");
    self.state.send_replace(state);
  }

  fn static_cache(&self) -> String {
    generation_name(GenerationKind::Static, &self.version)
  }

  /// Request skip-waiting and pre-cache the app shell.
  ///
  /// The shell is all-or-nothing: if any asset cannot be fetched, nothing is
  /// stored and install still completes.
  pub async fn install(&mut self) {
    info!(version = %self.version, "installing worker");
    self.set_state(WorkerState::Installing);
    self.skip_waiting = true;

    if let Err(e) = self.precache_shell().await {
      warn!(version = %self.version, error = %e, "shell precache failed");
    }

    self.set_state(WorkerState::Installed);
  }

  async fn precache_shell(&self) -> color_eyre::Result<()> {
    let cache = self.static_cache();
    self.storage.open(&cache)?;

    let mut fetched = Vec::with_capacity(self.shell_assets.len());
    for asset in &self.shell_assets {
      let url = self
        .origin
        .join(asset)
        .map_err(|e| color_eyre::eyre::eyre!("Bad shell asset {}: {}", asset, e))?;
      let request = Request::get(url);
      let response = self.network.fetch(&request).await?;
      if !response.is_cacheable() {
        return Err(color_eyre::eyre::eyre!(
          "Shell asset {} returned {}",
          asset,
          response.status
        ));
      }
      fetched.push((request, response));
    }

    for (request, response) in &fetched {
      self.storage.put(&cache, request, response)?;
    }
    info!(cache = %cache, assets = fetched.len(), "shell cached");
    Ok(())
  }

  /// Claim every page and evict every generation of another version.
  pub async fn activate(&mut self) {
    info!(version = %self.version, "activating worker");
    self.set_state(WorkerState::Activating);
    self.clients_claimed = true;

    match self.storage.keys() {
      Ok(names) => {
        for name in names
          .iter()
          .filter(|n| !is_current_generation(n, &self.version))
        {
          match self.storage.delete(name) {
            Ok(_) => info!(cache = %name, "deleted old cache"),
            Err(e) => warn!(cache = %name, error = %e, "failed to delete old cache"),
          }
        }
      }
      Err(e) => warn!(error = %e, "could not enumerate caches on activate"),
    }

    let notice = ClientMessage::ClearStorage {
      timestamp: Utc::now().timestamp_millis(),
    };
    // Nobody listening is fine; the broadcast is advisory
    let _ = self.clients.send(notice);

    self.set_state(WorkerState::Activated);
  }

  /// Delete every generation, current one included.
  fn clear_all_caches(&self) -> bool {
    let names = match self.storage.keys() {
      Ok(names) => names,
      Err(e) => {
        warn!(error = %e, "could not enumerate caches");
        return false;
      }
    };

    let mut success = true;
    for name in &names {
      match self.storage.delete(name) {
        Ok(_) => info!(cache = %name, "cleared cache by request"),
        Err(e) => {
          warn!(cache = %name, error = %e, "failed to clear cache");
          success = false;
        }
      }
    }
    success
  }

  pub async fn handle_message(&mut self, message: ControlMessage) -> Option<WorkerReply> {
    debug!(message = message.as_str(), "message received");
    match message {
      ControlMessage::SkipWaiting => {
        self.skip_waiting = true;
        if self.state() == WorkerState::Installed {
          self.activate().await;
        }
        None
      }
      ControlMessage::ClearCache => Some(WorkerReply::Cleared {
        success: self.clear_all_caches(),
      }),
      ControlMessage::GetVersion => Some(WorkerReply::Version {
        version: self.version.clone(),
      }),
    }
  }

  /// Move the worker onto its own task.
  pub fn spawn(self) -> WorkerHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = WorkerHandle {
      tx,
      state: self.state.subscribe(),
      clients: self.clients.clone(),
    };
    tokio::spawn(self.run(rx));
    handle
  }

  async fn run(mut self, mut rx: mpsc::UnboundedReceiver<WorkerCommand>) {
    while let Some(command) = rx.recv().await {
      match command {
        WorkerCommand::Install(done) => {
          self.install().await;
          let _ = done.send(());
        }
        WorkerCommand::Activate(done) => {
          self.activate().await;
          let _ = done.send(());
        }
        WorkerCommand::Update => {
          self.install().await;
          if self.skip_waiting {
            self.activate().await;
          }
        }
        WorkerCommand::Message { message, reply } => {
          let answer = self.handle_message(message).await;
          if let (Some(answer), Some(reply)) = (answer, reply) {
            // Receiver may have timed out already
            let _ = reply.send(answer);
          }
        }
        WorkerCommand::Fetch { request, respond } => {
          let engine = self.engine.clone();
          tokio::spawn(async move {
            let _ = respond.send(engine.handle(&request).await);
          });
        }
        WorkerCommand::Terminate => break,
      }
    }

    drop(rx);
    self.clients_claimed = false;
    self.set_state(WorkerState::Redundant);
    debug!(version = %self.version, "worker stopped");
  }
}

enum WorkerCommand {
  Install(oneshot::Sender<()>),
  Activate(oneshot::Sender<()>),
  Update,
  Message {
    message: ControlMessage,
    reply: Option<oneshot::Sender<WorkerReply>>,
  },
  Fetch {
    request: Request,
    respond: oneshot::Sender<Result<FetchDecision, FetchError>>,
  },
  Terminate,
}

/// A page's connection to a running worker.
#[derive(Clone)]
pub struct WorkerHandle {
  tx: mpsc::UnboundedSender<WorkerCommand>,
  state: watch::Receiver<WorkerState>,
  clients: broadcast::Sender<ClientMessage>,
}

impl WorkerHandle {
  pub fn state(&self) -> WorkerState {
    *self.state.borrow()
  }

  pub fn is_active(&self) -> bool {
    self.state() == WorkerState::Activated
  }

  /// Receive the worker's broadcasts to controlled pages.
  pub fn subscribe(&self) -> broadcast::Receiver<ClientMessage> {
    self.clients.subscribe()
  }

  fn send(&self, command: WorkerCommand) -> Result<(), MessageError> {
    self.tx.send(command).map_err(|_| MessageError::Closed)
  }

  pub async fn install(&self) -> Result<(), MessageError> {
    let (done, wait) = oneshot::channel();
    self.send(WorkerCommand::Install(done))?;
    wait.await.map_err(|_| MessageError::Closed)
  }

  pub async fn activate(&self) -> Result<(), MessageError> {
    let (done, wait) = oneshot::channel();
    self.send(WorkerCommand::Activate(done))?;
    wait.await.map_err(|_| MessageError::Closed)
  }

  /// Ask the worker to re-install and re-activate. Does not wait.
  pub fn update(&self) -> Result<(), MessageError> {
    self.send(WorkerCommand::Update)
  }

  /// Fire-and-forget message with no reply channel.
  pub fn post_message(&self, message: ControlMessage) -> Result<(), MessageError> {
    self.send(WorkerCommand::Message {
      message,
      reply: None,
    })
  }

  /// Send a message with a reply channel and wait at most `timeout` for the answer.
  pub async fn request(
    &self,
    message: ControlMessage,
    timeout: Duration,
  ) -> Result<WorkerReply, MessageError> {
    let (reply, answer) = oneshot::channel();
    self.send(WorkerCommand::Message {
      message,
      reply: Some(reply),
    })?;

    match tokio::time::timeout(timeout, answer).await {
      Ok(Ok(answer)) => Ok(answer),
      Ok(Err(_)) => Err(MessageError::NoReply),
      Err(_) => Err(MessageError::Timeout(timeout)),
    }
  }

  /// Deliver a message in its wire form. Messages that expect a reply wait
  /// for it; unknown messages are logged and dropped.
  pub async fn post_value(
    &self,
    value: &Value,
    timeout: Duration,
  ) -> Result<Option<WorkerReply>, MessageError> {
    match ControlMessage::from_value(value) {
      Some(ControlMessage::SkipWaiting) => {
        self.post_message(ControlMessage::SkipWaiting)?;
        Ok(None)
      }
      Some(message) => self.request(message, timeout).await.map(Some),
      None => {
        warn!(message = %value, "ignoring unknown worker message");
        Ok(None)
      }
    }
  }

  pub async fn fetch(&self, request: Request) -> Result<FetchDecision, FetchError> {
    let (respond, result) = oneshot::channel();
    self
      .send(WorkerCommand::Fetch { request, respond })
      .map_err(|_| FetchError::WorkerGone)?;
    result.await.map_err(|_| FetchError::WorkerGone)?
  }

  pub fn terminate(&self) {
    let _ = self.send(WorkerCommand::Terminate);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqliteStorage;
  use crate::http::Response;
  use fetch::tests::StubNetwork;

  fn config(version: &str) -> Config {
    Config {
      version: Some(version.to_string()),
      ..Config::default()
    }
  }

  fn origin() -> Url {
    Url::parse("http://localhost:8080/").unwrap()
  }

  fn shell_network() -> StubNetwork {
    StubNetwork::with(&[
      ("/", Response::new(200, "<shell>")),
      ("/index.html", Response::new(200, "<shell>")),
      ("/manifest.json", Response::new(200, "{}")),
      ("/icon-192.png", Response::new(200, "png")),
    ])
  }

  fn worker(version: &str, storage: Arc<SqliteStorage>, net: StubNetwork) -> ServiceWorker {
    ServiceWorker::new(&config(version), origin(), storage, Arc::new(net))
  }

  #[tokio::test]
  async fn test_install_precaches_shell_only() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let mut sw = worker("v2", storage.clone(), shell_network());

    sw.install().await;

    assert_eq!(sw.state(), WorkerState::Installed);
    assert!(sw.skip_waiting);
    assert_eq!(storage.keys().unwrap(), vec!["static-v2"]);
    assert_eq!(storage.entry_count().unwrap(), 4);
    let login = Request::get(origin().join("/login.html").unwrap());
    assert!(storage.match_in("static-v2", &login).unwrap().is_none());
  }

  #[tokio::test]
  async fn test_install_survives_missing_asset() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let net = StubNetwork::with(&[("/", Response::new(200, "<shell>"))]);
    let mut sw = worker("v2", storage.clone(), net);

    sw.install().await;

    assert_eq!(sw.state(), WorkerState::Installed);
    assert_eq!(storage.keys().unwrap(), vec!["static-v2"]);
    assert_eq!(storage.entry_count().unwrap(), 0);
  }

  #[tokio::test]
  async fn test_activate_evicts_other_versions() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    for name in ["static-v1", "dynamic-v1", "static-v2"] {
      storage.open(name).unwrap();
    }
    let mut sw = worker("v2", storage.clone(), StubNetwork::offline());
    let mut notices = sw.clients.subscribe();

    sw.activate().await;

    assert_eq!(storage.keys().unwrap(), vec!["static-v2"]);
    assert_eq!(sw.state(), WorkerState::Activated);
    assert!(sw.clients_claimed);
    assert!(matches!(
      notices.try_recv().unwrap(),
      ClientMessage::ClearStorage { .. }
    ));
  }

  #[tokio::test]
  async fn test_clear_cache_keeps_version() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let handle = worker("v2", storage.clone(), shell_network()).spawn();
    handle.install().await.unwrap();
    handle.activate().await.unwrap();
    assert!(handle.is_active());

    let timeout = Duration::from_secs(1);
    let cleared = handle.request(ControlMessage::ClearCache, timeout).await;
    assert_eq!(cleared, Ok(WorkerReply::Cleared { success: true }));
    assert!(storage.keys().unwrap().is_empty());

    let version = handle.request(ControlMessage::GetVersion, timeout).await;
    assert_eq!(
      version,
      Ok(WorkerReply::Version {
        version: "v2".to_string()
      })
    );
  }

  #[tokio::test]
  async fn test_skip_waiting_activates_installed_worker() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let handle = worker("v2", storage, shell_network()).spawn();
    handle.install().await.unwrap();
    assert_eq!(handle.state(), WorkerState::Installed);

    handle.post_message(ControlMessage::SkipWaiting).unwrap();
    // A round trip on the same loop guarantees the message was handled
    handle
      .request(ControlMessage::GetVersion, Duration::from_secs(1))
      .await
      .unwrap();
    assert_eq!(handle.state(), WorkerState::Activated);
  }

  #[tokio::test]
  async fn test_update_restores_shell_after_clear() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let handle = worker("v2", storage.clone(), shell_network()).spawn();
    handle.install().await.unwrap();
    handle.activate().await.unwrap();

    let timeout = Duration::from_secs(1);
    handle.request(ControlMessage::ClearCache, timeout).await.unwrap();
    assert_eq!(storage.entry_count().unwrap(), 0);

    handle.update().unwrap();
    // Commands are handled in order, so the update is done once this answers
    handle.request(ControlMessage::GetVersion, timeout).await.unwrap();
    assert_eq!(storage.keys().unwrap(), vec!["static-v2"]);
    assert_eq!(storage.entry_count().unwrap(), 4);
    assert!(handle.is_active());
  }

  #[tokio::test]
  async fn test_terminated_worker_is_redundant() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let handle = worker("v2", storage, StubNetwork::offline()).spawn();
    let mut state = handle.state.clone();

    handle.terminate();
    state
      .wait_for(|s| *s == WorkerState::Redundant)
      .await
      .unwrap();

    let result = handle
      .request(ControlMessage::GetVersion, Duration::from_millis(50))
      .await;
    assert_eq!(result, Err(MessageError::Closed));
  }

  /// Answers every request, but only after `delay`.
  struct SlowNetwork {
    delay: Duration,
  }

  impl Network for SlowNetwork {
    fn fetch<'a>(
      &'a self,
      _request: &'a Request,
    ) -> futures::future::BoxFuture<'a, Result<Response, crate::net::NetworkError>> {
      Box::pin(async move {
        tokio::time::sleep(self.delay).await;
        Ok(Response::new(200, "slow"))
      })
    }
  }

  #[tokio::test]
  async fn test_control_messages_not_blocked_by_fetch() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let mut config = config("v2");
    config.worker.shell_assets.clear();
    let net = SlowNetwork {
      delay: Duration::from_millis(800),
    };
    let handle = ServiceWorker::new(&config, origin(), storage, Arc::new(net)).spawn();

    let busy = handle.clone();
    let in_flight = tokio::spawn(async move {
      busy
        .fetch(Request::get(origin().join("/app.css").unwrap()))
        .await
    });
    tokio::task::yield_now().await;

    let timeout = Duration::from_millis(300);
    assert_eq!(
      handle.request(ControlMessage::GetVersion, timeout).await,
      Ok(WorkerReply::Version {
        version: "v2".to_string()
      })
    );
    assert_eq!(
      handle.request(ControlMessage::ClearCache, timeout).await,
      Ok(WorkerReply::Cleared { success: true })
    );

    let decision = in_flight.await.unwrap().unwrap();
    assert!(matches!(
      decision,
      FetchDecision::Respond {
        source: fetch::ResponseSource::Network,
        ..
      }
    ));
  }

  #[tokio::test]
  async fn test_wire_messages_and_unknown_ignored() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let handle = worker("v2", storage.clone(), shell_network()).spawn();
    handle.install().await.unwrap();
    let timeout = Duration::from_secs(1);

    let ignored = handle
      .post_value(&serde_json::json!({"type": "SELF_DESTRUCT"}), timeout)
      .await;
    assert_eq!(ignored, Ok(None));
    assert_eq!(storage.entry_count().unwrap(), 4);

    let version = handle
      .post_value(&serde_json::json!("GET_VERSION"), timeout)
      .await;
    assert_eq!(
      version,
      Ok(Some(WorkerReply::Version {
        version: "v2".to_string()
      }))
    );

    let cleared = handle
      .post_value(&serde_json::json!({"type": "CLEAR_CACHE"}), timeout)
      .await;
    assert_eq!(cleared, Ok(Some(WorkerReply::Cleared { success: true })));
    assert!(storage.keys().unwrap().is_empty());

    assert_eq!(
      handle
        .post_value(&serde_json::json!("SKIP_WAITING"), timeout)
        .await,
      Ok(None)
    );
    handle.request(ControlMessage::GetVersion, timeout).await.unwrap();
    assert_eq!(handle.state(), WorkerState::Activated);
  }

  #[tokio::test]
  async fn test_fetch_through_handle() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let handle = worker("v2", storage, StubNetwork::offline()).spawn();

    let req = Request::navigate(origin().join("/login.html").unwrap());
    let decision = handle.fetch(req).await.unwrap();
    assert!(matches!(
      decision,
      FetchDecision::Bypass(fetch::RequestClass::BlockedPath)
    ));
  }
}
