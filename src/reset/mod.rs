//! Full resets of every persistence surface, and the page-load check that
//! decides when one runs.
//!
//! A reset writes its record before touching anything, so an interrupted run
//! is visible to the next page load. Each step is safe to repeat: concurrent
//! or back-to-back resets converge on the same empty state.

pub mod policy;
pub mod record;

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use futures::future::join_all;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::ResetConfig;
use crate::db::Database;
use crate::page::PageContext;
use crate::surface::{ClearPhase, PersistenceSurface};
use crate::worker::message::{ControlMessage, WorkerReply};
use crate::worker::WorkerRegistry;
use policy::{
  decide, has_freshness_marker, is_auth_entry_point, with_freshness_marker,
  without_transient_state, ResetDecision, ResetTrigger,
};
use record::{generate_reset_id, ResetCounts, ResetRecord, SurfaceCount};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResetOutcome {
  pub reset_id: String,
  pub counts: ResetCounts,
}

/// A freshness redirect waiting for its delay to pass.
#[derive(Debug)]
pub struct ScheduledRedirect {
  pub url: Url,
  pub handle: JoinHandle<()>,
}

#[derive(Debug)]
pub enum CheckOutcome {
  NotRequired,
  Suppressed {
    trigger: ResetTrigger,
    last_reset_id: String,
  },
  Reset {
    trigger: ResetTrigger,
    outcome: ResetOutcome,
    redirect: Option<ScheduledRedirect>,
  },
}

pub struct ResetOrchestrator {
  config: ResetConfig,
  db: Arc<Database>,
  surfaces: Vec<Arc<dyn PersistenceSurface>>,
  registry: Arc<WorkerRegistry>,
  page: Arc<dyn PageContext>,
}

impl ResetOrchestrator {
  pub fn new(
    config: ResetConfig,
    db: Arc<Database>,
    surfaces: Vec<Arc<dyn PersistenceSurface>>,
    registry: Arc<WorkerRegistry>,
    page: Arc<dyn PageContext>,
  ) -> Self {
    Self {
      config,
      db,
      surfaces,
      registry,
      page,
    }
  }

  /// Clear everything, unconditionally. Only a failure to write the reset
  /// record is an error; every later problem is logged and counted.
  pub async fn perform_full_reset(&self) -> Result<ResetOutcome> {
    let started_at = Utc::now();
    let reset_id = generate_reset_id(started_at);
    self
      .db
      .insert_reset_record(&ResetRecord::begin(&reset_id, started_at))
      .map_err(|e| eyre!("Reset {} aborted before clearing anything: {}", reset_id, e))?;
    info!(reset_id = %reset_id, "reset started");

    let mut counts = ResetCounts::default();
    self.clear_surfaces(&mut counts).await;
    self.retire_workers(&mut counts).await;

    let location = self.page.location();
    self.page.replace_history(&without_transient_state(&location));

    match self.registry.ready() {
      Some(worker) => {
        if let Err(e) = worker.update() {
          warn!(error = %e, "worker update request failed");
        }
      }
      None => debug!("no active worker to update"),
    }

    // Left partial on failure, so the next page load resets again
    if let Err(e) = self
      .db
      .complete_reset_record(&reset_id, Utc::now(), &counts)
    {
      warn!(reset_id = %reset_id, error = %e, "could not mark reset complete");
    }

    info!(
      reset_id = %reset_id,
      failed_surfaces = counts.failed_surfaces().len(),
      workers = counts.workers_unregistered,
      reply_failures = counts.worker_reply_failures,
      "reset finished"
    );
    Ok(ResetOutcome { reset_id, counts })
  }

  /// Immediate surfaces one after another, then the deferred ones as a
  /// single awaited batch.
  async fn clear_surfaces(&self, counts: &mut ResetCounts) {
    for surface in self
      .surfaces
      .iter()
      .filter(|s| s.phase() == ClearPhase::Immediate)
    {
      let result = surface.clear().await;
      counts.surfaces.push(SurfaceCount {
        surface: surface.kind(),
        result,
      });
    }

    // A join point, not parallel work: surfaces backed by the profile database
    // clear synchronously and finish one after another inside the batch.
    let deferred: Vec<&Arc<dyn PersistenceSurface>> = self
      .surfaces
      .iter()
      .filter(|s| s.phase() == ClearPhase::Deferred)
      .collect();
    let results = join_all(deferred.iter().map(|s| s.clear())).await;
    for (surface, result) in deferred.iter().zip(results) {
      counts.surfaces.push(SurfaceCount {
        surface: surface.kind(),
        result,
      });
    }
  }

  /// Unregister every worker, then ask each to drop its own caches.
  async fn retire_workers(&self, counts: &mut ResetCounts) {
    let registrations = self.registry.unregister_all();
    counts.workers_unregistered = registrations.len();

    let timeout = self.config.reply_timeout();
    let replies = join_all(
      registrations
        .iter()
        .map(|r| r.worker.request(ControlMessage::ClearCache, timeout)),
    )
    .await;

    for (registration, reply) in registrations.iter().zip(replies) {
      match reply {
        Ok(WorkerReply::Cleared { success: true }) => counts.worker_caches_cleared += 1,
        Ok(reply) => {
          warn!(scope = %registration.scope, ?reply, "worker could not clear its caches");
          counts.worker_reply_failures += 1;
        }
        Err(e) => {
          warn!(scope = %registration.scope, error = %e, "worker cache clear failed");
          counts.worker_reply_failures += 1;
        }
      }
      registration.worker.terminate();
    }
  }

  /// The check a page runs when it loads.
  pub async fn check_and_reset(&self) -> Result<CheckOutcome> {
    let location = self.page.location();
    let now = Utc::now();
    let last = self.last_record();

    let trigger = match decide(
      &location,
      self.config.force,
      last.as_ref(),
      now,
      self.config.cooldown(),
    ) {
      ResetDecision::NotRequired => return Ok(CheckOutcome::NotRequired),
      ResetDecision::Suppressed {
        trigger,
        last_reset_id,
      } => {
        info!(?trigger, last_reset_id = %last_reset_id, "reset suppressed by cooldown");
        return Ok(CheckOutcome::Suppressed {
          trigger,
          last_reset_id,
        });
      }
      ResetDecision::Run(trigger) => trigger,
    };

    info!(?trigger, url = %location, "reset required");
    let outcome = self.perform_full_reset().await?;

    let redirect = if is_auth_entry_point(&location) && !has_freshness_marker(&location) {
      Some(self.schedule_redirect(&location, Utc::now()))
    } else {
      None
    };

    Ok(CheckOutcome::Reset {
      trigger,
      outcome,
      redirect,
    })
  }

  /// Re-check a page that became visible again, once the last reset is old
  /// enough to be worth another look.
  pub async fn on_visible(&self) -> Result<CheckOutcome> {
    let now = Utc::now();
    let stale = match self.last_record() {
      Some(record) => now - record.started_at > self.config.revisit_interval(),
      None => true,
    };

    if stale {
      self.check_and_reset().await
    } else {
      Ok(CheckOutcome::NotRequired)
    }
  }

  fn last_record(&self) -> Option<ResetRecord> {
    match self.db.last_reset_record() {
      Ok(record) => record,
      Err(e) => {
        warn!(error = %e, "unreadable reset record, treating as absent");
        None
      }
    }
  }

  fn schedule_redirect(&self, location: &Url, now: DateTime<Utc>) -> ScheduledRedirect {
    let url = with_freshness_marker(location, now, &generate_reset_id(now));
    let page = self.page.clone();
    let delay = self.config.redirect_delay();
    let target = url.clone();

    debug!(url = %url, ?delay, "freshness redirect scheduled");
    let handle = tokio::spawn(async move {
      tokio::time::sleep(delay).await;
      page.navigate(&target);
    });

    ScheduledRedirect { url, handle }
  }
}
