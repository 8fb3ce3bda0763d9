//! Periodic refresh driver.
//!
//! Two independent cadences: a heavy tick runs a full refresh, a light tick
//! runs an incremental one. Ticks that land while a refresh is in flight
//! are skipped, never queued. Cadences are re-read from the settings store
//! every iteration so changes apply after the current sleep.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::errors::RefreshError;
use crate::settings::SettingsStore;
use crate::updater::UpdateManager;

#[derive(Debug, Default)]
pub struct SchedulerState {
    next_full_at: Mutex<Option<DateTime<Utc>>>,
    next_incremental_at: Mutex<Option<DateTime<Utc>>>,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct SchedulerSnapshot {
    pub next_full_at: Option<DateTime<Utc>>,
    pub next_incremental_at: Option<DateTime<Utc>>,
}

impl SchedulerState {
    pub fn snapshot(&self) -> SchedulerSnapshot {
        SchedulerSnapshot {
            next_full_at: *self.next_full_at.lock(),
            next_incremental_at: *self.next_incremental_at.lock(),
        }
    }
}

/// Spawns the two cadence loops and returns the shared state used by the
/// status endpoint.
pub fn spawn(manager: Arc<UpdateManager>, settings: Arc<SettingsStore>) -> Arc<SchedulerState> {
    let state = Arc::new(SchedulerState::default());

    tokio::spawn(full_refresh_loop(
        manager.clone(),
        settings.clone(),
        state.clone(),
    ));
    tokio::spawn(incremental_refresh_loop(manager, settings, state.clone()));

    state
}

async fn full_refresh_loop(
    manager: Arc<UpdateManager>,
    settings: Arc<SettingsStore>,
    state: Arc<SchedulerState>,
) {
    info!("⏰ Full refresh loop started");

    // Boot: publish something as soon as possible instead of waiting a
    // whole heavy interval.
    if manager.current().built_at.is_none() {
        info!("⏰ No published result set yet, running initial full refresh");
        run_full(&manager).await;
    }

    loop {
        let interval = settings.snapshot().full_update_interval_secs;
        *state.next_full_at.lock() =
            Some(Utc::now() + ChronoDuration::seconds(interval as i64));
        tokio::time::sleep(Duration::from_secs(interval)).await;

        if manager.is_running() {
            debug!("Heavy tick skipped: refresh already in flight");
            continue;
        }
        run_full(&manager).await;
    }
}

async fn incremental_refresh_loop(
    manager: Arc<UpdateManager>,
    settings: Arc<SettingsStore>,
    state: Arc<SchedulerState>,
) {
    info!("⏰ Incremental refresh loop started");

    loop {
        let interval = settings.snapshot().incremental_update_interval_secs;
        *state.next_incremental_at.lock() =
            Some(Utc::now() + ChronoDuration::seconds(interval as i64));
        tokio::time::sleep(Duration::from_secs(interval)).await;

        if manager.is_running() {
            debug!("Light tick skipped: refresh already in flight");
            continue;
        }

        match manager.run_incremental_refresh().await {
            Ok(count) => debug!(items = count, "Scheduled incremental refresh done"),
            Err(RefreshError::AlreadyRunning) => {
                debug!("Light tick lost the gate race, skipping");
            }
            Err(e) => warn!(error = %e, "Scheduled incremental refresh failed"),
        }
    }
}

async fn run_full(manager: &UpdateManager) {
    match manager.run_full_refresh().await {
        Ok(count) => info!(items = count, "Scheduled full refresh done"),
        Err(RefreshError::AlreadyRunning) => {
            debug!("Heavy tick lost the gate race, skipping");
        }
        Err(e) => warn!(error = %e, "Scheduled full refresh failed"),
    }
}
