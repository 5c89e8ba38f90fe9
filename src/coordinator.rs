//! Owns the cached [`ScheduleResult`] and decides when it must be
//! recomputed: on a 30-second tick, past its breakpoint, or when the
//! fingerprint of its inputs has drifted (§4.4).

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::adapter::{PrinterAdapter, SignalSource};
use crate::config::{CoordinatorConfig, SchedulerConfig};
use crate::model::ScheduleResult;
use crate::scheduler::compute_schedule;
use crate::store::Store;

struct Cached {
    result: ScheduleResult,
    fingerprint: String,
}

/// Maintains a memoised [`ScheduleResult`] over a [`Store`] and an
/// optional [`PrinterAdapter`], recomputing only when inputs or time
/// dictate (§4.4's recompute predicate).
pub struct Coordinator<S: SignalSource> {
    store: Arc<Store>,
    adapter: RwLock<Option<Arc<PrinterAdapter<S>>>>,
    scheduler_config: SchedulerConfig,
    coordinator_config: CoordinatorConfig,
    cached: RwLock<Option<Cached>>,
}

impl<S: SignalSource + 'static> Coordinator<S> {
    pub fn new(
        store: Arc<Store>,
        scheduler_config: SchedulerConfig,
        coordinator_config: CoordinatorConfig,
    ) -> Self {
        Self {
            store,
            adapter: RwLock::new(None),
            scheduler_config,
            coordinator_config,
            cached: RwLock::new(None),
        }
    }

    pub async fn set_printer_adapter(&self, adapter: Arc<PrinterAdapter<S>>) {
        *self.adapter.write().await = Some(adapter);
    }

    /// Drop the cached result and fingerprint, forcing the next call to
    /// [`Self::refresh_if_needed`] (or [`Self::get_schedule`]) to recompute.
    pub async fn invalidate_schedule(&self) {
        *self.cached.write().await = None;
        debug!("schedule cache invalidated");
    }

    /// Returns the current (possibly freshly recomputed) schedule.
    pub async fn get_schedule(&self, now: DateTime<Utc>) -> ScheduleResult {
        self.refresh_if_needed(now).await
    }

    pub async fn refresh_if_needed(&self, now: DateTime<Utc>) -> ScheduleResult {
        let active_job_end = self.resolve_active_job_end(now).await;
        let fingerprint = self.compute_fingerprint(active_job_end).await;

        if let Some(cached) = self.cached.read().await.as_ref() {
            let breakpoint_passed = cached
                .result
                .next_breakpoint
                .map(|bp| now >= bp)
                .unwrap_or(false);
            if !breakpoint_passed && cached.fingerprint == fingerprint {
                return cached.result.clone();
            }
        }

        let result = self.recompute(now, active_job_end).await;
        *self.cached.write().await = Some(Cached {
            result: result.clone(),
            fingerprint,
        });
        info!(jobs = result.jobs.len(), "schedule recomputed");
        result
    }

    async fn recompute(
        &self,
        now: DateTime<Utc>,
        active_job_end: Option<DateTime<Utc>>,
    ) -> ScheduleResult {
        let queued_jobs = self.store.get_queued_jobs().await;
        let plates = self.store.get_plates(None).await;
        let windows = self.store.get_unavailability_windows().await;

        let plates_by_id: std::collections::HashMap<String, crate::model::Plate> =
            plates.into_iter().map(|p| (p.id.clone(), p)).collect();

        compute_schedule(
            &crate::scheduler::ScheduleInputs {
                queued_jobs: &queued_jobs,
                plates_by_id: &plates_by_id,
                windows: &windows,
                now,
                active_job_end,
            },
            &self.scheduler_config,
        )
    }

    /// Active-job-end resolution order: adapter blocking end-time, adapter
    /// known end-time, started_at + estimated duration, or null (§4.4).
    async fn resolve_active_job_end(&self, _now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if let Some(adapter) = self.adapter.read().await.as_ref() {
            if let Some(blocking) = adapter.get_blocking_end_time().await {
                return Some(blocking);
            }
            if let Some(known) = adapter.get_end_time().await {
                return Some(known);
            }
        }

        let active_job = self.store.get_active_job().await?;
        let started_at = active_job.started_at?;
        let plate = self.store.get_plate(&active_job.plate_id).await?;
        Some(started_at + chrono::Duration::seconds(plate.estimated_duration_seconds))
    }

    async fn compute_fingerprint(&self, active_job_end: Option<DateTime<Utc>>) -> String {
        let mut hasher = Sha256::new();

        let mut queued_jobs = self.store.get_queued_jobs().await;
        queued_jobs.sort_by(|a, b| a.id.cmp(&b.id));
        for job in &queued_jobs {
            hasher.update(job.id.as_bytes());
            hasher.update(job.plate_id.as_bytes());
            hasher.update(format!("{:?}", job.status).as_bytes());
        }

        let mut plates = self.store.get_plates(None).await;
        plates.sort_by(|a, b| a.id.cmp(&b.id));
        for plate in &plates {
            hasher.update(plate.id.as_bytes());
            hasher.update(plate.priority.to_le_bytes());
            hasher.update(plate.estimated_duration_seconds.to_le_bytes());
        }

        let mut windows = self.store.get_unavailability_windows().await;
        windows.sort_by(|a, b| a.id.cmp(&b.id));
        for window in &windows {
            hasher.update(window.id.as_bytes());
            hasher.update(window.start.timestamp().to_le_bytes());
            hasher.update(window.end.timestamp().to_le_bytes());
        }

        let active_job_id = self.store.get_active_job().await.map(|j| j.id);
        hasher.update(active_job_id.as_deref().unwrap_or("").as_bytes());
        hasher.update(
            active_job_end
                .map(|t| t.timestamp().to_string())
                .unwrap_or_default()
                .as_bytes(),
        );

        hex::encode(hasher.finalize())
    }

    /// Spawn a background task ticking every
    /// `coordinator_config.refresh_interval_secs`, calling
    /// `refresh_if_needed` with the wall clock. Abort the returned handle
    /// to stop the loop (§4.4.2).
    pub fn spawn_refresh_task(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.coordinator_config.refresh_interval());
            loop {
                ticker.tick().await;
                self.refresh_if_needed(Utc::now()).await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::StaticSignalSource;
    use crate::clock::test_support::FixedClock;
    use crate::clock::Clock;
    use crate::config::StoreConfig;
    use crate::model::{Plate, UnavailabilityWindow};
    use chrono::TimeZone;

    async fn fresh_store() -> Arc<Store> {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig {
            snapshot_path: dir.path().join("store.json"),
        };
        let clock: Arc<dyn Clock> = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()));
        Arc::new(Store::open(config, clock).await.unwrap())
    }

    #[tokio::test]
    async fn recomputes_when_fingerprint_changes() {
        let store = fresh_store().await;
        let coordinator: Coordinator<StaticSignalSource> = Coordinator::new(
            store.clone(),
            SchedulerConfig::default(),
            CoordinatorConfig::default(),
        );

        let now = Utc.with_ymd_and_hms(2024, 1, 1, 8, 0, 0).unwrap();
        let first = coordinator.get_schedule(now).await;
        assert!(first.jobs.is_empty());

        let project = store.create_project("P", "").await.unwrap();
        let plate = Plate::create(project.id, "a.3mf", 1, "A", "h", 3600, None, 1);
        store.add_plates(vec![plate]).await.unwrap();

        let second = coordinator.get_schedule(now).await;
        assert_eq!(second.jobs.len(), 1);
    }

    #[tokio::test]
    async fn reuses_cache_when_nothing_changed() {
        let store = fresh_store().await;
        let project = store.create_project("P", "").await.unwrap();
        let plate = Plate::create(project.id, "a.3mf", 1, "A", "h", 3600, None, 1);
        store.add_plates(vec![plate]).await.unwrap();

        let coordinator: Coordinator<StaticSignalSource> = Coordinator::new(
            store.clone(),
            SchedulerConfig::default(),
            CoordinatorConfig::default(),
        );

        let now = Utc.with_ymd_and_hms(2024, 1, 1, 8, 0, 0).unwrap();
        let first = coordinator.get_schedule(now).await;
        let second = coordinator.get_schedule(now).await;
        assert_eq!(first.computed_at, second.computed_at);
    }

    #[tokio::test]
    async fn invalidate_forces_recompute() {
        let store = fresh_store().await;
        let coordinator: Coordinator<StaticSignalSource> = Coordinator::new(
            store.clone(),
            SchedulerConfig::default(),
            CoordinatorConfig::default(),
        );

        let now = Utc.with_ymd_and_hms(2024, 1, 1, 8, 0, 0).unwrap();
        let first = coordinator.get_schedule(now).await;
        coordinator.invalidate_schedule().await;
        let second = coordinator.get_schedule(now + chrono::Duration::seconds(1)).await;
        assert_ne!(first.computed_at, second.computed_at);
    }

    #[tokio::test]
    async fn breakpoint_crossing_forces_recompute_even_without_fingerprint_change() {
        let store = fresh_store().await;
        store
            .add_unavailability(
                Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap(),
                Utc.with_ymd_and_hms(2024, 1, 1, 20, 0, 0).unwrap(),
            )
            .await
            .unwrap();
        let project = store.create_project("P", "").await.unwrap();
        let plate = Plate::create(project.id, "a.3mf", 1, "A", "h", 3600, None, 1);
        store.add_plates(vec![plate]).await.unwrap();

        let coordinator: Coordinator<StaticSignalSource> = Coordinator::new(
            store.clone(),
            SchedulerConfig::default(),
            CoordinatorConfig::default(),
        );

        let early = Utc.with_ymd_and_hms(2024, 1, 1, 8, 0, 0).unwrap();
        let first = coordinator.get_schedule(early).await;
        assert!(first.next_breakpoint.is_some());

        let past_breakpoint = first.next_breakpoint.unwrap() + chrono::Duration::seconds(1);
        let second = coordinator.get_schedule(past_breakpoint).await;
        assert_ne!(first.computed_at, second.computed_at);
    }
}
