//! Bridges an external printer device's observable signals (status,
//! end-time, task name, gcode filename) into Store transitions (§4.3).

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::model::Job;
use crate::store::Store;

pub const STATUS_IDLE: &str = "idle";
pub const STATUS_PREPARE: &str = "prepare";
pub const STATUS_RUNNING: &str = "running";
pub const STATUS_FINISH: &str = "finish";
pub const STATUS_OFFLINE: &str = "offline";

const SENTINEL_VALUES: [&str; 3] = ["unknown", "unavailable", ""];

/// A single observed entity value, as if read off a state machine.
#[derive(Debug, Clone)]
pub struct SignalValue {
    pub value: String,
}

/// The four suffix-identified signals a printer device exposes, resolved
/// once at setup against a device id.
#[derive(Debug, Clone, Default)]
pub struct ResolvedEntities {
    pub status_entity: Option<String>,
    pub end_time_entity: Option<String>,
    pub task_name_entity: Option<String>,
    pub gcode_filename_entity: Option<String>,
}

/// A state-change event on a single entity.
#[derive(Debug, Clone)]
pub struct StateChange {
    pub entity_id: String,
    pub old_value: Option<String>,
    pub new_value: String,
}

/// Abstraction over "some external system exposing named entities and
/// emitting state-change events for them" (§4.3.1) — the seam that lets
/// the adapter's transition and matching logic run against a fake in
/// tests instead of a live printer connection.
#[async_trait::async_trait]
pub trait SignalSource: Send + Sync {
    async fn resolve_entities(&self, device_id: &str) -> ResolvedEntities;
    async fn read_state(&self, entity_id: &str) -> Option<SignalValue>;
    /// Subscribe to state-change events; returns a receiver that yields
    /// every change on the source, not just the ones the adapter cares
    /// about (the adapter filters by entity id itself, matching the
    /// original's whole-bus listener).
    async fn subscribe(&self) -> mpsc::UnboundedReceiver<StateChange>;
}

/// In-memory test double: a fixed entity map plus a channel producers can
/// push state changes onto.
#[cfg(any(test, feature = "test-support"))]
pub struct StaticSignalSource {
    entities: ResolvedEntities,
    state: RwLock<HashMap<String, String>>,
    sender: mpsc::UnboundedSender<StateChange>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<StateChange>>>,
}

#[cfg(any(test, feature = "test-support"))]
impl StaticSignalSource {
    pub fn new(entities: ResolvedEntities) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            entities,
            state: RwLock::new(HashMap::new()),
            sender,
            receiver: Mutex::new(Some(receiver)),
        }
    }

    pub async fn set(&self, entity_id: &str, value: impl Into<String>) {
        let value = value.into();
        let old = self.state.write().await.insert(entity_id.to_string(), value.clone());
        let _ = self.sender.send(StateChange {
            entity_id: entity_id.to_string(),
            old_value: old,
            new_value: value,
        });
    }
}

#[cfg(any(test, feature = "test-support"))]
#[async_trait::async_trait]
impl SignalSource for StaticSignalSource {
    async fn resolve_entities(&self, _device_id: &str) -> ResolvedEntities {
        self.entities.clone()
    }

    async fn read_state(&self, entity_id: &str) -> Option<SignalValue> {
        self.state
            .read()
            .await
            .get(entity_id)
            .cloned()
            .map(|value| SignalValue { value })
    }

    async fn subscribe(&self) -> mpsc::UnboundedReceiver<StateChange> {
        self.receiver
            .lock()
            .await
            .take()
            .expect("StaticSignalSource::subscribe called more than once")
    }
}

struct UnknownPrint {
    detected_at: DateTime<Utc>,
    task_name: String,
}

/// Tracks a printer device's lifecycle and keeps the Store's active Job in
/// sync with it.
pub struct PrinterAdapter<S: SignalSource> {
    device_id: String,
    source: Arc<S>,
    store: Arc<Store>,
    clock: Arc<dyn Clock>,
    entities: RwLock<ResolvedEntities>,
    last_status: RwLock<Option<String>>,
    unknown_print: RwLock<Option<UnknownPrint>>,
    unknown_print_fallback: Duration,
    on_schedule_change: Box<dyn Fn() + Send + Sync>,
    // Plain std Mutex: only ever touched from the synchronous spawn_listener/
    // shutdown/drop paths, never held across an .await.
    listener_handle: std::sync::Mutex<Option<tokio::task::AbortHandle>>,
}

impl<S: SignalSource + 'static> PrinterAdapter<S> {
    /// `unknown_print_fallback_secs` is `CoordinatorConfig::unknown_print_fallback_secs`
    /// (§4.4's conservative lower bound, defaulted to 1 hour) — the estimate
    /// `get_blocking_end_time` falls back to when an unknown print reports no
    /// end time of its own.
    pub fn new(
        device_id: impl Into<String>,
        source: Arc<S>,
        store: Arc<Store>,
        clock: Arc<dyn Clock>,
        unknown_print_fallback_secs: i64,
        on_schedule_change: impl Fn() + Send + Sync + 'static,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            source,
            store,
            clock,
            entities: RwLock::new(ResolvedEntities::default()),
            last_status: RwLock::new(None),
            unknown_print: RwLock::new(None),
            unknown_print_fallback: Duration::seconds(unknown_print_fallback_secs),
            on_schedule_change: Box::new(on_schedule_change),
            listener_handle: std::sync::Mutex::new(None),
        }
    }

    /// Resolve entities, read the current status, and run the initial
    /// transition if already printing. Returns false if the status entity
    /// cannot be resolved (§4.3).
    pub async fn setup(&self) -> bool {
        let entities = self.source.resolve_entities(&self.device_id).await;
        if entities.status_entity.is_none() {
            warn!(device_id = %self.device_id, "no print_status entity found");
            return false;
        }

        let status_entity = entities.status_entity.clone().unwrap();
        let status = match self.source.read_state(&status_entity).await {
            Some(v) => v.value,
            None => {
                warn!(entity = %status_entity, "status entity not found");
                return false;
            }
        };

        info!(status = %status, "printer adapter initialized");
        *self.entities.write().await = entities;
        *self.last_status.write().await = Some(status.clone());

        if status == STATUS_RUNNING {
            self.handle_print_started().await;
        }

        true
    }

    /// Spawn a background task that forwards state-change events for the
    /// resolved status entity into `on_status_change`. The adapter keeps its
    /// own `AbortHandle` alongside the one returned here, so release does
    /// not depend on the caller holding onto (or aborting) the returned
    /// handle: [`Self::shutdown`] and `Drop` both terminate the task on
    /// every exit path (§4.3.1, §9 "Event subscription lifetime"). Calling
    /// this again replaces the previous listener, aborting it first.
    pub fn spawn_listener(self: &Arc<Self>) -> JoinHandle<()> {
        let adapter = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut rx = adapter.source.subscribe().await;
            while let Some(change) = rx.recv().await {
                let status_entity = adapter.entities.read().await.status_entity.clone();
                if status_entity.as_deref() == Some(change.entity_id.as_str()) {
                    adapter.on_status_change(change).await;
                }
            }
        });

        let previous = self
            .listener_handle
            .lock()
            .unwrap()
            .replace(handle.abort_handle());
        if let Some(stale) = previous {
            stale.abort();
        }

        handle
    }

    /// Unsubscribe from the external device and release the listener task,
    /// mirroring the original's `async_unload` (§9 "Event subscription
    /// lifetime"). Idempotent: safe to call when no listener was ever
    /// spawned, or more than once.
    pub fn shutdown(&self) {
        if let Some(handle) = self.listener_handle.lock().unwrap().take() {
            handle.abort();
            info!(device_id = %self.device_id, "printer adapter listener unsubscribed");
        }
    }

    async fn on_status_change(&self, change: StateChange) {
        let old_status = change.old_value.clone();
        let new_status = change.new_value.clone();

        if old_status.as_deref() == Some(new_status.as_str()) {
            return;
        }

        debug!(?old_status, %new_status, "printer status changed");
        *self.last_status.write().await = Some(new_status.clone());

        if new_status == STATUS_RUNNING {
            self.handle_print_started().await;
        } else if old_status.as_deref() == Some(STATUS_RUNNING)
            && (new_status == STATUS_FINISH || new_status == STATUS_IDLE)
        {
            self.handle_print_completed().await;
        }
    }

    async fn handle_print_started(&self) {
        let task_name = match self.get_task_name().await {
            Some(t) => t,
            None => {
                debug!("print started but no task name available");
                return;
            }
        };

        if self.store.get_active_job().await.is_some() {
            debug!("print already tracked as active");
            return;
        }

        match self.match_job_to_task(&task_name).await {
            Some(job) => {
                let _ = self.store.start_job(&job.id).await;
                *self.unknown_print.write().await = None;
                info!(job_id = %job.id, %task_name, "auto-started job");
            }
            None => {
                let detected_at = self.clock.now();
                info!(%task_name, "unknown print detected, blocking scheduler");
                *self.unknown_print.write().await = Some(UnknownPrint {
                    detected_at,
                    task_name,
                });
            }
        }

        (self.on_schedule_change)();
    }

    async fn handle_print_completed(&self) {
        let had_unknown = self.unknown_print.write().await.take();
        if let Some(unknown) = had_unknown {
            info!(task_name = %unknown.task_name, "unknown print completed");
            (self.on_schedule_change)();
            return;
        }

        if let Some(active) = self.store.get_active_job().await {
            let _ = self.store.complete_job(&active.id).await;
            info!(job_id = %active.id, "auto-completed job");
        } else {
            debug!("print completed but no active job tracked");
            return;
        }

        (self.on_schedule_change)();
    }

    async fn get_task_name(&self) -> Option<String> {
        let entities = self.entities.read().await;
        for entity in [&entities.task_name_entity, &entities.gcode_filename_entity]
            .into_iter()
            .flatten()
        {
            if let Some(state) = self.source.read_state(entity).await {
                if !SENTINEL_VALUES.contains(&state.value.as_str()) {
                    return Some(state.value);
                }
            }
        }
        None
    }

    async fn match_job_to_task(&self, task_name: &str) -> Option<Job> {
        let task_name_lower = task_name.to_lowercase();
        let task_stem = stem_lower(task_name);

        for job in self.store.get_queued_jobs().await {
            let plate = match self.store.get_plate(&job.plate_id).await {
                Some(p) => p,
                None => continue,
            };

            let source_lower = plate.source_filename.to_lowercase();
            if task_name_lower.contains(&source_lower) {
                return Some(job);
            }

            let base_name = stem_lower(&plate.source_filename);
            if task_name_lower.contains(&base_name) {
                return Some(job);
            }

            if task_stem.contains(&base_name) || source_lower.contains(&task_stem) {
                return Some(job);
            }
        }
        None
    }

    /// The end-time signal, parsed to UTC, or null on a sentinel/invalid
    /// value (§4.3 "Known end-time").
    pub async fn get_end_time(&self) -> Option<DateTime<Utc>> {
        let entity = self.entities.read().await.end_time_entity.clone()?;
        let state = self.source.read_state(&entity).await?;
        if SENTINEL_VALUES.contains(&state.value.as_str()) {
            return None;
        }
        parse_end_time(&state.value)
    }

    /// Returns an end-time estimate while an unknown print blocks the
    /// scheduler, else null (§4.3 "Blocking end-time").
    pub async fn get_blocking_end_time(&self) -> Option<DateTime<Utc>> {
        let detected_at = match self.unknown_print.read().await.as_ref() {
            Some(u) => u.detected_at,
            None => return None,
        };

        if let Some(end_time) = self.get_end_time().await {
            return Some(end_time);
        }

        Some(detected_at + self.unknown_print_fallback)
    }

    pub async fn is_printing(&self) -> bool {
        self.last_status.read().await.as_deref() == Some(STATUS_RUNNING)
    }
}

impl<S: SignalSource> Drop for PrinterAdapter<S> {
    /// Backstop for callers that drop every handle without ever calling
    /// `shutdown()`. Note the spawned listener task itself holds an
    /// `Arc<Self>` (§4.3.1), so while the listener is running this only
    /// fires once that task has already ended (e.g. via `shutdown`) and
    /// the caller drops its own handle afterwards, or when no listener was
    /// ever spawned in the first place. `shutdown()` remains the
    /// authoritative teardown path.
    fn drop(&mut self) {
        if let Some(handle) = self.listener_handle.lock().unwrap().take() {
            handle.abort();
        }
    }
}

fn stem_lower(filename: &str) -> String {
    Path::new(filename)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(filename)
        .to_lowercase()
}

fn parse_end_time(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S")
        .ok()
        .map(|naive| DateTime::from_naive_utc_and_offset(naive, Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::test_support::FixedClock;
    use crate::config::StoreConfig;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn entities() -> ResolvedEntities {
        ResolvedEntities {
            status_entity: Some("sensor.printer_status".to_string()),
            end_time_entity: Some("sensor.printer_end_time".to_string()),
            task_name_entity: Some("sensor.printer_task_name".to_string()),
            gcode_filename_entity: Some("sensor.printer_gcode_filename".to_string()),
        }
    }

    async fn fresh_store(clock: Arc<dyn Clock>) -> Arc<Store> {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig {
            snapshot_path: dir.path().join("store.json"),
        };
        let store = Store::open(config, clock).await.unwrap();
        Arc::new(store)
    }

    #[tokio::test]
    async fn matches_job_by_substring_and_starts_it() {
        let clock: Arc<dyn Clock> = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()));
        let store = fresh_store(clock.clone()).await;
        let project = store.create_project("P", "").await.unwrap();
        let plate = crate::model::Plate::create(project.id, "benchy_PLA_2h30m.gcode.3mf", 1, "Benchy", "h", 9000, None, 1);
        store.add_plates(vec![plate.clone()]).await.unwrap();

        let source = Arc::new(StaticSignalSource::new(entities()));
        source.set("sensor.printer_status", STATUS_IDLE).await;
        source.set("sensor.printer_task_name", "benchy_PLA_2h30m.gcode.3mf").await;

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let adapter = PrinterAdapter::new("device-1", source.clone(), store.clone(), clock, 3600, move || {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });

        assert!(adapter.setup().await);
        source.set("sensor.printer_status", STATUS_RUNNING).await;
        adapter.on_status_change(StateChange {
            entity_id: "sensor.printer_status".to_string(),
            old_value: Some(STATUS_IDLE.to_string()),
            new_value: STATUS_RUNNING.to_string(),
        }).await;

        let active = store.get_active_job().await;
        assert!(active.is_some());
        assert_eq!(active.unwrap().plate_id, plate.id);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unmatched_task_blocks_scheduler_with_fallback_end_time() {
        let clock: Arc<dyn Clock> = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()));
        let store = fresh_store(clock.clone()).await;

        let source = Arc::new(StaticSignalSource::new(entities()));
        source.set("sensor.printer_status", STATUS_IDLE).await;
        source.set("sensor.printer_task_name", "unrelated_file.3mf").await;

        let adapter = PrinterAdapter::new("device-1", source.clone(), store.clone(), clock, 3600, || {});
        assert!(adapter.setup().await);

        adapter.on_status_change(StateChange {
            entity_id: "sensor.printer_status".to_string(),
            old_value: Some(STATUS_IDLE.to_string()),
            new_value: STATUS_RUNNING.to_string(),
        }).await;

        assert!(store.get_active_job().await.is_none());
        let blocking = adapter.get_blocking_end_time().await;
        assert_eq!(blocking, Some(Utc.with_ymd_and_hms(2024, 1, 1, 13, 0, 0).unwrap()));
    }

    #[tokio::test]
    async fn blocking_end_time_honours_configured_fallback() {
        let clock: Arc<dyn Clock> = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()));
        let store = fresh_store(clock.clone()).await;

        let source = Arc::new(StaticSignalSource::new(entities()));
        source.set("sensor.printer_status", STATUS_IDLE).await;
        source.set("sensor.printer_task_name", "unrelated_file.3mf").await;

        let adapter = PrinterAdapter::new("device-1", source.clone(), store.clone(), clock, 900, || {});
        assert!(adapter.setup().await);

        adapter.on_status_change(StateChange {
            entity_id: "sensor.printer_status".to_string(),
            old_value: Some(STATUS_IDLE.to_string()),
            new_value: STATUS_RUNNING.to_string(),
        }).await;

        let blocking = adapter.get_blocking_end_time().await;
        assert_eq!(blocking, Some(Utc.with_ymd_and_hms(2024, 1, 1, 12, 15, 0).unwrap()));
    }

    #[tokio::test]
    async fn completed_transition_completes_active_job() {
        let clock: Arc<dyn Clock> = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()));
        let store = fresh_store(clock.clone()).await;
        let project = store.create_project("P", "").await.unwrap();
        let plate = crate::model::Plate::create(project.id, "a.3mf", 1, "A", "h", 100, None, 1);
        store.add_plates(vec![plate.clone()]).await.unwrap();
        let job = store.get_queued_jobs().await.remove(0);
        store.start_job(&job.id).await.unwrap();

        let source = Arc::new(StaticSignalSource::new(entities()));
        source.set("sensor.printer_status", STATUS_RUNNING).await;
        let adapter = PrinterAdapter::new("device-1", source.clone(), store.clone(), clock, 3600, || {});
        assert!(adapter.setup().await);

        adapter.on_status_change(StateChange {
            entity_id: "sensor.printer_status".to_string(),
            old_value: Some(STATUS_RUNNING.to_string()),
            new_value: STATUS_FINISH.to_string(),
        }).await;

        let job = store.get_job(&job.id).await.unwrap();
        assert_eq!(job.status, crate::model::JobStatus::Completed);
    }

    #[test]
    fn stem_matching_tolerates_slicer_suffixes() {
        assert_eq!(stem_lower("benchy.3mf"), "benchy");
        assert_eq!(stem_lower("benchy_PLA_2h30m.gcode.3mf"), "benchy_pla_2h30m.gcode");
    }

    #[tokio::test]
    async fn shutdown_aborts_listener_without_caller_aborting_the_returned_handle() {
        let clock: Arc<dyn Clock> = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()));
        let store = fresh_store(clock.clone()).await;
        let source = Arc::new(StaticSignalSource::new(entities()));
        source.set("sensor.printer_status", STATUS_IDLE).await;

        let adapter = Arc::new(PrinterAdapter::new("device-1", source.clone(), store.clone(), clock, 3600, || {}));
        assert!(adapter.setup().await);

        // Caller never calls `.abort()` on the returned handle itself; the
        // adapter's own bookkeeping must still let `shutdown` tear the
        // listener down.
        let handle = adapter.spawn_listener();

        adapter.shutdown();
        // Idempotent: calling it again with no listener left must not panic.
        adapter.shutdown();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(handle.is_finished());
    }

    #[tokio::test]
    async fn respawning_the_listener_aborts_the_previous_one() {
        let clock: Arc<dyn Clock> = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()));
        let store = fresh_store(clock.clone()).await;
        let source = Arc::new(StaticSignalSource::new(entities()));
        source.set("sensor.printer_status", STATUS_IDLE).await;

        let adapter = Arc::new(PrinterAdapter::new("device-1", source.clone(), store.clone(), clock, 3600, || {}));
        assert!(adapter.setup().await);

        let first = adapter.spawn_listener();
        let _second = adapter.spawn_listener();

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(first.is_finished());

        adapter.shutdown();
    }
}
