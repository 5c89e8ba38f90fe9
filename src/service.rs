//! Single entry point for command handlers (§4.5): validates input,
//! delegates to the Store, then invalidates the Coordinator's cached
//! schedule on any mutation.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::adapter::{PrinterAdapter, SignalSource};
use crate::coordinator::Coordinator;
use crate::errors::{CoreError, Result};
use crate::model::{Job, Plate, Project, UnavailabilityWindow};
use crate::store::Store;

/// The "Query surface" shape of §6: everything a client needs to render
/// the current state in one round trip.
#[derive(Debug, Clone, Serialize)]
pub struct QueueSnapshot {
    pub projects: Vec<ProjectWithProgress>,
    pub plates: Vec<Plate>,
    pub jobs: Vec<Job>,
    pub schedule: crate::model::ScheduleResult,
    pub computed_at: DateTime<Utc>,
    pub next_breakpoint: Option<DateTime<Utc>>,
    pub unavailability_windows: Vec<UnavailabilityWindow>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProjectWithProgress {
    #[serde(flatten)]
    pub project: Project,
    pub completed: usize,
    pub total: usize,
}

pub struct PrintAssistService<S: SignalSource> {
    store: Arc<Store>,
    coordinator: Arc<Coordinator<S>>,
    adapter: Option<Arc<PrinterAdapter<S>>>,
}

impl<S: SignalSource + 'static> PrintAssistService<S> {
    pub fn new(
        store: Arc<Store>,
        coordinator: Arc<Coordinator<S>>,
        adapter: Option<Arc<PrinterAdapter<S>>>,
    ) -> Self {
        Self {
            store,
            coordinator,
            adapter,
        }
    }

    pub async fn create_project(&self, name: &str, notes: &str) -> Result<Project> {
        if name.trim().is_empty() {
            return Err(CoreError::MalformedInput("project name must not be empty".to_string()));
        }
        let project = self.store.create_project(name, notes).await?;
        self.coordinator.invalidate_schedule().await;
        Ok(project)
    }

    pub async fn delete_project(&self, project_id: &str) -> Result<bool> {
        let deleted = self.store.delete_project(project_id).await?;
        self.coordinator.invalidate_schedule().await;
        Ok(deleted)
    }

    /// Persist Plates already parsed by an external file handler (§6's
    /// "File handler contract" is out of scope here; this is the
    /// downstream half of `upload_file`).
    pub async fn upload_file(&self, plates: Vec<Plate>) -> Result<()> {
        if plates.is_empty() {
            return Err(CoreError::MalformedInput("no plates to upload".to_string()));
        }
        self.store.add_plates(plates).await?;
        self.coordinator.invalidate_schedule().await;
        Ok(())
    }

    pub async fn delete_plate(&self, plate_id: &str) -> Result<bool> {
        let deleted = self.store.delete_plate(plate_id).await?;
        self.coordinator.invalidate_schedule().await;
        Ok(deleted)
    }

    pub async fn set_plate_priority(&self, plate_id: &str, priority: i64) -> Result<bool> {
        let updated = self.store.set_plate_priority(plate_id, priority).await?;
        self.coordinator.invalidate_schedule().await;
        Ok(updated)
    }

    pub async fn set_plate_quantity(&self, plate_id: &str, quantity: u32) -> Result<bool> {
        let updated = self.store.set_plate_quantity(plate_id, quantity).await?;
        self.coordinator.invalidate_schedule().await;
        Ok(updated)
    }

    /// Enforces the printer-singleton precondition (§9): refuses to start
    /// a Job while another is already printing.
    pub async fn start_job(&self, job_id: &str) -> Result<bool> {
        if self.store.get_active_job().await.is_some() {
            return Err(CoreError::PreconditionFailed(
                "a job is already printing".to_string(),
            ));
        }
        let started = self.store.start_job(job_id).await?;
        self.coordinator.invalidate_schedule().await;
        Ok(started)
    }

    pub async fn complete_job(&self, job_id: &str) -> Result<bool> {
        let completed = self.store.complete_job(job_id).await?;
        self.coordinator.invalidate_schedule().await;
        Ok(completed)
    }

    pub async fn fail_job(&self, job_id: &str, reason: Option<String>) -> Result<Option<Job>> {
        let replacement = self.store.fail_job(job_id, reason).await?;
        self.coordinator.invalidate_schedule().await;
        Ok(replacement)
    }

    pub async fn add_unavailability(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<UnavailabilityWindow> {
        let window = self.store.add_unavailability(start, end).await?;
        self.coordinator.invalidate_schedule().await;
        Ok(window)
    }

    pub async fn remove_unavailability(&self, window_id: &str) -> Result<bool> {
        let removed = self.store.remove_unavailability(window_id).await?;
        self.coordinator.invalidate_schedule().await;
        Ok(removed)
    }

    pub async fn get_queue_snapshot(&self, now: DateTime<Utc>) -> Result<QueueSnapshot> {
        let projects = self.store.get_projects().await;
        let mut projects_with_progress = Vec::with_capacity(projects.len());
        for project in projects {
            let (completed, total) = self.store.get_project_progress(&project.id).await;
            projects_with_progress.push(ProjectWithProgress {
                project,
                completed,
                total,
            });
        }

        let schedule = self.coordinator.get_schedule(now).await;

        Ok(QueueSnapshot {
            projects: projects_with_progress,
            plates: self.store.get_plates(None).await,
            jobs: self.store.get_jobs(None, None).await,
            computed_at: schedule.computed_at,
            next_breakpoint: schedule.next_breakpoint,
            schedule,
            unavailability_windows: self.store.get_unavailability_windows().await,
        })
    }

    pub fn adapter(&self) -> Option<&Arc<PrinterAdapter<S>>> {
        self.adapter.as_ref()
    }
}
