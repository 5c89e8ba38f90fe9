//! Transactional, crash-safe entity store (§4.2). Every mutating method
//! takes the write lock, mutates an in-memory snapshot, serialises it to
//! disk, and only then returns — so a reader can never observe a partial
//! write, and a crash mid-write leaves the previous snapshot intact.

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::StoreConfig;
use crate::errors::{CoreError, Result};
use crate::model::{Job, JobStatus, Plate, Project, UnavailabilityWindow};

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct StoreData {
    #[serde(default)]
    projects: Vec<Project>,
    #[serde(default)]
    plates: Vec<Plate>,
    #[serde(default)]
    jobs: Vec<Job>,
    #[serde(default)]
    unavailability_windows: Vec<UnavailabilityWindow>,
}

pub struct Store {
    data: RwLock<StoreData>,
    config: StoreConfig,
    clock: Arc<dyn Clock>,
}

impl Store {
    /// Load the snapshot at `config.snapshot_path` if present, otherwise
    /// start from an empty store (first-run case).
    pub async fn open(config: StoreConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let data = match tokio::fs::read(&config.snapshot_path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| CoreError::Persistence(format!("corrupt snapshot: {e}")))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %config.snapshot_path.display(), "no existing snapshot, starting fresh");
                StoreData::default()
            }
            Err(e) => return Err(CoreError::Io(e)),
        };

        Ok(Self {
            data: RwLock::new(data),
            config,
            clock,
        })
    }

    async fn save(&self, data: &StoreData) -> Result<()> {
        let path = &self.config.snapshot_path;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp_path = tmp_path_for(path);
        let serialized = serde_json::to_vec_pretty(data)?;
        tokio::fs::write(&tmp_path, &serialized).await?;
        tokio::fs::rename(&tmp_path, path).await?;
        debug!(path = %path.display(), "store snapshot persisted");
        Ok(())
    }

    fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.clock.now()
    }

    // ---- Projects ----------------------------------------------------

    pub async fn get_projects(&self) -> Vec<Project> {
        self.data.read().await.projects.clone()
    }

    pub async fn get_project(&self, project_id: &str) -> Option<Project> {
        self.data
            .read()
            .await
            .projects
            .iter()
            .find(|p| p.id == project_id)
            .cloned()
    }

    pub async fn create_project(&self, name: &str, notes: &str) -> Result<Project> {
        let project = Project::create(name, notes, self.now());
        let mut data = self.data.write().await;
        let mut next = data.clone();
        next.projects.push(project.clone());
        self.save(&next).await?;
        *data = next;
        info!(project_id = %project.id, "created project");
        Ok(project)
    }

    pub async fn delete_project(&self, project_id: &str) -> Result<bool> {
        let mut data = self.data.write().await;
        let before = data.projects.len();
        let mut next = data.clone();
        let plate_ids: Vec<String> = next
            .plates
            .iter()
            .filter(|p| p.project_id == project_id)
            .map(|p| p.id.clone())
            .collect();

        next.jobs.retain(|j| !plate_ids.contains(&j.plate_id));
        next.plates.retain(|p| p.project_id != project_id);
        next.projects.retain(|p| p.id != project_id);

        if next.projects.len() < before {
            self.save(&next).await?;
            *data = next;
            info!(project_id, "deleted project (cascaded plates and jobs)");
            Ok(true)
        } else {
            Ok(false)
        }
    }

    // ---- Plates --------------------------------------------------------

    pub async fn get_plates(&self, project_id: Option<&str>) -> Vec<Plate> {
        let data = self.data.read().await;
        match project_id {
            Some(id) => data
                .plates
                .iter()
                .filter(|p| p.project_id == id)
                .cloned()
                .collect(),
            None => data.plates.clone(),
        }
    }

    pub async fn get_plate(&self, plate_id: &str) -> Option<Plate> {
        self.data
            .read()
            .await
            .plates
            .iter()
            .find(|p| p.id == plate_id)
            .cloned()
    }

    /// Insert `plates` and spawn `quantity_needed` queued Jobs for each.
    pub async fn add_plates(&self, plates: Vec<Plate>) -> Result<()> {
        let mut data = self.data.write().await;
        let now = self.now();
        let mut next = data.clone();
        for plate in plates {
            for _ in 0..plate.quantity_needed {
                next.jobs.push(Job::create(plate.id.clone(), now));
            }
            next.plates.push(plate);
        }
        self.save(&next).await?;
        *data = next;
        Ok(())
    }

    pub async fn delete_plate(&self, plate_id: &str) -> Result<bool> {
        let mut data = self.data.write().await;
        let before = data.plates.len();
        let mut next = data.clone();
        next.jobs.retain(|j| j.plate_id != plate_id);
        next.plates.retain(|p| p.id != plate_id);

        if next.plates.len() < before {
            self.save(&next).await?;
            *data = next;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    pub async fn set_plate_priority(&self, plate_id: &str, priority: i64) -> Result<bool> {
        let mut data = self.data.write().await;
        let mut next = data.clone();
        match next.plates.iter_mut().find(|p| p.id == plate_id) {
            Some(plate) => {
                plate.priority = priority;
                self.save(&next).await?;
                *data = next;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Reconcile queued Jobs so that `queued + completed == quantity` (§4.2).
    pub async fn set_plate_quantity(&self, plate_id: &str, quantity: u32) -> Result<bool> {
        let mut data = self.data.write().await;
        if !data.plates.iter().any(|p| p.id == plate_id) {
            return Ok(false);
        }

        let completed = data
            .jobs
            .iter()
            .filter(|j| j.plate_id == plate_id && j.status == JobStatus::Completed)
            .count() as i64;
        let current_queued = data
            .jobs
            .iter()
            .filter(|j| j.plate_id == plate_id && j.status == JobStatus::Queued)
            .count() as i64;

        let needed_queued = (quantity as i64 - completed).max(0);
        let delta = needed_queued - current_queued;
        let now = self.now();

        let mut next = data.clone();
        if delta > 0 {
            for _ in 0..delta {
                next.jobs.push(Job::create(plate_id, now));
            }
        } else if delta < 0 {
            let mut to_remove = (-delta) as usize;
            // Remove from the end of the queued list, preserving order of the rest.
            let mut kept: Vec<Job> = Vec::with_capacity(next.jobs.len());
            let queued_indices: Vec<usize> = next
                .jobs
                .iter()
                .enumerate()
                .filter(|(_, j)| j.plate_id == plate_id && j.status == JobStatus::Queued)
                .map(|(i, _)| i)
                .collect();
            let drop_indices: std::collections::HashSet<usize> = queued_indices
                .iter()
                .rev()
                .take(to_remove)
                .copied()
                .collect();
            to_remove -= drop_indices.len();
            debug_assert_eq!(to_remove, 0);
            for (i, job) in next.jobs.drain(..).enumerate() {
                if !drop_indices.contains(&i) {
                    kept.push(job);
                }
            }
            next.jobs = kept;
        }

        if let Some(plate) = next.plates.iter_mut().find(|p| p.id == plate_id) {
            plate.quantity_needed = quantity;
        }

        self.save(&next).await?;
        *data = next;
        Ok(true)
    }

    // ---- Jobs ------------------------------------------------------------

    pub async fn get_jobs(&self, plate_id: Option<&str>, status: Option<JobStatus>) -> Vec<Job> {
        let data = self.data.read().await;
        data.jobs
            .iter()
            .filter(|j| plate_id.map_or(true, |id| j.plate_id == id))
            .filter(|j| status.map_or(true, |s| j.status == s))
            .cloned()
            .collect()
    }

    pub async fn get_job(&self, job_id: &str) -> Option<Job> {
        self.data
            .read()
            .await
            .jobs
            .iter()
            .find(|j| j.id == job_id)
            .cloned()
    }

    pub async fn get_queued_jobs(&self) -> Vec<Job> {
        self.get_jobs(None, Some(JobStatus::Queued)).await
    }

    pub async fn get_active_job(&self) -> Option<Job> {
        self.data
            .read()
            .await
            .jobs
            .iter()
            .find(|j| j.status == JobStatus::Printing)
            .cloned()
    }

    pub async fn start_job(&self, job_id: &str) -> Result<bool> {
        let mut data = self.data.write().await;
        let now = self.now();
        let mut next = data.clone();
        match next
            .jobs
            .iter_mut()
            .find(|j| j.id == job_id && j.status == JobStatus::Queued)
        {
            Some(job) => {
                job.status = JobStatus::Printing;
                job.started_at = Some(now);
                self.save(&next).await?;
                *data = next;
                info!(job_id, "started job");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn complete_job(&self, job_id: &str) -> Result<bool> {
        let mut data = self.data.write().await;
        let now = self.now();
        let mut next = data.clone();
        match next
            .jobs
            .iter_mut()
            .find(|j| j.id == job_id && j.status == JobStatus::Printing)
        {
            Some(job) => {
                job.status = JobStatus::Completed;
                job.ended_at = Some(now);
                self.save(&next).await?;
                *data = next;
                info!(job_id, "completed job");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Transition a printing Job to `failed` and atomically spawn a fresh
    /// queued Job for the same Plate (§4.2). Returns the replacement.
    pub async fn fail_job(&self, job_id: &str, reason: Option<String>) -> Result<Option<Job>> {
        let mut data = self.data.write().await;
        let now = self.now();
        let mut next = data.clone();

        let plate_id = match next
            .jobs
            .iter_mut()
            .find(|j| j.id == job_id && j.status == JobStatus::Printing)
        {
            Some(job) => {
                job.status = JobStatus::Failed;
                job.ended_at = Some(now);
                job.failure_reason = reason.clone();
                job.plate_id.clone()
            }
            None => return Ok(None),
        };

        let replacement = Job::create(plate_id, now);
        next.jobs.push(replacement.clone());
        self.save(&next).await?;
        *data = next;
        warn!(job_id, reason = ?reason, replacement_job_id = %replacement.id, "job failed, replacement queued");
        Ok(Some(replacement))
    }

    pub async fn get_project_progress(&self, project_id: &str) -> (usize, usize) {
        let data = self.data.read().await;
        let plate_ids: std::collections::HashSet<&str> = data
            .plates
            .iter()
            .filter(|p| p.project_id == project_id)
            .map(|p| p.id.as_str())
            .collect();

        let completed = data
            .jobs
            .iter()
            .filter(|j| plate_ids.contains(j.plate_id.as_str()) && j.status == JobStatus::Completed)
            .count();
        let total: u32 = data
            .plates
            .iter()
            .filter(|p| p.project_id == project_id)
            .map(|p| p.quantity_needed)
            .sum();

        (completed, total as usize)
    }

    // ---- Unavailability windows -------------------------------------------

    pub async fn get_unavailability_windows(&self) -> Vec<UnavailabilityWindow> {
        self.data.read().await.unavailability_windows.clone()
    }

    pub async fn add_unavailability(
        &self,
        start: chrono::DateTime<chrono::Utc>,
        end: chrono::DateTime<chrono::Utc>,
    ) -> Result<UnavailabilityWindow> {
        if end <= start {
            return Err(CoreError::MalformedInput(
                "unavailability window end must be after start".to_string(),
            ));
        }
        let window = UnavailabilityWindow::create(start, end);
        let mut data = self.data.write().await;
        let mut next = data.clone();
        next.unavailability_windows.push(window.clone());
        self.save(&next).await?;
        *data = next;
        Ok(window)
    }

    pub async fn remove_unavailability(&self, window_id: &str) -> Result<bool> {
        let mut data = self.data.write().await;
        let before = data.unavailability_windows.len();
        let mut next = data.clone();
        next.unavailability_windows.retain(|w| w.id != window_id);
        if next.unavailability_windows.len() < before {
            self.save(&next).await?;
            *data = next;
            Ok(true)
        } else {
            Ok(false)
        }
    }
}

fn tmp_path_for(path: &Path) -> std::path::PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    std::path::PathBuf::from(tmp)
}
