use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub notes: String,
}

impl Project {
    pub fn create(name: impl Into<String>, notes: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            created_at: now,
            notes: notes.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Plate {
    pub id: String,
    pub project_id: String,
    pub source_filename: String,
    pub plate_number: u32,
    pub name: String,
    pub gcode_handle: String,
    pub estimated_duration_seconds: i64,
    #[serde(default)]
    pub thumbnail: Option<String>,
    #[serde(default = "default_quantity")]
    pub quantity_needed: u32,
    #[serde(default)]
    pub priority: i64,
}

fn default_quantity() -> u32 {
    1
}

impl Plate {
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        project_id: impl Into<String>,
        source_filename: impl Into<String>,
        plate_number: u32,
        name: impl Into<String>,
        gcode_handle: impl Into<String>,
        estimated_duration_seconds: i64,
        thumbnail: Option<String>,
        quantity_needed: u32,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            project_id: project_id.into(),
            source_filename: source_filename.into(),
            plate_number,
            name: name.into(),
            gcode_handle: gcode_handle.into(),
            estimated_duration_seconds,
            thumbnail,
            quantity_needed,
            priority: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Printing,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Job {
    pub id: String,
    pub plate_id: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub failure_reason: Option<String>,
}

impl Job {
    pub fn create(plate_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            plate_id: plate_id.into(),
            status: JobStatus::Queued,
            created_at: now,
            started_at: None,
            ended_at: None,
            failure_reason: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UnavailabilityWindow {
    pub id: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl UnavailabilityWindow {
    pub fn create(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            start,
            end,
        }
    }
}

/// A derived (never persisted) entry in a computed schedule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScheduledJob {
    pub job_id: String,
    pub plate_id: String,
    pub plate_name: String,
    pub plate_number: u32,
    pub source_filename: String,
    pub scheduled_start: DateTime<Utc>,
    pub scheduled_end: DateTime<Utc>,
    pub estimated_duration_seconds: i64,
    pub spans_unavailability: bool,
    pub thumbnail: Option<String>,
}

/// A derived (never persisted) projected timeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScheduleResult {
    pub jobs: Vec<ScheduledJob>,
    pub computed_at: DateTime<Utc>,
    pub cursor_at_computation: DateTime<Utc>,
    pub next_breakpoint: Option<DateTime<Utc>>,
}

impl ScheduleResult {
    pub fn next_recommended(&self) -> Option<&ScheduledJob> {
        self.jobs.first()
    }
}
