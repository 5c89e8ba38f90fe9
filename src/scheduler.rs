//! Pure, deterministic placement of queued jobs onto a timeline partitioned
//! by unavailability windows. No I/O, no locks, no async: this module is a
//! plain function so it can be called synchronously from inside the async
//! [`crate::coordinator`] without an `.await` boundary.

use std::collections::HashMap;

use chrono::{DateTime, Duration as ChronoDuration, Utc};

use crate::config::SchedulerConfig;
use crate::model::{Job, Plate, ScheduleResult, ScheduledJob, UnavailabilityWindow};

#[derive(Debug, Clone, Copy)]
struct Window {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct Remaining {
    job: Job,
    plate: Plate,
    duration_secs: i64,
}

/// Inputs to a single schedule computation. Everything here is a value or a
/// borrow taken at one instant — the scheduler never reaches back into the
/// store.
pub struct ScheduleInputs<'a> {
    pub queued_jobs: &'a [Job],
    pub plates_by_id: &'a HashMap<String, Plate>,
    pub windows: &'a [UnavailabilityWindow],
    pub now: DateTime<Utc>,
    pub active_job_end: Option<DateTime<Utc>>,
}

/// Compute the projected timeline for `inputs` (§4.1).
pub fn compute_schedule(inputs: &ScheduleInputs<'_>, config: &SchedulerConfig) -> ScheduleResult {
    let now = inputs.now;
    let horizon = now + ChronoDuration::days(config.horizon_days);
    let starting_cursor = match inputs.active_job_end {
        Some(end) if end > now => end,
        _ => now,
    };

    let windows = parse_windows(inputs.windows, now);

    let mut cursor = starting_cursor;
    if let Some(w) = is_during_unavailability(&windows, cursor) {
        cursor = w.end;
    }

    let mut remaining = build_remaining(inputs.queued_jobs, inputs.plates_by_id);
    let mut schedule: Vec<ScheduledJob> = Vec::new();

    while !remaining.is_empty() && cursor < horizon {
        let next_unavail = find_next_unavailability(&windows, cursor);

        if let Some(w) = next_unavail {
            if w.start <= cursor {
                cursor = w.end;
                continue;
            }
        }

        match next_unavail {
            None => {
                for entry in remaining.drain(..) {
                    cursor = place(&mut schedule, entry, cursor, false);
                }
            }
            Some(w) => {
                let available = (w.start - cursor).num_seconds();
                let unavail_duration = (w.end - w.start).num_seconds();

                if unavail_duration >= config.long_unavailability_threshold_secs {
                    if let Some(idx) = first_fitting_index(&remaining, available) {
                        let entry = remaining.remove(idx);
                        cursor = place(&mut schedule, entry, cursor, false);
                    } else if config.allow_spanning_short_windows {
                        if let Some(idx) = first_overflowing_index(&remaining, available) {
                            let entry = remaining.remove(idx);
                            cursor = place(&mut schedule, entry, cursor, true);
                        } else {
                            cursor = w.end;
                        }
                    } else {
                        cursor = w.end;
                    }
                } else if let Some(idx) = largest_fitting_index(&remaining, available) {
                    let entry = remaining.remove(idx);
                    cursor = place(&mut schedule, entry, cursor, false);
                } else {
                    cursor = w.end;
                }
            }
        }
    }

    let next_breakpoint = calculate_breakpoint(schedule.first(), &windows, starting_cursor, now);

    ScheduleResult {
        jobs: schedule,
        computed_at: now,
        cursor_at_computation: starting_cursor,
        next_breakpoint,
    }
}

fn place(
    schedule: &mut Vec<ScheduledJob>,
    entry: Remaining,
    cursor: DateTime<Utc>,
    spans_unavailability: bool,
) -> DateTime<Utc> {
    let end = cursor + ChronoDuration::seconds(entry.duration_secs);
    schedule.push(ScheduledJob {
        job_id: entry.job.id,
        plate_id: entry.plate.id,
        plate_name: entry.plate.name,
        plate_number: entry.plate.plate_number,
        source_filename: entry.plate.source_filename,
        scheduled_start: cursor,
        scheduled_end: end,
        estimated_duration_seconds: entry.duration_secs,
        spans_unavailability,
        thumbnail: entry.plate.thumbnail,
    });
    end
}

fn parse_windows(windows: &[UnavailabilityWindow], now: DateTime<Utc>) -> Vec<Window> {
    let mut parsed: Vec<Window> = windows
        .iter()
        .filter(|w| w.end > now)
        .map(|w| Window {
            start: w.start.max(now),
            end: w.end,
        })
        .collect();
    parsed.sort_by_key(|w| w.start);
    parsed
}

fn is_during_unavailability(windows: &[Window], at: DateTime<Utc>) -> Option<Window> {
    windows
        .iter()
        .find(|w| w.start <= at && at < w.end)
        .copied()
}

fn find_next_unavailability(windows: &[Window], after: DateTime<Utc>) -> Option<Window> {
    for w in windows {
        if w.start > after {
            return Some(*w);
        }
        if w.start <= after && after < w.end {
            return Some(*w);
        }
    }
    None
}

fn build_remaining(jobs: &[Job], plates: &HashMap<String, Plate>) -> Vec<Remaining> {
    let mut remaining: Vec<Remaining> = jobs
        .iter()
        .filter_map(|job| {
            plates.get(&job.plate_id).map(|plate| Remaining {
                job: job.clone(),
                plate: plate.clone(),
                duration_secs: plate.estimated_duration_seconds,
            })
        })
        .collect();
    // Stable sort: higher priority first, longer duration first among ties.
    // Creation-time ordering among exact ties falls out of the stable sort
    // since `jobs` is already given in creation order.
    remaining.sort_by_key(|r| (-r.plate.priority, -r.duration_secs));
    remaining
}

fn first_fitting_index(remaining: &[Remaining], available: i64) -> Option<usize> {
    remaining.iter().position(|r| r.duration_secs <= available)
}

fn first_overflowing_index(remaining: &[Remaining], available: i64) -> Option<usize> {
    remaining.iter().position(|r| r.duration_secs > available)
}

fn largest_fitting_index(remaining: &[Remaining], available: i64) -> Option<usize> {
    // `max_by_key` returns the *last* maximum on ties, which would pick the
    // lower-priority plate when two fitting jobs have equal duration
    // (`remaining` is pre-sorted by `(-priority, -duration)`). Iterate in
    // reverse so ties resolve to the first (highest-priority) candidate,
    // matching the original's `sort(key=lambda x: -x[2])` stable sort.
    remaining
        .iter()
        .enumerate()
        .filter(|(_, r)| r.duration_secs <= available)
        .rev()
        .max_by_key(|(_, r)| r.duration_secs)
        .map(|(idx, _)| idx)
}

fn calculate_breakpoint(
    first_job: Option<&ScheduledJob>,
    windows: &[Window],
    starting_cursor: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let first_job = first_job?;
    let next_unavail = find_next_unavailability(windows, starting_cursor)?;

    if first_job.scheduled_end <= next_unavail.start {
        let candidate =
            next_unavail.start - ChronoDuration::seconds(first_job.estimated_duration_seconds);
        if candidate > now {
            return Some(candidate);
        }
    }

    Some(next_unavail.start)
}

/// Convenience wrapper mirroring the ergonomics of a stateful scheduler
/// object while staying a thin shim over [`compute_schedule`].
pub struct PrintScheduler<'a> {
    inputs: ScheduleInputs<'a>,
    config: SchedulerConfig,
}

impl<'a> PrintScheduler<'a> {
    pub fn new(inputs: ScheduleInputs<'a>, config: SchedulerConfig) -> Self {
        Self { inputs, config }
    }

    pub fn calculate_schedule(&self) -> ScheduleResult {
        compute_schedule(&self.inputs, &self.config)
    }

    pub fn get_next_recommended(&self) -> Option<ScheduledJob> {
        self.calculate_schedule().jobs.into_iter().next()
    }
}
