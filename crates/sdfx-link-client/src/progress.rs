//! Step-rate and ETA estimation from `progress` events.

use std::time::{Duration, Instant};

use sdfx_link_core::events::{Event, EventKind};
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    pub current_step: u64,
    pub total_steps: u64,
    pub percent: f64,
    pub remaining_steps: u64,
    /// Running average of the time between two progress events.
    pub average_step: Duration,
    pub eta: Duration,
    /// Rate implied by the most recent step, 0 for the first one.
    pub steps_per_second: f64,
}

/// Tracks step timing across the progress events of one execution.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    last_update: Option<Instant>,
    average_step: Duration,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a `{value, max}` update observed at `now`.
    pub fn update(&mut self, value: u64, max: u64, now: Instant) -> ProgressSnapshot {
        let mut elapsed = Duration::ZERO;
        if let Some(last) = self.last_update {
            elapsed = now.saturating_duration_since(last);
            self.average_step = (self.average_step + elapsed) / 2;
        }
        self.last_update = Some(now);

        let remaining_steps = max.saturating_sub(value);
        let percent = if max == 0 {
            0.0
        } else {
            100.0 * value as f64 / max as f64
        };
        let steps_per_second = if elapsed.is_zero() {
            0.0
        } else {
            1.0 / elapsed.as_secs_f64()
        };

        ProgressSnapshot {
            current_step: value,
            total_steps: max,
            percent,
            remaining_steps,
            average_step: self.average_step,
            eta: self
                .average_step
                .saturating_mul(u32::try_from(remaining_steps).unwrap_or(u32::MAX)),
            steps_per_second,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Feed any event. Returns a snapshot for `progress` events and resets on
    /// execution boundaries (`execution_start`, `execution_interrupted`, idle `executing`).
    pub fn observe(&mut self, event: &Event, now: Instant) -> Option<ProgressSnapshot> {
        match event.kind {
            EventKind::Progress => {
                let data = event.data.as_json()?;
                let value = data.get("value").and_then(Value::as_u64)?;
                let max = data.get("max").and_then(Value::as_u64)?;
                Some(self.update(value, max, now))
            }
            EventKind::ExecutionStart | EventKind::ExecutionInterrupted => {
                self.reset();
                None
            }
            EventKind::Executing => {
                if event.data.as_json().is_none_or(Value::is_null) {
                    self.reset();
                }
                None
            }
            _ => None,
        }
    }
}
