use crate::internal::attrs::{AttrRecord, names};
use crate::internal::messages::{DrainCompletion, DrainSpeed};
use std::time::Instant;

/// One machine-wide draining epoch. Owned by the manager and passed
/// explicitly to every slot that needs it; there is no global drain
/// state.
#[derive(Debug)]
pub struct DrainEpoch {
    pub id: u32,
    pub speed: DrainSpeed,
    pub reason: String,
    pub on_completion: DrainCompletion,
    pub start_expr: Option<String>,
    pub started: Instant,
    /// Set once every pre-drain claim has ended: claim ids are
    /// invalidated and retirement budgets forced to zero.
    pub final_phase: bool,
}

impl DrainEpoch {
    pub fn request_id(&self) -> String {
        self.id.to_string()
    }

    pub fn is_graceful(&self) -> bool {
        self.speed == DrainSpeed::Graceful
    }

    #[cfg(test)]
    pub fn for_tests(start_expr: Option<String>) -> DrainEpoch {
        DrainEpoch {
            id: 1,
            speed: DrainSpeed::Graceful,
            reason: String::new(),
            on_completion: DrainCompletion::Nothing,
            start_expr,
            started: Instant::now(),
            final_phase: false,
        }
    }
}

/// Drain bookkeeping that outlives individual epochs: the epoch counter
/// (stringified as the request id) and the last start/stop times.
#[derive(Debug, Default)]
pub struct DrainBook {
    epoch: Option<DrainEpoch>,
    counter: u32,
    pub last_start: Option<Instant>,
    pub last_stop: Option<Instant>,
}

impl DrainBook {
    pub fn active(&self) -> Option<&DrainEpoch> {
        self.epoch.as_ref()
    }

    pub fn active_mut(&mut self) -> Option<&mut DrainEpoch> {
        self.epoch.as_mut()
    }

    pub fn begin(
        &mut self,
        speed: DrainSpeed,
        reason: String,
        on_completion: DrainCompletion,
        start_expr: Option<String>,
        now: Instant,
    ) -> &DrainEpoch {
        self.counter += 1;
        self.last_start = Some(now);
        self.epoch = Some(DrainEpoch {
            id: self.counter,
            speed,
            reason,
            on_completion,
            start_expr,
            started: now,
            final_phase: false,
        });
        self.epoch.as_ref().unwrap()
    }

    /// Matches a cancellation request against the active epoch; an empty
    /// id always matches.
    pub fn matches(&self, request_id: &str) -> bool {
        match (&self.epoch, request_id.is_empty()) {
            (_, true) => true,
            (Some(epoch), false) => epoch.request_id() == request_id,
            (None, false) => false,
        }
    }

    pub fn end(&mut self, now: Instant) -> Option<DrainEpoch> {
        if self.epoch.is_some() {
            self.last_stop = Some(now);
        }
        self.epoch.take()
    }

    /// Adds the drain attributes to an advertised slot record. Start and
    /// stop times publish as ages in seconds; wall-clock mapping belongs
    /// to the transport layer.
    pub fn publish(&self, record: &mut AttrRecord, now: Instant) {
        if let Some(epoch) = &self.epoch {
            record.set(names::DRAINING, true);
            record.set(names::DRAIN_REASON, epoch.reason.as_str());
            record.set(names::DRAINING_REQUEST_ID, epoch.request_id());
        }
        if let Some(start) = self.last_start {
            record.set(
                names::LAST_DRAIN_START,
                now.saturating_duration_since(start).as_secs() as i64,
            );
        }
        if let Some(stop) = self.last_stop {
            record.set(
                names::LAST_DRAIN_STOP,
                now.saturating_duration_since(stop).as_secs() as i64,
            );
        }
    }
}
