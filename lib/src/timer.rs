//! Idle timeout bookkeeping for sessions
//!
//! Slots are appended in touch order, so the sequence is sorted by last
//! activity once the stale slots are ignored. Touching a session again nulls
//! its previous slot and appends a new one, and the sweep walks forward from
//! a persistent cursor until it meets a session that is still fresh. The
//! processed prefix is dropped once it gets large enough.
use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use crate::SessionId;

/// a session touched again within this window keeps its slot
pub const TIMEOUT_PRECISION: Duration = Duration::from_secs(4);
/// the processed prefix is dropped once the cursor went past this many slots
pub const TIMEOUTS_CLEAN_SIZE: usize = 512;

#[derive(Debug, Clone, Copy)]
struct Slot {
    session: SessionId,
    last_activity: Instant,
}

#[derive(Debug)]
pub struct TimeoutSlots {
    timeout: Duration,
    precision: Duration,
    slots: Vec<Option<Slot>>,
    index: HashMap<SessionId, usize>,
    cursor: usize,
}

impl TimeoutSlots {
    /// a zero timeout disables the tracking entirely
    pub fn new(timeout: Duration) -> TimeoutSlots {
        TimeoutSlots::with_precision(timeout, TIMEOUT_PRECISION.min(timeout))
    }

    pub fn with_precision(timeout: Duration, precision: Duration) -> TimeoutSlots {
        TimeoutSlots {
            timeout,
            precision,
            slots: Vec::new(),
            index: HashMap::new(),
            cursor: 0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.timeout.is_zero()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn precision(&self) -> Duration {
        self.precision
    }

    /// Record activity on `session`. Returns true if the session got a new
    /// slot, false if the touch was absorbed by the precision window
    pub fn touch(&mut self, session: SessionId, now: Instant) -> bool {
        if !self.is_enabled() {
            return false;
        }

        if let Some(&position) = self.index.get(&session) {
            if let Some(slot) = self.slots.get_mut(position) {
                if let Some(current) = slot {
                    if now.saturating_duration_since(current.last_activity) < self.precision {
                        return false;
                    }
                }
                *slot = None;
            }
        }

        self.index.insert(session, self.slots.len());
        self.slots.push(Some(Slot {
            session,
            last_activity: now,
        }));
        true
    }

    pub fn remove(&mut self, session: SessionId) {
        if let Some(position) = self.index.remove(&session) {
            if let Some(slot) = self.slots.get_mut(position) {
                *slot = None;
            }
        }
    }

    pub fn last_activity(&self, session: SessionId) -> Option<Instant> {
        let position = self.index.get(&session)?;
        self.slots
            .get(*position)
            .and_then(|slot| slot.as_ref())
            .map(|slot| slot.last_activity)
    }

    /// Collect the sessions idle for at least the timeout. Their slots are
    /// released, the caller is expected to tear them down
    pub fn sweep_expired(&mut self, now: Instant) -> Vec<SessionId> {
        let mut expired = Vec::new();
        if !self.is_enabled() {
            return expired;
        }

        while let Some(slot) = self.slots.get_mut(self.cursor) {
            if let Some(current) = slot {
                if now.saturating_duration_since(current.last_activity) < self.timeout {
                    break;
                }

                expired.push(current.session);
                self.index.remove(&current.session);
                *slot = None;
            }
            self.cursor += 1;
        }

        self.compact();
        expired
    }

    fn compact(&mut self) {
        if self.cursor <= TIMEOUTS_CLEAN_SIZE || self.cursor <= self.slots.len() / 2 {
            return;
        }

        let processed = self.cursor;
        self.slots.drain(..processed);
        // live slots always sit at or after the cursor
        for position in self.index.values_mut() {
            *position -= processed;
        }
        self.cursor = 0;
        trace!(
            "timeout slots compacted, {} processed slots dropped, {} left",
            processed,
            self.slots.len()
        );
    }

    /// number of tracked sessions
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// number of slots, stale ones included
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }
}
