//! Session-scoped snapshot of the device registry.
//!
//! When enabled, the first request of a session captures the device's
//! persistent registry, and [`DeviceClient::shutdown`](crate::client::DeviceClient::shutdown)
//! writes it back so one test run cannot leak registry state into the next.
//!
//! ```text
//! NotCaptured --first request--> Capturing --read ok--> Captured --shutdown--> Restored
//!      ^                             |
//!      +---------read failed---------+
//! ```

use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::request::RegistryValues;

#[derive(Debug, Clone, PartialEq)]
pub enum SnapshotState {
    NotCaptured,
    /// A capture is running; requests issued meanwhile (including the capture's
    /// own `readRegistry`) must not start another.
    Capturing,
    Captured(RegistryValues),
    Restored,
}

#[derive(Debug)]
pub struct RegistrySnapshot {
    enabled: bool,
    state: Mutex<SnapshotState>,
}

impl RegistrySnapshot {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            state: Mutex::new(SnapshotState::NotCaptured),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SnapshotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn state(&self) -> SnapshotState {
        self.lock().clone()
    }

    /// Claim the capture. Returns `true` exactly once per session (or again
    /// after a failed capture).
    pub(crate) fn begin_capture(&self) -> bool {
        if !self.enabled {
            return false;
        }
        let mut state = self.lock();
        if *state == SnapshotState::NotCaptured {
            *state = SnapshotState::Capturing;
            true
        } else {
            false
        }
    }

    pub(crate) fn finish_capture(&self, values: RegistryValues) {
        *self.lock() = SnapshotState::Captured(values);
    }

    /// Return to `NotCaptured` so the next request tries again.
    pub(crate) fn abort_capture(&self) {
        let mut state = self.lock();
        if *state == SnapshotState::Capturing {
            *state = SnapshotState::NotCaptured;
        }
    }

    /// Guard that calls [`abort_capture`](Self::abort_capture) on drop.
    pub(crate) fn capture_guard(&self) -> CaptureGuard<'_> {
        CaptureGuard { snapshot: self }
    }

    /// Hand out the captured values for restoring, at most once.
    pub(crate) fn take_for_restore(&self) -> Option<RegistryValues> {
        let mut state = self.lock();
        match std::mem::replace(&mut *state, SnapshotState::Restored) {
            SnapshotState::Captured(values) => Some(values),
            previous => {
                *state = previous;
                None
            }
        }
    }
}

pub(crate) struct CaptureGuard<'a> {
    snapshot: &'a RegistrySnapshot,
}

impl Drop for CaptureGuard<'_> {
    fn drop(&mut self) {
        self.snapshot.abort_capture();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn sample() -> RegistryValues {
        let mut section = BTreeMap::new();
        section.insert("token".to_string(), json!("abc"));
        let mut values = BTreeMap::new();
        values.insert("auth".to_string(), section);
        values
    }

    #[test]
    fn disabled_never_captures() {
        let snapshot = RegistrySnapshot::new(false);
        assert!(!snapshot.begin_capture());
        assert_eq!(snapshot.state(), SnapshotState::NotCaptured);
        assert_eq!(snapshot.take_for_restore(), None);
    }

    #[test]
    fn capture_claimed_once() {
        let snapshot = RegistrySnapshot::new(true);
        assert!(snapshot.begin_capture());
        assert!(!snapshot.begin_capture());
        snapshot.finish_capture(sample());
        assert!(!snapshot.begin_capture());
        assert_eq!(snapshot.state(), SnapshotState::Captured(sample()));
    }

    #[test]
    fn failed_capture_can_retry() {
        let snapshot = RegistrySnapshot::new(true);
        assert!(snapshot.begin_capture());
        snapshot.abort_capture();
        assert_eq!(snapshot.state(), SnapshotState::NotCaptured);
        assert!(snapshot.begin_capture());
    }

    #[test]
    fn dropped_guard_releases_unfinished_capture() {
        let snapshot = RegistrySnapshot::new(true);
        assert!(snapshot.begin_capture());
        drop(snapshot.capture_guard());
        assert_eq!(snapshot.state(), SnapshotState::NotCaptured);

        assert!(snapshot.begin_capture());
        let guard = snapshot.capture_guard();
        snapshot.finish_capture(sample());
        drop(guard);
        assert_eq!(snapshot.state(), SnapshotState::Captured(sample()));
    }

    #[test]
    fn restore_hands_out_values_once() {
        let snapshot = RegistrySnapshot::new(true);
        snapshot.begin_capture();
        snapshot.finish_capture(sample());

        assert_eq!(snapshot.take_for_restore(), Some(sample()));
        assert_eq!(snapshot.state(), SnapshotState::Restored);
        assert_eq!(snapshot.take_for_restore(), None);
        assert!(!snapshot.begin_capture());
    }

    #[test]
    fn restore_before_capture_is_a_no_op() {
        let snapshot = RegistrySnapshot::new(true);
        snapshot.begin_capture();
        assert_eq!(snapshot.take_for_restore(), None);
        assert_eq!(snapshot.state(), SnapshotState::Capturing);
    }
}
