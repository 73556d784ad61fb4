// Copyright 2023 The Matrix.org Foundation C.I.C.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Bounded, expiring bookkeeping of in-flight requests.

use std::{
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};

use indexmap::IndexMap;

/// How many requests may be in flight at once.
pub const MAX_PENDING: usize = 128;

/// How long a request may stay unanswered.
pub const PENDING_TIMEOUT: Duration = Duration::from_secs(30);

/// Source of the current instant, injectable so tests control expiry.
pub trait TimeSource: fmt::Debug + Send + Sync {
    /// The current instant.
    fn now(&self) -> Instant;
}

/// The wall clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl TimeSource for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Error returned when the registry is full.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TooManyPending;

impl fmt::Display for TooManyPending {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("too many requests in flight")
    }
}

impl std::error::Error for TooManyPending {}

#[derive(Clone, Debug)]
struct Pending<T> {
    payload: T,
    expires_at: Instant,
}

/// Registry of requests awaiting an asynchronous answer.
///
/// Entries keep insertion order; an entry past its expiry is dropped by the
/// next operation that touches the registry and reported once through
/// [`PendingRequests::remove_expired`], which is where timeout errors for
/// the widget come from.
#[derive(Clone, Debug)]
pub struct PendingRequests<T> {
    max_pending: usize,
    timeout: Duration,
    clock: Arc<dyn TimeSource>,
    requests: IndexMap<String, Pending<T>>,
    expired: Vec<(String, T)>,
}

impl<T> PendingRequests<T> {
    /// Creates a registry with the default limits.
    pub fn new(clock: Arc<dyn TimeSource>) -> Self {
        Self::with_limits(MAX_PENDING, PENDING_TIMEOUT, clock)
    }

    /// Creates a registry with the given capacity and per-entry lifetime.
    pub fn with_limits(max_pending: usize, timeout: Duration, clock: Arc<dyn TimeSource>) -> Self {
        Self { max_pending, timeout, clock, requests: IndexMap::new(), expired: Vec::new() }
    }

    /// Number of tracked requests, expired ones included until the next
    /// sweep.
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    /// Whether no request is tracked.
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Records an in-flight request.
    pub fn insert(&mut self, id: impl Into<String>, payload: T) -> Result<(), TooManyPending> {
        self.sweep();
        if self.requests.len() >= self.max_pending {
            return Err(TooManyPending);
        }
        let expires_at = self.clock.now() + self.timeout;
        self.requests.insert(id.into(), Pending { payload, expires_at });
        Ok(())
    }

    /// Removes and returns the payload of a live entry.
    pub fn extract(&mut self, id: &str) -> Option<T> {
        self.sweep();
        self.requests.shift_remove(id).map(|pending| pending.payload)
    }

    /// Removes and returns the earliest live entry whose id satisfies the
    /// predicate.
    pub fn extract_first(&mut self, mut predicate: impl FnMut(&str) -> bool) -> Option<(String, T)> {
        self.sweep();
        let id = self.requests.keys().find(|id| predicate(id))?.clone();
        let pending = self.requests.shift_remove(&id)?;
        Some((id, pending.payload))
    }

    /// Whether a live entry with the given id exists.
    pub fn contains(&mut self, id: &str) -> bool {
        self.sweep();
        self.requests.contains_key(id)
    }

    /// Sweeps and returns every entry that expired since the last call.
    pub fn remove_expired(&mut self) -> Vec<(String, T)> {
        self.sweep();
        std::mem::take(&mut self.expired)
    }

    /// Drops every entry, reporting none of them as expired.
    pub fn clear(&mut self) {
        self.requests.clear();
        self.expired.clear();
    }

    fn sweep(&mut self) {
        let now = self.clock.now();
        let expired_ids: Vec<String> = self
            .requests
            .iter()
            .filter(|(_, pending)| pending.expires_at <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired_ids {
            if let Some(pending) = self.requests.shift_remove(&id) {
                self.expired.push((id, pending.payload));
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use super::{testing::FakeClock, PendingRequests, TooManyPending, MAX_PENDING};

    fn registry() -> (PendingRequests<String>, Arc<FakeClock>) {
        let clock = Arc::new(FakeClock::start());
        (PendingRequests::new(clock.clone()), clock)
    }

    #[test]
    fn insert_beyond_capacity_fails() {
        let (mut pending, _clock) = registry();
        for i in 0..MAX_PENDING {
            pending.insert(format!("r{i}"), format!("r{i}")).unwrap();
        }
        assert_eq!(pending.insert("overflow", "overflow".to_owned()), Err(TooManyPending));
        assert_eq!(pending.len(), MAX_PENDING);
    }

    #[test]
    fn extract_returns_live_entries_once() {
        let (mut pending, _clock) = registry();
        pending.insert("r1", "payload".to_owned()).unwrap();

        assert!(pending.contains("r1"));
        assert_eq!(pending.extract("r1").as_deref(), Some("payload"));
        assert_eq!(pending.extract("r1"), None);
    }

    #[test]
    fn expired_entries_are_absent_and_reported() {
        let (mut pending, clock) = registry();
        pending.insert("r1", "payload".to_owned()).unwrap();

        clock.advance(Duration::from_secs(31));
        assert_eq!(pending.extract("r1"), None);
        assert_eq!(pending.remove_expired(), vec![("r1".to_owned(), "payload".to_owned())]);
        // Reported only once.
        assert_eq!(pending.remove_expired(), vec![]);
    }

    #[test]
    fn contains_evicts_on_expiry() {
        let (mut pending, clock) = registry();
        pending.insert("r1", "payload".to_owned()).unwrap();

        clock.advance(Duration::from_secs(31));
        assert!(!pending.contains("r1"));
        assert!(pending.is_empty());
    }

    #[test]
    fn expiry_frees_capacity() {
        let clock = Arc::new(FakeClock::start());
        let mut pending =
            PendingRequests::with_limits(1, Duration::from_secs(30), clock.clone());
        pending.insert("r1", "a".to_owned()).unwrap();
        assert_eq!(pending.insert("r2", "b".to_owned()), Err(TooManyPending));

        clock.advance(Duration::from_secs(31));
        pending.insert("r2", "b".to_owned()).unwrap();
    }

    #[test]
    fn extract_first_respects_insertion_order() {
        let (mut pending, _clock) = registry();
        pending.insert("openid:r1", "r1".to_owned()).unwrap();
        pending.insert("r2", "r2".to_owned()).unwrap();
        pending.insert("r3", "r3".to_owned()).unwrap();

        let (id, payload) = pending.extract_first(|id| !id.starts_with("openid:")).unwrap();
        assert_eq!(id, "r2");
        assert_eq!(payload, "r2");
        assert!(pending.contains("openid:r1"));
        assert!(pending.contains("r3"));
    }

    #[test]
    fn clear_reports_nothing() {
        let (mut pending, clock) = registry();
        pending.insert("r1", "a".to_owned()).unwrap();
        clock.advance(Duration::from_secs(31));
        pending.clear();
        assert_eq!(pending.remove_expired(), vec![]);
        assert!(pending.is_empty());
    }
}
