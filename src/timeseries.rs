//! The time-series store (C3): current day, bounded in-memory history, and
//! the disk-backed tier beyond it, plus the blocking condition waiters.
//!
//! Concurrency: per the design notes, a single lock guards the whole
//! mutable structure and the waiter condition is bound to it. std's
//! `Condvar` only pairs with `Mutex`, so reads take the same lock as
//! writes rather than a separate read side. Reads are cheap clones of a
//! day's event vector, so the extra serialization is not a bottleneck;
//! see DESIGN.md for the fuller rationale.
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{info, warn};

use crate::cache::AggregationCache;
use crate::error::TimeSeriesError;
use crate::persistence::PersistenceStore;

#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub product: String,
    pub quantity: i32,
    pub price: f64,
    pub timestamp: i64,
}

impl Event {
    pub fn total_value(&self) -> f64 {
        self.quantity as f64 * self.price
    }
}

#[derive(Debug, Clone)]
pub struct Day {
    pub day_id: i32,
    pub events: Vec<Event>,
    pub start_time: i64,
    pub completed: bool,
}

impl Day {
    pub fn new(day_id: i32, start_time: i64) -> Self {
        Day { day_id, events: Vec::new(), start_time, completed: false }
    }
}

pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

struct Inner {
    current_day: Day,
    /// Most-recently-completed day at the front.
    history: VecDeque<Day>,
}

pub struct TimeSeriesStore {
    inner: Mutex<Inner>,
    cvar: Condvar,
    persistence: Arc<PersistenceStore>,
    cache: Arc<AggregationCache>,
    /// S: max historical days retained in memory.
    memory_days: usize,
    /// D: max historical days retained on disk.
    disk_days: usize,
}

impl TimeSeriesStore {
    /// Builds a store from recovered state: `current_day_id` and the
    /// `history` already loaded from the last `S` day files (most-recent
    /// first), per the persistence load-on-start protocol (C5).
    pub fn new(
        memory_days: usize,
        disk_days: usize,
        persistence: Arc<PersistenceStore>,
        cache: Arc<AggregationCache>,
        current_day_id: i32,
        history: VecDeque<Day>,
    ) -> Self {
        TimeSeriesStore {
            inner: Mutex::new(Inner {
                current_day: Day::new(current_day_id, now_ms()),
                history,
            }),
            cvar: Condvar::new(),
            persistence,
            cache,
            memory_days,
            disk_days,
        }
    }

    pub fn current_day_id(&self) -> i32 {
        self.inner.lock().unwrap().current_day.day_id
    }

    pub fn historical_day_count(&self) -> usize {
        self.inner.lock().unwrap().history.len()
    }

    pub fn max_days(&self) -> usize {
        self.memory_days
    }

    /// Appends a new event to the current day, timestamped `now()`.
    pub fn add_event(&self, product: &str, quantity: i32, price: f64) -> Result<(), TimeSeriesError> {
        self.append_event(product, quantity, price, now_ms())
    }

    /// Appends an event with an explicit timestamp, bypassing `now()`.
    /// Used only during startup recovery to replay events whose original
    /// timestamp must be preserved (mirrors [`crate::auth::AuthStore::register_prehashed`]'s
    /// role for the auth store).
    pub fn add_event_replay(&self, product: &str, quantity: i32, price: f64, timestamp: i64) -> Result<(), TimeSeriesError> {
        self.append_event(product, quantity, price, timestamp)
    }

    fn append_event(&self, product: &str, quantity: i32, price: f64, timestamp: i64) -> Result<(), TimeSeriesError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.current_day.completed {
            return Err(TimeSeriesError::DayAlreadyCompleted);
        }
        inner.current_day.events.push(Event {
            product: product.to_string(),
            quantity,
            price,
            timestamp,
        });
        self.cache.invalidate_on_new_event(product);
        self.cvar.notify_all();
        Ok(())
    }

    /// Rotation protocol: completes the current day, persists it, promotes
    /// it into memory history (evicting past `S`), expires the disk file
    /// beyond `D`, invalidates the aggregation cache, and installs a fresh
    /// empty current day.
    pub fn new_day(&self) -> Result<(), TimeSeriesError> {
        let mut inner = self.inner.lock().unwrap();

        inner.current_day.completed = true;
        self.cvar.notify_all();

        let completed_day = inner.current_day.clone();
        if let Err(e) = self.persistence.save_day(&completed_day) {
            warn!(day_id = completed_day.day_id, error = %e, "failed to persist completed day; rotating in memory anyway");
        }

        let next_day_id = completed_day.day_id + 1;
        if let Err(e) = self.persistence.update_state(next_day_id) {
            warn!(error = %e, "failed to persist state header");
        }

        inner.history.push_front(completed_day);
        while inner.history.len() > self.memory_days {
            inner.history.pop_back();
        }

        let expire_id = next_day_id - self.disk_days as i32;
        if expire_id >= 0 {
            if let Err(e) = self.persistence.delete_day(expire_id) {
                warn!(day_id = expire_id, error = %e, "failed to delete expired day file");
            }
        }

        self.cache.invalidate_on_new_day();

        inner.current_day = Day::new(next_day_id, now_ms());
        info!(day_id = next_day_id, "rotated to new day");
        Ok(())
    }

    pub fn get_current_day_events(&self) -> Vec<Event> {
        self.inner.lock().unwrap().current_day.events.clone()
    }

    /// `k = 0` is the most recently completed day, `k = 1` the one before
    /// that, and so on. Out-of-range or missing data returns an empty
    /// list rather than an error.
    pub fn get_historical_day_events(&self, k: i32) -> Vec<Event> {
        if k < 0 {
            return Vec::new();
        }
        let current_day_id = {
            let inner = self.inner.lock().unwrap();
            if (k as usize) < inner.history.len() {
                return inner.history[k as usize].events.clone();
            }
            inner.current_day.day_id
        };
        let target_id = current_day_id - 1 - k;
        if target_id < 0 {
            return Vec::new();
        }
        self.persistence.load_day(target_id).unwrap_or_default()
    }

    /// `day_offset`: 0 (or equivalently omitted) is the current day, `k`
    /// is the k-th most recently completed day.
    pub fn get_filtered_events(&self, products: Option<&[String]>, day_offset: i32) -> Vec<Event> {
        let events = if day_offset == 0 {
            self.get_current_day_events()
        } else {
            self.get_historical_day_events(day_offset - 1)
        };
        match products {
            Some(p) if !p.is_empty() => events.into_iter().filter(|e| p.iter().any(|wanted| wanted == &e.product)).collect(),
            _ => events,
        }
    }

    /// Blocks until the current day's events contain both `p1` and `p2`,
    /// or the day completes first (`false`). Re-checks on every wakeup,
    /// the standard "take lock, test predicate, wait, retest" loop.
    pub fn wait_for_simultaneous_sales(&self, p1: &str, p2: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        loop {
            let has1 = inner.current_day.events.iter().any(|e| e.product == p1);
            let has2 = inner.current_day.events.iter().any(|e| e.product == p2);
            if has1 && has2 {
                return true;
            }
            if inner.current_day.completed {
                return false;
            }
            inner = self.cvar.wait(inner).unwrap();
        }
    }

    /// Blocks until the tail-most `n` events of the current day all share
    /// a product (returning it), or the day completes first (`None`).
    pub fn wait_for_consecutive_sales(&self, n: i32) -> Option<String> {
        if n < 1 {
            return None;
        }
        let n = n as usize;
        let mut inner = self.inner.lock().unwrap();
        loop {
            let events = &inner.current_day.events;
            if events.len() >= n {
                let tail = &events[events.len() - n..];
                let first = &tail[0].product;
                if tail.iter().all(|e| &e.product == first) {
                    return Some(first.clone());
                }
            }
            if inner.current_day.completed {
                return None;
            }
            inner = self.cvar.wait(inner).unwrap();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::PersistenceStore;
    use std::collections::VecDeque;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn store(dir: &std::path::Path, s: usize, d: usize) -> Arc<TimeSeriesStore> {
        let persistence = Arc::new(PersistenceStore::new(dir.to_path_buf()));
        let cache = Arc::new(AggregationCache::new(s.max(1)));
        Arc::new(TimeSeriesStore::new(s, d, persistence, cache, 0, VecDeque::new()))
    }

    #[test]
    fn insertion_order_preserved() {
        let dir = tempfile::tempdir().unwrap();
        let ts = store(dir.path(), 3, 3);
        ts.add_event("apple", 1, 1.0).unwrap();
        ts.add_event("banana", 2, 2.0).unwrap();
        ts.add_event("apple", 3, 3.0).unwrap();
        let events = ts.get_current_day_events();
        let products: Vec<_> = events.iter().map(|e| e.product.as_str()).collect();
        assert_eq!(products, vec!["apple", "banana", "apple"]);
    }

    #[test]
    fn rotation_advances_day_id_and_resets_events() {
        let dir = tempfile::tempdir().unwrap();
        let ts = store(dir.path(), 3, 3);
        ts.add_event("apple", 1, 1.0).unwrap();
        assert_eq!(ts.current_day_id(), 0);
        ts.new_day().unwrap();
        assert_eq!(ts.current_day_id(), 1);
        assert!(ts.get_current_day_events().is_empty());
        assert_eq!(ts.historical_day_count(), 1);
    }

    #[test]
    fn memory_history_bounded_by_s() {
        let dir = tempfile::tempdir().unwrap();
        let ts = store(dir.path(), 2, 5);
        for _ in 0..4 {
            ts.add_event("apple", 1, 1.0).unwrap();
            ts.new_day().unwrap();
        }
        assert!(ts.historical_day_count() <= 2);
    }

    #[test]
    fn historical_day_out_of_range_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let ts = store(dir.path(), 2, 5);
        assert!(ts.get_historical_day_events(9).is_empty());
    }

    #[test]
    fn simultaneous_sales_unblocks_on_second_product() {
        let dir = tempfile::tempdir().unwrap();
        let ts = store(dir.path(), 3, 3);
        let ts2 = Arc::clone(&ts);
        let handle = thread::spawn(move || ts2.wait_for_simultaneous_sales("a", "b"));
        thread::sleep(Duration::from_millis(50));
        ts.add_event("a", 1, 1.0).unwrap();
        thread::sleep(Duration::from_millis(50));
        ts.add_event("b", 1, 1.0).unwrap();
        assert!(handle.join().unwrap());
    }

    #[test]
    fn simultaneous_sales_false_on_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let ts = store(dir.path(), 3, 3);
        let ts2 = Arc::clone(&ts);
        let handle = thread::spawn(move || ts2.wait_for_simultaneous_sales("a", "b"));
        thread::sleep(Duration::from_millis(50));
        ts.add_event("a", 1, 1.0).unwrap();
        thread::sleep(Duration::from_millis(50));
        ts.new_day().unwrap();
        assert!(!handle.join().unwrap());
    }

    #[test]
    fn consecutive_sales_returns_product_after_n_in_a_row() {
        let dir = tempfile::tempdir().unwrap();
        let ts = store(dir.path(), 3, 3);
        let ts2 = Arc::clone(&ts);
        let handle = thread::spawn(move || ts2.wait_for_consecutive_sales(3));
        for p in ["a", "a", "b", "a", "a", "a"] {
            thread::sleep(Duration::from_millis(20));
            ts.add_event(p, 1, 1.0).unwrap();
        }
        assert_eq!(handle.join().unwrap().as_deref(), Some("a"));
    }

    #[test]
    fn consecutive_sales_none_on_rotation_before_n() {
        let dir = tempfile::tempdir().unwrap();
        let ts = store(dir.path(), 3, 3);
        let ts2 = Arc::clone(&ts);
        let handle = thread::spawn(move || ts2.wait_for_consecutive_sales(3));
        ts.add_event("a", 1, 1.0).unwrap();
        thread::sleep(Duration::from_millis(30));
        ts.new_day().unwrap();
        assert_eq!(handle.join().unwrap(), None);
    }

    #[test]
    fn add_event_fails_on_completed_day() {
        // Exercises the defensive `DayAlreadyCompleted` branch; under the
        // rotation protocol a completed day is replaced atomically so this
        // should not occur in practice, but the guard must hold if it did.
        let dir = tempfile::tempdir().unwrap();
        let ts = store(dir.path(), 3, 3);
        {
            let mut inner = ts.inner.lock().unwrap();
            inner.current_day.completed = true;
        }
        assert!(matches!(ts.add_event("a", 1, 1.0), Err(TimeSeriesError::DayAlreadyCompleted)));
    }
}
