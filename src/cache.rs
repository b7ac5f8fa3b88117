//! Lazy aggregation cache (C4).
//!
//! Caches the result of a window aggregation keyed by `"<kind>:<args...>"`,
//! valid only for the day it was computed on. Two invalidation hooks:
//! event-driven (a product segment drops out of every key that mentions
//! it) and day-driven (the whole cache is cleared on rotation, since every
//! windowed aggregation can shift).
//!
//! The cache does not hold a reference to the time-series store. It is
//! handed one at each aggregation call instead, so the two components
//! never form a reference cycle (the store does hold an `Arc` to this
//! cache, to call the invalidation hooks from `add_event`/`new_day`).
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use crate::error::TimeSeriesError;
use crate::timeseries::TimeSeriesStore;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CachedValue {
    Int(i64),
    Float(f64),
}

#[derive(Debug, Clone, Copy)]
struct CachedAggregation {
    value: CachedValue,
    computed_at_day_id: i32,
}

struct Lru {
    entries: HashMap<String, CachedAggregation>,
    /// Recency order, least-recently-used at the front.
    order: VecDeque<String>,
    capacity: usize,
}

impl Lru {
    fn new(capacity: usize) -> Self {
        Lru { entries: HashMap::new(), order: VecDeque::new(), capacity: capacity.max(1) }
    }

    fn touch(&mut self, key: &str) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            self.order.remove(pos);
        }
        self.order.push_back(key.to_string());
    }

    fn get(&mut self, key: &str, current_day_id: i32) -> Option<CachedValue> {
        let hit = self.entries.get(key).copied();
        match hit {
            Some(entry) if entry.computed_at_day_id == current_day_id => {
                self.touch(key);
                Some(entry.value)
            }
            _ => None,
        }
    }

    fn put(&mut self, key: String, value: CachedValue, current_day_id: i32) {
        if !self.entries.contains_key(&key) && self.entries.len() >= self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.entries.remove(&evicted);
            }
        }
        self.entries.insert(key.clone(), CachedAggregation { value, computed_at_day_id: current_day_id });
        self.touch(&key);
    }

    fn invalidate_on_new_event(&mut self, product: &str) {
        let stale: Vec<String> = self
            .entries
            .keys()
            .filter(|key| key_mentions_product(key, product))
            .cloned()
            .collect();
        for key in stale {
            self.entries.remove(&key);
            if let Some(pos) = self.order.iter().position(|k| k == &key) {
                self.order.remove(pos);
            }
        }
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }
}

/// `"<kind>:<product-or-products>:<days>"`: every segment but the first
/// (kind) and the last (days, numeric) names a product.
fn key_mentions_product(key: &str, product: &str) -> bool {
    let mut parts = key.split(':');
    let _kind = parts.next();
    let parts: Vec<&str> = parts.collect();
    if parts.is_empty() {
        return false;
    }
    parts[..parts.len() - 1].iter().any(|seg| *seg == product)
}

pub struct AggregationCache {
    lru: Mutex<Lru>,
}

impl AggregationCache {
    pub fn new(capacity: usize) -> Self {
        AggregationCache { lru: Mutex::new(Lru::new(capacity)) }
    }

    pub fn invalidate_on_new_event(&self, product: &str) {
        self.lru.lock().unwrap().invalidate_on_new_event(product);
    }

    pub fn invalidate_on_new_day(&self) {
        self.lru.lock().unwrap().clear();
    }

    fn window_days(ts: &TimeSeriesStore, days: i32) -> Result<Vec<Vec<crate::timeseries::Event>>, TimeSeriesError> {
        if days < 0 || days > ts.current_day_id() {
            return Err(TimeSeriesError::InsufficientData);
        }
        Ok((0..days).map(|k| ts.get_historical_day_events(k)).collect())
    }

    pub fn aggregate_quantity(&self, ts: &TimeSeriesStore, product: &str, days: i32) -> Result<i32, TimeSeriesError> {
        let key = format!("qty:{product}:{days}");
        let current = ts.current_day_id();
        if let Some(CachedValue::Int(v)) = self.lru.lock().unwrap().get(&key, current) {
            return Ok(v as i32);
        }
        let window = Self::window_days(ts, days)?;
        let sum: i64 = window
            .iter()
            .flatten()
            .filter(|e| e.product == product)
            .map(|e| e.quantity as i64)
            .sum();
        self.lru.lock().unwrap().put(key, CachedValue::Int(sum), current);
        Ok(sum as i32)
    }

    pub fn aggregate_revenue(&self, ts: &TimeSeriesStore, product: &str, days: i32) -> Result<f64, TimeSeriesError> {
        let key = format!("rev:{product}:{days}");
        let current = ts.current_day_id();
        if let Some(CachedValue::Float(v)) = self.lru.lock().unwrap().get(&key, current) {
            return Ok(v);
        }
        let window = Self::window_days(ts, days)?;
        let revenue: f64 = window.iter().flatten().filter(|e| e.product == product).map(|e| e.total_value()).sum();
        self.lru.lock().unwrap().put(key, CachedValue::Float(revenue), current);
        Ok(revenue)
    }

    pub fn aggregate_average_price(&self, ts: &TimeSeriesStore, product: &str, days: i32) -> Result<f64, TimeSeriesError> {
        let key = format!("avg:{product}:{days}");
        let current = ts.current_day_id();
        if let Some(CachedValue::Float(v)) = self.lru.lock().unwrap().get(&key, current) {
            return Ok(v);
        }
        let window = Self::window_days(ts, days)?;
        let (qty_sum, value_sum) = window.iter().flatten().filter(|e| e.product == product).fold((0i64, 0.0f64), |(q, v), e| {
            (q + e.quantity as i64, v + e.total_value())
        });
        let avg = if qty_sum == 0 { 0.0 } else { value_sum / qty_sum as f64 };
        self.lru.lock().unwrap().put(key, CachedValue::Float(avg), current);
        Ok(avg)
    }

    pub fn aggregate_max_price(&self, ts: &TimeSeriesStore, product: &str, days: i32) -> Result<f64, TimeSeriesError> {
        let key = format!("max:{product}:{days}");
        let current = ts.current_day_id();
        if let Some(CachedValue::Float(v)) = self.lru.lock().unwrap().get(&key, current) {
            return Ok(v);
        }
        let window = Self::window_days(ts, days)?;
        let max = window
            .iter()
            .flatten()
            .filter(|e| e.product == product)
            .map(|e| e.price)
            .fold(0.0f64, f64::max);
        self.lru.lock().unwrap().put(key, CachedValue::Float(max), current);
        Ok(max)
    }

    /// Days in the window containing at least one event of both products.
    pub fn count_common_days(&self, ts: &TimeSeriesStore, product1: &str, product2: &str, days: i32) -> Result<i32, TimeSeriesError> {
        let key = format!("common:{product1}:{product2}:{days}");
        let current = ts.current_day_id();
        if let Some(CachedValue::Int(v)) = self.lru.lock().unwrap().get(&key, current) {
            return Ok(v as i32);
        }
        let window = Self::window_days(ts, days)?;
        let count = window
            .iter()
            .filter(|day| day.iter().any(|e| e.product == product1) && day.iter().any(|e| e.product == product2))
            .count() as i64;
        self.lru.lock().unwrap().put(key, CachedValue::Int(count), current);
        Ok(count as i32)
    }

    /// Longest run of consecutive events with `product` within a single
    /// day, across every day in the window.
    pub fn find_max_consecutive(&self, ts: &TimeSeriesStore, product: &str, days: i32) -> Result<i32, TimeSeriesError> {
        let key = format!("maxseq:{product}:{days}");
        let current = ts.current_day_id();
        if let Some(CachedValue::Int(v)) = self.lru.lock().unwrap().get(&key, current) {
            return Ok(v as i32);
        }
        let window = Self::window_days(ts, days)?;
        let max_run = window.iter().map(|day| longest_run(day, product)).max().unwrap_or(0);
        self.lru.lock().unwrap().put(key, CachedValue::Int(max_run as i64), current);
        Ok(max_run)
    }
}

fn longest_run(events: &[crate::timeseries::Event], product: &str) -> i32 {
    let mut best = 0i32;
    let mut run = 0i32;
    for e in events {
        if e.product == product {
            run += 1;
            best = best.max(run);
        } else {
            run = 0;
        }
    }
    best
}
