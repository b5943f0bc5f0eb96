//! Per-feed and per-rule status, read by the control surface
//!
//! Only the control loop writes here. Readers get a cloned snapshot.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedPhase {
    #[default]
    Idle,
    Fetching,
    Matching,
    Dispatching,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct FeedStatus {
    pub phase: FeedPhase,
    pub enabled: bool,
    pub last_started: Option<DateTime<Utc>>,
    pub last_finished: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_item_count: usize,
    pub runs: u64,
    pub skipped_ticks: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RuleStatus {
    pub last_dispatch: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub dispatched: u64,
    pub unrecorded: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StatusSnapshot {
    pub feeds: BTreeMap<String, FeedStatus>,
    pub rules: BTreeMap<String, RuleStatus>,
}

#[derive(Default)]
pub struct StatusBoard {
    inner: Mutex<StatusSnapshot>,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    fn update<F: FnOnce(&mut StatusSnapshot)>(&self, f: F) {
        // A poisoned board only means a panic mid-update; the data is still usable
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard);
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn register_feed(&self, feed_id: &str, enabled: bool) {
        self.update(|s| {
            s.feeds.entry(feed_id.to_string()).or_default().enabled = enabled;
        });
    }

    pub fn set_feed_enabled(&self, feed_id: &str, enabled: bool) {
        self.register_feed(feed_id, enabled);
    }

    pub fn feed_started(&self, feed_id: &str) {
        self.update(|s| {
            let feed = s.feeds.entry(feed_id.to_string()).or_default();
            feed.phase = FeedPhase::Fetching;
            feed.last_started = Some(Utc::now());
            feed.runs += 1;
        });
    }

    pub fn feed_phase(&self, feed_id: &str, phase: FeedPhase) {
        self.update(|s| {
            s.feeds.entry(feed_id.to_string()).or_default().phase = phase;
        });
    }

    pub fn feed_fetched(&self, feed_id: &str, item_count: usize) {
        self.update(|s| {
            let feed = s.feeds.entry(feed_id.to_string()).or_default();
            feed.phase = FeedPhase::Matching;
            feed.last_item_count = item_count;
        });
    }

    /// Close out a cycle, recording its error if it had one
    pub fn feed_finished(&self, feed_id: &str, error: Option<&Error>) {
        self.update(|s| {
            let feed = s.feeds.entry(feed_id.to_string()).or_default();
            let now = Utc::now();
            feed.phase = FeedPhase::Idle;
            feed.last_finished = Some(now);
            match error {
                Some(e) => feed.last_error = Some(e.to_string()),
                None => {
                    feed.last_success = Some(now);
                    feed.last_error = None;
                }
            }
        });
    }

    pub fn tick_skipped(&self, feed_id: &str) {
        self.update(|s| {
            s.feeds.entry(feed_id.to_string()).or_default().skipped_ticks += 1;
        });
    }

    pub fn rule_dispatched(&self, rule_id: &str) {
        self.update(|s| {
            let rule = s.rules.entry(rule_id.to_string()).or_default();
            rule.last_dispatch = Some(Utc::now());
            rule.dispatched += 1;
        });
    }

    pub fn rule_unrecorded(&self, rule_id: &str) {
        self.update(|s| {
            let rule = s.rules.entry(rule_id.to_string()).or_default();
            rule.last_dispatch = Some(Utc::now());
            rule.unrecorded += 1;
            rule.last_error = Some("dispatched but not recorded, may repeat".to_string());
        });
    }

    pub fn rule_failed(&self, rule_id: &str, error: &Error) {
        self.update(|s| {
            s.rules.entry(rule_id.to_string()).or_default().last_error = Some(error.to_string());
        });
    }

    pub fn forget_rule(&self, rule_id: &str) {
        self.update(|s| {
            s.rules.remove(rule_id);
        });
    }
}
