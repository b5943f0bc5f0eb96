//! Feed polling loop
//!
//! Each feed runs on its own interval in its own task. A tick fetches the
//! feed, matches every item against the feed's enabled rules and dispatches
//! the matches. Ticks of one feed never overlap: a tick that fires while the
//! previous one is still running is dropped and counted. Errors stop at the
//! tick boundary, so one broken feed never holds up another.

use anyhow::Context;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::db::{self, Database};
use crate::dispatcher::{DispatchOutcome, Dispatcher};
use crate::error::{Error, Result};
use crate::models::{DispatchRecord, Feed, RuleSpec};
use crate::status::{FeedPhase, StatusBoard, StatusSnapshot};

use super::matcher::{Rule, match_rules};
use super::rss::FeedSource;

/// How often old dispatch records are pruned
const PRUNE_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Failures of control-surface calls
#[derive(Error, Debug)]
pub enum ControlError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0}")]
    Invalid(String),
    #[error("storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
}

pub type ControlResult<T> = std::result::Result<T, ControlError>;

/// Counts from one feed cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub items: usize,
    pub dispatched: usize,
    pub skipped: usize,
    pub rejected: usize,
    pub unrecorded: usize,
}

struct FeedHandle {
    feed: Feed,
    enabled: AtomicBool,
    /// Held for the duration of a tick
    running: Arc<Mutex<()>>,
}

pub struct Controller {
    feeds: HashMap<String, FeedHandle>,
    rules: RwLock<Vec<Rule>>,
    source: Arc<dyn FeedSource>,
    dispatcher: Dispatcher,
    db: Database,
    status: Arc<StatusBoard>,
    cancel: CancellationToken,
    retention_days: u32,
}

impl Controller {
    pub fn new(
        feeds: Vec<Feed>,
        source: Arc<dyn FeedSource>,
        dispatcher: Dispatcher,
        db: Database,
        cancel: CancellationToken,
    ) -> Self {
        let status = Arc::new(StatusBoard::new());
        let feeds = feeds
            .into_iter()
            .map(|feed| {
                status.register_feed(&feed.id, feed.enabled);
                let handle = FeedHandle {
                    enabled: AtomicBool::new(feed.enabled),
                    running: Arc::new(Mutex::new(())),
                    feed,
                };
                (handle.feed.id.clone(), handle)
            })
            .collect();

        Self {
            feeds,
            rules: RwLock::new(Vec::new()),
            source,
            dispatcher,
            db,
            status,
            cancel,
            retention_days: 0,
        }
    }

    /// Prune dispatch records older than `days` once a day; 0 disables pruning
    pub fn with_retention_days(mut self, days: u32) -> Self {
        self.retention_days = days;
        self
    }

    /// Write `seed` rules to the database, then load every stored rule.
    ///
    /// Stored rules whose feed is no longer configured, or that no longer
    /// compile, are skipped with a warning.
    pub async fn load_rules(&self, seed: &[RuleSpec]) -> anyhow::Result<usize> {
        let seed = seed.to_vec();
        let stored = self
            .db
            .with_db(move |conn| {
                for spec in &seed {
                    db::rules::upsert_rule(conn, spec)?;
                }
                db::rules::get_all_rules(conn)
            })
            .await
            .context("Failed to load rules")?;

        let mut compiled = Vec::with_capacity(stored.len());
        for spec in stored {
            if !self.feeds.contains_key(&spec.feed) {
                tracing::warn!(rule = %spec.id, "Skipping rule for unknown feed '{}'", spec.feed);
                continue;
            }
            match Rule::compile(spec) {
                Ok(rule) => compiled.push(rule),
                Err(e) => tracing::warn!("Skipping stored rule: {}", e),
            }
        }

        let count = compiled.len();
        *self.rules.write().await = compiled;
        tracing::info!("Loaded {} rule(s) for {} feed(s)", count, self.feeds.len());

        Ok(count)
    }

    pub fn status(&self) -> StatusSnapshot {
        self.status.snapshot()
    }

    /// Configured feeds with their current enabled flag
    pub fn feeds(&self) -> Vec<Feed> {
        let mut feeds: Vec<Feed> = self
            .feeds
            .values()
            .map(|handle| Feed {
                enabled: handle.enabled.load(Ordering::SeqCst),
                ..handle.feed.clone()
            })
            .collect();
        feeds.sort_by(|a, b| a.id.cmp(&b.id));
        feeds
    }

    /// Start one polling task per feed plus the retention task.
    /// The tasks stop when the cancellation token fires.
    pub fn spawn(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut handles: Vec<JoinHandle<()>> = self
            .feeds
            .values()
            .map(|handle| {
                let this = self.clone();
                let feed_id = handle.feed.id.clone();
                let period = handle.feed.interval();
                tokio::spawn(async move { this.poll_feed(feed_id, period).await })
            })
            .collect();

        if self.retention_days > 0 {
            let this = self.clone();
            handles.push(tokio::spawn(async move { this.prune_loop().await }));
        }

        handles
    }

    async fn poll_feed(self: Arc<Self>, feed_id: String, period: Duration) {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::info!(feed = %feed_id, "Polling every {:?}", period);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            match self.try_start(&feed_id) {
                Some(guard) => {
                    let this = self.clone();
                    let feed_id = feed_id.clone();
                    tokio::spawn(async move { this.run_tick(&feed_id, guard).await });
                }
                None => {
                    tracing::debug!(feed = %feed_id, "Previous tick still running, skipping");
                    self.status.tick_skipped(&feed_id);
                }
            }
        }

        tracing::debug!(feed = %feed_id, "Polling stopped");
    }

    async fn prune_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(PRUNE_INTERVAL);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            let days = self.retention_days;
            match self
                .db
                .with_db(move |conn| db::history::prune_older_than(conn, days))
                .await
            {
                Ok(0) => {}
                Ok(removed) => tracing::info!("Pruned {} dispatch record(s) older than {} days", removed, days),
                Err(e) => tracing::warn!("Failed to prune dispatch history: {:#}", e),
            }
        }
    }

    /// Take the feed's run guard if no tick of it is in progress
    fn try_start(&self, feed_id: &str) -> Option<OwnedMutexGuard<()>> {
        self.feeds
            .get(feed_id)
            .and_then(|handle| handle.running.clone().try_lock_owned().ok())
    }

    /// Run one tick while holding the feed's guard. Never fails.
    async fn run_tick(&self, feed_id: &str, _guard: OwnedMutexGuard<()>) -> Option<CycleReport> {
        let handle = self.feeds.get(feed_id)?;
        if !handle.enabled.load(Ordering::SeqCst) {
            tracing::trace!(feed = %feed_id, "Feed disabled, tick ignored");
            return None;
        }

        self.status.feed_started(feed_id);
        let result = self.run_cycle(&handle.feed).await;

        match &result {
            Ok(report) => {
                tracing::info!(
                    feed = %feed_id,
                    items = report.items,
                    dispatched = report.dispatched,
                    skipped = report.skipped,
                    "Feed cycle complete"
                );
                self.status.feed_finished(feed_id, None);
            }
            Err(Error::Cancelled) => {
                tracing::info!(feed = %feed_id, "Feed cycle cancelled");
                self.status.feed_finished(feed_id, Some(&Error::Cancelled));
            }
            Err(e) => {
                tracing::warn!(feed = %feed_id, kind = e.kind(), "Feed cycle failed: {}", e);
                self.status.feed_finished(feed_id, Some(e));
            }
        }

        result.ok()
    }

    /// Fetch, match and dispatch one feed
    async fn run_cycle(&self, feed: &Feed) -> Result<CycleReport> {
        let items = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(Error::Cancelled),
            fetched = self.source.fetch(&feed.url) => fetched?,
        };
        self.status.feed_fetched(&feed.id, items.len());

        // Snapshot so rule edits are not blocked while the remote is slow
        let rules: Vec<Rule> = self
            .rules
            .read()
            .await
            .iter()
            .filter(|rule| rule.feed_id() == feed.id)
            .cloned()
            .collect();

        let mut report = CycleReport {
            items: items.len(),
            ..Default::default()
        };

        for item in &items {
            for matched in match_rules(item, &rules) {
                if self.cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }

                let rule = matched.rule;
                self.status.feed_phase(&feed.id, FeedPhase::Dispatching);
                let outcome = self.dispatcher.dispatch(item, &matched, &self.cancel).await;
                self.status.feed_phase(&feed.id, FeedPhase::Matching);

                match outcome {
                    Ok(DispatchOutcome::Dispatched) => {
                        report.dispatched += 1;
                        self.status.rule_dispatched(rule.id());
                    }
                    Ok(DispatchOutcome::Skipped) => report.skipped += 1,
                    Ok(DispatchOutcome::Unrecorded) => {
                        report.unrecorded += 1;
                        self.status.rule_unrecorded(rule.id());
                    }
                    Err(e) if !e.ends_cycle() => {
                        // Only this pair is affected, most likely a bad save path or category
                        tracing::warn!(
                            feed = %feed.id,
                            rule = rule.id(),
                            item = %item.id,
                            "Remote rejected '{}', check the rule's settings: {}",
                            item.title,
                            e
                        );
                        report.rejected += 1;
                        self.status.rule_failed(rule.id(), &e);
                    }
                    Err(e) => {
                        self.status.rule_failed(rule.id(), &e);
                        return Err(e);
                    }
                }
            }
        }

        Ok(report)
    }

    /// One pass over every enabled feed, concurrently. Feeds already mid-tick
    /// are left alone.
    pub async fn run_once(self: &Arc<Self>) -> HashMap<String, Option<CycleReport>> {
        let mut set = JoinSet::new();
        for feed_id in self.feeds.keys() {
            if let Some(guard) = self.try_start(feed_id) {
                let this = self.clone();
                let feed_id = feed_id.clone();
                set.spawn(async move {
                    let report = this.run_tick(&feed_id, guard).await;
                    (feed_id, report)
                });
            } else {
                self.status.tick_skipped(feed_id);
            }
        }

        let mut reports = HashMap::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((feed_id, report)) => {
                    reports.insert(feed_id, report);
                }
                Err(e) => tracing::error!("Feed task panicked: {}", e),
            }
        }
        reports
    }

    /// Run a tick of one feed now, in the background. Returns false if a tick
    /// of that feed is already running. Disabled feeds cannot be triggered.
    pub fn trigger_feed(self: &Arc<Self>, feed_id: &str) -> ControlResult<bool> {
        let handle = self
            .feeds
            .get(feed_id)
            .ok_or_else(|| ControlError::NotFound(format!("feed '{}'", feed_id)))?;
        if !handle.enabled.load(Ordering::SeqCst) {
            return Err(ControlError::Invalid(format!("feed '{}' is disabled", feed_id)));
        }

        match self.try_start(feed_id) {
            Some(guard) => {
                tracing::info!(feed = %feed_id, "Manual trigger");
                let this = self.clone();
                let feed_id = feed_id.to_string();
                tokio::spawn(async move { this.run_tick(&feed_id, guard).await });
                Ok(true)
            }
            None => {
                self.status.tick_skipped(feed_id);
                Ok(false)
            }
        }
    }

    pub fn set_feed_enabled(&self, feed_id: &str, enabled: bool) -> ControlResult<()> {
        let handle = self
            .feeds
            .get(feed_id)
            .ok_or_else(|| ControlError::NotFound(format!("feed '{}'", feed_id)))?;
        handle.enabled.store(enabled, Ordering::SeqCst);
        self.status.set_feed_enabled(feed_id, enabled);
        tracing::info!(feed = %feed_id, "Feed {}", if enabled { "enabled" } else { "disabled" });
        Ok(())
    }

    /// Wait for every in-flight tick to finish
    pub async fn drain(&self) {
        for handle in self.feeds.values() {
            let _ = handle.running.lock().await;
        }
    }

    pub async fn list_rules(&self) -> Vec<RuleSpec> {
        self.rules
            .read()
            .await
            .iter()
            .map(|rule| rule.spec().clone())
            .collect()
    }

    fn compile_for_known_feed(&self, spec: RuleSpec) -> ControlResult<Rule> {
        if !self.feeds.contains_key(&spec.feed) {
            return Err(ControlError::Invalid(format!(
                "rule '{}' references unknown feed '{}'",
                spec.id, spec.feed
            )));
        }
        Rule::compile(spec).map_err(|e| ControlError::Invalid(e.to_string()))
    }

    pub async fn add_rule(&self, spec: RuleSpec) -> ControlResult<RuleSpec> {
        let rule = self.compile_for_known_feed(spec)?;

        let mut rules = self.rules.write().await;
        if rules.iter().any(|r| r.id() == rule.id()) {
            return Err(ControlError::Invalid(format!("rule '{}' already exists", rule.id())));
        }

        let stored = rule.spec().clone();
        let to_save = stored.clone();
        self.db
            .with_db(move |conn| db::rules::upsert_rule(conn, &to_save))
            .await?;
        rules.push(rule);
        tracing::info!(rule = %stored.id, feed = %stored.feed, "Rule added");

        Ok(stored)
    }

    pub async fn update_rule(
        &self,
        id: &str,
        mut spec: RuleSpec,
    ) -> ControlResult<RuleSpec> {
        spec.id = id.to_string();
        let rule = self.compile_for_known_feed(spec)?;

        let mut rules = self.rules.write().await;
        let slot = rules
            .iter_mut()
            .find(|r| r.id() == id)
            .ok_or_else(|| ControlError::NotFound(format!("rule '{}'", id)))?;

        let stored = rule.spec().clone();
        let to_save = stored.clone();
        self.db
            .with_db(move |conn| db::rules::upsert_rule(conn, &to_save))
            .await?;
        *slot = rule;
        tracing::info!(rule = %id, "Rule updated");

        Ok(stored)
    }

    /// Delete a rule. Its dispatch records stay.
    pub async fn remove_rule(&self, id: &str) -> ControlResult<()> {
        let mut rules = self.rules.write().await;
        let index = rules
            .iter()
            .position(|r| r.id() == id)
            .ok_or_else(|| ControlError::NotFound(format!("rule '{}'", id)))?;

        let owned_id = id.to_string();
        self.db
            .with_db(move |conn| db::rules::delete_rule(conn, &owned_id))
            .await?;
        rules.remove(index);
        self.status.forget_rule(id);
        tracing::info!(rule = %id, "Rule removed");

        Ok(())
    }

    pub async fn set_rule_enabled(
        &self,
        id: &str,
        enabled: bool,
    ) -> ControlResult<()> {
        let mut rules = self.rules.write().await;
        let rule = rules
            .iter_mut()
            .find(|r| r.id() == id)
            .ok_or_else(|| ControlError::NotFound(format!("rule '{}'", id)))?;

        let owned_id = id.to_string();
        self.db
            .with_db(move |conn| db::rules::set_rule_enabled(conn, &owned_id, enabled))
            .await?;
        rule.set_enabled(enabled);
        tracing::info!(rule = %id, "Rule {}", if enabled { "enabled" } else { "disabled" });

        Ok(())
    }

    /// Dispatch records of a rule, newest first. Works for deleted rules too.
    pub async fn rule_history(&self, id: &str) -> ControlResult<Vec<DispatchRecord>> {
        let owned_id = id.to_string();
        let records = self
            .db
            .with_db(move |conn| db::history::get_rule_history(conn, &owned_id))
            .await?;
        Ok(records)
    }
}
