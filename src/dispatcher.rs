//! Idempotent dispatch of one (rule, item) pair
//!
//! Order is fixed: dedup check, submit, then commit. A record is only written
//! after the remote acknowledged the add, so a failed submit is retried on a
//! later tick. A crash between acknowledgement and commit can cause one
//! duplicate add on the next run; that window is logged, never hidden.

use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::db::DedupStore;
use crate::error::{Error, Result};
use crate::models::{DispatchParams, DispatchRecord};
use crate::scraper::matcher::RuleMatch;
use crate::scraper::rss::Item;

/// Something that can hand an item to the remote torrent client
#[async_trait]
pub trait Submitter: Send + Sync {
    async fn submit(&self, item: &Item, params: &DispatchParams) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Remote accepted and the pair is recorded
    Dispatched,
    /// Pair was already recorded; nothing sent
    Skipped,
    /// Remote accepted but the record could not be written
    Unrecorded,
}

#[derive(Clone)]
pub struct Dispatcher {
    store: Arc<dyn DedupStore>,
    submitter: Arc<dyn Submitter>,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn DedupStore>, submitter: Arc<dyn Submitter>) -> Self {
        Self { store, submitter }
    }

    pub async fn dispatch(
        &self,
        item: &Item,
        matched: &RuleMatch<'_>,
        cancel: &CancellationToken,
    ) -> Result<DispatchOutcome> {
        let rule = matched.rule;
        // A store error here means we cannot tell; never dispatch blind
        if self.store.already_dispatched(rule.id(), &item.id).await? {
            tracing::debug!(rule = rule.id(), item = %item.id, "Already dispatched: {}", item.title);
            return Ok(DispatchOutcome::Skipped);
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            result = self.submitter.submit(item, &matched.params) => result?,
        }

        // Accepted by the remote: the commit runs even during shutdown
        let record = DispatchRecord {
            rule_id: rule.id().to_string(),
            item_id: item.id.clone(),
            title: item.title.clone(),
            download_url: item.download_url.clone(),
            dispatched_at: None,
        };

        match self.store.commit(&record).await {
            Ok(()) => {
                tracing::info!(rule = rule.id(), item = %item.id, "Dispatched: {}", item.title);
                Ok(DispatchOutcome::Dispatched)
            }
            Err(e) => {
                tracing::error!(
                    rule = rule.id(),
                    item = %item.id,
                    download_url = %item.download_url,
                    reconcile = true,
                    "Remote accepted '{}' but recording it failed: {}",
                    item.title,
                    e
                );
                Ok(DispatchOutcome::Unrecorded)
            }
        }
    }
}
