//! Rule matching for feed items
//!
//! A [`Rule`] is the compiled form of a [`RuleSpec`]. Matching is pure: the
//! same item and rule set always give the same ordered result. Every matching
//! enabled rule is reported; an item is never consumed by the first match.

use regex::{Regex, RegexBuilder};

use crate::error::{Error, Result};
use crate::models::{DispatchParams, PatternKind, RuleSpec};
use crate::scraper::rss::Item;

/// Compiled rule
#[derive(Debug, Clone)]
pub struct Rule {
    spec: RuleSpec,
    pattern: Pattern,
    exclude: Option<Pattern>,
}

/// A rule that matched an item, paired with its dispatch parameters
#[derive(Debug, Clone)]
pub struct RuleMatch<'a> {
    pub rule: &'a Rule,
    pub params: DispatchParams,
}

#[derive(Debug, Clone)]
enum Pattern {
    /// Lowercased needle
    Substring(String),
    Regex(Regex),
}

impl Pattern {
    fn compile(kind: PatternKind, raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Err(Error::Request("rule pattern must not be empty".to_string()));
        }
        match kind {
            PatternKind::Substring => Ok(Pattern::Substring(raw.to_lowercase())),
            PatternKind::Regex => RegexBuilder::new(raw)
                .size_limit(1 << 20)
                .build()
                .map(Pattern::Regex)
                .map_err(|e| Error::Request(format!("invalid regex '{}': {}", raw, e))),
        }
    }

    fn is_match(&self, haystack: &str) -> bool {
        match self {
            Pattern::Substring(needle) => haystack.to_lowercase().contains(needle),
            Pattern::Regex(re) => re.is_match(haystack),
        }
    }
}

impl Rule {
    /// Compile a rule; fails with a request error if a pattern is invalid
    pub fn compile(spec: RuleSpec) -> Result<Self> {
        if spec.id.trim().is_empty() {
            return Err(Error::Request("rule id must not be empty".to_string()));
        }
        let pattern = Pattern::compile(spec.pattern_kind, &spec.pattern)?;
        // Exclusions use the same interpretation as the main pattern
        let exclude = spec
            .exclude
            .as_deref()
            .filter(|e| !e.trim().is_empty())
            .map(|e| Pattern::compile(spec.pattern_kind, e))
            .transpose()?;

        Ok(Self {
            spec,
            pattern,
            exclude,
        })
    }

    pub fn id(&self) -> &str {
        &self.spec.id
    }

    pub fn feed_id(&self) -> &str {
        &self.spec.feed
    }

    pub fn enabled(&self) -> bool {
        self.spec.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.spec.enabled = enabled;
    }

    pub fn spec(&self) -> &RuleSpec {
        &self.spec
    }

    pub fn params(&self) -> DispatchParams {
        DispatchParams {
            save_path: self.spec.save_path.clone(),
            category: self.spec.category.clone(),
        }
    }

    /// Check the item against this rule, ignoring the enabled flag
    pub fn matches(&self, item: &Item) -> bool {
        let hit = self.pattern.is_match(&item.title)
            || (self.spec.match_link && self.pattern.is_match(&item.link));
        if !hit {
            return false;
        }

        if let Some(exclude) = &self.exclude {
            if exclude.is_match(&item.title) {
                tracing::debug!(
                    "Item '{}' excluded by rule '{}'",
                    item.title,
                    self.spec.id
                );
                return false;
            }
        }

        true
    }
}

/// Returns every enabled rule matching `item`, in the order given
pub fn match_rules<'a>(item: &Item, rules: &'a [Rule]) -> Vec<RuleMatch<'a>> {
    rules
        .iter()
        .filter(|rule| rule.enabled() && rule.matches(item))
        .map(|rule| RuleMatch {
            rule,
            params: rule.params(),
        })
        .collect()
}
