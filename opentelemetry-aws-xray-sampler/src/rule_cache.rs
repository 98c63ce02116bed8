use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime};

use opentelemetry::{otel_debug, otel_info, KeyValue};
use opentelemetry_sdk::Resource;

use crate::clock::Clock;
use crate::rule_applier::SamplingRuleApplier;
use crate::sampling_rule::SamplingRule;
use crate::sampling_targets::SamplingTargetDocument;

/// How long a fetched rule set stays authoritative without a successful
/// refresh before decisions revert to the fallback sampler.
pub(crate) const CACHE_TTL: Duration = Duration::from_secs(3600);

/// The current set of rule appliers, sorted by rule precedence.
///
/// Readers grab an `Arc` to the snapshot and never hold the lock across
/// matching; the rules poller swaps in a freshly built vector. Target
/// updates mutate the existing appliers in place (their own state is
/// internally synchronized), so readers observe either the old or the new
/// quota, never a torn rule set.
#[derive(Debug)]
pub(crate) struct RuleCache {
    clock: Arc<dyn Clock>,
    appliers: RwLock<Arc<Vec<Arc<SamplingRuleApplier>>>>,
    last_updated: Mutex<Option<SystemTime>>,
}

impl RuleCache {
    pub(crate) fn new(clock: Arc<dyn Clock>) -> Self {
        RuleCache {
            clock,
            appliers: RwLock::new(Arc::new(Vec::new())),
            last_updated: Mutex::new(None),
        }
    }

    pub(crate) fn appliers(&self) -> Arc<Vec<Arc<SamplingRuleApplier>>> {
        self.appliers.read().unwrap().clone()
    }

    /// First applier, in priority order, whose rule matches the span.
    pub(crate) fn find(
        &self,
        resource: &Resource,
        attributes: &[KeyValue],
    ) -> Option<Arc<SamplingRuleApplier>> {
        self.appliers()
            .iter()
            .find(|applier| applier.matches(resource, attributes))
            .cloned()
    }

    /// Replaces the snapshot with `new_rules`, keeping the applier (and its
    /// accumulated statistics and quota) for every rule that is unchanged by
    /// name and content.
    pub(crate) fn update_rules(&self, mut new_rules: Vec<SamplingRule>) {
        new_rules.sort();

        let current = self.appliers();
        let mut next = Vec::with_capacity(new_rules.len());
        for rule in new_rules {
            if rule.rule_name.is_empty() {
                otel_info!(name: "XrayRuleCache.RuleWithoutNameSkipped");
                continue;
            }
            if rule.version != 1 {
                otel_info!(
                    name: "XrayRuleCache.UnsupportedRuleVersionSkipped",
                    rule = rule.rule_name.as_str(),
                    version = rule.version
                );
                continue;
            }
            match current.iter().find(|applier| *applier.rule() == rule) {
                Some(existing) => next.push(existing.clone()),
                None => next.push(Arc::new(SamplingRuleApplier::new(rule, self.clock.clone()))),
            }
        }

        *self.appliers.write().unwrap() = Arc::new(next);
        *self.last_updated.lock().unwrap() = Some(self.clock.now());
    }

    /// Merges target documents into the matching appliers by rule name,
    /// returning how many were applied.
    pub(crate) fn update_targets(&self, targets: &[SamplingTargetDocument]) -> usize {
        let appliers = self.appliers();
        let mut applied = 0;
        for target in targets {
            match appliers
                .iter()
                .find(|applier| applier.rule_name() == target.rule_name)
            {
                Some(applier) => {
                    applier.update_target(target);
                    applied += 1;
                }
                None => {
                    otel_debug!(
                        name: "XrayRuleCache.TargetForUnknownRule",
                        rule = target.rule_name.as_str()
                    );
                }
            }
        }
        applied
    }

    /// Whether the cached rules are stale (or were never fetched).
    pub(crate) fn expired(&self) -> bool {
        match *self.last_updated.lock().unwrap() {
            Some(updated) => self.clock.now() > updated + CACHE_TTL,
            None => true,
        }
    }
}
