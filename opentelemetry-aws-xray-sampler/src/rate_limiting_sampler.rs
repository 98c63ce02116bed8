use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use opentelemetry::trace::{
    Link, SamplingDecision, SamplingResult, SpanKind, TraceContextExt, TraceId, TraceState,
};
use opentelemetry::{Context, KeyValue};
use opentelemetry_sdk::trace::ShouldSample;

use crate::clock::Clock;
use crate::rate_limiter::RateLimiter;

/// Reservoir sampler: records and samples while the underlying rate limiter
/// still has budget for the second, drops otherwise.
///
/// Clones share the limiter and the borrowing flag, so a clone handed to a
/// `ParentBased` wrapper stays in sync with the applier that owns it.
#[derive(Clone, Debug)]
pub(crate) struct RateLimitingSampler {
    reservoir: Arc<RateLimiter>,
    borrowing: Arc<AtomicBool>,
}

impl RateLimitingSampler {
    pub(crate) fn new(quota: f64, clock: Arc<dyn Clock>) -> Self {
        RateLimitingSampler {
            reservoir: Arc::new(RateLimiter::new(1, quota, clock)),
            borrowing: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn with_borrowing(quota: f64, clock: Arc<dyn Clock>, borrowing: bool) -> Self {
        let sampler = Self::new(quota, clock);
        sampler.set_borrowing(borrowing);
        sampler
    }

    pub(crate) fn set_borrowing(&self, borrowing: bool) {
        self.borrowing.store(borrowing, Ordering::Relaxed);
    }

    pub(crate) fn is_borrowing(&self) -> bool {
        self.borrowing.load(Ordering::Relaxed)
    }

    pub(crate) fn quota(&self) -> f64 {
        self.reservoir.quota()
    }
}

impl ShouldSample for RateLimitingSampler {
    fn should_sample(
        &self,
        parent_context: Option<&Context>,
        _trace_id: TraceId,
        _name: &str,
        _span_kind: &SpanKind,
        _attributes: &[KeyValue],
        _links: &[Link],
    ) -> SamplingResult {
        let decision = if self.reservoir.try_spend(1.0, self.is_borrowing()) {
            SamplingDecision::RecordAndSample
        } else {
            SamplingDecision::Drop
        };
        SamplingResult {
            decision,
            attributes: Vec::new(),
            trace_state: parent_trace_state(parent_context),
        }
    }
}

/// The trace state handed to new sampling results: inherited from the parent
/// span when one exists.
pub(crate) fn parent_trace_state(parent_context: Option<&Context>) -> TraceState {
    match parent_context {
        Some(cx) => cx.span().span_context().trace_state().clone(),
        None => TraceState::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::test::ManualClock;
    use std::time::{Duration, SystemTime};

    fn sample(sampler: &RateLimitingSampler) -> SamplingDecision {
        sampler
            .should_sample(
                None,
                TraceId::from_bytes((1 as u128).to_be_bytes()),
                "operation",
                &SpanKind::Server,
                &[],
                &[],
            )
            .decision
    }

    #[test]
    fn consumes_quota_then_drops() {
        let clock = Arc::new(ManualClock::new(SystemTime::now()));
        let sampler = RateLimitingSampler::new(2.0, clock.clone());

        clock.advance(Duration::from_secs(1));
        assert_eq!(sample(&sampler), SamplingDecision::RecordAndSample);
        assert_eq!(sample(&sampler), SamplingDecision::RecordAndSample);
        assert_eq!(sample(&sampler), SamplingDecision::Drop);

        clock.advance(Duration::from_millis(500));
        assert_eq!(sample(&sampler), SamplingDecision::RecordAndSample);
        assert_eq!(sample(&sampler), SamplingDecision::Drop);
    }

    #[test]
    fn borrowing_flag_is_shared_between_clones() {
        let clock = Arc::new(ManualClock::new(SystemTime::now()));
        let sampler = RateLimitingSampler::with_borrowing(0.0, clock.clone(), true);
        let clone = sampler.clone();

        clock.advance(Duration::from_secs(1));
        assert_eq!(sample(&clone), SamplingDecision::RecordAndSample);
        assert!(clone.is_borrowing());

        sampler.set_borrowing(false);
        clock.advance(Duration::from_secs(1));
        // Quota is zero, so without borrowing nothing is granted.
        assert_eq!(sample(&clone), SamplingDecision::Drop);
    }
}
