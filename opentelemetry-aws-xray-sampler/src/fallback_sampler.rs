use std::sync::Arc;

use opentelemetry::trace::{Link, SamplingDecision, SamplingResult, SpanKind, TraceId};
use opentelemetry::{Context, KeyValue};
use opentelemetry_sdk::trace::{Sampler, ShouldSample};

use crate::clock::Clock;
use crate::rate_limiting_sampler::RateLimitingSampler;

/// Local sampler used before the first successful rules poll and whenever no
/// remote rule matches: one trace per second, plus 5% of the remainder.
///
/// Remote configuration cannot tune this floor down to zero throughput.
#[derive(Clone, Debug)]
pub(crate) struct FallbackSampler {
    rate_limiting: RateLimitingSampler,
    fixed_rate: Sampler,
}

impl FallbackSampler {
    pub(crate) fn new(clock: Arc<dyn Clock>) -> Self {
        FallbackSampler {
            rate_limiting: RateLimitingSampler::new(1.0, clock),
            fixed_rate: Sampler::TraceIdRatioBased(0.05),
        }
    }
}

impl ShouldSample for FallbackSampler {
    fn should_sample(
        &self,
        parent_context: Option<&Context>,
        trace_id: TraceId,
        name: &str,
        span_kind: &SpanKind,
        attributes: &[KeyValue],
        links: &[Link],
    ) -> SamplingResult {
        let result = self.rate_limiting.should_sample(
            parent_context,
            trace_id,
            name,
            span_kind,
            attributes,
            links,
        );
        if result.decision != SamplingDecision::Drop {
            return result;
        }
        self.fixed_rate
            .should_sample(parent_context, trace_id, name, span_kind, attributes, links)
    }
}
