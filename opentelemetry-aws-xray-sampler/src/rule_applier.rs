use std::borrow::Cow;
use std::sync::{Arc, Mutex, RwLock};
use std::time::SystemTime;

use opentelemetry::trace::{Link, SamplingDecision, SamplingResult, SpanKind, TraceId};
use opentelemetry::{Context, Key, KeyValue};
use opentelemetry_sdk::trace::{Sampler, ShouldSample};
use opentelemetry_sdk::Resource;
use opentelemetry_semantic_conventions::attribute::{
    AWS_ECS_CONTAINER_ARN, CLOUD_PLATFORM, CLOUD_RESOURCE_ID, HTTP_REQUEST_METHOD, SERVER_ADDRESS,
    SERVICE_NAME, URL_FULL, URL_PATH,
};

use crate::clock::Clock;
use crate::matcher;
use crate::rate_limiting_sampler::RateLimitingSampler;
use crate::sampling_rule::SamplingRule;
use crate::sampling_targets::SamplingTargetDocument;

// Pre-1.0 HTTP semantic convention keys. The sampling rules configured
// against other X-Ray SDKs still target spans produced with these, so they
// are consulted as fallbacks for their current equivalents.
const HTTP_TARGET: &str = "http.target";
const HTTP_URL: &str = "http.url";
const HTTP_METHOD: &str = "http.method";
const HTTP_HOST: &str = "http.host";
const FAAS_ID: &str = "faas.id";

/// Running per-rule counters, drained on every targets poll.
#[derive(Clone, Debug, Default)]
pub(crate) struct SamplingStatistics {
    pub(crate) request_count: u64,
    pub(crate) borrow_count: u64,
    pub(crate) sample_count: u64,
    pub(crate) anomaly_count: u64,
    pub(crate) sampled_anomaly_count: u64,
}

/// The mutable part of an applier, replaced wholesale when a targets poll
/// grants a new quota.
#[derive(Debug)]
struct TargetState {
    rate_limiting: RateLimitingSampler,
    reservoir: Sampler,
    fixed_rate: Sampler,
    reservoir_expiry: SystemTime,
    boost: Option<ActiveBoost>,
}

#[derive(Debug)]
struct ActiveBoost {
    expiry: SystemTime,
    sampler: Sampler,
}

/// One remote rule plus its live sampling state: the reservoir and
/// fixed-rate samplers, the granted quota's expiry and the statistics
/// counters that feed the next targets report.
///
/// Decisions are two-tier: the reservoir (a guaranteed per-second allotment,
/// borrowed at a 1/s trickle while no usable quota is granted) is consulted
/// first; only when it refuses does the fixed-rate tier sample a percentage
/// of the remainder. Both tiers respect an already-sampled parent.
#[derive(Debug)]
pub(crate) struct SamplingRuleApplier {
    rule: SamplingRule,
    digest: String,
    can_borrow: bool,
    clock: Arc<dyn Clock>,
    statistics: Mutex<SamplingStatistics>,
    target: RwLock<TargetState>,
}

impl SamplingRuleApplier {
    pub(crate) fn new(rule: SamplingRule, clock: Arc<dyn Clock>) -> Self {
        let can_borrow = rule.reservoir_size > 0;
        let rate_limiting = RateLimitingSampler::with_borrowing(0.0, clock.clone(), can_borrow);
        let reservoir = Sampler::ParentBased(Box::new(rate_limiting.clone()));
        let fixed_rate =
            Sampler::ParentBased(Box::new(Sampler::TraceIdRatioBased(rule.fixed_rate)));
        let digest = rule.digest();
        SamplingRuleApplier {
            digest,
            can_borrow,
            statistics: Mutex::new(SamplingStatistics::default()),
            target: RwLock::new(TargetState {
                rate_limiting,
                reservoir,
                fixed_rate,
                reservoir_expiry: clock.now(),
                boost: None,
            }),
            clock,
            rule,
        }
    }

    pub(crate) fn rule(&self) -> &SamplingRule {
        &self.rule
    }

    pub(crate) fn rule_name(&self) -> &str {
        &self.rule.rule_name
    }

    pub(crate) fn digest(&self) -> &str {
        &self.digest
    }

    /// Whether the span described by `attributes`, produced under
    /// `resource`, matches this rule.
    pub(crate) fn matches(&self, resource: &Resource, attributes: &[KeyValue]) -> bool {
        let url_path = attribute_value(attributes, URL_PATH)
            .or_else(|| attribute_value(attributes, HTTP_TARGET));
        let url_full = attribute_value(attributes, URL_FULL)
            .or_else(|| attribute_value(attributes, HTTP_URL));
        let http_method = attribute_value(attributes, HTTP_REQUEST_METHOD)
            .or_else(|| attribute_value(attributes, HTTP_METHOD));
        let server_address = attribute_value(attributes, SERVER_ADDRESS)
            .or_else(|| attribute_value(attributes, HTTP_HOST));

        let service_name = resource_string(resource, SERVICE_NAME).unwrap_or_default();

        // The path may only be present inside the full URL; when neither is
        // set the path is assumed to be "/".
        let url_path = match (url_path, url_full.as_deref()) {
            (Some(path), _) => Some(path.into_owned()),
            (None, Some(full)) => parse_url_path(full),
            (None, None) => Some("/".to_string()),
        };

        matcher::attribute_match(attributes, &self.rule.attributes)
            && matcher::wildcard_match(url_path.as_deref(), Some(&self.rule.url_path))
            && matcher::wildcard_match(http_method.as_deref(), Some(&self.rule.http_method))
            && matcher::wildcard_match(server_address.as_deref(), Some(&self.rule.host))
            && matcher::wildcard_match(Some(&service_name), Some(&self.rule.service_name))
            && matcher::wildcard_match(Some(service_type(resource)), Some(&self.rule.service_type))
            && matcher::wildcard_match(
                Some(&resource_arn(resource, attributes)),
                Some(&self.rule.resource_arn),
            )
    }

    pub(crate) fn should_sample(
        &self,
        parent_context: Option<&Context>,
        trace_id: TraceId,
        name: &str,
        span_kind: &SpanKind,
        attributes: &[KeyValue],
        links: &[Link],
    ) -> SamplingResult {
        let (reservoir, fixed_rate, rate_limiting) = {
            let state = self.target.read().unwrap();
            if self.clock.now() >= state.reservoir_expiry {
                state.rate_limiting.set_borrowing(self.can_borrow);
            }
            let fixed_rate = match &state.boost {
                Some(boost) if self.clock.now() < boost.expiry => boost.sampler.clone(),
                _ => state.fixed_rate.clone(),
            };
            (
                state.reservoir.clone(),
                fixed_rate,
                state.rate_limiting.clone(),
            )
        };

        let mut has_borrowed = false;
        let mut has_sampled = false;
        let mut result =
            reservoir.should_sample(parent_context, trace_id, name, span_kind, attributes, links);
        if result.decision != SamplingDecision::Drop {
            has_borrowed = rate_limiting.is_borrowing();
            has_sampled = true;
        } else {
            result = fixed_rate
                .should_sample(parent_context, trace_id, name, span_kind, attributes, links);
            if result.decision != SamplingDecision::Drop {
                has_sampled = true;
            }
        }

        let mut statistics = self.statistics.lock().unwrap();
        statistics.request_count += 1;
        if has_borrowed {
            statistics.borrow_count += 1;
        }
        if has_sampled {
            statistics.sample_count += 1;
        }
        drop(statistics);

        result
    }

    /// Atomically snapshots and zeroes the statistics counters.
    pub(crate) fn get_then_reset_statistics(&self) -> SamplingStatistics {
        let mut statistics = self.statistics.lock().unwrap();
        std::mem::take(&mut *statistics)
    }

    pub(crate) fn record_anomaly(&self, sampled: bool) {
        let mut statistics = self.statistics.lock().unwrap();
        statistics.anomaly_count += 1;
        if sampled {
            statistics.sampled_anomaly_count += 1;
        }
    }

    /// Installs a freshly granted quota: a non-borrowing reservoir at
    /// `reservoir_quota` tokens/second, the new fixed rate, the quota's
    /// expiry and any sampling boost (capped by the rule's boost bounds).
    pub(crate) fn update_target(&self, target: &SamplingTargetDocument) {
        let quota = target.reservoir_quota.unwrap_or(0).max(0) as f64;
        let fixed_rate_value = target.fixed_rate;

        let rate_limiting = RateLimitingSampler::new(quota, self.clock.clone());
        let reservoir = Sampler::ParentBased(Box::new(rate_limiting.clone()));
        let fixed_rate =
            Sampler::ParentBased(Box::new(Sampler::TraceIdRatioBased(fixed_rate_value)));
        let reservoir_expiry = match target.reservoir_quota_ttl {
            Some(ttl) => self.clock.from_timestamp(ttl),
            // No TTL means the quota is already unusable.
            None => self.clock.now(),
        };
        let boost = target.sampling_boost.as_ref().map(|boost| {
            let mut rate = boost.boost_rate;
            if let Some(bounds) = &self.rule.sampling_rate_boost {
                rate = rate.min(bounds.max_rate);
            }
            rate = rate.max(fixed_rate_value);
            ActiveBoost {
                expiry: match boost.boost_rate_ttl {
                    Some(ttl) => self.clock.from_timestamp(ttl),
                    None => self.clock.now(),
                },
                sampler: Sampler::ParentBased(Box::new(Sampler::TraceIdRatioBased(rate))),
            }
        });

        let mut state = self.target.write().unwrap();
        *state = TargetState {
            rate_limiting,
            reservoir,
            fixed_rate,
            reservoir_expiry,
            boost,
        };
    }

    #[cfg(test)]
    pub(crate) fn reservoir_quota(&self) -> f64 {
        self.target.read().unwrap().rate_limiting.quota()
    }
}

fn attribute_value<'a>(attributes: &'a [KeyValue], key: &str) -> Option<Cow<'a, str>> {
    attributes
        .iter()
        .find(|attribute| attribute.key.as_str() == key)
        .map(|attribute| attribute.value.as_str())
}

fn resource_string(resource: &Resource, key: &'static str) -> Option<String> {
    resource
        .get(&Key::from_static_str(key))
        .map(|value| value.as_str().into_owned())
}

fn parse_url_path(url_full: &str) -> Option<String> {
    // A full URL always carries a scheme; anything else is assumed to be bad
    // instrumentation and contributes no path.
    if !url_full.contains("://") {
        return None;
    }
    match url::Url::parse(url_full) {
        Ok(url) => {
            let path = url.path();
            Some(if path.is_empty() {
                "/".to_string()
            } else {
                path.to_string()
            })
        }
        Err(_) => None,
    }
}

fn service_type(resource: &Resource) -> &'static str {
    let platform = match resource.get(&Key::from_static_str(CLOUD_PLATFORM)) {
        Some(value) => value.as_str().into_owned(),
        None => return "",
    };
    match platform.as_str() {
        "aws_lambda" => "AWS::Lambda::Function",
        "aws_elastic_beanstalk" => "AWS::ElasticBeanstalk::Environment",
        "aws_ec2" => "AWS::EC2::Instance",
        "aws_ecs" => "AWS::ECS::Container",
        "aws_eks" => "AWS::EKS::Container",
        _ => "",
    }
}

fn resource_arn(resource: &Resource, attributes: &[KeyValue]) -> String {
    if let Some(arn) = resource_string(resource, AWS_ECS_CONTAINER_ARN) {
        return arn;
    }
    if resource_string(resource, CLOUD_PLATFORM).as_deref() == Some("aws_lambda") {
        // The resource id may only be known per invocation, in which case it
        // is carried on the span instead of the resource.
        if let Some(arn) = resource_string(resource, CLOUD_RESOURCE_ID)
            .or_else(|| resource_string(resource, FAAS_ID))
        {
            return arn;
        }
        if let Some(arn) = attribute_value(attributes, CLOUD_RESOURCE_ID)
            .or_else(|| attribute_value(attributes, FAAS_ID))
        {
            return arn.into_owned();
        }
    }
    String::new()
}
