use std::cmp::Ordering;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use opentelemetry::otel_debug;
use serde::{Deserialize, Serialize};

/// Default priority for rules that arrive without one; sorts after the
/// service-managed default rule (priority 10000).
const FALLBACK_PRIORITY: i64 = 10001;

/// A sampling rule as returned by `GetSamplingRules`.
///
/// Rules are immutable once decoded; the live state derived from a rule
/// (rate limiters, statistics) lives in the rule applier. Fields the service
/// may add in the future are collected in an unknown-field side-channel and
/// reported at debug level instead of failing the decode.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct SamplingRule {
    /// Unique name of the rule.
    pub rule_name: String,
    /// Rule precedence; lower values win.
    pub priority: i64,
    /// Fraction of requests sampled after the reservoir is exhausted.
    pub fixed_rate: f64,
    /// Guaranteed samples per second before `fixed_rate` applies.
    pub reservoir_size: i64,
    /// Pattern for the instrumented resource's ARN.
    #[serde(rename = "ResourceARN")]
    pub resource_arn: String,
    /// ARN of the rule itself.
    #[serde(rename = "RuleARN")]
    pub rule_arn: String,
    /// Pattern for the request host.
    pub host: String,
    /// Pattern for the HTTP method.
    #[serde(rename = "HTTPMethod")]
    pub http_method: String,
    /// Pattern for the service name.
    pub service_name: String,
    /// Pattern for the AWS service type (e.g. `AWS::ECS::Container`).
    pub service_type: String,
    /// Pattern for the request URL path.
    #[serde(rename = "URLPath")]
    pub url_path: String,
    /// Rule schema version; only version 1 is applied.
    pub version: i64,
    /// Span attribute patterns that must all match.
    pub attributes: HashMap<String, String>,
    /// Optional adaptive-sampling rate boost bounds for this rule.
    pub sampling_rate_boost: Option<SamplingRateBoost>,
    #[serde(flatten)]
    pub(crate) unknown_fields: HashMap<String, serde_json::Value>,
}

impl Default for SamplingRule {
    fn default() -> Self {
        SamplingRule {
            rule_name: String::new(),
            priority: FALLBACK_PRIORITY,
            fixed_rate: 0.0,
            reservoir_size: 0,
            resource_arn: String::new(),
            rule_arn: String::new(),
            host: String::new(),
            http_method: String::new(),
            service_name: String::new(),
            service_type: String::new(),
            url_path: String::new(),
            version: 0,
            attributes: HashMap::new(),
            sampling_rate_boost: None,
            unknown_fields: HashMap::new(),
        }
    }
}

impl SamplingRule {
    /// Short hex identifier of the rule content, attached to the trace state
    /// of sampled spans so a span can be correlated back to the rule that
    /// sampled it.
    pub(crate) fn digest(&self) -> String {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.rule_name.hash(&mut hasher);
        self.priority.hash(&mut hasher);
        self.fixed_rate.to_bits().hash(&mut hasher);
        self.reservoir_size.hash(&mut hasher);
        self.resource_arn.hash(&mut hasher);
        self.host.hash(&mut hasher);
        self.http_method.hash(&mut hasher);
        self.service_name.hash(&mut hasher);
        self.service_type.hash(&mut hasher);
        self.url_path.hash(&mut hasher);
        self.version.hash(&mut hasher);
        let mut attributes: Vec<_> = self.attributes.iter().collect();
        attributes.sort();
        attributes.hash(&mut hasher);
        format!("{:016x}", hasher.finish())
    }

    /// Debug-logs wire fields that are not part of the rule schema.
    pub(crate) fn report_unknown_fields(&self) {
        log_unknown_fields("SamplingRule", &self.rule_name, &self.unknown_fields);
        if let Some(boost) = &self.sampling_rate_boost {
            log_unknown_fields("SamplingRateBoost", &self.rule_name, &boost.unknown_fields);
        }
    }
}

// Unknown fields are decode metadata, not rule content.
impl PartialEq for SamplingRule {
    fn eq(&self, other: &Self) -> bool {
        self.rule_name == other.rule_name
            && self.priority == other.priority
            && self.fixed_rate == other.fixed_rate
            && self.reservoir_size == other.reservoir_size
            && self.resource_arn == other.resource_arn
            && self.rule_arn == other.rule_arn
            && self.host == other.host
            && self.http_method == other.http_method
            && self.service_name == other.service_name
            && self.service_type == other.service_type
            && self.url_path == other.url_path
            && self.version == other.version
            && self.attributes == other.attributes
            && self.sampling_rate_boost == other.sampling_rate_boost
    }
}

impl Eq for SamplingRule {}

impl PartialOrd for SamplingRule {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SamplingRule {
    /// Priority ascending, ties broken by rule name.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| self.rule_name.cmp(&other.rule_name))
    }
}

/// Bounds for anomaly-driven sampling boosts granted through
/// `SamplingTargets`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct SamplingRateBoost {
    /// Upper bound for any boosted sampling rate on this rule.
    pub max_rate: f64,
    /// Minutes to wait between boosts.
    pub cooldown_window_minutes: f64,
    #[serde(flatten)]
    pub(crate) unknown_fields: HashMap<String, serde_json::Value>,
}

impl PartialEq for SamplingRateBoost {
    fn eq(&self, other: &Self) -> bool {
        self.max_rate == other.max_rate
            && self.cooldown_window_minutes == other.cooldown_window_minutes
    }
}

pub(crate) fn log_unknown_fields(
    record: &'static str,
    rule_name: &str,
    unknown_fields: &HashMap<String, serde_json::Value>,
) {
    if unknown_fields.is_empty() {
        return;
    }
    let mut fields: Vec<&str> = unknown_fields.keys().map(String::as_str).collect();
    fields.sort_unstable();
    let fields = fields.join(", ");
    otel_debug!(
        name: "XraySamplingClient.UnknownFields",
        record = record,
        rule = rule_name,
        fields = fields.as_str()
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn named(priority: i64, name: &str) -> SamplingRule {
        SamplingRule {
            rule_name: name.to_string(),
            priority,
            version: 1,
            ..Default::default()
        }
    }

    #[test]
    fn ordering_is_priority_then_name() {
        let mut rules = vec![
            named(200, "abcdef"),
            named(100, "ab"),
            named(100, "A"),
            named(1, "abcdef"),
            named(100, "Abc"),
            named(100, "abc"),
        ];
        rules.sort();
        let names: Vec<_> = rules
            .iter()
            .map(|r| (r.priority, r.rule_name.as_str()))
            .collect();
        assert_eq!(
            names,
            vec![
                (1, "abcdef"),
                (100, "A"),
                (100, "Abc"),
                (100, "ab"),
                (100, "abc"),
                (200, "abcdef"),
            ]
        );
    }

    #[test]
    fn decodes_with_defaults() {
        let rule: SamplingRule = serde_json::from_value(json!({
            "RuleName": "minimal",
        }))
        .unwrap();
        assert_eq!(rule.rule_name, "minimal");
        assert_eq!(rule.priority, 10001);
        assert_eq!(rule.fixed_rate, 0.0);
        assert_eq!(rule.version, 0);
        assert!(rule.attributes.is_empty());
        assert!(rule.sampling_rate_boost.is_none());
    }

    #[test]
    fn unknown_fields_are_collected_not_fatal() {
        let rule: SamplingRule = serde_json::from_value(json!({
            "RuleName": "test",
            "Priority": 20,
            "FixedRate": 0.1,
            "ReservoirSize": 1,
            "ResourceARN": "*",
            "RuleARN": "arn:aws:xray:us-east-1:999999999999:sampling-rule/test",
            "Host": "localhost",
            "HTTPMethod": "GET",
            "ServiceName": "myServiceName",
            "ServiceType": "AWS::EKS::Container",
            "URLPath": "/helloworld",
            "Version": 1,
            "SamplingRateBoost": {"MaxRate": 0.5, "CooldownWindowMinutes": 2.0, "NewKnob": true},
            "ExtraField1": "cat",
            "ExtraField2": 123,
        }))
        .unwrap();

        assert_eq!(rule.fixed_rate, 0.1);
        assert_eq!(rule.service_name, "myServiceName");
        assert_eq!(rule.http_method, "GET");
        assert_eq!(rule.url_path, "/helloworld");
        let mut unknown: Vec<_> = rule.unknown_fields.keys().cloned().collect();
        unknown.sort();
        assert_eq!(unknown, vec!["ExtraField1", "ExtraField2"]);
        let boost = rule.sampling_rate_boost.as_ref().unwrap();
        assert_eq!(boost.max_rate, 0.5);
        assert!(boost.unknown_fields.contains_key("NewKnob"));
        rule.report_unknown_fields();
    }

    #[test]
    fn equality_ignores_unknown_fields() {
        let content = json!({
            "RuleName": "test",
            "Priority": 1,
            "Version": 1,
            "Attributes": {"abc": "123", "def": "4?6"},
        });
        let a: SamplingRule = serde_json::from_value(content.clone()).unwrap();
        let mut with_extra = content;
        with_extra["SomethingNew"] = json!("x");
        let b: SamplingRule = serde_json::from_value(with_extra).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.digest(), b.digest());

        let mut c = b.clone();
        c.fixed_rate = 0.5;
        assert_ne!(a, c);
        assert_ne!(a.digest(), c.digest());
    }

    #[test]
    fn boost_equality() {
        let a = SamplingRateBoost {
            max_rate: 0.5,
            cooldown_window_minutes: 2.0,
            ..Default::default()
        };
        let mut b = a.clone();
        assert_eq!(a, b);
        b.cooldown_window_minutes = 3.0;
        assert_ne!(a, b);
    }
}
