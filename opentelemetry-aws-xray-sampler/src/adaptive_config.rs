use regex::Regex;

use crate::Error;

/// What a matched anomaly condition is allowed to influence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UsageType {
    /// Feeds both the sampling boost and anomaly trace capture.
    Both,
    /// Only feeds the sampling-rate boost.
    SamplingBoost,
    /// Only feeds the anomaly trace capture reservoir.
    AnomalyTraceCapture,
    /// Evaluated but applied to neither mechanism.
    Neither,
}

impl UsageType {
    /// Whether matches gated by this usage contribute to sampling boosts.
    pub fn is_used_for_boost(self) -> bool {
        matches!(self, UsageType::Both | UsageType::SamplingBoost)
    }

    /// Whether matches gated by this usage contribute to anomaly capture.
    pub fn is_used_for_anomaly_trace_capture(self) -> bool {
        matches!(self, UsageType::Both | UsageType::AnomalyTraceCapture)
    }
}

/// A single anomaly predicate: a span observation is a candidate when its
/// error code matches, its operation is listed, or its latency exceeds the
/// threshold.
#[derive(Clone, Debug)]
pub struct AnomalyCondition {
    error_code_regex: Option<Regex>,
    operations: Option<Vec<String>>,
    high_latency_ms: Option<u64>,
    usage: UsageType,
}

impl AnomalyCondition {
    /// Builds a validated condition.
    ///
    /// At least one of the three predicates must be present, the regex must
    /// compile and the latency threshold must be nonzero; these come from
    /// static configuration and fail fast.
    pub fn new(
        error_code_regex: Option<&str>,
        operations: Option<Vec<String>>,
        high_latency_ms: Option<u64>,
        usage: UsageType,
    ) -> Result<Self, Error> {
        if error_code_regex.is_none() && operations.is_none() && high_latency_ms.is_none() {
            return Err(Error::InvalidConfiguration(
                "anomaly condition constrains neither error code, operations nor latency".into(),
            ));
        }
        let error_code_regex = match error_code_regex {
            Some(pattern) => Some(Regex::new(pattern).map_err(|err| {
                Error::InvalidConfiguration(format!("invalid errorCodeRegex: {err}"))
            })?),
            None => None,
        };
        if high_latency_ms == Some(0) {
            return Err(Error::InvalidConfiguration(
                "highLatencyMs must be nonzero".into(),
            ));
        }
        Ok(AnomalyCondition {
            error_code_regex,
            operations,
            high_latency_ms,
            usage,
        })
    }

    /// The mechanisms this condition feeds when matched.
    pub fn usage(&self) -> UsageType {
        self.usage
    }

    pub(crate) fn matches(
        &self,
        error_code: Option<&str>,
        operation: Option<&str>,
        latency_ms: Option<u64>,
    ) -> bool {
        if let (Some(regex), Some(code)) = (&self.error_code_regex, error_code) {
            if regex.is_match(code) {
                return true;
            }
        }
        if let (Some(operations), Some(operation)) = (&self.operations, operation) {
            if operations.iter().any(|candidate| candidate == operation) {
                return true;
            }
        }
        if let (Some(threshold), Some(latency)) = (self.high_latency_ms, latency_ms) {
            if latency > threshold {
                return true;
            }
        }
        false
    }
}

/// Cap on how many anomalous traces per second may be force-kept.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AnomalyCaptureLimit {
    /// Anomaly traces per second granted by the capture reservoir.
    pub anomaly_traces_per_second: u32,
}

/// How matched anomaly conditions may influence sampling for a span
/// observation: aggregated over every matching condition's usage.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct AnomalyUsage {
    pub(crate) boost: bool,
    pub(crate) capture: bool,
    pub(crate) matched: bool,
}

/// Static adaptive-sampling configuration: anomaly predicates plus the
/// capture limit. Constructed once and handed to the sampler builder.
#[derive(Clone, Debug)]
pub struct AdaptiveSamplingConfig {
    version: f64,
    anomaly_conditions: Vec<AnomalyCondition>,
    anomaly_capture_limit: Option<AnomalyCaptureLimit>,
}

impl AdaptiveSamplingConfig {
    /// Builds a validated configuration; `version` must be a positive finite
    /// number.
    pub fn new(
        version: f64,
        anomaly_conditions: Vec<AnomalyCondition>,
        anomaly_capture_limit: Option<AnomalyCaptureLimit>,
    ) -> Result<Self, Error> {
        if !version.is_finite() || version <= 0.0 {
            return Err(Error::InvalidConfiguration(format!(
                "version must be a positive number, got {version}"
            )));
        }
        Ok(AdaptiveSamplingConfig {
            version,
            anomaly_conditions,
            anomaly_capture_limit,
        })
    }

    /// The configuration schema version.
    pub fn version(&self) -> f64 {
        self.version
    }

    /// The configured capture limit, if any.
    pub fn anomaly_capture_limit(&self) -> Option<AnomalyCaptureLimit> {
        self.anomaly_capture_limit
    }

    /// Whether the observation matches any anomaly condition, regardless of
    /// usage gating.
    pub fn is_anomaly(
        &self,
        error_code: Option<&str>,
        operation: Option<&str>,
        latency_ms: Option<u64>,
    ) -> bool {
        self.anomaly_usage(error_code, operation, latency_ms).matched
    }

    pub(crate) fn anomaly_usage(
        &self,
        error_code: Option<&str>,
        operation: Option<&str>,
        latency_ms: Option<u64>,
    ) -> AnomalyUsage {
        let mut usage = AnomalyUsage::default();
        for condition in &self.anomaly_conditions {
            if !condition.matches(error_code, operation, latency_ms) {
                continue;
            }
            usage.matched = true;
            usage.boost |= condition.usage().is_used_for_boost();
            usage.capture |= condition.usage().is_used_for_anomaly_trace_capture();
        }
        usage
    }
}
