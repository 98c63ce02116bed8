use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::sampling_rule::log_unknown_fields;

/// Per-rule statistics reported to `SamplingTargets`, driving quota
/// redistribution across clients.
#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct SamplingStatisticsDocument {
    /// Stable random identifier of this sampler instance.
    #[serde(rename = "ClientID")]
    pub client_id: String,
    /// Name of the rule the statistics belong to.
    pub rule_name: String,
    /// Epoch seconds when the statistics were snapshotted.
    pub timestamp: f64,
    /// Requests matched against the rule since the last report.
    pub request_count: u64,
    /// Requests sampled by borrowing from the trickle budget.
    pub borrow_count: u64,
    /// Requests sampled in total.
    pub sample_count: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct SamplingTargetsRequest {
    pub(crate) sampling_statistics_documents: Vec<SamplingStatisticsDocument>,
}

/// A boosted sampling rate granted by the service in response to reported
/// anomalies, valid until its TTL.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct SamplingBoost {
    /// The boosted sampling rate.
    pub boost_rate: f64,
    /// Epoch seconds after which the boost no longer applies.
    #[serde(rename = "BoostRateTTL")]
    pub boost_rate_ttl: Option<f64>,
    #[serde(flatten)]
    pub(crate) unknown_fields: HashMap<String, serde_json::Value>,
}

/// New quota and rate for one rule, from the `SamplingTargets` response.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct SamplingTargetDocument {
    /// Name of the rule the target applies to.
    pub rule_name: String,
    /// Percentage of matching requests to sample after the reservoir.
    pub fixed_rate: f64,
    /// Seconds until the service wants the next statistics report; absent
    /// means the default cadence. Accepted but not acted upon.
    pub interval: Option<i64>,
    /// Reservoir tokens per second granted to this client.
    pub reservoir_quota: Option<i64>,
    /// Epoch seconds at which the granted quota expires.
    #[serde(rename = "ReservoirQuotaTTL")]
    pub reservoir_quota_ttl: Option<f64>,
    /// Optional anomaly-driven rate boost.
    pub sampling_boost: Option<SamplingBoost>,
    #[serde(flatten)]
    pub(crate) unknown_fields: HashMap<String, serde_json::Value>,
}

/// Statistics the service refused to process; logged, never retried.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct UnprocessedStatistics {
    /// Service error code.
    pub error_code: String,
    /// Human-readable reason.
    pub message: String,
    /// Name of the rule the rejected statistics belonged to.
    pub rule_name: String,
    #[serde(flatten)]
    pub(crate) unknown_fields: HashMap<String, serde_json::Value>,
}

/// Decoded `SamplingTargets` response. Defaults to empty contents so any
/// transport or decode failure can degrade to an ignorable value.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct SamplingTargetsResponse {
    /// Epoch seconds of the newest rule modification known to the service.
    pub last_rule_modification: f64,
    /// Per-rule targets to merge into the rule cache.
    pub sampling_target_documents: Vec<SamplingTargetDocument>,
    /// Statistics entries the service could not process.
    pub unprocessed_statistics: Vec<UnprocessedStatistics>,
    #[serde(flatten)]
    pub(crate) unknown_fields: HashMap<String, serde_json::Value>,
}

impl SamplingTargetsResponse {
    /// Debug-logs wire fields outside the targets schema.
    pub(crate) fn report_unknown_fields(&self) {
        log_unknown_fields("SamplingTargetsResponse", "", &self.unknown_fields);
        for target in &self.sampling_target_documents {
            log_unknown_fields(
                "SamplingTargetDocument",
                &target.rule_name,
                &target.unknown_fields,
            );
            if let Some(boost) = &target.sampling_boost {
                log_unknown_fields("SamplingBoost", &target.rule_name, &boost.unknown_fields);
            }
        }
        for unprocessed in &self.unprocessed_statistics {
            log_unknown_fields(
                "UnprocessedStatistics",
                &unprocessed.rule_name,
                &unprocessed.unknown_fields,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn statistics_document_serializes_with_wire_names() {
        let document = SamplingStatisticsDocument {
            client_id: "414243344a4b4c4d4e4f5051".to_string(),
            rule_name: "default".to_string(),
            timestamp: 1_707_551_387.0,
            request_count: 110,
            borrow_count: 20,
            sample_count: 100,
        };
        let value = serde_json::to_value(&document).unwrap();
        assert_eq!(
            value,
            json!({
                "ClientID": "414243344a4b4c4d4e4f5051",
                "RuleName": "default",
                "Timestamp": 1_707_551_387.0,
                "RequestCount": 110,
                "BorrowCount": 20,
                "SampleCount": 100,
            })
        );
    }

    #[test]
    fn targets_response_decodes() {
        let response: SamplingTargetsResponse = serde_json::from_value(json!({
            "LastRuleModification": 1_707_551_387.0,
            "SamplingTargetDocuments": [
                {
                    "RuleName": "default",
                    "FixedRate": 0.1,
                    "Interval": 10,
                    "ReservoirQuota": 30,
                    "ReservoirQuotaTTL": 1_707_764_006.0,
                },
                {
                    "RuleName": "boosted",
                    "FixedRate": 0.05,
                    "SamplingBoost": {"BoostRate": 0.5, "BoostRateTTL": 1_707_764_006.0},
                },
            ],
            "UnprocessedStatistics": [],
        }))
        .unwrap();

        assert_eq!(response.last_rule_modification, 1_707_551_387.0);
        assert_eq!(response.sampling_target_documents.len(), 2);
        let target = &response.sampling_target_documents[0];
        assert_eq!(target.reservoir_quota, Some(30));
        assert_eq!(target.reservoir_quota_ttl, Some(1_707_764_006.0));
        let boost = response.sampling_target_documents[1]
            .sampling_boost
            .as_ref()
            .unwrap();
        assert_eq!(boost.boost_rate, 0.5);
        assert!(response.unprocessed_statistics.is_empty());
    }

    #[test]
    fn unknown_response_fields_are_tolerated() {
        let response: SamplingTargetsResponse = serde_json::from_value(json!({
            "LastRuleModification": 1.0,
            "SamplingTargetDocuments": [
                {"RuleName": "default", "FixedRate": 0.1, "FutureField": {"nested": true}},
            ],
            "UnprocessedStatistics": [],
            "BrandNewTopLevel": 7,
        }))
        .unwrap();

        assert!(response.unknown_fields.contains_key("BrandNewTopLevel"));
        assert!(response.sampling_target_documents[0]
            .unknown_fields
            .contains_key("FutureField"));
        response.report_unknown_fields();
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let response: SamplingTargetsResponse = serde_json::from_value(json!({})).unwrap();
        assert_eq!(response.last_rule_modification, 0.0);
        assert!(response.sampling_target_documents.is_empty());
        assert!(response.unprocessed_statistics.is_empty());
    }
}
