use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::Uri;
use opentelemetry::{otel_debug, otel_error};
use opentelemetry_http::{HttpClient, HttpError};
use serde::Deserialize;

use crate::sampling_rule::{log_unknown_fields, SamplingRule};
use crate::sampling_targets::{
    SamplingStatisticsDocument, SamplingTargetsRequest, SamplingTargetsResponse,
};
use crate::Error;

/// Bounded timeout applied to the default HTTP client; custom clients are
/// expected to bring their own.
pub(crate) const HTTP_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct GetSamplingRulesResponse {
    sampling_rule_records: Option<Vec<SamplingRuleRecord>>,
    #[serde(flatten)]
    unknown_fields: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct SamplingRuleRecord {
    sampling_rule: Option<SamplingRule>,
    #[serde(flatten)]
    unknown_fields: HashMap<String, serde_json::Value>,
}

/// Protocol client for the two X-Ray sampling endpoints.
///
/// Both operations are total: any transport, status, or decode failure
/// degrades to an empty result with a log line, so the pollers can simply
/// keep the previous good state until the next tick.
#[derive(Clone, Debug)]
pub(crate) struct XraySamplingClient {
    http_client: Arc<dyn HttpClient>,
    rules_endpoint: Uri,
    targets_endpoint: Uri,
}

impl XraySamplingClient {
    pub(crate) fn new(endpoint: &str, http_client: Arc<dyn HttpClient>) -> Result<Self, Error> {
        let parsed = url::Url::parse(endpoint)
            .map_err(|err| Error::InvalidEndpoint(endpoint.to_string(), err.to_string()))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(Error::InvalidEndpoint(
                endpoint.to_string(),
                format!("unsupported scheme {:?}", parsed.scheme()),
            ));
        }
        let base = endpoint.trim_end_matches('/');
        let endpoint_uri = |operation: &str| {
            Uri::from_str(&format!("{base}/{operation}"))
                .map_err(|err| Error::InvalidEndpoint(endpoint.to_string(), err.to_string()))
        };
        Ok(XraySamplingClient {
            http_client,
            rules_endpoint: endpoint_uri("GetSamplingRules")?,
            targets_endpoint: endpoint_uri("SamplingTargets")?,
        })
    }

    /// Fetches the full rule set; empty on any failure.
    pub(crate) fn get_sampling_rules(&self) -> Vec<SamplingRule> {
        let body = match self.post(&self.rules_endpoint, Bytes::from_static(b"{}")) {
            Ok(body) => body,
            Err(err) => {
                otel_error!(
                    name: "XraySamplingClient.Rules.RequestFailed",
                    error = format!("{err}")
                );
                return Vec::new();
            }
        };

        let response: GetSamplingRulesResponse = match serde_json::from_slice(&body) {
            Ok(response) => response,
            Err(err) => {
                otel_error!(
                    name: "XraySamplingClient.Rules.DecodeFailed",
                    error = format!("{err}")
                );
                return Vec::new();
            }
        };
        log_unknown_fields("GetSamplingRulesResponse", "", &response.unknown_fields);

        let records = match response.sampling_rule_records {
            Some(records) => records,
            None => {
                otel_error!(name: "XraySamplingClient.Rules.RecordsMissing");
                return Vec::new();
            }
        };
        records
            .into_iter()
            .filter_map(|record| {
                log_unknown_fields("SamplingRuleRecord", "", &record.unknown_fields);
                match record.sampling_rule {
                    Some(rule) => {
                        rule.report_unknown_fields();
                        Some(rule)
                    }
                    None => {
                        otel_error!(name: "XraySamplingClient.Rules.RuleMissingInRecord");
                        None
                    }
                }
            })
            .collect()
    }

    /// Reports statistics and fetches new targets; an empty response with
    /// `last_rule_modification == 0.0` on any failure.
    pub(crate) fn get_sampling_targets(
        &self,
        statistics: Vec<SamplingStatisticsDocument>,
    ) -> SamplingTargetsResponse {
        let request = SamplingTargetsRequest {
            sampling_statistics_documents: statistics,
        };
        let body = match serde_json::to_vec(&request) {
            Ok(body) => body,
            Err(err) => {
                otel_debug!(
                    name: "XraySamplingClient.Targets.EncodeFailed",
                    error = format!("{err}")
                );
                return SamplingTargetsResponse::default();
            }
        };

        let body = match self.post(&self.targets_endpoint, Bytes::from(body)) {
            Ok(body) => body,
            Err(err) => {
                otel_debug!(
                    name: "XraySamplingClient.Targets.RequestFailed",
                    error = format!("{err}")
                );
                return SamplingTargetsResponse::default();
            }
        };

        match serde_json::from_slice::<SamplingTargetsResponse>(&body) {
            Ok(response) => {
                response.report_unknown_fields();
                response
            }
            Err(err) => {
                otel_debug!(
                    name: "XraySamplingClient.Targets.DecodeFailed",
                    error = format!("{err}")
                );
                SamplingTargetsResponse::default()
            }
        }
    }

    fn post(&self, endpoint: &Uri, body: Bytes) -> Result<Bytes, HttpError> {
        let request = http::Request::builder()
            .method(http::Method::POST)
            .uri(endpoint.clone())
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(body)?;
        let response = futures_executor::block_on(self.http_client.send_bytes(request))?;
        if response.status() != http::StatusCode::OK {
            return Err(format!("unexpected response status {}", response.status()).into());
        }
        Ok(response.into_body())
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use serde_json::json;
    use std::fmt;
    use std::sync::Mutex;

    /// Scripted [`HttpClient`] double: answers each request from a queue of
    /// canned responses and records what was sent.
    pub(crate) struct ScriptedHttpClient {
        responses: Mutex<Vec<Result<(u16, String), String>>>,
        requests: Mutex<Vec<(String, String)>>,
    }

    impl fmt::Debug for ScriptedHttpClient {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("ScriptedHttpClient").finish()
        }
    }

    impl ScriptedHttpClient {
        pub(crate) fn new(responses: Vec<Result<(u16, String), String>>) -> Arc<Self> {
            Arc::new(ScriptedHttpClient {
                // Scripts are written first-call-first, popped from the back.
                responses: Mutex::new(responses.into_iter().rev().collect()),
                requests: Mutex::new(Vec::new()),
            })
        }

        pub(crate) fn push_response(&self, response: Result<(u16, String), String>) {
            self.responses.lock().unwrap().insert(0, response);
        }

        pub(crate) fn requests(&self) -> Vec<(String, String)> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl HttpClient for ScriptedHttpClient {
        async fn send_bytes(
            &self,
            request: http::Request<Bytes>,
        ) -> Result<http::Response<Bytes>, HttpError> {
            self.requests.lock().unwrap().push((
                request.uri().to_string(),
                String::from_utf8_lossy(request.body()).into_owned(),
            ));
            match self.responses.lock().unwrap().pop() {
                Some(Ok((status, body))) => Ok(http::Response::builder()
                    .status(status)
                    .body(Bytes::from(body))?),
                Some(Err(message)) => Err(message.into()),
                None => Err("no scripted response left".into()),
            }
        }
    }

    fn client(responses: Vec<Result<(u16, String), String>>) -> XraySamplingClient {
        XraySamplingClient::new("http://127.0.0.1:2000", ScriptedHttpClient::new(responses))
            .unwrap()
    }

    #[test]
    fn endpoints_are_derived_from_the_base() {
        let client = client(Vec::new());
        assert_eq!(
            client.rules_endpoint.to_string(),
            "http://127.0.0.1:2000/GetSamplingRules"
        );
        assert_eq!(
            client.targets_endpoint.to_string(),
            "http://127.0.0.1:2000/SamplingTargets"
        );
    }

    #[test]
    fn invalid_endpoints_are_rejected() {
        let http_client = ScriptedHttpClient::new(Vec::new());
        assert!(XraySamplingClient::new("not a url", http_client.clone()).is_err());
        assert!(XraySamplingClient::new("ftp://example.com", http_client).is_err());
    }

    #[test]
    fn rules_decode() {
        let response = json!({
            "SamplingRuleRecords": [
                {"SamplingRule": {"RuleName": "default", "Priority": 10000, "Version": 1}},
                {"SamplingRule": {"RuleName": "api", "Priority": 1, "Version": 1, "FutureField": 1}},
                {"NotARule": true},
            ],
            "NextToken": null,
        });
        let client = client(vec![Ok((200, response.to_string()))]);
        let rules = client.get_sampling_rules();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].rule_name, "default");
        assert_eq!(rules[1].rule_name, "api");
        assert!(rules[1].unknown_fields.contains_key("FutureField"));
    }

    #[test]
    fn rules_degrade_to_empty_on_transport_error() {
        let client = client(vec![Err("connection refused".to_string())]);
        assert!(client.get_sampling_rules().is_empty());
    }

    #[test]
    fn rules_degrade_to_empty_on_bad_envelope() {
        for body in ["not json", "{}", r#"{"Wrong": []}"#] {
            let client = client(vec![Ok((200, body.to_string()))]);
            assert!(client.get_sampling_rules().is_empty(), "body {body:?}");
        }
    }

    #[test]
    fn rules_degrade_to_empty_on_http_error_status() {
        let client = client(vec![Ok((500, "oops".to_string()))]);
        assert!(client.get_sampling_rules().is_empty());
    }

    #[test]
    fn targets_round_trip_sends_statistics() {
        let response = json!({
            "LastRuleModification": 1_707_551_387.0,
            "SamplingTargetDocuments": [
                {"RuleName": "default", "FixedRate": 0.1, "ReservoirQuota": 30, "ReservoirQuotaTTL": 1_707_764_006.0},
            ],
            "UnprocessedStatistics": [],
        });
        let http_client = ScriptedHttpClient::new(vec![Ok((200, response.to_string()))]);
        let client =
            XraySamplingClient::new("http://127.0.0.1:2000", http_client.clone()).unwrap();

        let statistics = vec![SamplingStatisticsDocument {
            client_id: "0123456789abcdef01234567".to_string(),
            rule_name: "default".to_string(),
            timestamp: 1_707_551_380.0,
            request_count: 10,
            borrow_count: 1,
            sample_count: 5,
        }];
        let targets = client.get_sampling_targets(statistics);
        assert_eq!(targets.last_rule_modification, 1_707_551_387.0);
        assert_eq!(targets.sampling_target_documents.len(), 1);

        let requests = http_client.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].0, "http://127.0.0.1:2000/SamplingTargets");
        let sent: serde_json::Value = serde_json::from_str(&requests[0].1).unwrap();
        assert_eq!(
            sent["SamplingStatisticsDocuments"][0]["RequestCount"],
            json!(10)
        );
        assert_eq!(
            sent["SamplingStatisticsDocuments"][0]["ClientID"],
            json!("0123456789abcdef01234567")
        );
    }

    #[test]
    fn targets_degrade_to_default_on_failure() {
        for script in [
            Err("timeout".to_string()),
            Ok((503, "unavailable".to_string())),
            Ok((200, "not json".to_string())),
            Ok((200, r#"{"LastRuleModification": null}"#.to_string())),
        ] {
            let client = client(vec![script]);
            let response = client.get_sampling_targets(Vec::new());
            assert_eq!(response.last_rule_modification, 0.0);
            assert!(response.sampling_target_documents.is_empty());
            assert!(response.unprocessed_statistics.is_empty());
        }
    }
}
