use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use opentelemetry::trace::{Link, SamplingResult, SpanKind, TraceId};
use opentelemetry::{otel_debug, otel_warn, Context, KeyValue};
use opentelemetry_http::HttpClient;
use opentelemetry_sdk::trace::ShouldSample;
use opentelemetry_sdk::Resource;

use crate::adaptive_config::AdaptiveSamplingConfig;
use crate::clock::{epoch_secs, Clock, SystemClock};
use crate::client::{XraySamplingClient, HTTP_TIMEOUT};
use crate::fallback_sampler::FallbackSampler;
use crate::rate_limiter::RateLimiter;
use crate::rule_cache::RuleCache;
use crate::sampling_targets::SamplingStatisticsDocument;
use crate::Error;

const DEFAULT_SAMPLING_PROXY_ENDPOINT: &str = "http://127.0.0.1:2000";
const DEFAULT_RULES_POLLING_INTERVAL: Duration = Duration::from_secs(300);
const DEFAULT_TARGETS_POLLING_INTERVAL: Duration = Duration::from_secs(10);

/// Span attribute carrying the name of the rule that made the decision.
const XRAY_SAMPLING_RULE_ATTRIBUTE: &str = "aws.xray.sampling_rule";
/// Span attribute flagging that adaptive sampling is configured.
const XRAY_ADAPTIVE_SAMPLING_CONFIGURED_ATTRIBUTE: &str = "aws.xray.adaptive_sampling.configured";
/// Trace-state key carrying the digest of the rule that made the decision,
/// so downstream systems can correlate a span back to the rule.
const XRAY_SAMPLING_RULE_TRACE_STATE_KEY: &str = "xrsr";

/// Everything the pollers and the hot path share.
#[derive(Debug)]
struct SamplerState {
    resource: Resource,
    clock: Arc<dyn Clock>,
    client_id: String,
    client: XraySamplingClient,
    rule_cache: RuleCache,
    fallback: FallbackSampler,
    adaptive_config: Option<AdaptiveSamplingConfig>,
    anomaly_reservoir: Option<RateLimiter>,
    /// False until the first successful rules poll; every decision falls
    /// back until then.
    initialized: AtomicBool,
    /// Newest rule-modification timestamp observed on a targets response.
    last_rule_modification: Mutex<f64>,
}

impl SamplerState {
    fn refresh_rules(&self) {
        let rules = self.client.get_sampling_rules();
        if rules.is_empty() {
            // Transport failures already produced an empty list; either way
            // the previous rule set (or the fallback) stays in effect.
            otel_warn!(name: "XrayRemoteSampler.Rules.NoUsableRules");
            return;
        }
        let count = rules.len() as u64;
        self.rule_cache.update_rules(rules);
        self.initialized.store(true, Ordering::Release);
        otel_debug!(name: "XrayRemoteSampler.Rules.Updated", count = count);
    }

    fn poll_targets(&self) {
        let appliers = self.rule_cache.appliers();
        if appliers.is_empty() {
            return;
        }

        let timestamp = epoch_secs(self.clock.now());
        let statistics: Vec<SamplingStatisticsDocument> = appliers
            .iter()
            .map(|applier| {
                let snapshot = applier.get_then_reset_statistics();
                SamplingStatisticsDocument {
                    client_id: self.client_id.clone(),
                    rule_name: applier.rule_name().to_string(),
                    timestamp,
                    request_count: snapshot.request_count,
                    borrow_count: snapshot.borrow_count,
                    sample_count: snapshot.sample_count,
                }
            })
            .collect();

        let response = self.client.get_sampling_targets(statistics);
        for unprocessed in &response.unprocessed_statistics {
            otel_warn!(
                name: "XrayRemoteSampler.Targets.UnprocessedStatistics",
                rule = unprocessed.rule_name.as_str(),
                error_code = unprocessed.error_code.as_str(),
                message = unprocessed.message.as_str()
            );
        }
        self.rule_cache.update_targets(&response.sampling_target_documents);

        // Rules changed on the service since the rules poller last ran;
        // refresh out of band instead of waiting for its next tick.
        let last_modification = response.last_rule_modification;
        if last_modification > 0.0 {
            let newer = {
                let mut seen = self.last_rule_modification.lock().unwrap();
                let newer = last_modification > *seen;
                if newer {
                    *seen = last_modification;
                }
                newer
            };
            if newer {
                otel_debug!(name: "XrayRemoteSampler.Rules.ModifiedRefreshing");
                self.refresh_rules();
            }
        }
    }

    fn decide(
        &self,
        parent_context: Option<&Context>,
        trace_id: TraceId,
        name: &str,
        span_kind: &SpanKind,
        attributes: &[KeyValue],
        links: &[Link],
    ) -> SamplingResult {
        if !self.initialized.load(Ordering::Acquire) || self.rule_cache.expired() {
            return self
                .fallback
                .should_sample(parent_context, trace_id, name, span_kind, attributes, links);
        }

        match self.rule_cache.find(&self.resource, attributes) {
            Some(applier) => {
                let mut result = applier
                    .should_sample(parent_context, trace_id, name, span_kind, attributes, links);
                result.attributes.push(KeyValue::new(
                    XRAY_SAMPLING_RULE_ATTRIBUTE,
                    applier.rule_name().to_string(),
                ));
                result.attributes.push(KeyValue::new(
                    XRAY_ADAPTIVE_SAMPLING_CONFIGURED_ATTRIBUTE,
                    self.adaptive_config.is_some(),
                ));
                if result
                    .trace_state
                    .get(XRAY_SAMPLING_RULE_TRACE_STATE_KEY)
                    .is_none()
                {
                    if let Ok(trace_state) = result
                        .trace_state
                        .insert(XRAY_SAMPLING_RULE_TRACE_STATE_KEY, applier.digest().to_string())
                    {
                        result.trace_state = trace_state;
                    }
                }
                result
            }
            None => self
                .fallback
                .should_sample(parent_context, trace_id, name, span_kind, attributes, links),
        }
    }
}

#[derive(Debug)]
struct Pollers {
    rules_sender: SyncSender<()>,
    targets_sender: SyncSender<()>,
    rules_handle: Mutex<Option<JoinHandle<()>>>,
    targets_handle: Mutex<Option<JoinHandle<()>>>,
    is_shutdown: AtomicBool,
}

impl Drop for Pollers {
    fn drop(&mut self) {
        // Best effort; the threads also exit when the channels disconnect.
        let _ = self.rules_sender.try_send(());
        let _ = self.targets_sender.try_send(());
    }
}

fn spawn_poller<F>(
    name: &str,
    first_delay: Duration,
    interval: Duration,
    receiver: Receiver<()>,
    tick: F,
) -> Result<JoinHandle<()>, Error>
where
    F: Fn() + Send + 'static,
{
    thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            let mut wait = first_delay;
            loop {
                match receiver.recv_timeout(wait) {
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    Err(RecvTimeoutError::Timeout) => tick(),
                }
                wait = interval;
            }
        })
        .map_err(Error::PollerSpawn)
}

fn generate_client_id() -> String {
    use std::fmt::Write;

    let bytes: [u8; 12] = rand::random();
    bytes.iter().fold(String::with_capacity(24), |mut id, byte| {
        let _ = write!(id, "{byte:02x}");
        id
    })
}

/// Sampler that fetches its configuration from the AWS X-Ray sampling
/// service and tunes itself from the service's quota grants.
///
/// Two background threads poll the service: one for the rule set (every five
/// minutes by default) and one reporting statistics and receiving reservoir
/// quotas (every ten seconds by default). The hot-path decision only reads
/// the current rule snapshot and spends rate-limiter tokens; it never blocks
/// on I/O and never fails.
///
/// Dropping the last clone stops the pollers on a best-effort basis; call
/// [`shutdown`](AwsXRayRemoteSampler::shutdown) to stop them deterministically.
#[derive(Clone, Debug)]
pub struct AwsXRayRemoteSampler {
    state: Arc<SamplerState>,
    pollers: Arc<Pollers>,
}

impl AwsXRayRemoteSampler {
    /// Starts building a sampler for spans produced under `resource`.
    pub fn builder(resource: Resource) -> AwsXRayRemoteSamplerBuilder {
        AwsXRayRemoteSamplerBuilder {
            resource,
            endpoint: DEFAULT_SAMPLING_PROXY_ENDPOINT.to_string(),
            rules_polling_interval: DEFAULT_RULES_POLLING_INTERVAL,
            targets_polling_interval: DEFAULT_TARGETS_POLLING_INTERVAL,
            adaptive_sampling_config: None,
            http_client: None,
            clock: Arc::new(SystemClock),
        }
    }

    /// Whether an adaptive sampling configuration was provided.
    pub fn has_adaptive_sampling_config(&self) -> bool {
        self.state.adaptive_config.is_some()
    }

    /// Whether a span observation matches any configured anomaly condition,
    /// regardless of usage gating.
    pub fn is_anomaly_span(
        &self,
        error_code: Option<&str>,
        operation: Option<&str>,
        latency_ms: Option<u64>,
    ) -> bool {
        self.state
            .adaptive_config
            .as_ref()
            .is_some_and(|config| config.is_anomaly(error_code, operation, latency_ms))
    }

    /// Whether a finished span should be force-kept as an anomaly trace.
    ///
    /// Error codes, final status and latency are only known once a span
    /// ends, so this runs in the host's span processors rather than on the
    /// sampling hot path; a positive answer upgrades the span's export
    /// decision. Captures are bounded by the configured
    /// `anomaly_traces_per_second`, and each evaluation feeds the matched
    /// rule's anomaly statistics.
    pub fn should_capture_anomaly_trace(
        &self,
        attributes: &[KeyValue],
        error_code: Option<&str>,
        operation: Option<&str>,
        latency_ms: Option<u64>,
    ) -> bool {
        let config = match &self.state.adaptive_config {
            Some(config) => config,
            None => return false,
        };
        let usage = config.anomaly_usage(error_code, operation, latency_ms);
        if !usage.capture {
            return false;
        }
        let captured = match &self.state.anomaly_reservoir {
            Some(reservoir) => reservoir.try_spend(1.0, false),
            None => true,
        };
        if let Some(applier) = self.state.rule_cache.find(&self.state.resource, attributes) {
            applier.record_anomaly(captured);
        }
        captured
    }

    /// Stops both pollers and waits for them to finish. An in-flight HTTP
    /// call is allowed to run into its own bounded timeout.
    pub fn shutdown(&self) {
        if self.pollers.is_shutdown.swap(true, Ordering::Relaxed) {
            return;
        }
        let _ = self.pollers.rules_sender.try_send(());
        let _ = self.pollers.targets_sender.try_send(());
        if let Some(handle) = self.pollers.rules_handle.lock().unwrap().take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.pollers.targets_handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl ShouldSample for AwsXRayRemoteSampler {
    fn should_sample(
        &self,
        parent_context: Option<&Context>,
        trace_id: TraceId,
        name: &str,
        span_kind: &SpanKind,
        attributes: &[KeyValue],
        links: &[Link],
    ) -> SamplingResult {
        self.state
            .decide(parent_context, trace_id, name, span_kind, attributes, links)
    }
}

/// Builder for [`AwsXRayRemoteSampler`].
#[derive(Debug)]
pub struct AwsXRayRemoteSamplerBuilder {
    resource: Resource,
    endpoint: String,
    rules_polling_interval: Duration,
    targets_polling_interval: Duration,
    adaptive_sampling_config: Option<AdaptiveSamplingConfig>,
    http_client: Option<Arc<dyn HttpClient>>,
    clock: Arc<dyn Clock>,
}

impl AwsXRayRemoteSamplerBuilder {
    /// Base URL of the sampling service or proxy
    /// (default `http://127.0.0.1:2000`).
    pub fn with_endpoint<T: Into<String>>(mut self, endpoint: T) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// Interval between rule-set polls (default 300s).
    pub fn with_polling_interval(mut self, interval: Duration) -> Self {
        self.rules_polling_interval = interval;
        self
    }

    /// Interval between statistics reports / target polls (default 10s).
    pub fn with_targets_polling_interval(mut self, interval: Duration) -> Self {
        self.targets_polling_interval = interval;
        self
    }

    /// Enables anomaly detection with the given configuration.
    pub fn with_adaptive_sampling_config(mut self, config: AdaptiveSamplingConfig) -> Self {
        self.adaptive_sampling_config = Some(config);
        self
    }

    /// Polls through the given client instead of the built-in blocking
    /// client. The client should enforce its own request timeout.
    pub fn with_http_client<C: HttpClient + 'static>(mut self, client: C) -> Self {
        self.http_client = Some(Arc::new(client));
        self
    }

    #[cfg(test)]
    pub(crate) fn with_shared_http_client(mut self, client: Arc<dyn HttpClient>) -> Self {
        self.http_client = Some(client);
        self
    }

    /// Validates the configuration, starts both pollers and returns the
    /// sampler.
    pub fn build(self) -> Result<AwsXRayRemoteSampler, Error> {
        let http_client: Arc<dyn HttpClient> = match self.http_client {
            Some(client) => client,
            None => Arc::new(
                reqwest::blocking::Client::builder()
                    .timeout(HTTP_TIMEOUT)
                    .build()
                    .map_err(|err| Error::HttpClient(Box::new(err)))?,
            ),
        };
        let client = XraySamplingClient::new(&self.endpoint, http_client)?;

        let anomaly_reservoir = self
            .adaptive_sampling_config
            .as_ref()
            .and_then(|config| config.anomaly_capture_limit())
            .map(|limit| {
                RateLimiter::new(
                    1,
                    f64::from(limit.anomaly_traces_per_second),
                    self.clock.clone(),
                )
            });

        let state = Arc::new(SamplerState {
            resource: self.resource,
            clock: self.clock.clone(),
            client_id: generate_client_id(),
            client,
            rule_cache: RuleCache::new(self.clock.clone()),
            fallback: FallbackSampler::new(self.clock.clone()),
            adaptive_config: self.adaptive_sampling_config,
            anomaly_reservoir,
            initialized: AtomicBool::new(false),
            last_rule_modification: Mutex::new(0.0),
        });

        let (rules_sender, rules_receiver) = sync_channel(1);
        let rules_state = state.clone();
        let rules_handle = spawn_poller(
            "XraySamplerRulesPoller",
            Duration::ZERO,
            self.rules_polling_interval,
            rules_receiver,
            move || rules_state.refresh_rules(),
        )?;

        let (targets_sender, targets_receiver) = sync_channel(1);
        let targets_state = state.clone();
        let targets_handle = spawn_poller(
            "XraySamplerTargetsPoller",
            self.targets_polling_interval,
            self.targets_polling_interval,
            targets_receiver,
            move || targets_state.poll_targets(),
        )?;

        Ok(AwsXRayRemoteSampler {
            state,
            pollers: Arc::new(Pollers {
                rules_sender,
                targets_sender,
                rules_handle: Mutex::new(Some(rules_handle)),
                targets_handle: Mutex::new(Some(targets_handle)),
                is_shutdown: AtomicBool::new(false),
            }),
        })
    }
}
