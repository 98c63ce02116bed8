//! An [AWS X-Ray] remote sampler for the OpenTelemetry SDK.
//!
//! The sampler polls sampling rules and sampling targets from the X-Ray
//! sampling service (usually reached through a local proxy such as the ADOT
//! collector or the X-Ray daemon) and applies them to every span considered
//! for emission. Rules are matched in priority order against the span
//! attributes and the SDK [`Resource`]; each rule carries a reservoir (a
//! guaranteed per-second allotment of samples) and a fixed rate applied to
//! the remainder. Sampling statistics are reported back on a short interval
//! so the service can redistribute reservoir quotas between clients.
//!
//! Before the first successful rules poll, and whenever no rule matches, a
//! local fallback sampler keeps a bounded trickle of traces flowing
//! (1 request/second plus 5% of the remainder).
//!
//! # Quick start
//! ```no_run
//! use opentelemetry_aws_xray_sampler::AwsXRayRemoteSampler;
//! use opentelemetry_sdk::{trace::SdkTracerProvider, Resource};
//!
//! let resource = Resource::builder().with_service_name("my-service").build();
//! let sampler = AwsXRayRemoteSampler::builder(resource.clone())
//!     .with_endpoint("http://127.0.0.1:2000")
//!     .build()
//!     .expect("valid sampler configuration");
//!
//! let provider = SdkTracerProvider::builder()
//!     .with_sampler(sampler)
//!     .with_resource(resource)
//!     .build();
//! ```
//!
//! [AWS X-Ray]: https://docs.aws.amazon.com/xray/latest/devguide/xray-console-sampling.html
//! [`Resource`]: opentelemetry_sdk::Resource

#![warn(missing_docs, unreachable_pub, missing_debug_implementations)]
#![cfg_attr(docsrs, feature(doc_cfg))]

use thiserror::Error;

mod adaptive_config;
mod client;
mod clock;
mod fallback_sampler;
mod matcher;
mod rate_limiter;
mod rate_limiting_sampler;
mod remote_sampler;
mod rule_applier;
mod rule_cache;
mod sampling_rule;
mod sampling_targets;

pub use adaptive_config::{
    AdaptiveSamplingConfig, AnomalyCaptureLimit, AnomalyCondition, UsageType,
};
pub use remote_sampler::{AwsXRayRemoteSampler, AwsXRayRemoteSamplerBuilder};
pub use sampling_rule::{SamplingRateBoost, SamplingRule};
pub use sampling_targets::{
    SamplingBoost, SamplingStatisticsDocument, SamplingTargetDocument, SamplingTargetsResponse,
    UnprocessedStatistics,
};

/// Errors returned when constructing the sampler or its configuration.
///
/// Polling failures are not represented here: transport and decode errors on
/// the sampling endpoints are contained inside the poller and only logged,
/// leaving the previously fetched state in effect.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The adaptive sampling configuration has an invalid shape.
    #[error("invalid adaptive sampling configuration: {0}")]
    InvalidConfiguration(String),

    /// The sampling service endpoint could not be parsed.
    #[error("invalid sampling endpoint {0:?}: {1}")]
    InvalidEndpoint(String, String),

    /// The default HTTP client could not be constructed.
    #[error("failed to build HTTP client: {0}")]
    HttpClient(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// A background poller thread could not be spawned.
    #[error("failed to spawn poller thread: {0}")]
    PollerSpawn(#[source] std::io::Error),
}
