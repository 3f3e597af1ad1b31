//! Domain models for the gateway core: channels, prices, performance
//! records, and the policy structs read from `SystemSettings`.
//!
//! These are plain data + invariant-enforcing methods; the stateful engines
//! built on top of them (registry, circuit breaker, auto-disable, ...) live
//! in their own top-level modules.

pub mod channel;
pub mod perf;
pub mod price;
pub mod settings;

pub use channel::{
    Channel, ChannelMutationError, ChannelStatus, ChannelType, CloudIamCredentials, Credentials,
    DeleteDisabledKeysOutcome, DisabledApiKey, ModelMapping, OAuthCredentials,
};
pub use perf::{ChannelMetricsSnapshot, PerformanceRecord};
pub use price::{
    ChannelModelPrice, ChannelModelPriceVersion, Price, PriceAction, PriceInput,
    PriceValidationError, VersionStatus,
};
pub use settings::{
    AutoDisableChannelPolicy, ChannelProbeSetting, CircuitBreakerPolicy, InvalidProbeFrequency,
    LoadBalancerStrategy, PolicyValidationError, RetryPolicy, StatusThreshold,
    VALID_PROBE_FREQUENCIES_MINUTES,
};
