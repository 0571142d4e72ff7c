//! Domain models and strongly-typed identifiers.
//!
//! Defines events, subscriptions, endpoints, and delivery records along with
//! newtype ID wrappers for compile-time type safety. Includes database
//! serialization impls and the enums that drive the delivery lifecycle.

use std::{collections::HashMap, fmt, time::Duration};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

type PgDb = sqlx::Postgres;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult =
    Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>>;
type BoxDynError = sqlx::error::BoxDynError;

/// Strongly-typed project identifier.
///
/// Every resource in the system is scoped to a project, which is the unit of
/// tenant isolation. Configuration (retry policy, secure-endpoint
/// enforcement, rate limits) also hangs off the project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProjectId(pub Uuid);

impl ProjectId {
    /// Creates a new random project ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ProjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for ProjectId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl sqlx::Type<PgDb> for ProjectId {
    fn type_info() -> PgTypeInfo {
        <Uuid as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for ProjectId {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        Ok(Self(<Uuid as sqlx::Decode<PgDb>>::decode(value)?))
    }
}

impl sqlx::Encode<'_, PgDb> for ProjectId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Strongly-typed event identifier.
///
/// Events are immutable once created; this ID follows them through fanout
/// and every resulting delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub Uuid);

impl EventId {
    /// Creates a new random event ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for EventId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl sqlx::Type<PgDb> for EventId {
    fn type_info() -> PgTypeInfo {
        <Uuid as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for EventId {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        Ok(Self(<Uuid as sqlx::Decode<PgDb>>::decode(value)?))
    }
}

impl sqlx::Encode<'_, PgDb> for EventId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Strongly-typed endpoint identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointId(pub Uuid);

impl EndpointId {
    /// Creates a new random endpoint ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EndpointId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for EndpointId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl sqlx::Type<PgDb> for EndpointId {
    fn type_info() -> PgTypeInfo {
        <Uuid as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for EndpointId {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        Ok(Self(<Uuid as sqlx::Decode<PgDb>>::decode(value)?))
    }
}

impl sqlx::Encode<'_, PgDb> for EndpointId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Strongly-typed subscription identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(pub Uuid);

impl SubscriptionId {
    /// Creates a new random subscription ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for SubscriptionId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl sqlx::Type<PgDb> for SubscriptionId {
    fn type_info() -> PgTypeInfo {
        <Uuid as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for SubscriptionId {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        Ok(Self(<Uuid as sqlx::Decode<PgDb>>::decode(value)?))
    }
}

impl sqlx::Encode<'_, PgDb> for SubscriptionId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Strongly-typed delivery identifier.
///
/// One delivery record exists per (event, endpoint) pair produced by fanout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeliveryId(pub Uuid);

impl DeliveryId {
    /// Creates a new random delivery ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for DeliveryId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DeliveryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for DeliveryId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl sqlx::Type<PgDb> for DeliveryId {
    fn type_info() -> PgTypeInfo {
        <Uuid as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for DeliveryId {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        Ok(Self(<Uuid as sqlx::Decode<PgDb>>::decode(value)?))
    }
}

impl sqlx::Encode<'_, PgDb> for DeliveryId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// An inbound event submitted by a tenant.
///
/// Immutable once created. The event type may be any string; the literal
/// `*` is reserved for subscription filters that match everything.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Event {
    /// Unique identifier for this event.
    pub id: EventId,

    /// Project that owns this event.
    pub project_id: ProjectId,

    /// Event type used for subscription filter matching.
    pub event_type: String,

    /// Custom headers supplied with the event, forwarded on dispatch.
    pub headers: sqlx::types::Json<HashMap<String, String>>,

    /// Raw event payload.
    pub payload: Vec<u8>,

    /// When the event was created.
    pub created_at: DateTime<Utc>,
}

impl Event {
    /// Headers as a plain map.
    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers.0
    }

    /// Payload as `Bytes` for cheap cloning into dispatch requests.
    pub fn payload_bytes(&self) -> Bytes {
        Bytes::from(self.payload.clone())
    }
}

/// A signing secret attached to an endpoint.
///
/// Endpoints carry one or more secrets so that rotation can keep the old
/// secret valid for an overlap window while receivers pick up the new one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Secret {
    /// Secret material used for HMAC signing.
    pub value: String,

    /// When this secret was created.
    pub created_at: DateTime<Utc>,

    /// When this secret stops validating. `None` means indefinitely valid.
    pub expires_at: Option<DateTime<Utc>>,
}

impl Secret {
    /// Creates a non-expiring secret.
    pub fn new(value: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self { value: value.into(), created_at, expires_at: None }
    }

    /// Whether this secret is valid at the given instant.
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_none_or(|expiry| expiry > now)
    }
}

/// Endpoint health status.
///
/// Transitions are owned by the health state machine in the delivery crate:
///
/// ```text
/// Active -> Inactive   (retry budget exhausted, or operator toggle)
/// Inactive -> Active   (operator toggle)
/// Inactive -> Pending  (resend scheduled a re-activation probe)
/// Pending -> Active    (probe delivery succeeded)
/// Pending -> Inactive  (probe delivery failed)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointStatus {
    /// Healthy, receiving deliveries.
    Active,

    /// Circuit-broken or operator-disabled; deliveries are not attempted.
    Inactive,

    /// A single re-activation probe is outstanding.
    Pending,
}

impl fmt::Display for EndpointStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Inactive => write!(f, "inactive"),
            Self::Pending => write!(f, "pending"),
        }
    }
}

impl sqlx::Type<PgDb> for EndpointStatus {
    fn type_info() -> PgTypeInfo {
        <str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for EndpointStatus {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        match s {
            "active" => Ok(Self::Active),
            "inactive" => Ok(Self::Inactive),
            "pending" => Ok(Self::Pending),
            _ => Err(format!("invalid endpoint status: {s}").into()),
        }
    }
}

impl sqlx::Encode<'_, PgDb> for EndpointStatus {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <String as sqlx::Encode<PgDb>>::encode_by_ref(&self.to_string(), buf)
    }
}

/// An HTTP destination that receives signed callbacks.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Endpoint {
    /// Unique identifier for this endpoint.
    pub id: EndpointId,

    /// Project that owns this endpoint.
    pub project_id: ProjectId,

    /// Target URL for deliveries. `https` may be enforced per project.
    pub url: String,

    /// Tenant-supplied grouping tag used by owner fanout.
    pub owner_id: Option<String>,

    /// Rotating signing secrets. At least one must always be valid.
    pub secrets: sqlx::types::Json<Vec<Secret>>,

    /// Current health status.
    pub status: EndpointStatus,

    /// Per-endpoint rate limit, overriding the project default.
    pub rate_limit: Option<sqlx::types::Json<RateLimitConfig>>,

    /// Hard per-attempt dispatch timeout in seconds.
    pub timeout_secs: i32,

    /// Whether to emit versioned (advanced) signature headers.
    pub advanced_signatures: bool,

    /// Signature header name override; the project default applies if unset.
    pub signature_header: Option<String>,

    /// When this endpoint was created.
    pub created_at: DateTime<Utc>,

    /// When configuration was last modified.
    pub updated_at: DateTime<Utc>,
}

impl Endpoint {
    /// Secrets valid at the given instant, newest first.
    pub fn valid_secrets(&self, now: DateTime<Utc>) -> Vec<&Secret> {
        let mut secrets: Vec<&Secret> =
            self.secrets.0.iter().filter(|s| s.is_valid(now)).collect();
        secrets.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        secrets
    }

    /// Rotates in a new signing secret.
    ///
    /// The current secrets are marked to expire after `overlap`, keeping
    /// them valid long enough for in-flight deliveries signed with the old
    /// secret to be accepted. The new secret is appended non-expiring.
    pub fn rotate_secret(
        &mut self,
        value: impl Into<String>,
        overlap: Duration,
        now: DateTime<Utc>,
    ) {
        let expiry = now + chrono::Duration::from_std(overlap).unwrap_or_else(|_| chrono::Duration::zero());
        for secret in &mut self.secrets.0 {
            if secret.expires_at.is_none() {
                secret.expires_at = Some(expiry);
            }
        }
        self.secrets.0.push(Secret::new(value, now));
    }

    /// Per-attempt timeout as a `Duration`.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(u64::try_from(self.timeout_secs).unwrap_or(30))
    }
}

/// Delivery semantics for a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// Retry on failure until success or budget exhaustion.
    AtLeastOnce,

    /// Exactly one attempt; terminal regardless of outcome.
    AtMostOnce,
}

impl fmt::Display for DeliveryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AtLeastOnce => write!(f, "at_least_once"),
            Self::AtMostOnce => write!(f, "at_most_once"),
        }
    }
}

impl sqlx::Type<PgDb> for DeliveryMode {
    fn type_info() -> PgTypeInfo {
        <str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for DeliveryMode {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        match s {
            "at_least_once" => Ok(Self::AtLeastOnce),
            "at_most_once" => Ok(Self::AtMostOnce),
            _ => Err(format!("invalid delivery mode: {s}").into()),
        }
    }
}

impl sqlx::Encode<'_, PgDb> for DeliveryMode {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <String as sqlx::Encode<PgDb>>::encode_by_ref(&self.to_string(), buf)
    }
}

/// Backoff strategy for retry scheduling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    /// Fixed interval between attempts.
    Linear,

    /// Interval doubles each attempt from the base duration.
    Exponential,
}

impl fmt::Display for RetryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Linear => write!(f, "linear"),
            Self::Exponential => write!(f, "exponential"),
        }
    }
}

impl sqlx::Type<PgDb> for RetryStrategy {
    fn type_info() -> PgTypeInfo {
        <str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for RetryStrategy {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        match s {
            "linear" => Ok(Self::Linear),
            "exponential" => Ok(Self::Exponential),
            _ => Err(format!("invalid retry strategy: {s}").into()),
        }
    }
}

impl sqlx::Encode<'_, PgDb> for RetryStrategy {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <String as sqlx::Encode<PgDb>>::encode_by_ref(&self.to_string(), buf)
    }
}

/// Retry configuration carried per project or per subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Backoff strategy.
    pub strategy: RetryStrategy,

    /// Base interval between attempts.
    pub duration: Duration,

    /// Number of retries after the initial attempt.
    pub retry_count: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            strategy: RetryStrategy::Exponential,
            duration: Duration::from_secs(1),
            retry_count: 10,
        }
    }
}

/// Token-bucket rate limit settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Number of dispatches allowed per window.
    pub count: u32,

    /// Window length.
    pub duration: Duration,
}

impl RateLimitConfig {
    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), crate::error::CoreError> {
        if self.count == 0 {
            return Err(crate::error::CoreError::Validation(
                "rate limit count must be greater than zero".into(),
            ));
        }
        if self.duration.is_zero() {
            return Err(crate::error::CoreError::Validation(
                "rate limit duration must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// Tenant-supplied payload transform reference.
///
/// Script bodies execute inside the sandboxed transformer capability in the
/// delivery crate; this type only records what was configured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransformConfig {
    /// No transform; payload is dispatched verbatim.
    #[default]
    None,

    /// Named transform function executed in the sandbox.
    Script {
        /// Identifier of the registered transform function.
        function: String,
    },
}

/// A tenant-configured binding from a filter + endpoint to event traffic.
///
/// Subscriptions hold foreign-key identifiers only; the resolved endpoint is
/// joined at read time into a transient view, never stored here.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Subscription {
    /// Unique identifier for this subscription.
    pub id: SubscriptionId,

    /// Project that owns this subscription.
    pub project_id: ProjectId,

    /// Optional upstream source reference.
    pub source_id: Option<String>,

    /// Target endpoint (identifier only).
    pub endpoint_id: EndpointId,

    /// Filter configuration evaluated during broadcast fanout.
    pub filter: sqlx::types::Json<FilterConfig>,

    /// Delivery semantics.
    pub delivery_mode: DeliveryMode,

    /// Per-subscription retry override; the project default applies if unset.
    pub retry: Option<sqlx::types::Json<RetryConfig>>,

    /// Per-subscription rate limit override.
    pub rate_limit: Option<sqlx::types::Json<RateLimitConfig>>,

    /// Payload transform reference.
    pub transform: sqlx::types::Json<TransformConfig>,

    /// When this subscription was created.
    pub created_at: DateTime<Utc>,

    /// When this subscription was last modified.
    pub updated_at: DateTime<Utc>,
}

/// Subscription filter configuration.
///
/// An empty or absent event-type set is treated as `["*"]` so that broadcast
/// events reach the subscriber unless explicitly filtered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct FilterConfig {
    /// Event types this subscription accepts; `*` matches everything.
    #[serde(default)]
    pub event_types: Vec<String>,

    /// Structural predicate over the event payload. Empty object matches.
    #[serde(default = "empty_object")]
    pub body: serde_json::Value,

    /// Structural predicate over the event headers. Empty object matches.
    #[serde(default = "empty_object")]
    pub headers: serde_json::Value,
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

impl FilterConfig {
    /// Filter that accepts every event.
    pub fn match_all() -> Self {
        Self { event_types: vec!["*".to_string()], body: empty_object(), headers: empty_object() }
    }

    /// The effective event-type set, never empty.
    pub fn event_types(&self) -> Vec<&str> {
        if self.event_types.is_empty() {
            vec!["*"]
        } else {
            self.event_types.iter().map(String::as_str).collect()
        }
    }

    /// Validates predicate well-formedness at subscription-creation time.
    ///
    /// Predicates must be JSON objects (or null, treated as empty). A
    /// malformed filter is rejected here so it can never reach the
    /// evaluator.
    pub fn validate(&self) -> Result<(), crate::error::CoreError> {
        for (name, predicate) in [("body", &self.body), ("headers", &self.headers)] {
            if !(predicate.is_object() || predicate.is_null()) {
                return Err(crate::error::CoreError::Validation(format!(
                    "filter {name} predicate must be a JSON object"
                )));
            }
        }
        Ok(())
    }
}

/// Delivery lifecycle status.
///
/// ```text
/// Scheduled -> Processing -> Success
///                        |-> Retry -> Processing ...
///                        |-> Failure
/// Scheduled | Retry -> Discarded   (cancellation)
/// Failure -> Scheduled             (resend)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Queued and waiting for a worker.
    Scheduled,

    /// A worker owns this delivery and is attempting dispatch.
    Processing,

    /// Terminal: the endpoint acknowledged the callback.
    Success,

    /// A retry is scheduled for `next_attempt_at`.
    Retry,

    /// Terminal: retry budget exhausted or non-retryable outcome.
    Failure,

    /// Terminal: cancelled before dispatch (e.g. endpoint deleted).
    Discarded,
}

impl DeliveryStatus {
    /// Whether this status is terminal. Terminal deliveries are retained for
    /// audit, never deleted.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failure | Self::Discarded)
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scheduled => write!(f, "scheduled"),
            Self::Processing => write!(f, "processing"),
            Self::Success => write!(f, "success"),
            Self::Retry => write!(f, "retry"),
            Self::Failure => write!(f, "failure"),
            Self::Discarded => write!(f, "discarded"),
        }
    }
}

impl sqlx::Type<PgDb> for DeliveryStatus {
    fn type_info() -> PgTypeInfo {
        <str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for DeliveryStatus {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        match s {
            "scheduled" => Ok(Self::Scheduled),
            "processing" => Ok(Self::Processing),
            "success" => Ok(Self::Success),
            "retry" => Ok(Self::Retry),
            "failure" => Ok(Self::Failure),
            "discarded" => Ok(Self::Discarded),
            _ => Err(format!("invalid delivery status: {s}").into()),
        }
    }
}

impl sqlx::Encode<'_, PgDb> for DeliveryStatus {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <String as sqlx::Encode<PgDb>>::encode_by_ref(&self.to_string(), buf)
    }
}

/// Metadata from the most recent dispatch attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryResponse {
    /// HTTP status code, if the endpoint responded.
    pub status_code: Option<i32>,

    /// Round-trip latency in milliseconds.
    pub latency_ms: Option<i64>,

    /// Error description for failed attempts.
    pub error: Option<String>,
}

/// The tracked attempt lifecycle for delivering one event to one endpoint.
///
/// Created once per fanout target, mutated only by the retry engine and
/// manual operator actions, never deleted.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct EventDelivery {
    /// Unique identifier for this delivery.
    pub id: DeliveryId,

    /// Project that owns this delivery.
    pub project_id: ProjectId,

    /// Event being delivered.
    pub event_id: EventId,

    /// Destination endpoint.
    pub endpoint_id: EndpointId,

    /// Subscription that matched during fanout.
    pub subscription_id: SubscriptionId,

    /// Current lifecycle status.
    pub status: DeliveryStatus,

    /// Number of dispatch attempts made so far.
    ///
    /// Rate-limit deferrals do not count; only actual dispatches do. For
    /// at-least-once deliveries this never exceeds `retry_count + 1` before
    /// the delivery reaches Failure.
    pub attempts: i32,

    /// When the next attempt is due (retry schedule or deferral).
    pub next_attempt_at: Option<DateTime<Utc>>,

    /// Response metadata from the most recent attempt.
    pub response: sqlx::types::Json<DeliveryResponse>,

    /// Whether this delivery doubles as an endpoint re-activation probe.
    pub probe: bool,

    /// When this delivery was created.
    pub created_at: DateTime<Utc>,

    /// When this delivery was last modified.
    pub updated_at: DateTime<Utc>,
}

impl EventDelivery {
    /// Creates a Scheduled delivery for one fanout target.
    pub fn new(event: &Event, subscription: &Subscription, now: DateTime<Utc>) -> Self {
        Self {
            id: DeliveryId::new(),
            project_id: event.project_id,
            event_id: event.id,
            endpoint_id: subscription.endpoint_id,
            subscription_id: subscription.id,
            status: DeliveryStatus::Scheduled,
            attempts: 0,
            next_attempt_at: Some(now),
            response: sqlx::types::Json(DeliveryResponse::default()),
            probe: false,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Paged, filtered delivery listing criteria.
///
/// Used by batch retry and operator tooling. All filters are conjunctive;
/// empty vectors mean "unconstrained".
#[derive(Debug, Clone, Default)]
pub struct DeliveryQuery {
    /// Restrict to a project.
    pub project_id: Option<ProjectId>,

    /// Restrict to these statuses.
    pub statuses: Vec<DeliveryStatus>,

    /// Restrict to these endpoints.
    pub endpoint_ids: Vec<EndpointId>,

    /// Restrict to deliveries created at or after this instant.
    pub since: Option<DateTime<Utc>>,

    /// Restrict to deliveries created before this instant.
    pub until: Option<DateTime<Utc>>,
}
