//! Sandboxed payload transformation.
//!
//! Tenant-supplied transform logic is untrusted. It runs behind a narrow
//! capability with a hard execution timeout so a runaway script can never
//! block a delivery worker indefinitely. This is a security boundary: the
//! engine only ever sees bytes in, bytes out, or a typed failure.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use sluice_core::models::{Event, TransformConfig};

use crate::error::{DeliveryError, Result};

/// Executable transform implementation.
///
/// Implementations wrap whatever sandbox executes tenant scripts; the
/// engine only depends on this capability.
#[async_trait]
pub trait PayloadTransform: Send + Sync + 'static {
    /// Transforms the payload for one delivery.
    async fn transform(&self, function: &str, event: &Event, payload: Bytes) -> Result<Bytes>;
}

/// Transformer attached to a subscription.
#[derive(Clone)]
pub enum Transformer {
    /// No transform; the payload is dispatched verbatim.
    None,

    /// Scripted transform executed in the sandbox under a timeout.
    Script(ScriptTransformer),
}

impl Transformer {
    /// Builds a transformer for a subscription's configuration.
    ///
    /// When the subscription references a script but no sandbox was
    /// registered, the transform fails closed at apply time rather than
    /// silently passing payloads through.
    pub fn for_config(
        config: &TransformConfig,
        sandbox: Option<Arc<dyn PayloadTransform>>,
        timeout: Duration,
    ) -> Self {
        match config {
            TransformConfig::None => Self::None,
            TransformConfig::Script { function } => Self::Script(ScriptTransformer {
                function: function.clone(),
                sandbox,
                timeout,
            }),
        }
    }

    /// Applies the transform to a payload.
    ///
    /// # Errors
    ///
    /// Returns a non-retryable transform error on script failure or when
    /// the execution budget is exceeded.
    pub async fn apply(&self, event: &Event, payload: Bytes) -> Result<Bytes> {
        match self {
            Self::None => Ok(payload),
            Self::Script(script) => script.apply(event, payload).await,
        }
    }
}

/// Scripted transform bounded by an execution timeout.
#[derive(Clone)]
pub struct ScriptTransformer {
    function: String,
    sandbox: Option<Arc<dyn PayloadTransform>>,
    timeout: Duration,
}

impl ScriptTransformer {
    async fn apply(&self, event: &Event, payload: Bytes) -> Result<Bytes> {
        let Some(sandbox) = &self.sandbox else {
            return Err(DeliveryError::transform(format!(
                "transform function {} configured but no sandbox registered",
                self.function
            )));
        };

        match tokio::time::timeout(
            self.timeout,
            sandbox.transform(&self.function, event, payload),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(DeliveryError::transform(format!(
                "transform function {} exceeded {:?} execution budget",
                self.function, self.timeout
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use chrono::Utc;
    use sluice_core::models::{EventId, ProjectId};

    use super::*;

    fn test_event() -> Event {
        Event {
            id: EventId::new(),
            project_id: ProjectId::new(),
            event_type: "test.event".to_string(),
            headers: sqlx::types::Json(HashMap::new()),
            payload: b"{}".to_vec(),
            created_at: Utc::now(),
        }
    }

    struct Uppercase;

    #[async_trait]
    impl PayloadTransform for Uppercase {
        async fn transform(&self, _function: &str, _event: &Event, payload: Bytes) -> Result<Bytes> {
            Ok(Bytes::from(payload.to_ascii_uppercase()))
        }
    }

    struct Stuck;

    #[async_trait]
    impl PayloadTransform for Stuck {
        async fn transform(&self, _function: &str, _event: &Event, _payload: Bytes) -> Result<Bytes> {
            // Simulates tenant code that never returns.
            futures::future::pending().await
        }
    }

    #[tokio::test]
    async fn none_passes_payload_through() {
        let transformer =
            Transformer::for_config(&TransformConfig::None, None, Duration::from_secs(1));
        let payload = Bytes::from_static(b"verbatim");

        let out = transformer.apply(&test_event(), payload.clone()).await.unwrap();
        assert_eq!(out, payload);
    }

    #[tokio::test]
    async fn script_transform_runs_inside_the_sandbox() {
        let config = TransformConfig::Script { function: "fn_upper".to_string() };
        let transformer =
            Transformer::for_config(&config, Some(Arc::new(Uppercase)), Duration::from_secs(1));

        let out = transformer.apply(&test_event(), Bytes::from_static(b"abc")).await.unwrap();
        assert_eq!(out, Bytes::from_static(b"ABC"));
    }

    #[tokio::test]
    async fn runaway_script_is_cut_off_by_the_timeout() {
        let config = TransformConfig::Script { function: "fn_stuck".to_string() };
        let transformer = Transformer::for_config(
            &config,
            Some(Arc::new(Stuck)),
            Duration::from_millis(20),
        );

        let err = transformer.apply(&test_event(), Bytes::new()).await.unwrap_err();
        assert!(matches!(err, DeliveryError::Transform { .. }));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn missing_sandbox_fails_closed() {
        let config = TransformConfig::Script { function: "fn_x".to_string() };
        let transformer = Transformer::for_config(&config, None, Duration::from_secs(1));

        let err = transformer.apply(&test_event(), Bytes::new()).await.unwrap_err();
        assert!(matches!(err, DeliveryError::Transform { .. }));
    }
}
