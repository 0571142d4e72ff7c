//! Endpoint health state machine.
//!
//! Endpoints move between Active, Inactive, and Pending along a fixed set of
//! edges. All guard logic lives in one transition function so circuit
//! breaking, operator toggles, and re-activation probes share a single
//! source of truth. [`HealthService`] applies transitions through
//! compare-and-set storage updates because concurrent delivery outcomes for
//! the same endpoint race to flip its status.
//!
//! ```text
//!            DeliveryExhausted | Toggle
//!   Active ─────────────────────────────▶ Inactive
//!     ▲  ▲                                 │   │
//!     │  └───────────── Toggle ────────────┘   │ BeginReactivation
//!     │                                        ▼
//!     └────────── ProbeSucceeded ────────── Pending
//!                                              │
//!                        ProbeFailed ──────────┴──▶ Inactive
//! ```

use std::sync::Arc;

use sluice_core::{
    error::{CoreError, Result},
    models::{EndpointId, EndpointStatus},
};
use tracing::{debug, info, warn};

use crate::storage::DeliveryStorage;

/// Actions that drive the endpoint health state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointAction {
    /// A delivery to this endpoint exhausted its retry budget in Failure.
    DeliveryExhausted,

    /// Operator toggled the endpoint (Active <-> Inactive).
    Toggle,

    /// A resend against an Inactive endpoint scheduled a re-activation
    /// probe.
    BeginReactivation,

    /// The outstanding probe delivery succeeded.
    ProbeSucceeded,

    /// The outstanding probe delivery failed.
    ProbeFailed,
}

/// Computes the next endpoint status for an action.
///
/// Rejections carry the exact operator-facing guard messages; no other
/// transition is legal.
pub fn transition(current: EndpointStatus, action: EndpointAction) -> Result<EndpointStatus> {
    use EndpointAction as A;
    use EndpointStatus as S;

    match (current, action) {
        (S::Active, A::DeliveryExhausted) => Ok(S::Inactive),
        (S::Active, A::Toggle) => Ok(S::Inactive),
        (S::Inactive, A::Toggle) => Ok(S::Active),
        (S::Pending, A::Toggle) => Err(CoreError::conflict("endpoint is in pending status")),
        (S::Inactive, A::BeginReactivation) => Ok(S::Pending),
        (S::Pending, A::BeginReactivation) => {
            Err(CoreError::conflict("endpoint is being re-activated"))
        },
        (S::Pending, A::ProbeSucceeded) => Ok(S::Active),
        (S::Pending, A::ProbeFailed) => Ok(S::Inactive),
        (current, action) => Err(CoreError::conflict(format!(
            "illegal endpoint transition: {action:?} while {current}"
        ))),
    }
}

/// Applies health transitions through conditional storage updates.
pub struct HealthService {
    storage: Arc<dyn DeliveryStorage>,
}

impl HealthService {
    /// Creates a health service over the given storage.
    pub fn new(storage: Arc<dyn DeliveryStorage>) -> Self {
        Self { storage }
    }

    /// Applies an action with CAS retry.
    ///
    /// Re-reads and re-derives the transition when a concurrent writer wins
    /// the race; gives up after a few rounds rather than spinning.
    ///
    /// # Errors
    ///
    /// Returns the transition's guard error, a not-found error for missing
    /// endpoints, or a conflict if contention persists.
    pub async fn apply(
        &self,
        endpoint_id: EndpointId,
        action: EndpointAction,
    ) -> Result<EndpointStatus> {
        const MAX_CAS_ROUNDS: usize = 4;

        for _ in 0..MAX_CAS_ROUNDS {
            let endpoint = self
                .storage
                .find_endpoint(endpoint_id)
                .await?
                .ok_or_else(|| CoreError::not_found(format!("endpoint {endpoint_id} not found")))?;

            let new = transition(endpoint.status, action)?;
            if self.storage.update_endpoint_status(endpoint_id, endpoint.status, new).await? {
                info!(
                    endpoint_id = %endpoint_id,
                    from = %endpoint.status,
                    to = %new,
                    ?action,
                    "endpoint status transition applied"
                );
                return Ok(new);
            }

            debug!(endpoint_id = %endpoint_id, ?action, "endpoint status CAS lost, retrying");
        }

        Err(CoreError::conflict(format!(
            "endpoint {endpoint_id} status contended, transition not applied"
        )))
    }

    /// Drives an endpoint toward Inactive after a delivery exhausted its
    /// retry budget.
    ///
    /// Idempotent: an endpoint that already left Active (concurrent
    /// exhaustion, operator toggle, outstanding probe) is left alone.
    pub async fn note_delivery_exhausted(&self, endpoint_id: EndpointId) {
        match self.apply(endpoint_id, EndpointAction::DeliveryExhausted).await {
            Ok(_) => {},
            Err(CoreError::Conflict(_)) => {
                debug!(endpoint_id = %endpoint_id, "endpoint already left Active, nothing to do");
            },
            Err(error) => {
                warn!(endpoint_id = %endpoint_id, error = %error, "failed to deactivate endpoint");
            },
        }
    }

    /// Resolves an outstanding probe: Pending -> Active on success,
    /// Pending -> Inactive on failure.
    ///
    /// Tolerates endpoints that already moved on; probe outcomes arriving
    /// after an operator intervened are stale by definition.
    pub async fn resolve_probe(&self, endpoint_id: EndpointId, succeeded: bool) {
        let action =
            if succeeded { EndpointAction::ProbeSucceeded } else { EndpointAction::ProbeFailed };

        match self.apply(endpoint_id, action).await {
            Ok(status) => {
                info!(endpoint_id = %endpoint_id, status = %status, "probe resolved");
            },
            Err(CoreError::Conflict(_)) => {
                debug!(endpoint_id = %endpoint_id, "stale probe outcome ignored");
            },
            Err(error) => {
                warn!(endpoint_id = %endpoint_id, error = %error, "failed to resolve probe");
            },
        }
    }

    /// Operator toggle between Active and Inactive.
    ///
    /// # Errors
    ///
    /// Rejects Pending endpoints with "endpoint is in pending status".
    pub async fn toggle(&self, endpoint_id: EndpointId) -> Result<EndpointStatus> {
        self.apply(endpoint_id, EndpointAction::Toggle).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legal_transitions_exactly_match_the_lifecycle() {
        use EndpointAction as A;
        use EndpointStatus as S;

        assert_eq!(transition(S::Active, A::DeliveryExhausted).unwrap(), S::Inactive);
        assert_eq!(transition(S::Active, A::Toggle).unwrap(), S::Inactive);
        assert_eq!(transition(S::Inactive, A::Toggle).unwrap(), S::Active);
        assert_eq!(transition(S::Inactive, A::BeginReactivation).unwrap(), S::Pending);
        assert_eq!(transition(S::Pending, A::ProbeSucceeded).unwrap(), S::Active);
        assert_eq!(transition(S::Pending, A::ProbeFailed).unwrap(), S::Inactive);
    }

    #[test]
    fn toggle_on_pending_is_rejected_with_guard_message() {
        let err = transition(EndpointStatus::Pending, EndpointAction::Toggle).unwrap_err();
        assert_eq!(err.to_string(), "endpoint is in pending status");
    }

    #[test]
    fn reactivating_a_pending_endpoint_is_rejected() {
        let err =
            transition(EndpointStatus::Pending, EndpointAction::BeginReactivation).unwrap_err();
        assert_eq!(err.to_string(), "endpoint is being re-activated");
    }

    #[test]
    fn every_other_transition_is_illegal() {
        use EndpointAction as A;
        use EndpointStatus as S;

        let illegal = [
            (S::Inactive, A::DeliveryExhausted),
            (S::Pending, A::DeliveryExhausted),
            (S::Active, A::BeginReactivation),
            (S::Active, A::ProbeSucceeded),
            (S::Inactive, A::ProbeSucceeded),
            (S::Active, A::ProbeFailed),
            (S::Inactive, A::ProbeFailed),
        ];

        for (state, action) in illegal {
            assert!(
                transition(state, action).is_err(),
                "{action:?} while {state} should be rejected"
            );
        }
    }
}
