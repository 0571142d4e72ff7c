//! Event delivery engine.
//!
//! Implements the core of the sluice gateway: subscription fanout, signed
//! HTTP dispatch, retry/backoff scheduling, endpoint health tracking, and
//! the delivery-status lifecycle with manual operator actions.
//!
//! # Architecture
//!
//! ```text
//! inbound event ──▶ FanoutResolver ──▶ EventDelivery (Scheduled) ──▶ queue
//!                        │ uses
//!                        ▼
//!                 filter evaluator
//!
//! worker pool ──claim──▶ rate limiter ──▶ transformer ──▶ DispatcherClient
//!      │                                                        │
//!      └──◀── retry engine ◀── outcome classification ◀─────────┘
//!                 │
//!                 ├── DeliveryStatus transitions (CAS)
//!                 └── endpoint health state machine (CAS)
//! ```
//!
//! All lifecycle writes are conditional updates from an expected prior
//! state: the queue may redeliver jobs and multiple workers race on the same
//! endpoint, so nothing here relies on a global lock.

pub mod dispatch;
pub mod engine;
pub mod error;
pub mod fanout;
pub mod health;
pub mod queue;
pub mod rate_limit;
pub mod retry;
pub mod status;
pub mod storage;
pub mod transform;
mod worker;
mod worker_pool;

pub use engine::{DeliveryConfig, DeliveryEngine, EngineStats};
pub use error::{DeliveryError, Result};

/// Default number of concurrent delivery workers.
pub const DEFAULT_WORKER_COUNT: usize = 4;

/// Default batch size for claiming due deliveries.
pub const DEFAULT_BATCH_SIZE: usize = 10;
