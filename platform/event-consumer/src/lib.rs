//! # Event Consumer
//!
//! Consumer-side half of reliable propagation. The broker delivers at least
//! once, so every handler may see the same logical event more than once; the
//! idempotency ledger turns that into exactly-once effects.
//!
//! - [`IdempotencyStore::try_mark_processed`]: atomic unique insert keyed by the
//!   producer-assigned event id. The insert *is* the check.
//! - [`try_mark_processed_tx`]: the same insert inside a Postgres transaction, so
//!   the marker commits or rolls back together with the business effect.
//! - [`IdempotentConsumer`]: subscribe, parse the envelope, guard, run an
//!   [`EventHandler`] with backoff, dead-letter what cannot be applied.

mod consumer;
mod dlq;
mod error;
mod idempotency;

pub use consumer::{EventHandler, GuardStrategy, HandlerError, IdempotentConsumer, ProcessOutcome};
pub use dlq::{DeadLetter, DeadLetterSink, InMemoryDeadLetterSink, PgDeadLetterSink};
pub use error::{ConsumerError, ConsumerResult};
pub use idempotency::{
    try_mark_processed_tx, IdempotencyRecord, IdempotencyStore, InMemoryIdempotencyStore,
    MarkOutcome, PgIdempotencyStore,
};
