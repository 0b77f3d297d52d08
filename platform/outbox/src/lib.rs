//! # Transactional Outbox
//!
//! Guarantees that an event is durably recorded if and only if the business
//! transaction that produced it commits, then moves it to the broker out of band.
//!
//! ## Pieces
//!
//! - **Ledger** ([`record_event`]): insert an outbox row through the caller's open
//!   transaction. No network I/O happens here.
//! - **Change channel** ([`ChangeChannel`]): after commit the writer signals the new
//!   event id so the publisher wakes immediately. Purely a latency optimization.
//! - **Publisher** ([`OutboxPublisher`]): publishes PENDING rows oldest-first on
//!   notification and on a fixed sweep, marks them PUBLISHED or FAILED, and
//!   re-queues FAILED rows below the retry ceiling.
//!
//! ## Storage
//!
//! [`PgOutboxStore`] / [`PgChangeChannel`] back production services (the
//! `events_outbox` table and `LISTEN/NOTIFY`). [`InMemoryOutbox`] /
//! [`InMemoryChangeChannel`] mirror the same semantics, including rollback, for
//! tests and local development.

mod channel;
mod error;
mod ledger;
mod memory;
mod models;
mod pg;
mod publisher;

pub use channel::{notify_committed, ChangeChannel, InMemoryChangeChannel, PgChangeChannel, DEFAULT_CHANNEL};
pub use error::{ChannelError, ChannelResult, OutboxError, OutboxResult};
pub use ledger::{record_event, record_serialized_event, OutboxStore, OutboxTx};
pub use memory::{InMemoryOutbox, InMemoryOutboxTx};
pub use models::{OutboxEvent, OutboxStatus, StatusCounts};
pub use pg::PgOutboxStore;
pub use publisher::{OutboxPublisher, PublishReport, PublisherConfig, RetryReport};
