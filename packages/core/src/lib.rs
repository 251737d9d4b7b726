//! Switchboard core: queue entries, cron schedules, event subscriptions and
//! relay messages, plus the next-run calculator.
//!
//! Everything here is synchronous and free of I/O. The async orchestration
//! (arbitration, dispatch, event bus, scheduled queues) lives in
//! `switchboard-runtime`.

pub mod clock;
pub mod context;
pub mod entry;
pub mod messages;
pub mod next_run;
pub mod schedule;
pub mod schema;
pub mod subscription;
pub mod types;

pub use clock::{ClockSource, ManualClock, SystemClock};
pub use context::CallContext;
pub use entry::{EntryError, EntryState, QueueEntry};
pub use messages::{EventPayload, RelayEnvelope, RelayMessage, SubscriptionPayload};
pub use next_run::{
    calculate_next_run, calculate_next_run_within, next_interval_run, DEFAULT_SEARCH_YEARS,
};
pub use schedule::{CompiledSchedule, CronError, CronSchedule, CronUnit, FieldMatcher};
pub use subscription::EventSubscription;
pub use types::{CandidateId, Payload, WorkerId};
