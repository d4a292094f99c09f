//! classbell-cron: class announcement scheduling and delivery.
//!
//! Recurrence rules are expanded into concrete [`Occurrence`]s, persisted in
//! the [`store::OccurrenceStore`], timed by the in-memory
//! [`scheduler::Scheduler`] and delivered by the
//! [`delivery::DeliveryExecutor`]. The store is the source of truth; on start
//! [`recovery::RecoveryCoordinator`] rebuilds the scheduler from it.
//!
//! [`Occurrence`]: classbell_types::Occurrence

pub mod attendance;
pub mod backup;
pub mod bulk_edit;
pub mod db;
pub mod delivery;
pub mod recovery;
pub mod recurrence;
pub mod scheduler;
pub mod service;
pub mod store;
pub mod summary;

#[cfg(test)]
pub(crate) mod testing;

pub use db::{Database, StoreError};
pub use delivery::{
    AnnouncementRenderer, AnnouncementRequest, ChatTransport, DeliveryExecutor, DeliveryOutcome,
    DeliveryPolicy, InlineAction, MessageHandle, SendError, SendRequest, TextFormat,
};
pub use recurrence::RecurrenceSpec;
pub use scheduler::Scheduler;
pub use service::ScheduleService;
pub use store::OccurrenceStore;
