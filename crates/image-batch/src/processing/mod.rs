//! Job bookkeeping, task scheduling and result packaging

mod packager;
mod registry;
mod scheduler;

pub use packager::{archive_entries, ArchiveEntry, Packager};
pub use registry::{DispatchTicket, JobRegistry, RegistryStats, UpdateOutcome};
pub use scheduler::{Scheduler, SchedulerStats};
