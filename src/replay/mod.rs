pub mod catalog;
pub mod clock;
pub mod identity;
pub mod message;
pub mod scheduler;
pub mod source;

pub use catalog::{ColumnCatalog, ColumnMetadata};
pub use clock::{ReplayClock, ScheduleDecision, SystemClock, TimeSynchronizer};
pub use identity::IdentityResolver;
pub use message::{ColumnPlan, MessageAssembler};
pub use scheduler::{ReplayPhase, ReplayReport, ReplayScheduler, ReplayState};
pub use source::{ChannelRowSource, CsvRowSource, MemoryRowSource, RowSource};
