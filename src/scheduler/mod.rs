//! Calendar-driven reminders and session start/stop.

pub mod auto_task;
pub mod clock;
pub mod trigger_memory;

pub use auto_task::{AutoTaskScheduler, SchedulerEvent, TickSummary};
pub use clock::{Clock, ManualClock, SystemClock};
pub use trigger_memory::{EventTriggers, TriggerMemory};
