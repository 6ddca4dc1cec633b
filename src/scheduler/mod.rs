//! Cron scheduler, commit watch and unit supervision.

pub mod cron;
pub mod engine;
pub mod history;
pub mod profiles;
pub mod unit;
pub mod watch;

pub use self::cron::{preview, CronTrigger, PreviewItem, ScheduleEntry, ScheduledTask};
pub use self::engine::{Scheduler, SchedulerSettings};
pub use self::history::{UnitReport, UnitStatus};
pub use self::unit::{Unit, UnitKind, UnitOrigin, UnitOutput};
