mod factory;
mod progress;
mod run;
mod schedule;

pub use factory::{ScriptedSessionFactory, SessionFactory};
pub use progress::{LiveCounters, ProgressFn, ProgressUpdate, StageProgress};
pub use run::run_load;
pub use schedule::{RampingSchedule, StageSnapshot};
