//! Agent-loop scheduling: loop CRUD, atomic run creation, sandbox dispatch,
//! completion callbacks, and automation chaining.

pub mod scheduler;
pub mod store;

pub use {
    scheduler::{CallbackParams, NewLoopParams, Scheduler, SchedulerConfig},
    store::{AgentLoop, AgentLoopRun, LoopStore},
};
