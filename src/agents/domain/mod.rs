//! Domain types shared by the agent adapter and the orchestrators

mod event;
mod process;
mod task;

pub use event::*;
pub use process::*;
pub use task::*;
