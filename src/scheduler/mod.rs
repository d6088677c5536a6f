// src/scheduler/mod.rs - Cooperative time base for the motion task
pub mod completion;
pub mod reactor;

pub use completion::{Completion, CompletionHandle, TriggerState, completion};
pub use reactor::{NEVER, NOW, Reactor, TokioReactor};
