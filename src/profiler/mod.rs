pub mod memory;
pub mod time;

pub use memory::{MemoryProfiler, MemoryProfilerEvent};
pub use time::{LayerTimeProfile, LockedTimeProfiler, TimeProfiler, UnlockedTimeProfiler};
