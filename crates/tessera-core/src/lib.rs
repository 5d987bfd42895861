//! # Tessera Core
//!
//! Runtime building blocks shared by the Tessera texture streaming crates.
//!
//! - **Arena**: Owning container addressed by generation-checked handles
//! - **Time**: Clock abstraction with monotonic and manual sources
//! - **Timer**: Single-sample phase timers and scoped tracing timers

pub mod arena;
pub mod time;
pub mod timer;

pub use arena::{Arena, Handle};
pub use time::{Clock, ManualClock, MonotonicClock};
pub use timer::{PhaseTimer, ScopedTimer};
