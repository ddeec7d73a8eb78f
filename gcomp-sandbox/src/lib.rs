//! GComp job sandbox.
//!
//! Runs a single job module in its own process. The supervisor writes a
//! bootstrap line and then control signals to stdin; the sandbox writes job
//! events to stdout and exits with a code describing how the job ended.

#![forbid(unsafe_code)]

pub mod capabilities;
pub mod channel;
pub mod netpolicy;
pub mod runtime;

pub use capabilities::{Capabilities, Capability, PhysicsBinding};
pub use channel::{JobChannel, spawn_control_reader};
pub use runtime::{JobRuntime, LifecycleEvent, RunOutcome, SandboxError};
