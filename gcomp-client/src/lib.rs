//! GComp volunteer-computing client.
//!
//! The client talks to its host over a JSON line protocol on stdio, fetches
//! jobs from the job server, persists them for pause/resume and runs each
//! one in a `gcomp-sandbox` process.

#![forbid(unsafe_code)]

pub mod backoff;
pub mod fetch;
pub mod fsm;
pub mod host;
pub mod persistence;
pub mod session;
pub mod supervisor;

pub use backoff::RetryPolicy;
pub use fetch::{FetchError, JobFetcher, acquire_job};
pub use fsm::{ClientEvent, ClientState, Payload, StateHandler, StateMachine};
pub use host::{HostOutput, HostSender, spawn_host_reader, spawn_host_writer};
pub use persistence::{PauseStore, PersistError};
pub use session::{ClientSession, SessionError, SessionEvent, SessionHandle, SessionOutcome};
pub use supervisor::{JobExit, Supervisor};
