#![deny(missing_docs)]
#![deny(missing_copy_implementations)]
#![deny(trivial_casts)]
#![deny(trivial_numeric_casts)]
#![deny(unused_import_braces)]
#![deny(unused_qualifications)]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(rustdoc::private_intra_doc_links)]

//! This crate lets a process drive machines (printers, scanners, flashers)
//! reachable over a local pipe, a TCP socket or a raw USB bulk connection,
//! all speaking JSON-RPC 2.0, with long running operations tracked as
//! [Job]s.

pub mod address;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod engine;
pub mod job;
pub mod listener;
pub mod runner;
#[cfg(test)]
mod tests;

pub use address::{Address, AddressError, TransportError};
pub use config::Config;
pub use connection::{Connection, ConnectionError};
pub use dispatch::Dispatcher;
pub use engine::{JsonRpc, MethodError, RawFeed, RawHandler, Reply, HEARTBEAT_METHOD};
pub use job::{Conclusion, Job, JobEvent, JobInfo, JobState, JobStatus};
pub use listener::Listener;
pub use runner::{execute_job, run_job, Deadline, JobError};
