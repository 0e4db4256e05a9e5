//! Scan-coordination fabric for a synchrotron beamline.
//!
//! A client request flows guard -> queue -> assembler -> worker -> device
//! server, with the bundler and file-writer sink consuming the resulting
//! device readbacks out of band. Every component talks to every other
//! component only through the broker (`broker` module); there is no direct
//! in-process call between, say, the guard and the worker.

pub mod alarm;
pub mod broker;
pub mod client;
pub mod codec;
pub mod config;
pub mod correlator;
pub mod device;
pub mod endpoints;
pub mod error;
pub mod guard;
pub mod bundler;
pub mod pidfile;
pub mod queue;
pub mod scan;
pub mod storage;
pub mod supervisor;

pub use error::{FabricError, FabricResult};
