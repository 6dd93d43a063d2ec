//! Messenger unit core.
//!
//! The cranker dispatches evaluator-produced messages back through the
//! SU and recursively follows the results; the monitor loop polls the
//! CU's scheduled feed for every monitored process and feeds the
//! cranker. Wallet loading and the request layer are external
//! collaborators.

pub mod clients;
pub mod config;
pub mod cranker;
mod error;
pub mod monitor;
pub mod store;

pub use clients::{
    ComputeClient, CrankResult, CuRouter, HttpComputeUnit, HttpSequencer, ScheduledMessage,
    SequencerSubmit, StaticRouter, SubmitAck,
};
pub use config::{ConfigError, Mode, MuConfig};
pub use cranker::{CrankReport, Cranker};
pub use error::{MuError, MuResult};
pub use monitor::{MonitorHandle, MonitorLoop};
pub use store::{FsMuStore, MemMuStore, Monitor, MuStore, ScheduledBatch, UnsentMessage};
