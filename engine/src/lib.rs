//! Build orchestration engine
//!
//! Runs the build commands of a set of front-end projects concurrently,
//! stages their output into a shared tree and keeps a SQLite history of
//! every run.

pub mod config;
pub mod deps;
pub mod journal;
pub mod ledger;
pub mod process;
pub mod stage;
pub mod workflow;

pub use config::{ConfigError, EngineConfig};
pub use ledger::{Ledger, LedgerError, LedgerReader};
pub use process::{LineSink, OutputLine, OutputStream};
pub use workflow::{BuildEngine, WorkflowError, WorkflowPhase};
