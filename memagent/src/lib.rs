pub mod abi;
pub mod config;
pub mod debugger;
pub mod files;
pub mod logging;
pub mod platform;
pub mod records;

pub use config::{AgentConfig, ServerMode};
pub use records::{ModuleRecord, Perms, ProcessRecord, RegionRecord, RegionState};
