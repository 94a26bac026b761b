//! Application shell: command line and logging setup.

pub mod cli;
pub mod logging;
