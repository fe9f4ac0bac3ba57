//! CLI command implementations.

pub mod demo;
pub mod init;
pub mod status;
pub mod worker;
