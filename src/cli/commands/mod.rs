//! Command implementations for authproxy CLI

pub mod completion;
pub mod config;
pub mod keygen;
pub mod run;
pub mod version;
