#![allow(clippy::result_large_err)]

pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod logging;
pub mod replay;
pub mod telemetry;
pub mod transport;
