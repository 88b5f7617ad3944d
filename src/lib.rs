#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::new_without_default,
    clippy::return_self_not_must_use
)]

pub mod app;
pub mod channels;
pub mod cli;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod guardrails;
pub mod lifecycle;
pub mod store;

pub use config::Config;
pub use error::{FleetpostError, Result};
