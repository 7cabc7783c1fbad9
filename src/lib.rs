#![deny(clippy::all, clippy::pedantic)]
#![allow(
    clippy::module_name_repetitions,
    clippy::cast_precision_loss,
    clippy::missing_errors_doc
)]

pub mod cli;
pub mod combine;
pub mod config;
pub mod evaluation;
pub mod labels;
pub mod observability;
pub mod runner;
