//! # ecglink-cli
//!
//! Console front end for ecglink.
//!
//! This library provides the subcommands, console rendering, logging setup
//! and the simulated sensor used by `--simulate`.

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

pub mod commands;
pub mod logging;
pub mod output;
pub mod simulator;
