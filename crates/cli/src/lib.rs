//! Command line front end for xft.
//!
//! One invocation opens one session (key [`commands::SESSION_KEY`]), runs a
//! single command and releases the session again, also on Ctrl-C. Results
//! are printed as a JSON envelope (see [`output`]); logs go to stderr.

pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
pub mod logging;
pub mod output;
