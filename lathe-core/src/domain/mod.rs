//! Core domain types
//!
//! This module contains the structures shared by the parser (which builds
//! them), the execution engine (which walks them) and the CLI (which prints them).

pub mod log;
pub mod pipeline;
pub mod workflow;
