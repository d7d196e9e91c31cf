//! Lathe Core
//!
//! Core types shared by the Lathe pipeline compiler and execution engine.
//!
//! This crate contains:
//! - Pipeline AST: the typed document produced by the DSL parser
//! - Workflow types: lifecycle state and accumulated stage results
//! - Log types: step output records correlated to a workflow execution

pub mod domain;

pub use domain::log::{LogEntry, LogLevel};
pub use domain::pipeline::{Agent, Param, Pipeline, Stage, Step, StepParams};
pub use domain::workflow::{ExecutionReport, StageFailure, StageOutput, StageResults, WorkflowState};
