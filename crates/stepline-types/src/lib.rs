//! Shared domain types for Stepline.
//!
//! This crate contains the core domain types used across the Stepline
//! workflow engine: Step, Workflow, WorkflowTemplate, engine events, and
//! configuration.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono.

pub mod config;
pub mod event;
pub mod workflow;
