//! Reconciliation engine for an extension registry backed by SQLite.
//!
//! The pipeline is read -> detect -> plan -> apply: [`reader`] pulls the
//! fact rows for a code, [`detect`] derives discrepancies from them,
//! [`plan`] turns discrepancies into guarded repair operations, and
//! [`apply`] executes a plan inside one transaction with optimistic
//! concurrency checks. [`engine`] wires the stages together per code.

pub mod apply;
pub mod config;
pub mod detect;
pub mod engine;
pub mod error;
pub mod layout;
pub mod plan;
pub mod reader;
pub mod store;
