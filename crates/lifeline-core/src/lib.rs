//! # lifeline-core
//!
//! Foundation types shared by every Lifeline crate:
//!
//! - **Branded IDs**: [`ConnectionId`], [`UserId`], [`IdentityKey`] as newtypes
//! - **Errors**: [`TransportError`], [`EngineError`], [`ReportError`] via `thiserror`
//! - **Classification**: [`ErrorClassification`] and [`ErrorSeverity`] for failure reporting
//! - **Backoff**: pure exponential backoff math in [`backoff`]

#![deny(unsafe_code)]

pub mod backoff;
pub mod errors;
pub mod ids;

pub use backoff::{BackoffPolicy, calculate_backoff_delay, calculate_backoff_delay_with_random};
pub use errors::{
    EngineError, ErrorClassification, ErrorSeverity, ReportError, Result, TransportError,
};
pub use ids::{ConnectionId, IdentityKey, UserId};
