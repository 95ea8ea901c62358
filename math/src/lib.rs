//! Track running averages over linear and circular keyspaces.
//!
//! Locations in the keyspace are real numbers in `[0.0, 1.0)` where `1.0` wraps around to `0.0`.
//! [location] provides the arithmetic for that circle, [DecayingAverage] is a bootstrapping
//! exponentially decaying average over a bounded line, and [KeyspaceAverage] filters a
//! [DecayingAverage] so that it moves along the shortest arc of the circle.
//!
//! Both averages can be exported to (and restored from) a [FieldSet] to survive restarts.
//!
//! # Example
//!
//! ```rust
//! use blockfetch_math::{KeyspaceAverage, RunningAverage};
//!
//! let average = KeyspaceAverage::new(0.9, 10).unwrap();
//! average.report(0.9).unwrap();
//! average.report(0.2).unwrap();
//!
//! // The average moved across the 1.0/0.0 boundary instead of through 0.5.
//! let current = average.current_value();
//! assert!(current < 0.2 || current > 0.9);
//! ```

use thiserror::Error;

mod average;
pub use average::DecayingAverage;
mod field_set;
pub use field_set::FieldSet;
mod keyspace;
pub use keyspace::KeyspaceAverage;
pub mod location;

/// Errors that can occur when reporting to (or restoring) a running average.
#[derive(Debug, Error, PartialEq)]
pub enum Error {
    #[error("not a valid normalized location: {0}")]
    InvalidLocation(f64),
    #[error("not a finite value: {0}")]
    NotFinite(f64),
    #[error("integer reports are not accepted: {0}")]
    IntegerReport(i64),
    #[error("max reports must be positive")]
    InvalidMaxReports,
    #[error("invalid bounds: [{0}, {1}]")]
    InvalidBounds(f64, f64),
    #[error("missing field: {0}")]
    MissingField(&'static str),
    #[error("invalid field {0}: {1}")]
    InvalidField(&'static str, String),
    #[error("unsupported version: {0}")]
    UnsupportedVersion(u32),
    #[error("unexpected type: {0}")]
    UnexpectedType(String),
    #[error("malformed line: {0}")]
    MalformedLine(String),
    #[error("missing end marker")]
    MissingEnd,
}

/// A running average of reported values.
///
/// Implementations are internally synchronized: all methods take `&self` and calls on the same
/// instance are mutually exclusive.
pub trait RunningAverage: Send + Sync {
    /// Returns the current value of the average.
    fn current_value(&self) -> f64;

    /// Reports a new value.
    fn report(&self, d: f64) -> Result<(), Error>;

    /// Reports an integer value.
    ///
    /// By default this is equivalent to reporting the value as a float.
    fn report_integer(&self, n: i64) -> Result<(), Error> {
        self.report(n as f64)
    }

    /// Returns the value the average would have if `d` were reported, without reporting it.
    fn value_if_reported(&self, d: f64) -> Result<f64, Error>;

    /// Returns the number of reports received.
    fn count_reports(&self) -> u64;
}
