//! A decaying average over the circular keyspace.

use crate::{average::Decaying, location, Error, FieldSet, RunningAverage};
use std::sync::Mutex;

/// Lower bound of the unwrapped average.
///
/// Reports are at most half a circle away from a value in `[0.0, 1.0]`, so the unwrapped average
/// never leaves `[-0.5, 1.5]`.
const MIN_UNWRAPPED: f64 = -2.0;

/// Upper bound of the unwrapped average.
const MAX_UNWRAPPED: f64 = 2.0;

/// A [crate::DecayingAverage] over locations that moves along the shortest arc of the circle.
///
/// Internally the average is kept "unwrapped": to move from `0.9` towards `0.2`, `1.2` is
/// reported rather than `0.2` (which would drag the average the long way round through `0.5`).
/// Whenever the unwrapped value leaves `[0.0, 1.0]` after a report it is normalized again, so it
/// never drifts across repeated wraps.
#[derive(Debug)]
pub struct KeyspaceAverage {
    inner: Mutex<Decaying>,
}

impl KeyspaceAverage {
    /// Create a new average starting at location `default`.
    pub fn new(default: f64, max_reports: u64) -> Result<Self, Error> {
        Self::from_field_set(default, max_reports, None)
    }

    /// Restore an average previously exported with [KeyspaceAverage::export_field_set].
    ///
    /// If `fs` is `None`, this is equivalent to [KeyspaceAverage::new].
    pub fn from_field_set(
        default: f64,
        max_reports: u64,
        fs: Option<&FieldSet>,
    ) -> Result<Self, Error> {
        if !location::is_valid(default) {
            return Err(Error::InvalidLocation(default));
        }
        let inner = Decaying::restore(default, MIN_UNWRAPPED, MAX_UNWRAPPED, max_reports, fs)?;
        Ok(Self {
            inner: Mutex::new(inner),
        })
    }

    /// Change how many reports are averaged over.
    ///
    /// Past reports are not reweighted.
    pub fn change_max_reports(&self, max_reports: u64) -> Result<(), Error> {
        self.inner.lock().unwrap().change_max_reports(max_reports)
    }

    /// Export the state of the average, including the unwrapped value.
    pub fn export_field_set(&self) -> FieldSet {
        self.inner.lock().unwrap().export()
    }

    /// Returns the unwrapped value to report to the inner average to move towards `d`.
    fn unwrap_towards(inner: &Decaying, d: f64) -> Result<f64, Error> {
        if !location::is_valid(d) {
            return Err(Error::InvalidLocation(d));
        }
        let super_value = inner.current();
        let this_value = location::normalize(super_value);
        Ok(super_value + location::change(this_value, d))
    }
}

impl Clone for KeyspaceAverage {
    fn clone(&self) -> Self {
        Self {
            inner: Mutex::new(self.inner.lock().unwrap().clone()),
        }
    }
}

impl RunningAverage for KeyspaceAverage {
    fn current_value(&self) -> f64 {
        location::normalize(self.inner.lock().unwrap().current())
    }

    fn report(&self, d: f64) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        let target = Self::unwrap_towards(&inner, d)?;
        inner.report(target)?;

        let value = inner.current();
        if !(0.0..=1.0).contains(&value) {
            inner.set_current(location::normalize(value));
        }
        Ok(())
    }

    /// Locations are real-valued: integer reports are always rejected.
    fn report_integer(&self, n: i64) -> Result<(), Error> {
        Err(Error::IntegerReport(n))
    }

    fn value_if_reported(&self, d: f64) -> Result<f64, Error> {
        let inner = self.inner.lock().unwrap();
        let target = Self::unwrap_towards(&inner, d)?;
        Ok(location::normalize(inner.value_if_reported(target)?))
    }

    fn count_reports(&self) -> u64 {
        self.inner.lock().unwrap().reports()
    }
}
