//! A bootstrapping, exponentially decaying running average.

use crate::{Error, FieldSet, RunningAverage};
use std::sync::Mutex;
use tracing::debug;

/// Version of the exported field set.
const VERSION: u32 = 1;

/// Type recorded in the exported field set.
const TYPE: &str = "DecayingAverage";

/// Unsynchronized state of a [DecayingAverage].
///
/// The first reports are averaged with equal weight (`1/n`) so that the default value is quickly
/// forgotten. Once `max_reports` have been received, every report has weight `1/max_reports`.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Decaying {
    current: f64,
    reports: u64,
    max_reports: u64,
    min: f64,
    max: f64,
}

impl Decaying {
    pub(crate) fn new(default: f64, min: f64, max: f64, max_reports: u64) -> Result<Self, Error> {
        if !(min.is_finite() && max.is_finite() && min <= max) {
            return Err(Error::InvalidBounds(min, max));
        }
        if max_reports == 0 {
            return Err(Error::InvalidMaxReports);
        }
        if !default.is_finite() {
            return Err(Error::NotFinite(default));
        }
        Ok(Self {
            current: default.clamp(min, max),
            reports: 0,
            max_reports,
            min,
            max,
        })
    }

    /// Restore from `fs`, falling back to the provided parameters when `fs` is `None`.
    ///
    /// Bounds always come from the caller. `MaxReports` in `fs` overrides `max_reports`.
    pub(crate) fn restore(
        default: f64,
        min: f64,
        max: f64,
        max_reports: u64,
        fs: Option<&FieldSet>,
    ) -> Result<Self, Error> {
        let mut decaying = Self::new(default, min, max, max_reports)?;
        let Some(fs) = fs else {
            return Ok(decaying);
        };

        let version: u32 = fs.parse("Version")?;
        if version != VERSION {
            return Err(Error::UnsupportedVersion(version));
        }
        let kind = fs.get("Type").ok_or(Error::MissingField("Type"))?;
        if kind != TYPE {
            return Err(Error::UnexpectedType(kind.to_string()));
        }
        let current: f64 = fs.parse("CurrentValue")?;
        if !current.is_finite() || current < min || current > max {
            return Err(Error::InvalidField("CurrentValue", current.to_string()));
        }
        let max_reports: u64 = fs.parse("MaxReports")?;
        if max_reports == 0 {
            return Err(Error::InvalidMaxReports);
        }
        decaying.current = current;
        decaying.reports = fs.parse("Reports")?;
        decaying.max_reports = max_reports;
        Ok(decaying)
    }

    pub(crate) fn export(&self) -> FieldSet {
        let mut fs = FieldSet::new();
        fs.put("Version", VERSION);
        fs.put("Type", TYPE);
        fs.put("CurrentValue", self.current);
        fs.put("Reports", self.reports);
        fs.put("MaxReports", self.max_reports);
        fs.put("MinValue", self.min);
        fs.put("MaxValue", self.max);
        fs
    }

    /// Clamp `d` into the bounds of the average.
    fn bound(&self, d: f64) -> Result<f64, Error> {
        if !d.is_finite() {
            return Err(Error::NotFinite(d));
        }
        if d < self.min || d > self.max {
            debug!(value = d, min = self.min, max = self.max, "clamping report");
        }
        Ok(d.clamp(self.min, self.max))
    }

    fn weight(&self, reports: u64) -> f64 {
        1.0 / reports.min(self.max_reports) as f64
    }

    pub(crate) fn current(&self) -> f64 {
        self.current
    }

    pub(crate) fn set_current(&mut self, value: f64) {
        self.current = value;
    }

    pub(crate) fn reports(&self) -> u64 {
        self.reports
    }

    pub(crate) fn report(&mut self, d: f64) -> Result<(), Error> {
        let d = self.bound(d)?;
        self.reports = self.reports.saturating_add(1);
        let weight = self.weight(self.reports);
        self.current = d * weight + self.current * (1.0 - weight);
        Ok(())
    }

    pub(crate) fn value_if_reported(&self, d: f64) -> Result<f64, Error> {
        let d = self.bound(d)?;
        let weight = self.weight(self.reports.saturating_add(1));
        Ok(d * weight + self.current * (1.0 - weight))
    }

    pub(crate) fn change_max_reports(&mut self, max_reports: u64) -> Result<(), Error> {
        if max_reports == 0 {
            return Err(Error::InvalidMaxReports);
        }
        self.max_reports = max_reports;
        Ok(())
    }
}

/// A running average that weights early reports equally and then decays exponentially.
#[derive(Debug)]
pub struct DecayingAverage {
    inner: Mutex<Decaying>,
}

impl DecayingAverage {
    /// Create a new average starting at `default`, bounded to `[min, max]`.
    ///
    /// Reports outside of the bounds are clamped.
    pub fn new(default: f64, min: f64, max: f64, max_reports: u64) -> Result<Self, Error> {
        Self::from_field_set(default, min, max, max_reports, None)
    }

    /// Restore an average previously exported with [DecayingAverage::export_field_set].
    ///
    /// If `fs` is `None`, this is equivalent to [DecayingAverage::new].
    pub fn from_field_set(
        default: f64,
        min: f64,
        max: f64,
        max_reports: u64,
        fs: Option<&FieldSet>,
    ) -> Result<Self, Error> {
        Ok(Self {
            inner: Mutex::new(Decaying::restore(default, min, max, max_reports, fs)?),
        })
    }

    /// Change how many reports are averaged over.
    ///
    /// Past reports are not reweighted.
    pub fn change_max_reports(&self, max_reports: u64) -> Result<(), Error> {
        self.inner.lock().unwrap().change_max_reports(max_reports)
    }

    /// Overwrite the current value without counting a report.
    pub fn set_current_value(&self, value: f64) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        let value = inner.bound(value)?;
        inner.set_current(value);
        Ok(())
    }

    /// Export the state of the average.
    pub fn export_field_set(&self) -> FieldSet {
        self.inner.lock().unwrap().export()
    }
}

impl Clone for DecayingAverage {
    fn clone(&self) -> Self {
        Self {
            inner: Mutex::new(self.inner.lock().unwrap().clone()),
        }
    }
}

impl RunningAverage for DecayingAverage {
    fn current_value(&self) -> f64 {
        self.inner.lock().unwrap().current()
    }

    fn report(&self, d: f64) -> Result<(), Error> {
        self.inner.lock().unwrap().report(d)
    }

    fn value_if_reported(&self, d: f64) -> Result<f64, Error> {
        self.inner.lock().unwrap().value_if_reported(d)
    }

    fn count_reports(&self) -> u64 {
        self.inner.lock().unwrap().reports()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPSILON: f64 = 1e-12;

    #[test]
    fn test_bootstrap() {
        let average = DecayingAverage::new(5.0, 0.0, 10.0, 4).unwrap();
        assert_eq!(average.current_value(), 5.0);
        assert_eq!(average.count_reports(), 0);

        // The first report replaces the default entirely
        average.report(2.0).unwrap();
        assert_eq!(average.current_value(), 2.0);

        // The second has weight 1/2, the third 1/3
        average.report(4.0).unwrap();
        assert!((average.current_value() - 3.0).abs() < EPSILON);
        average.report(6.0).unwrap();
        assert!((average.current_value() - 4.0).abs() < EPSILON);
        assert_eq!(average.count_reports(), 3);
    }

    #[test]
    fn test_decay() {
        let average = DecayingAverage::new(0.0, 0.0, 100.0, 2).unwrap();
        average.report(10.0).unwrap();

        // After max reports each report has weight 1/2
        average.report(20.0).unwrap();
        assert!((average.current_value() - 15.0).abs() < EPSILON);
        average.report(20.0).unwrap();
        assert!((average.current_value() - 17.5).abs() < EPSILON);
    }

    #[test]
    fn test_clamp_and_reject() {
        let average = DecayingAverage::new(0.5, 0.0, 1.0, 10).unwrap();
        average.report(7.0).unwrap();
        assert_eq!(average.current_value(), 1.0);
        assert!(matches!(average.report(f64::NAN), Err(Error::NotFinite(_))));
        assert!(matches!(
            average.report(f64::INFINITY),
            Err(Error::NotFinite(_))
        ));
        assert_eq!(average.count_reports(), 1);
    }

    #[test]
    fn test_value_if_reported() {
        let average = DecayingAverage::new(0.0, 0.0, 10.0, 10).unwrap();
        average.report(4.0).unwrap();

        let preview = average.value_if_reported(8.0).unwrap();
        assert!((preview - 6.0).abs() < EPSILON);
        assert_eq!(average.current_value(), 4.0);
        assert_eq!(average.count_reports(), 1);

        average.report(8.0).unwrap();
        assert_eq!(average.current_value(), preview);
    }

    #[test]
    fn test_change_max_reports() {
        let average = DecayingAverage::new(0.0, 0.0, 100.0, 10).unwrap();
        average.report(10.0).unwrap();
        average.report(10.0).unwrap();
        average.change_max_reports(1).unwrap();

        // Every report now replaces the value
        average.report(50.0).unwrap();
        assert_eq!(average.current_value(), 50.0);
        assert_eq!(average.change_max_reports(0), Err(Error::InvalidMaxReports));
    }

    #[test]
    fn test_invalid_construction() {
        assert_eq!(
            DecayingAverage::new(0.0, 1.0, 0.0, 10).unwrap_err(),
            Error::InvalidBounds(1.0, 0.0)
        );
        assert_eq!(
            DecayingAverage::new(0.0, 0.0, 1.0, 0).unwrap_err(),
            Error::InvalidMaxReports
        );
    }

    #[test]
    fn test_field_set_round_trip() {
        let average = DecayingAverage::new(1.0, -5.0, 5.0, 7).unwrap();
        for d in [0.3, -1.7, 2.9, 0.1] {
            average.report(d).unwrap();
        }
        let fs = average.export_field_set();
        assert_eq!(fs.get("Type"), Some(TYPE));

        // Restore through the text form with different constructor parameters
        let fs: FieldSet = fs.to_string().parse().unwrap();
        let restored = DecayingAverage::from_field_set(0.0, -5.0, 5.0, 3, Some(&fs)).unwrap();
        assert_eq!(restored.current_value(), average.current_value());
        assert_eq!(restored.count_reports(), average.count_reports());
        assert_eq!(restored.export_field_set(), average.export_field_set());

        // Both evolve identically
        average.report(4.0).unwrap();
        restored.report(4.0).unwrap();
        assert_eq!(restored.current_value(), average.current_value());
    }

    #[test]
    fn test_field_set_rejected() {
        let mut fs = DecayingAverage::new(1.0, 0.0, 2.0, 7)
            .unwrap()
            .export_field_set();
        fs.put("CurrentValue", 3.0);
        assert!(matches!(
            DecayingAverage::from_field_set(1.0, 0.0, 2.0, 7, Some(&fs)),
            Err(Error::InvalidField("CurrentValue", _))
        ));

        fs.put("Version", 9);
        assert!(matches!(
            DecayingAverage::from_field_set(1.0, 0.0, 2.0, 7, Some(&fs)),
            Err(Error::UnsupportedVersion(9))
        ));

        fs.put("Version", VERSION);
        fs.put("Type", "Other");
        assert!(matches!(
            DecayingAverage::from_field_set(1.0, 0.0, 2.0, 7, Some(&fs)),
            Err(Error::UnexpectedType(_))
        ));
    }
}
