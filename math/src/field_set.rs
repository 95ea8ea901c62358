//! An ordered set of string fields used to persist averages.
//!
//! # Format
//!
//! The text form is one `Key=Value` pair per line, in key order, followed by a line containing
//! only `End`:
//!
//! ```text
//! CurrentValue=0.25
//! MaxReports=10
//! Reports=3
//! End
//! ```

use crate::Error;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, str::FromStr};

/// Marker terminating the text form of a [FieldSet].
const END: &str = "End";

/// An ordered collection of string key/value pairs.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldSet {
    fields: BTreeMap<String, String>,
}

impl FieldSet {
    /// Create an empty field set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `key` to the display form of `value`, overwriting any previous value.
    pub fn put(&mut self, key: impl Into<String>, value: impl fmt::Display) {
        self.fields.insert(key.into(), value.to_string());
    }

    /// Get the raw value of `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    /// Parse the value of a required field.
    pub fn parse<T: FromStr>(&self, key: &'static str) -> Result<T, Error> {
        let raw = self.get(key).ok_or(Error::MissingField(key))?;
        raw.parse()
            .map_err(|_| Error::InvalidField(key, raw.to_string()))
    }

    /// Returns the number of fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Returns true if there are no fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl fmt::Display for FieldSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (key, value) in self.fields.iter() {
            writeln!(f, "{key}={value}")?;
        }
        writeln!(f, "{END}")
    }
}

impl FromStr for FieldSet {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut fields = BTreeMap::new();
        for line in s.lines() {
            let line = line.trim_end_matches('\r');
            if line == END {
                return Ok(Self { fields });
            }
            if line.is_empty() {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(Error::MalformedLine(line.to_string()));
            };
            if key.is_empty() {
                return Err(Error::MalformedLine(line.to_string()));
            }
            fields.insert(key.to_string(), value.to_string());
        }
        Err(Error::MissingEnd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_parse() {
        let mut fs = FieldSet::new();
        assert!(fs.is_empty());
        fs.put("Reports", 3u64);
        fs.put("CurrentValue", 0.1 + 0.2);

        assert_eq!(fs.len(), 2);
        assert_eq!(fs.get("Reports"), Some("3"));
        assert_eq!(fs.parse::<u64>("Reports").unwrap(), 3);

        // Floats keep their exact value through the display form
        assert_eq!(fs.parse::<f64>("CurrentValue").unwrap(), 0.1 + 0.2);

        assert_eq!(
            fs.parse::<u64>("MaxReports"),
            Err(Error::MissingField("MaxReports"))
        );
        assert_eq!(
            fs.parse::<u64>("CurrentValue"),
            Err(Error::InvalidField(
                "CurrentValue",
                (0.1 + 0.2).to_string()
            ))
        );
    }

    #[test]
    fn test_text_form() {
        let mut fs = FieldSet::new();
        fs.put("b", "two");
        fs.put("a", 1);
        fs.put("c", "x=y");

        let text = fs.to_string();
        assert_eq!(text, "a=1\nb=two\nc=x=y\nEnd\n");
        assert_eq!(text.parse::<FieldSet>().unwrap(), fs);
    }

    #[test]
    fn test_text_form_errors() {
        assert_eq!("a=1\n".parse::<FieldSet>(), Err(Error::MissingEnd));
        assert_eq!(
            "a\nEnd\n".parse::<FieldSet>(),
            Err(Error::MalformedLine("a".to_string()))
        );
        assert_eq!(
            "=1\nEnd\n".parse::<FieldSet>(),
            Err(Error::MalformedLine("=1".to_string()))
        );

        // Anything after the end marker is ignored
        let fs = "a=1\r\nEnd\r\ngarbage".parse::<FieldSet>().unwrap();
        assert_eq!(fs.get("a"), Some("1"));
    }
}
