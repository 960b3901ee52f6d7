//! Age band labels
//!
//! Statistical tables bin age differently from one another (`0-15`, `15-25`,
//! ..., `65+`, or `<5`). `AgeBands` maps integer ages onto one such scheme so
//! a joint distribution binned one way can condition on agents binned another.

use crate::error::{Result, SynthError};

#[derive(Debug, Clone, PartialEq)]
struct AgeBand {
    label: String,
    /// Inclusive lower bound
    min: u32,
    /// Exclusive upper bound, `None` for open-ended bands
    max: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AgeBands {
    bands: Vec<AgeBand>,
}

impl AgeBands {
    /// Parse labels of the form `lo-hi` (lo ≤ age < hi), `lo+` and `<hi`.
    pub fn parse<S: AsRef<str>>(labels: &[S]) -> Result<Self> {
        let bands = labels
            .iter()
            .map(|l| parse_band(l.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { bands })
    }

    /// Label of the first band containing `age`.
    pub fn band_of(&self, age: u32) -> Option<&str> {
        self.bands
            .iter()
            .find(|b| age >= b.min && b.max.map_or(true, |max| age < max))
            .map(|b| b.label.as_str())
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.bands.iter().map(|b| b.label.as_str())
    }
}

fn parse_band(label: &str) -> Result<AgeBand> {
    let invalid = || SynthError::InvalidValue {
        attribute: "age_band".to_string(),
        value: label.to_string(),
    };
    let number = |s: &str| s.trim().parse::<u32>().map_err(|_| invalid());

    let trimmed = label.trim();
    let (min, max) = if let Some(lo) = trimmed.strip_suffix('+') {
        (number(lo)?, None)
    } else if let Some(hi) = trimmed.strip_prefix('<') {
        (0, Some(number(hi)?))
    } else if let Some((lo, hi)) = trimmed.split_once('-') {
        let (lo, hi) = (number(lo)?, number(hi)?);
        if hi <= lo {
            return Err(invalid());
        }
        (lo, Some(hi))
    } else {
        let exact = number(trimmed)?;
        (exact, Some(exact + 1))
    };

    Ok(AgeBand {
        label: label.to_string(),
        min,
        max,
    })
}
