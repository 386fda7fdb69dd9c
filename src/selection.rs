//! Validation of user-supplied platform/device choices.
//!
//! Console prompting and re-asking live in the front end; the core only
//! accepts a [`ValidIndex`].

use thiserror::Error;

use crate::resource::{Device, Platform};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SelectionError {
    #[error("no such entry: {index} (choose 1..={count})")]
    OutOfRange { index: usize, count: usize },

    #[error("'{0}' is not a number")]
    NotANumber(String),
}

/// A one-based choice already checked against the list it selects from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidIndex {
    one_based: usize,
}

impl ValidIndex {
    /// Zero-based position into the validated list.
    pub fn get(self) -> usize {
        self.one_based - 1
    }

    /// The number as the user entered it.
    pub fn one_based(self) -> usize {
        self.one_based
    }
}

/// Accepts `n` when `1 <= n <= count`.
pub fn validate_index(n: usize, count: usize) -> Result<ValidIndex, SelectionError> {
    if n >= 1 && n <= count {
        Ok(ValidIndex { one_based: n })
    } else {
        Err(SelectionError::OutOfRange { index: n, count })
    }
}

/// Parses a line of console input and validates it.
pub fn parse_index(input: &str, count: usize) -> Result<ValidIndex, SelectionError> {
    let trimmed = input.trim();
    let n = trimmed
        .parse::<usize>()
        .map_err(|_| SelectionError::NotANumber(trimmed.to_string()))?;
    validate_index(n, count)
}

/// The external collaborator that picks a platform and a device.
///
/// Implementations see the enumerated lists and must return an index valid
/// for that list.
pub trait Selector {
    fn select_platform(&mut self, platforms: &[Platform]) -> Result<ValidIndex, SelectionError>;

    fn select_device(&mut self, devices: &[Device]) -> Result<ValidIndex, SelectionError>;
}

/// Non-interactive selection by fixed one-based indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedSelection {
    pub platform: usize,
    pub device: usize,
}

impl FixedSelection {
    pub fn new(platform: usize, device: usize) -> Self {
        Self { platform, device }
    }
}

impl Default for FixedSelection {
    fn default() -> Self {
        Self::new(1, 1)
    }
}

impl Selector for FixedSelection {
    fn select_platform(&mut self, platforms: &[Platform]) -> Result<ValidIndex, SelectionError> {
        validate_index(self.platform, platforms.len())
    }

    fn select_device(&mut self, devices: &[Device]) -> Result<ValidIndex, SelectionError> {
        validate_index(self.device, devices.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(1, 3, true)]
    #[case(3, 3, true)]
    #[case(0, 3, false)]
    #[case(4, 3, false)]
    #[case(1, 0, false)]
    fn test_validate_index(#[case] n: usize, #[case] count: usize, #[case] ok: bool) {
        assert_eq!(validate_index(n, count).is_ok(), ok);
    }

    #[test]
    fn test_valid_index_is_zero_based() {
        let idx = validate_index(2, 5).unwrap();
        assert_eq!(idx.get(), 1);
        assert_eq!(idx.one_based(), 2);
    }

    #[test]
    fn test_parse_index() {
        assert_eq!(parse_index(" 2\n", 2).unwrap().get(), 1);
        assert_eq!(
            parse_index("two", 2),
            Err(SelectionError::NotANumber("two".to_string()))
        );
        assert_eq!(
            parse_index("-1", 2),
            Err(SelectionError::NotANumber("-1".to_string()))
        );
    }
}
