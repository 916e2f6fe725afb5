//! Validation of metric prefixes, names and reserved identifiers.

use thiserror::Error;

/// Label name reserved for routing metrics to a per-environment sub-registry.
pub const ENVIRONMENT_LABEL: &str = "environment";

/// Metric names that cannot be declared as non-label schema columns; they are reserved for the
/// self-observed metrics recorded by the tailing workers themselves.
pub const RESERVED_METRIC_NAMES: [&str; 3] = ["parser_errors", "lines_parsed", "in_bytes"];

/// Error returned by name/prefix validation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// The name was empty.
    #[error("name cannot be empty")]
    Empty,
    /// The name contained a character disallowed by `[a-zA-Z_:][a-zA-Z0-9_:]*`.
    #[error("name `{0}` must match [a-zA-Z_:][a-zA-Z0-9_:]*")]
    InvalidChars(String),
    /// The name collides with a reserved identifier.
    #[error("`{0}` is a reserved name and cannot be used here")]
    Reserved(String),
}

fn is_valid_start_char(ch: u8) -> bool {
    ch == b'_' || ch == b':' || ch.is_ascii_alphabetic()
}

fn is_valid_char(ch: u8) -> bool {
    ch == b'_' || ch == b':' || ch.is_ascii_alphanumeric()
}

/// Validates that `name` matches `[a-zA-Z_:][a-zA-Z0-9_:]*`.
pub fn validate_name(name: &str) -> Result<(), ValidationError> {
    let bytes = name.as_bytes();
    let Some((&first, rest)) = bytes.split_first() else {
        return Err(ValidationError::Empty);
    };
    if !is_valid_start_char(first) || !rest.iter().all(|&ch| is_valid_char(ch)) {
        return Err(ValidationError::InvalidChars(name.to_owned()));
    }
    Ok(())
}

/// Validates a metrics prefix, checked once at startup and glued with `:` to user-declared names.
pub fn validate_prefix(prefix: &str) -> Result<(), ValidationError> {
    validate_name(prefix)
}

/// Validates a user-declared schema column name intended to become a metric name, rejecting
/// reserved metric names.
pub fn validate_metric_name(name: &str) -> Result<(), ValidationError> {
    validate_name(name)?;
    if RESERVED_METRIC_NAMES.contains(&name) {
        return Err(ValidationError::Reserved(name.to_owned()));
    }
    Ok(())
}

/// Validates a user-declared schema column name intended to become a label name, rejecting the
/// reserved `environment` label.
pub fn validate_label_name(name: &str) -> Result<(), ValidationError> {
    validate_name(name)?;
    if name == ENVIRONMENT_LABEL {
        return Err(ValidationError::Reserved(name.to_owned()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validating_names() {
        for name in ["test", "_private", "snake_case", "l33t:code", "A_B"] {
            validate_name(name).unwrap();
        }
        assert_eq!(validate_name(""), Err(ValidationError::Empty));
        assert!(matches!(
            validate_name("1est"),
            Err(ValidationError::InvalidChars(_))
        ));
        assert!(matches!(
            validate_name("t!st"),
            Err(ValidationError::InvalidChars(_))
        ));
    }

    #[test]
    fn rejecting_reserved_label() {
        assert!(matches!(
            validate_label_name("environment"),
            Err(ValidationError::Reserved(_))
        ));
        validate_label_name("status").unwrap();
    }

    #[test]
    fn rejecting_reserved_metric_names() {
        for name in RESERVED_METRIC_NAMES {
            assert!(matches!(
                validate_metric_name(name),
                Err(ValidationError::Reserved(_))
            ));
        }
        validate_metric_name("bytes").unwrap();
    }
}
