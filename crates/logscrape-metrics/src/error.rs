//! Errors returned by the dynamic metric registry.

use thiserror::Error;

use crate::validation::ValidationError;

/// Error returned by [`Registry`](crate::Registry) observation methods.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The call's labels did not include the reserved `environment` label.
    #[error("observation for `{0}` is missing the `environment` label")]
    MissingEnvironment(String),
    /// A family was first created with one kind (counter/gauge/histogram) and later observed
    /// with a different one.
    #[error("`{name}` was first registered as a {expected}, cannot observe it as a {actual}")]
    KindMismatch {
        /// Full metric name.
        name: String,
        /// Kind recorded at first observation.
        expected: &'static str,
        /// Kind of the current call.
        actual: &'static str,
    },
    /// The label-name set of the current call does not match the one established by the first
    /// observation of this family. Per the specification this is a fatal programming error that
    /// must be reported rather than silently ignored.
    #[error(
        "label set for `{name}` changed from {expected:?} to {actual:?}; \
         the label-name set of a family is fixed by its first observation"
    )]
    LabelSetMismatch {
        /// Full metric name.
        name: String,
        /// Label names recorded at first observation.
        expected: Vec<String>,
        /// Label names of the current call.
        actual: Vec<String>,
    },
    /// A reserved or malformed name was passed to the registry at call time.
    #[error(transparent)]
    InvalidName(#[from] ValidationError),
}
