//! Message validation errors.

/// A message violates a field constraint.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("invalid {field}: value is required")]
    Required { field: &'static str },

    #[error("invalid {field}: value length must be at least 1 runes")]
    Empty { field: &'static str },

    #[error("invalid {field}: URL scheme must be grpc or grpcs")]
    UrlScheme { field: &'static str },
}

impl From<ValidationError> for tonic::Status {
    fn from(err: ValidationError) -> Self {
        Self::invalid_argument(err.to_string())
    }
}
