use std::fmt;

use serde::Serialize;

use crate::error::Error;

/// Externally visible outcome of a catchment area computation. The request
/// layer keys its responses off these values.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    InProgress,
    Success,
    Failure,
    DisconnectedOrigin,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Success => "success",
            Self::Failure => "failure",
            Self::DisconnectedOrigin => "disconnected_origin",
        }
    }

    pub fn from_error(error: &Error) -> Self {
        match error {
            Error::DisconnectedOrigin => Self::DisconnectedOrigin,
            _ => Self::Failure,
        }
    }
}

impl fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disconnected_origin_gets_its_own_status() {
        assert_eq!(
            ProcessingStatus::from_error(&Error::DisconnectedOrigin),
            ProcessingStatus::DisconnectedOrigin
        );
        assert_eq!(
            ProcessingStatus::from_error(&Error::BufferExceedsNetwork),
            ProcessingStatus::Failure
        );
    }
}
