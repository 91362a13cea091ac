use std::fmt;

/// Broad failure class; decides the process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    General,
    InvalidProfileCombination,
    StructuralMismatch,
    OverrideMismatch,
    ExternalBuildFailure,
    PreconditionFailure,
    /// The operator declined the confirmation gate. Not a failure.
    Cancelled,
}

impl ErrorKind {
    pub fn exit_code(self) -> i32 {
        match self {
            ErrorKind::Cancelled => 0,
            ErrorKind::General => 1,
            ErrorKind::InvalidProfileCombination => 2,
            ErrorKind::StructuralMismatch => 3,
            ErrorKind::PreconditionFailure => 4,
            ErrorKind::ExternalBuildFailure => 5,
            ErrorKind::OverrideMismatch => 6,
        }
    }
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    msg: String,
}

impl Error {
    pub fn msg<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::General, msg)
    }

    pub fn new<M: Into<String>>(kind: ErrorKind, msg: M) -> Self {
        Self {
            kind,
            msg: msg.into(),
        }
    }

    pub fn precondition<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::PreconditionFailure, msg)
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "cancelled by operator")
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == ErrorKind::Cancelled
    }

    /// Prefixes the message, keeping the kind.
    pub fn context<C: fmt::Display>(self, ctx: C) -> Self {
        Self {
            kind: self.kind,
            msg: format!("{ctx}: {}", self.msg),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.msg)
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::msg(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::msg(err.to_string())
    }
}

/// Typed failures of the pure decision components.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Exactly one of the two Propeller profiles was supplied.
    IncompleteProfilePair {
        present: &'static str,
        missing: &'static str,
    },
    /// Propeller profiles were supplied without an AutoFDO profile.
    MissingPrerequisiteProfile { present: Vec<&'static str> },
    StructuralMismatch { sources: usize, checksums: usize },
}

impl ConfigError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConfigError::IncompleteProfilePair { .. }
            | ConfigError::MissingPrerequisiteProfile { .. } => {
                ErrorKind::InvalidProfileCombination
            }
            ConfigError::StructuralMismatch { .. } => ErrorKind::StructuralMismatch,
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::IncompleteProfilePair { present, missing } => write!(
                f,
                "invalid profile combination: {present} is set but {missing} is not (Propeller profiles must be supplied together)"
            ),
            ConfigError::MissingPrerequisiteProfile { present } => write!(
                f,
                "invalid profile combination: {} set without PGOFORGE_AUTOFDO_PROFILE (Propeller builds on an AutoFDO-optimized kernel)",
                present.join(" and ")
            ),
            ConfigError::StructuralMismatch { sources, checksums } => write!(
                f,
                "structural mismatch: descriptor lists {sources} source(s) but {checksums} checksum(s)"
            ),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Self::new(err.kind(), err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_keeps_kind() {
        let err = Error::from(ConfigError::StructuralMismatch {
            sources: 3,
            checksums: 2,
        })
        .context("task 'kernel.validate' failed");
        assert_eq!(err.kind(), ErrorKind::StructuralMismatch);
        assert!(err.to_string().starts_with("task 'kernel.validate' failed: "));
    }

    #[test]
    fn cancellation_exits_cleanly() {
        assert_eq!(Error::cancelled().kind().exit_code(), 0);
        assert_ne!(ErrorKind::PreconditionFailure.exit_code(), 0);
    }
}
