use std::error::Error as StdError;
use std::fmt::Formatter;
use std::io;

/// Every failure the core can surface has an [`ErrorKind`] and an
/// (optional) source.
///
/// The kind decides how the failure is classified (see [`ErrorClass`]) and
/// which process exit code it maps to; the source carries the underlying
/// cause for operators.
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    source: Option<Box<dyn StdError + Sync + Send + 'static>>,
}

impl Error {
    pub fn source<E: StdError + Sync + Send + 'static>(kind: ErrorKind, err: E) -> Self {
        Self {
            kind,
            source: Some(Box::new(err)),
        }
    }

    pub fn custom<S: AsRef<str>>(kind: ErrorKind, message: S) -> Self {
        Self {
            kind,
            source: Some(Box::new(io::Error::new(
                io::ErrorKind::Other,
                message.as_ref().to_string(),
            ))),
        }
    }

    pub fn from_kind(kind: ErrorKind) -> Self {
        Self { kind, source: None }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind.clone()
    }

    pub fn class(&self) -> ErrorClass {
        self.kind.class()
    }

    /// Process exit code for CLI surfaces. Container exit codes are passed
    /// through verbatim by attached runs and never collide with these.
    pub fn exit_code(&self) -> i32 {
        match self.class() {
            ErrorClass::Validation => 64,
            ErrorClass::Resource => 69,
            ErrorClass::Security => 77,
            ErrorClass::Transient => 75,
            ErrorClass::Invariant => 70,
        }
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self::from_kind(kind)
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::source(ErrorKind::Internal, err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::source(ErrorKind::Internal, err)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(source) = self.source.as_ref() {
            write!(f, ": ")?;
            source.fmt(f)?;
        }
        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|source| source.as_ref() as &(dyn StdError + 'static))
    }
}

/// Broad classification of a failure; decides retry and surfacing policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// Bad input; the run is never created. Non-fatal for the process.
    Validation,
    /// A dependency (runtime, image, port) was not available; setup is
    /// rolled back.
    Resource,
    /// Never silently retried; terminates the path it occurred on.
    Security,
    /// Retried with backoff where a retry loop exists; surfaced as 502 on
    /// proxy paths.
    Transient,
    /// State-machine violations and other programmer errors.
    Invariant,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ErrorKind {
    #[error("unknown provider `{0}`")]
    UnknownProvider(String),
    #[error("no credential stored for grant `{0}`")]
    MissingCredential(String),
    #[error("no SSH keys configured for host `{0}`")]
    MissingSshMapping(String),
    #[error("invalid run id")]
    InvalidRunId,
    #[error("invalid run name")]
    InvalidRunName,
    #[error("a run named `{0}` already exists")]
    NameInUse(String),
    #[error("workspace is not a directory")]
    InvalidWorkspace,
    #[error("run not found")]
    RunNotFound,
    #[error("routing proxy is already running on a different port")]
    PortMismatch,

    #[error("container runtime unavailable")]
    RuntimeUnavailable,
    #[error("failed to resolve run image")]
    ImageResolution,
    #[error("failed to bind proxy listener")]
    ProxyBind,

    #[error("insecure permissions on credential material")]
    InsecurePermissions,
    #[error("proxy authentication failed")]
    ProxyAuthFailed,
    #[error("SSH signature denied")]
    SshSignDenied,

    #[error("backend unreachable")]
    BackendUnreachable,

    #[error("operation not valid in the current state")]
    InvalidOperation,
    #[error("internal error")]
    Internal,
}

impl ErrorKind {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::UnknownProvider(_)
            | Self::MissingCredential(_)
            | Self::MissingSshMapping(_)
            | Self::InvalidRunId
            | Self::InvalidRunName
            | Self::NameInUse(_)
            | Self::InvalidWorkspace
            | Self::RunNotFound
            | Self::PortMismatch => ErrorClass::Validation,
            Self::RuntimeUnavailable | Self::ImageResolution | Self::ProxyBind => {
                ErrorClass::Resource
            }
            Self::InsecurePermissions | Self::ProxyAuthFailed | Self::SshSignDenied => {
                ErrorClass::Security
            }
            Self::BackendUnreachable => ErrorClass::Transient,
            Self::InvalidOperation | Self::Internal => ErrorClass::Invariant,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classes_map_to_distinct_exit_codes() {
        let codes = [
            Error::from_kind(ErrorKind::InvalidRunName).exit_code(),
            Error::from_kind(ErrorKind::RuntimeUnavailable).exit_code(),
            Error::from_kind(ErrorKind::ProxyAuthFailed).exit_code(),
            Error::from_kind(ErrorKind::BackendUnreachable).exit_code(),
            Error::from_kind(ErrorKind::InvalidOperation).exit_code(),
        ];
        let mut deduped = codes.to_vec();
        deduped.sort_unstable();
        deduped.dedup();
        assert_eq!(deduped.len(), codes.len());
        assert!(codes.iter().all(|code| *code != 0));
    }

    #[test]
    fn display_includes_source() {
        let err = Error::custom(ErrorKind::InvalidWorkspace, "/tmp/nope");
        assert_eq!(
            err.to_string(),
            "workspace is not a directory: /tmp/nope"
        );
    }

    #[test]
    fn security_kinds_are_security_class() {
        assert_eq!(
            ErrorKind::InsecurePermissions.class(),
            ErrorClass::Security
        );
        assert_eq!(ErrorKind::SshSignDenied.class(), ErrorClass::Security);
    }
}
