use snafu::Snafu;
use std::{io, sync::Arc};

/// Everything that can go wrong in a decode or encode session.
///
/// Errors are cheap to clone so that a poisoned session can hand the original failure back on
/// every subsequent call.
#[derive(Clone, Debug, Snafu)]
pub enum Error {
    #[snafu(display("general fault"))]
    GeneralFault,
    #[snafu(display("memory allocation error"))]
    MemoryAllocation,
    #[snafu(display("file format error"))]
    Format,
    #[snafu(display("version not supported"))]
    VersionMismatch,
    /// Only surfaced by the codec's flush step. Decoders translate it into `Ok(None)`.
    #[snafu(display("end of stream reached"))]
    EndOfStream,
    #[snafu(display("usage error: {message}"))]
    Usage { message: String },
    #[snafu(display("invariant violated: {message}"))]
    InvariantViolation { message: String },
    #[snafu(display("io error: {source}"))]
    Io { source: Arc<io::Error> },
    #[snafu(display("plugin {index} vetoed encoder creation"))]
    PluginVeto { index: usize },
    #[snafu(display("session is closed"))]
    Closed,
}

impl Error {
    pub(crate) fn usage(message: impl Into<String>) -> Self {
        Self::Usage { message: message.into() }
    }

    pub(crate) fn invariant(message: impl Into<String>) -> Self {
        Self::InvariantViolation { message: message.into() }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Io { source: Arc::new(e) }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_error_messages() {
        assert_eq!(Error::GeneralFault.to_string(), "general fault");
        assert_eq!(Error::MemoryAllocation.to_string(), "memory allocation error");
        assert_eq!(Error::Format.to_string(), "file format error");
        assert_eq!(Error::VersionMismatch.to_string(), "version not supported");
        assert_eq!(Error::EndOfStream.to_string(), "end of stream reached");
        assert_eq!(Error::usage("bad stride").to_string(), "usage error: bad stride");
    }

    #[test]
    fn test_io_error_clones() {
        let e: Error = io::Error::new(io::ErrorKind::BrokenPipe, "pipe").into();
        let cloned = e.clone();
        assert!(matches!(cloned, Error::Io { .. }));
        assert!(cloned.to_string().contains("pipe"));
    }
}
