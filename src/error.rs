//! Error and Result module.

use std::error::Error as StdError;
use std::fmt;

use http::StatusCode;

/// Result type often returned from methods that can have `spliced` errors.
pub type Result<T> = std::result::Result<T, Error>;

type Cause = Box<dyn StdError + Send + Sync>;

/// Represents errors that can occur while proxying a connection.
pub struct Error {
    inner: Box<ErrorImpl>,
}

struct ErrorImpl {
    kind: Kind,
    cause: Option<Cause>,
}

#[derive(Debug)]
pub(crate) enum Kind {
    /// The client sent a request head we could not parse.
    Parse(Parse),
    /// Resolving the request host failed.
    Resolve,
    /// Resolving the request host took longer than the resolve timeout.
    ResolveTimeout,
    /// Connecting to every candidate origin address failed.
    Connect,
    /// A single connect attempt exceeded the connect timeout.
    ConnectTimeout,
    /// An I/O error occurred while relaying bytes between the peers.
    Relay,
    /// A channel saw no input bytes for the configured receive timeout.
    IdleTimeout,
    /// A pending operation was dropped before ever completing.
    Canceled,
    /// Error binding a listening socket.
    Listen,
    /// The configuration could not be loaded or failed validation.
    Config,
}

#[derive(Debug)]
pub(crate) enum Parse {
    Method,
    Uri,
    Version,
    Header,
    /// The request head outgrew the buffer ceiling.
    TooLarge,
    /// The connection closed before the head was complete.
    Incomplete,
}

impl Error {
    pub(crate) fn new(kind: Kind) -> Error {
        Error {
            inner: Box::new(ErrorImpl { kind, cause: None }),
        }
    }

    pub(crate) fn with<C: Into<Cause>>(mut self, cause: C) -> Error {
        self.inner.cause = Some(cause.into());
        self
    }

    pub(crate) fn new_parse(parse: Parse) -> Error {
        Error::new(Kind::Parse(parse))
    }

    pub(crate) fn new_too_large() -> Error {
        Error::new(Kind::Parse(Parse::TooLarge))
    }

    pub(crate) fn new_incomplete() -> Error {
        Error::new(Kind::Parse(Parse::Incomplete))
    }

    pub(crate) fn new_resolve<E: Into<Cause>>(cause: E) -> Error {
        Error::new(Kind::Resolve).with(cause)
    }

    pub(crate) fn new_resolve_empty() -> Error {
        Error::new(Kind::Resolve)
    }

    pub(crate) fn new_resolve_timeout() -> Error {
        Error::new(Kind::ResolveTimeout)
    }

    pub(crate) fn new_connect<E: Into<Cause>>(cause: E) -> Error {
        Error::new(Kind::Connect).with(cause)
    }

    pub(crate) fn new_connect_timeout() -> Error {
        Error::new(Kind::ConnectTimeout)
    }

    pub(crate) fn new_relay(cause: std::io::Error) -> Error {
        Error::new(Kind::Relay).with(cause)
    }

    pub(crate) fn new_idle_timeout() -> Error {
        Error::new(Kind::IdleTimeout)
    }

    pub(crate) fn new_canceled() -> Error {
        Error::new(Kind::Canceled)
    }

    pub(crate) fn new_listen<E: Into<Cause>>(cause: E) -> Error {
        Error::new(Kind::Listen).with(cause)
    }

    pub(crate) fn new_config<E: Into<Cause>>(cause: E) -> Error {
        Error::new(Kind::Config).with(cause)
    }

    /// Returns true if this was caused by an unparseable request head.
    pub fn is_parse(&self) -> bool {
        matches!(self.inner.kind, Kind::Parse(_))
    }

    /// Returns true if this error was caused by any of the timeouts.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self.inner.kind,
            Kind::ResolveTimeout | Kind::ConnectTimeout | Kind::IdleTimeout
        )
    }

    /// Returns true if a channel idled out.
    pub fn is_idle_timeout(&self) -> bool {
        matches!(self.inner.kind, Kind::IdleTimeout)
    }

    /// Returns true if a pending operation was canceled.
    pub fn is_canceled(&self) -> bool {
        matches!(self.inner.kind, Kind::Canceled)
    }

    /// The canned response status appropriate for this error, if any.
    ///
    /// Errors that happen once the relay has started are reported as `None`:
    /// nothing may be written to the client besides relayed origin bytes.
    pub(crate) fn canned_status(&self) -> Option<StatusCode> {
        match self.inner.kind {
            Kind::Parse(Parse::TooLarge) => Some(StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE),
            Kind::Parse(_) => Some(StatusCode::BAD_REQUEST),
            Kind::Resolve | Kind::ResolveTimeout | Kind::Canceled => {
                Some(StatusCode::BAD_GATEWAY)
            }
            Kind::Connect | Kind::ConnectTimeout => Some(StatusCode::BAD_GATEWAY),
            Kind::Relay | Kind::IdleTimeout | Kind::Listen | Kind::Config => None,
        }
    }

    fn description(&self) -> &str {
        match self.inner.kind {
            Kind::Parse(Parse::Method) => "invalid request method",
            Kind::Parse(Parse::Uri) => "invalid request target",
            Kind::Parse(Parse::Version) => "invalid HTTP version",
            Kind::Parse(Parse::Header) => "invalid header line",
            Kind::Parse(Parse::TooLarge) => "request head too large",
            Kind::Parse(Parse::Incomplete) => "connection closed before request head was complete",
            Kind::Resolve => "host resolution failed",
            Kind::ResolveTimeout => "host resolution timed out",
            Kind::Connect => "connecting to origin failed",
            Kind::ConnectTimeout => "connect attempt timed out",
            Kind::Relay => "relay error",
            Kind::IdleTimeout => "no bytes received within the receive timeout",
            Kind::Canceled => "operation was canceled",
            Kind::Listen => "error binding listener",
            Kind::Config => "invalid configuration",
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut f = f.debug_tuple("spliced::Error");
        f.field(&self.inner.kind);
        if let Some(ref cause) = self.inner.cause {
            f.field(cause);
        }
        f.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref cause) = self.inner.cause {
            write!(f, "{}: {}", self.description(), cause)
        } else {
            f.write_str(self.description())
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner
            .cause
            .as_ref()
            .map(|cause| &**cause as &(dyn StdError + 'static))
    }
}

impl From<httparse::Error> for Error {
    fn from(err: httparse::Error) -> Error {
        let parse = match err {
            httparse::Error::Version => Parse::Version,
            httparse::Error::TooManyHeaders => Parse::TooLarge,
            _ => Parse::Header,
        };
        Error::new_parse(parse)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem;

    #[test]
    fn error_size_of() {
        assert_eq!(mem::size_of::<Error>(), mem::size_of::<usize>());
    }

    #[test]
    fn canned_status_mapping() {
        assert_eq!(
            Error::new_parse(Parse::Uri).canned_status(),
            Some(StatusCode::BAD_REQUEST)
        );
        assert_eq!(
            Error::new_too_large().canned_status(),
            Some(StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE)
        );
        assert_eq!(
            Error::new_resolve_timeout().canned_status(),
            Some(StatusCode::BAD_GATEWAY)
        );
        assert_eq!(
            Error::new_connect_timeout().canned_status(),
            Some(StatusCode::BAD_GATEWAY)
        );
        assert_eq!(Error::new_idle_timeout().canned_status(), None);
        assert_eq!(
            Error::new_relay(std::io::ErrorKind::BrokenPipe.into()).canned_status(),
            None
        );
    }

    #[test]
    fn timeout_predicates() {
        assert!(Error::new_idle_timeout().is_timeout());
        assert!(Error::new_resolve_timeout().is_timeout());
        assert!(Error::new_connect_timeout().is_timeout());
        assert!(!Error::new_canceled().is_timeout());
    }
}
