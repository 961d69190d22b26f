//! Error taxonomy surfaced at the NNTP boundary.
//!
//! Every fault inside the node is mapped onto one of these kinds before it
//! reaches a reader or a peer. Each error records the source location it was
//! raised from, which ends up in the logs next to the NNTP response code.

use std::fmt;
use std::panic::Location;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Session has not completed AUTHINFO yet.
    NotAuthenticated,
    /// Group lookup miss.
    NoSuchGroup,
    /// Article lookup miss, or an internal read fault.
    InvalidArticleNumber,
    /// Signature invalid, Path invariant violated, or group read-only.
    PostingNotPermitted,
    /// Control interpretation or storage failed mid-post.
    PostingFailed,
    /// Duplicate peer or duplicate message-id.
    AlreadyExists,
    /// Overlay mutual auth failed.
    HandshakeFailed,
    /// A control handler reported a hard error.
    ControlFailed,
    /// Storage I/O or codec fault that has no better mapping.
    Internal,
}

impl ErrorKind {
    fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotAuthenticated => "not authenticated",
            ErrorKind::NoSuchGroup => "no such group",
            ErrorKind::InvalidArticleNumber => "invalid article number",
            ErrorKind::PostingNotPermitted => "posting not permitted",
            ErrorKind::PostingFailed => "posting failed",
            ErrorKind::AlreadyExists => "already exists",
            ErrorKind::HandshakeFailed => "handshake failed",
            ErrorKind::ControlFailed => "control message failed",
            ErrorKind::Internal => "internal error",
        }
    }
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    detail: Option<String>,
    location: &'static Location<'static>,
}

impl Error {
    #[track_caller]
    pub fn new(kind: ErrorKind) -> Self {
        Error { kind, detail: None, location: Location::caller() }
    }

    #[track_caller]
    pub fn with(kind: ErrorKind, detail: impl fmt::Display) -> Self {
        Error { kind, detail: Some(detail.to_string()), location: Location::caller() }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Remap the kind at a protocol boundary, keeping the detail and the
    /// original source location. Used for the mappings the taxonomy
    /// prescribes: `ControlFailed` reaches the poster as `PostingFailed`,
    /// `Internal` reaches readers as `InvalidArticleNumber`.
    pub fn surface_as(mut self, kind: ErrorKind) -> Error {
        self.kind = kind;
        self
    }

    /// NNTP response code for this error, as sent on the wire.
    pub fn code(&self) -> u16 {
        match self.kind {
            ErrorKind::NotAuthenticated => 480,
            ErrorKind::NoSuchGroup => 411,
            ErrorKind::InvalidArticleNumber => 423,
            ErrorKind::PostingNotPermitted => 440,
            ErrorKind::PostingFailed => 441,
            ErrorKind::AlreadyExists => 441,
            ErrorKind::ControlFailed => 441,
            ErrorKind::HandshakeFailed => 502,
            ErrorKind::Internal => 403,
        }
    }

    /// The response text paired with [`Error::code`].
    pub fn reason(&self) -> &'static str {
        self.kind.as_str()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.detail {
            Some(d) => write!(f, "{} [{}:{}]: {}", self.kind.as_str(), self.location.file(), self.location.line(), d),
            None => write!(f, "{} [{}:{}]", self.kind.as_str(), self.location.file(), self.location.line()),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;
