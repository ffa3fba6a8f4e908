//! Standard error type for hetpipe.

use std::error;
use std::fmt;

use crate::element::ElementKind;

/// `Error` result type.
pub type Result<T> = ::std::result::Result<T, Error>;

/// An error originating anywhere within the pipelining or scheduling layer.
///
/// Most construction-time problems carry only a description string. Copies
/// across array boundaries report the mismatching property instead so callers
/// can tell a user bug from a driver failure.
pub enum Error {
    String(String),
    KindMismatch { expected: ElementKind, found: ElementKind },
    LengthMismatch { expected: usize, found: usize },
    StrideMismatch { expected: usize, found: usize },
    Driver { code: i32, message: String },
}

impl Error {
    /// Returns a new `Error` with the description string: `desc`.
    pub fn new<S: Into<String>>(desc: S) -> Error {
        Error::String(desc.into())
    }

    /// Returns a new `Err(Error)` with the given description.
    pub fn err<T, S: Into<String>>(desc: S) -> Result<T> {
        Err(Error::new(desc))
    }

    /// Returns a new driver-originated error.
    pub fn driver<S: Into<String>>(code: i32, message: S) -> Error {
        Error::Driver { code: code, message: message.into() }
    }

    /// Returns the driver error code if this error came from the driver,
    /// otherwise zero.
    pub fn code(&self) -> i32 {
        match *self {
            Error::Driver { code, .. } => code,
            _ => 0,
        }
    }
}

impl error::Error for Error {}

impl From<String> for Error {
    fn from(desc: String) -> Error {
        Error::new(desc)
    }
}

impl<'a> From<&'a str> for Error {
    fn from(desc: &'a str) -> Error {
        Error::new(String::from(desc))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::String(ref desc) => f.write_str(desc),
            Error::KindMismatch { expected, found } => write!(f,
                "element kind mismatch (expected: {}, found: {})", expected, found),
            Error::LengthMismatch { expected, found } => write!(f,
                "length mismatch (expected: {}, found: {})", expected, found),
            Error::StrideMismatch { expected, found } => write!(f,
                "elements-per-item mismatch (expected: {}, found: {})", expected, found),
            Error::Driver { code, ref message } => write!(f,
                "driver error [{}]: {}", code, message),
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
