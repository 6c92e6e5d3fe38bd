use std::fmt;
use std::io;

/// Transport-level error split. `Wait` is the non-blocking "come back later"
/// signal, `Closed` is an orderly end of stream, `Io` is everything fatal.
#[derive(Debug)]
pub enum WireError {
    Wait,
    Closed,
    Io(io::Error),
}

pub type WireResult<T> = Result<T, WireError>;

impl From<io::Error> for WireError {
    fn from(err: io::Error) -> WireError {
        match err.kind() {
            io::ErrorKind::WouldBlock => WireError::Wait,
            io::ErrorKind::Interrupted => WireError::Wait,
            _ => WireError::Io(err),
        }
    }
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            WireError::Wait => write!(f, "operation would block"),
            WireError::Closed => write!(f, "peer closed the stream"),
            WireError::Io(err) => write!(f, "socket error: {}", err),
        }
    }
}
