pub mod buffer;
pub mod child;
pub mod codec;
pub mod parent;
pub mod wire;

pub use self::child::{ChildConnection, ResponseContext};
pub use self::parent::{ParentConnection, QueryContext, SendHalf};
pub use self::wire::{WireError, WireResult};

/// Decoder state of a connection. Everything starts out waiting for a frame
/// header; end of stream is terminal.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ReadState {
    Waiting,
    Closed,
}
