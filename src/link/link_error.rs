use std::fmt::{Display, Formatter};

/// Which of the link's two loops an error occurred in
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Direction {
    Send,
    Receive,
}

impl Display for Direction {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Send => write!(f, "send"),
            Direction::Receive => write!(f, "receive"),
        }
    }
}

#[derive(Debug)]
pub enum LinkError {
    /// OS level failure on a receive. This terminates the receive loop.
    SocketReceive(std::io::Error),
    /// OS level failure on a send. The payload is dropped, there is no retry.
    SocketSend(std::io::Error),
    /// Dequeuing from an empty outbound queue. This is a bug in the caller, never a runtime
    ///  condition.
    EmptyQueueAccess,
}

impl LinkError {
    pub fn direction(&self) -> Direction {
        match self {
            LinkError::SocketReceive(_) => Direction::Receive,
            LinkError::SocketSend(_) | LinkError::EmptyQueueAccess => Direction::Send,
        }
    }
}

impl Display for LinkError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkError::SocketReceive(e) => write!(f, "error receiving: {}", e),
            LinkError::SocketSend(e) => write!(f, "error sending: {}", e),
            LinkError::EmptyQueueAccess => write!(f, "dequeue on an empty outbound queue"),
        }
    }
}

impl std::error::Error for LinkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LinkError::SocketReceive(e) | LinkError::SocketSend(e) => Some(e),
            LinkError::EmptyQueueAccess => None,
        }
    }
}
