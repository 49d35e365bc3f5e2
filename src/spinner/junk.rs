//! Leftover loop state found after a run.

use std::fmt;

use crate::reactor::{HandleId, HandleInfo};

/// Something the reactor still held when a run finished.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Junk {
    /// A delayed call that had not fired. It has been cancelled.
    DelayedCall(HandleInfo),
    /// A call queued for an iteration that never came. It has been dropped.
    PendingCall(HandleInfo),
    /// A watched I/O source. It has been deregistered, not closed.
    Selectable(HandleInfo),
    /// A spawned task that had not completed. It has been dropped.
    Task(HandleInfo),
    /// A worker thread still running after the grace period. It has been detached.
    Thread(HandleInfo),
}

impl Junk {
    /// Details of the leftover handle.
    #[must_use]
    pub fn info(&self) -> &HandleInfo {
        match self {
            Self::DelayedCall(info)
            | Self::PendingCall(info)
            | Self::Selectable(info)
            | Self::Task(info)
            | Self::Thread(info) => info,
        }
    }

    /// The leftover handle's identifier.
    #[must_use]
    pub fn id(&self) -> HandleId {
        self.info().id
    }

    /// Formats a list of junk as `[a, b, ...]`.
    #[must_use]
    pub fn describe_all(junk: &[Junk]) -> String {
        let items: Vec<String> = junk.iter().map(ToString::to_string).collect();
        format!("[{}]", items.join(", "))
    }
}

impl fmt::Display for Junk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self.info(), f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(description: &str) -> HandleInfo {
        HandleInfo {
            id: HandleId::next(),
            description: description.to_string(),
        }
    }

    #[test]
    fn test_describe_all() {
        let timer = Junk::DelayedCall(info("delayed call to f"));
        let port = Junk::Selectable(info("TCP port listening on 127.0.0.1:80"));
        let described = Junk::describe_all(&[timer.clone(), port.clone()]);
        assert_eq!(
            described,
            format!("[delayed call to f {}, TCP port listening on 127.0.0.1:80 {}]", timer.id(), port.id())
        );
        assert_eq!(Junk::describe_all(&[]), "[]");
    }

    #[test]
    fn test_id_matches_info() {
        let junk = Junk::Thread(info("thread \"w\""));
        assert_eq!(junk.id(), junk.info().id);
    }
}
