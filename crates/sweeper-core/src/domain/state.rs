//! Worker state machine.

use std::fmt;

/// Lifecycle of a [`DeleteWorker`](crate::app::DeleteWorker).
///
/// State transitions:
/// - Disconnected -> Connecting -> Consuming
/// - Connecting -> Disconnected (reconnect or consumer registration failed, back off)
/// - Consuming -> Disconnected (delivery stream ended, reconnect)
/// - Connecting | Consuming -> Draining -> Stopped (stop requested)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerState {
    /// No usable connection; waiting to (re)connect.
    Disconnected,

    /// Reconnecting and registering the consumer.
    Connecting,

    /// Receiving and processing deliveries.
    Consuming,

    /// Stop requested; finishing the current delivery and closing.
    Draining,

    /// Connection closed, loop exited.
    Stopped,
}

impl WorkerState {
    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkerState::Stopped)
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkerState::Disconnected => "disconnected",
            WorkerState::Connecting => "connecting",
            WorkerState::Consuming => "consuming",
            WorkerState::Draining => "draining",
            WorkerState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::disconnected(WorkerState::Disconnected, false)]
    #[case::connecting(WorkerState::Connecting, false)]
    #[case::consuming(WorkerState::Consuming, false)]
    #[case::draining(WorkerState::Draining, false)]
    #[case::stopped(WorkerState::Stopped, true)]
    fn only_stopped_is_terminal(#[case] state: WorkerState, #[case] terminal: bool) {
        assert_eq!(state.is_terminal(), terminal);
    }

    #[test]
    fn displays_snake_case() {
        assert_eq!(WorkerState::Draining.to_string(), "draining");
    }
}
