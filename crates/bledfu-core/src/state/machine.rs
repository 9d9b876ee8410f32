//! State machine for one DFU upload.

use std::fmt;

/// Protocol state of the upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DfuState {
    #[default]
    Idle,
    AwaitingStart,
    SizeSent,
    AwaitingSizeAck,
    ReceiveModeSet,
    Streaming,
    AwaitingFinalAck,
    Validating,
    AwaitingValidateAck,
    Activating,
    Done,
    /// Terminal state after any failure.
    Aborted,
}

impl fmt::Display for DfuState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DfuState::Idle => write!(f, "IDLE"),
            DfuState::AwaitingStart => write!(f, "AWAITING_START"),
            DfuState::SizeSent => write!(f, "SIZE_SENT"),
            DfuState::AwaitingSizeAck => write!(f, "AWAITING_SIZE_ACK"),
            DfuState::ReceiveModeSet => write!(f, "RECEIVE_MODE_SET"),
            DfuState::Streaming => write!(f, "STREAMING"),
            DfuState::AwaitingFinalAck => write!(f, "AWAITING_FINAL_ACK"),
            DfuState::Validating => write!(f, "VALIDATING"),
            DfuState::AwaitingValidateAck => write!(f, "AWAITING_VALIDATE_ACK"),
            DfuState::Activating => write!(f, "ACTIVATING"),
            DfuState::Done => write!(f, "DONE"),
            DfuState::Aborted => write!(f, "ABORTED"),
        }
    }
}

impl DfuState {
    /// Check if no further transition is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, DfuState::Done | DfuState::Aborted)
    }

    /// Check if the sequence is blocked on an acknowledgment here.
    pub fn is_ack_wait(&self) -> bool {
        matches!(
            self,
            DfuState::AwaitingSizeAck | DfuState::AwaitingFinalAck | DfuState::AwaitingValidateAck
        )
    }

    /// Legal successor on the happy path.
    pub fn next(&self) -> Option<DfuState> {
        Some(match self {
            DfuState::Idle => DfuState::AwaitingStart,
            DfuState::AwaitingStart => DfuState::SizeSent,
            DfuState::SizeSent => DfuState::AwaitingSizeAck,
            DfuState::AwaitingSizeAck => DfuState::ReceiveModeSet,
            DfuState::ReceiveModeSet => DfuState::Streaming,
            DfuState::Streaming => DfuState::AwaitingFinalAck,
            DfuState::AwaitingFinalAck => DfuState::Validating,
            DfuState::Validating => DfuState::AwaitingValidateAck,
            DfuState::AwaitingValidateAck => DfuState::Activating,
            DfuState::Activating => DfuState::Done,
            DfuState::Done | DfuState::Aborted => return None,
        })
    }
}

/// Mutable state of one upload attempt.
#[derive(Debug, Default)]
pub struct SessionState {
    /// Current protocol state.
    pub state: DfuState,
    /// Image bytes written to the packet characteristic.
    pub bytes_sent: usize,
    /// Data packets written.
    pub packets_sent: usize,
    /// Packets written since the last acknowledgment.
    pub packets_since_ack: usize,
    /// Acknowledgments consumed.
    pub acks_received: usize,
    /// Acknowledgments armed for and not yet received.
    pub acks_expected: usize,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance along the happy path.
    ///
    /// Returns false, leaving the state untouched, if `new_state` is not the
    /// successor of the current one.
    pub fn goto_state(&mut self, new_state: DfuState) -> bool {
        if self.state.next() != Some(new_state) {
            tracing::error!(from = %self.state, to = %new_state, "Illegal state transition");
            return false;
        }
        tracing::info!(from = %self.state, to = %new_state, "State transition");
        self.state = new_state;
        true
    }

    /// Enter the terminal failure state.
    pub fn abort(&mut self) {
        if self.state != DfuState::Aborted {
            tracing::warn!(from = %self.state, "Session aborted");
            self.state = DfuState::Aborted;
        }
        self.acks_expected = 0;
    }

    pub fn record_packet(&mut self, len: usize) {
        self.bytes_sent += len;
        self.packets_sent += 1;
        self.packets_since_ack += 1;
    }

    pub fn record_ack(&mut self) {
        self.acks_received += 1;
        self.packets_since_ack = 0;
        self.acks_expected = self.acks_expected.saturating_sub(1);
    }

    /// Check if the upload finished successfully.
    pub fn is_complete(&self) -> bool {
        self.state == DfuState::Done
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_order() {
        let mut ctx = SessionState::new();
        let mut visited = vec![ctx.state];
        while let Some(next) = ctx.state.next() {
            assert!(ctx.goto_state(next));
            visited.push(next);
        }
        assert_eq!(visited.len(), 11);
        assert_eq!(visited[4], DfuState::ReceiveModeSet);
        assert!(ctx.is_complete());
        assert!(ctx.state.is_terminal());
    }

    #[test]
    fn test_illegal_transition_rejected() {
        let mut ctx = SessionState::new();
        assert!(!ctx.goto_state(DfuState::Streaming));
        assert_eq!(ctx.state, DfuState::Idle);
    }

    #[test]
    fn test_abort_is_terminal() {
        let mut ctx = SessionState::new();
        ctx.goto_state(DfuState::AwaitingStart);
        ctx.acks_expected = 2;
        ctx.abort();
        assert_eq!(ctx.state, DfuState::Aborted);
        assert_eq!(ctx.acks_expected, 0);
        assert_eq!(ctx.state.next(), None);
        assert!(!ctx.goto_state(DfuState::SizeSent));
    }

    #[test]
    fn test_counters() {
        let mut ctx = SessionState::new();
        ctx.record_packet(20);
        ctx.record_packet(5);
        assert_eq!(ctx.bytes_sent, 25);
        assert_eq!(ctx.packets_since_ack, 2);
        ctx.record_ack();
        assert_eq!(ctx.packets_since_ack, 0);
        assert_eq!(ctx.acks_received, 1);
    }

    #[test]
    fn test_display() {
        assert_eq!(DfuState::AwaitingSizeAck.to_string(), "AWAITING_SIZE_ACK");
        assert!(DfuState::AwaitingFinalAck.is_ack_wait());
        assert!(!DfuState::Streaming.is_ack_wait());
    }
}
