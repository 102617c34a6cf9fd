use crate::commitlog::Position;
use crate::replica::Term;
use bytes::Bytes;
use tokio::sync::mpsc;

pub(super) struct CommitStreamPublisher {
    sender: mpsc::UnboundedSender<CommittedEntry>,
}

/// CommitStream delivers committed application entries, in log order.
pub struct CommitStream {
    receiver: mpsc::UnboundedReceiver<CommittedEntry>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommittedEntry {
    pub term: Term,
    pub position: Position,
    pub data: Bytes,
}

pub(super) fn new() -> (CommitStreamPublisher, CommitStream) {
    let (tx, rx) = mpsc::unbounded_channel();

    let publisher = CommitStreamPublisher { sender: tx };
    let stream = CommitStream { receiver: rx };

    (publisher, stream)
}

impl CommitStreamPublisher {
    pub(super) fn notify_commit(&self, logger: &slog::Logger, term: Term, position: Position, data: Bytes) {
        let committed_entry = CommittedEntry { term, position, data };

        if self.sender.send(committed_entry).is_err() {
            slog::warn!(logger, "CommitStream has disconnected.");
        }
    }
}

impl CommitStream {
    /// Next committed entry. `None` once the replica is gone.
    pub async fn next(&mut self) -> Option<CommittedEntry> {
        self.receiver.recv().await
    }

    /// Non-blocking variant of `next()`.
    pub fn try_next(&mut self) -> Option<CommittedEntry> {
        self.receiver.try_recv().ok()
    }
}
