use futures::stream::{self, Stream};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// Serialized frame shared by every connection it is delivered to.
pub type Frame = Arc<str>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Outbound buffer overflowed.
    SlowConsumer,
    IdleTimeout,
    Shutdown,
}

impl CloseReason {
    pub fn description(&self) -> &'static str {
        match self {
            CloseReason::SlowConsumer => "outbound buffer full",
            CloseReason::IdleTimeout => "idle timeout",
            CloseReason::Shutdown => "server shutting down",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PushError {
    Full,
    Closed,
}

/// Sending half of a connection's bounded outbound buffer.
///
/// Cloning yields another handle to the same connection, which lets one
/// socket be registered under several topics.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    tx: mpsc::Sender<Frame>,
    close_tx: Arc<watch::Sender<Option<CloseReason>>>,
}

/// Receiving half owned by the connection task.
#[derive(Debug)]
pub struct OutboundReceiver {
    rx: mpsc::Receiver<Frame>,
    close_rx: watch::Receiver<Option<CloseReason>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Frame(Frame),
    /// The registry asked the connection to close, or every handle is gone.
    Closed(Option<CloseReason>),
}

/// Create a connection's outbound buffer with room for `capacity` frames.
pub fn channel(capacity: usize) -> (ConnectionHandle, OutboundReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let (close_tx, close_rx) = watch::channel(None);
    (
        ConnectionHandle {
            tx,
            close_tx: Arc::new(close_tx),
        },
        OutboundReceiver { rx, close_rx },
    )
}

impl ConnectionHandle {
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed() || self.close_tx.borrow().is_some()
    }

    pub(crate) fn try_push(&self, frame: Frame) -> Result<(), PushError> {
        match self.tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(PushError::Full),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(PushError::Closed),
        }
    }

    /// Ask the owning task to close. The first reason wins.
    pub(crate) fn close(&self, reason: CloseReason) {
        self.close_tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });
    }
}

impl OutboundReceiver {
    /// Next frame, or the close signal. A pending close takes priority over
    /// buffered frames.
    pub async fn recv(&mut self) -> Outbound {
        if let Some(reason) = *self.close_rx.borrow() {
            return Outbound::Closed(Some(reason));
        }

        tokio::select! {
            biased;
            changed = self.close_rx.changed() => match changed {
                Ok(()) => Outbound::Closed(*self.close_rx.borrow_and_update()),
                Err(_) => match self.rx.recv().await {
                    Some(frame) => Outbound::Frame(frame),
                    None => Outbound::Closed(None),
                },
            },
            frame = self.rx.recv() => match frame {
                Some(frame) => Outbound::Frame(frame),
                None => Outbound::Closed(*self.close_rx.borrow()),
            },
        }
    }

    /// Stream of frames that ends after yielding the close signal once.
    pub fn into_stream(self) -> impl Stream<Item = Outbound> + Unpin + Send + 'static {
        Box::pin(stream::unfold(Some(self), |state| async move {
            let mut receiver = state?;
            match receiver.recv().await {
                frame @ Outbound::Frame(_) => Some((frame, Some(receiver))),
                closed @ Outbound::Closed(_) => Some((closed, None)),
            }
        }))
    }
}
