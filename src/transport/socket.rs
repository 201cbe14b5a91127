//! Socket task and transport events.
//!
//! One task is spawned per connection attempt. It owns the `TcpStream` for
//! that attempt and translates socket lifecycle changes into the uniform
//! [`TransportEvent`] type consumed by the state machine.
//!
//! Event ordering guarantees:
//!
//! - `Connected` is emitted at most once, before any `Data`
//! - `Closed` is the final event of every attempt (connect failure, remote
//!   close, IO error, and destroy all end with `Closed`)
//! - a released socket (dropped [`SocketHandle`]) emits nothing further

// ============================================================================
// Imports
// ============================================================================

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::identifiers::SocketGeneration;

// ============================================================================
// Constants
// ============================================================================

/// Read buffer size for one socket receive.
const READ_BUFFER_SIZE: usize = 4096;

// ============================================================================
// TransportEvent
// ============================================================================

/// Socket lifecycle events forwarded to the state machine.
///
/// Exactly five kinds, each tagged with the generation of the socket attempt
/// that produced it so the machine can discard stale deliveries.
#[derive(Debug)]
pub(crate) enum TransportEvent {
    /// The TCP connection is established.
    Connected {
        /// Socket attempt that produced this event.
        generation: SocketGeneration,
    },

    /// Bytes arrived from the instrument.
    Data {
        /// Socket attempt that produced this event.
        generation: SocketGeneration,
        /// Raw received bytes.
        bytes: Vec<u8>,
    },

    /// The instrument half-closed the stream (end of input).
    End {
        /// Socket attempt that produced this event.
        generation: SocketGeneration,
    },

    /// The socket is fully closed; no further events follow.
    Closed {
        /// Socket attempt that produced this event.
        generation: SocketGeneration,
    },

    /// The socket failed.
    ///
    /// Always followed by `Closed`.
    Error {
        /// Socket attempt that produced this event.
        generation: SocketGeneration,
        /// The transport failure.
        error: Error,
    },
}

impl TransportEvent {
    /// Returns the generation of the socket that produced this event.
    #[inline]
    pub(crate) fn generation(&self) -> SocketGeneration {
        match self {
            Self::Connected { generation }
            | Self::Data { generation, .. }
            | Self::End { generation }
            | Self::Closed { generation }
            | Self::Error { generation, .. } => *generation,
        }
    }

    /// Returns the event kind name for logging.
    #[inline]
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "socket connected",
            Self::Data { .. } => "socket data",
            Self::End { .. } => "socket end",
            Self::Closed { .. } => "socket close",
            Self::Error { .. } => "socket error",
        }
    }
}

// ============================================================================
// SocketCtrl
// ============================================================================

/// Control messages from the state machine into the socket task.
enum SocketCtrl {
    /// Write one line (newline appended by the task).
    WriteLine {
        /// Text to send, without the trailing newline.
        line: String,
        /// Resolved once the write has flushed, when the caller cares.
        flushed: Option<oneshot::Sender<Result<()>>>,
    },

    /// Drop the stream immediately and emit `Closed`.
    Destroy,
}

// ============================================================================
// SocketHandle
// ============================================================================

/// Handle to one socket attempt's task.
///
/// Dropping the handle releases the socket: the task exits and emits no
/// further events.
#[derive(Debug)]
pub(crate) struct SocketHandle {
    /// Generation of this attempt.
    generation: SocketGeneration,
    /// Control channel into the socket task.
    ctrl_tx: mpsc::UnboundedSender<SocketCtrl>,
}

impl SocketHandle {
    /// Spawns the socket task for one connection attempt.
    pub(crate) fn open(
        generation: SocketGeneration,
        host: String,
        port: u16,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Self {
        let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel();

        tokio::spawn(run_socket(generation, host, port, ctrl_rx, events));

        Self {
            generation,
            ctrl_tx,
        }
    }

    /// Returns the generation of this attempt.
    #[inline]
    pub(crate) const fn generation(&self) -> SocketGeneration {
        self.generation
    }

    /// Requests one line write.
    ///
    /// `flushed` resolves once the bytes have flushed to the kernel, which
    /// is what command completion means on this protocol.
    pub(crate) fn write_line(&self, line: String, flushed: Option<oneshot::Sender<Result<()>>>) {
        if self
            .ctrl_tx
            .send(SocketCtrl::WriteLine { line, flushed })
            .is_err()
        {
            warn!(generation = %self.generation, "write requested on finished socket task");
        }
    }

    /// Destroys the socket.
    ///
    /// The task drops the stream, emits `Closed`, and exits.
    pub(crate) fn destroy(&self) {
        if self.ctrl_tx.send(SocketCtrl::Destroy).is_err() {
            debug!(generation = %self.generation, "destroy requested on finished socket task");
        }
    }
}

// ============================================================================
// Socket Task
// ============================================================================

/// Dials the instrument and runs the IO loop for one attempt.
async fn run_socket(
    generation: SocketGeneration,
    host: String,
    port: u16,
    mut ctrl_rx: mpsc::UnboundedReceiver<SocketCtrl>,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    debug!(generation = %generation, host = %host, port, "opening socket");

    let stream = match TcpStream::connect((host.as_str(), port)).await {
        Ok(stream) => stream,
        Err(error) => {
            warn!(generation = %generation, error = %error, "socket connect failed");
            let _ = events.send(TransportEvent::Error {
                generation,
                error: Error::connection(error.to_string()),
            });
            let _ = events.send(TransportEvent::Closed { generation });
            return;
        }
    };

    debug!(generation = %generation, "socket connected");
    let _ = events.send(TransportEvent::Connected { generation });

    let (mut reader, mut writer) = stream.into_split();
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];

    loop {
        tokio::select! {
            read = reader.read(&mut buffer) => match read {
                Ok(0) => {
                    debug!(generation = %generation, "socket end of stream");
                    let _ = events.send(TransportEvent::End { generation });
                    let _ = events.send(TransportEvent::Closed { generation });
                    return;
                }
                Ok(count) => {
                    trace!(generation = %generation, bytes = count, "socket data");
                    let _ = events.send(TransportEvent::Data {
                        generation,
                        bytes: buffer[..count].to_vec(),
                    });
                }
                Err(error) => {
                    warn!(generation = %generation, error = %error, "socket read failed");
                    let _ = events.send(TransportEvent::Error {
                        generation,
                        error: Error::connection(error.to_string()),
                    });
                    let _ = events.send(TransportEvent::Closed { generation });
                    return;
                }
            },

            ctrl = ctrl_rx.recv() => match ctrl {
                Some(SocketCtrl::WriteLine { line, flushed }) => {
                    match write_line(&mut writer, &line).await {
                        Ok(()) => {
                            trace!(generation = %generation, line = %line, "line written");
                            if let Some(ack) = flushed {
                                let _ = ack.send(Ok(()));
                            }
                        }
                        Err(error) => {
                            warn!(generation = %generation, error = %error, "socket write failed");
                            let message = error.to_string();
                            if let Some(ack) = flushed {
                                let _ = ack.send(Err(Error::Io(error)));
                            }
                            let _ = events.send(TransportEvent::Error {
                                generation,
                                error: Error::connection(message),
                            });
                            let _ = events.send(TransportEvent::Closed { generation });
                            return;
                        }
                    }
                }

                Some(SocketCtrl::Destroy) => {
                    debug!(generation = %generation, "socket destroyed");
                    let _ = events.send(TransportEvent::Closed { generation });
                    return;
                }

                // Handle dropped: the socket was released, emit nothing.
                None => {
                    trace!(generation = %generation, "socket released");
                    return;
                }
            },
        }
    }
}

/// Writes one line with the outbound newline terminator, then flushes.
async fn write_line(writer: &mut OwnedWriteHalf, line: &str) -> std::io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}

// ============================================================================
// Tests
// ============================================================================
