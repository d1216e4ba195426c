//! Single-outstanding-command master for a driver's serial line.

use std::{collections::VecDeque, fmt::Debug, io, mem, time::Duration};

use snafu::Snafu;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf, split},
    select,
    sync::{mpsc, oneshot},
    time::{Instant, sleep_until},
};
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::packets::{DecodeError, encode_request};

#[derive(Debug, Snafu)]
pub enum MasterError {
    #[snafu(display("no response within {timeout:?}"))]
    Timeout { timeout: Duration },
    #[snafu(display("invalid response: {source}"))]
    InvalidResponse { source: DecodeError },
    #[snafu(transparent)]
    Io { source: io::Error },
    #[snafu(display("the byte stream was closed"))]
    Disconnected,
    #[snafu(display("the protocol master was destroyed"))]
    Destroyed,
}

/// A single request/response exchange with a driver.
pub trait Command: Send + 'static {
    type Output: Send + 'static;

    fn opcode(&self) -> u8;

    fn payload(&self) -> Vec<u8> {
        Vec::new()
    }

    /// Total length of the reply frame, in bytes.
    fn response_len(&self) -> usize;

    fn decode(&self, address: u8, response: &[u8]) -> Result<Self::Output, DecodeError>;
}

#[derive(Debug, Clone, Copy)]
pub struct MasterOptions {
    /// Bus address of the driver unit.
    pub address: u8,
    /// How long to wait for a complete reply.
    pub timeout: Duration,
}

impl Default for MasterOptions {
    fn default() -> Self {
        Self {
            address: 0x01,
            timeout: Duration::from_millis(200),
        }
    }
}

/// Opens a serial port as a byte stream for a [`ProtocolMaster`].
pub fn open_serial(path: &str, baud: u32) -> Result<SerialStream, MasterError> {
    tokio_serial::new(path, baud)
        .timeout(Duration::from_millis(100))
        .open_native_async()
        .map_err(|e| io::Error::other(format!("open {path}: {e}")).into())
}

type Completion = Box<dyn FnOnce(Result<Vec<u8>, MasterError>) + Send>;

struct Pending {
    frame: Vec<u8>,
    response_len: usize,
    complete: Completion,
}

/// Handle to a protocol session running on its own task.
///
/// Commands are executed strictly FIFO with at most one in flight. Every
/// command resolves exactly once: with its decoded reply, a timeout, or an
/// invalid-response error. Handles are cheap to clone; the session ends when
/// [`destroy`](Self::destroy) is called or every handle is dropped.
#[derive(Clone)]
pub struct ProtocolMaster {
    address: u8,
    requests: mpsc::UnboundedSender<Pending>,
    shutdown: CancellationToken,
}

impl Debug for ProtocolMaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolMaster")
            .field("address", &self.address)
            .field("destroyed", &self.shutdown.is_cancelled())
            .finish()
    }
}

impl ProtocolMaster {
    /// Takes exclusive ownership of `stream` for the lifetime of the session.
    pub fn new<S>(stream: S, options: MasterOptions) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (requests, incoming) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let session = Session::new(stream, options.timeout, incoming, shutdown.clone());
        tokio::spawn(session.run());

        Self {
            address: options.address,
            requests,
            shutdown,
        }
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    /// Queues `command` and waits for its completion.
    pub async fn execute<C: Command>(&self, command: C) -> Result<C::Output, MasterError> {
        if self.is_destroyed() {
            return Err(MasterError::Destroyed);
        }

        let (tx, rx) = oneshot::channel();
        let address = self.address;
        let frame = encode_request(address, command.opcode(), &command.payload());
        let response_len = command.response_len();

        let complete: Completion = Box::new(move |result| {
            let result = result.and_then(|response| {
                command
                    .decode(address, &response)
                    .map_err(|source| MasterError::InvalidResponse { source })
            });
            _ = tx.send(result);
        });

        self.requests
            .send(Pending {
                frame,
                response_len,
                complete,
            })
            .map_err(|_| MasterError::Destroyed)?;

        // The session drops queued completions without calling them on destroy.
        rx.await.unwrap_or(Err(MasterError::Destroyed))
    }

    /// Stops the session: the stream is released, the timer disarmed and
    /// the queue dropped. Calling it again is a no-op.
    pub fn destroy(&self) {
        self.shutdown.cancel();
    }

    pub fn is_destroyed(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

struct Session<S> {
    reader: ReadHalf<S>,
    writer: WriteHalf<S>,
    timeout: Duration,
    incoming: mpsc::UnboundedReceiver<Pending>,
    queue: VecDeque<Pending>,
    current: Option<Pending>,
    /// Request bytes of `current` not yet accepted by the stream.
    outgoing: Option<Outgoing>,
    buffer: Vec<u8>,
    deadline: Option<Instant>,
    disconnected: bool,
    shutdown: CancellationToken,
}

struct Outgoing {
    frame: Vec<u8>,
    sent: usize,
}

enum Sent {
    Bytes(usize),
    Flushed,
}

/// Moves the transmission forward by one write, or flushes once the whole
/// frame is written. Never resolves when there is nothing to send.
async fn send_step<W>(writer: &mut W, outgoing: Option<&Outgoing>) -> io::Result<Sent>
where
    W: AsyncWrite + Unpin,
{
    let Some(outgoing) = outgoing else {
        return std::future::pending().await;
    };

    let rest = &outgoing.frame[outgoing.sent..];
    if rest.is_empty() {
        writer.flush().await?;
        return Ok(Sent::Flushed);
    }
    match writer.write(rest).await? {
        0 => Err(io::ErrorKind::WriteZero.into()),
        n => Ok(Sent::Bytes(n)),
    }
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    fn new(
        stream: S,
        timeout: Duration,
        incoming: mpsc::UnboundedReceiver<Pending>,
        shutdown: CancellationToken,
    ) -> Self {
        let (reader, writer) = split(stream);
        Self {
            reader,
            writer,
            timeout,
            incoming,
            queue: VecDeque::new(),
            current: None,
            outgoing: None,
            buffer: Vec::with_capacity(64),
            deadline: None,
            disconnected: false,
            shutdown,
        }
    }

    async fn run(mut self) {
        let mut chunk = [0u8; 256];

        loop {
            self.advance();

            let deadline = self.deadline;
            select! {
                biased;

                _ = self.shutdown.cancelled() => break,

                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.time_out();
                }

                read = self.reader.read(&mut chunk), if !self.disconnected => match read {
                    Ok(0) => self.disconnect(None),
                    Ok(n) => self.receive(&chunk[..n]),
                    Err(e) => self.disconnect(Some(e)),
                },

                sent = send_step(&mut self.writer, self.outgoing.as_ref()), if self.outgoing.is_some() => {
                    self.sent(sent);
                }

                request = self.incoming.recv() => match request {
                    Some(pending) => self.queue.push_back(pending),
                    // Every handle is gone, nobody is waiting for replies.
                    None => break,
                },
            }
        }

        debug!(
            queued = self.queue.len(),
            in_flight = self.current.is_some(),
            "protocol session closed"
        );
    }

    /// Starts transmission of the next queued command if none is in flight.
    ///
    /// The deadline covers both sending the request and receiving the reply.
    fn advance(&mut self) {
        while self.current.is_none() {
            let Some(mut next) = self.queue.pop_front() else {
                return;
            };

            if self.disconnected {
                (next.complete)(Err(MasterError::Disconnected));
                continue;
            }

            // Bytes from an abandoned exchange must not leak into this one.
            self.buffer.clear();

            trace!(frame = ?next.frame, "transmitting command");
            self.outgoing = Some(Outgoing {
                frame: mem::take(&mut next.frame),
                sent: 0,
            });
            self.deadline = Some(Instant::now() + self.timeout);
            self.current = Some(next);
        }
    }

    fn sent(&mut self, sent: io::Result<Sent>) {
        match sent {
            Ok(Sent::Bytes(n)) => {
                if let Some(outgoing) = &mut self.outgoing {
                    outgoing.sent += n;
                }
            }
            Ok(Sent::Flushed) => {
                self.outgoing = None;
                self.try_complete();
            }
            Err(e) => {
                warn!(error = %e, "failed to transmit command");
                self.outgoing = None;
                self.deadline = None;
                if let Some(current) = self.current.take() {
                    (current.complete)(Err(e.into()));
                }
            }
        }
    }

    fn receive(&mut self, bytes: &[u8]) {
        if self.current.is_none() {
            trace!(?bytes, "discarding bytes received while idle");
            return;
        }

        self.buffer.extend_from_slice(bytes);
        self.try_complete();
    }

    /// Completes the current command once its request is sent and the
    /// reply is complete.
    fn try_complete(&mut self) {
        if self.outgoing.is_some() {
            return;
        }
        let received = self.buffer.len();
        let Some(current) = self.current.take_if(|c| received >= c.response_len) else {
            return;
        };

        self.deadline = None;
        if received > current.response_len {
            debug!(
                surplus = received - current.response_len,
                "discarding bytes past the expected reply"
            );
        }
        let response = self.buffer[..current.response_len].to_vec();
        self.buffer.clear();

        trace!(?response, "received reply");
        (current.complete)(Ok(response));
    }

    fn time_out(&mut self) {
        self.deadline = None;
        if let Some(unsent) = self.outgoing.take() {
            warn!(
                sent = unsent.sent,
                len = unsent.frame.len(),
                "command timed out while transmitting"
            );
        }
        if let Some(current) = self.current.take() {
            debug!(
                received = self.buffer.len(),
                expected = current.response_len,
                "command timed out"
            );
            self.buffer.clear();
            (current.complete)(Err(MasterError::Timeout {
                timeout: self.timeout,
            }));
        }
    }

    fn disconnect(&mut self, error: Option<io::Error>) {
        match &error {
            Some(e) => warn!(error = %e, "byte stream failed"),
            None => warn!("byte stream closed"),
        }
        self.disconnected = true;
        self.deadline = None;
        self.outgoing = None;

        if let Some(current) = self.current.take() {
            (current.complete)(Err(match error {
                Some(source) => MasterError::Io { source },
                None => MasterError::Disconnected,
            }));
        }
    }
}
