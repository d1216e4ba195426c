//! Delegation of [`StationInterface`] calls to another process.
//!
//! This module contains utilities for either delegating station requests
//! to the daemon or configuring your own process to accept those requests
//! using an implementation of [`StationInterface`].
//!
//! This is implemented using OS inter-process communication APIs under
//! the hood, but this is all abstracted away using [`StationConnection`]
//! (client) and [`StationListener`] (server). Messages are newline
//! delimited JSON.

use std::{fmt::Debug, io::ErrorKind, sync::Arc};

use interprocess::local_socket::{
    GenericNamespaced, ListenerOptions, Name, ToNsName,
    tokio::{Listener, RecvHalf, SendHalf, Stream, prelude::*},
};
use serde::{Deserialize, Serialize};
use snafu::{IntoError, ResultExt, Snafu};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter},
    select,
    sync::{Mutex, mpsc},
};
use tracing::{debug, error, info, trace};

pub use self::format::{CompletionResponse, ProgressResponse, StationCommand};
use crate::{
    ProgramOutcome, ProgramProgress, ProgramRequest, ScanOutcome, StationInterface, StationStatus,
    error::{RemoteError, Result, SerializeError, SerializeSnafu},
};

mod format;

/// Name of the socket the station daemon listens on.
pub const SOCKET_NAME: &str = "drv-stationd.sock";

#[derive(Debug, Snafu)]
pub enum ConnectionError {
    #[snafu(transparent)]
    SerializeMsg { source: SerializeError },
    #[snafu(transparent)]
    Remote { source: RemoteError },
    #[snafu(transparent)]
    Io { source: io::Error },
    #[snafu(display("Cannot listen for connections because another station daemon is running"))]
    ExistingServer { source: io::Error },
    #[snafu(display("The station daemon closed the connection"))]
    Closed,
}

fn socket_name(name: &str) -> io::Result<Name<'_>> {
    name.to_ns_name::<GenericNamespaced>()
}

struct BufStream {
    reader: BufReader<RecvHalf>,
    writer: BufWriter<SendHalf>,
}

impl BufStream {
    fn new(stream: Stream) -> Self {
        let (reader, writer) = stream.split();
        Self {
            reader: BufReader::new(reader),
            writer: BufWriter::new(writer),
        }
    }

    async fn write_line<T: Serialize>(&mut self, message: &T) -> Result<(), ConnectionError> {
        let mut content =
            serde_json::to_vec(message).context(SerializeSnafu { deserialize: false })?;
        content.push(b'\n');
        self.writer.write_all(&content).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

/// A connection to the station daemon.
///
/// This struct implements [`StationInterface`] by asking the daemon
/// to do the work for it. Requests on one connection are answered in
/// order, so concurrent callers share it through a lock.
pub struct StationConnection {
    stream: Mutex<BufStream>,
}

impl StationConnection {
    /// Connect to the running station daemon.
    pub async fn new() -> Result<Self, ConnectionError> {
        Self::connect_to(SOCKET_NAME).await
    }

    pub async fn connect_to(name: &str) -> Result<Self, ConnectionError> {
        let stream = Stream::connect(socket_name(name)?).await?;

        Ok(Self {
            stream: Mutex::new(BufStream::new(stream)),
        })
    }

    async fn request<T: for<'a> Deserialize<'a>>(
        &self,
        cmd: &StationCommand,
    ) -> Result<T, ConnectionError> {
        let mut stream = self.stream.lock().await;
        stream.write_line(cmd).await?;
        let response: CompletionResponse<T> = recv(&mut stream).await?;
        Ok(response?)
    }
}

async fn recv<T: for<'a> Deserialize<'a>>(stream: &mut BufStream) -> Result<T, ConnectionError> {
    let mut response = String::new();
    if stream.reader.read_line(&mut response).await? == 0 {
        return Err(ConnectionError::Closed);
    }
    let response = serde_json::from_str(&response).context(SerializeSnafu { deserialize: true })?;
    Ok(response)
}

impl StationInterface for StationConnection {
    async fn program(
        &self,
        request: ProgramRequest,
        mut handle_progress: impl FnMut(ProgramProgress) + Send,
    ) -> Result<ProgramOutcome> {
        let mut stream = self.stream.lock().await;
        stream.write_line(&StationCommand::Program(request)).await?;

        loop {
            match recv(&mut stream).await? {
                ProgressResponse::Progress(progress) => handle_progress(progress),
                ProgressResponse::Complete(response) => return Ok(response?),
            }
        }
    }

    async fn cancel(&self) -> Result {
        self.request::<()>(&StationCommand::Cancel).await?;
        Ok(())
    }

    async fn scan(&self, raw: String, scanner: String) -> Result<ScanOutcome> {
        Ok(self.request(&StationCommand::Scan { raw, scanner }).await?)
    }

    async fn status(&self) -> Result<StationStatus> {
        Ok(self.request(&StationCommand::Status).await?)
    }

    async fn shutdown(&self) -> Result {
        self.request::<()>(&StationCommand::Shutdown).await?;
        Ok(())
    }
}

/// A server that listens for station requests.
///
/// This struct allows you to expose your own [`StationInterface`]
/// implementation so that other processes can access it using
/// a [`StationConnection`] struct.
pub struct StationListener<I: StationInterface + Send + Sync + 'static> {
    interface: Arc<I>,
    listener: Listener,
}

impl<I: StationInterface + Send + Sync + 'static> StationListener<I> {
    /// Register this process as the station daemon.
    ///
    /// Next, call [`Self::handle_connections`] to begin handling
    /// requests.
    pub fn new(interface: I) -> Result<Self, ConnectionError> {
        Self::with_name(SOCKET_NAME, interface)
    }

    pub fn with_name(name: &str, interface: I) -> Result<Self, ConnectionError> {
        let listener = ListenerOptions::new()
            .name(socket_name(name)?)
            .create_tokio()
            .map_err(|err| {
                if err.kind() == ErrorKind::AddrInUse {
                    ExistingServerSnafu.into_error(err)
                } else {
                    err.into()
                }
            })?;

        Ok(Self {
            interface: Arc::new(interface),
            listener,
        })
    }

    pub fn interface(&self) -> Arc<I> {
        self.interface.clone()
    }

    /// Begin handling incoming connections.
    pub async fn handle_connections(&mut self) {
        loop {
            let stream = match self.listener.accept().await {
                Ok(c) => c,
                Err(e) => {
                    error!(error = %e, "There was an error with an incoming connection");
                    continue;
                }
            };

            let interface = self.interface();

            tokio::spawn(async move {
                let mut connection = IncomingConnection::new(stream, interface);
                if let Err(e) = connection.handle_commands().await {
                    error!(error = %e, "An error occurred while handling a connection's command");
                }
            });
        }
    }
}

/// Represents a single IPC connection.
struct IncomingConnection<I: StationInterface + Send + Sync> {
    stream: BufStream,
    interface: Arc<I>,
}

impl<I: StationInterface + Send + Sync> IncomingConnection<I> {
    pub fn new(stream: Stream, interface: Arc<I>) -> Self {
        Self {
            stream: BufStream::new(stream),
            interface,
        }
    }

    /// Handle incoming commands until the connection is closed.
    async fn handle_commands(&mut self) -> Result {
        info!("Accepted connection from client");

        while let Some(command) = self.read().await? {
            self.dispatch_command(command).await?;
        }

        Ok(())
    }

    /// Reads the next message, or returns `None` if the other
    /// process disconnected.
    async fn read(&mut self) -> Result<Option<StationCommand>> {
        let mut command_string = String::new();
        let size = self.stream.reader.read_line(&mut command_string).await?;
        if size == 0 {
            return Ok(None);
        }

        trace!(?command_string, "Received serialized command");

        let command: StationCommand = serde_json::from_str(&command_string)?;
        debug!(?command, "Received command");

        Ok(Some(command))
    }

    async fn reply<T: Serialize + Debug>(&mut self, response: &T) -> Result {
        debug!(?response, "Replying to request");
        self.stream.write_line(response).await?;
        Ok(())
    }

    /// Executes a serialized command using the [`StationInterface`] stored
    /// in this struct.
    async fn dispatch_command(&mut self, command: StationCommand) -> Result {
        let interface = self.interface.clone();

        match command {
            StationCommand::Program(request) => {
                let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
                let run = interface.program(request, move |progress| {
                    _ = progress_tx.send(progress);
                });
                tokio::pin!(run);

                let result = loop {
                    select! {
                        result = &mut run => break result,
                        Some(progress) = progress_rx.recv() => {
                            self.reply(&ProgressResponse::Progress(progress)).await?;
                        }
                    }
                };
                while let Ok(progress) = progress_rx.try_recv() {
                    self.reply(&ProgressResponse::Progress(progress)).await?;
                }

                let result = result.map_err(RemoteError::from);
                self.reply(&ProgressResponse::Complete(result)).await?;
            }
            StationCommand::Cancel => {
                let result: CompletionResponse = interface.cancel().await.map_err(Into::into);
                self.reply(&result).await?;
            }
            StationCommand::Scan { raw, scanner } => {
                let result: CompletionResponse<ScanOutcome> =
                    interface.scan(raw, scanner).await.map_err(Into::into);
                self.reply(&result).await?;
            }
            StationCommand::Status => {
                let result: CompletionResponse<StationStatus> =
                    interface.status().await.map_err(Into::into);
                self.reply(&result).await?;
            }
            StationCommand::Shutdown => {
                let result: CompletionResponse = interface.shutdown().await.map_err(Into::into);
                self.reply(&result).await?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::{ErrorCode, OrderContext, Phase, ProgramSpec};

    #[derive(Default)]
    struct FakeStation {
        cancelled: AtomicBool,
    }

    impl StationInterface for FakeStation {
        async fn program(
            &self,
            request: ProgramRequest,
            mut handle_progress: impl FnMut(ProgramProgress) + Send,
        ) -> Result<ProgramOutcome> {
            for percent in [1, 5, 55] {
                handle_progress(ProgramProgress {
                    percent,
                    phase: Phase::Program,
                });
            }
            if request.program.parameters.is_empty() {
                return Ok(ProgramOutcome::Failed {
                    code: ErrorCode::PreparingInputFileFailure,
                    message: "no parameters".into(),
                });
            }
            Ok(ProgramOutcome::Cancelled)
        }

        async fn cancel(&self) -> Result {
            self.cancelled.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn scan(&self, raw: String, _scanner: String) -> Result<ScanOutcome> {
            anyhow::ensure!(!raw.is_empty(), "empty scan");
            Ok(ScanOutcome::Checked { unit: 0 })
        }

        async fn status(&self) -> Result<StationStatus> {
            Ok(StationStatus {
                session: None,
                units: Vec::new(),
                waiting_for_units: false,
            })
        }

        async fn shutdown(&self) -> Result {
            Ok(())
        }
    }

    fn request(parameters: Vec<crate::Parameter>) -> ProgramRequest {
        ProgramRequest {
            order: OrderContext {
                order_no: "1".into(),
                nc12: "913700345678".into(),
                quantity: 1,
                line: None,
            },
            program: ProgramSpec {
                name: "test".into(),
                parameters,
            },
            units: Vec::new(),
        }
    }

    #[tokio::test]
    async fn requests_round_trip_through_the_socket() {
        let name = format!("drv-stationd-test-{}.sock", std::process::id());
        let mut listener = StationListener::with_name(&name, FakeStation::default()).unwrap();
        let station = listener.interface();
        tokio::spawn(async move { listener.handle_connections().await });

        let connection = StationConnection::connect_to(&name).await.unwrap();

        let mut seen = Vec::new();
        let outcome = connection
            .program(request(Vec::new()), |progress| seen.push(progress.percent))
            .await
            .unwrap();
        assert_eq!(seen, vec![1, 5, 55]);
        assert!(matches!(
            outcome,
            ProgramOutcome::Failed {
                code: ErrorCode::PreparingInputFileFailure,
                ..
            }
        ));

        connection.cancel().await.unwrap();
        assert!(station.cancelled.load(Ordering::SeqCst));

        let error = connection
            .scan(String::new(), "scanner-1".into())
            .await
            .unwrap_err();
        assert!(error.to_string().contains("empty scan"));

        let status = connection.status().await.unwrap();
        assert!(status.session.is_none());
    }
}
