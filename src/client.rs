//! Blocking client for the Courier NDJSON service.
//!
//! Speaks the same newline-delimited protocol as `courierd`, either over TCP
//! or by spawning the daemon with `--stdio`. Every request carries an
//! increasing `command_id`, and the response is checked against it.

use crate::envelope::{
    Arguments, CommandEnvelope, ResponseEnvelope, decode_response, encode_request,
};
use serde_json::Value;
use std::ffi::OsStr;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use thiserror::Error;

/// Errors produced by the [`Client`].
#[derive(Debug, Error)]
pub enum ClientError {
    /// I/O error while talking to the service.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    /// JSON (de)serialisation error for envelopes.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    /// The service answered with an `error` response.
    #[error("service error: {0}")]
    Service(String),
    /// Attempted to spawn the service without a command.
    #[error("service command is empty")]
    EmptyCommand,
    /// Spawned service is missing a stdio pipe.
    #[error("spawned service process did not expose {0}")]
    MissingPipe(&'static str),
    /// The response did not belong to the request just sent.
    #[error("malformed response: {0}")]
    MalformedResponse(String),
}

enum Transport {
    Process {
        child: Child,
        reader: BufReader<ChildStdout>,
        writer: BufWriter<ChildStdin>,
    },
    Tcp {
        reader: BufReader<TcpStream>,
        writer: BufWriter<TcpStream>,
    },
}

impl Transport {
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        let writer: &mut dyn Write = match self {
            Transport::Process { writer, .. } => writer,
            Transport::Tcp { writer, .. } => writer,
        };
        writer.write_all(buf)?;
        writer.flush()
    }

    fn read_line(&mut self) -> io::Result<Vec<u8>> {
        let mut buffer = Vec::with_capacity(256);
        let bytes = match self {
            Transport::Process { reader, .. } => reader.read_until(b'\n', &mut buffer)?,
            Transport::Tcp { reader, .. } => reader.read_until(b'\n', &mut buffer)?,
        };

        if bytes == 0 {
            Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed by service",
            ))
        } else {
            Ok(buffer)
        }
    }
}

/// Synchronous request/response client.
pub struct Client {
    transport: Transport,
    next_command_id: u64,
}

impl Client {
    /// Connect to a service listening on a TCP socket.
    pub fn connect_tcp<A: ToSocketAddrs>(addr: A) -> Result<Self, ClientError> {
        let mut last_err = None;
        for candidate in addr.to_socket_addrs()? {
            match TcpStream::connect(candidate) {
                Ok(stream) => {
                    stream.set_nodelay(true).ok();
                    let reader = BufReader::new(stream.try_clone()?);
                    let writer = BufWriter::new(stream);
                    return Ok(Self::with_transport(Transport::Tcp { reader, writer }));
                }
                Err(err) => last_err = Some(err),
            }
        }

        Err(ClientError::Io(last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "no address resolved")
        })))
    }

    /// Spawn a service process (e.g. `courierd --stdio`) and talk over its pipes.
    pub fn connect_stdio<I, S>(command: I) -> Result<Self, ClientError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut parts = command.into_iter();
        let program = parts.next().ok_or(ClientError::EmptyCommand)?;

        let mut child = Command::new(program)
            .args(parts)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()?;

        let stdout = child.stdout.take().ok_or(ClientError::MissingPipe("stdout"))?;
        let stdin = child.stdin.take().ok_or(ClientError::MissingPipe("stdin"))?;

        Ok(Self::with_transport(Transport::Process {
            child,
            reader: BufReader::new(stdout),
            writer: BufWriter::new(stdin),
        }))
    }

    fn with_transport(transport: Transport) -> Self {
        Self {
            transport,
            next_command_id: 1,
        }
    }

    /// Issue a command and return its result value.
    pub fn call(&mut self, command: &str, arguments: Arguments) -> Result<Value, ClientError> {
        let response = self.send(command, arguments)?;
        response.into_result().map_err(ClientError::Service)
    }

    /// Issue a command and return the raw response envelope.
    pub fn send(
        &mut self,
        command: &str,
        arguments: Arguments,
    ) -> Result<ResponseEnvelope, ClientError> {
        let command_id = self.next_command_id;
        self.next_command_id += 1;

        let envelope = CommandEnvelope::new(command, arguments).with_id(command_id);
        let mut payload = encode_request(&envelope)?;
        payload.push(b'\n');
        self.transport.write_all(&payload)?;

        let line = self.transport.read_line()?;
        let response = decode_response(&line)?;
        match response.command_id {
            Some(id) if id == command_id => Ok(response),
            Some(id) => Err(ClientError::MalformedResponse(format!(
                "command id mismatch (expected {command_id}, got {id})"
            ))),
            // Requests that fail to decode are answered without an id.
            None if response.is_error() => Ok(response),
            None => Err(ClientError::MalformedResponse(
                "response missing command id".into(),
            )),
        }
    }

    /// Heartbeat round trip using the built-in `ping` command.
    pub fn ping(&mut self) -> Result<Value, ClientError> {
        self.call("ping", Arguments::new())
    }

    /// List the commands the service exposes.
    pub fn help(&mut self) -> Result<Value, ClientError> {
        self.call("help", Arguments::new())
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if let Transport::Process { child, .. } = &mut self.transport {
            // Attempt a graceful shutdown; ignore errors because we're in Drop.
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}
