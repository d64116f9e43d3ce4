//! NDJSON connection handler.
//!
//! A [`Service`] owns no connection state of its own: it pairs a shared
//! [`DispatchTable`] with framing limits and drives one connection's
//! request/response loop at a time. Requests on a connection are strictly
//! sequential; each frame gets exactly one response, fully written before the
//! next frame is read. Decode, validation and dispatch failures are answered
//! with an `error` response and the loop continues. Only transport errors end
//! the session early.

use crate::config::ServerConfig;
use crate::dispatch::DispatchTable;
use crate::envelope::{ResponseEnvelope, decode_request, encode_response};
use crate::error::{DecodeError, ServiceError};
use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncWrite, AsyncWriteExt};

mod frame;

use frame::{Frame, read_frame, read_frame_async};

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionEnd {
    /// Peer closed the stream between requests
    #[default]
    PeerClosed,
    /// Peer closed the stream partway through a request line
    Disconnected,
    /// No complete request arrived within the idle timeout
    IdleTimeout,
}

/// Counters for a finished session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionSummary {
    /// Responses written
    pub responses: u64,
    /// Responses that carried an error
    pub errors: u64,
    /// How the session ended
    pub end: SessionEnd,
}

impl SessionSummary {
    fn record(&mut self, response: &ResponseEnvelope) {
        self.responses += 1;
        if response.is_error() {
            self.errors += 1;
        }
    }
}

/// Service entry point: wraps a dispatch table and serves connections.
#[derive(Clone)]
pub struct Service {
    table: Arc<DispatchTable>,
    max_frame_bytes: usize,
    idle_timeout: Option<Duration>,
}

impl Service {
    /// Create a service with the default limits.
    pub fn new(table: Arc<DispatchTable>) -> Self {
        Self::from_config(table, &ServerConfig::default())
    }

    /// Create a service using the limits in `config`.
    pub fn from_config(table: Arc<DispatchTable>, config: &ServerConfig) -> Self {
        Self {
            table,
            max_frame_bytes: config.max_frame_bytes,
            idle_timeout: config.idle_timeout(),
        }
    }

    /// Override the maximum request line size.
    pub fn with_max_frame_bytes(mut self, max_frame_bytes: usize) -> Self {
        self.max_frame_bytes = max_frame_bytes;
        self
    }

    /// Override the idle timeout.
    pub fn with_idle_timeout(mut self, idle_timeout: Option<Duration>) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Produce the response for one request frame.
    pub fn respond(&self, frame: &[u8]) -> ResponseEnvelope {
        let envelope = match decode_request(frame) {
            Ok(envelope) => envelope,
            Err(err) => {
                if let DecodeError::Malformed(source) = &err {
                    tracing::debug!(error = %source, "malformed request");
                } else {
                    tracing::debug!(error = %err, "invalid request");
                }
                return ResponseEnvelope::from_error(None, &ServiceError::from(err));
            }
        };

        let command_id = envelope.command_id;
        match self.table.dispatch(&envelope) {
            Ok(value) => ResponseEnvelope::success(command_id, value),
            Err(err) => {
                tracing::debug!(command = %envelope.command_name, error = %err, "command failed");
                ResponseEnvelope::from_error(command_id, &ServiceError::from(err))
            }
        }
    }

    fn respond_to(&self, frame: Frame, buf: &[u8]) -> Option<ResponseEnvelope> {
        match frame {
            Frame::Line if buf.iter().all(u8::is_ascii_whitespace) => None,
            Frame::Line => Some(self.respond(buf)),
            Frame::TooLarge => Some(ResponseEnvelope::from_error(
                None,
                &ServiceError::FrameTooLarge,
            )),
            Frame::Partial(_) | Frame::Eof => None,
        }
    }

    /// Serve one connection over async halves until the peer goes away.
    ///
    /// Returns `Err` only for transport failures. Dropping the returned future
    /// abandons the session at its current read or write.
    pub async fn serve<R, W>(&self, reader: R, writer: W) -> io::Result<SessionSummary>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut summary = SessionSummary::default();
        self.serve_into(reader, writer, &mut summary).await?;
        Ok(summary)
    }

    /// Like [`Service::serve`], but records into a caller-owned summary.
    ///
    /// Each response is counted as soon as it is written, so `summary` stays
    /// accurate when the session fails or the future is dropped midway.
    pub async fn serve_into<R, W>(
        &self,
        mut reader: R,
        mut writer: W,
        summary: &mut SessionSummary,
    ) -> io::Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut buf = Vec::with_capacity(256);

        loop {
            let next = read_frame_async(&mut reader, &mut buf, self.max_frame_bytes);
            let frame = match self.idle_timeout {
                Some(limit) => match tokio::time::timeout(limit, next).await {
                    Ok(frame) => frame?,
                    Err(_) => {
                        tracing::debug!(timeout = ?limit, "closing idle connection");
                        summary.end = SessionEnd::IdleTimeout;
                        break;
                    }
                },
                None => next.await?,
            };

            match frame {
                Frame::Eof => break,
                Frame::Partial(bytes) => {
                    tracing::debug!(bytes, "peer closed mid-request; fragment discarded");
                    summary.end = SessionEnd::Disconnected;
                    break;
                }
                _ => {}
            }

            if let Some(response) = self.respond_to(frame, &buf) {
                write_response_async(&mut writer, &response).await?;
                summary.record(&response);
            }
        }

        writer.shutdown().await.ok();
        Ok(())
    }

    /// Serve one blocking connection (used for the stdio transport).
    ///
    /// The idle timeout does not apply here.
    pub fn handle<R: BufRead, W: Write>(
        &self,
        mut reader: R,
        mut writer: W,
    ) -> io::Result<SessionSummary> {
        let mut summary = SessionSummary::default();
        let mut buf = Vec::with_capacity(256);

        loop {
            let frame = read_frame(&mut reader, &mut buf, self.max_frame_bytes)?;
            match frame {
                Frame::Eof => break,
                Frame::Partial(bytes) => {
                    tracing::debug!(bytes, "peer closed mid-request; fragment discarded");
                    summary.end = SessionEnd::Disconnected;
                    break;
                }
                _ => {}
            }

            if let Some(response) = self.respond_to(frame, &buf) {
                write_response(&mut writer, &response)?;
                summary.record(&response);
            }
        }

        Ok(summary)
    }
}

fn write_response<W: Write>(writer: &mut W, envelope: &ResponseEnvelope) -> io::Result<()> {
    let mut bytes = encode_response(envelope)?;
    bytes.push(b'\n');
    writer.write_all(&bytes)?;
    writer.flush()
}

async fn write_response_async<W>(writer: &mut W, envelope: &ResponseEnvelope) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut bytes = encode_response(envelope)?;
    bytes.push(b'\n');
    writer.write_all(&bytes).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};
    use std::io::Cursor;
    use tokio::io::AsyncBufReadExt;

    fn service() -> Service {
        Service::new(DispatchTable::with_builtins())
    }

    fn run(service: &Service, input: &[u8]) -> (Vec<Value>, SessionSummary) {
        let mut output = Vec::new();
        let summary = service.handle(Cursor::new(input.to_vec()), &mut output).unwrap();
        let lines = output
            .split(|b| *b == b'\n')
            .filter(|line| !line.is_empty())
            .map(|line| serde_json::from_slice::<Value>(line).unwrap())
            .collect();
        (lines, summary)
    }

    #[test]
    fn blank_lines_get_no_response() {
        let (lines, summary) = run(&service(), b"\n   \n\r\n");
        assert!(lines.is_empty());
        assert_eq!(summary.responses, 0);
        assert_eq!(summary.end, SessionEnd::PeerClosed);
    }

    #[test]
    fn command_id_is_echoed() {
        let (lines, _) = run(
            &service(),
            b"{\"command_id\": 42, \"command_name\": \"echo\", \"arguments\": {\"msg\": 1}}\n",
        );
        assert_eq!(lines, vec![json!({"command_id": 42, "result": 1})]);
    }

    #[test]
    fn oversized_frame_is_rejected_and_session_continues() {
        let service = service().with_max_frame_bytes(64);
        let big = format!(
            "{{\"command_name\": \"echo\", \"arguments\": {{\"msg\": \"{}\"}}}}\n",
            "x".repeat(200)
        );
        let input = format!(
            "{big}{{\"command_name\": \"echo\", \"arguments\": {{\"msg\": \"ok\"}}}}\n"
        );
        let (lines, summary) = run(&service, input.as_bytes());
        assert_eq!(lines[0], json!({"error": "request too large"}));
        assert_eq!(lines[1], json!({"result": "ok"}));
        assert_eq!(summary.errors, 1);
    }

    #[test]
    fn validation_error_mentions_field() {
        let (lines, _) = run(&service(), b"{\"arguments\": {}}\n");
        let message = lines[0]["error"].as_str().unwrap();
        assert!(message.starts_with("invalid request:"), "{message}");
        assert!(message.contains("command_name"), "{message}");
    }

    #[test]
    fn partial_trailing_request_is_not_answered() {
        let (lines, summary) = run(
            &service(),
            b"{\"command_name\": \"echo\", \"arguments\": {\"msg\": \"a\"}}\n{\"command_name\": \"ec",
        );
        assert_eq!(lines.len(), 1);
        assert_eq!(summary.end, SessionEnd::Disconnected);
    }

    #[tokio::test]
    async fn idle_timeout_closes_session() {
        let service = service().with_idle_timeout(Some(Duration::from_millis(50)));
        let (client, server) = tokio::io::duplex(1024);
        let (read_half, write_half) = tokio::io::split(server);

        let summary = service
            .serve(tokio::io::BufReader::new(read_half), write_half)
            .await
            .unwrap();
        assert_eq!(summary.end, SessionEnd::IdleTimeout);
        drop(client);
    }

    #[test]
    fn largest_frame_limit_still_answers() {
        let config = ServerConfig {
            max_frame_bytes: usize::MAX,
            ..ServerConfig::default()
        };
        let service = Service::from_config(DispatchTable::with_builtins(), &config);
        let (lines, summary) = run(
            &service,
            b"{\"command_name\": \"echo\", \"arguments\": {\"msg\": \"wide\"}}\n",
        );
        assert_eq!(lines, vec![json!({"result": "wide"})]);
        assert_eq!(summary.responses, 1);
    }

    #[tokio::test]
    async fn largest_frame_limit_still_answers_async() {
        let service = service().with_max_frame_bytes(usize::MAX);
        let input: &[u8] = b"{\"command_name\": \"echo\", \"arguments\": {\"msg\": 7}}\n";
        let mut output = Vec::new();

        let summary = service
            .serve(tokio::io::BufReader::new(input), &mut output)
            .await
            .unwrap();
        assert_eq!(summary.responses, 1);
        assert_eq!(output, b"{\"result\":7}\n");
    }

    #[tokio::test]
    async fn abandoned_session_keeps_written_responses_counted() {
        let service = service();
        let (mut client, server) = tokio::io::duplex(1024);
        let (read_half, write_half) = tokio::io::split(server);
        client
            .write_all(b"{\"command_name\": \"echo\", \"arguments\": {\"msg\": \"kept\"}}\n")
            .await
            .unwrap();

        let mut summary = SessionSummary::default();
        let session =
            service.serve_into(tokio::io::BufReader::new(read_half), write_half, &mut summary);
        let abandoned = tokio::time::timeout(Duration::from_millis(100), session).await;
        assert!(abandoned.is_err(), "session should still be waiting for input");
        assert_eq!(summary.responses, 1);
        assert_eq!(summary.errors, 0);

        let mut line = String::new();
        tokio::io::BufReader::new(&mut client)
            .read_line(&mut line)
            .await
            .unwrap();
        assert_eq!(serde_json::from_str::<Value>(&line).unwrap(), json!({"result": "kept"}));
    }
}
