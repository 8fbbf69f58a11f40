//! Framed line protocol to the agent.
//!
//! Each header is `name: value\n`; a lone `\n` ends a header block. Values
//! may be URL-encoded ("encoded"), pre-formatted ("ordered"), a query-values
//! multimap ("map") or a plain string. The server response is read
//! MIME-style into a case-insensitive header map.

use std::collections::HashMap;
use std::future::Future;
use std::io::ErrorKind;
use std::time::Duration;

use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter, ReadHalf,
    WriteHalf,
};
use tracing::debug;

use crate::error::ProbeError;

/// Object-safe alias for the underlying stream type.
pub trait AgentStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AgentStream for T {}

/// Split an agent socket string of the form `network://address`.
pub fn parse_network_address(agent_socket: &str) -> Result<(&str, &str), ProbeError> {
    match agent_socket.split_once("://") {
        Some((network, address)) if !network.is_empty() && !network.contains(':') => {
            Ok((network, address))
        }
        _ => Err(ProbeError::ConfigInvalid(format!(
            "could not parse agent socket value: [{agent_socket}]"
        ))),
    }
}

/// Case-insensitive response header map.
#[derive(Debug, Default)]
pub struct ResponseHeaders(HashMap<String, String>);

impl ResponseHeaders {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    fn insert(&mut self, name: &str, value: &str) {
        self.0
            .insert(name.to_ascii_lowercase(), value.trim().to_string());
    }
}

/// A buffered reader/writer pair wrapping one agent stream connection.
pub struct Connection {
    reader: BufReader<ReadHalf<Box<dyn AgentStream>>>,
    writer: BufWriter<WriteHalf<Box<dyn AgentStream>>>,
    timeout: Duration,
    closed: bool,
}

impl Connection {
    /// Dial the agent. The network prefix selects TCP or Unix-domain.
    pub async fn connect(agent_socket: &str, timeout: Duration) -> Result<Self, ProbeError> {
        let (network, address) = parse_network_address(agent_socket)?;

        let stream: Box<dyn AgentStream> = match network {
            "tcp" | "tcp4" | "tcp6" => Box::new(
                with_timeout(timeout, tokio::net::TcpStream::connect(address)).await?,
            ),
            #[cfg(unix)]
            "unix" => Box::new(
                with_timeout(timeout, tokio::net::UnixStream::connect(address)).await?,
            ),
            other => {
                return Err(ProbeError::ConfigInvalid(format!(
                    "unsupported agent network: {other}"
                )))
            }
        };

        Ok(Self::from_stream(stream, timeout))
    }

    pub(crate) fn from_stream(stream: Box<dyn AgentStream>, timeout: Duration) -> Self {
        let (read, write) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(read),
            writer: BufWriter::new(write),
            timeout,
            closed: false,
        }
    }

    /// Read one `name: value` header line. A blank line returns an empty
    /// name, signalling the end of the block.
    pub async fn read_encoded_header(&mut self) -> Result<(String, String), ProbeError> {
        let line = self.read_line().await?;
        if line == "\n" {
            return Ok((String::new(), String::new()));
        }
        debug!(header = line.trim_end(), "recv header");

        let trimmed = line.trim_end_matches('\n');
        match trimmed.split_once(':') {
            Some((name, value)) if !name.is_empty() => {
                Ok((name.to_string(), value.to_string()))
            }
            _ => Err(ProbeError::AgentProtocol(format!(
                "could not parse header: [{trimmed}]"
            ))),
        }
    }

    /// Read a full response block (headers until a blank line).
    pub async fn read_response(&mut self) -> Result<ResponseHeaders, ProbeError> {
        let mut headers = ResponseHeaders::default();
        loop {
            let line = self.read_line().await?;
            if line == "\n" {
                return Ok(headers);
            }
            let trimmed = line.trim_end_matches('\n');
            match trimmed.split_once(':') {
                Some((name, value)) if !name.is_empty() => headers.insert(name, value),
                _ => {
                    return Err(ProbeError::AgentProtocol(format!(
                        "could not parse header: [{trimmed}]"
                    )))
                }
            }
        }
    }

    async fn read_line(&mut self) -> Result<String, ProbeError> {
        let mut line = String::new();
        let n = with_timeout(self.timeout, self.reader.read_line(&mut line)).await?;
        if n == 0 || !line.ends_with('\n') {
            return Err(ProbeError::AgentProtocol(
                "unexpected EOF from agent".to_string(),
            ));
        }
        Ok(line)
    }

    pub async fn write_encoded_header(&mut self, name: &str, value: &str) -> Result<(), ProbeError> {
        debug!(header = format!("{name}: {value}"), "send header");
        self.writer
            .write_all(format!("{name}: {value}\n").as_bytes())
            .await?;
        Ok(())
    }

    pub async fn write_string_header(&mut self, name: &str, value: &str) -> Result<(), ProbeError> {
        let encoded: String = form_urlencoded::byte_serialize(value.as_bytes()).collect();
        self.write_encoded_header(name, &encoded).await
    }

    pub async fn write_map_header(
        &mut self,
        name: &str,
        values: &[(&str, String)],
    ) -> Result<(), ProbeError> {
        let encoded = {
            let mut serializer = form_urlencoded::Serializer::new(String::new());
            for (key, value) in values {
                serializer.append_pair(key, value);
            }
            serializer.finish()
        };
        self.write_encoded_header(name, &encoded).await
    }

    /// Write pre-formatted headers whose order is part of the protocol.
    pub async fn write_ordered_headers(&mut self, headers: &[String]) -> Result<(), ProbeError> {
        for header in headers {
            debug!(header = header.as_str(), "send ordered header");
            self.writer.write_all(header.as_bytes()).await?;
            self.writer.write_all(b"\n").await?;
        }
        Ok(())
    }

    pub async fn write_end_of_headers(&mut self) -> Result<(), ProbeError> {
        debug!("send end-of-headers");
        self.writer.write_all(b"\n").await?;
        self.flush().await
    }

    pub async fn write_raw(&mut self, data: &[u8]) -> Result<(), ProbeError> {
        self.writer.write_all(data).await?;
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<(), ProbeError> {
        with_timeout(self.timeout, self.writer.flush()).await?;
        Ok(())
    }

    /// Flush then shut the stream down. Idempotent; the first error wins.
    pub async fn close(&mut self) -> Result<(), ProbeError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let flushed = self.flush().await;
        let shutdown = with_timeout(self.timeout, self.writer.shutdown())
            .await
            .map_err(ProbeError::from);
        flushed.and(shutdown)
    }
}

async fn with_timeout<T>(
    timeout: Duration,
    fut: impl Future<Output = std::io::Result<T>>,
) -> std::io::Result<T> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(std::io::Error::new(
            ErrorKind::TimedOut,
            "agent connection timed out",
        )),
    }
}
