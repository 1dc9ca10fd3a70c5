//! DAP transport abstraction layer.
//! Supports any duplex byte stream: stdio (embedded mode) and TCP (server mode).

use crate::dap::tracer::FileTracer;
use anyhow::anyhow;
use serde_json::Value;
use std::io::{BufRead, BufReader, Read, Stdin, Stdout, Write};
use std::net::TcpStream;

/// Incoming half of a transport.
pub trait DapReader: Send {
    /// Read a single DAP message (with Content-Length framing).
    fn read_message(&mut self) -> anyhow::Result<Value>;
}

/// Outgoing half of a transport.
pub trait DapWriter: Send {
    /// Write a single DAP message (with Content-Length framing).
    fn write_message(&mut self, message: &Value) -> anyhow::Result<()>;
}

/// Trait for DAP message transport. Requests are read by the session loop while
/// events are written from the callbacks worker, so a transport is split in halves.
pub trait DapTransport {
    type Reader: DapReader;
    type Writer: DapWriter + 'static;

    fn split(self) -> (Self::Reader, Self::Writer);
}

/// Read a message framed as `Content-Length: <n>\r\n\r\n<payload>`.
///
/// Headers other than `Content-Length` are ignored.
pub fn read_frame<R: BufRead>(reader: &mut R) -> anyhow::Result<Value> {
    let mut content_length: Option<usize> = None;
    loop {
        let mut line = String::new();
        let read_n = reader.read_line(&mut line)?;
        if read_n == 0 {
            return Err(anyhow!("DAP connection closed"));
        }
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            if content_length.is_some() {
                break;
            }
            continue;
        }
        if let Some(v) = line.strip_prefix("Content-Length:") {
            content_length = Some(v.trim().parse()?);
        }
    }

    let len = content_length.ok_or_else(|| anyhow!("Missing Content-Length header"))?;
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf)?;
    let msg: Value = serde_json::from_slice(&buf)?;
    Ok(msg)
}

pub fn write_frame<W: Write>(writer: &mut W, message: &Value) -> anyhow::Result<()> {
    let payload = serde_json::to_vec(message)?;
    write!(writer, "Content-Length: {}\r\n\r\n", payload.len())?;
    writer.write_all(&payload)?;
    writer.flush()?;
    Ok(())
}

pub struct FrameReader<R> {
    reader: R,
    tracer: Option<FileTracer>,
}

impl<R: BufRead + Send> DapReader for FrameReader<R> {
    fn read_message(&mut self) -> anyhow::Result<Value> {
        let msg = read_frame(&mut self.reader)?;
        if let Some(tracer) = &self.tracer {
            tracer.incoming(&msg);
        }
        Ok(msg)
    }
}

pub struct FrameWriter<W> {
    writer: W,
    tracer: Option<FileTracer>,
}

impl<W: Write + Send> DapWriter for FrameWriter<W> {
    fn write_message(&mut self, message: &Value) -> anyhow::Result<()> {
        if let Some(tracer) = &self.tracer {
            tracer.outgoing(message);
        }
        write_frame(&mut self.writer, message)
    }
}

/// Content-Length framed transport over a reader/writer pair.
pub struct StreamTransport<R, W> {
    reader: R,
    writer: W,
    tracer: Option<FileTracer>,
}

impl<R: BufRead + Send, W: Write + Send + 'static> StreamTransport<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader,
            writer,
            tracer: None,
        }
    }

    /// Duplicate the whole traffic into a trace file.
    pub fn with_tracer(self, tracer: FileTracer) -> Self {
        Self {
            tracer: Some(tracer),
            ..self
        }
    }
}

impl StreamTransport<BufReader<Stdin>, Stdout> {
    /// Stdio-based transport (for embedded mode).
    pub fn stdio() -> Self {
        Self::new(BufReader::new(std::io::stdin()), std::io::stdout())
    }
}

impl StreamTransport<BufReader<TcpStream>, TcpStream> {
    /// TCP-based transport (for server mode).
    pub fn tcp(stream: TcpStream) -> anyhow::Result<Self> {
        stream.set_nodelay(true)?;
        let reader = BufReader::new(stream.try_clone()?);
        Ok(Self::new(reader, stream))
    }
}

impl<R: BufRead + Send, W: Write + Send + 'static> DapTransport for StreamTransport<R, W> {
    type Reader = FrameReader<R>;
    type Writer = FrameWriter<W>;

    fn split(self) -> (Self::Reader, Self::Writer) {
        (
            FrameReader {
                reader: self.reader,
                tracer: self.tracer.clone(),
            },
            FrameWriter {
                writer: self.writer,
                tracer: self.tracer,
            },
        )
    }
}
