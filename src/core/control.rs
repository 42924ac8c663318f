//! A client for the line-delimited JSON control protocol spoken by the
//! hypervisor (QEMU's QMP). See spec §4.1 / §6 "Control protocol".

use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpStream;
#[cfg(unix)]
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::Duration;

use serde_json::{Value, json};

use crate::error::{Error, Result};

const IO_TIMEOUT: Duration = Duration::from_secs(5);

/// Where to reach the hypervisor's control socket. Production code always
/// chooses `Unix`; `Tcp` exists so tests can stand up a fixture without a
/// filesystem socket.
#[derive(Debug, Clone)]
pub enum ControlTransport {
    #[cfg(unix)]
    Unix(PathBuf),
    Tcp(u16),
}

enum Stream {
    #[cfg(unix)]
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl Stream {
    fn try_clone(&self) -> std::io::Result<Stream> {
        match self {
            #[cfg(unix)]
            Stream::Unix(s) => Ok(Stream::Unix(s.try_clone()?)),
            Stream::Tcp(s) => Ok(Stream::Tcp(s.try_clone()?)),
        }
    }

    fn set_timeouts(&self, timeout: Duration) -> std::io::Result<()> {
        match self {
            #[cfg(unix)]
            Stream::Unix(s) => {
                s.set_read_timeout(Some(timeout))?;
                s.set_write_timeout(Some(timeout))?;
            }
            Stream::Tcp(s) => {
                s.set_read_timeout(Some(timeout))?;
                s.set_write_timeout(Some(timeout))?;
            }
        }
        Ok(())
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            #[cfg(unix)]
            Stream::Unix(s) => s.read(buf),
            Stream::Tcp(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            #[cfg(unix)]
            Stream::Unix(s) => s.write(buf),
            Stream::Tcp(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            #[cfg(unix)]
            Stream::Unix(s) => s.flush(),
            Stream::Tcp(s) => s.flush(),
        }
    }
}

/// A connected, handshake-completed control-protocol client.
pub struct ControlClient {
    writer: Stream,
    reader: BufReader<Stream>,
}

impl ControlClient {
    /// Connects, reads the greeting, and completes the `qmp_capabilities`
    /// handshake. Only after this returns does the client accept further
    /// commands, per spec §4.1.
    pub fn connect(transport: &ControlTransport) -> Result<Self> {
        let stream = match transport {
            #[cfg(unix)]
            ControlTransport::Unix(path) => {
                let s = UnixStream::connect(path).map_err(|source| Error::ConnectionRefused {
                    source,
                })?;
                Stream::Unix(s)
            }
            ControlTransport::Tcp(port) => {
                let s = TcpStream::connect(("127.0.0.1", *port))
                    .map_err(|source| Error::ConnectionRefused { source })?;
                Stream::Tcp(s)
            }
        };

        stream.set_timeouts(IO_TIMEOUT)?;
        let reader_stream = stream.try_clone()?;

        let mut client = ControlClient {
            writer: stream,
            reader: BufReader::new(reader_stream),
        };

        let greeting = client.read_message()?;
        if greeting.get("QMP").is_none() {
            return Err(Error::HandshakeFailed);
        }

        client.write_message(&json!({ "execute": "qmp_capabilities" }))?;
        client.read_success()?;

        Ok(client)
    }

    /// Sends `system_powerdown` and awaits its acknowledgement.
    pub fn shutdown_vm(&mut self) -> Result<()> {
        self.write_message(&json!({ "execute": "system_powerdown" }))?;
        self.read_success()?;
        Ok(())
    }

    /// Reads messages until a `return` terminates the call successfully.
    /// `event` messages interleaved with the response are discarded; any
    /// other shape (notably `error`) fails with [`Error::ProtocolError`].
    fn read_success(&mut self) -> Result<Value> {
        loop {
            let message = self.read_message()?;
            if message.get("return").is_some() {
                return Ok(message);
            }
            if message.get("event").is_some() {
                continue;
            }
            return Err(Error::ProtocolError {
                message: message.to_string(),
            });
        }
    }

    fn write_message(&mut self, message: &Value) -> Result<()> {
        let mut payload = serde_json::to_vec(message).map_err(|err| Error::ProtocolError {
            message: err.to_string(),
        })?;
        payload.extend_from_slice(b"\r\n");
        self.writer.write_all(&payload)?;
        Ok(())
    }

    /// Reads bytes up to the next CRLF and decodes them as one JSON message.
    /// `BufReader` preserves bytes past the delimiter for the next call.
    fn read_message(&mut self) -> Result<Value> {
        let mut line = Vec::new();
        loop {
            let mut byte = [0u8; 1];
            let read = self.reader.read(&mut byte)?;
            if read == 0 {
                return Err(Error::ProtocolError {
                    message: "control socket closed before a full message was read".to_string(),
                });
            }
            line.push(byte[0]);
            if line.ends_with(b"\r\n") {
                line.truncate(line.len() - 2);
                break;
            }
        }

        serde_json::from_slice(&line).map_err(|err| Error::ProtocolError {
            message: format!("invalid JSON on control socket: {err}"),
        })
    }
}
