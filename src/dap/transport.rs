//! DAP transport layer.
//! Reading and writing halves are separate so that the reader can live on its own thread
//! while the session writes from the processing loop.

use crate::error::Error;
use serde::Serialize;
use serde_json::Value;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::os::unix::net::UnixStream;

/// Messages announcing a larger body end the stream.
pub const MAX_MESSAGE_LEN: usize = 64 * 1024 * 1024;

/// Reading half of a client channel.
pub struct DapReader {
    reader: BufReader<Box<dyn Read + Send>>,
    trace: bool,
}

/// Writing half of a client channel.
pub struct DapWriter {
    writer: Box<dyn Write + Send>,
    trace: bool,
}

/// Create transport halves over process stdin/stdout.
pub fn stdio(trace: bool) -> (DapReader, DapWriter) {
    (
        DapReader::new(Box::new(std::io::stdin()), trace),
        DapWriter::new(Box::new(std::io::stdout()), trace),
    )
}

/// Create transport halves over a TCP connection (server mode).
pub fn tcp(stream: TcpStream, trace: bool) -> std::io::Result<(DapReader, DapWriter)> {
    stream.set_nodelay(true)?;
    let reader = stream.try_clone()?;
    Ok((
        DapReader::new(Box::new(reader), trace),
        DapWriter::new(Box::new(stream), trace),
    ))
}

/// Create transport halves over a unix socket.
pub fn unix(stream: UnixStream, trace: bool) -> std::io::Result<(DapReader, DapWriter)> {
    let reader = stream.try_clone()?;
    Ok((
        DapReader::new(Box::new(reader), trace),
        DapWriter::new(Box::new(stream), trace),
    ))
}

impl DapReader {
    pub fn new(reader: Box<dyn Read + Send>, trace: bool) -> Self {
        Self {
            reader: BufReader::new(reader),
            trace,
        }
    }

    /// Read a single DAP message (with Content-Length framing).
    ///
    /// Returns `Ok(None)` at the end of stream. A message without `Content-Length` header
    /// or with a payload that is not JSON is reported as [`Error::MalformedMessage`], the
    /// stream stays usable after that. A `Content-Length` above [`MAX_MESSAGE_LEN`] is a
    /// fatal I/O error.
    pub fn read_message(&mut self) -> Result<Option<Value>, Error> {
        let mut content_length: Option<usize> = None;
        let mut header_seen = false;
        loop {
            let mut line = String::new();
            let read_n = self.reader.read_line(&mut line)?;
            if read_n == 0 {
                return Ok(None);
            }
            let line = line.trim_end_matches(['\r', '\n']);
            if line.is_empty() {
                if !header_seen {
                    // stray separator between messages
                    continue;
                }
                break;
            }
            header_seen = true;
            if let Some(v) = line.strip_prefix("Content-Length:") {
                let len = v.trim().parse().map_err(|_| {
                    Error::MalformedMessage(format!("bad Content-Length value `{}`", v.trim()))
                })?;
                content_length = Some(len);
            }
        }

        let len = content_length
            .ok_or_else(|| Error::MalformedMessage("missing Content-Length header".into()))?;
        if len > MAX_MESSAGE_LEN {
            return Err(Error::IO(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("Content-Length {len} exceeds {MAX_MESSAGE_LEN} bytes"),
            )));
        }
        let mut buf = vec![0u8; len];
        if let Err(err) = self.reader.read_exact(&mut buf) {
            if err.kind() == std::io::ErrorKind::UnexpectedEof {
                return Ok(None);
            }
            return Err(err.into());
        }

        let msg: Value = serde_json::from_slice(&buf)
            .map_err(|e| Error::MalformedMessage(format!("payload is not JSON: {e}")))?;
        if self.trace {
            log::debug!(target: "dap", "<- {msg}");
        }
        Ok(Some(msg))
    }
}

impl DapWriter {
    pub fn new(writer: Box<dyn Write + Send>, trace: bool) -> Self {
        Self { writer, trace }
    }

    /// Write a single DAP message (with Content-Length framing).
    pub fn write_message<T: Serialize>(&mut self, message: &T) -> Result<(), Error> {
        let payload = serde_json::to_vec(message)?;
        if self.trace {
            log::debug!(target: "dap", "-> {}", String::from_utf8_lossy(&payload));
        }
        write!(self.writer, "Content-Length: {}\r\n\r\n", payload.len())?;
        self.writer.write_all(&payload)?;
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;
    use std::io::Cursor;
    use std::sync::{Arc, Mutex};

    fn reader_of(data: &str) -> DapReader {
        DapReader::new(Box::new(Cursor::new(data.as_bytes().to_vec())), false)
    }

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_read_messages() {
        let mut reader = reader_of(
            "Content-Length: 13\r\n\r\n{\"seq\": 1}   Content-Type: application/json\r\nContent-Length: 2\r\n\r\n[]",
        );
        assert_eq!(reader.read_message().unwrap(), Some(json!({"seq": 1})));
        assert_eq!(reader.read_message().unwrap(), Some(json!([])));
        assert_eq!(reader.read_message().unwrap(), None);
    }

    #[test]
    fn test_malformed_messages() {
        struct TestCase {
            data: &'static str,
            expected_err: &'static str,
        }
        let cases = [
            TestCase {
                data: "Content-Type: x\r\n\r\n",
                expected_err: "missing Content-Length",
            },
            TestCase {
                data: "Content-Length: abc\r\n\r\n",
                expected_err: "bad Content-Length",
            },
            TestCase {
                data: "Content-Length: 3\r\n\r\nfoo",
                expected_err: "not JSON",
            },
        ];

        for tc in cases {
            let err = reader_of(tc.data).read_message().unwrap_err();
            assert!(matches!(err, Error::MalformedMessage(_)));
            assert!(err.to_string().contains(tc.expected_err), "{err}");
        }
    }

    #[test]
    fn test_oversized_message_is_fatal() {
        let cases = [
            format!("Content-Length: {}\r\n\r\n{{}}", MAX_MESSAGE_LEN + 1),
            format!("Content-Length: {}\r\n\r\n{{}}", u64::MAX),
        ];
        for data in cases {
            let err = reader_of(&data).read_message().unwrap_err();
            assert!(matches!(err, Error::IO(_)), "{err}");
            assert!(err.is_fatal());
        }
    }

    #[test]
    fn test_truncated_body_is_end_of_stream() {
        let mut reader = reader_of("Content-Length: 30\r\n\r\n{\"seq\"");
        assert_eq!(reader.read_message().unwrap(), None);
    }

    #[test]
    fn test_write_then_read() {
        let buf = SharedBuf::default();
        let mut writer = DapWriter::new(Box::new(buf.clone()), false);
        let msg = json!({"type": "event", "event": "output", "body": {"output": "ünïcode"}});
        writer.write_message(&msg).unwrap();

        let raw = buf.0.lock().unwrap().clone();
        let text = String::from_utf8(raw.clone()).unwrap();
        let payload_len = serde_json::to_vec(&msg).unwrap().len();
        assert!(text.starts_with(&format!("Content-Length: {payload_len}\r\n\r\n")));

        let mut reader = DapReader::new(Box::new(Cursor::new(raw)), false);
        assert_eq!(reader.read_message().unwrap(), Some(msg));
    }
}
