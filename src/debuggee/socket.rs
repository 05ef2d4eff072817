use crate::debuggee::addr::SocketAddress;
use crate::debuggee::tls::{self, TlsOptions};
use crate::error::Error;
use rustls::{ClientConnection, StreamOwned};
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream, ToSocketAddrs};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Accept loop polling interval.
const ACCEPT_POLL: Duration = Duration::from_millis(20);

/// Connected socket without transport security.
#[derive(Debug)]
pub enum RawStream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl RawStream {
    pub fn try_clone(&self) -> std::io::Result<Self> {
        Ok(match self {
            RawStream::Tcp(s) => RawStream::Tcp(s.try_clone()?),
            RawStream::Unix(s) => RawStream::Unix(s.try_clone()?),
        })
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> std::io::Result<()> {
        match self {
            RawStream::Tcp(s) => s.set_read_timeout(timeout),
            RawStream::Unix(s) => s.set_read_timeout(timeout),
        }
    }

    pub fn set_write_timeout(&self, timeout: Option<Duration>) -> std::io::Result<()> {
        match self {
            RawStream::Tcp(s) => s.set_write_timeout(timeout),
            RawStream::Unix(s) => s.set_write_timeout(timeout),
        }
    }

    pub fn shutdown(&self) -> std::io::Result<()> {
        match self {
            RawStream::Tcp(s) => s.shutdown(Shutdown::Both),
            RawStream::Unix(s) => s.shutdown(Shutdown::Both),
        }
    }
}

impl Read for RawStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            RawStream::Tcp(s) => s.read(buf),
            RawStream::Unix(s) => s.read(buf),
        }
    }
}

impl Write for RawStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            RawStream::Tcp(s) => s.write(buf),
            RawStream::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            RawStream::Tcp(s) => s.flush(),
            RawStream::Unix(s) => s.flush(),
        }
    }
}

/// Closes a debuggee connection from any thread, a blocked reader wakes up with end of stream.
#[derive(Debug)]
pub struct Closer(RawStream);

impl Closer {
    pub fn close(&self) {
        if let Err(e) = self.0.shutdown() {
            if e.kind() != ErrorKind::NotConnected {
                log::debug!(target: "debuggee", "socket shutdown: {e}");
            }
        }
    }
}

/// Debuggee connection split into halves for the reader thread and the session loop.
pub struct DebuggeeChannel {
    pub reader: Box<dyn Read + Send>,
    pub writer: Box<dyn Write + Send>,
    pub closer: Closer,
}

impl std::fmt::Debug for DebuggeeChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DebuggeeChannel")
            .field("closer", &self.closer)
            .finish_non_exhaustive()
    }
}

impl DebuggeeChannel {
    pub fn plain(stream: RawStream) -> Result<Self, Error> {
        stream.set_read_timeout(None)?;
        stream.set_write_timeout(None)?;
        let reader = stream.try_clone()?;
        let closer = Closer(stream.try_clone()?);
        Ok(Self {
            reader: Box::new(reader),
            writer: Box::new(stream),
            closer,
        })
    }

    /// Both halves share the TLS session, the underlying socket must have a short read
    /// timeout so that the reader releases the session regularly.
    pub fn tls(stream: StreamOwned<ClientConnection, RawStream>) -> Result<Self, Error> {
        let closer = Closer(stream.sock.try_clone()?);
        let shared = SharedTls::new(stream);
        Ok(Self {
            reader: Box::new(shared.clone()),
            writer: Box::new(shared),
            closer,
        })
    }
}

/// Stream used by a reader thread and a writer at once.
///
/// The reader holds the stream for one read timeout at most and steps back while a writer
/// waits, so a write is delayed by a single read poll at most.
struct SharedTls<S> {
    stream: Arc<Mutex<S>>,
    waiting_writers: Arc<AtomicUsize>,
}

impl<S> Clone for SharedTls<S> {
    fn clone(&self) -> Self {
        Self {
            stream: self.stream.clone(),
            waiting_writers: self.waiting_writers.clone(),
        }
    }
}

impl<S> SharedTls<S> {
    fn new(stream: S) -> Self {
        Self {
            stream: Arc::new(Mutex::new(stream)),
            waiting_writers: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn lock(&self) -> std::io::Result<MutexGuard<'_, S>> {
        self.stream
            .lock()
            .map_err(|_| std::io::Error::other("TLS session lock poisoned"))
    }

    fn lock_for_write(&self) -> std::io::Result<MutexGuard<'_, S>> {
        self.waiting_writers.fetch_add(1, Ordering::SeqCst);
        let guard = self.lock();
        self.waiting_writers.fetch_sub(1, Ordering::SeqCst);
        guard
    }

    fn write_with<T>(&self, mut op: impl FnMut(&mut S) -> std::io::Result<T>) -> std::io::Result<T> {
        loop {
            let result = op(&mut *self.lock_for_write()?);
            match result {
                Err(e) if is_timeout(&e) => std::thread::yield_now(),
                other => return other,
            }
        }
    }
}

fn is_timeout(e: &std::io::Error) -> bool {
    matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
}

impl<S: Read> Read for SharedTls<S> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        loop {
            while self.waiting_writers.load(Ordering::SeqCst) > 0 {
                std::thread::yield_now();
            }
            let result = self.lock()?.read(buf);
            match result {
                Err(e) if is_timeout(&e) => std::thread::yield_now(),
                other => return other,
            }
        }
    }
}

impl<S: Write> Write for SharedTls<S> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.write_with(|stream| stream.write(buf))
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.write_with(|stream| stream.flush())
    }
}

enum ListenerKind {
    Tcp(TcpListener),
    Unix(UnixListener),
}

/// Listening socket for a debuggee that connects to the adapter.
///
/// A unix socket file is removed when the listener drops.
pub struct DebuggeeListener {
    inner: ListenerKind,
    address: SocketAddress,
    socket_file: Option<PathBuf>,
}

impl DebuggeeListener {
    pub fn bind(addr: &SocketAddress) -> Result<Self, Error> {
        match addr {
            SocketAddress::Unix(path) => {
                if path.exists() {
                    std::fs::remove_file(path)?;
                }
                let listener = UnixListener::bind(path)?;
                listener.set_nonblocking(true)?;
                Ok(Self {
                    inner: ListenerKind::Unix(listener),
                    address: addr.clone(),
                    socket_file: Some(path.clone()),
                })
            }
            SocketAddress::Tcp { host, port } => {
                let listener = TcpListener::bind((SocketAddress::bind_host(host), *port))?;
                listener.set_nonblocking(true)?;
                let local = listener.local_addr()?;
                let host = if host.is_empty() {
                    "127.0.0.1".to_string()
                } else {
                    local.ip().to_string()
                };
                Ok(Self {
                    inner: ListenerKind::Tcp(listener),
                    address: SocketAddress::Tcp {
                        host,
                        port: local.port(),
                    },
                    socket_file: None,
                })
            }
        }
    }

    /// Address a debuggee can connect to, with the real port when the OS picked one.
    pub fn address(&self) -> &SocketAddress {
        &self.address
    }

    /// Wait for one debuggee connection.
    pub fn accept(&self, timeout: Duration) -> Result<RawStream, Error> {
        self.accept_watching(timeout, None)
    }

    /// Wait for one debuggee connection, fail with [`Error::DebuggeeExited`] as soon as
    /// anything connects to `exit` instead.
    pub fn accept_watching(
        &self,
        timeout: Duration,
        exit: Option<&DebuggeeListener>,
    ) -> Result<RawStream, Error> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(stream) = self.poll_accept()? {
                return Ok(stream);
            }
            if let Some(exit) = exit
                && exit.poll_accept()?.is_some()
            {
                return Err(Error::DebuggeeExited);
            }
            if Instant::now() >= deadline {
                return Err(Error::ConnectTimeout(timeout));
            }
            std::thread::sleep(ACCEPT_POLL);
        }
    }

    /// Take a pending connection if there is one, the returned stream is blocking.
    fn poll_accept(&self) -> Result<Option<RawStream>, Error> {
        loop {
            let accepted = match &self.inner {
                ListenerKind::Tcp(l) => l.accept().map(|(s, _)| RawStream::Tcp(s)),
                ListenerKind::Unix(l) => l.accept().map(|(s, _)| RawStream::Unix(s)),
            };
            match accepted {
                Ok(stream) => {
                    match &stream {
                        RawStream::Tcp(s) => {
                            s.set_nonblocking(false)?;
                            s.set_nodelay(true)?;
                        }
                        RawStream::Unix(s) => s.set_nonblocking(false)?,
                    }
                    return Ok(Some(stream));
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(None),
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl Drop for DebuggeeListener {
    fn drop(&mut self) {
        if let Some(path) = self.socket_file.take() {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// Connect to a listening debuggee.
pub fn connect(addr: &SocketAddress, timeout: Duration) -> Result<RawStream, Error> {
    match addr {
        SocketAddress::Unix(path) => Ok(RawStream::Unix(UnixStream::connect(path)?)),
        SocketAddress::Tcp { host, port } => {
            let mut last_err = None;
            for sock_addr in (SocketAddress::connect_host(host), *port).to_socket_addrs()? {
                match TcpStream::connect_timeout(&sock_addr, timeout) {
                    Ok(stream) => {
                        stream.set_nodelay(true)?;
                        return Ok(RawStream::Tcp(stream));
                    }
                    Err(e) if is_timeout(&e) => return Err(Error::ConnectTimeout(timeout)),
                    Err(e) => last_err = Some(e),
                }
            }
            Err(last_err
                .map(Error::from)
                .unwrap_or_else(|| Error::InvalidAddress(addr.to_string(), "host has no addresses")))
        }
    }
}

/// Turn an established socket into a channel, running the TLS handshake first if asked.
pub fn establish(
    stream: RawStream,
    server_name: &str,
    tls: Option<&TlsOptions>,
    timeout: Duration,
) -> Result<DebuggeeChannel, Error> {
    match tls {
        None => DebuggeeChannel::plain(stream),
        Some(options) => {
            let config = tls::client_config(options)?;
            let stream = tls::handshake(stream, server_name, config, timeout)?;
            DebuggeeChannel::tls(stream)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::debuggee::wire::{self, AdapterMessage};
    use std::sync::atomic::AtomicBool;

    #[test]
    fn test_unix_accept_and_exchange() {
        let dir = tempfile::tempdir().unwrap();
        let addr = SocketAddress::Unix(dir.path().join("dbg.sock"));
        let listener = DebuggeeListener::bind(&addr).unwrap();
        assert_eq!(listener.address(), &addr);

        let client = connect(&addr, Duration::from_secs(1)).unwrap();
        let server = listener.accept(Duration::from_secs(1)).unwrap();

        let mut client = DebuggeeChannel::plain(client).unwrap();
        let mut server = DebuggeeChannel::plain(server).unwrap();
        wire::write_frame(&mut client.writer, &AdapterMessage::ConfigurationDone).unwrap();
        let got: Option<AdapterMessage> = wire::read_frame(&mut server.reader).unwrap();
        assert_eq!(got, Some(AdapterMessage::ConfigurationDone));

        client.closer.close();
        let got: Option<AdapterMessage> = wire::read_frame(&mut server.reader).unwrap();
        assert_eq!(got, None);

        drop(listener);
        assert!(!dir.path().join("dbg.sock").exists());
    }

    #[test]
    fn test_accept_timeout() {
        let listener = DebuggeeListener::bind(&SocketAddress::Tcp {
            host: "127.0.0.1".to_string(),
            port: 0,
        })
        .unwrap();
        let SocketAddress::Tcp { port, .. } = listener.address() else {
            panic!("tcp address expected");
        };
        assert_ne!(*port, 0);

        let err = listener.accept(Duration::from_millis(50)).unwrap_err();
        assert!(matches!(err, Error::ConnectTimeout(_)));
    }

    #[test]
    fn test_accept_watching_exit() {
        let dir = tempfile::tempdir().unwrap();
        let listener = DebuggeeListener::bind(&SocketAddress::Unix(dir.path().join("dbg.sock"))).unwrap();
        let exit = DebuggeeListener::bind(&SocketAddress::Unix(dir.path().join("exit.sock"))).unwrap();

        let _notify = connect(exit.address(), Duration::from_secs(1)).unwrap();
        let started = Instant::now();
        let err = listener
            .accept_watching(Duration::from_secs(30), Some(&exit))
            .unwrap_err();
        assert!(matches!(err, Error::DebuggeeExited), "{err}");
        assert!(started.elapsed() < Duration::from_secs(5));

        // a debuggee that connected is preferred over a later exit
        let _debuggee = connect(listener.address(), Duration::from_secs(1)).unwrap();
        let _notify = connect(exit.address(), Duration::from_secs(1)).unwrap();
        assert!(listener.accept_watching(Duration::from_secs(1), Some(&exit)).is_ok());
    }

    /// Stream whose reads block for a poll interval and find nothing.
    struct PollingStream {
        written: Arc<Mutex<Vec<u8>>>,
        stop: Arc<AtomicBool>,
    }

    impl Read for PollingStream {
        fn read(&mut self, _: &mut [u8]) -> std::io::Result<usize> {
            if self.stop.load(Ordering::SeqCst) {
                return Ok(0);
            }
            std::thread::sleep(Duration::from_millis(20));
            Err(ErrorKind::WouldBlock.into())
        }
    }

    impl Write for PollingStream {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.written.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_shared_tls_write_during_read() {
        let written = Arc::new(Mutex::new(vec![]));
        let stop = Arc::new(AtomicBool::new(false));
        let shared = SharedTls::new(PollingStream {
            written: written.clone(),
            stop: stop.clone(),
        });

        let mut reader = shared.clone();
        let reader = std::thread::spawn(move || reader.read(&mut [0u8; 16]).unwrap());
        std::thread::sleep(Duration::from_millis(50));

        let mut writer = shared;
        let mut slowest = Duration::ZERO;
        for i in 0..20u8 {
            let started = Instant::now();
            writer.write_all(&[i]).unwrap();
            writer.flush().unwrap();
            slowest = slowest.max(started.elapsed());
        }
        assert!(slowest < Duration::from_secs(1), "{slowest:?}");
        assert_eq!(*written.lock().unwrap(), (0..20u8).collect::<Vec<_>>());

        stop.store(true, Ordering::SeqCst);
        assert_eq!(reader.join().unwrap(), 0);
    }

    #[test]
    fn test_stale_socket_file_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stale.sock");
        std::fs::write(&path, b"").unwrap();
        let listener = DebuggeeListener::bind(&SocketAddress::Unix(path.clone())).unwrap();
        assert!(connect(listener.address(), Duration::from_secs(1)).is_ok());
    }
}
