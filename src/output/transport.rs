use super::Snapshot;
use parking_lot::Mutex;
use std::{
    io::{self, Write},
    net::{Shutdown, TcpStream, ToSocketAddrs},
    sync::Arc,
    time::Duration,
};

/// A byte sink a target writes report buffers into.
///
/// Writes must not block for long: a transport should accept what it can right now and
/// report how much that was.  `Ok(0)` means "try again later".
pub trait Transport: Send {
    /// Establishes the connection.  Called whenever `is_connected` says we are not.
    fn connect(&mut self) -> io::Result<()>;

    fn is_connected(&self) -> bool;

    /// Writes as much of `data` as the transport accepts without blocking.
    fn write(&mut self, data: &[u8]) -> io::Result<usize>;

    fn disconnect(&mut self);

    /// Where this transport sends to, for logging.
    fn describe(&self) -> String;
}

/// A line-protocol TCP backend.
pub struct Tcp {
    host: String,
    port: u16,
    timeout: Duration,
    stream: Option<TcpStream>,
}

impl Tcp {
    pub fn new(host: &str, port: u16, timeout: Duration) -> Tcp {
        Tcp {
            host: host.to_owned(),
            port,
            timeout,
            stream: None,
        }
    }
}

impl Transport for Tcp {
    fn connect(&mut self) -> io::Result<()> {
        let mut last = None;
        for addr in (self.host.as_str(), self.port).to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, self.timeout) {
                Ok(stream) => {
                    stream.set_nonblocking(true)?;
                    stream.set_nodelay(true)?;
                    self.stream = Some(stream);
                    return Ok(());
                },
                Err(e) => last = Some(e),
            }
        }

        Err(last.unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, "host resolved to no addresses")))
    }

    fn is_connected(&self) -> bool { self.stream.is_some() }

    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let stream = match self.stream.as_mut() {
            Some(stream) => stream,
            None => return Err(io::Error::new(io::ErrorKind::NotConnected, "not connected")),
        };

        match stream.write(data) {
            Ok(0) if !data.is_empty() => Err(io::Error::new(io::ErrorKind::WriteZero, "connection closed")),
            Ok(n) => Ok(n),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::Interrupted => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn disconnect(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    fn describe(&self) -> String { format!("{}:{}", self.host, self.port) }
}

/// Writes reports to standard output.
#[derive(Default)]
pub struct Stdout;

impl Transport for Stdout {
    fn connect(&mut self) -> io::Result<()> { Ok(()) }

    fn is_connected(&self) -> bool { true }

    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let out = io::stdout();
        let mut out = out.lock();
        out.write_all(data)?;
        out.flush()?;
        Ok(data.len())
    }

    fn disconnect(&mut self) {}

    fn describe(&self) -> String { "stdout".to_owned() }
}

#[derive(Default)]
struct MemoryState {
    data: Vec<u8>,
    offline: bool,
    write_limit: Option<usize>,
    connected: bool,
    connects: usize,
}

/// An in-process sink that keeps everything written to it.
///
/// Clones share the same storage, so one handle can be given to a target while another is
/// kept to inspect what arrived.  It can also be taken offline or made to accept short
/// writes, to exercise reconnect and partial-write handling.
#[derive(Clone, Default)]
pub struct MemorySink {
    state: Arc<Mutex<MemoryState>>,
}

impl MemorySink {
    pub fn new() -> MemorySink { MemorySink::default() }

    /// Everything written so far.
    pub fn contents(&self) -> Vec<u8> { self.state.lock().data.clone() }

    /// Takes everything written so far, leaving the sink empty.
    pub fn take(&self) -> Vec<u8> { std::mem::take(&mut self.state.lock().data) }

    /// Everything written so far, split into lines.
    pub fn lines(&self) -> Vec<String> {
        String::from_utf8_lossy(&self.contents())
            .lines()
            .map(str::to_owned)
            .collect()
    }

    /// Parses everything written so far as report lines.
    pub fn snapshot(&self) -> Snapshot { Snapshot::parse(&self.contents()) }

    /// While offline, connects fail and an open connection breaks on the next write.
    pub fn set_online(&self, online: bool) { self.state.lock().offline = !online; }

    /// Caps how many bytes a single write accepts.
    pub fn set_write_limit(&self, limit: Option<usize>) { self.state.lock().write_limit = limit; }

    /// Number of successful connects.
    pub fn connects(&self) -> usize { self.state.lock().connects }
}

impl Transport for MemorySink {
    fn connect(&mut self) -> io::Result<()> {
        let mut state = self.state.lock();
        if state.offline {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "memory sink offline"));
        }

        state.connected = true;
        state.connects += 1;
        Ok(())
    }

    fn is_connected(&self) -> bool { self.state.lock().connected }

    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        if state.offline {
            state.connected = false;
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "memory sink offline"));
        }

        let n = state.write_limit.map_or(data.len(), |limit| limit.min(data.len()));
        state.data.extend_from_slice(&data[..n]);
        Ok(n)
    }

    fn disconnect(&mut self) { self.state.lock().connected = false; }

    fn describe(&self) -> String { "memory".to_owned() }
}
