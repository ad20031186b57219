use super::{Buffers, OutputBuffer, Transport};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};

/// Counters describing a target's health.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TargetStats {
    pub bytes: u64,
    pub drops: u64,
    pub queued: usize,
    pub connected: bool,
}

struct Link {
    transport: Box<dyn Transport>,
    current: Option<Arc<OutputBuffer>>,
    offset: usize,
    backoff: u32,
}

/// One downstream backend: a bounded queue of report buffers and the connection draining it.
pub struct Target {
    name: String,
    tx: Sender<Arc<OutputBuffer>>,
    rx: Receiver<Arc<OutputBuffer>>,
    buffers: Arc<Buffers>,
    link: Mutex<Link>,
    reconnect_ticks: u32,
    bytes: AtomicU64,
    drops: AtomicU64,
    connected: AtomicBool,
}

impl Target {
    /// Creates a target holding at most `max_queued` buffers.
    ///
    /// After a failed connect the target sits out `reconnect_ticks` ticks before trying again.
    pub fn new(
        name: String, transport: Box<dyn Transport>, max_queued: usize, reconnect_ticks: u32, buffers: Arc<Buffers>,
    ) -> Target {
        let (tx, rx) = bounded(max_queued.max(1));

        Target {
            name,
            tx,
            rx,
            buffers,
            link: Mutex::new(Link {
                transport,
                current: None,
                offset: 0,
                backoff: 0,
            }),
            reconnect_ticks,
            bytes: AtomicU64::new(0),
            drops: AtomicU64::new(0),
            connected: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str { &self.name }

    /// Buffers waiting to be sent, not counting the one in flight.
    pub fn queued(&self) -> usize { self.rx.len() }

    pub fn stats(&self) -> TargetStats {
        TargetStats {
            bytes: self.bytes.load(Ordering::Relaxed),
            drops: self.drops.load(Ordering::Relaxed),
            queued: self.rx.len(),
            connected: self.connected.load(Ordering::Relaxed),
        }
    }

    /// Queues a buffer, or drops our reference to it if the queue is full.
    pub(crate) fn enqueue(&self, buf: Arc<OutputBuffer>) {
        match self.tx.try_send(buf) {
            Ok(()) => {},
            Err(TrySendError::Full(buf)) | Err(TrySendError::Disconnected(buf)) => {
                let drops = self.drops.fetch_add(1, Ordering::Relaxed) + 1;
                debug!("target {} hit its queue limit, dropped buffer ({} so far)", self.name, drops);
                self.buffers.release(buf);
            },
        }
    }

    /// Runs one send step: wait out backoff, make sure we are connected, then write as much as
    /// the transport takes.  Returns the number of bytes written.
    pub fn tick(&self) -> usize {
        let mut guard = self.link.lock();
        let link = &mut *guard;

        if link.backoff > 0 {
            link.backoff -= 1;
            return 0;
        }

        if !link.transport.is_connected() {
            if let Err(e) = link.transport.connect() {
                warn!("target {} could not connect to {}: {}", self.name, link.transport.describe(), e);
                self.connected.store(false, Ordering::Relaxed);
                link.backoff = self.reconnect_ticks;
                return 0;
            }

            info!("target {} connected to {}", self.name, link.transport.describe());
            self.connected.store(true, Ordering::Relaxed);
        }

        let mut written = 0;
        loop {
            if link.current.is_none() {
                match self.rx.try_recv() {
                    Ok(buf) => {
                        link.current = Some(buf);
                        link.offset = 0;
                    },
                    Err(_) => break,
                }
            }

            let buf = match link.current.as_ref() {
                Some(buf) => buf,
                None => break,
            };

            match link.transport.write(&buf.bytes()[link.offset..]) {
                Ok(0) => break,
                Ok(n) => {
                    link.offset += n;
                    written += n;
                    if link.offset < buf.len() {
                        // Partial write; pick up from here next tick.
                        break;
                    }

                    if let Some(done) = link.current.take() {
                        self.buffers.release(done);
                    }
                    link.offset = 0;
                },
                Err(e) => {
                    warn!("target {} lost connection to {}: {}", self.name, link.transport.describe(), e);
                    link.offset = line_start(buf.bytes(), link.offset);
                    link.transport.disconnect();
                    self.connected.store(false, Ordering::Relaxed);
                    break;
                },
            }
        }

        self.bytes.fetch_add(written as u64, Ordering::Relaxed);
        written
    }

    /// Disconnects and releases every buffer still held.
    pub(crate) fn close(&self) {
        let mut link = self.link.lock();
        if let Some(buf) = link.current.take() {
            self.buffers.release(buf);
        }
        link.offset = 0;

        while let Ok(buf) = self.rx.try_recv() {
            self.buffers.release(buf);
        }

        link.transport.disconnect();
        self.connected.store(false, Ordering::Relaxed);
    }
}

// A new connection must never start mid-line, so resume from the start of the line the
// failed write was in.
fn line_start(data: &[u8], offset: usize) -> usize {
    data[..offset.min(data.len())]
        .iter()
        .rposition(|&b| b == b'\n')
        .map_or(0, |pos| pos + 1)
}

#[cfg(test)]
mod tests {
    use super::{line_start, Target};
    use crate::output::{Buffers, MemorySink, Pipeline, Transport};
    use std::sync::Arc;

    fn single(max: usize, reconnect_ticks: u32) -> (Pipeline, MemorySink) {
        let buffers = Arc::new(Buffers::new(4, 256, 200));
        let sink = MemorySink::new();
        let transport: Box<dyn Transport> = Box::new(sink.clone());
        let target = Arc::new(Target::new("test".to_owned(), transport, max, reconnect_ticks, Arc::clone(&buffers)));
        (Pipeline::new(buffers, vec![target]), sink)
    }

    fn post(p: &Pipeline, text: &str) {
        let mut data = p.buffers().acquire();
        data.extend_from_slice(text.as_bytes());
        p.send(data);
    }

    #[test]
    fn test_line_start() {
        assert_eq!(line_start(b"a 1 1\nb 2 1\n", 0), 0);
        assert_eq!(line_start(b"a 1 1\nb 2 1\n", 3), 0);
        assert_eq!(line_start(b"a 1 1\nb 2 1\n", 6), 6);
        assert_eq!(line_start(b"a 1 1\nb 2 1\n", 9), 6);
    }

    #[test]
    fn test_partial_writes_resume() {
        let (p, sink) = single(4, 1);
        sink.set_write_limit(Some(4));
        post(&p, "abc 1 1\n");

        let target = &p.targets()[0];
        assert_eq!(target.tick(), 4);
        assert_eq!(p.buffers().outstanding(), 1);
        assert_eq!(target.tick(), 4);
        assert_eq!(sink.contents(), b"abc 1 1\n".to_vec());
        assert_eq!(p.buffers().outstanding(), 0);
    }

    #[test]
    fn test_backoff_after_failed_connect() {
        let (p, sink) = single(4, 2);
        sink.set_online(false);
        post(&p, "a 1 1\n");

        let target = &p.targets()[0];
        assert_eq!(target.tick(), 0);
        assert!(!target.stats().connected);

        // Back online, but still waiting out the backoff.
        sink.set_online(true);
        assert_eq!(target.tick(), 0);
        assert_eq!(target.tick(), 0);
        assert_eq!(sink.connects(), 0);

        assert_eq!(target.tick(), 6);
        assert!(target.stats().connected);
        assert_eq!(sink.lines(), vec!["a 1 1".to_owned()]);
    }

    #[test]
    fn test_broken_connection_resends_whole_line() {
        let (p, sink) = single(4, 0);
        sink.set_write_limit(Some(8));
        post(&p, "a 1 1\nbb 2 1\n");

        let target = &p.targets()[0];
        assert_eq!(target.tick(), 8);

        sink.set_online(false);
        assert_eq!(target.tick(), 0);
        assert!(!target.stats().connected);

        sink.set_online(true);
        sink.set_write_limit(None);
        target.tick();
        // The half-sent "bb" went down with the old connection; the new one gets the line whole.
        assert_eq!(sink.contents(), b"a 1 1\nbbbb 2 1\n".to_vec());
        assert_eq!(sink.connects(), 2);
        assert_eq!(p.buffers().outstanding(), 0);
    }

    #[test]
    fn test_close_releases_everything() {
        let (p, sink) = single(4, 0);
        sink.set_online(false);
        post(&p, "a 1 1\n");
        post(&p, "b 1 1\n");
        assert_eq!(p.buffers().outstanding(), 2);

        p.targets()[0].close();
        assert_eq!(p.buffers().outstanding(), 0);
        assert_eq!(p.targets()[0].queued(), 0);
    }
}
