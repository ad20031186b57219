use crate::output::Pipeline;
use std::io::Write;

/// Formats report lines into pooled buffers and posts them to the pipeline.
///
/// Each line is `<prefix><path>[.<stat>] <value> <timestamp>\n`.  A buffer is posted as soon
/// as it passes the high-water mark; whatever is left goes out on `flush` or drop.
pub struct Emitter<'a> {
    pipeline: &'a Pipeline,
    prefix: &'a [u8],
    ts: u64,
    buf: Vec<u8>,
    lines: u64,
}

impl<'a> Emitter<'a> {
    pub fn new(pipeline: &'a Pipeline, prefix: &'a str, ts: u64) -> Emitter<'a> {
        Emitter {
            pipeline,
            prefix: prefix.as_bytes(),
            ts,
            buf: pipeline.buffers().acquire(),
            lines: 0,
        }
    }

    /// Writes one line.  Non-finite values are skipped, since no backend can store them.
    pub fn line(&mut self, path: &[u8], stat: Option<&str>, value: f64) {
        if !value.is_finite() {
            return;
        }

        self.buf.extend_from_slice(self.prefix);
        self.buf.extend_from_slice(path);
        if let Some(stat) = stat {
            self.buf.push(b'.');
            self.buf.extend_from_slice(stat.as_bytes());
        }
        // Writing into a Vec cannot fail.
        let _ = writeln!(self.buf, " {} {}", value, self.ts);
        self.lines += 1;

        if self.buf.len() >= self.pipeline.buffers().high_water() {
            let full = std::mem::replace(&mut self.buf, self.pipeline.buffers().acquire());
            self.pipeline.send(full);
        }
    }

    /// Writes one line for an integer statistic.
    pub fn count(&mut self, path: &[u8], stat: Option<&str>, value: u64) { self.line(path, stat, value as f64) }

    /// Lines written so far.
    pub fn lines(&self) -> u64 { self.lines }

    /// Posts whatever is buffered.
    pub fn flush(&mut self) {
        if self.buf.is_empty() {
            return;
        }

        let data = std::mem::replace(&mut self.buf, self.pipeline.buffers().acquire());
        self.pipeline.send(data);
    }
}

impl<'a> Drop for Emitter<'a> {
    fn drop(&mut self) {
        let data = std::mem::take(&mut self.buf);
        // Pipeline::send recycles an empty buffer rather than posting it.
        self.pipeline.send(data);
    }
}

#[cfg(test)]
mod tests {
    use super::Emitter;
    use crate::output::{Buffers, MemorySink, Pipeline, Target, Transport};
    use std::sync::Arc;

    fn pipeline(high_water: usize) -> (Pipeline, MemorySink) {
        let buffers = Arc::new(Buffers::new(4, 256, high_water));
        let sink = MemorySink::new();
        let transport: Box<dyn Transport> = Box::new(sink.clone());
        let target = Arc::new(Target::new("mem".to_owned(), transport, 64, 1, Arc::clone(&buffers)));
        (Pipeline::new(buffers, vec![target]), sink)
    }

    #[test]
    fn test_emitter_line_format() {
        let (p, sink) = pipeline(4096);
        {
            let mut e = Emitter::new(&p, "stats.timers.", 1_500);
            e.line(b"web.req", Some("mean"), 2.5);
            e.count(b"web.req", Some("count"), 3);
            e.line(b"web.req", Some("upper"), f64::NAN);
            assert_eq!(e.lines(), 2);
        }
        p.targets()[0].tick();

        assert_eq!(
            sink.lines(),
            vec!["stats.timers.web.req.mean 2.5 1500".to_owned(), "stats.timers.web.req.count 3 1500".to_owned()]
        );
    }

    #[test]
    fn test_emitter_posts_at_high_water() {
        let (p, sink) = pipeline(40);
        let mut e = Emitter::new(&p, "", 10);
        for i in 0..10 {
            e.line(format!("metric.{}", i).as_bytes(), None, i as f64);
        }
        assert!(p.buffers().posted() >= 2);
        e.flush();
        drop(e);

        p.targets()[0].tick();
        assert_eq!(sink.lines().len(), 10);
        assert_eq!(sink.lines()[9], "metric.9 9 10");
        assert_eq!(p.buffers().outstanding(), 0);
    }

    #[test]
    fn test_emitter_posts_nothing_when_idle() {
        let (p, _sink) = pipeline(4096);
        drop(Emitter::new(&p, "", 10));
        assert_eq!(p.buffers().posted(), 0);
    }
}
