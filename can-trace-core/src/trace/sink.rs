//! Trace sinks
//!
//! A sink receives finished trace lines in order. Lines are never rewritten.

use parking_lot::Mutex;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Destination for rendered trace lines
pub trait TraceSink: Send {
    /// Append one line (without line terminator)
    fn write_line(&mut self, line: &str) -> io::Result<()>;

    /// Push buffered lines to the underlying storage
    fn flush(&mut self) -> io::Result<()>;

    /// Flush and make the trace durable. Called once at session stop.
    fn finish(&mut self) -> io::Result<()>;
}

/// Buffered file sink, fsynced on finish
pub struct FileSink {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl FileSink {
    /// Create (or truncate) the trace file
    pub fn create(path: &Path) -> io::Result<Self> {
        let file = File::create(path)?;
        log::info!("Writing trace to {:?}", path);
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TraceSink for FileSink {
    fn write_line(&mut self, line: &str) -> io::Result<()> {
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\n")
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }

    fn finish(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        log::debug!("Trace file {:?} synced", self.path);
        Ok(())
    }
}

#[derive(Default)]
struct MemoryInner {
    lines: Vec<String>,
    finishes: usize,
    write_delay: Option<Duration>,
    /// Writes after this many stored lines get the delay; all of them when None
    delay_after: Option<usize>,
    fail_after: Option<usize>,
}

/// In-memory sink; clones share the same buffer
///
/// Useful for embedding the recorder and for tests (write delays and write failures
/// can be injected).
#[derive(Clone, Default)]
pub struct MemorySink {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder method: sleep this long on every write
    pub fn with_write_delay(self, delay: Duration) -> Self {
        self.inner.lock().write_delay = Some(delay);
        self
    }

    /// Builder method: sleep `delay` on every write once `lines` lines are stored
    pub fn stall_after(self, lines: usize, delay: Duration) -> Self {
        {
            let mut inner = self.inner.lock();
            inner.write_delay = Some(delay);
            inner.delay_after = Some(lines);
        }
        self
    }

    /// Builder method: fail every write after `lines` successful ones
    pub fn fail_after(self, lines: usize) -> Self {
        self.inner.lock().fail_after = Some(lines);
        self
    }

    /// Copy of every line written so far
    pub fn lines(&self) -> Vec<String> {
        self.inner.lock().lines.clone()
    }

    /// Lines that are trace records (header comments excluded)
    pub fn records(&self) -> Vec<String> {
        self.inner
            .lock()
            .lines
            .iter()
            .filter(|l| !l.starts_with(';'))
            .cloned()
            .collect()
    }

    /// Whole trace as text
    pub fn contents(&self) -> String {
        let inner = self.inner.lock();
        let mut text = inner.lines.join("\n");
        text.push('\n');
        text
    }

    /// Number of times `finish` was called
    pub fn finish_count(&self) -> usize {
        self.inner.lock().finishes
    }
}

impl TraceSink for MemorySink {
    fn write_line(&mut self, line: &str) -> io::Result<()> {
        let delay = {
            let inner = self.inner.lock();
            if let Some(limit) = inner.fail_after {
                if inner.lines.len() >= limit {
                    return Err(io::Error::new(io::ErrorKind::Other, "memory sink full"));
                }
            }
            match inner.delay_after {
                Some(after) if inner.lines.len() < after => None,
                _ => inner.write_delay,
            }
        };
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        self.inner.lock().lines.push(line.to_string());
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn finish(&mut self) -> io::Result<()> {
        self.inner.lock().finishes += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_sink_writes_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.trc");

        let mut sink = FileSink::create(&path).unwrap();
        sink.write_line(";$FILEVERSION=1.1").unwrap();
        sink.write_line("     1)         0.0  Rx     100       0").unwrap();
        sink.finish().unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 2);
        assert!(text.ends_with('\n'));
    }

    #[test]
    fn test_memory_sink_shares_buffer() {
        let sink = MemorySink::new();
        let mut writer = sink.clone();
        writer.write_line("; header").unwrap();
        writer.write_line("record").unwrap();
        writer.finish().unwrap();

        assert_eq!(sink.lines().len(), 2);
        assert_eq!(sink.records(), vec!["record".to_string()]);
        assert_eq!(sink.finish_count(), 1);
    }

    #[test]
    fn test_memory_sink_failure_injection() {
        let mut sink = MemorySink::new().fail_after(1);
        sink.write_line("first").unwrap();
        assert!(sink.write_line("second").is_err());
    }

    #[test]
    fn test_memory_sink_stall_starts_late() {
        let mut sink = MemorySink::new().stall_after(1, Duration::from_millis(50));
        let started = std::time::Instant::now();
        sink.write_line("fast").unwrap();
        assert!(started.elapsed() < Duration::from_millis(50));
        sink.write_line("slow").unwrap();
        assert!(started.elapsed() >= Duration::from_millis(50));
    }
}
