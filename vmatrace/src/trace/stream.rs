//! Seekable line streams
//!
//! Stack attribution and the fork/exec recognizer read ahead of the current
//! event and then rewind. Both only need "remember where I am" and "go
//! back there", which is what [`TraceStream`] offers.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Seek, SeekFrom};
use std::path::Path;

/// Opaque stream position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamPos {
    offset: u64,
    line_no: u64,
}

impl StreamPos {
    /// Number of the last line handed out (1-based; 0 before the first)
    #[must_use]
    pub fn line_no(&self) -> u64 {
        self.line_no
    }
}

/// A line source that can rewind to a remembered position
pub trait TraceStream {
    /// Next line without its terminator, with its 1-based line number.
    /// `Ok(None)` at end of stream.
    ///
    /// # Errors
    /// Propagates read errors of the underlying source.
    fn next_line(&mut self) -> io::Result<Option<(u64, String)>>;

    fn position(&self) -> StreamPos;

    /// # Errors
    /// Propagates seek errors of the underlying source.
    fn seek(&mut self, pos: StreamPos) -> io::Result<()>;
}

/// Stream over any buffered, seekable reader (normally a trace file)
#[derive(Debug)]
pub struct FileStream<R> {
    reader: R,
    pos: StreamPos,
    buf: Vec<u8>,
}

impl FileStream<BufReader<File>> {
    /// # Errors
    /// Returns the error from opening `path`.
    pub fn open(path: &Path) -> io::Result<Self> {
        Ok(Self::new(BufReader::new(File::open(path)?)))
    }
}

impl<R: BufRead + Seek> FileStream<R> {
    pub fn new(reader: R) -> Self {
        Self { reader, pos: StreamPos::default(), buf: Vec::new() }
    }
}

impl<R: BufRead + Seek> TraceStream for FileStream<R> {
    fn next_line(&mut self) -> io::Result<Option<(u64, String)>> {
        self.buf.clear();
        let read = self.reader.read_until(b'\n', &mut self.buf)?;
        if read == 0 {
            return Ok(None);
        }
        self.pos.offset += read as u64;
        self.pos.line_no += 1;

        while matches!(self.buf.last(), Some(b'\n' | b'\r')) {
            self.buf.pop();
        }
        // Traces occasionally carry non-UTF-8 task names
        let line = String::from_utf8_lossy(&self.buf).into_owned();
        Ok(Some((self.pos.line_no, line)))
    }

    fn position(&self) -> StreamPos {
        self.pos
    }

    fn seek(&mut self, pos: StreamPos) -> io::Result<()> {
        if pos != self.pos {
            self.reader.seek(SeekFrom::Start(pos.offset))?;
            self.pos = pos;
        }
        Ok(())
    }
}

/// In-memory stream, used for tests and small traces
#[derive(Debug, Clone, Default)]
pub struct MemoryStream {
    lines: Vec<String>,
    next: usize,
}

impl MemoryStream {
    #[must_use]
    pub fn new(text: &str) -> Self {
        Self { lines: text.lines().map(String::from).collect(), next: 0 }
    }
}

impl TraceStream for MemoryStream {
    fn next_line(&mut self) -> io::Result<Option<(u64, String)>> {
        let Some(line) = self.lines.get(self.next) else {
            return Ok(None);
        };
        self.next += 1;
        Ok(Some((self.next as u64, line.clone())))
    }

    fn position(&self) -> StreamPos {
        StreamPos { offset: self.next as u64, line_no: self.next as u64 }
    }

    fn seek(&mut self, pos: StreamPos) -> io::Result<()> {
        let target = usize::try_from(pos.offset)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "position out of range"))?;
        if target > self.lines.len() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "position past end of stream"));
        }
        self.next = target;
        Ok(())
    }
}
