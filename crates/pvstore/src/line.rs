//! Line-oriented access to partition files.
//!
//! Every record is one escaped line, so all positioning works on line boundaries. A newline that
//! directly follows an escape byte never ends a line; forward and backward scans agree on this rule.
//!
//! ```text
//!            seek_to_before_previous_line(p)
//!                  ◄────────────┐
//! ... record \n record \n rec│ord \n
//!                            p └──────────► seek_to_first_new_line()
//! ```

use crate::codec::escape::{ESCAPE_CHAR, NEWLINE_CHAR};
use crate::error::{Result, StoreError};
use std::fs::File;
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Read buffer size, also the step of backward scans.
pub const MAX_LINE_SIZE: usize = 16 * 1024;

/// Maximum backward steps before giving up on finding a line boundary.
pub const MAX_ITERATIONS_TO_DETERMINE_LINE: usize = 1024;

/// Buffered, byte-range-bounded line reader over one file.
///
/// Lines are returned escaped and without their newline. A trailing fragment with no newline before
/// the end of the range is never returned.
pub struct LineByteStream {
    path: PathBuf,
    file: File,
    file_size: u64,
    end: u64,
    buf: Vec<u8>,
    buf_start: u64,
    buf_len: usize,
    buf_pos: usize,
    line: Vec<u8>,
}

impl LineByteStream {
    /// Opens the whole file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_range(path, 0, u64::MAX)
    }

    /// Opens the file bounded to `[start, end)`. `end` is clamped to the file size.
    pub fn open_range(path: impl AsRef<Path>, start: u64, end: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let file_size = file.metadata()?.len();
        let end = end.min(file_size);
        Ok(Self {
            path,
            file,
            file_size,
            end,
            buf: vec![0u8; MAX_LINE_SIZE],
            buf_start: start.min(end),
            buf_len: 0,
            buf_pos: 0,
            line: Vec::new(),
        })
    }

    /// Path of the underlying file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Offset of the next byte to be read.
    pub fn position(&self) -> u64 {
        self.buf_start + self.buf_pos as u64
    }

    /// Exclusive end of the readable range.
    pub fn end_position(&self) -> u64 {
        self.end
    }

    /// Size of the file when it was opened.
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Moves the read position to `position`, discarding buffered bytes.
    pub fn seek_to(&mut self, position: u64) {
        self.buf_start = position.min(self.end);
        self.buf_len = 0;
        self.buf_pos = 0;
    }

    /// Reads the next complete line.
    ///
    /// Returns `None` at the end of the range. A trailing fragment without a newline is consumed and
    /// dropped.
    pub fn read_line(&mut self) -> Result<Option<&[u8]>> {
        self.line.clear();
        if self.scan_line(true)? {
            Ok(Some(&self.line))
        } else {
            Ok(None)
        }
    }

    /// Skips forward to the start of the first complete line after the current position.
    ///
    /// Does nothing at offset 0, which is always a line start. Returns false if no newline remains
    /// in the range.
    pub fn seek_to_first_new_line(&mut self) -> Result<bool> {
        if self.position() == 0 {
            return Ok(true);
        }
        self.scan_line(false)
    }

    /// Positions the stream at the start of the line that contains the byte before `position`.
    ///
    /// Scans backward from `position` (exclusive) for the nearest line terminator and positions just
    /// after it. Returns false, positioned at offset 0, when the scan reaches the start of the file.
    pub fn seek_to_before_previous_line(&mut self, position: u64) -> Result<bool> {
        let mut upper = position.min(self.file_size);
        let mut chunk = Vec::with_capacity(MAX_LINE_SIZE + 1);

        for _ in 0..MAX_ITERATIONS_TO_DETERMINE_LINE {
            let lower = upper.saturating_sub(MAX_LINE_SIZE as u64);
            // One byte of look-behind so an escape in the previous chunk is still seen.
            let read_from = lower.saturating_sub(1);
            chunk.resize((upper - read_from) as usize, 0);
            self.file.seek(SeekFrom::Start(read_from))?;
            self.file.read_exact(&mut chunk)?;

            let skip = (lower - read_from) as usize;
            for i in (skip..chunk.len()).rev() {
                if chunk[i] == NEWLINE_CHAR && (i == 0 || chunk[i - 1] != ESCAPE_CHAR) {
                    self.seek_to(read_from + i as u64 + 1);
                    return Ok(true);
                }
            }

            if lower == 0 {
                debug!(
                    "Reached the start of {} looking for a line before {}",
                    self.path.display(),
                    position
                );
                self.seek_to(0);
                return Ok(false);
            }
            upper = lower;
        }

        Err(StoreError::decode(
            MAX_LINE_SIZE * MAX_ITERATIONS_TO_DETERMINE_LINE,
            format!(
                "no line boundary within {} bytes before {} in {}",
                MAX_LINE_SIZE * MAX_ITERATIONS_TO_DETERMINE_LINE,
                position,
                self.path.display()
            ),
        ))
    }

    /// Positions the stream at the start of the last line of the range, complete or not.
    pub fn seek_to_before_last_line(&mut self) -> Result<bool> {
        if self.end == 0 {
            return Ok(false);
        }
        self.seek_to_before_previous_line(self.end - 1)
    }

    /// Refills the buffer from the current position. Returns false at the end of the range.
    fn fill(&mut self) -> Result<bool> {
        let position = self.position();
        if position >= self.end {
            return Ok(false);
        }
        let want = ((self.end - position) as usize).min(self.buf.len());
        self.file.seek(SeekFrom::Start(position))?;
        let mut read = 0;
        while read < want {
            match self.file.read(&mut self.buf[read..want]) {
                Ok(0) => break,
                Ok(n) => read += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
        self.buf_start = position;
        self.buf_len = read;
        self.buf_pos = 0;
        Ok(read > 0)
    }

    /// Consumes bytes through the next line terminator, optionally collecting them into `self.line`.
    fn scan_line(&mut self, collect: bool) -> Result<bool> {
        let mut pending_escape = false;
        loop {
            if self.buf_pos >= self.buf_len && !self.fill()? {
                return Ok(false);
            }
            let chunk = &self.buf[self.buf_pos..self.buf_len];
            let mut terminator = None;
            for (i, &b) in chunk.iter().enumerate() {
                if pending_escape {
                    pending_escape = false;
                } else if b == ESCAPE_CHAR {
                    pending_escape = true;
                } else if b == NEWLINE_CHAR {
                    terminator = Some(i);
                    break;
                }
            }
            match terminator {
                Some(i) => {
                    if collect {
                        self.line.extend_from_slice(&chunk[..i]);
                    }
                    self.buf_pos += i + 1;
                    return Ok(true);
                }
                None => {
                    if collect {
                        self.line.extend_from_slice(chunk);
                    }
                    self.buf_pos = self.buf_len;
                }
            }
        }
    }
}

/// Yields complete lines from the end of a range toward its start.
pub struct ReverseLineReader {
    stream: LineByteStream,
    lower: u64,
    upper: u64,
}

impl ReverseLineReader {
    /// Reads lines that lie entirely within `[lower, end)`; `end` is clamped to the file size.
    ///
    /// An unterminated fragment at the end of the range is skipped.
    pub fn open(path: impl AsRef<Path>, lower: u64, end: u64) -> Result<Self> {
        let mut stream = LineByteStream::open_range(path, 0, end)?;
        let range_end = stream.end_position();
        let upper = if stream.seek_to_before_previous_line(range_end)? {
            stream.position()
        } else {
            0
        };
        Ok(Self {
            stream,
            lower,
            upper,
        })
    }

    /// Returns the previous line and its start offset, or `None` once `lower` is reached.
    pub fn next_line(&mut self) -> Result<Option<(u64, Vec<u8>)>> {
        if self.upper <= self.lower || self.upper == 0 {
            return Ok(None);
        }
        // upper - 1 is the terminator of the line we want.
        let start = if self.stream.seek_to_before_previous_line(self.upper - 1)? {
            self.stream.position()
        } else {
            0
        };
        if start < self.lower {
            self.upper = self.lower;
            return Ok(None);
        }
        self.stream.seek_to(start);
        let line = match self.stream.read_line()? {
            Some(line) => line.to_vec(),
            None => return Ok(None),
        };
        self.upper = start;
        Ok(Some((start, line)))
    }

    /// Exclusive end of the next line to be returned, including its newline.
    pub fn upper(&self) -> u64 {
        self.upper
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write_file(bytes: &[u8]) -> (TempDir, PathBuf) {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("lines.bin");
        fs::write(&path, bytes).unwrap();
        (temp_dir, path)
    }

    fn collect_lines(stream: &mut LineByteStream) -> Vec<Vec<u8>> {
        let mut lines = Vec::new();
        while let Some(line) = stream.read_line().unwrap() {
            lines.push(line.to_vec());
        }
        lines
    }

    #[test]
    fn test_read_lines_drops_partial_tail() {
        let (_temp_dir, path) = write_file(b"head\none\ntwo\npartial");
        let mut stream = LineByteStream::open(&path).unwrap();
        assert_eq!(
            collect_lines(&mut stream),
            vec![b"head".to_vec(), b"one".to_vec(), b"two".to_vec()]
        );
    }

    #[test]
    fn test_range_end_bounds_lines() {
        let (_temp_dir, path) = write_file(b"aa\nbb\ncc\n");
        // The newline ending "bb" is at offset 5, so an end of 5 excludes it.
        let mut stream = LineByteStream::open_range(&path, 0, 5).unwrap();
        assert_eq!(collect_lines(&mut stream), vec![b"aa".to_vec()]);
        let mut stream = LineByteStream::open_range(&path, 0, 6).unwrap();
        assert_eq!(collect_lines(&mut stream), vec![b"aa".to_vec(), b"bb".to_vec()]);
    }

    #[test]
    fn test_seek_to_first_new_line_snaps_forward() {
        let (_temp_dir, path) = write_file(b"aaaa\nbbbb\ncccc\n");
        let mut stream = LineByteStream::open_range(&path, 2, u64::MAX).unwrap();
        assert!(stream.seek_to_first_new_line().unwrap());
        assert_eq!(stream.position(), 5);
        assert_eq!(stream.read_line().unwrap(), Some(&b"bbbb"[..]));

        // Starting on a newline lands on the following line.
        let mut stream = LineByteStream::open_range(&path, 4, u64::MAX).unwrap();
        stream.seek_to_first_new_line().unwrap();
        assert_eq!(stream.read_line().unwrap(), Some(&b"bbbb"[..]));

        // Offset zero is already a line start.
        let mut stream = LineByteStream::open(&path).unwrap();
        stream.seek_to_first_new_line().unwrap();
        assert_eq!(stream.read_line().unwrap(), Some(&b"aaaa"[..]));
    }

    #[test]
    fn test_escaped_newline_is_not_a_terminator() {
        let (_temp_dir, path) = write_file(&[
            b'a',
            ESCAPE_CHAR,
            NEWLINE_CHAR,
            b'b',
            NEWLINE_CHAR,
            b'c',
            NEWLINE_CHAR,
        ]);
        let mut stream = LineByteStream::open(&path).unwrap();
        let lines = collect_lines(&mut stream);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], vec![b'a', ESCAPE_CHAR, NEWLINE_CHAR, b'b']);

        let mut stream = LineByteStream::open(&path).unwrap();
        assert!(!stream.seek_to_before_previous_line(4).unwrap());
        assert_eq!(stream.position(), 0);
    }

    #[test]
    fn test_seek_to_before_last_line() {
        let (_temp_dir, path) = write_file(b"head\none\ntwo\n");
        let mut stream = LineByteStream::open(&path).unwrap();
        assert!(stream.seek_to_before_last_line().unwrap());
        assert_eq!(stream.position(), 9);
        assert_eq!(stream.read_line().unwrap(), Some(&b"two"[..]));

        let (_temp_dir, path) = write_file(b"head\none\ntw");
        let mut stream = LineByteStream::open(&path).unwrap();
        assert!(stream.seek_to_before_last_line().unwrap());
        assert_eq!(stream.position(), 9);
        assert_eq!(stream.read_line().unwrap(), None);
    }

    #[test]
    fn test_backward_scan_across_chunks() {
        let mut bytes = b"head\n".to_vec();
        bytes.extend(std::iter::repeat(b'x').take(MAX_LINE_SIZE * 3));
        bytes.push(NEWLINE_CHAR);
        bytes.extend_from_slice(b"tail\n");
        let (_temp_dir, path) = write_file(&bytes);

        let mut stream = LineByteStream::open(&path).unwrap();
        let long_line_end = (5 + MAX_LINE_SIZE * 3) as u64;
        assert!(stream.seek_to_before_previous_line(long_line_end).unwrap());
        assert_eq!(stream.position(), 5);
        let line = stream.read_line().unwrap().unwrap();
        assert_eq!(line.len(), MAX_LINE_SIZE * 3);
    }

    #[test]
    fn test_reverse_reader() {
        let (_temp_dir, path) = write_file(b"head\none\ntwo\nthree\npart");
        let mut reader = ReverseLineReader::open(&path, 5, u64::MAX).unwrap();
        assert_eq!(reader.upper(), 19);
        assert_eq!(reader.next_line().unwrap(), Some((13, b"three".to_vec())));
        assert_eq!(reader.next_line().unwrap(), Some((9, b"two".to_vec())));
        assert_eq!(reader.next_line().unwrap(), Some((5, b"one".to_vec())));
        assert_eq!(reader.next_line().unwrap(), None);
    }
}
