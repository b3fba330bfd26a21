//! Stream framing: an 8-byte header (big-endian u32 length, crc32c) in
//! front of every payload. The header is transport plumbing; nothing above
//! the transport ever sees it.

use std::io::{Read, Write};

use crc32c::crc32c;
use thiserror::Error;

pub const HEADER_LEN: usize = 8;

/// Ceiling on a single payload. Bounds the allocation a malicious or
/// corrupt header can demand.
pub const MAX_PAYLOAD: usize = 4 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame of {got} bytes exceeds cap of {cap}")]
    TooLarge { got: usize, cap: usize },
    #[error("frame checksum mismatch: header {header:#010x}, payload {payload:#010x}")]
    ChecksumMismatch { header: u32, payload: u32 },
}

/// Reads frames off a byte stream. `read_frame` returns `Ok(None)` on a
/// clean end-of-stream between frames; EOF inside a frame is an error.
pub struct FrameReader<R> {
    inner: R,
    cap: usize,
}

impl<R: Read> FrameReader<R> {
    pub fn new(inner: R) -> FrameReader<R> {
        FrameReader {
            inner,
            cap: MAX_PAYLOAD,
        }
    }

    pub fn with_cap(inner: R, cap: usize) -> FrameReader<R> {
        FrameReader { inner, cap }
    }

    pub fn read_frame(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        let mut header = [0u8; HEADER_LEN];
        match read_full(&mut self.inner, &mut header)? {
            Fill::Empty => return Ok(None),
            Fill::Complete => {}
        }

        let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let want = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
        if len > self.cap {
            return Err(FrameError::TooLarge {
                got: len,
                cap: self.cap,
            });
        }

        let mut payload = vec![0u8; len];
        self.inner.read_exact(&mut payload)?;
        let got = crc32c(&payload);
        if got != want {
            return Err(FrameError::ChecksumMismatch {
                header: want,
                payload: got,
            });
        }
        Ok(Some(payload))
    }
}

enum Fill {
    Empty,
    Complete,
}

/// Like `read_exact`, but distinguishes EOF before the first byte from EOF
/// partway through.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<Fill, std::io::Error> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            if filled == 0 {
                return Ok(Fill::Empty);
            }
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "stream ended inside a frame header",
            ));
        }
        filled += n;
    }
    Ok(Fill::Complete)
}

/// Writes frames onto a byte stream.
pub struct FrameWriter<W> {
    inner: W,
    cap: usize,
}

impl<W: Write> FrameWriter<W> {
    pub fn new(inner: W) -> FrameWriter<W> {
        FrameWriter {
            inner,
            cap: MAX_PAYLOAD,
        }
    }

    pub fn write_frame(&mut self, payload: &[u8]) -> Result<(), FrameError> {
        if payload.len() > self.cap {
            return Err(FrameError::TooLarge {
                got: payload.len(),
                cap: self.cap,
            });
        }
        let mut header = [0u8; HEADER_LEN];
        header[..4].copy_from_slice(&(payload.len() as u32).to_be_bytes());
        header[4..].copy_from_slice(&crc32c(payload).to_be_bytes());
        self.inner.write_all(&header)?;
        self.inner.write_all(payload)?;
        self.inner.flush()?;
        Ok(())
    }
}
