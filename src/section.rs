// Copyright (c) 2021, BlockProject 3D
//
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without modification,
// are permitted provided that the following conditions are met:
//
//     * Redistributions of source code must retain the above copyright notice,
//       this list of conditions and the following disclaimer.
//     * Redistributions in binary form must reproduce the above copyright notice,
//       this list of conditions and the following disclaimer in the documentation
//       and/or other materials provided with the distribution.
//     * Neither the name of BlockProject 3D nor the names of its contributors
//       may be used to endorse or promote products derived from this software
//       without specific prior written permission.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS
// "AS IS" AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT
// LIMITED TO, THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR
// A PARTICULAR PURPOSE ARE DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT OWNER OR
// CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL, SPECIAL,
// EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO,
// PROCUREMENT OF SUBSTITUTE GOODS OR SERVICES; LOSS OF USE, DATA, OR
// PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF
// LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING
// NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE OF THIS
// SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

//! The length-prefixed, seekable section framing every part of a trace or
//! cache stream is built out of.
//!
//! A section is an 8-byte little-endian declared size followed by that many
//! bytes of section-specific content. The size is a back-patch: the writer
//! reserves the 8 bytes up front, streams the body, then goes back and fills
//! in the real length once the body is known. The reader uses the declared
//! size purely as a bound; it never needs to buffer a whole section to
//! start decoding it.

use std::io::{Read, Seek, SeekFrom, Write};

use byteorder::{ByteOrder, LittleEndian};
use bytesutil::ReadFill;

use crate::error::{ReadError, WriteError};
use crate::util::fits_in_width;

/// Size, in bytes, of the read-ahead buffer a [`SectionReader`] fills from
/// its underlying stream at a time.
pub const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Size, in bytes, of the write-behind buffer a [`SectionWriter`] accumulates
/// before flushing to its underlying stream.
pub const WRITE_BUFFER_SIZE: usize = 4 * 1024 * 1024;

/// Reads the framed content of one section, enforcing its declared length.
///
/// Owns its backing stream by value (rather than borrowing it) so that a
/// long-lived reader phase can store a `SectionReader<R>` directly as a
/// struct field without becoming self-referential; a one-off read just
/// instantiates it with `R = &mut SomeStream`.
pub struct SectionReader<R> {
    inner: R,
    name: &'static str,
    declared_size: u64,
    remaining: u64,
}

impl<R: Read> SectionReader<R> {
    /// Reads the 8-byte size prefix for a section named `name` and returns a
    /// reader bounded to that many following bytes.
    pub fn start(mut inner: R, name: &'static str) -> Result<Self, ReadError> {
        let mut buf = [0u8; 8];
        inner.read_fill(&mut buf).map_err(|_| ReadError::UnexpectedEndOfStream { section: name })?;
        let declared_size = LittleEndian::read_u64(&buf);
        Ok(SectionReader { inner, name, declared_size, remaining: declared_size })
    }

    /// The number of bytes of section content not yet consumed.
    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    /// Reads exactly `buf.len()` bytes from the section.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<(), ReadError> {
        if buf.len() as u64 > self.remaining {
            return Err(ReadError::UnexpectedEndOfSection { section: self.name });
        }
        let got = self
            .inner
            .read_fill(buf)
            .map_err(|_| ReadError::UnexpectedEndOfStream { section: self.name })?;
        if got != buf.len() {
            return Err(ReadError::UnexpectedEndOfStream { section: self.name });
        }
        self.remaining -= buf.len() as u64;
        Ok(())
    }

    /// Reads a single byte from the section.
    pub fn read_u8(&mut self) -> Result<u8, ReadError> {
        let mut buf = [0u8; 1];
        self.read(&mut buf)?;
        Ok(buf[0])
    }

    /// Reads a little-endian `u16` from the section.
    pub fn read_u16(&mut self) -> Result<u16, ReadError> {
        let mut buf = [0u8; 2];
        self.read(&mut buf)?;
        Ok(LittleEndian::read_u16(&buf))
    }

    /// Reads a little-endian `u32` from the section.
    pub fn read_u32(&mut self) -> Result<u32, ReadError> {
        let mut buf = [0u8; 4];
        self.read(&mut buf)?;
        Ok(LittleEndian::read_u32(&buf))
    }

    /// Reads a little-endian `u64` from the section.
    pub fn read_u64(&mut self) -> Result<u64, ReadError> {
        let mut buf = [0u8; 8];
        self.read(&mut buf)?;
        Ok(LittleEndian::read_u64(&buf))
    }

    /// Reads `width` little-endian bytes and zero-extends them into a `u64`.
    ///
    /// Used for variable-width fields such as physical addresses, whose
    /// width is dictated by the machine description rather than fixed at
    /// compile time.
    pub fn read_uint(&mut self, width: usize) -> Result<u64, ReadError> {
        debug_assert!(width <= 8);
        let mut buf = [0u8; 8];
        self.read(&mut buf[..width])?;
        Ok(LittleEndian::read_uint(&buf[..width], width))
    }

    /// Reads a byte vector of exactly `len` bytes.
    pub fn read_vec(&mut self, len: usize) -> Result<Vec<u8>, ReadError> {
        let mut buf = vec![0u8; len];
        self.read(&mut buf)?;
        Ok(buf)
    }

    /// Reads a `T`-width length prefix followed by that many bytes, where
    /// `T` is `u8`, `u16` or `u32`.
    pub fn read_sized_buffer_u8(&mut self) -> Result<Vec<u8>, ReadError> {
        let len = self.read_u8()? as usize;
        self.read_vec(len)
    }

    /// Reads a `u16`-prefixed length followed by that many bytes.
    pub fn read_sized_buffer_u16(&mut self) -> Result<Vec<u8>, ReadError> {
        let len = self.read_u16()? as usize;
        self.read_vec(len)
    }

    /// Reads a `u8`-length-prefixed UTF-8 string.
    pub fn read_string(&mut self) -> Result<String, ReadError> {
        let bytes = self.read_sized_buffer_u8()?;
        String::from_utf8(bytes).map_err(|e| ReadError::MalformedSection {
            section: self.name,
            detail: format!("invalid utf-8 in string field: {}", e),
        })
    }

    /// Consumes any bytes of the section the caller chose not to read, so the
    /// next `SectionReader::start` call lands on the following section's
    /// size prefix. Returns the underlying stream.
    pub fn finish(mut self) -> Result<R, ReadError> {
        let mut scratch = [0u8; READ_BUFFER_SIZE];
        while self.remaining > 0 {
            let take = (self.remaining as usize).min(scratch.len());
            self.read(&mut scratch[..take])?;
        }
        Ok(self.inner)
    }
}

impl<R: Read + Seek> SectionReader<R> {
    /// Repositions the read cursor to `rel` bytes from the start of this
    /// section's content, bounds-checked against the declared size.
    ///
    /// Unlike plain sequential reads this requires a seekable stream: the
    /// section's start position is recovered from the stream's current
    /// position and how much of the section has been consumed so far, then
    /// used as the base for an absolute seek.
    pub fn seek(&mut self, rel: u64) -> Result<(), ReadError> {
        if rel > self.declared_size {
            return Err(ReadError::UnexpectedEndOfSection { section: self.name });
        }
        let consumed = self.declared_size - self.remaining;
        let current_pos = self.inner.stream_position()?;
        let section_start = current_pos - consumed;
        self.inner.seek(SeekFrom::Start(section_start + rel))?;
        self.remaining = self.declared_size - rel;
        Ok(())
    }

    /// Advances the underlying stream to the first byte after this section,
    /// without reading its remaining content, and returns the stream.
    pub fn seek_to_end(mut self) -> Result<R, ReadError> {
        self.inner.seek(SeekFrom::Current(self.remaining as i64))?;
        self.remaining = 0;
        Ok(self.inner)
    }
}

/// Writes the framed content of one section, back-patching its size prefix
/// once the body has been fully written.
///
/// Owns its backing stream by value, for the same reason [`SectionReader`]
/// does: the writer phase chain in [`crate::trace::writer`] stores a
/// `SectionWriter<W>` directly inside each phase struct and hands the
/// underlying stream back on `finalize`.
pub struct SectionWriter<W> {
    inner: W,
    name: &'static str,
    start_pos: u64,
    written: u64,
    buffer: Vec<u8>,
}

impl<W: Write + Seek> SectionWriter<W> {
    /// Reserves an 8-byte size placeholder for a section named `name` and
    /// returns a writer for its content.
    pub fn start(mut inner: W, name: &'static str) -> Result<Self, WriteError> {
        let start_pos = inner.stream_position()?;
        inner.write_all(&[0u8; 8])?;
        Ok(SectionWriter {
            inner,
            name,
            start_pos,
            written: 0,
            buffer: Vec::with_capacity(WRITE_BUFFER_SIZE),
        })
    }

    fn flush_buffer(&mut self) -> Result<(), WriteError> {
        if !self.buffer.is_empty() {
            self.inner.write_all(&self.buffer)?;
            self.buffer.clear();
        }
        Ok(())
    }

    /// Appends `buf` to the section content.
    pub fn write(&mut self, buf: &[u8]) -> Result<(), WriteError> {
        self.buffer.extend_from_slice(buf);
        self.written += buf.len() as u64;
        if self.buffer.len() >= WRITE_BUFFER_SIZE {
            self.flush_buffer()?;
        }
        Ok(())
    }

    /// Writes a single byte.
    pub fn write_u8(&mut self, value: u8) -> Result<(), WriteError> {
        self.write(&[value])
    }

    /// Writes a little-endian `u16`.
    pub fn write_u16(&mut self, value: u16) -> Result<(), WriteError> {
        let mut buf = [0u8; 2];
        LittleEndian::write_u16(&mut buf, value);
        self.write(&buf)
    }

    /// Writes a little-endian `u32`.
    pub fn write_u32(&mut self, value: u32) -> Result<(), WriteError> {
        let mut buf = [0u8; 4];
        LittleEndian::write_u32(&mut buf, value);
        self.write(&buf)
    }

    /// Writes a little-endian `u64`.
    pub fn write_u64(&mut self, value: u64) -> Result<(), WriteError> {
        let mut buf = [0u8; 8];
        LittleEndian::write_u64(&mut buf, value);
        self.write(&buf)
    }

    /// Writes `value` in exactly `width` little-endian bytes, rejecting
    /// values whose non-zero bits don't fit.
    pub fn write_uint(&mut self, value: u64, width: usize) -> Result<(), WriteError> {
        if !fits_in_width(value, width) {
            return Err(WriteError::ValueTooBig {
                section: self.name,
                detail: format!("value {:#x} does not fit in {} bytes", value, width),
            });
        }
        let mut buf = [0u8; 8];
        LittleEndian::write_uint(&mut buf, value, width);
        self.write(&buf[..width])
    }

    /// Writes a `u8`-width length prefix followed by `buf`.
    pub fn write_sized_buffer_u8(&mut self, buf: &[u8]) -> Result<(), WriteError> {
        if buf.len() > u8::MAX as usize {
            return Err(WriteError::ValueTooBig {
                section: self.name,
                detail: format!("buffer of {} bytes exceeds the 255 byte limit", buf.len()),
            });
        }
        self.write_u8(buf.len() as u8)?;
        self.write(buf)
    }

    /// Writes a `u16`-width length prefix followed by `buf`.
    pub fn write_sized_buffer_u16(&mut self, buf: &[u8]) -> Result<(), WriteError> {
        if buf.len() > u16::MAX as usize {
            return Err(WriteError::ValueTooBig {
                section: self.name,
                detail: format!("buffer of {} bytes exceeds the 65535 byte limit", buf.len()),
            });
        }
        self.write_u16(buf.len() as u16)?;
        self.write(buf)
    }

    /// Writes a `u8`-length-prefixed UTF-8 string.
    pub fn write_string(&mut self, s: &str) -> Result<(), WriteError> {
        self.write_sized_buffer_u8(s.as_bytes())
    }

    /// Overwrites `bytes` at `offset` (relative to the start of this
    /// section's content), whether or not that offset has already been
    /// flushed to the underlying stream.
    ///
    /// If `offset` still falls inside the in-memory write buffer the patch
    /// happens in place; otherwise the stream is sought back to the absolute
    /// position, patched, and the cursor restored to the current end of the
    /// section so subsequent `write` calls keep appending correctly.
    pub fn write_back_at(&mut self, offset: u64, bytes: &[u8]) -> Result<(), WriteError> {
        let flushed_len = self.written - self.buffer.len() as u64;
        if offset >= flushed_len {
            let local = (offset - flushed_len) as usize;
            self.buffer[local..local + bytes.len()].copy_from_slice(bytes);
            return Ok(());
        }
        let resume = self.inner.stream_position()?;
        self.inner.seek(SeekFrom::Start(self.start_pos + 8 + offset))?;
        self.inner.write_all(bytes)?;
        self.inner.seek(SeekFrom::Start(resume))?;
        Ok(())
    }

    /// The number of content bytes written to this section so far.
    pub fn position(&self) -> u64 {
        self.written
    }

    /// Flushes any buffered content and patches the section's 8-byte size
    /// prefix with the final length. Returns the underlying stream.
    pub fn finalize(mut self) -> Result<W, WriteError> {
        self.flush_buffer()?;
        let end = self.inner.stream_position()?;
        self.inner.seek(SeekFrom::Start(self.start_pos))?;
        let mut len_buf = [0u8; 8];
        LittleEndian::write_u64(&mut len_buf, self.written);
        self.inner.write_all(&len_buf)?;
        self.inner.seek(SeekFrom::Start(end))?;
        #[cfg(feature = "debug-log")]
        println!("[bintrace] finalized section {} ({} bytes)", self.name, self.written);
        Ok(self.inner)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn round_trip_basic() {
        let mut stream = Cursor::new(Vec::new());
        let mut w = SectionWriter::start(&mut stream, "test").unwrap();
        w.write_u32(0xdead_beef).unwrap();
        w.write(b"hello").unwrap();
        w.finalize().unwrap();

        stream.set_position(0);
        let mut r = SectionReader::start(&mut stream, "test").unwrap();
        assert_eq!(r.read_u32().unwrap(), 0xdead_beef);
        let mut buf = [0u8; 5];
        r.read(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");
        r.finish().unwrap();
    }

    #[test]
    fn back_patch_after_flush() {
        let mut stream = Cursor::new(Vec::new());
        let mut w = SectionWriter::start(&mut stream, "test").unwrap();
        w.write_u32(0).unwrap();
        let patch_offset = 0u64;
        w.write(&vec![0u8; WRITE_BUFFER_SIZE + 16]).unwrap();
        w.write_back_at(patch_offset, &42u32.to_le_bytes()).unwrap();
        w.finalize().unwrap();

        stream.set_position(0);
        let mut r = SectionReader::start(&mut stream, "test").unwrap();
        assert_eq!(r.read_u32().unwrap(), 42);
        r.finish().unwrap();
    }

    #[test]
    fn read_past_section_end_is_rejected() {
        let mut stream = Cursor::new(Vec::new());
        let mut w = SectionWriter::start(&mut stream, "test").unwrap();
        w.write_u8(1).unwrap();
        w.finalize().unwrap();

        stream.set_position(0);
        let mut r = SectionReader::start(&mut stream, "test").unwrap();
        let mut buf = [0u8; 2];
        let err = r.read(&mut buf).unwrap_err();
        assert!(matches!(err, ReadError::UnexpectedEndOfSection { .. }));
    }

    #[test]
    fn seek_repositions_within_section() {
        let mut stream = Cursor::new(Vec::new());
        let mut w = SectionWriter::start(&mut stream, "test").unwrap();
        w.write_u32(1).unwrap();
        w.write_u32(2).unwrap();
        w.write_u32(3).unwrap();
        w.finalize().unwrap();

        stream.set_position(0);
        let mut r = SectionReader::start(&mut stream, "test").unwrap();
        assert_eq!(r.read_u32().unwrap(), 1);
        r.seek(8).unwrap();
        assert_eq!(r.read_u32().unwrap(), 3);
        r.seek(0).unwrap();
        assert_eq!(r.read_u32().unwrap(), 1);
        r.finish().unwrap();
    }

    #[test]
    fn seek_to_end_skips_remaining_content_only() {
        let mut stream = Cursor::new(Vec::new());
        let mut w = SectionWriter::start(stream, "first").unwrap();
        w.write_u32(0xaaaa_aaaa).unwrap();
        stream = w.finalize().unwrap();
        let mut w = SectionWriter::start(stream, "second").unwrap();
        w.write_u32(0xbbbb_bbbb).unwrap();
        stream = w.finalize().unwrap();

        stream.set_position(0);
        let r = SectionReader::start(stream, "first").unwrap();
        let stream = r.seek_to_end().unwrap();
        let mut r2 = SectionReader::start(stream, "second").unwrap();
        assert_eq!(r2.read_u32().unwrap(), 0xbbbb_bbbb);
        r2.finish().unwrap();
    }
}
