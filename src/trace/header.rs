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

//! The trace header: the first section of a trace stream.

use std::io::{Read, Seek, Write};

use crate::error::{ReadError, WriteError};
use crate::section::{SectionReader, SectionWriter};

const SECTION_NAME: &str = "trace header";

/// The trace header. Currently carries only the compression byte; the wire
/// format reserves it for future use but this crate only ever writes and
/// accepts `0` (no compression).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub struct Header {
    /// Compression scheme identifier. Only `0` (none) is supported.
    pub compression: u8,
}

impl Header {
    /// Writes this header as its own section.
    pub fn write(&self, stream: &mut (impl Write + Seek)) -> Result<(), WriteError> {
        let mut w = SectionWriter::start(stream, SECTION_NAME)?;
        w.write_u8(self.compression)?;
        w.finalize().map(|_| ())
    }

    /// Reads and validates the trace header section.
    pub fn read(stream: &mut impl Read) -> Result<Header, ReadError> {
        let mut r = SectionReader::start(stream, SECTION_NAME)?;
        let compression = r.read_u8()?;
        r.finish()?;
        if compression != 0 {
            return Err(ReadError::UnsupportedFeature {
                section: SECTION_NAME,
                detail: format!("compression scheme {} is not supported", compression),
            });
        }
        Ok(Header { compression })
    }
}
