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

//! The small metadata blob that prefixes a trace or cache stream.
//!
//! A real deployment of this format sits behind a container/metadata library
//! that tags every resource with a type, a format version and some tool
//! provenance before any format-specific bytes appear. No such crate exists
//! in the public Rust ecosystem, so the handful of fields this crate actually
//! depends on (resource type and format version, for compatibility checks)
//! are implemented directly here instead of being pulled in from a
//! fabricated dependency.

use std::fmt::{Display, Formatter};
use std::io::{Read, Write};

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{ReadError, WriteError};

/// The format version this build of the crate writes, and the minimum it accepts on read.
pub const CURRENT_FORMAT_VERSION: Version = Version {
    major: 1,
    minor: 0,
    patch: 0,
    pre: None,
};

const SECTION_NAME: &str = "metadata";
const MAX_STRING_LEN: usize = 255;

/// The kind of resource a metadata blob describes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ResourceType {
    /// A `trace.bin`-shaped execution trace stream.
    TraceBin,

    /// A `trace.cache`-shaped random-access cache stream.
    TraceCache,
}

impl ResourceType {
    fn to_byte(self) -> u8 {
        match self {
            ResourceType::TraceBin => 0,
            ResourceType::TraceCache => 1,
        }
    }

    fn from_byte(b: u8) -> Option<ResourceType> {
        match b {
            0 => Some(ResourceType::TraceBin),
            1 => Some(ResourceType::TraceCache),
            _ => None,
        }
    }

    /// A human-readable name, used in error messages.
    pub fn name(self) -> &'static str {
        match self {
            ResourceType::TraceBin => "trace.bin",
            ResourceType::TraceCache => "trace.cache",
        }
    }
}

/// A semver-shaped version (`major.minor.patch[-pre]`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Version {
    /// Major version; required to match exactly for compatibility.
    pub major: u16,
    /// Minor version.
    pub minor: u16,
    /// Patch version.
    pub patch: u16,
    /// Optional pre-release tag (e.g. `"dummy"` in `"1.0.0-dummy"`).
    pub pre: Option<String>,
}

impl Version {
    /// Parses a version string of the form `"1.0.0"` or `"1.0.0-dummy"`.
    pub fn parse(s: &str) -> Option<Version> {
        let (core, pre) = match s.split_once('-') {
            Some((c, p)) => (c, Some(p.to_string())),
            None => (s, None),
        };
        let mut parts = core.split('.');
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next()?.parse().ok()?;
        let patch = parts.next()?.parse().ok()?;
        if parts.next().is_some() {
            return None;
        }
        Some(Version { major, minor, patch, pre })
    }

    /// Returns `Ok(())` if a stream stamped with this version can be read by
    /// code that requires `required`: same major version, and `(minor,
    /// patch)` greater than or equal to the requirement.
    pub fn compatible_with(&self, required: &Version) -> Result<(), ReadError> {
        if self.major == required.major
            && (self.minor, self.patch) >= (required.minor, required.patch)
        {
            return Ok(());
        }
        Err(ReadError::IncompatibleVersion {
            section: SECTION_NAME,
            found: self.to_string(),
            required: required.to_string(),
        })
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some(pre) = &self.pre {
            write!(f, "-{}", pre)?;
        }
        Ok(())
    }
}

/// The metadata blob written ahead of the first section of a trace or cache stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Metadata {
    /// The kind of resource this stream holds.
    pub resource_type: ResourceType,
    /// The format version this stream was written with.
    pub format_version: Version,
    /// Name of the tool that produced this stream.
    pub tool_name: String,
    /// Version of the tool that produced this stream.
    pub tool_version: String,
    /// Free-form tool information (build id, command line, ...).
    pub tool_info: String,
    /// Unix timestamp (seconds) this stream was generated at.
    pub generation_date: u64,
}

fn write_string(w: &mut impl Write, s: &str) -> Result<(), WriteError> {
    if s.len() > MAX_STRING_LEN {
        return Err(WriteError::ValueTooBig {
            section: SECTION_NAME,
            detail: format!("string of {} bytes exceeds the {} byte limit", s.len(), MAX_STRING_LEN),
        });
    }
    w.write_all(&[s.len() as u8])?;
    w.write_all(s.as_bytes())?;
    Ok(())
}

fn read_string(r: &mut impl Read) -> Result<String, ReadError> {
    let mut len = [0u8; 1];
    r.read_exact(&mut len)?;
    let mut buf = vec![0u8; len[0] as usize];
    r.read_exact(&mut buf)?;
    String::from_utf8(buf).map_err(|e| ReadError::MalformedSection {
        section: SECTION_NAME,
        detail: format!("invalid utf-8 in string field: {}", e),
    })
}

impl Metadata {
    fn write_to(&self, w: &mut impl Write) -> Result<(), WriteError> {
        w.write_all(&[self.resource_type.to_byte()])?;
        write_string(w, &self.format_version.to_string())?;
        write_string(w, &self.tool_name)?;
        write_string(w, &self.tool_version)?;
        write_string(w, &self.tool_info)?;
        let mut buf = [0u8; 8];
        LittleEndian::write_u64(&mut buf, self.generation_date);
        w.write_all(&buf)?;
        Ok(())
    }

    fn read_from(r: &mut impl Read) -> Result<Metadata, ReadError> {
        let mut ty = [0u8; 1];
        r.read_exact(&mut ty)?;
        let resource_type = ResourceType::from_byte(ty[0]).ok_or_else(|| ReadError::MalformedSection {
            section: SECTION_NAME,
            detail: format!("unknown resource type byte {:#04x}", ty[0]),
        })?;
        let format_version_str = read_string(r)?;
        let format_version = Version::parse(&format_version_str).ok_or_else(|| ReadError::MalformedSection {
            section: SECTION_NAME,
            detail: format!("malformed version string {:?}", format_version_str),
        })?;
        let tool_name = read_string(r)?;
        let tool_version = read_string(r)?;
        let tool_info = read_string(r)?;
        let mut buf = [0u8; 8];
        r.read_exact(&mut buf)?;
        let generation_date = LittleEndian::read_u64(&buf);
        Ok(Metadata {
            resource_type,
            format_version,
            tool_name,
            tool_version,
            tool_info,
            generation_date,
        })
    }
}

/// Writes `metadata` ahead of the caller's format-specific sections.
///
/// Mirrors the `open`/`create` shape of a container-level metadata library:
/// the blob is length-prefixed so a reader that doesn't understand a future
/// metadata layout can still skip over it.
pub fn create(mut stream: impl Write, metadata: &Metadata) -> Result<impl Write, WriteError> {
    let mut body = Vec::new();
    metadata.write_to(&mut body)?;
    let mut len_buf = [0u8; 4];
    LittleEndian::write_u32(&mut len_buf, body.len() as u32);
    stream.write_all(&len_buf)?;
    stream.write_all(&body)?;
    Ok(stream)
}

/// Reads the metadata blob from the head of `stream`, checking that its
/// resource type matches `expected` and its format version is compatible
/// with [`CURRENT_FORMAT_VERSION`].
///
/// Returns the parsed [`Metadata`] and the stream positioned right after the
/// blob, ready for format-specific section reads.
pub fn open(mut stream: impl Read, expected: ResourceType) -> Result<(Metadata, impl Read), ReadError> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf)?;
    let len = LittleEndian::read_u32(&len_buf) as usize;
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body)?;
    let metadata = Metadata::read_from(&mut &body[..])?;
    if metadata.resource_type != expected {
        return Err(ReadError::IncompatibleType {
            expected: expected.name(),
            actual: metadata.resource_type.name(),
        });
    }
    metadata.format_version.compatible_with(&CURRENT_FORMAT_VERSION)?;
    Ok((metadata, stream))
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn sample() -> Metadata {
        Metadata {
            resource_type: ResourceType::TraceBin,
            format_version: CURRENT_FORMAT_VERSION,
            tool_name: "bintrace-test".into(),
            tool_version: "0.1.0".into(),
            tool_info: "".into(),
            generation_date: 1_700_000_000,
        }
    }

    #[test]
    fn round_trip() {
        let mut buf = Vec::new();
        create(&mut buf, &sample()).unwrap();
        let (meta, _) = open(Cursor::new(buf), ResourceType::TraceBin).unwrap();
        assert_eq!(meta, sample());
    }

    #[test]
    fn rejects_wrong_resource_type() {
        let mut buf = Vec::new();
        create(&mut buf, &sample()).unwrap();
        let err = open(Cursor::new(buf), ResourceType::TraceCache).unwrap_err();
        assert!(matches!(err, ReadError::IncompatibleType { .. }));
    }

    #[test]
    fn rejects_incompatible_version() {
        let mut meta = sample();
        meta.format_version = Version { major: 2, minor: 0, patch: 0, pre: None };
        let mut buf = Vec::new();
        create(&mut buf, &meta).unwrap();
        let err = open(Cursor::new(buf), ResourceType::TraceBin).unwrap_err();
        assert!(matches!(err, ReadError::IncompatibleVersion { .. }));
    }

    #[test]
    fn version_parse_with_prerelease() {
        let v = Version::parse("1.0.0-dummy").unwrap();
        assert_eq!(v.major, 1);
        assert_eq!(v.pre.as_deref(), Some("dummy"));
        assert_eq!(v.to_string(), "1.0.0-dummy");
    }
}
