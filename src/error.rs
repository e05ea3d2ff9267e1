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

//! Error declarations for trace and cache stream codecs.

use std::fmt::{Display, Formatter};

use crate::impl_err_conversion;

/// Represents an error encountered while reading a trace or cache stream.
///
/// Every variant that originates from a specific section carries that
/// section's name (e.g. `"trace header"`, `"trace events"`, `"cache points"`)
/// so the message can point at the offending part of the stream.
#[derive(Debug)]
pub enum ReadError {
    /// Describes an io error.
    Io(std::io::Error),

    /// The stream's resource type does not match what the caller asked to open.
    IncompatibleType {
        /// The resource type the caller expected.
        expected: &'static str,
        /// The resource type actually found in the stream.
        actual: &'static str,
    },

    /// The stream's format version is incompatible with what this crate supports.
    IncompatibleVersion {
        /// The section in which the version was read.
        section: &'static str,
        /// The version found in the stream.
        found: String,
        /// The version required by this crate.
        required: String,
    },

    /// The stream uses a feature this crate does not implement.
    UnsupportedFeature {
        /// The section in which the unsupported feature was found.
        section: &'static str,
        /// A human-readable description of the unsupported feature.
        detail: String,
    },

    /// A section's internal structure is inconsistent with its own framing.
    MalformedSection {
        /// The section found to be malformed.
        section: &'static str,
        /// A human-readable description of the problem.
        detail: String,
    },

    /// The stream ended before a section's declared size was fully consumed.
    UnexpectedEndOfStream {
        /// The section being read when the stream ended.
        section: &'static str,
    },

    /// A value read inside a section overran that section's declared bounds.
    UnexpectedEndOfSection {
        /// The section whose bounds were overrun.
        section: &'static str,
    },

    /// Data expected to be present (e.g. a referenced register) was not found.
    MissingData {
        /// The section in which the data was expected.
        section: &'static str,
        /// A human-readable description of what was missing.
        detail: String,
    },
}

impl_err_conversion!(ReadError { std::io::Error => Io });

impl Display for ReadError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ReadError::Io(e) => write!(f, "io error: {}", e),
            ReadError::IncompatibleType { expected, actual } => {
                write!(f, "incompatible resource type (expected {}, got {})", expected, actual)
            },
            ReadError::IncompatibleVersion { section, found, required } => write!(
                f,
                "incompatible format version in {} (found {}, required {})",
                section, found, required
            ),
            ReadError::UnsupportedFeature { section, detail } => {
                write!(f, "unsupported feature in {}: {}", section, detail)
            },
            ReadError::MalformedSection { section, detail } => {
                write!(f, "malformed section {}: {}", section, detail)
            },
            ReadError::UnexpectedEndOfStream { section } => {
                write!(f, "unexpected end of stream while reading {}", section)
            },
            ReadError::UnexpectedEndOfSection { section } => {
                write!(f, "unexpected end of section {}", section)
            },
            ReadError::MissingData { section, detail } => {
                write!(f, "missing data in {}: {}", section, detail)
            },
        }
    }
}

impl std::error::Error for ReadError {}

/// Represents an error encountered while writing a trace or cache stream.
#[derive(Debug)]
pub enum WriteError {
    /// Describes an io error.
    Io(std::io::Error),

    /// A value supplied for encoding does not fit in its on-wire representation.
    ValueTooBig {
        /// The section in which the value was being written.
        section: &'static str,
        /// A human-readable description of the offending value.
        detail: String,
    },

    /// A value supplied for encoding is structurally valid but semantically impossible.
    NonsenseValue {
        /// The section in which the value was being written.
        section: &'static str,
        /// A human-readable description of the value and why it is rejected.
        detail: String,
    },

    /// The caller did not supply enough data to finalize a section (e.g. fewer
    /// initial-memory bytes than the machine description's regions declare).
    MissingData {
        /// The section in which data was missing.
        section: &'static str,
        /// A human-readable description of what was missing.
        detail: String,
    },
}

impl_err_conversion!(WriteError { std::io::Error => Io });

impl Display for WriteError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            WriteError::Io(e) => write!(f, "io error: {}", e),
            WriteError::ValueTooBig { section, detail } => {
                write!(f, "value too big in {}: {}", section, detail)
            },
            WriteError::NonsenseValue { section, detail } => {
                write!(f, "nonsense value in {}: {}", section, detail)
            },
            WriteError::MissingData { section, detail } => {
                write!(f, "missing data in {}: {}", section, detail)
            },
        }
    }
}

impl std::error::Error for WriteError {}
