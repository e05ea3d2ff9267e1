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

//! The random-access cache companion format.
//!
//! A cache stream periodically snapshots the full machine state (every
//! register, plus whichever memory pages changed since the last snapshot)
//! so a consumer can seek into the middle of a trace instead of replaying
//! it from the start. A cache point is keyed by *context id* — the number
//! of events executed so far in the paired trace — and an index at the end
//! of the stream maps context ids to byte offsets so [`CacheReader::find_closest`]
//! can answer "which cache point should I replay from to reach context id
//! N" in one lookup.

use std::collections::BTreeMap;
use std::io::{Read, Seek, SeekFrom, Write};

use byteorder::{LittleEndian, ReadBytesExt};

use crate::error::{ReadError, WriteError};
use crate::machine::{MachineDescription, RegisterContainer};
use crate::section::{SectionReader, SectionWriter};

const HEADER_SECTION_NAME: &str = "cache header";
const CACHE_POINTS_SECTION_NAME: &str = "cache points";
const INDEX_SECTION_NAME: &str = "cache index";

/// The single page size governing every cache point in a stream.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CacheHeader {
    /// Size, in bytes, of every memory page dump a cache point may contain.
    pub page_size: u32,
}

/// A single dumped memory page's location within the cache-points section.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PageOffset {
    /// The page's physical base address, aligned to [`CacheHeader::page_size`].
    pub page_address: u64,
    /// Offset, relative to the start of the cache-points section's content,
    /// of this page's raw bytes.
    pub cache_stream_offset: u64,
}

/// Where one cache point's register dump and memory pages live, relative to
/// the start of the cache-points section's content.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheOffsets {
    /// Offset into the paired trace's events section at which the event
    /// right after this cache point starts. A replay resumes here.
    pub trace_stream_offset: u64,
    /// Offset, relative to the start of the cache-points section's content,
    /// of this cache point's register dump.
    pub cpu_cache_stream_offset: u64,
    /// Dumped memory pages, in the order they were written.
    pub page_offsets: Vec<PageOffset>,
}

/// The cache index: every cache point's context id mapped to its on-disk
/// offsets, kept in ascending key order.
///
/// The on-disk index order is arbitrary; this in-memory representation uses
/// an ascending [`BTreeMap`] so [`CacheReader::find_closest`] can answer a
/// strict-predecessor query with a single `range` lookup — the same
/// information a descending-ordered map plus an `upper_bound` call would
/// give, just expressed with the ascending collection the standard library
/// provides.
pub type CacheIndex = BTreeMap<u64, CacheOffsets>;

fn write_index<S: Write + Seek>(stream: S, index: &CacheIndex) -> Result<S, WriteError> {
    let mut w = SectionWriter::start(stream, INDEX_SECTION_NAME)?;
    w.write_u64(index.len() as u64)?;
    for (&context_id, offsets) in index.iter() {
        w.write_u64(context_id)?;
        w.write_u64(offsets.trace_stream_offset)?;
        w.write_u64(offsets.cpu_cache_stream_offset)?;
        if offsets.page_offsets.len() > u32::MAX as usize {
            return Err(WriteError::ValueTooBig {
                section: INDEX_SECTION_NAME,
                detail: format!("cache point {} has more than u32::MAX pages", context_id),
            });
        }
        w.write_u32(offsets.page_offsets.len() as u32)?;
        for page in &offsets.page_offsets {
            w.write_u64(page.page_address)?;
            w.write_u64(page.cache_stream_offset)?;
        }
    }
    w.finalize()
}

fn read_index<R: Read>(stream: R) -> Result<(CacheIndex, R), ReadError> {
    let mut r = SectionReader::start(stream, INDEX_SECTION_NAME)?;
    let count = r.read_u64()?;
    let mut index = CacheIndex::new();
    for _ in 0..count {
        let context_id = r.read_u64()?;
        let trace_stream_offset = r.read_u64()?;
        let cpu_cache_stream_offset = r.read_u64()?;
        let page_count = r.read_u32()?;
        let mut page_offsets = Vec::with_capacity(page_count as usize);
        for _ in 0..page_count {
            let page_address = r.read_u64()?;
            let cache_stream_offset = r.read_u64()?;
            page_offsets.push(PageOffset { page_address, cache_stream_offset });
        }
        index.insert(context_id, CacheOffsets { trace_stream_offset, cpu_cache_stream_offset, page_offsets });
    }
    let stream = r.finish()?;
    Ok((index, stream))
}

/// Entry point for writing a cache stream: writes the cache header and
/// returns a writer ready to start the cache-points section.
pub struct CacheWriter<W> {
    stream: W,
    page_size: u32,
}

impl<W: Write + Seek> CacheWriter<W> {
    /// Writes the cache header (just the page size) and returns a writer
    /// ready for [`CacheWriter::start_cache_points_section`].
    pub fn create(mut stream: W, page_size: u32) -> Result<CacheWriter<W>, WriteError> {
        let mut w = SectionWriter::start(&mut stream, HEADER_SECTION_NAME)?;
        w.write_u32(page_size)?;
        w.finalize()?;
        Ok(CacheWriter { stream, page_size })
    }

    /// The page size every cache point in this stream dumps memory in.
    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    /// Starts the cache-points section, consuming this writer. The cache
    /// index is written once the returned writer is finished.
    pub fn start_cache_points_section(
        self,
        machine: MachineDescription,
    ) -> Result<CachePointsSectionWriter<W>, WriteError> {
        let section = SectionWriter::start(self.stream, CACHE_POINTS_SECTION_NAME)?;
        Ok(CachePointsSectionWriter {
            machine,
            page_size: self.page_size,
            section,
            index: CacheIndex::new(),
            state: CachePointState::Closed,
            current_context_id: 0,
            current_reg_count_pos: 0,
            current_reg_count: 0,
        })
    }
}

/// Whether a cache point declaration is in progress, and if so, whether it
/// has started writing memory pages yet (which closes off further register
/// writes for that point).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum CachePointState {
    Closed,
    Registers,
    Memory,
}

/// Writes the cache-points section: a sequence of full or partial CPU
/// snapshots, each declared with [`start_cache_point`](Self::start_cache_point)
/// and closed with [`finish_cache_point`](Self::finish_cache_point).
///
/// Within one cache point, every [`write_register`](Self::write_register)
/// call must precede every [`write_memory_page`](Self::write_memory_page)
/// call; the writer tracks this as a phase and the reverse order is a
/// programming error, matching the "call order" class of failure in the
/// write-side error taxonomy.
pub struct CachePointsSectionWriter<W> {
    machine: MachineDescription,
    page_size: u32,
    section: SectionWriter<W>,
    index: CacheIndex,
    state: CachePointState,
    current_context_id: u64,
    current_reg_count_pos: u64,
    current_reg_count: u16,
}

impl<W: Write + Seek> CachePointsSectionWriter<W> {
    /// Declares a new cache point at `context_id`, resumable by replaying
    /// the paired trace's events section from `trace_stream_pos`.
    ///
    /// # Panics
    ///
    /// Panics if a previous cache point is still open.
    pub fn start_cache_point(&mut self, context_id: u64, trace_stream_pos: u64) -> Result<(), WriteError> {
        assert_eq!(self.state, CachePointState::Closed, "start_cache_point called while a cache point is open");
        if self.index.contains_key(&context_id) {
            return Err(WriteError::NonsenseValue {
                section: CACHE_POINTS_SECTION_NAME,
                detail: format!("context id {} already has a cache point", context_id),
            });
        }
        let cpu_cache_stream_offset = self.section.position();
        self.section.write_u16(0)?;
        self.index.insert(
            context_id,
            CacheOffsets { trace_stream_offset: trace_stream_pos, cpu_cache_stream_offset, page_offsets: Vec::new() },
        );
        self.current_context_id = context_id;
        self.current_reg_count_pos = cpu_cache_stream_offset;
        self.current_reg_count = 0;
        self.state = CachePointState::Registers;
        Ok(())
    }

    /// Writes one register's value into the currently open cache point's dump.
    ///
    /// # Panics
    ///
    /// Panics if no cache point is open, or if a memory page has already
    /// been written for this cache point.
    pub fn write_register(&mut self, id: u16, value: &[u8]) -> Result<(), WriteError> {
        assert_ne!(self.state, CachePointState::Closed, "write_register called before start_cache_point");
        assert_eq!(self.state, CachePointState::Registers, "write_register called after write_memory_page");
        let size = self.machine.register_size(id).ok_or_else(|| WriteError::NonsenseValue {
            section: CACHE_POINTS_SECTION_NAME,
            detail: format!("register id {} is unknown", id),
        })?;
        if value.len() != size as usize {
            return Err(WriteError::NonsenseValue {
                section: CACHE_POINTS_SECTION_NAME,
                detail: format!("register {}'s size is {}, not {}", id, size, value.len()),
            });
        }
        self.section.write_u16(id)?;
        self.section.write_sized_buffer_u16(value)?;
        self.current_reg_count += 1;
        Ok(())
    }

    /// Writes one full page of memory, aligned to the cache's page size and
    /// fully contained in a declared memory region, into the currently open
    /// cache point's dump.
    ///
    /// # Panics
    ///
    /// Panics if no cache point is open.
    pub fn write_memory_page(&mut self, address: u64, data: &[u8]) -> Result<(), WriteError> {
        assert_ne!(self.state, CachePointState::Closed, "write_memory_page called before start_cache_point");
        let page_size = self.page_size as u64;
        if address % page_size != 0 {
            return Err(WriteError::NonsenseValue {
                section: CACHE_POINTS_SECTION_NAME,
                detail: format!("address {:#x} is not aligned to the page size", address),
            });
        }
        if data.len() as u64 != page_size {
            return Err(WriteError::NonsenseValue {
                section: CACHE_POINTS_SECTION_NAME,
                detail: format!("page buffer of {} bytes does not match page size {}", data.len(), page_size),
            });
        }
        let contained = self
            .machine
            .memory_regions
            .iter()
            .any(|r| address >= r.base && address + page_size <= r.base + r.size);
        if !contained {
            return Err(WriteError::NonsenseValue {
                section: CACHE_POINTS_SECTION_NAME,
                detail: format!("address {:#x} is outside of any declared memory region", address),
            });
        }
        self.state = CachePointState::Memory;
        let cache_stream_offset = self.section.position();
        self.index
            .get_mut(&self.current_context_id)
            .expect("current cache point missing from index")
            .page_offsets
            .push(PageOffset { page_address: address, cache_stream_offset });
        self.section.write(data)
    }

    /// Back-patches the register count and closes the currently open cache point.
    ///
    /// # Panics
    ///
    /// Panics if no cache point is open.
    pub fn finish_cache_point(&mut self) -> Result<(), WriteError> {
        assert_ne!(self.state, CachePointState::Closed, "finish_cache_point called before start_cache_point");
        self.section.write_back_at(self.current_reg_count_pos, &self.current_reg_count.to_le_bytes())?;
        self.state = CachePointState::Closed;
        #[cfg(feature = "debug-log")]
        println!(
            "[bintrace] finished cache point {} ({} registers)",
            self.current_context_id, self.current_reg_count
        );
        Ok(())
    }

    /// Finalizes the cache-points section and writes the cache index.
    /// Returns the underlying stream.
    ///
    /// Any cache point still open is finished automatically, mirroring the
    /// original writer's finalize behavior.
    pub fn finish(mut self) -> Result<W, WriteError> {
        if self.state != CachePointState::Closed {
            self.finish_cache_point()?;
        }
        let stream = self.section.finalize()?;
        write_index(stream, &self.index)
    }
}

/// Reads a cache stream: the header and index are parsed eagerly on open,
/// after which [`find_closest`](Self::find_closest) answers lookups purely
/// in memory and [`read_cache_point`](Self::read_cache_point) seeks the
/// stream on demand to read one point's register dump.
pub struct CacheReader<R> {
    stream: Option<R>,
    header: CacheHeader,
    index: CacheIndex,
    machine: MachineDescription,
    cache_points_content_start: u64,
}

impl<R: Read + Seek> CacheReader<R> {
    /// Reads the cache header and index and returns a reader ready to
    /// answer [`find_closest`](Self::find_closest) and
    /// [`read_cache_point`](Self::read_cache_point) queries.
    ///
    /// The cache-points section itself is *not* decoded here: only its
    /// extent is skipped over to reach the index. Individual cache points
    /// are read on demand by seeking back into that section.
    pub fn open(mut stream: R, machine: MachineDescription) -> Result<CacheReader<R>, ReadError> {
        let mut r = SectionReader::start(&mut stream, HEADER_SECTION_NAME)?;
        let page_size = r.read_u32()?;
        r.finish()?;

        let restore_pos = stream.stream_position()?;
        let skip = SectionReader::start(stream, CACHE_POINTS_SECTION_NAME)?;
        let stream = skip.seek_to_end()?;
        let (index, stream) = read_index(stream)?;

        Ok(CacheReader {
            stream: Some(stream),
            header: CacheHeader { page_size },
            index,
            machine,
            cache_points_content_start: restore_pos + 8,
        })
    }

    /// The cache header (currently just the page size).
    pub fn header(&self) -> CacheHeader {
        self.header
    }

    /// The machine description this cache was opened against.
    pub fn machine_description(&self) -> &MachineDescription {
        &self.machine
    }

    /// The full index, in ascending context-id order.
    pub fn index(&self) -> &CacheIndex {
        &self.index
    }

    /// The absolute stream offset at which the cache-points section's
    /// content starts, for converting a [`CacheOffsets`]/[`PageOffset`]'s
    /// relative offsets into absolute ones.
    pub fn cache_points_section_start(&self) -> u64 {
        self.cache_points_content_start
    }

    /// Returns the context id of the cache point with the greatest key
    /// strictly less than `context_id`, or `None` if every cache point is
    /// at or after `context_id`.
    ///
    /// An exact match on `context_id` is deliberately not returned: a
    /// replay must execute at least one event after the snapshot to be
    /// observable, so the closest usable cache point is always the one
    /// strictly before.
    pub fn find_closest(&self, context_id: u64) -> Option<u64> {
        self.index.range(..context_id).next_back().map(|(&key, _)| key)
    }

    /// Reads back the full register dump for the cache point at `context_id`.
    ///
    /// Validates that the dump's register count matches the machine
    /// description exactly, with no duplicate or unknown ids and no
    /// register whose dumped size disagrees with its declared size.
    pub fn read_cache_point(&mut self, context_id: u64) -> Result<RegisterContainer, ReadError> {
        let offsets = self.index.get(&context_id).ok_or_else(|| ReadError::MissingData {
            section: CACHE_POINTS_SECTION_NAME,
            detail: format!("no cache point for context id {}", context_id),
        })?;
        let mut stream = self.stream.take().expect("cache reader stream missing");
        let result = (|| -> Result<RegisterContainer, ReadError> {
            stream.seek(SeekFrom::Start(self.cache_points_content_start + offsets.cpu_cache_stream_offset))?;
            let reg_count = stream.read_u16::<LittleEndian>()?;
            if reg_count as usize != self.machine.registers.len() {
                return Err(ReadError::MalformedSection {
                    section: CACHE_POINTS_SECTION_NAME,
                    detail: format!(
                        "cache point declares {} registers, machine has {}",
                        reg_count,
                        self.machine.registers.len()
                    ),
                });
            }
            let mut result = RegisterContainer::new();
            for _ in 0..reg_count {
                let id = stream.read_u16::<LittleEndian>()?;
                let size = stream.read_u16::<LittleEndian>()?;
                if result.iter().any(|(existing, _)| *existing == id) {
                    return Err(ReadError::MalformedSection {
                        section: CACHE_POINTS_SECTION_NAME,
                        detail: format!("register {} present twice in cache point", id),
                    });
                }
                let declared_size = self.machine.register_size(id).ok_or_else(|| ReadError::MalformedSection {
                    section: CACHE_POINTS_SECTION_NAME,
                    detail: format!("register id {} is unknown", id),
                })?;
                if declared_size != size {
                    return Err(ReadError::MalformedSection {
                        section: CACHE_POINTS_SECTION_NAME,
                        detail: format!("register {}'s dumped size {} disagrees with declared {}", id, size, declared_size),
                    });
                }
                let mut value = vec![0u8; size as usize];
                stream.read_exact(&mut value)?;
                result.push((id, value));
            }
            Ok(result)
        })();
        self.stream = Some(stream);
        result
    }
}
