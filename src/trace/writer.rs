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

//! The trace writer's phase chain.
//!
//! Each phase is a distinct type that consumes its predecessor by value, so
//! the compiler rejects skipping a phase or writing to one out of order.
//! This is the natural Rust rendition of the original's move-constructor
//! chaining between writer phases. `SectionWriter<W>` owns its backing
//! stream by value, so each phase can store one directly without becoming
//! self-referential; the stream changes hands at every `finish`.

use std::io::{Seek, Write};

use crate::error::WriteError;
use crate::machine::MachineDescription;
use crate::section::SectionWriter;
use crate::trace::header::Header;

const MEMORY_SECTION_NAME: &str = "trace initial memory";
const REGISTERS_SECTION_NAME: &str = "trace initial registers";
const EVENTS_SECTION_NAME: &str = "trace events";

/// Entry point for writing a trace stream: writes the header and machine
/// description, then hands off to [`InitialMemorySectionWriter`].
pub struct TraceWriter<W> {
    stream: W,
    machine: MachineDescription,
}

impl<W: Write + Seek> TraceWriter<W> {
    /// Writes the trace header and machine description, and returns a writer
    /// ready to start the initial-memory section.
    pub fn create(mut stream: W, machine: MachineDescription) -> Result<TraceWriter<W>, WriteError> {
        Header::default().write(&mut stream)?;
        machine.write(&mut stream)?;
        Ok(TraceWriter { stream, machine })
    }

    /// The machine description this trace was opened with.
    pub fn machine_description(&self) -> &MachineDescription {
        &self.machine
    }

    /// Starts the initial-memory section, consuming this writer.
    pub fn start_initial_memory_section(self) -> Result<InitialMemorySectionWriter<W>, WriteError> {
        let section = SectionWriter::start(self.stream, MEMORY_SECTION_NAME)?;
        Ok(InitialMemorySectionWriter { machine: self.machine, section, next_region: 0 })
    }
}

/// Writes the memory regions present at trace start.
///
/// The section carries no per-region framing: its declared size is exactly
/// the sum of the machine description's region sizes, and its content is
/// the concatenation of each region's bytes in declared order. This writer
/// tracks that order and validates every call against it so a caller cannot
/// silently desync the written content from the machine description.
pub struct InitialMemorySectionWriter<W> {
    machine: MachineDescription,
    section: SectionWriter<W>,
    next_region: usize,
}

impl<W: Write + Seek> InitialMemorySectionWriter<W> {
    /// Writes the next memory region's content, in the order declared by the
    /// machine description. `base` must equal that region's declared base
    /// address and `data` must be exactly its declared size.
    pub fn write_region(&mut self, base: u64, data: &[u8]) -> Result<(), WriteError> {
        let region = self.machine.memory_regions.get(self.next_region).ok_or_else(|| WriteError::NonsenseValue {
            section: MEMORY_SECTION_NAME,
            detail: format!(
                "write_region called {} times, machine description declares only {} regions",
                self.next_region + 1,
                self.machine.memory_regions.len()
            ),
        })?;
        if base != region.base {
            return Err(WriteError::NonsenseValue {
                section: MEMORY_SECTION_NAME,
                detail: format!(
                    "region {} base {:#x} does not match the machine description's declared base {:#x}",
                    self.next_region, base, region.base
                ),
            });
        }
        if data.len() as u64 != region.size {
            return Err(WriteError::NonsenseValue {
                section: MEMORY_SECTION_NAME,
                detail: format!(
                    "region {} is {} bytes, machine description declares {} bytes",
                    self.next_region,
                    data.len(),
                    region.size
                ),
            });
        }
        self.section.write(data)?;
        self.next_region += 1;
        Ok(())
    }

    /// Finalizes the initial-memory section and starts the initial-registers section.
    ///
    /// Fails with [`WriteError::MissingData`] if fewer regions were written
    /// than the machine description declares.
    pub fn finish(self) -> Result<InitialRegistersSectionWriter<W>, WriteError> {
        if self.next_region != self.machine.memory_regions.len() {
            return Err(WriteError::MissingData {
                section: MEMORY_SECTION_NAME,
                detail: format!(
                    "only {} of {} declared memory regions were written",
                    self.next_region,
                    self.machine.memory_regions.len()
                ),
            });
        }
        let stream = self.section.finalize()?;
        let mut next = SectionWriter::start(stream, REGISTERS_SECTION_NAME)?;
        // count : u32, back-patched once every register has been written.
        next.write_u32(0)?;
        Ok(InitialRegistersSectionWriter {
            machine: self.machine,
            section: next,
            seen: std::collections::HashSet::new(),
        })
    }
}

/// Writes the register values present at trace start.
///
/// Layout: `count : u32` (back-patched at [`finish`](Self::finish)) followed
/// by that many `(id : u16, bytes : registers[id].size)` entries.
pub struct InitialRegistersSectionWriter<W> {
    machine: MachineDescription,
    section: SectionWriter<W>,
    seen: std::collections::HashSet<u16>,
}

impl<W: Write + Seek> InitialRegistersSectionWriter<W> {
    /// Writes one register's initial value.
    ///
    /// `value` must be exactly `registers[id].size` bytes and `id` must not
    /// have already been written in this section.
    pub fn write_register(&mut self, id: u16, value: &[u8]) -> Result<(), WriteError> {
        let size = self.machine.register_size(id).ok_or_else(|| WriteError::NonsenseValue {
            section: REGISTERS_SECTION_NAME,
            detail: format!("register id {} has no entry in the machine description", id),
        })?;
        if value.len() != size as usize {
            return Err(WriteError::NonsenseValue {
                section: REGISTERS_SECTION_NAME,
                detail: format!("register {} is {} bytes wide, got {} bytes", id, size, value.len()),
            });
        }
        if !self.seen.insert(id) {
            return Err(WriteError::NonsenseValue {
                section: REGISTERS_SECTION_NAME,
                detail: format!("register {} written more than once", id),
            });
        }
        self.section.write_u16(id)?;
        self.section.write(value)
    }

    /// Finalizes the initial-registers section and starts the events section.
    ///
    /// Fails with [`WriteError::MissingData`] unless every register in the
    /// machine description has been written exactly once.
    pub fn finish(self) -> Result<EventsSectionWriter<W>, WriteError> {
        if self.seen.len() != self.machine.registers.len() {
            return Err(WriteError::MissingData {
                section: REGISTERS_SECTION_NAME,
                detail: format!(
                    "only {} of {} declared registers were written",
                    self.seen.len(),
                    self.machine.registers.len()
                ),
            });
        }
        let count = self.seen.len() as u32;
        let mut section = self.section;
        section.write_back_at(0, &count.to_le_bytes())?;
        let stream = section.finalize()?;
        let mut next = SectionWriter::start(stream, EVENTS_SECTION_NAME)?;
        // total event count : u64, back-patched at EventsSectionWriter::finish.
        next.write_u64(0)?;
        Ok(EventsSectionWriter {
            machine: self.machine,
            section: next,
            state: EventState::Closed,
            event_count: 0,
            pending_memory: Vec::new(),
            pending_registers: Vec::new(),
        })
    }
}

/// Whether an event diff window is currently open for writing.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum EventState {
    Closed,
    Open,
}

/// A pending register diff entry, either a plain write or an operation reference.
#[derive(Clone, Debug, PartialEq, Eq)]
enum PendingRegister {
    Plain { id: u16, value: Vec<u8> },
    Operation { key: u8 },
}

/// Writes the instruction/event stream: one entry per executed instruction
/// or out-of-band "other" event, each followed by zero or more memory and
/// register diff entries.
///
/// Diff entries for an event are buffered in memory and written grouped
/// (every memory entry, then every register entry) once the event is
/// finished, regardless of the order `write_memory`/`write_register` were
/// called in. An instruction's effects are logged as a set, not a sequence,
/// so this does not lose information and lets the diff-size byte(s) be
/// computed exactly instead of back-patched.
pub struct EventsSectionWriter<W> {
    machine: MachineDescription,
    section: SectionWriter<W>,
    state: EventState,
    event_count: u64,
    pending_memory: Vec<(u64, Vec<u8>)>,
    pending_registers: Vec<PendingRegister>,
}

impl<W: Write + Seek> EventsSectionWriter<W> {
    /// The machine description this events section was opened with.
    pub fn machine_description(&self) -> &MachineDescription {
        &self.machine
    }

    /// Starts a new instruction event.
    ///
    /// # Panics
    ///
    /// Panics if a previous event is still open (finish_event wasn't called).
    pub fn start_event_instruction(&mut self) -> Result<(), WriteError> {
        assert_eq!(self.state, EventState::Closed, "start_event called while an event is already open");
        self.pending_memory.clear();
        self.pending_registers.clear();
        self.state = EventState::Open;
        Ok(())
    }

    /// Starts an out-of-band "other" event: an annotation carrying a
    /// description instead of being tied to an instruction. Like
    /// [`start_event_instruction`](Self::start_event_instruction), it is
    /// followed by zero or more `write_memory`/`write_register` calls and a
    /// closing [`finish_event`](Self::finish_event).
    ///
    /// # Panics
    ///
    /// Panics if a previous event is still open.
    pub fn write_event_other(&mut self, event_type: u8, description: &str) -> Result<(), WriteError> {
        assert_eq!(self.state, EventState::Closed, "write_event_other called while an event is already open");
        self.section.write_u8(0xff)?;
        self.section.write_u8(event_type)?;
        self.section.write_string(description)?;
        self.pending_memory.clear();
        self.pending_registers.clear();
        self.state = EventState::Open;
        Ok(())
    }

    /// Records a memory write in the currently open event's diff.
    ///
    /// # Panics
    ///
    /// Panics if no event is currently open, or if a register write was
    /// already recorded for this event: memory writes must precede register
    /// writes within a diff, never the reverse.
    pub fn write_memory(&mut self, address: u64, data: &[u8]) {
        assert_eq!(self.state, EventState::Open, "write_memory called with no event open");
        assert!(self.pending_registers.is_empty(), "write_memory called after write_register in the same event");
        self.pending_memory.push((address, data.to_vec()));
    }

    /// Records a plain register write (not a register-operation) in the
    /// currently open event's diff.
    ///
    /// # Panics
    ///
    /// Panics if no event is currently open.
    pub fn write_register(&mut self, id: u16, value: &[u8]) {
        assert_eq!(self.state, EventState::Open, "write_register called with no event open");
        self.pending_registers.push(PendingRegister::Plain { id, value: value.to_vec() });
    }

    /// Records a register-operation reference (by key) in the currently open
    /// event's diff. No value bytes are written; the reader applies the
    /// operation's fixed operand from the machine description.
    ///
    /// # Panics
    ///
    /// Panics if no event is currently open, or if `key` is `0xff`.
    pub fn write_register_operation(&mut self, key: u8) {
        assert_eq!(self.state, EventState::Open, "write_register_operation called with no event open");
        assert_ne!(key, 0xff, "register operation key 0xff is reserved");
        self.pending_registers.push(PendingRegister::Operation { key });
    }

    fn write_memory_entry(&mut self, address: u64, data: &[u8]) -> Result<(), WriteError> {
        let width = self.machine.physical_address_size as usize;
        self.section.write_uint(address, width)?;
        if data.len() < 0xff {
            self.section.write_u8(data.len() as u8)?;
        } else {
            self.section.write_u8(0xff)?;
            self.section.write_uint(data.len() as u64, width)?;
        }
        self.section.write(data)
    }

    fn write_register_entry(&mut self, entry: &PendingRegister) -> Result<(), WriteError> {
        match entry {
            PendingRegister::Plain { id, value } => {
                if *id < 0xff {
                    self.section.write_u8(*id as u8)?;
                } else {
                    self.section.write_u8(0xff)?;
                    self.section.write_u16(*id)?;
                }
                self.section.write(value)
            },
            PendingRegister::Operation { key } => self.section.write_u8(*key),
        }
    }

    /// Writes the buffered diff, chunked into as many diff-size-byte windows
    /// as needed (a window holds at most 14 entries of either kind; hitting
    /// that cap sets the corresponding nibble to the continuation sentinel
    /// `0xf` and opens a fresh window).
    ///
    /// Memory entries are drained to completion in their own continuation
    /// windows (register nibble pinned to 0) before any register entry is
    /// written, so the mem nibble is never `0xf` in the same byte where the
    /// reg nibble overflows: a byte of `0xff` (both nibbles `0xf`) would be
    /// misread on decode as the `other`-event marker. Only the final,
    /// necessarily-partial memory window (0 to 14 entries) may share a byte
    /// with the first register window.
    ///
    /// # Panics
    ///
    /// Panics if no event is currently open.
    pub fn finish_event(&mut self) -> Result<(), WriteError> {
        assert_eq!(self.state, EventState::Open, "finish_event called with no event open");
        let mut mi = 0;
        while self.pending_memory.len() - mi >= 15 {
            self.section.write_u8(0x0f)?;
            for i in mi..mi + 14 {
                let (address, data) = self.pending_memory[i].clone();
                self.write_memory_entry(address, &data)?;
            }
            mi += 14;
        }
        let mut mem_nibble = (self.pending_memory.len() - mi) as u8;
        let mut ri = 0;
        loop {
            let reg_remaining = self.pending_registers.len() - ri;
            let (reg_nibble, reg_take) =
                if reg_remaining >= 15 { (0xfu8, 14) } else { (reg_remaining as u8, reg_remaining) };
            self.section.write_u8(mem_nibble | (reg_nibble << 4))?;
            for i in mi..mi + mem_nibble as usize {
                let (address, data) = self.pending_memory[i].clone();
                self.write_memory_entry(address, &data)?;
            }
            mi += mem_nibble as usize;
            mem_nibble = 0;
            for i in ri..ri + reg_take {
                let entry = self.pending_registers[i].clone();
                self.write_register_entry(&entry)?;
            }
            ri += reg_take;
            if reg_nibble != 0xf {
                break;
            }
        }
        self.pending_memory.clear();
        self.pending_registers.clear();
        self.state = EventState::Closed;
        self.event_count += 1;
        #[cfg(feature = "debug-log")]
        println!("[bintrace] finished event ({} mem, {} reg)", mi, ri);
        Ok(())
    }

    /// Finalizes the events section, ending the trace stream. Returns the
    /// underlying stream.
    ///
    /// # Panics
    ///
    /// Panics if an event is still open.
    pub fn finish(self) -> Result<W, WriteError> {
        assert_eq!(self.state, EventState::Closed, "finish called with an event still open");
        let mut section = self.section;
        section.write_back_at(0, &self.event_count.to_le_bytes())?;
        section.finalize()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::machine::MachineDescriptionBuilder;

    fn machine() -> MachineDescription {
        MachineDescriptionBuilder::new()
            .physical_address_size(8)
            .register(0, 8, "rax")
            .register(1, 8, "rbx")
            .register_operation(0xfe, 1, crate::machine::RegisterOperator::Add, 1u64.to_le_bytes())
            .build()
            .unwrap()
    }

    fn machine_with_memory_region() -> MachineDescription {
        MachineDescriptionBuilder::new()
            .physical_address_size(8)
            .memory_region(0, 4)
            .register(0, 8, "rax")
            .register(1, 8, "rbx")
            .register_operation(0xfe, 1, crate::machine::RegisterOperator::Add, 1u64.to_le_bytes())
            .build()
            .unwrap()
    }

    #[test]
    fn phase_chain_round_trips() {
        let stream = Cursor::new(Vec::new());
        let w = TraceWriter::create(stream, machine_with_memory_region()).unwrap();
        let mut w = w.start_initial_memory_section().unwrap();
        w.write_region(0, &[1, 2, 3, 4]).unwrap();
        let mut w = w.finish().unwrap();
        w.write_register(0, &0u64.to_le_bytes()).unwrap();
        w.write_register(1, &0u64.to_le_bytes()).unwrap();
        let mut w = w.finish().unwrap();
        w.start_event_instruction().unwrap();
        w.write_memory(0, &[5]);
        w.write_register(0, &1u64.to_le_bytes());
        w.finish_event().unwrap();
        let _stream = w.finish().unwrap();
    }

    #[test]
    #[should_panic]
    fn write_before_start_event_panics() {
        let stream = Cursor::new(Vec::new());
        let w = TraceWriter::create(stream, machine()).unwrap();
        let mut w = w.start_initial_memory_section().unwrap().finish().unwrap();
        w.write_register(0, &0u64.to_le_bytes()).unwrap();
        w.write_register(1, &0u64.to_le_bytes()).unwrap();
        let mut w = w.finish().unwrap();
        w.write_memory(0, &[1]);
    }

    #[test]
    fn diff_continuation_after_fourteen_entries() {
        let stream = Cursor::new(Vec::new());
        let w = TraceWriter::create(stream, machine()).unwrap();
        let mut w = w.start_initial_memory_section().unwrap().finish().unwrap();
        w.write_register(0, &0u64.to_le_bytes()).unwrap();
        w.write_register(1, &0u64.to_le_bytes()).unwrap();
        let mut w = w.finish().unwrap();
        w.start_event_instruction().unwrap();
        for i in 0..20u64 {
            w.write_memory(i, &[0]);
        }
        w.finish_event().unwrap();
        let _stream = w.finish().unwrap();
    }

    #[test]
    fn register_operation_reference_written() {
        let stream = Cursor::new(Vec::new());
        let w = TraceWriter::create(stream, machine()).unwrap();
        let mut w = w.start_initial_memory_section().unwrap().finish().unwrap();
        w.write_register(0, &0u64.to_le_bytes()).unwrap();
        w.write_register(1, &0u64.to_le_bytes()).unwrap();
        let mut w = w.finish().unwrap();
        w.start_event_instruction().unwrap();
        w.write_register_operation(0xfe);
        w.finish_event().unwrap();
        let _stream = w.finish().unwrap();
    }

    #[test]
    #[should_panic]
    fn reserved_operation_key_panics() {
        let stream = Cursor::new(Vec::new());
        let w = TraceWriter::create(stream, machine()).unwrap();
        let mut w = w.start_initial_memory_section().unwrap().finish().unwrap();
        w.write_register(0, &0u64.to_le_bytes()).unwrap();
        w.write_register(1, &0u64.to_le_bytes()).unwrap();
        let mut w = w.finish().unwrap();
        w.start_event_instruction().unwrap();
        w.write_register_operation(0xff);
    }
}
