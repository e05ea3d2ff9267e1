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

//! The trace reader: opens a trace stream phase by phase, mirroring
//! [`crate::trace::writer`] but checking order with `assert!` rather than the
//! writer's move-only typestate, since a reader naturally re-reads the same
//! stream linearly and gains nothing from a new type per phase.

use std::io::Read;

use crate::error::ReadError;
use crate::machine::{MachineDescription, RegisterOperator};
use crate::section::SectionReader;
use crate::trace::header::Header;
use crate::util::{add_le_bytes, bitwise_le_bytes, BitwiseOp};

const MEMORY_SECTION_NAME: &str = "trace initial memory";
const REGISTERS_SECTION_NAME: &str = "trace initial registers";
const EVENTS_SECTION_NAME: &str = "trace events";

/// Callbacks a [`TraceReader`] dispatches to while decoding the event stream.
///
/// Every method has a no-op default except [`get_register`](TraceEvents::get_register),
/// which the reader needs to resolve register-operation references against
/// the consumer's current view of register state.
pub trait TraceEvents {
    /// Called once at the start of each instruction event, before its diff entries.
    fn instruction(&mut self) {}

    /// Called for an out-of-band "other" event; carries no diff entries.
    fn other_event(&mut self, _event_type: u8, _description: &str) {}

    /// Called for each memory write in the currently decoding event's diff.
    fn memory_write(&mut self, _address: u64, _data: &[u8]) {}

    /// Called for each register write (plain or resolved from an operation)
    /// in the currently decoding event's diff.
    fn set_register(&mut self, _id: u16, _value: &[u8]) {}

    /// Called once after all of an event's diff entries have been dispatched.
    fn end_event(&mut self) {}

    /// Returns the consumer's current value for register `id`, little-endian,
    /// sized to that register's declared width. Used to compute the result of
    /// a register-operation reference before reporting it through `set_register`.
    fn get_register(&self, id: u16) -> Vec<u8>;
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Phase {
    Initial,
    AfterMemory,
    AfterRegisters,
    Done,
}

/// Reads a trace stream phase by phase: header and machine description are
/// read eagerly on open, then initial memory, initial registers and the
/// event stream are read on demand.
pub struct TraceReader<R> {
    stream: Option<R>,
    machine: MachineDescription,
    phase: Phase,
}

impl<R: Read> TraceReader<R> {
    /// Reads the header and machine description and returns a reader
    /// positioned at the start of the initial-memory section.
    pub fn open(mut stream: R) -> Result<TraceReader<R>, ReadError> {
        Header::read(&mut stream)?;
        let machine = MachineDescription::read(&mut stream)?;
        Ok(TraceReader { stream: Some(stream), machine, phase: Phase::Initial })
    }

    /// The machine description this trace was captured against.
    pub fn machine_description(&self) -> &MachineDescription {
        &self.machine
    }

    fn take_stream(&mut self) -> R {
        self.stream.take().expect("trace reader stream missing outside of a phase transition")
    }

    /// Reads every initial memory region, calling `f(base, data)` for each.
    ///
    /// The section carries no per-region framing: each region's byte count is
    /// taken from the machine description, in declaration order, and the
    /// content is the straight concatenation of each region's initial bytes.
    ///
    /// # Panics
    ///
    /// Panics if called out of order (after the initial-memory section has
    /// already been consumed).
    pub fn read_initial_memory(&mut self, mut f: impl FnMut(u64, Vec<u8>)) -> Result<(), ReadError> {
        assert_eq!(self.phase, Phase::Initial, "read_initial_memory called out of order");
        let stream = self.take_stream();
        let mut r = SectionReader::start(stream, MEMORY_SECTION_NAME)?;
        for region in &self.machine.memory_regions {
            let data = r.read_vec(region.size as usize)?;
            f(region.base, data);
        }
        self.stream = Some(r.finish()?);
        self.phase = Phase::AfterMemory;
        Ok(())
    }

    /// Reads every initial register value, calling `f(id, value)` for each.
    ///
    /// After the declared count of entries is consumed, the set of ids seen
    /// must equal exactly the machine description's register set; a short or
    /// duplicate dump is fatal.
    ///
    /// # Panics
    ///
    /// Panics if called out of order.
    pub fn read_initial_registers(&mut self, mut f: impl FnMut(u16, Vec<u8>)) -> Result<(), ReadError> {
        assert_eq!(self.phase, Phase::AfterMemory, "read_initial_registers called out of order");
        let stream = self.take_stream();
        let mut r = SectionReader::start(stream, REGISTERS_SECTION_NAME)?;
        let count = r.read_u32()?;
        let mut seen = std::collections::HashSet::with_capacity(count as usize);
        for _ in 0..count {
            let id = r.read_u16()?;
            let size = self.machine.register_size(id).ok_or_else(|| ReadError::MalformedSection {
                section: REGISTERS_SECTION_NAME,
                detail: format!("register id {} has no entry in the machine description", id),
            })?;
            if !seen.insert(id) {
                return Err(ReadError::MalformedSection {
                    section: REGISTERS_SECTION_NAME,
                    detail: format!("register {} appears more than once in the initial dump", id),
                });
            }
            let value = r.read_vec(size as usize)?;
            f(id, value);
        }
        if seen.len() != self.machine.registers.len() {
            return Err(ReadError::MalformedSection {
                section: REGISTERS_SECTION_NAME,
                detail: format!(
                    "initial register dump covers {} of {} declared registers",
                    seen.len(),
                    self.machine.registers.len()
                ),
            });
        }
        self.stream = Some(r.finish()?);
        self.phase = Phase::AfterRegisters;
        Ok(())
    }

    /// Decodes the entire event stream in one pass, dispatching to `events`.
    ///
    /// A register-operation reference is resolved here: the operand is
    /// fetched from the machine description, combined with the consumer's
    /// current register value (via [`TraceEvents::get_register`]) according
    /// to the operation's arithmetic, and reported through
    /// [`TraceEvents::set_register`] as if it had been a plain write.
    ///
    /// The section's leading `u64` total event count drives how many events
    /// are decoded; both instruction and "other" events count toward it.
    ///
    /// # Panics
    ///
    /// Panics if called out of order.
    pub fn read_events(&mut self, events: &mut impl TraceEvents) -> Result<(), ReadError> {
        assert_eq!(self.phase, Phase::AfterRegisters, "read_events called out of order");
        let stream = self.take_stream();
        let width = self.machine.physical_address_size as usize;
        let mut r = SectionReader::start(stream, EVENTS_SECTION_NAME)?;
        let declared_event_count = r.read_u64()?;
        for _ in 0..declared_event_count {
            let marker = r.read_u8()?;
            let first_diff_byte = if marker == 0xff {
                let event_type = r.read_u8()?;
                let description = r.read_string()?;
                events.other_event(event_type, &description);
                let diff_byte = r.read_u8()?;
                if diff_byte == 0xff {
                    return Err(ReadError::MalformedSection {
                        section: EVENTS_SECTION_NAME,
                        detail: "\"other\" event's diff_size byte must not be 0xff".into(),
                    });
                }
                diff_byte
            } else {
                events.instruction();
                marker
            };
            let mut diff_byte = first_diff_byte;
            loop {
                let mem_nibble = diff_byte & 0x0f;
                let reg_nibble = (diff_byte >> 4) & 0x0f;
                let mem_count = mem_nibble.min(14);
                let reg_count = reg_nibble.min(14);
                for _ in 0..mem_count {
                    let address = r.read_uint(width)?;
                    let size_byte = r.read_u8()?;
                    let size = if size_byte == 0xff { r.read_uint(width)? as usize } else { size_byte as usize };
                    let data = r.read_vec(size)?;
                    events.memory_write(address, &data);
                }
                for _ in 0..reg_count {
                    self.read_register_entry(&mut r, events)?;
                }
                if mem_nibble != 0x0f && reg_nibble != 0x0f {
                    break;
                }
                // A continuation diff_size of 0xff (both nibbles 0xf) is not
                // emitted by this writer but is tolerated here on purpose:
                // the wire format leaves it ambiguous whether that should be
                // rejected, and reader leniency is preserved rather than
                // tightened.
                diff_byte = r.read_u8()?;
            }
            events.end_event();
        }
        self.stream = Some(r.finish()?);
        self.phase = Phase::Done;
        Ok(())
    }

    fn read_register_entry(&self, r: &mut SectionReader<R>, events: &mut impl TraceEvents) -> Result<(), ReadError> {
        let first = r.read_u8()?;
        let id = if first == 0xff { r.read_u16()? } else { first as u16 };
        if first == 0xff {
            let size = self.machine.register_size(id).ok_or_else(|| ReadError::MalformedSection {
                section: EVENTS_SECTION_NAME,
                detail: format!("register id {} has no entry in the machine description", id),
            })?;
            let value = r.read_vec(size as usize)?;
            events.set_register(id, &value);
            return Ok(());
        }
        match self.machine.operation(first) {
            Some(op) => {
                let size = self.machine.register_size(op.register_id).ok_or_else(|| ReadError::MalformedSection {
                    section: EVENTS_SECTION_NAME,
                    detail: format!("register id {} has no entry in the machine description", op.register_id),
                })? as usize;
                let current = events.get_register(op.register_id);
                if current.len() != size {
                    return Err(ReadError::MalformedSection {
                        section: EVENTS_SECTION_NAME,
                        detail: format!(
                            "get_register({}) returned {} bytes, expected {}",
                            op.register_id,
                            current.len(),
                            size
                        ),
                    });
                }
                let mut result = vec![0u8; size];
                match op.operator {
                    RegisterOperator::Set => result.copy_from_slice(&op.value),
                    RegisterOperator::Add => add_le_bytes(&current, &op.value, size, &mut result),
                    RegisterOperator::And => bitwise_le_bytes(&current, &op.value, &mut result, BitwiseOp::And),
                    RegisterOperator::Or => bitwise_le_bytes(&current, &op.value, &mut result, BitwiseOp::Or),
                }
                events.set_register(op.register_id, &result);
                Ok(())
            },
            None => match self.machine.register_size(id) {
                Some(size) => {
                    let value = r.read_vec(size as usize)?;
                    events.set_register(id, &value);
                    Ok(())
                },
                None => Err(ReadError::MalformedSection {
                    section: EVENTS_SECTION_NAME,
                    detail: format!("register write id {} matches neither a register nor a register operation", id),
                }),
            },
        }
    }
}
