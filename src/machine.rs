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

//! The machine description: the fixed, non-diffable context a trace stream
//! is interpreted against (architecture, address width, memory layout,
//! register catalog and the register-operation vocabulary the event stream
//! can reference).

use crate::error::{ReadError, WriteError};
use crate::section::{SectionReader, SectionWriter};
use std::io::{Read, Seek, Write};

const SECTION_NAME: &str = "trace machine description";

/// The CPU architecture a trace was captured on.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Architecture {
    /// x86-64, first revision of the machine description for this architecture.
    X64_1,
    /// AArch64, first revision of the machine description for this architecture.
    Arm64_1,
}

impl Architecture {
    fn magic(self) -> u32 {
        match self {
            Architecture::X64_1 => 0x3134_3678,
            Architecture::Arm64_1 => 0x316d_7261,
        }
    }

    fn from_magic(magic: u32) -> Option<Architecture> {
        match magic {
            0x3134_3678 => Some(Architecture::X64_1),
            0x316d_7261 => Some(Architecture::Arm64_1),
            _ => None,
        }
    }
}

/// A contiguous range of physical memory present at trace start.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemoryRegion {
    /// Physical base address of the region.
    pub base: u64,
    /// Size of the region in bytes.
    pub size: u64,
}

/// A register the event stream may record writes to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Register {
    /// Identifier referenced by register writes in the event stream.
    pub id: u16,
    /// Size of the register in bytes.
    pub size: u16,
    /// Human-readable name (at most 255 bytes).
    pub name: String,
}

/// The arithmetic a register-operation entry applies to a register's current value.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RegisterOperator {
    /// Replace the register's value outright.
    Set,
    /// Add the operand to the register's current value, discarding carry out.
    Add,
    /// Bitwise AND the operand into the register's current value.
    And,
    /// Bitwise OR the operand into the register's current value.
    Or,
}

impl RegisterOperator {
    fn to_byte(self) -> u8 {
        match self {
            RegisterOperator::Set => 0,
            RegisterOperator::Add => 1,
            RegisterOperator::And => 2,
            RegisterOperator::Or => 3,
        }
    }

    fn from_byte(b: u8) -> Option<RegisterOperator> {
        match b {
            0 => Some(RegisterOperator::Set),
            1 => Some(RegisterOperator::Add),
            2 => Some(RegisterOperator::And),
            3 => Some(RegisterOperator::Or),
            _ => None,
        }
    }
}

/// A reusable register-operation recipe: a byte key the event stream can
/// reference instead of spelling out the operator and operand on every
/// register write.
///
/// `key` must not be `0xff`; that value is reserved by the events section
/// wire format to mean "this is a plain register id, not an operation key".
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegisterOperation {
    /// The key event writes reference this operation by.
    pub key: u8,
    /// Which register this operation applies to.
    pub register_id: u16,
    /// The arithmetic to apply.
    pub operator: RegisterOperator,
    /// The operand, little-endian, sized to match the target register.
    pub value: Vec<u8>,
}

/// A register whose value is fixed for the lifetime of the trace and is
/// recorded once in the machine description rather than in the initial
/// register section.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StaticRegister {
    /// Human-readable name (at most 255 bytes). Static registers are keyed
    /// by name rather than id; they have no entry in the register catalog.
    pub name: String,
    /// Fixed value, little-endian.
    pub value: Vec<u8>,
}

/// A full or partial CPU register snapshot: an ordered sequence of
/// `(register id, value)` pairs, as produced by a cache point's register
/// dump.
pub type RegisterContainer = Vec<(u16, Vec<u8>)>;

/// The full machine description for a trace.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MachineDescription {
    /// CPU architecture the trace was captured on.
    pub architecture: Architecture,
    /// Width, in bytes, of a physical address (1 to 8 inclusive).
    pub physical_address_size: u8,
    /// Memory regions present at trace start, in capture order.
    pub memory_regions: Vec<MemoryRegion>,
    /// Registers the event stream may write to.
    pub registers: Vec<Register>,
    /// Register-operation recipes event writes may reference by key.
    pub register_operations: Vec<RegisterOperation>,
    /// Registers whose value never changes over the trace.
    pub static_registers: Vec<StaticRegister>,
}

impl MachineDescription {
    /// Writes this machine description as its own section.
    pub fn write(&self, stream: &mut (impl Write + Seek)) -> Result<(), WriteError> {
        let width = self.physical_address_size as usize;
        let mut w = SectionWriter::start(stream, SECTION_NAME)?;
        w.write_u32(self.architecture.magic())?;
        w.write_u8(self.physical_address_size)?;

        w.write_u32(self.memory_regions.len() as u32)?;
        for region in &self.memory_regions {
            w.write_uint(region.base, width)?;
            w.write_uint(region.size, width)?;
        }

        w.write_u32(self.registers.len() as u32)?;
        let mut seen_ids = std::collections::HashSet::new();
        let mut seen_names = std::collections::HashSet::new();
        for register in &self.registers {
            if !seen_ids.insert(register.id) {
                return Err(WriteError::NonsenseValue {
                    section: SECTION_NAME,
                    detail: format!("duplicate register id {}", register.id),
                });
            }
            if !seen_names.insert(register.name.as_str()) {
                return Err(WriteError::NonsenseValue {
                    section: SECTION_NAME,
                    detail: format!("duplicate register name {:?}", register.name),
                });
            }
            w.write_u16(register.id)?;
            w.write_u16(register.size)?;
            w.write_string(&register.name)?;
        }

        w.write_u32(self.register_operations.len() as u32)?;
        for op in &self.register_operations {
            if op.key == 0xff {
                return Err(WriteError::NonsenseValue {
                    section: SECTION_NAME,
                    detail: "register operation key 0xff is reserved".into(),
                });
            }
            if seen_ids.contains(&(op.key as u16)) {
                return Err(WriteError::NonsenseValue {
                    section: SECTION_NAME,
                    detail: format!("register operation key {} collides with a register id", op.key),
                });
            }
            let target_size = self.register_size(op.register_id).ok_or_else(|| WriteError::NonsenseValue {
                section: SECTION_NAME,
                detail: format!("register operation targets unknown register id {}", op.register_id),
            })?;
            if op.value.len() != target_size as usize {
                return Err(WriteError::NonsenseValue {
                    section: SECTION_NAME,
                    detail: format!(
                        "register operation value is {} bytes, target register {} is {} bytes",
                        op.value.len(),
                        op.register_id,
                        target_size
                    ),
                });
            }
            w.write_u8(op.key)?;
            w.write_u16(op.register_id)?;
            w.write_u8(op.operator.to_byte())?;
            w.write(&op.value)?;
        }

        w.write_u32(self.static_registers.len() as u32)?;
        let mut seen_static_names = std::collections::HashSet::new();
        for reg in &self.static_registers {
            if !seen_static_names.insert(reg.name.as_str()) {
                return Err(WriteError::NonsenseValue {
                    section: SECTION_NAME,
                    detail: format!("duplicate static register name {:?}", reg.name),
                });
            }
            w.write_string(&reg.name)?;
            w.write_sized_buffer_u8(&reg.value)?;
        }

        w.finalize().map(|_| ())
    }

    /// Reads a machine description section, validating every constrained field.
    pub fn read(stream: &mut impl Read) -> Result<MachineDescription, ReadError> {
        let mut r = SectionReader::start(stream, SECTION_NAME)?;
        let magic = r.read_u32()?;
        let architecture = Architecture::from_magic(magic).ok_or_else(|| ReadError::UnsupportedFeature {
            section: SECTION_NAME,
            detail: format!("unknown architecture magic {:#010x}", magic),
        })?;
        let physical_address_size = r.read_u8()?;
        if !(1..=8).contains(&physical_address_size) {
            return Err(ReadError::MalformedSection {
                section: SECTION_NAME,
                detail: format!("physical address size {} outside [1, 8]", physical_address_size),
            });
        }

        let width = physical_address_size as usize;
        let region_count = r.read_u32()?;
        let mut memory_regions = Vec::with_capacity(region_count as usize);
        for _ in 0..region_count {
            let base = r.read_uint(width)?;
            let size = r.read_uint(width)?;
            memory_regions.push(MemoryRegion { base, size });
        }

        let register_count = r.read_u32()?;
        let mut registers = Vec::with_capacity(register_count as usize);
        let mut seen_ids = std::collections::HashSet::new();
        let mut seen_names = std::collections::HashSet::new();
        for _ in 0..register_count {
            let id = r.read_u16()?;
            if !seen_ids.insert(id) {
                return Err(ReadError::MalformedSection {
                    section: SECTION_NAME,
                    detail: format!("duplicate register id {}", id),
                });
            }
            let size = r.read_u16()?;
            let name = r.read_string()?;
            if !seen_names.insert(name.clone()) {
                return Err(ReadError::MalformedSection {
                    section: SECTION_NAME,
                    detail: format!("duplicate register name {:?}", name),
                });
            }
            registers.push(Register { id, size, name });
        }
        let register_sizes: std::collections::HashMap<u16, u16> =
            registers.iter().map(|r| (r.id, r.size)).collect();

        let op_count = r.read_u32()?;
        let mut register_operations = Vec::with_capacity(op_count as usize);
        for _ in 0..op_count {
            let key = r.read_u8()?;
            if key == 0xff {
                return Err(ReadError::MalformedSection {
                    section: SECTION_NAME,
                    detail: "register operation key 0xff is reserved".into(),
                });
            }
            if seen_ids.contains(&(key as u16)) {
                return Err(ReadError::MalformedSection {
                    section: SECTION_NAME,
                    detail: format!("register operation key {} collides with a register id", key),
                });
            }
            let register_id = r.read_u16()?;
            let op_byte = r.read_u8()?;
            let operator = RegisterOperator::from_byte(op_byte).ok_or_else(|| ReadError::MalformedSection {
                section: SECTION_NAME,
                detail: format!("unknown register operator byte {}", op_byte),
            })?;
            let target_size = *register_sizes.get(&register_id).ok_or_else(|| ReadError::MalformedSection {
                section: SECTION_NAME,
                detail: format!("register operation targets unknown register id {}", register_id),
            })?;
            let value = r.read_vec(target_size as usize)?;
            register_operations.push(RegisterOperation { key, register_id, operator, value });
        }

        let static_count = r.read_u32()?;
        let mut static_registers = Vec::with_capacity(static_count as usize);
        let mut seen_static_names = std::collections::HashSet::new();
        for _ in 0..static_count {
            let name = r.read_string()?;
            if !seen_static_names.insert(name.clone()) {
                return Err(ReadError::MalformedSection {
                    section: SECTION_NAME,
                    detail: format!("duplicate static register name {:?}", name),
                });
            }
            let value = r.read_sized_buffer_u8()?;
            static_registers.push(StaticRegister { name, value });
        }

        r.finish()?;
        Ok(MachineDescription {
            architecture,
            physical_address_size,
            memory_regions,
            registers,
            register_operations,
            static_registers,
        })
    }

    /// Looks up a register's declared size by id.
    pub fn register_size(&self, id: u16) -> Option<u16> {
        self.registers.iter().find(|r| r.id == id).map(|r| r.size)
    }

    /// Looks up a register-operation recipe by key.
    pub fn operation(&self, key: u8) -> Option<&RegisterOperation> {
        self.register_operations.iter().find(|op| op.key == key)
    }
}

/// Incrementally assembles a [`MachineDescription`], validating constraints
/// that are awkward to check field-by-field as the struct is built.
#[derive(Default)]
pub struct MachineDescriptionBuilder {
    architecture: Option<Architecture>,
    physical_address_size: Option<u8>,
    memory_regions: Vec<MemoryRegion>,
    registers: Vec<Register>,
    register_operations: Vec<RegisterOperation>,
    static_registers: Vec<StaticRegister>,
}

impl MachineDescriptionBuilder {
    /// Creates an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the architecture.
    pub fn architecture(mut self, architecture: Architecture) -> Self {
        self.architecture = Some(architecture);
        self
    }

    /// Sets the physical address width in bytes.
    pub fn physical_address_size(mut self, size: u8) -> Self {
        self.physical_address_size = Some(size);
        self
    }

    /// Appends a memory region; order is preserved.
    pub fn memory_region(mut self, base: u64, size: u64) -> Self {
        self.memory_regions.push(MemoryRegion { base, size });
        self
    }

    /// Appends a register.
    pub fn register(mut self, id: u16, size: u16, name: impl Into<String>) -> Self {
        self.registers.push(Register { id, size, name: name.into() });
        self
    }

    /// Appends a register-operation recipe.
    pub fn register_operation(
        mut self,
        key: u8,
        register_id: u16,
        operator: RegisterOperator,
        value: impl Into<Vec<u8>>,
    ) -> Self {
        self.register_operations.push(RegisterOperation {
            key,
            register_id,
            operator,
            value: value.into(),
        });
        self
    }

    /// Appends a static register, keyed by name rather than id.
    pub fn static_register(mut self, name: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.static_registers.push(StaticRegister { name: name.into(), value: value.into() });
        self
    }

    /// Validates and builds the final [`MachineDescription`].
    ///
    /// Enforces every invariant in §3 of the format it encodes: no duplicate
    /// register ids or names, no register-operation key colliding with
    /// `0xff` or with any register id, every register-operation's target
    /// register and value width agreeing with the register catalog, and no
    /// duplicate static register names.
    pub fn build(self) -> Result<MachineDescription, WriteError> {
        let physical_address_size = self.physical_address_size.unwrap_or(8);
        if !(1..=8).contains(&physical_address_size) {
            return Err(WriteError::NonsenseValue {
                section: SECTION_NAME,
                detail: format!("physical address size {} outside [1, 8]", physical_address_size),
            });
        }
        let mut seen_ids = std::collections::HashSet::new();
        let mut seen_names = std::collections::HashSet::new();
        for register in &self.registers {
            if !seen_ids.insert(register.id) {
                return Err(WriteError::NonsenseValue {
                    section: SECTION_NAME,
                    detail: format!("duplicate register id {}", register.id),
                });
            }
            if !seen_names.insert(register.name.as_str()) {
                return Err(WriteError::NonsenseValue {
                    section: SECTION_NAME,
                    detail: format!("duplicate register name {:?}", register.name),
                });
            }
        }
        for op in &self.register_operations {
            if op.key == 0xff {
                return Err(WriteError::NonsenseValue {
                    section: SECTION_NAME,
                    detail: "register operation key 0xff is reserved".into(),
                });
            }
            if seen_ids.contains(&(op.key as u16)) {
                return Err(WriteError::NonsenseValue {
                    section: SECTION_NAME,
                    detail: format!("register operation key {} collides with a register id", op.key),
                });
            }
            let target_size = self
                .registers
                .iter()
                .find(|r| r.id == op.register_id)
                .map(|r| r.size)
                .ok_or_else(|| WriteError::NonsenseValue {
                    section: SECTION_NAME,
                    detail: format!("register operation targets unknown register id {}", op.register_id),
                })?;
            if op.value.len() != target_size as usize {
                return Err(WriteError::NonsenseValue {
                    section: SECTION_NAME,
                    detail: format!(
                        "register operation value is {} bytes, target register {} is {} bytes",
                        op.value.len(),
                        op.register_id,
                        target_size
                    ),
                });
            }
        }
        let mut seen_static_names = std::collections::HashSet::new();
        for reg in &self.static_registers {
            if !seen_static_names.insert(reg.name.as_str()) {
                return Err(WriteError::NonsenseValue {
                    section: SECTION_NAME,
                    detail: format!("duplicate static register name {:?}", reg.name),
                });
            }
        }
        Ok(MachineDescription {
            architecture: self.architecture.unwrap_or(Architecture::X64_1),
            physical_address_size,
            memory_regions: self.memory_regions,
            registers: self.registers,
            register_operations: self.register_operations,
            static_registers: self.static_registers,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn sample() -> MachineDescription {
        MachineDescriptionBuilder::new()
            .architecture(Architecture::X64_1)
            .physical_address_size(5)
            .memory_region(0, 0x1000)
            .register(0, 8, "rax")
            .register(1, 8, "rbx")
            .register_operation(0xfe, 0, RegisterOperator::Add, vec![1, 0, 0, 0, 0, 0, 0, 0])
            .static_register("cr0", vec![0; 8])
            .build()
            .unwrap()
    }

    #[test]
    fn round_trip() {
        let mut stream = Cursor::new(Vec::new());
        sample().write(&mut stream).unwrap();
        stream.set_position(0);
        let back = MachineDescription::read(&mut stream).unwrap();
        assert_eq!(back, sample());
    }

    #[test]
    fn physical_address_size_bounds() {
        assert!(MachineDescriptionBuilder::new().physical_address_size(0).build().is_err());
        assert!(MachineDescriptionBuilder::new().physical_address_size(9).build().is_err());
        assert!(MachineDescriptionBuilder::new().physical_address_size(1).build().is_ok());
        assert!(MachineDescriptionBuilder::new().physical_address_size(8).build().is_ok());
    }

    #[test]
    fn register_operation_key_0xff_rejected() {
        let built = MachineDescriptionBuilder::new()
            .register_operation(0xff, 0, RegisterOperator::Set, vec![])
            .build();
        assert!(built.is_err());
    }

    #[test]
    fn unknown_architecture_magic_rejected() {
        let mut stream = Cursor::new(Vec::new());
        {
            let mut w = SectionWriter::start(&mut stream, SECTION_NAME).unwrap();
            w.write_u32(0xffff_ffff).unwrap();
            w.write_u8(8).unwrap();
            w.write_u32(0).unwrap();
            w.write_u32(0).unwrap();
            w.write_u32(0).unwrap();
            w.write_u32(0).unwrap();
            w.finalize().unwrap();
        }
        stream.set_position(0);
        let err = MachineDescription::read(&mut stream).unwrap_err();
        assert!(matches!(err, ReadError::UnsupportedFeature { .. }));
    }

    #[test]
    fn unknown_register_operator_byte_rejected() {
        let mut stream = Cursor::new(Vec::new());
        {
            let mut w = SectionWriter::start(&mut stream, SECTION_NAME).unwrap();
            w.write_u32(Architecture::X64_1.magic()).unwrap();
            w.write_u8(8).unwrap();
            w.write_u32(0).unwrap(); // region count
            w.write_u32(1).unwrap(); // register count
            w.write_u16(1).unwrap(); // register id
            w.write_u16(8).unwrap(); // register size
            w.write_string("r1").unwrap();
            w.write_u32(1).unwrap(); // op count
            w.write_u8(0).unwrap(); // key (no collision with register id 1)
            w.write_u16(1).unwrap(); // target register
            w.write_u8(4).unwrap(); // invalid op byte
            w.finalize().unwrap();
        }
        stream.set_position(0);
        let err = MachineDescription::read(&mut stream).unwrap_err();
        assert!(matches!(err, ReadError::MalformedSection { .. }));
    }

    #[test]
    fn register_operation_key_colliding_with_register_id_rejected() {
        let built = MachineDescriptionBuilder::new()
            .register(0, 8, "rax")
            .register_operation(0, 0, RegisterOperator::Set, vec![0; 8])
            .build();
        assert!(built.is_err());
    }

    #[test]
    fn duplicate_static_register_name_rejected() {
        let built = MachineDescriptionBuilder::new()
            .static_register("cr0", vec![0])
            .static_register("cr0", vec![1])
            .build();
        assert!(built.is_err());
    }

    #[test]
    fn register_operation_value_width_mismatch_rejected() {
        let built = MachineDescriptionBuilder::new()
            .register(0, 8, "rax")
            .register_operation(0xfe, 0, RegisterOperator::Set, vec![0, 0, 0, 0])
            .build();
        assert!(built.is_err());
    }
}
