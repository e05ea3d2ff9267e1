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

//! A minimal example consumer of [`bintrace`]: prints a `trace.bin` stream's
//! metadata, machine description, initial register state and event-by-event
//! register/memory diffs to standard output. Not part of the core codec.

use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use bintrace::metadata::{self, ResourceType};
use bintrace::trace::{TraceEvents, TraceReader};

#[derive(Parser)]
#[command(name = "trace-reader", about = "Prints a bintrace trace.bin stream")]
struct Args {
    /// Print the stream's metadata and machine description, then exit.
    #[arg(long)]
    info: bool,

    /// Print the initial register state before streaming events.
    #[arg(long)]
    initial: bool,

    /// Path to the trace.bin file.
    path: PathBuf,
}

fn hex(data: &[u8]) -> String {
    data.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Tracks register state across events so register-operation references can
/// be resolved, and prints each event as it is decoded.
struct Printer {
    registers: HashMap<u16, Vec<u8>>,
}

impl TraceEvents for Printer {
    fn instruction(&mut self) {
        print!("instruction:");
    }

    fn other_event(&mut self, event_type: u8, description: &str) {
        println!("event type={} \"{}\"", event_type, description);
    }

    fn memory_write(&mut self, address: u64, data: &[u8]) {
        print!(" mem[{:#x}]={}", address, hex(data));
    }

    fn set_register(&mut self, id: u16, value: &[u8]) {
        print!(" reg[{}]={}", id, hex(value));
        self.registers.insert(id, value.to_vec());
    }

    fn end_event(&mut self) {
        println!();
    }

    fn get_register(&self, id: u16) -> Vec<u8> {
        self.registers.get(&id).cloned().unwrap_or_default()
    }
}

fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let file = BufReader::new(File::open(&args.path)?);
    let (meta, stream) = metadata::open(file, ResourceType::TraceBin)?;
    let mut reader = TraceReader::open(stream)?;

    if args.info {
        println!("resource_type: {}", meta.resource_type.name());
        println!("format_version: {}", meta.format_version);
        println!("tool: {} {}", meta.tool_name, meta.tool_version);
        println!("tool_info: {}", meta.tool_info);
        println!("generation_date: {}", meta.generation_date);
        println!("architecture: {:?}", reader.machine_description().architecture);
        println!("physical_address_size: {}", reader.machine_description().physical_address_size);
        println!("memory_regions: {}", reader.machine_description().memory_regions.len());
        println!("registers: {}", reader.machine_description().registers.len());
        return Ok(());
    }

    let mut printer = Printer { registers: HashMap::new() };
    reader.read_initial_memory(|base, data| {
        if args.initial {
            println!("initial mem[{:#x}] = {}", base, hex(&data));
        }
    })?;
    reader.read_initial_registers(|id, value| {
        if args.initial {
            println!("initial reg[{}] = {}", id, hex(&value));
        }
        printer.registers.insert(id, value);
    })?;
    reader.read_events(&mut printer)?;
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("trace-reader: {}", e);
            ExitCode::FAILURE
        },
    }
}
