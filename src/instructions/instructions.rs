use std::collections::VecDeque;
use std::fmt;

use regex::Regex;

// The number of architectural registers. The first ARCH_REG_CNT physical registers are the
// architectural registers themselves.
pub(crate) const ARCH_REG_CNT: u16 = 32;

// R0 can't be a real destination; a destination of R0 marks the instruction as a NOP.
pub(crate) const NOP_REG: RegisterType = 0;

pub(crate) type RegisterType = u16;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SourceLocation {
    pub line: usize,
    pub column: usize,
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Opcode {
    ADD,
    MUL,
    LOAD,
    STORE,
    BRANCH,
    // injected by the frontend on an instruction cache miss; never part of a trace.
    NOP,
}

pub(crate) fn mnemonic(opcode: Opcode) -> &'static str {
    match opcode {
        Opcode::ADD => "ADD",
        Opcode::MUL => "MUL",
        Opcode::LOAD => "LOAD",
        Opcode::STORE => "STORE",
        Opcode::BRANCH => "BRANCH",
        Opcode::NOP => "NOP",
    }
}

pub(crate) fn get_opcode(mnemonic: &str) -> Option<Opcode> {
    let string = mnemonic.to_uppercase();

    match string.as_str() {
        "ADD" => Some(Opcode::ADD),
        "MUL" => Some(Opcode::MUL),
        "LOAD" => Some(Opcode::LOAD),
        "STORE" => Some(Opcode::STORE),
        "BRANCH" => Some(Opcode::BRANCH),
        _ => None,
    }
}

pub(crate) fn get_register(name: &str) -> Option<RegisterType> {
    let re = Regex::new(r"^(?i)R(\d+)$").unwrap();
    let captures = re.captures(name)?;
    let reg: RegisterType = captures[1].parse().ok()?;

    if reg >= ARCH_REG_CNT {
        return None;
    }
    Some(reg)
}

/// The data cache level that services a load. Only the latency matters; there is no cache
/// array behind it.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CacheLatency {
    L1Hit,
    L2Hit,
    L2Miss,
}

/// A decoded instruction as handed out by the trace source.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Instr {
    // program order; unique and monotonic, assigned when the instruction is fetched.
    pub(crate) seq: u64,
    pub(crate) pc: u64,
    pub(crate) opcode: Opcode,
    pub(crate) source: [Option<RegisterType>; 2],
    pub(crate) sink: Option<RegisterType>,
    // only meaningful for loads.
    pub(crate) cache_latency: CacheLatency,
    // only meaningful for branches.
    pub(crate) branch_taken: bool,
    pub(crate) mispredict: bool,
    pub(crate) loc: Option<SourceLocation>,
}

impl Instr {
    pub(crate) fn is_nop(&self) -> bool {
        self.sink == Some(NOP_REG)
    }

    pub(crate) fn is_branch(&self) -> bool {
        self.opcode == Opcode::BRANCH
    }
}

impl fmt::Display for Instr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} dest=", mnemonic(self.opcode))?;
        write_register(f, self.sink)?;
        write!(f, ", src1=")?;
        write_register(f, self.source[0])?;
        write!(f, ", src2=")?;
        write_register(f, self.source[1])?;
        write!(f, ", seq={}", self.seq)?;

        if let Some(loc) = self.loc {
            write!(f, " ; {}", loc)?;
        }

        Ok(())
    }
}

fn write_register(f: &mut fmt::Formatter<'_>, reg: Option<RegisterType>) -> fmt::Result {
    match reg {
        Some(reg) => write!(f, "R{}", reg),
        None => write!(f, "(none)"),
    }
}

#[allow(non_snake_case)]
pub(crate) const fn create_NOP() -> Instr {
    Instr {
        seq: 0,
        pc: 0,
        opcode: Opcode::NOP,
        source: [None, None],
        sink: Some(NOP_REG),
        cache_latency: CacheLatency::L1Hit,
        branch_taken: false,
        mispredict: false,
        loc: None,
    }
}

pub(crate) const NOP: Instr = create_NOP();

// The InstrQueue sits between frontend and backend: the dispatch queue. It has no capacity
// limit; backpressure is applied at dispatch, never at fetch.
pub(crate) struct InstrQueue {
    instructions: VecDeque<Instr>,
}

impl InstrQueue {
    pub fn new() -> Self {
        InstrQueue { instructions: VecDeque::new() }
    }

    pub fn size(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    pub fn enqueue(&mut self, instr: Instr) {
        self.instructions.push_back(instr);
    }

    pub fn dequeue(&mut self) -> Instr {
        match self.instructions.pop_front() {
            Some(instr) => instr,
            None => panic!("Can't dequeue when InstrQueue is empty."),
        }
    }

    pub fn peek(&self) -> &Instr {
        match self.instructions.front() {
            Some(instr) => instr,
            None => panic!("Can't peek when InstrQueue is empty."),
        }
    }

    pub fn flush(&mut self) {
        self.instructions.clear();
    }
}

// A single line of a trace file.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TraceRecord {
    pub(crate) instr: Instr,
    // the number of instruction cache misses taken before the instruction is delivered.
    pub(crate) icache_misses: u32,
}

pub(crate) struct Program {
    pub(crate) records: Vec<TraceRecord>,
}

impl Program {
    pub fn get_record(&self, pos: usize) -> &TraceRecord {
        &self.records[pos]
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }
}
