use std::fmt;
use std::fmt::Display;

use crate::backend::execution_unit::EUClass;
use crate::instructions::instructions::{mnemonic, Opcode, RegisterType};

#[derive(Clone, Copy, PartialEq, Debug)]
pub(crate) enum RSState {
    IDLE,
    BUSY,
}

// A single reservation station
pub(crate) struct RS {
    pub(crate) state: RSState,
    pub(crate) seq: u64,
    pub(crate) opcode: Opcode,
    pub(crate) eu_class: EUClass,
    // physical registers; None if the instruction doesn't have the operand.
    pub(crate) source: [Option<RegisterType>; 2],
    pub(crate) sink: Option<RegisterType>,
    pub(crate) eu_index: Option<u16>,
    // 0 until the station fires; then the number of cycles it has spent in its execution unit + 1.
    pub(crate) progress: u32,
    pub(crate) latency: u32,
}

impl RS {
    fn new() -> Self {
        Self {
            state: RSState::IDLE,
            seq: 0,
            opcode: Opcode::NOP,
            eu_class: EUClass::ALU,
            source: [None, None],
            sink: None,
            eu_index: None,
            progress: 0,
            latency: 0,
        }
    }

    fn reset(&mut self) {
        *self = Self::new();
    }

    pub(crate) fn is_fired(&self) -> bool {
        self.progress > 0
    }

    pub(crate) fn is_load(&self) -> bool {
        self.opcode == Opcode::LOAD
    }

    pub(crate) fn is_store(&self) -> bool {
        self.opcode == Opcode::STORE
    }

    pub(crate) fn is_completed(&self) -> bool {
        self.progress > self.latency
    }
}

impl Display for RS {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RS {} seq={}", mnemonic(self.opcode), self.seq)?;

        for source in self.source.iter().flatten() {
            write!(f, " P{}", source)?;
        }

        if let Some(sink) = self.sink {
            write!(f, " -> P{}", sink)?;
        }

        if let Some(eu_index) = self.eu_index {
            write!(f, " [EU {} {}/{}]", eu_index, self.progress - 1, self.latency)?;
        }

        Ok(())
    }
}

/// The scheduling queue. The stations live in a fixed arena; `order` holds the indices of the
/// busy stations in program order.
pub(crate) struct RSTable {
    free_stack: Vec<u16>,
    order: Vec<u16>,
    pub(crate) capacity: u16,
    array: Vec<RS>,
}

impl RSTable {
    pub(crate) fn new(capacity: u16) -> Self {
        let mut free_stack = Vec::with_capacity(capacity as usize);
        let mut array = Vec::with_capacity(capacity as usize);
        for i in 0..capacity {
            array.push(RS::new());
            free_stack.push(capacity - 1 - i);
        }

        RSTable {
            capacity,
            array,
            free_stack,
            order: Vec::with_capacity(capacity as usize),
        }
    }

    pub(crate) fn get(&self, rs_index: u16) -> &RS {
        return &self.array[rs_index as usize];
    }

    pub(crate) fn get_mut(&mut self, rs_index: u16) -> &mut RS {
        return &mut self.array[rs_index as usize];
    }

    pub(crate) fn has_free(&self) -> bool {
        return !self.free_stack.is_empty();
    }

    pub(crate) fn size(&self) -> usize {
        self.order.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    // A snapshot of the busy stations in program order; safe to hold while stations are
    // deallocated.
    pub(crate) fn in_order(&self) -> Vec<u16> {
        self.order.clone()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item=&RS> + '_ {
        self.order.iter().map(move |&rs_index| &self.array[rs_index as usize])
    }

    pub(crate) fn find(&self, seq: u64) -> Option<&RS> {
        self.iter().find(|rs| rs.seq == seq)
    }

    // The station is appended at the end of the program order; stations must be allocated in
    // program order.
    pub(crate) fn allocate(&mut self, seq: u64) -> u16 {
        if let Some(last) = self.order.last() {
            let youngest = self.array[*last as usize].seq;
            assert!(youngest < seq, "RSTable: seq {} allocated after seq {}", seq, youngest);
        }

        if let Some(rs_index) = self.free_stack.pop() {
            let rs = &mut self.array[rs_index as usize];
            debug_assert!(rs.state == RSState::IDLE);
            rs.state = RSState::BUSY;
            rs.seq = seq;
            self.order.push(rs_index);
            return rs_index;
        } else {
            panic!("No free RS")
        }
    }

    pub(crate) fn deallocate(&mut self, rs_index: u16) {
        let rs = &mut self.array[rs_index as usize];
        assert!(rs.state == RSState::BUSY, "RS {} is deallocated while idle", rs_index);
        rs.reset();

        self.order.retain(|&index| index != rs_index);
        self.free_stack.push(rs_index);
    }

    pub(crate) fn flush(&mut self) {
        for rs_index in self.in_order() {
            self.deallocate(rs_index);
        }
    }
}
