use crate::instructions::instructions::{Opcode, RegisterType};

#[derive(Clone, Copy, PartialEq, Debug)]
pub(crate) enum ROBSlotState {
    UNUSED,
    // dispatched and waiting for execution to complete.
    ISSUED,
    // execution completed; the slot can retire once it reaches the head.
    EXECUTED,
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct ROBSlot {
    pub(crate) state: ROBSlotState,
    pub(crate) seq: u64,
    pub(crate) pc: u64,
    pub(crate) opcode: Opcode,
    pub(crate) sink: Option<RegisterType>,
    // The physical register the sink was mapped to before this instruction renamed it.
    // It is released when this instruction retires.
    pub(crate) prev_phys_reg: Option<RegisterType>,
    pub(crate) mispredict: bool,
    pub(crate) branch_taken: bool,
}

impl ROBSlot {
    fn new() -> Self {
        Self {
            state: ROBSlotState::UNUSED,
            seq: 0,
            pc: 0,
            opcode: Opcode::NOP,
            sink: None,
            prev_phys_reg: None,
            mispredict: false,
            branch_taken: false,
        }
    }

    fn reset(&mut self) {
        *self = Self::new();
    }
}

pub(crate) struct ROB {
    pub(crate) capacity: u16,
    // everything before this point is retired.
    head: u64,
    tail: u64,
    slots: Vec<ROBSlot>,
}

impl ROB {
    pub(crate) fn new(capacity: u16) -> Self {
        assert!(capacity > 0, "ROB: capacity must be larger than 0");

        let mut slots = Vec::with_capacity(capacity as usize);
        for _ in 0..capacity {
            slots.push(ROBSlot::new());
        }

        Self {
            capacity,
            head: 0,
            tail: 0,
            slots,
        }
    }

    fn to_index(&self, seq: u64) -> u16 {
        (seq % self.capacity as u64) as u16
    }

    pub(crate) fn get_mut(&mut self, slot_index: u16) -> &mut ROBSlot {
        &mut self.slots[slot_index as usize]
    }

    pub(crate) fn allocate(&mut self) -> u16 {
        assert!(self.has_space(), "ROB: Can't allocate if no space.");

        let index = self.to_index(self.tail);
        self.tail += 1;
        return index;
    }

    pub(crate) fn head_has_executed(&self) -> bool {
        if self.is_empty() {
            return false;
        }

        let index = self.to_index(self.head);
        return self.slots[index as usize].state == ROBSlotState::EXECUTED;
    }

    // Removes the head slot; it must have executed.
    pub(crate) fn retire_head(&mut self) -> ROBSlot {
        assert!(self.head_has_executed(), "ROB: can't retire because the head hasn't executed");

        let index = self.to_index(self.head) as usize;
        let slot = self.slots[index];
        self.slots[index].reset();
        self.head += 1;
        return slot;
    }

    // Marks the slot of the given instruction as executed.
    pub(crate) fn mark_executed(&mut self, seq: u64) {
        let mut found = false;
        for pos in self.head..self.tail {
            let index = self.to_index(pos) as usize;
            let slot = &mut self.slots[index];
            if slot.seq == seq {
                debug_assert!(slot.state == ROBSlotState::ISSUED,
                              "ROB: slot for seq {} is in state {:?}", seq, slot.state);
                slot.state = ROBSlotState::EXECUTED;
                found = true;
                break;
            }
        }

        assert!(found, "ROB: no slot found for seq {}", seq);
    }

    // The live slots, from head to tail.
    pub(crate) fn iter(&self) -> impl Iterator<Item=&ROBSlot> + '_ {
        (self.head..self.tail).map(move |pos| &self.slots[self.to_index(pos) as usize])
    }

    pub(crate) fn size(&self) -> u16 {
        return (self.tail - self.head) as u16;
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    pub(crate) fn has_space(&self) -> bool {
        return self.capacity > self.size();
    }

    pub(crate) fn flush(&mut self) {
        for slot in &mut self.slots {
            slot.reset();
        }
        self.head = 0;
        self.tail = 0;
    }
}
