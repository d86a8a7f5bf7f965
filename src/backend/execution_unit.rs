use crate::cpu::{CPUConfig, Latencies};
use crate::instructions::instructions::{CacheLatency, Opcode};

/// The class of functional unit an instruction needs.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum EUClass {
    ALU,
    MUL,
    LSU,
}

impl EUClass {
    pub(crate) fn of(opcode: Opcode) -> EUClass {
        match opcode {
            Opcode::ADD | Opcode::BRANCH => EUClass::ALU,
            Opcode::MUL => EUClass::MUL,
            Opcode::LOAD | Opcode::STORE => EUClass::LSU,
            Opcode::NOP => panic!("A NOP never reaches an execution unit"),
        }
    }

    // A pipelined unit accepts a new instruction every cycle; the others are busy for the full
    // latency of the instruction.
    pub(crate) fn is_pipelined(self) -> bool {
        self == EUClass::MUL
    }
}

/// The number of cycles an instruction occupies its unit before it completes.
pub(crate) fn latency(opcode: Opcode, cache_latency: CacheLatency, latencies: &Latencies) -> u32 {
    match opcode {
        Opcode::ADD | Opcode::BRANCH => latencies.alu,
        Opcode::MUL => latencies.mul,
        Opcode::STORE => latencies.store,
        Opcode::LOAD => match cache_latency {
            CacheLatency::L1Hit => latencies.l1_hit,
            CacheLatency::L2Hit => latencies.l2_hit,
            CacheLatency::L2Miss => latencies.l2_miss,
        },
        Opcode::NOP => panic!("A NOP has no latency"),
    }
}

#[derive(Clone, Copy, PartialEq, Debug)]
pub(crate) enum EUState {
    IDLE,
    BUSY,
}

/// A single execution unit.
pub(crate) struct EU {
    pub(crate) index: u16,
    pub(crate) class: EUClass,
    pub(crate) state: EUState,
}

/// The scoreboard of all execution units of a CPU core. The units are laid out in three
/// contiguous ranges: first the ALUs, then the multipliers, then the load/store units.
pub(crate) struct EUTable {
    pub(crate) capacity: u16,
    array: Vec<EU>,
}

impl EUTable {
    pub(crate) fn new(cpu_config: &CPUConfig) -> EUTable {
        let classes = [
            (EUClass::ALU, cpu_config.alu_count),
            (EUClass::MUL, cpu_config.mul_count),
            (EUClass::LSU, cpu_config.lsu_count),
        ];

        let mut array = Vec::new();
        for (class, count) in classes {
            for _ in 0..count {
                array.push(EU {
                    index: array.len() as u16,
                    class,
                    state: EUState::IDLE,
                });
            }
        }

        EUTable {
            capacity: array.len() as u16,
            array,
        }
    }

    pub(crate) fn get(&self, eu_index: u16) -> &EU {
        &self.array[eu_index as usize]
    }

    // Returns the lowest numbered idle unit of the given class.
    pub(crate) fn find_idle(&self, class: EUClass) -> Option<u16> {
        self.array.iter()
            .find(|eu| eu.class == class && eu.state == EUState::IDLE)
            .map(|eu| eu.index)
    }

    pub(crate) fn idle_cnt(&self) -> usize {
        self.array.iter().filter(|eu| eu.state == EUState::IDLE).count()
    }

    pub(crate) fn allocate(&mut self, eu_index: u16) {
        let eu = &mut self.array[eu_index as usize];
        assert!(eu.state == EUState::IDLE, "EU {} is allocated while it is busy", eu_index);
        eu.state = EUState::BUSY;
    }

    pub(crate) fn deallocate(&mut self, eu_index: u16) {
        let eu = &mut self.array[eu_index as usize];
        assert!(eu.state == EUState::BUSY, "EU {} is deallocated while it is idle", eu_index);
        eu.state = EUState::IDLE;
    }

    pub(crate) fn flush(&mut self) {
        for eu in &mut self.array {
            eu.state = EUState::IDLE;
        }
    }
}
