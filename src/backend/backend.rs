use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;

use log::info;

use crate::backend::execution_unit::{EUClass, EUState, EUTable, latency};
use crate::backend::physical_register::PhysRegFile;
use crate::backend::register_alias_table::RAT;
use crate::backend::reorder_buffer::{ROB, ROBSlotState};
use crate::backend::reservation_station::{RS, RSTable};
use crate::cpu::{CPUConfig, Latencies, PerfCounters, Trace};
use crate::frontend::branch_predictor::BranchPredictor;
use crate::instructions::instructions::{ARCH_REG_CNT, InstrQueue, Opcode};

/// What the retire stage did in a single cycle.
#[derive(Clone, Copy, Default, Debug, PartialEq)]
pub(crate) struct CycleOutcome {
    pub(crate) retired: u64,
    // a mispredicted branch retired; the pipeline has been flushed.
    pub(crate) retired_mispredict: bool,
}

pub(crate) struct Backend {
    instr_queue: Rc<RefCell<InstrQueue>>,
    predictor: Rc<RefCell<dyn BranchPredictor>>,
    pub(crate) rs_table: RSTable,
    pub(crate) phys_reg_file: PhysRegFile,
    pub(crate) rat: RAT,
    pub(crate) rob: ROB,
    pub(crate) eu_table: EUTable,
    latencies: Latencies,
    trace: Trace,
    dispatch_n_wide: u8,
    perf_counters: Rc<RefCell<PerfCounters>>,
}

impl Backend {
    pub(crate) fn new(cpu_config: &CPUConfig,
                      instr_queue: Rc<RefCell<InstrQueue>>,
                      predictor: Rc<RefCell<dyn BranchPredictor>>,
                      perf_counters: Rc<RefCell<PerfCounters>>) -> Backend {
        Backend {
            trace: cpu_config.trace.clone(),
            instr_queue,
            predictor,
            rs_table: RSTable::new(cpu_config.rs_count()),
            phys_reg_file: PhysRegFile::new(cpu_config.phys_reg_count),
            rat: RAT::new(),
            rob: ROB::new(cpu_config.rob_capacity),
            eu_table: EUTable::new(cpu_config),
            latencies: cpu_config.latency.clone(),
            dispatch_n_wide: cpu_config.dispatch_n_wide,
            perf_counters,
        }
    }

    // Nothing is waiting in the scheduling queue or the ROB.
    pub(crate) fn is_idle(&self) -> bool {
        self.rob.is_empty() && self.rs_table.is_empty()
    }

    pub(crate) fn do_cycle(&mut self) -> CycleOutcome {
        let outcome = self.cycle_retire();
        if outcome.retired_mispredict {
            // everything younger than the branch is gone; the remaining stages have nothing to do.
            return outcome;
        }

        self.cycle_execute();
        self.cycle_schedule();
        self.cycle_dispatch();
        return outcome;
    }

    // Retires the executed instructions at the head of the ROB in program order.
    fn cycle_retire(&mut self) -> CycleOutcome {
        let mut outcome = CycleOutcome::default();
        let mut perf_counters = self.perf_counters.borrow_mut();

        while self.rob.head_has_executed() {
            let rob_slot = self.rob.retire_head();

            outcome.retired += 1;
            perf_counters.retired_cnt += 1;

            if self.trace.retire {
                info!("Retired [seq={}, pc={:#x}, {:?}]", rob_slot.seq, rob_slot.pc, rob_slot.opcode);
            }

            if rob_slot.opcode == Opcode::BRANCH {
                self.predictor.borrow_mut().update(rob_slot.pc, rob_slot.branch_taken, rob_slot.seq);
            }

            // the previous mapping of the sink can't be read by anyone anymore.
            if let Some(prev_phys_reg) = rob_slot.prev_phys_reg {
                if !PhysRegFile::is_arch(prev_phys_reg) {
                    self.phys_reg_file.deallocate(prev_phys_reg);
                }
            }

            if rob_slot.mispredict {
                perf_counters.branch_misprediction_cnt += 1;
                outcome.retired_mispredict = true;
                break;
            }
        }

        drop(perf_counters);

        if outcome.retired_mispredict {
            self.flush();
        }

        return outcome;
    }

    // Advances every fired reservation station by one cycle and completes the ones that
    // have spent their full latency in the execution unit.
    fn cycle_execute(&mut self) {
        let mut perf_counters = self.perf_counters.borrow_mut();

        for rs_index in self.rs_table.in_order() {
            let rs = self.rs_table.get_mut(rs_index);
            if !rs.is_fired() {
                continue;
            }

            let eu_index = match rs.eu_index {
                Some(eu_index) => eu_index,
                None => panic!("Fired RS seq={} doesn't have an execution unit", rs.seq),
            };

            rs.progress += 1;

            let pipelined = rs.eu_class.is_pipelined();
            if pipelined && rs.progress == 2 {
                // a pipelined unit only needs the first cycle.
                self.eu_table.deallocate(eu_index);
            }

            if !rs.is_completed() {
                continue;
            }

            if !pipelined {
                self.eu_table.deallocate(eu_index);
            }

            if self.trace.execute {
                info!("Completed [{}]", rs);
            }

            let seq = rs.seq;
            if let Some(sink) = rs.sink {
                self.phys_reg_file.mark_ready(sink);
            }

            self.rob.mark_executed(seq);
            self.rs_table.deallocate(rs_index);
            perf_counters.execute_cnt += 1;
        }
    }

    // Fires the reservation stations whose operands are ready, in program order.
    fn cycle_schedule(&mut self) {
        let mut perf_counters = self.perf_counters.borrow_mut();
        let mut fired_cnt = 0;
        let mut store_fired = false;

        for rs_index in self.rs_table.in_order() {
            let rs = self.rs_table.get(rs_index);
            if rs.is_fired() {
                continue;
            }

            if !self.sources_ready(rs) {
                continue;
            }

            let eu_index = match self.eu_table.find_idle(rs.eu_class) {
                Some(eu_index) => eu_index,
                None => continue,
            };

            let seq = rs.seq;
            let is_store = rs.is_store();

            // memory disambiguation: loads and stores don't pass older stores, stores don't
            // pass older loads either.
            if rs.is_load() && self.has_older(seq, |other| other.is_store()) {
                continue;
            }

            if is_store && (store_fired || self.has_older(seq, |other| other.is_load() || other.is_store())) {
                continue;
            }

            self.eu_table.allocate(eu_index);

            let rs = self.rs_table.get_mut(rs_index);
            rs.eu_index = Some(eu_index);
            rs.progress = 1;

            if self.trace.schedule {
                info!("Fired [{}]", rs);
            }

            fired_cnt += 1;
            perf_counters.fire_cnt += 1;
            if is_store {
                store_fired = true;
            }
        }

        if fired_cnt == 0 {
            perf_counters.no_fire_cnt += 1;
        }
    }

    fn sources_ready(&self, rs: &RS) -> bool {
        rs.source.iter()
            .flatten()
            .all(|&phys_reg| self.phys_reg_file.is_ready(phys_reg))
    }

    // Checks if there is an older instruction in the scheduling queue matching the predicate.
    fn has_older<F>(&self, seq: u64, predicate: F) -> bool
        where F: Fn(&RS) -> bool {
        self.rs_table.iter().any(|other| other.seq < seq && predicate(other))
    }

    // Moves instructions from the dispatch queue into the scheduling queue and the ROB,
    // renaming their registers. Dispatch stops at the first instruction that can't be placed.
    fn cycle_dispatch(&mut self) {
        let instr_queue_rc = Rc::clone(&self.instr_queue);
        let mut instr_queue = instr_queue_rc.borrow_mut();
        let perf_counters_rc = Rc::clone(&self.perf_counters);
        let mut perf_counters = perf_counters_rc.borrow_mut();

        let mut nop_cnt = 0;
        let mut dispatch_cnt = 0;
        while !instr_queue.is_empty() {
            let instr = *instr_queue.peek();

            if instr.is_nop() {
                // NOPs never enter the scheduling queue but they do take dispatch bandwidth.
                if nop_cnt >= self.dispatch_n_wide {
                    break;
                }
                instr_queue.dequeue();
                nop_cnt += 1;
                continue;
            }

            if dispatch_cnt >= self.dispatch_n_wide {
                break;
            }

            if !self.rob.has_space() {
                perf_counters.rob_stall_cnt += 1;
                break;
            }

            if !self.rs_table.has_free() {
                break;
            }

            if instr.sink.is_some() && !self.phys_reg_file.has_free() {
                if self.rob.is_empty() {
                    panic!("Rename deadlock: no free physical register while nothing is in flight; \
                            increase phys_reg_count");
                }

                perf_counters.phys_reg_stall_cnt += 1;
                break;
            }

            instr_queue.dequeue();

            // the sources need to be renamed before the sink; an instruction can read its own sink.
            let source = instr.source.map(|src| src.map(|arch_reg| self.rat.get(arch_reg)));

            let prev_phys_reg = instr.sink.map(|arch_reg| self.rat.get(arch_reg));
            let sink = match instr.sink {
                Some(arch_reg) => {
                    let phys_reg = self.phys_reg_file.allocate();
                    self.rat.set(arch_reg, phys_reg);
                    Some(phys_reg)
                }
                None => None,
            };

            let rob_slot_index = self.rob.allocate();
            let rob_slot = self.rob.get_mut(rob_slot_index);
            rob_slot.state = ROBSlotState::ISSUED;
            rob_slot.seq = instr.seq;
            rob_slot.pc = instr.pc;
            rob_slot.opcode = instr.opcode;
            rob_slot.sink = instr.sink;
            rob_slot.prev_phys_reg = prev_phys_reg;
            rob_slot.mispredict = instr.mispredict;
            rob_slot.branch_taken = instr.branch_taken;

            let rs_index = self.rs_table.allocate(instr.seq);
            let rs = self.rs_table.get_mut(rs_index);
            rs.opcode = instr.opcode;
            rs.eu_class = EUClass::of(instr.opcode);
            rs.source = source;
            rs.sink = sink;
            rs.latency = latency(instr.opcode, instr.cache_latency, &self.latencies);

            if self.trace.dispatch {
                info!("Dispatched [{}]", instr);
            }

            dispatch_cnt += 1;
            perf_counters.dispatch_cnt += 1;
        }
    }

    // Squashes everything that is in flight and restores the architectural mapping.
    pub(crate) fn flush(&mut self) {
        if self.trace.pipeline_flush {
            info!("Pipeline flush: squashing {} ROB entries, {} reservation stations, {} queued instructions",
                  self.rob.size(), self.rs_table.size(), self.instr_queue.borrow().size());
        }

        self.perf_counters.borrow_mut().pipeline_flushes += 1;
        self.instr_queue.borrow_mut().flush();
        self.rs_table.flush();
        self.rob.flush();
        self.rat.flush();
        self.phys_reg_file.flush();
        self.eu_table.flush();

        debug_assert!(self.rat.is_identity());
        debug_assert_eq!(self.phys_reg_file.free_cnt(), (self.phys_reg_file.count - ARCH_REG_CNT) as usize);
        debug_assert_eq!(self.eu_table.idle_cnt(), self.eu_table.capacity as usize);
    }

    // Verifies the consistency between the backend structures. Panics on the first violation.
    pub(crate) fn check_invariants(&self) {
        // the ROB is in program order.
        let rob_seqs: Vec<u64> = self.rob.iter().map(|slot| slot.seq).collect();
        for window in rob_seqs.windows(2) {
            assert!(window[0] < window[1], "ROB out of order: seq {} before seq {}", window[0], window[1]);
        }

        // every station has exactly one unretired ROB slot; the slot isn't executed yet.
        let mut rs_seqs = HashSet::new();
        for rs in self.rs_table.iter() {
            assert!(rs_seqs.insert(rs.seq), "Duplicate RS for seq {}", rs.seq);

            let slots: Vec<_> = self.rob.iter().filter(|slot| slot.seq == rs.seq).collect();
            assert_eq!(slots.len(), 1, "RS seq={} has {} ROB slots", rs.seq, slots.len());
            assert_eq!(slots[0].state, ROBSlotState::ISSUED, "RS seq={} has an executed ROB slot", rs.seq);
        }

        // a renaming register is free exactly when nothing refers to it anymore.
        let mut referenced = HashSet::new();
        referenced.extend(self.rat.table.iter().copied());
        referenced.extend(self.rob.iter().filter_map(|slot| slot.prev_phys_reg));
        referenced.extend(self.rs_table.iter().filter_map(|rs| rs.sink));
        for reg in 0..self.phys_reg_file.count {
            let entry = self.phys_reg_file.get(reg);
            if reg < ARCH_REG_CNT {
                assert!(!entry.free, "Architectural register {} is free", reg);
            } else {
                assert_eq!(entry.free, !referenced.contains(&reg),
                           "Phys register {} free={} but referenced={}", reg, entry.free, referenced.contains(&reg));
            }
        }

        // the busy units are exactly the ones held by a fired station.
        let mut held: Vec<u16> = Vec::new();
        for rs in self.rs_table.iter().filter(|rs| rs.is_fired()) {
            for &phys_reg in rs.source.iter().flatten() {
                assert!(self.phys_reg_file.is_ready(phys_reg), "RS seq={} fired before P{} was ready", rs.seq, phys_reg);
            }

            let holds_unit = !rs.eu_class.is_pipelined() || rs.progress == 1;
            if holds_unit {
                if let Some(eu_index) = rs.eu_index {
                    assert_eq!(self.eu_table.get(eu_index).class, rs.eu_class);
                    held.push(eu_index);
                }
            }
        }
        held.sort();
        for window in held.windows(2) {
            assert!(window[0] != window[1], "EU {} is held by multiple stations", window[0]);
        }
        for eu_index in 0..self.eu_table.capacity {
            let busy = self.eu_table.get(eu_index).state == EUState::BUSY;
            let is_held = held.contains(&eu_index);
            assert_eq!(busy, is_held, "EU {} busy={} but held={}", eu_index, busy, is_held);
        }
    }
}
