use std::cell::RefCell;
use std::error::Error;
use std::fmt;
use std::fs::File;
use std::rc::Rc;

use log::{info, warn};
use serde::Deserialize;

use crate::backend::backend::{Backend, CycleOutcome};
use crate::frontend::branch_predictor::BranchPredictor;
use crate::frontend::frontend::Frontend;
use crate::frontend::trace_source::TraceSource;
use crate::instructions::instructions::{ARCH_REG_CNT, InstrQueue};

#[derive(Default, Debug, Clone)]
pub(crate) struct PerfCounters {
    pub cycle_cnt: u64,
    pub fetch_cnt: u64,
    pub dispatch_cnt: u64,
    pub fire_cnt: u64,
    pub execute_cnt: u64,
    pub retired_cnt: u64,
    pub branch_misprediction_cnt: u64,
    pub pipeline_flushes: u64,
    // cycles in which dispatch stalled because the ROB was full.
    pub rob_stall_cnt: u64,
    // cycles in which dispatch stalled because no physical register was free.
    pub phys_reg_stall_cnt: u64,
    // cycles in which the scheduler didn't fire a single instruction.
    pub no_fire_cnt: u64,
    pub dispatch_queue_max: u64,
    pub dispatch_queue_sum: u64,
    pub sched_queue_max: u64,
    pub sched_queue_sum: u64,
    pub rob_max: u64,
    pub rob_sum: u64,
}

impl PerfCounters {
    pub fn new() -> Self {
        Self::default()
    }

    // Records the queue occupancy at the end of a cycle.
    pub fn sample(&mut self, dispatch_queue: usize, sched_queue: usize, rob: usize) {
        let (dispatch_queue, sched_queue, rob) = (dispatch_queue as u64, sched_queue as u64, rob as u64);

        self.dispatch_queue_max = self.dispatch_queue_max.max(dispatch_queue);
        self.dispatch_queue_sum += dispatch_queue;
        self.sched_queue_max = self.sched_queue_max.max(sched_queue);
        self.sched_queue_sum += sched_queue;
        self.rob_max = self.rob_max.max(rob);
        self.rob_sum += rob;
    }

    // Derives the averages from the accumulated counters.
    pub fn report(&self) -> Report {
        let per_cycle = |value: u64| {
            if self.cycle_cnt == 0 {
                0.0
            } else {
                value as f64 / self.cycle_cnt as f64
            }
        };

        Report {
            dispatch_queue_avg: per_cycle(self.dispatch_queue_sum),
            sched_queue_avg: per_cycle(self.sched_queue_sum),
            rob_avg: per_cycle(self.rob_sum),
            ipc: per_cycle(self.retired_cnt),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Report {
    pub dispatch_queue_avg: f64,
    pub sched_queue_avg: f64,
    pub rob_avg: f64,
    pub ipc: f64,
}

impl fmt::Display for PerfCounters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let report = self.report();
        writeln!(f, "Processor stats:")?;
        writeln!(f, "Total instructions fetched:      {}", self.fetch_cnt)?;
        writeln!(f, "Total instructions retired:      {}", self.retired_cnt)?;
        writeln!(f, "Total branch mispredictions:     {}", self.branch_misprediction_cnt)?;
        writeln!(f, "Total run time (cycles):         {}", self.cycle_cnt)?;
        writeln!(f, "Cycles with no fires:            {}", self.no_fire_cnt)?;
        writeln!(f, "No dispatch cycles due to ROB:   {}", self.rob_stall_cnt)?;
        writeln!(f, "No dispatch cycles due to PRegs: {}", self.phys_reg_stall_cnt)?;
        writeln!(f, "Max dispatch queue usage:        {}", self.dispatch_queue_max)?;
        writeln!(f, "Average dispatch queue usage:    {:.6}", report.dispatch_queue_avg)?;
        writeln!(f, "Max sched queue usage:           {}", self.sched_queue_max)?;
        writeln!(f, "Average sched queue usage:       {:.6}", report.sched_queue_avg)?;
        writeln!(f, "Max ROB usage:                   {}", self.rob_max)?;
        writeln!(f, "Average ROB usage:               {:.6}", report.rob_avg)?;
        write!(f, "Average IPC:                     {:.6}", report.ipc)
    }
}

#[derive(Clone, Deserialize, Debug, Default)]
#[serde(default)]
pub(crate) struct Trace {
    pub fetch: bool,
    pub dispatch: bool,
    pub schedule: bool,
    pub execute: bool,
    pub retire: bool,
    pub pipeline_flush: bool,
    pub cycle: bool,
}

// The number of cycles an instruction spends in its execution unit.
#[derive(Clone, Deserialize, Debug)]
#[serde(default)]
pub(crate) struct Latencies {
    pub alu: u32,
    pub mul: u32,
    pub store: u32,
    pub l1_hit: u32,
    pub l2_hit: u32,
    pub l2_miss: u32,
}

impl Default for Latencies {
    fn default() -> Self {
        Self { alu: 1, mul: 3, store: 1, l1_hit: 2, l2_hit: 10, l2_miss: 100 }
    }
}

#[derive(Clone, Deserialize, Debug)]
#[serde(default)]
pub(crate) struct CPUConfig {
    // the number of instructions the frontend can fetch per clock cycle.
    pub(crate) fetch_n_wide: u8,
    // the number of instructions that can be dispatched into the scheduling queue per clock cycle.
    pub(crate) dispatch_n_wide: u8,
    // the number of physical registers on top of the architectural registers.
    pub(crate) phys_reg_count: u16,
    // the number of execution units per class
    pub(crate) alu_count: u16,
    pub(crate) mul_count: u16,
    pub(crate) lsu_count: u16,
    // the number of reservation stations per execution unit
    pub(crate) rs_per_fu: u16,
    // the capacity of the reorder buffer
    pub(crate) rob_capacity: u16,
    pub(crate) latency: Latencies,
    // if processing of a single instruction should be traced (logged)
    pub(crate) trace: Trace,
}

impl Default for CPUConfig {
    fn default() -> Self {
        Self {
            fetch_n_wide: 4,
            dispatch_n_wide: 4,
            phys_reg_count: 64,
            alu_count: 2,
            mul_count: 1,
            lsu_count: 2,
            rs_per_fu: 4,
            rob_capacity: 96,
            latency: Latencies::default(),
            trace: Trace::default(),
        }
    }
}

impl CPUConfig {
    pub(crate) fn eu_count(&self) -> u16 {
        self.alu_count + self.mul_count + self.lsu_count
    }

    // The capacity of the scheduling queue.
    pub(crate) fn rs_count(&self) -> u16 {
        self.eu_count() * self.rs_per_fu
    }

    pub(crate) fn validate(&self) -> Result<(), String> {
        let mut errors = Vec::new();

        let counts = [
            ("fetch_n_wide", self.fetch_n_wide as u32),
            ("dispatch_n_wide", self.dispatch_n_wide as u32),
            ("phys_reg_count", self.phys_reg_count as u32),
            ("alu_count", self.alu_count as u32),
            ("mul_count", self.mul_count as u32),
            ("lsu_count", self.lsu_count as u32),
            ("rs_per_fu", self.rs_per_fu as u32),
            ("rob_capacity", self.rob_capacity as u32),
            ("latency.alu", self.latency.alu),
            ("latency.mul", self.latency.mul),
            ("latency.store", self.latency.store),
            ("latency.l1_hit", self.latency.l1_hit),
            ("latency.l2_hit", self.latency.l2_hit),
            ("latency.l2_miss", self.latency.l2_miss),
        ];
        for (name, value) in counts {
            if value == 0 {
                errors.push(format!("{} must be larger than 0", name));
            }
        }

        if (ARCH_REG_CNT as u32 + self.phys_reg_count as u32) > u16::MAX as u32 {
            errors.push(format!("phys_reg_count {} is too large", self.phys_reg_count));
        }

        let eu_count = self.alu_count as u32 + self.mul_count as u32 + self.lsu_count as u32;
        if eu_count * self.rs_per_fu as u32 > u16::MAX as u32 {
            errors.push(String::from("the scheduling queue is too large"));
        }

        if !errors.is_empty() {
            return Err(errors.join("; "));
        }

        // R0 is never written, so that leaves ARCH_REG_CNT - 1 registers that can be renamed.
        if self.phys_reg_count < ARCH_REG_CNT - 1 {
            warn!("phys_reg_count {} is smaller than the {} writable architectural registers; rename can starve",
                  self.phys_reg_count, ARCH_REG_CNT - 1);
        }

        Ok(())
    }
}

pub fn load_cpu_config(file_path: &str) -> Result<CPUConfig, Box<dyn Error>> {
    let file = File::open(file_path)?;
    let config = serde_yaml::from_reader(file)?;
    Ok(config)
}

pub(crate) struct CPU {
    pub(crate) backend: Backend,
    pub(crate) frontend: Frontend,
    pub(crate) instr_queue: Rc<RefCell<InstrQueue>>,
    trace: Trace,
    pub(crate) perf_counters: Rc<RefCell<PerfCounters>>,
}

impl CPU {
    pub(crate) fn new(cpu_config: &CPUConfig,
                      source: Box<dyn TraceSource>,
                      predictor: Rc<RefCell<dyn BranchPredictor>>) -> CPU {
        let instr_queue = Rc::new(RefCell::new(InstrQueue::new()));

        let perf_counters = Rc::new(RefCell::new(PerfCounters::new()));

        let backend = Backend::new(
            cpu_config,
            Rc::clone(&instr_queue),
            predictor,
            Rc::clone(&perf_counters),
        );

        let frontend = Frontend::new(
            cpu_config,
            Rc::clone(&instr_queue),
            source,
            Rc::clone(&perf_counters),
        );

        CPU {
            backend,
            frontend,
            instr_queue,
            trace: cpu_config.trace.clone(),
            perf_counters,
        }
    }

    // The run is complete when the trace is exhausted and nothing is in flight anymore.
    pub(crate) fn is_done(&self) -> bool {
        self.frontend.end_of_trace && self.instr_queue.borrow().is_empty() && self.backend.is_idle()
    }

    pub(crate) fn run(&mut self) {
        while !self.is_done() {
            self.do_cycle();
        }

        info!("Program complete!");
    }

    // Runs a single clock cycle. The stages run in reverse pipeline order so that each
    // stage sees the state the downstream stages had at the end of the previous cycle.
    pub(crate) fn do_cycle(&mut self) -> CycleOutcome {
        let outcome = self.backend.do_cycle();

        if outcome.retired_mispredict {
            // the rest of the pipeline was flushed; fetch resumes on the correct path next cycle.
            self.frontend.redirect();
        } else {
            self.frontend.do_cycle();
        }

        if cfg!(debug_assertions) {
            self.backend.check_invariants();
        }

        let mut perf_counters = self.perf_counters.borrow_mut();
        perf_counters.cycle_cnt += 1;
        perf_counters.sample(
            self.instr_queue.borrow().size(),
            self.backend.rs_table.size(),
            self.backend.rob.size() as usize,
        );

        if self.trace.cycle {
            info!("[Cycles:{}][Fetched={}][Dispatched={}][Fired={}][Executed={}][Retired={}][IPC={:.2}]",
                  perf_counters.cycle_cnt,
                  perf_counters.fetch_cnt,
                  perf_counters.dispatch_cnt,
                  perf_counters.fire_cnt,
                  perf_counters.execute_cnt,
                  perf_counters.retired_cnt,
                  perf_counters.report().ipc
            );
        }

        outcome
    }
}
