use std::cell::RefCell;
use std::rc::Rc;

use log::info;

use crate::cpu::{CPUConfig, PerfCounters, Trace};
use crate::frontend::trace_source::{FetchResult, TraceSource};
use crate::instructions::instructions::{InstrQueue, NOP};

pub(crate) struct Frontend {
    instr_queue: Rc<RefCell<InstrQueue>>,
    source: Box<dyn TraceSource>,
    n_wide: u8,
    trace: Trace,
    // the source has run out of instructions; nothing will be fetched anymore.
    pub(crate) end_of_trace: bool,
    perf_counters: Rc<RefCell<PerfCounters>>,
}

impl Frontend {
    pub(crate) fn new(cpu_config: &CPUConfig,
                      instr_queue: Rc<RefCell<InstrQueue>>,
                      source: Box<dyn TraceSource>,
                      perf_counters: Rc<RefCell<PerfCounters>>,
    ) -> Frontend {
        Frontend {
            instr_queue,
            source,
            n_wide: cpu_config.fetch_n_wide,
            trace: cpu_config.trace.clone(),
            end_of_trace: false,
            perf_counters,
        }
    }

    // Fetches up to n_wide instructions into the dispatch queue.
    pub(crate) fn do_cycle(&mut self) {
        if self.end_of_trace {
            return;
        }

        let mut instr_queue = self.instr_queue.borrow_mut();
        let mut perf_counters = self.perf_counters.borrow_mut();

        for _ in 0..self.n_wide {
            match self.source.read_instr() {
                FetchResult::Ok(instr) => {
                    if self.trace.fetch {
                        info!("Fetched [{}]", instr);
                    }

                    perf_counters.fetch_cnt += 1;
                    instr_queue.enqueue(instr);
                }
                FetchResult::ICacheMiss => {
                    // the slot is filled with a NOP; dispatch drops it.
                    if self.trace.fetch {
                        info!("Fetch: icache miss");
                    }
                    instr_queue.enqueue(NOP);
                }
                FetchResult::MispredictBubble => {
                    // wrong path; the slot is consumed without delivering an instruction.
                    perf_counters.fetch_cnt += 1;
                }
                FetchResult::EndOfTrace => {
                    if self.trace.fetch {
                        info!("Fetch: end of trace");
                    }
                    self.end_of_trace = true;
                    break;
                }
            }
        }
    }

    // A mispredicted branch retired; fetch continues on the correct path from the next cycle.
    pub(crate) fn redirect(&mut self) {
        self.source.on_mispredict_retired();
    }
}
