use std::cell::RefCell;
use std::rc::Rc;

use crate::frontend::branch_predictor::BranchPredictor;
use crate::instructions::instructions::{Instr, Program};

/// The result of a single fetch from a trace source.
#[derive(Debug, Clone, Copy)]
pub(crate) enum FetchResult {
    Ok(Instr),
    // the instruction isn't available this slot; the frontend inserts a NOP.
    ICacheMiss,
    // the source is on the wrong path of a mispredicted branch.
    MispredictBubble,
    EndOfTrace,
}

/// A stream of decoded instructions in program order.
pub(crate) trait TraceSource {
    fn read_instr(&mut self) -> FetchResult;

    // The mispredicted branch has retired; the source continues on the correct path.
    fn on_mispredict_retired(&mut self);
}

/// Hands out the records of a loaded trace. Sequence numbers are assigned as the instructions
/// are handed out, branches are predicted on the way.
pub(crate) struct TraceDriver {
    program: Rc<Program>,
    predictor: Rc<RefCell<dyn BranchPredictor>>,
    pos: usize,
    next_seq: u64,
    // the icache misses already reported for the record at pos.
    icache_miss_cnt: u32,
    wrong_path: bool,
}

impl TraceDriver {
    pub(crate) fn new(program: Rc<Program>, predictor: Rc<RefCell<dyn BranchPredictor>>) -> TraceDriver {
        TraceDriver {
            program,
            predictor,
            pos: 0,
            next_seq: 1,
            icache_miss_cnt: 0,
            wrong_path: false,
        }
    }
}

impl TraceSource for TraceDriver {
    fn read_instr(&mut self) -> FetchResult {
        if self.wrong_path {
            return FetchResult::MispredictBubble;
        }

        if self.pos == self.program.len() {
            return FetchResult::EndOfTrace;
        }

        let record = self.program.get_record(self.pos);
        if self.icache_miss_cnt < record.icache_misses {
            self.icache_miss_cnt += 1;
            return FetchResult::ICacheMiss;
        }

        let mut instr = record.instr;
        self.pos += 1;
        self.icache_miss_cnt = 0;

        instr.seq = self.next_seq;
        self.next_seq += 1;

        if instr.is_branch() {
            let predicted_taken = self.predictor.borrow_mut().predict(instr.pc, instr.seq);
            instr.mispredict = predicted_taken != instr.branch_taken;
            self.wrong_path = instr.mispredict;
        }

        FetchResult::Ok(instr)
    }

    fn on_mispredict_retired(&mut self) {
        self.wrong_path = false;
    }
}

/// A source that replays a fixed script of fetch results; once the script runs out it
/// reports the end of the trace.
#[cfg(test)]
pub(crate) struct ScriptedSource {
    script: std::collections::VecDeque<FetchResult>,
    pub(crate) redirect_cnt: u32,
}

#[cfg(test)]
impl ScriptedSource {
    pub(crate) fn new(script: Vec<FetchResult>) -> ScriptedSource {
        ScriptedSource { script: script.into(), redirect_cnt: 0 }
    }

    // A script of independent ADDs with the given sequence numbers.
    pub(crate) fn adds(seqs: std::ops::RangeInclusive<u64>) -> Vec<FetchResult> {
        seqs.map(|seq| {
            let mut instr = crate::instructions::instructions::NOP;
            instr.opcode = crate::instructions::instructions::Opcode::ADD;
            instr.seq = seq;
            instr.pc = 0x1000 + seq * 4;
            instr.sink = Some(1 + (seq % 31) as u16);
            FetchResult::Ok(instr)
        }).collect()
    }
}

#[cfg(test)]
impl TraceSource for ScriptedSource {
    fn read_instr(&mut self) -> FetchResult {
        self.script.pop_front().unwrap_or(FetchResult::EndOfTrace)
    }

    fn on_mispredict_retired(&mut self) {
        self.redirect_cnt += 1;
    }
}
