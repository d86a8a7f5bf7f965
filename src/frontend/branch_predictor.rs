use std::str::FromStr;

/// Predicts the direction of conditional branches. Predictions are made at fetch, training
/// happens when the branch retires.
pub(crate) trait BranchPredictor {
    fn predict(&mut self, pc: u64, seq: u64) -> bool;

    fn update(&mut self, pc: u64, taken: bool, seq: u64);
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum PredictorKind {
    AlwaysTaken,
    GSelect,
}

impl FromStr for PredictorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "always-taken" => Ok(PredictorKind::AlwaysTaken),
            "gselect" => Ok(PredictorKind::GSelect),
            _ => Err(format!("Unknown predictor '{}'; expected always-taken or gselect", s)),
        }
    }
}

pub(crate) struct AlwaysTaken {
    pub(crate) update_cnt: u64,
}

impl AlwaysTaken {
    pub(crate) fn new() -> Self {
        Self { update_cnt: 0 }
    }
}

impl BranchPredictor for AlwaysTaken {
    fn predict(&mut self, _pc: u64, _seq: u64) -> bool {
        true
    }

    fn update(&mut self, _pc: u64, _taken: bool, _seq: u64) {
        self.update_cnt += 1;
    }
}

const WEAKLY_NOT_TAKEN: u8 = 1;
const COUNTER_MAX: u8 = 3;

/// A gselect predictor: the low pc_bits of the (word aligned) pc select a row of
/// 2^history_bits two bit saturating counters, the global history selects the counter.
pub(crate) struct GSelect {
    pc_bits: u8,
    history_bits: u8,
    // the outcomes of the most recently retired branches; the youngest in bit 0.
    history: u64,
    counters: Vec<u8>,
}

impl GSelect {
    pub(crate) fn new(pc_bits: u8, history_bits: u8) -> Self {
        assert!(pc_bits as u32 + history_bits as u32 <= 24, "GSelect: table of 2^{} counters is too large",
                pc_bits as u32 + history_bits as u32);

        Self {
            pc_bits,
            history_bits,
            history: 0,
            counters: vec![WEAKLY_NOT_TAKEN; 1 << (pc_bits + history_bits)],
        }
    }

    fn mask(bits: u8) -> u64 {
        (1u64 << bits) - 1
    }

    fn index(&self, pc: u64) -> usize {
        let row = (pc >> 2) & Self::mask(self.pc_bits);
        let column = self.history & Self::mask(self.history_bits);
        ((row << self.history_bits) | column) as usize
    }
}

impl BranchPredictor for GSelect {
    fn predict(&mut self, pc: u64, _seq: u64) -> bool {
        self.counters[self.index(pc)] > WEAKLY_NOT_TAKEN
    }

    fn update(&mut self, pc: u64, taken: bool, _seq: u64) {
        let index = self.index(pc);
        let counter = &mut self.counters[index];
        if taken {
            if *counter < COUNTER_MAX {
                *counter += 1;
            }
        } else if *counter > 0 {
            *counter -= 1;
        }

        self.history = ((self.history << 1) | taken as u64) & Self::mask(self.history_bits);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_always_taken() {
        let mut predictor = AlwaysTaken::new();
        assert!(predictor.predict(0x40, 1));
        predictor.update(0x40, false, 1);
        assert!(predictor.predict(0x40, 2));
        assert_eq!(predictor.update_cnt, 1);
    }

    #[test]
    fn test_gselect_starts_not_taken() {
        let mut predictor = GSelect::new(4, 4);
        assert!(!predictor.predict(0x40, 1));
    }

    #[test]
    fn test_gselect_learns_taken() {
        // without history every update trains the same counter.
        let mut predictor = GSelect::new(4, 0);
        predictor.update(0x40, true, 1);
        assert!(predictor.predict(0x40, 2));

        predictor.update(0x40, true, 2);
        predictor.update(0x40, false, 3);
        // strongly taken minus one is still taken.
        assert!(predictor.predict(0x40, 4));

        predictor.update(0x40, false, 4);
        assert!(!predictor.predict(0x40, 5));
    }

    #[test]
    fn test_gselect_rows_are_independent() {
        let mut predictor = GSelect::new(4, 0);
        predictor.update(0x40, true, 1);
        assert!(predictor.predict(0x40, 2));
        assert!(!predictor.predict(0x44, 2));
    }

    #[test]
    fn test_gselect_uses_history() {
        let mut predictor = GSelect::new(0, 1);
        // history 0 -> train taken; afterwards the history is 1.
        predictor.update(0x40, true, 1);
        // history 1 hasn't been trained.
        assert!(!predictor.predict(0x40, 2));

        // history 1 -> train not taken; history becomes 0 again.
        predictor.update(0x40, false, 2);
        assert!(predictor.predict(0x40, 3));
    }

    #[test]
    fn test_predictor_kind() {
        assert_eq!("gselect".parse::<PredictorKind>(), Ok(PredictorKind::GSelect));
        assert_eq!("Always-Taken".parse::<PredictorKind>(), Ok(PredictorKind::AlwaysTaken));
        assert!("tage".parse::<PredictorKind>().is_err());
    }
}
