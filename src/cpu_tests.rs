#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::rc::Rc;

    use crate::backend::backend::CycleOutcome;
    use crate::backend::execution_unit::EUState;
    use crate::cpu::{CPU, CPUConfig};
    use crate::frontend::branch_predictor::{AlwaysTaken, GSelect};
    use crate::frontend::trace_source::{FetchResult, ScriptedSource, TraceDriver};
    use crate::instructions::instructions::{ARCH_REG_CNT, CacheLatency, Instr, Opcode, RegisterType};
    use crate::loader::loader::load_from_string;

    const MAX_CYCLES: u64 = 100_000;

    struct TestHarness {
        cpu: CPU,
        cpu_config: CPUConfig,
        cycle: u64,
        // the cycle in which each instruction fired.
        fire_cycles: HashMap<u64, u64>,
    }

    impl TestHarness {
        fn new(cpu_config: CPUConfig, script: Vec<FetchResult>) -> TestHarness {
            let _ = env_logger::builder().is_test(true).try_init();
            let cpu = CPU::new(
                &cpu_config,
                Box::new(ScriptedSource::new(script)),
                Rc::new(RefCell::new(AlwaysTaken::new())),
            );
            TestHarness { cpu, cpu_config, cycle: 0, fire_cycles: HashMap::new() }
        }

        fn from_trace(cpu_config: CPUConfig, src: &str) -> TestHarness {
            let _ = env_logger::builder().is_test(true).try_init();
            let program = match load_from_string(src.to_string()) {
                Ok(program) => Rc::new(program),
                Err(err) => panic!("Loading failed: {}", err),
            };

            let predictor = Rc::new(RefCell::new(GSelect::new(4, 4)));
            let driver = TraceDriver::new(program, predictor.clone());
            let cpu = CPU::new(&cpu_config, Box::new(driver), predictor);
            TestHarness { cpu, cpu_config, cycle: 0, fire_cycles: HashMap::new() }
        }

        fn small_cpu_config() -> CPUConfig {
            let mut cpu_config = CPUConfig::default();
            cpu_config.fetch_n_wide = 2;
            cpu_config.dispatch_n_wide = 2;
            cpu_config.alu_count = 1;
            cpu_config.mul_count = 1;
            cpu_config.lsu_count = 1;
            cpu_config.rs_per_fu = 4;
            cpu_config.phys_reg_count = 8;
            cpu_config.rob_capacity = 40;
            cpu_config
        }

        fn step(&mut self) -> CycleOutcome {
            let outcome = self.cpu.do_cycle();
            self.cycle += 1;

            // CPU::do_cycle already checks in debug builds; make sure the tests always do.
            self.cpu.backend.check_invariants();

            for rs in self.cpu.backend.rs_table.iter().filter(|rs| rs.is_fired()) {
                self.fire_cycles.entry(rs.seq).or_insert(self.cycle);
            }

            outcome
        }

        fn run(&mut self) {
            while !self.cpu.is_done() {
                self.step();
                assert!(self.cycle < MAX_CYCLES, "The run didn't complete within {} cycles", MAX_CYCLES);
            }

            self.assert_throughput_bound();
        }

        fn fire_cycle(&self, seq: u64) -> u64 {
            match self.fire_cycles.get(&seq) {
                Some(cycle) => *cycle,
                None => panic!("seq {} never fired", seq),
            }
        }

        fn assert_throughput_bound(&self) {
            let perf_counters = self.cpu.perf_counters.borrow();
            let bound = (self.cpu_config.fetch_n_wide as u64)
                .min(self.cpu_config.dispatch_n_wide as u64)
                .min(self.cpu_config.eu_count() as u64);
            assert!(perf_counters.retired_cnt <= bound * perf_counters.cycle_cnt,
                    "IPC {} exceeds {}", perf_counters.report().ipc, bound);
        }

        // After a regular run the RAT still points to renaming registers; only the queues are empty.
        fn assert_drained(&self) {
            assert!(self.cpu.instr_queue.borrow().is_empty());
            assert!(self.cpu.backend.is_idle());
            assert_eq!(self.cpu.backend.eu_table.idle_cnt(), self.cpu_config.eu_count() as usize);
        }

        // The state right after a flush.
        fn assert_pipeline_empty(&self) {
            let backend = &self.cpu.backend;
            assert!(self.cpu.instr_queue.borrow().is_empty());
            assert!(backend.rs_table.is_empty());
            assert!(backend.rob.is_empty());
            assert!(backend.rat.is_identity());

            for reg in 0..backend.phys_reg_file.count {
                let entry = backend.phys_reg_file.get(reg);
                if reg < ARCH_REG_CNT {
                    assert!(entry.ready && !entry.free, "arch register {} is {:?}", reg, entry);
                } else {
                    assert!(!entry.ready && entry.free, "phys register {} is {:?}", reg, entry);
                }
            }

            for eu_index in 0..backend.eu_table.capacity {
                assert_eq!(backend.eu_table.get(eu_index).state, EUState::IDLE);
            }
        }
    }

    fn instr(seq: u64, opcode: Opcode, sink: Option<RegisterType>, source: [Option<RegisterType>; 2]) -> FetchResult {
        FetchResult::Ok(Instr {
            seq,
            pc: 0x1000 + seq * 4,
            opcode,
            source,
            sink,
            cache_latency: CacheLatency::L1Hit,
            branch_taken: false,
            mispredict: false,
            loc: None,
        })
    }

    fn load(seq: u64, sink: RegisterType, cache_latency: CacheLatency) -> FetchResult {
        match instr(seq, Opcode::LOAD, Some(sink), [Some(30), None]) {
            FetchResult::Ok(mut instr) => {
                instr.cache_latency = cache_latency;
                FetchResult::Ok(instr)
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_single_add() {
        let script = vec![instr(1, Opcode::ADD, Some(1), [Some(2), Some(3)])];
        let mut harness = TestHarness::new(TestHarness::small_cpu_config(), script);
        harness.run();

        // fetch, dispatch, fire, complete, retire.
        assert_eq!(harness.cycle, 5);
        assert_eq!(harness.fire_cycle(1), 3);

        let perf_counters = harness.cpu.perf_counters.borrow();
        assert_eq!(perf_counters.fetch_cnt, 1);
        assert_eq!(perf_counters.retired_cnt, 1);
        assert_eq!(perf_counters.cycle_cnt, 5);
    }

    #[test]
    fn test_mul_waits_for_add() {
        let script = vec![
            instr(1, Opcode::ADD, Some(1), [Some(2), Some(3)]),
            instr(2, Opcode::MUL, Some(4), [Some(1), Some(1)]),
        ];
        let mut harness = TestHarness::new(TestHarness::small_cpu_config(), script);

        harness.step();
        assert_eq!(harness.cpu.instr_queue.borrow().size(), 2);

        harness.run();

        let add_fire = harness.fire_cycle(1);
        let mul_fire = harness.fire_cycle(2);
        // the ADD completes one cycle after it fired; the MUL can fire in that same cycle.
        let add_completion = add_fire + harness.cpu_config.latency.alu as u64;
        assert!(mul_fire >= add_completion);
        assert!(mul_fire > add_fire);

        let perf_counters = harness.cpu.perf_counters.borrow();
        assert_eq!(perf_counters.retired_cnt, 2);
        assert_eq!(perf_counters.branch_misprediction_cnt, 0);
        drop(perf_counters);
        harness.assert_drained();
    }

    #[test]
    fn test_retire_in_program_order() {
        let script = vec![
            load(1, 1, CacheLatency::L2Miss),
            instr(2, Opcode::ADD, Some(2), [Some(3), None]),
        ];
        let mut harness = TestHarness::new(TestHarness::small_cpu_config(), script);

        // the ADD completes long before the load.
        for _ in 0..10 {
            let outcome = harness.step();
            assert_eq!(outcome.retired, 0);
        }

        let executed: Vec<u64> = harness.cpu.backend.rob.iter()
            .filter(|slot| slot.state == crate::backend::reorder_buffer::ROBSlotState::EXECUTED)
            .map(|slot| slot.seq)
            .collect();
        assert_eq!(executed, vec![2]);

        harness.run();
        assert_eq!(harness.cpu.perf_counters.borrow().retired_cnt, 2);
    }

    #[test]
    fn test_mispredict_flushes_pipeline() {
        let mut branch = match instr(10, Opcode::BRANCH, None, [Some(1), None]) {
            FetchResult::Ok(instr) => instr,
            _ => unreachable!(),
        };
        branch.mispredict = true;

        let mut script = vec![FetchResult::Ok(branch)];
        for seq in 11..=15 {
            script.push(instr(seq, Opcode::ADD, Some(seq as RegisterType - 10), [Some(20), None]));
        }

        let mut harness = TestHarness::new(TestHarness::small_cpu_config(), script);

        let mut outcome = harness.step();
        while !outcome.retired_mispredict {
            assert!(harness.cycle < 20, "the branch didn't retire");
            outcome = harness.step();
        }

        assert_eq!(outcome, CycleOutcome { retired: 1, retired_mispredict: true });
        harness.assert_pipeline_empty();

        let perf_counters = harness.cpu.perf_counters.borrow();
        assert_eq!(perf_counters.branch_misprediction_cnt, 1);
        assert_eq!(perf_counters.retired_cnt, 1);
        assert_eq!(perf_counters.pipeline_flushes, 1);
        drop(perf_counters);

        // the squashed instructions are gone; the run ends.
        harness.run();
        assert_eq!(harness.cpu.perf_counters.borrow().retired_cnt, 1);
    }

    #[test]
    fn test_flush_releases_busy_units() {
        let mut branch = match instr(1, Opcode::BRANCH, None, [None, None]) {
            FetchResult::Ok(instr) => instr,
            _ => unreachable!(),
        };
        branch.mispredict = true;

        // the L2 miss keeps the load/store unit busy when the branch retires.
        let script = vec![FetchResult::Ok(branch), load(2, 1, CacheLatency::L2Miss)];
        let mut harness = TestHarness::new(TestHarness::small_cpu_config(), script);

        let mut outcome = harness.step();
        while !outcome.retired_mispredict {
            outcome = harness.step();
        }

        assert!(harness.fire_cycles.contains_key(&2));
        harness.assert_pipeline_empty();
    }

    #[test]
    fn test_load_waits_for_older_store() {
        let script = vec![
            instr(1, Opcode::MUL, Some(1), [Some(2), Some(3)]),
            instr(2, Opcode::STORE, None, [Some(1), Some(4)]),
            load(3, 5, CacheLatency::L1Hit),
        ];
        let mut harness = TestHarness::new(CPUConfig::default(), script);
        harness.run();

        assert!(harness.fire_cycle(2) > harness.fire_cycle(1));
        assert!(harness.fire_cycle(3) > harness.fire_cycle(2));
    }

    #[test]
    fn test_store_waits_for_older_load() {
        let script = vec![
            load(1, 1, CacheLatency::L2Hit),
            instr(2, Opcode::STORE, None, [Some(2), Some(3)]),
        ];
        let mut harness = TestHarness::new(CPUConfig::default(), script);
        harness.run();

        let load_completion = harness.fire_cycle(1) + harness.cpu_config.latency.l2_hit as u64;
        assert!(harness.fire_cycle(2) >= load_completion);
    }

    #[test]
    fn test_one_store_per_cycle() {
        let script: Vec<FetchResult> = (1..=6)
            .map(|seq| instr(seq, Opcode::STORE, None, [Some(1), Some(2)]))
            .collect();
        let mut cpu_config = CPUConfig::default();
        cpu_config.lsu_count = 4;
        let mut harness = TestHarness::new(cpu_config, script);
        harness.run();

        let mut fire_cycles: Vec<u64> = (1..=6).map(|seq| harness.fire_cycle(seq)).collect();
        let in_order = fire_cycles.clone();
        fire_cycles.dedup();
        assert_eq!(fire_cycles.len(), 6, "stores fired in the same cycle: {:?}", in_order);
        assert!(in_order.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_icache_misses_dont_occupy_the_backend() {
        let mut script = vec![FetchResult::ICacheMiss; 7];
        script.push(instr(1, Opcode::ADD, Some(1), [None, None]));
        let mut harness = TestHarness::new(TestHarness::small_cpu_config(), script);

        while harness.cpu.perf_counters.borrow().fetch_cnt == 0 {
            harness.step();
            assert_eq!(harness.cpu.backend.rob.size(), 0);
            assert_eq!(harness.cpu.backend.rs_table.size(), 0);
        }

        harness.run();
        let perf_counters = harness.cpu.perf_counters.borrow();
        assert_eq!(perf_counters.fetch_cnt, 1);
        assert_eq!(perf_counters.retired_cnt, 1);
        assert_eq!(perf_counters.rob_max, 1);
    }

    #[test]
    fn test_rob_stall_is_counted() {
        let mut cpu_config = TestHarness::small_cpu_config();
        cpu_config.rob_capacity = 2;

        let mut script = vec![load(1, 1, CacheLatency::L2Hit)];
        for seq in 2..=5 {
            script.push(instr(seq, Opcode::ADD, Some(seq as RegisterType), [None, None]));
        }
        let mut harness = TestHarness::new(cpu_config, script);
        harness.run();

        let perf_counters = harness.cpu.perf_counters.borrow();
        assert!(perf_counters.rob_stall_cnt > 0);
        assert_eq!(perf_counters.rob_max, 2);
        assert_eq!(perf_counters.retired_cnt, 5);
    }

    #[test]
    fn test_phys_reg_stall_is_counted() {
        let mut cpu_config = TestHarness::small_cpu_config();
        cpu_config.phys_reg_count = 2;

        // a chain on R1: every retirement releases the previous mapping of R1.
        let script: Vec<FetchResult> = (1..=6)
            .map(|seq| instr(seq, Opcode::ADD, Some(1), [Some(1), None]))
            .collect();
        let mut harness = TestHarness::new(cpu_config, script);
        harness.run();

        let perf_counters = harness.cpu.perf_counters.borrow();
        assert!(perf_counters.phys_reg_stall_cnt > 0);
        assert_eq!(perf_counters.rob_stall_cnt, 0);
        assert_eq!(perf_counters.retired_cnt, 6);
    }

    #[test]
    #[should_panic(expected = "Rename deadlock")]
    fn test_rename_deadlock() {
        let mut cpu_config = TestHarness::small_cpu_config();
        cpu_config.phys_reg_count = 1;

        // the previous mapping of R1 is the architectural register; nothing is ever released.
        let script = vec![
            instr(1, Opcode::ADD, Some(1), [None, None]),
            instr(2, Opcode::ADD, Some(2), [None, None]),
        ];
        let mut harness = TestHarness::new(cpu_config, script);
        harness.run();
    }

    #[test]
    fn test_nop_bandwidth() {
        let mut cpu_config = TestHarness::small_cpu_config();
        cpu_config.fetch_n_wide = 4;

        let mut script = vec![FetchResult::ICacheMiss; 4];
        script.push(instr(1, Opcode::ADD, Some(1), [None, None]));
        let mut harness = TestHarness::new(cpu_config, script);

        // cycle 1 fetches 4 NOPs; cycle 2 drops 2 of them and fetches the ADD.
        harness.step();
        harness.step();
        assert_eq!(harness.cpu.instr_queue.borrow().size(), 3);

        harness.run();
        assert_eq!(harness.cpu.perf_counters.borrow().retired_cnt, 1);
    }

    #[test]
    fn test_trace_run() {
        let src = r#"
# a loop body executed a few times
0x100 LOAD  R1 R10 -   l1_hit
0x104 ADD   R2 R1 R2
0x108 MUL   R3 R2 R2
0x10c STORE -  R3 R10
0x110 BRANCH - R2 -    taken
0x100 LOAD  R1 R10 -   l2_hit icache_miss=2
0x104 ADD   R2 R1 R2
0x108 MUL   R3 R2 R2
0x10c STORE -  R3 R10
0x110 BRANCH - R2 -    taken
0x100 LOAD  R1 R10 -   l2_miss
0x104 ADD   R2 R1 R2
0x108 MUL   R3 R2 R2
0x10c STORE -  R3 R10
0x110 BRANCH - R2 -    not_taken
0x114 ADD   R4 R3 -
"#;
        let mut harness = TestHarness::from_trace(CPUConfig::default(), src);
        harness.run();

        let perf_counters = harness.cpu.perf_counters.borrow();
        // the wrong path isn't part of the trace; every record retires exactly once.
        assert_eq!(perf_counters.retired_cnt, 16);
        assert!(perf_counters.fetch_cnt >= 16);
        assert!(perf_counters.branch_misprediction_cnt >= 1);
    }

    #[test]
    fn test_invariants_on_generated_trace() {
        let mut src = String::new();
        let mut state: u64 = 0x2545F4914F6CDD1D;
        let mut next = || {
            // xorshift
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state
        };

        let record_cnt = 400;
        for i in 0..record_cnt {
            let pc = 0x1000 + (i % 64) * 4;
            let dest = 1 + next() % 31;
            let src1 = next() % 32;
            let src2 = next() % 32;
            let line = match next() % 8 {
                0 | 1 | 2 => format!("{:#x} ADD R{} R{} R{}", pc, dest, src1, src2),
                3 => format!("{:#x} MUL R{} R{} R{}", pc, dest, src1, src2),
                4 => {
                    let class = ["l1_hit", "l1_hit", "l2_hit", "l2_miss"][(next() % 4) as usize];
                    format!("{:#x} LOAD R{} R{} - {}", pc, dest, src1, class)
                }
                5 => format!("{:#x} STORE - R{} R{}", pc, src1, src2),
                _ => {
                    let outcome = if next() % 3 == 0 { "not_taken" } else { "taken" };
                    format!("{:#x} BRANCH - R{} - {}", pc, src1, outcome)
                }
            };
            src.push_str(&line);
            if next() % 10 == 0 {
                src.push_str(" icache_miss=1");
            }
            src.push('\n');
        }

        for (fetch_n_wide, dispatch_n_wide, rob_capacity) in [(1, 1, 4), (2, 4, 16), (8, 8, 64)] {
            let mut cpu_config = CPUConfig::default();
            cpu_config.fetch_n_wide = fetch_n_wide;
            cpu_config.dispatch_n_wide = dispatch_n_wide;
            cpu_config.rob_capacity = rob_capacity;
            cpu_config.phys_reg_count = 40;

            let mut harness = TestHarness::from_trace(cpu_config, &src);
            harness.run();

            let perf_counters = harness.cpu.perf_counters.borrow();
            assert_eq!(perf_counters.retired_cnt, record_cnt);
            assert!(perf_counters.rob_max <= rob_capacity as u64);
            drop(perf_counters);
            harness.assert_drained();
        }
    }
}
