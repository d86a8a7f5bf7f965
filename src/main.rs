use std::cell::RefCell;
use std::path::PathBuf;
use std::process::exit;
use std::rc::Rc;

use log::{error, info};
use structopt::StructOpt;

use crate::cpu::{CPU, CPUConfig, load_cpu_config};
use crate::frontend::branch_predictor::{AlwaysTaken, BranchPredictor, GSelect, PredictorKind};
use crate::frontend::trace_source::TraceDriver;
use crate::loader::loader::{load, LoadError};

mod cpu;
mod loader;
mod frontend;
mod backend;
mod instructions;
#[cfg(test)]
mod cpu_tests;

#[derive(StructOpt, Debug)]
#[structopt(name = "procsim", about = "Cycle accurate out-of-order superscalar pipeline simulator")]
struct Opt {
    /// Path of the trace to simulate
    #[structopt(short, long, parse(from_os_str))]
    trace: PathBuf,

    /// Sets a custom config file
    #[structopt(short, long, parse(from_os_str), default_value = "cpu.yaml")]
    config: PathBuf,

    /// Fetch width
    #[structopt(short = "f", long)]
    fetch_width: Option<u8>,

    /// Dispatch width
    #[structopt(short = "d", long)]
    dispatch_width: Option<u8>,

    /// Number of physical registers beyond the architectural registers
    #[structopt(short = "p", long)]
    phys_regs: Option<u16>,

    /// Number of ALUs
    #[structopt(short = "a", long)]
    alus: Option<u16>,

    /// Number of multipliers
    #[structopt(short = "m", long)]
    muls: Option<u16>,

    /// Number of load/store units
    #[structopt(short = "l", long)]
    lsus: Option<u16>,

    /// Scheduling queue entries per functional unit
    #[structopt(short = "s", long)]
    rs_per_fu: Option<u16>,

    /// Number of ROB entries
    #[structopt(short = "r", long)]
    rob: Option<u16>,

    /// The branch predictor: always-taken or gselect
    #[structopt(long, default_value = "gselect")]
    predictor: PredictorKind,

    /// Global history bits of the gselect predictor
    #[structopt(long = "history-bits", default_value = "8")]
    history_bits: u8,

    /// Pc bits of the gselect predictor
    #[structopt(long = "pc-bits", default_value = "4")]
    pc_bits: u8,
}

impl Opt {
    fn apply_overrides(&self, cpu_config: &mut CPUConfig) {
        if let Some(fetch_width) = self.fetch_width {
            cpu_config.fetch_n_wide = fetch_width;
        }
        if let Some(dispatch_width) = self.dispatch_width {
            cpu_config.dispatch_n_wide = dispatch_width;
        }
        if let Some(phys_regs) = self.phys_regs {
            cpu_config.phys_reg_count = phys_regs;
        }
        if let Some(alus) = self.alus {
            cpu_config.alu_count = alus;
        }
        if let Some(muls) = self.muls {
            cpu_config.mul_count = muls;
        }
        if let Some(lsus) = self.lsus {
            cpu_config.lsu_count = lsus;
        }
        if let Some(rs_per_fu) = self.rs_per_fu {
            cpu_config.rs_per_fu = rs_per_fu;
        }
        if let Some(rob) = self.rob {
            cpu_config.rob_capacity = rob;
        }
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let opt = Opt::from_args();

    let cpu_config_path = opt.config.to_string_lossy();
    let mut cpu_config = match load_cpu_config(&cpu_config_path) {
        Ok(config) => config,
        Err(error) => {
            error!("Failed to load {}. Cause: {}", cpu_config_path, error);
            exit(1);
        }
    };

    opt.apply_overrides(&mut cpu_config);
    if let Err(msg) = cpu_config.validate() {
        error!("Invalid configuration: {}", msg);
        exit(1);
    }

    let path = opt.trace.to_string_lossy();
    let program = match load(&path) {
        Ok(p) => Rc::new(p),
        Err(err) => {
            error!("Loading trace '{}' failed.", path);
            match err {
                LoadError::AnalysisError(msg_vec) => {
                    for msg in msg_vec {
                        error!("{}", msg);
                    }
                }
                other => error!("{}", other),
            }
            exit(1);
        }
    };

    if opt.pc_bits as u32 + opt.history_bits as u32 > 24 {
        error!("--pc-bits + --history-bits can't exceed 24");
        exit(1);
    }

    let predictor: Rc<RefCell<dyn BranchPredictor>> = match opt.predictor {
        PredictorKind::AlwaysTaken => Rc::new(RefCell::new(AlwaysTaken::new())),
        PredictorKind::GSelect => Rc::new(RefCell::new(GSelect::new(opt.pc_bits, opt.history_bits))),
    };

    info!("Config: {:?}", cpu_config);

    let driver = TraceDriver::new(program, Rc::clone(&predictor));
    let mut cpu = CPU::new(&cpu_config, Box::new(driver), predictor);
    cpu.run();

    println!("{}", cpu.perf_counters.borrow());
}
