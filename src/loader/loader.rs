use std::error::Error;
use std::fmt;
use std::fs;
use std::io::ErrorKind;

use log::info;
use pest::iterators::Pair;
use pest::Parser;
use pest_derive::Parser;

use crate::instructions::instructions::{CacheLatency, get_opcode, get_register, Instr, NOP_REG, Opcode, Program,
                                        RegisterType, SourceLocation, TraceRecord};

#[derive(Parser)]
#[grammar = "loader/trace.pest"]
struct TraceParser;

#[derive(Debug)]
pub enum LoadError {
    ParseError(String),
    AnalysisError(Vec<String>),
    NotFoundError(String),
    IOError(String),
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadError::ParseError(msg) => write!(f, "{}", msg),
            LoadError::AnalysisError(msg_vec) => write!(f, "{}", msg_vec.join("\n")),
            LoadError::NotFoundError(msg) => write!(f, "{}", msg),
            LoadError::IOError(msg) => write!(f, "{}", msg),
        }
    }
}

impl Error for LoadError {}

struct Loader {
    records: Vec<TraceRecord>,
    errors: Vec<String>,
}

impl Loader {
    fn load(&mut self, src: &str) -> Result<(), LoadError> {
        let file = match TraceParser::parse(Rule::file, src) {
            Ok(mut pairs) => match pairs.next() {
                Some(file) => file,
                None => return Ok(()),
            },
            Err(err) => return Err(LoadError::ParseError(format!("Parsing error: {}", err))),
        };

        for pair in file.into_inner() {
            if pair.as_rule() == Rule::record {
                self.parse_record(pair);
            }
        }

        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(LoadError::AnalysisError(self.errors.clone()))
        }
    }

    fn parse_record(&mut self, pair: Pair<Rule>) {
        let loc = get_location(&pair);
        let mut inner_pairs = pair.into_inner();

        let (pc_pair, opcode_pair) = match (inner_pairs.next(), inner_pairs.next()) {
            (Some(pc_pair), Some(opcode_pair)) => (pc_pair, opcode_pair),
            _ => panic!("Record at [{}] doesn't have a pc and an opcode", loc),
        };

        let pc = match parse_pc(pc_pair.as_str()) {
            Some(pc) => pc,
            None => {
                self.errors.push(format!("Illegal pc '{}' at [{}]", pc_pair.as_str(), loc));
                return;
            }
        };

        let mnemonic = opcode_pair.as_str();
        let opcode = match get_opcode(mnemonic) {
            Some(opcode) => opcode,
            None => {
                self.errors.push(format!("Unknown opcode '{}' at [{}]", mnemonic, get_location(&opcode_pair)));
                return;
            }
        };

        let mut registers: Vec<Option<RegisterType>> = Vec::with_capacity(3);
        let mut cache_latency = None;
        let mut branch_taken = None;
        let mut icache_misses = 0;

        for inner_pair in inner_pairs {
            let inner_loc = get_location(&inner_pair);
            match inner_pair.as_rule() {
                Rule::register => match get_register(inner_pair.as_str()) {
                    Some(reg) => registers.push(Some(reg)),
                    None => {
                        self.errors.push(format!("Illegal register '{}' at [{}]", inner_pair.as_str(), inner_loc));
                        registers.push(None);
                    }
                },
                Rule::none => registers.push(None),
                Rule::taken | Rule::not_taken => {
                    if opcode != Opcode::BRANCH {
                        self.errors.push(format!("Branch outcome on a non branch instruction at [{}]", inner_loc));
                    }
                    branch_taken = Some(inner_pair.as_rule() == Rule::taken);
                }
                Rule::l1_hit | Rule::l2_hit | Rule::l2_miss => {
                    if opcode != Opcode::LOAD {
                        self.errors.push(format!("Cache latency on a non load instruction at [{}]", inner_loc));
                    }
                    cache_latency = Some(match inner_pair.as_rule() {
                        Rule::l1_hit => CacheLatency::L1Hit,
                        Rule::l2_hit => CacheLatency::L2Hit,
                        _ => CacheLatency::L2Miss,
                    });
                }
                Rule::icache_miss => {
                    let count = inner_pair.into_inner().as_str();
                    match count.parse::<u32>() {
                        Ok(count) => icache_misses = count,
                        Err(_) => self.errors.push(format!("Illegal icache_miss count '{}' at [{}]", count, inner_loc)),
                    }
                }
                _ => panic!("Unknown rule {:?} encountered at [{}]", inner_pair.as_rule(), inner_loc),
            }
        }

        assert_eq!(registers.len(), 3, "Record at [{}] doesn't have 3 operands", loc);
        let sink = registers[0];
        if sink == Some(NOP_REG) {
            self.errors.push(format!("R{} can't be used as destination at [{}]", NOP_REG, loc));
        }

        let instr = Instr {
            seq: 0,
            pc,
            opcode,
            source: [registers[1], registers[2]],
            sink,
            cache_latency: cache_latency.unwrap_or(CacheLatency::L1Hit),
            branch_taken: branch_taken.unwrap_or(false),
            mispredict: false,
            loc: Some(loc),
        };

        self.records.push(TraceRecord { instr, icache_misses });
    }
}

fn get_location(pair: &Pair<Rule>) -> SourceLocation {
    let (line, column) = pair.as_span().start_pos().line_col();
    SourceLocation { line, column }
}

fn parse_pc(s: &str) -> Option<u64> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else {
        s.parse().ok()
    }
}

pub fn load(path: &str) -> Result<Program, LoadError> {
    info!("Loading {}", path);

    let src = match fs::read_to_string(path) {
        Ok(src) => src,
        Err(err) if err.kind() == ErrorKind::NotFound =>
            return Err(LoadError::NotFoundError(format!("File '{}' not found", path))),
        Err(err) =>
            return Err(LoadError::IOError(format!("Failed to read '{}'. Cause: {}", path, err))),
    };

    load_from_string(src)
}

pub fn load_from_string(src: String) -> Result<Program, LoadError> {
    let mut loader = Loader {
        records: Vec::new(),
        errors: Vec::new(),
    };

    loader.load(&src)?;

    info!("Loaded {} trace records", loader.records.len());
    Ok(Program { records: loader.records })
}
