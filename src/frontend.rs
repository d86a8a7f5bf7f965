pub(crate) mod branch_predictor;
pub(crate) mod frontend;
pub(crate) mod trace_source;
