pub(crate) mod backend;
pub(crate) mod execution_unit;
pub(crate) mod physical_register;
pub(crate) mod register_alias_table;
pub(crate) mod reorder_buffer;
pub(crate) mod reservation_station;
