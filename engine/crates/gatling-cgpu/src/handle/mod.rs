pub mod handle_store;
pub mod object_table;
pub mod typed;
