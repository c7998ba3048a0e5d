//! Host glue: the formats the CLI host reads and writes.

pub mod catalog;
pub mod csv;
