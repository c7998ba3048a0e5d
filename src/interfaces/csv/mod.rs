pub mod command_reader;
pub mod ownership_writer;
