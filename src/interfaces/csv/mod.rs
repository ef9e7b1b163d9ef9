pub mod order_reader;
pub mod plan_writer;
