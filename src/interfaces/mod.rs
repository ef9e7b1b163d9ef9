//! Outer surfaces of the command line tool.

pub mod csv;
