pub mod memory;
pub mod mtrr;
