pub mod cpu_set;

pub use cpu_set::{CpuSet, MAX_CPUS};
