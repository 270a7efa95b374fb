//! Key/value caches for incremental decoding.

mod cpu;

pub use cpu::CpuKVCache;
