//! `hostq`: the command-queue engine together with its host CPU backend.
//!
//! Most users want [`CommandQueue`] over a [`cpu::CpuBackend`]; the core types are re-exported at
//! the crate root.
#![forbid(unsafe_code)]

pub use hostq_core::*;

pub mod cpu {
    pub use hostq_cpu::{CpuBackend, CpuBackendConfig, CpuBackendError, CpuBackendStats};
}
