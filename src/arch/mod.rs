//! # Architecture Abstraction Layer
//!
//! Hardware boundary of the kernel. Currently implements the Cortex-M4
//! port; other architectures would add sibling modules.

pub mod cortex_m4;
