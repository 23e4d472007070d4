//! # Architecture Abstraction Layer
//!
//! Hardware boundary of the kernel. The initial frame layout is portable;
//! handlers and the port itself are compiled for bare-metal ARM only.

pub mod cortex_m;
