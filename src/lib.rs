//! # hetpipe
//!
//! Heterogeneous compute pipelining and device-pool scheduling interfaces.
//!
//! This crate sits above a low-level parallel-compute driver (kernel
//! compilation, device enumeration, command queues, device residency — all
//! behind the [`Driver`]/[`Cruncher`] traits) and lets an application
//! express a computation as named kernels over typed arrays, executed with:
//!
//! - **Multi-device pipelines** ([`PipelineStage`] → [`Pipeline`]): an
//!   explicit N-stage chain where each stage owns its kernels, devices, and
//!   buffers, with double-buffered edges so a stage computes on one buffer
//!   side while its neighbour fills the other. One [`Pipeline::push`]
//!   advances every stage concurrently by one tick.
//! - **Single-device pipelines** ([`DevicePipeline`]): all stages on one
//!   accelerator, overlapping read/compute/write across up to 16
//!   asynchronous command queues with double-buffered I/O.
//! - **Task pools over device pools** ([`Task`]/[`TaskGroup`]/[`TaskPool`]
//!   → [`DevicePool`]): captured compute calls grouped under execution
//!   policies and distributed to per-device consumer threads by a
//!   configurable scheduling discipline.

pub use crate::args::{ArgEntry, ArgGroup, BufferFlags, Compute, FlagState};
pub use crate::device_pipeline::{ArrayRole, DevicePipeline, DeviceStage};
pub use crate::device_pool::{DevicePool, PoolFlags};
pub use crate::driver::{AcceleratorKind, CompileLock, Cruncher, CruncherOptions, Device,
    Driver, PipelineType, COMPUTE_AT_WILL_WATERMARK, QUEUES_MAX};
pub use crate::element::{ArrayData, ElementKind, HostArray, HostElement};
pub use crate::error::{Error, Result};
pub use crate::facade::{extract_kernel_names, uses_device_side_queue, CruncherFacade,
    CruncherFacadeBuilder};
pub use crate::pipeline::Pipeline;
pub use crate::stage::PipelineStage;
pub use crate::stage_buffer::StageBuffer;
pub use crate::task::{ComputeTarget, Dispatch, GroupBinding, Task, TaskGroup,
    TaskGroupKind, TaskPhase, TaskPool, TaskPoolKind};

pub mod args;
pub mod device_pipeline;
pub mod device_pool;
pub mod driver;
pub mod element;
pub mod error;
pub mod facade;
pub mod pipeline;
pub mod stage;
pub mod stage_buffer;
pub mod task;

#[cfg(test)]
mod tests;
