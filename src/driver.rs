//! The driver boundary.
//!
//! Everything device-specific — kernel compilation, device enumeration,
//! command queues, residency — lives behind [`Driver`] and [`Cruncher`].
//! The pipelining and scheduling layers never inspect device internals
//! beyond these two traits.

use std::sync::Arc;

use bitflags::bitflags;
use parking_lot::{Mutex, MutexGuard};

use crate::args::ArgGroup;
use crate::error::Result;

bitflags! {
    /// Accelerator categories, combinable as a mask.
    pub struct AcceleratorKind: u32 {
        const CPU = 1;
        const GPU = 2;
        const ACC = 4;
    }
}

/// Maximum asynchronous command queues a cruncher drives per device.
pub const QUEUES_MAX: usize = 16;

/// Queue-depth watermark for compute-at-will device selection.
pub const COMPUTE_AT_WILL_WATERMARK: usize = 4;

/// A device descriptor as enumerated by a driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    index: usize,
    kind: AcceleratorKind,
    name: String,
    compute_units: usize,
}

impl Device {
    pub fn new<S: Into<String>>(index: usize, kind: AcceleratorKind, name: S,
            compute_units: usize) -> Device {
        Device {
            index: index,
            kind: kind,
            name: name.into(),
            compute_units: compute_units,
        }
    }

    /// Driver-assigned enumeration index.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn kind(&self) -> AcceleratorKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn compute_units(&self) -> usize {
        self.compute_units
    }
}

/// Construction parameters handed to [`Driver::build`].
#[derive(Debug, Clone)]
pub struct CruncherOptions {
    /// Asynchronous command queues per device, clamped to `[1, QUEUES_MAX]`.
    pub queue_concurrency: usize,
    /// Driver-level pipelining. The stage layer disables this and supplies
    /// its own multi-queue strategy.
    pub pipelining: bool,
    /// Request a device-side default queue (kernel sources using
    /// `enqueue_kernel(`).
    pub device_side_queue: bool,
    /// Streamed (map/unmap) host transfers rather than staged copies.
    pub stream: bool,
    /// CPU sub-device count; negative selects all cores minus one.
    pub cpu_fission_count: i32,
}

impl Default for CruncherOptions {
    fn default() -> CruncherOptions {
        CruncherOptions {
            queue_concurrency: QUEUES_MAX,
            pipelining: true,
            device_side_queue: false,
            stream: true,
            cpu_fission_count: -1,
        }
    }
}

/// How a driver-pipelined compute call overlaps its blob slices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineType {
    /// Blobs chained by completion events across the device queues.
    Event,
    /// Blobs rotated by the driver's own queue scheduling.
    Driver,
}

impl Default for PipelineType {
    fn default() -> PipelineType {
        PipelineType::Event
    }
}

/// Serialises cruncher construction against a driver's global compile state.
///
/// One lock is shared per chain of stages (or per device pool) and passed to
/// every construction site explicitly.
#[derive(Clone, Default)]
pub struct CompileLock {
    inner: Arc<Mutex<()>>,
}

impl CompileLock {
    pub fn new() -> CompileLock {
        CompileLock::default()
    }

    pub fn acquire(&self) -> MutexGuard<()> {
        self.inner.lock()
    }
}

/// The dispatch half of the driver contract.
///
/// A cruncher owns one compiled program on a fixed device set. `compute`
/// launches the named kernels over `global`/`local` work ranges against the
/// argument group's current sides and flags; the mode setters tune how much
/// of the read-launch-write envelope each call performs. When `pipeline` is
/// set the call is split into `blobs` slices overlapped per `pipeline_type`;
/// a driver without queue pipelining may run the call whole.
pub trait Cruncher: Send {
    fn compute(
        &mut self,
        args: &ArgGroup,
        compute_id: u32,
        kernel_names: &str,
        global: usize,
        local: usize,
        offset: usize,
        pipeline: bool,
        pipeline_type: PipelineType,
        blobs: usize,
    ) -> Result<()>;

    /// Elide automatic per-call reads/writes; the caller fuses a kernel
    /// sequence under one enveloping transfer pair.
    fn set_enqueue_mode(&mut self, on: bool);

    /// Enqueue-mode variant that also releases the host thread before the
    /// device work completes.
    fn set_enqueue_mode_async(&mut self, on: bool);

    /// Honour buffer-transfer flags only; skip kernel launches.
    fn set_no_compute_mode(&mut self, on: bool);

    fn set_fine_grained_queue_control(&mut self, on: bool);

    /// Pins subsequent commands to one of the device's asynchronous queues.
    fn select_queue(&mut self, queue: usize);

    fn flush(&mut self);

    /// Blocks until all issued commands complete.
    fn finish(&mut self);

    fn count_markers(&self) -> usize;

    fn count_marker_callbacks(&self) -> usize;

    fn set_smooth_load_balancer(&mut self, on: bool);

    fn set_performance_feed(&mut self, on: bool);

    fn device_names(&self) -> Vec<String>;

    fn last_used_queue_of_first_device(&self) -> usize;

    /// Relative observed throughput per device.
    fn throughputs(&self) -> Vec<f64>;

    /// Relative global-range share per device for `compute_id`.
    fn ranges_of(&self, compute_id: u32) -> Vec<usize>;

    fn error_code(&self) -> i32;

    fn error_message(&self) -> String;

    fn dispose(&mut self);
}

/// The enumeration/compilation half of the driver contract.
pub trait Driver: Send + Sync {
    /// All devices the driver can see.
    fn devices(&self) -> Vec<Device>;

    /// Compiles `kernel_source` for `devices` and returns a dispatcher.
    ///
    /// Callers serialise this through a [`CompileLock`]; implementations may
    /// assume construction is not re-entered.
    fn build(
        &self,
        devices: &[Device],
        kernel_source: &str,
        options: &CruncherOptions,
    ) -> Result<Box<dyn Cruncher>>;
}
