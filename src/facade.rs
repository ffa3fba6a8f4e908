//! A convenient wrapper around a driver-built cruncher.

use std::sync::Arc;

use lazy_static::lazy_static;
use log::debug;
use regex::Regex;

use crate::args::ArgGroup;
use crate::driver::{AcceleratorKind, CompileLock, Cruncher, CruncherOptions, Device, Driver,
    PipelineType, QUEUES_MAX};
use crate::error::{Error, Result};

lazy_static! {
    static ref KERNEL_NAME: Regex =
        Regex::new(r"kernel\s+void\s+([A-Za-z0-9_]+)").expect("kernel name pattern");
}

/// Extracts the kernel names defined by `source`, in order of appearance,
/// without duplicates.
pub fn extract_kernel_names(source: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for caps in KERNEL_NAME.captures_iter(source) {
        let name = &caps[1];
        if !names.iter().any(|n| n == name) {
            names.push(name.to_string());
        }
    }
    names
}

/// Whether `source` enqueues kernels from the device side, requiring a
/// device-side default queue.
pub fn uses_device_side_queue(source: &str) -> bool {
    source.contains("enqueue_kernel(")
}

fn clamp_queue_concurrency(requested: usize) -> usize {
    if requested < 1 {
        1
    } else if requested > QUEUES_MAX {
        QUEUES_MAX
    } else {
        requested
    }
}

/// Builder for [`CruncherFacade`].
///
/// Select devices either with an accelerator-kind mask (`kinds`, optionally
/// narrowed by `cpu_fission_count`/`gpu_count`) or with an explicit device
/// list (`devices`); an explicit list wins when both are given.
pub struct CruncherFacadeBuilder {
    driver: Arc<dyn Driver>,
    lock: CompileLock,
    source: String,
    kinds: AcceleratorKind,
    devices: Option<Vec<Device>>,
    cpu_fission_count: i32,
    gpu_count: i32,
    stream: bool,
    no_pipelining: bool,
    queue_concurrency: usize,
}

impl CruncherFacadeBuilder {
    pub fn new<S: Into<String>>(driver: Arc<dyn Driver>, source: S) -> CruncherFacadeBuilder {
        CruncherFacadeBuilder {
            driver: driver,
            lock: CompileLock::new(),
            source: source.into(),
            kinds: AcceleratorKind::GPU,
            devices: None,
            cpu_fission_count: -1,
            gpu_count: -1,
            stream: true,
            no_pipelining: false,
            queue_concurrency: QUEUES_MAX,
        }
    }

    pub fn lock(mut self, lock: CompileLock) -> CruncherFacadeBuilder {
        self.lock = lock;
        self
    }

    pub fn kinds(mut self, kinds: AcceleratorKind) -> CruncherFacadeBuilder {
        self.kinds = kinds;
        self
    }

    pub fn devices(mut self, devices: Vec<Device>) -> CruncherFacadeBuilder {
        self.devices = Some(devices);
        self
    }

    /// CPU sub-device count; negative means all cores minus one.
    pub fn cpu_fission_count(mut self, count: i32) -> CruncherFacadeBuilder {
        self.cpu_fission_count = count;
        self
    }

    /// Number of GPUs to take; negative means all.
    pub fn gpu_count(mut self, count: i32) -> CruncherFacadeBuilder {
        self.gpu_count = count;
        self
    }

    pub fn stream(mut self, on: bool) -> CruncherFacadeBuilder {
        self.stream = on;
        self
    }

    pub fn no_pipelining(mut self, on: bool) -> CruncherFacadeBuilder {
        self.no_pipelining = on;
        self
    }

    /// Clamped to `[1, QUEUES_MAX]` at build time.
    pub fn queue_concurrency(mut self, queues: usize) -> CruncherFacadeBuilder {
        self.queue_concurrency = queues;
        self
    }

    pub fn build(mut self) -> Result<CruncherFacade> {
        let kernel_names = extract_kernel_names(&self.source);
        if kernel_names.is_empty() {
            return Error::err(
                "CruncherFacadeBuilder::build(): no kernel names found in source");
        }

        let devices = match self.devices.take() {
            Some(devices) => devices,
            None => self.select_by_mask(),
        };
        if devices.is_empty() {
            return Error::err("CruncherFacadeBuilder::build(): no devices selected");
        }

        let cpu_fission = resolve_cpu_fission(self.cpu_fission_count, &devices);
        let device_side_queue = uses_device_side_queue(&self.source);
        let options = CruncherOptions {
            queue_concurrency: clamp_queue_concurrency(self.queue_concurrency),
            pipelining: !self.no_pipelining,
            device_side_queue: device_side_queue,
            stream: self.stream,
            cpu_fission_count: cpu_fission,
        };

        let cruncher = {
            let _guard = self.lock.acquire();
            self.driver.build(&devices, &self.source, &options)?
        };

        Ok(CruncherFacade {
            cruncher: cruncher,
            devices: devices,
            kernel_names: kernel_names,
            device_side_queue: device_side_queue,
            enqueue_mode: false,
            enqueue_mode_async: false,
            no_compute_mode: false,
            fine_grained_queue_control: false,
            smooth_load_balancer: false,
            performance_feed: false,
            error_code: 0,
            error_message: String::new(),
        })
    }

    fn select_by_mask(&self) -> Vec<Device> {
        let all = self.driver.devices();
        let mut selected = Vec::new();
        if self.kinds.contains(AcceleratorKind::CPU) {
            selected.extend(all.iter().filter(|d| d.kind() == AcceleratorKind::CPU).cloned());
        }
        if self.kinds.contains(AcceleratorKind::GPU) {
            let gpus = all.iter().filter(|d| d.kind() == AcceleratorKind::GPU);
            if self.gpu_count < 0 {
                selected.extend(gpus.cloned());
            } else {
                selected.extend(gpus.take(self.gpu_count as usize).cloned());
            }
        }
        if self.kinds.contains(AcceleratorKind::ACC) {
            selected.extend(all.iter().filter(|d| d.kind() == AcceleratorKind::ACC).cloned());
        }
        selected
    }
}

fn resolve_cpu_fission(requested: i32, devices: &[Device]) -> i32 {
    if requested >= 0 {
        return requested;
    }
    match devices.iter().find(|d| d.kind() == AcceleratorKind::CPU) {
        Some(cpu) => {
            let units = cpu.compute_units();
            if units > 1 { (units - 1) as i32 } else { 1 }
        }
        None => requested,
    }
}

/// Thin ownership wrapper over a driver cruncher: mode switches, markers,
/// throughput queries, and an error latch that declines further work after
/// a driver failure.
pub struct CruncherFacade {
    cruncher: Box<dyn Cruncher>,
    devices: Vec<Device>,
    kernel_names: Vec<String>,
    device_side_queue: bool,
    enqueue_mode: bool,
    enqueue_mode_async: bool,
    no_compute_mode: bool,
    fine_grained_queue_control: bool,
    smooth_load_balancer: bool,
    performance_feed: bool,
    error_code: i32,
    error_message: String,
}

impl CruncherFacade {
    /// Returns a new builder.
    pub fn builder<S: Into<String>>(driver: Arc<dyn Driver>, source: S)
            -> CruncherFacadeBuilder {
        CruncherFacadeBuilder::new(driver, source)
    }

    /// Builds for every device matching `kinds`, with default selectors.
    pub fn from_mask<S: Into<String>>(driver: Arc<dyn Driver>, lock: CompileLock,
            kinds: AcceleratorKind, source: S) -> Result<CruncherFacade> {
        CruncherFacadeBuilder::new(driver, source).lock(lock).kinds(kinds).build()
    }

    /// Builds for an explicit device list.
    pub fn from_devices<S: Into<String>>(driver: Arc<dyn Driver>, lock: CompileLock,
            devices: Vec<Device>, source: S) -> Result<CruncherFacade> {
        CruncherFacadeBuilder::new(driver, source).lock(lock).devices(devices).build()
    }

    /// Launches `kernel_names` (whitespace-separated, in order) against the
    /// group's current sides and flags.
    ///
    /// After a driver failure the facade records the message and refuses
    /// every subsequent call.
    pub fn compute(&mut self, args: &ArgGroup, compute_id: u32, kernel_names: &str,
            global: usize, local: usize, offset: usize) -> Result<()> {
        self.compute_pipelined(args, compute_id, kernel_names, global, local, offset,
            false, PipelineType::default(), 0)
    }

    /// Full-form dispatch carrying the driver-pipelining envelope: when
    /// `pipeline` is set the driver splits the call into `blobs` slices
    /// overlapped per `pipeline_type`.
    pub fn compute_pipelined(&mut self, args: &ArgGroup, compute_id: u32,
            kernel_names: &str, global: usize, local: usize, offset: usize,
            pipeline: bool, pipeline_type: PipelineType, blobs: usize) -> Result<()> {
        if self.error_code != 0 {
            return Err(Error::driver(self.error_code, self.error_message.clone()));
        }
        match self.cruncher.compute(args, compute_id, kernel_names, global, local,
                offset, pipeline, pipeline_type, blobs) {
            Ok(()) => {
                if self.performance_feed {
                    debug!("{}", self.performance_report());
                }
                Ok(())
            }
            Err(err) => {
                self.error_code = match err.code() {
                    0 => -1,
                    code => code,
                };
                self.error_message = err.to_string();
                Err(err)
            }
        }
    }

    pub fn kernel_names(&self) -> &[String] {
        &self.kernel_names
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn device_side_queue(&self) -> bool {
        self.device_side_queue
    }

    pub fn set_enqueue_mode(&mut self, on: bool) {
        self.enqueue_mode = on;
        self.cruncher.set_enqueue_mode(on);
    }

    pub fn enqueue_mode(&self) -> bool {
        self.enqueue_mode
    }

    pub fn set_enqueue_mode_async(&mut self, on: bool) {
        self.enqueue_mode_async = on;
        self.cruncher.set_enqueue_mode_async(on);
    }

    pub fn enqueue_mode_async(&self) -> bool {
        self.enqueue_mode_async
    }

    pub fn set_no_compute_mode(&mut self, on: bool) {
        self.no_compute_mode = on;
        self.cruncher.set_no_compute_mode(on);
    }

    pub fn no_compute_mode(&self) -> bool {
        self.no_compute_mode
    }

    pub fn set_fine_grained_queue_control(&mut self, on: bool) {
        self.fine_grained_queue_control = on;
        self.cruncher.set_fine_grained_queue_control(on);
    }

    pub fn fine_grained_queue_control(&self) -> bool {
        self.fine_grained_queue_control
    }

    pub fn set_smooth_load_balancer(&mut self, on: bool) {
        self.smooth_load_balancer = on;
        self.cruncher.set_smooth_load_balancer(on);
    }

    pub fn smooth_load_balancer(&self) -> bool {
        self.smooth_load_balancer
    }

    pub fn set_performance_feed(&mut self, on: bool) {
        self.performance_feed = on;
        self.cruncher.set_performance_feed(on);
    }

    pub fn performance_feed(&self) -> bool {
        self.performance_feed
    }

    pub fn select_queue(&mut self, queue: usize) {
        self.cruncher.select_queue(queue);
    }

    pub fn flush(&mut self) {
        self.cruncher.flush();
    }

    pub fn finish(&mut self) {
        self.cruncher.finish();
    }

    pub fn count_markers(&self) -> usize {
        self.cruncher.count_markers()
    }

    pub fn count_marker_callbacks(&self) -> usize {
        self.cruncher.count_marker_callbacks()
    }

    pub fn device_names(&self) -> Vec<String> {
        self.cruncher.device_names()
    }

    pub fn last_used_queue_of_first_device(&self) -> usize {
        self.cruncher.last_used_queue_of_first_device()
    }

    pub fn throughputs(&self) -> Vec<f64> {
        self.cruncher.throughputs()
    }

    pub fn ranges_of(&self, compute_id: u32) -> Vec<usize> {
        self.cruncher.ranges_of(compute_id)
    }

    pub fn error_code(&self) -> i32 {
        match self.error_code {
            0 => self.cruncher.error_code(),
            code => code,
        }
    }

    pub fn error_message(&self) -> String {
        if self.error_code != 0 {
            self.error_message.clone()
        } else {
            self.cruncher.error_message()
        }
    }

    /// One line per device: name and relative throughput share.
    pub fn performance_report(&self) -> String {
        let names = self.cruncher.device_names();
        let throughputs = self.cruncher.throughputs();
        let total: f64 = throughputs.iter().sum();
        let mut report = String::new();
        for (i, name) in names.iter().enumerate() {
            let share = throughputs.get(i).cloned().unwrap_or(0.0);
            let percent = if total > 0.0 { 100.0 * share / total } else { 0.0 };
            report.push_str(&format!("{}: {:.2}%\n", name, percent));
        }
        report
    }

    pub fn dispose(&mut self) {
        self.cruncher.dispose();
    }
}
