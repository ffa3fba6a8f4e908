//! Single-device pipelining over multiple asynchronous command queues.
//!
//! All stages run on one accelerator; overlap of read, compute, and write
//! comes from the cruncher's queue fan-out plus double-buffered I/O arrays,
//! not from splitting stages across devices.

use std::sync::Arc;

use log::error;
use rayon::prelude::*;

use crate::args::{ArgGroup, FlagState};
use crate::driver::{Device, Driver};
use crate::element::HostArray;
use crate::error::{Error, Result};
use crate::facade::CruncherFacade;
use crate::stage_buffer::StageBuffer;

/// How a stage uses one of its bound arrays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrayRole {
    /// Duplicated; host feeds the duplicate; read-only for the kernel.
    Input,
    /// Duplicated; host drains the duplicate; write-only for the kernel.
    Output,
    /// Not duplicated; private sequential state of the owning stage.
    Internal,
    /// Duplicated; connects this stage to its neighbour device-side.
    Transition,
}

/// Declarative description of one stage: kernels plus role-tagged arrays in
/// kernel-signature order.
pub struct DeviceStage {
    label: String,
    kernel_names: Vec<String>,
    globals: Vec<usize>,
    locals: Vec<usize>,
    bindings: Vec<(HostArray, ArrayRole)>,
}

impl DeviceStage {
    pub fn new<S: Into<String>>(label: S) -> DeviceStage {
        DeviceStage {
            label: label.into(),
            kernel_names: Vec::new(),
            globals: Vec::new(),
            locals: Vec::new(),
            bindings: Vec::new(),
        }
    }

    /// Appends a kernel with its work ranges (builder-style).
    pub fn kernel<S: Into<String>>(mut self, name: S, global: usize, local: usize)
            -> DeviceStage {
        self.kernel_names.push(name.into());
        self.globals.push(global);
        self.locals.push(local);
        self
    }

    pub fn input(mut self, array: HostArray) -> DeviceStage {
        self.bindings.push((array, ArrayRole::Input));
        self
    }

    pub fn output(mut self, array: HostArray) -> DeviceStage {
        self.bindings.push((array, ArrayRole::Output));
        self
    }

    pub fn internal(mut self, array: HostArray) -> DeviceStage {
        self.bindings.push((array, ArrayRole::Internal));
        self
    }

    pub fn transition(mut self, array: HostArray) -> DeviceStage {
        self.bindings.push((array, ArrayRole::Transition));
        self
    }
}

struct StageView {
    role: ArrayRole,
    host: HostArray,
    serial: Arc<StageBuffer>,
    parallel: Arc<StageBuffer>,
}

struct BuiltStage {
    label: String,
    kernel_names: Vec<String>,
    globals: Vec<usize>,
    locals: Vec<usize>,
    views: Vec<StageView>,
    serial_args: ArgGroup,
    parallel_args: ArgGroup,
}

impl BuiltStage {
    fn view_indexes(&self, role: ArrayRole) -> Vec<usize> {
        self.views.iter().enumerate()
            .filter(|&(_, v)| v.role == role)
            .map(|(i, _)| i)
            .collect()
    }
}

fn role_flags(role: ArrayRole) -> FlagState {
    match role {
        ArrayRole::Input => FlagState { read: true, write: false, partial_read: false },
        ArrayRole::Output => FlagState { read: false, write: true, partial_read: false },
        ArrayRole::Internal | ArrayRole::Transition => FlagState::OFF,
    }
}

/// An N-stage pipeline bound to a single device.
///
/// `feed` advances every stage by one tick. Serial mode runs the stages
/// back to back with explicit transfer envelopes; parallel mode issues
/// transfer-only and kernel commands across the cruncher's asynchronous
/// queues with all I/O double-buffered, overlapping read, compute, and
/// write on the one accelerator.
pub struct DevicePipeline {
    facade: CruncherFacade,
    stages: Vec<BuiltStage>,
    serial_mode: bool,
    io_switch_counter: u64,
    parallel_primed: bool,
    async_pending: bool,
}

impl DevicePipeline {
    /// Compiles `kernel_source` for `device` with `queue_concurrency`
    /// asynchronous queues (clamped to `[1, 16]`).
    pub fn new(driver: Arc<dyn Driver>, device: Device, kernel_source: &str,
            queue_concurrency: usize) -> Result<DevicePipeline> {
        let facade = CruncherFacade::builder(driver, kernel_source)
            .devices(vec![device])
            .queue_concurrency(queue_concurrency)
            .build()?;
        Ok(DevicePipeline {
            facade: facade,
            stages: Vec::new(),
            serial_mode: false,
            io_switch_counter: 0,
            parallel_primed: false,
            async_pending: false,
        })
    }

    pub fn enable_serial_mode(&mut self) {
        self.serial_mode = true;
    }

    pub fn enable_parallel_mode(&mut self) {
        self.serial_mode = false;
    }

    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    pub fn io_switch_counter(&self) -> u64 {
        self.io_switch_counter
    }

    /// Queue-overlap profiling is not available from the driver contract.
    pub fn overlap_ratio(&self) -> Option<f64> {
        None
    }

    /// Appends a stage. A `Transition` array matching (by handle) an array
    /// of the previous stage re-uses that stage's duplicate, making the
    /// connection a pointer swap instead of a copy.
    pub fn add_stage(&mut self, desc: DeviceStage) -> Result<()> {
        if desc.kernel_names.is_empty() {
            return Error::err(format!(
                "DevicePipeline::add_stage(): stage '{}' has no kernels", desc.label));
        }
        if desc.kernel_names.len() != desc.globals.len()
                || desc.kernel_names.len() != desc.locals.len() {
            return Error::err(format!(
                "DevicePipeline::add_stage(): stage '{}' kernel/range count mismatch",
                desc.label));
        }

        let mut views = Vec::with_capacity(desc.bindings.len());
        for (array, role) in desc.bindings.into_iter() {
            let (serial, parallel) = match role {
                ArrayRole::Internal => {
                    let buf = StageBuffer::without_duplicate(array.clone());
                    (buf.clone(), buf)
                }
                ArrayRole::Transition => {
                    match self.find_previous_view(&array) {
                        Some((serial_prev, parallel_prev)) => {
                            (serial_prev, StageBuffer::aliasing(&parallel_prev)?)
                        }
                        None => {
                            let buf = StageBuffer::new(array.clone());
                            (buf.clone(), buf)
                        }
                    }
                }
                ArrayRole::Input | ArrayRole::Output => {
                    // Both sides are pipeline-owned; the user's array stays
                    // host-side and is shuttled by the feed copies.
                    let buf = StageBuffer::new(array.alloc_duplicate());
                    (buf.clone(), buf)
                }
            };
            let flags = role_flags(role);
            serial.flags().set_all(flags.read, flags.write, flags.partial_read);
            views.push(StageView {
                role: role,
                host: array,
                serial: serial,
                parallel: parallel,
            });
        }

        let serial_args = ArgGroup::from_buffers(views.iter().map(|v| v.serial.clone()));
        let parallel_args = ArgGroup::from_buffers(views.iter().map(|v| v.parallel.clone()));
        self.stages.push(BuiltStage {
            label: desc.label,
            kernel_names: desc.kernel_names,
            globals: desc.globals,
            locals: desc.locals,
            views: views,
            serial_args: serial_args,
            parallel_args: parallel_args,
        });
        Ok(())
    }

    fn find_previous_view(&self, array: &HostArray)
            -> Option<(Arc<StageBuffer>, Arc<StageBuffer>)> {
        let prev = self.stages.last()?;
        prev.views.iter()
            .find(|v| v.role != ArrayRole::Internal && v.host.ptr_eq(array))
            .map(|v| (v.serial.clone(), v.parallel.clone()))
    }

    /// Advances the pipeline by one tick in the current mode.
    pub fn feed(&mut self) -> Result<()> {
        self.dispatch_device_work()?;
        self.complete_feed()
    }

    /// Like `feed`, running `host_callback` concurrently with the flush.
    pub fn feed_async<F>(&mut self, host_callback: F) -> Result<()>
    where
        F: FnOnce() + Send,
    {
        self.dispatch_device_work()?;
        let scope_result = crossbeam::thread::scope(|scope| {
            scope.spawn(|_| host_callback());
            self.complete_feed()
        });
        match scope_result {
            Ok(result) => result,
            Err(_) => Error::err("DevicePipeline::feed_async(): host callback panicked"),
        }
    }

    /// Issues this tick's device work and returns without synchronising.
    pub fn feed_async_begin(&mut self) -> Result<()> {
        if self.async_pending {
            return Error::err("DevicePipeline::feed_async_begin(): a feed is already \
                in flight");
        }
        self.dispatch_device_work()?;
        self.async_pending = true;
        Ok(())
    }

    /// Synchronises the feed started by `feed_async_begin`.
    pub fn feed_async_end(&mut self) -> Result<()> {
        if !self.async_pending {
            return Error::err("DevicePipeline::feed_async_end(): no feed in flight");
        }
        self.async_pending = false;
        self.complete_feed()
    }

    fn dispatch_device_work(&mut self) -> Result<()> {
        if self.stages.is_empty() {
            return Error::err("DevicePipeline::feed(): no stages");
        }
        if self.serial_mode {
            self.dispatch_serial()
        } else {
            self.dispatch_parallel()
        }
    }

    fn complete_feed(&mut self) -> Result<()> {
        if !self.serial_mode {
            self.parallel_host_copies();
            for stage in &self.stages {
                for view in &stage.views {
                    if view.role == ArrayRole::Transition {
                        view.parallel.switch_buffers();
                    }
                }
            }
        }
        self.facade.finish();
        self.io_switch_counter += 1;
        Ok(())
    }

    /// Serial discipline: per stage, an explicit input transfer envelope,
    /// the kernels, then an output transfer envelope, all on one queue.
    fn dispatch_serial(&mut self) -> Result<()> {
        self.facade.set_enqueue_mode(true);
        for si in 0..self.stages.len() {
            let compute_id = si as u32 + 1;
            let first_global = self.stages[si].globals[0];
            let first_local = self.stages[si].locals[0];
            let names_joined = self.stages[si].kernel_names.join(" ");

            // Host data lands on the side the kernels will read.
            for view in &self.stages[si].views {
                if view.role == ArrayRole::Input {
                    let primary = view.serial.primary();
                    if !primary.ptr_eq(&view.host) {
                        primary.copy_from(&view.host)?;
                    }
                }
            }

            let input_idx = self.stages[si].view_indexes(ArrayRole::Input);
            let output_idx = self.stages[si].view_indexes(ArrayRole::Output);

            // Input envelope.
            {
                let stage = &mut self.stages[si];
                stage.serial_args.set_all_flags(FlagState::OFF);
                for &i in &input_idx {
                    stage.serial_args.set_entry_flags(i, role_flags(ArrayRole::Input));
                }
            }
            self.facade.set_no_compute_mode(true);
            self.facade.compute(&self.stages[si].serial_args, compute_id, &names_joined,
                first_global, first_local, 0)?;
            self.facade.set_no_compute_mode(false);
            self.stages[si].serial_args.set_all_flags(FlagState::OFF);

            // Kernels, in order, with transfers elided.
            for k in 0..self.stages[si].kernel_names.len() {
                let stage = &self.stages[si];
                let name = stage.kernel_names[k].clone();
                let (global, local) = (stage.globals[k], stage.locals[k]);
                self.facade.compute(&self.stages[si].serial_args, compute_id, &name,
                    global, local, 0)?;
            }

            // Output envelope.
            {
                let stage = &mut self.stages[si];
                for &i in &output_idx {
                    stage.serial_args.set_entry_flags(i, role_flags(ArrayRole::Output));
                }
            }
            self.facade.set_no_compute_mode(true);
            self.facade.compute(&self.stages[si].serial_args, compute_id, &names_joined,
                first_global, first_local, 0)?;
            self.facade.set_no_compute_mode(false);
            self.stages[si].serial_args.set_all_flags(FlagState::OFF);

            // Results back to the host arrays.
            for view in &self.stages[si].views {
                if view.role == ArrayRole::Output {
                    let primary = view.serial.primary();
                    if !primary.ptr_eq(&view.host) {
                        view.host.copy_from(&primary)?;
                    }
                }
            }
        }
        self.facade.set_enqueue_mode(false);
        Ok(())
    }

    /// Parallel discipline: transfer-only dispatches and kernel dispatches
    /// interleaved across queues, with I/O sides switched mid-stage so the
    /// shuttle and the compute never share a side.
    fn dispatch_parallel(&mut self) -> Result<()> {
        if !self.parallel_primed {
            // Alternate buffer parity between adjacent stages.
            for (si, stage) in self.stages.iter().enumerate() {
                if si % 2 == 0 {
                    for view in &stage.views {
                        view.parallel.switch_buffers();
                    }
                }
            }
            self.parallel_primed = true;
        }

        for si in 0..self.stages.len() {
            let compute_id = si as u32 + 1;
            let first_global = self.stages[si].globals[0];
            let first_local = self.stages[si].locals[0];
            let names_joined = self.stages[si].kernel_names.join(" ");
            let io_idx: Vec<usize> = {
                let stage = &self.stages[si];
                stage.views.iter().enumerate()
                    .filter(|&(_, v)| v.role == ArrayRole::Input || v.role == ArrayRole::Output)
                    .map(|(i, _)| i)
                    .collect()
            };

            // Transfer-only pass over the active I/O sides.
            self.facade.set_enqueue_mode_async(true);
            self.facade.set_no_compute_mode(true);
            {
                let stage = &mut self.stages[si];
                stage.parallel_args.set_all_flags(FlagState::OFF);
                for &i in &io_idx {
                    let role = stage.views[i].role;
                    stage.parallel_args.set_entry_flags(i, role_flags(role));
                }
            }
            self.facade.compute(&self.stages[si].parallel_args, compute_id, &names_joined,
                first_global, first_local, 0)?;
            self.facade.flush();

            for &i in &io_idx {
                self.stages[si].views[i].parallel.switch_buffers();
            }
            self.stages[si].parallel_args.set_all_flags(FlagState::OFF);
            self.facade.flush();

            // Kernel pass.
            self.facade.set_no_compute_mode(false);
            for k in 0..self.stages[si].kernel_names.len() {
                let stage = &self.stages[si];
                let name = stage.kernel_names[k].clone();
                let (global, local) = (stage.globals[k], stage.locals[k]);
                self.facade.compute(&self.stages[si].parallel_args, compute_id, &name,
                    global, local, 0)?;
            }
            self.facade.flush();
            self.facade.set_enqueue_mode_async(false);
        }
        Ok(())
    }

    /// Host arrays to idle entrance duplicates and idle exit duplicates to
    /// host arrays, fanned out across stages.
    fn parallel_host_copies(&self) {
        self.stages.par_iter().for_each(|stage| {
            for view in &stage.views {
                match view.role {
                    ArrayRole::Input => {
                        if let Some(dup) = view.parallel.switched_buffer() {
                            if let Err(err) = dup.copy_from(&view.host) {
                                error!("DevicePipeline: stage '{}' input: {}",
                                    stage.label, err);
                            }
                        }
                    }
                    ArrayRole::Output => {
                        if let Some(dup) = view.parallel.switched_buffer() {
                            if let Err(err) = view.host.copy_from(&dup) {
                                error!("DevicePipeline: stage '{}' output: {}",
                                    stage.label, err);
                            }
                        }
                    }
                    _ => {}
                }
            }
        });
    }
}
