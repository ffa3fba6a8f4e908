//! A pipeline stage: one compiled kernel set, its devices, and its buffers.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use log::{error, warn};
use parking_lot::Mutex;

use crate::args::{ArgGroup, Compute, FlagState};
use crate::driver::{CompileLock, Device, Driver};
use crate::element::HostArray;
use crate::error::{Error, Result};
use crate::facade::CruncherFacade;
use crate::pipeline::Pipeline;
use crate::stage_buffer::StageBuffer;

struct Bindings {
    source: String,
    kernel_names: Vec<String>,
    globals: Vec<usize>,
    locals: Vec<usize>,
    init_names: Vec<String>,
    init_globals: Vec<usize>,
    init_locals: Vec<usize>,
    init_enabled: bool,
}

impl Bindings {
    fn empty() -> Bindings {
        Bindings {
            source: String::new(),
            kernel_names: Vec::new(),
            globals: Vec::new(),
            locals: Vec::new(),
            init_names: Vec::new(),
            init_globals: Vec::new(),
            init_locals: Vec::new(),
            init_enabled: true,
        }
    }
}

struct RunState {
    facade: Option<CruncherFacade>,
    args: Option<ArgGroup>,
    build_failed: bool,
    init_complete: bool,
    last_millis: f64,
    n_inputs: usize,
    n_outputs: usize,
}

/// One stage of a multi-device pipeline.
///
/// A stage owns the kernels it launches, the devices they run on, and three
/// buffer lists bound in kernel-signature order: `inputs ++ hidden ++
/// outputs`. Its cruncher is built lazily on the first `run`. Stages link
/// into a chain with [`prepend_to_stage`]/[`append_to_stage`] and the chain
/// is finalised by [`make_pipeline`].
///
/// A chain is kept alive from its root: each stage holds its next stages
/// strongly and its previous stage weakly, so hold on to the first stage (or
/// the built [`Pipeline`]) while the chain is in use.
///
/// [`prepend_to_stage`]: PipelineStage::prepend_to_stage
/// [`append_to_stage`]: PipelineStage::append_to_stage
/// [`make_pipeline`]: PipelineStage::make_pipeline
pub struct PipelineStage {
    driver: Arc<dyn Driver>,
    lock: CompileLock,
    devices: Mutex<Vec<Device>>,
    bindings: Mutex<Bindings>,
    inputs: Mutex<Vec<Arc<StageBuffer>>>,
    outputs: Mutex<Vec<Arc<StageBuffer>>>,
    hidden: Mutex<Vec<Arc<StageBuffer>>>,
    prev: Mutex<Weak<PipelineStage>>,
    nexts: Mutex<Vec<Arc<PipelineStage>>>,
    stage_order: AtomicUsize,
    enqueue_mode: AtomicBool,
    stop_host_device_transmission: AtomicBool,
    run_state: Mutex<RunState>,
}

impl PipelineStage {
    pub fn new(driver: Arc<dyn Driver>) -> Arc<PipelineStage> {
        PipelineStage::with_lock(driver, CompileLock::new())
    }

    /// Like `new`, sharing a compile lock with other construction sites.
    pub fn with_lock(driver: Arc<dyn Driver>, lock: CompileLock) -> Arc<PipelineStage> {
        Arc::new(PipelineStage {
            driver: driver,
            lock: lock,
            devices: Mutex::new(Vec::new()),
            bindings: Mutex::new(Bindings::empty()),
            inputs: Mutex::new(Vec::new()),
            outputs: Mutex::new(Vec::new()),
            hidden: Mutex::new(Vec::new()),
            prev: Mutex::new(Weak::new()),
            nexts: Mutex::new(Vec::new()),
            stage_order: AtomicUsize::new(0),
            enqueue_mode: AtomicBool::new(false),
            stop_host_device_transmission: AtomicBool::new(false),
            run_state: Mutex::new(RunState {
                facade: None,
                args: None,
                build_failed: false,
                init_complete: false,
                last_millis: 0.0,
                n_inputs: 0,
                n_outputs: 0,
            }),
        })
    }

    pub fn add_devices(&self, devices: &[Device]) {
        self.devices.lock().extend(devices.iter().cloned());
    }

    /// Binds the stage's kernel source and its ordered kernel set. Range
    /// counts are validated at first run, not here.
    pub fn add_kernels(&self, source: &str, names: &[&str], globals: &[usize],
            locals: &[usize]) {
        let mut b = self.bindings.lock();
        b.source = source.to_string();
        b.kernel_names = names.iter().map(|n| n.to_string()).collect();
        b.globals = globals.to_vec();
        b.locals = locals.to_vec();
    }

    /// Kernels run only while the pipeline is being built (twice, once per
    /// buffer side).
    pub fn initializer_kernel(&self, names: &[&str], globals: &[usize], locals: &[usize]) {
        let mut b = self.bindings.lock();
        b.init_names = names.iter().map(|n| n.to_string()).collect();
        b.init_globals = globals.to_vec();
        b.init_locals = locals.to_vec();
    }

    pub fn add_input_buffers(&self, arrays: &[HostArray]) {
        let mut inputs = self.inputs.lock();
        for array in arrays {
            inputs.push(StageBuffer::new(array.clone()));
        }
    }

    pub fn add_output_buffers(&self, arrays: &[HostArray]) {
        let mut outputs = self.outputs.lock();
        for array in arrays {
            outputs.push(StageBuffer::new(array.clone()));
        }
    }

    /// Hidden buffers persist sequential state on the stage; they have no
    /// duplicate and never take part in forwarding.
    pub fn add_hidden_buffers(&self, arrays: &[HostArray]) {
        let mut hidden = self.hidden.lock();
        for array in arrays {
            hidden.push(StageBuffer::without_duplicate(array.clone()));
        }
    }

    /// Links `self` in front of `next`.
    pub fn prepend_to_stage(self: &Arc<Self>, next: &Arc<PipelineStage>) {
        self.nexts.lock().push(next.clone());
        *next.prev.lock() = Arc::downgrade(self);
    }

    /// Links `self` behind `prev`.
    pub fn append_to_stage(self: &Arc<Self>, prev: &Arc<PipelineStage>) {
        prev.nexts.lock().push(self.clone());
        *self.prev.lock() = Arc::downgrade(prev);
    }

    pub fn set_enqueue_mode(&self, on: bool) {
        self.enqueue_mode.store(on, Ordering::Relaxed);
    }

    /// Suppresses every host↔device transfer this stage would issue; for
    /// data sets that live on the devices for the whole pipeline lifetime.
    pub fn set_stop_host_device_transmission(&self, on: bool) {
        self.stop_host_device_transmission.store(on, Ordering::Relaxed);
    }

    pub fn stage_order(&self) -> usize {
        self.stage_order.load(Ordering::Relaxed)
    }

    /// Wall-clock of the most recent `run`, for debug output.
    pub fn last_run_millis(&self) -> f64 {
        self.run_state.lock().last_millis
    }

    pub fn input_buffers(&self) -> Vec<Arc<StageBuffer>> {
        self.inputs.lock().clone()
    }

    pub fn output_buffers(&self) -> Vec<Arc<StageBuffer>> {
        self.outputs.lock().clone()
    }

    pub fn hidden_buffers(&self) -> Vec<Arc<StageBuffer>> {
        self.hidden.lock().clone()
    }

    /// Launches this stage's kernels (or its initializer kernels when
    /// `init_mode` is set) against the current primary sides.
    ///
    /// Binding problems are logged and leave the stage inert rather than
    /// poisoning the pipeline.
    pub fn run(&self, init_mode: bool) -> Result<()> {
        if init_mode && !self.has_init_work() {
            return Ok(());
        }

        let mut rs = self.run_state.lock();
        if rs.build_failed {
            return Ok(());
        }
        if rs.facade.is_none() {
            if let Err(err) = self.build_run_state(&mut rs) {
                error!("PipelineStage::run(): {}", err);
                rs.build_failed = true;
                return Ok(());
            }
            // Validation may have just disabled the initializers.
            if init_mode && !self.has_init_work() {
                return Ok(());
            }
        }

        let started = Instant::now();
        let b = self.bindings.lock();
        let (names, globals, locals) = if init_mode {
            (&b.init_names, &b.init_globals, &b.init_locals)
        } else {
            (&b.kernel_names, &b.globals, &b.locals)
        };
        let count = names.len().min(globals.len()).min(locals.len());
        let compute_id = self.stage_order.load(Ordering::Relaxed) as u32 + 1;
        let enqueue = self.enqueue_mode.load(Ordering::Relaxed);
        let silent = self.stop_host_device_transmission.load(Ordering::Relaxed);

        let RunState { ref mut facade, ref mut args, ref n_inputs, ref n_outputs, .. } = *rs;
        let facade = facade.as_mut().expect("stage facade");
        let args = args.as_mut().expect("stage args");
        facade.set_enqueue_mode(enqueue);

        for k in 0..count {
            if silent {
                args.set_all_flags(FlagState::OFF);
            } else if enqueue && !init_mode {
                // One device read of the inputs before the first kernel, one
                // write of the outputs after the last, nothing in between.
                args.set_all_flags(FlagState::OFF);
                if k == 0 {
                    for i in 0..*n_inputs {
                        args.set_entry_flags(i, FlagState {
                            read: true, write: false, partial_read: false,
                        });
                    }
                }
                if k + 1 == count {
                    let first_output = args.len() - *n_outputs;
                    for i in first_output..args.len() {
                        args.set_entry_flags(i, FlagState {
                            read: false, write: true, partial_read: false,
                        });
                    }
                }
            } else {
                args.refresh_flags();
            }

            let result = if args.len() == 1 {
                let single = args.entry(0).expect("single arg").buffer.clone();
                single.compute(facade, compute_id, &names[k], globals[k], locals[k], 0)
            } else {
                facade.compute(args, compute_id, &names[k], globals[k], locals[k], 0)
            };
            if let Err(err) = result {
                error!("PipelineStage::run(): kernel '{}': {}", names[k], err);
                break;
            }
        }

        rs.last_millis = started.elapsed().as_secs_f64() * 1.0e3;
        if init_mode {
            rs.init_complete = true;
        }
        Ok(())
    }

    fn has_init_work(&self) -> bool {
        let b = self.bindings.lock();
        b.init_enabled && !b.init_names.is_empty()
    }

    /// First-run construction: range validation, flag defaults, the
    /// argument chain, and the cruncher itself.
    fn build_run_state(&self, rs: &mut RunState) -> Result<()> {
        {
            let mut b = self.bindings.lock();
            let main_mismatch = b.kernel_names.len() != b.globals.len()
                || b.kernel_names.len() != b.locals.len();
            let init_mismatch = b.init_names.len() != b.init_globals.len()
                || b.init_names.len() != b.init_locals.len();
            if main_mismatch || init_mismatch {
                warn!("PipelineStage: kernel range count does not match kernel name \
                    count; initializer kernels disabled");
                b.init_enabled = false;
            }
        }

        let devices = self.devices.lock().clone();
        if devices.is_empty() {
            return Error::err("no devices bound to stage");
        }
        let source = self.bindings.lock().source.clone();

        let inputs = self.inputs.lock().clone();
        let outputs = self.outputs.lock().clone();
        let hidden = self.hidden.lock().clone();
        for buf in &inputs {
            buf.flags().set_all(true, false, false);
        }
        for buf in &outputs {
            buf.flags().set_all(false, true, false);
        }
        for buf in &hidden {
            buf.flags().set_all(false, false, false);
        }

        // Driver pipelining stays off; stage overlap comes from the
        // pipeline's own double buffering.
        let facade = CruncherFacade::builder(self.driver.clone(), source)
            .lock(self.lock.clone())
            .devices(devices)
            .no_pipelining(true)
            .build()?;

        rs.n_inputs = inputs.len();
        rs.n_outputs = outputs.len();
        let chained = inputs.into_iter().chain(hidden.into_iter()).chain(outputs.into_iter());
        rs.args = Some(ArgGroup::from_buffers(chained));
        rs.facade = Some(facade);
        Ok(())
    }

    pub fn switch_input_buffers(&self) {
        for buf in self.inputs.lock().iter() {
            buf.switch_buffers();
        }
    }

    pub fn switch_output_buffers(&self) {
        for buf in self.outputs.lock().iter() {
            buf.switch_buffers();
        }
    }

    pub(crate) fn switch_all_buffers(&self) {
        self.switch_input_buffers();
        self.switch_output_buffers();
    }

    /// Shuttles the passive buffer sides across this stage's boundaries:
    /// host arrays into the entry stage, the exit stage out to host arrays,
    /// and this stage's output duplicates into every next stage's input
    /// duplicates. Primaries are never touched here; the concurrent `run`
    /// owns them.
    ///
    /// Validation failures are logged and abort the remaining copies of the
    /// offending list without raising.
    pub fn forward_results(&self, index: usize, max_index: usize,
            host_inputs: Option<&[HostArray]>, host_outputs: Option<&[HostArray]>) {
        if index == 0 {
            if let Some(host) = host_inputs {
                self.fill_entry_inputs(host);
            }
        }

        if index == max_index {
            if let Some(host) = host_outputs {
                self.drain_exit_outputs(host);
            }
        }

        let nexts = self.nexts.lock();
        if !nexts.is_empty() {
            let outputs = self.outputs.lock();
            for next in nexts.iter() {
                self.forward_to(next, &outputs);
            }
        }
    }

    fn fill_entry_inputs(&self, host: &[HostArray]) {
        let inputs = self.inputs.lock();
        if host.len() != inputs.len() {
            error!("forward_results(): {} host input arrays bound to {} stage inputs",
                host.len(), inputs.len());
            return;
        }
        for (i, (array, buf)) in host.iter().zip(inputs.iter()).enumerate() {
            let dst = match buf.switched_buffer() {
                Some(dst) => dst,
                None => {
                    error!("forward_results(): entry input {} has no duplicate", i);
                    return;
                }
            };
            if let Err(err) = dst.copy_from(array) {
                error!("forward_results(): host input {}: {}", i, err);
                return;
            }
        }
    }

    fn drain_exit_outputs(&self, host: &[HostArray]) {
        let outputs = self.outputs.lock();
        if host.len() != outputs.len() {
            error!("forward_results(): {} host output arrays bound to {} stage outputs",
                host.len(), outputs.len());
            return;
        }
        for (i, (array, buf)) in host.iter().zip(outputs.iter()).enumerate() {
            let src = match buf.switched_buffer() {
                Some(src) => src,
                None => {
                    error!("forward_results(): exit output {} has no duplicate", i);
                    return;
                }
            };
            if let Err(err) = array.copy_from(&src) {
                error!("forward_results(): host output {}: {}", i, err);
                return;
            }
        }
    }

    fn forward_to(&self, next: &Arc<PipelineStage>, outputs: &[Arc<StageBuffer>]) {
        let next_inputs = next.inputs.lock();
        if next_inputs.len() != outputs.len() {
            error!("forward_results(): {} outputs feed a stage with {} inputs",
                outputs.len(), next_inputs.len());
            return;
        }
        for (i, (out, inp)) in outputs.iter().zip(next_inputs.iter()).enumerate() {
            if out.kind().is_struct() {
                panic!("struct-array forwarding across stage edges is not implemented");
            }
            let src = match out.switched_buffer() {
                Some(src) => src,
                None => {
                    error!("forward_results(): edge output {} has no duplicate", i);
                    return;
                }
            };
            let dst = match inp.switched_buffer() {
                Some(dst) => dst,
                None => {
                    error!("forward_results(): edge input {} has no duplicate", i);
                    return;
                }
            };
            if let Err(err) = dst.copy_from(&src) {
                error!("forward_results(): edge {}: {}", i, err);
                return;
            }
        }
    }

    /// Finalises the chain containing this stage into a [`Pipeline`].
    ///
    /// Walks back to the chain root, orders the stages, then initialises
    /// every buffer twice — initializers, switch, initializers again, switch
    /// back — so both sides start identical.
    pub fn make_pipeline(self: &Arc<Self>) -> Result<Pipeline> {
        let mut root = self.clone();
        let mut seen: Vec<*const PipelineStage> = vec![Arc::as_ptr(&root)];
        loop {
            let prev = root.prev.lock().upgrade();
            match prev {
                Some(p) => {
                    if seen.contains(&Arc::as_ptr(&p)) {
                        return Error::err("make_pipeline(): stage chain contains a cycle");
                    }
                    seen.push(Arc::as_ptr(&p));
                    root = p;
                }
                None => break,
            }
        }

        let mut stages = vec![root.clone()];
        let mut cur = root;
        loop {
            let next = {
                let nexts = cur.nexts.lock();
                match nexts.len() {
                    0 => None,
                    1 => Some(nexts[0].clone()),
                    _ => {
                        return Error::err("make_pipeline(): parallel stages within a \
                            layer are not supported; chains must be linear");
                    }
                }
            };
            match next {
                Some(n) => {
                    if stages.iter().any(|s| Arc::ptr_eq(s, &n)) {
                        return Error::err("make_pipeline(): stage chain contains a cycle");
                    }
                    stages.push(n.clone());
                    cur = n;
                }
                None => break,
            }
        }

        for (order, stage) in stages.iter().enumerate() {
            stage.stage_order.store(order, Ordering::Relaxed);
        }

        // Initialise both buffer sides identically.
        for stage in &stages {
            stage.run(true)?;
        }
        for stage in &stages {
            stage.switch_all_buffers();
        }
        for stage in &stages {
            stage.run(true)?;
        }
        for stage in &stages {
            stage.switch_all_buffers();
        }

        Ok(Pipeline::new(stages))
    }
}
