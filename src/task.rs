//! Deferred compute calls, their groupings, and reusable pools.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::args::{ArgGroup, FlagState};
use crate::driver::PipelineType;
use crate::error::Result;
use crate::facade::CruncherFacade;
use crate::stage_buffer::StageBuffer;

/// The target of a captured compute call.
#[derive(Clone)]
pub enum ComputeTarget {
    Buffer(Arc<StageBuffer>),
    Group(ArgGroup),
}

impl From<ArgGroup> for ComputeTarget {
    fn from(group: ArgGroup) -> ComputeTarget {
        ComputeTarget::Group(group)
    }
}

impl From<Arc<StageBuffer>> for ComputeTarget {
    fn from(buffer: Arc<StageBuffer>) -> ComputeTarget {
        ComputeTarget::Buffer(buffer)
    }
}

impl ComputeTarget {
    fn to_arg_group(&self) -> ArgGroup {
        match *self {
            ComputeTarget::Buffer(ref buf) => {
                let mut group = ArgGroup::new();
                group.push(buf.clone());
                group
            }
            ComputeTarget::Group(ref group) => group.clone(),
        }
    }
}

/// One quantum of a task's read-compute-write envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskPhase {
    Read,
    Compute,
    Write,
}

/// A captured compute call, immutable after construction.
///
/// Construction is builder-style; [`freeze`] snapshots the target's current
/// flag and stride state so later mutations of the underlying buffers do
/// not leak into the deferred call.
///
/// [`freeze`]: Task::freeze
pub struct Task {
    target: ComputeTarget,
    compute_id: u32,
    kernel_names: String,
    global: usize,
    local: usize,
    offset_global: usize,
    pipelined: bool,
    pipeline_type: PipelineType,
    pipeline_blobs: usize,
    flags_snapshot: Option<Vec<FlagState>>,
    strides_snapshot: Option<Vec<usize>>,
    priority: u32,
}

impl Task {
    pub fn new<T, S>(target: T, compute_id: u32, kernel_names: S, global: usize,
            local: usize) -> Task
    where
        T: Into<ComputeTarget>,
        S: Into<String>,
    {
        Task {
            target: target.into(),
            compute_id: compute_id,
            kernel_names: kernel_names.into(),
            global: global,
            local: local,
            offset_global: 0,
            pipelined: false,
            pipeline_type: PipelineType::default(),
            pipeline_blobs: 0,
            flags_snapshot: None,
            strides_snapshot: None,
            priority: 0,
        }
    }

    pub fn with_offset(mut self, offset_global: usize) -> Task {
        self.offset_global = offset_global;
        self
    }

    /// Priority consumed by priority-based work selection; higher wins.
    pub fn with_priority(mut self, priority: u32) -> Task {
        self.priority = priority;
        self
    }

    /// Marks the call as driver-pipelined, split into `blobs` slices.
    pub fn pipelined(mut self, blobs: usize) -> Task {
        self.pipelined = true;
        self.pipeline_blobs = blobs;
        self
    }

    /// Overrides how a pipelined call overlaps its blobs.
    pub fn with_pipeline_type(mut self, pipeline_type: PipelineType) -> Task {
        self.pipeline_type = pipeline_type;
        self
    }

    /// Snapshots the target's current flag and stride state.
    pub fn freeze(mut self) -> Task {
        let group = self.target.to_arg_group();
        self.flags_snapshot = Some(group.snapshot_flags());
        self.strides_snapshot = Some(group.strides());
        self
    }

    pub fn compute_id(&self) -> u32 {
        self.compute_id
    }

    pub fn kernel_names(&self) -> &str {
        &self.kernel_names
    }

    pub fn global(&self) -> usize {
        self.global
    }

    pub fn local(&self) -> usize {
        self.local
    }

    pub fn priority(&self) -> u32 {
        self.priority
    }

    pub fn is_pipelined(&self) -> bool {
        self.pipelined
    }

    pub fn pipeline_type(&self) -> PipelineType {
        self.pipeline_type
    }

    pub fn pipeline_blobs(&self) -> usize {
        self.pipeline_blobs
    }

    /// Work-item cost estimate: global range over the widest argument
    /// stride. Shortest-job-first ranks by this.
    pub fn cost(&self) -> usize {
        let strides = match self.strides_snapshot {
            Some(ref s) => s.clone(),
            None => self.target.to_arg_group().strides(),
        };
        let widest = strides.into_iter().max().unwrap_or(1).max(1);
        self.global / widest
    }

    /// Forwards the frozen call to `facade`, pipelining envelope included.
    pub fn compute(&self, facade: &mut CruncherFacade) -> Result<()> {
        let mut group = self.target.to_arg_group();
        if let Some(ref snapshot) = self.flags_snapshot {
            group.apply_flags(snapshot)?;
        }
        facade.compute_pipelined(&group, self.compute_id, &self.kernel_names,
            self.global, self.local, self.offset_global, self.pipelined,
            self.pipeline_type, self.pipeline_blobs)
    }

    /// Issues a single quantum of the call: one transfer direction, or the
    /// kernel launches with transfers elided.
    pub fn compute_phase(&self, facade: &mut CruncherFacade, phase: TaskPhase) -> Result<()> {
        let mut group = self.target.to_arg_group();
        if let Some(ref snapshot) = self.flags_snapshot {
            group.apply_flags(snapshot)?;
        }
        let result = match phase {
            TaskPhase::Read => {
                for i in 0..group.len() {
                    let mut state = group.entry(i).expect("arg entry").flag_state();
                    state.write = false;
                    group.set_entry_flags(i, state);
                }
                facade.set_no_compute_mode(true);
                let r = facade.compute_pipelined(&group, self.compute_id,
                    &self.kernel_names, self.global, self.local, self.offset_global,
                    self.pipelined, self.pipeline_type, self.pipeline_blobs);
                facade.set_no_compute_mode(false);
                r
            }
            TaskPhase::Compute => {
                facade.set_enqueue_mode(true);
                let r = facade.compute_pipelined(&group, self.compute_id,
                    &self.kernel_names, self.global, self.local, self.offset_global,
                    self.pipelined, self.pipeline_type, self.pipeline_blobs);
                facade.set_enqueue_mode(false);
                r
            }
            TaskPhase::Write => {
                for i in 0..group.len() {
                    let mut state = group.entry(i).expect("arg entry").flag_state();
                    state.read = false;
                    state.partial_read = false;
                    group.set_entry_flags(i, state);
                }
                facade.set_no_compute_mode(true);
                let r = facade.compute_pipelined(&group, self.compute_id,
                    &self.kernel_names, self.global, self.local, self.offset_global,
                    self.pipelined, self.pipeline_type, self.pipeline_blobs);
                facade.set_no_compute_mode(false);
                r
            }
        };
        result
    }
}

/// Execution policy of a task group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskGroupKind {
    /// Drain this group before serving a sibling group from the same pool.
    Complete,
    /// No constraint between groups.
    Async,
    /// All tasks go to one consumer; which one is free.
    SameDevice,
    /// `SameDevice`, with the chosen consumer remembered across resets.
    RepeatSameDevice,
    /// One consumer, one in-order command queue.
    InOrder,
    /// `InOrder`, with the device and queue binding kept across resets.
    RepeatInOrder,
}

impl TaskGroupKind {
    pub fn same_device(self) -> bool {
        match self {
            TaskGroupKind::SameDevice
            | TaskGroupKind::RepeatSameDevice
            | TaskGroupKind::InOrder
            | TaskGroupKind::RepeatInOrder => true,
            _ => false,
        }
    }

    pub fn in_order(self) -> bool {
        match self {
            TaskGroupKind::InOrder | TaskGroupKind::RepeatInOrder => true,
            _ => false,
        }
    }

    pub fn repeats(self) -> bool {
        match self {
            TaskGroupKind::RepeatSameDevice | TaskGroupKind::RepeatInOrder => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GroupBinding {
    pub device: Option<usize>,
    pub queue: Option<usize>,
}

/// An ordered list of tasks under one execution policy.
pub struct TaskGroup {
    kind: TaskGroupKind,
    tasks: Mutex<Vec<Arc<Task>>>,
    binding: Mutex<GroupBinding>,
}

impl TaskGroup {
    pub fn new(kind: TaskGroupKind) -> Arc<TaskGroup> {
        Arc::new(TaskGroup {
            kind: kind,
            tasks: Mutex::new(Vec::new()),
            binding: Mutex::new(GroupBinding::default()),
        })
    }

    pub fn kind(&self) -> TaskGroupKind {
        self.kind
    }

    pub fn add(&self, task: Task) -> Arc<Task> {
        let task = Arc::new(task);
        self.tasks.lock().push(task.clone());
        task
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.lock().is_empty()
    }

    pub fn tasks(&self) -> Vec<Arc<Task>> {
        self.tasks.lock().clone()
    }

    pub fn binding(&self) -> GroupBinding {
        *self.binding.lock()
    }

    /// Records the consumer (and optionally queue) chosen at first dispatch.
    pub fn bind(&self, device: usize, queue: Option<usize>) {
        let mut binding = self.binding.lock();
        if binding.device.is_none() {
            binding.device = Some(device);
            binding.queue = queue;
        }
    }

    pub(crate) fn clear_binding_unless_repeat(&self) {
        if !self.kind.repeats() {
            *self.binding.lock() = GroupBinding::default();
        }
    }
}

/// Consumption policy of a pool as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskPoolKind {
    /// Once selected, consumers keep pulling from this pool until empty.
    Complete,
    /// Any device may round-robin across pools at any time.
    Async,
    /// Devices rotate pools on every step.
    Sync,
}

/// A task handed out by a pool, with the group it came from (if any).
#[derive(Clone)]
pub struct Dispatch {
    pub task: Arc<Task>,
    pub group: Option<Arc<TaskGroup>>,
}

struct Entry {
    task: Arc<Task>,
    group: Option<Arc<TaskGroup>>,
    dispatched: bool,
}

struct PoolState {
    entries: Vec<Entry>,
    counter: usize,
}

/// An append-only, reusable list of tasks and groups.
///
/// `counter` advances monotonically as tasks are handed out; `reset`
/// rewinds it without clearing the list, so a drained pool can be run
/// again. Groups are snapshotted when added.
pub struct TaskPool {
    kind: TaskPoolKind,
    state: Mutex<PoolState>,
}

impl TaskPool {
    pub fn new(kind: TaskPoolKind) -> Arc<TaskPool> {
        Arc::new(TaskPool {
            kind: kind,
            state: Mutex::new(PoolState { entries: Vec::new(), counter: 0 }),
        })
    }

    pub fn kind(&self) -> TaskPoolKind {
        self.kind
    }

    /// Appends a lone task.
    pub fn feed(&self, task: Task) -> Arc<Task> {
        let task = Arc::new(task);
        self.state.lock().entries.push(Entry {
            task: task.clone(),
            group: None,
            dispatched: false,
        });
        task
    }

    /// Appends every task currently in `group`, in order.
    pub fn add_group(&self, group: &Arc<TaskGroup>) {
        let tasks = group.tasks();
        let mut state = self.state.lock();
        for task in tasks {
            state.entries.push(Entry {
                task: task,
                group: Some(group.clone()),
                dispatched: false,
            });
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    /// Tasks not yet handed out.
    pub fn remaining(&self) -> usize {
        let state = self.state.lock();
        state.entries.len().saturating_sub(state.counter)
    }

    /// Rewinds the pool for another run. Group device bindings are cleared
    /// except for repeat-kind groups.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.counter = 0;
        let mut cleared: Vec<*const TaskGroup> = Vec::new();
        for entry in state.entries.iter_mut() {
            entry.dispatched = false;
            if let Some(ref group) = entry.group {
                let ptr = Arc::as_ptr(group);
                if !cleared.contains(&ptr) {
                    group.clear_binding_unless_repeat();
                    cleared.push(ptr);
                }
            }
        }
    }

    /// Index range the next selection may draw from: while a `Complete`
    /// group is partially drained, only its entries are eligible.
    fn eligible<'a>(state: &'a PoolState) -> Box<dyn Iterator<Item = usize> + 'a> {
        let gate: Option<*const TaskGroup> = state.entries.iter()
            .filter_map(|e| e.group.as_ref())
            .filter(|g| g.kind() == TaskGroupKind::Complete)
            .find(|&g| {
                let (mut done, mut open) = (false, false);
                for e in &state.entries {
                    if let Some(ref eg) = e.group {
                        if Arc::ptr_eq(eg, g) {
                            if e.dispatched { done = true } else { open = true }
                        }
                    }
                }
                done && open
            })
            .map(|g| Arc::as_ptr(g));

        match gate {
            Some(ptr) => Box::new(state.entries.iter().enumerate()
                .filter(move |&(_, e)| {
                    !e.dispatched && e.group.as_ref()
                        .map(|g| Arc::as_ptr(g) == ptr)
                        .unwrap_or(false)
                })
                .map(|(i, _)| i)),
            None => Box::new(state.entries.iter().enumerate()
                .filter(|&(_, e)| !e.dispatched)
                .map(|(i, _)| i)),
        }
    }

    fn take(state: &mut PoolState, index: usize) -> Dispatch {
        state.entries[index].dispatched = true;
        state.counter += 1;
        Dispatch {
            task: state.entries[index].task.clone(),
            group: state.entries[index].group.clone(),
        }
    }

    /// First-come-first-serve selection.
    pub fn next_dispatch(&self) -> Option<Dispatch> {
        let mut state = self.state.lock();
        let index = Self::eligible(&state).next()?;
        Some(Self::take(&mut state, index))
    }

    /// Smallest `cost()` among the remaining tasks.
    pub fn take_shortest(&self) -> Option<Dispatch> {
        let mut state = self.state.lock();
        let index = Self::eligible(&state)
            .min_by_key(|&i| state.entries[i].task.cost())?;
        Some(Self::take(&mut state, index))
    }

    /// Highest priority among the remaining tasks; ties keep feed order.
    pub fn take_priority(&self) -> Option<Dispatch> {
        let mut state = self.state.lock();
        let index = Self::eligible(&state)
            .max_by_key(|&i| (state.entries[i].task.priority(), usize::MAX - i))?;
        Some(Self::take(&mut state, index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args::ArgGroup;
    use crate::element::HostArray;
    use crate::stage_buffer::StageBuffer;

    fn dummy_task(global: usize) -> Task {
        let buf = StageBuffer::new(HostArray::from_vec(vec![0.0f32; global]));
        Task::new(buf, 1, "noop", global, 0)
    }

    #[test]
    fn remaining_is_monotonic_and_resets() {
        let pool = TaskPool::new(TaskPoolKind::Async);
        for _ in 0..4 {
            pool.feed(dummy_task(8));
        }
        assert_eq!(pool.remaining(), 4);

        let mut last = pool.remaining();
        while let Some(_) = pool.next_dispatch() {
            let now = pool.remaining();
            assert!(now < last);
            last = now;
        }
        assert_eq!(pool.remaining(), 0);
        assert!(pool.next_dispatch().is_none());

        pool.reset();
        assert_eq!(pool.remaining(), 4);
        assert!(pool.next_dispatch().is_some());
    }

    #[test]
    fn shortest_job_first_ranks_by_cost() {
        let pool = TaskPool::new(TaskPoolKind::Async);
        pool.feed(dummy_task(64));
        pool.feed(dummy_task(8));
        pool.feed(dummy_task(32));

        assert_eq!(pool.take_shortest().unwrap().task.global(), 8);
        assert_eq!(pool.take_shortest().unwrap().task.global(), 32);
        assert_eq!(pool.take_shortest().unwrap().task.global(), 64);
    }

    #[test]
    fn priority_selection_prefers_higher() {
        let pool = TaskPool::new(TaskPoolKind::Async);
        pool.feed(dummy_task(8).with_priority(1));
        pool.feed(dummy_task(8).with_priority(9));
        pool.feed(dummy_task(8).with_priority(5));

        assert_eq!(pool.take_priority().unwrap().task.priority(), 9);
        assert_eq!(pool.take_priority().unwrap().task.priority(), 5);
        assert_eq!(pool.take_priority().unwrap().task.priority(), 1);
    }

    #[test]
    fn complete_group_gates_selection() {
        let pool = TaskPool::new(TaskPoolKind::Async);
        let group = TaskGroup::new(TaskGroupKind::Complete);
        group.add(dummy_task(8).with_priority(1));
        group.add(dummy_task(8).with_priority(2));
        pool.add_group(&group);
        pool.feed(dummy_task(8).with_priority(99));

        // Until the complete group is started nothing gates; priority picks
        // the lone task first.
        let first = pool.take_priority().unwrap();
        assert_eq!(first.task.priority(), 99);

        // Starting the group latches it until drained.
        let second = pool.next_dispatch().unwrap();
        assert!(second.group.is_some());
        let third = pool.take_priority().unwrap();
        assert!(third.group.is_some());
        assert_eq!(third.task.priority(), 2);
    }

    #[test]
    fn frozen_flags_survive_later_mutation() {
        let buf = StageBuffer::new(HostArray::from_vec(vec![0.0f32; 4]));
        buf.set_read(true);
        let mut group = ArgGroup::new();
        group.push(buf.clone());

        let task = Task::new(group, 1, "noop", 4, 0).freeze();
        buf.set_read(false);

        // The snapshot kept read=true even though the buffer changed.
        assert_eq!(task.cost(), 4);
        let frozen = match task.flags_snapshot {
            Some(ref s) => s.clone(),
            None => panic!("no snapshot"),
        };
        assert!(frozen[0].read);
    }

    #[test]
    fn cost_uses_widest_stride() {
        let arr = HostArray::structs(vec![0u8; 256], 16).unwrap();
        let buf = StageBuffer::new(arr);
        let task = Task::new(buf, 1, "noop", 256, 0).freeze();
        assert_eq!(task.cost(), 16);
    }

    #[test]
    fn repeat_group_keeps_binding_across_reset() {
        let pool = TaskPool::new(TaskPoolKind::Async);
        let repeat = TaskGroup::new(TaskGroupKind::RepeatSameDevice);
        repeat.add(dummy_task(8));
        let plain = TaskGroup::new(TaskGroupKind::SameDevice);
        plain.add(dummy_task(8));
        pool.add_group(&repeat);
        pool.add_group(&plain);

        repeat.bind(3, None);
        plain.bind(1, None);
        pool.reset();

        assert_eq!(repeat.binding().device, Some(3));
        assert_eq!(plain.binding().device, None);
    }
}
