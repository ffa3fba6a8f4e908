//! Device-pool scheduling disciplines over the emulator.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::device_pool::{DevicePool, PoolFlags};
use crate::driver::{AcceleratorKind, Driver};
use crate::element::{ElementKind, HostArray};
use crate::stage_buffer::StageBuffer;
use crate::task::{Task, TaskGroup, TaskGroupKind, TaskPool, TaskPoolKind};
use crate::tests::emulator::{write_f32_slot, EmuDriver, PipelineProbe};

const SRC: &str = "kernel void fill1(global float* a) { } \
    kernel void log_size(global float* a) { }";

type SizeLog = Arc<Mutex<Vec<usize>>>;

fn two_device_driver(log: &SizeLog) -> EmuDriver {
    let log = log.clone();
    EmuDriver::new()
        .with_device(AcceleratorKind::GPU, "emu-gpu-0", 8)
        .with_device(AcceleratorKind::GPU, "emu-gpu-1", 8)
        .with_kernel("fill1", |args, global, _l| {
            write_f32_slot(args, 0, &vec![1.0; global]);
        })
        .with_kernel("log_size", move |_args, global, _l| {
            log.lock().push(global);
        })
}

fn fill_task(len: usize, id: u32) -> (Task, HostArray) {
    let array = HostArray::zeroed(ElementKind::F32, len);
    let buf = StageBuffer::new(array.clone());
    (Task::new(buf, id, "fill1", len, 1).freeze(), array)
}

fn log_task(global: usize, id: u32) -> Task {
    let buf = StageBuffer::new(HostArray::zeroed(ElementKind::F32, global));
    Task::new(buf, id, "log_size", global, 1).freeze()
}

#[test]
fn fcfs_round_robin_splits_evenly() {
    let log: SizeLog = Arc::new(Mutex::new(Vec::new()));
    let driver: Arc<dyn Driver> = Arc::new(two_device_driver(&log));
    let mut dp = DevicePool::new(
        PoolFlags::WORKER_ROUND_ROBIN | PoolFlags::WORK_FIRST_COME_FIRST_SERVE,
        driver.clone(), SRC);
    dp.add_devices(&driver.devices());

    let pool = TaskPool::new(TaskPoolKind::Async);
    let mut arrays = Vec::new();
    for i in 0..100 {
        let (task, array) = fill_task(4, i);
        pool.feed(task);
        arrays.push(array);
    }

    dp.enqueue_task_pool(&pool);
    dp.finish();

    assert_eq!(pool.remaining(), 0);
    let counts = dp.completed_counts();
    assert_eq!(counts.iter().sum::<usize>(), 100);
    for &count in &counts {
        assert!(count >= 49 && count <= 51, "uneven split: {:?}", counts);
    }
    for array in &arrays {
        assert_eq!(array.read_vec::<f32>().unwrap(), vec![1.0; 4]);
    }
}

#[test]
fn shortest_job_first_runs_small_tasks_first() {
    let log: SizeLog = Arc::new(Mutex::new(Vec::new()));
    let driver: Arc<dyn Driver> = Arc::new(
        EmuDriver::new()
            .with_device(AcceleratorKind::GPU, "emu-gpu-0", 8)
            .with_kernel("log_size", {
                let log = log.clone();
                move |_args, global, _l| log.lock().push(global)
            })
            .with_kernel("fill1", |args, global, _l| {
                write_f32_slot(args, 0, &vec![1.0; global]);
            }),
    );
    let mut dp = DevicePool::new(
        PoolFlags::WORKER_ROUND_ROBIN | PoolFlags::WORK_SHORTEST_JOB_FIRST,
        driver.clone(), SRC);
    dp.add_devices(&driver.devices());

    let pool = TaskPool::new(TaskPoolKind::Async);
    for &size in &[64usize, 8, 32, 16] {
        pool.feed(log_task(size, size as u32));
    }
    dp.enqueue_task_pool(&pool);
    dp.finish();

    assert_eq!(&*log.lock(), &[8, 16, 32, 64]);
}

#[test]
fn priority_based_runs_high_priority_first() {
    let log: SizeLog = Arc::new(Mutex::new(Vec::new()));
    let driver: Arc<dyn Driver> = Arc::new(
        EmuDriver::new()
            .with_device(AcceleratorKind::GPU, "emu-gpu-0", 8)
            .with_kernel("log_size", {
                let log = log.clone();
                move |_args, global, _l| log.lock().push(global)
            })
            .with_kernel("fill1", |args, global, _l| {
                write_f32_slot(args, 0, &vec![1.0; global]);
            }),
    );
    let mut dp = DevicePool::new(
        PoolFlags::WORKER_ROUND_ROBIN | PoolFlags::WORK_PRIORITY_BASED,
        driver.clone(), SRC);
    dp.add_devices(&driver.devices());

    let pool = TaskPool::new(TaskPoolKind::Async);
    pool.feed(log_task(10, 1).with_priority(1));
    pool.feed(log_task(90, 2).with_priority(9));
    pool.feed(log_task(50, 3).with_priority(5));
    dp.enqueue_task_pool(&pool);
    dp.finish();

    assert_eq!(&*log.lock(), &[90, 50, 10]);
}

#[test]
fn quantised_round_robin_drains_all_phases() {
    let log: SizeLog = Arc::new(Mutex::new(Vec::new()));
    let driver: Arc<dyn Driver> = Arc::new(two_device_driver(&log));
    let mut dp = DevicePool::new(
        PoolFlags::WORKER_ROUND_ROBIN | PoolFlags::WORK_ROUND_ROBIN,
        driver.clone(), SRC);
    dp.add_devices(&driver.devices());

    let pool = TaskPool::new(TaskPoolKind::Async);
    let mut arrays = Vec::new();
    for i in 0..2 {
        let (task, array) = fill_task(4, i);
        pool.feed(task);
        arrays.push(array);
    }
    dp.enqueue_task_pool(&pool);
    dp.finish();

    assert_eq!(pool.remaining(), 0);
    for array in &arrays {
        assert_eq!(array.read_vec::<f32>().unwrap(), vec![1.0; 4]);
    }
    // Each task was issued as a read, a compute, and a write quantum.
    assert_eq!(dp.completed_counts().iter().sum::<usize>(), 6);
}

#[test]
fn packet_mode_dispatches_barrier_rounds() {
    let log: SizeLog = Arc::new(Mutex::new(Vec::new()));
    let driver: Arc<dyn Driver> = Arc::new(
        two_device_driver(&log).with_compute_delay(Duration::from_millis(1)));
    let mut dp = DevicePool::new(
        PoolFlags::WORKER_PACKET | PoolFlags::WORK_FIRST_COME_FIRST_SERVE,
        driver.clone(), SRC);
    dp.add_devices(&driver.devices());

    let pool = TaskPool::new(TaskPoolKind::Async);
    let mut arrays = Vec::new();
    for i in 0..4 {
        let (task, array) = fill_task(4, i);
        pool.feed(task);
        arrays.push(array);
    }
    dp.enqueue_task_pool(&pool);
    dp.finish();

    // Two rounds of one task per device.
    assert_eq!(dp.completed_counts(), vec![2, 2]);
    for array in &arrays {
        assert_eq!(array.read_vec::<f32>().unwrap(), vec![1.0; 4]);
    }
}

#[test]
fn compute_at_will_completes_everything() {
    let log: SizeLog = Arc::new(Mutex::new(Vec::new()));
    let driver: Arc<dyn Driver> = Arc::new(
        two_device_driver(&log).with_compute_delay(Duration::from_millis(1)));
    let mut dp = DevicePool::new(
        PoolFlags::WORKER_COMPUTE_AT_WILL | PoolFlags::WORK_FIRST_COME_FIRST_SERVE,
        driver.clone(), SRC);
    dp.add_devices(&driver.devices());

    let pool = TaskPool::new(TaskPoolKind::Async);
    for i in 0..20 {
        let (task, _array) = fill_task(4, i);
        pool.feed(task);
    }
    dp.enqueue_task_pool(&pool);
    dp.finish();

    assert_eq!(pool.remaining(), 0);
    assert_eq!(dp.completed_counts().iter().sum::<usize>(), 20);
}

#[test]
fn same_device_group_stays_on_one_consumer() {
    let log: SizeLog = Arc::new(Mutex::new(Vec::new()));
    let driver: Arc<dyn Driver> = Arc::new(two_device_driver(&log));
    let mut dp = DevicePool::new(
        PoolFlags::WORKER_ROUND_ROBIN | PoolFlags::WORK_FIRST_COME_FIRST_SERVE,
        driver.clone(), SRC);
    dp.add_devices(&driver.devices());

    let group = TaskGroup::new(TaskGroupKind::SameDevice);
    for i in 0..6 {
        let (task, _array) = fill_task(4, i);
        group.add(task);
    }
    let pool = TaskPool::new(TaskPoolKind::Async);
    pool.add_group(&group);
    dp.enqueue_task_pool(&pool);
    dp.finish();

    let counts = dp.completed_counts();
    assert_eq!(counts.iter().sum::<usize>(), 6);
    assert!(counts.contains(&6), "group split across devices: {:?}", counts);
    assert!(group.binding().device.is_some());
}

#[test]
fn in_order_group_preserves_feed_order() {
    let log: SizeLog = Arc::new(Mutex::new(Vec::new()));
    let driver: Arc<dyn Driver> = Arc::new(two_device_driver(&log));
    let mut dp = DevicePool::new(
        PoolFlags::WORKER_ROUND_ROBIN | PoolFlags::WORK_FIRST_COME_FIRST_SERVE,
        driver.clone(), SRC);
    dp.add_devices(&driver.devices());

    let group = TaskGroup::new(TaskGroupKind::InOrder);
    for &size in &[10usize, 20, 30, 40, 50] {
        group.add(log_task(size, size as u32));
    }
    let pool = TaskPool::new(TaskPoolKind::Async);
    pool.add_group(&group);
    dp.enqueue_task_pool(&pool);
    dp.finish();

    assert_eq!(&*log.lock(), &[10, 20, 30, 40, 50]);
    let binding = group.binding();
    assert!(binding.device.is_some());
    assert!(binding.queue.is_some());
}

#[test]
fn repeat_group_binding_survives_pool_reset() {
    let log: SizeLog = Arc::new(Mutex::new(Vec::new()));
    let driver: Arc<dyn Driver> = Arc::new(two_device_driver(&log));
    let mut dp = DevicePool::new(
        PoolFlags::WORKER_ROUND_ROBIN | PoolFlags::WORK_FIRST_COME_FIRST_SERVE,
        driver.clone(), SRC);
    dp.add_devices(&driver.devices());

    let group = TaskGroup::new(TaskGroupKind::RepeatSameDevice);
    for i in 0..4 {
        let (task, _array) = fill_task(4, i);
        group.add(task);
    }
    let pool = TaskPool::new(TaskPoolKind::Async);
    pool.add_group(&group);

    dp.enqueue_task_pool(&pool);
    dp.finish();
    let first_binding = group.binding().device;
    assert!(first_binding.is_some());

    pool.reset();
    dp.enqueue_task_pool(&pool);
    dp.finish();

    assert_eq!(group.binding().device, first_binding);
    assert_eq!(pool.remaining(), 0);
    assert_eq!(dp.completed_counts().iter().sum::<usize>(), 8);
}

#[test]
fn drained_pool_is_reusable() {
    let log: SizeLog = Arc::new(Mutex::new(Vec::new()));
    let driver: Arc<dyn Driver> = Arc::new(two_device_driver(&log));
    let mut dp = DevicePool::new(
        PoolFlags::WORKER_ROUND_ROBIN | PoolFlags::WORK_FIRST_COME_FIRST_SERVE,
        driver.clone(), SRC);
    dp.add_devices(&driver.devices());

    let pool = TaskPool::new(TaskPoolKind::Async);
    let mut arrays = Vec::new();
    for i in 0..10 {
        let (task, array) = fill_task(4, i);
        pool.feed(task);
        arrays.push(array);
    }

    dp.enqueue_task_pool(&pool);
    dp.finish();
    assert_eq!(pool.remaining(), 0);
    let first_run: Vec<Vec<f32>> = arrays.iter()
        .map(|a| a.read_vec::<f32>().unwrap())
        .collect();

    // Reset and run again: same final state as the fresh run.
    for array in &arrays {
        array.write_from_slice(&[0.0f32; 4]).unwrap();
    }
    pool.reset();
    assert_eq!(pool.remaining(), 10);
    dp.enqueue_task_pool(&pool);
    dp.finish();

    let second_run: Vec<Vec<f32>> = arrays.iter()
        .map(|a| a.read_vec::<f32>().unwrap())
        .collect();
    assert_eq!(first_run, second_run);
    assert_eq!(pool.remaining(), 0);
}

#[test]
fn complete_pool_latches_until_drained() {
    let log: SizeLog = Arc::new(Mutex::new(Vec::new()));
    let driver: Arc<dyn Driver> = Arc::new(
        EmuDriver::new()
            .with_device(AcceleratorKind::GPU, "emu-gpu-0", 8)
            .with_kernel("log_size", {
                let log = log.clone();
                move |_args, global, _l| log.lock().push(global)
            })
            .with_kernel("fill1", |args, global, _l| {
                write_f32_slot(args, 0, &vec![1.0; global]);
            }),
    );
    let mut dp = DevicePool::new(
        PoolFlags::WORKER_ROUND_ROBIN | PoolFlags::WORK_FIRST_COME_FIRST_SERVE,
        driver.clone(), SRC);
    dp.add_devices(&driver.devices());

    let complete = TaskPool::new(TaskPoolKind::Complete);
    for &size in &[101usize, 102, 103, 104] {
        complete.feed(log_task(size, size as u32));
    }
    let async_pool = TaskPool::new(TaskPoolKind::Async);
    for &size in &[201usize, 202, 203, 204] {
        async_pool.feed(log_task(size, size as u32));
    }

    dp.enqueue_task_pool(&complete);
    dp.enqueue_task_pool(&async_pool);
    dp.finish();

    let order = log.lock().clone();
    assert_eq!(order.len(), 8);
    // The complete pool is selected first and latched until empty.
    assert!(order[..4].iter().all(|&s| s < 200), "latch broken: {:?}", order);
}

#[test]
fn pipelined_task_blobs_reach_the_driver() {
    let probe: PipelineProbe = Arc::new(Mutex::new(Vec::new()));
    let driver: Arc<dyn Driver> = Arc::new(
        EmuDriver::new()
            .with_device(AcceleratorKind::GPU, "emu-gpu-0", 8)
            .with_kernel("fill1", |args, global, _l| {
                write_f32_slot(args, 0, &vec![1.0; global]);
            })
            .with_pipeline_probe(probe.clone()),
    );
    let mut dp = DevicePool::new(
        PoolFlags::WORKER_ROUND_ROBIN | PoolFlags::WORK_FIRST_COME_FIRST_SERVE,
        driver.clone(), SRC);
    dp.add_devices(&driver.devices());

    let array = HostArray::zeroed(ElementKind::F32, 4);
    let buf = StageBuffer::new(array.clone());
    let pool = TaskPool::new(TaskPoolKind::Async);
    pool.feed(Task::new(buf, 7, "fill1", 4, 1).pipelined(4).freeze());

    dp.enqueue_task_pool(&pool);
    dp.finish();

    assert_eq!(array.read_vec::<f32>().unwrap(), vec![1.0; 4]);
    // The frozen pipeline envelope arrived at the cruncher intact.
    assert_eq!(&*probe.lock(), &[(true, 4)]);
}

#[test]
fn empty_sync_pool_withholds_without_starving() {
    let log: SizeLog = Arc::new(Mutex::new(Vec::new()));
    let driver: Arc<dyn Driver> = Arc::new(
        EmuDriver::new()
            .with_device(AcceleratorKind::GPU, "emu-gpu-0", 8)
            .with_kernel("log_size", {
                let log = log.clone();
                move |_args, global, _l| log.lock().push(global)
            })
            .with_kernel("fill1", |args, global, _l| {
                write_f32_slot(args, 0, &vec![1.0; global]);
            }),
    );
    let mut dp = DevicePool::new(
        PoolFlags::WORKER_ROUND_ROBIN | PoolFlags::WORK_FIRST_COME_FIRST_SERVE,
        driver.clone(), SRC);
    dp.add_devices(&driver.devices());

    // One sync pool never receives work; its rotation slot withholds a step
    // each pass but must not starve its sibling.
    let idle = TaskPool::new(TaskPoolKind::Sync);
    let busy = TaskPool::new(TaskPoolKind::Sync);
    for &size in &[11usize, 12, 13, 14] {
        busy.feed(log_task(size, size as u32));
    }
    dp.enqueue_task_pool(&idle);
    dp.enqueue_task_pool(&busy);
    dp.finish();

    assert_eq!(&*log.lock(), &[11, 12, 13, 14]);
    assert_eq!(busy.remaining(), 0);
    assert_eq!(idle.remaining(), 0);
}

#[test]
fn pause_gates_consumers() {
    let log: SizeLog = Arc::new(Mutex::new(Vec::new()));
    let driver: Arc<dyn Driver> = Arc::new(two_device_driver(&log));
    let mut dp = DevicePool::new(
        PoolFlags::WORKER_ROUND_ROBIN | PoolFlags::WORK_FIRST_COME_FIRST_SERVE,
        driver.clone(), SRC);
    dp.add_devices(&driver.devices());
    dp.pause_all();

    let pool = TaskPool::new(TaskPoolKind::Async);
    for i in 0..4 {
        let (task, _array) = fill_task(4, i);
        pool.feed(task);
    }
    dp.enqueue_task_pool(&pool);

    thread::sleep(Duration::from_millis(50));
    assert_eq!(dp.completed_counts().iter().sum::<usize>(), 0);

    dp.resume_all();
    dp.finish();
    assert_eq!(dp.completed_counts().iter().sum::<usize>(), 4);
}
