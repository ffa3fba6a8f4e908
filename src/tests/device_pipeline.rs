//! Single-device pipeline scenarios: serial and parallel feeds, transition
//! arrays, and host-callback overlap.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::device_pipeline::{DevicePipeline, DeviceStage};
use crate::driver::Driver;
use crate::element::{ElementKind, HostArray};
use crate::tests::emulator::{f32_slot, single_device_driver, write_f32_slot, EmuDriver};

const LEN: usize = 4;

fn chain_driver() -> EmuDriver {
    single_device_driver()
        .with_kernel("mul2", |args, _g, _l| {
            let p = f32_slot(args, 0);
            let f: Vec<f32> = p.iter().map(|&x| x * 2.0).collect();
            write_f32_slot(args, 1, &f);
        })
        .with_kernel("add1", |args, _g, _l| {
            let f = f32_slot(args, 0);
            let w: Vec<f32> = f.iter().map(|&x| x + 1.0).collect();
            write_f32_slot(args, 1, &w);
        })
        .with_kernel("mul3", |args, _g, _l| {
            let w = f32_slot(args, 0);
            let q: Vec<f32> = w.iter().map(|&x| x * 3.0).collect();
            write_f32_slot(args, 1, &q);
        })
}

/// P → mul2 → F → add1 → W → mul3 → Q, with F and W as transition arrays.
fn build_chain(driver: Arc<dyn Driver>) -> (DevicePipeline, HostArray, HostArray) {
    let device = driver.devices()[0].clone();
    let source = "kernel void mul2(global float* a, global float* b) { } \
        kernel void add1(global float* a, global float* b) { } \
        kernel void mul3(global float* a, global float* b) { }";
    let mut dp = DevicePipeline::new(driver, device, source, 8).unwrap();

    let p = HostArray::zeroed(ElementKind::F32, LEN);
    let f = HostArray::zeroed(ElementKind::F32, LEN);
    let w = HostArray::zeroed(ElementKind::F32, LEN);
    let q = HostArray::zeroed(ElementKind::F32, LEN);

    dp.add_stage(DeviceStage::new("forces")
        .kernel("mul2", LEN, 1)
        .input(p.clone())
        .transition(f.clone())).unwrap();
    dp.add_stage(DeviceStage::new("velocities")
        .kernel("add1", LEN, 1)
        .transition(f)
        .transition(w.clone())).unwrap();
    dp.add_stage(DeviceStage::new("positions")
        .kernel("mul3", LEN, 1)
        .transition(w)
        .output(q.clone())).unwrap();

    (dp, p, q)
}

#[test]
fn serial_feed_composes_in_one_tick() {
    let driver: Arc<dyn Driver> = Arc::new(chain_driver());
    let (mut dp, p, q) = build_chain(driver);
    dp.enable_serial_mode();

    p.write_from_slice(&[0.0f32, 1.0, 2.0, 3.0]).unwrap();
    dp.feed().unwrap();

    // Serial mode shares the transition arrays directly, so one feed runs
    // the whole composition: q = (2p + 1) * 3.
    assert_eq!(q.read_vec::<f32>().unwrap(), vec![3.0, 9.0, 15.0, 21.0]);
    assert_eq!(dp.io_switch_counter(), 1);
}

#[test]
fn parallel_feed_reaches_steady_state() {
    let driver: Arc<dyn Driver> = Arc::new(chain_driver());
    let (mut dp, p, q) = build_chain(driver);
    dp.enable_parallel_mode();

    p.write_from_slice(&[0.0f32, 1.0, 2.0, 3.0]).unwrap();
    for _ in 0..8 {
        dp.feed().unwrap();
    }
    assert_eq!(q.read_vec::<f32>().unwrap(), vec![3.0, 9.0, 15.0, 21.0]);
}

#[test]
fn parallel_feed_matches_staggered_reference() {
    // Spring force, velocity integration with internal state, position
    // integration — each stage one tick behind its producer.
    const K_SPRING: f32 = 0.5;
    const DT: f32 = 0.25;

    let driver: Arc<dyn Driver> = Arc::new(
        single_device_driver()
            .with_kernel("spring_force", |args, _g, _l| {
                let p = f32_slot(args, 0);
                let f: Vec<f32> = p.iter().map(|&x| -K_SPRING * x).collect();
                write_f32_slot(args, 1, &f);
            })
            .with_kernel("integrate_v", |args, _g, _l| {
                let f = f32_slot(args, 0);
                let mut v = f32_slot(args, 1);
                for i in 0..v.len() {
                    v[i] += f[i] * DT;
                }
                write_f32_slot(args, 1, &v);
                write_f32_slot(args, 2, &v);
            })
            .with_kernel("integrate_p", |args, _g, _l| {
                let w = f32_slot(args, 0);
                let qv: Vec<f32> = w.iter().map(|&x| x * DT).collect();
                write_f32_slot(args, 1, &qv);
            }),
    );
    let device = driver.devices()[0].clone();
    let source = "kernel void spring_force(global float* a, global float* b) { } \
        kernel void integrate_v(global float* a, global float* b, global float* c) { } \
        kernel void integrate_p(global float* a, global float* b) { }";
    let mut dp = DevicePipeline::new(driver, device, source, 16).unwrap();

    let p = HostArray::zeroed(ElementKind::F32, LEN);
    let f = HostArray::zeroed(ElementKind::F32, LEN);
    let v = HostArray::zeroed(ElementKind::F32, LEN);
    let w = HostArray::zeroed(ElementKind::F32, LEN);
    let q = HostArray::zeroed(ElementKind::F32, LEN);

    dp.add_stage(DeviceStage::new("forces")
        .kernel("spring_force", LEN, 1)
        .input(p.clone())
        .transition(f.clone())).unwrap();
    dp.add_stage(DeviceStage::new("velocities")
        .kernel("integrate_v", LEN, 1)
        .transition(f)
        .internal(v)
        .transition(w.clone())).unwrap();
    dp.add_stage(DeviceStage::new("positions")
        .kernel("integrate_p", LEN, 1)
        .transition(w)
        .output(q.clone())).unwrap();

    let p_host = [1.0f32, -2.0, 0.5, 4.0];
    p.write_from_slice(&p_host).unwrap();

    // Plain-array model of the same recurrence, with every stage-to-stage
    // hop one feed behind.
    let mut f_prev = [0.0f32; LEN];
    let mut w_prev = [0.0f32; LEN];
    let mut q_prev = [0.0f32; LEN];
    let mut v_ref = [0.0f32; LEN];

    for t in 1..=9u32 {
        dp.feed().unwrap();

        let p_seen = if t >= 2 { p_host } else { [0.0; LEN] };
        let mut f_cur = [0.0f32; LEN];
        for i in 0..LEN {
            f_cur[i] = -K_SPRING * p_seen[i];
        }
        let f_seen = f_prev;
        for i in 0..LEN {
            v_ref[i] += f_seen[i] * DT;
        }
        let w_cur = v_ref;
        let w_seen = w_prev;
        let mut q_cur = [0.0f32; LEN];
        for i in 0..LEN {
            q_cur[i] = w_seen[i] * DT;
        }

        let host_q = q.read_vec::<f32>().unwrap();
        for i in 0..LEN {
            assert!((host_q[i] - q_prev[i]).abs() < 1.0e-6,
                "feed {} element {}: {} vs {}", t, i, host_q[i], q_prev[i]);
        }

        f_prev = f_cur;
        w_prev = w_cur;
        q_prev = q_cur;
    }
}

#[test]
fn feed_async_overlaps_host_callback() {
    let driver: Arc<dyn Driver> = Arc::new(chain_driver());
    let (mut dp, p, q) = build_chain(driver);
    dp.enable_serial_mode();
    p.write_from_slice(&[1.0f32, 1.0, 1.0, 1.0]).unwrap();

    let ran = AtomicBool::new(false);
    dp.feed_async(|| {
        ran.store(true, Ordering::SeqCst);
    }).unwrap();

    assert!(ran.load(Ordering::SeqCst));
    assert_eq!(q.read_vec::<f32>().unwrap(), vec![9.0; 4]);
}

#[test]
fn feed_async_begin_end_pairs() {
    let driver: Arc<dyn Driver> = Arc::new(chain_driver());
    let (mut dp, p, q) = build_chain(driver);
    dp.enable_serial_mode();
    p.write_from_slice(&[2.0f32; 4]).unwrap();

    assert!(dp.feed_async_end().is_err());
    dp.feed_async_begin().unwrap();
    assert!(dp.feed_async_begin().is_err());
    dp.feed_async_end().unwrap();
    assert_eq!(q.read_vec::<f32>().unwrap(), vec![15.0; 4]);

    assert!(dp.overlap_ratio().is_none());
}
