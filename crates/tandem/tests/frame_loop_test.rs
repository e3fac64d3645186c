//! Integration test for the simulation loop driving a core thread.

use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use tandem::core::{CoreError, CoreThreadConfig, FrameBlock, ThreadPoolConfig};
use tandem::{SimLoop, SimLoopConfig};

#[derive(Clone, Copy, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
struct Particle {
    position: [f32; 3],
    ttl: u32,
}

fn config(name: &str) -> SimLoopConfig {
    SimLoopConfig {
        core: CoreThreadConfig {
            thread_name: name.to_string(),
            frame_arena_bytes: 16 * 1024,
            ..CoreThreadConfig::default()
        },
        pool: ThreadPoolConfig {
            name_prefix: format!("{name}-pool"),
            max_idle_threads: 1,
            slots: 2,
        },
        ..SimLoopConfig::default()
    }
}

#[test]
fn test_frame_data_lives_one_frame() {
    let mut sim = SimLoop::new(config("loop-frames")).unwrap();
    let particles = [
        Particle {
            position: [0.0, 1.0, 2.0],
            ttl: 3,
        },
        Particle {
            position: [4.0, 5.0, 6.0],
            ttl: 7,
        },
    ];

    // Frame 1: write.
    let stored = sim
        .run_frame(|ctx| {
            ctx.accessor
                .queue_return_command(move |token| token.frame_alloc().store_slice(&particles))
        })
        .unwrap();
    let block: FrameBlock = stored.into_value().unwrap().unwrap();

    // Frame 2: still readable.
    let read = sim
        .run_frame(|ctx| {
            ctx.accessor
                .queue_return_command(move |token| token.frame_alloc().load_slice::<Particle>(&block))
        })
        .unwrap();
    assert_eq!(read.into_value(), Ok(Ok(particles.to_vec())));

    // Frame 3: the arena was recycled.
    let stale = sim
        .run_frame(|ctx| {
            ctx.accessor
                .queue_return_command(move |token| token.frame_alloc().load_slice::<Particle>(&block))
        })
        .unwrap();
    assert!(matches!(
        stale.into_value(),
        Ok(Err(CoreError::StaleFrameBlock { .. }))
    ));

    assert_eq!(sim.frame_count(), 3);
    sim.shutdown().unwrap();
}

#[test]
fn test_helper_thread_work_lands_after_sim_work() {
    let mut sim = SimLoop::new(config("loop-helpers")).unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));

    for frame in 0..5_u32 {
        sim.run_frame(|ctx| {
            // A helper thread queues on the synced accessor mid-frame.
            let synced = ctx.synced.clone();
            let helper_log = Arc::clone(&log);
            thread::spawn(move || {
                synced.queue_command(move |_| helper_log.lock().push(format!("helper-{frame}")));
            })
            .join()
            .unwrap();

            let sim_log = Arc::clone(&log);
            ctx.accessor
                .queue_command(move |_| sim_log.lock().push(format!("sim-{frame}")));
        })
        .unwrap();
    }

    let expected: Vec<String> = (0..5)
        .flat_map(|frame| [format!("sim-{frame}"), format!("helper-{frame}")])
        .collect();
    assert_eq!(*log.lock(), expected);
    sim.shutdown().unwrap();
}

#[test]
fn test_registered_objects_balanced_across_frames() {
    let mut sim = SimLoop::new(config("loop-registry")).unwrap();
    let mut live = Vec::new();

    for _ in 0..4 {
        let object = sim.run_frame(|ctx| ctx.core.register_object("texture")).unwrap();
        live.push(object);
    }
    assert_eq!(sim.core().registry().live_count(), 4);

    for object in live {
        sim.core().unregister_object(object).unwrap();
    }
    sim.shutdown().unwrap();
}
