use std::hint::black_box;
use std::time::Instant;

use rhi_common::*;
use rhi_queue::{QueueConfig, RenderCommandQueue, ring};
use rhi_render::RecordingBackend;

fn bench_ring(capacity: usize, items: usize) {
    let (mut tx, mut rx) = ring::<u64>(capacity);
    let consumer = std::thread::spawn(move || {
        let mut seen = 0usize;
        while seen < items {
            let end = rx.snapshot();
            while let Some(v) = rx.pop_until(end) {
                black_box(v);
                seen += 1;
            }
            std::thread::yield_now();
        }
    });

    let start = Instant::now();
    let mut i = 0u64;
    while (i as usize) < items {
        if tx.try_push(i).is_ok() {
            i += 1;
        } else {
            std::thread::yield_now();
        }
    }
    let _ = consumer.join();
    let elapsed = start.elapsed();
    println!(
        "  raw ring (cap {capacity}, {items} items): {:?}/item, total {elapsed:?}",
        elapsed / items as u32
    );
}

fn bench_frames(draws_per_frame: u32, frames: u32) {
    let config = QueueConfig {
        ring_capacity: 1 << 16,
        strict: false,
        ..Default::default()
    };
    let Ok(mut queue) = RenderCommandQueue::start(config, || Ok(RecordingBackend::new())) else {
        println!("  failed to start queue");
        return;
    };
    let vb = queue.create_buffer(&BufferDesc::vertex(1024), Some(&[0u8; 1024]));
    let cb = queue.create_buffer(&BufferDesc::constant(64), None);

    let start = Instant::now();
    for frame in 0..frames {
        queue.set_targets(&[ResourceHandle::NULL], ResourceHandle::NULL);
        queue.clear(ClearDesc::color([0.0, 0.0, 0.0, 1.0]));
        for i in 0..draws_per_frame {
            queue.update_buffer(cb, 0, black_box(&(frame * draws_per_frame + i).to_le_bytes()));
            queue.set_vertex_buffer(vb, 0, 16, 0);
            queue.set_constant_buffer(ShaderStage::Vertex, 0, cb);
            queue.draw(3, 0, PrimitiveTopology::TriangleList);
        }
        queue.present();
        if queue.flush().is_err() {
            println!("  render thread died");
            return;
        }
    }
    queue.shutdown();
    let elapsed = start.elapsed();
    let stats = queue.stats();
    println!(
        "  encode+drain ({draws_per_frame} draws x {frames} frames): {:?}/frame, {} commands, avg drain {:?}",
        elapsed / frames,
        stats.commands_executed,
        stats.average_drain
    );
}

fn main() {
    println!("=== Command Queue Benchmarks ===\n");

    println!("SPSC ring:");
    bench_ring(1024, 1_000_000);
    bench_ring(65536, 1_000_000);

    println!("\nEncode + drain through the recording backend:");
    bench_frames(100, 200);
    bench_frames(1000, 50);
    bench_frames(5000, 10);

    println!("\n=== Done ===");
}
