use rhi_common::ResourceHandle;
use rhi_render::{Backend, BackendError, Command};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread::JoinHandle;

use crate::config::QueueConfig;
use crate::dispatch::{Dispatcher, Shared};
use crate::error::{CommandFailure, QueueError};
use crate::ring::{self, RingProducer};
use crate::slots::SlotAllocator;
use crate::stats::DispatchStats;

/// Owner of one render thread and the command stream feeding it.
///
/// Every encoder method takes `&mut self`: there is exactly one producer.
/// Share a queue between threads only behind an external lock.
pub struct RenderCommandQueue {
    pub(crate) ring: RingProducer<Command>,
    pub(crate) slots: SlotAllocator,
    pub(crate) shared: Arc<Shared>,
    config: QueueConfig,
    backend_name: String,
    thread: Option<JoinHandle<()>>,
    /// A `flush` gave up waiting; the render thread still owes one resume.
    outstanding_handoff: bool,
}

impl RenderCommandQueue {
    /// Spawns the render thread and builds the backend on it.
    ///
    /// `factory` runs on the new thread so the native context is created on
    /// the thread that uses it. Its error is returned from here.
    pub fn start<B, F>(config: QueueConfig, factory: F) -> Result<Self, QueueError>
    where
        B: Backend + 'static,
        F: FnOnce() -> Result<B, BackendError> + Send + 'static,
    {
        config.validate()?;
        let (producer, consumer) = ring::ring(config.ring_capacity);
        let shared = Arc::new(Shared::new());
        let (init_tx, init_rx) = crossbeam_channel::bounded(1);

        let thread_shared = shared.clone();
        let strict = config.strict;
        let thread = std::thread::Builder::new()
            .name(config.thread_name.clone())
            .spawn(move || {
                let backend = match factory() {
                    Ok(backend) => backend,
                    Err(err) => {
                        let _ = init_tx.send(Err(err));
                        return;
                    }
                };
                let _ = init_tx.send(Ok(backend.name().to_owned()));
                Dispatcher::new(backend, consumer, thread_shared, strict).run();
            })?;

        let backend_name = match init_rx.recv() {
            Ok(Ok(name)) => name,
            Ok(Err(err)) => {
                let _ = thread.join();
                return Err(QueueError::BackendInit(err));
            }
            // The factory panicked before reporting back.
            Err(_) => {
                let _ = thread.join();
                return Err(QueueError::RenderThreadGone);
            }
        };

        tracing::info!(
            backend = %backend_name,
            ring_capacity = config.ring_capacity,
            slot_capacity = config.slot_capacity,
            "render queue started"
        );
        Ok(Self {
            ring: producer,
            slots: SlotAllocator::new(config.slot_capacity),
            shared,
            config,
            backend_name,
            thread: Some(thread),
            outstanding_handoff: false,
        })
    }

    /// Hands everything encoded so far to the render thread.
    ///
    /// Returns as soon as the render thread has taken its snapshot; the
    /// records execute while the caller keeps encoding.
    pub fn flush(&mut self) -> Result<(), QueueError> {
        if self.outstanding_handoff {
            self.await_handoff()?;
        }
        if !self.is_alive() {
            return Err(QueueError::RenderThreadGone);
        }
        self.shared.consume.signal();
        self.outstanding_handoff = true;
        self.await_handoff()
    }

    fn await_handoff(&mut self) -> Result<(), QueueError> {
        match self.config.watchdog {
            None => self.shared.resume.wait(),
            Some(limit) => {
                if !self.shared.resume.wait_timeout(limit) {
                    tracing::warn!(waited = ?limit, "render thread did not pick up flush");
                    return Err(QueueError::RenderThreadStalled { waited: limit });
                }
            }
        }
        self.outstanding_handoff = false;
        if !self.is_alive() {
            return Err(QueueError::RenderThreadGone);
        }
        Ok(())
    }

    /// Stops the render thread after it executed every record already
    /// encoded, then tears the backend down. Idempotent; also run on drop.
    pub fn shutdown(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        self.shared.exit.store(true, Ordering::Release);
        self.shared.consume.signal();
        if thread.join().is_err() {
            tracing::error!("render thread terminated by panic");
        }
        tracing::info!(backend = %self.backend_name, "render queue shut down");
    }

    pub fn is_alive(&self) -> bool {
        self.shared.alive.load(Ordering::Acquire)
    }

    pub fn backend_name(&self) -> &str {
        &self.backend_name
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Records encoded since the render thread's last snapshot.
    pub fn pending(&self) -> usize {
        self.shared.pending.load(Ordering::Acquire)
    }

    pub fn live_handles(&self) -> usize {
        self.slots.live_count()
    }

    /// Handles that can still be allocated.
    pub fn free_handles(&self) -> usize {
        self.slots.free_count()
    }

    pub fn is_live(&self, handle: ResourceHandle) -> bool {
        self.slots.is_live(handle)
    }

    pub fn stats(&self) -> DispatchStats {
        self.shared.stats.lock().clone()
    }

    /// Records the backend failed to execute since the last call.
    pub fn take_failures(&mut self) -> Vec<CommandFailure> {
        std::mem::take(&mut *self.shared.failures.lock())
    }

    /// Latest value of a query, available once the frame that ended it was
    /// presented.
    pub fn query_result(&self, query: ResourceHandle) -> Option<u64> {
        self.shared.query_results.lock().get(&query).copied()
    }
}

impl Drop for RenderCommandQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rhi_common::*;
    use rhi_render::{CommandLog, Opcode, RecordingBackend};
    use std::time::{Duration, Instant};

    fn config() -> QueueConfig {
        QueueConfig {
            ring_capacity: 256,
            slot_capacity: 64,
            strict: true,
            ..Default::default()
        }
    }

    fn start_recording(config: QueueConfig) -> (RenderCommandQueue, CommandLog) {
        start_with(config, RecordingBackend::new())
    }

    fn start_with(
        config: QueueConfig,
        backend: RecordingBackend,
    ) -> (RenderCommandQueue, CommandLog) {
        let log = backend.log();
        let queue = RenderCommandQueue::start(config, move || Ok(backend)).unwrap();
        (queue, log)
    }

    /// Second flush guarantees the first drain finished.
    fn settle(queue: &mut RenderCommandQueue) {
        queue.flush().unwrap();
        queue.flush().unwrap();
    }

    #[test]
    fn end_to_end_create_draw_release_reuse() {
        let (mut queue, log) = start_recording(config());
        let free = queue.free_handles();
        let data: [u8; 64] = std::array::from_fn(|i| (i * 7 + 3) as u8);
        let vb = queue.create_buffer(&BufferDesc::vertex(64), Some(&data));
        assert_eq!(queue.free_handles(), free - 1);
        queue.set_targets(&[ResourceHandle::NULL], ResourceHandle::NULL);
        queue.set_vertex_buffer(vb, 0, 16, 0);
        queue.draw(3, 0, PrimitiveTopology::TriangleList);
        queue.present();
        queue.flush().unwrap();

        queue.release_buffer(vb);
        assert_eq!(queue.free_handles(), free);
        let again = queue.create_buffer(&BufferDesc::vertex(16), None);
        assert_eq!(again, vb, "released slot is reused first");
        settle(&mut queue);

        let commands = log.commands();
        assert_eq!(
            commands[0],
            Command::CreateBuffer {
                handle: vb,
                desc: BufferDesc::vertex(64),
                data: Some(data.to_vec().into_boxed_slice()),
            }
        );
        assert_eq!(
            commands[2],
            Command::SetVertexBuffer {
                handle: vb,
                slot: 0,
                stride: 16,
                offset: 0,
            }
        );
        assert_eq!(
            commands[3],
            Command::Draw {
                vertex_count: 3,
                start_vertex: 0,
                topology: PrimitiveTopology::TriangleList,
            }
        );
        assert_eq!(
            log.opcodes(),
            vec![
                Opcode::CreateBuffer,
                Opcode::SetTargets,
                Opcode::SetVertexBuffer,
                Opcode::Draw,
                Opcode::Present,
                Opcode::Release,
                Opcode::CreateBuffer,
            ]
        );
        assert!(queue.take_failures().is_empty());
        assert_eq!(queue.stats().frames_presented, 1);
    }

    #[test]
    fn replay_is_fifo_across_wraparound() {
        let (mut queue, log) = start_recording(QueueConfig {
            ring_capacity: 8,
            ..config()
        });
        for round in 0..20u32 {
            for i in 0..3u32 {
                queue.push_marker(&format!("{round}:{i}"));
                queue.pop_marker();
            }
            // Each round stays within the ring; the cursors wrap many times.
            queue.flush().unwrap();
            let deadline = Instant::now() + Duration::from_secs(5);
            while log.len() < ((round + 1) * 6) as usize && Instant::now() < deadline {
                std::thread::yield_now();
            }
        }
        settle(&mut queue);
        let labels: Vec<String> = log
            .commands()
            .into_iter()
            .filter_map(|c| match c {
                Command::PushMarker { label } => Some(label.into_string()),
                _ => None,
            })
            .collect();
        let expected: Vec<String> = (0..20)
            .flat_map(|r| (0..3).map(move |i| format!("{r}:{i}")))
            .collect();
        assert_eq!(labels, expected);
    }

    #[test]
    fn payload_is_copied_at_encode_time() {
        let (mut queue, log) = start_recording(config());
        let mut data = vec![7u8; 32];
        let buffer = queue.create_buffer(&BufferDesc::vertex(32), Some(&data));
        data.fill(0);
        queue.update_buffer(buffer, 0, &data[..8]);
        data.fill(9);
        settle(&mut queue);

        let commands = log.commands();
        match &commands[0] {
            Command::CreateBuffer { data: Some(d), .. } => assert!(d.iter().all(|b| *b == 7)),
            other => panic!("unexpected {other:?}"),
        }
        match &commands[1] {
            Command::UpdateBuffer { data, .. } => assert_eq!(&data[..], &[0u8; 8]),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn flush_returns_before_slow_command_finishes() {
        let delay = Duration::from_millis(400);
        let backend = RecordingBackend::new().with_delay(Opcode::PushMarker, delay);
        let (mut queue, log) = start_with(config(), backend);
        queue.push_marker("slow");
        let start = Instant::now();
        queue.flush().unwrap();
        assert!(start.elapsed() < delay, "flush waited for execution");
        // The producer keeps encoding while the marker executes.
        queue.pop_marker();
        settle(&mut queue);
        assert_eq!(log.opcodes(), vec![Opcode::PushMarker, Opcode::PopMarker]);
    }

    #[test]
    #[should_panic(expected = "command ring overflow")]
    fn overflow_between_flushes_panics() {
        let (mut queue, _log) = start_recording(QueueConfig {
            ring_capacity: 8,
            ..config()
        });
        for _ in 0..9 {
            queue.push_marker("x");
        }
    }

    #[test]
    fn creation_failure_is_reported_not_fatal() {
        let backend = RecordingBackend::new().failing(Opcode::CreateTexture);
        let (mut queue, _log) = start_with(config(), backend);
        let texture = queue.create_texture(
            &TextureDesc::new_2d(4, 4, TextureFormat::Rgba8Unorm),
            None,
        );
        settle(&mut queue);
        let failures = queue.take_failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].opcode, Opcode::CreateTexture);
        assert_eq!(failures[0].handle, texture);
        assert!(queue.is_alive());
        assert!(queue.take_failures().is_empty());
    }

    #[test]
    fn releasing_a_failed_creation_keeps_the_queue_alive() {
        let backend = RecordingBackend::new().failing(Opcode::CreateTexture);
        let (mut queue, log) = start_with(config(), backend);
        let texture = queue.create_texture(
            &TextureDesc::new_2d(4, 4, TextureFormat::Rgba8Unorm),
            None,
        );
        settle(&mut queue);
        assert_eq!(queue.take_failures().len(), 1);
        assert!(queue.is_live(texture));

        queue.release_texture(texture);
        settle(&mut queue);
        assert!(queue.is_alive());
        assert!(queue.take_failures().is_empty());
        assert!(!log.opcodes().contains(&Opcode::Release));

        // The slot is usable again once the failed object is released.
        let sampler = queue.create_sampler(&SamplerDesc::default());
        assert_eq!(sampler, texture);
        queue.release_sampler(sampler);
        settle(&mut queue);
        assert!(queue.take_failures().is_empty());
        assert_eq!(log.opcodes().last(), Some(&Opcode::Release));
    }

    #[test]
    fn strict_misuse_kills_render_thread() {
        let (mut queue, _log) = start_recording(config());
        // Clearing with no targets bound is rejected by the backend.
        queue.clear(ClearDesc::color([0.0; 4]));
        queue.flush().unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while queue.is_alive() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(matches!(queue.flush(), Err(QueueError::RenderThreadGone)));
    }

    #[test]
    fn lenient_misuse_is_recorded() {
        let (mut queue, _log) = start_recording(QueueConfig {
            strict: false,
            ..config()
        });
        queue.clear(ClearDesc::color([0.0; 4]));
        settle(&mut queue);
        let failures = queue.take_failures();
        assert_eq!(failures.len(), 1);
        assert!(failures[0].error.is_misuse());
        assert!(queue.is_alive());
    }

    #[test]
    fn watchdog_reports_stalled_render_thread() {
        let backend =
            RecordingBackend::new().with_delay(Opcode::PushMarker, Duration::from_millis(600));
        let (mut queue, _log) = start_with(
            QueueConfig {
                watchdog: Some(Duration::from_millis(150)),
                ..config()
            },
            backend,
        );
        queue.push_marker("slow");
        queue.flush().unwrap();
        // The render thread is busy executing the marker and cannot pick up
        // this flush in time.
        queue.pop_marker();
        assert!(matches!(
            queue.flush(),
            Err(QueueError::RenderThreadStalled { .. })
        ));
        std::thread::sleep(Duration::from_millis(800));
        queue.flush().unwrap();
    }

    #[test]
    fn shutdown_drains_queued_releases() {
        let (mut queue, log) = start_recording(config());
        let sampler = queue.create_sampler(&SamplerDesc::default());
        queue.release_sampler(sampler);
        queue.shutdown();
        assert_eq!(log.opcodes(), vec![Opcode::CreateSampler, Opcode::Release]);
        assert!(!queue.is_alive());
    }

    #[test]
    fn query_results_published_at_present() {
        let (mut queue, _log) = start_recording(config());
        let query = queue.create_query(QueryKind::Occlusion);
        queue.set_targets(&[ResourceHandle::NULL], ResourceHandle::NULL);
        queue.begin_query(query);
        queue.draw(3, 0, PrimitiveTopology::TriangleList);
        queue.end_query(query);
        assert_eq!(queue.query_result(query), None);
        queue.present();
        settle(&mut queue);
        assert_eq!(queue.query_result(query), Some(1));
    }

    #[test]
    fn reused_query_handle_starts_without_a_result() {
        let backend =
            RecordingBackend::new().with_delay(Opcode::Present, Duration::from_millis(200));
        let (mut queue, _log) = start_with(config(), backend);
        let query = queue.create_query(QueryKind::Occlusion);
        queue.set_targets(&[ResourceHandle::NULL], ResourceHandle::NULL);
        queue.begin_query(query);
        queue.draw(3, 0, PrimitiveTopology::TriangleList);
        queue.end_query(query);
        queue.present();
        queue.flush().unwrap();

        // The present above is still executing when the slot changes hands.
        queue.release_query(query);
        let next = queue.create_query(QueryKind::Occlusion);
        assert_eq!(next, query);
        settle(&mut queue);
        assert_eq!(queue.query_result(next), None);
        assert!(queue.take_failures().is_empty());
    }

    #[test]
    fn backend_init_error_is_returned() {
        let result = RenderCommandQueue::start(config(), || {
            Err::<RecordingBackend, _>(BackendError::Init("no adapter".into()))
        });
        assert!(matches!(result, Err(QueueError::BackendInit(_))));
    }

    #[test]
    fn invalid_config_rejected_before_spawn() {
        let result = RenderCommandQueue::start(
            QueueConfig {
                ring_capacity: 3,
                ..config()
            },
            || Ok(RecordingBackend::new()),
        );
        assert!(matches!(result, Err(QueueError::InvalidConfig(_))));
    }

    #[test]
    fn independent_queues_coexist() {
        let (mut a, log_a) = start_recording(config());
        let (mut b, log_b) = start_recording(config());
        a.push_marker("a");
        a.pop_marker();
        b.present();
        settle(&mut a);
        settle(&mut b);
        assert_eq!(log_a.len(), 2);
        assert_eq!(log_b.opcodes(), vec![Opcode::Present]);
    }
}
