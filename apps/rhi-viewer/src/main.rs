mod camera;
mod scene;
mod shaders;

use anyhow::Result;
use clap::Parser;
use rhi_queue::{QueueConfig, RenderCommandQueue};
use rhi_wgpu::{SurfaceOptions, WgpuBackend};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;
use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::event::{DeviceEvent, ElementState, KeyEvent, MouseButton, WindowEvent};
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::keyboard::{KeyCode, PhysicalKey};
use winit::window::{Window, WindowId};

use camera::{FlyCamera, MoveInput};
use scene::WorldScene;

#[derive(Parser)]
#[command(name = "rhi-viewer", about = "Render command queue viewer")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// MSAA sample count for the backbuffer
    #[arg(long, default_value = "4")]
    samples: u32,

    /// Present without waiting for vertical sync
    #[arg(long)]
    no_vsync: bool,

    /// Cubes per side of the lattice
    #[arg(long, default_value = "8")]
    cubes: u32,

    /// Panic the render thread on backend misuse
    #[arg(long)]
    strict: bool,
}

/// Everything that exists only while the window does.
struct Session {
    window: Arc<Window>,
    queue: RenderCommandQueue,
    scene: WorldScene,
}

struct ViewerApp {
    cli: Cli,
    session: Option<Session>,
    camera: FlyCamera,
    keys_held: HashSet<KeyCode>,
    mouse_captured: bool,
    pending_resize: Option<(u32, u32)>,
    started: Instant,
    last_frame: Instant,
    last_report: Instant,
    failed: Option<anyhow::Error>,
}

impl ViewerApp {
    fn new(cli: Cli) -> Self {
        let now = Instant::now();
        Self {
            cli,
            session: None,
            camera: FlyCamera::default(),
            keys_held: HashSet::new(),
            mouse_captured: false,
            pending_resize: None,
            started: now,
            last_frame: now,
            last_report: now,
            failed: None,
        }
    }

    fn open(&mut self, event_loop: &ActiveEventLoop) -> Result<Session> {
        let attrs = Window::default_attributes()
            .with_title("rhi viewer")
            .with_inner_size(PhysicalSize::new(1280u32, 720));
        let window = Arc::new(event_loop.create_window(attrs)?);
        let size = window.inner_size();
        let size = (size.width.max(1), size.height.max(1));
        let options = SurfaceOptions {
            width: size.0,
            height: size.1,
            sample_count: self.cli.samples.max(1),
            vsync: !self.cli.no_vsync,
        };

        let config = QueueConfig {
            strict: self.cli.strict,
            watchdog: Some(Duration::from_secs(2)),
            ..QueueConfig::default()
        };
        let target = window.clone();
        let mut queue =
            RenderCommandQueue::start(config, move || WgpuBackend::new(target, options))?;
        tracing::info!(backend = queue.backend_name(), "render thread ready");

        self.camera.set_viewport(size.0, size.1);
        let scene = WorldScene::load(
            &mut queue,
            size,
            options.sample_count,
            self.cli.cubes.max(1),
        );
        queue.flush()?;
        Ok(Session {
            window,
            queue,
            scene,
        })
    }

    fn movement(&self) -> MoveInput {
        let held = |key| self.keys_held.contains(&key);
        MoveInput {
            forward: held(KeyCode::KeyW),
            back: held(KeyCode::KeyS),
            left: held(KeyCode::KeyA),
            right: held(KeyCode::KeyD),
            up: held(KeyCode::Space),
            down: held(KeyCode::ControlLeft),
            fast: held(KeyCode::ShiftLeft),
        }
    }

    fn redraw(&mut self) -> Result<()> {
        let now = Instant::now();
        let dt = (now - self.last_frame).as_secs_f32().min(0.1);
        self.last_frame = now;
        self.camera.advance(self.movement(), dt);

        let Some(session) = &mut self.session else {
            return Ok(());
        };
        let resize = self.pending_resize.take();
        if let Some((width, height)) = resize {
            self.camera.set_viewport(width, height);
        }
        let time = (now - self.started).as_secs_f32();
        session
            .scene
            .encode_frame(&mut session.queue, &self.camera, time, resize);
        session.queue.flush()?;

        for failure in session.queue.take_failures() {
            tracing::warn!(%failure, "render record failed");
        }
        if now - self.last_report >= Duration::from_secs(1) {
            self.last_report = now;
            let stats = session.queue.stats();
            session.window.set_title(&format!(
                "rhi viewer [{}] frame {} drain {:.2} ms",
                session.queue.backend_name(),
                stats.frames_presented,
                stats.average_drain.as_secs_f64() * 1e3
            ));
            tracing::debug!(?stats, "render stats");
        }
        Ok(())
    }

    fn close(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.scene.release(&mut session.queue);
            session.queue.shutdown();
        }
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, error: anyhow::Error) {
        tracing::error!(%error, "viewer stopped");
        self.failed = Some(error);
        self.close();
        event_loop.exit();
    }
}

impl ApplicationHandler for ViewerApp {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.session.is_some() {
            return;
        }
        match self.open(event_loop) {
            Ok(session) => self.session = Some(session),
            Err(error) => self.fail(event_loop, error),
        }
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _window_id: WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                self.close();
                event_loop.exit();
            }
            WindowEvent::Resized(new_size) => {
                if new_size.width > 0 && new_size.height > 0 {
                    self.pending_resize = Some((new_size.width, new_size.height));
                }
            }
            WindowEvent::KeyboardInput {
                event:
                    KeyEvent {
                        physical_key: PhysicalKey::Code(key),
                        state,
                        ..
                    },
                ..
            } => {
                if state == ElementState::Pressed {
                    if key == KeyCode::Escape {
                        self.close();
                        event_loop.exit();
                        return;
                    }
                    self.keys_held.insert(key);
                } else {
                    self.keys_held.remove(&key);
                }
            }
            WindowEvent::MouseInput {
                button: MouseButton::Right,
                state,
                ..
            } => {
                self.mouse_captured = state == ElementState::Pressed;
                if let Some(session) = &self.session {
                    session.window.set_cursor_visible(!self.mouse_captured);
                }
            }
            WindowEvent::RedrawRequested => {
                if let Err(error) = self.redraw() {
                    self.fail(event_loop, error);
                }
            }
            _ => {}
        }
    }

    fn device_event(
        &mut self,
        _event_loop: &ActiveEventLoop,
        _device_id: winit::event::DeviceId,
        event: DeviceEvent,
    ) {
        if let DeviceEvent::MouseMotion { delta } = event {
            if self.mouse_captured {
                self.camera.rotate(delta.0 as f32, delta.1 as f32);
            }
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(session) = &self.session {
            session.window.request_redraw();
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    tracing::info!("rhi-viewer starting");

    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut app = ViewerApp::new(cli);
    event_loop.run_app(&mut app)?;
    app.close();

    match app.failed.take() {
        Some(error) => Err(error),
        None => Ok(()),
    }
}
