use rhi_render::{BackendError, BackendResult};
use std::sync::Arc;

/// Window surface configuration requested by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceOptions {
    pub width: u32,
    pub height: u32,
    /// `1` renders straight into the swapchain image; more allocates a
    /// multisampled backbuffer resolved into it.
    pub sample_count: u32,
    pub vsync: bool,
}

impl Default for SurfaceOptions {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            sample_count: 1,
            vsync: true,
        }
    }
}

enum Target {
    Window {
        surface: wgpu::Surface<'static>,
        config: wgpu::SurfaceConfiguration,
    },
    /// Headless: a plain texture stands in for the swapchain image.
    Offscreen { texture: wgpu::Texture },
}

/// The frame's backbuffer for the duration of one frame.
pub struct Acquired {
    pub view: Arc<wgpu::TextureView>,
    surface_texture: Option<wgpu::SurfaceTexture>,
    /// The surface had to be reconfigured before an image could be taken.
    pub recovered: bool,
}

impl Acquired {
    pub fn present(self) {
        if let Some(texture) = self.surface_texture {
            texture.present();
        }
    }
}

pub struct Presenter {
    target: Target,
    format: wgpu::TextureFormat,
    size: (u32, u32),
    sample_count: u32,
    msaa: Option<Arc<wgpu::TextureView>>,
}

impl Presenter {
    pub fn window(
        surface: wgpu::Surface<'static>,
        adapter: &wgpu::Adapter,
        device: &wgpu::Device,
        options: &SurfaceOptions,
    ) -> BackendResult<Self> {
        let caps = surface.get_capabilities(adapter);
        let format = caps
            .formats
            .iter()
            .find(|f| f.is_srgb())
            .or_else(|| caps.formats.first())
            .copied()
            .ok_or_else(|| BackendError::Init("surface reports no formats".into()))?;
        let present_mode = if options.vsync {
            wgpu::PresentMode::AutoVsync
        } else {
            wgpu::PresentMode::AutoNoVsync
        };
        let config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            format,
            width: options.width.max(1),
            height: options.height.max(1),
            present_mode,
            alpha_mode: caps
                .alpha_modes
                .first()
                .copied()
                .unwrap_or(wgpu::CompositeAlphaMode::Auto),
            view_formats: vec![],
            desired_maximum_frame_latency: 2,
        };
        surface.configure(device, &config);
        let mut presenter = Self {
            size: (config.width, config.height),
            target: Target::Window { surface, config },
            format,
            sample_count: options.sample_count.max(1),
            msaa: None,
        };
        presenter.rebuild_msaa(device);
        Ok(presenter)
    }

    pub fn headless(device: &wgpu::Device, width: u32, height: u32, sample_count: u32) -> Self {
        let format = wgpu::TextureFormat::Rgba8UnormSrgb;
        let size = (width.max(1), height.max(1));
        let mut presenter = Self {
            target: Target::Offscreen {
                texture: offscreen_texture(device, format, size),
            },
            format,
            size,
            sample_count: sample_count.max(1),
            msaa: None,
        };
        presenter.rebuild_msaa(device);
        presenter
    }

    pub fn format(&self) -> wgpu::TextureFormat {
        self.format
    }

    pub fn size(&self) -> (u32, u32) {
        self.size
    }

    pub fn sample_count(&self) -> u32 {
        self.sample_count
    }

    pub fn is_headless(&self) -> bool {
        matches!(self.target, Target::Offscreen { .. })
    }

    /// The multisampled color buffer resolved into the backbuffer, if any.
    pub fn msaa_view(&self) -> Option<&Arc<wgpu::TextureView>> {
        self.msaa.as_ref()
    }

    /// Takes the next backbuffer image. Lost and outdated surfaces are
    /// reconfigured once and retried.
    pub fn acquire(&mut self, device: &wgpu::Device) -> BackendResult<Acquired> {
        match &self.target {
            Target::Offscreen { texture } => Ok(Acquired {
                view: Arc::new(texture.create_view(&Default::default())),
                surface_texture: None,
                recovered: false,
            }),
            Target::Window { surface, config } => {
                let (texture, recovered) = match surface.get_current_texture() {
                    Ok(texture) => (texture, false),
                    Err(wgpu::SurfaceError::Lost | wgpu::SurfaceError::Outdated) => {
                        tracing::debug!("surface lost or outdated; reconfiguring");
                        surface.configure(device, config);
                        let texture = surface
                            .get_current_texture()
                            .map_err(|e| BackendError::Surface(e.to_string()))?;
                        (texture, true)
                    }
                    Err(e) => return Err(BackendError::Surface(e.to_string())),
                };
                Ok(Acquired {
                    view: Arc::new(texture.texture.create_view(&Default::default())),
                    surface_texture: Some(texture),
                    recovered,
                })
            }
        }
    }

    pub fn resize(&mut self, device: &wgpu::Device, width: u32, height: u32) {
        let size = (width.max(1), height.max(1));
        if size == self.size {
            return;
        }
        self.size = size;
        self.reconfigure(device);
        tracing::debug!(width = size.0, height = size.1, "backbuffer resized");
    }

    /// Rebuilds every size- or device-dependent object, e.g. after a resize
    /// or a device loss.
    pub fn reconfigure(&mut self, device: &wgpu::Device) {
        let (format, size) = (self.format, self.size);
        match &mut self.target {
            Target::Window { surface, config } => {
                config.width = size.0;
                config.height = size.1;
                surface.configure(device, config);
            }
            Target::Offscreen { texture } => {
                *texture = offscreen_texture(device, format, size);
            }
        }
        self.rebuild_msaa(device);
    }

    fn rebuild_msaa(&mut self, device: &wgpu::Device) {
        self.msaa = (self.sample_count > 1).then(|| {
            let texture = device
                .create_texture(&wgpu::TextureDescriptor {
                    label: Some("rhi msaa backbuffer"),
                    size: wgpu::Extent3d {
                        width: self.size.0,
                        height: self.size.1,
                        depth_or_array_layers: 1,
                    },
                    mip_level_count: 1,
                    sample_count: self.sample_count,
                    dimension: wgpu::TextureDimension::D2,
                    format: self.format,
                    usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
                    view_formats: &[],
                });
            Arc::new(texture.create_view(&Default::default()))
        });
    }
}

fn offscreen_texture(
    device: &wgpu::Device,
    format: wgpu::TextureFormat,
    size: (u32, u32),
) -> wgpu::Texture {
    device.create_texture(&wgpu::TextureDescriptor {
        label: Some("rhi offscreen backbuffer"),
        size: wgpu::Extent3d {
            width: size.0,
            height: size.1,
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format,
        usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
        view_formats: &[],
    })
}
