//! Small self-contained scene the CLI encodes: a spinning triangle fan with a
//! per-frame constant buffer, an occlusion query and an optional timestamp.

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};
use rhi_common::*;
use rhi_queue::RenderCommandQueue;

const SCENE_WGSL: &str = r#"
struct FrameConstants {
    transform: mat4x4<f32>,
    tint: vec4<f32>,
};

@group(0) @binding(0) var<uniform> frame: FrameConstants;

struct VsOut {
    @builtin(position) position: vec4<f32>,
    @location(0) color: vec3<f32>,
};

@vertex
fn vs_main(@location(0) position: vec2<f32>, @location(1) color: vec3<f32>) -> VsOut {
    var out: VsOut;
    out.position = frame.transform * vec4<f32>(position, 0.0, 1.0);
    out.color = color * frame.tint.rgb;
    return out;
}

@fragment
fn ps_main(in: VsOut) -> @location(0) vec4<f32> {
    return vec4<f32>(in.color, 1.0);
}
"#;

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct Vertex {
    position: [f32; 2],
    color: [f32; 3],
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct FrameConstants {
    transform: [[f32; 4]; 4],
    tint: [f32; 4],
}

#[rustfmt::skip]
const VERTICES: [Vertex; 6] = [
    Vertex { position: [0.0, 0.7], color: [1.0, 0.2, 0.2] },
    Vertex { position: [-0.6, -0.4], color: [0.2, 1.0, 0.2] },
    Vertex { position: [0.6, -0.4], color: [0.2, 0.2, 1.0] },
    Vertex { position: [0.0, -0.7], color: [1.0, 1.0, 0.2] },
    Vertex { position: [0.6, 0.4], color: [0.2, 1.0, 1.0] },
    Vertex { position: [-0.6, 0.4], color: [1.0, 0.2, 1.0] },
];

pub struct Scene {
    vertex_shader: ResourceHandle,
    pixel_shader: ResourceHandle,
    layout: ResourceHandle,
    vertices: ResourceHandle,
    constants: ResourceHandle,
    blend: ResourceHandle,
    pub occlusion: ResourceHandle,
    pub timestamp: Option<ResourceHandle>,
}

impl Scene {
    /// Encodes every creation record. Nothing exists on the backend until
    /// the next flush is drained.
    pub fn load(queue: &mut RenderCommandQueue, timestamps: bool) -> Self {
        let source = |stage, entry_point| ShaderSource {
            stage,
            format: ShaderFormat::Wgsl,
            entry_point,
            bytecode: SCENE_WGSL.as_bytes(),
        };
        let vertex_shader = queue.load_shader(&source(ShaderStage::Vertex, "vs_main"));
        let pixel_shader = queue.load_shader(&source(ShaderStage::Pixel, "ps_main"));
        let layout = queue.create_input_layout(&[
            InputElement {
                location: 0,
                format: VertexFormat::Float32x2,
                buffer_slot: 0,
                offset: 0,
                rate: InputRate::PerVertex,
            },
            InputElement {
                location: 1,
                format: VertexFormat::Float32x3,
                buffer_slot: 0,
                offset: 8,
                rate: InputRate::PerVertex,
            },
        ]);
        let bytes: &[u8] = bytemuck::cast_slice(&VERTICES);
        let vertices = queue.create_buffer(
            &BufferDesc {
                usage: Usage::Immutable,
                ..BufferDesc::vertex(bytes.len() as u64)
            },
            Some(bytes),
        );
        let constants = queue.create_buffer(
            &BufferDesc::constant(std::mem::size_of::<FrameConstants>() as u64),
            None,
        );
        let blend = queue.create_blend_state(&BlendDesc {
            targets: vec![BlendTargetDesc::alpha_blend()],
            ..Default::default()
        });
        let occlusion = queue.create_query(QueryKind::Occlusion);
        let timestamp = timestamps.then(|| queue.create_query(QueryKind::Timestamp));
        Self {
            vertex_shader,
            pixel_shader,
            layout,
            vertices,
            constants,
            blend,
            occlusion,
            timestamp,
        }
    }

    /// Encodes one frame into the backbuffer, `present` included.
    pub fn encode_frame(&self, queue: &mut RenderCommandQueue, frame: u64, size: (u32, u32)) {
        let angle = frame as f32 * 0.05;
        let aspect = size.0 as f32 / size.1.max(1) as f32;
        let transform = Mat4::from_scale(Vec3::new(1.0 / aspect.max(1.0), 1.0, 1.0))
            * Mat4::from_rotation_z(angle);
        let constants = FrameConstants {
            transform: transform.to_cols_array_2d(),
            tint: [1.0, 1.0, 1.0, 1.0],
        };

        queue.push_marker("scene");
        if let Some(timestamp) = self.timestamp {
            queue.begin_query(timestamp);
        }
        queue.update_buffer(self.constants, 0, bytemuck::bytes_of(&constants));
        queue.set_targets(&[ResourceHandle::NULL], ResourceHandle::NULL);
        queue.set_viewport(Viewport::full(size.0, size.1));
        queue.clear(ClearDesc::color([0.08, 0.08, 0.1, 1.0]));
        queue.set_shader(ShaderStage::Vertex, self.vertex_shader);
        queue.set_shader(ShaderStage::Pixel, self.pixel_shader);
        queue.set_raster_state(RasterDesc {
            cull: CullMode::None,
            ..Default::default()
        });
        queue.set_input_layout(self.layout);
        queue.set_vertex_buffer(self.vertices, 0, std::mem::size_of::<Vertex>() as u32, 0);
        queue.set_constant_buffer(ShaderStage::Vertex, 0, self.constants);
        queue.set_blend_state(self.blend, [0.0; 4]);
        queue.begin_query(self.occlusion);
        queue.draw(VERTICES.len() as u32, 0, PrimitiveTopology::TriangleList);
        queue.end_query(self.occlusion);
        if let Some(timestamp) = self.timestamp {
            queue.end_query(timestamp);
        }
        queue.pop_marker();
        queue.present();
    }

    /// Drops the timestamp query after its creation failed on the backend.
    pub fn disable_timestamps(&mut self, queue: &mut RenderCommandQueue) {
        if let Some(timestamp) = self.timestamp.take() {
            queue.release_query(timestamp);
        }
    }

    pub fn release(self, queue: &mut RenderCommandQueue) {
        if let Some(timestamp) = self.timestamp {
            queue.release_query(timestamp);
        }
        queue.release_query(self.occlusion);
        queue.release_blend_state(self.blend);
        queue.release_buffer(self.constants);
        queue.release_buffer(self.vertices);
        queue.release_input_layout(self.layout);
        queue.release_shader(self.pixel_shader);
        queue.release_shader(self.vertex_shader);
    }
}
