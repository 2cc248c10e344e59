use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Quat, Vec3};
use rhi_common::*;
use rhi_queue::RenderCommandQueue;

use crate::camera::FlyCamera;
use crate::shaders;

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
struct CameraConstants {
    view_proj: [[f32; 4]; 4],
}

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
struct Vertex {
    position: [f32; 3],
    normal: [f32; 3],
}

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
struct InstanceData {
    model: [[f32; 4]; 4],
    color: [f32; 4],
}

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
struct GridVertex {
    position: [f32; 3],
    color: [f32; 4],
}

/// Unit cube as a plain triangle list, counter-clockwise when seen from
/// outside.
fn cube_mesh() -> Vec<Vertex> {
    const FACES: [([f32; 3], [f32; 3], [f32; 3]); 6] = [
        ([0.0, 0.0, 1.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]),
        ([0.0, 0.0, -1.0], [-1.0, 0.0, 0.0], [0.0, 1.0, 0.0]),
        ([1.0, 0.0, 0.0], [0.0, 0.0, -1.0], [0.0, 1.0, 0.0]),
        ([-1.0, 0.0, 0.0], [0.0, 0.0, 1.0], [0.0, 1.0, 0.0]),
        ([0.0, 1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, -1.0]),
        ([0.0, -1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, 1.0]),
    ];
    let mut vertices = Vec::with_capacity(36);
    for (normal, u, v) in FACES {
        let (n, u, v) = (Vec3::from(normal), Vec3::from(u), Vec3::from(v));
        let corner = |su: f32, sv: f32| Vertex {
            position: (n * 0.5 + u * su * 0.5 + v * sv * 0.5).to_array(),
            normal,
        };
        let quad = [corner(-1.0, -1.0), corner(1.0, -1.0), corner(1.0, 1.0), corner(-1.0, 1.0)];
        vertices.extend([0, 1, 2, 2, 3, 0].map(|i| quad[i]));
    }
    vertices
}

fn grid_mesh(half_extent: i32, spacing: f32) -> Vec<GridVertex> {
    let color = [0.4, 0.4, 0.4, 1.0];
    let extent = half_extent as f32 * spacing;
    (-half_extent..=half_extent)
        .flat_map(|i| {
            let offset = i as f32 * spacing;
            [
                [-extent, 0.0, offset],
                [extent, 0.0, offset],
                [offset, 0.0, -extent],
                [offset, 0.0, extent],
            ]
        })
        .map(|position| GridVertex { position, color })
        .collect()
}

/// Cubes on a square lattice, bobbing and turning with `time`.
fn cube_instances(per_side: u32, time: f32) -> Vec<InstanceData> {
    let half = (per_side as f32 - 1.0) * 0.5;
    let mut instances = Vec::with_capacity((per_side * per_side) as usize);
    for x in 0..per_side {
        for z in 0..per_side {
            let phase = (x * 7 + z * 3) as f32 * 0.37;
            let position = Vec3::new(
                (x as f32 - half) * 2.5,
                0.75 + (time * 1.5 + phase).sin() * 0.5,
                (z as f32 - half) * 2.5,
            );
            let model = Mat4::from_rotation_translation(
                Quat::from_rotation_y(time * 0.8 + phase),
                position,
            );
            let t = x as f32 / per_side.max(2) as f32;
            let s = z as f32 / per_side.max(2) as f32;
            instances.push(InstanceData {
                model: model.to_cols_array_2d(),
                color: [0.3 + 0.7 * t, 0.5, 0.3 + 0.7 * s, 1.0],
            });
        }
    }
    instances
}

/// Handles of everything the viewer draws. All creation happens at encode
/// time; the render thread builds the objects on its next drain.
pub struct WorldScene {
    cube_vs: ResourceHandle,
    cube_ps: ResourceHandle,
    grid_vs: ResourceHandle,
    grid_ps: ResourceHandle,
    cube_layout: ResourceHandle,
    grid_layout: ResourceHandle,
    cube_vertices: ResourceHandle,
    grid_vertices: ResourceHandle,
    instances: ResourceHandle,
    camera: ResourceHandle,
    depth_state: ResourceHandle,
    depth_target: ResourceHandle,
    cube_vertex_count: u32,
    grid_vertex_count: u32,
    per_side: u32,
    size: (u32, u32),
    sample_count: u32,
}

impl WorldScene {
    pub fn load(
        queue: &mut RenderCommandQueue,
        size: (u32, u32),
        sample_count: u32,
        per_side: u32,
    ) -> Self {
        let wgsl = |source: &'static str, stage, entry_point| ShaderSource {
            stage,
            format: ShaderFormat::Wgsl,
            entry_point,
            bytecode: source.as_bytes(),
        };
        let cube_vs = queue.load_shader(&wgsl(shaders::CUBE_WGSL, ShaderStage::Vertex, "vs_cube"));
        let cube_ps = queue.load_shader(&wgsl(shaders::CUBE_WGSL, ShaderStage::Pixel, "ps_cube"));
        let grid_vs = queue.load_shader(&wgsl(shaders::GRID_WGSL, ShaderStage::Vertex, "vs_grid"));
        let grid_ps = queue.load_shader(&wgsl(shaders::GRID_WGSL, ShaderStage::Pixel, "ps_grid"));

        let element = |location, format, buffer_slot, offset, rate| InputElement {
            location,
            format,
            buffer_slot,
            offset,
            rate,
        };
        let mut cube_elements = vec![
            element(0, VertexFormat::Float32x3, 0, 0, InputRate::PerVertex),
            element(1, VertexFormat::Float32x3, 0, 12, InputRate::PerVertex),
        ];
        for row in 0..5u32 {
            cube_elements.push(element(
                2 + row,
                VertexFormat::Float32x4,
                1,
                row * 16,
                InputRate::PerInstance,
            ));
        }
        let cube_layout = queue.create_input_layout(&cube_elements);
        let grid_layout = queue.create_input_layout(&[
            element(0, VertexFormat::Float32x3, 0, 0, InputRate::PerVertex),
            element(1, VertexFormat::Float32x4, 0, 12, InputRate::PerVertex),
        ]);

        let immutable = |bytes: &[u8]| BufferDesc {
            usage: Usage::Immutable,
            ..BufferDesc::vertex(bytes.len() as u64)
        };
        let cube = cube_mesh();
        let cube_bytes: &[u8] = bytemuck::cast_slice(&cube);
        let cube_vertices = queue.create_buffer(&immutable(cube_bytes), Some(cube_bytes));
        let grid = grid_mesh(20, 2.0);
        let grid_bytes: &[u8] = bytemuck::cast_slice(&grid);
        let grid_vertices = queue.create_buffer(&immutable(grid_bytes), Some(grid_bytes));

        let instance_bytes =
            (per_side * per_side) as u64 * std::mem::size_of::<InstanceData>() as u64;
        let instances = queue.create_buffer(
            &BufferDesc {
                usage: Usage::Dynamic,
                cpu_access: CpuAccess::WRITE,
                ..BufferDesc::vertex(instance_bytes)
            },
            None,
        );
        let camera = queue.create_buffer(
            &BufferDesc::constant(std::mem::size_of::<CameraConstants>() as u64),
            None,
        );
        let depth_state = queue.create_depth_stencil_state(&DepthStencilDesc::default());
        let depth_target = Self::create_depth(queue, size, sample_count);

        tracing::info!(cubes = per_side * per_side, grid_lines = grid.len() / 2, "scene loaded");
        Self {
            cube_vs,
            cube_ps,
            grid_vs,
            grid_ps,
            cube_layout,
            grid_layout,
            cube_vertices,
            grid_vertices,
            instances,
            camera,
            depth_state,
            depth_target,
            cube_vertex_count: cube.len() as u32,
            grid_vertex_count: grid.len() as u32,
            per_side,
            size,
            sample_count,
        }
    }

    fn create_depth(
        queue: &mut RenderCommandQueue,
        size: (u32, u32),
        sample_count: u32,
    ) -> ResourceHandle {
        queue.create_render_target(&RenderTargetDesc {
            width: size.0,
            height: size.1,
            format: TextureFormat::Depth32Float,
            sample_count,
            shader_visible: false,
        })
    }

    /// Encodes one frame, `present` included. A `resize` takes effect at
    /// that present; the depth target is replaced right after it so the next
    /// frame binds matching sizes.
    pub fn encode_frame(
        &mut self,
        queue: &mut RenderCommandQueue,
        camera: &FlyCamera,
        time: f32,
        resize: Option<(u32, u32)>,
    ) {
        let constants = CameraConstants {
            view_proj: camera.view_projection().to_cols_array_2d(),
        };
        let instances = cube_instances(self.per_side, time);

        queue.push_marker("frame");
        queue.update_buffer(self.camera, 0, bytemuck::bytes_of(&constants));
        queue.update_buffer(self.instances, 0, bytemuck::cast_slice(&instances));
        queue.set_targets(&[ResourceHandle::NULL], self.depth_target);
        queue.set_viewport(Viewport::full(self.size.0, self.size.1));
        queue.clear(ClearDesc::color([0.1, 0.1, 0.15, 1.0]).with_depth(1.0));
        queue.set_raster_state(RasterDesc {
            front_ccw: true,
            ..Default::default()
        });
        queue.set_depth_stencil_state(self.depth_state, 0);
        queue.set_constant_buffer(ShaderStage::Vertex, 0, self.camera);

        queue.push_marker("grid");
        queue.set_shader(ShaderStage::Vertex, self.grid_vs);
        queue.set_shader(ShaderStage::Pixel, self.grid_ps);
        queue.set_input_layout(self.grid_layout);
        queue.set_vertex_buffer(self.grid_vertices, 0, std::mem::size_of::<GridVertex>() as u32, 0);
        queue.draw(self.grid_vertex_count, 0, PrimitiveTopology::LineList);
        queue.pop_marker();

        queue.push_marker("cubes");
        queue.set_shader(ShaderStage::Vertex, self.cube_vs);
        queue.set_shader(ShaderStage::Pixel, self.cube_ps);
        queue.set_input_layout(self.cube_layout);
        queue.set_vertex_buffer(self.cube_vertices, 0, std::mem::size_of::<Vertex>() as u32, 0);
        queue.set_vertex_buffer(self.instances, 1, std::mem::size_of::<InstanceData>() as u32, 0);
        queue.draw_instanced(
            self.cube_vertex_count,
            instances.len() as u32,
            0,
            0,
            PrimitiveTopology::TriangleList,
        );
        queue.pop_marker();
        queue.pop_marker();

        if let Some(size) = resize {
            queue.request_resize(size.0, size.1);
        }
        queue.present();

        if let Some(size) = resize.filter(|s| *s != self.size) {
            queue.release_render_target(self.depth_target);
            self.depth_target = Self::create_depth(queue, size, self.sample_count);
            self.size = size;
            tracing::debug!(width = size.0, height = size.1, "depth target recreated");
        }
    }

    pub fn release(self, queue: &mut RenderCommandQueue) {
        queue.release_render_target(self.depth_target);
        queue.release_depth_stencil_state(self.depth_state);
        queue.release_buffer(self.camera);
        queue.release_buffer(self.instances);
        queue.release_buffer(self.grid_vertices);
        queue.release_buffer(self.cube_vertices);
        queue.release_input_layout(self.grid_layout);
        queue.release_input_layout(self.cube_layout);
        for shader in [self.grid_ps, self.grid_vs, self.cube_ps, self.cube_vs] {
            queue.release_shader(shader);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cube_faces_wind_outward() {
        let cube = cube_mesh();
        assert_eq!(cube.len(), 36);
        for tri in cube.chunks_exact(3) {
            let [a, b, c] = [tri[0], tri[1], tri[2]].map(|v| Vec3::from(v.position));
            let face_normal = (b - a).cross(c - a).normalize();
            assert!(face_normal.dot(Vec3::from(tri[0].normal)) > 0.99);
        }
    }

    #[test]
    fn grid_has_two_lines_per_step() {
        let grid = grid_mesh(2, 1.0);
        assert_eq!(grid.len(), 5 * 4);
        assert!(grid.iter().all(|v| v.position[1] == 0.0));
    }

    #[test]
    fn instances_fill_the_lattice() {
        let instances = cube_instances(4, 0.0);
        assert_eq!(instances.len(), 16);
        let size = std::mem::size_of::<InstanceData>();
        assert_eq!(size, 80);
    }
}
