//! GPU backend: toppling, doubling, color mapping, and the stability
//! reduction as wgpu compute shaders.
//!
//! The WGSL source is generated at construction with the grid shape,
//! threshold, and kernel taps baked in as constants, so the compiled
//! pipelines are specialized to one run's geometry. Cell storage is `u32`
//! (WGSL has no 64-bit integers); the startup capacity check guarantees the
//! configured magnitudes fit. Stepping ping-pongs between two buffers, and
//! only stability checks, renders, and grid snapshots read back to the CPU.

use std::borrow::Cow;

use crate::backend::PileBackend;
use crate::emitter::Frame;
use crate::grid::{Grid, Kernel};

fn shader_source(height: usize, width: usize, kernel: &Kernel) -> String {
    let n = height * width;
    let mut taps = String::new();
    for &(dy, dx, weight) in kernel.taps() {
        taps.push_str(&format!(
            "    if (y + ({dy}) >= 0 && y + ({dy}) < {height} && x + ({dx}) >= 0 && x + ({dx}) < {width}) {{\n\
             \x20       acc = acc + {weight}u * (src[u32(y + ({dy})) * {width}u + u32(x + ({dx}))] / THRESHOLD);\n\
             \x20   }}\n"
        ));
    }
    format!(
        r#"const THRESHOLD: u32 = {threshold}u;

@group(0) @binding(0) var<storage, read> src: array<u32>;
@group(0) @binding(1) var<storage, read_write> dst: array<u32>;
@group(0) @binding(2) var<storage, read_write> rgb: array<u32>;
@group(0) @binding(3) var<storage, read_write> tallest: atomic<u32>;
@group(0) @binding(4) var<uniform> colour: vec4<u32>;

@compute @workgroup_size(16, 16)
fn topple(@builtin(global_invocation_id) gid: vec3<u32>) {{
    if (gid.x >= {width}u || gid.y >= {height}u) {{
        return;
    }}
    let x = i32(gid.x);
    let y = i32(gid.y);
    var acc: u32 = src[gid.y * {width}u + gid.x] % THRESHOLD;
{taps}    dst[gid.y * {width}u + gid.x] = acc;
}}

@compute @workgroup_size(256)
fn double_cells(@builtin(global_invocation_id) gid: vec3<u32>) {{
    if (gid.x >= {n}u) {{
        return;
    }}
    dst[gid.x] = src[gid.x] * 2u;
}}

@compute @workgroup_size(256)
fn colour_map(@builtin(global_invocation_id) gid: vec3<u32>) {{
    if (gid.x >= {n}u) {{
        return;
    }}
    let v = src[gid.x] % 256u;
    let r = (colour.x * v) % 256u;
    let g = (colour.y * v) % 256u;
    let b = (colour.z * v) % 256u;
    rgb[gid.x] = (r << 16u) | (g << 8u) | b;
}}

@compute @workgroup_size(256)
fn max_grains(@builtin(global_invocation_id) gid: vec3<u32>) {{
    if (gid.x >= {n}u) {{
        return;
    }}
    atomicMax(&tallest, src[gid.x]);
}}
"#,
        threshold = kernel.threshold(),
        height = height,
        width = width,
        n = n,
        taps = taps,
    )
}

pub struct GpuPile {
    device: wgpu::Device,
    queue: wgpu::Queue,
    topple_pipeline: wgpu::ComputePipeline,
    double_pipeline: wgpu::ComputePipeline,
    colour_pipeline: wgpu::ComputePipeline,
    max_pipeline: wgpu::ComputePipeline,
    colour_buffer: wgpu::Buffer,
    max_buffer: wgpu::Buffer,
    staging_buffer: wgpu::Buffer,
    buffers: [wgpu::Buffer; 2],
    bind_groups: [wgpu::BindGroup; 2],
    rgb_buffer: wgpu::Buffer,
    /// Index of the buffer currently holding the pile.
    current: usize,
    height: usize,
    width: usize,
    threshold: u64,
}

impl GpuPile {
    /// Returns None when no suitable adapter exists; callers fall back to
    /// the CPU backend.
    pub fn new(grid: &Grid, kernel: &Kernel) -> Option<Self> {
        pollster::block_on(Self::new_async(grid, kernel))
    }

    async fn new_async(grid: &Grid, kernel: &Kernel) -> Option<Self> {
        let height = grid.height();
        let width = grid.width();
        let n = height * width;

        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::PRIMARY,
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await?;

        println!("GPU Adapter: {:?}", adapter.get_info().name);

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("Sandpile"),
                    required_features: wgpu::Features::empty(),
                    required_limits: wgpu::Limits::default(),
                },
                None,
            )
            .await
            .ok()?;

        let source = shader_source(height, width, kernel);
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Sandpile Shader"),
            source: wgpu::ShaderSource::Wgsl(Cow::Owned(source)),
        });

        let cell_bytes = (n * 4) as u64;
        let make_cell_buffer = |label| {
            device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(label),
                size: cell_bytes,
                usage: wgpu::BufferUsages::STORAGE
                    | wgpu::BufferUsages::COPY_DST
                    | wgpu::BufferUsages::COPY_SRC,
                mapped_at_creation: false,
            })
        };
        let buffers = [make_cell_buffer("Pile A"), make_cell_buffer("Pile B")];

        let rgb_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Rgb"),
            size: cell_bytes,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });

        let max_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Max"),
            size: 4,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_DST
                | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });

        let colour_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Colour"),
            size: 16,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let staging_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Staging"),
            size: cell_bytes.max(4),
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        let storage_entry = |binding, read_only| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Storage { read_only },
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        };
        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Sandpile Bind Group Layout"),
            entries: &[
                storage_entry(0, true),
                storage_entry(1, false),
                storage_entry(2, false),
                storage_entry(3, false),
                wgpu::BindGroupLayoutEntry {
                    binding: 4,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
            ],
        });

        // One bind group per ping-pong orientation; shared resources repeat.
        let make_bind_group = |label, src: &wgpu::Buffer, dst: &wgpu::Buffer| {
            device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some(label),
                layout: &bind_group_layout,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: src.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: dst.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 2,
                        resource: rgb_buffer.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 3,
                        resource: max_buffer.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 4,
                        resource: colour_buffer.as_entire_binding(),
                    },
                ],
            })
        };
        let bind_groups = [
            make_bind_group("Sandpile A->B", &buffers[0], &buffers[1]),
            make_bind_group("Sandpile B->A", &buffers[1], &buffers[0]),
        ];

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Sandpile Pipeline Layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });
        let make_pipeline = |label, entry_point| {
            device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(label),
                layout: Some(&pipeline_layout),
                module: &shader,
                entry_point,
                compilation_options: Default::default(),
            })
        };
        let topple_pipeline = make_pipeline("Topple", "topple");
        let double_pipeline = make_pipeline("Double", "double_cells");
        let colour_pipeline = make_pipeline("ColourMap", "colour_map");
        let max_pipeline = make_pipeline("MaxGrains", "max_grains");

        let cells: Vec<u32> = grid.cells().iter().map(|&v| v as u32).collect();
        queue.write_buffer(&buffers[0], 0, bytemuck::cast_slice(&cells));

        Some(Self {
            device,
            queue,
            topple_pipeline,
            double_pipeline,
            colour_pipeline,
            max_pipeline,
            colour_buffer,
            max_buffer,
            staging_buffer,
            buffers,
            bind_groups,
            rgb_buffer,
            current: 0,
            height,
            width,
            threshold: kernel.threshold(),
        })
    }

    fn cell_count(&self) -> usize {
        self.height * self.width
    }

    fn linear_workgroups(&self) -> u32 {
        ((self.cell_count() + 255) / 256) as u32
    }

    /// Copy `size` bytes of `buffer` through the staging buffer to the CPU.
    fn read_back(&self, buffer: &wgpu::Buffer, size: u64) -> Vec<u8> {
        let mut encoder = self.device.create_command_encoder(&Default::default());
        encoder.copy_buffer_to_buffer(buffer, 0, &self.staging_buffer, 0, size);
        self.queue.submit(Some(encoder.finish()));

        let slice = self.staging_buffer.slice(..size);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            tx.send(result).unwrap();
        });
        self.device.poll(wgpu::Maintain::Wait);
        rx.recv().unwrap().unwrap();

        let data = slice.get_mapped_range();
        let result = data.to_vec();
        drop(data);
        self.staging_buffer.unmap();
        result
    }
}

impl PileBackend for GpuPile {
    fn step_batch(&mut self, iterations: usize) {
        let groups_x = ((self.width + 15) / 16) as u32;
        let groups_y = ((self.height + 15) / 16) as u32;

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Topple Batch"),
            });
        for _ in 0..iterations {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("Topple Pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.topple_pipeline);
            pass.set_bind_group(0, &self.bind_groups[self.current], &[]);
            pass.dispatch_workgroups(groups_x, groups_y, 1);
            drop(pass);
            self.current = 1 - self.current;
        }
        self.queue.submit(Some(encoder.finish()));
        self.device.poll(wgpu::Maintain::Wait);
    }

    fn is_stable(&mut self) -> bool {
        self.queue
            .write_buffer(&self.max_buffer, 0, &0u32.to_le_bytes());

        let mut encoder = self.device.create_command_encoder(&Default::default());
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("Max Pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.max_pipeline);
            pass.set_bind_group(0, &self.bind_groups[self.current], &[]);
            pass.dispatch_workgroups(self.linear_workgroups(), 1, 1);
        }
        self.queue.submit(Some(encoder.finish()));

        let raw = self.read_back(&self.max_buffer, 4);
        let tallest = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
        (tallest as u64) < self.threshold
    }

    fn double(&mut self) {
        let mut encoder = self.device.create_command_encoder(&Default::default());
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("Double Pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.double_pipeline);
            pass.set_bind_group(0, &self.bind_groups[self.current], &[]);
            pass.dispatch_workgroups(self.linear_workgroups(), 1, 1);
        }
        self.queue.submit(Some(encoder.finish()));
        self.current = 1 - self.current;
        self.device.poll(wgpu::Maintain::Wait);
    }

    fn render_rgb(&mut self, colour: [u8; 3]) -> Frame {
        let colour_words = [colour[0] as u32, colour[1] as u32, colour[2] as u32, 0u32];
        self.queue
            .write_buffer(&self.colour_buffer, 0, bytemuck::cast_slice(&colour_words));

        let mut encoder = self.device.create_command_encoder(&Default::default());
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("Colour Pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.colour_pipeline);
            pass.set_bind_group(0, &self.bind_groups[self.current], &[]);
            pass.dispatch_workgroups(self.linear_workgroups(), 1, 1);
        }
        self.queue.submit(Some(encoder.finish()));

        let raw = self.read_back(&self.rgb_buffer, (self.cell_count() * 4) as u64);
        let packed: &[u32] = bytemuck::cast_slice(&raw);
        let mut pixels = vec![0u8; self.cell_count() * 3];
        for (px, &word) in pixels.chunks_mut(3).zip(packed.iter()) {
            px[0] = ((word >> 16) & 0xFF) as u8;
            px[1] = ((word >> 8) & 0xFF) as u8;
            px[2] = (word & 0xFF) as u8;
        }
        Frame {
            width: self.width,
            height: self.height,
            pixels,
        }
    }

    fn grid(&mut self) -> Grid {
        let raw = self.read_back(&self.buffers[self.current], (self.cell_count() * 4) as u64);
        let words: &[u32] = bytemuck::cast_slice(&raw);
        let cells = words.iter().map(|&v| v as u64).collect();
        Grid::from_parts(self.height, self.width, cells)
    }

    fn name(&self) -> &'static str {
        "gpu"
    }
}
