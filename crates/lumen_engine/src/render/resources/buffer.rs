//! Host-visible buffers for meshes and uniforms
//!
//! Mesh buffers grow by recreation and shrink in place: data larger than the
//! current allocation gets a fresh buffer (new handle), anything that fits is
//! copied over the existing contents.

use std::sync::Arc;

use crate::render::api::{
    BufferHandle, BufferRegion, BufferUsage, DescriptorSetHandle, GpuDevice, MeshDraw, UniformBufferObject, Vertex,
    UNIFORM_REGION_ALIGNMENT,
};
use crate::render::resources::handle::Owned;
use crate::render::{RenderError, RenderResult};

/// Buffer with a fixed size and usage
pub struct GpuBuffer<D: GpuDevice> {
    buffer: Owned<D, BufferHandle>,
    size: u64,
    usage: BufferUsage,
}

impl<D: GpuDevice> GpuBuffer<D> {
    /// Create a buffer of `size` bytes
    pub fn create(device: &Arc<D>, size: u64, usage: BufferUsage) -> RenderResult<Self> {
        if size == 0 {
            return Err(RenderError::InvalidOperation("Cannot create a zero-sized buffer".to_string()));
        }
        let handle = device.create_buffer(size, usage)?;
        log::debug!("Created {usage:?} buffer {handle:?} ({size} bytes)");
        Ok(Self {
            buffer: Owned::new(Arc::clone(device), handle),
            size,
            usage,
        })
    }

    /// Copy bytes into the buffer at `offset`
    pub fn write(&self, offset: u64, data: &[u8]) -> RenderResult<()> {
        let end = offset + data.len() as u64;
        if end > self.size {
            return Err(RenderError::InvalidOperation(format!(
                "Write of {} bytes at offset {offset} overflows {}-byte buffer",
                data.len(),
                self.size
            )));
        }
        self.buffer.device().write_buffer(self.buffer.handle(), offset, data)
    }

    /// Raw handle
    pub fn handle(&self) -> BufferHandle {
        self.buffer.handle()
    }

    /// Allocated size in bytes
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Usage flags
    pub fn usage(&self) -> BufferUsage {
        self.usage
    }
}

/// What an upload did to the underlying buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferUpload {
    /// No buffer existed; one was created
    Created,
    /// The data outgrew the buffer; it was replaced with a larger one
    Recreated,
    /// The data fit; it was copied over the existing contents
    Copied,
    /// The data was empty; the buffer was left alone
    Cleared,
}

/// Buffer that is replaced only when its contents outgrow it
pub struct GrowableBuffer<D: GpuDevice> {
    device: Arc<D>,
    usage: BufferUsage,
    buffer: Option<GpuBuffer<D>>,
    len: u64,
}

impl<D: GpuDevice> GrowableBuffer<D> {
    /// Create an empty buffer slot; nothing is allocated until the first upload
    pub fn new(device: Arc<D>, usage: BufferUsage) -> Self {
        Self {
            device,
            usage,
            buffer: None,
            len: 0,
        }
    }

    /// Replace the contents
    ///
    /// The caller guarantees the GPU is no longer reading the buffer.
    pub fn upload(&mut self, bytes: &[u8]) -> RenderResult<BufferUpload> {
        let len = bytes.len() as u64;
        self.len = len;
        if bytes.is_empty() {
            return Ok(BufferUpload::Cleared);
        }

        if let Some(buffer) = self.buffer.as_ref().filter(|buffer| buffer.size() >= len) {
            buffer.write(0, bytes)?;
            return Ok(BufferUpload::Copied);
        }

        let outcome = if self.buffer.is_some() {
            BufferUpload::Recreated
        } else {
            BufferUpload::Created
        };
        // Old buffer is released before the replacement is allocated
        self.buffer = None;
        let buffer = GpuBuffer::create(&self.device, len, self.usage)?;
        buffer.write(0, bytes)?;
        self.buffer = Some(buffer);
        Ok(outcome)
    }

    /// Current buffer, if any data was ever uploaded
    pub fn buffer(&self) -> Option<&GpuBuffer<D>> {
        self.buffer.as_ref()
    }

    /// Length in bytes of the last upload
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether the last upload was empty
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Vertex and 16-bit index buffers of one object
pub struct MeshBuffers<D: GpuDevice> {
    vertices: GrowableBuffer<D>,
    indices: GrowableBuffer<D>,
    index_count: u32,
}

impl<D: GpuDevice> MeshBuffers<D> {
    /// Create empty mesh buffers
    pub fn new(device: &Arc<D>) -> Self {
        Self {
            vertices: GrowableBuffer::new(Arc::clone(device), BufferUsage::VERTEX),
            indices: GrowableBuffer::new(Arc::clone(device), BufferUsage::INDEX),
            index_count: 0,
        }
    }

    /// Upload vertices
    pub fn upload_vertices(&mut self, vertices: &[Vertex]) -> RenderResult<BufferUpload> {
        self.vertices.upload(bytemuck::cast_slice(vertices))
    }

    /// Upload indices
    pub fn upload_indices(&mut self, indices: &[u16]) -> RenderResult<BufferUpload> {
        let outcome = self.indices.upload(bytemuck::cast_slice(indices))?;
        self.index_count = u32::try_from(indices.len())
            .map_err(|_| RenderError::InvalidOperation(format!("{} indices exceed u32", indices.len())))?;
        Ok(outcome)
    }

    /// Number of indices of the last upload
    pub fn index_count(&self) -> u32 {
        self.index_count
    }

    /// Vertex buffer handle
    pub fn vertex_buffer(&self) -> Option<BufferHandle> {
        self.vertices.buffer().map(GpuBuffer::handle)
    }

    /// Index buffer handle
    pub fn index_buffer(&self) -> Option<BufferHandle> {
        self.indices.buffer().map(GpuBuffer::handle)
    }

    /// Draw call for this mesh, or `None` when there is nothing to draw
    pub fn draw(&self, descriptor_set: DescriptorSetHandle) -> Option<MeshDraw> {
        if self.index_count == 0 || self.vertices.is_empty() {
            return None;
        }
        Some(MeshDraw {
            vertex_buffer: self.vertex_buffer()?,
            index_buffer: self.index_buffer()?,
            index_count: self.index_count,
            descriptor_set,
        })
    }
}

/// One uniform buffer split into an aligned region per frame slot
///
/// Frame `f` only touches region `f`, so writing it after waiting on slot
/// `f`'s fence never races with a frame the GPU is still reading.
pub struct UniformBuffer<D: GpuDevice> {
    buffer: GpuBuffer<D>,
    frames: usize,
    stride: u64,
}

impl<D: GpuDevice> UniformBuffer<D> {
    /// Create a buffer with `frames` regions
    pub fn create(device: &Arc<D>, frames: usize) -> RenderResult<Self> {
        let stride = Self::region_stride();
        let buffer = GpuBuffer::create(device, stride * frames as u64, BufferUsage::UNIFORM)?;
        Ok(Self { buffer, frames, stride })
    }

    /// Byte distance between consecutive frame regions
    pub fn region_stride() -> u64 {
        let size = std::mem::size_of::<UniformBufferObject>() as u64;
        size.div_ceil(UNIFORM_REGION_ALIGNMENT) * UNIFORM_REGION_ALIGNMENT
    }

    /// Write the matrices for one frame slot
    pub fn write(&self, frame: usize, ubo: &UniformBufferObject) -> RenderResult<()> {
        let region = self.region(frame)?;
        self.buffer.write(region.offset, bytemuck::bytes_of(ubo))
    }

    /// Region bound to the descriptor of one frame slot
    pub fn region(&self, frame: usize) -> RenderResult<BufferRegion> {
        if frame >= self.frames {
            return Err(RenderError::InvalidOperation(format!(
                "Frame {frame} outside uniform buffer with {} regions",
                self.frames
            )));
        }
        Ok(BufferRegion {
            buffer: self.buffer.handle(),
            offset: frame as u64 * self.stride,
            range: std::mem::size_of::<UniformBufferObject>() as u64,
        })
    }

    /// Raw handle
    pub fn handle(&self) -> BufferHandle {
        self.buffer.handle()
    }
}
