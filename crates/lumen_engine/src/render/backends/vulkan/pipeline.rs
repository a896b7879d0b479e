//! Fixed pipeline objects owned by the Vulkan device
//!
//! One color-only render pass, one descriptor set layout with a uniform
//! buffer at binding 0, one graphics pipeline with dynamic viewport and
//! scissor, and the command pool frame buffers are allocated from.

use std::ffi::CStr;
use std::fs::File;
use std::path::Path;

use ash::{vk, Device};

use super::vk_error;
use crate::render::api::Vertex;
use crate::render::{RenderError, RenderResult};

const ENTRY_POINT: &[u8] = b"main\0";

/// Compiled SPIR-V stage, destroyed once the pipeline is built
pub struct ShaderModule {
    device: Device,
    module: vk::ShaderModule,
}

impl ShaderModule {
    /// Create a shader module from SPIR-V words
    pub fn from_words(device: Device, words: &[u32]) -> RenderResult<Self> {
        let create_info = vk::ShaderModuleCreateInfo::builder().code(words);
        // SAFETY: create_info borrows words for the duration of the call
        let module =
            unsafe { device.create_shader_module(&create_info, None) }.map_err(vk_error("create_shader_module"))?;
        Ok(Self { device, module })
    }

    /// Load a shader from a SPIR-V file
    pub fn from_file(device: Device, path: &Path) -> RenderResult<Self> {
        let mut file = File::open(path)
            .map_err(|e| RenderError::Shader(format!("Failed to open shader file {}: {e}", path.display())))?;
        let words = ash::util::read_spv(&mut file)
            .map_err(|e| RenderError::Shader(format!("Invalid SPIR-V in {}: {e}", path.display())))?;
        log::debug!("Loaded shader {} ({} words)", path.display(), words.len());
        Self::from_words(device, &words)
    }

    fn stage_info(&self, stage: vk::ShaderStageFlags, entry_point: &CStr) -> vk::PipelineShaderStageCreateInfo {
        vk::PipelineShaderStageCreateInfo::builder()
            .stage(stage)
            .module(self.module)
            .name(entry_point)
            .build()
    }
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        // SAFETY: pipelines built from this module keep their own copy of the code
        unsafe { self.device.destroy_shader_module(self.module, None) };
    }
}

/// Color-only render pass that ends in `PRESENT_SRC_KHR`
pub struct RenderPass {
    device: Device,
    render_pass: vk::RenderPass,
}

impl RenderPass {
    /// Single subpass that clears a color attachment and leaves it ready to present
    pub fn new_color_pass(device: Device, color_format: vk::Format) -> RenderResult<Self> {
        let color_attachment = vk::AttachmentDescription::builder()
            .format(color_format)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .final_layout(vk::ImageLayout::PRESENT_SRC_KHR)
            .build();
        let attachments = [color_attachment];

        let color_refs = [vk::AttachmentReference::builder()
            .attachment(0)
            .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .build()];
        let subpasses = [vk::SubpassDescription::builder()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_refs)
            .build()];

        // The acquire semaphore is waited at color output, so the layout
        // transition has to wait there too
        let dependencies = [vk::SubpassDependency::builder()
            .src_subpass(vk::SUBPASS_EXTERNAL)
            .dst_subpass(0)
            .src_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
            .src_access_mask(vk::AccessFlags::empty())
            .dst_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
            .dst_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE)
            .build()];

        let create_info = vk::RenderPassCreateInfo::builder()
            .attachments(&attachments)
            .subpasses(&subpasses)
            .dependencies(&dependencies);

        // SAFETY: every array referenced by create_info lives until the call returns
        let render_pass =
            unsafe { device.create_render_pass(&create_info, None) }.map_err(vk_error("create_render_pass"))?;
        Ok(Self { device, render_pass })
    }

    /// Raw handle
    pub fn handle(&self) -> vk::RenderPass {
        self.render_pass
    }
}

impl Drop for RenderPass {
    fn drop(&mut self) {
        // SAFETY: framebuffers and pipelines using this pass are destroyed first
        unsafe { self.device.destroy_render_pass(self.render_pass, None) };
    }
}

/// Descriptor set layout with one vertex-stage uniform buffer at binding 0
pub struct DescriptorSetLayout {
    device: Device,
    layout: vk::DescriptorSetLayout,
}

impl DescriptorSetLayout {
    /// Create the per-object uniform layout
    pub fn new_uniform(device: Device) -> RenderResult<Self> {
        let bindings = [vk::DescriptorSetLayoutBinding::builder()
            .binding(0)
            .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::VERTEX)
            .build()];
        let create_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings);

        // SAFETY: bindings outlives the call
        let layout = unsafe { device.create_descriptor_set_layout(&create_info, None) }
            .map_err(vk_error("create_descriptor_set_layout"))?;
        Ok(Self { device, layout })
    }

    /// Raw handle
    pub fn handle(&self) -> vk::DescriptorSetLayout {
        self.layout
    }
}

impl Drop for DescriptorSetLayout {
    fn drop(&mut self) {
        // SAFETY: the pipeline layout referencing this is destroyed first
        unsafe { self.device.destroy_descriptor_set_layout(self.layout, None) };
    }
}

/// The single graphics pipeline and its layout
pub struct GraphicsPipeline {
    device: Device,
    pipeline: vk::Pipeline,
    layout: vk::PipelineLayout,
}

impl GraphicsPipeline {
    /// Build the mesh pipeline for `render_pass`
    ///
    /// Viewport and scissor are dynamic so the pipeline survives swap chain
    /// recreation.
    pub fn new(
        device: Device,
        render_pass: vk::RenderPass,
        set_layout: vk::DescriptorSetLayout,
        vertex_shader: &ShaderModule,
        fragment_shader: &ShaderModule,
    ) -> RenderResult<Self> {
        let entry_point = CStr::from_bytes_with_nul(ENTRY_POINT)
            .map_err(|e| RenderError::Shader(format!("Invalid entry point name: {e}")))?;
        let shader_stages = [
            vertex_shader.stage_info(vk::ShaderStageFlags::VERTEX, entry_point),
            fragment_shader.stage_info(vk::ShaderStageFlags::FRAGMENT, entry_point),
        ];

        let binding_descriptions = [vk::VertexInputBindingDescription::builder()
            .binding(0)
            .stride(std::mem::size_of::<Vertex>() as u32)
            .input_rate(vk::VertexInputRate::VERTEX)
            .build()];
        let attribute_descriptions = [
            vk::VertexInputAttributeDescription::builder()
                .binding(0)
                .location(0)
                .format(vk::Format::R32G32B32_SFLOAT)
                .offset(0)
                .build(),
            vk::VertexInputAttributeDescription::builder()
                .binding(0)
                .location(1)
                .format(vk::Format::R32G32B32_SFLOAT)
                .offset(Vertex::COLOR_OFFSET)
                .build(),
        ];
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::builder()
            .vertex_binding_descriptions(&binding_descriptions)
            .vertex_attribute_descriptions(&attribute_descriptions);

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
            .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
            .primitive_restart_enable(false);

        let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
            .viewport_count(1)
            .scissor_count(1);
        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state = vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

        let rasterizer = vk::PipelineRasterizationStateCreateInfo::builder()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(vk::PolygonMode::FILL)
            .line_width(1.0)
            .cull_mode(vk::CullModeFlags::NONE)
            .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
            .depth_bias_enable(false);

        let multisampling = vk::PipelineMultisampleStateCreateInfo::builder()
            .sample_shading_enable(false)
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);

        let color_blend_attachments = [vk::PipelineColorBlendAttachmentState::builder()
            .color_write_mask(vk::ColorComponentFlags::RGBA)
            .blend_enable(false)
            .build()];
        let color_blending = vk::PipelineColorBlendStateCreateInfo::builder()
            .logic_op_enable(false)
            .attachments(&color_blend_attachments);

        let set_layouts = [set_layout];
        let layout_info = vk::PipelineLayoutCreateInfo::builder().set_layouts(&set_layouts);
        // SAFETY: set_layouts outlives the call
        let layout = unsafe { device.create_pipeline_layout(&layout_info, None) }
            .map_err(vk_error("create_pipeline_layout"))?;

        let pipeline_info = vk::GraphicsPipelineCreateInfo::builder()
            .stages(&shader_stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterizer)
            .multisample_state(&multisampling)
            .color_blend_state(&color_blending)
            .dynamic_state(&dynamic_state)
            .layout(layout)
            .render_pass(render_pass)
            .subpass(0);

        // SAFETY: every state struct referenced by pipeline_info is alive here
        let created = unsafe {
            device.create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info.build()], None)
        };
        let pipeline = match created {
            Ok(pipelines) => pipelines.into_iter().next(),
            Err((_, err)) => {
                // SAFETY: the layout is not referenced by any pipeline
                unsafe { device.destroy_pipeline_layout(layout, None) };
                return Err(vk_error("create_graphics_pipelines")(err));
            }
        };
        let pipeline = pipeline
            .ok_or_else(|| RenderError::InitializationFailed("Driver returned no pipeline".to_string()))?;

        log::debug!("Graphics pipeline created");
        Ok(Self { device, pipeline, layout })
    }

    /// Pipeline handle
    pub fn handle(&self) -> vk::Pipeline {
        self.pipeline
    }

    /// Layout handle
    pub fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }
}

impl Drop for GraphicsPipeline {
    fn drop(&mut self) {
        // SAFETY: the device is idle before the pipeline goes away
        unsafe {
            self.device.destroy_pipeline(self.pipeline, None);
            self.device.destroy_pipeline_layout(self.layout, None);
        }
    }
}

/// Command pool whose buffers can be reset one by one
pub struct CommandPool {
    device: Device,
    pool: vk::CommandPool,
}

impl CommandPool {
    /// Create a pool on a queue family
    pub fn new(device: Device, queue_family_index: u32) -> RenderResult<Self> {
        let create_info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(queue_family_index);
        // SAFETY: create_info is fully initialized
        let pool =
            unsafe { device.create_command_pool(&create_info, None) }.map_err(vk_error("create_command_pool"))?;
        Ok(Self { device, pool })
    }

    /// Raw handle
    pub fn handle(&self) -> vk::CommandPool {
        self.pool
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        // SAFETY: destroying the pool frees every buffer still allocated from it
        unsafe { self.device.destroy_command_pool(self.pool, None) };
    }
}
