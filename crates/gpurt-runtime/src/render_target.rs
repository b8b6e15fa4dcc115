//! Value types for dynamic state and render target sets.
//!
//! These compare by value so the command buffer can elide redundant state
//! changes and rendering passes.

use ash::vk;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

impl Viewport {
    /// Full-extent viewport with the standard [0, 1] depth range.
    pub fn from_extent(width: u32, height: u32) -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width: width as f32,
            height: height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        }
    }

    pub fn to_vk(&self) -> vk::Viewport {
        vk::Viewport {
            x: self.x,
            y: self.y,
            width: self.width,
            height: self.height,
            min_depth: self.min_depth,
            max_depth: self.max_depth,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn from_extent(width: u32, height: u32) -> Self {
        Self {
            x: 0,
            y: 0,
            width,
            height,
        }
    }

    pub fn to_vk(&self) -> vk::Rect2D {
        vk::Rect2D {
            offset: vk::Offset2D {
                x: self.x,
                y: self.y,
            },
            extent: vk::Extent2D {
                width: self.width,
                height: self.height,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColorAttachment {
    pub view: vk::ImageView,
    pub layout: vk::ImageLayout,
    pub load_op: vk::AttachmentLoadOp,
    pub store_op: vk::AttachmentStoreOp,
    pub clear: [f32; 4],
}

impl ColorAttachment {
    /// Clear-on-load, store-on-finish attachment in `COLOR_ATTACHMENT_OPTIMAL`.
    pub fn cleared(view: vk::ImageView, clear: [f32; 4]) -> Self {
        Self {
            view,
            layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            load_op: vk::AttachmentLoadOp::CLEAR,
            store_op: vk::AttachmentStoreOp::STORE,
            clear,
        }
    }

    pub fn clear_value(&self) -> vk::ClearValue {
        vk::ClearValue {
            color: vk::ClearColorValue {
                float32: self.clear,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DepthAttachment {
    pub view: vk::ImageView,
    pub layout: vk::ImageLayout,
    pub load_op: vk::AttachmentLoadOp,
    pub store_op: vk::AttachmentStoreOp,
    pub clear_depth: f32,
    pub clear_stencil: u32,
}

impl DepthAttachment {
    pub fn clear_value(&self) -> vk::ClearValue {
        vk::ClearValue {
            depth_stencil: vk::ClearDepthStencilValue {
                depth: self.clear_depth,
                stencil: self.clear_stencil,
            },
        }
    }
}

/// The attachments of one rendering pass.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderTargets {
    pub area: Rect,
    pub color: Vec<ColorAttachment>,
    pub depth: Option<DepthAttachment>,
}

impl RenderTargets {
    pub fn new(area: Rect) -> Self {
        Self {
            area,
            color: Vec::new(),
            depth: None,
        }
    }

    pub fn with_color(mut self, attachment: ColorAttachment) -> Self {
        self.color.push(attachment);
        self
    }

    pub fn with_depth(mut self, attachment: DepthAttachment) -> Self {
        self.depth = Some(attachment);
        self
    }
}
