//! Rendering and surface collaborators
//!
//! The broker never touches a GPU API directly. Window textures go through a
//! `Renderer`, and the drawable comes from a `SurfaceProvider`. The binary
//! ships headless implementations of both; a real backend plugs in behind
//! the same traits.

use anyhow::{bail, Result};
use glaze_proto::Rect;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Renderer-side texture name
pub type TextureId = u32;

/// Texture drawn when nothing better is available
pub const DEFAULT_TEXTURE: TextureId = 0;

pub trait Renderer: Send {
    /// Upload RGBA pixels, replacing `existing` when given. Returns the texture to use.
    fn upload_texture(
        &mut self,
        existing: Option<TextureId>,
        width: i32,
        height: i32,
        pixels: &[u8],
    ) -> Result<TextureId>;

    fn delete_texture(&mut self, texture: TextureId);

    fn clear(&mut self);

    /// Draw `src_region` of `texture` into `dst_rect` on a surface of `surface_size`
    fn draw(&mut self, texture: TextureId, src_region: Rect, dst_rect: Rect, surface_size: (u32, u32));

    fn swap_buffers(&mut self) -> Result<()>;
}

/// The native drawable the server renders into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Surface {
    pub width: u32,
    pub height: u32,
}

impl Surface {
    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Bytes of a full-surface RGBA image
    pub fn texture_capacity(&self) -> usize {
        self.width as usize * self.height as usize * 4
    }
}

pub trait SurfaceProvider: Send {
    fn acquire(&mut self) -> Result<Surface>;
    fn release(&mut self, surface: Surface);
}

// ============================================================================
// Headless implementations
// ============================================================================

/// Surface of fixed, configured dimensions
pub struct HeadlessSurfaceProvider {
    width: u32,
    height: u32,
    acquired: bool,
}

impl HeadlessSurfaceProvider {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            acquired: false,
        }
    }
}

impl SurfaceProvider for HeadlessSurfaceProvider {
    fn acquire(&mut self) -> Result<Surface> {
        if self.acquired {
            bail!("surface already acquired");
        }
        self.acquired = true;
        debug!("Acquired headless surface {}x{}", self.width, self.height);
        Ok(Surface {
            width: self.width,
            height: self.height,
        })
    }

    fn release(&mut self, surface: Surface) {
        debug!("Released headless surface {}x{}", surface.width, surface.height);
        self.acquired = false;
    }
}

/// Rolling frame-rate counter
pub struct FpsCounter {
    last_report: Instant,
    frames_since_report: u32,
    report_interval: Duration,
}

impl FpsCounter {
    pub fn new(report_interval: Duration) -> Self {
        Self {
            last_report: Instant::now(),
            frames_since_report: 0,
            report_interval,
        }
    }

    /// Count a presented frame. Returns a new measurement once per interval.
    pub fn tick(&mut self) -> Option<f64> {
        self.frames_since_report += 1;

        let elapsed = self.last_report.elapsed();
        if elapsed < self.report_interval {
            return None;
        }
        let fps = self.frames_since_report as f64 / elapsed.as_secs_f64();
        self.frames_since_report = 0;
        self.last_report = Instant::now();
        Some(fps)
    }
}

impl Default for FpsCounter {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

/// Keeps texture bookkeeping and frame statistics without a GPU
#[derive(Default)]
pub struct HeadlessRenderer {
    textures: HashMap<TextureId, (i32, i32)>,
    next_texture: TextureId,
    draws_in_frame: usize,
    frames: u64,
    fps: FpsCounter,
}

impl HeadlessRenderer {
    pub fn new() -> Self {
        Self {
            next_texture: DEFAULT_TEXTURE + 1,
            ..Self::default()
        }
    }

    pub fn texture_count(&self) -> usize {
        self.textures.len()
    }

    #[cfg(test)]
    pub fn texture_size(&self, texture: TextureId) -> Option<(i32, i32)> {
        self.textures.get(&texture).copied()
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }
}

impl Renderer for HeadlessRenderer {
    fn upload_texture(
        &mut self,
        existing: Option<TextureId>,
        width: i32,
        height: i32,
        pixels: &[u8],
    ) -> Result<TextureId> {
        let expected = width as usize * height as usize * 4;
        if width <= 0 || height <= 0 || pixels.len() != expected {
            bail!(
                "texture upload of {} bytes does not match {}x{}",
                pixels.len(),
                width,
                height
            );
        }
        let texture = match existing {
            Some(texture) if self.textures.contains_key(&texture) => texture,
            _ => {
                let texture = self.next_texture;
                self.next_texture = self.next_texture.wrapping_add(1).max(DEFAULT_TEXTURE + 1);
                texture
            }
        };
        self.textures.insert(texture, (width, height));
        trace!("Uploaded texture {} ({}x{})", texture, width, height);
        Ok(texture)
    }

    fn delete_texture(&mut self, texture: TextureId) {
        if self.textures.remove(&texture).is_some() {
            trace!("Deleted texture {}", texture);
        }
    }

    fn clear(&mut self) {
        self.draws_in_frame = 0;
    }

    fn draw(&mut self, texture: TextureId, src_region: Rect, dst_rect: Rect, _surface_size: (u32, u32)) {
        trace!("Draw texture {} {} -> {}", texture, src_region, dst_rect);
        self.draws_in_frame += 1;
    }

    fn swap_buffers(&mut self) -> Result<()> {
        self.frames += 1;
        if let Some(fps) = self.fps.tick() {
            debug!(
                "Headless renderer: {:.1} fps, {} draws last frame, {} textures, {} frames total",
                fps,
                self.draws_in_frame,
                self.texture_count(),
                self.frames()
            );
        }
        Ok(())
    }
}

// ============================================================================
// Test support
// ============================================================================
