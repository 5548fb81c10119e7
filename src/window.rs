//! Window resources tracked by the broker

use crate::render::TextureId;
use glaze_proto::Rect;

/// A client-owned rectangle on the surface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Window {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
    /// Renderer texture holding the window contents, once uploaded
    pub texture: Option<TextureId>,
    /// Size of the uploaded texture in pixels
    pub texture_size: (i32, i32),
}

impl Window {
    pub fn new(rect: Rect) -> Self {
        Self {
            x: rect.x,
            y: rect.y,
            w: rect.w,
            h: rect.h,
            texture: None,
            texture_size: (0, 0),
        }
    }

    pub fn rect(&self) -> Rect {
        Rect::new(self.x, self.y, self.w, self.h)
    }

    /// Move/resize; contents are kept
    pub fn set_rect(&mut self, rect: Rect) {
        self.x = rect.x;
        self.y = rect.y;
        self.w = rect.w;
        self.h = rect.h;
    }

    /// Region of the texture to sample: the whole uploaded image, or the
    /// window size when it has none of its own
    pub fn source_region(&self) -> Rect {
        match self.texture {
            Some(_) => Rect::new(0, 0, self.texture_size.0, self.texture_size.1),
            None => Rect::new(0, 0, self.w, self.h),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rect_roundtrip() {
        let mut window = Window::new(Rect::new(0, 0, 100, 100));
        assert_eq!(window.texture, None);
        window.set_rect(Rect::new(10, 10, 50, 50));
        assert_eq!(window.rect(), Rect::new(10, 10, 50, 50));
    }

    #[test]
    fn test_source_region_tracks_texture() {
        let mut window = Window::new(Rect::new(5, 5, 20, 20));
        assert_eq!(window.source_region(), Rect::new(0, 0, 20, 20));
        window.texture = Some(3);
        window.texture_size = (64, 32);
        assert_eq!(window.source_region(), Rect::new(0, 0, 64, 32));
    }
}
