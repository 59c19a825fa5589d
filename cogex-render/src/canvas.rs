use bytemuck::{cast_slice, cast_slice_mut};
use cogex_core::RenderError;
use tiny_skia::{Color, FillRule, Paint, Path, Pixmap, Rect, Transform};

/// Offscreen canvas that remembers which regions changed, so a frame only
/// clears and copies the pixels it actually touched.
pub struct Canvas {
    width: u32,
    height: u32,
    background: [u8; 4],
    pixmap: Pixmap,
    dirty: Vec<Rect>,
    clear_buffer: Vec<u8>,
    first_frame: bool,
}

fn opaque(color: [u8; 4]) -> [u8; 4] {
    [color[0], color[1], color[2], 255]
}

impl Canvas {
    pub fn new(width: u32, height: u32, background: [u8; 4]) -> Result<Self, RenderError> {
        let background = opaque(background);
        let mut pixmap = Pixmap::new(width, height).ok_or_else(|| {
            RenderError::SurfaceMissing(format!("cannot allocate a {width}x{height} canvas"))
        })?;
        pixmap.fill(Color::from_rgba8(
            background[0],
            background[1],
            background[2],
            255,
        ));
        Ok(Self {
            width,
            height,
            background,
            pixmap,
            dirty: Vec::with_capacity(16),
            clear_buffer: Self::clear_buffer(width, height, background),
            first_frame: true,
        })
    }

    fn clear_buffer(width: u32, height: u32, background: [u8; 4]) -> Vec<u8> {
        background
            .into_iter()
            .cycle()
            .take((width * height * 4) as usize)
            .collect()
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn center(&self) -> (f32, f32) {
        (self.width as f32 / 2.0, self.height as f32 / 2.0)
    }

    pub fn pixmap(&self) -> &Pixmap {
        &self.pixmap
    }

    pub fn dirty_count(&self) -> usize {
        self.dirty.len()
    }

    pub fn resize(&mut self, width: u32, height: u32) -> Result<(), RenderError> {
        *self = Self::new(width, height, self.background)?;
        Ok(())
    }

    /// Takes the regions drawn last frame and restores them to background.
    pub fn take_and_clear_dirty(&mut self) -> Vec<Rect> {
        let old = std::mem::take(&mut self.dirty);
        let stride = self.width as usize * 4;
        let data = self.pixmap.data_mut();
        for rect in &old {
            let Some((x0, y0, x1, y1)) = clip(*rect, self.width, self.height) else {
                continue;
            };
            let row_len = (x1 - x0) * 4;
            for y in y0..y1 {
                let off = y * stride + x0 * 4;
                data[off..off + row_len].copy_from_slice(&self.clear_buffer[off..off + row_len]);
            }
        }
        old
    }

    /// Copies `old` plus everything drawn since into `frame`, which must be
    /// `width * height * 4` bytes of RGBA. Returns the rects copied.
    pub fn present_into(&mut self, old: Vec<Rect>, frame: &mut [u8]) -> usize {
        if self.first_frame || frame.len() != self.clear_buffer.len() {
            self.first_frame = false;
            if frame.len() == self.clear_buffer.len() {
                frame.copy_from_slice(self.pixmap.data());
            }
            return 1;
        }
        let mut rects = old;
        rects.extend_from_slice(&self.dirty);
        coalesce_dirty(&mut rects);

        let row_bytes = self.width as usize * 4;
        let data = self.pixmap.data();
        for rect in &rects {
            let Some((x0, y0, x1, y1)) = clip(*rect, self.width, self.height) else {
                continue;
            };
            let bytes = (x1 - x0) * 4;
            for row in y0..y1 {
                let off = row * row_bytes + x0 * 4;
                frame[off..off + bytes].copy_from_slice(&data[off..off + bytes]);
            }
        }
        rects.len()
    }

    pub fn mark(&mut self, rect: Rect) {
        self.dirty.push(rect);
    }

    pub fn fill_rect(&mut self, rect: Rect, color: [u8; 4]) {
        let mut paint = Paint::default();
        paint.anti_alias = false;
        paint.set_color_rgba8(color[0], color[1], color[2], color[3]);
        self.pixmap
            .fill_rect(rect, &paint, Transform::identity(), None);
        self.mark(rect);
    }

    pub fn fill_path(&mut self, path: &Path, color: [u8; 4]) {
        let mut paint = Paint::default();
        paint.anti_alias = true;
        paint.set_color_rgba8(color[0], color[1], color[2], color[3]);
        self.pixmap
            .fill_path(path, &paint, FillRule::Winding, Transform::identity(), None);
        // Anti-aliased edges spill one pixel past the bounds.
        let b = path.bounds();
        if let Some(rect) =
            Rect::from_xywh(b.x() - 1.0, b.y() - 1.0, b.width() + 2.0, b.height() + 2.0)
        {
            self.mark(rect);
        }
    }

    /// Composites a premultiplied pixmap centered on `pos`.
    pub fn blit_centered(&mut self, src: &Pixmap, pos: (f32, f32)) {
        let (w, h) = (src.width() as i32, src.height() as i32);
        let x = (pos.0 - w as f32 * 0.5).floor() as i32;
        let y = (pos.1 - h as f32 * 0.5).floor() as i32;
        let (cw, ch) = (self.width as i32, self.height as i32);

        if x + w <= 0 || y + h <= 0 || x >= cw || y >= ch {
            return;
        }

        let dst_x = x.max(0) as usize;
        let dst_y = y.max(0) as usize;
        let src_x = (-x).max(0) as usize;
        let src_y = (-y).max(0) as usize;
        let copy_w = (w as usize - src_x).min(cw as usize - dst_x);
        let copy_h = (h as usize - src_y).min(ch as usize - dst_y);
        let src_stride = src.width() as usize;
        let dst_stride = self.width as usize;

        let src_data = src.data();
        let fully_opaque = (0..copy_h).all(|row| {
            let start = ((src_y + row) * src_stride + src_x) * 4;
            src_data[start..start + copy_w * 4]
                .iter()
                .skip(3)
                .step_by(4)
                .all(|&a| a == 255)
        });

        let src_u32: &[u32] = cast_slice(src_data);
        let dst_u32: &mut [u32] = cast_slice_mut(self.pixmap.data_mut());

        for row in 0..copy_h {
            let s0 = (src_y + row) * src_stride + src_x;
            let d0 = (dst_y + row) * dst_stride + dst_x;
            if fully_opaque {
                dst_u32[d0..d0 + copy_w].copy_from_slice(&src_u32[s0..s0 + copy_w]);
                continue;
            }
            for i in 0..copy_w {
                dst_u32[d0 + i] = blend_over(src_u32[s0 + i], dst_u32[d0 + i]);
            }
        }

        if let Some(rect) =
            Rect::from_xywh(dst_x as f32, dst_y as f32, copy_w as f32, copy_h as f32)
        {
            self.mark(rect);
        }
    }
}

/// Premultiplied source-over on little-endian packed RGBA.
fn blend_over(s: u32, d: u32) -> u32 {
    let sa = (s >> 24) & 0xFF;
    let inv = 255 - sa;
    let channel = |shift: u32| {
        let sc = (s >> shift) & 0xFF;
        let dc = (d >> shift) & 0xFF;
        (sc + (dc * inv + 127) / 255).min(255)
    };
    (channel(24) << 24) | (channel(16) << 16) | (channel(8) << 8) | channel(0)
}

fn clip(rect: Rect, width: u32, height: u32) -> Option<(usize, usize, usize, usize)> {
    let x0 = rect.x().floor().max(0.0).min(width as f32) as usize;
    let y0 = rect.y().floor().max(0.0).min(height as f32) as usize;
    let x1 = (rect.x() + rect.width()).ceil().min(width as f32) as usize;
    let y1 = (rect.y() + rect.height()).ceil().min(height as f32) as usize;
    (x1 > x0 && y1 > y0).then_some((x0, y0, x1, y1))
}

/// Merges rects on the same row band that touch horizontally.
pub fn coalesce_dirty(rects: &mut Vec<Rect>) {
    rects.sort_by(|a, b| a.y().total_cmp(&b.y()).then(a.x().total_cmp(&b.x())));
    let mut out: Vec<Rect> = Vec::with_capacity(rects.len());
    for r in rects.drain(..) {
        if let Some(last) = out.last_mut() {
            let same_row =
                (r.y() - last.y()).abs() < 1.0 && (r.height() - last.height()).abs() < 1.0;
            let touching = r.x() <= last.x() + last.width() + 1.0;
            if same_row && touching {
                let nx = last.x().min(r.x());
                let nx2 = (last.x() + last.width()).max(r.x() + r.width());
                if let Some(merged) = Rect::from_xywh(nx, last.y(), nx2 - nx, last.height()) {
                    *last = merged;
                    continue;
                }
            }
        }
        out.push(r);
    }
    *rects = out;
}
