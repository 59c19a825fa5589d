use ab_glyph::{Font, FontVec, Glyph, PxScale, ScaleFont, point};
use cogex_core::RenderError;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use string_cache::DefaultAtom as Atom;
use tiny_skia::{Pixmap, PremultipliedColorU8};

pub fn load_font(path: &Path) -> Result<FontVec, RenderError> {
    let bytes = std::fs::read(path).map_err(|e| RenderError::Font {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    FontVec::try_from_vec(bytes).map_err(|e| RenderError::Font {
        path: path.display().to_string(),
        reason: e.to_string(),
    })
}

/// Rasterizes `text` into a tight, transparent, premultiplied pixmap.
/// Returns `None` when nothing in `text` has an outline (e.g. spaces only).
pub fn render_text_pixmap<F: Font>(
    text: &str,
    font_size: f32,
    font: &F,
    color: [u8; 4],
) -> Option<Pixmap> {
    let scale = PxScale::from(font_size);
    let sf = font.as_scaled(scale);

    // Layout with the baseline at ascent
    let mut pen_x = 0.0f32;
    let mut glyphs = Vec::<Glyph>::new();
    for ch in text.chars() {
        let id = font.glyph_id(ch);
        if let Some(prev) = glyphs.last() {
            pen_x += sf.kern(prev.id, id);
        }
        glyphs.push(Glyph {
            id,
            scale,
            position: point(pen_x, sf.ascent()),
        });
        pen_x += sf.h_advance(id);
    }

    let outlines: Vec<_> = glyphs
        .into_iter()
        .filter_map(|g| font.outline_glyph(g))
        .collect();
    if outlines.is_empty() {
        return None;
    }

    let mut min_x = f32::INFINITY;
    let mut min_y = f32::INFINITY;
    let mut max_x = f32::NEG_INFINITY;
    let mut max_y = f32::NEG_INFINITY;
    for out in &outlines {
        let b = out.px_bounds();
        min_x = min_x.min(b.min.x);
        min_y = min_y.min(b.min.y);
        max_x = max_x.max(b.max.x);
        max_y = max_y.max(b.max.y);
    }

    let w = (max_x.ceil() - min_x.floor()).max(1.0) as u32;
    let h = (max_y.ceil() - min_y.floor()).max(1.0) as u32;
    let mut pm = Pixmap::new(w, h)?;
    let stride = w as usize;
    let dst = pm.pixels_mut();

    for out in &outlines {
        let b = out.px_bounds();
        out.draw(|x, y, cov| {
            if cov <= f32::EPSILON {
                return;
            }
            let ix = (x as f32 + b.min.x - min_x).floor() as i32;
            let iy = (y as f32 + b.min.y - min_y).floor() as i32;
            if ix < 0 || iy < 0 || ix >= w as i32 || iy >= h as i32 {
                return;
            }
            let i = iy as usize * stride + ix as usize;

            let a_lin = (cov * color[3] as f32 / 255.0).clamp(0.0, 1.0);
            let sa = (a_lin * 255.0) as u8;
            let sr = ((color[0] as f32 * a_lin) as u8).min(sa);
            let sg = ((color[1] as f32 * a_lin) as u8).min(sa);
            let sb = ((color[2] as f32 * a_lin) as u8).min(sa);

            // Porter-Duff over, premultiplied: out = src + bg * (1 - src.a)
            let bg = dst[i];
            let inv = 1.0 - (sa as f32 / 255.0);
            let a = sa.saturating_add((bg.alpha() as f32 * inv) as u8);
            let r = sr.saturating_add((bg.red() as f32 * inv) as u8).min(a);
            let g = sg.saturating_add((bg.green() as f32 * inv) as u8).min(a);
            let bl = sb.saturating_add((bg.blue() as f32 * inv) as u8).min(a);
            if let Some(px) = PremultipliedColorU8::from_rgba(r, g, bl, a) {
                dst[i] = px;
            }
        });
    }

    Some(pm)
}

/// Rendered strings keyed by interned text, size and color. Letters and key
/// labels repeat across a whole session, so each is rasterized once.
pub struct TextCache {
    font: FontVec,
    map: HashMap<(Atom, u32, [u8; 4]), Arc<Pixmap>>,
}

impl TextCache {
    pub fn new(font: FontVec) -> Self {
        Self {
            font,
            map: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn get_or_render(
        &mut self,
        text: &str,
        size_px: f32,
        color: [u8; 4],
    ) -> Option<Arc<Pixmap>> {
        let key = (Atom::from(text), size_px.to_bits(), color);
        if let Some(pm) = self.map.get(&key) {
            return Some(Arc::clone(pm));
        }
        let pm = Arc::new(render_text_pixmap(text, size_px, &self.font, color)?);
        self.map.insert(key, Arc::clone(&pm));
        Some(pm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_font_file_is_a_font_error() {
        let err = load_font(Path::new("/no/such/font.ttf")).unwrap_err();
        assert!(matches!(err, RenderError::Font { .. }));
    }

    #[test]
    fn garbage_font_bytes_are_rejected() {
        let path = std::env::temp_dir().join(format!("cogex-font-{}.ttf", std::process::id()));
        std::fs::write(&path, b"not a font").unwrap();
        let err = load_font(&path).unwrap_err();
        std::fs::remove_file(&path).ok();
        assert!(matches!(err, RenderError::Font { .. }));
    }
}
