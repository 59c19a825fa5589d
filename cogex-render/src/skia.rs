use crate::canvas::Canvas;
use crate::playback::{AssetKind, Playback, probe_asset};
use crate::text::TextCache;
use ab_glyph::FontVec;
use cogex_core::stimulus::{BLACK, WHITE};
use cogex_core::{
    CueShape, Direction, RenderError, RendererSignal, SignalKind, Stage, StimulusDescriptor,
    StimulusKind, StimulusRenderer, Ticket,
};
use cogex_timing::{CalibrationStats, HighPrecisionTimer, Timer};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tiny_skia::{IntSize, PathBuilder, Pixmap, Rect};
use tracing::{debug, warn};

pub const DEFAULT_BACKGROUND: [u8; 4] = [128, 128, 128, 255];

const LETTER_PX: f32 = 96.0;
const APERTURE: f32 = 300.0;
const MARKER_SIZE: f32 = 60.0;
const DOT_COUNT: usize = 150;
const DOT_SPEED_PX_S: f32 = 120.0;
const GRATING_PERIOD: f32 = 40.0;
const KEY_SIZE: f32 = 70.0;
const HOME_ROW: [&str; 8] = ["a", "s", "d", "f", "j", "k", "l", ";"];

pub struct FrameStats {
    pub clear: Duration,
    pub draw: Duration,
    pub copy: Duration,
    pub total: Duration,
    pub dirty_count: usize,
}

struct Showing {
    stage: Stage,
    kind: StimulusKind,
    marker: Option<[u8; 4]>,
    since_ns: u64,
}

/// Software stimulus renderer on a tiny-skia canvas.
///
/// A loaded clip ends after the descriptor's `clip_ms` and a drawn stage
/// after its `duration_ms`, both on `timer`. The host
/// copies each frame out with [`SkiaRenderer::render_frame`]; signals are
/// produced independently of how often that happens.
pub struct SkiaRenderer<T: Timer<Timestamp = u64>> {
    canvas: Canvas,
    text: TextCache,
    playback: Playback<T>,
    showing: Option<Showing>,
    backdrop: Option<Arc<Pixmap>>,
    images: HashMap<String, Arc<Pixmap>>,
    component_timers: HashMap<&'static str, HighPrecisionTimer>,
}

impl<T: Timer<Timestamp = u64>> SkiaRenderer<T> {
    pub fn new(width: u32, height: u32, font: FontVec, timer: T) -> Result<Self, RenderError> {
        Self::with_background(width, height, font, timer, DEFAULT_BACKGROUND)
    }

    pub fn with_background(
        width: u32,
        height: u32,
        font: FontVec,
        timer: T,
        background: [u8; 4],
    ) -> Result<Self, RenderError> {
        Ok(Self {
            canvas: Canvas::new(width, height, background)?,
            text: TextCache::new(font),
            playback: Playback::new(timer),
            showing: None,
            backdrop: None,
            images: HashMap::new(),
            component_timers: ["clear", "draw", "copy"]
                .into_iter()
                .map(|k| (k, HighPrecisionTimer::new()))
                .collect(),
        })
    }

    pub fn resize(&mut self, width: u32, height: u32) -> Result<(), RenderError> {
        self.canvas.resize(width, height)
    }

    pub fn canvas(&self) -> &Canvas {
        &self.canvas
    }

    pub fn showing_stage(&self) -> Option<Stage> {
        self.showing.as_ref().map(|s| s.stage)
    }

    pub fn next_deadline(&self) -> Option<u64> {
        self.playback.next_deadline()
    }

    pub fn component_stats(&self, component: &str) -> Option<CalibrationStats> {
        self.component_timers
            .get(component)
            .map(|t| t.calibration_stats())
    }

    /// Draws the current stage and copies the changed pixels into `frame`.
    pub fn render_frame(&mut self, frame: &mut [u8]) -> FrameStats {
        let timer = self.playback.timer().clone();

        let t = timer.now();
        let old = self.canvas.take_and_clear_dirty();
        let clear = timer.elapsed(t);

        let t = timer.now();
        self.draw(timer.now());
        let draw = timer.elapsed(t);

        let t = timer.now();
        let dirty_count = self.canvas.present_into(old, frame);
        let copy = timer.elapsed(t);

        for (name, d) in [("clear", clear), ("draw", draw), ("copy", copy)] {
            if let Some(component) = self.component_timers.get_mut(name) {
                component.record_frame(d);
            }
        }

        FrameStats {
            clear,
            draw,
            copy,
            total: clear + draw + copy,
            dirty_count,
        }
    }

    fn load(&mut self, descriptor: &StimulusDescriptor, ticket: Ticket) {
        let Some(locator) = descriptor.asset.as_deref() else {
            self.playback
                .emit(ticket, SignalKind::Error("no asset named".to_string()));
            return;
        };
        let loaded = probe_asset(locator).and_then(|kind| match kind {
            AssetKind::Image(path) => self.decode_image(&path).map(Some),
            AssetKind::Media(_) => Ok(None),
            AssetKind::Remote(url) => Err(format!("remote assets are not fetched: {url}")),
        });
        match loaded {
            Ok(backdrop) => {
                self.backdrop = backdrop;
                self.playback.emit(ticket, SignalKind::Ready);
                self.playback
                    .end_after(ticket, descriptor.clip_ms.unwrap_or(0));
            }
            Err(reason) => {
                warn!(generation = ticket.generation, %reason, "asset load failed");
                self.playback.emit(ticket, SignalKind::Error(reason));
            }
        }
    }

    fn decode_image(&mut self, path: &str) -> Result<Arc<Pixmap>, String> {
        if let Some(pm) = self.images.get(path) {
            return Ok(Arc::clone(pm));
        }
        let rgba = image::open(path)
            .map_err(|e| format!("cannot decode {path}: {e}"))?
            .to_rgba8();
        let (w, h) = rgba.dimensions();
        let mut data = rgba.into_raw();
        for px in data.chunks_exact_mut(4) {
            let a = px[3] as u16;
            for c in &mut px[..3] {
                *c = ((*c as u16 * a + 127) / 255) as u8;
            }
        }
        let size = IntSize::from_wh(w, h).ok_or_else(|| format!("{path} is empty"))?;
        let pm = Pixmap::from_vec(data, size).ok_or_else(|| format!("{path} is too large"))?;
        let pm = Arc::new(pm);
        self.images.insert(path.to_string(), Arc::clone(&pm));
        debug!(path, width = w, height = h, "image decoded");
        Ok(pm)
    }

    fn draw(&mut self, now_ns: u64) {
        let center = self.canvas.center();
        if let Some(backdrop) = self.backdrop.clone() {
            self.canvas.blit_centered(&backdrop, center);
        }
        let Some(showing) = &self.showing else {
            return;
        };
        let kind = showing.kind.clone();
        let marker = showing.marker;
        let t = now_ns.saturating_sub(showing.since_ns) as f32 / 1e9;

        match &kind {
            StimulusKind::Blank => {}
            StimulusKind::Fixation => self.draw_fixation(center),
            StimulusKind::Letter { content, color } => {
                if let Some(pm) = self.text.get_or_render(content, LETTER_PX, *color) {
                    self.canvas.blit_centered(&pm, center);
                }
            }
            StimulusKind::Cue { shape, color } => self.draw_cue(*shape, *color, center),
            StimulusKind::Arrow {
                direction,
                size,
                color,
            } => self.draw_arrow(*direction, *size, *color, center),
            StimulusKind::Grating { direction } => self.draw_grating(*direction, t, center),
            StimulusKind::DotMotion {
                direction,
                coherence,
            } => self.draw_dots(*direction, *coherence, t, center),
            StimulusKind::KeyHighlight { key, color } => self.draw_keys(key, *color, center),
        }

        if let Some(color) = marker {
            if let Some(rect) = Rect::from_xywh(0.0, 0.0, MARKER_SIZE, MARKER_SIZE) {
                self.canvas.fill_rect(rect, color);
            }
        }
    }

    fn draw_fixation(&mut self, (cx, cy): (f32, f32)) {
        let size = 40.0;
        let bars = [
            Rect::from_xywh(cx - size * 0.5, cy - 1.0, size, 2.0),
            Rect::from_xywh(cx - 1.0, cy - size * 0.5, 2.0, size),
        ];
        for bar in bars.into_iter().flatten() {
            self.canvas.fill_rect(bar, WHITE);
        }
    }

    fn draw_cue(&mut self, shape: CueShape, color: [u8; 4], (cx, cy): (f32, f32)) {
        let radius = 20.0;
        let mut pb = PathBuilder::new();
        match shape {
            CueShape::Dot => pb.push_circle(cx, cy, radius),
            CueShape::Polygon => {
                for i in 0..6 {
                    let a = std::f32::consts::PI / 3.0 * i as f32;
                    let (x, y) = (cx + radius * a.cos(), cy + radius * a.sin());
                    if i == 0 {
                        pb.move_to(x, y);
                    } else {
                        pb.line_to(x, y);
                    }
                }
                pb.close();
            }
        }
        if let Some(path) = pb.finish() {
            self.canvas.fill_path(&path, color);
        }
    }

    fn draw_arrow(&mut self, direction: Direction, size: f32, color: [u8; 4], c: (f32, f32)) {
        let (cx, cy) = c;
        let mut pb = PathBuilder::new();
        let (tip, base_a, base_b) = match direction {
            Direction::Right => ((cx + size, cy), (cx, cy - size), (cx, cy + size)),
            Direction::Left => ((cx - size, cy), (cx, cy - size), (cx, cy + size)),
            Direction::Up => ((cx, cy - size), (cx - size, cy), (cx + size, cy)),
            Direction::Down => ((cx, cy + size), (cx - size, cy), (cx + size, cy)),
        };
        pb.move_to(tip.0, tip.1);
        pb.line_to(base_a.0, base_a.1);
        pb.line_to(base_b.0, base_b.1);
        pb.close();
        if let Some(path) = pb.finish() {
            self.canvas.fill_path(&path, color);
        }
    }

    /// Square-wave grating drifting toward `direction`.
    fn draw_grating(&mut self, direction: Direction, t: f32, (cx, cy): (f32, f32)) {
        let (x0, y0) = (cx - APERTURE * 0.5, cy - APERTURE * 0.5);
        let shift = (t * DOT_SPEED_PX_S).rem_euclid(GRATING_PERIOD);
        let phase = match direction {
            Direction::Right | Direction::Down => shift,
            Direction::Left | Direction::Up => GRATING_PERIOD - shift,
        };
        let vertical = matches!(direction, Direction::Left | Direction::Right);
        let half = GRATING_PERIOD * 0.5;
        let mut offset = phase - GRATING_PERIOD;
        while offset < APERTURE {
            let start = offset.max(0.0);
            let end = (offset + half).min(APERTURE);
            if end > start {
                let bar = if vertical {
                    Rect::from_xywh(x0 + start, y0, end - start, APERTURE)
                } else {
                    Rect::from_xywh(x0, y0 + start, APERTURE, end - start)
                };
                if let Some(bar) = bar {
                    self.canvas.fill_rect(bar, WHITE);
                }
            }
            offset += GRATING_PERIOD;
        }
    }

    /// Random-dot kinematogram: a `coherence` share of dots drifts toward
    /// `direction`, the rest move on fixed pseudo-random headings.
    fn draw_dots(&mut self, direction: Direction, coherence: f32, t: f32, (cx, cy): (f32, f32)) {
        let (dx, dy) = match direction {
            Direction::Right => (1.0, 0.0),
            Direction::Left => (-1.0, 0.0),
            Direction::Up => (0.0, -1.0),
            Direction::Down => (0.0, 1.0),
        };
        let coherent = (DOT_COUNT as f32 * coherence.clamp(0.0, 1.0)).round() as usize;
        let golden = 0.618_034f32;
        for i in 0..DOT_COUNT {
            let (hx, hy) = if i < coherent {
                (dx, dy)
            } else {
                let a = std::f32::consts::TAU * (i as f32 * golden).fract();
                (a.cos(), a.sin())
            };
            let bx = (i as f32 * golden).fract() * APERTURE;
            let by = (i as f32 * golden * golden).fract() * APERTURE;
            let x = (bx + hx * DOT_SPEED_PX_S * t).rem_euclid(APERTURE);
            let y = (by + hy * DOT_SPEED_PX_S * t).rem_euclid(APERTURE);
            if let Some(dot) = Rect::from_xywh(
                cx - APERTURE * 0.5 + x - 2.0,
                cy - APERTURE * 0.5 + y - 2.0,
                4.0,
                4.0,
            ) {
                self.canvas.fill_rect(dot, WHITE);
            }
        }
    }

    fn draw_keys(&mut self, key: &str, color: [u8; 4], (cx, cy): (f32, f32)) {
        let keys: Vec<&str> = if HOME_ROW.contains(&key) {
            HOME_ROW.to_vec()
        } else {
            vec![key]
        };
        let gap = 10.0;
        let row_w = keys.len() as f32 * (KEY_SIZE + gap) - gap;
        let mut x = cx - row_w * 0.5;
        for label in keys {
            let fill = if label == key { color } else { WHITE };
            if let Some(rect) = Rect::from_xywh(x, cy - KEY_SIZE * 0.5, KEY_SIZE, KEY_SIZE) {
                self.canvas.fill_rect(rect, fill);
            }
            if let Some(pm) = self.text.get_or_render(label, KEY_SIZE * 0.5, BLACK) {
                self.canvas.blit_centered(&pm, (x + KEY_SIZE * 0.5, cy));
            }
            x += KEY_SIZE + gap;
        }
    }
}

impl<T: Timer<Timestamp = u64>> StimulusRenderer for SkiaRenderer<T> {
    fn present(&mut self, descriptor: &StimulusDescriptor, ticket: Ticket) {
        let kind = match ticket.stage {
            Stage::Load => {
                self.load(descriptor, ticket);
                return;
            }
            Stage::Adapt => descriptor.adapt.clone().unwrap_or(StimulusKind::Blank),
            Stage::Test => descriptor.test.clone(),
        };
        self.playback.replace_stage(ticket.generation);
        self.playback
            .end_after(ticket, descriptor.duration_ms.unwrap_or(0));
        self.showing = Some(Showing {
            stage: ticket.stage,
            kind,
            marker: descriptor.marker,
            since_ns: self.playback.now(),
        });
    }

    fn stop(&mut self) {
        self.playback.cancel();
        self.showing = None;
        self.backdrop = None;
    }

    fn poll_signal(&mut self) -> Option<RendererSignal> {
        self.playback.poll()
    }

    fn check_surface(&self) -> Result<(), RenderError> {
        if self.canvas.width() == 0 || self.canvas.height() == 0 {
            return Err(RenderError::SurfaceMissing("canvas has no area".to_string()));
        }
        Ok(())
    }
}
