pub mod canvas;
pub mod headless;
pub mod playback;
pub mod skia;
pub mod text;

pub use canvas::Canvas;
pub use headless::HeadlessRenderer;
pub use playback::{AssetKind, Playback, probe_asset};
pub use skia::{FrameStats, SkiaRenderer};
pub use text::{TextCache, load_font, render_text_pixmap};
