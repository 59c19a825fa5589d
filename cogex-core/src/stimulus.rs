use serde::{Deserialize, Serialize};

pub const WHITE: [u8; 4] = [255, 255, 255, 255];
pub const BLACK: [u8; 4] = [0, 0, 0, 255];
pub const RED: [u8; 4] = [255, 0, 0, 255];
pub const ORANGE: [u8; 4] = [255, 165, 0, 255];
pub const GREEN: [u8; 4] = [0, 200, 0, 255];
pub const BLUE: [u8; 4] = [0, 90, 255, 255];
pub const YELLOW: [u8; 4] = [255, 220, 0, 255];
pub const MARKER_DARK: [u8; 4] = [0x9f, 0x9f, 0x9f, 255];
pub const MARKER_LIGHT: [u8; 4] = [0xcb, 0xcb, 0xcb, 255];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
    Left,
    Right,
}

impl Direction {
    pub fn opposite(self) -> Self {
        match self {
            Direction::Up => Direction::Down,
            Direction::Down => Direction::Up,
            Direction::Left => Direction::Right,
            Direction::Right => Direction::Left,
        }
    }

    /// Response symbol a subject uses to report this direction.
    pub fn symbol(self) -> &'static str {
        match self {
            Direction::Up => "up",
            Direction::Down => "down",
            Direction::Left => "left",
            Direction::Right => "right",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CueShape {
    Dot,
    Polygon,
}

/// What gets drawn for one presentation stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum StimulusKind {
    Blank,
    Fixation,
    Letter {
        content: String,
        color: [u8; 4],
    },
    Cue {
        shape: CueShape,
        color: [u8; 4],
    },
    Arrow {
        direction: Direction,
        size: f32,
        color: [u8; 4],
    },
    Grating {
        direction: Direction,
    },
    DotMotion {
        direction: Direction,
        coherence: f32,
    },
    /// On-screen keyboard with one key lit.
    KeyHighlight {
        key: String,
        color: [u8; 4],
    },
}

impl StimulusKind {
    pub fn is_text(&self) -> bool {
        matches!(self, StimulusKind::Letter { .. } | StimulusKind::KeyHighlight { .. })
    }
}

/// Parameters handed to the renderer. The engine reads only `asset` and
/// `adapt`; everything else is passed through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StimulusDescriptor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adapt: Option<StimulusKind>,
    pub test: StimulusKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub marker: Option<[u8; 4]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// Playback length of the loaded asset. Separate from `duration_ms`,
    /// which is how long the drawn stage stays up.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clip_ms: Option<u64>,
}

impl StimulusDescriptor {
    pub fn new(test: StimulusKind) -> Self {
        Self {
            asset: None,
            adapt: None,
            test,
            marker: None,
            duration_ms: None,
            clip_ms: None,
        }
    }

    pub fn with_asset(mut self, asset: impl Into<String>) -> Self {
        self.asset = Some(asset.into());
        self
    }

    pub fn with_adapt(mut self, adapt: StimulusKind) -> Self {
        self.adapt = Some(adapt);
        self
    }

    pub fn with_marker(mut self, marker: [u8; 4]) -> Self {
        self.marker = Some(marker);
        self
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_clip_length(mut self, clip_ms: u64) -> Self {
        self.clip_ms = Some(clip_ms);
        self
    }
}
