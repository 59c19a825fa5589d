//! Signal bookkeeping shared by every renderer.
//!
//! Renderers answer a `Load` ticket straight away and schedule an `Ended`
//! signal for any clip or stage that has a finite length. Nothing here
//! blocks: the scheduled signals are released by [`Playback::poll`] once the
//! timer says they are due.

use cogex_core::{RendererSignal, SignalKind, Stage, Ticket};
use cogex_timing::Timer;
use std::collections::VecDeque;
use std::path::Path;

const IMAGE_EXTENSIONS: [&str; 6] = ["png", "jpg", "jpeg", "bmp", "gif", "webp"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssetKind {
    /// Decodable still image on local disk.
    Image(String),
    /// Local clip the renderer plays for the descriptor's clip length.
    Media(String),
    Remote(String),
}

/// Works out what a resolved locator points at without reading it.
pub fn probe_asset(locator: &str) -> Result<AssetKind, String> {
    if locator.contains("://") {
        return Ok(AssetKind::Remote(locator.to_string()));
    }
    let path = Path::new(locator);
    if !path.is_file() {
        return Err(format!("asset not found: {locator}"));
    }
    let is_image = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false);
    if is_image {
        Ok(AssetKind::Image(locator.to_string()))
    } else {
        Ok(AssetKind::Media(locator.to_string()))
    }
}

#[derive(Debug, Clone)]
pub struct Playback<T: Timer<Timestamp = u64>> {
    timer: T,
    queue: VecDeque<RendererSignal>,
    scheduled: Vec<(u64, Ticket)>,
}

impl<T: Timer<Timestamp = u64>> Playback<T> {
    pub fn new(timer: T) -> Self {
        Self {
            timer,
            queue: VecDeque::new(),
            scheduled: Vec::new(),
        }
    }

    pub fn timer(&self) -> &T {
        &self.timer
    }

    pub fn now(&self) -> u64 {
        self.timer.now()
    }

    pub fn emit(&mut self, ticket: Ticket, kind: SignalKind) {
        self.queue.push_back(RendererSignal { ticket, kind });
    }

    /// Schedules `Ended` for `ticket` after `duration_ms`. Zero means the
    /// stage runs until it is replaced or stopped.
    pub fn end_after(&mut self, ticket: Ticket, duration_ms: u64) {
        if duration_ms == 0 {
            return;
        }
        let due = self.timer.now() + duration_ms * 1_000_000;
        self.scheduled.push((due, ticket));
    }

    /// A new adapt or test stage replaces whatever stage was timing before
    /// it. A running clip (`Load`) keeps its own end.
    pub fn replace_stage(&mut self, generation: u64) {
        self.scheduled
            .retain(|(_, t)| t.stage == Stage::Load && t.generation == generation);
    }

    pub fn cancel(&mut self) {
        self.scheduled.clear();
    }

    pub fn next_deadline(&self) -> Option<u64> {
        self.scheduled.iter().map(|(due, _)| *due).min()
    }

    pub fn poll(&mut self) -> Option<RendererSignal> {
        let now = self.timer.now();
        self.scheduled.sort_by_key(|(due, _)| *due);
        while let Some(&(due, ticket)) = self.scheduled.first() {
            if due > now {
                break;
            }
            self.scheduled.remove(0);
            self.queue.push_back(RendererSignal {
                ticket,
                kind: SignalKind::Ended,
            });
        }
        self.queue.pop_front()
    }
}
