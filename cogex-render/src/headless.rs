use crate::playback::{AssetKind, Playback, probe_asset};
use cogex_core::{
    RendererSignal, SignalKind, Stage, StimulusDescriptor, StimulusRenderer, Ticket,
};
use cogex_timing::Timer;
use tracing::debug;

/// Renderer without a surface. Assets are checked on disk and nothing is
/// drawn. A loaded clip ends after `clip_ms` and a drawn stage after
/// `duration_ms`, both on `timer`.
#[derive(Debug, Clone)]
pub struct HeadlessRenderer<T: Timer<Timestamp = u64>> {
    playback: Playback<T>,
    verify_assets: bool,
    presented: usize,
    showing: Option<Ticket>,
}

impl<T: Timer<Timestamp = u64>> HeadlessRenderer<T> {
    pub fn new(timer: T) -> Self {
        Self {
            playback: Playback::new(timer),
            verify_assets: true,
            presented: 0,
            showing: None,
        }
    }

    /// Treat every asset as loadable, for dry runs on machines without the
    /// media folder.
    pub fn assume_assets_present(mut self) -> Self {
        self.verify_assets = false;
        self
    }

    pub fn presented(&self) -> usize {
        self.presented
    }

    pub fn showing(&self) -> Option<Ticket> {
        self.showing
    }

    pub fn next_deadline(&self) -> Option<u64> {
        self.playback.next_deadline()
    }

    fn load(&mut self, descriptor: &StimulusDescriptor, ticket: Ticket) {
        let Some(locator) = descriptor.asset.as_deref() else {
            self.playback
                .emit(ticket, SignalKind::Error("no asset named".to_string()));
            return;
        };
        let probed = if self.verify_assets {
            probe_asset(locator)
        } else {
            Ok(AssetKind::Media(locator.to_string()))
        };
        match probed {
            Ok(_) => {
                self.playback.emit(ticket, SignalKind::Ready);
                self.playback
                    .end_after(ticket, descriptor.clip_ms.unwrap_or(0));
            }
            Err(reason) => self.playback.emit(ticket, SignalKind::Error(reason)),
        }
    }
}

impl<T: Timer<Timestamp = u64>> StimulusRenderer for HeadlessRenderer<T> {
    fn present(&mut self, descriptor: &StimulusDescriptor, ticket: Ticket) {
        self.presented += 1;
        debug!(
            generation = ticket.generation,
            stage = ?ticket.stage,
            at_ns = self.playback.now(),
            "present"
        );
        match ticket.stage {
            Stage::Load => self.load(descriptor, ticket),
            Stage::Adapt | Stage::Test => {
                self.playback.replace_stage(ticket.generation);
                self.playback
                    .end_after(ticket, descriptor.duration_ms.unwrap_or(0));
                self.showing = Some(ticket);
            }
        }
    }

    fn stop(&mut self) {
        self.playback.cancel();
        self.showing = None;
    }

    fn poll_signal(&mut self) -> Option<RendererSignal> {
        self.playback.poll()
    }
}
