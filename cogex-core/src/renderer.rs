//! Contract between the trial engine and whatever draws the stimuli.
//!
//! The engine never looks inside a renderer. It calls `present` and `stop`,
//! and drains signals with `poll_signal`. Every signal echoes the [`Ticket`]
//! it was issued under so the engine can drop signals that belong to a trial
//! it has already moved past.

use crate::stimulus::StimulusDescriptor;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Begin loading the descriptor's asset; answer with `Ready` or `Error`.
    Load,
    Adapt,
    Test,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ticket {
    pub generation: u64,
    pub stage: Stage,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SignalKind {
    Ready,
    Error(String),
    Ended,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RendererSignal {
    pub ticket: Ticket,
    pub kind: SignalKind,
}

#[derive(Error, Debug)]
pub enum RenderError {
    #[error("render surface unavailable: {0}")]
    SurfaceMissing(String),

    #[error("font could not be loaded from {path}: {reason}")]
    Font { path: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub trait StimulusRenderer {
    fn present(&mut self, descriptor: &StimulusDescriptor, ticket: Ticket);
    fn stop(&mut self);
    fn poll_signal(&mut self) -> Option<RendererSignal>;

    /// Checked once before the first trial.
    fn check_surface(&self) -> Result<(), RenderError> {
        Ok(())
    }
}

impl<R: StimulusRenderer + ?Sized> StimulusRenderer for Box<R> {
    fn present(&mut self, descriptor: &StimulusDescriptor, ticket: Ticket) {
        (**self).present(descriptor, ticket)
    }
    fn stop(&mut self) {
        (**self).stop()
    }
    fn poll_signal(&mut self) -> Option<RendererSignal> {
        (**self).poll_signal()
    }
    fn check_surface(&self) -> Result<(), RenderError> {
        (**self).check_surface()
    }
}
