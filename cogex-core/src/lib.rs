pub mod phase;
pub mod renderer;
pub mod stimulus;
pub mod trial;

pub use phase::{SessionPhase, TrialPhase};
pub use renderer::{RenderError, RendererSignal, SignalKind, Stage, StimulusRenderer, Ticket};
pub use stimulus::{CueShape, Direction, StimulusDescriptor, StimulusKind};
pub use trial::{AdaptCompletion, PresentedValues, TrialResult, TrialSpec, TrialStatus, TrialTiming};
