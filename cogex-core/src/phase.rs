use std::fmt;

/// Per-trial lifecycle. `Concluding` always produces exactly one result.
#[derive(Copy, Debug, Clone, PartialEq, Eq, Default)]
pub enum TrialPhase {
    #[default]
    Idle,
    Loading,
    /// Presenting(adapt)
    Adapting,
    /// Presenting(test), waiting out the onset delay
    AwaitingOnset,
    AwaitingResponse,
    Concluding,
}

impl TrialPhase {
    pub fn allows_input(&self) -> bool {
        matches!(self, TrialPhase::AwaitingResponse)
    }

    pub fn is_presenting(&self) -> bool {
        matches!(self, TrialPhase::Adapting | TrialPhase::AwaitingOnset)
    }

    /// Phases in which a renderer signal for the live trial may matter.
    pub fn listens_to_renderer(&self) -> bool {
        matches!(
            self,
            TrialPhase::Loading | TrialPhase::Adapting | TrialPhase::AwaitingResponse
        )
    }
}

impl fmt::Display for TrialPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TrialPhase::Idle => "idle",
            TrialPhase::Loading => "loading",
            TrialPhase::Adapting => "presenting(adapt)",
            TrialPhase::AwaitingOnset => "presenting(test)",
            TrialPhase::AwaitingResponse => "awaiting-response",
            TrialPhase::Concluding => "concluding",
        };
        f.write_str(name)
    }
}

#[derive(Copy, Debug, Clone, PartialEq, Eq, Default)]
pub enum SessionPhase {
    #[default]
    Ready,
    Running,
    Finished,
}
