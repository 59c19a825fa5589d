use std::collections::BTreeSet;

const NS_PER_MS: f64 = 1_000_000.0;

#[derive(Debug, Clone, PartialEq)]
pub enum ResponseOutcome {
    Accepted { symbol: String, rt_ms: f64 },
    /// Faster than a human could plausibly react; the window stays open.
    Premature { elapsed_ms: f64 },
    NotQualifying,
    Closed,
}

/// Accepts at most one response between stimulus onset and expiry.
#[derive(Debug, Clone)]
pub struct ResponseWindow {
    valid: BTreeSet<String>,
    onset_ns: u64,
    expires_at: Option<u64>,
    min_plausible_ns: u64,
    open: bool,
}

impl ResponseWindow {
    /// `window_ms == 0` leaves the window open until closed explicitly.
    pub fn open(
        valid: BTreeSet<String>,
        onset_ns: u64,
        window_ms: u64,
        min_plausible_ms: u64,
    ) -> Self {
        Self {
            valid,
            onset_ns,
            expires_at: (window_ms > 0).then(|| onset_ns + window_ms * 1_000_000),
            min_plausible_ns: min_plausible_ms * 1_000_000,
            open: true,
        }
    }

    pub fn onset_ns(&self) -> u64 {
        self.onset_ns
    }

    pub fn expires_at(&self) -> Option<u64> {
        self.expires_at.filter(|_| self.open)
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// With no valid responses every key qualifies; such a press is what
    /// marks a catch trial as failed.
    pub fn offer(&mut self, symbol: &str, now_ns: u64) -> ResponseOutcome {
        if !self.open || self.expires_at.is_some_and(|at| now_ns >= at) {
            return ResponseOutcome::Closed;
        }
        if !self.valid.is_empty() && !self.valid.contains(symbol) {
            return ResponseOutcome::NotQualifying;
        }
        let elapsed = now_ns.saturating_sub(self.onset_ns);
        if elapsed < self.min_plausible_ns {
            return ResponseOutcome::Premature {
                elapsed_ms: elapsed as f64 / NS_PER_MS,
            };
        }
        self.open = false;
        ResponseOutcome::Accepted {
            symbol: symbol.to_string(),
            rt_ms: elapsed as f64 / NS_PER_MS,
        }
    }

    /// True exactly once, the first time it is polled at or after expiry.
    pub fn poll_expiry(&mut self, now_ns: u64) -> bool {
        match self.expires_at {
            Some(at) if self.open && now_ns >= at => {
                self.open = false;
                true
            }
            _ => false,
        }
    }

    pub fn close(&mut self) {
        self.open = false;
    }
}
