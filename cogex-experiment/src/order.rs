//! Session trial ordering under distributional constraints.
//!
//! Rare conditions are placed first, each at least `min_spacing` slots from
//! every other rare event. The remaining slots are filled from a pre-balanced,
//! shuffled pool of the common conditions, optionally re-drawing to avoid two
//! identical neighbours.

use crate::error::ConfigError;
use rand::Rng;
use rand::seq::{IndexedRandom, SliceRandom};
use tracing::{debug, warn};

const PROPORTION_TOLERANCE: f64 = 1e-6;
const ADJACENT_REDRAWS: usize = 100;

#[derive(Debug, Clone, PartialEq)]
pub struct ConditionShare {
    pub label: String,
    pub proportion: f64,
}

impl ConditionShare {
    pub fn new(label: impl Into<String>, proportion: f64) -> Self {
        Self {
            label: label.into(),
            proportion,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RareConstraint {
    pub label: String,
    pub min_spacing: usize,
}

/// A generated label sequence. `rare_placed < rare_requested` when the
/// spacing constraint could not fit every rare event; the slots that could
/// not take one were filled with common conditions instead.
#[derive(Debug, Clone, PartialEq)]
pub struct TrialOrder {
    pub labels: Vec<String>,
    pub rare_positions: Vec<usize>,
    pub rare_requested: usize,
}

impl TrialOrder {
    pub fn rare_placed(&self) -> usize {
        self.rare_positions.len()
    }

    pub fn is_partial(&self) -> bool {
        self.rare_placed() < self.rare_requested
    }
}

#[derive(Debug, Clone)]
pub struct TrialOrderGenerator {
    total: usize,
    shares: Vec<ConditionShare>,
    rare: Option<RareConstraint>,
    no_adjacent_repeat: bool,
}

impl TrialOrderGenerator {
    pub fn new(total: usize, shares: Vec<ConditionShare>) -> Result<Self, ConfigError> {
        if total == 0 {
            return Err(ConfigError::NoTrials);
        }
        if shares.is_empty() {
            return Err(ConfigError::NoConditions);
        }
        for share in &shares {
            if !share.proportion.is_finite() || share.proportion < 0.0 {
                return Err(ConfigError::InvalidProportion {
                    condition: share.label.clone(),
                    value: share.proportion,
                });
            }
        }
        let sum: f64 = shares.iter().map(|s| s.proportion).sum();
        if (sum - 1.0).abs() > PROPORTION_TOLERANCE {
            return Err(ConfigError::ProportionSum { sum });
        }
        Ok(Self {
            total,
            shares,
            rare: None,
            no_adjacent_repeat: false,
        })
    }

    pub fn with_rare(
        mut self,
        label: impl Into<String>,
        min_spacing: usize,
    ) -> Result<Self, ConfigError> {
        let label = label.into();
        if !self.shares.iter().any(|s| s.label == label) {
            return Err(ConfigError::UnknownRareCondition(label));
        }
        if self.shares.len() < 2 {
            return Err(ConfigError::NoConditions);
        }
        self.rare = Some(RareConstraint { label, min_spacing });
        Ok(self)
    }

    pub fn no_adjacent_repeat(mut self, enabled: bool) -> Self {
        self.no_adjacent_repeat = enabled;
        self
    }

    pub fn total(&self) -> usize {
        self.total
    }

    fn rare_index(&self) -> Option<usize> {
        let rare = self.rare.as_ref()?;
        self.shares.iter().position(|s| s.label == rare.label)
    }

    fn rarest_index(&self) -> Option<usize> {
        self.rare_index().or_else(|| {
            self.shares
                .iter()
                .enumerate()
                .filter(|(_, s)| s.proportion > 0.0)
                .min_by(|(_, a), (_, b)| a.proportion.total_cmp(&b.proportion))
                .map(|(i, _)| i)
        })
    }

    /// Integer count per condition, in the order the shares were given.
    ///
    /// The rarest condition gets at least one slot; rounding drift is absorbed
    /// by the most common conditions so the counts always sum to `total`.
    pub fn condition_counts(&self) -> Vec<usize> {
        let total = self.total as f64;
        let mut counts: Vec<usize> = self
            .shares
            .iter()
            .map(|s| (s.proportion * total).round() as usize)
            .collect();

        let rarest = self.rarest_index();
        if let Some(i) = rarest.filter(|&i| self.shares[i].proportion > 0.0) {
            counts[i] = counts[i].max(1);
        }

        let mut by_size: Vec<usize> = (0..counts.len()).filter(|&i| Some(i) != rarest).collect();
        by_size.sort_by(|&a, &b| {
            self.shares[b]
                .proportion
                .total_cmp(&self.shares[a].proportion)
        });
        if let Some(i) = rarest {
            by_size.push(i);
        }

        let sum: usize = counts.iter().sum();
        if sum < self.total {
            counts[by_size[0]] += self.total - sum;
        } else {
            let mut excess = sum - self.total;
            for &i in &by_size {
                if excess == 0 {
                    break;
                }
                let take = excess.min(counts[i]);
                counts[i] -= take;
                excess -= take;
            }
        }
        counts
    }

    pub fn generate<R: Rng + ?Sized>(&self, rng: &mut R) -> TrialOrder {
        let counts = self.condition_counts();
        let rare_index = self.rare_index();
        let mut slots: Vec<Option<usize>> = vec![None; self.total];

        let (rare_requested, rare_positions) = match (rare_index, &self.rare) {
            (Some(ri), Some(rare)) => {
                let requested = counts[ri];
                let positions = place_spaced(self.total, requested, rare.min_spacing, rng);
                for &p in &positions {
                    slots[p] = Some(ri);
                }
                (requested, positions)
            }
            _ => (0, Vec::new()),
        };

        let mut pool: Vec<usize> = Vec::with_capacity(self.total);
        for (i, &count) in counts.iter().enumerate() {
            if Some(i) != rare_index {
                pool.extend(std::iter::repeat_n(i, count));
            }
        }

        let shortfall = rare_requested - rare_positions.len();
        if shortfall > 0 {
            warn!(
                requested = rare_requested,
                placed = rare_positions.len(),
                "rare events do not fit the spacing constraint; filling with common conditions"
            );
            let mut commons: Vec<usize> = (0..counts.len()).filter(|&i| Some(i) != rare_index).collect();
            commons.sort_by(|&a, &b| counts[b].cmp(&counts[a]));
            pool.extend(commons.iter().cycle().take(shortfall).copied());
        }

        pool.shuffle(rng);

        for i in 0..self.total {
            if slots[i].is_some() {
                continue;
            }
            let pick = if self.no_adjacent_repeat {
                draw_non_adjacent(&pool, &slots, i, rng)
            } else {
                pool.len() - 1
            };
            slots[i] = Some(pool.swap_remove(pick));
        }

        let labels: Vec<String> = slots
            .into_iter()
            .map(|slot| slot.map(|i| self.shares[i].label.clone()).unwrap_or_default())
            .collect();

        debug!(
            trials = labels.len(),
            rare_requested,
            rare_placed = rare_positions.len(),
            "generated trial order"
        );

        TrialOrder {
            labels,
            rare_positions,
            rare_requested,
        }
    }
}

fn draw_non_adjacent<R: Rng + ?Sized>(
    pool: &[usize],
    slots: &[Option<usize>],
    i: usize,
    rng: &mut R,
) -> usize {
    let prev = i.checked_sub(1).and_then(|p| slots[p]);
    let next = slots.get(i + 1).copied().flatten();
    let mut pick = rng.random_range(0..pool.len());
    for _ in 1..ADJACENT_REDRAWS {
        let label = Some(pool[pick]);
        if label != prev && label != next {
            break;
        }
        pick = rng.random_range(0..pool.len());
    }
    pick
}

/// Chooses up to `requested` positions in `0..slots`, every pair at least
/// `min_spacing` apart, each drawn uniformly from the legal positions that
/// still leave room for the rest.
///
/// Returns fewer positions only when `requested` exceeds what the spacing
/// allows at all; the result is then the largest placement possible.
pub fn place_spaced<R: Rng + ?Sized>(
    slots: usize,
    requested: usize,
    min_spacing: usize,
    rng: &mut R,
) -> Vec<usize> {
    let spacing = min_spacing.max(1);
    let mut blocked = vec![false; slots];
    let target = requested.min(greedy_capacity(&blocked, spacing, None));
    let mut placed: Vec<usize> = Vec::with_capacity(target);

    while placed.len() < requested {
        let candidates: Vec<usize> = (0..slots)
            .filter(|&i| {
                !blocked[i]
                    && placed.len() + 1 + greedy_capacity(&blocked, spacing, Some(i)) >= target
            })
            .collect();
        let Some(&pos) = candidates.choose(rng) else {
            break;
        };
        let lo = pos.saturating_sub(spacing - 1);
        let hi = (pos + spacing - 1).min(slots - 1);
        for b in &mut blocked[lo..=hi] {
            *b = true;
        }
        placed.push(pos);
    }

    placed.sort_unstable();
    placed
}

/// Leftmost-first packing of the unblocked positions; optimal on a line.
fn greedy_capacity(blocked: &[bool], spacing: usize, extra: Option<usize>) -> usize {
    let mut last: Option<usize> = None;
    let mut count = 0;
    for (i, &is_blocked) in blocked.iter().enumerate() {
        if is_blocked {
            continue;
        }
        if let Some(e) = extra {
            if i.abs_diff(e) < spacing {
                continue;
            }
        }
        if let Some(l) = last {
            if i - l < spacing {
                continue;
            }
        }
        count += 1;
        last = Some(i);
    }
    count
}

/// `values` repeated to length `n` and shuffled, so each value appears
/// `n / values.len()` times (plus the remainder from the front).
pub fn balanced<T: Clone, R: Rng + ?Sized>(values: &[T], n: usize, rng: &mut R) -> Vec<T> {
    if values.is_empty() {
        return Vec::new();
    }
    let mut out: Vec<T> = values.iter().cloned().cycle().take(n).collect();
    out.shuffle(rng);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn rare_common(total: usize, rare: f64, spacing: usize) -> TrialOrderGenerator {
        TrialOrderGenerator::new(
            total,
            vec![
                ConditionShare::new("rare", rare),
                ConditionShare::new("common", 1.0 - rare),
            ],
        )
        .unwrap()
        .with_rare("rare", spacing)
        .unwrap()
    }

    fn assert_spaced(positions: &[usize], spacing: usize) {
        for pair in positions.windows(2) {
            assert!(
                pair[1] - pair[0] >= spacing,
                "rare events at {} and {} closer than {}",
                pair[0],
                pair[1],
                spacing
            );
        }
    }

    fn brute_force_max(slots: usize, spacing: usize) -> usize {
        let spacing = spacing.max(1);
        (0u32..(1 << slots))
            .filter(|mask| {
                let picked: Vec<usize> = (0..slots).filter(|i| mask & (1 << i) != 0).collect();
                picked.windows(2).all(|w| w[1] - w[0] >= spacing)
            })
            .map(|mask| mask.count_ones() as usize)
            .max()
            .unwrap_or(0)
    }

    #[test]
    fn twenty_trials_three_rare_spaced_by_eight() {
        let generator = rare_common(20, 0.15, 8);
        assert_eq!(generator.condition_counts(), vec![3, 17]);
        for seed in 0..200 {
            let mut rng = StdRng::seed_from_u64(seed);
            let order = generator.generate(&mut rng);
            assert_eq!(order.labels.len(), 20);
            assert_eq!(order.rare_placed(), 3, "seed {seed}");
            assert_spaced(&order.rare_positions, 8);
            let common = order.labels.iter().filter(|l| *l == "common").count();
            assert_eq!(common, 17);
            for &p in &order.rare_positions {
                assert_eq!(order.labels[p], "rare");
            }
        }
    }

    #[test]
    fn rarest_condition_rounds_up_to_one() {
        let generator = rare_common(10, 0.01, 3);
        assert_eq!(generator.condition_counts(), vec![1, 9]);
    }

    #[test]
    fn counts_always_sum_to_total() {
        let shares = vec![
            ConditionShare::new("a", 1.0 / 3.0),
            ConditionShare::new("b", 1.0 / 3.0),
            ConditionShare::new("c", 1.0 / 3.0),
        ];
        for total in 1..50 {
            let generator = TrialOrderGenerator::new(total, shares.clone()).unwrap();
            assert_eq!(generator.condition_counts().iter().sum::<usize>(), total);
        }
    }

    #[test]
    fn proportions_must_sum_to_one() {
        let err = TrialOrderGenerator::new(
            10,
            vec![ConditionShare::new("a", 0.5), ConditionShare::new("b", 0.4)],
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::ProportionSum { .. }));
    }

    #[test]
    fn unknown_rare_label_is_rejected() {
        let err = TrialOrderGenerator::new(10, vec![ConditionShare::new("a", 1.0)])
            .unwrap()
            .with_rare("x", 2)
            .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownRareCondition(_)));
    }

    #[test]
    fn partial_placement_stops_at_the_maximum() {
        // 10 slots, spacing 4: at most positions {0, 4, 8}.
        let generator = rare_common(10, 0.5, 4);
        let mut rng = StdRng::seed_from_u64(7);
        let order = generator.generate(&mut rng);
        assert_eq!(order.rare_requested, 5);
        assert_eq!(order.rare_placed(), 3);
        assert!(order.is_partial());
        assert_spaced(&order.rare_positions, 4);
        assert_eq!(order.labels.len(), 10);
        assert_eq!(order.labels.iter().filter(|l| *l == "common").count(), 7);
    }

    #[test]
    fn placement_matches_exhaustive_search_for_small_sessions() {
        let mut rng = StdRng::seed_from_u64(42);
        for slots in 1..=12 {
            for spacing in 1..=5 {
                let max = brute_force_max(slots, spacing);
                for requested in 1..=slots {
                    let placed = place_spaced(slots, requested, spacing, &mut rng);
                    assert_spaced(&placed, spacing);
                    assert_eq!(
                        placed.len(),
                        requested.min(max),
                        "slots {slots}, spacing {spacing}, requested {requested}"
                    );
                }
            }
        }
    }

    #[test]
    fn adjacent_repeats_are_avoided() {
        let shares: Vec<ConditionShare> = ["a", "b", "c", "d"]
            .iter()
            .map(|l| ConditionShare::new(*l, 0.25))
            .collect();
        let generator = TrialOrderGenerator::new(100, shares)
            .unwrap()
            .no_adjacent_repeat(true);
        for seed in 0..20 {
            let mut rng = StdRng::seed_from_u64(seed);
            let order = generator.generate(&mut rng);
            let repeats = order.labels.windows(2).filter(|w| w[0] == w[1]).count();
            assert!(repeats <= 4, "seed {seed}: {repeats} adjacent repeats");
            for label in ["a", "b", "c", "d"] {
                assert_eq!(order.labels.iter().filter(|l| *l == label).count(), 25);
            }
        }
    }

    #[test]
    fn same_seed_same_order() {
        let generator = rare_common(100, 0.1, 5).no_adjacent_repeat(true);
        let a = generator.generate(&mut StdRng::seed_from_u64(3));
        let b = generator.generate(&mut StdRng::seed_from_u64(3));
        assert_eq!(a, b);
    }

    #[test]
    fn balanced_keeps_counts() {
        let mut rng = StdRng::seed_from_u64(1);
        let sides = balanced(&["left", "right"], 10, &mut rng);
        assert_eq!(sides.iter().filter(|s| **s == "left").count(), 5);
        assert_eq!(sides.iter().filter(|s| **s == "right").count(), 5);
        assert!(balanced::<u8, _>(&[], 4, &mut rng).is_empty());
    }
}
