use rand::Rng;
use rand_pcg::Pcg32;
use uuid::Uuid;

/// Namespace for deriving seeds from correlation ids.
const CORRELATION_NAMESPACE: Uuid = Uuid::from_u128(0x2b5d_90a4_1c7e_4f06_8e33_d1a9_47c2_6e5f);

/// The seed of a sampling decision.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct SamplingSeed(Uuid);

impl SamplingSeed {
    /// Derives the seed shared by all items of an operation.
    pub fn from_correlation_id(correlation_id: &str) -> Self {
        Self(Uuid::new_v5(&CORRELATION_NAMESPACE, correlation_id.as_bytes()))
    }

    /// Uses the identity of a single item as seed.
    pub fn from_identity(id: Uuid) -> Self {
        Self(id)
    }

    /// Returns the score of this seed, a uniformly distributed value in `[0, 100)`.
    ///
    /// The score is deterministic: the same seed always results in the same score.
    pub fn score(self) -> f64 {
        pseudo_random_from_uuid(self.0) * 100.0
    }
}

/// Generates a pseudo random number in `[0, 1)` by seeding the generator with the given id.
fn pseudo_random_from_uuid(id: Uuid) -> f64 {
    let big_seed = id.as_u128();
    let mut generator = Pcg32::new((big_seed >> 64) as u64, big_seed as u64);
    generator.random::<f64>()
}

/// The outcome of sampling a single item.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SamplingDecision {
    /// The percentage in effect for this item.
    pub percentage: f64,
    /// Whether the item is kept.
    pub keep: bool,
}

impl SamplingDecision {
    /// Decides whether an item with the given seed is kept at `percentage`.
    pub fn new(percentage: f64, seed: SamplingSeed) -> Self {
        let keep = if percentage >= 100.0 {
            true
        } else if percentage <= 0.0 {
            false
        } else {
            let score = seed.score();
            beacon_log::trace!(percentage, score, "applying sampling to item");
            score < percentage
        };

        Self { percentage, keep }
    }

    /// Returns true if the item should be dropped.
    pub fn should_drop(&self) -> bool {
        !self.keep
    }
}

/// Rounds a percentage down to the nearest value of the form `100 / n` for an integer `n`.
///
/// With such percentages, every kept item represents an integral number of items, which keeps
/// extrapolated counts exact.
pub fn round_to_ratio(percentage: f64) -> f64 {
    if percentage >= 100.0 {
        return 100.0;
    }
    if percentage <= 0.0 {
        return 0.0;
    }

    let n = (100.0 / percentage).ceil();
    100.0 / n
}
