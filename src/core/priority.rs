use crate::config::PriorityConfig;
use crate::core::job::PriorityFactors;
use crate::core::GIB;
use std::cmp::Ordering;
use std::time::SystemTime;

/// The fields of a queued job the priority computation actually reads.
/// Both the process-supervising scheduler and the mock-SLURM daemon build
/// one of these per candidate, so the promotion decision is identical no
/// matter what triggers it.
#[derive(Debug)]
pub struct Candidate<'a> {
    pub user: &'a str,
    pub vram_required: u64,
    pub partition: &'a str,
    pub qos: &'a str,
    pub created_at: SystemTime,
    /// Lowercased job name plus script text, scanned for physics keywords.
    pub text: &'a str,
}

/// SLURM-style multi-factor priority:
///
/// ```text
/// priority = W_age * age + W_fair * fair_share + W_size * size
///          + W_part * partition + W_qos * qos + W_phys * physics
/// ```
///
/// with every factor normalized into [0, 1].
#[derive(Debug, Clone)]
pub struct PriorityEngine {
    config: PriorityConfig,
}

impl PriorityEngine {
    pub fn new(config: PriorityConfig) -> Self {
        Self { config }
    }

    /// Score one candidate against its ledger reading at time `now`,
    /// returning the weighted sum and the per-factor breakdown.
    pub fn score(&self, candidate: &Candidate<'_>, user_usage: f64, now: SystemTime) -> (f64, PriorityFactors) {
        let cfg = &self.config;

        // Age: a week of waiting saturates at 1.0, bounding starvation.
        let waited = now
            .duration_since(candidate.created_at)
            .unwrap_or_default()
            .as_secs_f64();
        let age = (waited / cfg.max_age_sec as f64).min(1.0);

        // Fair-share: heavy users decay towards 0, light users sit near 1.
        let fair_share = 1.0 / (1.0 + user_usage / cfg.fairshare_decay_norm);

        // Job size: larger VRAM requests score higher (classic HPC packing
        // policy), saturating at the reference capacity.
        let max_vram_ref = cfg.max_vram_ref_gib.saturating_mul(GIB);
        let size = (candidate.vram_required as f64 / max_vram_ref as f64).min(1.0);

        let partition = self.partition_factor(candidate.partition);
        let qos = self.qos_factor(candidate.qos);

        let physics = if cfg.weight_physics != 0.0 && self.matches_physics(candidate.text) {
            1.0
        } else {
            0.0
        };

        let score = cfg.weight_age * age
            + cfg.weight_fairshare * fair_share
            + cfg.weight_job_size * size
            + cfg.weight_partition * partition
            + cfg.weight_qos * qos
            + cfg.weight_physics * physics;

        let factors = PriorityFactors {
            age,
            fair_share,
            size,
            partition,
            qos,
            physics,
            raw_usage: user_usage,
        };
        (score, factors)
    }

    pub fn partition_factor(&self, partition: &str) -> f64 {
        self.config
            .partitions
            .get(partition.to_lowercase().as_str())
            .copied()
            .unwrap_or(0.5)
    }

    pub fn qos_factor(&self, qos: &str) -> f64 {
        self.config
            .qos_levels
            .get(qos.to_lowercase().as_str())
            .copied()
            .unwrap_or(0.5)
    }

    fn matches_physics(&self, text: &str) -> bool {
        self.config
            .physics_keywords
            .iter()
            .any(|keyword| text.contains(keyword.as_str()))
    }
}

/// Admission order: score descending, ties broken by older submission,
/// then by lexicographic job id so the order is total and reproducible.
pub fn rank_order(
    (score_a, created_a, id_a): (f64, SystemTime, &str),
    (score_b, created_b, id_b): (f64, SystemTime, &str),
) -> Ordering {
    score_b
        .total_cmp(&score_a)
        .then_with(|| created_a.cmp(&created_b))
        .then_with(|| id_a.cmp(id_b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::time::Duration;

    fn engine() -> PriorityEngine {
        PriorityEngine::new(PriorityConfig::default())
    }

    fn candidate<'a>(user: &'a str, qos: &'a str, created_at: SystemTime) -> Candidate<'a> {
        Candidate {
            user,
            vram_required: GIB,
            partition: "normal",
            qos,
            created_at,
            text: "",
        }
    }

    #[test]
    fn test_factors_stay_normalized() {
        let now = SystemTime::now();
        let created = now - Duration::from_secs(30 * 24 * 3600);
        let c = Candidate {
            user: "alice",
            vram_required: 200 * GIB,
            partition: "debug",
            qos: "hil",
            created_at: created,
            text: "isaac robot sim",
        };

        let (_, factors) = engine().score(&c, 1e12, now);
        assert_eq!(factors.age, 1.0);
        assert_eq!(factors.size, 1.0);
        assert_eq!(factors.partition, 1.0);
        assert_eq!(factors.qos, 1.0);
        assert_eq!(factors.physics, 1.0);
        assert!(factors.fair_share > 0.0 && factors.fair_share < 1e-6);
    }

    #[test]
    fn test_unknown_partition_and_qos_fall_back() {
        let e = engine();
        assert_eq!(e.partition_factor("mystery"), 0.5);
        assert_eq!(e.qos_factor("mystery"), 0.5);
        // Lookups are case-insensitive, matching the original queue files.
        assert_eq!(e.qos_factor("HIL"), 1.0);
        assert_eq!(e.partition_factor("Debug"), 1.0);
    }

    #[test]
    fn test_fairshare_halves_at_decay_norm() {
        let now = SystemTime::now();
        let (_, factors) = engine().score(&candidate("alice", "standard", now), 36000.0, now);
        assert!((factors.fair_share - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_qos_dominates_equal_peers() {
        let e = engine();
        let now = SystemTime::now();
        let (hil, _) = e.score(&candidate("bob", "hil", now), 0.0, now);
        let (standard, _) = e.score(&candidate("alice", "standard", now), 0.0, now);
        assert!(hil > standard);
    }

    #[test]
    fn test_fairshare_outweighs_qos_by_default() {
        // A fresh user at standard QoS beats a saturated user at hil:
        // W_fair = 10000 dwarfs the 500-point QoS swing.
        let e = engine();
        let now = SystemTime::now();
        let (heavy_hil, _) = e.score(&candidate("heavy", "hil", now), 1e9, now);
        let (fresh_standard, _) = e.score(&candidate("fresh", "standard", now), 0.0, now);
        assert!(fresh_standard > heavy_hil);
    }

    #[test]
    fn test_physics_keywords_add_bonus() {
        let e = engine();
        let now = SystemTime::now();
        let mut plain = candidate("alice", "standard", now);
        plain.text = "train a language model";
        let mut physics = candidate("alice", "standard", now);
        physics.text = "mujoco locomotion rollout";

        let (plain_score, plain_factors) = e.score(&plain, 0.0, now);
        let (physics_score, physics_factors) = e.score(&physics, 0.0, now);

        assert_eq!(plain_factors.physics, 0.0);
        assert_eq!(physics_factors.physics, 1.0);
        assert!((physics_score - plain_score - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_rank_order_breaks_ties_deterministically() {
        let t0 = SystemTime::UNIX_EPOCH;
        let t1 = t0 + Duration::from_secs(10);

        // Higher score first.
        assert_eq!(
            rank_order((2.0, t0, "b"), (1.0, t0, "a")),
            Ordering::Less
        );
        // Equal score: older submission first.
        assert_eq!(
            rank_order((1.0, t0, "b"), (1.0, t1, "a")),
            Ordering::Less
        );
        // Equal score and age: lexicographic id.
        assert_eq!(
            rank_order((1.0, t0, "a"), (1.0, t0, "b")),
            Ordering::Less
        );
    }

    proptest! {
        // Waiting longer never lowers a job's score while everything else
        // is held constant (monotone aging bounds starvation).
        #[test]
        fn prop_score_is_monotone_in_age(
            waited in 0u64..100_000_000,
            extra in 0u64..100_000_000,
            usage in 0.0f64..1e9,
        ) {
            let e = engine();
            let created = SystemTime::UNIX_EPOCH;
            let t1 = created + Duration::from_secs(waited);
            let t2 = t1 + Duration::from_secs(extra);
            let c = candidate("alice", "standard", created);

            let (s1, _) = e.score(&c, usage, t1);
            let (s2, _) = e.score(&c, usage, t2);
            prop_assert!(s2 >= s1 - 1e-9);
        }
    }
}
