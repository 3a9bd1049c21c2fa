//! Per-speaker train/validation allocation.
//!
//! Each speaker gets a validation quota of `max(1, round(total * percent / 100))` recordings.
//! While a speaker still has more recordings left than validation slots to fill, a recording
//! goes to validation with probability `percent / 100`. As soon as the remaining recordings are
//! only just enough to fill the quota, all of them are forced into validation. A single forward
//! pass therefore always meets the quota exactly.

use std::collections::HashMap;

use anyhow::{bail, Context, Result};
use rand::Rng;

use crate::loaders::Record;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Split {
    Train,
    Validation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SpeakerStat {
    pub total_count: usize,
    pub processed_so_far: usize,
    pub validation_quota: usize,
    pub validation_selected_so_far: usize,
}

/// `max(1, round(total_count * percent / 100))`, rounding half to even, capped at `total_count`.
pub fn validation_quota(total_count: usize, percent: u32) -> usize {
    let share = (total_count as f64 * percent as f64 / 100.0).round_ties_even() as usize;
    share.max(1).min(total_count)
}

/// Tracks the split decisions for the speakers of one language.
#[derive(Debug, Clone)]
pub struct SpeakerAllocationTracker {
    percent: u32,
    stats: HashMap<String, SpeakerStat>,
}

impl SpeakerAllocationTracker {
    /// Counts the recordings of every speaker, wherever they appear in the list.
    pub fn from_records(records: &[Record], percent: u32) -> Self {
        Self::from_speakers(records.iter().map(|r| r.speaker_id.as_str()), percent)
    }

    pub fn from_speakers<'a>(speakers: impl IntoIterator<Item = &'a str>, percent: u32) -> Self {
        let mut stats: HashMap<String, SpeakerStat> = HashMap::new();
        for speaker in speakers {
            stats.entry(speaker.to_string()).or_default().total_count += 1;
        }
        for stat in stats.values_mut() {
            stat.validation_quota = validation_quota(stat.total_count, percent);
        }
        Self { percent, stats }
    }

    /// Decides where the next recording of `speaker_id` goes.
    ///
    /// Must be called exactly once per recording, in recording order.
    pub fn decide<R: Rng>(&mut self, speaker_id: &str, rng: &mut R) -> Result<Split> {
        let percent = self.percent;
        let stat = self
            .stats
            .get_mut(speaker_id)
            .with_context(|| format!("speaker '{}' has no recordings in this language", speaker_id))?;
        if stat.processed_so_far >= stat.total_count {
            bail!("all {} recordings of speaker '{}' were already allocated", stat.total_count, speaker_id);
        }

        let split = if stat.validation_selected_so_far >= stat.validation_quota {
            Split::Train
        } else {
            let remaining_records = stat.total_count - stat.processed_so_far;
            let remaining_quota = stat.validation_quota - stat.validation_selected_so_far;
            if remaining_records <= remaining_quota {
                Split::Validation
            } else if rng.random_range(0..100u32) < percent {
                Split::Validation
            } else {
                Split::Train
            }
        };

        stat.processed_so_far += 1;
        if split == Split::Validation {
            stat.validation_selected_so_far += 1;
        }
        Ok(split)
    }

    pub fn stat(&self, speaker_id: &str) -> Option<&SpeakerStat> {
        self.stats.get(speaker_id)
    }

    pub fn num_speakers(&self) -> usize {
        self.stats.len()
    }

    /// True once every recording of every speaker went through `decide`.
    pub fn is_exhausted(&self) -> bool {
        self.stats.values().all(|s| s.processed_so_far == s.total_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    fn run(speakers: &[&str], percent: u32, seed: u64) -> (SpeakerAllocationTracker, Vec<Split>) {
        let mut tracker = SpeakerAllocationTracker::from_speakers(speakers.iter().copied(), percent);
        let mut rng = StdRng::seed_from_u64(seed);
        let splits = speakers.iter().map(|s| tracker.decide(s, &mut rng).unwrap()).collect();
        (tracker, splits)
    }

    fn count(splits: &[Split], speakers: &[&str], who: &str, split: Split) -> usize {
        splits.iter().zip(speakers).filter(|(s, sp)| **s == split && **sp == who).count()
    }

    #[test]
    fn quota_is_at_least_one() {
        assert_eq!(validation_quota(1, 15), 1);
        assert_eq!(validation_quota(4, 15), 1);
        assert_eq!(validation_quota(3, 0), 1);
        assert_eq!(validation_quota(100, 15), 15);
    }

    #[test]
    fn quota_rounds_half_to_even() {
        // 10 * 15% = 1.5 and 30 * 15% = 4.5
        assert_eq!(validation_quota(10, 15), 2);
        assert_eq!(validation_quota(30, 15), 4);
        assert_eq!(validation_quota(50, 15), 8);
    }

    #[test]
    fn quota_never_exceeds_total() {
        assert_eq!(validation_quota(4, 100), 4);
        assert_eq!(validation_quota(4, 250), 4);
    }

    #[test]
    fn four_recordings_at_fifteen_percent_give_one_validation() {
        let speakers = ["A"; 4];
        for seed in 0..200 {
            let (tracker, splits) = run(&speakers, 15, seed);
            assert_eq!(count(&splits, &speakers, "A", Split::Validation), 1, "seed {seed}");
            assert_eq!(count(&splits, &speakers, "A", Split::Train), 3, "seed {seed}");
            let stat = tracker.stat("A").unwrap();
            assert_eq!(stat.validation_selected_so_far, stat.validation_quota);
        }
    }

    #[test]
    fn single_recording_is_forced_into_validation() {
        for seed in 0..50 {
            let (_, splits) = run(&["B"], 15, seed);
            assert_eq!(splits, vec![Split::Validation]);
        }
    }

    #[test]
    fn zero_percent_forces_the_last_recording() {
        // The random branch never selects anything, so only the forced branch fills the quota.
        let (_, splits) = run(&["A"; 5], 0, 1);
        assert_eq!(
            splits,
            vec![Split::Train, Split::Train, Split::Train, Split::Train, Split::Validation]
        );
    }

    #[test]
    fn hundred_percent_selects_until_the_quota_is_met() {
        let (_, splits) = run(&["A"; 3], 100, 1);
        assert_eq!(splits, vec![Split::Validation; 3]);
    }

    #[test]
    fn forced_phase_ignores_randomness() {
        // Quota of 5 out of 10 with the random branch disabled: the first 5 are train and the
        // last 5 are forced, whatever the seed.
        for seed in 0..20 {
            let mut tracker = SpeakerAllocationTracker::from_speakers(["A"; 10], 0);
            tracker.stats.get_mut("A").unwrap().validation_quota = 5;
            let mut rng = StdRng::seed_from_u64(seed);
            let splits: Vec<_> = (0..10).map(|_| tracker.decide("A", &mut rng).unwrap()).collect();
            assert!(splits[..5].iter().all(|s| *s == Split::Train));
            assert!(splits[5..].iter().all(|s| *s == Split::Validation));
        }
    }

    #[test]
    fn interleaved_speakers_meet_their_quotas_exactly() {
        let speakers: Vec<&str> = (0..300)
            .map(|i| match i % 7 {
                0 | 3 => "alice",
                1 => "bob",
                2 | 4 | 5 => "carol",
                _ => if i < 10 { "dave" } else { "erin" },
            })
            .collect();

        for seed in 0..30 {
            let mut tracker = SpeakerAllocationTracker::from_speakers(speakers.iter().copied(), 15);
            let mut rng = StdRng::seed_from_u64(seed);
            for speaker in &speakers {
                tracker.decide(speaker, &mut rng).unwrap();
                let stat = tracker.stat(speaker).unwrap();
                assert!(stat.validation_selected_so_far <= stat.validation_quota);
                assert!(stat.validation_quota <= stat.total_count);
                assert!(stat.processed_so_far <= stat.total_count);
            }
            assert!(tracker.is_exhausted());
            for speaker in ["alice", "bob", "carol", "dave", "erin"] {
                let stat = tracker.stat(speaker).unwrap();
                assert!(stat.validation_quota >= 1);
                assert_eq!(stat.validation_selected_so_far, stat.validation_quota, "{speaker}, seed {seed}");
            }
        }
    }

    #[test]
    fn non_contiguous_speaker_runs_are_counted_together() {
        let tracker = SpeakerAllocationTracker::from_speakers(["a", "b", "a", "a", "b"], 15);
        assert_eq!(tracker.num_speakers(), 2);
        assert_eq!(tracker.stat("a").unwrap().total_count, 3);
        assert_eq!(tracker.stat("b").unwrap().total_count, 2);
    }

    #[test]
    fn unknown_speaker_is_an_error() {
        let mut tracker = SpeakerAllocationTracker::from_speakers(["a"], 15);
        let mut rng = StdRng::seed_from_u64(0);
        assert!(tracker.decide("zed", &mut rng).is_err());
    }

    #[test]
    fn deciding_past_the_last_recording_is_an_error() {
        let mut tracker = SpeakerAllocationTracker::from_speakers(["a"], 15);
        let mut rng = StdRng::seed_from_u64(0);
        tracker.decide("a", &mut rng).unwrap();
        assert!(tracker.decide("a", &mut rng).is_err());
        assert_eq!(tracker.stat("a").unwrap().processed_so_far, 1);
    }

    #[test]
    fn same_seed_same_split() {
        let speakers = ["x"; 40];
        let (_, a) = run(&speakers, 15, 42);
        let (_, b) = run(&speakers, 15, 42);
        assert_eq!(a, b);
    }
}
