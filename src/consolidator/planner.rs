//! Step planner: picks the next run of adjacent fragments to merge.

use std::ops::Range;

use crate::config::Config;

/// Limits of one consolidation step.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct StepLimits {
    pub(crate) min_frags: usize,
    pub(crate) max_frags: usize,
    pub(crate) size_ratio: f64,
}

impl StepLimits {
    pub(crate) fn from_config(config: &Config) -> Self {
        Self {
            min_frags: config.consolidation_step_min_frags as usize,
            max_frags: config.consolidation_step_max_frags as usize,
            size_ratio: config.consolidation_step_size_ratio,
        }
    }
}

/// Smaller over larger; two empty fragments are alike.
fn size_ratio(a: u64, b: u64) -> f64 {
    match (a, b) {
        (0, 0) => 1.0,
        _ => a.min(b) as f64 / a.max(b) as f64,
    }
}

/// Choose the run of adjacent fragments to consolidate next.
///
/// `sizes[j]` is the persisted size of the `j`-th fragment in time order. Run
/// lengths are tried from the largest allowed down to the smallest; the first
/// length with a valid run wins. Among runs of that length the smallest total
/// size wins, but a later run only displaces the current best when it is more
/// than 25% smaller, so earlier runs are preferred among similar sizes.
pub(crate) fn plan_step(sizes: &[u64], limits: StepLimits) -> Option<Range<usize>> {
    let count = sizes.len();
    let max = limits.max_frags.min(count);
    let min = limits.min_frags.min(count);
    if max == 0 {
        return None;
    }

    // totals[i][j]: size of sizes[j..=j + i], `None` when the run is invalid.
    let mut totals: Vec<Vec<Option<u64>>> = Vec::with_capacity(max);
    totals.push(sizes.iter().copied().map(Some).collect());
    for i in 1..max {
        let row = (0..count)
            .map(|j| {
                if i + j >= count {
                    return None;
                }
                let prev = totals[i - 1][j]?;
                (size_ratio(sizes[i + j - 1], sizes[i + j]) >= limits.size_ratio)
                    .then(|| prev.saturating_add(sizes[i + j]))
            })
            .collect();
        totals.push(row);
    }

    for i in (min.saturating_sub(1)..max).rev() {
        let mut best: Option<(u64, usize)> = None;
        for (j, total) in totals[i].iter().enumerate() {
            let Some(total) = *total else {
                continue;
            };
            match best {
                Some((best_size, _)) if (total as f64) >= best_size as f64 / 1.25 => {}
                _ => best = Some((total, j)),
            }
        }
        if let Some((_, start)) = best {
            return Some(start..start + i + 1);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(min_frags: usize, max_frags: usize, size_ratio: f64) -> StepLimits {
        StepLimits {
            min_frags,
            max_frags,
            size_ratio,
        }
    }

    #[test]
    fn default_limits_take_everything() {
        let all = limits(usize::MAX, usize::MAX, 0.0);
        assert_eq!(plan_step(&[10, 200, 3], all), Some(0..3));
        assert_eq!(plan_step(&[5], all), Some(0..1));
        assert_eq!(plan_step(&[], all), None);
    }

    #[test]
    fn size_ratio_breaks_runs() {
        // 10 next to 1000 fails a 0.5 ratio, leaving two valid pairs.
        let plan = plan_step(&[10, 10, 1000, 1000], limits(2, 4, 0.5));
        assert_eq!(plan, Some(0..2));
        assert_eq!(plan_step(&[10, 1000], limits(2, 2, 0.5)), None);
    }

    #[test]
    fn earlier_runs_win_unless_much_smaller() {
        // Similar totals: the first run is kept.
        assert_eq!(plan_step(&[10, 10, 9, 9], limits(2, 2, 0.0)), Some(0..2));
        // Each later pair is more than 25% smaller than the best so far.
        assert_eq!(plan_step(&[10, 10, 5, 5], limits(2, 2, 0.0)), Some(2..4));
    }
}
