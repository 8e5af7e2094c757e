use super::xds_log::{self, ShellRow};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CutoffResult {
    NoCutoff,
    /// High resolution limit in Angstrom, two decimals
    Cutoff(f64),
}

impl CutoffResult {
    pub fn value(&self) -> Option<f64> {
        match self {
            Self::NoCutoff => None,
            Self::Cutoff(v) => Some(*v),
        }
    }
}

/// Find the resolution at which the merged signal/noise falls to the target.
///
/// Shells are walked from the highest resolution toward the lowest. The cutoff
/// is interpolated between the last shell below the target and the first shell
/// reaching it. If the highest resolution shell already reaches the target the
/// data are good to the edge and there is nothing to cut. If no shell reaches the
/// target the lowest resolution shell of the table is returned.
pub fn find_cutoff(correct_text: &str, target: f64) -> CutoffResult {
    let Some(rows) = xds_log::final_shell_table(correct_text) else {
        log::warn!("CORRECT.LP has no resolution shell table");
        return CutoffResult::NoCutoff;
    };
    let result = cutoff_from_shells(&rows, target);
    log::debug!("Resolution cutoff at I/sigma {target}: {result:?}");
    result
}

pub fn cutoff_from_shells(rows: &[ShellRow], target: f64) -> CutoffResult {
    let mut previous: Option<(f64, f64)> = None;
    let mut signal = 0.0;
    for row in rows {
        if let Some(s) = row.signal_to_noise {
            signal = s;
        }
        if signal >= target {
            return match previous {
                None => CutoffResult::NoCutoff,
                Some((prev_res, prev_signal)) => {
                    CutoffResult::Cutoff(round2(interpolate(
                        target,
                        (prev_signal, prev_res),
                        (signal, row.resolution),
                    )))
                }
            };
        }
        previous = Some((row.resolution, signal));
    }
    match previous {
        Some((resolution, _)) => CutoffResult::Cutoff(round2(resolution)),
        None => CutoffResult::NoCutoff,
    }
}

/// Linear interpolation of y at x between two (x, y) points
fn interpolate(x: f64, low: (f64, f64), high: (f64, f64)) -> f64 {
    if high.0 == low.0 {
        return high.1;
    }
    low.1 + (x - low.0) * (high.1 - low.1) / (high.0 - low.0)
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xds_log::fixtures::correct_lp;

    #[test]
    fn test_interpolated_cutoff() {
        // shells from low to high resolution as printed
        let log = correct_lp(&[(4.0, 30.0), (3.0, 8.0), (2.5, 2.0), (2.2, 1.0), (2.0, 0.4)]);
        // between (2.2, 1.0) and (2.5, 2.0): 2.2 + 0.5 * 0.3 = 2.35
        assert_eq!(find_cutoff(&log, 1.5), CutoffResult::Cutoff(2.35));
    }

    #[test]
    fn test_exact_hit_on_shell() {
        let log = correct_lp(&[(3.0, 8.0), (2.5, 1.0), (2.0, 0.5)]);
        assert_eq!(find_cutoff(&log, 1.0), CutoffResult::Cutoff(2.5));
    }

    #[test]
    fn test_first_shell_above_target() {
        let log = correct_lp(&[(3.0, 20.0), (2.0, 4.0)]);
        assert_eq!(find_cutoff(&log, 1.5), CutoffResult::NoCutoff);
    }

    #[test]
    fn test_never_reaches_target() {
        let log = correct_lp(&[(6.0, 1.2), (4.0, 0.9), (3.0, 0.3)]);
        assert_eq!(find_cutoff(&log, 1.5), CutoffResult::Cutoff(6.0));
    }

    #[test]
    fn test_repeatable() {
        let log = correct_lp(&[(3.1, 7.3), (2.71, 1.9), (2.43, 1.1), (2.2, 0.7)]);
        let first = find_cutoff(&log, 1.5);
        for _ in 0..10 {
            assert_eq!(find_cutoff(&log, 1.5), first);
        }
        assert_eq!(first, CutoffResult::Cutoff(2.57));
    }

    #[test]
    fn test_missing_table() {
        assert_eq!(find_cutoff("", 1.0), CutoffResult::NoCutoff);
    }
}
