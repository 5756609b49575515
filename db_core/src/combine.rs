//! Combining window tests into region results
//!
//! A region's p-value is Simes' combination of the p-values of its tested windows
//! (or, optionally, the Bonferroni corrected minimum).  Windows whose tests failed do
//! not count towards the number of windows in the region.

use std::{fmt, str::FromStr};

use utils::fdr;

use crate::{tester::TestResult, CoreError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CombineRule {
    Simes,
    /// k times the smallest p-value
    Best,
}

impl FromStr for CombineRule {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "simes" => Ok(Self::Simes),
            "best" => Ok(Self::Best),
            _ => Err(CoreError::Config(format!("Unknown combination rule {}", s))),
        }
    }
}

impl fmt::Display for CombineRule {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Self::Simes => "simes",
            Self::Best => "best",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
    Mixed,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Self::Up => "up",
            Self::Down => "down",
            Self::Mixed => "mixed",
        })
    }
}

#[derive(Debug, Clone)]
pub struct CombineParams {
    pub rule: CombineRule,
    /// Per window significance threshold (on BH adjusted p-values within a region)
    /// used when counting up and down windows
    pub threshold: f64,
}

impl Default for CombineParams {
    fn default() -> Self {
        Self {
            rule: CombineRule::Simes,
            threshold: 0.05,
        }
    }
}

impl CombineParams {
    pub fn check(&self) -> Result<()> {
        if (0.0..=1.0).contains(&self.threshold) {
            Ok(())
        } else {
            Err(CoreError::Config(format!(
                "Window significance threshold ({}) must be in [0, 1]",
                self.threshold
            )))
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegionSummary {
    pub n_windows: usize,
    pub n_up: usize,
    pub n_down: usize,
    pub p_value: f64,
    pub fdr: f64,
    pub direction: Direction,
    /// Index of the window attaining the combined p-value
    pub rep_window: usize,
    pub rep_log_fc: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RegionResult {
    /// No tested windows overlap the region
    NoData,
    Tested(RegionSummary),
}

impl RegionResult {
    pub fn summary(&self) -> Option<&RegionSummary> {
        match self {
            Self::Tested(s) => Some(s),
            Self::NoData => None,
        }
    }

    pub fn p_value(&self) -> Option<f64> {
        self.summary().map(|s| s.p_value)
    }

    pub fn fdr(&self) -> Option<f64> {
        self.summary().map(|s| s.fdr)
    }
}

// Positions of p sorted by increasing p-value
fn order(p: &[f64]) -> Vec<usize> {
    let mut ix: Vec<usize> = (0..p.len()).collect();
    ix.sort_by(|a, b| p[*a].total_cmp(&p[*b]));
    ix
}

/// Simes' combined p-value, min_i (k / i) p_(i), with the position in p of the
/// window attaining it.  None for an empty slice.
pub fn simes(p: &[f64]) -> Option<(f64, usize)> {
    let k = p.len() as f64;
    order(p)
        .into_iter()
        .enumerate()
        .map(|(i, j)| (k * p[j] / (i + 1) as f64, j))
        .fold(None, |acc: Option<(f64, usize)>, x| match acc {
            Some(a) if a.0 <= x.0 => Some(a),
            _ => Some(x),
        })
        .map(|(q, j)| (q.clamp(0.0, 1.0), j))
}

/// Bonferroni corrected minimum p-value
pub fn best_min(p: &[f64]) -> Option<(f64, usize)> {
    let k = p.len() as f64;
    order(p)
        .first()
        .map(|j| ((k * p[*j]).clamp(0.0, 1.0), *j))
}

fn summarise(
    members: &[usize],
    results: &[Option<TestResult>],
    params: &CombineParams,
) -> Result<RegionResult> {
    let mut tested = Vec::with_capacity(members.len());
    for i in members {
        match results.get(*i) {
            Some(Some(r)) => tested.push((*i, r)),
            Some(None) => (),
            None => {
                return Err(CoreError::Dimension(format!(
                    "Window index {} out of range for {} results",
                    i,
                    results.len()
                )))
            }
        }
    }
    if tested.is_empty() {
        return Ok(RegionResult::NoData);
    }
    let p: Vec<f64> = tested.iter().map(|(_, r)| r.p_value).collect();
    let (p_value, k) = match params.rule {
        CombineRule::Simes => simes(&p),
        CombineRule::Best => best_min(&p),
    }
    .ok_or_else(|| CoreError::Dimension("Empty region".to_string()))?;
    let adj = fdr(&p);
    let (mut n_up, mut n_down) = (0, 0);
    for ((_, r), q) in tested.iter().zip(adj.iter()) {
        if *q <= params.threshold {
            if r.log_fc > 0.0 {
                n_up += 1
            } else if r.log_fc < 0.0 {
                n_down += 1
            }
        }
    }
    let (rep_window, rep) = tested[k];
    let direction = match (n_up > 0, n_down > 0) {
        (true, false) => Direction::Up,
        (false, true) => Direction::Down,
        (true, true) => Direction::Mixed,
        (false, false) => {
            if rep.log_fc > 0.0 {
                Direction::Up
            } else if rep.log_fc < 0.0 {
                Direction::Down
            } else {
                Direction::Mixed
            }
        }
    };
    Ok(RegionResult::Tested(RegionSummary {
        n_windows: tested.len(),
        n_up,
        n_down,
        p_value,
        fdr: f64::NAN,
        direction,
        rep_window,
        rep_log_fc: rep.log_fc,
    }))
}

// Benjamini-Hochberg adjustment across the tested regions
fn add_fdr(regions: &mut [RegionResult]) {
    let p: Vec<f64> = regions.iter().filter_map(|r| r.p_value()).collect();
    let q = fdr(&p);
    for (r, q) in regions
        .iter_mut()
        .filter_map(|r| match r {
            RegionResult::Tested(s) => Some(s),
            RegionResult::NoData => None,
        })
        .zip(q)
    {
        r.fdr = q
    }
}

fn combine(
    groups: &[Vec<usize>],
    results: &[Option<TestResult>],
    params: &CombineParams,
) -> Result<Vec<RegionResult>> {
    params.check()?;
    let mut regions = groups
        .iter()
        .map(|g| summarise(g, results, params))
        .collect::<Result<Vec<_>>>()?;
    add_fdr(&mut regions);
    let n_tested = regions.iter().filter(|r| r.summary().is_some()).count();
    debug!(
        "Combined window tests into {} regions ({} without data)",
        regions.len(),
        regions.len() - n_tested
    );
    Ok(regions)
}

/// One result per cluster, where ids gives the cluster of each window
pub fn combine_tests(
    ids: &[usize],
    results: &[Option<TestResult>],
    params: &CombineParams,
) -> Result<Vec<RegionResult>> {
    if ids.len() != results.len() {
        return Err(CoreError::Dimension(format!(
            "{} cluster ids for {} window results",
            ids.len(),
            results.len()
        )));
    }
    let n = ids.iter().max().map(|m| m + 1).unwrap_or(0);
    let mut groups = vec![Vec::new(); n];
    for (i, c) in ids.iter().enumerate() {
        groups[*c].push(i)
    }
    combine(&groups, results, params)
}

/// One result per query interval, where overlaps holds the windows overlapping each
/// query.  A window may contribute to several queries.
pub fn combine_overlaps(
    overlaps: &[Vec<usize>],
    results: &[Option<TestResult>],
    params: &CombineParams,
) -> Result<Vec<RegionResult>> {
    combine(overlaps, results, params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use rstest::rstest;

    fn res(p: f64, log_fc: f64) -> Option<TestResult> {
        Some(TestResult {
            log_fc,
            log_cpm: 3.0,
            statistic: 1.0,
            p_value: p,
        })
    }

    #[rstest]
    #[case(&[0.01, 0.02, 0.5], 0.03)]
    #[case(&[0.2], 0.2)]
    #[case(&[0.5, 0.04, 0.9, 0.01], 0.04)]
    #[case(&[0.9, 0.8], 0.9)]
    fn simes_values(#[case] p: &[f64], #[case] expect: f64) {
        let (q, _) = simes(p).unwrap();
        assert_approx_eq!(q, expect, 1e-12);
    }

    #[test]
    fn single_window_is_unchanged() {
        let r = combine_tests(&[0], &[res(0.0123, 1.0)], &CombineParams::default()).unwrap();
        assert_eq!(r[0].p_value(), Some(0.0123));
        assert!(simes(&[]).is_none());
    }

    #[test]
    fn best_rule() {
        let (q, j) = best_min(&[0.3, 0.01, 0.2]).unwrap();
        assert_approx_eq!(q, 0.03, 1e-12);
        assert_eq!(j, 1);
    }

    #[test]
    fn up_down_counts_and_direction() {
        let results = vec![
            res(0.001, 2.0),
            res(0.002, 1.5),
            res(0.6, -0.2),
            res(0.001, -2.0),
            res(0.4, 0.1),
            None,
        ];
        let ids = [0, 0, 0, 1, 1, 1];
        let r = combine_tests(&ids, &results, &CombineParams::default()).unwrap();
        let a = r[0].summary().unwrap();
        assert_eq!((a.n_windows, a.n_up, a.n_down), (3, 2, 0));
        assert_eq!(a.direction, Direction::Up);
        assert_eq!(a.rep_window, 0);
        let b = r[1].summary().unwrap();
        // The failed window is excluded
        assert_eq!((b.n_windows, b.n_up, b.n_down), (2, 0, 1));
        assert_eq!(b.direction, Direction::Down);
        assert_approx_eq!(b.p_value, 0.002, 1e-12);
        // Region FDR over both regions
        assert_approx_eq!(a.fdr, 0.003, 1e-12);
        assert_approx_eq!(b.fdr, 0.003, 1e-12);
    }

    #[test]
    fn overlap_variant_reports_no_data() {
        let results = vec![res(0.01, 1.0), res(0.03, -1.0), None];
        let overlaps = vec![vec![0, 1], vec![], vec![1], vec![2]];
        let r = combine_overlaps(&overlaps, &results, &CombineParams::default()).unwrap();
        assert_eq!(r.len(), 4);
        assert_eq!(r[1], RegionResult::NoData);
        assert_eq!(r[3], RegionResult::NoData);
        assert_approx_eq!(r[0].p_value().unwrap(), 0.02, 1e-12);
        assert_approx_eq!(r[2].p_value().unwrap(), 0.03, 1e-12);
        assert!(combine_overlaps(&[vec![7]], &results, &CombineParams::default()).is_err());
    }
}
