//! Window abundance and background filtering
//!
//! Abundance is the log2 of the average count per million over the non-empty
//! libraries, with a prior count (scaled by library size) added to every count.
//! Averaging is done on the CPM scale using log-sum-exp so that a single library
//! with very low counts does not dominate.

use std::{f64::consts::LN_2, fmt, str::FromStr};

use utils::{average_ranks, median};

use crate::{matrix::CountMatrix, CoreError, Result};

const LN_MILLION: f64 = 13.815510557964274;

/// Average log2 CPM for one row of counts
pub fn ave_log_cpm_row(row: &[u32], lib_sizes: &[f64], prior: f64) -> f64 {
    let used = || lib_sizes.iter().zip(row).filter(|(n, _)| **n > 0.0);
    let k = used().count();
    if k == 0 {
        return f64::NEG_INFINITY;
    }
    let mean_size = used().map(|(n, _)| n).sum::<f64>() / k as f64;
    let lcpm: Vec<f64> = used()
        .map(|(n, y)| {
            let p = prior * n / mean_size;
            (*y as f64 + p).ln() - (n + 2.0 * p).ln() + LN_MILLION
        })
        .collect();
    let mx = lcpm.iter().fold(f64::NEG_INFINITY, |a, b| a.max(*b));
    if !mx.is_finite() {
        return mx / LN_2;
    }
    let s: f64 = lcpm.iter().map(|x| (x - mx).exp()).sum();
    (mx + s.ln() - (k as f64).ln()) / LN_2
}

/// Abundance of every row of m using the matrix library sizes
pub fn ave_log_cpm(m: &CountMatrix, prior: f64) -> Vec<f64> {
    let sizes: Vec<f64> = m.lib_sizes().iter().map(|n| *n as f64).collect();
    m.rows().map(|r| ave_log_cpm_row(r, &sizes, prior)).collect()
}

/// Abundance rescaled to a reference width: counts from intervals `scale` times wider
/// get a correspondingly larger prior and the result is shifted down by log2(scale)
pub fn scaled_average(m: &CountMatrix, scale: f64, prior: f64) -> Vec<f64> {
    let shift = scale.log2();
    ave_log_cpm(m, prior * scale)
        .into_iter()
        .map(|a| a - shift)
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterMode {
    Global,
    Local,
    Proportion,
}

impl FromStr for FilterMode {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "global" => Ok(Self::Global),
            "local" => Ok(Self::Local),
            "proportion" => Ok(Self::Proportion),
            _ => Err(CoreError::Config(format!("Unknown filter mode {}", s))),
        }
    }
}

impl fmt::Display for FilterMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::Global => "global",
            Self::Local => "local",
            Self::Proportion => "proportion",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct FilterConfig {
    pub mode: FilterMode,
    /// Minimum log2 enrichment over background (global and local modes)
    pub threshold: f64,
    pub prior_count: f64,
    /// Flank on each side of a window for the local neighbourhood
    pub surround: usize,
    /// Fraction of genome windows kept in proportion mode
    pub proportion: f64,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            mode: FilterMode::Global,
            threshold: 3f64.log2(),
            prior_count: 2.0,
            surround: 2000,
            proportion: 0.01,
        }
    }
}

impl FilterConfig {
    pub fn check(&self) -> Result<()> {
        if self.prior_count.is_nan() || self.prior_count <= 0.0 {
            Err(CoreError::Config(format!(
                "Prior count ({}) must be positive",
                self.prior_count
            )))
        } else if self.mode == FilterMode::Proportion
            && !(self.proportion > 0.0 && self.proportion <= 1.0)
        {
            Err(CoreError::Config(format!(
                "Filter proportion ({}) must be in (0, 1]",
                self.proportion
            )))
        } else if self.mode == FilterMode::Local && self.surround == 0 {
            Err(CoreError::Config(
                "Surround width for local filtering must be positive".to_string(),
            ))
        } else {
            Ok(())
        }
    }

    /// Value the filter statistic must exceed for a window to be kept
    pub fn retention_threshold(&self) -> f64 {
        match self.mode {
            FilterMode::Proportion => 1.0 - self.proportion,
            _ => self.threshold,
        }
    }
}

/// Per window abundance and filter statistic aligned to the rows of the input matrix
#[derive(Debug, Clone)]
pub struct FilterStats {
    abundances: Vec<f64>,
    stats: Vec<f64>,
}

impl FilterStats {
    pub fn abundances(&self) -> &[f64] {
        &self.abundances
    }

    pub fn stats(&self) -> &[f64] {
        &self.stats
    }

    /// Retention mask: true where the statistic is strictly above the threshold
    pub fn retain(&self, threshold: f64) -> Vec<bool> {
        self.stats.iter().map(|s| *s > threshold).collect()
    }
}

/// Enrichment over the median abundance of genome wide background bins
pub fn filter_global(windows: &CountMatrix, bins: &CountMatrix, prior: f64) -> Result<FilterStats> {
    if windows.n_libs() != bins.n_libs() {
        return Err(CoreError::Dimension(format!(
            "Window matrix has {} libraries, bin matrix {}",
            windows.n_libs(),
            bins.n_libs()
        )));
    }
    if windows.width() == 0 || bins.width() == 0 {
        return Err(CoreError::Config("Window and bin widths must be positive".to_string()));
    }
    let scale = bins.width() as f64 / windows.width() as f64;
    let bin_ab: Vec<f64> = scaled_average(bins, scale, prior)
        .into_iter()
        .filter(|x| x.is_finite())
        .collect();
    let bg = median(&bin_ab).unwrap_or(f64::NEG_INFINITY);
    debug!(
        "Global background abundance {:.4} from {} bins (scale {})",
        bg,
        bin_ab.len(),
        scale
    );
    let abundances = ave_log_cpm(windows, prior);
    let stats = abundances.iter().map(|a| a - bg).collect();
    Ok(FilterStats { abundances, stats })
}

/// Enrichment over the surrounding neighbourhood of each window.  `neighbours` holds
/// the counts for each window expanded by the surround width (same row order); the
/// window's own counts are removed before the comparison.
pub fn filter_local(
    windows: &CountMatrix,
    neighbours: &CountMatrix,
    prior: f64,
) -> Result<FilterStats> {
    if windows.n_windows() != neighbours.n_windows() || windows.n_libs() != neighbours.n_libs() {
        return Err(CoreError::Dimension(format!(
            "Neighbourhood matrix is {} x {}, window matrix {} x {}",
            neighbours.n_windows(),
            neighbours.n_libs(),
            windows.n_windows(),
            windows.n_libs()
        )));
    }
    let sizes: Vec<f64> = windows.lib_sizes().iter().map(|n| *n as f64).collect();
    let mut abundances = Vec::with_capacity(windows.n_windows());
    let mut stats = Vec::with_capacity(windows.n_windows());
    let mut nbr = vec![0u32; windows.n_libs()];
    for i in 0..windows.n_windows() {
        let w = windows.window(i).width();
        let nw = neighbours.window(i).width().saturating_sub(w).max(1);
        let scale = nw as f64 / w as f64;
        for ((x, a), b) in nbr.iter_mut().zip(neighbours.row(i)).zip(windows.row(i)) {
            *x = a.saturating_sub(*b)
        }
        let ab = ave_log_cpm_row(windows.row(i), &sizes, prior);
        let nab = ave_log_cpm_row(&nbr, &sizes, prior * scale) - scale.log2();
        abundances.push(ab);
        stats.push(ab - nab);
    }
    Ok(FilterStats { abundances, stats })
}

/// Rank based statistic: windows are kept if they are in the top fraction of all
/// windows that could be tiled on the genome (`genome_windows`)
pub fn filter_proportion(windows: &CountMatrix, genome_windows: usize, prior: f64) -> FilterStats {
    let abundances = ave_log_cpm(windows, prior);
    let n = abundances.len() as f64;
    let g = genome_windows.max(abundances.len()).max(1) as f64;
    let stats = average_ranks(&abundances)
        .into_iter()
        .map(|r| 1.0 - (n - r) / g)
        .collect();
    FilterStats { abundances, stats }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interval::{Contig, GenomicInterval, Strand};
    use assert_approx_eq::assert_approx_eq;
    use rstest::rstest;
    use std::sync::Arc;

    fn make(rows: &[Vec<u32>], lib_sizes: Vec<u64>, width: usize) -> CountMatrix {
        let c: Contig = Arc::from("chr1");
        let windows = (0..rows.len())
            .map(|k| {
                GenomicInterval::new(&c, k * width + 1, (k + 1) * width, Strand::Unstranded)
                    .unwrap()
            })
            .collect();
        let counts = rows.iter().flatten().copied().collect();
        CountMatrix::new(windows, counts, lib_sizes, width).unwrap()
    }

    #[rstest]
    #[case(&[10, 10], 10.0)]
    #[case(&[0, 0], 0.0)]
    #[case(&[100, 100], 100.0)]
    fn equal_libraries_give_cpm(#[case] row: &[u32], #[case] y: f64) {
        let sizes = [1.0e6, 1.0e6];
        // prior 1 => cpm = (y + 1) / (1e6 + 2) * 1e6
        let expect = ((y + 1.0) / (1.0e6 + 2.0) * 1.0e6).log2();
        assert_approx_eq!(ave_log_cpm_row(row, &sizes, 1.0), expect, 1e-10);
    }

    #[test]
    fn empty_libraries_ignored() {
        let a = ave_log_cpm_row(&[10, 0], &[1.0e6, 0.0], 1.0);
        let b = ave_log_cpm_row(&[10], &[1.0e6], 1.0);
        assert_approx_eq!(a, b, 1e-12);
        assert!(ave_log_cpm_row(&[0], &[0.0], 1.0).is_infinite());
    }

    #[test]
    fn scaled_average_matches_width() {
        // A bin 10x wider with 10x the counts has the same scaled abundance
        let w = make(&[vec![5, 7]], vec![100_000, 100_000], 10);
        let b = make(&[vec![50, 70]], vec![100_000, 100_000], 100);
        let a1 = ave_log_cpm(&w, 2.0)[0];
        let a2 = scaled_average(&b, 10.0, 2.0)[0];
        // Only the library size correction for the larger prior differs
        assert_approx_eq!(a1, a2, 1e-3);
    }

    #[test]
    fn global_filter_at_background_is_zero() {
        let bins = make(
            &[vec![40, 40], vec![50, 50], vec![60, 60]],
            vec![100_000, 100_000],
            100,
        );
        let windows = make(&[vec![50, 50], vec![500, 500]], vec![100_000, 100_000], 100);
        let f = filter_global(&windows, &bins, 2.0).unwrap();
        assert_approx_eq!(f.stats()[0], 0.0, 1e-10);
        assert!(f.stats()[1] > 3f64.log2());
        assert_eq!(f.retain(3f64.log2()), vec![false, true]);
    }

    #[test]
    fn local_filter_compares_to_flanks() {
        let sizes = vec![100_000, 100_000];
        let windows = make(&[vec![20, 20], vec![2, 2]], sizes.clone(), 10);
        // Neighbourhoods 50bp wide (40bp of flank) holding 8 and 8 further reads
        let nb = make(&[vec![28, 28], vec![10, 10]], sizes, 50);
        let f = filter_local(&windows, &nb, 2.0).unwrap();
        assert!(f.stats()[0] > 3f64.log2());
        assert!(f.stats()[1] < f.stats()[0]);
        assert_eq!(f.retain(3f64.log2()), vec![true, false]);
    }

    #[test]
    fn proportion_keeps_top_windows() {
        let rows: Vec<Vec<u32>> = (0..10).map(|i| vec![i * 5, i * 5]).collect();
        let m = make(&rows, vec![100_000, 100_000], 10);
        let f = filter_proportion(&m, 100, 1.0);
        let keep = f.retain(1.0 - 0.03);
        assert_eq!(keep.iter().filter(|k| **k).count(), 3);
        assert!(keep[9] && keep[8] && keep[7]);
    }
}
