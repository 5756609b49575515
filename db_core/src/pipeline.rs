//! End-to-end driver
//!
//! Runs every stage on materialized libraries with a single [`AnalysisConfig`] and
//! collects the typed intermediate results.  The tables written by the front end are
//! produced from [`AnalysisResults`] through the `Display` wrappers at the bottom of
//! this module.

use std::{collections::HashMap, fmt};

use crate::{
    abundance::{
        ave_log_cpm, filter_global, filter_local, filter_proportion, FilterMode, FilterStats,
    },
    combine::{combine_overlaps, combine_tests, CombineParams, RegionResult},
    config::AnalysisConfig,
    counter::{count_regions, count_windows, ContigInfo, Library, StrandMode},
    dispersion::{estimate_dispersion, DispersionEstimate},
    interval::IntervalSet,
    matrix::CountMatrix,
    merge::{merge_windows, Clusters},
    normalize::{NormStrategy, Normalization, Normalizer},
    tester::{test_contrast, WindowTests},
    CoreError, Result,
};

/// AnalysisResults
///
/// windows - count matrix of the windows that passed filtering
/// tests - one result per row of windows
/// clusters - clustering of the filtered windows
/// regions - one result per cluster
///
pub struct AnalysisResults {
    windows: CountMatrix,
    tests: WindowTests,
    clusters: Clusters,
    regions: Vec<RegionResult>,
    norm: Normalization,
    dispersion: DispersionEstimate,
    n_counted: usize,
}

impl AnalysisResults {
    pub fn windows(&self) -> &CountMatrix {
        &self.windows
    }

    pub fn tests(&self) -> &WindowTests {
        &self.tests
    }

    pub fn clusters(&self) -> &Clusters {
        &self.clusters
    }

    pub fn regions(&self) -> &[RegionResult] {
        &self.regions
    }

    pub fn normalization(&self) -> &Normalization {
        &self.norm
    }

    pub fn dispersion(&self) -> &DispersionEstimate {
        &self.dispersion
    }

    /// Number of windows counted before filtering
    pub fn n_counted(&self) -> usize {
        self.n_counted
    }

    /// Regions with FDR at or below the threshold
    pub fn n_significant(&self, threshold: f64) -> usize {
        self.regions
            .iter()
            .filter(|r| r.fdr().map(|q| q <= threshold).unwrap_or(false))
            .count()
    }

    /// Combine the window tests over externally supplied intervals (e.g., promoters).
    /// Results follow the order of `queries.intervals()`; a window may contribute to
    /// several queries.
    pub fn combine_queries(
        &self,
        queries: &IntervalSet,
        params: &CombineParams,
    ) -> Result<Vec<RegionResult>> {
        let mut overlaps = vec![Vec::new(); queries.len()];
        for (i, w) in self.windows.windows().iter().enumerate() {
            for q in queries.overlapping(w) {
                overlaps[q].push(i)
            }
        }
        combine_overlaps(&overlaps, self.tests.results(), params)
    }

    pub fn region_table(&self) -> RegionTable {
        RegionTable(self)
    }

    pub fn window_table(&self) -> WindowTable {
        WindowTable(self)
    }
}

fn n_tiles(contigs: &[ContigInfo], spacing: usize) -> usize {
    contigs
        .iter()
        .filter(|c| c.length > 0)
        .map(|c| (c.length - 1) / spacing + 1)
        .sum()
}

fn filter_windows(
    cfg: &AnalysisConfig,
    libs: &[Library],
    contigs: &[ContigInfo],
    windows: &CountMatrix,
    bins: Option<&CountMatrix>,
) -> Result<FilterStats> {
    let fc = cfg.filter();
    match fc.mode {
        FilterMode::Global => {
            let b = bins.ok_or_else(|| {
                CoreError::Config("Global filtering requires bin counts".to_string())
            })?;
            filter_global(windows, b, fc.prior_count)
        }
        FilterMode::Local => {
            let len: HashMap<&str, usize> =
                contigs.iter().map(|c| (c.name.as_ref(), c.length)).collect();
            let nbr: Vec<_> = windows
                .windows()
                .iter()
                .map(|w| {
                    let l = len.get(w.ctg().as_ref()).copied().unwrap_or_else(|| w.end());
                    w.expand(fc.surround, l)
                })
                .collect();
            let nm = count_regions(libs, &nbr, contigs, &cfg.window_params())?;
            filter_local(windows, &nm, fc.prior_count)
        }
        FilterMode::Proportion => {
            let mut g = n_tiles(contigs, cfg.spacing());
            if cfg.strand_mode() == StrandMode::Split {
                g *= 2
            }
            Ok(filter_proportion(windows, g, fc.prior_count))
        }
    }
}

/// Run the complete analysis on the libraries over the selected contigs
pub fn run(
    cfg: &AnalysisConfig,
    libs: &[Library],
    contigs: &[ContigInfo],
) -> Result<AnalysisResults> {
    cfg.validate()?;
    let (design, contrast) = match (cfg.design(), cfg.contrast()) {
        (Some(d), Some(c)) => (d, c),
        _ => {
            return Err(CoreError::Config(
                "Design matrix and contrast must be set".to_string(),
            ))
        }
    };
    if design.n_libs() != libs.len() {
        return Err(CoreError::Dimension(format!(
            "Design has {} libraries but {} were supplied",
            design.n_libs(),
            libs.len()
        )));
    }
    let contigs = cfg.select_contigs(contigs);
    info!(
        "Analysing {} libraries over {} contigs",
        libs.len(),
        contigs.len()
    );

    // Counting
    let counts = count_windows(libs, &contigs, &cfg.window_params())?.into_matrix(&contigs)?;
    let n_counted = counts.n_windows();
    info!("Counted {} windows", n_counted);
    let need_bins =
        cfg.filter().mode == FilterMode::Global || cfg.norm_strategy() == NormStrategy::Background;
    let bins = if need_bins {
        let b = count_windows(libs, &contigs, &cfg.bin_params())?.into_matrix(&contigs)?;
        debug!("Counted {} background bins", b.n_windows());
        Some(b)
    } else {
        None
    };

    // Filtering
    let stats = filter_windows(cfg, libs, &contigs, &counts, bins.as_ref())?;
    let keep = stats.retain(cfg.filter().retention_threshold());
    let windows = counts.subset(&keep)?;
    info!(
        "Retained {} of {} windows after {} filtering",
        windows.n_windows(),
        n_counted,
        cfg.filter().mode
    );
    if windows.is_empty() {
        return Err(CoreError::Dimension(
            "No windows passed the abundance filter".to_string(),
        ));
    }

    // Modelling
    let norm =
        Normalizer::new(cfg.norm_strategy(), *cfg.trim()).compute(bins.as_ref(), &windows)?;
    if let Some(f) = norm.factors() {
        info!("Normalization factors: {:?}", f.factors())
    }
    let abundance = ave_log_cpm(&windows, cfg.filter().prior_count);
    let dispersion = estimate_dispersion(
        &windows,
        &norm,
        design,
        &abundance,
        cfg.dispersion(),
        cfg.threads(),
    )?;
    let tests = test_contrast(
        &windows,
        &norm,
        design,
        contrast,
        &dispersion,
        &abundance,
        cfg.threads(),
    )?;

    // Regions
    let clusters = merge_windows(windows.windows(), cfg.merge())?;
    let regions = combine_tests(clusters.ids(), tests.results(), cfg.combine())?;
    let res = AnalysisResults {
        windows,
        tests,
        clusters,
        regions,
        norm,
        dispersion,
        n_counted,
    };
    info!(
        "{} regions, {} with FDR <= 0.05",
        res.regions.len(),
        res.n_significant(0.05)
    );
    Ok(res)
}

struct Opt(Option<f64>, bool);

impl fmt::Display for Opt {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match (self.0, self.1) {
            (Some(x), true) => write!(f, "{:.6e}", x),
            (Some(x), false) => write!(f, "{:.6}", x),
            (None, _) => write!(f, "NA"),
        }
    }
}

/// One row per region, tab separated with a header line
pub struct RegionTable<'a>(&'a AnalysisResults);

impl<'a> fmt::Display for RegionTable<'a> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(
            f,
            "chrom\tstart\tend\tstrand\tnWindows\tnUp\tnDown\tdirection\tlogFC\tPValue\tFDR"
        )?;
        for (iv, r) in self.0.clusters.regions().iter().zip(self.0.regions.iter()) {
            write!(f, "{}\t{}\t{}\t{}", iv.ctg(), iv.start(), iv.end(), iv.strand())?;
            match r.summary() {
                Some(s) => writeln!(
                    f,
                    "\t{}\t{}\t{}\t{}\t{:.6}\t{:.6e}\t{:.6e}",
                    s.n_windows, s.n_up, s.n_down, s.direction, s.rep_log_fc, s.p_value, s.fdr
                )?,
                None => writeln!(f, "\t0\t0\t0\tNA\tNA\tNA\tNA")?,
            }
        }
        Ok(())
    }
}

/// One row per filtered window, tab separated with a header line
pub struct WindowTable<'a>(&'a AnalysisResults);

impl<'a> fmt::Display for WindowTable<'a> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(
            f,
            "chrom\tstart\tend\tstrand\tlogFC\tlogCPM\tstatistic\tPValue\tcluster"
        )?;
        let res = self.0.tests.results();
        for ((w, r), id) in self
            .0
            .windows
            .windows()
            .iter()
            .zip(res.iter())
            .zip(self.0.clusters.ids().iter())
        {
            writeln!(
                f,
                "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
                w.ctg(),
                w.start(),
                w.end(),
                w.strand(),
                Opt(r.map(|x| x.log_fc), false),
                Opt(r.map(|x| x.log_cpm), false),
                Opt(r.map(|x| x.statistic), false),
                Opt(r.map(|x| x.p_value), true),
                id + 1
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        abundance::FilterConfig,
        interval::{GenomicInterval, Strand},
    };
    use std::sync::Arc;

    // Even coverage: 200 forward and 200 reverse fragments on every 100bp block
    fn even_coverage() -> (Vec<Library>, Vec<ContigInfo>) {
        let ctg = ContigInfo {
            name: Arc::from("chr1"),
            length: 20_000,
        };
        let mut libs = vec![Library::new("a"), Library::new("b")];
        for lib in libs.iter_mut() {
            for i in 0..200 {
                for st in [Strand::Forward, Strand::Reverse] {
                    let iv =
                        GenomicInterval::new(&ctg.name, 100 * i + 1, 100 * i + 100, st).unwrap();
                    for _ in 0..200 {
                        lib.add_fragment(&iv, 60)
                    }
                }
            }
        }
        (libs, vec![ctg])
    }

    // Filter statistic of the (forward if stranded) window starting at 10001
    fn stat_at_centre(mode: FilterMode, strand_mode: StrandMode) -> f64 {
        let (libs, ctgs) = even_coverage();
        let mut cfg = AnalysisConfig::default();
        cfg.set_bin_width(2000);
        cfg.set_min_count(1);
        cfg.set_strand_mode(strand_mode);
        cfg.set_filter(FilterConfig {
            mode,
            ..Default::default()
        });
        let counts = count_windows(&libs, &ctgs, &cfg.window_params())
            .unwrap()
            .into_matrix(&ctgs)
            .unwrap();
        let bins = count_windows(&libs, &ctgs, &cfg.bin_params())
            .unwrap()
            .into_matrix(&ctgs)
            .unwrap();
        let stats = filter_windows(&cfg, &libs, &ctgs, &counts, Some(&bins)).unwrap();
        let i = counts
            .windows()
            .iter()
            .position(|w| w.start() == 10_001 && w.strand() != Strand::Reverse)
            .unwrap();
        stats.stats()[i]
    }

    #[test]
    fn stranded_filters_match_unstranded() {
        for mode in [FilterMode::Global, FilterMode::Local] {
            let a = stat_at_centre(mode, StrandMode::Unstranded);
            let b = stat_at_centre(mode, StrandMode::Split);
            assert!(a > 2.0);
            assert!((a - b).abs() < 0.25, "{} filter: {} vs {}", mode, a, b);
        }
    }

    #[test]
    fn tile_count() {
        let c = |n: usize| ContigInfo {
            name: Arc::from("x"),
            length: n,
        };
        assert_eq!(n_tiles(&[c(0), c(1), c(50), c(51), c(101)], 50), 1 + 1 + 2 + 3);
    }

    #[test]
    fn missing_design_rejected() {
        let cfg = AnalysisConfig::default();
        let libs = vec![Library::new("a"), Library::new("b")];
        assert!(run(&cfg, &libs, &[]).is_err());
    }
}
