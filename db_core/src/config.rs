use std::{collections::HashSet, sync::Arc};

use crate::{
    abundance::FilterConfig,
    combine::CombineParams,
    counter::{ContigInfo, CountParams, StrandMode},
    dispersion::DispersionOptions,
    interval::IntervalSet,
    matrix::DesignMatrix,
    merge::MergeParams,
    normalize::{NormStrategy, TrimParams},
    CoreError, Result,
};

/// AnalysisConfig
///
/// All settings for one analysis run.  The same value is passed to every stage so
/// that stages sharing a setting (e.g., mapping quality for windows and bins) cannot
/// diverge.  `validate()` should be called before the configuration is used.
///
#[derive(Debug, Clone)]
pub struct AnalysisConfig {
    width: usize,
    spacing: usize,
    bin_width: usize,
    ext_len: usize,
    min_mapq: u8,
    min_count: u32,
    strand_mode: StrandMode,
    chromosomes: Option<HashSet<String>>,
    discard: Option<Arc<IntervalSet>>,
    filter: FilterConfig,
    norm_strategy: NormStrategy,
    trim: TrimParams,
    dispersion: DispersionOptions,
    merge: MergeParams,
    combine: CombineParams,
    design: Option<DesignMatrix>,
    contrast: Option<Vec<f64>>,
    threads: usize,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            width: 10,
            spacing: 50,
            bin_width: 10000,
            ext_len: 100,
            min_mapq: 20,
            min_count: 10,
            strand_mode: StrandMode::Unstranded,
            chromosomes: None,
            discard: None,
            filter: FilterConfig::default(),
            norm_strategy: NormStrategy::Background,
            trim: TrimParams::default(),
            dispersion: DispersionOptions::default(),
            merge: MergeParams::default(),
            combine: CombineParams::default(),
            design: None,
            contrast: None,
            threads: 1,
        }
    }
}

impl AnalysisConfig {
    pub fn validate(&self) -> Result<()> {
        for (s, x) in [
            ("Window width", self.width),
            ("Window spacing", self.spacing),
            ("Bin width", self.bin_width),
            ("Extension length", self.ext_len),
        ] {
            if x == 0 {
                return Err(CoreError::Config(format!("{} must be positive", s)));
            }
        }
        self.trim.check()?;
        self.filter.check()?;
        self.dispersion.check()?;
        self.merge.check()?;
        self.combine.check()?;
        match (&self.design, &self.contrast) {
            (Some(d), Some(c)) => {
                // Checks length and that the contrast is not all zero
                d.reparametrize(c)?;
                Ok(())
            }
            _ => Err(CoreError::Config(
                "Design matrix and contrast must be set".to_string(),
            )),
        }
    }

    pub fn set_window(&mut self, width: usize, spacing: usize) {
        self.width = width;
        self.spacing = spacing;
    }

    pub fn set_bin_width(&mut self, x: usize) {
        self.bin_width = x
    }

    pub fn set_ext_len(&mut self, x: usize) {
        self.ext_len = x
    }

    pub fn set_min_mapq(&mut self, x: u8) {
        self.min_mapq = x
    }

    pub fn set_min_count(&mut self, x: u32) {
        self.min_count = x
    }

    pub fn set_strand_mode(&mut self, x: StrandMode) {
        self.strand_mode = x
    }

    pub fn set_chromosomes<I: IntoIterator<Item = String>>(&mut self, it: I) {
        self.chromosomes = Some(it.into_iter().collect())
    }

    pub fn set_discard(&mut self, set: IntervalSet) {
        self.discard = Some(Arc::new(set))
    }

    pub fn set_filter(&mut self, x: FilterConfig) {
        self.filter = x
    }

    pub fn set_normalization(&mut self, strategy: NormStrategy, trim: TrimParams) {
        self.norm_strategy = strategy;
        self.trim = trim;
    }

    pub fn set_dispersion(&mut self, x: DispersionOptions) {
        self.dispersion = x
    }

    pub fn set_merge(&mut self, x: MergeParams) {
        self.merge = x
    }

    pub fn set_combine(&mut self, x: CombineParams) {
        self.combine = x
    }

    pub fn set_design(&mut self, design: DesignMatrix, contrast: Vec<f64>) {
        self.design = Some(design);
        self.contrast = Some(contrast);
    }

    pub fn set_threads(&mut self, x: usize) {
        self.threads = x.max(1)
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn spacing(&self) -> usize {
        self.spacing
    }

    pub fn bin_width(&self) -> usize {
        self.bin_width
    }

    pub fn ext_len(&self) -> usize {
        self.ext_len
    }

    pub fn min_mapq(&self) -> u8 {
        self.min_mapq
    }

    pub fn min_count(&self) -> u32 {
        self.min_count
    }

    pub fn strand_mode(&self) -> StrandMode {
        self.strand_mode
    }

    pub fn filter(&self) -> &FilterConfig {
        &self.filter
    }

    pub fn norm_strategy(&self) -> NormStrategy {
        self.norm_strategy
    }

    pub fn trim(&self) -> &TrimParams {
        &self.trim
    }

    pub fn dispersion(&self) -> &DispersionOptions {
        &self.dispersion
    }

    pub fn merge(&self) -> &MergeParams {
        &self.merge
    }

    pub fn combine(&self) -> &CombineParams {
        &self.combine
    }

    pub fn design(&self) -> Option<&DesignMatrix> {
        self.design.as_ref()
    }

    pub fn contrast(&self) -> Option<&[f64]> {
        self.contrast.as_deref()
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Contigs passing the chromosome restriction (all if none was set)
    pub fn select_contigs(&self, contigs: &[ContigInfo]) -> Vec<ContigInfo> {
        contigs
            .iter()
            .filter(|c| {
                self.chromosomes
                    .as_ref()
                    .map(|s| s.contains(c.name.as_ref()))
                    .unwrap_or(true)
            })
            .cloned()
            .collect()
    }

    /// Counting parameters for the analysis windows
    pub fn window_params(&self) -> CountParams {
        CountParams {
            width: self.width,
            spacing: self.spacing,
            min_mapq: self.min_mapq,
            min_count: self.min_count,
            strand_mode: self.strand_mode,
            discard: self.discard.clone(),
            threads: self.threads,
        }
    }

    /// Counting parameters for background bins: no count filter.  Bins are split by
    /// strand along with the windows so both are on the same scale.
    pub fn bin_params(&self) -> CountParams {
        CountParams {
            width: self.bin_width,
            spacing: self.bin_width,
            min_count: 0,
            ..self.window_params()
        }
    }
}
