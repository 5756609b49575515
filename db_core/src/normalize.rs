//! Library normalization
//!
//! Scale factors by the trimmed mean of M values (TMM) against a geometric mean
//! pseudo-library, or (for the trended strategy) a matrix of per-window offsets from
//! loess fits of log-ratio against abundance.

use std::{fmt, str::FromStr};

use utils::average_ranks;

use crate::{abundance::ave_log_cpm_row, matrix::CountMatrix, smooth::Loess, CoreError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormStrategy {
    /// TMM factors from large background bins (composition bias)
    Background,
    /// TMM factors from the filtered, high abundance windows (efficiency bias)
    Filtered,
    /// Per window offsets from a loess fit against abundance
    Trended,
}

impl FromStr for NormStrategy {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "background" | "bins" => Ok(Self::Background),
            "filtered" | "windows" => Ok(Self::Filtered),
            "trended" | "loess" => Ok(Self::Trended),
            _ => Err(CoreError::Config(format!(
                "Unknown normalization strategy {}",
                s
            ))),
        }
    }
}

impl fmt::Display for NormStrategy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::Background => "background",
            Self::Filtered => "filtered",
            Self::Trended => "trended",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TrimParams {
    pub log_ratio: f64,
    pub abundance: f64,
}

impl Default for TrimParams {
    fn default() -> Self {
        Self {
            log_ratio: 0.3,
            abundance: 0.05,
        }
    }
}

impl TrimParams {
    pub fn check(&self) -> Result<()> {
        for (s, x) in [("log ratio", self.log_ratio), ("abundance", self.abundance)] {
            if !(0.0..0.5).contains(&x) {
                return Err(CoreError::Config(format!(
                    "Trim fraction for {} ({}) must be in [0, 0.5)",
                    s, x
                )));
            }
        }
        Ok(())
    }
}

/// One relative scale factor per library (geometric mean 1)
#[derive(Debug, Clone)]
pub struct NormFactors {
    factors: Vec<f64>,
}

impl NormFactors {
    pub fn unit(n_libs: usize) -> Self {
        Self {
            factors: vec![1.0; n_libs],
        }
    }

    pub fn factors(&self) -> &[f64] {
        &self.factors
    }

    pub fn factor(&self, j: usize) -> f64 {
        self.factors[j]
    }
}

/// OffsetMatrix
///
/// Natural log offsets, row major (n_windows x n_libs).  These replace the log
/// effective library sizes in the GLM fits.
///
#[derive(Debug, Clone)]
pub struct OffsetMatrix {
    n_libs: usize,
    offsets: Vec<f64>,
}

impl OffsetMatrix {
    pub fn n_windows(&self) -> usize {
        if self.n_libs == 0 {
            0
        } else {
            self.offsets.len() / self.n_libs
        }
    }

    pub fn row(&self, i: usize) -> &[f64] {
        &self.offsets[i * self.n_libs..(i + 1) * self.n_libs]
    }
}

#[derive(Debug, Clone)]
pub enum Normalization {
    Factors {
        factors: NormFactors,
        lib_sizes: Vec<u64>,
    },
    Offsets(OffsetMatrix),
}

impl Normalization {
    /// Log offsets for window i (one per library)
    pub fn log_offsets(&self, i: usize) -> Vec<f64> {
        match self {
            Self::Factors { factors, lib_sizes } => lib_sizes
                .iter()
                .zip(factors.factors())
                .map(|(n, f)| ((*n).max(1) as f64 * f).ln())
                .collect(),
            Self::Offsets(m) => m.row(i).to_vec(),
        }
    }

    /// Effective library sizes for window i
    pub fn lib_sizes(&self, i: usize) -> Vec<f64> {
        self.log_offsets(i).into_iter().map(f64::exp).collect()
    }

    pub fn factors(&self) -> Option<&NormFactors> {
        match self {
            Self::Factors { factors, .. } => Some(factors),
            Self::Offsets(_) => None,
        }
    }
}

fn log2(x: f64) -> f64 {
    x.log2()
}

// Trimmed, precision weighted mean of log ratios for one library against the reference.
// Rows with a zero in either the library or the reference are skipped.
fn tmm_factor(obs: &[f64], n_obs: f64, refc: &[f64], n_ref: f64, trim: &TrimParams) -> f64 {
    let mut log_r = Vec::new();
    let mut abs_e = Vec::new();
    let mut var = Vec::new();
    for (y, r) in obs.iter().zip(refc) {
        if *y > 0.0 && *r > 0.0 {
            let (p, q) = (y / n_obs, r / n_ref);
            log_r.push(log2(p / q));
            abs_e.push(0.5 * (log2(p) + log2(q)));
            var.push((n_obs - y) / n_obs / y + (n_ref - r) / n_ref / r);
        }
    }
    let n = log_r.len();
    if n == 0 {
        warn!("No rows available for TMM calculation; using factor of 1");
        return 1.0;
    }
    if log_r.iter().fold(0.0f64, |m, x| m.max(x.abs())) < 1.0e-6 {
        return 1.0;
    }
    let bounds = |frac: f64| {
        let lo = (n as f64 * frac).floor() + 1.0;
        (lo, n as f64 + 1.0 - lo)
    };
    let (lo_l, hi_l) = bounds(trim.log_ratio);
    let (lo_s, hi_s) = bounds(trim.abundance);
    let rank_r = average_ranks(&log_r);
    let rank_e = average_ranks(&abs_e);
    let (mut sw, mut swx) = (0.0, 0.0);
    for i in 0..n {
        if rank_r[i] >= lo_l && rank_r[i] <= hi_l && rank_e[i] >= lo_s && rank_e[i] <= hi_s {
            let w = 1.0 / var[i];
            sw += w;
            swx += w * log_r[i];
        }
    }
    if sw > 0.0 && swx.is_finite() {
        (swx / sw).exp2()
    } else {
        1.0
    }
}

/// TMM normalization factors for the libraries of m, rescaled to geometric mean 1.
/// Empty libraries are excluded from the reference and receive a factor of 1.
pub fn calc_norm_factors(m: &CountMatrix, trim: &TrimParams) -> Result<NormFactors> {
    trim.check()?;
    let nl = m.n_libs();
    let sizes = m.lib_sizes();
    let used: Vec<usize> = (0..nl).filter(|j| sizes[*j] > 0).collect();
    let mut factors = vec![1.0; nl];
    if used.len() < 2 {
        debug!("Fewer than two non-empty libraries; all normalization factors set to 1");
        return Ok(NormFactors { factors });
    }
    let k = used.len() as f64;
    let n_ref = (used.iter().map(|j| (sizes[*j] as f64).ln()).sum::<f64>() / k).exp();

    // Geometric mean pseudo-library (zero if any used library is zero)
    let refc: Vec<f64> = m
        .rows()
        .map(|r| {
            if used.iter().any(|j| r[*j] == 0) {
                0.0
            } else {
                (used.iter().map(|j| (r[*j] as f64).ln()).sum::<f64>() / k).exp()
            }
        })
        .collect();
    trace!(
        "TMM reference: {} of {} rows usable",
        refc.iter().filter(|x| **x > 0.0).count(),
        refc.len()
    );

    for j in used.iter() {
        let obs: Vec<f64> = m.rows().map(|r| r[*j] as f64).collect();
        factors[*j] = tmm_factor(&obs, sizes[*j] as f64, &refc, n_ref, trim);
    }
    let gm = (factors.iter().map(|f| f.ln()).sum::<f64>() / nl as f64).exp();
    factors.iter_mut().for_each(|f| *f /= gm);
    debug!("Normalization factors: {:?}", factors);
    Ok(NormFactors { factors })
}

/// Trended offsets: for each library, a loess fit of the log ratio against the row
/// mean abundance.  Fitted values are centred per window and added to the log
/// library sizes.
pub fn trended_offsets(m: &CountMatrix, span: f64) -> Result<OffsetMatrix> {
    let nl = m.n_libs();
    let nw = m.n_windows();
    let sizes: Vec<f64> = m.lib_sizes().iter().map(|n| (*n).max(1) as f64).collect();
    let mean_size = sizes.iter().sum::<f64>() / nl.max(1) as f64;
    let prior: Vec<f64> = sizes.iter().map(|n| 0.5 * n / mean_size).collect();

    // Natural log abundance per window
    let ab: Vec<f64> = m
        .rows()
        .map(|r| ave_log_cpm_row(r, &sizes, 0.5) * std::f64::consts::LN_2)
        .collect();

    let loess = Loess::new(span, 1, 0);
    let mut fitted = vec![0.0; nw * nl];
    for j in 0..nl {
        let y: Vec<f64> = m
            .rows()
            .zip(ab.iter())
            .map(|(r, a)| (r[j] as f64 + prior[j]).ln() - sizes[j].ln() - a)
            .collect();
        if let Some(fit) = loess.fit(&ab, &y, None) {
            for (i, f) in fit.fitted().iter().enumerate() {
                fitted[i * nl + j] = *f
            }
        } else {
            warn!("Loess fit failed for library {}; no trend applied", j)
        }
    }
    let mut offsets = Vec::with_capacity(nw * nl);
    for i in 0..nw {
        let row = &fitted[i * nl..(i + 1) * nl];
        let mean = row.iter().sum::<f64>() / nl as f64;
        offsets.extend(row.iter().zip(sizes.iter()).map(|(f, n)| f - mean + n.ln()));
    }
    debug!("Computed trended offsets for {} windows", nw);
    Ok(OffsetMatrix {
        n_libs: nl,
        offsets,
    })
}

/// Normalizer
///
/// Strategy selector over the normalization methods.  The background strategy
/// requires a bin count matrix; the others work from the filtered windows.
///
#[derive(Debug, Clone, Copy)]
pub struct Normalizer {
    strategy: NormStrategy,
    trim: TrimParams,
    span: f64,
}

impl Normalizer {
    pub fn new(strategy: NormStrategy, trim: TrimParams) -> Self {
        Self {
            strategy,
            trim,
            span: 0.3,
        }
    }

    pub fn strategy(&self) -> NormStrategy {
        self.strategy
    }

    pub fn compute(
        &self,
        bins: Option<&CountMatrix>,
        windows: &CountMatrix,
    ) -> Result<Normalization> {
        info!("Normalizing libraries ({} strategy)", self.strategy);
        let lib_sizes = windows.lib_sizes().to_vec();
        match self.strategy {
            NormStrategy::Background => {
                let b = bins.ok_or_else(|| {
                    CoreError::Config("Background normalization requires bin counts".to_string())
                })?;
                if b.n_libs() != windows.n_libs() {
                    return Err(CoreError::Dimension(format!(
                        "Bin matrix has {} libraries, window matrix {}",
                        b.n_libs(),
                        windows.n_libs()
                    )));
                }
                let factors = calc_norm_factors(b, &self.trim)?;
                Ok(Normalization::Factors { factors, lib_sizes })
            }
            NormStrategy::Filtered => {
                let factors = calc_norm_factors(windows, &self.trim)?;
                Ok(Normalization::Factors { factors, lib_sizes })
            }
            NormStrategy::Trended => Ok(Normalization::Offsets(trended_offsets(
                windows, self.span,
            )?)),
        }
    }
}
