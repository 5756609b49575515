//! Dispersion estimation
//!
//! Three layers are estimated in turn:
//!
//! - a common negative binomial dispersion maximizing the summed Cox-Reid adjusted
//!   profile likelihood over all windows
//! - a trended dispersion: common dispersions for bins of windows with similar
//!   abundance, smoothed by loess against abundance
//! - quasi-likelihood dispersions (deviance / residual df) for each window from a fit
//!   with the trended dispersion, squeezed towards an abundance trend by empirical Bayes
//!
//! The empirical Bayes step fits a scaled F distribution to the raw quasi-likelihood
//! dispersions by matching moments of their log values around the trend.  With the
//! robust option the trend is fitted with bisquare reweighting and the moment
//! estimate uses the same weights, so isolated extreme windows have little influence.

use utils::{digamma, median, trigamma, trigamma_inverse};

use crate::{
    glm::{adjusted_profile_loglik, fit_nb_glm},
    matrix::{CountMatrix, DesignMatrix},
    normalize::Normalization,
    pool::parallel_map,
    smooth::Loess,
    CoreError, Result,
};

const MIN_DISPERSION: f64 = 1.0e-4;
const MAX_DISPERSION: f64 = 10.0;
const GOLDEN_TOL: f64 = 1.0e-4;
const WINDOWS_PER_BIN: usize = 20;
const CHUNK_SIZE: usize = 256;

#[derive(Debug, Clone)]
pub struct DispersionOptions {
    pub robust: bool,
    /// Use this dispersion for every window and skip estimation (likelihood ratio tests)
    pub fixed: Option<f64>,
    /// Maximum number of abundance bins for the trended dispersion
    pub trend_bins: usize,
    pub span: f64,
}

impl Default for DispersionOptions {
    fn default() -> Self {
        Self {
            robust: true,
            fixed: None,
            trend_bins: 50,
            span: 0.5,
        }
    }
}

impl DispersionOptions {
    pub fn check(&self) -> Result<()> {
        match self.fixed {
            Some(x) if x.is_nan() || x < 0.0 => Err(CoreError::Config(format!(
                "Fixed dispersion ({}) must be non-negative",
                x
            ))),
            _ if self.trend_bins == 0 => Err(CoreError::Config(
                "Number of dispersion trend bins must be positive".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

/// Raw and squeezed quasi-likelihood dispersions
#[derive(Debug, Clone)]
pub struct QlDispersion {
    raw: Vec<f64>,
    prior: Vec<f64>,
    shrunk: Vec<f64>,
    df_residual: f64,
    df_prior: f64,
}

impl QlDispersion {
    pub fn raw(&self) -> &[f64] {
        &self.raw
    }

    /// Trend value each window is shrunk towards
    pub fn prior(&self) -> &[f64] {
        &self.prior
    }

    pub fn shrunk(&self) -> &[f64] {
        &self.shrunk
    }

    pub fn df_residual(&self) -> f64 {
        self.df_residual
    }

    pub fn df_prior(&self) -> f64 {
        self.df_prior
    }

    /// Denominator degrees of freedom for the F tests.  The prior contribution is
    /// capped so that the total does not exceed the pooled residual df.
    pub fn df_total(&self) -> f64 {
        let pooled = self.df_residual * self.raw.len() as f64;
        (self.df_residual + self.df_prior).min(pooled)
    }
}

#[derive(Debug, Clone)]
pub struct DispersionEstimate {
    common: f64,
    trended: Vec<f64>,
    ql: Option<QlDispersion>,
}

impl DispersionEstimate {
    pub fn common(&self) -> f64 {
        self.common
    }

    pub fn trended(&self) -> &[f64] {
        &self.trended
    }

    /// None when a fixed dispersion was supplied
    pub fn ql(&self) -> Option<&QlDispersion> {
        self.ql.as_ref()
    }
}

// Counts and log offsets for one window
struct WindowData {
    y: Vec<f64>,
    offset: Vec<f64>,
}

fn window_data(counts: &CountMatrix, norm: &Normalization) -> Vec<WindowData> {
    counts
        .rows()
        .enumerate()
        .map(|(i, r)| WindowData {
            y: r.iter().map(|c| *c as f64).collect(),
            offset: norm.log_offsets(i),
        })
        .collect()
}

// Golden section search for the maximum of f on [a, b]
fn golden_max<F: FnMut(f64) -> Result<f64>>(mut f: F, a: f64, b: f64, tol: f64) -> Result<f64> {
    let g = 0.5 * (5f64.sqrt() - 1.0);
    let (mut a, mut b) = (a, b);
    let mut c = b - g * (b - a);
    let mut d = a + g * (b - a);
    let mut fc = f(c)?;
    let mut fd = f(d)?;
    while (b - a).abs() > tol {
        if fc >= fd {
            b = d;
            d = c;
            fd = fc;
            c = b - g * (b - a);
            fc = f(c)?;
        } else {
            a = c;
            c = d;
            fc = fd;
            d = a + g * (b - a);
            fd = f(d)?;
        }
    }
    Ok(0.5 * (a + b))
}

// Common dispersion for the windows in ix
fn common_dispersion(
    data: &[WindowData],
    ix: &[usize],
    design: &DesignMatrix,
    threads: usize,
) -> Result<f64> {
    let total_apl = |t: f64| -> Result<f64> {
        let phi = t.exp();
        let chunks: Vec<&[usize]> = ix.chunks(CHUNK_SIZE).collect();
        let sums = parallel_map(chunks, threads, |c| {
            Ok(c.iter()
                .filter_map(|i| adjusted_profile_loglik(&data[*i].y, &data[*i].offset, design, phi))
                .sum::<f64>())
        })?;
        Ok(sums.into_iter().sum())
    };
    let t = golden_max(
        total_apl,
        MIN_DISPERSION.ln(),
        MAX_DISPERSION.ln(),
        GOLDEN_TOL,
    )?;
    Ok(t.exp())
}

fn trended_dispersion(
    data: &[WindowData],
    design: &DesignMatrix,
    abundance: &[f64],
    common: f64,
    opts: &DispersionOptions,
    threads: usize,
) -> Result<Vec<f64>> {
    let n = data.len();
    let n_bins = (n / WINDOWS_PER_BIN).min(opts.trend_bins);
    if n_bins < 3 {
        debug!("Too few windows ({}) for a dispersion trend; using common dispersion", n);
        return Ok(vec![common; n]);
    }
    let mut ix: Vec<usize> = (0..n).collect();
    ix.sort_unstable_by(|a, b| abundance[*a].total_cmp(&abundance[*b]));
    let bins: Vec<&[usize]> = (0..n_bins)
        .map(|k| &ix[k * n / n_bins..(k + 1) * n / n_bins])
        .collect();
    let bin_disp = parallel_map(bins, threads, |b| {
        let ab: Vec<f64> = b.iter().map(|i| abundance[*i]).filter(|x| x.is_finite()).collect();
        let phi = common_dispersion(data, b, design, 1)?;
        Ok((median(&ab).unwrap_or(f64::NAN), phi.ln()))
    })?;
    for (k, (a, t)) in bin_disp.iter().enumerate() {
        trace!("Dispersion bin {}: abundance {:.3}, dispersion {:.5}", k, a, t.exp())
    }
    let (x, y): (Vec<f64>, Vec<f64>) = bin_disp.into_iter().unzip();
    match Loess::new(opts.span, 1, 0).fit(&x, &y, None) {
        Some(fit) => Ok(abundance
            .iter()
            .map(|a| {
                let t = fit.predict(*a);
                if t.is_finite() {
                    t.exp().clamp(MIN_DISPERSION, MAX_DISPERSION)
                } else {
                    common
                }
            })
            .collect()),
        None => {
            warn!("Dispersion trend could not be fitted; using common dispersion");
            Ok(vec![common; n])
        }
    }
}

/// Empirical Bayes squeezing of variances s2 on d degrees of freedom towards a trend
/// against covariate.  Returns (prior values, prior df, posterior values).
pub fn squeeze_var(
    s2: &[f64],
    d: f64,
    covariate: &[f64],
    robust: bool,
) -> (Vec<f64>, f64, Vec<f64>) {
    let ok: Vec<usize> = (0..s2.len())
        .filter(|i| s2[*i].is_finite() && s2[*i] >= 0.0 && covariate[*i].is_finite())
        .collect();
    let n = ok.len() as f64;
    if ok.len() < 2 {
        warn!(
            "Too few usable windows to estimate a prior; quasi-likelihood dispersions not squeezed"
        );
        return (s2.to_vec(), 0.0, s2.to_vec());
    }
    let pos: Vec<f64> = ok.iter().map(|i| s2[*i]).filter(|x| *x > 0.0).collect();
    let m = median(&pos).unwrap_or(1.0);
    let floor = 1.0e-5 * m;

    let h = 0.5 * d;
    let shift = digamma(h) - h.ln();
    let x: Vec<f64> = ok.iter().map(|i| covariate[*i]).collect();
    let e: Vec<f64> = ok.iter().map(|i| s2[*i].max(floor).ln() - shift).collect();
    let robust_its = if robust { 3 } else { 0 };
    let (emean, wts) = match Loess::new(0.5, 1, robust_its).fit(&x, &e, None) {
        Some(fit) => (fit.fitted().to_vec(), fit.robustness().to_vec()),
        None => {
            let mean = e.iter().sum::<f64>() / n;
            (vec![mean; ok.len()], vec![1.0; ok.len()])
        }
    };
    let global_mean = emean.iter().sum::<f64>() / n;
    let sw: f64 = wts.iter().sum();
    let ss: f64 = e
        .iter()
        .zip(emean.iter())
        .zip(wts.iter())
        .map(|((a, b), w)| w * (a - b) * (a - b))
        .sum();
    let edf = 4f64.min(n - 1.0);
    let evar = if sw > 0.0 {
        ss / sw * n / (n - edf) - trigamma(h)
    } else {
        0.0
    };

    // Trend value at every window (global mean where the covariate is missing)
    let mut trend = vec![global_mean; s2.len()];
    for (k, i) in ok.iter().enumerate() {
        trend[*i] = emean[k]
    }
    let (df0, prior): (f64, Vec<f64>) = match trigamma_inverse(evar) {
        Ok(t) if evar > 0.0 => {
            let df0 = 2.0 * t;
            let c = digamma(0.5 * df0) - (0.5 * df0).ln();
            (df0, trend.iter().map(|t| (t + c).exp()).collect())
        }
        _ => (f64::INFINITY, trend.iter().map(|t| t.exp()).collect()),
    };
    let post = s2
        .iter()
        .zip(prior.iter())
        .map(|(s, p)| {
            if df0.is_infinite() {
                if s.is_finite() {
                    *p
                } else {
                    f64::NAN
                }
            } else {
                (d * s + df0 * p) / (d + df0)
            }
        })
        .collect();
    debug!("Quasi-likelihood prior df: {:.3}", df0);
    (prior, df0, post)
}

/// Estimate common, trended and quasi-likelihood dispersions
pub fn estimate_dispersion(
    counts: &CountMatrix,
    norm: &Normalization,
    design: &DesignMatrix,
    abundance: &[f64],
    opts: &DispersionOptions,
    threads: usize,
) -> Result<DispersionEstimate> {
    opts.check()?;
    let n = counts.n_windows();
    if design.n_libs() != counts.n_libs() || abundance.len() != n {
        return Err(CoreError::Dimension(format!(
            "Design for {} libraries and {} abundances for a {} x {} count matrix",
            design.n_libs(),
            abundance.len(),
            n,
            counts.n_libs()
        )));
    }
    if let Some(phi) = opts.fixed {
        info!("Using fixed dispersion {}", phi);
        return Ok(DispersionEstimate {
            common: phi,
            trended: vec![phi; n],
            ql: None,
        });
    }
    let df = design.residual_df();
    if df == 0 {
        return Err(CoreError::DispersionUndefined { residual_df: df });
    }
    if n == 0 {
        return Err(CoreError::Config(
            "No windows available for dispersion estimation".to_string(),
        ));
    }
    info!("Estimating dispersions for {} windows", n);
    let data = window_data(counts, norm);
    let all: Vec<usize> = (0..n).collect();
    let common = common_dispersion(&data, &all, design, threads)?;
    info!("Common dispersion: {:.5}", common);

    let trended = trended_dispersion(&data, design, abundance, common, opts, threads)?;

    // Quasi-likelihood dispersions from fits at the trended dispersion
    let chunks: Vec<Vec<usize>> = all.chunks(CHUNK_SIZE).map(|c| c.to_vec()).collect();
    let d = df as f64;
    let raw: Vec<f64> = parallel_map(chunks, threads, |c| {
        Ok(c.into_iter()
            .map(|i| {
                fit_nb_glm(&data[i].y, &data[i].offset, design, trended[i])
                    .map(|f| f.deviance.max(0.0) / d)
                    .unwrap_or(f64::NAN)
            })
            .collect::<Vec<_>>())
    })?
    .into_iter()
    .flatten()
    .collect();
    let n_fail = raw.iter().filter(|x| x.is_nan()).count();
    if n_fail > 0 {
        warn!("GLM fit failed for {} windows", n_fail)
    }
    let (prior, df_prior, shrunk) = squeeze_var(&raw, d, abundance, opts.robust);
    Ok(DispersionEstimate {
        common,
        trended,
        ql: Some(QlDispersion {
            raw,
            prior,
            shrunk,
            df_residual: d,
            df_prior,
        }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interval::{Contig, GenomicInterval, Strand};
    use crate::normalize::NormFactors;
    use assert_approx_eq::assert_approx_eq;
    use std::sync::Arc;

    // Rows with group means m and replicate multipliers (1 - s, 1, 1 + s)
    fn matrix(spread: f64, n: usize) -> CountMatrix {
        let c: Contig = Arc::from("chr1");
        let mut windows = Vec::new();
        let mut counts = Vec::new();
        for k in 0..n {
            let m = 20.0 + (k % 13) as f64 * 5.0;
            windows.push(
                GenomicInterval::new(&c, k * 50 + 1, k * 50 + 10, Strand::Unstranded).unwrap(),
            );
            for f in [1.0 - spread, 1.0, 1.0 + spread, 1.0 + spread, 1.0, 1.0 - spread] {
                counts.push((m * f).round() as u32)
            }
        }
        CountMatrix::new(windows, counts, vec![1_000_000; 6], 10).unwrap()
    }

    fn setup(spread: f64, n: usize) -> (CountMatrix, Normalization, DesignMatrix, Vec<f64>) {
        let m = matrix(spread, n);
        let norm = Normalization::Factors {
            factors: NormFactors::unit(6),
            lib_sizes: m.lib_sizes().to_vec(),
        };
        let d = DesignMatrix::from_groups(&["A", "A", "A", "B", "B", "B"]).unwrap();
        let ab = crate::abundance::ave_log_cpm(&m, 2.0);
        (m, norm, d, ab)
    }

    #[test]
    fn common_dispersion_tracks_spread() {
        let opts = DispersionOptions::default();
        let (m, norm, d, ab) = setup(0.1, 40);
        let low = estimate_dispersion(&m, &norm, &d, &ab, &opts, 2).unwrap();
        let (m, norm, d, ab) = setup(0.5, 40);
        let high = estimate_dispersion(&m, &norm, &d, &ab, &opts, 2).unwrap();
        assert!(high.common() > low.common());
        assert!(high.common() > 0.05);
        assert_eq!(high.trended().len(), 40);
        let ql = high.ql().unwrap();
        assert_eq!(ql.raw().len(), 40);
        assert_eq!(ql.df_residual(), 4.0);
        assert!(ql.shrunk().iter().all(|x| x.is_finite() && *x > 0.0));
    }

    #[test]
    fn trend_is_fitted_with_enough_windows() {
        let (m, norm, d, ab) = setup(0.3, 200);
        let est =
            estimate_dispersion(&m, &norm, &d, &ab, &DispersionOptions::default(), 4).unwrap();
        assert!(est
            .trended()
            .iter()
            .all(|x| (MIN_DISPERSION..=MAX_DISPERSION).contains(x)));
    }

    #[test]
    fn no_replication_is_undefined() {
        let c: Contig = Arc::from("chr1");
        let w = vec![GenomicInterval::new(&c, 1, 10, Strand::Unstranded).unwrap()];
        let m = CountMatrix::new(w, vec![10, 20], vec![1000, 1000], 10).unwrap();
        let norm = Normalization::Factors {
            factors: NormFactors::unit(2),
            lib_sizes: vec![1000, 1000],
        };
        let d = DesignMatrix::from_groups(&["A", "B"]).unwrap();
        let r = estimate_dispersion(&m, &norm, &d, &[5.0], &DispersionOptions::default(), 1);
        assert!(matches!(r, Err(CoreError::DispersionUndefined { residual_df: 0 })));

        let opts = DispersionOptions {
            fixed: Some(0.05),
            ..Default::default()
        };
        let est = estimate_dispersion(&m, &norm, &d, &[5.0], &opts, 1).unwrap();
        assert!(est.ql().is_none());
        assert_eq!(est.trended(), &[0.05]);
    }

    #[test]
    fn constant_variances_give_infinite_prior_df() {
        let s2 = vec![2.0; 50];
        let cov: Vec<f64> = (0..50).map(|i| i as f64).collect();
        let (prior, df0, post) = squeeze_var(&s2, 4.0, &cov, false);
        assert!(df0.is_infinite());
        let expect = 2.0 * (2f64.ln() - digamma(2.0)).exp();
        assert_approx_eq!(prior[10], expect, 1e-8);
        assert_approx_eq!(post[10], expect, 1e-8);
    }

    #[test]
    fn variable_variances_are_shrunk() {
        let s2: Vec<f64> = (0..200)
            .map(|i| 0.2 + 4.0 * ((i * 7919 % 101) as f64 / 101.0).powi(3))
            .collect();
        let cov: Vec<f64> = (0..200).map(|i| (i % 17) as f64).collect();
        let (prior, df0, post) = squeeze_var(&s2, 3.0, &cov, true);
        assert!(df0.is_finite() && df0 > 0.0);
        for i in 0..200 {
            let (lo, hi) = if s2[i] < prior[i] { (s2[i], prior[i]) } else { (prior[i], s2[i]) };
            assert!(post[i] >= lo - 1e-12 && post[i] <= hi + 1e-12);
        }
        // Failed windows stay failed
        let mut s2b = s2.clone();
        s2b[5] = f64::NAN;
        let (_, _, post) = squeeze_var(&s2b, 3.0, &cov, false);
        assert!(post[5].is_nan());
    }

    #[test]
    fn robust_prior_ignores_extreme_windows() {
        // Log variances spread evenly over [-1, 1] with six extreme windows in the middle
        let cov: Vec<f64> = (0..206).map(|i| i as f64).collect();
        let mut s2: Vec<f64> = (0..206)
            .map(|i| (((i * 37) % 101) as f64 / 50.0 - 1.0).exp())
            .collect();
        for x in s2[100..106].iter_mut() {
            *x = 15f64.exp()
        }
        let (plain, df_plain, _) = squeeze_var(&s2, 20.0, &cov, false);
        let (robust, df_robust, _) = squeeze_var(&s2, 20.0, &cov, true);
        assert!(df_plain.is_finite() && df_robust.is_finite());
        assert!(df_robust > 5.0 * df_plain);
        // Trend at the extreme windows relative to a quiet stretch
        let bump = |p: &[f64]| (p[103] / p[40]).ln();
        assert!(bump(&plain) > 1.0);
        assert!(bump(&robust).abs() < 0.2);
        assert!(robust[103] < plain[103]);
    }
}
