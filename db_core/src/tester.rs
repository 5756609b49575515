//! Per window differential tests
//!
//! The design is rotated so that the contrast is the first coefficient, and the null
//! model is the rotated design without it.  The likelihood ratio between the two fits
//! gives a quasi-likelihood F test when squeezed QL dispersions are available, or a
//! chi-squared likelihood ratio test when the dispersion was fixed.

use std::f64::consts::LN_2;

use utils::{pchisq_upper, pf_upper};

use crate::{
    dispersion::DispersionEstimate,
    glm::fit_nb_glm,
    matrix::{CountMatrix, DesignMatrix},
    normalize::Normalization,
    pool::parallel_map,
    CoreError, Result,
};

const LOGFC_PRIOR: f64 = 0.125;
const CHUNK_SIZE: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestMethod {
    QuasiF,
    LikelihoodRatio,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TestResult {
    /// log2 fold change for the contrast
    pub log_fc: f64,
    /// Average log2 CPM
    pub log_cpm: f64,
    /// F statistic (QL) or likelihood ratio (LRT)
    pub statistic: f64,
    pub p_value: f64,
}

#[derive(Debug, Clone)]
pub struct WindowTests {
    method: TestMethod,
    results: Vec<Option<TestResult>>,
}

impl WindowTests {
    pub fn method(&self) -> TestMethod {
        self.method
    }

    /// One entry per window; None where the fit failed
    pub fn results(&self) -> &[Option<TestResult>] {
        &self.results
    }

    pub fn n_failed(&self) -> usize {
        self.results.iter().filter(|r| r.is_none()).count()
    }
}

// log2 fold change from a fit with a small prior count added to every library
fn shrunk_log_fc(
    y: &[f64],
    offset: &[f64],
    design: &DesignMatrix,
    contrast: &[f64],
    phi: f64,
) -> f64 {
    let lib: Vec<f64> = offset.iter().map(|o| o.exp()).collect();
    let mean = lib.iter().sum::<f64>() / lib.len() as f64;
    let prior: Vec<f64> = lib.iter().map(|l| LOGFC_PRIOR * l / mean).collect();
    let y1: Vec<f64> = y.iter().zip(&prior).map(|(y, p)| y + p).collect();
    let o1: Vec<f64> = lib.iter().zip(&prior).map(|(l, p)| (l + 2.0 * p).ln()).collect();
    match fit_nb_glm(&y1, &o1, design, phi) {
        Some(f) => f.beta.iter().zip(contrast).map(|(b, c)| b * c).sum::<f64>() / LN_2,
        None => f64::NAN,
    }
}

/// Test the contrast for every window of counts
pub fn test_contrast(
    counts: &CountMatrix,
    norm: &Normalization,
    design: &DesignMatrix,
    contrast: &[f64],
    disp: &DispersionEstimate,
    abundance: &[f64],
    threads: usize,
) -> Result<WindowTests> {
    let n = counts.n_windows();
    if disp.trended().len() != n || abundance.len() != n {
        return Err(CoreError::Dimension(format!(
            "{} dispersions and {} abundances for {} windows",
            disp.trended().len(),
            abundance.len(),
            n
        )));
    }
    let (_, null) = design.reparametrize(contrast)?;
    let method = if disp.ql().is_some() {
        TestMethod::QuasiF
    } else {
        TestMethod::LikelihoodRatio
    };
    info!("Testing {} windows ({:?})", n, method);
    let df_total = disp.ql().map(|q| q.df_total());

    let test_window = |i: usize| -> Option<TestResult> {
        let y: Vec<f64> = counts.row(i).iter().map(|c| *c as f64).collect();
        let offset = norm.log_offsets(i);
        let phi = disp.trended()[i];
        let full = fit_nb_glm(&y, &offset, design, phi)?;
        let reduced = fit_nb_glm(&y, &offset, &null, phi)?;
        let lr = (reduced.deviance - full.deviance).max(0.0);
        let (statistic, p_value) = match (disp.ql(), df_total) {
            (Some(ql), Some(df)) => {
                let s2 = ql.shrunk()[i];
                if !(s2.is_finite() && s2 > 0.0) {
                    return None;
                }
                let f = lr / s2;
                (f, pf_upper(f, 1.0, df).ok()?)
            }
            _ => (lr, pchisq_upper(lr, 1.0).ok()?),
        };
        Some(TestResult {
            log_fc: shrunk_log_fc(&y, &offset, design, contrast, phi),
            log_cpm: abundance[i],
            statistic,
            p_value,
        })
    };

    let chunks: Vec<Vec<usize>> = (0..n)
        .collect::<Vec<_>>()
        .chunks(CHUNK_SIZE)
        .map(|c| c.to_vec())
        .collect();
    let results: Vec<Option<TestResult>> = parallel_map(chunks, threads, |c| {
        Ok(c.into_iter().map(&test_window).collect::<Vec<_>>())
    })?
    .into_iter()
    .flatten()
    .collect();

    let tests = WindowTests { method, results };
    if tests.n_failed() > 0 {
        warn!("Tests failed for {} of {} windows", tests.n_failed(), n)
    }
    Ok(tests)
}
