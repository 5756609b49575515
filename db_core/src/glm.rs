//! Negative binomial GLM with log link
//!
//! Coefficients are found by Fisher scoring with Levenberg damping: the damping
//! term is increased until the step lowers the deviance, and relaxed again after a
//! successful step.  A dispersion below `POISSON_LIMIT` is treated as Poisson.

use utils::ln_gamma;

use crate::{linalg::SymMatrix, matrix::DesignMatrix};

const MAX_ITER: usize = 50;
const TOL: f64 = 1.0e-8;
const POISSON_LIMIT: f64 = 1.0e-8;

#[derive(Debug, Clone)]
pub struct GlmFit {
    pub beta: Vec<f64>,
    pub mu: Vec<f64>,
    pub deviance: f64,
    pub iterations: usize,
    pub converged: bool,
}

/// Deviance contribution of a single observation
pub fn unit_deviance(y: f64, mu: f64, phi: f64) -> f64 {
    if phi < POISSON_LIMIT {
        if y > 0.0 {
            2.0 * (y * (y / mu).ln() - (y - mu))
        } else {
            2.0 * mu
        }
    } else if y > 0.0 {
        let r = 1.0 / phi;
        2.0 * (y * (y / mu).ln() - (y + r) * ((phi * y).ln_1p() - (phi * mu).ln_1p()))
    } else {
        2.0 * (phi * mu).ln_1p() / phi
    }
}

pub fn nb_deviance(y: &[f64], mu: &[f64], phi: f64) -> f64 {
    y.iter().zip(mu).map(|(y, m)| unit_deviance(*y, *m, phi)).sum()
}

/// Negative binomial log likelihood (mean mu, variance mu + phi mu^2)
pub fn nb_loglik(y: &[f64], mu: &[f64], phi: f64) -> f64 {
    y.iter()
        .zip(mu)
        .map(|(y, m)| {
            let (y, m) = (*y, *m);
            if phi < POISSON_LIMIT {
                if y > 0.0 {
                    y * m.ln() - m - ln_gamma(y + 1.0)
                } else {
                    -m
                }
            } else {
                let r = 1.0 / phi;
                let t = -(phi * m).ln_1p() * r;
                if y > 0.0 {
                    ln_gamma(y + r) - ln_gamma(r) - ln_gamma(y + 1.0) + y * (m / (r + m)).ln() + t
                } else {
                    t
                }
            }
        })
        .sum()
}

fn fitted(design: &DesignMatrix, beta: &[f64], offset: &[f64]) -> Vec<f64> {
    design
        .linear_predictor(beta)
        .into_iter()
        .zip(offset)
        .map(|(e, o)| (e + o).exp())
        .collect()
}

// Least squares fit of log(y + 0.5) - offset as starting values
fn start_values(y: &[f64], offset: &[f64], design: &DesignMatrix) -> Option<Vec<f64>> {
    let p = design.n_coef();
    let mut xtx = SymMatrix::zeros(p);
    let mut xtz = vec![0.0; p];
    for (i, (yi, oi)) in y.iter().zip(offset).enumerate() {
        let x = design.row(i);
        let z = (yi + 0.5).ln() - oi;
        xtx.add_outer(x, 1.0);
        for (a, b) in xtz.iter_mut().zip(x) {
            *a += b * z
        }
    }
    xtx.cholesky().map(|c| c.solve(&xtz))
}

/// Fit a single row of counts.  Returns None if the fit cannot be started or the
/// results are not finite.
pub fn fit_nb_glm(y: &[f64], offset: &[f64], design: &DesignMatrix, phi: f64) -> Option<GlmFit> {
    let n = y.len();
    let p = design.n_coef();
    if n != design.n_libs() || offset.len() != n {
        return None;
    }
    if y.iter().all(|x| *x <= 0.0) {
        return Some(GlmFit {
            beta: vec![f64::NEG_INFINITY; p],
            mu: vec![0.0; n],
            deviance: 0.0,
            iterations: 0,
            converged: true,
        });
    }
    let mut beta = start_values(y, offset, design)?;
    let mut mu = fitted(design, &beta, offset);
    let mut dev = nb_deviance(y, &mu, phi);
    let mut lambda = 0.0;
    let mut converged = false;
    let mut iterations = 0;
    while iterations < MAX_ITER {
        iterations += 1;
        let mut xtwx = SymMatrix::zeros(p);
        let mut score = vec![0.0; p];
        for i in 0..n {
            let x = design.row(i);
            let denom = 1.0 + phi * mu[i];
            xtwx.add_outer(x, mu[i] / denom);
            let r = (y[i] - mu[i]) / denom;
            for (s, xk) in score.iter_mut().zip(x) {
                *s += xk * r
            }
        }
        if lambda == 0.0 {
            lambda = 1.0e-6 * xtwx.max_diag().max(1.0e-10);
        }
        // Increase damping until the deviance does not increase
        let mut accepted = None;
        while lambda < 1.0e12 {
            let mut a = xtwx.clone();
            a.add_diag(lambda);
            if let Some(c) = a.cholesky() {
                let step = c.solve(&score);
                let b: Vec<f64> = beta.iter().zip(&step).map(|(b, s)| b + s).collect();
                let m = fitted(design, &b, offset);
                let d = nb_deviance(y, &m, phi);
                if d.is_finite() && d <= dev {
                    accepted = Some((b, m, d));
                    break;
                }
            }
            lambda *= 2.0;
        }
        match accepted {
            Some((b, m, d)) => {
                let change = dev - d;
                beta = b;
                mu = m;
                dev = d;
                lambda = (lambda / 10.0).max(1.0e-12);
                if change / (dev + 0.1) < TOL {
                    converged = true;
                    break;
                }
            }
            None => {
                // No improving step: already at the minimum to working precision
                converged = true;
                break;
            }
        }
    }
    if !dev.is_finite() || beta.iter().any(|b| b.is_nan()) {
        return None;
    }
    if !converged {
        trace!("GLM fit did not converge after {} iterations", iterations);
    }
    Some(GlmFit {
        beta,
        mu,
        deviance: dev,
        iterations,
        converged,
    })
}

/// Cox-Reid adjusted profile log likelihood for dispersion phi
pub fn adjusted_profile_loglik(
    y: &[f64],
    offset: &[f64],
    design: &DesignMatrix,
    phi: f64,
) -> Option<f64> {
    let fit = fit_nb_glm(y, offset, design, phi)?;
    let ll = nb_loglik(y, &fit.mu, phi);
    let mut xtwx = SymMatrix::zeros(design.n_coef());
    for (i, m) in fit.mu.iter().enumerate() {
        xtwx.add_outer(design.row(i), m / (1.0 + phi * m))
    }
    let ld = match xtwx.cholesky() {
        Some(c) => c.log_det(),
        None => {
            // Zero fitted values for whole groups make the information singular
            xtwx.add_diag(1.0e-6 * xtwx.max_diag().max(1.0e-6));
            xtwx.cholesky()?.log_det()
        }
    };
    let apl = ll - 0.5 * ld;
    if apl.is_finite() {
        Some(apl)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn groups() -> DesignMatrix {
        DesignMatrix::from_groups(&["A", "A", "A", "B", "B", "B"]).unwrap()
    }

    #[test]
    fn group_means_are_fitted_exactly() {
        // With one coefficient per group the MLE of each group mean is the group average
        let y = [10.0, 12.0, 14.0, 30.0, 33.0, 27.0];
        let off = [0.0; 6];
        let fit = fit_nb_glm(&y, &off, &groups(), 0.1).unwrap();
        assert!(fit.converged);
        assert_approx_eq!(fit.beta[0].exp(), 12.0, 1e-5);
        assert_approx_eq!(fit.beta[1].exp(), 30.0, 1e-5);
    }

    #[test]
    fn offsets_scale_means() {
        let y = [10.0, 20.0, 10.0, 20.0];
        let off = [0.0, 2f64.ln(), 0.0, 2f64.ln()];
        let d = DesignMatrix::new(vec![1.0; 4], 4, vec!["int".to_string()]).unwrap();
        let fit = fit_nb_glm(&y, &off, &d, 0.05).unwrap();
        assert_approx_eq!(fit.beta[0].exp(), 10.0, 1e-5);
        assert_approx_eq!(fit.deviance, 0.0, 1e-8);
    }

    #[test]
    fn poisson_limit() {
        let (y, mu): (f64, f64) = (5.0, 4.0);
        let pois: f64 = 2.0 * (y * (y / mu).ln() - (y - mu));
        assert_approx_eq!(unit_deviance(y, mu, 0.0), pois, 1e-12);
        assert_approx_eq!(unit_deviance(y, mu, 1.0e-7), pois, 1e-5);
        assert_approx_eq!(unit_deviance(0.0, mu, 0.0), 8.0, 1e-12);
        let ll = nb_loglik(&[y], &[mu], 0.0);
        assert_approx_eq!(ll, 5.0 * 4f64.ln() - 4.0 - 120f64.ln(), 1e-10);
    }

    #[test]
    fn all_zero_row_does_not_fail() {
        let fit = fit_nb_glm(&[0.0; 6], &[0.0; 6], &groups(), 0.1).unwrap();
        assert_eq!(fit.deviance, 0.0);
        let fit = fit_nb_glm(&[0.0, 0.0, 0.0, 5.0, 6.0, 7.0], &[0.0; 6], &groups(), 0.1).unwrap();
        assert!(fit.deviance.is_finite());
        assert!(fit.beta[0] < -5.0);
        assert_approx_eq!(fit.beta[1].exp(), 6.0, 1e-4);
        let y = [0.0, 0.0, 0.0, 5.0, 6.0, 7.0];
        assert!(adjusted_profile_loglik(&y, &[0.0; 6], &groups(), 0.1).is_some());
    }

    #[test]
    fn apl_prefers_true_dispersion_order() {
        // Overdispersed data should favour a larger dispersion than near-Poisson data
        let y1 = [5.0, 40.0, 12.0, 3.0, 60.0, 20.0];
        let y2 = [20.0, 21.0, 19.0, 20.0, 22.0, 18.0];
        let off = [0.0; 6];
        let d = groups();
        let best = |y: &[f64]| {
            [0.001, 0.01, 0.1, 0.5, 1.0]
                .iter()
                .map(|phi| (*phi, adjusted_profile_loglik(y, &off, &d, *phi).unwrap()))
                .fold((0.0, f64::NEG_INFINITY), |a, b| if b.1 > a.1 { b } else { a })
                .0
        };
        assert!(best(&y1) > best(&y2));
    }
}
