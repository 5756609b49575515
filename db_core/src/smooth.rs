//! Local regression smoothing (loess)
//!
//! Weighted local polynomial fits (degree 1 or 2) with a tricube kernel over the
//! nearest `span` fraction of the points.  Fits are made at a set of anchor points
//! and linearly interpolated in between.  Optional robustness iterations down-weight
//! points with large residuals using bisquare weights.

use utils::median;

use crate::linalg::SymMatrix;

// Maximum number of distinct locations where local fits are computed
const MAX_ANCHORS: usize = 200;
// Smallest residual scale for robustness weights, relative to the mean absolute y
const MIN_SCALE: f64 = 1.0e-7;

#[derive(Debug, Clone, Copy)]
pub struct Loess {
    span: f64,
    degree: usize,
    robust_iterations: usize,
}

impl Default for Loess {
    fn default() -> Self {
        Self {
            span: 0.5,
            degree: 1,
            robust_iterations: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoessFit {
    // (x, fitted y) sorted on x
    anchors: Vec<(f64, f64)>,
    fitted: Vec<f64>,
    robustness: Vec<f64>,
}

impl LoessFit {
    /// Prediction at x by linear interpolation between anchors.
    /// Values outside the range of the anchors take the nearest end value.
    pub fn predict(&self, x: f64) -> f64 {
        let a = &self.anchors;
        if x.is_nan() {
            return f64::NAN;
        }
        let i = a.partition_point(|(ax, _)| *ax < x);
        if i == 0 {
            a[0].1
        } else if i == a.len() {
            a[i - 1].1
        } else {
            let (x0, y0) = a[i - 1];
            let (x1, y1) = a[i];
            if x1 > x0 {
                y0 + (y1 - y0) * (x - x0) / (x1 - x0)
            } else {
                y1
            }
        }
    }

    /// Fitted values at the input points
    pub fn fitted(&self) -> &[f64] {
        &self.fitted
    }

    /// Final robustness weights (all 1 if no robustness iterations were requested)
    pub fn robustness(&self) -> &[f64] {
        &self.robustness
    }
}

// Tricube kernel; d is the scaled distance in [0, 1]
fn tricube(d: f64) -> f64 {
    if d >= 1.0 {
        0.0
    } else {
        let z = 1.0 - d * d * d;
        z * z * z
    }
}

fn bisquare(u: f64) -> f64 {
    if u.abs() >= 1.0 {
        0.0
    } else {
        let z = 1.0 - u * u;
        z * z
    }
}

impl Loess {
    pub fn new(span: f64, degree: usize, robust_iterations: usize) -> Self {
        Self {
            span: span.clamp(0.01, 1.0),
            degree: degree.clamp(0, 2),
            robust_iterations,
        }
    }

    /// Fit y against x with optional prior weights.  Points with non-finite x or y
    /// are ignored in the fit (their fitted values are still predicted).
    /// Returns None if there are no usable points or the input lengths differ.
    pub fn fit(&self, x: &[f64], y: &[f64], w: Option<&[f64]>) -> Option<LoessFit> {
        if x.len() != y.len() || w.map(|w| w.len() != x.len()).unwrap_or(false) {
            return None;
        }
        let prior = |i: usize| w.map(|w| w[i]).unwrap_or(1.0);
        let mut ix: Vec<usize> = (0..x.len())
            .filter(|i| x[*i].is_finite() && y[*i].is_finite() && prior(*i) > 0.0)
            .collect();
        if ix.is_empty() {
            return None;
        }
        ix.sort_unstable_by(|a, b| x[*a].total_cmp(&x[*b]));

        // Floor for the residual scale
        let min_scale = MIN_SCALE * ix.iter().map(|i| y[*i].abs()).sum::<f64>() / ix.len() as f64;

        let mut robustness = vec![1.0; x.len()];
        let mut fit = self.fit_anchors(x, y, &ix, |i| prior(i) * robustness[i]);
        for it in 0..self.robust_iterations {
            let res: Vec<f64> = ix.iter().map(|i| y[*i] - fit.predict(x[*i])).collect();
            let abs_res: Vec<f64> = res.iter().map(|r| r.abs()).collect();
            let s = median(&abs_res).unwrap_or(0.0).max(min_scale);
            if s <= 0.0 {
                break;
            }
            trace!("Robustness iteration {}: residual scale {}", it + 1, s);
            let c = 6.0 * s;
            for (i, r) in ix.iter().zip(res.iter()) {
                robustness[*i] = if r.abs() <= 1.0e-3 * c {
                    1.0
                } else {
                    bisquare(r / c)
                };
            }
            fit = self.fit_anchors(x, y, &ix, |i| prior(i) * robustness[i]);
        }
        let fitted = x.iter().map(|xi| fit.predict(*xi)).collect();
        Some(LoessFit {
            anchors: fit.anchors,
            fitted,
            robustness,
        })
    }

    fn fit_anchors<W: Fn(usize) -> f64>(
        &self,
        x: &[f64],
        y: &[f64],
        ix: &[usize],
        weight: W,
    ) -> LoessFit {
        let n = ix.len();
        let k = ((self.span * n as f64).ceil() as usize).clamp(1, n);

        // Select anchor positions (in sorted order)
        let mut pos: Vec<usize> = if n <= MAX_ANCHORS {
            (0..n).collect()
        } else {
            (0..MAX_ANCHORS)
                .map(|j| j * (n - 1) / (MAX_ANCHORS - 1))
                .collect()
        };
        pos.dedup_by(|a, b| x[ix[*a]] == x[ix[*b]]);

        // Global weighted mean as a fallback for degenerate neighbourhoods
        let (sw, swy) = ix.iter().fold((0.0, 0.0), |(s, t), i| {
            let w = weight(*i);
            (s + w, t + w * y[*i])
        });
        let global = if sw > 0.0 { swy / sw } else { 0.0 };

        let anchors = pos
            .iter()
            .map(|r| {
                let x0 = x[ix[*r]];
                let (left, right) = nearest_window(x, ix, *r, k);
                let d = (x0 - x[ix[left]]).max(x[ix[right]] - x0) * 1.0001;
                (x0, self.local_fit(x, y, &ix[left..=right], x0, d, &weight).unwrap_or(global))
            })
            .collect();
        LoessFit {
            anchors,
            fitted: Vec::new(),
            robustness: Vec::new(),
        }
    }

    // Weighted polynomial fit around x0 with bandwidth d.  Returns the fitted value at x0.
    fn local_fit<W: Fn(usize) -> f64>(
        &self,
        x: &[f64],
        y: &[f64],
        ix: &[usize],
        x0: f64,
        d: f64,
        weight: &W,
    ) -> Option<f64> {
        let p = self.degree + 1;
        let mut xwx = SymMatrix::zeros(p);
        let mut xwy = vec![0.0; p];
        let mut sw = 0.0;
        let mut swy = 0.0;
        let mut basis = vec![1.0; p];
        for i in ix {
            let u = if d > 0.0 { (x[*i] - x0) / d } else { 0.0 };
            let w = weight(*i) * tricube(u.abs());
            if w <= 0.0 {
                continue;
            }
            for j in 1..p {
                basis[j] = basis[j - 1] * u;
            }
            xwx.add_outer(&basis, w);
            for (a, b) in xwy.iter_mut().zip(basis.iter()) {
                *a += w * b * y[*i];
            }
            sw += w;
            swy += w * y[*i];
        }
        if sw <= 0.0 {
            None
        } else if d <= 0.0 {
            Some(swy / sw)
        } else {
            match xwx.cholesky() {
                Some(c) => Some(c.solve(&xwy)[0]),
                None => Some(swy / sw),
            }
        }
    }
}

// Find the k points nearest (in x) to the point at sorted position r.
// Returns the inclusive range [left, right] of sorted positions.
fn nearest_window(x: &[f64], ix: &[usize], r: usize, k: usize) -> (usize, usize) {
    let n = ix.len();
    let x0 = x[ix[r]];
    let (mut left, mut right) = (r, r);
    while right + 1 - left < k {
        if left == 0 {
            right += 1
        } else if right == n - 1 {
            left -= 1
        } else if x0 - x[ix[left - 1]] <= x[ix[right + 1]] - x0 {
            left -= 1
        } else {
            right += 1
        }
    }
    (left, right)
}
