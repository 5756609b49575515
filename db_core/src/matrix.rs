use std::collections::HashMap;

use crate::{
    interval::{Contig, GenomicInterval},
    linalg::SymMatrix,
    CoreError, Result,
};

/// CountMatrix
///
/// windows - row intervals in genomic order (grouped by contig)
/// counts - row major matrix of fragment counts (n_windows x n_libs)
/// lib_sizes - total fragments counted per library
/// width - nominal width of the windows (before clipping at contig ends)
///
/// Filtering produces a new matrix; row order is never changed.
///
#[derive(Debug, Clone)]
pub struct CountMatrix {
    windows: Vec<GenomicInterval>,
    counts: Vec<u32>,
    lib_sizes: Vec<u64>,
    width: usize,
}

impl CountMatrix {
    pub fn new(
        windows: Vec<GenomicInterval>,
        counts: Vec<u32>,
        lib_sizes: Vec<u64>,
        width: usize,
    ) -> Result<Self> {
        if counts.len() != windows.len() * lib_sizes.len() {
            Err(CoreError::Dimension(format!(
                "{} counts for {} windows and {} libraries",
                counts.len(),
                windows.len(),
                lib_sizes.len()
            )))
        } else {
            Ok(Self {
                windows,
                counts,
                lib_sizes,
                width,
            })
        }
    }

    pub fn n_windows(&self) -> usize {
        self.windows.len()
    }

    pub fn n_libs(&self) -> usize {
        self.lib_sizes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    pub fn windows(&self) -> &[GenomicInterval] {
        &self.windows
    }

    pub fn window(&self, i: usize) -> &GenomicInterval {
        &self.windows[i]
    }

    pub fn row(&self, i: usize) -> &[u32] {
        let n = self.n_libs();
        &self.counts[i * n..(i + 1) * n]
    }

    pub fn rows(&self) -> impl Iterator<Item = &[u32]> {
        // chunks() panics on 0
        self.counts.chunks(self.n_libs().max(1))
    }

    pub fn count(&self, i: usize, j: usize) -> u32 {
        self.counts[i * self.n_libs() + j]
    }

    pub fn lib_sizes(&self) -> &[u64] {
        &self.lib_sizes
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn row_total(&self, i: usize) -> u64 {
        self.row(i).iter().map(|c| *c as u64).sum()
    }

    pub fn col_sums(&self) -> Vec<u64> {
        let mut s = vec![0; self.n_libs()];
        for r in self.rows() {
            for (t, c) in s.iter_mut().zip(r) {
                *t += *c as u64
            }
        }
        s
    }

    /// New matrix keeping rows where keep is true
    pub fn subset(&self, keep: &[bool]) -> Result<Self> {
        if keep.len() != self.n_windows() {
            return Err(CoreError::Dimension(format!(
                "Mask of length {} for {} windows",
                keep.len(),
                self.n_windows()
            )));
        }
        let n = self.n_libs();
        let mut windows = Vec::new();
        let mut counts = Vec::new();
        for (i, _) in keep.iter().enumerate().filter(|(_, k)| **k) {
            windows.push(self.windows[i].clone());
            counts.extend_from_slice(&self.counts[i * n..(i + 1) * n]);
        }
        Self::new(windows, counts, self.lib_sizes.clone(), self.width)
    }

    /// Combine two matrices over the same libraries (e.g., forward and reverse strand windows)
    /// into one matrix in genomic order.  ctg_order gives the rank of each contig.
    pub fn stack(&self, other: &Self, ctg_order: &HashMap<Contig, usize>) -> Result<Self> {
        if self.n_libs() != other.n_libs() {
            return Err(CoreError::Dimension(format!(
                "Cannot stack matrices with {} and {} libraries",
                self.n_libs(),
                other.n_libs()
            )));
        }
        let key = |w: &GenomicInterval| {
            (
                ctg_order.get(w.ctg()).copied().unwrap_or(usize::MAX),
                w.start(),
                w.strand(),
            )
        };
        let mut windows = Vec::with_capacity(self.n_windows() + other.n_windows());
        let mut counts = Vec::with_capacity(self.counts.len() + other.counts.len());
        let (mut i, mut j) = (0, 0);
        while i < self.n_windows() || j < other.n_windows() {
            let take_self = j >= other.n_windows()
                || (i < self.n_windows() && key(&self.windows[i]) <= key(&other.windows[j]));
            if take_self {
                windows.push(self.windows[i].clone());
                counts.extend_from_slice(self.row(i));
                i += 1;
            } else {
                windows.push(other.windows[j].clone());
                counts.extend_from_slice(other.row(j));
                j += 1;
            }
        }
        let lib_sizes = self
            .lib_sizes
            .iter()
            .zip(other.lib_sizes.iter())
            .map(|(a, b)| a + b)
            .collect();
        Self::new(windows, counts, lib_sizes, self.width)
    }
}

/// DesignMatrix
///
/// Row major n_libs x n_coef matrix relating libraries to model coefficients
///
#[derive(Debug, Clone)]
pub struct DesignMatrix {
    data: Vec<f64>,
    n_libs: usize,
    n_coef: usize,
    coef_names: Vec<String>,
}

impl DesignMatrix {
    pub fn new(data: Vec<f64>, n_libs: usize, coef_names: Vec<String>) -> Result<Self> {
        let n_coef = coef_names.len();
        if n_coef == 0 || data.len() != n_libs * n_coef {
            return Err(CoreError::Dimension(format!(
                "Design matrix with {} entries for {} libraries and {} coefficients",
                data.len(),
                n_libs,
                n_coef
            )));
        }
        let d = Self {
            data,
            n_libs,
            n_coef,
            coef_names,
        };
        d.check_rank()?;
        Ok(d)
    }

    /// One column per group (no intercept).  Groups are ordered by first appearance.
    pub fn from_groups<S: AsRef<str>>(groups: &[S]) -> Result<Self> {
        let mut names: Vec<String> = Vec::new();
        for g in groups {
            if !names.iter().any(|n| n == g.as_ref()) {
                names.push(g.as_ref().to_owned())
            }
        }
        let p = names.len();
        let mut data = vec![0.0; groups.len() * p];
        for (i, g) in groups.iter().enumerate() {
            if let Some(k) = names.iter().position(|n| n == g.as_ref()) {
                data[i * p + k] = 1.0;
            }
        }
        Self::new(data, groups.len(), names)
    }

    /// Contrast vector for the difference num - den between two group coefficients
    pub fn group_contrast(&self, num: &str, den: &str) -> Result<Vec<f64>> {
        let find = |s: &str| {
            self.coef_names
                .iter()
                .position(|n| n == s)
                .ok_or_else(|| CoreError::Config(format!("Unknown group {} in contrast", s)))
        };
        let (a, b) = (find(num)?, find(den)?);
        if a == b {
            return Err(CoreError::Config(format!(
                "Contrast groups must differ ({})",
                num
            )));
        }
        let mut c = vec![0.0; self.n_coef];
        c[a] = 1.0;
        c[b] = -1.0;
        Ok(c)
    }

    fn check_rank(&self) -> Result<()> {
        let mut xtx = SymMatrix::zeros(self.n_coef);
        for i in 0..self.n_libs {
            xtx.add_outer(self.row(i), 1.0);
        }
        if xtx.cholesky().is_none() {
            Err(CoreError::Config(
                "Design matrix is not of full column rank".to_string(),
            ))
        } else {
            Ok(())
        }
    }

    pub fn n_libs(&self) -> usize {
        self.n_libs
    }

    pub fn n_coef(&self) -> usize {
        self.n_coef
    }

    pub fn coef_names(&self) -> &[String] {
        &self.coef_names
    }

    pub fn row(&self, i: usize) -> &[f64] {
        &self.data[i * self.n_coef..(i + 1) * self.n_coef]
    }

    pub fn residual_df(&self) -> usize {
        self.n_libs.saturating_sub(self.n_coef)
    }

    /// X * b for a coefficient vector b
    pub fn linear_predictor(&self, b: &[f64]) -> Vec<f64> {
        (0..self.n_libs)
            .map(|i| self.row(i).iter().zip(b).map(|(x, y)| x * y).sum())
            .collect()
    }

    /// Rotate the design so that the (normalized) contrast becomes the first coefficient.
    /// Returns the rotated full design and the null design with that coefficient removed.
    /// The rotation is a Householder reflection H with H c / |c| = e1.
    pub fn reparametrize(&self, contrast: &[f64]) -> Result<(Self, Self)> {
        let p = self.n_coef;
        if contrast.len() != p {
            return Err(CoreError::Config(format!(
                "Contrast of length {} for design with {} coefficients",
                contrast.len(),
                p
            )));
        }
        let norm = contrast.iter().map(|x| x * x).sum::<f64>().sqrt();
        if norm == 0.0 {
            return Err(CoreError::Config("Contrast is all zero".to_string()));
        }
        let mut v: Vec<f64> = contrast.iter().map(|x| x / norm).collect();
        v[0] -= 1.0;
        let vv: f64 = v.iter().map(|x| x * x).sum();
        // H[j][k] = delta(j,k) - 2 v_j v_k / v'v
        let h = |j: usize, k: usize| {
            let d = if j == k { 1.0 } else { 0.0 };
            if vv < 1.0e-24 {
                d
            } else {
                d - 2.0 * v[j] * v[k] / vv
            }
        };
        let mut full = vec![0.0; self.n_libs * p];
        for i in 0..self.n_libs {
            let x = self.row(i);
            for k in 0..p {
                full[i * p + k] = (0..p).map(|j| x[j] * h(j, k)).sum();
            }
        }
        let mut null = Vec::with_capacity(self.n_libs * (p - 1));
        for i in 0..self.n_libs {
            null.extend_from_slice(&full[i * p + 1..(i + 1) * p]);
        }
        let mut names = vec!["contrast".to_string()];
        names.extend((1..p).map(|k| format!("rot{}", k)));
        let null_names = names[1..].to_vec();
        let full = Self {
            data: full,
            n_libs: self.n_libs,
            n_coef: p,
            coef_names: names,
        };
        let null = Self {
            data: null,
            n_libs: self.n_libs,
            n_coef: p - 1,
            coef_names: null_names,
        };
        Ok((full, null))
    }
}
