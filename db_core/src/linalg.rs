// Small dense symmetric systems for the per-window least squares problems.
// Only the lower triangle is stored, packed by rows: (0,0), (1,0), (1,1), (2,0), ...

#[inline]
fn ix(i: usize, j: usize) -> usize {
    debug_assert!(j <= i);
    i * (i + 1) / 2 + j
}

#[derive(Debug, Clone)]
pub struct SymMatrix {
    n: usize,
    a: Vec<f64>,
}

impl SymMatrix {
    pub fn zeros(n: usize) -> Self {
        Self {
            n,
            a: vec![0.0; n * (n + 1) / 2],
        }
    }

    pub fn dim(&self) -> usize {
        self.n
    }

    pub fn get(&self, i: usize, j: usize) -> f64 {
        if j <= i {
            self.a[ix(i, j)]
        } else {
            self.a[ix(j, i)]
        }
    }

    /// Accumulate w * x x' (lower triangle only)
    pub fn add_outer(&mut self, x: &[f64], w: f64) {
        for i in 0..self.n {
            let wx = w * x[i];
            for j in 0..=i {
                self.a[ix(i, j)] += wx * x[j];
            }
        }
    }

    pub fn add_diag(&mut self, lambda: f64) {
        for i in 0..self.n {
            self.a[ix(i, i)] += lambda
        }
    }

    pub fn max_diag(&self) -> f64 {
        (0..self.n)
            .map(|i| self.a[ix(i, i)])
            .fold(0.0, f64::max)
    }

    /// Cholesky decomposition L L'.  Returns None if the matrix is not
    /// (numerically) positive definite.
    pub fn cholesky(&self) -> Option<Cholesky> {
        let n = self.n;
        let mut l = self.a.clone();
        let tol = 1.0e-10 * self.max_diag().max(f64::MIN_POSITIVE);
        for i in 0..n {
            for j in 0..=i {
                let mut s = l[ix(i, j)];
                for k in 0..j {
                    s -= l[ix(i, k)] * l[ix(j, k)];
                }
                if i == j {
                    if s <= tol || !s.is_finite() {
                        return None;
                    }
                    l[ix(i, i)] = s.sqrt();
                } else {
                    l[ix(i, j)] = s / l[ix(j, j)];
                }
            }
        }
        Some(Cholesky { n, l })
    }
}

#[derive(Debug, Clone)]
pub struct Cholesky {
    n: usize,
    l: Vec<f64>,
}

impl Cholesky {
    /// Solve A x = b using forward and back substitution
    pub fn solve(&self, b: &[f64]) -> Vec<f64> {
        let n = self.n;
        let l = &self.l;
        let mut y = vec![0.0; n];
        for i in 0..n {
            let s: f64 = (0..i).map(|k| l[ix(i, k)] * y[k]).sum();
            y[i] = (b[i] - s) / l[ix(i, i)];
        }
        let mut x = vec![0.0; n];
        for i in (0..n).rev() {
            let s: f64 = (i + 1..n).map(|k| l[ix(k, i)] * x[k]).sum();
            x[i] = (y[i] - s) / l[ix(i, i)];
        }
        x
    }

    /// log(det(A))
    pub fn log_det(&self) -> f64 {
        2.0 * (0..self.n).map(|i| self.l[ix(i, i)].ln()).sum::<f64>()
    }
}
