#[macro_use]
extern crate anyhow;

use std::{cmp::Ordering, fmt, io::BufRead, str::FromStr};

use clap::ArgMatches;
use special::Beta;

/// LogLevel
///
/// Represents minimum level of messages that will be logged
///
#[derive(Debug, Clone, Copy)]
pub struct LogLevel {
    pub level: usize,
}

impl FromStr for LogLevel {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "error" => Ok(LogLevel { level: 0 }),
            "warn" => Ok(LogLevel { level: 1 }),
            "info" => Ok(LogLevel { level: 2 }),
            "debug" => Ok(LogLevel { level: 3 }),
            "trace" => Ok(LogLevel { level: 4 }),
            "none" => Ok(LogLevel { level: 5 }),
            _ => Err("no match"),
        }
    }
}

impl LogLevel {
    pub fn is_none(&self) -> bool {
        self.level > 4
    }
    pub fn get_level(&self) -> usize {
        if self.level > 4 {
            0
        } else {
            self.level
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let level_str = ["error", "warn", "info", "debug", "trace", "none"];
        if self.level < 6 {
            write!(f, "{}", level_str[self.level])
        } else {
            write!(f, "unknown")
        }
    }
}

/// Initialize logging from command line arguments
pub fn init_log(m: &ArgMatches) {
    let verbose = m
        .get_one::<LogLevel>("loglevel")
        .copied()
        .unwrap_or_else(|| LogLevel::from_str("info").expect("Could not set loglevel info"));
    let quiet = verbose.is_none() || m.get_flag("quiet");
    let ts = m
        .get_one::<stderrlog::Timestamp>("timestamp")
        .copied()
        .unwrap_or(stderrlog::Timestamp::Off);

    stderrlog::new()
        .quiet(quiet)
        .verbosity(verbose.get_level())
        .timestamp(ts)
        .init()
        .unwrap();
}

/// Read in next line and split on tabs after trimming white space
pub fn get_next_line<'a, R: BufRead>(
    rdr: &mut R,
    buf: &'a mut String,
) -> anyhow::Result<Option<Vec<&'a str>>> {
    buf.clear();
    if rdr.read_line(buf)? == 0 {
        Ok(None)
    } else {
        Ok(Some(buf.trim().split('\t').collect()))
    }
}

/// Upper tail of the chi-squared distribution, P(X > x) for X ~ chi2(df)
pub fn pchisq_upper(x: f64, df: f64) -> anyhow::Result<f64> {
    if df <= 0.0 || df.is_nan() {
        Err(anyhow!("pchisq_upper(): Invalid df {}", df))
    } else if x.is_nan() {
        Err(anyhow!("pchisq_upper(): Invalid statistic {}", x))
    } else if x <= 0.0 {
        Ok(1.0)
    } else if x.is_infinite() {
        Ok(0.0)
    } else {
        Ok(statrs::function::gamma::gamma_ur(0.5 * df, 0.5 * x))
    }
}

/// Upper tail of the F distribution, P(X > f) for X ~ F(df1, df2)
///
/// An infinite df2 gives the limiting scaled chi-squared distribution.
pub fn pf_upper(f: f64, df1: f64, df2: f64) -> anyhow::Result<f64> {
    if df1 <= 0.0 || df2 <= 0.0 || df1.is_nan() || df2.is_nan() {
        Err(anyhow!("pf_upper(): Invalid df ({}, {})", df1, df2))
    } else if f.is_nan() {
        Err(anyhow!("pf_upper(): Invalid statistic {}", f))
    } else if f <= 0.0 {
        Ok(1.0)
    } else if df2.is_infinite() {
        pchisq_upper(f * df1, df1)
    } else {
        let (a, b) = (0.5 * df2, 0.5 * df1);
        let x = df2 / (df2 + df1 * f);
        let lbeta = a.ln_beta(b);
        Ok(x.inc_beta(a, b, lbeta).clamp(0.0, 1.0))
    }
}

pub fn ln_gamma(x: f64) -> f64 {
    statrs::function::gamma::ln_gamma(x)
}

pub fn digamma(x: f64) -> f64 {
    statrs::function::gamma::digamma(x)
}

/// Trigamma function for x > 0
/// Uses recurrence to shift x above 6 followed by the asymptotic expansion
pub fn trigamma(x: f64) -> f64 {
    let mut x = x;
    let mut acc = 0.0;
    while x < 6.0 {
        acc += 1.0 / (x * x);
        x += 1.0;
    }
    let z = 1.0 / (x * x);
    acc + 1.0 / x
        + z / 2.0
        + z / x * (1.0 / 6.0 - z * (1.0 / 30.0 - z * (1.0 / 42.0 - z / 30.0)))
}

// Second derivative of digamma (x > 0)
fn tetragamma(x: f64) -> f64 {
    let mut x = x;
    let mut acc = 0.0;
    while x < 6.0 {
        acc -= 2.0 / (x * x * x);
        x += 1.0;
    }
    let z = 1.0 / (x * x);
    acc - z - z / x - z * z * (0.5 - z * (1.0 / 6.0 - z * (1.0 / 6.0 - z * 0.3)))
}

/// Solve trigamma(y) = x for y (x > 0) using Newton iterations
/// following Smyth (2004) Stat. Appl. Genet. Mol. Biol. 3(1) Article 3.
pub fn trigamma_inverse(x: f64) -> anyhow::Result<f64> {
    if x.is_nan() || x <= 0.0 {
        Err(anyhow!("trigamma_inverse(): Invalid parameter {}", x))
    } else if x > 1.0e7 {
        Ok(1.0 / x.sqrt())
    } else if x < 1.0e-6 {
        Ok(1.0 / x)
    } else {
        let mut y = 0.5 + 1.0 / x;
        for _ in 0..50 {
            let tri = trigamma(y);
            let dif = tri * (1.0 - tri / x) / tetragamma(y);
            y += dif;
            if -dif / y < 1.0e-8 {
                break;
            }
        }
        Ok(y)
    }
}

/// Median of a slice (NaN values should be removed by caller)
pub fn median(v: &[f64]) -> Option<f64> {
    let l = v.len();
    if l == 0 {
        None
    } else {
        let mut w = v.to_vec();
        w.sort_unstable_by(|a, b| a.total_cmp(b));
        Some(if l & 1 == 1 {
            w[l >> 1]
        } else {
            0.5 * (w[(l >> 1) - 1] + w[l >> 1])
        })
    }
}

/// Ranks (starting from 1) with ties given their average rank
pub fn average_ranks(v: &[f64]) -> Vec<f64> {
    let mut ix: Vec<_> = (0..v.len()).collect();
    ix.sort_unstable_by(|a, b| v[*a].partial_cmp(&v[*b]).unwrap_or(Ordering::Equal));
    let mut r = vec![0.0; v.len()];
    let mut i = 0;
    while i < ix.len() {
        let mut j = i + 1;
        while j < ix.len() && v[ix[j]] == v[ix[i]] {
            j += 1
        }
        // Elements i..j are tied
        let rk = 0.5 * ((i + 1 + j) as f64);
        for k in &ix[i..j] {
            r[*k] = rk
        }
        i = j;
    }
    r
}

/// Perform multiple test correction for a p value vector using the FDR method
/// of Benjamini & Hochberg (1995).
pub fn fdr(p: &[f64]) -> Vec<f64> {
    let mut v: Vec<_> = p.iter().enumerate().collect();
    v.sort_unstable_by(|a, b| a.1.total_cmp(b.1));
    let n = p.len() as f64;
    let mut min_p: f64 = 1.0;
    let mut q = vec![0.0; p.len()];
    for (i, (k, p)) in v.iter().enumerate().rev() {
        min_p = min_p.min((n / ((i + 1) as f64)) * *p);
        q[*k] = min_p;
    }
    q
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn fdr_matches_hand_calculation() {
        let q = fdr(&[0.01, 0.04, 0.03, 0.5]);
        assert_approx_eq!(q[0], 0.04);
        assert_approx_eq!(q[1], 0.04 * 4.0 / 3.0);
        assert_approx_eq!(q[2], 0.04 * 4.0 / 3.0);
        assert_approx_eq!(q[3], 0.5);
    }

    #[test]
    fn ranks_average_ties() {
        let r = average_ranks(&[3.0, 1.0, 3.0, 2.0]);
        assert_eq!(r, vec![3.5, 1.0, 3.5, 2.0]);
    }

    #[test]
    fn median_even_and_odd() {
        assert_eq!(median(&[3.0, 1.0, 2.0]), Some(2.0));
        assert_eq!(median(&[4.0, 1.0, 2.0, 3.0]), Some(2.5));
        assert_eq!(median(&[]), None);
    }

    #[test]
    fn trigamma_known_values() {
        // trigamma(1) = pi^2 / 6
        assert_approx_eq!(trigamma(1.0), std::f64::consts::PI.powi(2) / 6.0, 1e-8);
        assert_approx_eq!(trigamma(0.5), std::f64::consts::PI.powi(2) / 2.0, 1e-8);
        let y = trigamma_inverse(trigamma(2.7)).unwrap();
        assert_approx_eq!(y, 2.7, 1e-6);
    }

    #[test]
    fn distribution_tails() {
        // chi2(2) upper tail is exp(-x/2)
        assert_approx_eq!(pchisq_upper(3.0, 2.0).unwrap(), (-1.5f64).exp(), 1e-10);
        // F(2, 2): P(F > f) = 1 / (1 + f)
        assert_approx_eq!(pf_upper(3.0, 2.0, 2.0).unwrap(), 0.25, 1e-10);
        assert_approx_eq!(
            pf_upper(1.5, 2.0, f64::INFINITY).unwrap(),
            (-1.5f64).exp(),
            1e-10
        );
        assert_eq!(pf_upper(0.0, 1.0, 3.0).unwrap(), 1.0);
        assert!(pf_upper(1.0, 0.0, 3.0).is_err());
    }
}
