//! Clustering of windows into regions
//!
//! Only window coordinates are used here; test results are joined to the clusters
//! afterwards.

use std::collections::{HashMap, HashSet};

use crate::{
    interval::{Contig, GenomicInterval, Strand},
    CoreError, Result,
};

#[derive(Debug, Clone)]
pub struct MergeParams {
    /// Maximum number of bases between a window and the end of the open cluster
    pub tol: usize,
    /// Maximum span of a cluster
    pub max_width: Option<usize>,
    /// Allow windows on different strands to share a cluster
    pub ignore_strand: bool,
}

impl Default for MergeParams {
    fn default() -> Self {
        Self {
            tol: 1000,
            max_width: None,
            ignore_strand: false,
        }
    }
}

impl MergeParams {
    pub fn check(&self) -> Result<()> {
        match self.max_width {
            Some(0) => Err(CoreError::Config(
                "Maximum cluster width must be positive".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

/// Clusters
///
/// ids - one cluster id per input window (ids are assigned in order of creation)
/// regions - span of the member windows for each cluster
///
#[derive(Debug, Clone)]
pub struct Clusters {
    ids: Vec<usize>,
    regions: Vec<GenomicInterval>,
}

impl Clusters {
    pub fn ids(&self) -> &[usize] {
        &self.ids
    }

    pub fn regions(&self) -> &[GenomicInterval] {
        &self.regions
    }

    pub fn n_clusters(&self) -> usize {
        self.regions.len()
    }

    /// Window indices for each cluster
    pub fn members(&self) -> Vec<Vec<usize>> {
        let mut v = vec![Vec::new(); self.regions.len()];
        for (i, c) in self.ids.iter().enumerate() {
            v[*c].push(i)
        }
        v
    }
}

/// Group windows (sorted by contig, then start) into clusters.  A window joins the
/// open cluster for its contig and strand if the gap between them is at most tol and
/// the resulting span does not exceed max_width; otherwise it starts a new cluster.
pub fn merge_windows(windows: &[GenomicInterval], params: &MergeParams) -> Result<Clusters> {
    params.check()?;
    let mut ids = Vec::with_capacity(windows.len());
    let mut regions: Vec<GenomicInterval> = Vec::new();
    let mut finished: HashSet<Contig> = HashSet::new();
    let mut current: Option<(Contig, usize)> = None;
    // Open cluster per strand on the current contig
    let mut open: HashMap<Strand, usize> = HashMap::new();

    for w in windows {
        let same_ctg = current.as_ref().map(|(c, _)| c == w.ctg()).unwrap_or(false);
        if same_ctg {
            if let Some((_, s)) = &current {
                if w.start() < *s {
                    return Err(CoreError::Unsorted(format!(
                        "window {} follows a window starting at {}",
                        w, s
                    )));
                }
            }
        } else {
            if finished.contains(w.ctg()) {
                return Err(CoreError::Unsorted(format!(
                    "contig {} is not contiguous",
                    w.ctg()
                )));
            }
            if let Some((c, _)) = current.take() {
                finished.insert(c);
            }
            open.clear();
        }
        current = Some((w.ctg().clone(), w.start()));

        let key = if params.ignore_strand {
            Strand::Unstranded
        } else {
            w.strand()
        };
        let joined = open.get(&key).copied().filter(|k| {
            let r = &regions[*k];
            let close = r.gap_to(w).map(|g| g <= params.tol as isize).unwrap_or(false);
            let narrow = params
                .max_width
                .map(|m| r.span(w).width() <= m)
                .unwrap_or(true);
            close && narrow
        });
        let id = match joined {
            Some(k) => {
                let r = regions[k].span(w);
                regions[k] = r;
                k
            }
            None => {
                regions.push(w.clone());
                open.insert(key, regions.len() - 1);
                regions.len() - 1
            }
        };
        ids.push(id);
    }
    debug!(
        "Merged {} windows into {} clusters",
        windows.len(),
        regions.len()
    );
    Ok(Clusters { ids, regions })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn iv(c: &Contig, s: usize, e: usize, st: Strand) -> GenomicInterval {
        GenomicInterval::new(c, s, e, st).unwrap()
    }

    fn windows(c: &Contig, starts: &[usize]) -> Vec<GenomicInterval> {
        starts.iter().map(|s| iv(c, *s, s + 9, Strand::Unstranded)).collect()
    }

    #[test]
    fn gap_tolerance() {
        let c: Contig = Arc::from("chr1");
        // Gaps: 40, 40, 101
        let w = windows(&c, &[1, 51, 101, 212]);
        let p = MergeParams {
            tol: 100,
            ..Default::default()
        };
        let cl = merge_windows(&w, &p).unwrap();
        assert_eq!(cl.ids(), &[0, 0, 0, 1]);
        assert_eq!(cl.regions()[0].start(), 1);
        assert_eq!(cl.regions()[0].end(), 110);
        assert_eq!(cl.members()[1], vec![3]);
    }

    #[test]
    fn contig_change_starts_cluster() {
        let c1: Contig = Arc::from("chr1");
        let c2: Contig = Arc::from("chr2");
        let mut w = windows(&c1, &[1, 51]);
        w.extend(windows(&c2, &[1, 51]));
        let cl = merge_windows(&w, &MergeParams::default()).unwrap();
        assert_eq!(cl.ids(), &[0, 0, 1, 1]);
        assert_eq!(cl.regions()[1].ctg().as_ref(), "chr2");
    }

    #[test]
    fn max_width_splits_chains() {
        let c: Contig = Arc::from("chr1");
        let w = windows(&c, &[1, 51, 101, 151, 201]);
        let p = MergeParams {
            tol: 100,
            max_width: Some(120),
            ..Default::default()
        };
        let cl = merge_windows(&w, &p).unwrap();
        assert_eq!(cl.ids(), &[0, 0, 0, 1, 1]);
        assert!(cl.regions().iter().all(|r| r.width() <= 120));
    }

    #[test]
    fn strands_kept_apart() {
        let c: Contig = Arc::from("chr1");
        let w = vec![
            iv(&c, 1, 10, Strand::Forward),
            iv(&c, 1, 10, Strand::Reverse),
            iv(&c, 51, 60, Strand::Forward),
            iv(&c, 51, 60, Strand::Reverse),
        ];
        let cl = merge_windows(&w, &MergeParams::default()).unwrap();
        assert_eq!(cl.ids(), &[0, 1, 0, 1]);
        let p = MergeParams {
            ignore_strand: true,
            ..Default::default()
        };
        let cl = merge_windows(&w, &p).unwrap();
        assert_eq!(cl.ids(), &[0, 0, 0, 0]);
        assert_eq!(cl.regions()[0].strand(), Strand::Unstranded);
    }

    #[test]
    fn merging_is_idempotent() {
        let c: Contig = Arc::from("chr1");
        let w = windows(&c, &[1, 51, 101, 1501, 1551, 5001, 9001, 9051]);
        let p = MergeParams {
            tol: 1000,
            max_width: Some(2000),
            ..Default::default()
        };
        let cl = merge_windows(&w, &p).unwrap();
        let again = merge_windows(cl.regions(), &p).unwrap();
        assert_eq!(again.n_clusters(), cl.n_clusters());
        assert_eq!(again.ids(), (0..cl.n_clusters()).collect::<Vec<_>>().as_slice());
        assert_eq!(again.regions(), cl.regions());
    }

    #[test]
    fn unsorted_input_rejected() {
        let c1: Contig = Arc::from("chr1");
        let c2: Contig = Arc::from("chr2");
        let w = windows(&c1, &[51, 1]);
        assert!(matches!(
            merge_windows(&w, &MergeParams::default()),
            Err(CoreError::Unsorted(_))
        ));
        let mut w = windows(&c1, &[1]);
        w.extend(windows(&c2, &[1]));
        w.extend(windows(&c1, &[51]));
        assert!(merge_windows(&w, &MergeParams::default()).is_err());
    }
}
