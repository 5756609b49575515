//! Window and region counting
//!
//! Fragments for each library are held per contig.  Windows are tiled along each
//! contig at fixed spacing; window k covers [k * spacing + 1, k * spacing + width]
//! (clipped at the contig end).  The count for a window is the number of fragments
//! overlapping it by at least one base.  Each contig is an independent job.

use std::{collections::HashMap, sync::Arc};

use crate::{
    interval::{Contig, GenomicInterval, IntervalSet, Strand},
    matrix::CountMatrix,
    pool::parallel_map,
    CoreError, Result,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fragment {
    pub start: usize,
    pub end: usize,
    pub strand: Strand,
    pub mapq: u8,
}

/// Library
///
/// One sequencing sample: its imputed fragments grouped by contig
///
#[derive(Debug, Clone, Default)]
pub struct Library {
    name: String,
    fragments: HashMap<Contig, Vec<Fragment>>,
}

impl Library {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            fragments: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add_fragment(&mut self, iv: &GenomicInterval, mapq: u8) {
        self.fragments
            .entry(Arc::clone(iv.ctg()))
            .or_default()
            .push(Fragment {
                start: iv.start(),
                end: iv.end(),
                strand: iv.strand(),
                mapq,
            })
    }

    pub fn ctg_fragments(&self, ctg: &str) -> &[Fragment] {
        self.fragments.get(ctg).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn n_fragments(&self) -> usize {
        self.fragments.values().map(|v| v.len()).sum()
    }
}

#[derive(Debug, Clone)]
pub struct ContigInfo {
    pub name: Contig,
    pub length: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrandMode {
    Unstranded,
    Split,
}

/// Parameters for tiling and counting
#[derive(Debug, Clone)]
pub struct CountParams {
    pub width: usize,
    pub spacing: usize,
    pub min_mapq: u8,
    pub min_count: u32,
    pub strand_mode: StrandMode,
    pub discard: Option<Arc<IntervalSet>>,
    pub threads: usize,
}

impl CountParams {
    pub fn new(width: usize, spacing: usize) -> Self {
        Self {
            width,
            spacing,
            min_mapq: 0,
            min_count: 0,
            strand_mode: StrandMode::Unstranded,
            discard: None,
            threads: 1,
        }
    }

    /// Non-overlapping bins (spacing = width) with no count filter
    pub fn bins(width: usize) -> Self {
        Self::new(width, width)
    }

    fn check(&self) -> Result<()> {
        if self.width == 0 || self.spacing == 0 {
            Err(CoreError::Config(format!(
                "Window width ({}) and spacing ({}) must be positive",
                self.width, self.spacing
            )))
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Clone)]
pub enum WindowCounts {
    Unstranded(CountMatrix),
    Stranded {
        forward: CountMatrix,
        reverse: CountMatrix,
    },
}

impl WindowCounts {
    /// Single matrix in genomic order (forward and reverse windows stacked if stranded)
    pub fn into_matrix(self, contigs: &[ContigInfo]) -> Result<CountMatrix> {
        match self {
            Self::Unstranded(m) => Ok(m),
            Self::Stranded { forward, reverse } => {
                let order: HashMap<_, _> = contigs
                    .iter()
                    .enumerate()
                    .map(|(i, c)| (Arc::clone(&c.name), i))
                    .collect();
                forward.stack(&reverse, &order)
            }
        }
    }
}

// Results for one contig: counts for the windows (row major) and fragments used per library
struct CtgCounts {
    n_windows: usize,
    counts: Vec<u32>,
    totals: Vec<u64>,
}

fn n_windows(len: usize, spacing: usize) -> usize {
    if len == 0 {
        0
    } else {
        (len - 1) / spacing + 1
    }
}

// Fragments passing the mapping quality, strand and discard filters, clipped to the contig
fn usable_fragments<'a>(
    frags: &'a [Fragment],
    ctg: &'a ContigInfo,
    params: &'a CountParams,
    strand: Option<Strand>,
) -> impl Iterator<Item = (usize, usize)> + 'a {
    frags
        .iter()
        .filter(move |f| {
            f.mapq >= params.min_mapq
                && f.start <= ctg.length
                && strand.map(|s| s == f.strand).unwrap_or(true)
        })
        .filter(move |f| match params.discard.as_ref() {
            Some(d) => GenomicInterval::new(&ctg.name, f.start, f.end, Strand::Unstranded)
                .map(|iv| !d.any_overlap(&iv))
                .unwrap_or(false),
            None => true,
        })
        .map(move |f| (f.start, f.end.min(ctg.length)))
}

fn count_ctg(
    libs: &[Library],
    ctg: &ContigInfo,
    params: &CountParams,
    strand: Option<Strand>,
) -> CtgCounts {
    let (w, s) = (params.width, params.spacing);
    let nw = n_windows(ctg.length, s);
    let nl = libs.len();
    let mut counts = vec![0u32; nw * nl];
    let mut totals = vec![0u64; nl];
    let mut diff = vec![0i64; nw + 1];
    for (j, lib) in libs.iter().enumerate() {
        diff.iter_mut().for_each(|d| *d = 0);
        for (fs, fe) in usable_fragments(lib.ctg_fragments(&ctg.name), ctg, params, strand) {
            totals[j] += 1;
            // First window with k*s + w >= fs and last window with k*s + 1 <= fe
            let klo = if fs > w { (fs - w + s - 1) / s } else { 0 };
            let khi = ((fe - 1) / s).min(nw.saturating_sub(1));
            if klo <= khi && nw > 0 {
                diff[klo] += 1;
                diff[khi + 1] -= 1;
            }
        }
        let mut c = 0i64;
        for k in 0..nw {
            c += diff[k];
            counts[k * nl + j] = c as u32;
        }
    }
    trace!(
        "Contig {}: {} windows, fragments per library {:?}",
        ctg.name,
        nw,
        totals
    );
    CtgCounts {
        n_windows: nw,
        counts,
        totals,
    }
}

fn assemble(
    per_ctg: Vec<CtgCounts>,
    contigs: &[ContigInfo],
    params: &CountParams,
    n_libs: usize,
    strand: Strand,
) -> Result<CountMatrix> {
    let mut windows = Vec::new();
    let mut counts = Vec::new();
    let mut lib_sizes = vec![0u64; n_libs];
    for (cc, ctg) in per_ctg.iter().zip(contigs) {
        for (t, x) in lib_sizes.iter_mut().zip(cc.totals.iter()) {
            *t += x
        }
        for k in 0..cc.n_windows {
            let row = &cc.counts[k * n_libs..(k + 1) * n_libs];
            let tot: u64 = row.iter().map(|x| *x as u64).sum();
            if tot >= params.min_count as u64 {
                let start = k * params.spacing + 1;
                let end = (start + params.width - 1).min(ctg.length);
                windows.push(GenomicInterval::new(&ctg.name, start, end, strand)?);
                counts.extend_from_slice(row);
            }
        }
    }
    CountMatrix::new(windows, counts, lib_sizes, params.width)
}

/// Tile the contigs into windows and count overlapping fragments for each library
pub fn count_windows(
    libs: &[Library],
    contigs: &[ContigInfo],
    params: &CountParams,
) -> Result<WindowCounts> {
    params.check()?;
    debug!(
        "Counting {} libraries in windows of width {} and spacing {} over {} contigs",
        libs.len(),
        params.width,
        params.spacing,
        contigs.len()
    );
    for l in libs.iter().filter(|l| l.n_fragments() == 0) {
        warn!("Library {} has no fragments", l.name())
    }
    let nl = libs.len();
    let run = |strand: Option<Strand>| -> Result<CountMatrix> {
        let jobs: Vec<&ContigInfo> = contigs.iter().collect();
        let per_ctg = parallel_map(jobs, params.threads, |c| {
            Ok(count_ctg(libs, c, params, strand))
        })?;
        assemble(
            per_ctg,
            contigs,
            params,
            nl,
            strand.unwrap_or(Strand::Unstranded),
        )
    };
    let res = match params.strand_mode {
        StrandMode::Unstranded => WindowCounts::Unstranded(run(None)?),
        StrandMode::Split => WindowCounts::Stranded {
            forward: run(Some(Strand::Forward))?,
            reverse: run(Some(Strand::Reverse))?,
        },
    };
    if let WindowCounts::Unstranded(m) = &res {
        debug!(
            "Counted {} windows; library sizes {:?}",
            m.n_windows(),
            m.lib_sizes()
        );
    }
    Ok(res)
}

// Sorted fragment starts and ends for one library on one contig
struct Endpoints {
    starts: Vec<usize>,
    ends: Vec<usize>,
}

impl Endpoints {
    fn new<I: Iterator<Item = (usize, usize)>>(it: I) -> Self {
        let (mut starts, mut ends): (Vec<usize>, Vec<usize>) = it.unzip();
        starts.sort_unstable();
        ends.sort_unstable();
        Self { starts, ends }
    }

    // overlapping = #(start <= r.end) - #(end < r.start)
    fn n_overlapping(&self, r: &GenomicInterval) -> u32 {
        let a = self.starts.partition_point(|x| *x <= r.end());
        let b = self.ends.partition_point(|x| *x < r.start());
        (a - b) as u32
    }
}

/// Count fragments overlapping arbitrary regions (which need not be sorted or disjoint).
/// Row order follows the input regions.  Regions on a strand only count fragments from
/// that strand.  Library sizes are the totals (both strands) over all contigs that have
/// regions.
pub fn count_regions(
    libs: &[Library],
    regions: &[GenomicInterval],
    contigs: &[ContigInfo],
    params: &CountParams,
) -> Result<CountMatrix> {
    let nl = libs.len();
    let nr = regions.len();
    // Group region indices by contig
    let mut by_ctg: HashMap<&str, Vec<usize>> = HashMap::new();
    for (i, r) in regions.iter().enumerate() {
        by_ctg.entry(r.ctg().as_ref()).or_default().push(i)
    }
    let jobs: Vec<(&ContigInfo, Vec<usize>)> = contigs
        .iter()
        .filter_map(|c| by_ctg.remove(c.name.as_ref()).map(|v| (c, v)))
        .collect();
    for ctg in by_ctg.keys() {
        warn!("Regions on unknown contig {} will have zero counts", ctg)
    }

    let per_ctg = parallel_map(jobs, params.threads, |(ctg, ix)| {
        let mut res = Vec::with_capacity(ix.len() * nl);
        let mut totals = vec![0u64; nl];
        let mut ends = Vec::with_capacity(nl);
        for (j, lib) in libs.iter().enumerate() {
            let frags = lib.ctg_fragments(&ctg.name);
            let all = Endpoints::new(usable_fragments(frags, ctg, params, None));
            totals[j] = all.starts.len() as u64;
            let fwd = Endpoints::new(usable_fragments(frags, ctg, params, Some(Strand::Forward)));
            let rev = Endpoints::new(usable_fragments(frags, ctg, params, Some(Strand::Reverse)));
            ends.push([all, fwd, rev]);
        }
        for i in ix.iter() {
            let r = &regions[*i];
            // Stranded regions only see fragments from their own strand
            let k = match r.strand() {
                Strand::Unstranded => 0,
                Strand::Forward => 1,
                Strand::Reverse => 2,
            };
            for e in ends.iter() {
                res.push((*i, e[k].n_overlapping(r)))
            }
        }
        Ok((res, totals))
    })?;

    let mut counts = vec![0u32; nr * nl];
    let mut lib_sizes = vec![0u64; nl];
    for (res, totals) in per_ctg {
        for (k, (i, c)) in res.into_iter().enumerate() {
            counts[i * nl + k % nl] = c
        }
        for (t, x) in lib_sizes.iter_mut().zip(totals) {
            *t += x
        }
    }
    let width = regions.iter().map(|r| r.width()).max().unwrap_or(0);
    CountMatrix::new(regions.to_vec(), counts, lib_sizes, width)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctg(name: &str, length: usize) -> ContigInfo {
        ContigInfo {
            name: Arc::from(name),
            length,
        }
    }

    fn lib(name: &str, c: &ContigInfo, frags: &[(usize, usize, Strand)]) -> Library {
        let mut l = Library::new(name);
        for (s, e, st) in frags {
            l.add_fragment(&GenomicInterval::new(&c.name, *s, *e, *st).unwrap(), 30)
        }
        l
    }

    fn unstranded(w: WindowCounts) -> CountMatrix {
        match w {
            WindowCounts::Unstranded(m) => m,
            _ => panic!("Expected unstranded counts"),
        }
    }

    #[test]
    fn windows_tile_and_clip() {
        let c = ctg("chr1", 125);
        let l = lib("a", &c, &[(1, 20, Strand::Forward), (105, 125, Strand::Reverse)]);
        let m = unstranded(count_windows(&[l], &[c], &CountParams::new(10, 50)).unwrap());
        assert_eq!(m.n_windows(), 3);
        assert_eq!(m.window(2).start(), 101);
        assert_eq!(m.window(2).end(), 110);
        assert_eq!(m.row(0), &[1]);
        assert_eq!(m.row(1), &[0]);
        assert_eq!(m.row(2), &[1]);
        assert_eq!(m.lib_sizes(), &[2]);
    }

    #[test]
    fn invalid_parameters_rejected() {
        let c = ctg("chr1", 100);
        assert!(count_windows(&[], &[c.clone()], &CountParams::new(0, 10)).is_err());
        assert!(count_windows(&[], &[c], &CountParams::new(10, 0)).is_err());
    }

    #[test]
    fn empty_library_and_contig() {
        let c = ctg("chr1", 100);
        let e = ctg("chrE", 0);
        let a = lib("a", &c, &[(10, 60, Strand::Forward)]);
        let b = Library::new("b");
        let m = unstranded(
            count_windows(&[a, b], &[c, e], &CountParams::new(20, 20)).unwrap(),
        );
        assert_eq!(m.n_windows(), 5);
        assert!(m.rows().all(|r| r[1] == 0));
        assert_eq!(m.col_sums(), vec![3, 0]);
        assert_eq!(m.lib_sizes(), &[1, 0]);
    }

    #[test]
    fn spacing_invariance_of_point_counts() {
        // Point fragments away from the contig start: each is covered by width / spacing windows
        let c = ctg("chr1", 10_000);
        let frags: Vec<_> = (0..200)
            .map(|i| {
                let x = 500 + i * 37;
                (x, x, Strand::Forward)
            })
            .collect();
        let l = lib("a", &c, &frags);
        let bins = unstranded(
            count_windows(&[l.clone()], &[c.clone()], &CountParams::new(20, 20)).unwrap(),
        );
        let dense = unstranded(count_windows(&[l], &[c], &CountParams::new(20, 5)).unwrap());
        let s1: u64 = bins.col_sums()[0];
        let s2: u64 = dense.col_sums()[0];
        assert_eq!(s1, 200);
        assert_eq!(s2, 200 * 4);
    }

    #[test]
    fn min_count_and_mapq_filters() {
        let c = ctg("chr1", 100);
        let mut l = lib("a", &c, &[(5, 8, Strand::Forward), (6, 9, Strand::Forward)]);
        l.add_fragment(
            &GenomicInterval::new(&c.name, 50, 55, Strand::Forward).unwrap(),
            2,
        );
        let mut p = CountParams::new(10, 10);
        p.min_mapq = 10;
        p.min_count = 1;
        let m = unstranded(count_windows(&[l], &[c], &p).unwrap());
        assert_eq!(m.n_windows(), 1);
        assert_eq!(m.row(0), &[2]);
        assert_eq!(m.lib_sizes(), &[2]);
    }

    #[test]
    fn discard_regions_remove_fragments() {
        let c = ctg("chr1", 100);
        let l = lib("a", &c, &[(5, 8, Strand::Forward), (45, 48, Strand::Forward)]);
        let mut p = CountParams::new(10, 10);
        p.discard = Some(Arc::new(IntervalSet::new(vec![GenomicInterval::new(
            &c.name,
            40,
            60,
            Strand::Unstranded,
        )
        .unwrap()])));
        let m = unstranded(count_windows(&[l], &[c], &p).unwrap());
        assert_eq!(m.lib_sizes(), &[1]);
        assert_eq!(m.col_sums(), vec![1]);
    }

    #[test]
    fn stranded_counts_split() {
        let c = ctg("chr1", 100);
        let l = lib(
            "a",
            &c,
            &[(5, 8, Strand::Forward), (6, 9, Strand::Reverse), (7, 9, Strand::Reverse)],
        );
        let mut p = CountParams::new(10, 10);
        p.strand_mode = StrandMode::Split;
        p.min_count = 1;
        let w = count_windows(&[l], &[c.clone()], &p).unwrap();
        match &w {
            WindowCounts::Stranded { forward, reverse } => {
                assert_eq!(forward.row(0), &[1]);
                assert_eq!(reverse.row(0), &[2]);
                assert_eq!(reverse.window(0).strand(), Strand::Reverse);
            }
            _ => panic!("Expected stranded counts"),
        }
        let m = w.into_matrix(&[c]).unwrap();
        assert_eq!(m.n_windows(), 2);
        assert_eq!(m.lib_sizes(), &[3]);
        assert_eq!(m.window(0).strand(), Strand::Forward);
    }

    #[test]
    fn region_counts_match_overlaps() {
        let c = ctg("chr1", 1000);
        let a = lib(
            "a",
            &c,
            &[
                (10, 20, Strand::Forward),
                (15, 100, Strand::Reverse),
                (500, 510, Strand::Forward),
            ],
        );
        let b = lib("b", &c, &[(90, 95, Strand::Forward)]);
        let regions = vec![
            GenomicInterval::new(&c.name, 50, 99, Strand::Unstranded).unwrap(),
            GenomicInterval::new(&c.name, 1, 12, Strand::Unstranded).unwrap(),
        ];
        let m = count_regions(&[a, b], &regions, &[c], &CountParams::new(1, 1)).unwrap();
        assert_eq!(m.row(0), &[1, 1]);
        assert_eq!(m.row(1), &[1, 0]);
        assert_eq!(m.lib_sizes(), &[3, 1]);
    }

    #[test]
    fn stranded_regions_count_own_strand() {
        let c = ctg("chr1", 10_000);
        let mut frags = vec![(5001, 5010, Strand::Forward); 30];
        frags.extend(vec![(5001, 5010, Strand::Reverse); 30]);
        let l = lib("a", &c, &frags);
        let iv = |st: Strand| GenomicInterval::new(&c.name, 3001, 7010, st).unwrap();
        let regions = vec![
            iv(Strand::Forward),
            iv(Strand::Reverse),
            iv(Strand::Unstranded),
        ];
        let m = count_regions(&[l], &regions, &[c.clone()], &CountParams::new(1, 1)).unwrap();
        assert_eq!(m.row(0), &[30]);
        assert_eq!(m.row(1), &[30]);
        assert_eq!(m.row(2), &[60]);
        assert_eq!(m.lib_sizes(), &[60]);
    }
}
