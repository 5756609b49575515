use std::{cmp::Ordering, fmt, str::FromStr, sync::Arc};

use crate::{CoreError, Result};

/// Contig names are shared between many intervals so we use Arc<str>
pub type Contig = Arc<str>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Strand {
    Forward,
    Reverse,
    Unstranded,
}

impl FromStr for Strand {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "+" => Ok(Self::Forward),
            "-" => Ok(Self::Reverse),
            "." | "*" | "" => Ok(Self::Unstranded),
            _ => Err(CoreError::Config(format!("Could not parse strand {}", s))),
        }
    }
}

impl fmt::Display for Strand {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::Forward => "+",
            Self::Reverse => "-",
            Self::Unstranded => "*",
        };
        f.write_str(s)
    }
}

/// GenomicInterval
///
/// 1-based closed interval [start, end] on a contig.  Immutable once constructed.
///
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GenomicInterval {
    ctg: Contig,
    start: usize,
    end: usize,
    strand: Strand,
}

impl GenomicInterval {
    pub fn new(ctg: &Contig, start: usize, end: usize, strand: Strand) -> Result<Self> {
        if start == 0 || end < start {
            Err(CoreError::InvalidInterval {
                ctg: ctg.to_string(),
                start,
                end,
            })
        } else {
            Ok(Self {
                ctg: Arc::clone(ctg),
                start,
                end,
                strand,
            })
        }
    }

    pub fn ctg(&self) -> &Contig {
        &self.ctg
    }

    pub fn start(&self) -> usize {
        self.start
    }

    pub fn end(&self) -> usize {
        self.end
    }

    pub fn strand(&self) -> Strand {
        self.strand
    }

    pub fn width(&self) -> usize {
        self.end + 1 - self.start
    }

    /// Overlap by at least one base on the same contig.  Strands must agree
    /// unless either interval is unstranded.
    pub fn overlaps(&self, other: &Self) -> bool {
        self.ctg == other.ctg
            && self.start <= other.end
            && other.start <= self.end
            && strand_compatible(self.strand, other.strand)
    }

    /// Number of bases strictly between self and a following interval
    /// (negative if they overlap).  None if on different contigs.
    pub fn gap_to(&self, next: &Self) -> Option<isize> {
        if self.ctg == next.ctg {
            Some(next.start as isize - self.end as isize - 1)
        } else {
            None
        }
    }

    /// Interval extended by flank bases on each side, clipped to [1, ctg_len]
    pub fn expand(&self, flank: usize, ctg_len: usize) -> Self {
        Self {
            ctg: Arc::clone(&self.ctg),
            start: self.start.saturating_sub(flank).max(1),
            end: (self.end + flank).min(ctg_len.max(self.end)),
            strand: self.strand,
        }
    }

    /// Smallest interval covering self and other (contig taken from self)
    pub fn span(&self, other: &Self) -> Self {
        let strand = if self.strand == other.strand {
            self.strand
        } else {
            Strand::Unstranded
        };
        Self {
            ctg: Arc::clone(&self.ctg),
            start: self.start.min(other.start),
            end: self.end.max(other.end),
            strand,
        }
    }

    /// Order by contig name, then start, end and strand
    pub fn cmp_position(&self, other: &Self) -> Ordering {
        self.ctg
            .cmp(&other.ctg)
            .then(self.start.cmp(&other.start))
            .then(self.end.cmp(&other.end))
            .then(self.strand.cmp(&other.strand))
    }
}

impl fmt::Display for GenomicInterval {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}-{}:{}", self.ctg, self.start, self.end, self.strand)
    }
}

pub fn strand_compatible(a: Strand, b: Strand) -> bool {
    a == b || a == Strand::Unstranded || b == Strand::Unstranded
}

/// IntervalSet
///
/// Sorted collection of intervals.  Sort order is by contig name, then start.
///
#[derive(Debug, Clone, Default)]
pub struct IntervalSet {
    intervals: Vec<GenomicInterval>,
    // Largest interval width, used to bound overlap searches
    max_width: usize,
}

impl IntervalSet {
    pub fn new(mut intervals: Vec<GenomicInterval>) -> Self {
        intervals.sort_by(|a, b| a.cmp_position(b));
        let max_width = intervals.iter().map(|i| i.width()).max().unwrap_or(0);
        Self {
            intervals,
            max_width,
        }
    }

    pub fn len(&self) -> usize {
        self.intervals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    pub fn intervals(&self) -> &[GenomicInterval] {
        &self.intervals
    }

    pub fn iter(&self) -> impl Iterator<Item = &GenomicInterval> {
        self.intervals.iter()
    }

    // Range of indices for intervals on contig ctg
    fn ctg_range(&self, ctg: &str) -> (usize, usize) {
        let a = self.intervals.partition_point(|i| &*i.ctg < ctg);
        let b = self.intervals.partition_point(|i| &*i.ctg <= ctg);
        (a, b)
    }

    /// Indices of all intervals overlapping q
    pub fn overlapping(&self, q: &GenomicInterval) -> Vec<usize> {
        let (a, b) = self.ctg_range(q.ctg());
        let v = &self.intervals[a..b];
        // Candidates must start after q.start - max_width and no later than q.end
        let lo = q.start.saturating_sub(self.max_width);
        let i = v.partition_point(|x| x.start < lo);
        let j = v.partition_point(|x| x.start <= q.end);
        (i..j)
            .filter(|k| v[*k].overlaps(q))
            .map(|k| k + a)
            .collect()
    }

    /// For each interval in queries, the indices of intervals in self that overlap it
    pub fn find_overlaps(&self, queries: &[GenomicInterval]) -> Vec<Vec<usize>> {
        queries.iter().map(|q| self.overlapping(q)).collect()
    }

    /// True if any interval in the set overlaps q
    pub fn any_overlap(&self, q: &GenomicInterval) -> bool {
        !self.overlapping(q).is_empty()
    }

    /// Merge overlapping or book-ended intervals on the same contig into a new set.
    /// Strand information is discarded.
    pub fn reduce(&self) -> Self {
        let mut v: Vec<GenomicInterval> = Vec::with_capacity(self.intervals.len());
        for iv in self.intervals.iter() {
            match v.last_mut() {
                Some(prev) if prev.ctg == iv.ctg && iv.start <= prev.end + 1 => {
                    prev.end = prev.end.max(iv.end)
                }
                _ => {
                    let mut iv = iv.clone();
                    iv.strand = Strand::Unstranded;
                    v.push(iv)
                }
            }
        }
        Self::new(v)
    }
}
