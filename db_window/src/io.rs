use std::{collections::HashMap, path::Path, sync::Arc};

use anyhow::Context;
use compress_io::compress::CompressIo;
use utils::get_next_line;

use db_core::{
    counter::{ContigInfo, Library},
    interval::{Contig, GenomicInterval, IntervalSet, Strand},
};

use crate::sample::Sample;

/// Read chromosome sizes file (name and length on each line)
pub fn read_chrom_sizes(p: &Path) -> anyhow::Result<Vec<ContigInfo>> {
    debug!("Reading chromosome sizes from {}", p.display());
    let mut rdr = CompressIo::new().path(p).bufreader()?;
    let mut buf = String::new();
    let mut line = 0;
    let mut v = Vec::new();

    while let Some(fields) = get_next_line(&mut rdr, &mut buf)
        .with_context(|| format!("Error after reading {} lines from {}", line, p.display()))?
    {
        line += 1;
        if fields.len() >= 2 {
            let length = fields[1]
                .parse::<usize>()
                .with_context(|| format!("{}:{} Error reading contig length", p.display(), line))?;
            v.push(ContigInfo {
                name: Arc::from(fields[0]),
                length,
            })
        }
    }
    if v.is_empty() {
        Err(anyhow!("No contigs found in {}", p.display()))
    } else {
        debug!("Read in {} contigs", v.len());
        Ok(v)
    }
}

fn parse_coords(s1: &str, s2: &str) -> anyhow::Result<(usize, usize)> {
    let a = s1.parse::<usize>().with_context(|| "Error parsing start")?;
    let b = s2.parse::<usize>().with_context(|| "Error parsing end")?;
    if b > a {
        Ok((a, b))
    } else {
        Err(anyhow!("Empty or negative interval {}-{}", s1, s2))
    }
}

// Imputed fragment for an alignment in 1-based coordinates, extended from the 5' end
// in the direction of the read and clipped to the contig
fn extend(start: usize, end: usize, strand: Strand, ext: usize, len: usize) -> (usize, usize) {
    let (a, b) = match strand {
        Strand::Forward => (start + 1, start + ext),
        Strand::Reverse => ((end + 1).saturating_sub(ext).max(1), end),
        Strand::Unstranded => (start + 1, end),
    };
    (a.min(len), b.min(len))
}

/// Read alignments for a sample from a BED file (chrom, start, end, name, score,
/// strand) where score holds the mapping quality.  Records on contigs not in ctgs
/// are skipped.
pub fn read_library(
    s: &Sample,
    ctgs: &HashMap<&str, &ContigInfo>,
    ext_len: usize,
    min_mapq: u8,
) -> anyhow::Result<Library> {
    let p = s.path();
    debug!("Reading alignments for sample {} from {}", s.name(), p.display());
    let mut rdr = CompressIo::new().path(p).bufreader()?;
    let mut buf = String::new();
    let mut line = 0;
    let mut lib = Library::new(s.name());
    let (mut skipped, mut low_q) = (0, 0);

    while let Some(fields) = get_next_line(&mut rdr, &mut buf)
        .with_context(|| format!("Error after reading {} lines from {}", line, p.display()))?
    {
        line += 1;
        if fields.len() < 3 || fields[0].starts_with('#') || fields[0].starts_with("track") {
            continue;
        }
        let ctg = match ctgs.get(fields[0]) {
            Some(c) => *c,
            None => {
                skipped += 1;
                continue;
            }
        };
        let (start, end) = parse_coords(fields[1], fields[2])
            .with_context(|| format!("{}:{} Error reading coordinates", p.display(), line))?;
        let mapq = match fields.get(4) {
            Some(x) => x
                .parse::<u32>()
                .with_context(|| format!("{}:{} Error reading mapping quality", p.display(), line))?
                .min(255) as u8,
            None => 255,
        };
        if mapq < min_mapq {
            low_q += 1;
            continue;
        }
        let strand = match fields.get(5) {
            Some(x) => x
                .parse::<Strand>()
                .with_context(|| format!("{}:{} Error reading strand", p.display(), line))?,
            None => Strand::Unstranded,
        };
        let (a, b) = extend(start, end, strand, ext_len, ctg.length);
        let iv = GenomicInterval::new(&ctg.name, a, b, strand)
            .with_context(|| format!("{}:{} Invalid fragment", p.display(), line))?;
        lib.add_fragment(&iv, mapq)
    }
    debug!(
        "Sample {}: {} fragments; {} records on unselected contigs, {} below mapq threshold",
        s.name(),
        lib.n_fragments(),
        skipped,
        low_q
    );
    Ok(lib)
}

/// Read intervals from a BED file (chrom, start, end, [name, score, strand])
pub fn read_bed_intervals(
    p: &Path,
    ctgs: &HashMap<&str, &ContigInfo>,
) -> anyhow::Result<IntervalSet> {
    debug!("Reading intervals from {}", p.display());
    let mut rdr = CompressIo::new().path(p).bufreader()?;
    let mut buf = String::new();
    let mut line = 0;
    let mut v = Vec::new();

    while let Some(fields) = get_next_line(&mut rdr, &mut buf)
        .with_context(|| format!("Error after reading {} lines from {}", line, p.display()))?
    {
        line += 1;
        if fields.len() < 3 || fields[0].starts_with('#') || fields[0].starts_with("track") {
            continue;
        }
        if let Some(c) = ctgs.get(fields[0]) {
            let ctg: &Contig = &c.name;
            let (start, end) = parse_coords(fields[1], fields[2])
                .with_context(|| format!("{}:{} Error reading coordinates", p.display(), line))?;
            let strand = match fields.get(5) {
                Some(x) => x.parse::<Strand>().unwrap_or(Strand::Unstranded),
                None => Strand::Unstranded,
            };
            v.push(
                GenomicInterval::new(ctg, start + 1, end.min(c.length), strand)
                    .with_context(|| format!("{}:{} Invalid interval", p.display(), line))?,
            )
        }
    }
    debug!("Read in {} intervals", v.len());
    Ok(IntervalSet::new(v))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directional_extension() {
        // BED [100, 150) is 1-based [101, 150]
        assert_eq!(extend(100, 150, Strand::Forward, 200, 10000), (101, 300));
        assert_eq!(extend(100, 150, Strand::Reverse, 200, 10000), (1, 150));
        assert_eq!(extend(1000, 1050, Strand::Reverse, 200, 10000), (851, 1050));
        assert_eq!(extend(9950, 10000, Strand::Forward, 200, 10000), (9951, 10000));
        assert_eq!(extend(100, 150, Strand::Unstranded, 200, 10000), (101, 150));
    }

    #[test]
    fn coordinates() {
        assert_eq!(parse_coords("10", "20").unwrap(), (10, 20));
        assert!(parse_coords("20", "20").is_err());
        assert!(parse_coords("x", "20").is_err());
    }
}
