use std::{collections::HashMap, io::Write, path::Path};

use anyhow::Context;
use compress_io::compress::CompressIo;

use db_core::{
    combine::RegionResult,
    counter::{ContigInfo, Library},
    interval::IntervalSet,
    pipeline::{run, AnalysisResults},
    pool::parallel_map,
    CoreError,
};

use crate::{config::Config, io::*};

fn read_libraries(cfg: &Config) -> anyhow::Result<Vec<Library>> {
    let ctgs: HashMap<&str, &ContigInfo> = cfg
        .ctg_list()
        .iter()
        .map(|c| (c.name.as_ref(), c))
        .collect();
    let a = cfg.analysis();
    let jobs: Vec<_> = cfg.sample_list().iter().collect();
    let libs = parallel_map(jobs, a.threads(), |s| {
        read_library(s, &ctgs, a.ext_len(), a.min_mapq()).map_err(|e| {
            CoreError::Worker(format!(
                "Could not read alignments for sample {}: {:#}",
                s.name(),
                e
            ))
        })
    })?;
    for l in libs.iter() {
        info!("Sample {}: {} fragments", l.name(), l.n_fragments())
    }
    Ok(libs)
}

fn write_table<T: std::fmt::Display>(p: Option<&Path>, t: T, desc: &str) -> anyhow::Result<()> {
    let mut wrt = CompressIo::new()
        .opt_path(p)
        .bufwriter()
        .with_context(|| format!("Could not open {} output file", desc))?;
    write!(wrt, "{}", t).with_context(|| format!("Error writing {} output", desc))?;
    wrt.flush()
        .with_context(|| format!("Error writing {} output", desc))
}

fn write_queries(
    p: Option<&Path>,
    queries: &IntervalSet,
    res: &[RegionResult],
) -> anyhow::Result<()> {
    let mut wrt = CompressIo::new()
        .opt_path(p)
        .bufwriter()
        .with_context(|| "Could not open query output file")?;
    writeln!(
        wrt,
        "chrom\tstart\tend\tstrand\tnWindows\tnUp\tnDown\tdirection\tlogFC\tPValue\tFDR"
    )?;
    for (q, r) in queries.iter().zip(res) {
        write!(wrt, "{}\t{}\t{}\t{}", q.ctg(), q.start(), q.end(), q.strand())?;
        match r {
            RegionResult::Tested(s) => writeln!(
                wrt,
                "\t{}\t{}\t{}\t{}\t{:.6}\t{:.6e}\t{:.6e}",
                s.n_windows, s.n_up, s.n_down, s.direction, s.rep_log_fc, s.p_value, s.fdr
            )?,
            RegionResult::NoData => writeln!(wrt, "\t0\t0\t0\tNA\tNA\tNA\tNA")?,
        }
    }
    wrt.flush()?;
    Ok(())
}

fn output_queries(cfg: &Config, res: &AnalysisResults) -> anyhow::Result<()> {
    if let Some(p) = cfg.query_file() {
        let ctgs: HashMap<&str, &ContigInfo> = cfg
            .ctg_list()
            .iter()
            .map(|c| (c.name.as_ref(), c))
            .collect();
        let queries = read_bed_intervals(p, &ctgs)
            .with_context(|| format!("Could not read query regions from {}", p.display()))?;
        let qres = res.combine_queries(&queries, cfg.analysis().combine())?;
        debug!(
            "{} of {} query regions have no tested windows",
            qres.iter().filter(|r| r.summary().is_none()).count(),
            qres.len()
        );
        write_queries(cfg.query_output_file(), &queries, &qres)?
    }
    Ok(())
}

pub fn process_data(cfg: &Config) -> anyhow::Result<()> {
    debug!("Reading alignments for {} samples", cfg.sample_list().len());
    let libs = read_libraries(cfg)?;

    let res = run(cfg.analysis(), &libs, cfg.ctg_list()).with_context(|| "Analysis failed")?;
    info!(
        "{} windows tested, {} regions found",
        res.windows().n_windows(),
        res.clusters().n_clusters()
    );

    write_table(cfg.output_file(), res.region_table(), "region")?;
    if let Some(p) = cfg.window_file() {
        write_table(Some(p), res.window_table(), "window")?
    }
    output_queries(cfg, &res)
}
