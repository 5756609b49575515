use std::{
    collections::HashMap,
    num::{NonZeroU32, NonZeroUsize},
    path::PathBuf,
};

use clap::{
    crate_authors, crate_description, crate_name, crate_version, value_parser, Arg, ArgAction,
    ArgMatches, Command,
};

use anyhow::Context;
use regex::Regex;

use db_core::{
    abundance::{FilterConfig, FilterMode},
    combine::{CombineParams, CombineRule},
    config::AnalysisConfig,
    counter::{ContigInfo, StrandMode},
    dispersion::DispersionOptions,
    matrix::DesignMatrix,
    merge::MergeParams,
    normalize::{NormStrategy, TrimParams},
};
use utils::{init_log, LogLevel};

use crate::{config::*, io::*, sample::*};

/// Set up definition of command options for clap
fn cli_model() -> Command {
    Command::new(crate_name!())
        .about(crate_description!())
        .version(crate_version!())
        .author(crate_authors!())
        .arg(
            Arg::new("timestamp")
                .short('X')
                .long("timestamp")
                .value_parser(value_parser!(stderrlog::Timestamp))
                .value_name("GRANULARITY")
                .default_value("none")
                .help("Prepend log entries with a timestamp"),
        )
        .arg(
            Arg::new("loglevel")
                .short('l')
                .long("loglevel")
                .value_name("LOGLEVEL")
                .value_parser(value_parser!(LogLevel))
                .ignore_case(true)
                .default_value("warn")
                .help("Set log level"),
        )
        .arg(
            Arg::new("quiet")
                .action(ArgAction::SetTrue)
                .long("quiet")
                .conflicts_with("loglevel")
                .help("Silence all output"),
        )
        .arg(
            Arg::new("threads")
                .short('t')
                .long("threads")
                .value_parser(value_parser!(NonZeroUsize))
                .value_name("INT")
                .help("Set number of threads [default: available cores]"),
        )
        .next_help_heading("Counting")
        .arg(
            Arg::new("width")
                .short('w')
                .long("window-width")
                .value_parser(value_parser!(NonZeroUsize))
                .value_name("INT")
                .default_value("10")
                .help("Set window width in base pairs"),
        )
        .arg(
            Arg::new("spacing")
                .short('s')
                .long("spacing")
                .value_parser(value_parser!(NonZeroUsize))
                .value_name("INT")
                .default_value("50")
                .help("Set distance between window starts"),
        )
        .arg(
            Arg::new("bin_width")
                .short('b')
                .long("bin-width")
                .value_parser(value_parser!(NonZeroUsize))
                .value_name("INT")
                .default_value("10000")
                .help("Set width of background bins"),
        )
        .arg(
            Arg::new("ext_len")
                .short('e')
                .long("ext-len")
                .value_parser(value_parser!(NonZeroUsize))
                .value_name("INT")
                .default_value("100")
                .help("Set fragment length for read extension"),
        )
        .arg(
            Arg::new("min_mapq")
                .short('Q')
                .long("min-mapq")
                .value_parser(value_parser!(u8))
                .value_name("INT")
                .default_value("20")
                .help("Set minimum mapping quality"),
        )
        .arg(
            Arg::new("min_count")
                .short('m')
                .long("min-count")
                .value_parser(value_parser!(u32))
                .value_name("INT")
                .default_value("10")
                .help("Drop windows with fewer fragments summed over all samples"),
        )
        .arg(
            Arg::new("stranded")
                .action(ArgAction::SetTrue)
                .long("stranded")
                .help("Count forward and reverse strand fragments separately"),
        )
        .arg(
            Arg::new("chrom")
                .short('c')
                .long("chrom")
                .value_parser(value_parser!(String))
                .value_delimiter(',')
                .value_name("NAME")
                .help("Restrict analysis to listed chromosomes (comma separated)"),
        )
        .arg(
            Arg::new("chrom_pattern")
                .long("chrom-pattern")
                .value_parser(value_parser!(String))
                .value_name("REGEX")
                .conflicts_with("chrom")
                .help("Restrict analysis to chromosomes matching regular expression"),
        )
        .arg(
            Arg::new("discard")
                .short('d')
                .long("discard")
                .value_parser(value_parser!(PathBuf))
                .value_name("PATH")
                .help("BED file with regions where fragments are discarded"),
        )
        .next_help_heading("Filtering and normalization")
        .arg(
            Arg::new("filter")
                .short('f')
                .long("filter")
                .value_parser(value_parser!(FilterMode))
                .value_name("MODE")
                .default_value("global")
                .help("Abundance filter (global, local, proportion)"),
        )
        .arg(
            Arg::new("filter_threshold")
                .long("filter-threshold")
                .value_parser(value_parser!(f64))
                .value_name("FLOAT")
                .help("Minimum log2 enrichment over background [default: log2(3)]"),
        )
        .arg(
            Arg::new("prior_count")
                .long("prior-count")
                .value_parser(value_parser!(f64))
                .value_name("FLOAT")
                .default_value("2")
                .help("Prior count for abundance calculations"),
        )
        .arg(
            Arg::new("surround")
                .long("surround")
                .value_parser(value_parser!(NonZeroUsize))
                .value_name("INT")
                .default_value("2000")
                .help("Flank width for local background"),
        )
        .arg(
            Arg::new("proportion")
                .long("proportion")
                .value_parser(value_parser!(f64))
                .value_name("FLOAT")
                .default_value("0.01")
                .help("Proportion of genome windows kept by proportion filter"),
        )
        .arg(
            Arg::new("norm")
                .short('n')
                .long("norm")
                .value_parser(value_parser!(NormStrategy))
                .value_name("STRATEGY")
                .default_value("background")
                .help("Normalization strategy (background, filtered, trended)"),
        )
        .arg(
            Arg::new("trim_ratio")
                .long("trim-ratio")
                .value_parser(value_parser!(f64))
                .value_name("FLOAT")
                .default_value("0.3")
                .help("Fraction of log ratios trimmed from each end"),
        )
        .arg(
            Arg::new("trim_abundance")
                .long("trim-abundance")
                .value_parser(value_parser!(f64))
                .value_name("FLOAT")
                .default_value("0.05")
                .help("Fraction of abundances trimmed from each end"),
        )
        .next_help_heading("Testing")
        .arg(
            Arg::new("contrast")
                .short('C')
                .long("contrast")
                .value_parser(value_parser!(String))
                .num_args(2)
                .value_names(["TEST", "REFERENCE"])
                .help("Groups to compare [default: second group vs. first when there are two]"),
        )
        .arg(
            Arg::new("dispersion")
                .long("dispersion")
                .value_parser(value_parser!(f64))
                .value_name("FLOAT")
                .help("Use fixed dispersion with likelihood ratio tests"),
        )
        .arg(
            Arg::new("no_robust")
                .action(ArgAction::SetTrue)
                .long("no-robust")
                .help("Do not down weight outliers in the quasi-likelihood trend"),
        )
        .arg(
            Arg::new("trend_bins")
                .long("trend-bins")
                .value_parser(value_parser!(NonZeroU32))
                .value_name("INT")
                .default_value("50")
                .help("Maximum number of abundance bins for dispersion trend"),
        )
        .next_help_heading("Regions")
        .arg(
            Arg::new("tol")
                .short('T')
                .long("tol")
                .value_parser(value_parser!(usize))
                .value_name("INT")
                .default_value("1000")
                .help("Maximum gap between windows in a region"),
        )
        .arg(
            Arg::new("max_width")
                .long("max-width")
                .value_parser(value_parser!(NonZeroUsize))
                .value_name("INT")
                .help("Maximum region width"),
        )
        .arg(
            Arg::new("ignore_strand")
                .action(ArgAction::SetTrue)
                .long("ignore-strand")
                .help("Merge windows from different strands"),
        )
        .arg(
            Arg::new("combine")
                .long("combine")
                .value_parser(value_parser!(CombineRule))
                .value_name("RULE")
                .default_value("simes")
                .help("Rule for combining window p-values (simes, best)"),
        )
        .arg(
            Arg::new("window_fdr")
                .long("window-fdr")
                .value_parser(value_parser!(f64))
                .value_name("FLOAT")
                .default_value("0.05")
                .help("Window FDR threshold for counting up and down windows"),
        )
        .next_help_heading("Input and output")
        .arg(
            Arg::new("sample_dir")
                .short('D')
                .long("sample-dir")
                .value_parser(value_parser!(PathBuf))
                .value_name("PATH")
                .help("Directory for relative alignment file paths [default: current directory]"),
        )
        .arg(
            Arg::new("output")
                .short('o')
                .long("output-file")
                .value_parser(value_parser!(PathBuf))
                .value_name("PATH")
                .help("Set output file [default: <stdout>]"),
        )
        .arg(
            Arg::new("window_output")
                .short('W')
                .long("window-output")
                .value_parser(value_parser!(PathBuf))
                .value_name("PATH")
                .help("Write per window results to file"),
        )
        .arg(
            Arg::new("query_regions")
                .short('r')
                .long("query-regions")
                .value_parser(value_parser!(PathBuf))
                .value_name("PATH")
                .requires("query_output")
                .help("BED file with regions (e.g., promoters) to test using overlapping windows"),
        )
        .arg(
            Arg::new("query_output")
                .long("query-output")
                .value_parser(value_parser!(PathBuf))
                .value_name("PATH")
                .requires("query_regions")
                .help("Output file for query region results"),
        )
        .arg(
            Arg::new("chrom_sizes")
                .value_parser(value_parser!(PathBuf))
                .value_name("CHROM_SIZES")
                .required(true)
                .help("File with chromosome names and lengths"),
        )
        .arg(
            Arg::new("sample_list")
                .value_parser(value_parser!(PathBuf))
                .value_name("SAMPLE_FILE")
                .required(true)
                .help("Input file with sample names, groups and alignment files"),
        )
}

fn get_usize(m: &ArgMatches, s: &str) -> usize {
    m.get_one::<NonZeroUsize>(s)
        .map(|x| usize::from(*x))
        .expect("Missing default value")
}

fn get_f64(m: &ArgMatches, s: &str) -> f64 {
    *m.get_one::<f64>(s).expect("Missing default value")
}

// Keep contigs matching the chromosome restriction, preserving the order in the sizes file
fn restrict_contigs(m: &ArgMatches, ctgs: Vec<ContigInfo>) -> anyhow::Result<Vec<ContigInfo>> {
    let v: Vec<ContigInfo> = if let Some(names) = m.get_many::<String>("chrom") {
        let names: Vec<&String> = names.collect();
        for n in names.iter() {
            if !ctgs.iter().any(|c| c.name.as_ref() == n.as_str()) {
                warn!("Chromosome {} not found in chromosome sizes file", n)
            }
        }
        ctgs.into_iter()
            .filter(|c| names.iter().any(|n| n.as_str() == c.name.as_ref()))
            .collect()
    } else if let Some(pat) = m.get_one::<String>("chrom_pattern") {
        let reg = Regex::new(pat).with_context(|| format!("Invalid chromosome pattern {}", pat))?;
        ctgs.into_iter().filter(|c| reg.is_match(&c.name)).collect()
    } else {
        ctgs
    };
    if v.is_empty() {
        Err(anyhow!("No chromosomes selected"))
    } else {
        debug!("Number of contigs selected: {}", v.len());
        Ok(v)
    }
}

fn design_from_samples(
    m: &ArgMatches,
    samples: &[Sample],
) -> anyhow::Result<(DesignMatrix, Vec<f64>)> {
    let groups: Vec<&str> = samples.iter().map(|s| s.group()).collect();
    let design =
        DesignMatrix::from_groups(&groups).with_context(|| "Could not form design matrix")?;
    let (num, den) = match m.get_many::<String>("contrast") {
        Some(mut v) => match (v.next(), v.next()) {
            (Some(a), Some(b)) => (a.to_owned(), b.to_owned()),
            _ => return Err(anyhow!("Contrast requires two group names")),
        },
        None => match design.coef_names() {
            [a, b] => (b.to_owned(), a.to_owned()),
            _ => {
                return Err(anyhow!(
                    "Contrast must be specified when there are {} groups",
                    design.n_coef()
                ))
            }
        },
    };
    info!("Testing {} vs. {}", num, den);
    let contrast = design.group_contrast(&num, &den)?;
    Ok((design, contrast))
}

fn analysis_config(
    m: &ArgMatches,
    samples: &[Sample],
    ctgs: &[ContigInfo],
) -> anyhow::Result<AnalysisConfig> {
    let mut cfg = AnalysisConfig::default();
    cfg.set_threads(
        m.get_one::<NonZeroUsize>("threads")
            .map(|x| usize::from(*x))
            .unwrap_or_else(num_cpus::get),
    );
    cfg.set_window(get_usize(m, "width"), get_usize(m, "spacing"));
    cfg.set_bin_width(get_usize(m, "bin_width"));
    cfg.set_ext_len(get_usize(m, "ext_len"));
    cfg.set_min_mapq(*m.get_one::<u8>("min_mapq").expect("Missing default value"));
    cfg.set_min_count(*m.get_one::<u32>("min_count").expect("Missing default value"));
    if m.get_flag("stranded") {
        cfg.set_strand_mode(StrandMode::Split)
    }
    cfg.set_chromosomes(ctgs.iter().map(|c| c.name.to_string()));

    let mut filter = FilterConfig {
        mode: *m.get_one::<FilterMode>("filter").expect("Missing default value"),
        prior_count: get_f64(m, "prior_count"),
        surround: get_usize(m, "surround"),
        proportion: get_f64(m, "proportion"),
        ..Default::default()
    };
    if let Some(x) = m.get_one::<f64>("filter_threshold") {
        filter.threshold = *x
    }
    cfg.set_filter(filter);

    cfg.set_normalization(
        *m.get_one::<NormStrategy>("norm").expect("Missing default value"),
        TrimParams {
            log_ratio: get_f64(m, "trim_ratio"),
            abundance: get_f64(m, "trim_abundance"),
        },
    );
    cfg.set_dispersion(DispersionOptions {
        robust: !m.get_flag("no_robust"),
        fixed: m.get_one::<f64>("dispersion").copied(),
        trend_bins: m
            .get_one::<NonZeroU32>("trend_bins")
            .map(|x| u32::from(*x) as usize)
            .expect("Missing default value"),
        ..Default::default()
    });
    cfg.set_merge(MergeParams {
        tol: *m.get_one::<usize>("tol").expect("Missing default value"),
        max_width: m.get_one::<NonZeroUsize>("max_width").map(|x| usize::from(*x)),
        ignore_strand: m.get_flag("ignore_strand"),
    });
    cfg.set_combine(CombineParams {
        rule: *m.get_one::<CombineRule>("combine").expect("Missing default value"),
        threshold: get_f64(m, "window_fdr"),
    });

    let (design, contrast) = design_from_samples(m, samples)?;
    cfg.set_design(design, contrast);

    if let Some(p) = m.get_one::<PathBuf>("discard") {
        let hash: HashMap<&str, &ContigInfo> = ctgs.iter().map(|c| (c.name.as_ref(), c)).collect();
        let set = read_bed_intervals(p, &hash)
            .with_context(|| format!("Could not read discard regions from {}", p.display()))?;
        info!("Read {} discard regions", set.len());
        cfg.set_discard(set.reduce())
    }

    cfg.validate()?;
    Ok(cfg)
}

/// Handle command line options.  Set up Config structure
pub fn handle_cli() -> anyhow::Result<Config> {
    // Get matches from command line
    let m = cli_model().get_matches();

    // Setup logging
    init_log(&m);

    debug!("Processing command line options");

    let ctgs = read_chrom_sizes(
        m.get_one::<PathBuf>("chrom_sizes")
            .expect("Missing chromosome sizes file"),
    )
    .with_context(|| "Could not read from chromosome sizes file")?;
    let ctgs = restrict_contigs(&m, ctgs)?;

    // Read in sample list
    let samples = read_sample_list_from_file(
        m.get_one::<PathBuf>("sample_list")
            .expect("Missing sample list file"),
        m.get_one::<PathBuf>("sample_dir").map(|p| p.as_path()),
    )
    .with_context(|| "Could not read from sample list file")?;
    for s in samples.iter().filter(|s| !s.path().exists()) {
        warn!("Alignment file {} for sample {} not found", s.path().display(), s.name())
    }

    let analysis = analysis_config(&m, &samples, &ctgs)?;
    let output = m.get_one::<PathBuf>("output").map(|s| s.to_owned());
    let mut cfg = Config::new(analysis, samples, ctgs, output);
    cfg.set_window_file(m.get_one::<PathBuf>("window_output").map(|s| s.to_owned()));
    if let Some(p) = m.get_one::<PathBuf>("query_regions") {
        cfg.set_queries(
            p.to_owned(),
            m.get_one::<PathBuf>("query_output").map(|s| s.to_owned()),
        )
    }
    Ok(cfg)
}
