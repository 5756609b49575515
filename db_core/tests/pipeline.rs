use std::sync::Arc;

use db_core::{
    abundance::{FilterConfig, FilterMode},
    combine::{CombineParams, Direction, RegionResult},
    config::AnalysisConfig,
    counter::{ContigInfo, Library, StrandMode},
    interval::{Contig, GenomicInterval, IntervalSet, Strand},
    matrix::DesignMatrix,
    merge::MergeParams,
    normalize::{NormStrategy, TrimParams},
    pipeline::run,
};

const CTG_LEN: usize = 200_000;
const DB_START: usize = 150_001;

fn contigs() -> Vec<ContigInfo> {
    vec![ContigInfo {
        name: Arc::from("chr1"),
        length: CTG_LEN,
    }]
}

fn add(lib: &mut Library, ctg: &Contig, start: usize, end: usize, n: u32) {
    for k in 0..n {
        let strand = if k % 2 == 0 {
            Strand::Forward
        } else {
            Strand::Reverse
        };
        lib.add_fragment(&GenomicInterval::new(ctg, start, end, strand).unwrap(), 60)
    }
}

// 60 non-differential sites 2kb apart and one site where group B has lost binding.
// Each null site overlaps 4 windows, the differential site 5.
fn libraries(empty: Option<usize>) -> Vec<Library> {
    let ctg: Contig = Arc::from("chr1");
    let mut libs: Vec<Library> = ["A1", "A2", "B1", "B2"]
        .iter()
        .map(|s| Library::new(s))
        .collect();
    for s in 0..60 {
        let a = 5001 + 2000 * s;
        let b = 20 + (s % 9) as u32 * 4;
        let d = (s % 3) as u32;
        let n = [b + d, b - d, b + 2 - d, b - 2 + d];
        for (lib, x) in libs.iter_mut().zip(n) {
            add(lib, &ctg, a, a + 199, x)
        }
    }
    for (lib, x) in libs.iter_mut().zip([60, 54, 6, 5]) {
        add(lib, &ctg, DB_START, DB_START + 249, x)
    }
    if let Some(j) = empty {
        libs[j] = Library::new(libs[j].name())
    }
    libs
}

fn config() -> AnalysisConfig {
    let mut cfg = AnalysisConfig::default();
    cfg.set_window(10, 50);
    cfg.set_bin_width(2000);
    cfg.set_merge(MergeParams {
        tol: 1000,
        ..Default::default()
    });
    cfg.set_threads(2);
    let d = DesignMatrix::from_groups(&["A", "A", "B", "B"]).unwrap();
    let c = d.group_contrast("B", "A").unwrap();
    cfg.set_design(d, c);
    cfg
}

#[test]
fn single_differential_region() {
    let res = run(&config(), &libraries(None), &contigs()).unwrap();
    // Windows without fragments fall below the minimum count
    assert_eq!(res.n_counted(), 60 * 4 + 5);
    assert_eq!(res.clusters().n_clusters(), 61);
    assert_eq!(res.n_significant(0.05), 1);

    let (k, r) = res
        .regions()
        .iter()
        .enumerate()
        .find(|(_, r)| r.fdr().map(|q| q < 0.05).unwrap_or(false))
        .unwrap();
    let iv = &res.clusters().regions()[k];
    assert_eq!((iv.start(), iv.end()), (DB_START, DB_START + 209));
    let s = r.summary().unwrap();
    assert_eq!(s.n_windows, 5);
    assert_eq!((s.n_up, s.n_down), (0, 5));
    assert_eq!(s.direction, Direction::Down);
    assert!(s.rep_log_fc < -2.0);

    let table = res.region_table().to_string();
    assert_eq!(table.lines().count(), 62);
    assert!(table.starts_with("chrom\tstart\tend"));
    assert_eq!(res.window_table().to_string().lines().count(), 246);
}

#[test]
fn query_regions_use_overlapping_windows() {
    let res = run(&config(), &libraries(None), &contigs()).unwrap();
    let ctg: Contig = Arc::from("chr1");
    let iv = |s: usize, e: usize| GenomicInterval::new(&ctg, s, e, Strand::Unstranded).unwrap();
    // Covers the first two differential windows, a null site and an empty stretch
    let q = IntervalSet::new(vec![
        iv(DB_START - 500, DB_START + 60),
        iv(5001, 5100),
        iv(190_001, 191_000),
    ]);
    let r = res.combine_queries(&q, &CombineParams::default()).unwrap();
    assert_eq!(r.len(), 3);
    let by_start: Vec<(usize, &RegionResult)> = q.iter().map(|x| x.start()).zip(r.iter()).collect();
    for (s, r) in by_start {
        match s {
            5001 => assert_eq!(r.summary().unwrap().n_windows, 2),
            190_001 => assert_eq!(*r, RegionResult::NoData),
            _ => {
                let x = r.summary().unwrap();
                assert_eq!(x.n_windows, 2);
                assert!(x.p_value < 1e-3);
            }
        }
    }
}

#[test]
fn empty_library_completes() {
    let res = run(&config(), &libraries(Some(3)), &contigs()).unwrap();
    let w = res.windows();
    assert!(w.n_windows() > 0);
    assert!((0..w.n_windows()).all(|i| w.count(i, 3) == 0));
    assert_eq!(w.lib_sizes()[3], 0);
    assert_eq!(res.regions().len(), res.clusters().n_clusters());
}

#[test]
fn trended_normalization_with_proportion_filter() {
    let mut cfg = config();
    cfg.set_filter(FilterConfig {
        mode: FilterMode::Proportion,
        proportion: 0.1,
        ..Default::default()
    });
    cfg.set_normalization(NormStrategy::Trended, TrimParams::default());
    let res = run(&cfg, &libraries(None), &contigs()).unwrap();
    // 4000 tiles on the contig, so the top 10% keeps every counted window
    assert_eq!(res.windows().n_windows(), res.n_counted());
    assert!(res.normalization().factors().is_none());
}

#[test]
fn local_filter_with_filtered_normalization() {
    let mut cfg = config();
    cfg.set_filter(FilterConfig {
        mode: FilterMode::Local,
        ..Default::default()
    });
    cfg.set_normalization(NormStrategy::Filtered, TrimParams::default());
    let res = run(&cfg, &libraries(None), &contigs()).unwrap();
    // Sites are at least 1.8kb apart so every window stands well above its flanks
    assert_eq!(res.windows().n_windows(), res.n_counted());
    let f = res.normalization().factors().unwrap().factors();
    assert_eq!(f.len(), 4);
    assert!(f.iter().all(|x| (x - 1.0).abs() < 0.2));
    assert_eq!(res.n_significant(0.05), 1);
    let s = res
        .regions()
        .iter()
        .filter_map(|r| r.summary())
        .find(|s| s.fdr < 0.05)
        .unwrap();
    assert_eq!((s.n_windows, s.direction), (5, Direction::Down));
}

#[test]
fn stranded_windows_form_separate_regions() {
    let mut cfg = config();
    cfg.set_strand_mode(StrandMode::Split);
    let res = run(&cfg, &libraries(None), &contigs()).unwrap();
    // Fragments alternate strands, so both strands of every site pass the minimum count
    assert_eq!(res.n_counted(), 2 * (60 * 4 + 5));
    assert_eq!(res.windows().n_windows(), res.n_counted());
    assert_eq!(res.clusters().n_clusters(), 2 * 61);
    let regions = res.clusters().regions();
    assert!(regions.iter().all(|r| r.strand() != Strand::Unstranded));

    let sig: Vec<(&GenomicInterval, &RegionResult)> = regions
        .iter()
        .zip(res.regions())
        .filter(|(_, r)| r.fdr().map(|q| q < 0.05).unwrap_or(false))
        .collect();
    assert_eq!(sig.len(), 2);
    let strands: Vec<Strand> = sig.iter().map(|(iv, _)| iv.strand()).collect();
    assert!(strands.contains(&Strand::Forward) && strands.contains(&Strand::Reverse));
    for (iv, r) in sig {
        assert_eq!((iv.start(), iv.end()), (DB_START, DB_START + 209));
        let s = r.summary().unwrap();
        assert_eq!((s.n_windows, s.n_down), (5, 5));
    }
}

#[test]
fn restriction_to_missing_contig_fails() {
    let mut cfg = config();
    cfg.set_chromosomes(vec!["chr2".to_string()]);
    assert!(run(&cfg, &libraries(None), &contigs()).is_err());
}
