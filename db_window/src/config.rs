use std::path::{Path, PathBuf};

use db_core::{config::AnalysisConfig, counter::ContigInfo};

use crate::sample::Sample;

pub struct Config {
    analysis: AnalysisConfig,
    sample_list: Vec<Sample>,
    ctg_list: Vec<ContigInfo>,
    query_file: Option<PathBuf>,
    output_file: Option<PathBuf>,
    window_file: Option<PathBuf>,
    query_output_file: Option<PathBuf>,
}

impl Config {
    pub fn new(
        analysis: AnalysisConfig,
        sample_list: Vec<Sample>,
        ctg_list: Vec<ContigInfo>,
        output_file: Option<PathBuf>,
    ) -> Self {
        Self {
            analysis,
            sample_list,
            ctg_list,
            query_file: None,
            output_file,
            window_file: None,
            query_output_file: None,
        }
    }

    pub fn set_window_file(&mut self, p: Option<PathBuf>) {
        self.window_file = p
    }

    pub fn set_queries(&mut self, input: PathBuf, output: Option<PathBuf>) {
        self.query_file = Some(input);
        self.query_output_file = output;
    }

    pub fn analysis(&self) -> &AnalysisConfig {
        &self.analysis
    }

    pub fn sample_list(&self) -> &[Sample] {
        &self.sample_list
    }

    pub fn ctg_list(&self) -> &[ContigInfo] {
        &self.ctg_list
    }

    pub fn output_file(&self) -> Option<&Path> {
        self.output_file.as_deref()
    }

    pub fn window_file(&self) -> Option<&Path> {
        self.window_file.as_deref()
    }

    pub fn query_file(&self) -> Option<&Path> {
        self.query_file.as_deref()
    }

    pub fn query_output_file(&self) -> Option<&Path> {
        self.query_output_file.as_deref()
    }
}
