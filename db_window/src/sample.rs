use std::path::{Path, PathBuf};

use anyhow::Context;
use compress_io::compress::CompressIo;
use utils::get_next_line;

pub struct Sample {
    name: String,
    group: String,
    path: PathBuf,
}

impl Sample {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Reading sample list file
/// Each line should contain the sample name, the experimental group and the path to
/// the alignment BED file for the sample.  Relative paths are taken relative to dir
/// if given.  Lines starting with '#' and short lines are skipped.
pub fn read_sample_list_from_file<P: AsRef<Path>>(
    fname: P,
    dir: Option<&Path>,
) -> anyhow::Result<Vec<Sample>> {
    debug!("Reading in sample list from {}", fname.as_ref().display());

    let mut rdr = CompressIo::new().path(&fname).bufreader()?;

    let mut buf = String::new();
    let mut line = 0;
    let mut sample_vec: Vec<Sample> = Vec::new();

    while let Some(fields) = get_next_line(&mut rdr, &mut buf).with_context(|| {
        format!(
            "Error after reading {} lines from {}",
            line,
            fname.as_ref().display()
        )
    })? {
        line += 1;
        if fields.len() < 3 || fields[0].starts_with('#') {
            continue;
        }
        if sample_vec.iter().any(|s| s.name == fields[0]) {
            return Err(anyhow!(
                "{}:{} Duplicate sample name {}",
                fname.as_ref().display(),
                line,
                fields[0]
            ));
        }
        let p = PathBuf::from(fields[2]);
        let path = match dir {
            Some(d) if p.is_relative() => d.join(p),
            _ => p,
        };
        trace!("Sample {} (group {}): {}", fields[0], fields[1], path.display());
        sample_vec.push(Sample {
            name: fields[0].to_owned(),
            group: fields[1].to_owned(),
            path,
        })
    }

    debug!(
        "Finished reading in {} lines; found {} samples",
        line,
        sample_vec.len()
    );

    if sample_vec.is_empty() {
        Err(anyhow!(
            "No samples found in {}",
            fname.as_ref().display()
        ))
    } else {
        Ok(sample_vec)
    }
}
