//! Run outputs: the labeled CSV manifest and the optional sample export.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use acquire::WorkItem;
use anyhow::Context;
use linegeo::SampleRecord;

pub const MANIFEST_HEADER: &str = "lat,lon,image_name,target";

#[derive(Debug, Clone, PartialEq)]
pub struct ManifestEntry {
    pub lat: f64,
    pub lon: f64,
    /// File name of the primary raster, relative to the output directory.
    pub image_name: String,
    pub target: u8,
}

impl ManifestEntry {
    pub fn for_item(item: &WorkItem, target: u8) -> Self {
        Self {
            lat: item.lat,
            lon: item.lon,
            image_name: format!("{}.tif", item.identifier),
            target,
        }
    }
}

/// Write `entries` as CSV, replacing `path` only once the whole file is out.
pub fn write_manifest(path: &Path, entries: &[ManifestEntry]) -> anyhow::Result<()> {
    write_atomically(path, |out| {
        writeln!(out, "{MANIFEST_HEADER}")?;
        for e in entries {
            // Identifiers are hex plus underscores; nothing needs quoting.
            writeln!(out, "{},{},{},{}", e.lat, e.lon, e.image_name, e.target)?;
        }
        Ok(())
    })
}

/// One JSON object per line, in traversal order.
pub fn write_samples_jsonl(path: &Path, samples: &[SampleRecord]) -> anyhow::Result<()> {
    write_atomically(path, |out| {
        for sample in samples {
            serde_json::to_writer(&mut *out, sample)?;
            out.write_all(b"\n")?;
        }
        Ok(())
    })
}

fn write_atomically(
    path: &Path,
    body: impl FnOnce(&mut BufWriter<File>) -> anyhow::Result<()>,
) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".partial");
    let tmp = PathBuf::from(tmp);

    let file = File::create(&tmp).with_context(|| format!("failed to create {}", tmp.display()))?;
    let mut out = BufWriter::new(file);
    let written = body(&mut out).and_then(|()| {
        out.flush()?;
        Ok(())
    });
    if let Err(e) = written {
        let _ = fs::remove_file(&tmp);
        return Err(e.context(format!("failed to write {}", path.display())));
    }
    drop(out);

    fs::rename(&tmp, path)
        .with_context(|| format!("failed to move {} into place", path.display()))
}
