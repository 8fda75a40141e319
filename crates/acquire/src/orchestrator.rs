use std::any::Any;
use std::fmt;
use std::fs;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use linegeo::BoundingBox;
use log::{debug, info, warn};
use rayon::prelude::*;

use crate::provider::{
    CompositeRequest, ImageryOptions, ImageryProvider, MaterializeTarget, MaterializedImage,
    ProviderError,
};

/// One image to acquire.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkItem {
    pub lat: f64,
    pub lon: f64,
    pub year: i32,
    /// File-name-safe identifier; the primary raster lands at `<identifier>.tif`.
    pub identifier: String,
    pub destination_folder: PathBuf,
    pub sequence_index: usize,
}

impl WorkItem {
    pub fn destination_path(&self) -> PathBuf {
        self.destination_folder
            .join(format!("{}.tif", self.identifier))
    }

    /// Destination of a non-primary band.
    pub fn band_path(&self, band: &str) -> PathBuf {
        self.destination_folder
            .join(format!("{}_{band}.tif", self.identifier))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AcquisitionStatus {
    Success,
    /// Destination already present; nothing was requested.
    Skipped,
    Failed,
}

impl fmt::Display for AcquisitionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AcquisitionStatus::Success => "success",
            AcquisitionStatus::Skipped => "skipped",
            AcquisitionStatus::Failed => "failed",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AcquisitionOutcome {
    pub identifier: String,
    pub status: AcquisitionStatus,
    pub error: Option<String>,
}

impl AcquisitionOutcome {
    fn new(item: &WorkItem, status: AcquisitionStatus, error: Option<String>) -> Self {
        Self {
            identifier: item.identifier.clone(),
            status,
            error,
        }
    }
}

/// Per-status counts of a batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AcquisitionSummary {
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl AcquisitionSummary {
    pub fn from_outcomes(outcomes: &[AcquisitionOutcome]) -> Self {
        outcomes.iter().fold(Self::default(), |mut acc, o| {
            match o.status {
                AcquisitionStatus::Success => acc.succeeded += 1,
                AcquisitionStatus::Skipped => acc.skipped += 1,
                AcquisitionStatus::Failed => acc.failed += 1,
            }
            acc
        })
    }

    pub fn total(&self) -> usize {
        self.succeeded + self.skipped + self.failed
    }
}

impl std::ops::Add for AcquisitionSummary {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            succeeded: self.succeeded + rhs.succeeded,
            skipped: self.skipped + rhs.skipped,
            failed: self.failed + rhs.failed,
        }
    }
}

impl fmt::Display for AcquisitionSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} succeeded, {} skipped, {} failed",
            self.succeeded, self.skipped, self.failed
        )
    }
}

#[derive(Debug, Clone)]
pub struct AcquireOptions {
    /// Worker pool size.
    pub workers: usize,
    /// Side length of the square requested around each point (metres).
    pub side_length_m: f64,
    pub imagery: ImageryOptions,
    /// Where providers write temporary archives and directories.
    pub staging_dir: PathBuf,
    /// Re-acquire even if the destination exists.
    pub force: bool,
}

impl Default for AcquireOptions {
    fn default() -> Self {
        Self {
            workers: 8,
            side_length_m: 2000.0,
            imagery: ImageryOptions::default(),
            staging_dir: PathBuf::from("staging"),
            force: false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AcquireError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("i/o on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("provider produced no raster for band {band}")]
    MissingArtifact { band: String },

    #[error("failed to build worker pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
}

/// Fans work items out over a fixed-size pool.
pub struct Orchestrator {
    provider: Arc<dyn ImageryProvider>,
    options: AcquireOptions,
    pool: rayon::ThreadPool,
}

impl Orchestrator {
    pub fn new(
        provider: Arc<dyn ImageryProvider>,
        options: AcquireOptions,
    ) -> Result<Self, AcquireError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(options.workers.max(1))
            .thread_name(|i| format!("acquire-{i}"))
            .build()?;

        Ok(Self {
            provider,
            options,
            pool,
        })
    }

    pub fn options(&self) -> &AcquireOptions {
        &self.options
    }

    /// One outcome per item. Order across items is not meaningful.
    pub fn acquire(&self, items: &[WorkItem]) -> Vec<AcquisitionOutcome> {
        info!(
            "acquiring {} items on {} workers...",
            items.len(),
            self.pool.current_num_threads()
        );

        self.pool.install(|| {
            items
                .par_iter()
                .map(|item| {
                    // Guards inside `fetch` clean up while unwinding.
                    panic::catch_unwind(AssertUnwindSafe(|| self.acquire_one(item)))
                        .unwrap_or_else(|payload| panicked(item, payload.as_ref()))
                })
                .collect()
        })
    }

    fn acquire_one(&self, item: &WorkItem) -> AcquisitionOutcome {
        let destination = item.destination_path();

        if !self.options.force && destination.is_file() {
            debug!("file {} already exists, skipping", destination.display());
            return AcquisitionOutcome::new(item, AcquisitionStatus::Skipped, None);
        }

        info!("downloading image {} ({})...", item.sequence_index, item.identifier);
        match self.fetch(item, &destination) {
            Ok(()) => AcquisitionOutcome::new(item, AcquisitionStatus::Success, None),
            Err(err) => {
                warn!(
                    "could not download image {} @ {} {}: {}",
                    item.identifier, item.lat, item.lon, err
                );
                AcquisitionOutcome::new(item, AcquisitionStatus::Failed, Some(err.to_string()))
            }
        }
    }

    fn fetch(&self, item: &WorkItem, destination: &Path) -> Result<(), AcquireError> {
        let region = BoundingBox::around(item.lat, item.lon, self.options.side_length_m);
        let request = CompositeRequest::for_year(region, item.year, &self.options.imagery);

        let image = self.provider.composite(&request)?;
        let target = MaterializeTarget {
            name: format!("{}.tmp", item.identifier),
            scale: self.options.imagery.scale,
            staging_dir: self.options.staging_dir.clone(),
        };
        let produced = self.provider.materialize(&image, &target)?;
        let intermediates = Intermediates::new(&produced);

        fs::create_dir_all(&item.destination_folder).map_err(|source| AcquireError::Io {
            path: item.destination_folder.clone(),
            source,
        })?;

        // Primary band goes last: its presence marks a complete item.
        let mut placed = PlacedFiles::default();
        for (i, band) in request.bands.iter().enumerate().rev() {
            let source = produced
                .raster_for(band)
                .ok_or_else(|| AcquireError::MissingArtifact { band: band.clone() })?;
            let dest = if i == 0 {
                destination.to_path_buf()
            } else {
                item.band_path(band)
            };
            place_file(source, &dest)?;
            placed.push(dest);
        }

        intermediates.remove()?;
        placed.commit();
        Ok(())
    }
}

fn panicked(item: &WorkItem, payload: &(dyn Any + Send)) -> AcquisitionOutcome {
    let reason = payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_owned());

    warn!(
        "image {} @ {} {} panicked: {reason}",
        item.identifier, item.lat, item.lon
    );
    AcquisitionOutcome::new(
        item,
        AcquisitionStatus::Failed,
        Some(format!("panicked: {reason}")),
    )
}

/// Archive and directory a provider left in staging.
///
/// Removed explicitly on success; removed on drop if an error cut the item short.
struct Intermediates {
    archive: Option<PathBuf>,
    work_dir: Option<PathBuf>,
}

impl Intermediates {
    fn new(produced: &MaterializedImage) -> Self {
        Self {
            archive: produced.archive.clone(),
            work_dir: produced.work_dir.clone(),
        }
    }

    fn remove(mut self) -> Result<(), AcquireError> {
        if let Some(archive) = self.archive.take() {
            remove_if_present(&archive, |p| fs::remove_file(p))?;
        }
        if let Some(dir) = self.work_dir.take() {
            remove_if_present(&dir, |p| fs::remove_dir_all(p))?;
        }
        Ok(())
    }
}

impl Drop for Intermediates {
    fn drop(&mut self) {
        if let Some(archive) = self.archive.take() {
            if let Err(e) = remove_if_present(&archive, |p| fs::remove_file(p)) {
                warn!("cleanup: {e}");
            }
        }
        if let Some(dir) = self.work_dir.take() {
            if let Err(e) = remove_if_present(&dir, |p| fs::remove_dir_all(p)) {
                warn!("cleanup: {e}");
            }
        }
    }
}

/// Destination files written by the current attempt, rolled back unless committed.
#[derive(Default)]
struct PlacedFiles(Vec<PathBuf>);

impl PlacedFiles {
    fn push(&mut self, path: PathBuf) {
        self.0.push(path);
    }

    fn commit(mut self) {
        self.0.clear();
    }
}

impl Drop for PlacedFiles {
    fn drop(&mut self) {
        for path in self.0.drain(..) {
            debug!("rolling back {}", path.display());
            let _ = fs::remove_file(&path);
        }
    }
}

fn remove_if_present(
    path: &Path,
    remove: impl FnOnce(&Path) -> io::Result<()>,
) -> Result<(), AcquireError> {
    match remove(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(AcquireError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Move `source` to `dest` atomically.
///
/// Falls back to copy-then-rename through a `.partial` sibling when a plain
/// rename fails (e.g. staging on another filesystem).
fn place_file(source: &Path, dest: &Path) -> Result<(), AcquireError> {
    if fs::rename(source, dest).is_ok() {
        return Ok(());
    }

    let mut partial = dest.as_os_str().to_owned();
    partial.push(".partial");
    let partial = PathBuf::from(partial);

    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source| AcquireError::Io { path, source }
    };

    let copied = fs::copy(source, &partial)
        .map_err(io_err(source))
        .and_then(|_| fs::rename(&partial, dest).map_err(io_err(dest)));
    if copied.is_err() {
        let _ = fs::remove_file(&partial);
    }
    copied
}
