//! [`ImageryProvider`] backed by an external helper executable.
//!
//! The helper does the actual service work (authentication, compositing,
//! export) and leaves `<out-dir>/<name>.zip` behind. This side unpacks the
//! archive into `<out-dir>/<name>/` and maps `*.<band>.tif` entries to bands.

use std::ffi::OsString;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use log::debug;

use crate::provider::{
    CompositeRequest, ImageHandle, ImageryProvider, MaterializeTarget, MaterializedImage,
    ProviderError,
};

#[derive(Debug, Clone)]
pub struct CommandProvider {
    program: PathBuf,
    extra_args: Vec<OsString>,
}

impl CommandProvider {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            extra_args: Vec::new(),
        }
    }

    /// Arguments placed before the generated ones (e.g. a script path).
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.extra_args.extend(args.into_iter().map(Into::into));
        self
    }

    fn command_line(&self, image: &ImageHandle, target: &MaterializeTarget) -> Command {
        let req = &image.request;
        let [w, s, e, n] = req.region.to_rectangle();

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.extra_args)
            .arg("--bbox")
            .arg(format!("{w},{s},{e},{n}"))
            .arg("--start")
            .arg(&req.start_date)
            .arg("--end")
            .arg(&req.end_date)
            .arg("--bands")
            .arg(req.bands.join(","))
            .arg("--max-cloud-cover")
            .arg(req.max_cloud_cover.to_string())
            .arg("--collection")
            .arg(&req.collection)
            .arg("--scale")
            .arg(target.scale.to_string())
            .arg("--name")
            .arg(&target.name)
            .arg("--out-dir")
            .arg(&target.staging_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        cmd
    }
}

impl ImageryProvider for CommandProvider {
    fn composite(&self, request: &CompositeRequest) -> Result<ImageHandle, ProviderError> {
        if request.bands.is_empty() {
            return Err(ProviderError::InvalidRequest("no bands selected".into()));
        }
        if !(0.0..=100.0).contains(&request.max_cloud_cover) {
            return Err(ProviderError::InvalidRequest(format!(
                "cloud cover threshold {} outside 0..=100",
                request.max_cloud_cover
            )));
        }

        // Compositing happens server-side during export.
        Ok(ImageHandle {
            request: request.clone(),
            token: None,
        })
    }

    fn materialize(
        &self,
        image: &ImageHandle,
        target: &MaterializeTarget,
    ) -> Result<MaterializedImage, ProviderError> {
        fs::create_dir_all(&target.staging_dir).map_err(|source| ProviderError::Io {
            path: target.staging_dir.clone(),
            source,
        })?;

        let archive = target.staging_dir.join(format!("{}.zip", target.name));
        let work_dir = target.staging_dir.join(&target.name);
        let command = self.program.display().to_string();

        debug!("running {command} for {}", target.name);
        let output = self
            .command_line(image, target)
            .output()
            .map_err(|source| ProviderError::Launch {
                command: command.clone(),
                source,
            })?;

        let result = if output.status.success() {
            unpack_archive(&archive, &work_dir).map(|files| MaterializedImage {
                rasters: match_bands(&files, &image.request.bands),
                archive: Some(archive.clone()),
                work_dir: Some(work_dir.clone()),
            })
        } else {
            Err(ProviderError::Command {
                command,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            })
        };

        if result.is_err() {
            remove_quietly(&archive, &work_dir);
        }
        result
    }
}

/// Extract every file of `archive` under `dest`, returning the written paths.
///
/// Entries whose names escape `dest` are skipped.
pub fn unpack_archive(archive: &Path, dest: &Path) -> Result<Vec<PathBuf>, ProviderError> {
    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source: io::Error| ProviderError::Io { path, source }
    };
    let zip_err = |source| ProviderError::Archive {
        path: archive.to_path_buf(),
        source,
    };

    let file = File::open(archive).map_err(io_err(archive))?;
    let mut zip = zip::ZipArchive::new(file).map_err(zip_err)?;

    let mut written = Vec::with_capacity(zip.len());
    for i in 0..zip.len() {
        let mut entry = zip.by_index(i).map_err(zip_err)?;
        if entry.is_dir() {
            continue;
        }
        let Some(relative) = entry.enclosed_name().map(Path::to_path_buf) else {
            debug!("skipping unsafe archive entry {:?}", entry.name());
            continue;
        };

        let out_path = dest.join(relative);
        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent).map_err(io_err(parent))?;
        }
        let mut out = File::create(&out_path).map_err(io_err(&out_path))?;
        io::copy(&mut entry, &mut out).map_err(io_err(&out_path))?;
        written.push(out_path);
    }

    Ok(written)
}

/// Pair requested bands with extracted `*.<band>.tif` files.
///
/// A lone `.tif` is taken as the only band when exactly one was requested.
pub fn match_bands(files: &[PathBuf], bands: &[String]) -> Vec<(String, PathBuf)> {
    let tifs: Vec<&PathBuf> = files
        .iter()
        .filter(|p| {
            p.extension()
                .and_then(|s| s.to_str())
                .map(|s| s.eq_ignore_ascii_case("tif") || s.eq_ignore_ascii_case("tiff"))
                .unwrap_or(false)
        })
        .collect();

    let mut matched: Vec<(String, PathBuf)> = bands
        .iter()
        .filter_map(|band| {
            tifs.iter()
                .find(|p| {
                    p.file_stem()
                        .and_then(|s| s.to_str())
                        .map(|stem| stem.ends_with(&format!(".{band}")) || stem == band.as_str())
                        .unwrap_or(false)
                })
                .map(|p| (band.clone(), (*p).clone()))
        })
        .collect();

    if matched.is_empty() && bands.len() == 1 && tifs.len() == 1 {
        matched.push((bands[0].clone(), tifs[0].clone()));
    }
    matched
}

fn remove_quietly(archive: &Path, work_dir: &Path) {
    if let Err(e) = fs::remove_file(archive) {
        if e.kind() != io::ErrorKind::NotFound {
            debug!("could not remove {}: {e}", archive.display());
        }
    }
    if let Err(e) = fs::remove_dir_all(work_dir) {
        if e.kind() != io::ErrorKind::NotFound {
            debug!("could not remove {}: {e}", work_dir.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ImageryOptions;
    use linegeo::BoundingBox;
    use std::io::Write;
    use zip::write::FileOptions;

    fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
        let mut zip = zip::ZipWriter::new(File::create(path).unwrap());
        for (name, data) in entries {
            zip.start_file(
                *name,
                FileOptions::default().compression_method(zip::CompressionMethod::Stored),
            )
            .unwrap();
            zip.write_all(data).unwrap();
        }
        zip.finish().unwrap();
    }

    fn request() -> CompositeRequest {
        CompositeRequest::for_year(
            BoundingBox::around(42.0, -84.0, 2000.0),
            2019,
            &ImageryOptions::default(),
        )
    }

    #[test]
    fn unpacks_all_entries_into_destination() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("abc.tmp.zip");
        write_zip(
            &archive,
            &[
                ("download.B8.tif", b"raster"),
                ("meta/info.txt", b"x"),
            ],
        );

        let dest = dir.path().join("abc.tmp");
        let files = unpack_archive(&archive, &dest).unwrap();

        assert_eq!(files.len(), 2);
        assert_eq!(fs::read(dest.join("download.B8.tif")).unwrap(), b"raster");
        assert!(dest.join("meta/info.txt").is_file());
    }

    #[test]
    fn corrupt_archive_is_an_archive_error() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("broken.zip");
        fs::write(&archive, b"not a zip").unwrap();

        let err = unpack_archive(&archive, &dir.path().join("out")).unwrap_err();
        assert!(matches!(err, ProviderError::Archive { .. }), "{err}");
    }

    #[test]
    fn bands_map_by_suffix() {
        let files = vec![
            PathBuf::from("w/download.B4.tif"),
            PathBuf::from("w/download.B8.tif"),
            PathBuf::from("w/download.B8.xml"),
        ];
        let bands = vec!["B8".to_string(), "B4".to_string()];

        let matched = match_bands(&files, &bands);
        assert_eq!(
            matched,
            vec![
                ("B8".to_string(), PathBuf::from("w/download.B8.tif")),
                ("B4".to_string(), PathBuf::from("w/download.B4.tif")),
            ]
        );
    }

    #[test]
    fn single_unsuffixed_raster_is_taken_for_single_band() {
        let files = vec![PathBuf::from("w/export.tif")];
        let matched = match_bands(&files, &["B8".to_string()]);
        assert_eq!(matched, vec![("B8".to_string(), PathBuf::from("w/export.tif"))]);

        assert!(match_bands(&files, &["B8".to_string(), "B4".to_string()]).is_empty());
    }

    #[test]
    fn composite_rejects_bad_requests() {
        let provider = CommandProvider::new("true");

        let mut req = request();
        req.bands.clear();
        assert!(matches!(
            provider.composite(&req),
            Err(ProviderError::InvalidRequest(_))
        ));

        let mut req = request();
        req.max_cloud_cover = 150.0;
        assert!(provider.composite(&req).is_err());

        assert!(provider.composite(&request()).is_ok());
    }

    /// Copies a prepared archive to `<out-dir>/<name>.zip` and logs its arguments.
    const EXPORT_HELPER: &str = r#"fixture="$1"; log="$2"; shift 2
printf '%s\n' "$@" > "$log"
while [ $# -gt 0 ]; do
  case "$1" in
    --name) name="$2"; shift ;;
    --out-dir) out="$2"; shift ;;
  esac
  shift
done
cp "$fixture" "$out/$name.zip"
"#;

    /// Sets up a `/bin/sh` helper run with `script`, the fixture archive and the log path.
    fn sh_provider(dir: &Path, script: &str) -> (CommandProvider, PathBuf) {
        let script_path = dir.join("helper.sh");
        fs::write(&script_path, script).unwrap();

        let fixture = dir.join("fixture.zip");
        write_zip(
            &fixture,
            &[("download.B8.tif", b"raster"), ("download.B8.tif.aux.xml", b"x")],
        );

        let log = dir.join("args.txt");
        let provider = CommandProvider::new("/bin/sh").with_args([&script_path, &fixture, &log]);
        (provider, log)
    }

    fn staging_target(dir: &Path) -> MaterializeTarget {
        MaterializeTarget {
            name: "abc_2019.tmp".into(),
            scale: 1.0,
            staging_dir: dir.join("staging"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn helper_archive_is_unpacked_and_mapped_to_bands() {
        let dir = tempfile::tempdir().unwrap();
        let (provider, log) = sh_provider(dir.path(), EXPORT_HELPER);
        let target = staging_target(dir.path());
        let image = provider.composite(&request()).unwrap();

        let produced = provider.materialize(&image, &target).unwrap();

        let work_dir = target.staging_dir.join("abc_2019.tmp");
        assert_eq!(produced.work_dir.as_deref(), Some(work_dir.as_path()));
        assert_eq!(
            produced.archive.as_deref(),
            Some(target.staging_dir.join("abc_2019.tmp.zip").as_path())
        );
        let raster = produced.raster_for("B8").unwrap();
        assert_eq!(raster, work_dir.join("download.B8.tif"));
        assert_eq!(fs::read(raster).unwrap(), b"raster");

        let args: Vec<String> = fs::read_to_string(&log)
            .unwrap()
            .lines()
            .map(str::to_owned)
            .collect();
        let value_of = |flag: &str| {
            let i = args.iter().position(|a| a == flag).unwrap();
            args[i + 1].clone()
        };
        let [w, s, e, n] = image.request.region.to_rectangle();
        assert_eq!(value_of("--bbox"), format!("{w},{s},{e},{n}"));
        assert_eq!(value_of("--start"), "2019-01-01");
        assert_eq!(value_of("--end"), "2020-01-01");
        assert_eq!(value_of("--bands"), "B8");
        assert_eq!(value_of("--collection"), "LANDSAT/LE07/C01/T1");
        assert_eq!(value_of("--name"), "abc_2019.tmp");
    }

    #[cfg(unix)]
    #[test]
    fn failing_helper_reports_stderr_and_cleans_staging() {
        let dir = tempfile::tempdir().unwrap();
        let script = format!("{EXPORT_HELPER}echo 'quota exceeded' >&2\nexit 3\n");
        let (provider, _) = sh_provider(dir.path(), &script);
        let target = staging_target(dir.path());
        let image = provider.composite(&request()).unwrap();

        let err = provider.materialize(&image, &target).unwrap_err();

        match &err {
            ProviderError::Command { stderr, status, .. } => {
                assert_eq!(stderr, "quota exceeded");
                assert!(status.contains('3'), "{status}");
            }
            other => panic!("unexpected error {other}"),
        }
        assert!(err.to_string().contains("quota exceeded"));
        assert!(!target.staging_dir.join("abc_2019.tmp.zip").exists());
        assert!(!target.staging_dir.join("abc_2019.tmp").exists());
    }

    #[cfg(unix)]
    #[test]
    fn helper_without_archive_is_cleaned_up_as_error() {
        let dir = tempfile::tempdir().unwrap();
        let (provider, _) = sh_provider(dir.path(), "exit 0\n");
        let target = staging_target(dir.path());
        let image = provider.composite(&request()).unwrap();

        let err = provider.materialize(&image, &target).unwrap_err();
        assert!(matches!(err, ProviderError::Io { .. }), "{err}");
        assert!(!target.staging_dir.join("abc_2019.tmp").exists());
    }

    #[test]
    fn missing_helper_is_a_launch_error() {
        let dir = tempfile::tempdir().unwrap();
        let provider = CommandProvider::new(dir.path().join("no-such-helper"));
        let image = provider.composite(&request()).unwrap();
        let target = MaterializeTarget {
            name: "abc.tmp".into(),
            scale: 1.0,
            staging_dir: dir.path().join("staging"),
        };

        let err = provider.materialize(&image, &target).unwrap_err();
        assert!(matches!(err, ProviderError::Launch { .. }), "{err}");
    }
}
