// On-disk canvas layout.
//
// {data_dir}/canvases/{id}.json.gz        authoritative snapshot
// {data_dir}/backups/{id}-{ts}.json.gz    timestamped copies

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use canvasync_common::types::CanvasSnapshot;
use chrono::Utc;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use uuid::Uuid;

use crate::validation::{validate_snapshot, Limits};

const CANVAS_FILE_EXT: &str = "json.gz";

#[derive(Debug, Clone)]
pub struct CanvasFiles {
    canvases_dir: PathBuf,
    backups_dir: PathBuf,
}

impl CanvasFiles {
    pub fn new(data_dir: impl AsRef<Path>) -> Result<Self> {
        let canvases_dir = data_dir.as_ref().join("canvases");
        let backups_dir = data_dir.as_ref().join("backups");
        for dir in [&canvases_dir, &backups_dir] {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create directory `{}`", dir.display()))?;
        }
        Ok(Self { canvases_dir, backups_dir })
    }

    pub fn canvas_path(&self, canvas_id: &str) -> PathBuf {
        self.canvases_dir.join(format!("{canvas_id}.{CANVAS_FILE_EXT}"))
    }

    /// Serialize, compress and atomically replace the canvas file.
    /// Returns the compressed size.
    pub fn write(&self, snapshot: &CanvasSnapshot) -> Result<u64> {
        let json = serde_json::to_vec(snapshot).context("failed to serialize canvas snapshot")?;
        let mut encoder = GzEncoder::new(Vec::with_capacity(json.len() / 4), Compression::default());
        encoder.write_all(&json).context("failed to compress canvas snapshot")?;
        let compressed = encoder.finish().context("failed to finish canvas compression")?;

        let target_path = self.canvas_path(&snapshot.canvas_id);
        let tmp_path = self.canvases_dir.join(format!(
            ".{}.{}.tmp",
            snapshot.canvas_id,
            Uuid::new_v4().simple()
        ));

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)
            .with_context(|| format!("failed to open temp canvas file `{}`", tmp_path.display()))?;
        let written = file
            .write_all(&compressed)
            .and_then(|()| file.sync_data())
            .with_context(|| format!("failed to write temp canvas file `{}`", tmp_path.display()));
        drop(file);
        if let Err(error) = written {
            let _ = fs::remove_file(&tmp_path);
            return Err(error);
        }

        fs::rename(&tmp_path, &target_path).with_context(|| {
            format!(
                "failed to atomically move canvas `{}` to `{}`",
                tmp_path.display(),
                target_path.display()
            )
        })?;

        Ok(compressed.len() as u64)
    }

    /// Read and validate a canvas file. `Ok(None)` when none exists; any
    /// decoding or validation failure is an error for the caller to absorb.
    pub fn read(&self, canvas_id: &str, limits: &Limits) -> Result<Option<CanvasSnapshot>> {
        let path = self.canvas_path(canvas_id);
        if !path.exists() {
            return Ok(None);
        }

        let file = File::open(&path)
            .with_context(|| format!("failed to open canvas `{}`", path.display()))?;
        // Cap the inflated size so a hostile file cannot balloon memory.
        let max_bytes = limits.max_snapshot_bytes as u64 + 1;
        let mut json = Vec::new();
        GzDecoder::new(file)
            .take(max_bytes)
            .read_to_end(&mut json)
            .with_context(|| format!("canvas `{}` is not valid gzip", path.display()))?;
        if json.len() as u64 >= max_bytes {
            bail!("canvas `{}` exceeds {} bytes", path.display(), limits.max_snapshot_bytes);
        }

        let snapshot: CanvasSnapshot = serde_json::from_slice(&json)
            .with_context(|| format!("canvas `{}` has an invalid schema", path.display()))?;
        if snapshot.canvas_id != canvas_id {
            bail!(
                "canvas `{}` claims id `{}`",
                path.display(),
                snapshot.canvas_id
            );
        }
        validate_snapshot(&snapshot, limits)
            .with_context(|| format!("canvas `{}` failed validation", path.display()))?;

        Ok(Some(snapshot))
    }

    /// Copy the durable canvas file into the backup set.
    pub fn backup(&self, canvas_id: &str) -> Result<Option<PathBuf>> {
        let source = self.canvas_path(canvas_id);
        if !source.exists() {
            return Ok(None);
        }

        let stamp = Utc::now().format("%Y%m%dT%H%M%S%3fZ");
        let target = self.backups_dir.join(format!("{canvas_id}-{stamp}.{CANVAS_FILE_EXT}"));
        fs::copy(&source, &target).with_context(|| {
            format!("failed to copy `{}` to `{}`", source.display(), target.display())
        })?;
        Ok(Some(target))
    }

    /// Keep the newest `keep` backups of `canvas_id` by modification time.
    /// Returns how many were removed.
    pub fn prune_backups(&self, canvas_id: &str, keep: usize) -> Result<usize> {
        let prefix = format!("{canvas_id}-");
        let suffix = format!(".{CANVAS_FILE_EXT}");
        let mut backups = Vec::new();
        for entry in fs::read_dir(&self.backups_dir).with_context(|| {
            format!("failed to list backups in `{}`", self.backups_dir.display())
        })? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.starts_with(&prefix) || !name.ends_with(&suffix) {
                continue;
            }
            let modified = entry.metadata()?.modified()?;
            backups.push((modified, entry.path()));
        }

        if backups.len() <= keep {
            return Ok(0);
        }

        // Newest first; ties fall back to the timestamped name.
        backups.sort_by(|(left_time, left_path), (right_time, right_path)| {
            right_time.cmp(left_time).then_with(|| right_path.cmp(left_path))
        });
        let mut removed = 0;
        for (_, path) in backups.into_iter().skip(keep) {
            fs::remove_file(&path)
                .with_context(|| format!("failed to remove backup `{}`", path.display()))?;
            removed += 1;
        }
        Ok(removed)
    }

    /// Ids of every canvas with a durable file.
    pub fn list_canvas_ids(&self) -> Result<Vec<String>> {
        let suffix = format!(".{CANVAS_FILE_EXT}");
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.canvases_dir).with_context(|| {
            format!("failed to list canvases in `{}`", self.canvases_dir.display())
        })? {
            let entry = entry?;
            if let Some(id) = entry.file_name().to_str().and_then(|name| name.strip_suffix(&suffix))
            {
                if !id.starts_with('.') {
                    ids.push(id.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    pub fn backups_dir(&self) -> &Path {
        &self.backups_dir
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, SystemTime};

    use canvasync_common::types::{Stroke, StrokePoint};
    use tempfile::tempdir;

    use super::*;

    fn snapshot_with_stroke(canvas_id: &str) -> CanvasSnapshot {
        let mut snapshot = CanvasSnapshot::empty(canvas_id);
        snapshot.background = "#fafafa".into();
        snapshot.strokes.push(Stroke {
            id: "s-1".into(),
            owner_id: "u1".into(),
            color: "#ff0000".into(),
            width: 4.0,
            points: vec![StrokePoint { x: 0.1, y: 0.2, t: 1 }, StrokePoint { x: 0.15, y: 0.25, t: 2 }],
            completed: true,
            forced_end: false,
            start_time: Utc::now(),
            end_time: Some(Utc::now()),
            server_sequence: 4,
        });
        snapshot.last_sequence = 4;
        snapshot
    }

    #[test]
    fn write_then_read_reproduces_snapshot() {
        let dir = tempdir().unwrap();
        let files = CanvasFiles::new(dir.path()).unwrap();
        let snapshot = snapshot_with_stroke("main");

        let written = files.write(&snapshot).unwrap();
        assert!(written > 0);
        let loaded = files.read("main", &Limits::default()).unwrap().unwrap();
        assert_eq!(loaded, snapshot);
    }

    #[test]
    fn write_leaves_no_temp_files() {
        let dir = tempdir().unwrap();
        let files = CanvasFiles::new(dir.path()).unwrap();
        files.write(&snapshot_with_stroke("main")).unwrap();
        files.write(&CanvasSnapshot::empty("main")).unwrap();

        let names = fs::read_dir(dir.path().join("canvases"))
            .unwrap()
            .map(|entry| entry.unwrap().file_name().into_string().unwrap())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["main.json.gz".to_string()]);
    }

    #[test]
    fn missing_file_reads_as_none() {
        let dir = tempdir().unwrap();
        let files = CanvasFiles::new(dir.path()).unwrap();
        assert!(files.read("nothing", &Limits::default()).unwrap().is_none());
    }

    #[test]
    fn corrupt_or_foreign_files_are_errors() {
        let dir = tempdir().unwrap();
        let files = CanvasFiles::new(dir.path()).unwrap();

        fs::write(files.canvas_path("garbage"), b"not gzip at all").unwrap();
        assert!(files.read("garbage", &Limits::default()).is_err());

        files.write(&snapshot_with_stroke("other")).unwrap();
        fs::copy(files.canvas_path("other"), files.canvas_path("renamed")).unwrap();
        assert!(files.read("renamed", &Limits::default()).is_err());
    }

    #[test]
    fn oversized_file_is_rejected_on_read() {
        let dir = tempdir().unwrap();
        let files = CanvasFiles::new(dir.path()).unwrap();
        files.write(&snapshot_with_stroke("main")).unwrap();

        let tight = Limits { max_snapshot_bytes: 32, ..Limits::default() };
        assert!(files.read("main", &tight).is_err());
    }

    #[test]
    fn backups_are_pruned_oldest_first() {
        let dir = tempdir().unwrap();
        let files = CanvasFiles::new(dir.path()).unwrap();
        files.write(&snapshot_with_stroke("main")).unwrap();

        let base = SystemTime::now() - Duration::from_secs(3_600);
        let mut created = Vec::new();
        for offset in 0..4u64 {
            let path = files.backups_dir().join(format!("main-2026010{offset}T000000000Z.json.gz"));
            fs::copy(files.canvas_path("main"), &path).unwrap();
            let file = File::options().write(true).open(&path).unwrap();
            file.set_modified(base + Duration::from_secs(offset * 60)).unwrap();
            created.push(path);
        }
        let other = files.backups_dir().join("sketch-20260101T000000000Z.json.gz");
        fs::copy(files.canvas_path("main"), &other).unwrap();

        assert_eq!(files.prune_backups("main", 2).unwrap(), 2);
        assert!(!created[0].exists());
        assert!(!created[1].exists());
        assert!(created[2].exists());
        assert!(created[3].exists());
        assert!(other.exists());
    }

    #[test]
    fn backup_of_missing_canvas_is_skipped() {
        let dir = tempdir().unwrap();
        let files = CanvasFiles::new(dir.path()).unwrap();
        assert!(files.backup("main").unwrap().is_none());

        files.write(&CanvasSnapshot::empty("main")).unwrap();
        let path = files.backup("main").unwrap().unwrap();
        assert!(path.exists());
    }

    #[test]
    fn list_ignores_temp_files() {
        let dir = tempdir().unwrap();
        let files = CanvasFiles::new(dir.path()).unwrap();
        files.write(&CanvasSnapshot::empty("main")).unwrap();
        files.write(&CanvasSnapshot::empty("board-2")).unwrap();
        fs::write(dir.path().join("canvases/.main.abc.tmp"), b"").unwrap();

        assert_eq!(files.list_canvas_ids().unwrap(), vec!["board-2".to_string(), "main".to_string()]);
    }
}
