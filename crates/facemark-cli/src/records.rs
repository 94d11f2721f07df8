//! Per-photo records written by `ingest` and read back by `search`.
//!
//! Each ingested photo `<stem>.<ext>` produces `<stem>.wm.jpg` and a
//! `<stem>.json` record in the output directory. Photos sharing a stem are
//! keyed by their full file name instead.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use facemark_core::{Candidate, FaceDescriptor, FaceEncoding};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

pub const WATERMARK_SUFFIX: &str = ".wm.jpg";
pub const RECORD_SUFFIX: &str = ".json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Found,
    NoFace,
    EncodingFailed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhotoRecord {
    pub id: String,
    pub source: PathBuf,
    pub watermarked: PathBuf,
    pub width: u32,
    pub height: u32,
    pub outcome: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub descriptor: Option<FaceDescriptor>,
    pub ingested_at: DateTime<Utc>,
}

/// Reference data attached to each search candidate.
#[derive(Debug, Clone, Serialize)]
pub struct PhotoRef {
    pub source: PathBuf,
    pub watermarked: PathBuf,
}

impl PhotoRecord {
    pub fn new(
        id: String,
        source: PathBuf,
        watermarked: PathBuf,
        width: u32,
        height: u32,
        encoding: FaceEncoding,
    ) -> Self {
        let (outcome, reason, descriptor) = match encoding {
            FaceEncoding::Found(d) => (Outcome::Found, None, Some(d)),
            FaceEncoding::NoFaceDetected => (Outcome::NoFace, None, None),
            FaceEncoding::EncodingFailed { reason } => (Outcome::EncodingFailed, Some(reason), None),
        };
        Self {
            id,
            source,
            watermarked,
            width,
            height,
            outcome,
            reason,
            descriptor,
            ingested_at: Utc::now(),
        }
    }

    pub fn save(&self, dir: &Path) -> Result<PathBuf> {
        let path = dir.join(format!("{}{RECORD_SUFFIX}", self.id));
        let json = serde_json::to_vec_pretty(self)?;
        std::fs::write(&path, json).with_context(|| format!("writing {}", path.display()))?;
        Ok(path)
    }

    pub fn into_candidate(self) -> Option<Candidate<PhotoRef>> {
        let descriptor = self.descriptor?;
        Some(Candidate {
            id: self.id,
            descriptor,
            metadata: PhotoRef {
                source: self.source,
                watermarked: self.watermarked,
            },
        })
    }
}

/// Read every record in `dir`. Unreadable records are skipped with a warning.
pub fn load_records(dir: &Path) -> Result<Vec<PhotoRecord>> {
    let mut records = Vec::new();
    let entries = std::fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))?;
    for entry in entries {
        let path = entry?.path();
        if !path.is_file() || !is_record(&path) {
            continue;
        }
        let parsed = std::fs::read(&path)
            .map_err(anyhow::Error::from)
            .and_then(|bytes| serde_json::from_slice::<PhotoRecord>(&bytes).map_err(Into::into));
        match parsed {
            Ok(record) => records.push(record),
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping unreadable record"),
        }
    }
    records.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(records)
}

/// Source photos in `dir` paired with their record ids, skipping files this
/// tool wrote itself.
///
/// The id is the file stem unless another source shares it (`a.jpg` and
/// `a.png`), in which case the full file name is used so no two photos
/// write the same outputs.
pub fn source_photos(dir: &Path) -> Result<Vec<(String, PathBuf)>> {
    let mut photos = Vec::new();
    let entries = std::fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))?;
    for entry in entries {
        let path = entry?.path();
        if path.is_file() && !is_record(&path) && !is_watermarked(&path) {
            photos.push(path);
        }
    }
    photos.sort();
    Ok(assign_ids(photos))
}

fn assign_ids(photos: Vec<PathBuf>) -> Vec<(String, PathBuf)> {
    let mut stems: HashMap<String, usize> = HashMap::new();
    for path in &photos {
        *stems.entry(record_id(path)).or_default() += 1;
    }

    let mut taken = HashSet::new();
    photos
        .into_iter()
        .map(|path| {
            let stem = record_id(&path);
            let mut id = if stems[&stem] > 1 {
                file_name(&path)
            } else {
                stem
            };
            let base = id.clone();
            let mut n = 1;
            while !taken.insert(id.clone()) {
                n += 1;
                id = format!("{base}-{n}");
            }
            (id, path)
        })
        .collect()
}

pub fn record_id(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "photo".to_string())
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "photo".to_string())
}

fn is_record(path: &Path) -> bool {
    path.to_string_lossy().ends_with(RECORD_SUFFIX)
}

fn is_watermarked(path: &Path) -> bool {
    path.to_string_lossy().ends_with(WATERMARK_SUFFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("facemark-records-{name}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn record(id: &str, encoding: FaceEncoding) -> PhotoRecord {
        PhotoRecord::new(
            id.to_string(),
            PathBuf::from(format!("/in/{id}.jpg")),
            PathBuf::from(format!("/out/{id}.wm.jpg")),
            1000,
            667,
            encoding,
        )
    }

    #[test]
    fn test_outcome_from_encoding() {
        let found = record("a", FaceEncoding::Found(FaceDescriptor::new(vec![0.1, 0.2])));
        assert_eq!(found.outcome, Outcome::Found);
        assert!(found.descriptor.is_some());

        let none = record("b", FaceEncoding::NoFaceDetected);
        assert_eq!(none.outcome, Outcome::NoFace);
        assert!(none.into_candidate().is_none());

        let failed = record(
            "c",
            FaceEncoding::EncodingFailed {
                reason: "alignment".into(),
            },
        );
        assert_eq!(failed.outcome, Outcome::EncodingFailed);
        assert_eq!(failed.reason.as_deref(), Some("alignment"));
    }

    #[test]
    fn test_save_and_load_records() {
        let dir = scratch_dir("load");
        record("b", FaceEncoding::NoFaceDetected).save(&dir).unwrap();
        record("a", FaceEncoding::Found(FaceDescriptor::with_model(vec![1.0, 0.0], "m")))
            .save(&dir)
            .unwrap();
        std::fs::write(dir.join("broken.json"), b"{not json").unwrap();

        let records = load_records(&dir).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id, "a");
        assert_eq!(
            records[0].descriptor.as_ref().unwrap().model_version.as_deref(),
            Some("m")
        );
        assert!(records[1].descriptor.is_none());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_source_photos_skip_outputs() {
        let dir = scratch_dir("sources");
        for name in ["a.jpg", "a.wm.jpg", "a.json", "b.png"] {
            std::fs::write(dir.join(name), b"x").unwrap();
        }
        let photos = source_photos(&dir).unwrap();
        let names: Vec<_> = photos
            .iter()
            .map(|(_, p)| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.jpg", "b.png"]);
        let ids: Vec<_> = photos.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_shared_stems_get_distinct_ids() {
        let dir = scratch_dir("stems");
        for name in ["a.jpg", "a.png", "b.jpg"] {
            std::fs::write(dir.join(name), b"x").unwrap();
        }
        let photos = source_photos(&dir).unwrap();
        let ids: Vec<_> = photos.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["a.jpg", "a.png", "b"]);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_assign_ids_never_collide() {
        // "a.jpg.png" has stem "a.jpg", the full name of the first photo.
        let photos = vec![
            PathBuf::from("/in/a.jpg"),
            PathBuf::from("/in/a.jpg.png"),
            PathBuf::from("/in/a.png"),
        ];
        let ids: Vec<_> = assign_ids(photos).into_iter().map(|(id, _)| id).collect();
        let unique: HashSet<_> = ids.iter().collect();
        assert_eq!(unique.len(), 3, "{ids:?}");
    }

    #[test]
    fn test_record_id_is_file_stem() {
        assert_eq!(record_id(Path::new("/x/IMG_0042.JPG")), "IMG_0042");
    }
}
