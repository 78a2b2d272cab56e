//! Filesystem gateway: scoped access to the media, transcript, temp and
//! model directories.
//!
//! Every path handed to the gateway is re-joined under a configured root and
//! checked with a normalized-prefix test; anything that escapes is rejected
//! before touching the disk. Transcript artifacts are written into the
//! job-scoped temp directory and atomically renamed into place, so a partial
//! write can never be mistaken for a finished artifact.

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use tracing::debug;

use crate::error::{Result, SeleniteError};
use crate::transcript::Transcript;

/// Lexically normalize a path: resolve `.` and `..` without consulting the
/// filesystem, so the containment check also covers paths that do not exist
/// yet.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Reject any candidate whose normalized form does not sit under `root`.
pub fn ensure_within(root: &Path, candidate: &Path) -> Result<PathBuf> {
    let root = normalize(root);
    let resolved = if candidate.is_absolute() {
        normalize(candidate)
    } else {
        normalize(&root.join(candidate))
    };
    if !resolved.starts_with(&root) {
        return Err(SeleniteError::PathEscape(candidate.display().to_string()));
    }
    Ok(resolved)
}

fn map_disk_error(err: std::io::Error, what: &str) -> SeleniteError {
    match err.kind() {
        ErrorKind::StorageFull | ErrorKind::QuotaExceeded => {
            SeleniteError::StorageFull(what.to_string())
        }
        ErrorKind::PermissionDenied => SeleniteError::PermissionDenied(what.to_string()),
        _ => SeleniteError::Io(err),
    }
}

pub struct FsGateway {
    storage_root: PathBuf,
    models_root: PathBuf,
}

impl FsGateway {
    /// Create the gateway and the storage layout
    /// (`media/`, `transcripts/`, `temp/`) under `storage_root`.
    pub fn new(storage_root: PathBuf, models_root: PathBuf) -> Result<Self> {
        let gateway = Self {
            storage_root: normalize(&storage_root),
            models_root: normalize(&models_root),
        };
        for dir in [gateway.media_dir(), gateway.transcripts_dir(), gateway.temp_root()] {
            std::fs::create_dir_all(&dir).map_err(|e| map_disk_error(e, "storage layout"))?;
        }
        Ok(gateway)
    }

    pub fn storage_root(&self) -> &Path {
        &self.storage_root
    }

    pub fn models_root(&self) -> &Path {
        &self.models_root
    }

    pub fn media_dir(&self) -> PathBuf {
        self.storage_root.join("media")
    }

    pub fn transcripts_dir(&self) -> PathBuf {
        self.storage_root.join("transcripts")
    }

    fn temp_root(&self) -> PathBuf {
        self.storage_root.join("temp")
    }

    /// Job-scoped scratch directory; created on first use, purged by
    /// `cleanup`. Concurrent jobs never share one.
    pub fn temp_dir(&self, job_id: &str) -> Result<PathBuf> {
        let dir = self.temp_root().join(job_id);
        std::fs::create_dir_all(&dir).map_err(|e| map_disk_error(e, "temp dir"))?;
        Ok(dir)
    }

    pub fn transcript_path(&self, job_id: &str) -> PathBuf {
        self.transcripts_dir().join(format!("{job_id}.json"))
    }

    /// Validate that `saved_path` points into the media root and exists.
    pub fn stage_media(&self, saved_path: &Path) -> Result<PathBuf> {
        let resolved = ensure_within(&self.storage_root, saved_path)?;
        if !resolved.is_file() {
            return Err(SeleniteError::NotFound(format!(
                "media file {}",
                resolved.display()
            )));
        }
        Ok(resolved)
    }

    /// Return a WAV path for the engine to consume.
    ///
    /// A `.wav` input is validated by reading its header and used in place;
    /// anything else is staged byte-for-byte into the job temp dir (full
    /// transcoding is an engine concern). The staged copy is what
    /// cancellation cleanup deletes — the original media is never touched.
    pub fn ensure_wav(&self, local_path: &Path, job_id: &str) -> Result<PathBuf> {
        let is_wav = local_path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("wav"))
            .unwrap_or(false);
        if is_wav {
            hound::WavReader::open(local_path).map_err(|e| {
                SeleniteError::InvalidConfig(format!(
                    "unreadable WAV header in {}: {e}",
                    local_path.display()
                ))
            })?;
            return Ok(local_path.to_path_buf());
        }

        let file_name = local_path
            .file_name()
            .ok_or_else(|| SeleniteError::InvalidConfig("media path has no file name".into()))?;
        let staged = self.temp_dir(job_id)?.join(file_name);
        std::fs::copy(local_path, &staged).map_err(|e| map_disk_error(e, "media staging"))?;
        debug!(job_id, staged = %staged.display(), "staged media copy");
        Ok(staged)
    }

    /// Serialize the transcript into the job temp dir, then atomically
    /// rename it to `transcripts/<job_id>.json`. Returns the final path.
    pub fn write_transcript(&self, transcript: &Transcript) -> Result<PathBuf> {
        let json = serde_json::to_vec_pretty(transcript)
            .map_err(|e| SeleniteError::InvalidState(format!("unserializable transcript: {e}")))?;
        let tmp = self
            .temp_dir(&transcript.job_id)?
            .join("transcript.json.partial");
        std::fs::write(&tmp, &json).map_err(|e| map_disk_error(e, "transcript write"))?;
        let target = self.transcript_path(&transcript.job_id);
        std::fs::rename(&tmp, &target).map_err(|e| map_disk_error(e, "transcript rename"))?;
        Ok(target)
    }

    /// Read a transcript artifact back. The deserialized payload is the same
    /// segment list the merge step produced — no lossy transforms in between.
    pub fn read_transcript(&self, job_id: &str) -> Result<Transcript> {
        let path = self.transcript_path(job_id);
        let raw = std::fs::read(&path).map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                SeleniteError::NotFound(format!("transcript file {}", path.display()))
            } else {
                map_disk_error(e, "transcript read")
            }
        })?;
        serde_json::from_slice(&raw)
            .map_err(|e| SeleniteError::InvalidState(format!("corrupt transcript artifact: {e}")))
    }

    /// Remove a transcript artifact if present.
    pub fn delete_transcript(&self, job_id: &str) -> Result<()> {
        match std::fs::remove_file(self.transcript_path(job_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(map_disk_error(e, "transcript delete")),
        }
    }

    /// Delete a stored media file; the path must sit under the media root.
    pub fn delete_media(&self, saved_path: &Path) -> Result<()> {
        let resolved = ensure_within(&self.storage_root, saved_path)?;
        match std::fs::remove_file(resolved) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(map_disk_error(e, "media delete")),
        }
    }

    /// Purge the job's temp directory.
    pub fn cleanup(&self, job_id: &str) -> Result<()> {
        let dir = self.temp_root().join(job_id);
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(map_disk_error(e, "temp cleanup")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcript::Segment;
    use tempfile::TempDir;

    fn gateway() -> (TempDir, FsGateway) {
        let dir = TempDir::new().expect("tempdir");
        let gw = FsGateway::new(dir.path().join("storage"), dir.path().join("models"))
            .expect("gateway");
        (dir, gw)
    }

    #[test]
    fn ensure_within_rejects_traversal() {
        let root = Path::new("/srv/selenite/storage");
        assert!(ensure_within(root, Path::new("media/a.wav")).is_ok());
        assert!(ensure_within(root, Path::new("/srv/selenite/storage/media/a.wav")).is_ok());
        assert!(matches!(
            ensure_within(root, Path::new("../outside.wav")),
            Err(SeleniteError::PathEscape(_))
        ));
        assert!(matches!(
            ensure_within(root, Path::new("media/../../../etc/passwd")),
            Err(SeleniteError::PathEscape(_))
        ));
        assert!(matches!(
            ensure_within(root, Path::new("/etc/passwd")),
            Err(SeleniteError::PathEscape(_))
        ));
    }

    #[test]
    fn ensure_within_normalizes_dot_components() {
        let root = Path::new("/srv/storage");
        let joined = ensure_within(root, Path::new("./media/./a.wav")).expect("join");
        assert_eq!(joined, PathBuf::from("/srv/storage/media/a.wav"));
    }

    #[test]
    fn transcript_write_read_round_trip_is_lossless() {
        let (_dir, gw) = gateway();
        let transcript = Transcript::from_segments(
            "job-1".into(),
            vec![
                Segment {
                    id: 0,
                    start_sec: 0.0,
                    end_sec: 1.0,
                    text: "hello".into(),
                    speaker: Some("SPEAKER_0".into()),
                },
                Segment {
                    id: 1,
                    start_sec: 1.0,
                    end_sec: 2.0,
                    text: "world".into(),
                    speaker: None,
                },
            ],
            vec!["SPEAKER_0".into()],
            Some("en".into()),
            2.0,
        );

        let path = gw.write_transcript(&transcript).expect("write");
        assert_eq!(path, gw.transcript_path("job-1"));
        let read = gw.read_transcript("job-1").expect("read");
        assert_eq!(read, transcript);

        // No partial file lingers after the rename.
        assert!(!gw.temp_dir("job-1").expect("temp").join("transcript.json.partial").exists());
    }

    #[test]
    fn ensure_wav_validates_headers_and_keeps_path() {
        let (_dir, gw) = gateway();
        let wav_path = gw.media_dir().join("sample.wav");
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 16_000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&wav_path, spec).expect("create wav");
        for _ in 0..160 {
            writer.write_sample(0i16).expect("sample");
        }
        writer.finalize().expect("finalize wav");

        let staged = gw.ensure_wav(&wav_path, "job-1").expect("ensure");
        assert_eq!(staged, wav_path);
    }

    #[test]
    fn ensure_wav_rejects_garbage_wav_and_stages_other_media() {
        let (_dir, gw) = gateway();
        let fake_wav = gw.media_dir().join("broken.wav");
        std::fs::write(&fake_wav, b"not a wav").expect("write");
        assert!(matches!(
            gw.ensure_wav(&fake_wav, "job-1"),
            Err(SeleniteError::InvalidConfig(_))
        ));

        let mp4 = gw.media_dir().join("clip.mp4");
        std::fs::write(&mp4, b"fake mp4 bytes").expect("write");
        let staged = gw.ensure_wav(&mp4, "job-2").expect("stage");
        assert_ne!(staged, mp4);
        assert!(staged.starts_with(gw.storage_root()));
        assert_eq!(std::fs::read(&staged).expect("read"), b"fake mp4 bytes");

        // Cleanup removes the staged copy but not the original.
        gw.cleanup("job-2").expect("cleanup");
        assert!(!staged.exists());
        assert!(mp4.exists());
    }

    #[test]
    fn delete_media_refuses_paths_outside_storage() {
        let (dir, gw) = gateway();
        let outside = dir.path().join("elsewhere.wav");
        std::fs::write(&outside, b"x").expect("write");
        assert!(matches!(
            gw.delete_media(&outside),
            Err(SeleniteError::PathEscape(_))
        ));
        assert!(outside.exists());
    }

    #[test]
    fn delete_transcript_is_idempotent() {
        let (_dir, gw) = gateway();
        gw.delete_transcript("missing").expect("noop delete");
    }
}
