use anyhow::{anyhow, Context, Result};
use std::path::{Path, PathBuf};

use super::{HubClient, HubError};

/// One file part from a training upload request.
#[derive(Clone, Debug)]
pub struct TrainingImage {
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

impl TrainingImage {
    fn is_image(&self) -> bool {
        self.content_type
            .as_deref()
            .is_some_and(|ct| ct.starts_with("image/"))
    }
}

/// Images written to `<upload_dir>/<training_id>/`.
#[derive(Clone, Debug)]
pub struct StagedUpload {
    pub training_id: String,
    pub object_name: String,
    pub files: Vec<PathBuf>,
}

impl StagedUpload {
    /// Push every staged file to the hub's contents API.
    pub fn push(&self, client: &HubClient) -> Result<(), HubError> {
        client.ensure_server_running()?;
        for path in &self.files {
            let bytes = std::fs::read(path).map_err(|e| {
                HubError::Protocol(format!("cannot read staged {}: {}", path.display(), e))
            })?;
            let file_name = path
                .file_name()
                .and_then(|name| name.to_str())
                .unwrap_or_default();
            client.upload_image(&self.object_name, file_name, &bytes)?;
            log::debug!("hub: uploaded {}/{}", self.object_name, file_name);
        }
        Ok(())
    }
}

/// Write the image parts of an upload to disk as `<object>_<n>.jpg`.
///
/// Non-image parts are skipped. Fails when the object name is not a single
/// path component or no part is an image.
pub fn stage_images(
    upload_dir: &Path,
    object_name: &str,
    images: &[TrainingImage],
) -> Result<StagedUpload> {
    let object_name = object_name.trim();
    if object_name.is_empty()
        || object_name == "."
        || object_name == ".."
        || object_name.contains(['/', '\\'])
    {
        return Err(anyhow!("invalid object name '{}'", object_name));
    }
    if !images.iter().any(TrainingImage::is_image) {
        return Err(anyhow!("No valid image files found"));
    }

    let training_id = hex::encode(rand::random::<[u8; 16]>());
    let dir = upload_dir.join(&training_id);
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("create upload directory {}", dir.display()))?;

    let mut files = Vec::new();
    for image in images.iter().filter(|image| image.is_image()) {
        let path = dir.join(format!("{}_{}.jpg", object_name, files.len() + 1));
        std::fs::write(&path, &image.bytes)
            .with_context(|| format!("write {}", path.display()))?;
        files.push(path);
    }

    Ok(StagedUpload {
        training_id,
        object_name: object_name.to_string(),
        files,
    })
}

/// Remove every staged upload directory; returns how many were removed.
pub fn clear_staged(upload_dir: &Path) -> Result<usize> {
    let entries = match std::fs::read_dir(upload_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e).with_context(|| format!("read {}", upload_dir.display())),
    };
    let mut removed = 0;
    for entry in entries {
        let path = entry?.path();
        if path.is_dir() {
            std::fs::remove_dir_all(&path)
                .with_context(|| format!("remove {}", path.display()))?;
            removed += 1;
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(ct: &str) -> TrainingImage {
        TrainingImage {
            content_type: Some(ct.to_string()),
            bytes: vec![0xFF, 0xD8, 0xFF],
        }
    }

    #[test]
    fn stages_only_image_parts() {
        let dir = tempfile::tempdir().unwrap();
        let staged = stage_images(
            dir.path(),
            "alice",
            &[image("image/jpeg"), image("text/plain"), image("image/png")],
        )
        .unwrap();

        assert_eq!(staged.files.len(), 2);
        assert!(staged.files[0].ends_with(format!("{}/alice_1.jpg", staged.training_id)));
        assert!(staged.files[1].ends_with("alice_2.jpg"));
        assert_eq!(std::fs::read(&staged.files[0]).unwrap(), vec![0xFF, 0xD8, 0xFF]);
    }

    #[test]
    fn rejects_uploads_without_images() {
        let dir = tempfile::tempdir().unwrap();
        let err = stage_images(dir.path(), "alice", &[image("text/plain")]).unwrap_err();
        assert!(err.to_string().contains("No valid image"));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn rejects_path_like_object_names() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["", "..", "a/b", "a\\b"] {
            assert!(stage_images(dir.path(), name, &[image("image/jpeg")]).is_err());
        }
    }

    #[test]
    fn clear_removes_staged_directories() {
        let dir = tempfile::tempdir().unwrap();
        stage_images(dir.path(), "a", &[image("image/jpeg")]).unwrap();
        stage_images(dir.path(), "b", &[image("image/jpeg")]).unwrap();
        std::fs::write(dir.path().join("keep.txt"), b"x").unwrap();

        assert_eq!(clear_staged(dir.path()).unwrap(), 2);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
        assert_eq!(clear_staged(&dir.path().join("missing")).unwrap(), 0);
    }
}
