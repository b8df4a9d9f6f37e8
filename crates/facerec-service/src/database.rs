//! Startup enrolment: fills the template index from an image directory
//! or a template file.

use crate::engine::{EngineError, EngineHandle};
use anyhow::{Context as _, Result};
use facerec_core::template::load_templates_file;
use facerec_core::{DynamicTemplateIndex, Error};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp", "bmp"];
const PROGRESS_EVERY: usize = 100;

pub fn is_supported_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.iter().any(|known| e.eq_ignore_ascii_case(known)))
        .unwrap_or(false)
}

/// Supported images under `dir`, recursively, in file name order.
pub fn collect_images(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut images = Vec::new();
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.with_context(|| format!("walking {}", dir.display()))?;
        if entry.file_type().is_file() && is_supported_image(entry.path()) {
            images.push(entry.into_path());
        }
    }
    Ok(images)
}

/// Enrol one template per image, adding at most `max_license_count`
/// templates on top of whatever the index already holds.
///
/// Images without exactly one face, or whose id (file name) is already
/// enrolled, are skipped. A full index stops enrolment. Returns the number
/// of templates added.
pub async fn enroll_images(
    engine: &EngineHandle,
    index: &DynamicTemplateIndex,
    images: &[PathBuf],
    max_license_count: usize,
) -> Result<usize> {
    let limit = max_license_count.min(images.len());
    let mut added = 0;
    tracing::info!(images = images.len(), limit, "building template index");

    for path in images {
        if added >= limit {
            break;
        }
        let id = match path.file_name().and_then(|n| n.to_str()) {
            Some(name) => name.to_string(),
            None => {
                tracing::warn!(path = %path.display(), "skipping image with non UTF-8 name");
                continue;
            }
        };
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;

        let template = match engine.template(bytes).await {
            Ok(t) => t,
            Err(EngineError::Facerec(e)) => {
                tracing::warn!(path = %path.display(), error = %e, "skipping image");
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        match index.add(&template, &id) {
            Ok(()) => added += 1,
            Err(Error::DuplicateId(id)) => {
                tracing::warn!(path = %path.display(), id = %id, "skipping image with an enrolled id");
                continue;
            }
            Err(Error::CapacityExceeded { capacity }) => {
                tracing::warn!(capacity, "template index is full");
                break;
            }
            Err(e) => return Err(e.into()),
        }
        if added % PROGRESS_EVERY == 0 {
            tracing::info!(added, limit, "enrolment progress");
        }
    }

    tracing::info!(added, size = index.size()?, "template index built");
    Ok(added)
}

/// Enrol every template stored back to back in `path`, with ids `<file stem>#<n>`.
pub fn enroll_templates_file(index: &DynamicTemplateIndex, path: &Path) -> Result<usize> {
    let templates = load_templates_file(path).with_context(|| format!("loading templates from {}", path.display()))?;
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ids: Vec<String> = (0..templates.len()).map(|i| format!("{stem}#{i}")).collect();
    index.add_many(&templates, &ids)?;
    tracing::info!(path = %path.display(), count = templates.len(), "templates enrolled");
    Ok(templates.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::spawn_engine;
    use crate::engine::test_support::{engine, method, png};
    use facerec_core::IndexConfig;

    fn write(dir: &Path, name: &str, bytes: &[u8]) {
        std::fs::write(dir.join(name), bytes).unwrap();
    }

    #[test]
    fn test_supported_extensions() {
        assert!(is_supported_image(Path::new("a/b.JPG")));
        assert!(is_supported_image(Path::new("face.webp")));
        assert!(!is_supported_image(Path::new("notes.txt")));
        assert!(!is_supported_image(Path::new("jpg")));
    }

    #[test]
    fn test_collect_images_recurses_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        write(dir.path(), "b.png", b"");
        write(dir.path(), "a.jpeg", b"");
        write(dir.path(), "readme.md", b"");
        write(&dir.path().join("nested"), "c.bmp", b"");

        let names: Vec<_> = collect_images(dir.path())
            .unwrap()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.jpeg", "b.png", "c.bmp"]);
    }

    #[tokio::test]
    async fn test_enroll_skips_bad_images_and_honours_limit() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "1_two_faces.png", &png(8, [1, 2, 3]));
        write(dir.path(), "2_broken.png", b"garbage");
        write(dir.path(), "3_alice.png", &png(4, [255, 0, 0]));
        write(dir.path(), "4_bob.png", &png(4, [0, 255, 0]));
        write(dir.path(), "5_carol.png", &png(4, [0, 0, 255]));

        let handle = spawn_engine(engine()).unwrap();
        let index = DynamicTemplateIndex::create(IndexConfig::new(method(), 10)).unwrap();
        let images = collect_images(dir.path()).unwrap();

        let added = enroll_images(&handle, &index, &images, 2).await.unwrap();
        assert_eq!(added, 2);
        assert_eq!(index.uuid_at(0).unwrap(), "3_alice.png");
        assert_eq!(index.uuid_at(1).unwrap(), "4_bob.png");
    }

    #[tokio::test]
    async fn test_enroll_on_top_of_existing_entries() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "alice.png", &png(4, [255, 0, 0]));
        write(dir.path(), "bob.png", &png(4, [0, 255, 0]));
        write(dir.path(), "carol.png", &png(4, [0, 0, 255]));

        let handle = spawn_engine(engine()).unwrap();
        let index = DynamicTemplateIndex::create(IndexConfig::new(method(), 6)).unwrap();
        for i in 0..4 {
            let t = facerec_core::ContextTemplate::new(method(), facerec_core::Embedding { values: vec![i as f32, 1.0, 0.0] });
            index.add(&t, &format!("saved#{i}")).unwrap();
        }
        let images = collect_images(dir.path()).unwrap();

        let added = enroll_images(&handle, &index, &images, 3).await.unwrap();
        assert_eq!(added, 2);
        assert_eq!(index.size().unwrap(), 6);
        assert_eq!(index.uuid_at(4).unwrap(), "alice.png");
        assert_eq!(index.uuid_at(5).unwrap(), "bob.png");
    }

    #[test]
    fn test_enroll_templates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gallery.bin");
        let mut bytes = Vec::new();
        for values in [[1.0, 0.0], [0.0, 1.0]] {
            let t = facerec_core::ContextTemplate::new(method(), facerec_core::Embedding { values: values.to_vec() });
            t.save(&mut bytes).unwrap();
        }
        std::fs::write(&path, bytes).unwrap();

        let index = DynamicTemplateIndex::create(IndexConfig::new(method(), 10)).unwrap();
        assert_eq!(enroll_templates_file(&index, &path).unwrap(), 2);
        assert_eq!(index.uuid_at(1).unwrap(), "gallery#1");
    }
}
