//! Intake: segment a chapter source into chapters and stage its page images.
//!
//! Layout accepted:
//!
//! ```text
//! <folder>/
//!   01-introduction/   page-1.png  page-2.jpg ...
//!   02-installation/   scan_001.png ...
//!   03-upgrade.docx
//! ```
//!
//! Each sub-folder is one chapter (id = folder name, sanitised), and so is
//! each `.docx` file (id = file stem). A folder with images but no
//! sub-folders or documents is a single chapter named after the folder, and
//! a `.docx` path given directly is a single chapter.
//!
//! Folder images (`png`, `jpg`, `jpeg`) are ordered by the first number in
//! their file name. Document pages are the images under `word/media/`, in
//! archive order. Every page is re-encoded as RGB PNG and stored under the
//! page-image keys, then one `pending` chapter record is written per
//! chapter, carrying the SHA-256 of its source. Staging a chapter whose
//! record already carries the same digest is a no-op.

use crate::error::PipelineError;
use crate::model::{natural_key, Chapter, ChapterId, JobId, PageImage};
use crate::pipeline::assemble::sha256_hex;
use crate::pipeline::encode;
use crate::store::{get_json, put_json, ArtifactKey, ArtifactStore, StoreError};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const IMAGE_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];
const DOCX_MEDIA_PREFIX: &str = "word/media/";

/// Where one chapter's pages come from.
#[derive(Debug)]
enum ChapterSource {
    Images(Vec<PathBuf>),
    Docx(PathBuf),
}

/// Stage every chapter found in `source` (a folder or a `.docx` file).
/// Returns the chapter records in chapter order.
pub async fn stage_folder(
    store: &dyn ArtifactStore,
    job: &JobId,
    source: &Path,
) -> Result<Vec<Chapter>, PipelineError> {
    let root = source.to_path_buf();
    let layout = tokio::task::spawn_blocking(move || scan_layout(&root))
        .await
        .map_err(|e| PipelineError::Internal(format!("folder scan task failed: {e}")))??;

    if layout.is_empty() {
        return Err(PipelineError::NoChapters { job: job.clone() });
    }
    info!(
        "Intake: job {} from {} ({} chapters)",
        job,
        source.display(),
        layout.len()
    );

    let mut chapters = Vec::with_capacity(layout.len());
    for (chapter, origin) in layout {
        let (images, digest) = match origin {
            ChapterSource::Images(files) => {
                let images = read_images(&files).await?;
                let digest = pages_digest(&images);
                (images, digest)
            }
            ChapterSource::Docx(path) => {
                let bytes = read_source(&path).await?;
                let digest = sha256_hex(&bytes);
                let media = tokio::task::spawn_blocking(move || docx_media(&path, bytes))
                    .await
                    .map_err(|e| PipelineError::Internal(format!("docx task failed: {e}")))??;
                (media, digest)
            }
        };
        if images.is_empty() {
            warn!("Intake: chapter {} has no page images", chapter);
        }
        chapters.push(stage_pages(store, job, chapter, images, digest).await?);
    }
    Ok(chapters)
}

/// Stage one chapter from in-memory image bytes (page order = vector order).
pub async fn stage_chapter_images(
    store: &dyn ArtifactStore,
    job: &JobId,
    chapter: ChapterId,
    images: Vec<Vec<u8>>,
) -> Result<Chapter, PipelineError> {
    let named: Vec<_> = images
        .into_iter()
        .enumerate()
        .map(|(i, bytes)| (PathBuf::from(format!("{chapter}/page-{i}")), bytes))
        .collect();
    let digest = pages_digest(&named);
    stage_pages(store, job, chapter, named, digest).await
}

async fn read_source(path: &Path) -> Result<Vec<u8>, PipelineError> {
    tokio::fs::read(path)
        .await
        .map_err(|source| PipelineError::SourceUnreadable {
            path: path.to_path_buf(),
            source,
        })
}

async fn read_images(files: &[PathBuf]) -> Result<Vec<(PathBuf, Vec<u8>)>, PipelineError> {
    let mut images = Vec::with_capacity(files.len());
    for path in files {
        images.push((path.clone(), read_source(path).await?));
    }
    Ok(images)
}

/// Digest of an ordered page set: each page's length, then its bytes.
fn pages_digest(images: &[(PathBuf, Vec<u8>)]) -> String {
    let mut hasher = Sha256::new();
    for (_, bytes) in images {
        hasher.update((bytes.len() as u64).to_le_bytes());
        hasher.update(bytes);
    }
    format!("{:x}", hasher.finalize())
}

/// The record already staged for `chapter`, if it came from the same source.
async fn unchanged_record(
    store: &dyn ArtifactStore,
    job: &JobId,
    chapter: &ChapterId,
    digest: &str,
) -> Result<Option<Chapter>, PipelineError> {
    match get_json::<Chapter>(store, &ArtifactKey::chapter_record(job, chapter)).await {
        Ok(existing) if existing.source_digest.as_deref() == Some(digest) => Ok(Some(existing)),
        Ok(_) | Err(StoreError::NotFound { .. }) | Err(StoreError::Corrupt { .. }) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn stage_pages(
    store: &dyn ArtifactStore,
    job: &JobId,
    chapter: ChapterId,
    images: Vec<(PathBuf, Vec<u8>)>,
    digest: String,
) -> Result<Chapter, PipelineError> {
    if let Some(existing) = unchanged_record(store, job, &chapter, &digest).await? {
        info!(
            "Intake: chapter {} unchanged since last intake, keeping it {}",
            chapter, existing.status
        );
        return Ok(existing);
    }

    let mut pages = Vec::with_capacity(images.len());
    for (page_index, (path, bytes)) in images.into_iter().enumerate() {
        let source = path.clone();
        let png = tokio::task::spawn_blocking(move || {
            encode::decode(&bytes).and_then(|img| encode::png_bytes(&img))
        })
        .await
        .map_err(|e| PipelineError::Internal(format!("image task failed: {e}")))?
        .map_err(|e| PipelineError::UnreadableImage {
            path: source,
            detail: e.to_string(),
        })?;

        let key = ArtifactKey::page_image(job, &chapter, page_index);
        debug!("Intake: {} → {}", path.display(), key);
        store.put(&key, png).await?;
        pages.push(PageImage {
            chapter: chapter.clone(),
            page_index,
            image: key,
        });
    }

    let record = Chapter::new(chapter, pages).with_source_digest(digest);
    put_json(store, &ArtifactKey::chapter_record(job, &record.id), &record).await?;
    Ok(record)
}

/// Image parts under `word/media/`, in archive order. Other media (EMF,
/// WMF, ...) are skipped.
fn docx_media(path: &Path, bytes: Vec<u8>) -> Result<Vec<(PathBuf, Vec<u8>)>, PipelineError> {
    let unreadable = |detail: String| PipelineError::UnreadableDocument {
        path: path.to_path_buf(),
        detail,
    };
    let mut archive =
        zip::ZipArchive::new(Cursor::new(bytes)).map_err(|e| unreadable(e.to_string()))?;

    let mut media = Vec::new();
    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|e| unreadable(e.to_string()))?;
        let name = entry.name().to_string();
        if entry.is_dir() || !name.starts_with(DOCX_MEDIA_PREFIX) {
            continue;
        }
        if !is_image(Path::new(&name)) {
            warn!("Intake: skipping {} in {}", name, path.display());
            continue;
        }
        let mut data = Vec::new();
        entry
            .read_to_end(&mut data)
            .map_err(|e| unreadable(format!("{name}: {e}")))?;
        media.push((path.join(&name), data));
    }
    debug!("Intake: {} has {} media images", path.display(), media.len());
    Ok(media)
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .map(|n| {
            let n = n.to_string_lossy();
            // `~$name.docx` is Word's lock file.
            n.starts_with('.') || n.starts_with("~$")
        })
        .unwrap_or(true)
}

fn has_extension(path: &Path, extensions: &[&str]) -> bool {
    path.extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .is_some_and(|e| extensions.contains(&e.as_str()))
}

fn is_image(path: &Path) -> bool {
    has_extension(path, &IMAGE_EXTENSIONS)
}

fn is_docx(path: &Path) -> bool {
    path.is_file() && has_extension(path, &["docx"])
}

fn read_entries(dir: &Path) -> Result<Vec<PathBuf>, PipelineError> {
    let unreadable = |source| PipelineError::SourceUnreadable {
        path: dir.to_path_buf(),
        source,
    };
    let mut out = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(unreadable)? {
        let path = entry.map_err(unreadable)?.path();
        if !is_hidden(&path) {
            out.push(path);
        }
    }
    Ok(out)
}

fn sort_naturally(paths: &mut [PathBuf]) {
    paths.sort_by(|a, b| {
        let an = a.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
        let bn = b.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
        natural_key(&an).cmp(&natural_key(&bn))
    });
}

fn images_in(dir: &Path) -> Result<Vec<PathBuf>, PipelineError> {
    let mut files: Vec<PathBuf> = read_entries(dir)?
        .into_iter()
        .filter(|p| p.is_file() && is_image(p))
        .collect();
    sort_naturally(&mut files);
    Ok(files)
}

/// Chapter id of a sub-folder (its name) or a document (its stem).
fn chapter_id(path: &Path) -> Result<ChapterId, PipelineError> {
    let name = if path.is_dir() {
        path.file_name()
    } else {
        path.file_stem()
    };
    ChapterId::sanitized(&name.map(|n| n.to_string_lossy().into_owned()).unwrap_or_default())
}

/// Chapters (in chapter order) with their page sources.
fn scan_layout(source: &Path) -> Result<Vec<(ChapterId, ChapterSource)>, PipelineError> {
    if is_docx(source) {
        return Ok(vec![(
            chapter_id(source)?,
            ChapterSource::Docx(source.to_path_buf()),
        )]);
    }
    if !source.is_dir() {
        return Err(PipelineError::SourceNotFound {
            path: source.to_path_buf(),
        });
    }
    let entries = read_entries(source)?;
    let chapters: Vec<&PathBuf> = entries
        .iter()
        .filter(|p| p.is_dir() || is_docx(p))
        .collect();

    let mut layout = Vec::new();
    if chapters.is_empty() {
        let files = images_in(source)?;
        if !files.is_empty() {
            layout.push((chapter_id(source)?, ChapterSource::Images(files)));
        }
    } else {
        let mut seen = BTreeSet::new();
        for path in chapters {
            let id = chapter_id(path)?;
            if !seen.insert(id.as_str().to_string()) {
                return Err(PipelineError::InvalidConfig(format!(
                    "two chapter sources map to the same chapter id '{id}'"
                )));
            }
            let pages = if path.is_dir() {
                ChapterSource::Images(images_in(path)?)
            } else {
                ChapterSource::Docx(path.clone())
            };
            layout.push((id, pages));
        }
    }
    layout.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(layout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChapterStatus, StageName};
    use crate::store::MemoryStore;
    use image::{DynamicImage, RgbImage};
    use std::fs;
    use std::io::Write;
    use zip::write::FileOptions;

    fn png() -> Vec<u8> {
        png_sized(4, 4)
    }

    fn png_sized(width: u32, height: u32) -> Vec<u8> {
        encode::png_bytes(&DynamicImage::ImageRgb8(RgbImage::new(width, height))).unwrap()
    }

    fn jpeg() -> Vec<u8> {
        let mut buf = Vec::new();
        DynamicImage::ImageRgb8(RgbImage::new(4, 4))
            .write_to(&mut std::io::Cursor::new(&mut buf), image::ImageFormat::Jpeg)
            .unwrap();
        buf
    }

    /// A minimal Word package holding `parts` in the given order.
    fn docx(parts: &[(&str, Vec<u8>)]) -> Vec<u8> {
        let mut zip = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
        let options: FileOptions<'_, ()> = FileOptions::default();
        zip.start_file("word/document.xml", options).unwrap();
        zip.write_all(b"<w:document/>").unwrap();
        for (name, bytes) in parts {
            zip.start_file(*name, options).unwrap();
            zip.write_all(bytes).unwrap();
        }
        zip.finish().unwrap().into_inner()
    }

    async fn record(store: &MemoryStore, job: &JobId, chapter: &str) -> Chapter {
        let key = ArtifactKey::chapter_record(job, &ChapterId::new(chapter).unwrap());
        get_json(store, &key).await.unwrap()
    }

    #[tokio::test]
    async fn stages_chapter_folders_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("Install Guide");
        for (chapter, files) in [
            ("10-appendix", vec!["image_1.png"]),
            ("2-setup", vec!["image_10.png", "image_2.jpg", "notes.txt"]),
            ("01-intro", vec!["image_1.png"]),
        ] {
            fs::create_dir_all(root.join(chapter)).unwrap();
            for f in files {
                let bytes = if f.ends_with(".jpg") { jpeg() } else { png() };
                fs::write(root.join(chapter).join(f), bytes).unwrap();
            }
        }
        fs::create_dir_all(root.join(".cache")).unwrap();

        let store = MemoryStore::new();
        let job = JobId::new("guide").unwrap();
        let chapters = stage_folder(&store, &job, &root).await.unwrap();

        let ids: Vec<&str> = chapters.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["01-intro", "2-setup", "10-appendix"]);

        let setup = &chapters[1];
        assert_eq!(setup.pages.len(), 2);
        assert_eq!(setup.pages[0].image.as_str(), "jobs/guide/pages/2-setup/00000.png");
        assert_eq!(setup.pages[1].page_index, 1);

        // The JPEG was normalised to PNG.
        let staged = store.get(&setup.pages[0].image).await.unwrap();
        assert_eq!(&staged[1..4], b"PNG");

        let record = store
            .get(&ArtifactKey::chapter_record(&job, &setup.id))
            .await
            .unwrap();
        let record: Chapter = serde_json::from_slice(&record).unwrap();
        assert_eq!(record.status, crate::model::ChapterStatus::Pending);
    }

    #[tokio::test]
    async fn flat_folder_is_one_chapter() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("vm-provisioning");
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join("image_1.png"), png()).unwrap();

        let store = MemoryStore::new();
        let job = JobId::new("j").unwrap();
        let chapters = stage_folder(&store, &job, &root).await.unwrap();
        assert_eq!(chapters.len(), 1);
        assert_eq!(chapters[0].id.as_str(), "vm-provisioning");
    }

    #[tokio::test]
    async fn missing_and_empty_folders_are_errors() {
        let store = MemoryStore::new();
        let job = JobId::new("j").unwrap();
        let dir = tempfile::tempdir().unwrap();

        let missing = stage_folder(&store, &job, &dir.path().join("nope")).await;
        assert!(matches!(missing, Err(PipelineError::SourceNotFound { .. })));

        let empty = stage_folder(&store, &job, dir.path()).await;
        assert!(matches!(empty, Err(PipelineError::NoChapters { .. })));
    }

    #[tokio::test]
    async fn undecodable_images_are_rejected_at_intake() {
        let store = MemoryStore::new();
        let job = JobId::new("j").unwrap();
        let err = stage_chapter_images(
            &store,
            &job,
            ChapterId::new("01").unwrap(),
            vec![png(), b"garbage".to_vec()],
        )
        .await
        .unwrap_err();
        assert!(matches!(err, PipelineError::UnreadableImage { .. }), "got: {err}");
    }

    #[tokio::test]
    async fn docx_chapters_take_media_images_in_archive_order() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("manual");
        fs::create_dir_all(root.join("01-intro")).unwrap();
        fs::write(root.join("01-intro").join("page-1.png"), png()).unwrap();
        let package = docx(&[
            ("word/media/image2.jpeg", jpeg()),
            ("word/media/image1.png", png_sized(6, 2)),
            ("word/media/image3.emf", b"vector".to_vec()),
        ]);
        fs::write(root.join("02-Upgrade Notes.docx"), &package).unwrap();
        fs::write(root.join("~$Upgrade Notes.docx"), b"lock").unwrap();

        let store = MemoryStore::new();
        let job = JobId::new("manual").unwrap();
        let chapters = stage_folder(&store, &job, &root).await.unwrap();

        let ids: Vec<&str> = chapters.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["01-intro", "02-Upgrade-Notes"]);

        let upgrade = &chapters[1];
        assert_eq!(upgrade.pages.len(), 2);
        let mut sizes = Vec::new();
        for page in &upgrade.pages {
            let staged = store.get(&page.image).await.unwrap();
            assert_eq!(&staged[1..4], b"PNG");
            let img = image::load_from_memory(&staged).unwrap();
            sizes.push((img.width(), img.height()));
        }
        assert_eq!(sizes, vec![(4, 4), (6, 2)]);
        assert_eq!(upgrade.source_digest.as_deref(), Some(sha256_hex(&package).as_str()));
    }

    #[tokio::test]
    async fn single_docx_source_is_one_chapter() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vm-provisioning.docx");
        fs::write(&path, docx(&[("word/media/image1.png", png())])).unwrap();

        let store = MemoryStore::new();
        let job = JobId::new("j").unwrap();
        let chapters = stage_folder(&store, &job, &path).await.unwrap();
        assert_eq!(chapters.len(), 1);
        assert_eq!(chapters[0].id.as_str(), "vm-provisioning");
        assert_eq!(chapters[0].pages.len(), 1);
    }

    #[tokio::test]
    async fn damaged_docx_is_rejected_at_intake() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.docx");
        fs::write(&path, b"PK not really a zip").unwrap();

        let store = MemoryStore::new();
        let err = stage_folder(&store, &JobId::new("j").unwrap(), &path)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::UnreadableDocument { .. }), "got: {err}");
    }

    #[tokio::test]
    async fn unchanged_sources_keep_their_chapter_records() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("guide");
        fs::create_dir_all(root.join("01-intro")).unwrap();
        fs::write(root.join("01-intro").join("page-1.png"), png()).unwrap();
        fs::write(
            root.join("02-setup.docx"),
            docx(&[("word/media/image1.png", png())]),
        )
        .unwrap();

        let store = MemoryStore::new();
        let job = JobId::new("guide").unwrap();
        stage_folder(&store, &job, &root).await.unwrap();

        // Both chapters get converted before the source is staged again.
        for id in ["01-intro", "02-setup"] {
            let mut converted = record(&store, &job, id).await;
            converted.mark(ChapterStatus::MarkdownDone, StageName::Markdown);
            put_json(&store, &ArtifactKey::chapter_record(&job, &converted.id), &converted)
                .await
                .unwrap();
        }
        let before = record(&store, &job, "02-setup").await;

        let again = stage_folder(&store, &job, &root).await.unwrap();
        assert!(again.iter().all(|c| c.status == ChapterStatus::MarkdownDone));
        let after = record(&store, &job, "02-setup").await;
        assert_eq!(after.updated_at, before.updated_at);
        assert_eq!(after.source_digest, before.source_digest);

        // A changed page is a new source: that chapter starts over.
        fs::write(root.join("01-intro").join("page-1.png"), png_sized(8, 8)).unwrap();
        let changed = stage_folder(&store, &job, &root).await.unwrap();
        assert_eq!(changed[0].status, ChapterStatus::Pending);
        assert_eq!(changed[1].status, ChapterStatus::MarkdownDone);
    }
}
