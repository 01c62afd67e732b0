//! Builds catalog images from uploaded exercise bundles.

use std::fs::File;
use std::io::Cursor;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use bytes::Bytes;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::json;
use serde_json::Value;
use tempfile::TempDir;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::db::Database;
use crate::db::DatabaseError;
use crate::db::Exercise;
use crate::db::Level;
use crate::events::EventKind;
use crate::events::Journal;
use crate::runtime::ContainerRuntime;
use crate::runtime::RuntimeError;

/// File that must exist at the root of every bundle.
const DOCKERFILE: &str = "Dockerfile";

/// Metadata file that must exist at the root of every bundle.
const METADATA_FILE: &str = "metadata.json";

/// Prefix for catalog image tags.
const IMAGE_TAG_PREFIX: &str = "training";

/// Errors building an exercise bundle.
#[derive(Debug, Error)]
pub enum BuildBundleError {
    /// The bundle is malformed: unsupported archive, missing required
    /// members, or invalid metadata.
    #[error("invalid bundle: {0}")]
    InvalidBundle(String),

    /// The runtime reported a build error.
    #[error("build failed: {0}")]
    BuildFailed(String),

    /// A runtime transport error.
    #[error(transparent)]
    Runtime(RuntimeError),

    /// A database error.
    #[error(transparent)]
    Database(#[from] DatabaseError),

    /// An I/O error outside the bundle's own content.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<RuntimeError> for BuildBundleError {
    fn from(err: RuntimeError) -> Self {
        match err {
            RuntimeError::Build(msg) => BuildBundleError::BuildFailed(msg),
            other => BuildBundleError::Runtime(other),
        }
    }
}

/// The archive formats accepted for exercise bundles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArchiveKind {
    /// A `.zip` archive.
    Zip,
    /// An uncompressed `.tar` archive.
    Tar,
    /// A gzipped `.tar.gz` / `.tgz` archive.
    TarGz,
}

impl ArchiveKind {
    /// Detects the archive kind from the uploaded file name.
    fn from_filename(name: &str) -> Option<Self> {
        let name = name.to_ascii_lowercase();
        if name.ends_with(".zip") {
            Some(ArchiveKind::Zip)
        } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Some(ArchiveKind::TarGz)
        } else if name.ends_with(".tar") {
            Some(ArchiveKind::Tar)
        } else {
            None
        }
    }
}

/// Validated exercise bundle metadata.
///
/// Only the four interpreted fields are modeled; the raw mapping (including
/// unknown keys such as `goals`) is preserved verbatim in the catalog.
#[derive(Debug, Clone)]
pub struct BundleMetadata {
    /// Exercise title.
    pub title: String,
    /// Version, defaulting to `latest`.
    pub version: String,
    /// Description.
    pub description: String,
    /// Difficulty level.
    pub level: Level,
    /// The full metadata mapping as uploaded.
    pub raw: Value,
}

impl BundleMetadata {
    /// Parses and validates a `metadata.json` value.
    pub fn parse(value: Value) -> Result<Self, BuildBundleError> {
        let map = value
            .as_object()
            .ok_or_else(|| invalid("metadata.json must be a JSON object"))?;

        let title = map
            .get("title")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| invalid("metadata `title` is required and must be a non-empty string"))?
            .to_string();

        let description = map
            .get("description")
            .and_then(Value::as_str)
            .ok_or_else(|| invalid("metadata `description` is required and must be a string"))?
            .to_string();

        let level = map
            .get("level")
            .and_then(Value::as_str)
            .ok_or_else(|| invalid("metadata `level` is required and must be a string"))?;
        let level = Level::from_str(level).map_err(|e| invalid(&e))?;

        let version = match map.get("version") {
            None => String::from("latest"),
            Some(Value::String(v)) if !v.is_empty() => v.clone(),
            Some(_) => return Err(invalid("metadata `version` must be a non-empty string")),
        };

        Ok(Self {
            title,
            version,
            description,
            level,
            raw: value,
        })
    }

    /// The image tag derived from this metadata.
    pub fn image_tag(&self) -> String {
        format!("{IMAGE_TAG_PREFIX}/{}:{}", slug(&self.title), self.version)
    }
}

/// Shorthand for an invalid-bundle error.
fn invalid(message: &str) -> BuildBundleError {
    BuildBundleError::InvalidBundle(message.to_string())
}

/// Lowercases a title and replaces runs of whitespace with `-`.
pub fn slug(title: &str) -> String {
    title
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("-")
}

/// Builds catalog images from uploaded exercise bundles.
///
/// Working files are scoped to a temporary directory that is removed on
/// every exit path.
pub struct ImageBuilder {
    /// The container runtime used to build images.
    runtime: Arc<dyn ContainerRuntime>,
    /// The catalog store.
    db: Arc<dyn Database>,
    /// The event journal.
    journal: Journal,
}

impl ImageBuilder {
    /// Create a new image builder.
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        db: Arc<dyn Database>,
        journal: Journal,
    ) -> Self {
        Self {
            runtime,
            db,
            journal,
        }
    }

    /// Build an uploaded bundle into a catalog exercise.
    ///
    /// # Errors
    ///
    /// Returns [`BuildBundleError::InvalidBundle`] for malformed bundles,
    /// [`BuildBundleError::BuildFailed`] when the runtime build errors, and
    /// propagates runtime/database failures otherwise.
    pub async fn build(
        &self,
        filename: &str,
        archive: Bytes,
        subject: &str,
    ) -> Result<Exercise, BuildBundleError> {
        let kind = ArchiveKind::from_filename(filename).ok_or_else(|| {
            invalid("unsupported archive format; expected .zip, .tar, .tar.gz, or .tgz")
        })?;

        // Extraction and context creation are blocking; the temporary
        // directory cleans itself up on every path out of this function.
        let (metadata_value, context) = tokio::task::spawn_blocking(move || {
            let workdir = TempDir::new()?;
            extract_archive(kind, &archive, workdir.path())?;
            let metadata_value = read_required_members(workdir.path())?;
            let context = gzipped_context(workdir.path())?;
            Ok::<_, BuildBundleError>((metadata_value, context))
        })
        .await
        .map_err(|e| BuildBundleError::Io(std::io::Error::other(e)))??;

        let metadata = BundleMetadata::parse(metadata_value)?;
        let tag = metadata.image_tag();

        self.runtime.build_image(&tag, context).await?;

        let id = Uuid::new_v4();
        let exercise = self
            .db
            .create_exercise(
                id,
                &metadata.title,
                &metadata.version,
                &metadata.description,
                metadata.level,
                &tag,
                &metadata.raw,
            )
            .await
            .map_err(|e| match e {
                DatabaseError::Conflict(tag) => {
                    invalid(&format!("an exercise with image tag `{tag}` already exists"))
                }
                other => BuildBundleError::Database(other),
            })?;

        info!(exercise = %id, %tag, "exercise image built");
        self.journal
            .record(
                EventKind::ImageBuilt,
                Some(subject),
                Some(&id.to_string()),
                json!({ "tag": tag, "version": metadata.version }),
            )
            .await;

        Ok(exercise)
    }
}

impl std::fmt::Debug for ImageBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageBuilder").finish_non_exhaustive()
    }
}

/// Extracts an uploaded archive into `root`.
fn extract_archive(
    kind: ArchiveKind,
    archive: &Bytes,
    root: &Path,
) -> Result<(), BuildBundleError> {
    match kind {
        ArchiveKind::Zip => {
            let mut archive = zip::ZipArchive::new(Cursor::new(archive.as_ref()))
                .map_err(|e| invalid(&format!("unreadable zip archive: {e}")))?;

            for i in 0..archive.len() {
                let mut entry = archive
                    .by_index(i)
                    .map_err(|e| invalid(&format!("unreadable zip entry: {e}")))?;

                // Entries escaping the extraction root are skipped.
                let Some(relative) = entry.enclosed_name() else {
                    continue;
                };
                let dest = root.join(relative);

                if entry.is_dir() {
                    std::fs::create_dir_all(&dest)?;
                } else {
                    if let Some(parent) = dest.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    let mut out = File::create(&dest)?;
                    std::io::copy(&mut entry, &mut out)?;
                }
            }
        }
        ArchiveKind::Tar => {
            tar::Archive::new(Cursor::new(archive.as_ref()))
                .unpack(root)
                .map_err(|e| invalid(&format!("unreadable tar archive: {e}")))?;
        }
        ArchiveKind::TarGz => {
            tar::Archive::new(GzDecoder::new(Cursor::new(archive.as_ref())))
                .unpack(root)
                .map_err(|e| invalid(&format!("unreadable tar.gz archive: {e}")))?;
        }
    }

    Ok(())
}

/// Checks the required bundle members and returns the parsed metadata value.
fn read_required_members(root: &Path) -> Result<Value, BuildBundleError> {
    if !root.join(DOCKERFILE).is_file() {
        return Err(invalid("bundle must contain a `Dockerfile` at the archive root"));
    }

    let metadata_path = root.join(METADATA_FILE);
    if !metadata_path.is_file() {
        return Err(invalid(
            "bundle must contain a `metadata.json` at the archive root",
        ));
    }

    let mut contents = String::new();
    File::open(&metadata_path)?.read_to_string(&mut contents)?;
    serde_json::from_str(&contents).map_err(|e| invalid(&format!("malformed metadata.json: {e}")))
}

/// Produces a gzipped tar of the extracted bundle root.
fn gzipped_context(root: &Path) -> Result<Bytes, BuildBundleError> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.append_dir_all(".", root)?;
    let encoder = builder.into_inner()?;
    let compressed = encoder.finish()?;
    Ok(Bytes::from(compressed))
}
