use std::env;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use image::RgbImage;
use tracing::{debug, info, warn};

use crate::errors::{AppError, AppResult};
use crate::faces::extractor::{extract, Embedding, FaceEmbeddingBackend};

const DEFAULT_REFERENCE_DIR: &str = "/var/lib/vigil/references";
const REFERENCE_DIR_ENV: &str = "VIGIL_REFERENCE_DIR";
const REFERENCE_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

/// Approved onboarding photo as handed over by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReferencePhoto {
    Bytes(Vec<u8>),
    File(PathBuf),
}

impl ReferencePhoto {
    pub fn describe(&self) -> String {
        match self {
            ReferencePhoto::Bytes(bytes) => format!("{} byte upload", bytes.len()),
            ReferencePhoto::File(path) => path.display().to_string(),
        }
    }

    pub fn decode(&self) -> AppResult<RgbImage> {
        let image = match self {
            ReferencePhoto::Bytes(bytes) => {
                image::load_from_memory(bytes).map_err(|source| AppError::ImageDecode {
                    path: PathBuf::from("<memory>"),
                    source,
                })?
            }
            ReferencePhoto::File(path) => {
                if !path.exists() {
                    return Err(AppError::MissingInput { path: path.clone() });
                }
                image::open(path).map_err(|source| AppError::ImageDecode {
                    path: path.clone(),
                    source,
                })?
            }
        };
        Ok(image.to_rgb8())
    }
}

#[async_trait]
pub trait ReferencePhotoSource: Send + Sync {
    /// `Ok(None)` when the subject has no approved photo.
    async fn approved_reference_photo(&self, subject: &str) -> AppResult<Option<ReferencePhoto>>;
}

pub trait ReferenceDirResolver {
    fn resolve(&self, override_dir: Option<&Path>) -> PathBuf;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EnvReferenceDirResolver;

impl ReferenceDirResolver for EnvReferenceDirResolver {
    fn resolve(&self, override_dir: Option<&Path>) -> PathBuf {
        if let Some(dir) = override_dir {
            dir.to_path_buf()
        } else if let Ok(env_value) = env::var(REFERENCE_DIR_ENV) {
            PathBuf::from(env_value)
        } else {
            PathBuf::from(DEFAULT_REFERENCE_DIR)
        }
    }
}

/// Reference photos stored as `<dir>/<subject>.{png,jpg,jpeg}`.
#[derive(Debug, Clone)]
pub struct DirectoryReferenceSource {
    dir: PathBuf,
}

impl DirectoryReferenceSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn from_env(override_dir: Option<&Path>) -> Self {
        Self::new(EnvReferenceDirResolver.resolve(override_dir))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl ReferencePhotoSource for DirectoryReferenceSource {
    async fn approved_reference_photo(&self, subject: &str) -> AppResult<Option<ReferencePhoto>> {
        validate_subject_id(subject)?;
        for extension in REFERENCE_EXTENSIONS {
            let candidate = self.dir.join(format!("{subject}.{extension}"));
            match tokio::fs::metadata(&candidate).await {
                Ok(meta) if meta.is_file() => {
                    debug!(subject, path = %candidate.display(), "found reference photo");
                    return Ok(Some(ReferencePhoto::File(candidate)));
                }
                Ok(_) => continue,
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => {
                    return Err(AppError::ReferenceSource {
                        subject: subject.to_string(),
                        message: format!("{}: {err}", candidate.display()),
                    })
                }
            }
        }
        info!(subject, dir = %self.dir.display(), "no approved reference photo");
        Ok(None)
    }
}

/// Embedding of the approved photo, computed once per session.
#[derive(Debug, Clone)]
pub struct ReferenceFace {
    embedding: Arc<Embedding>,
    source: String,
}

impl ReferenceFace {
    pub fn new(embedding: Embedding, source: impl Into<String>) -> Self {
        Self {
            embedding: Arc::new(embedding),
            source: source.into(),
        }
    }

    pub fn embedding(&self) -> &Embedding {
        &self.embedding
    }

    pub fn source(&self) -> &str {
        &self.source
    }
}

#[derive(Debug, Clone)]
pub enum ReferenceStatus {
    Ready(ReferenceFace),
    Missing,
    Unusable { reason: String },
}

/// Turn the provider's answer into a reference face.
///
/// Blocking: decodes the photo and runs face detection.
pub fn resolve_reference(
    backend: &dyn FaceEmbeddingBackend,
    photo: Option<&ReferencePhoto>,
) -> ReferenceStatus {
    let Some(photo) = photo else {
        return ReferenceStatus::Missing;
    };
    let image = match photo.decode() {
        Ok(image) => image,
        Err(err) => {
            warn!(photo = %photo.describe(), error = %err, "reference photo could not be decoded");
            return ReferenceStatus::Unusable {
                reason: err.to_string(),
            };
        }
    };
    match extract(backend, &image) {
        Some(face) => ReferenceStatus::Ready(ReferenceFace::new(face.embedding, photo.describe())),
        None => ReferenceStatus::Unusable {
            reason: format!("expected exactly one face in {}", photo.describe()),
        },
    }
}

pub fn validate_subject_id(subject: &str) -> AppResult<()> {
    if subject.is_empty() {
        return Err(AppError::InvalidSubject {
            subject: subject.to_string(),
            message: "subject id cannot be empty".into(),
        });
    }

    if !subject
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_')
    {
        return Err(AppError::InvalidSubject {
            subject: subject.to_string(),
            message: "use ASCII letters, numbers, '-' or '_' only".into(),
        });
    }

    Ok(())
}
