use std::env;
use std::path::PathBuf;
use std::sync::{mpsc, Arc};
use std::thread;

use async_trait::async_trait;
use dlib_face_recognition::{
    FaceDetector, FaceDetectorTrait, FaceEncoderNetwork, FaceEncoderTrait, ImageMatrix,
    LandmarkPredictor, LandmarkPredictorTrait,
};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::errors::{AppError, AppResult};

const LANDMARK_ENV: &str = "DLIB_LANDMARK_MODEL";
const ENCODER_ENV: &str = "DLIB_ENCODER_MODEL";

/// Fixed-length face descriptor. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Embedding(Vec<f64>);

impl Embedding {
    pub fn new(values: Vec<f64>) -> AppResult<Self> {
        if values.is_empty() {
            return Err(AppError::InvalidEmbedding("vector is empty".into()));
        }
        if let Some(idx) = values.iter().position(|value| !value.is_finite()) {
            return Err(AppError::InvalidEmbedding(format!(
                "value at index {idx} is not finite"
            )));
        }
        Ok(Self(values))
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl TryFrom<Vec<f64>> for Embedding {
    type Error = AppError;

    fn try_from(values: Vec<f64>) -> AppResult<Self> {
        Embedding::new(values)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct BoundingBox {
    pub left: i64,
    pub top: i64,
    pub right: i64,
    pub bottom: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct LandmarkPoint {
    pub x: i64,
    pub y: i64,
}

pub type Landmarks = Vec<LandmarkPoint>;

#[derive(Debug, Clone, PartialEq)]
pub struct FaceDetection {
    pub bounding_box: BoundingBox,
    pub landmarks: Landmarks,
    pub embedding: Embedding,
}

pub trait FaceEmbeddingBackend: Send + Sync {
    /// Every face found in the image. May be empty.
    fn detect_faces(&self, image: &RgbImage) -> AppResult<Vec<FaceDetection>>;
}

/// Detect exactly one face.
///
/// Zero faces, several faces, and backend failures on bad image data all
/// come back as `None`.
pub fn extract(backend: &dyn FaceEmbeddingBackend, image: &RgbImage) -> Option<FaceDetection> {
    match backend.detect_faces(image) {
        Ok(mut faces) if faces.len() == 1 => faces.pop(),
        Ok(faces) => {
            debug!(faces = faces.len(), "frame rejected: expected exactly one face");
            None
        }
        Err(err) => {
            warn!(error = %err, "face detection failed on frame");
            None
        }
    }
}

#[async_trait]
pub trait ModelLoader: Send + Sync {
    fn describe(&self) -> String;

    async fn load(&self) -> AppResult<Arc<dyn FaceEmbeddingBackend>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaceModelPaths {
    pub landmark: PathBuf,
    pub encoder: PathBuf,
}

pub trait ModelPathResolver {
    fn resolve(
        &self,
        landmark: Option<PathBuf>,
        encoder: Option<PathBuf>,
    ) -> AppResult<FaceModelPaths>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EnvModelPathResolver;

impl ModelPathResolver for EnvModelPathResolver {
    fn resolve(
        &self,
        landmark: Option<PathBuf>,
        encoder: Option<PathBuf>,
    ) -> AppResult<FaceModelPaths> {
        let landmark = landmark
            .or_else(|| env::var(LANDMARK_ENV).ok().map(PathBuf::from))
            .ok_or(AppError::MissingModel {
                kind: "landmark predictor",
                flag: "--landmark-model",
                env: LANDMARK_ENV,
            })?;

        let encoder = encoder
            .or_else(|| env::var(ENCODER_ENV).ok().map(PathBuf::from))
            .ok_or(AppError::MissingModel {
                kind: "face encoding network",
                flag: "--encoder-model",
                env: ENCODER_ENV,
            })?;

        Ok(FaceModelPaths { landmark, encoder })
    }
}

struct DlibModels {
    detector: FaceDetector,
    predictor: LandmarkPredictor,
    encoder: FaceEncoderNetwork,
}

impl DlibModels {
    fn open(models: &FaceModelPaths) -> AppResult<Self> {
        debug!(path = %models.landmark.display(), "loading landmark model");
        let predictor =
            LandmarkPredictor::open(&models.landmark).map_err(|message| AppError::ModelLoad {
                path: models.landmark.clone(),
                message,
            })?;
        debug!(path = %models.encoder.display(), "loading encoder model");
        let encoder =
            FaceEncoderNetwork::open(&models.encoder).map_err(|message| AppError::ModelLoad {
                path: models.encoder.clone(),
                message,
            })?;
        let detector = FaceDetector::new();

        Ok(Self {
            detector,
            predictor,
            encoder,
        })
    }

    fn detect(&self, image: &RgbImage, num_jitters: u32) -> AppResult<Vec<FaceDetection>> {
        let matrix = ImageMatrix::from_image(image);
        let locations = self.detector.face_locations(&matrix);

        let mut landmarks = Vec::with_capacity(locations.len());
        for rect in locations.iter() {
            landmarks.push(self.predictor.face_landmarks(&matrix, rect));
        }

        let encodings = self
            .encoder
            .get_face_encodings(&matrix, &landmarks, num_jitters);

        let mut faces = Vec::with_capacity(locations.len());
        for ((rect, points), encoding) in locations
            .iter()
            .zip(landmarks.iter())
            .zip(encodings.iter())
        {
            faces.push(FaceDetection {
                bounding_box: BoundingBox {
                    left: rect.left,
                    top: rect.top,
                    right: rect.right,
                    bottom: rect.bottom,
                },
                landmarks: points
                    .iter()
                    .map(|point| LandmarkPoint {
                        x: point.x(),
                        y: point.y(),
                    })
                    .collect(),
                embedding: Embedding::new(encoding.as_ref().to_vec())?,
            });
        }

        Ok(faces)
    }
}

struct DetectRequest {
    image: RgbImage,
    reply: mpsc::Sender<AppResult<Vec<FaceDetection>>>,
}

/// dlib models confined to a dedicated worker thread.
///
/// The handle only holds a channel to that thread, so it can be shared
/// between tasks. The worker exits once every handle is dropped.
pub struct DlibBackend {
    requests: mpsc::Sender<DetectRequest>,
}

impl DlibBackend {
    /// Spawn the worker and block until its models are loaded.
    pub fn spawn(models: FaceModelPaths, num_jitters: u32) -> AppResult<Self> {
        let (ready_tx, ready_rx) = oneshot::channel();
        let requests = spawn_worker(models, num_jitters, ready_tx)?;
        ready_rx
            .blocking_recv()
            .map_err(|_| AppError::ModelWorkerGone)??;
        Ok(Self { requests })
    }
}

impl FaceEmbeddingBackend for DlibBackend {
    fn detect_faces(&self, image: &RgbImage) -> AppResult<Vec<FaceDetection>> {
        let (reply, response) = mpsc::channel();
        self.requests
            .send(DetectRequest {
                image: image.clone(),
                reply,
            })
            .map_err(|_| AppError::ModelWorkerGone)?;
        response.recv().map_err(|_| AppError::ModelWorkerGone)?
    }
}

fn spawn_worker(
    models: FaceModelPaths,
    num_jitters: u32,
    ready: oneshot::Sender<AppResult<()>>,
) -> AppResult<mpsc::Sender<DetectRequest>> {
    let (requests, inbox) = mpsc::channel::<DetectRequest>();
    thread::Builder::new()
        .name("dlib-face-worker".into())
        .spawn(move || {
            let loaded = match DlibModels::open(&models) {
                Ok(loaded) => {
                    let _ = ready.send(Ok(()));
                    loaded
                }
                Err(err) => {
                    let _ = ready.send(Err(err));
                    return;
                }
            };
            info!(
                landmark = %models.landmark.display(),
                encoder = %models.encoder.display(),
                "dlib face models loaded"
            );
            for request in inbox {
                let result = loaded.detect(&request.image, num_jitters);
                let _ = request.reply.send(result);
            }
            debug!("dlib face worker exiting");
        })?;
    Ok(requests)
}

/// Loads the dlib backend on first use of each session.
#[derive(Debug, Clone)]
pub struct DlibModelLoader {
    models: FaceModelPaths,
    num_jitters: u32,
}

impl DlibModelLoader {
    pub fn new(models: FaceModelPaths, num_jitters: u32) -> Self {
        Self {
            models,
            num_jitters,
        }
    }
}

#[async_trait]
impl ModelLoader for DlibModelLoader {
    fn describe(&self) -> String {
        format!(
            "dlib (landmark={}, encoder={})",
            self.models.landmark.display(),
            self.models.encoder.display()
        )
    }

    async fn load(&self) -> AppResult<Arc<dyn FaceEmbeddingBackend>> {
        let (ready_tx, ready_rx) = oneshot::channel();
        let requests = spawn_worker(self.models.clone(), self.num_jitters, ready_tx)?;
        ready_rx.await.map_err(|_| AppError::ModelWorkerGone)??;
        Ok(Arc::new(DlibBackend { requests }))
    }
}
