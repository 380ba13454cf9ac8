use std::path::Path;

use serde::Serialize;
use tracing::info;
use vigil_face_core::faces::{
    extract, DlibBackend, EnvModelPathResolver, FaceDetection, FaceEmbeddingBackend, Matcher,
    ModelPathResolver, ReferencePhoto,
};
use vigil_face_core::{AppError, AppResult};

use crate::config::CompareSettings;

#[derive(Debug, Clone, Serialize)]
pub struct CompareOutcome {
    pub reference: String,
    pub probe: String,
    pub distance: f64,
    pub threshold: f64,
    pub matched: bool,
    #[serde(skip)]
    pub logs: Vec<String>,
}

pub fn run_compare(settings: &CompareSettings) -> AppResult<CompareOutcome> {
    let models = EnvModelPathResolver.resolve(
        settings.landmark_model.clone(),
        settings.encoder_model.clone(),
    )?;
    let backend = DlibBackend::spawn(models, settings.jitters)?;
    compare_with_backend(&backend, settings)
}

pub fn compare_with_backend(
    backend: &dyn FaceEmbeddingBackend,
    settings: &CompareSettings,
) -> AppResult<CompareOutcome> {
    let reference = single_face(backend, &settings.reference)?;
    let probe = single_face(backend, &settings.probe)?;

    let matcher = Matcher::new(settings.threshold);
    let distance = matcher.distance(&reference.embedding, &probe.embedding)?;
    let outcome = matcher.classify(distance);
    info!(
        distance,
        threshold = settings.threshold,
        matched = outcome.is_match(),
        "compared faces"
    );

    let verdict = if outcome.is_match() {
        "same person"
    } else {
        "different person"
    };
    Ok(CompareOutcome {
        reference: settings.reference.display().to_string(),
        probe: settings.probe.display().to_string(),
        distance,
        threshold: settings.threshold,
        matched: outcome.is_match(),
        logs: vec![format!(
            "{} vs {}: distance {distance:.4} (threshold {:.2}) => {verdict}",
            settings.reference.display(),
            settings.probe.display(),
            settings.threshold
        )],
    })
}

fn single_face(backend: &dyn FaceEmbeddingBackend, path: &Path) -> AppResult<FaceDetection> {
    let image = ReferencePhoto::File(path.to_path_buf()).decode()?;
    extract(backend, &image).ok_or_else(|| AppError::NoSingleFace {
        path: path.to_path_buf(),
    })
}
