pub mod extractor;
pub mod matcher;
pub mod reference;

pub use extractor::{
    extract, BoundingBox, DlibBackend, DlibModelLoader, Embedding, EnvModelPathResolver,
    FaceDetection, FaceEmbeddingBackend, FaceModelPaths, LandmarkPoint, Landmarks, ModelLoader,
    ModelPathResolver,
};

pub use matcher::{euclidean_distance, MatchOutcome, Matcher, DEFAULT_MATCH_THRESHOLD};

pub use reference::{
    resolve_reference, validate_subject_id, DirectoryReferenceSource, EnvReferenceDirResolver,
    ReferenceDirResolver, ReferenceFace, ReferencePhoto, ReferencePhotoSource, ReferenceStatus,
};
