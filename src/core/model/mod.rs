mod gazetteer;
mod keyword;

pub use gazetteer::GazetteerTagger;
pub use keyword::KeywordVoteClassifier;

use anyhow::Result;

use crate::core::config::ConfigError;
use crate::core::dataset::{Annotation, AnnotationKind, LabelPayload, Sample};

/// A trainable annotator. Methods are synchronous and may be slow; callers
/// run them on the blocking pool.
pub trait AnnotationModel: Send + Sync {
    /// Registry key, also stored next to persisted artifacts.
    fn kind(&self) -> &'static str;

    fn annotation_kind(&self) -> AnnotationKind;

    /// An independent copy. Fine-tuning the copy never affects `self`.
    fn fork(&self) -> Box<dyn AnnotationModel>;

    /// Retrain on the accepted labels of `samples`. Samples whose label has the
    /// wrong kind for this model are ignored.
    fn finetune(&mut self, samples: &[Sample]) -> Result<()>;

    /// Always yields a proposal, even before any training.
    fn predict(&self, text: &str) -> LabelPayload;

    fn to_bytes(&self) -> Result<Vec<u8>>;

    /// Propose one annotation per sample, tagged with `iteration_id`.
    fn annotate(&self, samples: &[Sample], iteration_id: Option<&str>) -> Vec<Annotation> {
        samples
            .iter()
            .map(|s| Annotation::new(s.id.clone(), self.predict(&s.text)).for_iteration(iteration_id))
            .collect()
    }
}

pub const MODEL_KINDS: &[&str] = &[KeywordVoteClassifier::KIND, GazetteerTagger::KIND];

pub fn build_model(kind: &str) -> Result<Box<dyn AnnotationModel>, ConfigError> {
    match kind {
        KeywordVoteClassifier::KIND => Ok(Box::new(KeywordVoteClassifier::default())),
        GazetteerTagger::KIND => Ok(Box::new(GazetteerTagger::default())),
        other => Err(ConfigError::UnknownModel(other.to_string())),
    }
}

pub fn restore_model(kind: &str, bytes: &[u8]) -> Result<Box<dyn AnnotationModel>> {
    match kind {
        KeywordVoteClassifier::KIND => Ok(Box::new(KeywordVoteClassifier::from_bytes(bytes)?)),
        GazetteerTagger::KIND => Ok(Box::new(GazetteerTagger::from_bytes(bytes)?)),
        other => Err(ConfigError::UnknownModel(other.to_string()).into()),
    }
}

/// Samples carrying a label of a kind `model` cannot learn from.
pub fn incompatible_samples<'a>(model: &dyn AnnotationModel, samples: &'a [Sample]) -> Vec<&'a Sample> {
    let kind = model.annotation_kind();
    samples
        .iter()
        .filter(|s| s.payload().is_some_and(|p| p.kind() != kind))
        .collect()
}

/// Accepted labels only: a sample counts once it is validated and carries a payload.
fn accepted(samples: &[Sample]) -> impl Iterator<Item = (&Sample, &LabelPayload)> {
    samples
        .iter()
        .filter(|s| s.validated)
        .filter_map(|s| s.payload().map(|p| (s, p)))
}

/// Lowercased alphanumeric words.
fn tokens(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
}
