mod loader;

pub use loader::{DatasetLoader, ImportSummary};

/// Annotator id stamped on labels that were closed out without a human step.
pub const AUTO_ANNOTATOR: &str = "auto";

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnnotationKind {
    Classification,
    SequenceLabeling,
}

impl AnnotationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AnnotationKind::Classification => "classification",
            AnnotationKind::SequenceLabeling => "sequence_labeling",
        }
    }
}

/// A labeled span over the sample text. Offsets are byte offsets, `end` exclusive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
    pub label: String,
}

impl Span {
    pub fn new(start: usize, end: usize, label: impl Into<String>) -> Self {
        Self {
            start,
            end,
            label: label.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LabelPayload {
    Classification { label: String },
    SequenceLabeling { spans: Vec<Span> },
}

impl LabelPayload {
    pub fn kind(&self) -> AnnotationKind {
        match self {
            LabelPayload::Classification { .. } => AnnotationKind::Classification,
            LabelPayload::SequenceLabeling { .. } => AnnotationKind::SequenceLabeling,
        }
    }

    /// The payload viewed as a set of spans. A classification label covers the
    /// whole text, so two classification payloads compare as single spans.
    pub fn spans(&self, text: &str) -> Vec<Span> {
        match self {
            LabelPayload::Classification { label } => vec![Span::new(0, text.len(), label.clone())],
            LabelPayload::SequenceLabeling { spans } => spans.clone(),
        }
    }
}

/// The label value owned by exactly one sample, plus the human judgment on it.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Annotation {
    pub id: String,
    pub sample_id: String,
    pub payload: LabelPayload,
    /// `None` until a human (or finalization) decides on it.
    pub is_valid: Option<bool>,
    pub annotator_id: Option<String>,
    pub iteration_id: Option<String>,
}

impl Annotation {
    pub fn new(sample_id: impl Into<String>, payload: LabelPayload) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            sample_id: sample_id.into(),
            payload,
            is_valid: None,
            annotator_id: None,
            iteration_id: None,
        }
    }

    pub fn for_iteration(mut self, iteration_id: Option<&str>) -> Self {
        self.iteration_id = iteration_id.map(str::to_string);
        self
    }

    pub fn is_decided(&self) -> bool {
        self.is_valid.is_some()
    }

    pub fn kind(&self) -> AnnotationKind {
        self.payload.kind()
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Sample {
    pub id: String,
    pub text: String,
    pub annotation: Option<Annotation>,
    pub validated: bool,
    pub is_gold: bool,
}

impl Sample {
    pub fn pending(text: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            text: text.into(),
            annotation: None,
            validated: false,
            is_gold: false,
        }
    }

    /// A sample whose label was supplied by a human up front.
    pub fn labeled(text: impl Into<String>, payload: LabelPayload, annotator: &str) -> Self {
        let mut sample = Self::pending(text);
        let mut annotation = Annotation::new(sample.id.clone(), payload);
        annotation.is_valid = Some(true);
        annotation.annotator_id = Some(annotator.to_string());
        sample.annotation = Some(annotation);
        sample.validated = true;
        sample
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        if let Some(annotation) = self.annotation.as_mut() {
            annotation.sample_id = self.id.clone();
        }
        self
    }

    pub fn gold(mut self, is_gold: bool) -> Self {
        self.is_gold = is_gold;
        self
    }

    /// Record a human decision on the current annotation.
    ///
    /// Returns `false` when the sample carries no annotation to decide on.
    pub fn apply_judgment(&mut self, accept: bool, annotator: &str) -> bool {
        let Some(annotation) = self.annotation.as_mut() else {
            return false;
        };
        annotation.is_valid = Some(accept);
        annotation.annotator_id = Some(annotator.to_string());
        self.validated = accept;
        true
    }

    pub fn payload(&self) -> Option<&LabelPayload> {
        self.annotation.as_ref().map(|a| &a.payload)
    }
}
