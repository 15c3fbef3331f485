//! Canonical style annotation schema (version 1).
//!
//! An annotation maps a fixed set of semantic fields to lists of free-text
//! values. Every field is always present; a field the model omitted is an
//! empty list. Fields may arrive flat at the top level or nested under an
//! `"analysis"` / `"recommendations"` object, and both shapes parse to the
//! same value.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const ANNOTATION_SCHEMA_VERSION: u32 = 1;

/// Which half of the schema a field belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldGroup {
    Analysis,
    Recommendations,
}

impl FieldGroup {
    pub fn key(self) -> &'static str {
        match self {
            FieldGroup::Analysis => "analysis",
            FieldGroup::Recommendations => "recommendations",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnnotationField {
    Garments,
    ColorScheme,
    HairStyle,
    StyleDescriptors,
    Accessories,
    Occasions,
    DesignElements,
    OutfitRecommendations,
    MakeupTips,
    StylingTips,
}

impl AnnotationField {
    pub const ALL: [AnnotationField; 10] = [
        AnnotationField::Garments,
        AnnotationField::ColorScheme,
        AnnotationField::HairStyle,
        AnnotationField::StyleDescriptors,
        AnnotationField::Accessories,
        AnnotationField::Occasions,
        AnnotationField::DesignElements,
        AnnotationField::OutfitRecommendations,
        AnnotationField::MakeupTips,
        AnnotationField::StylingTips,
    ];

    /// JSON key used on the wire.
    pub fn key(self) -> &'static str {
        match self {
            AnnotationField::Garments => "garments",
            AnnotationField::ColorScheme => "color_scheme",
            AnnotationField::HairStyle => "hair_style",
            AnnotationField::StyleDescriptors => "style_descriptors",
            AnnotationField::Accessories => "accessories",
            AnnotationField::Occasions => "occasions",
            AnnotationField::DesignElements => "design_elements",
            AnnotationField::OutfitRecommendations => "outfit_recommendations",
            AnnotationField::MakeupTips => "makeup_tips",
            AnnotationField::StylingTips => "styling_tips",
        }
    }

    /// Human-readable heading.
    pub fn title(self) -> &'static str {
        match self {
            AnnotationField::Garments => "Key pieces",
            AnnotationField::ColorScheme => "Color scheme",
            AnnotationField::HairStyle => "Hair",
            AnnotationField::StyleDescriptors => "Style descriptors",
            AnnotationField::Accessories => "Accessories",
            AnnotationField::Occasions => "Occasions",
            AnnotationField::DesignElements => "Design elements",
            AnnotationField::OutfitRecommendations => "Outfit recommendations",
            AnnotationField::MakeupTips => "Makeup tips",
            AnnotationField::StylingTips => "Styling tips",
        }
    }

    pub fn group(self) -> FieldGroup {
        match self {
            AnnotationField::OutfitRecommendations
            | AnnotationField::MakeupTips
            | AnnotationField::StylingTips => FieldGroup::Recommendations,
            _ => FieldGroup::Analysis,
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.key() == key)
    }
}

/// The payload did not conform to the annotation schema.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{path}: {reason}")]
pub struct SchemaViolation {
    pub path: String,
    pub reason: String,
}

impl SchemaViolation {
    fn new(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// One image's structured style description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Annotation {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    fields: BTreeMap<AnnotationField, Vec<String>>,
}

fn default_schema_version() -> u32 {
    ANNOTATION_SCHEMA_VERSION
}

impl Default for Annotation {
    fn default() -> Self {
        Self::empty()
    }
}

impl Annotation {
    /// Annotation with every field present and empty.
    pub fn empty() -> Self {
        Self {
            schema_version: ANNOTATION_SCHEMA_VERSION,
            fields: AnnotationField::ALL
                .into_iter()
                .map(|f| (f, Vec::new()))
                .collect(),
        }
    }

    /// Set one field, keeping the rest.
    pub fn with(
        mut self,
        field: AnnotationField,
        values: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.fields
            .insert(field, values.into_iter().map(Into::into).collect());
        self
    }

    pub fn get(&self, field: AnnotationField) -> &[String] {
        self.fields.get(&field).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn iter(&self) -> impl Iterator<Item = (AnnotationField, &[String])> + '_ {
        AnnotationField::ALL.into_iter().map(|f| (f, self.get(f)))
    }

    pub fn is_blank(&self) -> bool {
        self.fields.values().all(Vec::is_empty)
    }

    /// Validate a model payload against the schema.
    ///
    /// Missing keys default to empty lists. A known key holding anything but
    /// an array of strings is a violation. Unknown keys are ignored.
    pub fn from_json(value: &Value) -> Result<Self, SchemaViolation> {
        let root = value
            .as_object()
            .ok_or_else(|| SchemaViolation::new("$", "expected a JSON object"))?;

        let analysis = group_object(root, FieldGroup::Analysis)?;
        let recommendations = group_object(root, FieldGroup::Recommendations)?;

        let mut annotation = Self::empty();
        for field in AnnotationField::ALL {
            let nested = match field.group() {
                FieldGroup::Analysis => analysis,
                FieldGroup::Recommendations => recommendations,
            };
            let (path, raw) = match root.get(field.key()) {
                Some(v) => (field.key().to_string(), Some(v)),
                None => (
                    format!("{}.{}", field.group().key(), field.key()),
                    nested.and_then(|m| m.get(field.key())),
                ),
            };
            let Some(raw) = raw else {
                continue;
            };
            annotation.fields.insert(field, string_list(&path, raw)?);
        }
        Ok(annotation)
    }
}

fn group_object(
    root: &Map<String, Value>,
    group: FieldGroup,
) -> Result<Option<&Map<String, Value>>, SchemaViolation> {
    match root.get(group.key()) {
        None => Ok(None),
        Some(Value::Object(m)) => Ok(Some(m)),
        Some(_) => Err(SchemaViolation::new(group.key(), "expected an object")),
    }
}

fn string_list(path: &str, raw: &Value) -> Result<Vec<String>, SchemaViolation> {
    let items = raw
        .as_array()
        .ok_or_else(|| SchemaViolation::new(path, format!("expected a list, got {}", kind(raw))))?;
    items
        .iter()
        .enumerate()
        .map(|(i, item)| {
            item.as_str().map(str::to_string).ok_or_else(|| {
                SchemaViolation::new(
                    format!("{path}[{i}]"),
                    format!("expected a string, got {}", kind(item)),
                )
            })
        })
        .collect()
}

fn kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
