//! Frequency-ranked reduction of an aggregate state.
//!
//! Each item contributes each distinct value at most once, so a count is the
//! number of items that mentioned the value. Values match exactly: no case
//! folding, trimming or synonym merging. Equal counts keep first-seen order.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::annotation::AnnotationField;
use crate::pipeline::AggregateState;

pub const DEFAULT_TOP_COLORS: usize = 8;

/// Default top-N for one annotation field.
pub fn default_field_limit(field: AnnotationField) -> usize {
    match field {
        AnnotationField::Garments => 10,
        AnnotationField::StyleDescriptors => 6,
        AnnotationField::HairStyle => 5,
        AnnotationField::Accessories => 6,
        AnnotationField::OutfitRecommendations => 6,
        AnnotationField::MakeupTips => 4,
        AnnotationField::ColorScheme => 5,
        AnnotationField::Occasions => 3,
        AnnotationField::DesignElements => 5,
        AnnotationField::StylingTips => 5,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryConfig {
    #[serde(default = "default_top_colors")]
    pub top_colors: usize,
    /// Per-field overrides of [`default_field_limit`].
    #[serde(default)]
    pub field_limits: BTreeMap<AnnotationField, usize>,
}

fn default_top_colors() -> usize {
    DEFAULT_TOP_COLORS
}

impl Default for SummaryConfig {
    fn default() -> Self {
        Self {
            top_colors: DEFAULT_TOP_COLORS,
            field_limits: BTreeMap::new(),
        }
    }
}

impl SummaryConfig {
    pub fn limit(&self, field: AnnotationField) -> usize {
        self.field_limits
            .get(&field)
            .copied()
            .unwrap_or_else(|| default_field_limit(field))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedEntry {
    pub value: String,
    /// Items containing this value.
    pub count: usize,
    /// `count` as a percentage of contributing items.
    pub share: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedView {
    /// `colors` or an annotation field key.
    pub field: String,
    /// Items that fed this view (palettes for colors, annotations otherwise).
    pub contributors: usize,
    pub entries: Vec<RankedEntry>,
}

impl RankedView {
    pub fn values(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.value.as_str())
    }

    pub fn top(&self) -> Option<&str> {
        self.values().next()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedSummary {
    pub colors: RankedView,
    /// One view per annotation field, in schema order.
    pub fields: Vec<RankedView>,
    pub narrative: String,
    pub items_attempted: usize,
    pub items_succeeded: usize,
    pub items_cancelled: usize,
}

impl RankedSummary {
    pub fn field(&self, field: AnnotationField) -> Option<&RankedView> {
        self.fields.iter().find(|v| v.field == field.key())
    }
}

/// Reduce an aggregate state into ranked views plus a narrative. Never fails.
pub fn reduce(state: &AggregateState, config: &SummaryConfig) -> RankedSummary {
    let colors = rank(
        "colors",
        state
            .palettes
            .iter()
            .map(|palette| palette.iter().map(|o| o.hex.as_str())),
        config.top_colors,
    );

    let fields: Vec<RankedView> = AnnotationField::ALL
        .into_iter()
        .map(|field| {
            rank(
                field.key(),
                state
                    .annotations
                    .iter()
                    .map(|a| a.get(field).iter().map(String::as_str)),
                config.limit(field),
            )
        })
        .collect();

    let mut summary = RankedSummary {
        colors,
        fields,
        narrative: String::new(),
        items_attempted: state.items_attempted,
        items_succeeded: state.items_succeeded,
        items_cancelled: state.items_cancelled,
    };
    summary.narrative = narrative(&summary);
    summary
}

fn rank<'a, I, V>(field: &str, items: I, limit: usize) -> RankedView
where
    I: IntoIterator<Item = V>,
    V: IntoIterator<Item = &'a str>,
{
    // value -> (count, first-seen position)
    let mut counts: HashMap<&'a str, (usize, usize)> = HashMap::new();
    let mut contributors = 0usize;
    for values in items {
        contributors += 1;
        let mut seen_in_item = HashSet::new();
        for value in values {
            if !seen_in_item.insert(value) {
                continue;
            }
            let next = counts.len();
            counts.entry(value).or_insert((0, next)).0 += 1;
        }
    }

    let mut ranked: Vec<(&str, usize, usize)> = counts
        .into_iter()
        .map(|(value, (count, first))| (value, count, first))
        .collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.cmp(&b.2)));
    ranked.truncate(limit);

    RankedView {
        field: field.to_string(),
        contributors,
        entries: ranked
            .into_iter()
            .map(|(value, count, _)| RankedEntry {
                value: value.to_string(),
                count,
                share: if contributors == 0 {
                    0.0
                } else {
                    count as f64 / contributors as f64 * 100.0
                },
            })
            .collect(),
    }
}

fn join_top(view: Option<&RankedView>, n: usize) -> Option<String> {
    let values: Vec<&str> = view?.values().take(n).collect();
    if values.is_empty() {
        None
    } else {
        Some(values.join(", "))
    }
}

/// One short paragraph describing the profile. Clauses with no data are left out.
pub fn narrative(summary: &RankedSummary) -> String {
    let style = summary
        .field(AnnotationField::StyleDescriptors)
        .and_then(RankedView::top)
        .unwrap_or("eclectic");
    let mut text = format!("This collection showcases a predominantly {style} aesthetic");

    if let Some(colors) = join_top(Some(&summary.colors), 3) {
        text.push_str(&format!(", featuring a color palette dominated by {colors}"));
    }
    text.push('.');

    let occasions = join_top(summary.field(AnnotationField::Occasions), 2);
    let elements = join_top(summary.field(AnnotationField::DesignElements), 2);
    match (occasions, elements) {
        (Some(o), Some(e)) => text.push_str(&format!(
            " It is particularly suited for {o}, with an emphasis on {e}."
        )),
        (Some(o), None) => text.push_str(&format!(" It is particularly suited for {o}.")),
        (None, Some(e)) => text.push_str(&format!(" It places an emphasis on {e}.")),
        (None, None) => {}
    }
    text
}
