//! One-hot slot registries learned at training time.
//!
//! Each registry maps a prefixed column label (`street_name_<value>`,
//! `flat_type_<value>`) to the zero-based position of that column inside its
//! one-hot block. Registries are loaded once and never mutated.

use serde::Serialize;
use std::{collections::HashMap, fmt, fs, path::Path};

/// Which one-hot block a registry indexes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CategoryKind {
    Street,
    FlatType,
}

impl CategoryKind {
    /// Column-name prefix used when the one-hot columns were generated.
    pub const fn prefix(self) -> &'static str {
        match self {
            CategoryKind::Street => "street_name_",
            CategoryKind::FlatType => "flat_type_",
        }
    }

    /// Normalized lookup key for a raw value.
    pub fn label(self, raw: &str) -> String {
        format!("{}{}", self.prefix(), raw)
    }
}

impl fmt::Display for CategoryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CategoryKind::Street => write!(f, "street"),
            CategoryKind::FlatType => write!(f, "flat type"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("failed to read {kind} registry {path}: {source}")]
    Io {
        kind: CategoryKind,
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse {kind} registry: {source}")]
    Parse {
        kind: CategoryKind,
        #[source]
        source: serde_json::Error,
    },
    #[error("{kind} label {label:?} has slot {slot}, cardinality is {cardinality}")]
    SlotOutOfRange {
        kind: CategoryKind,
        label: String,
        slot: usize,
        cardinality: usize,
    },
    #[error("{kind} slot {slot} assigned to both {first:?} and {second:?}")]
    DuplicateSlot {
        kind: CategoryKind,
        slot: usize,
        first: String,
        second: String,
    },
    #[error("{kind} label {label:?} is missing its column prefix")]
    MissingPrefix { kind: CategoryKind, label: String },
}

/// Immutable label → slot mapping with a fixed cardinality.
#[derive(Debug, Clone)]
pub struct CategoryIndexRegistry {
    kind: CategoryKind,
    cardinality: usize,
    slots: HashMap<String, usize>,
    labels: Vec<Option<String>>, // slot -> label
}

impl CategoryIndexRegistry {
    /// Build a registry, checking that slots are unique, in range and that
    /// every label carries the kind's prefix.
    pub fn new(
        kind: CategoryKind,
        cardinality: usize,
        entries: HashMap<String, usize>,
    ) -> Result<Self, RegistryError> {
        let mut labels: Vec<Option<String>> = vec![None; cardinality];
        for (label, &slot) in &entries {
            if !label.starts_with(kind.prefix()) {
                return Err(RegistryError::MissingPrefix {
                    kind,
                    label: label.clone(),
                });
            }
            if slot >= cardinality {
                return Err(RegistryError::SlotOutOfRange {
                    kind,
                    label: label.clone(),
                    slot,
                    cardinality,
                });
            }
            if let Some(first) = &labels[slot] {
                // report in a stable order regardless of map iteration
                let (first, second) = if first <= label {
                    (first.clone(), label.clone())
                } else {
                    (label.clone(), first.clone())
                };
                return Err(RegistryError::DuplicateSlot {
                    kind,
                    slot,
                    first,
                    second,
                });
            }
            labels[slot] = Some(label.clone());
        }

        Ok(Self {
            kind,
            cardinality,
            slots: entries,
            labels,
        })
    }

    /// Parse a registry from its persisted JSON object form.
    pub fn from_json(
        kind: CategoryKind,
        cardinality: usize,
        json: &str,
    ) -> Result<Self, RegistryError> {
        let entries: HashMap<String, usize> =
            serde_json::from_str(json).map_err(|source| RegistryError::Parse { kind, source })?;
        Self::new(kind, cardinality, entries)
    }

    pub fn load(
        kind: CategoryKind,
        cardinality: usize,
        path: &Path,
    ) -> Result<Self, RegistryError> {
        let txt = fs::read_to_string(path).map_err(|source| RegistryError::Io {
            kind,
            path: path.display().to_string(),
            source,
        })?;
        let registry = Self::from_json(kind, cardinality, &txt)?;
        tracing::info!(
            "loaded {} registry {} ({} labels, {} slots)",
            kind,
            path.display(),
            registry.len(),
            cardinality
        );
        Ok(registry)
    }

    /// Slot for a raw (unprefixed) value, if the training data had it.
    pub fn lookup(&self, raw: &str) -> Option<usize> {
        self.slots.get(&self.kind.label(raw)).copied()
    }

    pub fn kind(&self) -> CategoryKind {
        self.kind
    }

    pub fn cardinality(&self) -> usize {
        self.cardinality
    }

    /// Number of labelled slots.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn label_at(&self, slot: usize) -> Option<&str> {
        self.labels.get(slot).and_then(|l| l.as_deref())
    }
}
