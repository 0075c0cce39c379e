//! Feature-row reconstruction.
//!
//! The regressors were trained on a fixed column layout: a handful of scalar
//! columns plus two one-hot blocks whose positions come from the category
//! registries. The present and future models use different layouts and
//! different registry cardinalities, so every row and matrix carries its
//! [`ModelMode`] and is only ever laid out through that mode's [`Schema`].

use chrono::{Datelike, NaiveDate};
use serde::Serialize;
use std::fmt;

use crate::calendar::YearMonth;
use crate::registry::{CategoryIndexRegistry, CategoryKind};

/// Which trained model a row is built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelMode {
    /// Price for the current month.
    Present,
    /// Prices for the three months after the current one.
    Future,
}

impl ModelMode {
    pub const ALL: [ModelMode; 2] = [ModelMode::Present, ModelMode::Future];

    pub const fn default_street_cardinality(self) -> usize {
        match self {
            ModelMode::Present => 570,
            ModelMode::Future => 588,
        }
    }

    pub const fn default_flat_type_cardinality(self) -> usize {
        match self {
            ModelMode::Present => 6,
            ModelMode::Future => 7,
        }
    }

    /// Rows produced per request.
    pub const fn horizon(self) -> u32 {
        match self {
            ModelMode::Present => 1,
            ModelMode::Future => 3,
        }
    }
}

impl fmt::Display for ModelMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelMode::Present => write!(f, "present"),
            ModelMode::Future => write!(f, "future"),
        }
    }
}

/// Identity of one column in a training layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Column {
    Month,
    FloorAreaSqm,
    LeaseStart,
    Year,
    StoreyMedian,
    FlatAge,
    Street(usize),
    FlatType(usize),
}

impl Column {
    /// Columns standardised by the scaler at training time.
    pub const SCALED: [Column; 3] = [Column::FloorAreaSqm, Column::StoreyMedian, Column::FlatAge];

    /// Training-time name of a scalar column; `None` for one-hot columns,
    /// which are named after their registry label.
    pub const fn scalar_name(self) -> Option<&'static str> {
        match self {
            Column::Month => Some("month"),
            Column::FloorAreaSqm => Some("floor_area_sqm"),
            Column::LeaseStart => Some("lease_start"),
            Column::Year => Some("year"),
            Column::StoreyMedian => Some("storey_median"),
            Column::FlatAge => Some("flat_age"),
            Column::Street(_) | Column::FlatType(_) => None,
        }
    }

    pub fn from_scalar_name(name: &str) -> Option<Column> {
        match name {
            "month" => Some(Column::Month),
            "floor_area_sqm" => Some(Column::FloorAreaSqm),
            "lease_start" => Some(Column::LeaseStart),
            "year" => Some(Column::Year),
            "storey_median" => Some(Column::StoreyMedian),
            "flat_age" => Some(Column::FlatAge),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SchemaError {
    #[error("{found} row cannot be laid out with the {expected} schema")]
    ModeMismatch { expected: ModelMode, found: ModelMode },
    #[error("{kind} block has {found} slots, schema expects {expected}")]
    BlockWidth {
        kind: CategoryKind,
        expected: usize,
        found: usize,
    },
    #[error("column {0:?} is not part of the feature schema")]
    MissingColumn(String),
    #[error("matrix has {values} values, not a multiple of {columns} columns")]
    Shape { values: usize, columns: usize },
    #[error("regressor expects {expected} features, matrix has {found}")]
    Width { expected: usize, found: usize },
    #[error("column {position} is {found:?} in the matrix but {expected:?} in the model")]
    ColumnName {
        position: usize,
        expected: String,
        found: String,
    },
}

/// Ordered column layout for one mode.
#[derive(Debug, Clone, PartialEq)]
pub struct Schema {
    mode: ModelMode,
    street_width: usize,
    flat_type_width: usize,
    columns: Vec<Column>,
    names: Vec<String>,
}

impl Schema {
    pub fn new(
        mode: ModelMode,
        street: &CategoryIndexRegistry,
        flat_type: &CategoryIndexRegistry,
    ) -> Self {
        debug_assert_eq!(street.kind(), CategoryKind::Street);
        debug_assert_eq!(flat_type.kind(), CategoryKind::FlatType);

        let streets = (0..street.cardinality()).map(Column::Street);
        let flat_types = (0..flat_type.cardinality()).map(Column::FlatType);
        let columns: Vec<Column> = match mode {
            ModelMode::Present => [
                Column::Month,
                Column::FloorAreaSqm,
                Column::LeaseStart,
                Column::Year,
                Column::StoreyMedian,
                Column::FlatAge,
            ]
            .into_iter()
            .chain(streets)
            .chain(flat_types)
            .collect(),
            ModelMode::Future => [
                Column::FloorAreaSqm,
                Column::LeaseStart,
                Column::StoreyMedian,
                Column::FlatAge,
            ]
            .into_iter()
            .chain(streets)
            .chain(flat_types)
            .chain([Column::Year, Column::Month])
            .collect(),
        };

        let names = columns
            .iter()
            .map(|&c| match c {
                Column::Street(slot) => one_hot_name(street, slot),
                Column::FlatType(slot) => one_hot_name(flat_type, slot),
                scalar => scalar.scalar_name().unwrap_or_default().to_owned(),
            })
            .collect();

        Self {
            mode,
            street_width: street.cardinality(),
            flat_type_width: flat_type.cardinality(),
            columns,
            names,
        }
    }

    pub fn mode(&self) -> ModelMode {
        self.mode
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn position(&self, column: Column) -> Option<usize> {
        self.columns.iter().position(|&c| c == column)
    }
}

// Slots without a registry label never occurred in training output; give them
// a name no model will carry so a feature-name check flags the gap.
fn one_hot_name(registry: &CategoryIndexRegistry, slot: usize) -> String {
    registry
        .label_at(slot)
        .map(str::to_owned)
        .unwrap_or_else(|| format!("{}#{}", registry.kind().prefix(), slot))
}

/// Fixed-width indicator block with at most one hot slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OneHot {
    width: usize,
    hot: Option<usize>,
}

impl OneHot {
    /// A slot outside the block leaves it all-zero.
    pub fn new(width: usize, hot: Option<usize>) -> Self {
        Self {
            width,
            hot: hot.filter(|&slot| slot < width),
        }
    }

    pub fn width(self) -> usize {
        self.width
    }

    pub fn hot(self) -> Option<usize> {
        self.hot
    }

    pub fn value(self, slot: usize) -> f64 {
        if self.hot == Some(slot) {
            1.0
        } else {
            0.0
        }
    }
}

/// Raw inference inputs for one flat.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlatQuery {
    pub street_name: String,
    /// Square metres.
    pub floor_area: f64,
    /// Ordinal storey bucket, fed to the model as `storey_median`.
    pub storey_range: i32,
    /// Lease commencement year; `0` means unknown.
    pub lease_start: i32,
    pub flat_type: String,
}

impl FlatQuery {
    /// Canned input used by the self-test endpoints.
    pub fn sample() -> Self {
        Self {
            street_name: "ADMIRALTY LINK".to_string(),
            floor_area: 105.0,
            storey_range: 2,
            lease_start: 2019,
            flat_type: "4 ROOM".to_string(),
        }
    }
}

/// Age of the flat in years at `year`. Unknown lease start gives `0`; a lease
/// start after `year` gives a negative age.
pub fn flat_age(lease_start: i32, year: i32) -> i32 {
    if lease_start > 0 {
        year - lease_start
    } else {
        0
    }
}

/// A non-empty category value the registry did not know.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnmatchedCategory {
    pub kind: CategoryKind,
    pub label: String,
}

/// One model input row, independent of column order.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureRow {
    mode: ModelMode,
    pub floor_area_sqm: f64,
    pub lease_start: f64,
    pub storey_median: f64,
    pub flat_age: f64,
    pub period: YearMonth,
    street: OneHot,
    flat_type: OneHot,
}

impl FeatureRow {
    pub fn mode(&self) -> ModelMode {
        self.mode
    }

    pub fn street(&self) -> OneHot {
        self.street
    }

    pub fn flat_type(&self) -> OneHot {
        self.flat_type
    }

    pub fn value(&self, column: Column) -> f64 {
        match column {
            Column::Month => f64::from(self.period.month()),
            Column::FloorAreaSqm => self.floor_area_sqm,
            Column::LeaseStart => self.lease_start,
            Column::Year => f64::from(self.period.year()),
            Column::StoreyMedian => self.storey_median,
            Column::FlatAge => self.flat_age,
            Column::Street(slot) => self.street.value(slot),
            Column::FlatType(slot) => self.flat_type.value(slot),
        }
    }

    /// Lay the row out in `schema` order.
    pub fn to_vec(&self, schema: &Schema) -> Result<Vec<f64>, SchemaError> {
        if self.mode != schema.mode {
            return Err(SchemaError::ModeMismatch {
                expected: schema.mode,
                found: self.mode,
            });
        }
        if self.street.width() != schema.street_width {
            return Err(SchemaError::BlockWidth {
                kind: CategoryKind::Street,
                expected: schema.street_width,
                found: self.street.width(),
            });
        }
        if self.flat_type.width() != schema.flat_type_width {
            return Err(SchemaError::BlockWidth {
                kind: CategoryKind::FlatType,
                expected: schema.flat_type_width,
                found: self.flat_type.width(),
            });
        }
        Ok(schema.columns.iter().map(|&c| self.value(c)).collect())
    }
}

/// Rows built for one request, with the month each row targets.
#[derive(Debug, Clone)]
pub struct BuiltRows {
    pub rows: Vec<FeatureRow>,
    pub periods: Vec<YearMonth>,
    pub unmatched: Vec<UnmatchedCategory>,
}

/// Builds rows for a single mode from that mode's registries.
pub struct FeatureRowBuilder<'a> {
    mode: ModelMode,
    street: &'a CategoryIndexRegistry,
    flat_type: &'a CategoryIndexRegistry,
}

impl<'a> FeatureRowBuilder<'a> {
    pub fn new(
        mode: ModelMode,
        street: &'a CategoryIndexRegistry,
        flat_type: &'a CategoryIndexRegistry,
    ) -> Self {
        Self {
            mode,
            street,
            flat_type,
        }
    }

    /// Present mode yields one row for the month of `today`; future mode
    /// yields one row per month for the three months after it.
    pub fn build(&self, query: &FlatQuery, today: NaiveDate) -> BuiltRows {
        let mut unmatched = Vec::new();
        let street = self.one_hot(self.street, &query.street_name, &mut unmatched);
        let flat_type = self.one_hot(self.flat_type, &query.flat_type, &mut unmatched);
        let age = flat_age(query.lease_start, today.year());

        let current = YearMonth::of(today);
        let periods: Vec<YearMonth> = match self.mode {
            ModelMode::Present => vec![current],
            ModelMode::Future => current.following(self.mode.horizon()).collect(),
        };

        let rows = periods
            .iter()
            .map(|&period| FeatureRow {
                mode: self.mode,
                floor_area_sqm: query.floor_area,
                lease_start: f64::from(query.lease_start),
                storey_median: f64::from(query.storey_range),
                flat_age: f64::from(age),
                period,
                street,
                flat_type,
            })
            .collect();

        BuiltRows {
            rows,
            periods,
            unmatched,
        }
    }

    fn one_hot(
        &self,
        registry: &CategoryIndexRegistry,
        raw: &str,
        unmatched: &mut Vec<UnmatchedCategory>,
    ) -> OneHot {
        if raw.is_empty() {
            return OneHot::new(registry.cardinality(), None);
        }
        let slot = registry.lookup(raw);
        if slot.is_none() {
            tracing::warn!(
                "{} {} not found in {} registry",
                registry.kind(),
                registry.kind().label(raw),
                self.mode
            );
            unmatched.push(UnmatchedCategory {
                kind: registry.kind(),
                label: raw.to_owned(),
            });
        }
        OneHot::new(registry.cardinality(), slot)
    }
}

/// Row-major numeric matrix sharing one schema.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureMatrix {
    mode: Option<ModelMode>,
    names: Vec<String>,
    values: Vec<f64>,
}

impl FeatureMatrix {
    pub fn from_rows(schema: &Schema, rows: &[FeatureRow]) -> Result<Self, SchemaError> {
        let mut values = Vec::with_capacity(rows.len() * schema.len());
        for row in rows {
            values.extend(row.to_vec(schema)?);
        }
        Ok(Self {
            mode: Some(schema.mode),
            names: schema.names.clone(),
            values,
        })
    }

    /// Matrix from already ordered columns, without a mode.
    pub fn from_raw(names: Vec<String>, values: Vec<f64>) -> Result<Self, SchemaError> {
        if names.is_empty() || values.len() % names.len() != 0 {
            return Err(SchemaError::Shape {
                values: values.len(),
                columns: names.len(),
            });
        }
        Ok(Self {
            mode: None,
            names,
            values,
        })
    }

    pub fn mode(&self) -> Option<ModelMode> {
        self.mode
    }

    pub fn n_rows(&self) -> usize {
        if self.names.is_empty() {
            0
        } else {
            self.values.len() / self.names.len()
        }
    }

    pub fn n_cols(&self) -> usize {
        self.names.len()
    }

    pub fn column_names(&self) -> &[String] {
        &self.names
    }

    pub fn column_position(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn rows(&self) -> impl Iterator<Item = &[f64]> {
        self.values.chunks(self.names.len().max(1))
    }

    pub fn row(&self, index: usize) -> Option<&[f64]> {
        self.rows().nth(index)
    }

    /// Mutable access to every cell of one column, top to bottom.
    pub fn column_mut(&mut self, position: usize) -> impl Iterator<Item = &mut f64> {
        let width = self.names.len();
        self.values.iter_mut().skip(position).step_by(width.max(1))
    }
}
