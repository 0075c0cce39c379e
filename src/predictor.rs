//! Present and future price prediction over an injected artifact bundle.

use chrono::Datelike;
use serde::ser::{Serialize, SerializeMap, Serializer};
use std::sync::Arc;

use crate::artifacts::{ArtifactBundle, ModeArtifacts};
use crate::calendar::{Clock, SystemClock, YearMonth};
use crate::config::FlatAgePolicy;
use crate::features::{flat_age, FeatureMatrix, FeatureRowBuilder, FlatQuery, ModelMode, UnmatchedCategory};
use crate::model::{checked_predict, ModelError};
use crate::scaler::ScalerError;

#[derive(Debug, thiserror::Error)]
pub enum PredictError {
    /// The request itself is unusable; nothing was computed.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("{mode} feature scaling failed: {source}")]
    Scaling {
        mode: ModelMode,
        source: ScalerError,
    },
    #[error("{mode} inference failed: {source}")]
    Inference {
        mode: ModelMode,
        source: ModelError,
    },
}

impl PredictError {
    /// Whether the caller, not the service, is at fault.
    pub fn is_client_error(&self) -> bool {
        matches!(self, PredictError::InvalidInput(_))
    }
}

/// Present-month price. Serializes as `{"price": ...}` only; unmatched
/// categories are logged and kept here for callers.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct PresentPrice {
    pub price: f64,
    #[serde(skip)]
    pub unmatched: Vec<UnmatchedCategory>,
}

/// Prices for the three months after the reference month, ascending.
///
/// Serializes as a JSON object keyed by `MM-YYYY` in chronological order.
#[derive(Debug, Clone, PartialEq)]
pub struct FuturePrices {
    pub months: Vec<(YearMonth, f64)>,
    pub unmatched: Vec<UnmatchedCategory>,
}

impl FuturePrices {
    pub fn get(&self, label: &str) -> Option<f64> {
        self.months
            .iter()
            .find(|(m, _)| m.label() == label)
            .map(|&(_, p)| p)
    }

    pub fn labels(&self) -> Vec<String> {
        self.months.iter().map(|(m, _)| m.label()).collect()
    }
}

impl Serialize for FuturePrices {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.months.len()))?;
        for (month, price) in &self.months {
            map.serialize_entry(&month.label(), price)?;
        }
        map.end()
    }
}

/// Stateless orchestrator: builds rows, scales them, runs the mode's regressor.
pub struct Predictor {
    artifacts: ArtifactBundle,
    clock: Arc<dyn Clock>,
    age_policy: FlatAgePolicy,
    log_features: bool,
}

impl Predictor {
    pub fn new(artifacts: ArtifactBundle) -> Self {
        Self {
            artifacts,
            clock: Arc::new(SystemClock),
            age_policy: FlatAgePolicy::default(),
            log_features: false,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_age_policy(mut self, policy: FlatAgePolicy) -> Self {
        self.age_policy = policy;
        self
    }

    pub fn with_feature_logging(mut self, on: bool) -> Self {
        self.log_features = on;
        self
    }

    pub fn artifacts(&self) -> &ArtifactBundle {
        &self.artifacts
    }

    pub fn predict_present(&self, query: &FlatQuery) -> Result<PresentPrice, PredictError> {
        let (mut prices, _, unmatched) = self.run(ModelMode::Present, query)?;
        let price = prices.pop().ok_or_else(|| PredictError::Inference {
            mode: ModelMode::Present,
            source: ModelError::OutputCount {
                expected: 1,
                found: 0,
            },
        })?;
        tracing::debug!("present price {:.2} for {:?}", price, query.street_name);
        Ok(PresentPrice { price, unmatched })
    }

    pub fn predict_future(&self, query: &FlatQuery) -> Result<FuturePrices, PredictError> {
        let (prices, periods, unmatched) = self.run(ModelMode::Future, query)?;
        let months: Vec<(YearMonth, f64)> = periods.into_iter().zip(prices).collect();
        tracing::debug!("future prices {:?} for {:?}", months, query.street_name);
        Ok(FuturePrices { months, unmatched })
    }

    /// Present prediction for a fixed sample flat; used as a health probe.
    pub fn predict_present_sample(&self) -> Result<PresentPrice, PredictError> {
        self.predict_present(&FlatQuery::sample())
            .inspect_err(|e| tracing::error!("present self-test failed: {e}"))
    }

    /// Future prediction for a fixed sample flat; used as a health probe.
    pub fn predict_future_sample(&self) -> Result<FuturePrices, PredictError> {
        self.predict_future(&FlatQuery::sample())
            .inspect_err(|e| tracing::error!("future self-test failed: {e}"))
    }

    fn run(
        &self,
        mode: ModelMode,
        query: &FlatQuery,
    ) -> Result<(Vec<f64>, Vec<YearMonth>, Vec<UnmatchedCategory>), PredictError> {
        let today = self.clock.today();
        self.validate(query, today.year())?;

        let art = self.artifacts.get(mode);
        let built = FeatureRowBuilder::new(mode, art.street(), art.flat_type()).build(query, today);

        let mut matrix = FeatureMatrix::from_rows(art.schema(), &built.rows).map_err(|e| {
            PredictError::Inference {
                mode,
                source: e.into(),
            }
        })?;
        art.scaler()
            .apply(&mut matrix)
            .map_err(|source| PredictError::Scaling { mode, source })?;
        if self.log_features {
            log_matrix(art, &matrix);
        }

        let prices = checked_predict(art.regressor(), &matrix)
            .map_err(|source| PredictError::Inference { mode, source })?;
        Ok((prices, built.periods, built.unmatched))
    }

    fn validate(&self, query: &FlatQuery, year: i32) -> Result<(), PredictError> {
        if !query.floor_area.is_finite() || query.floor_area <= 0.0 {
            return Err(PredictError::InvalidInput(format!(
                "floor_area must be a positive number, got {}",
                query.floor_area
            )));
        }
        if query.storey_range < 0 {
            return Err(PredictError::InvalidInput(format!(
                "storey_range must not be negative, got {}",
                query.storey_range
            )));
        }

        let age = flat_age(query.lease_start, year);
        if !self.age_policy.contains(age) {
            tracing::warn!(
                "flat age {} (lease start {}) outside accepted range {:?}..={:?}",
                age,
                query.lease_start,
                self.age_policy.min,
                self.age_policy.max
            );
            if self.age_policy.enforce {
                return Err(PredictError::InvalidInput(format!(
                    "flat age {age} is outside the accepted range"
                )));
            }
        }
        Ok(())
    }
}

fn log_matrix(art: &ModeArtifacts, matrix: &FeatureMatrix) {
    for (i, row) in matrix.rows().enumerate() {
        let nz = row.iter().filter(|x| **x != 0.0).count();
        let sample: Vec<String> = art
            .schema()
            .names()
            .iter()
            .zip(row)
            .take(6)
            .map(|(name, v)| format!("{}={:.3}", name, v))
            .collect();
        tracing::info!(
            "{} row {} in_dim={} nonzero={} sample=[{}]",
            art.mode(),
            i,
            row.len(),
            nz,
            sample.join(", ")
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::FixedClock;
    use crate::features::Column;
    use crate::model::Regressor;
    use crate::registry::{CategoryIndexRegistry, CategoryKind};
    use crate::scaler::StandardScaler;
    use chrono::NaiveDate;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    /// Echoes one column back as the price and keeps every matrix it saw.
    struct Probe {
        width: usize,
        column: &'static str,
        seen: Mutex<Vec<FeatureMatrix>>,
    }

    impl Regressor for Probe {
        fn predict(&self, matrix: &FeatureMatrix) -> Result<Vec<f64>, ModelError> {
            self.seen.lock().push(matrix.clone());
            let pos = matrix.column_position(self.column).unwrap_or(0);
            Ok(matrix.rows().map(|r| 1000.0 + r[pos]).collect())
        }
        fn num_features(&self) -> Option<usize> {
            Some(self.width)
        }
        fn describe(&self) -> String {
            "probe".into()
        }
    }

    fn registry(kind: CategoryKind, slots: usize, labels: &[&str]) -> CategoryIndexRegistry {
        let entries: HashMap<String, usize> = labels
            .iter()
            .enumerate()
            .map(|(i, l)| (kind.label(l), i))
            .collect();
        CategoryIndexRegistry::new(kind, slots, entries).unwrap()
    }

    fn mode_artifacts(mode: ModelMode, echo: &'static str) -> (ModeArtifacts, Arc<Probe>) {
        let street = registry(CategoryKind::Street, 3, &["ADMIRALTY LINK", "CLEMENTI AVE 1"]);
        let flat_type = registry(CategoryKind::FlatType, 2, &["2 ROOM", "4 ROOM"]);
        let scaler = StandardScaler::from_json(
            r#"{"feature_names": ["floor_area_sqm", "storey_median", "flat_age"],
                "mean": [100.0, 0.0, 0.0], "scale": [5.0, 1.0, 1.0]}"#,
        )
        .unwrap();
        let width = crate::features::Schema::new(mode, &street, &flat_type).len();
        let probe = Arc::new(Probe {
            width,
            column: echo,
            seen: Mutex::new(Vec::new()),
        });
        let art = ModeArtifacts::new(mode, street, flat_type, scaler, probe.clone()).unwrap();
        (art, probe)
    }

    fn predictor(today: NaiveDate, echo: &'static str) -> (Predictor, Arc<Probe>, Arc<Probe>) {
        let (present, p) = mode_artifacts(ModelMode::Present, echo);
        let (future, f) = mode_artifacts(ModelMode::Future, echo);
        let bundle = ArtifactBundle::new(present, future).unwrap();
        let predictor = Predictor::new(bundle).with_clock(Arc::new(FixedClock(today)));
        (predictor, p, f)
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn present_scales_before_inference() {
        let (pred, probe, _) = predictor(date(2025, 4, 1), "floor_area_sqm");
        let out = pred.predict_present_sample().unwrap();
        // (105 - 100) / 5
        assert_eq!(out.price, 1001.0);
        let seen = probe.seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].n_rows(), 1);
        assert_eq!(seen[0].mode(), Some(ModelMode::Present));
    }

    #[test]
    fn future_batches_three_rows_in_one_call() {
        let (pred, _, probe) = predictor(date(2025, 11, 20), "month");
        let out = pred.predict_future_sample().unwrap();
        assert_eq!(out.labels(), ["12-2025", "01-2026", "02-2026"]);
        assert_eq!(out.get("12-2025"), Some(1012.0));
        assert_eq!(out.get("01-2026"), Some(1001.0));
        assert_eq!(out.get("02-2026"), Some(1002.0));
        let seen = probe.seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].n_rows(), 3);
    }

    #[test]
    fn future_rows_carry_target_year() {
        let (pred, _, _) = predictor(date(2025, 12, 1), "year");
        let out = pred.predict_future_sample().unwrap();
        let years: Vec<f64> = out.months.iter().map(|(_, p)| p - 1000.0).collect();
        assert_eq!(years, [2026.0, 2026.0, 2026.0]);
    }

    #[test]
    fn future_serializes_in_chronological_order() {
        let (pred, _, _) = predictor(date(2026, 10, 19), "month");
        let out = pred.predict_future_sample().unwrap();
        let json = serde_json::to_string(&out).unwrap();
        assert_eq!(json, r#"{"11-2026":1011.0,"12-2026":1012.0,"01-2027":1001.0}"#);
    }

    #[test]
    fn unknown_street_still_predicts() {
        let (pred, _, _) = predictor(date(2025, 4, 1), "flat_age");
        let query = FlatQuery {
            street_name: "NONEXISTENT ST".into(),
            ..FlatQuery::sample()
        };
        let out = pred.predict_present(&query).unwrap();
        assert!(out.price.is_finite());
        assert_eq!(out.unmatched.len(), 1);
        assert_eq!(out.unmatched[0].kind, CategoryKind::Street);
        assert_eq!(out.unmatched[0].label, "NONEXISTENT ST");
        let json = serde_json::to_value(&out).unwrap();
        assert_eq!(json, serde_json::json!({"price": out.price}));
    }

    #[test]
    fn unknown_lease_start_gives_zero_age() {
        let (pred, _, _) = predictor(date(2025, 4, 1), "flat_age");
        let query = FlatQuery {
            lease_start: 0,
            ..FlatQuery::sample()
        };
        assert_eq!(pred.predict_present(&query).unwrap().price, 1000.0);
    }

    #[test]
    fn negative_lease_start_counts_as_unknown() {
        let (pred, _, _) = predictor(date(2025, 4, 1), "flat_age");
        let query = FlatQuery {
            lease_start: -1990,
            ..FlatQuery::sample()
        };
        assert_eq!(pred.predict_present(&query).unwrap().price, 1000.0);
        assert!(pred.predict_future(&query).is_ok());
    }

    #[test]
    fn future_lease_start_gives_negative_age_by_default() {
        let (pred, _, _) = predictor(date(2025, 4, 1), "flat_age");
        let query = FlatQuery {
            lease_start: 2030,
            ..FlatQuery::sample()
        };
        assert_eq!(pred.predict_present(&query).unwrap().price, 995.0);
    }

    #[test]
    fn enforced_age_policy_rejects() {
        let (pred, probe, _) = predictor(date(2025, 4, 1), "flat_age");
        let pred = pred.with_age_policy(FlatAgePolicy {
            min: Some(0),
            max: Some(99),
            enforce: true,
        });
        let query = FlatQuery {
            lease_start: 2030,
            ..FlatQuery::sample()
        };
        let err = pred.predict_present(&query).unwrap_err();
        assert!(err.is_client_error());
        assert!(probe.seen.lock().is_empty());
    }

    #[test]
    fn warn_only_age_policy_passes_through() {
        let (pred, _, _) = predictor(date(2025, 4, 1), "flat_age");
        let pred = pred.with_age_policy(FlatAgePolicy {
            min: Some(0),
            max: None,
            enforce: false,
        });
        let query = FlatQuery {
            lease_start: 2030,
            ..FlatQuery::sample()
        };
        assert_eq!(pred.predict_present(&query).unwrap().price, 995.0);
    }

    #[test]
    fn rejects_bad_numbers() {
        let (pred, _, _) = predictor(date(2025, 4, 1), "flat_age");
        for query in [
            FlatQuery { floor_area: f64::NAN, ..FlatQuery::sample() },
            FlatQuery { floor_area: 0.0, ..FlatQuery::sample() },
            FlatQuery { storey_range: -1, ..FlatQuery::sample() },
        ] {
            let err = pred.predict_present(&query).unwrap_err();
            assert!(matches!(err, PredictError::InvalidInput(_)), "{query:?}");
        }
    }

    #[test]
    fn one_hot_and_calendar_columns_pass_scaling_untouched() {
        let (pred, probe, _) = predictor(date(2025, 4, 1), "month");
        pred.predict_present_sample().unwrap();
        let seen = probe.seen.lock();
        let art = pred.artifacts().get(ModelMode::Present);
        let row = seen[0].row(0).unwrap();
        for (i, col) in art.schema().columns().iter().enumerate() {
            match col {
                Column::Month => assert_eq!(row[i], 4.0),
                Column::Year => assert_eq!(row[i], 2025.0),
                Column::LeaseStart => assert_eq!(row[i], 2019.0),
                Column::Street(0) | Column::FlatType(1) => assert_eq!(row[i], 1.0),
                Column::Street(_) | Column::FlatType(_) => assert_eq!(row[i], 0.0),
                Column::FloorAreaSqm => assert_eq!(row[i], 1.0),
                Column::StoreyMedian => assert_eq!(row[i], 2.0),
                Column::FlatAge => assert_eq!(row[i], 6.0),
            }
        }
    }
}
