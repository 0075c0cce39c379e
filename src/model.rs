//! Pretrained price regressors.
//!
//! The orchestrator only sees [`Regressor`]: a matrix goes in, one price per
//! row comes out. The default backend evaluates an XGBoost model saved with
//! `Booster.save_model("*.json")`; the TorchScript backend lives in
//! [`crate::torch`] behind the `torch` feature.

use serde::{Deserialize, Deserializer};
use serde_with::{serde_as, DisplayFromStr};
use std::{fs, path::Path};

use crate::features::{FeatureMatrix, SchemaError};

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("failed to read model {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse model: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("unsupported model: {0}")]
    Unsupported(String),
    #[error("tree {tree} node {node}: {reason}")]
    MalformedTree {
        tree: usize,
        node: usize,
        reason: String,
    },
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error("model produced {found} outputs for {expected} rows")]
    OutputCount { expected: usize, found: usize },
    #[error("model produced non-finite prediction {value} for row {row}")]
    NonFinite { row: usize, value: f64 },
    #[error("inference backend failed: {0}")]
    Backend(String),
}

/// An opaque trained regressor.
pub trait Regressor: Send + Sync {
    /// One prediction per matrix row, in row order.
    fn predict(&self, matrix: &FeatureMatrix) -> Result<Vec<f64>, ModelError>;

    /// Input width the artifact was trained with, when it records one.
    fn num_features(&self) -> Option<usize>;

    /// Training column names, when the artifact records them.
    fn feature_names(&self) -> Option<&[String]> {
        None
    }

    /// Short backend name for logs.
    fn describe(&self) -> String;
}

/// Reject matrices whose width does not match the regressor, then make sure
/// the backend answered once per row with a finite value.
pub fn checked_predict(
    regressor: &dyn Regressor,
    matrix: &FeatureMatrix,
) -> Result<Vec<f64>, ModelError> {
    if let Some(expected) = regressor.num_features() {
        if matrix.n_cols() != expected {
            return Err(SchemaError::Width {
                expected,
                found: matrix.n_cols(),
            }
            .into());
        }
    }
    let out = regressor.predict(matrix)?;
    if out.len() != matrix.n_rows() {
        return Err(ModelError::OutputCount {
            expected: matrix.n_rows(),
            found: out.len(),
        });
    }
    if let Some((row, &value)) = out.iter().enumerate().find(|(_, v)| !v.is_finite()) {
        return Err(ModelError::NonFinite { row, value });
    }
    Ok(out)
}

// --- XGBoost JSON --------------------------------------------------------------------

/// `base_score` is written as `"5E-1"` by older releases and `"[4.5E5]"` by
/// newer ones; accept a number, a string, or a one-element array of either.
fn deserialize_base_score<'de, D>(deserializer: D) -> Result<f32, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error as _;
    use serde_json::Value;

    let mut cur = Value::deserialize(deserializer)?;
    loop {
        match cur {
            Value::Number(n) => {
                return n
                    .as_f64()
                    .map(|f| f as f32)
                    .ok_or_else(|| D::Error::custom("invalid base_score number"));
            }
            Value::String(s) => {
                let t = s.trim();
                let inner = t
                    .strip_prefix('[')
                    .and_then(|t| t.strip_suffix(']'))
                    .unwrap_or(t);
                return inner
                    .trim()
                    .parse::<f32>()
                    .map_err(|_| D::Error::custom(format!("cannot parse base_score {s:?}")));
            }
            Value::Array(arr) => {
                cur = arr
                    .into_iter()
                    .next()
                    .ok_or_else(|| D::Error::custom("empty base_score array"))?;
            }
            _ => return Err(D::Error::custom("base_score must be a number or string")),
        }
    }
}

/// `default_left` entries are 0/1 in JSON and booleans in some exporters.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(untagged)]
enum Flag {
    Bool(bool),
    Int(i64),
}

impl Flag {
    fn get(self) -> bool {
        match self {
            Flag::Bool(b) => b,
            Flag::Int(i) => i != 0,
        }
    }
}

#[derive(Debug, Deserialize)]
struct XgbTree {
    left_children: Vec<i32>,
    right_children: Vec<i32>,
    split_indices: Vec<i64>,
    split_conditions: Vec<f32>,
    default_left: Vec<Flag>,
    #[serde(default)]
    split_type: Vec<i32>,
}

#[serde_as]
#[derive(Debug, Deserialize)]
struct XgbGbtreeParam {
    #[serde_as(as = "DisplayFromStr")]
    num_parallel_tree: i64,
}

#[derive(Debug, Deserialize)]
struct XgbTrees {
    trees: Vec<XgbTree>,
    #[serde(default)]
    tree_info: Vec<i32>,
    gbtree_model_param: Option<XgbGbtreeParam>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "name", rename_all = "lowercase")]
enum XgbBooster {
    Gbtree { model: XgbTrees },
    Gblinear {},
    Dart {},
}

#[derive(Debug, Deserialize)]
struct XgbObjective {
    name: String,
}

#[serde_as]
#[derive(Debug, Deserialize)]
struct XgbLearnerParam {
    #[serde(deserialize_with = "deserialize_base_score")]
    base_score: f32,
    #[serde_as(as = "DisplayFromStr")]
    num_feature: i64,
    #[serde_as(as = "Option<DisplayFromStr>")]
    num_target: Option<i64>,
    #[serde_as(as = "Option<DisplayFromStr>")]
    num_class: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct XgbLearner {
    #[serde(default)]
    feature_names: Vec<String>,
    gradient_booster: XgbBooster,
    learner_model_param: XgbLearnerParam,
    objective: XgbObjective,
}

#[derive(Debug, Deserialize)]
struct XgbModel {
    learner: XgbLearner,
}

/// How the summed margin maps back to the target scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Link {
    Identity,
    Log,
}

impl Link {
    fn for_objective(name: &str) -> Result<Self, ModelError> {
        match name {
            "reg:squarederror" | "reg:linear" | "reg:absoluteerror" | "reg:pseudohubererror"
            | "reg:quantileerror" => Ok(Link::Identity),
            "reg:gamma" | "reg:tweedie" | "count:poisson" => Ok(Link::Log),
            other => Err(ModelError::Unsupported(format!(
                "objective {other} is not a regression objective"
            ))),
        }
    }

    fn to_margin(self, base_score: f32) -> f32 {
        match self {
            Link::Identity => base_score,
            Link::Log => base_score.max(1e-7).ln(),
        }
    }

    fn apply(self, margin: f64) -> f64 {
        match self {
            Link::Identity => margin,
            Link::Log => margin.exp(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Node {
    Split {
        feature: usize,
        threshold: f32,
        default_left: bool,
        left: u32,
        right: u32,
    },
    Leaf(f32),
}

#[derive(Debug, Clone, PartialEq)]
struct Tree {
    nodes: Vec<Node>,
}

impl Tree {
    fn from_xgb(t: &XgbTree, tree: usize, num_feature: usize) -> Result<Self, ModelError> {
        let n = t.left_children.len();
        let malformed = |node: usize, reason: String| ModelError::MalformedTree { tree, node, reason };
        if n == 0 {
            return Err(malformed(0, "tree has no nodes".into()));
        }
        for (name, len) in [
            ("right_children", t.right_children.len()),
            ("split_indices", t.split_indices.len()),
            ("split_conditions", t.split_conditions.len()),
            ("default_left", t.default_left.len()),
        ] {
            if len != n {
                return Err(malformed(0, format!("{name} has {len} entries, expected {n}")));
            }
        }

        let mut nodes = Vec::with_capacity(n);
        for i in 0..n {
            let (l, r) = (t.left_children[i], t.right_children[i]);
            if l == -1 {
                // leaf values live in split_conditions
                nodes.push(Node::Leaf(t.split_conditions[i]));
                continue;
            }
            if t.split_type.get(i).copied().unwrap_or(0) != 0 {
                return Err(ModelError::Unsupported(format!(
                    "categorical split in tree {tree} node {i}"
                )));
            }
            // children always come after their parent, which also rules out cycles
            for child in [l, r] {
                if child <= i as i32 || child as usize >= n {
                    return Err(malformed(i, format!("child index {child} out of range")));
                }
            }
            let feature = usize::try_from(t.split_indices[i])
                .ok()
                .filter(|&f| f < num_feature)
                .ok_or_else(|| malformed(i, format!("split feature {}", t.split_indices[i])))?;
            nodes.push(Node::Split {
                feature,
                threshold: t.split_conditions[i],
                default_left: t.default_left[i].get(),
                left: l as u32,
                right: r as u32,
            });
        }
        Ok(Self { nodes })
    }

    fn leaf(&self, row: &[f32]) -> f32 {
        let mut idx = 0usize;
        loop {
            match self.nodes[idx] {
                Node::Leaf(v) => return v,
                Node::Split {
                    feature,
                    threshold,
                    default_left,
                    left,
                    right,
                } => {
                    let x = row[feature];
                    let go_left = if x.is_nan() { default_left } else { x < threshold };
                    idx = (if go_left { left } else { right }) as usize;
                }
            }
        }
    }
}

/// Gradient-boosted tree ensemble evaluated natively.
#[derive(Debug, Clone)]
pub struct TreeEnsemble {
    trees: Vec<Tree>,
    base_margin: f32,
    link: Link,
    num_feature: usize,
    feature_names: Vec<String>,
    objective: String,
}

impl TreeEnsemble {
    pub fn from_json(json: &str) -> Result<Self, ModelError> {
        let model: XgbModel = serde_json::from_str(json)?;
        let XgbLearner {
            feature_names,
            gradient_booster,
            learner_model_param: param,
            objective,
        } = model.learner;

        let trees = match gradient_booster {
            XgbBooster::Gbtree { model } => model,
            XgbBooster::Gblinear {} => {
                return Err(ModelError::Unsupported("gblinear booster".into()))
            }
            XgbBooster::Dart {} => return Err(ModelError::Unsupported("dart booster".into())),
        };
        if param.num_target.unwrap_or(1) > 1 || param.num_class.unwrap_or(0) > 1 {
            return Err(ModelError::Unsupported("multi-output model".into()));
        }
        if trees.tree_info.iter().any(|&g| g != 0) {
            return Err(ModelError::Unsupported("trees for more than one output group".into()));
        }
        if let Some(p) = &trees.gbtree_model_param {
            if p.num_parallel_tree > 1 {
                tracing::debug!("model uses {} parallel trees per round", p.num_parallel_tree);
            }
        }

        let num_feature = usize::try_from(param.num_feature)
            .map_err(|_| ModelError::Unsupported(format!("num_feature {}", param.num_feature)))?;
        if !feature_names.is_empty() && feature_names.len() != num_feature {
            return Err(ModelError::Unsupported(format!(
                "{} feature names for {} features",
                feature_names.len(),
                num_feature
            )));
        }
        let link = Link::for_objective(&objective.name)?;
        let trees = trees
            .trees
            .iter()
            .enumerate()
            .map(|(i, t)| Tree::from_xgb(t, i, num_feature))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            trees,
            base_margin: link.to_margin(param.base_score),
            link,
            num_feature,
            feature_names,
            objective: objective.name,
        })
    }

    pub fn load(path: &Path) -> Result<Self, ModelError> {
        let txt = fs::read_to_string(path).map_err(|source| ModelError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let model = Self::from_json(&txt)?;
        tracing::info!("loaded {} from {}", model.describe(), path.display());
        Ok(model)
    }

    pub fn num_trees(&self) -> usize {
        self.trees.len()
    }

    fn predict_row(&self, row: &[f32]) -> f64 {
        // XGBoost accumulates in f32
        let margin = self
            .trees
            .iter()
            .fold(self.base_margin, |acc, t| acc + t.leaf(row));
        self.link.apply(f64::from(margin))
    }
}

impl Regressor for TreeEnsemble {
    fn predict(&self, matrix: &FeatureMatrix) -> Result<Vec<f64>, ModelError> {
        if matrix.n_cols() != self.num_feature {
            return Err(SchemaError::Width {
                expected: self.num_feature,
                found: matrix.n_cols(),
            }
            .into());
        }
        let mut buf = vec![0f32; self.num_feature];
        Ok(matrix
            .rows()
            .map(|row| {
                for (dst, &src) in buf.iter_mut().zip(row) {
                    *dst = src as f32;
                }
                self.predict_row(&buf)
            })
            .collect())
    }

    fn num_features(&self) -> Option<usize> {
        Some(self.num_feature)
    }

    fn feature_names(&self) -> Option<&[String]> {
        (!self.feature_names.is_empty()).then_some(self.feature_names.as_slice())
    }

    fn describe(&self) -> String {
        format!(
            "xgboost {} ({} trees, {} features)",
            self.objective,
            self.trees.len(),
            self.num_feature
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // Two stumps on three features:
    //   tree 0: f0 < 0.5 ? 10 : 20
    //   tree 1: f2 < 1.0 ? -1 : 1   (missing goes right)
    fn model_json(objective: &str, base_score: serde_json::Value) -> String {
        json!({
            "learner": {
                "feature_names": ["a", "b", "c"],
                "gradient_booster": {
                    "name": "gbtree",
                    "model": {
                        "gbtree_model_param": {"num_parallel_tree": "1", "num_trees": "2"},
                        "tree_info": [0, 0],
                        "trees": [
                            {
                                "left_children": [1, -1, -1],
                                "right_children": [2, -1, -1],
                                "split_indices": [0, 0, 0],
                                "split_conditions": [0.5, 10.0, 20.0],
                                "default_left": [1, 0, 0],
                                "split_type": [0, 0, 0]
                            },
                            {
                                "left_children": [1, -1, -1],
                                "right_children": [2, -1, -1],
                                "split_indices": [2, 0, 0],
                                "split_conditions": [1.0, -1.0, 1.0],
                                "default_left": [false, false, false]
                            }
                        ]
                    }
                },
                "learner_model_param": {
                    "base_score": base_score,
                    "num_feature": "3",
                    "num_class": "0",
                    "num_target": "1"
                },
                "objective": {"name": objective}
            },
            "version": [2, 0, 3]
        })
        .to_string()
    }

    fn matrix(values: Vec<f64>) -> FeatureMatrix {
        FeatureMatrix::from_raw(vec!["a".into(), "b".into(), "c".into()], values).unwrap()
    }

    #[test]
    fn sums_leaves_and_base_score() {
        let m = TreeEnsemble::from_json(&model_json("reg:squarederror", json!("[1E2]"))).unwrap();
        assert_eq!(m.num_trees(), 2);
        let out = m
            .predict(&matrix(vec![0.0, 9.0, 0.0, 1.0, 9.0, 5.0]))
            .unwrap();
        assert_eq!(out, vec![109.0, 121.0]);
    }

    #[test]
    fn threshold_equality_goes_right() {
        let m = TreeEnsemble::from_json(&model_json("reg:squarederror", json!("0"))).unwrap();
        let out = m.predict(&matrix(vec![0.5, 0.0, 1.0])).unwrap();
        assert_eq!(out, vec![21.0]);
    }

    #[test]
    fn missing_value_follows_default_direction() {
        let m = TreeEnsemble::from_json(&model_json("reg:squarederror", json!(0.0))).unwrap();
        let out = m.predict(&matrix(vec![f64::NAN, 0.0, f64::NAN])).unwrap();
        assert_eq!(out, vec![11.0]);
    }

    #[test]
    fn log_link_objectives_exponentiate() {
        let m = TreeEnsemble::from_json(&model_json("reg:gamma", json!("1"))).unwrap();
        let out = m.predict(&matrix(vec![0.0, 0.0, 0.0])).unwrap();
        assert!((out[0] - 9f64.exp()).abs() < 1e-3 * 9f64.exp());
    }

    #[test]
    fn exposes_feature_names() {
        let m = TreeEnsemble::from_json(&model_json("reg:squarederror", json!("0"))).unwrap();
        assert_eq!(m.num_features(), Some(3));
        assert_eq!(m.feature_names().unwrap(), ["a", "b", "c"]);
    }

    #[test]
    fn rejects_wrong_width() {
        let m = TreeEnsemble::from_json(&model_json("reg:squarederror", json!("0"))).unwrap();
        let narrow = FeatureMatrix::from_raw(vec!["a".into()], vec![1.0]).unwrap();
        let err = m.predict(&narrow).unwrap_err();
        assert!(matches!(err, ModelError::Schema(SchemaError::Width { expected: 3, found: 1 })));
    }

    #[test]
    fn rejects_classification_objective() {
        let err = TreeEnsemble::from_json(&model_json("binary:logistic", json!("0.5"))).unwrap_err();
        assert!(matches!(err, ModelError::Unsupported(_)));
    }

    #[test]
    fn rejects_gblinear() {
        let json = json!({
            "learner": {
                "gradient_booster": {"name": "gblinear", "model": {"weights": [0.1]}},
                "learner_model_param": {"base_score": "0", "num_feature": "1"},
                "objective": {"name": "reg:squarederror"}
            }
        });
        let err = TreeEnsemble::from_json(&json.to_string()).unwrap_err();
        assert!(matches!(err, ModelError::Unsupported(_)));
    }

    #[test]
    fn rejects_backward_child_reference() {
        let mut v: serde_json::Value =
            serde_json::from_str(&model_json("reg:squarederror", json!("0"))).unwrap();
        v["learner"]["gradient_booster"]["model"]["trees"][0]["left_children"] = json!([0, -1, -1]);
        let err = TreeEnsemble::from_json(&v.to_string()).unwrap_err();
        assert!(matches!(err, ModelError::MalformedTree { tree: 0, node: 0, .. }));
    }

    #[test]
    fn rejects_split_on_unknown_feature() {
        let mut v: serde_json::Value =
            serde_json::from_str(&model_json("reg:squarederror", json!("0"))).unwrap();
        v["learner"]["gradient_booster"]["model"]["trees"][1]["split_indices"] = json!([7, 0, 0]);
        let err = TreeEnsemble::from_json(&v.to_string()).unwrap_err();
        assert!(matches!(err, ModelError::MalformedTree { tree: 1, .. }));
    }

    struct Constant(Vec<f64>);

    impl Regressor for Constant {
        fn predict(&self, _: &FeatureMatrix) -> Result<Vec<f64>, ModelError> {
            Ok(self.0.clone())
        }
        fn num_features(&self) -> Option<usize> {
            None
        }
        fn describe(&self) -> String {
            "constant".into()
        }
    }

    #[test]
    fn checked_predict_flags_short_output() {
        let err = checked_predict(&Constant(vec![1.0]), &matrix(vec![0.0; 6])).unwrap_err();
        assert!(matches!(err, ModelError::OutputCount { expected: 2, found: 1 }));
    }

    #[test]
    fn checked_predict_flags_nan() {
        let err = checked_predict(&Constant(vec![1.0, f64::NAN]), &matrix(vec![0.0; 6])).unwrap_err();
        assert!(matches!(err, ModelError::NonFinite { row: 1, .. }));
    }
}
