#![allow(dead_code)]

use chrono::NaiveDate;
use serde_json::{json, Value};
use std::{fs, path::Path, sync::Arc};

use hdb_predictor::{
    calendar::FixedClock,
    config::{ArtifactsConfig, ModeFiles, ServiceConfig},
    server, Predictor,
};

pub const PRESENT_STREETS: [&str; 4] = [
    "ADMIRALTY LINK",
    "ANG MO KIO AVE 3",
    "CLEMENTI AVE 1",
    "YISHUN RING RD",
];
pub const FUTURE_STREETS: [&str; 5] = [
    "ADMIRALTY LINK",
    "ANG MO KIO AVE 3",
    "CLEMENTI AVE 1",
    "YISHUN RING RD",
    "PUNGGOL FIELD",
];
pub const PRESENT_FLAT_TYPES: [&str; 3] = ["2 ROOM", "3 ROOM", "4 ROOM"];
pub const FUTURE_FLAT_TYPES: [&str; 4] = ["2 ROOM", "3 ROOM", "4 ROOM", "EXECUTIVE"];

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

fn registry_json(prefix: &str, labels: &[&str]) -> Value {
    let map: serde_json::Map<String, Value> = labels
        .iter()
        .enumerate()
        .map(|(i, l)| (format!("{prefix}{l}"), json!(i)))
        .collect();
    Value::Object(map)
}

pub fn scaler_json() -> Value {
    json!({
        "feature_names": ["floor_area_sqm", "storey_median", "flat_age"],
        "mean": [95.0, 2.0, 20.0],
        "scale": [25.0, 1.0, 15.0]
    })
}

/// Single-split tree: `f < threshold ? left : right`.
fn stump(feature: usize, threshold: f64, left: f64, right: f64) -> Value {
    json!({
        "tree_param": {"num_nodes": "3", "num_feature": "0", "num_deleted": "0", "size_leaf_vector": "1"},
        "id": 0,
        "left_children": [1, -1, -1],
        "right_children": [2, -1, -1],
        "parents": [2147483647, 0, 0],
        "split_indices": [feature, 0, 0],
        "split_conditions": [threshold, left, right],
        "split_type": [0, 0, 0],
        "default_left": [0, 0, 0],
        "base_weights": [0.0, left, right],
        "loss_changes": [1.0, 0.0, 0.0],
        "sum_hessian": [3.0, 1.0, 2.0],
        "categories": [],
        "categories_nodes": [],
        "categories_segments": [],
        "categories_sizes": []
    })
}

pub fn xgb_model(feature_names: &[String], trees: Vec<Value>, base_score: &str) -> Value {
    let n = trees.len();
    json!({
        "learner": {
            "attributes": {},
            "feature_names": feature_names,
            "feature_types": vec!["float"; feature_names.len()],
            "gradient_booster": {
                "name": "gbtree",
                "model": {
                    "gbtree_model_param": {"num_parallel_tree": "1", "num_trees": n.to_string()},
                    "iteration_indptr": (0..=n).collect::<Vec<_>>(),
                    "tree_info": vec![0; n],
                    "trees": trees
                }
            },
            "learner_model_param": {
                "base_score": base_score,
                "boost_from_average": "1",
                "num_class": "0",
                "num_feature": feature_names.len().to_string(),
                "num_target": "1"
            },
            "objective": {"name": "reg:squarederror", "reg_loss_param": {"scale_pos_weight": "1"}}
        },
        "version": [2, 0, 3]
    })
}

pub fn present_feature_names() -> Vec<String> {
    let mut names: Vec<String> = [
        "month",
        "floor_area_sqm",
        "lease_start",
        "year",
        "storey_median",
        "flat_age",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    names.extend(PRESENT_STREETS.iter().map(|s| format!("street_name_{s}")));
    names.extend(PRESENT_FLAT_TYPES.iter().map(|s| format!("flat_type_{s}")));
    names
}

pub fn future_feature_names() -> Vec<String> {
    let mut names: Vec<String> = ["floor_area_sqm", "lease_start", "storey_median", "flat_age"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    names.extend(FUTURE_STREETS.iter().map(|s| format!("street_name_{s}")));
    names.extend(FUTURE_FLAT_TYPES.iter().map(|s| format!("flat_type_{s}")));
    names.push("year".into());
    names.push("month".into());
    names
}

// present: 400k/500k on scaled floor area, +50k for ADMIRALTY LINK
pub fn present_model(base_score: &str) -> Value {
    xgb_model(
        &present_feature_names(),
        vec![stump(1, 0.0, 400_000.0, 500_000.0), stump(6, 0.5, 0.0, 50_000.0)],
        base_score,
    )
}

// future: same as present plus +1k before July, +2k from July
pub fn future_model(base_score: &str) -> Value {
    xgb_model(
        &future_feature_names(),
        vec![
            stump(0, 0.0, 400_000.0, 500_000.0),
            stump(4, 0.5, 0.0, 50_000.0),
            stump(14, 6.5, 1_000.0, 2_000.0),
        ],
        base_score,
    )
}

fn write_json(path: &Path, value: &Value) {
    fs::write(path, serde_json::to_string_pretty(value).unwrap()).unwrap();
}

/// Write a complete artifact set under `root/{present,future}` and return a
/// config pointing at it.
pub fn write_artifacts(root: &Path) -> ServiceConfig {
    for (mode, streets, flat_types, model) in [
        ("present", &PRESENT_STREETS[..], &PRESENT_FLAT_TYPES[..], present_model("0")),
        ("future", &FUTURE_STREETS[..], &FUTURE_FLAT_TYPES[..], future_model("[0E0]")),
    ] {
        let dir = root.join(mode);
        fs::create_dir_all(&dir).unwrap();
        write_json(&dir.join("cols_street_name.json"), &registry_json("street_name_", streets));
        write_json(&dir.join("cols_flat_type.json"), &registry_json("flat_type_", flat_types));
        write_json(&dir.join("scaler.json"), &scaler_json());
        write_json(&dir.join("model.json"), &model);
    }

    ServiceConfig {
        artifacts: ArtifactsConfig {
            root: root.to_path_buf(),
            present: ModeFiles {
                street_slots: Some(PRESENT_STREETS.len()),
                flat_type_slots: Some(PRESENT_FLAT_TYPES.len()),
                ..ModeFiles::default()
            },
            future: ModeFiles {
                street_slots: Some(FUTURE_STREETS.len()),
                flat_type_slots: Some(FUTURE_FLAT_TYPES.len()),
                ..ModeFiles::default()
            },
        },
        ..ServiceConfig::default()
    }
}

pub fn overwrite(root: &Path, mode: &str, file: &str, value: &Value) {
    write_json(&root.join(mode).join(file), value);
}

pub fn predictor_at(cfg: &ServiceConfig, today: NaiveDate) -> Predictor {
    server::build_predictor(cfg, Arc::new(FixedClock(today))).unwrap()
}
