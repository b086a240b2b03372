/*!
This crate maps records of raw named values into the ordered numeric feature vectors the grove prediction engine consumes. A [`Pipeline`] is built once from a JSON metadata document that lists the features in model order and describes how each one is encoded: categorical features carry their category to code table, and numeric features carry the scaling parameters fit at training time.

Transforming never mutates the pipeline, so a `Pipeline` can be shared freely once constructed.
*/

#![allow(clippy::tabs_in_doc_comments)]

use std::collections::BTreeMap;
use thiserror::Error;

/// An error produced when the pipeline metadata document is malformed. These are only raised during construction.
#[derive(Debug, Error)]
pub enum MetadataError {
	/// The document is not valid JSON.
	#[error("invalid encoding")]
	InvalidEncoding(#[source] serde_json::Error),
	/// A numeric feature is missing a parameter its scaling method requires.
	#[error("feature {0} is missing scaling parameters")]
	MissingScalingParameters(String),
}

/// An error produced when a record cannot be transformed. The pipeline's state is unaffected and the call can be retried with a corrected record.
#[derive(Debug, Error, PartialEq)]
pub enum TransformError {
	/// The record is missing one or more of the declared features.
	#[error("missing required features: {}", .0.join(", "))]
	MissingFeatures(Vec<String>),
	/// A numeric feature's value is not a number.
	#[error("invalid numeric value for feature {feature}: {value}")]
	InvalidNumericValue { feature: String, value: String },
}

/// A raw value for a single feature, as it appears in an incoming record.
#[derive(Clone, Debug, PartialEq, serde::Deserialize)]
#[serde(untagged)]
pub enum Value {
	Number(f32),
	Text(String),
}

impl Value {
	/// The string form of this value, used to key categorical lookups.
	fn to_display_string(&self) -> String {
		match self {
			Value::Number(number) => number.to_string(),
			Value::Text(text) => text.clone(),
		}
	}

	/// The numeric form of this value, if it has one.
	fn to_number(&self) -> Option<f32> {
		match self {
			Value::Number(number) => Some(*number),
			Value::Text(text) => text.parse::<f32>().ok(),
		}
		.filter(|number| !number.is_nan())
	}
}

impl From<f32> for Value {
	fn from(value: f32) -> Value {
		Value::Number(value)
	}
}

impl From<&str> for Value {
	fn from(value: &str) -> Value {
		Value::Text(value.to_owned())
	}
}

/// The serialized pipeline metadata document. Optional scaling parameters are resolved against the declared scaling method exactly once, at construction.
#[derive(serde::Deserialize, Debug)]
struct RawMetadata {
	features: Vec<String>,
	#[serde(default)]
	categorical_features: BTreeMap<String, BTreeMap<String, f32>>,
	#[serde(default)]
	numeric_features: BTreeMap<String, RawScalingParameters>,
	scaling_method: RawScalingMethod,
}

#[derive(serde::Deserialize, Clone, Copy, Debug)]
#[serde(rename_all = "lowercase")]
enum RawScalingMethod {
	Standard,
	Minmax,
}

#[derive(serde::Deserialize, Debug)]
struct RawScalingParameters {
	#[serde(default)]
	mean: Option<f32>,
	#[serde(default)]
	scale: Option<f32>,
	#[serde(default)]
	min: Option<f32>,
}

/// A `FeatureTransform` describes how one named raw value becomes one numeric feature.
#[derive(Debug)]
pub enum FeatureTransform {
	Categorical(CategoricalTransform),
	Scaled(ScaledTransform),
}

/// A `CategoricalTransform` encodes a category string as the numeric code it was assigned at training time. Categories never seen in training fall back to the table's first entry.
#[derive(Debug)]
pub struct CategoricalTransform {
	/// This is the name of the feature to read from the record.
	pub source_feature_name: String,
	/// This maps each category's string form to its numeric code.
	pub codes: BTreeMap<String, f32>,
}

/// A `ScaledTransform` shifts and scales a numeric value: `(value - offset) / scale`, where the offset is the training mean for standard scaling and the training minimum for min-max scaling.
#[derive(Debug)]
pub struct ScaledTransform {
	/// This is the name of the feature to read from the record.
	pub source_feature_name: String,
	pub offset: f32,
	pub scale: f32,
}

impl CategoricalTransform {
	fn encode(&self, value: &Value) -> f32 {
		match self.codes.get(&value.to_display_string()) {
			Some(code) => *code,
			// An unseen category takes the first entry's code. An empty table poisons the feature with NaN so the engine rejects the vector instead of silently scoring it.
			None => self.codes.values().next().copied().unwrap_or(std::f32::NAN),
		}
	}
}

impl ScaledTransform {
	fn apply(&self, value: &Value) -> Result<f32, TransformError> {
		let number = value
			.to_number()
			.ok_or_else(|| TransformError::InvalidNumericValue {
				feature: self.source_feature_name.clone(),
				value: value.to_display_string(),
			})?;
		Ok((number - self.offset) / self.scale)
	}
}

/// A description of the features a pipeline consumes.
#[derive(Clone, Debug, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureInfo {
	/// Every declared feature name, in order.
	pub feature_names: Vec<String>,
	/// The categories of each categorical feature.
	pub categorical_features: BTreeMap<String, Vec<String>>,
	/// The names of the numeric features.
	pub numeric_features: Vec<String>,
}

/// A `Pipeline` maps records of raw named values to ordered numeric feature vectors.
#[derive(Debug)]
pub struct Pipeline {
	feature_names: Vec<String>,
	transforms: Vec<FeatureTransform>,
}

impl Pipeline {
	/// Parse and validate a pipeline metadata document.
	pub fn from_json(json: &str) -> Result<Pipeline, MetadataError> {
		let raw: RawMetadata =
			serde_json::from_str(json).map_err(MetadataError::InvalidEncoding)?;
		// Build one transform per declared feature, in declaration order. A feature in neither table contributes no output column.
		let mut transforms = Vec::new();
		for feature_name in raw.features.iter() {
			if let Some(codes) = raw.categorical_features.get(feature_name) {
				transforms.push(FeatureTransform::Categorical(CategoricalTransform {
					source_feature_name: feature_name.clone(),
					codes: codes.clone(),
				}));
			} else if let Some(parameters) = raw.numeric_features.get(feature_name) {
				let offset = match raw.scaling_method {
					RawScalingMethod::Standard => parameters.mean,
					RawScalingMethod::Minmax => parameters.min,
				};
				let (offset, scale) = match (offset, parameters.scale) {
					(Some(offset), Some(scale)) => (offset, scale),
					_ => {
						return Err(MetadataError::MissingScalingParameters(
							feature_name.clone(),
						))
					}
				};
				transforms.push(FeatureTransform::Scaled(ScaledTransform {
					source_feature_name: feature_name.clone(),
					offset,
					scale,
				}));
			}
		}
		Ok(Pipeline {
			feature_names: raw.features,
			transforms,
		})
	}

	/// The number of features this pipeline produces.
	pub fn n_features(&self) -> usize {
		self.transforms.len()
	}

	/// Transform a record of raw named values into the ordered numeric feature vector.
	pub fn transform(&self, record: &BTreeMap<String, Value>) -> Result<Vec<f32>, TransformError> {
		// Report every missing feature in one error.
		let missing: Vec<String> = self
			.feature_names
			.iter()
			.filter(|name| !record.contains_key(*name))
			.cloned()
			.collect();
		if !missing.is_empty() {
			return Err(TransformError::MissingFeatures(missing));
		}
		let mut features = Vec::with_capacity(self.transforms.len());
		for transform in self.transforms.iter() {
			match transform {
				FeatureTransform::Categorical(transform) => {
					features.push(transform.encode(&record[&transform.source_feature_name]));
				}
				FeatureTransform::Scaled(transform) => {
					features.push(transform.apply(&record[&transform.source_feature_name])?);
				}
			}
		}
		Ok(features)
	}

	/// Report the features this pipeline consumes: every declared name, the categories of each categorical feature, and the names of the numeric features.
	pub fn feature_info(&self) -> FeatureInfo {
		let mut categorical_features = BTreeMap::new();
		let mut numeric_features = Vec::new();
		for transform in self.transforms.iter() {
			match transform {
				FeatureTransform::Categorical(transform) => {
					categorical_features.insert(
						transform.source_feature_name.clone(),
						transform.codes.keys().cloned().collect(),
					);
				}
				FeatureTransform::Scaled(transform) => {
					numeric_features.push(transform.source_feature_name.clone());
				}
			}
		}
		FeatureInfo {
			feature_names: self.feature_names.clone(),
			categorical_features,
			numeric_features,
		}
	}
}

#[cfg(test)]
use maplit::btreemap;

#[cfg(test)]
fn test_pipeline() -> Pipeline {
	Pipeline::from_json(
		&serde_json::json!({
			"features": ["age", "color", "income"],
			"categorical_features": {
				"color": { "red": 0, "green": 1, "blue": 2 },
			},
			"numeric_features": {
				"age": { "mean": 40.0, "scale": 10.0 },
				"income": { "mean": 50000.0, "scale": 25000.0 },
			},
			"scaling_method": "standard",
		})
		.to_string(),
	)
	.unwrap()
}

#[test]
fn test_standard_scaling() {
	let pipeline = test_pipeline();
	let record = btreemap! {
		"age".to_owned() => Value::from(50.0),
		"color".to_owned() => Value::from("green"),
		"income".to_owned() => Value::from(25000.0),
	};
	assert_eq!(pipeline.transform(&record).unwrap(), vec![1.0, 1.0, -1.0]);
}

#[test]
fn test_minmax_scaling() {
	let pipeline = Pipeline::from_json(
		&serde_json::json!({
			"features": ["age"],
			"categorical_features": {},
			"numeric_features": { "age": { "min": 20.0, "scale": 40.0 } },
			"scaling_method": "minmax",
		})
		.to_string(),
	)
	.unwrap();
	let record = btreemap! { "age".to_owned() => Value::from(30.0) };
	assert_eq!(pipeline.transform(&record).unwrap(), vec![0.25]);
}

#[test]
fn test_numeric_values_parse_from_strings() {
	let pipeline = test_pipeline();
	let record = btreemap! {
		"age".to_owned() => Value::from("50"),
		"color".to_owned() => Value::from("red"),
		"income".to_owned() => Value::from(50000.0),
	};
	assert_eq!(pipeline.transform(&record).unwrap(), vec![1.0, 0.0, 0.0]);
}

#[test]
fn test_unseen_category_falls_back_to_first_entry() {
	let pipeline = test_pipeline();
	let record = btreemap! {
		"age".to_owned() => Value::from(40.0),
		"color".to_owned() => Value::from("chartreuse"),
		"income".to_owned() => Value::from(50000.0),
	};
	// The table's first entry is "blue".
	assert_eq!(pipeline.transform(&record).unwrap(), vec![0.0, 2.0, 0.0]);
}

#[test]
fn test_categorical_lookup_uses_the_string_form_of_numbers() {
	let pipeline = Pipeline::from_json(
		&serde_json::json!({
			"features": ["digit"],
			"categorical_features": { "digit": { "3": 7.0, "4": 9.0 } },
			"numeric_features": {},
			"scaling_method": "standard",
		})
		.to_string(),
	)
	.unwrap();
	let record = btreemap! { "digit".to_owned() => Value::from(3.0) };
	assert_eq!(pipeline.transform(&record).unwrap(), vec![7.0]);
}

#[test]
fn test_missing_features_are_reported_together() {
	let pipeline = test_pipeline();
	let record = btreemap! { "color".to_owned() => Value::from("red") };
	let error = pipeline.transform(&record).unwrap_err();
	assert_eq!(
		error,
		TransformError::MissingFeatures(vec!["age".to_owned(), "income".to_owned()]),
	);
	assert_eq!(error.to_string(), "missing required features: age, income");
}

#[test]
fn test_invalid_numeric_value() {
	let pipeline = test_pipeline();
	let record = btreemap! {
		"age".to_owned() => Value::from("plenty"),
		"color".to_owned() => Value::from("red"),
		"income".to_owned() => Value::from(50000.0),
	};
	assert_eq!(
		pipeline.transform(&record).unwrap_err(),
		TransformError::InvalidNumericValue {
			feature: "age".to_owned(),
			value: "plenty".to_owned(),
		},
	);
}

#[test]
fn test_unmapped_features_contribute_no_column() {
	// "mystery" is declared but in neither table, so the output is one column short and the record must still carry it.
	let pipeline = Pipeline::from_json(
		&serde_json::json!({
			"features": ["age", "mystery"],
			"categorical_features": {},
			"numeric_features": { "age": { "mean": 40.0, "scale": 10.0 } },
			"scaling_method": "standard",
		})
		.to_string(),
	)
	.unwrap();
	assert_eq!(pipeline.n_features(), 1);
	let record = btreemap! { "age".to_owned() => Value::from(40.0) };
	assert_eq!(
		pipeline.transform(&record).unwrap_err(),
		TransformError::MissingFeatures(vec!["mystery".to_owned()]),
	);
	let record = btreemap! {
		"age".to_owned() => Value::from(40.0),
		"mystery".to_owned() => Value::from(0.0),
	};
	assert_eq!(pipeline.transform(&record).unwrap(), vec![0.0]);
}

#[test]
fn test_missing_scaling_parameters() {
	let error = Pipeline::from_json(
		&serde_json::json!({
			"features": ["age"],
			"categorical_features": {},
			"numeric_features": { "age": { "mean": 40.0 } },
			"scaling_method": "standard",
		})
		.to_string(),
	)
	.unwrap_err();
	assert!(matches!(error, MetadataError::MissingScalingParameters(_)));
	// Min-max scaling needs min, not mean.
	let error = Pipeline::from_json(
		&serde_json::json!({
			"features": ["age"],
			"categorical_features": {},
			"numeric_features": { "age": { "mean": 40.0, "scale": 10.0 } },
			"scaling_method": "minmax",
		})
		.to_string(),
	)
	.unwrap_err();
	assert!(matches!(error, MetadataError::MissingScalingParameters(_)));
}

#[test]
fn test_feature_info() {
	let pipeline = test_pipeline();
	assert_eq!(
		pipeline.feature_info(),
		FeatureInfo {
			feature_names: vec!["age".to_owned(), "color".to_owned(), "income".to_owned()],
			categorical_features: btreemap! {
				"color".to_owned() => vec!["blue".to_owned(), "green".to_owned(), "red".to_owned()],
			},
			numeric_features: vec!["age".to_owned(), "income".to_owned()],
		},
	);
}
