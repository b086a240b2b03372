/*!
This crate makes predictions with the gradient boosted decision tree models loaded by `grove_model`. It implements the three prediction modes behind one interface: regression models output their raw margin, binary classifiers output a class label or a `[P(class 0), P(class 1)]` pair, and multiclass classifiers output the winning class or a softmax distribution over all classes.

A [`Predictor`] wraps a shared [`Model`] together with a private cache of tree traversals. The cache is purely a memoization of leaf lookups, so it never changes an observable result; clear it with [`Predictor::clear_cache`] whenever its memory matters more than the saved traversals. To predict from many threads, share the `Model` and give each worker its own `Predictor` rather than synchronizing on one.
*/

#![allow(clippy::tabs_in_doc_comments)]

use fnv::FnvHashMap;
use grove_model::{FeatureError, Model, Node, Objective, Tree};
use itertools::izip;
use num_traits::ToPrimitive;
use std::{collections::hash_map::Entry, ops::Neg, sync::Arc};
use thiserror::Error;

/// The traversal cache maps a tree index and the bit image of a feature vector to that tree's computed leaf weight. Feature vectors are keyed by value, bit for bit; NaN never reaches the cache because feature validation rejects it first.
type TraversalCache = FnvHashMap<(usize, Vec<u32>), f32>;

/// An error produced by [`Predictor::predict_probabilities`].
#[derive(Debug, Error)]
pub enum PredictError {
	#[error(transparent)]
	Feature(#[from] FeatureError),
	/// Probabilities were requested for a non-classification objective.
	#[error("probabilities are only available for classification objectives")]
	UnsupportedObjective,
}

/// A snapshot of the static facts about a model.
#[derive(Clone, Debug, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelInfo {
	pub num_classes: usize,
	pub num_features: usize,
	pub num_trees: usize,
	pub objective: String,
	pub feature_names: Vec<String>,
	pub base_score: f32,
	pub is_classification: bool,
}

/// A `Predictor` evaluates feature vectors against a model.
#[derive(Debug)]
pub struct Predictor {
	model: Arc<Model>,
	cache: TraversalCache,
}

impl Predictor {
	/// Create a predictor over a shared model.
	pub fn new(model: Arc<Model>) -> Predictor {
		Predictor {
			model,
			cache: TraversalCache::default(),
		}
	}

	/// The model this predictor evaluates.
	pub fn model(&self) -> &Model {
		&self.model
	}

	/// Predict the target for a single example: the raw margin for regression models and the winning class index for classifiers. Ties between multiclass margins go to the lowest class index.
	pub fn predict(&mut self, features: &[f32]) -> Result<f32, FeatureError> {
		self.validate_features(features)?;
		match self.model.metadata.objective {
			Objective::Regression => Ok(self.raw_margins(features)?[0]),
			Objective::BinaryLogistic | Objective::BinaryHinge => {
				let probabilities = self.probabilities(features)?;
				Ok(if probabilities[1] >= 0.5 { 1.0 } else { 0.0 })
			}
			// Softmax is order preserving, so the winning class comes straight from the raw margins.
			Objective::MulticlassSoftmax => {
				let margins = self.raw_margins(features)?;
				Ok(argmax(&margins).to_f32().unwrap())
			}
		}
	}

	/// Compute the raw, untransformed margins for a single example: a single running sum for regression and binary models, and one margin per class for multiclass models.
	pub fn predict_raw(&mut self, features: &[f32]) -> Result<Vec<f32>, FeatureError> {
		self.validate_features(features)?;
		self.raw_margins(features)
	}

	/// Compute the class probability distribution for a single example. Fails for regression models, whose outputs are not probabilities.
	pub fn predict_probabilities(&mut self, features: &[f32]) -> Result<Vec<f32>, PredictError> {
		if !self.model.metadata.objective.is_classification() {
			return Err(PredictError::UnsupportedObjective);
		}
		self.validate_features(features)?;
		Ok(self.probabilities(features)?)
	}

	/// Compute split count feature importances: each feature's importance is proportional to the number of branch nodes across all trees that split on it. The importances sum to one, unless no tree has any branch, in which case they are all zero.
	pub fn feature_importances(&self) -> Vec<f32> {
		let num_features = self.model.metadata.num_features;
		let mut importances = vec![0.0; num_features];
		for tree in self.model.trees.iter() {
			for node in tree.nodes.iter() {
				if let Node::Branch(branch) = node {
					// Splits on out-of-range features are ignored rather than counted.
					if branch.feature_index < num_features {
						importances[branch.feature_index] += 1.0;
					}
				}
			}
		}
		// Normalize the importances.
		let total: f32 = importances.iter().sum();
		if total > 0.0 {
			for importance in importances.iter_mut() {
				*importance /= total;
			}
		}
		importances
	}

	/// Report the static facts about the model.
	pub fn model_info(&self) -> ModelInfo {
		let metadata = &self.model.metadata;
		ModelInfo {
			num_classes: metadata.num_classes,
			num_features: metadata.num_features,
			num_trees: self.model.trees.len(),
			objective: metadata.objective_name.clone(),
			feature_names: metadata.feature_names.clone(),
			base_score: metadata.base_score,
			is_classification: metadata.objective.is_classification(),
		}
	}

	/// Discard every cached tree traversal. Predictions made after clearing are numerically identical to predictions made before it.
	pub fn clear_cache(&mut self) {
		self.cache.clear();
	}

	fn validate_features(&self, features: &[f32]) -> Result<(), FeatureError> {
		let expected = self.model.metadata.num_features;
		if features.len() != expected {
			return Err(FeatureError::WrongLength {
				expected,
				found: features.len(),
			});
		}
		if features.iter().any(|feature| feature.is_nan()) {
			return Err(FeatureError::NotANumber);
		}
		Ok(())
	}

	/// Compute the probability distribution for an already validated example. The caller guarantees a classification objective.
	fn probabilities(&mut self, features: &[f32]) -> Result<Vec<f32>, FeatureError> {
		let mut margins = self.raw_margins(features)?;
		match self.model.metadata.objective {
			// Hinge models output a hard 0/1 on the sign of the margin.
			Objective::BinaryHinge => {
				let probability = if margins[0] > 0.0 { 1.0 } else { 0.0 };
				Ok(vec![1.0 - probability, probability])
			}
			Objective::BinaryLogistic => {
				let probability = sigmoid(margins[0]);
				Ok(vec![1.0 - probability, probability])
			}
			Objective::MulticlassSoftmax => {
				softmax(&mut margins);
				Ok(margins)
			}
			Objective::Regression => unreachable!(),
		}
	}

	/// Accumulate the raw margins for an already validated example.
	fn raw_margins(&mut self, features: &[f32]) -> Result<Vec<f32>, FeatureError> {
		let bits: Vec<u32> = features.iter().map(|feature| feature.to_bits()).collect();
		let model = &self.model;
		let cache = &mut self.cache;
		match model.metadata.objective {
			// Multiclass models accumulate each tree's weight into the class the tree was trained for. There is no base score term in this mode.
			Objective::MulticlassSoftmax => {
				let mut margins = vec![0.0; model.metadata.num_classes];
				for (tree_index, (tree, class_index)) in
					izip!(&model.trees, &model.tree_classes).enumerate()
				{
					margins[*class_index] +=
						cached_leaf_weight(cache, tree_index, tree, features, &bits)?;
				}
				Ok(margins)
			}
			// Regression and binary models accumulate every tree into a single sum seeded with the base score.
			_ => {
				let mut sum = model.metadata.base_score;
				for (tree_index, tree) in model.trees.iter().enumerate() {
					sum += cached_leaf_weight(cache, tree_index, tree, features, &bits)?;
				}
				Ok(vec![sum])
			}
		}
	}
}

/// Return the leaf weight for `tree` against this feature vector, traversing on a miss and filling the cache. The model is immutable for the predictor's lifetime, so a hit is returned without any staleness check.
fn cached_leaf_weight(
	cache: &mut TraversalCache,
	tree_index: usize,
	tree: &Tree,
	features: &[f32],
	bits: &[u32],
) -> Result<f32, FeatureError> {
	match cache.entry((tree_index, bits.to_vec())) {
		Entry::Occupied(entry) => Ok(*entry.get()),
		Entry::Vacant(entry) => {
			let value = tree.predict(features)?;
			entry.insert(value);
			Ok(value)
		}
	}
}

/// The index of the maximum score. Ties go to the first occurrence.
fn argmax(scores: &[f32]) -> usize {
	let mut max_index = 0;
	for (index, score) in scores.iter().enumerate() {
		if *score > scores[max_index] {
			max_index = index;
		}
	}
	max_index
}

/// The logistic transform, with a stability floor: inputs beyond ±40 saturate to exactly 0 or 1, far outside the region where the result differs from the saturated value at machine precision.
fn sigmoid(x: f32) -> f32 {
	if x < -40.0 {
		0.0
	} else if x > 40.0 {
		1.0
	} else {
		1.0 / (x.neg().exp() + 1.0)
	}
}

/// The numerically stable softmax transform. Scores are shifted by their maximum before exponentiating, shifted scores below the -40 stability floor contribute exactly zero, and a zero exponential sum divides by one instead, degrading to an all-zero distribution rather than NaN. The output is not re-normalized if floating error keeps it from summing to exactly one.
fn softmax(scores: &mut [f32]) {
	let max = scores.iter().fold(std::f32::MIN, |a, &b| a.max(b));
	let mut sum = 0.0;
	for score in scores.iter_mut() {
		*score = if *score - max < -40.0 {
			0.0
		} else {
			(*score - max).exp()
		};
		sum += *score;
	}
	if sum == 0.0 {
		sum = 1.0;
	}
	for score in scores.iter_mut() {
		*score /= sum;
	}
}

#[cfg(test)]
fn test_model(objective: &str, trees: Vec<serde_json::Value>) -> serde_json::Value {
	serde_json::json!({
		"learner": {
			"objective": { "name": objective },
			"gradient_booster": { "model": { "trees": trees } },
			"attributes": { "base_score": "0" },
		},
	})
}

#[cfg(test)]
fn leaf_tree(num_feature: &str, weight: f32) -> serde_json::Value {
	serde_json::json!({
		"left_children": [-1],
		"right_children": [-1],
		"split_indices": [0],
		"split_conditions": [0.0],
		"base_weights": [weight],
		"tree_param": { "num_feature": num_feature },
	})
}

#[cfg(test)]
fn make_predictor(document: serde_json::Value) -> Predictor {
	Predictor::new(Arc::new(Model::from_json(&document.to_string()).unwrap()))
}

#[test]
fn test_regression_single_tree() {
	// One tree splitting on feature 0 at 0.5, left leaf 1.0, right leaf 3.0, base score 0.5.
	let tree = serde_json::json!({
		"left_children": [1, -1, -1],
		"right_children": [2, -1, -1],
		"split_indices": [0, 0, 0],
		"split_conditions": [0.5, 0.0, 0.0],
		"base_weights": [0.0, 1.0, 3.0],
		"tree_param": { "num_feature": "1" },
	});
	let mut document = test_model("reg:squarederror", vec![tree]);
	document["learner"]["attributes"]["base_score"] = serde_json::json!("0.5");
	let mut predictor = make_predictor(document);
	assert_eq!(predictor.predict(&[0.2]).unwrap(), 1.5);
	assert_eq!(predictor.predict(&[0.8]).unwrap(), 3.5);
	assert_eq!(predictor.predict_raw(&[0.2]).unwrap(), vec![1.5]);
}

#[test]
fn test_binary_zero_margin_probabilities() {
	// A tree that always lands on a zero weight leaf with a zero base score leaves the margin at zero, so both classes are equally likely.
	let mut predictor = make_predictor(test_model("binary:logistic", vec![leaf_tree("1", 0.0)]));
	assert_eq!(
		predictor.predict_probabilities(&[123.0]).unwrap(),
		vec![0.5, 0.5],
	);
	// P(class 1) of exactly 0.5 predicts class 1.
	assert_eq!(predictor.predict(&[123.0]).unwrap(), 1.0);
}

#[test]
fn test_binary_predict_agrees_with_probabilities() {
	let tree = serde_json::json!({
		"left_children": [1, -1, -1],
		"right_children": [2, -1, -1],
		"split_indices": [0, 0, 0],
		"split_conditions": [0.0, 0.0, 0.0],
		"base_weights": [0.0, -2.0, 2.0],
		"tree_param": { "num_feature": "1" },
	});
	let mut predictor = make_predictor(test_model("binary:logistic", vec![tree]));
	for features in &[[-1.0f32], [0.0], [1.0]] {
		let probabilities = predictor.predict_probabilities(features).unwrap();
		let label = predictor.predict(features).unwrap();
		assert_eq!(label == 1.0, probabilities[1] >= 0.5);
		assert!((probabilities[0] + probabilities[1] - 1.0).abs() < 1e-6);
	}
}

#[test]
fn test_binary_hinge_probabilities() {
	let mut predictor = make_predictor(test_model("binary:hinge", vec![leaf_tree("1", 2.0)]));
	assert_eq!(predictor.predict_probabilities(&[0.0]).unwrap(), vec![0.0, 1.0]);
	let mut predictor = make_predictor(test_model("binary:hinge", vec![leaf_tree("1", -2.0)]));
	assert_eq!(predictor.predict_probabilities(&[0.0]).unwrap(), vec![1.0, 0.0]);
	// A margin of exactly zero is not positive, so it goes to class 0.
	let mut predictor = make_predictor(test_model("binary:hinge", vec![leaf_tree("1", 0.0)]));
	assert_eq!(predictor.predict_probabilities(&[0.0]).unwrap(), vec![1.0, 0.0]);
}

#[cfg(test)]
fn multiclass_predictor(weights: &[f32]) -> Predictor {
	let trees = weights
		.iter()
		.map(|weight| leaf_tree("1", *weight))
		.collect();
	let mut document = test_model("multi:softmax", trees);
	document["learner"]["objective"]["softmax_multiclass_param"] =
		serde_json::json!({ "num_class": weights.len().to_string() });
	document["learner"]["gradient_booster"]["model"]["tree_info"] =
		serde_json::json!((0..weights.len()).collect::<Vec<_>>());
	// A base score must not leak into multiclass margins.
	document["learner"]["attributes"]["base_score"] = serde_json::json!("7");
	make_predictor(document)
}

#[test]
fn test_multiclass_predictions() {
	let mut predictor = multiclass_predictor(&[1.0, 3.0, 2.0]);
	// The margins are exactly the leaf weights: no base score term in the multiclass path.
	assert_eq!(predictor.predict_raw(&[0.0]).unwrap(), vec![1.0, 3.0, 2.0]);
	assert_eq!(predictor.predict(&[0.0]).unwrap(), 1.0);
	let probabilities = predictor.predict_probabilities(&[0.0]).unwrap();
	assert_eq!(probabilities.len(), 3);
	assert!((probabilities.iter().sum::<f32>() - 1.0).abs() < 1e-6);
	// Predict agrees with the argmax over probabilities, which agrees with the argmax over margins.
	assert_eq!(argmax(&probabilities), 1);
	assert!(probabilities[1] > probabilities[2]);
	assert!(probabilities[2] > probabilities[0]);
}

#[test]
fn test_multiclass_argmax_tie_goes_to_first() {
	let mut predictor = multiclass_predictor(&[2.0, 2.0, 1.0]);
	assert_eq!(predictor.predict(&[0.0]).unwrap(), 0.0);
}

#[test]
fn test_sigmoid() {
	assert_eq!(sigmoid(-100.0), 0.0);
	assert_eq!(sigmoid(100.0), 1.0);
	assert_eq!(sigmoid(0.0), 0.5);
	assert!(sigmoid(2.0) > 0.5 && sigmoid(2.0) < 1.0);
}

#[test]
fn test_softmax_all_clamped() {
	// Every score below the stability floor degrades to an all-zero distribution instead of NaN.
	let mut scores = vec![std::f32::NEG_INFINITY; 3];
	softmax(&mut scores);
	assert_eq!(scores, vec![0.0, 0.0, 0.0]);
}

#[test]
fn test_feature_importances() {
	let split = |feature_index: u32| {
		serde_json::json!({
			"left_children": [1, -1, -1],
			"right_children": [2, -1, -1],
			"split_indices": [feature_index, 0, 0],
			"split_conditions": [0.5, 0.0, 0.0],
			"base_weights": [0.0, 1.0, 2.0],
			"tree_param": { "num_feature": "3" },
		})
	};
	let predictor = make_predictor(test_model(
		"reg:squarederror",
		vec![split(0), split(0), split(1)],
	));
	let importances = predictor.feature_importances();
	assert!((importances[0] - 2.0 / 3.0).abs() < 1e-6);
	assert!((importances[1] - 1.0 / 3.0).abs() < 1e-6);
	assert_eq!(importances[2], 0.0);
	assert!((importances.iter().sum::<f32>() - 1.0).abs() < 1e-6);
}

#[test]
fn test_feature_importances_no_splits() {
	let predictor = make_predictor(test_model(
		"reg:squarederror",
		vec![leaf_tree("2", 1.0), leaf_tree("2", 2.0)],
	));
	assert_eq!(predictor.feature_importances(), vec![0.0, 0.0]);
}

#[test]
fn test_validate_features() {
	let mut predictor = make_predictor(test_model(
		"reg:squarederror",
		vec![leaf_tree("2", 1.0)],
	));
	assert_eq!(
		predictor.predict(&[1.0]),
		Err(FeatureError::WrongLength {
			expected: 2,
			found: 1,
		}),
	);
	assert_eq!(
		predictor.predict(&[1.0, std::f32::NAN]),
		Err(FeatureError::NotANumber),
	);
	assert!(predictor.predict(&[1.0, 2.0]).is_ok());
}

#[test]
fn test_invalid_feature_index_in_tree() {
	// The tree splits on feature 3 but the model declares a single feature, so traversal fails defensively.
	let tree = serde_json::json!({
		"left_children": [1, -1, -1],
		"right_children": [2, -1, -1],
		"split_indices": [3, 0, 0],
		"split_conditions": [0.5, 0.0, 0.0],
		"base_weights": [0.0, 1.0, 2.0],
		"tree_param": { "num_feature": "1" },
	});
	let mut predictor = make_predictor(test_model("reg:squarederror", vec![tree]));
	assert_eq!(
		predictor.predict(&[0.0]),
		Err(FeatureError::InvalidFeatureIndex { feature_index: 3 }),
	);
}

#[test]
fn test_cached_predictions_are_stable() {
	let tree = serde_json::json!({
		"left_children": [1, -1, -1],
		"right_children": [2, -1, -1],
		"split_indices": [0, 0, 0],
		"split_conditions": [0.5, 0.0, 0.0],
		"base_weights": [0.0, 1.0, 3.0],
		"tree_param": { "num_feature": "1" },
	});
	let mut predictor = make_predictor(test_model("reg:squarederror", vec![tree]));
	let first = predictor.predict(&[0.2]).unwrap();
	// The second call hits the cache and must agree with the first.
	let second = predictor.predict(&[0.2]).unwrap();
	assert_eq!(first, second);
	// Clearing the cache must not change the result either.
	predictor.clear_cache();
	assert_eq!(predictor.predict(&[0.2]).unwrap(), first);
}

#[test]
fn test_probabilities_unsupported_for_regression() {
	let mut predictor = make_predictor(test_model(
		"reg:squarederror",
		vec![leaf_tree("1", 1.0)],
	));
	// The objective is checked before the features are, so even a malformed vector reports the unsupported objective.
	let error = predictor.predict_probabilities(&[1.0, 2.0, 3.0]).unwrap_err();
	assert!(matches!(error, PredictError::UnsupportedObjective));
	assert_eq!(
		error.to_string(),
		"probabilities are only available for classification objectives",
	);
}

#[test]
fn test_model_info() {
	let mut document = test_model("binary:logistic", vec![leaf_tree("2", 0.0)]);
	document["learner"]["feature_names"] = serde_json::json!(["age", "income"]);
	let predictor = make_predictor(document);
	assert_eq!(
		predictor.model_info(),
		ModelInfo {
			num_classes: 2,
			num_features: 2,
			num_trees: 1,
			objective: "binary:logistic".to_owned(),
			feature_names: vec!["age".to_owned(), "income".to_owned()],
			base_score: 0.0,
			is_classification: true,
		},
	);
}
