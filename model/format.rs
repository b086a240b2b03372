use crate::{
	BranchNode, LeafNode, Metadata, Model, ModelFormatError, Node, Objective, Tree,
};
use itertools::izip;
use num_traits::ToPrimitive;
use std::{collections::BTreeMap, convert::TryFrom};

/*
The serialized model document. Every field the loader reads is declared optional here, and the `TryFrom` conversion below resolves each one to its value or default exactly once, so no optional lookup survives past construction.
*/

#[derive(serde::Deserialize, Debug)]
pub(crate) struct RawModel {
	#[serde(default)]
	learner: Option<RawLearner>,
}

#[derive(serde::Deserialize, Debug)]
struct RawLearner {
	#[serde(default)]
	objective: Option<RawObjective>,
	#[serde(default)]
	gradient_booster: Option<RawGradientBooster>,
	#[serde(default)]
	attributes: Option<BTreeMap<String, String>>,
	#[serde(default)]
	feature_names: Option<Vec<String>>,
}

#[derive(serde::Deserialize, Debug)]
struct RawObjective {
	#[serde(default)]
	name: Option<String>,
	#[serde(default)]
	softmax_multiclass_param: Option<RawSoftmaxMulticlassParam>,
}

#[derive(serde::Deserialize, Debug)]
struct RawSoftmaxMulticlassParam {
	#[serde(default)]
	num_class: Option<String>,
}

#[derive(serde::Deserialize, Debug)]
struct RawGradientBooster {
	#[serde(default)]
	model: Option<RawBoosterModel>,
}

#[derive(serde::Deserialize, Debug)]
struct RawBoosterModel {
	#[serde(default)]
	trees: Vec<RawTree>,
	#[serde(default)]
	tree_info: Vec<i64>,
}

/// One tree record: parallel arrays indexed by node, where a left child of -1 marks a leaf.
#[derive(serde::Deserialize, Debug)]
struct RawTree {
	#[serde(default)]
	left_children: Vec<i64>,
	#[serde(default)]
	right_children: Vec<i64>,
	#[serde(default)]
	split_indices: Vec<i64>,
	#[serde(default)]
	split_conditions: Vec<f32>,
	#[serde(default)]
	base_weights: Vec<f32>,
	#[serde(default)]
	tree_param: Option<RawTreeParam>,
}

#[derive(serde::Deserialize, Debug)]
struct RawTreeParam {
	#[serde(default)]
	num_feature: Option<String>,
}

impl TryFrom<RawModel> for Model {
	type Error = ModelFormatError;

	fn try_from(raw: RawModel) -> Result<Model, ModelFormatError> {
		let learner = raw.learner.ok_or(ModelFormatError::MissingObjective)?;
		let objective_name = learner
			.objective
			.as_ref()
			.and_then(|objective| objective.name.clone())
			.ok_or(ModelFormatError::MissingObjective)?;
		// Resolve the objective kind and class count from the objective name. An absent or unparseable multiclass class count falls back to 2.
		let (objective, num_classes) = if objective_name.starts_with("multi:") {
			let num_classes = learner
				.objective
				.as_ref()
				.and_then(|objective| objective.softmax_multiclass_param.as_ref())
				.and_then(|param| param.num_class.as_ref())
				.and_then(|num_class| num_class.parse::<usize>().ok())
				.unwrap_or(2);
			(Objective::MulticlassSoftmax, num_classes)
		} else if objective_name == "binary:hinge" {
			(Objective::BinaryHinge, 2)
		} else if objective_name.starts_with("binary:") {
			(Objective::BinaryLogistic, 2)
		} else {
			(Objective::Regression, 1)
		};
		let booster_model = learner
			.gradient_booster
			.and_then(|gradient_booster| gradient_booster.model)
			.ok_or(ModelFormatError::NoTrees)?;
		if booster_model.trees.is_empty() {
			return Err(ModelFormatError::NoTrees);
		}
		// The first tree's declared feature count is authoritative, but every tree must agree with it.
		let num_features = tree_num_features(0, &booster_model.trees[0])?;
		for (tree_index, tree) in booster_model.trees.iter().enumerate().skip(1) {
			if tree_num_features(tree_index, tree)? != num_features {
				return Err(ModelFormatError::InconsistentFeatureCount);
			}
		}
		let trees = booster_model
			.trees
			.iter()
			.enumerate()
			.map(|(tree_index, tree)| tree_from_raw(tree_index, tree))
			.collect::<Result<Vec<_>, _>>()?;
		// For multiclass models, every tree must be assigned a class in range. The mapping is unused for the other objectives and is ignored entirely.
		let tree_classes = if objective == Objective::MulticlassSoftmax {
			if booster_model.tree_info.len() != trees.len() {
				return Err(ModelFormatError::InvalidTreeInfo);
			}
			booster_model
				.tree_info
				.iter()
				.map(|class_index| {
					class_index
						.to_usize()
						.filter(|class_index| *class_index < num_classes)
						.ok_or(ModelFormatError::InvalidTreeInfo)
				})
				.collect::<Result<Vec<_>, _>>()?
		} else {
			Vec::new()
		};
		// An absent or unparseable base score attribute falls back to 0.5.
		let base_score = learner
			.attributes
			.as_ref()
			.and_then(|attributes| attributes.get("base_score"))
			.and_then(|base_score| base_score.parse::<f32>().ok())
			.unwrap_or(0.5);
		let feature_names = learner.feature_names.unwrap_or_default();
		Ok(Model {
			trees,
			tree_classes,
			metadata: Metadata {
				num_features,
				num_classes,
				objective,
				objective_name,
				base_score,
				feature_names,
			},
		})
	}
}

fn tree_num_features(tree_index: usize, tree: &RawTree) -> Result<usize, ModelFormatError> {
	tree.tree_param
		.as_ref()
		.and_then(|tree_param| tree_param.num_feature.as_ref())
		.and_then(|num_feature| num_feature.parse::<usize>().ok())
		.ok_or(ModelFormatError::InvalidFeatureCount(tree_index))
}

fn tree_from_raw(tree_index: usize, raw: &RawTree) -> Result<Tree, ModelFormatError> {
	let n_nodes = raw.left_children.len();
	if raw.right_children.len() != n_nodes
		|| raw.split_indices.len() != n_nodes
		|| raw.split_conditions.len() != n_nodes
		|| raw.base_weights.len() != n_nodes
	{
		return Err(ModelFormatError::MismatchedNodeArrays(tree_index));
	}
	if n_nodes == 0 {
		return Err(ModelFormatError::EmptyTree(tree_index));
	}
	let mut nodes = Vec::with_capacity(n_nodes);
	for (left_child, right_child, split_index, split_condition, base_weight) in izip!(
		&raw.left_children,
		&raw.right_children,
		&raw.split_indices,
		&raw.split_conditions,
		&raw.base_weights,
	) {
		// A node is a leaf iff its left child is the no-child sentinel.
		if *left_child == -1 {
			nodes.push(Node::Leaf(LeafNode {
				value: *base_weight,
			}));
		} else {
			let left_child_index = left_child
				.to_usize()
				.filter(|index| *index < n_nodes)
				.ok_or(ModelFormatError::InvalidChildIndex(tree_index))?;
			let right_child_index = right_child
				.to_usize()
				.filter(|index| *index < n_nodes)
				.ok_or(ModelFormatError::InvalidChildIndex(tree_index))?;
			let feature_index = split_index
				.to_usize()
				.ok_or(ModelFormatError::InvalidSplitIndex(tree_index))?;
			nodes.push(Node::Branch(BranchNode {
				left_child_index,
				right_child_index,
				feature_index,
				split_value: *split_condition,
			}));
		}
	}
	// Every node may be referenced as a child at most once, and the root never. Under that invariant every path from the root visits fresh nodes, so traversal terminates without any runtime cycle bookkeeping.
	let mut reference_counts = vec![0; n_nodes];
	for node in nodes.iter() {
		if let Node::Branch(branch) = node {
			reference_counts[branch.left_child_index] += 1;
			reference_counts[branch.right_child_index] += 1;
		}
	}
	if reference_counts[0] > 0 || reference_counts.iter().any(|count| *count > 1) {
		return Err(ModelFormatError::InvalidStructure(tree_index));
	}
	Ok(Tree { nodes })
}

#[cfg(test)]
fn test_document(objective: &str, trees: Vec<serde_json::Value>) -> serde_json::Value {
	serde_json::json!({
		"learner": {
			"objective": { "name": objective },
			"gradient_booster": { "model": { "trees": trees } },
		},
	})
}

#[cfg(test)]
fn stump(num_feature: &str) -> serde_json::Value {
	serde_json::json!({
		"left_children": [1, -1, -1],
		"right_children": [2, -1, -1],
		"split_indices": [0, 0, 0],
		"split_conditions": [0.5, 0.0, 0.0],
		"base_weights": [0.0, 1.0, 3.0],
		"tree_param": { "num_feature": num_feature },
	})
}

#[test]
fn test_parse_regression_model() {
	let mut document = test_document("reg:squarederror", vec![stump("2")]);
	document["learner"]["attributes"] = serde_json::json!({ "base_score": "0.25" });
	document["learner"]["feature_names"] = serde_json::json!(["age", "income"]);
	let model = Model::from_json(&document.to_string()).unwrap();
	assert_eq!(model.metadata.objective, Objective::Regression);
	assert_eq!(model.metadata.objective_name, "reg:squarederror");
	assert_eq!(model.metadata.num_classes, 1);
	assert_eq!(model.metadata.num_features, 2);
	assert_eq!(model.metadata.base_score, 0.25);
	assert_eq!(model.metadata.feature_names, vec!["age", "income"]);
	assert_eq!(model.trees.len(), 1);
	assert!(model.tree_classes.is_empty());
}

#[test]
fn test_parse_binary_objectives() {
	let model = Model::from_json(&test_document("binary:logistic", vec![stump("1")]).to_string())
		.unwrap();
	assert_eq!(model.metadata.objective, Objective::BinaryLogistic);
	assert_eq!(model.metadata.num_classes, 2);
	let model =
		Model::from_json(&test_document("binary:hinge", vec![stump("1")]).to_string()).unwrap();
	assert_eq!(model.metadata.objective, Objective::BinaryHinge);
	assert_eq!(model.metadata.num_classes, 2);
}

#[test]
fn test_parse_multiclass_model() {
	let mut document = test_document("multi:softmax", vec![stump("1"), stump("1"), stump("1")]);
	document["learner"]["objective"]["softmax_multiclass_param"] =
		serde_json::json!({ "num_class": "3" });
	document["learner"]["gradient_booster"]["model"]["tree_info"] = serde_json::json!([0, 1, 2]);
	let model = Model::from_json(&document.to_string()).unwrap();
	assert_eq!(model.metadata.objective, Objective::MulticlassSoftmax);
	assert_eq!(model.metadata.num_classes, 3);
	assert_eq!(model.tree_classes, vec![0, 1, 2]);
}

#[test]
fn test_multiclass_class_count_defaults_to_two() {
	let mut document = test_document("multi:softprob", vec![stump("1"), stump("1")]);
	document["learner"]["gradient_booster"]["model"]["tree_info"] = serde_json::json!([0, 1]);
	let model = Model::from_json(&document.to_string()).unwrap();
	assert_eq!(model.metadata.num_classes, 2);
	// An unparseable class count falls back the same way.
	document["learner"]["objective"]["softmax_multiclass_param"] =
		serde_json::json!({ "num_class": "several" });
	let model = Model::from_json(&document.to_string()).unwrap();
	assert_eq!(model.metadata.num_classes, 2);
}

#[test]
fn test_invalid_encoding() {
	let error = Model::from_json("not json at all").unwrap_err();
	assert!(matches!(error, ModelFormatError::InvalidEncoding(_)));
	assert_eq!(error.to_string(), "invalid encoding");
}

#[test]
fn test_missing_objective() {
	for document in &[
		serde_json::json!({}),
		serde_json::json!({ "learner": {} }),
		serde_json::json!({ "learner": { "objective": {} } }),
	] {
		let error = Model::from_json(&document.to_string()).unwrap_err();
		assert!(matches!(error, ModelFormatError::MissingObjective));
		assert_eq!(error.to_string(), "missing objective");
	}
}

#[test]
fn test_no_trees() {
	let error = Model::from_json(&test_document("reg:squarederror", vec![]).to_string())
		.unwrap_err();
	assert!(matches!(error, ModelFormatError::NoTrees));
	assert_eq!(error.to_string(), "no trees");
	let document = serde_json::json!({
		"learner": { "objective": { "name": "reg:squarederror" } },
	});
	let error = Model::from_json(&document.to_string()).unwrap_err();
	assert!(matches!(error, ModelFormatError::NoTrees));
}

#[test]
fn test_base_score_fallback() {
	// Absent entirely.
	let model =
		Model::from_json(&test_document("reg:squarederror", vec![stump("1")]).to_string()).unwrap();
	assert_eq!(model.metadata.base_score, 0.5);
	// Present but unparseable falls back silently.
	let mut document = test_document("reg:squarederror", vec![stump("1")]);
	document["learner"]["attributes"] = serde_json::json!({ "base_score": "nonsense" });
	let model = Model::from_json(&document.to_string()).unwrap();
	assert_eq!(model.metadata.base_score, 0.5);
}

#[test]
fn test_inconsistent_feature_counts() {
	let error =
		Model::from_json(&test_document("reg:squarederror", vec![stump("2"), stump("3")]).to_string())
			.unwrap_err();
	assert!(matches!(error, ModelFormatError::InconsistentFeatureCount));
}

#[test]
fn test_invalid_feature_count() {
	let error =
		Model::from_json(&test_document("reg:squarederror", vec![stump("many")]).to_string())
			.unwrap_err();
	assert!(matches!(error, ModelFormatError::InvalidFeatureCount(0)));
}

#[test]
fn test_mismatched_node_arrays() {
	let mut tree = stump("1");
	tree["base_weights"] = serde_json::json!([0.0, 1.0]);
	let error = Model::from_json(&test_document("reg:squarederror", vec![tree]).to_string())
		.unwrap_err();
	assert!(matches!(error, ModelFormatError::MismatchedNodeArrays(0)));
}

#[test]
fn test_invalid_child_index() {
	let mut tree = stump("1");
	tree["right_children"] = serde_json::json!([7, -1, -1]);
	let error = Model::from_json(&test_document("reg:squarederror", vec![tree]).to_string())
		.unwrap_err();
	assert!(matches!(error, ModelFormatError::InvalidChildIndex(0)));
}

#[test]
fn test_cyclic_tree() {
	// Node 1 points back at the root.
	let tree = serde_json::json!({
		"left_children": [1, 0, -1],
		"right_children": [2, 2, -1],
		"split_indices": [0, 0, 0],
		"split_conditions": [0.5, 0.5, 0.0],
		"base_weights": [0.0, 0.0, 1.0],
		"tree_param": { "num_feature": "1" },
	});
	let error = Model::from_json(&test_document("reg:squarederror", vec![tree]).to_string())
		.unwrap_err();
	assert!(matches!(error, ModelFormatError::InvalidStructure(0)));
}

#[test]
fn test_invalid_tree_info() {
	let mut document = test_document("multi:softmax", vec![stump("1"), stump("1")]);
	document["learner"]["objective"]["softmax_multiclass_param"] =
		serde_json::json!({ "num_class": "3" });
	// Too short.
	document["learner"]["gradient_booster"]["model"]["tree_info"] = serde_json::json!([0]);
	let error = Model::from_json(&document.to_string()).unwrap_err();
	assert!(matches!(error, ModelFormatError::InvalidTreeInfo));
	// Class index out of range.
	document["learner"]["gradient_booster"]["model"]["tree_info"] = serde_json::json!([0, 3]);
	let error = Model::from_json(&document.to_string()).unwrap_err();
	assert!(matches!(error, ModelFormatError::InvalidTreeInfo));
	// The mapping is ignored for binary models, valid or not.
	let mut document = test_document("binary:logistic", vec![stump("1"), stump("1")]);
	document["learner"]["gradient_booster"]["model"]["tree_info"] = serde_json::json!([9]);
	let model = Model::from_json(&document.to_string()).unwrap();
	assert!(model.tree_classes.is_empty());
}
