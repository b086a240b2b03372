/*!
This crate loads gradient boosted decision tree ensembles serialized in the XGBoost JSON format and validates them into an immutable in-memory representation. It is the storage half of the grove prediction engine: `grove_predict` consumes a [`Model`] to evaluate feature vectors.

A `Model` is constructed exactly once with [`Model::from_json`], which parses the document into a strict schema, resolves every optional field to its default, and checks the structural invariants of each tree. After construction the model never changes, so it is safe to share across threads behind an `Arc`.
*/

#![allow(clippy::tabs_in_doc_comments)]

mod error;
mod format;

pub use self::error::{FeatureError, ModelFormatError};

use std::convert::TryFrom;

/// A gradient boosted decision tree ensemble loaded from its serialized JSON form.
#[derive(Debug)]
pub struct Model {
	/// The trees for this model, in the order they were produced by training.
	pub trees: Vec<Tree>,
	/// For multiclass models, the class each tree's output accumulates into. Empty for regression and binary models, whose trees all accumulate into a single sum.
	pub tree_classes: Vec<usize>,
	/// The static metadata derived from the document at construction.
	pub metadata: Metadata,
}

impl Model {
	/// Parse and validate a serialized model document.
	pub fn from_json(json: &str) -> Result<Model, ModelFormatError> {
		let raw: format::RawModel =
			serde_json::from_str(json).map_err(ModelFormatError::InvalidEncoding)?;
		Model::try_from(raw)
	}
}

/// The static summary of a model, computed once at construction and never mutated.
#[derive(Clone, Debug)]
pub struct Metadata {
	/// The number of features every tree in the model splits over.
	pub num_features: usize,
	/// 1 for regression, 2 for binary classification, and the declared class count for multiclass classification.
	pub num_classes: usize,
	/// The kind of objective this model was trained with.
	pub objective: Objective,
	/// The raw objective name from the document, for example "binary:logistic".
	pub objective_name: String,
	/// The additive prior seeding the ensemble sum for regression and binary models.
	pub base_score: f32,
	/// The feature names recorded at training time, if any.
	pub feature_names: Vec<String>,
}

/// The training objective encoded in a model, which determines how its raw scores are interpreted.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Objective {
	Regression,
	BinaryLogistic,
	BinaryHinge,
	MulticlassSoftmax,
}

impl Objective {
	/// Returns true for the classification objectives, whose outputs are class labels and probabilities rather than raw values.
	pub fn is_classification(self) -> bool {
		!matches!(self, Objective::Regression)
	}
}

/// Trees are stored as a `Vec` of `Node`s. Each branch in the tree has two indexes into the `Vec`, one for each of its children.
#[derive(Debug)]
pub struct Tree {
	pub nodes: Vec<Node>,
}

/// A node is either a branch or a leaf.
#[derive(Debug)]
pub enum Node {
	Branch(BranchNode),
	Leaf(LeafNode),
}

/// A `BranchNode` sends an example to one of its two children based on the value of a single feature.
#[derive(Debug)]
pub struct BranchNode {
	/// This is the index in the tree's node vector for this node's left child.
	pub left_child_index: usize,
	/// This is the index in the tree's node vector for this node's right child.
	pub right_child_index: usize,
	/// This is the index of the feature to compare with the split value.
	pub feature_index: usize,
	/// An example is sent left if its feature value is <= this value, and right otherwise.
	pub split_value: f32,
}

/// The leaves in a tree hold the weight the tree contributes for examples that get sent to them.
#[derive(Debug)]
pub struct LeafNode {
	/// This is the weight to output.
	pub value: f32,
}

impl Tree {
	/// Compute the leaf weight for a single example.
	pub fn predict(&self, features: &[f32]) -> Result<f32, FeatureError> {
		// Start at the root node.
		let mut node_index = 0;
		// Traverse the tree until we get to a leaf.
		loop {
			match &self.nodes[node_index] {
				Node::Branch(BranchNode {
					left_child_index,
					right_child_index,
					feature_index,
					split_value,
				}) => {
					let feature = features.get(*feature_index).ok_or(
						FeatureError::InvalidFeatureIndex {
							feature_index: *feature_index,
						},
					)?;
					node_index = if *feature <= *split_value {
						*left_child_index
					} else {
						*right_child_index
					};
				}
				// We made it to a leaf! The output is the leaf's weight.
				Node::Leaf(LeafNode { value }) => return Ok(*value),
			}
		}
	}
}

#[test]
fn test_tree_predict() {
	let tree = Tree {
		nodes: vec![
			Node::Branch(BranchNode {
				left_child_index: 1,
				right_child_index: 2,
				feature_index: 0,
				split_value: 0.5,
			}),
			Node::Leaf(LeafNode { value: 1.0 }),
			Node::Leaf(LeafNode { value: 3.0 }),
		],
	};
	assert_eq!(tree.predict(&[0.2]).unwrap(), 1.0);
	// A feature value equal to the split value goes left.
	assert_eq!(tree.predict(&[0.5]).unwrap(), 1.0);
	assert_eq!(tree.predict(&[0.8]).unwrap(), 3.0);
}

#[test]
fn test_tree_predict_invalid_feature_index() {
	let tree = Tree {
		nodes: vec![
			Node::Branch(BranchNode {
				left_child_index: 1,
				right_child_index: 2,
				feature_index: 3,
				split_value: 0.5,
			}),
			Node::Leaf(LeafNode { value: 1.0 }),
			Node::Leaf(LeafNode { value: 3.0 }),
		],
	};
	assert_eq!(
		tree.predict(&[0.2]),
		Err(FeatureError::InvalidFeatureIndex { feature_index: 3 }),
	);
}
