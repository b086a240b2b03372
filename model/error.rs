use thiserror::Error;

/// An error produced when a serialized model document is malformed, incomplete, or structurally invalid. These are only raised during construction: a [`Model`](crate::Model) either loads completely or is never observable.
#[derive(Debug, Error)]
pub enum ModelFormatError {
	/// The document is not valid JSON.
	#[error("invalid encoding")]
	InvalidEncoding(#[source] serde_json::Error),
	/// The document does not declare `learner.objective.name`.
	#[error("missing objective")]
	MissingObjective,
	/// The document declares no trees.
	#[error("no trees")]
	NoTrees,
	/// A tree's parallel node arrays disagree in length.
	#[error("tree {0} has mismatched node arrays")]
	MismatchedNodeArrays(usize),
	/// A tree has no nodes.
	#[error("tree {0} is empty")]
	EmptyTree(usize),
	/// A branch references a child index outside the tree's node array.
	#[error("tree {0} has an invalid child index")]
	InvalidChildIndex(usize),
	/// A branch has a negative split feature index.
	#[error("tree {0} has an invalid split index")]
	InvalidSplitIndex(usize),
	/// A node is referenced by more than one parent, or the root is referenced as a child, so traversal from the root is not guaranteed to terminate.
	#[error("tree {0} is not a well-formed tree")]
	InvalidStructure(usize),
	/// A tree's declared feature count is absent or not a parseable integer.
	#[error("tree {0} has an invalid feature count")]
	InvalidFeatureCount(usize),
	/// The trees do not all declare the same feature count.
	#[error("inconsistent feature counts across trees")]
	InconsistentFeatureCount,
	/// A multiclass model's tree_info does not assign every tree a class in range.
	#[error("invalid tree info")]
	InvalidTreeInfo,
}

/// An error produced when a feature vector cannot be evaluated against the model. These are per-call failures: the engine's state is unaffected and the call can be retried with corrected input.
#[derive(Debug, Error, PartialEq)]
pub enum FeatureError {
	/// The feature vector's length does not match the model's feature count.
	#[error("expected {expected} features, got {found}")]
	WrongLength { expected: usize, found: usize },
	/// A feature value is NaN.
	#[error("features must be valid numbers")]
	NotANumber,
	/// A tree split references a feature index outside the feature vector.
	#[error("invalid feature index: {feature_index}")]
	InvalidFeatureIndex { feature_index: usize },
}
