use crate::dtype::{DType, Format};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const CONST_KIND: &str = "Const";
pub const DATA_KIND: &str = "Data";
pub const VARIABLE_KIND: &str = "Variable";
pub const EXIT_KIND: &str = "Exit";
pub const ENTRY_KIND: &str = "Entry";

/// Descriptor of one tensor flowing through a data anchor. The `origin_*`
/// fields keep the pre-transformation dtype/format/shape so later stages can
/// fall back to them when the current ones are undefined.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TensorDesc {
    pub dtype: Option<DType>,
    pub shape: Vec<i64>,
    pub format: Option<Format>,
    pub origin_dtype: Option<DType>,
    pub origin_format: Option<Format>,
    pub origin_shape: Vec<i64>,
}

impl TensorDesc {
    pub fn new(dtype: DType, shape: impl Into<Vec<i64>>, format: Format) -> Self {
        let shape = shape.into();
        Self {
            dtype: Some(dtype),
            shape: shape.clone(),
            format: Some(format),
            origin_dtype: Some(dtype),
            origin_format: Some(format),
            origin_shape: shape,
        }
    }
}

/// Attributes attached to a node. The named fields cover everything the
/// partitioner reads or writes, everything else goes through `extra`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeAttrs {
    pub engine: Option<String>,
    pub stream_label: Option<String>,
    pub pairing_id: Option<u64>,
    pub origin_kind: Option<String>,
    pub origin_id: Option<String>,
    pub anchor_index: Option<usize>,
    pub extra: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OpDesc {
    pub name: String,
    pub kind: String,
    pub inputs: Vec<TensorDesc>,
    pub outputs: Vec<TensorDesc>,
    pub attrs: NodeAttrs,
}

impl OpDesc {
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            attrs: NodeAttrs::default(),
        }
    }

    /// Nodes that only produce data and never consume it.
    pub fn is_data_like(&self) -> bool {
        matches!(self.kind.as_str(), CONST_KIND | DATA_KIND | VARIABLE_KIND)
    }

    pub fn is_boundary(&self) -> bool {
        matches!(self.kind.as_str(), EXIT_KIND | ENTRY_KIND)
    }
}
