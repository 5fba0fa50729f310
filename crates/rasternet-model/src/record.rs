//! Serde records for the model description file (`model.json`).
//!
//! Two topology flavours are accepted:
//! - graph models: a flat list of named op nodes with input references and
//!   attributes (frozen dataflow graph)
//! - layers models: an ordered list of layers with class names, configs,
//!   inbound layer references and weight names (sequential layer stack)
//!
//! Both carry the same `weightsManifest` describing the weight shards.

use crate::tensor::DataType;
use crate::weights::{WeightEntry, WeightGroup};
use crate::{ModelError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A node attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Bool(bool),
    Number(f64),
    Numbers(Vec<f64>),
    String(String),
    Strings(Vec<String>),
}

impl AttrValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AttrValue::Number(n) => Some(*n),
            AttrValue::Numbers(v) if v.len() == 1 => Some(v[0]),
            _ => None,
        }
    }

    pub fn as_usize(&self) -> Option<usize> {
        self.as_f64()
            .filter(|n| *n >= 0.0 && n.fract() == 0.0)
            .map(|n| n as usize)
    }

    /// Numeric list; a single number is treated as a one-element list.
    pub fn as_numbers(&self) -> Option<Vec<f64>> {
        match self {
            AttrValue::Number(n) => Some(vec![*n]),
            AttrValue::Numbers(v) => Some(v.clone()),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttrValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// String list; a single string is treated as a one-element list.
    pub fn as_strings(&self) -> Option<Vec<String>> {
        match self {
            AttrValue::String(s) => Some(vec![s.clone()]),
            AttrValue::Strings(v) => Some(v.clone()),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttrValue::Bool(b) => Some(*b),
            AttrValue::Number(n) => Some(*n != 0.0),
            _ => None,
        }
    }
}

/// Declared topology flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModelFormat {
    GraphModel,
    LayersModel,
}

/// One op node of a graph model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNodeDef {
    pub name: String,
    pub op: String,
    /// Input references, optionally suffixed `:index` or `:name:index`.
    #[serde(default)]
    pub input: Vec<String>,
    #[serde(default)]
    pub attr: BTreeMap<String, AttrValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphTopology {
    pub node: Vec<GraphNodeDef>,
}

/// One layer of a layers model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerDef {
    pub name: String,
    pub class_name: String,
    /// Raw layer config; normalized into op attributes by the graph builder.
    #[serde(default)]
    pub config: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub inbound_layers: Vec<String>,
    /// Names of this layer's weights in the manifest (kernel, then bias).
    #[serde(default)]
    pub weights: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayersTopology {
    pub layers: Vec<LayerDef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ModelTopology {
    Graph(GraphTopology),
    Layers(LayersTopology),
}

impl ModelTopology {
    pub fn format(&self) -> ModelFormat {
        match self {
            ModelTopology::Graph(_) => ModelFormat::GraphModel,
            ModelTopology::Layers(_) => ModelFormat::LayersModel,
        }
    }
}

/// Declared shape and dtype of a signature tensor.
///
/// A shape dimension of `-1` accepts any size.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorSpec {
    /// Internal node name, optionally with an output suffix.
    pub name: String,
    #[serde(default = "default_dtype")]
    pub dtype: DataType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shape: Option<Vec<i64>>,
}

fn default_dtype() -> DataType {
    DataType::Float32
}

/// External input/output names mapped to internal node names.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Signature {
    #[serde(default)]
    pub inputs: BTreeMap<String, TensorSpec>,
    #[serde(default)]
    pub outputs: BTreeMap<String, TensorSpec>,
}

/// Top-level record of a `model.json` file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelDescription {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<ModelFormat>,
    pub model_topology: ModelTopology,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<Signature>,
    #[serde(default)]
    pub weights_manifest: Vec<WeightGroup>,
}

impl ModelDescription {
    /// Parse and validate a model description from JSON text.
    ///
    /// # Errors
    /// Returns an error if the JSON is malformed or the declared format does
    /// not match the topology.
    pub fn from_json(text: &str) -> Result<Self> {
        let description: ModelDescription = serde_json::from_str(text)?;
        description.validate()?;
        Ok(description)
    }

    /// Check internal consistency of the record.
    pub fn validate(&self) -> Result<()> {
        if let Some(format) = self.format
            && format != self.model_topology.format()
        {
            return Err(ModelError::InvalidModel(format!(
                "format is declared as {:?} but the topology is a {:?}",
                format,
                self.model_topology.format()
            )));
        }

        let mut seen = std::collections::HashSet::new();
        for spec in self.weight_specs() {
            if !seen.insert(spec.name.as_str()) {
                return Err(ModelError::InvalidModel(format!(
                    "weight '{}' appears more than once in the manifest",
                    spec.name
                )));
            }
        }
        Ok(())
    }

    /// All weight entries in manifest order, which is also byte order.
    pub fn weight_specs(&self) -> impl Iterator<Item = &WeightEntry> {
        self.weights_manifest.iter().flat_map(|group| group.weights.iter())
    }
}
