// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Declarative block, model and data settings read from YAML.
//!
//! Parsing coerces every field to its declared type and then checks the
//! structural invariants (`len(nodes) - 1 == len(activations) ==
//! len(dropouts)`, deprecated options). Rank-dependent checks need the input
//! rank and live on [`crate::gnn::EquivariantBlock`].

mod coerce;

use crate::gnn::Propagation;
use crate::layers::Activation;
use crate::{PureResult, TensorError};
use serde_yaml::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Python-style `start:stop:step` selection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SliceSpec {
    pub start: Option<i64>,
    pub stop: Option<i64>,
    pub step: Option<i64>,
}

impl Default for SliceSpec {
    fn default() -> Self {
        Self {
            start: Some(0),
            stop: None,
            step: Some(1),
        }
    }
}

impl SliceSpec {
    /// One element is the stop, two are start and stop, three add a step.
    fn from_value(field: &str, value: &Value) -> PureResult<Self> {
        let parts = coerce::to_list(field, value, |f, v| coerce::optional(f, v, coerce::to_i64))?;
        match parts.as_slice() {
            [stop] => Ok(Self {
                start: None,
                stop: *stop,
                step: None,
            }),
            [start, stop] => Ok(Self {
                start: *start,
                stop: *stop,
                step: None,
            }),
            [start, stop, step] => Ok(Self {
                start: *start,
                stop: *stop,
                step: *step,
            }),
            _ => Err(TensorError::TypeCoercion {
                field: field.to_string(),
                expected: "slice",
                found: format!("a sequence of {} items", parts.len()),
            }),
        }
    }

    /// Indices selected from a sequence of length `len`.
    pub fn indices(&self, len: usize) -> PureResult<Vec<usize>> {
        let len = len as i64;
        let step = self.step.unwrap_or(1);
        if step == 0 {
            return Err(TensorError::InvalidValue {
                label: "slice_step",
            });
        }
        let wrap = |v: i64| if v < 0 { v + len } else { v };
        let mut out = Vec::new();
        if step > 0 {
            let start = self.start.map_or(0, |v| wrap(v).clamp(0, len));
            let stop = self.stop.map_or(len, |v| wrap(v).clamp(0, len));
            let mut i = start;
            while i < stop {
                out.push(i as usize);
                i += step;
            }
        } else {
            let start = self.start.map_or(len - 1, |v| wrap(v).clamp(-1, len - 1));
            let stop = self.stop.map_or(-1, |v| wrap(v).clamp(-1, len - 1));
            let mut i = start;
            while i > stop {
                out.push(i as usize);
                i += step;
            }
        }
        Ok(out)
    }
}

/// Which input channels a block consumes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InputSelection {
    Indices(Vec<usize>),
    Slice(SliceSpec),
}

impl InputSelection {
    pub fn resolve(&self, len: usize) -> PureResult<Vec<usize>> {
        match self {
            Self::Indices(indices) => {
                if let Some(&bad) = indices.iter().find(|&&i| i >= len) {
                    return Err(TensorError::ShapeMismatch {
                        left: vec![bad],
                        right: vec![len],
                    });
                }
                Ok(indices.clone())
            }
            Self::Slice(slice) => slice.indices(len),
        }
    }
}

/// Block-specific knobs carried in the `optional` mapping.
#[derive(Clone, Debug, PartialEq)]
pub struct EquivariantOptions {
    /// Required for equivariant blocks.
    pub propagations: Option<Vec<Propagation>>,
    pub dim: usize,
    pub support_tensor_rank: usize,
    pub symmetric: bool,
    pub factor: f32,
    /// Weight after propagation, `(AH)W`, instead of `A(HW)`.
    pub ah_w: bool,
    pub create_subchain: bool,
    pub create_neumann_linear: bool,
    pub neumann_factor: f32,
    pub create_neumann_ratio: bool,
    /// Picks one entry of keyed group shapes.
    pub dict_key: Option<String>,
    /// Keys this crate does not interpret, kept for other consumers.
    pub extra: BTreeMap<String, Value>,
}

impl Default for EquivariantOptions {
    fn default() -> Self {
        Self {
            propagations: None,
            dim: 3,
            support_tensor_rank: 1,
            symmetric: false,
            factor: 1.0,
            ah_w: false,
            create_subchain: true,
            create_neumann_linear: false,
            neumann_factor: 1.0,
            create_neumann_ratio: false,
            dict_key: None,
            extra: BTreeMap::new(),
        }
    }
}

impl EquivariantOptions {
    fn from_value(value: &Value) -> PureResult<Self> {
        let mut options = Self::default();
        if value.is_null() {
            return Ok(options);
        }
        let map = coerce::to_mapping("optional", value)?;
        coerce::for_each_entry("optional", map, |key, value| {
            match key {
                "propagations" => {
                    let names = coerce::to_list(key, value, coerce::to_string)?;
                    let parsed = names
                        .iter()
                        .map(|name| name.parse::<Propagation>())
                        .collect::<PureResult<Vec<_>>>()?;
                    options.propagations = Some(parsed);
                }
                "dim" => options.dim = coerce::to_usize(key, value)?,
                "support_tensor_rank" => options.support_tensor_rank = coerce::to_usize(key, value)?,
                "symmetric" => options.symmetric = coerce::to_bool(key, value)?,
                "factor" => options.factor = coerce::to_f32(key, value)?,
                "ah_w" => options.ah_w = coerce::to_bool(key, value)?,
                "create_subchain" => options.create_subchain = coerce::to_bool(key, value)?,
                "create_neumann_linear" => {
                    options.create_neumann_linear = coerce::to_bool(key, value)?
                }
                "neumann_factor" => options.neumann_factor = coerce::to_f32(key, value)?,
                "create_neumann_ratio" => {
                    options.create_neumann_ratio = coerce::to_bool(key, value)?
                }
                "dict_key" => options.dict_key = coerce::optional(key, value, coerce::to_string)?,
                other => {
                    debug!(option = other, "keeping uninterpreted block option");
                    options.extra.insert(other.to_string(), value.clone());
                }
            }
            Ok(())
        })?;
        Ok(options)
    }
}

/// One block of a model.
#[derive(Clone, Debug, PartialEq)]
pub struct BlockSetting {
    pub name: String,
    pub block_type: String,
    pub destinations: Vec<String>,
    pub input_slice: SliceSpec,
    pub input_indices: Option<Vec<usize>>,
    pub support_input_index: usize,
    pub support_input_indices: Option<Vec<usize>>,
    /// Layer widths; `-1` stands for a width inferred from the data.
    pub nodes: Vec<i64>,
    pub activations: Vec<Activation>,
    pub dropouts: Vec<f32>,
    pub bias: bool,
    pub residual: bool,
    pub activation_after_residual: bool,
    /// Names of the (field, directed Neumann, inversed moment) inputs.
    pub input_names: Option<Vec<String>>,
    pub hidden_nodes: Option<usize>,
    pub hidden_layers: Option<usize>,
    pub hidden_activation: Activation,
    pub output_activation: Activation,
    pub input_dropout: f32,
    pub hidden_dropout: f32,
    pub output_dropout: f32,
    pub optional: EquivariantOptions,
}

impl Default for BlockSetting {
    fn default() -> Self {
        Self {
            name: "Block".to_string(),
            block_type: "mlp".to_string(),
            destinations: vec!["Output".to_string()],
            input_slice: SliceSpec::default(),
            input_indices: None,
            support_input_index: 0,
            support_input_indices: None,
            nodes: vec![-1, -1],
            activations: vec![Activation::Identity],
            dropouts: vec![0.0],
            bias: true,
            residual: false,
            activation_after_residual: true,
            input_names: None,
            hidden_nodes: None,
            hidden_layers: None,
            hidden_activation: Activation::Relu,
            output_activation: Activation::Identity,
            input_dropout: 0.0,
            hidden_dropout: 0.5,
            output_dropout: 0.0,
            optional: EquivariantOptions::default(),
        }
    }
}

fn to_activation(field: &str, value: &Value) -> PureResult<Activation> {
    coerce::to_string(field, value)?.parse()
}

impl BlockSetting {
    /// Parses one block mapping, then expands hidden layers and checks the
    /// layer arrays.
    pub fn from_value(value: &Value) -> PureResult<Self> {
        let map = coerce::to_mapping("block", value)?;
        let mut s = Self::default();
        coerce::for_each_entry("block", map, |key, value| {
            match key {
                "name" => s.name = coerce::to_string(key, value)?,
                "type" => s.block_type = coerce::to_string(key, value)?,
                "destinations" => s.destinations = coerce::to_list(key, value, coerce::to_string)?,
                "input_slice" => s.input_slice = SliceSpec::from_value(key, value)?,
                "input_indices" => {
                    s.input_indices = coerce::optional(key, value, |f, v| {
                        coerce::to_list(f, v, coerce::to_usize)
                    })?
                }
                "support_input_index" => s.support_input_index = coerce::to_usize(key, value)?,
                "support_input_indices" => {
                    s.support_input_indices = coerce::optional(key, value, |f, v| {
                        coerce::to_list(f, v, coerce::to_usize)
                    })?
                }
                "nodes" => s.nodes = coerce::to_list(key, value, coerce::to_i64)?,
                "activations" => s.activations = coerce::to_list(key, value, to_activation)?,
                "dropouts" => s.dropouts = coerce::to_list(key, value, coerce::to_f32)?,
                "bias" => s.bias = coerce::to_bool(key, value)?,
                "residual" => s.residual = coerce::to_bool(key, value)?,
                "activation_after_residual" => {
                    s.activation_after_residual = coerce::to_bool(key, value)?
                }
                "input_names" => {
                    s.input_names = coerce::optional(key, value, |f, v| {
                        coerce::to_list(f, v, coerce::to_string)
                    })?
                }
                "hidden_nodes" => s.hidden_nodes = coerce::optional(key, value, coerce::to_usize)?,
                "hidden_layers" => {
                    s.hidden_layers = coerce::optional(key, value, coerce::to_usize)?
                }
                "hidden_activation" => s.hidden_activation = to_activation(key, value)?,
                "output_activation" => s.output_activation = to_activation(key, value)?,
                "input_dropout" => s.input_dropout = coerce::to_f32(key, value)?,
                "hidden_dropout" => s.hidden_dropout = coerce::to_f32(key, value)?,
                "output_dropout" => s.output_dropout = coerce::to_f32(key, value)?,
                "optional" => s.optional = EquivariantOptions::from_value(value)?,
                other => {
                    return Err(TensorError::config(format!(
                        "unexpected block field '{other}'"
                    )))
                }
            }
            Ok(())
        })?;
        s.expand_hidden_layers()?;
        s.validate()?;
        Ok(s)
    }

    pub fn from_yaml_str(raw: &str) -> PureResult<Self> {
        Self::from_value(&parse_yaml(raw)?)
    }

    /// Rebuilds `nodes`, `activations` and `dropouts` from the hidden layer
    /// description when both `hidden_nodes` and `hidden_layers` are set.
    fn expand_hidden_layers(&mut self) -> PureResult<()> {
        let (Some(width), Some(layers)) = (self.hidden_nodes, self.hidden_layers) else {
            return Ok(());
        };
        if layers == 0 {
            return Err(TensorError::config(format!(
                "{}: hidden_layers must be positive",
                self.name
            )));
        }
        let mut nodes = vec![-1i64];
        nodes.extend(std::iter::repeat(width as i64).take(layers));
        nodes.push(-1);
        self.nodes = nodes;

        self.activations = std::iter::repeat(self.hidden_activation)
            .take(layers)
            .chain(std::iter::once(self.output_activation))
            .collect();

        let mut dropouts = vec![self.input_dropout];
        dropouts.extend(std::iter::repeat(self.hidden_dropout).take(layers - 1));
        dropouts.push(self.output_dropout);
        self.dropouts = dropouts;
        Ok(())
    }

    /// Checks the layer arrays line up.
    pub fn validate(&self) -> PureResult<()> {
        let n_layer = self.nodes.len().saturating_sub(1);
        if self.nodes.is_empty()
            || n_layer != self.activations.len()
            || n_layer != self.dropouts.len()
        {
            return Err(TensorError::config(format!(
                "Block definition invalid: {} nodes, {} activations, {} dropouts",
                self.nodes.len(),
                self.activations.len(),
                self.dropouts.len()
            )));
        }
        Ok(())
    }

    /// Checks the options an equivariant block cannot do without.
    pub fn validate_equivariant(&self) -> PureResult<()> {
        self.validate()?;
        if self.optional.propagations.is_none() {
            return Err(TensorError::MissingOption {
                option: "propagations",
                context: self.name.clone(),
            });
        }
        if let Some(names) = &self.input_names {
            if names.len() != 3 {
                return Err(TensorError::config(format!(
                    "{}: input_names should be 3 (field, directed neumann, inversed moment), \
                     got {}",
                    self.name,
                    names.len()
                )));
            }
        }
        if let Some(indices) = &self.support_input_indices {
            if indices.len() < 2 {
                return Err(TensorError::config(format!(
                    "{}: support_input_indices should have at least 2 entries, got {}",
                    self.name,
                    indices.len()
                )));
            }
        }
        Ok(())
    }

    /// `input_indices` when given, else `input_slice`.
    pub fn input_selection(&self) -> InputSelection {
        match &self.input_indices {
            Some(indices) => InputSelection::Indices(indices.clone()),
            None => InputSelection::Slice(self.input_slice),
        }
    }

    /// Copy with `-1` at either end of `nodes` replaced by the given widths.
    pub fn with_io_dims(&self, input_dim: usize, output_dim: usize) -> Self {
        let mut resolved = self.clone();
        if let Some(first) = resolved.nodes.first_mut() {
            if *first < 0 {
                *first = input_dim as i64;
            }
        }
        if let Some(last) = resolved.nodes.last_mut() {
            if *last < 0 {
                *last = output_dim as i64;
            }
        }
        resolved
    }

    /// Node widths as sizes; fails while any width is still unresolved.
    pub fn resolved_nodes(&self) -> PureResult<Vec<usize>> {
        self.nodes
            .iter()
            .map(|&n| {
                usize::try_from(n).ok().filter(|&n| n > 0).ok_or_else(|| {
                    TensorError::config(format!(
                        "{}: node width {n} is unresolved, call with_io_dims first",
                        self.name
                    ))
                })
            })
            .collect()
    }

    /// Whether boundary (Neumann) injection is requested.
    pub fn uses_neumann(&self) -> bool {
        self.input_names.is_some()
    }
}

/// Ordered blocks of a model.
#[derive(Clone, Debug, PartialEq)]
pub struct ModelSetting {
    pub blocks: Vec<BlockSetting>,
}

impl Default for ModelSetting {
    fn default() -> Self {
        Self {
            blocks: vec![BlockSetting::default()],
        }
    }
}

impl ModelSetting {
    pub fn from_value(value: &Value) -> PureResult<Self> {
        let map = coerce::to_mapping("model", value)?;
        let Some(blocks) = map.get("blocks") else {
            return Err(TensorError::MissingOption {
                option: "blocks",
                context: "model".to_string(),
            });
        };
        let blocks = coerce::to_list("blocks", blocks, |_, v| BlockSetting::from_value(v))?;
        Ok(Self { blocks })
    }

    pub fn block(&self, name: &str) -> Option<&BlockSetting> {
        self.blocks.iter().find(|b| b.name == name)
    }
}

/// Data directories handed to the external loaders.
#[derive(Clone, Debug, PartialEq)]
pub struct DataSetting {
    pub raw: PathBuf,
    pub interim: PathBuf,
    pub preprocessed: PathBuf,
    pub inferred: PathBuf,
    pub train: Vec<PathBuf>,
    pub validation: Vec<PathBuf>,
    pub test: Vec<PathBuf>,
    pub pad: bool,
}

impl Default for DataSetting {
    fn default() -> Self {
        Self {
            raw: PathBuf::from("data/raw"),
            interim: PathBuf::from("data/interim"),
            preprocessed: PathBuf::from("data/preprocessed"),
            inferred: PathBuf::from("data/inferred"),
            train: vec![PathBuf::from("data/preprocessed/train")],
            validation: vec![PathBuf::from("data/preprocessed/validation")],
            test: vec![PathBuf::from("data/preprocessed/test")],
            pad: false,
        }
    }
}

impl DataSetting {
    pub fn from_value(value: &Value) -> PureResult<Self> {
        let map = coerce::to_mapping("data", value)?;
        let mut s = Self::default();
        coerce::for_each_entry("data", map, |key, value| {
            match key {
                "raw" => s.raw = coerce::to_path(key, value)?,
                "interim" => s.interim = coerce::to_path(key, value)?,
                "preprocessed" => s.preprocessed = coerce::to_path(key, value)?,
                "inferred" => s.inferred = coerce::to_path(key, value)?,
                "train" => s.train = coerce::to_list(key, value, coerce::to_path)?,
                "validation" => s.validation = coerce::to_list(key, value, coerce::to_path)?,
                "test" => s.test = coerce::to_list(key, value, coerce::to_path)?,
                "pad" => s.pad = coerce::to_bool(key, value)?,
                other => {
                    return Err(TensorError::config(format!(
                        "unexpected data field '{other}'"
                    )))
                }
            }
            Ok(())
        })?;
        if s.pad {
            return Err(TensorError::config(
                "pad = True option is deprecated. Set pad = False",
            ));
        }
        Ok(s)
    }
}

/// Top-level settings document.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MainSetting {
    pub data: DataSetting,
    pub model: ModelSetting,
}

impl MainSetting {
    /// Sections other than `data` and `model` belong to the trainer and
    /// converters and are skipped.
    pub fn from_value(value: &Value) -> PureResult<Self> {
        let map = coerce::to_mapping("settings", value)?;
        let mut setting = Self::default();
        coerce::for_each_entry("settings", map, |key, value| {
            match key {
                "data" => setting.data = DataSetting::from_value(value)?,
                "model" => setting.model = ModelSetting::from_value(value)?,
                other => debug!(section = other, "skipping settings section"),
            }
            Ok(())
        })?;
        Ok(setting)
    }

    pub fn from_yaml_str(raw: &str) -> PureResult<Self> {
        Self::from_value(&parse_yaml(raw)?)
    }
}

fn parse_yaml(raw: &str) -> PureResult<Value> {
    serde_yaml::from_str(raw).map_err(|err| TensorError::SerializationError {
        message: err.to_string(),
    })
}

/// Reads a settings document from disk.
pub fn read_settings_yaml(path: impl AsRef<Path>) -> PureResult<MainSetting> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path).map_err(|err| TensorError::IoError {
        message: format!("{}: {err}", path.display()),
    })?;
    MainSetting::from_yaml_str(&raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_consistent() {
        let block = BlockSetting::default();
        assert!(block.validate().is_ok());
        assert_eq!(block.input_selection(), InputSelection::Slice(SliceSpec::default()));
        assert!(block.resolved_nodes().is_err());
        assert_eq!(block.with_io_dims(4, 2).resolved_nodes().unwrap(), vec![4, 2]);
    }

    #[test]
    fn hidden_layers_expand() {
        let block = BlockSetting::from_yaml_str(
            "hidden_nodes: 16\nhidden_layers: 3\nhidden_activation: tanh\n",
        )
        .unwrap();
        assert_eq!(block.nodes, vec![-1, 16, 16, 16, -1]);
        assert_eq!(
            block.activations,
            vec![
                Activation::Tanh,
                Activation::Tanh,
                Activation::Tanh,
                Activation::Identity
            ]
        );
        assert_eq!(block.dropouts, vec![0.0, 0.5, 0.5, 0.0]);
    }

    #[test]
    fn inconsistent_arrays_fail() {
        let err = BlockSetting::from_yaml_str("nodes: [4, 8, 2]\nactivations: [relu]\n")
            .unwrap_err();
        assert!(err.to_string().contains("Block definition invalid"));
    }

    #[test]
    fn slices_follow_python_rules() {
        let s = SliceSpec::from_value("s", &serde_yaml::from_str("[1, null, 2]").unwrap()).unwrap();
        assert_eq!(s.indices(6).unwrap(), vec![1, 3, 5]);
        let stop_only = SliceSpec::from_value("s", &serde_yaml::from_str("[2]").unwrap()).unwrap();
        assert_eq!(stop_only.indices(5).unwrap(), vec![0, 1]);
        let reversed = SliceSpec {
            start: None,
            stop: None,
            step: Some(-1),
        };
        assert_eq!(reversed.indices(3).unwrap(), vec![2, 1, 0]);
        let tail = SliceSpec {
            start: Some(-2),
            stop: None,
            step: None,
        };
        assert_eq!(tail.indices(4).unwrap(), vec![2, 3]);
    }

    #[test]
    fn unknown_block_keys_are_rejected_but_options_are_kept() {
        assert!(BlockSetting::from_yaml_str("nodez: [1, 2]\n").is_err());
        let block =
            BlockSetting::from_yaml_str("optional:\n  propagations: [convolution]\n  foo: 3\n")
                .unwrap();
        assert!(block.optional.extra.contains_key("foo"));
        assert!(block.validate_equivariant().is_ok());
    }

    #[test]
    fn pad_is_deprecated() {
        let err = MainSetting::from_yaml_str("data:\n  pad: true\n").unwrap_err();
        assert!(err.to_string().contains("deprecated"));
    }
}
