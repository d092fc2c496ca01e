// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Parameter snapshots for layers and blocks, as JSON or bincode.

use crate::module::Parameterised;
use crate::{PureResult, TensorError};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

pub type StateDict = HashMap<String, Array2<f32>>;

#[derive(Clone, Debug, Serialize, Deserialize)]
struct StoredMatrix {
    rows: usize,
    cols: usize,
    data: Vec<f32>,
}

impl StoredMatrix {
    fn from_array(value: &Array2<f32>) -> Self {
        let (rows, cols) = value.dim();
        Self {
            rows,
            cols,
            data: value.iter().copied().collect(),
        }
    }

    fn into_array(self) -> PureResult<Array2<f32>> {
        if self.rows * self.cols != self.data.len() {
            return Err(TensorError::DataLength {
                expected: self.rows * self.cols,
                got: self.data.len(),
            });
        }
        Ok(Array2::from_shape_vec((self.rows, self.cols), self.data)?)
    }
}

// BTreeMap keeps the written files stable across runs.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct Snapshot {
    parameters: BTreeMap<String, StoredMatrix>,
}

fn snapshot_from_state(state: &StateDict) -> Snapshot {
    Snapshot {
        parameters: state
            .iter()
            .map(|(name, value)| (name.clone(), StoredMatrix::from_array(value)))
            .collect(),
    }
}

fn state_from_snapshot(snapshot: Snapshot) -> PureResult<StateDict> {
    snapshot
        .parameters
        .into_iter()
        .map(|(name, stored)| Ok((name, stored.into_array()?)))
        .collect()
}

fn io_error(err: std::io::Error) -> TensorError {
    TensorError::IoError {
        message: err.to_string(),
    }
}

fn serde_error(err: impl ToString) -> TensorError {
    TensorError::SerializationError {
        message: err.to_string(),
    }
}

pub fn save_state_dict_json<P: AsRef<Path>>(state: &StateDict, path: P) -> PureResult<()> {
    let file = File::create(path.as_ref()).map_err(io_error)?;
    serde_json::to_writer_pretty(BufWriter::new(file), &snapshot_from_state(state))
        .map_err(serde_error)
}

pub fn load_state_dict_json<P: AsRef<Path>>(path: P) -> PureResult<StateDict> {
    let file = File::open(path.as_ref()).map_err(io_error)?;
    let snapshot: Snapshot =
        serde_json::from_reader(BufReader::new(file)).map_err(serde_error)?;
    state_from_snapshot(snapshot)
}

pub fn save_state_dict_bincode<P: AsRef<Path>>(state: &StateDict, path: P) -> PureResult<()> {
    let file = File::create(path.as_ref()).map_err(io_error)?;
    bincode::serialize_into(BufWriter::new(file), &snapshot_from_state(state))
        .map_err(serde_error)
}

pub fn load_state_dict_bincode<P: AsRef<Path>>(path: P) -> PureResult<StateDict> {
    let file = File::open(path.as_ref()).map_err(io_error)?;
    let snapshot: Snapshot =
        bincode::deserialize_from(BufReader::new(file)).map_err(serde_error)?;
    state_from_snapshot(snapshot)
}

pub fn save_json<M: Parameterised + ?Sized, P: AsRef<Path>>(module: &M, path: P) -> PureResult<()> {
    save_state_dict_json(&module.state_dict()?, path)
}

pub fn load_json<M: Parameterised + ?Sized, P: AsRef<Path>>(
    module: &mut M,
    path: P,
) -> PureResult<()> {
    let state = load_state_dict_json(path)?;
    module.load_state_dict(&state)
}

pub fn save_bincode<M: Parameterised + ?Sized, P: AsRef<Path>>(
    module: &M,
    path: P,
) -> PureResult<()> {
    save_state_dict_bincode(&module.state_dict()?, path)
}

pub fn load_bincode<M: Parameterised + ?Sized, P: AsRef<Path>>(
    module: &mut M,
    path: P,
) -> PureResult<()> {
    let state = load_state_dict_bincode(path)?;
    module.load_state_dict(&state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::Linear;
    use ndarray::arr2;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn save_and_load_roundtrip_json() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("linear.json");
        let mut layer = Linear::init("io", 2, 2, true).unwrap();
        save_json(&layer, &path).unwrap();
        let before = layer.state_dict().unwrap();
        layer.weight_mut().value_mut().fill(0.0);
        load_json(&mut layer, &path).unwrap();
        assert_eq!(before, layer.state_dict().unwrap());
    }

    #[test]
    fn save_and_load_roundtrip_bincode() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("linear.bin");
        let weight = arr2(&[[0.01, 0.02, 0.03], [0.04, 0.05, 0.06]]);
        let mut layer =
            Linear::from_arrays("io", weight.clone(), Some(arr2(&[[0.0, 0.0, 0.0]]))).unwrap();
        save_bincode(&layer, &path).unwrap();
        layer.weight_mut().value_mut().fill(1.0);
        load_bincode(&mut layer, &path).unwrap();
        assert!(fs::metadata(&path).unwrap().len() > 0);
        assert_eq!(layer.weight().value(), &weight);
        assert_eq!(layer.state_dict().unwrap().len(), 2);
    }

    #[test]
    fn corrupt_snapshot_is_reported() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.json");
        fs::write(&path, "{\"parameters\": {\"w\": {\"rows\": 2, \"cols\": 2, \"data\": [1.0]}}}")
            .unwrap();
        assert!(matches!(
            load_state_dict_json(&path),
            Err(TensorError::DataLength { expected: 4, got: 1 })
        ));
    }
}
