//! Portable model container.
//!
//! A trained [`ConvNet`] is written as a single JSON document holding the layer sizes and every
//! weight tensor. Tensors are either stored as plain floats or as symmetric int8 values with a
//! per-tensor scale. Files are written to a temporary sibling and renamed into place, so a
//! reader never observes a half-written model.

use crate::error::{Error, Result};
use crate::model::conv::{Conv2D, MaxPool2D};
use crate::model::conv_net::{ConvNet, TrainingConfig};
use crate::model::neural_net::{ActivationFunction, NeuralNet};
use clap::ValueEnum;
use json::JsonValue;
use ndarray::{Array1, Array2, ArrayD, ArrayView, Dimension, IxDyn};
use std::fs;
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;

const FORMAT: &str = "emnist-letters-convnet";
const VERSION: u32 = 1;
const QMAX: f64 = 127f64;

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Precision {
    F64,
    Int8,
}

/// Symmetric int8 encoding of a tensor: value ~= q * scale
#[derive(Debug, Clone, PartialEq)]
pub struct Quantized {
    pub scale: f64,
    pub values: Vec<i8>,
}

pub fn quantize(values: &[f64]) -> Quantized {
    let max_abs = values.iter().fold(0f64, |acc, v| acc.max(v.abs()));
    let scale = if max_abs > 0f64 { max_abs / QMAX } else { 1f64 };

    Quantized {
        scale,
        values: values
            .iter()
            .map(|v| (v / scale).round().clamp(-QMAX, QMAX) as i8)
            .collect(),
    }
}

pub fn dequantize(quantized: &Quantized) -> Vec<f64> {
    quantized
        .values
        .iter()
        .map(|&q| q as f64 * quantized.scale)
        .collect()
}

/// Build the JSON document for `model`
pub fn to_json(model: &ConvNet, precision: Precision) -> JsonValue {
    let mut data = JsonValue::new_object();

    data["format"] = FORMAT.into();
    data["version"] = VERSION.into();
    data["precision"] = value_name(&precision).into();
    data["rows"] = model.input_shape.0.into();
    data["cols"] = model.input_shape.1.into();
    data["num_classes"] = model.num_classes().into();
    data["activation"] = value_name(&model.head.activation_function).into();

    let mut conv = JsonValue::new_object();
    conv["in_channels"] = model.conv.in_channels.into();
    conv["out_channels"] = model.conv.out_channels.into();
    conv["kernel_size"] = model.conv.kernel_size.into();
    conv["pool_size"] = model.pool.pool_size.into();
    conv["kernels"] = encode_tensor(model.conv.kernels.view(), precision);
    conv["bias"] = encode_tensor(model.conv.bias.view(), precision);
    data["conv"] = conv;

    let dense: Vec<JsonValue> = model
        .head
        .layers
        .iter()
        .map(|(weights, bias)| {
            let mut layer = JsonValue::new_object();
            layer["weights"] = encode_tensor(weights.view(), precision);
            layer["bias"] = encode_tensor(bias.view(), precision);
            layer
        })
        .collect();
    data["dense"] = JsonValue::Array(dense);

    data
}

/// Rebuild a model from its JSON document
pub fn from_json(data: &JsonValue) -> Result<ConvNet> {
    if data["format"].as_str() != Some(FORMAT) {
        return Err(Error::ModelFormat(format!(
            "expected format {FORMAT}, found {}",
            data["format"]
        )));
    }
    if data["version"].as_u32() != Some(VERSION) {
        return Err(Error::ModelFormat(format!(
            "unsupported version {}",
            data["version"]
        )));
    }

    let rows = field_usize(data, "rows")?;
    let cols = field_usize(data, "cols")?;
    let num_classes = field_usize(data, "num_classes")?;
    let activation_function = data["activation"]
        .as_str()
        .and_then(|name| ActivationFunction::from_str(name, true).ok())
        .ok_or_else(|| Error::ModelFormat(format!("unknown activation {}", data["activation"])))?;

    let conv_data = &data["conv"];
    let in_channels = field_usize(conv_data, "in_channels")?;
    let out_channels = field_usize(conv_data, "out_channels")?;
    let kernel_size = field_usize(conv_data, "kernel_size")?;
    let pool = MaxPool2D::new(field_usize(conv_data, "pool_size")?);
    if in_channels != 1 || kernel_size == 0 || kernel_size > rows.min(cols) || pool.pool_size == 0 {
        return Err(Error::ModelFormat(format!(
            "unsupported conv stage: {in_channels} input channels, kernel {kernel_size}, pool {}",
            pool.pool_size
        )));
    }
    let kernels: Array2<f64> = decode_matrix(&conv_data["kernels"], "conv.kernels")?;
    let conv_bias: Array1<f64> = decode_vector(&conv_data["bias"], "conv.bias")?;

    if kernels.dim() != (out_channels, in_channels * kernel_size * kernel_size)
        || conv_bias.len() != out_channels
    {
        return Err(Error::ModelFormat(
            "conv tensors disagree with the declared layer sizes".to_string(),
        ));
    }

    let conv = Conv2D {
        in_channels,
        out_channels,
        kernel_size,
        kernels,
        bias: conv_bias,
    };

    let (conv_rows, conv_cols) = conv.output_shape(rows, cols);
    let (pooled_rows, pooled_cols) = pool.output_shape(conv_rows, conv_cols);
    let mut expected_inputs = out_channels * pooled_rows * pooled_cols;

    let mut layers = vec![];
    for (i, layer) in data["dense"].members().enumerate() {
        let weights = decode_matrix(&layer["weights"], &format!("dense[{i}].weights"))?;
        let bias = decode_vector(&layer["bias"], &format!("dense[{i}].bias"))?;

        if weights.nrows() != expected_inputs || bias.len() != weights.ncols() {
            return Err(Error::ModelFormat(format!(
                "dense layer {i} is {:?} with {} biases, expected {} inputs",
                weights.dim(),
                bias.len(),
                expected_inputs
            )));
        }

        expected_inputs = weights.ncols();
        layers.push((weights, bias));
    }

    if layers.is_empty() || expected_inputs != num_classes {
        return Err(Error::ModelFormat(format!(
            "dense head does not end in {num_classes} classes"
        )));
    }

    Ok(ConvNet {
        input_shape: (rows, cols),
        conv,
        pool,
        head: NeuralNet {
            layers,
            activation_function,
        },
        training: TrainingConfig::default(),
    })
}

/// Write `model` to `path` and return the size of the artifact in bytes.
/// The target is only replaced once the whole document is on disk.
pub fn save(path: &Path, model: &ConvNet, precision: Precision) -> Result<u64> {
    let bytes = to_json(model, precision).dump().into_bytes();

    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut file = NamedTempFile::new_in(dir)?;
    file.write_all(&bytes)?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|err| Error::Io(err.error))?;

    tracing::info!(path = %path.display(), bytes = bytes.len(), ?precision, "exported model");

    Ok(bytes.len() as u64)
}

pub fn load(path: &Path) -> Result<ConvNet> {
    let text = fs::read_to_string(path)?;

    from_json(&json::parse(&text)?)
}

fn value_name<T: ValueEnum>(value: &T) -> String {
    value
        .to_possible_value()
        .map(|v| v.get_name().to_string())
        .unwrap_or_default()
}

fn field_usize(data: &JsonValue, key: &str) -> Result<usize> {
    data[key]
        .as_usize()
        .ok_or_else(|| Error::ModelFormat(format!("missing or invalid field {key}")))
}

fn encode_tensor<D: Dimension>(array: ArrayView<f64, D>, precision: Precision) -> JsonValue {
    let mut tensor = JsonValue::new_object();
    let values: Vec<f64> = array.iter().copied().collect();

    tensor["shape"] = array.shape().to_vec().into();
    match precision {
        Precision::F64 => {
            tensor["values"] = values.into();
        }
        Precision::Int8 => {
            let quantized = quantize(&values);
            tensor["scale"] = quantized.scale.into();
            tensor["values"] = quantized.values.into();
        }
    }

    tensor
}

fn decode_tensor(tensor: &JsonValue, name: &str) -> Result<ArrayD<f64>> {
    let invalid = || Error::ModelFormat(format!("tensor {name} is malformed"));

    let shape = tensor["shape"]
        .members()
        .map(|dim| dim.as_usize())
        .collect::<Option<Vec<usize>>>()
        .ok_or_else(invalid)?;

    let values = match tensor["scale"].as_f64() {
        Some(scale) => {
            let quantized = Quantized {
                scale,
                values: tensor["values"]
                    .members()
                    .map(|v| v.as_i8())
                    .collect::<Option<Vec<i8>>>()
                    .ok_or_else(invalid)?,
            };
            dequantize(&quantized)
        }
        None => tensor["values"]
            .members()
            .map(|v| v.as_f64())
            .collect::<Option<Vec<f64>>>()
            .ok_or_else(invalid)?,
    };

    ArrayD::from_shape_vec(IxDyn(&shape), values).map_err(|_| invalid())
}

fn decode_matrix(tensor: &JsonValue, name: &str) -> Result<Array2<f64>> {
    decode_tensor(tensor, name)?
        .into_dimensionality()
        .map_err(|_| Error::ModelFormat(format!("tensor {name} is not a matrix")))
}

fn decode_vector(tensor: &JsonValue, name: &str) -> Result<Array1<f64>> {
    decode_tensor(tensor, name)?
        .into_dimensionality()
        .map_err(|_| Error::ModelFormat(format!("tensor {name} is not a vector")))
}
