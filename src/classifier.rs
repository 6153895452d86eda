/// Classifier module
///
/// The engine only needs `score(features) -> probability`. `DenseModel` is the
/// deployable artifact: a small feed-forward network exported as JSON.

use crate::features::FeatureVector;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum ClassifierError {
    #[error("Model artifact error: {0}")]
    Artifact(String),

    #[error("Feature vector has {actual} values, model expects {expected}")]
    InputDimension { expected: usize, actual: usize },

    #[error("Model returned malformed output: {0}")]
    MalformedOutput(String),
}

/// Scoring contract the pipeline depends on
#[cfg_attr(test, mockall::automock)]
pub trait Classifier: Send {
    /// Input dimension the artifact was built for
    fn input_dim(&self) -> usize;

    /// Probability in [0, 1] that the target sound is present
    fn score(&self, features: &FeatureVector) -> Result<f32, ClassifierError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    Relu,
    Sigmoid,
    Tanh,
    Linear,
}

impl Activation {
    fn apply(self, x: f32) -> f32 {
        match self {
            Activation::Relu => x.max(0.0),
            Activation::Sigmoid => 1.0 / (1.0 + (-x).exp()),
            Activation::Tanh => x.tanh(),
            Activation::Linear => x,
        }
    }
}

/// Fully connected layer, `weights[out][in]`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DenseLayer {
    pub weights: Vec<Vec<f32>>,
    pub bias: Vec<f32>,
    pub activation: Activation,
}

/// Standardization applied before the first layer: `(x - mean) / scale`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scaler {
    pub mean: Vec<f32>,
    pub scale: Vec<f32>,
}

/// Feed-forward network artifact
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DenseModel {
    pub input_dim: usize,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub scaler: Option<Scaler>,
    pub layers: Vec<DenseLayer>,
}

impl DenseModel {
    /// Load and validate an artifact from disk
    pub fn load(path: &Path) -> Result<Self, ClassifierError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            ClassifierError::Artifact(format!("cannot read {}: {}", path.display(), e))
        })?;

        let model: DenseModel = serde_json::from_str(&text).map_err(|e| {
            ClassifierError::Artifact(format!("cannot parse {}: {}", path.display(), e))
        })?;
        model.validate()?;

        info!(
            "Loaded model {} (version {}, input_dim={}, layers={})",
            path.display(),
            model.version.as_deref().unwrap_or("unversioned"),
            model.input_dim,
            model.layers.len()
        );

        Ok(model)
    }

    /// Check that layer shapes chain and end in a single output
    pub fn validate(&self) -> Result<(), ClassifierError> {
        let fail = |msg: String| Err(ClassifierError::Artifact(msg));

        if self.input_dim == 0 {
            return fail("input_dim must be greater than 0".to_string());
        }
        if self.layers.is_empty() {
            return fail("model has no layers".to_string());
        }

        if let Some(scaler) = &self.scaler {
            if scaler.mean.len() != self.input_dim || scaler.scale.len() != self.input_dim {
                return fail(format!(
                    "scaler has {}/{} entries, expected {}",
                    scaler.mean.len(),
                    scaler.scale.len(),
                    self.input_dim
                ));
            }
            if scaler.scale.iter().any(|&s| s == 0.0 || !s.is_finite()) {
                return fail("scaler contains a zero or non-finite scale".to_string());
            }
        }

        let mut width = self.input_dim;
        for (i, layer) in self.layers.iter().enumerate() {
            if layer.weights.is_empty() {
                return fail(format!("layer {} has no units", i));
            }
            if layer.bias.len() != layer.weights.len() {
                return fail(format!(
                    "layer {} has {} biases for {} units",
                    i,
                    layer.bias.len(),
                    layer.weights.len()
                ));
            }
            if let Some(row) = layer.weights.iter().position(|r| r.len() != width) {
                return fail(format!(
                    "layer {} unit {} has {} weights, expected {}",
                    i,
                    row,
                    layer.weights[row].len(),
                    width
                ));
            }
            width = layer.weights.len();
        }

        if width != 1 {
            return fail(format!("final layer has {} outputs, expected 1", width));
        }

        Ok(())
    }
}

impl Classifier for DenseModel {
    fn input_dim(&self) -> usize {
        self.input_dim
    }

    fn score(&self, features: &FeatureVector) -> Result<f32, ClassifierError> {
        if features.len() != self.input_dim {
            return Err(ClassifierError::InputDimension {
                expected: self.input_dim,
                actual: features.len(),
            });
        }

        let mut activations: Vec<f32> = match &self.scaler {
            Some(scaler) => features
                .iter()
                .zip(scaler.mean.iter().zip(&scaler.scale))
                .map(|(x, (m, s))| (x - m) / s)
                .collect(),
            None => features.clone(),
        };

        for layer in &self.layers {
            activations = layer
                .weights
                .iter()
                .zip(&layer.bias)
                .map(|(row, b)| {
                    let z: f32 = row.iter().zip(&activations).map(|(w, x)| w * x).sum::<f32>() + b;
                    layer.activation.apply(z)
                })
                .collect();
        }

        let score = activations.first().copied().unwrap_or(f32::NAN);
        if !score.is_finite() || !(0.0..=1.0).contains(&score) {
            return Err(ClassifierError::MalformedOutput(format!(
                "score {} outside [0, 1]",
                score
            )));
        }

        debug!("Model score: {:.4}", score);
        Ok(score)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::io::Write;

    fn logistic(input_dim: usize, weight: f32, bias: f32) -> DenseModel {
        DenseModel {
            input_dim,
            version: Some("test".to_string()),
            scaler: None,
            layers: vec![DenseLayer {
                weights: vec![vec![weight; input_dim]],
                bias: vec![bias],
                activation: Activation::Sigmoid,
            }],
        }
    }

    #[test]
    fn test_logistic_score() {
        let model = logistic(2, 1.0, 0.0);
        assert!(model.validate().is_ok());
        assert_relative_eq!(model.score(&vec![0.0, 0.0]).unwrap(), 0.5);
        assert!(model.score(&vec![5.0, 5.0]).unwrap() > 0.99);
    }

    #[test]
    fn test_hidden_layer_and_scaler() {
        let model = DenseModel {
            input_dim: 2,
            version: None,
            scaler: Some(Scaler {
                mean: vec![1.0, 1.0],
                scale: vec![2.0, 2.0],
            }),
            layers: vec![
                DenseLayer {
                    weights: vec![vec![1.0, 0.0], vec![0.0, -1.0]],
                    bias: vec![0.0, 0.0],
                    activation: Activation::Relu,
                },
                DenseLayer {
                    weights: vec![vec![1.0, 1.0]],
                    bias: vec![0.0],
                    activation: Activation::Sigmoid,
                },
            ],
        };
        assert!(model.validate().is_ok());

        // scaled = [1, -1] -> relu([1, 1]) -> sigmoid(2)
        let score = model.score(&vec![3.0, -1.0]).unwrap();
        assert_relative_eq!(score, 1.0 / (1.0 + (-2.0f32).exp()), epsilon = 1e-6);
    }

    #[test]
    fn test_shape_mismatch_rejected() {
        let mut model = logistic(3, 1.0, 0.0);
        model.layers[0].weights[0].pop();
        assert!(matches!(model.validate(), Err(ClassifierError::Artifact(_))));
    }

    #[test]
    fn test_multiple_outputs_rejected() {
        let mut model = logistic(2, 1.0, 0.0);
        model.layers[0].weights.push(vec![1.0, 1.0]);
        model.layers[0].bias.push(0.0);
        assert!(matches!(model.validate(), Err(ClassifierError::Artifact(_))));
    }

    #[test]
    fn test_linear_output_out_of_range_is_malformed() {
        let mut model = logistic(1, 1.0, 0.0);
        model.layers[0].activation = Activation::Linear;
        assert!(matches!(
            model.score(&vec![3.0]),
            Err(ClassifierError::MalformedOutput(_))
        ));
    }

    #[test]
    fn test_nan_input_is_malformed() {
        let model = logistic(1, 1.0, 0.0);
        assert!(matches!(
            model.score(&vec![f32::NAN]),
            Err(ClassifierError::MalformedOutput(_))
        ));
    }

    #[test]
    fn test_wrong_input_length() {
        let model = logistic(4, 1.0, 0.0);
        assert!(matches!(
            model.score(&vec![0.0; 3]),
            Err(ClassifierError::InputDimension { expected: 4, actual: 3 })
        ));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let json = serde_json::to_string(&logistic(3, 0.5, -1.0)).unwrap();
        file.write_all(json.as_bytes()).unwrap();

        let model = DenseModel::load(file.path()).unwrap();
        assert_eq!(model.input_dim(), 3);
        assert_eq!(model.version.as_deref(), Some("test"));
    }

    #[test]
    fn test_load_missing_or_corrupt_file() {
        assert!(matches!(
            DenseModel::load(Path::new("/nonexistent/model.json")),
            Err(ClassifierError::Artifact(_))
        ));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"{ not json").unwrap();
        assert!(matches!(
            DenseModel::load(file.path()),
            Err(ClassifierError::Artifact(_))
        ));
    }
}
