use anyhow::{anyhow, Context, Result};
use ort::{
    Environment, Session, SessionBuilder, Value,
    GraphOptimizationLevel, LoggingLevel,
};
use ndarray::{Array2, ArrayView2, Axis, CowArray};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::debug;

/// Maps feature rows to `[p_not_streaming, p_streaming]` rows. Rows are independent.
pub trait Classifier {
    fn predict_proba(&self, rows: ArrayView2<f32>) -> Result<Array2<f32>>;
}

pub struct OnnxClassifier {
    #[allow(dead_code)]
    environment: Arc<Environment>,
    session: Mutex<Session>,
    n_features: usize,
}

impl OnnxClassifier {
    pub fn load<P: AsRef<Path>>(model_path: P, n_features: usize) -> Result<Self> {
        let model_path = model_path.as_ref();
        let environment = Arc::new(
            Environment::builder()
                .with_name("streaming-model")
                .with_log_level(LoggingLevel::Warning)
                .build()
                .context("Failed to create ONNX environment")?
        );

        let session = SessionBuilder::new(&environment)?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(1)?
            .with_model_from_file(model_path)
            .with_context(|| format!("Failed to load streaming model from {}", model_path.display()))?;

        Ok(Self {
            environment,
            session: Mutex::new(session),
            n_features,
        })
    }
}

impl Classifier for OnnxClassifier {
    fn predict_proba(&self, rows: ArrayView2<f32>) -> Result<Array2<f32>> {
        let n_rows = rows.nrows();
        if rows.ncols() != self.n_features {
            return Err(anyhow!("Expected {} features per row, got {}", self.n_features, rows.ncols()));
        }

        let cow = CowArray::from(rows.to_owned().into_dyn());

        let t0 = Instant::now();

        let session = self.session.lock()
            .map_err(|e| anyhow!("Failed to lock model session: {}", e))?;

        let tensor = Value::from_array(session.allocator(), &cow)
            .context("Failed to create input tensor")?;

        let outputs = session.run(vec![tensor])
            .context("Failed to run streaming model")?;

        // Label output comes first and is not f32; the probability tensor is.
        let probs = outputs.iter()
            .find_map(|o| o.try_extract::<f32>().ok())
            .map(|t| t.view().iter().copied().collect::<Vec<f32>>())
            .ok_or_else(|| anyhow!("No probability output from streaming model"))?;

        debug!(rows = n_rows, micros = t0.elapsed().as_micros() as u64, "model inference");

        if probs.len() != n_rows * 2 {
            return Err(anyhow!("Expected {} probabilities, got {}", n_rows * 2, probs.len()));
        }

        Array2::from_shape_vec((n_rows, 2), probs)
            .context("Failed to shape probability output")
    }
}

/// Column-wise mean over all windows of one client in one batch.
pub fn average_probabilities(probs: &Array2<f32>) -> Option<[f32; 2]> {
    if probs.ncols() != 2 {
        return None;
    }
    let mean = probs.mean_axis(Axis(0))?;
    Some([mean[0], mean[1]])
}

/// One streaming decision for a client, from its averaged class probabilities.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Verdict {
    pub p_not_streaming: f32,
    pub p_streaming: f32,
    pub is_streaming: bool,
}

impl Verdict {
    pub fn new(avg: [f32; 2], threshold: f32) -> Self {
        Self {
            p_not_streaming: avg[0],
            p_streaming: avg[1],
            is_streaming: avg[1] > threshold,
        }
    }

    /// Probability of the class that won, as shown in status lines.
    pub fn score(&self) -> f32 {
        if self.is_streaming { self.p_streaming } else { self.p_not_streaming }
    }
}
