//! ONNX Runtime session plumbing shared by the model-backed encoders.

use crate::{MatchError, Result};
use log::info;
use ndarray::Array4;
use ort::session::{Session, builder::GraphOptimizationLevel};
use ort::value::Value;
use std::path::Path;
use std::sync::Mutex;

fn ort_err<R>(e: ort::Error<R>) -> MatchError {
    MatchError::Encoder(e.to_string())
}

/// An ONNX Runtime session behind a mutex.
///
/// The session is not assumed reentrant, so inference is serialized here;
/// inference dominates request latency anyway, so queueing is acceptable.
/// CPU execution is the default; accelerator execution providers compiled
/// into the runtime are picked up transparently.
pub struct OnnxSession {
    session: Mutex<Session>,
    input_name: &'static str,
}

impl OnnxSession {
    pub fn load(model_path: &Path, input_name: &'static str) -> Result<Self> {
        let model_bytes = std::fs::read(model_path).map_err(|e| {
            MatchError::Config(format!("cannot read model {}: {e}", model_path.display()))
        })?;
        let session = Session::builder()
            .map_err(ort_err)?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(ort_err)?
            .with_intra_threads(4)
            .map_err(ort_err)?
            .commit_from_memory(&model_bytes)
            .map_err(ort_err)?;
        info!("loaded ONNX model {} ({} bytes)", model_path.display(), model_bytes.len());
        Ok(Self { session: Mutex::new(session), input_name })
    }

    /// Runs one forward pass and returns the first `dimension` values of
    /// the first output tensor.
    pub fn run(&self, input: Array4<f32>, dimension: usize) -> Result<Vec<f32>> {
        let shape = input.shape().to_vec();
        let data: Vec<f32> = input.iter().copied().collect();
        let value = Value::from_array((shape, data)).map_err(ort_err)?;

        let mut session = self
            .session
            .lock()
            .map_err(|_| MatchError::Encoder("encoder session lock poisoned".into()))?;
        let outputs = session.run(ort::inputs![self.input_name => value]).map_err(ort_err)?;
        let (_shape, raw) = outputs[0].try_extract_tensor::<f32>().map_err(ort_err)?;
        if raw.len() < dimension {
            return Err(MatchError::Encoder(format!(
                "model produced {} values, expected at least {dimension}",
                raw.len()
            )));
        }
        Ok(raw[..dimension].to_vec())
    }
}
