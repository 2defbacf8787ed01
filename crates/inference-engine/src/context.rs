//! Execution context: one stream, one in-flight inference at a time
//!
//! Each call allocates its device buffers, queues host-to-device copy,
//! launch and device-to-host copy on the context's stream, then
//! synchronizes. Buffers are released when the call returns, whether it
//! succeeded or not.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

use accelerator::{Device, Stream};
use common::error::{Error, Result};
use common::types::{BindingInfo, BindingRole};
use common::utils::format_duration;
use model_compiler::CompiledEngine;

/// Host input for one inference call
#[derive(Debug, Clone, Copy)]
pub struct InferenceRequest<'a> {
    /// `batch_size` samples, flattened
    pub input: &'a [f32],

    /// Number of samples in `input`
    pub batch_size: usize,
}

impl<'a> InferenceRequest<'a> {
    /// Creates a request
    pub fn new(input: &'a [f32], batch_size: usize) -> Self {
        Self { input, batch_size }
    }
}

/// Host output of one inference call
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceResult {
    /// `batch_size` output samples, flattened
    pub output: Vec<f32>,

    /// Number of samples
    pub batch_size: usize,

    /// Wall time of the call
    pub elapsed: Duration,
}

/// Per-engine execution state
pub struct ExecutionContext {
    /// Engine plan and metadata
    engine: Arc<CompiledEngine>,

    /// Device the buffers live on
    device: Arc<Device>,

    /// Stream all work is queued on
    stream: Stream,

    /// Index of the input binding
    input_index: usize,

    /// Index of the output binding
    output_index: usize,
}

impl ExecutionContext {
    pub(crate) fn new(engine: Arc<CompiledEngine>, device: Arc<Device>) -> Result<Self> {
        let (input_index, output_index) = resolve_bindings(engine.bindings())?;
        let stream = Stream::new(device.clone())?;

        debug!(
            "Created execution context for engine {} on stream {} (input #{}, output #{})",
            engine.id(),
            stream.id(),
            input_index,
            output_index
        );

        Ok(Self {
            engine,
            device,
            stream,
            input_index,
            output_index,
        })
    }

    /// Input binding descriptor
    pub fn input_binding(&self) -> &BindingInfo {
        &self.engine.bindings()[self.input_index]
    }

    /// Output binding descriptor
    pub fn output_binding(&self) -> &BindingInfo {
        &self.engine.bindings()[self.output_index]
    }

    /// Number of output values a call with `batch_size` produces
    pub fn output_len(&self, batch_size: usize) -> usize {
        batch_size * self.output_binding().element_count()
    }

    /// Runs one inference and returns a freshly allocated output
    pub fn infer(&mut self, request: &InferenceRequest<'_>) -> Result<InferenceResult> {
        let started = Instant::now();
        self.validate_batch(request)?;

        let mut output = vec![0.0f32; self.output_len(request.batch_size)];
        self.run(request, &mut output)?;

        Ok(InferenceResult {
            output,
            batch_size: request.batch_size,
            elapsed: started.elapsed(),
        })
    }

    /// Runs one inference into a caller-provided output slice
    ///
    /// On error the contents of `output` are unspecified.
    pub fn infer_into(&mut self, request: &InferenceRequest<'_>, output: &mut [f32]) -> Result<Duration> {
        let started = Instant::now();
        self.validate_batch(request)?;

        let expected = self.output_len(request.batch_size);
        if output.len() != expected {
            return Err(Error::InvalidArgument(format!(
                "output buffer holds {} values, expected {}",
                output.len(),
                expected
            )));
        }

        self.run(request, output)?;
        Ok(started.elapsed())
    }

    fn validate_batch(&self, request: &InferenceRequest<'_>) -> Result<()> {
        let max = self.engine.max_batch_size();
        if request.batch_size == 0 || request.batch_size > max {
            return Err(Error::InvalidArgument(format!(
                "batch size {} outside 1..={}",
                request.batch_size, max
            )));
        }

        let expected = request.batch_size * self.input_binding().element_count();
        if request.input.len() != expected {
            return Err(Error::InvalidArgument(format!(
                "input holds {} values, expected {} for batch {} of {}",
                request.input.len(),
                expected,
                request.batch_size,
                self.input_binding().dims
            )));
        }
        Ok(())
    }

    fn run(&mut self, request: &InferenceRequest<'_>, output: &mut [f32]) -> Result<()> {
        let started = Instant::now();
        let outcome = self.enqueue_and_wait(request, output);

        if let Err(e) = &outcome {
            warn!("Inference on stream {} failed: {}", self.stream.id(), e);
            // Nothing may still be running against this call's buffers.
            if let Err(drain) = self.stream.synchronize() {
                trace!("stream {} drained with {}", self.stream.id(), drain);
            }
        } else {
            debug!(
                "Inference batch {} completed in {}",
                request.batch_size,
                format_duration(started.elapsed())
            );
        }

        outcome
    }

    fn enqueue_and_wait(&self, request: &InferenceRequest<'_>, output: &mut [f32]) -> Result<()> {
        let batch = request.batch_size;
        let input_buffer = self.device.allocate(self.input_binding().byte_size(batch))?;
        let output_buffer = self.device.allocate(self.output_binding().byte_size(batch))?;

        self.stream
            .copy_host_to_device(&input_buffer, bytemuck::cast_slice(request.input))?;

        let engine = self.engine.clone();
        self.stream.launch(
            &format!("engine {}", engine.id()),
            &[&input_buffer, &output_buffer],
            move |args| {
                let (src, dst) = args.f32_pair(0, 1)?;
                engine.execute(batch, &[src], &mut [dst])
            },
        )?;

        let transfer = self.stream.copy_device_to_host(&output_buffer)?;
        self.stream.synchronize()?;

        let bytes = transfer.take()?;
        let out_bytes: &mut [u8] = bytemuck::cast_slice_mut(output);
        if bytes.len() != out_bytes.len() {
            return Err(Error::Execution(format!(
                "device returned {} bytes, expected {}",
                bytes.len(),
                out_bytes.len()
            )));
        }
        out_bytes.copy_from_slice(&bytes);

        Ok(())
    }
}

/// Finds the single input and single output binding
fn resolve_bindings(bindings: &[BindingInfo]) -> Result<(usize, usize)> {
    let find = |role: BindingRole| -> Result<usize> {
        let mut matches = bindings
            .iter()
            .enumerate()
            .filter(|(_, b)| b.role == role)
            .map(|(i, _)| i);

        match (matches.next(), matches.next()) {
            (Some(index), None) => Ok(index),
            (None, _) => Err(Error::BindingMismatch(format!("engine has no {} binding", role))),
            (Some(_), Some(_)) => Err(Error::BindingMismatch(format!(
                "engine has more than one {} binding",
                role
            ))),
        }
    };

    Ok((find(BindingRole::Input)?, find(BindingRole::Output)?))
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("engine", &self.engine.id())
            .field("stream", &self.stream.id())
            .field("input_index", &self.input_index)
            .field("output_index", &self.output_index)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::EngineCache;
    use crate::runtime::Runtime;
    use crate::test_support::{compile, device, TWO_LAYERS};
    use common::types::{AcceleratorCore, DataType, Dims};
    use model_compiler::BuildConfig;

    fn context(memory: u64, max_batch: usize) -> (Arc<Device>, ExecutionContext) {
        let device = device(memory);
        let config = BuildConfig { max_batch_size: max_batch, ..BuildConfig::default() };
        let compiled = compile(&device, TWO_LAYERS, config);
        let blob = EngineCache::serialize(&compiled).unwrap();
        let engine = Runtime::new(device.clone())
            .deserialize(&blob, AcceleratorCore::NONE)
            .unwrap();
        let context = engine.create_execution_context().unwrap();
        (device, context)
    }

    #[test]
    fn test_zero_input_gives_finite_repeatable_output() {
        let (device, mut context) = context(1 << 20, 1);
        let input = vec![0.0f32; 6];

        let first = context.infer(&InferenceRequest::new(&input, 1)).unwrap();
        let second = context.infer(&InferenceRequest::new(&input, 1)).unwrap();

        assert_eq!(first.output.len(), context.output_len(1));
        assert!(first.output.iter().all(|v| v.is_finite()));
        assert_eq!(first.output, second.output);
        assert_eq!(device.memory_usage().used_bytes, 0);
    }

    #[test]
    fn test_known_values() {
        let (_device, mut context) = context(1 << 20, 2);
        // Two samples of [2x3]; dense sums each row, then relu(x - 1).
        let input = [1.0, 1.0, 1.0, -1.0, -1.0, -1.0, 0.5, 0.5, 0.0, 2.0, 0.0, 0.0];
        let result = context.infer(&InferenceRequest::new(&input, 2)).unwrap();
        assert_eq!(result.output, vec![2.0, 0.0, 0.0, 1.0]);
        assert_eq!(result.batch_size, 2);
    }

    #[test]
    fn test_infer_into_caller_buffer() {
        let (_device, mut context) = context(1 << 20, 1);
        let input = [1.0f32; 6];
        let mut output = [0.0f32; 2];
        context.infer_into(&InferenceRequest::new(&input, 1), &mut output).unwrap();
        assert_eq!(output, [2.0, 2.0]);

        let mut short = [0.0f32; 1];
        let err = context.infer_into(&InferenceRequest::new(&input, 1), &mut short).unwrap_err();
        assert!(err.is_invalid_argument());
    }

    #[test]
    fn test_invalid_requests_touch_no_device_memory() {
        let (device, mut context) = context(1 << 20, 1);
        let input = [0.0f32; 6];

        assert!(context.infer(&InferenceRequest::new(&input, 2)).unwrap_err().is_invalid_argument());
        assert!(context.infer(&InferenceRequest::new(&input, 0)).unwrap_err().is_invalid_argument());
        assert!(context.infer(&InferenceRequest::new(&input[..5], 1)).unwrap_err().is_invalid_argument());
        assert_eq!(device.memory_usage().live_allocations, 0);
    }

    #[test]
    fn test_allocation_failure_restores_heap() {
        // Room for the 24-byte input but not the 8-byte output.
        let (device, mut context) = context(28, 1);
        let input = [0.0f32; 6];

        let err = context.infer(&InferenceRequest::new(&input, 1)).unwrap_err();
        assert!(err.is_allocation());
        assert_eq!(device.memory_usage().used_bytes, 0);
        assert_eq!(device.memory_usage().live_allocations, 0);
    }

    #[test]
    fn test_resolve_bindings_requires_one_of_each() {
        let binding = |name: &str, role| BindingInfo {
            name: name.to_string(),
            role,
            dims: Dims::from_slice(&[1]),
            dtype: DataType::Float32,
        };

        let ok = [binding("y", BindingRole::Output), binding("x", BindingRole::Input)];
        assert_eq!(resolve_bindings(&ok).unwrap(), (1, 0));

        let two_outputs = [binding("a", BindingRole::Output), binding("b", BindingRole::Output)];
        assert!(resolve_bindings(&two_outputs).unwrap_err().is_binding_mismatch());
    }
}
