//! Host kernels behind each plan operation
//!
//! Slices cover the whole batch. Large pointwise and softmax kernels are
//! split across the rayon pool; dense layers go through ndarray's matmul.

use ndarray::linalg::general_mat_mul;
use ndarray::{ArrayView1, ArrayView2, ArrayViewMut2};
use rayon::prelude::*;

use common::error::{Error, Result};
use crate::plan::{KernelOp, PointwiseStep};

/// Below this many elements kernels run on the calling thread
const PAR_THRESHOLD: usize = 16 * 1024;

/// Runs one kernel operation
pub fn run(op: &KernelOp, inputs: &[&[f32]], output: &mut [f32]) -> Result<()> {
    if inputs.len() != op.arity() {
        return Err(Error::Execution(format!(
            "{} kernel got {} inputs, expected {}",
            op.kind(),
            inputs.len(),
            op.arity()
        )));
    }

    match op {
        KernelOp::Pointwise { steps } => pointwise(steps, inputs[0], output),
        KernelOp::Add => add(inputs[0], inputs[1], output),
        KernelOp::Dense { in_features, out_features, weights, bias } => dense(
            *in_features,
            *out_features,
            weights,
            bias.as_deref(),
            inputs[0],
            output,
        ),
        KernelOp::Softmax { row_len } => softmax(*row_len, inputs[0], output),
    }
}

/// Applies a fused chain of elementwise steps
pub fn pointwise(steps: &[PointwiseStep], input: &[f32], output: &mut [f32]) -> Result<()> {
    check_len("pointwise", input.len(), output.len())?;

    let apply = |(dst, src): (&mut f32, &f32)| {
        *dst = steps.iter().fold(*src, |x, step| step.apply(x));
    };

    if output.len() >= PAR_THRESHOLD {
        output.par_iter_mut().zip(input.par_iter()).for_each(apply);
    } else {
        output.iter_mut().zip(input.iter()).for_each(apply);
    }
    Ok(())
}

/// Elementwise sum
pub fn add(a: &[f32], b: &[f32], output: &mut [f32]) -> Result<()> {
    check_len("add", a.len(), output.len())?;
    check_len("add", b.len(), output.len())?;

    if output.len() >= PAR_THRESHOLD {
        output
            .par_iter_mut()
            .zip(a.par_iter().zip(b.par_iter()))
            .for_each(|(dst, (x, y))| *dst = x + y);
    } else {
        for ((dst, x), y) in output.iter_mut().zip(a).zip(b) {
            *dst = x + y;
        }
    }
    Ok(())
}

/// `output = input · weightsᵀ + bias` over rows of `in_features`
pub fn dense(
    in_features: usize,
    out_features: usize,
    weights: &[f32],
    bias: Option<&[f32]>,
    input: &[f32],
    output: &mut [f32],
) -> Result<()> {
    if in_features == 0 || input.len() % in_features != 0 {
        return Err(Error::Execution(format!(
            "dense input of {} elements is not a multiple of {}",
            input.len(),
            in_features
        )));
    }
    let rows = input.len() / in_features;
    check_len("dense", rows * out_features, output.len())?;

    let shape_err = |e: ndarray::ShapeError| Error::Execution(format!("dense: {}", e));
    let x = ArrayView2::from_shape((rows, in_features), input).map_err(shape_err)?;
    let w = ArrayView2::from_shape((out_features, in_features), weights).map_err(shape_err)?;
    let mut y = ArrayViewMut2::from_shape((rows, out_features), output).map_err(shape_err)?;

    general_mat_mul(1.0, &x, &w.t(), 0.0, &mut y);

    if let Some(bias) = bias {
        let bias = ArrayView1::from_shape(out_features, bias).map_err(shape_err)?;
        y += &bias;
    }
    Ok(())
}

/// Numerically stable softmax over consecutive rows of `row_len`
pub fn softmax(row_len: usize, input: &[f32], output: &mut [f32]) -> Result<()> {
    check_len("softmax", input.len(), output.len())?;
    if row_len == 0 || input.len() % row_len != 0 {
        return Err(Error::Execution(format!(
            "softmax input of {} elements is not a multiple of {}",
            input.len(),
            row_len
        )));
    }

    let row = |(dst, src): (&mut [f32], &[f32])| {
        let max = src.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        let mut sum = 0.0f32;
        for (d, s) in dst.iter_mut().zip(src) {
            *d = (s - max).exp();
            sum += *d;
        }
        for d in dst.iter_mut() {
            *d /= sum;
        }
    };

    if output.len() >= PAR_THRESHOLD {
        output
            .par_chunks_mut(row_len)
            .zip(input.par_chunks(row_len))
            .for_each(row);
    } else {
        output.chunks_mut(row_len).zip(input.chunks(row_len)).for_each(row);
    }
    Ok(())
}

fn check_len(kernel: &str, input: usize, output: usize) -> Result<()> {
    if input != output {
        return Err(Error::Execution(format!(
            "{} kernel: {} input elements for {} output elements",
            kernel, input, output
        )));
    }
    Ok(())
}
