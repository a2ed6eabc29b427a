//! Naive loop nests for the operator patterns the strategies schedule.
//!
//! Each function builds the nest a tensor-expression front end would hand over: one block per
//! stage, each in its own perfect nest of serial loops, with multi-stage operators split into
//! separate sub-expressions where the front end lowers stages independently.

use crate::common::{DimSize, Dtype, Shape};
use crate::ir::{Expr, LoopNest, NestBuilder, Op, ReduceKind};
use crate::scheduling::ScheduleError;

/// `out = op(A)` over `shape`.
pub fn elementwise(shape: &[DimSize], dtype: Dtype, op: &str) -> Result<LoopNest, ScheduleError> {
    let mut b = NestBuilder::new();
    let a = b.buffer("A", shape.to_vec(), dtype);
    let out = b.buffer("out", shape.to_vec(), dtype);
    let mut blk = b.block("out");
    let idx = shape
        .iter()
        .enumerate()
        .map(|(d, e)| blk.spatial(&format!("i{d}"), e.get()))
        .collect::<Vec<_>>();
    blk.write(out, idx.clone())
        .read(a, idx)
        .op(Op::Map(op.to_owned()));
    blk.build()?;
    Ok(b.finish())
}

/// Reduces `input` over `axes`. Reducing every axis yields a one-element output.
///
/// The block's spatial loops come first, then its reduction loops.
pub fn reduce(
    input: &[DimSize],
    axes: &[usize],
    kind: ReduceKind,
    dtype: Dtype,
) -> Result<LoopNest, ScheduleError> {
    check_axes(input, axes)?;
    let kept = (0..input.len())
        .filter(|d| !axes.contains(d))
        .map(|d| input[d])
        .collect::<Vec<_>>();
    let out_shape = if kept.is_empty() { shape_of(&[1])? } else { kept };

    let mut b = NestBuilder::new();
    let a = b.buffer("A", input.to_vec(), dtype);
    let out = b.buffer("reduce_out", out_shape.clone(), dtype);
    let mut blk = b.block("reduce_out");
    let mut read_idx = vec![Expr::zero(); input.len()];
    let mut write_idx = vec![];
    for d in (0..input.len()).filter(|d| !axes.contains(d)) {
        let v = blk.spatial(&format!("i{d}"), input[d].get());
        read_idx[d] = v.clone();
        write_idx.push(v);
    }
    if write_idx.is_empty() {
        write_idx.push(blk.spatial("o", 1));
    }
    for &d in axes {
        read_idx[d] = blk.reduce(&format!("k{d}"), input[d].get());
    }
    blk.write(out, write_idx.clone())
        .read(out, write_idx)
        .read(a, read_idx)
        .op(Op::Reduce(kind));
    blk.build()?;
    Ok(b.finish())
}

/// A two-stage reduction of `A[P..., threads * chunk]` over its last axis.
///
/// `tmp[P..., t] = sum_k A[P..., t * chunk + k]` then `out[P...] = sum_t tmp[P..., t]`. With no
/// parallel axes, `out` has a single element.
pub fn block_reduce_internal(
    parallel: &[DimSize],
    threads: u32,
    chunk: u32,
    dtype: Dtype,
) -> Result<LoopNest, ScheduleError> {
    let mut input_shape = parallel.to_vec();
    input_shape.push(dim(threads * chunk)?);
    let mut tmp_shape = parallel.to_vec();
    tmp_shape.push(dim(threads)?);

    let mut b = NestBuilder::new();
    let a = b.buffer("A", input_shape, dtype);
    let tmp = b.buffer("tmp_out", tmp_shape, dtype);
    let out = b.buffer("out", out_or_scalar(parallel)?, dtype);

    let mut blk = b.block("tmp_out");
    let p = parallel_iters(&mut blk, parallel);
    let t = blk.spatial("t", threads);
    let k = blk.reduce("k", chunk);
    let tmp_idx = with(&p, t.clone());
    blk.write(tmp, tmp_idx.clone())
        .read(tmp, tmp_idx)
        .read(a, with(&p, t * chunk as i32 + k))
        .op(Op::Reduce(ReduceKind::Sum));
    blk.build()?;

    b.begin_expr();
    let mut blk = b.block("out");
    let p = parallel_iters(&mut blk, parallel);
    let out_idx = out_index(&mut blk, &p);
    let t = blk.reduce("t", threads);
    blk.write(out, out_idx.clone())
        .read(out, out_idx)
        .read(tmp, with(&p, t))
        .op(Op::Reduce(ReduceKind::Sum));
    blk.build()?;
    Ok(b.finish())
}

/// A three-stage reduction of `A[P..., threads * inner * chunk]` over its last axis.
///
/// `reduce_tmp[P..., t, s] = sum_k A[...]`, `tmp[P..., t] = sum_s reduce_tmp[P..., t, s]`, then
/// `out[P...] = sum_t tmp[P..., t]`.
pub fn block_reduce(
    parallel: &[DimSize],
    threads: u32,
    inner: u32,
    chunk: u32,
    dtype: Dtype,
) -> Result<LoopNest, ScheduleError> {
    let mut input_shape = parallel.to_vec();
    input_shape.push(dim(threads * inner * chunk)?);
    let mut reduce_tmp_shape = parallel.to_vec();
    reduce_tmp_shape.extend([dim(threads)?, dim(inner)?]);
    let mut tmp_shape = parallel.to_vec();
    tmp_shape.push(dim(threads)?);

    let mut b = NestBuilder::new();
    let a = b.buffer("A", input_shape, dtype);
    let reduce_tmp = b.buffer("reduce_tmp_out", reduce_tmp_shape, dtype);
    let tmp = b.buffer("tmp_out", tmp_shape, dtype);
    let out = b.buffer("out", out_or_scalar(parallel)?, dtype);

    let mut blk = b.block("reduce_tmp_out");
    let p = parallel_iters(&mut blk, parallel);
    let t = blk.spatial("t", threads);
    let s = blk.spatial("s", inner);
    let k = blk.reduce("k", chunk);
    let mut rt_idx = with(&p, t.clone());
    rt_idx.push(s.clone());
    let flat = (t * inner as i32 + s) * chunk as i32 + k;
    blk.write(reduce_tmp, rt_idx.clone())
        .read(reduce_tmp, rt_idx)
        .read(a, with(&p, flat))
        .op(Op::Reduce(ReduceKind::Sum));
    blk.build()?;

    b.begin_expr();
    let mut blk = b.block("tmp_out");
    let p = parallel_iters(&mut blk, parallel);
    let t = blk.spatial("t", threads);
    let s = blk.reduce("s", inner);
    let tmp_idx = with(&p, t.clone());
    let mut rt_idx = tmp_idx.clone();
    rt_idx.push(s);
    blk.write(tmp, tmp_idx.clone())
        .read(tmp, tmp_idx)
        .read(reduce_tmp, rt_idx)
        .op(Op::Reduce(ReduceKind::Sum));
    blk.build()?;

    b.begin_expr();
    let mut blk = b.block("out");
    let p = parallel_iters(&mut blk, parallel);
    let out_idx = out_index(&mut blk, &p);
    let t = blk.reduce("t", threads);
    blk.write(out, out_idx.clone())
        .read(out, out_idx)
        .read(tmp, with(&p, t))
        .op(Op::Reduce(ReduceKind::Sum));
    blk.build()?;
    Ok(b.finish())
}

/// `exp`, `sum` over `axis`, and the normalizing division, each lowered separately.
///
/// A negative `axis` counts from the end.
pub fn softmax(shape: &[DimSize], axis: i32, dtype: Dtype) -> Result<LoopNest, ScheduleError> {
    let axis = normalize_axis(axis, shape.len())?;
    let reduced = (0..shape.len())
        .filter(|&d| d != axis)
        .map(|d| shape[d])
        .collect::<Vec<_>>();

    let mut b = NestBuilder::new();
    let a = b.buffer("A", shape.to_vec(), dtype);
    let e = b.buffer("softmax_exp", shape.to_vec(), dtype);
    let s = b.buffer("softmax_sum", out_or_scalar(&reduced)?, dtype);
    let out = b.buffer("softmax_out", shape.to_vec(), dtype);

    let mut blk = b.block("softmax_exp");
    let idx = full_iters(&mut blk, shape);
    blk.write(e, idx.clone())
        .read(a, idx)
        .op(Op::Map("exp".to_owned()));
    blk.build()?;

    b.begin_expr();
    let mut blk = b.block("softmax_sum");
    let mut read_idx = vec![Expr::zero(); shape.len()];
    let mut kept = vec![];
    for d in (0..shape.len()).filter(|&d| d != axis) {
        let v = blk.spatial(&format!("i{d}"), shape[d].get());
        read_idx[d] = v.clone();
        kept.push(v);
    }
    let sum_idx = if kept.is_empty() {
        vec![blk.spatial("o", 1)]
    } else {
        kept
    };
    read_idx[axis] = blk.reduce("k", shape[axis].get());
    blk.write(s, sum_idx.clone())
        .read(s, sum_idx)
        .read(e, read_idx)
        .op(Op::Reduce(ReduceKind::Sum));
    blk.build()?;

    b.begin_expr();
    let mut blk = b.block("softmax_out");
    let idx = full_iters(&mut blk, shape);
    let mut sum_idx = idx
        .iter()
        .enumerate()
        .filter(|&(d, _)| d != axis)
        .map(|(_, v)| v.clone())
        .collect::<Vec<_>>();
    if sum_idx.is_empty() {
        sum_idx.push(Expr::zero());
    }
    blk.write(out, idx.clone())
        .read(e, idx)
        .read(s, sum_idx)
        .op(Op::Map("div".to_owned()));
    blk.build()?;
    Ok(b.finish())
}

/// Max pooling of an NCHW input with a square window and no padding.
pub fn pool2d(
    input: &[DimSize],
    kernel: u32,
    stride: u32,
    dtype: Dtype,
) -> Result<LoopNest, ScheduleError> {
    let [n, c, h, w] = nchw(input)?;
    if kernel == 0 || stride == 0 || kernel > h || kernel > w {
        return Err(ScheduleError::InvalidShape(format!(
            "pool window {kernel} with stride {stride} does not fit a {h}x{w} input"
        )));
    }
    let (oh, ow) = ((h - kernel) / stride + 1, (w - kernel) / stride + 1);

    let mut b = NestBuilder::new();
    let a = b.buffer("A", input.to_vec(), dtype);
    let out = b.buffer("pool_out", shape_of(&[n, c, oh, ow])?, dtype);
    let mut blk = b.block("pool_out");
    let vn = blk.spatial("n", n);
    let vc = blk.spatial("c", c);
    let vy = blk.spatial("y", oh);
    let vx = blk.spatial("x", ow);
    let ry = blk.reduce("ry", kernel);
    let rx = blk.reduce("rx", kernel);
    let out_idx = vec![vn.clone(), vc.clone(), vy.clone(), vx.clone()];
    blk.write(out, out_idx.clone())
        .read(out, out_idx)
        .read(a, vec![vn, vc, vy * stride as i32 + ry, vx * stride as i32 + rx])
        .op(Op::Reduce(ReduceKind::Max));
    blk.build()?;
    Ok(b.finish())
}

/// Average pooling of an NCHW input down to one value per channel.
///
/// A first stage accumulates `lanes` interleaved partial sums per channel. A second stage
/// combines them.
pub fn global_pool(input: &[DimSize], lanes: u32, dtype: Dtype) -> Result<LoopNest, ScheduleError> {
    let [n, c, h, w] = nchw(input)?;
    let area = h * w;
    let steps = divrem::DivCeil::div_ceil(area, lanes.max(1));

    let mut b = NestBuilder::new();
    let a = b.buffer("A", input.to_vec(), dtype);
    let partial = b.buffer("pool_partial", shape_of(&[n, c, lanes])?, dtype);
    let out = b.buffer("pool_out", shape_of(&[n, c])?, dtype);

    let mut blk = b.block("pool_partial");
    let vn = blk.spatial("n", n);
    let vc = blk.spatial("c", c);
    let t = blk.spatial("t", lanes);
    let r = blk.reduce("r", steps);
    let flat = t.clone() + r * lanes as i32;
    let idx = vec![vn.clone(), vc.clone(), t];
    blk.write(partial, idx.clone())
        .read(partial, idx)
        .read(
            a,
            vec![vn, vc, flat.clone().floor_div(w as i32), flat.clone().modulo(w as i32)],
        )
        .predicate(flat, area as i32)
        .op(Op::Reduce(ReduceKind::Sum));
    blk.build()?;

    let mut blk = b.block("pool_out");
    let vn = blk.spatial("n", n);
    let vc = blk.spatial("c", c);
    let t = blk.reduce("t", lanes);
    blk.write(out, vec![vn.clone(), vc.clone()])
        .read(out, vec![vn.clone(), vc.clone()])
        .read(partial, vec![vn, vc, t])
        .op(Op::Reduce(ReduceKind::Sum));
    blk.build()?;
    Ok(b.finish())
}

/// Parameters of a direct 2-D convolution over NCHW data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Conv2dParams {
    pub pad: u32,
    pub stride: u32,
    pub dilation: u32,
}

impl Default for Conv2dParams {
    fn default() -> Self {
        Conv2dParams {
            pad: 0,
            stride: 1,
            dilation: 1,
        }
    }
}

/// Padding, weight dilation, and the convolution itself.
///
/// The convolution block reads its own output first, then `input_pad`, then
/// `weights_dilation`.
pub fn conv2d(
    input: &[DimSize],
    weights: &[DimSize],
    params: Conv2dParams,
    dtype: Dtype,
) -> Result<LoopNest, ScheduleError> {
    let [n, c, h, w] = nchw(input)?;
    let [f, wc, kh, kw] = nchw(weights)?;
    let Conv2dParams {
        pad,
        stride,
        dilation,
    } = params;
    if wc != c || stride == 0 || dilation == 0 {
        return Err(ScheduleError::InvalidShape(format!(
            "cannot convolve {c} channels with {wc}-channel weights at stride {stride}, \
             dilation {dilation}"
        )));
    }
    let (ph, pw) = (h + 2 * pad, w + 2 * pad);
    let (dkh, dkw) = ((kh - 1) * dilation + 1, (kw - 1) * dilation + 1);
    if dkh > ph || dkw > pw {
        return Err(ScheduleError::InvalidShape(format!(
            "dilated kernel {dkh}x{dkw} exceeds padded input {ph}x{pw}"
        )));
    }
    let (oh, ow) = ((ph - dkh) / stride + 1, (pw - dkw) / stride + 1);

    let mut b = NestBuilder::new();
    let x = b.buffer("input", input.to_vec(), dtype);
    let wt = b.buffer("weights", weights.to_vec(), dtype);
    let xp = b.buffer("input_pad", shape_of(&[n, c, ph, pw])?, dtype);
    let wd = b.buffer("weights_dilation", shape_of(&[f, c, dkh, dkw])?, dtype);
    let out = b.buffer("conv2d_out", shape_of(&[n, f, oh, ow])?, dtype);

    let mut blk = b.block("input_pad");
    let idx = full_iters(&mut blk, &shape_of(&[n, c, ph, pw])?);
    let src = vec![
        idx[0].clone(),
        idx[1].clone(),
        idx[2].clone() - pad as i32,
        idx[3].clone() - pad as i32,
    ];
    blk.write(xp, idx).read(x, src).op(Op::Pad);
    blk.build()?;

    let mut blk = b.block("weights_dilation");
    let idx = full_iters(&mut blk, &shape_of(&[f, c, dkh, dkw])?);
    let src = vec![
        idx[0].clone(),
        idx[1].clone(),
        idx[2].clone().floor_div(dilation as i32),
        idx[3].clone().floor_div(dilation as i32),
    ];
    blk.write(wd, idx)
        .read(wt, src)
        .op(Op::Map("dilate".to_owned()));
    blk.build()?;

    let mut blk = b.block("conv2d_out");
    let vn = blk.spatial("n", n);
    let vf = blk.spatial("f", f);
    let vy = blk.spatial("y", oh);
    let vx = blk.spatial("x", ow);
    let rc = blk.reduce("rc", c);
    let ry = blk.reduce("ry", dkh);
    let rx = blk.reduce("rx", dkw);
    let out_idx = vec![vn.clone(), vf.clone(), vy.clone(), vx.clone()];
    blk.write(out, out_idx.clone())
        .read(out, out_idx)
        .read(
            xp,
            vec![
                vn,
                rc.clone(),
                vy * stride as i32 + ry.clone(),
                vx * stride as i32 + rx.clone(),
            ],
        )
        .read(wd, vec![vf, rc, ry, rx])
        .op(Op::Reduce(ReduceKind::Sum));
    blk.build()?;
    Ok(b.finish())
}

/// `C[m, n] = sum_k A[m, k] * B[k, n]` as one block.
pub fn matmul(m: u32, n: u32, k: u32, dtype: Dtype) -> Result<LoopNest, ScheduleError> {
    let mut b = NestBuilder::new();
    let a = b.buffer("A", shape_of(&[m, k])?, dtype);
    let bb = b.buffer("B", shape_of(&[k, n])?, dtype);
    let out = b.buffer("matmul_out", shape_of(&[m, n])?, dtype);
    let mut blk = b.block("matmul_out");
    let i = blk.spatial("i", m);
    let j = blk.spatial("j", n);
    let r = blk.reduce("k", k);
    blk.write(out, vec![i.clone(), j.clone()])
        .read(out, vec![i.clone(), j.clone()])
        .read(a, vec![i, r.clone()])
        .read(bb, vec![r, j])
        .op(Op::Reduce(ReduceKind::Sum));
    blk.build()?;
    Ok(b.finish())
}

/// The host matrix multiply: both operands are packed, partial products are reduced over
/// `k_inner`-wide chunks of `k`, and the chunks are summed.
///
/// Each stage is its own sub-expression. The partial-product buffer has shape
/// `[m, n, k / k_inner]`.
pub fn matmul_cpu(
    m: u32,
    n: u32,
    k: u32,
    k_inner: u32,
    dtype: Dtype,
) -> Result<LoopNest, ScheduleError> {
    if k_inner == 0 || k % k_inner != 0 {
        return Err(ScheduleError::InvalidShape(format!(
            "reduction chunk {k_inner} does not divide {k}"
        )));
    }
    let k_outer = k / k_inner;

    let mut b = NestBuilder::new();
    let a = b.buffer("A", shape_of(&[m, k])?, dtype);
    let bb = b.buffer("B", shape_of(&[k, n])?, dtype);
    let lhs = b.buffer("mul_lhs", shape_of(&[m, k])?, dtype);
    let rhs = b.buffer("mul_rhs", shape_of(&[n, k])?, dtype);
    let partial = b.buffer("mul_partial", shape_of(&[m, n, k_outer])?, dtype);
    let out = b.buffer("mul_out", shape_of(&[m, n])?, dtype);

    let mut blk = b.block("mul_lhs");
    let i = blk.spatial("i", m);
    let r = blk.spatial("k", k);
    blk.write(lhs, vec![i.clone(), r.clone()]).read(a, vec![i, r]);
    blk.build()?;

    b.begin_expr();
    let mut blk = b.block("mul_rhs");
    let j = blk.spatial("j", n);
    let r = blk.spatial("k", k);
    blk.write(rhs, vec![j.clone(), r.clone()]).read(bb, vec![r, j]);
    blk.build()?;

    b.begin_expr();
    let mut blk = b.block("mul_partial");
    let i = blk.spatial("i", m);
    let j = blk.spatial("j", n);
    let ko = blk.spatial("ko", k_outer);
    let ki = blk.reduce("ki", k_inner);
    let flat = ko.clone() * k_inner as i32 + ki;
    let idx = vec![i.clone(), j.clone(), ko];
    blk.write(partial, idx.clone())
        .read(partial, idx)
        .read(lhs, vec![i, flat.clone()])
        .read(rhs, vec![j, flat])
        .op(Op::Reduce(ReduceKind::Sum));
    blk.build()?;

    b.begin_expr();
    let mut blk = b.block("mul_out");
    let i = blk.spatial("i", m);
    let j = blk.spatial("j", n);
    let ko = blk.reduce("ko", k_outer);
    blk.write(out, vec![i.clone(), j.clone()])
        .read(out, vec![i.clone(), j.clone()])
        .read(partial, vec![i, j, ko])
        .op(Op::Reduce(ReduceKind::Sum));
    blk.build()?;
    Ok(b.finish())
}

/// Splits `input` along `axis` into consecutive sections, one output block each.
///
/// Returns the nest and the output shapes. Each output is its own sub-expression.
pub fn split(
    input: &[DimSize],
    axis: usize,
    sections: &[u32],
    dtype: Dtype,
) -> Result<(LoopNest, Vec<Shape>), ScheduleError> {
    check_axes(input, &[axis])?;
    if sections.is_empty()
        || sections.contains(&0)
        || sections.iter().map(|&s| u64::from(s)).sum::<u64>() != u64::from(input[axis].get())
    {
        return Err(ScheduleError::InvalidShape(format!(
            "sections {sections:?} do not partition an axis of extent {}",
            input[axis]
        )));
    }

    let mut b = NestBuilder::new();
    let a = b.buffer("A", input.to_vec(), dtype);
    let mut shapes = vec![];
    let mut offset = 0i32;
    for (i, &section) in sections.iter().enumerate() {
        let mut shape = input.to_vec();
        shape[axis] = dim(section)?;
        let name = format!("split_out_{i}");
        let out = b.buffer(&name, shape.clone(), dtype);
        b.begin_expr();
        let mut blk = b.block(&name);
        let idx = full_iters(&mut blk, &shape);
        let mut src = idx.clone();
        src[axis] = src[axis].clone() + offset;
        blk.write(out, idx).read(a, src);
        blk.build()?;
        offset += section as i32;
        shapes.push(shape);
    }
    Ok((b.finish(), shapes))
}

fn dim(extent: u32) -> Result<DimSize, ScheduleError> {
    DimSize::new(extent).ok_or_else(|| ScheduleError::InvalidShape("zero extent".to_owned()))
}

fn shape_of(extents: &[u32]) -> Result<Shape, ScheduleError> {
    extents.iter().map(|&e| dim(e)).collect()
}

fn out_or_scalar(shape: &[DimSize]) -> Result<Shape, ScheduleError> {
    if shape.is_empty() {
        shape_of(&[1])
    } else {
        Ok(shape.to_vec())
    }
}

fn nchw(shape: &[DimSize]) -> Result<[u32; 4], ScheduleError> {
    match shape {
        [a, b, c, d] => Ok([a.get(), b.get(), c.get(), d.get()]),
        _ => Err(ScheduleError::InvalidShape(format!(
            "expected a rank-4 shape, got rank {}",
            shape.len()
        ))),
    }
}

fn check_axes(shape: &[DimSize], axes: &[usize]) -> Result<(), ScheduleError> {
    if let Some(bad) = axes.iter().find(|&&a| a >= shape.len()) {
        return Err(ScheduleError::InvalidShape(format!(
            "axis {bad} out of range for rank {}",
            shape.len()
        )));
    }
    Ok(())
}

/// Maps a possibly negative axis into `0..rank`.
pub fn normalize_axis(axis: i32, rank: usize) -> Result<usize, ScheduleError> {
    let rank_i = rank as i32;
    let normalized = if axis < 0 { axis + rank_i } else { axis };
    if normalized < 0 || normalized >= rank_i {
        return Err(ScheduleError::InvalidShape(format!(
            "axis {axis} out of range for rank {rank}"
        )));
    }
    Ok(normalized as usize)
}

fn full_iters(blk: &mut crate::ir::BlockBuilder<'_>, shape: &[DimSize]) -> Vec<Expr> {
    shape
        .iter()
        .enumerate()
        .map(|(d, e)| blk.spatial(&format!("i{d}"), e.get()))
        .collect()
}

fn parallel_iters(blk: &mut crate::ir::BlockBuilder<'_>, parallel: &[DimSize]) -> Vec<Expr> {
    parallel
        .iter()
        .enumerate()
        .map(|(d, e)| blk.spatial(&format!("p{d}"), e.get()))
        .collect()
}

fn out_index(blk: &mut crate::ir::BlockBuilder<'_>, parallel: &[Expr]) -> Vec<Expr> {
    if parallel.is_empty() {
        vec![blk.spatial("o", 1)]
    } else {
        parallel.to_vec()
    }
}

fn with(prefix: &[Expr], last: Expr) -> Vec<Expr> {
    let mut v = prefix.to_vec();
    v.push(last);
    v
}
