//! Strided indexing: basic views, integer-array gather and scatter.
//!
//! A key is a list of [`TensorIndex`] items, one per leading axis.
//! Missing trailing items select the whole axis. At most one item may be
//! an index array; when one is present, integer items count as 0-d
//! advanced indices for placement: the index array's dims replace the
//! advanced block in place if all advanced items are adjacent, and move
//! to the front otherwise.

use std::sync::atomic::{AtomicUsize, Ordering};

use rayon::prelude::*;

use crate::ops::arithmetic::broadcast_index;
use crate::device::Device;
use crate::error::KoreError;
use crate::shape::Shape;
use crate::storage::Storage;
use crate::tensor::Tensor;
use crate::Result;

/// A `start:stop:step` range over one axis, resolved like Python slices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slice {
    pub start: Option<isize>,
    pub stop: Option<isize>,
    pub step: isize,
}

impl Slice {
    /// The whole axis, `:`.
    pub fn full() -> Self {
        Self { start: None, stop: None, step: 1 }
    }

    /// `start:stop` with unit step.
    pub fn range(start: isize, stop: isize) -> Self {
        Self { start: Some(start), stop: Some(stop), step: 1 }
    }

    /// `start:stop:step`; either bound may be omitted.
    pub fn new(start: Option<isize>, stop: Option<isize>, step: isize) -> Self {
        Self { start, stop, step }
    }

    /// Resolve against an axis of length `size`, returning
    /// `(first, len, step)`.
    pub fn indices(&self, size: usize) -> Result<(isize, usize, isize)> {
        let step = self.step;
        if step == 0 {
            return Err(KoreError::UnsupportedIndex("slice step cannot be zero".into()));
        }
        let size = size as isize;
        let (lower, upper) = if step > 0 { (0, size) } else { (-1, size - 1) };
        let clamp = |bound: isize| {
            if bound < 0 {
                (bound + size).max(lower)
            } else {
                bound.min(upper)
            }
        };
        let start = self.start.map(clamp).unwrap_or(if step > 0 { lower } else { upper });
        let stop = self.stop.map(clamp).unwrap_or(if step > 0 { upper } else { lower });

        let len = if step > 0 && stop > start {
            ((stop - start - 1) / step + 1) as usize
        } else if step < 0 && start > stop {
            ((start - stop - 1) / -step + 1) as usize
        } else {
            0
        };
        Ok((start, len, step))
    }
}

impl Default for Slice {
    fn default() -> Self {
        Self::full()
    }
}

/// One item of an indexing key.
#[derive(Debug, Clone)]
pub enum TensorIndex {
    /// A single position; negative values count from the end. Drops the axis.
    Int(isize),
    /// A range of positions. Keeps the axis.
    Slice(Slice),
    /// An integer index array (I32 or I64); its dims replace the axis.
    Tensor(Tensor),
}

impl From<isize> for TensorIndex {
    fn from(i: isize) -> Self {
        TensorIndex::Int(i)
    }
}

impl From<Slice> for TensorIndex {
    fn from(s: Slice) -> Self {
        TensorIndex::Slice(s)
    }
}

impl From<Tensor> for TensorIndex {
    fn from(t: Tensor) -> Self {
        TensorIndex::Tensor(t)
    }
}

/// How duplicate target positions are resolved by a scatter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScatterOrder {
    /// Writes land in index iteration order: the last duplicate wins.
    #[default]
    Ordered,
    /// Writes are issued by parallel workers: which duplicate wins is
    /// unspecified. This is how device-resident scatters behave.
    Unordered,
}

impl ScatterOrder {
    /// The scatter semantics of a backend living on `device`.
    pub fn for_device(device: Device) -> Self {
        match device {
            Device::Cpu => ScatterOrder::Ordered,
            Device::Cuda(_) => ScatterOrder::Unordered,
        }
    }
}

// ============================================================================
// Planning
// ============================================================================

/// Per-axis selection after resolving a key.
#[derive(Debug, Clone, Copy)]
enum AxisSel {
    Fixed(usize),
    Range { start: isize, len: usize, step: isize },
    Array,
}

struct Advanced {
    axis: usize,
    dims: Vec<usize>,
    values: Vec<usize>,
}

/// Output shape plus the physical storage offset of every selected element.
struct IndexPlan {
    out_dims: Vec<usize>,
    offsets: Vec<usize>,
}

fn normalize(index: isize, axis: usize, size: usize) -> Result<usize> {
    let resolved = if index < 0 { index + size as isize } else { index };
    if resolved < 0 || resolved >= size as isize {
        return Err(KoreError::IndexOutOfBounds { index, axis, size });
    }
    Ok(resolved as usize)
}

fn resolve(t: &Tensor, key: &[TensorIndex]) -> Result<(Vec<AxisSel>, Option<Advanced>)> {
    let dims = t.shape().dims();
    if key.len() > dims.len() {
        return Err(KoreError::TooManyIndices { got: key.len(), ndim: dims.len() });
    }
    let arrays = key.iter().filter(|k| matches!(k, TensorIndex::Tensor(_))).count();
    if arrays > 1 {
        return Err(KoreError::UnsupportedIndex(format!(
            "{} index arrays in one key, at most one is supported",
            arrays
        )));
    }

    let mut sels = Vec::with_capacity(dims.len());
    let mut adv = None;
    for (axis, &size) in dims.iter().enumerate() {
        let sel = match key.get(axis) {
            None => {
                let (start, len, step) = Slice::full().indices(size)?;
                AxisSel::Range { start, len, step }
            }
            Some(TensorIndex::Int(i)) => AxisSel::Fixed(normalize(*i, axis, size)?),
            Some(TensorIndex::Slice(s)) => {
                let (start, len, step) = s.indices(size)?;
                AxisSel::Range { start, len, step }
            }
            Some(TensorIndex::Tensor(idx)) => {
                if !idx.dtype().is_integer() {
                    return Err(KoreError::UnsupportedIndex(format!(
                        "index arrays must have an integer dtype, got {}",
                        idx.dtype()
                    )));
                }
                let values = idx
                    .to_i64_vec()?
                    .into_iter()
                    .map(|v| normalize(v as isize, axis, size))
                    .collect::<Result<Vec<_>>>()?;
                adv = Some(Advanced {
                    axis,
                    dims: idx.shape().dims().to_vec(),
                    values,
                });
                AxisSel::Array
            }
        };
        sels.push(sel);
    }
    Ok((sels, adv))
}

/// Where output dims come from, in output order.
#[derive(Clone, Copy)]
enum OutDim {
    Range { axis: usize, start: isize, step: isize },
    Adv,
}

fn plan(t: &Tensor, key: &[TensorIndex]) -> Result<IndexPlan> {
    let (sels, adv) = resolve(t, key)?;
    let strides = t.strides();

    let mut base = t.offset() as isize;
    let mut ranges = Vec::new();
    for (axis, sel) in sels.iter().enumerate() {
        match *sel {
            AxisSel::Fixed(i) => base += (i * strides[axis]) as isize,
            AxisSel::Range { start, len, step } => {
                ranges.push((axis, start, len, step));
            }
            AxisSel::Array => {}
        }
    }

    let mut layout: Vec<(OutDim, usize)> = ranges
        .iter()
        .map(|&(axis, start, len, step)| (OutDim::Range { axis, start, step }, len))
        .collect();

    if let Some(adv) = &adv {
        // advanced items: the index array plus any integer items, since
        // integers broadcast as 0-d arrays next to an index array
        let positions: Vec<usize> = key
            .iter()
            .enumerate()
            .filter(|(_, k)| !matches!(k, TensorIndex::Slice(_)))
            .map(|(i, _)| i)
            .collect();
        let first = positions[0];
        let adjacent = positions.last().map_or(true, |&last| last - first + 1 == positions.len());
        let insert_at = if adjacent {
            ranges.iter().filter(|&&(axis, ..)| axis < first).count()
        } else {
            0
        };
        let block = adv.dims.iter().map(|&d| (OutDim::Adv, d));
        layout.splice(insert_at..insert_at, block);
    }

    let out_dims: Vec<usize> = layout.iter().map(|&(_, len)| len).collect();
    let numel: usize = out_dims.iter().product();
    let adv_strides = adv
        .as_ref()
        .map(|a| Shape::new(&a.dims).contiguous_strides().to_vec())
        .unwrap_or_default();

    let mut offsets = Vec::with_capacity(numel);
    let mut coord = vec![0usize; out_dims.len()];
    for _ in 0..numel {
        let mut physical = base;
        let mut adv_flat = 0usize;
        let mut adv_dim = 0usize;
        for (&(part, _), &c) in layout.iter().zip(&coord) {
            match part {
                OutDim::Range { axis, start, step } => {
                    physical += (start + c as isize * step) * strides[axis] as isize;
                }
                OutDim::Adv => {
                    adv_flat += c * adv_strides[adv_dim];
                    adv_dim += 1;
                }
            }
        }
        if let Some(adv) = &adv {
            physical += (adv.values[adv_flat] * strides[adv.axis]) as isize;
        }
        offsets.push(physical as usize);

        for axis in (0..out_dims.len()).rev() {
            coord[axis] += 1;
            if coord[axis] < out_dims[axis] {
                break;
            }
            coord[axis] = 0;
        }
    }

    Ok(IndexPlan { out_dims, offsets })
}

/// Zero-copy view for keys made only of integers and positive-step slices.
fn basic_view(t: &Tensor, key: &[TensorIndex]) -> Result<Option<Tensor>> {
    let basic = key.iter().all(|k| match k {
        TensorIndex::Int(_) => true,
        TensorIndex::Slice(s) => s.step > 0,
        TensorIndex::Tensor(_) => false,
    });
    if !basic {
        return Ok(None);
    }

    let (sels, _) = resolve(t, key)?;
    let mut offset = t.offset();
    let mut dims = Vec::new();
    let mut strides = Vec::new();
    for (axis, sel) in sels.iter().enumerate() {
        let stride = t.strides()[axis];
        match *sel {
            AxisSel::Fixed(i) => offset += i * stride,
            AxisSel::Range { start, len, step } => {
                if len > 0 {
                    offset += start as usize * stride;
                }
                dims.push(len);
                strides.push(stride * step as usize);
            }
            AxisSel::Array => return Ok(None),
        }
    }
    if dims.iter().any(|&d| d == 0) {
        offset = 0;
    }
    Tensor::from_strided(t.storage_ref().clone(), Shape::new(&dims), &strides, offset).map(Some)
}

// ============================================================================
// Gather / scatter
// ============================================================================

impl Tensor {
    /// Read `self[key]`.
    ///
    /// Keys of integers and positive-step slices return a view sharing
    /// storage; anything else gathers into a new contiguous tensor on the
    /// same device. The result never carries autograd history.
    pub fn index(&self, key: &[TensorIndex]) -> Result<Tensor> {
        if let Some(view) = basic_view(self, key)? {
            return Ok(view);
        }

        let plan = plan(self, key)?;
        let host = self.to(Device::Cpu)?;
        let elem = self.dtype().element_size();
        let src = host.storage_ref().as_bytes()?;
        let mut bytes = Vec::with_capacity(plan.offsets.len() * elem);
        for &p in &plan.offsets {
            bytes.extend_from_slice(&src[p * elem..(p + 1) * elem]);
        }
        let storage = Storage::from_bytes(self.dtype(), plan.offsets.len(), bytes)?;
        Tensor::from_storage(storage, &plan.out_dims).to(self.device())
    }

    /// Write `value` into `self[key]` in place, resolving duplicate
    /// positions in index order (the last one wins).
    pub fn index_put(&mut self, key: &[TensorIndex], value: &Tensor) -> Result<()> {
        self.index_put_with(key, value, ScatterOrder::Ordered)
    }

    /// Write `value` into `self[key]` in place with explicit duplicate
    /// resolution.
    ///
    /// `value` must broadcast to the shape of `self[key]` and share its
    /// dtype. With [`ScatterOrder::Unordered`] the element stored at a
    /// position referenced more than once may be any of the candidates.
    pub fn index_put_with(
        &mut self,
        key: &[TensorIndex],
        value: &Tensor,
        order: ScatterOrder,
    ) -> Result<()> {
        if value.dtype() != self.dtype() {
            return Err(KoreError::DTypeMismatch {
                expected: self.dtype(),
                got: value.dtype(),
            });
        }
        let plan = plan(self, key)?;
        let out_shape = Shape::new(&plan.out_dims);
        if !value.shape().broadcasts_to(&out_shape) {
            return Err(KoreError::BroadcastError {
                a: value.shape().dims().to_vec(),
                b: plan.out_dims.clone(),
            });
        }

        let elem = self.dtype().element_size();
        // owned copy, so a value aliasing the destination reads the old data
        let val = value.to(Device::Cpu)?.contiguous()?.storage_ref().as_bytes()?.to_vec();
        let source = |k: usize| broadcast_index(k, &out_shape, value.shape());

        match self.device() {
            Device::Cpu => {
                let mut dst = self.storage_ref().as_bytes_mut()?;
                scatter_bytes(&mut dst, &val, &plan.offsets, elem, order, source);
            }
            Device::Cuda(_) => {
                let host = self.storage_ref().to_cpu()?;
                let mut bytes = host.as_bytes()?.to_vec();
                scatter_bytes(&mut bytes, &val, &plan.offsets, elem, order, source);
                self.storage_ref().upload(&bytes)?;
            }
        }
        Ok(())
    }
}

/// Copy value element `source(k)` to physical slot `offsets[k]` for every `k`.
fn scatter_bytes(
    dst: &mut [u8],
    val: &[u8],
    offsets: &[usize],
    elem: usize,
    order: ScatterOrder,
    source: impl Fn(usize) -> usize,
) {
    let write = |dst: &mut [u8], p: usize, k: usize| {
        let v = source(k);
        dst[p * elem..(p + 1) * elem].copy_from_slice(&val[v * elem..(v + 1) * elem]);
    };
    match order {
        ScatterOrder::Ordered => {
            for (k, &p) in offsets.iter().enumerate() {
                write(dst, p, k);
            }
        }
        ScatterOrder::Unordered => {
            // each slot keeps whichever writer stored last
            let winners: Vec<AtomicUsize> = (0..dst.len() / elem)
                .map(|_| AtomicUsize::new(usize::MAX))
                .collect();
            offsets
                .par_iter()
                .enumerate()
                .for_each(|(k, &p)| winners[p].store(k, Ordering::Relaxed));
            for &p in offsets {
                write(dst, p, winners[p].load(Ordering::Relaxed));
            }
        }
    }
}
