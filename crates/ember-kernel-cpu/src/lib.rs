#![forbid(unsafe_code)]

use ember_core::{
    ALL_DTYPES, AttrCType, AttrValue, DType, DataLayout, DenseTensor, ExecContext, KernelAttr,
    KernelContext, KernelError, KernelKey, KernelRegistry, Place, Storage, StorageData,
    StructuredKernel, TensorArgDef,
};

fn host_key(dtype: DType) -> KernelKey {
    KernelKey::new(Place::Host, DataLayout::Any, dtype)
}

fn ensure_same_shape(lhs: &DenseTensor, rhs: &DenseTensor) -> Result<(), KernelError> {
    if lhs.shape() != rhs.shape() {
        return Err(KernelError::ShapeMismatch {
            lhs: lhs.shape().to_vec(),
            rhs: rhs.shape().to_vec(),
        });
    }
    Ok(())
}

fn ensure_same_dtype(lhs: &DenseTensor, rhs: &DenseTensor) -> Result<(), KernelError> {
    match (lhs.dtype(), rhs.dtype()) {
        (Some(a), Some(b)) if a != b => Err(KernelError::DTypeMismatch { lhs: a, rhs: b }),
        _ => Ok(()),
    }
}

fn initialized_dtype(name: &str, tensor: &DenseTensor) -> Result<DType, KernelError> {
    tensor
        .dtype()
        .ok_or_else(|| KernelError::UninitializedInput { name: name.to_string() })
}

/// Lifts both operands to f64, applies `op` pointwise, and narrows back to
/// the lhs dtype.
fn binary_lifted_f64<F>(
    lhs: &DenseTensor,
    rhs: &DenseTensor,
    op: F,
) -> Result<Storage, KernelError>
where
    F: Fn(f64, f64) -> f64,
{
    ensure_same_shape(lhs, rhs)?;
    ensure_same_dtype(lhs, rhs)?;
    let dtype = initialized_dtype("lhs", lhs)?;
    let left = lhs.to_f64_vec()?;
    let right = rhs.to_f64_vec()?;
    let values: Vec<f64> = left
        .iter()
        .zip(right.iter())
        .map(|(a, b)| op(*a, *b))
        .collect();
    Ok(Storage::from_f64_slice(&values, dtype))
}

/// Element-type cast through the f64 lift. Integral targets truncate toward
/// zero; an equal-dtype cast degenerates to a snapshot.
pub fn cast_dtype(name: &str, tensor: &DenseTensor, dtype: DType) -> Result<DenseTensor, KernelError> {
    let current = initialized_dtype(name, tensor)?;
    if current == dtype {
        return Ok(tensor.clone());
    }
    let values = tensor.to_f64_vec()?;
    let mut out = tensor.clone();
    out.replace_storage(Storage::from_f64_slice(&values, dtype))?;
    Ok(out)
}

fn permute4<T: Copy>(data: &[T], src_dims: [usize; 4], perm: [usize; 4]) -> Vec<T> {
    let dst_dims = [
        src_dims[perm[0]],
        src_dims[perm[1]],
        src_dims[perm[2]],
        src_dims[perm[3]],
    ];
    let src_strides = [
        src_dims[1] * src_dims[2] * src_dims[3],
        src_dims[2] * src_dims[3],
        src_dims[3],
        1,
    ];
    let mut out = Vec::with_capacity(data.len());
    for a in 0..dst_dims[0] {
        for b in 0..dst_dims[1] {
            for c in 0..dst_dims[2] {
                for d in 0..dst_dims[3] {
                    let dst_coord = [a, b, c, d];
                    let mut src_coord = [0usize; 4];
                    for (dst_axis, src_axis) in perm.iter().enumerate() {
                        src_coord[*src_axis] = dst_coord[dst_axis];
                    }
                    let src_index: usize = src_coord
                        .iter()
                        .zip(src_strides.iter())
                        .map(|(coord, stride)| coord * stride)
                        .sum();
                    out.push(data[src_index]);
                }
            }
        }
    }
    out
}

/// Physical layout rewrite between the two concrete rank-4 layouts. Values
/// move; the element type is untouched.
pub fn transpose_layout(
    name: &str,
    tensor: &DenseTensor,
    target: DataLayout,
) -> Result<DenseTensor, KernelError> {
    if tensor.layout() == target {
        return Ok(tensor.clone());
    }
    let perm = match (tensor.layout(), target) {
        (DataLayout::Nchw, DataLayout::Nhwc) => [0, 2, 3, 1],
        (DataLayout::Nhwc, DataLayout::Nchw) => [0, 3, 1, 2],
        (from, to) => {
            return Err(KernelError::ContextMismatch {
                reason: format!("layout rewrite {from} -> {to} is not defined"),
            });
        }
    };
    let shape = tensor.shape();
    if shape.len() != 4 {
        return Err(KernelError::UnsupportedRank { kernel: "transpose_layout", rank: shape.len() });
    }
    let dims = [shape[0], shape[1], shape[2], shape[3]];
    let storage = tensor
        .storage()
        .ok_or_else(|| KernelError::UninitializedInput { name: name.to_string() })?;
    let permuted = match storage.data() {
        StorageData::F16(v) => Storage::new(StorageData::F16(permute4(v, dims, perm))),
        StorageData::Bf16(v) => Storage::new(StorageData::Bf16(permute4(v, dims, perm))),
        StorageData::F32(v) => Storage::new(StorageData::F32(permute4(v, dims, perm))),
        StorageData::F64(v) => Storage::new(StorageData::F64(permute4(v, dims, perm))),
        StorageData::I32(v) => Storage::new(StorageData::I32(permute4(v, dims, perm))),
        StorageData::I64(v) => Storage::new(StorageData::I64(permute4(v, dims, perm))),
        StorageData::Bool(v) => Storage::new(StorageData::Bool(permute4(v, dims, perm))),
    };
    let dst_shape = vec![dims[perm[0]], dims[perm[1]], dims[perm[2]], dims[perm[3]]];
    Ok(DenseTensor::new(permuted, dst_shape, target, tensor.place())?)
}

/// Resolves a reshape dim spec against the source shape: `-1` infers one
/// dimension from the element count, `0` copies the source dimension at the
/// same position.
pub fn resolve_reshape_dims(spec: &[i64], src_shape: &[usize]) -> Result<Vec<usize>, KernelError> {
    let numel: usize = src_shape.iter().product();
    let mut dims = Vec::with_capacity(spec.len());
    let mut wildcard = None;
    let mut known: usize = 1;
    for (position, dim) in spec.iter().enumerate() {
        match *dim {
            -1 => {
                if wildcard.is_some() {
                    return Err(KernelError::InvalidShapeValue {
                        reason: "more than one -1 dimension".to_string(),
                    });
                }
                wildcard = Some(position);
                dims.push(0);
            }
            0 => {
                let copied = src_shape.get(position).copied().ok_or_else(|| {
                    KernelError::InvalidShapeValue {
                        reason: format!("dimension {position} copies past source rank"),
                    }
                })?;
                known *= copied;
                dims.push(copied);
            }
            d if d < 0 => {
                return Err(KernelError::InvalidShapeValue {
                    reason: format!("negative dimension {d}"),
                });
            }
            d => {
                known *= d as usize;
                dims.push(d as usize);
            }
        }
    }
    if let Some(position) = wildcard {
        if known == 0 || numel % known != 0 {
            return Err(KernelError::InvalidShapeValue {
                reason: format!("cannot infer -1 for {numel} elements over {spec:?}"),
            });
        }
        dims[position] = numel / known;
    } else if known != numel {
        return Err(KernelError::InvalidShapeValue {
            reason: format!("shape {spec:?} holds {known} elements, source holds {numel}"),
        });
    }
    Ok(dims)
}

// ── legacy kernels ──

fn required_input(ctx: &dyn ExecContext, name: &str, index: usize) -> Result<DenseTensor, KernelError> {
    let tensor = ctx
        .input_tensor(name, index)
        .ok_or_else(|| KernelError::UninitializedInput { name: name.to_string() })?;
    if !tensor.is_initialized() {
        return Err(KernelError::UninitializedInput { name: name.to_string() });
    }
    Ok(tensor)
}

fn attr_f64(ctx: &dyn ExecContext, name: &str, default: f64) -> Result<f64, KernelError> {
    match ctx.attr(name) {
        Some(AttrValue::F32(v)) => Ok(f64::from(v)),
        Some(AttrValue::I32(v)) => Ok(f64::from(v)),
        Some(AttrValue::I64(v)) => Ok(v as f64),
        Some(other) => Err(KernelError::ContextMismatch {
            reason: format!("attribute '{name}' has kind {}", other.kind_str()),
        }),
        None => Ok(default),
    }
}

fn attr_bool(ctx: &dyn ExecContext, name: &str, default: bool) -> Result<bool, KernelError> {
    match ctx.attr(name) {
        Some(AttrValue::Bool(v)) => Ok(v),
        Some(other) => Err(KernelError::ContextMismatch {
            reason: format!("attribute '{name}' has kind {}", other.kind_str()),
        }),
        None => Ok(default),
    }
}

fn attr_dtype(ctx: &dyn ExecContext, name: &str) -> Result<DType, KernelError> {
    match ctx.attr(name) {
        Some(AttrValue::DType(dtype)) => Ok(dtype),
        Some(AttrValue::I32(code)) => Ok(DType::from_code(code)?),
        Some(AttrValue::I64(code)) => Ok(DType::from_code(code as i32)?),
        Some(other) => Err(KernelError::ContextMismatch {
            reason: format!("attribute '{name}' has kind {}", other.kind_str()),
        }),
        None => Err(KernelError::MissingAttr { name: name.to_string() }),
    }
}

pub fn legacy_add_host(ctx: &dyn ExecContext) -> Result<(), KernelError> {
    let x = required_input(ctx, "X", 0)?;
    let y = required_input(ctx, "Y", 0)?;
    let storage = binary_lifted_f64(&x, &y, |a, b| a + b)?;
    let mut out = x.clone();
    out.set_place(ctx.place());
    out.replace_storage(storage)?;
    ctx.set_output_tensor("Out", 0, out)
}

pub fn legacy_scale_host(ctx: &dyn ExecContext) -> Result<(), KernelError> {
    let x = required_input(ctx, "X", 0)?;
    let scale = if ctx.has_input("ScaleTensor") {
        let holder = required_input(ctx, "ScaleTensor", 0)?;
        holder.scalar_f64()?
    } else {
        attr_f64(ctx, "scale", 1.0)?
    };
    let bias = attr_f64(ctx, "bias", 0.0)?;
    let bias_after_scale = attr_bool(ctx, "bias_after_scale", true)?;

    let dtype = initialized_dtype("X", &x)?;
    let values: Vec<f64> = x
        .to_f64_vec()?
        .into_iter()
        .map(|v| {
            if bias_after_scale {
                v * scale + bias
            } else {
                (v + bias) * scale
            }
        })
        .collect();
    let mut out = x.clone();
    out.set_place(ctx.place());
    out.replace_storage(Storage::from_f64_slice(&values, dtype))?;
    ctx.set_output_tensor("Out", 0, out)
}

pub fn legacy_cast_host(ctx: &dyn ExecContext) -> Result<(), KernelError> {
    let x = required_input(ctx, "X", 0)?;
    let target = attr_dtype(ctx, "out_dtype")?;
    let mut out = cast_dtype("X", &x, target)?;
    out.set_place(ctx.place());
    ctx.set_output_tensor("Out", 0, out)
}

// ── structured kernels ──

fn ctx_input(ctx: &KernelContext, index: usize, name: &'static str) -> Result<DenseTensor, KernelError> {
    let tensor = ctx
        .input(index)
        .ok_or_else(|| KernelError::UninitializedInput { name: name.to_string() })?;
    if !tensor.is_initialized() {
        return Err(KernelError::UninitializedInput { name: name.to_string() });
    }
    Ok(tensor.clone())
}

fn ctx_attr<'a>(ctx: &'a KernelContext, index: usize, name: &'static str) -> Result<&'a KernelAttr, KernelError> {
    ctx.attr(index)
        .ok_or_else(|| KernelError::MissingAttr { name: name.to_string() })
}

fn write_output(ctx: &mut KernelContext, index: usize, tensor: DenseTensor) -> Result<(), KernelError> {
    if ctx.set_output(index, tensor) {
        Ok(())
    } else {
        Err(KernelError::MissingOutput { name: format!("slot {index}") })
    }
}

pub fn structured_add(ctx: &mut KernelContext) -> Result<(), KernelError> {
    let x = ctx_input(ctx, 0, "x")?;
    let y = ctx_input(ctx, 1, "y")?;
    let storage = binary_lifted_f64(&x, &y, |a, b| a + b)?;
    let out = ctx
        .output_mut(0)
        .ok_or_else(|| KernelError::MissingOutput { name: "out".to_string() })?;
    out.replace_storage(storage)?;
    Ok(())
}

pub fn structured_scale(ctx: &mut KernelContext) -> Result<(), KernelError> {
    let x = ctx_input(ctx, 0, "x")?;
    let scale = match ctx_attr(ctx, 0, "scale")? {
        KernelAttr::Scalar(scalar) => scalar.as_f64().ok_or_else(|| KernelError::ContextMismatch {
            reason: "scale scalar is non-numeric".to_string(),
        })?,
        other => {
            return Err(KernelError::ContextMismatch {
                reason: format!("scale attribute slot holds {other:?}"),
            });
        }
    };
    let bias = match ctx_attr(ctx, 1, "bias")? {
        KernelAttr::F32(v) => f64::from(*v),
        other => {
            return Err(KernelError::ContextMismatch {
                reason: format!("bias attribute slot holds {other:?}"),
            });
        }
    };
    let bias_after_scale = match ctx_attr(ctx, 2, "bias_after_scale")? {
        KernelAttr::Bool(v) => *v,
        other => {
            return Err(KernelError::ContextMismatch {
                reason: format!("bias_after_scale attribute slot holds {other:?}"),
            });
        }
    };

    let dtype = initialized_dtype("x", &x)?;
    let values: Vec<f64> = x
        .to_f64_vec()?
        .into_iter()
        .map(|v| {
            if bias_after_scale {
                v * scale + bias
            } else {
                (v + bias) * scale
            }
        })
        .collect();
    let out = ctx
        .output_mut(0)
        .ok_or_else(|| KernelError::MissingOutput { name: "out".to_string() })?;
    out.replace_storage(Storage::from_f64_slice(&values, dtype))?;
    Ok(())
}

pub fn structured_reshape(ctx: &mut KernelContext) -> Result<(), KernelError> {
    let x = ctx_input(ctx, 0, "x")?;
    let spec = match ctx_attr(ctx, 0, "shape")? {
        KernelAttr::IntArray(array) => array.values().to_vec(),
        other => {
            return Err(KernelError::ContextMismatch {
                reason: format!("shape attribute slot holds {other:?}"),
            });
        }
    };
    let dims = resolve_reshape_dims(&spec, x.shape())?;
    let storage = x
        .storage()
        .ok_or_else(|| KernelError::UninitializedInput { name: "x".to_string() })?
        .clone();
    let out = DenseTensor::new(storage, dims, x.layout(), ctx.place())?;
    write_output(ctx, 0, out)
}

pub fn structured_cast(ctx: &mut KernelContext) -> Result<(), KernelError> {
    let x = ctx_input(ctx, 0, "x")?;
    let target = match ctx_attr(ctx, 0, "out_dtype")? {
        KernelAttr::DType(dtype) => *dtype,
        other => {
            return Err(KernelError::ContextMismatch {
                reason: format!("out_dtype attribute slot holds {other:?}"),
            });
        }
    };
    let mut out = cast_dtype("x", &x, target)?;
    out.set_place(ctx.place());
    write_output(ctx, 0, out)
}

// ── registration ──

fn unary_structured(
    dtype: DType,
    attr_defs: Vec<AttrCType>,
    out_dtype: Option<DType>,
    func: fn(&mut KernelContext) -> Result<(), KernelError>,
) -> StructuredKernel {
    StructuredKernel {
        key: host_key(dtype),
        input_defs: vec![TensorArgDef::host(Some(dtype))],
        attr_defs,
        output_defs: vec![TensorArgDef::host(out_dtype)],
        func,
    }
}

/// Registers every host kernel this crate ships: add and scale in both
/// forms, cast and reshape as structured kernels, cast also as a legacy
/// kernel for the fallback path.
pub fn register_host_kernels(registry: &mut KernelRegistry) {
    for dtype in [DType::F32, DType::F64, DType::I32, DType::I64] {
        registry.register_legacy("add", host_key(dtype), legacy_add_host);
        registry.register_structured(
            "add",
            StructuredKernel {
                key: host_key(dtype),
                input_defs: vec![TensorArgDef::host(Some(dtype)); 2],
                attr_defs: Vec::new(),
                output_defs: vec![TensorArgDef::host(Some(dtype))],
                func: structured_add,
            },
        );
    }

    for dtype in [DType::F32, DType::F64] {
        registry.register_legacy("scale", host_key(dtype), legacy_scale_host);
        registry.register_structured(
            "scale",
            unary_structured(
                dtype,
                vec![AttrCType::Scalar, AttrCType::F32, AttrCType::Bool],
                Some(dtype),
                structured_scale,
            ),
        );
    }

    for dtype in ALL_DTYPES {
        registry.register_legacy("cast", host_key(dtype), legacy_cast_host);
        registry.register_structured(
            "cast",
            unary_structured(dtype, vec![AttrCType::DType], None, structured_cast),
        );
        registry.register_structured(
            "reshape",
            unary_structured(dtype, vec![AttrCType::IntArray], None, structured_reshape),
        );
    }
}
