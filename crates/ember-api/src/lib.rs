#![forbid(unsafe_code)]

use std::fmt;
use std::rc::Rc;

use ember_core::{
    AttrValue, AttributeMap, DType, DataLayout, DenseTensor, ExecutionMode, IntArray, KernelKey,
    KernelRegistry, KernelSignature, Place, Variable,
};
use ember_device::DeviceContextPool;
use ember_dispatch::{DispatchError, InferContext, Operator, PreparedOp, prepare_data};
use ember_kernel_cpu::{register_host_kernels, resolve_reshape_dims};
use ember_runtime::{EvidenceEntry, RuntimeContext, TraceError, TraceEvent, TraceMode, encode_trace};
use ember_vars::{DispatchVar, EagerVar, NameVarMap};

#[derive(Debug)]
pub enum ApiError {
    Dispatch(DispatchError),
    Trace(TraceError),
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dispatch(error) => write!(f, "dispatch failed: {error}"),
            Self::Trace(error) => write!(f, "trace codec failed: {error}"),
        }
    }
}

impl std::error::Error for ApiError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Dispatch(error) => Some(error),
            Self::Trace(error) => Some(error),
        }
    }
}

impl From<DispatchError> for ApiError {
    fn from(error: DispatchError) -> Self {
        Self::Dispatch(error)
    }
}

impl From<TraceError> for ApiError {
    fn from(error: TraceError) -> Self {
        Self::Trace(error)
    }
}

// ── built-in operators ──

/// Elementwise addition: Out = X + Y.
#[derive(Debug, Clone, Copy, Default)]
pub struct AddOp;

impl Operator for AddOp {
    fn op_type(&self) -> &str {
        "add"
    }

    fn infer_shape(&self, ctx: &mut InferContext<'_>) -> Result<(), DispatchError> {
        let shape = ctx
            .input("X", 0)
            .ok_or_else(|| DispatchError::MissingInput { arg: "X".to_string(), index: 0 })?
            .shape()
            .to_vec();
        ctx.set_output_shape("Out", 0, shape);
        Ok(())
    }

    fn structured_signature(&self, _ctx: &InferContext<'_>) -> Option<KernelSignature> {
        Some(KernelSignature::new("add", &["X", "Y"], &[], &["Out"]))
    }
}

/// Out = scale * X + bias, or (X + bias) * scale when `bias_after_scale`
/// is false. The factor may arrive through the ScaleTensor input instead
/// of the literal attribute.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScaleOp;

impl Operator for ScaleOp {
    fn op_type(&self) -> &str {
        "scale"
    }

    fn infer_shape(&self, ctx: &mut InferContext<'_>) -> Result<(), DispatchError> {
        let shape = ctx
            .input("X", 0)
            .ok_or_else(|| DispatchError::MissingInput { arg: "X".to_string(), index: 0 })?
            .shape()
            .to_vec();
        ctx.set_output_shape("Out", 0, shape);
        Ok(())
    }

    fn structured_signature(&self, ctx: &InferContext<'_>) -> Option<KernelSignature> {
        let scale_arg = if ctx.has_input("ScaleTensor") { "ScaleTensor" } else { "scale" };
        Some(KernelSignature::new(
            "scale",
            &["X"],
            &[scale_arg, "bias", "bias_after_scale"],
            &["Out"],
        ))
    }

    /// The dispatch dtype comes from X alone, never from the scalar holder.
    fn dispatch_dtype(&self, ctx: &InferContext<'_>) -> Result<DType, DispatchError> {
        ctx.input("X", 0)
            .and_then(DenseTensor::dtype)
            .ok_or_else(|| DispatchError::DTypeUndefined { op_type: ctx.op_type().to_string() })
    }

    fn kernel_key_for_input(
        &self,
        arg: &str,
        tensor: &DenseTensor,
        expected: &KernelKey,
    ) -> KernelKey {
        // The scalar holder stays wherever it lives.
        if arg == "ScaleTensor" {
            tensor.kernel_key().unwrap_or(*expected)
        } else {
            *expected
        }
    }

    fn default_attrs(&self) -> AttributeMap {
        let mut map = AttributeMap::default();
        map.insert("scale".to_string(), AttrValue::F32(1.0));
        map.insert("bias".to_string(), AttrValue::F32(0.0));
        map.insert("bias_after_scale".to_string(), AttrValue::Bool(true));
        map
    }
}

/// Out = X converted to `out_dtype`. Dispatch keys on the input dtype.
#[derive(Debug, Clone, Copy, Default)]
pub struct CastOp;

impl Operator for CastOp {
    fn op_type(&self) -> &str {
        "cast"
    }

    fn infer_shape(&self, ctx: &mut InferContext<'_>) -> Result<(), DispatchError> {
        let shape = ctx
            .input("X", 0)
            .ok_or_else(|| DispatchError::MissingInput { arg: "X".to_string(), index: 0 })?
            .shape()
            .to_vec();
        ctx.set_output_shape("Out", 0, shape);
        Ok(())
    }

    fn structured_signature(&self, _ctx: &InferContext<'_>) -> Option<KernelSignature> {
        Some(KernelSignature::new("cast", &["X"], &["out_dtype"], &["Out"]))
    }
}

/// Out reinterprets X's elements under a new shape. The target shape may
/// arrive as a literal attribute, one shape tensor, or a group of scalar
/// holders.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReshapeOp;

impl Operator for ReshapeOp {
    fn op_type(&self) -> &str {
        "reshape"
    }

    fn infer_shape(&self, ctx: &mut InferContext<'_>) -> Result<(), DispatchError> {
        let src_shape = ctx
            .input("X", 0)
            .ok_or_else(|| DispatchError::MissingInput { arg: "X".to_string(), index: 0 })?
            .shape()
            .to_vec();
        let spec = reshape_spec(ctx)?;
        let dims = resolve_reshape_dims(&spec, &src_shape)?;
        ctx.set_output_shape("Out", 0, dims);
        Ok(())
    }

    fn structured_signature(&self, ctx: &InferContext<'_>) -> Option<KernelSignature> {
        let shape_arg = if ctx.has_input("ShapeTensor") {
            "ShapeTensor"
        } else if ctx.has_input("Shape") {
            "Shape"
        } else {
            "shape"
        };
        Some(KernelSignature::new("reshape", &["X"], &[shape_arg], &["Out"]))
    }

    /// The dispatch dtype comes from X alone, never from a shape holder.
    fn dispatch_dtype(&self, ctx: &InferContext<'_>) -> Result<DType, DispatchError> {
        ctx.input("X", 0)
            .and_then(DenseTensor::dtype)
            .ok_or_else(|| DispatchError::DTypeUndefined { op_type: ctx.op_type().to_string() })
    }

    fn kernel_key_for_input(
        &self,
        arg: &str,
        tensor: &DenseTensor,
        expected: &KernelKey,
    ) -> KernelKey {
        // Shape holders carry metadata and stay wherever they live.
        if arg == "Shape" || arg == "ShapeTensor" {
            tensor.kernel_key().unwrap_or(*expected)
        } else {
            *expected
        }
    }
}

fn reshape_spec(ctx: &InferContext<'_>) -> Result<Vec<i64>, DispatchError> {
    if ctx.has_input("ShapeTensor") {
        let mut holders = Vec::with_capacity(ctx.input_group_len("ShapeTensor"));
        for index in 0..ctx.input_group_len("ShapeTensor") {
            let holder = ctx.input("ShapeTensor", index).ok_or_else(|| {
                DispatchError::MissingInput { arg: "ShapeTensor".to_string(), index }
            })?;
            holders.push(holder);
        }
        Ok(IntArray::from_tensor_list(&holders)?.values().to_vec())
    } else if let Some(holder) = ctx.input("Shape", 0) {
        Ok(IntArray::from_tensor(holder)?.values().to_vec())
    } else {
        match ctx.attr("shape") {
            Some(AttrValue::I64s(values)) => Ok(values.clone()),
            Some(AttrValue::I32s(values)) => Ok(IntArray::from_i32s(values).values().to_vec()),
            _ => Err(DispatchError::AttributeNotFound { name: "shape".to_string() }),
        }
    }
}

// ── session ──

/// One eager execution scope: kernel registry, device pool, mode policy,
/// and the dispatch trace accumulated across operator runs.
#[derive(Debug)]
pub struct EagerSession {
    place: Place,
    registry: KernelRegistry,
    pool: DeviceContextPool,
    runtime: RuntimeContext,
    trace_events: Vec<TraceEvent>,
}

impl EagerSession {
    #[must_use]
    pub fn new(mode: ExecutionMode) -> Self {
        let mut registry = KernelRegistry::new();
        register_host_kernels(&mut registry);
        Self {
            place: Place::Host,
            registry,
            pool: DeviceContextPool::new(),
            runtime: RuntimeContext::new(mode),
            trace_events: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_place(mut self, place: Place) -> Self {
        self.place = place;
        self
    }

    #[must_use]
    pub fn mode(&self) -> ExecutionMode {
        self.runtime.mode()
    }

    pub fn set_mode(&mut self, mode: ExecutionMode) {
        self.runtime.set_mode(mode);
    }

    #[must_use]
    pub fn place(&self) -> Place {
        self.place
    }

    pub fn registry_mut(&mut self) -> &mut KernelRegistry {
        &mut self.registry
    }

    #[must_use]
    pub fn pool(&self) -> &DeviceContextPool {
        &self.pool
    }

    pub fn runtime_mut(&mut self) -> &mut RuntimeContext {
        &mut self.runtime
    }

    #[must_use]
    pub fn evidence(&self) -> &[EvidenceEntry] {
        self.runtime.ledger().entries()
    }

    #[must_use]
    pub fn evidence_len(&self) -> usize {
        self.runtime.ledger().len()
    }

    #[must_use]
    pub fn trace_events(&self) -> &[TraceEvent] {
        &self.trace_events
    }

    /// Dispatches one operator end to end: select the kernel, transform the
    /// inputs, run, and record evidence plus one trace event.
    pub fn run_op(
        &mut self,
        op: &dyn Operator,
        ins: &NameVarMap<EagerVar>,
        outs: &NameVarMap<EagerVar>,
        attrs: &AttributeMap,
    ) -> Result<(), ApiError> {
        let defaults = op.default_attrs();
        let prepared = PreparedOp::prepare(
            op,
            ins,
            attrs,
            &defaults,
            self.place,
            self.runtime.mode(),
            &self.registry,
            &self.pool,
        )?;
        self.runtime.record_prepare(
            prepared.op_type(),
            prepared.kernel_key(),
            prepared.path_name(),
            prepared.fallback_used(),
        );

        let transforms_before = self.pool.transform_count();
        let stores_before = cached_transform_total(ins);
        let shadow = prepare_data(op, ins, &prepared.kernel_key(), &self.pool)?;
        let transforms = self.pool.transform_count() - transforms_before;
        let stores = cached_transform_total(ins) - stores_before;
        let substitutions = shadow.as_ref().map_or(0, |rebound| count_substitutions(ins, rebound));
        let hits = substitutions.saturating_sub(stores);
        self.runtime.record_transforms(prepared.op_type(), transforms);
        self.runtime.record_cache_activity(prepared.op_type(), hits, stores);

        let run_ins = shadow.as_ref().unwrap_or(ins);
        prepared.run(run_ins, outs, attrs, &defaults, &self.pool)?;
        self.runtime.record_run(prepared.op_type(), prepared.kernel_key());

        self.trace_events.push(TraceEvent {
            sequence: self.trace_events.len() as u64,
            op_type: prepared.op_type().to_string(),
            kernel_key: prepared.kernel_key().to_string(),
            path: prepared.path_name().to_string(),
            fallback_used: prepared.fallback_used(),
            transforms,
        });
        Ok(())
    }

    pub fn add(&mut self, x: &EagerVar, y: &EagerVar, out_name: &str) -> Result<EagerVar, ApiError> {
        let out = self.declared_output(out_name);
        let mut ins = single_slot("X", x);
        ins.insert("Y".to_string(), vec![Some(y.clone())]);
        let outs = single_slot("Out", &out);
        self.run_op(&AddOp, &ins, &outs, &AttributeMap::default())?;
        Ok(out)
    }

    pub fn scale(
        &mut self,
        x: &EagerVar,
        scale: f32,
        bias: f32,
        bias_after_scale: bool,
        out_name: &str,
    ) -> Result<EagerVar, ApiError> {
        let out = self.declared_output(out_name);
        let ins = single_slot("X", x);
        let outs = single_slot("Out", &out);
        let mut attrs = AttributeMap::default();
        attrs.insert("scale".to_string(), AttrValue::F32(scale));
        attrs.insert("bias".to_string(), AttrValue::F32(bias));
        attrs.insert("bias_after_scale".to_string(), AttrValue::Bool(bias_after_scale));
        self.run_op(&ScaleOp, &ins, &outs, &attrs)?;
        Ok(out)
    }

    pub fn cast(
        &mut self,
        x: &EagerVar,
        out_dtype: DType,
        out_name: &str,
    ) -> Result<EagerVar, ApiError> {
        let out = self.declared_output(out_name);
        let ins = single_slot("X", x);
        let outs = single_slot("Out", &out);
        let mut attrs = AttributeMap::default();
        attrs.insert("out_dtype".to_string(), AttrValue::DType(out_dtype));
        self.run_op(&CastOp, &ins, &outs, &attrs)?;
        Ok(out)
    }

    pub fn reshape(
        &mut self,
        x: &EagerVar,
        shape: &[i64],
        out_name: &str,
    ) -> Result<EagerVar, ApiError> {
        let out = self.declared_output(out_name);
        let ins = single_slot("X", x);
        let outs = single_slot("Out", &out);
        let mut attrs = AttributeMap::default();
        attrs.insert("shape".to_string(), AttrValue::I64s(shape.to_vec()));
        self.run_op(&ReshapeOp, &ins, &outs, &attrs)?;
        Ok(out)
    }

    /// Encodes the accumulated trace under the session's mode; the export
    /// itself lands in the ledger.
    pub fn export_trace(&mut self) -> Result<String, ApiError> {
        let encoded = encode_trace(&self.trace_events, TraceMode::from(self.runtime.mode()))?;
        self.runtime.record_trace_export(self.trace_events.len(), encoded.len());
        Ok(encoded)
    }

    fn declared_output(&self, name: &str) -> EagerVar {
        EagerVar::new(
            name,
            Variable::Dense(DenseTensor::declared(Vec::new(), DataLayout::Any, self.place)),
        )
    }
}

fn single_slot(name: &str, var: &EagerVar) -> NameVarMap<EagerVar> {
    let mut map = NameVarMap::new();
    map.insert(name.to_string(), vec![Some(var.clone())]);
    map
}

fn cached_transform_total(vars: &NameVarMap<EagerVar>) -> u64 {
    vars.values()
        .flatten()
        .filter_map(Option::as_ref)
        .map(|var| var.wrapper().borrow().cached_transform_count() as u64)
        .sum()
}

fn count_substitutions(original: &NameVarMap<EagerVar>, rebound: &NameVarMap<EagerVar>) -> u64 {
    let mut count = 0;
    for (name, group) in original {
        let Some(rebound_group) = rebound.get(name) else { continue };
        for (slot, rebound_slot) in group.iter().zip(rebound_group) {
            if let (Some(before), Some(after)) = (slot.as_ref(), rebound_slot.as_ref()) {
                if !Rc::ptr_eq(&before.wrapper(), &after.wrapper()) {
                    count += 1;
                }
            }
        }
    }
    count
}
