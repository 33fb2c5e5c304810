#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use ember_core::{
    AttrCType, AttrValue, AttributeMap, CoreError, DType, DataLayout, DenseTensor, ExecContext,
    ExecutionMode, IntArray, KernelAttr, KernelContext, KernelError, KernelKey, KernelRegistry,
    KernelSignature, LegacyKernelFn, Place, Scalar, StructuredKernel, VarKind, is_same_place,
};
use ember_device::{DeviceContext, DeviceContextPool, DeviceError};
use ember_kernel_cpu::{cast_dtype, transpose_layout};
use ember_vars::{DispatchVar, NameVarMap, set_forward_dtype_of_grad_var, tensor_of};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgSection {
    Inputs,
    Outputs,
    Attrs,
}

impl fmt::Display for ArgSection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inputs => f.write_str("inputs"),
            Self::Outputs => f.write_str("outputs"),
            Self::Attrs => f.write_str("attributes"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchError {
    KernelNotFound { op_type: String, key: KernelKey },
    ArgumentCountMismatch { kernel: String, section: ArgSection, names: usize, defs: usize },
    AttributeNotFound { name: String },
    UnsupportedOutputType { arg: String, kind: VarKind },
    UnsupportedAttributeCoercion { arg: String, expected: AttrCType, found: String },
    MissingInputGroup { arg: String },
    MissingInput { arg: String, index: usize },
    UnsupportedInputType { arg: String, kind: VarKind },
    DTypeUndefined { op_type: String },
    Kernel(KernelError),
    Device(DeviceError),
    Core(CoreError),
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::KernelNotFound { op_type, key } => {
                write!(f, "operator '{op_type}' has no kernel for {key}")
            }
            Self::ArgumentCountMismatch { kernel, section, names, defs } => write!(
                f,
                "kernel '{kernel}' {section} arity mismatch: signature names {names}, kernel defines {defs}"
            ),
            Self::AttributeNotFound { name } => write!(f, "attribute '{name}' not found"),
            Self::UnsupportedOutputType { arg, kind } => {
                write!(f, "output '{arg}' holds unsupported variable kind {kind}")
            }
            Self::UnsupportedAttributeCoercion { arg, expected, found } => write!(
                f,
                "attribute '{arg}' cannot coerce {found} into {expected}"
            ),
            Self::MissingInputGroup { arg } => write!(f, "input group '{arg}' is absent"),
            Self::MissingInput { arg, index } => {
                write!(f, "input '{arg}' slot {index} holds no variable")
            }
            Self::UnsupportedInputType { arg, kind } => {
                write!(f, "input '{arg}' holds unsupported variable kind {kind}")
            }
            Self::DTypeUndefined { op_type } => write!(
                f,
                "operator '{op_type}' has no initialized input to take a dispatch dtype from"
            ),
            Self::Kernel(error) => write!(f, "kernel failure: {error}"),
            Self::Device(error) => write!(f, "device failure: {error}"),
            Self::Core(error) => write!(f, "core failure: {error}"),
        }
    }
}

impl std::error::Error for DispatchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Kernel(error) => Some(error),
            Self::Device(error) => Some(error),
            Self::Core(error) => Some(error),
            _ => None,
        }
    }
}

impl From<KernelError> for DispatchError {
    fn from(error: KernelError) -> Self {
        Self::Kernel(error)
    }
}

impl From<DeviceError> for DispatchError {
    fn from(error: DeviceError) -> Self {
        Self::Device(error)
    }
}

impl From<CoreError> for DispatchError {
    fn from(error: CoreError) -> Self {
        Self::Core(error)
    }
}

/// Runtime attribute first, operator default second.
#[must_use]
pub fn lookup_attr<'a>(
    attrs: &'a AttributeMap,
    defaults: &'a AttributeMap,
    name: &str,
) -> Option<&'a AttrValue> {
    attrs.get(name).or_else(|| defaults.get(name))
}

pub fn get_attr<'a>(
    attrs: &'a AttributeMap,
    defaults: &'a AttributeMap,
    name: &str,
) -> Result<&'a AttrValue, DispatchError> {
    lookup_attr(attrs, defaults, name)
        .ok_or_else(|| DispatchError::AttributeNotFound { name: name.to_string() })
}

type InputSnapshots = BTreeMap<String, Vec<Option<DenseTensor>>>;

fn snapshot_inputs<V: DispatchVar>(ins: &NameVarMap<V>) -> InputSnapshots {
    ins.iter()
        .map(|(name, group)| {
            let tensors = group
                .iter()
                .map(|slot| slot.as_ref().and_then(|var| tensor_of(var)))
                .collect();
            (name.clone(), tensors)
        })
        .collect()
}

/// Read-only view operators see while inferring dispatch dtype, choosing a
/// structured signature, and computing output shapes. Inputs are payload
/// snapshots, so an operator cannot reach back into live wrappers from here.
pub struct InferContext<'a> {
    op_type: &'a str,
    inputs: &'a InputSnapshots,
    attrs: &'a AttributeMap,
    default_attrs: &'a AttributeMap,
    output_shapes: BTreeMap<String, BTreeMap<usize, Vec<usize>>>,
}

impl<'a> InferContext<'a> {
    #[must_use]
    pub fn new(
        op_type: &'a str,
        inputs: &'a InputSnapshots,
        attrs: &'a AttributeMap,
        default_attrs: &'a AttributeMap,
    ) -> Self {
        Self { op_type, inputs, attrs, default_attrs, output_shapes: BTreeMap::new() }
    }

    #[must_use]
    pub fn op_type(&self) -> &str {
        self.op_type
    }

    #[must_use]
    pub fn input(&self, name: &str, index: usize) -> Option<&DenseTensor> {
        self.inputs.get(name)?.get(index)?.as_ref()
    }

    #[must_use]
    pub fn has_input(&self, name: &str) -> bool {
        self.inputs
            .get(name)
            .is_some_and(|group| group.iter().any(Option::is_some))
    }

    #[must_use]
    pub fn input_group_len(&self, name: &str) -> usize {
        self.inputs.get(name).map_or(0, Vec::len)
    }

    #[must_use]
    pub fn attr(&self, name: &str) -> Option<&AttrValue> {
        lookup_attr(self.attrs, self.default_attrs, name)
    }

    /// Groups iterate in name order, so this is deterministic.
    #[must_use]
    pub fn first_initialized_dtype(&self) -> Option<DType> {
        self.inputs
            .values()
            .flatten()
            .filter_map(Option::as_ref)
            .find_map(DenseTensor::dtype)
    }

    pub fn set_output_shape(&mut self, name: &str, index: usize, shape: Vec<usize>) {
        self.output_shapes
            .entry(name.to_string())
            .or_default()
            .insert(index, shape);
    }

    #[must_use]
    pub fn output_shapes(&self) -> &BTreeMap<String, BTreeMap<usize, Vec<usize>>> {
        &self.output_shapes
    }
}

/// One eager operator. The defaults cover the common case; an operator
/// overrides exactly the hooks whose behavior it owns.
pub trait Operator {
    fn op_type(&self) -> &str;

    fn infer_shape(&self, ctx: &mut InferContext<'_>) -> Result<(), DispatchError>;

    /// Structured-kernel signature for the current inputs, or `None` to stay
    /// on the legacy path. Attr name lists may name input groups; those
    /// slots are then fed from tensors.
    fn structured_signature(&self, _ctx: &InferContext<'_>) -> Option<KernelSignature> {
        None
    }

    fn dispatch_dtype(&self, ctx: &InferContext<'_>) -> Result<DType, DispatchError> {
        ctx.first_initialized_dtype()
            .ok_or_else(|| DispatchError::DTypeUndefined { op_type: ctx.op_type().to_string() })
    }

    /// Authoritative transform target for one input slot. The default keeps
    /// the selected key; an override pins the slot elsewhere, and no
    /// transform happens once the tensor already satisfies the returned key.
    fn kernel_key_for_input(
        &self,
        _arg: &str,
        _tensor: &DenseTensor,
        expected: &KernelKey,
    ) -> KernelKey {
        *expected
    }

    fn preferred_layout(&self) -> DataLayout {
        DataLayout::Any
    }

    fn default_attrs(&self) -> AttributeMap {
        AttributeMap::default()
    }
}

/// Rewrites `tensor` to satisfy `target`, applying layout, then dtype, then
/// place steps. Counts as one transform however many steps fire.
pub fn transform_data(
    name: &str,
    tensor: &DenseTensor,
    actual: &KernelKey,
    target: &KernelKey,
    pool: &DeviceContextPool,
) -> Result<DenseTensor, DispatchError> {
    let mut out = tensor.clone();
    if actual.needs_layout_transform(target) {
        out = transpose_layout(name, &out, target.layout)?;
    }
    if actual.needs_dtype_transform(target) {
        out = cast_dtype(name, &out, target.dtype)?;
    }
    if actual.needs_place_transform(target) {
        out = pool.copy_tensor_sync(name, &out, target.place)?;
    }
    pool.note_transform();
    Ok(out)
}

fn substitute<V: DispatchVar>(
    shadow: &mut Option<NameVarMap<V>>,
    ins: &NameVarMap<V>,
    name: &str,
    index: usize,
    replacement: V,
) {
    let map = shadow.get_or_insert_with(|| ins.clone());
    if let Some(slot) = map.get_mut(name).and_then(|group| group.get_mut(index)) {
        *slot = Some(replacement);
    }
}

/// Walks every input slot, propagates each variable's dtype onto its
/// gradient wrapper, and brings the tensor onto the operator's per-slot
/// target key.
///
/// A dtype-changing transform never touches the caller's variable: the
/// result lands in a fresh variable, is cached on the source wrapper under
/// the target key, and the returned shadow map carries the substitution. A
/// layout- or place-only transform is written back in place and leaves no
/// cache entry. Returns `None` when no slot was substituted.
pub fn prepare_data<V: DispatchVar>(
    op: &dyn Operator,
    ins: &NameVarMap<V>,
    expected: &KernelKey,
    pool: &DeviceContextPool,
) -> Result<Option<NameVarMap<V>>, DispatchError> {
    let mut shadow: Option<NameVarMap<V>> = None;

    for (name, group) in ins {
        for (index, slot) in group.iter().enumerate() {
            let Some(var) = slot else { continue };
            set_forward_dtype_of_grad_var(var);
            let Some(tensor) = tensor_of(var) else { continue };
            if !tensor.is_initialized() {
                continue;
            }
            let Some(actual) = tensor.kernel_key() else { continue };
            let target = op.kernel_key_for_input(name, &tensor, expected);
            if !actual.needs_transform(&target) {
                continue;
            }

            let wrapper = var.wrapper();
            let cached = wrapper.borrow().cached_transform(&target);
            if let Some(hit) = cached {
                let variable = hit.borrow().var().clone();
                let replacement = V::materialize(&var.name(), variable);
                substitute(&mut shadow, ins, name, index, replacement);
                continue;
            }

            let transformed = transform_data(&var.name(), &tensor, &actual, &target, pool)?;
            if actual.needs_dtype_transform(&target) {
                let variable = var.with_variable(|v| v.with_tensor_like(transformed))?;
                let replacement = V::materialize(&var.name(), variable);
                wrapper.borrow_mut().store_transform(target, replacement.wrapper());
                substitute(&mut shadow, ins, name, index, replacement);
            } else {
                var.with_variable_mut(|v| v.set_tensor(transformed))?;
            }
        }
    }

    Ok(shadow)
}

#[derive(Debug, Clone)]
pub enum KernelExec {
    Legacy(LegacyKernelFn),
    Structured { signature: KernelSignature, kernel: StructuredKernel },
}

fn key_candidates(expected: KernelKey) -> Vec<KernelKey> {
    let mut candidates = vec![expected];
    if expected.layout != DataLayout::Any {
        candidates.push(expected.with_layout(DataLayout::Any));
    }
    candidates
}

fn find_structured_candidate(
    registry: &KernelRegistry,
    name: &str,
    expected: KernelKey,
) -> Option<(KernelKey, StructuredKernel)> {
    key_candidates(expected)
        .into_iter()
        .find_map(|key| registry.find_structured(name, &key).map(|k| (key, k.clone())))
}

fn find_legacy_candidate(
    registry: &KernelRegistry,
    op_type: &str,
    expected: KernelKey,
) -> Option<(KernelKey, LegacyKernelFn)> {
    key_candidates(expected)
        .into_iter()
        .find_map(|key| registry.find_legacy(op_type, &key).map(|f| (key, f)))
}

/// An operator bound to one selected kernel and its device context.
pub struct PreparedOp<'a> {
    op: &'a dyn Operator,
    key: KernelKey,
    exec: KernelExec,
    dev_ctx: Rc<DeviceContext>,
    fallback_used: bool,
}

impl fmt::Debug for PreparedOp<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreparedOp")
            .field("op_type", &self.op.op_type())
            .field("key", &self.key)
            .field("exec", &self.exec)
            .field("dev_ctx", &self.dev_ctx)
            .field("fallback_used", &self.fallback_used)
            .finish()
    }
}

impl<'a> PreparedOp<'a> {
    /// Selects a kernel for `op` on `place`. Structured kernels win over
    /// legacy ones when the operator publishes a signature and the registry
    /// knows the name. A concrete preferred layout relaxes to `Any` before
    /// a candidate is rejected. In Hardened mode a missing device kernel
    /// retries on the host; Strict reports the expected key and stops.
    pub fn prepare<V: DispatchVar>(
        op: &'a dyn Operator,
        ins: &NameVarMap<V>,
        attrs: &AttributeMap,
        default_attrs: &AttributeMap,
        place: Place,
        mode: ExecutionMode,
        registry: &KernelRegistry,
        pool: &DeviceContextPool,
    ) -> Result<Self, DispatchError> {
        let snapshots = snapshot_inputs(ins);
        let infer_ctx = InferContext::new(op.op_type(), &snapshots, attrs, default_attrs);
        let dtype = op.dispatch_dtype(&infer_ctx)?;
        let expected = KernelKey::new(place, op.preferred_layout(), dtype);

        let signature = op
            .structured_signature(&infer_ctx)
            .filter(|sig| registry.has_structured(&sig.name));

        if let Some(signature) = &signature {
            if let Some((key, kernel)) = find_structured_candidate(registry, &signature.name, expected)
            {
                return Ok(Self::bound(
                    op,
                    key,
                    KernelExec::Structured { signature: signature.clone(), kernel },
                    pool,
                    false,
                ));
            }
        }

        if let Some((key, func)) = find_legacy_candidate(registry, op.op_type(), expected) {
            return Ok(Self::bound(op, key, KernelExec::Legacy(func), pool, false));
        }

        if mode == ExecutionMode::Hardened && !expected.place.is_host() {
            let host = expected.host_fallback();
            if let Some(signature) = &signature {
                if let Some((key, kernel)) = find_structured_candidate(registry, &signature.name, host)
                {
                    return Ok(Self::bound(
                        op,
                        key,
                        KernelExec::Structured { signature: signature.clone(), kernel },
                        pool,
                        true,
                    ));
                }
            }
            if let Some((key, func)) = find_legacy_candidate(registry, op.op_type(), host) {
                return Ok(Self::bound(op, key, KernelExec::Legacy(func), pool, true));
            }
        }

        Err(DispatchError::KernelNotFound { op_type: op.op_type().to_string(), key: expected })
    }

    fn bound(
        op: &'a dyn Operator,
        key: KernelKey,
        exec: KernelExec,
        pool: &DeviceContextPool,
        fallback_used: bool,
    ) -> Self {
        let dev_ctx = pool.get(key.place);
        Self { op, key, exec, dev_ctx, fallback_used }
    }

    #[must_use]
    pub fn kernel_key(&self) -> KernelKey {
        self.key
    }

    #[must_use]
    pub fn fallback_used(&self) -> bool {
        self.fallback_used
    }

    #[must_use]
    pub fn is_structured(&self) -> bool {
        matches!(self.exec, KernelExec::Structured { .. })
    }

    #[must_use]
    pub fn path_name(&self) -> &'static str {
        match self.exec {
            KernelExec::Legacy(_) => "legacy",
            KernelExec::Structured { .. } => "structured",
        }
    }

    #[must_use]
    pub fn op_type(&self) -> &str {
        self.op.op_type()
    }

    #[must_use]
    pub fn device_context(&self) -> &Rc<DeviceContext> {
        &self.dev_ctx
    }

    /// Runs shape inference, then the selected kernel. Structured execution
    /// first aligns input places exactly, builds the flat kernel context,
    /// and commits produced outputs back into the output variables.
    pub fn run<V: DispatchVar>(
        &self,
        ins: &NameVarMap<V>,
        outs: &NameVarMap<V>,
        attrs: &AttributeMap,
        default_attrs: &AttributeMap,
        pool: &DeviceContextPool,
    ) -> Result<(), DispatchError> {
        let snapshots = snapshot_inputs(ins);
        let mut infer_ctx = InferContext::new(self.op.op_type(), &snapshots, attrs, default_attrs);
        self.op.infer_shape(&mut infer_ctx)?;
        apply_output_shapes(&infer_ctx, outs)?;

        match &self.exec {
            KernelExec::Legacy(func) => {
                let ctx = DygraphExecContext::new(
                    self.op.op_type(),
                    self.dev_ctx.place(),
                    ins,
                    outs,
                    attrs,
                    default_attrs,
                );
                func(&ctx)?;
                Ok(())
            }
            KernelExec::Structured { signature, kernel } => {
                prepare_structured_data(signature, kernel, ins, pool)?;
                let mut kctx =
                    build_kernel_context(signature, kernel, ins, outs, attrs, default_attrs, self.key.place)?;
                (kernel.func)(&mut kctx)?;
                commit_structured_outputs(signature, &mut kctx, outs)
            }
        }
    }
}

fn apply_output_shapes<V: DispatchVar>(
    ctx: &InferContext<'_>,
    outs: &NameVarMap<V>,
) -> Result<(), DispatchError> {
    for (name, slots) in ctx.output_shapes() {
        let Some(group) = outs.get(name) else { continue };
        for (index, shape) in slots {
            let Some(Some(var)) = group.get(*index) else { continue };
            var.with_variable_mut(|v| match v.tensor_mut() {
                Some(tensor) => tensor.resize(shape.clone()),
                None => Ok(()),
            })?;
        }
    }
    Ok(())
}

/// Exact-place alignment for structured kernels: any initialized input whose
/// place is not byte-for-byte the def place is copied over and written back
/// in place. Distinct CUDA ordinals do not get a pass here.
pub fn prepare_structured_data<V: DispatchVar>(
    signature: &KernelSignature,
    kernel: &StructuredKernel,
    ins: &NameVarMap<V>,
    pool: &DeviceContextPool,
) -> Result<(), DispatchError> {
    for (arg_index, input_name) in signature.inputs.iter().enumerate() {
        let Some(def) = kernel.input_defs.get(arg_index) else { continue };
        let Some(group) = ins.get(input_name) else { continue };
        for slot in group.iter().flatten() {
            let Some(tensor) = tensor_of(slot) else { continue };
            if !tensor.is_initialized() || is_same_place(tensor.place(), def.place) {
                continue;
            }
            let copied = pool.copy_tensor_sync(&slot.name(), &tensor, def.place)?;
            slot.with_variable_mut(|v| v.set_tensor(copied))?;
        }
    }
    Ok(())
}

fn ensure_arity(
    kernel_name: &str,
    section: ArgSection,
    names: usize,
    defs: usize,
) -> Result<(), DispatchError> {
    if names != defs {
        return Err(DispatchError::ArgumentCountMismatch {
            kernel: kernel_name.to_string(),
            section,
            names,
            defs,
        });
    }
    Ok(())
}

fn coerce_literal_attr(
    arg: &str,
    ctype: AttrCType,
    value: &AttrValue,
) -> Result<KernelAttr, DispatchError> {
    let unsupported = || DispatchError::UnsupportedAttributeCoercion {
        arg: arg.to_string(),
        expected: ctype,
        found: value.kind_str().to_string(),
    };
    match ctype {
        AttrCType::Scalar => match value {
            AttrValue::Bool(v) => Ok(KernelAttr::Scalar(Scalar::Bool(*v))),
            AttrValue::I32(v) => Ok(KernelAttr::Scalar(Scalar::I32(*v))),
            AttrValue::I64(v) => Ok(KernelAttr::Scalar(Scalar::I64(*v))),
            AttrValue::F32(v) => Ok(KernelAttr::Scalar(Scalar::F32(*v))),
            AttrValue::Str(v) => Ok(KernelAttr::Scalar(Scalar::Str(v.clone()))),
            _ => Err(unsupported()),
        },
        AttrCType::IntArray => match value {
            AttrValue::I64s(v) => Ok(KernelAttr::IntArray(IntArray::new(v.clone()))),
            AttrValue::I32s(v) => Ok(KernelAttr::IntArray(IntArray::from_i32s(v))),
            _ => Err(unsupported()),
        },
        AttrCType::I32 => match value {
            AttrValue::I32(v) => Ok(KernelAttr::I32(*v)),
            _ => Err(unsupported()),
        },
        AttrCType::F32 => match value {
            AttrValue::F32(v) => Ok(KernelAttr::F32(*v)),
            _ => Err(unsupported()),
        },
        AttrCType::Bool => match value {
            AttrValue::Bool(v) => Ok(KernelAttr::Bool(*v)),
            _ => Err(unsupported()),
        },
        AttrCType::DType => match value {
            AttrValue::DType(v) => Ok(KernelAttr::DType(*v)),
            AttrValue::I32(code) => Ok(KernelAttr::DType(DType::from_code(*code)?)),
            AttrValue::I64(code) => Ok(KernelAttr::DType(DType::from_code(*code as i32)?)),
            _ => Err(unsupported()),
        },
        AttrCType::I64s => match value {
            AttrValue::I64s(v) => Ok(KernelAttr::I64s(v.clone())),
            AttrValue::I32s(v) => Ok(KernelAttr::I64s(v.iter().map(|x| i64::from(*x)).collect())),
            _ => Err(unsupported()),
        },
    }
}

fn coerce_tensor_attr<V: DispatchVar>(
    arg: &str,
    ctype: AttrCType,
    group: &[Option<V>],
) -> Result<KernelAttr, DispatchError> {
    let slot_tensor = |index: usize| -> Result<DenseTensor, DispatchError> {
        let var = group
            .get(index)
            .and_then(Option::as_ref)
            .ok_or_else(|| DispatchError::MissingInput { arg: arg.to_string(), index })?;
        tensor_of(var).ok_or_else(|| DispatchError::UnsupportedInputType {
            arg: arg.to_string(),
            kind: var.kind(),
        })
    };
    match ctype {
        AttrCType::Scalar => {
            let tensor = slot_tensor(0)?;
            Ok(KernelAttr::Scalar(Scalar::from_tensor(&tensor)?))
        }
        AttrCType::IntArray => {
            if group.len() == 1 {
                let tensor = slot_tensor(0)?;
                Ok(KernelAttr::IntArray(IntArray::from_tensor(&tensor)?))
            } else {
                let mut tensors = Vec::with_capacity(group.len());
                for index in 0..group.len() {
                    tensors.push(slot_tensor(index)?);
                }
                let borrowed: Vec<&DenseTensor> = tensors.iter().collect();
                Ok(KernelAttr::IntArray(IntArray::from_tensor_list(&borrowed)?))
            }
        }
        other => Err(DispatchError::UnsupportedAttributeCoercion {
            arg: arg.to_string(),
            expected: other,
            found: "tensor input".to_string(),
        }),
    }
}

/// Assembles the flat kernel context for one structured invocation.
///
/// Arity between the signature's name lists and the kernel's defs is checked
/// for all three sections before any buffer fills. Input groups flatten in
/// signature order with cumulative ranges; an absent output name contributes
/// one empty slot of width one; output slots are re-tagged onto the def
/// place and, when the def fixes a dtype, given a fresh zeroed buffer.
/// Scalar and int-array attributes read the literal maps first and fall
/// back to a same-named input group; every other attribute type is
/// literal only.
pub fn build_kernel_context<V: DispatchVar>(
    signature: &KernelSignature,
    kernel: &StructuredKernel,
    ins: &NameVarMap<V>,
    outs: &NameVarMap<V>,
    attrs: &AttributeMap,
    default_attrs: &AttributeMap,
    place: Place,
) -> Result<KernelContext, DispatchError> {
    ensure_arity(&signature.name, ArgSection::Inputs, signature.inputs.len(), kernel.input_defs.len())?;
    ensure_arity(
        &signature.name,
        ArgSection::Outputs,
        signature.outputs.len(),
        kernel.output_defs.len(),
    )?;
    ensure_arity(&signature.name, ArgSection::Attrs, signature.attrs.len(), kernel.attr_defs.len())?;

    let mut ctx = KernelContext::for_place(place);

    for name in &signature.inputs {
        let group = ins
            .get(name)
            .ok_or_else(|| DispatchError::MissingInputGroup { arg: name.clone() })?;
        let start = ctx.input_count();
        for (index, slot) in group.iter().enumerate() {
            let var = slot
                .as_ref()
                .ok_or_else(|| DispatchError::MissingInput { arg: name.clone(), index })?;
            let tensor = tensor_of(var).ok_or_else(|| DispatchError::UnsupportedInputType {
                arg: name.clone(),
                kind: var.kind(),
            })?;
            ctx.push_input(Some(tensor));
        }
        ctx.push_input_range(start, ctx.input_count());
    }

    for (arg_index, name) in signature.outputs.iter().enumerate() {
        let def = kernel.output_defs[arg_index];
        let start = ctx.output_count();
        let Some(group) = outs.get(name) else {
            // Unreachable output: one empty slot keeps downstream indices stable.
            ctx.push_output(None);
            ctx.push_output_range(start, start + 1);
            continue;
        };
        for slot in group {
            match slot {
                None => ctx.push_output(None),
                Some(var) => {
                    let tensor = var.with_variable(|v| v.tensor().cloned()).ok_or_else(|| {
                        DispatchError::UnsupportedOutputType { arg: name.clone(), kind: var.kind() }
                    })?;
                    let mut prepared = tensor;
                    prepared.set_place(def.place);
                    if def.layout != DataLayout::Any {
                        prepared.set_layout(def.layout);
                    }
                    if let Some(dtype) = def.dtype {
                        prepared.alloc_zeroed(dtype);
                    }
                    ctx.push_output(Some(prepared));
                }
            }
        }
        ctx.push_output_range(start, ctx.output_count());
    }

    for (arg_index, name) in signature.attrs.iter().enumerate() {
        let ctype = kernel.attr_defs[arg_index];
        let attr = match ctype {
            AttrCType::Scalar | AttrCType::IntArray => {
                match lookup_attr(attrs, default_attrs, name) {
                    Some(value) => coerce_literal_attr(name, ctype, value)?,
                    None => {
                        let group = ins
                            .get(name)
                            .ok_or_else(|| DispatchError::AttributeNotFound { name: name.clone() })?;
                        coerce_tensor_attr(name, ctype, group)?
                    }
                }
            }
            _ => {
                let value = get_attr(attrs, default_attrs, name)?;
                coerce_literal_attr(name, ctype, value)?
            }
        };
        ctx.push_attr(attr);
    }

    Ok(ctx)
}

fn commit_structured_outputs<V: DispatchVar>(
    signature: &KernelSignature,
    kctx: &mut KernelContext,
    outs: &NameVarMap<V>,
) -> Result<(), DispatchError> {
    let produced = kctx.take_outputs();
    for (arg_index, name) in signature.outputs.iter().enumerate() {
        let Some((start, end)) = kctx.output_range(arg_index) else { continue };
        let Some(group) = outs.get(name) else { continue };
        for (offset, slot) in group.iter().enumerate() {
            let flat = start + offset;
            if flat >= end {
                break;
            }
            let Some(var) = slot else { continue };
            let Some(tensor) = produced.get(flat).cloned().flatten() else { continue };
            var.with_variable_mut(|v| v.set_tensor(tensor))?;
        }
    }
    Ok(())
}

/// `ExecContext` over live variable maps for legacy kernels.
pub struct DygraphExecContext<'a, V: DispatchVar> {
    op_type: &'a str,
    place: Place,
    ins: &'a NameVarMap<V>,
    outs: &'a NameVarMap<V>,
    attrs: &'a AttributeMap,
    default_attrs: &'a AttributeMap,
}

impl<'a, V: DispatchVar> DygraphExecContext<'a, V> {
    #[must_use]
    pub fn new(
        op_type: &'a str,
        place: Place,
        ins: &'a NameVarMap<V>,
        outs: &'a NameVarMap<V>,
        attrs: &'a AttributeMap,
        default_attrs: &'a AttributeMap,
    ) -> Self {
        Self { op_type, place, ins, outs, attrs, default_attrs }
    }
}

impl<V: DispatchVar> ExecContext for DygraphExecContext<'_, V> {
    fn op_type(&self) -> &str {
        self.op_type
    }

    fn place(&self) -> Place {
        self.place
    }

    fn input_len(&self, name: &str) -> usize {
        self.ins.get(name).map_or(0, Vec::len)
    }

    fn input_tensor(&self, name: &str, index: usize) -> Option<DenseTensor> {
        self.ins
            .get(name)?
            .get(index)?
            .as_ref()
            .and_then(|var| tensor_of(var))
    }

    fn set_output_tensor(
        &self,
        name: &str,
        index: usize,
        tensor: DenseTensor,
    ) -> Result<(), KernelError> {
        let var = self
            .outs
            .get(name)
            .and_then(|group| group.get(index))
            .and_then(Option::as_ref)
            .ok_or_else(|| KernelError::MissingOutput { name: name.to_string() })?;
        var.with_variable_mut(|v| v.set_tensor(tensor))
            .map_err(KernelError::from)
    }

    fn attr(&self, name: &str) -> Option<AttrValue> {
        lookup_attr(self.attrs, self.default_attrs, name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use ember_core::Storage;
    use ember_kernel_cpu::register_host_kernels;
    use ember_vars::EagerVar;
    use proptest::prelude::*;

    use super::*;

    fn host_f32(values: Vec<f32>, shape: Vec<usize>) -> DenseTensor {
        DenseTensor::from_f32(values, shape, Place::Host).expect("tensor should build")
    }

    fn var_of(name: &str, tensor: DenseTensor) -> EagerVar {
        EagerVar::from_tensor(name, tensor)
    }

    fn single(name: &str, var: EagerVar) -> NameVarMap<EagerVar> {
        let mut map = NameVarMap::new();
        map.insert(name.to_string(), vec![Some(var)]);
        map
    }

    fn host_registry() -> KernelRegistry {
        let mut registry = KernelRegistry::new();
        register_host_kernels(&mut registry);
        registry
    }

    struct AddOp {
        structured: bool,
    }

    impl Operator for AddOp {
        fn op_type(&self) -> &str {
            "add"
        }

        fn infer_shape(&self, ctx: &mut InferContext<'_>) -> Result<(), DispatchError> {
            if let Some(x) = ctx.input("X", 0) {
                let shape = x.shape().to_vec();
                ctx.set_output_shape("Out", 0, shape);
            }
            Ok(())
        }

        fn structured_signature(&self, _ctx: &InferContext<'_>) -> Option<KernelSignature> {
            self.structured
                .then(|| KernelSignature::new("add", &["X", "Y"], &[], &["Out"]))
        }
    }

    struct ScaleOp;

    impl Operator for ScaleOp {
        fn op_type(&self) -> &str {
            "scale"
        }

        fn infer_shape(&self, ctx: &mut InferContext<'_>) -> Result<(), DispatchError> {
            if let Some(x) = ctx.input("X", 0) {
                let shape = x.shape().to_vec();
                ctx.set_output_shape("Out", 0, shape);
            }
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

    fn host_key(dtype: DType) -> KernelKey {
        KernelKey::new(Place::Host, DataLayout::Any, dtype)
    }

    // ── transform engine ──

    #[test]
    fn dtype_transform_substitutes_without_touching_the_original() {
        let op = AddOp { structured: false };
        let pool = DeviceContextPool::new();
        let x = var_of("x", host_f32(vec![1.0, 2.0], vec![2]));
        let ins = single("X", x.clone());

        let shadow = prepare_data(&op, &ins, &host_key(DType::F64), &pool)
            .expect("transform should succeed")
            .expect("a dtype change must produce a shadow map");

        let original = x.tensor().expect("payload present");
        assert_eq!(original.dtype(), Some(DType::F32));

        let substituted = shadow["X"][0].as_ref().expect("slot substituted");
        let replaced = substituted.tensor().expect("payload present");
        assert_eq!(replaced.dtype(), Some(DType::F64));
        assert_eq!(replaced.to_f64_vec().expect("initialized"), vec![1.0, 2.0]);
        assert_ne!(substituted.id(), x.id());

        let wrapper = x.wrapper();
        assert!(wrapper.borrow().has_cached_transform(&host_key(DType::F64)));
        assert_eq!(pool.transform_count(), 1);
    }

    #[test]
    fn second_dispatch_hits_the_wrapper_cache() {
        let op = AddOp { structured: false };
        let pool = DeviceContextPool::new();
        let x = var_of("x", host_f32(vec![1.0, 2.0], vec![2]));
        let ins = single("X", x.clone());
        let target = host_key(DType::F64);

        let first = prepare_data(&op, &ins, &target, &pool)
            .expect("transform should succeed")
            .expect("shadow expected");
        assert_eq!(pool.transform_count(), 1);

        let second = prepare_data(&op, &ins, &target, &pool)
            .expect("cache hit should succeed")
            .expect("shadow expected");
        assert_eq!(pool.transform_count(), 1);

        let first_var = first["X"][0].as_ref().expect("slot");
        let second_var = second["X"][0].as_ref().expect("slot");
        // Each hit materializes a fresh handle over the cached payload.
        assert_ne!(first_var.id(), second_var.id());
        assert_eq!(
            second_var.tensor().expect("payload").to_f64_vec().expect("initialized"),
            vec![1.0, 2.0]
        );
    }

    #[test]
    fn layout_only_transform_writes_back_in_place() {
        let op = AddOp { structured: false };
        let pool = DeviceContextPool::new();
        let mut tensor = host_f32(vec![0.0, 1.0, 2.0, 3.0], vec![1, 2, 1, 2]);
        tensor.set_layout(DataLayout::Nchw);
        let x = var_of("x", tensor);
        let ins = single("X", x.clone());

        let target = KernelKey::new(Place::Host, DataLayout::Nhwc, DType::F32);
        let shadow = prepare_data(&op, &ins, &target, &pool).expect("transform should succeed");
        assert!(shadow.is_none());

        let written = x.tensor().expect("payload present");
        assert_eq!(written.layout(), DataLayout::Nhwc);
        assert_eq!(written.to_f64_vec().expect("initialized"), vec![0.0, 2.0, 1.0, 3.0]);
        assert_eq!(pool.transform_count(), 1);
        assert_eq!(x.wrapper().borrow().cached_transform_count(), 0);
    }

    #[test]
    fn place_only_transform_writes_back_in_place() {
        let op = AddOp { structured: false };
        let pool = DeviceContextPool::new();
        let x = var_of("x", host_f32(vec![1.0], vec![1]));
        let ins = single("X", x.clone());

        let target = KernelKey::new(Place::Cuda(0), DataLayout::Any, DType::F32);
        let shadow = prepare_data(&op, &ins, &target, &pool).expect("transform should succeed");
        assert!(shadow.is_none());
        assert_eq!(x.tensor().expect("payload").place(), Place::Cuda(0));
        assert_eq!(pool.copy_count(), 1);
        assert_eq!(pool.transform_count(), 1);
    }

    #[test]
    fn grad_dtype_propagates_even_without_a_transform() {
        let op = AddOp { structured: false };
        let pool = DeviceContextPool::new();
        let x = var_of("x", host_f32(vec![1.0], vec![1]));
        let grad = var_of("x@grad", host_f32(vec![0.0], vec![1]));
        x.set_grad(&grad);
        let ins = single("X", x.clone());

        let shadow =
            prepare_data(&op, &ins, &host_key(DType::F32), &pool).expect("prepare should succeed");
        assert!(shadow.is_none());
        assert_eq!(grad.wrapper().borrow().forward_dtype(), Some(DType::F32));
    }

    #[test]
    fn per_slot_override_pins_an_input_in_place() {
        let op = ScaleOp;
        let pool = DeviceContextPool::new();
        let x = var_of("x", host_f32(vec![1.0, 2.0], vec![2]));
        let holder = var_of("scale_holder", host_f32(vec![3.0], vec![1]));
        let mut ins = single("X", x.clone());
        ins.insert("ScaleTensor".to_string(), vec![Some(holder.clone())]);

        let expected = KernelKey::new(Place::Cuda(0), DataLayout::Any, DType::F32);
        let shadow = prepare_data(&op, &ins, &expected, &pool).expect("transform should succeed");
        assert!(shadow.is_none());

        // X followed the expected key; the pinned holder did not move.
        assert_eq!(x.tensor().expect("payload").place(), Place::Cuda(0));
        assert_eq!(holder.tensor().expect("payload").place(), Place::Host);
        assert_eq!(pool.transform_count(), 1);
    }

    #[test]
    fn unusable_slots_are_skipped() {
        let op = AddOp { structured: false };
        let pool = DeviceContextPool::new();
        let declared = EagerVar::from_tensor(
            "declared",
            DenseTensor::declared(vec![2], DataLayout::Any, Place::Host),
        );
        let strings = EagerVar::new("s", ember_core::Variable::Strings(vec!["a".to_string()]));
        let mut ins: NameVarMap<EagerVar> = NameVarMap::new();
        ins.insert("X".to_string(), vec![Some(declared), None]);
        ins.insert("S".to_string(), vec![Some(strings)]);

        let shadow = prepare_data(&op, &ins, &host_key(DType::F64), &pool)
            .expect("skips should not error");
        assert!(shadow.is_none());
        assert_eq!(pool.transform_count(), 0);
    }

    // ── selection ──

    #[test]
    fn structured_signature_wins_over_legacy() {
        let registry = host_registry();
        let pool = DeviceContextPool::new();
        let op = AddOp { structured: true };
        let ins = single("X", var_of("x", host_f32(vec![1.0], vec![1])));
        let attrs = AttributeMap::default();

        let prepared = PreparedOp::prepare(
            &op,
            &ins,
            &attrs,
            &attrs,
            Place::Host,
            ExecutionMode::Strict,
            &registry,
            &pool,
        )
        .expect("selection should succeed");
        assert!(prepared.is_structured());
        assert_eq!(prepared.path_name(), "structured");
        assert_eq!(prepared.kernel_key(), host_key(DType::F32));
        assert!(!prepared.fallback_used());
    }

    #[test]
    fn missing_signature_keeps_the_legacy_path() {
        let registry = host_registry();
        let pool = DeviceContextPool::new();
        let op = AddOp { structured: false };
        let ins = single("X", var_of("x", host_f32(vec![1.0], vec![1])));
        let attrs = AttributeMap::default();

        let prepared = PreparedOp::prepare(
            &op,
            &ins,
            &attrs,
            &attrs,
            Place::Host,
            ExecutionMode::Strict,
            &registry,
            &pool,
        )
        .expect("selection should succeed");
        assert!(!prepared.is_structured());
        assert_eq!(prepared.path_name(), "legacy");
    }

    #[test]
    fn strict_mode_fails_closed_on_missing_device_kernel() {
        let registry = host_registry();
        let pool = DeviceContextPool::new();
        let op = AddOp { structured: true };
        let ins = single("X", var_of("x", host_f32(vec![1.0], vec![1])));
        let attrs = AttributeMap::default();

        let err = PreparedOp::prepare(
            &op,
            &ins,
            &attrs,
            &attrs,
            Place::Cuda(0),
            ExecutionMode::Strict,
            &registry,
            &pool,
        )
        .expect_err("strict mode must fail closed");
        match err {
            DispatchError::KernelNotFound { op_type, key } => {
                assert_eq!(op_type, "add");
                assert_eq!(key.place, Place::Cuda(0));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn hardened_mode_falls_back_to_host() {
        let registry = host_registry();
        let pool = DeviceContextPool::new();
        let op = AddOp { structured: true };
        let ins = single("X", var_of("x", host_f32(vec![1.0], vec![1])));
        let attrs = AttributeMap::default();

        let prepared = PreparedOp::prepare(
            &op,
            &ins,
            &attrs,
            &attrs,
            Place::Cuda(0),
            ExecutionMode::Hardened,
            &registry,
            &pool,
        )
        .expect("hardened fallback should select the host kernel");
        assert!(prepared.fallback_used());
        assert_eq!(prepared.kernel_key().place, Place::Host);
        assert_eq!(prepared.device_context().place(), Place::Host);
    }

    #[test]
    fn dispatch_dtype_requires_an_initialized_input() {
        let registry = host_registry();
        let pool = DeviceContextPool::new();
        let op = AddOp { structured: false };
        let declared = EagerVar::from_tensor(
            "x",
            DenseTensor::declared(vec![1], DataLayout::Any, Place::Host),
        );
        let ins = single("X", declared);
        let attrs = AttributeMap::default();

        let err = PreparedOp::prepare(
            &op,
            &ins,
            &attrs,
            &attrs,
            Place::Host,
            ExecutionMode::Strict,
            &registry,
            &pool,
        )
        .expect_err("no initialized input must fail");
        assert!(matches!(err, DispatchError::DTypeUndefined { .. }));
    }

    // ── context builder ──

    fn add_signature() -> KernelSignature {
        KernelSignature::new("add", &["X", "Y"], &[], &["Out"])
    }

    fn structured_add_kernel() -> StructuredKernel {
        let registry = host_registry();
        registry
            .find_structured("add", &host_key(DType::F32))
            .expect("registered in setup")
            .clone()
    }

    #[test]
    fn builder_rejects_arity_mismatch_per_section() {
        let kernel = structured_add_kernel();
        let ins = {
            let mut map = single("X", var_of("x", host_f32(vec![1.0], vec![1])));
            map.insert("Y".to_string(), vec![Some(var_of("y", host_f32(vec![1.0], vec![1])))]);
            map
        };
        let outs = single("Out", var_of("out", host_f32(vec![0.0], vec![1])));
        let attrs = AttributeMap::default();

        let wrong_inputs = KernelSignature::new("add", &["X"], &[], &["Out"]);
        let err =
            build_kernel_context(&wrong_inputs, &kernel, &ins, &outs, &attrs, &attrs, Place::Host)
                .expect_err("input arity must fail");
        assert!(matches!(
            err,
            DispatchError::ArgumentCountMismatch { section: ArgSection::Inputs, names: 1, defs: 2, .. }
        ));

        let wrong_outputs = KernelSignature::new("add", &["X", "Y"], &[], &["Out", "Aux"]);
        let err =
            build_kernel_context(&wrong_outputs, &kernel, &ins, &outs, &attrs, &attrs, Place::Host)
                .expect_err("output arity must fail");
        assert!(matches!(
            err,
            DispatchError::ArgumentCountMismatch { section: ArgSection::Outputs, names: 2, defs: 1, .. }
        ));

        let wrong_attrs = KernelSignature::new("add", &["X", "Y"], &["axis"], &["Out"]);
        let err =
            build_kernel_context(&wrong_attrs, &kernel, &ins, &outs, &attrs, &attrs, Place::Host)
                .expect_err("attr arity must fail");
        assert!(matches!(
            err,
            DispatchError::ArgumentCountMismatch { section: ArgSection::Attrs, names: 1, defs: 0, .. }
        ));
    }

    #[test]
    fn builder_flattens_groups_and_records_ranges() {
        let signature = add_signature();
        let kernel = structured_add_kernel();
        let mut ins = NameVarMap::new();
        ins.insert(
            "X".to_string(),
            vec![
                Some(var_of("x0", host_f32(vec![1.0], vec![1]))),
                Some(var_of("x1", host_f32(vec![2.0], vec![1]))),
            ],
        );
        ins.insert("Y".to_string(), vec![Some(var_of("y", host_f32(vec![3.0], vec![1])))]);
        let outs = single("Out", var_of("out", host_f32(vec![0.0], vec![1])));
        let attrs = AttributeMap::default();

        let ctx = build_kernel_context(&signature, &kernel, &ins, &outs, &attrs, &attrs, Place::Host)
            .expect("builder should succeed");
        assert_eq!(ctx.input_count(), 3);
        assert_eq!(ctx.input_range(0), Some((0, 2)));
        assert_eq!(ctx.input_range(1), Some((2, 3)));
        assert_eq!(ctx.output_range(0), Some((0, 1)));
    }

    #[test]
    fn absent_output_group_becomes_an_empty_slot() {
        let signature = add_signature();
        let kernel = structured_add_kernel();
        let mut ins = single("X", var_of("x", host_f32(vec![1.0], vec![1])));
        ins.insert("Y".to_string(), vec![Some(var_of("y", host_f32(vec![1.0], vec![1])))]);
        let outs: NameVarMap<EagerVar> = NameVarMap::new();
        let attrs = AttributeMap::default();

        let ctx = build_kernel_context(&signature, &kernel, &ins, &outs, &attrs, &attrs, Place::Host)
            .expect("builder should succeed");
        assert_eq!(ctx.output_count(), 1);
        assert!(ctx.output(0).is_none());
        assert_eq!(ctx.output_range(0), Some((0, 1)));
    }

    #[test]
    fn builder_preallocates_fixed_dtype_outputs() {
        let signature = add_signature();
        let kernel = structured_add_kernel();
        let mut ins = single("X", var_of("x", host_f32(vec![1.0, 2.0], vec![2])));
        ins.insert("Y".to_string(), vec![Some(var_of("y", host_f32(vec![3.0, 4.0], vec![2])))]);
        let out_var = var_of(
            "out",
            DenseTensor::declared(vec![2], DataLayout::Any, Place::Host),
        );
        let outs = single("Out", out_var);
        let attrs = AttributeMap::default();

        let ctx = build_kernel_context(&signature, &kernel, &ins, &outs, &attrs, &attrs, Place::Host)
            .expect("builder should succeed");
        let slot = ctx.output(0).expect("slot present");
        assert_eq!(slot.dtype(), Some(DType::F32));
        assert_eq!(slot.to_f64_vec().expect("zeroed"), vec![0.0, 0.0]);
    }

    #[test]
    fn builder_rejects_missing_groups_and_bad_kinds() {
        let signature = add_signature();
        let kernel = structured_add_kernel();
        let attrs = AttributeMap::default();
        let outs = single("Out", var_of("out", host_f32(vec![0.0], vec![1])));

        let ins = single("X", var_of("x", host_f32(vec![1.0], vec![1])));
        let err = build_kernel_context(&signature, &kernel, &ins, &outs, &attrs, &attrs, Place::Host)
            .expect_err("absent group must fail");
        assert!(matches!(err, DispatchError::MissingInputGroup { .. }));

        let mut ins = single("X", var_of("x", host_f32(vec![1.0], vec![1])));
        ins.insert("Y".to_string(), vec![None]);
        let err = build_kernel_context(&signature, &kernel, &ins, &outs, &attrs, &attrs, Place::Host)
            .expect_err("empty slot must fail");
        assert!(matches!(err, DispatchError::MissingInput { index: 0, .. }));

        let mut ins = single("X", var_of("x", host_f32(vec![1.0], vec![1])));
        ins.insert(
            "Y".to_string(),
            vec![Some(EagerVar::new("y", ember_core::Variable::Strings(Vec::new())))],
        );
        let err = build_kernel_context(&signature, &kernel, &ins, &outs, &attrs, &attrs, Place::Host)
            .expect_err("strings input must fail");
        assert!(matches!(
            err,
            DispatchError::UnsupportedInputType { kind: VarKind::Strings, .. }
        ));
    }

    #[test]
    fn strings_output_is_rejected() {
        let signature = add_signature();
        let kernel = structured_add_kernel();
        let mut ins = single("X", var_of("x", host_f32(vec![1.0], vec![1])));
        ins.insert("Y".to_string(), vec![Some(var_of("y", host_f32(vec![1.0], vec![1])))]);
        let outs = single("Out", EagerVar::new("out", ember_core::Variable::Strings(Vec::new())));
        let attrs = AttributeMap::default();

        let err = build_kernel_context(&signature, &kernel, &ins, &outs, &attrs, &attrs, Place::Host)
            .expect_err("strings output must fail");
        assert!(matches!(
            err,
            DispatchError::UnsupportedOutputType { kind: VarKind::Strings, .. }
        ));
    }

    fn scale_kernel() -> StructuredKernel {
        let registry = host_registry();
        registry
            .find_structured("scale", &host_key(DType::F32))
            .expect("registered in setup")
            .clone()
    }

    #[test]
    fn literal_attrs_coerce_with_fallbacks() {
        let signature =
            KernelSignature::new("scale", &["X"], &["scale", "bias", "bias_after_scale"], &["Out"]);
        let kernel = scale_kernel();
        let ins = single("X", var_of("x", host_f32(vec![1.0], vec![1])));
        let outs = single("Out", var_of("out", host_f32(vec![0.0], vec![1])));
        let mut attrs = AttributeMap::default();
        attrs.insert("scale".to_string(), AttrValue::I32(4));
        attrs.insert("bias".to_string(), AttrValue::F32(0.5));
        attrs.insert("bias_after_scale".to_string(), AttrValue::Bool(false));

        let ctx = build_kernel_context(&signature, &kernel, &ins, &outs, &attrs, &attrs, Place::Host)
            .expect("builder should succeed");
        assert_eq!(ctx.attr(0), Some(&KernelAttr::Scalar(Scalar::I32(4))));
        assert_eq!(ctx.attr(1), Some(&KernelAttr::F32(0.5)));
        assert_eq!(ctx.attr(2), Some(&KernelAttr::Bool(false)));
    }

    #[test]
    fn tensor_borne_attr_reads_the_input_group() {
        let signature = KernelSignature::new(
            "scale",
            &["X"],
            &["ScaleTensor", "bias", "bias_after_scale"],
            &["Out"],
        );
        let kernel = scale_kernel();
        let mut ins = single("X", var_of("x", host_f32(vec![1.0], vec![1])));
        let holder = DenseTensor::from_f64(vec![7.5], vec![1], Place::Host).expect("tensor");
        ins.insert("ScaleTensor".to_string(), vec![Some(var_of("holder", holder))]);
        let outs = single("Out", var_of("out", host_f32(vec![0.0], vec![1])));
        let mut attrs = AttributeMap::default();
        attrs.insert("bias".to_string(), AttrValue::F32(0.0));
        attrs.insert("bias_after_scale".to_string(), AttrValue::Bool(true));

        let ctx = build_kernel_context(&signature, &kernel, &ins, &outs, &attrs, &attrs, Place::Host)
            .expect("builder should succeed");
        assert_eq!(ctx.attr(0), Some(&KernelAttr::Scalar(Scalar::F64(7.5))));
    }

    #[test]
    fn int_array_attr_reads_single_and_multi_tensor_groups() {
        let registry = host_registry();
        let kernel = registry
            .find_structured("reshape", &host_key(DType::F32))
            .expect("registered in setup")
            .clone();
        let outs: NameVarMap<EagerVar> = NameVarMap::new();
        let attrs = AttributeMap::default();

        let whole = KernelSignature::new("reshape", &["X"], &["Shape"], &["Out"]);
        let mut ins = single("X", var_of("x", host_f32(vec![1.0, 2.0], vec![2])));
        let shape = DenseTensor::from_i64(vec![2, 1], vec![2], Place::Host).expect("tensor");
        ins.insert("Shape".to_string(), vec![Some(var_of("shape", shape))]);
        let ctx = build_kernel_context(&whole, &kernel, &ins, &outs, &attrs, &attrs, Place::Host)
            .expect("builder should succeed");
        match ctx.attr(0) {
            Some(KernelAttr::IntArray(array)) => {
                assert_eq!(array.values(), &[2, 1]);
                assert!(array.is_from_tensor());
            }
            other => panic!("unexpected attr slot: {other:?}"),
        }

        let list = KernelSignature::new("reshape", &["X"], &["ShapeTensor"], &["Out"]);
        let mut ins = single("X", var_of("x", host_f32(vec![1.0, 2.0], vec![2])));
        let d0 = DenseTensor::from_i32(vec![1], vec![1], Place::Host).expect("tensor");
        let d1 = DenseTensor::from_i32(vec![2], vec![1], Place::Host).expect("tensor");
        ins.insert(
            "ShapeTensor".to_string(),
            vec![Some(var_of("d0", d0)), Some(var_of("d1", d1))],
        );
        let ctx = build_kernel_context(&list, &kernel, &ins, &outs, &attrs, &attrs, Place::Host)
            .expect("builder should succeed");
        match ctx.attr(0) {
            Some(KernelAttr::IntArray(array)) => assert_eq!(array.values(), &[1, 2]),
            other => panic!("unexpected attr slot: {other:?}"),
        }
    }

    #[test]
    fn attr_errors_fail_closed() {
        let signature =
            KernelSignature::new("scale", &["X"], &["scale", "bias", "bias_after_scale"], &["Out"]);
        let kernel = scale_kernel();
        let ins = single("X", var_of("x", host_f32(vec![1.0], vec![1])));
        let outs = single("Out", var_of("out", host_f32(vec![0.0], vec![1])));

        let empty = AttributeMap::default();
        let err = build_kernel_context(&signature, &kernel, &ins, &outs, &empty, &empty, Place::Host)
            .expect_err("missing attr must fail");
        assert!(matches!(err, DispatchError::AttributeNotFound { .. }));

        let mut attrs = AttributeMap::default();
        attrs.insert("scale".to_string(), AttrValue::Strs(vec!["x".to_string()]));
        attrs.insert("bias".to_string(), AttrValue::F32(0.0));
        attrs.insert("bias_after_scale".to_string(), AttrValue::Bool(true));
        let err = build_kernel_context(&signature, &kernel, &ins, &outs, &attrs, &attrs, Place::Host)
            .expect_err("bad coercion must fail");
        assert!(matches!(
            err,
            DispatchError::UnsupportedAttributeCoercion { expected: AttrCType::Scalar, .. }
        ));
    }

    // ── structured data preparation ──

    #[test]
    fn structured_prep_copies_between_cuda_ordinals() {
        fn noop(_: &mut KernelContext) -> Result<(), KernelError> {
            Ok(())
        }
        let kernel = StructuredKernel {
            key: KernelKey::new(Place::Cuda(0), DataLayout::Any, DType::F32),
            input_defs: vec![ember_core::TensorArgDef::new(
                Place::Cuda(0),
                DataLayout::Any,
                Some(DType::F32),
            )],
            attr_defs: Vec::new(),
            output_defs: Vec::new(),
            func: noop,
        };
        let signature = KernelSignature::new("noop", &["X"], &[], &[]);
        let pool = DeviceContextPool::new();

        let mut tensor = host_f32(vec![1.0], vec![1]);
        tensor.set_place(Place::Cuda(1));
        let x = var_of("x", tensor);
        let ins = single("X", x.clone());

        prepare_structured_data(&signature, &kernel, &ins, &pool).expect("prep should succeed");
        assert_eq!(x.tensor().expect("payload").place(), Place::Cuda(0));
        assert_eq!(pool.copy_count(), 1);
    }

    // ── end to end ──

    #[test]
    fn structured_add_runs_end_to_end() {
        let registry = host_registry();
        let pool = DeviceContextPool::new();
        let op = AddOp { structured: true };
        let mut ins = single("X", var_of("x", host_f32(vec![1.0, 2.0], vec![2])));
        ins.insert("Y".to_string(), vec![Some(var_of("y", host_f32(vec![3.0, 4.0], vec![2])))]);
        let out = var_of("out", DenseTensor::declared(vec![0], DataLayout::Any, Place::Host));
        let outs = single("Out", out.clone());
        let attrs = AttributeMap::default();

        let prepared = PreparedOp::prepare(
            &op,
            &ins,
            &attrs,
            &attrs,
            Place::Host,
            ExecutionMode::Strict,
            &registry,
            &pool,
        )
        .expect("selection should succeed");
        let shadow = prepare_data(&op, &ins, &prepared.kernel_key(), &pool)
            .expect("transform should succeed");
        let run_ins = shadow.as_ref().unwrap_or(&ins);
        prepared
            .run(run_ins, &outs, &attrs, &attrs, &pool)
            .expect("run should succeed");

        let produced = out.tensor().expect("output payload");
        assert_eq!(produced.shape(), &[2]);
        assert_eq!(produced.dtype(), Some(DType::F32));
        assert_eq!(produced.to_f64_vec().expect("initialized"), vec![4.0, 6.0]);
    }

    #[test]
    fn legacy_scale_runs_end_to_end() {
        let registry = host_registry();
        let pool = DeviceContextPool::new();
        struct LegacyScale;
        impl Operator for LegacyScale {
            fn op_type(&self) -> &str {
                "scale"
            }
            fn infer_shape(&self, ctx: &mut InferContext<'_>) -> Result<(), DispatchError> {
                if let Some(x) = ctx.input("X", 0) {
                    let shape = x.shape().to_vec();
                    ctx.set_output_shape("Out", 0, shape);
                }
                Ok(())
            }
        }
        let op = LegacyScale;
        let ins = single("X", var_of("x", host_f32(vec![1.0, 2.0], vec![2])));
        let out = var_of("out", DenseTensor::declared(vec![0], DataLayout::Any, Place::Host));
        let outs = single("Out", out.clone());
        let mut attrs = AttributeMap::default();
        attrs.insert("scale".to_string(), AttrValue::F32(2.0));
        let defaults = AttributeMap::default();

        let prepared = PreparedOp::prepare(
            &op,
            &ins,
            &attrs,
            &defaults,
            Place::Host,
            ExecutionMode::Strict,
            &registry,
            &pool,
        )
        .expect("selection should succeed");
        assert!(!prepared.is_structured());
        prepared
            .run(&ins, &outs, &attrs, &defaults, &pool)
            .expect("run should succeed");
        assert_eq!(
            out.tensor().expect("payload").to_f64_vec().expect("initialized"),
            vec![2.0, 4.0]
        );
    }

    #[test]
    fn mixed_dtype_add_casts_and_caches_the_second_operand() {
        let registry = host_registry();
        let pool = DeviceContextPool::new();
        let op = AddOp { structured: true };
        let x = var_of("x", host_f32(vec![1.0, 2.0], vec![2]));
        let y_tensor = DenseTensor::from_f64(vec![0.5, 0.5], vec![2], Place::Host).expect("tensor");
        let y = var_of("y", y_tensor);
        let mut ins = single("X", x);
        ins.insert("Y".to_string(), vec![Some(y.clone())]);
        let attrs = AttributeMap::default();

        for round in 0..2 {
            let out = var_of("out", DenseTensor::declared(vec![0], DataLayout::Any, Place::Host));
            let outs = single("Out", out.clone());
            let prepared = PreparedOp::prepare(
                &op,
                &ins,
                &attrs,
                &attrs,
                Place::Host,
                ExecutionMode::Strict,
                &registry,
                &pool,
            )
            .expect("selection should succeed");
            assert_eq!(prepared.kernel_key().dtype, DType::F32);
            let shadow = prepare_data(&op, &ins, &prepared.kernel_key(), &pool)
                .expect("transform should succeed")
                .expect("y must be substituted");
            prepared
                .run(&shadow, &outs, &attrs, &attrs, &pool)
                .expect("run should succeed");
            assert_eq!(
                out.tensor().expect("payload").to_f64_vec().expect("initialized"),
                vec![1.5, 2.5],
                "round {round}"
            );
        }

        // One cast total; the second round was served from the cache.
        assert_eq!(pool.transform_count(), 1);
        assert_eq!(y.tensor().expect("payload").dtype(), Some(DType::F64));
    }

    fn dtype_strategy() -> impl Strategy<Value = DType> {
        prop_oneof![
            Just(DType::F32),
            Just(DType::F64),
            Just(DType::I32),
            Just(DType::I64),
        ]
    }

    fn place_strategy() -> impl Strategy<Value = Place> {
        prop_oneof![Just(Place::Host), Just(Place::Cuda(0)), Just(Place::Cuda(1))]
    }

    proptest! {
        #[test]
        fn prop_transform_output_satisfies_target(
            src_dtype in dtype_strategy(),
            dst_dtype in dtype_strategy(),
            dst_place in place_strategy(),
            values in proptest::collection::vec(-1000i64..1000, 1..8),
        ) {
            let pool = DeviceContextPool::new();
            let len = values.len();
            let lifted: Vec<f64> = values.iter().map(|v| *v as f64).collect();
            let tensor = DenseTensor::new(
                Storage::from_f64_slice(&lifted, src_dtype),
                vec![len],
                DataLayout::Any,
                Place::Host,
            )
            .expect("tensor should build");
            let actual = tensor.kernel_key().expect("initialized");
            let target = KernelKey::new(dst_place, DataLayout::Any, dst_dtype);

            let out = transform_data("x", &tensor, &actual, &target, &pool)
                .expect("transform should succeed");
            let out_key = out.kernel_key().expect("initialized");
            prop_assert!(!out_key.needs_transform(&target));
            prop_assert_eq!(out.numel(), len);
        }
    }
}
