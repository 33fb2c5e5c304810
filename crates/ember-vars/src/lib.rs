#![forbid(unsafe_code)]

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use ember_core::{DType, DenseTensor, KernelKey, Variable, VarKind};
use rustc_hash::FxHashMap;

static NEXT_WRAPPER_ID: AtomicU64 = AtomicU64::new(1);

pub type VarRef = Rc<RefCell<VariableWrapper>>;
pub type WeakVarRef = Weak<RefCell<VariableWrapper>>;

/// Shared mutable state behind every eager variable: the payload, dtype
/// overrides, the weak gradient link, and the per-wrapper transform cache.
/// Wrappers live in `Rc<RefCell<..>>`, which keeps a whole dispatch path on
/// one thread; cross-thread use is a compile error, not a data race.
#[derive(Debug)]
pub struct VariableWrapper {
    id: u64,
    name: String,
    var: Variable,
    dtype: Option<DType>,
    forward_dtype: Option<DType>,
    grad: Option<WeakVarRef>,
    transform_cache: FxHashMap<KernelKey, VarRef>,
}

impl VariableWrapper {
    #[must_use]
    pub fn new(name: &str, var: Variable) -> Self {
        Self {
            id: NEXT_WRAPPER_ID.fetch_add(1, Ordering::Relaxed),
            name: name.to_string(),
            var,
            dtype: None,
            forward_dtype: None,
            grad: None,
            transform_cache: FxHashMap::default(),
        }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn var(&self) -> &Variable {
        &self.var
    }

    pub fn var_mut(&mut self) -> &mut Variable {
        &mut self.var
    }

    pub fn set_var(&mut self, var: Variable) {
        self.var = var;
    }

    /// Declared dtype if set, otherwise whatever the payload carries.
    #[must_use]
    pub fn dtype(&self) -> Option<DType> {
        self.dtype.or_else(|| self.var.dtype())
    }

    pub fn set_dtype(&mut self, dtype: Option<DType>) {
        self.dtype = dtype;
    }

    #[must_use]
    pub fn forward_dtype(&self) -> Option<DType> {
        self.forward_dtype
    }

    pub fn set_forward_dtype(&mut self, dtype: Option<DType>) {
        self.forward_dtype = dtype;
    }

    #[must_use]
    pub fn grad_link(&self) -> Option<WeakVarRef> {
        self.grad.clone()
    }

    pub fn set_grad_link(&mut self, grad: Option<WeakVarRef>) {
        self.grad = grad;
    }

    #[must_use]
    pub fn cached_transform(&self, key: &KernelKey) -> Option<VarRef> {
        self.transform_cache.get(key).cloned()
    }

    pub fn store_transform(&mut self, key: KernelKey, var: VarRef) {
        self.transform_cache.insert(key, var);
    }

    #[must_use]
    pub fn has_cached_transform(&self, key: &KernelKey) -> bool {
        self.transform_cache.contains_key(key)
    }

    #[must_use]
    pub fn cached_transform_count(&self) -> usize {
        self.transform_cache.len()
    }
}

#[must_use]
pub fn new_var_ref(name: &str, var: Variable) -> VarRef {
    Rc::new(RefCell::new(VariableWrapper::new(name, var)))
}

/// User-facing eager variable handle. Cloning shares the wrapper.
#[derive(Debug, Clone)]
pub struct EagerVar {
    inner: VarRef,
}

impl EagerVar {
    #[must_use]
    pub fn new(name: &str, var: Variable) -> Self {
        Self { inner: new_var_ref(name, var) }
    }

    #[must_use]
    pub fn from_tensor(name: &str, tensor: DenseTensor) -> Self {
        Self::new(name, Variable::Dense(tensor))
    }

    #[must_use]
    pub fn from_ref(inner: VarRef) -> Self {
        Self { inner }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.inner.borrow().id()
    }

    /// Snapshot of the dense payload, if any. Storage clones are reference
    /// bumps, so this is cheap.
    #[must_use]
    pub fn tensor(&self) -> Option<DenseTensor> {
        self.inner.borrow().var().tensor().cloned()
    }

    pub fn set_grad(&self, grad: &EagerVar) {
        self.inner
            .borrow_mut()
            .set_grad_link(Some(Rc::downgrade(&grad.inner)));
    }

    #[must_use]
    pub fn grad(&self) -> Option<EagerVar> {
        let link = self.inner.borrow().grad_link()?;
        link.upgrade().map(EagerVar::from_ref)
    }
}

/// Capability surface the dispatch engine needs from a variable handle.
/// Closure-based accessors keep every borrow scoped to one call, which is
/// what lets the transform loop read one input while rebinding another.
pub trait DispatchVar: Clone {
    fn name(&self) -> String;
    fn kind(&self) -> VarKind;
    fn wrapper(&self) -> VarRef;
    fn with_variable<R>(&self, f: impl FnOnce(&Variable) -> R) -> R;
    fn with_variable_mut<R>(&self, f: impl FnOnce(&mut Variable) -> R) -> R;
    fn materialize(name: &str, var: Variable) -> Self;
}

impl DispatchVar for EagerVar {
    fn name(&self) -> String {
        self.inner.borrow().name().to_string()
    }

    fn kind(&self) -> VarKind {
        self.inner.borrow().var().kind()
    }

    fn wrapper(&self) -> VarRef {
        Rc::clone(&self.inner)
    }

    fn with_variable<R>(&self, f: impl FnOnce(&Variable) -> R) -> R {
        f(self.inner.borrow().var())
    }

    fn with_variable_mut<R>(&self, f: impl FnOnce(&mut Variable) -> R) -> R {
        f(self.inner.borrow_mut().var_mut())
    }

    fn materialize(name: &str, var: Variable) -> Self {
        Self::new(name, var)
    }
}

impl DispatchVar for VarRef {
    fn name(&self) -> String {
        self.borrow().name().to_string()
    }

    fn kind(&self) -> VarKind {
        self.borrow().var().kind()
    }

    fn wrapper(&self) -> VarRef {
        Rc::clone(self)
    }

    fn with_variable<R>(&self, f: impl FnOnce(&Variable) -> R) -> R {
        f(self.borrow().var())
    }

    fn with_variable_mut<R>(&self, f: impl FnOnce(&mut Variable) -> R) -> R {
        f(self.borrow_mut().var_mut())
    }

    fn materialize(name: &str, var: Variable) -> Self {
        new_var_ref(name, var)
    }
}

pub type VarGroup<V> = Vec<Option<V>>;

/// Ordered slot map from argument name to variable group. BTreeMap keeps
/// iteration deterministic across runs.
pub type NameVarMap<V> = BTreeMap<String, VarGroup<V>>;

/// Snapshot of the dense payload behind any handle kind.
#[must_use]
pub fn tensor_of<V: DispatchVar>(var: &V) -> Option<DenseTensor> {
    var.with_variable(|v| v.tensor().cloned())
}

/// Propagates a variable's dtype onto its gradient wrapper so backward
/// kernels key on the forward dtype. A dropped gradient link is a silent
/// no-op.
pub fn set_forward_dtype_of_grad_var<V: DispatchVar>(var: &V) {
    let handle = var.wrapper();
    let (dtype, link) = {
        let wrapper = handle.borrow();
        (wrapper.dtype(), wrapper.grad_link())
    };
    if let Some(grad) = link.and_then(|weak| weak.upgrade()) {
        grad.borrow_mut().set_forward_dtype(dtype);
    }
}
