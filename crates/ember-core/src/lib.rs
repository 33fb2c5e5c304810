#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Arc;

use half::{bf16, f16};
use rustc_hash::FxHashMap;

/// Dispatch policy for the whole stack. Strict fails closed when a kernel is
/// missing for the requested place; Hardened permits the documented host
/// fallback during selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionMode {
    Strict,
    Hardened,
}

impl ExecutionMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Strict => "strict",
            Self::Hardened => "hardened",
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Physical placement of tensor storage. `same_class` compares at the
/// device-class level (all CUDA ordinals form one class), `is_same_place`
/// compares exactly; the legacy transform path uses the former, the
/// structured data preparer the latter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Place {
    Host,
    Cuda(u32),
    CudaPinned,
}

impl Place {
    #[must_use]
    pub fn is_host(self) -> bool {
        matches!(self, Self::Host)
    }

    #[must_use]
    pub fn is_cuda(self) -> bool {
        matches!(self, Self::Cuda(_))
    }

    #[must_use]
    pub fn same_class(self, other: Place) -> bool {
        matches!(
            (self, other),
            (Self::Host, Self::Host) | (Self::Cuda(_), Self::Cuda(_)) | (Self::CudaPinned, Self::CudaPinned)
        )
    }
}

#[must_use]
pub fn is_same_place(lhs: Place, rhs: Place) -> bool {
    lhs == rhs
}

impl fmt::Display for Place {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Host => f.write_str("host"),
            Self::Cuda(ordinal) => write!(f, "cuda:{ordinal}"),
            Self::CudaPinned => f.write_str("cuda_pinned"),
        }
    }
}

/// Memory layout of a dense tensor. `Any` is compatible with every concrete
/// layout; a layout transform is required only between two differing concrete
/// layouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataLayout {
    Any,
    Nchw,
    Nhwc,
}

impl DataLayout {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Any => "any",
            Self::Nchw => "NCHW",
            Self::Nhwc => "NHWC",
        }
    }
}

impl fmt::Display for DataLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    F16,
    Bf16,
    F32,
    F64,
    I32,
    I64,
    Bool,
}

pub const ALL_DTYPES: [DType; 7] = [
    DType::F16,
    DType::Bf16,
    DType::F32,
    DType::F64,
    DType::I32,
    DType::I64,
    DType::Bool,
];

impl DType {
    /// Stable wire code used when a dtype travels through an integer
    /// attribute.
    #[must_use]
    pub fn code(self) -> i32 {
        match self {
            Self::Bool => 0,
            Self::I32 => 2,
            Self::I64 => 3,
            Self::F16 => 4,
            Self::F32 => 5,
            Self::F64 => 6,
            Self::Bf16 => 22,
        }
    }

    pub fn from_code(code: i32) -> Result<Self, CoreError> {
        match code {
            0 => Ok(Self::Bool),
            2 => Ok(Self::I32),
            3 => Ok(Self::I64),
            4 => Ok(Self::F16),
            5 => Ok(Self::F32),
            6 => Ok(Self::F64),
            22 => Ok(Self::Bf16),
            other => Err(CoreError::UnknownDTypeCode { code: other }),
        }
    }

    #[must_use]
    pub fn size_of(self) -> usize {
        match self {
            Self::Bool => 1,
            Self::F16 | Self::Bf16 => 2,
            Self::F32 | Self::I32 => 4,
            Self::F64 | Self::I64 => 8,
        }
    }

    #[must_use]
    pub fn is_floating(self) -> bool {
        matches!(self, Self::F16 | Self::Bf16 | Self::F32 | Self::F64)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::F16 => "f16",
            Self::Bf16 => "bf16",
            Self::F32 => "f32",
            Self::F64 => "f64",
            Self::I32 => "i32",
            Self::I64 => "i64",
            Self::Bool => "bool",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The {place, layout, dtype} triple identifying a kernel variant and the
/// target of any input transformation. Equality and hashing are structural.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernelKey {
    pub place: Place,
    pub layout: DataLayout,
    pub dtype: DType,
}

impl KernelKey {
    #[must_use]
    pub fn new(place: Place, layout: DataLayout, dtype: DType) -> Self {
        Self { place, layout, dtype }
    }

    #[must_use]
    pub fn with_place(self, place: Place) -> Self {
        Self { place, ..self }
    }

    #[must_use]
    pub fn with_layout(self, layout: DataLayout) -> Self {
        Self { layout, ..self }
    }

    #[must_use]
    pub fn with_dtype(self, dtype: DType) -> Self {
        Self { dtype, ..self }
    }

    #[must_use]
    pub fn host_fallback(self) -> Self {
        self.with_place(Place::Host)
    }

    #[must_use]
    pub fn needs_place_transform(&self, target: &KernelKey) -> bool {
        !self.place.same_class(target.place)
    }

    #[must_use]
    pub fn needs_layout_transform(&self, target: &KernelKey) -> bool {
        self.layout != DataLayout::Any
            && target.layout != DataLayout::Any
            && self.layout != target.layout
    }

    #[must_use]
    pub fn needs_dtype_transform(&self, target: &KernelKey) -> bool {
        self.dtype != target.dtype
    }

    #[must_use]
    pub fn needs_transform(&self, target: &KernelKey) -> bool {
        self.needs_place_transform(target)
            || self.needs_layout_transform(target)
            || self.needs_dtype_transform(target)
    }
}

impl fmt::Display for KernelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "place[{}]:layout[{}]:dtype[{}]",
            self.place, self.layout, self.dtype
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    ShapeOverflow { shape: Vec<usize> },
    StorageSizeMismatch { expected: usize, actual: usize },
    UnknownDTypeCode { code: i32 },
    UninitializedSource,
    EmptyScalarSource,
    NonIntegerArraySource { dtype: DType },
    DenseIncompatible { kind: VarKind },
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ShapeOverflow { shape } => write!(f, "shape {shape:?} overflows element count"),
            Self::StorageSizeMismatch { expected, actual } => {
                write!(f, "storage size mismatch: expected={expected} actual={actual}")
            }
            Self::UnknownDTypeCode { code } => write!(f, "unknown dtype code {code}"),
            Self::UninitializedSource => f.write_str("source tensor is uninitialized"),
            Self::EmptyScalarSource => f.write_str("scalar source tensor holds no elements"),
            Self::NonIntegerArraySource { dtype } => {
                write!(f, "int-array source tensor must be integral, got {dtype}")
            }
            Self::DenseIncompatible { kind } => {
                write!(f, "variable kind {kind} cannot hold a dense tensor")
            }
        }
    }
}

impl std::error::Error for CoreError {}

#[derive(Debug, Clone, PartialEq)]
pub enum StorageData {
    F16(Vec<f16>),
    Bf16(Vec<bf16>),
    F32(Vec<f32>),
    F64(Vec<f64>),
    I32(Vec<i32>),
    I64(Vec<i64>),
    Bool(Vec<bool>),
}

impl StorageData {
    #[must_use]
    pub fn dtype(&self) -> DType {
        match self {
            Self::F16(_) => DType::F16,
            Self::Bf16(_) => DType::Bf16,
            Self::F32(_) => DType::F32,
            Self::F64(_) => DType::F64,
            Self::I32(_) => DType::I32,
            Self::I64(_) => DType::I64,
            Self::Bool(_) => DType::Bool,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::F16(v) => v.len(),
            Self::Bf16(v) => v.len(),
            Self::F32(v) => v.len(),
            Self::F64(v) => v.len(),
            Self::I32(v) => v.len(),
            Self::I64(v) => v.len(),
            Self::Bool(v) => v.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Reference-counted typed buffer. Clones are cheap; mutation always goes
/// through whole-buffer replacement on the owning tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct Storage(Arc<StorageData>);

impl Storage {
    #[must_use]
    pub fn new(data: StorageData) -> Self {
        Self(Arc::new(data))
    }

    #[must_use]
    pub fn from_f32(values: Vec<f32>) -> Self {
        Self::new(StorageData::F32(values))
    }

    #[must_use]
    pub fn from_f64(values: Vec<f64>) -> Self {
        Self::new(StorageData::F64(values))
    }

    #[must_use]
    pub fn from_i32(values: Vec<i32>) -> Self {
        Self::new(StorageData::I32(values))
    }

    #[must_use]
    pub fn from_i64(values: Vec<i64>) -> Self {
        Self::new(StorageData::I64(values))
    }

    #[must_use]
    pub fn from_bool(values: Vec<bool>) -> Self {
        Self::new(StorageData::Bool(values))
    }

    #[must_use]
    pub fn zeros(dtype: DType, len: usize) -> Self {
        let data = match dtype {
            DType::F16 => StorageData::F16(vec![f16::ZERO; len]),
            DType::Bf16 => StorageData::Bf16(vec![bf16::ZERO; len]),
            DType::F32 => StorageData::F32(vec![0.0; len]),
            DType::F64 => StorageData::F64(vec![0.0; len]),
            DType::I32 => StorageData::I32(vec![0; len]),
            DType::I64 => StorageData::I64(vec![0; len]),
            DType::Bool => StorageData::Bool(vec![false; len]),
        };
        Self::new(data)
    }

    #[must_use]
    pub fn data(&self) -> &StorageData {
        &self.0
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        self.0.dtype()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Lifts every element to f64. The widening view the cast and lifted
    /// elementwise paths are built on.
    #[must_use]
    pub fn to_f64_vec(&self) -> Vec<f64> {
        match self.data() {
            StorageData::F16(v) => v.iter().map(|x| x.to_f64()).collect(),
            StorageData::Bf16(v) => v.iter().map(|x| x.to_f64()).collect(),
            StorageData::F32(v) => v.iter().map(|x| f64::from(*x)).collect(),
            StorageData::F64(v) => v.clone(),
            StorageData::I32(v) => v.iter().map(|x| f64::from(*x)).collect(),
            StorageData::I64(v) => v.iter().map(|x| *x as f64).collect(),
            StorageData::Bool(v) => v.iter().map(|x| if *x { 1.0 } else { 0.0 }).collect(),
        }
    }

    /// Narrows f64 elements into a buffer of the requested dtype. Integral
    /// targets truncate toward zero, bool targets test against zero.
    #[must_use]
    pub fn from_f64_slice(values: &[f64], dtype: DType) -> Self {
        let data = match dtype {
            DType::F16 => StorageData::F16(values.iter().map(|x| f16::from_f64(*x)).collect()),
            DType::Bf16 => StorageData::Bf16(values.iter().map(|x| bf16::from_f64(*x)).collect()),
            DType::F32 => StorageData::F32(values.iter().map(|x| *x as f32).collect()),
            DType::F64 => StorageData::F64(values.to_vec()),
            DType::I32 => StorageData::I32(values.iter().map(|x| *x as i32).collect()),
            DType::I64 => StorageData::I64(values.iter().map(|x| *x as i64).collect()),
            DType::Bool => StorageData::Bool(values.iter().map(|x| *x != 0.0).collect()),
        };
        Self::new(data)
    }
}

fn checked_numel(shape: &[usize]) -> Result<usize, CoreError> {
    let mut numel: usize = 1;
    for dim in shape {
        numel = numel
            .checked_mul(*dim)
            .ok_or_else(|| CoreError::ShapeOverflow { shape: shape.to_vec() })?;
    }
    Ok(numel)
}

/// Dense tensor: shape plus layout/place metadata and optional typed storage.
/// `storage == None` means declared but unallocated, the "uninitialized"
/// state the transform and preparation paths skip over.
#[derive(Debug, Clone, PartialEq)]
pub struct DenseTensor {
    shape: Vec<usize>,
    layout: DataLayout,
    place: Place,
    storage: Option<Storage>,
}

impl DenseTensor {
    #[must_use]
    pub fn declared(shape: Vec<usize>, layout: DataLayout, place: Place) -> Self {
        Self { shape, layout, place, storage: None }
    }

    pub fn new(
        storage: Storage,
        shape: Vec<usize>,
        layout: DataLayout,
        place: Place,
    ) -> Result<Self, CoreError> {
        let numel = checked_numel(&shape)?;
        if storage.len() != numel {
            return Err(CoreError::StorageSizeMismatch { expected: numel, actual: storage.len() });
        }
        Ok(Self { shape, layout, place, storage: Some(storage) })
    }

    pub fn from_f32(values: Vec<f32>, shape: Vec<usize>, place: Place) -> Result<Self, CoreError> {
        Self::new(Storage::from_f32(values), shape, DataLayout::Any, place)
    }

    pub fn from_f64(values: Vec<f64>, shape: Vec<usize>, place: Place) -> Result<Self, CoreError> {
        Self::new(Storage::from_f64(values), shape, DataLayout::Any, place)
    }

    pub fn from_i32(values: Vec<i32>, shape: Vec<usize>, place: Place) -> Result<Self, CoreError> {
        Self::new(Storage::from_i32(values), shape, DataLayout::Any, place)
    }

    pub fn from_i64(values: Vec<i64>, shape: Vec<usize>, place: Place) -> Result<Self, CoreError> {
        Self::new(Storage::from_i64(values), shape, DataLayout::Any, place)
    }

    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    #[must_use]
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    #[must_use]
    pub fn layout(&self) -> DataLayout {
        self.layout
    }

    #[must_use]
    pub fn place(&self) -> Place {
        self.place
    }

    #[must_use]
    pub fn dtype(&self) -> Option<DType> {
        self.storage.as_ref().map(Storage::dtype)
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.storage.is_some()
    }

    #[must_use]
    pub fn storage(&self) -> Option<&Storage> {
        self.storage.as_ref()
    }

    /// The key this tensor currently satisfies; `None` while uninitialized.
    #[must_use]
    pub fn kernel_key(&self) -> Option<KernelKey> {
        self.dtype().map(|dtype| KernelKey::new(self.place, self.layout, dtype))
    }

    pub fn set_layout(&mut self, layout: DataLayout) {
        self.layout = layout;
    }

    pub fn set_place(&mut self, place: Place) {
        self.place = place;
    }

    /// Reshapes in place; storage is dropped when the element count changes.
    pub fn resize(&mut self, shape: Vec<usize>) -> Result<(), CoreError> {
        let numel = checked_numel(&shape)?;
        if self.storage.as_ref().is_some_and(|s| s.len() != numel) {
            self.storage = None;
        }
        self.shape = shape;
        Ok(())
    }

    pub fn replace_storage(&mut self, storage: Storage) -> Result<(), CoreError> {
        if storage.len() != self.numel() {
            return Err(CoreError::StorageSizeMismatch {
                expected: self.numel(),
                actual: storage.len(),
            });
        }
        self.storage = Some(storage);
        Ok(())
    }

    pub fn alloc_zeroed(&mut self, dtype: DType) {
        self.storage = Some(Storage::zeros(dtype, self.numel()));
    }

    pub fn to_f64_vec(&self) -> Result<Vec<f64>, CoreError> {
        self.storage
            .as_ref()
            .map(Storage::to_f64_vec)
            .ok_or(CoreError::UninitializedSource)
    }

    /// First element lifted to f64; the scalar-from-tensor read.
    pub fn scalar_f64(&self) -> Result<f64, CoreError> {
        let storage = self.storage.as_ref().ok_or(CoreError::UninitializedSource)?;
        storage
            .to_f64_vec()
            .first()
            .copied()
            .ok_or(CoreError::EmptyScalarSource)
    }
}

/// Row-indexed sparse representation: a row list plus a dense value tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectedRows {
    pub rows: Vec<i64>,
    pub value: DenseTensor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarKind {
    Dense,
    SelectedRows,
    Strings,
}

impl VarKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Dense => "dense",
            Self::SelectedRows => "selected_rows",
            Self::Strings => "strings",
        }
    }
}

impl fmt::Display for VarKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Type-erased runtime container. Dense and SelectedRows expose a dense
/// tensor payload through `tensor`; Strings does not and yields `None`.
#[derive(Debug, Clone, PartialEq)]
pub enum Variable {
    Dense(DenseTensor),
    SelectedRows(SelectedRows),
    Strings(Vec<String>),
}

impl Variable {
    #[must_use]
    pub fn kind(&self) -> VarKind {
        match self {
            Self::Dense(_) => VarKind::Dense,
            Self::SelectedRows(_) => VarKind::SelectedRows,
            Self::Strings(_) => VarKind::Strings,
        }
    }

    #[must_use]
    pub fn tensor(&self) -> Option<&DenseTensor> {
        match self {
            Self::Dense(tensor) => Some(tensor),
            Self::SelectedRows(rows) => Some(&rows.value),
            Self::Strings(_) => None,
        }
    }

    pub fn tensor_mut(&mut self) -> Option<&mut DenseTensor> {
        match self {
            Self::Dense(tensor) => Some(tensor),
            Self::SelectedRows(rows) => Some(&mut rows.value),
            Self::Strings(_) => None,
        }
    }

    #[must_use]
    pub fn dtype(&self) -> Option<DType> {
        self.tensor().and_then(DenseTensor::dtype)
    }

    /// Replaces the dense payload, preserving the container kind.
    pub fn set_tensor(&mut self, tensor: DenseTensor) -> Result<(), CoreError> {
        match self {
            Self::Dense(slot) => {
                *slot = tensor;
                Ok(())
            }
            Self::SelectedRows(rows) => {
                rows.value = tensor;
                Ok(())
            }
            Self::Strings(_) => Err(CoreError::DenseIncompatible { kind: self.kind() }),
        }
    }

    /// Builds a new variable of this container kind around `tensor`. Row
    /// metadata is carried over for SelectedRows.
    pub fn with_tensor_like(&self, tensor: DenseTensor) -> Result<Variable, CoreError> {
        match self {
            Self::Dense(_) => Ok(Variable::Dense(tensor)),
            Self::SelectedRows(rows) => Ok(Variable::SelectedRows(SelectedRows {
                rows: rows.rows.clone(),
                value: tensor,
            })),
            Self::Strings(_) => Err(CoreError::DenseIncompatible { kind: self.kind() }),
        }
    }
}

/// Closed attribute value union. Coercion into kernel-facing representations
/// is an exhaustive match over these variants, never a type-id comparison.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Bool(bool),
    I32(i32),
    I64(i64),
    F32(f32),
    Str(String),
    Bools(Vec<bool>),
    I32s(Vec<i32>),
    I64s(Vec<i64>),
    F32s(Vec<f32>),
    Strs(Vec<String>),
    DType(DType),
}

impl AttrValue {
    #[must_use]
    pub fn kind_str(&self) -> &'static str {
        match self {
            Self::Bool(_) => "bool",
            Self::I32(_) => "i32",
            Self::I64(_) => "i64",
            Self::F32(_) => "f32",
            Self::Str(_) => "str",
            Self::Bools(_) => "bools",
            Self::I32s(_) => "i32s",
            Self::I64s(_) => "i64s",
            Self::F32s(_) => "f32s",
            Self::Strs(_) => "strs",
            Self::DType(_) => "dtype",
        }
    }
}

pub type AttributeMap = FxHashMap<String, AttrValue>;

/// Generic scalar carried into structured kernels, either from a literal
/// attribute or read out of a single-element input tensor.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Bool(bool),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Str(String),
}

impl Scalar {
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Bool(v) => Some(if *v { 1.0 } else { 0.0 }),
            Self::I32(v) => Some(f64::from(*v)),
            Self::I64(v) => Some(*v as f64),
            Self::F32(v) => Some(f64::from(*v)),
            Self::F64(v) => Some(*v),
            Self::Str(_) => None,
        }
    }

    /// Reads element zero, keeping the source dtype family. The 16-bit
    /// floats widen to f32.
    pub fn from_tensor(tensor: &DenseTensor) -> Result<Self, CoreError> {
        let storage = tensor.storage().ok_or(CoreError::UninitializedSource)?;
        if storage.is_empty() {
            return Err(CoreError::EmptyScalarSource);
        }
        let scalar = match storage.data() {
            StorageData::F16(v) => Self::F32(v[0].to_f32()),
            StorageData::Bf16(v) => Self::F32(v[0].to_f32()),
            StorageData::F32(v) => Self::F32(v[0]),
            StorageData::F64(v) => Self::F64(v[0]),
            StorageData::I32(v) => Self::I32(v[0]),
            StorageData::I64(v) => Self::I64(v[0]),
            StorageData::Bool(v) => Self::Bool(v[0]),
        };
        Ok(scalar)
    }
}

/// Integer list carried into structured kernels, either from a literal
/// attribute or assembled from input tensors. `from_tensor` remembers the
/// tensor provenance the way shape arguments expect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntArray {
    values: Vec<i64>,
    from_tensor: bool,
}

impl IntArray {
    #[must_use]
    pub fn new(values: Vec<i64>) -> Self {
        Self { values, from_tensor: false }
    }

    #[must_use]
    pub fn from_i32s(values: &[i32]) -> Self {
        Self::new(values.iter().map(|v| i64::from(*v)).collect())
    }

    /// Whole-tensor read: every element of one integral tensor becomes one
    /// array entry.
    pub fn from_tensor(tensor: &DenseTensor) -> Result<Self, CoreError> {
        let storage = tensor.storage().ok_or(CoreError::UninitializedSource)?;
        let values = match storage.data() {
            StorageData::I32(v) => v.iter().map(|x| i64::from(*x)).collect(),
            StorageData::I64(v) => v.clone(),
            other => return Err(CoreError::NonIntegerArraySource { dtype: other.dtype() }),
        };
        Ok(Self { values, from_tensor: true })
    }

    /// Per-tensor read: each tensor in the group contributes its first
    /// element, preserving group order.
    pub fn from_tensor_list(tensors: &[&DenseTensor]) -> Result<Self, CoreError> {
        let mut values = Vec::with_capacity(tensors.len());
        for tensor in tensors {
            let storage = tensor.storage().ok_or(CoreError::UninitializedSource)?;
            let value = match storage.data() {
                StorageData::I32(v) => v.first().map(|x| i64::from(*x)),
                StorageData::I64(v) => v.first().copied(),
                other => return Err(CoreError::NonIntegerArraySource { dtype: other.dtype() }),
            };
            values.push(value.ok_or(CoreError::EmptyScalarSource)?);
        }
        Ok(Self { values, from_tensor: true })
    }

    #[must_use]
    pub fn values(&self) -> &[i64] {
        &self.values
    }

    #[must_use]
    pub fn is_from_tensor(&self) -> bool {
        self.from_tensor
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum KernelError {
    ShapeMismatch { lhs: Vec<usize>, rhs: Vec<usize> },
    DTypeMismatch { lhs: DType, rhs: DType },
    UninitializedInput { name: String },
    MissingOutput { name: String },
    StorageSizeMismatch { expected: usize, actual: usize },
    UnsupportedRank { kernel: &'static str, rank: usize },
    InvalidShapeValue { reason: String },
    MissingAttr { name: String },
    ContextMismatch { reason: String },
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ShapeMismatch { lhs, rhs } => {
                write!(f, "shape mismatch: lhs={lhs:?} rhs={rhs:?}")
            }
            Self::DTypeMismatch { lhs, rhs } => {
                write!(f, "dtype mismatch: lhs={lhs} rhs={rhs}")
            }
            Self::UninitializedInput { name } => write!(f, "input '{name}' is uninitialized"),
            Self::MissingOutput { name } => write!(f, "output '{name}' is absent"),
            Self::StorageSizeMismatch { expected, actual } => {
                write!(f, "storage size mismatch: expected={expected} actual={actual}")
            }
            Self::UnsupportedRank { kernel, rank } => {
                write!(f, "kernel '{kernel}' does not support rank {rank}")
            }
            Self::InvalidShapeValue { reason } => write!(f, "invalid shape value: {reason}"),
            Self::MissingAttr { name } => write!(f, "attribute '{name}' is absent"),
            Self::ContextMismatch { reason } => write!(f, "kernel context mismatch: {reason}"),
        }
    }
}

impl std::error::Error for KernelError {}

impl From<CoreError> for KernelError {
    fn from(error: CoreError) -> Self {
        match error {
            CoreError::StorageSizeMismatch { expected, actual } => {
                Self::StorageSizeMismatch { expected, actual }
            }
            other => Self::ContextMismatch { reason: other.to_string() },
        }
    }
}

/// Untyped execution surface handed to legacy kernel functions. Input reads
/// hand out snapshots (storage clones are reference bumps); output writes go
/// back through the owning variable.
pub trait ExecContext {
    fn op_type(&self) -> &str;
    fn place(&self) -> Place;
    fn input_len(&self, name: &str) -> usize;
    fn input_tensor(&self, name: &str, index: usize) -> Option<DenseTensor>;
    fn set_output_tensor(&self, name: &str, index: usize, tensor: DenseTensor)
    -> Result<(), KernelError>;
    fn attr(&self, name: &str) -> Option<AttrValue>;

    fn has_input(&self, name: &str) -> bool {
        self.input_len(name) > 0
    }
}

pub type LegacyKernelFn = fn(&dyn ExecContext) -> Result<(), KernelError>;

/// Expected coerced representation of one structured-kernel attribute slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttrCType {
    Scalar,
    IntArray,
    I32,
    F32,
    Bool,
    DType,
    I64s,
}

impl AttrCType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Scalar => "scalar",
            Self::IntArray => "int_array",
            Self::I32 => "i32",
            Self::F32 => "f32",
            Self::Bool => "bool",
            Self::DType => "dtype",
            Self::I64s => "i64s",
        }
    }
}

impl fmt::Display for AttrCType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per tensor argument: the place/layout/dtype the kernel expects. A `None`
/// dtype leaves the element type to the kernel (cast-style outputs).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TensorArgDef {
    pub place: Place,
    pub layout: DataLayout,
    pub dtype: Option<DType>,
}

impl TensorArgDef {
    #[must_use]
    pub fn new(place: Place, layout: DataLayout, dtype: Option<DType>) -> Self {
        Self { place, layout, dtype }
    }

    #[must_use]
    pub fn host(dtype: Option<DType>) -> Self {
        Self::new(Place::Host, DataLayout::Any, dtype)
    }
}

/// Ordered name lists declared by a structured kernel: the positional
/// contract between caller-side named groups and kernel argument slots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelSignature {
    pub name: String,
    pub inputs: Vec<String>,
    pub attrs: Vec<String>,
    pub outputs: Vec<String>,
}

impl KernelSignature {
    #[must_use]
    pub fn new(name: &str, inputs: &[&str], attrs: &[&str], outputs: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            inputs: inputs.iter().map(|s| (*s).to_string()).collect(),
            attrs: attrs.iter().map(|s| (*s).to_string()).collect(),
            outputs: outputs.iter().map(|s| (*s).to_string()).collect(),
        }
    }
}

pub type StructuredKernelFn = fn(&mut KernelContext) -> Result<(), KernelError>;

/// A structured kernel: argument descriptors plus the function over the
/// built context.
#[derive(Debug, Clone)]
pub struct StructuredKernel {
    pub key: KernelKey,
    pub input_defs: Vec<TensorArgDef>,
    pub attr_defs: Vec<AttrCType>,
    pub output_defs: Vec<TensorArgDef>,
    pub func: StructuredKernelFn,
}

/// Coerced attribute value as seen by a structured kernel.
#[derive(Debug, Clone, PartialEq)]
pub enum KernelAttr {
    Bool(bool),
    I32(i32),
    F32(f32),
    DType(DType),
    I64s(Vec<i64>),
    Scalar(Scalar),
    IntArray(IntArray),
}

/// Flat argument buffers for one structured-kernel invocation. Slot `None`
/// marks a skipped optional argument; per-arg `[start, end)` ranges are
/// cumulative over the flat lists.
#[derive(Debug)]
pub struct KernelContext {
    place: Place,
    inputs: Vec<Option<DenseTensor>>,
    input_ranges: Vec<(usize, usize)>,
    outputs: Vec<Option<DenseTensor>>,
    output_ranges: Vec<(usize, usize)>,
    attrs: Vec<KernelAttr>,
}

impl KernelContext {
    #[must_use]
    pub fn for_place(place: Place) -> Self {
        Self {
            place,
            inputs: Vec::new(),
            input_ranges: Vec::new(),
            outputs: Vec::new(),
            output_ranges: Vec::new(),
            attrs: Vec::new(),
        }
    }

    #[must_use]
    pub fn place(&self) -> Place {
        self.place
    }

    pub fn push_input(&mut self, tensor: Option<DenseTensor>) {
        self.inputs.push(tensor);
    }

    pub fn push_input_range(&mut self, start: usize, end: usize) {
        self.input_ranges.push((start, end));
    }

    pub fn push_output(&mut self, tensor: Option<DenseTensor>) {
        self.outputs.push(tensor);
    }

    pub fn push_output_range(&mut self, start: usize, end: usize) {
        self.output_ranges.push((start, end));
    }

    pub fn push_attr(&mut self, attr: KernelAttr) {
        self.attrs.push(attr);
    }

    #[must_use]
    pub fn input(&self, index: usize) -> Option<&DenseTensor> {
        self.inputs.get(index).and_then(Option::as_ref)
    }

    #[must_use]
    pub fn input_range(&self, arg_index: usize) -> Option<(usize, usize)> {
        self.input_ranges.get(arg_index).copied()
    }

    #[must_use]
    pub fn output(&self, index: usize) -> Option<&DenseTensor> {
        self.outputs.get(index).and_then(Option::as_ref)
    }

    pub fn output_mut(&mut self, index: usize) -> Option<&mut DenseTensor> {
        self.outputs.get_mut(index).and_then(Option::as_mut)
    }

    pub fn set_output(&mut self, index: usize, tensor: DenseTensor) -> bool {
        match self.outputs.get_mut(index) {
            Some(slot) => {
                *slot = Some(tensor);
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn output_range(&self, arg_index: usize) -> Option<(usize, usize)> {
        self.output_ranges.get(arg_index).copied()
    }

    #[must_use]
    pub fn attr(&self, index: usize) -> Option<&KernelAttr> {
        self.attrs.get(index)
    }

    #[must_use]
    pub fn input_count(&self) -> usize {
        self.inputs.len()
    }

    #[must_use]
    pub fn output_count(&self) -> usize {
        self.outputs.len()
    }

    #[must_use]
    pub fn attr_count(&self) -> usize {
        self.attrs.len()
    }

    #[must_use]
    pub fn take_outputs(&mut self) -> Vec<Option<DenseTensor>> {
        std::mem::take(&mut self.outputs)
    }
}

/// Kernel lookup tables: op type to legacy functions, structured name to
/// structured kernels, both keyed by execution key. Owned by the caller and
/// threaded through selection explicitly; nothing registers globally.
#[derive(Debug, Default)]
pub struct KernelRegistry {
    legacy: FxHashMap<String, FxHashMap<KernelKey, LegacyKernelFn>>,
    structured: FxHashMap<String, FxHashMap<KernelKey, StructuredKernel>>,
}

impl KernelRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_legacy(&mut self, op_type: &str, key: KernelKey, func: LegacyKernelFn) {
        self.legacy.entry(op_type.to_string()).or_default().insert(key, func);
    }

    pub fn register_structured(&mut self, name: &str, kernel: StructuredKernel) {
        self.structured
            .entry(name.to_string())
            .or_default()
            .insert(kernel.key, kernel);
    }

    #[must_use]
    pub fn find_legacy(&self, op_type: &str, key: &KernelKey) -> Option<LegacyKernelFn> {
        self.legacy.get(op_type).and_then(|table| table.get(key)).copied()
    }

    #[must_use]
    pub fn find_structured(&self, name: &str, key: &KernelKey) -> Option<&StructuredKernel> {
        self.structured.get(name).and_then(|table| table.get(key))
    }

    #[must_use]
    pub fn has_structured(&self, name: &str) -> bool {
        self.structured.get(name).is_some_and(|table| !table.is_empty())
    }

    #[must_use]
    pub fn legacy_len(&self, op_type: &str) -> usize {
        self.legacy.get(op_type).map_or(0, FxHashMap::len)
    }
}
