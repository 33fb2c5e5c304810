#![forbid(unsafe_code)]

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use ember_core::{DenseTensor, Place};
use rustc_hash::FxHashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    UninitializedCopySource { name: String },
    PlaceMismatch { expected: Place, found: Place },
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UninitializedCopySource { name } => {
                write!(f, "cannot copy uninitialized tensor '{name}'")
            }
            Self::PlaceMismatch { expected, found } => {
                write!(f, "place mismatch: expected={expected} found={found}")
            }
        }
    }
}

impl std::error::Error for DeviceError {}

/// Execution context bound to one place. Device memory is modeled by the
/// place tag on tensor storage; a copy re-tags a storage snapshot and waits
/// for completion before returning.
#[derive(Debug)]
pub struct DeviceContext {
    place: Place,
}

impl DeviceContext {
    #[must_use]
    pub fn new(place: Place) -> Self {
        Self { place }
    }

    #[must_use]
    pub fn place(&self) -> Place {
        self.place
    }

    /// Synchronous copy of `tensor` onto this context's place.
    pub fn copy_tensor_sync(&self, name: &str, tensor: &DenseTensor) -> Result<DenseTensor, DeviceError> {
        if !tensor.is_initialized() {
            return Err(DeviceError::UninitializedCopySource { name: name.to_string() });
        }
        let mut copied = tensor.clone();
        copied.set_place(self.place);
        Ok(copied)
    }

    pub fn ensure_tensor_place(&self, tensor: &DenseTensor) -> Result<(), DeviceError> {
        if tensor.place() == self.place {
            Ok(())
        } else {
            Err(DeviceError::PlaceMismatch { expected: self.place, found: tensor.place() })
        }
    }
}

/// Lazily populated map from place to shared device context, plus the
/// transform and copy counters the engine reports through. One pool per
/// session; not shared across threads.
#[derive(Debug, Default)]
pub struct DeviceContextPool {
    contexts: RefCell<FxHashMap<Place, Rc<DeviceContext>>>,
    transform_count: Cell<u64>,
    copy_count: Cell<u64>,
}

impl DeviceContextPool {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, place: Place) -> Rc<DeviceContext> {
        let mut contexts = self.contexts.borrow_mut();
        Rc::clone(
            contexts
                .entry(place)
                .or_insert_with(|| Rc::new(DeviceContext::new(place))),
        )
    }

    pub fn copy_tensor_sync(
        &self,
        name: &str,
        tensor: &DenseTensor,
        target: Place,
    ) -> Result<DenseTensor, DeviceError> {
        let copied = self.get(target).copy_tensor_sync(name, tensor)?;
        self.copy_count.set(self.copy_count.get() + 1);
        Ok(copied)
    }

    /// Called once per materialized input transformation, whatever mix of
    /// layout, dtype, and place steps it took.
    pub fn note_transform(&self) {
        self.transform_count.set(self.transform_count.get() + 1);
    }

    #[must_use]
    pub fn transform_count(&self) -> u64 {
        self.transform_count.get()
    }

    #[must_use]
    pub fn copy_count(&self) -> u64 {
        self.copy_count.get()
    }

    pub fn reset_counters(&self) {
        self.transform_count.set(0);
        self.copy_count.set(0);
    }
}
