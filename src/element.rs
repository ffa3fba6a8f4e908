//! Element kinds and host-visible array handles.
//!
//! Every array crossing the host↔device boundary is tagged with an
//! [`ElementKind`]. Copies between arrays fan out exactly once over the kind
//! sum; a kind, length, or stride mismatch is reported as an error rather
//! than a panic so binding mistakes degrade to logged no-ops upstream.

use std::fmt;
use std::sync::Arc;

use num::{NumCast, ToPrimitive};
use parking_lot::Mutex;

use crate::error::{Error, Result};

/// The closed set of element kinds a boundary array may carry.
///
/// `Struct` is an opaque byte array whose per-work-item stride is carried
/// alongside the data (see [`HostArray::elems_per_item`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementKind {
    F32,
    F64,
    U8,
    I8,
    I32,
    U32,
    I64,
    Struct,
}

impl ElementKind {
    /// Size in bytes of a single element of this kind (`1` for `Struct`,
    /// which is measured in raw bytes).
    pub fn byte_size(self) -> usize {
        match self {
            ElementKind::F32 => 4,
            ElementKind::F64 => 8,
            ElementKind::U8 => 1,
            ElementKind::I8 => 1,
            ElementKind::I32 => 4,
            ElementKind::U32 => 4,
            ElementKind::I64 => 8,
            ElementKind::Struct => 1,
        }
    }

    pub fn is_struct(self) -> bool {
        self == ElementKind::Struct
    }
}

impl fmt::Display for ElementKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match *self {
            ElementKind::F32 => "f32",
            ElementKind::F64 => "f64",
            ElementKind::U8 => "u8",
            ElementKind::I8 => "i8",
            ElementKind::I32 => "i32",
            ElementKind::U32 => "u32",
            ElementKind::I64 => "i64",
            ElementKind::Struct => "struct",
        };
        f.write_str(name)
    }
}

/// Backing storage for a host array, tagged by kind.
#[derive(Debug, Clone, PartialEq)]
pub enum ArrayData {
    F32(Vec<f32>),
    F64(Vec<f64>),
    U8(Vec<u8>),
    I8(Vec<i8>),
    I32(Vec<i32>),
    U32(Vec<u32>),
    I64(Vec<i64>),
    Struct(Vec<u8>),
}

impl ArrayData {
    pub fn kind(&self) -> ElementKind {
        match *self {
            ArrayData::F32(_) => ElementKind::F32,
            ArrayData::F64(_) => ElementKind::F64,
            ArrayData::U8(_) => ElementKind::U8,
            ArrayData::I8(_) => ElementKind::I8,
            ArrayData::I32(_) => ElementKind::I32,
            ArrayData::U32(_) => ElementKind::U32,
            ArrayData::I64(_) => ElementKind::I64,
            ArrayData::Struct(_) => ElementKind::Struct,
        }
    }

    /// Element count (byte count for `Struct`).
    pub fn len(&self) -> usize {
        match *self {
            ArrayData::F32(ref v) => v.len(),
            ArrayData::F64(ref v) => v.len(),
            ArrayData::U8(ref v) => v.len(),
            ArrayData::I8(ref v) => v.len(),
            ArrayData::I32(ref v) => v.len(),
            ArrayData::U32(ref v) => v.len(),
            ArrayData::I64(ref v) => v.len(),
            ArrayData::Struct(ref v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn zeroed(kind: ElementKind, len: usize) -> ArrayData {
        match kind {
            ElementKind::F32 => ArrayData::F32(vec![0.0; len]),
            ElementKind::F64 => ArrayData::F64(vec![0.0; len]),
            ElementKind::U8 => ArrayData::U8(vec![0; len]),
            ElementKind::I8 => ArrayData::I8(vec![0; len]),
            ElementKind::I32 => ArrayData::I32(vec![0; len]),
            ElementKind::U32 => ArrayData::U32(vec![0; len]),
            ElementKind::I64 => ArrayData::I64(vec![0; len]),
            ElementKind::Struct => ArrayData::Struct(vec![0; len]),
        }
    }

    /// The single fan-out point for same-kind copies.
    fn copy_from(&mut self, src: &ArrayData) -> Result<()> {
        match (self, src) {
            (&mut ArrayData::F32(ref mut d), &ArrayData::F32(ref s)) => d.copy_from_slice(s),
            (&mut ArrayData::F64(ref mut d), &ArrayData::F64(ref s)) => d.copy_from_slice(s),
            (&mut ArrayData::U8(ref mut d), &ArrayData::U8(ref s)) => d.copy_from_slice(s),
            (&mut ArrayData::I8(ref mut d), &ArrayData::I8(ref s)) => d.copy_from_slice(s),
            (&mut ArrayData::I32(ref mut d), &ArrayData::I32(ref s)) => d.copy_from_slice(s),
            (&mut ArrayData::U32(ref mut d), &ArrayData::U32(ref s)) => d.copy_from_slice(s),
            (&mut ArrayData::I64(ref mut d), &ArrayData::I64(ref s)) => d.copy_from_slice(s),
            (&mut ArrayData::Struct(ref mut d), &ArrayData::Struct(ref s)) => d.copy_from_slice(s),
            (d, s) => {
                return Err(Error::KindMismatch { expected: d.kind(), found: s.kind() });
            }
        }
        Ok(())
    }
}

/// Scalar types which may back a numeric [`HostArray`].
///
/// The bound mirrors what kernels can consume; `NumCast`/`ToPrimitive` let
/// generic harness code produce test data without committing to a type.
pub trait HostElement:
    Copy + Default + PartialOrd + fmt::Debug + fmt::Display + NumCast + ToPrimitive + Send + 'static
{
    const KIND: ElementKind;

    fn wrap(vec: Vec<Self>) -> ArrayData;
    fn slice(data: &ArrayData) -> Option<&[Self]>;
    fn slice_mut(data: &mut ArrayData) -> Option<&mut [Self]>;
}

macro_rules! impl_host_element {
    ($ty:ty, $variant:ident) => {
        impl HostElement for $ty {
            const KIND: ElementKind = ElementKind::$variant;

            fn wrap(vec: Vec<$ty>) -> ArrayData {
                ArrayData::$variant(vec)
            }

            fn slice(data: &ArrayData) -> Option<&[$ty]> {
                match *data {
                    ArrayData::$variant(ref v) => Some(v),
                    _ => None,
                }
            }

            fn slice_mut(data: &mut ArrayData) -> Option<&mut [$ty]> {
                match *data {
                    ArrayData::$variant(ref mut v) => Some(v),
                    _ => None,
                }
            }
        }
    };
}

impl_host_element!(f32, F32);
impl_host_element!(f64, F64);
impl_host_element!(u8, U8);
impl_host_element!(i8, I8);
impl_host_element!(i32, I32);
impl_host_element!(u32, U32);
impl_host_element!(i64, I64);

/// A shared, kind-tagged host array handle.
///
/// This is the unit the driver shuttles to and from devices and the unit the
/// pipeline forwards between stages. Cloning the handle aliases the same
/// storage; kind, length, and stride are fixed at creation while contents
/// are interior-mutable behind a lock.
#[derive(Clone)]
pub struct HostArray {
    data: Arc<Mutex<ArrayData>>,
    kind: ElementKind,
    len: usize,
    elems_per_item: usize,
}

impl HostArray {
    /// Wraps an owned vector of scalars.
    pub fn from_vec<T: HostElement>(vec: Vec<T>) -> HostArray {
        let len = vec.len();
        HostArray {
            data: Arc::new(Mutex::new(T::wrap(vec))),
            kind: T::KIND,
            len: len,
            elems_per_item: 1,
        }
    }

    /// A zero-filled array of `len` elements of `kind` (bytes for `Struct`).
    pub fn zeroed(kind: ElementKind, len: usize) -> HostArray {
        HostArray {
            data: Arc::new(Mutex::new(ArrayData::zeroed(kind, len))),
            kind: kind,
            len: len,
            elems_per_item: 1,
        }
    }

    /// Wraps an opaque struct array. `elems_per_item` is the byte stride of
    /// one work item and must evenly divide the data length.
    pub fn structs(bytes: Vec<u8>, elems_per_item: usize) -> Result<HostArray> {
        if elems_per_item == 0 || bytes.len() % elems_per_item != 0 {
            return Error::err(format!(
                "HostArray::structs(): stride {} does not divide byte length {}",
                elems_per_item, bytes.len()));
        }
        let len = bytes.len();
        Ok(HostArray {
            data: Arc::new(Mutex::new(ArrayData::Struct(bytes))),
            kind: ElementKind::Struct,
            len: len,
            elems_per_item: elems_per_item,
        })
    }

    /// Overrides the per-work-item element stride (builder-style).
    pub fn with_stride(mut self, elems_per_item: usize) -> HostArray {
        assert!(elems_per_item > 0, "HostArray::with_stride(): zero stride");
        self.elems_per_item = elems_per_item;
        self
    }

    pub fn kind(&self) -> ElementKind {
        self.kind
    }

    /// Element count (byte count for `Struct`).
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Elements consumed by one work item.
    pub fn elems_per_item(&self) -> usize {
        self.elems_per_item
    }

    /// Number of work items this array spans.
    pub fn work_items(&self) -> usize {
        self.len / self.elems_per_item
    }

    /// Returns `true` when both handles alias the same storage.
    pub fn ptr_eq(&self, other: &HostArray) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }

    /// Allocates a zeroed array of identical kind, length, and stride.
    pub fn alloc_duplicate(&self) -> HostArray {
        HostArray {
            data: Arc::new(Mutex::new(ArrayData::zeroed(self.kind, self.len))),
            kind: self.kind,
            len: self.len,
            elems_per_item: self.elems_per_item,
        }
    }

    /// Runs `f` with shared access to the contents.
    pub fn with_data<R, F: FnOnce(&ArrayData) -> R>(&self, f: F) -> R {
        f(&*self.data.lock())
    }

    /// Runs `f` with exclusive access to the contents.
    pub fn with_data_mut<R, F: FnOnce(&mut ArrayData) -> R>(&self, f: F) -> R {
        f(&mut *self.data.lock())
    }

    /// Copies `src` into `self`, validating kind, length, and stride first.
    ///
    /// Copying a handle onto itself is a no-op.
    pub fn copy_from(&self, src: &HostArray) -> Result<()> {
        if self.ptr_eq(src) {
            return Ok(());
        }
        if self.kind != src.kind {
            return Err(Error::KindMismatch { expected: self.kind, found: src.kind });
        }
        if self.len != src.len {
            return Err(Error::LengthMismatch { expected: self.len, found: src.len });
        }
        if self.elems_per_item != src.elems_per_item {
            return Err(Error::StrideMismatch {
                expected: self.elems_per_item,
                found: src.elems_per_item,
            });
        }
        // Lock in address order so two concurrent opposite-direction copies
        // cannot deadlock.
        let self_first = Arc::as_ptr(&self.data) < Arc::as_ptr(&src.data);
        let (mut dst_guard, src_guard) = if self_first {
            let d = self.data.lock();
            let s = src.data.lock();
            (d, s)
        } else {
            let s = src.data.lock();
            let d = self.data.lock();
            (d, s)
        };
        dst_guard.copy_from(&*src_guard)
    }

    /// Reads the contents out as a typed vector.
    pub fn read_vec<T: HostElement>(&self) -> Result<Vec<T>> {
        let guard = self.data.lock();
        match T::slice(&*guard) {
            Some(s) => Ok(s.to_vec()),
            None => Err(Error::KindMismatch { expected: T::KIND, found: self.kind }),
        }
    }

    /// Overwrites the contents from a typed slice of matching length.
    pub fn write_from_slice<T: HostElement>(&self, src: &[T]) -> Result<()> {
        if src.len() != self.len {
            return Err(Error::LengthMismatch { expected: self.len, found: src.len() });
        }
        let mut guard = self.data.lock();
        match T::slice_mut(&mut *guard) {
            Some(d) => {
                d.copy_from_slice(src);
                Ok(())
            }
            None => Err(Error::KindMismatch { expected: T::KIND, found: self.kind }),
        }
    }
}

impl fmt::Debug for HostArray {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("HostArray")
            .field("kind", &self.kind)
            .field("len", &self.len)
            .field("elems_per_item", &self.elems_per_item)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_requires_matching_kind_and_len() {
        let a = HostArray::from_vec(vec![1.0f32, 2.0, 3.0]);
        let b = HostArray::from_vec(vec![0.0f32; 3]);
        b.copy_from(&a).unwrap();
        assert_eq!(b.read_vec::<f32>().unwrap(), vec![1.0, 2.0, 3.0]);

        let c = HostArray::from_vec(vec![0i32; 3]);
        assert!(c.copy_from(&a).is_err());

        let d = HostArray::from_vec(vec![0.0f32; 4]);
        assert!(d.copy_from(&a).is_err());
    }

    #[test]
    fn duplicate_carries_stride() {
        let a = HostArray::structs(vec![0u8; 64], 16).unwrap();
        let d = a.alloc_duplicate();
        assert_eq!(d.kind(), ElementKind::Struct);
        assert_eq!(d.len(), 64);
        assert_eq!(d.elems_per_item(), 16);
        assert_eq!(d.work_items(), 4);
    }

    #[test]
    fn struct_stride_must_divide() {
        assert!(HostArray::structs(vec![0u8; 10], 3).is_err());
        assert!(HostArray::structs(vec![0u8; 12], 3).is_ok());
    }

    #[test]
    fn self_copy_is_noop() {
        let a = HostArray::from_vec(vec![5u32; 8]);
        let alias = a.clone();
        a.copy_from(&alias).unwrap();
        assert_eq!(a.read_vec::<u32>().unwrap(), vec![5; 8]);
    }
}
