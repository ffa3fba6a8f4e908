//! Double-buffered stage array slots.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::args::{ArgGroup, BufferFlags};
use crate::element::{ElementKind, HostArray};
use crate::error::{Error, Result};

struct Sides {
    primary: HostArray,
    duplicate: Option<HostArray>,
}

/// One logical array slot of a stage: a primary array and (usually) an
/// equally-sized duplicate used for shuttling while the primary computes.
///
/// `switch_buffers` atomically exchanges the two sides. Read/write/partial
/// flags configure how the driver treats the slot at dispatch time and apply
/// to whichever side is current. A non-duplicated slot (hidden state, device
/// internal arrays) has no shadow and switching it is a no-op.
pub struct StageBuffer {
    kind: ElementKind,
    elems_per_item: usize,
    duplicated: bool,
    sides: Mutex<Sides>,
    orig_primary: HostArray,
    flags: BufferFlags,
}

impl StageBuffer {
    /// Wraps `array` and allocates a zeroed duplicate of identical shape.
    pub fn new(array: HostArray) -> Arc<StageBuffer> {
        let duplicate = array.alloc_duplicate();
        Arc::new(StageBuffer {
            kind: array.kind(),
            elems_per_item: array.elems_per_item(),
            duplicated: true,
            orig_primary: array.clone(),
            sides: Mutex::new(Sides { primary: array, duplicate: Some(duplicate) }),
            flags: BufferFlags::default(),
        })
    }

    /// Wraps `array` with no duplicate. `switch_buffers` becomes a no-op and
    /// `switched_buffer` returns `None`.
    pub fn without_duplicate(array: HostArray) -> Arc<StageBuffer> {
        Arc::new(StageBuffer {
            kind: array.kind(),
            elems_per_item: array.elems_per_item(),
            duplicated: false,
            orig_primary: array.clone(),
            sides: Mutex::new(Sides { primary: array, duplicate: None }),
            flags: BufferFlags::default(),
        })
    }

    /// An independent view of `other`, sharing both underlying arrays but
    /// switching on its own. Adjacent stages connected by a transition array
    /// each hold a view of the one array pair, so once their parities are
    /// alternated the connection is a pointer swap rather than a copy.
    pub fn aliasing(other: &StageBuffer) -> Result<Arc<StageBuffer>> {
        let sides = other.sides.lock();
        let duplicate = match sides.duplicate {
            Some(ref d) => d.clone(),
            None => return Error::err(
                "StageBuffer::aliasing(): source has no duplicate to share"),
        };
        Ok(Arc::new(StageBuffer {
            kind: other.kind,
            elems_per_item: other.elems_per_item,
            duplicated: true,
            orig_primary: other.orig_primary.clone(),
            sides: Mutex::new(Sides {
                primary: sides.primary.clone(),
                duplicate: Some(duplicate),
            }),
            flags: BufferFlags::default(),
        }))
    }

    pub fn kind(&self) -> ElementKind {
        self.kind
    }

    /// Element count of either side.
    pub fn len(&self) -> usize {
        self.orig_primary.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn elems_per_item(&self) -> usize {
        self.elems_per_item
    }

    pub fn is_duplicated(&self) -> bool {
        self.duplicated
    }

    /// The array a kernel dispatch operates on right now.
    pub fn primary(&self) -> HostArray {
        self.sides.lock().primary.clone()
    }

    /// The shuttling side, or `None` for a non-duplicated slot.
    pub fn switched_buffer(&self) -> Option<HostArray> {
        self.sides.lock().duplicate.clone()
    }

    /// The array this slot was created around, kept for debug output.
    pub fn orig_primary(&self) -> &HostArray {
        &self.orig_primary
    }

    /// Exchanges primary and duplicate. No-op for a non-duplicated slot.
    pub fn switch_buffers(&self) {
        let mut sides = self.sides.lock();
        if let Some(dup) = sides.duplicate.take() {
            let old_primary = ::std::mem::replace(&mut sides.primary, dup);
            sides.duplicate = Some(old_primary);
        }
    }

    pub fn flags(&self) -> &BufferFlags {
        &self.flags
    }

    pub fn set_read(&self, on: bool) {
        self.flags.set_read(on);
    }

    pub fn set_write(&self, on: bool) {
        self.flags.set_write(on);
    }

    pub fn set_partial_read(&self, on: bool) {
        self.flags.set_partial_read(on);
    }

    /// Chains this slot with `others` into an argument group, in order.
    pub fn next_param(self: &Arc<Self>, others: &[Arc<StageBuffer>]) -> ArgGroup {
        let mut group = ArgGroup::new();
        group.push(self.clone());
        for buf in others {
            group.push(buf.clone());
        }
        group
    }
}

impl fmt::Debug for StageBuffer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("StageBuffer")
            .field("kind", &self.kind)
            .field("len", &self.len())
            .field("duplicated", &self.duplicated)
            .finish()
    }
}
