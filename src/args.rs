//! Kernel argument chains.
//!
//! A stage binds its buffers once into an [`ArgGroup`] — a flat list of
//! `(buffer, read, write, partial_read)` slots in kernel-signature order —
//! and mutates the flag slots per kernel index instead of rebuilding the
//! chain on every dispatch.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use smallvec::SmallVec;

use crate::error::{Error, Result};
use crate::facade::CruncherFacade;
use crate::stage_buffer::StageBuffer;

/// Transfer-flag configuration shared by both sides of a stage buffer.
#[derive(Debug, Default)]
pub struct BufferFlags {
    read: AtomicBool,
    write: AtomicBool,
    partial_read: AtomicBool,
}

impl BufferFlags {
    pub fn set_read(&self, on: bool) {
        self.read.store(on, Ordering::Relaxed);
    }

    pub fn set_write(&self, on: bool) {
        self.write.store(on, Ordering::Relaxed);
    }

    pub fn set_partial_read(&self, on: bool) {
        self.partial_read.store(on, Ordering::Relaxed);
    }

    pub fn read(&self) -> bool {
        self.read.load(Ordering::Relaxed)
    }

    pub fn write(&self) -> bool {
        self.write.load(Ordering::Relaxed)
    }

    pub fn partial_read(&self) -> bool {
        self.partial_read.load(Ordering::Relaxed)
    }

    pub fn set_all(&self, read: bool, write: bool, partial_read: bool) {
        self.set_read(read);
        self.set_write(write);
        self.set_partial_read(partial_read);
    }
}

/// A point-in-time copy of one slot's transfer flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlagState {
    pub read: bool,
    pub write: bool,
    pub partial_read: bool,
}

impl FlagState {
    pub const OFF: FlagState = FlagState { read: false, write: false, partial_read: false };
}

/// One argument slot: a stage buffer plus the flags the next dispatch will
/// present to the driver for it.
#[derive(Debug, Clone)]
pub struct ArgEntry {
    pub buffer: Arc<StageBuffer>,
    pub read: bool,
    pub write: bool,
    pub partial_read: bool,
}

impl ArgEntry {
    pub fn flag_state(&self) -> FlagState {
        FlagState { read: self.read, write: self.write, partial_read: self.partial_read }
    }
}

/// An ordered kernel argument list.
#[derive(Debug, Clone, Default)]
pub struct ArgGroup {
    entries: SmallVec<[ArgEntry; 8]>,
}

impl ArgGroup {
    pub fn new() -> ArgGroup {
        ArgGroup { entries: SmallVec::new() }
    }

    /// Appends `buffer`, seeding the slot flags from the buffer's current
    /// configuration.
    pub fn push(&mut self, buffer: Arc<StageBuffer>) {
        let flags = buffer.flags();
        let entry = ArgEntry {
            read: flags.read(),
            write: flags.write(),
            partial_read: flags.partial_read(),
            buffer: buffer,
        };
        self.entries.push(entry);
    }

    pub fn from_buffers<I>(buffers: I) -> ArgGroup
    where
        I: IntoIterator<Item = Arc<StageBuffer>>,
    {
        let mut group = ArgGroup::new();
        for buf in buffers {
            group.push(buf);
        }
        group
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[ArgEntry] {
        &self.entries
    }

    pub fn entry(&self, index: usize) -> Option<&ArgEntry> {
        self.entries.get(index)
    }

    pub fn entry_mut(&mut self, index: usize) -> Option<&mut ArgEntry> {
        self.entries.get_mut(index)
    }

    /// Re-seeds every slot from its buffer's flag configuration.
    pub fn refresh_flags(&mut self) {
        for entry in self.entries.iter_mut() {
            let flags = entry.buffer.flags();
            entry.read = flags.read();
            entry.write = flags.write();
            entry.partial_read = flags.partial_read();
        }
    }

    pub fn set_entry_flags(&mut self, index: usize, state: FlagState) {
        if let Some(entry) = self.entries.get_mut(index) {
            entry.read = state.read;
            entry.write = state.write;
            entry.partial_read = state.partial_read;
        }
    }

    pub fn set_all_flags(&mut self, state: FlagState) {
        for i in 0..self.entries.len() {
            self.set_entry_flags(i, state);
        }
    }

    /// Freezes the current flag states, slot by slot.
    pub fn snapshot_flags(&self) -> Vec<FlagState> {
        self.entries.iter().map(|e| e.flag_state()).collect()
    }

    /// Restores a previously frozen flag snapshot.
    pub fn apply_flags(&mut self, states: &[FlagState]) -> Result<()> {
        if states.len() != self.entries.len() {
            return Err(Error::LengthMismatch {
                expected: self.entries.len(),
                found: states.len(),
            });
        }
        for (i, state) in states.iter().enumerate() {
            self.set_entry_flags(i, *state);
        }
        Ok(())
    }

    /// Per-slot element strides, in argument order.
    pub fn strides(&self) -> Vec<usize> {
        self.entries.iter().map(|e| e.buffer.elems_per_item()).collect()
    }
}

/// A dispatchable compute target: a full argument group or a lone buffer.
pub trait Compute {
    fn compute(
        &self,
        facade: &mut CruncherFacade,
        compute_id: u32,
        kernel_names: &str,
        global: usize,
        local: usize,
        offset: usize,
    ) -> Result<()>;
}

impl Compute for ArgGroup {
    fn compute(
        &self,
        facade: &mut CruncherFacade,
        compute_id: u32,
        kernel_names: &str,
        global: usize,
        local: usize,
        offset: usize,
    ) -> Result<()> {
        facade.compute(self, compute_id, kernel_names, global, local, offset)
    }
}

impl Compute for Arc<StageBuffer> {
    fn compute(
        &self,
        facade: &mut CruncherFacade,
        compute_id: u32,
        kernel_names: &str,
        global: usize,
        local: usize,
        offset: usize,
    ) -> Result<()> {
        let mut group = ArgGroup::new();
        group.push(self.clone());
        facade.compute(&group, compute_id, kernel_names, global, local, offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::HostArray;
    use crate::stage_buffer::StageBuffer;

    #[test]
    fn push_seeds_flags_from_buffer() {
        let buf = StageBuffer::new(HostArray::from_vec(vec![0.0f32; 4]));
        buf.set_read(true);
        buf.set_write(false);

        let mut group = ArgGroup::new();
        group.push(buf.clone());
        assert!(group.entry(0).unwrap().read);
        assert!(!group.entry(0).unwrap().write);

        // Later buffer-side changes are picked up by an explicit refresh.
        buf.set_write(true);
        assert!(!group.entry(0).unwrap().write);
        group.refresh_flags();
        assert!(group.entry(0).unwrap().write);
    }

    #[test]
    fn snapshot_roundtrip() {
        let a = StageBuffer::new(HostArray::from_vec(vec![0.0f32; 4]));
        let b = StageBuffer::new(HostArray::from_vec(vec![0.0f32; 4]));
        a.set_read(true);
        b.set_write(true);

        let mut group = ArgGroup::from_buffers(vec![a, b]);
        let frozen = group.snapshot_flags();

        group.set_all_flags(FlagState::OFF);
        assert!(!group.entry(0).unwrap().read);

        group.apply_flags(&frozen).unwrap();
        assert!(group.entry(0).unwrap().read);
        assert!(group.entry(1).unwrap().write);

        assert!(group.apply_flags(&frozen[..1]).is_err());
    }
}
