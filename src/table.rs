//! Task table: fixed arena of task records addressed by generational handles

use crate::config::MAX_TASKS;
use crate::task::{TaskHandle, TaskRecord};

struct Slot<'a> {
    generation: u16,
    record: Option<TaskRecord<'a>>,
}

/// Static task table, no dynamic allocation
pub(crate) struct TaskTable<'a> {
    slots: [Slot<'a>; MAX_TASKS],
    live: usize,
}

impl<'a> TaskTable<'a> {
    pub(crate) fn new() -> Self {
        Self {
            slots: core::array::from_fn(|_| Slot {
                generation: 0,
                record: None,
            }),
            live: 0,
        }
    }

    /// Store a record in the first free slot
    pub(crate) fn insert(&mut self, record: TaskRecord<'a>) -> Option<TaskHandle> {
        let (index, slot) = self
            .slots
            .iter_mut()
            .enumerate()
            .find(|(_, slot)| slot.record.is_none())?;
        slot.record = Some(record);
        self.live += 1;
        Some(TaskHandle::new(index as u16, slot.generation))
    }

    /// Take a record out and retire its handle
    pub(crate) fn remove(&mut self, handle: TaskHandle) -> Option<TaskRecord<'a>> {
        let slot = self.slots.get_mut(handle.index())?;
        if slot.generation != handle.generation() {
            return None;
        }
        let record = slot.record.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.live -= 1;
        Some(record)
    }

    pub(crate) fn get(&self, handle: TaskHandle) -> Option<&TaskRecord<'a>> {
        let slot = self.slots.get(handle.index())?;
        if slot.generation != handle.generation() {
            return None;
        }
        slot.record.as_ref()
    }

    pub(crate) fn get_mut(&mut self, handle: TaskHandle) -> Option<&mut TaskRecord<'a>> {
        let slot = self.slots.get_mut(handle.index())?;
        if slot.generation != handle.generation() {
            return None;
        }
        slot.record.as_mut()
    }

    pub(crate) fn contains_name(&self, name: &str) -> bool {
        self.records().any(|record| record.name.as_str() == name)
    }

    pub(crate) fn records(&self) -> impl Iterator<Item = &TaskRecord<'a>> {
        self.slots.iter().filter_map(|slot| slot.record.as_ref())
    }

    pub(crate) fn records_mut(&mut self) -> impl Iterator<Item = &mut TaskRecord<'a>> {
        self.slots.iter_mut().filter_map(|slot| slot.record.as_mut())
    }

    pub(crate) fn is_full(&self) -> bool {
        self.live == MAX_TASKS
    }

    pub(crate) fn len(&self) -> usize {
        self.live
    }
}
