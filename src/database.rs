//! The local attribute database.
//!
//! Attributes are organised into *groupings*: contiguous handle ranges led by
//! a group declaration attribute. Groupings are allocated into the lowest
//! free handle gap, can be removed independently (leaving gaps for reuse) and
//! only participate in queries once they are fully populated and activated.

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::mutex::{Mutex, MutexGuard};
use heapless::Vec;

use crate::att::{AttErrorCode, Handle, HANDLE_MAX, HANDLE_MIN, MAX_ATTRIBUTE_VALUE_LENGTH};
use crate::attribute::{AccessRequirements, Attribute};
use crate::attribute_server::{AttrHandler, WriteKind};
use crate::security::{check_write_permissions, SecurityProperties};
use crate::types::uuid::Uuid;
use crate::write_queue::{PrepareWriteQueue, QueuedWrite};
use crate::{Error, PeerId};

/// A contiguous range of handles led by a group declaration attribute.
///
/// The declaration attribute is readable without security, not writable, and
/// carries the group declaration value. A grouping is *complete* once every
/// handle in its range has been populated.
#[derive(Debug)]
pub struct AttributeGrouping {
    start_handle: Handle,
    end_handle: Handle,
    populated: u16,
    active: bool,
}

impl AttributeGrouping {
    /// First handle of the grouping (the declaration attribute).
    pub fn start_handle(&self) -> Handle {
        self.start_handle
    }

    /// Last handle of the grouping, inclusive.
    pub fn end_handle(&self) -> Handle {
        self.end_handle
    }

    /// Whether every handle in the range has an attribute.
    pub fn complete(&self) -> bool {
        self.populated as u32 == self.end_handle as u32 - self.start_handle as u32 + 1
    }

    /// Only active groupings are considered when serving requests.
    pub fn active(&self) -> bool {
        self.active
    }

    fn contains(&self, handle: Handle) -> bool {
        handle >= self.start_handle && handle <= self.end_handle
    }

    fn populated(&self) -> usize {
        self.populated as usize
    }
}

/// The groupings and attributes of a database, accessed through its lock.
///
/// Attributes live in one handle-sorted arena alongside the grouping
/// metadata; a grouping locates its attributes by handle rather than by
/// owning them.
pub struct DatabaseInner<const MAX: usize> {
    range_start: Handle,
    range_end: Handle,
    groupings: Vec<AttributeGrouping, MAX>,
    attributes: Vec<Attribute, MAX>,
}

impl<const MAX: usize> DatabaseInner<MAX> {
    /// Create a new grouping of `attr_count` attributes (excluding the
    /// declaration attribute) in the lowest handle gap that fits.
    /// `decl_value` becomes the read-only value of the declaration attribute.
    pub fn new_grouping(
        &mut self,
        group_type: Uuid,
        attr_count: usize,
        decl_value: &[u8],
    ) -> Result<Handle, Error> {
        let size = attr_count as u32 + 1;
        if self.groupings.is_full() || self.attributes.is_full() {
            return Err(Error::InsufficientSpace);
        }

        let mut insert_idx = self.groupings.len();
        let mut candidate = self.range_start as u32;
        for (idx, grouping) in self.groupings.iter().enumerate() {
            if grouping.start_handle as u32 - candidate >= size {
                insert_idx = idx;
                break;
            }
            candidate = grouping.end_handle as u32 + 1;
        }
        if insert_idx == self.groupings.len() && self.range_end as u32 + 1 - candidate < size {
            return Err(Error::InsufficientSpace);
        }

        let start = candidate as Handle;
        let end = (candidate + size - 1) as Handle;
        let mut decl = Attribute::new(
            start,
            group_type,
            AccessRequirements::allowed(),
            AccessRequirements::disallowed(),
        );
        decl.set_value(decl_value);

        let arena_idx = self.arena_index(start);
        self.attributes
            .insert(arena_idx, decl)
            .map_err(|_| Error::InsufficientSpace)?;
        self.groupings
            .insert(
                insert_idx,
                AttributeGrouping {
                    start_handle: start,
                    end_handle: end,
                    populated: 1,
                    active: false,
                },
            )
            .map_err(|_| Error::InsufficientSpace)?;
        Ok(start)
    }

    /// Remove the grouping whose start handle matches exactly. Its handle
    /// range becomes available for reuse.
    pub fn remove_grouping(&mut self, start_handle: Handle) -> bool {
        let Some(idx) = self
            .groupings
            .iter()
            .position(|g| g.start_handle == start_handle)
        else {
            return false;
        };
        let populated = self.groupings[idx].populated();
        let arena_idx = self.arena_index(start_handle);
        for _ in 0..populated {
            self.attributes.remove(arena_idx);
        }
        self.groupings.remove(idx);
        true
    }

    /// Append one attribute to a grouping, assigning the next consecutive
    /// handle. Returns `None` when the grouping is complete or storage ran
    /// out.
    pub fn add_attribute(
        &mut self,
        group_start: Handle,
        att_type: Uuid,
        read_reqs: AccessRequirements,
        write_reqs: AccessRequirements,
    ) -> Option<Handle> {
        if self.attributes.is_full() {
            return None;
        }
        let grouping = self
            .groupings
            .iter_mut()
            .find(|g| g.start_handle == group_start)?;
        if grouping.complete() {
            return None;
        }
        let handle = grouping.start_handle + grouping.populated;
        grouping.populated += 1;

        let arena_idx = self.arena_index(handle);
        self.attributes
            .insert(arena_idx, Attribute::new(handle, att_type, read_reqs, write_reqs))
            .ok()?;
        Some(handle)
    }

    /// Mark a complete grouping as active or inactive. Panics when called on
    /// an incomplete grouping.
    pub fn set_active(&mut self, start_handle: Handle, active: bool) -> bool {
        let Some(grouping) = self
            .groupings
            .iter_mut()
            .find(|g| g.start_handle == start_handle)
        else {
            return false;
        };
        assert!(grouping.complete());
        grouping.active = active;
        true
    }

    /// The attribute with the given handle, provided its grouping is both
    /// complete and active.
    pub fn find_attribute(&self, handle: Handle) -> Option<&Attribute> {
        let grouping = self.grouping_containing(handle)?;
        if !grouping.complete() || !grouping.active() {
            return None;
        }
        Some(&self.attributes[self.arena_index(handle)])
    }

    /// Population-time access to an attribute, regardless of grouping state.
    pub fn attribute_mut(&mut self, handle: Handle) -> Option<&mut Attribute> {
        let grouping = self.grouping_containing(handle)?;
        if (handle - grouping.start_handle) as usize >= grouping.populated() {
            return None;
        }
        let idx = self.arena_index(handle);
        Some(&mut self.attributes[idx])
    }

    /// The grouping with the given start handle.
    pub fn grouping(&self, start_handle: Handle) -> Option<&AttributeGrouping> {
        self.groupings.iter().find(|g| g.start_handle == start_handle)
    }

    /// All groupings, sorted by start handle.
    pub fn groupings(&self) -> &[AttributeGrouping] {
        &self.groupings
    }

    /// Iterate attributes of complete and active groupings in handle order,
    /// restricted to `[start, end]`. With `groups_only` set only declaration
    /// attributes are yielded; with a type filter only attributes of that
    /// type.
    pub fn iter(
        &self,
        start: Handle,
        end: Handle,
        type_filter: Option<Uuid>,
        groups_only: bool,
    ) -> AttrIter<'_> {
        AttrIter {
            groupings: &self.groupings,
            attributes: &self.attributes,
            grp_idx: 0,
            offset: 0,
            start,
            end,
            type_filter,
            groups_only,
        }
    }

    /// The grouping whose handle range contains `handle`, if any.
    pub fn grouping_containing(&self, handle: Handle) -> Option<&AttributeGrouping> {
        let idx = self.groupings.partition_point(|g| g.start_handle <= handle);
        let grouping = self.groupings[..idx].last()?;
        grouping.contains(handle).then_some(grouping)
    }

    fn arena_index(&self, handle: Handle) -> usize {
        self.attributes.partition_point(|a| a.handle() < handle)
    }

    fn check_queued_write(
        &self,
        entry: &QueuedWrite,
        security: &SecurityProperties,
    ) -> Result<Uuid, AttErrorCode> {
        let attr = self
            .find_attribute(entry.handle())
            .ok_or(AttErrorCode::InvalidHandle)?;
        if entry.value().len() > MAX_ATTRIBUTE_VALUE_LENGTH {
            return Err(AttErrorCode::InvalidAttributeValueLength);
        }
        if !attr.write_reqs().allowed() || !attr.is_dynamic() {
            return Err(AttErrorCode::WriteNotPermitted);
        }
        check_write_permissions(attr.write_reqs(), security)?;
        Ok(attr.att_type().clone())
    }
}

/// Iterator over database attributes. Holding one borrows the database
/// guard, so any mutation first requires dropping it.
pub struct AttrIter<'a> {
    groupings: &'a [AttributeGrouping],
    attributes: &'a [Attribute],
    grp_idx: usize,
    offset: usize,
    start: Handle,
    end: Handle,
    type_filter: Option<Uuid>,
    groups_only: bool,
}

impl<'a> AttrIter<'a> {
    /// The next matching attribute, or `None` past the end of the range.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Option<&'a Attribute> {
        let groupings: &'a [AttributeGrouping] = self.groupings;
        let attributes: &'a [Attribute] = self.attributes;
        loop {
            let grouping = groupings.get(self.grp_idx)?;
            if grouping.start_handle() > self.end {
                return None;
            }
            let in_play = grouping.complete() && grouping.active();
            let exhausted = self.offset >= grouping.populated() || (self.groups_only && self.offset > 0);
            if !in_play || exhausted {
                self.grp_idx += 1;
                self.offset = 0;
                continue;
            }

            let handle = grouping.start_handle() + self.offset as Handle;
            self.offset += 1;
            if handle > self.end {
                return None;
            }
            if handle < self.start {
                continue;
            }

            let base = attributes.partition_point(|a| a.handle() < grouping.start_handle());
            let attr = &attributes[base + (handle - grouping.start_handle()) as usize];
            if let Some(filter) = &self.type_filter {
                if attr.att_type() != filter {
                    continue;
                }
            }
            return Some(attr);
        }
    }
}

/// A shared attribute database.
///
/// Shared between the local service manager and the per-connection servers
/// of one host; all access goes through the async lock. Multiple databases
/// may coexist as long as their handle ranges are kept distinct by the
/// caller.
pub struct AttributeDatabase<M: RawMutex, const MAX: usize> {
    inner: Mutex<M, DatabaseInner<MAX>>,
}

impl<M: RawMutex, const MAX: usize> Default for AttributeDatabase<M, MAX> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: RawMutex, const MAX: usize> AttributeDatabase<M, MAX> {
    /// A database spanning the full handle range.
    pub const fn new() -> Self {
        Self::with_range(HANDLE_MIN, HANDLE_MAX)
    }

    /// A database spanning `[range_start, range_end]`. This allows an upper
    /// layer to segment the handle space across several databases.
    pub const fn with_range(range_start: Handle, range_end: Handle) -> Self {
        assert!(range_start >= HANDLE_MIN);
        assert!(range_start <= range_end);
        Self {
            inner: Mutex::new(DatabaseInner {
                range_start,
                range_end,
                groupings: Vec::new(),
                attributes: Vec::new(),
            }),
        }
    }

    /// Lock the database for queries or mutation.
    pub async fn lock(&self) -> MutexGuard<'_, M, DatabaseInner<MAX>> {
        self.inner.lock().await
    }

    /// Apply all staged writes in `queue`, in order.
    ///
    /// Each entry is re-checked against the database and the link's *current*
    /// security before it is handed to the handler: the database may have
    /// changed between prepare and execute. The first entry failing such a
    /// check is reported and the remainder of the queue is dropped without
    /// reaching the handler. Entries that pass are all delivered in queue
    /// order; the first error a handler reports wins and later results are
    /// ignored.
    pub async fn execute_write_queue<T: AttrHandler>(
        &self,
        peer: PeerId,
        mut queue: PrepareWriteQueue,
        security: SecurityProperties,
        handler: &mut T,
    ) -> Result<(), (Handle, AttErrorCode)> {
        let mut first_error: Option<(Handle, AttErrorCode)> = None;
        while let Some(entry) = queue.pop_front() {
            let att_type = {
                let inner = self.inner.lock().await;
                match inner.check_queued_write(&entry, &security) {
                    Ok(uuid) => uuid,
                    Err(code) => {
                        warn!(
                            "[att] execute write aborted at handle {}: {:?}",
                            entry.handle(),
                            code
                        );
                        return Err(first_error.unwrap_or((entry.handle(), code)));
                    }
                }
            };
            trace!(
                "[att] committing queued write for {} at handle {}",
                peer.0,
                entry.handle()
            );
            let result = handler
                .write(
                    &att_type,
                    entry.handle(),
                    entry.offset(),
                    entry.value(),
                    WriteKind::Request,
                )
                .await;
            if let Err(code) = result {
                if first_error.is_none() {
                    first_error = Some((entry.handle(), code));
                }
            }
        }
        match first_error {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }
}
