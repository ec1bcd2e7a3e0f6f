use std::{collections::HashMap, ptr::NonNull};

use ahash::RandomState;
use log::trace;

use crate::{
    Footprint, InterfaceInfo, ObjectRef, SlotBitmap, Tracer, TypeDescriptor,
    TypeEntry, TypeHandle, TypeId, find_placement,
};

// Window layout, relative to the anchor slot `a`:
//
//   a + iid       dispatch pointer for interface `iid`
//   a             type id
//   a - 1         instance size
//   a - 2         (classes << 16) | interfaces | USED_SLOT
//   a - 3         *const TypeEntry
//   a - 4 ..      interface ids, then class ids (parent first)
const SIZE_SLOT: usize = 1;
const COUNTS_SLOT: usize = 2;
const ENTRY_SLOT: usize = 3;
const LISTS_SLOT: usize = 4;

/// Fixed metadata slots of every window, anchor included.
pub const BASE_SLOTS: usize = 4;

const USED_SLOT: usize = 0x8000;
const INTERFACE_COUNT_MASK: usize = 0x7FFF;
const CLASS_COUNT_MAX: usize = 0xFFFF;

const WORD: usize = size_of::<usize>();

#[inline(always)]
fn encode_id(id: TypeId) -> usize {
    id.0 as isize as usize
}

#[inline(always)]
fn decode_id(slot: usize) -> TypeId {
    TypeId(slot as isize as i32)
}

/// Shared table of pointer sized slots holding one window per registered
/// type, packed so that windows interleave without sharing occupied slots.
pub struct InterfaceMap {
    table: Box<[usize]>,
    occupied: SlotBitmap,
    anchors: SlotBitmap,
    next_free: usize,
    last_anchor: Option<usize>,
    next_interface_id: i32,
    next_object_id: i32,
    reserved_interface_ids: Vec<i32>,
    reserved_object_ids: Vec<i32>,
    entries: Vec<Box<TypeEntry>>,
    by_id: HashMap<TypeId, TypeHandle, RandomState>,
}

impl InterfaceMap {
    pub fn new(slots: usize, type_capacity: usize) -> Self {
        Self {
            table: vec![0; slots].into_boxed_slice(),
            occupied: SlotBitmap::new(slots),
            anchors: SlotBitmap::new(slots),
            next_free: 0,
            last_anchor: None,
            next_interface_id: 1,
            next_object_id: -1,
            reserved_interface_ids: Vec::new(),
            reserved_object_ids: Vec::new(),
            entries: Vec::with_capacity(type_capacity),
            by_id: HashMap::with_capacity_and_hasher(type_capacity, RandomState::new()),
        }
    }

    /// Table length in slots.
    pub fn slot_count(&self) -> usize {
        self.table.len()
    }

    pub fn type_count(&self) -> usize {
        self.entries.len()
    }

    pub fn used_slots(&self) -> usize {
        self.occupied.count()
    }

    // ── Registration ──

    /// Registers the root object type (id 0). It has no interfaces and no
    /// parent.
    pub fn register_root(&mut self, descriptor: TypeDescriptor) -> TypeHandle {
        assert!(
            !self.by_id.contains_key(&TypeId::OBJECT),
            "root object type registered twice"
        );
        self.create_window(TypeId::OBJECT, descriptor, &[], None)
    }

    pub fn register_interface(
        &mut self,
        descriptor: TypeDescriptor,
        bases: &[InterfaceInfo],
    ) -> TypeHandle {
        let id = self.allocate_interface_id();
        self.create_window(id, descriptor, bases, None)
    }

    pub fn register_interface_static(
        &mut self,
        id: TypeId,
        descriptor: TypeDescriptor,
        bases: &[InterfaceInfo],
    ) -> TypeHandle {
        assert!(id.is_interface(), "interface id {id} must be positive");
        self.claim_static(id);
        self.create_window(id, descriptor, bases, None)
    }

    /// Registers a class. Interfaces of `parent` that are not listed in
    /// `interfaces` are carried over with the parent's dispatch pointers.
    pub fn register_object(
        &mut self,
        descriptor: TypeDescriptor,
        interfaces: &[InterfaceInfo],
        parent: Option<TypeHandle>,
    ) -> TypeHandle {
        let id = self.allocate_object_id();
        self.create_window(id, descriptor, interfaces, parent)
    }

    pub fn register_object_static(
        &mut self,
        id: TypeId,
        descriptor: TypeDescriptor,
        interfaces: &[InterfaceInfo],
        parent: Option<TypeHandle>,
    ) -> TypeHandle {
        assert!(id.0 < 0, "class id {id} must be negative");
        self.claim_static(id);
        self.create_window(id, descriptor, interfaces, parent)
    }

    /// Keeps the dynamic interface counter away from `id`.
    pub fn reserve_interface_id(&mut self, id: TypeId) {
        assert!(id.is_interface(), "interface id {id} must be positive");
        if !self.reserved_interface_ids.contains(&id.0) {
            self.reserved_interface_ids.push(id.0);
        }
    }

    /// Keeps the dynamic class counter away from `id`.
    pub fn reserve_object_id(&mut self, id: TypeId) {
        assert!(id.0 < 0, "class id {id} must be negative");
        if !self.reserved_object_ids.contains(&id.0) {
            self.reserved_object_ids.push(id.0);
        }
    }

    fn claim_static(&mut self, id: TypeId) {
        assert!(
            !self.by_id.contains_key(&id),
            "static type id {id} registered twice"
        );
        if id.is_interface() {
            self.reserve_interface_id(id);
        } else {
            self.reserve_object_id(id);
        }
    }

    fn allocate_interface_id(&mut self) -> TypeId {
        let mut candidate = self.next_interface_id;
        let reserved = &mut self.reserved_interface_ids;
        reserved.retain(|&id| id >= candidate);
        while reserved.contains(&candidate) {
            candidate += 1;
        }
        reserved.retain(|&id| id > candidate);
        self.next_interface_id = candidate + 1;
        TypeId(candidate)
    }

    fn allocate_object_id(&mut self) -> TypeId {
        let mut candidate = self.next_object_id;
        let reserved = &mut self.reserved_object_ids;
        reserved.retain(|&id| id <= candidate);
        while reserved.contains(&candidate) {
            candidate -= 1;
        }
        reserved.retain(|&id| id < candidate);
        self.next_object_id = candidate - 1;
        TypeId(candidate)
    }

    fn create_window(
        &mut self,
        id: TypeId,
        descriptor: TypeDescriptor,
        own: &[InterfaceInfo],
        parent: Option<TypeHandle>,
    ) -> TypeHandle {
        assert!(
            !descriptor.is_dynamic() || descriptor.variable_size.is_some(),
            "variable sized type {} has no size query",
            descriptor.name
        );

        let mut interfaces: Vec<(TypeId, usize)> = Vec::with_capacity(own.len());
        for info in own {
            assert!(info.id.is_interface(), "{} is not an interface id", info.id);
            if !interfaces.iter().any(|&(iid, _)| iid == info.id) {
                let dispatch = info.dispatch.map_or(0, |p| p.as_ptr() as usize);
                interfaces.push((info.id, dispatch));
            }
        }

        let mut classes = Vec::new();
        if let Some(parent) = parent {
            classes.push(parent.id);
            classes.extend(self.class_ids(parent));
            for iid in self.interface_ids(parent) {
                if !interfaces.iter().any(|&(own, _)| own == iid) {
                    interfaces.push((iid, self.table[parent.anchor + iid.0 as usize]));
                }
            }
        }
        assert!(interfaces.len() <= INTERFACE_COUNT_MASK && classes.len() <= CLASS_COUNT_MAX);

        let footprint = Footprint {
            back_fill: BASE_SLOTS + interfaces.len() + classes.len(),
            sparse: interfaces.iter().map(|&(iid, _)| iid.0 as usize).collect(),
        };
        let Some(start) = find_placement(&self.occupied, self.next_free, &footprint) else {
            panic!(
                "interface map is full: no room for {} in {} slots",
                descriptor.name,
                self.table.len()
            );
        };

        let anchor = footprint.anchor(start);
        for slot in footprint.slots(start) {
            self.occupied.set(slot);
        }
        self.anchors.set(anchor);

        let handle = TypeHandle { id, anchor };
        let entry = Box::new(TypeEntry::new(descriptor, handle));

        let table = &mut self.table;
        table[anchor] = encode_id(id);
        table[anchor - SIZE_SLOT] = entry.descriptor.size;
        table[anchor - COUNTS_SLOT] = (classes.len() << 16) | interfaces.len() | USED_SLOT;
        table[anchor - ENTRY_SLOT] = &*entry as *const TypeEntry as usize;
        for (i, &(iid, _)) in interfaces.iter().enumerate() {
            table[anchor - LISTS_SLOT - i] = encode_id(iid);
        }
        for (i, &cid) in classes.iter().enumerate() {
            table[anchor - LISTS_SLOT - interfaces.len() - i] = encode_id(cid);
        }
        for &(iid, dispatch) in &interfaces {
            table[anchor + iid.0 as usize] = dispatch;
        }

        self.next_free = self
            .occupied
            .first_clear_from(self.next_free)
            .unwrap_or(self.table.len());
        self.last_anchor = Some(self.last_anchor.map_or(anchor, |last| last.max(anchor)));

        trace!(
            "registered {} as {id} at slot {anchor} ({} interfaces, {} classes)",
            entry.descriptor.name,
            interfaces.len(),
            classes.len()
        );

        self.entries.push(entry);
        self.by_id.insert(id, handle);
        handle
    }

    // ── Queries ──

    pub fn lookup(&self, id: TypeId) -> Option<TypeHandle> {
        self.by_id.get(&id).copied()
    }

    /// Handle of the window anchored at `anchor`, if there is one.
    pub fn handle_at(&self, anchor: usize) -> Option<TypeHandle> {
        self.anchors.is_set(anchor).then(|| TypeHandle {
            id: decode_id(self.table[anchor]),
            anchor,
        })
    }

    /// Address stored in object headers for instances of `handle`.
    #[inline(always)]
    pub fn map_ptr(&self, handle: TypeHandle) -> *const usize {
        &self.table[handle.anchor]
    }

    /// Resolves a map pointer. Anything that is not exactly an anchor slot
    /// between the table start and the last registered anchor is rejected.
    #[inline]
    pub fn handle_for_map(&self, map: *const usize) -> Option<TypeHandle> {
        let base = self.table.as_ptr() as usize;
        let addr = map as usize;
        let last = self.last_anchor?;
        if addr < base || addr > base + last * WORD || (addr - base) % WORD != 0 {
            return None;
        }
        self.handle_at((addr - base) / WORD)
    }

    #[inline(always)]
    pub fn contains_map(&self, map: *const usize) -> bool {
        self.handle_for_map(map).is_some()
    }

    /// Handle of the object's type. Panics if its header is corrupt.
    #[inline]
    pub fn handle_of(&self, obj: ObjectRef) -> TypeHandle {
        let map = obj.header().map();
        match self.handle_for_map(map) {
            Some(handle) => handle,
            None => panic!("object {obj:?} has a corrupt map pointer {map:p}"),
        }
    }

    #[inline(always)]
    pub fn entry(&self, handle: TypeHandle) -> &TypeEntry {
        let ptr = self.table[handle.anchor - ENTRY_SLOT] as *const TypeEntry;
        // SAFETY: written at registration, entries are boxed and never removed
        unsafe { &*ptr }
    }

    pub fn entries(&self) -> impl Iterator<Item = &TypeEntry> + '_ {
        self.entries.iter().map(|entry| &**entry)
    }

    /// Fixed instance size stored in the window.
    #[inline(always)]
    pub fn size(&self, handle: TypeHandle) -> usize {
        self.table[handle.anchor - SIZE_SLOT]
    }

    /// Current size of `obj`, asking the type for variable sized objects.
    pub fn object_size(&self, obj: ObjectRef) -> usize {
        let handle = self.handle_of(obj);
        if !obj.header().has_dynamic_size() {
            return self.size(handle);
        }
        let entry = self.entry(handle);
        match entry.descriptor.variable_size {
            // SAFETY: the type registered this query for its own instances
            Some(size) => unsafe { size(obj) },
            None => panic!("{} instance flagged dynamic without a size query", entry.descriptor.name),
        }
    }

    #[inline(always)]
    fn counts(&self, handle: TypeHandle) -> (usize, usize) {
        let packed = self.table[handle.anchor - COUNTS_SLOT];
        debug_assert!(packed & USED_SLOT != 0);
        (packed & INTERFACE_COUNT_MASK, packed >> 16)
    }

    pub fn interface_ids(&self, handle: TypeHandle) -> impl Iterator<Item = TypeId> + '_ {
        let (interfaces, _) = self.counts(handle);
        // the root window sits below LISTS_SLOT, only index when non empty
        (0..interfaces).map(move |i| decode_id(self.table[handle.anchor - LISTS_SLOT - i]))
    }

    /// Parent id first, then the parent's own chain.
    pub fn class_ids(&self, handle: TypeHandle) -> impl Iterator<Item = TypeId> + '_ {
        let (interfaces, classes) = self.counts(handle);
        (0..classes).map(move |i| {
            decode_id(self.table[handle.anchor - LISTS_SLOT - interfaces - i])
        })
    }

    pub fn implements(&self, handle: TypeHandle, iid: TypeId) -> bool {
        self.interface_ids(handle).any(|id| id == iid)
    }

    /// Is-a test behind every cast.
    pub fn is_a(&self, handle: TypeHandle, target: TypeId) -> bool {
        if target.is_interface() {
            return self.implements(handle, target);
        }
        handle.id == target
            || self.class_ids(handle).any(|id| id == target)
            || target == TypeId::OBJECT
    }

    /// Raw dispatch slot read. Only meaningful when `handle` implements
    /// `iid`.
    #[inline(always)]
    pub fn dispatch(&self, handle: TypeHandle, iid: TypeId) -> Option<NonNull<()>> {
        debug_assert!(self.implements(handle, iid));
        let slot = self.table.get(handle.anchor + iid.0 as usize)?;
        NonNull::new(*slot as *mut ())
    }

    /// Marks every reflection object created so far.
    pub fn trace_permanent(&self, tracer: &mut Tracer<'_>) {
        for entry in self.entries() {
            tracer.trace(entry.type_object());
        }
    }
}

impl std::fmt::Debug for InterfaceMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterfaceMap")
            .field("slots", &self.table.len())
            .field("used", &self.used_slots())
            .field("types", &self.entries.len())
            .field("next_free", &self.next_free)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static WRAP_A: u64 = 1;
    static WRAP_B: u64 = 2;

    fn map_with_root() -> (InterfaceMap, TypeHandle) {
        let mut map = InterfaceMap::new(256, 16);
        let root = map.register_root(TypeDescriptor::new("Object", 0));
        (map, root)
    }

    fn class(name: &'static str) -> TypeDescriptor {
        TypeDescriptor::new(name, 16)
    }

    fn ptr_of(value: &'static u64) -> NonNull<()> {
        NonNull::from(value).cast()
    }

    #[test]
    fn root_window_sits_at_table_start() {
        let (map, root) = map_with_root();
        assert_eq!(root.id(), TypeId::OBJECT);
        assert_eq!(root.anchor(), BASE_SLOTS - 1);
        assert_eq!(map.used_slots(), BASE_SLOTS);
        assert_eq!(map.handle_for_map(map.map_ptr(root)), Some(root));
        assert_eq!(map.size(root), crate::HEADER_SIZE);
    }

    #[test]
    fn root_window_has_empty_lists() {
        let (mut map, root) = map_with_root();
        assert_eq!(map.interface_ids(root).count(), 0);
        assert_eq!(map.class_ids(root).count(), 0);
        assert!(map.is_a(root, TypeId::OBJECT));

        let child = map.register_object(class("Child"), &[], Some(root));
        assert_eq!(map.class_ids(child).collect::<Vec<_>>(), vec![TypeId::OBJECT]);
    }

    #[test]
    fn ids_count_away_from_zero() {
        let (mut map, _) = map_with_root();
        let i1 = map.register_interface(TypeDescriptor::interface("I1"), &[]);
        let i2 = map.register_interface(TypeDescriptor::interface("I2"), &[]);
        let c1 = map.register_object(class("C1"), &[], None);
        let c2 = map.register_object(class("C2"), &[], None);
        assert_eq!((i1.id(), i2.id()), (TypeId(1), TypeId(2)));
        assert_eq!((c1.id(), c2.id()), (TypeId(-1), TypeId(-2)));
    }

    #[test]
    fn reserved_ids_are_skipped_and_pruned() {
        let (mut map, _) = map_with_root();
        map.reserve_interface_id(TypeId(1));
        map.reserve_interface_id(TypeId(2));
        map.reserve_interface_id(TypeId(10));
        map.reserve_object_id(TypeId(-1));

        let i = map.register_interface(TypeDescriptor::interface("I"), &[]);
        assert_eq!(i.id(), TypeId(3));
        assert_eq!(map.reserved_interface_ids, vec![10]);

        let fixed = map.register_interface_static(TypeId(2), TypeDescriptor::interface("Fixed"), &[]);
        assert_eq!(fixed.id(), TypeId(2));
        assert_eq!(map.lookup(TypeId(2)), Some(fixed));

        let c = map.register_object(class("C"), &[], None);
        assert_eq!(c.id(), TypeId(-2));
        assert!(map.reserved_object_ids.is_empty());
    }

    #[test]
    #[should_panic(expected = "registered twice")]
    fn duplicate_static_id_is_fatal() {
        let (mut map, _) = map_with_root();
        map.register_object_static(TypeId(-7), class("A"), &[], None);
        map.register_object_static(TypeId(-7), class("B"), &[], None);
    }

    #[test]
    fn windows_never_share_occupied_slots() {
        let (mut map, root) = map_with_root();
        let i1 = map.register_interface(TypeDescriptor::interface("I1"), &[]);
        let i2 = map.register_interface(TypeDescriptor::interface("I2"), &[]);
        let i3 = map.register_interface(TypeDescriptor::interface("I3"), &[]);
        let mut expected = BASE_SLOTS * 4;

        let shapes: [&[TypeHandle]; 4] = [&[i1], &[i2], &[i1, i3], &[i2, i3]];
        for (n, ifaces) in shapes.into_iter().enumerate() {
            let infos: Vec<_> = ifaces.iter().map(|h| InterfaceInfo::new(h.id())).collect();
            map.register_object(class(["A", "B", "C", "D"][n]), &infos, Some(root));
            // base slots, one class id, one list entry and one dispatch slot per interface
            expected += BASE_SLOTS + 1 + 2 * ifaces.len();
        }
        assert_eq!(map.used_slots(), expected);
    }

    #[test]
    fn interface_queries() {
        let (mut map, _) = map_with_root();
        let i1 = map.register_interface(TypeDescriptor::interface("I1"), &[]);
        let i2 = map.register_interface(TypeDescriptor::interface("I2"), &[]);
        let t1 = map.register_object(
            class("T1"),
            &[InterfaceInfo { id: i1.id(), dispatch: Some(ptr_of(&WRAP_A)) }],
            None,
        );
        let t2 = map.register_object(
            class("T2"),
            &[
                InterfaceInfo::new(i1.id()),
                InterfaceInfo { id: i2.id(), dispatch: Some(ptr_of(&WRAP_B)) },
            ],
            None,
        );

        assert!(map.is_a(t2, i2.id()));
        assert!(!map.is_a(t1, i2.id()));
        assert!(map.is_a(t1, i1.id()));
        assert!(map.is_a(t1, t1.id()));
        assert!(!map.is_a(t1, t2.id()));
        assert!(map.is_a(t1, TypeId::OBJECT));

        assert_eq!(map.dispatch(t1, i1.id()), Some(ptr_of(&WRAP_A)));
        assert_eq!(map.dispatch(t2, i2.id()), Some(ptr_of(&WRAP_B)));
        assert_eq!(map.dispatch(t2, i1.id()), None);
    }

    #[test]
    fn derived_types_inherit_chain_and_interfaces() {
        let (mut map, root) = map_with_root();
        let i1 = map.register_interface(TypeDescriptor::interface("I1"), &[]);
        let base = map.register_object(
            class("Base"),
            &[InterfaceInfo { id: i1.id(), dispatch: Some(ptr_of(&WRAP_A)) }],
            Some(root),
        );
        let derived = map.register_object(class("Derived"), &[], Some(base));
        let leaf = map.register_object(class("Leaf"), &[], Some(derived));

        assert_eq!(
            map.class_ids(leaf).collect::<Vec<_>>(),
            vec![derived.id(), base.id(), TypeId::OBJECT]
        );
        assert!(map.is_a(leaf, base.id()));
        assert!(map.is_a(derived, base.id()));
        assert!(!map.is_a(base, derived.id()));

        assert!(map.implements(leaf, i1.id()));
        assert_eq!(map.dispatch(leaf, i1.id()), Some(ptr_of(&WRAP_A)));
    }

    #[test]
    fn map_pointers_must_hit_an_anchor() {
        let (mut map, _) = map_with_root();
        let c = map.register_object(class("C"), &[], None);
        let anchor = map.map_ptr(c);
        assert!(map.contains_map(anchor));
        // SAFETY: one slot below the anchor is still inside the table
        assert!(!map.contains_map(unsafe { anchor.sub(1) }));
        assert!(!map.contains_map((anchor as usize + 1) as *const usize));
        assert!(!map.contains_map(std::ptr::null()));
        let stray = 0usize;
        assert!(!map.contains_map(&stray));
    }

    #[test]
    fn entries_are_reachable_through_the_window() {
        let (mut map, _) = map_with_root();
        let c = map.register_object(class("Widget"), &[], None);
        let entry = map.entry(c);
        assert_eq!(entry.descriptor.name, "Widget");
        assert_eq!(entry.handle, c);
        assert_eq!(map.entries().count(), 2);
    }

    #[test]
    #[should_panic(expected = "interface map is full")]
    fn exhausting_the_table_is_fatal() {
        let mut map = InterfaceMap::new(12, 4);
        map.register_root(TypeDescriptor::new("Object", 0));
        for _ in 0..4 {
            map.register_object(class("Filler"), &[], None);
        }
    }
}
