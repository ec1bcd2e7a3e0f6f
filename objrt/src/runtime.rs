use std::{
    alloc::{Layout, alloc, dealloc},
    ptr::NonNull,
};

use log::{debug, warn};

use crate::{
    ALIGNMENT, Arena, Collector, ConservativePolicy, CycleSummary, GcPhase, GcStats,
    HEADER_SIZE, InterfaceInfo, InterfaceMap, MARKER_AT_CREATION, MainBuffer,
    ObjectFlags, ObjectHeader, ObjectRef, RootProvider, RootSet, RuntimeCreateInfo,
    RuntimeSettings, SettingsError, StackSource, Tracer, TypeDescriptor, TypeHandle,
    TypeId, align_up, collector::finalize, is_aligned,
};

pub type AllocateHook = Box<dyn FnMut(usize) -> Option<NonNull<u8>> + Send>;
pub type FreeHook = Box<dyn FnMut(NonNull<u8>, usize) + Send>;
pub type FinalizeHook = Box<dyn FnMut(ObjectRef) + Send>;

/// Host callbacks. Every slot is optional.
#[derive(Default)]
pub struct RuntimeHooks {
    allocate_before_gc: Option<AllocateHook>,
    allocate_after_gc: Option<AllocateHook>,
    free: Option<FreeHook>,
    unmanaged_allocate: Option<AllocateHook>,
    unmanaged_free: Option<FreeHook>,
    roots: Option<Box<dyn RootProvider + Send>>,
    stack: Option<Box<dyn StackSource + Send>>,
    on_finalize: Option<FinalizeHook>,
}

impl RuntimeHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tried when the arena is exhausted, before collecting.
    pub fn allocate_before_gc(
        mut self,
        f: impl FnMut(usize) -> Option<NonNull<u8>> + Send + 'static,
    ) -> Self {
        self.allocate_before_gc = Some(Box::new(f));
        self
    }

    /// Last resort after a collection did not free enough.
    pub fn allocate_after_gc(
        mut self,
        f: impl FnMut(usize) -> Option<NonNull<u8>> + Send + 'static,
    ) -> Self {
        self.allocate_after_gc = Some(Box::new(f));
        self
    }

    /// Releases objects that were allocated by one of the allocate hooks.
    pub fn free(mut self, f: impl FnMut(NonNull<u8>, usize) + Send + 'static) -> Self {
        self.free = Some(Box::new(f));
        self
    }

    pub fn unmanaged_allocate(
        mut self,
        f: impl FnMut(usize) -> Option<NonNull<u8>> + Send + 'static,
    ) -> Self {
        self.unmanaged_allocate = Some(Box::new(f));
        self
    }

    pub fn unmanaged_free(mut self, f: impl FnMut(NonNull<u8>, usize) + Send + 'static) -> Self {
        self.unmanaged_free = Some(Box::new(f));
        self
    }

    pub fn roots(self, f: impl FnMut(&mut Tracer<'_>) + Send + 'static) -> Self {
        self.root_provider(f)
    }

    pub fn root_provider(mut self, provider: impl RootProvider + Send + 'static) -> Self {
        self.roots = Some(Box::new(provider));
        self
    }

    pub fn stack(mut self, stack: impl StackSource + Send + 'static) -> Self {
        self.stack = Some(Box::new(stack));
        self
    }

    /// Called for every object the collector finalizes.
    pub fn on_finalize(mut self, f: impl FnMut(ObjectRef) + Send + 'static) -> Self {
        self.on_finalize = Some(Box::new(f));
        self
    }
}

/// An object viewed through one of its interfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceRef {
    pub object: ObjectRef,
    pub dispatch: Option<NonNull<()>>,
}

const TYPE_OBJECT_PAYLOAD: usize = 16;

/// The managed object runtime: one arena, one interface map and the
/// collector tying them together. Everything runs on the owning thread;
/// allocation may run a full collection before it returns.
pub struct Runtime {
    settings: RuntimeSettings,
    arena: Arena,
    types: InterfaceMap,
    collector: Collector,
    policy: ConservativePolicy,
    hooks: RuntimeHooks,
    object_type: TypeHandle,
    type_type: TypeHandle,
    /// FIXED instances, traced as roots every cycle
    pinned: Vec<ObjectRef>,
    torn_down: bool,
}

impl Runtime {
    pub fn new(mut info: RuntimeCreateInfo, hooks: RuntimeHooks) -> Result<Self, SettingsError> {
        let settings = RuntimeSettings::from_create_info(&info);
        settings.validate()?;

        let buffer = match info.main_buffer.take() {
            Some(buffer) => {
                let addr = buffer.ptr().as_ptr() as usize;
                if !is_aligned(addr) {
                    return Err(SettingsError::MisalignedBuffer(addr));
                }
                buffer
            }
            None => MainBuffer::map(settings.arena_size)
                .ok_or(SettingsError::MapFailed(settings.arena_size))?,
        };
        let arena = Arena::new(buffer, settings.debug_fill);

        let mut types = InterfaceMap::new(
            settings.interface_map_slots,
            settings.initial_type_capacity,
        );
        let object_type = types.register_root(TypeDescriptor::new("Object", 0));
        let type_type = types.register_object(
            TypeDescriptor::new("Type", TYPE_OBJECT_PAYLOAD).fixed(),
            &[],
            Some(object_type),
        );

        debug!(
            "runtime up: {} byte arena, {} interface map slots",
            arena.capacity(),
            settings.interface_map_slots
        );

        Ok(Self {
            policy: ConservativePolicy {
                interior_offset: settings.interior_offset,
                retry_interior: settings.retry_interior,
            },
            settings,
            arena,
            types,
            collector: Collector::new(),
            hooks,
            object_type,
            type_type,
            pinned: Vec::new(),
            torn_down: false,
        })
    }

    pub fn settings(&self) -> &RuntimeSettings {
        &self.settings
    }

    pub fn arena(&self) -> &Arena {
        &self.arena
    }

    pub fn types(&self) -> &InterfaceMap {
        &self.types
    }

    pub fn stats(&self) -> &GcStats {
        self.collector.stats()
    }

    pub fn marker(&self) -> u8 {
        self.collector.marker()
    }

    pub fn phase(&self) -> GcPhase {
        self.collector.phase()
    }

    /// Root of every class hierarchy, id 0.
    pub fn object_type(&self) -> TypeHandle {
        self.object_type
    }

    /// Class of the reflection objects returned by [`Runtime::type_object`].
    pub fn type_type(&self) -> TypeHandle {
        self.type_type
    }

    // ── Registration ──
    //
    // Base types before derived ones, interfaces before their implementors.

    pub fn register_interface(
        &mut self,
        descriptor: TypeDescriptor,
        bases: &[InterfaceInfo],
    ) -> TypeHandle {
        self.types.register_interface(descriptor, bases)
    }

    pub fn register_interface_static(
        &mut self,
        id: TypeId,
        descriptor: TypeDescriptor,
        bases: &[InterfaceInfo],
    ) -> TypeHandle {
        self.types.register_interface_static(id, descriptor, bases)
    }

    /// Registers a class deriving from `parent`, or directly from the root
    /// object type when `parent` is `None`.
    pub fn register_object(
        &mut self,
        descriptor: TypeDescriptor,
        interfaces: &[InterfaceInfo],
        parent: Option<TypeHandle>,
    ) -> TypeHandle {
        let parent = parent.unwrap_or(self.object_type);
        self.types.register_object(descriptor, interfaces, Some(parent))
    }

    pub fn register_object_static(
        &mut self,
        id: TypeId,
        descriptor: TypeDescriptor,
        interfaces: &[InterfaceInfo],
        parent: Option<TypeHandle>,
    ) -> TypeHandle {
        let parent = parent.unwrap_or(self.object_type);
        self.types
            .register_object_static(id, descriptor, interfaces, Some(parent))
    }

    pub fn reserve_interface_id(&mut self, id: TypeId) {
        self.types.reserve_interface_id(id);
    }

    pub fn reserve_object_id(&mut self, id: TypeId) {
        self.types.reserve_object_id(id);
    }

    // ── Allocation ──

    /// Allocates a zeroed instance of a fixed size class.
    pub fn allocate(&mut self, handle: TypeHandle) -> ObjectRef {
        let entry = self.types.entry(handle);
        assert!(
            !entry.descriptor.is_dynamic(),
            "{} is variable sized, use allocate_sized",
            entry.descriptor.name
        );
        assert!(
            !handle.id().is_interface(),
            "cannot instantiate interface {}",
            entry.descriptor.name
        );
        let size = self.types.size(handle);
        self.allocate_object(handle, size)
    }

    /// Allocates a zeroed instance of `size` bytes, header included. The
    /// type's size query must report the same size once the host has
    /// filled in whatever it derives the size from.
    pub fn allocate_sized(&mut self, handle: TypeHandle, size: usize) -> ObjectRef {
        let entry = self.types.entry(handle);
        assert!(
            entry.descriptor.is_dynamic(),
            "{} has a fixed size, use allocate",
            entry.descriptor.name
        );
        self.allocate_object(handle, size.max(HEADER_SIZE))
    }

    fn allocate_object(&mut self, handle: TypeHandle, size: usize) -> ObjectRef {
        let flags = self.types.entry(handle).descriptor.flags
            & (ObjectFlags::DYNAMIC | ObjectFlags::FIXED);
        let map = self.types.map_ptr(handle);
        let ptr = self.allocate_raw(size);
        // SAFETY: ptr is a fresh block of at least `size` bytes
        let obj = unsafe {
            ptr.cast::<ObjectHeader>().write(ObjectHeader::new(map, flags));
            ptr.add(HEADER_SIZE).write_bytes(0, size - HEADER_SIZE);
            ObjectRef::from_raw(ptr)
        };
        self.track_fixed(obj);
        obj
    }

    fn track_fixed(&mut self, obj: ObjectRef) {
        if obj.header().flags().contains(ObjectFlags::FIXED) {
            self.pinned.push(obj);
        }
    }

    /// Arena allocation with the full recovery sequence: before-GC hook,
    /// one collection and retry, after-GC hook. Running out of all of them
    /// is fatal. The caller must write a header before the next collection.
    fn allocate_raw(&mut self, size: usize) -> NonNull<u8> {
        if let Some(ptr) = self.arena.try_allocate(size) {
            return ptr;
        }
        if let Some(hook) = self.hooks.allocate_before_gc.as_mut() {
            if let Some(ptr) = hook(size) {
                warn!("arena exhausted, {size} bytes served by the before-gc hook");
                debug_assert!(is_aligned(ptr.as_ptr() as usize));
                return ptr;
            }
        }

        warn!("arena exhausted allocating {size} bytes, collecting");
        self.collect();
        if let Some(ptr) = self.arena.try_allocate(size) {
            return ptr;
        }
        if let Some(hook) = self.hooks.allocate_after_gc.as_mut() {
            if let Some(ptr) = hook(size) {
                warn!("{size} bytes served by the after-gc hook");
                debug_assert!(is_aligned(ptr.as_ptr() as usize));
                return ptr;
            }
        }
        panic!(
            "out of memory allocating {size} bytes ({} of {} arena bytes in use)",
            self.arena.bump(),
            self.arena.capacity()
        );
    }

    /// Copies `obj` into a fresh object of the same type and size. `obj`
    /// must be rooted, the allocation may collect.
    pub fn memberwise_clone(&mut self, obj: ObjectRef) -> ObjectRef {
        let size = self.types.object_size(obj);
        let ptr = self.allocate_raw(size);
        // SAFETY: both blocks are `size` bytes long and distinct
        unsafe {
            std::ptr::copy_nonoverlapping(obj.as_ptr(), ptr.as_ptr(), size);
            let clone = ObjectRef::from_raw(ptr);
            clone.header().set_mark(MARKER_AT_CREATION);
            self.track_fixed(clone);
            clone
        }
    }

    /// Allocates memory the collector never looks at.
    pub fn unmanaged_allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        if let Some(hook) = self.hooks.unmanaged_allocate.as_mut() {
            return hook(size);
        }
        let layout = Layout::from_size_align(size.max(1), ALIGNMENT).ok()?;
        // SAFETY: layout has non zero size
        NonNull::new(unsafe { alloc(layout) })
    }

    /// # Safety
    /// `ptr` must come from [`Runtime::unmanaged_allocate`] with `size`.
    pub unsafe fn unmanaged_free(&mut self, ptr: NonNull<u8>, size: usize) {
        if let Some(hook) = self.hooks.unmanaged_free.as_mut() {
            hook(ptr, size);
            return;
        }
        if let Ok(layout) = Layout::from_size_align(size.max(1), ALIGNMENT) {
            // SAFETY: same layout as the allocation
            unsafe { dealloc(ptr.as_ptr(), layout) };
        }
    }

    // ── Collection ──

    /// Runs a full stop-the-world cycle.
    pub fn collect(&mut self) -> CycleSummary {
        let RuntimeHooks {
            roots,
            stack,
            on_finalize,
            ..
        } = &mut self.hooks;
        let root_set = RootSet {
            pinned: &self.pinned,
            stack: stack.as_deref_mut(),
            policy: self.policy,
            host: roots.as_deref_mut(),
        };
        self.collector.collect(
            &mut self.arena,
            &self.types,
            Some(root_set),
            &mut |obj| {
                if let Some(hook) = on_finalize.as_mut() {
                    hook(obj);
                }
            },
        )
    }

    /// Finalizes `obj` and releases its memory right away.
    ///
    /// # Safety
    /// Nothing may reference `obj` afterwards.
    pub unsafe fn collect_one(&mut self, obj: ObjectRef) {
        let size = align_up(self.types.object_size(obj));
        if obj.header().flags().contains(ObjectFlags::FIXED) {
            self.pinned.retain(|&pinned| pinned != obj);
        }
        finalize(&self.types, obj);
        if let Some(hook) = self.hooks.on_finalize.as_mut() {
            hook(obj);
        }
        if self.arena.contains(obj.addr()) {
            self.arena.free(obj.as_non_null(), size);
        } else if let Some(free) = self.hooks.free.as_mut() {
            free(obj.as_non_null(), size);
        }
    }

    /// Final cycle: every object is finalized, then the arena is released.
    pub fn teardown(mut self) -> CycleSummary {
        self.shutdown()
    }

    fn shutdown(&mut self) -> CycleSummary {
        // a collection that panicked midway leaves the heap unwalkable
        if self.torn_down || self.collector.phase() != GcPhase::Idle {
            return CycleSummary::default();
        }
        self.torn_down = true;
        let on_finalize = &mut self.hooks.on_finalize;
        let summary = self.collector.collect(&mut self.arena, &self.types, None, &mut |obj| {
            if let Some(hook) = on_finalize.as_mut() {
                hook(obj);
            }
        });
        self.pinned.clear();
        debug!(
            "runtime down after {} collections, {} objects finalized",
            self.collector.stats().collections,
            self.collector.stats().objects_finalized
        );
        summary
    }

    // ── Identity and casts ──

    pub fn type_of(&self, obj: ObjectRef) -> TypeHandle {
        self.types.handle_of(obj)
    }

    pub fn type_id_of(&self, obj: ObjectRef) -> TypeId {
        self.type_of(obj).id()
    }

    /// Current size of `obj` in bytes, header included.
    pub fn size_of(&self, obj: ObjectRef) -> usize {
        self.types.object_size(obj)
    }

    pub fn is_instance(&self, obj: ObjectRef, id: TypeId) -> bool {
        self.types.is_a(self.type_of(obj), id)
    }

    /// `as`-style cast: the same object when it is an instance of `id`.
    pub fn cast(&self, obj: Option<ObjectRef>, id: TypeId) -> Option<ObjectRef> {
        obj.filter(|&obj| self.is_instance(obj, id))
    }

    /// Unconditional cast. A miss is fatal; null passes through.
    pub fn cast_or_panic(&self, obj: Option<ObjectRef>, id: TypeId) -> Option<ObjectRef> {
        let obj = obj?;
        if !self.is_instance(obj, id) {
            let name = &self.types.entry(self.type_of(obj)).descriptor.name;
            panic!("could not cast {name} instance {obj:?} to {id}");
        }
        Some(obj)
    }

    /// Views `obj` through interface `iid`, with the dispatch wrapper the
    /// object's type registered for it.
    pub fn cast_interface(&self, obj: ObjectRef, iid: TypeId) -> Option<InterfaceRef> {
        let handle = self.type_of(obj);
        if !iid.is_interface() || !self.types.implements(handle, iid) {
            return None;
        }
        Some(InterfaceRef {
            object: obj,
            dispatch: self.types.dispatch(handle, iid),
        })
    }

    /// Direct dispatch slot read, for callers that know the type
    /// implements `iid`.
    #[inline(always)]
    pub fn dispatch(&self, obj: ObjectRef, iid: TypeId) -> Option<NonNull<()>> {
        self.types.dispatch(self.type_of(obj), iid)
    }

    /// Reflection object describing `handle`, created on first request and
    /// kept alive for the runtime's lifetime.
    pub fn type_object(&mut self, handle: TypeHandle) -> ObjectRef {
        if let Some(obj) = self.types.entry(handle).type_object() {
            return obj;
        }
        let obj = self.allocate(self.type_type);
        // SAFETY: Type instances carry two words of payload
        unsafe {
            obj.write::<i64>(0, handle.id().0 as i64);
            obj.write::<u64>(8, handle.anchor() as u64);
        }
        self.types.entry(handle).type_object.set(Some(obj));
        obj
    }

    pub fn type_object_of(&mut self, obj: ObjectRef) -> ObjectRef {
        let handle = self.type_of(obj);
        self.type_object(handle)
    }

    /// Type described by a reflection object.
    pub fn described_type(&self, type_object: ObjectRef) -> Option<TypeHandle> {
        if self.type_of(type_object) != self.type_type {
            return None;
        }
        // SAFETY: checked to be a Type instance
        let anchor = unsafe { type_object.read::<u64>(8) } as usize;
        self.types.handle_at(anchor)
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("arena", &self.arena)
            .field("types", &self.types)
            .field("marker", &self.collector.marker())
            .finish()
    }
}
