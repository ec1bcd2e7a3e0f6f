use std::{borrow::Cow, cell::Cell, fmt, ptr::NonNull};

use crate::{HEADER_SIZE, ObjectFlags, ObjectRef, Tracer};

/// Numeric type identity. `0` is the root object type, interfaces are
/// strictly positive, classes are negative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeId(pub i32);

impl TypeId {
    pub const OBJECT: TypeId = TypeId(0);

    #[inline(always)]
    pub fn is_interface(self) -> bool {
        self.0 > 0
    }
}

impl fmt::Display for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A registered type: its id and the anchor slot of its window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeHandle {
    pub(crate) id: TypeId,
    pub(crate) anchor: usize,
}

impl TypeHandle {
    #[inline(always)]
    pub fn id(self) -> TypeId {
        self.id
    }

    #[inline(always)]
    pub fn anchor(self) -> usize {
        self.anchor
    }
}

/// One implemented interface and the dispatch wrapper serving it for the
/// registering type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceInfo {
    pub id: TypeId,
    pub dispatch: Option<NonNull<()>>,
}

impl InterfaceInfo {
    pub fn new(id: TypeId) -> Self {
        Self { id, dispatch: None }
    }

    pub fn with_dispatch<T>(id: TypeId, dispatch: &'static T) -> Self {
        Self {
            id,
            dispatch: Some(NonNull::from(dispatch).cast()),
        }
    }
}

/// Pushes every managed reference held by the object into the tracer.
pub type TraceFn = unsafe fn(obj: ObjectRef, tracer: &mut Tracer<'_>);
/// Runs when the object is found dead, before its memory is reused.
pub type FinalizeFn = unsafe fn(obj: ObjectRef);
/// Current size in bytes, header included, of a variable sized object.
pub type SizeFn = unsafe fn(obj: ObjectRef) -> usize;

/// Everything the runtime needs to know about a type besides its window.
#[derive(Clone)]
pub struct TypeDescriptor {
    pub name: Cow<'static, str>,
    /// instance size in bytes, header included
    pub size: usize,
    pub flags: ObjectFlags,
    pub trace: Option<TraceFn>,
    pub finalize: Option<FinalizeFn>,
    pub variable_size: Option<SizeFn>,
}

impl TypeDescriptor {
    /// A fixed size class with `payload` bytes after the header.
    pub fn new(name: impl Into<Cow<'static, str>>, payload: usize) -> Self {
        Self {
            name: name.into(),
            size: HEADER_SIZE + payload,
            flags: ObjectFlags::empty(),
            trace: None,
            finalize: None,
            variable_size: None,
        }
    }

    /// Interfaces have no instances.
    pub fn interface(name: impl Into<Cow<'static, str>>) -> Self {
        Self {
            size: 0,
            ..Self::new(name, 0)
        }
    }

    pub fn with_trace(mut self, trace: TraceFn) -> Self {
        self.trace = Some(trace);
        self
    }

    pub fn with_finalizer(mut self, finalize: FinalizeFn) -> Self {
        self.finalize = Some(finalize);
        self
    }

    /// Array-like type whose instances report their own size.
    pub fn array(mut self, size: SizeFn) -> Self {
        self.flags |= ObjectFlags::ARRAY;
        self.variable_size = Some(size);
        self
    }

    /// String-like type whose instances report their own size.
    pub fn string(mut self, size: SizeFn) -> Self {
        self.flags |= ObjectFlags::STRING;
        self.variable_size = Some(size);
        self
    }

    /// Instances are never collected, except by the final teardown cycle.
    pub fn fixed(mut self) -> Self {
        self.flags |= ObjectFlags::FIXED;
        self
    }

    pub fn is_dynamic(&self) -> bool {
        self.flags.intersects(ObjectFlags::DYNAMIC)
    }
}

impl fmt::Debug for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeDescriptor")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("flags", &self.flags)
            .field("trace", &self.trace.is_some())
            .field("finalize", &self.finalize.is_some())
            .finish()
    }
}

/// Per type record owned by the interface map. Its address is stored in the
/// window, so it never moves once registered.
#[derive(Debug)]
pub struct TypeEntry {
    pub descriptor: TypeDescriptor,
    pub handle: TypeHandle,
    pub(crate) type_object: Cell<Option<ObjectRef>>,
}

impl TypeEntry {
    pub(crate) fn new(descriptor: TypeDescriptor, handle: TypeHandle) -> Self {
        Self {
            descriptor,
            handle,
            type_object: Cell::new(None),
        }
    }

    /// Reflection object, if one has been created.
    pub fn type_object(&self) -> Option<ObjectRef> {
        self.type_object.get()
    }
}
