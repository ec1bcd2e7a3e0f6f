use std::{sync::Arc, thread::ThreadId};

use log::warn;
use parking_lot::Mutex;

use crate::{
    ALIGNMENT, Arena, FREE_MARKER, HEADER_SIZE, InterfaceMap, ObjectRef, Tracer,
    is_aligned,
};

/// Host supplied precise roots: globals, statics, handles kept elsewhere.
pub trait RootProvider {
    fn visit_roots(&mut self, tracer: &mut Tracer<'_>);
}

impl<F> RootProvider for F
where
    F: FnMut(&mut Tracer<'_>),
{
    fn visit_roots(&mut self, tracer: &mut Tracer<'_>) {
        self(tracer)
    }
}

/// Supplies the words the conservative scan inspects.
pub trait StackSource {
    fn scan(&mut self, visit: &mut dyn FnMut(usize));
}

/// Rule deciding whether a stack word is treated as an object reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConservativePolicy {
    /// distance subtracted from a word that failed validation before it is
    /// tried a second time as a pointer into an object
    pub interior_offset: usize,
    pub retry_interior: bool,
}

impl Default for ConservativePolicy {
    fn default() -> Self {
        Self {
            interior_offset: HEADER_SIZE,
            retry_interior: true,
        }
    }
}

enum Candidate {
    Object(ObjectRef),
    /// outside the used arena range, no point looking around it
    Outside,
    Implausible,
}

impl ConservativePolicy {
    /// Resolves a candidate word to the object it most plausibly points at.
    pub fn resolve(&self, word: usize, arena: &Arena, types: &InterfaceMap) -> Option<ObjectRef> {
        match Self::validate(word, arena, types) {
            Candidate::Object(obj) => Some(obj),
            Candidate::Outside => None,
            Candidate::Implausible if self.retry_interior => {
                let inner = word.wrapping_sub(self.interior_offset) & !(ALIGNMENT - 1);
                match Self::validate(inner, arena, types) {
                    Candidate::Object(obj) => Some(obj),
                    _ => None,
                }
            }
            Candidate::Implausible => None,
        }
    }

    fn validate(word: usize, arena: &Arena, types: &InterfaceMap) -> Candidate {
        if !is_aligned(word) {
            return Candidate::Implausible;
        }
        if !arena.contains_allocated(word) {
            return Candidate::Outside;
        }
        // SAFETY: aligned and inside the used range, so a whole word is mapped
        let first = unsafe { (word as *const usize).read() };
        if first == FREE_MARKER || !types.contains_map(first as *const usize) {
            return Candidate::Implausible;
        }
        // SAFETY: the word points at something carrying a valid map pointer
        match unsafe { ObjectRef::from_addr(word) } {
            Some(obj) => Candidate::Object(obj),
            None => Candidate::Outside,
        }
    }
}

/// Explicit root stack maintained by the host. Cloning shares the stack, so
/// one clone can live in the runtime hooks while the host pushes and pops
/// through another.
#[derive(Debug, Clone, Default)]
pub struct ShadowStack {
    slots: Arc<Mutex<Vec<usize>>>,
}

impl ShadowStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pushes a reference, returns its slot index.
    pub fn push(&self, obj: ObjectRef) -> usize {
        self.push_word(obj.addr())
    }

    /// Pushes an arbitrary word; it is validated like any stack word.
    pub fn push_word(&self, word: usize) -> usize {
        let mut slots = self.slots.lock();
        slots.push(word);
        slots.len() - 1
    }

    pub fn pop(&self) -> Option<usize> {
        self.slots.lock().pop()
    }

    pub fn set(&self, index: usize, obj: Option<ObjectRef>) {
        self.slots.lock()[index] = obj.map_or(0, ObjectRef::addr);
    }

    pub fn word(&self, index: usize) -> usize {
        self.slots.lock()[index]
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }

    pub fn truncate(&self, depth: usize) {
        self.slots.lock().truncate(depth);
    }

    /// Scope guard; everything pushed after this call is popped when the
    /// frame drops.
    pub fn frame(&self) -> ShadowFrame {
        ShadowFrame {
            stack: self.clone(),
            depth: self.len(),
        }
    }
}

impl StackSource for ShadowStack {
    fn scan(&mut self, visit: &mut dyn FnMut(usize)) {
        for &word in self.slots.lock().iter() {
            visit(word);
        }
    }
}

pub struct ShadowFrame {
    stack: ShadowStack,
    depth: usize,
}

impl ShadowFrame {
    pub fn push(&self, obj: ObjectRef) -> usize {
        self.stack.push(obj)
    }
}

impl Drop for ShadowFrame {
    fn drop(&mut self) {
        self.stack.truncate(self.depth);
    }
}

/// Scans the native call stack between the collecting frame and a top
/// recorded by [`NativeStack::with_top`]. Assumes a downward growing stack
/// and only scans on the thread that recorded the top; registers are not
/// inspected, so references must be spilled (e.g. through
/// `std::hint::black_box(&obj)`) to be seen.
#[derive(Debug, Clone, Copy)]
pub struct NativeStack {
    top: usize,
    thread: ThreadId,
}

impl NativeStack {
    /// Records the current frame as top of stack and runs `f` below it.
    #[inline(never)]
    pub fn with_top<R>(f: impl FnOnce(NativeStack) -> R) -> R {
        let anchor = 0usize;
        let top = std::hint::black_box(&anchor) as *const usize as usize;
        let stack = NativeStack {
            top,
            thread: std::thread::current().id(),
        };
        let result = run_below(f, stack);
        std::hint::black_box(&anchor);
        result
    }

    pub fn top(&self) -> usize {
        self.top
    }
}

// keeps `f`'s locals out of the frame that owns the recorded top
#[inline(never)]
fn run_below<R>(f: impl FnOnce(NativeStack) -> R, stack: NativeStack) -> R {
    f(stack)
}

impl StackSource for NativeStack {
    #[inline(never)]
    fn scan(&mut self, visit: &mut dyn FnMut(usize)) {
        if std::thread::current().id() != self.thread {
            warn!("native stack scanned from a foreign thread, skipping");
            return;
        }
        let here = 0usize;
        let bottom = std::hint::black_box(&here) as *const usize as usize;
        assert!(bottom <= self.top, "top of stack is not set correctly");

        let word = size_of::<usize>();
        let mut cursor = bottom & !(word - 1);
        while cursor < self.top {
            // SAFETY: [bottom, top) is the live part of this thread's stack
            let value = unsafe { std::ptr::read_volatile(cursor as *const usize) };
            visit(value);
            cursor += word;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shadow_frames_pop_on_drop() {
        let stack = ShadowStack::new();
        stack.push_word(16);
        {
            let frame = stack.frame();
            stack.push_word(32);
            stack.push_word(48);
            assert_eq!(stack.len(), 3);
            drop(frame);
        }
        assert_eq!(stack.len(), 1);

        let mut seen = Vec::new();
        stack.clone().scan(&mut |word| seen.push(word));
        assert_eq!(seen, vec![16]);
    }

    #[test]
    fn native_stack_sees_spilled_locals() {
        let marker = 0x5EED_0000usize;
        let found = NativeStack::with_top(|mut stack| {
            let local = std::hint::black_box(marker + 1);
            let slot = &local;
            std::hint::black_box(slot);
            let mut found = false;
            stack.scan(&mut |word| found |= word == marker + 1);
            std::hint::black_box(slot);
            found
        });
        assert!(found);
    }

    #[test]
    fn native_stack_ignores_foreign_threads() {
        let stack = NativeStack::with_top(|stack| stack);
        let count = std::thread::spawn(move || {
            let mut stack = stack;
            let mut count = 0;
            stack.scan(&mut |_| count += 1);
            count
        })
        .join()
        .unwrap();
        assert_eq!(count, 0);
    }
}
