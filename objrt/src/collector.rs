use std::time::{Duration, Instant};

use log::{debug, trace};

use crate::{
    Arena, Block, ConservativePolicy, InterfaceMap, MARKER_AT_CREATION, NO_BLOCK,
    ObjectFlags, ObjectRef, RootProvider, StackSource, align_up,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcPhase {
    Idle,
    Marking,
    Sweeping,
}

/// Cumulative collector statistics.
#[derive(Debug, Clone, Default)]
pub struct GcStats {
    pub collections: u64,
    pub objects_finalized: u64,
    pub bytes_reclaimed: u64,
    pub permanent_roots_time: Duration,
    pub stack_time: Duration,
    pub host_roots_time: Duration,
    pub sweep_time: Duration,
    pub total_time: Duration,
}

/// Result of a single cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleSummary {
    pub marker: u8,
    pub objects_finalized: usize,
    pub bytes_reclaimed: usize,
}

/// Where a cycle looks for roots. A cycle run without one treats every
/// object as garbage.
pub struct RootSet<'a> {
    /// objects that stay alive regardless of reachability
    pub pinned: &'a [ObjectRef],
    pub stack: Option<&'a mut (dyn StackSource + Send + 'static)>,
    pub policy: ConservativePolicy,
    pub host: Option<&'a mut (dyn RootProvider + Send + 'static)>,
}

/// Marking state handed to trace routines and root providers.
pub struct Tracer<'a> {
    marker: u8,
    worklist: &'a mut Vec<ObjectRef>,
    types: &'a InterfaceMap,
}

impl<'a> Tracer<'a> {
    pub(crate) fn new(marker: u8, worklist: &'a mut Vec<ObjectRef>, types: &'a InterfaceMap) -> Self {
        Self {
            marker,
            worklist,
            types,
        }
    }

    #[inline(always)]
    pub fn marker(&self) -> u8 {
        self.marker
    }

    /// Marks `obj` with the current marker and queues it for scanning. Null
    /// and already marked objects are ignored, so cycles terminate.
    #[inline]
    pub fn trace(&mut self, obj: Option<ObjectRef>) {
        let Some(obj) = obj else {
            return;
        };
        let header = obj.header();
        if header.mark() == self.marker {
            return;
        }
        let map = header.map();
        if !self.types.contains_map(map) {
            panic!("marking {obj:?}: map pointer {map:p} is not a registered type");
        }
        header.set_mark(self.marker);
        self.worklist.push(obj);
    }

    /// Traces the reference stored at `offset` in `obj`'s payload.
    ///
    /// # Safety
    /// `offset` must be a reference field of `obj`.
    #[inline]
    pub unsafe fn trace_field(&mut self, obj: ObjectRef, offset: usize) {
        self.trace(unsafe { obj.read_ref(offset) });
    }

    /// Runs trace routines until everything reachable is marked.
    pub(crate) fn drain(&mut self) {
        while let Some(obj) = self.worklist.pop() {
            let handle = self.types.handle_of(obj);
            if let Some(trace) = self.types.entry(handle).descriptor.trace {
                // SAFETY: the routine was registered for this type
                unsafe { trace(obj, self) };
            }
        }
    }
}

/// Stop-the-world mark and sweep over one arena.
#[derive(Debug)]
pub struct Collector {
    marker: u8,
    phase: GcPhase,
    stats: GcStats,
    worklist: Vec<ObjectRef>,
}

impl Default for Collector {
    fn default() -> Self {
        Self::new()
    }
}

impl Collector {
    pub fn new() -> Self {
        Self {
            marker: MARKER_AT_CREATION,
            phase: GcPhase::Idle,
            stats: GcStats::default(),
            worklist: Vec::with_capacity(256),
        }
    }

    #[inline(always)]
    pub fn marker(&self) -> u8 {
        self.marker
    }

    #[inline(always)]
    pub fn phase(&self) -> GcPhase {
        self.phase
    }

    pub fn stats(&self) -> &GcStats {
        &self.stats
    }

    /// Moves to the next generation, never landing on the value fresh
    /// objects carry.
    pub fn advance_marker(&mut self) -> u8 {
        let mut next = self.marker.wrapping_add(1);
        if next == MARKER_AT_CREATION {
            next = next.wrapping_add(1);
        }
        self.marker = next;
        next
    }

    /// Runs one full cycle. `finalized` is called for every object found
    /// dead, after its type's finalizer.
    pub fn collect(
        &mut self,
        arena: &mut Arena,
        types: &InterfaceMap,
        roots: Option<RootSet<'_>>,
        finalized: &mut dyn FnMut(ObjectRef),
    ) -> CycleSummary {
        assert_eq!(self.phase, GcPhase::Idle, "collection started during a collection");
        let start = Instant::now();

        arena.reconcile_medium();
        let marker = self.advance_marker();
        let teardown = roots.is_none();
        debug!(
            "gc #{} start: marker {marker}, {} bytes in use{}",
            self.stats.collections + 1,
            arena.bump(),
            if teardown { ", final" } else { "" }
        );

        self.phase = GcPhase::Marking;
        if let Some(roots) = roots {
            self.mark(arena, types, roots, marker);
        }

        self.phase = GcPhase::Sweeping;
        let sweep_start = Instant::now();
        let summary = sweep(arena, types, marker, teardown, finalized);
        self.stats.sweep_time += sweep_start.elapsed();
        self.phase = GcPhase::Idle;

        self.stats.collections += 1;
        self.stats.objects_finalized += summary.objects_finalized as u64;
        self.stats.bytes_reclaimed += summary.bytes_reclaimed as u64;
        self.stats.total_time += start.elapsed();

        debug!(
            "gc #{} end: {} objects finalized, {} bytes reclaimed, {} bytes in use",
            self.stats.collections,
            summary.objects_finalized,
            summary.bytes_reclaimed,
            arena.bump()
        );
        summary
    }

    fn mark(&mut self, arena: &Arena, types: &InterfaceMap, roots: RootSet<'_>, marker: u8) {
        let RootSet {
            pinned,
            stack,
            policy,
            host,
        } = roots;
        let mut tracer = Tracer::new(marker, &mut self.worklist, types);

        let phase_start = Instant::now();
        types.trace_permanent(&mut tracer);
        for &obj in pinned {
            tracer.trace(Some(obj));
        }
        tracer.drain();
        self.stats.permanent_roots_time += phase_start.elapsed();

        let phase_start = Instant::now();
        if let Some(stack) = stack {
            stack.scan(&mut |word| {
                if let Some(obj) = policy.resolve(word, arena, types) {
                    trace!("conservative root {obj:?} from word {word:#x}");
                    tracer.trace(Some(obj));
                }
            });
            tracer.drain();
        }
        self.stats.stack_time += phase_start.elapsed();

        let phase_start = Instant::now();
        if let Some(host) = host {
            host.visit_roots(&mut tracer);
            tracer.drain();
        }
        self.stats.host_roots_time += phase_start.elapsed();
    }
}

/// Walks `[0, bump)` finalizing unmarked objects, coalescing free runs into
/// the bins and handing a trailing free run back to the bump pointer.
fn sweep(
    arena: &mut Arena,
    types: &InterfaceMap,
    marker: u8,
    teardown: bool,
    finalized: &mut dyn FnMut(ObjectRef),
) -> CycleSummary {
    arena.clear_bins();

    let mut summary = CycleSummary {
        marker,
        ..Default::default()
    };
    let end = arena.bump();
    let mut offset = 0;
    let mut run_start: Option<usize> = None;

    while offset < end {
        // SAFETY: offset walks block boundaries inside [0, bump)
        let obj = match unsafe { arena.block_at(offset) } {
            Block::Free(block) => {
                // SAFETY: classified as a free header
                let size = unsafe { block.as_ref().size } as usize;
                run_start.get_or_insert(offset);
                offset += size;
                continue;
            }
            Block::Object(obj) => obj,
        };

        let size = align_up(types.object_size(obj));
        let header = obj.header();
        let live = !teardown
            && (header.mark() == marker || header.flags().contains(ObjectFlags::FIXED));

        if live {
            if let Some(start) = run_start.take() {
                arena.free_span(start, offset - start);
            }
        } else {
            if !header.flags().contains(ObjectFlags::COLLECTED) {
                finalize(types, obj);
                finalized(obj);
                summary.objects_finalized += 1;
            }
            summary.bytes_reclaimed += size;
            // from here on the block classifies as free, so it is never
            // finalized a second time
            arena.write_free_header(offset, size, NO_BLOCK);
            run_start.get_or_insert(offset);
        }
        offset += size;
    }
    assert_eq!(offset, end, "sweep walked past the bump pointer");

    if let Some(start) = run_start {
        arena.retract_bump(start);
    }
    summary
}

/// Runs the type's finalizer once and flags the object.
pub(crate) fn finalize(types: &InterfaceMap, obj: ObjectRef) {
    let header = obj.header();
    if header.flags().contains(ObjectFlags::COLLECTED) {
        return;
    }
    let handle = types.handle_of(obj);
    if let Some(finalize) = types.entry(handle).descriptor.finalize {
        // SAFETY: registered for this type, object is still intact
        unsafe { finalize(obj) };
    }
    header.add_flags(ObjectFlags::COLLECTED);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker_skips_creation_value() {
        let mut collector = Collector::new();
        assert_eq!(collector.advance_marker(), 1);
        collector.marker = 254;
        assert_eq!(collector.advance_marker(), 255);
        assert_eq!(collector.advance_marker(), 1);
        assert_ne!(collector.marker(), MARKER_AT_CREATION);
    }

    #[test]
    fn starts_idle() {
        let collector = Collector::default();
        assert_eq!(collector.phase(), GcPhase::Idle);
        assert_eq!(collector.stats().collections, 0);
    }
}
