//! Diagnostic allocator layer.
//!
//! The hardest failure mode of an event-loop runtime is a dangling
//! script-state pointer inside a loop callback; this crate exists to make
//! that class of bug loud. [`TraceAlloc`] wraps any [`GlobalAlloc`]:
//! with the `trace` feature every allocation carries a hidden header
//! (canary word + byte size), freed memory is poisoned, a second free is
//! detected by the overwritten canary, and process-wide counters feed
//! the shutdown balance assertion. Without the feature it is a direct
//! pass-through.
//!
//! [`Arena`] is the optional bump backend for per-operation scratch:
//! freeing a whole op's allocations is one reset.
//!
//! ```no_run
//! use lunet_alloc::TraceAlloc;
//!
//! #[global_allocator]
//! static ALLOC: TraceAlloc = TraceAlloc::system();
//! ```

mod arena;

pub use arena::Arena;

use std::alloc::{GlobalAlloc, Layout, System};

#[cfg(feature = "trace")]
use std::sync::atomic::{AtomicU64, Ordering};

// ─── Trace state ──────────────────────────────────────────────

#[cfg(feature = "trace")]
mod counters {
    use super::AtomicU64;

    pub static ALLOC_COUNT: AtomicU64 = AtomicU64::new(0);
    pub static FREE_COUNT: AtomicU64 = AtomicU64::new(0);
    pub static BYTES_IN: AtomicU64 = AtomicU64::new(0);
    pub static BYTES_OUT: AtomicU64 = AtomicU64::new(0);
    pub static IN_USE: AtomicU64 = AtomicU64::new(0);
    pub static PEAK: AtomicU64 = AtomicU64::new(0);
}

/// Hidden per-allocation header size (canary word + byte size).
#[cfg(feature = "trace")]
const HEADER: usize = 16;
#[cfg(feature = "trace")]
const CANARY_LIVE: u64 = 0x5AFE_C0DE_5AFE_C0DE;
#[cfg(feature = "trace")]
const CANARY_FREED: u64 = 0xDEAD_F1ED_DEAD_F1ED;
#[cfg(feature = "trace")]
const POISON: u8 = 0xDD;

/// What the header in front of a pointer says about it.
#[cfg(feature = "trace")]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Probe {
    Live { size: usize },
    Freed,
    Corrupt,
}

/// Read the header in front of `ptr`.
///
/// # Safety
/// `ptr` must have been returned by a trace-mode [`TraceAlloc`] and the
/// backing block must still be mapped.
#[cfg(feature = "trace")]
pub unsafe fn probe(ptr: *const u8) -> Probe {
    // Header access is unaligned: the payload's own alignment may be
    // smaller than a word.
    let hdr = ptr.sub(HEADER) as *const u64;
    match hdr.read_unaligned() {
        CANARY_LIVE => Probe::Live {
            size: hdr.add(1).read_unaligned() as usize,
        },
        CANARY_FREED => Probe::Freed,
        _ => Probe::Corrupt,
    }
}

#[cfg(feature = "trace")]
fn fault(kind: &str, ptr: *mut u8) -> ! {
    // Unwinding out of an allocator is undefined; report and abort.
    eprintln!("lunet-alloc: {kind} at {ptr:p}");
    std::process::abort();
}

#[cfg(feature = "trace")]
fn header_offset(align: usize) -> usize {
    align.max(HEADER)
}

// ─── TraceAlloc ───────────────────────────────────────────────

/// Allocator wrapper with optional canary/poison/counter diagnostics.
pub struct TraceAlloc<A = System> {
    inner: A,
}

impl TraceAlloc<System> {
    pub const fn system() -> TraceAlloc<System> {
        TraceAlloc { inner: System }
    }
}

impl<A> TraceAlloc<A> {
    pub const fn new(inner: A) -> TraceAlloc<A> {
        TraceAlloc { inner }
    }
}

#[cfg(not(feature = "trace"))]
unsafe impl<A: GlobalAlloc> GlobalAlloc for TraceAlloc<A> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.inner.alloc(layout)
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        self.inner.alloc_zeroed(layout)
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        self.inner.realloc(ptr, layout, new_size)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        self.inner.dealloc(ptr, layout)
    }
}

#[cfg(feature = "trace")]
unsafe impl<A: GlobalAlloc> GlobalAlloc for TraceAlloc<A> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let off = header_offset(layout.align());
        let Ok(padded) = Layout::from_size_align(layout.size() + off, layout.align()) else {
            return std::ptr::null_mut();
        };
        let base = self.inner.alloc(padded);
        if base.is_null() {
            return base;
        }
        let ret = base.add(off);
        let hdr = ret.sub(HEADER) as *mut u64;
        hdr.write_unaligned(CANARY_LIVE);
        hdr.add(1).write_unaligned(layout.size() as u64);

        let size = layout.size() as u64;
        counters::ALLOC_COUNT.fetch_add(1, Ordering::Relaxed);
        counters::BYTES_IN.fetch_add(size, Ordering::Relaxed);
        let in_use = counters::IN_USE.fetch_add(size, Ordering::Relaxed) + size;
        counters::PEAK.fetch_max(in_use, Ordering::Relaxed);
        ret
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = self.alloc(layout);
        if !ptr.is_null() {
            std::ptr::write_bytes(ptr, 0, layout.size());
        }
        ptr
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        match probe(ptr) {
            Probe::Live { .. } => {}
            Probe::Freed => fault("REALLOC_AFTER_FREE", ptr),
            Probe::Corrupt => fault("CANARY_CORRUPT", ptr),
        }
        let Ok(new_layout) = Layout::from_size_align(new_size, layout.align()) else {
            return std::ptr::null_mut();
        };
        let fresh = self.alloc(new_layout);
        if fresh.is_null() {
            return fresh;
        }
        std::ptr::copy_nonoverlapping(ptr, fresh, layout.size().min(new_size));
        self.dealloc(ptr, layout);
        fresh
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        let hdr = ptr.sub(HEADER) as *mut u64;
        match probe(ptr) {
            Probe::Live { size } => {
                std::ptr::write_bytes(ptr, POISON, size);
                hdr.write_unaligned(CANARY_FREED);

                counters::FREE_COUNT.fetch_add(1, Ordering::Relaxed);
                counters::BYTES_OUT.fetch_add(size as u64, Ordering::Relaxed);
                counters::IN_USE.fetch_sub(size as u64, Ordering::Relaxed);
            }
            Probe::Freed => fault("DOUBLE_FREE", ptr),
            Probe::Corrupt => fault("CANARY_CORRUPT", ptr),
        }
        let off = header_offset(layout.align());
        let padded =
            Layout::from_size_align_unchecked(layout.size() + off, layout.align());
        self.inner.dealloc(ptr.sub(off), padded);
    }
}

// ─── Stats ────────────────────────────────────────────────────

/// Snapshot of the process-wide allocation counters. All zero unless the
/// `trace` feature is on.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AllocStats {
    pub alloc_count: u64,
    pub free_count: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub in_use: u64,
    pub peak: u64,
}

pub fn stats() -> AllocStats {
    #[cfg(feature = "trace")]
    {
        AllocStats {
            alloc_count: counters::ALLOC_COUNT.load(Ordering::Relaxed),
            free_count: counters::FREE_COUNT.load(Ordering::Relaxed),
            bytes_in: counters::BYTES_IN.load(Ordering::Relaxed),
            bytes_out: counters::BYTES_OUT.load(Ordering::Relaxed),
            in_use: counters::IN_USE.load(Ordering::Relaxed),
            peak: counters::PEAK.load(Ordering::Relaxed),
        }
    }
    #[cfg(not(feature = "trace"))]
    {
        AllocStats::default()
    }
}

/// Log the shutdown summary.
pub fn summary() {
    let s = stats();
    tracing::info!(
        alloc_count = s.alloc_count,
        free_count = s.free_count,
        bytes_in = s.bytes_in,
        bytes_out = s.bytes_out,
        in_use = s.in_use,
        peak = s.peak,
        "allocator summary"
    );
}

/// Panic when the counters do not balance, honoring the CI leak budget
/// from `LUNET_LEAK_BUDGET` (bytes still in use that are tolerated).
pub fn assert_balanced() {
    let s = stats();
    let budget: u64 = std::env::var("LUNET_LEAK_BUDGET")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let leaked = s.alloc_count.saturating_sub(s.free_count);
    if s.in_use > budget {
        panic!(
            "allocator imbalance: {} allocations / {} bytes still in use (budget {})",
            leaked, s.in_use, budget
        );
    }
}
