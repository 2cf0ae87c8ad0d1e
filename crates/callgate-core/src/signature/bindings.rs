//! Binding frames for deferred annotation resolution.
//!
//! Types declared inside a function body are not visible from a callable's
//! declaration-site globals. Callers that define such types push a binding
//! frame for the duration of the work that may resolve signatures; the
//! resolver unions all live frames on the current thread, outermost first,
//! so inner frames win on name collision.
//!
//! Each frame records the source location that pushed it. Frames pushed from
//! this crate's own sources are skipped when collecting, so internal
//! bookkeeping never leaks into user-visible bindings.

use std::cell::RefCell;
use std::marker::PhantomData;
use std::panic::Location;
use std::path::Path;

use super::annotation::Namespace;

struct Frame {
    origin: &'static Location<'static>,
    bindings: Namespace,
}

thread_local! {
    static FRAMES: RefCell<Vec<Frame>> = RefCell::new(Vec::new());
}

/// Guard for a pushed binding frame; the frame (and any frame pushed after
/// it) is popped when the guard is dropped.
#[must_use = "the binding frame is popped as soon as the guard is dropped"]
pub struct FrameGuard {
    depth: usize,
    // Frames live in a thread-local stack
    _not_send: PhantomData<*const ()>,
}

impl Drop for FrameGuard {
    fn drop(&mut self) {
        let depth = self.depth;
        let _ = FRAMES.try_with(|frames| frames.borrow_mut().truncate(depth));
    }
}

/// Push a binding frame attributed to the calling source location
#[track_caller]
pub fn enter_frame(bindings: Namespace) -> FrameGuard {
    let origin = Location::caller();
    FRAMES.with(|frames| {
        let mut frames = frames.borrow_mut();
        let depth = frames.len();
        frames.push(Frame { origin, bindings });
        FrameGuard {
            depth,
            _not_send: PhantomData,
        }
    })
}

/// Number of frames currently pushed on this thread, internal ones included
pub fn frame_depth() -> usize {
    FRAMES.with(|frames| frames.borrow().len())
}

/// Union of the bindings of every non-internal frame, outermost to innermost
pub fn collect_outer_locals() -> Namespace {
    FRAMES.with(|frames| {
        let mut locals = Namespace::new();
        for frame in frames.borrow().iter().filter(|f| !is_internal(f.origin)) {
            locals.extend(&frame.bindings);
        }
        locals
    })
}

// A frame is internal when the code that pushed it lives under this crate's
// `src/` directory.
fn is_internal(origin: &Location<'_>) -> bool {
    let here = Path::new(file!());
    match here.parent().and_then(Path::parent) {
        Some(src_root) => Path::new(origin.file()).starts_with(src_root),
        None => false,
    }
}
