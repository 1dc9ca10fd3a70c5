use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::sync::Mutex;

/// Wrapper over the runtime's native thread identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(i32);

impl ThreadId {
    pub const INVALID: ThreadId = ThreadId(0);
    pub const ALL_THREADS: ThreadId = ThreadId(-1);

    pub fn new(native_id: u32) -> Self {
        debug_assert!(native_id != 0 && native_id <= i32::MAX as u32);
        ThreadId(native_id as i32)
    }

    pub fn is_valid(self) -> bool {
        self != Self::INVALID && self != Self::ALL_THREADS
    }

    pub fn as_raw(self) -> i32 {
        self.0
    }
}

impl From<ThreadId> for i64 {
    fn from(id: ThreadId) -> Self {
        id.0 as i64
    }
}

impl TryFrom<i64> for ThreadId {
    type Error = std::num::TryFromIntError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Ok(ThreadId(i32::try_from(value)?))
    }
}

impl Display for ThreadId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::INVALID => f.write_str("<invalid>"),
            Self::ALL_THREADS => f.write_str("<all>"),
            ThreadId(id) => write!(f, "{id}"),
        }
    }
}

/// Frame depth, 0 is the innermost frame.
pub type FrameLevel = u32;

/// DAP-visible frame identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameId(i64);

impl FrameId {
    pub fn from_raw(raw: i64) -> Self {
        FrameId(raw)
    }

    pub fn as_raw(self) -> i64 {
        self.0
    }
}

impl Display for FrameId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Default)]
struct FrameIdsInner {
    next: i64,
    by_id: HashMap<i64, (ThreadId, FrameLevel)>,
    by_frame: HashMap<(ThreadId, FrameLevel), i64>,
}

/// Allocates [`FrameId`]s for `(thread, level)` pairs.
///
/// Ids are never reused, [`FrameIds::invalidate`] forgets every issued id at once
/// (called whenever the debuggee resumes).
#[derive(Default)]
pub struct FrameIds {
    inner: Mutex<FrameIdsInner>,
}

impl FrameIds {
    pub fn encode(&self, thread: ThreadId, level: FrameLevel) -> FrameId {
        let mut inner = self.inner.lock().expect("frame ids lock poisoned");
        if let Some(id) = inner.by_frame.get(&(thread, level)) {
            return FrameId(*id);
        }
        inner.next += 1;
        let id = inner.next;
        inner.by_id.insert(id, (thread, level));
        inner.by_frame.insert((thread, level), id);
        FrameId(id)
    }

    pub fn decode(&self, id: FrameId) -> Option<(ThreadId, FrameLevel)> {
        let inner = self.inner.lock().expect("frame ids lock poisoned");
        inner.by_id.get(&id.0).copied()
    }

    pub fn invalidate(&self) {
        let mut inner = self.inner.lock().expect("frame ids lock poisoned");
        inner.by_id.clear();
        inner.by_frame.clear();
    }
}
