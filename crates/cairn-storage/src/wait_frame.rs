//! WaitFrame slots: the per-partition "current" frame of a table.
//!
//! A slot holds at most one frame eligible for appends. Writers claim a slot
//! with a non-blocking [`WaitFrame::acquire`]; [`WaitFrames::get_available_frame`]
//! polls the slots round-robin with back-off and, once the timeout passes,
//! takes a slot by force. A forced takeover can leave two writers on the
//! same slot. Appends to one frame serialize on its content lock, and a
//! writer replaces the slot's frame only under the table's chain lock and
//! only after finding that frame full, so both writers settle on one frame.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use cairn_common::prelude::*;

use crate::frame::FrameData;

/// Back-off grows up to this multiple of the poll interval
const MAX_BACKOFF_FACTOR: u32 = 8;

/// One partition's append slot
#[derive(Debug)]
pub struct WaitFrame {
    index: usize,
    frame: Mutex<Option<Arc<FrameData>>>,
    busy: AtomicBool,
}

impl WaitFrame {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            frame: Mutex::new(None),
            busy: AtomicBool::new(false),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Claim the slot. Returns `None` if another writer holds it, unless
    /// `force` is set.
    pub fn acquire(&self, force: bool) -> Option<WaitGuard<'_>> {
        if force {
            return Some(self.take());
        }
        self.busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| WaitGuard { slot: self })
    }

    fn take(&self) -> WaitGuard<'_> {
        self.busy.store(true, Ordering::SeqCst);
        WaitGuard { slot: self }
    }

    /// Clear the busy flag.
    pub fn release(&self) {
        self.busy.store(false, Ordering::SeqCst);
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    pub fn current(&self) -> Option<Arc<FrameData>> {
        self.frame.lock().clone()
    }

    /// Make `frame` the slot's current frame and return the frame it
    /// replaced. The `current` flags of both are updated in memory; the
    /// caller persists them.
    pub fn install(&self, frame: Arc<FrameData>) -> Option<Arc<FrameData>> {
        let mut slot = self.frame.lock();
        if slot.as_ref().is_some_and(|f| f.id() == frame.id()) {
            return None;
        }
        frame.set_current(true);
        let evicted = slot.replace(frame);
        if let Some(old) = &evicted {
            old.set_current(false);
        }
        evicted
    }
}

/// Claim on a slot; dropping it releases the slot.
#[derive(Debug)]
pub struct WaitGuard<'a> {
    slot: &'a WaitFrame,
}

impl<'a> WaitGuard<'a> {
    pub fn slot(&self) -> &'a WaitFrame {
        self.slot
    }

    pub fn index(&self) -> usize {
        self.slot.index
    }

    pub fn current(&self) -> Option<Arc<FrameData>> {
        self.slot.current()
    }
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        self.slot.release();
    }
}

/// All slots of one table
#[derive(Debug)]
pub struct WaitFrames {
    slots: Vec<WaitFrame>,
    next: AtomicUsize,
    timeout: Duration,
    poll_interval: Duration,
}

impl WaitFrames {
    pub fn new(partitions: usize, config: &WaitConfig) -> Self {
        Self {
            slots: (0..partitions.max(1)).map(WaitFrame::new).collect(),
            next: AtomicUsize::new(0),
            timeout: config.acquire_timeout,
            poll_interval: config.poll_interval,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slot(&self, index: usize) -> &WaitFrame {
        &self.slots[index % self.slots.len()]
    }

    pub fn slots(&self) -> &[WaitFrame] {
        &self.slots
    }

    /// Frames currently installed in any slot.
    pub fn current_frames(&self) -> Vec<Arc<FrameData>> {
        self.slots.iter().filter_map(WaitFrame::current).collect()
    }

    /// Claim a slot, starting at `preferred` (or the next slot in
    /// round-robin order) and polling every slot with back-off. When the
    /// timeout passes the starting slot is taken by force.
    pub fn get_available_frame(&self, preferred: Option<usize>) -> WaitGuard<'_> {
        let n = self.slots.len();
        let start = preferred.unwrap_or_else(|| self.next.fetch_add(1, Ordering::Relaxed)) % n;
        let deadline = Instant::now() + self.timeout;
        let mut backoff = self.poll_interval;

        loop {
            for i in 0..n {
                if let Some(guard) = self.slots[(start + i) % n].acquire(false) {
                    return guard;
                }
            }
            let now = Instant::now();
            if now >= deadline {
                warn!(
                    slot = start,
                    timeout = ?self.timeout,
                    "no WaitFrame slot became free in time; taking slot by force"
                );
                return self.slot(start).take();
            }
            std::thread::sleep(backoff.min(deadline - now));
            backoff = (backoff * 2).min(self.poll_interval * MAX_BACKOFF_FACTOR);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FrameHeader, FrameKind};
    use cairn_common::types::{AllocId, FileId, FrameId, ObjectId};

    fn frame(pointer: u64) -> Arc<FrameData> {
        Arc::new(FrameData::new(FrameHeader::new(
            FrameId::new(FileId(1), pointer),
            ObjectId(1),
            FrameKind::Data,
            256,
            AllocId(pointer),
        )))
    }

    fn config(timeout_ms: u64) -> WaitConfig {
        WaitConfig {
            acquire_timeout: Duration::from_millis(timeout_ms),
            poll_interval: Duration::from_micros(100),
        }
    }

    #[test]
    fn test_acquire_release() {
        let slot = WaitFrame::new(0);
        let guard = slot.acquire(false).unwrap();
        assert!(slot.is_busy());
        assert!(slot.acquire(false).is_none());
        drop(guard);
        assert!(!slot.is_busy());
        assert!(slot.acquire(false).is_some());
    }

    #[test]
    fn test_install_evicts_previous() {
        let slot = WaitFrame::new(0);
        let a = frame(64);
        let b = frame(320);

        assert!(slot.install(a.clone()).is_none());
        assert!(a.is_current());
        assert!(slot.install(a.clone()).is_none());

        let evicted = slot.install(b.clone()).unwrap();
        assert_eq!(evicted.id(), a.id());
        assert!(!a.is_current());
        assert!(b.is_current());
        assert_eq!(slot.current().map(|f| f.id()), Some(b.id()));
    }

    #[test]
    fn test_round_robin_skips_busy_slots() {
        let frames = WaitFrames::new(3, &config(100));
        let g0 = frames.get_available_frame(Some(0));
        let g1 = frames.get_available_frame(Some(0));
        let g2 = frames.get_available_frame(Some(0));
        let mut indexes = vec![g0.index(), g1.index(), g2.index()];
        indexes.sort();
        assert_eq!(indexes, vec![0, 1, 2]);
    }

    #[test]
    fn test_forced_takeover_after_timeout() {
        let frames = WaitFrames::new(1, &config(5));
        let _held = frames.slot(0).acquire(false).unwrap();

        let started = Instant::now();
        let forced = frames.get_available_frame(None);
        assert!(started.elapsed() >= Duration::from_millis(5));
        assert_eq!(forced.index(), 0);
    }

    #[test]
    fn test_waiter_gets_slot_when_released() {
        let frames = Arc::new(WaitFrames::new(1, &config(2_000)));
        let guard = frames.slot(0).acquire(false).unwrap();

        let waiter = {
            let frames = Arc::clone(&frames);
            std::thread::spawn(move || {
                let started = Instant::now();
                let guard = frames.get_available_frame(None);
                (guard.index(), started.elapsed())
            })
        };
        std::thread::sleep(Duration::from_millis(10));
        drop(guard);

        let (index, waited) = waiter.join().unwrap();
        assert_eq!(index, 0);
        assert!(waited < Duration::from_millis(2_000));
    }
}
