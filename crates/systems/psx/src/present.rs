//! Frame presentation, optionally on a dedicated thread.
//!
//! The emulation thread renders into the frame of the current ring slot and
//! calls [`Presenter::submit`]. With threading enabled the frame is moved
//! to the present thread and `submit` returns immediately; the frame comes
//! back to its slot once presented. At most one present is in flight, and
//! a slot is only reused after its frame came back.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use emu_core::logging::{log, LogCategory, LogLevel};
use emu_core::types::Frame;

use crate::frame_ring::{FrameRing, TimelineFence};
use crate::GpuError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentStatus {
    Ok,
    /// The swap chain no longer matches the surface and must be recreated
    OutOfDate,
    /// Presented, but the swap chain should be recreated
    Suboptimal,
}

/// Whatever puts frames on screen
pub trait PresentSink: Send {
    fn present(&mut self, frame: &Frame) -> PresentStatus;
}

struct QueuedFrame {
    slot: usize,
    frame: Frame,
    fence_value: u64,
}

#[derive(Default)]
struct Queue {
    pending: Option<QueuedFrame>,
    returned: Vec<(usize, Frame)>,
    shutdown: bool,
}

struct Shared {
    queue: Mutex<Queue>,
    queued: Condvar,
    done: Condvar,
    present_done: AtomicBool,
    thread_done: AtomicBool,
    last_present_failed: AtomicBool,
    timeline: TimelineFence,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record_status(&self, status: PresentStatus) {
        let failed = status != PresentStatus::Ok;
        if failed {
            log(LogCategory::Present, LogLevel::Debug, || {
                format!("present returned {:?}, swap chain needs recreating", status)
            });
        }
        self.last_present_failed.store(failed, Ordering::Release);
    }
}

fn present_thread(shared: Arc<Shared>, mut sink: Box<dyn PresentSink>) {
    loop {
        let queued = {
            let mut queue = shared.lock();
            while queue.pending.is_none() && !queue.shutdown {
                queue = shared.queued.wait(queue).unwrap_or_else(|e| e.into_inner());
            }
            match queue.pending.take() {
                Some(queued) => queued,
                None => break,
            }
        };

        let status = sink.present(&queued.frame);
        shared.record_status(status);

        {
            let mut queue = shared.lock();
            queue.returned.push((queued.slot, queued.frame));
            shared.present_done.store(true, Ordering::Release);
        }
        shared.timeline.signal(queued.fence_value);
        shared.done.notify_all();
    }
    shared.thread_done.store(true, Ordering::Release);
    shared.done.notify_all();
}

enum Mode {
    Threaded(Option<JoinHandle<()>>),
    Inline(Box<dyn PresentSink>),
}

pub struct Presenter {
    shared: Arc<Shared>,
    mode: Mode,
    /// Each slot holds its frame unless it is with the present thread
    ring: FrameRing<Option<Frame>, Frame>,
    pool: Vec<Frame>,
    presented: u64,
}

impl Presenter {
    pub fn new(sink: Box<dyn PresentSink>, slots: usize, threaded: bool) -> Result<Self, GpuError> {
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue::default()),
            queued: Condvar::new(),
            done: Condvar::new(),
            present_done: AtomicBool::new(true),
            thread_done: AtomicBool::new(false),
            last_present_failed: AtomicBool::new(false),
            timeline: TimelineFence::new(),
        });

        let mode = if threaded {
            let thread_shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name("gpu-present".to_string())
                .spawn(move || present_thread(thread_shared, sink))
                .map_err(|e| GpuError::resource("present thread", e.to_string()))?;
            Mode::Threaded(Some(handle))
        } else {
            Mode::Inline(sink)
        };

        let slots = slots.max(1);
        log(LogCategory::Present, LogLevel::Info, || {
            format!("presenter with {} frame slot(s), threaded: {}", slots, threaded)
        });
        Ok(Self {
            shared,
            mode,
            ring: FrameRing::new((0..slots).map(|_| Some(Frame::default())).collect()),
            pool: Vec::new(),
            presented: 0,
        })
    }

    pub fn is_threaded(&self) -> bool {
        matches!(self.mode, Mode::Threaded(_))
    }

    pub fn frames_presented(&self) -> u64 {
        self.presented
    }

    pub fn current_slot(&self) -> usize {
        self.ring.current_index()
    }

    /// Put frames the present thread is finished with back into their slots
    fn collect_returned(&mut self) {
        let returned = std::mem::take(&mut self.shared.lock().returned);
        for (slot, frame) in returned {
            if self.ring.current_index() == slot {
                *self.ring.current_mut() = Some(frame);
            } else {
                self.pool.push(frame);
            }
        }
    }

    /// Advance to the next slot and hand out its frame, sized as requested.
    /// Blocks while the present thread still holds that slot's frame.
    pub fn begin_frame(&mut self, width: u32, height: u32) -> &mut Frame {
        self.ring.move_to_next(&self.shared.timeline);
        self.collect_returned();
        self.pool.extend(self.ring.take_reclaimed());

        let mut frame = match self.ring.current_mut().take() {
            Some(frame) => frame,
            None => self.pool.pop().unwrap_or_default(),
        };
        if frame.width != width || frame.height != height {
            // Reuse pooled storage of the right size if there is one
            if let Some(index) = self.pool.iter().position(|f| f.width == width && f.height == height) {
                let replacement = self.pool.swap_remove(index);
                self.ring.defer_release(std::mem::replace(&mut frame, replacement));
            } else {
                frame.resize(width, height);
            }
        }
        self.ring.current_mut().insert(frame)
    }

    /// Present the current slot's frame
    pub fn submit(&mut self) {
        let slot = self.ring.current_index();
        let Some(frame) = self.ring.current_mut().take() else {
            log(LogCategory::Present, LogLevel::Warn, || {
                "submit without begin_frame".to_string()
            });
            return;
        };
        let fence_value = self.ring.submit();
        self.presented += 1;

        match &mut self.mode {
            Mode::Inline(sink) => {
                let status = sink.present(&frame);
                self.shared.record_status(status);
                *self.ring.current_mut() = Some(frame);
                self.shared.timeline.signal(fence_value);
            }
            Mode::Threaded(_) => {
                self.wait_for_present_complete();
                let mut queue = self.shared.lock();
                queue.pending = Some(QueuedFrame { slot, frame, fence_value });
                self.shared.present_done.store(false, Ordering::Release);
                drop(queue);
                self.shared.queued.notify_one();
            }
        }
    }

    /// Block until the in-flight present (if any) has finished
    pub fn wait_for_present_complete(&self) {
        if self.shared.present_done.load(Ordering::Acquire) {
            return;
        }
        let mut queue = self.shared.lock();
        while !self.shared.present_done.load(Ordering::Acquire)
            && !self.shared.thread_done.load(Ordering::Acquire)
        {
            queue = self.shared.done.wait(queue).unwrap_or_else(|e| e.into_inner());
        }
    }

    /// True when the last present asked for swap chain recreation. Reading
    /// clears the flag.
    pub fn check_last_present_fail(&self) -> bool {
        self.shared.last_present_failed.swap(false, Ordering::AcqRel)
    }

    pub fn shutdown(&mut self) {
        if let Mode::Threaded(handle) = &mut self.mode {
            if let Some(handle) = handle.take() {
                self.shared.lock().shutdown = true;
                self.shared.queued.notify_all();
                if handle.join().is_err() {
                    log(LogCategory::Present, LogLevel::Error, || "present thread panicked".to_string());
                }
                // Nothing is in flight any more
                self.shared.timeline.signal(self.ring.pending_fence_value() - 1);
            }
        }
        self.collect_returned();
        let remaining = self.ring.wait_all(&self.shared.timeline);
        self.pool.extend(remaining);
    }
}

impl Drop for Presenter {
    fn drop(&mut self) {
        self.shutdown();
    }
}
