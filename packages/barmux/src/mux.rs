use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use crate::ansi;
use crate::config::Tick;
use crate::out::OutSink;
use crate::pool::POOL;
use crate::worker::{Task, Worker};

/// How the multiplexer re-anchors the terminal cursor between redraw
/// cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Region {
    /// Save the cursor once at activation and restore it every cycle.
    /// As leading bars finish, the anchor is advanced downward past their
    /// final frames so they are never overwritten.
    #[default]
    Fixed,
    /// No saved cursor: every cycle moves the real cursor up by exactly
    /// the number of rows written in the previous cycle. Works on
    /// destinations whose scrollback shifts between cycles.
    Relative,
}

/// One registered indicator, as the multiplexer sees it.
///
/// A slot renders one line per cycle. The cycle that draws the final
/// frame retires the slot; it is never reused for another indicator.
pub(crate) trait RenderSlot: Send + Sync {
    /// Append one frame line, no trailing newline, at most `width`
    /// visible columns. Returns whether the appended frame was the final
    /// one. The implementation samples its own state exactly once, so one
    /// call yields one consistent frame and the retirement decision
    /// cannot diverge from what was drawn.
    fn render_line(&self, width: usize, tick: Tick, out: &mut String) -> bool;
    /// Widest frame this indicator has produced so far, in columns.
    fn max_width(&self) -> usize;
}

/// A registration record. Retired slots keep their place in the sequence
/// (and their terminal row, if one was ever drawn) until the block is
/// torn down or the leading-prefix garbage collection advances past them.
enum Slot {
    Live {
        slot: Arc<dyn RenderSlot>,
        /// Whether a cycle has drawn a row for this slot yet. A slot
        /// registered between cycles owns no row until the next redraw.
        has_row: AtomicBool,
    },
    /// Final frame on screen; the row is kept.
    Done,
    /// Torn down without a final frame; the row content is stale and is
    /// erased at teardown.
    Stale { has_row: bool },
}

impl Slot {
    fn is_live(&self) -> bool {
        matches!(self, Self::Live { .. })
    }

    fn is(&self, other: &Arc<dyn RenderSlot>) -> bool {
        matches!(self, Self::Live { slot, .. } if same_slot(slot, other))
    }
}

type SlotSeq = Vec<Slot>;

/// Identity by allocation address. Vtable pointers are ignored: two
/// unsized coercions of the same `Arc` can carry different vtables.
fn same_slot(a: &Arc<dyn RenderSlot>, b: &Arc<dyn RenderSlot>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Lets N independently-ticking indicators share one render worker and
/// one contiguous terminal region.
///
/// Cloning the handle shares the same underlying multiplexer; bars built
/// with [`BarBuilder::multiplexer`](crate::BarBuilder::multiplexer) are
/// redrawn together, in registration order, by a single background
/// worker. The worker is taken from the process-wide pool when the first
/// bar starts and returned when the last one finishes.
#[derive(Clone)]
pub struct Multiplexer {
    inner: Arc<MuxInner>,
}

pub(crate) struct MuxInner {
    sink: OutSink,
    region: Region,
    /// Registration-ordered slots; shared lock for redraw, exclusive for
    /// mutation, so (de)registration never races an in-flight redraw.
    slots: RwLock<SlotSeq>,
    /// Leading done rows the fixed-region anchor has advanced past.
    /// Monotone within one run of the worker.
    eliminated: AtomicUsize,
    /// Rows emitted in the previous cycle.
    prev_rows: AtomicUsize,
    /// Widest line written so far, for the teardown erase.
    max_width: AtomicUsize,
    tick: AtomicU32,
    /// Serializes start/stop transitions; holds the shared worker while
    /// the render loop runs.
    driver: Mutex<Option<Worker>>,
}

impl Multiplexer {
    /// Multiplexer over stdout.
    pub fn new(region: Region) -> Self {
        Self::with_sink(OutSink::stdout(), region)
    }

    /// Multiplexer over stderr.
    pub fn stderr(region: Region) -> Self {
        Self::with_sink(OutSink::stderr(), region)
    }

    /// Multiplexer over an explicit sink.
    pub fn with_sink(sink: OutSink, region: Region) -> Self {
        Self {
            inner: Arc::new(MuxInner {
                sink,
                region,
                slots: RwLock::new(Vec::new()),
                eliminated: AtomicUsize::new(0),
                prev_rows: AtomicUsize::new(0),
                max_width: AtomicUsize::new(0),
                tick: AtomicU32::new(0),
                driver: Mutex::new(None),
            }),
        }
    }

    /// Number of registered indicators that have not finished.
    pub fn live_count(&self) -> usize {
        self.inner.live_count()
    }

    /// Number of leading finished rows garbage-collected so far in the
    /// current run.
    pub fn eliminated(&self) -> usize {
        self.inner.eliminated.load(Ordering::Acquire)
    }

    /// Whether a render worker is currently driving this multiplexer.
    pub fn is_running(&self) -> bool {
        self.inner
            .driver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub(crate) fn attach(&self, slot: Arc<dyn RenderSlot>) -> crate::Result<()> {
        self.inner.attach(slot)
    }

    pub(crate) fn detach(&self, slot: &Arc<dyn RenderSlot>, forced: bool) -> crate::Result<()> {
        self.inner.detach(slot, forced)
    }
}

impl MuxInner {
    fn live_count(&self) -> usize {
        self.read_slots().iter().filter(|s| s.is_live()).count()
    }

    fn read_slots(&self) -> std::sync::RwLockReadGuard<'_, SlotSeq> {
        self.slots.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_slots(&self) -> std::sync::RwLockWriteGuard<'_, SlotSeq> {
        self.slots.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register an indicator. The first registrant claims the destination,
    /// takes a worker from the pool and synchronously activates it, so at
    /// least one frame has been written by the time this returns. Later
    /// registrants only append; the running worker picks the new row count
    /// up on its next cycle.
    fn attach(self: &Arc<Self>, slot: Arc<dyn RenderSlot>) -> crate::Result<()> {
        let mut driver = self.driver.lock().unwrap_or_else(PoisonError::into_inner);
        if driver.is_some() {
            let mut slots = self.write_slots();
            self.gc_leading(&mut slots);
            slots.push(Slot::Live {
                slot,
                has_row: AtomicBool::new(false),
            });
            return Ok(());
        }

        self.sink.claim()?;
        {
            let mut slots = self.write_slots();
            slots.clear();
            slots.push(Slot::Live {
                slot,
                has_row: AtomicBool::new(false),
            });
        }
        self.eliminated.store(0, Ordering::Release);
        self.prev_rows.store(0, Ordering::Release);
        self.max_width.store(0, Ordering::Release);
        self.tick.store(0, Ordering::Release);
        if self.sink.is_terminal() && self.region == Region::Fixed {
            // the anchor every later cycle restores to
            self.sink.write_str(ansi::SAVE_CURSOR);
        }

        let worker = POOL.pop();
        let started = worker
            .appoint(self.render_task())
            .and_then(|()| worker.activate());
        match started {
            Ok(()) => {
                log::debug!("multiplexer render loop started");
                *driver = Some(worker);
                Ok(())
            }
            Err(error) => {
                self.write_slots().clear();
                self.sink.release();
                POOL.push(worker);
                Err(error)
            }
        }
    }

    /// Deregister an indicator. Unless `forced`, blocks until the render
    /// loop has written the indicator's final frame and retired its slot.
    /// When the last live slot retires the worker is stopped, stale rows
    /// are erased, the destination claim released, and the worker
    /// returned to the pool.
    fn detach(&self, slot: &Arc<dyn RenderSlot>, forced: bool) -> crate::Result<()> {
        let mut driver = self.driver.lock().unwrap_or_else(PoisonError::into_inner);

        let waitable = driver.as_ref().is_some_and(Worker::is_running);
        if forced || !waitable {
            // no final frame was written for this slot; its row is stale
            self.retire_stale(slot);
        } else {
            // the loop writes the final frame, then retires the slot;
            // bounded by one refresh interval per cycle
            loop {
                if !self.slot_is_live(slot) {
                    break;
                }
                if driver.as_ref().is_none_or(|w| !w.is_running()) {
                    // worker bailed out mid-run; its error surfaces below
                    self.retire_stale(slot);
                    break;
                }
                std::thread::yield_now();
            }
        }

        if self.live_count() > 0 {
            // more bars to go: advance the anchor and leave the worker on.
            // Teardown skips this GC so the stale bookkeeping survives
            // until the erase below.
            let mut slots = self.write_slots();
            self.gc_leading(&mut slots);
            return Ok(());
        }
        let Some(worker) = driver.take() else {
            return Ok(());
        };
        let stopped = if forced {
            worker.halt()
        } else {
            worker.suspend()
        };
        if self.sink.is_terminal() {
            self.erase_stale_rows();
        }
        self.write_slots().clear();
        self.eliminated.store(0, Ordering::Release);
        self.prev_rows.store(0, Ordering::Release);
        self.sink.release();
        POOL.push(worker);
        log::debug!("multiplexer render loop stopped");
        stopped
    }

    fn slot_is_live(&self, slot: &Arc<dyn RenderSlot>) -> bool {
        self.read_slots().iter().any(|s| s.is(slot))
    }

    fn retire_stale(&self, slot: &Arc<dyn RenderSlot>) {
        let mut slots = self.write_slots();
        for s in slots.iter_mut() {
            if s.is(slot) {
                let Slot::Live { has_row, .. } = s else {
                    continue;
                };
                *s = Slot::Stale {
                    has_row: has_row.load(Ordering::Acquire),
                };
            }
        }
    }

    /// Drop the contiguous prefix of done slots, advancing the anchor
    /// offset by that many rows. Stale rows block the advance: their
    /// content must stay inside the block so teardown can erase it.
    fn gc_leading(&self, slots: &mut SlotSeq) {
        let n = slots
            .iter()
            .take_while(|s| matches!(s, Slot::Done))
            .count();
        if n > 0 {
            slots.drain(..n);
            self.eliminated.fetch_add(n, Ordering::AcqRel);
        }
    }

    fn render_task(self: &Arc<Self>) -> Task {
        let inner = Arc::clone(self);
        let mut buf = String::new();
        Box::new(move || inner.render_cycle(&mut buf))
    }

    /// One redraw cycle: reposition the cursor per the region strategy,
    /// then rewrite every live slot's row in registration order. A slot
    /// whose line came back as the final frame is retired after the
    /// buffer has been written out, so the final frame is always the last
    /// one on screen. Retirement is decided by the render call itself; a
    /// bar completing while its line is being built keeps its slot for
    /// one more cycle and gets its final frame then.
    fn render_cycle(&self, buf: &mut String) -> crate::Result<()> {
        buf.clear();
        let tick = self.tick.fetch_add(1, Ordering::AcqRel) as Tick;
        let width = self.sink.width();
        let is_term = self.sink.is_terminal();
        let mut finished: Vec<Arc<dyn RenderSlot>> = Vec::new();
        {
            let slots = self.read_slots();
            if !slots.iter().any(Slot::is_live) {
                return Ok(());
            }
            if is_term {
                match self.region {
                    Region::Fixed => {
                        buf.push_str(ansi::RESTORE_CURSOR);
                        ansi::cursor_down(buf, self.eliminated.load(Ordering::Acquire));
                    }
                    Region::Relative => {
                        buf.push_str(ansi::LINE_START);
                        ansi::cursor_up(buf, self.prev_rows.load(Ordering::Acquire));
                    }
                }
            }
            let mut rows = 0usize;
            for entry in slots.iter() {
                match entry {
                    Slot::Live { slot, has_row } => {
                        if is_term {
                            buf.push_str(ansi::LINE_START);
                        }
                        let is_final = slot.render_line(width, tick, buf);
                        self.max_width
                            .fetch_max(slot.max_width(), Ordering::AcqRel);
                        if is_term {
                            buf.push_str(ansi::ERASE_TO_EOL);
                        }
                        buf.push('\n');
                        has_row.store(true, Ordering::Release);
                        rows += 1;
                        if is_final {
                            finished.push(Arc::clone(slot));
                        }
                    }
                    Slot::Done | Slot::Stale { has_row: true } => {
                        // retired rows keep their content; step past
                        if is_term {
                            ansi::cursor_down(buf, 1);
                            rows += 1;
                        }
                    }
                    Slot::Stale { has_row: false } => {}
                }
            }
            self.prev_rows.store(rows, Ordering::Release);
        }
        self.sink.write_str(buf);
        if !finished.is_empty() {
            // retire only now, after the final frames are on screen;
            // matched by identity because the sequence may have been
            // garbage-collected since the read above
            let mut slots = self.write_slots();
            for done in finished {
                for entry in slots.iter_mut() {
                    if entry.is(&done) {
                        *entry = Slot::Done;
                    }
                }
            }
        }
        Ok(())
    }

    /// Erase the rows of slots that were torn down without a final frame,
    /// leaving done rows untouched. Sized by the widest line ever
    /// written. Runs at teardown, after the worker has stopped, walking
    /// the block bottom-up so rows already garbage-collected above the
    /// anchor are never touched.
    fn erase_stale_rows(&self) {
        let width = self.max_width.load(Ordering::Acquire);
        let slots = self.read_slots();
        if !slots.iter().any(|s| matches!(s, Slot::Stale { .. })) {
            return;
        }
        let mut buf = String::new();
        let mut climbed = 0usize;
        for entry in slots.iter().rev() {
            let erase = match entry {
                Slot::Done => false,
                Slot::Stale { has_row } => {
                    if !has_row {
                        continue;
                    }
                    true
                }
                // no live slots remain at teardown
                Slot::Live { has_row, .. } => has_row.load(Ordering::Acquire),
            };
            climbed += 1;
            ansi::cursor_up(&mut buf, 1);
            if erase {
                buf.push_str(ansi::LINE_START);
                ansi::erase_chars(&mut buf, width);
            }
        }
        ansi::cursor_down(&mut buf, climbed);
        self.sink.write_str(&buf);
    }
}
