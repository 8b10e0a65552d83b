use std::sync::{LazyLock, RwLock};
use std::time::Duration;

/// Frame counter of a render loop. Increments once per redraw cycle and is
/// passed to frame renderers for animation and ETA math.
pub type Tick = u32;

/// Default delay between redraw cycles.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_millis(40);

static REFRESH_INTERVAL: LazyLock<RwLock<Duration>> =
    LazyLock::new(|| RwLock::new(DEFAULT_REFRESH_INTERVAL));

/// Get the process-wide refresh interval.
///
/// This is read by every render worker at the start of each cycle, so
/// changes made with [`set_refresh_interval`] take effect on the next
/// cycle, not retroactively.
pub fn refresh_interval() -> Duration {
    match REFRESH_INTERVAL.read() {
        Ok(x) => *x,
        Err(poisoned) => *poisoned.into_inner(),
    }
}

/// Set the process-wide refresh interval. Callable from any thread.
pub fn set_refresh_interval(interval: Duration) {
    match REFRESH_INTERVAL.write() {
        Ok(mut x) => *x = interval,
        Err(poisoned) => *poisoned.into_inner() = interval,
    }
}
