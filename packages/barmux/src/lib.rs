//! Multiplexed terminal progress bars
//!
//! Progress indicators are advanced with a non-blocking [`tick`](Bar::tick)
//! from any number of threads; a background worker redraws them in place
//! every refresh interval (40ms by default). The calling thread never
//! renders.
//!
//! # Quick start
//! ```rust,no_run
//! fn work() -> barmux::Result<()> {
//!     let bar = barmux::bar("downloading").total(100).build();
//!     for _ in 0..100 {
//!         // ... one unit of work ...
//!         bar.tick()?;
//!     }
//!     Ok(())
//! }
//! ```
//! The first tick starts the render loop; the tick that reaches the total
//! stops it, leaving one final frame with the done message.
//!
//! # Sharing a region
//! Bars built on one [`Multiplexer`] share a single worker thread and one
//! contiguous block of terminal rows, redrawn together:
//! ```rust,no_run
//! use barmux::{Multiplexer, Region};
//!
//! let mux = Multiplexer::new(Region::Fixed);
//! let a = barmux::bar("shards").total(10).multiplexer(&mux).build();
//! let b = barmux::bar("index").total(5).multiplexer(&mux).build();
//! ```
//! Finished bars keep their final line on screen; the block shrinks from
//! the top as leading bars complete.
//!
//! # Destinations
//! A destination that is not a terminal never receives escape sequences:
//! each redraw appends one plain line instead, so piped output stays
//! readable. Only one render loop may drive a given destination at a
//! time; a second one fails with [`InvalidState`].
//!
//! # Errors
//! A panic or error inside a frame renderer never kills the program. It
//! is captured on the worker thread and rethrown from the next call that
//! interacts with the worker (`tick`, `reset`). A worker that faults
//! while an earlier fault is still unconsumed terminates, and later calls
//! report [`InvalidState`] instead of hanging.

mod ansi;
mod atomic;
mod config;
mod engine;
mod error_box;
mod eta;
mod mux;
mod out;
mod pool;
mod style;
mod worker;

pub use anyhow::{Error, Result};

pub use config::{DEFAULT_REFRESH_INTERVAL, Tick, refresh_interval, set_refresh_interval};
pub use engine::{Bar, BarBuilder, Phase, bar};
pub use error_box::InvalidState;
pub use mux::{Multiplexer, Region};
pub use out::OutSink;
pub use style::{Frame, FrameRender, TextBar};
