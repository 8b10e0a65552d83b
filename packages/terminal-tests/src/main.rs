//! Manual terminal scenarios for barmux.
//!
//! Rendering behavior on a real terminal (region anchoring, resize,
//! scrollback interaction) cannot be asserted from automated tests, so
//! each case here is run by hand and eyeballed:
//!
//! ```text
//! cargo run -p terminal-tests -- <case>
//! ```

use std::thread;
use std::time::Duration;

use barmux::{Multiplexer, Region};

fn main() -> barmux::Result<()> {
    let case = std::env::args().nth(1).unwrap_or_default();
    match case.as_str() {
        "single" => single(),
        "multi" => multi(),
        "relative" => relative(),
        "unbounded" => unbounded(),
        "abort" => abort(),
        other => {
            eprintln!("unknown case '{other}'");
            eprintln!("cases: single, multi, relative, unbounded, abort");
            std::process::exit(2);
        }
    }
}

fn step() {
    thread::sleep(Duration::from_millis(120));
}

/// One bounded bar, ticked to completion.
fn single() -> barmux::Result<()> {
    let bar = barmux::bar("downloading").total(30).build();
    for _ in 0..30 {
        bar.tick()?;
        step();
    }
    Ok(())
}

/// Three bars sharing one fixed region, finishing out of order. The
/// block should shrink from the top, keeping every final line.
fn multi() -> barmux::Result<()> {
    let mux = Multiplexer::new(Region::Fixed);
    let bars = [
        barmux::bar("shard 1").total(20).multiplexer(&mux).build(),
        barmux::bar("shard 2").total(10).multiplexer(&mux).build(),
        barmux::bar("shard 3").total(5).multiplexer(&mux).build(),
    ];
    for round in 0..20 {
        for bar in &bars {
            if bar.is_running() || round == 0 {
                bar.tick()?;
            }
        }
        step();
    }
    Ok(())
}

/// Same as `multi` but with the relative region strategy, for terminals
/// where the fixed anchor misbehaves across scrollback.
fn relative() -> barmux::Result<()> {
    let mux = Multiplexer::new(Region::Relative);
    let a = barmux::bar("left").total(15).multiplexer(&mux).build();
    let b = barmux::bar("right").total(15).multiplexer(&mux).build();
    for _ in 0..15 {
        a.tick()?;
        b.tick()?;
        step();
    }
    Ok(())
}

/// An unbounded spinner, stopped by reset with a custom message.
fn unbounded() -> barmux::Result<()> {
    let bar = barmux::bar("listening for connections").build();
    for _ in 0..25 {
        bar.tick()?;
        step();
    }
    bar.reset(Some("listener closed"))?;
    Ok(())
}

/// A bar dropped mid-run: the block should be erased, not left behind.
fn abort() -> barmux::Result<()> {
    let bar = barmux::bar("will be cancelled").total(100).build();
    for _ in 0..10 {
        bar.tick()?;
        step();
    }
    drop(bar);
    println!("cancelled cleanly");
    Ok(())
}
