use std::sync::{Arc, Mutex};
use std::time::Duration;

use barmux::{Frame, FrameRender, InvalidState, Multiplexer, OutSink, Phase, Region};

fn buffer() -> Arc<Mutex<Vec<u8>>> {
    Arc::new(Mutex::new(Vec::new()))
}

fn contents(buffer: &Arc<Mutex<Vec<u8>>>) -> String {
    String::from_utf8_lossy(&buffer.lock().unwrap()).into_owned()
}

fn fast() {
    barmux::set_refresh_interval(Duration::from_millis(5));
}

fn buffer_mux(out: &Arc<Mutex<Vec<u8>>>) -> Multiplexer {
    Multiplexer::with_sink(OutSink::buffer(Arc::clone(out), true), Region::Fixed)
}

#[test]
fn reset_while_idle_is_a_noop_and_starts_nothing() {
    fast();
    let out = buffer();
    let mux = buffer_mux(&out);
    let bar = barmux::bar("idle").total(3).multiplexer(&mux).build();

    bar.reset(None).unwrap();
    bar.reset(None).unwrap();
    assert_eq!(bar.phase(), Phase::Stopped);
    assert!(!mux.is_running());
    assert!(contents(&out).is_empty());
}

#[test]
fn bounded_bar_with_zero_total_rejects_ticks() {
    fast();
    let out = buffer();
    let mux = buffer_mux(&out);
    let bar = barmux::bar("empty").total(0).multiplexer(&mux).build();

    let err = bar.tick().unwrap_err();
    assert!(err.downcast_ref::<InvalidState>().is_some(), "{err:#}");
    assert_eq!(bar.phase(), Phase::Stopped);
    assert!(!mux.is_running());
}

#[test]
fn tick_by_saturates_at_the_total() {
    fast();
    let out = buffer();
    let mux = buffer_mux(&out);
    let bar = barmux::bar("batch").total(5).multiplexer(&mux).build();

    bar.tick_by(3).unwrap();
    assert_eq!(bar.completed(), 3);
    assert_eq!(bar.phase(), Phase::StrictRefresh);

    bar.tick_by(100).unwrap();
    assert_eq!(bar.completed(), 5);
    assert_eq!(bar.phase(), Phase::Finish);
    assert!(!mux.is_running());

    // finished bars ignore further ticks
    bar.tick().unwrap();
    assert_eq!(bar.completed(), 5);
}

#[test]
fn tick_to_is_forward_only() {
    fast();
    let out = buffer();
    let mux = buffer_mux(&out);
    let bar = barmux::bar("seek").total(10).multiplexer(&mux).build();

    bar.tick_to(0.5).unwrap();
    assert_eq!(bar.completed(), 5);
    bar.tick_to(0.2).unwrap();
    assert_eq!(bar.completed(), 5);
    bar.tick_to(1.0).unwrap();
    assert_eq!(bar.completed(), 10);
    assert_eq!(bar.phase(), Phase::Finish);
}

#[test]
fn tick_to_requires_a_bounded_bar() {
    fast();
    let out = buffer();
    let mux = buffer_mux(&out);
    let bar = barmux::bar("seek").multiplexer(&mux).build();

    let err = bar.tick_to(0.5).unwrap_err();
    assert!(err.downcast_ref::<InvalidState>().is_some(), "{err:#}");
    assert!(!bar.is_running());
}

#[test]
fn wait_for_observes_completion_from_another_thread() {
    fast();
    let out = buffer();
    let mux = buffer_mux(&out);
    let bar = barmux::bar("ferried").total(3).multiplexer(&mux).build();
    bar.tick().unwrap();

    std::thread::scope(|scope| {
        scope.spawn(|| {
            std::thread::sleep(Duration::from_millis(20));
            bar.tick().unwrap();
            std::thread::sleep(Duration::from_millis(20));
            bar.tick().unwrap();
        });
        assert!(bar.wait_for(Duration::from_secs(5)));
    });
    assert_eq!(bar.phase(), Phase::Finish);
}

#[test]
fn final_frame_carries_the_done_message() {
    fast();
    let out = buffer();
    let mux = buffer_mux(&out);
    let bar = barmux::bar("packing")
        .total(1)
        .when_done("all packed")
        .multiplexer(&mux)
        .build();

    bar.tick().unwrap();
    assert_eq!(bar.phase(), Phase::Finish);
    // the completing tick returns only after the final frame was written
    assert!(contents(&out).contains("all packed"));
}

#[test]
fn reset_allows_a_second_run() {
    fast();
    let out = buffer();
    let mux = buffer_mux(&out);
    let bar = barmux::bar("again").total(2).multiplexer(&mux).build();

    bar.tick_by(2).unwrap();
    assert_eq!(bar.phase(), Phase::Finish);
    bar.reset(None).unwrap();
    assert_eq!(bar.phase(), Phase::Stopped);
    assert_eq!(bar.completed(), 0);

    bar.tick().unwrap();
    assert_eq!(bar.completed(), 1);
    assert_eq!(bar.phase(), Phase::StrictRefresh);
    assert!(mux.is_running());
    bar.tick().unwrap();
    assert!(!mux.is_running());
}

#[test]
fn unbounded_bar_runs_until_reset() {
    fast();
    let out = buffer();
    let mux = buffer_mux(&out);
    let bar = barmux::bar("listening").multiplexer(&mux).build();

    for _ in 0..3 {
        bar.tick().unwrap();
    }
    assert_eq!(bar.completed(), 3);
    assert_eq!(bar.phase(), Phase::LenientRefresh);
    assert!(mux.is_running());

    bar.reset(Some("stopped early")).unwrap();
    assert_eq!(bar.phase(), Phase::Stopped);
    assert!(!mux.is_running());
    assert!(contents(&out).contains("stopped early"));
}

struct SlowRender;
impl FrameRender for SlowRender {
    fn render_frame(&self, out: &mut String, _frame: &Frame<'_>) {
        std::thread::sleep(Duration::from_millis(150));
        out.push_str("still going");
    }
}

#[test]
fn completion_during_a_slow_render_still_gets_its_final_frame() {
    fast();
    let out = buffer();
    let mux = buffer_mux(&out);
    let bar = barmux::bar("landing")
        .total(2)
        .when_done("wrapped up")
        .renderer(SlowRender)
        .multiplexer(&mux)
        .build();

    // the completing tick lands while the worker is in the middle of
    // drawing a running frame; the slot must survive that cycle and get
    // its final frame on the next one
    bar.tick().unwrap();
    std::thread::sleep(Duration::from_millis(30));
    bar.tick().unwrap();

    assert_eq!(bar.phase(), Phase::Finish);
    assert!(!mux.is_running());
    assert!(contents(&out).contains("wrapped up"), "{:?}", contents(&out));
}

struct ExplodingRender;
impl FrameRender for ExplodingRender {
    fn render_frame(&self, _out: &mut String, _frame: &Frame<'_>) {
        panic!("render exploded");
    }
}

#[test]
fn renderer_panic_surfaces_on_the_calling_thread() {
    fast();
    let out = buffer();
    let mux = buffer_mux(&out);
    let bar = barmux::bar("doomed")
        .total(10)
        .renderer(ExplodingRender)
        .multiplexer(&mux)
        .build();

    // activation runs the first frame synchronously, so the panic comes
    // back from the starting tick
    let err = bar.tick().unwrap_err();
    assert!(format!("{err:#}").contains("render exploded"), "{err:#}");
    assert_eq!(bar.phase(), Phase::Stopped);
    assert!(!mux.is_running());
}

struct ExplodesLater;
impl FrameRender for ExplodesLater {
    fn render_frame(&self, out: &mut String, frame: &Frame<'_>) {
        if frame.done >= 2 {
            panic!("render exploded late");
        }
        out.push_str(frame.message);
    }
}

#[test]
fn renderer_panic_mid_run_surfaces_on_the_next_interaction() {
    fast();
    let out = buffer();
    let mux = buffer_mux(&out);
    let bar = barmux::bar("doomed")
        .total(3)
        .renderer(ExplodesLater)
        .multiplexer(&mux)
        .build();

    bar.tick().unwrap();
    bar.tick().unwrap();
    // let the worker hit the panic and park itself
    std::thread::sleep(Duration::from_millis(100));

    let err = bar.tick().unwrap_err();
    assert!(format!("{err:#}").contains("render exploded late"), "{err:#}");
    assert!(!mux.is_running());
}
