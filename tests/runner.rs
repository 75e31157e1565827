use std::sync::Arc;
use std::sync::mpsc::Receiver;
use std::time::Duration;

use image_enlarger::{
    Activity, Bitmap, Delivery, EnlargeParams, EnlargeRequest, EnlargeRunner, Format, Plane, Rgb,
    RunnerEvent, RunnerEventKind, RunnerState,
};

const WAIT: Duration = Duration::from_secs(60);

fn request(width: usize, height: usize, scale: f32) -> EnlargeRequest {
    EnlargeRequest {
        source: Arc::new(Bitmap::Rgb(Plane::filled(width, height, Rgb::splat(0.4)))),
        format: Format::uniform(width, height, scale),
        params: EnlargeParams::default(),
        delivery: Delivery::InMemory,
    }
}

fn wait_for_start(rx: &Receiver<RunnerEvent>, id: u64) {
    loop {
        let event = rx.recv_timeout(WAIT).expect("runner event");
        if event.request == id && matches!(event.kind, RunnerEventKind::Progress(0)) {
            return;
        }
    }
}

#[test]
fn newer_request_supersedes_one_in_flight() {
    let (mut runner, rx) = EnlargeRunner::with_channel(11).unwrap();
    runner.set_activity(Activity::None);
    let first = runner.request(request(48, 32, 2.0));
    // The worker has started the first request and is parked at a checkpoint.
    wait_for_start(&rx, first);

    let second = runner.request(request(20, 10, 3.0));
    runner.set_activity(Activity::High);

    let mut first_events = Vec::new();
    let terminal = loop {
        let event = rx.recv_timeout(WAIT).expect("runner event");
        assert_eq!(event.runner, 11);
        if event.request == first {
            first_events.push(event.kind);
            continue;
        }
        assert_eq!(event.request, second);
        if event.kind.is_terminal() {
            break event;
        }
    };
    match terminal.kind {
        RunnerEventKind::Delivered(bitmap) => assert_eq!(bitmap.dimensions(), (60, 30)),
        other => panic!("unexpected {other:?}"),
    }
    assert!(
        matches!(first_events.as_slice(), [RunnerEventKind::Progress(100)]),
        "{first_events:?}"
    );

    while let Ok(event) = rx.recv_timeout(Duration::from_millis(300)) {
        assert_ne!(event.request, first, "{event:?}");
        assert!(!event.kind.is_terminal(), "{event:?}");
    }
    assert_eq!(runner.state(), RunnerState::Idle);
}

#[test]
fn cancel_mid_run_reports_full_progress() {
    let (mut runner, rx) = EnlargeRunner::with_channel(13).unwrap();
    runner.set_activity(Activity::None);
    let id = runner.request(request(64, 64, 3.0));
    wait_for_start(&rx, id);

    runner.cancel();
    let event = rx.recv_timeout(WAIT).expect("runner event");
    assert_eq!(event.request, id);
    assert!(matches!(event.kind, RunnerEventKind::Progress(100)), "{event:?}");

    while let Ok(event) = rx.recv_timeout(Duration::from_millis(300)) {
        assert!(!event.kind.is_terminal(), "{event:?}");
    }
    assert_eq!(runner.state(), RunnerState::Idle);
}

#[test]
fn low_activity_still_finishes() {
    let (mut runner, rx) = EnlargeRunner::with_channel(12).unwrap();
    runner.set_activity(Activity::Low);
    let id = runner.request(request(16, 16, 2.5));
    let terminal = loop {
        let event = rx.recv_timeout(WAIT).expect("runner event");
        if event.kind.is_terminal() {
            break event;
        }
    };
    assert_eq!(terminal.request, id);
    assert!(matches!(terminal.kind, RunnerEventKind::Delivered(_)));
}
