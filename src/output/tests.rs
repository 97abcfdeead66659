//! Unit tests for bounded output capture.

use std::time::Duration;

use rstest::rstest;

use super::*;

#[rstest]
fn ring_buffer_keeps_newest_lines() {
    let mut buffer = LineBuffer::with_capacity(1000);
    for n in 0..1500 {
        buffer.push(format!("line {n}"));
    }

    assert_eq!(buffer.len(), 1000);
    assert_eq!(buffer.iter().next(), Some("line 500"));
    assert_eq!(buffer.last(), Some("line 1499"));
}

#[rstest]
fn zero_capacity_retains_nothing() {
    let mut buffer = LineBuffer::with_capacity(0);
    buffer.push("ignored");
    assert!(buffer.is_empty());
}

#[rstest]
fn streams_are_bounded_independently() {
    let mut output = CommandOutput::start("echo", 2);
    for n in 0..5 {
        output.push_stdout(format!("out {n}"));
    }
    output.push_stderr("err");

    assert_eq!(output.stdout().iter().collect::<Vec<_>>(), ["out 3", "out 4"]);
    assert_eq!(output.stderr().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn running_flag_tracks_finish() {
    let mut output = CommandOutput::start("sleep 3", DEFAULT_MAX_LINES);
    assert!(output.is_running());
    assert_eq!(output.elapsed(), None);
    assert_eq!(output.finished_at(), None);

    tokio::time::sleep(Duration::from_secs(3)).await;
    output.finish(Some(0));

    assert!(!output.is_running());
    assert!(output.succeeded());
    assert_eq!(output.elapsed(), Some(Duration::from_secs(3)));
    assert!(output.finished_at().is_some());
}

#[rstest]
fn render_selects_streams() {
    let mut output = CommandOutput::start("cmd", 10);
    output.push_stdout("a");
    output.push_stderr("b");

    assert_eq!(output.render(OutputStream::Stdout), "a\n");
    assert_eq!(output.render(OutputStream::Stderr), "b\n");
    assert_eq!(output.render(OutputStream::Both), "a\nb\n");
}

#[rstest]
fn begin_discards_previous_output() {
    let shared = SharedOutput::new();
    shared.begin("first", 10);
    shared.push_stdout(String::from("old"));
    shared.finish(Some(1));

    shared.begin("second", 10);
    let current = shared.snapshot().expect("output should be present");
    assert_eq!(current.command(), "second");
    assert!(current.stdout().is_empty());
    assert!(current.is_running());
}

#[rstest]
fn pushes_before_begin_are_dropped() {
    let shared = SharedOutput::new();
    shared.push_stdout(String::from("lost"));
    assert!(shared.snapshot().is_none());
}
