//! Whole-session runs against the mock transport.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use pronto_core::{
    ConsoleConfig, ConsoleError, Disposition, LineBus, MockTransport, NullObserver, Operation,
    PrintMode, PrintOrigin, PrinterConsole, PrinterTransport, TransportError, UploadState,
};
use tempfile::TempDir;

const WAIT: Duration = Duration::from_secs(2);

fn console() -> (Arc<MockTransport>, PrinterConsole) {
    let mock = Arc::new(MockTransport::new());
    let bus = Arc::new(LineBus::new());
    mock.attach(&bus);
    let config = ConsoleConfig {
        listing_timeout_ms: 200,
        poll_interval_ms: 5,
        ..ConsoleConfig::default()
    };
    let console = PrinterConsole::new(mock.clone(), bus, Arc::new(NullObserver), config);
    (mock, console)
}

fn gcode_file(lines: usize) -> (TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cube.gcode");
    let body: String = (0..lines).map(|i| format!("G1 X{} Y{}\n", i, i)).collect();
    fs::write(&path, body).unwrap();
    (dir, path)
}

fn wait_for(cond: impl Fn() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !cond() {
        assert!(Instant::now() < deadline, "condition not reached");
        thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn upload_streams_closes_and_confirms() {
    let (mock, console) = console();
    let (_dir, path) = gcode_file(10);
    mock.set_auto_drain(true);
    mock.reply_to("M20", &["Begin file list", "CUBE.G", "End file list"]);

    let handle = console.start_upload(&path, "cube.g").unwrap();
    let report = handle.wait(WAIT).unwrap();

    assert_eq!(report.target, "cube.g");
    assert_eq!(report.lines, 10);
    assert_eq!(handle.progress(), (10, 10));
    assert_eq!(handle.state(), UploadState::Done);
    assert_eq!(mock.get_commands(), vec!["M28 cube.g", "M29 cube.g", "M20"]);
    assert_eq!(mock.streamed_lines().len(), 10);
    assert!(console.context().bus.is_empty());
}

#[test]
fn cancelled_upload_still_closes_the_file() {
    let (mock, console) = console();
    let (_dir, path) = gcode_file(10);

    let handle = console.start_upload(&path, "cube.g").unwrap();
    wait_for(|| mock.queue_length() == 10);
    mock.advance_queue(4);
    handle.cancel();

    let err = handle.wait(WAIT).unwrap_err();
    match err {
        ConsoleError::UploadInterrupted {
            ref target,
            sent,
            total,
        } => {
            assert_eq!(target, "cube.g");
            assert_eq!((sent, total), (4, 10));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(err.to_string().contains("cube.g"));
    assert_eq!(mock.get_commands(), vec!["M28 cube.g", "M29 cube.g"]);

    // Nothing past the cancel point reaches the printer.
    mock.advance_queue(3);
    assert_eq!(mock.streamed_lines().len(), 4);
    assert_eq!(handle.state(), UploadState::Failed);
}

#[test]
fn upload_refused_by_card_reports_open_failure() {
    let (mock, console) = console();
    let (_dir, path) = gcode_file(5);
    mock.reply_to("M28", &["open failed, File: cube.g."]);

    let err = console
        .start_upload(&path, "cube.g")
        .unwrap()
        .wait(WAIT)
        .unwrap_err();

    assert!(matches!(
        err,
        ConsoleError::CardOpenFailed {
            operation: Operation::Upload,
            ..
        }
    ));
    assert_eq!(mock.get_commands(), vec!["M28 cube.g", "M29 cube.g"]);
}

#[test]
fn upload_fails_when_printer_goes_offline() {
    let (mock, console) = console();
    let (_dir, path) = gcode_file(3);

    let handle = console.start_upload(&path, "cube.g").unwrap();
    wait_for(|| mock.queue_length() == 3);
    mock.advance_queue(1);
    mock.set_connected(false);

    let err = handle.wait(WAIT).unwrap_err();
    assert!(matches!(
        err,
        ConsoleError::Transport(TransportError::Disconnected)
    ));
    assert_eq!(handle.state(), UploadState::Failed);
    assert_eq!(handle.progress(), (1, 3));
    assert!(!mock.is_printing());
}

#[test]
fn upload_losing_the_link_before_streaming_reports_it() {
    let (mock, console) = console();
    let (_dir, path) = gcode_file(3);
    mock.reply_to("M28", &["Writing to file: cube.g"]);
    let link = mock.clone();
    console.context().bus.register(Arc::new(
        move |line: &str| -> anyhow::Result<Disposition> {
            if line.starts_with("Writing to file") {
                link.set_connected(false);
                return Ok(Disposition::Done);
            }
            Ok(Disposition::Keep)
        },
    ));

    let err = console
        .start_upload(&path, "cube.g")
        .unwrap()
        .wait(WAIT)
        .unwrap_err();
    assert!(matches!(
        err,
        ConsoleError::Transport(TransportError::NotConnected)
    ));
    assert_eq!(mock.get_commands(), vec!["M28 cube.g"]);
    assert_eq!(mock.queue_length(), 0);
}

#[test]
fn upload_refused_while_host_print_runs() {
    let (mock, console) = console();
    let (_dir, print) = gcode_file(8);
    let (_other, upload) = gcode_file(2);
    let lines = pronto_core::gcode::load_lines(&print).unwrap();

    console.start_host_print(lines).unwrap();
    mock.advance_queue(3);

    let err = console.start_upload(&upload, "u.g").err().unwrap();
    assert!(matches!(
        err,
        ConsoleError::InvalidStateTransition {
            operation: Operation::Upload,
            mode: PrintMode::Printing,
        }
    ));
    assert!(mock.get_commands().is_empty());
    assert_eq!(mock.queue_length(), 8);
    assert_eq!(console.current_progress().host, (3, 8));

    console.pause().unwrap();
    assert!(console.start_upload(&upload, "u.g").is_err());
}

#[test]
fn upload_missing_from_listing_is_unconfirmed() {
    let (mock, console) = console();
    let (_dir, path) = gcode_file(3);
    mock.set_auto_drain(true);
    mock.reply_to("M20", &["Begin file list", "other.g", "End file list"]);

    let err = console
        .start_upload(&path, "cube.g")
        .unwrap()
        .wait(WAIT)
        .unwrap_err();
    assert!(matches!(err, ConsoleError::UploadUnconfirmed { .. }));
}

#[test]
fn upload_of_missing_local_file_sends_nothing() {
    let (mock, console) = console();
    let dir = tempfile::tempdir().unwrap();

    let err = console
        .start_upload(dir.path().join("nope.gcode"), "nope.g")
        .err()
        .unwrap();
    assert!(matches!(err, ConsoleError::LocalFileNotFound { .. }));
    assert!(mock.get_commands().is_empty());
}

#[test]
fn offline_upload_fails_before_reading_the_file() {
    let (mock, console) = console();
    mock.set_connected(false);

    let err = console.start_upload("/nonexistent.g", "x.g").err().unwrap();
    assert!(matches!(
        err,
        ConsoleError::NotConnected {
            operation: Operation::Upload
        }
    ));
}

#[test]
fn card_print_of_absent_file_only_lists() {
    let (mock, console) = console();
    mock.reply_to("M20", &["Begin file list", "a.g", "End file list"]);

    let err = console.start_card_print("b.g").err().unwrap();
    assert!(matches!(err, ConsoleError::FileNotOnCard { ref target } if target == "b.g"));
    assert_eq!(mock.get_commands(), vec!["M20"]);
    assert_eq!(console.current_progress().mode, PrintMode::Idle);
}

#[test]
fn card_print_runs_pauses_and_finishes() {
    let (mock, console) = console();
    mock.reply_to("M20", &["Begin file list", "cube.g", "End file list"]);
    mock.reply_to("M23", &["File opened: cube.g Size: 1000", "File selected"]);

    let handle = console.start_card_print("CUBE.G").unwrap();
    handle.started.wait(WAIT).unwrap();

    let progress = console.current_progress();
    assert_eq!(progress.mode, PrintMode::Printing);
    assert_eq!(progress.origin, Some(PrintOrigin::Card));

    let bus = console.context().bus.clone();
    bus.dispatch("SD printing byte 250/1000");
    assert_eq!(console.current_progress().percent, Some(25.0));

    console.pause().unwrap();
    assert_eq!(console.current_progress().mode, PrintMode::Paused);
    assert!(console.pause().is_err());
    console.resume().unwrap();

    bus.dispatch("Done printing file");
    let report = handle.finished.wait(WAIT).unwrap();
    assert_eq!(report.target, "cube.g");
    assert_eq!(console.current_progress().mode, PrintMode::Idle);
    assert_eq!(
        mock.get_commands(),
        vec!["M20", "M23 cube.g", "M24", "M25", "M24"]
    );
}

#[test]
fn host_print_pause_holds_cursor() {
    let (mock, console) = console();
    let (_dir, path) = gcode_file(8);
    let lines = pronto_core::gcode::load_lines(&path).unwrap();

    console.start_host_print(lines).unwrap();
    mock.advance_queue(3);
    console.pause().unwrap();
    mock.advance_queue(3);
    assert_eq!(console.current_progress().host, (3, 8));
    assert!(console.pause().is_err());

    console.resume().unwrap();
    mock.advance_queue(5);
    let progress = console.current_progress();
    assert_eq!(progress.mode, PrintMode::Idle);
    assert_eq!(progress.percent, Some(100.0));
    assert!(console.resume().is_err());
}
