//! Mock printer transport for testing.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};

use super::traits::{PrinterTransport, TransportError};
use crate::bus::LineBus;

#[derive(Debug, Default)]
struct PrintQueue {
    lines: Vec<String>,
    cursor: usize,
    paused: bool,
    streaming: bool,
}

/// Mock transport for unit testing session logic.
///
/// Records every immediate command and lets tests move the print queue
/// cursor by hand. Scripted replies are dispatched into the attached bus
/// synchronously when a matching command is sent.
pub struct MockTransport {
    /// Captured immediate commands.
    command_log: Arc<Mutex<Vec<String>>>,
    /// Print queue state.
    queue: Arc<Mutex<PrintQueue>>,
    /// Replies keyed by command prefix; each entry answers once.
    replies: Arc<Mutex<VecDeque<(String, Vec<String>)>>>,
    /// Drain the whole queue as soon as a print starts.
    auto_drain: Arc<Mutex<bool>>,
    /// Whether printer is "connected".
    connected: Arc<Mutex<bool>>,
    bus: Mutex<Weak<LineBus>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            command_log: Arc::new(Mutex::new(Vec::new())),
            queue: Arc::new(Mutex::new(PrintQueue::default())),
            replies: Arc::new(Mutex::new(VecDeque::new())),
            auto_drain: Arc::new(Mutex::new(false)),
            connected: Arc::new(Mutex::new(true)),
            bus: Mutex::new(Weak::new()),
        }
    }

    /// Bus that scripted replies are dispatched into.
    pub fn attach(&self, bus: &Arc<LineBus>) {
        *self.bus.lock().unwrap() = Arc::downgrade(bus);
    }

    /// Answer the next command starting with `prefix` with `lines`.
    pub fn reply_to(&self, prefix: &str, lines: &[&str]) {
        self.replies.lock().unwrap().push_back((
            prefix.to_string(),
            lines.iter().map(|l| l.to_string()).collect(),
        ));
    }

    /// Make `start_print` consume its queue immediately.
    pub fn set_auto_drain(&self, enabled: bool) {
        *self.auto_drain.lock().unwrap() = enabled;
    }

    /// Simulate the printer acknowledging `n` queued lines.
    ///
    /// Has no effect while paused or after the queue is stopped.
    pub fn advance_queue(&self, n: usize) {
        let mut q = self.queue.lock().unwrap();
        if !q.streaming || q.paused {
            return;
        }
        q.cursor = (q.cursor + n).min(q.lines.len());
        if q.cursor == q.lines.len() {
            q.streaming = false;
        }
    }

    /// Queued lines the printer has consumed so far.
    pub fn streamed_lines(&self) -> Vec<String> {
        let q = self.queue.lock().unwrap();
        q.lines[..q.cursor].to_vec()
    }

    pub fn is_paused(&self) -> bool {
        self.queue.lock().unwrap().paused
    }

    /// Get all captured immediate commands.
    pub fn get_commands(&self) -> Vec<String> {
        self.command_log.lock().unwrap().clone()
    }

    /// Clear captured commands.
    pub fn clear_commands(&self) {
        self.command_log.lock().unwrap().clear();
    }

    /// Simulate printer going offline.
    pub fn set_connected(&self, connected: bool) {
        *self.connected.lock().unwrap() = connected;
    }

    fn take_reply(&self, command: &str) -> Option<Vec<String>> {
        let mut replies = self.replies.lock().unwrap();
        let idx = replies
            .iter()
            .position(|(prefix, _)| command.starts_with(prefix.as_str()))?;
        replies.remove(idx).map(|(_, lines)| lines)
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl PrinterTransport for MockTransport {
    fn is_connected(&self) -> bool {
        *self.connected.lock().unwrap()
    }

    fn send_now(&self, command: &str) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        self.command_log.lock().unwrap().push(command.to_string());

        if let Some(lines) = self.take_reply(command) {
            let bus = self.bus.lock().unwrap().upgrade();
            if let Some(bus) = bus {
                for line in &lines {
                    bus.dispatch(line);
                }
            }
        }
        Ok(())
    }

    fn start_print(&self, lines: Vec<String>) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let drain = *self.auto_drain.lock().unwrap();
        let mut q = self.queue.lock().unwrap();
        q.cursor = if drain { lines.len() } else { 0 };
        q.streaming = !drain && !lines.is_empty();
        q.paused = false;
        q.lines = lines;
        Ok(())
    }

    fn pause(&self) {
        self.queue.lock().unwrap().paused = true;
    }

    fn resume(&self) {
        self.queue.lock().unwrap().paused = false;
    }

    fn stop_print(&self) {
        let mut q = self.queue.lock().unwrap();
        q.streaming = false;
        q.paused = false;
        let cursor = q.cursor;
        q.lines.truncate(cursor);
    }

    fn is_printing(&self) -> bool {
        self.queue.lock().unwrap().streaming
    }

    fn queue_cursor(&self) -> usize {
        self.queue.lock().unwrap().cursor
    }

    fn queue_length(&self) -> usize {
        self.queue.lock().unwrap().lines.len()
    }

    fn disconnect(&self) {
        self.set_connected(false);
    }
}
