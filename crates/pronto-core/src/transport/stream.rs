//! Plain-line transport over a character device or any byte stream.
//!
//! Two threads serve the link. The reader splits inbound bytes into lines
//! and hands each one to the [`LineBus`]. The sender writes one command at
//! a time and waits for the printer's `ok` before the next, taking
//! immediate commands ahead of the print queue.
//!
//! Line settings (baud, parity) are left to the OS; the device node is
//! opened as a file.

use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;

use tracing::{debug, error, info, instrument, trace, warn};

use super::traits::{PrinterTransport, TransportError};
use crate::bus::LineBus;
use crate::events::{ConsoleEvent, ConsoleObserver};
use crate::protocol::{self, markers};

#[derive(Debug, Default)]
struct LinkQueue {
    priority: VecDeque<String>,
    lines: Vec<String>,
    cursor: usize,
    streaming: bool,
    paused: bool,
    /// Printer acknowledged the last write.
    clear: bool,
}

impl LinkQueue {
    /// Next line to write, if the printer is ready for one.
    fn next_line(&mut self) -> Option<String> {
        if !self.clear {
            return None;
        }
        if let Some(command) = self.priority.pop_front() {
            self.clear = false;
            return Some(command);
        }
        if !self.streaming || self.paused {
            return None;
        }
        while self.cursor < self.lines.len() {
            let line = strip_comment(&self.lines[self.cursor]).to_string();
            self.cursor += 1;
            if !line.is_empty() {
                self.clear = false;
                self.finish_if_drained();
                return Some(line);
            }
        }
        self.finish_if_drained();
        None
    }

    fn finish_if_drained(&mut self) {
        if self.cursor >= self.lines.len() {
            self.streaming = false;
        }
    }
}

fn strip_comment(line: &str) -> &str {
    line.split(';').next().unwrap_or_default().trim()
}

struct Link {
    queue: Mutex<LinkQueue>,
    wake: Condvar,
    online: AtomicBool,
    closed: AtomicBool,
    observer: Arc<dyn ConsoleObserver>,
}

impl Link {
    fn lock(&self) -> MutexGuard<'_, LinkQueue> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn mark_online(&self) {
        if !self.online.swap(true, Ordering::AcqRel) {
            info!("Printer is online");
            self.observer.on_event(&ConsoleEvent::Online);
        }
    }

    fn acknowledge(&self) {
        self.lock().clear = true;
        self.wake.notify_all();
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.online.store(false, Ordering::Release);
            let mut queue = self.lock();
            queue.streaming = false;
            queue.paused = false;
            drop(queue);
            self.wake.notify_all();
            self.observer.on_event(&ConsoleEvent::Offline);
        }
    }
}

/// Transport speaking plain G-code lines with `ok` flow control.
pub struct StreamTransport {
    link: Arc<Link>,
}

impl StreamTransport {
    /// Open a printer device node read/write.
    #[instrument(skip(bus, observer))]
    pub fn open(
        port: &str,
        baud: u32,
        bus: Arc<LineBus>,
        observer: Arc<dyn ConsoleObserver>,
    ) -> Result<Self, TransportError> {
        let device = OpenOptions::new()
            .read(true)
            .write(true)
            .open(port)
            .map_err(|e| TransportError::OpenFailed {
                port: port.to_string(),
                message: e.to_string(),
            })?;
        let reader = device.try_clone()?;
        info!(port, baud, "Opened printer device");
        Self::from_parts(reader, device, bus, observer)
    }

    /// Build a transport over an already open byte stream.
    pub fn from_parts(
        reader: impl Read + Send + 'static,
        writer: impl Write + Send + 'static,
        bus: Arc<LineBus>,
        observer: Arc<dyn ConsoleObserver>,
    ) -> Result<Self, TransportError> {
        let link = Arc::new(Link {
            queue: Mutex::new(LinkQueue {
                clear: true,
                ..LinkQueue::default()
            }),
            wake: Condvar::new(),
            online: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            observer,
        });
        // Some firmware stays silent until spoken to.
        link.lock()
            .priority
            .push_back(protocol::REPORT_TEMPERATURE.to_string());

        let reader_link = link.clone();
        thread::Builder::new()
            .name("printer-reader".into())
            .spawn(move || read_lines(reader_link, reader, bus))?;

        let sender_link = link.clone();
        thread::Builder::new()
            .name("printer-sender".into())
            .spawn(move || send_lines(sender_link, writer))?;

        Ok(Self { link })
    }

    fn writable(&self) -> Result<(), TransportError> {
        if self.link.closed.load(Ordering::Acquire) {
            Err(TransportError::Disconnected)
        } else if !self.link.online.load(Ordering::Acquire) {
            Err(TransportError::NotConnected)
        } else {
            Ok(())
        }
    }
}

fn read_lines(link: Arc<Link>, reader: impl Read, bus: Arc<LineBus>) {
    let mut reader = BufReader::new(reader);
    let mut raw = Vec::new();
    loop {
        raw.clear();
        match reader.read_until(b'\n', &mut raw) {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!(error = %e, "Printer read failed");
                break;
            }
        }
        if link.closed.load(Ordering::Acquire) {
            break;
        }
        // Firmware resets can put noise on the line.
        let line = String::from_utf8_lossy(&raw);
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        trace!(line, "Received");
        if line.starts_with(markers::ACK) || line.starts_with("start") {
            link.mark_online();
            link.acknowledge();
        }
        bus.dispatch(line);
    }
    debug!("Reader finished");
    link.close();
}

fn send_lines(link: Arc<Link>, mut writer: impl Write) {
    loop {
        let line = {
            let mut queue = link.lock();
            loop {
                if link.closed.load(Ordering::Acquire) {
                    return;
                }
                if let Some(line) = queue.next_line() {
                    break line;
                }
                queue = link.wake.wait(queue).unwrap_or_else(|e| e.into_inner());
            }
        };
        trace!(line = %line, "Sending");
        if let Err(e) = writeln!(writer, "{}", line).and_then(|_| writer.flush()) {
            error!(error = %e, "Printer write failed");
            link.close();
            return;
        }
    }
}

impl PrinterTransport for StreamTransport {
    fn is_connected(&self) -> bool {
        self.writable().is_ok()
    }

    fn send_now(&self, command: &str) -> Result<(), TransportError> {
        self.writable()?;
        self.link.lock().priority.push_back(command.to_string());
        self.link.wake.notify_all();
        Ok(())
    }

    fn start_print(&self, lines: Vec<String>) -> Result<(), TransportError> {
        self.writable()?;
        let mut queue = self.link.lock();
        queue.cursor = 0;
        queue.streaming = !lines.is_empty();
        queue.paused = false;
        queue.lines = lines;
        drop(queue);
        self.link.wake.notify_all();
        Ok(())
    }

    fn pause(&self) {
        self.link.lock().paused = true;
    }

    fn resume(&self) {
        self.link.lock().paused = false;
        self.link.wake.notify_all();
    }

    fn stop_print(&self) {
        let mut queue = self.link.lock();
        queue.streaming = false;
        queue.paused = false;
        let cursor = queue.cursor;
        queue.lines.truncate(cursor);
    }

    fn is_printing(&self) -> bool {
        self.link.lock().streaming
    }

    fn queue_cursor(&self) -> usize {
        self.link.lock().cursor
    }

    fn queue_length(&self) -> usize {
        self.link.lock().lines.len()
    }

    fn disconnect(&self) {
        info!("Disconnecting");
        self.link.close();
    }
}

impl Drop for StreamTransport {
    fn drop(&mut self) {
        self.link.close();
    }
}
