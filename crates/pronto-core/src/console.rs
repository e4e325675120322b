//! Printer console - the operator-facing facade over one printer link.
//!
//! Wires the transport, the line bus, shared print progress and the
//! observer together, and exposes every console operation as a method.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, instrument};

use crate::bus::{Disposition, LineBus};
use crate::config::{ConsoleConfig, Heater};
use crate::error::{ConsoleError, Operation, Result};
use crate::events::ConsoleObserver;
use crate::progress::{PrintController, PrintMode, PrintOrigin, ProgressSnapshot, SharedProgress};
use crate::protocol::{self, Axis, markers};
use crate::session::{
    self, CardListing, CardPrintHandle, Completion, SessionContext, SessionHandle, UploadHandle,
};
use crate::transport::{PrinterTransport, StreamTransport};

/// One connected printer.
pub struct PrinterConsole {
    config: ConsoleConfig,
    ctx: SessionContext,
    controller: PrintController,
}

impl PrinterConsole {
    /// Console over an existing transport. The transport must feed `bus`.
    pub fn new(
        transport: Arc<dyn PrinterTransport>,
        bus: Arc<LineBus>,
        observer: Arc<dyn ConsoleObserver>,
        config: ConsoleConfig,
    ) -> Self {
        let controller = PrintController::new(transport.clone(), SharedProgress::new());
        Self {
            config,
            ctx: SessionContext {
                bus,
                transport,
                observer,
            },
            controller,
        }
    }

    /// Open the configured device node.
    #[instrument(skip_all)]
    pub fn open(config: ConsoleConfig, observer: Arc<dyn ConsoleObserver>) -> Result<Self> {
        let port = config.port.clone().ok_or_else(|| {
            ConsoleError::InvalidArgument("no printer port configured".into())
        })?;
        let bus = Arc::new(LineBus::with_observer(observer.clone()));
        let transport = StreamTransport::open(&port, config.baud, bus.clone(), observer.clone())?;
        Ok(Self::new(Arc::new(transport), bus, observer, config))
    }

    pub fn config(&self) -> &ConsoleConfig {
        &self.config
    }

    pub fn context(&self) -> &SessionContext {
        &self.ctx
    }

    pub fn progress(&self) -> &SharedProgress {
        self.controller.progress()
    }

    pub fn is_connected(&self) -> bool {
        self.ctx.transport.is_connected()
    }

    pub fn disconnect(&self) {
        self.ctx.transport.disconnect();
    }

    /// Start an M20 listing without waiting for it.
    pub fn start_listing(&self) -> Result<SessionHandle<CardListing>> {
        session::start_listing(&self.ctx)
    }

    /// List the card and return the names sorted.
    pub fn list_files(&self) -> Result<Vec<String>> {
        let files = self.start_listing()?.wait(self.config.listing_timeout())?;
        let mut files: Vec<String> = files.into_iter().collect();
        files.sort();
        Ok(files)
    }

    /// Upload a local file to the card.
    ///
    /// Refused while a print is running or paused, since the upload
    /// streams through the same queue.
    pub fn start_upload(&self, local_path: impl AsRef<Path>, target: &str) -> Result<UploadHandle> {
        let mode = self.controller.current_progress().mode;
        if mode != PrintMode::Idle {
            return Err(ConsoleError::InvalidStateTransition {
                operation: Operation::Upload,
                mode,
            });
        }
        session::start_upload(&self.ctx, local_path, target, self.config.upload_settings())
    }

    /// Start printing `target` from the card.
    ///
    /// Refused while another print is running or paused.
    pub fn start_card_print(&self, target: &str) -> Result<CardPrintHandle> {
        let mode = self.controller.current_progress().mode;
        if mode != PrintMode::Idle {
            return Err(ConsoleError::InvalidStateTransition {
                operation: Operation::CardPrint,
                mode,
            });
        }
        session::start_card_print(
            &self.ctx,
            self.controller.progress(),
            target,
            self.config.listing_timeout(),
        )
    }

    /// Stream `lines` from the host.
    pub fn start_host_print(&self, lines: Vec<String>) -> Result<()> {
        self.controller.start_host_print(lines)
    }

    pub fn pause(&self) -> Result<()> {
        self.controller.pause()
    }

    pub fn resume(&self) -> Result<()> {
        self.controller.resume()
    }

    pub fn current_progress(&self) -> ProgressSnapshot {
        self.controller.current_progress()
    }

    /// Send M105 and wait for the reply, formatted for display.
    pub fn query_temperature(&self, timeout: Duration) -> Result<String> {
        self.ctx.require_connection(Operation::Temperature)?;
        let (completion, rx) = Completion::new();
        let id = self.ctx.bus.register(Arc::new(
            move |line: &str| -> anyhow::Result<Disposition> {
                if line.contains(markers::TEMPERATURE_REPLY) {
                    completion.complete(Ok(markers::format_temperature(line)));
                    return Ok(Disposition::Done);
                }
                Ok(Disposition::Keep)
            },
        ));
        let handle = SessionHandle::new(
            Operation::Temperature,
            "printer",
            rx,
            self.ctx.bus.clone(),
            vec![id],
        );
        if let Err(e) = self.ctx.transport.send_now(protocol::REPORT_TEMPERATURE) {
            handle.abandon();
            return Err(e.into());
        }
        handle.wait(timeout)
    }

    /// Last temperature line seen on the link, formatted for display.
    pub fn latest_temperature(&self) -> Option<String> {
        self.ctx
            .bus
            .latest_temperature()
            .map(|line| markers::format_temperature(&line))
    }

    /// Ask for temperatures, and for card progress while a card print runs.
    pub fn poll_status(&self) -> Result<()> {
        self.ctx.require_connection(Operation::Temperature)?;
        self.ctx.transport.send_now(protocol::REPORT_TEMPERATURE)?;
        let snapshot = self.controller.current_progress();
        if snapshot.mode != PrintMode::Idle && snapshot.origin == Some(PrintOrigin::Card) {
            self.ctx.transport.send_now(protocol::REPORT_CARD_PROGRESS)?;
        }
        Ok(())
    }

    /// Send an operator-typed G or M command, uppercased.
    pub fn send_raw(&self, line: &str) -> Result<String> {
        let command = protocol::passthrough(line).ok_or_else(|| {
            ConsoleError::InvalidArgument(format!("'{}' is not a G or M command", line.trim()))
        })?;
        self.ctx.require_connection(Operation::Command)?;
        self.ctx.transport.send_now(&command)?;
        Ok(command)
    }

    /// Set a heater target from a number or a preset name.
    #[instrument(skip(self))]
    pub fn set_temperature(&self, heater: Heater, arg: &str) -> Result<f64> {
        let celsius = self.config.resolve_temperature(heater, arg)?;
        self.ctx.require_connection(Operation::Command)?;
        let command = match heater {
            Heater::Hotend => protocol::set_hotend_temperature(celsius),
            Heater::Bed => protocol::set_bed_temperature(celsius),
        };
        self.ctx.transport.send_now(&command)?;
        info!(celsius, ?heater, "Heater target set");
        Ok(celsius)
    }

    /// Relative move of one axis.
    ///
    /// Refused while a host print is streaming; a paused print allows it.
    pub fn move_axis(&self, axis: Axis, distance: f64, feed: Option<u32>) -> Result<()> {
        self.ctx.require_connection(Operation::Move)?;
        let snapshot = self.controller.current_progress();
        if snapshot.mode == PrintMode::Printing && snapshot.origin == Some(PrintOrigin::Host) {
            return Err(ConsoleError::InvalidStateTransition {
                operation: Operation::Move,
                mode: snapshot.mode,
            });
        }
        let feed = feed.unwrap_or_else(|| axis.default_feed());
        for command in protocol::relative_move(axis, distance, feed) {
            self.ctx.transport.send_now(&command)?;
        }
        Ok(())
    }

    /// Push filament; a negative length retracts.
    pub fn extrude(&self, length: Option<f64>, feed: Option<u32>) -> Result<()> {
        let length = length.unwrap_or(protocol::DEFAULT_EXTRUDE_MM);
        self.move_axis(
            Axis::E,
            length,
            Some(feed.unwrap_or(protocol::DEFAULT_EXTRUDE_FEED)),
        )
    }

    /// Pull filament back.
    pub fn reverse(&self, length: Option<f64>, feed: Option<u32>) -> Result<()> {
        self.extrude(
            Some(-length.unwrap_or(protocol::DEFAULT_EXTRUDE_MM).abs()),
            feed,
        )
    }
}
