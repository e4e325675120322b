//! Command dispatch for the interactive console.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use pronto_core::gcode;
use pronto_core::protocol::{self, Axis};
use pronto_core::{
    ConsoleConfig, ConsoleError, ConsoleObserver, Heater, Operation, PrintMode, PrinterConsole,
};
use tracing::{debug, warn};

use crate::alias::AliasTable;

/// Built-in command names, in help order.
pub const BUILTINS: &[&str] = &[
    "connect",
    "disconnect",
    "load",
    "print",
    "upload",
    "ls",
    "sdprint",
    "pause",
    "resume",
    "monitor",
    "gettemp",
    "settemp",
    "bedtemp",
    "move",
    "extrude",
    "reverse",
    "alias",
    "help",
    "exit",
];

const MAX_ALIAS_DEPTH: usize = 8;
const TICK: Duration = Duration::from_millis(100);

/// What the read loop does after a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit,
}

/// Ctrl-C state shared with the signal handler.
///
/// While a long-running command is active a Ctrl-C only raises a flag the
/// command polls; at the prompt it ends the program.
#[derive(Debug, Default)]
pub struct Interrupt {
    busy: AtomicBool,
    requested: AtomicBool,
}

impl Interrupt {
    pub fn install() -> Result<Arc<Self>> {
        let interrupt = Arc::new(Self::default());
        let handler = interrupt.clone();
        ctrlc::set_handler(move || handler.signal()).context("installing Ctrl-C handler")?;
        Ok(interrupt)
    }

    fn signal(&self) {
        if self.busy.load(Ordering::Acquire) {
            self.requested.store(true, Ordering::Release);
        } else {
            std::process::exit(130);
        }
    }

    /// Mark a command as interruptible until the guard drops.
    fn begin(&self) -> BusyGuard<'_> {
        self.requested.store(false, Ordering::Release);
        self.busy.store(true, Ordering::Release);
        BusyGuard(self)
    }

    pub fn requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub(crate) fn raise(&self) {
        self.requested.store(true, Ordering::Release);
    }
}

struct BusyGuard<'a>(&'a Interrupt);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.busy.store(false, Ordering::Release);
    }
}

struct LoadedFile {
    path: PathBuf,
    lines: Vec<String>,
}

/// The operator console: parses command lines and drives a [`PrinterConsole`].
pub struct Shell<W: Write> {
    config: ConsoleConfig,
    console: Option<PrinterConsole>,
    observer: Arc<dyn ConsoleObserver>,
    interrupt: Arc<Interrupt>,
    aliases: AliasTable,
    loaded: Option<LoadedFile>,
    out: W,
}

impl<W: Write> Shell<W> {
    pub fn new(
        config: ConsoleConfig,
        observer: Arc<dyn ConsoleObserver>,
        interrupt: Arc<Interrupt>,
        out: W,
    ) -> Self {
        let aliases = AliasTable::new(config.aliases.clone());
        Self {
            config,
            console: None,
            observer,
            interrupt,
            aliases,
            loaded: None,
            out,
        }
    }

    /// Use an already built console instead of opening a port.
    #[cfg(test)]
    pub fn attach(&mut self, console: PrinterConsole) {
        self.console = Some(console);
    }

    #[cfg(test)]
    pub fn output(&self) -> &W {
        &self.out
    }

    /// Run one command line, reporting failures to the operator.
    pub fn execute(&mut self, line: &str) -> Flow {
        match self.run(line, 0) {
            Ok(flow) => flow,
            Err(e) => {
                debug!(error = ?e, "Command failed");
                if let Err(write_err) = writeln!(self.out, "Error: {:#}", e) {
                    warn!(error = %write_err, "Could not report command failure");
                }
                Flow::Continue
            }
        }
    }

    fn run(&mut self, line: &str, depth: usize) -> Result<Flow> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(Flow::Continue);
        }
        let (command, args) = match line.split_once(char::is_whitespace) {
            Some((command, args)) => (command, args.trim()),
            None => (line, ""),
        };

        match command {
            "connect" => self.connect(args)?,
            "disconnect" => self.disconnect()?,
            "load" => self.load(args)?,
            "print" => self.print()?,
            "upload" => self.upload(args)?,
            "ls" => self.ls()?,
            "sdprint" => self.sdprint(args)?,
            "pause" => {
                self.console(Operation::Pause)?.pause()?;
                writeln!(self.out, "Print paused.")?;
            }
            "resume" => {
                self.console(Operation::Resume)?.resume()?;
                writeln!(self.out, "Print resumed.")?;
            }
            "monitor" => self.monitor(args)?,
            "gettemp" => self.gettemp()?,
            "settemp" => self.settemp(Heater::Hotend, args)?,
            "bedtemp" => self.settemp(Heater::Bed, args)?,
            "move" => self.move_axis(args)?,
            "extrude" => self.extrude(args, false)?,
            "reverse" => self.extrude(args, true)?,
            "alias" => self.alias(args)?,
            "help" => self.help(args)?,
            "exit" => {
                if let Some(console) = self.console.take() {
                    console.disconnect();
                }
                return Ok(Flow::Exit);
            }
            _ => {
                if let Some(expanded) = self.aliases.expand(command, args) {
                    if depth >= MAX_ALIAS_DEPTH {
                        bail!("alias '{}' expands too deeply", command);
                    }
                    return self.run(&expanded, depth + 1);
                }
                if protocol::passthrough(line).is_some() {
                    let sent = self.console(Operation::Command)?.send_raw(line)?;
                    writeln!(self.out, "SENDING:{}", sent)?;
                } else {
                    writeln!(self.out, "Unknown command '{}'. Type help for a list.", command)?;
                }
            }
        }
        Ok(Flow::Continue)
    }

    fn console(&self, operation: Operation) -> Result<&PrinterConsole, ConsoleError> {
        self.console
            .as_ref()
            .ok_or(ConsoleError::NotConnected { operation })
    }

    fn connect(&mut self, args: &str) -> Result<()> {
        let mut parts = args.split_whitespace();
        if let Some(port) = parts.next() {
            self.config.port = Some(port.to_string());
        }
        if let Some(baud) = parts.next() {
            self.config.baud = baud
                .parse()
                .with_context(|| format!("invalid baud rate '{}'", baud))?;
        }
        if let Some(old) = self.console.take() {
            old.disconnect();
        }
        let Some(port) = self.config.port.clone() else {
            bail!("No port given. Usage: connect <port> [baud]");
        };
        writeln!(self.out, "Connecting to {}...", port)?;
        let console = PrinterConsole::open(self.config.clone(), self.observer.clone())?;
        self.console = Some(console);
        Ok(())
    }

    fn disconnect(&mut self) -> Result<()> {
        match self.console.take() {
            Some(console) => {
                console.disconnect();
                writeln!(self.out, "Disconnected.")?;
            }
            None => writeln!(self.out, "Not connected.")?,
        }
        Ok(())
    }

    fn load(&mut self, args: &str) -> Result<()> {
        if args.is_empty() {
            bail!("No file name given.");
        }
        let path = PathBuf::from(args);
        let lines = gcode::load_lines(&path)?;
        writeln!(self.out, "Loaded {}, {} lines.", path.display(), lines.len())?;
        self.loaded = Some(LoadedFile { path, lines });
        Ok(())
    }

    fn print(&mut self) -> Result<()> {
        let Some(loaded) = &self.loaded else {
            bail!("No file loaded. Please use load first.");
        };
        let lines = loaded.lines.clone();
        let path = loaded.path.display().to_string();
        self.console(Operation::HostPrint)?.start_host_print(lines)?;
        writeln!(self.out, "Printing {}", path)?;
        writeln!(self.out, "You can monitor the print with the monitor command.")?;
        Ok(())
    }

    fn upload(&mut self, args: &str) -> Result<()> {
        let mut parts = args.split_whitespace();
        let Some(file) = parts.next() else {
            bail!("No file name given.");
        };
        let Some(target) = parts.next() else {
            let suggestion = gcode::dosify(Path::new(file));
            writeln!(self.out, "Please enter target name in 8.3 format, e.g.")?;
            writeln!(self.out, "  upload {} {}", file, suggestion)?;
            return Ok(());
        };

        let handle = self.console(Operation::Upload)?.start_upload(file, target)?;
        writeln!(self.out, "Uploading {} as {}", file, handle.target())?;
        writeln!(self.out, "Press Ctrl-C to interrupt upload.")?;

        let result = {
            let _busy = self.interrupt.begin();
            loop {
                if let Some(result) = handle.try_result() {
                    break result;
                }
                if self.interrupt.requested() {
                    handle.cancel();
                    break handle.wait(self.config.listing_timeout() + Duration::from_secs(5));
                }
                let (sent, total) = handle.progress();
                if total > 0 {
                    write!(
                        self.out,
                        "\rProgress: {:04.1}%",
                        100.0 * sent as f64 / total as f64
                    )?;
                    self.out.flush()?;
                }
                thread::sleep(TICK);
            }
        };
        writeln!(self.out)?;

        let report = result?;
        writeln!(
            self.out,
            "Upload of {} finished, {} lines.",
            report.target, report.lines
        )?;
        Ok(())
    }

    fn ls(&mut self) -> Result<()> {
        let files = self.console(Operation::Listing)?.list_files()?;
        if files.is_empty() {
            writeln!(self.out, "No files on card.")?;
        }
        for file in files {
            writeln!(self.out, "{}", file)?;
        }
        Ok(())
    }

    fn sdprint(&mut self, args: &str) -> Result<()> {
        if args.is_empty() {
            bail!("No file name given.");
        }
        let timeout = self.config.session_timeout();
        let console = self.console(Operation::CardPrint)?;
        let handle = console.start_card_print(args)?;
        handle.started.wait(timeout)?;
        writeln!(self.out, "Printing {} from card.", handle.target())?;
        writeln!(self.out, "You can monitor the print with the monitor command.")?;
        Ok(())
    }

    fn monitor(&mut self, args: &str) -> Result<()> {
        let interval = if args.is_empty() {
            self.config.monitor_interval()
        } else {
            let secs: f64 = args
                .parse()
                .with_context(|| format!("invalid period '{}'", args))?;
            if !(secs > 0.0 && secs.is_finite()) {
                bail!("invalid period '{}'", args);
            }
            Duration::from_secs_f64(secs)
        };
        // Fail fast when offline.
        self.console(Operation::Temperature)?;

        writeln!(self.out, "Monitoring printer, use ^C to interrupt.")?;
        writeln!(self.out, "Updating values every {:.1} seconds.", interval.as_secs_f64())?;
        let _busy = self.interrupt.begin();
        while !self.interrupt.requested() {
            let console = self.console(Operation::Temperature)?;
            console.poll_status()?;
            // Give the replies a moment to arrive.
            thread::sleep(TICK);
            let temperature = console.latest_temperature();
            let progress = console.current_progress();
            if let Some(temperature) = temperature {
                writeln!(self.out, "{}", temperature)?;
            }
            if progress.mode != PrintMode::Idle {
                writeln!(self.out, "{}", progress)?;
            }

            let deadline = Instant::now() + interval;
            while Instant::now() < deadline && !self.interrupt.requested() {
                thread::sleep(TICK);
            }
        }
        writeln!(self.out, "Done monitoring.")?;
        Ok(())
    }

    fn gettemp(&mut self) -> Result<()> {
        let timeout = self.config.listing_timeout();
        let reading = self
            .console(Operation::Temperature)?
            .query_temperature(timeout)?;
        writeln!(self.out, "{}", reading)?;
        Ok(())
    }

    fn settemp(&mut self, heater: Heater, args: &str) -> Result<()> {
        if args.is_empty() {
            bail!("No temperature given.");
        }
        let celsius = self
            .console(Operation::Command)?
            .set_temperature(heater, args)?;
        let name = match heater {
            Heater::Hotend => "hotend",
            Heater::Bed => "bed",
        };
        writeln!(
            self.out,
            "Setting {} temperature to {} degrees Celsius.",
            name, celsius
        )?;
        Ok(())
    }

    fn move_axis(&mut self, args: &str) -> Result<()> {
        let parts: Vec<&str> = args.split_whitespace().collect();
        let [axis, distance, rest @ ..] = parts.as_slice() else {
            bail!("move needs an axis and a distance, e.g. move x 10");
        };
        let axis = Axis::parse(axis).with_context(|| format!("unknown axis '{}'", axis))?;
        let distance: f64 = distance
            .parse()
            .with_context(|| format!("invalid distance '{}'", distance))?;
        let feed = rest
            .first()
            .map(|f| f.parse::<u32>())
            .transpose()
            .context("invalid feed rate")?;
        self.console(Operation::Move)?.move_axis(axis, distance, feed)?;
        Ok(())
    }

    fn extrude(&mut self, args: &str, reverse: bool) -> Result<()> {
        let mut parts = args.split_whitespace();
        let length = parts
            .next()
            .map(|l| l.parse::<f64>())
            .transpose()
            .context("invalid length")?;
        let feed = parts
            .next()
            .map(|f| f.parse::<u32>())
            .transpose()
            .context("invalid feed rate")?;
        let console = self.console(Operation::Move)?;
        if reverse {
            console.reverse(length, feed)?;
        } else {
            console.extrude(length, feed)?;
        }
        Ok(())
    }

    fn alias(&mut self, args: &str) -> Result<()> {
        if args.is_empty() {
            if self.aliases.is_empty() {
                writeln!(self.out, "No aliases defined, to define see: help alias")?;
            } else {
                writeln!(self.out, "Aliases, to display type: alias <name>")?;
                let names: Vec<&str> = self.aliases.names().collect();
                writeln!(self.out, "{}", names.join("  "))?;
            }
            return Ok(());
        }

        let (name, definition) = match args.split_once(char::is_whitespace) {
            Some((name, definition)) => (name, definition.trim()),
            None => (args, ""),
        };
        if definition.is_empty() {
            match self.aliases.get(name) {
                Some(template) => {
                    writeln!(self.out, "Alias '{}' stands for '{}'", name, template)?
                }
                None => writeln!(self.out, "Alias '{}' is not defined", name)?,
            }
        } else if definition.eq_ignore_ascii_case("/d") {
            if self.aliases.remove(name) {
                writeln!(self.out, "Alias '{}' removed", name)?;
            } else {
                writeln!(self.out, "Alias '{}' is not defined", name)?;
            }
        } else {
            self.aliases.define(name, definition, BUILTINS)?;
        }
        Ok(())
    }

    fn help(&mut self, args: &str) -> Result<()> {
        if args.is_empty() {
            writeln!(self.out, "Commands (type help <command>):")?;
            writeln!(self.out, "{}", BUILTINS.join("  "))?;
            if !self.aliases.is_empty() {
                let names: Vec<&str> = self.aliases.names().collect();
                writeln!(self.out, "Aliases: {}", names.join("  "))?;
            }
            writeln!(self.out, "Lines starting with G or M are sent to the printer.")?;
            return Ok(());
        }
        if let Some(template) = self.aliases.get(args) {
            writeln!(self.out, "'{}' is alias for '{}'", args, template)?;
            return Ok(());
        }
        let text = match args {
            "connect" => "connect [port] [baud] - open the printer port",
            "disconnect" => "disconnect - close the printer port",
            "load" => "load <file> - read a G-code file for printing",
            "print" => "print - stream the loaded file to the printer",
            "upload" => "upload <file> <name> - write a G-code file to the card as <name>",
            "ls" => "ls - list the files on the card",
            "sdprint" => "sdprint <name> - print a file from the card",
            "pause" => "pause - pause the running print",
            "resume" => "resume - resume a paused print",
            "monitor" => "monitor [seconds] - report temperatures and card progress until ^C",
            "gettemp" => "gettemp - read the current temperatures",
            "settemp" => "settemp <degrees|preset> - set the hotend target (presets: pla, abs, off)",
            "bedtemp" => "bedtemp <degrees|preset> - set the bed target (presets: pla, abs, off)",
            "move" => "move <x|y|z|e> <mm> [feed] - relative move of one axis",
            "extrude" => "extrude [mm] [feed] - push filament, 5mm at 300mm/min by default",
            "reverse" => "reverse [mm] [feed] - pull filament back, 5mm at 300mm/min by default",
            "alias" => {
                "alias [<name> [<command>|/d]] - list, show, define or remove aliases; \
                 an alias runs <command> followed by its arguments"
            }
            "help" => "help [command] - show help",
            "exit" => "exit - disconnect and quit",
            _ => {
                writeln!(self.out, "No help on '{}'", args)?;
                return Ok(());
            }
        };
        writeln!(self.out, "{}", text)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pronto_core::{LineBus, MockTransport, NullObserver};

    fn shell() -> (Arc<MockTransport>, Shell<Vec<u8>>) {
        let mock = Arc::new(MockTransport::new());
        let bus = Arc::new(LineBus::new());
        mock.attach(&bus);
        let config = ConsoleConfig {
            listing_timeout_ms: 100,
            ..ConsoleConfig::default()
        };
        let console =
            PrinterConsole::new(mock.clone(), bus, Arc::new(NullObserver), config.clone());
        let mut shell = Shell::new(
            config,
            Arc::new(NullObserver),
            Arc::new(Interrupt::default()),
            Vec::new(),
        );
        shell.attach(console);
        (mock, shell)
    }

    fn output(shell: &Shell<Vec<u8>>) -> String {
        String::from_utf8_lossy(shell.output()).into_owned()
    }

    #[test]
    fn test_passthrough_uppercases() {
        let (mock, mut shell) = shell();
        assert_eq!(shell.execute("g28 x0"), Flow::Continue);
        assert_eq!(mock.get_commands(), vec!["G28 X0"]);
        assert!(output(&shell).contains("SENDING:G28 X0"));
    }

    #[test]
    fn test_alias_expands_at_dispatch() {
        let (mock, mut shell) = shell();
        shell.execute("alias up move z");
        shell.execute("up 5");
        assert_eq!(mock.get_commands(), vec!["G91", "G1 Z5 F200", "G90"]);

        shell.execute("alias up /d");
        shell.execute("up 5");
        assert!(output(&shell).contains("Unknown command 'up'"));
    }

    #[test]
    fn test_alias_cannot_shadow_builtin() {
        let (_mock, mut shell) = shell();
        shell.execute("alias ls M20");
        assert!(output(&shell).contains("already being used by built-in command"));
    }

    #[test]
    fn test_self_referencing_alias_stops() {
        let (mock, mut shell) = shell();
        shell.execute("alias loop loop");
        assert_eq!(shell.execute("loop"), Flow::Continue);
        assert!(output(&shell).contains("expands too deeply"));
        assert!(mock.get_commands().is_empty());
    }

    #[test]
    fn test_upload_without_target_suggests_name() {
        let (mock, mut shell) = shell();
        shell.execute("upload /tmp/calibration_cube.gcode");
        assert!(output(&shell).contains("upload /tmp/calibration_cube.gcode calibrat.g"));
        assert!(mock.get_commands().is_empty());
    }

    #[test]
    fn test_interrupted_upload_reports_partial_file() {
        let (mock, mut shell) = shell();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("part.gcode");
        std::fs::write(&path, "G28\nG1 X1\nG1 X2\n").unwrap();
        let interrupt = shell.interrupt.clone();
        let raiser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            interrupt.raise();
        });
        shell.execute(&format!("upload {} part.g", path.display()));
        raiser.join().unwrap();

        let out = output(&shell);
        assert!(out.contains("partial file named 'part.g'"), "{}", out);
        let commands = mock.get_commands();
        assert_eq!(commands.first().map(String::as_str), Some("M28 part.g"));
        assert_eq!(commands.last().map(String::as_str), Some("M29 part.g"));
    }

    #[test]
    fn test_settemp_and_ls() {
        let (mock, mut shell) = shell();
        mock.reply_to("M20", &["Begin file list", "B.G", "a.g", "End file list"]);
        shell.execute("settemp abs");
        shell.execute("ls");
        let out = output(&shell);
        assert!(out.contains("Setting hotend temperature to 230 degrees Celsius."));
        assert!(out.contains("a.g\nb.g\n"));
        assert_eq!(mock.get_commands(), vec!["M104 S230", "M20"]);
    }

    #[test]
    fn test_commands_need_connection() {
        let mut shell = Shell::new(
            ConsoleConfig::default(),
            Arc::new(NullObserver),
            Arc::new(Interrupt::default()),
            Vec::new(),
        );
        shell.execute("ls");
        shell.execute("M105");
        let out = output(&shell);
        assert!(out.contains("card listing failed: printer is not connected"));
        assert!(out.contains("command failed: printer is not connected"));
    }

    #[test]
    fn test_print_requires_load() {
        let (_mock, mut shell) = shell();
        shell.execute("print");
        assert!(output(&shell).contains("No file loaded"));
        assert_eq!(shell.execute("exit"), Flow::Exit);
    }
}
