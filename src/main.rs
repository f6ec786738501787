//! termbridge - console host for the termbridge session controller
//!
//! Runs commands typed at a local prompt, or a shell on a pseudo terminal,
//! and renders their styled output in the console.
//!
//! # Quick Start
//!
//! ```text
//! termbridge                 # Local prompt, commands run one at a time
//! termbridge -s bash         # Interactive bash on a PTY
//! termbridge --pipe -s sh    # sh over pipes, input edited locally
//! ```
//!
//! # Keys
//!
//! | Key | Action |
//! |-----|--------|
//! | Shift+PageUp/PageDown | Scroll back / forward |
//! | Ctrl+Shift+C | Copy the buffer text |
//! | Ctrl+Shift+V | Paste |
//! | Ctrl+C | Cancel line / stop the running command |

mod ui;

use std::cell::{Cell, RefCell};
use std::env;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

use crossterm::event::{self, Event, KeyCode, KeyModifiers};
use crossterm::terminal;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use termbridge::{
    create_controller, ShellCommand, TerminalConfig, TerminalSessionController, TransportPreference,
};

use crate::ui::{is_ctrl_shift, translate_key, RepaintFlag, Renderer};

/// Lines moved per Shift+PageUp/PageDown
const SCROLL_STEP: usize = 10;

/// Command line options
#[derive(Debug, Default)]
struct Options {
    /// Shell command line; starts a long-lived session
    shell: Option<String>,
    transport: Option<TransportPreference>,
    workdir: Option<PathBuf>,
    /// Command run once at startup
    command: Option<String>,
    /// Encode input to pipe children in the ANSI code page instead of UTF-8
    ansi_pipes: bool,
    debug: bool,
}

impl Options {
    /// Command line values override the config file
    fn apply(&self, config: &mut TerminalConfig) {
        if let Some(transport) = self.transport {
            config.transport = transport;
        }
        if let Some(ref command) = self.command {
            config.startup_command = Some(command.clone());
        }
        if let Some(ref workdir) = self.workdir {
            config.working_dir = Some(workdir.clone());
        }
        if self.ansi_pipes {
            config.pipe_utf8 = false;
        }
        if self.debug {
            config.debug = true;
        }
    }

    /// Shell to start, if any: `--shell` first, then `shell` in config
    fn shell_command(&self, config: &TerminalConfig) -> Option<ShellCommand> {
        match self.shell {
            Some(ref line) => {
                let argv: Vec<String> = line.split_whitespace().map(str::to_string).collect();
                if argv.is_empty() {
                    None
                } else {
                    Some(ShellCommand::Argv(argv))
                }
            }
            None if config.shell.is_some() => Some(ShellCommand::Default),
            None => None,
        }
    }
}

/// Version string from Cargo.toml
const VERSION: &str = env!("CARGO_PKG_VERSION");

fn print_version() {
    eprintln!("termbridge {}", VERSION);
}

fn print_help() {
    eprintln!("termbridge {} - Console host for child processes", VERSION);
    eprintln!();
    eprintln!("Usage: termbridge [OPTIONS]");
    eprintln!();
    eprintln!("Session options:");
    eprintln!("  (default)             Local prompt; commands run one at a time");
    eprintln!("  -s, --shell <CMD>     Start CMD as a long-lived session");
    eprintln!("  --pty                 Require a pseudo terminal");
    eprintln!("  --pipe                Use pipes, edit input locally");
    eprintln!("  -d, --dir <PATH>      Working directory");
    eprintln!("  -c, --command <CMD>   Run CMD once at startup");
    eprintln!();
    eprintln!("Encoding options:");
    eprintln!("  (default)             Input to pipe children is sent as UTF-8");
    eprintln!("  --ansi                Input to pipe children uses the ANSI code page");
    eprintln!("                        (output is always decoded UTF-8 first, then legacy)");
    eprintln!();
    eprintln!("Other options:");
    eprintln!("  --debug               Verbose log");
    eprintln!("  -v, --version         Show version");
    eprintln!("  -h, --help            Show this help");
    eprintln!();
    eprintln!("Keys:");
    eprintln!("  Shift+PageUp/PageDown Scroll");
    eprintln!("  Ctrl+Shift+C          Copy buffer text");
    eprintln!("  Ctrl+Shift+V          Paste");
    eprintln!("  Ctrl+C                Cancel line / stop command");
    eprintln!();
    eprintln!("Built-in commands: cd, clear (cls), exit (quit)");
    eprintln!();
    eprintln!("Configuration: ~/.termbridge/config.toml");
    eprintln!("Log:           ~/.termbridge/termbridge.log");
}

fn parse_args<I: IntoIterator<Item = String>>(args: I) -> Result<Options, String> {
    let args: Vec<String> = args.into_iter().collect();
    let mut options = Options::default();
    let mut i = 1;

    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => {
                print_help();
                std::process::exit(0);
            }
            "-v" | "--version" => {
                print_version();
                std::process::exit(0);
            }
            "-s" | "--shell" => {
                i += 1;
                if i >= args.len() {
                    return Err("Missing shell argument".to_string());
                }
                options.shell = Some(args[i].clone());
            }
            "-d" | "--dir" => {
                i += 1;
                if i >= args.len() {
                    return Err("Missing directory argument".to_string());
                }
                options.workdir = Some(PathBuf::from(&args[i]));
            }
            "-c" | "--command" => {
                i += 1;
                if i >= args.len() {
                    return Err("Missing command argument".to_string());
                }
                options.command = Some(args[i].clone());
            }
            "--pty" => options.transport = Some(TransportPreference::Pty),
            "--pipe" => options.transport = Some(TransportPreference::Pipe),
            "--ansi" => options.ansi_pipes = true,
            "--debug" => options.debug = true,
            arg => {
                return Err(format!("Unknown argument: {}. Use -h for help.", arg));
            }
        }
        i += 1;
    }

    Ok(options)
}

/// Log to `~/.termbridge/termbridge.log`
fn init_logging(debug: bool) {
    let log_path = termbridge::config::data_dir()
        .map(|dir| dir.join("termbridge.log"))
        .unwrap_or_else(|| PathBuf::from("termbridge.log"));

    if let Some(parent) = log_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .ok();

    if let Some(file) = log_file {
        let default_level = if debug { "debug" } else { "info" };
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(filter)
            .with_writer(std::sync::Mutex::new(file))
            .with_ansi(false)
            .finish();
        let _ = tracing::subscriber::set_global_default(subscriber);
    }
}

fn main() -> anyhow::Result<()> {
    let options = match parse_args(env::args()) {
        Ok(o) => o,
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!("Use --help for usage information");
            std::process::exit(1);
        }
    };

    let mut config = TerminalConfig::load();
    options.apply(&mut config);

    init_logging(config.debug);
    info!("termbridge {} starting...", VERSION);

    run(config, &options)
}

fn run(config: TerminalConfig, options: &Options) -> anyhow::Result<()> {
    let workdir = match config.working_dir.clone() {
        Some(dir) => dir,
        None => env::current_dir()?,
    };
    let shell = options.shell_command(&config);
    let colors = config.colors.clone();

    // Bottom row is the status line
    let (cols, rows) = terminal::size()?;
    let mut controller = create_controller(&workdir, cols.max(1), rows.saturating_sub(1).max(1), config)?;

    let host = Rc::new(RefCell::new(RepaintFlag::default()));
    controller.attach_host(host.clone());

    let exit_requested = Rc::new(Cell::new(false));
    {
        let exit_requested = exit_requested.clone();
        controller.on_exit_requested.subscribe(move |_| exit_requested.set(true));
    }

    if let Some(shell) = shell {
        controller.start_shell(shell)?;
    }
    controller.run_startup_command();

    let mut renderer = Renderer::new(colors);
    renderer.init()?;

    let result = run_main_loop(&mut controller, &mut renderer, &host, &exit_requested);

    renderer.cleanup()?;
    controller.stop_shell();
    info!("termbridge exiting");
    result
}

/// Main event loop
fn run_main_loop(
    controller: &mut TerminalSessionController,
    renderer: &mut Renderer,
    host: &Rc<RefCell<RepaintFlag>>,
    exit_requested: &Rc<Cell<bool>>,
) -> anyhow::Result<()> {
    let poll_timeout = Duration::from_millis(10);

    loop {
        if exit_requested.get() {
            info!("Exit requested");
            break;
        }

        // Drain child output
        controller.pump();

        if host.borrow_mut().take() {
            renderer.render(controller)?;
        }

        if !event::poll(poll_timeout)? {
            continue;
        }

        match event::read()? {
            Event::Key(key_event) => {
                // Scrollback
                if key_event.modifiers.contains(KeyModifiers::SHIFT) {
                    match key_event.code {
                        KeyCode::PageUp => {
                            renderer.scroll_up(SCROLL_STEP);
                            host.borrow_mut().request();
                            continue;
                        }
                        KeyCode::PageDown => {
                            renderer.scroll_down(SCROLL_STEP);
                            host.borrow_mut().request();
                            continue;
                        }
                        _ => {}
                    }
                }

                if is_ctrl_shift(&key_event, 'c') {
                    copy_to_clipboard(&controller.line_buffer().plain_text());
                    continue;
                }

                if is_ctrl_shift(&key_event, 'v') {
                    if let Some(text) = paste_from_clipboard() {
                        renderer.scroll_to_bottom();
                        controller.paste_text(&text);
                    }
                    continue;
                }

                if let Some((key, mods)) = translate_key(&key_event) {
                    // Typing returns to the live view
                    if renderer.is_scrolled() {
                        renderer.scroll_to_bottom();
                        host.borrow_mut().request();
                    }
                    controller.handle_key_event(key, mods);
                }
            }

            Event::Paste(text) => {
                renderer.scroll_to_bottom();
                controller.paste_text(&text);
            }

            Event::Resize(cols, rows) => {
                info!("Resize: {}x{}", cols, rows);
                if let Err(e) = controller.resize(cols.max(1), rows.saturating_sub(1).max(1)) {
                    error!("Failed to resize: {}", e);
                }
                host.borrow_mut().request();
            }

            _ => {}
        }
    }

    Ok(())
}

fn copy_to_clipboard(text: &str) {
    match arboard::Clipboard::new() {
        Ok(mut clipboard) => {
            if let Err(e) = clipboard.set_text(text.to_string()) {
                warn!("Failed to copy: {}", e);
            }
        }
        Err(e) => warn!("Clipboard unavailable: {}", e),
    }
}

fn paste_from_clipboard() -> Option<String> {
    let mut clipboard = arboard::Clipboard::new()
        .map_err(|e| warn!("Clipboard unavailable: {}", e))
        .ok()?;
    clipboard
        .get_text()
        .map_err(|e| warn!("Failed to paste: {}", e))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("termbridge")
            .chain(list.iter().copied())
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn test_parse_args_overrides_config() {
        let options = parse_args(args(&["--pipe", "-d", "/tmp", "-c", "ls", "--ansi", "--debug"])).unwrap();
        let mut config = TerminalConfig::default();
        options.apply(&mut config);

        assert_eq!(config.transport, TransportPreference::Pipe);
        assert_eq!(config.working_dir, Some(PathBuf::from("/tmp")));
        assert_eq!(config.startup_command.as_deref(), Some("ls"));
        assert!(!config.pipe_utf8);
        assert!(config.debug);
    }

    #[test]
    fn test_parse_args_errors() {
        assert!(parse_args(args(&["--shell"])).is_err());
        assert!(parse_args(args(&["--bogus"])).is_err());
    }

    #[test]
    fn test_shell_command_selection() {
        let config = TerminalConfig::default();
        assert_eq!(Options::default().shell_command(&config), None);

        let options = parse_args(args(&["-s", "bash -i"])).unwrap();
        assert_eq!(
            options.shell_command(&config),
            Some(ShellCommand::Argv(vec!["bash".to_string(), "-i".to_string()]))
        );

        let config = TerminalConfig {
            shell: Some("zsh".to_string()),
            ..TerminalConfig::default()
        };
        assert_eq!(Options::default().shell_command(&config), Some(ShellCommand::Default));
    }
}
