// src/logging/console.rs - Line-oriented TCP admin console
//
// Protocol: ASCII, CRLF-terminated responses, "log> " prompt. Built-in
// commands manage the logger; custom commands are registered with
// (name, format, description, module, handler). One accept thread plus
// one thread per client; every blocking point observes the stop flag or
// a socket shutdown, so teardown never kills a thread.

use log::{error, info, warn};
use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::JoinHandle;
use std::time::Duration;

use super::{get_config, log_message, update_config, Level, Sinks};

const PROMPT: &str = "log> ";
const ACCEPT_POLL_MS: u64 = 200;

pub type CmdHandler = Arc<dyn Fn(&[String]) -> String + Send + Sync>;

/// Registered command metadata; `help`/`cmdshow` group by `module`.
#[derive(Clone)]
pub struct CommandInfo {
    pub name: String,
    pub format: String,
    pub description: String,
    pub module: String,
    pub handler: CmdHandler,
}

fn registry() -> &'static Mutex<BTreeMap<String, CommandInfo>> {
    static REGISTRY: OnceLock<Mutex<BTreeMap<String, CommandInfo>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(BTreeMap::new()))
}

/// Register (or replace) a custom console command. The handler receives
/// the full token vector, command name included, and returns the
/// response text.
pub fn register_command(
    name: impl Into<String>,
    format: impl Into<String>,
    description: impl Into<String>,
    module: impl Into<String>,
    handler: CmdHandler,
) {
    let name = name.into().to_ascii_lowercase();
    let info = CommandInfo {
        name: name.clone(),
        format: format.into(),
        description: description.into(),
        module: module.into(),
        handler,
    };
    registry()
        .lock()
        .unwrap_or_else(|p| p.into_inner())
        .insert(name, info);
}

const BUILTIN_HELP: &[(&str, &str)] = &[
    ("help", "Show this help menu"),
    ("cmdshow [module]", "Show detailed command information, optionally filtered by module"),
    ("quit/exit/bye", "Disconnect from server"),
    ("status", "Show logger status (level, targets, file path, clients)"),
    ("level [lvl]", "Get/Set log level (TRACE,DEBUG,INFO,WARNING,ERROR,FATAL)"),
    ("enable <target>", "Enable output target (console,file,telnet)"),
    ("disable <target>", "Disable output target (console,file,telnet)"),
    ("log <message> [lvl]", "Log a message with optional level (default: INFO)"),
];

fn help_response() -> String {
    let mut out = String::from("=== otl console help ===\r\n\r\nBuilt-in commands:\r\n");
    for (usage, desc) in BUILTIN_HELP {
        out.push_str(&format!("  {usage:<20}- {desc}\r\n"));
    }

    let registry = registry().lock().unwrap_or_else(|p| p.into_inner());
    if !registry.is_empty() {
        let mut by_module: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for info in registry.values() {
            by_module.entry(&info.module).or_default().push(&info.name);
        }
        out.push_str("\r\nCustom commands by module:\r\n");
        for (module, names) in by_module {
            out.push_str(&format!("  [{module}]\r\n"));
            for name in names {
                out.push_str(&format!("    {name}\r\n"));
            }
        }
        out.push_str("\r\nUse 'cmdshow' for detailed command information\r\n");
    }
    out
}

fn cmdshow_response(module_filter: Option<&str>) -> String {
    let mut out = String::from("=== otl console command details ===\r\n\r\n");
    let registry = registry().lock().unwrap_or_else(|p| p.into_inner());
    if registry.is_empty() {
        out.push_str("No custom commands registered.\r\n");
        return out;
    }

    let mut by_module: BTreeMap<&str, Vec<&CommandInfo>> = BTreeMap::new();
    for info in registry.values() {
        if module_filter.map_or(true, |m| m == info.module) {
            by_module.entry(&info.module).or_default().push(info);
        }
    }

    if by_module.is_empty() {
        if let Some(m) = module_filter {
            out.push_str(&format!("No commands found for module '{m}'\r\n"));
        }
        return out;
    }

    for (module, infos) in by_module {
        out.push_str(&format!("[Module: {module}]\r\n"));
        for info in infos {
            out.push_str(&format!("  Command: {}\r\n", info.name));
            out.push_str(&format!("    Format: {}\r\n", info.format));
            out.push_str(&format!("    Description: {}\r\n\r\n", info.description));
        }
    }
    out
}

fn status_response() -> String {
    let config = get_config();
    let mut targets = String::new();
    if config.targets.console {
        targets.push_str("console ");
    }
    if config.targets.file {
        targets.push_str("file ");
    }
    if config.targets.telnet {
        targets.push_str("telnet ");
    }
    if targets.is_empty() {
        targets.push_str("none");
    }

    let mut out = String::from("Logger Status:\r\n");
    out.push_str(&format!("  Current level: {}\r\n", config.level.name()));
    out.push_str(&format!("  Enabled targets: {targets}\r\n"));
    out.push_str(&format!("  File path: {}\r\n", config.file.path.display()));
    out.push_str(&format!(
        "  Console enabled: {}\r\n",
        if config.enable_console { "yes" } else { "no" }
    ));
    out.push_str(&format!(
        "  Abort on fatal: {}\r\n",
        if config.abort_on_fatal { "yes" } else { "no" }
    ));
    out.push_str(&format!("  Queue size: {}\r\n", config.queue_size));
    out.push_str(&format!("  Queue backlog: {}\r\n", super::queue_len()));
    out.push_str(&format!("  Telnet clients: {}\r\n", super::client_count()));
    out
}

fn level_response(args: &[String]) -> String {
    match args.get(1) {
        None => format!("Current log level: {}\r\n", get_config().level.name()),
        Some(arg) => {
            let level = Level::parse(arg);
            let mut config = get_config();
            config.level = level;
            update_config(config);
            format!("Log level set to: {}\r\n", level.name())
        }
    }
}

fn toggle_response(args: &[String], enable: bool) -> String {
    let verb = if enable { "enable" } else { "disable" };
    let Some(target) = args.get(1) else {
        return format!("Usage: {verb} <console|file|telnet>\r\n");
    };

    let mut config = get_config();
    let target = target.to_ascii_lowercase();
    let response = match target.as_str() {
        "console" => {
            config.enable_console = enable;
            format!("Console output {verb}d\r\n")
        }
        "file" => {
            config.targets.file = enable;
            format!("File output {verb}d\r\n")
        }
        "telnet" => {
            config.targets.telnet = enable;
            format!("Telnet output {verb}d\r\n")
        }
        _ => return format!("Unknown target: {target}. Valid targets: console, file, telnet\r\n"),
    };
    update_config(config);
    response
}

fn log_response(args: &[String]) -> String {
    let Some(message) = args.get(1) else {
        return "Usage: log <message> [level]\r\n".to_string();
    };
    let level = args.get(2).map(|s| Level::parse(s)).unwrap_or(Level::Info);
    log_message(level, "console", "", 0, message.clone());
    format!("Log message sent at level: {}\r\n", level.name())
}

/// Execute one console line. Returns the response and whether the
/// connection should close. Exposed for command-level tests; the socket
/// loop is a thin shell around this.
pub fn process_command(line: &str) -> (String, bool) {
    let args: Vec<String> = line.split_whitespace().map(str::to_string).collect();
    let Some(first) = args.first() else {
        return (String::new(), false);
    };
    let cmd = first.to_ascii_lowercase();

    let custom = registry()
        .lock()
        .unwrap_or_else(|p| p.into_inner())
        .get(&cmd)
        .cloned();
    let mut response = match custom {
        Some(info) => (info.handler)(&args),
        None => match cmd.as_str() {
            "help" => help_response(),
            "cmdshow" => cmdshow_response(args.get(1).map(String::as_str)),
            "status" => status_response(),
            "level" => level_response(&args),
            "enable" => toggle_response(&args, true),
            "disable" => toggle_response(&args, false),
            "log" => log_response(&args),
            "quit" | "exit" | "bye" => return ("Goodbye!\r\n".to_string(), true),
            _ => format!("Unknown command: '{cmd}'. Type 'help' for available commands.\r\n"),
        },
    };

    if !response.is_empty() && !response.ends_with("\r\n") {
        response.push_str("\r\n");
    }
    (response, false)
}

fn send_welcome(stream: &mut TcpStream) -> std::io::Result<()> {
    stream.write_all(
        b"\r\n=== otl admin console ===\r\n\
          Type 'help' for available commands\r\n\
          Type 'quit' to disconnect\r\n\r\n",
    )
}

fn client_loop(stream: TcpStream, key: usize, sinks: Arc<Sinks>) {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "?".into());
    let mut writer = match stream.try_clone() {
        Ok(s) => s,
        Err(_) => return,
    };
    let mut reader = BufReader::new(stream);

    if send_welcome(&mut writer).is_err() {
        remove_client(&sinks, key);
        return;
    }

    let mut line = String::new();
    loop {
        if writer.write_all(PROMPT.as_bytes()).is_err() {
            break;
        }
        line.clear();
        match reader.read_line(&mut line) {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let (response, disconnect) = process_command(trimmed);
        if writer.write_all(response.as_bytes()).is_err() {
            break;
        }
        if disconnect {
            break;
        }
    }

    remove_client(&sinks, key);
    let _ = writer.shutdown(Shutdown::Both);
    info!("console client {peer} disconnected");
}

fn remove_client(sinks: &Sinks, key: usize) {
    let mut clients = sinks.clients.lock().unwrap_or_else(|p| p.into_inner());
    if clients.contains(key) {
        clients.remove(key);
    }
}

/// Accept thread plus per-client threads; fan-out goes through the
/// shared client slab owned by [`Sinks`].
pub(crate) struct ConsoleServer {
    stop: Arc<AtomicBool>,
    accept_thread: Option<JoinHandle<()>>,
    sinks: Arc<Sinks>,
}

impl ConsoleServer {
    pub(crate) fn start(
        port: u16,
        max_connections: usize,
        sinks: Arc<Sinks>,
    ) -> Option<ConsoleServer> {
        let listener = match TcpListener::bind(("0.0.0.0", port)) {
            Ok(l) => l,
            Err(e) => {
                error!("admin console cannot bind port {port}: {e}");
                return None;
            }
        };
        if let Err(e) = listener.set_nonblocking(true) {
            error!("admin console cannot set nonblocking: {e}");
            return None;
        }

        let stop = Arc::new(AtomicBool::new(false));
        let accept_stop = stop.clone();
        let accept_sinks = sinks.clone();

        let accept_thread = std::thread::Builder::new()
            .name("otl-console".into())
            .spawn(move || {
                info!("admin console listening on port {port}");
                while !accept_stop.load(Ordering::Acquire) {
                    match listener.accept() {
                        Ok((mut stream, addr)) => {
                            let key = {
                                let mut clients = accept_sinks
                                    .clients
                                    .lock()
                                    .unwrap_or_else(|p| p.into_inner());
                                if clients.len() >= max_connections {
                                    None
                                } else {
                                    stream
                                        .try_clone()
                                        .ok()
                                        .map(|write_half| clients.insert(write_half))
                                }
                            };

                            match key {
                                Some(key) => {
                                    info!("console client connected: {addr}");
                                    let sinks = accept_sinks.clone();
                                    let spawned = std::thread::Builder::new()
                                        .name("otl-console-client".into())
                                        .spawn(move || client_loop(stream, key, sinks));
                                    if spawned.is_err() {
                                        remove_client(&accept_sinks, key);
                                    }
                                }
                                None => {
                                    warn!("console connection refused at capacity: {addr}");
                                    let _ = stream
                                        .write_all(b"Too many connections, try later.\r\n");
                                    let _ = stream.shutdown(Shutdown::Both);
                                }
                            }
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                            std::thread::sleep(Duration::from_millis(ACCEPT_POLL_MS));
                        }
                        Err(e) => {
                            warn!("admin console accept error: {e}");
                            std::thread::sleep(Duration::from_millis(ACCEPT_POLL_MS));
                        }
                    }
                }
            })
            .ok();

        Some(ConsoleServer {
            stop,
            accept_thread,
            sinks,
        })
    }

    /// Stops accepting, closes every client socket, joins the accept
    /// thread. Client threads exit on their broken sockets.
    pub(crate) fn stop(mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.accept_thread.take() {
            let _ = handle.join();
        }
        let mut clients = self.sinks.clients.lock().unwrap_or_else(|p| p.into_inner());
        for (_, stream) in clients.iter() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        clients.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_command() {
        let (response, disconnect) = process_command("frobnicate");
        assert!(response.starts_with("Unknown command: 'frobnicate'"));
        assert!(response.ends_with("\r\n"));
        assert!(!disconnect);
    }

    #[test]
    fn test_quit_variants_disconnect() {
        for cmd in ["quit", "exit", "bye", "QUIT"] {
            let (response, disconnect) = process_command(cmd);
            assert_eq!(response, "Goodbye!\r\n");
            assert!(disconnect);
        }
    }

    #[test]
    fn test_empty_line_is_silent() {
        let (response, disconnect) = process_command("   ");
        assert!(response.is_empty());
        assert!(!disconnect);
    }

    #[test]
    fn test_help_lists_builtins() {
        let (response, _) = process_command("help");
        for needle in ["help", "status", "level", "enable", "disable", "cmdshow"] {
            assert!(response.contains(needle), "missing {needle}");
        }
    }

    #[test]
    fn test_level_set_response() {
        let (response, _) = process_command("level debug");
        assert_eq!(response, "Log level set to: DEBUG\r\n");
        let (response, _) = process_command("level");
        assert!(response.starts_with("Current log level: "));
    }

    #[test]
    fn test_enable_requires_target() {
        let (response, _) = process_command("enable");
        assert!(response.starts_with("Usage: enable"));
        let (response, _) = process_command("disable bogus");
        assert!(response.starts_with("Unknown target: bogus"));
    }

    #[test]
    fn test_log_command() {
        let (response, _) = process_command("log ping warning");
        assert_eq!(response, "Log message sent at level: WARNING\r\n");
        let (response, _) = process_command("log");
        assert!(response.starts_with("Usage: log"));
    }

    #[test]
    fn test_custom_command_registration() {
        register_command(
            "pipecount",
            "pipecount",
            "Report pipeline count",
            "Pipeline",
            Arc::new(|args: &[String]| format!("pipes={} args={}", 3, args.len())),
        );
        let (response, disconnect) = process_command("pipecount extra");
        assert_eq!(response, "pipes=3 args=2\r\n");
        assert!(!disconnect);

        let (response, _) = process_command("cmdshow Pipeline");
        assert!(response.contains("Command: pipecount"));
        assert!(response.contains("Report pipeline count"));
    }

    #[test]
    fn test_status_mentions_level_and_targets() {
        let (response, _) = process_command("status");
        assert!(response.contains("Current level:"));
        assert!(response.contains("Enabled targets:"));
    }

    #[test]
    fn test_case_insensitive_commands() {
        let (response, _) = process_command("HELP");
        assert!(response.contains("Built-in commands"));
    }
}
