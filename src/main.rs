use chrono::Utc;
use clap::{Parser, Subcommand};
use dialoguer::console::{style, Term};
use dirs::home_dir;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};
use std::thread;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_CONFIG_YAML: &str = include_str!("../config/default.yaml");
const PROXY_LIST_MARKER: &str = "[ProxyList]";
const PROXY_DIRECTIVE_PREFIXES: [&str; 2] = ["socks", "http"];
const TOTAL_STEPS: usize = 4;

#[derive(Parser, Debug)]
#[command(
    name = "toxy",
    version,
    about = "Install Tor and route ProxyChains through it"
)]
struct Cli {
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Remove old installs, install tor + proxychains, configure and start (default)
    Install,
    /// Only rewrite the proxychains configuration
    RewriteConfig {
        #[arg(long)]
        path: Option<PathBuf>,
    },
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    Doctor,
    /// Print how to manage the service and use proxychains
    Instructions,
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    Init,
    Validate,
    Show,
}

#[derive(Debug, Error)]
enum ToxyError {
    #[error("config error: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("process error: {0}")]
    Process(String),
    #[error("process error: {message}")]
    ProcessDetailed {
        message: String,
        details: ProcessErrorDetails,
    },
    #[error("this command must be run as root; re-run it with sudo")]
    NotRoot,
    #[error("no confirmation received on stdin; nothing was changed")]
    NotConfirmed,
    #[error("proxychains configuration file not found at {}", .0.display())]
    MissingProxyConfig(PathBuf),
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
struct Settings {
    version: u32,
    packages: Packages,
    repository: Repository,
    proxychains: ProxyChains,
    service: Service,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
struct Packages {
    remove: Vec<String>,
    install: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
struct Repository {
    url: String,
    suite: String,
    components: Vec<String>,
    key_url: String,
    key_path: String,
    list_path: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
struct ProxyChains {
    config_path: String,
    proxy: ProxyEntry,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
struct ProxyEntry {
    scheme: String,
    host: String,
    port: u16,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
struct Service {
    name: String,
    bootstrap_wait_sec: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: 1,
            packages: Packages::default(),
            repository: Repository::default(),
            proxychains: ProxyChains::default(),
            service: Service::default(),
        }
    }
}

impl Default for Packages {
    fn default() -> Self {
        Self {
            remove: vec!["tor".to_string(), "torbrowser-launcher".to_string()],
            install: vec!["tor".to_string(), "proxychains4".to_string()],
        }
    }
}

impl Default for Repository {
    fn default() -> Self {
        Self {
            url: "https://deb.torproject.org/torproject.org".to_string(),
            suite: "bookworm".to_string(),
            components: vec!["main".to_string()],
            key_url: "https://deb.torproject.org/torproject.org/A3C4F0F979CAA22CDBA8F512EE8CBC9E886DDD89.asc"
                .to_string(),
            key_path: "/usr/share/keyrings/tor-archive-keyring.gpg".to_string(),
            list_path: "/etc/apt/sources.list.d/torproject.list".to_string(),
        }
    }
}

impl Default for ProxyChains {
    fn default() -> Self {
        Self {
            config_path: "/etc/proxychains4.conf".to_string(),
            proxy: ProxyEntry::default(),
        }
    }
}

impl Default for ProxyEntry {
    fn default() -> Self {
        Self {
            scheme: "socks5".to_string(),
            host: "127.0.0.1".to_string(),
            port: 9050,
        }
    }
}

impl Default for Service {
    fn default() -> Self {
        Self {
            name: "tor".to_string(),
            bootstrap_wait_sec: 10,
        }
    }
}

impl Repository {
    fn key_path(&self) -> PathBuf {
        PathBuf::from(&self.key_path)
    }

    fn list_path(&self) -> PathBuf {
        PathBuf::from(&self.list_path)
    }

    /// One-line apt source pinned to the downloaded keyring.
    fn source_line(&self) -> String {
        format!(
            "deb [signed-by={}] {} {} {}",
            self.key_path,
            self.url,
            self.suite,
            self.components.join(" ")
        )
    }
}

impl ProxyChains {
    fn config_path(&self) -> PathBuf {
        PathBuf::from(&self.config_path)
    }
}

impl fmt::Display for ProxyEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.scheme, self.host, self.port)
    }
}

#[derive(Debug, Serialize)]
struct JsonResult<T: Serialize> {
    ok: bool,
    result: Option<T>,
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_details: Option<ProcessErrorDetails>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
struct ProcessErrorDetails {
    error_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    raw_stderr: Option<String>,
}

#[derive(Debug, Clone)]
struct Context {
    config_path: PathBuf,
    json: bool,
}

#[derive(Debug, Clone)]
struct CommandOutput {
    status_code: i32,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

impl CommandOutput {
    fn success(&self) -> bool {
        self.status_code == 0
    }
}

/// Everything the install pipeline needs from the host: child processes,
/// the key download, and the effective uid.
trait HostRunner {
    fn run(
        &self,
        program: &str,
        args: &[String],
        env_overrides: &BTreeMap<String, String>,
        capture_output: bool,
    ) -> Result<CommandOutput, io::Error>;

    fn download(&self, url: &str) -> Result<Vec<u8>, ToxyError>;

    fn effective_uid(&self) -> Option<u32>;
}

struct SystemHostRunner;

impl HostRunner for SystemHostRunner {
    fn run(
        &self,
        program: &str,
        args: &[String],
        env_overrides: &BTreeMap<String, String>,
        capture_output: bool,
    ) -> Result<CommandOutput, io::Error> {
        let mut cmd = Command::new(program);
        cmd.args(args).envs(env_overrides);
        let (status, stdout, stderr) = if capture_output {
            let captured = cmd.output()?;
            (captured.status, captured.stdout, captured.stderr)
        } else {
            (cmd.status()?, Vec::new(), Vec::new())
        };
        Ok(CommandOutput {
            status_code: exit_status_code(status),
            stdout,
            stderr,
        })
    }

    fn download(&self, url: &str) -> Result<Vec<u8>, ToxyError> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(concat!("toxy/", env!("CARGO_PKG_VERSION")))
            .build()?;
        let response = client.get(url).send()?;
        if !response.status().is_success() {
            return Err(ToxyError::Process(format!(
                "fetching signing key from {url} returned HTTP {}",
                response.status()
            )));
        }
        let key = response.bytes()?;
        if key.is_empty() {
            return Err(ToxyError::Process(format!(
                "signing key at {url} is empty"
            )));
        }
        Ok(key.to_vec())
    }

    fn effective_uid(&self) -> Option<u32> {
        let output = Command::new("id").arg("-u").output().ok()?;
        if !output.status.success() {
            return None;
        }
        String::from_utf8_lossy(&output.stdout).trim().parse::<u32>().ok()
    }
}

/// Signal deaths map to 128 + signal, like a shell reports them.
fn exit_status_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    1
}

fn main() -> Result<(), ToxyError> {
    let cli = Cli::parse();
    let ctx = build_context(&cli);
    let runner = SystemHostRunner;

    let result = match cli.command.unwrap_or(Commands::Install) {
        Commands::Install => handle_install(&ctx, &runner),
        Commands::RewriteConfig { path } => handle_rewrite_config(&ctx, path),
        Commands::Config { command } => handle_config(&ctx, command),
        Commands::Doctor => handle_doctor(&ctx, &runner),
        Commands::Instructions => handle_instructions(&ctx),
    };

    if let Err(err) = result {
        if ctx.json {
            let payload = JsonResult::<serde_json::Value> {
                ok: false,
                result: None,
                error: Some(err.to_string()),
                error_details: extract_process_error_details(&err),
            };
            print_json(&payload)?;
        } else {
            eprintln!("{} {err}", style("[ERROR]").red().bold());
        }
        std::process::exit(1);
    }

    Ok(())
}

fn build_context(cli: &Cli) -> Context {
    Context {
        config_path: resolve_config_path(cli.config.as_ref()),
        json: cli.json,
    }
}

fn resolve_config_path(override_path: Option<&PathBuf>) -> PathBuf {
    if let Some(path) = override_path {
        return path.clone();
    }
    if let Ok(path) = env::var("TOXY_CONFIG") {
        return PathBuf::from(path);
    }
    let mut base = default_config_dir();
    base.push("config.yaml");
    base
}

fn default_config_dir() -> PathBuf {
    if let Ok(path) = env::var("TOXY_CONFIG_DIR") {
        return PathBuf::from(path);
    }
    let mut base = home_dir().unwrap_or_else(|| PathBuf::from("."));
    base.push(".config");
    base.push("toxy");
    base
}

fn ensure_parent(path: &Path) -> Result<(), ToxyError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

fn read_settings_from_str(content: &str) -> Result<Settings, ToxyError> {
    let settings: Settings = serde_yaml::from_str(content)?;
    if settings.version != 1 {
        return Err(ToxyError::Config(format!(
            "unsupported config version {}",
            settings.version
        )));
    }
    validate_settings(&settings)?;
    Ok(settings)
}

fn read_settings(path: &Path) -> Result<Settings, ToxyError> {
    let content = fs::read_to_string(path)?;
    read_settings_from_str(&content)
}

/// A missing settings file is not an error: the built-in defaults describe
/// the stock Debian bookworm install.
fn load_settings(path: &Path) -> Result<Settings, ToxyError> {
    if !path.exists() {
        return Ok(Settings::default());
    }
    read_settings(path).map_err(|err| {
        ToxyError::Config(format!(
            "config is invalid. Please edit {} and try again. ({})",
            path.display(),
            err
        ))
    })
}

fn validate_settings(settings: &Settings) -> Result<(), ToxyError> {
    if settings.packages.install.is_empty() {
        return Err(ToxyError::Config(
            "packages.install must contain at least one package".to_string(),
        ));
    }
    for (field, list) in [
        ("packages.remove", &settings.packages.remove),
        ("packages.install", &settings.packages.install),
    ] {
        if list.iter().any(|name| name.trim().is_empty() || name.starts_with('-')) {
            return Err(ToxyError::Config(format!(
                "{field} contains an invalid package name"
            )));
        }
    }
    for (field, value) in [
        ("repository.url", &settings.repository.url),
        ("repository.suite", &settings.repository.suite),
        ("repository.key_url", &settings.repository.key_url),
        ("service.name", &settings.service.name),
    ] {
        if value.trim().is_empty() {
            return Err(ToxyError::Config(format!("{field} must be non-empty")));
        }
    }
    if settings.repository.components.is_empty() {
        return Err(ToxyError::Config(
            "repository.components must contain at least one component".to_string(),
        ));
    }
    for (field, value) in [
        ("repository.key_path", &settings.repository.key_path),
        ("repository.list_path", &settings.repository.list_path),
        ("proxychains.config_path", &settings.proxychains.config_path),
    ] {
        if !Path::new(value).is_absolute() {
            return Err(ToxyError::Config(format!(
                "{field} must be an absolute path (got '{value}')"
            )));
        }
    }
    let proxy = &settings.proxychains.proxy;
    if proxy.port == 0 {
        return Err(ToxyError::Config(
            "proxychains.proxy.port must be greater than 0".to_string(),
        ));
    }
    for (field, value) in [
        ("proxychains.proxy.scheme", &proxy.scheme),
        ("proxychains.proxy.host", &proxy.host),
    ] {
        if value.is_empty() || value.chars().any(char::is_whitespace) {
            return Err(ToxyError::Config(format!(
                "{field} must be a single non-empty word"
            )));
        }
    }
    Ok(())
}

fn say(ctx: &Context, message: impl AsRef<str>) {
    if !ctx.json {
        println!("{}", message.as_ref());
    }
}

fn warn(ctx: &Context, message: &str) {
    if !ctx.json {
        eprintln!("{} {message}", style("[WARNING]").yellow().bold());
    }
}

fn print_step(ctx: &Context, step: usize, title: &str) {
    if ctx.json {
        return;
    }
    println!();
    println!(
        "{} {}",
        style(format!("[Step {step}/{TOTAL_STEPS}]")).bold().cyan(),
        style(title).bold()
    );
}

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|part| part.to_string()).collect()
}

fn render_command(program: &str, args: &[String]) -> String {
    fn shell_quote(part: &str) -> String {
        if part.is_empty() {
            return "\"\"".to_string();
        }
        if part.chars().any(|c| c.is_whitespace()) {
            return format!("\"{}\"", part.replace('"', "\\\""));
        }
        part.to_string()
    }
    let mut parts = Vec::with_capacity(args.len() + 1);
    parts.push(program.to_string());
    parts.extend(args.iter().map(|arg| shell_quote(arg)));
    parts.join(" ")
}

fn command_env(program: &str) -> BTreeMap<String, String> {
    let mut envs = BTreeMap::new();
    if program == "apt" {
        envs.insert(
            "DEBIAN_FRONTEND".to_string(),
            "noninteractive".to_string(),
        );
    }
    envs
}

fn spawn_error_details(err: &io::Error, program: &str, command: &str) -> ProcessErrorDetails {
    if err.kind() == io::ErrorKind::NotFound {
        return ProcessErrorDetails {
            error_code: "command_not_found".to_string(),
            hint: Some(format!("Install `{program}` and ensure it is on your PATH.")),
            command: Some(command.to_string()),
            raw_stderr: None,
        };
    }
    ProcessErrorDetails {
        error_code: "command_failed".to_string(),
        hint: None,
        command: Some(command.to_string()),
        raw_stderr: None,
    }
}

#[derive(Debug, Clone, Serialize)]
struct CommandRecord {
    command: String,
    status_code: i32,
    checked: bool,
}

#[derive(Debug, Clone, Serialize)]
struct RewriteReport {
    path: String,
    backup_path: String,
    disabled_entries: usize,
    section_found: bool,
    appended: String,
}

#[derive(Debug, Serialize)]
struct InstallReport {
    started_at: String,
    finished_at: Option<String>,
    commands: Vec<CommandRecord>,
    removed_files: Vec<String>,
    repository_line: Option<String>,
    rewrite: Option<RewriteReport>,
    warnings: Vec<String>,
}

impl InstallReport {
    fn new() -> Self {
        Self {
            started_at: Utc::now().to_rfc3339(),
            finished_at: None,
            commands: Vec::new(),
            removed_files: Vec::new(),
            repository_line: None,
            rewrite: None,
            warnings: Vec::new(),
        }
    }
}

/// Runs one host command. With `check` set a non-zero exit is fatal;
/// otherwise it is recorded as a warning and the output is handed back.
fn run_host_command<R: HostRunner>(
    ctx: &Context,
    runner: &R,
    report: &mut InstallReport,
    program: &str,
    args: &[String],
    check: bool,
) -> Result<CommandOutput, ToxyError> {
    let command = render_command(program, args);
    say(ctx, format!("\n-> Running: {command}"));
    let envs = command_env(program);
    let cmd_output = match runner.run(program, args, &envs, ctx.json) {
        Ok(cmd_output) => cmd_output,
        Err(err) if !check => {
            let warning = format!("failed to run `{command}`: {err}; continuing");
            warn(ctx, &warning);
            report.warnings.push(warning);
            // Same status a shell reports for a missing binary.
            report.commands.push(CommandRecord {
                command,
                status_code: 127,
                checked: false,
            });
            return Ok(CommandOutput {
                status_code: 127,
                stdout: Vec::new(),
                stderr: err.to_string().into_bytes(),
            });
        }
        Err(err) => {
            let details = spawn_error_details(&err, program, &command);
            return Err(ToxyError::ProcessDetailed {
                message: format!("failed to run command `{command}`: {err}"),
                details,
            });
        }
    };
    report.commands.push(CommandRecord {
        command: command.clone(),
        status_code: cmd_output.status_code,
        checked: check,
    });
    // Captured only in --json mode; keep stdout clean for the envelope.
    if !cmd_output.stdout.is_empty() {
        eprint!("{}", String::from_utf8_lossy(&cmd_output.stdout));
    }
    if cmd_output.success() {
        return Ok(cmd_output);
    }
    let stderr = String::from_utf8_lossy(&cmd_output.stderr)
        .trim()
        .to_string();
    if !check {
        let warning = format!(
            "`{command}` exited with status {}; continuing",
            cmd_output.status_code
        );
        warn(ctx, &warning);
        report.warnings.push(warning);
        return Ok(cmd_output);
    }
    let mut message = format!(
        "command failed with exit code {} while running `{}`",
        cmd_output.status_code, command
    );
    if !stderr.is_empty() {
        message = format!("{message}: {stderr}");
    }
    Err(ToxyError::ProcessDetailed {
        message,
        details: ProcessErrorDetails {
            error_code: "command_failed".to_string(),
            hint: None,
            command: Some(command),
            raw_stderr: if stderr.is_empty() { None } else { Some(stderr) },
        },
    })
}

/// Removes `path` if it exists. Returns whether anything was removed.
fn remove_if_present(path: &Path) -> Result<bool, ToxyError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err.into()),
    }
}

fn cleanup_existing_install<R: HostRunner>(
    ctx: &Context,
    runner: &R,
    settings: &Settings,
    report: &mut InstallReport,
) -> Result<(), ToxyError> {
    print_step(ctx, 1, "Cleaning up old Tor and Tor Browser installations...");
    if !settings.packages.remove.is_empty() {
        let mut args = argv(&["purge", "-y"]);
        args.extend(settings.packages.remove.iter().cloned());
        run_host_command(ctx, runner, report, "apt", &args, false)?;
    }

    for (label, path) in [
        ("repository file", settings.repository.list_path()),
        ("signing key", settings.repository.key_path()),
    ] {
        if remove_if_present(&path)? {
            say(ctx, format!("Removed old {label}: {}", path.display()));
            report.removed_files.push(path.to_string_lossy().to_string());
        }
    }

    run_host_command(ctx, runner, report, "apt", &argv(&["autoremove", "-y"]), true)?;
    run_host_command(ctx, runner, report, "apt", &argv(&["update"]), true)?;
    say(ctx, "Cleanup complete.");
    Ok(())
}

/// Hidden name next to `path` used to stage a file before it is moved in.
fn staging_path(path: &Path, suffix: &str) -> PathBuf {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| "toxy".to_string());
    path.with_file_name(format!(".{name}.{suffix}-{}", std::process::id()))
}

/// Swaps `content` in for `path` via a staged sibling and a rename. An
/// existing file keeps its permission bits; a new one gets `new_file_mode`.
fn replace_file(path: &Path, content: &str, new_file_mode: u32) -> Result<(), ToxyError> {
    ensure_parent(path)?;
    let staged = staging_path(path, "new");
    fs::write(&staged, content)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = fs::metadata(path)
            .map(|meta| meta.permissions().mode())
            .unwrap_or(new_file_mode);
        fs::set_permissions(&staged, fs::Permissions::from_mode(mode))?;
    }
    #[cfg(not(unix))]
    let _ = new_file_mode;
    if let Err(err) = fs::rename(&staged, path) {
        let _ = fs::remove_file(&staged);
        return Err(err.into());
    }
    Ok(())
}

fn install_signing_key<R: HostRunner>(
    ctx: &Context,
    runner: &R,
    settings: &Settings,
    report: &mut InstallReport,
) -> Result<(), ToxyError> {
    let key_path = settings.repository.key_path();
    say(
        ctx,
        format!(
            "-> Downloading Tor Project signing key from {}",
            settings.repository.key_url
        ),
    );
    let armored = runner.download(&settings.repository.key_url)?;
    ensure_parent(&key_path)?;
    let staged = staging_path(&key_path, "asc");
    fs::write(&staged, &armored)?;
    let args = vec![
        "--batch".to_string(),
        "--yes".to_string(),
        "--dearmor".to_string(),
        "--output".to_string(),
        key_path.to_string_lossy().to_string(),
        staged.to_string_lossy().to_string(),
    ];
    let dearmored = run_host_command(ctx, runner, report, "gpg", &args, true);
    let _ = fs::remove_file(&staged);
    dearmored?;
    let args = vec!["644".to_string(), key_path.to_string_lossy().to_string()];
    run_host_command(ctx, runner, report, "chmod", &args, true)?;
    Ok(())
}

fn install_packages<R: HostRunner>(
    ctx: &Context,
    runner: &R,
    settings: &Settings,
    report: &mut InstallReport,
) -> Result<(), ToxyError> {
    print_step(ctx, 2, "Installing Tor and ProxyChains...");
    install_signing_key(ctx, runner, settings, report)?;

    let list_path = settings.repository.list_path();
    let line = settings.repository.source_line();
    say(
        ctx,
        format!(
            "-> Adding Tor repository for {} at {}",
            settings.repository.suite,
            list_path.display()
        ),
    );
    replace_file(&list_path, &format!("{line}\n"), 0o644)?;
    report.repository_line = Some(line);

    run_host_command(ctx, runner, report, "apt", &argv(&["update"]), true)?;
    let mut args = argv(&["install", "-y"]);
    args.extend(settings.packages.install.iter().cloned());
    run_host_command(ctx, runner, report, "apt", &args, true)?;
    say(ctx, "Tor and ProxyChains installation complete.");
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct RewrittenProxyList {
    content: String,
    disabled_entries: usize,
    section_found: bool,
}

fn is_proxy_directive(line: &str) -> bool {
    let trimmed = line.trim();
    PROXY_DIRECTIVE_PREFIXES
        .iter()
        .any(|prefix| trimmed.starts_with(prefix))
}

/// Comments out every proxy directive and appends `entry` at the end of the
/// file, synthesizing a `[ProxyList]` header when none exists.
///
/// Directive matching wins over header matching, so a line such as
/// `socks4 [ProxyList]` is disabled and does not count as the header.
fn rewrite_proxy_list(content: &str, entry: &ProxyEntry) -> RewrittenProxyList {
    let mut out = String::with_capacity(content.len() + 64);
    let mut disabled_entries = 0;
    let mut section_found = false;
    for line in content.split_inclusive('\n') {
        if is_proxy_directive(line) {
            out.push_str("# ");
            out.push_str(line);
            disabled_entries += 1;
        } else {
            if line.contains(PROXY_LIST_MARKER) {
                section_found = true;
            }
            out.push_str(line);
        }
    }
    if !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
    if !section_found {
        out.push('\n');
        out.push_str(PROXY_LIST_MARKER);
        out.push_str("\n\n");
    }
    out.push_str(&entry.to_string());
    out.push('\n');
    RewrittenProxyList {
        content: out,
        disabled_entries,
        section_found,
    }
}

fn backup_path(path: &Path) -> PathBuf {
    let mut raw = path.as_os_str().to_os_string();
    raw.push(".bak");
    PathBuf::from(raw)
}

fn configure_proxychains(
    ctx: &Context,
    path: &Path,
    entry: &ProxyEntry,
) -> Result<RewriteReport, ToxyError> {
    if !path.is_file() {
        return Err(ToxyError::MissingProxyConfig(path.to_path_buf()));
    }
    let backup = backup_path(path);
    say(
        ctx,
        format!("-> Backing up original config to {}", backup.display()),
    );
    fs::copy(path, &backup)?;

    // The rename in `replace_file` must land on the link target, not the link.
    let target = fs::canonicalize(path)?;
    let original = fs::read_to_string(&target)?;
    let rewritten = rewrite_proxy_list(&original, entry);
    replace_file(&target, &rewritten.content, 0o644)?;

    if rewritten.disabled_entries > 0 {
        say(
            ctx,
            format!(
                "-> Disabled {} existing proxy entr{}.",
                rewritten.disabled_entries,
                if rewritten.disabled_entries == 1 { "y" } else { "ies" }
            ),
        );
    }
    if rewritten.section_found {
        say(ctx, format!("-> Added `{entry}` to {PROXY_LIST_MARKER}."));
    } else {
        warn(
            ctx,
            &format!(
                "could not find a '{PROXY_LIST_MARKER}' section in {}; added one at the end",
                path.display()
            ),
        );
    }

    Ok(RewriteReport {
        path: path.to_string_lossy().to_string(),
        backup_path: backup.to_string_lossy().to_string(),
        disabled_entries: rewritten.disabled_entries,
        section_found: rewritten.section_found,
        appended: entry.to_string(),
    })
}

fn usage_instructions(settings: &Settings) -> String {
    let service = &settings.service.name;
    format!(
        r#"
### How to Manage Tor Services
You can control the Tor service using 'systemctl'. These commands require administrative privileges.

- Start Tor:
  sudo systemctl start {service}
- Stop Tor:
  sudo systemctl stop {service}
- Restart Tor (to get a new IP):
  sudo systemctl restart {service}
- Check Tor's status:
  sudo systemctl status {service}

### How to Run Applications with ProxyChains
Traffic is routed through {proxy}. Prefix any command with `proxychains`.

- Example: Run Firefox through Tor
  proxychains firefox-esr
- Example: Check your IP address
  proxychains curl ipinfo.io
"#,
        proxy = settings.proxychains.proxy
    )
}

fn start_service<R: HostRunner>(
    ctx: &Context,
    runner: &R,
    settings: &Settings,
    report: &mut InstallReport,
) -> Result<(), ToxyError> {
    print_step(ctx, 4, "Starting Tor service and finalizing setup...");
    let args = vec![
        "enable".to_string(),
        "--now".to_string(),
        settings.service.name.clone(),
    ];
    run_host_command(ctx, runner, report, "systemctl", &args, true)?;

    let wait = settings.service.bootstrap_wait_sec;
    if wait > 0 {
        say(
            ctx,
            format!("-> Waiting {wait} seconds for Tor to connect to the network..."),
        );
        thread::sleep(Duration::from_secs(wait));
    }
    say(
        ctx,
        format!(
            "\n{}",
            style("All done! Tor and ProxyChains are installed and ready to use.")
                .green()
                .bold()
        ),
    );
    say(ctx, usage_instructions(settings));
    Ok(())
}

fn print_plan(ctx: &Context) {
    say(ctx, format!("{}", style("=== Toxy ===").bold().cyan()));
    say(ctx, "\nThis will perform the following steps:");
    say(ctx, "1. Clean up any existing Tor installations to ensure a fresh start.");
    say(ctx, "2. Install the latest Tor and ProxyChains packages.");
    say(ctx, "3. Configure ProxyChains to route traffic through the Tor network.");
    say(ctx, "4. Start and enable the Tor service, and provide usage instructions.");
}

/// Blocks until a line arrives on `input`. End of input is a refusal, so a
/// closed stdin never starts the purge.
fn wait_for_confirmation<B: io::BufRead>(input: &mut B) -> Result<(), ToxyError> {
    Term::stderr().write_line("\nPress Enter to begin the process...")?;
    let mut line = String::new();
    if input.read_line(&mut line)? == 0 {
        return Err(ToxyError::NotConfirmed);
    }
    Ok(())
}

fn require_root<R: HostRunner>(runner: &R) -> Result<(), ToxyError> {
    match runner.effective_uid() {
        Some(0) => Ok(()),
        _ => Err(ToxyError::NotRoot),
    }
}

/// Root check followed by the four install steps. Stops at the first error;
/// a rerun always starts again from cleanup.
fn run_install_pipeline<R: HostRunner>(
    ctx: &Context,
    runner: &R,
    settings: &Settings,
) -> Result<InstallReport, ToxyError> {
    require_root(runner)?;
    let mut report = InstallReport::new();
    cleanup_existing_install(ctx, runner, settings, &mut report)?;
    install_packages(ctx, runner, settings, &mut report)?;

    print_step(ctx, 3, "Configuring ProxyChains...");
    let rewrite = configure_proxychains(
        ctx,
        &settings.proxychains.config_path(),
        &settings.proxychains.proxy,
    )?;
    say(ctx, "ProxyChains configuration complete.");
    report.rewrite = Some(rewrite);

    start_service(ctx, runner, settings, &mut report)?;
    report.finished_at = Some(Utc::now().to_rfc3339());
    Ok(report)
}

fn handle_install<R: HostRunner>(ctx: &Context, runner: &R) -> Result<(), ToxyError> {
    let settings = load_settings(&ctx.config_path)?;
    print_plan(ctx);
    wait_for_confirmation(&mut io::stdin().lock())?;
    let report = run_install_pipeline(ctx, runner, &settings)?;
    if ctx.json {
        return output(ctx, serde_json::to_value(report)?);
    }
    println!("\nFinished.");
    Ok(())
}

fn handle_rewrite_config(ctx: &Context, path: Option<PathBuf>) -> Result<(), ToxyError> {
    let settings = load_settings(&ctx.config_path)?;
    let target = path.unwrap_or_else(|| settings.proxychains.config_path());
    let report = configure_proxychains(ctx, &target, &settings.proxychains.proxy)?;
    output(ctx, serde_json::to_value(report)?)
}

fn handle_config(ctx: &Context, command: ConfigCommand) -> Result<(), ToxyError> {
    match command {
        ConfigCommand::Init => {
            if ctx.config_path.exists() {
                return output(ctx, json!({"path": ctx.config_path, "created": false}));
            }
            ensure_parent(&ctx.config_path)?;
            fs::write(&ctx.config_path, DEFAULT_CONFIG_YAML)?;
            output(ctx, json!({"path": ctx.config_path, "created": true}))
        }
        ConfigCommand::Validate => {
            if !ctx.config_path.exists() {
                return Err(ToxyError::Config(format!(
                    "config file not found: {}",
                    ctx.config_path.display()
                )));
            }
            let _settings = read_settings(&ctx.config_path)?;
            output(ctx, json!({"path": ctx.config_path, "valid": true}))
        }
        ConfigCommand::Show => {
            let settings = load_settings(&ctx.config_path)?;
            if ctx.json {
                return output(
                    ctx,
                    json!({
                        "path": ctx.config_path,
                        "exists": ctx.config_path.exists(),
                        "settings": settings,
                    }),
                );
            }
            println!("# {}", ctx.config_path.display());
            print!("{}", serde_yaml::to_string(&settings)?);
            Ok(())
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct DoctorCheck {
    id: String,
    ok: bool,
    severity: String,
    message: String,
    remediation: String,
}

fn doctor_check(
    id: &str,
    ok: bool,
    severity: &str,
    message: impl Into<String>,
    remediation: impl Into<String>,
) -> DoctorCheck {
    DoctorCheck {
        id: id.to_string(),
        ok,
        severity: severity.to_string(),
        message: message.into(),
        remediation: remediation.into(),
    }
}

fn collect_doctor_checks<R: HostRunner>(runner: &R, settings: &Settings) -> Vec<DoctorCheck> {
    let mut checks = Vec::new();

    let uid = runner.effective_uid();
    checks.push(doctor_check(
        "root_privileges",
        uid == Some(0),
        "error",
        match uid {
            Some(0) => "running as root".to_string(),
            Some(uid) => format!("running as uid {uid}"),
            None => "unable to determine the effective uid".to_string(),
        },
        "Re-run with sudo.",
    ));

    for (binary, purpose) in [
        ("apt", "package installation"),
        ("gpg", "signing key conversion"),
        ("systemctl", "service management"),
    ] {
        let found = which::which(binary).is_ok();
        checks.push(doctor_check(
            binary,
            found,
            "error",
            if found {
                format!("{binary} found")
            } else {
                format!("{binary} is not installed or not in PATH (needed for {purpose})")
            },
            "Run toxy on a Debian-based host with systemd.",
        ));
    }

    let config_path = settings.proxychains.config_path();
    let config_exists = config_path.is_file();
    checks.push(doctor_check(
        "proxychains_config",
        config_exists,
        "warning",
        if config_exists {
            format!("{} present", config_path.display())
        } else {
            format!("{} missing", config_path.display())
        },
        "It is created by the proxychains4 package during `toxy install`.",
    ));

    checks
}

fn handle_doctor<R: HostRunner>(ctx: &Context, runner: &R) -> Result<(), ToxyError> {
    let settings = load_settings(&ctx.config_path)?;
    let checks = collect_doctor_checks(runner, &settings);
    let primary_error = checks
        .iter()
        .find(|check| !check.ok && check.severity == "error")
        .map(|check| check.message.clone());
    let ok = primary_error.is_none();

    if ctx.json {
        let payload = JsonResult {
            ok,
            result: Some(json!({ "checks": checks })),
            error: primary_error,
            error_details: None,
        };
        print_json(&payload)?;
        return Ok(());
    }

    for check in &checks {
        let state = if check.ok { "ok" } else { "fail" };
        println!(
            "[{}] {} ({}) - {}",
            state, check.id, check.severity, check.message
        );
        if !check.ok {
            println!("  remediation: {}", check.remediation);
        }
    }
    match primary_error {
        Some(message) => Err(ToxyError::Process(message)),
        None => Ok(()),
    }
}

fn handle_instructions(ctx: &Context) -> Result<(), ToxyError> {
    let settings = load_settings(&ctx.config_path)?;
    let text = usage_instructions(&settings);
    if ctx.json {
        return output(ctx, json!({ "instructions": text }));
    }
    println!("{text}");
    Ok(())
}

fn extract_process_error_details(err: &ToxyError) -> Option<ProcessErrorDetails> {
    match err {
        ToxyError::ProcessDetailed { details, .. } => Some(details.clone()),
        _ => None,
    }
}

fn output(ctx: &Context, payload: serde_json::Value) -> Result<(), ToxyError> {
    if ctx.json {
        let wrapper = JsonResult {
            ok: true,
            result: Some(payload),
            error: None,
            error_details: None,
        };
        print_json(&wrapper)?;
    } else {
        println!("{}", payload);
    }
    Ok(())
}

fn print_json<T: Serialize>(payload: &T) -> Result<(), ToxyError> {
    let text = serde_json::to_string_pretty(payload)?;
    println!("{}", text);
    Ok(())
}
