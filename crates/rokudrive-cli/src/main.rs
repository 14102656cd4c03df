//! Command-line client for the rokudrive on-device component.
//!
//! Each invocation opens one connection to the device, runs a single
//! operation and exits.
//!
//! # Usage
//!
//! ```bash
//! # Save a default device
//! rokudrive init 192.168.1.20
//!
//! # Read a field from the scene
//! rokudrive get-value title.text --base scene
//!
//! # Set a field (values are JSON, bare words fall back to strings)
//! rokudrive set-value rowList.jumpToItem 3 --base scene
//!
//! # Call an interface function
//! rokudrive call-func menu getItemCount '"visible"' --base element-id
//!
//! # Wait up to 30s for a field to change to a value
//! rokudrive wait-change loading.visible --base scene --equals false -w 30000
//!
//! # Dump the scene graph
//! rokudrive tree
//! rokudrive -f json tree > tree.json
//!
//! # Registry
//! rokudrive registry read
//! rokudrive registry write auth token abc123
//! rokudrive registry delete auth
//!
//! # Files
//! rokudrive read-file tmp:/capture.jpg -o capture.jpg
//! rokudrive write-file ./fixture.json tmp:/fixture.json
//! rokudrive ls tmp:/
//!
//! # Talk to another device for one call
//! ROKUDRIVE_HOST=10.0.0.7 rokudrive server-host
//! ```

use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::{Duration, Instant};

use base64::Engine;
use clap::{Parser, Subcommand, ValueEnum};
use rokudrive_core::client::{DeviceClient, RequestOptions};
use rokudrive_core::config::{default_config_path, ConfigError, DeviceConfig, LogLevel};
use rokudrive_core::error::RpcError;
use rokudrive_core::node_tree::NodeView;
use rokudrive_core::request::{BaseType, FieldMatch};
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

/// Command-line client for the rokudrive on-device component.
#[derive(Parser)]
#[command(name = "rokudrive")]
#[command(about = "Drive a Roku channel through its on-device test component")]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to ~/.rokudrive/config.json)
    #[arg(short, long, env = "ROKUDRIVE_CONFIG")]
    config: Option<PathBuf>,

    /// Device host, overriding the configuration file
    #[arg(short = 'H', long, env = "ROKUDRIVE_HOST")]
    host: Option<String>,

    /// Port of the on-device component
    #[arg(short, long)]
    port: Option<u16>,

    /// Request timeout in milliseconds
    #[arg(short, long, env = "ROKUDRIVE_TIMEOUT")]
    timeout: Option<u64>,

    /// Log level forwarded to the on-device component
    #[arg(long)]
    device_log_level: Option<LogLevel>,

    /// Output format: text or json
    #[arg(short, long, default_value = "text")]
    format: OutputFormat,

    /// Suppress the timing line on stderr
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

/// Where a key path starts.
#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Base {
    Global,
    Scene,
    FocusedNode,
    NodeRef,
    ElementId,
}

impl From<Base> for BaseType {
    fn from(base: Base) -> Self {
        match base {
            Base::Global => BaseType::Global,
            Base::Scene => BaseType::Scene,
            Base::FocusedNode => BaseType::FocusedNode,
            Base::NodeRef => BaseType::NodeRef,
            Base::ElementId => BaseType::ElementId,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Write a configuration file for a device
    Init {
        /// Device host or IP address
        host: String,
    },

    /// Read a field by key path
    GetValue {
        key_path: String,
        #[arg(short, long, value_enum, default_value = "global")]
        base: Base,
    },

    /// Set a field by key path
    SetValue {
        key_path: String,
        /// JSON value; anything that is not JSON is sent as a string
        value: String,
        #[arg(short, long, value_enum, default_value = "global")]
        base: Base,
    },

    /// Call an interface function on a node
    CallFunc {
        key_path: String,
        func_name: String,
        /// Function parameters as JSON values
        params: Vec<String>,
        #[arg(short, long, value_enum, default_value = "global")]
        base: Base,
    },

    /// Describe the focused node
    Focused {
        /// Include the node's stored reference
        #[arg(long = "ref")]
        include_ref: bool,
    },

    /// Focus a node, or with --off remove its focus
    Focus {
        key_path: String,
        #[arg(short, long, value_enum, default_value = "global")]
        base: Base,
        #[arg(long)]
        off: bool,
    },

    /// Report whether a node has focus
    HasFocus {
        key_path: String,
        #[arg(short, long, value_enum, default_value = "global")]
        base: Base,
        /// Check the focus chain instead of the node itself
        #[arg(long)]
        chain: bool,
    },

    /// Wait for a field to change
    WaitChange {
        key_path: String,
        #[arg(short, long, value_enum, default_value = "global")]
        base: Base,
        /// Keep waiting until the field equals this JSON value
        #[arg(long)]
        equals: Option<String>,
        /// How long to wait in milliseconds
        #[arg(short = 'w', long, default_value = "10000")]
        wait: u64,
    },

    /// Dump the scene graph
    Tree {
        /// Include the item components of array grids
        #[arg(long)]
        grid_children: bool,
    },

    /// Count nodes on the device
    Count {
        /// Count root nodes only
        #[arg(long)]
        roots: bool,
    },

    /// Read or change the device registry
    Registry {
        #[command(subcommand)]
        action: RegistryAction,
    },

    /// Download a device file
    ReadFile {
        /// Device path, e.g. tmp:/capture.jpg
        path: String,
        /// Local file to write (stdout if omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Upload a local file to the device
    WriteFile {
        local: PathBuf,
        path: String,
    },

    /// List a device directory
    Ls { path: String },

    /// Show type and size of a device path
    Stat { path: String },

    /// Create a device directory
    Mkdir { path: String },

    /// Delete a device file
    Rm { path: String },

    /// Rename a device file
    Mv { from: String, to: String },

    /// List mounted volumes
    Volumes,

    /// Print the channel start time (ms since the epoch)
    StartTime,

    /// Print the host address the device uses to reach this machine
    ServerHost,

    /// Disable the screen saver, or with --enable allow it again
    ScreenSaver {
        #[arg(long)]
        enable: bool,
    },
}

#[derive(Subcommand)]
enum RegistryAction {
    /// Print every section
    Read,
    /// Set one key
    Write {
        section: String,
        key: String,
        /// JSON value; anything that is not JSON is sent as a string
        value: String,
    },
    /// Delete sections
    Delete {
        sections: Vec<String>,
        /// Delete the whole registry when no sections are given
        #[arg(long)]
        all: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            e.exit_code()
        }
    }
}

#[derive(Debug)]
enum CliError {
    Connection(String),
    ActionFailed(String),
    Protocol(String),
    Config(String),
}

impl CliError {
    fn exit_code(&self) -> ExitCode {
        match self {
            CliError::Connection(_) => ExitCode::from(2),
            CliError::ActionFailed(_) => ExitCode::from(1),
            CliError::Protocol(_) => ExitCode::from(3),
            CliError::Config(_) => ExitCode::from(4),
        }
    }
}

impl std::fmt::Display for CliError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CliError::Connection(msg) => write!(f, "Connection error: {}", msg),
            CliError::ActionFailed(msg) => write!(f, "Action failed: {}", msg),
            CliError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            CliError::Config(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl From<RpcError> for CliError {
    fn from(err: RpcError) -> Self {
        match err {
            RpcError::Io(_) | RpcError::ConnectionClosed | RpcError::Timeout { .. } => {
                CliError::Connection(err.to_string())
            }
            RpcError::Device { .. } => CliError::ActionFailed(err.to_string()),
            RpcError::Protocol(_) | RpcError::UnexpectedResponse { .. } | RpcError::Tree(_) => {
                CliError::Protocol(err.to_string())
            }
            RpcError::Config(e) => CliError::Config(e.to_string()),
        }
    }
}

impl From<ConfigError> for CliError {
    fn from(err: ConfigError) -> Self {
        CliError::Config(err.to_string())
    }
}

/// Merge the configuration file with command-line overrides.
fn resolve_config(cli: &Cli) -> Result<DeviceConfig, CliError> {
    let path = cli.config.clone().unwrap_or_else(default_config_path);

    let mut config = match (DeviceConfig::load(&path), &cli.host) {
        (Ok(config), _) => config,
        (Err(ConfigError::Io(e)), Some(host)) if e.kind() == std::io::ErrorKind::NotFound => {
            DeviceConfig::new(host.clone())
        }
        (Err(ConfigError::Io(e)), None) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(CliError::Config(format!(
                "no device configured: pass --host or run `rokudrive init <host>` (looked in {})",
                path.display()
            )));
        }
        (Err(e), _) => return Err(e.into()),
    };

    if let Some(host) = &cli.host {
        config.host = host.clone();
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(timeout) = cli.timeout {
        config.default_timeout_ms = Some(timeout);
    }
    if let Some(level) = cli.device_log_level {
        config.log_level = level;
    }
    config.validate()?;
    Ok(config)
}

/// Parse a JSON argument, falling back to a plain string.
fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn render_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn tree_lines(node: NodeView<'_>, depth: usize, out: &mut Vec<String>) {
    let d = node.descriptor();
    let id = if d.id.is_empty() {
        String::new()
    } else {
        format!(" #{}", d.id)
    };
    out.push(format!("{}{}{} [ref {}]", "  ".repeat(depth), d.subtype, id, d.node_ref));
    for child in node.children() {
        tree_lines(child, depth + 1, out);
    }
}

/// What a command produced: a text rendering and a JSON rendering.
struct Output {
    text: Option<String>,
    json: Value,
}

impl Output {
    fn value(value: Value) -> Self {
        Self {
            text: Some(render_text(&value)),
            json: json!({ "success": true, "value": value }),
        }
    }

    fn done() -> Self {
        Self {
            text: None,
            json: json!({ "success": true }),
        }
    }

    fn data(text: String, data: Value) -> Self {
        Self {
            text: Some(text),
            json: json!({ "success": true, "data": data }),
        }
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    if let Command::Init { host } = &cli.command {
        let path = cli.config.clone().unwrap_or_else(default_config_path);
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(ConfigError::from)?;
        }
        let mut config = DeviceConfig::new(host.clone());
        if let Some(port) = cli.port {
            config.port = port;
        }
        config.validate()?;
        config.save(&path)?;
        if !cli.quiet {
            eprintln!("Wrote {}", path.display());
        }
        return Ok(());
    }

    let config = resolve_config(&cli)?;
    let client = DeviceClient::new(config)?;

    let started = Instant::now();
    let result = execute(&client, &cli).await;
    if let Err(e) = client.shutdown().await {
        tracing::warn!(error = %e, "shutdown failed");
    }
    let output = result?;

    match cli.format {
        OutputFormat::Json => {
            let rendered = serde_json::to_string_pretty(&output.json)
                .map_err(|e| CliError::Protocol(e.to_string()))?;
            println!("{}", rendered);
        }
        OutputFormat::Text => {
            if let Some(text) = output.text {
                println!("{}", text);
            }
            if !cli.quiet {
                let now = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S%.3fZ");
                eprintln!(
                    "|{}|{}|{}ms|",
                    now,
                    command_label(&cli.command),
                    started.elapsed().as_millis()
                );
            }
        }
    }
    Ok(())
}

fn command_label(command: &Command) -> &'static str {
    match command {
        Command::Init { .. } => "init",
        Command::GetValue { .. } => "get-value",
        Command::SetValue { .. } => "set-value",
        Command::CallFunc { .. } => "call-func",
        Command::Focused { .. } => "focused",
        Command::Focus { .. } => "focus",
        Command::HasFocus { .. } => "has-focus",
        Command::WaitChange { .. } => "wait-change",
        Command::Tree { .. } => "tree",
        Command::Count { .. } => "count",
        Command::Registry { .. } => "registry",
        Command::ReadFile { .. } => "read-file",
        Command::WriteFile { .. } => "write-file",
        Command::Ls { .. } => "ls",
        Command::Stat { .. } => "stat",
        Command::Mkdir { .. } => "mkdir",
        Command::Rm { .. } => "rm",
        Command::Mv { .. } => "mv",
        Command::Volumes => "volumes",
        Command::StartTime => "start-time",
        Command::ServerHost => "server-host",
        Command::ScreenSaver { .. } => "screen-saver",
    }
}

async fn execute(client: &DeviceClient, cli: &Cli) -> Result<Output, CliError> {
    let output = match &cli.command {
        Command::Init { .. } => Output::done(),

        Command::GetValue { key_path, base } => {
            let result = client.get_value((*base).into(), key_path.as_str()).await?;
            if !result.found {
                return Err(CliError::ActionFailed(format!("{} not found", key_path)));
            }
            Output::value(result.value)
        }

        Command::SetValue {
            key_path,
            value,
            base,
        } => {
            client
                .set_value((*base).into(), key_path.as_str(), parse_value(value))
                .await?;
            Output::done()
        }

        Command::CallFunc {
            key_path,
            func_name,
            params,
            base,
        } => {
            let params = params.iter().map(|p| parse_value(p)).collect();
            let value = client
                .call_func((*base).into(), key_path.as_str(), func_name.as_str(), params)
                .await?;
            Output::value(value)
        }

        Command::Focused { include_ref } => {
            let focused = client.get_focused_node(*include_ref).await?;
            let data = json!({ "node": focused.node, "ref": focused.node_ref });
            let text = match focused.node_ref {
                Some(node_ref) => format!("{} [ref {}]", render_text(&data["node"]), node_ref),
                None => render_text(&data["node"]),
            };
            Output::data(text, data)
        }

        Command::Focus {
            key_path,
            base,
            off,
        } => {
            client
                .focus_node((*base).into(), key_path.as_str(), !off)
                .await?;
            Output::done()
        }

        Command::HasFocus {
            key_path,
            base,
            chain,
        } => {
            let focused = if *chain {
                client
                    .is_in_focus_chain((*base).into(), key_path.as_str())
                    .await?
            } else {
                client.has_focus((*base).into(), key_path.as_str()).await?
            };
            Output::value(Value::Bool(focused))
        }

        Command::WaitChange {
            key_path,
            base,
            equals,
            wait,
        } => {
            let expected = equals.as_deref().map(|raw| FieldMatch {
                base: (*base).into(),
                key_path: key_path.clone(),
                value: parse_value(raw),
            });
            let options = RequestOptions::new().with_timeout(Duration::from_millis(*wait));
            let value = client
                .on_field_change_once((*base).into(), key_path.as_str(), expected, &options)
                .await?;
            Output::value(value)
        }

        Command::Tree { grid_children } => {
            let stored = client.store_node_references(*grid_children).await?;
            let mut lines = Vec::new();
            for root in stored.tree.roots() {
                tree_lines(root, 0, &mut lines);
            }
            let nested = serde_json::to_value(stored.tree.to_nested())
                .map_err(|e| CliError::Protocol(e.to_string()))?;
            Output::data(lines.join("\n"), nested)
        }

        Command::Count { roots } => {
            let counts = if *roots {
                client.get_roots_count().await?
            } else {
                client.get_all_count().await?
            };
            let mut lines = vec![format!("total: {}", counts.total_nodes)];
            for (subtype, count) in &counts.node_count_by_type {
                lines.push(format!("{}: {}", subtype, count));
            }
            Output::data(
                lines.join("\n"),
                json!({
                    "totalNodes": counts.total_nodes,
                    "nodeCountByType": counts.node_count_by_type,
                }),
            )
        }

        Command::Registry { action } => execute_registry(client, action).await?,

        Command::ReadFile { path, output } => {
            let bytes = client.read_file(path).await?;
            match output {
                Some(local) => {
                    std::fs::write(local, &bytes).map_err(|e| {
                        CliError::ActionFailed(format!("failed to write {}: {}", local.display(), e))
                    })?;
                    Output::data(
                        format!("{} bytes -> {}", bytes.len(), local.display()),
                        json!({ "bytes": bytes.len(), "output": local.display().to_string() }),
                    )
                }
                None if cli.format == OutputFormat::Text => {
                    std::io::stdout()
                        .write_all(&bytes)
                        .map_err(|e| CliError::ActionFailed(e.to_string()))?;
                    Output::done()
                }
                None => {
                    let encoded = base64::engine::general_purpose::STANDARD.encode(&bytes);
                    Output::data(String::new(), json!({ "base64": encoded }))
                }
            }
        }

        Command::WriteFile { local, path } => {
            let bytes = std::fs::read(local).map_err(|e| {
                CliError::ActionFailed(format!("failed to read {}: {}", local.display(), e))
            })?;
            client.write_file(path, bytes).await?;
            Output::done()
        }

        Command::Ls { path } => {
            let list = client.get_directory_listing(path).await?;
            Output::data(list.join("\n"), json!(list))
        }

        Command::Stat { path } => {
            let stat = client.stat_path(path).await?;
            let text = match stat.size {
                Some(size) => format!("{} {} bytes", stat.kind, size),
                None => stat.kind.clone(),
            };
            let mut data = stat.extra.clone();
            data.insert("type".into(), json!(stat.kind));
            data.insert("size".into(), json!(stat.size));
            Output::data(text, Value::Object(data))
        }

        Command::Mkdir { path } => {
            client.create_directory(path).await?;
            Output::done()
        }

        Command::Rm { path } => {
            client.delete_file(path).await?;
            Output::done()
        }

        Command::Mv { from, to } => {
            client.rename_file(from, to).await?;
            Output::done()
        }

        Command::Volumes => {
            let volumes = client.get_volume_list().await?;
            Output::data(volumes.join("\n"), json!(volumes))
        }

        Command::StartTime => Output::value(json!(client.get_application_start_time().await?)),

        Command::ServerHost => Output::value(json!(client.get_server_host().await?)),

        Command::ScreenSaver { enable } => {
            client.disable_screen_saver(!enable).await?;
            Output::done()
        }
    };
    Ok(output)
}

async fn execute_registry(
    client: &DeviceClient,
    action: &RegistryAction,
) -> Result<Output, CliError> {
    match action {
        RegistryAction::Read => {
            let values = client.read_registry().await?;
            let mut lines = Vec::new();
            for (section, keys) in &values {
                lines.push(format!("[{}]", section));
                for (key, value) in keys {
                    lines.push(format!("{} = {}", key, render_text(value)));
                }
            }
            Ok(Output::data(lines.join("\n"), json!(values)))
        }
        RegistryAction::Write {
            section,
            key,
            value,
        } => {
            let mut keys = BTreeMap::new();
            keys.insert(key.clone(), parse_value(value));
            let mut values = BTreeMap::new();
            values.insert(section.clone(), keys);
            client.write_registry(values).await?;
            Ok(Output::done())
        }
        RegistryAction::Delete { sections, all } => {
            if sections.is_empty() {
                if !all {
                    return Err(CliError::ActionFailed(
                        "no sections given; pass --all to delete the whole registry".into(),
                    ));
                }
                client.delete_entire_registry().await?;
            } else {
                client.delete_registry_sections(sections.clone(), *all).await?;
            }
            Ok(Output::done())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_value_prefers_json() {
        assert_eq!(parse_value("3"), json!(3));
        assert_eq!(parse_value("false"), json!(false));
        assert_eq!(parse_value(r#"{"a":1}"#), json!({"a": 1}));
        assert_eq!(parse_value("hello"), json!("hello"));
    }

    #[test]
    fn rpc_errors_map_to_exit_classes() {
        let timeout = CliError::from(RpcError::Timeout {
            request_type: "getValue",
            timeout: Duration::from_millis(10),
            call_site: None,
        });
        assert!(matches!(timeout, CliError::Connection(_)));

        let device = CliError::from(RpcError::Device {
            request_type: "setValue",
            message: "nope".into(),
        });
        assert!(matches!(device, CliError::ActionFailed(_)));
    }

    #[test]
    fn cli_definition_is_valid() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
