use clap::{builder::BoolishValueParser, Args, Parser, Subcommand, ValueEnum};
use exec_channel::request::ClientFlavor;
use std::path::PathBuf;

use crate::telemetry::logging::{LogConfig, LogLevel};

#[derive(Parser, Debug)]
#[command(
    name = "cloudshell",
    about = "Attach the local terminal to a pod over the Kubernetes exec WebSocket",
    author,
    version
)]
pub struct Cli {
    #[command(flatten)]
    pub cluster: ClusterArgs,

    #[command(flatten)]
    pub logging: LoggingArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone, Default)]
pub struct ClusterArgs {
    #[arg(
        long,
        global = true,
        env = "CLOUDSHELL_SERVER",
        value_name = "URL",
        help = "Kubernetes API server, e.g. https://api.cluster.example:6443"
    )]
    pub server: Option<String>,

    #[arg(
        long,
        global = true,
        env = "CLOUDSHELL_TOKEN",
        value_name = "TOKEN",
        hide_env_values = true,
        help = "Bearer token sent to the API server"
    )]
    pub token: Option<String>,

    #[arg(
        long = "token-file",
        global = true,
        env = "CLOUDSHELL_TOKEN_FILE",
        value_name = "PATH",
        help = "Read the bearer token from a file (ignored when --token is set)"
    )]
    pub token_file: Option<PathBuf>,

    #[arg(
        long = "certificate-authority",
        global = true,
        env = "CLOUDSHELL_CA_FILE",
        value_name = "PATH",
        help = "PEM bundle used to verify the API server"
    )]
    pub certificate_authority: Option<PathBuf>,

    #[arg(
        long = "insecure-skip-tls-verify",
        global = true,
        env = "CLOUDSHELL_INSECURE_SKIP_TLS_VERIFY",
        num_args = 0..=1,
        default_missing_value = "true",
        value_parser = BoolishValueParser::new(),
        value_name = "BOOL",
        help = "Accept any server certificate"
    )]
    pub insecure_skip_tls_verify: Option<bool>,

    #[arg(
        long = "workspace-api",
        global = true,
        env = "CLOUDSHELL_WORKSPACE_API",
        value_name = "GROUP/VERSION/PLURAL",
        help = "Workspace resource consulted for close reasons [default: workspace.devfile.io/v1alpha2/devworkspaces]"
    )]
    pub workspace_api: Option<String>,

    #[arg(
        long = "activity-endpoint",
        global = true,
        env = "CLOUDSHELL_ACTIVITY_ENDPOINT",
        value_name = "URL",
        help = "Base URL receiving workspace activity ticks"
    )]
    pub activity_endpoint: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        global = true,
        env = "CLOUDSHELL_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        global = true,
        value_name = "PATH",
        env = "CLOUDSHELL_LOG_FILE",
        help = "Write logs to the specified file instead of stderr"
    )]
    pub file: Option<PathBuf>,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Open an interactive shell in a container (Ctrl-] detaches)
    Exec(ExecArgs),
    /// Start a stopped workspace so its terminal can be reopened
    Start(StartArgs),
}

#[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq)]
pub enum ClientArg {
    #[default]
    Kubectl,
    Oc,
}

impl From<ClientArg> for ClientFlavor {
    fn from(value: ClientArg) -> Self {
        match value {
            ClientArg::Kubectl => ClientFlavor::Kubectl,
            ClientArg::Oc => ClientFlavor::Oc,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ExecArgs {
    #[arg(
        short = 'n',
        long,
        env = "CLOUDSHELL_NAMESPACE",
        default_value = "default"
    )]
    pub namespace: String,

    /// Pod to attach to
    pub pod: String,

    #[arg(short = 'c', long, value_name = "CONTAINER")]
    pub container: String,

    #[arg(
        long,
        value_name = "NAME",
        help = "Workspace resource backing the pod; enables close reasons and activity ticks"
    )]
    pub workspace: Option<String>,

    #[arg(
        long,
        value_enum,
        default_value_t = ClientArg::Kubectl,
        help = "Client named in remediation hints"
    )]
    pub client: ClientArg,

    #[arg(
        long,
        env = "CLOUDSHELL_RECONNECT",
        action = clap::ArgAction::Set,
        num_args = 0..=1,
        default_value = "true",
        default_missing_value = "true",
        value_parser = BoolishValueParser::new(),
        value_name = "BOOL",
        help = "Reconnect after the server closes the stream"
    )]
    pub reconnect: bool,

    #[arg(long = "as", value_name = "USER", help = "Impersonate a user")]
    pub as_user: Option<String>,

    #[arg(
        long = "as-group",
        value_name = "GROUP",
        help = "Impersonate a group (repeatable)"
    )]
    pub as_groups: Vec<String>,

    /// Command to run instead of the default shell (after `--`)
    #[arg(last = true, value_name = "COMMAND")]
    pub command: Vec<String>,
}

#[derive(Args, Debug, Clone)]
pub struct StartArgs {
    #[arg(
        short = 'n',
        long,
        env = "CLOUDSHELL_NAMESPACE",
        default_value = "default"
    )]
    pub namespace: String,

    /// Workspace resource to start
    pub workspace: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).expect("parse")
    }

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_exec_with_trailing_command() {
        let cli = parse(&[
            "cloudshell",
            "--server",
            "https://api.example:6443",
            "exec",
            "-n",
            "ns1",
            "p1",
            "-c",
            "c1",
            "--workspace",
            "terminal-1",
            "--client",
            "oc",
            "--as",
            "alice",
            "--as-group",
            "devs",
            "--as-group",
            "ops",
            "--",
            "bash",
            "-l",
        ]);
        assert_eq!(cli.cluster.server.as_deref(), Some("https://api.example:6443"));
        let Command::Exec(args) = cli.command else {
            panic!("expected exec");
        };
        assert_eq!(args.namespace, "ns1");
        assert_eq!(args.pod, "p1");
        assert_eq!(args.container, "c1");
        assert_eq!(args.workspace.as_deref(), Some("terminal-1"));
        assert_eq!(ClientFlavor::from(args.client), ClientFlavor::Oc);
        assert!(args.reconnect);
        assert_eq!(args.as_user.as_deref(), Some("alice"));
        assert_eq!(args.as_groups, vec!["devs".to_string(), "ops".to_string()]);
        assert_eq!(args.command, vec!["bash".to_string(), "-l".to_string()]);
    }

    #[test]
    fn reconnect_accepts_boolish_values() {
        let cli = parse(&["cloudshell", "exec", "p1", "-c", "c1", "--reconnect", "off"]);
        let Command::Exec(args) = cli.command else {
            panic!("expected exec");
        };
        assert!(!args.reconnect);
        assert!(args.command.is_empty());
    }

    #[test]
    fn exec_requires_container() {
        assert!(Cli::try_parse_from(["cloudshell", "exec", "p1"]).is_err());
    }

    #[test]
    fn global_flags_follow_subcommand() {
        let cli = parse(&[
            "cloudshell",
            "start",
            "terminal-1",
            "--insecure-skip-tls-verify",
            "--log-level",
            "debug",
        ]);
        assert_eq!(cli.cluster.insecure_skip_tls_verify, Some(true));
        assert_eq!(cli.logging.level, LogLevel::Debug);
        let Command::Start(args) = cli.command else {
            panic!("expected start");
        };
        assert_eq!(args.workspace, "terminal-1");
    }
}
