pub mod logging {
    use clap::ValueEnum;
    use std::fmt::Write as _;
    use std::fs::OpenOptions;
    use std::path::PathBuf;
    use std::sync::OnceLock;
    use tracing::subscriber::SetGlobalDefaultError;
    use tracing_appender::non_blocking::WorkerGuard;
    use tracing_subscriber::EnvFilter;

    pub const FILTER_ENV: &str = "CLOUDSHELL_LOG_FILTER";
    pub const TRACE_DEPS_ENV: &str = "CLOUDSHELL_TRACE_DEPS";

    /// Crates whose trace output drowns the exec session at `--log-level trace`.
    const NOISY_DEPENDENCIES: &[&str] = &[
        "hyper",
        "hyper_util",
        "h2",
        "mio",
        "reqwest",
        "rustls",
        "native_tls",
        "tungstenite",
        "tokio_tungstenite",
    ];

    #[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
    pub enum LogLevel {
        Error,
        #[default]
        Warn,
        Info,
        Debug,
        Trace,
    }

    impl LogLevel {
        /// Directives used when no explicit filter is given. Debug and trace
        /// only open up the crates in this workspace.
        fn directives(self) -> &'static str {
            match self {
                LogLevel::Error => "error",
                LogLevel::Warn => "warn",
                LogLevel::Info => "info",
                LogLevel::Debug => "info,exec=debug,workspace=debug,cloudshell=debug",
                LogLevel::Trace => "info,exec=trace,workspace=trace,cloudshell=trace",
            }
        }
    }

    #[derive(Clone, Debug, Default)]
    pub struct LogConfig {
        pub level: LogLevel,
        pub file: Option<PathBuf>,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum InitError {
        #[error("failed to open log file {path:?}: {source}")]
        Io {
            path: PathBuf,
            source: std::io::Error,
        },
        #[error("failed to install logger: {0}")]
        Install(#[from] SetGlobalDefaultError),
    }

    static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

    /// Installs the global subscriber. Later calls are no-ops.
    pub fn init(config: &LogConfig) -> Result<(), InitError> {
        if GUARD.get().is_some() {
            return Ok(());
        }

        let (directives, throttled) = match std::env::var(FILTER_ENV) {
            Ok(filter) => (filter, false),
            Err(_) => default_directives(config.level, env_flag(TRACE_DEPS_ENV)),
        };

        // stderr shares the raw-mode terminal with the remote shell.
        let (writer, guard) = match &config.file {
            Some(path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|source| InitError::Io {
                        path: path.clone(),
                        source,
                    })?;
                tracing_appender::non_blocking(file)
            }
            None => tracing_appender::non_blocking(std::io::stderr()),
        };

        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::new(directives))
            .with_target(config.level >= LogLevel::Debug)
            .with_thread_names(config.level >= LogLevel::Trace)
            .with_ansi(config.file.is_none())
            .with_writer(writer)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;

        let _ = GUARD.set(guard);
        if throttled {
            eprintln!(
                "[cloudshell-log] dependency traces capped at info; set {TRACE_DEPS_ENV}=1 or {FILTER_ENV} to override"
            );
        }
        Ok(())
    }

    /// Returns the filter for `level` and whether dependency traces were capped.
    fn default_directives(level: LogLevel, trace_deps: bool) -> (String, bool) {
        let mut directives = level.directives().to_owned();
        if level != LogLevel::Trace || trace_deps {
            return (directives, false);
        }
        for target in NOISY_DEPENDENCIES {
            let _ = write!(directives, ",{target}=info");
        }
        (directives, true)
    }

    fn env_flag(var: &str) -> bool {
        std::env::var(var).is_ok_and(|value| !value.is_empty() && value != "0")
    }

    /// Offset, hex and printable columns, 16 bytes per line.
    pub fn hexdump(bytes: &[u8]) -> String {
        let mut out = String::new();
        for (row, chunk) in bytes.chunks(16).enumerate() {
            let _ = write!(out, "{:06x} ", row * 16);
            for byte in chunk {
                let _ = write!(out, " {byte:02x}");
            }
            out.push_str(&"   ".repeat(16 - chunk.len()));
            out.push_str("  |");
            out.extend(chunk.iter().map(|&byte| match byte {
                0x20..=0x7e => byte as char,
                _ => '.',
            }));
            out.push_str("|\n");
        }
        out
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn trace_caps_dependency_noise() {
            let (directives, throttled) = default_directives(LogLevel::Trace, false);
            assert!(throttled);
            assert!(directives.starts_with("info,exec=trace"));
            assert!(directives.contains(",tungstenite=info"));

            let (directives, throttled) = default_directives(LogLevel::Trace, true);
            assert!(!throttled);
            assert!(!directives.contains("tungstenite"));

            assert_eq!(default_directives(LogLevel::Warn, false), ("warn".into(), false));
        }

        #[test]
        fn hexdump_shows_offsets_and_printable_bytes() {
            let dump = hexdump(b"ls -la\r");
            assert!(dump.starts_with("000000  6c 73 20 2d 6c 61 0d "), "{dump}");
            assert!(dump.trim_end().ends_with("|ls -la.|"), "{dump}");
            assert_eq!(hexdump(&[0u8; 17]).lines().count(), 2);
        }
    }
}
