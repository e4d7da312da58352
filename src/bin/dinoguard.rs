use anyhow::Context as _;
use clap::{Parser, Subcommand, ValueEnum};
use dinoguard::{
    ClientEnvironment, ContextDeps, FetchOptions, GuardConfig, InputGuard, InputKind,
    SecurityContext,
};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;
use url::Url;

#[derive(Parser)]
#[command(name = "dinoguard")]
#[command(about = "Client-side security guard: CSRF tokens, input validation and environment checks", long_about = None)]
struct Cli {
    /// TOML configuration file; DINOGUARD_* variables override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = LogFormat::Pretty, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Pretty,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a value as email, phone, password or text
    Validate {
        #[arg(short, long, default_value = "text")]
        kind: InputKind,
        input: String,
    },
    /// Strip dangerous characters and bound the length
    Sanitize { input: String },
    /// Check transport security, storage and cookies for an origin
    Audit {
        /// Origin to check instead of the configured base URL
        #[arg(long)]
        origin: Option<Url>,
        /// Report cookies as disabled
        #[arg(long)]
        no_cookies: bool,
    },
    /// Fetch a CSRF token and print its expiry
    Token {
        /// Also print the token value
        #[arg(long)]
        show: bool,
    },
    /// Send a request carrying the CSRF token
    Request {
        #[arg(short = 'X', long, default_value = "POST")]
        method: String,
        url: String,
        /// JSON request body
        #[arg(long)]
        body: Option<String>,
        /// Refetch the token and retry once if the server rejects it
        #[arg(long)]
        retry: bool,
    },
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let config = GuardConfig::load(cli.config.as_deref()).context("loading configuration")?;

    match cli.command {
        Commands::Validate { kind, input } => {
            let result = InputGuard::with_max_length(config.max_input_length).validate(&input, kind);
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(if result.is_valid {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Commands::Sanitize { input } => {
            println!(
                "{}",
                InputGuard::with_max_length(config.max_input_length).sanitize(&input)
            );
            Ok(ExitCode::SUCCESS)
        }
        Commands::Audit { origin, no_cookies } => {
            let mut deps = ContextDeps::from_config(&config)?;
            if let Some(origin) = origin {
                deps.environment = ClientEnvironment::new(origin, deps.environment.cookies_enabled);
            }
            if no_cookies {
                deps.environment.cookies_enabled = false;
            }

            let context = SecurityContext::initialize(
                GuardConfig {
                    prefetch_on_start: false,
                    ..config
                },
                deps,
            )?;
            let report = context.report().clone();
            println!("{}", serde_json::to_string_pretty(&report)?);

            // the context published the same findings; print their follow-up advice
            for alert in context.alerts().list() {
                if let Some(hint) = alert.hint() {
                    eprintln!("{}: {}", alert.title, hint);
                }
            }
            context.dispose();

            Ok(if report.is_secure {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Commands::Token { show } => {
            let context = build_context(config)?;
            let token = context.tokens().get_valid().await?;

            let mut out = serde_json::json!({
                "issued_at": token.issued_at,
                "expires_at": token.expires_at,
                "ttl_seconds": token.ttl_seconds,
            });
            if show {
                out["csrf_token"] = serde_json::Value::String(token.value.clone());
            }
            println!("{}", serde_json::to_string_pretty(&out)?);
            context.dispose();
            Ok(ExitCode::SUCCESS)
        }
        Commands::Request {
            method,
            url,
            body,
            retry,
        } => {
            let mut options = FetchOptions::method(method);
            if let Some(body) = body {
                let parsed: serde_json::Value =
                    serde_json::from_str(&body).context("request body is not valid JSON")?;
                options = options.with_json(&parsed)?;
            }

            let context = build_context(config)?;
            let response = if retry {
                context.wrap_retrying_once(&url, options).await?
            } else {
                context.wrap(&url, options).await?
            };

            eprintln!("HTTP {}", response.status);
            println!("{}", response.body);
            context.dispose();

            Ok(if response.ok {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
    }
}

fn build_context(config: GuardConfig) -> anyhow::Result<std::sync::Arc<SecurityContext>> {
    let deps = ContextDeps::from_config(&config)?;
    let context = SecurityContext::initialize(
        GuardConfig {
            prefetch_on_start: false,
            ..config
        },
        deps,
    )?;
    Ok(context)
}
