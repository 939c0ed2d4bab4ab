use clap::Parser;
use log::{error, info, warn};
use preview_bridge::config::{Config, LogFormat, LoggingConfig};
use preview_bridge::config_validation::validate_config;
use preview_bridge::logging::{self, CustomLogger};
use preview_bridge::proxy::PreviewServer;
use preview_bridge::secrets::{SecretManager, config_has_encrypted_values};
use std::io::{self, Write};
use std::path::Path;
use tokio::signal;

#[derive(Parser)]
#[clap(
    version,
    about = "Reverse proxy that serves sandbox port previews under a single origin"
)]
struct Args {
    #[clap(short, long, value_name = "FILE", help = "Configuration file path")]
    config: Option<String>,

    #[clap(short, long, value_name = "ADDR", help = "Listen address (e.g., 127.0.0.1:8080)")]
    listen: Option<String>,

    #[clap(long, value_name = "URL", help = "Sandbox API base URL (falls back to DAYTONA_API_URL)")]
    api_url: Option<String>,

    #[clap(long, value_name = "KEY", help = "Sandbox API key (falls back to DAYTONA_API_KEY)")]
    api_key: Option<String>,

    #[clap(long, value_name = "PATH", help = "Path prefix the proxy is mounted under")]
    route_prefix: Option<String>,

    #[clap(long, value_name = "DIR", help = "Root-relative asset directory to rewrite (default: _next)")]
    asset_prefix: Option<String>,

    #[clap(long, value_name = "SECONDS", help = "Upstream timeout in seconds")]
    timeout: Option<u64>,

    #[clap(long, value_name = "FILE", help = "Private key file path for HTTPS")]
    private_key: Option<String>,

    #[clap(long, value_name = "FILE", help = "Certificate file path for HTTPS")]
    certificate: Option<String>,

    #[clap(long, value_name = "LEVEL", help = "Log level: trace, debug, info, warn, error")]
    log_level: Option<String>,

    #[clap(long, value_name = "FORMAT", help = "Log format: text or json")]
    log_format: Option<String>,

    #[clap(long, help = "Log a preview of every buffered HTML/CSS body")]
    debug_body_preview: bool,

    #[clap(long, value_name = "FILE", help = "Generate a sample configuration file")]
    generate_config: Option<String>,

    #[clap(long, help = "Create the local encryption key used for {encrypted} config values")]
    init_secret_key: bool,

    #[clap(long, help = "Read a secret from stdin and print its {encrypted} form")]
    encrypt_secret: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if let Some(config_file) = &args.generate_config {
        generate_sample_config(config_file)?;
        println!("Sample configuration file generated: {}", config_file);
        return Ok(());
    }

    if args.init_secret_key {
        let manager = SecretManager::new()?;
        manager.init_encryption_key(false)?;
        println!("Encryption key initialized");
        return Ok(());
    }

    if args.encrypt_secret {
        return encrypt_secret_from_stdin();
    }

    let mut config = if let Some(config_file) = &args.config {
        if !Path::new(config_file).exists() {
            return Err(format!("Configuration file not found: {}", config_file).into());
        }
        Config::from_file(config_file)?
    } else {
        Config::default()
    };
    apply_cli_overrides(&mut config, &args)?;
    config.apply_env_overrides();

    init_logging(&config, &args)?;

    if config_has_encrypted_values(&config) {
        SecretManager::new()?.apply_to_config(&mut config)?;
    }

    let validation = validate_config(&config)?;
    for warning in &validation.warnings {
        warn!("Configuration warning: {}", warning);
    }
    for suggestion in &validation.suggestions {
        info!("Configuration suggestion: {}", suggestion);
    }

    let server = PreviewServer::from_config(&config)?;
    info!(
        "Starting preview proxy on {} under {}",
        config.listen_addr, config.route_prefix
    );

    let server_handle = tokio::spawn(server.run());

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
        result = server_handle => {
            match result {
                Ok(Err(e)) => {
                    error!("Server error: {}", e);
                    return Err(e.into());
                }
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
    }

    info!("Preview proxy stopped");
    Ok(())
}

fn init_logging(config: &Config, args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    match &config.logging {
        Some(logging_config) => {
            let mut logging_config = logging_config.clone();
            if let Some(level) = &args.log_level {
                logging_config.level = Some(logging::parse_log_level(level)?);
            }
            if let Some(format) = &args.log_format {
                logging_config.format = Some(logging::parse_log_format(format)?);
            }
            CustomLogger::init(logging_config)
        }
        None if args.log_format.as_deref().map(str::to_lowercase).as_deref() == Some("json") => {
            let level = args
                .log_level
                .as_deref()
                .map(logging::parse_log_level)
                .transpose()?;
            CustomLogger::init(LoggingConfig {
                level,
                format: Some(LogFormat::Json),
                targets: None,
            })
        }
        None => logging::init_fallback(args.log_level.as_deref(), args.log_format.as_deref()),
    }
}

fn apply_cli_overrides(config: &mut Config, args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(listen) = &args.listen {
        config.listen_addr = listen.parse()?;
    }
    if let Some(api_url) = &args.api_url {
        config.preview_api.api_url = Some(api_url.clone());
    }
    if let Some(api_key) = &args.api_key {
        config.preview_api.api_key = Some(api_key.clone());
    }
    if let Some(prefix) = &args.route_prefix {
        config.route_prefix = prefix.clone();
    }
    if let Some(asset_prefix) = &args.asset_prefix {
        config.rewrite.asset_prefix = asset_prefix.clone();
    }
    if let Some(timeout) = args.timeout {
        config.upstream.timeout_secs = timeout;
    }
    if args.private_key.is_some() {
        config.private_key = args.private_key.clone();
    }
    if args.certificate.is_some() {
        config.certificate = args.certificate.clone();
    }
    if args.debug_body_preview {
        config.debug_body_preview = true;
    }
    Ok(())
}

fn encrypt_secret_from_stdin() -> Result<(), Box<dyn std::error::Error>> {
    let manager = SecretManager::new()?;
    eprint!("Secret to encrypt: ");
    io::stderr().flush()?;

    let mut secret = zeroize::Zeroizing::new(String::new());
    io::stdin().read_line(&mut secret)?;
    let trimmed = secret.trim_end_matches(['\r', '\n']);
    if trimmed.is_empty() {
        return Err("No secret provided on stdin".into());
    }

    println!("{}", manager.encrypt_payload(trimmed.as_bytes())?);
    Ok(())
}

fn generate_sample_config(file_path: &str) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = Config::default();
    config.preview_api.api_url = Some("https://app.daytona.io/api".to_string());
    config.preview_api.api_key = Some("{encrypted}<output of --encrypt-secret>".to_string());
    config.to_file(file_path)
}
