//! Shellgate - authenticated WebSocket gateway for container shells

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use secrecy::SecretString;
use tracing::{info, warn};

use shellgate_api::{
    AppState, CredentialResolver, KubeExecFactory, ServerConfig, TlsFiles, TokenValidator,
    VaultConfig, VaultStore,
};
use shellgate_common::{init_telemetry, LogFormat, TelemetryConfig};

/// Optional env file loaded before arguments are parsed
const CONFIG_ENV_FILE: &str = "config.env";

/// Shellgate - open shells in remote containers without holding cluster credentials
#[derive(Parser, Debug)]
#[command(name = "shellgate", version, about, long_about = None)]
struct Cli {
    /// Address to bind the server to
    #[arg(long, env = "SERVER_BIND_ADDRESS", default_value = "0.0.0.0")]
    bind_address: IpAddr,

    /// Port to listen on
    #[arg(long, env = "SERVER_PORT", default_value_t = 8080)]
    port: u16,

    /// HS512 secret used to verify access tokens
    #[arg(long, env = "JWT_SECRET", hide_env_values = true)]
    jwt_secret: String,

    /// Vault base URL
    #[arg(long, env = "VAULT_URL")]
    vault_url: String,

    /// Vault AppRole role id
    #[arg(long, env = "VAULT_ROLE_ID")]
    vault_role_id: String,

    /// Vault AppRole secret id
    #[arg(long, env = "VAULT_SECRET_ID", hide_env_values = true)]
    vault_secret_id: String,

    /// Mount path of the Vault AppRole auth method
    #[arg(long, env = "VAULT_APPROLE_MOUNT", default_value = "approle")]
    vault_approle_mount: String,

    /// Mount path of the Vault KV v2 engine holding cluster secrets
    #[arg(long, env = "VAULT_KV_MOUNT", default_value = "secret")]
    vault_kv_mount: String,

    /// Timeout for Vault requests in seconds
    #[arg(long, env = "VAULT_TIMEOUT_SECS", default_value_t = 10)]
    vault_timeout_secs: u64,

    /// TCP connect timeout for cluster API servers in seconds
    #[arg(long, env = "CLUSTER_CONNECT_TIMEOUT_SECS", default_value_t = 10)]
    cluster_connect_timeout_secs: u64,

    /// Skip TLS certificate verification against cluster API servers
    #[arg(long, env = "CLUSTER_INSECURE_SKIP_TLS_VERIFY")]
    cluster_insecure_skip_tls_verify: bool,

    /// PEM certificate chain for serving HTTPS
    #[arg(long, env = "TLS_CERT_FILE", requires = "tls_key_file")]
    tls_cert_file: Option<PathBuf>,

    /// PEM private key for serving HTTPS
    #[arg(long, env = "TLS_KEY_FILE", requires = "tls_cert_file")]
    tls_key_file: Option<PathBuf>,

    /// Log output format (json or text)
    #[arg(long, env = "LOG_FORMAT", default_value = "json")]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: Failed to install crypto provider: {:?}", e);
        std::process::exit(1);
    }

    // Values already in the environment win over the file
    let env_file_loaded = dotenvy::from_filename(CONFIG_ENV_FILE).is_ok();

    let cli = Cli::parse();

    init_telemetry(TelemetryConfig {
        service_name: "shellgate".to_string(),
        format: cli.log_format,
    })?;

    if env_file_loaded {
        info!(file = CONFIG_ENV_FILE, "Loaded configuration file");
    }

    run(cli).await
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let validator = TokenValidator::new(&SecretString::from(cli.jwt_secret));

    let mut vault = VaultConfig::new(
        cli.vault_url,
        cli.vault_role_id,
        SecretString::from(cli.vault_secret_id),
    );
    vault.approle_mount = cli.vault_approle_mount;
    vault.kv_mount = cli.vault_kv_mount;
    vault.timeout = Duration::from_secs(cli.vault_timeout_secs);
    let store = VaultStore::new(vault)
        .map_err(|e| anyhow::anyhow!("Failed to configure Vault client: {}", e))?;

    if cli.cluster_insecure_skip_tls_verify {
        warn!("TLS verification against cluster API servers is disabled");
    }
    let sessions = KubeExecFactory::new()
        .with_insecure_skip_tls_verify(cli.cluster_insecure_skip_tls_verify)
        .with_connect_timeout(Duration::from_secs(cli.cluster_connect_timeout_secs));

    let state = AppState::new(
        validator,
        CredentialResolver::new(Arc::new(store)),
        Arc::new(sessions),
    );

    let tls = match (cli.tls_cert_file, cli.tls_key_file) {
        (Some(cert_path), Some(key_path)) => Some(TlsFiles {
            cert_path,
            key_path,
        }),
        _ => None,
    };

    let config = ServerConfig {
        addr: SocketAddr::new(cli.bind_address, cli.port),
        tls,
    };

    shellgate_api::start_server(config, state).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const REQUIRED: [&str; 9] = [
        "shellgate",
        "--jwt-secret",
        "s3cret",
        "--vault-url",
        "https://vault.internal:8200",
        "--vault-role-id",
        "role",
        "--vault-secret-id",
        "secret",
    ];

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::try_parse_from(REQUIRED).unwrap();
        assert_eq!(cli.bind_address.to_string(), "0.0.0.0");
        assert_eq!(cli.port, 8080);
        assert_eq!(cli.vault_approle_mount, "approle");
        assert_eq!(cli.vault_kv_mount, "secret");
        assert_eq!(cli.vault_timeout_secs, 10);
        assert_eq!(cli.cluster_connect_timeout_secs, 10);
        assert!(!cli.cluster_insecure_skip_tls_verify);
        assert!(cli.tls_cert_file.is_none());
        assert_eq!(cli.log_format, LogFormat::Json);
    }

    #[test]
    fn test_cli_requires_both_tls_files() {
        let mut args = REQUIRED.to_vec();
        args.extend(["--tls-cert-file", "/etc/shellgate/tls.crt"]);
        assert!(Cli::try_parse_from(args).is_err());

        let mut args = REQUIRED.to_vec();
        args.extend([
            "--tls-cert-file",
            "/etc/shellgate/tls.crt",
            "--tls-key-file",
            "/etc/shellgate/tls.key",
        ]);
        assert!(Cli::try_parse_from(args).is_ok());
    }

    #[test]
    fn test_cli_cluster_connect_timeout() {
        let mut args = REQUIRED.to_vec();
        args.extend(["--cluster-connect-timeout-secs", "3"]);
        let cli = Cli::try_parse_from(args).unwrap();
        assert_eq!(cli.cluster_connect_timeout_secs, 3);

        let mut args = REQUIRED.to_vec();
        args.extend(["--cluster-connect-timeout-secs", "soon"]);
        assert!(Cli::try_parse_from(args).is_err());
    }

    #[test]
    fn test_cli_rejects_unknown_log_format() {
        let mut args = REQUIRED.to_vec();
        args.extend(["--log-format", "yaml"]);
        assert!(Cli::try_parse_from(args).is_err());
    }
}
