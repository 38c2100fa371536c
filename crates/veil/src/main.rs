use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};

use veil::{initialize, serve_control_plane, RootError, VeilConfig};

/// Veil: identity-aware directory listings for a passthrough filesystem
///
/// Issuer keys sign identity tokens; the control plane binds verified
/// identities to process ids; listings hide whatever a process's identity
/// may not read.
#[derive(Parser, Debug)]
#[command(name = "veil", version, about, long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Only log warnings and errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate an issuer keypair: <BASE>.priv, <BASE>.pub, <BASE>.pub.jwk
    Keygen {
        /// Base path of the key files
        base: PathBuf,
    },

    /// Sign a claims file as an issuer
    Sign {
        /// Base path of the issuer keypair
        #[arg(long)]
        issuer: PathBuf,

        /// JSON file with the claims to sign
        #[arg(long)]
        claims: PathBuf,

        /// Write the token here instead of stdout
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Verify a token file against an issuer's public key
    Verify {
        /// Base path of the issuer keypair
        #[arg(long)]
        issuer: PathBuf,

        /// File holding the token
        token_file: PathBuf,
    },

    /// Convert a PEM public key into a JWK document
    ExportJwk {
        /// PEM-encoded public key
        public_key: PathBuf,

        /// Destination JWK file
        dest: PathBuf,
    },

    /// Run the control plane until interrupted
    Serve {
        /// Override the listen port
        #[arg(long)]
        port: Option<u16>,
    },

    /// List a directory as a given process would see it
    Ls {
        /// Directory to list
        dir: PathBuf,

        /// Authenticate this token and bind it to the listing pid first
        #[arg(long)]
        token: Option<PathBuf>,

        /// Acting process id (default: this process)
        #[arg(long)]
        pid: Option<u32>,
    },
}

fn init_tracing(verbose: bool, quiet: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = if verbose {
        EnvFilter::new("veil=debug,veil_cred=debug,veil_policy=debug,veil_fs=debug")
    } else if quiet {
        EnvFilter::new("warn")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("veil=info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: Option<&PathBuf>) -> Result<VeilConfig, RootError> {
    match path {
        Some(p) => VeilConfig::load(p),
        None => {
            let default_path = VeilConfig::default_config_path();
            VeilConfig::load(&default_path)
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    let result = run(cli).await;
    if let Err(e) = result {
        error!("{}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), RootError> {
    match cli.command {
        Commands::Keygen { base } => cmd_keygen(&base),
        Commands::Sign {
            issuer,
            claims,
            out,
        } => cmd_sign(&issuer, &claims, out.as_deref()),
        Commands::Verify { issuer, token_file } => cmd_verify(&issuer, &token_file),
        Commands::ExportJwk { public_key, dest } => cmd_export_jwk(&public_key, &dest),
        Commands::Serve { port } => cmd_serve(cli.config.as_ref(), port).await,
        Commands::Ls { dir, token, pid } => {
            cmd_ls(cli.config.as_ref(), &dir, token.as_deref(), pid)
        }
    }
}

fn cmd_keygen(base: &Path) -> Result<(), RootError> {
    let paths = veil_cred::generate_keypair(base)?;
    println!("Keypair written.");
    println!("  Private key: {}", paths.private.display());
    println!("  Public key:  {}", paths.public.display());
    println!("  JWK:         {}", paths.jwk.display());
    Ok(())
}

fn cmd_sign(issuer: &Path, claims: &Path, out: Option<&Path>) -> Result<(), RootError> {
    let claims_json = std::fs::read_to_string(claims)?;
    let token = veil_cred::sign(issuer, &claims_json)?;

    match out {
        Some(path) => {
            write_private(path, token.as_bytes())?;
            info!(path = %path.display(), "token written");
        }
        None => println!("{}", token),
    }
    Ok(())
}

fn cmd_verify(issuer: &Path, token_file: &Path) -> Result<(), RootError> {
    let token = std::fs::read_to_string(token_file)?;
    let keys_dir = match issuer.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let name = issuer
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| RootError::Config(format!("invalid issuer path {}", issuer.display())))?;

    let claims = veil_cred::authenticate(keys_dir, name, &token)?;
    println!("{}", serde_json::to_string_pretty(&claims)?);
    Ok(())
}

fn cmd_export_jwk(public_key: &Path, dest: &Path) -> Result<(), RootError> {
    veil_cred::export_public_key(public_key, dest)?;
    println!("JWK written to {}", dest.display());
    Ok(())
}

async fn cmd_serve(config_path: Option<&PathBuf>, port: Option<u16>) -> Result<(), RootError> {
    let mut config = load_config(config_path)?;
    if let Some(port) = port {
        config.control.port = port;
    }

    let state = Arc::new(initialize(config)?);
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
        }
    };
    serve_control_plane(state, shutdown).await
}

#[cfg(target_os = "linux")]
fn cmd_ls(
    config_path: Option<&PathBuf>,
    dir: &Path,
    token: Option<&Path>,
    pid: Option<u32>,
) -> Result<(), RootError> {
    use veil_fs::DirStream;

    let config = load_config(config_path)?;
    let state = initialize(config)?;
    let pid = pid.unwrap_or_else(std::process::id);

    if let Some(token_path) = token {
        let token = std::fs::read_to_string(token_path)?;
        let claims = state.authenticate_token(token.trim())?;
        state.bind(pid, claims);
    }

    let stream = state.open_listing(dir, pid)?;
    while let Some(entry) = stream.next()? {
        let suffix = if entry.is_dir() { "/" } else { "" };
        println!(
            "{:>12} {}{:06o} {}{}",
            entry.ino,
            entry.kind_char(),
            entry.mode,
            entry.name.to_string_lossy(),
            suffix
        );
    }
    stream.close();
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn cmd_ls(
    _config_path: Option<&PathBuf>,
    _dir: &Path,
    _token: Option<&Path>,
    _pid: Option<u32>,
) -> Result<(), RootError> {
    Err(RootError::Internal(
        "directory listings need getdents64 and are only available on Linux".into(),
    ))
}

/// Write a file readable only by its owner.
fn write_private(path: &Path, contents: &[u8]) -> Result<(), RootError> {
    use std::io::Write;

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(contents)?;
    file.write_all(b"\n")?;
    Ok(())
}
