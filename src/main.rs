use std::process::ExitCode;
use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt};

use tlsgate::config::{CliConfig, SslSettings};
use tlsgate::gateway::{Capability, SslGateway, SslRuntime};
use tlsgate::tls::{SecureContext, SecureStream, StreamError, server_name_for};

// -----------------------------------------------------------------------------
// ----- Constants -------------------------------------------------------------

const APP_NAME: &str = "tlsgate";

/// Exit code when no usable runtime is installed.
const EXIT_NOT_LOADED: u8 = 3;

// -----------------------------------------------------------------------------
// ----- Main ------------------------------------------------------------------

#[tokio::main]
async fn main() -> ExitCode {
    let cli = setup();

    let gateway = SslGateway::global_with(&cli.gateway_config());
    let runtime = match gateway.runtime() {
        Ok(runtime) => runtime,
        Err(err) => {
            error!("{APP_NAME}: {err}");
            println!("runtime: unavailable ({err})");
            return ExitCode::from(EXIT_NOT_LOADED);
        }
    };

    report(&runtime);

    let Some(addr) = cli.connect.as_deref() else {
        return ExitCode::SUCCESS;
    };

    let settings = match &cli.settings_file {
        Some(path) => match SslSettings::from_file(path) {
            Ok(settings) => settings,
            Err(err) => {
                error!("{APP_NAME}: {err}");
                return ExitCode::FAILURE;
            }
        },
        None => SslSettings::require(),
    };

    let outcome = if cli.use_bio {
        probe_bio(runtime, addr.to_string(), settings).await
    } else {
        probe_stream(runtime, addr, &settings).await
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{APP_NAME}: connect to {addr} failed: {err}");
            println!("handshake: failed ({err})");
            ExitCode::FAILURE
        }
    }
}

// -----------------------------------------------------------------------------
// ----- Setup -----------------------------------------------------------------

fn setup() -> CliConfig {
    let cli = CliConfig::snapshot();
    init_tracing(&cli);
    cli
}

fn init_tracing(cli: &CliConfig) {
    let filter = EnvFilter::try_new(cli.log_level.as_str()).unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

// -----------------------------------------------------------------------------
// ----- Report ----------------------------------------------------------------

fn report(runtime: &SslRuntime) {
    match runtime.version() {
        Ok(version) => println!("runtime: {version}"),
        Err(err) => println!("runtime: version unavailable ({err})"),
    }

    for path in runtime.module_paths() {
        println!("module: {}", path.display());
    }

    for capability in Capability::ALL.into_iter().filter(|c| c.is_optional()) {
        match runtime.table().resolved_name(capability) {
            Some(name) => println!("optional: {capability} -> {name}"),
            None => println!("optional: {capability} -> unavailable"),
        }
    }
}

// -----------------------------------------------------------------------------
// ----- Probes ----------------------------------------------------------------

async fn probe_stream(
    runtime: Arc<SslRuntime>,
    addr: &str,
    settings: &SslSettings,
) -> Result<(), StreamError> {
    let stream = SecureStream::connect_with(runtime, addr, settings).await?;
    info!("{APP_NAME}: connected to {}", stream.peer_addr()?);

    println!("handshake: ok");
    println!(
        "peer certificate: {}",
        presence(stream.peer_certificate()?.is_some())
    );
    println!("verify result: {}", stream.verify_result()?);
    Ok(())
}

/// The BIO chain does blocking socket I/O, so it runs off the async workers.
async fn probe_bio(
    runtime: Arc<SslRuntime>,
    addr: String,
    settings: SslSettings,
) -> Result<(), StreamError> {
    if !settings.is_enabled() {
        return Err(StreamError::Disabled);
    }

    let task = tokio::task::spawn_blocking(move || -> Result<(), StreamError> {
        let context = SecureContext::client(runtime, &settings)?;
        let server_name = server_name_for(&addr, &settings);
        let conn = context.connect_bio(&addr, server_name.as_deref())?;

        conn.handshake()?;
        if settings.verify_peer {
            conn.check_verified()?;
        }

        println!("handshake: ok (bio)");
        println!("socket: {}", conn.fd()?.map_or("none".to_string(), |fd| fd.to_string()));
        println!(
            "peer certificate: {}",
            presence(conn.peer_certificate()?.is_some())
        );
        println!("verify result: {}", conn.verify_result()?);
        Ok(())
    });

    task.await.map_err(std::io::Error::other)?
}

fn presence(present: bool) -> &'static str {
    if present { "present" } else { "absent" }
}

// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
