use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

use apphub_call::{
    logging, rtc::WebRtcAudioDevices, rtc::WebRtcConnectionFactory, AppConfig, CallCapsule,
    CallController, CallDependencies, CallEvent, CallSnapshot, CallStatus, InMemorySignalLog,
    LoggingSinks, PeerIdentity, PresentationAdapter, RetryingTransport, SignalTransport,
    StaticDirectory, UserId,
};

#[derive(Parser, Debug)]
#[command(name = "apphub")]
#[command(about = "App Hub peer call loopback", long_about = None)]
struct Args {
    /// Config file (TOML, YAML or JSON)
    #[arg(long, env = "APPHUB_CONFIG")]
    config: Option<String>,

    /// User placing the call
    #[arg(long, default_value = "alice")]
    caller: String,

    /// User receiving the call
    #[arg(long, default_value = "bob")]
    callee: String,

    /// Seconds to stay connected before hanging up
    #[arg(long, default_value = "5")]
    talk_secs: u64,

    /// Give up if the call has not connected after this many seconds
    #[arg(long, default_value = "30")]
    connect_timeout_secs: u64,
}

/// One side of the loopback call
fn build_party(
    user_id: &str,
    config: &AppConfig,
    transport: &Arc<dyn SignalTransport>,
    directory: &Arc<StaticDirectory>,
) -> CallController {
    let controller = CallController::new(
        UserId::from(user_id),
        config.call.clone(),
        CallDependencies {
            transport: Arc::clone(transport),
            directory: directory.clone(),
            devices: Arc::new(WebRtcAudioDevices),
            connections: Arc::new(WebRtcConnectionFactory::new(&config.webrtc)),
        },
    );

    let sinks = Arc::new(LoggingSinks);
    let _adapter = PresentationAdapter::spawn(controller.events(), sinks.clone(), sinks);
    controller
}

/// Log the capsule whenever it changes
fn spawn_capsule_logger(user_id: String, mut rx: watch::Receiver<CallSnapshot>) {
    tokio::spawn(async move {
        let mut last = None;
        while rx.changed().await.is_ok() {
            let capsule = CallCapsule::from_snapshot(&rx.borrow_and_update());
            if capsule != last {
                match &capsule {
                    Some(c) => info!(user = %user_id, title = %c.title, subtitle = %c.subtitle, "Call capsule"),
                    None => info!(user = %user_id, "Call capsule hidden"),
                }
                last = capsule;
            }
        }
    });
}

/// Answer the first incoming call on `controller`
fn spawn_auto_answer(controller: CallController) {
    let mut events = controller.events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let CallEvent::IncomingCall(caller) = event {
                info!(caller = %caller.display_name(), "Auto-answering");
                if let Err(e) = controller.answer_call().await {
                    error!("Failed to answer call: {}", e);
                }
                break;
            }
        }
    });
}

async fn wait_for_status(controller: &CallController, status: CallStatus) -> Result<CallSnapshot> {
    let mut rx = controller.watch();
    let snapshot = rx
        .wait_for(|s| s.status == status || (status != CallStatus::Idle && s.status == CallStatus::Disconnected))
        .await
        .context("call controller dropped")?
        .clone();
    Ok(snapshot)
}

async fn run_call(args: &Args, caller: &CallController, callee: &CallController) -> Result<()> {
    caller
        .initiate_call(PeerIdentity::new(args.callee.as_str(), args.callee.as_str()))
        .await?;

    let connected = tokio::time::timeout(
        Duration::from_secs(args.connect_timeout_secs),
        wait_for_status(caller, CallStatus::Connected),
    )
    .await
    .context("timed out waiting for the call to connect")??;
    if connected.status != CallStatus::Connected {
        return Err(anyhow::anyhow!("call ended before it connected"));
    }
    info!("Call connected, talking for {}s", args.talk_secs);

    tokio::time::sleep(Duration::from_secs(args.talk_secs)).await;
    info!(duration_secs = caller.duration_secs(), "Hanging up");
    caller.hang_up().await?;

    wait_for_status(caller, CallStatus::Idle).await?;
    wait_for_status(callee, CallStatus::Idle).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 1. Load configuration
    let config = AppConfig::load(args.config.as_deref())?;
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("Config validation error: {e}");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s)",
            errors.len()
        ));
    }

    // 2. Initialize logging
    logging::init_logging(&config.logging)?;
    info!("App Hub call loopback starting...");

    // 3. Shared backend: signal log and identity directory
    let log: Arc<dyn SignalTransport> = Arc::new(InMemorySignalLog::new(config.transport.subscription_buffer));
    let transport: Arc<dyn SignalTransport> =
        Arc::new(RetryingTransport::new(log, config.transport.clone()));
    let directory = Arc::new(StaticDirectory::with_identities([
        PeerIdentity::new(args.caller.as_str(), args.caller.as_str()),
        PeerIdentity::new(args.callee.as_str(), args.callee.as_str()),
    ]));

    // 4. Controllers
    let caller = build_party(&args.caller, &config, &transport, &directory);
    let callee = build_party(&args.callee, &config, &transport, &directory);
    caller.start().await?;
    callee.start().await?;
    spawn_capsule_logger(args.caller.clone(), caller.watch());
    spawn_capsule_logger(args.callee.clone(), callee.watch());
    spawn_auto_answer(callee.clone());

    // 5. Run until the call finishes or Ctrl+C
    let outcome = tokio::select! {
        result = run_call(&args, &caller, &callee) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C");
            Ok(())
        }
    };

    caller.shutdown().await;
    callee.shutdown().await;

    match outcome {
        Ok(()) => {
            info!("Loopback call finished");
            Ok(())
        }
        Err(e) => {
            warn!("Loopback call failed: {}", e);
            Err(e)
        }
    }
}
