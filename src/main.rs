use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use clap::Parser;
use log::info;

use gatecall::{
    CallParams, MediaSource, SessionConfig, SessionDriver, SessionState, WsChannelFactory,
    format_elapsed,
};

/// Place a door-intercom call to a resident and print call state until the
/// session returns.
#[derive(Parser, Debug)]
#[command(name = "gatecall", about = "Visitor-side door intercom call client")]
struct Args {
    /// WebSocket URL of the signaling relay
    #[arg(long, default_value = "ws://127.0.0.1:5000/signal")]
    relay: String,

    /// Resident identifier to call
    #[arg(long)]
    callee: String,

    /// Display name announced to the resident
    #[arg(long, default_value = "Visitor")]
    name: String,

    /// Base URL of the optional call-status REST mirror
    #[arg(long)]
    rest: Option<String>,

    /// Do not request camera access
    #[arg(long)]
    no_video: bool,
}

#[cfg(feature = "system-audio")]
fn media_source() -> Arc<dyn MediaSource> {
    Arc::new(gatecall::CpalAudioSource::new())
}

#[cfg(not(feature = "system-audio"))]
fn media_source() -> Arc<dyn MediaSource> {
    Arc::new(gatecall::NoMedia)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "{} [{:<5}] [{}] - {}",
                Utc::now().format("%H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();

    let config = SessionConfig {
        relay_url: args.relay.clone(),
        rest_base_url: args.rest.clone(),
        want_video: !args.no_video,
        ..Default::default()
    };
    let factory = Arc::new(WsChannelFactory::new(
        config.relay_url.clone(),
        config.connect_timeout,
    ));

    info!("calling resident {} as {:?}", args.callee, args.name);
    let mut handle = SessionDriver::spawn(
        config,
        CallParams::new(args.callee, args.name),
        factory,
        media_source(),
    );
    handle.confirm_call().await;

    let mut snapshots = handle.subscribe();
    let mut last_status = None;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("hanging up");
                handle.hang_up().await;
            }
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = snapshots.borrow().clone();
                if last_status != Some(snapshot.status) {
                    last_status = Some(snapshot.status);
                    match snapshot.status {
                        SessionState::Connected => info!("connected"),
                        SessionState::Rejected => info!("no answer from the resident"),
                        SessionState::Failed => info!(
                            "call failed: {}",
                            snapshot.error_message.as_deref().unwrap_or("unknown error")
                        ),
                        status => info!("call state: {status:?}"),
                    }
                }
                if snapshot.status == SessionState::Connected && snapshot.elapsed_seconds > 0 {
                    info!("in call {}", format_elapsed(snapshot.elapsed_seconds));
                }
                if snapshot.returned {
                    break;
                }
                if snapshot.status == SessionState::Failed {
                    // Failed surfaces the diagnostic and waits for a manual
                    // return; in this CLI that is just exiting.
                    break;
                }
            }
        }
    }
    handle.finished().await;
    Ok(())
}
