//! Interactive CLI node for the FROST MPC wallet.

use clap::Parser;
use cli_node::app_runner::AppRunner;
use cli_node::network::webrtc::WebRtcTransport;
use cli_node::network::websocket::connect_relay;
use cli_node::protocal::signal::{ClientMsg, CurveType};
use cli_node::utils::state::{InternalCommand, MeshStatus, StatusUpdate};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

const DEFAULT_SIGNAL_URL: &str = "wss://auto-life.tech";

#[derive(Parser, Debug)]
#[command(name = "frost-mpc-cli", about = "FROST MPC wallet CLI node")]
struct Cli {
    /// Device identifier, unique within a session
    #[arg(long)]
    device_id: String,

    /// Default curve for proposed sessions
    #[arg(long, default_value = "secp256k1")]
    curve: String,

    /// Signaling relay URL (falls back to FROST_SIGNAL_URL)
    #[arg(long)]
    signal: Option<String>,

    /// Keystore directory (falls back to FROST_KEYSTORE, then
    /// ~/.frost_keystore)
    #[arg(long)]
    keystore: Option<PathBuf>,

    /// Run without a signaling relay (keystore operations only)
    #[arg(long)]
    offline: bool,
}

fn keystore_path(cli: &Cli) -> PathBuf {
    if let Some(path) = &cli.keystore {
        return path.clone();
    }
    if let Ok(path) = std::env::var("FROST_KEYSTORE") {
        return PathBuf::from(path);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".frost_keystore")
}

fn signal_url(cli: &Cli) -> String {
    cli.signal
        .clone()
        .or_else(|| std::env::var("FROST_SIGNAL_URL").ok())
        .unwrap_or_else(|| DEFAULT_SIGNAL_URL.to_string())
}

fn print_help() {
    println!("commands:");
    println!("  /propose <session_id> <total> <threshold> <dev1,dev2,...>");
    println!("  /accept <session_id>");
    println!("  /sign <wallet> <hex_message> <dev1,dev2,...>");
    println!("  /acceptSign <session_id>");
    println!("  /unlock <password>");
    println!("  /save <password>          save the completed DKG as a wallet");
    println!("  /wallets                  list stored wallets");
    println!("  /export <wallet> <path>");
    println!("  /import <path> <password>");
    println!("  /list                     list devices on the relay");
    println!("  /sessions                 list discoverable sessions");
    println!("  /quit");
}

fn parse_devices(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Turns one input line into a command, or a usage message.
fn parse_command(line: &str) -> Result<Option<InternalCommand>, String> {
    let mut parts = line.split_whitespace();
    let Some(cmd) = parts.next() else {
        return Ok(None);
    };
    let args: Vec<&str> = parts.collect();
    match cmd {
        "/propose" => {
            if args.len() != 4 {
                return Err("usage: /propose <session_id> <total> <threshold> <devices>".into());
            }
            let total: u16 = args[1].parse().map_err(|_| "total must be a number")?;
            let threshold: u16 = args[2].parse().map_err(|_| "threshold must be a number")?;
            Ok(Some(InternalCommand::ProposeSession {
                session_id: args[0].to_string(),
                total,
                threshold,
                participants: parse_devices(args[3]),
            }))
        }
        "/accept" | "/acceptSign" => {
            if args.len() != 1 {
                return Err(format!("usage: {cmd} <session_id>"));
            }
            Ok(Some(InternalCommand::AcceptSessionProposal(
                args[0].to_string(),
            )))
        }
        "/sign" => {
            if args.len() != 3 {
                return Err("usage: /sign <wallet> <hex_message> <devices>".into());
            }
            Ok(Some(InternalCommand::ProposeSigning {
                wallet_name: args[0].to_string(),
                message_hex: args[1].trim_start_matches("0x").to_string(),
                signers: parse_devices(args[2]),
            }))
        }
        "/unlock" => {
            if args.len() != 1 {
                return Err("usage: /unlock <password>".into());
            }
            Ok(Some(InternalCommand::UnlockKeystore {
                password: args[0].to_string(),
            }))
        }
        "/save" => {
            if args.len() != 1 {
                return Err("usage: /save <password>".into());
            }
            Ok(Some(InternalCommand::CreateWallet {
                password: args[0].to_string(),
            }))
        }
        "/wallets" => Ok(Some(InternalCommand::ListWallets)),
        "/export" => {
            if args.len() != 2 {
                return Err("usage: /export <wallet> <path>".into());
            }
            Ok(Some(InternalCommand::ExportWallet {
                wallet_id: args[0].to_string(),
                path: args[1].to_string(),
            }))
        }
        "/import" => {
            if args.len() != 2 {
                return Err("usage: /import <path> <password>".into());
            }
            Ok(Some(InternalCommand::ImportWallet {
                path: args[0].to_string(),
                password: args[1].to_string(),
            }))
        }
        "/list" => Ok(Some(InternalCommand::SendToServer(ClientMsg::ListDevices))),
        "/sessions" => Ok(Some(InternalCommand::SendToServer(
            ClientMsg::RequestActiveSessions,
        ))),
        "/help" => {
            print_help();
            Ok(None)
        }
        other => Err(format!("unknown command {other} (try /help)")),
    }
}

fn print_status(update: &StatusUpdate) {
    match update {
        StatusUpdate::SessionProposed { session_id } => {
            println!("session proposed: {session_id}");
        }
        StatusUpdate::SessionInvite { session_id, from } => {
            println!("invite from {from}: /accept {session_id}");
        }
        StatusUpdate::SessionAllAccepted { session_id } => {
            println!("all participants accepted {session_id}; forming mesh");
        }
        StatusUpdate::SessionFailed { session_id, reason } => {
            println!("session {session_id} failed: {reason}");
        }
        StatusUpdate::MeshStatusChanged(status) => match status {
            MeshStatus::Ready => println!("mesh ready"),
            MeshStatus::PartiallyReady {
                ready_devices,
                total_devices,
            } => println!("mesh {}/{}", ready_devices.len(), total_devices),
            MeshStatus::Incomplete => println!("mesh incomplete"),
        },
        StatusUpdate::DkgStateChanged(state) => println!("dkg: {state:?}"),
        StatusUpdate::DkgComplete {
            session_id,
            group_public_key,
            addresses,
        } => {
            println!("DKG complete for {session_id}");
            println!("group public key: {group_public_key}");
            for addr in addresses {
                println!("  {}: {}", addr.blockchain, addr.address);
            }
            println!("save the share with /save <password>");
        }
        StatusUpdate::WalletSaved { wallet_id } => println!("wallet saved: {wallet_id}"),
        StatusUpdate::SigningComplete {
            session_id,
            signature,
        } => {
            println!("signature for {session_id}: {signature}");
        }
        StatusUpdate::Devices(devices) => println!("devices: {}", devices.join(", ")),
        StatusUpdate::SessionsDiscovered(sessions) => {
            for s in sessions {
                println!(
                    "session {} ({} {}-of-{}) by {}",
                    s.session_id, s.curve_type, s.threshold, s.total, s.creator_device
                );
            }
        }
        StatusUpdate::WalletList(wallets) => {
            if wallets.is_empty() {
                println!("no wallets");
            }
            for w in wallets {
                println!("  {w}");
            }
        }
        StatusUpdate::Log(line) => println!("{line}"),
    }
}

async fn run() -> Result<(), cli_node::AppError> {
    let cli = Cli::parse();
    let curve = CurveType::from_string(&cli.curve).ok_or_else(|| {
        cli_node::AppError::InvalidParams(format!("unknown curve '{}'", cli.curve))
    })?;

    // Shared relay writer queue; the transport and the runner both feed it.
    let signal = if cli.offline {
        None
    } else {
        Some(connect_relay(&signal_url(&cli), &cli.device_id).await?)
    };

    let (transport, transport_events) = match &signal {
        Some(conn) => WebRtcTransport::new(conn.outgoing.clone()),
        None => {
            // Offline: no peers, but the runner still needs a transport.
            let (tx, _rx) = mpsc::unbounded_channel();
            WebRtcTransport::new(tx)
        }
    };
    let transport: std::sync::Arc<dyn cli_node::network::PeerTransport> = transport;

    let (runner, mut status_rx) =
        AppRunner::new(&cli.device_id, curve, transport, transport_events, signal);
    runner.init_keystore(keystore_path(&cli)).await?;
    let cmd_tx = runner.command_sender();

    tokio::spawn(async move {
        while let Some(update) = status_rx.recv().await {
            print_status(&update);
        }
    });

    let runner_handle = tokio::spawn(runner.run());

    println!(
        "frost-mpc-cli as {} ({}){}",
        cli.device_id,
        cli.curve,
        if cli.offline { " [offline]" } else { "" }
    );
    print_help();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "/quit" {
            let _ = cmd_tx.send(InternalCommand::Shutdown);
            break;
        }
        match parse_command(line) {
            Ok(Some(command)) => {
                if cmd_tx.send(command).is_err() {
                    break;
                }
            }
            Ok(None) => {}
            Err(usage) => println!("{usage}"),
        }
    }

    let _ = runner_handle.await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn propose_command_parses() {
        let cmd = parse_command("/propose vault 3 2 a,b,c").unwrap().unwrap();
        match cmd {
            InternalCommand::ProposeSession {
                session_id,
                total,
                threshold,
                participants,
            } => {
                assert_eq!(session_id, "vault");
                assert_eq!(total, 3);
                assert_eq!(threshold, 2);
                assert_eq!(participants, vec!["a", "b", "c"]);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn sign_command_strips_hex_prefix() {
        let cmd = parse_command("/sign vault 0xdeadbeef a,b").unwrap().unwrap();
        match cmd {
            InternalCommand::ProposeSigning { message_hex, .. } => {
                assert_eq!(message_hex, "deadbeef");
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn malformed_commands_report_usage() {
        assert!(parse_command("/propose vault x 2 a,b").is_err());
        assert!(parse_command("/sign vault").is_err());
        assert!(parse_command("/teleport").is_err());
        assert!(parse_command("").unwrap().is_none());
    }

    #[test]
    fn keystore_path_honors_flag_over_env() {
        let cli = Cli {
            device_id: "d".into(),
            curve: "secp256k1".into(),
            signal: None,
            keystore: Some(PathBuf::from("/tmp/ks")),
            offline: true,
        };
        assert_eq!(keystore_path(&cli), PathBuf::from("/tmp/ks"));
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::from(e.exit_code() as u8)
        }
    }
}
