use anyhow::Result;
use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use harbor_proto::{AppEnvelope, Envelope, RosterEntry, SignalAction, CLIENTS_UPDATE_TOPIC};
use tokio::time::{timeout, Duration, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error};

#[derive(Parser, Debug)]
#[command(name = "harbor-relay")]
#[command(about = "Harbor relay server and probe client")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Address to bind (overrides HARBOR_RELAY_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to listen on (overrides HARBOR_RELAY_PORT)
    #[arg(long)]
    pub port: Option<u16>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Connect to a running relay and print the identity and roster it announces
    Probe {
        /// Relay URL (e.g., ws://localhost:8088)
        #[arg(short, long, default_value = "ws://localhost:8088")]
        url: String,

        /// How long to keep listening for roster updates, in seconds
        #[arg(short, long, default_value_t = 5)]
        seconds: u64,
    },
}

pub async fn run_probe(url: String, seconds: u64) -> Result<()> {
    debug!("Connecting to {}", url);

    let (ws_stream, _) = match timeout(Duration::from_secs(5), connect_async(url.as_str())).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => {
            error!("Failed to connect to {}: {}", url, e);
            return Err(anyhow::anyhow!("Connection failed: {}", e));
        }
        Err(_) => {
            error!("Connection timeout after 5 seconds");
            return Err(anyhow::anyhow!("Connection timeout - is the relay running?"));
        }
    };
    let (_write, mut read) = ws_stream.split();

    let deadline = Instant::now() + Duration::from_secs(seconds);
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let next = match timeout(remaining, read.next()).await {
            Ok(next) => next,
            Err(_) => break,
        };
        let text = match next {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(_))) | None => {
                println!("relay closed the connection");
                break;
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e.into()),
        };
        match Envelope::decode(&text) {
            Ok(Envelope::Signal(signal)) if signal.action == SignalAction::ClientId => {
                if let Some(id) = signal.id {
                    println!("assigned client id {}", id);
                }
            }
            Ok(Envelope::App(app)) if app.topic == CLIENTS_UPDATE_TOPIC => {
                println!("roster: {}", describe_roster(&app));
            }
            Ok(other) => debug!("ignoring {:?}", other),
            Err(e) => debug!("undecodable frame: {}", e),
        }
    }
    Ok(())
}

fn describe_roster(app: &AppEnvelope) -> String {
    match serde_json::from_value::<Vec<RosterEntry>>(app.payload.clone()) {
        Ok(entries) => {
            let ids: Vec<String> = entries.iter().map(|e| e.id.to_string()).collect();
            format!("[{}]", ids.join(", "))
        }
        Err(_) => app.payload.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use harbor_proto::ClientId;

    #[test_timeout::timeout]
    fn parses_probe_command() {
        let cli = Cli::parse_from(["harbor-relay", "probe", "--url", "ws://relay:9000", "-s", "2"]);
        match cli.command {
            Some(Commands::Probe { url, seconds }) => {
                assert_eq!(url, "ws://relay:9000");
                assert_eq!(seconds, 2);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test_timeout::timeout]
    fn parses_server_overrides() {
        let cli = Cli::parse_from(["harbor-relay", "--port", "9100"]);
        assert!(cli.command.is_none());
        assert_eq!(cli.port, Some(9100));
        assert_eq!(cli.host, None);
    }

    #[test_timeout::timeout]
    fn roster_description_lists_ids() {
        let ids = [ClientId::new(1).unwrap(), ClientId::new(3).unwrap()];
        assert_eq!(describe_roster(&AppEnvelope::roster(&ids)), "[1, 3]");
    }
}
