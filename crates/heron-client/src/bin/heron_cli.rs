// Command-line client: subscribe to channels and dump envelopes, or publish
// a JSON message.
use anyhow::{Result, bail};
use clap::Parser;
use heron_client::{Client, backend_presence, signed_presence};

#[derive(Parser, Debug)]
#[command(name = "heron-cli", version, about = "Bus client")]
struct Args {
    /// URL of the node to connect to.
    #[arg(long, default_value = "http://localhost:4444/subs")]
    url: String,

    /// Secret key used to sign --presence. Must match the auth secret of the
    /// node being connected to. Required with --presence or --backend.
    #[arg(long)]
    auth_secret: Option<String>,

    /// Presence string to use.
    #[arg(long)]
    presence: Option<String>,

    /// Connect as a backend application.
    #[arg(long)]
    backend: bool,

    /// Channel to act on. May be given more than once.
    #[arg(long, short = 'c')]
    channel: Vec<String>,

    /// Subscribe to the channels and dump every envelope as a JSON line.
    #[arg(long)]
    sub: bool,

    /// Publish the given JSON string to the channels.
    #[arg(long = "pub")]
    publish: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut client = Client::new([args.url.clone()]);
    let presence = if args.backend {
        Some("backend".to_string())
    } else {
        args.presence.clone()
    };
    if let Some(presence) = presence {
        let Some(secret) = args.auth_secret.as_deref() else {
            bail!("--auth-secret is required with --presence and --backend");
        };
        client = client.with_presence(if presence == "backend" {
            backend_presence(secret)
        } else {
            signed_presence(secret, presence)
        });
    }

    if args.channel.is_empty() {
        bail!("at least one --channel (-c) is required");
    }

    if args.sub {
        let mut subscription = client.subscribe(&args.channel).await?;
        while let Some(envelope) = subscription.recv().await {
            println!("{}", serde_json::to_string(&envelope)?);
        }
        bail!("subscription connection closed");
    }

    if let Some(message) = args.publish {
        let message: serde_json::Value = serde_json::from_str(&message)?;
        client.publish(&message, &args.channel).await?;
        return Ok(());
    }

    bail!("--sub or --pub must be given");
}
