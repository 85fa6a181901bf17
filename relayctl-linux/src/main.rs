// relayctl node daemon: actor or controller over an emulated radio link (UDP multicast).

mod config;
mod link;
mod node;

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "relayctl-linux", version, about = "relayctl actor/controller node")]
struct Cli {
    /// Config file (default: ~/.config/relayctl/config.toml, then /etc/relayctl/config.toml).
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Override the configured role.
    #[arg(long, value_enum)]
    role: Option<config::Role>,

    /// Override the configured node id (0-9).
    #[arg(long)]
    node_id: Option<u8>,

    /// Override the configured link address (aa:bb:cc:dd:ee:ff).
    #[arg(long)]
    link_address: Option<String>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("relayctl=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut cfg = config::load(cli.config.as_deref())?;
    if let Some(role) = cli.role {
        cfg.role = role;
    }
    if let Some(id) = cli.node_id {
        cfg.node_id = id;
    }
    if let Some(addr) = cli.link_address {
        cfg.link_address = Some(addr);
    }
    cfg.validate()?;

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    rt.block_on(node::run(cfg))
}
