use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "anvil", version, about = "Terminal dashboard for Foundry projects")]
pub struct Args {
    /// Management API base URL, overrides the config file
    #[arg(short, long)]
    pub endpoint: Option<String>,

    /// Browse built-in demo data instead of a live API
    #[arg(long)]
    pub demo: bool,

    /// Scope path to open on start (e.g., "subscriptions/s1/accounts/a1/projects/p1")
    #[arg(short, long)]
    pub scope: Option<String>,

    /// Print TLS settings and test the connection, then exit
    #[arg(long)]
    pub diagnose_tls: bool,
}
