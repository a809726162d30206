use clap::Parser;

/// Anomaly sync service CLI arguments
#[derive(Debug, Parser)]
#[command(
    name = "anomaly-sync",
    version,
    about = "Keeps a local anomaly store in sync and serves aggregated views"
)]
pub struct Cli {
    /// SQLite database URL
    #[arg(long)]
    pub database_url: Option<String>,

    /// Base URL of the remote analytics API
    #[arg(long)]
    pub remote_url: Option<String>,

    /// Sync interval in seconds
    #[arg(long)]
    pub sync_interval: Option<u64>,

    /// Port for the HTTP query API
    #[arg(long)]
    pub port: Option<u16>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_are_optional() {
        let cli = Cli::parse_from(["anomaly-sync"]);
        assert!(cli.database_url.is_none());
        assert!(cli.port.is_none());
    }

    #[test]
    fn flags_parse() {
        let cli = Cli::parse_from([
            "anomaly-sync",
            "--remote-url",
            "http://remote",
            "--sync-interval",
            "60",
            "--port",
            "9000",
        ]);
        assert_eq!(cli.remote_url.as_deref(), Some("http://remote"));
        assert_eq!(cli.sync_interval, Some(60));
        assert_eq!(cli.port, Some(9000));
    }
}
