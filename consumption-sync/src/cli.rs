use std::path::PathBuf;

use clap::Parser;

/// Fetch new electricity and gas consumption from Octopus Energy and store it
/// in QuestDB, resuming after the newest point already stored.
#[derive(Debug, Clone, Default, Parser)]
#[command(name = "consumption-sync", version, about)]
pub struct Cli {
    /// TOML config file (default: ./consumption-sync.toml if present)
    #[arg(short, long, env = "CONSUMPTION_SYNC_CONFIG")]
    pub config: Option<PathBuf>,

    /// Turn on debug output
    #[arg(short, long)]
    pub debug: bool,

    /// Dry run: don't actually write anything, but print what would be written
    #[arg(short = 'n', long)]
    pub dry_run: bool,

    /// Octopus API key
    #[arg(short = 'k', long, env = "OCTOPUS_API_KEY", hide_env_values = true)]
    pub octopus_api_key: Option<String>,

    /// MPAN of the electricity meter point
    #[arg(long, env = "ELECTRICITY_MPN")]
    pub electricity_mpn: Option<String>,

    /// Serial of the electricity meter
    #[arg(long, env = "ELECTRICITY_SERIAL")]
    pub electricity_serial: Option<String>,

    /// MPRN of the gas meter point
    #[arg(long, env = "GAS_MPN")]
    pub gas_mpn: Option<String>,

    /// Serial of the gas meter
    #[arg(long, env = "GAS_SERIAL")]
    pub gas_serial: Option<String>,

    /// QuestDB Postgres wire URI, used for watermark queries
    #[arg(long, env = "QUESTDB_URI", hide_env_values = true)]
    pub questdb_uri: Option<String>,

    /// QuestDB ILP TCP address, used for writes
    #[arg(long, env = "QUESTDB_ILP_ADDR")]
    pub questdb_ilp_addr: Option<String>,
}
