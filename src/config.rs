use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::device::Variant;
use crate::error::{BandError, Result};
use crate::output::{DEFAULT_CSV_OUTPUT, DEFAULT_FILE_OUTPUT, DEFAULT_OSC_TARGET};

pub const SIMULATED_ADDRESS: &str = "C8:0F:10:00:00:00";
const SIMULATED_NAME: &str = "Mi Band (simulated)";

#[derive(Parser, Debug, Clone)]
#[command(name = "bandpulse", version, about = "Live heart rate from a Mi Band, over files and OSC", long_about = None)]
pub struct Config {
    /// Address or advertised name of the band
    #[arg(short, long, required_unless_present = "simulate")]
    pub device: Option<String>,

    /// Band generation. 4 and 5 need --auth-key
    #[arg(short, long, default_value_t = 3, value_parser = clap::value_parser!(u8).range(2..=5))]
    pub band_version: u8,

    /// 32 hex characters, as paired with the phone app
    #[arg(short, long)]
    pub auth_key: Option<String>,

    /// Keep measuring instead of taking a single reading
    #[arg(short, long)]
    pub continuous: bool,

    /// Write the latest heart rate to a file
    #[arg(long, num_args = 0..=1, default_missing_value = DEFAULT_FILE_OUTPUT)]
    pub file_output: Option<PathBuf>,

    /// Append every heart rate to a CSV file
    #[arg(long, num_args = 0..=1, default_missing_value = DEFAULT_CSV_OUTPUT)]
    pub csv_output: Option<PathBuf>,

    /// Send heart rate and a synthetic pulse over OSC
    #[arg(long)]
    pub osc: bool,

    /// Address of the OSC receiver
    #[arg(long, default_value = DEFAULT_OSC_TARGET)]
    pub osc_target: SocketAddr,

    /// Reconnect after the band drops the connection
    #[arg(short, long)]
    pub reconnect: bool,

    /// Seconds to scan for the band before giving up
    #[arg(long, default_value_t = 15)]
    pub scan_timeout: u64,

    /// Use a simulated band instead of bluetooth
    #[arg(long)]
    pub simulate: bool,
}

impl Config {
    /// Validates the band version and key. Nothing has touched the radio yet
    /// when this fails.
    pub fn variant(&self) -> Result<Variant> {
        Variant::for_band_version(self.band_version, self.auth_key.as_deref())
    }

    pub fn device_address(&self) -> Result<String> {
        match (&self.device, self.simulate) {
            (Some(device), _) => Ok(device.clone()),
            (None, true) => Ok(SIMULATED_ADDRESS.to_string()),
            (None, false) => Err(BandError::Configuration("no device given".to_string())),
        }
    }

    pub fn simulated_name(&self) -> &'static str {
        SIMULATED_NAME
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_timeout)
    }
}
