use std::fs::File;
use std::io::Read;
use std::path::Path;

use serde::Deserialize;

use stowage_driver::DriverConfig;

#[derive(Clone, Deserialize)]
pub struct Config {
    pub objects: stowage_objectstore::Config,
    #[serde(default)]
    pub driver: DriverConfig,
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let mut f = File::open(path)?;
        let mut s = String::new();
        f.read_to_string(&mut s)?;
        Ok(serde_yaml::from_str(&s)?)
    }
}
