use eyre::{Error, Result, WrapErr};
use std::fs;
use std::path::PathBuf;

use super::spec::Spec;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Loader {}

impl Loader {
    #[must_use]
    pub const fn new() -> Self {
        Self {}
    }

    /// Load and validate the configuration from a file
    ///
    /// # Errors
    ///
    /// Will return `Err` if `filename` does not exist, the user does not have
    /// permission to read it, the YAML does not parse, or validation fails.
    pub fn load(&self, filename: &PathBuf) -> Result<Spec, Error> {
        let content =
            fs::read_to_string(filename).context(format!("Can't load filename={filename:?}"))?;
        let spec: Spec =
            serde_yaml::from_str(&content).context(format!("Can't parse config={filename:?}"))?;
        spec.validate()
            .context(format!("Invalid config={filename:?}"))?;
        Ok(spec)
    }
}

impl Default for Loader {
    fn default() -> Self {
        Self::new()
    }
}
