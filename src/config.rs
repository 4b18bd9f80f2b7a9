//! Panel-wide settings resolved once at startup.

use crate::launcher::{build_command, validate_request, RequestError};
use crate::model::{ApiKeys, ExperimentRequest, RunConfig};
use rand::RngCore;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct PanelConfig {
    pub python: String,
    pub workdir: PathBuf,
    pub data_root: PathBuf,
    pub output_root: PathBuf,
    pub run_timeout: Option<Duration>,
    /// Keys supplied on the command line or environment; surfaces may override per session.
    pub default_keys: ApiKeys,
}

/// Generate a short random run id.
pub fn gen_run_id() -> String {
    let mut b = [0u8; 6];
    rand::thread_rng().fill_bytes(&mut b);
    b.iter().map(|x| format!("{x:02x}")).collect()
}

impl PanelConfig {
    /// Validate a form submission and bind it to this panel's paths.
    pub fn run_config(
        &self,
        request: ExperimentRequest,
        keys: &ApiKeys,
    ) -> Result<RunConfig, RequestError> {
        validate_request(&request, keys)?;
        Ok(self.bind(gen_run_id(), request, keys))
    }

    /// The command line a launch would run, without allocating a run id.
    pub fn preview_command(
        &self,
        request: ExperimentRequest,
        keys: &ApiKeys,
    ) -> Result<String, RequestError> {
        validate_request(&request, keys)?;
        Ok(build_command(&self.bind(String::new(), request, keys)).display())
    }

    fn bind(&self, run_id: String, request: ExperimentRequest, keys: &ApiKeys) -> RunConfig {
        RunConfig {
            run_id,
            request,
            python: self.python.clone(),
            workdir: self.workdir.clone(),
            data_root: self.data_root.clone(),
            output_root: self.output_root.clone(),
            keys: keys.clone(),
            timeout: self.run_timeout,
        }
    }
}
