use anyhow::Result;
use clap::{Args, Subcommand};
use serde_json::json;
use std::path::PathBuf;
use tollgate_core::config;
use tollgate_policy::PolicyGate;

use super::util::{load_config, print_json, GlobalArgs};

#[derive(Subcommand)]
pub enum ConfigCmd {
    /// Print the configuration JSON schema
    Schema,
    /// Print the effective configuration after env overrides
    Show,
    /// Validate a config file, reporting every violation
    Check(CheckArgs),
}

#[derive(Args)]
pub struct CheckArgs {
    /// Config file to validate
    path: PathBuf,
}

pub fn execute(global: &GlobalArgs, cmd: ConfigCmd) -> Result<()> {
    match cmd {
        ConfigCmd::Schema => print_json(&config::config_schema_json(), global.pretty),
        ConfigCmd::Show => {
            let cfg = load_config(global)?;
            let gate = PolicyGate::new(cfg.policy.clone())?;
            print_json(
                &json!({
                    "config": cfg,
                    "policy": gate.snapshot(),
                    "write_token_present": config::write_token_present(),
                }),
                global.pretty,
            )
        }
        ConfigCmd::Check(args) => {
            let cfg = config::load_config(&args.path)?;
            PolicyGate::new(cfg.policy.clone())?;
            cfg.adapters.kinds()?;
            println!("ok: {}", args.path.display());
            Ok(())
        }
    }
}
