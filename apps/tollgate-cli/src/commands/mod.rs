pub mod audit;
pub mod changeset;
pub mod config;
pub mod run;
pub mod util;
pub mod worker;

pub use audit::AuditArgs;
pub use changeset::ChangesetCmd;
pub use config::ConfigCmd;
pub use run::RunCmd;
pub use util::GlobalArgs;
pub use worker::WorkerArgs;
