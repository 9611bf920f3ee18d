use clap::{Parser, Subcommand, ValueEnum};

#[derive(Debug, Parser)]
#[command(name = "marmotd", about = "Marmot metadata catalog control plane", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start the control plane: scheduler, membership services, reconcilers,
    /// notification aggregator and webhook dispatcher, all in one process.
    Run {
        /// Run against an in-memory store instead of Postgres. For local
        /// development only; state is lost on exit.
        #[arg(long)]
        ephemeral: bool,
    },

    /// Connect to the database and apply schema migrations, then exit.
    Migrate,

    /// Force an immediate reconciliation sweep for one rule kind, then exit.
    ReconcileNow {
        #[arg(long, value_enum)]
        kind: RuleKindArg,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum RuleKindArg {
    DataProduct,
    AssetRule,
}

impl From<RuleKindArg> for marmot_domain::RuleKind {
    fn from(arg: RuleKindArg) -> Self {
        match arg {
            RuleKindArg::DataProduct => marmot_domain::RuleKind::DataProduct,
            RuleKindArg::AssetRule => marmot_domain::RuleKind::AssetRule,
        }
    }
}
