//! CLI command definitions.

use std::path::PathBuf;

use clap::{Subcommand, ValueEnum};

#[derive(Subcommand)]
pub enum Commands {
    /// Run the scheduler service
    Serve {
        /// Path to a YAML configuration file
        #[arg(short, long, env = "BUILDQ_CONFIG")]
        config: Option<PathBuf>,
    },

    /// List builds known to the scheduler
    Builds {
        /// Include the tasks of each build
        #[arg(short, long)]
        tasks: bool,
    },

    /// List connected workers
    Workers,

    /// Cancel a build
    Cancel {
        /// Build ID
        build_id: String,
    },

    /// Trigger an immediate scheduling pass
    Reschedule,

    /// Print the log of a task instance
    Logs {
        /// Task instance ID
        instance: String,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
    Yaml,
}
