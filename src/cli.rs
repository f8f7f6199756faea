use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "tekton-pruner-gc")]
#[command(about = "Garbage-collects completed Tekton PipelineRuns and TaskRuns")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Display application version
    Version,

    /// Check cluster connectivity and permissions
    Check,

    /// Manage the PrunerConfig CRD
    Crd {
        #[command(subcommand)]
        action: CrdAction,
    },

    /// Start the pruner's reconcile loop, config watchers and metrics server
    Run,
}

#[derive(Subcommand)]
pub enum CrdAction {
    /// Print the CRD YAML to stdout
    Generate,

    /// Install the CRD into the connected cluster
    Install,
}
