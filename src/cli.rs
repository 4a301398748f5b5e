use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "tracedock")]
#[command(about = "Action tracing and stack orchestration toolkit")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Display application version
    Version,

    /// Check container runtime connectivity
    Check,

    /// Run the example traced service
    Serve {
        #[arg(long, default_value = "0.0.0.0:8080")]
        addr: String,
        /// Postgres connection string; omit to trace into memory
        #[arg(long)]
        database_url: Option<String>,
        /// Upload payloads to S3 instead of memory
        #[arg(long)]
        s3: bool,
        #[arg(long, default_value = "traces")]
        bucket: String,
        #[arg(long, default_value = "tracedock-demo")]
        service_id: String,
    },

    /// Validate and deploy multi-container stacks
    Stack {
        #[command(subcommand)]
        action: StackAction,
    },

    /// GDPR operations against the trace store
    Gdpr {
        #[command(subcommand)]
        action: GdprAction,
    },

    /// Delete trace records past their retention deadline
    Sweep {
        #[arg(long)]
        database_url: String,
    },
}

#[derive(Subcommand)]
pub enum StackAction {
    /// Parse and validate a stack definition file
    Validate { file: String },

    /// Deploy a stack with production naming and fixed ports
    Deploy { file: String },

    /// Stop a deployed stack in reverse position order
    Stop { name: String },

    /// Force-remove a stack's containers (network preserved)
    Remove {
        name: String,
        /// Also remove the stack's named volumes
        #[arg(long)]
        volumes: bool,
    },
}

#[derive(Subcommand)]
pub enum GdprAction {
    /// Erase every trace for a data subject or workflow (Art. 17)
    Erase {
        #[arg(long)]
        database_url: String,
        #[arg(long)]
        subject: Option<String>,
        #[arg(long)]
        correlation: Option<String>,
        /// Also delete the returned payload objects from S3
        #[arg(long)]
        delete_objects: bool,
        #[arg(long, default_value = "cli")]
        user: String,
    },

    /// Export every record for a data subject as JSON (Art. 20)
    Export {
        #[arg(long)]
        database_url: String,
        #[arg(long)]
        subject: String,
        #[arg(long, default_value = "cli")]
        user: String,
    },

    /// Replace a subject id with a stable pseudonym
    Pseudonymize {
        #[arg(long)]
        database_url: String,
        #[arg(long)]
        subject: String,
        #[arg(long, default_value = "cli")]
        user: String,
    },
}
