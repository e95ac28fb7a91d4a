use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "roost", version, about = "Ubuntu cloud-image VMs behind a local daemon")]
pub struct Cli {
    /// Path to the daemon config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the daemon in the foreground
    Serve,

    /// Create and start a new instance
    Create {
        /// Image alias, release or image id (default image when omitted)
        image: Option<String>,

        /// Instance name (generated when omitted)
        #[arg(short, long)]
        name: Option<String>,

        /// Number of CPU cores
        #[arg(long)]
        cpus: Option<u32>,

        /// Memory size, e.g. 1G or 512M
        #[arg(long)]
        mem: Option<String>,

        /// Disk size, e.g. 10G
        #[arg(long)]
        disk: Option<String>,
    },

    /// Start a stopped instance
    Start { name: String },

    /// Stop a running instance
    Stop { name: String },

    /// Move an instance to the trash
    Trash { name: String },

    /// Bring an instance back from the trash
    Recover { name: String },

    /// Permanently delete every trashed instance
    EmptyTrash,

    /// Run a command inside an instance
    Exec {
        name: String,

        /// Command and arguments
        #[arg(last = true)]
        args: Vec<String>,
    },

    /// List instances
    List,

    /// Show details of an instance
    Info { name: String },

    /// List the images the daemon can create instances from
    Find,

    /// Show client and daemon versions
    Version,
}
