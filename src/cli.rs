use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "aihub")]
#[command(about = "Plugin and model registry for the AI admin platform", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the admin API server (default if no command given)
    Serve {
        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Manage installed plugins
    Plugin {
        #[command(subcommand)]
        command: PluginCommand,
    },
    /// List registered capabilities
    Capabilities {
        /// Only show capabilities of this type (model, tool, workflow-node)
        #[arg(short = 't', long = "type")]
        kind: Option<String>,
    },
    /// Invoke a capability once and print its output
    Invoke {
        /// Capability name
        capability: String,
        /// JSON input passed to the plugin
        #[arg(short, long, default_value = "{}")]
        input: String,
    },
}

#[derive(Subcommand, Debug, Clone)]
pub enum PluginCommand {
    /// List installed plugins
    List {
        /// Only show plugins of this type (model-provider, tool, workflow-extension)
        #[arg(short = 't', long = "type")]
        plugin_type: Option<String>,
    },
    /// Show details of one plugin
    Info {
        id: String,
        /// Locale used for the description
        #[arg(short, long)]
        locale: Option<String>,
    },
    /// Install a plugin from a path or URL
    Install {
        /// Local directory, package file, or http(s) URL
        locator: String,
    },
    /// Replace an installed plugin with a newer package
    Update { id: String, locator: String },
    /// Enable a plugin and publish its capabilities
    Enable { id: String },
    /// Disable a plugin and withdraw its capabilities
    Disable { id: String },
    /// Remove a plugin and its staged package
    Uninstall { id: String },
}
