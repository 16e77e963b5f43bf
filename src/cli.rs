use clap::{Parser, Subcommand};

#[derive(Debug, Subcommand)]
pub enum UserCommands {
    #[command(about = "Create a user and print its API bearer token (shown once)")]
    Create {
        #[arg(long)]
        username: String,
    },
}

#[derive(Debug, Subcommand)]
pub enum ResourceCommands {
    #[command(about = "Save a bookmark for a user, creating referenced tags on demand")]
    Add {
        #[arg(long)]
        user_id: i64,
        #[arg(long)]
        url: String,
        #[arg(long)]
        title: String,
        #[arg(long, default_value = "")]
        digest: String,
        #[arg(long = "tag")]
        tags: Vec<String>,
    },
}

#[derive(Debug, Subcommand)]
pub enum TelemetryCommands {
    #[command(about = "Summarize telemetry events from a JSONL stream")]
    Report {
        #[arg(long)]
        path: Option<String>,
        #[arg(long, default_value_t = 5000)]
        limit: usize,
    },
}

const CLI_EXAMPLES: &str = "Examples:\n\
  linkbox migrate\n\
  linkbox users create --username alice\n\
  linkbox resources add --user-id 1 --url https://doc.rust-lang.org/book/ --title \"The Rust Book\" --tag rust --tag books\n\
  linkbox search --user-id 1 \"show me rust tutorials\"\n\
  linkbox --profile prod serve --host 0.0.0.0 --port 8787\n\
  linkbox telemetry report --limit 2000\n\
\n\
The AI API key is read from the environment variable named by --ai-api-key-env\n\
(default LINKBOX_AI_API_KEY). Without it, selection falls back to keyword matching.";

#[derive(Debug, Parser)]
#[command(name = "linkbox")]
#[command(about = "Bookmark manager with AI-assisted retrieval")]
#[command(after_long_help = CLI_EXAMPLES)]
pub struct Cli {
    #[arg(long, env = "LINKBOX_PROFILE", default_value = "default")]
    pub profile: String,

    #[arg(long, env = "LINKBOX_CONFIG", default_value = ".linkbox/config.toml")]
    pub config_path: String,

    #[arg(long, env = "LINKBOX_APP_NAME")]
    pub app_name: Option<String>,

    #[arg(long, env = "LINKBOX_DB_URL")]
    pub db_url: Option<String>,

    #[arg(long, env = "LINKBOX_AI_BASE_URL")]
    pub ai_base_url: Option<String>,

    #[arg(long, env = "LINKBOX_AI_MODEL")]
    pub ai_model: Option<String>,

    #[arg(long, env = "LINKBOX_AI_API_KEY_ENV")]
    pub ai_api_key_env: Option<String>,

    #[arg(long, env = "LINKBOX_ORACLE_TIMEOUT_SECS")]
    pub oracle_timeout_secs: Option<u64>,

    #[arg(long, env = "LINKBOX_TAG_PAGE_SIZE")]
    pub tag_page_size: Option<u32>,

    #[arg(long, env = "LINKBOX_PROGRESS_POLL_INTERVAL_MS")]
    pub progress_poll_interval_ms: Option<u64>,

    #[arg(long, env = "LINKBOX_PROGRESS_IDLE_POLLS")]
    pub progress_idle_polls: Option<u32>,

    #[arg(long, env = "LINKBOX_AGENT_MAX_ITERATIONS")]
    pub agent_max_iterations: Option<u32>,

    #[arg(long, env = "LINKBOX_SEARCH_RESULT_LIMIT")]
    pub search_result_limit: Option<usize>,

    #[arg(long, env = "LINKBOX_PREVIEW_MAX_CHARS")]
    pub preview_max_chars: Option<usize>,

    #[arg(long, env = "LINKBOX_READER_BASE_URL")]
    pub reader_base_url: Option<String>,

    #[arg(long, env = "LINKBOX_READER_TIMEOUT_SECS")]
    pub reader_timeout_secs: Option<u64>,

    #[arg(long, env = "LINKBOX_TELEMETRY_ENABLED", action = clap::ArgAction::Set)]
    pub telemetry_enabled: Option<bool>,

    #[arg(long, env = "LINKBOX_TELEMETRY_PATH")]
    pub telemetry_path: Option<String>,

    #[arg(long, env = "LINKBOX_SHOW_SENSITIVE_CONFIG", default_value_t = false)]
    pub show_sensitive_config: bool,

    #[arg(long, env = "RUST_LOG", default_value = "warn")]
    pub log_filter: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    #[command(about = "Run the HTTP server (health, agent chat stream, search)")]
    Serve {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        #[arg(long, default_value_t = 8787)]
        port: u16,
    },
    #[command(about = "Create or upgrade the bookmark database schema")]
    Migrate,
    #[command(about = "Manage users")]
    Users {
        #[command(subcommand)]
        command: UserCommands,
    },
    #[command(about = "Manage saved resources")]
    Resources {
        #[command(subcommand)]
        command: ResourceCommands,
    },
    #[command(about = "Run the two-stage AI resource search once and print the matches")]
    Search {
        #[arg(long)]
        user_id: i64,
        #[arg(required = true)]
        query: Vec<String>,
    },
    #[command(about = "Telemetry utilities and reporting")]
    Telemetry {
        #[command(subcommand)]
        command: TelemetryCommands,
    },
}

pub fn command_label(command: &Commands) -> String {
    match command {
        Commands::Serve { .. } => "serve".to_string(),
        Commands::Migrate => "migrate".to_string(),
        Commands::Users { command } => match command {
            UserCommands::Create { .. } => "users.create".to_string(),
        },
        Commands::Resources { command } => match command {
            ResourceCommands::Add { .. } => "resources.add".to_string(),
        },
        Commands::Search { .. } => "search".to_string(),
        Commands::Telemetry { command } => match command {
            TelemetryCommands::Report { .. } => "telemetry.report".to_string(),
        },
    }
}
