//! guest agent runtime configs

pub mod cli {
    //! Parse from either cli or env var

    /// Default metadata server base URL
    pub static DEFAULT_METADATA_URL: &str = "http://169.254.169.254/computeMetadata/v1/";
    /// the default path to config
    pub static DEFAULT_CONFIG_PATH: &str = "/etc/guest-agent/config.yaml";
    /// tokio worker thread name
    pub static DEFAULT_THREAD_NAME: &str = "guest-agent-worker";
    /// default log level. Can use this argument or AGENT_LOG env var
    pub const DEFAULT_AGENT_LOG: &str = "info";

    use std::path::PathBuf;

    pub use clap::Parser;

    #[derive(Parser, Debug, Clone, PartialEq, Eq)]
    #[clap(author, name = "guest-agent", bin_name = "guest-agent", about, long_about = None)]
    /// parses from cli & environment var. the agent will load `.env` in the same dir as the
    /// binary as well
    pub struct Config {
        /// path to the agent's config
        #[clap(
            short,
            long,
            value_parser,
            env,
            default_value = DEFAULT_CONFIG_PATH
        )]
        pub config_path: PathBuf,
        /// base URL of the instance metadata service
        #[clap(long, env, value_parser, default_value = DEFAULT_METADATA_URL)]
        pub metadata_url: String,
        /// Worker thread name
        #[clap(long, env, value_parser, default_value = DEFAULT_THREAD_NAME)]
        pub thread_name: String,
        /// number of runtime worker threads, default is num logical CPUs
        #[clap(long, env, value_parser)]
        pub threads: Option<usize>,
        /// set the log level. All valid RUST_LOG arguments are accepted
        #[clap(long, env, value_parser, default_value = DEFAULT_AGENT_LOG)]
        pub agent_log: String,
    }
}

pub mod trace {
    //! tracing configuration
    use anyhow::Result;
    use tracing_subscriber::{
        filter::EnvFilter,
        fmt::{
            self,
            format::{Format, PrettyFields},
        },
        prelude::__tracing_subscriber_SubscriberExt,
        util::SubscriberInitExt,
    };

    use std::env;

    /// log as "json" or "standard" (unstructured)
    static DEFAULT_LOG_FORMAT: &str = "standard";

    /// Configuration for log output
    #[derive(Debug)]
    pub struct Config {
        /// formatting to apply to logs
        pub log_frmt: String,
    }

    impl Config {
        /// Make new trace config
        pub fn parse(agent_log: &str) -> Result<Self> {
            let log_frmt =
                env::var("LOG_FORMAT").unwrap_or_else(|_| DEFAULT_LOG_FORMAT.to_owned());

            // Log level comes from AGENT_LOG
            let filter = EnvFilter::try_new(agent_log)
                .or_else(|_| EnvFilter::try_new("info"))?
                .add_directive("hyper=off".parse()?)
                .add_directive("reqwest=off".parse()?);

            match &log_frmt[..] {
                "json" => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(fmt::layer().json())
                        .init();
                }
                "pretty" => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(
                            fmt::layer()
                                .event_format(
                                    Format::default().pretty().with_source_location(false),
                                )
                                .fmt_fields(PrettyFields::new()),
                        )
                        .init();
                }
                _ => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(fmt::layer())
                        .init();
                }
            }

            Ok(Self { log_frmt })
        }
    }
}
