fn default_parallelism_per_rpc() -> usize {
    5
}

fn default_max_open_conns() -> u64 {
    10
}

#[derive(Deserialize, Debug, Clone)]
pub struct Config {
    pub database_url: String,
    #[serde(default = "default_parallelism_per_rpc")]
    pub parallelism_per_rpc: usize,
    #[serde(default)]
    pub delete_unused_challenges: bool,
    #[serde(default = "default_max_open_conns")]
    pub max_open_conns: u64,
}

/// Behavioural switches handed to the storage authority at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaOptions {
    /// Maximum number of per-name counts run at once by
    /// `count_certificates_by_names`. Must be at least one.
    pub parallelism_per_rpc: usize,
    /// Drop the challenges that were not attempted when an authorization is
    /// finalized.
    pub delete_unused_challenges: bool,
}

impl Default for SaOptions {
    fn default() -> Self {
        SaOptions {
            parallelism_per_rpc: default_parallelism_per_rpc(),
            delete_unused_challenges: false,
        }
    }
}

impl Config {
    /// Reads `config.toml` (optional) and `SA_*` environment variables.
    pub fn load() -> Result<Config, String> {
        let env = ::config::Environment::with_prefix("SA")
            .prefix_separator("_")
            .keep_prefix(false);
        let file = ::config::File::new("config.toml", ::config::FileFormat::Toml)
            .required(false);
        let config = ::config::Config::builder()
            .add_source(file)
            .add_source(env)
            .build()
            .map_err(|e| format!("failed to get config: {}", e))?;

        let config: Config = config.try_deserialize()
            .map_err(|e| format!("failed to parse config: {}", e))?;
        config.sa_options()?;
        Ok(config)
    }

    pub fn sa_options(&self) -> Result<SaOptions, String> {
        if self.parallelism_per_rpc < 1 {
            return Err("parallelism_per_rpc must be at least 1".to_string());
        }
        Ok(SaOptions {
            parallelism_per_rpc: self.parallelism_per_rpc,
            delete_unused_challenges: self.delete_unused_challenges,
        })
    }
}
