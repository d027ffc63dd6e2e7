use std::collections::HashSet;
use std::env;
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use camino::{Utf8Path, Utf8PathBuf};
use tap::prelude::*;

const APPLICATION_DIR: &str = "ghe-policy-check";

const CONF_FILE_NAME: &str = "ghe-policy-check.json";

const DATA_DIR_ENV: &str = "GHE_POLICY_CHECK_CONFIG_PATH";

#[derive(Debug, Clone)]
pub struct GithubConf {
    /// Base URL of the REST API, `/api/v3` included on GitHub Enterprise
    pub api_url: String,
    pub admin_tokens: Vec<String>,
    pub owner_token: String,
    pub owner_user: String,
    pub webhook_key: String,
}

#[derive(Debug, Clone)]
pub struct PolicyConf {
    pub classifications: Vec<dto::Classification>,
    pub reminder_minutes: i64,
    pub polling_period_minutes: i64,
    pub max_sync_retry: u32,
    pub not_classified_topic: String,
    pub non_compliant_topic: String,
}

impl PolicyConf {
    pub fn polling_period(&self) -> Duration {
        Duration::from_secs(self.polling_period_minutes.unsigned_abs() * 60)
    }

    /// Number of records to visit per polling round so that all of them are seen once per reminder period.
    pub fn polling_chunk(&self, total: u64) -> u64 {
        let rounds = (self.reminder_minutes / self.polling_period_minutes).max(1).unsigned_abs();
        total.div_ceil(rounds)
    }

    pub fn is_classification(&self, topic: &str) -> bool {
        self.classifications.iter().any(|c| c.value() == topic)
    }
}

#[derive(Debug, Clone)]
pub struct Conf {
    pub listener: SocketAddr,
    pub database_file: Utf8PathBuf,
    pub job_queue_database: Utf8PathBuf,
    pub log_file: Utf8PathBuf,
    pub verbosity_profile: dto::VerbosityProfile,
    pub api_token: Option<String>,
    pub github: GithubConf,
    pub policy: PolicyConf,
    pub debug: dto::DebugConf,
}

impl Conf {
    pub fn from_conf_file(conf_file: &dto::ConfFile) -> anyhow::Result<Self> {
        let data_dir = get_data_dir();

        let admin_tokens = conf_file
            .github_admin_tokens
            .clone()
            .unwrap_or_default()
            .into_iter()
            .filter(|token| !token.is_empty())
            .collect::<Vec<_>>();

        if admin_tokens.is_empty() {
            anyhow::bail!("at least one GitHub admin token is required (GithubAdminTokens)");
        }

        let api_url = conf_file
            .github_api_url
            .clone()
            .context("GitHub API URL is missing (GithubApiUrl)")?;

        let owner_token = conf_file
            .github_owner_token
            .clone()
            .context("GitHub owner token is missing (GithubOwnerToken)")?;

        let owner_user = conf_file
            .github_owner_user
            .clone()
            .context("GitHub owner user is missing (GithubOwnerUser)")?;

        let webhook_key = conf_file
            .github_webhook_key
            .clone()
            .context("GitHub webhook key is missing (GithubWebhookKey)")?;

        let polling_period_minutes = conf_file
            .polling_period_minutes
            .unwrap_or(dto::DEFAULT_POLLING_PERIOD_MINUTES);

        if polling_period_minutes <= 0 {
            anyhow::bail!("PollingPeriodMinutes must be positive");
        }

        let reminder_minutes = conf_file.reminder_minutes.unwrap_or(dto::DEFAULT_REMINDER_MINUTES);

        if reminder_minutes < polling_period_minutes {
            anyhow::bail!("ReminderMinutes ({reminder_minutes}) can't be shorter than PollingPeriodMinutes ({polling_period_minutes})");
        }

        let classifications = conf_file.classifications.clone().unwrap_or_default();

        let mut seen = HashSet::new();
        for classification in &classifications {
            if !seen.insert(classification.value()) {
                anyhow::bail!("duplicated classification value: {}", classification.value());
            }
        }

        let database_file = conf_file
            .database_file
            .clone()
            .unwrap_or_else(|| Utf8PathBuf::from("ghe-policy-check.db"))
            .pipe_ref(|path| normalize_data_path(path, &data_dir));

        let job_queue_database = conf_file
            .job_queue_database
            .clone()
            .unwrap_or_else(|| Utf8PathBuf::from("job_queue.db"))
            .pipe_ref(|path| normalize_data_path(path, &data_dir));

        let log_file = conf_file
            .log_file
            .clone()
            .unwrap_or_else(|| Utf8PathBuf::from("ghe-policy-check"))
            .pipe_ref(|path| normalize_data_path(path, &data_dir));

        Ok(Conf {
            listener: conf_file.listener.unwrap_or(dto::DEFAULT_LISTENER),
            database_file,
            job_queue_database,
            log_file,
            verbosity_profile: conf_file.verbosity_profile.unwrap_or_default(),
            api_token: conf_file.api_token.clone().filter(|token| !token.is_empty()),
            github: GithubConf {
                api_url,
                admin_tokens,
                owner_token,
                owner_user,
                webhook_key,
            },
            policy: PolicyConf {
                classifications,
                reminder_minutes,
                polling_period_minutes,
                max_sync_retry: conf_file.max_sync_retry.unwrap_or(dto::DEFAULT_MAX_SYNC_RETRY),
                not_classified_topic: conf_file
                    .not_classified_topic
                    .clone()
                    .unwrap_or_else(|| dto::DEFAULT_NOT_CLASSIFIED_TOPIC.to_owned()),
                non_compliant_topic: conf_file
                    .non_compliant_topic
                    .clone()
                    .unwrap_or_else(|| dto::DEFAULT_NON_COMPLIANT_TOPIC.to_owned()),
            },
            debug: conf_file.debug.clone().unwrap_or_default(),
        })
    }
}

/// Configuration Handle, source of truth for current configuration state
#[derive(Clone)]
pub struct ConfHandle {
    inner: Arc<ConfHandleInner>,
}

struct ConfHandleInner {
    conf: parking_lot::RwLock<Arc<Conf>>,
    conf_file: parking_lot::RwLock<Arc<dto::ConfFile>>,
}

impl ConfHandle {
    /// Initializes configuration for this instance.
    ///
    /// It's best to call this only once to avoid inconsistencies.
    pub fn init() -> anyhow::Result<Self> {
        let mut conf_file = load_conf_file_or_generate_new()?;
        apply_env_overrides(&mut conf_file, |key| env::var(key).ok()).context("invalid environment override")?;
        Self::from_conf_file(conf_file)
    }

    pub fn from_conf_file(conf_file: dto::ConfFile) -> anyhow::Result<Self> {
        let conf = Conf::from_conf_file(&conf_file).context("invalid configuration file")?;

        Ok(Self {
            inner: Arc::new(ConfHandleInner {
                conf: parking_lot::RwLock::new(Arc::new(conf)),
                conf_file: parking_lot::RwLock::new(Arc::new(conf_file)),
            }),
        })
    }

    /// Builds a handle from a JSON document, without touching the disk nor the environment.
    pub fn mock(json_config: &str) -> anyhow::Result<Self> {
        let conf_file = serde_json::from_str::<dto::ConfFile>(json_config).context("invalid JSON config")?;
        Self::from_conf_file(conf_file)
    }

    /// Returns current configuration state (do not hold it forever as it may become outdated)
    pub fn get_conf(&self) -> Arc<Conf> {
        self.inner.conf.read().clone()
    }

    /// Returns current configuration file state (do not hold it forever as it may become outdated)
    pub fn get_conf_file(&self) -> Arc<dto::ConfFile> {
        self.inner.conf_file.read().clone()
    }
}

/// Overrides file values with the settings found in the environment.
///
/// Keys are the upper-case setting names. `GITHUB_ADMIN_TOKENS` is comma separated and
/// `CLASSIFICATIONS` is a JSON array.
pub fn apply_env_overrides(
    conf_file: &mut dto::ConfFile,
    lookup: impl Fn(&str) -> Option<String>,
) -> anyhow::Result<()> {
    fn parse<T: core::str::FromStr>(key: &str, value: &str) -> anyhow::Result<T>
    where
        T::Err: std::error::Error + Send + Sync + 'static,
    {
        value.trim().parse().with_context(|| format!("invalid value for {key}"))
    }

    if let Some(value) = lookup("GITHUB_OWNER_TOKEN") {
        conf_file.github_owner_token = Some(value);
    }

    if let Some(value) = lookup("GITHUB_OWNER_USER") {
        conf_file.github_owner_user = Some(value);
    }

    if let Some(value) = lookup("GITHUB_WEBHOOK_KEY") {
        conf_file.github_webhook_key = Some(value);
    }

    if let Some(value) = lookup("GITHUB_ADMIN_TOKENS") {
        let tokens = value
            .split(',')
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(str::to_owned)
            .collect();
        conf_file.github_admin_tokens = Some(tokens);
    }

    if let Some(value) = lookup("GITHUB_API_URL") {
        conf_file.github_api_url = Some(value);
    }

    if let Some(value) = lookup("CLASSIFICATIONS") {
        let classifications = serde_json::from_str(&value).context("invalid value for CLASSIFICATIONS")?;
        conf_file.classifications = Some(classifications);
    }

    if let Some(value) = lookup("REMINDER_MINUTES") {
        conf_file.reminder_minutes = Some(parse("REMINDER_MINUTES", &value)?);
    }

    if let Some(value) = lookup("POLLING_PERIOD_MINUTES") {
        conf_file.polling_period_minutes = Some(parse("POLLING_PERIOD_MINUTES", &value)?);
    }

    if let Some(value) = lookup("MAX_SYNC_RETRY") {
        conf_file.max_sync_retry = Some(parse("MAX_SYNC_RETRY", &value)?);
    }

    if let Some(value) = lookup("NOT_CLASSIFIED_TOPIC") {
        conf_file.not_classified_topic = Some(value);
    }

    if let Some(value) = lookup("NON_COMPLIANT_TOPIC") {
        conf_file.non_compliant_topic = Some(value);
    }

    Ok(())
}

fn save_config(conf: &dto::ConfFile) -> anyhow::Result<()> {
    let conf_file_path = get_conf_file_path();
    let json = serde_json::to_string_pretty(conf).context("failed JSON serialization of configuration")?;
    std::fs::write(&conf_file_path, json).with_context(|| format!("failed to write file at {conf_file_path}"))?;
    Ok(())
}

pub fn get_data_dir() -> Utf8PathBuf {
    if let Ok(config_path_env) = env::var(DATA_DIR_ENV) {
        Utf8PathBuf::from(config_path_env)
    } else {
        let mut config_path = Utf8PathBuf::new();

        if cfg!(target_os = "windows") {
            let program_data = env::var("ProgramData").unwrap_or_else(|_| "C:\\ProgramData".to_owned());
            config_path.push(program_data);
            config_path.push(APPLICATION_DIR);
        } else if cfg!(target_os = "macos") {
            config_path.push("/Library/Application Support");
            config_path.push(APPLICATION_DIR);
        } else {
            config_path.push("/etc");
            config_path.push(APPLICATION_DIR);
        }

        config_path
    }
}

fn get_conf_file_path() -> Utf8PathBuf {
    get_data_dir().join(CONF_FILE_NAME)
}

fn normalize_data_path(path: &Utf8Path, data_dir: &Utf8Path) -> Utf8PathBuf {
    if path.is_absolute() {
        path.to_owned()
    } else {
        data_dir.join(path)
    }
}

fn load_conf_file(conf_path: &Utf8Path) -> anyhow::Result<Option<dto::ConfFile>> {
    match File::open(conf_path) {
        Ok(file) => BufReader::new(file)
            .pipe(serde_json::from_reader)
            .map(Some)
            .with_context(|| format!("invalid config file at {conf_path}")),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(anyhow::anyhow!(e).context(format!("couldn't open config file at {conf_path}"))),
    }
}

#[allow(clippy::print_stdout)] // The logger is not initialized yet.
pub fn load_conf_file_or_generate_new() -> anyhow::Result<dto::ConfFile> {
    let conf_file_path = get_conf_file_path();

    let conf_file = match load_conf_file(&conf_file_path).context("failed to load configuration")? {
        Some(conf_file) => conf_file,
        None => {
            let defaults = dto::ConfFile::generate_new();
            println!("Write default configuration to disk…");
            save_config(&defaults).context("failed to save configuration")?;
            defaults
        }
    };

    Ok(conf_file)
}

pub mod dto {
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    use camino::Utf8PathBuf;
    use serde::{Deserialize, Serialize};

    pub const DEFAULT_LISTENER: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 8000);
    pub const DEFAULT_REMINDER_MINUTES: i64 = 60 * 24 * 7;
    pub const DEFAULT_POLLING_PERIOD_MINUTES: i64 = 60;
    pub const DEFAULT_MAX_SYNC_RETRY: u32 = 3;
    pub const DEFAULT_NOT_CLASSIFIED_TOPIC: &str = "not-classified";
    pub const DEFAULT_NON_COMPLIANT_TOPIC: &str = "non-compliant";

    /// Contents of `ghe-policy-check.json`
    ///
    /// Every key is optional here; defaults and validation are applied when building
    /// [`Conf`](super::Conf). Keys this version doesn't know are kept in `rest` and written back.
    #[derive(PartialEq, Debug, Clone, Serialize, Deserialize)]
    #[serde(rename_all = "PascalCase")]
    pub struct ConfFile {
        /// Socket address of the HTTP listener (webhooks and REST API)
        #[serde(skip_serializing_if = "Option::is_none")]
        pub listener: Option<SocketAddr>,

        //== GitHub instance ==//
        /// Base URL of the GitHub REST API (e.g.: https://github.example.com/api/v3)
        #[serde(skip_serializing_if = "Option::is_none")]
        pub github_api_url: Option<String>,
        /// Site admin tokens, rotated when rate limited
        #[serde(skip_serializing_if = "Option::is_none")]
        pub github_admin_tokens: Option<Vec<String>>,
        /// Site admin token used to list organization admins
        #[serde(skip_serializing_if = "Option::is_none")]
        pub github_owner_token: Option<String>,
        /// Login of the account behind `GithubOwnerToken`
        #[serde(skip_serializing_if = "Option::is_none")]
        pub github_owner_user: Option<String>,
        /// Shared secret used to sign webhook deliveries
        #[serde(skip_serializing_if = "Option::is_none")]
        pub github_webhook_key: Option<String>,

        //== Policy ==//
        #[serde(skip_serializing_if = "Option::is_none")]
        pub classifications: Option<Vec<Classification>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub reminder_minutes: Option<i64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub polling_period_minutes: Option<i64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub max_sync_retry: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub not_classified_topic: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub non_compliant_topic: Option<String>,

        /// Bearer token required by the REST API, when set
        #[serde(skip_serializing_if = "Option::is_none")]
        pub api_token: Option<String>,

        //== Storage ==//
        #[serde(skip_serializing_if = "Option::is_none")]
        pub database_file: Option<Utf8PathBuf>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub job_queue_database: Option<Utf8PathBuf>,

        /// Verbosity profile
        #[serde(skip_serializing_if = "Option::is_none")]
        pub verbosity_profile: Option<VerbosityProfile>,

        /// (Unstable) Folder and prefix for log files
        #[serde(skip_serializing_if = "Option::is_none")]
        pub log_file: Option<Utf8PathBuf>,

        /// (Unstable) Unsafe debug options for developers
        #[serde(default, rename = "__debug__", skip_serializing_if = "Option::is_none")]
        pub debug: Option<DebugConf>,

        /// Other unofficial options.
        /// This field is useful so that we can deserialize
        /// and then losslessly serialize back all root keys of the config file.
        #[serde(flatten)]
        pub rest: serde_json::Map<String, serde_json::Value>,
    }

    impl ConfFile {
        pub fn generate_new() -> Self {
            Self {
                listener: Some(DEFAULT_LISTENER),
                github_api_url: None,
                github_admin_tokens: None,
                github_owner_token: None,
                github_owner_user: None,
                github_webhook_key: None,
                classifications: None,
                reminder_minutes: Some(DEFAULT_REMINDER_MINUTES),
                polling_period_minutes: Some(DEFAULT_POLLING_PERIOD_MINUTES),
                max_sync_retry: None,
                not_classified_topic: Some(DEFAULT_NOT_CLASSIFIED_TOPIC.to_owned()),
                non_compliant_topic: Some(DEFAULT_NON_COMPLIANT_TOPIC.to_owned()),
                api_token: None,
                database_file: None,
                job_queue_database: None,
                verbosity_profile: None,
                log_file: None,
                debug: None,
                rest: serde_json::Map::new(),
            }
        }
    }

    /// A classification a repository can be labelled with, through one of its topics
    ///
    /// Written either as `["Label", "value"]` or as `["attribute", ["value", "Label"]]`.
    #[derive(PartialEq, Eq, Debug, Clone, Serialize, Deserialize)]
    #[serde(untagged)]
    pub enum Classification {
        Plain(String, String),
        Attribute(String, (String, String)),
    }

    impl Classification {
        /// Topic identifying this classification
        pub fn value(&self) -> &str {
            match self {
                Classification::Plain(_, value) => value,
                Classification::Attribute(_, (value, _)) => value,
            }
        }

        pub fn label(&self) -> &str {
            match self {
                Classification::Plain(label, _) => label,
                Classification::Attribute(_, (_, label)) => label,
            }
        }
    }

    /// Verbosity profile (pre-defined tracing directives)
    #[derive(PartialEq, Eq, Debug, Clone, Copy, Serialize, Deserialize, Default)]
    pub enum VerbosityProfile {
        /// The default profile, mostly info records
        #[default]
        Default,
        /// Recommended profile for developers
        Debug,
        /// Show all traces
        All,
        /// Only show warnings and errors
        Quiet,
    }

    impl VerbosityProfile {
        pub fn to_log_filter(self) -> &'static str {
            match self {
                VerbosityProfile::Default => "info",
                VerbosityProfile::Debug => {
                    "info,ghe_policy_check=debug,github_api=debug,policy_store_libsql=debug,job_queue=debug,job_queue_libsql=debug"
                }
                VerbosityProfile::All => "trace",
                VerbosityProfile::Quiet => "warn",
            }
        }
    }

    /// `__debug__` section, for local troubleshooting only
    ///
    /// An absent section leaves polling on and logging at the configured profile.
    #[derive(PartialEq, Eq, Debug, Clone, Serialize, Deserialize)]
    pub struct DebugConf {
        /// Directives string in the same form as the RUST_LOG environment variable
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub log_directives: Option<String>,
        /// Do not start the repository polling and user sync tasks
        #[serde(default)]
        pub disable_polling: bool,
    }

    // Polling stays on unless explicitly disabled.
    #[allow(clippy::derivable_impls)]
    impl Default for DebugConf {
        fn default() -> Self {
            Self {
                log_directives: None,
                disable_polling: false,
            }
        }
    }

    impl DebugConf {
        pub fn is_default(&self) -> bool {
            Self::default().eq(self)
        }
    }
}
