//! Service configuration from environment variables.
//!
//! | Variable | Default | Meaning |
//! |----------|---------|---------|
//! | `RPC_URL` | required | Solana JSON-RPC endpoint |
//! | `SECRET_KEY_JSON` | required | admin keypair, 64-byte JSON array |
//! | `ADMIN_PUBLIC_KEY` | keypair pubkey | deposit address contributions must pay |
//! | `RAPIDPOT_HTTP_ADDR` | `0.0.0.0:$PORT` | listen address |
//! | `PORT` | `3000` | listen port when no address is given |
//! | `RAPIDPOT_STATE_PATH` | `db.json` | ledger document |
//! | `RAPIDPOT_POTS_FILE` | built-in pots | JSON array of pot configs |
//! | `ADMIN_TOKEN` | unset (admin routes disabled) | bearer token for admin routes |
//! | `VERIFY_MAX_ATTEMPTS` / `VERIFY_RETRY_DELAY_MS` | `5` / `1000` | verification retry policy |
//! | `PAYOUT_CONFIRM_ATTEMPTS` / `PAYOUT_CONFIRM_DELAY_MS` | `30` / `2000` | settlement polling |
//! | `RPC_TIMEOUT_MS` | `10000` | per-request RPC timeout |
//! | `BOOST_MINT` / `BOOST_MIN_BALANCE` | unset / `1` | boost token and threshold |
//! | `BOOST_MULTIPLIER_BPS` | `13000` | boost multiplier |
//! | `RAPIDPOT_LOG` | `info` | tracing filter |
//!
//! Values can come from a dotenv file: `RAPIDPOT_ENV_FILE`, else `.env`.

use std::env;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

use rapidpot_common::{default_pots, validate_pots, PotConfig};

use crate::engine::{BoostPolicy, EngineSettings};
use crate::ledger::DEFAULT_BOOST_BPS;
use crate::retry::RetryPolicy;
use crate::solana::{is_valid_address, KeypairError, PayoutKeypair};

const DEFAULT_PORT: u16 = 3000;
const DEFAULT_STATE_PATH: &str = "db.json";
const DEFAULT_RPC_TIMEOUT_MS: u64 = 10_000;
/// Slack on top of the RPC budget of a draw, for state writes.
const DRAW_DRAIN_MARGIN: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} environment variable not set")]
    Missing(&'static str),

    #[error("{key} is invalid: {reason}")]
    Invalid { key: &'static str, reason: String },

    #[error("SECRET_KEY_JSON: {0}")]
    Keypair(#[from] KeypairError),

    #[error("pots file {path}: {reason}")]
    PotsFile { path: String, reason: String },
}

pub struct ServiceConfig {
    pub rpc_url: String,
    secret_key_json: String,
    pub admin_address: String,
    pub http_addr: SocketAddr,
    pub state_path: PathBuf,
    pub pots: Vec<PotConfig>,
    pub admin_token: Option<String>,
    pub verify_policy: RetryPolicy,
    pub confirm_policy: RetryPolicy,
    pub rpc_timeout: Duration,
    pub boost: Option<BoostPolicy>,
    pub boost_multiplier_bps: u32,
    pub log_filter: String,
}

impl std::fmt::Debug for ServiceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceConfig")
            .field("rpc_url", &self.rpc_url)
            .field("admin_address", &self.admin_address)
            .field("http_addr", &self.http_addr)
            .field("state_path", &self.state_path)
            .field("pots", &self.pots.iter().map(|p| &p.id).collect::<Vec<_>>())
            .field("admin_token", &self.admin_token.as_ref().map(|_| "<redacted>"))
            .field("verify_policy", &self.verify_policy)
            .field("confirm_policy", &self.confirm_policy)
            .field("rpc_timeout", &self.rpc_timeout)
            .field("boost", &self.boost)
            .field("boost_multiplier_bps", &self.boost_multiplier_bps)
            .finish_non_exhaustive()
    }
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from any key/value source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let rpc_url = get("RPC_URL").ok_or(ConfigError::Missing("RPC_URL"))?;
        let secret_key_json =
            get("SECRET_KEY_JSON").ok_or(ConfigError::Missing("SECRET_KEY_JSON"))?;
        let keypair = PayoutKeypair::from_json(&secret_key_json)?;

        let admin_address = get("ADMIN_PUBLIC_KEY").unwrap_or_else(|| keypair.pubkey());

        let http_addr = match get("RAPIDPOT_HTTP_ADDR") {
            Some(addr) => addr.parse().map_err(|e| ConfigError::Invalid {
                key: "RAPIDPOT_HTTP_ADDR",
                reason: format!("{}", e),
            })?,
            None => {
                let port: u16 = parse_or(&get, "PORT", DEFAULT_PORT)?;
                SocketAddr::from(([0, 0, 0, 0], port))
            }
        };

        let state_path = PathBuf::from(
            get("RAPIDPOT_STATE_PATH").unwrap_or_else(|| DEFAULT_STATE_PATH.into()),
        );

        let pots = match get("RAPIDPOT_POTS_FILE") {
            Some(path) => load_pots_file(Path::new(&path))?,
            None => default_pots(),
        };

        let verify_defaults = RetryPolicy::verification_default();
        let verify_policy = RetryPolicy::new(
            parse_or(&get, "VERIFY_MAX_ATTEMPTS", verify_defaults.max_attempts)?,
            Duration::from_millis(parse_or(&get, "VERIFY_RETRY_DELAY_MS", 1_000u64)?),
        );
        let confirm_defaults = RetryPolicy::confirmation_default();
        let confirm_policy = RetryPolicy::new(
            parse_or(&get, "PAYOUT_CONFIRM_ATTEMPTS", confirm_defaults.max_attempts)?,
            Duration::from_millis(parse_or(&get, "PAYOUT_CONFIRM_DELAY_MS", 2_000u64)?),
        );
        let rpc_timeout =
            Duration::from_millis(parse_or(&get, "RPC_TIMEOUT_MS", DEFAULT_RPC_TIMEOUT_MS)?);

        let boost = match get("BOOST_MINT") {
            Some(mint) => Some(BoostPolicy {
                mint,
                min_balance: parse_or(&get, "BOOST_MIN_BALANCE", 1u64)?,
            }),
            None => None,
        };
        let boost_multiplier_bps = parse_or(&get, "BOOST_MULTIPLIER_BPS", DEFAULT_BOOST_BPS)?;

        let config = Self {
            rpc_url,
            secret_key_json,
            admin_address,
            http_addr,
            state_path,
            pots,
            admin_token: get("ADMIN_TOKEN"),
            verify_policy,
            confirm_policy,
            rpc_timeout,
            boost,
            boost_multiplier_bps,
            log_filter: get("RAPIDPOT_LOG").unwrap_or_else(|| "info".into()),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.rpc_url.starts_with("http://") && !self.rpc_url.starts_with("https://") {
            return Err(ConfigError::Invalid {
                key: "RPC_URL",
                reason: "must be an http(s) URL".into(),
            });
        }
        if !is_valid_address(&self.admin_address) {
            return Err(ConfigError::Invalid {
                key: "ADMIN_PUBLIC_KEY",
                reason: "not a base58 32-byte address".into(),
            });
        }
        if let Some(boost) = &self.boost {
            if !is_valid_address(&boost.mint) {
                return Err(ConfigError::Invalid {
                    key: "BOOST_MINT",
                    reason: "not a base58 32-byte address".into(),
                });
            }
        }
        if self.boost_multiplier_bps < 10_000 {
            return Err(ConfigError::Invalid {
                key: "BOOST_MULTIPLIER_BPS",
                reason: "must be at least 10000 (x1.0)".into(),
            });
        }
        if self.rpc_timeout.is_zero() {
            return Err(ConfigError::Invalid {
                key: "RPC_TIMEOUT_MS",
                reason: "must be positive".into(),
            });
        }
        validate_pots(&self.pots).map_err(|e| ConfigError::Invalid {
            key: "RAPIDPOT_POTS_FILE",
            reason: e.to_string(),
        })
    }

    /// The payout keypair. Parsed again on demand so the secret is not
    /// kept in a second form.
    pub fn keypair(&self) -> Result<PayoutKeypair, ConfigError> {
        Ok(PayoutKeypair::from_json(&self.secret_key_json)?)
    }

    /// Longest a started draw can take: every confirmation sleep, one RPC
    /// timeout per status poll plus the blockhash and send calls, and a
    /// margin. Shutdown waits this long for running draws.
    pub fn draw_drain_limit(&self) -> Duration {
        let rpc_calls = self.confirm_policy.attempts().saturating_add(2);
        self.confirm_policy
            .max_wait()
            .saturating_add(self.rpc_timeout.saturating_mul(rpc_calls))
            .saturating_add(DRAW_DRAIN_MARGIN)
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            pots: self.pots.clone(),
            admin_address: self.admin_address.clone(),
            verify_policy: self.verify_policy,
            confirm_policy: self.confirm_policy,
            boost: self.boost.clone(),
            boost_multiplier_bps: self.boost_multiplier_bps,
        }
    }
}

fn parse_or<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            reason: format!("{:?}: {}", raw, e),
        }),
        None => Ok(default),
    }
}

fn load_pots_file(path: &Path) -> Result<Vec<PotConfig>, ConfigError> {
    let err = |reason: String| ConfigError::PotsFile {
        path: path.display().to_string(),
        reason,
    };
    let bytes = std::fs::read(path).map_err(|e| err(e.to_string()))?;
    serde_json::from_slice(&bytes).map_err(|e| err(e.to_string()))
}

/// Load environment variables from a dotenv file.
///
/// Priority:
/// 1. `RAPIDPOT_ENV_FILE` environment variable (custom path)
/// 2. `.env`
///
/// Returns the loaded path, if any. Runs before tracing is initialized.
pub fn load_env_file() -> Option<PathBuf> {
    let env_file = env::var("RAPIDPOT_ENV_FILE").unwrap_or_else(|_| ".env".to_string());
    match dotenvy::from_filename(&env_file) {
        Ok(path) => Some(path),
        Err(e) => {
            if !matches!(e, dotenvy::Error::Io(_)) {
                eprintln!("warning: failed to load {}: {}", env_file, e);
            }
            None
        }
    }
}
