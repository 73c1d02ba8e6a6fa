use std::net::SocketAddr;
use anyhow::Result;

use hashbrown::HashMap;
use serde::{Serialize, Deserialize};
use tracing::{error, info, warn};

use scrypt::{
    password_hash::{
        rand_core::OsRng,
        PasswordHash, PasswordHasher, SaltString
    },
    Scrypt
};

// Sane defaults for CastProxy
const BIND: &str                  = "127.0.0.1:9000";
const ADMINACC_ENABLED: bool      = true;
const ADMINACC_BIND: &str         = "127.0.0.1:9100";

pub const SERVER_ID: &str         = "CastProxy 0.1.0";

const UPSTREAM_HOST: &str         = "127.0.0.1";
const UPSTREAM_PORT: u16          = 8000;
const UPSTREAM_USER: &str         = "source";
const UPSTREAM_PASS: &str         = "hackme";
const UPSTREAM_TIMEOUT: u64       = 10000;
const UPSTREAM_NAME: &str         = "Internet radio!";
const UPSTREAM_PUBLIC: bool       = false;

const MAX_CLIENTS: usize          = 400;
const QUEUE_LIMIT: usize          = 100;
const BUFFER_SIZE: usize          = 4096;
const SOURCE_TIMEOUT: u64         = 5000;
const HEADER_TIMEOUT: u64         = 15000;
const HTTP_MAX_LEN: usize         = 8192;
const ADMIT_CHANNEL: usize        = 5;
const DATA_CHANNEL: usize         = 1024;
const ERROR_CHANNEL: usize        = 512;
const META_CHANNEL: usize         = 10;
const COLLECT_CHANNEL: usize      = 5;

const MISC_UNSAFE_PASS: bool      = false;
const MISC_CHECK_FORWARDEDFOR: bool = false;

/// Server configuration
#[derive(Serialize, Deserialize)]
pub struct ServerSettings {
    /// List of every address:port couple we want to bind to
    #[serde(default = "default_val_address")]
    pub address: Vec<ServerAddress>,
    /// Info about our instance
    #[serde(default = "default_val_info")]
    pub info: ServerInfo,
    /// The icecast server every mount is pushed to
    #[serde(default = "default_val_upstream")]
    pub upstream: UpstreamSettings,
    /// Predefined limits that the proxy shall not surpass
    #[serde(default = "default_val_limits")]
    pub limits: Limits,
    /// Other misc settings
    #[serde(default = "default_val_misc")]
    pub misc: MiscSettings,
    /// Access for admin accounts
    #[serde(default = "default_val_admin_access")]
    pub admin_access: AdminAccess,
    /// Accounts credentials
    #[serde(default = "default_val_accounts")]
    #[serde(with = "::serde_with::rust::maps_duplicate_key_is_error")]
    pub account: HashMap<String, Account>
}

#[derive(Serialize, Deserialize, Debug)]
pub struct MiscSettings {
    #[serde(default = "default_val_misc_unsafe_pass")]
    /// Allow unsafe passwords, this is highly discouraged and should only be used for testing!!
    pub unsafe_pass: bool,
    #[serde(default = "default_val_misc_check_forwardedfor")]
    /// Check if `X-Forwarded-For` header is present and set it as default IP address for client
    /// Usefull when castproxy is sitting behind a reverse proxy like haproxy
    pub check_forwardedfor: bool
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(tag = "role")]
#[serde(rename_all = "lowercase")]
pub enum Account {
    Admin {
        pass: String,
    },
    Source {
        pass: String,
        #[serde(default = "default_source_mount")]
        mount: Vec<Mount>
    },
    Meta {
        pass: String,
        #[serde(default = "default_source_mount")]
        mount: Vec<Mount>
    }
}

#[derive(Serialize, Deserialize, Debug)]
pub struct Mount {
    pub path: String
}

#[derive(Serialize, Deserialize)]
pub struct ServerAddress {
    /// Address to bind to, must be a valid ipv4/ipv6 of an interface
    pub bind: SocketAddr
}

#[derive(Serialize, Deserialize)]
pub struct ServerInfo {
    /// Instance unique name, shows up in response headers
    #[serde(default = "default_val_info_id")]
    pub id: String
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamProtocol {
    Http,
    Icy,
    Xaudiocast
}

/// Where and how we push the multiplexed streams
#[derive(Serialize, Deserialize, Clone)]
pub struct UpstreamSettings {
    #[serde(default = "default_val_upstream_host")]
    pub host: String,
    #[serde(default = "default_val_upstream_port")]
    pub port: u16,
    /// The user to authenticate as on the upstream
    #[serde(default = "default_val_upstream_user")]
    pub user: String,
    #[serde(default = "default_val_upstream_pass")]
    pub pass: String,
    #[serde(default = "default_val_upstream_protocol")]
    pub protocol: UpstreamProtocol,
    /// Useragent sent to the upstream on connecting
    #[serde(default = "default_val_upstream_agent")]
    pub agent: String,
    /// Max time in millis a connect or metadata request to the
    /// upstream may take
    #[serde(default = "default_val_upstream_timeout")]
    pub timeout: u64,
    /// Stream name announced to upstream directories
    #[serde(default = "default_val_upstream_name")]
    pub name: String,
    /// Whether the upstream should publish the stream on directories
    #[serde(default = "default_val_upstream_public")]
    pub public: bool,
    pub url: Option<String>,
    pub genre: Option<String>,
    pub description: Option<String>
}

#[derive(Serialize, Deserialize, Clone)]
pub struct Limits {
    /// Max number of concurrent connections
    #[serde(default = "default_val_limit_clients")]
    pub clients: usize,
    /// Max number of standby sources queued per mountpoint
    #[serde(default = "default_val_limit_queue_limit")]
    pub queue_limit: usize,
    /// Size in bytes of a single audio read from a source
    #[serde(default = "default_val_limit_buffer_size")]
    pub buffer_size: usize,
    /// Max time in millis we wait to receive a chunk of audio stream from a source
    #[serde(default = "default_val_limit_source_timeout")]
    pub source_timeout: u64,
    /// Max time in millis we wait for a client to send his header
    #[serde(default = "default_val_limit_header_timeout")]
    pub header_timeout: u64,
    /// Max http request size in bytes sent by client that we are willing to accept
    #[serde(default = "default_val_limit_http_max_len")]
    pub http_max_len: usize,
    /// Capacity of the channel handing new sources to the engine
    #[serde(default = "default_val_limit_admit_channel")]
    pub admit_channel: usize,
    /// Capacity of the audio frame channel. Readers block on it when
    /// it runs full, pushing back on their sockets
    #[serde(default = "default_val_limit_data_channel")]
    pub data_channel: usize,
    /// Capacity of the reader error channel
    #[serde(default = "default_val_limit_error_channel")]
    pub error_channel: usize,
    /// Capacity of the metadata channel
    #[serde(default = "default_val_limit_meta_channel")]
    pub meta_channel: usize,
    /// Capacity of the mount collection channel
    #[serde(default = "default_val_limit_collect_channel")]
    pub collect_channel: usize
}

#[derive(Serialize, Deserialize)]
pub struct AdminAccess {
    #[serde(default = "default_val_adminacc_enabled")]
    pub enabled: bool,
    #[serde(default = "default_val_adminacc_address")]
    pub address: ServerAddress,
}

impl Default for ServerSettings {
    fn default() -> Self {
        ServerSettings {
            address: default_val_address(),
            info: default_val_info(),
            upstream: default_val_upstream(),
            limits: default_val_limits(),
            admin_access: default_val_admin_access(),
            account: default_val_accounts(),
            misc: default_val_misc()
        }
    }
}

impl Default for MiscSettings {
    fn default() -> Self {
        Self {
            unsafe_pass: default_val_misc_unsafe_pass(),
            check_forwardedfor: default_val_misc_check_forwardedfor()
        }
    }
}

impl Default for ServerInfo {
    fn default() -> Self {
        ServerInfo {
            id: default_val_info_id()
        }
    }
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        UpstreamSettings {
            host: default_val_upstream_host(),
            port: default_val_upstream_port(),
            user: default_val_upstream_user(),
            pass: default_val_upstream_pass(),
            protocol: default_val_upstream_protocol(),
            agent: default_val_upstream_agent(),
            timeout: default_val_upstream_timeout(),
            name: default_val_upstream_name(),
            public: default_val_upstream_public(),
            url: None,
            genre: None,
            description: None
        }
    }
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            clients: default_val_limit_clients(),
            queue_limit: default_val_limit_queue_limit(),
            buffer_size: default_val_limit_buffer_size(),
            source_timeout: default_val_limit_source_timeout(),
            header_timeout: default_val_limit_header_timeout(),
            http_max_len: default_val_limit_http_max_len(),
            admit_channel: default_val_limit_admit_channel(),
            data_channel: default_val_limit_data_channel(),
            error_channel: default_val_limit_error_channel(),
            meta_channel: default_val_limit_meta_channel(),
            collect_channel: default_val_limit_collect_channel()
        }
    }
}

impl Default for AdminAccess {
    fn default() -> Self {
        AdminAccess {
            enabled: default_val_adminacc_enabled(),
            address: default_val_adminacc_address()
        }
    }
}

fn default_val_address() -> Vec<ServerAddress> {
    vec![ ServerAddress { bind: BIND.parse().expect("Should be a valid socket address") } ]
}
fn default_val_info() -> ServerInfo { ServerInfo::default() }
fn default_val_upstream() -> UpstreamSettings { UpstreamSettings::default() }
fn default_val_limits() -> Limits { Limits::default() }
fn default_val_admin_access() -> AdminAccess { AdminAccess::default() }

fn default_val_info_id() -> String { SERVER_ID.to_owned() }

fn default_val_upstream_host() -> String { UPSTREAM_HOST.to_owned() }
fn default_val_upstream_port() -> u16 { UPSTREAM_PORT }
fn default_val_upstream_user() -> String { UPSTREAM_USER.to_owned() }
fn default_val_upstream_pass() -> String { UPSTREAM_PASS.to_owned() }
fn default_val_upstream_protocol() -> UpstreamProtocol { UpstreamProtocol::Http }
fn default_val_upstream_agent() -> String { SERVER_ID.to_owned() }
fn default_val_upstream_timeout() -> u64 { UPSTREAM_TIMEOUT }
fn default_val_upstream_name() -> String { UPSTREAM_NAME.to_owned() }
fn default_val_upstream_public() -> bool { UPSTREAM_PUBLIC }

fn default_val_limit_clients() -> usize { MAX_CLIENTS }
fn default_val_limit_queue_limit() -> usize { QUEUE_LIMIT }
fn default_val_limit_buffer_size() -> usize { BUFFER_SIZE }
fn default_val_limit_source_timeout() -> u64 { SOURCE_TIMEOUT }
fn default_val_limit_header_timeout() -> u64 { HEADER_TIMEOUT }
fn default_val_limit_http_max_len() -> usize { HTTP_MAX_LEN }
fn default_val_limit_admit_channel() -> usize { ADMIT_CHANNEL }
fn default_val_limit_data_channel() -> usize { DATA_CHANNEL }
fn default_val_limit_error_channel() -> usize { ERROR_CHANNEL }
fn default_val_limit_meta_channel() -> usize { META_CHANNEL }
fn default_val_limit_collect_channel() -> usize { COLLECT_CHANNEL }

fn default_val_adminacc_enabled() -> bool { ADMINACC_ENABLED }
fn default_val_adminacc_address() -> ServerAddress {
    ServerAddress { bind: ADMINACC_BIND.parse().expect("Should be a valid socket address") }
}

fn default_val_accounts() -> HashMap<String, Account> { HashMap::new() }

fn default_source_mount() -> Vec<Mount> { Vec::new() }

fn default_val_misc() -> MiscSettings { MiscSettings::default() }
fn default_val_misc_unsafe_pass() -> bool { MISC_UNSAFE_PASS }
fn default_val_misc_check_forwardedfor() -> bool { MISC_CHECK_FORWARDEDFOR }

impl ServerSettings {
    pub fn load(config_path: &str) -> Self {
        match std::fs::read_to_string(config_path) {
            Ok(v) => {
                match Self::from_string(&v) {
                    Ok(v) => {
                        info!("Loaded configuration from {}", config_path);
                        v
                    },
                    Err(e) => {
                        error!("Loading config file {} failed: {}", config_path, e);
                        std::process::exit(1);
                    }
                }
            },
            Err(e) => {
                error!("Reading config file {} failed: {}", config_path, e);
                std::process::exit(1);
            }
        }
    }

    pub fn from_string(config: &str) -> Result<Self> {
        Ok(serde_yaml::from_str::<ServerSettings>(config)?)
    }

    pub fn hash_passwords(config: &mut ServerSettings) {
        // Converting plaintext passwords to hash
        for (_, account) in &mut config.account {
            let pass = match account {
                Account::Source { pass, .. } => pass,
                Account::Admin { pass, .. }  => pass,
                Account::Meta { pass, .. }   => pass
            };

            match pass.split_at(2) {
                ("1$", _) => (),
                ("0$", rawpass) => {
                    let salt = SaltString::generate(&mut OsRng);
                    // Speeding up debug
                    // Should never be used for prod
                    #[cfg(debug_assertions)]
                    let hash = Scrypt.hash_password_customized(rawpass.as_bytes(), None, None, scrypt::Params::new(1, 1, 1, 10).unwrap(), &salt)
                        .expect("Should be able to hash password")
                        .to_string();
                    #[cfg(not(debug_assertions))]
                    let hash = Scrypt.hash_password(rawpass.as_bytes(), &salt)
                        .expect("Should be able to hash password")
                        .to_string();
                    *pass    = "1$".to_string();
                    pass.push_str(&hash);
                },
                _ => ()
            }
        }
    }

    pub fn create_default(config_path: &str) {
        let settings = serde_yaml::to_string(&Self::default()).expect("Can't serialize server settings");
        match std::fs::write(config_path, settings) {
            Ok(_) => info!("Default config file written to {}", config_path),
            Err(e) => error!("Creating default config at {} failed: {}", config_path, e)
        }
    }

    /// Method to verify if current settings are sane returning number of errors found
    pub fn verify(config: &ServerSettings, unsafe_pass: bool) -> usize {
        let mut errors    = 0;
        // First we verify no duplicate addresses are supplied to us
        let mut addresses = config.address.iter().collect::<Vec<_>>();

        if addresses.is_empty() {
            error!("At least one public bind address must be specified");
            errors += 1;
        }

        if config.admin_access.enabled {
            addresses.push(&config.admin_access.address);
        }
        for address in &addresses {
            let address = *address;
            for address1 in &addresses {
                let address1 = *address1;
                if &address.bind as *const _ != &address1.bind as *const _
                    && address.bind.eq(&address1.bind) {
                    error!("Two addresses can't have same bind tuple [{}].", address.bind);
                    errors += 1;
                }
            }
        }

        // Verifying accounts credentials
        for (user, account) in &config.account {
            let (pass, mounts) = match account {
                Account::Admin { pass } => (pass, None),
                Account::Source { pass, mount } => {
                    if mount.is_empty() {
                        warn!("Source {} has no defined mount, this means it can't mount any stream", user);
                    }
                    (pass, Some(mount))
                },
                Account::Meta { pass, mount } => (pass, Some(mount))
            };

            // Checking if we don't have duplicates
            for (ruser, raccount) in &config.account {
                let rmounts = match raccount {
                    Account::Admin { .. } => None,
                    Account::Source { mount, .. } => Some(mount),
                    Account::Meta { .. } => None
                };
                // Skip if we are identic
                if std::ptr::eq(user, ruser) {
                    continue;
                }

                if let (Some(mounts), Some(rmounts)) = (mounts, rmounts) {
                    for mount in mounts {
                        for rmount in rmounts {
                            if mount.path.eq(&rmount.path) && mount.path.ne("*") {
                                warn!("Source users {} and {} have access to same mountpoint {}", user, ruser, mount.path);
                            }
                        }
                    }
                }
            }

            if !unsafe_pass {
                // Checking if we have strong password if it's plaintext
                match pass.split_at(2) {
                    ("0$", rawpass) => {
                        let estimate = zxcvbn::zxcvbn(rawpass, &[user.as_str()])
                            .expect("Should be able to calculate password entropy");

                        if estimate.score() <= 3 {
                            error!("Password for {} is not strong with a score of {}/4", user, estimate.score());
                            errors += 1;
                            continue;
                        }
                    },
                    ("1$", hash) => {
                        if let Err(e) = PasswordHash::new(hash) {
                            error!("Invalid scrypt password hash for {}: {}", user, e);
                            errors += 1;
                        }
                    },
                    _ => {
                        error!("Invalid password prefix for {}", user);
                        errors += 1;
                        continue;
                    }
                }
            }
        }

        // Verifying also if other settings are sane
        if config.upstream.host.is_empty() {
            error!("Upstream host can't be empty");
            errors += 1;
        }
        if config.upstream.port == 0 {
            error!("Upstream port can't be 0");
            errors += 1;
        }
        if config.limits.buffer_size == 0 {
            error!("limits.buffer_size can't be 0");
            errors += 1;
        }
        if config.limits.queue_limit == 0 {
            warn!("limits.queue_limit is 0, every second source to a mount will be rejected");
        }
        for (name, capacity) in [
            ("admit_channel", config.limits.admit_channel),
            ("data_channel", config.limits.data_channel),
            ("error_channel", config.limits.error_channel),
            ("meta_channel", config.limits.meta_channel),
            ("collect_channel", config.limits.collect_channel)
        ] {
            if capacity == 0 {
                error!("limits.{} can't be 0", name);
                errors += 1;
            }
        }
        if config.limits.http_max_len > 16000 {
            warn!("http_max_len [value:{}] is too big, this may be used to deny service.", config.limits.http_max_len);
        }
        if config.limits.source_timeout < 1000 {
            warn!("limits.source_timeout [value:{}] is small, slow but healthy sources will be dropped.", config.limits.source_timeout);
        }

        if config.misc.check_forwardedfor {
            warn!("check_forwardedfor is enabled!! make sure only reverse proxy can access the bind addresses");
        }

        errors
    }
}
