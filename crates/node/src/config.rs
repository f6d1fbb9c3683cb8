use std::collections::HashMap;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use stakeidx_consensus::{chain_params, Network};
use stakeidx_indexer::RpcConfig;
use stakeidx_log as logging;
use stakeidx_primitives::ScanTarget;
use stakeidx_storage::fjall::FjallOptions;

const DEFAULT_DATA_DIR: &str = "data";
const CONF_FILE_NAME: &str = "stakeidx.conf";
const DEFAULT_ADMIN_ADDR: &str = "127.0.0.1:8480";
const DEFAULT_BATCH_SIZE: u32 = 500;
const DEFAULT_WORKERS: usize = 4;
const DEFAULT_HEIGHT_RETRIES: u32 = 3;
const DEFAULT_GAP_INTERVAL_SECS: u64 = 3600;
const DEFAULT_RECONCILE_INTERVAL_SECS: u64 = 900;
const DEFAULT_RECONCILE_BATCH: usize = 500;
const DEFAULT_DB_CACHE_MB: u64 = 256;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Backend {
    Memory,
    Fjall,
}

impl Backend {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "memory" => Some(Self::Memory),
            "fjall" => Some(Self::Fjall),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Command {
    Scan {
        start: Option<u32>,
        end: ScanTarget,
        key: Option<String>,
    },
    Gaps,
    Backfill,
    Reconcile {
        limit: Option<usize>,
    },
    Snapshot {
        address: String,
    },
    Status,
    Serve,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub command: Command,
    pub backend: Backend,
    pub data_dir: PathBuf,
    pub conf_path: PathBuf,
    pub network: Network,
    pub rpc: RpcConfig,
    pub batch_size: u32,
    pub workers: usize,
    pub height_retries: u32,
    pub first_height: Option<u32>,
    pub pool_address: Option<String>,
    pub track: Vec<String>,
    pub admin_addr: SocketAddr,
    pub gap_interval_secs: u64,
    pub reconcile_interval_secs: u64,
    pub reconcile_batch: usize,
    pub log_level: logging::Level,
    pub log_format: logging::Format,
    pub log_timestamps: bool,
    pub log_file: Option<PathBuf>,
    pub db: FjallOptions,
}

#[derive(Debug)]
pub enum CliAction {
    Run(Box<Config>),
    PrintHelp,
    PrintVersion,
}

/// Values given on the command line; each one wins over the conf file.
#[derive(Default)]
struct Flags {
    backend: Option<String>,
    data_dir: Option<PathBuf>,
    conf_path: Option<PathBuf>,
    network: Option<String>,
    rpc_url: Option<String>,
    rpc_user: Option<String>,
    rpc_password: Option<String>,
    rpc_timeout: Option<String>,
    rpc_retries: Option<String>,
    rpc_inflight: Option<String>,
    batch_size: Option<String>,
    workers: Option<String>,
    height_retries: Option<String>,
    first_height: Option<String>,
    pool_address: Option<String>,
    track: Vec<String>,
    admin_addr: Option<String>,
    gap_interval: Option<String>,
    reconcile_interval: Option<String>,
    reconcile_batch: Option<String>,
    log_level: Option<String>,
    log_format: Option<String>,
    log_timestamps: Option<bool>,
    log_file: Option<PathBuf>,
    db_cache_mb: Option<String>,
    db_write_buffer_mb: Option<String>,
    db_journal_mb: Option<String>,
    db_fsync_ms: Option<String>,
    start: Option<String>,
    end: Option<String>,
    key: Option<String>,
    limit: Option<String>,
    address: Option<String>,
}

pub fn parse_args() -> Result<CliAction, String> {
    parse_args_from(std::env::args().skip(1))
}

fn parse_number<T: FromStr>(name: &str, raw: &str) -> Result<T, String> {
    raw.trim()
        .parse::<T>()
        .map_err(|_| format!("invalid {name} '{raw}'\n{}", usage()))
}

pub fn parse_args_from<I>(raw_args: I) -> Result<CliAction, String>
where
    I: IntoIterator<Item = String>,
{
    let mut args = raw_args.into_iter().peekable();
    let command_name = match args.peek().map(|value| value.as_str()) {
        Some("help") | Some("--help") | Some("-h") => return Ok(CliAction::PrintHelp),
        Some("version") | Some("--version") | Some("-V") => return Ok(CliAction::PrintVersion),
        Some(name) if !name.starts_with('-') => {
            let name = name.to_string();
            let _ = args.next();
            name
        }
        _ => "serve".to_string(),
    };

    let mut flags = Flags::default();
    while let Some(arg) = args.next() {
        let mut value = |name: &str| {
            args.next()
                .ok_or_else(|| format!("missing value for {name}\n{}", usage()))
        };
        match arg.as_str() {
            "--help" | "-h" => return Ok(CliAction::PrintHelp),
            "--version" | "-V" => return Ok(CliAction::PrintVersion),
            "--backend" => flags.backend = Some(value("--backend")?),
            "--data-dir" => flags.data_dir = Some(PathBuf::from(value("--data-dir")?)),
            "--conf" => flags.conf_path = Some(PathBuf::from(value("--conf")?)),
            "--network" => flags.network = Some(value("--network")?),
            "--rpc-url" => flags.rpc_url = Some(value("--rpc-url")?),
            "--rpc-user" => flags.rpc_user = Some(value("--rpc-user")?),
            "--rpc-password" => flags.rpc_password = Some(value("--rpc-password")?),
            "--rpc-timeout" => flags.rpc_timeout = Some(value("--rpc-timeout")?),
            "--rpc-retries" => flags.rpc_retries = Some(value("--rpc-retries")?),
            "--rpc-inflight" => flags.rpc_inflight = Some(value("--rpc-inflight")?),
            "--batch-size" => flags.batch_size = Some(value("--batch-size")?),
            "--workers" => flags.workers = Some(value("--workers")?),
            "--height-retries" => flags.height_retries = Some(value("--height-retries")?),
            "--first-height" => flags.first_height = Some(value("--first-height")?),
            "--pool-address" => flags.pool_address = Some(value("--pool-address")?),
            "--track" => flags.track.push(value("--track")?),
            "--admin-addr" => flags.admin_addr = Some(value("--admin-addr")?),
            "--gap-interval" => flags.gap_interval = Some(value("--gap-interval")?),
            "--reconcile-interval" => {
                flags.reconcile_interval = Some(value("--reconcile-interval")?)
            }
            "--reconcile-batch" => flags.reconcile_batch = Some(value("--reconcile-batch")?),
            "--log-level" => flags.log_level = Some(value("--log-level")?),
            "--log-format" => flags.log_format = Some(value("--log-format")?),
            "--log-timestamps" => flags.log_timestamps = Some(true),
            "--no-log-timestamps" => flags.log_timestamps = Some(false),
            "--log-file" => flags.log_file = Some(PathBuf::from(value("--log-file")?)),
            "--db-cache-mb" => flags.db_cache_mb = Some(value("--db-cache-mb")?),
            "--db-write-buffer-mb" => {
                flags.db_write_buffer_mb = Some(value("--db-write-buffer-mb")?)
            }
            "--db-journal-mb" => flags.db_journal_mb = Some(value("--db-journal-mb")?),
            "--db-fsync-ms" => flags.db_fsync_ms = Some(value("--db-fsync-ms")?),
            "--start" => flags.start = Some(value("--start")?),
            "--end" => flags.end = Some(value("--end")?),
            "--key" => flags.key = Some(value("--key")?),
            "--limit" => flags.limit = Some(value("--limit")?),
            "--address" => flags.address = Some(value("--address")?),
            other => return Err(format!("unknown argument '{other}'\n{}", usage())),
        }
    }

    let command = parse_command(&command_name, &flags)?;
    let data_dir = flags
        .data_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));
    let conf_path = flags
        .conf_path
        .clone()
        .unwrap_or_else(|| data_dir.join(CONF_FILE_NAME));
    let conf = Conf {
        values: load_conf(&conf_path)?.unwrap_or_default(),
        path: conf_path.clone(),
    };

    let network = match flags.network.as_deref().or(conf.last("network")) {
        Some(raw) => Network::parse(raw)
            .ok_or_else(|| format!("invalid network '{raw}' (expected mainnet|testnet|regtest)"))?,
        None => Network::Mainnet,
    };
    let params = chain_params(network);

    let backend = match flags.backend.as_deref().or(conf.last("backend")) {
        Some(raw) => Backend::parse(raw)
            .ok_or_else(|| format!("invalid backend '{raw}' (expected fjall|memory)"))?,
        None => Backend::Fjall,
    };

    let rpc_defaults = RpcConfig::default();
    let rpc_user = flags.rpc_user.clone().or_else(|| conf.last_owned("rpcuser"));
    let rpc_password = flags
        .rpc_password
        .clone()
        .or_else(|| conf.last_owned("rpcpassword"));
    if rpc_user.is_some() ^ rpc_password.is_some() {
        return Err(format!(
            "rpcuser and rpcpassword must both be set (via CLI or {})\n{}",
            conf.path.display(),
            usage()
        ));
    }
    let rpc = RpcConfig {
        url: flags
            .rpc_url
            .clone()
            .or_else(|| conf.last_owned("rpcurl"))
            .unwrap_or_else(|| format!("http://127.0.0.1:{}", params.default_rpc_port)),
        user: rpc_user,
        password: rpc_password,
        timeout_secs: setting(&flags.rpc_timeout, &conf, "rpctimeout")?
            .unwrap_or(rpc_defaults.timeout_secs),
        retries: setting(&flags.rpc_retries, &conf, "rpcretries")?
            .unwrap_or(rpc_defaults.retries),
        retry_base: rpc_defaults.retry_base,
        max_in_flight: setting(&flags.rpc_inflight, &conf, "rpcinflight")?
            .unwrap_or(rpc_defaults.max_in_flight),
    };

    let mut track = flags.track.clone();
    if track.is_empty() {
        track = conf.all("track");
    }

    let admin_raw = flags
        .admin_addr
        .clone()
        .or_else(|| conf.last_owned("adminaddr"))
        .unwrap_or_else(|| DEFAULT_ADMIN_ADDR.to_string());
    let admin_addr = admin_raw
        .parse::<SocketAddr>()
        .map_err(|_| format!("invalid admin address '{admin_raw}'"))?;

    let log_level = match flags.log_level.as_deref().or(conf.last("loglevel")) {
        Some(raw) => logging::Level::parse(raw)
            .ok_or_else(|| format!("invalid log level '{raw}'\n{}", usage()))?,
        None => logging::Level::Info,
    };
    let log_format = match flags.log_format.as_deref().or(conf.last("logformat")) {
        Some(raw) => logging::Format::parse(raw)
            .ok_or_else(|| format!("invalid log format '{raw}'\n{}", usage()))?,
        None => logging::Format::Text,
    };
    let log_timestamps = match flags.log_timestamps {
        Some(value) => value,
        None => match conf.last("logtimestamps") {
            Some(raw) => parse_conf_bool(raw).ok_or_else(|| {
                format!(
                    "invalid logtimestamps value '{raw}' in {}",
                    conf.path.display()
                )
            })?,
            None => true,
        },
    };

    let db_cache_mb: u64 = setting(&flags.db_cache_mb, &conf, "dbcache")?.unwrap_or(DEFAULT_DB_CACHE_MB);
    let db_write_buffer_mb: Option<u64> =
        setting(&flags.db_write_buffer_mb, &conf, "dbwritebuffer")?;
    let db_journal_mb: Option<u64> = setting(&flags.db_journal_mb, &conf, "dbjournal")?;
    let db = FjallOptions {
        cache_bytes: Some(mb_to_bytes(db_cache_mb)),
        write_buffer_bytes: db_write_buffer_mb.map(mb_to_bytes),
        journal_bytes: db_journal_mb.map(mb_to_bytes),
        fsync_ms: setting(&flags.db_fsync_ms, &conf, "dbfsyncms")?,
        ..FjallOptions::default()
    };

    let batch_size: u32 = setting(&flags.batch_size, &conf, "batchsize")?.unwrap_or(DEFAULT_BATCH_SIZE);
    if batch_size == 0 {
        return Err(format!("batch size must be positive\n{}", usage()));
    }

    Ok(CliAction::Run(Box::new(Config {
        command,
        backend,
        data_dir,
        conf_path,
        network,
        rpc,
        batch_size,
        workers: setting(&flags.workers, &conf, "workers")?.unwrap_or(DEFAULT_WORKERS),
        height_retries: setting(&flags.height_retries, &conf, "heightretries")?
            .unwrap_or(DEFAULT_HEIGHT_RETRIES),
        first_height: setting(&flags.first_height, &conf, "firstheight")?,
        pool_address: flags
            .pool_address
            .clone()
            .or_else(|| conf.last_owned("pooladdress"))
            .or(params.delegation_pool_address),
        track,
        admin_addr,
        gap_interval_secs: setting(&flags.gap_interval, &conf, "gapinterval")?
            .unwrap_or(DEFAULT_GAP_INTERVAL_SECS),
        reconcile_interval_secs: setting(&flags.reconcile_interval, &conf, "reconcileinterval")?
            .unwrap_or(DEFAULT_RECONCILE_INTERVAL_SECS),
        reconcile_batch: setting(&flags.reconcile_batch, &conf, "reconcilebatch")?
            .unwrap_or(DEFAULT_RECONCILE_BATCH),
        log_level,
        log_format,
        log_timestamps,
        log_file: flags
            .log_file
            .clone()
            .or_else(|| conf.last("logfile").map(PathBuf::from)),
        db,
    })))
}

fn parse_command(name: &str, flags: &Flags) -> Result<Command, String> {
    match name {
        "scan" => {
            let end = match flags.end.as_deref() {
                Some(raw) => ScanTarget::parse(raw)
                    .ok_or_else(|| format!("invalid --end '{raw}' (expected a height or tip)"))?,
                None => ScanTarget::Tip,
            };
            let start = flags
                .start
                .as_deref()
                .map(|raw| parse_number::<u32>("--start", raw))
                .transpose()?;
            if let (Some(start), ScanTarget::Height(end)) = (start, end) {
                if end < start {
                    return Err(format!("--end {end} is below --start {start}"));
                }
            }
            Ok(Command::Scan {
                start,
                end,
                key: flags.key.clone(),
            })
        }
        "gaps" => Ok(Command::Gaps),
        "backfill" => Ok(Command::Backfill),
        "reconcile" => Ok(Command::Reconcile {
            limit: flags
                .limit
                .as_deref()
                .map(|raw| parse_number::<usize>("--limit", raw))
                .transpose()?,
        }),
        "snapshot" => {
            let address = flags
                .address
                .clone()
                .ok_or_else(|| format!("snapshot needs --address\n{}", usage()))?;
            Ok(Command::Snapshot { address })
        }
        "status" => Ok(Command::Status),
        "serve" => Ok(Command::Serve),
        other => Err(format!("unknown command '{other}'\n{}", usage())),
    }
}

struct Conf {
    values: HashMap<String, Vec<String>>,
    path: PathBuf,
}

impl Conf {
    fn last(&self, key: &str) -> Option<&str> {
        self.values
            .get(key)
            .and_then(|values| values.last())
            .map(String::as_str)
    }

    fn last_owned(&self, key: &str) -> Option<String> {
        self.last(key).map(str::to_string)
    }

    fn all(&self, key: &str) -> Vec<String> {
        self.values.get(key).cloned().unwrap_or_default()
    }
}

/// Numeric setting from the command line, else the conf file.
fn setting<T: FromStr>(flag: &Option<String>, conf: &Conf, key: &str) -> Result<Option<T>, String> {
    if let Some(raw) = flag {
        return parse_number(key, raw).map(Some);
    }
    match conf.last(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| format!("invalid {key} '{raw}' in {}", conf.path.display())),
        None => Ok(None),
    }
}

fn mb_to_bytes(mb: u64) -> u64 {
    mb.saturating_mul(1024 * 1024)
}

fn load_conf(path: &Path) -> Result<Option<HashMap<String, Vec<String>>>, String> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(format!("failed to read {}: {err}", path.display())),
    };

    let mut out: HashMap<String, Vec<String>> = HashMap::new();
    for raw_line in contents.lines() {
        let mut line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(idx) = line.find('#') {
            line = &line[..idx];
        }
        if let Some(idx) = line.find(';') {
            line = &line[..idx];
        }
        line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (key, value) = match line.split_once('=') {
            Some((key, value)) => (key.trim(), value.trim()),
            None => (line, "1"),
        };
        if key.is_empty() {
            continue;
        }
        out.entry(key.to_ascii_lowercase())
            .or_default()
            .push(value.to_string());
    }
    Ok(Some(out))
}

fn parse_conf_bool(value: &str) -> Option<bool> {
    let value = value.trim();
    if value.is_empty() {
        return Some(true);
    }
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}

pub fn usage() -> String {
    [
        "Usage:",
        "  stakeidx <command> [options]",
        "",
        "Commands:",
        "  scan       Scan a height range (--start H [--end H|tip] [--key K])",
        "  gaps       Print heights no scan has covered yet, then exit",
        "  backfill   Scan every gap, then exit",
        "  reconcile  Estimate stake amounts for unknown events ([--limit N])",
        "  snapshot   Refresh the cached unspent outputs of --address A",
        "  status     Print checkpoints and coverage, then exit",
        "  serve      Follow the tip with periodic gap audits and reconciliation (default)",
        "  help       Print this help and exit",
        "  version    Print version and exit",
        "",
        "Options:",
        "  --conf  Config file path (default: <data-dir>/stakeidx.conf)",
        "  --data-dir  Base data directory (default: ./data)",
        "  --backend  Storage backend (fjall|memory) (default: fjall)",
        "  --network  Network selection (mainnet|testnet|regtest) (default: mainnet)",
        "  --rpc-url  Node JSON-RPC endpoint (default: http://127.0.0.1:<network rpc port>)",
        "  --rpc-user, --rpc-password  Node RPC credentials",
        "  --rpc-timeout  Per-call timeout in seconds (default: 30)",
        "  --rpc-retries  Transport retries per call (default: 3)",
        "  --rpc-inflight  Maximum concurrent RPC calls (default: 8)",
        "  --batch-size  Heights per checkpointed batch (default: 500)",
        "  --workers  Concurrent block fetchers per batch (default: 4)",
        "  --height-retries  Retries for a failing height before it is skipped (default: 3)",
        "  --first-height  Lower bound for scans and gap audits (default: network first stake height)",
        "  --pool-address  Delegation pool address, never chosen as funder",
        "  --track  Only record rewards paid to this address (repeatable; default: all)",
        "  --admin-addr  Admin HTTP listener for serve (default: 127.0.0.1:8480)",
        "  --gap-interval  Seconds between gap audits in serve (default: 3600)",
        "  --reconcile-interval  Seconds between reconciliation passes in serve (default: 900)",
        "  --reconcile-batch  Events per reconciliation pass (default: 500)",
        "  --log-level  Log verbosity (error|warn|info|debug|trace) (default: info)",
        "  --log-format  Log output format (text|json) (default: text)",
        "  --log-timestamps, --no-log-timestamps  Toggle timestamps in text logs",
        "  --log-file  Append log output to this file instead of stderr",
        "  --db-cache-mb  Fjall block cache size (default: 256)",
        "  --db-write-buffer-mb  Fjall max write buffer size",
        "  --db-journal-mb  Fjall max journal size",
        "  --db-fsync-ms  Fjall background fsync interval",
    ]
    .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn args(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|value| value.to_string()).collect()
    }

    fn temp_conf(contents: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_nanos())
            .unwrap_or_default();
        let path = std::env::temp_dir().join(format!(
            "stakeidx-conf-{}-{nanos}.conf",
            std::process::id()
        ));
        fs::write(&path, contents).expect("write conf");
        path
    }

    fn run_config(raw: &[&str]) -> Config {
        match parse_args_from(args(raw)).expect("parse") {
            CliAction::Run(config) => *config,
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[test]
    fn help_and_version() {
        assert!(matches!(
            parse_args_from(args(&["help"])).expect("parse"),
            CliAction::PrintHelp
        ));
        assert!(matches!(
            parse_args_from(args(&["--version"])).expect("parse"),
            CliAction::PrintVersion
        ));
    }

    #[test]
    fn scan_command_with_range() {
        let conf = temp_conf("");
        let conf_arg = conf.to_string_lossy().to_string();
        let config = run_config(&[
            "scan", "--start", "100", "--end", "250", "--key", "k", "--conf", &conf_arg,
        ]);
        assert_eq!(
            config.command,
            Command::Scan {
                start: Some(100),
                end: ScanTarget::Height(250),
                key: Some("k".to_string()),
            }
        );
        assert_eq!(config.rpc.url, "http://127.0.0.1:27486");
        let _ = fs::remove_file(conf);
    }

    #[test]
    fn inverted_range_and_unknown_args_are_rejected() {
        assert!(parse_args_from(args(&["scan", "--start", "9", "--end", "3"])).is_err());
        assert!(parse_args_from(args(&["scan", "--bogus"])).is_err());
        assert!(parse_args_from(args(&["frobnicate"])).is_err());
        assert!(parse_args_from(args(&["snapshot"])).is_err());
    }

    #[test]
    fn conf_file_fills_gaps_and_cli_wins() {
        let conf = temp_conf(
            "# node access\nrpcuser=alice\nrpcpassword=secret\nbatchsize=50 ; small\ntrack=X\ntrack=Y\nnetwork=regtest\nlogtimestamps=0\n",
        );
        let conf_arg = conf.to_string_lossy().to_string();
        let config = run_config(&["status", "--conf", &conf_arg, "--batch-size", "75"]);
        assert_eq!(config.command, Command::Status);
        assert_eq!(config.rpc.user.as_deref(), Some("alice"));
        assert_eq!(config.rpc.password.as_deref(), Some("secret"));
        assert_eq!(config.batch_size, 75);
        assert_eq!(config.track, vec!["X".to_string(), "Y".to_string()]);
        assert_eq!(config.network, Network::Regtest);
        assert_eq!(config.rpc.url, "http://127.0.0.1:18844");
        assert!(!config.log_timestamps);
        let _ = fs::remove_file(conf);
    }

    #[test]
    fn credentials_must_come_in_pairs() {
        let conf = temp_conf("rpcuser=alice\n");
        let conf_arg = conf.to_string_lossy().to_string();
        assert!(parse_args_from(args(&["status", "--conf", &conf_arg])).is_err());
        let _ = fs::remove_file(conf);
    }
}
