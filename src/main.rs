use anyhow::{anyhow, bail, Context, Result};
use icx_ledger::config::{get_tx_tracker_url, Config};
use icx_ledger::device::{DeviceSession, SigningDevice};
use icx_ledger::operation_log::OperationLog;
use icx_ledger::rpc::IconRpcClient;
use icx_ledger::types::Wallet;
use icx_ledger::wallet_service::WalletSession;
use serde_json::{Map, Value};
use std::env;
use std::sync::Arc;
use tracing::{info, warn};

const USAGE: &str = "usage:
  icx-ledger status
  icx-ledger wallets [page]
  icx-ledger send <to> <amount-icx> [index]
  icx-ledger call <contract> <method> [json-params] [index]
  icx-ledger read <contract> <method> [json-params]";

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt::init();

    let args: Vec<String> = env::args().skip(1).collect();
    let Some(command) = args.first().map(String::as_str) else {
        println!("{}", USAGE);
        return Ok(());
    };

    let config = Config::from_env()?;
    info!(
        "Network {} (nid {:#x}) at {}",
        config.network_label, config.nid, config.endpoint
    );

    let device = DeviceSession::new(open_device()?, config.coin_type, config.device_timeout);
    let rpc = IconRpcClient::new(config.get_provider().await?);
    let session = WalletSession::new(config, Arc::new(device), Arc::new(rpc))
        .with_journal(OperationLog::open_default());

    match (command, &args[1..]) {
        ("status", _) => {
            let status = session.status().await;
            println!("{}", status.display_text());
            if status.is_ready() {
                match session.app_version().await {
                    Ok(version) => println!("ICX app {}", version),
                    Err(e) => warn!("Could not read the app version: {}", e),
                }
            }
        }
        ("wallets", rest) => {
            let page = parse_number(rest.first(), 1, "page")?;
            session.connect(true).await?;
            println!("Page {} under {}", page, session.config().derivation_prefix());
            for entry in session.load_page(page).await? {
                let balance = &entry.balance;
                let unstaking = balance
                    .unstaking
                    .map(|u| format!(" unstaking {}", u))
                    .unwrap_or_default();
                println!(
                    "{:>3}  {}  {}  liquid {} staked {}{}  total {}",
                    entry.derived.index,
                    entry.derived.path,
                    entry.derived.address,
                    balance.liquid,
                    balance.staked,
                    unstaking,
                    balance.total
                );
            }
        }
        ("send", [to, amount, rest @ ..]) => {
            let wallet = select_wallet(&session, rest.first()).await?;
            let hash = session.send_icx(&wallet, to, amount).await?;
            print_submitted(&session, &hash);
        }
        ("call", [contract, method, rest @ ..]) => {
            let params = parse_params(rest.first())?;
            let wallet = select_wallet(&session, rest.get(1)).await?;
            let hash = session.call_contract(&wallet, contract, method, params).await?;
            print_submitted(&session, &hash);
        }
        ("read", [contract, method, rest @ ..]) => {
            let params = parse_params(rest.first())?.map(Value::Object);
            let result = session.read_contract(contract, method, params).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => bail!("{}", USAGE),
    }
    Ok(())
}

#[cfg(feature = "hid")]
fn open_device() -> Result<Box<dyn SigningDevice>> {
    Ok(Box::new(icx_ledger::native_ledger::HidLedgerIcx::hid()))
}

#[cfg(not(feature = "hid"))]
fn open_device() -> Result<Box<dyn SigningDevice>> {
    Err(anyhow!("icx-ledger was built without Ledger support; rebuild with `--features hid`"))
}

/// Sender at `index` (default 0).
async fn select_wallet(session: &WalletSession, index: Option<&String>) -> Result<Wallet> {
    let index = parse_number(index, 0, "index")?;
    Ok(session.wallet_at(index).await?)
}

fn parse_number(raw: Option<&String>, default: u32, what: &str) -> Result<u32> {
    match raw {
        Some(raw) => raw.parse().with_context(|| format!("invalid {} '{}'", what, raw)),
        None => Ok(default),
    }
}

fn parse_params(raw: Option<&String>) -> Result<Option<Map<String, Value>>> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    match serde_json::from_str::<Value>(raw).context("params must be a JSON object")? {
        Value::Object(map) => Ok(Some(map)),
        Value::Null => Ok(None),
        other => Err(anyhow!("params must be a JSON object, got {}", other)),
    }
}

fn print_submitted(session: &WalletSession, hash: &str) {
    println!("Submitted {}", hash);
    if let Some(url) = get_tx_tracker_url(session.config().nid, hash) {
        println!("{}", url);
    }
}
