use std::fs;
use std::io::Write;

use anyhow::{anyhow, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use txsync_core::Address;

const ACCOUNTS_FILE: &str = "accounts.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedAccount {
    pub address: Address,
    #[serde(default)]
    pub label: Option<String>,
}

/// Accounts synced when a command names no address.
pub struct AccountBook {
    path: Utf8PathBuf,
}

impl AccountBook {
    pub fn new(data_dir: &Utf8Path) -> Self {
        Self {
            path: data_dir.join(ACCOUNTS_FILE),
        }
    }

    pub fn list(&self) -> Result<Vec<TrackedAccount>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&self.path).context("Failed to read accounts")?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn addresses(&self) -> Result<Vec<Address>> {
        Ok(self.list()?.into_iter().map(|a| a.address).collect())
    }

    pub fn add(&self, address: Address, label: Option<String>) -> Result<TrackedAccount> {
        let mut accounts = self.list()?;
        if accounts.iter().any(|a| a.address == address) {
            return Err(anyhow!("Account {address} is already tracked"));
        }
        let account = TrackedAccount {
            address,
            label: label.filter(|l| !l.trim().is_empty()),
        };
        accounts.push(account.clone());
        self.save(&accounts)?;
        Ok(account)
    }

    pub fn remove(&self, address: &Address) -> Result<()> {
        let mut accounts = self.list()?;
        let original_len = accounts.len();
        accounts.retain(|a| a.address != *address);
        if accounts.len() == original_len {
            return Err(anyhow!("Account {address} is not tracked"));
        }
        self.save(&accounts)
    }

    fn save(&self, accounts: &[TrackedAccount]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(accounts)?;
        atomic_write(&self.path, json.as_bytes()).context("Failed to write accounts")
    }
}

fn atomic_write(path: &Utf8Path, contents: &[u8]) -> Result<()> {
    let tmp_path = Utf8PathBuf::from(format!("{path}.tmp"));
    let mut file = fs::File::create(&tmp_path)
        .with_context(|| format!("Failed to create temp file {tmp_path}"))?;
    file.write_all(contents)
        .with_context(|| format!("Failed to write temp file {tmp_path}"))?;
    file.sync_all()
        .with_context(|| format!("Failed to sync temp file {tmp_path}"))?;
    drop(file);
    fs::rename(&tmp_path, path).with_context(|| format!("Failed to replace {path}"))
}

pub fn handle_list(data_dir: &Utf8Path) -> Result<()> {
    let accounts = AccountBook::new(data_dir).list()?;
    if accounts.is_empty() {
        println!("No tracked accounts.");
        return Ok(());
    }

    println!("{:<44} {:<24}", "ADDRESS", "LABEL");
    println!("{:-<44} {:-<24}", "", "");
    for a in accounts {
        println!("{:<44} {:<24}", a.address, a.label.unwrap_or_default());
    }
    Ok(())
}

pub fn handle_add(data_dir: &Utf8Path, address: Address, label: Option<String>) -> Result<()> {
    let account = AccountBook::new(data_dir).add(address, label)?;
    println!("Tracking {}.", account.address);
    Ok(())
}

pub fn handle_remove(data_dir: &Utf8Path, address: Address) -> Result<()> {
    AccountBook::new(data_dir).remove(&address)?;
    println!("Stopped tracking {address}.");
    Ok(())
}
