use alloy_primitives::Address;
use alloy_signer_local::PrivateKeySigner;
use anyhow::{Context, Result};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tracing::{debug, info};

use crate::chain::{ChainClient, RpcChainClient};
use crate::config::HarnessConfig;
use crate::error::HarnessError;

/// An account a node runs as, with its keystore on disk
///
/// New accounts own a temporary data directory that is removed when the
/// account is dropped.
pub struct DevAccount {
    address: Address,
    datadir: PathBuf,
    keystore_dir: PathBuf,
    signer: PrivateKeySigner,
    is_new: bool,
    _tempdir: Option<TempDir>,
}

impl DevAccount {
    pub fn address(&self) -> Address {
        self.address
    }

    /// Node data directory; the keystore lives in `{datadir}/keystore`
    pub fn datadir(&self) -> &Path {
        &self.datadir
    }

    pub fn keystore_dir(&self) -> &Path {
        &self.keystore_dir
    }

    pub fn signer(&self) -> &PrivateKeySigner {
        &self.signer
    }

    /// Whether the account was created (and therefore funded) by the harness
    pub fn is_new(&self) -> bool {
        self.is_new
    }

    /// Reference for reusing this account on a later node
    ///
    /// The data directory must outlive that reuse: keep this account alive.
    pub fn to_existing(&self) -> ExistingAccount {
        ExistingAccount {
            address: self.address,
            datadir: self.datadir.clone(),
        }
    }
}

impl std::fmt::Debug for DevAccount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DevAccount")
            .field("address", &self.address)
            .field("datadir", &self.datadir)
            .field("is_new", &self.is_new)
            .finish()
    }
}

/// Account created on a previous run, to be reused as-is
#[derive(Debug, Clone)]
pub struct ExistingAccount {
    pub address: Address,
    pub datadir: PathBuf,
}

/// Account ready for a node, plus the chain client acting as it
pub struct ProvisionedAccount {
    pub account: DevAccount,
    pub chain: Arc<dyn ChainClient>,
}

/// Creates or reuses chain accounts, funds new ones and bootstraps rounds
pub struct AccountProvisioner {
    controller: Address,
    password: String,
    funding_amount: alloy_primitives::U256,
}

impl AccountProvisioner {
    pub fn new(config: &HarnessConfig) -> Self {
        Self {
            controller: config.controller_address,
            password: config.keystore_password.clone(),
            funding_amount: config.funding_amount_wei,
        }
    }

    /// Prepare the account, connect to the chain as it, then fund and bootstrap
    ///
    /// Any RPC or transaction error is returned as-is; none are retried.
    pub async fn provision(
        &self,
        rpc_uri: &str,
        existing: Option<&ExistingAccount>,
    ) -> Result<ProvisionedAccount> {
        let account = self.prepare_account(existing)?;

        let client = RpcChainClient::connect(rpc_uri, self.controller, Some(account.signer.clone()))
            .await
            .context("Failed to connect chain client")?
            .with_funding_amount(self.funding_amount);

        self.bootstrap(&client, &account).await?;

        Ok(ProvisionedAccount {
            account,
            chain: Arc::new(client),
        })
    }

    /// Create a fresh keystore account, or load the given existing one
    pub fn prepare_account(&self, existing: Option<&ExistingAccount>) -> Result<DevAccount> {
        match existing {
            None => self.create_account(),
            Some(existing) => self.load_account(existing),
        }
    }

    /// Fund a new account, then initialize the current round
    ///
    /// Existing accounts are never funded. Round initialization runs
    /// unconditionally; it is a no-op on an initialized round.
    pub async fn bootstrap<C>(&self, client: &C, account: &DevAccount) -> Result<()>
    where
        C: ChainClient + ?Sized,
    {
        if account.is_new {
            client
                .fund_account(account.address)
                .await
                .context("Failed to fund account")?;

            let balance = client
                .balance(account.address)
                .await
                .context("Failed to read balance after funding")?;
            if balance.is_zero() {
                anyhow::bail!("Funding did not credit account {}", account.address);
            }
            info!("Account {} funded, balance {} wei", account.address, balance);
        } else {
            debug!("Reusing existing account {} without funding", account.address);
        }

        client
            .initialize_round()
            .await
            .context("Failed to initialize round")?;

        Ok(())
    }

    fn create_account(&self) -> Result<DevAccount> {
        let tempdir = tempfile::Builder::new()
            .prefix("node-datadir-")
            .tempdir()
            .context("Failed to create node data directory")?;
        let datadir = tempdir.path().to_path_buf();
        let keystore_dir = datadir.join("keystore");
        fs::create_dir_all(&keystore_dir).context("Failed to create keystore directory")?;

        let mut rng = rand::thread_rng();
        let (signer, file_name) =
            PrivateKeySigner::new_keystore(&keystore_dir, &mut rng, &self.password, None)
                .map_err(|e| HarnessError::Keystore(e.to_string()))?;

        let address = signer.address();
        add_address_field(&keystore_dir.join(&file_name), address)?;

        info!("🔑 Created account {} in {}", address, keystore_dir.display());

        Ok(DevAccount {
            address,
            datadir,
            keystore_dir,
            signer,
            is_new: true,
            _tempdir: Some(tempdir),
        })
    }

    fn load_account(&self, existing: &ExistingAccount) -> Result<DevAccount> {
        let keystore_dir = existing.datadir.join("keystore");
        let key_file = find_key_file(&keystore_dir, existing.address)?;

        let signer = PrivateKeySigner::decrypt_keystore(&key_file, &self.password)
            .map_err(|e| HarnessError::Keystore(format!("{}: {}", key_file.display(), e)))?;

        if signer.address() != existing.address {
            return Err(HarnessError::Keystore(format!(
                "{} holds key for {}, expected {}",
                key_file.display(),
                signer.address(),
                existing.address
            ))
            .into());
        }

        info!("📂 Loaded existing account {} from {}", existing.address, key_file.display());

        Ok(DevAccount {
            address: existing.address,
            datadir: existing.datadir.clone(),
            keystore_dir,
            signer,
            is_new: false,
            _tempdir: None,
        })
    }
}

/// Geth-style keystore scanners index key files by their `address` field
fn add_address_field(path: &Path, address: Address) -> Result<()> {
    let contents = fs::read_to_string(path).context("Failed to read keystore file")?;
    let mut key: Value = serde_json::from_str(&contents).context("Failed to parse keystore JSON")?;

    let object = key
        .as_object_mut()
        .ok_or_else(|| HarnessError::Keystore("keystore file is not a JSON object".to_string()))?;
    object.insert(
        "address".to_string(),
        Value::String(hex::encode(address.as_slice())),
    );

    fs::write(path, serde_json::to_string(&key)?).context("Failed to write keystore file")?;
    Ok(())
}

fn find_key_file(keystore_dir: &Path, address: Address) -> Result<PathBuf> {
    let wanted = hex::encode(address.as_slice());
    let entries = fs::read_dir(keystore_dir)
        .with_context(|| format!("Failed to read keystore directory {}", keystore_dir.display()))?;

    for entry in entries {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let Ok(contents) = fs::read_to_string(&path) else {
            continue;
        };
        let Ok(key) = serde_json::from_str::<Value>(&contents) else {
            continue;
        };
        let matches = key["address"]
            .as_str()
            .map(|a| a.trim_start_matches("0x").eq_ignore_ascii_case(&wanted))
            .unwrap_or(false);
        if matches {
            return Ok(path);
        }
    }

    Err(HarnessError::Keystore(format!(
        "no key for {} in {}",
        address,
        keystore_dir.display()
    ))
    .into())
}
