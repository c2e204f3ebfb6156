//! Payment authorization: turn a 402 challenge into a proof.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;
use tracing::{debug, info};

use streamverse_core::payment::SCHEME_VOUCHER;
use streamverse_core::voucher;
use streamverse_core::{PaymentProof, PaymentRequirements};

#[derive(Error, Debug)]
pub enum WalletError {
    #[error("no acceptable payment option (offered: {0})")]
    Unsupported(String),
    #[error("price {price} exceeds per-chunk limit {limit}")]
    PriceTooHigh { price: u64, limit: u64 },
    #[error("budget exhausted: {spent} spent of {budget}")]
    BudgetExhausted { spent: u64, budget: u64 },
    #[error("key file error: {0}")]
    KeyFile(String),
}

/// A signed proof and the amount it commits to.
#[derive(Debug, Clone, PartialEq)]
pub struct Authorization {
    pub proof: PaymentProof,
    pub amount: u64,
}

#[async_trait]
pub trait Wallet: Send + Sync {
    /// Pick one of `accepts` and produce a proof for it.
    async fn authorize(&self, accepts: &[PaymentRequirements])
        -> Result<Authorization, WalletError>;
}

#[async_trait]
impl<T: Wallet + ?Sized> Wallet for Arc<T> {
    async fn authorize(
        &self,
        accepts: &[PaymentRequirements],
    ) -> Result<Authorization, WalletError> {
        (**self).authorize(accepts).await
    }
}

// ---------------------------------------------------------------------------
// Voucher wallet
// ---------------------------------------------------------------------------

/// Signs ed25519 vouchers. Optional limits cap the price of any one chunk
/// and the total committed over the wallet's lifetime.
pub struct VoucherWallet {
    key: SigningKey,
    max_price_per_chunk: Option<u64>,
    budget: Option<u64>,
    spent: Mutex<u64>,
}

impl std::fmt::Debug for VoucherWallet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoucherWallet")
            .field("payer", &self.payer())
            .field("max_price_per_chunk", &self.max_price_per_chunk)
            .field("budget", &self.budget)
            .finish()
    }
}

impl VoucherWallet {
    pub fn new(key: SigningKey) -> Self {
        Self {
            key,
            max_price_per_chunk: None,
            budget: None,
            spent: Mutex::new(0),
        }
    }

    pub fn generate() -> Self {
        Self::new(SigningKey::generate(&mut OsRng))
    }

    /// Load a key written by [`VoucherWallet::save_key_file`]: the 32-byte
    /// secret as hex.
    pub fn from_key_file(path: &Path) -> Result<Self, WalletError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| WalletError::KeyFile(format!("{}: {e}", path.display())))?;
        let secret: [u8; 32] = hex::decode(text.trim())
            .map_err(|e| WalletError::KeyFile(e.to_string()))?
            .try_into()
            .map_err(|_| WalletError::KeyFile("expected a 32-byte hex secret".into()))?;
        Ok(Self::new(SigningKey::from_bytes(&secret)))
    }

    pub fn save_key_file(&self, path: &Path) -> Result<(), WalletError> {
        std::fs::write(path, hex::encode(self.key.to_bytes()))
            .map_err(|e| WalletError::KeyFile(format!("{}: {e}", path.display())))
    }

    pub fn with_max_price_per_chunk(mut self, limit: u64) -> Self {
        self.max_price_per_chunk = Some(limit);
        self
    }

    pub fn with_budget(mut self, budget: u64) -> Self {
        self.budget = Some(budget);
        self
    }

    /// Hex verifying key; the `payer` on every voucher and receipt.
    pub fn payer(&self) -> String {
        hex::encode(self.key.verifying_key().to_bytes())
    }

    /// Total committed by proofs signed so far.
    pub fn spent(&self) -> u64 {
        *self.spent.lock().unwrap()
    }
}

#[async_trait]
impl Wallet for VoucherWallet {
    async fn authorize(
        &self,
        accepts: &[PaymentRequirements],
    ) -> Result<Authorization, WalletError> {
        let Some(req) = accepts.iter().find(|r| r.scheme == SCHEME_VOUCHER) else {
            let offered: Vec<&str> = accepts.iter().map(|r| r.scheme.as_str()).collect();
            return Err(WalletError::Unsupported(offered.join(", ")));
        };
        let price = req.max_amount_required;
        if let Some(limit) = self.max_price_per_chunk {
            if price > limit {
                return Err(WalletError::PriceTooHigh { price, limit });
            }
        }

        {
            let mut spent = self.spent.lock().unwrap();
            if let Some(budget) = self.budget {
                if spent.saturating_add(price) > budget {
                    return Err(WalletError::BudgetExhausted {
                        spent: *spent,
                        budget,
                    });
                }
            }
            *spent += price;
        }

        let mut nonce = [0u8; 32];
        OsRng.fill_bytes(&mut nonce);
        let proof = voucher::issue(&self.key, req, nonce);
        debug!(resource = %req.resource, amount = price, "signed voucher");
        Ok(Authorization {
            proof,
            amount: price,
        })
    }
}

/// Generate a key and write it to `path`. Returns the payer id.
pub fn keygen(path: &Path) -> Result<String, WalletError> {
    let wallet = VoucherWallet::generate();
    wallet.save_key_file(path)?;
    info!(path = %path.display(), payer = %wallet.payer(), "wrote voucher key");
    Ok(wallet.payer())
}
