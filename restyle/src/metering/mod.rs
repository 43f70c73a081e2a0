//! Credit metering: eligibility, charge, idempotent refund, grants and ledger reconciliation.
//!
//! A job is charged optimistically at submission and refunded if it never produces outputs.
//! The charge and its refund are the forward and compensating halves of one saga, correlated by
//! the job id in the ledger:
//!
//! | charge reason     | refund reason              | balance field |
//! |-------------------|----------------------------|---------------|
//! | `job_charge`      | `job_refund_failed`        | `credits`     |
//! | `free_quota_used` | `free_quota_refund_failed` | `free_used`   |
//!
//! The ledger carries at most one entry of each column per job (enforced by partial unique
//! indexes), so "has this job been refunded?" is a plain query and needs no lock.

use crate::{
    config::CreditsConfig,
    db::{
        errors::DbError,
        models::{
            accounts::AccountDBResponse,
            ledger::{LedgerEntryCreateDBRequest, LedgerEntryDBResponse, LedgerReason, ONE_REFUND_PER_JOB, SOURCE_ID_UNIQUE},
        },
    },
    store::{AccountStore, LedgerStore, SharedStore},
    types::{JobId, abbrev_uuid},
};
use metrics::counter;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, instrument, warn};
use utoipa::ToSchema;

/// Per-job price derived from configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pricing {
    /// Free image-units per account
    pub free_quota: i64,
    pub images_per_job: i64,
    pub unit_price: i64,
}

impl Pricing {
    pub fn cost_per_job(&self) -> i64 {
        self.images_per_job * self.unit_price
    }
}

impl From<&CreditsConfig> for Pricing {
    fn from(config: &CreditsConfig) -> Self {
        Self {
            free_quota: config.free_quota,
            images_per_job: config.images_per_job,
            unit_price: config.unit_price,
        }
    }
}

/// Which balance, if any, can pay for a job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eligibility {
    Free,
    Paid,
    Ineligible,
}

impl Eligibility {
    pub fn charge_mode(&self) -> Option<ChargeMode> {
        match self {
            Eligibility::Free => Some(ChargeMode::Free),
            Eligibility::Paid => Some(ChargeMode::Paid),
            Eligibility::Ineligible => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChargeMode {
    Free,
    Paid,
}

impl ChargeMode {
    pub fn reason(&self) -> LedgerReason {
        match self {
            ChargeMode::Free => LedgerReason::FreeQuotaUsed,
            ChargeMode::Paid => LedgerReason::JobCharge,
        }
    }
}

/// Free quota is preferred; paid credits are only considered once the quota cannot cover `cost`.
pub fn decide_eligibility(account: &AccountDBResponse, cost: i64, free_quota: i64) -> Eligibility {
    if account.free_used + cost <= free_quota {
        Eligibility::Free
    } else if account.credits >= cost {
        Eligibility::Paid
    } else {
        Eligibility::Ineligible
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefundOutcome {
    /// A refund entry already exists for the job; nothing was changed
    AlreadyRefunded,
    /// No charge entry exists for the job; nothing was changed
    NotCharged,
    Refunded { reason: LedgerReason, amount: i64 },
}

impl RefundOutcome {
    pub fn is_refunded(&self) -> bool {
        matches!(self, RefundOutcome::Refunded { .. })
    }
}

#[derive(Debug, Clone)]
pub enum GrantOutcome {
    Granted {
        entry: LedgerEntryDBResponse,
        account: AccountDBResponse,
    },
    /// The source id was already applied; the existing entry is returned
    Duplicate { entry: LedgerEntryDBResponse },
}

/// Cached balance compared with the projection rebuilt from the ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Reconciliation {
    pub account_id: String,
    pub cached_credits: i64,
    pub cached_free_used: i64,
    pub ledger_credits: i64,
    pub ledger_free_used: i64,
    pub consistent: bool,
}

#[derive(Debug, Error)]
pub enum MeteringError {
    #[error("insufficient credits for a {mode:?} charge of {cost}")]
    InsufficientCredits { mode: ChargeMode, cost: i64 },

    #[error("account {0} not found")]
    AccountNotFound(String),

    #[error("invalid amount {0}")]
    InvalidAmount(i64),

    #[error(transparent)]
    Database(#[from] DbError),
}

pub type Result<T> = std::result::Result<T, MeteringError>;

#[derive(Clone)]
pub struct CreditMeter {
    store: SharedStore,
    pricing: Pricing,
}

impl CreditMeter {
    pub fn new(store: SharedStore, pricing: Pricing) -> Self {
        Self { store, pricing }
    }

    pub fn pricing(&self) -> &Pricing {
        &self.pricing
    }

    pub fn decide_eligibility(&self, account: &AccountDBResponse, cost: i64) -> Eligibility {
        decide_eligibility(account, cost, self.pricing.free_quota)
    }

    /// Debit `cost` from the balance selected by `mode` and record the charge.
    ///
    /// The balance update carries its own guard, so two concurrent charges cannot both pass an
    /// eligibility check made earlier. If the ledger insert fails after the debit, the debit is
    /// reverted before the error is returned.
    #[instrument(skip(self), fields(job_id = %abbrev_uuid(&job_id)), err)]
    pub async fn charge(&self, account_id: &str, job_id: JobId, cost: i64, mode: ChargeMode) -> Result<LedgerEntryDBResponse> {
        let debited = match mode {
            ChargeMode::Free => self.store.adjust_free_used(account_id, cost, Some(self.pricing.free_quota)).await?,
            ChargeMode::Paid => self.store.adjust_credits(account_id, -cost).await?,
        };
        if debited.is_none() {
            return Err(MeteringError::InsufficientCredits { mode, cost });
        }

        let request = LedgerEntryCreateDBRequest::charge(account_id.to_string(), job_id, mode.reason(), cost);
        match self.store.insert_entry(&request).await {
            Ok(entry) => {
                counter!("restyle_charges_total", "mode" => mode.reason().as_str()).increment(1);
                Ok(entry)
            }
            Err(e) => {
                let reverted = match mode {
                    ChargeMode::Free => self.store.adjust_free_used(account_id, -cost, None).await,
                    ChargeMode::Paid => self.store.adjust_credits(account_id, cost).await,
                };
                if let Err(revert_err) = reverted {
                    counter!("restyle_ledger_faults_total", "phase" => "charge_revert").increment(1);
                    error!(error = %revert_err, "Failed to revert debit after ledger insert failure");
                }
                Err(e.into())
            }
        }
    }

    /// Reverse a job's charge if there is one and it has not been reversed yet.
    ///
    /// Both ledger reads are fresh on every call. The refund entry is written before the balance
    /// is credited; the per-job refund index turns a concurrent duplicate into
    /// [`RefundOutcome::AlreadyRefunded`] so the balance is credited at most once. The amount
    /// returned is the one recorded on the charge entry.
    #[instrument(skip(self), fields(job_id = %abbrev_uuid(&job_id)), err)]
    pub async fn refund_if_charged(&self, account_id: &str, job_id: JobId, cost: i64) -> Result<RefundOutcome> {
        if self.store.find_job_entry(account_id, job_id, &LedgerReason::REFUNDS).await?.is_some() {
            info!("Job already refunded");
            return Ok(RefundOutcome::AlreadyRefunded);
        }

        let Some(charge) = self.store.find_job_entry(account_id, job_id, &LedgerReason::CHARGES).await? else {
            info!("Job was never charged, nothing to refund");
            return Ok(RefundOutcome::NotCharged);
        };
        let Some(reason) = charge.reason.refund_reason() else {
            return Ok(RefundOutcome::NotCharged);
        };

        let amount = -charge.delta;
        if amount != cost {
            warn!(charged = amount, expected = cost, "Charge amount differs from current cost, refunding the charged amount");
        }

        let request = LedgerEntryCreateDBRequest::refund(account_id.to_string(), job_id, reason, amount);
        match self.store.insert_entry(&request).await {
            Ok(_) => {}
            Err(e) if e.is_unique_violation(Some(ONE_REFUND_PER_JOB)) => {
                info!("Concurrent refund already recorded");
                return Ok(RefundOutcome::AlreadyRefunded);
            }
            Err(e) => return Err(e.into()),
        }

        let credited = match reason {
            LedgerReason::FreeQuotaRefundFailed => self.store.adjust_free_used(account_id, -amount, None).await,
            _ => self.store.adjust_credits(account_id, amount).await,
        };
        match credited {
            Ok(Some(_)) => {}
            Ok(None) => {
                counter!("restyle_ledger_faults_total", "phase" => "refund_balance").increment(1);
                error!("Refund recorded but account row is missing");
                return Err(MeteringError::AccountNotFound(account_id.to_string()));
            }
            Err(e) => {
                counter!("restyle_ledger_faults_total", "phase" => "refund_balance").increment(1);
                error!(error = %e, "Refund recorded but balance update failed");
                return Err(e.into());
            }
        }

        counter!("restyle_refunds_total", "reason" => reason.as_str()).increment(1);
        info!(%reason, amount, "Refunded job charge");
        Ok(RefundOutcome::Refunded { reason, amount })
    }

    /// Add paid credits, at most once per `source_id`
    #[instrument(skip(self, description), err)]
    pub async fn grant(&self, account_id: &str, amount: i64, source_id: &str, description: Option<String>) -> Result<GrantOutcome> {
        if amount <= 0 {
            return Err(MeteringError::InvalidAmount(amount));
        }
        if let Some(entry) = self.store.find_entry_by_source(source_id).await? {
            return Ok(GrantOutcome::Duplicate { entry });
        }

        self.store.upsert_account(account_id).await?;
        let request = LedgerEntryCreateDBRequest::grant(account_id.to_string(), amount, source_id.to_string(), description);
        let entry = match self.store.insert_entry(&request).await {
            Ok(entry) => entry,
            Err(e) if e.is_unique_violation(Some(SOURCE_ID_UNIQUE)) => {
                let entry = self.store.find_entry_by_source(source_id).await?.ok_or(DbError::NotFound)?;
                return Ok(GrantOutcome::Duplicate { entry });
            }
            Err(e) => return Err(e.into()),
        };

        let account = self
            .store
            .adjust_credits(account_id, amount)
            .await?
            .ok_or_else(|| MeteringError::AccountNotFound(account_id.to_string()))?;

        info!(amount, "Granted credits");
        Ok(GrantOutcome::Granted { entry, account })
    }

    /// Rebuild the balance projection from the ledger and compare it with the cached fields
    #[instrument(skip(self), err)]
    pub async fn reconcile(&self, account_id: &str) -> Result<Reconciliation> {
        let account = self
            .store
            .get_account(account_id)
            .await?
            .ok_or_else(|| MeteringError::AccountNotFound(account_id.to_string()))?;

        let mut ledger_credits = 0;
        let mut free_delta = 0;
        for (reason, total) in self.store.ledger_totals(account_id).await? {
            match reason {
                LedgerReason::CreditGrant | LedgerReason::JobCharge | LedgerReason::JobRefundFailed => ledger_credits += total,
                LedgerReason::FreeQuotaUsed | LedgerReason::FreeQuotaRefundFailed => free_delta += total,
            }
        }
        let ledger_free_used = (-free_delta).max(0);

        let consistent = ledger_credits == account.credits && ledger_free_used == account.free_used;
        if !consistent {
            warn!(
                cached_credits = account.credits,
                ledger_credits,
                cached_free_used = account.free_used,
                ledger_free_used,
                "Account balance drifted from ledger"
            );
        }

        Ok(Reconciliation {
            account_id: account.id,
            cached_credits: account.credits,
            cached_free_used: account.free_used,
            ledger_credits,
            ledger_free_used,
            consistent,
        })
    }
}
