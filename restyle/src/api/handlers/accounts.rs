//! HTTP handlers for balances, the credit ledger and credit grants.

use crate::{
    AppState,
    api::models::{
        accounts::{AccountResponse, CreditGrantRequest, CreditGrantResponse, LedgerEntryResponse},
        pagination::Pagination,
    },
    auth::{AdminAccount, CurrentAccount},
    errors::{Error, ErrorBody, Result},
    metering::{GrantOutcome, Reconciliation},
};
use axum::{
    extract::{Path, Query, State, rejection::JsonRejection},
    http::StatusCode,
    response::Json,
};
use tracing::info;

/// Get the caller's balance
#[utoipa::path(
    get,
    path = "/account",
    tag = "account",
    summary = "Get balance",
    description = "Returns paid credits and free quota usage. The account is created on first use.",
    responses(
        (status = 200, description = "Current balance", body = AccountResponse),
        (status = 401, description = "Unauthorized", body = ErrorBody),
        (status = 500, description = "Internal server error", body = ErrorBody),
    ),
    security(("X-Restyle-Account" = []))
)]
#[tracing::instrument(skip_all, fields(account_id = %account.id))]
pub async fn get_account(State(state): State<AppState>, account: CurrentAccount) -> Result<Json<AccountResponse>> {
    let row = state.store.upsert_account(&account.id).await?;
    Ok(Json(AccountResponse::new(row, state.meter.pricing())))
}

/// List the caller's ledger entries, newest first
#[utoipa::path(
    get,
    path = "/account/ledger",
    tag = "account",
    summary = "List ledger entries",
    params(Pagination),
    responses(
        (status = 200, description = "Ledger entries", body = Vec<LedgerEntryResponse>),
        (status = 401, description = "Unauthorized", body = ErrorBody),
    ),
    security(("X-Restyle-Account" = []))
)]
#[tracing::instrument(skip_all, fields(account_id = %account.id))]
pub async fn list_ledger(
    State(state): State<AppState>,
    Query(pagination): Query<Pagination>,
    account: CurrentAccount,
) -> Result<Json<Vec<LedgerEntryResponse>>> {
    let entries = state
        .store
        .list_entries(&account.id, pagination.skip(), pagination.limit())
        .await?;
    Ok(Json(entries.into_iter().map(Into::into).collect()))
}

/// Compare the cached balance with the ledger
#[utoipa::path(
    get,
    path = "/account/reconciliation",
    tag = "account",
    summary = "Reconcile balance against the ledger",
    description = "Rebuilds the balance from the ledger and reports whether it matches the cached balance. Read-only.",
    responses(
        (status = 200, description = "Reconciliation report", body = Reconciliation),
        (status = 401, description = "Unauthorized", body = ErrorBody),
        (status = 404, description = "Account has never been used", body = ErrorBody),
    ),
    security(("X-Restyle-Account" = []))
)]
#[tracing::instrument(skip_all, fields(account_id = %account.id))]
pub async fn get_reconciliation(State(state): State<AppState>, account: CurrentAccount) -> Result<Json<Reconciliation>> {
    Ok(Json(state.meter.reconcile(&account.id).await?))
}

/// Grant paid credits to an account (admin)
#[utoipa::path(
    post,
    path = "/accounts/{account_id}/credits",
    tag = "admin",
    summary = "Grant credits",
    description = "Adds paid credits, at most once per `source_id`. A repeated `source_id` returns the original entry \
                   with `duplicate: true` and changes nothing.",
    params(
        ("account_id" = String, Path, description = "Account to credit"),
    ),
    request_body = CreditGrantRequest,
    responses(
        (status = 201, description = "Credits granted", body = CreditGrantResponse),
        (status = 200, description = "Source id already applied", body = CreditGrantResponse),
        (status = 400, description = "Amount is not positive", body = ErrorBody),
        (status = 401, description = "Unauthorized", body = ErrorBody),
        (status = 403, description = "Caller is not an admin", body = ErrorBody),
    ),
    security(("X-Restyle-Account" = []))
)]
#[tracing::instrument(skip_all, fields(admin = %admin.id, account_id = %account_id))]
pub async fn grant_credits(
    State(state): State<AppState>,
    Path(account_id): Path<String>,
    admin: AdminAccount,
    payload: std::result::Result<Json<CreditGrantRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<CreditGrantResponse>)> {
    let Json(data) = payload?;
    if data.source_id.trim().is_empty() {
        return Err(Error::BadRequest {
            message: "source_id must not be empty".to_string(),
        });
    }

    let outcome = state
        .meter
        .grant(&account_id, data.amount, &data.source_id, data.description)
        .await?;

    let (status, entry, duplicate) = match outcome {
        GrantOutcome::Granted { entry, .. } => (StatusCode::CREATED, entry, false),
        GrantOutcome::Duplicate { entry } => {
            info!(source_id = %data.source_id, "Grant already applied");
            (StatusCode::OK, entry, true)
        }
    };

    Ok((
        status,
        Json(CreditGrantResponse {
            account_id: entry.account_id.clone(),
            entry: entry.into(),
            duplicate,
        }),
    ))
}
