use crate::{
    AppState,
    errors::{Error, Result},
};
use axum::{extract::FromRequestParts, http::request::Parts};
use tracing::{instrument, trace};

/// The account a request acts for, taken from the trusted proxy header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentAccount {
    pub id: String,
}

/// An account listed in `auth.admin_accounts`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminAccount {
    pub id: String,
}

fn account_from_header(parts: &Parts, header_name: &str) -> Option<String> {
    parts
        .headers
        .get(header_name)
        .and_then(|h| h.to_str().ok())
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}

impl FromRequestParts<AppState> for CurrentAccount {
    type Rejection = Error;

    #[instrument(skip(parts, state))]
    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self> {
        let header_name = &state.config.auth.proxy_header.header_name;
        match account_from_header(parts, header_name) {
            Some(id) => {
                trace!(account_id = %id, "Authenticated via proxy header");
                Ok(CurrentAccount { id })
            }
            None => Err(Error::Unauthenticated {
                message: Some(format!("Missing {header_name} header")),
            }),
        }
    }
}

impl FromRequestParts<AppState> for AdminAccount {
    type Rejection = Error;

    #[instrument(skip(parts, state))]
    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self> {
        let account = CurrentAccount::from_request_parts(parts, state).await?;
        if state.config.auth.admin_accounts.iter().any(|admin| admin == &account.id) {
            Ok(AdminAccount { id: account.id })
        } else {
            Err(Error::Forbidden {
                message: "Admin access required".to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{create_test_config, create_test_state};
    use axum::http::Request;

    async fn extract_current(header: Option<&str>) -> Result<CurrentAccount> {
        let state = create_test_state(create_test_config());
        let mut builder = Request::builder().uri("/api/account");
        if let Some(value) = header {
            builder = builder.header("x-restyle-account", value);
        }
        let (mut parts, _) = builder.body(()).unwrap().into_parts();
        CurrentAccount::from_request_parts(&mut parts, &state).await
    }

    #[tokio::test]
    async fn reads_proxy_header() {
        let account = extract_current(Some(" user_42 ")).await.unwrap();
        assert_eq!(account.id, "user_42");
    }

    #[tokio::test]
    async fn missing_or_blank_header_is_unauthenticated() {
        assert!(matches!(extract_current(None).await, Err(Error::Unauthenticated { .. })));
        assert!(matches!(extract_current(Some("  ")).await, Err(Error::Unauthenticated { .. })));
    }

    #[tokio::test]
    async fn admin_requires_listing() {
        let mut config = create_test_config();
        config.auth.admin_accounts = vec!["ops".to_string()];
        let state = create_test_state(config);

        let (mut parts, _) = Request::builder()
            .header("x-restyle-account", "ops")
            .body(())
            .unwrap()
            .into_parts();
        assert_eq!(AdminAccount::from_request_parts(&mut parts, &state).await.unwrap().id, "ops");

        let (mut parts, _) = Request::builder()
            .header("x-restyle-account", "someone")
            .body(())
            .unwrap()
            .into_parts();
        assert!(matches!(
            AdminAccount::from_request_parts(&mut parts, &state).await,
            Err(Error::Forbidden { .. })
        ));
    }
}
