use std::borrow::Cow;

use url::Url;

use crate::error::{RelayError, RelayResult};

/// Supplies the identifiers and credentials used to address the push server.
/// Values are treated as opaque strings.
pub trait AuthProvider: Send + Sync {
    fn access_token(&self) -> Option<String>;
    fn realm(&self) -> String;
    fn account_id(&self) -> String;
}

#[derive(Debug, Clone)]
pub struct StaticAuth {
    token: Option<String>,
    realm: String,
    account_id: String,
}

impl StaticAuth {
    pub fn new(realm: impl Into<String>, account_id: impl Into<String>) -> Self {
        Self {
            token: None,
            realm: realm.into(),
            account_id: account_id.into(),
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }
}

impl AuthProvider for StaticAuth {
    fn access_token(&self) -> Option<String> {
        self.token.clone()
    }

    fn realm(&self) -> String {
        self.realm.clone()
    }

    fn account_id(&self) -> String {
        self.account_id.clone()
    }
}

/// `{server}/realms/{realm}/accounts/{account}/push?access_token=...`
pub fn push_url(server: &Url, auth: &dyn AuthProvider) -> RelayResult<Url> {
    let realm = auth.realm();
    let account = auth.account_id();
    if realm.trim().is_empty() || account.trim().is_empty() {
        return Err(RelayError::Config(
            "realm and account id must not be empty".into(),
        ));
    }

    let base: Cow<'_, Url> = if server.path().ends_with('/') {
        Cow::Borrowed(server)
    } else {
        let mut owned = server.clone();
        owned.set_path(&format!("{}/", server.path()));
        Cow::Owned(owned)
    };
    let mut url = base.join(&format!("realms/{realm}/accounts/{account}/push"))?;
    if let Some(token) = auth.access_token() {
        url.query_pairs_mut().append_pair("access_token", &token);
    }
    Ok(url)
}
