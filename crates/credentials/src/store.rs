use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use jiff::Timestamp;
use secrecy::SecretString;
use tokio::sync::RwLock;

use crate::{Credential, CredentialError, TokenRefresher};

/// File-backed credential store.
///
/// The in-memory snapshot is the source of truth between loads; writes go
/// through [`persist`](Self::persist) which rewrites the whole file with
/// owner-only permissions.
#[derive(Clone)]
pub struct CredentialStore {
    path: PathBuf,
    credentials: Arc<RwLock<BTreeMap<String, Vec<Credential>>>>,
    refresher: Option<Arc<dyn TokenRefresher>>,
}

impl CredentialStore {
    /// Load the store from a specific file. A missing file yields an empty store.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, CredentialError> {
        let path = path.into();

        let credentials = match std::fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path,
            credentials: Arc::new(RwLock::new(credentials)),
            refresher: None,
        })
    }

    /// Load from the default location, `~/.llmux/auth.json`.
    pub fn load_default() -> Result<Self, CredentialError> {
        let path = dirs::home_dir()
            .map(|home| home.join(".llmux").join("auth.json"))
            .unwrap_or_else(|| PathBuf::from(".llmux/auth.json"));

        Self::load_from(path)
    }

    /// Attach a token refresher used by [`ensure_fresh`](Self::ensure_fresh).
    pub fn with_refresher(mut self, refresher: Arc<dyn TokenRefresher>) -> Self {
        self.refresher = Some(refresher);
        self
    }

    /// First credential configured for a provider.
    pub async fn get_credential(&self, provider: &str) -> Option<Credential> {
        self.credentials.read().await.get(provider)?.first().cloned()
    }

    /// Access token of the first credential for a provider.
    pub async fn get_access_token(&self, provider: &str) -> Option<SecretString> {
        self.get_credential(provider).await.map(|c| c.access_token())
    }

    /// Snapshot of every provider's ordered credential list.
    pub async fn get_all_credentials(&self) -> BTreeMap<String, Vec<Credential>> {
        self.credentials.read().await.clone()
    }

    /// Ordered credentials for a provider, refreshing expiring OAuth tokens first.
    ///
    /// A credential whose refresh fails is returned as-is; the upstream will
    /// reject it and the rotation layer moves on to the next account.
    pub async fn ensure_fresh(&self, provider: &str) -> Vec<Credential> {
        let snapshot = {
            let guard = self.credentials.read().await;
            guard.get(provider).cloned().unwrap_or_default()
        };

        let now = Timestamp::now();

        if !snapshot.iter().any(|c| c.needs_refresh(now)) {
            return snapshot;
        }

        let Some(refresher) = self.refresher.clone() else {
            log::warn!("Credentials for '{provider}' are expiring but no token refresher is configured");
            return snapshot;
        };

        let mut refreshed = Vec::with_capacity(snapshot.len());
        let mut changed = false;

        for credential in snapshot {
            if !credential.needs_refresh(now) {
                refreshed.push(credential);
                continue;
            }

            match refresher.refresh(provider, &credential).await {
                Ok(fresh) => {
                    changed = true;
                    refreshed.push(fresh);
                }
                Err(e) => {
                    log::warn!("Failed to refresh credential for '{provider}': {e}");
                    refreshed.push(credential);
                }
            }
        }

        if changed {
            let mut guard = self.credentials.write().await;
            guard.insert(provider.to_string(), refreshed.clone());

            if let Err(e) = persist(&self.path, &guard) {
                log::error!("Failed to persist refreshed credentials: {e}");
            }
        }

        refreshed
    }
}

fn persist(path: &Path, credentials: &BTreeMap<String, Vec<Credential>>) -> Result<(), CredentialError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let content = serde_json::to_string_pretty(credentials)?;
    std::fs::write(path, content)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticRefresher;

    #[async_trait::async_trait]
    impl TokenRefresher for StaticRefresher {
        async fn refresh(&self, _provider: &str, _credential: &Credential) -> anyhow::Result<Credential> {
            Ok(Credential::Oauth {
                access_token: "fresh".into(),
                refresh_token: "rt".into(),
                expires_at: Timestamp::now().as_millisecond() + 3_600_000,
                email: None,
                account_id: None,
                project_id: None,
                quota_project_id: None,
            })
        }
    }

    #[tokio::test]
    async fn missing_file_yields_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::load_from(dir.path().join("auth.json")).unwrap();

        assert!(store.get_credential("openai").await.is_none());
        assert!(store.get_all_credentials().await.is_empty());
    }

    #[tokio::test]
    async fn reads_ordered_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auth.json");

        std::fs::write(
            &path,
            r#"{"openai":[{"type":"api","key":"sk-first"},{"type":"api","key":"sk-second"}]}"#,
        )
        .unwrap();

        let store = CredentialStore::load_from(&path).unwrap();
        let all = store.get_all_credentials().await;

        assert_eq!(all["openai"].len(), 2);

        let first = store.get_credential("openai").await.unwrap();
        assert!(matches!(first, Credential::Api { key } if key == "sk-first"));
    }

    #[tokio::test]
    async fn ensure_fresh_refreshes_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auth.json");

        std::fs::write(
            &path,
            r#"{"antigravity":[{"type":"oauth","accessToken":"old","refreshToken":"rt","expiresAt":0}]}"#,
        )
        .unwrap();

        let store = CredentialStore::load_from(&path)
            .unwrap()
            .with_refresher(Arc::new(StaticRefresher));

        let creds = store.ensure_fresh("antigravity").await;
        assert_eq!(creds.len(), 1);
        assert!(matches!(&creds[0], Credential::Oauth { access_token, .. } if access_token == "fresh"));

        // The refreshed token must hit the disk copy too.
        let reloaded = CredentialStore::load_from(&path).unwrap();
        let on_disk = reloaded.get_credential("antigravity").await.unwrap();
        assert!(matches!(on_disk, Credential::Oauth { access_token, .. } if access_token == "fresh"));
    }
}
