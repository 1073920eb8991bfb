use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::warn;

use super::session::AuthSession;

/// On-disk persistence for per-client sessions, one JSON file per client id.
///
/// This is what lets a browser session survive a server restart: the session
/// cookie still points at a client id, and the tokens for that id are read
/// back from disk and revalidated with the provider. A corrupt or unreadable
/// file is treated as "no cached session".
#[derive(Debug, Clone)]
pub struct TokenCache {
    dir: PathBuf,
}

impl TokenCache {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        TokenCache {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Client ids are URL-safe base64 from `gen_token`; anything else is
    /// flattened so an id can never escape the cache directory.
    fn path_for(&self, client_id: &str) -> PathBuf {
        let safe: String = client_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{safe}.json"))
    }

    pub fn save(&self, client_id: &str, session: &AuthSession) -> io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        let body = serde_json::to_vec_pretty(session)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        fs::write(self.path_for(client_id), body)
    }

    pub fn load(&self, client_id: &str) -> Option<AuthSession> {
        let path = self.path_for(client_id);
        let bytes = fs::read(&path).ok()?;
        match serde_json::from_slice::<AuthSession>(&bytes) {
            Ok(session) => Some(session),
            Err(e) => {
                warn!(target: "auth", path = %path.display(), "discarding unreadable token file: {e}");
                None
            }
        }
    }

    /// Remove the persisted tokens for `client_id`. Clearing an absent entry
    /// is a success; sign-out paths call this unconditionally.
    pub fn clear(&self, client_id: &str) -> io::Result<()> {
        match fs::remove_file(self.path_for(client_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::session::gen_token;
    use crate::profile::User;
    use chrono::Utc;

    fn sample_session() -> AuthSession {
        AuthSession {
            access_token: gen_token(),
            refresh_token: gen_token(),
            expires_at: Utc::now() + chrono::Duration::seconds(3600),
            user: User {
                id: "u-42".to_string(),
                email: "donor@example.org".to_string(),
            },
        }
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TokenCache::new(dir.path());
        let session = sample_session();
        cache.save("client-a", &session).unwrap();
        assert_eq!(cache.load("client-a"), Some(session));
        assert_eq!(cache.load("client-b"), None);
    }

    #[test]
    fn clear_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TokenCache::new(dir.path());
        cache.save("client-a", &sample_session()).unwrap();
        cache.clear("client-a").unwrap();
        assert_eq!(cache.load("client-a"), None);
        // second clear of the same id must also succeed
        cache.clear("client-a").unwrap();
        cache.clear("never-saved").unwrap();
    }

    #[test]
    fn corrupt_file_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TokenCache::new(dir.path());
        std::fs::create_dir_all(dir.path()).unwrap();
        std::fs::write(dir.path().join("client-a.json"), b"{not json").unwrap();
        assert_eq!(cache.load("client-a"), None);
    }

    #[test]
    fn hostile_client_ids_stay_inside_the_cache_dir() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TokenCache::new(dir.path());
        cache.save("../escape", &sample_session()).unwrap();
        assert!(dir.path().join("___escape.json").exists());
    }
}
