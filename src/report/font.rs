use std::path::PathBuf;

use anyhow::Result;

use crate::storage::LocalStore;

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

pub const FONT_CACHE_KEY: &str = "noto-sans-sc";

const REMOTE_NOTO_SANS_SC: &str =
    "https://unpkg.com/@fontsource/noto-sans-sc/files/noto-sans-sc-chinese-simplified-400-normal.ttf";

/// Outcome of the CJK font resolution, decided once per document. Cache hits
/// count as local loads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FontState {
    Unloaded,
    LoadedLocal,
    LoadedRemote,
    Unavailable,
}

impl FontState {
    /// Whether the document renders CJK labels.
    pub fn has_cjk(self) -> bool {
        matches!(self, FontState::LoadedLocal | FontState::LoadedRemote)
    }
}

/// Candidate font sources, tried in order: local files first, then remote
/// URLs.
#[derive(Debug, Clone)]
pub struct FontSources {
    pub local: Vec<PathBuf>,
    pub remote: Vec<String>,
}

impl Default for FontSources {
    fn default() -> Self {
        Self {
            local: vec![PathBuf::from("fonts/NotoSansSC-Regular.ttf")],
            remote: vec![REMOTE_NOTO_SANS_SC.to_string()],
        }
    }
}

impl FontSources {
    /// No sources at all; resolution lands on `Unavailable` immediately.
    /// Used by tests and by callers that want Latin-only output.
    pub fn none() -> Self {
        Self {
            local: Vec::new(),
            remote: Vec::new(),
        }
    }
}

/// Resolves the CJK font through the fallback chain, caching the payload in
/// memory for the session and on disk through the local store.
pub struct FontResolver {
    sources: FontSources,
    session_cache: Option<Vec<u8>>,
}

impl FontResolver {
    pub fn new(sources: FontSources) -> Self {
        Self {
            sources,
            session_cache: None,
        }
    }

    pub async fn resolve(
        &mut self,
        store: Option<&LocalStore>,
        client: &reqwest::Client,
    ) -> (FontState, Option<Vec<u8>>) {
        if let Some(bytes) = &self.session_cache {
            return (FontState::LoadedLocal, Some(bytes.clone()));
        }

        if let Some(store) = store {
            if let Some(bytes) = store.load_cached_font(FONT_CACHE_KEY) {
                if looks_like_font(&bytes) {
                    self.session_cache = Some(bytes.clone());
                    return (FontState::LoadedLocal, Some(bytes));
                }
                log_warn!("cached font payload is not a usable font, refetching");
            }
        }

        for path in &self.sources.local {
            match std::fs::read(path) {
                Ok(bytes) if looks_like_font(&bytes) => {
                    self.remember(store, &bytes);
                    return (FontState::LoadedLocal, Some(bytes));
                }
                Ok(_) => log_warn!("{} is not a usable font file", path.display()),
                Err(err) => log_info!("local font {} unavailable: {err}", path.display()),
            }
        }

        for url in &self.sources.remote {
            match fetch_remote(client, url).await {
                Ok(bytes) if looks_like_font(&bytes) => {
                    self.remember(store, &bytes);
                    return (FontState::LoadedRemote, Some(bytes));
                }
                Ok(_) => log_warn!("remote font {url} returned a non-font payload"),
                Err(err) => log_warn!("font fetch failed for {url}: {err:?}"),
            }
        }

        log_warn!("CJK font unavailable, falling back to builtin Latin font");
        (FontState::Unavailable, None)
    }

    fn remember(&mut self, store: Option<&LocalStore>, bytes: &[u8]) {
        self.session_cache = Some(bytes.to_vec());
        if let Some(store) = store {
            store.store_cached_font(FONT_CACHE_KEY, bytes);
        }
    }
}

async fn fetch_remote(client: &reqwest::Client, url: &str) -> Result<Vec<u8>> {
    let bytes = client
        .get(url)
        .send()
        .await?
        .error_for_status()?
        .bytes()
        .await?;
    Ok(bytes.to_vec())
}

// TTF/OTF/TTC magic numbers.
fn looks_like_font(bytes: &[u8]) -> bool {
    bytes.len() > 4
        && matches!(
            &bytes[..4],
            b"\x00\x01\x00\x00" | b"OTTO" | b"true" | b"ttcf"
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("corroscan-font-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    const FAKE_TTF: &[u8] = b"\x00\x01\x00\x00rest-of-font";

    #[tokio::test]
    async fn no_sources_resolves_unavailable() {
        let mut resolver = FontResolver::new(FontSources::none());
        let client = reqwest::Client::new();
        let (state, bytes) = resolver.resolve(None, &client).await;
        assert_eq!(state, FontState::Unavailable);
        assert!(bytes.is_none());
        assert!(!state.has_cjk());
    }

    #[tokio::test]
    async fn local_file_wins_and_is_cached_for_the_session() {
        let dir = temp_dir();
        let font_path = dir.join("cjk.ttf");
        std::fs::write(&font_path, FAKE_TTF).unwrap();

        let mut resolver = FontResolver::new(FontSources {
            local: vec![font_path.clone()],
            remote: Vec::new(),
        });
        let client = reqwest::Client::new();

        let (state, bytes) = resolver.resolve(None, &client).await;
        assert_eq!(state, FontState::LoadedLocal);
        assert_eq!(bytes.as_deref(), Some(FAKE_TTF));

        // Session cache answers even after the file disappears.
        std::fs::remove_file(&font_path).unwrap();
        let (state, bytes) = resolver.resolve(None, &client).await;
        assert_eq!(state, FontState::LoadedLocal);
        assert_eq!(bytes.as_deref(), Some(FAKE_TTF));
    }

    #[tokio::test]
    async fn disk_cache_is_preferred_over_sources() {
        let dir = temp_dir();
        let store = LocalStore::new(dir.join("store.json")).unwrap();
        store.store_cached_font(FONT_CACHE_KEY, FAKE_TTF);

        let mut resolver = FontResolver::new(FontSources::none());
        let client = reqwest::Client::new();
        let (state, bytes) = resolver.resolve(Some(&store), &client).await;
        assert_eq!(state, FontState::LoadedLocal);
        assert_eq!(bytes.as_deref(), Some(FAKE_TTF));
    }

    #[tokio::test]
    async fn garbage_in_disk_cache_is_ignored() {
        let dir = temp_dir();
        let store = LocalStore::new(dir.join("store.json")).unwrap();
        store.store_cached_font(FONT_CACHE_KEY, b"<html>not a font</html>");

        let mut resolver = FontResolver::new(FontSources::none());
        let client = reqwest::Client::new();
        let (state, _) = resolver.resolve(Some(&store), &client).await;
        assert_eq!(state, FontState::Unavailable);
    }
}
