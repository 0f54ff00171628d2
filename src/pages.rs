//! Canned error responses, loaded once at startup.
//!
//! A page for status `NNN` is the file `NNN.http` inside the configured
//! directory and holds the complete response bytes, status line and all.
//! Missing files simply disable the canned response for that status.

use std::fmt;
use std::fs;
use std::path::Path;

use bytes::Bytes;
use http::StatusCode;
use tracing::{debug, warn};

const STATUS_BEGIN: u16 = 400;
const STATUS_END: u16 = 600;

pub struct ErrorPages {
    pages: Vec<Bytes>,
}

impl ErrorPages {
    /// Reads every `<status>.http` file in `dir`. This is the only blocking
    /// disk I/O in the process and runs before the reactor starts.
    pub fn load(dir: &Path) -> ErrorPages {
        let mut pages = Vec::with_capacity((STATUS_END - STATUS_BEGIN) as usize);
        let mut found = 0usize;
        for status in STATUS_BEGIN..STATUS_END {
            let path = dir.join(format!("{}.http", status));
            match fs::read(&path) {
                Ok(bytes) => {
                    debug!("loaded error page {} ({} bytes)", status, bytes.len());
                    found += 1;
                    pages.push(Bytes::from(bytes));
                }
                Err(_) => pages.push(Bytes::new()),
            }
        }
        if found == 0 {
            warn!("no error pages found in {}", dir.display());
        }
        ErrorPages { pages }
    }

    /// An empty table; every canned response is disabled.
    pub fn empty() -> ErrorPages {
        ErrorPages {
            pages: vec![Bytes::new(); (STATUS_END - STATUS_BEGIN) as usize],
        }
    }

    /// The page for `status`, if one was loaded and is non-empty.
    pub fn get(&self, status: StatusCode) -> Option<&Bytes> {
        let code = status.as_u16();
        if !(STATUS_BEGIN..STATUS_END).contains(&code) {
            return None;
        }
        let page = &self.pages[(code - STATUS_BEGIN) as usize];
        if page.is_empty() {
            None
        } else {
            Some(page)
        }
    }
}

impl fmt::Debug for ErrorPages {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let loaded = self.pages.iter().filter(|p| !p.is_empty()).count();
        f.debug_struct("ErrorPages").field("loaded", &loaded).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn load_skips_missing_files() {
        let dir = std::env::temp_dir().join(format!("spliced-pages-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("502.http"), b"HTTP/1.1 502 Bad Gateway\r\n\r\nbad").unwrap();
        fs::write(dir.join("504.http"), b"").unwrap();

        let pages = ErrorPages::load(&dir);
        assert!(pages.get(StatusCode::BAD_GATEWAY).is_some());
        // empty file behaves like a missing one
        assert!(pages.get(StatusCode::GATEWAY_TIMEOUT).is_none());
        assert!(pages.get(StatusCode::BAD_REQUEST).is_none());
        // out of table range
        assert!(pages.get(StatusCode::OK).is_none());

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn empty_table_disables_everything() {
        let pages = ErrorPages::empty();
        assert!(pages.get(StatusCode::BAD_GATEWAY).is_none());
    }
}
