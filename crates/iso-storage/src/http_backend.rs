use std::io::Read;
use std::sync::atomic::Ordering;
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use iso_types::error::{IsoError, Result};
use iso_types::{Digest, Namespace};

use crate::http_util::{extract_content_length, parse_content_range};
use crate::retry::from_ureq;
use crate::{PushTicket, RemoteObjectStore, StorageConfig, TicketInner};

const PROTOCOL_VERSION: &str = "1.0";

/// Client for an isolate server speaking the handshake / pre-upload /
/// retrieve protocol.
///
/// The access token returned by `/handshake` is cached per instance and
/// fetched lazily on the first call that needs it.
pub struct IsolateServer {
    /// Base URL, e.g. "https://isolate.example.com"
    base_url: String,
    namespace: Namespace,
    agent: ureq::Agent,
    bearer: Option<String>,
    access_token: Mutex<Option<String>>,
}

#[derive(Serialize)]
struct HandshakeRequest<'a> {
    client_app_version: &'a str,
    fetcher: bool,
    protocol_version: &'a str,
    pusher: bool,
}

#[derive(Deserialize)]
struct HandshakeResponse {
    access_token: Option<String>,
    #[serde(default)]
    server_app_version: Option<String>,
}

#[derive(Serialize)]
struct PreUploadEntry<'a> {
    h: &'a str,
    s: Option<u64>,
    i: usize,
}

impl IsolateServer {
    pub fn new(cfg: &StorageConfig) -> Result<Self> {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(30))
            .timeout_read(Duration::from_secs(cfg.read_timeout_secs))
            .timeout_write(Duration::from_secs(cfg.read_timeout_secs))
            .build();

        let base = cfg.url.trim().trim_end_matches('/').to_string();

        Ok(Self {
            base_url: base,
            namespace: cfg.namespace.clone(),
            agent,
            bearer: cfg.token.clone(),
            access_token: Mutex::new(None),
        })
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn apply_auth(&self, req: ureq::Request) -> ureq::Request {
        if let Some(ref token) = self.bearer {
            req.set("Authorization", &format!("Bearer {token}"))
        } else {
            req
        }
    }

    /// Access token for `/pre-upload`, negotiating one on first use.
    fn token(&self) -> Result<String> {
        let mut guard = self.access_token.lock().unwrap();
        if let Some(ref token) = *guard {
            return Ok(token.clone());
        }
        let url = self.url("handshake");
        let body = HandshakeRequest {
            client_app_version: env!("CARGO_PKG_VERSION"),
            fetcher: true,
            protocol_version: PROTOCOL_VERSION,
            pusher: true,
        };
        let resp = self
            .apply_auth(self.agent.post(&url))
            .send_json(&body)
            .map_err(|e| from_ureq(e, "POST handshake"))?;
        let parsed: HandshakeResponse = resp
            .into_json()
            .map_err(|e| IsoError::Transport(format!("POST handshake: bad response: {e}")))?;
        let token = parsed.access_token.ok_or_else(|| {
            IsoError::Other(format!("{}: handshake returned no access_token", self.base_url))
        })?;
        debug!(
            server = %self.base_url,
            server_version = parsed.server_app_version.as_deref().unwrap_or("unknown"),
            "isolate server handshake complete"
        );
        *guard = Some(token.clone());
        Ok(token)
    }

    fn upload(&self, digest: &Digest, url: &str, use_post: bool, content: &[u8]) -> Result<()> {
        let url = self.url(url);
        let req = if use_post {
            self.agent.post(&url)
        } else {
            self.agent.put(&url)
        };
        self.apply_auth(req)
            .set("Content-Type", "application/octet-stream")
            .send_bytes(content)
            .map_err(|e| from_ureq(e, &format!("upload {}", digest.short())))?;
        Ok(())
    }

    fn finalize(&self, digest: &Digest, url: &str) -> Result<()> {
        let url = self.url(url);
        self.apply_auth(self.agent.post(&url))
            .send_json(serde_json::json!({}))
            .map_err(|e| from_ureq(e, &format!("finalize {}", digest.short())))?;
        Ok(())
    }
}

impl RemoteObjectStore for IsolateServer {
    fn location(&self) -> &str {
        &self.base_url
    }

    fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    fn contains(&self, digests: &[Digest]) -> Result<Vec<(usize, PushTicket)>> {
        if digests.is_empty() {
            return Ok(Vec::new());
        }
        let token = self.token()?;
        let url = self.url(&format!("pre-upload/{}", self.namespace));
        let body: Vec<PreUploadEntry<'_>> = digests
            .iter()
            .enumerate()
            .map(|(i, d)| PreUploadEntry {
                h: d.hex(),
                s: d.size(),
                i,
            })
            .collect();
        let resp = self
            .apply_auth(self.agent.post(&url))
            .query("token", &token)
            .send_json(&body)
            .map_err(|e| from_ureq(e, "POST pre-upload"))?;
        let tickets: Vec<Option<(String, Option<String>)>> = resp
            .into_json()
            .map_err(|e| IsoError::Transport(format!("POST pre-upload: bad response: {e}")))?;
        if tickets.len() != digests.len() {
            return Err(IsoError::Transport(format!(
                "POST pre-upload: got {} answers for {} digests",
                tickets.len(),
                digests.len()
            )));
        }
        Ok(tickets
            .into_iter()
            .enumerate()
            .filter_map(|(i, t)| t.map(|(up, fin)| (i, PushTicket::http(up, fin))))
            .collect())
    }

    fn push(&self, digest: &Digest, ticket: &PushTicket, content: &[u8]) -> Result<()> {
        let TicketInner::Http {
            upload_url,
            finalize_url,
            uploaded,
            finalized,
        } = &ticket.inner
        else {
            return Err(IsoError::Other(format!(
                "{}: push ticket was not issued by an isolate server",
                digest.short()
            )));
        };
        if !uploaded.load(Ordering::Acquire) {
            // Without a finalize step the upload URL accepts the content directly.
            self.upload(digest, upload_url, finalize_url.is_none(), content)?;
            uploaded.store(true, Ordering::Release);
        }
        if let Some(fin) = finalize_url {
            if !finalized.load(Ordering::Acquire) {
                self.finalize(digest, fin)?;
                finalized.store(true, Ordering::Release);
            }
        }
        Ok(())
    }

    fn fetch(&self, digest: &Digest, offset: u64) -> Result<Box<dyn Read + Send>> {
        let context = format!("GET retrieve {}", digest.short());
        let url = self.url(&format!("retrieve/{}/{}", self.namespace, digest.hex()));
        let mut req = self.apply_auth(self.agent.get(&url));
        if offset > 0 {
            req = req.set("Range", &format!("bytes={offset}-"));
        }
        let resp = req.call().map_err(|e| from_ureq(e, &context))?;
        if offset > 0 {
            let status = resp.status();
            if status == 200 {
                return Err(IsoError::Other(format!(
                    "{context}: server returned 200 instead of 206 (Range header ignored)"
                )));
            }
            let header = resp.header("Content-Range").ok_or_else(|| {
                IsoError::Other(format!(
                    "{context}: server returned {status} without Content-Range header"
                ))
            })?;
            let range = parse_content_range(header, &context)?;
            if range.start != offset {
                return Err(IsoError::Other(format!(
                    "{context}: Content-Range mismatch: got {header}, expected start {offset}"
                )));
            }
            let span = range.end - range.start + 1;
            let length = extract_content_length(&resp, &context)?;
            if length != span {
                return Err(IsoError::Transfer {
                    digest: digest.to_string(),
                    reason: format!(
                        "{context}: Content-Length {length} does not cover range {header}"
                    ),
                });
            }
        }
        Ok(Box::new(resp.into_reader()))
    }
}
