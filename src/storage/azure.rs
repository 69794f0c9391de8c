//! Azure Blob Storage backend.
//!
//! Writes stage blocks against the blob service and commit them with a
//! block-list call when the file is closed; nothing is visible before
//! commit. Credentials resolve from the environment first (account key,
//! then SAS token) with an `az` CLI access token as the last resort.

use std::collections::HashMap;
use std::process::Command;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use hmac::{Hmac, Mac};
use log::{debug, warn};
use reqwest::StatusCode;
use reqwest::blocking::{Client, Response};
use serde::Deserialize;
use sha2::Sha256;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc2822;

use crate::error::{GridError, GridResult};
use crate::storage::{BufferSizes, StorageBackend, locate_ca_certs, slashify, unslashify};
use crate::uri::AzureUri;

const BACKEND: &str = "azure";
const MS_VERSION: &str = "2019-12-12";
/// A blob holds at most this many staged blocks.
const MAX_BLOCKS_PER_BLOB: usize = 50_000;
const DEFAULT_BLOCK_SIZE: usize = 8 * 1024 * 1024;
const MAX_BLOCK_SIZE: usize = 100 * 1024 * 1024;
const BLOCK_GRAIN: usize = 4 * 1024 * 1024;
/// Reads up to this size use one streamed GET; larger reads fan out
/// into parallel ranged GETs. Overridden by `TILEDB_MAX_STREAM_SIZE`.
const DEFAULT_MAX_STREAM_SIZE: usize = 1024;

/// How the backend authenticates against the blob service.
pub enum AzureCredentials {
    /// Account shared key (base64), used to sign every request.
    SharedKey {
        /// The decoded account key.
        key: Vec<u8>,
    },
    /// A shared-access-signature token (the query-string form).
    SasToken(String),
    /// A bearer token, e.g. minted by the `az` CLI.
    BearerToken(String),
}

struct StagedBlocks {
    block_ids: Vec<String>,
}

/// Azure Blob Storage backend for one `container@account` pair.
pub struct AzureBlobFs {
    client: Client,
    endpoint: String,
    account: String,
    container: String,
    credentials: AzureCredentials,
    working_dir: String,
    write_map: Mutex<HashMap<String, StagedBlocks>>,
    sizes: BufferSizes,
    max_stream_size: usize,
}

fn env_nonempty(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn run_command(program: &str, args: &[&str]) -> Option<String> {
    let out = Command::new(program).args(args).output().ok()?;
    if !out.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&out.stdout).trim().to_string();
    if text.is_empty() { None } else { Some(text) }
}

/// Account key from the environment, honoring `AZURE_STORAGE_ACCOUNT`
/// when it names a different account, with the `az` CLI as fallback.
fn get_account_key(account: &str) -> Option<String> {
    let env_account = env_nonempty("AZURE_STORAGE_ACCOUNT");
    if env_account.is_none() || env_account.as_deref() == Some(account) {
        if let Some(key) = env_nonempty("AZURE_STORAGE_KEY") {
            return Some(key);
        }
    }
    let keys = run_command(
        "az",
        &["storage", "account", "keys", "list", "-o", "tsv", "--account-name", account],
    )?;
    keys.lines()
        .find_map(|line| line.strip_prefix("key1\tFULL\t"))
        .map(str::to_string)
}

fn get_sas_token(account: &str) -> Option<String> {
    let env_account = env_nonempty("AZURE_STORAGE_ACCOUNT");
    if env_account.is_none() || env_account.as_deref() == Some(account) {
        return env_nonempty("AZURE_STORAGE_SAS_TOKEN");
    }
    None
}

fn get_access_token(account: &str) -> Option<String> {
    let resource = format!("https://{account}.blob.core.windows.net");
    run_command(
        "az",
        &["account", "get-access-token", "--resource", &resource, "-o", "tsv", "--query", "accessToken"],
    )
}

fn build_client() -> GridResult<Client> {
    let mut builder = Client::builder();
    if let Some(bundle) = locate_ca_certs() {
        match std::fs::read(&bundle) {
            Ok(pem) => match reqwest::Certificate::from_pem_bundle(&pem) {
                Ok(certs) => {
                    for cert in certs {
                        builder = builder.add_root_certificate(cert);
                    }
                }
                Err(e) => warn!("ignoring unreadable CA bundle {}: {e}", bundle.display()),
            },
            Err(e) => warn!("ignoring unreadable CA bundle {}: {e}", bundle.display()),
        }
    }
    builder.build().map_err(|e| GridError::Auth {
        backend: BACKEND,
        reason: format!("could not build HTTP client: {e}"),
    })
}

impl AzureBlobFs {
    /// Connects using the credential ladder: account key, SAS token,
    /// then a CLI-minted access token. Fails with [`GridError::Auth`]
    /// when nothing authenticates or the container is unreachable.
    pub fn connect(home: &str) -> GridResult<Self> {
        let uri = AzureUri::parse(home)?;
        if uri.account().is_empty() || uri.container().is_empty() {
            return Err(GridError::InvalidUri {
                uri: home.to_string(),
                reason: "Azure URI needs both an account and a container".to_string(),
            });
        }

        let account = uri.account().to_string();
        let credentials = if let Some(key) = get_account_key(&account) {
            let key = BASE64.decode(key.as_bytes()).map_err(|e| GridError::Auth {
                backend: BACKEND,
                reason: format!("account key is not valid base64: {e}"),
            })?;
            AzureCredentials::SharedKey { key }
        } else if let Some(token) = get_sas_token(&account) {
            AzureCredentials::SasToken(token.trim_start_matches('?').to_string())
        } else if let Some(token) = get_access_token(&account) {
            AzureCredentials::BearerToken(token)
        } else {
            return Err(GridError::Auth {
                backend: BACKEND,
                reason: format!(
                    "no credentials for account {account}; set AZURE_STORAGE_KEY or \
                     AZURE_STORAGE_SAS_TOKEN"
                ),
            });
        };

        let endpoint = env_nonempty("AZURE_BLOB_ENDPOINT")
            .or_else(|| Some(uri.endpoint().to_string()).filter(|e| !e.is_empty()))
            .unwrap_or_else(|| format!("{account}.blob.core.windows.net"));
        let endpoint = if endpoint.contains("://") {
            unslashify(&endpoint)
        } else {
            format!("https://{}", unslashify(&endpoint))
        };

        let mut fs = Self::with_credentials(&endpoint, &account, uri.container(), credentials)?;
        // The backend serves existing containers only.
        fs.list_blobs("", None, Some(1))?;
        let working_dir = fs.get_path(uri.path());
        fs.working_dir = working_dir;
        Ok(fs)
    }

    /// Builds a backend against an explicit endpoint without probing the
    /// container; the caller vouches for it.
    pub fn with_credentials(
        endpoint: &str,
        account: &str,
        container: &str,
        credentials: AzureCredentials,
    ) -> GridResult<Self> {
        Ok(Self {
            client: build_client()?,
            endpoint: unslashify(endpoint),
            account: account.to_string(),
            container: container.to_string(),
            credentials,
            working_dir: String::new(),
            write_map: Mutex::new(HashMap::new()),
            sizes: BufferSizes::new(DEFAULT_BLOCK_SIZE, DEFAULT_BLOCK_SIZE),
            max_stream_size: env_nonempty("TILEDB_MAX_STREAM_SIZE")
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_MAX_STREAM_SIZE),
        })
    }

    fn get_path(&self, path: &str) -> String {
        let mut pathname = path.to_string();
        if path.contains("://") {
            match AzureUri::parse(path) {
                Ok(uri) => pathname = uri.path().to_string(),
                Err(_) => return path.to_string(),
            }
            if pathname.is_empty() {
                return String::new();
            }
        }
        if let Some(stripped) = pathname.strip_prefix('/') {
            return stripped.to_string();
        }
        if pathname.is_empty() {
            self.working_dir.clone()
        } else if self.working_dir.is_empty() || pathname.starts_with(&self.working_dir) {
            pathname
        } else {
            format!("{}/{}", self.working_dir, pathname)
        }
    }

    fn blob_url(&self, path: &str) -> String {
        format!("{}/{}/{}", self.endpoint, self.container, path)
    }

    fn container_url(&self) -> String {
        format!("{}/{}", self.endpoint, self.container)
    }

    fn request(
        &self,
        method: reqwest::Method,
        url: &str,
        query: &[(&str, &str)],
        headers: &[(&str, String)],
        body: Option<Vec<u8>>,
    ) -> GridResult<Response> {
        let date = OffsetDateTime::now_utc()
            .format(&Rfc2822)
            .unwrap_or_default()
            .replace("+0000", "GMT");
        let body_len = body.as_ref().map_or(0, Vec::len);

        let mut builder = self.client.request(method.clone(), url);
        let mut ms_headers: Vec<(String, String)> = vec![
            ("x-ms-date".to_string(), date),
            ("x-ms-version".to_string(), MS_VERSION.to_string()),
        ];
        for (name, value) in headers {
            if name.starts_with("x-ms-") {
                ms_headers.push(((*name).to_string(), value.clone()));
            } else {
                builder = builder.header(*name, value);
            }
        }
        ms_headers.sort();
        for (name, value) in &ms_headers {
            builder = builder.header(name, value);
        }

        let mut query: Vec<(String, String)> = query
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        match &self.credentials {
            AzureCredentials::SharedKey { key } => {
                let auth = self.shared_key_auth(&method, url, &query, &ms_headers, headers, body_len, key);
                builder = builder.header("Authorization", auth);
            }
            AzureCredentials::SasToken(token) => {
                for piece in token.split('&').filter(|p| !p.is_empty()) {
                    let (k, v) = piece.split_once('=').unwrap_or((piece, ""));
                    query.push((k.to_string(), v.to_string()));
                }
            }
            AzureCredentials::BearerToken(token) => {
                builder = builder.header("Authorization", format!("Bearer {token}"));
            }
        }
        if !query.is_empty() {
            builder = builder.query(&query);
        }
        if let Some(body) = body {
            builder = builder.body(body);
        }
        builder.send().map_err(|e| GridError::io_msg(url, e.to_string()))
    }

    /// SharedKey request signature (storage service version 2019-12-12).
    #[allow(clippy::too_many_arguments)]
    fn shared_key_auth(
        &self,
        method: &reqwest::Method,
        url: &str,
        query: &[(String, String)],
        ms_headers: &[(String, String)],
        plain_headers: &[(&str, String)],
        body_len: usize,
        key: &[u8],
    ) -> String {
        let find = |name: &str| {
            plain_headers
                .iter()
                .find(|(n, _)| n.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.clone())
                .unwrap_or_default()
        };
        let content_length = if body_len == 0 {
            String::new()
        } else {
            body_len.to_string()
        };
        let canonical_headers: String = ms_headers
            .iter()
            .map(|(n, v)| format!("{n}:{v}\n"))
            .collect();

        let resource_path = url
            .strip_prefix(&self.endpoint)
            .unwrap_or(url)
            .to_string();
        let mut sorted_query: Vec<(String, String)> = query.to_vec();
        sorted_query.sort();
        let canonical_query: String = sorted_query
            .iter()
            .map(|(k, v)| format!("\n{}:{}", k.to_ascii_lowercase(), v))
            .collect();
        let canonical_resource = format!("/{}{}{}", self.account, resource_path, canonical_query);

        let string_to_sign = format!(
            "{}\n{}\n{}\n{}\n{}\n{}\n{}\n{}\n{}\n{}\n{}\n{}\n{}{}",
            method.as_str(),
            find("Content-Encoding"),
            find("Content-Language"),
            content_length,
            find("Content-MD5"),
            find("Content-Type"),
            "", // Date is carried in x-ms-date
            find("If-Modified-Since"),
            find("If-Match"),
            find("If-None-Match"),
            find("If-Unmodified-Since"),
            find("Range"),
            canonical_headers,
            canonical_resource,
        );
        let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key).expect("HMAC accepts any key length");
        mac.update(string_to_sign.as_bytes());
        let signature = BASE64.encode(mac.finalize().into_bytes());
        format!("SharedKey {}:{signature}", self.account)
    }

    fn check_status(path: &str, response: Response) -> GridResult<Response> {
        match response.status() {
            s if s.is_success() => Ok(response),
            StatusCode::NOT_FOUND => Err(GridError::NotFound(path.to_string())),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(GridError::Auth {
                backend: BACKEND,
                reason: format!("service returned {} for {path}", response.status()),
            }),
            s => Err(GridError::io_msg(path, format!("service returned {s}"))),
        }
    }

    fn head_blob(&self, path: &str) -> GridResult<Option<u64>> {
        let response = self.request(
            reqwest::Method::HEAD,
            &self.blob_url(path),
            &[],
            &[],
            None,
        )?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = Self::check_status(path, response)?;
        Ok(Some(response.content_length().unwrap_or(0)))
    }

    fn list_blobs(
        &self,
        prefix: &str,
        delimiter: Option<&str>,
        max_results: Option<u32>,
    ) -> GridResult<(Vec<String>, Vec<String>)> {
        let mut blobs = Vec::new();
        let mut prefixes = Vec::new();
        let mut marker = String::new();
        loop {
            let max = max_results.map(|m| m.to_string());
            let mut query: Vec<(&str, &str)> = vec![
                ("restype", "container"),
                ("comp", "list"),
                ("prefix", prefix),
            ];
            if let Some(d) = delimiter {
                query.push(("delimiter", d));
            }
            if let Some(m) = &max {
                query.push(("maxresults", m));
            }
            if !marker.is_empty() {
                query.push(("marker", &marker));
            }
            let response =
                self.request(reqwest::Method::GET, &self.container_url(), &query, &[], None)?;
            let response = Self::check_status(prefix, response)?;
            let text = response
                .text()
                .map_err(|e| GridError::io_msg(prefix, e.to_string()))?;
            let parsed: EnumerationResults = quick_xml::de::from_str(&text)
                .map_err(|e| GridError::io_msg(prefix, format!("bad list response: {e}")))?;
            if let Some(listed) = parsed.blobs {
                blobs.extend(listed.blob.into_iter().map(|b| b.name));
                prefixes.extend(listed.blob_prefix.into_iter().map(|p| p.name));
            }
            match parsed.next_marker.filter(|m| !m.is_empty()) {
                Some(next) if max_results.is_none() => marker = next,
                _ => break,
            }
        }
        Ok((blobs, prefixes))
    }

    fn path_exists(&self, path: &str) -> bool {
        if path.ends_with('/') {
            // Directories in flat namespaces exist through their children.
            if matches!(self.head_blob(path), Ok(Some(_))) {
                return true;
            }
            matches!(
                self.list_blobs(path, Some("/"), Some(1)),
                Ok((blobs, prefixes)) if !blobs.is_empty() || !prefixes.is_empty()
            )
        } else {
            matches!(self.head_blob(path), Ok(Some(_)))
        }
    }

    fn create_empty_blob(&self, path: &str) -> GridResult<()> {
        let headers = [
            ("x-ms-blob-type", "BlockBlob".to_string()),
            ("Content-Type", "application/octet-stream".to_string()),
        ];
        let response = self.request(
            reqwest::Method::PUT,
            &self.blob_url(path),
            &[],
            &headers,
            Some(Vec::new()),
        )?;
        Self::check_status(path, response).map(|_| ())
    }

    fn put_block(&self, path: &str, block_id: &str, data: &[u8]) -> GridResult<()> {
        let response = self.request(
            reqwest::Method::PUT,
            &self.blob_url(path),
            &[("comp", "block"), ("blockid", block_id)],
            &[],
            Some(data.to_vec()),
        )?;
        Self::check_status(path, response).map(|_| ())
    }

    fn get_range(&self, path: &str, offset: u64, buf: &mut [u8]) -> GridResult<()> {
        let range = format!("bytes={}-{}", offset, offset + buf.len() as u64 - 1);
        let headers = [("Range", range)];
        let response = self.request(
            reqwest::Method::GET,
            &self.blob_url(path),
            &[],
            &headers,
            None,
        )?;
        if response.status() == StatusCode::RANGE_NOT_SATISFIABLE {
            return Err(GridError::ShortRead {
                path: path.to_string(),
                offset,
                wanted: buf.len(),
                available: self.head_blob(path)?.unwrap_or(0),
            });
        }
        let response = Self::check_status(path, response)?;
        let bytes = response
            .bytes()
            .map_err(|e| GridError::io_msg(path, e.to_string()))?;
        if bytes.len() < buf.len() {
            return Err(GridError::ShortRead {
                path: path.to_string(),
                offset,
                wanted: buf.len(),
                available: offset + bytes.len() as u64,
            });
        }
        buf.copy_from_slice(&bytes[..buf.len()]);
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct EnumerationResults {
    #[serde(rename = "Blobs")]
    blobs: Option<BlobList>,
    #[serde(rename = "NextMarker")]
    next_marker: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BlobList {
    #[serde(rename = "Blob", default)]
    blob: Vec<BlobEntry>,
    #[serde(rename = "BlobPrefix", default)]
    blob_prefix: Vec<BlobPrefixEntry>,
}

#[derive(Debug, Deserialize)]
struct BlobEntry {
    #[serde(rename = "Name")]
    name: String,
}

#[derive(Debug, Deserialize)]
struct BlobPrefixEntry {
    #[serde(rename = "Name")]
    name: String,
}

impl StorageBackend for AzureBlobFs {
    fn current_dir(&self) -> String {
        self.working_dir.clone()
    }

    fn is_dir(&self, path: &str) -> bool {
        let resolved = self.get_path(path);
        if resolved.is_empty() {
            return true; // the container itself
        }
        self.path_exists(&slashify(&resolved))
    }

    fn is_file(&self, path: &str) -> bool {
        self.path_exists(&unslashify(&self.get_path(path)))
    }

    fn real_dir(&self, path: &str) -> GridResult<String> {
        if path.contains("://") {
            let uri = AzureUri::parse(path)?;
            if uri.account() != self.account || uri.container() != self.container {
                return Err(GridError::InvalidUri {
                    uri: path.to_string(),
                    reason: "URI names a different account or container".to_string(),
                });
            }
        }
        Ok(self.get_path(path))
    }

    fn create_dir(&self, path: &str) -> GridResult<()> {
        if self.is_file(path) {
            return Err(GridError::AlreadyExists(path.to_string()));
        }
        // Object stores have no directories; the hierarchy is implied.
        Ok(())
    }

    fn delete_dir(&self, path: &str) -> GridResult<()> {
        let prefix = slashify(&self.get_path(path));
        let (blobs, _) = self.list_blobs(&prefix, None, None)?;
        for blob in blobs {
            let response =
                self.request(reqwest::Method::DELETE, &self.blob_url(&blob), &[], &[], None)?;
            Self::check_status(&blob, response)?;
        }
        Ok(())
    }

    fn get_dirs(&self, path: &str) -> GridResult<Vec<String>> {
        let prefix = slashify(&self.get_path(path));
        let (_, prefixes) = self.list_blobs(&prefix, Some("/"), None)?;
        Ok(prefixes.iter().map(|p| unslashify(p)).collect())
    }

    fn get_files(&self, path: &str) -> GridResult<Vec<String>> {
        let prefix = slashify(&self.get_path(path));
        let (blobs, _) = self.list_blobs(&prefix, Some("/"), None)?;
        Ok(blobs)
    }

    fn create_file(&self, path: &str) -> GridResult<()> {
        if self.is_file(path) {
            return Err(GridError::AlreadyExists(path.to_string()));
        }
        self.create_empty_blob(&self.get_path(path))
    }

    fn delete_file(&self, path: &str) -> GridResult<()> {
        let resolved = unslashify(&self.get_path(path));
        if !self.path_exists(&resolved) {
            return Err(GridError::NotFound(path.to_string()));
        }
        let response =
            self.request(reqwest::Method::DELETE, &self.blob_url(&resolved), &[], &[], None)?;
        Self::check_status(path, response).map(|_| ())
    }

    fn file_size(&self, path: &str) -> GridResult<u64> {
        self.head_blob(&unslashify(&self.get_path(path)))?
            .ok_or_else(|| GridError::NotFound(path.to_string()))
    }

    fn read_from_file(&self, path: &str, offset: u64, buf: &mut [u8]) -> GridResult<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let resolved = unslashify(&self.get_path(path));
        if buf.len() <= self.max_stream_size {
            return self.get_range(&resolved, offset, buf);
        }

        // Parallel ranged download, joined before return.
        let chunk = self.download_buffer_size().max(1);
        let workers = std::thread::available_parallelism()
            .map(std::num::NonZeroUsize::get)
            .unwrap_or(1)
            .min(buf.len().div_ceil(chunk));
        debug!("parallel download of {} bytes from {resolved} on {workers} threads", buf.len());
        let next = AtomicUsize::new(0);
        let chunks: Vec<(u64, &mut [u8])> = {
            let mut out = Vec::new();
            let mut rest: &mut [u8] = buf;
            let mut at = offset;
            while rest.len() > chunk {
                let (head, tail) = std::mem::take(&mut rest).split_at_mut(chunk);
                out.push((at, head));
                at += chunk as u64;
                rest = tail;
            }
            out.push((at, rest));
            out
        };
        let chunks = Mutex::new(chunks.into_iter().map(Some).collect::<Vec<_>>());
        std::thread::scope(|scope| {
            let mut handles = Vec::new();
            for _ in 0..workers {
                let next = &next;
                let chunks = &chunks;
                let resolved = &resolved;
                handles.push(scope.spawn(move || -> GridResult<()> {
                    loop {
                        let i = next.fetch_add(1, Ordering::Relaxed);
                        let taken = {
                            let mut guard =
                                chunks.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                            match guard.get_mut(i) {
                                Some(slot) => slot.take(),
                                None => return Ok(()),
                            }
                        };
                        let Some((at, slice)) = taken else { return Ok(()) };
                        self.get_range(resolved, at, slice)?;
                    }
                }));
            }
            for handle in handles {
                handle.join().map_err(|_| {
                    GridError::io_msg(path, "download worker panicked")
                })??;
            }
            Ok(())
        })
    }

    fn write_to_file(&self, path: &str, buf: &[u8]) -> GridResult<()> {
        let resolved = self.get_path(path);
        if buf.is_empty() {
            let mut map = self
                .write_map
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if !map.contains_key(&resolved) && !self.path_exists(&resolved) {
                self.create_empty_blob(&resolved)?;
            }
            drop(map);
            return Ok(());
        }
        if buf.len() > MAX_BLOCKS_PER_BLOB * MAX_BLOCK_SIZE {
            return Err(GridError::io_msg(path, "buffer too large for a block upload"));
        }

        let mut block_size = buf.len() / MAX_BLOCKS_PER_BLOB;
        block_size = block_size.div_ceil(BLOCK_GRAIN) * BLOCK_GRAIN;
        block_size = block_size.clamp(DEFAULT_BLOCK_SIZE, MAX_BLOCK_SIZE);
        let num_blocks = buf.len().div_ceil(block_size);

        // Reserve ids under the map lock; uploads run outside it.
        let block_ids: Vec<String> = {
            let mut map = self
                .write_map
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            let staged = map
                .entry(resolved.clone())
                .or_insert_with(|| StagedBlocks { block_ids: Vec::new() });
            if staged.block_ids.len() + num_blocks > MAX_BLOCKS_PER_BLOB {
                return Err(GridError::io_msg(path, "blob exceeds the staged block limit"));
            }
            let start = staged.block_ids.len();
            (start..start + num_blocks)
                .map(|i| BASE64.encode(format!("{i:032}")))
                .inspect(|id| staged.block_ids.push(id.clone()))
                .collect()
        };

        let next = AtomicUsize::new(0);
        let workers = std::thread::available_parallelism()
            .map(std::num::NonZeroUsize::get)
            .unwrap_or(1)
            .min(num_blocks);
        std::thread::scope(|scope| {
            let mut handles = Vec::new();
            for _ in 0..workers {
                let next = &next;
                let block_ids = &block_ids;
                let resolved = &resolved;
                handles.push(scope.spawn(move || -> GridResult<()> {
                    loop {
                        let i = next.fetch_add(1, Ordering::Relaxed);
                        if i >= num_blocks {
                            return Ok(());
                        }
                        let start = i * block_size;
                        let end = (start + block_size).min(buf.len());
                        self.put_block(resolved, &block_ids[i], &buf[start..end])?;
                    }
                }));
            }
            for handle in handles {
                handle
                    .join()
                    .map_err(|_| GridError::io_msg(path, "upload worker panicked"))??;
            }
            Ok(())
        })
    }

    fn move_path(&self, _old_path: &str, _new_path: &str) -> GridResult<()> {
        Err(GridError::Unsupported {
            backend: BACKEND,
            operation: "move_path",
        })
    }

    fn sync_path(&self, _path: &str) -> GridResult<()> {
        Ok(()) // writes are visible only after close_file
    }

    fn close_file(&self, path: &str) -> GridResult<()> {
        let resolved = self.get_path(path);
        let staged = {
            let mut map = self
                .write_map
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            map.remove(&resolved)
        };
        let Some(staged) = staged else {
            return Ok(());
        };
        debug!("committing {} staged blocks to {resolved}", staged.block_ids.len());
        let mut body = String::from("<?xml version=\"1.0\" encoding=\"utf-8\"?><BlockList>");
        for id in &staged.block_ids {
            body.push_str("<Latest>");
            body.push_str(id);
            body.push_str("</Latest>");
        }
        body.push_str("</BlockList>");
        let response = self.request(
            reqwest::Method::PUT,
            &self.blob_url(&resolved),
            &[("comp", "blocklist")],
            &[("Content-Type", "application/xml".to_string())],
            Some(body.into_bytes()),
        )?;
        Self::check_status(path, response).map(|_| ())
    }

    fn buffer_sizes(&self) -> &BufferSizes {
        &self.sizes
    }
}

#[cfg(test)]
mod tests {
    use httpmock::Method::{DELETE, GET, HEAD, PUT};
    use httpmock::MockServer;

    use super::{AzureBlobFs, AzureCredentials};
    use crate::error::GridError;
    use crate::storage::StorageBackend;

    fn backend(server: &MockServer) -> AzureBlobFs {
        AzureBlobFs::with_credentials(
            &server.base_url(),
            "testaccount",
            "testc",
            AzureCredentials::SasToken("sv=2019-12-12&sig=testsig".to_string()),
        )
        .expect("backend")
    }

    #[test]
    fn head_reports_file_size() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(HEAD).path("/testc/frag/a.tdb");
            then.status(200).header("content-length", "42");
        });
        let fs = backend(&server);
        assert_eq!(fs.file_size("frag/a.tdb").expect("size"), 42);
        assert!(fs.is_file("frag/a.tdb"));
        mock.assert_hits(2);
    }

    #[test]
    fn missing_blob_is_not_found() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(HEAD).path("/testc/gone.tdb");
            then.status(404);
        });
        let fs = backend(&server);
        assert!(matches!(
            fs.file_size("gone.tdb"),
            Err(GridError::NotFound(_))
        ));
    }

    #[test]
    fn ranged_read() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET)
                .path("/testc/data.tdb")
                .header("Range", "bytes=2-5");
            then.status(206).body("cdef");
        });
        let fs = backend(&server);
        let mut buf = [0u8; 4];
        fs.read_from_file("data.tdb", 2, &mut buf).expect("read");
        assert_eq!(&buf, b"cdef");
    }

    #[test]
    fn staged_blocks_commit_on_close() {
        let server = MockServer::start();
        let put_block = server.mock(|when, then| {
            when.method(PUT)
                .path("/testc/out.tdb")
                .query_param("comp", "block");
            then.status(201);
        });
        let put_list = server.mock(|when, then| {
            when.method(PUT)
                .path("/testc/out.tdb")
                .query_param("comp", "blocklist")
                .body_contains("<Latest>");
            then.status(201);
        });
        let fs = backend(&server);
        fs.write_to_file("out.tdb", b"first part").expect("write");
        fs.write_to_file("out.tdb", b"second part").expect("write");
        fs.close_file("out.tdb").expect("close");
        put_block.assert_hits(2);
        put_list.assert_hits(1);
        // A second close is a no-op: nothing staged.
        fs.close_file("out.tdb").expect("close again");
        put_list.assert_hits(1);
    }

    #[test]
    fn list_parses_blobs_and_prefixes() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET)
                .path("/testc")
                .query_param("comp", "list")
                .query_param("prefix", "frag/");
            then.status(200).body(
                "<?xml version=\"1.0\"?><EnumerationResults>\
                 <Blobs>\
                 <Blob><Name>frag/a.tdb</Name></Blob>\
                 <Blob><Name>frag/b.tdb</Name></Blob>\
                 <BlobPrefix><Name>frag/sub/</Name></BlobPrefix>\
                 </Blobs><NextMarker/></EnumerationResults>",
            );
        });
        let fs = backend(&server);
        let files = fs.get_files("frag").expect("files");
        assert_eq!(files, vec!["frag/a.tdb", "frag/b.tdb"]);
        let dirs = fs.get_dirs("frag").expect("dirs");
        assert_eq!(dirs, vec!["frag/sub"]);
    }

    #[test]
    fn delete_dir_removes_listed_children() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/testc").query_param("comp", "list");
            then.status(200).body(
                "<?xml version=\"1.0\"?><EnumerationResults><Blobs>\
                 <Blob><Name>frag/a.tdb</Name></Blob>\
                 </Blobs></EnumerationResults>",
            );
        });
        let deleted = server.mock(|when, then| {
            when.method(DELETE).path("/testc/frag/a.tdb");
            then.status(202);
        });
        let fs = backend(&server);
        fs.delete_dir("frag").expect("delete dir");
        deleted.assert_hits(1);
    }

    #[test]
    fn move_is_unsupported_and_locking_absent() {
        let server = MockServer::start();
        let fs = backend(&server);
        assert!(matches!(
            fs.move_path("a", "b"),
            Err(GridError::Unsupported { .. })
        ));
        assert!(!fs.locking_support());
        fs.sync_path("anything").expect("sync is a no-op");
    }
}
