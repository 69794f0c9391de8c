//! Google Cloud Storage backend.
//!
//! Each write uploads a numbered part object (`<path>__tiledb__<n>`);
//! closing the file composes the parts into the final object and cleans
//! them up. Every part except the last must be at least 256 KiB, the
//! service's chunked-upload granularity.

use std::collections::HashMap;
use std::process::Command;
use std::sync::Mutex;
use std::time::Duration;

use log::{debug, warn};
use reqwest::StatusCode;
use reqwest::blocking::{Client, Response};
use serde::Deserialize;
use url::Url;

use crate::error::{GridError, GridResult};
use crate::storage::{BufferSizes, StorageBackend, locate_ca_certs, slashify, unslashify};
use crate::uri::GcsUri;

const BACKEND: &str = "gcs";
/// Suffix of intermediate write parts, composed away on close.
const PART_SUFFIX: &str = "__tiledb__";
/// All but the final part must be at least this large.
const MIN_PART_SIZE: usize = 256 * 1024;
/// The compose API accepts at most this many source objects per call.
const MAX_COMPOSE_SOURCES: usize = 32;
const DEFAULT_BUFFER_SIZE: usize = 5 * 1024 * 1024;
const DEFAULT_ENDPOINT: &str = "https://storage.googleapis.com";
const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

struct WriteState {
    part_number: u64,
    last_uploaded_size: usize,
    failed: bool,
}

/// GCS backend for one bucket.
pub struct GcsFs {
    client: Client,
    base_url: Url,
    bucket: String,
    token: Option<String>,
    working_dir: String,
    write_map: Mutex<HashMap<String, WriteState>>,
    sizes: BufferSizes,
}

fn env_nonempty(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

#[derive(Deserialize)]
struct MetadataToken {
    access_token: String,
}

#[derive(Deserialize)]
struct ObjectMeta {
    size: Option<String>,
}

#[derive(Deserialize)]
struct Listing {
    #[serde(default)]
    items: Vec<ObjectItem>,
    #[serde(default)]
    prefixes: Vec<String>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

#[derive(Deserialize)]
struct ObjectItem {
    name: String,
}

impl GcsFs {
    /// Connects to the bucket named by a `gs://` home URI.
    ///
    /// The bearer token resolves from `GCS_ACCESS_TOKEN` /
    /// `GOOGLE_OAUTH_ACCESS_TOKEN`, then the GCE metadata server, then
    /// the `gcloud` CLI; with none available construction fails with
    /// [`GridError::Auth`]. `STORAGE_EMULATOR_HOST` redirects the
    /// endpoint and skips authentication.
    pub fn connect(home: &str) -> GridResult<Self> {
        let uri = GcsUri::parse(home)?;
        if uri.bucket().is_empty() {
            return Err(GridError::InvalidUri {
                uri: home.to_string(),
                reason: "GCS URI does not name a bucket".to_string(),
            });
        }
        if env_nonempty("TILEDB_USE_GCS_HDFS_CONNECTOR").is_some() {
            return Err(GridError::Unsupported {
                backend: BACKEND,
                operation: "HDFS-connector access",
            });
        }

        let (endpoint, token) = match env_nonempty("STORAGE_EMULATOR_HOST") {
            Some(emulator) => (emulator, None),
            None => {
                let token = resolve_token().ok_or_else(|| GridError::Auth {
                    backend: BACKEND,
                    reason: "no bearer token; set GCS_ACCESS_TOKEN or sign in with gcloud"
                        .to_string(),
                })?;
                (DEFAULT_ENDPOINT.to_string(), Some(token))
            }
        };

        let mut fs = Self::with_token(&endpoint, uri.bucket(), token)?;
        // Existing buckets only.
        let bucket = fs.bucket.clone();
        let url = fs.api_url(&["storage", "v1", "b", &bucket]);
        let response = fs.send(fs.client.get(url))?;
        Self::check_status(uri.bucket(), response)?;
        let working_dir = fs.get_path(uri.path());
        fs.working_dir = working_dir;
        Ok(fs)
    }

    /// Builds a backend against an explicit endpoint without probing the
    /// bucket; `token` of `None` sends unauthenticated requests.
    pub fn with_token(endpoint: &str, bucket: &str, token: Option<String>) -> GridResult<Self> {
        let mut builder = Client::builder();
        if let Some(bundle) = locate_ca_certs() {
            if let Ok(pem) = std::fs::read(&bundle) {
                match reqwest::Certificate::from_pem_bundle(&pem) {
                    Ok(certs) => {
                        for cert in certs {
                            builder = builder.add_root_certificate(cert);
                        }
                    }
                    Err(e) => warn!("ignoring unreadable CA bundle {}: {e}", bundle.display()),
                }
            }
        }
        let client = builder.build().map_err(|e| GridError::Auth {
            backend: BACKEND,
            reason: format!("could not build HTTP client: {e}"),
        })?;
        let base_url = Url::parse(endpoint).map_err(|e| GridError::InvalidUri {
            uri: endpoint.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            client,
            base_url,
            bucket: bucket.to_string(),
            token,
            working_dir: String::new(),
            write_map: Mutex::new(HashMap::new()),
            sizes: BufferSizes::new(DEFAULT_BUFFER_SIZE, DEFAULT_BUFFER_SIZE),
        })
    }

    fn get_path(&self, path: &str) -> String {
        let mut pathname = path.to_string();
        if path.contains("://") {
            match GcsUri::parse(path) {
                Ok(uri) => pathname = uri.path().to_string(),
                Err(_) => return path.to_string(),
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

    fn api_url(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn object_url(&self, object: &str) -> Url {
        self.api_url(&["storage", "v1", "b", &self.bucket, "o", object])
    }

    fn send(&self, builder: reqwest::blocking::RequestBuilder) -> GridResult<Response> {
        let builder = match &self.token {
            Some(token) => builder.header("Authorization", format!("Bearer {token}")),
            None => builder,
        };
        builder
            .send()
            .map_err(|e| GridError::io_msg(self.bucket.clone(), e.to_string()))
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

    fn object_meta(&self, object: &str) -> GridResult<Option<u64>> {
        let response = self.send(self.client.get(self.object_url(object)))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = Self::check_status(object, response)?;
        let meta: ObjectMeta = response
            .json()
            .map_err(|e| GridError::io_msg(object, format!("bad object metadata: {e}")))?;
        Ok(Some(
            meta.size.and_then(|s| s.parse().ok()).unwrap_or(0),
        ))
    }

    fn insert_object(&self, object: &str, body: Vec<u8>) -> GridResult<()> {
        let mut url = self.api_url(&["upload", "storage", "v1", "b", &self.bucket, "o"]);
        url.query_pairs_mut()
            .append_pair("uploadType", "media")
            .append_pair("name", object);
        let response = self.send(
            self.client
                .post(url)
                .header("Content-Type", "application/octet-stream")
                .body(body),
        )?;
        Self::check_status(object, response).map(|_| ())
    }

    fn delete_object(&self, object: &str) -> GridResult<()> {
        let response = self.send(self.client.delete(self.object_url(object)))?;
        Self::check_status(object, response).map(|_| ())
    }

    fn compose_objects(&self, sources: &[String], destination: &str) -> GridResult<()> {
        let mut url = self.object_url(destination);
        if let Ok(mut path) = url.path_segments_mut() {
            path.push("compose");
        }
        let body = serde_json::json!({
            "sourceObjects": sources.iter().map(|s| serde_json::json!({"name": s})).collect::<Vec<_>>(),
            "destination": {"contentType": "application/octet-stream"},
        });
        let response = self.send(self.client.post(url).json(&body))?;
        Self::check_status(destination, response).map(|_| ())
    }

    fn list(
        &self,
        prefix: &str,
        delimiter: Option<&str>,
        max_results: Option<u32>,
    ) -> GridResult<(Vec<String>, Vec<String>)> {
        let mut items = Vec::new();
        let mut prefixes = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut url = self.api_url(&["storage", "v1", "b", &self.bucket, "o"]);
            {
                let mut q = url.query_pairs_mut();
                q.append_pair("prefix", prefix);
                if let Some(d) = delimiter {
                    q.append_pair("delimiter", d);
                }
                if let Some(m) = max_results {
                    q.append_pair("maxResults", &m.to_string());
                }
                if let Some(t) = &page_token {
                    q.append_pair("pageToken", t);
                }
            }
            let response = self.send(self.client.get(url))?;
            let response = Self::check_status(prefix, response)?;
            let listing: Listing = response
                .json()
                .map_err(|e| GridError::io_msg(prefix, format!("bad list response: {e}")))?;
            items.extend(listing.items.into_iter().map(|i| i.name));
            prefixes.extend(listing.prefixes);
            match listing.next_page_token {
                Some(t) if max_results.is_none() => page_token = Some(t),
                _ => break,
            }
        }
        Ok((items, prefixes))
    }

    fn path_exists(&self, path: &str) -> bool {
        if path.ends_with('/') {
            // No marker objects: a directory exists through its children.
            matches!(
                self.list(path, Some("/"), Some(1)),
                Ok((items, prefixes)) if !items.is_empty() || !prefixes.is_empty()
            ) || matches!(self.object_meta(path), Ok(Some(_)))
        } else {
            matches!(self.object_meta(path), Ok(Some(_)))
        }
    }

    fn delete_by_prefix(&self, prefix: &str) -> GridResult<()> {
        let (items, _) = self.list(prefix, None, None)?;
        for item in items {
            self.delete_object(&item)?;
        }
        Ok(())
    }
}

fn resolve_token() -> Option<String> {
    if let Some(token) = env_nonempty("GCS_ACCESS_TOKEN").or_else(|| env_nonempty("GOOGLE_OAUTH_ACCESS_TOKEN")) {
        return Some(token);
    }
    // The GCE metadata server answers instantly inside Google Cloud and
    // not at all outside it.
    if let Ok(client) = Client::builder().timeout(Duration::from_secs(2)).build() {
        if let Ok(response) = client
            .get(METADATA_TOKEN_URL)
            .header("Metadata-Flavor", "Google")
            .send()
        {
            if response.status().is_success() {
                if let Ok(token) = response.json::<MetadataToken>() {
                    return Some(token.access_token);
                }
            }
        }
    }
    let out = Command::new("gcloud")
        .args(["auth", "print-access-token"])
        .output()
        .ok()?;
    if !out.status.success() {
        return None;
    }
    let token = String::from_utf8_lossy(&out.stdout).trim().to_string();
    if token.is_empty() { None } else { Some(token) }
}

impl StorageBackend for GcsFs {
    fn current_dir(&self) -> String {
        self.working_dir.clone()
    }

    fn is_dir(&self, path: &str) -> bool {
        let resolved = self.get_path(path);
        if resolved.is_empty() {
            return true; // the bucket itself
        }
        self.path_exists(&slashify(&resolved))
    }

    fn is_file(&self, path: &str) -> bool {
        self.path_exists(&unslashify(&self.get_path(path)))
    }

    fn real_dir(&self, path: &str) -> GridResult<String> {
        if path.contains("://") {
            let uri = GcsUri::parse(path)?;
            if uri.bucket() != self.bucket {
                return Err(GridError::InvalidUri {
                    uri: path.to_string(),
                    reason: "URI names a different bucket".to_string(),
                });
            }
        }
        Ok(self.get_path(path))
    }

    fn create_dir(&self, path: &str) -> GridResult<()> {
        if self.is_file(path) {
            return Err(GridError::AlreadyExists(path.to_string()));
        }
        // No marker object: directory existence is answered by listing.
        Ok(())
    }

    fn delete_dir(&self, path: &str) -> GridResult<()> {
        if self.is_file(path) {
            return Err(GridError::io_msg(path, "path is a file, not a directory"));
        }
        if !self.is_dir(path) {
            return Err(GridError::NotFound(path.to_string()));
        }
        self.delete_by_prefix(&slashify(&self.get_path(path)))
    }

    fn get_dirs(&self, path: &str) -> GridResult<Vec<String>> {
        let prefix = slashify(&self.get_path(path));
        let (_, prefixes) = self.list(&prefix, Some("/"), None)?;
        Ok(prefixes.iter().map(|p| unslashify(p)).collect())
    }

    fn get_files(&self, path: &str) -> GridResult<Vec<String>> {
        let prefix = slashify(&self.get_path(path));
        let (items, _) = self.list(&prefix, Some("/"), None)?;
        Ok(items.into_iter().filter(|n| !n.ends_with('/')).collect())
    }

    fn create_file(&self, path: &str) -> GridResult<()> {
        if self.is_dir(path) || self.is_file(path) {
            return Err(GridError::AlreadyExists(path.to_string()));
        }
        self.insert_object(&self.get_path(path), Vec::new())
    }

    fn delete_file(&self, path: &str) -> GridResult<()> {
        if !self.is_file(path) {
            return Err(GridError::NotFound(path.to_string()));
        }
        self.delete_object(&unslashify(&self.get_path(path)))
    }

    fn file_size(&self, path: &str) -> GridResult<u64> {
        self.object_meta(&unslashify(&self.get_path(path)))?
            .ok_or_else(|| GridError::NotFound(path.to_string()))
    }

    fn read_from_file(&self, path: &str, offset: u64, buf: &mut [u8]) -> GridResult<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let object = unslashify(&self.get_path(path));
        let mut url = self.object_url(&object);
        url.query_pairs_mut().append_pair("alt", "media");
        let range = format!("bytes={}-{}", offset, offset + buf.len() as u64 - 1);
        let response = self.send(self.client.get(url).header("Range", range))?;
        if response.status() == StatusCode::RANGE_NOT_SATISFIABLE {
            return Err(GridError::ShortRead {
                path: path.to_string(),
                offset,
                wanted: buf.len(),
                available: self.object_meta(&object)?.unwrap_or(0),
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

    fn write_to_file(&self, path: &str, buf: &[u8]) -> GridResult<()> {
        if buf.is_empty() {
            return match self.create_file(path) {
                Err(GridError::AlreadyExists(_)) => Ok(()),
                other => other,
            };
        }
        let filepath = self.get_path(path);
        let part_number = {
            let mut map = self
                .write_map
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            match map.get_mut(&filepath) {
                None => {
                    map.insert(
                        filepath.clone(),
                        WriteState {
                            part_number: 0,
                            last_uploaded_size: buf.len(),
                            failed: false,
                        },
                    );
                    0
                }
                Some(state) => {
                    if state.last_uploaded_size < MIN_PART_SIZE {
                        state.failed = true;
                        return Err(GridError::io_msg(
                            path,
                            "only the final uploadable part may be smaller than 256 KiB",
                        ));
                    }
                    state.part_number += 1;
                    state.last_uploaded_size = buf.len();
                    state.part_number
                }
            }
        };
        let part = format!("{filepath}{PART_SUFFIX}{part_number}");
        let result = self.insert_object(&part, buf.to_vec());
        if result.is_err() {
            let mut map = self
                .write_map
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if let Some(state) = map.get_mut(&filepath) {
                state.failed = true;
            }
        }
        result
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
        let filepath = self.get_path(path);
        let state = {
            let mut map = self
                .write_map
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            map.remove(&filepath)
        };
        let Some(state) = state else {
            return Ok(());
        };
        let prefix = format!("{filepath}{PART_SUFFIX}");
        if state.failed {
            // Leave any previously committed object intact, drop the parts.
            let _ = self.delete_by_prefix(&prefix);
            return Err(GridError::io_msg(
                path,
                "upload aborted after an undersized part",
            ));
        }

        let mut sources: Vec<String> = (0..=state.part_number)
            .map(|i| format!("{prefix}{i}"))
            .collect();
        debug!("composing {} parts into {filepath}", sources.len());

        // The compose API takes 32 sources at a time; reduce in rounds.
        let mut generation = 0;
        while sources.len() > MAX_COMPOSE_SOURCES {
            let mut reduced = Vec::new();
            for (i, chunk) in sources.chunks(MAX_COMPOSE_SOURCES).enumerate() {
                let tmp = format!("{prefix}tmp{generation}_{i}");
                self.compose_objects(chunk, &tmp)?;
                reduced.push(tmp);
            }
            sources = reduced;
            generation += 1;
        }
        let result = self.compose_objects(&sources, &filepath);
        // Parts and intermediates share the suffix prefix.
        let cleanup = self.delete_by_prefix(&prefix);
        result?;
        cleanup
    }

    fn buffer_sizes(&self) -> &BufferSizes {
        &self.sizes
    }
}
