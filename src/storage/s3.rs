//! Amazon S3 backend.
//!
//! Writes start a multipart upload lazily on the first non-empty write;
//! parts accumulate a completed-part list that is finalized when the
//! file is closed. Credentials come from the standard SDK chain. The
//! backend owns a small runtime and blocks on SDK futures, so its public
//! surface stays synchronous.

use std::collections::HashMap;
use std::sync::Mutex;

use aws_sdk_s3::Client;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use bytes::Bytes;
use log::debug;
use tokio::runtime::Runtime;

use crate::error::{GridError, GridResult};
use crate::storage::{BufferSizes, StorageBackend, slashify, unslashify};
use crate::uri::S3Uri;

const BACKEND: &str = "s3";
const DEFAULT_BUFFER_SIZE: usize = 5 * 1024 * 1024;

struct MultipartState {
    upload_id: String,
    next_part_number: i32,
    parts: Vec<CompletedPart>,
}

/// S3 backend for one bucket.
pub struct S3Fs {
    rt: Runtime,
    client: Client,
    bucket: String,
    working_dir: String,
    write_map: Mutex<HashMap<String, MultipartState>>,
    sizes: BufferSizes,
}

fn sdk_err(path: &str, e: impl std::fmt::Display) -> GridError {
    GridError::io_msg(path, e.to_string())
}

impl S3Fs {
    /// Connects to the bucket named by an `s3://` home URI using the SDK
    /// credential chain. The bucket must already exist.
    pub fn connect(home: &str) -> GridResult<Self> {
        let uri = S3Uri::parse(home)?;
        if uri.bucket().is_empty() {
            return Err(GridError::InvalidUri {
                uri: home.to_string(),
                reason: "S3 URI does not name a bucket".to_string(),
            });
        }
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| GridError::Auth {
                backend: BACKEND,
                reason: format!("could not start the SDK runtime: {e}"),
            })?;
        let config = rt.block_on(async {
            aws_config::defaults(aws_config::BehaviorVersion::latest())
                .load()
                .await
        });
        let client = Client::new(&config);
        rt.block_on(async {
            client
                .head_bucket()
                .bucket(uri.bucket())
                .send()
                .await
                .map_err(|e| GridError::Auth {
                    backend: BACKEND,
                    reason: format!("bucket {} is not reachable: {e}", uri.bucket()),
                })
        })?;

        let mut fs = Self::with_client(rt, client, uri.bucket());
        let working_dir = fs.get_path(uri.path());
        fs.working_dir = working_dir;
        Ok(fs)
    }

    /// Builds a backend from an already-configured client without
    /// probing the bucket.
    pub fn with_client(rt: Runtime, client: Client, bucket: &str) -> Self {
        Self {
            rt,
            client,
            bucket: bucket.to_string(),
            working_dir: String::new(),
            write_map: Mutex::new(HashMap::new()),
            sizes: BufferSizes::new(DEFAULT_BUFFER_SIZE, DEFAULT_BUFFER_SIZE),
        }
    }

    fn get_path(&self, path: &str) -> String {
        let mut pathname = path.to_string();
        if path.contains("://") {
            match S3Uri::parse(path) {
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

    fn head_object(&self, key: &str) -> GridResult<Option<u64>> {
        self.rt.block_on(async {
            match self
                .client
                .head_object()
                .bucket(&self.bucket)
                .key(key)
                .send()
                .await
            {
                Ok(out) => Ok(Some(out.content_length().unwrap_or(0).max(0) as u64)),
                Err(e) => {
                    if e.as_service_error().is_some_and(|se| se.is_not_found()) {
                        Ok(None)
                    } else {
                        Err(sdk_err(key, e))
                    }
                }
            }
        })
    }

    fn list(
        &self,
        prefix: &str,
        delimiter: Option<&str>,
        max_keys: Option<i32>,
    ) -> GridResult<(Vec<String>, Vec<String>)> {
        self.rt.block_on(async {
            let mut keys = Vec::new();
            let mut prefixes = Vec::new();
            let mut continuation: Option<String> = None;
            loop {
                let mut request = self
                    .client
                    .list_objects_v2()
                    .bucket(&self.bucket)
                    .prefix(prefix);
                if let Some(d) = delimiter {
                    request = request.delimiter(d);
                }
                if let Some(m) = max_keys {
                    request = request.max_keys(m);
                }
                if let Some(token) = &continuation {
                    request = request.continuation_token(token);
                }
                let out = request.send().await.map_err(|e| sdk_err(prefix, e))?;
                keys.extend(out.contents().iter().filter_map(|o| o.key().map(String::from)));
                prefixes.extend(
                    out.common_prefixes()
                        .iter()
                        .filter_map(|p| p.prefix().map(String::from)),
                );
                match out.next_continuation_token() {
                    Some(token) if max_keys.is_none() => continuation = Some(token.to_string()),
                    _ => break,
                }
            }
            Ok((keys, prefixes))
        })
    }

    fn put_empty_object(&self, key: &str) -> GridResult<()> {
        self.rt.block_on(async {
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(key)
                .body(ByteStream::from_static(b""))
                .send()
                .await
                .map(|_| ())
                .map_err(|e| sdk_err(key, e))
        })
    }

    fn delete_object(&self, key: &str) -> GridResult<()> {
        self.rt.block_on(async {
            self.client
                .delete_object()
                .bucket(&self.bucket)
                .key(key)
                .send()
                .await
                .map(|_| ())
                .map_err(|e| sdk_err(key, e))
        })
    }

    fn path_exists(&self, path: &str) -> bool {
        if path.ends_with('/') {
            if matches!(self.head_object(path), Ok(Some(_))) {
                return true;
            }
            matches!(
                self.list(path, Some("/"), Some(1)),
                Ok((keys, prefixes)) if !keys.is_empty() || !prefixes.is_empty()
            )
        } else {
            matches!(self.head_object(path), Ok(Some(_)))
        }
    }
}

impl StorageBackend for S3Fs {
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
            let uri = S3Uri::parse(path)?;
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
        // Object stores have no directories; the hierarchy is implied.
        Ok(())
    }

    fn delete_dir(&self, path: &str) -> GridResult<()> {
        if !self.is_dir(path) {
            return Err(GridError::NotFound(path.to_string()));
        }
        let prefix = slashify(&self.get_path(path));
        let (keys, _) = self.list(&prefix, None, None)?;
        for key in keys {
            self.delete_object(&key)?;
        }
        Ok(())
    }

    fn get_dirs(&self, path: &str) -> GridResult<Vec<String>> {
        let prefix = slashify(&self.get_path(path));
        let (_, prefixes) = self.list(&prefix, Some("/"), None)?;
        Ok(prefixes.iter().map(|p| unslashify(p)).collect())
    }

    fn get_files(&self, path: &str) -> GridResult<Vec<String>> {
        let prefix = slashify(&self.get_path(path));
        let (keys, _) = self.list(&prefix, Some("/"), None)?;
        Ok(keys.into_iter().filter(|k| !k.ends_with('/')).collect())
    }

    fn create_file(&self, path: &str) -> GridResult<()> {
        if self.is_file(path) {
            return Err(GridError::AlreadyExists(path.to_string()));
        }
        self.put_empty_object(&self.get_path(path))
    }

    fn delete_file(&self, path: &str) -> GridResult<()> {
        let key = unslashify(&self.get_path(path));
        if !self.path_exists(&key) {
            return Err(GridError::NotFound(path.to_string()));
        }
        self.delete_object(&key)
    }

    fn file_size(&self, path: &str) -> GridResult<u64> {
        self.head_object(&unslashify(&self.get_path(path)))?
            .ok_or_else(|| GridError::NotFound(path.to_string()))
    }

    fn read_from_file(&self, path: &str, offset: u64, buf: &mut [u8]) -> GridResult<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let key = unslashify(&self.get_path(path));
        let range = format!("bytes={}-{}", offset, offset + buf.len() as u64 - 1);
        let bytes = self.rt.block_on(async {
            let out = self
                .client
                .get_object()
                .bucket(&self.bucket)
                .key(&key)
                .range(range)
                .send()
                .await
                .map_err(|e| sdk_err(&key, e))?;
            out.body
                .collect()
                .await
                .map(aws_sdk_s3::primitives::AggregatedBytes::into_bytes)
                .map_err(|e| sdk_err(&key, e))
        })?;
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
        let key = self.get_path(path);
        if buf.is_empty() {
            if !self.path_exists(&key) {
                return self.put_empty_object(&key);
            }
            return Ok(());
        }

        // Start the multipart upload lazily on the first write.
        let part_number = {
            let mut map = self
                .write_map
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if !map.contains_key(&key) {
                let upload_id = self.rt.block_on(async {
                    self.client
                        .create_multipart_upload()
                        .bucket(&self.bucket)
                        .key(&key)
                        .send()
                        .await
                        .map_err(|e| sdk_err(&key, e))?
                        .upload_id()
                        .map(String::from)
                        .ok_or_else(|| {
                            GridError::io_msg(&key, "service returned no upload id")
                        })
                })?;
                debug!("started multipart upload {upload_id} for {key}");
                map.insert(
                    key.clone(),
                    MultipartState {
                        upload_id,
                        next_part_number: 1,
                        parts: Vec::new(),
                    },
                );
            }
            let state = map.get_mut(&key).expect("state just inserted");
            let n = state.next_part_number;
            state.next_part_number += 1;
            n
        };

        let upload_id = {
            let map = self
                .write_map
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            map.get(&key).map(|s| s.upload_id.clone())
        }
        .ok_or_else(|| GridError::io_msg(&key, "upload vanished mid-write"))?;

        let e_tag = self.rt.block_on(async {
            self.client
                .upload_part()
                .bucket(&self.bucket)
                .key(&key)
                .upload_id(&upload_id)
                .part_number(part_number)
                .body(ByteStream::from(Bytes::copy_from_slice(buf)))
                .send()
                .await
                .map_err(|e| sdk_err(&key, e))
                .map(|out| out.e_tag().map(String::from))
        })?;

        let mut map = self
            .write_map
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(state) = map.get_mut(&key) {
            let mut part = CompletedPart::builder().part_number(part_number);
            if let Some(tag) = e_tag {
                part = part.e_tag(tag);
            }
            state.parts.push(part.build());
        }
        Ok(())
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
        let key = self.get_path(path);
        let state = {
            let mut map = self
                .write_map
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            map.remove(&key)
        };
        let Some(mut state) = state else {
            return Ok(());
        };
        debug!(
            "completing multipart upload {} for {key} with {} parts",
            state.upload_id,
            state.parts.len()
        );
        state
            .parts
            .sort_by_key(|p| p.part_number().unwrap_or(i32::MAX));
        self.rt.block_on(async {
            self.client
                .complete_multipart_upload()
                .bucket(&self.bucket)
                .key(&key)
                .upload_id(&state.upload_id)
                .multipart_upload(
                    CompletedMultipartUpload::builder()
                        .set_parts(Some(state.parts))
                        .build(),
                )
                .send()
                .await
                .map(|_| ())
                .map_err(|e| sdk_err(&key, e))
        })
    }

    fn buffer_sizes(&self) -> &BufferSizes {
        &self.sizes
    }
}

#[cfg(test)]
mod tests {
    use aws_sdk_s3::Client;
    use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};

    use super::S3Fs;
    use crate::error::GridError;
    use crate::storage::StorageBackend;

    fn offline_backend() -> S3Fs {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("runtime");
        let config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new("us-east-1"))
            .credentials_provider(Credentials::new("test", "test", None, None, "test"))
            .build();
        S3Fs::with_client(rt, Client::from_conf(config), "test-bucket")
    }

    #[test]
    fn path_resolution_against_working_dir() {
        let mut fs = offline_backend();
        assert_eq!(fs.get_path("frag/a.tdb"), "frag/a.tdb");
        assert_eq!(fs.get_path("/frag/a.tdb"), "frag/a.tdb");
        assert_eq!(fs.get_path("s3://test-bucket/ws/frag"), "ws/frag");
        fs.working_dir = "ws".to_string();
        assert_eq!(fs.get_path("frag/a.tdb"), "ws/frag/a.tdb");
        assert_eq!(fs.get_path(""), "ws");
    }

    #[test]
    fn optional_operations_decline() {
        let fs = offline_backend();
        assert!(matches!(
            fs.move_path("a", "b"),
            Err(GridError::Unsupported { .. })
        ));
        assert!(!fs.locking_support());
        fs.sync_path("anything").expect("sync is a no-op");
        fs.close_file("never-written").expect("close without writes");
    }

    #[test]
    fn rejects_foreign_bucket_uris() {
        let fs = offline_backend();
        assert!(fs.real_dir("s3://other-bucket/x").is_err());
        assert_eq!(fs.real_dir("s3://test-bucket/x").expect("real dir"), "x");
    }
}
