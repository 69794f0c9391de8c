use std::collections::HashMap;

use crate::error::{GridError, GridResult};

fn invalid(uri: &str, reason: impl Into<String>) -> GridError {
    GridError::InvalidUri {
        uri: uri.to_string(),
        reason: reason.into(),
    }
}

/// A parsed `scheme://host[:port]/path?query` URI.
///
/// The query string is URL-decoded into a flat key/value map. Scheme and
/// host are case-insensitive and stored lowercased.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Uri {
    scheme: String,
    host: String,
    port: Option<u16>,
    path: String,
    query: HashMap<String, String>,
}

impl Uri {
    /// Parses a URI string, rejecting anything without a `://` separator,
    /// ports out of range, or malformed query pairs.
    pub fn parse(input: &str) -> GridResult<Self> {
        if input.is_empty() {
            return Err(invalid(input, "empty string"));
        }
        let Some(sep) = input.find("://") else {
            return Err(invalid(input, "missing scheme separator"));
        };
        let scheme = input[..sep].to_ascii_lowercase();
        let rest = &input[sep + 3..];

        let authority_end = rest.find('/').unwrap_or(rest.len());
        let (authority, path_and_query) = rest.split_at(authority_end);

        let (host_part, port_part) = match authority.find(':') {
            Some(colon) => (&authority[..colon], Some(&authority[colon + 1..])),
            None => (authority, None),
        };
        let host = host_part.to_ascii_lowercase();

        let port = match port_part {
            Some(p) if !p.is_empty() => match p.parse::<u64>() {
                Ok(v) if v <= u64::from(u16::MAX) => Some(v as u16),
                Ok(_) => return Err(invalid(input, "port out of range")),
                Err(_) => None,
            },
            _ => None,
        };

        let (path, query) = match path_and_query.find('?') {
            Some(q) => (
                path_and_query[..q].to_string(),
                parse_query(input, &path_and_query[q + 1..])?,
            ),
            None => (path_and_query.to_string(), HashMap::new()),
        };

        Ok(Self {
            scheme,
            host,
            port,
            path,
            query,
        })
    }

    /// The lowercased scheme.
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// The lowercased host, possibly empty.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The port, if one was given and numeric.
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// The path component, including its leading slash when present.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The URL-decoded query parameters.
    pub fn query(&self) -> &HashMap<String, String> {
        &self.query
    }
}

fn parse_query(uri: &str, raw: &str) -> GridResult<HashMap<String, String>> {
    let mut query = HashMap::new();
    for piece in raw.split('&') {
        if piece.is_empty() {
            continue;
        }
        let decoded = url_decode(piece);
        let Some(eq) = decoded.find('=') else {
            return Err(invalid(uri, format!("query piece `{piece}` has no value")));
        };
        if eq == 0 {
            return Err(invalid(uri, format!("query piece `{piece}` has no key")));
        }
        query.insert(decoded[..eq].to_string(), decoded[eq + 1..].to_string());
    }
    Ok(query)
}

fn url_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hi = (bytes[i + 1] as char).to_digit(16);
            let lo = (bytes[i + 2] as char).to_digit(16);
            if let (Some(hi), Some(lo)) = (hi, lo) {
                out.push((hi * 16 + lo) as u8);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Azure Blob view of a URI.
///
/// Two forms are accepted:
/// * `az://<container>@<account>.blob.core.windows.net/<path>`
/// * `azb://<container>/<path>?account=<account>&endpoint=<endpoint>`
#[derive(Debug, Clone)]
pub struct AzureUri {
    uri: Uri,
    account: String,
    container: String,
    endpoint: String,
}

impl AzureUri {
    /// Parses an `az://` or `azb://` URI into its Azure components.
    pub fn parse(input: &str) -> GridResult<Self> {
        let uri = Uri::parse(input)?;
        let (account, container, endpoint) = if uri.scheme() == "azb" {
            (
                uri.query().get("account").cloned().unwrap_or_default(),
                uri.host().to_string(),
                uri.query().get("endpoint").cloned().unwrap_or_default(),
            )
        } else {
            let host = uri.host();
            match (host.find('@'), host.find('.')) {
                (Some(at), Some(dot)) if dot > at => (
                    host[at + 1..dot].to_string(),
                    host[..at].to_string(),
                    host[at + 1..].to_string(),
                ),
                (Some(at), _) => (String::new(), host[..at].to_string(), String::new()),
                (None, _) => (String::new(), host.to_string(), String::new()),
            }
        };
        Ok(Self {
            uri,
            account,
            container,
            endpoint,
        })
    }

    /// The storage account name.
    pub fn account(&self) -> &str {
        &self.account
    }

    /// The blob container name.
    pub fn container(&self) -> &str {
        &self.container
    }

    /// The blob endpoint host, empty when not encoded in the URI.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// The underlying generic URI.
    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// The path component.
    pub fn path(&self) -> &str {
        self.uri.path()
    }
}

/// S3 view of a URI: `s3://<bucket>/<path>`.
#[derive(Debug, Clone)]
pub struct S3Uri {
    uri: Uri,
    bucket: String,
}

impl S3Uri {
    /// Parses an `s3://` URI.
    pub fn parse(input: &str) -> GridResult<Self> {
        let uri = Uri::parse(input)?;
        let bucket = uri.host().to_string();
        Ok(Self { uri, bucket })
    }

    /// The bucket name.
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// The path component.
    pub fn path(&self) -> &str {
        self.uri.path()
    }
}

/// GCS view of a URI: `gs://<bucket>/<path>`.
#[derive(Debug, Clone)]
pub struct GcsUri {
    uri: Uri,
    bucket: String,
}

impl GcsUri {
    /// Parses a `gs://` URI.
    pub fn parse(input: &str) -> GridResult<Self> {
        let uri = Uri::parse(input)?;
        let bucket = uri.host().to_string();
        Ok(Self { uri, bucket })
    }

    /// The bucket name.
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// The path component.
    pub fn path(&self) -> &str {
        self.uri.path()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::{AzureUri, Uri};

    fn check(
        input: &str,
        scheme: &str,
        host: &str,
        port: Option<u16>,
        path: &str,
        query: &[(&str, &str)],
    ) {
        let uri = Uri::parse(input).expect(input);
        assert_eq!(uri.scheme(), scheme, "scheme of {input}");
        assert_eq!(uri.host(), host, "host of {input}");
        assert_eq!(uri.port(), port, "port of {input}");
        assert_eq!(uri.path(), path, "path of {input}");
        let expected: HashMap<String, String> = query
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        assert_eq!(*uri.query(), expected, "query of {input}");
    }

    #[test]
    fn rejects_non_uris() {
        assert!(Uri::parse("").is_err());
        assert!(Uri::parse("gibberish").is_err());
        assert!(Uri::parse("foo://xxx:9999999/dfdfd").is_err());
    }

    #[test]
    fn parses_hosts_ports_and_paths() {
        check("hdfs://oda-master:9000/tmp", "hdfs", "oda-master", Some(9000), "/tmp", &[]);
        check("hdfs://oda-master:9000/", "hdfs", "oda-master", Some(9000), "/", &[]);
        check("hdfs://oda-master:9000", "hdfs", "oda-master", Some(9000), "", &[]);
        check("hdfs://oda-master", "hdfs", "oda-master", None, "", &[]);
        check("hdfs://:9000", "hdfs", "", Some(9000), "", &[]);
        check("hdfs://", "hdfs", "", None, "", &[]);
        check("hdfs:///", "hdfs", "", None, "/", &[]);
        check("hdfs:///tmp", "hdfs", "", None, "/tmp", &[]);
        check("s3://s3-bucket/tmp", "s3", "s3-bucket", None, "/tmp", &[]);
        check("gs://gcs-bucket/tmp", "gs", "gcs-bucket", None, "/tmp", &[]);
    }

    #[test]
    fn parses_queries() {
        check(
            "fdfdfd://dfdfd/fdfdf?fdf=fdfdf",
            "fdfdfd",
            "dfdfd",
            None,
            "/fdfdf",
            &[("fdf", "fdfdf")],
        );
        check(
            "hdfs://h:9000/tmp?a=val&b=other&c=last",
            "hdfs",
            "h",
            Some(9000),
            "/tmp",
            &[("a", "val"), ("b", "other"), ("c", "last")],
        );
        // Empty pieces between ampersands are tolerated.
        check(
            "hdfs://h:9000/tmp?a=val&&b=other",
            "hdfs",
            "h",
            Some(9000),
            "/tmp",
            &[("a", "val"), ("b", "other")],
        );
    }

    #[test]
    fn rejects_malformed_queries() {
        assert!(Uri::parse("hdfs://h:9000/tmp?query&another=someval").is_err());
        assert!(Uri::parse("fdfdfd://dfdfd/fdfdf?firstQ=firstval&secondQ").is_err());
        assert!(Uri::parse("hdfs://h:9000/tmp?query=someval&=otherquery").is_err());
    }

    #[test]
    fn decodes_query_values() {
        check(
            "hdfs://h/tmp?q=this%20is%20a%20field&r=was%20it%20clear%20%28already%29%3F",
            "hdfs",
            "h",
            None,
            "/tmp",
            &[("q", "this is a field"), ("r", "was it clear (already)?")],
        );
        // Plus signs and embedded equals survive; only the first `=` splits.
        check(
            "hdfs://h/tmp?q=someval123+otherval123==",
            "hdfs",
            "h",
            None,
            "/tmp",
            &[("q", "someval123+otherval123==")],
        );
    }

    #[test]
    fn azure_account_container_from_host() {
        let az = AzureUri::parse("az://test@mytest.blob.core.windows.net/ws").expect("az uri");
        assert_eq!(az.account(), "mytest");
        assert_eq!(az.container(), "test");
        assert_eq!(az.endpoint(), "mytest.blob.core.windows.net");
        assert_eq!(az.path(), "/ws");
    }

    #[test]
    fn azure_account_from_query() {
        let az = AzureUri::parse("azb://test/ws?account=mytest&endpoint=mytest.blob.core.windows.net")
            .expect("azb uri");
        assert_eq!(az.account(), "mytest");
        assert_eq!(az.container(), "test");
        assert_eq!(az.endpoint(), "mytest.blob.core.windows.net");
        assert_eq!(az.path(), "/ws");
    }
}
