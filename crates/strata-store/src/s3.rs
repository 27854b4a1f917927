use std::future::Future;
use std::time::Duration;

use aws_sdk_s3::error::ProvideErrorMetadata;
use aws_sdk_s3::primitives::{AggregatedBytes, ByteStream};

use crate::{validate_key, ObjectStore, StoreError, StoreStat};

const PRESIGN_EXPIRY: Duration = Duration::from_secs(900);

#[derive(Debug, Clone)]
pub struct S3Store {
    client: aws_sdk_s3::Client,
    bucket: String,
    prefix: String,
}

impl S3Store {
    /// Create an S3-backed store from a `s3://bucket/prefix` URL with the
    /// leading scheme stripped (i.e. pass `bucket/prefix`).
    pub fn from_env_url(rest: &str) -> Result<Self, StoreError> {
        let (bucket, prefix) = parse_bucket_prefix(rest)?;
        let client = block_on(client_from_env())??;
        Ok(Self {
            client,
            bucket,
            prefix,
        })
    }

    fn object_key(&self, key: &str) -> Result<String, StoreError> {
        validate_key(key)?;
        if self.prefix.is_empty() {
            Ok(key.to_string())
        } else {
            Ok(format!("{}/{key}", self.prefix))
        }
    }
}

impl ObjectStore for S3Store {
    fn head(&self, key: &str) -> Result<StoreStat, StoreError> {
        let k = self.object_key(key)?;
        let out = block_on({
            let c = self.client.clone();
            let bucket = self.bucket.clone();
            async move { c.head_object().bucket(bucket).key(k).send().await }
        })?;
        match out {
            Ok(head) => Ok(StoreStat {
                exists: true,
                size: head.content_length().unwrap_or(0).max(0) as u64,
                etag: head.e_tag().map(str::to_string),
            }),
            Err(err) if is_not_found(&err) => Ok(StoreStat {
                exists: false,
                size: 0,
                etag: None,
            }),
            Err(err) => Err(map_sdk_err(key, err)),
        }
    }

    fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let k = self.object_key(key)?;
        let out = block_on({
            let c = self.client.clone();
            let bucket = self.bucket.clone();
            async move {
                let resp = c.get_object().bucket(bucket).key(k).send().await?;
                let bytes: AggregatedBytes = resp
                    .body
                    .collect()
                    .await
                    .map_err(|e| GetFailure::Collect(format!("{e:?}")))?;
                Ok::<_, GetFailure>(bytes.into_bytes().to_vec())
            }
        })?;
        out.map_err(|e| e.into_store_error(key))
    }

    fn get_range(&self, key: &str, start: u64, len: u64) -> Result<Vec<u8>, StoreError> {
        if len == 0 {
            return Ok(Vec::new());
        }
        let k = self.object_key(key)?;
        let end = start
            .checked_add(len)
            .and_then(|e| e.checked_sub(1))
            .ok_or_else(|| StoreError::RangeUnsatisfiable {
                key: key.to_string(),
                start,
                len,
                size: 0,
            })?;
        let range = format!("bytes={start}-{end}");

        let out = block_on({
            let c = self.client.clone();
            let bucket = self.bucket.clone();
            async move {
                let resp = c
                    .get_object()
                    .bucket(bucket)
                    .key(k)
                    .range(range)
                    .send()
                    .await?;
                let bytes: AggregatedBytes = resp
                    .body
                    .collect()
                    .await
                    .map_err(|e| GetFailure::Collect(format!("{e:?}")))?;
                Ok::<_, GetFailure>(bytes.into_bytes().to_vec())
            }
        })?;
        let bytes = out.map_err(|e| e.into_store_error(key))?;
        if bytes.len() as u64 != len {
            return Err(StoreError::RangeUnsatisfiable {
                key: key.to_string(),
                start,
                len,
                size: bytes.len() as u64,
            });
        }
        Ok(bytes)
    }

    fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let k = self.object_key(key)?;
        let body = bytes.to_vec();
        let out = block_on({
            let c = self.client.clone();
            let bucket = self.bucket.clone();
            async move {
                c.put_object()
                    .bucket(bucket)
                    .key(k)
                    .body(ByteStream::from(body))
                    .send()
                    .await
            }
        })?;
        out.map(|_| ()).map_err(|err| map_sdk_err(key, err))
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let list_prefix = if prefix.is_empty() {
            if self.prefix.is_empty() {
                String::new()
            } else {
                format!("{}/", self.prefix)
            }
        } else {
            format!("{}/", self.object_key(prefix)?)
        };

        let strip = if self.prefix.is_empty() {
            String::new()
        } else {
            format!("{}/", self.prefix)
        };

        let keys = block_on({
            let c = self.client.clone();
            let bucket = self.bucket.clone();
            async move {
                let mut keys: Vec<String> = Vec::new();
                let mut token: Option<String> = None;
                loop {
                    let mut req = c.list_objects_v2().bucket(&bucket);
                    if !list_prefix.is_empty() {
                        req = req.prefix(&list_prefix);
                    }
                    if let Some(t) = token.as_deref() {
                        req = req.continuation_token(t);
                    }
                    let resp = req.send().await?;
                    if let Some(contents) = resp.contents {
                        for obj in contents {
                            let Some(k) = obj.key else { continue };
                            if k.ends_with('/') {
                                continue;
                            }
                            keys.push(k);
                        }
                    }
                    if resp.is_truncated.unwrap_or(false) {
                        token = resp.next_continuation_token;
                        if token.is_none() {
                            break;
                        }
                    } else {
                        break;
                    }
                }
                Ok::<_, aws_sdk_s3::error::SdkError<
                    aws_sdk_s3::operation::list_objects_v2::ListObjectsV2Error,
                >>(keys)
            }
        })?;

        let mut keys = keys.map_err(|err| map_sdk_err(prefix, err))?;
        keys.sort();
        Ok(keys
            .into_iter()
            .filter_map(|k| k.strip_prefix(&strip).map(str::to_string))
            .collect())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        let k = self.object_key(key)?;
        let out = block_on({
            let c = self.client.clone();
            let bucket = self.bucket.clone();
            async move { c.delete_object().bucket(bucket).key(k).send().await }
        })?;
        out.map(|_| ()).map_err(|err| map_sdk_err(key, err))
    }

    fn presign(&self, key: &str) -> Result<String, StoreError> {
        let k = self.object_key(key)?;
        let out = block_on({
            let c = self.client.clone();
            let bucket = self.bucket.clone();
            async move {
                let cfg = aws_sdk_s3::presigning::PresigningConfig::expires_in(PRESIGN_EXPIRY)
                    .map_err(|e| GetFailure::Collect(format!("{e:?}")))?;
                let presigned = c
                    .get_object()
                    .bucket(bucket)
                    .key(k)
                    .presigned(cfg)
                    .await
                    .map_err(|e| GetFailure::Collect(format!("{e:?}")))?;
                Ok::<_, GetFailure>(presigned.uri().to_string())
            }
        })?;
        out.map_err(|e| e.into_store_error(key))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SdkErrorClass {
    NotFound,
    InvalidRange,
    Other,
}

enum GetFailure {
    Sdk(String, SdkErrorClass),
    Collect(String),
}

impl GetFailure {
    fn into_store_error(self, key: &str) -> StoreError {
        match self {
            GetFailure::Sdk(_, SdkErrorClass::NotFound) => StoreError::NotFound(key.to_string()),
            GetFailure::Sdk(_, SdkErrorClass::InvalidRange) => StoreError::RangeUnsatisfiable {
                key: key.to_string(),
                start: 0,
                len: 0,
                size: 0,
            },
            GetFailure::Sdk(message, SdkErrorClass::Other) => StoreError::io(key, message),
            GetFailure::Collect(message) => StoreError::io(key, message),
        }
    }
}

impl<E> From<aws_sdk_s3::error::SdkError<E>> for GetFailure
where
    E: ProvideErrorMetadata + std::fmt::Debug,
{
    fn from(err: aws_sdk_s3::error::SdkError<E>) -> Self {
        let class = match err.code() {
            Some("NoSuchKey") | Some("NotFound") => SdkErrorClass::NotFound,
            Some("InvalidRange") => SdkErrorClass::InvalidRange,
            _ => SdkErrorClass::Other,
        };
        GetFailure::Sdk(format!("{err:?}"), class)
    }
}

fn is_not_found<E: ProvideErrorMetadata>(err: &aws_sdk_s3::error::SdkError<E>) -> bool {
    matches!(err.code(), Some("NoSuchKey") | Some("NotFound") | Some("404"))
}

fn map_sdk_err<E: ProvideErrorMetadata + std::fmt::Debug>(
    key: &str,
    err: aws_sdk_s3::error::SdkError<E>,
) -> StoreError {
    if is_not_found(&err) {
        StoreError::NotFound(key.to_string())
    } else {
        StoreError::io(key, format!("{err:?}"))
    }
}

fn parse_bucket_prefix(rest: &str) -> Result<(String, String), StoreError> {
    let s = rest.trim().trim_matches('/');
    let mut it = s.splitn(2, '/');
    let bucket = it.next().unwrap_or("").trim();
    if bucket.is_empty() {
        return Err(StoreError::UnsupportedRoot(format!(
            "invalid s3 root: s3://{rest}"
        )));
    }
    let prefix = it.next().unwrap_or("").trim_matches('/').to_string();
    Ok((bucket.to_string(), prefix))
}

async fn client_from_env() -> Result<aws_sdk_s3::Client, StoreError> {
    let cfg = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;

    let endpoint_url: Option<String> = std::env::var("STRATA_S3_ENDPOINT_URL").ok();
    let force_path_style = match parse_env_bool("STRATA_S3_FORCE_PATH_STYLE")? {
        Some(v) => v,
        None => endpoint_url.is_some(),
    };

    let mut b = aws_sdk_s3::config::Builder::from(&cfg);
    if let Some(url) = endpoint_url {
        b = b.endpoint_url(url);
    }
    if force_path_style {
        b = b.force_path_style(true);
    }

    Ok(aws_sdk_s3::Client::from_conf(b.build()))
}

fn parse_env_bool(key: &str) -> Result<Option<bool>, StoreError> {
    match std::env::var(key) {
        Ok(v) => {
            let s = v.trim().to_ascii_lowercase();
            let b = match s.as_str() {
                "1" | "true" | "yes" | "y" | "on" => true,
                "0" | "false" | "no" | "n" | "off" => false,
                _ => {
                    return Err(StoreError::io(
                        key,
                        format!("invalid boolean env var value {v:?}"),
                    ))
                }
            };
            Ok(Some(b))
        }
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(StoreError::io(key, e)),
    }
}

fn block_on<Fut>(fut: Fut) -> Result<Fut::Output, StoreError>
where
    Fut: Future,
{
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => Ok(tokio::task::block_in_place(|| handle.block_on(fut))),
        Err(_) => {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .map_err(|e| StoreError::io("<tokio>", e))?;
            Ok(rt.block_on(fut))
        }
    }
}
