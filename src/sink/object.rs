use std::fmt;
use std::io::{self, Read, Write};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use reqwest::blocking::{Body, Client};
use reqwest::header::CONTENT_TYPE;
use url::Url;

use crate::error::{PipelineError, Result};

const UPLOAD_QUEUE_DEPTH: usize = 16;

/// HTTP object store addressed as `{endpoint}/{bucket}/{name}`.
#[derive(Clone)]
pub struct ObjectStore {
    client: Client,
    endpoint: Url,
    bucket: String,
    token: Option<String>,
}

impl fmt::Debug for ObjectStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectStore")
            .field("endpoint", &self.endpoint.as_str())
            .field("bucket", &self.bucket)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl ObjectStore {
    /// Builds a store client. `timeout` bounds connecting, not the whole upload.
    pub fn new(
        endpoint: Url,
        bucket: impl Into<String>,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let bucket = bucket.into();
        if bucket.trim().is_empty() {
            return Err(PipelineError::config("bucket name is required"));
        }
        if endpoint.cannot_be_a_base() {
            return Err(PipelineError::config(format!(
                "object endpoint `{endpoint}` cannot hold a path"
            )));
        }
        let client = Client::builder()
            .connect_timeout(timeout)
            .timeout(None)
            .build()
            .map_err(|err| PipelineError::config(format!("failed to build object store client: {err}")))?;
        Ok(Self {
            client,
            endpoint,
            bucket,
            token: token.filter(|t| !t.trim().is_empty()),
        })
    }

    /// Bucket objects are written to.
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// URL of object `name`; each `/`-separated part is percent-encoded.
    pub fn object_url(&self, name: &str) -> Result<Url> {
        let mut url = self.endpoint.clone();
        {
            let mut segments = url.path_segments_mut().map_err(|_| {
                PipelineError::config(format!("object endpoint `{}` cannot hold a path", self.endpoint))
            })?;
            segments.pop_if_empty().push(&self.bucket);
            for part in name.split('/').filter(|part| !part.is_empty()) {
                segments.push(part);
            }
        }
        Ok(url)
    }

    pub(crate) fn describe(&self, name: &str) -> String {
        match self.object_url(name) {
            Ok(url) => url.to_string(),
            Err(_) => format!("{}/{}", self.bucket, name),
        }
    }

    pub(crate) fn open_upload(&self, name: &str) -> Result<ObjectUpload> {
        let url = self.object_url(name)?;
        let (sender, receiver) = bounded::<Frame>(UPLOAD_QUEUE_DEPTH);
        let mut request = self
            .client
            .put(url.clone())
            .header(CONTENT_TYPE, "application/x-ndjson")
            .body(Body::new(ChannelReader::new(receiver)));
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let target = url.to_string();
        let handle = thread::Builder::new()
            .name("govner-upload".to_string())
            .spawn(move || {
                let response = request
                    .send()
                    .map_err(|err| format!("upload request failed: {err}"))?;
                let status = response.status();
                if status.is_success() {
                    Ok(())
                } else {
                    let body = response.text().unwrap_or_default();
                    Err(format!("object store answered {status}: {}", body.trim()))
                }
            })
            .map_err(|err| PipelineError::sink(&target, err))?;

        Ok(ObjectUpload {
            sender: Some(sender),
            handle: Some(handle),
        })
    }
}

/// What the request body reads next.
enum Frame {
    Data(Vec<u8>),
    /// Fails the body so the request is torn down before the store commits the object.
    Abort,
}

/// Writer half of a streamed `PUT`; bytes reach the request body through a bounded channel.
pub(crate) struct ObjectUpload {
    sender: Option<Sender<Frame>>,
    handle: Option<JoinHandle<std::result::Result<(), String>>>,
}

impl ObjectUpload {
    /// Ends the body and waits for the store's answer.
    pub(crate) fn finish(mut self) -> io::Result<()> {
        self.complete()
    }

    /// Cancels the request so nothing is stored under the object name.
    pub(crate) fn abort(mut self) -> io::Result<()> {
        self.cancel();
        Ok(())
    }

    fn cancel(&mut self) {
        if let Some(sender) = self.sender.take() {
            let _ = sender.send(Frame::Abort);
        }
        if let Some(handle) = self.handle.take() {
            match handle.join() {
                Ok(Ok(())) => tracing::warn!("object store accepted a cancelled upload"),
                Ok(Err(message)) => tracing::debug!(reason = %message, "object upload cancelled"),
                Err(_) => tracing::warn!("upload thread panicked"),
            }
        }
    }

    fn complete(&mut self) -> io::Result<()> {
        self.sender.take();
        match self.handle.take() {
            Some(handle) => match handle.join() {
                Ok(Ok(())) => Ok(()),
                Ok(Err(message)) => Err(io::Error::other(message)),
                Err(_) => Err(io::Error::other("upload thread panicked")),
            },
            None => Ok(()),
        }
    }
}

impl Write for ObjectUpload {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "upload already finished"))?;
        if sender.send(Frame::Data(buf.to_vec())).is_err() {
            // The request ended early; its outcome carries the real reason.
            let reason = match self.complete() {
                Err(err) => err.to_string(),
                Ok(()) => "object store closed the upload early".to_string(),
            };
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, reason));
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for ObjectUpload {
    fn drop(&mut self) {
        self.cancel();
    }
}

struct ChannelReader {
    receiver: Receiver<Frame>,
    current: Vec<u8>,
    offset: usize,
}

impl ChannelReader {
    fn new(receiver: Receiver<Frame>) -> Self {
        Self {
            receiver,
            current: Vec::new(),
            offset: 0,
        }
    }
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        while self.offset >= self.current.len() {
            match self.receiver.recv() {
                Ok(Frame::Data(next)) => {
                    self.current = next;
                    self.offset = 0;
                }
                Ok(Frame::Abort) => return Err(io::Error::other("upload cancelled")),
                Err(_) => return Ok(0),
            }
        }
        let available = &self.current[self.offset..];
        let count = available.len().min(buf.len());
        buf[..count].copy_from_slice(&available[..count]);
        self.offset += count;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(endpoint: &str) -> ObjectStore {
        ObjectStore::new(
            Url::parse(endpoint).unwrap(),
            "govuk-content",
            None,
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[test]
    fn object_urls_encode_each_segment() {
        let store = store("http://localhost:9000/storage/");
        let url = store
            .object_url("content_ner/entities_010224_title_0.jsonl")
            .unwrap();
        assert_eq!(
            url.as_str(),
            "http://localhost:9000/storage/govuk-content/content_ner/entities_010224_title_0.jsonl"
        );
        let spaced = store.object_url("a b/c").unwrap();
        assert_eq!(spaced.path(), "/storage/govuk-content/a%20b/c");
    }

    #[test]
    fn empty_bucket_is_rejected() {
        let result = ObjectStore::new(
            Url::parse("http://localhost:9000").unwrap(),
            " ",
            None,
            Duration::from_secs(5),
        );
        assert!(matches!(result, Err(PipelineError::Configuration(_))));
    }

    #[test]
    fn channel_reader_concatenates_buffers() {
        let (sender, receiver) = bounded(4);
        sender.send(Frame::Data(b"hello ".to_vec())).unwrap();
        sender.send(Frame::Data(Vec::new())).unwrap();
        sender.send(Frame::Data(b"world".to_vec())).unwrap();
        drop(sender);
        let mut out = String::new();
        ChannelReader::new(receiver).read_to_string(&mut out).unwrap();
        assert_eq!(out, "hello world");
    }

    #[test]
    fn abort_fails_the_body() {
        let (sender, receiver) = bounded(4);
        sender.send(Frame::Data(b"partial".to_vec())).unwrap();
        sender.send(Frame::Abort).unwrap();
        let mut out = Vec::new();
        assert!(ChannelReader::new(receiver).read_to_end(&mut out).is_err());
    }

    #[test]
    fn debug_hides_token() {
        let store = ObjectStore::new(
            Url::parse("http://localhost:9000").unwrap(),
            "bucket",
            Some("secret".into()),
            Duration::from_secs(5),
        )
        .unwrap();
        assert!(!format!("{store:?}").contains("secret"));
    }
}
