//! Upload transport: packages a pprof `Profile` into the multipart form
//! the ingestion endpoint expects and POSTs it, either to a local trace
//! agent or straight to the agentless intake (spec §4.10).

use std::io::Write;
use std::time::Duration;

use prost::Message;
use reqwest::blocking::{multipart, Client};

use super::pprof_proto::Profile;

#[derive(Debug, Clone)]
pub enum Endpoint {
    /// Upload through a local agent at `base_url`, no API key required.
    Agent { base_url: String },
    /// Upload directly to the intake, authenticated with an API key.
    Agentless { intake_url: String, api_key: String },
}

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("failed to gzip-encode profile: {0}")]
    Compress(#[source] std::io::Error),
    #[error("request build failed: {0}")]
    Build(#[source] reqwest::Error),
    #[error("upload failed: {0}")]
    Transport(#[source] reqwest::Error),
    #[error("endpoint rejected the upload with status {0}")]
    Rejected(reqwest::StatusCode),
}

/// A snapshot ready to upload: the pprof bytes plus the tags/metadata
/// that accompany every profile (spec §4.10's event.json sidecar).
pub struct UploadRequest {
    pub profile: Profile,
    pub start: Duration,
    pub end: Duration,
    pub tags: Vec<(String, String)>,
    pub family: &'static str,
    /// Monotonic profile sequence number, persisted across worker
    /// restarts (`stats::PersistentState`) so a respawned worker doesn't
    /// repeat a sequence number the intake already saw.
    pub profile_seq: u64,
}

/// How a rejected upload should be handled (spec §4.10): a gateway
/// timeout is the intake shedding load and is worth dropping silently,
/// an auth/not-found rejection will never succeed on retry, and
/// anything else is a transient failure the caller should count across
/// cycles rather than within a single upload's own retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionKind {
    Drop,
    Fatal,
    Transient,
}

impl ExportError {
    pub fn rejection_kind(&self) -> RejectionKind {
        match self {
            ExportError::Rejected(status) if *status == reqwest::StatusCode::GATEWAY_TIMEOUT => RejectionKind::Drop,
            ExportError::Rejected(status)
                if *status == reqwest::StatusCode::FORBIDDEN || *status == reqwest::StatusCode::NOT_FOUND =>
            {
                RejectionKind::Fatal
            }
            _ => RejectionKind::Transient,
        }
    }
}

pub struct Exporter {
    client: Client,
    endpoint: Endpoint,
}

impl Exporter {
    pub fn new(endpoint: Endpoint, timeout: Duration) -> Result<Self, ExportError> {
        let client = Client::builder().timeout(timeout).build().map_err(ExportError::Build)?;
        Ok(Exporter { client, endpoint })
    }

    /// Uploads one profile, retrying transient transport failures up to
    /// `max_attempts` times with a fixed backoff; a non-2xx response past
    /// the first attempt is not retried (the agent/intake already saw and
    /// rejected the body, retrying won't change that).
    pub fn upload(&self, request: &UploadRequest, max_attempts: u32) -> Result<(), ExportError> {
        let mut encoded = Vec::new();
        request.profile.encode(&mut encoded).expect("encoding a well-formed Profile cannot fail");
        let gzipped = gzip(&encoded)?;

        let mut last_err = None;
        for attempt in 0..max_attempts.max(1) {
            match self.try_upload(request, &gzipped) {
                Ok(()) => return Ok(()),
                Err(ExportError::Rejected(status)) => return Err(ExportError::Rejected(status)),
                Err(e) => {
                    log::warn!("profile upload attempt {attempt} failed: {e}");
                    last_err = Some(e);
                    std::thread::sleep(Duration::from_millis(200 * (attempt as u64 + 1)));
                }
            }
        }
        Err(last_err.expect("loop runs at least once"))
    }

    fn try_upload(&self, request: &UploadRequest, gzipped: &[u8]) -> Result<(), ExportError> {
        let event_json = build_event_json(request);

        let part = multipart::Part::bytes(gzipped.to_vec())
            .file_name("profile.pprof")
            .mime_str("application/octet-stream")
            .map_err(ExportError::Build)?
            .headers({
                let mut headers = reqwest::header::HeaderMap::new();
                headers.insert("Content-Encoding", "gzip".parse().unwrap());
                headers
            });
        let event_part = multipart::Part::text(event_json)
            .file_name("event.json")
            .mime_str("application/json")
            .map_err(ExportError::Build)?;

        let form = multipart::Form::new()
            .part(format!("{}.pprof", request.family), part)
            .part("event", event_part);

        let (url, builder) = match &self.endpoint {
            Endpoint::Agent { base_url } => {
                let url = format!("{base_url}/profiling/v1/input");
                (url.clone(), self.client.post(url))
            }
            Endpoint::Agentless { intake_url, api_key } => {
                let builder = self
                    .client
                    .post(intake_url)
                    .header("DD-API-KEY", api_key.as_str());
                (intake_url.clone(), builder)
            }
        };

        let response = builder.multipart(form).send().map_err(ExportError::Transport)?;
        let status = response.status();
        if !status.is_success() {
            log::error!("upload to {url} rejected: {status}");
            return Err(ExportError::Rejected(status));
        }
        Ok(())
    }
}

fn build_event_json(request: &UploadRequest) -> String {
    let tags = request
        .tags
        .iter()
        .map(|(k, v)| format!("{k}:{v}"))
        .collect::<Vec<_>>()
        .join(",");
    format!(
        r#"{{"start":"{}","end":"{}","family":"{}","tags_profiler":"{}","version":"4","profile_seq":{}}}"#,
        humantime::format_rfc3339(std::time::UNIX_EPOCH + request.start),
        humantime::format_rfc3339(std::time::UNIX_EPOCH + request.end),
        request.family,
        tags,
        request.profile_seq,
    )
}

fn gzip(bytes: &[u8]) -> Result<Vec<u8>, ExportError> {
    use flate2::write::GzEncoder;
    use flate2::Compression;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes).map_err(ExportError::Compress)?;
    encoder.finish().map_err(ExportError::Compress)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_json_includes_family_and_tags() {
        let request = UploadRequest {
            profile: Profile::default(),
            start: Duration::from_secs(1000),
            end: Duration::from_secs(1060),
            tags: vec![("service".to_owned(), "demo".to_owned())],
            family: "native",
            profile_seq: 7,
        };
        let json = build_event_json(&request);
        assert!(json.contains("\"family\":\"native\""));
        assert!(json.contains("service:demo"));
        assert!(json.contains("\"profile_seq\":7"));
    }

    #[test]
    fn rejection_kind_classifies_status_codes() {
        assert_eq!(
            ExportError::Rejected(reqwest::StatusCode::GATEWAY_TIMEOUT).rejection_kind(),
            RejectionKind::Drop
        );
        assert_eq!(
            ExportError::Rejected(reqwest::StatusCode::FORBIDDEN).rejection_kind(),
            RejectionKind::Fatal
        );
        assert_eq!(
            ExportError::Rejected(reqwest::StatusCode::NOT_FOUND).rejection_kind(),
            RejectionKind::Fatal
        );
        assert_eq!(
            ExportError::Rejected(reqwest::StatusCode::INTERNAL_SERVER_ERROR).rejection_kind(),
            RejectionKind::Transient
        );
    }

    #[test]
    fn gzip_roundtrips_through_flate2() {
        let data = b"hello pprof";
        let compressed = gzip(data).unwrap();
        use std::io::Read;
        let mut decoder = flate2::read::GzDecoder::new(compressed.as_slice());
        let mut out = Vec::new();
        decoder.read_to_end(&mut out).unwrap();
        assert_eq!(out, data);
    }
}
