// SPDX-FileCopyrightText: 2025 The seedgate Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use super::UploadState;
use crate::altloc::format_x_alt;
use crate::http::ResponseHead;
use crate::storage::{FileDesc, RangeSet, Sha1Urn};

use std::net::SocketAddr;
use std::sync::Arc;

const SERVER: &str = concat!("seedgate/", env!("CARGO_PKG_VERSION"));

/// Retry-After for a partial file nobody is currently filling.
pub const INACTIVE_RETRY_AFTER_SECS: u64 = 60 * 60;

const FREELOADER_PAGE: &str = "<html><head><title>Please share</title></head><body>\
<h1>Please share</h1><p>This host only serves peers on the Gnutella network. \
Download a Gnutella client to get this file.</p></body></html>";

/// What a byte-range transfer will send.
#[derive(Debug, Clone)]
pub struct FileSection {
    pub file: Arc<FileDesc>,
    pub begin: u64,
    pub end: u64,
}

impl FileSection {
    pub fn len(&self) -> u64 {
        self.end - self.begin
    }

    pub fn is_empty(&self) -> bool {
        self.begin == self.end
    }

    pub fn is_whole_file(&self) -> bool {
        self.begin == 0 && self.end == self.file.size
    }
}

/// Body to send after the head.
#[derive(Debug)]
pub enum Body {
    Empty,
    Bytes(Vec<u8>),
    File(FileSection),
}

/// One response per request state, each knowing its own head, body and
/// whether the connection survives it.
#[derive(Debug)]
pub enum UploadResponse {
    File {
        section: FileSection,
        alt_locs: Vec<SocketAddr>,
    },
    Queued {
        position: usize,
        poll_min_secs: u64,
        poll_max_secs: u64,
        alt_locs: Vec<SocketAddr>,
    },
    LimitReached {
        retry_after_secs: u64,
    },
    UnavailableRange {
        available: RangeSet,
        retry_after_secs: Option<u64>,
    },
    Thex {
        urn: Sha1Urn,
        tree: Vec<u8>,
    },
    FileNotFound,
    MalformedRequest,
    Banned,
    Freeloader,
    BrowseHost {
        listing: String,
    },
    PushProxy {
        forwarded: bool,
    },
    UpdateFile {
        content: Vec<u8>,
    },
}

impl UploadResponse {
    pub fn state(&self) -> UploadState {
        match self {
            UploadResponse::File { .. } => UploadState::Uploading,
            UploadResponse::Queued { .. } => UploadState::Queued,
            UploadResponse::LimitReached { .. } => UploadState::LimitReached,
            UploadResponse::UnavailableRange { .. } => UploadState::UnavailableRange,
            UploadResponse::Thex { .. } => UploadState::ThexRequest,
            UploadResponse::FileNotFound => UploadState::FileNotFound,
            UploadResponse::MalformedRequest => UploadState::MalformedRequest,
            UploadResponse::Banned => UploadState::Banned,
            UploadResponse::Freeloader => UploadState::Freeloader,
            UploadResponse::BrowseHost { .. } => UploadState::BrowseHost,
            UploadResponse::PushProxy { .. } => UploadState::PushProxy,
            UploadResponse::UpdateFile { .. } => UploadState::UpdateFile,
        }
    }

    pub fn status(&self) -> u16 {
        match self {
            UploadResponse::File { section, .. } if !section.is_whole_file() => 206,
            UploadResponse::File { .. } => 200,
            UploadResponse::Queued { .. } | UploadResponse::LimitReached { .. } => 503,
            UploadResponse::UnavailableRange { .. } => 416,
            UploadResponse::FileNotFound => 404,
            UploadResponse::MalformedRequest => 400,
            UploadResponse::Banned => 403,
            UploadResponse::PushProxy { forwarded: true } => 202,
            UploadResponse::PushProxy { forwarded: false } => 410,
            UploadResponse::UpdateFile { .. } => 200,
            UploadResponse::Thex { .. }
            | UploadResponse::Freeloader
            | UploadResponse::BrowseHost { .. } => 200,
        }
    }

    pub fn should_close(&self) -> bool {
        matches!(
            self,
            UploadResponse::LimitReached { .. }
                | UploadResponse::MalformedRequest
                | UploadResponse::Banned
                | UploadResponse::Freeloader
                | UploadResponse::PushProxy { .. }
        )
    }

    fn body_text(&self) -> Option<&'static str> {
        match self {
            UploadResponse::LimitReached { .. } => Some("Server busy. Too many active uploads."),
            UploadResponse::FileNotFound => Some("File not found on server."),
            UploadResponse::MalformedRequest => Some("Malformed Request"),
            UploadResponse::Banned => Some("Your request has been refused. Try again later."),
            _ => None,
        }
    }

    pub fn content_length(&self) -> u64 {
        match self {
            UploadResponse::File { section, .. } => section.len(),
            UploadResponse::Thex { tree, .. } => tree.len() as u64,
            UploadResponse::Freeloader => FREELOADER_PAGE.len() as u64,
            UploadResponse::BrowseHost { listing } => listing.len() as u64,
            UploadResponse::UpdateFile { content } => content.len() as u64,
            other => other.body_text().map_or(0, |text| text.len() as u64),
        }
    }

    pub fn head(&self) -> ResponseHead {
        let mut head = ResponseHead::new(self.status()).with("Server", SERVER);

        match self {
            UploadResponse::File { section, alt_locs } => {
                let fd = &section.file;
                head = head
                    .with("Content-Type", "application/binary")
                    .with(
                        "Content-Disposition",
                        format!(
                            "attachment; filename=\"{}\"",
                            urlencoding::encode(&fd.name)
                        ),
                    )
                    .with("Accept-Ranges", "bytes")
                    .with("X-Gnutella-Content-URN", fd.urn.to_string());
                if !section.is_whole_file() {
                    head = head.with(
                        "Content-Range",
                        format!("bytes {}-{}/{}", section.begin, section.end - 1, fd.size),
                    );
                }
                if let Some(progress) = fd.partial_progress() {
                    head = head.with("X-Available-Ranges", progress.available().to_header_value());
                }
                if let (Some(tree), false) = (&fd.hash_tree, fd.is_partial()) {
                    head = head.with(
                        "X-Thex-URI",
                        format!("/uri-res/N2X?{};{}", fd.urn, tree.root32()),
                    );
                }
                if !alt_locs.is_empty() {
                    head = head.with("X-Alt", format_x_alt(alt_locs));
                }
            }
            UploadResponse::Queued {
                position,
                poll_min_secs,
                poll_max_secs,
                alt_locs,
            } => {
                head = head
                    .with(
                        "X-Queue",
                        format!(
                            "position={}, pollMin={}, pollMax={}",
                            position, poll_min_secs, poll_max_secs
                        ),
                    )
                    .with("Connection", "Keep-Alive");
                if !alt_locs.is_empty() {
                    head = head.with("X-Alt", format_x_alt(alt_locs));
                }
            }
            UploadResponse::LimitReached { retry_after_secs } => {
                head = head.with("Retry-After", retry_after_secs.to_string());
            }
            UploadResponse::UnavailableRange {
                available,
                retry_after_secs,
            } => {
                head = head.with("X-Available-Ranges", available.to_header_value());
                if let Some(secs) = retry_after_secs {
                    head = head.with("Retry-After", secs.to_string());
                }
            }
            UploadResponse::Thex { urn, .. } => {
                head = head
                    .with("Content-Type", "application/dime")
                    .with("X-Gnutella-Content-URN", urn.to_string());
            }
            UploadResponse::Freeloader => {
                head = head.with("Content-Type", "text/html");
            }
            UploadResponse::BrowseHost { .. } => {
                head = head.with("Content-Type", "text/plain");
            }
            UploadResponse::UpdateFile { .. } => {
                head = head.with("Content-Type", "text/xml");
            }
            UploadResponse::FileNotFound
            | UploadResponse::MalformedRequest
            | UploadResponse::Banned
            | UploadResponse::PushProxy { .. } => {}
        }

        if self.body_text().is_some() {
            head = head.with("Content-Type", "text/plain");
        }
        head = head.with("Content-Length", self.content_length().to_string());
        if self.should_close() {
            head = head.with("Connection", "close");
        }
        head
    }

    pub fn into_body(self) -> Body {
        if let Some(text) = self.body_text() {
            return Body::Bytes(text.as_bytes().to_vec());
        }
        match self {
            UploadResponse::File { section, .. } => Body::File(section),
            UploadResponse::Thex { tree, .. } => Body::Bytes(tree),
            UploadResponse::Freeloader => Body::Bytes(FREELOADER_PAGE.as_bytes().to_vec()),
            UploadResponse::BrowseHost { listing } => Body::Bytes(listing.into_bytes()),
            UploadResponse::UpdateFile { content } => Body::Bytes(content),
            _ => Body::Empty,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{Availability, PartialProgress};
    use std::path::PathBuf;

    fn file(size: u64, availability: Availability) -> Arc<FileDesc> {
        Arc::new(FileDesc {
            index: 0,
            name: "a b.bin".to_string(),
            path: PathBuf::from("/tmp/a b.bin"),
            size,
            urn: Sha1Urn::of_bytes(b"a b"),
            availability,
            hash_tree: None,
        })
    }

    #[test]
    fn test_whole_file_is_200_and_range_is_206() {
        let fd = file(1000, Availability::Complete);
        let whole = UploadResponse::File {
            section: FileSection {
                file: fd.clone(),
                begin: 0,
                end: 1000,
            },
            alt_locs: vec!["1.2.3.4:6346".parse().unwrap()],
        };
        let head = whole.head();
        assert_eq!(head.status, 200);
        assert_eq!(head.header("Content-Length"), Some("1000"));
        assert_eq!(
            head.header("Content-Disposition"),
            Some("attachment; filename=\"a%20b.bin\"")
        );
        assert_eq!(head.header("X-Alt"), Some("1.2.3.4"));
        assert!(head.header("Content-Range").is_none());
        assert!(!whole.should_close());

        let part = UploadResponse::File {
            section: FileSection {
                file: fd,
                begin: 100,
                end: 200,
            },
            alt_locs: Vec::new(),
        };
        let head = part.head();
        assert_eq!(head.status, 206);
        assert_eq!(head.header("Content-Range"), Some("bytes 100-199/1000"));
        assert_eq!(head.header("Content-Length"), Some("100"));
        assert!(matches!(part.into_body(), Body::File(s) if s.len() == 100));
    }

    #[test]
    fn test_queued_head_carries_position_and_poll_bounds() {
        let response = UploadResponse::Queued {
            position: 3,
            poll_min_secs: 45,
            poll_max_secs: 120,
            alt_locs: Vec::new(),
        };
        let head = response.head();
        assert_eq!(head.status, 503);
        assert_eq!(
            head.header("X-Queue"),
            Some("position=3, pollMin=45, pollMax=120")
        );
        assert_eq!(head.header("Content-Length"), Some("0"));
        assert!(!response.should_close());
        assert!(matches!(response.into_body(), Body::Empty));
    }

    #[test]
    fn test_unavailable_range_advertises_what_we_have() {
        let mut available = RangeSet::new();
        available.add(0, 500);
        let response = UploadResponse::UnavailableRange {
            available,
            retry_after_secs: Some(INACTIVE_RETRY_AFTER_SECS),
        };
        let head = response.head();
        assert_eq!(head.status, 416);
        assert_eq!(head.header("X-Available-Ranges"), Some("bytes 0-499"));
        assert_eq!(head.header("Retry-After"), Some("3600"));
    }

    #[test]
    fn test_partial_file_advertises_ranges_on_success() {
        let mut available = RangeSet::new();
        available.add(0, 400);
        let fd = file(
            1000,
            Availability::Partial(Arc::new(PartialProgress::new(available, true))),
        );
        let response = UploadResponse::File {
            section: FileSection {
                file: fd,
                begin: 0,
                end: 400,
            },
            alt_locs: Vec::new(),
        };
        assert_eq!(
            response.head().header("X-Available-Ranges"),
            Some("bytes 0-399")
        );
    }

    #[test]
    fn test_refusals_close_the_connection() {
        for response in [
            UploadResponse::MalformedRequest,
            UploadResponse::Banned,
            UploadResponse::Freeloader,
            UploadResponse::LimitReached {
                retry_after_secs: 900,
            },
        ] {
            let head = response.head();
            assert_eq!(head.header("Connection"), Some("close"));
            let expected = head.header("Content-Length").unwrap().parse::<usize>().unwrap();
            match response.into_body() {
                Body::Bytes(bytes) => assert_eq!(bytes.len(), expected),
                other => panic!("unexpected body {:?}", other),
            }
        }
        assert_eq!(UploadResponse::MalformedRequest.status(), 400);
        assert_eq!(UploadResponse::Banned.status(), 403);
        assert_eq!(UploadResponse::FileNotFound.status(), 404);
    }

    #[test]
    fn test_push_proxy_status() {
        assert_eq!(UploadResponse::PushProxy { forwarded: true }.status(), 202);
        assert_eq!(UploadResponse::PushProxy { forwarded: false }.status(), 410);
    }
}
