// SPDX-FileCopyrightText: 2025 The seedgate Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use crate::errors::RequestError;
use crate::storage::Sha1Urn;

/// What a request line asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestTarget {
    /// `/get/<index>/<name>`
    Traditional { index: u32, name: String },
    /// `/uri-res/N2R?urn:sha1:...`
    Urn(Sha1Urn),
    /// `/uri-res/N2X?urn:sha1:...`, the hash tree of a file.
    Thex(Sha1Urn),
    /// `/`, a listing of everything shared.
    BrowseHost,
    /// `/gnutella/push-proxy?ServerID=...`
    PushProxy { server_id: String },
    /// `/update.xml`
    UpdateFile,
}

impl RequestTarget {
    pub fn parse(target: &str) -> Result<Self, RequestError> {
        let bad = || RequestError::Target(target.to_string());

        if target == "/" {
            return Ok(RequestTarget::BrowseHost);
        }
        if target.eq_ignore_ascii_case("/update.xml") {
            return Ok(RequestTarget::UpdateFile);
        }

        if let Some(rest) = target.strip_prefix("/get/") {
            let (index, name) = rest.split_once('/').ok_or_else(bad)?;
            let index = index.parse().map_err(|_| bad())?;
            let name = urlencoding::decode(name).map_err(|_| bad())?;
            if name.is_empty() {
                return Err(bad());
            }
            return Ok(RequestTarget::Traditional {
                index,
                name: name.into_owned(),
            });
        }

        if let Some(rest) = target.strip_prefix("/uri-res/") {
            let (service, urn) = rest.split_once('?').ok_or_else(bad)?;
            let urn: Sha1Urn = urn.parse().map_err(|_| bad())?;
            return match service.to_ascii_uppercase().as_str() {
                "N2R" => Ok(RequestTarget::Urn(urn)),
                "N2X" => Ok(RequestTarget::Thex(urn)),
                _ => Err(bad()),
            };
        }

        if let Some(query) = target.strip_prefix("/gnutella/push-proxy?") {
            let server_id = query
                .split('&')
                .filter_map(|pair| pair.split_once('='))
                .find(|(key, _)| key.eq_ignore_ascii_case("ServerID"))
                .map(|(_, value)| value)
                .filter(|value| !value.is_empty())
                .ok_or_else(bad)?;
            return Ok(RequestTarget::PushProxy {
                server_id: server_id.to_string(),
            });
        }

        Err(bad())
    }
}

/// Plain web browsers identify as Mozilla-compatible; Gnutella servents
/// never do.
pub fn is_browser(user_agent: Option<&str>) -> bool {
    user_agent.is_some_and(|ua| ua.starts_with("Mozilla") || ua.starts_with("Opera"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_traditional_get_decodes_name() {
        assert_eq!(
            RequestTarget::parse("/get/12/my%20song.mp3").unwrap(),
            RequestTarget::Traditional {
                index: 12,
                name: "my song.mp3".to_string()
            }
        );
        assert!(RequestTarget::parse("/get/x/name").is_err());
        assert!(RequestTarget::parse("/get/1/").is_err());
    }

    #[test]
    fn test_uri_res_services() {
        let urn = "urn:sha1:3I42H3S6NNFQ2MSVX7XZKYAYSCX5QBYJ";
        let parsed: Sha1Urn = urn.parse().unwrap();
        assert_eq!(
            RequestTarget::parse(&format!("/uri-res/N2R?{}", urn)).unwrap(),
            RequestTarget::Urn(parsed)
        );
        assert_eq!(
            RequestTarget::parse(&format!("/uri-res/n2x?{}", urn)).unwrap(),
            RequestTarget::Thex(parsed)
        );
        assert!(RequestTarget::parse(&format!("/uri-res/N2Q?{}", urn)).is_err());
        assert!(RequestTarget::parse("/uri-res/N2R?urn:sha1:short").is_err());
    }

    #[test]
    fn test_auxiliary_targets() {
        assert_eq!(RequestTarget::parse("/").unwrap(), RequestTarget::BrowseHost);
        assert_eq!(
            RequestTarget::parse("/update.xml").unwrap(),
            RequestTarget::UpdateFile
        );
        assert_eq!(
            RequestTarget::parse("/gnutella/push-proxy?ServerID=ABCDEF&file=1").unwrap(),
            RequestTarget::PushProxy {
                server_id: "ABCDEF".to_string()
            }
        );
        assert!(RequestTarget::parse("/gnutella/push-proxy?file=1").is_err());
        assert!(matches!(
            RequestTarget::parse("/favicon.ico"),
            Err(RequestError::Target(_))
        ));
    }

    #[test]
    fn test_browser_detection() {
        assert!(is_browser(Some("Mozilla/5.0 (X11; Linux x86_64)")));
        assert!(!is_browser(Some("LimeWire/4.18")));
        assert!(!is_browser(None));
    }
}
