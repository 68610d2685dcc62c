//! Copy endpoint syntax.
//!
//! An endpoint is either a host path or `CONTAINER:PATH`. Only the first
//! colon separates the two, so `ctr:/te:s:t` names the file `/te:s:t` in
//! container `ctr`. A host path cannot contain a colon; write it through a
//! directory without one, e.g. via a symlink.

use std::fmt;
use std::str::FromStr;

use crate::error::{CopyError, Result};

/// The host path meaning "standard input/output" instead of a file.
pub const STREAM_PATH: &str = "-";

/// One side of a copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Container reference, if the path is inside a container.
    pub container: Option<String>,
    /// The path, verbatim.
    pub path: String,
}

impl Endpoint {
    /// Parse `CONTAINER:PATH` or a plain host path.
    pub fn parse(raw: &str) -> Result<Self> {
        let endpoint = match raw.split_once(':') {
            Some((container, path)) => {
                if container.is_empty() {
                    return Err(CopyError::InvalidPath(format!(
                        "empty container reference in {:?}",
                        raw
                    )));
                }
                Endpoint {
                    container: Some(container.to_string()),
                    path: path.to_string(),
                }
            }
            None => Endpoint {
                container: None,
                path: raw.to_string(),
            },
        };
        if endpoint.path.is_empty() {
            return Err(CopyError::InvalidPath(format!("empty path in {:?}", raw)));
        }
        Ok(endpoint)
    }

    /// Whether this endpoint is inside a container.
    pub fn is_container(&self) -> bool {
        self.container.is_some()
    }

    /// Whether this is the `-` stream endpoint.
    pub fn is_stream(&self) -> bool {
        self.container.is_none() && self.path == STREAM_PATH
    }
}

impl FromStr for Endpoint {
    type Err = CopyError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.container {
            Some(container) => write!(f, "{}:{}", container, self.path),
            None => f.write_str(&self.path),
        }
    }
}

/// Which way data flows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Direction {
    /// Copy out of a container.
    ContainerToHost,
    /// Copy into a container.
    HostToContainer,
}

impl Direction {
    /// Decide the direction of a copy from `source` to `destination`.
    ///
    /// Exactly one side must name a container.
    pub fn of(source: &Endpoint, destination: &Endpoint) -> Result<Self> {
        match (source.is_container(), destination.is_container()) {
            (true, false) => Ok(Direction::ContainerToHost),
            (false, true) => Ok(Direction::HostToContainer),
            (true, true) => Err(CopyError::AmbiguousEndpoint(format!(
                "both {} and {} name a container; copying between containers is not supported",
                source, destination
            ))),
            (false, false) => Err(CopyError::AmbiguousEndpoint(format!(
                "neither {} nor {} names a container",
                source, destination
            ))),
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Direction::ContainerToHost => "container-to-host",
            Direction::HostToContainer => "host-to-container",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_container_endpoint() {
        let ep = Endpoint::parse("web:/etc/hosts").unwrap();
        assert_eq!(ep.container.as_deref(), Some("web"));
        assert_eq!(ep.path, "/etc/hosts");
        assert_eq!(ep.to_string(), "web:/etc/hosts");
    }

    #[test]
    fn test_only_first_colon_splits() {
        let ep: Endpoint = "0123abcd:/te:s:t".parse().unwrap();
        assert_eq!(ep.container.as_deref(), Some("0123abcd"));
        assert_eq!(ep.path, "/te:s:t");
    }

    #[test]
    fn test_host_endpoints() {
        let ep = Endpoint::parse("./local/dir").unwrap();
        assert!(!ep.is_container());
        assert!(!ep.is_stream());
        assert!(Endpoint::parse("-").unwrap().is_stream());
        // `-` inside a container is an ordinary file name.
        assert!(!Endpoint::parse("ctr:-").unwrap().is_stream());
    }

    #[test]
    fn test_empty_parts_rejected() {
        assert!(matches!(Endpoint::parse(":/x"), Err(CopyError::InvalidPath(_))));
        assert!(matches!(Endpoint::parse("ctr:"), Err(CopyError::InvalidPath(_))));
        assert!(matches!(Endpoint::parse(""), Err(CopyError::InvalidPath(_))));
    }

    #[test]
    fn test_direction() {
        let ctr = Endpoint::parse("ctr:/x").unwrap();
        let host = Endpoint::parse("/tmp").unwrap();
        assert_eq!(Direction::of(&ctr, &host).unwrap(), Direction::ContainerToHost);
        assert_eq!(Direction::of(&host, &ctr).unwrap(), Direction::HostToContainer);
        assert!(matches!(
            Direction::of(&ctr, &ctr),
            Err(CopyError::AmbiguousEndpoint(_))
        ));
        assert!(matches!(
            Direction::of(&host, &host),
            Err(CopyError::AmbiguousEndpoint(_))
        ));
    }
}
