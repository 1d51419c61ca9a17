//! Resource URIs: `<scheme>://<authority>/<fingerprint>[?<range>]`.

use std::fmt;
use std::str::FromStr;

use veld_core::Fingerprint;

use crate::range::Range;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Mhash,
    File,
    Http,
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Scheme::Mhash => "mhash",
            Scheme::File => "file",
            Scheme::Http => "http",
        })
    }
}

impl FromStr for Scheme {
    type Err = UriError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mhash" => Ok(Scheme::Mhash),
            "file" => Ok(Scheme::File),
            "http" => Ok(Scheme::Http),
            other => Err(UriError::UnknownScheme(other.to_string())),
        }
    }
}

/// A content-addressed resource locator. The fingerprint is the cache
/// key; scheme and authority say where the bytes can be fetched from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceUri {
    pub scheme: Scheme,
    pub authority: String,
    pub fingerprint: Fingerprint,
    pub range: Option<Range>,
}

impl ResourceUri {
    pub fn new(scheme: Scheme, authority: impl Into<String>, fingerprint: Fingerprint) -> Self {
        ResourceUri {
            scheme,
            authority: authority.into(),
            fingerprint,
            range: None,
        }
    }

    /// A bare `mhash://` URI for a fingerprint with no preferred origin.
    pub fn mhash(fingerprint: Fingerprint) -> Self {
        ResourceUri::new(Scheme::Mhash, "", fingerprint)
    }

    pub fn with_range(mut self, range: Range) -> Self {
        self.range = Some(range);
        self
    }
}

impl fmt::Display for ResourceUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}/{}", self.scheme, self.authority, self.fingerprint)?;
        if let Some(range) = &self.range {
            write!(f, "?{range}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UriError {
    #[error("missing '://' separator")]
    MissingSeparator,
    #[error("unknown scheme: {0}")]
    UnknownScheme(String),
    #[error("missing fingerprint path segment")]
    MissingFingerprint,
    #[error("invalid fingerprint")]
    InvalidFingerprint,
    #[error("invalid range query")]
    InvalidRange,
}

impl FromStr for ResourceUri {
    type Err = UriError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, rest) = s.split_once("://").ok_or(UriError::MissingSeparator)?;
        let scheme: Scheme = scheme.parse()?;
        let (authority, path) = rest.split_once('/').ok_or(UriError::MissingFingerprint)?;
        let (fingerprint, range) = match path.split_once('?') {
            Some((fp, query)) => {
                let range = query.parse().map_err(|_| UriError::InvalidRange)?;
                (fp, Some(range))
            }
            None => (path, None),
        };
        if fingerprint.is_empty() {
            return Err(UriError::MissingFingerprint);
        }
        let fingerprint = fingerprint
            .parse()
            .map_err(|_| UriError::InvalidFingerprint)?;
        Ok(ResourceUri {
            scheme,
            authority: authority.to_string(),
            fingerprint,
            range,
        })
    }
}
