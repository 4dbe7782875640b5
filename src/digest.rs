use std::convert::TryFrom;
use std::fmt;
use std::str::FromStr;

use data_encoding::HEXLOWER;
use ring::digest;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Hash, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(try_from = "String", into = "String")]
pub struct Digest {
    pub algo: String,
    pub hash: String,
}

impl Digest {
    pub fn from_sha256(digest: &digest::Digest) -> Digest {
        Digest {
            algo: "sha256".to_string(),
            hash: HEXLOWER.encode(digest.as_ref()),
        }
    }

    pub fn of_bytes(bytes: &[u8]) -> Digest {
        Digest::from_sha256(&digest::digest(&digest::SHA256, bytes))
    }

    /// Object store key for a committed blob. The two level fan-out bounds
    /// directory size on filesystem backends.
    pub fn blob_path(&self) -> String {
        format!(
            "blobs/{}/{}/{}/{}",
            self.algo,
            &self.hash[0..2],
            &self.hash[2..4],
            &self.hash[4..]
        )
    }
}

impl FromStr for Digest {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Digest::try_from(s.to_string())
    }
}

// We implement this so that serde can parse a Digest from a straight string
impl TryFrom<String> for Digest {
    type Error = &'static str;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let Some((algo, hash)) = value.split_once(':') else {
            return Err("Digest must be of the form algorithm:hex");
        };

        if algo != "sha256" {
            return Err("Unsupported digest algorithm");
        }

        if hash.len() < 4 || !hash.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err("Digest hash is not hex");
        }

        Ok(Digest {
            algo: algo.to_string(),
            hash: hash.to_string(),
        })
    }
}

impl From<Digest> for String {
    fn from(digest: Digest) -> Self {
        digest.to_string()
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algo, self.hash)
    }
}

/// Incremental sha256 used when streaming bodies through the upload path.
pub struct Hasher {
    inner: digest::Context,
}

impl Hasher {
    pub fn new() -> Self {
        Self {
            inner: digest::Context::new(&digest::SHA256),
        }
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.inner.update(bytes);
    }

    pub fn finish(self) -> Digest {
        Digest::from_sha256(&self.inner.finish())
    }
}

impl Default for Hasher {
    fn default() -> Self {
        Self::new()
    }
}
