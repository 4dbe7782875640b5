use serde::Deserialize;

use crate::digest::Digest;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FsLayer {
    blob_sum: Digest,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ManifestV1 {
    fs_layers: Vec<FsLayer>,
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct Platform {
    pub architecture: String,
    pub os: String,
    #[serde(default)]
    pub variant: Option<String>,
}

impl Platform {
    pub fn to_string_pair(&self) -> String {
        match &self.variant {
            Some(variant) => format!("{}/{}/{}", self.os, self.architecture, variant),
            None => format!("{}/{}", self.os, self.architecture),
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub digest: Digest,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub platform: Option<Platform>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "mediaType")]
#[serde(rename_all = "camelCase")]
enum TaggedManifest {
    #[serde(rename = "application/vnd.docker.distribution.manifest.v2+json")]
    DockerImage {
        config: Descriptor,
        layers: Vec<Descriptor>,
    },
    #[serde(rename = "application/vnd.docker.distribution.manifest.list.v2+json")]
    DockerList { manifests: Vec<Descriptor> },
    #[serde(rename = "application/vnd.oci.image.manifest.v1+json")]
    OciImage {
        config: Descriptor,
        layers: Vec<Descriptor>,
    },
    #[serde(rename = "application/vnd.oci.image.index.v1+json")]
    OciIndex { manifests: Vec<Descriptor> },
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum AnyManifest {
    Tagged(TaggedManifest),
    Legacy(ManifestV1),
}

/// The parts of a parsed manifest the artifact store cares about: which
/// blobs it pins, which child manifests an index references, and the
/// descriptor facts for the artifact row itself.
#[derive(Debug)]
pub struct ParsedManifest {
    pub media_type: String,
    pub size: u64,
    pub config: Option<Descriptor>,
    pub layers: Vec<Descriptor>,
    pub references: Vec<Descriptor>,
}

impl ParsedManifest {
    /// Every blob this manifest requires to exist before it is accepted.
    pub fn blobs(&self) -> impl Iterator<Item = &Descriptor> {
        self.config.iter().chain(self.layers.iter())
    }

    pub fn is_index(&self) -> bool {
        !self.references.is_empty() || self.media_type.contains("list") || self.media_type.contains("index")
    }
}

pub fn parse_manifest(input: &[u8]) -> Result<ParsedManifest, serde_json::Error> {
    let manifest: AnyManifest = serde_json::from_slice(input)?;
    let size = input.len() as u64;

    Ok(match manifest {
        AnyManifest::Tagged(TaggedManifest::DockerImage { config, layers }) => ParsedManifest {
            media_type: "application/vnd.docker.distribution.manifest.v2+json".into(),
            size,
            config: Some(config),
            layers,
            references: vec![],
        },
        AnyManifest::Tagged(TaggedManifest::OciImage { config, layers }) => ParsedManifest {
            media_type: "application/vnd.oci.image.manifest.v1+json".into(),
            size,
            config: Some(config),
            layers,
            references: vec![],
        },
        AnyManifest::Tagged(TaggedManifest::DockerList { manifests }) => ParsedManifest {
            media_type: "application/vnd.docker.distribution.manifest.list.v2+json".into(),
            size,
            config: None,
            layers: vec![],
            references: manifests,
        },
        AnyManifest::Tagged(TaggedManifest::OciIndex { manifests }) => ParsedManifest {
            media_type: "application/vnd.oci.image.index.v1+json".into(),
            size,
            config: None,
            layers: vec![],
            references: manifests,
        },
        AnyManifest::Legacy(manifest) => ParsedManifest {
            media_type: "application/vnd.docker.distribution.manifest.v1+json".into(),
            size,
            config: None,
            layers: manifest
                .fs_layers
                .into_iter()
                .map(|f| Descriptor {
                    media_type: "application/vnd.docker.image.rootfs.diff.tar.gzip".into(),
                    digest: f.blob_sum,
                    size: None,
                    platform: None,
                })
                .collect(),
            references: vec![],
        },
    })
}
