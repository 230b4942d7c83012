//! OCI / Docker registry integration
//!
//! Credential resolution, protocol client, and wire types.

pub mod auth;
pub mod client;
pub mod types;

pub use auth::{CredentialStore, Credentials, TOKEN_USERNAME};
pub use client::{sha256_digest, HttpClient, MockHttpClient, RegistryClient, ReqwestHttpClient};
pub use types::{
    is_index_media_type, is_manifest_media_type, Descriptor, HttpResponse, ImageConfigBlob,
    ImageIndex, ImageManifest, TagList, MEDIA_TYPE_DOCKER_MANIFEST,
    MEDIA_TYPE_DOCKER_MANIFEST_LIST, MEDIA_TYPE_OCI_INDEX, MEDIA_TYPE_OCI_MANIFEST,
};
