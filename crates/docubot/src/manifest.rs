// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Versioned file manifest.
//!
//! Every uploaded crawl document is named `crawl:<owner>:<iteration>:<index>.pdf`,
//! so the provider's file listing doubles as the manifest of which crawl
//! iterations exist. Index [`SENTINEL_INDEX`] is uploaded last; its presence
//! marks the iteration's upload set as complete.

use std::fmt;
use std::sync::{Arc, LazyLock};

use futures::future::try_join_all;
use regex::Regex;
use tracing::{debug, info, instrument};

use crate::provider::{AssistantProvider, ProviderError};

/// File index of the sentinel document.
pub const SENTINEL_INDEX: u64 = 0;

static FILE_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^crawl:([^:]+):(\d+):(\d+)\.pdf$").expect("valid regex"));

/// Identity of one crawl document.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileKey {
    /// Owning knowledge base; never contains `:`.
    pub owner_id: String,
    /// Crawl iteration that produced the file.
    pub iteration: u64,
    /// Position in the crawl output; 0 is the sentinel.
    pub file_index: u64,
}

impl FileKey {
    pub fn new(owner_id: impl Into<String>, iteration: u64, file_index: u64) -> Self {
        Self {
            owner_id: owner_id.into(),
            iteration,
            file_index,
        }
    }

    /// External file name.
    pub fn encode(&self) -> String {
        format!(
            "crawl:{}:{}:{}.pdf",
            self.owner_id, self.iteration, self.file_index
        )
    }

    /// Parse an external file name; anything else yields `None`.
    pub fn decode(name: &str) -> Option<Self> {
        let caps = FILE_NAME.captures(name)?;
        Some(Self {
            owner_id: caps[1].to_string(),
            iteration: caps[2].parse().ok()?,
            file_index: caps[3].parse().ok()?,
        })
    }

    pub fn is_sentinel(&self) -> bool {
        self.file_index == SENTINEL_INDEX
    }
}

impl fmt::Display for FileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

/// A provider file that belongs to the manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub file_id: String,
    pub key: FileKey,
}

/// Manifest queries and bulk deletion over the provider's file listing.
///
/// The owner ID is also the vector store the files are attached to.
#[derive(Clone)]
pub struct FileManifest {
    provider: Arc<dyn AssistantProvider>,
}

impl FileManifest {
    pub fn new(provider: Arc<dyn AssistantProvider>) -> Self {
        Self { provider }
    }

    /// Every manifest file of `owner_id`. Foreign names are skipped.
    pub async fn list_for_owner(&self, owner_id: &str) -> Result<Vec<ManifestEntry>, ProviderError> {
        let files = self.provider.list_files().await?;
        let mut entries = Vec::new();

        for file in files {
            match FileKey::decode(&file.filename) {
                Some(key) if key.owner_id == owner_id => entries.push(ManifestEntry {
                    file_id: file.id,
                    key,
                }),
                Some(_) => {}
                None => debug!(filename = %file.filename, "Ignoring file outside the manifest"),
            }
        }

        Ok(entries)
    }

    /// Manifest files of one iteration, ordered by file index.
    pub async fn list_for_iteration(
        &self,
        owner_id: &str,
        iteration: u64,
    ) -> Result<Vec<ManifestEntry>, ProviderError> {
        let mut entries: Vec<_> = self
            .list_for_owner(owner_id)
            .await?
            .into_iter()
            .filter(|e| e.key.iteration == iteration)
            .collect();
        entries.sort_by_key(|e| e.key.file_index);
        Ok(entries)
    }

    pub async fn sentinel_present(&self, owner_id: &str, iteration: u64) -> Result<bool, ProviderError> {
        Ok(self
            .list_for_iteration(owner_id, iteration)
            .await?
            .iter()
            .any(|e| e.key.is_sentinel()))
    }

    /// Delete every manifest file of `owner_id`. Returns the number deleted.
    #[instrument(skip(self))]
    pub async fn delete_all(&self, owner_id: &str) -> Result<usize, ProviderError> {
        let entries = self.list_for_owner(owner_id).await?;
        self.delete_entries(owner_id, entries).await
    }

    /// Delete the files of every iteration before `iteration`.
    #[instrument(skip(self))]
    pub async fn delete_older_than(&self, owner_id: &str, iteration: u64) -> Result<usize, ProviderError> {
        let stale: Vec<_> = self
            .list_for_owner(owner_id)
            .await?
            .into_iter()
            .filter(|e| e.key.iteration < iteration)
            .collect();
        self.delete_entries(owner_id, stale).await
    }

    async fn delete_entries(
        &self,
        owner_id: &str,
        entries: Vec<ManifestEntry>,
    ) -> Result<usize, ProviderError> {
        let count = entries.len();
        try_join_all(entries.iter().map(|entry| self.delete_entry(owner_id, entry))).await?;
        if count > 0 {
            info!(owner_id, count, "Deleted manifest files");
        }
        Ok(count)
    }

    /// Delete the file object and its vector store attachment independently.
    async fn delete_entry(&self, owner_id: &str, entry: &ManifestEntry) -> Result<(), ProviderError> {
        let (deleted, detached) = tokio::join!(
            self.provider.delete_file(&entry.file_id),
            self.provider.detach_file(owner_id, &entry.file_id),
        );
        ignore_not_found(deleted)?;
        ignore_not_found(detached)?;
        debug!(file = %entry.key, "Deleted file");
        Ok(())
    }
}

fn ignore_not_found(result: Result<(), ProviderError>) -> Result<(), ProviderError> {
    match result {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode() {
        let key = FileKey::new("vs_abc", 12, 3);
        assert_eq!(key.encode(), "crawl:vs_abc:12:3.pdf");
        assert_eq!(FileKey::decode("crawl:vs_abc:12:3.pdf"), Some(key));

        let sentinel = FileKey::decode("crawl:vs_abc:0:0.pdf").unwrap();
        assert!(sentinel.is_sentinel());
    }

    #[test]
    fn test_names_identify_owner_iteration_and_index() {
        let keys = [
            FileKey::new("vs_a", 0, 1),
            FileKey::new("vs_a", 1, 0),
            FileKey::new("vs_abc123", 987_654_321, 42),
            FileKey::new("file-store_2", 7, 0),
            FileKey::new("x", u64::MAX, u64::MAX),
        ];
        for key in &keys {
            let decoded = FileKey::decode(&key.encode()).unwrap();
            assert_eq!(&decoded, key);
            assert_eq!(decoded.is_sentinel(), key.file_index == SENTINEL_INDEX);
        }

        // Distinct keys never share a name.
        let names: std::collections::HashSet<_> = keys.iter().map(FileKey::encode).collect();
        assert_eq!(names.len(), keys.len());
        assert_eq!(keys[4].to_string(), format!("crawl:x:{0}:{0}.pdf", u64::MAX));
    }

    #[test]
    fn test_decode_rejects_foreign_names() {
        for name in [
            "",
            "notes.pdf",
            "crawl:vs:1:2.txt",
            "crawl:vs:1.pdf",
            "crawl::1:2.pdf",
            "crawl:a:b:1:2.pdf",
            "crawl:vs:-1:2.pdf",
            "crawl:vs:1:2.pdf.bak",
            "crawl:vs:99999999999999999999999:0.pdf",
        ] {
            assert_eq!(FileKey::decode(name), None, "{name}");
        }
    }
}
