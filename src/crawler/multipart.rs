//! Multipart downloads
//!
//! A large non-page resource on a server that honours byte ranges is fetched as
//! several `Range` requests running on different pool workers. The tracker collects
//! the parts, reschedules any part that came back short and joins them in offset
//! order once all have arrived.

use crate::crawler::fetcher::FetchError;
use crate::crawler::pool::Reply;
use crate::storage::CacheRecord;
use crate::url::{UrlId, UrlRef};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// One byte range of a multipart download
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PartSpec {
    /// Id of the URL the part belongs to
    pub mirror_index: UrlId,
    pub part_index: usize,
    pub start: u64,
    /// Inclusive
    pub end: u64,
}

impl PartSpec {
    pub fn expected_len(&self) -> u64 {
        self.end - self.start + 1
    }
}

/// Splits `total` bytes into `parts` ranges; the last range takes the remainder
pub fn split_ranges(mirror_index: UrlId, total: u64, parts: usize) -> Vec<PartSpec> {
    let parts = parts.max(1) as u64;
    if total < parts {
        return vec![PartSpec {
            mirror_index,
            part_index: 0,
            start: 0,
            end: total.saturating_sub(1),
        }];
    }

    let piece = total / parts;
    (0..parts)
        .map(|i| {
            let start = i * piece;
            let size = if i == parts - 1 { total - start } else { piece };
            PartSpec {
                mirror_index,
                part_index: i as usize,
                start,
                end: start + size - 1,
            }
        })
        .collect()
}

/// What happened after a part reported in
#[derive(Debug)]
pub enum PartProgress {
    /// Other parts are still outstanding
    Waiting,
    /// The part must be fetched again
    Retry(PartSpec),
    /// Every part arrived; `body` is the joined resource
    Assembled {
        url: UrlRef,
        body: Vec<u8>,
        /// ETag and Last-Modified seen when the download was split
        validators: CacheRecord,
        reply: Option<Reply>,
    },
    /// A part ran out of retries
    Failed {
        url: UrlRef,
        error: FetchError,
        reply: Option<Reply>,
    },
    /// The download was already finished or abandoned
    Unknown,
}

#[derive(Debug)]
struct Assembly {
    url: UrlRef,
    total: u64,
    parts: usize,
    received: BTreeMap<u64, Vec<u8>>,
    retries: HashMap<usize, u32>,
    validators: CacheRecord,
    reply: Option<Reply>,
}

#[derive(Debug)]
pub struct MultipartTracker {
    assemblies: Mutex<HashMap<UrlId, Assembly>>,
    part_retries: u32,
}

impl MultipartTracker {
    pub fn new(part_retries: u32) -> Self {
        Self {
            assemblies: Mutex::new(HashMap::new()),
            part_retries,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<UrlId, Assembly>> {
        self.assemblies.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts tracking a download and returns the parts to schedule
    pub fn register(
        &self,
        url: UrlRef,
        total: u64,
        parts: usize,
        validators: CacheRecord,
        reply: Option<Reply>,
    ) -> Vec<PartSpec> {
        let specs = split_ranges(url.id(), total, parts);
        self.lock().insert(
            url.id(),
            Assembly {
                url,
                total,
                parts: specs.len(),
                received: BTreeMap::new(),
                retries: HashMap::new(),
                validators,
                reply,
            },
        );
        specs
    }

    /// Records the result of one part
    pub fn record(&self, part: PartSpec, result: Result<Vec<u8>, FetchError>) -> PartProgress {
        let mut assemblies = self.lock();
        let Some(assembly) = assemblies.get_mut(&part.mirror_index) else {
            return PartProgress::Unknown;
        };

        let error = match result {
            Ok(body) if body.len() as u64 == part.expected_len() => {
                assembly.received.insert(part.start, body);
                None
            }
            Ok(body) => Some(FetchError::ShortTransfer {
                expected: part.expected_len(),
                actual: body.len() as u64,
            }),
            Err(e) => Some(e),
        };

        if let Some(error) = error {
            let tries = assembly.retries.entry(part.part_index).or_insert(0);
            if *tries < self.part_retries {
                *tries += 1;
                tracing::debug!(
                    "Rescheduling part {} of {} ({})",
                    part.part_index,
                    assembly.url,
                    error
                );
                return PartProgress::Retry(part);
            }
            return match assemblies.remove(&part.mirror_index) {
                Some(assembly) => PartProgress::Failed {
                    url: assembly.url,
                    error,
                    reply: assembly.reply,
                },
                None => PartProgress::Unknown,
            };
        }

        if assembly.received.len() < assembly.parts {
            return PartProgress::Waiting;
        }

        let Some(assembly) = assemblies.remove(&part.mirror_index) else {
            return PartProgress::Unknown;
        };
        let body: Vec<u8> = assembly.received.into_values().flatten().collect();
        if body.len() as u64 != assembly.total {
            return PartProgress::Failed {
                url: assembly.url,
                error: FetchError::ShortTransfer {
                    expected: assembly.total,
                    actual: body.len() as u64,
                },
                reply: assembly.reply,
            };
        }
        PartProgress::Assembled {
            url: assembly.url,
            body,
            validators: assembly.validators,
            reply: assembly.reply,
        }
    }

    /// Drops every unfinished download, returning who was waiting for each
    pub fn abandon_all(&self) -> Vec<(UrlRef, Option<Reply>)> {
        self.lock()
            .drain()
            .map(|(_, assembly)| (assembly.url, assembly.reply))
            .collect()
    }

    /// Number of downloads still being assembled
    pub fn pending(&self) -> usize {
        self.lock().len()
    }
}
