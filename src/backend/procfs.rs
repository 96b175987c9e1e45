//! Entity backend over the local process table.
//!
//! Every numeric directory under the proc root is an entity. The detail
//! snapshot comes from `<pid>/stat`, the resource snapshot from `<pid>/statm`.
//! A process that exits between listing and fetching surfaces as
//! `RemoteCallError::NotFound`, which the fan-out collector records per entity.

use std::{
    io,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::{debug, trace};

use crate::core::{error::RemoteCallError, traits::RemoteEntityClient, types::EntityHandle};

/// Page size assumed when `self/auxv` under the proc root is unreadable.
const FALLBACK_PAGE_SIZE: u64 = 4096;

/// Auxiliary vector key carrying the system page size.
const AT_PAGESZ: usize = 6;

/// State and identity of one process, parsed from `/proc/<pid>/stat`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessDetail {
    pub pid: u32,
    /// Executable name as reported by the kernel (at most 15 characters).
    pub command: String,
    pub state: String,
    pub parent_pid: u32,
    pub threads: u64,
    /// User plus system time, in clock ticks.
    pub cpu_ticks: u64,
}

/// Memory footprint of one process, parsed from `/proc/<pid>/statm`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessMetrics {
    pub virtual_bytes: u64,
    pub resident_bytes: u64,
    pub shared_bytes: u64,
}

impl ProcessMetrics {
    pub fn resident_mib(&self) -> f64 {
        self.resident_bytes as f64 / 1024.0 / 1024.0
    }
}

/// `RemoteEntityClient` over a procfs mount.
///
/// `statm` reports pages; the page size is read once from the auxiliary
/// vector of the reading process (`<root>/self/auxv`), since it differs
/// between kernels (4K on x86_64, often 16K or 64K on aarch64 and ppc64).
#[derive(Debug, Clone)]
pub struct ProcfsClient {
    root: PathBuf,
    page_size: OnceCell<u64>,
}

impl ProcfsClient {
    pub fn new() -> Self {
        Self::with_root("/proc")
    }

    /// Uses an alternative proc root, e.g. a host mount inside a container.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            page_size: OnceCell::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Bytes per page, from `AT_PAGESZ`, cached after the first lookup.
    pub async fn page_size(&self) -> u64 {
        *self
            .page_size
            .get_or_init(|| async {
                let path = self.root.join("self").join("auxv");
                let page_size = tokio::fs::read(&path)
                    .await
                    .ok()
                    .and_then(|auxv| parse_auxv_page_size(&auxv));
                match page_size {
                    Some(size) => {
                        debug!("Page size from {}: {} bytes", path.display(), size);
                        size
                    }
                    None => {
                        debug!(
                            "No page size in {}, assuming {} bytes",
                            path.display(),
                            FALLBACK_PAGE_SIZE
                        );
                        FALLBACK_PAGE_SIZE
                    }
                }
            })
            .await
    }

    async fn read(&self, handle: &EntityHandle, file: &str) -> Result<(String, String), RemoteCallError> {
        let path = self.root.join(handle.as_str()).join(file);
        let location = path.display().to_string();
        trace!("Reading {}", location);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok((content, location)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                Err(RemoteCallError::NotFound(handle.to_string()))
            }
            Err(err) => Err(RemoteCallError::Transient(format!(
                "failed to read {}: {}",
                location, err
            ))),
        }
    }
}

impl Default for ProcfsClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl RemoteEntityClient for ProcfsClient {
    type Detail = ProcessDetail;
    type Metrics = ProcessMetrics;

    async fn list_entities(&self) -> Result<Vec<EntityHandle>, RemoteCallError> {
        let mut dir = tokio::fs::read_dir(&self.root).await.map_err(|err| {
            RemoteCallError::Connectivity(format!(
                "cannot open proc root {}: {}",
                self.root.display(),
                err
            ))
        })?;

        let mut handles = Vec::new();
        loop {
            let entry = dir.next_entry().await.map_err(|err| {
                RemoteCallError::Connectivity(format!(
                    "cannot list proc root {}: {}",
                    self.root.display(),
                    err
                ))
            })?;
            let Some(entry) = entry else { break };
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.is_empty() && name.bytes().all(|b| b.is_ascii_digit()) {
                handles.push(EntityHandle::new(name));
            }
        }
        Ok(handles)
    }

    async fn fetch_detail(&self, handle: &EntityHandle) -> Result<ProcessDetail, RemoteCallError> {
        let (content, location) = self.read(handle, "stat").await?;
        parse_stat(&content).map_err(|reason| RemoteCallError::Malformed { location, reason })
    }

    async fn fetch_metrics(&self, handle: &EntityHandle) -> Result<ProcessMetrics, RemoteCallError> {
        let (content, location) = self.read(handle, "statm").await?;
        let page_size = self.page_size().await;
        parse_statm(&content, page_size)
            .map_err(|reason| RemoteCallError::Malformed { location, reason })
    }
}

/// Maps the single-letter kernel state to a readable label.
fn state_label(code: &str) -> &'static str {
    match code {
        "R" => "running",
        "S" => "sleeping",
        "D" => "disk-sleep",
        "Z" => "zombie",
        "T" => "stopped",
        "t" => "tracing-stop",
        "X" | "x" => "dead",
        "I" => "idle",
        "K" => "wakekill",
        "W" => "paging",
        "P" => "parked",
        _ => "unknown",
    }
}

/// Parses `/proc/<pid>/stat`.
///
/// The command name is wrapped in parentheses and may itself contain spaces
/// or parentheses, so fields are located relative to the last `)`.
pub(crate) fn parse_stat(content: &str) -> Result<ProcessDetail, String> {
    let open = content.find('(').ok_or("missing '(' before command name")?;
    let close = content.rfind(')').ok_or("missing ')' after command name")?;
    if close < open {
        return Err("unbalanced command name".to_string());
    }

    let pid = content[..open]
        .trim()
        .parse::<u32>()
        .map_err(|e| format!("invalid pid: {}", e))?;
    let command = content[open + 1..close].to_string();
    let fields: Vec<&str> = content[close + 1..].split_whitespace().collect();

    // Offsets relative to the field following the command name (field 3).
    let field = |index: usize, name: &str| -> Result<u64, String> {
        fields
            .get(index)
            .ok_or_else(|| format!("missing {}", name))?
            .parse::<u64>()
            .map_err(|e| format!("invalid {}: {}", name, e))
    };

    let state = fields.first().ok_or("missing state")?;
    let parent_pid = u32::try_from(field(1, "ppid")?).map_err(|e| format!("invalid ppid: {}", e))?;
    let utime = field(11, "utime")?;
    let stime = field(12, "stime")?;
    let threads = field(17, "num_threads")?;

    Ok(ProcessDetail {
        pid,
        command,
        state: state_label(state).to_string(),
        parent_pid,
        threads,
        cpu_ticks: utime + stime,
    })
}

/// Finds `AT_PAGESZ` in a raw auxiliary vector of native-endian word pairs.
pub(crate) fn parse_auxv_page_size(auxv: &[u8]) -> Option<u64> {
    const WORD: usize = std::mem::size_of::<usize>();
    auxv.chunks_exact(2 * WORD).find_map(|pair| {
        let (key, value) = pair.split_at(WORD);
        let key = usize::from_ne_bytes(key.try_into().ok()?);
        let value = usize::from_ne_bytes(value.try_into().ok()?);
        (key == AT_PAGESZ && value > 0).then_some(value as u64)
    })
}

/// Parses `/proc/<pid>/statm` (values in pages of `page_size` bytes).
pub(crate) fn parse_statm(content: &str, page_size: u64) -> Result<ProcessMetrics, String> {
    let pages: Vec<u64> = content
        .split_whitespace()
        .take(3)
        .map(|v| v.parse::<u64>().map_err(|e| format!("invalid page count '{}': {}", v, e)))
        .collect::<Result<_, _>>()?;

    match pages.as_slice() {
        [size, resident, shared] => Ok(ProcessMetrics {
            virtual_bytes: size.saturating_mul(page_size),
            resident_bytes: resident.saturating_mul(page_size),
            shared_bytes: shared.saturating_mul(page_size),
        }),
        _ => Err(format!("expected 3 page counts, found {}", pages.len())),
    }
}
