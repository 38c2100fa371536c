use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use veil_core::Pid;
use veil_policy::PolicyAdapter;

use crate::error::{StreamError, StreamResult};
use crate::record::{DirEntry, RecordCursor};
use crate::source::RawDirectory;

/// Smallest record buffer accepted; one maximal `linux_dirent64` is 280 bytes.
pub const MIN_BUFFER_SIZE: usize = 512;

pub const DEFAULT_BUFFER_SIZE: usize = 4096;

// ---------------------------------------------------------------------------
// DirStream: the enumeration contract
// ---------------------------------------------------------------------------

/// Per-handle directory enumeration, as consumed by a filesystem protocol
/// layer. Callers may share one handle across threads.
pub trait DirStream: Send + Sync {
    /// Whether [`next`](Self::next) has something to return: an entry, or
    /// an error it ran into while looking for one. Consumes nothing.
    fn has_next(&self) -> bool;

    /// The next visible entry. `Ok(None)` at end of stream and after close.
    fn next(&self) -> StreamResult<Option<DirEntry>>;

    /// Release the directory descriptor. Idempotent.
    fn close(&self);
}

// ---------------------------------------------------------------------------
// PolicyDirStream
// ---------------------------------------------------------------------------

/// A directory stream that omits every entry the acting process may not
/// read.
///
/// All state sits behind one lock, so `close` can never release the
/// descriptor under a concurrent `next`, and two `next` calls never see
/// the same record.
pub struct PolicyDirStream {
    dir: PathBuf,
    pid: Pid,
    adapter: Arc<PolicyAdapter>,
    state: Mutex<StreamState>,
}

struct StreamState {
    source: Option<Box<dyn RawDirectory>>,
    buf: Vec<u8>,
    filled: usize,
    pos: usize,
    /// Entry found by `has_next` and not yet handed out.
    pending: Option<DirEntry>,
    /// Error found by `has_next`, returned by the next `next`.
    deferred: Option<StreamError>,
}

impl std::fmt::Debug for PolicyDirStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyDirStream")
            .field("dir", &self.dir)
            .field("pid", &self.pid)
            .finish_non_exhaustive()
    }
}

impl PolicyDirStream {
    /// Open `dir` with `getdents64` and read the first batch of records.
    #[cfg(target_os = "linux")]
    pub fn open(
        dir: &Path,
        pid: Pid,
        adapter: Arc<PolicyAdapter>,
        buffer_size: usize,
    ) -> StreamResult<Self> {
        let source =
            crate::source::KernelDirectory::open(dir).map_err(|source| StreamError::Open {
                path: dir.to_path_buf(),
                source,
            })?;
        Self::with_source(dir, Box::new(source), pid, adapter, buffer_size)
    }

    /// Build a stream over any record source. `dir` is where sidecar
    /// policies are looked up.
    pub fn with_source(
        dir: &Path,
        source: Box<dyn RawDirectory>,
        pid: Pid,
        adapter: Arc<PolicyAdapter>,
        buffer_size: usize,
    ) -> StreamResult<Self> {
        let mut state = StreamState {
            source: Some(source),
            buf: vec![0u8; buffer_size.max(MIN_BUFFER_SIZE)],
            filled: 0,
            pos: 0,
            pending: None,
            deferred: None,
        };
        state.refill()?;
        debug!(dir = %dir.display(), pid, bytes = state.filled, "directory stream opened");

        Ok(Self {
            dir: dir.to_path_buf(),
            pid,
            adapter,
            state: Mutex::new(state),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.lock().source.is_none()
    }

    // A panic mid-advance leaves at worst a skipped record; the state
    // itself stays consistent.
    fn lock(&self) -> MutexGuard<'_, StreamState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Step over raw records until one passes policy.
    fn advance(&self, state: &mut StreamState) -> StreamResult<Option<DirEntry>> {
        loop {
            if state.pos >= state.filled && !state.refill()? {
                return Ok(None);
            }

            let mut cursor = RecordCursor::at(&state.buf[..state.filled], state.pos);
            let record = match cursor.next_record() {
                Ok(Some(record)) => record,
                Ok(None) => {
                    state.pos = state.filled;
                    continue;
                }
                Err(e) => {
                    // Nothing past a bad record can be framed; drop the batch.
                    state.pos = state.filled;
                    return Err(e);
                }
            };
            let entry = DirEntry::from(&record);
            state.pos = cursor.position();

            if self.adapter.is_visible(&self.dir, &entry.name, self.pid) {
                return Ok(Some(entry));
            }
        }
    }
}

impl StreamState {
    /// Read the next batch. `Ok(false)` at end of directory or once closed.
    fn refill(&mut self) -> StreamResult<bool> {
        let Some(source) = self.source.as_mut() else {
            return Ok(false);
        };
        let n = source.read_records(&mut self.buf).map_err(StreamError::Read)?;
        self.filled = n.min(self.buf.len());
        self.pos = 0;
        Ok(n > 0)
    }
}

impl DirStream for PolicyDirStream {
    fn has_next(&self) -> bool {
        let mut state = self.lock();
        if state.pending.is_some() || state.deferred.is_some() {
            return true;
        }
        match self.advance(&mut state) {
            Ok(Some(entry)) => {
                state.pending = Some(entry);
                true
            }
            Ok(None) => false,
            Err(e) => {
                state.deferred = Some(e);
                true
            }
        }
    }

    fn next(&self) -> StreamResult<Option<DirEntry>> {
        let mut state = self.lock();
        if let Some(e) = state.deferred.take() {
            return Err(e);
        }
        if let Some(entry) = state.pending.take() {
            return Ok(Some(entry));
        }
        self.advance(&mut state)
    }

    fn close(&self) {
        let mut state = self.lock();
        if state.source.take().is_some() {
            debug!(dir = %self.dir.display(), pid = self.pid, "directory stream closed");
        }
        state.filled = 0;
        state.pos = 0;
        state.pending = None;
        state.deferred = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::encode_record;
    use std::collections::VecDeque;
    use std::ffi::OsString;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::{json, Value};
    use veil_core::{IdentityClaims, IdentityDirectory};
    use veil_policy::{PolicyConfig, PolicyEngine, PolicyResult};

    /// Hands out pre-built batches, then end of directory.
    struct ScriptedDirectory {
        batches: VecDeque<io::Result<Vec<u8>>>,
        reads: Arc<AtomicUsize>,
        drops: Arc<AtomicUsize>,
    }

    impl RawDirectory for ScriptedDirectory {
        fn read_records(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            match self.batches.pop_front() {
                None => Ok(0),
                Some(Err(e)) => Err(e),
                Some(Ok(batch)) => {
                    buf[..batch.len()].copy_from_slice(&batch);
                    Ok(batch.len())
                }
            }
        }
    }

    impl Drop for ScriptedDirectory {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Harness {
        dir: tempfile::TempDir,
        adapter: Arc<PolicyAdapter>,
        reads: Arc<AtomicUsize>,
        drops: Arc<AtomicUsize>,
    }

    // Sidecar documents list the subjects allowed to read.
    fn harness() -> Harness {
        let engine: Arc<dyn PolicyEngine> =
            Arc::new(|source: &str, input: &Value| -> PolicyResult<Value> {
                let sub = input["identity"]["sub"].as_str().unwrap_or("");
                Ok(json!({"R": source.lines().any(|l| l.trim() == sub)}))
            });
        let identities = Arc::new(IdentityDirectory::new());
        identities.put(
            100,
            IdentityClaims {
                sub: Some("alice".into()),
                ..Default::default()
            },
        );
        Harness {
            dir: tempfile::tempdir().unwrap(),
            adapter: Arc::new(PolicyAdapter::new(
                engine,
                identities,
                PolicyConfig::default(),
            )),
            reads: Arc::new(AtomicUsize::new(0)),
            drops: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn batch(names: &[&str]) -> Vec<u8> {
        let mut buf = Vec::new();
        for (i, name) in names.iter().enumerate() {
            let kind = if name.starts_with('.') && name.len() <= 2 {
                libc::DT_DIR
            } else {
                libc::DT_REG
            };
            encode_record(&mut buf, 1000 + i as u64, kind, name);
        }
        buf
    }

    fn open(
        h: &Harness,
        batches: Vec<io::Result<Vec<u8>>>,
        pid: Pid,
    ) -> StreamResult<PolicyDirStream> {
        let source = ScriptedDirectory {
            batches: batches.into(),
            reads: Arc::clone(&h.reads),
            drops: Arc::clone(&h.drops),
        };
        PolicyDirStream::with_source(
            h.dir.path(),
            Box::new(source),
            pid,
            Arc::clone(&h.adapter),
            DEFAULT_BUFFER_SIZE,
        )
    }

    fn drain(stream: &PolicyDirStream) -> Vec<String> {
        let mut names = Vec::new();
        while let Some(entry) = stream.next().unwrap() {
            names.push(entry.name.to_string_lossy().into_owned());
        }
        names
    }

    #[test]
    fn test_lists_everything_without_sidecars() {
        let h = harness();
        let stream = open(&h, vec![Ok(batch(&[".", "..", "a", "b"]))], 100).unwrap();
        assert_eq!(drain(&stream), vec![".", "..", "a", "b"]);
        assert!(stream.next().unwrap().is_none());
    }

    #[test]
    fn test_entries_span_refills() {
        let h = harness();
        let stream = open(
            &h,
            vec![Ok(batch(&[".", ".."])), Ok(batch(&["a"])), Ok(batch(&["b", "c"]))],
            100,
        )
        .unwrap();
        assert_eq!(drain(&stream), vec![".", "..", "a", "b", "c"]);
        // Initial fill, two refills, then the empty read.
        assert_eq!(h.reads.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_denied_entry_is_suppressed() {
        let h = harness();
        std::fs::write(h.dir.path().join(".policy-foo"), "bob\n").unwrap();
        let names = &[".", "..", "foo", ".policy-foo", "bar"];

        let stream = open(&h, vec![Ok(batch(names))], 100).unwrap();
        assert_eq!(drain(&stream), vec![".", "..", "bar"]);
    }

    #[test]
    fn test_permitted_entry_is_listed_with_its_twin() {
        let h = harness();
        std::fs::write(h.dir.path().join(".policy-foo"), "alice\n").unwrap();
        let names = &["foo", ".policy-foo", "bar"];

        let alice = open(&h, vec![Ok(batch(names))], 100).unwrap();
        assert_eq!(drain(&alice), vec!["foo", ".policy-foo", "bar"]);

        // pid 200 is unbound.
        let stranger = open(&h, vec![Ok(batch(names))], 200).unwrap();
        assert_eq!(drain(&stranger), vec!["bar"]);
    }

    #[test]
    fn test_dot_entries_bypass_policy() {
        let h = harness();
        std::fs::write(h.dir.path().join(".policy-."), "nobody\n").unwrap();
        std::fs::write(h.dir.path().join(".policy-.."), "nobody\n").unwrap();
        let stream = open(&h, vec![Ok(batch(&[".", ".."]))], 100).unwrap();
        assert_eq!(drain(&stream), vec![".", ".."]);
    }

    #[test]
    fn test_has_next_does_not_consume() {
        let h = harness();
        let stream = open(&h, vec![Ok(batch(&["a", "b"]))], 100).unwrap();

        assert!(stream.has_next());
        assert!(stream.has_next());
        assert_eq!(stream.next().unwrap().unwrap().name, OsString::from("a"));
        assert!(stream.has_next());
        assert_eq!(stream.next().unwrap().unwrap().name, OsString::from("b"));
        assert!(!stream.has_next());
        assert!(stream.next().unwrap().is_none());
    }

    #[test]
    fn test_has_next_skips_suppressed_records() {
        let h = harness();
        std::fs::write(h.dir.path().join(".policy-hidden"), "bob\n").unwrap();
        let stream = open(&h, vec![Ok(batch(&["hidden", "shown"]))], 100).unwrap();

        assert!(stream.has_next());
        assert_eq!(stream.next().unwrap().unwrap().name, OsString::from("shown"));
        assert!(!stream.has_next());
    }

    #[test]
    fn test_initial_read_failure_fails_open() {
        let h = harness();
        let err = open(&h, vec![Err(io::Error::from_raw_os_error(libc::EACCES))], 100).unwrap_err();
        assert_eq!(err.errno(), libc::EACCES);
        // The source was dropped with the failed stream.
        assert_eq!(h.drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_refill_error_reaches_next() {
        let h = harness();
        let stream = open(
            &h,
            vec![Ok(batch(&["a"])), Err(io::Error::from_raw_os_error(libc::EIO))],
            100,
        )
        .unwrap();
        assert_eq!(stream.next().unwrap().unwrap().name, OsString::from("a"));
        let err = stream.next().unwrap_err();
        assert_eq!(err.errno(), libc::EIO);
        // The failed read is not retried forever: the source is now at its end.
        assert!(stream.next().unwrap().is_none());
    }

    #[test]
    fn test_refill_error_seen_by_has_next_is_deferred() {
        let h = harness();
        let stream = open(
            &h,
            vec![Ok(batch(&["a"])), Err(io::Error::from_raw_os_error(libc::EIO))],
            100,
        )
        .unwrap();
        stream.next().unwrap();
        assert!(stream.has_next());
        assert!(stream.next().is_err());
    }

    #[test]
    fn test_malformed_batch_is_eio() {
        let h = harness();
        let mut bad = batch(&["a"]);
        bad.extend_from_slice(&[0xffu8; 8]);
        let stream = open(&h, vec![Ok(bad), Ok(batch(&["b"]))], 100).unwrap();

        assert_eq!(stream.next().unwrap().unwrap().name, OsString::from("a"));
        assert_eq!(stream.next().unwrap_err().errno(), libc::EIO);
        // The rest of the bad batch is dropped; the next batch still lists.
        assert_eq!(stream.next().unwrap().unwrap().name, OsString::from("b"));
    }

    #[test]
    fn test_close_is_idempotent_and_releases_once() {
        let h = harness();
        let stream = open(&h, vec![Ok(batch(&["a", "b"]))], 100).unwrap();
        assert!(stream.has_next());

        stream.close();
        stream.close();
        assert!(stream.is_closed());
        assert_eq!(h.drops.load(Ordering::SeqCst), 1);
        assert!(!stream.has_next());
        assert!(stream.next().unwrap().is_none());

        drop(stream);
        assert_eq!(h.drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_releases_source() {
        let h = harness();
        let stream = open(&h, vec![Ok(batch(&["a"]))], 100).unwrap();
        drop(stream);
        assert_eq!(h.drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_concurrent_next_hands_out_each_record_once() {
        let h = harness();
        let names: Vec<String> = (0..200).map(|i| format!("f{:03}", i)).collect();
        let batches: Vec<io::Result<Vec<u8>>> = names
            .chunks(20)
            .map(|chunk| {
                let refs: Vec<&str> = chunk.iter().map(String::as_str).collect();
                Ok(batch(&refs))
            })
            .collect();
        let stream = Arc::new(open(&h, batches, 100).unwrap());

        let mut handles = Vec::new();
        for _ in 0..4 {
            let stream = Arc::clone(&stream);
            handles.push(std::thread::spawn(move || {
                let mut seen = Vec::new();
                while let Some(entry) = stream.next().unwrap() {
                    seen.push(entry.name.to_string_lossy().into_owned());
                }
                seen
            }));
        }
        let closer = Arc::clone(&stream);
        let mut all: Vec<String> = handles
            .into_iter()
            .flat_map(|handle| handle.join().unwrap())
            .collect();
        closer.close();

        all.sort();
        assert_eq!(all, names);
        assert_eq!(h.drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_close_during_concurrent_next() {
        let h = harness();
        let names: Vec<String> = (0..2000).map(|i| format!("f{:04}", i)).collect();
        let batches: Vec<io::Result<Vec<u8>>> = names
            .chunks(20)
            .map(|chunk| {
                let refs: Vec<&str> = chunk.iter().map(String::as_str).collect();
                Ok(batch(&refs))
            })
            .collect();
        let stream = Arc::new(open(&h, batches, 100).unwrap());
        let handed_out = Arc::new(AtomicUsize::new(0));

        let mut readers = Vec::new();
        for _ in 0..4 {
            let stream = Arc::clone(&stream);
            let handed_out = Arc::clone(&handed_out);
            readers.push(std::thread::spawn(move || {
                let mut seen = Vec::new();
                loop {
                    match stream.next() {
                        Ok(Some(entry)) => {
                            handed_out.fetch_add(1, Ordering::SeqCst);
                            seen.push(entry.name.to_string_lossy().into_owned());
                        }
                        Ok(None) => return Ok(seen),
                        Err(e) => return Err(e.to_string()),
                    }
                }
            }));
        }

        let closer = {
            let stream = Arc::clone(&stream);
            let handed_out = Arc::clone(&handed_out);
            std::thread::spawn(move || {
                while handed_out.load(Ordering::SeqCst) < 10 {
                    std::thread::yield_now();
                }
                stream.close();
                stream.close();
            })
        };

        closer.join().unwrap();
        let mut all = Vec::new();
        for reader in readers {
            all.extend(reader.join().unwrap().expect("next failed around close"));
        }

        // Released exactly once, and nothing after the close is handed out.
        assert_eq!(h.drops.load(Ordering::SeqCst), 1);
        assert!(stream.is_closed());
        assert!(stream.next().unwrap().is_none());

        let total = all.len();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), total, "a record was handed out twice");
        assert!(total >= 10 && total <= names.len());
        assert!(all.iter().all(|name| names.contains(name)));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_open_real_directory() {
        let h = harness();
        std::fs::write(h.dir.path().join("visible"), "v").unwrap();
        std::fs::write(h.dir.path().join("secret"), "s").unwrap();
        std::fs::write(h.dir.path().join(".policy-secret"), "bob\n").unwrap();

        let stream = PolicyDirStream::open(
            h.dir.path(),
            100,
            Arc::clone(&h.adapter),
            MIN_BUFFER_SIZE,
        )
        .unwrap();
        let mut names = drain(&stream);
        names.sort();
        assert_eq!(names, vec![".", "..", "visible"]);
        stream.close();
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_open_non_directory_maps_errno() {
        let h = harness();
        let file = h.dir.path().join("plain");
        std::fs::write(&file, "x").unwrap();
        let err = PolicyDirStream::open(&file, 100, Arc::clone(&h.adapter), DEFAULT_BUFFER_SIZE)
            .unwrap_err();
        assert_eq!(err.errno(), libc::ENOTDIR);
    }
}
