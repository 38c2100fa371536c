//! Sidecar policy lookup and evaluation for single directory entries.

use std::ffi::{OsStr, OsString};
use std::fs::File;
use std::io::Read;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;

use serde_json::{json, Value};
use tracing::{debug, warn};

use veil_core::{IdentityDirectory, Pid};

use crate::engine::PolicyEngine;
use crate::error::PolicyError;
use crate::types::{Decision, MissingPolicy, Operation, PolicyConfig};

/// Decides, per entry and per acting process, whether an entry may be
/// read (and so listed) or written.
///
/// For an entry `N` in directory `D` the policy document is
/// `D/<prefix>N`. An entry that already carries the prefix is its own
/// document, so whoever may not read `N` does not see `N`'s policy either.
#[derive(Clone)]
pub struct PolicyAdapter {
    engine: Arc<dyn PolicyEngine>,
    identities: Arc<IdentityDirectory>,
    config: PolicyConfig,
}

impl std::fmt::Debug for PolicyAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyAdapter")
            .field("config", &self.config)
            .field("bound_identities", &self.identities.len())
            .finish_non_exhaustive()
    }
}

impl PolicyAdapter {
    pub fn new(
        engine: Arc<dyn PolicyEngine>,
        identities: Arc<IdentityDirectory>,
        config: PolicyConfig,
    ) -> Self {
        Self {
            engine,
            identities,
            config,
        }
    }

    pub fn identities(&self) -> &Arc<IdentityDirectory> {
        &self.identities
    }

    /// True when `name` is itself a sidecar document.
    pub fn is_sidecar(&self, name: &OsStr) -> bool {
        name.as_bytes()
            .starts_with(self.config.sidecar_prefix.as_bytes())
    }

    /// Path of the document governing entry `name` in `dir`.
    pub fn sidecar_path(&self, dir: &Path, name: &OsStr) -> PathBuf {
        if self.is_sidecar(name) {
            return dir.join(name);
        }
        let mut sidecar = OsString::from(&self.config.sidecar_prefix);
        sidecar.push(name);
        dir.join(sidecar)
    }

    /// Evaluate `op` on entry `name` of `dir` for process `pid`.
    pub fn decide(&self, dir: &Path, name: &OsStr, pid: Pid, op: Operation) -> Decision {
        let sidecar = self.sidecar_path(dir, name);

        let mut file = match File::open(&sidecar) {
            Ok(file) => file,
            Err(e) => {
                debug!(path = %sidecar.display(), error = %e, "no policy document");
                return Decision::NoPolicy;
            }
        };
        let mut source = String::new();
        if let Err(source_err) = file.read_to_string(&mut source) {
            let err = PolicyError::SidecarUnreadable {
                path: sidecar,
                source: source_err,
            };
            return Decision::Undecided(err.to_string());
        }

        let input = self.input_document(dir, name, pid, op);
        let decision_doc = match self.evaluate_bounded(source, input) {
            Ok(doc) => doc,
            Err(reason) => return Decision::Undecided(reason),
        };

        let field = self.config.field_for(op);
        match decision_doc.get(field).and_then(Value::as_bool) {
            Some(true) => Decision::Permit,
            Some(false) => Decision::Deny,
            None => Decision::Undecided(
                PolicyError::MalformedDecision(format!(
                    "field '{}' missing or not a boolean",
                    field
                ))
                .to_string(),
            ),
        }
    }

    /// Whether entry `name` of `dir` is listed for `pid`.
    ///
    /// `.` and `..` are always listed. Deny and undecided hide the entry;
    /// an entry with no policy document follows `missing_policy`.
    pub fn is_visible(&self, dir: &Path, name: &OsStr, pid: Pid) -> bool {
        if name == "." || name == ".." {
            return true;
        }
        match self.decide(dir, name, pid, Operation::Read) {
            Decision::Permit => true,
            Decision::NoPolicy => self.config.missing_policy == MissingPolicy::Show,
            Decision::Deny => {
                debug!(dir = %dir.display(), name = ?name, pid, "entry hidden by policy");
                false
            }
            Decision::Undecided(reason) => {
                warn!(
                    dir = %dir.display(),
                    name = ?name,
                    pid,
                    reason = %reason,
                    "policy evaluation failed; entry hidden"
                );
                false
            }
        }
    }

    /// The document handed to the engine as `input`.
    pub fn input_document(&self, dir: &Path, name: &OsStr, pid: Pid, op: Operation) -> Value {
        let identity = self
            .identities
            .get(pid)
            .and_then(|claims| claims.to_value().ok())
            .unwrap_or(Value::Null);
        json!({
            "operation": op.as_str(),
            "path": dir.join(name).to_string_lossy(),
            "name": name.to_string_lossy(),
            "pid": pid,
            "identity": identity,
        })
    }

    // A late answer is dropped with the channel. Engines that spawn work
    // must bound it themselves, as CommandEngine does with its deadline.
    fn evaluate_bounded(&self, source: String, input: Value) -> Result<Value, String> {
        let (tx, rx) = mpsc::channel();
        let engine = Arc::clone(&self.engine);
        thread::Builder::new()
            .name("veil-policy-eval".into())
            .spawn(move || {
                let _ = tx.send(engine.evaluate(&source, &input));
            })
            .map_err(|e| format!("failed to start evaluation: {}", e))?;

        match rx.recv_timeout(self.config.timeout()) {
            Ok(Ok(doc)) => Ok(doc),
            Ok(Err(e)) => Err(e.to_string()),
            Err(RecvTimeoutError::Timeout) => Err(format!(
                "evaluation timed out after {} ms",
                self.config.evaluation_timeout_ms
            )),
            Err(RecvTimeoutError::Disconnected) => Err("policy engine panicked".into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PolicyResult;
    use std::fs;
    use std::time::Duration;
    use veil_core::IdentityClaims;

    // Policy "language" for tests: the document names the subjects allowed to
    // read, one per line; `*` allows everyone, `!` is a broken document.
    fn list_engine() -> Arc<dyn PolicyEngine> {
        Arc::new(|source: &str, input: &Value| -> PolicyResult<Value> {
            if source.trim() == "!" {
                return Err(PolicyError::EngineFailed("syntax error".into()));
            }
            let sub = input["identity"]["sub"].as_str().unwrap_or("");
            let allowed = source.lines().any(|l| l.trim() == "*" || l.trim() == sub);
            Ok(json!({"R": allowed, "W": false}))
        })
    }

    fn adapter_with(engine: Arc<dyn PolicyEngine>, config: PolicyConfig) -> PolicyAdapter {
        PolicyAdapter::new(engine, Arc::new(IdentityDirectory::new()), config)
    }

    fn bind(adapter: &PolicyAdapter, pid: Pid, sub: &str) {
        adapter.identities().put(
            pid,
            IdentityClaims {
                sub: Some(sub.into()),
                ..Default::default()
            },
        );
    }

    fn os(s: &str) -> &OsStr {
        OsStr::new(s)
    }

    #[test]
    fn test_sidecar_path_for_plain_and_twin() {
        let adapter = adapter_with(list_engine(), PolicyConfig::default());
        let dir = Path::new("/srv/data");
        assert_eq!(
            adapter.sidecar_path(dir, os("report.txt")),
            PathBuf::from("/srv/data/.policy-report.txt")
        );
        assert_eq!(
            adapter.sidecar_path(dir, os(".policy-report.txt")),
            PathBuf::from("/srv/data/.policy-report.txt")
        );
        assert!(adapter.is_sidecar(os(".policy-x")));
        assert!(!adapter.is_sidecar(os("x")));
    }

    #[test]
    fn test_no_sidecar_is_shown_by_default() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("bar"), "data").unwrap();
        let adapter = adapter_with(list_engine(), PolicyConfig::default());

        assert_eq!(
            adapter.decide(dir.path(), os("bar"), 1, Operation::Read),
            Decision::NoPolicy
        );
        assert!(adapter.is_visible(dir.path(), os("bar"), 1));
    }

    #[test]
    fn test_missing_policy_hide() {
        let dir = tempfile::tempdir().unwrap();
        let config = PolicyConfig {
            missing_policy: MissingPolicy::Hide,
            ..Default::default()
        };
        let adapter = adapter_with(list_engine(), config);
        assert!(!adapter.is_visible(dir.path(), os("bar"), 1));
        assert!(adapter.is_visible(dir.path(), os("."), 1));
    }

    #[test]
    fn test_permit_and_deny_follow_identity() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(".policy-foo"), "alice\n").unwrap();
        let adapter = adapter_with(list_engine(), PolicyConfig::default());
        bind(&adapter, 10, "alice");
        bind(&adapter, 11, "bob");

        assert_eq!(
            adapter.decide(dir.path(), os("foo"), 10, Operation::Read),
            Decision::Permit
        );
        assert_eq!(
            adapter.decide(dir.path(), os("foo"), 11, Operation::Read),
            Decision::Deny
        );
        assert!(adapter.is_visible(dir.path(), os("foo"), 10));
        assert!(!adapter.is_visible(dir.path(), os("foo"), 11));
        // Unbound pid: absent identity.
        assert!(!adapter.is_visible(dir.path(), os("foo"), 12));
    }

    #[test]
    fn test_twin_is_gated_by_its_own_document() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(".policy-foo"), "alice\n").unwrap();
        let adapter = adapter_with(list_engine(), PolicyConfig::default());
        bind(&adapter, 10, "alice");
        bind(&adapter, 11, "bob");

        assert!(adapter.is_visible(dir.path(), os(".policy-foo"), 10));
        assert!(!adapter.is_visible(dir.path(), os(".policy-foo"), 11));
    }

    #[test]
    fn test_engine_error_hides_entry() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(".policy-foo"), "!").unwrap();
        let adapter = adapter_with(list_engine(), PolicyConfig::default());
        bind(&adapter, 10, "alice");

        assert!(matches!(
            adapter.decide(dir.path(), os("foo"), 10, Operation::Read),
            Decision::Undecided(_)
        ));
        assert!(!adapter.is_visible(dir.path(), os("foo"), 10));
    }

    #[test]
    fn test_missing_or_mistyped_field_is_undecided() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(".policy-foo"), "anything").unwrap();
        let engine: Arc<dyn PolicyEngine> =
            Arc::new(|_: &str, _: &Value| -> PolicyResult<Value> { Ok(json!({"R": "yes"})) });
        let adapter = adapter_with(engine, PolicyConfig::default());

        match adapter.decide(dir.path(), os("foo"), 1, Operation::Read) {
            Decision::Undecided(reason) => assert!(reason.contains("'R'")),
            other => panic!("unexpected decision: {other}"),
        }
        // Write is looked up under its own field, which is absent.
        assert!(matches!(
            adapter.decide(dir.path(), os("foo"), 1, Operation::Write),
            Decision::Undecided(_)
        ));
    }

    #[test]
    fn test_write_uses_write_field() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(".policy-foo"), "*").unwrap();
        let adapter = adapter_with(list_engine(), PolicyConfig::default());
        assert_eq!(
            adapter.decide(dir.path(), os("foo"), 1, Operation::Read),
            Decision::Permit
        );
        assert_eq!(
            adapter.decide(dir.path(), os("foo"), 1, Operation::Write),
            Decision::Deny
        );
    }

    #[test]
    fn test_slow_engine_times_out_as_undecided() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(".policy-foo"), "*").unwrap();
        let engine: Arc<dyn PolicyEngine> = Arc::new(|_: &str, _: &Value| -> PolicyResult<Value> {
            thread::sleep(Duration::from_millis(500));
            Ok(json!({"R": true}))
        });
        let config = PolicyConfig {
            evaluation_timeout_ms: 20,
            ..Default::default()
        };
        let adapter = adapter_with(engine, config);

        match adapter.decide(dir.path(), os("foo"), 1, Operation::Read) {
            Decision::Undecided(reason) => assert!(reason.contains("timed out")),
            other => panic!("unexpected decision: {other}"),
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_timed_out_command_engine_leaves_no_child() {
        use crate::engine::tests::{engine_pid, hanging_engine};
        use crate::engine::CommandEngine;
        use std::time::Instant;

        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(".policy-foo"), "package policy").unwrap();
        let (engine_config, pid_file) = hanging_engine(dir.path());
        let config = PolicyConfig {
            evaluation_timeout_ms: 200,
            ..Default::default()
        };
        let engine = CommandEngine::new(engine_config).with_deadline(config.timeout());
        let adapter = adapter_with(Arc::new(engine), config);

        let decision = adapter.decide(dir.path(), os("foo"), 1, Operation::Read);
        assert!(matches!(decision, Decision::Undecided(_)));

        // The engine kills on the same deadline the adapter waits for;
        // allow it a moment to finish reaping.
        let pid = engine_pid(&pid_file);
        let proc_entry = PathBuf::from(format!("/proc/{}", pid));
        let give_up = Instant::now() + Duration::from_secs(2);
        while proc_entry.exists() && Instant::now() < give_up {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(!proc_entry.exists(), "engine pid {} still alive", pid);
    }

    #[test]
    fn test_panicking_engine_is_undecided() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(".policy-foo"), "*").unwrap();
        let engine: Arc<dyn PolicyEngine> =
            Arc::new(|_: &str, _: &Value| -> PolicyResult<Value> { panic!("engine bug") });
        let adapter = adapter_with(engine, PolicyConfig::default());
        assert!(!adapter.is_visible(dir.path(), os("foo"), 1));
    }

    #[test]
    fn test_input_document_shape() {
        let adapter = adapter_with(list_engine(), PolicyConfig::default());
        bind(&adapter, 42, "alice");
        let dir = Path::new("/srv");

        let bound = adapter.input_document(dir, os("foo"), 42, Operation::Read);
        assert_eq!(bound["operation"], "read");
        assert_eq!(bound["path"], "/srv/foo");
        assert_eq!(bound["name"], "foo");
        assert_eq!(bound["pid"], 42);
        assert_eq!(bound["identity"]["sub"], "alice");

        let unbound = adapter.input_document(dir, os("foo"), 43, Operation::Write);
        assert_eq!(unbound["operation"], "write");
        assert!(unbound["identity"].is_null());
    }

    #[test]
    fn test_rebinding_changes_later_decisions() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(".policy-foo"), "alice\n").unwrap();
        let adapter = adapter_with(list_engine(), PolicyConfig::default());

        bind(&adapter, 7, "bob");
        assert!(!adapter.is_visible(dir.path(), os("foo"), 7));
        bind(&adapter, 7, "alice");
        assert!(adapter.is_visible(dir.path(), os("foo"), 7));
    }
}
