use crate::options::{ProvisionOptions, ProvisionOutputs};
use crate::store::ensure_dir;
use crate::tools::Provisioner;
use crate::HarnessError;
use std::fs;
use std::path::{Path, PathBuf};

/// Copies the template tree at `template_root` into
/// `<scratch>/stagehand-<unique_id>/<template dir name>` and returns the copy's
/// root. Hidden entries and local state files stay behind so the source tree
/// is never mutated and stale state never leaks into a run.
pub fn copy_template(
    template_root: &Path,
    scratch: &Path,
    unique_id: &str,
) -> Result<PathBuf, HarnessError> {
    if !template_root.is_dir() {
        return Err(HarnessError::TemplateCopyFailed(format!(
            "template directory not found: {}",
            template_root.display()
        )));
    }
    let name = template_root
        .canonicalize()?
        .file_name()
        .map(|s| s.to_os_string())
        .unwrap_or_else(|| "template".into());
    let dest = scratch.join(format!("stagehand-{}", unique_id)).join(name);
    ensure_dir(&dest)?;
    copy_dir_filtered(template_root, &dest)?;
    tracing::info!(
        from = %template_root.display(),
        to = %dest.display(),
        "copied template to scratch"
    );
    Ok(dest)
}

fn excluded(rel: &Path) -> bool {
    rel.components().any(|c| {
        let part = c.as_os_str().to_string_lossy();
        part.starts_with('.') && part != "." && part != ".."
    }) || rel
        .file_name()
        .map(|n| {
            let n = n.to_string_lossy();
            n.ends_with(".tfstate") || n.ends_with(".tfstate.backup")
        })
        .unwrap_or(false)
}

/// Symlinks are followed so the copy is self-contained; a link back into one
/// of its own ancestors is reported instead of walked.
fn copy_dir_filtered(src: &Path, dst: &Path) -> Result<(), HarnessError> {
    let walker = walkdir::WalkDir::new(src)
        .follow_links(true)
        .into_iter()
        .filter_entry(|e| {
            let rel = e.path().strip_prefix(src).unwrap_or(e.path());
            rel.as_os_str().is_empty() || !excluded(rel)
        });
    for entry in walker {
        let entry = entry.map_err(|e| match (e.path(), e.loop_ancestor()) {
            (Some(path), Some(ancestor)) => HarnessError::TemplateCopyFailed(format!(
                "symlink cycle: {} points back to {}",
                path.display(),
                ancestor.display()
            )),
            _ => HarnessError::TemplateCopyFailed(e.to_string()),
        })?;
        let path = entry.path();
        let rel = match path.strip_prefix(src) {
            Ok(rel) if !rel.as_os_str().is_empty() => rel,
            _ => continue,
        };
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            ensure_dir(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                ensure_dir(parent)?;
            }
            fs::copy(path, &target)?;
        }
    }
    Ok(())
}

/// Drives the provisioning tool for one run.
pub struct ResourceLifecycle<'a> {
    provisioner: &'a dyn Provisioner,
}

impl<'a> ResourceLifecycle<'a> {
    pub fn new(provisioner: &'a dyn Provisioner) -> Self {
        Self { provisioner }
    }

    pub fn apply(&self, options: &ProvisionOptions) -> Result<ProvisionOutputs, HarnessError> {
        if !options.module_dir.is_dir() {
            return Err(HarnessError::ProvisionFailed(format!(
                "module directory not found: {}",
                options.module_dir.display()
            )));
        }
        tracing::info!(
            module = %options.module_dir.display(),
            cluster = %options.cluster_name,
            region = %options.region,
            "applying infrastructure"
        );
        let raw = self
            .provisioner
            .apply(options)
            .map_err(|e| HarnessError::ProvisionFailed(e.to_string()))?;
        let outputs = ProvisionOutputs::from_raw(raw, options)?;
        tracing::info!(cluster = %outputs.cluster_name, "infrastructure applied");
        Ok(outputs)
    }

    /// Tears down what `apply` created. Errors surface unchanged; the caller
    /// decides how cleanup reports them.
    pub fn destroy(&self, options: &ProvisionOptions) -> Result<(), HarnessError> {
        tracing::info!(cluster = %options.cluster_name, "destroying infrastructure");
        self.provisioner
            .destroy(options)
            .map_err(|e| HarnessError::ProvisionFailed(format!("destroy: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::temp_root;
    use crate::CommandError;
    use serde_json::{json, Value};
    use std::cell::RefCell;
    use std::collections::BTreeMap;

    #[test]
    fn copy_skips_hidden_entries_and_state_files() {
        let root = temp_root("lifecycle_copy");
        let template = root.join("infra");
        fs::create_dir_all(template.join("gke-basic").join(".terraform")).expect("mkdir");
        fs::write(template.join("gke-basic").join("main.tf"), "module {}").expect("write");
        fs::write(template.join("gke-basic").join("terraform.tfstate"), "{}").expect("write");
        fs::write(template.join("gke-basic").join("x.tfstate.backup"), "{}").expect("write");
        fs::write(template.join("gke-basic").join(".terraform").join("p"), "x").expect("write");
        fs::write(template.join(".env"), "SECRET=1").expect("write");

        let scratch = root.join("scratch");
        let copy = copy_template(&template, &scratch, "abc123").expect("copy");
        assert_eq!(copy, scratch.join("stagehand-abc123").join("infra"));
        assert!(copy.join("gke-basic").join("main.tf").is_file());
        assert!(!copy.join("gke-basic").join("terraform.tfstate").exists());
        assert!(!copy.join("gke-basic").join("x.tfstate.backup").exists());
        assert!(!copy.join("gke-basic").join(".terraform").exists());
        assert!(!copy.join(".env").exists());
        // source untouched
        assert!(template.join("gke-basic").join("terraform.tfstate").exists());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn copy_of_missing_template_fails() {
        let root = temp_root("lifecycle_missing");
        let err = copy_template(&root.join("nope"), &root, "abc123").expect_err("should fail");
        assert!(matches!(err, HarnessError::TemplateCopyFailed(_)));
        let _ = fs::remove_dir_all(root);
    }

    #[cfg(unix)]
    #[test]
    fn copy_materialises_symlinked_modules() {
        let root = temp_root("lifecycle_symlink");
        let shared = root.join("shared");
        fs::create_dir_all(&shared).expect("mkdir");
        fs::write(shared.join("vars.tf"), "variable \"region\" {}").expect("write");
        let template = root.join("infra");
        fs::create_dir_all(template.join("gke-basic")).expect("mkdir");
        std::os::unix::fs::symlink(&shared, template.join("gke-basic").join("shared"))
            .expect("symlink");

        let copy = copy_template(&template, &root.join("scratch"), "abc123").expect("copy");
        let linked = copy.join("gke-basic").join("shared");
        assert!(linked.join("vars.tf").is_file());
        assert!(!fs::symlink_metadata(&linked).expect("meta").file_type().is_symlink());
        let _ = fs::remove_dir_all(root);
    }

    #[cfg(unix)]
    #[test]
    fn copy_rejects_symlink_cycle() {
        let root = temp_root("lifecycle_cycle");
        let template = root.join("infra");
        fs::create_dir_all(template.join("mod")).expect("mkdir");
        fs::write(template.join("mod").join("main.tf"), "module {}").expect("write");
        std::os::unix::fs::symlink(&template, template.join("mod").join("up")).expect("symlink");

        let err = copy_template(&template, &root.join("scratch"), "abc123").expect_err("cycle");
        match err {
            HarnessError::TemplateCopyFailed(message) => {
                assert!(message.contains("symlink cycle"), "{}", message)
            }
            other => panic!("unexpected error: {}", other),
        }
        let _ = fs::remove_dir_all(root);
    }

    struct RecordingProvisioner {
        outputs: BTreeMap<String, Value>,
        calls: RefCell<Vec<String>>,
        fail_destroy: bool,
    }

    impl Provisioner for RecordingProvisioner {
        fn apply(&self, options: &ProvisionOptions) -> Result<BTreeMap<String, Value>, CommandError> {
            self.calls
                .borrow_mut()
                .push(format!("apply {}", options.cluster_name));
            Ok(self.outputs.clone())
        }

        fn destroy(&self, options: &ProvisionOptions) -> Result<(), CommandError> {
            self.calls
                .borrow_mut()
                .push(format!("destroy {}", options.cluster_name));
            if self.fail_destroy {
                return Err(CommandError::Exit {
                    program: "terraform".to_string(),
                    status: "1".to_string(),
                    stderr_tail: "resource already gone".to_string(),
                });
            }
            Ok(())
        }
    }

    fn options(module_dir: PathBuf) -> ProvisionOptions {
        ProvisionOptions {
            module_dir,
            cluster_name: "gke-abc123".to_string(),
            project: "p".to_string(),
            region: "us-east1".to_string(),
            extra_vars: BTreeMap::new(),
            no_color: true,
        }
    }

    #[test]
    fn apply_parses_cluster_identifier() {
        let root = temp_root("lifecycle_apply");
        let provisioner = RecordingProvisioner {
            outputs: BTreeMap::from([("cluster_name".to_string(), json!({"value": "c-123"}))]),
            calls: RefCell::new(Vec::new()),
            fail_destroy: false,
        };
        let lifecycle = ResourceLifecycle::new(&provisioner);
        let out = lifecycle.apply(&options(root.clone())).expect("apply");
        assert_eq!(out.cluster_name, "c-123");
        lifecycle.destroy(&options(root.clone())).expect("destroy");
        assert_eq!(
            *provisioner.calls.borrow(),
            vec!["apply gke-abc123", "destroy gke-abc123"]
        );
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn apply_without_module_dir_never_calls_tool() {
        let root = temp_root("lifecycle_no_module");
        let provisioner = RecordingProvisioner {
            outputs: BTreeMap::new(),
            calls: RefCell::new(Vec::new()),
            fail_destroy: false,
        };
        let err = ResourceLifecycle::new(&provisioner)
            .apply(&options(root.join("gone")))
            .expect_err("should fail");
        assert!(matches!(err, HarnessError::ProvisionFailed(_)));
        assert!(provisioner.calls.borrow().is_empty());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn destroy_failure_is_loud() {
        let provisioner = RecordingProvisioner {
            outputs: BTreeMap::new(),
            calls: RefCell::new(Vec::new()),
            fail_destroy: true,
        };
        let err = ResourceLifecycle::new(&provisioner)
            .destroy(&options(PathBuf::from("/nonexistent")))
            .expect_err("should fail");
        assert!(err.to_string().contains("resource already gone"));
    }
}
