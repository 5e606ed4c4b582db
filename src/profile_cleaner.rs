// Profile-directory hygiene: clears stale Chrome singleton locks and
// repairs a crashed exit state before each launch. Every deletion is
// best-effort: a failure is logged and does not abort the rest of the
// cleanup.
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};

pub struct ProfileCleaner;

impl ProfileCleaner {
    /// Run every hygiene step against `profile_dir`. Invoked before
    /// each launch that owns the profile directory.
    pub fn clean(profile_dir: &Path) {
        Self::remove_singleton_files(profile_dir);
        Self::remove_tmp_chrome_singletons();
        Self::remove_lockfile(profile_dir);
        Self::remove_subtree(&profile_dir.join("Extensions"));
        Self::remove_subtree(&profile_dir.join("GPUCache"));
        Self::fix_preferences(&profile_dir.join("Default").join("Preferences"));
    }

    fn remove_singleton_files(profile_dir: &Path) {
        let Ok(entries) = fs::read_dir(profile_dir) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with("Singleton"))
                .unwrap_or(false)
            {
                if let Err(e) = fs::remove_file(&path) {
                    log::warn!("failed to remove {}: {e}", path.display());
                } else {
                    log::debug!("removed {}", path.display());
                }
            }
        }
    }

    /// Host-side stale locks under `/tmp/.com.google.Chrome*/Singleton*`
    /// left behind by a prior session.
    fn remove_tmp_chrome_singletons() {
        let Ok(entries) = fs::read_dir("/tmp") else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let is_chrome_tmp = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with(".com.google.Chrome"))
                .unwrap_or(false);
            if !is_chrome_tmp || !path.is_dir() {
                continue;
            }
            let Ok(inner) = fs::read_dir(&path) else {
                continue;
            };
            for inner_entry in inner.flatten() {
                let inner_path = inner_entry.path();
                if inner_path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with("Singleton"))
                    .unwrap_or(false)
                {
                    if let Err(e) = fs::remove_file(&inner_path) {
                        log::warn!("failed to remove {}: {e}", inner_path.display());
                    } else {
                        log::debug!("removed {}", inner_path.display());
                    }
                }
            }
        }
    }

    fn remove_lockfile(profile_dir: &Path) {
        let lockfile = profile_dir.join("lockfile");
        if lockfile.exists() {
            if let Err(e) = fs::remove_file(&lockfile) {
                log::warn!("failed to remove {}: {e}", lockfile.display());
            }
        }
    }

    fn remove_subtree(path: &PathBuf) {
        if path.exists() {
            if let Err(e) = fs::remove_dir_all(path) {
                log::warn!("failed to remove {}: {e}", path.display());
            } else {
                log::debug!("removed {}", path.display());
            }
        }
    }

    /// Ensure `profile.exit_type = "Normal"` and
    /// `profile.exited_cleanly = true` in Chrome's `Preferences` file
    /// so the next launch does not show a "Restore pages?" prompt.
    /// Rewrites only if a field actually changed; malformed JSON is
    /// logged and left alone.
    fn fix_preferences(prefs_path: &Path) {
        if !prefs_path.exists() {
            return;
        }
        let content = match fs::read_to_string(prefs_path) {
            Ok(c) => c,
            Err(e) => {
                log::warn!("failed to read {}: {e}", prefs_path.display());
                return;
            }
        };
        let mut prefs: Value = match serde_json::from_str(&content) {
            Ok(v) => v,
            Err(e) => {
                log::warn!("failed to parse {}: {e}", prefs_path.display());
                return;
            }
        };

        let Some(obj) = prefs.as_object_mut() else {
            log::warn!("{} is not a JSON object, leaving alone", prefs_path.display());
            return;
        };
        let profile = obj
            .entry("profile")
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
        let Some(profile_obj) = profile.as_object_mut() else {
            log::warn!("{}: 'profile' is not an object, leaving alone", prefs_path.display());
            return;
        };

        let mut modified = false;
        if profile_obj.get("exit_type").and_then(Value::as_str) != Some("Normal") {
            profile_obj.insert("exit_type".into(), Value::String("Normal".into()));
            modified = true;
        }
        if profile_obj.get("exited_cleanly").and_then(Value::as_bool) != Some(true) {
            profile_obj.insert("exited_cleanly".into(), Value::Bool(true));
            modified = true;
        }

        if modified {
            match serde_json::to_string_pretty(&prefs) {
                Ok(rendered) => {
                    if let Err(e) = fs::write(prefs_path, rendered) {
                        log::warn!("failed to rewrite {}: {e}", prefs_path.display());
                    } else {
                        log::debug!("fixed chrome exit state in {}", prefs_path.display());
                    }
                }
                Err(e) => log::warn!("failed to serialize {}: {e}", prefs_path.display()),
            }
        }
    }
}
